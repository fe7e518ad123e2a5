//! Read-modify-write recognition for indirect stores: tagging
//! `STORE_IND(p, op(IND(p), r))` so the emitter produces `op [p], r` in one
//! instruction. The result is cached in the store's [`RmwStatus`] field; an
//! unsupported shape is a status, not an error, and leaves a plain store.

use crate::contain::{self, EffectsAcc};
use crate::types::lir::{
  Binop, BlockId, Function, Kind, NodeFlags, NodeId, RmwStatus, Unop,
};

/// Analyze `store` (a [`Kind::StoreInd`]) and cache the result. On a hit the
/// whole inner tree is contained; later containment passes must leave it alone.
pub(crate) fn analyze_store(
  f: &mut Function, acc: &mut EffectsAcc, bl: BlockId, store: NodeId,
) -> RmwStatus {
  let Kind::StoreInd { addr, val, rmw } = f.nodes[store].kind else {
    panic!("store-indir expected")
  };
  if rmw.is_resolved() { return rmw }
  let status = recognize(f, acc, bl, store, addr, val);
  if let Kind::StoreInd { rmw, .. } = &mut f.nodes[store].kind { *rmw = status }
  if status.is_rmw() { contain_rmw_tree(f, val) }
  status
}

fn recognize(
  f: &mut Function, acc: &mut EffectsAcc, bl: BlockId,
  store: NodeId, dst_addr: NodeId, src: NodeId,
) -> RmwStatus {
  if f.nodes[store].ty.is_float() { return RmwStatus::UnsupportedType }
  if !f.has_single_use(bl, src, store) { return RmwStatus::UnsupportedOper }
  match f.nodes[src].kind {
    Kind::Unop(Unop::Not | Unop::Neg, op1) =>
      check_indir(f, acc, bl, store, dst_addr, src, op1, RmwStatus::Op1),
    Kind::Binop(op, op1, op2) => {
      if f.nodes[src].flags.contains(NodeFlags::OVF) { return RmwStatus::UnsupportedOper }
      match op {
        Binop::Add | Binop::Sub | Binop::And | Binop::Or | Binop::Xor => {}
        Binop::Shl | Binop::Shr | Binop::Sar | Binop::Rol | Binop::Ror => {
          // the memory form shifts the stored width directly, losing the
          // sign/zero extension a sub-32-bit shift in a register would get
          if f.nodes[store].ty.size().is_some_and(|n| n < 4) {
            return RmwStatus::UnsupportedType
          }
          // the count is never the memory side
          return check_indir(f, acc, bl, store, dst_addr, src, op1, RmwStatus::Op1)
        }
        _ => return RmwStatus::UnsupportedOper,
      }
      let st = check_indir(f, acc, bl, store, dst_addr, src, op1, RmwStatus::Op1);
      if st != RmwStatus::UnsupportedAddr { return st }
      if op.commutative() {
        check_indir(f, acc, bl, store, dst_addr, src, op2, RmwStatus::Op2)
      } else {
        RmwStatus::UnsupportedAddr
      }
    }
    _ => RmwStatus::UnsupportedOper,
  }
}

/// Check that `candidate` is `IND(addr2)` with `addr2` the same address
/// expression as `dst_addr`, invariant up to the store.
fn check_indir(
  f: &mut Function, acc: &mut EffectsAcc, bl: BlockId,
  store: NodeId, dst_addr: NodeId, src: NodeId, candidate: NodeId, ok: RmwStatus,
) -> RmwStatus {
  let Kind::Ind(addr2) = f.nodes[candidate].kind else { return RmwStatus::UnsupportedAddr };
  if f.nodes[candidate].ty != f.nodes[store].ty { return RmwStatus::UnsupportedType }
  if !addrs_equal(f, dst_addr, addr2) { return RmwStatus::UnsupportedAddr }
  if !f.has_single_use(bl, candidate, src) { return RmwStatus::UnsupportedAddr }
  if !contain::is_safe_to_contain_mem(f, acc, candidate, store, None) {
    return RmwStatus::UnsupportedAddr
  }
  ok
}

/// Structural equality of two pure address expressions.
pub(crate) fn addrs_equal(f: &Function, a: NodeId, b: NodeId) -> bool {
  if a == b { return true }
  match (&f.nodes[a].kind, &f.nodes[b].kind) {
    (&Kind::LclVar(x), &Kind::LclVar(y)) => x == y,
    (&Kind::LclAddr(x, xo), &Kind::LclAddr(y, yo)) => x == y && xo == yo,
    (&Kind::IntCon(x), &Kind::IntCon(y)) =>
      x == y && f.nodes[a].flags == f.nodes[b].flags,
    (&Kind::Unop(xop, x), &Kind::Unop(yop, y)) => xop == yop && addrs_equal(f, x, y),
    (&Kind::Binop(xop, x1, x2), &Kind::Binop(yop, y1, y2)) =>
      xop == yop && addrs_equal(f, x1, y1) && addrs_equal(f, x2, y2),
    (&Kind::Lea { base: xb, index: xi, scale: xs, disp: xd },
     &Kind::Lea { base: yb, index: yi, scale: ys, disp: yd }) =>
      xs == ys && xd == yd &&
      opt_addrs_equal(f, xb.get(), yb.get()) && opt_addrs_equal(f, xi.get(), yi.get()),
    _ => false,
  }
}

fn opt_addrs_equal(f: &Function, a: Option<NodeId>, b: Option<NodeId>) -> bool {
  match (a, b) {
    (None, None) => true,
    (Some(a), Some(b)) => addrs_equal(f, a, b),
    _ => false,
  }
}

/// Contain the recognized tree: the source operator, the indirection, and the
/// indirection's whole address subtree (the emitter addresses through the
/// store's own operand).
fn contain_rmw_tree(f: &mut Function, src: NodeId) {
  f.nodes[src].make_contained();
  let mut ops = smallvec::SmallVec::<[NodeId; 4]>::new();
  f.nodes[src].kind.for_each_operand(|a| ops.push(a));
  for n in ops {
    match f.nodes[n].kind {
      Kind::Ind(addr) => {
        f.nodes[n].make_contained();
        contain_whole(f, addr);
      }
      // the register/immediate side: contain only a fitting immediate
      _ => { contain::try_contain_imm(f, n); }
    }
  }
}

fn contain_whole(f: &mut Function, n: NodeId) {
  f.nodes[n].make_contained();
  let mut ops = smallvec::SmallVec::<[NodeId; 4]>::new();
  f.nodes[n].kind.for_each_operand(|a| ops.push(a));
  for a in ops { contain_whole(f, a) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use super::*;
  use crate::types::{BaseTy, Ty};
  use crate::types::layout::Local;

  fn scalar_store(op: Binop, swap: bool) -> (Function, crate::types::lir::BlockId, NodeId) {
    let mut f = Function::new();
    let bl = f.new_block();
    let p = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let r = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I32), 4));
    let a1 = f.lcl_var(p);
    let load = f.ind(Ty::Scalar(BaseTy::I32), a1);
    let rv = f.lcl_var(r);
    let (x, y) = if swap { (rv, load) } else { (load, rv) };
    let bin = f.binop(op, Ty::Scalar(BaseTy::I32), x, y);
    let a2 = f.lcl_var(p);
    let store = f.store_ind(a2, bin);
    f.nodes[store].ty = Ty::Scalar(BaseTy::I32);
    for n in [a1, load, rv, bin, a2, store] { f.append(bl, n) }
    (f, bl, store)
  }

  #[test]
  fn add_dst_is_op1() {
    let (mut f, bl, store) = scalar_store(Binop::Add, false);
    let mut acc = EffectsAcc::default();
    assert_eq!(analyze_store(&mut f, &mut acc, bl, store), RmwStatus::Op1);
    // the whole inner tree is contained
    let Kind::StoreInd { val, rmw, .. } = f.nodes[store].kind else { panic!() };
    assert_eq!(rmw, RmwStatus::Op1);
    assert!(f.nodes[val].contained());
    let Kind::Binop(_, load, _) = f.nodes[val].kind else { panic!() };
    assert!(f.nodes[load].contained());
    // a second query returns the cache
    assert_eq!(analyze_store(&mut f, &mut acc, bl, store), RmwStatus::Op1);
  }

  #[test]
  fn commutative_dst_is_op2() {
    let (mut f, bl, store) = scalar_store(Binop::Xor, true);
    let mut acc = EffectsAcc::default();
    assert_eq!(analyze_store(&mut f, &mut acc, bl, store), RmwStatus::Op2);
  }

  #[test]
  fn sub_rhs_memory_rejected() {
    let (mut f, bl, store) = scalar_store(Binop::Sub, true);
    let mut acc = EffectsAcc::default();
    assert_eq!(analyze_store(&mut f, &mut acc, bl, store), RmwStatus::UnsupportedAddr);
  }

  #[test]
  fn small_shift_rejected() {
    let mut f = Function::new();
    let bl = f.new_block();
    let p = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let a1 = f.lcl_var(p);
    let load = f.ind(Ty::Scalar(BaseTy::U16), a1);
    let one = f.icon(BaseTy::I32, 1);
    let shl = f.binop(Binop::Shl, Ty::Scalar(BaseTy::U16), load, one);
    let a2 = f.lcl_var(p);
    let store = f.store_ind(a2, shl);
    f.nodes[store].ty = Ty::Scalar(BaseTy::U16);
    for n in [a1, load, one, shl, a2, store] { f.append(bl, n) }
    let mut acc = EffectsAcc::default();
    assert_eq!(analyze_store(&mut f, &mut acc, bl, store), RmwStatus::UnsupportedType);
  }

  #[test]
  fn mul_rejected() {
    let (mut f, bl, store) = scalar_store(Binop::Mul, false);
    let mut acc = EffectsAcc::default();
    assert_eq!(analyze_store(&mut f, &mut acc, bl, store), RmwStatus::UnsupportedOper);
  }
}
