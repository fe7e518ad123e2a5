//! Scalar lowering: stores, integer strength reduction, shifts, compares,
//! flag reuse, and the BMI peepholes.

use super::Lowering;
use crate::addr;
use crate::contain::{self, flags_safe_between};
use crate::hwi::Hwi;
use crate::isa::IsaFlags;
use crate::rmw;
use crate::types::lir::{Binop, Kind, NodeFlags, NodeId, Unop};
use crate::types::{BaseTy, Ty, CC};

impl Lowering<'_> {
  // -- stores --------------------------------------------------------------

  pub(super) fn lower_store_lcl(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::StoreLcl(lcl, val) = self.f.nodes[n].kind else { unreachable!() };
    // small stack slots are 4 bytes wide; widen a 2-byte constant store so the
    // emitter uses a plain 32-bit mov
    if_chain! {
      if self.f.nodes[n].ty.size() == Some(2);
      if let Some(v) = self.f.nodes[val].icon_value();
      if self.f.locals[lcl].layout.is_none();
      then {
        let wide = if self.f.nodes[n].ty.scalar().is_signed() { BaseTy::I32 } else { BaseTy::U32 };
        self.f.nodes[n].ty = Ty::Scalar(wide);
        self.f.nodes[val].ty = Ty::Scalar(wide);
        // keep only the low 16 bits of the widened immediate
        self.f.nodes[val].kind = Kind::IntCon(v & 0xffff);
      }
    }
    contain::try_contain_imm(self.f, val);
    self.store_value_containment(n, val);
    self.f.next(n)
  }

  pub(super) fn lower_store_lcl_fld(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::StoreLclFld(lcl, _, val) = self.f.nodes[n].kind else { unreachable!() };
    self.f.locals[lcl].set_do_not_enregister();
    contain::try_contain_imm(self.f, val);
    self.store_value_containment(n, val);
    self.f.next(n)
  }

  pub(super) fn lower_store_ind(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::StoreInd { val, .. } = self.f.nodes[n].kind else { unreachable!() };

    if self.opts() {
      let status = rmw::analyze_store(self.f, &mut self.acc, self.bl, n);
      if status.is_rmw() {
        // the inner tree is contained; only the address mode remains to build
        self.fold_store_address(n);
        return self.f.next(n)
      }
    }

    // a byte store of a compare result needs no zero extension: the setcc
    // already wrote the full byte
    if_chain! {
      if self.f.nodes[n].ty.size() == Some(1);
      if matches!(self.f.nodes[val].kind, Kind::Setcc(_));
      if self.f.has_single_use(self.bl, val, n);
      then { self.f.nodes[val].ty = Ty::Scalar(BaseTy::U8) }
    }

    // store side of MOVBE
    if_chain! {
      if self.isa.has(IsaFlags::MOVBE);
      if let Kind::Unop(Unop::Bswap, _) = self.f.nodes[val].kind;
      if self.f.has_single_use(self.bl, val, n);
      then { self.f.nodes[val].make_contained() }
    }

    // zeroing a register and storing it beats a 4-byte immediate on 64-bit
    let imm_zero_to_reg = self.isa.bits64 && self.f.nodes[val].is_icon(0);
    if !imm_zero_to_reg { contain::try_contain_imm(self.f, val); }

    self.fold_store_address(n);
    self.store_value_containment(n, val);
    self.f.next(n)
  }

  /// Build and contain the address mode of a store or load.
  fn fold_store_address(&mut self, n: NodeId) {
    let size = self.f.nodes[n].ty.size().unwrap_or(8);
    addr::fold_address(self.f, self.bl, n, 0, size);
    let a = self.f.nodes[n].kind.operand(0);
    if matches!(self.f.nodes[a].kind, Kind::Lea { .. } | Kind::LclAddr(..)) {
      self.f.nodes[a].make_contained();
      contain::contain_lea_leaves(self.f, a);
    }
  }

  /// A store takes one memory operand (its destination); its value can still
  /// be reg-optional when it is a re-readable local.
  fn store_value_containment(&mut self, n: NodeId, val: NodeId) {
    if !self.f.nodes[val].contained() {
      contain::try_reg_optional(self.f, self.bl, n, val);
    }
  }

  pub(super) fn lower_ind(&mut self, n: NodeId) -> Option<NodeId> {
    let size = self.f.nodes[n].ty.size().unwrap_or(8);
    addr::fold_address(self.f, self.bl, n, 0, size);
    let a = self.f.nodes[n].kind.operand(0);
    if matches!(self.f.nodes[a].kind, Kind::Lea { .. } | Kind::LclAddr(..)) {
      self.f.nodes[a].make_contained();
      contain::contain_lea_leaves(self.f, a);
    }
    self.f.next(n)
  }

  // -- integer arithmetic --------------------------------------------------

  pub(super) fn lower_binop(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::Binop(op, lhs, rhs) = self.f.nodes[n].kind else { unreachable!() };
    if self.f.nodes[n].ty == Ty::Mask || matches!(self.f.nodes[n].ty, Ty::Vec(_)) {
      return self.lower_vec_binop(n)
    }
    let ovf = self.f.nodes[n].flags.contains(NodeFlags::OVF);

    if self.opts() && !ovf {
      match op {
        Binop::Mul => if let Some(next) = self.lower_mul_by_const(n, lhs, rhs) { return next },
        Binop::UDiv | Binop::UMod =>
          if let Some(next) = self.lower_udiv_by_pow2(n, op, lhs, rhs) { return next },
        Binop::And | Binop::Xor =>
          if let Some(next) = self.try_bmi_peephole(n, op, lhs, rhs) { return next },
        _ => {}
      }
    }

    if op.is_shiftish() {
      self.contain_shift_count(n, rhs);
    } else {
      contain::contain_binop_operands(self.f, &mut self.acc, self.bl, n);
    }
    self.f.next(n)
  }

  /// `MUL(x, c)` strength reduction. Returns the outer `Option` when the node
  /// was handled (possibly unchanged, left for the address-mode builder).
  fn lower_mul_by_const(
    &mut self, n: NodeId, x: NodeId, c: NodeId,
  ) -> Option<Option<NodeId>> {
    let v = self.f.nodes[c].icon_value()?;
    if self.f.nodes[c].flags.contains(NodeFlags::RELOC) { return None }
    if !self.f.has_single_use(self.bl, c, n) { return None }
    let ty = self.f.nodes[n].ty;
    if v > 0 && (v as u64).is_power_of_two() {
      let shift = (v as u64).trailing_zeros();
      self.f.nodes[c].kind = Kind::IntCon(shift.into());
      self.f.nodes[c].make_contained();
      self.f.retype(n, ty, Kind::Binop(Binop::Shl, x, c));
      return Some(self.f.next(n))
    }
    if matches!(v, 3 | 5 | 9) {
      // one LEA either way: leave it when a memory access will absorb it,
      // otherwise materialize the LEA now
      if let Some(u) = self.use_of(n) {
        if matches!(self.f.nodes[u.user].kind,
          Kind::Ind(_) | Kind::StoreInd { .. }) && u.slot == 0
        {
          return Some(self.f.next(n))
        }
      }
      addr::lea_for_mul(self.f, self.bl, n);
      return Some(self.f.next(n))
    }
    // 2^n +/- 1 via shl and one add/sub; needs a second read of x
    let (pow, op) = if v > 2 && ((v - 1) as u64).is_power_of_two() {
      ((v - 1) as u64, Binop::Add)
    } else if v > 2 && ((v + 1) as u64).is_power_of_two() {
      ((v + 1) as u64, Binop::Sub)
    } else {
      return None
    };
    let Kind::LclVar(lcl) = self.f.nodes[x].kind else { return None };
    let shift = self.emit_before(n, ty, Kind::IntCon(pow.trailing_zeros().into()));
    self.f.nodes[shift].make_contained();
    let shl = self.emit_before(n, ty, Kind::Binop(Binop::Shl, x, shift));
    let x2 = self.emit_before(n, ty, Kind::LclVar(lcl));
    self.f.retype(n, ty, Kind::Binop(op, shl, x2));
    if self.f.use_count(self.bl, c) == 0 { self.f.remove(self.bl, c) }
    Some(Some(shl))
  }

  fn lower_udiv_by_pow2(
    &mut self, n: NodeId, op: Binop, x: NodeId, c: NodeId,
  ) -> Option<Option<NodeId>> {
    let v = self.f.nodes[c].icon_value()?;
    if v <= 0 || !(v as u64).is_power_of_two() { return None }
    if !self.f.has_single_use(self.bl, c, n) { return None }
    let ty = self.f.nodes[n].ty;
    if op == Binop::UDiv {
      self.f.nodes[c].kind = Kind::IntCon((v as u64).trailing_zeros().into());
      self.f.retype(n, ty, Kind::Binop(Binop::Shr, x, c));
    } else {
      self.f.nodes[c].kind = Kind::IntCon(v - 1);
      self.f.retype(n, ty, Kind::Binop(Binop::And, x, c));
    }
    self.f.nodes[c].make_contained();
    Some(self.f.next(n))
  }

  /// The BMI1 pattern table: `AND(x, NOT(y))`, `AND(x, ADD(x, -1))`,
  /// `AND(x, NEG(x))`, `XOR(x, ADD(x, -1))`. Each requires the intermediates
  /// to be single-use and no flag consumer between them and the root.
  fn try_bmi_peephole(
    &mut self, n: NodeId, op: Binop, lhs: NodeId, rhs: NodeId,
  ) -> Option<Option<NodeId>> {
    if !self.isa.has(IsaFlags::BMI1) { return None }
    let ty = self.f.nodes[n].ty;
    if !matches!(ty, Ty::Scalar(b) if !b.is_float() && b.bytes() >= 4) { return None }
    if self.f.nodes[n].flags.contains(NodeFlags::SET_FLAGS) { return None }
    let base = ty.scalar();

    // orient so the compound side is `inner`
    for (plain, inner) in [(lhs, rhs), (rhs, lhs)] {
      if !self.f.has_single_use(self.bl, inner, n) { continue }
      if !flags_safe_between(self.f, &mut self.acc, inner, n) { continue }
      match (op, self.f.nodes[inner].kind.clone()) {
        (Binop::And, Kind::Unop(Unop::Not, y)) => {
          // ANDN computes ~src1 & src2: the complemented value goes first
          self.f.retype(n, ty, Kind::Hwi(Box::new(crate::types::lir::HwiNode {
            id: Hwi::AndNotScalar, base, size: crate::types::VecLen::V16,
            ops: smallvec::smallvec![y, plain],
          })));
          self.f.remove(self.bl, inner);
          return Some(self.f.next(n))
        }
        (Binop::And | Binop::Xor, Kind::Binop(Binop::Add, x2, m1)) => {
          if_chain! {
            if self.f.nodes[m1].is_icon(-1);
            if self.same_value(plain, x2);
            if self.f.has_single_use(self.bl, m1, inner);
            then {
              let id = if op == Binop::And { Hwi::ResetLowestSetBit }
                       else { Hwi::GetMaskUpToLowestSetBit };
              self.replace_with_unary_bmi(n, id, base, plain, inner, &[m1, x2]);
              return Some(self.f.next(n))
            }
          }
        }
        (Binop::And, Kind::Unop(Unop::Neg, x2)) => {
          if self.same_value(plain, x2) {
            self.replace_with_unary_bmi(n, Hwi::ExtractLowestSetBit, base, plain, inner, &[x2]);
            return Some(self.f.next(n))
          }
        }
        _ => {}
      }
    }
    None
  }

  /// Replace the pattern root `n` with a one-operand BMI intrinsic on `x`,
  /// removing the interior node and any same-value duplicates that die.
  fn replace_with_unary_bmi(
    &mut self, n: NodeId, id: Hwi, base: BaseTy, x: NodeId, inner: NodeId, dead: &[NodeId],
  ) {
    let ty = self.f.nodes[n].ty;
    self.f.retype(n, ty, Kind::Hwi(Box::new(crate::types::lir::HwiNode {
      id, base, size: crate::types::VecLen::V16,
      ops: smallvec::smallvec![x],
    })));
    self.f.remove(self.bl, inner);
    for &d in dead {
      if d != x && self.f.use_count(self.bl, d) == 0 { self.f.remove(self.bl, d) }
    }
  }

  /// Are two operand edges the same value: the same node, or two reads of the
  /// same enregisterable local?
  pub(crate) fn same_value(&self, a: NodeId, b: NodeId) -> bool {
    if a == b { return true }
    match (&self.f.nodes[a].kind, &self.f.nodes[b].kind) {
      (&Kind::LclVar(x), &Kind::LclVar(y)) => x == y && self.f.locals[x].can_enregister(),
      _ => false,
    }
  }

  /// A constant shift count is masked to the operand width and contained; a
  /// variable count lives in CL and is never contained.
  fn contain_shift_count(&mut self, n: NodeId, count: NodeId) {
    if_chain! {
      if let Some(v) = self.f.nodes[count].icon_value();
      if self.f.has_single_use(self.bl, count, n);
      then {
        let bits = self.f.nodes[n].ty.size().unwrap_or(8) * 8;
        self.f.nodes[count].kind = Kind::IntCon(v & i64::from(bits - 1));
        self.f.nodes[count].make_contained();
      }
    }
  }

  pub(super) fn lower_unop(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::Unop(op, src) = self.f.nodes[n].kind else { unreachable!() };
    if matches!(self.f.nodes[n].ty, Ty::Vec(_)) { return self.lower_vec_unop(n) }
    // load side of MOVBE: bswap of a memory operand in one instruction
    if_chain! {
      if op == Unop::Bswap;
      if self.isa.has(IsaFlags::MOVBE);
      if contain::try_contain_mem(self.f, &mut self.acc, self.bl, n, src);
      then { return self.f.next(n) }
    }
    contain::try_reg_optional(self.f, self.bl, n, src);
    self.f.next(n)
  }

  // -- compares and branches -----------------------------------------------

  pub(super) fn lower_cmp(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::Cmp(cc, lhs, rhs) = self.f.nodes[n].kind else { unreachable!() };

    // move an immediate to the RHS, swapping the condition
    if self.f.nodes[lhs].icon_value().is_some() && self.f.nodes[rhs].icon_value().is_none() {
      self.f.retype(n, Ty::Void, Kind::Cmp(cc.commute(), rhs, lhs));
      return self.lower_cmp(n)
    }

    // compare against zero right after the node that computed the value:
    // reuse its flags and delete the compare
    if_chain! {
      if self.opts();
      if matches!(cc, CC::Z | CC::NZ);
      if self.f.nodes[rhs].is_icon(0);
      if self.sets_flags_for_free(lhs);
      if self.f.has_single_use(self.bl, rhs, n);
      if flags_safe_between(self.f, &mut self.acc, lhs, n);
      then {
        self.f.nodes[lhs].flags.insert(NodeFlags::SET_FLAGS);
        self.f.nodes[lhs].flags.remove(NodeFlags::UNUSED_VALUE);
        let next = self.f.next(n);
        self.f.remove(self.bl, rhs);
        self.f.remove(self.bl, n);
        return next
      }
    }

    contain::try_contain_imm(self.f, rhs);
    if !self.f.nodes[rhs].contained() &&
      !contain::try_contain_mem(self.f, &mut self.acc, self.bl, n, rhs)
    {
      // memory on the left works too if the condition commutes
      if contain::try_contain_mem(self.f, &mut self.acc, self.bl, n, lhs) {
        self.f.retype(n, Ty::Void, Kind::Cmp(cc.commute(), rhs, lhs));
      } else {
        let pick = contain::pick_reg_optional(self.f, self.bl, lhs, rhs);
        contain::try_reg_optional(self.f, self.bl, n, pick);
      }
    }
    self.f.next(n)
  }

  /// Does this node's instruction set ZF/SF as a side effect of computing its
  /// value (so a following zero compare is free)?
  fn sets_flags_for_free(&self, n: NodeId) -> bool {
    match self.f.nodes[n].kind {
      Kind::Binop(op, ..) => matches!(op,
        Binop::Add | Binop::Sub | Binop::And | Binop::Or | Binop::Xor |
        Binop::Shl | Binop::Shr | Binop::Sar),
      Kind::Unop(Unop::Neg, _) => true,
      Kind::Hwi(ref h) => matches!(h.id,
        Hwi::AndNotScalar | Hwi::ResetLowestSetBit |
        Hwi::ExtractLowestSetBit | Hwi::GetMaskUpToLowestSetBit),
      _ => false,
    }
  }

  pub(super) fn lower_jtrue(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::JTrue(cond) = self.f.nodes[n].kind else { unreachable!() };
    // a branch on a fresh setcc becomes a direct jcc on the same flags
    if_chain! {
      if let Kind::Setcc(cc) = self.f.nodes[cond].kind;
      if self.f.prev(n) == Some(cond);
      if self.f.has_single_use(self.bl, cond, n);
      then {
        self.f.retype(n, Ty::Void, Kind::Jcc(cc));
        self.f.remove(self.bl, cond);
      }
    }
    self.f.next(n)
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use crate::isa::{Isa, LowerConfig};
  use crate::lower;
  use crate::types::layout::Local;
  use crate::types::lir::{Binop, Function, Kind, RmwStatus};
  use crate::types::{BaseTy, Ty};

  fn lower(f: &mut Function, isa: &Isa) {
    lower::run(f, isa, &LowerConfig::default());
  }

  #[test]
  fn widen_small_const_store() {
    let mut f = Function::new();
    let bl = f.new_block();
    let lcl = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I16), 2));
    let c = f.icon(BaseTy::I16, -2);
    let st = f.new_node(Ty::Scalar(BaseTy::I16), Kind::StoreLcl(lcl, c));
    for n in [c, st] { f.append(bl, n) }
    lower(&mut f, &Isa::baseline());
    assert_eq!(f.nodes[st].ty, Ty::Scalar(BaseTy::I32));
    assert_eq!(f.nodes[c].icon_value(), Some(0xfffe));
    assert!(f.nodes[c].contained());
  }

  #[test]
  fn mul_pow2_becomes_shift() {
    let mut f = Function::new();
    let bl = f.new_block();
    let x = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let xv = f.lcl_var(x);
    let c = f.icon(BaseTy::I64, 16);
    let mul = f.binop(Binop::Mul, Ty::Scalar(BaseTy::I64), xv, c);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(x, mul));
    for n in [xv, c, mul, st] { f.append(bl, n) }
    lower(&mut f, &Isa::baseline());
    let Kind::Binop(Binop::Shl, _, count) = f.nodes[mul].kind else {
      panic!("expected shl, got {:?}", f.nodes[mul].kind)
    };
    assert_eq!(f.nodes[count].icon_value(), Some(4));
    assert!(f.nodes[count].contained());
  }

  #[test]
  fn mul_seventeen_is_shift_add() {
    let mut f = Function::new();
    let bl = f.new_block();
    let x = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let res = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let xv = f.lcl_var(x);
    let c = f.icon(BaseTy::I64, 17);
    let mul = f.binop(Binop::Mul, Ty::Scalar(BaseTy::I64), xv, c);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(res, mul));
    for n in [xv, c, mul, st] { f.append(bl, n) }
    lower(&mut f, &Isa::baseline());
    let Kind::Binop(Binop::Add, shl, x2) = f.nodes[mul].kind else {
      panic!("expected add, got {:?}", f.nodes[mul].kind)
    };
    assert!(matches!(f.nodes[shl].kind, Kind::Binop(Binop::Shl, ..)));
    assert!(matches!(f.nodes[x2].kind, Kind::LclVar(l) if l == x));
  }

  #[test]
  fn store_ind_rmw() {
    // S1: STORE_IND(p, ADD(IND(p), r)) -> one store with RMW_DST_IS_OP1
    let mut f = Function::new();
    let bl = f.new_block();
    let p = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let r = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I32), 4));
    let a1 = f.lcl_var(p);
    let load = f.ind(Ty::Scalar(BaseTy::I32), a1);
    let rv = f.lcl_var(r);
    let add = f.binop(Binop::Add, Ty::Scalar(BaseTy::I32), load, rv);
    let a2 = f.lcl_var(p);
    let store = f.store_ind(a2, add);
    f.nodes[store].ty = Ty::Scalar(BaseTy::I32);
    for n in [a1, load, rv, add, a2, store] { f.append(bl, n) }
    lower(&mut f, &Isa::baseline());
    let Kind::StoreInd { rmw, .. } = f.nodes[store].kind else { panic!() };
    assert_eq!(rmw, RmwStatus::Op1);
    assert!(f.nodes[add].contained() && f.nodes[load].contained());
  }

  #[test]
  fn zero_store_not_contained_on_64bit() {
    let mut f = Function::new();
    let bl = f.new_block();
    let p = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let a = f.lcl_var(p);
    let z = f.icon(BaseTy::I64, 0);
    let st = f.store_ind(a, z);
    f.nodes[st].ty = Ty::Scalar(BaseTy::I64);
    for n in [a, z, st] { f.append(bl, n) }
    lower(&mut f, &Isa::baseline());
    assert!(!f.nodes[z].contained());
  }

  #[test]
  fn blsr_peephole() {
    // S3: AND(x, ADD(x, -1)) with BMI1 -> ResetLowestSetBit(x)
    let mut f = Function::new();
    let bl = f.new_block();
    let x = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U32), 4));
    let out = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U32), 4));
    let x1 = f.lcl_var(x);
    let x2 = f.lcl_var(x);
    let m1 = f.icon(BaseTy::I32, -1);
    let add = f.binop(Binop::Add, Ty::Scalar(BaseTy::U32), x2, m1);
    let and = f.binop(Binop::And, Ty::Scalar(BaseTy::U32), x1, add);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(out, and));
    for n in [x1, x2, m1, add, and, st] { f.append(bl, n) }
    lower(&mut f, &Isa::avx512());
    let h = f.nodes[and].hwi().expect("blsr expected");
    assert_eq!(h.id, crate::hwi::Hwi::ResetLowestSetBit);
    assert_eq!(&*h.ops, &[x1]);
    // the add, constant, and duplicate read are gone
    let live: Vec<_> = f.block_iter(bl).collect();
    assert_eq!(live, vec![x1, and, st]);
  }

  #[test]
  fn cmp_zero_reuses_flags() {
    let mut f = Function::new();
    let bl = f.new_block();
    let a = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I32), 4));
    let b = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I32), 4));
    let av = f.lcl_var(a);
    let bv = f.lcl_var(b);
    let sub = f.binop(Binop::Sub, Ty::Scalar(BaseTy::I32), av, bv);
    let z = f.icon(BaseTy::I32, 0);
    let cmp = f.new_node(Ty::Void, Kind::Cmp(crate::types::CC::NZ, sub, z));
    let jcc = f.new_node(Ty::Void, Kind::Jcc(crate::types::CC::NZ));
    for n in [av, bv, sub, z, cmp, jcc] { f.append(bl, n) }
    lower(&mut f, &Isa::baseline());
    use crate::types::lir::NodeFlags;
    assert!(f.nodes[sub].flags.contains(NodeFlags::SET_FLAGS));
    let live: Vec<_> = f.block_iter(bl).collect();
    assert_eq!(live, vec![av, bv, sub, jcc]);
  }
}
