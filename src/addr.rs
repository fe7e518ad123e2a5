//! The address-mode builder: folding `base + index*scale + disp` chains into a
//! single [`Kind::Lea`] whose fields respect the x86 effective-address encoding.
//!
//! Folding only fires when every interior node of the chain is used once, so
//! that the consumed nodes can be spliced out. The constraints are `scale ∈
//! {1, 2, 4, 8}` and `disp + access_size <= i32::MAX` (evaluated in `i64` so
//! the addition cannot wrap).

use crate::types::Ty;
use crate::types::lir::{Binop, BlockId, Function, Kind, NodeId, OptNodeId};

/// A partially assembled effective address.
#[derive(Clone, Copy, Debug, Default)]
struct Parts {
  base: Option<NodeId>,
  index: Option<NodeId>,
  scale: u8,
  disp: i64,
}

impl Parts {
  /// Would an LEA with these parts and the given access width encode?
  fn encodes(&self, access_size: u32) -> bool {
    matches!(self.scale, 0 | 1 | 2 | 4 | 8) &&
    self.disp >= i64::from(i32::MIN) &&
    self.disp + i64::from(access_size) <= i64::from(i32::MAX)
  }

  /// Place `n` in an empty slot: base first, then unscaled index.
  fn push_reg(&mut self, n: NodeId) -> bool {
    if self.base.is_none() { self.base = Some(n); true }
    else if self.index.is_none() { self.index = Some(n); self.scale = 1; true }
    else { false }
  }
}

/// The LEA scale expressed by multiplying by `c`, if `c` is one of 2, 4, 8.
fn scale_of_mul(c: i64) -> Option<u8> {
  match c {
    2 | 4 | 8 => Some(c as u8),
    _ => None,
  }
}

/// The LEA scale expressed by shifting left by `c`, if `c` is one of 1, 2, 3.
fn scale_of_shl(c: i64) -> Option<u8> {
  match c {
    1..=3 => Some(1 << c),
    _ => None,
  }
}

/// Try to fold the address operand in `slot` of `parent` (a memory access of
/// `access_size` bytes) into a single LEA. On success the consumed chain nodes
/// are removed, the new LEA is linked just before `parent`, and the operand
/// slot is rewritten; on failure the expression is left untouched.
pub(crate) fn fold_address(
  f: &mut Function, bl: BlockId, parent: NodeId, slot: u8, access_size: u32,
) -> bool {
  let addr = f.nodes[parent].kind.operand(slot);
  // already in final form; re-parsing would rebuild an identical node
  if matches!(f.nodes[addr].kind, Kind::Lea { .. }) { return false }
  let mut parts = Parts::default();
  let mut consumed = Vec::new();
  if !parse(f, bl, addr, parent, &mut parts, &mut consumed) { return false }
  // a bare base gains nothing over using the value directly
  if consumed.is_empty() { return false }
  if !parts.encodes(access_size) { return false }

  let lea = f.new_node(Ty::Scalar(crate::types::BaseTy::U64), Kind::Lea {
    base: parts.base.into(),
    index: parts.index.into(),
    scale: if parts.index.is_some() { parts.scale.max(1) } else { 0 },
    disp: parts.disp as i32,
  });
  f.insert_before(bl, parent, lea);
  f.nodes[parent].kind.set_operand(slot, lea);
  for n in consumed { f.remove(bl, n) }
  true
}

/// Parse `n` (whose single use must be `user`, an interior chain node or the
/// memory access itself) into `parts`. Nodes that would be replaced by the LEA
/// are pushed onto `consumed`; leaves (base/index values, or an unfoldable
/// subtree used whole as the base) are not.
fn parse(
  f: &Function, bl: BlockId, n: NodeId, user: NodeId,
  parts: &mut Parts, consumed: &mut Vec<NodeId>,
) -> bool {
  let interior = |f: &Function| f.has_single_use(bl, n, user);
  match f.nodes[n].kind {
    Kind::Binop(Binop::Add, a, b) if interior(f) => {
      consumed.push(n);
      let (a, b) = if f.nodes[b].icon_value().is_some() { (a, b) } else { (b, a) };
      if let Some(v) = f.nodes[b].icon_value() {
        if f.nodes[b].flags.contains(crate::types::lir::NodeFlags::RELOC) { return false }
        if !f.has_single_use(bl, b, n) { return false }
        parts.disp += v;
        consumed.push(b);
        parse(f, bl, a, n, parts, consumed)
      } else {
        parse(f, bl, a, n, parts, consumed) && parse(f, bl, b, n, parts, consumed)
      }
    }
    Kind::Binop(Binop::Mul, x, c) if interior(f) => {
      let Some(cv) = f.nodes[c].icon_value() else { return consumed_leaf(n, parts) };
      if !f.has_single_use(bl, c, n) { return consumed_leaf(n, parts) }
      if let Some(scale) = scale_of_mul(cv) {
        if parts.index.is_some() { return false }
        parts.index = Some(x);
        parts.scale = scale;
        consumed.push(n);
        consumed.push(c);
        true
      } else if matches!(cv, 3 | 5 | 9) && parts.base.is_none() && parts.index.is_none() {
        // x*9 = x + x*8, one LEA
        parts.base = Some(x);
        parts.index = Some(x);
        parts.scale = (cv - 1) as u8;
        consumed.push(n);
        consumed.push(c);
        true
      } else {
        consumed_leaf(n, parts)
      }
    }
    Kind::Binop(Binop::Shl, x, c) if interior(f) => {
      if_chain! {
        if let Some(cv) = f.nodes[c].icon_value();
        if f.has_single_use(bl, c, n);
        if let Some(scale) = scale_of_shl(cv);
        if parts.index.is_none();
        then {
          parts.index = Some(x);
          parts.scale = scale;
          consumed.push(n);
          consumed.push(c);
          true
        } else { consumed_leaf(n, parts) }
      }
    }
    Kind::Lea { base, index, scale, disp } if interior(f) => {
      merge_lea(n, base, index, scale, disp, parts, consumed)
    }
    _ => consumed_leaf(n, parts),
  }
}

/// Use `n` whole as a base or index register value.
fn consumed_leaf(n: NodeId, parts: &mut Parts) -> bool { parts.push_reg(n) }

/// Merge a pre-existing LEA into the new parts. The prior LEA's index slot is
/// reused only when it matches the scale already collected (or one side has no
/// index); otherwise the prior LEA survives as the nested base.
fn merge_lea(
  n: NodeId, base: OptNodeId, index: OptNodeId, scale: u8, disp: i32,
  parts: &mut Parts, consumed: &mut Vec<NodeId>,
) -> bool {
  match (index.get(), parts.index) {
    // scale mismatch or two distinct index values: nest the prior LEA as a base
    (Some(_), Some(_)) => return parts.push_reg(n),
    (Some(i), None) => {
      parts.index = Some(i);
      parts.scale = scale;
    }
    (None, _) => {}
  }
  if let Some(b) = base.get() {
    if !parts.push_reg(b) {
      // roll back is not worth it; nest instead
      parts.index = None;
      parts.scale = 0;
      return parts.push_reg(n)
    }
  }
  parts.disp += i64::from(disp);
  consumed.push(n);
  true
}

/// Add a constant byte offset to the address of the memory access `parent`
/// (slot 0 holds the address), creating or extending an LEA. Used when a
/// vector element access is refolded into a narrower load.
pub(crate) fn add_offset(
  f: &mut Function, bl: BlockId, parent: NodeId, extra: i64, access_size: u32,
) -> bool {
  let addr = f.nodes[parent].kind.operand(0);
  if let Kind::Lea { disp, .. } = f.nodes[addr].kind {
    let new = i64::from(disp) + extra;
    if new < i64::from(i32::MIN) || new + i64::from(access_size) > i64::from(i32::MAX) {
      return false
    }
    if let Kind::Lea { ref mut disp, .. } = f.nodes[addr].kind { *disp = new as i32 }
    return true
  }
  if extra + i64::from(access_size) > i64::from(i32::MAX) { return false }
  let lea = f.new_node(f.nodes[addr].ty, Kind::Lea {
    base: addr.into(),
    index: OptNodeId::NONE,
    scale: 0,
    disp: extra as i32,
  });
  f.insert_before(bl, parent, lea);
  f.nodes[parent].kind.set_operand(0, lea);
  true
}

/// Rewrite `Mul(x, c)` with `c` in 3, 5, 9 into a standalone
/// `Lea(base = x, index = x, scale = c - 1)`, removing the constant.
pub(crate) fn lea_for_mul(f: &mut Function, bl: BlockId, mul: NodeId) {
  let Kind::Binop(Binop::Mul, x, c) = f.nodes[mul].kind else { panic!("mul expected") };
  let cv = f.nodes[c].icon_value().expect("constant multiplier");
  assert!(matches!(cv, 3 | 5 | 9), "not an lea multiplier: {cv}");
  let ty = f.nodes[mul].ty;
  f.retype(mul, ty, Kind::Lea {
    base: x.into(),
    index: x.into(),
    scale: (cv - 1) as u8,
    disp: 0,
  });
  if f.use_count(bl, c) == 0 { f.remove(bl, c) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use super::*;
  use crate::types::{BaseTy, Ty};
  use crate::types::layout::Local;

  fn local_i64(f: &mut Function) -> crate::types::layout::LocalId {
    f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8))
  }

  #[test]
  fn base_index_disp() {
    let mut f = Function::new();
    let bl = f.new_block();
    let (p, i) = (local_i64(&mut f), local_i64(&mut f));
    let base = f.lcl_var(p);
    let idx = f.lcl_var(i);
    let c8 = f.icon(BaseTy::I64, 8);
    let scaled = f.binop(Binop::Mul, Ty::Scalar(BaseTy::I64), idx, c8);
    let sum = f.binop(Binop::Add, Ty::Scalar(BaseTy::I64), base, scaled);
    let c16 = f.icon(BaseTy::I64, 16);
    let addr = f.binop(Binop::Add, Ty::Scalar(BaseTy::I64), sum, c16);
    let load = f.ind(Ty::Scalar(BaseTy::I64), addr);
    for n in [base, idx, c8, scaled, sum, c16, addr, load] { f.append(bl, n) }

    assert!(fold_address(&mut f, bl, load, 0, 8));
    let lea = f.nodes[load].kind.operand(0);
    let Kind::Lea { base: b, index: ix, scale, disp } = f.nodes[lea].kind
      else { panic!("lea expected, got {:?}", f.nodes[lea].kind) };
    assert_eq!((b.get(), ix.get(), scale, disp), (Some(base), Some(idx), 8, 16));
    // consumed chain nodes are unlinked
    let live: Vec<_> = f.block_iter(bl).collect();
    assert_eq!(live, vec![base, idx, lea, load]);
  }

  #[test]
  fn mul_by_nine() {
    let mut f = Function::new();
    let bl = f.new_block();
    let x = local_i64(&mut f);
    let xv = f.lcl_var(x);
    let c9 = f.icon(BaseTy::I64, 9);
    let mul = f.binop(Binop::Mul, Ty::Scalar(BaseTy::I64), xv, c9);
    let load = f.ind(Ty::Scalar(BaseTy::I32), mul);
    for n in [xv, c9, mul, load] { f.append(bl, n) }

    assert!(fold_address(&mut f, bl, load, 0, 4));
    let lea = f.nodes[load].kind.operand(0);
    let Kind::Lea { base, index, scale, disp } = f.nodes[lea].kind else { panic!() };
    assert_eq!((base.get(), index.get(), scale, disp), (Some(xv), Some(xv), 8, 0));
  }

  #[test]
  fn displacement_limit() {
    let mut f = Function::new();
    let bl = f.new_block();
    let p = local_i64(&mut f);
    let base = f.lcl_var(p);
    let big = f.icon(BaseTy::I64, i64::from(i32::MAX) - 2);
    let addr = f.binop(Binop::Add, Ty::Scalar(BaseTy::I64), base, big);
    let load = f.ind(Ty::Scalar(BaseTy::I64), addr);
    for n in [base, big, addr, load] { f.append(bl, n) }
    // disp + 8 overflows the encoding; the chain is untouched
    assert!(!fold_address(&mut f, bl, load, 0, 8));
    assert_eq!(f.nodes[load].kind.operand(0), addr);
  }

  #[test]
  fn second_use_blocks_fold() {
    let mut f = Function::new();
    let bl = f.new_block();
    let p = local_i64(&mut f);
    let base = f.lcl_var(p);
    let c8 = f.icon(BaseTy::I64, 8);
    let addr = f.binop(Binop::Add, Ty::Scalar(BaseTy::I64), base, c8);
    let load = f.ind(Ty::Scalar(BaseTy::I64), addr);
    let keep = f.binop(Binop::Add, Ty::Scalar(BaseTy::I64), addr, load);
    for n in [base, c8, addr, load, keep] { f.append(bl, n) }
    assert!(!fold_address(&mut f, bl, load, 0, 8));
  }
}
