//! EVEX operand folds: embedded broadcast of splat constants and embedded
//! masking of a blend's true arm. Both run during the generic containment
//! pass once an intrinsic has reached its final form.

use crate::contain::{self, EffectsAcc};
use crate::hwi::Hwi;
use crate::types::lir::{BlockId, Function, Kind, NodeFlags, NodeId};
use crate::types::{BaseTy, Ty, VecLen};

/// Replace a splat vector constant operand with a contained scalar constant
/// under a broadcast node, so the emitter can use the EVEX `{1toN}` form
/// instead of materializing the full-width constant.
pub(crate) fn try_fold_broadcast(f: &mut Function, bl: BlockId, n: NodeId) {
  let Some(h) = f.nodes[n].hwi() else { return };
  let (id, base, size) = (h.id, h.base, h.size);
  if !id.emb_broadcast_ok(base) { return }
  let slot = id.mem_slot() as usize;
  let c = h.ops[slot];
  let bits = if_chain! {
    if let Kind::VecCon(ref vc) = f.nodes[c].kind;
    if !f.nodes[c].contained();
    // zeros and all-ones have cheaper idioms than a broadcast load
    if !vc.is_zero() && !vc.is_all_ones();
    if let Some(bits) = vc.broadcast_of(base);
    then { bits } else { return }
  };
  // a splatted sign-bit constant next to an FMA is a pending negation fold;
  // leave it for the FMA rewrite
  let sign_bit = if base == BaseTy::F32 { 0x8000_0000 } else { 1 << 63 };
  if base.is_float() && bits == sign_bit && feeds_fma(f, bl, n) { return }
  if !f.has_single_use(bl, c, n) { return }

  let scalar = if base.is_float() { Kind::FltCon(bits) } else { Kind::IntCon(bits as i64) };
  let sc = f.new_node(Ty::Scalar(base), scalar);
  f.insert_before(bl, c, sc);
  let cs = f.hwi(Ty::Vec(VecLen::V16), Hwi::CreateScalarUnsafe, base, VecLen::V16, [sc]);
  f.insert_before(bl, c, cs);
  let bc_id = match size {
    VecLen::V64 => Hwi::BroadcastScalarToVector512,
    VecLen::V32 => Hwi::BroadcastScalarToVector256,
    _ => Hwi::BroadcastScalarToVector128,
  };
  let bc = f.hwi(Ty::Vec(size), bc_id, base, size, [cs]);
  f.insert_before(bl, c, bc);
  for m in [sc, cs, bc] { f.nodes[m].make_contained() }
  for m in [cs, bc] { f.nodes[m].flags.insert(NodeFlags::EMB_BROADCAST) }
  if let Kind::Hwi(ref mut hh) = f.nodes[n].kind { hh.ops[slot] = bc }
  f.remove(bl, c);
}

fn is_fma(f: &Function, n: NodeId) -> bool {
  f.nodes[n].hwi().is_some_and(|h| h.id.fma_signs().is_some())
}

/// Is `n` an FMA, or does its value (possibly through a lane-0 injection)
/// feed one?
fn feeds_fma(f: &mut Function, bl: BlockId, n: NodeId) -> bool {
  if is_fma(f, n) { return true }
  let Some(u) = f.find_use(bl, n) else { return false };
  if is_fma(f, u.user) { return true }
  f.nodes[u.user].hwi().is_some_and(|h| h.id == Hwi::CreateScalarUnsafe) &&
    f.find_use(bl, u.user).is_some_and(|u2| is_fma(f, u2.user))
}

/// Contain the true arm of a mask blend into the blend itself, so the
/// emitter issues the arm's instruction with the blend's mask as an EVEX
/// merge mask and drops the `vpblendm` entirely.
pub(crate) fn fold_embedded_mask(f: &mut Function, acc: &mut EffectsAcc, bl: BlockId, n: NodeId) {
  let Some(h) = f.nodes[n].hwi() else { return };
  debug_assert_eq!(h.id, Hwi::BlendVariableMask);
  let (base, size) = (h.base, h.size);
  let arm = h.ops[1];
  let arm_base = if_chain! {
    if let Some(ah) = f.nodes[arm].hwi();
    if ah.id.table_driven();
    if ah.size == size;
    if !f.nodes[arm].contained();
    then { ah.base } else { return }
  };
  if arm_base.bytes() != base.bytes() {
    // a lane-size mismatch changes which elements the mask covers; only the
    // lane-agnostic bitwise group may be retagged to match
    let arm_id = f.nodes[arm].hwi().expect("hwi").id;
    if !matches!(arm_id,
      Hwi::And | Hwi::AndNot | Hwi::Or | Hwi::Xor | Hwi::TernaryLogic)
    { return }
    if let Kind::Hwi(ref mut ah) = f.nodes[arm].kind { ah.base = base }
  }
  if !f.has_single_use(bl, arm, n) { return }
  if !contain::is_safe_to_contain_mem(f, acc, arm, n, None) { return }
  f.nodes[arm].make_contained();
  f.nodes[arm].flags.insert(NodeFlags::EMB_MASK_OP);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use crate::hwi::Hwi;
  use crate::isa::{Isa, IsaFlags, LowerConfig};
  use crate::lower;
  use crate::types::layout::{Local, LocalId};
  use crate::types::lir::{Function, Kind, NodeFlags, VecConst};
  use crate::types::{BaseTy, Ty, VecLen};

  fn vec_local(f: &mut Function, len: VecLen) -> LocalId {
    f.locals.push(Local::scalar(Ty::Vec(len), len.bytes()))
  }

  #[test]
  fn splat_constant_folds_to_embedded_broadcast() {
    let mut f = Function::new();
    let bl = f.new_block();
    let la = vec_local(&mut f, VecLen::V64);
    let a = f.lcl_var(la);
    let c = f.vec_con(VecConst::splat(VecLen::V64, BaseTy::F32, 0x4048_f5c3));
    let add = f.hwi(Ty::Vec(VecLen::V64), Hwi::Add, BaseTy::F32, VecLen::V64, [a, c]);
    let dst = vec_local(&mut f, VecLen::V64);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, add));
    for n in [a, c, add, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

    let h = f.nodes[add].hwi().unwrap();
    let bc = h.ops[1];
    let bch = f.nodes[bc].hwi().unwrap();
    assert_eq!(bch.id, Hwi::BroadcastScalarToVector512);
    assert!(f.nodes[bc].contained());
    assert!(f.nodes[bc].flags.contains(NodeFlags::EMB_BROADCAST));
    let cs = bch.ops[0];
    let sc = f.nodes[cs].hwi().unwrap().ops[0];
    assert!(matches!(f.nodes[sc].kind, Kind::FltCon(0x4048_f5c3)));
    // the full-width constant is gone
    assert!(f.find_use(bl, c).is_none());
  }

  #[test]
  fn zero_splat_is_not_broadcast() {
    let mut f = Function::new();
    let bl = f.new_block();
    let la = vec_local(&mut f, VecLen::V16);
    let a = f.lcl_var(la);
    let c = f.vec_con(VecConst::zero(VecLen::V16));
    let add = f.hwi(Ty::Vec(VecLen::V16), Hwi::Add, BaseTy::I32, VecLen::V16, [a, c]);
    let dst = vec_local(&mut f, VecLen::V16);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, add));
    for n in [a, c, add, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

    let h = f.nodes[add].hwi().unwrap();
    assert_eq!(h.ops[1], c);
    assert!(matches!(f.nodes[c].kind, Kind::VecCon(_)));
  }

  #[test]
  fn blend_arm_gains_embedded_mask() {
    let mut f = Function::new();
    let bl = f.new_block();
    let v32 = Ty::Vec(VecLen::V32);
    let lcls = [vec_local(&mut f, VecLen::V32), vec_local(&mut f, VecLen::V32),
      vec_local(&mut f, VecLen::V32)];
    let a = f.lcl_var(lcls[0]);
    let b = f.lcl_var(lcls[1]);
    let e = f.lcl_var(lcls[2]);
    let mlcl = f.locals.push(Local::scalar(Ty::Mask, 8));
    let m = f.lcl_var(mlcl);
    let arm = f.hwi(v32, Hwi::Add, BaseTy::F32, VecLen::V32, [a, b]);
    let blend = f.hwi(v32, Hwi::BlendVariableMask, BaseTy::F32, VecLen::V32, [e, arm, m]);
    let dst = vec_local(&mut f, VecLen::V32);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, blend));
    for n in [a, b, e, m, arm, blend, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

    assert!(f.nodes[arm].contained());
    assert!(f.nodes[arm].flags.contains(NodeFlags::EMB_MASK_OP));
  }
}
