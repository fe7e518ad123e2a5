//! Vector bitwise lowering: ternary-logic fusion, vector selects, and
//! whole-vector equality.
//!
//! Everything here funnels toward three instruction families: `vpternlogd`
//! (any three-input boolean function under EVEX), the variable blends
//! (`pblendvb`/`vblendvps`/`vpblendmd`), and the flag-producing reductions
//! (`ptest`/`kortest`/`pmovmskb`) that turn a lane-wise comparison into a
//! scalar condition.

use super::Lowering;
use crate::hwi::{ternlog, Hwi};
use crate::isa::IsaFlags;
use crate::types::lir::{Binop, Kind, NodeFlags, NodeId, Unop, VecConst};
use crate::types::{BaseTy, Ty, VecLen, CC};

impl Lowering<'_> {
  /// Lower a vector-typed [`Kind::Binop`]. Vector `Binop`s carry no lane
  /// type, so only the lane-size-agnostic bitwise operators appear here;
  /// typed arithmetic arrives as [`Hwi::Add`] and friends.
  pub(super) fn lower_vec_binop(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::Binop(op, lhs, rhs) = self.f.nodes[n].kind else { unreachable!() };
    let ty = self.f.nodes[n].ty;
    if ty == Ty::Mask {
      // mask-register arithmetic (kand/kor/kxor); register operands only
      return self.f.next(n)
    }
    let len = ty.vec_len();

    // xor against all ones is a complement; under EVEX vpternlog does it
    // with no materialized constant
    if_chain! {
      if op == Binop::Xor && self.isa.evex();
      if let Kind::VecCon(ref vc) = self.f.nodes[rhs].kind;
      if vc.is_all_ones();
      if self.f.has_single_use(self.bl, rhs, n);
      then {
        self.f.remove(self.bl, rhs);
        return self.ternlog_not(n, lhs, len)
      }
    }

    let id = match op {
      Binop::And => Hwi::And,
      Binop::Or => Hwi::Or,
      Binop::Xor => Hwi::Xor,
      op => panic!("vector binop must be bitwise: {op:?}"),
    };
    self.retype_hwi(n, ty, id, BaseTy::U32, len, [lhs, rhs]);
    Some(n)
  }

  /// Lower a vector-typed [`Kind::Unop`]. Only `Not` has an untyped vector
  /// form; negation arrives as typed arithmetic.
  pub(super) fn lower_vec_unop(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::Unop(op, x) = self.f.nodes[n].kind else { unreachable!() };
    let ty = self.f.nodes[n].ty;
    let len = ty.vec_len();
    match op {
      Unop::Not if self.isa.evex() => self.ternlog_not(n, x, len),
      Unop::Not => {
        let ones = self.f.vec_con(VecConst::all_ones(len));
        self.f.insert_before(self.bl, n, ones);
        self.retype_hwi(n, ty, Hwi::Xor, BaseTy::U32, len, [x, ones]);
        Some(n)
      }
      op => panic!("no vector form: {op:?}"),
    }
  }

  /// Lower the element-wise bitwise intrinsics. By the time a parent is
  /// visited its operands are in final form, so complement stripping and
  /// chain fusion both pattern-match on already-lowered children.
  pub(super) fn lower_vec_bitwise(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (op, lhs, rhs) = (h.id, h.ops[0], h.ops[1]);
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;

    if op == Hwi::And {
      // a complement feeding an AND is a single pandn
      for (not_side, other) in [(lhs, rhs), (rhs, lhs)] {
        if let Some(x) = self.strip_not(not_side, n) {
          self.uncontain(x);
          self.retype_hwi(n, ty, Hwi::AndNot, base, len, [x, other]);
          return Some(n)
        }
      }
    }

    if self.opts() && self.isa.evex() {
      // fuse a single-use two-op bitwise chain into one vpternlog; the
      // outer node's other operand lands in the register-only A slot
      for (inner_side, other) in [(lhs, rhs), (rhs, lhs)] {
        if_chain! {
          if let Some(ih) = self.f.nodes[inner_side].hwi();
          if matches!(ih.id, Hwi::And | Hwi::AndNot | Hwi::Or | Hwi::Xor);
          if ih.size == len;
          let iid = ih.id;
          let (ia, ib) = (ih.ops[0], ih.ops[1]);
          if self.f.has_single_use(self.bl, inner_side, n);
          then {
            let inner_ctrl = match iid {
              Hwi::And => ternlog::B & ternlog::C,
              Hwi::AndNot => !ternlog::B & ternlog::C,
              Hwi::Or => ternlog::B | ternlog::C,
              _ => ternlog::B ^ ternlog::C,
            };
            let bop = match op { Hwi::And => Binop::And, Hwi::Or => Binop::Or, _ => Binop::Xor };
            let ctrl = ternlog::apply(bop, ternlog::A, inner_ctrl);
            self.f.remove(self.bl, inner_side);
            for m in [other, ia, ib] { self.uncontain(m) }
            let imm = self.icon_before(n, BaseTy::I32, ctrl.into());
            self.retype_hwi(n, ty, Hwi::TernaryLogic, base, len, [other, ia, ib, imm]);
            return Some(n)
          }
        }
      }
    }

    self.contain_hwi_operands(n)
  }

  /// If `side` computes a single-use bitwise complement for `user`, unlink
  /// it (and its helper constants) and return the operand being complemented.
  fn strip_not(&mut self, side: NodeId, user: NodeId) -> Option<NodeId> {
    let ih = self.f.nodes[side].hwi()?.clone();
    if !self.f.has_single_use(self.bl, side, user) { return None }
    match ih.id {
      // the canonical EVEX complement: TernaryLogic(_, _, x, !C)
      Hwi::TernaryLogic if self.f.nodes[ih.ops[3]].is_icon((!ternlog::C).into()) => {
        let x = ih.ops[2];
        self.f.remove(self.bl, side);
        for z in [ih.ops[0], ih.ops[1], ih.ops[3]] {
          if self.f.use_count(self.bl, z) == 0 { self.f.remove(self.bl, z) }
        }
        Some(x)
      }
      // xor against all ones
      Hwi::Xor => {
        if_chain! {
          if let Kind::VecCon(ref vc) = self.f.nodes[ih.ops[1]].kind;
          if vc.is_all_ones();
          if self.f.has_single_use(self.bl, ih.ops[1], side);
          then {
            self.f.remove(self.bl, side);
            self.f.remove(self.bl, ih.ops[1]);
            Some(ih.ops[0])
          } else { None }
        }
      }
      _ => None,
    }
  }

  /// Clear placement decisions made for a node's former position; the new
  /// parent re-runs containment with its own constraints.
  fn uncontain(&mut self, n: NodeId) {
    self.f.nodes[n].flags.remove(NodeFlags::CONTAINED | NodeFlags::REG_OPTIONAL);
  }

  /// Rewrite `n` into `TernaryLogic(_, _, x, !C)`, a one-instruction
  /// complement. The unused A and B slots get contained zero constants so the
  /// node stays well-formed without consuming registers.
  fn ternlog_not(&mut self, n: NodeId, x: NodeId, len: VecLen) -> Option<NodeId> {
    let ty = self.f.nodes[n].ty;
    let z0 = self.f.vec_con(VecConst::zero(len));
    self.f.insert_before(self.bl, n, z0);
    self.f.nodes[z0].make_contained();
    let z1 = self.f.vec_con(VecConst::zero(len));
    self.f.insert_before(self.bl, n, z1);
    self.f.nodes[z1].make_contained();
    let imm = self.icon_before(n, BaseTy::I32, (!ternlog::C).into());
    self.retype_hwi(n, ty, Hwi::TernaryLogic, BaseTy::U32, len, [z0, z1, x, imm]);
    Some(n)
  }

  /// Lower [`Hwi::Equality`]/[`Hwi::Inequality`]: a whole-vector comparison
  /// producing a scalar boolean. The node always becomes a [`Kind::Setcc`]
  /// behind a flag-setting reduction, so a following `JTrue` can fuse it into
  /// a bare `Jcc`.
  pub(super) fn lower_equality(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let eq = h.id == Hwi::Equality;
    let (a, b) = (h.ops[0], h.ops[1]);
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;

    if self.isa.evex() {
      let zero_rhs = if_chain! {
        if let Kind::VecCon(ref vc) = self.f.nodes[b].kind;
        if vc.is_zero();
        if self.f.has_single_use(self.bl, b, n);
        then { true } else { false }
      };
      let (mask, cc) = if zero_rhs {
        // v == 0 over every lane: vptestm sets a mask bit per nonzero lane
        self.f.remove(self.bl, b);
        let m = self.hwi_before(n, Ty::Mask, Hwi::TestMask, base, len, [a, a]);
        (m, if eq { CC::Z } else { CC::NZ })
      } else if len.lanes(base) >= 8 {
        // full mask register: kortest sets CF when every bit is set
        let m = self.hwi_before(n, Ty::Mask, Hwi::CompareEqualMask, base, len, [a, b]);
        (m, if eq { CC::B } else { CC::NB })
      } else {
        // partial mask: the zero upper bits would defeat the CF test, so
        // invert the comparison and test for an all-zero mask instead
        let m = self.hwi_before(n, Ty::Mask, Hwi::CompareNotEqualMask, base, len, [a, b]);
        (m, if eq { CC::Z } else { CC::NZ })
      };
      let kt = self.hwi_before(n, Ty::Void, Hwi::Kortest, base, len, [mask, mask]);
      self.f.nodes[kt].flags.insert(NodeFlags::SET_FLAGS);
      self.f.retype(n, ty, Kind::Setcc(cc));
      return Some(mask)
    }

    if self.isa.has(IsaFlags::SSE42) {
      if let Kind::VecCon(ref vc) = self.f.nodes[b].kind {
        if vc.is_zero() && self.f.has_single_use(self.bl, b, n) {
          self.f.remove(self.bl, b);
          let pt = self.hwi_before(n, Ty::Void, Hwi::Ptest, base, len, [a, a]);
          self.f.nodes[pt].flags.insert(NodeFlags::SET_FLAGS);
          self.f.retype(n, ty, Kind::Setcc(if eq { CC::Z } else { CC::NZ }));
          return Some(pt)
        }
        if vc.is_all_ones() {
          // ptest sets CF from ~a & b, so an all-ones b leaves CF set
          // exactly when a is all ones
          let pt = self.hwi_before(n, Ty::Void, Hwi::Ptest, base, len, [a, b]);
          self.f.nodes[pt].flags.insert(NodeFlags::SET_FLAGS);
          self.f.retype(n, ty, Kind::Setcc(if eq { CC::B } else { CC::NB }));
          return Some(pt)
        }
      }
    }

    // compare lanes, collapse the sign bits, compare against the full mask
    let cmpv = self.hwi_before(n, Ty::Vec(len), Hwi::CompareEqual, base, len, [a, b]);
    let mm_base = if base.is_float() { base } else { BaseTy::U8 };
    let mm = self.hwi_before(n, Ty::Scalar(BaseTy::I32), Hwi::MoveMask, mm_base, len, [cmpv]);
    let bits = if base.is_float() { len.lanes(base) } else { len.bytes() };
    let expect = self.icon_before(n, BaseTy::I32, (1i64 << bits) - 1);
    self.emit_before(n, Ty::Void, Kind::Cmp(CC::Z, mm, expect));
    self.f.retype(n, ty, Kind::Setcc(if eq { CC::Z } else { CC::NZ }));
    Some(cmpv)
  }

  /// Lower [`Hwi::ConditionalSelect`] to the best available blend form.
  pub(super) fn lower_cnd_sel(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (cond, a, b) = (h.ops[0], h.ops[1], h.ops[2]);
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;

    if self.f.nodes[cond].ty == Ty::Mask && self.isa.embedded_masking() {
      self.retype_hwi(n, ty, Hwi::BlendVariableMask, base, len, [b, a, cond]);
      return Some(n)
    }

    // a zero arm collapses to one bitwise op
    if_chain! {
      if let Kind::VecCon(ref vc) = self.f.nodes[a].kind;
      if vc.is_zero();
      if self.f.has_single_use(self.bl, a, n);
      then {
        self.f.remove(self.bl, a);
        self.retype_hwi(n, ty, Hwi::AndNot, base, len, [cond, b]);
        return Some(n)
      }
    }
    if_chain! {
      if let Kind::VecCon(ref vc) = self.f.nodes[b].kind;
      if vc.is_zero();
      if self.f.has_single_use(self.bl, b, n);
      then {
        self.f.remove(self.bl, b);
        self.retype_hwi(n, ty, Hwi::And, base, len, [cond, a]);
        return Some(n)
      }
    }

    let blend_ok = match len.reg_bytes() {
      16 => self.isa.has(IsaFlags::SSE41),
      32 if base.is_float() => self.isa.has(IsaFlags::AVX),
      32 => self.isa.has(IsaFlags::AVX2),
      _ => false,
    };
    // blendv keys on lane sign bits, so the condition must be a lane mask
    let lane_mask = matches!(self.f.nodes[cond].hwi().map(|ih| ih.id),
      Some(Hwi::CompareEqual | Hwi::CompareOrdered | Hwi::CompareLessThanOrEqual));
    if blend_ok && lane_mask {
      self.retype_hwi(n, ty, Hwi::BlendVariable, base, len, [b, a, cond]);
      return Some(n)
    }

    if self.isa.evex() {
      let imm = self.icon_before(n, BaseTy::I32, ternlog::SELECT.into());
      self.retype_hwi(n, ty, Hwi::TernaryLogic, base, len, [cond, a, b, imm]);
      return Some(n)
    }

    // and/andnot/or decomposition; `cond` is deliberately used twice
    let t = self.hwi_before(n, ty, Hwi::And, base, len, [cond, a]);
    let e = self.hwi_before(n, ty, Hwi::AndNot, base, len, [cond, b]);
    self.retype_hwi(n, ty, Hwi::Or, base, len, [t, e]);
    Some(t)
  }

  /// Lower [`Hwi::TernaryLogic`]: constant-fold degenerate controls,
  /// recognize selects and double complements, and canonicalize an unused
  /// operand into the A slot (only B and C admit memory forms).
  pub(super) fn lower_ternary_logic(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;
    let imm = h.ops[3];
    let ctrl = self.f.nodes[imm].icon_value().expect("ternlog control") as u8;

    match ctrl {
      0x00 | 0xff => {
        let c = if ctrl == 0 { VecConst::zero(len) } else { VecConst::all_ones(len) };
        let c = self.f.vec_con(c);
        self.f.insert_before(self.bl, n, c);
        self.replace_value(n, c);
        return self.f.next(c)
      }
      _ => {}
    }

    if ctrl == !ternlog::C {
      // NOT(NOT(x)) collapses to x, leaving no dead nodes behind
      let x = h.ops[2];
      if_chain! {
        if let Some(inner) = self.f.nodes[x].hwi();
        if inner.id == Hwi::TernaryLogic;
        let inner_imm = inner.ops[3];
        let inner_val = inner.ops[2];
        if self.f.nodes[inner_imm].is_icon((!ternlog::C).into());
        if self.f.has_single_use(self.bl, x, n);
        then {
          let next = self.f.next(n);
          if let Some(u) = self.use_of(n) { self.f.replace_use(u, inner_val) }
          self.f.remove_tree(self.bl, n);
          return next
        }
      }
      // a plain complement is already canonical
      return self.contain_hwi_operands(n)
    }

    if_chain! {
      if let Some((x, y, z)) = ternlog::as_select(ctrl);
      if self.f.nodes[h.ops[x]].ty == Ty::Mask;
      if self.isa.embedded_masking();
      then {
        let (sel, t, e) = (h.ops[x], h.ops[y], h.ops[z]);
        self.f.remove(self.bl, imm);
        self.retype_hwi(n, ty, Hwi::BlendVariableMask, base, len, [e, t, sel]);
        return Some(n)
      }
    }

    let (ua, ub, uc) = ternlog::uses(ctrl);
    let unused = [!ua, !ub, !uc];
    if unused.iter().filter(|&&u| u).count() == 1 && !unused[0] {
      let j = if unused[1] { 1 } else { 2 };
      let swapped = ternlog::swap(ctrl, 0, j);
      if let Kind::Hwi(ref mut hh) = self.f.nodes[n].kind { hh.ops.swap(0, j) }
      self.f.nodes[imm].kind = Kind::IntCon(swapped.into());
    }

    self.contain_hwi_operands(n)
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use crate::hwi::{ternlog, Hwi};
  use crate::isa::{Isa, IsaFlags, LowerConfig};
  use crate::lower;
  use crate::types::layout::{Local, LocalId};
  use crate::types::lir::{Binop, Function, Kind, Unop, VecConst};
  use crate::types::{BaseTy, Ty, VecLen, CC};

  fn vec_local(f: &mut Function, len: VecLen) -> LocalId {
    f.locals.push(Local::scalar(Ty::Vec(len), len.bytes()))
  }

  #[test]
  fn bitwise_chain_fuses_to_ternlog() {
    let mut f = Function::new();
    let bl = f.new_block();
    let v16 = Ty::Vec(VecLen::V16);
    let lcl = [vec_local(&mut f, VecLen::V16), vec_local(&mut f, VecLen::V16),
      vec_local(&mut f, VecLen::V16)];
    let a = f.lcl_var(lcl[0]);
    let b = f.lcl_var(lcl[1]);
    let c = f.lcl_var(lcl[2]);
    let x = f.binop(Binop::Xor, v16, a, b);
    let and = f.binop(Binop::And, v16, x, c);
    let dst = vec_local(&mut f, VecLen::V16);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, and));
    for n in [a, b, c, x, and, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

    let h = f.nodes[and].hwi().unwrap();
    assert_eq!(h.id, Hwi::TernaryLogic);
    // AND(XOR(a, b), c): c in the A slot, the xor operands in B and C
    assert_eq!(&h.ops[..3], &[c, a, b]);
    let ctrl = f.nodes[h.ops[3]].icon_value().unwrap() as u8;
    assert_eq!(ctrl, 0x60);
    assert!(f.find_use(bl, x).is_none(), "inner xor should be gone");
  }

  #[test]
  fn and_of_not_becomes_andnot() {
    let mut f = Function::new();
    let bl = f.new_block();
    let v16 = Ty::Vec(VecLen::V16);
    let la = vec_local(&mut f, VecLen::V16);
    let lb = vec_local(&mut f, VecLen::V16);
    let a = f.lcl_var(la);
    let b = f.lcl_var(lb);
    let not = f.unop(Unop::Not, v16, a);
    let and = f.binop(Binop::And, v16, not, b);
    let dst = vec_local(&mut f, VecLen::V16);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, and));
    for n in [a, b, not, and, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

    let h = f.nodes[and].hwi().unwrap();
    assert_eq!(h.id, Hwi::AndNot);
    assert_eq!(&h.ops[..], &[a, b]);
    assert!(f.find_use(bl, not).is_none(), "the not should be folded away");
  }

  #[test]
  fn double_complement_cancels() {
    let mut f = Function::new();
    let bl = f.new_block();
    let v16 = Ty::Vec(VecLen::V16);
    let la = vec_local(&mut f, VecLen::V16);
    let a = f.lcl_var(la);
    let n1 = f.unop(Unop::Not, v16, a);
    let n2 = f.unop(Unop::Not, v16, n1);
    let dst = vec_local(&mut f, VecLen::V16);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, n2));
    for n in [a, n1, n2, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

    // the store reads `a` directly and no ternlog (or helper zero) survives
    assert!(matches!(f.nodes[st].kind, Kind::StoreLcl(_, v) if v == a));
    for m in f.block_iter(bl) {
      assert!(!f.nodes[m].hwi().is_some_and(|h| h.id == Hwi::TernaryLogic));
      assert!(!matches!(f.nodes[m].kind, Kind::VecCon(_)));
    }
  }

  #[test]
  fn vector256_equality_uses_kortest() {
    let mut f = Function::new();
    let bl = f.new_block();
    let la = vec_local(&mut f, VecLen::V32);
    let lb = vec_local(&mut f, VecLen::V32);
    let a = f.lcl_var(la);
    let b = f.lcl_var(lb);
    let eq = f.hwi(Ty::Scalar(BaseTy::U8), Hwi::Equality, BaseTy::I32, VecLen::V32, [a, b]);
    let dst = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U8), 1));
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, eq));
    for n in [a, b, eq, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

    assert!(matches!(f.nodes[eq].kind, Kind::Setcc(CC::B)));
    let prev = f.prev(eq).unwrap();
    assert_eq!(f.nodes[prev].hwi().unwrap().id, Hwi::Kortest);
    let mask = f.nodes[prev].hwi().unwrap().ops[0];
    assert_eq!(f.nodes[mask].hwi().unwrap().id, Hwi::CompareEqualMask);
    assert_eq!(f.nodes[mask].ty, Ty::Mask);
  }

  #[test]
  fn equality_with_zero_uses_ptest() {
    let mut f = Function::new();
    let bl = f.new_block();
    let la = vec_local(&mut f, VecLen::V16);
    let a = f.lcl_var(la);
    let z = f.vec_con(VecConst::zero(VecLen::V16));
    let eq = f.hwi(Ty::Scalar(BaseTy::U8), Hwi::Equality, BaseTy::I32, VecLen::V16, [a, z]);
    let dst = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U8), 1));
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, eq));
    for n in [a, z, eq, st] { f.append(bl, n) }

    let isa = Isa::new(IsaFlags::SSE42, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    assert!(matches!(f.nodes[eq].kind, Kind::Setcc(CC::Z)));
    let prev = f.prev(eq).unwrap();
    assert_eq!(f.nodes[prev].hwi().unwrap().id, Hwi::Ptest);
  }

  #[test]
  fn inequality_movmsk_fallback() {
    let mut f = Function::new();
    let bl = f.new_block();
    let la = vec_local(&mut f, VecLen::V16);
    let lb = vec_local(&mut f, VecLen::V16);
    let a = f.lcl_var(la);
    let b = f.lcl_var(lb);
    let ne = f.hwi(Ty::Scalar(BaseTy::U8), Hwi::Inequality, BaseTy::I32, VecLen::V16, [a, b]);
    let dst = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U8), 1));
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, ne));
    for n in [a, b, ne, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

    assert!(matches!(f.nodes[ne].kind, Kind::Setcc(CC::NZ)));
    let cmp = f.prev(ne).unwrap();
    let Kind::Cmp(CC::Z, mm, expect) = f.nodes[cmp].kind else { panic!("expected cmp") };
    assert_eq!(f.nodes[mm].hwi().unwrap().id, Hwi::MoveMask);
    assert!(f.nodes[expect].is_icon(0xffff));
  }

  #[test]
  fn select_of_compare_uses_blendv() {
    let mut f = Function::new();
    let bl = f.new_block();
    let v16 = Ty::Vec(VecLen::V16);
    let lcl = [vec_local(&mut f, VecLen::V16), vec_local(&mut f, VecLen::V16),
      vec_local(&mut f, VecLen::V16), vec_local(&mut f, VecLen::V16)];
    let x = f.lcl_var(lcl[0]);
    let y = f.lcl_var(lcl[1]);
    let a = f.lcl_var(lcl[2]);
    let b = f.lcl_var(lcl[3]);
    let cond = f.hwi(v16, Hwi::CompareEqual, BaseTy::F32, VecLen::V16, [x, y]);
    let sel = f.hwi(v16, Hwi::ConditionalSelect, BaseTy::F32, VecLen::V16, [cond, a, b]);
    let dst = vec_local(&mut f, VecLen::V16);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, sel));
    for n in [x, y, a, b, cond, sel, st] { f.append(bl, n) }

    let isa = Isa::new(IsaFlags::SSE42, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    let h = f.nodes[sel].hwi().unwrap();
    assert_eq!(h.id, Hwi::BlendVariable);
    assert_eq!(&h.ops[..], &[b, a, cond]);
  }

  #[test]
  fn select_without_blendv_decomposes() {
    let mut f = Function::new();
    let bl = f.new_block();
    let v16 = Ty::Vec(VecLen::V16);
    let lcl = [vec_local(&mut f, VecLen::V16), vec_local(&mut f, VecLen::V16),
      vec_local(&mut f, VecLen::V16)];
    let cond = f.lcl_var(lcl[0]);
    let a = f.lcl_var(lcl[1]);
    let b = f.lcl_var(lcl[2]);
    let sel = f.hwi(v16, Hwi::ConditionalSelect, BaseTy::I32, VecLen::V16, [cond, a, b]);
    let dst = vec_local(&mut f, VecLen::V16);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, sel));
    for n in [cond, a, b, sel, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

    let h = f.nodes[sel].hwi().unwrap();
    assert_eq!(h.id, Hwi::Or);
    assert_eq!(f.nodes[h.ops[0]].hwi().unwrap().id, Hwi::And);
    assert_eq!(f.nodes[h.ops[1]].hwi().unwrap().id, Hwi::AndNot);
  }

  #[test]
  fn ternlog_select_control_is_0xca() {
    assert_eq!(ternlog::SELECT, 0xca);
    assert_eq!(ternlog::apply(Binop::Or,
      ternlog::apply(Binop::And, ternlog::A, ternlog::B),
      ternlog::apply(Binop::And, !ternlog::A, ternlog::C)), 0xca);
  }
}
