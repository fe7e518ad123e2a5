//! Cast lowering. Integer casts only need operand placement; float-to-integer
//! casts expand into saturating sequences so out-of-range values and NaN get
//! well-defined results on every target.

use super::Lowering;
use crate::contain;
use crate::hwi::Hwi;
use crate::isa::IsaFlags;
use crate::types::lir::{Binop, Kind, NodeId, Unop, VecConst};
use crate::types::{BaseTy, Ty, VecLen};

impl Lowering<'_> {
  pub(super) fn lower_cast(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::Cast { src, from, to } = self.f.nodes[n].kind else { unreachable!() };
    if from.is_float() && !to.is_float() {
      return self.lower_sat_float_cast(n, src, from, to)
    }
    if !contain::try_contain_mem(self.f, &mut self.acc, self.bl, n, src) {
      contain::try_reg_optional(self.f, self.bl, n, src);
    }
    self.f.next(n)
  }

  /// Expand a float-to-integer cast. With AVX10.2 this is a single saturating
  /// conversion instruction; otherwise it becomes a compare-and-blend sequence
  /// around the truncating conversion. NaN maps to zero, overflow clamps to
  /// the extreme value of the target type.
  fn lower_sat_float_cast(
    &mut self, n: NodeId, src: NodeId, from: BaseTy, to: BaseTy,
  ) -> Option<NodeId> {
    // narrow targets convert through 32 bits; the result wraps into the
    // narrow type like any other integer truncation
    let wide = if to.is_small_int() {
      if to.is_signed() { BaseTy::I32 } else { BaseTy::U32 }
    } else { to };

    if self.isa.has(IsaFlags::AVX10V2) {
      let id = match wide {
        BaseTy::I32 => Hwi::ConvertToInt32WithTruncationSaturation,
        BaseTy::U32 => Hwi::ConvertToUInt32WithTruncationSaturation,
        BaseTy::I64 => Hwi::ConvertToInt64WithTruncationSaturation,
        _ => Hwi::ConvertToUInt64WithTruncationSaturation,
      };
      if to.is_small_int() {
        let cvt = self.hwi_before(n, Ty::Scalar(wide), id, from, VecLen::V16, [src]);
        self.f.retype(n, Ty::Scalar(to), Kind::Cast { src: cvt, from: wide, to });
        return Some(cvt)
      }
      self.retype_hwi(n, Ty::Scalar(wide), id, from, VecLen::V16, [src]);
      return Some(n)
    }

    let res = if wide.is_signed() {
      self.sat_cast_signed(n, src, from, wide)
    } else {
      self.sat_cast_unsigned(n, src, from, wide)
    };
    if to.is_small_int() {
      self.f.retype(n, Ty::Scalar(to), Kind::Cast { src: res.1, from: wide, to });
    } else {
      self.replace_value(n, res.1);
    }
    Some(res.0)
  }

  /// Signed saturation: zero NaN with an ordered-compare mask, convert, then
  /// flip the invalid-result marker `INT_MIN` to `INT_MAX` when the input was
  /// at or above the positive bound.
  fn sat_cast_signed(
    &mut self, n: NodeId, src: NodeId, from: BaseTy, to: BaseTy,
  ) -> (NodeId, NodeId) {
    let sty = Ty::Scalar(to);
    let bits = if to == BaseTy::I64 { 63 } else { 31 };
    let max = if to == BaseTy::I64 { i64::MAX } else { i64::from(i32::MAX) };
    let v16 = Ty::Vec(VecLen::V16);
    let sv = self.scalar_to_vec(n, from, src);
    let ord = self.hwi_before(n, v16, Hwi::CompareOrdered, from, VecLen::V16, [sv, sv]);
    let fixed = self.hwi_before(n, v16, Hwi::And, from, VecLen::V16, [sv, ord]);
    let cvt = self.hwi_before(n, sty, self.cvt_id(to), from, VecLen::V16, [fixed]);
    // cvttss2si yields INT_MIN for any out-of-range input; inputs >= 2^bits
    // must read INT_MAX instead
    let bound = self.flt_lane_con(n, from, pow2_bits(from, bits));
    let over = self.hwi_before(n, v16, Hwi::CompareLessThanOrEqual, from, VecLen::V16,
      [bound, fixed]);
    let ms = self.hwi_before(n, Ty::Scalar(BaseTy::I32), Hwi::MoveMask, from, VecLen::V16, [over]);
    // only lane 0 of the compare is meaningful
    let one = self.icon_before(n, to, 1);
    let m1 = self.emit_before(n, sty, Kind::Binop(Binop::And, ms, one));
    let neg = self.emit_before(n, sty, Kind::Unop(Unop::Neg, m1));
    let maxc = self.icon_before(n, to, max);
    let xr = self.emit_before(n, sty, Kind::Binop(Binop::Xor, cvt, maxc));
    let an = self.emit_before(n, sty, Kind::Binop(Binop::And, xr, neg));
    let res = self.emit_before(n, sty, Kind::Binop(Binop::Xor, an, cvt));
    (sv, res)
  }

  /// Unsigned saturation via the signed converter: values in the upper half
  /// of the range convert shifted down by `2^bits` and get the high bit from
  /// the signed converter's invalid marker; overflow ORs in all-ones.
  fn sat_cast_unsigned(
    &mut self, n: NodeId, src: NodeId, from: BaseTy, to: BaseTy,
  ) -> (NodeId, NodeId) {
    let sty = Ty::Scalar(to);
    let (signed, bits) = if to == BaseTy::U64 { (BaseTy::I64, 63) } else { (BaseTy::I32, 31) };
    let v16 = Ty::Vec(VecLen::V16);
    let sv = self.scalar_to_vec(n, from, src);
    // maxss picks the second operand for NaN, so NaN and negatives become 0
    let zero = self.flt_lane_con(n, from, 0);
    let fixed = self.hwi_before(n, v16, Hwi::MaxScalar, from, VecLen::V16, [sv, zero]);
    let rz = if self.isa.has(IsaFlags::SSE41) {
      self.hwi_before(n, v16, Hwi::RoundToZeroScalar, from, VecLen::V16, [fixed])
    } else if from == BaseTy::F64 && to == BaseTy::U32 {
      // clear the sub-integer mantissa bits so the shifted-down convert
      // cannot round across the 2^31 boundary
      let m = self.flt_lane_con(n, from, u64::MAX << 21);
      self.hwi_before(n, v16, Hwi::And, from, VecLen::V16, [fixed, m])
    } else {
      fixed
    };
    let cvt1 = self.hwi_before(n, Ty::Scalar(signed), self.cvt_id(signed), from, VecLen::V16, [rz]);
    let shift = self.flt_lane_con(n, from, pow2_bits(from, bits));
    let adj = self.hwi_before(n, v16, Hwi::SubtractScalar, from, VecLen::V16, [rz, shift]);
    let cvt2 = self.hwi_before(n, Ty::Scalar(signed), self.cvt_id(signed), from, VecLen::V16,
      [adj]);
    // the sign of cvt1 selects between the low-half result and the shifted
    // high-half result
    let sh = self.icon_before(n, BaseTy::I32, bits.into());
    let sign = self.emit_before(n, sty, Kind::Binop(Binop::Sar, cvt1, sh));
    let an = self.emit_before(n, sty, Kind::Binop(Binop::And, sign, cvt2));
    let or = self.emit_before(n, sty, Kind::Binop(Binop::Or, cvt1, an));
    let bound = self.flt_lane_con(n, from, pow2_bits(from, bits + 1));
    let over = self.hwi_before(n, v16, Hwi::CompareLessThanOrEqual, from, VecLen::V16,
      [bound, rz]);
    let ms = self.hwi_before(n, Ty::Scalar(BaseTy::I32), Hwi::MoveMask, from, VecLen::V16, [over]);
    let one = self.icon_before(n, to, 1);
    let m1 = self.emit_before(n, sty, Kind::Binop(Binop::And, ms, one));
    let neg = self.emit_before(n, sty, Kind::Unop(Unop::Neg, m1));
    let res = self.emit_before(n, sty, Kind::Binop(Binop::Or, or, neg));
    (sv, res)
  }

  fn cvt_id(&self, to: BaseTy) -> Hwi {
    if to.size().bytes() == 8 { Hwi::ConvertToInt64WithTruncation }
    else { Hwi::ConvertToInt32WithTruncation }
  }

  /// A 128-bit constant with the given bit pattern in lane 0.
  fn flt_lane_con(&mut self, anchor: NodeId, base: BaseTy, bits: u64) -> NodeId {
    let mut c = VecConst::zero(VecLen::V16);
    c.set_lane(base, 0, bits);
    let v = self.f.vec_con(c);
    self.f.insert_before(self.bl, anchor, v);
    v
  }
}

/// The bit pattern of `2.0^exp` in the given float format.
fn pow2_bits(base: BaseTy, exp: u32) -> u64 {
  if base == BaseTy::F32 { u64::from(127 + exp) << 23 } else { u64::from(1023 + exp) << 52 }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use crate::hwi::Hwi;
  use crate::isa::{Isa, IsaFlags, LowerConfig};
  use crate::lower;
  use crate::types::layout::Local;
  use crate::types::lir::{Function, Kind};
  use crate::types::{BaseTy, Ty};

  fn cast_block(from: BaseTy, to: BaseTy)
    -> (Function, crate::types::lir::BlockId, crate::types::lir::NodeId)
  {
    let mut f = Function::new();
    let bl = f.new_block();
    let lcl = f.locals.push(Local::scalar(Ty::Scalar(from), from.bytes()));
    let x = f.lcl_var(lcl);
    let c = f.new_node(Ty::Scalar(to), Kind::Cast { src: x, from, to });
    let dst = f.locals.push(Local::scalar(Ty::Scalar(to), to.bytes()));
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, c));
    for n in [x, c, st] { f.append(bl, n) }
    (f, bl, c)
  }

  #[test]
  fn float_to_int_expands_saturating_sequence() {
    let (mut f, bl, c) = cast_block(BaseTy::F32, BaseTy::I32);
    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

    let kinds: Vec<_> = f.block_iter(bl)
      .filter_map(|n| f.nodes[n].hwi().map(|h| h.id)).collect();
    assert!(kinds.contains(&Hwi::CreateScalarUnsafe));
    assert!(kinds.contains(&Hwi::CompareOrdered));
    assert!(kinds.contains(&Hwi::ConvertToInt32WithTruncation));
    assert!(kinds.contains(&Hwi::CompareLessThanOrEqual));
    assert!(kinds.contains(&Hwi::MoveMask));
    // the cast node itself was replaced, not retyped
    assert!(f.find_use(bl, c).is_none());
  }

  #[test]
  fn float_to_uint_uses_two_conversions() {
    let (mut f, bl, _) = cast_block(BaseTy::F64, BaseTy::U64);
    let isa = Isa::new(IsaFlags::SSE41, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    let kinds: Vec<_> = f.block_iter(bl)
      .filter_map(|n| f.nodes[n].hwi().map(|h| h.id)).collect();
    assert_eq!(
      kinds.iter().filter(|&&k| k == Hwi::ConvertToInt64WithTruncation).count(), 2);
    assert!(kinds.contains(&Hwi::MaxScalar));
    assert!(kinds.contains(&Hwi::RoundToZeroScalar));
    assert!(kinds.contains(&Hwi::SubtractScalar));
  }

  #[test]
  fn avx10_uses_saturating_instruction() {
    let (mut f, bl, c) = cast_block(BaseTy::F32, BaseTy::U32);
    let isa = Isa::new(IsaFlags::AVX10V2, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    let h = f.nodes[c].hwi().unwrap();
    assert_eq!(h.id, Hwi::ConvertToUInt32WithTruncationSaturation);
    // the whole fallback ladder is absent
    let count = f.block_iter(bl).filter(|&n| f.nodes[n].hwi().is_some()).count();
    assert_eq!(count, 1);
  }

  #[test]
  fn int_cast_contains_memory_source() {
    let mut f = Function::new();
    let bl = f.new_block();
    let ptr = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U64), 8));
    let p = f.lcl_var(ptr);
    let ld = f.ind(Ty::Scalar(BaseTy::I16), p);
    let c = f.new_node(Ty::Scalar(BaseTy::I64),
      Kind::Cast { src: ld, from: BaseTy::I16, to: BaseTy::I64 });
    let dst = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8));
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, c));
    for n in [p, ld, c, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());
    assert!(f.nodes[ld].contained());
  }
}
