//! The closed set of hardware intrinsics the pass emits and rewrites, with the
//! per-intrinsic metadata the containment and folding code consults: operand
//! count, immediate slot, commutativity, memory-operand and embedded-broadcast
//! compatibility. All metadata is a pure function of the tag.
//!
//! Also home of the ternary-logic control byte algebra ([`ternlog`]): an 8-bit
//! truth table over the inputs `A = 0xF0`, `B = 0xCC`, `C = 0xAA`.

use crate::types::BaseTy;

/// A hardware intrinsic id. The name states the operation; the instruction-set
/// family and width are determined by the [`HwiNode`](crate::types::lir::HwiNode)'s
/// base type and vector size together with the target ISA.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Hwi {
  // -- frontend forms, always rewritten by lowering ------------------------
  /// Per-element select `cond ? a : b`.
  ConditionalSelect,
  /// Are all elements of two vectors equal (scalar bool result)?
  Equality,
  /// Is any element of two vectors unequal (scalar bool result)?
  Inequality,
  /// Dot product of two vectors (scalar result).
  Dot,

  // -- construction --------------------------------------------------------
  /// Broadcast a scalar, or build a vector from per-lane scalars (frontend form;
  /// always rewritten by lowering).
  Create,
  /// A scalar in lane 0 with upper lanes zeroed (frontend form).
  CreateScalar,
  /// A scalar in lane 0 with upper lanes undefined.
  CreateScalarUnsafe,
  /// `vpbroadcast*`/`vbroadcastss` of lane 0 of a 128-bit source into 128 bits.
  BroadcastScalarToVector128,
  /// Broadcast of lane 0 of a 128-bit source into 256 bits.
  BroadcastScalarToVector256,
  /// Broadcast of lane 0 of a 128-bit source into 512 bits.
  BroadcastScalarToVector512,
  /// Reinterpret a 128-bit vector as a wider one, upper lanes undefined.
  ToVectorUnsafe,
  /// Read lane 0 as a scalar.
  ToScalar,

  // -- element access ------------------------------------------------------
  /// Read lane `op1` (frontend form; rewritten unless the index is in range and
  /// the extract instruction exists).
  GetElement,
  /// Replace lane `op1` with `op2` (frontend form).
  WithElement,
  /// `pextrb/w/d/q`/`extractps`: read lane `imm` to a GPR.
  Extract,
  /// `pinsrb/w/d/q`/`insertps`: replace lane bits under `imm`.
  Insert,
  /// `vextracti/f128`: read 128-bit lane `imm` of a 256/512-bit vector.
  ExtractVector128,
  /// `vinserti/f128`: replace 128-bit lane `imm` of a 256/512-bit vector.
  InsertVector128,
  /// `vinserti/f64x4`: replace 256-bit half `imm` of a 512-bit vector.
  InsertVector256,
  /// The low 128 bits of a wider vector (no instruction; a register reuse).
  GetLower128,
  /// `movss` register form: lane 0 of `op1` into lane 0 of `op0`.
  MoveScalar,
  /// `pshufd`/`shufps` with control `imm`.
  Shuffle,
  /// `punpckl*`/`unpcklps`: interleave low lanes.
  UnpackLow,
  /// `punpckh*`/`unpckhps`: interleave high lanes.
  UnpackHigh,
  /// `movlhps`: move the low two floats into the high half.
  MoveLowToHigh,

  // -- bitwise and arithmetic ----------------------------------------------
  /// Element-wise addition.
  Add,
  /// Element-wise subtraction.
  Subtract,
  /// Element-wise low-half multiply (`pmulld`/`mulps`).
  Multiply,
  /// Bitwise and.
  And,
  /// Bitwise `~a & b` (`pandn`: complements its *first* operand).
  AndNot,
  /// Bitwise or.
  Or,
  /// Bitwise exclusive or.
  Xor,
  /// Element-wise maximum.
  Max,
  /// Element-wise minimum.
  Min,
  /// `maxss`/`maxsd` on lane 0: returns the second operand on NaN.
  MaxScalar,
  /// `subss`/`subsd` on lane 0.
  SubtractScalar,
  /// `haddps`/`phaddd`: pairwise horizontal add.
  HorizontalAdd,
  /// `dpps`/`dppd` with mask byte `imm`.
  DotProduct,
  /// `vpternlog` with control byte `imm`.
  TernaryLogic,

  // -- blends and masks ----------------------------------------------------
  /// `blendv*`: per-element select by the sign/MSB of the third operand.
  BlendVariable,
  /// EVEX masked blend: per-element select by a mask register.
  BlendVariableMask,
  /// `vpcmpeq*`: element-wise equality producing all-ones/all-zero lanes.
  CompareEqual,
  /// `vpcmpeqb/w/d/q {k}`: element-wise equality producing a mask.
  CompareEqualMask,
  /// Element-wise inequality producing a mask.
  CompareNotEqualMask,
  /// `cmpps imm=7`: ordered comparison (neither operand NaN) producing lanes.
  CompareOrdered,
  /// `cmpps imm=2`: less-or-equal comparison producing lanes.
  CompareLessThanOrEqual,
  /// `kortest`: or two masks and set ZF/CF.
  Kortest,
  /// `knot`.
  NotMask,
  /// `kshiftl` by `imm`.
  ShiftLeftMask,
  /// `kshiftr` by `imm`.
  ShiftRightMask,
  /// `movmskps`/`pmovmskb`: lane MSBs to a GPR.
  MoveMask,
  /// `ptest`: sets ZF from `a & b`, CF from `~a & b`.
  Ptest,
  /// `vptestm*`: mask of the lanes where `a & b` is nonzero.
  TestMask,

  // -- fused multiply-add --------------------------------------------------
  /// `vfmadd`: `a * b + c`.
  MultiplyAdd,
  /// `vfnmadd`: `-(a * b) + c`.
  MultiplyAddNegated,
  /// `vfmsub`: `a * b - c`.
  MultiplySubtract,
  /// `vfnmsub`: `-(a * b) - c`.
  MultiplySubtractNegated,
  /// Scalar (lane 0) form of [`Hwi::MultiplyAdd`].
  MultiplyAddScalar,
  /// Scalar form of [`Hwi::MultiplyAddNegated`].
  MultiplyAddNegatedScalar,
  /// Scalar form of [`Hwi::MultiplySubtract`].
  MultiplySubtractScalar,
  /// Scalar form of [`Hwi::MultiplySubtractNegated`].
  MultiplySubtractNegatedScalar,

  // -- conversions ---------------------------------------------------------
  /// `cvttss2si`/`cvttsd2si` to a 32-bit GPR (overflow produces `0x8000_0000`).
  ConvertToInt32WithTruncation,
  /// `cvttss2si`/`cvttsd2si` to a 64-bit GPR.
  ConvertToInt64WithTruncation,
  /// AVX10.2 saturating truncating convert to i32.
  ConvertToInt32WithTruncationSaturation,
  /// AVX10.2 saturating truncating convert to u32.
  ConvertToUInt32WithTruncationSaturation,
  /// AVX10.2 saturating truncating convert to i64.
  ConvertToInt64WithTruncationSaturation,
  /// AVX10.2 saturating truncating convert to u64.
  ConvertToUInt64WithTruncationSaturation,
  /// `roundss`/`roundsd` toward zero on lane 0.
  RoundToZeroScalar,

  // -- scalar (GPR) intrinsics ---------------------------------------------
  /// BMI1 `andn`: `~op1 & op2` in GPRs.
  AndNotScalar,
  /// BMI1 `blsr`: `x & (x - 1)`.
  ResetLowestSetBit,
  /// BMI1 `blsi`: `x & -x`.
  ExtractLowestSetBit,
  /// BMI1 `blsmsk`: `x ^ (x - 1)`.
  GetMaskUpToLowestSetBit,
}

impl Hwi {
  /// The fixed operand count, including any immediate operand.
  /// [`Hwi::Create`] is variadic and reports its minimum.
  #[must_use] pub fn arity(self) -> usize {
    use Hwi::*;
    match self {
      Create | CreateScalar | CreateScalarUnsafe |
      BroadcastScalarToVector128 | BroadcastScalarToVector256 | BroadcastScalarToVector512 |
      ToVectorUnsafe | ToScalar | GetLower128 | NotMask | MoveMask | RoundToZeroScalar |
      ConvertToInt32WithTruncation | ConvertToInt64WithTruncation |
      ConvertToInt32WithTruncationSaturation | ConvertToUInt32WithTruncationSaturation |
      ConvertToInt64WithTruncationSaturation | ConvertToUInt64WithTruncationSaturation |
      ResetLowestSetBit | ExtractLowestSetBit | GetMaskUpToLowestSetBit => 1,
      Equality | Inequality | Dot |
      GetElement | Extract | ExtractVector128 | ShiftLeftMask | ShiftRightMask |
      Add | Subtract | Multiply | And | AndNot | Or | Xor | Max | Min |
      MaxScalar | SubtractScalar | HorizontalAdd | UnpackLow | UnpackHigh | MoveLowToHigh |
      MoveScalar | CompareEqual | CompareEqualMask | CompareNotEqualMask |
      CompareOrdered | CompareLessThanOrEqual | Kortest | Ptest | TestMask | AndNotScalar => 2,
      ConditionalSelect | WithElement | Insert | InsertVector128 | InsertVector256 |
      Shuffle | DotProduct | BlendVariable | BlendVariableMask => 3,
      TernaryLogic => 4,
      MultiplyAdd | MultiplyAddNegated | MultiplySubtract | MultiplySubtractNegated |
      MultiplyAddScalar | MultiplyAddNegatedScalar |
      MultiplySubtractScalar | MultiplySubtractNegatedScalar => 3,
    }
  }

  /// The operand slot that must be an integer constant encoded as an immediate,
  /// if the instruction has one.
  #[must_use] pub fn imm_slot(self) -> Option<u8> {
    use Hwi::*;
    match self {
      Extract | ExtractVector128 | GetElement | ShiftLeftMask | ShiftRightMask => Some(1),
      Insert | InsertVector128 | InsertVector256 | Shuffle | DotProduct => Some(2),
      TernaryLogic => Some(3),
      _ => None,
    }
  }

  /// Is the operation invariant under swapping its first two operands?
  #[must_use] pub fn commutative(self) -> bool {
    use Hwi::*;
    matches!(self,
      Equality | Inequality | Add | Multiply | And | Or | Xor |
      CompareEqual | CompareEqualMask | CompareNotEqualMask | Kortest | TestMask)
  }

  /// Is this handled by the emitter's instruction table (and so a candidate for
  /// embedded-mask folding under [`Hwi::BlendVariableMask`])?
  #[must_use] pub fn table_driven(self) -> bool {
    use Hwi::*;
    matches!(self,
      Add | Subtract | Multiply | And | AndNot | Or | Xor | Max | Min |
      HorizontalAdd | UnpackLow | UnpackHigh | Shuffle | TernaryLogic |
      CompareEqual | MultiplyAdd | MultiplyAddNegated |
      MultiplySubtract | MultiplySubtractNegated)
  }

  /// May one (conventionally the last non-immediate) operand be a contained
  /// memory operand?
  #[must_use] pub fn one_mem_op(self) -> bool {
    use Hwi::*;
    self.table_driven() || matches!(self,
      MaxScalar | SubtractScalar | DotProduct | BlendVariable | BlendVariableMask |
      CompareEqualMask | CompareNotEqualMask | CompareOrdered | CompareLessThanOrEqual |
      Ptest | TestMask | RoundToZeroScalar |
      ConvertToInt32WithTruncation | ConvertToInt64WithTruncation |
      ConvertToInt32WithTruncationSaturation | ConvertToUInt32WithTruncationSaturation |
      ConvertToInt64WithTruncationSaturation | ConvertToUInt64WithTruncationSaturation |
      AndNotScalar | ResetLowestSetBit | ExtractLowestSetBit | GetMaskUpToLowestSetBit)
  }

  /// The memory-operand slot for [`Hwi::one_mem_op`] intrinsics: the last
  /// operand slot that is not the immediate.
  #[must_use] pub fn mem_slot(self) -> u8 {
    debug_assert!(self.one_mem_op());
    let n = self.arity() as u8 - 1;
    match self.imm_slot() {
      Some(imm) if imm == n => n - 1,
      _ => n,
    }
  }

  /// Does the EVEX encoding of this operation accept an embedded-broadcast
  /// memory operand of lane type `base`? Broadcast needs 32- or 64-bit lanes.
  #[must_use] pub fn emb_broadcast_ok(self, base: BaseTy) -> bool {
    use Hwi::*;
    !base.is_small_int() && matches!(self,
      Add | Subtract | Multiply | And | AndNot | Or | Xor | Max | Min | TernaryLogic |
      CompareEqual | CompareEqualMask | CompareNotEqualMask |
      CompareOrdered | CompareLessThanOrEqual |
      MultiplyAdd | MultiplyAddNegated | MultiplySubtract | MultiplySubtractNegated)
  }

  /// Does this intrinsic produce a mask register value?
  #[must_use] pub fn produces_mask(self) -> bool {
    use Hwi::*;
    matches!(self,
      CompareEqualMask | CompareNotEqualMask | TestMask |
      NotMask | ShiftLeftMask | ShiftRightMask)
  }

  /// The operand slot that consumes a mask register value, if any.
  #[must_use] pub fn mask_slot(self) -> Option<u8> {
    use Hwi::*;
    match self {
      BlendVariableMask => Some(2),
      NotMask | ShiftLeftMask | ShiftRightMask => Some(0),
      Kortest => Some(0), // both operands are masks; slot 1 checked separately
      _ => None,
    }
  }

  /// Does operand slot `slot` accept a mask value?
  #[must_use] pub fn accepts_mask(self, slot: u8) -> bool {
    self.mask_slot() == Some(slot) || (self == Hwi::Kortest && slot == 1)
  }

  /// The FMA variant with the given sign pattern: `negated` flips the product,
  /// `subtract` flips the addend.
  #[must_use] pub fn fma_select(negated: bool, subtract: bool, scalar: bool) -> Hwi {
    use Hwi::*;
    match (negated, subtract, scalar) {
      (false, false, false) => MultiplyAdd,
      (true, false, false) => MultiplyAddNegated,
      (false, true, false) => MultiplySubtract,
      (true, true, false) => MultiplySubtractNegated,
      (false, false, true) => MultiplyAddScalar,
      (true, false, true) => MultiplyAddNegatedScalar,
      (false, true, true) => MultiplySubtractScalar,
      (true, true, true) => MultiplySubtractNegatedScalar,
    }
  }

  /// The `(negated, subtract, scalar)` sign pattern of an FMA variant, or `None`
  /// if this is not one.
  #[must_use] pub fn fma_signs(self) -> Option<(bool, bool, bool)> {
    use Hwi::*;
    match self {
      MultiplyAdd => Some((false, false, false)),
      MultiplyAddNegated => Some((true, false, false)),
      MultiplySubtract => Some((false, true, false)),
      MultiplySubtractNegated => Some((true, true, false)),
      MultiplyAddScalar => Some((false, false, true)),
      MultiplyAddNegatedScalar => Some((true, false, true)),
      MultiplySubtractScalar => Some((false, true, true)),
      MultiplySubtractNegatedScalar => Some((true, true, true)),
      _ => None,
    }
  }
}

/// The control byte algebra for `vpternlog`. A control byte is the truth table
/// of a 3-input Boolean function, read off at the inputs `A = 0xF0`, `B = 0xCC`,
/// `C = 0xAA`: bit `p` of the control is the function value at the minterm where
/// `(A, B, C) = (p>>2 & 1, p>>1 & 1, p & 1)`.
pub mod ternlog {
  use crate::types::lir::Binop;

  /// The truth table of input A.
  pub const A: u8 = 0xF0;
  /// The truth table of input B.
  pub const B: u8 = 0xCC;
  /// The truth table of input C.
  pub const C: u8 = 0xAA;
  /// The select control `A ? B : C`.
  pub const SELECT: u8 = 0xCA;

  /// Combine two truth tables with a bitwise operator. Evaluating expressions
  /// over [`A`], [`B`], [`C`] with this produces their control byte.
  #[must_use] pub fn apply(op: Binop, x: u8, y: u8) -> u8 {
    match op {
      Binop::And => x & y,
      Binop::Or => x | y,
      Binop::Xor => x ^ y,
      op => panic!("not a bitwise operator: {op:?}"),
    }
  }

  /// Evaluate the function at one input point.
  #[must_use] pub fn eval(ctrl: u8, a: bool, b: bool, c: bool) -> bool {
    ctrl >> (u8::from(a) << 2 | u8::from(b) << 1 | u8::from(c)) & 1 != 0
  }

  /// Which of (A, B, C) the function actually depends on.
  #[must_use] pub fn uses(ctrl: u8) -> (bool, bool, bool) {
    (ctrl >> 4 != ctrl & 0xf,
     (ctrl >> 2) & 0x33 != ctrl & 0x33,
     (ctrl >> 1) & 0x55 != ctrl & 0x55)
  }

  /// The control byte after permuting the instruction's operands:
  /// `perm[i]` names the input (0 = A, 1 = B, 2 = C) whose value now feeds
  /// slot `i`. The returned byte computes the same function of the original
  /// values when the operands are reordered the same way.
  #[must_use] pub fn permute(ctrl: u8, perm: [usize; 3]) -> u8 {
    let mut out = 0u8;
    for p in 0..8u8 {
      // values in the new slots at this minterm
      let new = [p >> 2 & 1, p >> 1 & 1, p & 1];
      // input `perm[i]` has the value of new slot `i`
      let mut old = [0u8; 3];
      for i in 0..3 { old[perm[i]] = new[i] }
      if ctrl >> (old[0] << 2 | old[1] << 1 | old[2]) & 1 != 0 { out |= 1 << p }
    }
    out
  }

  /// The control byte with inputs `i` and `j` swapped (matching a swap of the
  /// instruction's operands `i` and `j`).
  #[must_use] pub fn swap(ctrl: u8, i: usize, j: usize) -> u8 {
    let mut perm = [0, 1, 2];
    perm.swap(i, j);
    permute(ctrl, perm)
  }

  /// If the function is a pure select `x ? y : z` of three distinct inputs,
  /// return the slot indices `(x, y, z)`.
  #[must_use] pub fn as_select(ctrl: u8) -> Option<(usize, usize, usize)> {
    const PERMS: [[usize; 3]; 6] =
      [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    for [x, y, z] in PERMS {
      let inputs = [A, B, C];
      if (inputs[x] & inputs[y]) | (!inputs[x] & inputs[z]) == ctrl {
        return Some((x, y, z))
      }
    }
    None
  }

  /// Is the function the complement of a single input? Returns its slot.
  #[must_use] pub fn as_not(ctrl: u8) -> Option<usize> {
    [!A, !B, !C].iter().position(|&t| t == ctrl)
  }
}
