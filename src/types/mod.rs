//! Types used by the rest of the crate: index vectors, value types, condition codes.

pub mod layout;
pub mod lir;

use std::fmt::Debug;
use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

/// A trait for newtyped integers that can be used as index types.
pub trait Idx: Copy + Eq {
  /// Convert from `T` to `usize`
  fn into_usize(self) -> usize;
  /// Convert from `usize` to `T`
  fn from_usize(_: usize) -> Self;
  /// Generate a fresh variable from a `&mut ID` counter.
  #[must_use] fn fresh(&mut self) -> Self {
    let n = *self;
    *self = Self::from_usize(self.into_usize() + 1);
    n
  }
}

impl Idx for usize {
  fn into_usize(self) -> usize { self }
  fn from_usize(n: usize) -> Self { n }
}

/// A vector indexed by a custom indexing type `I`, usually a newtyped integer.
pub struct IdxVec<I, T>(pub Vec<T>, PhantomData<I>);

impl<I, T: Debug> Debug for IdxVec<I, T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.0.fmt(f) }
}

impl<I, T: Clone> Clone for IdxVec<I, T> {
  fn clone(&self) -> Self { Self(self.0.clone(), PhantomData) }
}

impl<I, T> IdxVec<I, T> {
  /// Construct a new empty [`IdxVec`].
  #[must_use] pub const fn new() -> Self { Self(Vec::new(), PhantomData) }

  /// Construct a new [`IdxVec`] with the specified capacity.
  #[must_use] pub fn with_capacity(capacity: usize) -> Self { Vec::with_capacity(capacity).into() }

  /// Construct a new [`IdxVec`] by calling the specified function.
  #[must_use] pub fn from_fn(size: usize, f: impl FnMut() -> T) -> Self {
    Self::from(std::iter::repeat_with(f).take(size).collect::<Vec<_>>())
  }

  /// Construct a new [`IdxVec`] using the default element for each index.
  #[must_use] pub fn from_default(size: usize) -> Self where T: Default {
    Self::from_fn(size, T::default)
  }

  /// The number of elements in the [`IdxVec`].
  #[must_use] pub fn len(&self) -> usize { self.0.len() }

  /// Whether the vector is empty.
  #[must_use] pub fn is_empty(&self) -> bool { self.0.is_empty() }

  /// Insert a new value at the end of the vector.
  pub fn push(&mut self, val: T) -> I where I: Idx {
    let id = self.peek();
    self.0.push(val);
    id
  }

  /// Grow the vector until it is long enough that `vec.push()` will return `i`.
  pub fn extend_to_include(&mut self, i: I) where I: Idx, T: Default {
    let n = i.into_usize();
    if n >= self.0.len() { self.0.resize_with(n + 1, T::default) }
  }

  /// Get the element with index `i`, if it exists.
  #[must_use] pub fn get(&self, i: I) -> Option<&T> where I: Idx { self.0.get(i.into_usize()) }

  /// Get the element with index `i` mutably, if it exists.
  #[must_use] pub fn get_mut(&mut self, i: I) -> Option<&mut T> where I: Idx {
    self.0.get_mut(i.into_usize())
  }

  /// Returns the value that will be returned by the next call to `push`.
  #[must_use] pub fn peek(&self) -> I where I: Idx { I::from_usize(self.0.len()) }

  /// An iterator including the indexes, like `iter().enumerate()`, as `I`.
  pub fn enum_iter(&self) -> impl DoubleEndedIterator<Item = (I, &T)> + Clone where I: Idx {
    self.0.iter().enumerate().map(|(n, val)| (I::from_usize(n), val))
  }

  /// An iterator including the indexes, like `iter_mut().enumerate()`, as `I`.
  pub fn enum_iter_mut(&mut self) -> impl DoubleEndedIterator<Item = (I, &mut T)> where I: Idx {
    self.0.iter_mut().enumerate().map(|(n, val)| (I::from_usize(n), val))
  }
}

impl<I, T> From<Vec<T>> for IdxVec<I, T> {
  fn from(vec: Vec<T>) -> Self { Self(vec, PhantomData) }
}

impl<I, T> std::iter::FromIterator<T> for IdxVec<I, T> {
  fn from_iter<J: IntoIterator<Item = T>>(iter: J) -> Self { Vec::from_iter(iter).into() }
}

impl<I, T> Default for IdxVec<I, T> {
  fn default() -> Self { Vec::new().into() }
}

impl<I: Idx, T> Index<I> for IdxVec<I, T> {
  type Output = T;
  #[track_caller] fn index(&self, index: I) -> &T { &self.0[index.into_usize()] }
}

impl<I: Idx, T> IndexMut<I> for IdxVec<I, T> {
  #[track_caller] fn index_mut(&mut self, index: I) -> &mut T { &mut self.0[index.into_usize()] }
}

/// The size of a scalar machine operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Size {
  /// 1 byte
  S8,
  /// 2 bytes
  S16,
  /// 4 bytes
  S32,
  /// 8 bytes
  S64,
}

impl Size {
  /// The number of bytes of the operand.
  #[must_use] pub fn bytes(self) -> u32 {
    match self {
      Size::S8 => 1,
      Size::S16 => 2,
      Size::S32 => 4,
      Size::S64 => 8,
    }
  }

  /// The number of bits of the operand.
  #[must_use] pub fn bits(self) -> u32 { 8 * self.bytes() }

  /// The size that fits a value of `n` bytes, if `n` is an operand size.
  #[must_use] pub fn from_bytes(n: u32) -> Option<Size> {
    match n {
      1 => Some(Size::S8),
      2 => Some(Size::S16),
      4 => Some(Size::S32),
      8 => Some(Size::S64),
      _ => None,
    }
  }
}

/// The lane type of a vector, which doubles as the type of a scalar register value.
/// Sub-32-bit types keep their signedness because sign/zero extension on load and
/// extract depends on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BaseTy {
  /// Signed 8 bit integer
  I8,
  /// Unsigned 8 bit integer
  U8,
  /// Signed 16 bit integer
  I16,
  /// Unsigned 16 bit integer
  U16,
  /// Signed 32 bit integer
  I32,
  /// Unsigned 32 bit integer
  U32,
  /// Signed 64 bit integer
  I64,
  /// Unsigned 64 bit integer
  U64,
  /// 32 bit IEEE float
  F32,
  /// 64 bit IEEE float
  F64,
}

impl BaseTy {
  /// The operand size of this type.
  #[must_use] pub fn size(self) -> Size {
    match self {
      BaseTy::I8 | BaseTy::U8 => Size::S8,
      BaseTy::I16 | BaseTy::U16 => Size::S16,
      BaseTy::I32 | BaseTy::U32 | BaseTy::F32 => Size::S32,
      BaseTy::I64 | BaseTy::U64 | BaseTy::F64 => Size::S64,
    }
  }

  /// The number of bytes in a value of this type.
  #[must_use] pub fn bytes(self) -> u32 { self.size().bytes() }

  /// Is this a floating point type?
  #[must_use] pub fn is_float(self) -> bool { matches!(self, BaseTy::F32 | BaseTy::F64) }

  /// Is this a signed integer type? (Floats are neither signed nor unsigned here.)
  #[must_use] pub fn is_signed(self) -> bool {
    matches!(self, BaseTy::I8 | BaseTy::I16 | BaseTy::I32 | BaseTy::I64)
  }

  /// Is this an integer type of less than 4 bytes?
  #[must_use] pub fn is_small_int(self) -> bool {
    matches!(self, BaseTy::I8 | BaseTy::U8 | BaseTy::I16 | BaseTy::U16)
  }

  /// The unsigned integer type of the same width.
  #[must_use] pub fn to_unsigned(self) -> BaseTy {
    match self {
      BaseTy::I8 => BaseTy::U8,
      BaseTy::I16 => BaseTy::U16,
      BaseTy::I32 => BaseTy::U32,
      BaseTy::I64 => BaseTy::U64,
      ty => ty,
    }
  }

  /// The signed integer type of the same width.
  #[must_use] pub fn to_signed(self) -> BaseTy {
    match self {
      BaseTy::U8 => BaseTy::I8,
      BaseTy::U16 => BaseTy::I16,
      BaseTy::U32 => BaseTy::I32,
      BaseTy::U64 => BaseTy::I64,
      ty => ty,
    }
  }
}

/// The byte length of a vector value. `V12` is the 3-float case; it occupies a full
/// 16 byte register but only 12 bytes of memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VecLen {
  /// 8 bytes (two floats, or a half vector)
  V8,
  /// 12 bytes (three floats)
  V12,
  /// 16 bytes (a full XMM register)
  V16,
  /// 32 bytes (a YMM register)
  V32,
  /// 64 bytes (a ZMM register)
  V64,
}

impl VecLen {
  /// The number of bytes of memory a value of this length occupies.
  #[must_use] pub fn bytes(self) -> u32 {
    match self {
      VecLen::V8 => 8,
      VecLen::V12 => 12,
      VecLen::V16 => 16,
      VecLen::V32 => 32,
      VecLen::V64 => 64,
    }
  }

  /// The number of bytes of the register holding a value of this length.
  #[must_use] pub fn reg_bytes(self) -> u32 {
    match self {
      VecLen::V8 | VecLen::V12 | VecLen::V16 => 16,
      VecLen::V32 => 32,
      VecLen::V64 => 64,
    }
  }

  /// The number of lanes of type `base` in a vector of this length.
  #[must_use] pub fn lanes(self, base: BaseTy) -> u32 { self.bytes() / base.bytes() }

  /// The vector length of `n` bytes.
  #[must_use] pub fn from_bytes(n: u32) -> Option<VecLen> {
    match n {
      8 => Some(VecLen::V8),
      12 => Some(VecLen::V12),
      16 => Some(VecLen::V16),
      32 => Some(VecLen::V32),
      64 => Some(VecLen::V64),
      _ => None,
    }
  }
}

/// The type of a value produced by an IR node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ty {
  /// No value (stores, calls returning nothing, branches).
  Void,
  /// A scalar integer or float.
  Scalar(BaseTy),
  /// An object reference, reported to the GC.
  Ref,
  /// A managed interior pointer, reported to the GC.
  Byref,
  /// A struct value; its shape lives in a [`layout::ClassLayout`].
  Struct,
  /// A SIMD value of the given width.
  Vec(VecLen),
  /// An EVEX predicate mask.
  Mask,
}

impl Ty {
  /// The size in bytes of a value of this type, if it is independent of a layout.
  #[must_use] pub fn size(self) -> Option<u32> {
    match self {
      Ty::Void => Some(0),
      Ty::Scalar(b) => Some(b.bytes()),
      Ty::Ref | Ty::Byref => Some(8),
      Ty::Vec(len) => Some(len.bytes()),
      Ty::Struct | Ty::Mask => None,
    }
  }

  /// Is this a GC-visible pointer type?
  #[must_use] pub fn is_gc(self) -> bool { matches!(self, Ty::Ref | Ty::Byref) }

  /// Is this a floating point scalar?
  #[must_use] pub fn is_float(self) -> bool { matches!(self, Ty::Scalar(b) if b.is_float()) }

  /// Is this an integral scalar or GC pointer (a value that lives in a GPR)?
  #[must_use] pub fn is_gpr(self) -> bool {
    match self {
      Ty::Scalar(b) => !b.is_float(),
      Ty::Ref | Ty::Byref => true,
      _ => false,
    }
  }

  /// The lane type, if this is a scalar.
  #[must_use] pub fn scalar(self) -> BaseTy {
    if let Ty::Scalar(b) = self { b } else { panic!("scalar type expected, got {self:?}") }
  }

  /// The vector length, if this is a vector.
  #[must_use] pub fn vec_len(self) -> VecLen {
    if let Ty::Vec(len) = self { len } else { panic!("vector type expected, got {self:?}") }
  }
}

/// These are the condition codes used in x86 conditional set and jump instructions,
/// in the order of the underlying encoding.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CC {
  /// Overflow
  O = 0,
  /// No Overflow
  NO = 1,
  /// `<` Unsigned (Below, Carry Set)
  B = 2,
  /// `>=` Unsigned (Not Below, Carry Clear)
  NB = 3,
  /// Zero (Equal)
  Z = 4,
  /// Not Zero (Not Equal)
  NZ = 5,
  /// `<=` Unsigned (Below or Equal)
  BE = 6,
  /// `>` Unsigned (Not Below or Equal)
  NBE = 7,
  /// Sign (negative)
  S = 8,
  /// No Sign (nonnegative)
  NS = 9,
  /// Parity even
  P = 10,
  /// Parity odd
  NP = 11,
  /// `<` Signed (Less)
  L = 12,
  /// `>=` Signed (Not Less)
  NL = 13,
  /// `<=` Signed (Less or Equal)
  LE = 14,
  /// `>` Signed (Not Less or Equal)
  NLE = 15,
}

impl CC {
  /// Flips the direction of the test, `cc(x) <-> !cc(x)`.
  #[must_use] pub fn invert(self) -> Self {
    match self {
      CC::O => CC::NO,
      CC::NO => CC::O,
      CC::B => CC::NB,
      CC::NB => CC::B,
      CC::Z => CC::NZ,
      CC::NZ => CC::Z,
      CC::BE => CC::NBE,
      CC::NBE => CC::BE,
      CC::S => CC::NS,
      CC::NS => CC::S,
      CC::P => CC::NP,
      CC::NP => CC::P,
      CC::L => CC::NL,
      CC::NL => CC::L,
      CC::LE => CC::NLE,
      CC::NLE => CC::LE,
    }
  }

  /// The test that holds for `b ? a` whenever this test holds for `a ? b`,
  /// used when a comparison's operands are swapped.
  #[must_use] pub fn commute(self) -> Self {
    match self {
      CC::B => CC::NBE,
      CC::NBE => CC::B,
      CC::NB => CC::BE,
      CC::BE => CC::NB,
      CC::L => CC::NLE,
      CC::NLE => CC::L,
      CC::NL => CC::LE,
      CC::LE => CC::NL,
      cc => cc,
    }
  }

  /// Is this a signed comparison (so that operands must be sign extended)?
  #[must_use] pub fn is_signed(self) -> bool {
    matches!(self, CC::L | CC::NL | CC::LE | CC::NLE | CC::S | CC::NS | CC::O | CC::NO)
  }
}
