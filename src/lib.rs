//! Instruction selection and operand containment for x86-64.
//!
//! This crate implements the lowering pass of a JIT compiler backend. It
//! rewrites a per-function linear IR ([`types::lir::Function`]) in place so
//! that every remaining node maps onto one (or a short fixed sequence of)
//! x86-64 instructions, and so that operand placement is explicit: children
//! that will be consumed as memory or immediate operands are *contained*,
//! children the register allocator may spill are *reg-optional*. The pass
//! runs after the middle end and before register allocation; see
//! [`lower::run`] for the entry point.

// rust lints we want
#![warn(
  bare_trait_objects,
  elided_lifetimes_in_paths,
  missing_copy_implementations,
  missing_debug_implementations,
  future_incompatible,
  rust_2018_idioms,
  trivial_numeric_casts,
  variant_size_differences,
  unreachable_pub,
  unused,
  missing_docs
)]
// all the clippy
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
// all the clippy::restriction lints we want
#![warn(
  clippy::get_unwrap,
  clippy::inline_asm_x86_att_syntax,
  clippy::rc_buffer,
  clippy::rest_pat_in_fully_bound_structs,
  clippy::string_add,
  clippy::unwrap_used,
)]
// all the clippy lints we don't want
#![allow(
  clippy::cognitive_complexity,
  clippy::comparison_chain,
  clippy::default_trait_access,
  clippy::enum_glob_use,
  clippy::inline_always,
  clippy::manual_map,
  clippy::match_bool,
  clippy::missing_const_for_fn,
  clippy::missing_errors_doc,
  clippy::missing_panics_doc,
  clippy::module_name_repetitions,
  clippy::multiple_crate_versions,
  clippy::option_if_let_else,
  clippy::redundant_pub_crate,
  clippy::semicolon_if_nothing_returned,
  clippy::shadow_unrelated,
  clippy::similar_names,
  clippy::too_many_lines,
  clippy::use_self
)]

macro_rules! mk_id {
  (@debug $id:ident ($prefix:literal)) => {
    impl std::fmt::Debug for $id {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, concat!($prefix, "{}"), self.0)
      }
    }
  };
  (@debug $id:ident) => {
    impl std::fmt::Debug for $id {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, concat!(stringify!($id), "({})"), self.0)
      }
    }
  };
  ($($(#[$attr:meta])* $id:ident $((Debug($prefix:literal)))?),* $(,)?) => {$(
    $(#[$attr])*
    #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct $id(pub u32);
    mk_id!(@debug $id $(($prefix))?);
    impl $id {
      /// Generate a fresh ID from a `&mut ID` counter.
      #[must_use] #[inline] pub fn fresh(&mut self) -> Self {
        let n = *self;
        self.0 += 1;
        n
      }
    }
    impl From<$id> for usize {
      fn from(id: $id) -> usize { crate::u32_as_usize(id.0) }
    }
    impl crate::types::Idx for $id {
      fn into_usize(self) -> usize { self.into() }
      fn from_usize(n: usize) -> Self { $id(std::convert::TryFrom::try_from(n).expect("overflow")) }
    }
  )*};
}

#[macro_use] extern crate bitflags;
#[macro_use] extern crate if_chain;

pub mod types;
pub mod isa;
pub mod hwi;
mod addr;
mod contain;
mod rmw;
mod evex;
pub mod lower;
pub mod check;

pub use types::Idx;

/// Convert a `u32` into `usize`, panicking on 16 bit targets where it may not fit.
#[inline]
#[must_use]
pub(crate) fn u32_as_usize(n: u32) -> usize {
  n.try_into().expect("usize is at least 32 bits")
}
