//! Struct layouts and local variable descriptors.

use bit_vec::BitVec;

use super::Ty;

mk_id! {
  /// A local variable of the function being lowered.
  LocalId(Debug("v")),
  /// A struct layout interned in the [`Function`](super::lir::Function).
  LayoutId(Debug("l")),
}

/// The shape of a struct type as the GC sees it: total size, 8-byte slots,
/// and which slots hold GC pointers.
#[derive(Clone, Debug)]
pub struct ClassLayout {
  /// The struct size in bytes. Not necessarily a multiple of 8.
  pub size: u32,
  /// One bit per 8-byte slot: is the slot a GC pointer?
  gc_slots: BitVec,
}

impl ClassLayout {
  /// A layout with no GC pointers.
  #[must_use] pub fn non_gc(size: u32) -> Self {
    Self { size, gc_slots: BitVec::from_elem(size.div_ceil(8) as usize, false) }
  }

  /// A layout with the given per-slot GC bits. `gc` must cover every 8-byte slot.
  #[must_use] pub fn with_gc_slots(size: u32, gc: &[bool]) -> Self {
    assert_eq!(gc.len(), size.div_ceil(8) as usize, "one bit per 8-byte slot");
    Self { size, gc_slots: gc.iter().copied().collect() }
  }

  /// The number of 8-byte slots.
  #[must_use] pub fn slots(&self) -> u32 { self.gc_slots.len() as u32 }

  /// Is slot `i` a GC pointer?
  #[must_use] pub fn is_gc_slot(&self, i: u32) -> bool {
    self.gc_slots.get(i as usize).expect("slot index in range")
  }

  /// Does any slot hold a GC pointer?
  #[must_use] pub fn has_gc(&self) -> bool { self.gc_slots.any() }

  /// The number of GC pointer slots.
  #[must_use] pub fn gc_count(&self) -> u32 {
    self.gc_slots.iter().filter(|&b| b).count() as u32
  }

  /// The length of the run of non-GC slots starting at `i`.
  #[must_use] pub fn non_gc_run(&self, i: u32) -> u32 {
    (i..self.slots()).take_while(|&j| !self.is_gc_slot(j)).count() as u32
  }
}

bitflags! {
  /// Facts about a local variable that lowering reads and (for the first two) sets.
  #[derive(Copy, Clone, Default, PartialEq, Eq)]
  pub struct LocalFlags: u8 {
    /// The local must live on the stack; struct field access and address
    /// exposure set this.
    const DO_NOT_ENREGISTER = 1;
    /// The address of the local escapes; implies `DO_NOT_ENREGISTER`.
    const ADDRESS_EXPOSED = 1 << 1;
    /// The local participates in liveness tracking.
    const TRACKED = 1 << 2;
  }
}

impl std::fmt::Debug for LocalFlags {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    bitflags::parser::to_writer(self, f)
  }
}

/// A local variable descriptor.
#[derive(Clone, Debug)]
pub struct Local {
  /// The type of the local.
  pub ty: Ty,
  /// Exact size in bytes. Sub-32-bit locals still occupy a 4-byte stack slot.
  pub size: u32,
  /// Tracked-ness, enregistration, and address exposure.
  pub flags: LocalFlags,
  /// Weighted reference count from the middle end, used to break reg-optional ties.
  pub ref_weight: u32,
  /// The struct layout, for struct-typed locals.
  pub layout: Option<LayoutId>,
}

impl Local {
  /// A scalar local of the given type and size.
  #[must_use] pub fn scalar(ty: Ty, size: u32) -> Self {
    Self { ty, size, flags: LocalFlags::TRACKED, ref_weight: 0, layout: None }
  }

  /// May the allocator put this local in a register?
  #[must_use] pub fn can_enregister(&self) -> bool {
    !self.flags.intersects(LocalFlags::DO_NOT_ENREGISTER | LocalFlags::ADDRESS_EXPOSED)
  }

  /// Force the local to the stack.
  pub fn set_do_not_enregister(&mut self) {
    self.flags.insert(LocalFlags::DO_NOT_ENREGISTER);
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use super::*;

  #[test]
  fn gc_runs() {
    let l = ClassLayout::with_gc_slots(40, &[false, true, false, false, false]);
    assert!(l.has_gc());
    assert_eq!(l.gc_count(), 1);
    assert_eq!(l.non_gc_run(0), 1);
    assert_eq!(l.non_gc_run(2), 3);
    assert_eq!(l.non_gc_run(1), 0);
    assert!(!ClassLayout::non_gc(24).has_gc());
  }
}
