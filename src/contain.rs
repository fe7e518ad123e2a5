//! Containment predicates: when may a child be folded into its parent as a
//! memory or immediate operand, and when may it instead be marked reg-optional.
//!
//! The memory-safety side is an invariance walk over the LIR range between the
//! candidate and its parent, accumulating the observable side effects of every
//! intervening node into a scratch accumulator that is cleared per query.
//! Walks that must skip a subtree mark it with [`NodeFlags::MARK`] through a
//! guard that unmarks on drop, so the bit is clear on every exit path.

use crate::types::lir::{Binop, BlockId, Function, Kind, Node, NodeFlags, NodeId, Use};

bitflags! {
  /// The observable effects of one node, as coarse bits.
  #[derive(Copy, Clone, Default, PartialEq, Eq)]
  pub(crate) struct Effects: u8 {
    /// Reads memory.
    const READ = 1;
    /// Writes memory (stores, calls, block ops).
    const WRITE = 1 << 1;
    /// May raise an exception (faulting load, div, overflow check, call).
    const THROW = 1 << 2;
    /// Sets the machine flags for a following consumer.
    const FLAGS = 1 << 3;
    /// Full barrier: calls and helpers order everything.
    const BARRIER = 1 << 4;
  }
}

impl std::fmt::Debug for Effects {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    bitflags::parser::to_writer(self, f)
  }
}

/// The effects of a single node, ignoring its operands.
pub(crate) fn node_effects(node: &Node) -> Effects {
  let mut fx = match node.kind {
    Kind::Ind(_) => {
      let mut fx = Effects::READ;
      if !node.flags.contains(NodeFlags::NONFAULTING) { fx |= Effects::THROW }
      fx
    }
    Kind::StoreLcl(..) | Kind::StoreLclFld(..) | Kind::PutArgStk { .. } => Effects::WRITE,
    Kind::StoreInd { .. } | Kind::StoreBlk { .. } => Effects::WRITE | Effects::THROW,
    Kind::Call(..) =>
      Effects::READ | Effects::WRITE | Effects::THROW | Effects::BARRIER,
    Kind::Binop(Binop::UDiv | Binop::UMod, ..) => Effects::THROW,
    Kind::Cmp(..) => Effects::FLAGS,
    _ => Effects::empty(),
  };
  if node.flags.contains(NodeFlags::OVF) { fx |= Effects::THROW }
  if node.flags.contains(NodeFlags::SET_FLAGS) { fx |= Effects::FLAGS }
  fx
}

/// The scratch accumulator for an invariance walk. One per
/// [`Lowering`](crate::lower::Lowering), cleared at the start of each query.
#[derive(Default, Debug)]
pub(crate) struct EffectsAcc(Effects);

impl EffectsAcc {
  fn clear(&mut self) { self.0 = Effects::empty() }

  fn add(&mut self, node: &Node) { self.0 |= node_effects(node) }

  /// Would the accumulated effects interfere with moving a load (and possible
  /// fault) of `candidate` down to the end of the range?
  fn interferes_with_load(&self, candidate_faults: bool) -> bool {
    if self.0.intersects(Effects::WRITE | Effects::BARRIER) { return true }
    // reordering a faulting load past a throwing node changes which exception
    // is observed
    candidate_faults && self.0.contains(Effects::THROW)
  }

  /// Would the accumulated effects interfere with a flag-reading consumer?
  fn clobbers_flags(&self) -> bool { self.0.contains(Effects::FLAGS) }
}

/// Marks a subtree with [`NodeFlags::MARK`] and unmarks it on drop.
struct MarkGuard<'a> {
  f: &'a mut Function,
  marked: Vec<NodeId>,
}

impl<'a> MarkGuard<'a> {
  fn new(f: &'a mut Function, root: Option<NodeId>) -> Self {
    let mut g = Self { f, marked: Vec::new() };
    if let Some(root) = root { g.mark(root) }
    g
  }

  fn mark(&mut self, n: NodeId) {
    if self.f.nodes[n].flags.contains(NodeFlags::MARK) { return }
    self.f.nodes[n].flags.insert(NodeFlags::MARK);
    self.marked.push(n);
    let mut ops = smallvec::SmallVec::<[NodeId; 4]>::new();
    self.f.nodes[n].kind.for_each_operand(|a| ops.push(a));
    for a in ops { self.mark(a) }
  }
}

impl Drop for MarkGuard<'_> {
  fn drop(&mut self) {
    for &n in &self.marked { self.f.nodes[n].flags.remove(NodeFlags::MARK) }
  }
}

/// Is `child` a node the emitter can read directly from memory: an indirection,
/// a stack local (or local field), or a constant that is materialized in the
/// constant pool?
pub(crate) fn is_containable_memory_op(f: &Function, child: NodeId) -> bool {
  match f.nodes[child].kind {
    Kind::Ind(_) => true,
    Kind::LclFld(..) => true,
    Kind::LclVar(lcl) => !f.locals[lcl].can_enregister(),
    Kind::FltCon(_) | Kind::VecCon(_) => true,
    _ => false,
  }
}

/// Is it safe to fold the memory access `child` into `parent`: is `child`'s
/// load invariant over the LIR range `(child, parent)`? `ignore`, if given, is
/// a subtree already being contained alongside and is skipped via mark bits.
pub(crate) fn is_safe_to_contain_mem(
  f: &mut Function, acc: &mut EffectsAcc, child: NodeId, parent: NodeId,
  ignore: Option<NodeId>,
) -> bool {
  acc.clear();
  let faults = node_effects(&f.nodes[child]).contains(Effects::THROW);
  let guard = MarkGuard::new(f, ignore);
  let mut cur = guard.f.next(child);
  while let Some(n) = cur {
    if n == parent { return true }
    if !guard.f.nodes[n].flags.contains(NodeFlags::MARK) {
      acc.add(&guard.f.nodes[n]);
      if acc.interferes_with_load(faults) { return false }
    }
    cur = guard.f.next(n);
  }
  // parent not found after child: not in the same range
  false
}

/// Is no flag-setting node between `child` and `parent`? Peepholes that delete
/// a flag producer must check the consumer they retarget is still adjacent.
pub(crate) fn flags_safe_between(
  f: &mut Function, acc: &mut EffectsAcc, child: NodeId, parent: NodeId,
) -> bool {
  acc.clear();
  let mut cur = f.next(child);
  while let Some(n) = cur {
    if n == parent { return true }
    acc.add(&f.nodes[n]);
    if acc.clobbers_flags() { return false }
    cur = f.next(n);
  }
  false
}

/// The byte width `parent` reads through a contained memory child, if the
/// parent is width-constrained.
pub(crate) fn parent_access_width(f: &Function, parent: NodeId) -> Option<u32> {
  let node = &f.nodes[parent];
  match node.kind {
    Kind::StoreInd { .. } | Kind::StoreLcl(..) | Kind::StoreLclFld(..) |
    Kind::Ind(_) => node.ty.size(),
    Kind::Binop(..) | Kind::Unop(..) | Kind::Cmp(..) => node.ty.size().or(Some(8)),
    Kind::Cast { from, .. } => Some(from.bytes()),
    Kind::Hwi(ref h) => Some(h.size.bytes()),
    _ => None,
  }
}

/// Does the memory form of `child` load exactly the width `parent` requires?
pub(crate) fn widths_match(f: &Function, parent: NodeId, child: NodeId) -> bool {
  match (parent_access_width(f, parent), f.nodes[child].ty.size()) {
    (Some(p), Some(c)) => p == c,
    // struct/mask-typed accesses carry their own layout; let the caller decide
    _ => true,
  }
}

/// Contain `child` as an immediate of `parent` if it is an integer constant
/// fitting signed 32 bits without a relocation.
pub(crate) fn try_contain_imm(f: &mut Function, child: NodeId) -> bool {
  let node = &f.nodes[child];
  if_chain! {
    if let Some(v) = node.icon_value();
    if !node.flags.contains(NodeFlags::RELOC);
    if i32::try_from(v).is_ok();
    then {
      f.nodes[child].make_contained();
      true
    } else { false }
  }
}

/// Contain `child` as the memory operand of `parent` if it is a containable
/// memory op, single-use, width-matched, and invariant over the range.
pub(crate) fn try_contain_mem(
  f: &mut Function, acc: &mut EffectsAcc, bl: BlockId, parent: NodeId, child: NodeId,
) -> bool {
  if !is_containable_memory_op(f, child) { return false }
  if !widths_match(f, parent, child) { return false }
  if !f.has_single_use(bl, child, parent) { return false }
  if !is_safe_to_contain_mem(f, acc, child, parent, None) { return false }
  contain_indir_tree(f, parent, child);
  true
}

/// Mark `child` (an indirection, local, or constant) contained under `parent`,
/// together with a contained address-mode under it.
pub(crate) fn contain_indir_tree(f: &mut Function, _parent: NodeId, child: NodeId) {
  f.nodes[child].make_contained();
  if let Kind::Ind(addr) = f.nodes[child].kind {
    if matches!(f.nodes[addr].kind, Kind::Lea { .. } | Kind::LclAddr(..)) {
      f.nodes[addr].make_contained();
      contain_lea_leaves(f, addr);
    }
  }
}

/// Contain the leaves of a contained LEA that need no register: local addresses
/// and encodable constants.
pub(crate) fn contain_lea_leaves(f: &mut Function, lea: NodeId) {
  if let Kind::Lea { base, index, .. } = f.nodes[lea].kind {
    for slot in [base.get(), index.get()].into_iter().flatten() {
      match f.nodes[slot].kind {
        Kind::LclAddr(..) => f.nodes[slot].make_contained(),
        Kind::IntCon(_) => { try_contain_imm(f, slot); }
        _ => {}
      }
    }
  }
}

/// Mark `child` reg-optional unless something rules it out: it must be a safe
/// re-read candidate (a tracked local read) not already consumed elsewhere.
pub(crate) fn try_reg_optional(f: &mut Function, bl: BlockId, parent: NodeId, child: NodeId) {
  if f.nodes[child].contained() { return }
  if !matches!(f.nodes[child].kind, Kind::LclVar(_)) { return }
  if !f.has_single_use(bl, child, parent) { return }
  f.nodes[child].flags.insert(NodeFlags::REG_OPTIONAL);
}

/// For a two-operand instruction that accepts one memory operand: contain the
/// RHS if possible; for commutative ops fall back to containing the LHS by
/// swapping; otherwise pick one operand to mark reg-optional.
pub(crate) fn contain_binop_operands(
  f: &mut Function, acc: &mut EffectsAcc, bl: BlockId, parent: NodeId,
) {
  let Kind::Binop(op, lhs, rhs) = f.nodes[parent].kind else { panic!("binop expected") };
  // an RMW store owns the containment of its whole source tree
  if let Some(Use { user, .. }) = f.find_use(bl, parent) {
    if let Kind::StoreInd { rmw, .. } = f.nodes[user].kind {
      if rmw.is_rmw() { return }
    }
  }
  if try_contain_imm(f, rhs) { return }
  if try_contain_mem(f, acc, bl, parent, rhs) { return }
  if op.commutative() {
    if try_contain_imm(f, lhs) || try_contain_mem(f, acc, bl, parent, lhs) {
      // put the contained operand in the RHS slot
      if let Kind::Binop(_, l, r) = &mut f.nodes[parent].kind {
        std::mem::swap(l, r);
      }
      return
    }
  }
  let pick = pick_reg_optional(f, bl, lhs, rhs);
  try_reg_optional(f, bl, parent, pick);
}

/// The reg-optional preference order: if both are locals, the one with lower
/// weighted ref count; else a local over a non-local; else the later def
/// (shorter live range).
pub(crate) fn pick_reg_optional(
  f: &Function, _bl: BlockId, lhs: NodeId, rhs: NodeId,
) -> NodeId {
  let lcl = |n: NodeId| if let Kind::LclVar(l) = f.nodes[n].kind { Some(l) } else { None };
  match (lcl(lhs), lcl(rhs)) {
    (Some(a), Some(b)) =>
      if f.locals[a].ref_weight <= f.locals[b].ref_weight { lhs } else { rhs },
    (Some(_), None) => lhs,
    (None, Some(_)) => rhs,
    // later def = shorter live range
    (None, None) => if f.precedes(lhs, rhs) { rhs } else { lhs },
  }
}
