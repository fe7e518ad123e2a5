//! The linear IR operated on by the lowering pass.
//!
//! A [`Function`] owns an arena of [`Node`]s (an [`IdxVec`] indexed by [`NodeId`]) and a
//! list of [`BlockRange`]s. The execution order within a block is an intrusive doubly
//! linked list threaded through `Node::prev`/`Node::next`; operand edges are `NodeId`s
//! stored inline in each [`Kind`] variant and always point to earlier nodes in the same
//! range. Removal is logical (unlinking); node storage is reclaimed in bulk when the
//! function drops.

use std::fmt::Debug;

use byteorder::{ByteOrder, LE};
use smallvec::SmallVec;

use super::{BaseTy, IdxVec, Size, Ty, VecLen, CC};
use super::layout::{LayoutId, LocalId};
use crate::hwi::Hwi;

mk_id! {
  /// A node in the arena of a [`Function`].
  NodeId(Debug("n")),
  /// A basic block of a [`Function`].
  BlockId(Debug("b")),
}

/// An optional [`NodeId`], stored compactly with `u32::MAX` as the `None` sentinel.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct OptNodeId(NodeId);

impl OptNodeId {
  /// The `None` value.
  pub const NONE: Self = Self(NodeId(u32::MAX));

  /// Unpack into a regular option.
  #[inline] #[must_use] pub fn get(self) -> Option<NodeId> {
    if self == Self::NONE { None } else { Some(self.0) }
  }
}

impl From<NodeId> for OptNodeId {
  fn from(n: NodeId) -> Self { Self(n) }
}

impl From<Option<NodeId>> for OptNodeId {
  fn from(n: Option<NodeId>) -> Self { n.map_or(Self::NONE, Self) }
}

impl Debug for OptNodeId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.get() {
      Some(n) => n.fmt(f),
      None => write!(f, "_"),
    }
  }
}

impl Default for OptNodeId {
  fn default() -> Self { Self::NONE }
}

bitflags! {
  /// Mutable per-node state consumed by the register allocator and emitter.
  #[derive(Copy, Clone, Default, PartialEq, Eq)]
  pub struct NodeFlags: u16 {
    /// The node is folded into its parent as a memory or immediate operand
    /// and receives no register.
    const CONTAINED = 1;
    /// The allocator may spill this value and the parent will re-read it from memory.
    const REG_OPTIONAL = 1 << 1;
    /// The node produces a value but nothing in its range consumes it.
    const UNUSED_VALUE = 1 << 2;
    /// The node's flag effects are consumed by a following `Setcc`/`Jcc`.
    const SET_FLAGS = 1 << 3;
    /// The access is known not to fault (used for speculative contained loads).
    const NONFAULTING = 1 << 4;
    /// The node is consumed under an EVEX embedded mask.
    const EMB_MASK_OP = 1 << 5;
    /// The node is consumed as an EVEX embedded broadcast operand.
    const EMB_BROADCAST = 1 << 6;
    /// An integer constant that carries a relocation and so cannot be an immediate.
    const RELOC = 1 << 7;
    /// Scratch bit for side-effect invariance walks. Never set outside a walk.
    const MARK = 1 << 8;
    /// The cast source is already zero extended, so no instruction is needed.
    const DONT_EXTEND = 1 << 9;
    /// Overflow-checked arithmetic (add/sub/mul); the emitter appends a jump-on-overflow.
    const OVF = 1 << 10;
  }
}

impl Debug for NodeFlags {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    bitflags::parser::to_writer(self, f)
  }
}

/// A unary operator on scalars or vectors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Unop {
  /// Two's complement negation.
  Neg,
  /// Bitwise complement.
  Not,
  /// Byte-order reversal.
  Bswap,
}

/// A binary operator on scalars or (element-wise) vectors.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Binop {
  /// Wrapping addition.
  Add,
  /// Wrapping subtraction.
  Sub,
  /// Low-half multiplication.
  Mul,
  /// Bitwise and.
  And,
  /// Bitwise or.
  Or,
  /// Bitwise exclusive or.
  Xor,
  /// Left shift.
  Shl,
  /// Logical (zero filling) right shift.
  Shr,
  /// Arithmetic (sign filling) right shift.
  Sar,
  /// Rotate left.
  Rol,
  /// Rotate right.
  Ror,
  /// Unsigned division.
  UDiv,
  /// Unsigned remainder.
  UMod,
}

impl Binop {
  /// Is `op(a, b) = op(b, a)`?
  #[must_use] pub fn commutative(self) -> bool {
    matches!(self, Binop::Add | Binop::Mul | Binop::And | Binop::Or | Binop::Xor)
  }

  /// Is this a shift or rotate (count operand in CL, RMW forbidden below 32 bits)?
  #[must_use] pub fn is_shiftish(self) -> bool {
    matches!(self, Binop::Shl | Binop::Shr | Binop::Sar | Binop::Rol | Binop::Ror)
  }

  /// Is this one of the bitwise operators that can fuse into a ternary-logic node?
  #[must_use] pub fn is_bitwise(self) -> bool {
    matches!(self, Binop::And | Binop::Or | Binop::Xor)
  }
}

/// The cached result of read-modify-write analysis on a [`Kind::StoreInd`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RmwStatus {
  /// Not yet analyzed.
  #[default]
  Unknown,
  /// `STORE_IND(p, op(IND(p), r))`: the destination is operand 1 of the source.
  Op1,
  /// `STORE_IND(p, op(r, IND(p)))` with `op` commutative.
  Op2,
  /// The source operator has no `op [mem], r` form (or checks overflow).
  UnsupportedOper,
  /// The two addresses are not provably the same expression.
  UnsupportedAddr,
  /// The type rules it out: sub-32-bit shift/rotate or floating point.
  UnsupportedType,
}

impl RmwStatus {
  /// Has the analysis already run, with any result?
  #[must_use] pub fn is_resolved(self) -> bool { self != RmwStatus::Unknown }

  /// Did the analysis recognize an RMW form?
  #[must_use] pub fn is_rmw(self) -> bool { matches!(self, RmwStatus::Op1 | RmwStatus::Op2) }
}

/// The code generation strategy chosen for a block store.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BlkStrategy {
  /// Not yet decided.
  #[default]
  Unknown,
  /// A short run of scalar/SIMD stores.
  Unroll,
  /// A per-slot copy that uses GC-aware stores for pointer slots and plain
  /// (or `rep movs`) stores for long enough runs without them.
  UnrollGc,
  /// A store loop, used to zero GC pointer slots on the heap.
  Loop,
  /// `rep stos`/`rep movs`.
  RepInstr,
  /// Call the named runtime helper.
  Helper(Helper),
}

/// A runtime helper routine that lowering may call for large block operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Helper {
  /// `memset(dst, val, size)`.
  MemSet,
  /// `memcpy(dst, src, size)`.
  MemCpy,
  /// A checked copy that reports GC pointer stores through the write barrier.
  GcMemCpy,
}

/// The stack-argument materialization strategy for [`Kind::PutArgStk`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PutArgKind {
  /// Not yet decided.
  #[default]
  Unknown,
  /// A sequence of `push` instructions (32-bit targets; GC-precise).
  Push,
  /// Unrolled stores into the outgoing argument area.
  Unroll,
  /// `rep movs` into the outgoing argument area.
  RepInstr,
}

/// A hardware intrinsic node: intrinsic id, lane type, vector width, and operands.
/// Boxed inside [`Kind::Hwi`] to keep [`Node`] small.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HwiNode {
  /// Which intrinsic this is.
  pub id: Hwi,
  /// The lane type the intrinsic operates on.
  pub base: BaseTy,
  /// The vector width in bytes.
  pub size: VecLen,
  /// The operand nodes, in intrinsic operand order.
  pub ops: SmallVec<[NodeId; 4]>,
}

/// A 64-byte vector constant payload. Only the low `len.bytes()` bytes are meaningful.
#[derive(Clone, PartialEq, Eq)]
pub struct VecConst {
  /// The vector width.
  pub len: VecLen,
  /// Little-endian lane data.
  pub data: [u8; 64],
}

impl Debug for VecConst {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "0x{}", hex::encode(&self.data[..self.len.bytes() as usize]))
  }
}

impl VecConst {
  /// An all-zero constant of the given width.
  #[must_use] pub fn zero(len: VecLen) -> Self { Self { len, data: [0; 64] } }

  /// An all-ones constant of the given width.
  #[must_use] pub fn all_ones(len: VecLen) -> Self {
    let mut data = [0; 64];
    data[..len.bytes() as usize].fill(0xff);
    Self { len, data }
  }

  /// Build a constant by replicating `bits` (a lane value of type `base`) across all lanes.
  #[must_use] pub fn splat(len: VecLen, base: BaseTy, bits: u64) -> Self {
    let mut c = Self::zero(len);
    for i in 0..len.lanes(base) { c.set_lane(base, i, bits) }
    c
  }

  /// Read lane `i` as raw bits, zero extended to 64 bits.
  #[must_use] pub fn lane(&self, base: BaseTy, i: u32) -> u64 {
    let off = (i * base.bytes()) as usize;
    match base.size() {
      Size::S8 => self.data[off].into(),
      Size::S16 => LE::read_u16(&self.data[off..]).into(),
      Size::S32 => LE::read_u32(&self.data[off..]).into(),
      Size::S64 => LE::read_u64(&self.data[off..]),
    }
  }

  /// Write lane `i` from the low bits of `bits`.
  pub fn set_lane(&mut self, base: BaseTy, i: u32, bits: u64) {
    let off = (i * base.bytes()) as usize;
    match base.size() {
      Size::S8 => self.data[off] = bits as u8,
      Size::S16 => LE::write_u16(&mut self.data[off..], bits as u16),
      Size::S32 => LE::write_u32(&mut self.data[off..], bits as u32),
      Size::S64 => LE::write_u64(&mut self.data[off..], bits),
    }
  }

  /// If every `base`-typed lane holds the same bits, return them.
  #[must_use] pub fn broadcast_of(&self, base: BaseTy) -> Option<u64> {
    use itertools::Itertools;
    (0..self.len.lanes(base)).map(|i| self.lane(base, i)).all_equal_value().ok()
  }

  /// Is every byte zero?
  #[must_use] pub fn is_zero(&self) -> bool {
    self.data[..self.len.bytes() as usize].iter().all(|&b| b == 0)
  }

  /// Is every byte `0xff`?
  #[must_use] pub fn is_all_ones(&self) -> bool {
    self.data[..self.len.bytes() as usize].iter().all(|&b| b == 0xff)
  }
}

/// The operator of a node, with its operand edges stored inline.
#[derive(Clone, Debug, PartialEq)]
#[allow(variant_size_differences)]
pub enum Kind {
  /// An integer constant. Pointer-sized constants with relocations carry
  /// [`NodeFlags::RELOC`].
  IntCon(i64),
  /// A floating point constant, stored as raw bits of width `Node::ty`.
  FltCon(u64),
  /// A vector constant.
  VecCon(Box<VecConst>),
  /// Read a local variable.
  LclVar(LocalId),
  /// Read a field of a local at a byte offset. Forces the local to the stack.
  LclFld(LocalId, u32),
  /// The address of (a field of) a local.
  LclAddr(LocalId, u32),
  /// A unary operator.
  Unop(Unop, NodeId),
  /// A binary operator. Overflow-checked forms carry [`NodeFlags::OVF`].
  Binop(Binop, NodeId, NodeId),
  /// Integer widening, narrowing, or int/float conversion.
  Cast {
    /// The value being converted.
    src: NodeId,
    /// The source interpretation (determines sign vs zero extension).
    from: BaseTy,
    /// The destination type.
    to: BaseTy,
  },
  /// Compare two values and set the machine flags; the following `Setcc`/`Jcc`
  /// consumes them. Produces no value.
  Cmp(CC, NodeId, NodeId),
  /// Materialize the condition `cc` of the immediately preceding flag-setting
  /// node as a 0/1 integer.
  Setcc(CC),
  /// Branch on the condition `cc` of the immediately preceding flag-setting node.
  Jcc(CC),
  /// Branch if the operand is nonzero.
  JTrue(NodeId),
  /// Load through an address.
  Ind(NodeId),
  /// An x86 effective address `base + index*scale + disp`. May compute the address
  /// into a register or be contained as the memory operand of a parent.
  Lea {
    /// The base register value, if any.
    base: OptNodeId,
    /// The scaled index value, if any.
    index: OptNodeId,
    /// Index multiplier, one of 1, 2, 4, 8.
    scale: u8,
    /// Signed displacement.
    disp: i32,
  },
  /// Store a value to a local variable slot.
  StoreLcl(LocalId, NodeId),
  /// Store a value to a field of a local at a byte offset. Forces the local to the stack.
  StoreLclFld(LocalId, u32, NodeId),
  /// Store through an address.
  StoreInd {
    /// The destination address.
    addr: NodeId,
    /// The value stored.
    val: NodeId,
    /// Cached read-modify-write analysis result.
    rmw: RmwStatus,
  },
  /// Initialize or copy a block of memory.
  StoreBlk {
    /// The destination address.
    addr: NodeId,
    /// For an init, the fill byte; for a copy, the source value (`Ind` or `LclVar`).
    val: NodeId,
    /// The number of bytes stored.
    size: u32,
    /// The GC layout of the stored struct, if it has one.
    layout: Option<LayoutId>,
    /// Is this an init (fill) rather than a copy?
    init: bool,
    /// The code generation strategy, decided during lowering.
    strategy: BlkStrategy,
  },
  /// An ordered list of `(value, offset, type)` fields flowing into a struct argument.
  FieldList(SmallVec<[(NodeId, u32, Ty); 2]>),
  /// Pass a value on the argument stack at the given slot offset.
  PutArgStk {
    /// The argument value.
    src: NodeId,
    /// Byte offset in the outgoing argument area.
    slot: u32,
    /// The GC layout of the argument, if it is a struct.
    layout: Option<LayoutId>,
    /// The materialization strategy, decided during lowering.
    kind: PutArgKind,
  },
  /// A call to a runtime helper.
  Call(Helper, SmallVec<[NodeId; 2]>),
  /// A hardware intrinsic.
  Hwi(Box<HwiNode>),
}

impl Kind {
  /// Visit each operand edge in slot order.
  pub fn for_each_operand(&self, mut f: impl FnMut(NodeId)) {
    match *self {
      Kind::IntCon(_) | Kind::FltCon(_) | Kind::VecCon(_) |
      Kind::LclVar(_) | Kind::LclFld(..) | Kind::LclAddr(..) |
      Kind::Setcc(_) | Kind::Jcc(_) => {}
      Kind::Unop(_, a) | Kind::Cast { src: a, .. } | Kind::JTrue(a) | Kind::Ind(a) |
      Kind::StoreLcl(_, a) | Kind::StoreLclFld(_, _, a) |
      Kind::PutArgStk { src: a, .. } => f(a),
      Kind::Binop(_, a, b) | Kind::Cmp(_, a, b) |
      Kind::StoreInd { addr: a, val: b, .. } |
      Kind::StoreBlk { addr: a, val: b, .. } => { f(a); f(b) }
      Kind::Lea { base, index, .. } => {
        if let Some(a) = base.get() { f(a) }
        if let Some(a) = index.get() { f(a) }
      }
      Kind::FieldList(ref fields) => for &(a, _, _) in fields { f(a) },
      Kind::Call(_, ref args) => for &a in args { f(a) },
      Kind::Hwi(ref h) => for &a in &h.ops { f(a) },
    }
  }

  /// The operand in slot `slot` (the order [`Self::for_each_operand`] uses).
  #[must_use] pub fn operand(&self, slot: u8) -> NodeId {
    let mut i = 0;
    let mut found = None;
    self.for_each_operand(|a| {
      if i == slot { found = Some(a) }
      i += 1;
    });
    found.unwrap_or_else(|| panic!("operand slot {slot} out of range"))
  }

  /// Rewrite the operand in slot `slot` to `new`.
  pub fn set_operand(&mut self, slot: u8, new: NodeId) {
    match (self, slot) {
      (Kind::Unop(_, a), 0) | (Kind::Cast { src: a, .. }, 0) | (Kind::JTrue(a), 0) |
      (Kind::Ind(a), 0) | (Kind::StoreLcl(_, a), 0) | (Kind::StoreLclFld(_, _, a), 0) |
      (Kind::PutArgStk { src: a, .. }, 0) |
      (Kind::Binop(_, a, _), 0) | (Kind::Cmp(_, a, _), 0) |
      (Kind::StoreInd { addr: a, .. }, 0) | (Kind::StoreBlk { addr: a, .. }, 0) |
      (Kind::Binop(_, _, a), 1) | (Kind::Cmp(_, _, a), 1) |
      (Kind::StoreInd { val: a, .. }, 1) | (Kind::StoreBlk { val: a, .. }, 1) => *a = new,
      (Kind::Lea { base, index, .. }, _) => {
        let slots = [base, index];
        let mut it = slots.into_iter().filter(|s| s.get().is_some());
        *it.nth(slot.into()).expect("operand slot out of range") = new.into();
      }
      (Kind::FieldList(fields), _) =>
        fields.get_mut(usize::from(slot)).expect("operand slot out of range").0 = new,
      (Kind::Call(_, args), _) =>
        *args.get_mut(usize::from(slot)).expect("operand slot out of range") = new,
      (Kind::Hwi(h), _) =>
        *h.ops.get_mut(usize::from(slot)).expect("operand slot out of range") = new,
      _ => panic!("operand slot {slot} out of range"),
    }
  }

  /// Does this node produce a value (as opposed to a store, branch, or compare)?
  #[must_use] pub fn produces_value(&self, ty: Ty) -> bool {
    !matches!(self,
      Kind::Cmp(..) | Kind::Jcc(_) | Kind::JTrue(_) |
      Kind::StoreLcl(..) | Kind::StoreLclFld(..) | Kind::StoreInd { .. } |
      Kind::StoreBlk { .. } | Kind::PutArgStk { .. }) &&
    ty != Ty::Void
  }
}

/// A single IR node: produced type, lowering flags, operator, and list links.
#[derive(Clone, Debug)]
pub struct Node {
  /// The type of the produced value ([`Ty::Void`] for stores and branches).
  pub ty: Ty,
  /// Mutable lowering state.
  pub flags: NodeFlags,
  /// The operator and operand edges.
  pub kind: Kind,
  pub(crate) prev: OptNodeId,
  pub(crate) next: OptNodeId,
}

impl Node {
  /// Is the node contained in its parent?
  #[inline] #[must_use] pub fn contained(&self) -> bool {
    self.flags.contains(NodeFlags::CONTAINED)
  }

  /// Is the node marked reg-optional?
  #[inline] #[must_use] pub fn reg_optional(&self) -> bool {
    self.flags.contains(NodeFlags::REG_OPTIONAL)
  }

  /// Mark the node contained. Clears reg-optional; the two are exclusive.
  pub fn make_contained(&mut self) {
    self.flags.remove(NodeFlags::REG_OPTIONAL);
    self.flags.insert(NodeFlags::CONTAINED);
  }

  /// Is this an integer constant without a relocation whose value is `val`?
  #[must_use] pub fn is_icon(&self, val: i64) -> bool {
    matches!(self.kind, Kind::IntCon(v) if v == val && !self.flags.contains(NodeFlags::RELOC))
  }

  /// The value of an integer constant node, if it is one (reloc or not).
  #[must_use] pub fn icon_value(&self) -> Option<i64> {
    if let Kind::IntCon(v) = self.kind { Some(v) } else { None }
  }

  /// The inner [`HwiNode`], if this is a hardware intrinsic.
  #[must_use] pub fn hwi(&self) -> Option<&HwiNode> {
    if let Kind::Hwi(ref h) = self.kind { Some(h) } else { None }
  }
}

/// The node sequence of one basic block: first and last node of the intrusive list.
#[derive(Copy, Clone, Debug, Default)]
pub struct BlockRange {
  /// The first node in execution order.
  pub first: OptNodeId,
  /// The last node in execution order.
  pub last: OptNodeId,
}

/// A use site: `function[user].kind.operand(slot)` is the used node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Use {
  /// The consuming node.
  pub user: NodeId,
  /// The operand slot within the consumer.
  pub slot: u8,
}

/// A function under lowering: node arena, blocks, locals, struct layouts.
#[derive(Debug, Default)]
pub struct Function {
  /// The node arena. Unlinked (removed) nodes stay here until the function drops.
  pub nodes: IdxVec<NodeId, Node>,
  /// The basic blocks, in layout order.
  pub blocks: IdxVec<BlockId, BlockRange>,
  /// Per-local descriptors.
  pub locals: IdxVec<LocalId, super::layout::Local>,
  /// Struct layouts referenced by block stores and arguments.
  pub layouts: IdxVec<LayoutId, super::layout::ClassLayout>,
}

impl Function {
  /// Create an empty function.
  #[must_use] pub fn new() -> Self { Self::default() }

  /// Add a new empty basic block.
  pub fn new_block(&mut self) -> BlockId { self.blocks.push(BlockRange::default()) }

  /// Create a detached node. It must be linked with [`Self::append`],
  /// [`Self::insert_before`], or [`Self::insert_after`] before the pass completes.
  pub fn new_node(&mut self, ty: Ty, kind: Kind) -> NodeId {
    self.nodes.push(Node {
      ty, kind,
      flags: NodeFlags::empty(),
      prev: OptNodeId::NONE,
      next: OptNodeId::NONE,
    })
  }

  /// The node after `id` in its block, if any.
  #[must_use] pub fn next(&self, id: NodeId) -> Option<NodeId> { self.nodes[id].next.get() }

  /// The node before `id` in its block, if any.
  #[must_use] pub fn prev(&self, id: NodeId) -> Option<NodeId> { self.nodes[id].prev.get() }

  /// Link `id` at the end of block `bl`.
  pub fn append(&mut self, bl: BlockId, id: NodeId) {
    match self.blocks[bl].last.get() {
      None => {
        self.blocks[bl].first = id.into();
        self.blocks[bl].last = id.into();
      }
      Some(last) => {
        self.nodes[last].next = id.into();
        self.nodes[id].prev = last.into();
        self.blocks[bl].last = id.into();
      }
    }
  }

  /// Link `id` immediately before `anchor` in block `bl`.
  pub fn insert_before(&mut self, bl: BlockId, anchor: NodeId, id: NodeId) {
    let prev = self.nodes[anchor].prev;
    self.nodes[id].prev = prev;
    self.nodes[id].next = anchor.into();
    self.nodes[anchor].prev = id.into();
    match prev.get() {
      Some(p) => self.nodes[p].next = id.into(),
      None => self.blocks[bl].first = id.into(),
    }
  }

  /// Link `id` immediately after `anchor` in block `bl`.
  pub fn insert_after(&mut self, bl: BlockId, anchor: NodeId, id: NodeId) {
    let next = self.nodes[anchor].next;
    self.nodes[id].next = next;
    self.nodes[id].prev = anchor.into();
    self.nodes[anchor].next = id.into();
    match next.get() {
      Some(n) => self.nodes[n].prev = id.into(),
      None => self.blocks[bl].last = id.into(),
    }
  }

  /// Unlink `id` from block `bl`. The node stays in the arena but is no longer
  /// part of any range; its operand edges must not be followed afterwards.
  pub fn remove(&mut self, bl: BlockId, id: NodeId) {
    let Node { prev, next, .. } = self.nodes[id];
    match prev.get() {
      Some(p) => self.nodes[p].next = next,
      None => self.blocks[bl].first = next,
    }
    match next.get() {
      Some(n) => self.nodes[n].prev = prev,
      None => self.blocks[bl].last = prev,
    }
    self.nodes[id].prev = OptNodeId::NONE;
    self.nodes[id].next = OptNodeId::NONE;
  }

  /// Unlink `id` and, transitively, any of its operands left without a use.
  /// Only safe for value trees with no side effects.
  pub fn remove_tree(&mut self, bl: BlockId, id: NodeId) {
    let mut ops = SmallVec::<[NodeId; 4]>::new();
    self.nodes[id].kind.for_each_operand(|a| ops.push(a));
    self.remove(bl, id);
    for a in ops {
      if self.find_use(bl, a).is_none() { self.remove_tree(bl, a) }
    }
  }

  /// An iterator over block `bl` in execution order. The list must not be
  /// modified while iterating.
  pub fn block_iter(&self, bl: BlockId) -> impl Iterator<Item = NodeId> + '_ {
    let mut cur = self.blocks[bl].first.get();
    std::iter::from_fn(move || {
      let id = cur?;
      cur = self.next(id);
      Some(id)
    })
  }

  /// Find the use of `def` in block `bl` by scanning forward from its definition.
  /// Returns `None` for unused values.
  #[must_use] pub fn find_use(&self, bl: BlockId, def: NodeId) -> Option<Use> {
    let mut cur = self.next(def).or_else(|| {
      // `def` may already be unlinked; fall back to a full block scan.
      self.blocks[bl].first.get()
    });
    while let Some(user) = cur {
      let mut slot = 0u8;
      let mut found = None;
      self.nodes[user].kind.for_each_operand(|a| {
        if a == def && found.is_none() { found = Some(slot) }
        slot += 1;
      });
      if let Some(slot) = found { return Some(Use { user, slot }) }
      cur = self.next(user);
    }
    None
  }

  /// The number of operand edges to `def` from later nodes in block `bl`.
  #[must_use] pub fn use_count(&self, bl: BlockId, def: NodeId) -> usize {
    let mut count = 0;
    let mut cur = self.next(def).or_else(|| self.blocks[bl].first.get());
    while let Some(user) = cur {
      self.nodes[user].kind.for_each_operand(|a| if a == def { count += 1 });
      cur = self.next(user);
    }
    count
  }

  /// Is `user` the one and only use of `def` in block `bl`?
  #[must_use] pub fn has_single_use(&self, bl: BlockId, def: NodeId, user: NodeId) -> bool {
    self.use_count(bl, def) == 1 && self.find_use(bl, def).is_some_and(|u| u.user == user)
  }

  /// Rewrite the operand slot of `u` to point at `new`.
  pub fn replace_use(&mut self, u: Use, new: NodeId) {
    self.nodes[u.user].kind.set_operand(u.slot, new);
  }

  /// Is `id` before `other` in the same block range? Walks forward from `id`.
  #[must_use] pub fn precedes(&self, id: NodeId, other: NodeId) -> bool {
    let mut cur = self.next(id);
    while let Some(n) = cur {
      if n == other { return true }
      cur = self.next(n);
    }
    false
  }

  // Convenience constructors used by lowering and by tests. Each creates a
  // detached node of the conventional type for the operator.

  /// A detached integer constant of the given scalar type.
  pub fn icon(&mut self, ty: BaseTy, val: i64) -> NodeId {
    self.new_node(Ty::Scalar(ty), Kind::IntCon(val))
  }

  /// A detached vector constant.
  pub fn vec_con(&mut self, c: VecConst) -> NodeId {
    self.new_node(Ty::Vec(c.len), Kind::VecCon(Box::new(c)))
  }

  /// A detached local variable read.
  pub fn lcl_var(&mut self, lcl: LocalId) -> NodeId {
    let ty = self.locals[lcl].ty;
    self.new_node(ty, Kind::LclVar(lcl))
  }

  /// A detached binary operator node.
  pub fn binop(&mut self, op: Binop, ty: Ty, lhs: NodeId, rhs: NodeId) -> NodeId {
    self.new_node(ty, Kind::Binop(op, lhs, rhs))
  }

  /// A detached unary operator node.
  pub fn unop(&mut self, op: Unop, ty: Ty, src: NodeId) -> NodeId {
    self.new_node(ty, Kind::Unop(op, src))
  }

  /// A detached load.
  pub fn ind(&mut self, ty: Ty, addr: NodeId) -> NodeId {
    self.new_node(ty, Kind::Ind(addr))
  }

  /// A detached indirect store.
  pub fn store_ind(&mut self, addr: NodeId, val: NodeId) -> NodeId {
    self.new_node(Ty::Void, Kind::StoreInd { addr, val, rmw: RmwStatus::Unknown })
  }

  /// A detached hardware intrinsic node.
  pub fn hwi(
    &mut self, ty: Ty, id: Hwi, base: BaseTy, size: VecLen,
    ops: impl IntoIterator<Item = NodeId>,
  ) -> NodeId {
    self.new_node(ty, Kind::Hwi(Box::new(HwiNode {
      id, base, size, ops: ops.into_iter().collect(),
    })))
  }

  /// Replace the operator of `id` in place, keeping its links and flags.
  pub fn retype(&mut self, id: NodeId, ty: Ty, kind: Kind) {
    let node = &mut self.nodes[id];
    node.ty = ty;
    node.kind = kind;
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use super::*;
  use crate::types::BaseTy;

  #[test]
  fn linking() {
    let mut f = Function::new();
    let bl = f.new_block();
    let a = f.icon(BaseTy::I64, 1);
    let b = f.icon(BaseTy::I64, 2);
    let c = f.binop(Binop::Add, Ty::Scalar(BaseTy::I64), a, b);
    f.append(bl, a);
    f.append(bl, c);
    f.insert_before(bl, c, b);
    assert_eq!(f.block_iter(bl).collect::<Vec<_>>(), vec![a, b, c]);
    f.remove(bl, b);
    assert_eq!(f.block_iter(bl).collect::<Vec<_>>(), vec![a, c]);
    f.insert_after(bl, a, b);
    assert_eq!(f.block_iter(bl).collect::<Vec<_>>(), vec![a, b, c]);
    assert!(f.precedes(a, c));
    assert!(!f.precedes(c, a));
  }

  #[test]
  fn uses() {
    let mut f = Function::new();
    let bl = f.new_block();
    let a = f.icon(BaseTy::I32, 7);
    let b = f.icon(BaseTy::I32, 8);
    let c = f.binop(Binop::Sub, Ty::Scalar(BaseTy::I32), a, b);
    for n in [a, b, c] { f.append(bl, n) }
    assert_eq!(f.find_use(bl, a), Some(Use { user: c, slot: 0 }));
    assert_eq!(f.find_use(bl, b), Some(Use { user: c, slot: 1 }));
    assert_eq!(f.find_use(bl, c), None);
    let d = f.icon(BaseTy::I32, 9);
    f.insert_before(bl, c, d);
    f.replace_use(Use { user: c, slot: 1 }, d);
    assert_eq!(f.nodes[c].kind.operand(1), d);
  }

  #[test]
  fn vec_const_lanes() {
    let mut c = VecConst::zero(VecLen::V16);
    for i in 0..4 { c.set_lane(BaseTy::I32, i, 0xdead_beef) }
    assert_eq!(c.broadcast_of(BaseTy::I32), Some(0xdead_beef));
    assert_eq!(c.broadcast_of(BaseTy::I64), Some(0xdead_beef_dead_beef));
    c.set_lane(BaseTy::I32, 3, 1);
    assert_eq!(c.broadcast_of(BaseTy::I32), None);
    assert!(!c.is_zero());
    assert!(VecConst::zero(VecLen::V32).is_zero());
    assert!(VecConst::all_ones(VecLen::V64).is_all_ones());
    assert_eq!(VecConst::splat(VecLen::V16, BaseTy::U8, 0xff), VecConst::all_ones(VecLen::V16));
  }
}
