//! The lowering driver: a single forward walk over each block in execution
//! order. Each visited node may be rewritten, may insert or remove neighbors,
//! and finally has containment decided for its operands; every per-node routine
//! returns the node to visit next so the walk stays well-formed across splices.

mod scalar;
mod block;
mod simd;
mod logic;
mod cast;

use crate::contain::{self, EffectsAcc};
use crate::hwi::Hwi;
use crate::isa::{Isa, LowerConfig, StressRng};
use crate::types::lir::{BlockId, Function, HwiNode, Kind, NodeFlags, NodeId, Use};
use crate::types::{BaseTy, Ty, VecLen};

/// The state threaded through one lowering run.
pub struct Lowering<'a> {
  pub(crate) f: &'a mut Function,
  pub(crate) isa: &'a Isa,
  pub(crate) cfg: &'a LowerConfig,
  pub(crate) acc: EffectsAcc,
  pub(crate) rng: StressRng,
  pub(crate) bl: BlockId,
}

/// Lower `f` in place for the given target. After this returns, every node is
/// directly emittable: contained/reg-optional state is final, addresses are
/// legal effective addresses, and every indirect store has a resolved RMW
/// status.
pub fn run(f: &mut Function, isa: &Isa, cfg: &LowerConfig) {
  let mut lo = Lowering {
    f, isa, cfg,
    acc: EffectsAcc::default(),
    rng: StressRng::new(cfg.stress_seed),
    bl: BlockId(0),
  };
  for bl in 0..lo.f.blocks.len() {
    lo.bl = crate::types::Idx::from_usize(bl);
    lo.lower_block();
  }
  #[cfg(debug_assertions)]
  crate::check::check_function(lo.f);
}

impl Lowering<'_> {
  fn lower_block(&mut self) {
    let mut cur = self.f.blocks[self.bl].first.get();
    while let Some(n) = cur {
      cur = self.lower_node(n);
    }
    self.flag_unused_values();
  }

  /// Lower one node and return the next node to visit.
  fn lower_node(&mut self, n: NodeId) -> Option<NodeId> {
    match self.f.nodes[n].kind {
      Kind::IntCon(_) | Kind::FltCon(_) | Kind::VecCon(_) |
      Kind::LclVar(_) | Kind::LclAddr(..) | Kind::Setcc(_) | Kind::Jcc(_) |
      Kind::FieldList(_) => self.f.next(n),
      Kind::LclFld(lcl, _) => {
        self.f.locals[lcl].set_do_not_enregister();
        self.f.next(n)
      }
      Kind::StoreLcl(..) => self.lower_store_lcl(n),
      Kind::StoreLclFld(..) => self.lower_store_lcl_fld(n),
      Kind::StoreInd { .. } => self.lower_store_ind(n),
      Kind::StoreBlk { .. } => self.lower_store_blk(n),
      Kind::PutArgStk { .. } => self.lower_put_arg_stk(n),
      Kind::Binop(..) => self.lower_binop(n),
      Kind::Unop(..) => self.lower_unop(n),
      Kind::Cast { .. } => self.lower_cast(n),
      Kind::Cmp(..) => self.lower_cmp(n),
      Kind::JTrue(_) => self.lower_jtrue(n),
      Kind::Ind(_) => self.lower_ind(n),
      Kind::Lea { .. } => {
        contain::contain_lea_leaves(self.f, n);
        self.f.next(n)
      }
      Kind::Call(..) => self.lower_call(n),
      Kind::Hwi(_) => self.lower_hwi(n),
    }
  }

  fn lower_call(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::Call(_, ref args) = self.f.nodes[n].kind else { unreachable!() };
    let args: smallvec::SmallVec<[NodeId; 4]> = args.iter().copied().collect();
    for a in args { contain::try_contain_imm(self.f, a); }
    self.f.next(n)
  }

  /// Flag value-producing nodes that nothing in the block consumes.
  fn flag_unused_values(&mut self) {
    let ids: Vec<NodeId> = self.f.block_iter(self.bl).collect();
    for n in ids {
      let node = &self.f.nodes[n];
      if node.kind.produces_value(node.ty) && !node.contained() &&
        self.f.find_use(self.bl, n).is_none()
      {
        self.f.nodes[n].flags.insert(NodeFlags::UNUSED_VALUE);
      }
    }
  }

  // -- shared helpers used by the per-kind files ---------------------------

  /// Create a node and link it just before `anchor`.
  pub(crate) fn emit_before(&mut self, anchor: NodeId, ty: Ty, kind: Kind) -> NodeId {
    let id = self.f.new_node(ty, kind);
    self.f.insert_before(self.bl, anchor, id);
    id
  }

  /// The use of `n` in the current block.
  pub(crate) fn use_of(&self, n: NodeId) -> Option<Use> { self.f.find_use(self.bl, n) }

  /// Replace the value `old` with `new` at `old`'s use, and unlink `old`'s
  /// now-dead tree. `new` must already be linked.
  pub(crate) fn replace_value(&mut self, old: NodeId, new: NodeId) {
    if let Some(u) = self.use_of(old) {
      self.f.replace_use(u, new);
    }
    self.f.remove_tree(self.bl, old);
  }

  /// Is optimization-dependent rewriting enabled?
  pub(crate) fn opts(&self) -> bool { self.cfg.opts }

  /// Create a hardware intrinsic node linked just before `anchor`.
  pub(crate) fn hwi_before(
    &mut self, anchor: NodeId, ty: Ty, id: Hwi, base: BaseTy, size: VecLen,
    ops: impl IntoIterator<Item = NodeId>,
  ) -> NodeId {
    let node = self.f.hwi(ty, id, base, size, ops);
    self.f.insert_before(self.bl, anchor, node);
    node
  }

  /// Replace `n`'s operator with a hardware intrinsic in place, keeping its
  /// position and use edge.
  pub(crate) fn retype_hwi(
    &mut self, n: NodeId, ty: Ty, id: Hwi, base: BaseTy, size: VecLen,
    ops: impl IntoIterator<Item = NodeId>,
  ) {
    let kind = Kind::Hwi(Box::new(HwiNode { id, base, size, ops: ops.into_iter().collect() }));
    self.f.retype(n, ty, kind);
  }

  /// An integer constant linked just before `anchor`, for immediate operands.
  pub(crate) fn icon_before(&mut self, anchor: NodeId, ty: BaseTy, v: i64) -> NodeId {
    let c = self.f.icon(ty, v);
    self.f.insert_before(self.bl, anchor, c);
    c
  }
}
