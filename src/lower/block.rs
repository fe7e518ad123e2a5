//! Block store (init/copy) strategy selection and stack argument placement.

use super::Lowering;
use crate::addr;
use crate::contain;
use crate::types::lir::{BlkStrategy, Helper, Kind, NodeId, PutArgKind};
use crate::types::Ty;

/// Above this multiple of the unroll limit, a helper call beats `rep stos/movs`
/// (the helper amortizes its setup and can use wider moves).
const HELPER_OVER_REP_FACTOR: u32 = 8;

impl Lowering<'_> {
  pub(super) fn lower_store_blk(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::StoreBlk { addr: dst, val, size, layout, init, strategy } = self.f.nodes[n].kind
      else { unreachable!() };
    if strategy != BlkStrategy::Unknown { return self.f.next(n) }

    let gc = layout.map(|l| self.f.layouts[l].has_gc()).unwrap_or(false);
    let on_stack = self.is_stack_address(dst);
    let choice = if init {
      self.pick_init_strategy(val, size, gc, on_stack)
    } else {
      self.pick_copy_strategy(size, gc)
    };
    if let Kind::StoreBlk { strategy, .. } = &mut self.f.nodes[n].kind { *strategy = choice }

    // destination address mode
    addr::fold_address(self.f, self.bl, n, 0, size.min(8));
    let a = self.f.nodes[n].kind.operand(0);
    if matches!(self.f.nodes[a].kind, Kind::Lea { .. } | Kind::LclAddr(..)) {
      self.f.nodes[a].make_contained();
      contain::contain_lea_leaves(self.f, a);
    }

    // a copy source indirection is consumed by the moves, not a register
    if !init {
      if let Kind::Ind(_) = self.f.nodes[val].kind {
        self.f.nodes[val].make_contained();
        addr::fold_address(self.f, self.bl, val, 0, size.min(8));
        let sa = self.f.nodes[val].kind.operand(0);
        if matches!(self.f.nodes[sa].kind, Kind::Lea { .. } | Kind::LclAddr(..)) {
          self.f.nodes[sa].make_contained();
          contain::contain_lea_leaves(self.f, sa);
        }
      }
    }
    self.f.next(n)
  }

  fn pick_init_strategy(
    &mut self, val: NodeId, size: u32, gc: bool, on_stack: bool,
  ) -> BlkStrategy {
    let zeroing = self.f.nodes[val].is_icon(0);
    if gc && !on_stack {
      // GC pointers on the heap must be zeroed pointer-at-a-time
      assert!(zeroing, "nonzero init over GC pointers");
      return if size > self.cfg.unroll_limit { BlkStrategy::Loop } else { BlkStrategy::Unroll }
    }
    let unroll = size <= self.cfg.unroll_limit ||
      self.rng.chance(self.cfg.stress_block_unroll);
    if unroll {
      // replicate the fill byte to a full register so the unroll stores 8 bytes
      // at a time (the store is 8-byte aligned when the size is)
      if_chain! {
        if size % 8 == 0;
        if let Some(b) = self.f.nodes[val].icon_value();
        if !zeroing;
        then {
          let pattern = (b as u8 as u64).wrapping_mul(0x0101_0101_0101_0101);
          self.f.nodes[val].ty = Ty::Scalar(crate::types::BaseTy::U64);
          self.f.nodes[val].kind = Kind::IntCon(pattern as i64);
        }
      }
      contain::try_contain_imm(self.f, val);
      return BlkStrategy::Unroll
    }
    if size <= self.cfg.unroll_limit * HELPER_OVER_REP_FACTOR {
      BlkStrategy::RepInstr
    } else {
      BlkStrategy::Helper(Helper::MemSet)
    }
  }

  fn pick_copy_strategy(&mut self, size: u32, gc: bool) -> BlkStrategy {
    if gc {
      // per-slot stores so pointer slots go through the write barrier; the
      // emitter collapses long pointer-free runs inside into string moves
      if size > self.cfg.unroll_limit * HELPER_OVER_REP_FACTOR {
        return BlkStrategy::Helper(Helper::GcMemCpy)
      }
      return BlkStrategy::UnrollGc
    }
    if size <= self.cfg.unroll_limit || self.rng.chance(self.cfg.stress_block_unroll) {
      BlkStrategy::Unroll
    } else if size <= self.cfg.unroll_limit * HELPER_OVER_REP_FACTOR {
      BlkStrategy::RepInstr
    } else {
      BlkStrategy::Helper(Helper::MemCpy)
    }
  }

  /// Is this address provably a stack location (so stores need no barrier and
  /// uninitialized GC slots are invisible to the collector)?
  fn is_stack_address(&self, addr: NodeId) -> bool {
    match self.f.nodes[addr].kind {
      Kind::LclAddr(..) => true,
      Kind::Lea { base, index, .. } => {
        index.get().is_none() &&
        base.get().is_some_and(|b| matches!(self.f.nodes[b].kind, Kind::LclAddr(..)))
      }
      _ => false,
    }
  }

  pub(super) fn lower_put_arg_stk(&mut self, n: NodeId) -> Option<NodeId> {
    let Kind::PutArgStk { src, layout, kind, .. } = self.f.nodes[n].kind else { unreachable!() };
    if kind != PutArgKind::Unknown { return self.f.next(n) }

    let choice = match self.f.nodes[src].kind {
      Kind::FieldList(ref fields) if !self.isa.bits64 => {
        // pushes walk the stack downward; reverse so they land in ascending
        // offset order
        let mut rev = fields.clone();
        rev.reverse();
        self.f.nodes[src].kind = Kind::FieldList(rev);
        self.f.nodes[src].make_contained();
        PutArgKind::Push
      }
      Kind::FieldList(_) => {
        self.f.nodes[src].make_contained();
        PutArgKind::Unroll
      }
      _ if self.f.nodes[src].ty == Ty::Struct => {
        let (size, gc) = layout.map_or((0, false), |l| {
          let l = &self.f.layouts[l];
          (l.size, l.has_gc())
        });
        if !self.isa.bits64 && (gc || size <= 16) {
          // pushes keep the GC reporting exact on 32-bit
          PutArgKind::Push
        } else if gc || size <= self.cfg.unroll_limit {
          PutArgKind::Unroll
        } else {
          PutArgKind::RepInstr
        }
      }
      _ => {
        contain::try_contain_imm(self.f, src);
        PutArgKind::Unroll
      }
    };
    if let Kind::PutArgStk { kind, .. } = &mut self.f.nodes[n].kind { *kind = choice }
    self.f.next(n)
  }
}
