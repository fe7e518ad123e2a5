//! Post-lowering consistency checks, run after every lowered function in
//! debug builds. Panics on the first violation; the messages name the node
//! so the failing LIR can be dumped from a test.

use bit_set::BitSet;
use hashbrown::HashMap;

use crate::contain::{node_effects, Effects};
use crate::types::lir::{BlkStrategy, Function, Kind, NodeFlags, NodeId, PutArgKind, RmwStatus};
use crate::types::Ty;
use crate::u32_as_usize;

/// Verify the structural invariants every lowered function must satisfy:
/// operand edges point backward, flag consumers follow their producer,
/// store strategies are resolved, contained nodes are legal, and mask
/// values only flow into mask-accepting slots.
pub fn check_function(f: &Function) {
  for (bl, _) in f.blocks.enum_iter() {
    let mut seen = BitSet::new();
    let mut uses: HashMap<NodeId, usize> = HashMap::new();

    for n in f.block_iter(bl) {
      let node = &f.nodes[n];
      node.kind.for_each_operand(|op| {
        assert!(seen.contains(u32_as_usize(op.0)),
          "operand {op:?} of {n:?} is not defined earlier in the block");
        *uses.entry(op).or_default() += 1;
      });
      seen.insert(u32_as_usize(n.0));

      match node.kind {
        Kind::Setcc(_) | Kind::Jcc(_) => {
          let mut prev = f.prev(n);
          while let Some(p) = prev {
            if !f.nodes[p].contained() { break }
            prev = f.prev(p);
          }
          let p = prev.unwrap_or_else(|| panic!("{n:?} has no flag producer"));
          assert!(node_effects(&f.nodes[p]).contains(Effects::FLAGS),
            "{n:?} follows {p:?}, which does not set the flags");
        }
        Kind::StoreInd { val, rmw, .. } => {
          assert!(rmw.is_resolved(), "unresolved RMW status on {n:?}");
          if rmw.is_rmw() { check_rmw_shape(f, n, val, rmw) }
        }
        Kind::StoreBlk { strategy, .. } =>
          assert!(strategy != BlkStrategy::Unknown, "unresolved block store strategy on {n:?}"),
        Kind::PutArgStk { kind, .. } =>
          assert!(kind != PutArgKind::Unknown, "unresolved stack argument strategy on {n:?}"),
        _ => {}
      }
    }

    for n in f.block_iter(bl) {
      let node = &f.nodes[n];
      let count = uses.get(&n).copied().unwrap_or(0);
      if node.contained() {
        assert_eq!(count, 1, "contained node {n:?} has {count} uses");
        check_contained(f, bl, n);
      } else if node.kind.produces_value(node.ty) && count == 0 {
        assert!(node.flags.contains(NodeFlags::UNUSED_VALUE),
          "dead value {n:?} is not flagged as unused");
      }
      check_mask_edges(f, n);
    }
  }
}

/// An RMW store's source operator reads the destination through a contained
/// load of the same address, in the operand slot the status names.
fn check_rmw_shape(f: &Function, st: NodeId, val: NodeId, rmw: RmwStatus) {
  let src = &f.nodes[val];
  assert!(matches!(src.kind, Kind::Binop(..) | Kind::Unop(..)),
    "RMW store {st:?} has a non-operator source {val:?}");
  let slot = if rmw == RmwStatus::Op2 { 1 } else { 0 };
  let ld = src.kind.operand(slot);
  assert!(matches!(f.nodes[ld].kind, Kind::Ind(_)) && f.nodes[ld].contained(),
    "RMW store {st:?}: operand {slot} of {val:?} is not a contained load");
}

fn check_contained(f: &Function, bl: crate::types::lir::BlockId, n: NodeId) {
  let node = &f.nodes[n];
  if node.flags.intersects(NodeFlags::EMB_BROADCAST | NodeFlags::EMB_MASK_OP) { return }
  match node.kind {
    Kind::IntCon(v) => {
      // a contained constant becomes an imm32, unless it feeds an embedded
      // broadcast (full 64-bit pattern) or carries a relocation
      let emb = f.find_use(bl, n)
        .is_some_and(|u| f.nodes[u.user].flags.contains(NodeFlags::EMB_BROADCAST));
      assert!(emb || (!node.flags.contains(NodeFlags::RELOC) &&
        i32::try_from(v).is_ok()), "contained constant {n:?} does not fit imm32");
    }
    Kind::FltCon(_) | Kind::VecCon(_) | Kind::LclFld(..) | Kind::LclAddr(..) => {}
    Kind::LclVar(lcl) => assert!(!f.locals[lcl].can_enregister(),
      "contained read of enregisterable local {lcl:?} at {n:?}"),
    Kind::Lea { index, scale, .. } => {
      if index.get().is_some() {
        assert!(matches!(scale, 1 | 2 | 4 | 8), "contained {n:?} has scale {scale}");
      }
    }
    Kind::Ind(_) => check_contained_load(f, bl, n),
    Kind::Binop(..) | Kind::Unop(..) => {
      // only legal as the source of an RMW store
      let u = f.find_use(bl, n).unwrap_or_else(|| panic!("contained {n:?} has no user"));
      assert!(matches!(f.nodes[u.user].kind, Kind::StoreInd { .. }),
        "contained operator {n:?} is used by {:?}, not a store", u.user);
    }
    _ => panic!("{n:?} ({:?}) may not be contained", node.kind),
  }
}

/// A contained load executes at its parent: nothing on the range between
/// definition and use may write memory, and if the load can fault, nothing
/// may throw first.
fn check_contained_load(f: &Function, bl: crate::types::lir::BlockId, n: NodeId) {
  let u = f.find_use(bl, n).unwrap_or_else(|| panic!("contained load {n:?} has no user"));
  let faults = !f.nodes[n].flags.contains(NodeFlags::NONFAULTING);
  let mut cur = f.next(n);
  while let Some(m) = cur {
    if m == u.user { return }
    if !f.nodes[m].contained() {
      let fx = node_effects(&f.nodes[m]);
      assert!(!fx.intersects(Effects::WRITE | Effects::BARRIER),
        "{m:?} writes memory between contained load {n:?} and its user {:?}", u.user);
      assert!(!(faults && fx.contains(Effects::THROW)),
        "{m:?} may throw between faulting load {n:?} and its user {:?}", u.user);
    }
    cur = f.next(m);
  }
  panic!("contained load {n:?} is not before its user {:?}", u.user);
}

/// Mask-register values may only flow into slots that take a `k` register.
fn check_mask_edges(f: &Function, n: NodeId) {
  let node = &f.nodes[n];
  let mut slot = 0u8;
  node.kind.for_each_operand(|op| {
    if f.nodes[op].ty == Ty::Mask {
      let ok = match node.kind {
        Kind::Hwi(ref h) => h.id.accepts_mask(slot),
        // mask-typed bitwise ops and spills keep the value in a k register
        Kind::Binop(..) => node.ty == Ty::Mask,
        Kind::StoreLcl(..) => true,
        _ => false,
      };
      assert!(ok, "mask value {op:?} flows into slot {slot} of {n:?}");
    }
    slot += 1;
  });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use super::check_function;
  use crate::isa::{Isa, LowerConfig};
  use crate::lower;
  use crate::types::layout::Local;
  use crate::types::lir::{Binop, Function, Kind};
  use crate::types::{BaseTy, Ty};

  #[test]
  fn lowered_function_passes() {
    let mut f = Function::new();
    let bl = f.new_block();
    let lcl = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I32), 4));
    let x = f.lcl_var(lcl);
    let c = f.icon(BaseTy::I32, 7);
    let add = f.binop(Binop::Add, Ty::Scalar(BaseTy::I32), x, c);
    let st = f.new_node(Ty::Void, Kind::StoreLcl(lcl, add));
    for n in [x, c, add, st] { f.append(bl, n) }
    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());
    check_function(&f);
  }

  #[test]
  #[should_panic(expected = "not defined earlier")]
  fn forward_operand_edge_is_rejected() {
    let mut f = Function::new();
    let bl = f.new_block();
    let lcl = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I32), 4));
    let x = f.lcl_var(lcl);
    let c = f.icon(BaseTy::I32, 1);
    let add = f.binop(Binop::Add, Ty::Scalar(BaseTy::I32), x, c);
    // operand `c` is appended after its user
    for n in [x, add, c] { f.append(bl, n) }
    check_function(&f);
  }
}
