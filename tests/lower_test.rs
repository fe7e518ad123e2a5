//! End-to-end lowering scenarios: whole blocks through `lower::run`, checked
//! against the shapes the emitter expects.

#![allow(clippy::unwrap_used)]

use lower64::hwi::Hwi;
use lower64::isa::{Isa, IsaFlags, LowerConfig};
use lower64::lower;
use lower64::types::layout::{Local, LocalId};
use lower64::types::lir::{Binop, BlockId, Function, Kind, NodeFlags, RmwStatus, VecConst};
use lower64::types::{BaseTy, Ty, VecLen};

fn i64_local(f: &mut Function) -> LocalId {
  f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I64), 8))
}

fn ptr_local(f: &mut Function) -> LocalId {
  f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U64), 8))
}

#[test]
fn increment_through_pointer_is_rmw() {
  let mut f = Function::new();
  let bl = f.new_block();
  let p = ptr_local(&mut f);
  let p1 = f.lcl_var(p);
  let ld = f.ind(Ty::Scalar(BaseTy::I32), p1);
  let c = f.icon(BaseTy::I32, 1);
  let add = f.binop(Binop::Add, Ty::Scalar(BaseTy::I32), ld, c);
  let p2 = f.lcl_var(p);
  let st = f.store_ind(p2, add);
  for n in [p1, ld, c, add, p2, st] { f.append(bl, n) }

  lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

  let Kind::StoreInd { rmw, .. } = f.nodes[st].kind else { panic!() };
  assert_eq!(rmw, RmwStatus::Op1);
  assert!(f.nodes[ld].contained(), "destination load must be contained");
  assert!(f.nodes[add].contained(), "source operator must be contained");
  assert!(f.nodes[c].contained(), "the increment folds as an immediate");
}

#[test]
fn multiply_by_nine_becomes_lea() {
  let mut f = Function::new();
  let bl = f.new_block();
  let x = i64_local(&mut f);
  let res = i64_local(&mut f);
  let xv = f.lcl_var(x);
  let c = f.icon(BaseTy::I64, 9);
  let mul = f.binop(Binop::Mul, Ty::Scalar(BaseTy::I64), xv, c);
  let st = f.new_node(Ty::Void, Kind::StoreLcl(res, mul));
  for n in [xv, c, mul, st] { f.append(bl, n) }

  lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

  let Kind::Lea { base, index, scale, disp } = f.nodes[mul].kind else {
    panic!("expected lea, got {:?}", f.nodes[mul].kind)
  };
  assert_eq!((base.get(), index.get()), (Some(xv), Some(xv)));
  assert_eq!((scale, disp), (8, 0));
}

#[test]
fn clear_lowest_bit_uses_blsr() {
  let mut f = Function::new();
  let bl = f.new_block();
  let x = i64_local(&mut f);
  let res = i64_local(&mut f);
  let x1 = f.lcl_var(x);
  let x2 = f.lcl_var(x);
  let m1 = f.icon(BaseTy::I64, -1);
  let add = f.binop(Binop::Add, Ty::Scalar(BaseTy::I64), x2, m1);
  let and = f.binop(Binop::And, Ty::Scalar(BaseTy::I64), x1, add);
  let st = f.new_node(Ty::Void, Kind::StoreLcl(res, and));
  for n in [x1, x2, m1, add, and, st] { f.append(bl, n) }

  let isa = Isa::new(IsaFlags::BMI1, true);
  lower::run(&mut f, &isa, &LowerConfig::default());

  let h = f.nodes[and].hwi().unwrap();
  assert_eq!(h.id, Hwi::ResetLowestSetBit);
  assert!(f.find_use(bl, add).is_none(), "the add chain is consumed");
}

#[test]
fn vector_equality_against_jump_fuses() {
  let mut f = Function::new();
  let bl = f.new_block();
  let la = f.locals.push(Local::scalar(Ty::Vec(VecLen::V32), 32));
  let lb = f.locals.push(Local::scalar(Ty::Vec(VecLen::V32), 32));
  let a = f.lcl_var(la);
  let b = f.lcl_var(lb);
  let eq = f.hwi(Ty::Scalar(BaseTy::U8), Hwi::Equality, BaseTy::I32, VecLen::V32, [a, b]);
  let jt = f.new_node(Ty::Void, Kind::JTrue(eq));
  for n in [a, b, eq, jt] { f.append(bl, n) }

  lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

  // the boolean materialization disappears into a direct branch on the
  // kortest flags
  assert!(matches!(f.nodes[jt].kind, Kind::Jcc(_)));
  assert!(f.find_use(bl, eq).is_none());
  let kortest = f.block_iter(bl)
    .find(|&n| f.nodes[n].hwi().is_some_and(|h| h.id == Hwi::Kortest));
  assert!(kortest.is_some(), "mask compare must feed a kortest");
}

#[test]
fn bitwise_chain_on_avx512_fuses_to_one_ternlog() {
  let mut f = Function::new();
  let bl = f.new_block();
  let v = Ty::Vec(VecLen::V64);
  let lcls: Vec<_> = (0..3)
    .map(|_| f.locals.push(Local::scalar(v, 64))).collect();
  let a = f.lcl_var(lcls[0]);
  let b = f.lcl_var(lcls[1]);
  let c = f.lcl_var(lcls[2]);
  let xor = f.hwi(v, Hwi::Xor, BaseTy::U32, VecLen::V64, [a, b]);
  let and = f.hwi(v, Hwi::And, BaseTy::U32, VecLen::V64, [xor, c]);
  let dst = f.locals.push(Local::scalar(v, 64));
  let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, and));
  for n in [a, b, c, xor, and, st] { f.append(bl, n) }

  lower::run(&mut f, &Isa::avx512(), &LowerConfig::default());

  let h = f.nodes[and].hwi().unwrap();
  assert_eq!(h.id, Hwi::TernaryLogic);
  assert!(f.nodes[h.ops[3]].is_icon(0x60), "A & (B ^ C)");
  assert!(f.find_use(bl, xor).is_none());
}

#[test]
fn unsigned_saturating_cast_selects_on_sign() {
  let mut f = Function::new();
  let bl = f.new_block();
  let src = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::F64), 8));
  let x = f.lcl_var(src);
  let c = f.new_node(Ty::Scalar(BaseTy::U64),
    Kind::Cast { src: x, from: BaseTy::F64, to: BaseTy::U64 });
  let dst = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U64), 8));
  let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, c));
  for n in [x, c, st] { f.append(bl, n) }

  lower::run(&mut f, &Isa::new(IsaFlags::SSE41, true), &LowerConfig::default());

  let sars = f.block_iter(bl)
    .filter(|&n| matches!(f.nodes[n].kind, Kind::Binop(Binop::Sar, ..))).count();
  assert_eq!(sars, 1, "the high-half select keys on the first conversion's sign");
  let converts = f.block_iter(bl)
    .filter(|&n| f.nodes[n].hwi()
      .is_some_and(|h| h.id == Hwi::ConvertToInt64WithTruncation))
    .count();
  assert_eq!(converts, 2, "plain and shifted-down conversions");
  // the stored value is the overflow-saturated OR
  let Kind::StoreLcl(_, v) = f.nodes[st].kind else { panic!() };
  assert!(matches!(f.nodes[v].kind, Kind::Binop(Binop::Or, ..)));
}

/// A block that exercises most of the rewrites at once.
fn mixed_block(f: &mut Function) -> BlockId {
  let bl = f.new_block();
  let p = ptr_local(f);
  let p1 = f.lcl_var(p);
  let ld = f.ind(Ty::Scalar(BaseTy::I64), p1);
  let nine = f.icon(BaseTy::I64, 9);
  let mul = f.binop(Binop::Mul, Ty::Scalar(BaseTy::I64), ld, nine);
  let res = i64_local(f);
  let st1 = f.new_node(Ty::Void, Kind::StoreLcl(res, mul));

  let v = Ty::Vec(VecLen::V64);
  let la = f.locals.push(Local::scalar(v, 64));
  let a = f.lcl_var(la);
  let splat = f.vec_con(VecConst::splat(VecLen::V64, BaseTy::I32, 7));
  let add = f.hwi(v, Hwi::Add, BaseTy::I32, VecLen::V64, [a, splat]);
  let dst = f.locals.push(Local::scalar(v, 64));
  let st2 = f.new_node(Ty::Void, Kind::StoreLcl(dst, add));

  for n in [p1, ld, nine, mul, st1, a, splat, add, st2] { f.append(bl, n) }
  bl
}

#[test]
fn lowering_twice_is_a_fixed_point() {
  let mut f = Function::new();
  let bl = mixed_block(&mut f);
  let isa = Isa::avx512();
  let cfg = LowerConfig::default();

  lower::run(&mut f, &isa, &cfg);
  let snapshot: Vec<(String, NodeFlags)> = f.block_iter(bl)
    .map(|n| (format!("{:?}", f.nodes[n].kind), f.nodes[n].flags))
    .collect();

  lower::run(&mut f, &isa, &cfg);
  let again: Vec<(String, NodeFlags)> = f.block_iter(bl)
    .map(|n| (format!("{:?}", f.nodes[n].kind), f.nodes[n].flags))
    .collect();
  assert_eq!(snapshot, again);
}
