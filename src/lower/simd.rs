//! SIMD intrinsic lowering: vector construction, element access, FMA sign
//! folding, dot products, and the generic containment pass for table-driven
//! intrinsics.
//!
//! The frontend forms ([`Hwi::Create`], [`Hwi::GetElement`],
//! [`Hwi::WithElement`], [`Hwi::Dot`]) never survive lowering; everything
//! else gets operand placement decided here.

use arrayvec::ArrayVec;
use itertools::Itertools;

use super::Lowering;
use crate::addr;
use crate::contain;
use crate::hwi::Hwi;
use crate::isa::IsaFlags;
use crate::types::layout::Local;
use crate::types::lir::{HwiNode, Kind, NodeFlags, NodeId, Unop, VecConst};
use crate::types::{BaseTy, Size, Ty, VecLen};

impl Lowering<'_> {
  pub(super) fn lower_hwi(&mut self, n: NodeId) -> Option<NodeId> {
    let id = self.f.nodes[n].hwi().expect("hwi").id;
    match id {
      Hwi::ConditionalSelect => self.lower_cnd_sel(n),
      Hwi::Equality | Hwi::Inequality => self.lower_equality(n),
      Hwi::Dot => self.lower_dot(n),
      Hwi::Create => self.lower_create(n),
      Hwi::CreateScalar => self.lower_create_scalar(n),
      Hwi::GetElement => self.lower_get_element(n),
      Hwi::WithElement => self.lower_with_element(n),
      Hwi::Insert => self.lower_insert(n),
      Hwi::TernaryLogic => self.lower_ternary_logic(n),
      Hwi::And | Hwi::Or | Hwi::Xor if matches!(self.f.nodes[n].ty, Ty::Vec(_)) =>
        self.lower_vec_bitwise(n),
      _ if id.fma_signs().is_some() => self.lower_fma(n),
      _ => self.contain_hwi_operands(n),
    }
  }

  /// A scalar value injected into lane 0 of a 128-bit vector (uppers undefined).
  pub(super) fn scalar_to_vec(&mut self, anchor: NodeId, base: BaseTy, x: NodeId) -> NodeId {
    self.hwi_before(anchor, Ty::Vec(VecLen::V16), Hwi::CreateScalarUnsafe, base, VecLen::V16, [x])
  }

  fn const_bits(&self, n: NodeId) -> Option<u64> {
    let node = &self.f.nodes[n];
    if node.flags.contains(NodeFlags::RELOC) { return None }
    match node.kind {
      Kind::IntCon(v) => Some(v as u64),
      Kind::FltCon(bits) => Some(bits),
      _ => None,
    }
  }

  /// Lower [`Hwi::Create`]: fold all-constant constructions, expand
  /// broadcasts, and otherwise assemble the vector from scalar insertions.
  fn lower_create(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;

    if let Some(bits) = h.ops.iter().map(|&op| self.const_bits(op)).collect::<Option<Vec<u64>>>() {
      let c = if bits.len() == 1 {
        VecConst::splat(len, base, bits[0])
      } else {
        let mut c = VecConst::zero(len);
        for (i, &bv) in bits.iter().enumerate() { c.set_lane(base, i as u32, bv) }
        c
      };
      self.f.retype(n, ty, Kind::VecCon(Box::new(c)));
      for op in h.ops {
        if self.f.use_count(self.bl, op) == 0 { self.f.remove(self.bl, op) }
      }
      return self.f.next(n)
    }

    if h.ops.len() == 1 { return self.lower_broadcast(n, &h) }
    self.lower_create_elements(n, &h)
  }

  fn lower_broadcast(&mut self, n: NodeId, h: &HwiNode) -> Option<NodeId> {
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;
    let cs = self.scalar_to_vec(n, base, h.ops[0]);
    match len {
      VecLen::V64 => {
        self.retype_hwi(n, ty, Hwi::BroadcastScalarToVector512, base, len, [cs]);
      }
      VecLen::V32 if self.isa.has(IsaFlags::AVX2) => {
        self.retype_hwi(n, ty, Hwi::BroadcastScalarToVector256, base, len, [cs]);
      }
      VecLen::V32 => {
        // AVX1: broadcast within 128 bits, then mirror into the upper half
        let lo = self.broadcast128(n, cs, base);
        let wide = self.hwi_before(n, ty, Hwi::ToVectorUnsafe, base, len, [lo]);
        let imm = self.icon_before(n, BaseTy::I32, 1);
        self.retype_hwi(n, ty, Hwi::InsertVector128, base, len, [wide, lo, imm]);
      }
      _ => {
        let v = self.broadcast128(n, cs, base);
        self.replace_value(n, v);
      }
    }
    Some(cs)
  }

  /// Emit a 128-bit splat of lane 0 of `cs` before `anchor` and return it.
  fn broadcast128(&mut self, anchor: NodeId, cs: NodeId, base: BaseTy) -> NodeId {
    let v16 = Ty::Vec(VecLen::V16);
    if self.isa.has(IsaFlags::AVX2) {
      return self.hwi_before(anchor, v16, Hwi::BroadcastScalarToVector128, base, VecLen::V16, [cs])
    }
    match base.size() {
      Size::S64 => self.hwi_before(anchor, v16, Hwi::UnpackLow, base, VecLen::V16, [cs, cs]),
      Size::S32 => {
        let imm = self.icon_before(anchor, BaseTy::I32, 0);
        self.hwi_before(anchor, v16, Hwi::Shuffle, base, VecLen::V16, [cs, cs, imm])
      }
      Size::S16 => {
        let u = self.hwi_before(anchor, v16, Hwi::UnpackLow, base, VecLen::V16, [cs, cs]);
        let imm = self.icon_before(anchor, BaseTy::I32, 0);
        self.hwi_before(anchor, v16, Hwi::Shuffle, BaseTy::U32, VecLen::V16, [u, u, imm])
      }
      Size::S8 => {
        let u1 = self.hwi_before(anchor, v16, Hwi::UnpackLow, base, VecLen::V16, [cs, cs]);
        let u2 = self.hwi_before(anchor, v16, Hwi::UnpackLow, BaseTy::U16, VecLen::V16, [u1, u1]);
        let imm = self.icon_before(anchor, BaseTy::I32, 0);
        self.hwi_before(anchor, v16, Hwi::Shuffle, BaseTy::U32, VecLen::V16, [u2, u2, imm])
      }
    }
  }

  fn lower_create_elements(&mut self, n: NodeId, h: &HwiNode) -> Option<NodeId> {
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;
    match len {
      // split into halves, then insert the high one over a widened low
      VecLen::V64 | VecLen::V32 => {
        let half = if len == VecLen::V64 { VecLen::V32 } else { VecLen::V16 };
        let half_ty = Ty::Vec(half);
        let mid = h.ops.len() / 2;
        let lo = self.hwi_before(n, half_ty, Hwi::Create, base, half, h.ops[..mid].iter().copied());
        let hi = self.hwi_before(n, half_ty, Hwi::Create, base, half, h.ops[mid..].iter().copied());
        let wide = self.hwi_before(n, ty, Hwi::ToVectorUnsafe, base, len, [lo]);
        let imm = self.icon_before(n, BaseTy::I32, 1);
        let ins = if len == VecLen::V64 { Hwi::InsertVector256 } else { Hwi::InsertVector128 };
        self.retype_hwi(n, ty, ins, base, len, [wide, hi, imm]);
        Some(lo)
      }
      _ => self.create128_elements(n, h),
    }
  }

  fn create128_elements(&mut self, n: NodeId, h: &HwiNode) -> Option<NodeId> {
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;
    let mut ops: ArrayVec<NodeId, 16> = h.ops.iter().copied().collect();
    // a 12-byte vector is four lanes with a well-defined zero fourth element
    if len == VecLen::V12 && ops.len() == 3 {
      let z = self.emit_before(n, Ty::Scalar(base), Kind::FltCon(0));
      ops.push(z);
    }

    if base.size() == Size::S64 {
      let c0 = self.scalar_to_vec(n, base, ops[0]);
      let c1 = self.scalar_to_vec(n, base, ops[1]);
      self.retype_hwi(n, ty, Hwi::UnpackLow, base, len, [c0, c1]);
      return Some(c0)
    }

    // pinsrw is baseline; pinsrb/d and insertps need SSE4.1
    let insert_ok = base.size() == Size::S16 ||
      (self.isa.has(IsaFlags::SSE41) && base != BaseTy::F64);
    if insert_ok {
      let first = self.scalar_to_vec(n, base, ops[0]);
      let mut acc = first;
      for (k, &x) in ops.iter().enumerate().skip(1) {
        let immv = if base == BaseTy::F32 { (k as i64) << 4 } else { k as i64 };
        let imm = self.icon_before(n, BaseTy::I32, immv);
        let src = if base == BaseTy::F32 { self.scalar_to_vec(n, base, x) } else { x };
        if k == ops.len() - 1 {
          self.retype_hwi(n, ty, Hwi::Insert, base, len, [acc, src, imm]);
        } else {
          acc = self.hwi_before(n, ty, Hwi::Insert, base, len, [acc, src, imm]);
        }
      }
      return Some(first)
    }

    if base == BaseTy::F32 {
      // SSE2: unpack pairs, then merge the halves
      let cs: ArrayVec<NodeId, 4> =
        ops.iter().map(|&x| self.scalar_to_vec(n, base, x)).collect();
      if cs.len() == 2 {
        self.retype_hwi(n, ty, Hwi::UnpackLow, base, len, [cs[0], cs[1]]);
      } else {
        let lo = self.hwi_before(n, ty, Hwi::UnpackLow, base, len, [cs[0], cs[1]]);
        let hi = self.hwi_before(n, ty, Hwi::UnpackLow, base, len, [cs[2], cs[3]]);
        self.retype_hwi(n, ty, Hwi::MoveLowToHigh, base, len, [lo, hi]);
      }
      return Some(cs[0])
    }

    // SSE2 integers: a binary unpack-low tree, widening each level
    let mut level: ArrayVec<NodeId, 16> =
      ops.iter().map(|&x| self.scalar_to_vec(n, base, x)).collect();
    let first = level[0];
    let mut b = base.to_unsigned();
    while level.len() > 2 {
      level = level.iter().copied().tuples()
        .map(|(x, y)| self.hwi_before(n, ty, Hwi::UnpackLow, b, len, [x, y]))
        .collect();
      b = match b.size() {
        Size::S8 => BaseTy::U16,
        Size::S16 => BaseTy::U32,
        _ => BaseTy::U64,
      };
    }
    self.retype_hwi(n, ty, Hwi::UnpackLow, b, len, [level[0], level[1]]);
    Some(first)
  }

  /// Lower [`Hwi::CreateScalar`]: small-integer sources must be zero extended
  /// in their GPR, since the narrowest zeroing SIMD move is 32 bits.
  fn lower_create_scalar(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let x = h.ops[0];
    if h.base.is_small_int() {
      let unsigned = h.base.to_unsigned();
      match self.f.nodes[x].kind {
        Kind::Cast { src, .. } => {
          self.f.retype(x, Ty::Scalar(BaseTy::U32),
            Kind::Cast { src, from: unsigned, to: BaseTy::U32 });
        }
        // zero-extending loads
        Kind::Ind(_) | Kind::LclFld(..) => { self.f.nodes[x].ty = Ty::Scalar(unsigned) }
        Kind::IntCon(v) => {
          let mask = (1i64 << (8 * h.base.bytes())) - 1;
          self.f.retype(x, Ty::Scalar(BaseTy::U32), Kind::IntCon(v & mask));
        }
        _ => {
          let c = self.emit_before(n, Ty::Scalar(BaseTy::U32),
            Kind::Cast { src: x, from: unsigned, to: BaseTy::U32 });
          if let Kind::Hwi(ref mut hh) = self.f.nodes[n].kind { hh.ops[0] = c }
          return Some(c)
        }
      }
    }
    self.f.next(n)
  }

  /// Lower [`Hwi::GetElement`]: refold loads, peel wide vectors down to a
  /// 128-bit lane, use the extract instructions where they exist, and fall
  /// back to a stack reload for variable indices.
  fn lower_get_element(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (v, idx) = (h.ops[0], h.ops[1]);
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;
    let Some(iv) = self.f.nodes[idx].icon_value() else {
      return self.element_load_via_stack(n, v, idx, base, len)
    };
    let iv = iv as u32;
    debug_assert!(iv < len.lanes(base), "lane index out of range");

    if len.reg_bytes() > 16 {
      let per = VecLen::V16.lanes(base);
      let lane_src = if iv < per {
        self.hwi_before(n, Ty::Vec(VecLen::V16), Hwi::GetLower128, base, len, [v])
      } else {
        let imm = self.icon_before(n, BaseTy::I32, (iv / per).into());
        self.hwi_before(n, Ty::Vec(VecLen::V16), Hwi::ExtractVector128, base, len, [v, imm])
      };
      let sub = self.icon_before(n, BaseTy::I32, (iv % per).into());
      self.f.remove(self.bl, idx);
      self.retype_hwi(n, ty, Hwi::GetElement, base, VecLen::V16, [lane_src, sub]);
      return Some(lane_src)
    }

    // a load feeding only this lane refolds into a narrow load at the offset
    if_chain! {
      if matches!(self.f.nodes[v].kind, Kind::Ind(_));
      if self.f.has_single_use(self.bl, v, n);
      if contain::is_safe_to_contain_mem(self.f, &mut self.acc, v, n, None);
      then {
        let off = i64::from(iv) * i64::from(base.bytes());
        if off == 0 || addr::add_offset(self.f, self.bl, v, off, base.bytes()) {
          self.f.nodes[v].ty = Ty::Scalar(base);
          if let Some(u) = self.use_of(n) { self.f.replace_use(u, v) }
          self.f.remove(self.bl, n);
          self.f.remove(self.bl, idx);
          return Some(v)
        }
      }
    }

    // a spilled local vector reads the lane straight from its stack slot
    if_chain! {
      if let Kind::LclVar(lcl) = self.f.nodes[v].kind;
      if !self.f.locals[lcl].can_enregister();
      then {
        self.f.retype(n, Ty::Scalar(base), Kind::LclFld(lcl, iv * base.bytes()));
        self.f.remove(self.bl, idx);
        if self.f.use_count(self.bl, v) == 0 { self.f.remove(self.bl, v) }
        return self.f.next(n)
      }
    }

    // lane 0 of a 4/8-byte type is just the register view
    if iv == 0 && !base.is_small_int() {
      self.f.remove(self.bl, idx);
      self.retype_hwi(n, ty, Hwi::ToScalar, base, len, [v]);
      return self.f.next(n)
    }

    match base {
      BaseTy::F32 if !self.isa.has(IsaFlags::SSE41) => {
        // no extractps: replicate the lane down, then read lane 0
        let imm = self.icon_before(n, BaseTy::I32, i64::from(iv) * 0x55);
        let sh = self.hwi_before(n, Ty::Vec(len), Hwi::Shuffle, base, len, [v, v, imm]);
        self.f.remove(self.bl, idx);
        self.retype_hwi(n, ty, Hwi::ToScalar, base, len, [sh]);
        self.f.next(n)
      }
      BaseTy::F64 => {
        // iv == 1; lane 0 was handled above
        let u = self.hwi_before(n, Ty::Vec(len), Hwi::UnpackHigh, base, len, [v, v]);
        self.f.remove(self.bl, idx);
        self.retype_hwi(n, ty, Hwi::ToScalar, base, len, [u]);
        self.f.next(n)
      }
      _ => {
        // pextrw is baseline; pextrb/d/q need SSE4.1
        if base.size() != Size::S16 && !self.isa.has(IsaFlags::SSE41) {
          return self.element_load_via_stack(n, v, idx, base, len)
        }
        self.retype_hwi(n, ty, Hwi::Extract, base, len, [v, idx]);
        // the extract zero-extends; signed small lanes need a sign extension
        if base.is_signed() && base.is_small_int() {
          let u = self.use_of(n);
          let c = self.f.new_node(Ty::Scalar(BaseTy::I32),
            Kind::Cast { src: n, from: base, to: BaseTy::I32 });
          self.f.insert_after(self.bl, n, c);
          if let Some(u) = u { self.f.replace_use(u, c) }
        }
        self.contain_hwi_operands(n)
      }
    }
  }

  /// Spill `v` to a do-not-enregister local and load the element through an
  /// address mode over the spill slot.
  fn element_load_via_stack(
    &mut self, n: NodeId, v: NodeId, idx: NodeId, base: BaseTy, len: VecLen,
  ) -> Option<NodeId> {
    let lcl = self.spill_local(len);
    let st = self.emit_before(n, Ty::Void, Kind::StoreLcl(lcl, v));
    let la = self.emit_before(n, Ty::Scalar(BaseTy::U64), Kind::LclAddr(lcl, 0));
    let lea = self.emit_before(n, Ty::Scalar(BaseTy::U64), Kind::Lea {
      base: la.into(), index: idx.into(), scale: base.bytes() as u8, disp: 0,
    });
    self.f.retype(n, Ty::Scalar(base), Kind::Ind(lea));
    Some(st)
  }

  fn spill_local(&mut self, len: VecLen) -> crate::types::layout::LocalId {
    let mut lcl = Local::scalar(Ty::Vec(len), len.bytes());
    lcl.set_do_not_enregister();
    self.f.locals.push(lcl)
  }

  /// Lower [`Hwi::WithElement`]: use the insert instructions where they
  /// exist, rewrite the containing 128-bit lane for wide vectors, and fall
  /// back to a stack store for variable indices or missing instructions.
  fn lower_with_element(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (v, idx, x) = (h.ops[0], h.ops[1], h.ops[2]);
    let (base, len) = (h.base, h.size);
    let ty = self.f.nodes[n].ty;
    let Some(iv) = self.f.nodes[idx].icon_value() else {
      return self.element_store_via_stack(n, v, idx, x, base, len)
    };
    let iv = iv as u32;
    debug_assert!(iv < len.lanes(base), "lane index out of range");

    if len.reg_bytes() > 16 {
      // spill, rewrite the containing 128-bit lane, reinsert it
      let per = VecLen::V16.lanes(base);
      let lcl = self.spill_local(len);
      let st = self.emit_before(n, Ty::Void, Kind::StoreLcl(lcl, v));
      let v1 = self.emit_before(n, ty, Kind::LclVar(lcl));
      let lane_imm = self.icon_before(n, BaseTy::I32, (iv / per).into());
      let ext = self.hwi_before(n, Ty::Vec(VecLen::V16), Hwi::ExtractVector128, base, len,
        [v1, lane_imm]);
      let sub = self.icon_before(n, BaseTy::I32, (iv % per).into());
      let we = self.hwi_before(n, Ty::Vec(VecLen::V16), Hwi::WithElement, base, VecLen::V16,
        [ext, sub, x]);
      let v2 = self.emit_before(n, ty, Kind::LclVar(lcl));
      let ins_imm = self.icon_before(n, BaseTy::I32, (iv / per).into());
      self.f.remove(self.bl, idx);
      self.retype_hwi(n, ty, Hwi::InsertVector128, base, len, [v2, we, ins_imm]);
      return Some(st)
    }

    match base {
      BaseTy::I16 | BaseTy::U16 => {
        self.f.retype(idx, Ty::Scalar(BaseTy::I32), Kind::IntCon(iv.into()));
        self.retype_hwi(n, ty, Hwi::Insert, base, len, [v, x, idx]);
        Some(n)
      }
      BaseTy::F64 => {
        let cs = self.scalar_to_vec(n, base, x);
        self.f.remove(self.bl, idx);
        let id = if iv == 0 { Hwi::MoveScalar } else { Hwi::UnpackLow };
        self.retype_hwi(n, ty, id, base, len, [v, cs]);
        Some(n)
      }
      BaseTy::F32 if self.isa.has(IsaFlags::SSE41) => {
        let cs = self.scalar_to_vec(n, base, x);
        self.f.retype(idx, Ty::Scalar(BaseTy::I32), Kind::IntCon(i64::from(iv) << 4));
        self.retype_hwi(n, ty, Hwi::Insert, base, len, [v, cs, idx]);
        Some(n)
      }
      BaseTy::F32 => {
        let cs = self.scalar_to_vec(n, base, x);
        self.f.remove(self.bl, idx);
        if iv == 0 {
          self.retype_hwi(n, ty, Hwi::MoveScalar, base, len, [v, cs]);
          return Some(n)
        }
        // two shufps: gather the new lane next to the survivors, then
        // arrange the four lanes back in order
        let (c1, c2, new_first) = match iv {
          1 => (0x00, 0xe2, true),
          2 => (0xf0, 0x84, false),
          _ => (0xa0, 0x24, false),
        };
        let i1 = self.icon_before(n, BaseTy::I32, c1);
        let t = self.hwi_before(n, ty, Hwi::Shuffle, base, len, [cs, v, i1]);
        let i2 = self.icon_before(n, BaseTy::I32, c2);
        let ops = if new_first { [t, v, i2] } else { [v, t, i2] };
        self.retype_hwi(n, ty, Hwi::Shuffle, base, len, ops);
        Some(n)
      }
      _ if self.isa.has(IsaFlags::SSE41) => {
        self.f.retype(idx, Ty::Scalar(BaseTy::I32), Kind::IntCon(iv.into()));
        self.retype_hwi(n, ty, Hwi::Insert, base, len, [v, x, idx]);
        Some(n)
      }
      // no pinsrb/d/q: go through the stack
      _ => self.element_store_via_stack(n, v, idx, x, base, len),
    }
  }

  /// Spill `v`, store the element into the spill slot, and read the whole
  /// vector back.
  fn element_store_via_stack(
    &mut self, n: NodeId, v: NodeId, idx: NodeId, x: NodeId, base: BaseTy, len: VecLen,
  ) -> Option<NodeId> {
    let lcl = self.spill_local(len);
    let st = self.emit_before(n, Ty::Void, Kind::StoreLcl(lcl, v));
    let la = self.emit_before(n, Ty::Scalar(BaseTy::U64), Kind::LclAddr(lcl, 0));
    let lea = self.emit_before(n, Ty::Scalar(BaseTy::U64), Kind::Lea {
      base: la.into(), index: idx.into(), scale: base.bytes() as u8, disp: 0,
    });
    let si = self.f.store_ind(lea, x);
    self.f.insert_before(self.bl, n, si);
    self.f.retype(n, Ty::Vec(len), Kind::LclVar(lcl));
    Some(st)
  }

  /// Fold negations of FMA operands into the intrinsic's sign pattern:
  /// negating either factor flips the product, negating the addend flips
  /// add to subtract.
  fn lower_fma(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (mut negated, mut subtract, scalar) = h.id.fma_signs().expect("fma");
    debug_assert!(h.base.is_float());
    let sign_bit = if h.base == BaseTy::F32 { 0x8000_0000 } else { 1 << 63 };

    for slot in 0..3 {
      let op = self.f.nodes[n].hwi().expect("hwi").ops[slot];
      // scalar forms wrap the negation inside the lane-0 injection
      let (holder, inner) = if_chain! {
        if scalar;
        if let Some(ih) = self.f.nodes[op].hwi();
        if ih.id == Hwi::CreateScalarUnsafe;
        let io = ih.ops[0];
        if self.f.has_single_use(self.bl, op, n);
        then { (Some(op), io) } else { (None, op) }
      };
      let user = holder.unwrap_or(n);
      let stripped = match self.f.nodes[inner].kind {
        Kind::Unop(Unop::Neg, x) if self.f.has_single_use(self.bl, inner, user) =>
          Some((x, None)),
        Kind::Hwi(ref ih) if ih.id == Hwi::Xor => {
          if_chain! {
            let (a, b) = (ih.ops[0], ih.ops[1]);
            if let Kind::VecCon(ref vc) = self.f.nodes[b].kind;
            if vc.broadcast_of(h.base) == Some(sign_bit);
            if self.f.has_single_use(self.bl, inner, user);
            if self.f.has_single_use(self.bl, b, inner);
            then { Some((a, Some(b))) } else { None }
          }
        }
        _ => None,
      };
      if let Some((x, extra)) = stripped {
        if slot == 2 { subtract = !subtract } else { negated = !negated }
        match holder {
          Some(hn) => if let Kind::Hwi(ref mut hh) = self.f.nodes[hn].kind { hh.ops[0] = x },
          None => if let Kind::Hwi(ref mut hh) = self.f.nodes[n].kind { hh.ops[slot] = x },
        }
        self.f.remove(self.bl, inner);
        if let Some(e) = extra { self.f.remove(self.bl, e) }
      }
    }

    let id = Hwi::fma_select(negated, subtract, scalar);
    if let Kind::Hwi(ref mut hh) = self.f.nodes[n].kind { hh.id = id }
    self.contain_hwi_operands(n)
  }

  /// Lower [`Hwi::Dot`] to `dpps`/`dppd` where available, otherwise a
  /// multiply followed by a horizontal reduction ladder.
  fn lower_dot(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    let (a, b) = (h.ops[0], h.ops[1]);
    let (base, len) = (h.base, h.size);
    if base.is_float() { self.lower_dot_float(n, a, b, base, len) }
    else { self.lower_dot_int(n, a, b, base, len) }
  }

  fn lower_dot_float(
    &mut self, n: NodeId, a: NodeId, b: NodeId, base: BaseTy, len: VecLen,
  ) -> Option<NodeId> {
    let ty = self.f.nodes[n].ty;
    let v16 = Ty::Vec(VecLen::V16);
    match len {
      VecLen::V32 if base == BaseTy::F32 => {
        // vdpps reduces within each 128-bit lane; add the lane results
        let ctrl = self.icon_before(n, BaseTy::I32, 0xf1);
        let d = self.hwi_before(n, Ty::Vec(len), Hwi::DotProduct, base, len, [a, b, ctrl]);
        let imm = self.icon_before(n, BaseTy::I32, 1);
        let hi = self.hwi_before(n, v16, Hwi::ExtractVector128, base, len, [d, imm]);
        let lo = self.hwi_before(n, v16, Hwi::GetLower128, base, len, [d]);
        let s = self.hwi_before(n, v16, Hwi::Add, base, VecLen::V16, [lo, hi]);
        self.retype_hwi(n, ty, Hwi::ToScalar, base, VecLen::V16, [s]);
        Some(d)
      }
      VecLen::V32 => {
        // no 256-bit dppd
        let m = self.hwi_before(n, Ty::Vec(len), Hwi::Multiply, base, len, [a, b]);
        let imm = self.icon_before(n, BaseTy::I32, 1);
        let hi = self.hwi_before(n, v16, Hwi::ExtractVector128, base, len, [m, imm]);
        let lo = self.hwi_before(n, v16, Hwi::GetLower128, base, len, [m]);
        let s = self.hwi_before(n, v16, Hwi::Add, base, VecLen::V16, [lo, hi]);
        let u = self.hwi_before(n, v16, Hwi::UnpackHigh, base, VecLen::V16, [s, s]);
        let s2 = self.hwi_before(n, v16, Hwi::Add, base, VecLen::V16, [s, u]);
        self.retype_hwi(n, ty, Hwi::ToScalar, base, VecLen::V16, [s2]);
        Some(m)
      }
      _ => {
        let (mut a, mut b) = (a, b);
        let mut first = None;
        if len == VecLen::V12 {
          // zero the unused fourth lane of both inputs so a stray NaN or
          // junk value cannot leak into the sum
          let mut mc = VecConst::zero(VecLen::V16);
          for i in 0..3 { mc.set_lane(BaseTy::F32, i, 0xffff_ffff) }
          for v in [&mut a, &mut b] {
            let c = self.f.vec_con(mc.clone());
            self.f.insert_before(self.bl, n, c);
            if first.is_none() { first = Some(c) }
            *v = self.hwi_before(n, Ty::Vec(len), Hwi::And, base, len, [*v, c]);
          }
        }
        if self.isa.has(IsaFlags::SSE41) {
          let ctrl = match len {
            VecLen::V8 => 0x31,
            VecLen::V12 => 0x71,
            _ if base == BaseTy::F64 => 0x31,
            _ => 0xf1,
          };
          let imm = self.icon_before(n, BaseTy::I32, ctrl);
          let d = self.hwi_before(n, Ty::Vec(len), Hwi::DotProduct, base, len, [a, b, imm]);
          self.retype_hwi(n, ty, Hwi::ToScalar, base, len, [d]);
          return Some(first.unwrap_or(d))
        }
        // SSE2: multiply, then a shuffle-add ladder
        let m = self.hwi_before(n, Ty::Vec(len), Hwi::Multiply, base, len, [a, b]);
        let s = if base == BaseTy::F64 {
          let u = self.hwi_before(n, Ty::Vec(len), Hwi::UnpackHigh, base, len, [m, m]);
          self.hwi_before(n, Ty::Vec(len), Hwi::Add, base, len, [m, u])
        } else {
          let i1 = self.icon_before(n, BaseTy::I32, 0xb1);
          let sh1 = self.hwi_before(n, Ty::Vec(len), Hwi::Shuffle, base, len, [m, m, i1]);
          let s1 = self.hwi_before(n, Ty::Vec(len), Hwi::Add, base, len, [m, sh1]);
          if len == VecLen::V8 { s1 } else {
            let i2 = self.icon_before(n, BaseTy::I32, 0x4e);
            let sh2 = self.hwi_before(n, Ty::Vec(len), Hwi::Shuffle, base, len, [s1, s1, i2]);
            self.hwi_before(n, Ty::Vec(len), Hwi::Add, base, len, [s1, sh2])
          }
        };
        self.retype_hwi(n, ty, Hwi::ToScalar, base, len, [s]);
        Some(first.unwrap_or(m))
      }
    }
  }

  fn lower_dot_int(
    &mut self, n: NodeId, a: NodeId, b: NodeId, base: BaseTy, len: VecLen,
  ) -> Option<NodeId> {
    let ty = self.f.nodes[n].ty;
    let v16 = Ty::Vec(VecLen::V16);
    let m = self.hwi_before(n, Ty::Vec(len), Hwi::Multiply, base, len, [a, b]);
    let mut v = m;
    if len == VecLen::V32 {
      let imm = self.icon_before(n, BaseTy::I32, 1);
      let hi = self.hwi_before(n, v16, Hwi::ExtractVector128, base, len, [v, imm]);
      let lo = self.hwi_before(n, v16, Hwi::GetLower128, base, len, [v]);
      v = self.hwi_before(n, v16, Hwi::Add, base, VecLen::V16, [lo, hi]);
    }
    if base.size() == Size::S64 {
      let u = self.hwi_before(n, v16, Hwi::UnpackHigh, base, VecLen::V16, [v, v]);
      v = self.hwi_before(n, v16, Hwi::Add, base, VecLen::V16, [v, u]);
    } else if self.isa.has(IsaFlags::SSSE3) {
      let rounds = VecLen::V16.lanes(base).trailing_zeros();
      for _ in 0..rounds {
        v = self.hwi_before(n, v16, Hwi::HorizontalAdd, base, VecLen::V16, [v, v]);
      }
    } else {
      // pshufd (and pshuflw for word lanes) + padd ladder
      for ctrl in [0x4e, 0xb1] {
        let imm = self.icon_before(n, BaseTy::I32, ctrl);
        let sh = self.hwi_before(n, v16, Hwi::Shuffle, BaseTy::U32, VecLen::V16, [v, v, imm]);
        v = self.hwi_before(n, v16, Hwi::Add, base, VecLen::V16, [v, sh]);
      }
      if base.size() == Size::S16 {
        let imm = self.icon_before(n, BaseTy::I32, 0xb1);
        let sh = self.hwi_before(n, v16, Hwi::Shuffle, BaseTy::U16, VecLen::V16, [v, v, imm]);
        v = self.hwi_before(n, v16, Hwi::Add, base, VecLen::V16, [v, sh]);
      }
    }
    self.retype_hwi(n, ty, Hwi::ToScalar, base, VecLen::V16, [v]);
    Some(m)
  }

  /// Lower [`Hwi::Insert`]: fold a chained insertion of a zero constant into
  /// the outer `insertps` zmask, then run containment.
  fn lower_insert(&mut self, n: NodeId) -> Option<NodeId> {
    let h = self.f.nodes[n].hwi().expect("hwi").clone();
    if h.base == BaseTy::F32 {
      let (v, imm) = (h.ops[0], h.ops[2]);
      if_chain! {
        if let Some(inner) = self.f.nodes[v].hwi();
        if inner.id == Hwi::Insert && inner.base == BaseTy::F32;
        let (iv, ix, ii) = (inner.ops[0], inner.ops[1], inner.ops[2]);
        if self.f.has_single_use(self.bl, v, n);
        if matches!(self.f.nodes[ix].kind, Kind::VecCon(ref vc) if vc.is_zero());
        if let Some(i1) = self.f.nodes[ii].icon_value();
        if let Some(i2) = self.f.nodes[imm].icon_value();
        then {
          // the inner insert wrote a zero lane; express it as a zmask bit
          let lane = ((i1 as u8) >> 4) & 3;
          let merged = (i2 as u8) | (1 << lane) | (i1 as u8 & 0x0f);
          self.f.nodes[imm].kind = Kind::IntCon(merged.into());
          if let Kind::Hwi(ref mut hh) = self.f.nodes[n].kind { hh.ops[0] = iv }
          self.f.remove(self.bl, v);
          for z in [ix, ii] {
            if self.f.use_count(self.bl, z) == 0 { self.f.remove(self.bl, z) }
          }
          return Some(n)
        }
      }
    }
    self.contain_hwi_operands(n)
  }

  /// The generic containment pass for intrinsics that reached their final
  /// form: contain the immediate, try the EVEX folds, then place one memory
  /// or reg-optional operand.
  pub(super) fn contain_hwi_operands(&mut self, n: NodeId) -> Option<NodeId> {
    let id = self.f.nodes[n].hwi().expect("hwi").id;
    if let Some(slot) = id.imm_slot() {
      let imm = self.f.nodes[n].hwi().expect("hwi").ops[slot as usize];
      contain::try_contain_imm(self.f, imm);
    }
    if self.isa.embedded_broadcast() {
      crate::evex::try_fold_broadcast(self.f, self.bl, n);
    }
    if id == Hwi::BlendVariableMask && self.isa.embedded_masking() {
      crate::evex::fold_embedded_mask(self.f, &mut self.acc, self.bl, n);
    }
    if id.one_mem_op() {
      let h = self.f.nodes[n].hwi().expect("hwi").clone();
      let slot = h.id.mem_slot() as usize;
      let c = h.ops[slot];
      if !self.f.nodes[c].contained() && self.f.nodes[c].ty != Ty::Mask {
        if !contain::try_contain_mem(self.f, &mut self.acc, self.bl, n, c) {
          if h.id.commutative() && slot == 1 &&
            contain::try_contain_mem(self.f, &mut self.acc, self.bl, n, h.ops[0])
          {
            if let Kind::Hwi(ref mut hh) = self.f.nodes[n].kind { hh.ops.swap(0, 1) }
          } else {
            contain::try_reg_optional(self.f, self.bl, n, c);
          }
        }
      }
    }
    self.f.next(n)
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use crate::hwi::Hwi;
  use crate::isa::{Isa, IsaFlags, LowerConfig};
  use crate::lower;
  use crate::types::layout::{Local, LocalId};
  use crate::types::lir::{Function, Kind, VecConst};
  use crate::types::{BaseTy, Ty, VecLen};

  fn vec_local(f: &mut Function, len: VecLen) -> LocalId {
    f.locals.push(Local::scalar(Ty::Vec(len), len.bytes()))
  }

  fn store_to_local(f: &mut Function, len: VecLen, val: crate::types::lir::NodeId)
    -> crate::types::lir::NodeId
  {
    let dst = vec_local(f, len);
    f.new_node(Ty::Void, Kind::StoreLcl(dst, val))
  }

  #[test]
  fn all_constant_create_folds() {
    let mut f = Function::new();
    let bl = f.new_block();
    let c: Vec<_> = (0..4).map(|i| f.icon(BaseTy::I32, i + 1)).collect();
    let v = f.hwi(Ty::Vec(VecLen::V16), Hwi::Create, BaseTy::I32, VecLen::V16,
      c.iter().copied());
    let st = store_to_local(&mut f, VecLen::V16, v);
    for &n in c.iter().chain([v, st].iter()) { f.append(bl, n) }

    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

    let Kind::VecCon(ref vc) = f.nodes[v].kind else { panic!("expected constant") };
    for i in 0..4 { assert_eq!(vc.lane(BaseTy::I32, i), u64::from(i) + 1) }
    // the scalar constants are gone
    for &n in &c { assert!(f.find_use(bl, n).is_none()) }
    let live: Vec<_> = f.block_iter(bl).collect();
    assert_eq!(live, vec![v, st]);
  }

  #[test]
  fn broadcast_create_on_avx2() {
    let mut f = Function::new();
    let bl = f.new_block();
    let lcl = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::F32), 4));
    let x = f.lcl_var(lcl);
    let v = f.hwi(Ty::Vec(VecLen::V32), Hwi::Create, BaseTy::F32, VecLen::V32, [x]);
    let st = store_to_local(&mut f, VecLen::V32, v);
    for n in [x, v, st] { f.append(bl, n) }

    let isa = Isa::new(IsaFlags::AVX2, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    let h = f.nodes[v].hwi().unwrap();
    assert_eq!(h.id, Hwi::BroadcastScalarToVector256);
    let cs = f.nodes[h.ops[0]].hwi().unwrap();
    assert_eq!(cs.id, Hwi::CreateScalarUnsafe);
    assert_eq!(cs.ops[0], x);
  }

  #[test]
  fn get_element_refolds_load() {
    let mut f = Function::new();
    let bl = f.new_block();
    let ptr = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U64), 8));
    let p = f.lcl_var(ptr);
    let ld = f.ind(Ty::Vec(VecLen::V16), p);
    let idx = f.icon(BaseTy::I32, 2);
    let ge = f.hwi(Ty::Scalar(BaseTy::I32), Hwi::GetElement, BaseTy::I32, VecLen::V16, [ld, idx]);
    let dst = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::I32), 4));
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, ge));
    for n in [p, ld, idx, ge, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

    // the vector load became a scalar load at offset 8, feeding the store
    assert_eq!(f.nodes[ld].ty, Ty::Scalar(BaseTy::I32));
    assert!(matches!(f.nodes[st].kind, Kind::StoreLcl(_, v) if v == ld));
    let Kind::Ind(addr) = f.nodes[ld].kind else { panic!("expected load") };
    assert!(matches!(f.nodes[addr].kind, Kind::Lea { disp: 8, .. }));
    assert!(f.find_use(bl, ge).is_none());
  }

  #[test]
  fn with_element_f32_uses_insertps() {
    let mut f = Function::new();
    let bl = f.new_block();
    let lv = vec_local(&mut f, VecLen::V16);
    let lx = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::F32), 4));
    let v = f.lcl_var(lv);
    let x = f.lcl_var(lx);
    let idx = f.icon(BaseTy::I32, 2);
    let we = f.hwi(Ty::Vec(VecLen::V16), Hwi::WithElement, BaseTy::F32, VecLen::V16, [v, idx, x]);
    let st = store_to_local(&mut f, VecLen::V16, we);
    for n in [v, x, idx, we, st] { f.append(bl, n) }

    let isa = Isa::new(IsaFlags::SSE41, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    let h = f.nodes[we].hwi().unwrap();
    assert_eq!(h.id, Hwi::Insert);
    assert_eq!(h.ops[0], v);
    assert_eq!(f.nodes[h.ops[1]].hwi().unwrap().id, Hwi::CreateScalarUnsafe);
    // destination lane 2 in the insertps control's high nibble
    assert!(f.nodes[h.ops[2]].is_icon(0x20));
  }

  #[test]
  fn fma_negated_factor_selects_fnmadd() {
    let mut f = Function::new();
    let bl = f.new_block();
    let v16 = Ty::Vec(VecLen::V16);
    let lcl = [vec_local(&mut f, VecLen::V16), vec_local(&mut f, VecLen::V16),
      vec_local(&mut f, VecLen::V16)];
    let a = f.lcl_var(lcl[0]);
    let b = f.lcl_var(lcl[1]);
    let c = f.lcl_var(lcl[2]);
    let sign = f.vec_con(VecConst::splat(VecLen::V16, BaseTy::F32, 0x8000_0000));
    let neg_a = f.hwi(v16, Hwi::Xor, BaseTy::F32, VecLen::V16, [a, sign]);
    let fma = f.hwi(v16, Hwi::MultiplyAdd, BaseTy::F32, VecLen::V16, [neg_a, b, c]);
    let st = store_to_local(&mut f, VecLen::V16, fma);
    for n in [a, b, c, sign, neg_a, fma, st] { f.append(bl, n) }

    let isa = Isa::new(IsaFlags::FMA | IsaFlags::AVX2, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    let h = f.nodes[fma].hwi().unwrap();
    assert_eq!(h.id, Hwi::MultiplyAddNegated);
    assert_eq!(&h.ops[..], &[a, b, c]);
    assert!(f.find_use(bl, neg_a).is_none());
  }

  #[test]
  fn dot_v12_masks_both_inputs() {
    let mut f = Function::new();
    let bl = f.new_block();
    let la = vec_local(&mut f, VecLen::V12);
    let lb = vec_local(&mut f, VecLen::V12);
    let a = f.lcl_var(la);
    let b = f.lcl_var(lb);
    let dot = f.hwi(Ty::Scalar(BaseTy::F32), Hwi::Dot, BaseTy::F32, VecLen::V12, [a, b]);
    let dst = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::F32), 4));
    let st = f.new_node(Ty::Void, Kind::StoreLcl(dst, dot));
    for n in [a, b, dot, st] { f.append(bl, n) }

    let isa = Isa::new(IsaFlags::SSE41, true);
    lower::run(&mut f, &isa, &LowerConfig::default());

    let h = f.nodes[dot].hwi().unwrap();
    assert_eq!(h.id, Hwi::ToScalar);
    let d = f.nodes[h.ops[0]].hwi().unwrap();
    assert_eq!(d.id, Hwi::DotProduct);
    assert!(f.nodes[d.ops[2]].is_icon(0x71));
    for side in [d.ops[0], d.ops[1]] {
      assert_eq!(f.nodes[side].hwi().unwrap().id, Hwi::And);
    }
  }

  #[test]
  fn create_scalar_forces_zero_extension() {
    let mut f = Function::new();
    let bl = f.new_block();
    let lcl = f.locals.push(Local::scalar(Ty::Scalar(BaseTy::U16), 2));
    let x = f.lcl_var(lcl);
    let cs = f.hwi(Ty::Vec(VecLen::V16), Hwi::CreateScalar, BaseTy::U16, VecLen::V16, [x]);
    let st = store_to_local(&mut f, VecLen::V16, cs);
    for n in [x, cs, st] { f.append(bl, n) }

    lower::run(&mut f, &Isa::baseline(), &LowerConfig::default());

    let h = f.nodes[cs].hwi().unwrap();
    assert_eq!(h.id, Hwi::CreateScalar);
    let src = h.ops[0];
    assert!(matches!(f.nodes[src].kind,
      Kind::Cast { src: s, from: BaseTy::U16, to: BaseTy::U32 } if s == x));
  }
}
