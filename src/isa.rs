//! Target ISA feature probing and lowering configuration.
//!
//! [`Isa`] is an immutable snapshot of the extensions available on the target,
//! captured once at the start of a compilation and passed by shared reference
//! through the pass. [`LowerConfig`] carries the knobs that change lowering
//! decisions, including the stress knobs.

bitflags! {
  /// The x86 extension sets that change a lowering decision somewhere in the pass.
  /// SSE2 is the baseline and has no bit.
  #[derive(Copy, Clone, Default, PartialEq, Eq)]
  pub struct IsaFlags: u32 {
    /// SSSE3 (`phaddd`, `pshufb`).
    const SSSE3 = 1;
    /// SSE4.1 (`ptest`, `pextr*`/`pinsr*`, `blendv`, `roundss`).
    const SSE41 = 1 << 1;
    /// SSE4.2.
    const SSE42 = 1 << 2;
    /// AVX (256-bit float, 3-operand forms).
    const AVX = 1 << 3;
    /// AVX2 (256-bit integer, `vpbroadcast*`).
    const AVX2 = 1 << 4;
    /// AVX-512 V/BW/DQ at the level the pass cares about: mask registers,
    /// 512-bit vectors, EVEX encodings.
    const AVX512 = 1 << 5;
    /// AVX10.2 (saturating float to int conversions).
    const AVX10V2 = 1 << 6;
    /// BMI1 (`andn`, `blsr`, `blsi`, `blsmsk`).
    const BMI1 = 1 << 7;
    /// BMI2.
    const BMI2 = 1 << 8;
    /// MOVBE (load/store with byte swap).
    const MOVBE = 1 << 9;
    /// FMA3.
    const FMA = 1 << 10;
    /// AVX-VNNI dot product accumulation.
    const AVX_VNNI = 1 << 11;
    /// GFNI (used in some byte shuffle rewrites).
    const GFNI = 1 << 12;
    /// APX (conditional compare chaining).
    const APX = 1 << 13;
  }
}

impl std::fmt::Debug for IsaFlags {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    bitflags::parser::to_writer(self, f)
  }
}

/// The target description seen by lowering: available extensions and bitness.
#[derive(Copy, Clone, Debug)]
pub struct Isa {
  flags: IsaFlags,
  /// Is this a 64-bit target? 32-bit targets change argument passing and
  /// the immediate policy for stores.
  pub bits64: bool,
}

impl Isa {
  /// Describe a target with the given extensions.
  #[must_use] pub fn new(flags: IsaFlags, bits64: bool) -> Self {
    // implied subsets, so callers can name only the top of a tower
    let mut flags = flags;
    if flags.contains(IsaFlags::AVX10V2) { flags |= IsaFlags::AVX512 }
    if flags.contains(IsaFlags::AVX512) { flags |= IsaFlags::AVX2 | IsaFlags::FMA }
    if flags.contains(IsaFlags::AVX2) { flags |= IsaFlags::AVX }
    if flags.contains(IsaFlags::AVX) { flags |= IsaFlags::SSE42 }
    if flags.contains(IsaFlags::SSE42) { flags |= IsaFlags::SSE41 }
    if flags.contains(IsaFlags::SSE41) { flags |= IsaFlags::SSSE3 }
    Self { flags, bits64 }
  }

  /// A baseline SSE2 64-bit target.
  #[must_use] pub fn baseline() -> Self { Self::new(IsaFlags::empty(), true) }

  /// A 64-bit target with everything through AVX-512 and the BMI/MOVBE scalars.
  #[must_use] pub fn avx512() -> Self {
    Self::new(IsaFlags::AVX512 | IsaFlags::BMI1 | IsaFlags::BMI2 | IsaFlags::MOVBE, true)
  }

  /// Does the target have the given extension?
  #[inline] #[must_use] pub fn has(&self, f: IsaFlags) -> bool { self.flags.contains(f) }

  /// Are EVEX encodings (and so mask registers) available?
  #[inline] #[must_use] pub fn evex(&self) -> bool { self.has(IsaFlags::AVX512) }

  /// Is the EVEX embedded broadcast form available for packed instructions?
  #[inline] #[must_use] pub fn embedded_broadcast(&self) -> bool { self.evex() }

  /// Is EVEX embedded masking available?
  #[inline] #[must_use] pub fn embedded_masking(&self) -> bool { self.evex() }

  /// Are 256-bit vectors of the given lane type usable?
  #[must_use] pub fn vector256(&self, float: bool) -> bool {
    if float { self.has(IsaFlags::AVX) } else { self.has(IsaFlags::AVX2) }
  }
}

/// Knobs that change lowering decisions. Plain data with [`Default`]; tests
/// override fields directly.
#[derive(Clone, Debug)]
pub struct LowerConfig {
  /// Are optimizations enabled? When false, strength reduction and most
  /// peepholes are skipped and only legalization runs.
  pub opts: bool,
  /// The block store size (bytes) at or below which stores are unrolled.
  pub unroll_limit: u32,
  /// Stress knob: percent chance of forcing a block store to unroll even
  /// above the limit. 0 disables.
  pub stress_block_unroll: u8,
  /// Enable APX conditional-compare chaining rewrites when the ISA has APX.
  pub apx_cond_chaining: bool,
  /// Seed for the deterministic stress RNG.
  pub stress_seed: u64,
}

impl Default for LowerConfig {
  fn default() -> Self {
    Self {
      opts: true,
      unroll_limit: 128,
      stress_block_unroll: 0,
      apx_cond_chaining: false,
      stress_seed: 0x9e37_79b9_7f4a_7c15,
    }
  }
}

/// The deterministic RNG behind the stress knobs (xorshift64). Seeded from
/// [`LowerConfig::stress_seed`] so test runs can pin decisions.
#[derive(Clone, Copy, Debug)]
pub struct StressRng(u64);

impl StressRng {
  /// Create an RNG with the given nonzero seed.
  #[must_use] pub fn new(seed: u64) -> Self { Self(if seed == 0 { 1 } else { seed }) }

  fn next(&mut self) -> u64 {
    self.0 ^= self.0 << 13;
    self.0 ^= self.0 >> 7;
    self.0 ^= self.0 << 17;
    self.0
  }

  /// Roll a percent chance.
  pub fn chance(&mut self, percent: u8) -> bool {
    percent != 0 && self.next() % 100 < percent.into()
  }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
  use super::*;

  #[test]
  fn implied_towers() {
    let isa = Isa::new(IsaFlags::AVX2, true);
    assert!(isa.has(IsaFlags::AVX) && isa.has(IsaFlags::SSE41) && isa.has(IsaFlags::SSSE3));
    assert!(!isa.evex());
    assert!(Isa::avx512().evex());
    assert!(Isa::avx512().has(IsaFlags::FMA));
    assert!(!Isa::baseline().has(IsaFlags::SSSE3));
  }

  #[test]
  fn stress_rng_deterministic() {
    let mut a = StressRng::new(42);
    let mut b = StressRng::new(42);
    for _ in 0..100 { assert_eq!(a.chance(50), b.chance(50)) }
    let mut c = StressRng::new(7);
    assert!((0..1000).filter(|_| c.chance(50)).count() > 300);
  }
}
