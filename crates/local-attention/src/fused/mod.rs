//! Fused local-attention kernels with exact analytic gradients.
//!
//! Each operation is a candle custom op: the forward pass runs a single
//! fused pass over contiguous CPU storage (no materialised windows), and the
//! backward pass is wired through `CustomOp2::bwd` so candle's autograd
//! invokes it with the upstream gradient.
//!
//! The gradients that scatter across overlapping windows (`grad_y` of
//! similarity, `grad_x` of weighting) are computed with a destination-centric
//! inverse gather: every gradient cell enumerates the negated offset list and
//! sums the contribution of each window that referenced it. No atomics are
//! involved and accumulation order is fixed, so results are bit-identical
//! across runs.

mod similarity;
mod weighting;

pub use similarity::similarity;
pub use weighting::weighting;

use candle_core::Layout;
use half::f16;

/// Element type the CPU kernels are monomorphised over.
///
/// Values are widened to `f32` on read so dot products and weighted sums
/// accumulate at full precision even when storage is `f16`, then narrowed
/// back on write-out.
pub(crate) trait Element: Copy + Send + Sync + 'static {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Element for f32 {
    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl Element for f16 {
    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

/// Dimensions of a `(batch, channels, height, width)` feature map.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MapDims {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl MapDims {
    /// Elements in one spatial plane.
    pub fn plane(&self) -> usize {
        self.h * self.w
    }
}

/// Narrows storage to the layout's contiguous range.
///
/// The public wrappers force contiguity before dispatch, so a miss here
/// indicates a caller bypassing them.
pub(crate) fn contiguous_slice<'a, T>(
    data: &'a [T],
    layout: &Layout,
    op: &'static str,
) -> candle_core::Result<&'a [T]> {
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => candle_core::bail!("{op} requires contiguous inputs"),
    }
}
