//! Reference implementations built from generic candle primitives.
//!
//! The oracles extract windows by zero-padding the neighbour map and
//! narrowing one shifted view per offset, then reduce with elementwise
//! products and channel sums. They never share code with the fused kernels
//! and stay differentiable, so gradient parity can run candle autograd over
//! both paths.

use candle_core::{DType, Tensor};
use local_attention::WindowGeometry;

/// Unfold-style similarity reference: `z[n,i,j,p]` via one shifted view of
/// the zero-padded key map per window offset. Accepts a key batch that
/// divides the query batch, mirroring the fused kernel's grouped-key rule.
pub fn oracle_similarity(
    x: &Tensor,
    y: &Tensor,
    kh: usize,
    kw: usize,
    causal: bool,
) -> candle_core::Result<Tensor> {
    let geom = WindowGeometry::new(kh, kw, causal).expect("valid geometry");
    let (n, c, h, w) = x.dims4()?;
    let ny = y.dim(0)?;
    let dtype = x.dtype();

    let xf = x.to_dtype(DType::F32)?;
    let mut yf = y.to_dtype(DType::F32)?;
    if ny != n {
        let group = n / ny;
        yf = yf
            .unsqueeze(1)?
            .expand((ny, group, c, h, w))?
            .contiguous()?
            .reshape((n, c, h, w))?;
    }

    let padded = yf
        .pad_with_zeros(2, kh / 2, kh / 2)?
        .pad_with_zeros(3, kw / 2, kw / 2)?;
    let mut per_offset = Vec::with_capacity(geom.patch_len());
    for (di, dj) in geom.offsets() {
        let oi = (di + (kh / 2) as isize) as usize;
        let oj = (dj + (kw / 2) as isize) as usize;
        let shifted = padded.narrow(2, oi, h)?.narrow(3, oj, w)?;
        let scores = (&xf * &shifted)?.sum(1)?;
        per_offset.push(scores.unsqueeze(3)?);
    }
    Tensor::cat(&per_offset, 3)?.to_dtype(dtype)
}

/// Unfold-style weighting reference: accumulates one weighted shifted view
/// of the zero-padded value map per window offset.
pub fn oracle_weighting(
    x: &Tensor,
    y: &Tensor,
    kh: usize,
    kw: usize,
    causal: bool,
) -> candle_core::Result<Tensor> {
    let geom = WindowGeometry::new(kh, kw, causal).expect("valid geometry");
    let (n, c, h, w) = x.dims4()?;
    let dtype = x.dtype();

    let xf = x.to_dtype(DType::F32)?;
    let yf = y.to_dtype(DType::F32)?;
    let padded = xf
        .pad_with_zeros(2, kh / 2, kh / 2)?
        .pad_with_zeros(3, kw / 2, kw / 2)?;

    let mut z = Tensor::zeros((n, c, h, w), DType::F32, x.device())?;
    for (p, (di, dj)) in geom.offsets().into_iter().enumerate() {
        let oi = (di + (kh / 2) as isize) as usize;
        let oj = (dj + (kw / 2) as isize) as usize;
        let shifted = padded.narrow(2, oi, h)?.narrow(3, oj, w)?;
        let weight = yf.narrow(3, p, 1)?.squeeze(3)?.unsqueeze(1)?;
        z = (z + shifted.broadcast_mul(&weight)?)?;
    }
    z.to_dtype(dtype)
}

/// Maximum relative difference, `max |a-b| / max(|a|, |b|)` over entries
/// where the denominator is non-zero. Used for both values and gradients.
pub fn max_rel_err(a: &Tensor, b: &Tensor) -> candle_core::Result<f32> {
    let av = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let bv = b.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(av.len(), bv.len(), "tensor sizes differ");
    let mut max = 0f32;
    for (x, y) in av.iter().zip(bv.iter()) {
        let denom = x.abs().max(y.abs());
        if denom > 0.0 {
            max = max.max((x - y).abs() / denom);
        }
    }
    Ok(max)
}
