//! Weighting kernel: neighbourhood aggregation under per-location weights.

use std::sync::OnceLock;

use candle_core::{CpuStorage, CustomOp2, Layout, Result as CandleResult, Shape, Tensor};
use rayon::prelude::*;

use crate::core::{backend_err, feature_map_dims, validate_pair, LocalAttentionError};
use crate::window::WindowGeometry;

use super::{contiguous_slice, Element, MapDims};

static INIT: OnceLock<()> = OnceLock::new();

/// Aggregates the `kh x kw` neighbourhood of the value map `x` using the
/// per-location weight vectors `y`.
///
/// * `x`: value map, `(batch, channels, height, width)`.
/// * `y`: weights, `(batch, height, width, patch)` with
///   `patch = kh * kw` (or `kh * kw / 2 + 1` when `causal`) — typically the
///   softmax of a [`similarity`](crate::similarity) output.
/// * Output: `(batch, channels, height, width)`;
///   `z[n,c,i,j] = sum_p y[n,i,j,p] * x[n,c,i+di(p),j+dj(p)]` with
///   out-of-bounds neighbours contributing zero.
///
/// Linear and differentiable in both operands.
pub fn weighting(
    x: &Tensor,
    y: &Tensor,
    kh: usize,
    kw: usize,
    causal: bool,
) -> Result<Tensor, LocalAttentionError> {
    let geom = WindowGeometry::new(kh, kw, causal)?;
    let dtype = validate_pair("weighting", x, y)?;
    let (n, c, h, w) = feature_map_dims("weighting", "values", x)?;
    let (ny, hy, wy, patch) = y.dims4().map_err(|_| LocalAttentionError::Shape {
        context: format!(
            "weighting: weights must have shape (batch, height, width, patch), got {:?}",
            y.dims()
        ),
    })?;
    if ny != n || hy != h || wy != w {
        return Err(LocalAttentionError::Shape {
            context: format!(
                "weighting: weight dims ({ny}, {hy}, {wy}, {patch}) do not match value dims ({n}, {c}, {h}, {w})"
            ),
        });
    }
    if patch != geom.patch_len() {
        return Err(LocalAttentionError::Shape {
            context: format!(
                "weighting: patch length {patch} does not match {kh}x{kw} causal={causal} (expected {})",
                geom.patch_len()
            ),
        });
    }

    if INIT.set(()).is_ok() {
        log::info!(
            "local-attention::weighting init window={kh}x{kw} causal={causal} dtype={dtype:?} batch={n}"
        );
    }

    let x = x.contiguous().map_err(backend_err)?;
    let y = y.contiguous().map_err(backend_err)?;
    x.apply_op2(&y, WeightingOp { geom }).map_err(backend_err)
}

#[derive(Debug, Clone, Copy)]
struct WeightingOp {
    geom: WindowGeometry,
}

impl CustomOp2 for WeightingOp {
    fn name(&self) -> &'static str {
        "local-attn-weighting"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> CandleResult<(CpuStorage, Shape)> {
        let (n, c, h, w) = l1.shape().dims4()?;
        let dims = MapDims { n, c, h, w };
        let out_shape = Shape::from((n, c, h, w));
        match (s1, s2) {
            (CpuStorage::F32(xs), CpuStorage::F32(ys)) => {
                let x = contiguous_slice(xs, l1, "weighting")?;
                let y = contiguous_slice(ys, l2, "weighting")?;
                let out = weighting_fwd(x, y, dims, &self.geom);
                Ok((CpuStorage::F32(out), out_shape))
            }
            (CpuStorage::F16(xs), CpuStorage::F16(ys)) => {
                let x = contiguous_slice(xs, l1, "weighting")?;
                let y = contiguous_slice(ys, l2, "weighting")?;
                let out = weighting_fwd(x, y, dims, &self.geom);
                Ok((CpuStorage::F16(out), out_shape))
            }
            _ => candle_core::bail!("weighting expects matching f32 or f16 operands"),
        }
    }

    fn bwd(
        &self,
        x: &Tensor,
        y: &Tensor,
        _z: &Tensor,
        grad_z: &Tensor,
    ) -> CandleResult<(Option<Tensor>, Option<Tensor>)> {
        let grad_z = grad_z.contiguous()?;
        let grad_x = grad_z.apply_op2(y, WeightingGradX { geom: self.geom })?;
        let grad_y = grad_z.apply_op2(x, WeightingGradY { geom: self.geom })?;
        Ok((Some(grad_x), Some(grad_y)))
    }
}

/// `grad_x[n,c,i',j']` sums `grad_z[n,c,i,j] * y[n,i,j,p]` over every window
/// `(i, j, p)` that read value cell `(i', j')` — the overlapping-window
/// scatter of this kernel, realised as a race-free inverse gather over
/// `(i, j) = (i'-di, j'-dj)`.
#[derive(Debug, Clone, Copy)]
struct WeightingGradX {
    geom: WindowGeometry,
}

impl CustomOp2 for WeightingGradX {
    fn name(&self) -> &'static str {
        "local-attn-weighting-grad-x"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> CandleResult<(CpuStorage, Shape)> {
        let (n, c, h, w) = l1.shape().dims4()?;
        let dims = MapDims { n, c, h, w };
        let out_shape = Shape::from((n, c, h, w));
        match (s1, s2) {
            (CpuStorage::F32(gz), CpuStorage::F32(ys)) => {
                let gz = contiguous_slice(gz, l1, "weighting backward")?;
                let y = contiguous_slice(ys, l2, "weighting backward")?;
                let out = weighting_grad_x(gz, y, dims, &self.geom);
                Ok((CpuStorage::F32(out), out_shape))
            }
            (CpuStorage::F16(gz), CpuStorage::F16(ys)) => {
                let gz = contiguous_slice(gz, l1, "weighting backward")?;
                let y = contiguous_slice(ys, l2, "weighting backward")?;
                let out = weighting_grad_x(gz, y, dims, &self.geom);
                Ok((CpuStorage::F16(out), out_shape))
            }
            _ => candle_core::bail!("weighting backward expects matching f32 or f16 operands"),
        }
    }
}

/// `grad_y[n,i,j,p] = sum_c grad_z[n,c,i,j] * x[n,c,i+di,j+dj]` — a pure
/// gather, zero where the neighbour fell outside the map.
#[derive(Debug, Clone, Copy)]
struct WeightingGradY {
    geom: WindowGeometry,
}

impl CustomOp2 for WeightingGradY {
    fn name(&self) -> &'static str {
        "local-attn-weighting-grad-y"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> CandleResult<(CpuStorage, Shape)> {
        let (n, c, h, w) = l1.shape().dims4()?;
        let dims = MapDims { n, c, h, w };
        let out_shape = Shape::from((n, h, w, self.geom.patch_len()));
        match (s1, s2) {
            (CpuStorage::F32(gz), CpuStorage::F32(xs)) => {
                let gz = contiguous_slice(gz, l1, "weighting backward")?;
                let x = contiguous_slice(xs, l2, "weighting backward")?;
                let out = weighting_grad_y(gz, x, dims, &self.geom);
                Ok((CpuStorage::F32(out), out_shape))
            }
            (CpuStorage::F16(gz), CpuStorage::F16(xs)) => {
                let gz = contiguous_slice(gz, l1, "weighting backward")?;
                let x = contiguous_slice(xs, l2, "weighting backward")?;
                let out = weighting_grad_y(gz, x, dims, &self.geom);
                Ok((CpuStorage::F16(out), out_shape))
            }
            _ => candle_core::bail!("weighting backward expects matching f32 or f16 operands"),
        }
    }
}

fn weighting_fwd<T: Element>(x: &[T], y: &[T], d: MapDims, geom: &WindowGeometry) -> Vec<T> {
    let offsets = geom.offsets();
    let patch = offsets.len();
    let plane = d.plane();
    let map = d.c * plane;
    let mut out = vec![T::from_f32(0.0); d.n * map];
    out.par_chunks_mut(map).enumerate().for_each(|(n_idx, chunk)| {
        let xb = &x[n_idx * map..][..map];
        let yb = &y[n_idx * plane * patch..][..plane * patch];
        let mut acc = vec![0f32; map];
        for i in 0..d.h {
            for j in 0..d.w {
                let anchor = i * d.w + j;
                for (p, &(di, dj)) in offsets.iter().enumerate() {
                    let ii = i as isize + di;
                    let jj = j as isize + dj;
                    if ii < 0 || jj < 0 || ii >= d.h as isize || jj >= d.w as isize {
                        continue;
                    }
                    let neighbour = ii as usize * d.w + jj as usize;
                    let weight = yb[anchor * patch + p].to_f32();
                    for ch in 0..d.c {
                        acc[ch * plane + anchor] += weight * xb[ch * plane + neighbour].to_f32();
                    }
                }
            }
        }
        for (dst, &val) in chunk.iter_mut().zip(acc.iter()) {
            *dst = T::from_f32(val);
        }
    });
    out
}

fn weighting_grad_x<T: Element>(gz: &[T], y: &[T], d: MapDims, geom: &WindowGeometry) -> Vec<T> {
    let offsets = geom.offsets();
    let patch = offsets.len();
    let plane = d.plane();
    let map = d.c * plane;
    let mut out = vec![T::from_f32(0.0); d.n * map];
    out.par_chunks_mut(map).enumerate().for_each(|(n_idx, chunk)| {
        let gzb = &gz[n_idx * map..][..map];
        let yb = &y[n_idx * plane * patch..][..plane * patch];
        let mut acc = vec![0f32; map];
        for i in 0..d.h {
            for j in 0..d.w {
                let dest = i * d.w + j;
                for (p, &(di, dj)) in offsets.iter().enumerate() {
                    let si = i as isize - di;
                    let sj = j as isize - dj;
                    if si < 0 || sj < 0 || si >= d.h as isize || sj >= d.w as isize {
                        continue;
                    }
                    let source = si as usize * d.w + sj as usize;
                    let weight = yb[source * patch + p].to_f32();
                    for ch in 0..d.c {
                        acc[ch * plane + dest] += weight * gzb[ch * plane + source].to_f32();
                    }
                }
            }
        }
        for (dst, &val) in chunk.iter_mut().zip(acc.iter()) {
            *dst = T::from_f32(val);
        }
    });
    out
}

fn weighting_grad_y<T: Element>(gz: &[T], x: &[T], d: MapDims, geom: &WindowGeometry) -> Vec<T> {
    let offsets = geom.offsets();
    let patch = offsets.len();
    let plane = d.plane();
    let map = d.c * plane;
    let mut out = vec![T::from_f32(0.0); d.n * plane * patch];
    out.par_chunks_mut(plane * patch)
        .enumerate()
        .for_each(|(n_idx, chunk)| {
            let gzb = &gz[n_idx * map..][..map];
            let xb = &x[n_idx * map..][..map];
            for i in 0..d.h {
                for j in 0..d.w {
                    let anchor = i * d.w + j;
                    let cell = &mut chunk[anchor * patch..][..patch];
                    for (p, &(di, dj)) in offsets.iter().enumerate() {
                        let ii = i as isize + di;
                        let jj = j as isize + dj;
                        if ii < 0 || jj < 0 || ii >= d.h as isize || jj >= d.w as isize {
                            continue;
                        }
                        let neighbour = ii as usize * d.w + jj as usize;
                        let mut acc = 0f32;
                        for ch in 0..d.c {
                            acc += gzb[ch * plane + anchor].to_f32()
                                * xb[ch * plane + neighbour].to_f32();
                        }
                        cell[p] = T::from_f32(acc);
                    }
                }
            }
        });
    out
}
