//! Similarity kernel: query-against-neighbourhood dot products.

use std::sync::OnceLock;

use candle_core::{CpuStorage, CustomOp2, Layout, Result as CandleResult, Shape, Tensor};
use rayon::prelude::*;

use crate::core::{backend_err, feature_map_dims, validate_pair, LocalAttentionError};
use crate::window::WindowGeometry;

use super::{contiguous_slice, Element, MapDims};

static INIT: OnceLock<()> = OnceLock::new();

/// Scores every location of `x` against the `kh x kw` neighbourhood of `y`.
///
/// * `x`: query map, `(batch, channels, height, width)`.
/// * `y`: key map with matching channel and spatial dims. Its batch must
///   equal `x`'s or divide it evenly; with replica factor
///   `g = batch_x / batch_y`, output batch `n` reads keys from `y[n / g]`
///   (grouped/repeated keys).
/// * Output: `(batch, height, width, patch)` where
///   `patch = kh * kw` (or `kh * kw / 2 + 1` when `causal`). Entry `p` is
///   the channel dot product between `x` at the anchor and `y` at the `p`-th
///   window offset; offsets falling outside the map contribute zero.
///
/// Differentiable in both operands. `grad_y` lands on the unexpanded key
/// tensor, summed over replicas.
pub fn similarity(
    x: &Tensor,
    y: &Tensor,
    kh: usize,
    kw: usize,
    causal: bool,
) -> Result<Tensor, LocalAttentionError> {
    let geom = WindowGeometry::new(kh, kw, causal)?;
    let dtype = validate_pair("similarity", x, y)?;
    let (n, c, h, w) = feature_map_dims("similarity", "query", x)?;
    let (ny, cy, hy, wy) = feature_map_dims("similarity", "key", y)?;
    if cy != c || hy != h || wy != w {
        return Err(LocalAttentionError::Shape {
            context: format!(
                "similarity: key dims ({ny}, {cy}, {hy}, {wy}) do not match query dims ({n}, {c}, {h}, {w})"
            ),
        });
    }
    if ny == 0 || n % ny != 0 {
        return Err(LocalAttentionError::Shape {
            context: format!("similarity: key batch {ny} must evenly divide query batch {n}"),
        });
    }

    if INIT.set(()).is_ok() {
        log::info!(
            "local-attention::similarity init window={kh}x{kw} causal={causal} dtype={dtype:?} batch={n}/{ny}"
        );
    }

    let x = x.contiguous().map_err(backend_err)?;
    let y = y.contiguous().map_err(backend_err)?;
    x.apply_op2(&y, SimilarityOp { geom }).map_err(backend_err)
}

#[derive(Debug, Clone, Copy)]
struct SimilarityOp {
    geom: WindowGeometry,
}

impl CustomOp2 for SimilarityOp {
    fn name(&self) -> &'static str {
        "local-attn-similarity"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> CandleResult<(CpuStorage, Shape)> {
        let (n, c, h, w) = l1.shape().dims4()?;
        let (ny, _, _, _) = l2.shape().dims4()?;
        let dims = MapDims { n, c, h, w };
        let group = n / ny;
        let out_shape = Shape::from((n, h, w, self.geom.patch_len()));
        match (s1, s2) {
            (CpuStorage::F32(xs), CpuStorage::F32(ys)) => {
                let x = contiguous_slice(xs, l1, "similarity")?;
                let y = contiguous_slice(ys, l2, "similarity")?;
                let out = similarity_fwd(x, y, dims, group, &self.geom);
                Ok((CpuStorage::F32(out), out_shape))
            }
            (CpuStorage::F16(xs), CpuStorage::F16(ys)) => {
                let x = contiguous_slice(xs, l1, "similarity")?;
                let y = contiguous_slice(ys, l2, "similarity")?;
                let out = similarity_fwd(x, y, dims, group, &self.geom);
                Ok((CpuStorage::F16(out), out_shape))
            }
            _ => candle_core::bail!("similarity expects matching f32 or f16 operands"),
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
        let grad_x = grad_z.apply_op2(y, SimilarityGradX { geom: self.geom })?;
        let grad_y = grad_z.apply_op2(
            x,
            SimilarityGradY {
                geom: self.geom,
                key_batch: y.dim(0)?,
            },
        )?;
        Ok((Some(grad_x), Some(grad_y)))
    }
}

/// `grad_x[n,c,i,j] = sum_p grad_z[n,i,j,p] * y[n/g,c,i+di,j+dj]` — a pure
/// gather, mirroring the forward read pattern.
#[derive(Debug, Clone, Copy)]
struct SimilarityGradX {
    geom: WindowGeometry,
}

impl CustomOp2 for SimilarityGradX {
    fn name(&self) -> &'static str {
        "local-attn-similarity-grad-x"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> CandleResult<(CpuStorage, Shape)> {
        let (n, h, w, _) = l1.shape().dims4()?;
        let (ny, c, _, _) = l2.shape().dims4()?;
        let dims = MapDims { n, c, h, w };
        let group = n / ny;
        let out_shape = Shape::from((n, c, h, w));
        match (s1, s2) {
            (CpuStorage::F32(gz), CpuStorage::F32(ys)) => {
                let gz = contiguous_slice(gz, l1, "similarity backward")?;
                let y = contiguous_slice(ys, l2, "similarity backward")?;
                let out = similarity_grad_x(gz, y, dims, group, &self.geom);
                Ok((CpuStorage::F32(out), out_shape))
            }
            (CpuStorage::F16(gz), CpuStorage::F16(ys)) => {
                let gz = contiguous_slice(gz, l1, "similarity backward")?;
                let y = contiguous_slice(ys, l2, "similarity backward")?;
                let out = similarity_grad_x(gz, y, dims, group, &self.geom);
                Ok((CpuStorage::F16(out), out_shape))
            }
            _ => candle_core::bail!("similarity backward expects matching f32 or f16 operands"),
        }
    }
}

/// `grad_y[m,c,i',j']` sums `grad_z[n,i,j,p] * x[n,c,i,j]` over every window
/// `(n, i, j, p)` that read key cell `(i', j')`, i.e. over replicas
/// `n = m*g..m*g+g` and source locations `(i, j) = (i'-di, j'-dj)`. This is
/// the overlapping-window scatter, realised as a race-free inverse gather.
#[derive(Debug, Clone, Copy)]
struct SimilarityGradY {
    geom: WindowGeometry,
    key_batch: usize,
}

impl CustomOp2 for SimilarityGradY {
    fn name(&self) -> &'static str {
        "local-attn-similarity-grad-y"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> CandleResult<(CpuStorage, Shape)> {
        let (n, _, _, _) = l1.shape().dims4()?;
        let (_, c, h, w) = l2.shape().dims4()?;
        let dims = MapDims { n, c, h, w };
        let group = n / self.key_batch;
        let out_shape = Shape::from((self.key_batch, c, h, w));
        match (s1, s2) {
            (CpuStorage::F32(gz), CpuStorage::F32(xs)) => {
                let gz = contiguous_slice(gz, l1, "similarity backward")?;
                let x = contiguous_slice(xs, l2, "similarity backward")?;
                let out = similarity_grad_y(gz, x, dims, group, self.key_batch, &self.geom);
                Ok((CpuStorage::F32(out), out_shape))
            }
            (CpuStorage::F16(gz), CpuStorage::F16(xs)) => {
                let gz = contiguous_slice(gz, l1, "similarity backward")?;
                let x = contiguous_slice(xs, l2, "similarity backward")?;
                let out = similarity_grad_y(gz, x, dims, group, self.key_batch, &self.geom);
                Ok((CpuStorage::F16(out), out_shape))
            }
            _ => candle_core::bail!("similarity backward expects matching f32 or f16 operands"),
        }
    }
}

fn similarity_fwd<T: Element>(
    x: &[T],
    y: &[T],
    d: MapDims,
    group: usize,
    geom: &WindowGeometry,
) -> Vec<T> {
    let offsets = geom.offsets();
    let patch = offsets.len();
    let plane = d.plane();
    let map = d.c * plane;
    let mut out = vec![T::from_f32(0.0); d.n * plane * patch];
    out.par_chunks_mut(plane * patch)
        .enumerate()
        .for_each(|(n_idx, chunk)| {
            let xb = &x[n_idx * map..][..map];
            let yb = &y[(n_idx / group) * map..][..map];
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
                            acc += xb[ch * plane + anchor].to_f32()
                                * yb[ch * plane + neighbour].to_f32();
                        }
                        cell[p] = T::from_f32(acc);
                    }
                }
            }
        });
    out
}

fn similarity_grad_x<T: Element>(
    gz: &[T],
    y: &[T],
    d: MapDims,
    group: usize,
    geom: &WindowGeometry,
) -> Vec<T> {
    let offsets = geom.offsets();
    let patch = offsets.len();
    let plane = d.plane();
    let map = d.c * plane;
    let mut out = vec![T::from_f32(0.0); d.n * map];
    out.par_chunks_mut(map).enumerate().for_each(|(n_idx, chunk)| {
        let gzb = &gz[n_idx * plane * patch..][..plane * patch];
        let yb = &y[(n_idx / group) * map..][..map];
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
                    let g = gzb[anchor * patch + p].to_f32();
                    for ch in 0..d.c {
                        acc[ch * plane + anchor] += g * yb[ch * plane + neighbour].to_f32();
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

fn similarity_grad_y<T: Element>(
    gz: &[T],
    x: &[T],
    d: MapDims,
    group: usize,
    key_batch: usize,
    geom: &WindowGeometry,
) -> Vec<T> {
    let offsets = geom.offsets();
    let patch = offsets.len();
    let plane = d.plane();
    let map = d.c * plane;
    let mut out = vec![T::from_f32(0.0); key_batch * map];
    out.par_chunks_mut(map).enumerate().for_each(|(m, chunk)| {
        let mut acc = vec![0f32; map];
        for r in 0..group {
            let n_idx = m * group + r;
            let gzb = &gz[n_idx * plane * patch..][..plane * patch];
            let xb = &x[n_idx * map..][..map];
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
                        let g = gzb[source * patch + p].to_f32();
                        for ch in 0..d.c {
                            acc[ch * plane + dest] += g * xb[ch * plane + source].to_f32();
                        }
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
