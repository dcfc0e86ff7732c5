//! Full local-attention block: similarity, softmax, weighting.

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax;

use crate::core::{backend_err, LocalAttentionError};
use crate::fused::{similarity, weighting};

/// Computes a local-attention block over 2-D feature maps.
///
/// Scores `query` against the `kh x kw` neighbourhood of `key`, normalises
/// the scores with a softmax over the patch dimension, and aggregates the
/// matching neighbourhood of `value` under those weights. `query` and
/// `value` share the layout `(batch, channels, height, width)`; `key` may
/// carry a smaller batch that evenly divides the query batch (grouped keys).
///
/// The softmax runs in `f32` for `f16` inputs and the result is narrowed
/// back, matching the accumulation policy of the kernels themselves.
pub fn local_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    kh: usize,
    kw: usize,
    causal: bool,
) -> Result<Tensor, LocalAttentionError> {
    let scores = similarity(query, key, kh, kw, causal)?;
    let weights = if scores.dtype() == DType::F16 {
        scores
            .to_dtype(DType::F32)
            .and_then(|wide| softmax(&wide, D::Minus1))
            .and_then(|soft| soft.to_dtype(DType::F16))
            .map_err(backend_err)?
    } else {
        softmax(&scores, D::Minus1).map_err(backend_err)?
    };
    weighting(value, &weights, kh, kw, causal)
}
