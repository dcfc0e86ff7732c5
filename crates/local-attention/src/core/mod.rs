//! Shared operand validation for the kernel pair.
//!
//! Every public operation validates devices, dtypes, and shapes up front and
//! fails fast with a [`LocalAttentionError`]; the compute kernels themselves
//! only ever see well-formed contiguous operands.

pub mod errors;

pub use errors::LocalAttentionError;

use candle_core::{DType, Tensor};

/// Maps a candle failure into the crate error type.
pub(crate) fn backend_err(err: candle_core::Error) -> LocalAttentionError {
    LocalAttentionError::Backend {
        message: err.to_string(),
    }
}

/// Checks that both operands live on one device and share a supported dtype.
///
/// Mixing precisions or devices across operands is a configuration error;
/// dtypes outside `f32`/`f16` are rejected outright.
pub(crate) fn validate_pair(
    op: &'static str,
    x: &Tensor,
    y: &Tensor,
) -> Result<DType, LocalAttentionError> {
    if !x.device().same_device(y.device()) {
        return Err(LocalAttentionError::Config {
            context: format!("{op}: operands must reside on the same device"),
        });
    }
    let dtype = x.dtype();
    if dtype != y.dtype() {
        return Err(LocalAttentionError::Config {
            context: format!(
                "{op}: operands must share a dtype, got {dtype:?} and {:?}",
                y.dtype()
            ),
        });
    }
    if !matches!(dtype, DType::F32 | DType::F16) {
        return Err(LocalAttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    Ok(dtype)
}

/// Extracts `(batch, channels, height, width)` dims, with a shape error
/// naming the offending operand on failure.
pub(crate) fn feature_map_dims(
    op: &'static str,
    name: &'static str,
    t: &Tensor,
) -> Result<(usize, usize, usize, usize), LocalAttentionError> {
    t.dims4().map_err(|_| LocalAttentionError::Shape {
        context: format!(
            "{op}: {name} must have shape (batch, channels, height, width), got {:?}",
            t.dims()
        ),
    })
}
