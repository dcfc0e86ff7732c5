//! Local (windowed) self-attention kernels for candle.
//!
//! The crate provides the two fused tensor operations at the heart of local
//! attention over 2-D feature maps with layout `[batch, channels, height,
//! width]`:
//!
//! * [`similarity`] scores every spatial location of a query map against the
//!   `kh x kw` neighbourhood of a key map, producing per-location score
//!   vectors of length `patch` (`kh * kw`, or `kh * kw / 2 + 1` under the
//!   causal restriction).
//! * [`weighting`] aggregates the `kh x kw` neighbourhood of a value map
//!   using per-location weight vectors of length `patch`, typically the
//!   softmax of a [`similarity`] output.
//!
//! Both operations are registered as candle custom ops with analytic
//! backward passes, so they can be called on `Var` inputs inside a
//! differentiation context and `Tensor::backward` yields exact gradients for
//! both operands. Supported dtypes are `f32` and `f16`; reductions always
//! accumulate in `f32` and narrow to the storage dtype on write-out.
//!
//! Neighbour offsets that fall outside the feature map act as an implicit
//! zero pad: they contribute nothing to scores or weighted sums and receive
//! no gradient. [`local_attention`] composes the two kernels with a softmax
//! over the patch dimension into a full local-attention block.

pub mod block;
pub mod core;
pub mod fused;
pub mod window;

pub use crate::block::local_attention;
pub use crate::core::errors::LocalAttentionError;
pub use crate::fused::{similarity, weighting};
pub use crate::window::WindowGeometry;
