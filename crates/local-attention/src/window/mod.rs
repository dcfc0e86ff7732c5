//! Window geometry shared by the similarity and weighting kernels.
//!
//! A window is the `kh x kw` set of spatial offsets centred on an anchor
//! location, enumerated in row-major order. Under the causal restriction the
//! enumeration stops at the centre element (inclusive), shrinking the patch
//! length from `kh * kw` to `kh * kw / 2 + 1`. Forward and backward passes
//! must use the identical enumeration so gradient accumulation targets line
//! up exactly with the cells read in the forward pass; everything here is a
//! pure function of `(kh, kw, causal)`.

use crate::core::errors::LocalAttentionError;

/// Validated `kh x kw` neighbourhood description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    kh: usize,
    kw: usize,
    causal: bool,
}

impl WindowGeometry {
    /// Builds a geometry from window extents and the causal flag.
    ///
    /// Both extents must be positive and odd so the window has a
    /// well-defined centre element.
    pub fn new(kh: usize, kw: usize, causal: bool) -> Result<Self, LocalAttentionError> {
        if kh == 0 || kw == 0 || kh % 2 == 0 || kw % 2 == 0 {
            return Err(LocalAttentionError::Config {
                context: format!("window extents must be positive odd integers, got {kh}x{kw}"),
            });
        }
        Ok(Self { kh, kw, causal })
    }

    /// Window height.
    pub fn kh(&self) -> usize {
        self.kh
    }

    /// Window width.
    pub fn kw(&self) -> usize {
        self.kw
    }

    /// Whether the neighbourhood is truncated at the centre element.
    pub fn causal(&self) -> bool {
        self.causal
    }

    /// Length of the flattened neighbour dimension.
    pub fn patch_len(&self) -> usize {
        if self.causal {
            self.kh * self.kw / 2 + 1
        } else {
            self.kh * self.kw
        }
    }

    /// Ordered `(di, dj)` neighbour offsets relative to the anchor.
    ///
    /// Row-major over the window; under the causal restriction only the
    /// prefix up to and including `(0, 0)` is produced. The returned list is
    /// deterministic and callers may cache it per geometry.
    pub fn offsets(&self) -> Vec<(isize, isize)> {
        let half_h = (self.kh / 2) as isize;
        let half_w = (self.kw / 2) as isize;
        (0..self.patch_len())
            .map(|p| {
                (
                    (p / self.kw) as isize - half_h,
                    (p % self.kw) as isize - half_w,
                )
            })
            .collect()
    }
}
