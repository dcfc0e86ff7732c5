//! Production-scale runs: 64x64 feature maps, 64 channels, 9x9 causal
//! windows, matching the configuration the kernels are deployed with.

mod common;

use candle_core::{DType, Device, Tensor, Var};
use common::{max_rel_err, oracle_similarity, oracle_weighting};
use local_attention::{local_attention, similarity, weighting, WindowGeometry};

const KH: usize = 9;
const KW: usize = 9;
const CAUSAL: bool = true;

#[test]
fn similarity_at_scale_matches_oracle() {
    let device = Device::Cpu;
    let geom = WindowGeometry::new(KH, KW, CAUSAL).unwrap();
    let x = Tensor::rand(0f32, 1f32, (4, 64, 64, 64), &device).unwrap();
    let y = Tensor::rand(0f32, 1f32, (4, 64, 64, 64), &device).unwrap();

    let fused = similarity(&x, &y, KH, KW, CAUSAL).unwrap();
    assert_eq!(fused.dims(), &[4, 64, 64, geom.patch_len()]);

    let reference = oracle_similarity(&x, &y, KH, KW, CAUSAL).unwrap();
    let err = max_rel_err(&fused, &reference).unwrap();
    assert!(err < 1e-3, "relative error {err}");
}

#[test]
fn weighting_at_scale_matches_oracle() {
    let device = Device::Cpu;
    let geom = WindowGeometry::new(KH, KW, CAUSAL).unwrap();
    let x = Tensor::rand(0f32, 1f32, (4, 64, 64, 64), &device).unwrap();
    let y = Tensor::rand(0f32, 1f32, (4, 64, 64, geom.patch_len()), &device).unwrap();

    let fused = weighting(&x, &y, KH, KW, CAUSAL).unwrap();
    assert_eq!(fused.dims(), &[4, 64, 64, 64]);

    let reference = oracle_weighting(&x, &y, KH, KW, CAUSAL).unwrap();
    let err = max_rel_err(&fused, &reference).unwrap();
    assert!(err < 1e-3, "relative error {err}");
}

#[test]
fn backward_at_scale_completes_with_finite_gradients() {
    let device = Device::Cpu;
    let query = Var::from_tensor(&Tensor::rand(0f32, 1f32, (4, 64, 64, 64), &device).unwrap())
        .unwrap();
    let key = Var::from_tensor(&Tensor::rand(0f32, 1f32, (4, 64, 64, 64), &device).unwrap())
        .unwrap();
    let value = Var::from_tensor(&Tensor::rand(0f32, 1f32, (4, 64, 64, 64), &device).unwrap())
        .unwrap();

    let out = local_attention(
        query.as_tensor(),
        key.as_tensor(),
        value.as_tensor(),
        KH,
        KW,
        CAUSAL,
    )
    .unwrap();
    let grads = out.sum_all().unwrap().backward().unwrap();

    for (name, var) in [("query", &query), ("key", &key), ("value", &value)] {
        let grad = grads.get(var).unwrap_or_else(|| panic!("grad for {name}"));
        assert_eq!(grad.dims(), &[4, 64, 64, 64], "{name}");
        let values = grad.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()), "{name}");
    }
}

#[test]
fn half_precision_block_at_scale_stays_close_to_f32() {
    let device = Device::Cpu;
    let query = Tensor::rand(0f32, 1f32, (1, 64, 64, 64), &device).unwrap();
    let key = Tensor::rand(0f32, 1f32, (1, 64, 64, 64), &device).unwrap();
    let value = Tensor::rand(0f32, 1f32, (1, 64, 64, 64), &device).unwrap();

    let wide = local_attention(&query, &key, &value, KH, KW, CAUSAL).unwrap();

    let query_h = query.to_dtype(DType::F16).unwrap();
    let key_h = key.to_dtype(DType::F16).unwrap();
    let value_h = value.to_dtype(DType::F16).unwrap();
    let narrow = local_attention(&query_h, &key_h, &value_h, KH, KW, CAUSAL).unwrap();
    assert_eq!(narrow.dtype(), DType::F16);

    // Attention outputs are convex combinations of the values, so half
    // precision drifts by rounding only.
    let err = max_rel_err(&narrow, &wide).unwrap();
    assert!(err < 5e-2, "relative error {err}");
}
