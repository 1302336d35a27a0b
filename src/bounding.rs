//! Deterministic payload bounding
//!
//! Converts tensors and long lists into nested arrays whose every axis is at
//! most a configured cap. Oversized axes are sampled with a fixed stride
//! `k = ceil(total / cap)` starting at index 0, so identical requests always
//! keep identical indices.

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::Serialize;

use crate::error::ExplorerError;

/// Stride used to bring `total` elements under `cap`
pub fn stride_for(total: usize, cap: usize) -> usize {
    if cap == 0 || total <= cap {
        1
    } else {
        total.div_ceil(cap)
    }
}

/// Indices kept when sampling `total` elements down to `cap`
pub fn sample_indices(total: usize, cap: usize) -> Vec<usize> {
    (0..total).step_by(stride_for(total, cap)).collect()
}

/// A list sampled down to a cap
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sampled<T> {
    /// Length before sampling
    pub total: usize,
    /// Stride between kept elements (1 = nothing dropped)
    pub stride: usize,
    pub items: Vec<T>,
}

impl<T> Sampled<T> {
    pub fn is_truncated(&self) -> bool {
        self.stride > 1
    }
}

/// Sample a slice with a fixed stride
pub fn sample<T: Clone>(items: &[T], cap: usize) -> Sampled<T> {
    let stride = stride_for(items.len(), cap);
    Sampled {
        total: items.len(),
        stride,
        items: items.iter().step_by(stride).cloned().collect(),
    }
}

/// Sample an owned list with a fixed stride
pub fn sample_owned<T>(items: Vec<T>, cap: usize) -> Sampled<T> {
    let total = items.len();
    let stride = stride_for(total, cap);
    Sampled {
        total,
        stride,
        items: items.into_iter().step_by(stride).collect(),
    }
}

/// Nested numeric payload of rank 0 to 3
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum NestedArray {
    Scalar(f32),
    Vector(Vec<f32>),
    Matrix(Vec<Vec<f32>>),
    Cube(Vec<Vec<Vec<f32>>>),
}

/// A tensor converted to a bounded nested array
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundedTensor {
    /// Shape before sampling
    pub shape: Vec<usize>,
    /// Sampling stride per axis
    pub strides: Vec<usize>,
    pub data: NestedArray,
}

impl BoundedTensor {
    /// Shape after sampling
    pub fn sampled_shape(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.strides)
            .map(|(&n, &s)| n.div_ceil(s))
            .collect()
    }
}

/// Convert a tensor of rank <= 3 into a bounded nested array
///
/// `caps[i]` bounds axis `i`; axes without a cap are kept whole.
pub fn bound_tensor(tensor: &Tensor, caps: &[usize]) -> Result<BoundedTensor> {
    let shape = tensor.dims().to_vec();
    let values: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    bound_flat(&values, &shape, caps)
}

/// Bound a row-major buffer of the given shape (rank <= 3)
pub fn bound_flat(values: &[f32], shape: &[usize], caps: &[usize]) -> Result<BoundedTensor> {
    let expected: usize = shape.iter().product();
    if shape.len() > 3 || values.len() != expected {
        return Err(ExplorerError::shape_mismatch(
            "bounded buffer",
            format!("rank <= 3 with {expected} values"),
            format!("{} values for shape {shape:?}", values.len()),
        )
        .into());
    }
    let cap = |axis: usize| caps.get(axis).copied().unwrap_or(usize::MAX);
    let axis_indices: Vec<Vec<usize>> = shape
        .iter()
        .enumerate()
        .map(|(axis, &n)| sample_indices(n, cap(axis)))
        .collect();
    let strides = shape
        .iter()
        .enumerate()
        .map(|(axis, &n)| stride_for(n, cap(axis)))
        .collect();

    let data = match shape {
        [] => NestedArray::Scalar(values.first().copied().unwrap_or(0.0)),
        [_] => NestedArray::Vector(axis_indices[0].iter().map(|&i| values[i]).collect()),
        [_, cols] => NestedArray::Matrix(
            axis_indices[0]
                .iter()
                .map(|&r| axis_indices[1].iter().map(|&c| values[r * cols + c]).collect())
                .collect(),
        ),
        [_, rows, cols] => NestedArray::Cube(
            axis_indices[0]
                .iter()
                .map(|&a| {
                    axis_indices[1]
                        .iter()
                        .map(|&r| {
                            axis_indices[2]
                                .iter()
                                .map(|&c| values[(a * rows + r) * cols + c])
                                .collect()
                        })
                        .collect()
                })
                .collect(),
        ),
        _ => unreachable!("rank checked above"),
    };

    Ok(BoundedTensor {
        shape: shape.to_vec(),
        strides,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_stride_for() {
        assert_eq!(stride_for(10, 20), 1);
        assert_eq!(stride_for(20, 20), 1);
        assert_eq!(stride_for(21, 20), 2);
        assert_eq!(stride_for(2048, 256), 8);
        assert_eq!(stride_for(2049, 256), 9);
    }

    #[test]
    fn test_sampled_length_never_exceeds_cap() {
        for total in [0, 1, 7, 100, 257, 2048, 2049] {
            for cap in [1, 3, 10, 256] {
                let idx = sample_indices(total, cap);
                assert!(idx.len() <= cap.max(1), "total={total} cap={cap}");
                if total > 0 {
                    assert_eq!(idx[0], 0);
                }
            }
        }
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let items: Vec<u32> = (0..1000).collect();
        let a = sample(&items, 64);
        let b = sample(&items, 64);
        assert_eq!(a, b);
        assert_eq!(a.stride, 16);
        assert_eq!(a.items[..3], [0, 16, 32]);
        assert!(a.is_truncated());
    }

    #[test]
    fn test_bound_tensor_matrix() {
        let device = Device::Cpu;
        let values: Vec<f32> = (0..40).map(|v| v as f32).collect();
        let t = Tensor::from_vec(values, (4, 10), &device).unwrap();

        let bounded = bound_tensor(&t, &[4, 5]).unwrap();
        assert_eq!(bounded.shape, vec![4, 10]);
        assert_eq!(bounded.strides, vec![1, 2]);
        assert_eq!(bounded.sampled_shape(), vec![4, 5]);
        match &bounded.data {
            NestedArray::Matrix(rows) => {
                assert_eq!(rows.len(), 4);
                assert_eq!(rows[1], vec![10.0, 12.0, 14.0, 16.0, 18.0]);
            }
            other => panic!("expected matrix, got {other:?}"),
        }
    }

    #[test]
    fn test_bound_tensor_same_indices_twice() {
        let device = Device::Cpu;
        let t = Tensor::arange(0f32, 3.0 * 50.0 * 300.0, &device)
            .unwrap()
            .reshape((3, 50, 300))
            .unwrap();
        let a = bound_tensor(&t, &[2, 16, 64]).unwrap();
        let b = bound_tensor(&t, &[2, 16, 64]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.sampled_shape(), vec![2, 13, 60]);
    }

    #[test]
    fn test_bound_tensor_rejects_rank_four() {
        let t = Tensor::zeros((1, 1, 1, 1), DType::F32, &Device::Cpu).unwrap();
        assert!(bound_tensor(&t, &[]).is_err());
    }
}
