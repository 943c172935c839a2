//! Numeric leaf kernels
//!
//! Every leaf follows a fixed calling convention: element count first, then
//! the output, then the inputs. Forwards never call a leaf directly; they
//! look it up per element type through [`type_traits`] so that a type
//! without an implementation is rejected up front instead of mid-graph.

use crate::tensor::DataType;

/// `s = sum(x[i] * y[i])` over the first `n` elements.
pub type VecDotFn = fn(n: usize, s: &mut f32, x: &[f32], y: &[f32]);

/// `y[i] = silu(x[i])`
pub type VecSiluFn = fn(n: usize, y: &mut [f32], x: &[f32]);

/// `y[i] = silu(x[i]) * g[i]`
pub type VecSwigluFn = fn(n: usize, y: &mut [f32], x: &[f32], g: &[f32]);

/// Leaf kernels available for one element type.
#[derive(Debug, Clone, Copy)]
pub struct CpuTypeTraits {
    pub dtype: DataType,
    /// Type `src1` must have for `vec_dot` against this type
    pub vec_dot_type: DataType,
    pub vec_dot: VecDotFn,
    pub vec_silu: VecSiluFn,
    pub vec_swiglu: VecSwigluFn,
}

static F32_TRAITS: CpuTypeTraits = CpuTypeTraits {
    dtype: DataType::F32,
    vec_dot_type: DataType::F32,
    vec_dot: vec_dot_f32,
    vec_silu: vec_silu_f32,
    vec_swiglu: vec_swiglu_f32,
};

/// Leaf kernels for `ty`, or `None` when the CPU has no arithmetic for it.
pub fn type_traits(ty: DataType) -> Option<&'static CpuTypeTraits> {
    match ty {
        DataType::F32 => Some(&F32_TRAITS),
        _ => None,
    }
}

pub fn vec_dot_f32(n: usize, s: &mut f32, x: &[f32], y: &[f32]) {
    // four independent accumulators keep the loop free of a serial dependency
    let mut acc = [0.0f32; 4];
    let (xc, xr) = x[..n].split_at(n - n % 4);
    let (yc, yr) = y[..n].split_at(n - n % 4);
    for (a, b) in xc.chunks_exact(4).zip(yc.chunks_exact(4)) {
        for k in 0..4 {
            acc[k] += a[k] * b[k];
        }
    }
    let tail: f32 = xr.iter().zip(yr).map(|(a, b)| a * b).sum();
    *s = acc[0] + acc[1] + acc[2] + acc[3] + tail;
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

pub fn vec_silu_f32(n: usize, y: &mut [f32], x: &[f32]) {
    for (o, &v) in y[..n].iter_mut().zip(&x[..n]) {
        *o = silu(v);
    }
}

pub fn vec_swiglu_f32(n: usize, y: &mut [f32], x: &[f32], g: &[f32]) {
    for ((o, &v), &gate) in y[..n].iter_mut().zip(&x[..n]).zip(&g[..n]) {
        *o = silu(v) * gate;
    }
}

// ============================================================================
// Scalar activations
// ============================================================================

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF_A: f32 = 0.044_715;
const GELU_QUICK_COEF: f32 = -1.702;

#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).tanh())
}

#[inline]
pub fn gelu_quick(x: f32) -> f32 {
    x * (1.0 / (1.0 + (GELU_QUICK_COEF * x).exp()))
}

#[inline]
pub fn gelu_erf(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn hardsigmoid(x: f32) -> f32 {
    ((x + 3.0) / 6.0).clamp(0.0, 1.0)
}

/// Abramowitz & Stegun 7.1.26, max abs error 1.5e-7.
pub fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() as f64;
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t * (0.254_829_592 + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp()) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_dot_with_tail() {
        let x: Vec<f32> = (1..=7).map(|v| v as f32).collect();
        let y = vec![1.0f32; 7];
        let mut s = 0.0;
        vec_dot_f32(7, &mut s, &x, &y);
        assert_eq!(s, 28.0);

        vec_dot_f32(3, &mut s, &x, &x);
        assert_eq!(s, 14.0);
    }

    #[test]
    fn test_traits_table() {
        let traits = type_traits(DataType::F32).unwrap();
        let mut out = [0.0f32; 2];
        (traits.vec_silu)(2, &mut out, &[0.0, 1.0]);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.731_058_6).abs() < 1e-6);

        (traits.vec_swiglu)(2, &mut out, &[0.0, 1.0], &[5.0, 2.0]);
        assert!((out[1] - 1.462_117_2).abs() < 1e-6);

        assert!(type_traits(DataType::Q4_0).is_none());
    }

    #[test]
    fn test_activations() {
        assert!((erf(0.5) - 0.520_499_9).abs() < 1e-6);
        assert!((erf(-0.5) + 0.520_499_9).abs() < 1e-6);
        assert!((gelu(1.0) - 0.841_192).abs() < 1e-4);
        assert!((gelu_erf(1.0) - 0.841_344_7).abs() < 1e-5);
        assert_eq!(hardsigmoid(5.0), 1.0);
        assert_eq!(hardsigmoid(-5.0), 0.0);
        assert!((sigmoid(0.0) - 0.5).abs() < f32::EPSILON);
    }
}
