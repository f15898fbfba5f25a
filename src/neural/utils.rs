// projeto: npredict
// file: src/neural/utils.rs
// Error type, vector kernels, activation primitives and linear least squares

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NeuralError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Numerical error: {0}")]
    Numerical(String),
}

impl From<serde_json::Error> for NeuralError {
    fn from(err: serde_json::Error) -> Self {
        NeuralError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for NeuralError {
    fn from(err: toml::de::Error) -> Self {
        NeuralError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NeuralError {
    fn from(err: toml::ser::Error) -> Self {
        NeuralError::Config(err.to_string())
    }
}

/// Dot product of the first `n` elements of `x` and `y`.
///
/// Four independent accumulators keep the dependency chain short for long
/// vectors; the result differs from a naive loop only by rounding.
#[inline]
pub fn dot(n: usize, x: &[f64], y: &[f64]) -> f64 {
    let x = &x[..n];
    let y = &y[..n];
    let mut acc = [0.0f64; 4];

    let mut xc = x.chunks_exact(4);
    let mut yc = y.chunks_exact(4);
    for (a, b) in (&mut xc).zip(&mut yc) {
        acc[0] += a[0] * b[0];
        acc[1] += a[1] * b[1];
        acc[2] += a[2] * b[2];
        acc[3] += a[3] * b[3];
    }

    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for (a, b) in xc.remainder().iter().zip(yc.remainder()) {
        sum += a * b;
    }
    sum
}

/// Squared Euclidean distance over the first `n` elements.
#[inline]
pub fn sq_distance(n: usize, x: &[f64], y: &[f64]) -> f64 {
    let x = &x[..n];
    let y = &y[..n];
    let mut acc = [0.0f64; 4];

    let mut xc = x.chunks_exact(4);
    let mut yc = y.chunks_exact(4);
    for (a, b) in (&mut xc).zip(&mut yc) {
        let d0 = a[0] - b[0];
        let d1 = a[1] - b[1];
        let d2 = a[2] - b[2];
        let d3 = a[3] - b[3];
        acc[0] += d0 * d0;
        acc[1] += d1 * d1;
        acc[2] += d2 * d2;
        acc[3] += d3 * d3;
    }

    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for (a, b) in xc.remainder().iter().zip(yc.remainder()) {
        let d = a - b;
        sum += d * d;
    }
    sum
}

/// Scaled hyperbolic tangent transfer function.
///
/// The derivative is expressed in terms of the function's output so training
/// never has to keep pre-activation values around. The inverse clamps its
/// argument to `±clamp` before inverting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub scale: f64,
    pub clamp: f64,
}

impl Default for Activation {
    fn default() -> Self {
        Activation {
            scale: 1.5,
            clamp: 0.999999,
        }
    }
}

impl Activation {
    pub fn new(scale: f64, clamp: f64) -> Result<Self, NeuralError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(NeuralError::Validation(format!(
                "activation scale must be positive and finite, got {}",
                scale
            )));
        }
        if !(clamp > 0.0 && clamp < 1.0) {
            return Err(NeuralError::Validation(format!(
                "inverse activation clamp must lie in (0, 1), got {}",
                clamp
            )));
        }
        Ok(Activation { scale, clamp })
    }

    #[inline]
    pub fn activate(&self, x: f64) -> f64 {
        (self.scale * x).tanh()
    }

    #[inline]
    pub fn derivative(&self, output: f64) -> f64 {
        self.scale * (1.0 - output * output)
    }

    #[inline]
    pub fn inverse(&self, output: f64) -> f64 {
        if output.is_nan() {
            return 0.0;
        }
        let f = output.clamp(-self.clamp, self.clamp);
        f.atanh() / self.scale
    }
}

pub fn activate(x: f64) -> f64 {
    Activation::default().activate(x)
}

pub fn activation_derivative(output: f64) -> f64 {
    Activation::default().derivative(output)
}

pub fn inverse_activation(output: f64) -> f64 {
    Activation::default().inverse(output)
}

/// Least-squares solution of `A x = b` where `a` is `rows × cols`, row major.
///
/// Uses an SVD so rank-deficient designs still return the minimum-norm
/// solution instead of failing.
pub fn least_squares(rows: usize, cols: usize, a: &[f64], b: &[f64]) -> Result<Vec<f64>, NeuralError> {
    if a.len() != rows * cols || b.len() != rows {
        return Err(NeuralError::Validation(format!(
            "least squares shape mismatch: a has {} values for {}x{}, b has {}",
            a.len(),
            rows,
            cols,
            b.len()
        )));
    }
    if rows == 0 || cols == 0 {
        return Err(NeuralError::Validation("least squares on an empty system".to_string()));
    }

    let m = DMatrix::from_row_slice(rows, cols, a);
    let rhs = DVector::from_column_slice(b);
    let svd = m.svd(true, true);
    let max_sv = svd.singular_values.iter().cloned().fold(0.0f64, f64::max);
    let eps = (max_sv * 1e-12).max(f64::MIN_POSITIVE);

    let solution = svd
        .solve(&rhs, eps)
        .map_err(|e| NeuralError::Numerical(format!("SVD solve failed: {}", e)))?;
    Ok(solution.iter().cloned().collect())
}

pub fn validate_finite(values: &[f64], name: &str) -> Result<(), NeuralError> {
    for (i, &value) in values.iter().enumerate() {
        if value.is_nan() {
            return Err(NeuralError::Validation(
                format!("{} contains NaN at position {}", name, i)
            ));
        }
        if value.is_infinite() {
            return Err(NeuralError::Validation(
                format!("{} contains infinite value at position {}", name, i)
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_dot_matches_naive_sum() {
        let x: Vec<f64> = (0..37).map(|i| (i as f64 * 0.37).sin()).collect();
        let y: Vec<f64> = (0..37).map(|i| (i as f64 * 0.11).cos()).collect();
        let naive: f64 = x.iter().zip(&y).map(|(a, b)| a * b).sum();
        assert_relative_eq!(dot(37, &x, &y), naive, epsilon = 1e-12);
        assert_relative_eq!(dot(5, &x, &y), x[..5].iter().zip(&y[..5]).map(|(a, b)| a * b).sum::<f64>(), epsilon = 1e-12);
        assert_eq!(dot(0, &x, &y), 0.0);
    }

    #[test]
    fn test_dot_commutative_and_linear() {
        let x: Vec<f64> = (0..19).map(|i| i as f64 - 9.5).collect();
        let y: Vec<f64> = (0..19).map(|i| 1.0 / (i as f64 + 1.0)).collect();
        let scale = -3.25;
        let scaled: Vec<f64> = y.iter().map(|v| v * scale).collect();

        assert_relative_eq!(dot(19, &x, &y), dot(19, &y, &x), epsilon = 1e-12);
        assert_relative_eq!(dot(19, &x, &scaled), scale * dot(19, &x, &y), epsilon = 1e-10);
    }

    #[test]
    fn test_sq_distance() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [1.0, 0.0, 3.0, 1.0, 5.0];
        assert_relative_eq!(sq_distance(5, &x, &y), 13.0);
        assert_eq!(sq_distance(5, &x, &x), 0.0);
    }

    #[test]
    fn test_derivative_matches_numerical() {
        let act = Activation::default();
        let h = 1e-6;
        let mut x = -4.0;
        while x <= 4.0 {
            let numeric = (act.activate(x + h) - act.activate(x - h)) / (2.0 * h);
            let analytic = act.derivative(act.activate(x));
            assert!((numeric - analytic).abs() < 1e-6, "x={} numeric={} analytic={}", x, numeric, analytic);
            x += 0.05;
        }
    }

    #[test]
    fn test_free_functions_use_default_parameters() {
        assert_relative_eq!(activate(0.4), (1.5f64 * 0.4).tanh());
        assert_relative_eq!(activation_derivative(0.0), 1.5);
        assert_relative_eq!(activation_derivative(0.5), 1.5 * 0.75);
        assert_eq!(activate(0.0), 0.0);
    }

    #[test]
    fn test_inverse_round_trip() {
        let mut x = -2.0;
        while x <= 2.0 {
            assert_relative_eq!(inverse_activation(activate(x)), x, epsilon = 1e-8);
            x += 0.01;
        }
    }

    #[test]
    fn test_inverse_never_diverges() {
        for &f in &[1.0, -1.0, 1.5, -7.0, 1e300, -1e300, f64::INFINITY, f64::NEG_INFINITY, f64::NAN, 0.9999999999] {
            let v = inverse_activation(f);
            assert!(v.is_finite(), "inverse({}) = {}", f, v);
        }
        let act = Activation::default();
        assert_relative_eq!(inverse_activation(1.0), act.inverse(act.clamp));
    }

    #[test]
    fn test_activation_parameters_validated() {
        assert!(Activation::new(0.0, 0.9).is_err());
        assert!(Activation::new(1.0, 1.0).is_err());
        assert!(Activation::new(2.0, 0.99).is_ok());
    }

    #[test]
    fn test_least_squares_exact_fit() {
        // y = 2 + 3x
        let a = [1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0];
        let b = [2.0, 5.0, 8.0, 11.0];
        let x = least_squares(4, 2, &a, &b).unwrap();
        assert_relative_eq!(x[0], 2.0, epsilon = 1e-9);
        assert_relative_eq!(x[1], 3.0, epsilon = 1e-9);
        assert!(least_squares(3, 2, &a, &b).is_err());
    }

    #[test]
    fn test_validate_finite() {
        assert!(validate_finite(&[1.0, 2.0], "ok").is_ok());
        assert!(validate_finite(&[1.0, f64::NAN], "bad").is_err());
        assert!(validate_finite(&[f64::INFINITY], "bad").is_err());
    }
}
