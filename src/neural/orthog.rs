// projeto: npredict
// file: src/neural/orthog.rs
// Principal components, class centroids and discriminant projections

use std::collections::BTreeMap;

use log::{info, warn};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::neural::progress::TrainingContext;
use crate::neural::signal::{is_missing, Signal, MISSING};
use crate::neural::utils::NeuralError;

const RANK_EPS: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    PrincipalComponents,
    Centroid,
    Discriminant,
}

impl TransformKind {
    fn prefix(&self) -> &'static str {
        match self {
            TransformKind::PrincipalComponents => "pc",
            TransformKind::Centroid => "centroid",
            TransformKind::Discriminant => "disc",
        }
    }

    fn needs_classes(&self) -> bool {
        !matches!(self, TransformKind::PrincipalComponents)
    }
}

/// Fitted linear projection from `dims` input signals onto `factor_count`
/// factors. Inputs are centred (and scaled when `standardize` is set)
/// before projecting, exactly as during the fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrthogonalTransform {
    kind: TransformKind,
    factor_count: usize,
    basis: Array2<f64>,
    standardize: bool,
    means: Vec<f64>,
    scales: Vec<f64>,
    /// Eigenvalue (or centroid norm) behind each factor.
    strengths: Vec<f64>,
    skipped: usize,
}

/// Rows of the inputs with every value present, plus a dense class index
/// for each kept row when `classes` is given. Distinct labels map to
/// `0..k` in ascending label order.
fn complete_rows(signals: &[&Signal], classes: Option<&Signal>) -> Result<(Vec<Vec<f64>>, Vec<usize>, usize), NeuralError> {
    let len = signals[0].len();
    if let Some(s) = signals.iter().find(|s| s.len() != len) {
        return Err(NeuralError::Validation(format!(
            "signal '{}' has length {}, expected {}", s.name(), s.len(), len
        )));
    }
    if let Some(c) = classes {
        if c.len() != len {
            return Err(NeuralError::Validation(format!(
                "class signal '{}' has length {}, expected {}", c.name(), c.len(), len
            )));
        }
    }

    let mut rows = Vec::with_capacity(len);
    let mut labels = Vec::new();
    let mut raw_labels = Vec::new();
    let mut skipped = 0;
    for t in 0..len {
        let row: Vec<f64> = signals.iter().map(|s| s.values()[t]).collect();
        let label = classes.map(|c| c.values()[t]);
        if row.iter().any(|v| is_missing(*v)) || label.map(is_missing).unwrap_or(false) {
            skipped += 1;
            continue;
        }
        if let Some(l) = label {
            if !(l.is_finite() && l >= 0.0 && l.fract() == 0.0 && l <= u32::MAX as f64) {
                return Err(NeuralError::Validation(format!(
                    "class label {} at index {} is not a non-negative integer", l, t
                )));
            }
            raw_labels.push(l as u64);
        }
        rows.push(row);
    }

    if !raw_labels.is_empty() {
        let mut index = BTreeMap::new();
        for &l in &raw_labels {
            index.entry(l).or_insert(0usize);
        }
        for (i, slot) in index.values_mut().enumerate() {
            *slot = i;
        }
        labels = raw_labels.iter().map(|l| index[l]).collect();
    }
    Ok((rows, labels, skipped))
}

/// Eigenpairs sorted by descending eigenvalue; each eigenvector is signed so
/// its largest-magnitude component is positive.
fn sorted_eigen(m: DMatrix<f64>) -> Vec<(f64, DVector<f64>)> {
    let eig = SymmetricEigen::new(m);
    let mut pairs: Vec<(f64, DVector<f64>)> = eig.eigenvalues.iter().cloned()
        .zip(eig.eigenvectors.column_iter().map(|c| c.into_owned()))
        .collect();
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));
    for (_, v) in pairs.iter_mut() {
        canonical_sign(v);
    }
    pairs
}

fn canonical_sign(v: &mut DVector<f64>) {
    let pivot = v.iter().cloned().fold(0.0f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        v.neg_mut();
    }
}

impl OrthogonalTransform {
    /// Fits a basis where each signal is one input dimension and each time
    /// index one observation. `classes` carries integer class labels and is
    /// required by the centroid and discriminant kinds. Cancellation is
    /// polled before the decomposition; a cancelled fit has no basis to keep
    /// and returns an error.
    pub fn fit(
        kind: TransformKind,
        signals: &[&Signal],
        classes: Option<&Signal>,
        factor_count: usize,
        standardize: bool,
        ctx: &TrainingContext,
    ) -> Result<Self, NeuralError> {
        if signals.is_empty() {
            return Err(NeuralError::Validation("orthogonal transform needs at least one signal".to_string()));
        }
        let dims = signals.len();
        if factor_count == 0 || factor_count > dims {
            return Err(NeuralError::Validation(format!(
                "factor count must lie in 1..={}, got {}", dims, factor_count
            )));
        }
        if kind.needs_classes() && classes.is_none() {
            return Err(NeuralError::Validation(format!("{:?} transform needs class labels", kind)));
        }

        let classes = if kind.needs_classes() { classes } else { None };
        let (rows, labels, skipped) = complete_rows(signals, classes)?;
        if skipped > 0 {
            warn!("⚠️ Skipped {} observations with missing values", skipped);
            ctx.report(&format!("skipped {} incomplete observations", skipped));
        }
        let n = rows.len();
        if n < 2 {
            return Err(NeuralError::Validation(format!("need at least 2 complete observations, got {}", n)));
        }

        let mut means = vec![0.0; dims];
        for row in &rows {
            for (m, v) in means.iter_mut().zip(row) {
                *m += v / n as f64;
            }
        }
        let mut scales = vec![1.0; dims];
        if standardize {
            for (d, s) in scales.iter_mut().enumerate() {
                let var = rows.iter().map(|r| (r[d] - means[d]).powi(2)).sum::<f64>() / (n - 1) as f64;
                if var <= 0.0 {
                    return Err(NeuralError::Validation(format!(
                        "signal '{}' is constant and cannot be standardized", signals[d].name()
                    )));
                }
                *s = var.sqrt();
            }
        }
        let z = DMatrix::from_fn(n, dims, |i, d| (rows[i][d] - means[d]) / scales[d]);

        if ctx.is_cancelled() {
            return Err(NeuralError::Validation(format!("{:?} fit cancelled", kind)));
        }

        let (directions, strengths) = match kind {
            TransformKind::PrincipalComponents => Self::principal_components(&z, factor_count)?,
            TransformKind::Centroid => Self::centroids(&z, &labels, factor_count)?,
            TransformKind::Discriminant => Self::discriminants(&z, &labels, factor_count)?,
        };

        let basis = Array2::from_shape_fn((factor_count, dims), |(f, d)| directions[f][d]);
        info!("📐 Fitted {:?} transform: {} dims → {} factors from {} observations",
              kind, dims, factor_count, n);
        ctx.report(&format!("{:?}: {} factors, strengths {:?}", kind, factor_count, strengths));
        Ok(OrthogonalTransform {
            kind,
            factor_count,
            basis,
            standardize,
            means,
            scales,
            strengths,
            skipped,
        })
    }

    fn principal_components(z: &DMatrix<f64>, k: usize) -> Result<(Vec<DVector<f64>>, Vec<f64>), NeuralError> {
        let n = z.nrows();
        let cov = (z.transpose() * z) / (n - 1) as f64;
        let pairs = sorted_eigen(cov);
        Ok(pairs.into_iter().take(k).map(|(l, v)| (v, l)).unzip())
    }

    /// Per-class counts and means indexed by class label.
    fn class_stats(z: &DMatrix<f64>, labels: &[usize]) -> (Vec<usize>, Vec<DVector<f64>>) {
        let n_classes = labels.iter().cloned().max().map(|m| m + 1).unwrap_or(0);
        let mut sums = vec![DVector::zeros(z.ncols()); n_classes];
        let mut counts = vec![0usize; n_classes];
        for (row, &c) in z.row_iter().zip(labels) {
            sums[c] += row.transpose();
            counts[c] += 1;
        }
        let means = sums.into_iter().zip(&counts)
            .map(|(sum, &count)| if count > 0 { sum / count as f64 } else { sum })
            .collect();
        (counts, means)
    }

    /// Gram–Schmidt over the class centroids, largest classes first.
    fn centroids(z: &DMatrix<f64>, labels: &[usize], k: usize) -> Result<(Vec<DVector<f64>>, Vec<f64>), NeuralError> {
        let (counts, class_means) = Self::class_stats(z, labels);
        let mut means: Vec<(usize, DVector<f64>)> = counts.into_iter().zip(class_means)
            .filter(|(count, _)| *count > 0)
            .collect();
        if means.len() < 2 {
            return Err(NeuralError::Validation("centroid transform needs at least 2 classes".to_string()));
        }
        means.sort_by(|a, b| b.0.cmp(&a.0));

        let scale = means.iter().map(|(_, m)| m.norm()).fold(0.0, f64::max);
        let mut basis: Vec<DVector<f64>> = Vec::new();
        let mut strengths = Vec::new();
        for (_, m) in means {
            let mut v = m.clone();
            for b in &basis {
                let proj = v.dot(b);
                v -= b * proj;
            }
            let norm = v.norm();
            if norm > RANK_EPS * scale.max(1.0) {
                let mut v = v / norm;
                canonical_sign(&mut v);
                basis.push(v);
                strengths.push(norm);
            }
            if basis.len() == k {
                return Ok((basis, strengths));
            }
        }
        Err(NeuralError::Validation(format!(
            "class centroids span only {} directions, {} requested", basis.len(), k
        )))
    }

    /// Eigenvectors of W⁻¹B through the whitened symmetric problem
    /// `W^-½ B W^-½ u = λ u`, mapped back as `a = W^-½ u`.
    fn discriminants(z: &DMatrix<f64>, labels: &[usize], k: usize) -> Result<(Vec<DVector<f64>>, Vec<f64>), NeuralError> {
        let dims = z.ncols();
        let (counts, means) = Self::class_stats(z, labels);
        let populated = counts.iter().filter(|&&c| c > 0).count();
        if populated < 2 {
            return Err(NeuralError::Validation("discriminant transform needs at least 2 classes".to_string()));
        }

        let mut within = DMatrix::zeros(dims, dims);
        for (row, &c) in z.row_iter().zip(labels) {
            let d = row.transpose() - &means[c];
            within += &d * d.transpose();
        }
        let mut between = DMatrix::zeros(dims, dims);
        for (count, m) in counts.iter().zip(&means) {
            between += (m * m.transpose()) * (*count as f64);
        }

        let w_eig = SymmetricEigen::new(within);
        let max_ev = w_eig.eigenvalues.iter().cloned().fold(0.0, f64::max);
        if w_eig.eigenvalues.iter().any(|&l| l <= RANK_EPS * max_ev.max(1.0)) {
            return Err(NeuralError::Numerical("within-class scatter is singular".to_string()));
        }
        let inv_sqrt = DMatrix::from_diagonal(&w_eig.eigenvalues.map(|l| 1.0 / l.sqrt()));
        let w_inv_half = &w_eig.eigenvectors * inv_sqrt * w_eig.eigenvectors.transpose();
        let m = &w_inv_half * between * &w_inv_half;

        let usable = (populated - 1).min(dims);
        if k > usable {
            return Err(NeuralError::Validation(format!(
                "{} classes give at most {} discriminant directions, {} requested", populated, usable, k
            )));
        }
        let mut dirs = Vec::with_capacity(k);
        let mut strengths = Vec::with_capacity(k);
        for (l, u) in sorted_eigen(m).into_iter().take(k) {
            let a = &w_inv_half * u;
            let norm = a.norm();
            if norm <= 0.0 {
                return Err(NeuralError::Numerical("degenerate discriminant direction".to_string()));
            }
            let mut a = a / norm;
            canonical_sign(&mut a);
            dirs.push(a);
            strengths.push(l);
        }
        Ok((dirs, strengths))
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn factor_count(&self) -> usize {
        self.factor_count
    }

    pub fn dims(&self) -> usize {
        self.basis.ncols()
    }

    pub fn basis(&self) -> &Array2<f64> {
        &self.basis
    }

    pub fn standardize(&self) -> bool {
        self.standardize
    }

    pub fn strengths(&self) -> &[f64] {
        &self.strengths
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Projects the signals onto the basis; one output signal per factor.
    pub fn apply(&self, signals: &[&Signal]) -> Result<Vec<Signal>, NeuralError> {
        if signals.len() != self.dims() {
            return Err(NeuralError::Validation(format!(
                "transform was fit on {} signals, got {}", self.dims(), signals.len()
            )));
        }
        let len = signals[0].len();
        if let Some(s) = signals.iter().find(|s| s.len() != len) {
            return Err(NeuralError::Validation(format!(
                "signal '{}' has length {}, expected {}", s.name(), s.len(), len
            )));
        }

        let mut outputs: Vec<Vec<f64>> = vec![Vec::with_capacity(len); self.factor_count];
        for t in 0..len {
            let x: Vec<f64> = signals.iter().map(|s| s.values()[t]).collect();
            if x.iter().any(|v| is_missing(*v)) {
                outputs.iter_mut().for_each(|o| o.push(MISSING));
                continue;
            }
            let z = Array1::from_iter((0..x.len()).map(|d| (x[d] - self.means[d]) / self.scales[d]));
            let y = self.basis.dot(&z);
            for (o, v) in outputs.iter_mut().zip(y.iter()) {
                o.push(*v);
            }
        }

        Ok(outputs.into_iter().enumerate()
            .map(|(f, values)| Signal::new(format!("{}{}", self.kind.prefix(), f + 1), values))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::progress::CancelToken;
    use approx::assert_relative_eq;
    use crossbeam::channel::unbounded;

    fn silent() -> TrainingContext<'static> {
        TrainingContext::silent()
    }

    fn three_dims() -> Vec<Signal> {
        let a: Vec<f64> = (0..40).map(|i| (i as f64 * 0.37).sin() * 3.0).collect();
        let b: Vec<f64> = (0..40).map(|i| a[i] * 0.5 + (i as f64 * 1.3).cos()).collect();
        let c: Vec<f64> = (0..40).map(|i| (i as f64 * 0.71).cos() * 0.2 - a[i] * 0.1).collect();
        vec![Signal::new("a", a), Signal::new("b", b), Signal::new("c", c)]
    }

    fn two_classes() -> (Signal, Signal, Signal) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut cls = Vec::new();
        for class in 0..2 {
            for i in 0..20 {
                let centre = if class == 0 { -1.0 } else { 1.0 };
                x.push(centre + 0.1 * ((i * 7 % 5) as f64 - 2.0));
                y.push((i as f64 - 9.5) * 0.5);
                cls.push(class as f64);
            }
        }
        (Signal::new("x", x), Signal::new("y", y), Signal::new("class", cls))
    }

    #[test]
    fn test_pca_basis_is_orthonormal() {
        let s = three_dims();
        let refs: Vec<&Signal> = s.iter().collect();
        for standardize in [false, true] {
            let t = OrthogonalTransform::fit(TransformKind::PrincipalComponents, &refs, None, 3, standardize, &silent()).unwrap();
            let gram = t.basis().dot(&t.basis().t());
            for i in 0..3 {
                for j in 0..3 {
                    assert_relative_eq!(gram[[i, j]], if i == j { 1.0 } else { 0.0 }, epsilon = 1e-9);
                }
            }
            assert!(t.strengths().windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn test_pca_finds_correlated_direction() {
        let a = Signal::new("a", (0..20).map(|i| i as f64).collect());
        let b = Signal::new("b", (0..20).map(|i| i as f64).collect());
        let t = OrthogonalTransform::fit(TransformKind::PrincipalComponents, &[&a, &b], None, 1, false, &silent()).unwrap();
        let h = std::f64::consts::FRAC_1_SQRT_2;
        assert_relative_eq!(t.basis()[[0, 0]], h, epsilon = 1e-9);
        assert_relative_eq!(t.basis()[[0, 1]], h, epsilon = 1e-9);

        let out = t.apply(&[&a, &b]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].name(), "pc1");
        assert_relative_eq!(out[0].mean().unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_apply_rejects_dimension_mismatch() {
        let s = three_dims();
        let refs: Vec<&Signal> = s.iter().collect();
        let t = OrthogonalTransform::fit(TransformKind::PrincipalComponents, &refs, None, 2, true, &silent()).unwrap();
        assert!(matches!(t.apply(&refs[..2]), Err(NeuralError::Validation(_))));
        assert!(OrthogonalTransform::fit(TransformKind::PrincipalComponents, &refs, None, 4, true, &silent()).is_err());
    }

    #[test]
    fn test_missing_rows_skipped_and_propagated() {
        let a = Signal::new("a", vec![1.0, 2.0, MISSING, 4.0, 5.0]);
        let b = Signal::new("b", vec![2.0, 1.0, 3.0, 5.0, 4.0]);
        let t = OrthogonalTransform::fit(TransformKind::PrincipalComponents, &[&a, &b], None, 2, false, &silent()).unwrap();
        assert_eq!(t.skipped(), 1);
        let out = t.apply(&[&a, &b]).unwrap();
        assert!(is_missing(out[0].values()[2]));
        assert!(!is_missing(out[1].values()[3]));
    }

    #[test]
    fn test_centroid_direction_separates_classes() {
        let (x, y, cls) = two_classes();
        let t = OrthogonalTransform::fit(TransformKind::Centroid, &[&x, &y], Some(&cls), 1, false, &silent()).unwrap();
        assert!(t.basis()[[0, 0]].abs() > 0.99);
        assert!(OrthogonalTransform::fit(TransformKind::Centroid, &[&x, &y], None, 1, false, &silent()).is_err());
        assert!(OrthogonalTransform::fit(TransformKind::Centroid, &[&x, &y], Some(&cls), 2, false, &silent()).is_err());
    }

    #[test]
    fn test_discriminant_direction() {
        let (x, y, cls) = two_classes();
        let t = OrthogonalTransform::fit(TransformKind::Discriminant, &[&x, &y], Some(&cls), 1, true, &silent()).unwrap();
        assert!(t.basis()[[0, 0]].abs() > 0.95, "basis {:?}", t.basis());
        let out = t.apply(&[&x, &y]).unwrap();
        let first: f64 = out[0].values()[..20].iter().sum::<f64>() / 20.0;
        let second: f64 = out[0].values()[20..].iter().sum::<f64>() / 20.0;
        assert!((first - second).abs() > 1.0);
    }

    #[test]
    fn test_sparse_class_labels_are_remapped() {
        let x = Signal::new("x", vec![-1.0, -1.1, 1.0, 1.2]);
        let y = Signal::new("y", vec![0.3, -0.2, 0.1, -0.4]);
        let sparse = Signal::new("c", vec![0.0, 0.0, 1e9, 1e9]);
        let dense = Signal::new("c", vec![0.0, 0.0, 1.0, 1.0]);
        let a = OrthogonalTransform::fit(TransformKind::Centroid, &[&x, &y], Some(&sparse), 1, false, &silent()).unwrap();
        let b = OrthogonalTransform::fit(TransformKind::Centroid, &[&x, &y], Some(&dense), 1, false, &silent()).unwrap();
        assert_eq!(a.basis(), b.basis());

        let huge = Signal::new("c", vec![0.0, 0.0, 1e20, 1e20]);
        let err = OrthogonalTransform::fit(TransformKind::Centroid, &[&x, &y], Some(&huge), 1, false, &silent());
        assert!(matches!(err, Err(NeuralError::Validation(_))));
        let inf = Signal::new("c", vec![0.0, 0.0, f64::INFINITY, f64::INFINITY]);
        let err = OrthogonalTransform::fit(TransformKind::Discriminant, &[&x, &y], Some(&inf), 1, false, &silent());
        assert!(matches!(err, Err(NeuralError::Validation(_))));
    }

    #[test]
    fn test_fit_reports_and_honours_cancel() {
        let a = Signal::new("a", vec![1.0, 2.0, MISSING, 4.0, 5.0]);
        let b = Signal::new("b", vec![2.0, 1.0, 3.0, 5.0, 4.0]);
        let (tx, rx) = unbounded();
        let sink = crate::neural::progress::ChannelSink::new(tx);
        let ctx = TrainingContext::silent().with_sink(&sink);
        OrthogonalTransform::fit(TransformKind::PrincipalComponents, &[&a, &b], None, 1, false, &ctx).unwrap();
        let messages: Vec<String> = rx.try_iter().collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].contains("skipped 1"));

        let token = CancelToken::new();
        token.cancel();
        let ctx = TrainingContext::silent().with_cancel(&token);
        let err = OrthogonalTransform::fit(TransformKind::PrincipalComponents, &[&a, &b], None, 1, false, &ctx);
        assert!(matches!(err, Err(NeuralError::Validation(_))));
    }
}
