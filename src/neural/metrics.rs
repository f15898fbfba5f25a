// projeto: npredict
// file: src/neural/metrics.rs
// Regression metrics for held-out evaluation of trained models

use log::info;
use serde::{Deserialize, Serialize};

use crate::neural::cases::TrainingSet;
use crate::neural::model::NetworkModel;
use crate::neural::signal::is_missing;
use crate::neural::utils::NeuralError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub mape: f64,
    pub directional_accuracy: f64,
    pub r_squared: f64,
    pub max_error: f64,
    pub median_ae: f64,
    pub n_samples: usize,
}

impl RegressionMetrics {
    pub fn log_summary(&self, label: &str) {
        info!("📈 [Metrics] {} ({} samples):", label, self.n_samples);
        info!("   ├── MSE: {:.6}", self.mse);
        info!("   ├── RMSE: {:.6}", self.rmse);
        info!("   ├── MAE: {:.6}", self.mae);
        info!("   ├── MAPE: {:.2}%", self.mape);
        info!("   ├── Direction Acc: {:.2}%", self.directional_accuracy * 100.0);
        info!("   ├── Max Error: {:.6}", self.max_error);
        info!("   └── R²: {:.6}", self.r_squared);
    }
}

/// Metrics over paired values; pairs where either side is missing are
/// ignored.
pub fn calculate_regression_metrics(predictions: &[f64], targets: &[f64]) -> Result<RegressionMetrics, NeuralError> {
    if predictions.len() != targets.len() {
        return Err(NeuralError::Validation(format!(
            "{} predictions for {} targets", predictions.len(), targets.len()
        )));
    }
    let (predictions, targets): (Vec<f64>, Vec<f64>) = predictions.iter().zip(targets)
        .filter(|(p, t)| !is_missing(**p) && !is_missing(**t))
        .map(|(p, t)| (*p, *t))
        .unzip();
    if predictions.is_empty() {
        return Err(NeuralError::Validation("no paired values to score".to_string()));
    }

    let n = predictions.len() as f64;
    let errors: Vec<f64> = predictions.iter().zip(&targets).map(|(p, t)| p - t).collect();

    let mse = errors.iter().map(|e| e * e).sum::<f64>() / n;
    let rmse = mse.sqrt();
    let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;

    let mape = predictions.iter().zip(&targets)
        .filter(|(_, t)| **t != 0.0)
        .map(|(p, t)| ((p - t) / t).abs())
        .sum::<f64>() / n * 100.0;

    let correct_direction = (1..predictions.len())
        .filter(|&i| {
            let pred_change = predictions[i] - predictions[i - 1];
            let actual_change = targets[i] - targets[i - 1];
            pred_change.signum() == actual_change.signum()
        })
        .count();
    let directional_accuracy = if predictions.len() > 1 {
        correct_direction as f64 / (predictions.len() - 1) as f64
    } else {
        0.0
    };

    let target_mean = targets.iter().sum::<f64>() / n;
    let ss_res = errors.iter().map(|e| e * e).sum::<f64>();
    let ss_tot = targets.iter().map(|t| (t - target_mean).powi(2)).sum::<f64>();
    let r_squared = if ss_tot != 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    let mut abs_errors: Vec<f64> = errors.iter().map(|e| e.abs()).collect();
    abs_errors.sort_by(|a, b| a.total_cmp(b));
    let max_error = abs_errors.last().cloned().unwrap_or(0.0);
    let mid = abs_errors.len() / 2;
    let median_ae = if abs_errors.len() % 2 == 0 {
        (abs_errors[mid - 1] + abs_errors[mid]) / 2.0
    } else {
        abs_errors[mid]
    };

    Ok(RegressionMetrics {
        mse,
        rmse,
        mae,
        mape,
        directional_accuracy,
        r_squared,
        max_error,
        median_ae,
        n_samples: predictions.len(),
    })
}

/// Scores output `output` of `model` over every case of `set`.
pub fn evaluate_model<M: NetworkModel + ?Sized>(model: &M, set: &TrainingSet, output: usize) -> Result<RegressionMetrics, NeuralError> {
    if output >= model.n_outputs() {
        return Err(NeuralError::Validation(format!(
            "output {} out of range for a model with {} outputs", output, model.n_outputs()
        )));
    }
    let mut predictions = Vec::with_capacity(set.len());
    let mut targets = Vec::with_capacity(set.len());
    for case in set.cases() {
        predictions.push(model.evaluate(&case.input)?[output]);
        targets.push(case.target[output]);
    }
    calculate_regression_metrics(&predictions, &targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::signal::MISSING;
    use approx::assert_relative_eq;

    #[test]
    fn test_perfect_predictions() {
        let t = [1.0, 2.0, 3.0, 2.0];
        let m = calculate_regression_metrics(&t, &t).unwrap();
        assert_eq!(m.mse, 0.0);
        assert_relative_eq!(m.r_squared, 1.0);
        assert_relative_eq!(m.directional_accuracy, 1.0);
    }

    #[test]
    fn test_known_errors() {
        let p = [1.0, 2.0, 5.0, MISSING];
        let t = [2.0, 2.0, 3.0, 4.0];
        let m = calculate_regression_metrics(&p, &t).unwrap();
        assert_eq!(m.n_samples, 3);
        assert_relative_eq!(m.mse, 5.0 / 3.0);
        assert_relative_eq!(m.mae, 1.0);
        assert_relative_eq!(m.max_error, 2.0);
        assert_relative_eq!(m.median_ae, 1.0);
    }

    #[test]
    fn test_rejects_mismatch() {
        assert!(calculate_regression_metrics(&[1.0], &[1.0, 2.0]).is_err());
        assert!(calculate_regression_metrics(&[MISSING], &[1.0]).is_err());
    }
}
