// projeto: npredict
// file: src/neural/predict.rs
// Multi-step prediction of a signal with optional confidence bands

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

use crate::neural::model::NetworkModel;
use crate::neural::signal::{is_missing, Signal};
use crate::neural::utils::NeuralError;

/// Which values feed the input window once the horizon passes known data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedMode {
    /// Use true values wherever the signal has them.
    Actual,
    /// Chain every prediction into the next window.
    Predicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConfidenceMethod {
    /// Quantile of the absolute residuals.
    Empirical,
    Normal,
    StudentT { dist: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSpec {
    pub percent: f64,
    pub method: ConfidenceMethod,
}

impl ConfidenceSpec {
    pub fn validate(&self) -> Result<(), NeuralError> {
        if !(self.percent > 0.0 && self.percent < 100.0) {
            return Err(NeuralError::Validation(format!(
                "confidence percent must lie in (0, 100), got {}", self.percent
            )));
        }
        if let ConfidenceMethod::StudentT { dist } = self.method {
            if !(dist.is_finite() && dist > 0.0) {
                return Err(NeuralError::Validation(format!(
                    "degrees of freedom must be positive, got {}", dist
                )));
            }
        }
        Ok(())
    }

    /// Half-width of the one-step interval for the given residuals.
    pub fn half_width(&self, residuals: &[f64]) -> Result<f64, NeuralError> {
        self.validate()?;
        let usable: Vec<f64> = residuals.iter().cloned()
            .filter(|r| r.is_finite() && !is_missing(*r))
            .collect();
        if usable.len() < 2 {
            return Err(NeuralError::Validation(format!(
                "confidence bands need at least 2 residuals, got {}", usable.len()
            )));
        }
        let p = self.percent / 100.0;

        match self.method {
            ConfidenceMethod::Empirical => {
                let mut abs: Vec<f64> = usable.iter().map(|r| r.abs()).collect();
                abs.sort_by(|a, b| a.total_cmp(b));
                let rank = ((p * abs.len() as f64).ceil() as usize).clamp(1, abs.len());
                Ok(abs[rank - 1])
            }
            ConfidenceMethod::Normal => {
                let z = Normal::new(0.0, 1.0)
                    .map_err(|e| NeuralError::Numerical(e.to_string()))?
                    .inverse_cdf(0.5 + p / 2.0);
                Ok(z * rms(&usable))
            }
            ConfidenceMethod::StudentT { dist } => {
                let t = StudentsT::new(0.0, 1.0, dist)
                    .map_err(|e| NeuralError::Numerical(e.to_string()))?
                    .inverse_cdf(0.5 + p / 2.0);
                Ok(t * rms(&usable))
            }
        }
    }
}

fn rms(values: &[f64]) -> f64 {
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionConfig {
    pub horizon: usize,
    pub feed: FeedMode,
    pub confidence: Option<ConfidenceSpec>,
    /// Residuals to build the bands from; when absent the one-step errors
    /// over the history before `start` are used.
    pub residuals: Option<Vec<f64>>,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        PredictionConfig {
            horizon: 1,
            feed: FeedMode::Predicted,
            confidence: None,
            residuals: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    /// Index in the source signal of the first predicted value.
    pub start: usize,
    pub prediction: Signal,
    pub lower: Option<Signal>,
    pub upper: Option<Signal>,
    pub confidence: Option<f64>,
}

impl PredictionResult {
    /// Maps all output signals back through the modifiers recorded on
    /// `source`.
    pub fn undo_transforms(&mut self, source: &Signal) -> Result<(), NeuralError> {
        source.undo_onto(&mut self.prediction, self.start)?;
        if let Some(lower) = self.lower.as_mut() {
            source.undo_onto(lower, self.start)?;
        }
        if let Some(upper) = self.upper.as_mut() {
            source.undo_onto(upper, self.start)?;
        }
        Ok(())
    }
}

/// Drives an autoregressive model over a signal: the model reads the last
/// `lags` values (most recent first) and returns the next one.
pub struct Predictor<'a, M: NetworkModel + ?Sized> {
    model: &'a M,
    lags: usize,
}

impl<'a, M: NetworkModel + ?Sized> Predictor<'a, M> {
    pub fn new(model: &'a M, lags: usize) -> Result<Self, NeuralError> {
        if lags == 0 || model.n_inputs() != lags || model.n_outputs() != 1 {
            return Err(NeuralError::Validation(format!(
                "model is {}→{}, predictor needs {}→1", model.n_inputs(), model.n_outputs(), lags
            )));
        }
        Ok(Predictor { model, lags })
    }

    pub fn lags(&self) -> usize {
        self.lags
    }

    fn window(&self, values: &[f64], t: usize) -> Vec<f64> {
        (1..=self.lags).map(|k| values[t - k]).collect()
    }

    /// One-step errors `actual - predicted` for every `t` in
    /// `lags..end` whose window and target are all present, plus the number
    /// of indices skipped for missing values.
    pub fn residuals(&self, signal: &Signal, end: usize) -> Result<(Vec<f64>, usize), NeuralError> {
        let values = signal.values();
        let end = end.min(values.len());
        let mut out = Vec::new();
        let mut skipped = 0;
        for t in self.lags..end {
            let window = self.window(values, t);
            if is_missing(values[t]) || window.iter().any(|v| is_missing(*v)) {
                skipped += 1;
                continue;
            }
            let predicted = self.model.evaluate(&window)?[0];
            out.push(values[t] - predicted);
        }
        debug!("Collected {} one-step residuals before index {} ({} skipped)", out.len(), end, skipped);
        Ok((out, skipped))
    }

    /// `config.horizon` successive predictions starting at index `start`.
    pub fn predict(&self, signal: &Signal, start: usize, config: &PredictionConfig) -> Result<PredictionResult, NeuralError> {
        if config.horizon == 0 {
            return Err(NeuralError::Validation("prediction horizon must be at least 1".to_string()));
        }
        if start < self.lags || start > signal.len() {
            return Err(NeuralError::Validation(format!(
                "start index {} must lie in {}..={} for {} lags", start, self.lags, signal.len(), self.lags
            )));
        }
        if let Some(spec) = &config.confidence {
            spec.validate()?;
        }
        let values = signal.values();
        if let Some(i) = (start - self.lags..start).find(|&i| is_missing(values[i])) {
            return Err(NeuralError::Validation(format!(
                "initial window of '{}' has a missing value at index {}", signal.name(), i
            )));
        }

        // feed[i] is the value the model sees at index i; depth[i] counts the
        // chained predictions behind it (0 for observed values).
        let mut feed: Vec<f64> = values[..start].to_vec();
        let mut depth: Vec<usize> = vec![0; start];
        let mut predicted = Vec::with_capacity(config.horizon);
        let mut step_depth = Vec::with_capacity(config.horizon);

        for h in 0..config.horizon {
            let t = start + h;
            let window = self.window(&feed, t);
            let d = 1 + (1..=self.lags).map(|k| depth[t - k]).max().unwrap_or(0);
            let y = self.model.evaluate(&window)?[0];
            predicted.push(y);
            step_depth.push(d);

            let actual = values.get(t).cloned().filter(|v| !is_missing(*v));
            match (config.feed, actual) {
                (FeedMode::Actual, Some(v)) => {
                    feed.push(v);
                    depth.push(0);
                }
                _ => {
                    feed.push(y);
                    depth.push(d);
                }
            }
        }

        let name = signal.name();
        let prediction = Signal::new(format!("{}_pred", name), predicted.clone());
        let mut result = PredictionResult {
            start,
            prediction,
            lower: None,
            upper: None,
            confidence: None,
        };

        if let Some(spec) = &config.confidence {
            let residuals = match &config.residuals {
                Some(r) => r.clone(),
                None => {
                    let (r, skipped) = self.residuals(signal, start)?;
                    if skipped > 0 {
                        warn!("⚠️ {} residual windows of '{}' skipped for missing values", skipped, signal.name());
                    }
                    r
                }
            };
            let base = spec.half_width(&residuals)?;
            let half: Vec<f64> = step_depth.iter().map(|&d| base * (d as f64).sqrt()).collect();
            result.lower = Some(Signal::new(
                format!("{}_lower", name),
                predicted.iter().zip(&half).map(|(p, w)| p - w).collect(),
            ));
            result.upper = Some(Signal::new(
                format!("{}_upper", name),
                predicted.iter().zip(&half).map(|(p, w)| p + w).collect(),
            ));
            result.confidence = Some(spec.percent);
        }

        info!("🔮 Predicted {} values of '{}' from index {}", config.horizon, name, start);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::cases::TrainingSet;
    use crate::neural::model::{ModelKind, ModelState, TrainingSummary};
    use crate::neural::progress::TrainingContext;
    use crate::neural::signal::MISSING;
    use approx::assert_relative_eq;

    /// Predicts `coef * x[t-1]`.
    struct Ar1 {
        coef: f64,
    }

    impl NetworkModel for Ar1 {
        fn kind(&self) -> ModelKind {
            ModelKind::Mlfn
        }
        fn n_inputs(&self) -> usize {
            1
        }
        fn n_outputs(&self) -> usize {
            1
        }
        fn state(&self) -> ModelState {
            ModelState::Trained
        }
        fn train(&mut self, _set: &TrainingSet, _ctx: &TrainingContext) -> Result<TrainingSummary, NeuralError> {
            Err(NeuralError::Validation("fixed model".to_string()))
        }
        fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, NeuralError> {
            Ok(vec![self.coef * input[0]])
        }
    }

    fn noisy() -> Signal {
        Signal::new("x", (0..50).map(|i| 1.0 + 0.1 * ((i * 7 % 11) as f64 - 5.0)).collect())
    }

    #[test]
    fn test_chained_prediction() {
        let model = Ar1 { coef: 0.5 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let signal = Signal::new("x", vec![8.0, 4.0]);
        let config = PredictionConfig { horizon: 3, ..PredictionConfig::default() };
        let result = predictor.predict(&signal, 2, &config).unwrap();
        assert_eq!(result.prediction.values(), &[2.0, 1.0, 0.5]);
        assert!(result.lower.is_none());
    }

    #[test]
    fn test_actual_feed_uses_true_values() {
        let model = Ar1 { coef: 1.0 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let signal = Signal::new("x", vec![1.0, 5.0, 7.0, MISSING]);
        let config = PredictionConfig { horizon: 4, feed: FeedMode::Actual, ..PredictionConfig::default() };
        let result = predictor.predict(&signal, 1, &config).unwrap();
        // t=1 from 1.0, t=2 from actual 5.0, t=3 from actual 7.0, t=4 from the missing slot's prediction
        assert_eq!(result.prediction.values(), &[1.0, 5.0, 7.0, 7.0]);
    }

    #[test]
    fn test_confidence_width_grows_with_percent() {
        let model = Ar1 { coef: 1.0 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let signal = noisy();
        for method in [ConfidenceMethod::Empirical, ConfidenceMethod::Normal, ConfidenceMethod::StudentT { dist: 4.0 }] {
            let mut last = 0.0;
            for percent in [10.0, 50.0, 80.0, 90.0, 95.0, 99.0] {
                let config = PredictionConfig {
                    horizon: 3,
                    confidence: Some(ConfidenceSpec { percent, method }),
                    ..PredictionConfig::default()
                };
                let result = predictor.predict(&signal, 40, &config).unwrap();
                let upper = result.upper.unwrap();
                let width = upper.values()[0] - result.prediction.values()[0];
                assert!(width >= last, "{:?} width {} < {} at {}%", method, width, last, percent);
                last = width;
            }
        }
    }

    #[test]
    fn test_band_widens_with_chain_depth() {
        let model = Ar1 { coef: 1.0 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let config = PredictionConfig {
            horizon: 4,
            confidence: Some(ConfidenceSpec { percent: 90.0, method: ConfidenceMethod::Normal }),
            residuals: Some(vec![1.0, -1.0, 1.0, -1.0]),
            ..PredictionConfig::default()
        };
        let result = predictor.predict(&noisy(), 50, &config).unwrap();
        let lower = result.lower.unwrap();
        let upper = result.upper.unwrap();
        let w0 = upper.values()[0] - lower.values()[0];
        let w3 = upper.values()[3] - lower.values()[3];
        assert_relative_eq!(w3, 2.0 * w0, epsilon = 1e-9);
        assert_eq!(result.confidence, Some(90.0));
    }

    #[test]
    fn test_rejects_bad_requests() {
        let model = Ar1 { coef: 1.0 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let signal = noisy();
        for percent in [0.0, 100.0, -5.0, 150.0, f64::NAN] {
            let config = PredictionConfig {
                confidence: Some(ConfidenceSpec { percent, method: ConfidenceMethod::Empirical }),
                ..PredictionConfig::default()
            };
            assert!(matches!(predictor.predict(&signal, 10, &config), Err(NeuralError::Validation(_))));
        }
        let bad_dist = PredictionConfig {
            confidence: Some(ConfidenceSpec { percent: 90.0, method: ConfidenceMethod::StudentT { dist: 0.0 } }),
            ..PredictionConfig::default()
        };
        assert!(predictor.predict(&signal, 10, &bad_dist).is_err());
        let zero = PredictionConfig { horizon: 0, ..PredictionConfig::default() };
        assert!(predictor.predict(&signal, 10, &zero).is_err());
        assert!(predictor.predict(&signal, 0, &PredictionConfig::default()).is_err());
        assert!(Predictor::new(&model, 2).is_err());
    }

    #[test]
    fn test_missing_in_start_window_rejected() {
        let model = Ar1 { coef: 1.0 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let signal = Signal::new("x", vec![1.0, MISSING, 3.0]);
        assert!(predictor.predict(&signal, 2, &PredictionConfig::default()).is_err());
        assert!(predictor.predict(&signal, 3, &PredictionConfig::default()).is_ok());
    }

    #[test]
    fn test_undo_maps_back_to_original_scale() {
        let model = Ar1 { coef: 1.0 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let mut signal = Signal::new("x", vec![2.0, 4.0, 6.0]);
        signal.center().unwrap();
        let mut result = predictor.predict(&signal, 3, &PredictionConfig::default()).unwrap();
        result.undo_transforms(&signal).unwrap();
        assert_relative_eq!(result.prediction.values()[0], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_residuals_count_skipped_windows() {
        let model = Ar1 { coef: 0.5 };
        let predictor = Predictor::new(&model, 1).unwrap();
        let signal = Signal::new("s", vec![2.0, 1.0, MISSING, 4.0, 2.0, 1.0]);
        let (residuals, skipped) = predictor.residuals(&signal, 6).unwrap();
        assert_eq!(skipped, 2);
        assert_eq!(residuals, vec![0.0, 0.0, 0.0]);
    }
}
