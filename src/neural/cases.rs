// projeto: npredict
// file: src/neural/cases.rs
// Supervised training cases cut from lagged signal windows

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::neural::signal::{is_missing, Signal};
use crate::neural::utils::NeuralError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingCase {
    pub input: Vec<f64>,
    pub target: Vec<f64>,
}

impl TrainingCase {
    pub fn has_missing(&self) -> bool {
        self.input.iter().chain(self.target.iter()).any(|v| is_missing(*v))
    }
}

/// Fixed-width cases plus a count of the windows that were dropped because
/// they contained missing values.
#[derive(Debug, Clone, Default)]
pub struct TrainingSet {
    cases: Vec<TrainingCase>,
    n_inputs: usize,
    n_outputs: usize,
    skipped: usize,
}

impl TrainingSet {
    pub fn new(n_inputs: usize, n_outputs: usize) -> Self {
        TrainingSet {
            cases: Vec::new(),
            n_inputs,
            n_outputs,
            skipped: 0,
        }
    }

    /// Add a case. Returns `Ok(false)` when it was skipped for holding a
    /// missing value.
    pub fn push(&mut self, input: Vec<f64>, target: Vec<f64>) -> Result<bool, NeuralError> {
        if input.len() != self.n_inputs || target.len() != self.n_outputs {
            return Err(NeuralError::Validation(format!(
                "case shape {}→{} does not match training set {}→{}",
                input.len(), target.len(), self.n_inputs, self.n_outputs
            )));
        }
        let case = TrainingCase { input, target };
        if case.has_missing() {
            self.skipped += 1;
            return Ok(false);
        }
        self.cases.push(case);
        Ok(true)
    }

    pub fn cases(&self) -> &[TrainingCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Split into a leading training part and a trailing holdout part.
    pub fn split(&self, train_fraction: f64) -> Result<(TrainingSet, TrainingSet), NeuralError> {
        if !(train_fraction > 0.0 && train_fraction < 1.0) {
            return Err(NeuralError::Validation(format!(
                "train fraction must lie in (0, 1), got {}", train_fraction
            )));
        }
        let cut = ((self.cases.len() as f64) * train_fraction).round() as usize;
        let mut head = TrainingSet::new(self.n_inputs, self.n_outputs);
        let mut tail = TrainingSet::new(self.n_inputs, self.n_outputs);
        head.cases = self.cases[..cut].to_vec();
        tail.cases = self.cases[cut..].to_vec();
        head.skipped = self.skipped;
        Ok((head, tail))
    }
}

#[derive(Debug, Clone, Copy)]
struct LagInput<'a> {
    signal: &'a Signal,
    min_lag: usize,
    max_lag: usize,
}

/// Builds cases whose inputs are lagged values of one or more signals and
/// whose targets are the current values of the output signals.
///
/// Inputs for one signal are ordered from the smallest lag to the largest,
/// so an autoregressive window reads `x[t-1], x[t-2], ...`.
#[derive(Debug, Default)]
pub struct CaseBuilder<'a> {
    inputs: Vec<LagInput<'a>>,
    outputs: Vec<&'a Signal>,
}

impl<'a> CaseBuilder<'a> {
    pub fn new() -> Self {
        CaseBuilder {
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, signal: &'a Signal, min_lag: usize, max_lag: usize) -> Self {
        self.inputs.push(LagInput { signal, min_lag, max_lag });
        self
    }

    pub fn output(mut self, signal: &'a Signal) -> Self {
        self.outputs.push(signal);
        self
    }

    pub fn n_inputs(&self) -> usize {
        self.inputs.iter().map(|i| i.max_lag + 1 - i.min_lag).sum()
    }

    pub fn build(&self) -> Result<TrainingSet, NeuralError> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(NeuralError::Validation(
                "case builder needs at least one input and one output signal".to_string(),
            ));
        }
        for spec in &self.inputs {
            if spec.min_lag > spec.max_lag {
                return Err(NeuralError::Validation(format!(
                    "lag range {}..={} for '{}' is empty",
                    spec.min_lag, spec.max_lag, spec.signal.name()
                )));
            }
        }

        let first = self.inputs.iter().map(|i| i.max_lag).max().unwrap_or(0);
        let end = self.inputs.iter().map(|i| i.signal.len())
            .chain(self.outputs.iter().map(|s| s.len()))
            .min()
            .unwrap_or(0);
        if end <= first {
            return Err(NeuralError::Validation(format!(
                "signals of length {} are too short for a maximum lag of {}", end, first
            )));
        }

        let mut set = TrainingSet::new(self.n_inputs(), self.outputs.len());
        for t in first..end {
            let mut input = Vec::with_capacity(set.n_inputs());
            for spec in &self.inputs {
                let values = spec.signal.values();
                input.extend((spec.min_lag..=spec.max_lag).map(|lag| values[t - lag]));
            }
            let target = self.outputs.iter().map(|s| s.values()[t]).collect();
            set.push(input, target)?;
        }

        if set.skipped() > 0 {
            warn!("⚠️ Skipped {} windows containing missing values", set.skipped());
        }
        debug!("Built {} cases ({} inputs, {} outputs)", set.len(), set.n_inputs(), set.n_outputs());
        Ok(set)
    }
}

/// Cases predicting `signal[t]` from `signal[t-1] ..= signal[t-lags]`.
pub fn autoregressive_cases(signal: &Signal, lags: usize) -> Result<TrainingSet, NeuralError> {
    if lags == 0 {
        return Err(NeuralError::Validation("autoregressive window needs at least one lag".to_string()));
    }
    CaseBuilder::new().input(signal, 1, lags).output(signal).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::signal::MISSING;

    #[test]
    fn test_autoregressive_windows() {
        let s = Signal::new("x", vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        let set = autoregressive_cases(&s, 2).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.cases()[0].input, vec![2.0, 1.0]);
        assert_eq!(set.cases()[0].target, vec![3.0]);
        assert_eq!(set.cases()[2].input, vec![4.0, 3.0]);
    }

    #[test]
    fn test_missing_windows_are_counted() {
        let s = Signal::new("x", vec![1.0, 2.0, MISSING, 4.0, 5.0, 6.0]);
        let set = autoregressive_cases(&s, 1).unwrap();
        // windows touching index 2 are dropped: (2->M) and (M->4)
        assert_eq!(set.skipped(), 2);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_multi_signal_builder() {
        let a = Signal::new("a", vec![1.0, 2.0, 3.0, 4.0]);
        let b = Signal::new("b", vec![10.0, 20.0, 30.0, 40.0]);
        let set = CaseBuilder::new()
            .input(&a, 1, 2)
            .input(&b, 0, 0)
            .output(&a)
            .build()
            .unwrap();
        assert_eq!(set.n_inputs(), 3);
        assert_eq!(set.cases()[0].input, vec![2.0, 1.0, 30.0]);
        assert_eq!(set.cases()[0].target, vec![3.0]);
    }

    #[test]
    fn test_builder_rejects_short_signals() {
        let s = Signal::new("x", vec![1.0, 2.0]);
        assert!(autoregressive_cases(&s, 2).is_err());
        assert!(autoregressive_cases(&s, 0).is_err());
    }

    #[test]
    fn test_push_rejects_wrong_shape() {
        let mut set = TrainingSet::new(2, 1);
        assert!(set.push(vec![1.0], vec![1.0]).is_err());
        assert!(set.push(vec![1.0, 2.0], vec![3.0]).unwrap());
    }

    #[test]
    fn test_split() {
        let s = Signal::new("x", (0..11).map(|i| i as f64).collect());
        let set = autoregressive_cases(&s, 1).unwrap();
        let (train, hold) = set.split(0.8).unwrap();
        assert_eq!(train.len() + hold.len(), set.len());
        assert_eq!(train.len(), 8);
        assert!(set.split(1.0).is_err());
    }
}
