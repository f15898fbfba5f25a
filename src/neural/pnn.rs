// projeto: npredict
// file: src/neural/pnn.rs
// Probabilistic (kernel density) network for regression and classification

use std::time::Instant;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::neural::cases::{TrainingCase, TrainingSet};
use crate::neural::model::{ModelState, TrainingSummary};
use crate::neural::optim::TrainingStatus;
use crate::neural::progress::TrainingContext;
use crate::neural::signal::is_missing;
use crate::neural::utils::{sq_distance, validate_finite, NeuralError};

const GOLDEN_ITERS: usize = 25;
const INV_PHI: f64 = 0.618_033_988_749_895;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kernel {
    /// `exp(-d²/σ²)`
    Gaussian,
    /// `1 / (1 + d²/σ²)`
    Reciprocal,
}

impl Kernel {
    #[inline]
    pub fn weight(&self, d2: f64, sigma: f64) -> f64 {
        let z = d2 / (sigma * sigma);
        match self {
            Kernel::Gaussian => (-z).exp(),
            Kernel::Reciprocal => 1.0 / (1.0 + z),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PnnMode {
    Regression,
    /// One output per class; a case's class is the argmax of its target.
    Classification { n_classes: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnnConfig {
    pub kernel: Kernel,
    pub sigma: f64,
    pub mode: PnnMode,
    pub optimize_sigma: bool,
    pub sigma_range: (f64, f64),
    pub grid_points: usize,
}

impl Default for PnnConfig {
    fn default() -> Self {
        PnnConfig {
            kernel: Kernel::Gaussian,
            sigma: 0.5,
            mode: PnnMode::Regression,
            optimize_sigma: false,
            sigma_range: (0.01, 10.0),
            grid_points: 12,
        }
    }
}

impl PnnConfig {
    pub fn validate(&self) -> Result<(), NeuralError> {
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(NeuralError::Validation(format!("sigma must be positive, got {}", self.sigma)));
        }
        let (lo, hi) = self.sigma_range;
        if !(lo > 0.0 && hi > lo && hi.is_finite()) {
            return Err(NeuralError::Validation(format!("invalid sigma range ({}, {})", lo, hi)));
        }
        if self.grid_points < 3 {
            return Err(NeuralError::Validation("sigma search needs at least 3 grid points".to_string()));
        }
        if let PnnMode::Classification { n_classes } = self.mode {
            if n_classes < 2 {
                return Err(NeuralError::Validation(format!("classification needs at least 2 classes, got {}", n_classes)));
            }
        }
        Ok(())
    }
}

/// Kernel network that retains every training case.
///
/// `evaluate` visits all retained cases, so its cost grows linearly with the
/// training set size times the input width. Nothing is cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pnn {
    n_inputs: usize,
    n_outputs: usize,
    config: PnnConfig,
    sigma: f64,
    cases: Vec<TrainingCase>,
    classes: Vec<usize>,
    class_counts: Vec<usize>,
    state: ModelState,
    summary: Option<TrainingSummary>,
}

fn argmax(values: &[f64]) -> usize {
    values.iter().enumerate()
        .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
        .0
}

impl Pnn {
    pub fn new(n_inputs: usize, n_outputs: usize, config: PnnConfig) -> Result<Self, NeuralError> {
        if n_inputs == 0 || n_outputs == 0 {
            return Err(NeuralError::Validation(format!(
                "PNN needs at least one input and one output, got {}→{}", n_inputs, n_outputs
            )));
        }
        config.validate()?;
        if let PnnMode::Classification { n_classes } = config.mode {
            if n_classes != n_outputs {
                return Err(NeuralError::Validation(format!(
                    "classification with {} classes needs {} outputs, got {}", n_classes, n_classes, n_outputs
                )));
            }
        }
        Ok(Pnn {
            n_inputs,
            n_outputs,
            sigma: config.sigma,
            config,
            cases: Vec::new(),
            classes: Vec::new(),
            class_counts: Vec::new(),
            state: ModelState::Untrained,
            summary: None,
        })
    }

    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    pub fn config(&self) -> &PnnConfig {
        &self.config
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn retained(&self) -> usize {
        self.cases.len()
    }

    pub fn last_summary(&self) -> Option<&TrainingSummary> {
        self.summary.as_ref()
    }

    /// Checks a network built outside `new`, such as one read from a file:
    /// the config, the retained cases and the class tallies must agree.
    pub fn validate(&self) -> Result<(), NeuralError> {
        if self.n_inputs == 0 || self.n_outputs == 0 {
            return Err(NeuralError::Validation(format!(
                "PNN needs at least one input and one output, got {}→{}", self.n_inputs, self.n_outputs
            )));
        }
        self.config.validate()?;
        if let PnnMode::Classification { n_classes } = self.config.mode {
            if n_classes != self.n_outputs {
                return Err(NeuralError::Validation(format!(
                    "classification with {} classes needs {} outputs, got {}", n_classes, n_classes, self.n_outputs
                )));
            }
        }
        if !(self.sigma.is_finite() && self.sigma > 0.0) {
            return Err(NeuralError::Validation(format!("sigma must be positive, got {}", self.sigma)));
        }
        if self.state == ModelState::Trained && self.cases.is_empty() {
            return Err(NeuralError::Validation("trained PNN retains no cases".to_string()));
        }
        for (i, case) in self.cases.iter().enumerate() {
            if case.input.len() != self.n_inputs || case.target.len() != self.n_outputs {
                return Err(NeuralError::Validation(format!(
                    "retained case {} is {}→{}, network is {}→{}",
                    i, case.input.len(), case.target.len(), self.n_inputs, self.n_outputs
                )));
            }
            validate_finite(&case.input, &format!("case {} input", i))?;
            validate_finite(&case.target, &format!("case {} target", i))?;
        }
        if self.classes.len() != self.cases.len() {
            return Err(NeuralError::Validation(format!(
                "{} class indices for {} retained cases", self.classes.len(), self.cases.len()
            )));
        }
        if !self.cases.is_empty() || !self.class_counts.is_empty() {
            let mut counts = vec![0usize; self.n_outputs];
            for &c in &self.classes {
                let slot = counts.get_mut(c).ok_or_else(|| NeuralError::Validation(format!(
                    "class index {} out of range for {} outputs", c, self.n_outputs
                )))?;
                *slot += 1;
            }
            if counts != self.class_counts {
                return Err(NeuralError::Validation(format!(
                    "class counts {:?} do not match retained cases {:?}", self.class_counts, counts
                )));
            }
        }
        Ok(())
    }

    /// Retains the cases and, when configured, picks sigma by minimising the
    /// leave-one-out error.
    pub fn train(&mut self, set: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingSummary, NeuralError> {
        if set.n_inputs() != self.n_inputs || set.n_outputs() != self.n_outputs {
            return Err(NeuralError::Validation(format!(
                "training set is {}→{} but the network is {}→{}",
                set.n_inputs(), set.n_outputs(), self.n_inputs, self.n_outputs
            )));
        }
        if set.is_empty() {
            return Err(NeuralError::Validation(format!(
                "no usable training cases ({} skipped for missing values)", set.skipped()
            )));
        }
        for (i, case) in set.cases().iter().enumerate() {
            validate_finite(&case.input, &format!("case {} input", i))?;
            validate_finite(&case.target, &format!("case {} target", i))?;
        }

        let start = Instant::now();
        self.state = ModelState::Training;
        self.cases = set.cases().to_vec();
        self.classes = self.cases.iter().map(|c| argmax(&c.target)).collect();
        self.class_counts = vec![0; self.n_outputs];
        for &c in &self.classes {
            self.class_counts[c] += 1;
        }

        let mut evaluations = 0;
        let mut status = TrainingStatus::Converged;
        if self.config.optimize_sigma && self.cases.len() > 1 {
            let (sigma, evals, cancelled) = self.optimise_sigma(ctx);
            self.sigma = sigma;
            evaluations = evals;
            if cancelled {
                status = TrainingStatus::Cancelled;
            }
        }
        let final_error = if self.cases.len() > 1 { self.loo_error(self.sigma) } else { 0.0 };
        self.state = ModelState::Trained;

        let summary = TrainingSummary {
            iterations: evaluations,
            final_error,
            status,
            skipped_cases: set.skipped(),
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        info!("✅ PNN retained {} cases, sigma {:.6}, leave-one-out error {:.8}",
              self.cases.len(), self.sigma, final_error);
        ctx.report(&format!("PNN sigma {:.6}, error {:.8}", self.sigma, final_error));
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    /// Coarse grid over log sigma, then golden-section refinement around the
    /// best grid point. Returns the sigma, the number of evaluations and
    /// whether the search was cancelled.
    fn optimise_sigma(&self, ctx: &TrainingContext) -> (f64, usize, bool) {
        let (lo, hi) = self.config.sigma_range;
        let (llo, lhi) = (lo.ln(), hi.ln());
        let n = self.config.grid_points;
        let step = (lhi - llo) / (n - 1) as f64;

        let mut evals = 0;
        let mut best = (self.sigma.ln(), f64::INFINITY);
        let mut best_i = 0;
        for i in 0..n {
            if ctx.is_cancelled() {
                return (best.0.exp(), evals, true);
            }
            let ls = llo + step * i as f64;
            let err = self.loo_error(ls.exp());
            evals += 1;
            debug!("sigma {:.6}: leave-one-out error {:.8}", ls.exp(), err);
            if err < best.1 {
                best = (ls, err);
                best_i = i;
            }
        }
        ctx.report(&format!("Sigma grid minimum {:.6} (error {:.8})", best.0.exp(), best.1));

        let mut a = llo + step * best_i.saturating_sub(1) as f64;
        let mut b = llo + step * (best_i + 1).min(n - 1) as f64;
        let mut c = b - INV_PHI * (b - a);
        let mut d = a + INV_PHI * (b - a);
        let mut fc = self.loo_error(c.exp());
        let mut fd = self.loo_error(d.exp());
        evals += 2;
        for _ in 0..GOLDEN_ITERS {
            if ctx.is_cancelled() {
                return (best.0.exp(), evals, true);
            }
            if fc < fd {
                b = d;
                d = c;
                fd = fc;
                c = b - INV_PHI * (b - a);
                fc = self.loo_error(c.exp());
            } else {
                a = c;
                c = d;
                fc = fd;
                d = a + INV_PHI * (b - a);
                fd = self.loo_error(d.exp());
            }
            evals += 1;
        }
        for (x, fx) in [(c, fc), (d, fd)] {
            if fx < best.1 {
                best = (x, fx);
            }
        }
        (best.0.exp(), evals, false)
    }

    /// Mean squared leave-one-out error at `sigma`.
    fn loo_error(&self, sigma: f64) -> f64 {
        let n = self.cases.len();
        let mut total = 0.0;
        for i in 0..n {
            let out = self.kernel_output(&self.cases[i].input, Some(i), sigma);
            total += out.iter().zip(&self.cases[i].target).map(|(o, t)| (o - t) * (o - t)).sum::<f64>();
        }
        total / (n * self.n_outputs) as f64
    }

    fn kernel_output(&self, query: &[f64], exclude: Option<usize>, sigma: f64) -> Vec<f64> {
        let distances: Vec<(usize, f64)> = self.cases.iter().enumerate()
            .filter(|(i, _)| Some(*i) != exclude)
            .map(|(i, c)| (i, sq_distance(self.n_inputs, query, &c.input)))
            .collect();
        let (nearest, d_min) = distances.iter().cloned()
            .fold((usize::MAX, f64::INFINITY), |acc, (i, d)| if d < acc.1 { (i, d) } else { acc });

        // Gaussian weights are scaled by exp(d_min/σ²) so the nearest case
        // has weight one; the normalised result is unchanged.
        let weight = |d2: f64| match self.config.kernel {
            Kernel::Gaussian => self.config.kernel.weight(d2 - d_min, sigma),
            Kernel::Reciprocal => self.config.kernel.weight(d2, sigma),
        };

        let mut out = vec![0.0; self.n_outputs];
        let mut total = 0.0;
        match self.config.mode {
            PnnMode::Regression => {
                for &(i, d2) in &distances {
                    let w = weight(d2);
                    total += w;
                    for (o, t) in out.iter_mut().zip(&self.cases[i].target) {
                        *o += w * t;
                    }
                }
                if total > 0.0 && total.is_finite() {
                    out.iter_mut().for_each(|o| *o /= total);
                } else if nearest != usize::MAX {
                    out.copy_from_slice(&self.cases[nearest].target);
                }
            }
            PnnMode::Classification { .. } => {
                for &(i, d2) in &distances {
                    out[self.classes[i]] += weight(d2);
                }
                for (c, o) in out.iter_mut().enumerate() {
                    let count = self.class_counts[c] - usize::from(exclude.map(|e| self.classes[e] == c).unwrap_or(false));
                    *o = if count > 0 { *o / count as f64 } else { 0.0 };
                    total += *o;
                }
                if total > 0.0 && total.is_finite() {
                    out.iter_mut().for_each(|o| *o /= total);
                } else if nearest != usize::MAX {
                    out.iter_mut().for_each(|o| *o = 0.0);
                    out[self.classes[nearest]] = 1.0;
                }
            }
        }
        out
    }

    pub fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, NeuralError> {
        if self.state == ModelState::Untrained {
            return Err(NeuralError::Validation("PNN has not been trained".to_string()));
        }
        if input.len() != self.n_inputs {
            return Err(NeuralError::Validation(format!(
                "input has {} values, network expects {}", input.len(), self.n_inputs
            )));
        }
        if let Some(i) = input.iter().position(|v| is_missing(*v)) {
            return Err(NeuralError::Validation(format!("input value {} is missing", i)));
        }
        Ok(self.kernel_output(input, None, self.sigma))
    }

    /// Index of the winning class for classification networks.
    pub fn classify(&self, input: &[f64]) -> Result<usize, NeuralError> {
        match self.config.mode {
            PnnMode::Classification { .. } => Ok(argmax(&self.evaluate(input)?)),
            PnnMode::Regression => Err(NeuralError::Validation(
                "classify called on a regression PNN".to_string(),
            )),
        }
    }
}
