// projeto: npredict
// file: src/neural/mlfn.rs
// Multi-layer feed-forward network trained by conjugate gradient

use std::time::Instant;

use log::{debug, info};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::neural::cases::{TrainingCase, TrainingSet};
use crate::neural::model::{ModelState, TrainingSummary};
use crate::neural::optim::{conjugate_gradient, Objective, OptimConfig};
use crate::neural::progress::TrainingContext;
use crate::neural::signal::is_missing;
use crate::neural::utils::{dot, least_squares, validate_finite, Activation, NeuralError};

/// Cases per parallel gradient chunk. Chunk sums are added in chunk order so
/// the result does not depend on thread scheduling.
const GRADIENT_CHUNK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    Linear,
    Activated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlfnConfig {
    /// Widths of the hidden layers; at most two.
    pub hidden: Vec<usize>,
    pub output: OutputMode,
    pub activation: Activation,
    pub init_tries: usize,
    pub seed: u64,
    pub optim: OptimConfig,
}

impl Default for MlfnConfig {
    fn default() -> Self {
        MlfnConfig {
            hidden: vec![4],
            output: OutputMode::Linear,
            activation: Activation::default(),
            init_tries: 5,
            seed: 42,
            optim: OptimConfig::default(),
        }
    }
}

impl MlfnConfig {
    pub fn validate(&self) -> Result<(), NeuralError> {
        if self.hidden.len() > 2 {
            return Err(NeuralError::Validation(format!(
                "MLFN supports 0, 1 or 2 hidden layers, got {}", self.hidden.len()
            )));
        }
        if self.hidden.iter().any(|&h| h == 0) {
            return Err(NeuralError::Validation("hidden layer width must be positive".to_string()));
        }
        if self.init_tries == 0 {
            return Err(NeuralError::Validation("init_tries must be at least 1".to_string()));
        }
        if !(self.optim.tolerance >= 0.0) {
            return Err(NeuralError::Validation(format!(
                "tolerance must be non-negative, got {}", self.optim.tolerance
            )));
        }
        Activation::new(self.activation.scale, self.activation.clamp)?;
        Ok(())
    }
}

/// Feed-forward network with 0, 1 or 2 hidden layers.
///
/// Each layer is stored as an `(n_out, n_in + 1)` matrix with the bias in the
/// last column. Hidden layers always use the activation; the output layer is
/// linear or activated according to `OutputMode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mlfn {
    n_inputs: usize,
    n_outputs: usize,
    config: MlfnConfig,
    layers: Vec<Array2<f64>>,
    state: ModelState,
    summary: Option<TrainingSummary>,
}

fn layer_shapes(n_inputs: usize, hidden: &[usize], n_outputs: usize) -> Vec<(usize, usize)> {
    let mut sizes = Vec::with_capacity(hidden.len() + 2);
    sizes.push(n_inputs);
    sizes.extend_from_slice(hidden);
    sizes.push(n_outputs);
    sizes.windows(2).map(|w| (w[1], w[0] + 1)).collect()
}

fn layer_forward(w: &[f64], n_in: usize, input: &[f64], out: &mut Vec<f64>, act: Option<&Activation>) {
    out.clear();
    for row in w.chunks_exact(n_in + 1) {
        let net = dot(n_in, row, input) + row[n_in];
        out.push(match act {
            Some(a) => a.activate(net),
            None => net,
        });
    }
}

impl Mlfn {
    pub fn new(n_inputs: usize, n_outputs: usize, config: MlfnConfig) -> Result<Self, NeuralError> {
        if n_inputs == 0 || n_outputs == 0 {
            return Err(NeuralError::Validation(format!(
                "MLFN needs at least one input and one output, got {}→{}", n_inputs, n_outputs
            )));
        }
        config.validate()?;
        let layers = layer_shapes(n_inputs, &config.hidden, n_outputs)
            .into_iter()
            .map(|shape| Array2::zeros(shape))
            .collect();
        Ok(Mlfn {
            n_inputs,
            n_outputs,
            config,
            layers,
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

    pub fn config(&self) -> &MlfnConfig {
        &self.config
    }

    pub fn state(&self) -> ModelState {
        self.state
    }

    pub fn layers(&self) -> &[Array2<f64>] {
        &self.layers
    }

    pub fn last_summary(&self) -> Option<&TrainingSummary> {
        self.summary.as_ref()
    }

    pub fn n_params(&self) -> usize {
        self.layers.iter().map(|w| w.len()).sum()
    }

    fn shapes(&self) -> Vec<(usize, usize)> {
        layer_shapes(self.n_inputs, &self.config.hidden, self.n_outputs)
    }

    /// Checks a network built outside `new`, such as one read from a file:
    /// the config must be valid and every weight matrix must have the shape
    /// implied by the layer sizes.
    pub fn validate(&self) -> Result<(), NeuralError> {
        if self.n_inputs == 0 || self.n_outputs == 0 {
            return Err(NeuralError::Validation(format!(
                "MLFN needs at least one input and one output, got {}→{}", self.n_inputs, self.n_outputs
            )));
        }
        self.config.validate()?;
        let shapes = self.shapes();
        if self.layers.len() != shapes.len() {
            return Err(NeuralError::Validation(format!(
                "MLFN has {} weight layers, expected {}", self.layers.len(), shapes.len()
            )));
        }
        for (i, (w, &(rows, cols))) in self.layers.iter().zip(&shapes).enumerate() {
            if w.dim() != (rows, cols) {
                return Err(NeuralError::Validation(format!(
                    "layer {} has shape {:?}, expected ({}, {})", i, w.dim(), rows, cols
                )));
            }
            if w.iter().any(|v| !v.is_finite()) {
                return Err(NeuralError::Validation(format!("layer {} has non-finite weights", i)));
            }
        }
        Ok(())
    }

    fn flatten(&self) -> Vec<f64> {
        self.layers.iter().flat_map(|w| w.iter().cloned()).collect()
    }

    fn unflatten(shapes: &[(usize, usize)], params: &[f64]) -> Result<Vec<Array2<f64>>, NeuralError> {
        let mut layers = Vec::with_capacity(shapes.len());
        let mut off = 0;
        for &(rows, cols) in shapes {
            let w = Array2::from_shape_vec((rows, cols), params[off..off + rows * cols].to_vec())
                .map_err(|e| NeuralError::Numerical(format!("weight shape error: {}", e)))?;
            layers.push(w);
            off += rows * cols;
        }
        Ok(layers)
    }

    /// Trains against `set`, continuing from the current weights when the
    /// network has been trained before.
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
        let shapes = self.shapes();
        let objective = MlfnObjective::new(&shapes, self.config.activation, self.config.output, set.cases());

        let initial = match self.state {
            ModelState::Trained => {
                ctx.report("Continuing from current weights");
                self.flatten()
            }
            _ => self.initial_weights(&objective, set, ctx)?,
        };

        self.state = ModelState::Training;
        info!("🚀 Training MLFN {:?} on {} cases ({} parameters)",
              shapes, set.len(), objective.n_params);
        let outcome = conjugate_gradient(&objective, initial, &self.config.optim, ctx);

        self.layers = Self::unflatten(&shapes, &outcome.params)?;
        self.state = ModelState::Trained;

        let summary = TrainingSummary {
            iterations: outcome.iterations,
            final_error: outcome.error,
            status: outcome.status,
            skipped_cases: set.skipped(),
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        info!("✅ MLFN training finished: {:?} after {} iterations, error {:.8}",
              summary.status, summary.iterations, summary.final_error);
        ctx.report(&format!("Training finished: {:?}, error {:.8}", summary.status, summary.final_error));
        self.summary = Some(summary.clone());
        Ok(summary)
    }

    /// Random hidden weights, output weights by least squares; the best of
    /// `init_tries` draws is returned.
    fn initial_weights(
        &self,
        objective: &MlfnObjective,
        set: &TrainingSet,
        ctx: &TrainingContext,
    ) -> Result<Vec<f64>, NeuralError> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let shapes = objective.shapes;
        let n_layers = shapes.len();
        let mut best: Option<(Vec<f64>, f64)> = None;

        for attempt in 0..self.config.init_tries {
            let mut params = vec![0.0; objective.n_params];
            for k in 0..n_layers - 1 {
                let (rows, cols) = shapes[k];
                let normal = Normal::new(0.0, 1.0 / (cols as f64).sqrt())
                    .map_err(|e| NeuralError::Numerical(e.to_string()))?;
                let off = objective.offsets[k];
                for p in &mut params[off..off + rows * cols] {
                    *p = normal.sample(&mut rng);
                }
            }

            self.solve_output_layer(objective, set, &mut params)?;
            let err = objective.error(&params);
            debug!("Init attempt {}: error {:.8}", attempt + 1, err);
            if best.as_ref().map(|(_, e)| err < *e).unwrap_or(true) {
                best = Some((params, err));
            }
        }

        let (params, err) = best.ok_or_else(|| NeuralError::Numerical("no initial weights".to_string()))?;
        ctx.report(&format!("Initial error {:.8}", err));
        Ok(params)
    }

    fn solve_output_layer(
        &self,
        objective: &MlfnObjective,
        set: &TrainingSet,
        params: &mut [f64],
    ) -> Result<(), NeuralError> {
        let shapes = objective.shapes;
        let last = shapes.len() - 1;
        let (n_out, cols) = shapes[last];
        let n_cases = set.len();

        let mut design = Vec::with_capacity(n_cases * cols);
        let mut acts = objective.activation_buffers();
        for case in set.cases() {
            objective.forward(params, &case.input, &mut acts);
            let feature: &[f64] = if last == 0 { &case.input } else { &acts[last - 1] };
            design.extend_from_slice(feature);
            design.push(1.0);
        }

        let off = objective.offsets[last];
        for o in 0..n_out {
            let rhs: Vec<f64> = set.cases().iter()
                .map(|c| match self.config.output {
                    OutputMode::Linear => c.target[o],
                    OutputMode::Activated => self.config.activation.inverse(c.target[o]),
                })
                .collect();
            let solution = least_squares(n_cases, cols, &design, &rhs)?;
            params[off + o * cols..off + (o + 1) * cols].copy_from_slice(&solution);
        }
        Ok(())
    }

    /// One forward pass.
    pub fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, NeuralError> {
        if self.state == ModelState::Untrained {
            return Err(NeuralError::Validation("MLFN has not been trained".to_string()));
        }
        if input.len() != self.n_inputs {
            return Err(NeuralError::Validation(format!(
                "input has {} values, network expects {}", input.len(), self.n_inputs
            )));
        }
        if let Some(i) = input.iter().position(|v| is_missing(*v)) {
            return Err(NeuralError::Validation(format!("input value {} is missing", i)));
        }

        let n_layers = self.layers.len();
        let mut current = input.to_vec();
        let mut next = Vec::new();
        for (k, w) in self.layers.iter().enumerate() {
            let flat = w.as_slice()
                .ok_or_else(|| NeuralError::Numerical("weight matrix is not contiguous".to_string()))?;
            let act = if k + 1 == n_layers && self.config.output == OutputMode::Linear {
                None
            } else {
                Some(&self.config.activation)
            };
            layer_forward(flat, w.ncols() - 1, &current, &mut next, act);
            std::mem::swap(&mut current, &mut next);
        }
        Ok(current)
    }
}

/// Mean squared error over a training set as a function of the flat weights.
struct MlfnObjective<'a> {
    shapes: &'a [(usize, usize)],
    offsets: Vec<usize>,
    n_params: usize,
    activation: Activation,
    output: OutputMode,
    cases: &'a [TrainingCase],
}

impl<'a> MlfnObjective<'a> {
    fn new(
        shapes: &'a [(usize, usize)],
        activation: Activation,
        output: OutputMode,
        cases: &'a [TrainingCase],
    ) -> Self {
        let mut offsets = Vec::with_capacity(shapes.len());
        let mut n_params = 0;
        for &(rows, cols) in shapes {
            offsets.push(n_params);
            n_params += rows * cols;
        }
        MlfnObjective { shapes, offsets, n_params, activation, output, cases }
    }

    fn activation_buffers(&self) -> Vec<Vec<f64>> {
        self.shapes.iter().map(|&(n, _)| Vec::with_capacity(n)).collect()
    }

    fn output_activated(&self) -> bool {
        self.output == OutputMode::Activated
    }

    fn forward(&self, params: &[f64], input: &[f64], acts: &mut [Vec<f64>]) {
        let n_layers = self.shapes.len();
        for (k, &(rows, cols)) in self.shapes.iter().enumerate() {
            let off = self.offsets[k];
            let w = &params[off..off + rows * cols];
            let act = if k + 1 == n_layers && !self.output_activated() {
                None
            } else {
                Some(&self.activation)
            };
            let (before, rest) = acts.split_at_mut(k);
            let prev: &[f64] = if k == 0 { input } else { &before[k - 1] };
            layer_forward(w, cols - 1, prev, &mut rest[0], act);
        }
    }

    fn normaliser(&self) -> f64 {
        let n_out = self.shapes.last().map(|s| s.0).unwrap_or(1);
        1.0 / (self.cases.len() * n_out) as f64
    }

    fn chunk_error(&self, params: &[f64], cases: &[TrainingCase]) -> f64 {
        let mut acts = self.activation_buffers();
        let last = self.shapes.len() - 1;
        let mut err = 0.0;
        for case in cases {
            self.forward(params, &case.input, &mut acts);
            err += acts[last].iter().zip(&case.target).map(|(o, t)| (o - t) * (o - t)).sum::<f64>();
        }
        err
    }

    /// Summed squared error and its unscaled gradient by reverse accumulation.
    fn chunk_gradient(&self, params: &[f64], cases: &[TrainingCase]) -> (f64, Vec<f64>) {
        let n_layers = self.shapes.len();
        let mut acts = self.activation_buffers();
        let mut grad = vec![0.0; self.n_params];
        let mut err = 0.0;
        let mut delta: Vec<f64> = Vec::new();

        for case in cases {
            self.forward(params, &case.input, &mut acts);

            delta.clear();
            for (o, t) in acts[n_layers - 1].iter().zip(&case.target) {
                let diff = o - t;
                err += diff * diff;
                delta.push(if self.output_activated() {
                    diff * self.activation.derivative(*o)
                } else {
                    diff
                });
            }

            for k in (0..n_layers).rev() {
                let (rows, cols) = self.shapes[k];
                let n_in = cols - 1;
                let off = self.offsets[k];
                let input: &[f64] = if k == 0 { &case.input } else { &acts[k - 1] };

                for (j, d) in delta.iter().enumerate() {
                    let g = &mut grad[off + j * cols..off + (j + 1) * cols];
                    for (gi, xi) in g[..n_in].iter_mut().zip(input) {
                        *gi += d * xi;
                    }
                    g[n_in] += d;
                }

                if k > 0 {
                    let w = &params[off..off + rows * cols];
                    let mut back = vec![0.0; n_in];
                    for (row, d) in w.chunks_exact(cols).zip(&delta) {
                        for (b, wi) in back.iter_mut().zip(&row[..n_in]) {
                            *b += d * wi;
                        }
                    }
                    for (b, f) in back.iter_mut().zip(input) {
                        *b *= self.activation.derivative(*f);
                    }
                    delta = back;
                }
            }
        }
        (err, grad)
    }
}

impl<'a> Objective for MlfnObjective<'a> {
    fn n_params(&self) -> usize {
        self.n_params
    }

    fn error(&self, params: &[f64]) -> f64 {
        let parts: Vec<f64> = self.cases
            .par_chunks(GRADIENT_CHUNK)
            .map(|chunk| self.chunk_error(params, chunk))
            .collect();
        parts.iter().sum::<f64>() * self.normaliser()
    }

    fn gradient(&self, params: &[f64], grad: &mut [f64]) -> f64 {
        let parts: Vec<(f64, Vec<f64>)> = self.cases
            .par_chunks(GRADIENT_CHUNK)
            .map(|chunk| self.chunk_gradient(params, chunk))
            .collect();

        grad.iter_mut().for_each(|g| *g = 0.0);
        let mut total = 0.0;
        for (err, part) in &parts {
            total += err;
            for (g, p) in grad.iter_mut().zip(part) {
                *g += p;
            }
        }
        let scale = self.normaliser();
        grad.iter_mut().for_each(|g| *g *= 2.0 * scale);
        total * scale
    }
}
