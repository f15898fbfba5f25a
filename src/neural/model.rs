// projeto: npredict
// file: src/neural/model.rs
// Common capability of the network variants and the tagged model type

use serde::{Deserialize, Serialize};

use crate::neural::cases::TrainingSet;
use crate::neural::mlfn::{Mlfn, MlfnConfig};
use crate::neural::optim::TrainingStatus;
use crate::neural::pnn::{Pnn, PnnConfig};
use crate::neural::progress::TrainingContext;
use crate::neural::utils::NeuralError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Mlfn,
    Pnn,
}

/// `Untrained → Training → Trained`; `Training` may be re-entered from
/// `Trained`, never left back to `Untrained`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelState {
    Untrained,
    Training,
    Trained,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub iterations: usize,
    pub final_error: f64,
    pub status: TrainingStatus,
    pub skipped_cases: usize,
    pub elapsed_secs: f64,
}

impl TrainingSummary {
    pub fn converged(&self) -> bool {
        self.status == TrainingStatus::Converged
    }
}

pub trait NetworkModel: Send + Sync {
    fn kind(&self) -> ModelKind;
    fn n_inputs(&self) -> usize;
    fn n_outputs(&self) -> usize;
    fn state(&self) -> ModelState;

    fn train(&mut self, set: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingSummary, NeuralError>;

    /// Deterministic forward computation; safe to call from many threads.
    fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, NeuralError>;
}

impl NetworkModel for Mlfn {
    fn kind(&self) -> ModelKind {
        ModelKind::Mlfn
    }

    fn n_inputs(&self) -> usize {
        Mlfn::n_inputs(self)
    }

    fn n_outputs(&self) -> usize {
        Mlfn::n_outputs(self)
    }

    fn state(&self) -> ModelState {
        Mlfn::state(self)
    }

    fn train(&mut self, set: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingSummary, NeuralError> {
        Mlfn::train(self, set, ctx)
    }

    fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, NeuralError> {
        Mlfn::evaluate(self, input)
    }
}

impl NetworkModel for Pnn {
    fn kind(&self) -> ModelKind {
        ModelKind::Pnn
    }

    fn n_inputs(&self) -> usize {
        Pnn::n_inputs(self)
    }

    fn n_outputs(&self) -> usize {
        Pnn::n_outputs(self)
    }

    fn state(&self) -> ModelState {
        Pnn::state(self)
    }

    fn train(&mut self, set: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingSummary, NeuralError> {
        Pnn::train(self, set, ctx)
    }

    fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, NeuralError> {
        Pnn::evaluate(self, input)
    }
}

/// Construction parameters; the variant picks the model kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelConfig {
    Mlfn(MlfnConfig),
    Pnn(PnnConfig),
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig::Mlfn(MlfnConfig::default())
    }
}

/// A network of either kind, owned by value so it can be persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Model {
    Mlfn(Mlfn),
    Pnn(Pnn),
}

impl Model {
    pub fn new(n_inputs: usize, n_outputs: usize, config: &ModelConfig) -> Result<Self, NeuralError> {
        Ok(match config {
            ModelConfig::Mlfn(c) => Model::Mlfn(Mlfn::new(n_inputs, n_outputs, c.clone())?),
            ModelConfig::Pnn(c) => Model::Pnn(Pnn::new(n_inputs, n_outputs, c.clone())?),
        })
    }

    fn inner(&self) -> &dyn NetworkModel {
        match self {
            Model::Mlfn(m) => m,
            Model::Pnn(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn NetworkModel {
        match self {
            Model::Mlfn(m) => m,
            Model::Pnn(p) => p,
        }
    }

    /// Structural consistency of a model that did not come from `new`.
    pub fn validate(&self) -> Result<(), NeuralError> {
        match self {
            Model::Mlfn(m) => m.validate(),
            Model::Pnn(p) => p.validate(),
        }
    }

    pub fn last_summary(&self) -> Option<&TrainingSummary> {
        match self {
            Model::Mlfn(m) => m.last_summary(),
            Model::Pnn(p) => p.last_summary(),
        }
    }
}

impl NetworkModel for Model {
    fn kind(&self) -> ModelKind {
        self.inner().kind()
    }

    fn n_inputs(&self) -> usize {
        self.inner().n_inputs()
    }

    fn n_outputs(&self) -> usize {
        self.inner().n_outputs()
    }

    fn state(&self) -> ModelState {
        self.inner().state()
    }

    fn train(&mut self, set: &TrainingSet, ctx: &TrainingContext) -> Result<TrainingSummary, NeuralError> {
        self.inner_mut().train(set, ctx)
    }

    fn evaluate(&self, input: &[f64]) -> Result<Vec<f64>, NeuralError> {
        self.inner().evaluate(input)
    }
}
