// projeto: npredict
// file: src/neural/registry.rs
// Project registry that owns signals; models and transforms refer to them by id

use log::info;

use crate::neural::cases::autoregressive_cases;
use crate::neural::model::{Model, NetworkModel, TrainingSummary};
use crate::neural::orthog::OrthogonalTransform;
use crate::neural::predict::{PredictionConfig, PredictionResult, Predictor};
use crate::neural::progress::TrainingContext;
use crate::neural::signal::Signal;
use crate::neural::utils::NeuralError;

/// Stable index of a signal in a `Project`; never reused after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(usize);

#[derive(Debug)]
pub struct ModelEntry {
    pub name: String,
    pub model: Model,
    pub source: SignalId,
    pub lags: usize,
}

#[derive(Debug)]
pub struct TransformEntry {
    pub name: String,
    pub transform: OrthogonalTransform,
    pub inputs: Vec<SignalId>,
}

#[derive(Debug, Default)]
pub struct Project {
    signals: Vec<Option<Signal>>,
    models: Vec<ModelEntry>,
    transforms: Vec<TransformEntry>,
}

impl Project {
    pub fn new() -> Self {
        Project::default()
    }

    pub fn add_signal(&mut self, signal: Signal) -> Result<SignalId, NeuralError> {
        if self.signal_id(signal.name()).is_some() {
            return Err(NeuralError::Validation(format!("signal '{}' already exists", signal.name())));
        }
        self.signals.push(Some(signal));
        Ok(SignalId(self.signals.len() - 1))
    }

    pub fn signal_id(&self, name: &str) -> Option<SignalId> {
        self.signals.iter()
            .position(|s| s.as_ref().map(|s| s.name() == name).unwrap_or(false))
            .map(SignalId)
    }

    pub fn signal(&self, id: SignalId) -> Result<&Signal, NeuralError> {
        self.signals.get(id.0)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| NeuralError::Validation(format!("no signal with id {}", id.0)))
    }

    pub fn signal_mut(&mut self, id: SignalId) -> Result<&mut Signal, NeuralError> {
        self.signals.get_mut(id.0)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| NeuralError::Validation(format!("no signal with id {}", id.0)))
    }

    pub fn signal_names(&self) -> Vec<&str> {
        self.signals.iter().flatten().map(|s| s.name()).collect()
    }

    fn is_referenced(&self, id: SignalId) -> bool {
        self.models.iter().any(|m| m.source == id)
            || self.transforms.iter().any(|t| t.inputs.contains(&id))
    }

    /// Removes a signal no model or transform refers to.
    pub fn remove_signal(&mut self, id: SignalId) -> Result<Signal, NeuralError> {
        if self.is_referenced(id) {
            return Err(NeuralError::Validation(format!(
                "signal '{}' is still used by a model or transform", self.signal(id)?.name()
            )));
        }
        self.signals.get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| NeuralError::Validation(format!("no signal with id {}", id.0)))
    }

    pub fn add_model(&mut self, name: impl Into<String>, model: Model, source: SignalId, lags: usize) -> Result<(), NeuralError> {
        let name = name.into();
        self.signal(source)?;
        if self.models.iter().any(|m| m.name == name) {
            return Err(NeuralError::Validation(format!("model '{}' already exists", name)));
        }
        if model.n_inputs() != lags || model.n_outputs() != 1 {
            return Err(NeuralError::Validation(format!(
                "model '{}' is {}→{}, expected {}→1", name, model.n_inputs(), model.n_outputs(), lags
            )));
        }
        self.models.push(ModelEntry { name, model, source, lags });
        Ok(())
    }

    pub fn model(&self, name: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.name == name)
    }

    pub fn remove_model(&mut self, name: &str) -> Option<ModelEntry> {
        let pos = self.models.iter().position(|m| m.name == name)?;
        Some(self.models.remove(pos))
    }

    /// Trains a registered model on autoregressive windows of its source.
    pub fn train_model(&mut self, name: &str, ctx: &TrainingContext) -> Result<TrainingSummary, NeuralError> {
        let pos = self.models.iter().position(|m| m.name == name)
            .ok_or_else(|| NeuralError::Validation(format!("no model named '{}'", name)))?;
        let (source, lags) = (self.models[pos].source, self.models[pos].lags);
        let set = autoregressive_cases(self.signal(source)?, lags)?;
        let summary = self.models[pos].model.train(&set, ctx)?;
        info!("🎯 Model '{}' trained: {:?}", name, summary.status);
        Ok(summary)
    }

    /// Predicts past the end of the model's source signal.
    pub fn predict(&self, name: &str, config: &PredictionConfig) -> Result<PredictionResult, NeuralError> {
        let entry = self.model(name)
            .ok_or_else(|| NeuralError::Validation(format!("no model named '{}'", name)))?;
        let signal = self.signal(entry.source)?;
        Predictor::new(&entry.model, entry.lags)?.predict(signal, signal.len(), config)
    }

    pub fn add_transform(&mut self, name: impl Into<String>, transform: OrthogonalTransform, inputs: Vec<SignalId>) -> Result<(), NeuralError> {
        let name = name.into();
        for &id in &inputs {
            self.signal(id)?;
        }
        if inputs.len() != transform.dims() {
            return Err(NeuralError::Validation(format!(
                "transform '{}' takes {} signals, {} given", name, transform.dims(), inputs.len()
            )));
        }
        if self.transforms.iter().any(|t| t.name == name) {
            return Err(NeuralError::Validation(format!("transform '{}' already exists", name)));
        }
        self.transforms.push(TransformEntry { name, transform, inputs });
        Ok(())
    }

    pub fn transform(&self, name: &str) -> Option<&TransformEntry> {
        self.transforms.iter().find(|t| t.name == name)
    }

    /// Applies a registered transform to its inputs and registers the
    /// outputs as `<transform>_<factor>`. Nothing is registered when any
    /// output name is already taken.
    pub fn apply_transform(&mut self, name: &str) -> Result<Vec<SignalId>, NeuralError> {
        let entry = self.transform(name)
            .ok_or_else(|| NeuralError::Validation(format!("no transform named '{}'", name)))?;
        let inputs = entry.inputs.iter()
            .map(|&id| self.signal(id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut outputs = entry.transform.apply(&inputs)?;
        for out in outputs.iter_mut() {
            let renamed = format!("{}_{}", name, out.name());
            out.rename(renamed);
        }
        if let Some(taken) = outputs.iter().find(|o| self.signal_id(o.name()).is_some()) {
            return Err(NeuralError::Validation(format!("signal '{}' already exists", taken.name())));
        }

        let mut ids = Vec::with_capacity(outputs.len());
        for out in outputs {
            ids.push(self.add_signal(out)?);
        }
        Ok(ids)
    }
}
