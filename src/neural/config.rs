// projeto: npredict
// file: src/neural/config.rs
// TOML configuration for training, PNN smoothing and prediction defaults

use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::neural::mlfn::{MlfnConfig, OutputMode};
use crate::neural::model::{ModelConfig, ModelKind};
use crate::neural::optim::OptimConfig;
use crate::neural::pnn::{Kernel, PnnConfig, PnnMode};
use crate::neural::predict::{ConfidenceMethod, ConfidenceSpec, FeedMode, PredictionConfig};
use crate::neural::utils::{Activation, NeuralError};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub activation: ActivationSection,
    pub model: ModelSection,
    pub mlfn: MlfnSection,
    pub pnn: PnnSection,
    pub prediction: PredictionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationSection {
    pub scale: f64,
    pub clamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub kind: ModelKind,
    pub lags: usize,
    pub train_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlfnSection {
    pub hidden: Vec<usize>,
    pub output: OutputMode,
    pub init_tries: usize,
    pub seed: u64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub min_improvement: f64,
    pub stall_limit: usize,
    pub report_every: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PnnSection {
    pub kernel: Kernel,
    pub sigma: f64,
    pub optimize_sigma: bool,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub grid_points: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandMethod {
    None,
    Empirical,
    Normal,
    StudentT,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionSection {
    pub horizon: usize,
    pub feed: FeedMode,
    pub method: BandMethod,
    pub confidence_percent: f64,
    pub dist: f64,
}

impl Default for ActivationSection {
    fn default() -> Self {
        let a = Activation::default();
        ActivationSection { scale: a.scale, clamp: a.clamp }
    }
}

impl Default for ModelSection {
    fn default() -> Self {
        ModelSection {
            kind: ModelKind::Mlfn,
            lags: 5,
            train_fraction: 0.8,
        }
    }
}

impl Default for MlfnSection {
    fn default() -> Self {
        let m = MlfnConfig::default();
        MlfnSection {
            hidden: m.hidden,
            output: m.output,
            init_tries: m.init_tries,
            seed: m.seed,
            max_iterations: m.optim.max_iterations,
            tolerance: m.optim.tolerance,
            min_improvement: m.optim.min_improvement,
            stall_limit: m.optim.stall_limit,
            report_every: m.optim.report_every,
        }
    }
}

impl Default for PnnSection {
    fn default() -> Self {
        let p = PnnConfig::default();
        PnnSection {
            kernel: p.kernel,
            sigma: p.sigma,
            optimize_sigma: true,
            sigma_min: p.sigma_range.0,
            sigma_max: p.sigma_range.1,
            grid_points: p.grid_points,
        }
    }
}

impl Default for PredictionSection {
    fn default() -> Self {
        PredictionSection {
            horizon: 10,
            feed: FeedMode::Predicted,
            method: BandMethod::Empirical,
            confidence_percent: 90.0,
            dist: 5.0,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NeuralError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("⚙️ Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Loads `path`, writing the defaults there first when it does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, NeuralError> {
        let path = path.as_ref();
        if path.exists() {
            Config::load(path)
        } else {
            warn!("📄 No configuration at {}, writing defaults", path.display());
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), NeuralError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        info!("💾 Configuration saved to {}", path.display());
        Ok(())
    }

    /// Checks every section by building the typed configurations from it.
    pub fn validate(&self) -> Result<(), NeuralError> {
        if self.model.lags == 0 {
            return Err(NeuralError::Config("model.lags must be at least 1".to_string()));
        }
        if !(self.model.train_fraction > 0.0 && self.model.train_fraction <= 1.0) {
            return Err(NeuralError::Config(format!(
                "model.train_fraction must lie in (0, 1], got {}", self.model.train_fraction
            )));
        }
        if self.prediction.horizon == 0 {
            return Err(NeuralError::Config("prediction.horizon must be at least 1".to_string()));
        }
        let as_config = |e: NeuralError| match e {
            NeuralError::Validation(msg) => NeuralError::Config(msg),
            other => other,
        };
        self.activation().map_err(as_config)?;
        self.mlfn_config()?.validate().map_err(as_config)?;
        self.pnn_config()?.validate().map_err(as_config)?;
        if let Some(spec) = self.confidence() {
            spec.validate().map_err(as_config)?;
        }
        Ok(())
    }

    pub fn activation(&self) -> Result<Activation, NeuralError> {
        Activation::new(self.activation.scale, self.activation.clamp)
    }

    pub fn mlfn_config(&self) -> Result<MlfnConfig, NeuralError> {
        let m = &self.mlfn;
        Ok(MlfnConfig {
            hidden: m.hidden.clone(),
            output: m.output,
            activation: self.activation()?,
            init_tries: m.init_tries,
            seed: m.seed,
            optim: OptimConfig {
                max_iterations: m.max_iterations,
                tolerance: m.tolerance,
                min_improvement: m.min_improvement,
                stall_limit: m.stall_limit,
                report_every: m.report_every,
            },
        })
    }

    pub fn pnn_config(&self) -> Result<PnnConfig, NeuralError> {
        let p = &self.pnn;
        Ok(PnnConfig {
            kernel: p.kernel,
            sigma: p.sigma,
            mode: PnnMode::Regression,
            optimize_sigma: p.optimize_sigma,
            sigma_range: (p.sigma_min, p.sigma_max),
            grid_points: p.grid_points,
        })
    }

    pub fn model_config(&self) -> Result<ModelConfig, NeuralError> {
        Ok(match self.model.kind {
            ModelKind::Mlfn => ModelConfig::Mlfn(self.mlfn_config()?),
            ModelKind::Pnn => ModelConfig::Pnn(self.pnn_config()?),
        })
    }

    pub fn confidence(&self) -> Option<ConfidenceSpec> {
        let method = match self.prediction.method {
            BandMethod::None => return None,
            BandMethod::Empirical => ConfidenceMethod::Empirical,
            BandMethod::Normal => ConfidenceMethod::Normal,
            BandMethod::StudentT => ConfidenceMethod::StudentT { dist: self.prediction.dist },
        };
        Some(ConfidenceSpec { percent: self.prediction.confidence_percent, method })
    }

    pub fn prediction_config(&self) -> PredictionConfig {
        PredictionConfig {
            horizon: self.prediction.horizon,
            feed: self.prediction.feed,
            confidence: self.confidence(),
            residuals: None,
        }
    }
}
