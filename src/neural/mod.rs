// projeto: npredict
// file: src/neural/mod.rs
// Module declarations for the time-series network engine

pub mod utils;     // Error type, vector kernels, activation and least squares
pub mod signal;    // Signals, MISSING sentinel, modifiers and text format
pub mod cases;     // Training cases windowed from signals
pub mod progress;  // Progress sinks and cancellation
pub mod optim;     // Conjugate-gradient minimiser
pub mod mlfn;      // Multi-layer feed-forward network
pub mod pnn;       // Probabilistic kernel network
pub mod model;     // NetworkModel capability and Model enum
pub mod predict;   // Prediction horizon and confidence bands
pub mod orthog;    // Principal components, centroids, discriminants
pub mod arma;      // ARMA fitting and forecasting
pub mod metrics;   // Held-out regression metrics
pub mod storage;   // Model persistence
pub mod config;    // TOML configuration
pub mod registry;  // Project registry of signals, models and transforms

// Re-export commonly used items for convenience
pub use arma::ArmaModel;
pub use cases::{autoregressive_cases, CaseBuilder, TrainingCase, TrainingSet};
pub use config::Config;
pub use mlfn::{Mlfn, MlfnConfig, OutputMode};
pub use model::{Model, ModelConfig, ModelKind, ModelState, NetworkModel, TrainingSummary};
pub use optim::{OptimConfig, TrainingStatus};
pub use orthog::{OrthogonalTransform, TransformKind};
pub use pnn::{Kernel, Pnn, PnnConfig, PnnMode};
pub use predict::{ConfidenceMethod, ConfidenceSpec, FeedMode, PredictionConfig, PredictionResult, Predictor};
pub use progress::{CancelQuery, CancelToken, ChannelSink, LogSink, NullSink, ProgressSink, TrainingContext};
pub use registry::{Project, SignalId};
pub use signal::{is_missing, Signal, MISSING};
pub use storage::{load_model, save_model, ModelFile};
pub use utils::{activate, activation_derivative, dot, inverse_activation, Activation, NeuralError};
