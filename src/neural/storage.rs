// projeto: npredict
// file: src/neural/storage.rs
// Model persistence: JSON for `.json` paths, bincode for everything else

use std::fs;
use std::path::Path;

use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::neural::model::{Model, NetworkModel};
use crate::neural::utils::NeuralError;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFile {
    pub version: u32,
    pub created_at: String,
    /// Autoregressive window the model was trained with.
    pub lags: usize,
    pub signal_name: String,
    pub model: Model,
}

impl ModelFile {
    pub fn new(model: Model, lags: usize, signal_name: impl Into<String>) -> Self {
        ModelFile {
            version: FORMAT_VERSION,
            created_at: Utc::now().to_rfc3339(),
            lags,
            signal_name: signal_name.into(),
            model,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    Json,
    Binary,
}

impl StorageFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => StorageFormat::Json,
            _ => StorageFormat::Binary,
        }
    }
}

pub fn encode_model(file: &ModelFile, format: StorageFormat) -> Result<Vec<u8>, NeuralError> {
    match format {
        StorageFormat::Json => Ok(serde_json::to_vec_pretty(file)?),
        StorageFormat::Binary => bincode::serde::encode_to_vec(file, bincode::config::standard())
            .map_err(|e| NeuralError::Serialization(format!("bincode encode: {}", e))),
    }
}

pub fn decode_model(bytes: &[u8], format: StorageFormat) -> Result<ModelFile, NeuralError> {
    let file: ModelFile = match format {
        StorageFormat::Json => serde_json::from_slice(bytes)?,
        StorageFormat::Binary => {
            let (file, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| NeuralError::Serialization(format!("bincode decode: {}", e)))?;
            if read != bytes.len() {
                return Err(NeuralError::Serialization(format!(
                    "{} trailing bytes after model data", bytes.len() - read
                )));
            }
            file
        }
    };
    if file.version > FORMAT_VERSION {
        return Err(NeuralError::Serialization(format!(
            "model file version {} is newer than supported version {}", file.version, FORMAT_VERSION
        )));
    }
    file.model.validate()
        .map_err(|e| NeuralError::Serialization(format!("invalid model data: {}", e)))?;
    Ok(file)
}

pub fn save_model(path: impl AsRef<Path>, file: &ModelFile) -> Result<(), NeuralError> {
    let path = path.as_ref();
    let format = StorageFormat::for_path(path);
    let bytes = encode_model(file, format)?;
    fs::write(path, &bytes)?;
    info!("💾 Saved {:?} model for '{}' to {} ({:?}, {} bytes)",
          file.model.kind(), file.signal_name, path.display(), format, bytes.len());
    Ok(())
}

pub fn load_model(path: impl AsRef<Path>) -> Result<ModelFile, NeuralError> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let file = decode_model(&bytes, StorageFormat::for_path(path))?;
    debug!("Model file created at {}", file.created_at);
    info!("📂 Loaded {:?} model for '{}' from {}", file.model.kind(), file.signal_name, path.display());
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::cases::autoregressive_cases;
    use crate::neural::mlfn::MlfnConfig;
    use crate::neural::model::ModelConfig;
    use crate::neural::optim::OptimConfig;
    use crate::neural::pnn::{Kernel, PnnConfig};
    use crate::neural::progress::TrainingContext;
    use crate::neural::signal::Signal;
    use tempfile::tempdir;

    fn trained(config: ModelConfig) -> Model {
        let s = Signal::new("wave", (0..80).map(|i| (i as f64 * 0.2).sin() * 0.8).collect());
        let set = autoregressive_cases(&s, 3).unwrap();
        let mut model = Model::new(3, 1, &config).unwrap();
        model.train(&set, &TrainingContext::silent()).unwrap();
        model
    }

    fn battery() -> Vec<Vec<f64>> {
        (0..15).map(|i| {
            let x = i as f64 * 0.13 - 0.9;
            vec![x, (x * 3.0).sin(), -x * 0.5]
        }).collect()
    }

    fn configs() -> Vec<ModelConfig> {
        vec![
            ModelConfig::Mlfn(MlfnConfig {
                hidden: vec![4, 3],
                optim: OptimConfig { max_iterations: 50, ..OptimConfig::default() },
                ..MlfnConfig::default()
            }),
            ModelConfig::Pnn(PnnConfig { kernel: Kernel::Reciprocal, ..PnnConfig::default() }),
        ]
    }

    #[test]
    fn test_round_trip_reproduces_outputs() {
        let dir = tempdir().unwrap();
        for (i, config) in configs().into_iter().enumerate() {
            let model = trained(config);
            for name in [format!("m{}.json", i), format!("m{}.bin", i)] {
                let path = dir.path().join(name);
                save_model(&path, &ModelFile::new(model.clone(), 3, "wave")).unwrap();
                let loaded = load_model(&path).unwrap();
                assert_eq!(loaded.lags, 3);
                assert_eq!(loaded.signal_name, "wave");
                assert_eq!(loaded.model.kind(), model.kind());
                for q in battery() {
                    assert_eq!(loaded.model.evaluate(&q).unwrap(), model.evaluate(&q).unwrap());
                }
            }
        }
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(StorageFormat::for_path(Path::new("a/b.JSON")), StorageFormat::Json);
        assert_eq!(StorageFormat::for_path(Path::new("a/b.model")), StorageFormat::Binary);
        assert_eq!(StorageFormat::for_path(Path::new("noext")), StorageFormat::Binary);
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(load_model(dir.path().join("absent.bin")), Err(NeuralError::Io(_))));

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, b"{ not json").unwrap();
        assert!(matches!(load_model(&garbage), Err(NeuralError::Serialization(_))));

        let truncated = dir.path().join("short.bin");
        fs::write(&truncated, [1u8, 2, 3]).unwrap();
        assert!(matches!(load_model(&truncated), Err(NeuralError::Serialization(_))));
    }

    #[test]
    fn test_tampered_weights_rejected_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("linear.json");
        let model = trained(ModelConfig::Mlfn(MlfnConfig { hidden: vec![], ..MlfnConfig::default() }));
        save_model(&path, &ModelFile::new(model, 3, "wave")).unwrap();

        let mut json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let layer = &mut json["model"]["Mlfn"]["layers"][0];
        layer["dim"] = serde_json::json!([1, 6]);
        layer["data"] = serde_json::json!([0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        assert!(matches!(load_model(&path), Err(NeuralError::Serialization(_))));
    }

    #[test]
    fn test_tampered_pnn_classes_rejected_on_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pnn.json");
        save_model(&path, &ModelFile::new(trained(ModelConfig::Pnn(PnnConfig::default())), 3, "wave")).unwrap();

        let mut json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        json["model"]["Pnn"]["class_counts"] = serde_json::json!([0]);
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        assert!(matches!(load_model(&path), Err(NeuralError::Serialization(_))));
    }
}
