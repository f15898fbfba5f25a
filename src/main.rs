// projeto: npredict
// file: src/main.rs
// Command line front end: train, predict, ARMA forecasts and orthogonal transforms

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use crossbeam::channel::unbounded;
use log::{error, info, warn};

use npredict::neural::metrics::evaluate_model;
use npredict::{
    autoregressive_cases, load_model, save_model, ArmaModel, ChannelSink, ConfidenceMethod,
    ConfidenceSpec, Config, FeedMode, LogSink, Model, ModelFile, ModelKind, NetworkModel, NeuralError,
    OrthogonalTransform, PredictionResult, Predictor, Signal, TrainingContext, TrainingSet, TransformKind,
};

#[derive(Parser, Debug)]
#[command(
    name = "npredict",
    version,
    about = "Treinamento e previsão de séries temporais com redes MLFN/PNN, ARMA e transformações ortogonais"
)]
struct Cli {
    /// Arquivo de configuração TOML (criado com valores padrão se não existir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Modo verboso de logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Treina um modelo autorregressivo sobre um sinal
    Train {
        /// Sinal de entrada (um valor por linha)
        #[arg(long)]
        signal: PathBuf,

        /// Arquivo de saída do modelo (.json para texto, outro para binário)
        #[arg(long)]
        model: PathBuf,

        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Número de defasagens da janela de entrada
        #[arg(long)]
        lags: Option<usize>,
    },
    /// Prevê valores futuros com um modelo salvo
    Predict {
        #[arg(long)]
        model: PathBuf,

        #[arg(long)]
        signal: PathBuf,

        #[arg(long)]
        horizon: Option<usize>,

        /// Nível de confiança em porcentagem (0-100)
        #[arg(long)]
        confidence: Option<f64>,

        #[arg(long, value_enum)]
        method: Option<MethodArg>,

        /// Graus de liberdade para o método t de Student
        #[arg(long)]
        dist: Option<f64>,

        /// Realimentar valores reais quando existirem
        #[arg(long)]
        actual: bool,

        /// Arquivo de saída da previsão
        #[arg(long)]
        output: PathBuf,
    },
    /// Ajusta um modelo ARMA(p, q) e projeta o sinal
    Arma {
        #[arg(long)]
        signal: PathBuf,

        #[arg(long, default_value_t = 1)]
        p: usize,

        #[arg(long, default_value_t = 0)]
        q: usize,

        #[arg(long, default_value_t = 10)]
        horizon: usize,

        #[arg(long)]
        confidence: Option<f64>,

        #[arg(long)]
        output: PathBuf,
    },
    /// Ajusta e aplica uma transformação ortogonal
    Orthog {
        /// Sinais de entrada, um por dimensão
        #[arg(long, num_args = 1.., required = true)]
        signals: Vec<PathBuf>,

        #[arg(long, value_enum, default_value = "pca")]
        kind: TransformArg,

        /// Rótulos de classe (centroid e discriminant)
        #[arg(long)]
        classes: Option<PathBuf>,

        #[arg(long, default_value_t = 1)]
        factors: usize,

        #[arg(long)]
        standardize: bool,

        /// Diretório onde os fatores são gravados
        #[arg(long)]
        output_dir: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Mlfn,
    Pnn,
}

impl From<KindArg> for ModelKind {
    fn from(arg: KindArg) -> Self {
        match arg {
            KindArg::Mlfn => ModelKind::Mlfn,
            KindArg::Pnn => ModelKind::Pnn,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MethodArg {
    Empirical,
    Normal,
    StudentT,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TransformArg {
    Pca,
    Centroid,
    Discriminant,
}

impl From<TransformArg> for TransformKind {
    fn from(arg: TransformArg) -> Self {
        match arg {
            TransformArg::Pca => TransformKind::PrincipalComponents,
            TransformArg::Centroid => TransformKind::Centroid,
            TransformArg::Discriminant => TransformKind::Discriminant,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let start_time = Instant::now();
    info!("🚀 npredict iniciado em {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));

    let result = load_config(cli.config.as_deref()).and_then(|config| run(cli.command, &config));

    match result {
        Ok(()) => {
            info!("✅ Concluído em {:.2}s", start_time.elapsed().as_secs_f64());
            info!("🏁 Finalizado em: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
        }
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, NeuralError> {
    match path {
        Some(p) => Config::load_or_create(p),
        None => Ok(Config::default()),
    }
}

fn run(command: Command, config: &Config) -> Result<(), NeuralError> {
    match command {
        Command::Train { signal, model, kind, lags } => {
            let mut config = config.clone();
            if let Some(k) = kind {
                config.model.kind = k.into();
            }
            if let Some(l) = lags {
                config.model.lags = l;
            }
            config.validate()?;
            train(&signal, &model, &config)
        }
        Command::Predict { model, signal, horizon, confidence, method, dist, actual, output } => {
            let mut prediction = config.prediction_config();
            if let Some(h) = horizon {
                prediction.horizon = h;
            }
            if actual {
                prediction.feed = FeedMode::Actual;
            }
            if confidence.is_some() || method.is_some() {
                let base = prediction.confidence.unwrap_or(ConfidenceSpec {
                    percent: config.prediction.confidence_percent,
                    method: ConfidenceMethod::Empirical,
                });
                let dist = dist.unwrap_or(config.prediction.dist);
                prediction.confidence = Some(ConfidenceSpec {
                    percent: confidence.unwrap_or(base.percent),
                    method: match method {
                        Some(MethodArg::Empirical) => ConfidenceMethod::Empirical,
                        Some(MethodArg::Normal) => ConfidenceMethod::Normal,
                        Some(MethodArg::StudentT) => ConfidenceMethod::StudentT { dist },
                        None => base.method,
                    },
                });
            }

            let file = load_model(&model)?;
            let series = Signal::load_text(&signal)?;
            if series.name() != file.signal_name {
                warn!("⚠️ Modelo treinado em '{}', aplicado a '{}'", file.signal_name, series.name());
            }
            let predictor = Predictor::new(&file.model, file.lags)?;
            let result = predictor.predict(&series, series.len(), &prediction)?;
            write_result(&result, &output)
        }
        Command::Arma { signal, p, q, horizon, confidence, output } => {
            let series = Signal::load_text(&signal)?;
            let model = ArmaModel::fit(&series, p, q, &TrainingContext::silent().with_sink(&LogSink))?;
            let result = model.forecast(&series, horizon, confidence)?;
            write_result(&result, &output)
        }
        Command::Orthog { signals, kind, classes, factors, standardize, output_dir } => {
            let inputs = signals.iter().map(Signal::load_text).collect::<Result<Vec<_>, _>>()?;
            let labels = classes.as_ref().map(Signal::load_text).transpose()?;
            let refs: Vec<&Signal> = inputs.iter().collect();
            let transform = OrthogonalTransform::fit(
                kind.into(), &refs, labels.as_ref(), factors, standardize,
                &TrainingContext::silent().with_sink(&LogSink),
            )?;
            std::fs::create_dir_all(&output_dir)?;
            for out in transform.apply(&refs)? {
                out.save_text(output_dir.join(format!("{}.txt", out.name())))?;
            }
            Ok(())
        }
    }
}

fn train(signal_path: &Path, model_path: &Path, config: &Config) -> Result<(), NeuralError> {
    let series = Signal::load_text(signal_path)?;
    let lags = config.model.lags;
    let cases = autoregressive_cases(&series, lags)?;
    let (train_set, holdout) = if config.model.train_fraction < 1.0 {
        cases.split(config.model.train_fraction)?
    } else {
        (cases.clone(), TrainingSet::new(lags, 1))
    };
    info!("📊 Sinal '{}': {} casos de treino, {} de validação, {} ignorados",
          series.name(), train_set.len(), holdout.len(), cases.skipped());

    let mut model = Model::new(lags, 1, &config.model_config()?)?;

    // training runs on a worker thread; progress arrives over the channel
    let (tx, rx) = unbounded::<String>();
    let summary = thread::scope(|s| {
        let worker = s.spawn(|| {
            let sink = ChannelSink::new(tx);
            let ctx = TrainingContext::silent().with_sink(&sink);
            model.train(&train_set, &ctx)
        });
        for message in rx.iter() {
            info!("⏳ {}", message);
        }
        worker.join()
    })
    .map_err(|_| NeuralError::Numerical("training thread panicked".to_string()))??;

    info!("🎯 {:?}: {} iterações, erro final {:.8}, {:.2}s",
          summary.status, summary.iterations, summary.final_error, summary.elapsed_secs);
    if !summary.converged() {
        warn!("⚠️ Treinamento não convergiu ({:?}); o modelo continua utilizável", summary.status);
    }

    if !holdout.is_empty() {
        evaluate_model(&model, &holdout, 0)?.log_summary("Validação");
    }

    save_model(model_path, &ModelFile::new(model, lags, series.name()))
}

fn write_result(result: &PredictionResult, output: &Path) -> Result<(), NeuralError> {
    result.prediction.save_text(output)?;
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("prediction");
    let ext = output.extension().and_then(|s| s.to_str()).unwrap_or("txt");
    if let (Some(lower), Some(upper)) = (&result.lower, &result.upper) {
        lower.save_text(output.with_file_name(format!("{}_lower.{}", stem, ext)))?;
        upper.save_text(output.with_file_name(format!("{}_upper.{}", stem, ext)))?;
        info!("📏 Intervalo de {:.1}% gravado", result.confidence.unwrap_or(0.0));
    }
    for (i, v) in result.prediction.values().iter().enumerate() {
        info!("   t+{}: {:.7}", i + 1, v);
    }
    Ok(())
}
