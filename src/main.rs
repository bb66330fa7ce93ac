use std::io::{stdout, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use llamabridge::config::{LoggingConfig, Settings};
use llamabridge::gguf::{is_gguf_file, GGUFReader};
use llamabridge::{EngineKind, InferenceSession, ModelHandle};

mod chat;

#[derive(Parser, Debug)]
#[command(name = "llamabridge", version, about = "Run incremental inference sessions against a local model")]
struct Cli {
    /// Model file, overrides `model.path` from the configuration
    #[arg(short, long, global = true)]
    model: Option<PathBuf>,

    /// Engine to load the model with (reference, llama-cpp)
    #[arg(short, long, global = true)]
    engine: Option<EngineKind>,

    /// Directory holding default.toml and local.toml
    #[arg(long, global = true, default_value = "config")]
    config: PathBuf,

    /// Mirror log output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat with the model
    Chat,
    /// Generate a single reply to a prompt
    Generate {
        #[arg(short, long)]
        prompt: String,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Show the metadata and tensors of a GGUF file
    Inspect {
        path: PathBuf,
        /// Print JSON instead of tables
        #[arg(long)]
        json: bool,
    },
}

/// Installs the subscriber: a daily rolling log file, plus stderr when `verbose`.
fn init_logging(logging: &LoggingConfig, verbose: bool) -> WorkerGuard {
    let log_file = logging
        .file
        .clone()
        .unwrap_or_else(|| PathBuf::from("logs/llamabridge.log"));
    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "llamabridge.log".to_string());

    let file_appender = tracing_appender::rolling::RollingFileAppender::new(
        tracing_appender::rolling::Rotation::DAILY,
        directory,
        prefix,
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        // Disable ANSI colors for cleaner log files
        .with_ansi(false)
        .with_line_number(true)
        .with_file(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false);
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    guard
}

fn load_model(settings: &Settings) -> anyhow::Result<ModelHandle> {
    let Some(path) = settings.model.path.as_deref() else {
        bail!("No model given; pass --model PATH or set model.path in the configuration");
    };

    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{prefix:.bold.dim} {spinner} {wide_msg}")?);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(format!("Loading {}...", path.display()));

    let result = ModelHandle::load_with(settings.model.engine, path);
    pb.finish_and_clear();

    let model = result.with_context(|| format!("Failed to load model {}", path.display()))?;
    chat::display_model_info(model.info());
    Ok(model)
}

fn generate(settings: &Settings, model: &ModelHandle, prompt: &str) -> anyhow::Result<()> {
    let mut session = InferenceSession::create_with(model, &settings.session_config())
        .context("Failed to create inference session")?;

    let mut out = stdout();
    let generation = session.generate(prompt, &settings.generation_params(), |piece| {
        print!("{}", piece.bright_cyan());
        let _ = out.flush();
        ControlFlow::Continue(())
    })?;
    println!();
    println!(
        "{}",
        format!(
            "[{} prompt tokens, {} generated, {}]",
            generation.prompt_tokens,
            generation.tokens.len(),
            generation.stop_reason
        )
        .bright_black()
    );

    session.destroy();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config).context("Failed to load settings")?;
    if let Some(model) = cli.model.clone() {
        settings.model.path = Some(model);
    }
    if let Some(engine) = cli.engine {
        settings.model.engine = engine;
    }

    let _guard = init_logging(&settings.logging, cli.verbose);
    info!(command = ?cli.command, engine = %settings.model.engine, "llamabridge starting");

    match cli.command {
        Command::Inspect { path, json } => {
            if !is_gguf_file(&path) {
                bail!("{} is not a GGUF file", path.display());
            }
            let reader = GGUFReader::new(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&chat::gguf_json(&reader))?);
            } else {
                chat::display_gguf(&reader);
            }
        }
        Command::Generate { prompt, max_tokens } => {
            if let Some(max_tokens) = max_tokens {
                settings.generation.max_tokens = max_tokens;
            }
            settings.validate()?;
            let model = load_model(&settings)?;
            generate(&settings, &model, &prompt)?;
            model.release();
        }
        Command::Chat => {
            let model = load_model(&settings)?;
            chat::chat_loop(&settings, &model).await?;
            model.release();
        }
    }

    Ok(())
}
