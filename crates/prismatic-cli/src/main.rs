use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use prismatic_contracts::batch::{BatchRequest, BatchStatus, BatchStatusView, ResultStatus};
use prismatic_contracts::events::{
    BroadcastSink, FanoutSink, JsonlSink, NotificationSink, TOPIC_BATCH_COMPLETED,
};
use prismatic_contracts::models::ModelRegistry;
use prismatic_contracts::presets::StaticPresetStore;
use prismatic_engine::{build_orchestrator, EngineConfig};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_ALL_COMPLETED: i32 = 0;
const EXIT_SOME_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "prismatic", version, about = "Batch angle and color image generation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one batch and stream its events as JSON lines.
    Batch(BatchArgs),
    /// List registered models.
    Models,
    /// List angle and color preset keys.
    Presets(PresetsArgs),
}

#[derive(Debug, Parser)]
struct BatchArgs {
    #[arg(long = "source", required = true)]
    sources: Vec<String>,
    #[arg(long = "angle", required = true)]
    angles: Vec<String>,
    #[arg(long = "color")]
    colors: Vec<String>,
    #[arg(long)]
    auto_colorize: bool,
    #[arg(long)]
    presets: Option<PathBuf>,
    /// Also append every event to this JSONL file.
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    angle_model: Option<String>,
    #[arg(long)]
    color_model: Option<String>,
    #[arg(long)]
    max_concurrency: Option<usize>,
    /// Extra model input as KEY=VALUE; VALUE is parsed as JSON when possible.
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Debug, Parser)]
struct PresetsArgs {
    #[arg(long)]
    presets: Option<PathBuf>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("prismatic error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prismatic=info,prismatic_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Batch(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start tokio runtime")?;
            runtime.block_on(run_batch(args))
        }
        Command::Models => {
            run_models()?;
            Ok(0)
        }
        Command::Presets(args) => {
            run_presets(args)?;
            Ok(0)
        }
    }
}

async fn run_batch(args: BatchArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    if let Some(limit) = args.max_concurrency {
        config = config.with_max_concurrent_jobs(limit);
    }
    let presets = load_presets(args.presets.as_ref())?;

    let broadcast = Arc::new(BroadcastSink::default());
    let mut events = broadcast.subscribe();
    let mut fanout = FanoutSink::new().with(broadcast.clone());
    let event_log = args.events.as_ref().map(JsonlSink::spawn);
    if let Some(log) = &event_log {
        fanout = fanout.with(Arc::new(log.clone()));
    }
    let sink: Arc<dyn NotificationSink> = Arc::new(fanout);
    let orchestrator = build_orchestrator(&config, Arc::new(presets), sink);

    let mut request = BatchRequest::new(args.sources, args.angles, args.colors, args.auto_colorize);
    if let Some(model) = args.angle_model {
        request = request.with_angle_model(model);
    }
    if let Some(model) = args.color_model {
        request = request.with_color_model(model);
    }
    for raw in &args.params {
        let (key, value) = parse_param(raw)?;
        request = request.with_param(key, value);
    }

    let batch_id = orchestrator.create_batch(request)?;
    tracing::info!(batch_id = %batch_id, "batch submitted");

    let mut stdout = io::stdout();
    loop {
        match events.recv().await {
            Ok(notification) => {
                let line = json!({
                    "topic": notification.topic,
                    "payload": notification.payload,
                });
                writeln!(stdout, "{line}")?;
                stdout.flush()?;
                if notification.topic == TOPIC_BATCH_COMPLETED {
                    break;
                }
                let view = orchestrator.get_batch_status(&batch_id)?;
                if is_stalled(&view) {
                    tracing::warn!(
                        batch_id = %batch_id,
                        pending = view.pending,
                        "batch cannot make further progress"
                    );
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    if let Some(log) = &event_log {
        log.flush().await?;
    }
    let view = orchestrator.get_batch_status(&batch_id)?;
    writeln!(stdout, "{}", serde_json::to_string_pretty(&view)?)?;
    Ok(exit_code(&view))
}

fn run_models() -> Result<()> {
    let registry = ModelRegistry::default();
    let mut stdout = io::stdout();
    for model in registry.list() {
        let row = json!({
            "name": model.name,
            "provider": model.provider,
            "external_model": model.external_model,
            "capabilities": model.capabilities,
            "default_params": model.default_params,
        });
        writeln!(stdout, "{row}")?;
    }
    Ok(())
}

fn run_presets(args: PresetsArgs) -> Result<()> {
    let presets = load_presets(args.presets.as_ref())?;
    let listing = json!({
        "angles": presets.angle_keys(),
        "colors": presets.color_keys(),
        "templates": presets.templates.keys().collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

fn load_presets(path: Option<&PathBuf>) -> Result<StaticPresetStore> {
    match path {
        Some(path) => StaticPresetStore::from_json_file(path)
            .with_context(|| format!("failed to load presets from {}", path.display())),
        None => Ok(StaticPresetStore::builtin()),
    }
}

fn parse_param(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("--param expects KEY=VALUE, got '{raw}'");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("--param key must not be empty");
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

/// No result is running and every pending one waits on a failed angle.
fn is_stalled(view: &BatchStatusView) -> bool {
    if view.status == BatchStatus::Completed || view.processing > 0 || view.pending == 0 {
        return false;
    }
    view.results
        .iter()
        .filter(|result| result.status == ResultStatus::Pending)
        .all(|result| {
            result
                .depends_on
                .and_then(|angle| view.results.get(angle))
                .map(|angle| angle.status == ResultStatus::Failed)
                .unwrap_or(false)
        })
}

fn exit_code(view: &BatchStatusView) -> i32 {
    if view.status == BatchStatus::Completed && view.failed == 0 {
        EXIT_ALL_COMPLETED
    } else {
        EXIT_SOME_FAILED
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use prismatic_contracts::batch::{Batch, BatchId};

    use super::*;

    fn view_with(angle: ResultStatus, colors: &[ResultStatus]) -> BatchStatusView {
        let mut batch = Batch::new(
            BatchId::from("batch-test"),
            BatchRequest::new(
                vec!["https://a/src.png".into()],
                vec!["front".into()],
                vec!["red".into(), "blue".into()],
                true,
            ),
            "dryrun-image-1".into(),
            "dryrun-image-1".into(),
            Utc::now(),
        );
        batch.start();
        batch.results[0].status = angle;
        for (offset, status) in colors.iter().enumerate() {
            batch.results[1 + offset].status = *status;
        }
        batch.try_complete(Utc::now());
        batch.status_view()
    }

    #[test]
    fn params_parse_json_or_fall_back_to_text() {
        assert_eq!(parse_param("seed=42").unwrap(), ("seed".to_string(), json!(42)));
        assert_eq!(parse_param("go_fast=true").unwrap().1, json!(true));
        assert_eq!(parse_param("aspect_ratio=16:9").unwrap().1, json!("16:9"));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn stalled_only_when_pending_results_wait_on_failed_angles() {
        use ResultStatus::{Completed, Failed, Pending, Processing};
        assert!(is_stalled(&view_with(Failed, &[Pending, Pending])));
        assert!(!is_stalled(&view_with(Processing, &[Pending, Pending])));
        assert!(!is_stalled(&view_with(Completed, &[Completed, Failed])));
    }

    #[test]
    fn exit_code_reflects_failures() {
        use ResultStatus::{Completed, Failed, Pending};
        let clean = view_with(Completed, &[Completed, Completed]);
        assert_eq!(exit_code(&clean), EXIT_ALL_COMPLETED);
        let partial = view_with(Completed, &[Failed, Completed]);
        assert_eq!(exit_code(&partial), EXIT_SOME_FAILED);
        let stalled = view_with(Failed, &[Pending, Pending]);
        assert_eq!(exit_code(&stalled), EXIT_SOME_FAILED);
    }

    #[test]
    fn cli_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "prismatic",
            "batch",
            "--source",
            "https://a/1.png",
            "--angle",
            "front",
            "--angle",
            "side",
            "--color",
            "red",
            "--auto-colorize",
            "--max-concurrency",
            "2",
        ])
        .unwrap();
        let Command::Batch(args) = cli.command else {
            panic!("expected batch command");
        };
        assert_eq!(args.angles, vec!["front", "side"]);
        assert_eq!(args.colors, vec!["red"]);
        assert!(args.auto_colorize);
        assert_eq!(args.max_concurrency, Some(2));
    }
}
