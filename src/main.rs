use std::{process::ExitCode, str::FromStr};

use clap::{Parser, ValueEnum};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod adapters;
mod client;
mod config;
mod dataset;
mod logging_bus;
mod prelude;
mod proto;
mod result;
mod scheduler;
mod summary;
mod ui;

/// Drive load against an LLM inference endpoint and profile its latency.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Exit codes:
  0   success
  1   invalid configuration, or an uncaught error
  130 interrupted by the user (Ctrl-C)
"#
)]
struct Opts {
    /// Path to the YAML configuration document (§6).
    #[clap(long, default_value = "config.yaml")]
    config: std::path::PathBuf,

    /// Minimum log level to emit.
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

/// `--log-level` values, matching the CLI surface of §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[allow(clippy::enum_variant_names)]
enum LogLevel {
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Our entry point. We return a plain [`ExitCode`] (rather than letting
/// `anyhow::Result` print-and-exit-1 on every error) so we can distinguish
/// the three exit codes named in §6: 0 success, 1 configuration/uncaught
/// error, 130 user interrupt.
#[tokio::main]
async fn main() -> ExitCode {
    let ui = Ui::init();
    let opts = Opts::parse();

    // Every virtual-client task's spans/events are formatted against a
    // shared `LoggingBusHandle`, which funnels them onto one channel drained
    // by a single dedicated reader thread (§4.6) — the sink handler (the
    // real stderr writer) is installed only here, in the main process.
    let bus = logging_bus::LoggingBus::start(ui.get_stderr_writer());

    let directive = Directive::from_str(opts.log_level.as_directive())
        .expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(bus.handle())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    let outcome = real_main(ui, opts).await;
    if let Err(err) = &outcome {
        error!("{err:#}");
    }

    // Shut down the bus last, so every record emitted during the run (up to
    // and including the error/interrupt that ended it) is flushed before we
    // exit.
    tokio::task::spawn_blocking(move || bus.shutdown())
        .await
        .ok();

    match outcome {
        Ok(RunOutcome::Completed) => ExitCode::SUCCESS,
        Ok(RunOutcome::Interrupted) => ExitCode::from(130),
        Err(_) => ExitCode::from(1),
    }
}

/// How a run ended, distinguishing a clean finish from a user interrupt so
/// `main` can map each to its own exit code.
enum RunOutcome {
    Completed,
    Interrupted,
}

/// Our real entry point: load configuration, run the scheduler, map errors.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui, opts: Opts) -> Result<RunOutcome> {
    dotenvy::dotenv().ok();

    let config = config::Config::load(&opts.config)
        .await
        .context("invalid configuration")?;
    debug!(?config, "loaded configuration");

    // §7 Cancelled: an interrupt flips this one-shot broadcast, which the
    // scheduler observes between dispatch steps; in-flight requests are left
    // to finish but partial results for the interrupted sweep point are
    // discarded, matching spec.md's "partial Results not written".
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight requests and stopping");
            let _ = cancel_tx.send(true);
        }
    });

    let scheduler = scheduler::Scheduler::new(config);
    match scheduler.run(&ui, cancel_rx).await? {
        scheduler::RunStatus::Completed => Ok(RunOutcome::Completed),
        scheduler::RunStatus::Cancelled => Ok(RunOutcome::Interrupted),
    }
}
