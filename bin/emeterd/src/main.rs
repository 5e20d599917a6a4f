//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the emeter daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser};
use emeter_common::{init_tracing, period_length, AppConfig, ReportZone};
use emeter_core::{run_ingest, CancellableWait, EnergyAccumulator, WaitOutcome};
use emeter_metrics::{new_registry, spawn_http_server, MeterMetrics};
use emeter_msg::{EventSource, MqttEventSource, ReplayEventSource, TopicRouter};
use emeter_persistence::{PersistenceMetrics, ReportLogWriter};
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Integrates MQTT power readings into 15-minute kWh reports",
    long_about = None
)]
struct Cli {
    #[arg(short = 'b', long = "broker", value_name = "HOST", help = "MQTT broker host")]
    broker: Option<String>,

    #[arg(short = 'p', long, value_name = "PORT", help = "MQTT broker port")]
    port: Option<u16>,

    #[arg(short = 'u', long = "user", value_name = "USER", help = "MQTT user name")]
    user: Option<String>,

    #[arg(
        short = 'P',
        long,
        value_name = "PASSWORD",
        env = "EMETER_PASSWORD",
        hide_env_values = true,
        help = "MQTT password"
    )]
    password: Option<String>,

    #[arg(short = 'd', long, action = ArgAction::SetTrue, help = "Log every integrated sample")]
    debug: bool,

    #[arg(short = 'v', long, action = ArgAction::SetTrue, help = "Log messages on other topics")]
    verbose: bool,

    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Recompute a report from recorded events instead of connecting to the broker"
    )]
    replay: Option<PathBuf>,

    #[arg(long, value_name = "ZONE", help = "Report zone: local, utc, or +HH:MM")]
    timezone: Option<ReportZone>,

    #[arg(value_name = "PREFIX", help = "Report file prefix; the period label and .txt are appended")]
    output_prefix: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.broker {
            config.broker.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.broker.port = port;
        }
        if let Some(user) = &self.user {
            config.broker.username = Some(user.clone());
        }
        if let Some(password) = &self.password {
            config.broker.password = Some(password.clone());
        }
        if let Some(zone) = self.timezone {
            config.meter.timezone = zone;
        }
        if let Some(prefix) = &self.output_prefix {
            config.meter.output_prefix = prefix.clone();
        }
        config.meter.debug |= self.debug;
        config.meter.verbose |= self.verbose;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/emeterd.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    cli.apply(&mut config);
    config.validate()?;

    let directive = if config.meter.debug { "debug" } else { "info" };
    init_tracing("emeterd", &config.logging, directive)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file; using defaults and command-line settings"),
    }

    let result = run_daemon(config, cli.replay).await;
    if let Err(err) = &result {
        error!(error = %format!("{err:#}"), "emeterd stopped with a fatal error");
    }
    result
}

async fn run_daemon(config: AppConfig, replay: Option<PathBuf>) -> Result<()> {
    let registry = new_registry();
    let meter_metrics = MeterMetrics::new(registry.clone())?;
    let persistence_metrics = Arc::new(PersistenceMetrics::new(registry.clone())?);
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry, config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    // Replays are anchored on the recording's first arrival, live runs on now.
    let (source, start) = match &replay {
        Some(path) => {
            let mut source = ReplayEventSource::open(path)
                .await
                .with_context(|| format!("unable to open recording {}", path.display()))?;
            let start = source.peek_arrival().await?.unwrap_or_else(Utc::now);
            (Box::new(source) as Box<dyn EventSource>, start)
        }
        None => {
            let source = MqttEventSource::from_config(&config.broker)?;
            (Box::new(source) as Box<dyn EventSource>, Utc::now())
        }
    };

    let zone = config.meter.timezone;
    let bound = zone.align_up(start);
    let path = report_path(
        &config.meter.output_prefix,
        &zone.label(bound - period_length()),
    );
    let writer = ReportLogWriter::create(&path)
        .with_context(|| format!("unable to create report log {}", path.display()))?
        .with_metrics(persistence_metrics);
    info!(
        path = %path.display(),
        first_bound = %zone.label(bound),
        zone = %zone,
        source = source.name(),
        "report log opened"
    );

    let (wait, termination) = CancellableWait::new();
    let accumulator = EnergyAccumulator::new(writer, zone, bound)?
        .with_termination(termination)
        .with_metrics(meter_metrics);
    let router = TopicRouter::new(config.meter.power_topic.clone(), config.meter.verbose);

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut ingest = tokio::spawn(async move {
        let mut source = source;
        let mut accumulator = accumulator;
        let result = run_ingest(source.as_mut(), &router, &mut accumulator, stop_rx).await;
        (accumulator, result)
    });

    println!("Press Enter to quit...");
    let finished = tokio::select! {
        outcome = wait.wait(operator_quit()) => {
            match outcome {
                WaitOutcome::OperatorQuit => info!("operator requested shutdown"),
                WaitOutcome::SignalReceived => info!("calendar month complete; shutting down"),
            }
            None
        }
        joined = &mut ingest => Some(joined),
    };
    let (accumulator, ingest_result) = match finished {
        Some(joined) => joined?,
        None => {
            let _ = stop_tx.send(());
            ingest.await?
        }
    };

    let mut writer = accumulator.into_sink();
    let closed = writer.finish();
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    let summary = ingest_result.context("ingest stopped")?;
    closed.with_context(|| format!("unable to close report log {}", path.display()))?;
    info!(
        path = %path.display(),
        records = writer.records_written(),
        readings = summary.readings,
        rejected = summary.rejected,
        stop = ?summary.stop,
        "report log closed"
    );
    Ok(())
}

/// `<prefix><label>.txt`; the prefix is a plain string prefix, not a directory.
fn report_path(prefix: &Path, label: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(label);
    name.push(".txt");
    PathBuf::from(name)
}

/// Resolves when the operator presses Enter or Ctrl-C.
///
/// A closed stdin (daemonised runs) leaves Ctrl-C and the month rollover as
/// the only ways out.
async fn operator_quit() {
    let stdin_line = async {
        match spawn_stdin_reader() {
            Ok(rx) => {
                if rx.await.is_ok() {
                    info!("quit requested on stdin");
                    return;
                }
                debug!("stdin closed; waiting for ctrl-c or month rollover");
            }
            Err(err) => warn!(error = %err, "unable to watch stdin"),
        }
        std::future::pending::<()>().await
    };

    tokio::select! {
        _ = stdin_line => {}
        received = signal::ctrl_c() => match received {
            Ok(()) => info!("ctrl-c received"),
            Err(err) => warn!(error = %err, "failed to listen for ctrl-c"),
        },
    }
}

// Blocking stdin reads cannot be cancelled; a detached thread keeps them from
// holding up runtime shutdown.
fn spawn_stdin_reader() -> std::io::Result<oneshot::Receiver<()>> {
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("emeterd-stdin".to_owned())
        .spawn(move || {
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) => {}
                Ok(_) => {
                    let _ = tx.send(());
                }
                Err(err) => warn!(error = %err, "stdin read failed"),
            }
        })?;
    Ok(rx)
}
