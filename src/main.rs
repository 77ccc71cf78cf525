mod backoff;
mod bus;
mod config;
mod error;
mod events;
mod gateway_server;
mod router;
mod runtime;
mod session;
mod topic;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bus::{BusClient, MessageBus};
use clap::{Args, Parser, Subcommand};
use config::Config;
use events::EventKind;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Hermes MQTT to websocket event gateway")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "HERMES_WS_CONFIG",
        default_value = "hermes-ws-gateway.toml"
    )]
    config: PathBuf,

    /// Override the MQTT broker host.
    #[arg(long, global = true, env = "HERMES_WS_MQTT_HOST")]
    mqtt_host: Option<String>,

    /// Override the MQTT broker port.
    #[arg(long, global = true, env = "HERMES_WS_MQTT_PORT")]
    mqtt_port: Option<u16>,

    /// Override the websocket listen address.
    #[arg(long, global = true, env = "HERMES_WS_BIND")]
    bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "HERMES_WS_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the gateway until ctrl-c.
    Run,
    /// Validate configuration and probe the broker.
    Doctor(DoctorArgs),
    /// Publish one message to the bus.
    Publish(PublishArgs),
    /// List websocket paths and the bus filters behind them.
    Paths(PathsArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
    /// Do not try to connect to the broker.
    #[arg(long)]
    skip_broker: bool,
}

#[derive(Debug, Clone, Args)]
struct PublishArgs {
    #[arg(long)]
    topic: String,
    /// Sent verbatim as the message body.
    #[arg(long, default_value = "")]
    payload: String,
}

#[derive(Debug, Clone, Args, Default)]
struct PathsArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PathEntry {
    path: String,
    bus_filter: String,
    delivers: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_gateway(&cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli, args).await,
        CliCommand::Publish(args) => run_publish(&cli, args).await,
        CliCommand::Paths(args) => run_paths(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(
        cli.mqtt_host.as_deref(),
        cli.mqtt_port,
        cli.bind.as_deref(),
    )?;
    Ok(cfg)
}

async fn run_gateway(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    runtime::GatewayRuntime::new(cfg).run().await
}

async fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli).map_err(|err| format!("{err:#}"));
    let broker = match (&config_result, args.skip_broker) {
        (Ok(cfg), false) => Some(probe_broker(cfg).await),
        _ => None,
    };
    let bind = match &config_result {
        Ok(cfg) => Some(probe_bind(&cfg.server.bind).await),
        Err(_) => None,
    };
    let report = build_doctor_report(config_result, &cli.config, broker, bind);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

async fn probe_broker(cfg: &Config) -> std::result::Result<(), String> {
    let bus = BusClient::connect(&cfg.mqtt)
        .await
        .map_err(|err| err.to_string())?;
    bus.shutdown().await;
    Ok(())
}

async fn probe_bind(bind: &str) -> std::result::Result<(), String> {
    tokio::net::TcpListener::bind(bind)
        .await
        .map(drop)
        .map_err(|err| err.to_string())
}

async fn run_publish(cli: &Cli, args: PublishArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let bus = BusClient::connect(&cfg.mqtt).await.with_context(|| {
        format!(
            "failed connecting to MQTT broker {}:{}",
            cfg.mqtt.host, cfg.mqtt.port
        )
    })?;
    let outcome = bus
        .publish(&args.topic, args.payload.into_bytes())
        .await
        .with_context(|| format!("failed publishing to {}", args.topic));
    bus.shutdown().await;
    outcome?;
    println!("published to {}", args.topic);
    Ok(())
}

fn run_paths(cli: &Cli, args: PathsArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let entries = websocket_paths(&cfg);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for entry in &entries {
        println!("{:<28} <- {:<28} {}", entry.path, entry.bus_filter, entry.delivers);
    }
    Ok(())
}

fn websocket_paths(cfg: &Config) -> Vec<PathEntry> {
    let base = cfg.server.base_path.trim_end_matches('/');
    let mut entries = EventKind::ALL
        .into_iter()
        .map(|kind| PathEntry {
            path: format!("{base}/events/{}", kind.as_str()),
            bus_filter: cfg.topics.pattern(kind).to_owned(),
            delivers: match kind {
                EventKind::Text => "transcriptions",
                EventKind::Intent => "recognized intents",
                EventKind::Wake => "wake word detections",
            },
        })
        .collect::<Vec<_>>();
    entries.push(PathEntry {
        path: format!("{base}/mqtt/{{topic}}"),
        bus_filter: "{topic} (percent-encode '#' as %23)".to_owned(),
        delivers: "raw {topic, payload} messages",
    });
    entries
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    broker: Option<std::result::Result<(), String>>,
    bind: Option<std::result::Result<(), String>>,
) -> DoctorReport {
    let mut checks = Vec::new();

    match &config_result {
        Ok(_) => checks.push(DoctorCheck {
            id: "config.load".to_owned(),
            status: "pass".to_owned(),
            message: if config_path.exists() {
                format!("loaded {}", config_path.display())
            } else {
                format!("{} not found; using defaults", config_path.display())
            },
            detail: None,
        }),
        Err(err) => checks.push(DoctorCheck {
            id: "config.load".to_owned(),
            status: "fail".to_owned(),
            message: format!("failed to load {}", config_path.display()),
            detail: Some(err.clone()),
        }),
    }

    if let Ok(cfg) = &config_result {
        let broker_addr = format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port);
        checks.push(match broker {
            Some(Ok(())) => DoctorCheck {
                id: "mqtt.broker".to_owned(),
                status: "pass".to_owned(),
                message: format!("connected to {broker_addr}"),
                detail: None,
            },
            Some(Err(err)) => DoctorCheck {
                id: "mqtt.broker".to_owned(),
                status: "fail".to_owned(),
                message: format!("cannot reach {broker_addr}"),
                detail: Some(err),
            },
            None => DoctorCheck {
                id: "mqtt.broker".to_owned(),
                status: "warn".to_owned(),
                message: format!("skipped probing {broker_addr}"),
                detail: None,
            },
        });

        if let Some(bind) = bind {
            checks.push(DoctorCheck {
                id: "server.bind".to_owned(),
                status: if bind.is_ok() { "pass" } else { "warn" }.to_owned(),
                message: cfg.server.bind.clone(),
                detail: bind.err(),
            });
        }

        checks.push(DoctorCheck {
            id: "server.site_ids".to_owned(),
            status: "pass".to_owned(),
            message: if cfg.server.site_ids.is_empty() {
                "all sites".to_owned()
            } else {
                cfg.server.site_ids.join(",")
            },
            detail: None,
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
