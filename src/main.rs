mod apps;
mod auth;
mod capacity;
mod channels;
mod config;
mod error;
mod origin;
mod protocol;
mod replication;
mod runtime;
mod server;
mod session;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use apps::{AppDirectory, StaticAppDirectory};
use clap::{Args, Parser, Subcommand};
use config::{Config, EmptyOriginList, ReplicationDriver};
use protocol::SocketId;
use replication::Topic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Pusher-protocol websocket gateway")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "PUSHER_GW_CONFIG",
        default_value = "pusher-gateway.toml"
    )]
    config: PathBuf,

    /// Override the websocket bind address.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "PUSHER_GW_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the gateway.
    Run,
    /// Validate the config and print deterministic diagnostics.
    Doctor(DoctorArgs),
    /// Print the replication key for an app or app channel.
    Topic(TopicArgs),
    /// Sign a private/presence channel auth string with an app's secret.
    SignAuth(SignAuthArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct TopicArgs {
    #[arg(long = "app-id")]
    app_id: String,
    #[arg(long)]
    channel: Option<String>,
    /// Namespace to use instead of `replication.namespace`.
    #[arg(long)]
    namespace: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct SignAuthArgs {
    #[arg(long = "app-id")]
    app_id: String,
    #[arg(long = "socket-id")]
    socket_id: String,
    #[arg(long)]
    channel: String,
    /// Presence member JSON, signed verbatim.
    #[arg(long = "channel-data")]
    channel_data: Option<String>,
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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => run_gateway(cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args),
        CliCommand::Topic(args) => run_topic(&cli.config, args),
        CliCommand::SignAuth(args) => run_sign_auth(&cli.config, args).await,
    }
}

async fn run_gateway(cli: Cli) -> Result<()> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref());
    cfg.validate()?;
    runtime::GatewayRuntime::new(cfg).run().await
}

fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, config_path);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn run_topic(config_path: &Path, args: TopicArgs) -> Result<()> {
    let namespace = match args.namespace {
        Some(namespace) => namespace,
        None => Config::load(config_path)?.replication.namespace,
    };
    println!("{}", topic_key(&namespace, &args.app_id, args.channel.as_deref()));
    Ok(())
}

fn topic_key(namespace: &str, app_id: &str, channel: Option<&str>) -> String {
    match channel {
        Some(channel) => Topic::channel(app_id, channel).key(namespace),
        None => Topic::app(app_id).key(namespace),
    }
}

async fn run_sign_auth(config_path: &Path, args: SignAuthArgs) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let app = StaticAppDirectory::from_config(&cfg.apps)
        .find_by_id(&args.app_id)
        .await
        .with_context(|| format!("no app with id `{}` in {}", args.app_id, config_path.display()))?;
    let auth = auth::sign_channel_auth(
        &app,
        &SocketId::from(args.socket_id.trim()),
        args.channel.trim(),
        args.channel_data.as_deref(),
    )?;
    println!("{auth}");
    Ok(())
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
) -> DoctorReport {
    let mut checks = Vec::new();
    let mut config = None;

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: format!("loaded {}", config_path.display()),
                detail: None,
            });
            config = Some(cfg);
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    if let Some(cfg) = config.as_ref() {
        checks.push(DoctorCheck {
            id: "replication.driver".to_owned(),
            status: "pass".to_owned(),
            message: format!("{:?}", cfg.replication.driver),
            detail: Some(match cfg.replication.driver {
                ReplicationDriver::Local => "single process, in-memory counters".to_owned(),
                ReplicationDriver::Redis => format!("shared store {}", cfg.replication.redis_url),
            }),
        });

        checks.push(DoctorCheck {
            id: "apps.configured".to_owned(),
            status: if cfg.apps.is_empty() { "warn" } else { "pass" }.to_owned(),
            message: format!("{} app(s)", cfg.apps.len()),
            detail: cfg
                .apps
                .is_empty()
                .then(|| "every connection will be refused with 4001".to_owned()),
        });

        let open_apps = cfg
            .apps
            .iter()
            .filter(|app| app.allowed_origins.iter().all(|entry| entry.trim().is_empty()))
            .map(|app| app.id.clone())
            .collect::<Vec<_>>();
        if !open_apps.is_empty() {
            let policy = cfg.server.empty_origin_list;
            checks.push(DoctorCheck {
                id: "apps.allowed_origins".to_owned(),
                status: "warn".to_owned(),
                message: match policy {
                    EmptyOriginList::AllowAny => "apps without origins accept any origin",
                    EmptyOriginList::DenyAll => "apps without origins refuse every origin",
                }
                .to_owned(),
                detail: Some(open_apps.join(",")),
            });
        }
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
