use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use dslink_core::NodeTree;
use dslink_link::{load_local_handshake, ConnectionManager, HttpNegotiator, Link, WebSocketConnectorFactory};
use dslink_settings::DslinkSettings;
use dslink_telemetry::{init_telemetry, TelemetryConfig};
use secrecy::SecretString;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "dslink", version, about = "DSA link and broker")]
struct Cli {
    /// Log level (overrides settings and DSLINK_LOG_LEVEL).
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to a broker and serve the demo node tree.
    Link(LinkArgs),
    /// Run a broker.
    Broker(BrokerArgs),
}

#[derive(Debug, Args)]
struct LinkArgs {
    /// Broker handshake endpoint, e.g. http://127.0.0.1:8080/conn
    #[arg(long)]
    broker: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    token: Option<String>,
}

#[derive(Debug, Args)]
struct BrokerArgs {
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = dslink_settings::load_settings().context("failed to load settings")?;
    if let Some(level) = &cli.log_level {
        settings.log_level.clone_from(level);
    }
    settings.json_logs |= cli.json_logs;

    let _ = init_telemetry(&TelemetryConfig::from_level_str(&settings.log_level, settings.json_logs));

    match cli.command {
        Command::Link(args) => run_link(settings, args).await,
        Command::Broker(args) => run_broker(settings, args).await,
    }
}

async fn run_link(mut settings: DslinkSettings, args: LinkArgs) -> anyhow::Result<()> {
    if let Some(broker) = args.broker {
        settings.broker_url = broker;
    }
    if let Some(name) = args.name {
        settings.name = name;
    }
    if args.token.is_some() {
        settings.token = args.token;
    }
    settings.validate()?;

    let local = load_local_handshake(
        &settings.resolved_key_path(),
        &settings.name,
        settings.is_requester,
        settings.is_responder,
    )
    .context("failed to load link key")?;
    tracing::info!(ds_id = %local.ds_id, broker = %settings.broker_url, "starting link");

    let negotiator = HttpNegotiator::new(&settings.broker_url, settings.token.map(SecretString::from))?;
    let connectors = WebSocketConnectorFactory::new(&settings.broker_url)?;
    let manager = ConnectionManager::new(
        local,
        Arc::new(Link::new(demo_tree()?)),
        Arc::new(negotiator),
        Arc::new(connectors),
    );
    manager.start(Some(Arc::new(|connected| {
        tracing::info!(
            is_requester = connected.is_requester,
            is_responder = connected.is_responder,
            "link ready"
        );
    })));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");
    manager.shutdown();
    Ok(())
}

/// Nodes served by the command-line link.
fn demo_tree() -> anyhow::Result<NodeTree> {
    let tree = NodeTree::new();
    let version = tree.create_path("/version")?;
    version.set_value(json!(env!("CARGO_PKG_VERSION")));

    let echo = tree.create_path("/echo")?;
    echo.set_action(Arc::new(|params| Ok(vec![json!([params.get("text").cloned().unwrap_or_default()])])));
    Ok(tree)
}

async fn run_broker(settings: DslinkSettings, args: BrokerArgs) -> anyhow::Result<()> {
    let metrics = dslink_broker::metrics::install_recorder().context("failed to install metrics recorder")?;
    let config = dslink_broker::BrokerConfig {
        host: args.host.unwrap_or(settings.broker.host),
        port: args.port.unwrap_or(settings.broker.port),
        update_interval_secs: settings.broker.update_interval_secs,
        ping_interval: Duration::from_secs(settings.broker.update_interval_secs.max(1)),
        metrics: Some(metrics),
    };
    let handle = dslink_broker::start(config).await.context("failed to start broker")?;
    tracing::info!(port = handle.port, "broker ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!(sessions = handle.broker.session_count(), "shutting down");
    Ok(())
}
