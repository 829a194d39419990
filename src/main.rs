//! busproxy command line entry point

use busproxy::config::BusConfig;
use busproxy::observability::{init_default_logging, init_logging, metrics, LogFormat};
use busproxy::transport::memory::MemoryBroker;
use busproxy::transport::mqtt::MqttBrokerTransport;
use busproxy::{
    ConnectionFactory, EndpointAddress, HandlerError, PublishOutcome, PublisherProxy, Scheme,
    SubscriberProxy, TransportPtr,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};

/// Resilient publish/subscribe client
#[derive(Parser)]
#[command(name = "busproxy")]
#[command(about = "Publish and subscribe through a self-healing broker connection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BUSPROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish messages to the configured publisher topic
    Publish {
        /// Message bodies, one publish each
        #[arg(required = true)]
        messages: Vec<String>,

        /// Override the configured durability
        #[arg(long)]
        durable: Option<bool>,
    },
    /// Print every message received on the subscriber topic until interrupted
    Subscribe,
    /// Publish a heartbeat on every interval until interrupted
    Heartbeat {
        /// Override `transport.heartbeat_interval_secs`
        #[arg(long, value_name = "SECONDS")]
        interval: Option<u64>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish { messages, durable } => run_publish(config, messages, durable).await,
        Commands::Subscribe => run_subscribe(config).await,
        Commands::Heartbeat { interval } => run_heartbeat(config, interval).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<BusConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BusConfig::load_from_file(path)?);
    }

    for path_str in ["busproxy.toml", "config/busproxy.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BusConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create busproxy.toml".into())
}

/// Pick the transport serving the address scheme
fn select_transport(config: &BusConfig, address: &EndpointAddress) -> CliResult<TransportPtr> {
    match address.scheme() {
        Scheme::Mqtt | Scheme::Mqtts => Ok(Arc::new(MqttBrokerTransport::new(config.mqtt_settings()))),
        #[cfg(feature = "amqp")]
        Scheme::Amqp | Scheme::Amqps => Ok(Arc::new(
            busproxy::transport::amqp::AmqpBrokerTransport::new()
                .with_connection_name(config.transport.client_id_prefix.clone()),
        )),
        #[cfg(not(feature = "amqp"))]
        Scheme::Amqp | Scheme::Amqps => {
            Err("AMQP endpoints need a build with `--features amqp`".into())
        }
        Scheme::Memory => {
            warn!("Using the in-process broker; messages never leave this process");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

fn build_factory(config: &BusConfig) -> CliResult<Arc<ConnectionFactory>> {
    let address = config.endpoint_address()?;
    let transport = select_transport(config, &address)?;
    info!(broker = %address.redacted_url(), transport = transport.name(), "Broker selected");
    Ok(Arc::new(ConnectionFactory::new(transport, address)))
}

async fn run_publish(
    config: BusConfig,
    messages: Vec<String>,
    durable: Option<bool>,
) -> CliResult<()> {
    let factory = build_factory(&config)?;
    let publisher = PublisherProxy::new(factory, config.publisher_options())?;

    let mut delivered = 0usize;
    for message in messages {
        match publisher.publish(message, durable).await {
            PublishOutcome::Sent | PublishOutcome::Skipped => delivered += 1,
            outcome => warn!(?outcome, "Message not delivered"),
        }
    }
    publisher.disconnect().await;

    info!(delivered, topic = publisher.topic(), "Publish complete");
    report_metrics();
    Ok(())
}

async fn run_subscribe(config: BusConfig) -> CliResult<()> {
    let factory = build_factory(&config)?;
    let handler = |payload: &[u8]| -> Result<(), HandlerError> {
        println!("{}", String::from_utf8_lossy(payload));
        Ok(())
    };
    let subscriber = SubscriberProxy::new(factory, config.subscriber_options(), Arc::new(handler))?;

    if !subscriber.subscribe().await {
        warn!("Broker not reachable yet, will keep retrying");
    }
    info!(topic = subscriber.topic(), "Subscribed, waiting for messages");

    // Receiving is passive; poke the proxy so a lost connection is rebuilt
    let mut ticker = tokio::time::interval(config.connect_timeout());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = ticker.tick() => {
                if !subscriber.is_connected() {
                    subscriber.subscribe().await;
                }
            }
        }
    }

    subscriber.disconnect().await;
    report_metrics();
    Ok(())
}

async fn run_heartbeat(config: BusConfig, interval: Option<u64>) -> CliResult<()> {
    let period = interval
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| config.heartbeat_interval());
    if period.is_zero() {
        return Err("heartbeat interval must be positive".into());
    }

    let factory = build_factory(&config)?;
    let publisher = PublisherProxy::new(factory, config.publisher_options())?;
    info!(topic = publisher.topic(), ?period, "Heartbeat started");

    let mut ticker = tokio::time::interval(period);
    let mut sequence: u64 = 0;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                break;
            }
            _ = ticker.tick() => {
                sequence += 1;
                let beat = serde_json::json!({
                    "sequence": sequence,
                    "timestamp": chrono::Utc::now(),
                    "connection_id": publisher.connection_id(),
                });
                let outcome = publisher.publish(beat.to_string(), None).await;
                info!(sequence, ?outcome, "Heartbeat");
            }
        }
    }

    publisher.disconnect().await;
    report_metrics();
    Ok(())
}

fn handle_config_command(config: &BusConfig, show: bool) -> CliResult<()> {
    config.validate()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }
    info!("Configuration validation complete");
    Ok(())
}

async fn shutdown_signal() -> CliResult<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

fn report_metrics() {
    match serde_json::to_string(&metrics().snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "Session totals"),
        Err(e) => warn!(error = %e, "Could not render metrics"),
    }
}
