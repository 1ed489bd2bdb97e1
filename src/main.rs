//! brokerpool command line
//!
//! `config` validates a connector configuration; `simulate` drives the full provider
//! lifecycle against the in-memory driver and prints the resulting metrics.

use brokerpool::observability::{init_default_logging, init_logging, metrics, LogFormat};
use brokerpool::testing::MockConnectionFactory;
use brokerpool::{
    AckMode, BrokerFault, BrokerSession, ConnectionProvider, ConnectorConfig, ConsumerAckMode,
    ConsumerSpec, ContextKey, Destination, MessageConsumer, MessageProducer, ObserverResult,
    StaticFactorySource,
};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

/// Broker connection provider tooling
#[derive(Parser)]
#[command(name = "brokerpool")]
#[command(about = "Pooled, cached broker connections and sessions")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BROKERPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration
    Config {
        /// Print the resolved configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
    /// Run connect/use/disconnect cycles against an in-memory broker
    Simulate {
        /// Number of connect cycles
        #[arg(long, default_value_t = 2)]
        cycles: usize,

        /// Execution contexts per cycle
        #[arg(long, default_value_t = 3)]
        contexts: usize,

        /// Make the first connection attempt fail
        #[arg(long)]
        fail_first: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialise logging: {e}");
    }

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Simulate {
            cycles,
            contexts,
            fail_first,
        } => simulate(config, cycles, contexts, fail_first).await,
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ConnectorConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ConnectorConfig::load_from_file(path)?)
        }
        None => {
            for candidate in ["brokerpool.toml", "config/brokerpool.toml"] {
                let path = PathBuf::from(candidate);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ConnectorConfig::load_from_file(&path)?);
                }
            }
            info!("No configuration file found, using defaults");
            Ok(ConnectorConfig::default())
        }
    }
}

fn handle_config_command(
    config: &ConnectorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }
    info!("Configuration validation complete");
    Ok(())
}

async fn simulate(
    config: ConnectorConfig,
    cycles: usize,
    contexts: usize,
    fail_first: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let factory = Arc::new(MockConnectionFactory::named("simulated-broker"));
    if fail_first {
        factory.fail_next_creates(1);
    }

    let provider = ConnectionProvider::new(
        config,
        Arc::new(StaticFactorySource::new(factory.clone())),
    );
    provider.initialise().await?;
    info!(
        cached = provider.is_cache_enabled(),
        dialect = %provider.protocol_version(),
        "Simulation starting"
    );

    let observed = Arc::new(AtomicUsize::new(0));

    for cycle in 0..cycles {
        let connection = match provider.connect().await {
            Ok(connection) => connection,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Connect failed, retrying once");
                provider.connect().await?
            }
            Err(e) => return Err(e.into()),
        };

        let counter = observed.clone();
        connection.register_fault_observer(Arc::new(move |fault: &BrokerFault| -> ObserverResult {
            counter.fetch_add(1, Ordering::SeqCst);
            info!(fault = %fault, "Fault observed");
            Ok(())
        }));

        let validation = provider.validate(&connection).await;

        for flow in 0..contexts {
            let context = ContextKey::new(format!("cycle-{cycle}-flow-{flow}"));
            let transacted = flow % 2 == 1;
            let session = connection.session(&context, transacted, AckMode::Auto).await?;
            let producer = connection
                .create_producer(session.as_ref(), &Destination::queue("simulated.orders"))
                .await?;
            producer
                .send(Bytes::from(format!("order {cycle}/{flow}")))
                .await?;
            producer.close().await?;
            if transacted {
                session.commit().await?;
            }
            connection.release_session(&context).await;
        }

        let inbox = ContextKey::new(format!("cycle-{cycle}-inbox"));
        let session = connection
            .consumer_session(&inbox, ConsumerAckMode::Manual)
            .await?;
        let consumer = connection
            .create_consumer(
                session.as_ref(),
                &ConsumerSpec::new(Destination::queue("simulated.replies")),
            )
            .await?;
        if let Some(reply) = consumer.receive_no_wait().await? {
            info!(bytes = reply.len(), "Reply received");
        }
        connection.release_session(&inbox).await;

        factory.emit_fault(&BrokerFault::new("simulated network blip").with_code("SIM-1"));
        provider.disconnect(connection).await?;
        // suppressed: nobody is connected any more
        factory.emit_fault(&BrokerFault::new("late fault after disconnect"));

        info!(
            cycle,
            validated = validation.is_success(),
            faults_observed = observed.load(Ordering::SeqCst),
            "Cycle complete"
        );
    }

    provider.dispose().await;
    println!("{}", serde_json::to_string_pretty(&metrics().get_metrics())?);
    Ok(())
}
