use anyhow::{Context, Result};
use clap::Parser;
use clap::error::ErrorKind;
use rabbitrelay_server::relay::{
    ShutdownCoordinator, spawn_reporter, spawn_termination_listener, termination_signal,
};
use rabbitrelay_server::{
    AmqpClient, DEFAULT_CONFIG_FILE, LogFormat, LoggingConfig, RelayConfiguration, RelayContext,
};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rabbitrelay")]
#[command(
    about = "Relay messages from a RabbitMQ server (master) to one or more slave RabbitMQ servers",
    long_about = None
)]
struct Args {
    /// Alternate configuration file
    #[arg(
        short = 'c',
        long = "configFile",
        alias = "configfile",
        default_value = DEFAULT_CONFIG_FILE
    )]
    config_file: PathBuf,

    /// Display detailed usage message
    #[arg(short = 'u', long = "usage")]
    usage: bool,

    /// Enable profiling output
    #[arg(short = 'p', long = "profile")]
    profile: bool,
}

fn display_usage() {
    println!("rabbitrelay (rabbitrelaygo)");
    println!("usage: rabbitrelay [-c configFile] [-u usage]");
    println!();
    println!("A utility program to relay messages from a RabbitMQ Server (master) to one or");
    println!("more slave RabbitMQ Servers");
    println!();
    println!("optional arguments:");
    println!();
    println!("\t-h, --help            show this help message and exit.");
    println!("\t-p, --profile         enable profiling output");
    println!("\t-c=CONFIGFILE, --configfile=CONFIGFILE");
    println!("\t\tValid path to alternate config file. Default filename is ./rabbitrelaygo.cfg");
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG overrides the configured level
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(_) => {
            display_usage();
            std::process::exit(1);
        }
    };

    if args.usage {
        display_usage();
        return Ok(());
    }

    // Logging settings live in the configuration file, so it is read before
    // the subscriber exists and its errors are reported again below
    let config = RelayConfiguration::from_file(&args.config_file);
    let logging = config
        .as_ref()
        .map(|config| config.relay.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging);

    info!("Starting RabbitRelay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "RabbitRelay: reading configuration from: {}",
        args.config_file.display()
    );

    let (ctx, coordinator) = match config {
        Ok(config) => {
            let ctx = RelayContext::start(&AmqpClient, &config).await;

            if args.profile {
                println!("Profiling is enabled.");
                let _reporter = spawn_reporter(ctx.stats(), config.relay.stats_interval());
            }

            (ctx, ShutdownCoordinator::new(config.relay.shutdown))
        }
        Err(e) => {
            error!("Error reading/parsing configuration file: {}", e);
            println!("Error reading/parsing configuration file: {}", e);
            (RelayContext::default(), ShutdownCoordinator::default())
        }
    };

    let stats = ctx.stats();
    info!("Consumer started, waiting for messages to publish.");
    println!("Waiting for messages to publish.  Press Ctrl-C to exit");

    let done = spawn_termination_listener(ctx, coordinator, termination_signal());
    let report = done
        .await
        .context("termination listener ended without completing shutdown")?;

    info!(
        cancelled = report.cancelled,
        completed = report.completed,
        forced = report.forced,
        consumer_aborted = report.consumer_aborted,
        "Shutdown complete"
    );
    stats.snapshot().log();

    Ok(())
}
