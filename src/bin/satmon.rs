use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use satmon::config::{
    read_config_file, MonitorContext, MonitorOptions, ReportOptions, default_monitor_port,
};
use satmon::keyring::Keyring;
use satmon::monitor;
use satmon::registry::DEFAULT_REGISTRY_URL;
use satmon::samplers::Sampler;
use tokio::sync::watch;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "satmon", about = "Satellite DVB-S2 receiver monitoring")]
struct Cli {
    /// Configuration directory
    #[arg(long, global = true)]
    cfg_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Monitor the configured receiver
    Monitor(MonitorArgs),
}

#[derive(Debug, Clone, Args)]
struct MonitorArgs {
    /// Save receiver logs on a file
    #[arg(long)]
    log_file: bool,

    /// Print receiver logs line-by-line rather than repeatedly on the same
    /// line
    #[arg(long)]
    log_scrolling: bool,

    /// Logging interval in seconds
    #[arg(long, default_value_t = 1.0)]
    log_interval: f64,

    /// Run HTTP server to reply the receiver status
    #[arg(long)]
    monitoring_server: bool,

    /// Monitoring server's port
    #[arg(long, default_value_t = default_monitor_port())]
    monitoring_port: u16,

    /// Report receiver metrics to a remote server
    #[arg(long)]
    report: bool,

    /// Destination address in http(s)://host:port format
    #[arg(long, default_value = DEFAULT_REGISTRY_URL)]
    report_dest: String,

    /// Reporter's hostname
    #[arg(long)]
    report_hostname: Option<String>,

    /// Passphrase to the receiver key; prompted for when omitted
    #[arg(long)]
    report_passphrase: Option<String>,

    /// Print logs in UTC time
    #[arg(long)]
    utc: bool,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("satmon", LevelFilter::DEBUG),
        ("tower_http", LevelFilter::WARN),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

fn default_cfg_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".satmon")
}

fn prompt(message: &str) -> anyhow::Result<String> {
    print!("{message}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Load (or bootstrap) and unlock the receiver keyring.
fn open_keyring(ctx: &MonitorContext, passphrase: Option<String>) -> anyhow::Result<Arc<Keyring>> {
    let path = ctx.keyring_path();

    if path.exists() {
        let mut keyring = Keyring::load(&path)?;
        let passphrase = match passphrase {
            Some(passphrase) => passphrase,
            None => prompt("Passphrase to the receiver key: ")?,
        };
        keyring.unlock(&passphrase)?;
        Ok(Arc::new(keyring))
    } else {
        info!("no receiver key found; generating one");
        let passphrase = match passphrase {
            Some(passphrase) => passphrase,
            None => prompt("Passphrase to protect the new receiver key: ")?,
        };
        let keyring = Keyring::generate(&path, &passphrase)?;
        info!("receiver key fingerprint: {}", keyring.fingerprint());
        Ok(Arc::new(keyring))
    }
}

async fn run_monitor(cfg_dir: PathBuf, args: MonitorArgs) -> Result<(), ExitCode> {
    let config = read_config_file(&cfg_dir).map_err(|e| {
        error!("{e:#}");
        ExitCode::from(1)
    })?;

    let options = MonitorOptions {
        log_file: args.log_file,
        scrolling: args.log_scrolling,
        echo: true,
        log_interval: std::time::Duration::from_secs_f64(args.log_interval),
        utc: args.utc,
        server: args.monitoring_server,
        port: args.monitoring_port,
        report: args.report.then(|| ReportOptions {
            dest: args.report_dest.clone(),
            registry: args.report_dest == DEFAULT_REGISTRY_URL,
            hostname: args.report_hostname.clone(),
            passphrase: args.report_passphrase.clone(),
        }),
    };

    let ctx = MonitorContext::new(cfg_dir, config, options);

    // The keyring is only needed when reporting to the registry.
    let keyring = match &ctx.options.report {
        Some(opts) if opts.registry => Some(
            open_keyring(&ctx, opts.passphrase.clone()).map_err(|e| {
                error!("{e:#}");
                ExitCode::from(1)
            })?,
        ),
        _ => None,
    };

    let sampler = Sampler::from_context(&ctx).await.map_err(|e| {
        error!("{e:#}");
        ExitCode::from(1)
    })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStopping...");
            let _ = shutdown_tx.send(true);
        }
    });

    monitor::run(ctx, sampler, keyring, shutdown_rx)
        .await
        .map_err(|e| {
            error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        })
}

#[tokio::main]
async fn main() -> ExitCode {
    init();
    let cli = Cli::parse();
    trace!("started with args: {cli:?}");

    let cfg_dir = cli.cfg_dir.unwrap_or_else(default_cfg_dir);

    let result = match cli.command {
        Command::Monitor(args) => run_monitor(cfg_dir, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
