use clap::Parser;
use tracing::{error, info};
use zetkv::{Config, Server};

#[derive(Parser, Debug)]
#[command(author, version, about = "In-memory key-value server", long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Idle connection timeout in milliseconds
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(idle) = args.idle_timeout_ms {
        config.idle_timeout_ms = idle;
    }
    if args.config.is_none() {
        config.log_level = args.log_level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(format!("zetkv={}", config.log_level))
        .init();

    info!(
        "starting zetkv v{} on {}:{}",
        zetkv::VERSION,
        config.bind_addr,
        config.port
    );

    let mut server = Server::new(&config)?;
    if let Err(e) = server.run() {
        error!(error = %e, "server failed");
        return Err(e.into());
    }
    Ok(())
}
