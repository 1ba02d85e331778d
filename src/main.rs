use clap::Parser;
use dbgproxy_rs::{config::Config, server::DbgpProxyServer, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "dbgproxy-rs")]
#[command(about = "A DBGp debugging proxy that relays engine sessions to remote viewers")]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    engine_host: String,

    #[arg(short = 'p', long, default_value = "9000")]
    engine_port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    relay_host: String,

    #[arg(short = 'r', long, default_value = "9021")]
    relay_port: u16,

    #[arg(long)]
    namespace: Option<String>,

    #[arg(long, value_delimiter = ',')]
    allow_address: Option<Vec<String>>,

    #[arg(long, value_delimiter = ',')]
    allow_idekey: Option<Vec<String>>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting dbgproxy-rs");

    // Load configuration
    let mut config = if let Some(config_path) = cli.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    config.engine_host = cli.engine_host;
    config.engine_port = Some(cli.engine_port);
    config.relay_host = cli.relay_host;
    config.relay_port = Some(cli.relay_port);
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if cli.allow_address.is_some() {
        config.allowed_addresses = cli.allow_address;
    }
    if cli.allow_idekey.is_some() {
        config.allowed_ide_keys = cli.allow_idekey;
    }

    // Create and run the server
    let server = DbgpProxyServer::new(config)?;
    server.run().await?;

    Ok(())
}
