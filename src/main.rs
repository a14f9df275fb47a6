use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use vault_mesh::{persist, Gateway, GatewayConfig, NetAddress};

#[derive(Parser, Debug)]
#[command(name = "vault-mesh", about = "P2P gateway node for the vault-mesh storage network")]
struct Cli {
    /// Address to listen on for peer connections.
    #[arg(long, default_value = "0.0.0.0:9981")]
    listen: String,

    /// Data directory for gateway.json, nodes.json, and gateway.log.
    /// Defaults to ~/.vault-mesh.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Peer to connect to immediately at startup.
    /// Can be specified multiple times.
    #[arg(long, short)]
    connect: Vec<String>,

    /// Skip seeding the node store with the well-known bootstrap nodes.
    /// Useful for private networks and local testing.
    #[arg(long)]
    no_bootstrap: bool,

    /// Ceiling on the total number of peer connections.
    #[arg(long, default_value = "128")]
    max_peers: usize,

    /// Target number of outbound connections to maintain.
    #[arg(long, default_value = "8")]
    max_outbound: usize,

    /// Download limit in bytes per second (0 = unlimited).
    #[arg(long)]
    max_download_speed: Option<i64>,

    /// Upload limit in bytes per second (0 = unlimited).
    #[arg(long)]
    max_upload_speed: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dir = match cli.dir {
        Some(d) => d,
        None => dirs::home_dir()
            .context("could not determine home directory; pass --dir")?
            .join(".vault-mesh"),
    };
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    // Log to stderr and to the append-only gateway.log.
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(persist::LOG_FILE))
        .with_context(|| format!("opening {}", dir.join(persist::LOG_FILE).display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vault_mesh=info".parse()?),
        )
        .with_writer(std::io::stderr.and(std::sync::Mutex::new(log_file)))
        .with_ansi(false)
        .init();

    let config = GatewayConfig {
        listen_addr: cli.listen,
        persist_dir: dir,
        bootstrap: !cli.no_bootstrap,
        max_peers: cli.max_peers,
        max_outbound_peers: cli.max_outbound,
        ..GatewayConfig::default()
    };
    let gateway = Gateway::new(config).await?;
    eprintln!("vault-mesh gateway listening on {}", gateway.address());

    if cli.max_download_speed.is_some() || cli.max_upload_speed.is_some() {
        let (down, up) = gateway.rate_limits();
        gateway.set_rate_limits(
            cli.max_download_speed.unwrap_or(down),
            cli.max_upload_speed.unwrap_or(up),
        )?;
    }

    for addr in cli.connect {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway.connect(NetAddress::new(addr.clone())).await {
                tracing::warn!("could not connect to {addr}: {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    eprintln!("shutting down");
    gateway.close().await?;
    Ok(())
}
