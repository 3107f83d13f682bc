use clap::Parser;

use drbfire::tunnel::Role;

#[derive(Debug, Parser)]
#[command(
    name = "drbfire",
    version,
    about = "drbfire - NAT rendezvous tunnel for reaching peers behind a firewall"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses DRBFIRE_CONFIG; then auto-detects drbfire.toml > drbfire.yaml > drbfire.yml from CWD; then falls back to the OS default path (Linux: /etc/drbfire/drbfire.toml; others: user config dir).
    #[arg(long, env = "DRBFIRE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Which side of the firewall this process is on (overrides tunnel.role).
    #[arg(long)]
    role: Option<Role>,

    /// Tunnel uri, e.g. drbfire://0.0.0.0:7000 (overrides tunnel.uri).
    #[arg(long)]
    uri: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    drbfire::run(drbfire::app::CliOverrides {
        config: cli.config,
        role: cli.role,
        uri: cli.uri,
    })
    .await
}
