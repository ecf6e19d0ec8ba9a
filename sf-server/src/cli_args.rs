use clap::Parser;

/// Command-line overrides for the daemon; everything else comes from the
/// environment (see `ServerConfiguration`).
#[derive(Parser, Debug, Clone)]
#[command(name = "sf-server", about = "Ship-fleet manufacturing daemon")]
pub struct CliArgs {
    /// HTTP port for the daemon surface (overrides HTTP_PORT)
    #[arg(long)]
    pub port: Option<u16>,
}
