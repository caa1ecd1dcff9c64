//! relayd
//!
//! Multi-tenant transparent TCP relay. Accepts connections on configured
//! listen endpoints, opens an outbound connection per accepted client
//! (optionally bound to a source address), and forwards bytes in both
//! directions until both halves close.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use relayd::config::{self, Args};
use relayd::logging;
use relayd::server::RelayServer;

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.file.as_deref(), args.verbose)?;

    let tuples = config::tuples_from_args(&args).context("invalid relay configuration")?;
    for tuple in &tuples {
        info!(
            listen = %tuple.listen,
            src = ?tuple.src,
            dst = %tuple.dst,
            "Relay configured"
        );
    }

    let server = RelayServer::bind(tuples, args.workers).context("failed to start relay")?;
    info!(workers = args.workers.max(1), "Starting relay");
    server.run().context("relay terminated abnormally")?;
    Ok(())
}
