//! ptpd — IEEE 1588-2002 (PTP v1) ordinary clock daemon.
//!
//! One process, one port, one network interface: join the PTP subdomain's
//! multicast group, take part in the best-master-clock election, and when
//! elected slave discipline the local clock to the grandmaster. Run
//! `ptpd --help` for the option surface.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod daemon;

use cli::Cli;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => Some(config::DaemonConfig::load(path)?),
        None => None,
    };
    let opts = config::build_opts(&cli, file)?;

    daemon::run(opts)
}
