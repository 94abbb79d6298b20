//! CLI definitions for ptpd.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(
    name = "ptpd",
    version,
    about = "IEEE 1588-2002 (PTP v1) ordinary clock daemon\n\nJoins the subdomain's multicast group, runs the best-master-clock election, and\nwhen elected slave drives the system or NIC clock to track the grandmaster.",
    long_about = None
)]
pub struct Cli {
    /// Path to an optional ptpd.toml config file; flags override it
    #[clap(long, short)]
    pub config: Option<PathBuf>,

    /// Bind to this network interface (default: first eligible)
    #[clap(long, short = 'i')]
    pub interface: Option<String>,

    /// PTP subdomain name; selects the multicast group
    #[clap(long)]
    pub subdomain: Option<String>,

    /// Never run as master
    #[clap(long)]
    pub slave_only: bool,

    /// Never slew the clock (monitor only)
    #[clap(long)]
    pub no_adjust: bool,

    /// Never step the clock
    #[clap(long)]
    pub no_reset_clock: bool,

    /// Time source: system, nic, both, system-assisted, system-kernel-hw,
    /// system-kernel-sw or nic-only
    #[clap(long)]
    pub time: Option<String>,

    /// PI servo proportional attenuation
    #[clap(long)]
    pub ap: Option<i32>,

    /// PI servo integral attenuation
    #[clap(long)]
    pub ai: Option<i32>,

    /// One-way delay filter stiffness (0-6)
    #[clap(long = "delay-stiffness", short = 's')]
    pub delay_stiffness: Option<i16>,

    /// Inbound latency calibration in nanoseconds, subtracted from receive
    /// timestamps
    #[clap(long)]
    pub inbound_latency: Option<i32>,

    /// Outbound latency calibration in nanoseconds, added to transmit
    /// timestamps
    #[clap(long)]
    pub outbound_latency: Option<i32>,

    /// Print per-update statistics in this format: plain, csv or json
    #[clap(long)]
    pub stats: Option<String>,

    /// Additionally send every outgoing message unicast to this address
    #[clap(long)]
    pub unicast: Option<Ipv4Addr>,

    /// log2 seconds between Syncs when master (-2..=4)
    #[clap(long)]
    pub sync_interval: Option<i8>,

    /// Stratum advertised in the default data set
    #[clap(long)]
    pub stratum: Option<u8>,

    /// Clock identifier code string (DFLT, ATOM, GPS, NTP, HAND, INIT)
    #[clap(long)]
    pub identifier: Option<String>,

    /// log2-scaled clock variance advertised in the default data set
    #[clap(long)]
    pub variance: Option<i16>,

    /// Mark this clock preferred in the election
    #[clap(long)]
    pub preferred: bool,

    /// Set the half-epoch bit when converting timestamps
    #[clap(long)]
    pub half_epoch: bool,
}
