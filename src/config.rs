//! `ptpd.toml` configuration.
//!
//! Every field is optional; the file provides defaults and explicit CLI
//! flags override it. The merged result is the port's `RunTimeOpts`.

use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use ptp_core::config::clock_identifier_bytes;
use ptp_core::time::TimeInternal;
use ptp_core::{RunTimeOpts, StatsFormat, TimeMode};
use serde::Deserialize;

use crate::cli::Cli;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    pub interface: Option<String>,
    pub subdomain: Option<String>,
    #[serde(default)]
    pub slave_only: bool,
    #[serde(default)]
    pub no_adjust: bool,
    #[serde(default)]
    pub no_reset_clock: bool,
    pub time: Option<String>,
    pub ap: Option<i32>,
    pub ai: Option<i32>,
    pub delay_stiffness: Option<i16>,
    pub inbound_latency: Option<i32>,
    pub outbound_latency: Option<i32>,
    pub stats: Option<String>,
    pub unicast: Option<Ipv4Addr>,
    pub sync_interval: Option<i8>,
    pub stratum: Option<u8>,
    pub identifier: Option<String>,
    pub variance: Option<i16>,
    #[serde(default)]
    pub preferred: bool,
    #[serde(default)]
    pub half_epoch: bool,
    pub max_foreign_records: Option<usize>,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }
}

/// Merge defaults ← config file ← CLI flags into the port options.
pub fn build_opts(cli: &Cli, file: Option<DaemonConfig>) -> Result<RunTimeOpts> {
    let file = file.unwrap_or_default();
    let mut opts = RunTimeOpts::default();

    if let Some(iface) = cli.interface.clone().or(file.interface) {
        opts.iface_name = iface;
    }
    if let Some(subdomain) = cli.subdomain.clone().or(file.subdomain) {
        opts.subdomain_name = subdomain;
    }
    opts.slave_only = cli.slave_only || file.slave_only;
    opts.no_adjust = cli.no_adjust || file.no_adjust;
    opts.no_reset_clock = cli.no_reset_clock || file.no_reset_clock;

    if let Some(time) = cli.time.clone().or(file.time) {
        opts.time = time.parse::<TimeMode>().map_err(anyhow::Error::msg)?;
    }
    if let Some(ap) = cli.ap.or(file.ap) {
        opts.ap = ap;
    }
    if let Some(ai) = cli.ai.or(file.ai) {
        opts.ai = ai;
    }
    if let Some(s) = cli.delay_stiffness.or(file.delay_stiffness) {
        anyhow::ensure!((0..=6).contains(&s), "delay stiffness must be 0..=6, got {s}");
        opts.s = s;
    }
    if let Some(ns) = cli.inbound_latency.or(file.inbound_latency) {
        opts.inbound_latency = TimeInternal::new(0, ns);
    }
    if let Some(ns) = cli.outbound_latency.or(file.outbound_latency) {
        opts.outbound_latency = TimeInternal::new(0, ns);
    }
    if let Some(stats) = cli.stats.clone().or(file.stats) {
        opts.stats = Some(stats.parse::<StatsFormat>().map_err(anyhow::Error::msg)?);
    }
    opts.unicast_address = cli.unicast.or(file.unicast);
    if let Some(interval) = cli.sync_interval.or(file.sync_interval) {
        anyhow::ensure!(
            (-2..=4).contains(&interval),
            "sync interval must be -2..=4 (log2 seconds), got {interval}"
        );
        opts.sync_interval = interval;
    }
    if let Some(stratum) = cli.stratum.or(file.stratum) {
        opts.clock_stratum = stratum;
    }
    if let Some(identifier) = cli.identifier.clone().or(file.identifier) {
        opts.clock_identifier = clock_identifier_bytes(&identifier);
    }
    if let Some(variance) = cli.variance.or(file.variance) {
        opts.clock_variance = variance;
    }
    opts.clock_preferred = cli.preferred || file.preferred;
    opts.half_epoch = cli.half_epoch || file.half_epoch;
    if let Some(max) = file.max_foreign_records {
        anyhow::ensure!(max >= 1, "max_foreign_records must be at least 1");
        opts.max_foreign_records = max;
    }

    Ok(opts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_overrides_file() {
        let cli = Cli::parse_from(["ptpd", "--stratum", "2", "--time", "system"]);
        let file = DaemonConfig {
            stratum: Some(10),
            ap: Some(7),
            time: Some("nic".into()),
            ..DaemonConfig::default()
        };
        let opts = build_opts(&cli, Some(file)).unwrap();
        assert_eq!(opts.clock_stratum, 2);
        assert_eq!(opts.ap, 7); // file value survives where the CLI is silent
        assert_eq!(opts.time, TimeMode::System);
    }

    #[test]
    fn test_rejects_bad_values() {
        let cli = Cli::parse_from(["ptpd", "--delay-stiffness", "9"]);
        assert!(build_opts(&cli, None).is_err());
        let cli = Cli::parse_from(["ptpd", "--sync-interval", "7"]);
        assert!(build_opts(&cli, None).is_err());
        let cli = Cli::parse_from(["ptpd", "--time", "ntp"]);
        assert!(build_opts(&cli, None).is_err());
    }

    #[test]
    fn test_toml_round() {
        let cfg: DaemonConfig = toml::from_str(
            r#"
            interface = "eth1"
            subdomain = "_ALT1"
            slave_only = true
            time = "system-kernel-sw"
            stats = "csv"
            "#,
        )
        .unwrap();
        let cli = Cli::parse_from(["ptpd"]);
        let opts = build_opts(&cli, Some(cfg)).unwrap();
        assert_eq!(opts.iface_name, "eth1");
        assert_eq!(opts.subdomain_name, "_ALT1");
        assert!(opts.slave_only);
        assert_eq!(opts.time, TimeMode::SystemKernelSw);
        assert_eq!(opts.stats, Some(StatsFormat::Csv));
    }
}
