//! Run-time options for one PTP port.
//!
//! The binary crate assembles a `RunTimeOpts` from CLI flags and the optional
//! config file; the port itself only reads it.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::constants::*;
use crate::stats::StatsFormat;
use crate::time::TimeInternal;

/// Which clock the servo disciplines and where timestamps come from.
///
/// The set is closed and small, so every time-source operation switches on
/// this tag rather than going through dynamic dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeMode {
    /// System clock, software loopback timestamps.
    System,
    /// NIC hardware clock, NIC timestamps; system clock left alone.
    Nic,
    /// NIC hardware clock disciplined by PTP, system clock disciplined to the
    /// NIC by a secondary servo.
    Both,
    /// System clock disciplined, NIC provides matching system timestamps.
    SystemAssisted,
    /// System clock, kernel hardware timestamping (SO_TIMESTAMPING + NIC).
    SystemKernelHw,
    /// System clock, kernel software timestamping.
    SystemKernelSw,
    /// NIC hardware clock only, no system-time involvement at all.
    NicOnly,
}

impl TimeMode {
    /// True when TX timestamps must be fetched from the time source after
    /// sending instead of arriving on the socket (loopback or error queue).
    pub fn delayed_timing(self) -> bool {
        !matches!(
            self,
            TimeMode::System | TimeMode::SystemKernelHw | TimeMode::SystemKernelSw
        )
    }

    /// True when the NIC PTP clock hardware must be initialized.
    pub fn uses_nic(self) -> bool {
        matches!(
            self,
            TimeMode::Nic | TimeMode::Both | TimeMode::SystemAssisted | TimeMode::NicOnly
        )
    }

    /// True when the servo output is applied to the NIC clock.
    pub fn adjusts_nic(self) -> bool {
        matches!(self, TimeMode::Nic | TimeMode::Both | TimeMode::NicOnly)
    }
}

impl FromStr for TimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(TimeMode::System),
            "nic" => Ok(TimeMode::Nic),
            "both" => Ok(TimeMode::Both),
            "system-assisted" => Ok(TimeMode::SystemAssisted),
            "system-kernel-hw" => Ok(TimeMode::SystemKernelHw),
            "system-kernel-sw" => Ok(TimeMode::SystemKernelSw),
            "nic-only" => Ok(TimeMode::NicOnly),
            other => Err(format!(
                "unknown time mode '{other}' (expected system, nic, both, system-assisted, \
                 system-kernel-hw, system-kernel-sw or nic-only)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunTimeOpts {
    /// Interface to bind to; empty means "first eligible".
    pub iface_name: String,
    pub subdomain_name: String,
    pub slave_only: bool,
    /// Never slew the clock (monitor-only).
    pub no_adjust: bool,
    /// Never step the clock.
    pub no_reset_clock: bool,
    pub time: TimeMode,
    /// PI attenuation coefficients; values below 1 are coerced up.
    pub ap: i32,
    pub ai: i32,
    /// One-way-delay filter stiffness, 0..=6.
    pub s: i16,
    pub inbound_latency: TimeInternal,
    pub outbound_latency: TimeInternal,
    pub stats: Option<StatsFormat>,
    /// Optional unicast peer; every outgoing message is duplicated there.
    pub unicast_address: Option<Ipv4Addr>,
    /// log2 seconds between Syncs when master.
    pub sync_interval: i8,
    pub clock_stratum: u8,
    pub clock_identifier: [u8; PTP_CODE_STRING_LENGTH],
    pub clock_variance: i16,
    pub clock_preferred: bool,
    pub current_utc_offset: i16,
    pub half_epoch: bool,
    pub max_foreign_records: usize,
}

impl Default for RunTimeOpts {
    fn default() -> Self {
        RunTimeOpts {
            iface_name: String::new(),
            subdomain_name: DEFAULT_PTP_DOMAIN_NAME.to_string(),
            slave_only: false,
            no_adjust: false,
            no_reset_clock: false,
            time: TimeMode::System,
            ap: DEFAULT_AP,
            ai: DEFAULT_AI,
            s: DEFAULT_DELAY_S,
            inbound_latency: TimeInternal::ZERO,
            outbound_latency: TimeInternal::ZERO,
            stats: None,
            unicast_address: None,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            clock_stratum: DEFAULT_CLOCK_STRATUM,
            clock_identifier: clock_identifier_bytes(DEFAULT_CLOCK_IDENTIFIER),
            clock_variance: DEFAULT_CLOCK_VARIANCE,
            clock_preferred: false,
            current_utc_offset: DEFAULT_UTC_OFFSET,
            half_epoch: false,
            max_foreign_records: DEFAULT_MAX_FOREIGN_RECORDS,
        }
    }
}

impl RunTimeOpts {
    /// Subdomain name padded to its fixed wire width.
    pub fn subdomain_bytes(&self) -> [u8; PTP_SUBDOMAIN_NAME_LENGTH] {
        let mut out = [0u8; PTP_SUBDOMAIN_NAME_LENGTH];
        let src = self.subdomain_name.as_bytes();
        let n = src.len().min(PTP_SUBDOMAIN_NAME_LENGTH);
        out[..n].copy_from_slice(&src[..n]);
        out
    }
}

/// Pad a clock identifier code string ("DFLT", "GPS", ...) to 4 bytes.
pub fn clock_identifier_bytes(s: &str) -> [u8; PTP_CODE_STRING_LENGTH] {
    let mut out = [0u8; PTP_CODE_STRING_LENGTH];
    let src = s.as_bytes();
    let n = src.len().min(PTP_CODE_STRING_LENGTH);
    out[..n].copy_from_slice(&src[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_mode_parse() {
        assert_eq!("system".parse::<TimeMode>().unwrap(), TimeMode::System);
        assert_eq!("both".parse::<TimeMode>().unwrap(), TimeMode::Both);
        assert_eq!("system-kernel-hw".parse::<TimeMode>().unwrap(), TimeMode::SystemKernelHw);
        assert!("ntp".parse::<TimeMode>().is_err());
    }

    #[test]
    fn test_delayed_timing_split() {
        // socket-delivered timestamps: loopback and kernel errqueue modes
        assert!(!TimeMode::System.delayed_timing());
        assert!(!TimeMode::SystemKernelHw.delayed_timing());
        assert!(!TimeMode::SystemKernelSw.delayed_timing());
        // everything else polls the time source after sending
        assert!(TimeMode::Nic.delayed_timing());
        assert!(TimeMode::Both.delayed_timing());
        assert!(TimeMode::SystemAssisted.delayed_timing());
        assert!(TimeMode::NicOnly.delayed_timing());
    }

    #[test]
    fn test_subdomain_padding() {
        let opts = RunTimeOpts::default();
        let b = opts.subdomain_bytes();
        assert_eq!(&b[..5], b"_DFLT");
        assert!(b[5..].iter().all(|&x| x == 0));
    }
}
