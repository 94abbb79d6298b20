//! NIC PTP clock control.
//!
//! The time-source variants that discipline or read the adapter clock talk
//! to the driver through a small set of interface ioctls carried in an
//! `ifreq` whose data pointer addresses a request-specific argument block.
//! Timestamp values in the argument blocks are always positive; a separate
//! +1/-1 factor carries the sign.
//!
//! The kernel net_tstamp constants used by the kernel-timestamping modes are
//! defined here as well; the libc crate does not expose them (values from
//! `<linux/net_tstamp.h>` and `<asm-generic/sockios.h>`).

use std::io;
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};

use crate::time::TimeInternal;

// Device request numbers.
const TSYNC_INIT: libc::c_ulong = 0x89f0;
const TSYNC_SYSTIME: libc::c_ulong = 0x89f1;
const TSYNC_ADJTIME: libc::c_ulong = 0x89f2;
const TSYNC_ENABLETX: libc::c_ulong = 0x89f4;
const TSYNC_DISABLETX: libc::c_ulong = 0x89f5;
const TSYNC_ENABLERX: libc::c_ulong = 0x89f8;
const TSYNC_DISABLERX: libc::c_ulong = 0x89f9;
const TSYNC_READTS: libc::c_ulong = 0x89fc;
const TSYNC_COMPARETS: libc::c_ulong = 0x89fd;

/// From <asm-generic/sockios.h>.
pub const SIOCSHWTSTAMP: libc::c_ulong = 0x89b0;

/// From <linux/net_tstamp.h>.
pub const HWTSTAMP_TX_OFF: i32 = 0;
pub const HWTSTAMP_TX_ON: i32 = 1;
pub const HWTSTAMP_FILTER_NONE: i32 = 0;
pub const HWTSTAMP_FILTER_PTP_V1_L4_SYNC: i32 = 7;
pub const HWTSTAMP_FILTER_PTP_V1_L4_DELAY_REQ: i32 = 8;

pub const SOF_TIMESTAMPING_TX_HARDWARE: i32 = 1 << 0;
pub const SOF_TIMESTAMPING_TX_SOFTWARE: i32 = 1 << 1;
pub const SOF_TIMESTAMPING_RX_HARDWARE: i32 = 1 << 2;
pub const SOF_TIMESTAMPING_RX_SOFTWARE: i32 = 1 << 3;
pub const SOF_TIMESTAMPING_SOFTWARE: i32 = 1 << 4;
pub const SOF_TIMESTAMPING_SYS_HARDWARE: i32 = 1 << 5;
pub const SOF_TIMESTAMPING_RAW_HARDWARE: i32 = 1 << 6;

/// SO_TIMESTAMPING socket option (level SOL_SOCKET).
pub const SO_TIMESTAMPING: libc::c_int = 37;

/// From <linux/net_tstamp.h> struct hwtstamp_config.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct HwTstampConfig {
    pub flags: i32,
    pub tx_type: i32,
    pub rx_filter: i32,
}

/// Which incoming event packets the NIC stamps. The single hardware slot
/// forces a choice: a master needs Delay-Req stamps, a slave needs Sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxFilterMode {
    L2V2Sync = 0,
    L2V2Delay = 1,
    UdpV1Sync = 2,
    UdpV1Delay = 3,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TsyncTime {
    seconds: libc::c_ulonglong,
    nanoseconds: libc::c_uint,
}

impl TsyncTime {
    fn to_internal(self, sign: i32) -> TimeInternal {
        TimeInternal {
            seconds: self.seconds as i32 * sign,
            nanoseconds: self.nanoseconds as i32 * sign,
        }
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TsyncSystimeArgs {
    /// In: offset to apply; out: current time.
    time: TsyncTime,
    /// <0 subtract, >0 add, =0 read only.
    negative_offset: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TsyncAdjtimeArgs {
    /// In: adjustment in ppb; out: current adjustment.
    adj: libc::c_longlong,
    /// Only apply the adjustment when non-zero.
    set_adj: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TsyncReadTsArgs {
    with_system_time: i32,
    rx_valid: i32,
    rx: TsyncTime,
    rx_sys: TsyncTime,
    source_sequence_id: u16,
    source_identity: [u8; 6],
    tx_valid: i32,
    tx: TsyncTime,
    tx_sys: TsyncTime,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct TsyncComparetsArgs {
    nic_to_system: TsyncTime,
    nic_to_system_sign: i32,
    system_to_nic: TsyncTime,
    system_to_nic_sign: i32,
}

/// One RX timestamp read off the adapter, keyed to its packet.
#[derive(Debug, Clone, Copy)]
pub struct NicRxStamp {
    pub time: TimeInternal,
    pub sequence_id: u16,
    pub source_uuid: [u8; 6],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NicTimestamps {
    pub rx: Option<NicRxStamp>,
    pub tx: Option<TimeInternal>,
}

/// Handle for issuing device requests against the bound interface. Holds a
/// borrowed fd (the event socket); the port re-creates it on every re-init.
#[derive(Debug, Clone)]
pub struct DeviceRequest {
    fd: RawFd,
    iface: String,
}

impl DeviceRequest {
    pub fn new(fd: RawFd, iface: &str) -> Self {
        DeviceRequest { fd, iface: iface.to_string() }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    fn ifreq_with_data(&self, data: *mut libc::c_char) -> libc::ifreq {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(self.iface.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_data = data;
        ifr
    }

    fn ioctl(&self, request: libc::c_ulong, data: *mut libc::c_char) -> io::Result<()> {
        let mut ifr = self.ifreq_with_data(data);
        let rc = unsafe { libc::ioctl(self.fd, request as _, &mut ifr) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// SIOCSHWTSTAMP: kernel-managed hardware timestamping (the
    /// system-kernel-hw mode); not a TSYNC request but the same ifreq shape.
    pub fn set_hwtstamp_config(&self, config: &mut HwTstampConfig) -> Result<()> {
        self.ioctl(SIOCSHWTSTAMP, config as *mut _ as *mut libc::c_char)
            .with_context(|| format!("SIOCSHWTSTAMP on {}", self.iface))
    }

    /// Initialize the adapter PTP clock hardware.
    pub fn tsync_init(&self) -> Result<()> {
        self.ioctl(TSYNC_INIT, std::ptr::null_mut())
            .with_context(|| format!("could not initialize NIC time stamping on {}", self.iface))
    }

    pub fn enable_tx(&self) -> Result<()> {
        self.ioctl(TSYNC_ENABLETX, std::ptr::null_mut())
            .with_context(|| format!("could not enable NIC send time stamping on {}", self.iface))
    }

    pub fn disable_tx(&self) -> Result<()> {
        self.ioctl(TSYNC_DISABLETX, std::ptr::null_mut())
            .with_context(|| format!("could not disable NIC send time stamping on {}", self.iface))
    }

    /// The mode travels in the data-pointer slot itself, not behind it.
    pub fn enable_rx(&self, mode: RxFilterMode) -> Result<()> {
        self.ioctl(TSYNC_ENABLERX, mode as isize as *mut libc::c_char)
            .with_context(|| format!("could not enable NIC receive time stamping on {}", self.iface))
    }

    pub fn disable_rx(&self) -> Result<()> {
        self.ioctl(TSYNC_DISABLERX, std::ptr::null_mut())
            .with_context(|| format!("could not disable NIC receive time stamping on {}", self.iface))
    }

    /// Read the adapter clock.
    pub fn systime_read(&self) -> Result<TimeInternal> {
        let mut args = TsyncSystimeArgs::default();
        self.ioctl(TSYNC_SYSTIME, &mut args as *mut _ as *mut libc::c_char)
            .with_context(|| format!("could not read NIC time on {}", self.iface))?;
        Ok(args.time.to_internal(1))
    }

    /// Shift the adapter clock by `offset`.
    pub fn systime_apply_offset(&self, offset: &TimeInternal) -> Result<()> {
        let mut args = TsyncSystimeArgs::default();
        let sign = if offset.is_negative() { -1 } else { 1 };
        args.negative_offset = sign;
        args.time.seconds = (offset.seconds * sign) as libc::c_ulonglong;
        args.time.nanoseconds = (offset.nanoseconds * sign) as libc::c_uint;
        self.ioctl(TSYNC_SYSTIME, &mut args as *mut _ as *mut libc::c_char)
            .with_context(|| format!("could not set NIC time on {}", self.iface))
    }

    /// Set the adapter frequency adjustment in ppb.
    pub fn adjtime(&self, adj_ppb: i64) -> Result<()> {
        let mut args = TsyncAdjtimeArgs { adj: adj_ppb, set_adj: 1 };
        self.ioctl(TSYNC_ADJTIME, &mut args as *mut _ as *mut libc::c_char)
            .with_context(|| format!("could not adjust NIC frequency on {}", self.iface))
    }

    /// Drain the adapter's latest TX and RX timestamps. With
    /// `with_system_time` the matching system timestamps are returned
    /// instead (the system-assisted mode).
    pub fn read_timestamps(&self, with_system_time: bool) -> Result<NicTimestamps> {
        let mut args = TsyncReadTsArgs { with_system_time: with_system_time as i32, ..Default::default() };
        self.ioctl(TSYNC_READTS, &mut args as *mut _ as *mut libc::c_char)
            .with_context(|| format!("could not read NIC time stamps on {}", self.iface))?;

        let mut out = NicTimestamps::default();
        if args.rx_valid != 0 {
            let t = if with_system_time { args.rx_sys } else { args.rx };
            out.rx = Some(NicRxStamp {
                time: t.to_internal(1),
                sequence_id: args.source_sequence_id,
                source_uuid: args.source_identity,
            });
        }
        if args.tx_valid != 0 {
            let t = if with_system_time { args.tx_sys } else { args.tx };
            out.tx = Some(t.to_internal(1));
        }
        Ok(out)
    }

    /// Correlate adapter and system time: returns the signed
    /// (system→NIC, NIC→system) one-way delays.
    pub fn compare_ts(&self) -> Result<(TimeInternal, TimeInternal)> {
        let mut args = TsyncComparetsArgs::default();
        self.ioctl(TSYNC_COMPARETS, &mut args as *mut _ as *mut libc::c_char)
            .with_context(|| format!("could not correlate NIC and system time on {}", self.iface))?;
        Ok((
            args.system_to_nic.to_internal(args.system_to_nic_sign),
            args.nic_to_system.to_internal(args.nic_to_system_sign),
        ))
    }
}
