//! The disciplined clock behind the port.
//!
//! One tagged variant per supported clock arrangement (`TimeMode`); every
//! operation switches on the tag. The NIC-backed variants keep the adapter's
//! timestamps in a bounded FIFO (receive) and a single slot (transmit — the
//! protocol guarantees one in-flight event packet per port).
//!
//! In `Both` mode the NIC clock is the PTP-disciplined reference and a
//! second, independent servo steers the system clock after it, fed by the
//! driver's symmetric system↔NIC delay measurement. When the port is master
//! the roles flip: the system clock is the reference and the NIC is steered.
//!
//! Everything NIC- or adjtimex-shaped is Linux-only; elsewhere only the
//! plain system mode comes up, and slew requests fall back to stepping.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::TimeMode;
use crate::constants::{PTP_UUID_LENGTH, TX_TIMESTAMP_DEADLINE};
use crate::servo::{Servo, ServoConfig};
use crate::time::TimeInternal;

#[cfg(target_os = "linux")]
use anyhow::bail;
#[cfg(target_os = "linux")]
use tracing::{error, warn};

#[cfg(target_os = "linux")]
use crate::nic::{
    DeviceRequest, HwTstampConfig, RxFilterMode, HWTSTAMP_FILTER_NONE,
    HWTSTAMP_FILTER_PTP_V1_L4_DELAY_REQ, HWTSTAMP_FILTER_PTP_V1_L4_SYNC, HWTSTAMP_TX_OFF,
    HWTSTAMP_TX_ON, SOF_TIMESTAMPING_RX_HARDWARE, SOF_TIMESTAMPING_RX_SOFTWARE,
    SOF_TIMESTAMPING_SOFTWARE, SOF_TIMESTAMPING_SYS_HARDWARE, SOF_TIMESTAMPING_TX_HARDWARE,
    SOF_TIMESTAMPING_TX_SOFTWARE, SO_TIMESTAMPING,
};
#[cfg(target_os = "linux")]
use crate::servo::ServoCommand;

/// Receive-timestamp FIFO depth. New stamps can only arrive while the
/// protocol is between packets, so this never gets very full.
const RECV_RING_SIZE: usize = 10;

#[derive(Debug, Default, Clone, Copy)]
struct RecvSlot {
    time: TimeInternal,
    sequence_id: u16,
    source_uuid: [u8; PTP_UUID_LENGTH],
    valid: bool,
}

/// Oldest-drop FIFO keyed by (uuid, sequence id). Entries are single-use:
/// delivering a stamp invalidates its slot so a restarted peer reusing old
/// sequence ids cannot be handed a stale timestamp.
#[derive(Debug, Default)]
struct RecvRing {
    slots: [RecvSlot; RECV_RING_SIZE],
    /// Oldest valid and next free slot. Valid entries are [oldest, free) if
    /// oldest <= free, otherwise [oldest, SIZE) and [0, free).
    oldest: usize,
    next_free: usize,
}

impl RecvRing {
    fn push(&mut self, time: TimeInternal, sequence_id: u16, source_uuid: [u8; PTP_UUID_LENGTH]) {
        let new_index;
        if self.next_free == RECV_RING_SIZE {
            new_index = 0;
            self.next_free = 1;
            self.oldest = 2;
        } else {
            new_index = self.next_free;
            self.next_free += 1;
            if self.oldest != 0 && self.next_free == self.oldest {
                self.oldest += 1;
            }
        }
        if self.oldest >= RECV_RING_SIZE {
            self.oldest = 0;
        }

        self.slots[new_index] = RecvSlot { time, sequence_id, source_uuid, valid: true };
    }

    fn take(
        &mut self,
        source_uuid: &[u8; PTP_UUID_LENGTH],
        sequence_id: u16,
    ) -> Option<TimeInternal> {
        if self.oldest <= self.next_free {
            self.take_in(source_uuid, sequence_id, self.oldest, self.next_free)
        } else {
            self.take_in(source_uuid, sequence_id, self.oldest, RECV_RING_SIZE)
                .or_else(|| self.take_in(source_uuid, sequence_id, 0, self.next_free))
        }
    }

    fn take_in(
        &mut self,
        source_uuid: &[u8; PTP_UUID_LENGTH],
        sequence_id: u16,
        left: usize,
        right: usize,
    ) -> Option<TimeInternal> {
        for slot in &mut self.slots[left..right] {
            if slot.valid && slot.source_uuid == *source_uuid && slot.sequence_id == sequence_id {
                let time = slot.time;
                *slot = RecvSlot::default();
                return Some(time);
            }
        }
        None
    }
}

/// Kernel slewing limits discovered at first use.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
struct FreqLimits {
    /// Largest pure-frequency adjustment, ppb.
    max_adj: i64,
    /// Tick adjustment bounds, µs·USER_HZ.
    min_tick: i64,
    max_tick: i64,
    user_hz: i64,
    /// ppb per unit of tick adjustment.
    tick_res: i64,
}

/// Secondary discipline used by `Both` mode.
struct BothDiscipline {
    servo: Servo,
    last_sync: Option<Instant>,
    applied_adj: i64,
}

pub struct TimeSource {
    mode: TimeMode,
    #[cfg(target_os = "linux")]
    nic: Option<DeviceRequest>,
    rx_stamps: RecvRing,
    tx_stamp: Option<TimeInternal>,
    is_master: bool,
    /// Most recently applied frequency adjustment in ppb, for the stats line.
    pub applied_adj: i64,
    #[cfg(target_os = "linux")]
    freq_limits: Option<FreqLimits>,
    both: Option<BothDiscipline>,
}

fn reads_nic_clock(mode: TimeMode) -> bool {
    matches!(mode, TimeMode::Nic | TimeMode::NicOnly | TimeMode::Both)
}

impl TimeSource {
    /// Bring up the selected variant on the already-bound event socket.
    /// `secondary_cfg` parameterizes the system-clock servo in `Both` mode.
    pub fn init(
        mode: TimeMode,
        event_fd: RawFd,
        iface: &str,
        secondary_cfg: ServoConfig,
    ) -> Result<TimeSource> {
        let mut source = TimeSource {
            mode,
            #[cfg(target_os = "linux")]
            nic: None,
            rx_stamps: RecvRing::default(),
            tx_stamp: None,
            is_master: false,
            applied_adj: 0,
            #[cfg(target_os = "linux")]
            freq_limits: None,
            both: None,
        };
        source.init_hardware(event_fd, iface, secondary_cfg)?;
        Ok(source)
    }

    #[cfg(target_os = "linux")]
    fn init_hardware(&mut self, event_fd: RawFd, iface: &str, secondary_cfg: ServoConfig) -> Result<()> {
        match self.mode {
            TimeMode::System => {}
            TimeMode::SystemKernelHw | TimeMode::SystemKernelSw => {
                self.nic = Some(DeviceRequest::new(event_fd, iface));
                self.select_rx_mode(true)?;
            }
            TimeMode::Nic | TimeMode::NicOnly | TimeMode::SystemAssisted | TimeMode::Both => {
                let nic = DeviceRequest::new(event_fd, iface);
                nic.tsync_init()?;
                nic.enable_tx()?;
                self.nic = Some(nic);
                self.select_rx_mode(true)?;
                if self.mode == TimeMode::Both {
                    self.both = Some(BothDiscipline {
                        servo: Servo::new(secondary_cfg, "sys "),
                        last_sync: None,
                        applied_adj: 0,
                    });
                }
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn init_hardware(&mut self, _event_fd: RawFd, _iface: &str, _secondary_cfg: ServoConfig) -> Result<()> {
        match self.mode {
            TimeMode::System => Ok(()),
            other => anyhow::bail!("time mode {other:?} requires linux"),
        }
    }

    /// Undo timestamping configuration and park the frequency adjustment.
    pub fn shutdown(&mut self, no_adjust: bool) {
        if !no_adjust && !self.mode.adjusts_nic() {
            let _ = self.adj_time(0, None);
        }
        self.shutdown_hardware();
    }

    #[cfg(target_os = "linux")]
    fn shutdown_hardware(&mut self) {
        let Some(nic) = self.nic.clone() else { return };
        match self.mode {
            TimeMode::SystemKernelHw => {
                let mut config = HwTstampConfig {
                    flags: 0,
                    tx_type: HWTSTAMP_TX_OFF,
                    rx_filter: HWTSTAMP_FILTER_NONE,
                };
                if let Err(e) = nic.set_hwtstamp_config(&mut config) {
                    warn!("failed to disable kernel hardware time stamping: {e:#}");
                }
            }
            TimeMode::Nic | TimeMode::NicOnly | TimeMode::SystemAssisted | TimeMode::Both => {
                let _ = nic.disable_rx();
                let _ = nic.disable_tx();
            }
            _ => {}
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn shutdown_hardware(&mut self) {}

    pub fn mode(&self) -> TimeMode {
        self.mode
    }

    /// The secondary (system-clock) servo in `Both` mode, for stats.
    pub fn secondary_servo(&self) -> Option<(&Servo, i64)> {
        self.both.as_ref().map(|b| (&b.servo, b.applied_adj))
    }

    /// Read the disciplined clock.
    pub fn get_time(&mut self) -> Result<TimeInternal> {
        if reads_nic_clock(self.mode) {
            self.nic_get_time()
        } else {
            Ok(system_get_time())
        }
    }

    /// Step the disciplined clock to `t`.
    pub fn set_time(&mut self, t: &TimeInternal) -> Result<()> {
        if reads_nic_clock(self.mode) {
            self.nic_set_time(t)
        } else {
            info!("resetting system clock to {t}");
            system_set_time(t)
        }
    }

    /// Request a frequency adjustment of `adj_ppb`. A variant that cannot
    /// slew falls back to stepping by `offset` when one is supplied.
    pub fn adj_time(&mut self, adj_ppb: i32, offset: Option<&TimeInternal>) -> Result<()> {
        if reads_nic_clock(self.mode) {
            self.nic_adj_time(adj_ppb, offset)
        } else {
            self.system_slew(adj_ppb as i64, offset)
        }
    }

    /// Step the disciplined clock back by `offset` (the servo's jump path).
    pub fn adj_time_offset(&mut self, offset: &TimeInternal) -> Result<()> {
        if reads_nic_clock(self.mode) {
            self.nic_apply_offset(&offset.neg())
        } else {
            let now = self.get_time()?;
            let stepped = now.sub(offset);
            self.set_time(&stepped)
        }
    }

    /// TX timestamp of the most recent outgoing event packet, if the NIC has
    /// produced it yet. Consumed on delivery.
    pub fn get_send_time(&mut self) -> Option<TimeInternal> {
        self.poll_nic_timestamps();
        self.tx_stamp.take()
    }

    /// Poll for the TX timestamp of the packet just sent, up to the 500 ms
    /// deadline. Returns zero on timeout — the caller skips whatever message
    /// depended on it.
    pub fn await_send_time(&mut self) -> TimeInternal {
        if let Some(ts) = self.get_send_time() {
            return ts;
        }
        let deadline = Instant::now() + TX_TIMESTAMP_DEADLINE;
        loop {
            std::thread::sleep(Duration::from_micros(1));
            if let Some(ts) = self.get_send_time() {
                return ts;
            }
            if Instant::now() >= deadline {
                debug!("no send time stamp within {TX_TIMESTAMP_DEADLINE:?}");
                return TimeInternal::ZERO;
            }
        }
    }

    /// RX timestamp for the packet identified by (uuid, sequence id).
    /// Single-use; stale entries age out of the FIFO.
    pub fn get_receive_time(
        &mut self,
        source_uuid: &[u8; PTP_UUID_LENGTH],
        sequence_id: u16,
    ) -> Option<TimeInternal> {
        self.poll_nic_timestamps();
        self.rx_stamps.take(source_uuid, sequence_id)
    }

    /// Idle hook, called when the event loop wakes without traffic.
    pub fn no_activity(&mut self) {
        self.sync_system_with_nic();
    }

    /// Track MASTER transitions: the single hardware RX slot must stamp
    /// Delay-Req packets while we are master and Sync packets otherwise.
    pub fn on_state_change(&mut self, is_master: bool) {
        if self.is_master == is_master {
            return;
        }
        self.is_master = is_master;
        #[cfg(target_os = "linux")]
        if self.mode != TimeMode::System {
            if let Err(e) = self.select_rx_mode(!is_master) {
                error!("failed to switch receive time stamp mode: {e:#}");
            }
        }
    }

    // --- linux clock plumbing -----------------------------------------------

    #[cfg(target_os = "linux")]
    fn nic_get_time(&mut self) -> Result<TimeInternal> {
        let t = self.nic.as_ref().expect("nic modes hold a device handle").systime_read()?;
        self.sync_system_with_nic();
        Ok(t)
    }

    #[cfg(target_os = "linux")]
    fn nic_set_time(&mut self, t: &TimeInternal) -> Result<()> {
        info!("resetting NIC clock to {t}");
        let nic = self.nic.as_ref().unwrap();
        let current = nic.systime_read()?;
        nic.systime_apply_offset(&t.sub(&current))?;
        self.sync_system_with_nic();
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn nic_adj_time(&mut self, adj_ppb: i32, offset: Option<&TimeInternal>) -> Result<()> {
        // without a fresh measurement there is nothing to apply; the call is
        // only a chance to resynchronize the follower clock
        if offset.is_some() {
            debug!("adjust NIC frequency by {adj_ppb} ppb");
            self.applied_adj = adj_ppb as i64;
            self.nic.as_ref().unwrap().adjtime(adj_ppb as i64)?;
        }
        self.sync_system_with_nic();
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn nic_apply_offset(&mut self, step: &TimeInternal) -> Result<()> {
        info!("shifting NIC clock by {step}");
        self.nic.as_ref().unwrap().systime_apply_offset(step)?;
        self.sync_system_with_nic();
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn system_slew(&mut self, adj_ppb: i64, _offset: Option<&TimeInternal>) -> Result<()> {
        let limits = self.freq_limits()?;
        self.applied_adj = system_adj_frequency(limits, adj_ppb)?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn select_rx_mode(&mut self, stamp_sync: bool) -> Result<()> {
        debug!("time stamp incoming {} packets", if stamp_sync { "Sync" } else { "Delay_Req" });
        match self.mode {
            TimeMode::SystemKernelHw => {
                let nic = self.nic.as_ref().unwrap();
                let mut config = HwTstampConfig {
                    flags: 0,
                    tx_type: HWTSTAMP_TX_ON,
                    rx_filter: if stamp_sync {
                        HWTSTAMP_FILTER_PTP_V1_L4_SYNC
                    } else {
                        HWTSTAMP_FILTER_PTP_V1_L4_DELAY_REQ
                    },
                };
                nic.set_hwtstamp_config(&mut config)?;
                set_so_timestamping(
                    nic,
                    SOF_TIMESTAMPING_TX_HARDWARE
                        | SOF_TIMESTAMPING_RX_HARDWARE
                        | SOF_TIMESTAMPING_SYS_HARDWARE,
                )
            }
            TimeMode::SystemKernelSw => set_so_timestamping(
                self.nic.as_ref().unwrap(),
                SOF_TIMESTAMPING_TX_SOFTWARE
                    | SOF_TIMESTAMPING_RX_SOFTWARE
                    | SOF_TIMESTAMPING_SOFTWARE,
            ),
            TimeMode::Nic | TimeMode::NicOnly | TimeMode::SystemAssisted | TimeMode::Both => {
                let mode = if stamp_sync { RxFilterMode::UdpV1Sync } else { RxFilterMode::UdpV1Delay };
                self.nic.as_ref().unwrap().enable_rx(mode)
            }
            TimeMode::System => Ok(()),
        }
    }

    /// Drain fresh NIC timestamps into the FIFO and the TX slot.
    #[cfg(target_os = "linux")]
    fn poll_nic_timestamps(&mut self) {
        if !self.mode.delayed_timing() {
            return;
        }
        let Some(nic) = self.nic.as_ref() else { return };
        let with_system_time = self.mode == TimeMode::SystemAssisted;
        match nic.read_timestamps(with_system_time) {
            Ok(stamps) => {
                if let Some(rx) = stamps.rx {
                    self.rx_stamps.push(rx.time, rx.sequence_id, rx.source_uuid);
                }
                if let Some(tx) = stamps.tx {
                    self.tx_stamp = Some(tx);
                }
            }
            Err(e) => error!("{e:#}"),
        }
    }

    /// `Both` mode: measure the system↔NIC offset and steer the follower
    /// clock. Runs at most once per second.
    #[cfg(target_os = "linux")]
    fn sync_system_with_nic(&mut self) {
        if self.mode != TimeMode::Both {
            return;
        }
        let Some(nic) = self.nic.clone() else { return };
        {
            let both = self.both.as_mut().expect("Both mode carries a secondary servo");
            let now = Instant::now();
            if let Some(last) = both.last_sync {
                if now.duration_since(last) < Duration::from_secs(1) {
                    return;
                }
            }
            both.last_sync = Some(now);
        }

        let (system_to_nic, nic_to_system) = match nic.compare_ts() {
            Ok(pair) => pair,
            Err(e) => {
                error!("{e:#}");
                return;
            }
        };
        debug!("system to NIC delay {system_to_nic}, NIC to system {nic_to_system}");

        let command = {
            let both = self.both.as_mut().unwrap();
            both.servo.update_delay(&system_to_nic, &TimeInternal::ZERO);
            both.servo.update_offset(&nic_to_system, &TimeInternal::ZERO);
            both.servo.update_clock()
        };

        // While we are master the system clock is the reference and the NIC
        // follows it, so commands land on the NIC with the sign flipped.
        let applied = match command {
            ServoCommand::None => None,
            ServoCommand::Step(offset) => {
                let result = if self.is_master {
                    nic.systime_apply_offset(&offset)
                } else {
                    let stepped = system_get_time().sub(&offset);
                    info!("resetting system clock to {stepped}");
                    system_set_time(&stepped)
                };
                if let Err(e) = result {
                    error!("{e:#}");
                }
                Some(0)
            }
            ServoCommand::Slew { adj_ppb, .. } => {
                if self.is_master {
                    if let Err(e) = nic.adjtime(-(adj_ppb as i64)) {
                        error!("{e:#}");
                    }
                    Some(-(adj_ppb as i64))
                } else {
                    self.freq_limits()
                        .and_then(|limits| system_adj_frequency(limits, adj_ppb as i64))
                        .map_err(|e| error!("{e:#}"))
                        .ok()
                }
            }
        };
        if let Some(adj) = applied {
            self.both.as_mut().unwrap().applied_adj = adj;
        }
    }

    #[cfg(target_os = "linux")]
    fn freq_limits(&mut self) -> Result<FreqLimits> {
        if let Some(limits) = self.freq_limits {
            return Ok(limits);
        }
        let user_hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as i64;
        if user_hz <= 0 {
            bail!("sysconf(_SC_CLK_TCK) failed");
        }
        let mut t: libc::timex = unsafe { std::mem::zeroed() };
        if unsafe { libc::adjtimex(&mut t) } < 0 {
            return Err(std::io::Error::last_os_error()).context("adjtimex probe failed");
        }
        // tolerance is scaled ppm; tick bounds per adjtimex(8)
        let limits = FreqLimits {
            max_adj: t.tolerance as i64 / ((1 << 16) / 1000),
            min_tick: (900_000 - 1_000_000) / user_hz,
            max_tick: (1_100_000 - 1_000_000) / user_hz,
            user_hz,
            tick_res: user_hz * 1000,
        };
        debug!(
            "kernel slew limits: ±{} ppb frequency, {}..{} tick",
            limits.max_adj, limits.min_tick, limits.max_tick
        );
        self.freq_limits = Some(limits);
        Ok(limits)
    }

    // --- non-linux fallbacks ------------------------------------------------

    #[cfg(not(target_os = "linux"))]
    fn nic_get_time(&mut self) -> Result<TimeInternal> {
        anyhow::bail!("NIC clock not available on this platform")
    }

    #[cfg(not(target_os = "linux"))]
    fn nic_set_time(&mut self, _t: &TimeInternal) -> Result<()> {
        anyhow::bail!("NIC clock not available on this platform")
    }

    #[cfg(not(target_os = "linux"))]
    fn nic_apply_offset(&mut self, _step: &TimeInternal) -> Result<()> {
        anyhow::bail!("NIC clock not available on this platform")
    }

    /// No kernel slewing interface: fall back to stepping by the measured
    /// offset, which is the contract for a source that cannot slew.
    #[cfg(not(target_os = "linux"))]
    fn system_slew(&mut self, _adj_ppb: i64, offset: Option<&TimeInternal>) -> Result<()> {
        if let Some(offset) = offset {
            if !offset.is_zero() {
                let stepped = system_get_time().sub(offset);
                info!("resetting system clock to {stepped} (no slew support)");
                return system_set_time(&stepped);
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn poll_nic_timestamps(&mut self) {}

    #[cfg(not(target_os = "linux"))]
    fn sync_system_with_nic(&mut self) {}
}

fn system_get_time() -> TimeInternal {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    TimeInternal::from_timespec(ts.tv_sec as i64, ts.tv_nsec as i64)
}

fn system_set_time(t: &TimeInternal) -> Result<()> {
    let ts = libc::timespec {
        tv_sec: t.seconds as libc::time_t,
        tv_nsec: t.nanoseconds as _,
    };
    let rc = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).context("failed to set the system clock");
    }
    Ok(())
}

/// Slew the system clock by `adj_ppb`. The frequency knob covers small
/// adjustments; overflow beyond its range is absorbed by the per-tick
/// microsecond term, clamped to the kernel's bounds. Returns the adjustment
/// actually applied in ppb.
#[cfg(target_os = "linux")]
fn system_adj_frequency(limits: FreqLimits, adj_ppb: i64) -> Result<i64> {
    let mut freq_adj = adj_ppb;
    let mut tick_adj = 0i64;

    if freq_adj > limits.max_adj {
        tick_adj = (adj_ppb - limits.max_adj + limits.tick_res - 1) / limits.tick_res;
        tick_adj = tick_adj.min(limits.max_tick);
        freq_adj = adj_ppb - tick_adj * limits.tick_res;
    } else if freq_adj < -limits.max_adj {
        tick_adj = -((-adj_ppb - limits.max_adj + limits.tick_res - 1) / limits.tick_res);
        tick_adj = tick_adj.max(limits.min_tick);
        freq_adj = adj_ppb - tick_adj * limits.tick_res;
    }
    freq_adj = freq_adj.clamp(-limits.max_adj, limits.max_adj);

    let mut t: libc::timex = unsafe { std::mem::zeroed() };
    t.modes = (libc::ADJ_FREQUENCY | libc::ADJ_TICK) as _;
    t.freq = (freq_adj * ((1 << 16) / 1000)) as _;
    t.tick = (tick_adj + 1_000_000 / limits.user_hz) as _;

    let applied = tick_adj * limits.tick_res + freq_adj;
    debug!(
        "requested adj {adj_ppb} ppb => {freq_adj} ppb frequency + {tick_adj} us/tick = {applied} ppb"
    );

    if unsafe { libc::adjtimex(&mut t) } < 0 {
        return Err(std::io::Error::last_os_error()).context("adjtimex failed");
    }
    Ok(applied)
}

#[cfg(target_os = "linux")]
fn set_so_timestamping(nic: &DeviceRequest, flags: i32) -> Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            nic.fd(),
            libc::SOL_SOCKET,
            SO_TIMESTAMPING,
            &flags as *const _ as *const libc::c_void,
            std::mem::size_of::<i32>() as _,
        )
    };
    if rc < 0 {
        return Err(std::io::Error::last_os_error()).context("SO_TIMESTAMPING");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ns: i32) -> TimeInternal {
        TimeInternal { seconds: 0, nanoseconds: ns }
    }

    #[test]
    fn test_ring_store_and_take() {
        let mut ring = RecvRing::default();
        ring.push(t(100), 1, [1; 6]);
        ring.push(t(200), 2, [1; 6]);
        assert_eq!(ring.take(&[1; 6], 2), Some(t(200)));
        // single-use
        assert_eq!(ring.take(&[1; 6], 2), None);
        assert_eq!(ring.take(&[1; 6], 1), Some(t(100)));
    }

    #[test]
    fn test_ring_out_of_order_lookup() {
        let mut ring = RecvRing::default();
        for i in 0..5u16 {
            ring.push(t(i as i32), i, [7; 6]);
        }
        assert_eq!(ring.take(&[7; 6], 0), Some(t(0)));
        assert_eq!(ring.take(&[7; 6], 4), Some(t(4)));
        assert_eq!(ring.take(&[7; 6], 2), Some(t(2)));
    }

    #[test]
    fn test_ring_distinguishes_sources() {
        let mut ring = RecvRing::default();
        ring.push(t(1), 9, [1; 6]);
        ring.push(t(2), 9, [2; 6]);
        assert_eq!(ring.take(&[2; 6], 9), Some(t(2)));
        assert_eq!(ring.take(&[1; 6], 9), Some(t(1)));
    }

    #[test]
    fn test_ring_overflow_drops_oldest() {
        let mut ring = RecvRing::default();
        for i in 0..(RECV_RING_SIZE as u16 + 5) {
            ring.push(t(i as i32), i, [3; 6]);
        }
        // the earliest stamps have been overwritten
        assert_eq!(ring.take(&[3; 6], 0), None);
        // recent ones survive
        let last = RECV_RING_SIZE as u16 + 4;
        assert_eq!(ring.take(&[3; 6], last), Some(t(last as i32)));
    }

    #[test]
    fn test_ring_never_misattributes_after_wrap() {
        let mut ring = RecvRing::default();
        for round in 0..3u16 {
            for i in 0..RECV_RING_SIZE as u16 {
                let seq = round * 100 + i;
                ring.push(t(seq as i32), seq, [4; 6]);
            }
        }
        // any stamp still findable must carry its own value
        for seq in 0..300u16 {
            if let Some(found) = ring.take(&[4; 6], seq) {
                assert_eq!(found, t(seq as i32));
            }
        }
    }
}
