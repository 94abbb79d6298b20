//! Port state machine and event loop.
//!
//! All mutable state lives in one owning aggregate, `PtpClock`. The loop is
//! single-threaded and strictly event driven: wait on both sockets with a
//! timeout derived from the nearest armed timer, dispatch at most one message
//! per wake, then let the state handler check its timers. Any send or receive
//! failure drops the port into FAULTY, which re-enters INITIALIZING on the
//! next iteration and rebuilds sockets, time source and timers from scratch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};

use crate::bmc::{self, ClockData, ForeignMasterSet};
use crate::config::RunTimeOpts;
use crate::constants::*;
use crate::net::NetPath;
use crate::servo::{Servo, ServoCommand, ServoConfig};
use crate::stats::{now_timestamp, StatsFormat, StatsRecord, StatsWriter};
use crate::time::{from_internal_time, to_internal_time, TimeInternal};
use crate::timer::{TimerId, Timers};
use crate::timesource::TimeSource;
use crate::wire::{
    self, MsgDelayResp, MsgFollowUp, MsgHeader, MsgManagement, MsgSync,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Initializing,
    Faulty,
    Listening,
    Passive,
    Uncalibrated,
    Slave,
    PreMaster,
    Master,
    Disabled,
}

impl PortState {
    pub fn tag(self) -> &'static str {
        match self {
            PortState::Initializing => "init",
            PortState::Faulty => "flt",
            PortState::Listening => "lstn",
            PortState::Passive => "pass",
            PortState::Uncalibrated => "uncl",
            PortState::Slave => "slv",
            PortState::PreMaster => "pmst",
            PortState::Master => "mst",
            PortState::Disabled => "dsbl",
        }
    }
}

/// Wrap-aware "newer than" for 16-bit sequence ids (serial number
/// arithmetic, so 0 succeeds 65535).
fn is_sequence_successor(new: u16, last: u16) -> bool {
    new != last && new.wrapping_sub(last) < 0x8000
}

/// When no timer is armed the loop still wakes once a second for the idle
/// hook (the `both` mode resync runs off it).
const IDLE_WAKE: Duration = Duration::from_secs(1);

pub struct PtpClock {
    opts: RunTimeOpts,
    pub state: PortState,
    pub data: ClockData,
    foreign: ForeignMasterSet,
    pub servo: Servo,
    net: Option<NetPath>,
    time: Option<TimeSource>,
    timers: Timers,
    stats: Option<StatsWriter>,
    rng: SmallRng,

    subdomain: [u8; PTP_SUBDOMAIN_NAME_LENGTH],
    sync_interval: i8,
    half_epoch: bool,
    delayed_timing: bool,
    burst_enabled: bool,

    record_update: bool,
    message_activity: bool,

    /// Shared event sequence counter (Sync and Delay-Req).
    last_sync_event_sequence_number: u16,
    last_general_event_sequence_number: u16,

    // slave bookkeeping
    waiting_for_follow: bool,
    sync_receive_time: TimeInternal,
    delay_req_send_time: TimeInternal,
    delay_req_receive_time: TimeInternal,
    sent_delay_req: bool,
    sent_delay_req_sequence_id: u16,
    /// Syncs left before the next Delay-Req.
    r: u16,

    /// Most recent servo output, for stats and tests.
    last_clock_command: ServoCommand,

    ibuf: [u8; PACKET_SIZE],
    obuf: [u8; PACKET_SIZE],
}

impl PtpClock {
    pub fn new(opts: RunTimeOpts) -> PtpClock {
        let servo_cfg = primary_servo_config(&opts);
        let subdomain = opts.subdomain_bytes();
        let max_foreign = opts.max_foreign_records.max(1);
        let sync_interval = opts.sync_interval;

        PtpClock {
            state: PortState::Initializing,
            data: ClockData::default(),
            foreign: ForeignMasterSet::new(max_foreign),
            servo: Servo::new(servo_cfg, ""),
            net: None,
            time: None,
            timers: Timers::new(),
            stats: opts.stats.map(StatsWriter::new),
            rng: SmallRng::from_entropy(),
            subdomain,
            sync_interval,
            half_epoch: opts.half_epoch,
            delayed_timing: opts.time.delayed_timing(),
            burst_enabled: false,
            record_update: false,
            message_activity: false,
            last_sync_event_sequence_number: 0,
            last_general_event_sequence_number: 0,
            waiting_for_follow: false,
            sync_receive_time: TimeInternal::ZERO,
            delay_req_send_time: TimeInternal::ZERO,
            delay_req_receive_time: TimeInternal::ZERO,
            sent_delay_req: false,
            sent_delay_req_sequence_id: 0,
            r: 0,
            last_clock_command: ServoCommand::None,
            ibuf: [0; PACKET_SIZE],
            obuf: [0; PACKET_SIZE],
            opts,
        }
    }

    /// Loop forever: each pass performs the actions of the current state and
    /// may transition. `running` is the daemon's shutdown flag.
    pub fn run(&mut self, running: &AtomicBool) -> Result<()> {
        debug!("event POWERUP");
        self.to_state(PortState::Initializing);

        while running.load(Ordering::SeqCst) {
            if self.state != PortState::Initializing {
                self.do_state();
            } else {
                self.do_init().context("failed to initialize the port")?;
            }

            if !self.message_activity {
                trace!("no activity");
                if let Some(time) = self.time.as_mut() {
                    time.no_activity();
                }
            }
        }
        Ok(())
    }

    /// Release sockets and restore the time source.
    pub fn shutdown(&mut self) {
        if let Some(mut time) = self.time.take() {
            time.shutdown(self.opts.no_adjust);
        }
        if let Some(mut net) = self.net.take() {
            net.shutdown();
        }
        info!("shutdown complete");
    }

    /// (Re)initialize networking, the time source, data sets and timers.
    /// Runs on every entry to INITIALIZING; failure is startup-fatal.
    fn do_init(&mut self) -> Result<()> {
        if let Some(mut net) = self.net.take() {
            net.shutdown();
        }
        if let Some(mut time) = self.time.take() {
            time.shutdown(self.opts.no_adjust);
        }

        let net = match NetPath::init(&self.opts) {
            Ok(net) => net,
            Err(e) => {
                self.to_state(PortState::Faulty);
                return Err(e).context("failed to initialize network");
            }
        };
        let time = match TimeSource::init(
            self.opts.time,
            net.event_fd(),
            &net.interface.name,
            secondary_servo_config(&self.opts),
        ) {
            Ok(time) => time,
            Err(e) => {
                self.to_state(PortState::Faulty);
                return Err(e).context("failed to initialize timing");
            }
        };

        self.init_data(&net);
        self.net = Some(net);
        self.time = Some(time);
        self.timers = Timers::new();
        self.half_epoch = self.half_epoch || self.opts.half_epoch;
        self.init_clock();
        bmc::m1(&mut self.data);
        wire::pack_header(
            &mut self.obuf,
            &self.subdomain,
            self.data.clock_communication_technology,
            &self.data.clock_uuid,
            self.data.clock_port_id,
        );

        debug!(
            "sync message interval: {:?}, stratum {}, uuid {:02x?}, subdomain {}",
            sync_interval_duration(self.sync_interval),
            self.data.clock_stratum,
            self.data.clock_uuid,
            String::from_utf8_lossy(&self.subdomain),
        );

        self.to_state(PortState::Listening);
        Ok(())
    }

    fn init_data(&mut self, net: &NetPath) {
        self.data = ClockData {
            clock_communication_technology: net.interface.communication_technology,
            clock_uuid: net.interface.uuid,
            clock_port_id: 1,
            clock_stratum: self.opts.clock_stratum,
            clock_identifier: self.opts.clock_identifier,
            clock_variance: self.opts.clock_variance,
            preferred: self.opts.clock_preferred,
            clock_followup_capable: true,
            external_timing: false,
            is_boundary_clock: false,
            current_utc_offset: self.opts.current_utc_offset,
            ..ClockData::default()
        };
        self.foreign = ForeignMasterSet::new(self.opts.max_foreign_records.max(1));
        self.record_update = false;
        self.last_sync_event_sequence_number = 0;
        self.last_general_event_sequence_number = 0;
        self.sent_delay_req = false;
        self.waiting_for_follow = false;
        self.delay_req_send_time = TimeInternal::ZERO;
        self.delay_req_receive_time = TimeInternal::ZERO;
    }

    /// Reset the servo and level the clock's frequency adjustment.
    fn init_clock(&mut self) {
        self.servo.reset();
        self.last_clock_command = ServoCommand::None;
        if !self.opts.no_adjust {
            if let Some(time) = self.time.as_mut() {
                if let Err(e) = time.adj_time(0, None) {
                    error!("{e:#}");
                }
            }
        }
    }

    /// Re-run the election when the foreign set changed.
    fn update_record(&mut self) {
        if !self.record_update {
            return;
        }
        self.record_update = false;
        let recommended = bmc::bmc(&mut self.foreign, &mut self.data, &self.opts, self.state);
        if recommended != self.state {
            self.to_state(recommended);
        }
    }

    /// Handle the actions and events of the current state.
    fn do_state(&mut self) {
        self.message_activity = false;

        if matches!(
            self.state,
            PortState::Listening | PortState::Passive | PortState::Slave | PortState::Master
        ) {
            self.update_record();
        }

        match self.state {
            PortState::Faulty => {
                // imaginary troubleshooting
                debug!("event FAULT_CLEARED");
                self.to_state(PortState::Initializing);
            }
            PortState::Listening | PortState::Passive | PortState::Uncalibrated | PortState::Slave => {
                self.handle();
                if self.timers.expired(TimerId::SyncReceipt) {
                    debug!("event SYNC_RECEIPT_TIMEOUT_EXPIRES");
                    self.on_sync_receipt_timeout();
                }
            }
            PortState::Master => {
                if self.timers.expired(TimerId::SyncInterval) {
                    trace!("event SYNC_INTERVAL_TIMEOUT_EXPIRES");
                    self.issue_sync();
                }
                self.handle();
                if self.opts.slave_only || self.data.clock_stratum == 255 {
                    self.to_state(PortState::Listening);
                }
            }
            PortState::Disabled => {
                self.handle();
            }
            _ => {
                debug!("do_state: unrecognized state");
            }
        }
    }

    fn on_sync_receipt_timeout(&mut self) {
        self.foreign.clear();
        if !self.opts.slave_only && self.data.clock_stratum != 255 {
            bmc::m1(&mut self.data);
            self.to_state(PortState::Master);
        } else if self.state != PortState::Listening {
            self.to_state(PortState::Listening);
        }
    }

    /// Perform the actions required when leaving the current state and
    /// entering `state`.
    fn to_state(&mut self, state: PortState) {
        self.message_activity = true;

        // leaving-state tasks
        match self.state {
            PortState::Master => {
                self.timers.stop(TimerId::SyncInterval);
                self.timers
                    .start(TimerId::SyncReceipt, sync_receipt_timeout(self.sync_interval));
            }
            PortState::Slave => {
                self.init_clock();
                self.waiting_for_follow = false;
            }
            _ => {}
        }

        if let Some(time) = self.time.as_mut() {
            time.on_state_change(state == PortState::Master);
        }

        // entering-state tasks
        match state {
            PortState::Initializing | PortState::Faulty | PortState::Disabled => {
                debug!("state {}", state.tag());
                self.timers.stop(TimerId::SyncReceipt);
            }
            PortState::Listening => {
                debug!("state lstn");
                self.timers
                    .start(TimerId::SyncReceipt, sync_receipt_timeout(self.sync_interval));
            }
            PortState::Master => {
                debug!("state mst");
                if self.state != PortState::PreMaster {
                    self.timers
                        .start(TimerId::SyncInterval, sync_interval_duration(self.sync_interval));
                }
                self.timers.stop(TimerId::SyncReceipt);
            }
            PortState::Passive => {
                debug!("state pass");
            }
            PortState::Uncalibrated => {
                debug!("state uncl");
            }
            PortState::Slave => {
                debug!("state slv");
                self.init_clock();

                // allow a few Syncs to fill the offset filter before the
                // first Delay-Req, for an accurate initial clock reset
                self.r = self.rng.gen_range(4..8);
                debug!("R = {}", self.r);

                self.waiting_for_follow = false;
                self.sent_delay_req = false;
                self.delay_req_send_time = TimeInternal::ZERO;
                self.delay_req_receive_time = TimeInternal::ZERO;

                self.timers
                    .start(TimerId::SyncReceipt, sync_receipt_timeout(self.sync_interval));
            }
            PortState::PreMaster => {}
        }

        self.state = state;
        self.display_stats();
    }

    /// Wait for and dispatch at most one message.
    fn handle(&mut self) {
        if !self.message_activity {
            let timeout = self
                .timers
                .time_to_next()
                .map(|t| t.min(IDLE_WAKE))
                .unwrap_or(IDLE_WAKE);
            let ready = match self.net.as_ref() {
                Some(net) => match net.select(Some(timeout)) {
                    Ok(ready) => ready,
                    Err(e) => {
                        error!("{e:#}");
                        self.to_state(PortState::Faulty);
                        return;
                    }
                },
                None => return,
            };
            if !ready {
                trace!("handle: nothing");
                return;
            }
        }

        // drain the event socket first, then the general socket
        let mut is_event = true;
        let received = match self.net.as_mut().unwrap().recv_event(&mut self.ibuf) {
            Ok(r) => r,
            Err(e) => {
                error!("{e:#}");
                self.to_state(PortState::Faulty);
                return;
            }
        };
        let (length, mut time) = match received {
            Some((length, ts)) => (length, ts),
            None => {
                is_event = false;
                match self.net.as_ref().unwrap().recv_general(&mut self.ibuf) {
                    Ok(Some(length)) => (length, None),
                    Ok(None) => return,
                    Err(e) => {
                        error!("{e:#}");
                        self.to_state(PortState::Faulty);
                        return;
                    }
                }
            }
        };

        self.message_activity = true;

        if !wire::msg_peek(&self.ibuf[..length]) {
            return;
        }
        if length < HEADER_LENGTH {
            error!("message shorter than header length");
            self.to_state(PortState::Faulty);
            return;
        }

        let header = wire::unpack_header(&self.ibuf[..length]);

        let mut bad_time = false;
        if is_event && self.delayed_timing {
            // query the hardware for the matching receive timestamp
            let stamp = self
                .time
                .as_mut()
                .unwrap()
                .get_receive_time(&header.source_uuid, header.sequence_id);
            match stamp {
                Some(ts) => time = Some(ts),
                None => {
                    // Cannot be dropped outright: a master may only be able
                    // to stamp Delay-Req packets, and ignoring Syncs from a
                    // better clock would break the election. Fall back to
                    // the current time and let the handlers decide.
                    trace!("message with no time stamp");
                    time = self.time.as_mut().unwrap().get_time().ok();
                    bad_time = true;
                }
            }
        }
        let mut time = time.unwrap_or(TimeInternal::ZERO);

        trace!(
            "{} message: type {} uuid {:02x?} seq {} time {}",
            if is_event { "event" } else { "general" },
            header.control,
            header.source_uuid,
            header.sequence_id,
            time,
        );

        if header.subdomain != self.subdomain {
            trace!("ignore message from foreign subdomain");
            return;
        }

        let is_from_self = header.source_communication_technology
            == self.data.clock_communication_technology
            && header.source_port_id == self.data.clock_port_id
            && header.source_uuid == self.data.clock_uuid;

        // inbound latency calibration, when the stamp looks real
        if !is_from_self && time.seconds > 0 {
            time = time.sub(&self.opts.inbound_latency);
        }

        match header.control {
            PTP_SYNC_MESSAGE => self.handle_sync(&header, length, &time, bad_time, is_from_self),
            PTP_FOLLOWUP_MESSAGE => self.handle_follow_up(&header, length, is_from_self),
            PTP_DELAY_REQ_MESSAGE => {
                self.handle_delay_req(&header, length, &time, bad_time, is_from_self)
            }
            PTP_DELAY_RESP_MESSAGE => self.handle_delay_resp(&header, length, is_from_self),
            PTP_MANAGEMENT_MESSAGE => self.handle_management(&header, length),
            other => debug!("handle: unrecognized message (control {other})"),
        }
    }

    fn handle_sync(
        &mut self,
        header: &MsgHeader,
        length: usize,
        time: &TimeInternal,
        _bad_time: bool,
        is_from_self: bool,
    ) {
        if length < SYNC_PACKET_LENGTH {
            error!("short sync message");
            self.to_state(PortState::Faulty);
            return;
        }

        match self.state {
            PortState::Faulty | PortState::Initializing | PortState::Disabled => {
                trace!("handle_sync: disregard");
            }
            PortState::Uncalibrated | PortState::Slave => {
                if is_from_self {
                    debug!("handle_sync: ignore from self");
                    return;
                }
                if header.has_flag(PTP_SYNC_BURST) && !self.burst_enabled {
                    return;
                }

                let from_parent = is_sequence_successor(
                    header.sequence_id,
                    self.data.parent_last_sync_sequence_number,
                ) && header.source_communication_technology
                    == self.data.parent_communication_technology
                    && header.source_port_id == self.data.parent_port_id
                    && header.source_uuid == self.data.parent_uuid;

                if from_parent {
                    let sync = wire::unpack_sync(&self.ibuf[..length]);
                    self.record_update = true;
                    self.foreign.add(header, &sync);

                    if sync.sync_interval != self.sync_interval {
                        debug!(
                            "message sync interval {} differs from ours ({})",
                            sync.sync_interval, self.sync_interval
                        );
                    }

                    self.sync_receive_time = *time;

                    if !header.has_flag(PTP_ASSIST) {
                        // origin timestamp is precise; discipline right away
                        self.waiting_for_follow = false;
                        let origin =
                            to_internal_time(&sync.origin_timestamp, &mut self.half_epoch);
                        let recv = self.sync_receive_time;
                        self.servo.update_offset(&origin, &recv);
                        self.update_clock();
                    } else {
                        self.waiting_for_follow = true;
                    }

                    bmc::s1(header, &sync, &mut self.data);

                    self.r = self.r.wrapping_sub(1);
                    if self.r == 0 {
                        self.issue_delay_req();
                        self.r = self.rng.gen_range(2..PTP_DELAY_REQ_INTERVAL);
                        debug!("R = {}", self.r);
                    }

                    trace!("sync receipt timer reset");
                    self.timers
                        .start(TimerId::SyncReceipt, sync_receipt_timeout(self.sync_interval));
                } else if self.comm_technology_compatible(header) {
                    // not our master, but still a candidate for the election
                    trace!("handle_sync: unwanted, tracking candidate");
                    let sync = wire::unpack_sync(&self.ibuf[..length]);
                    self.record_update = true;
                    self.foreign.add(header, &sync);
                } else {
                    trace!("handle_sync: unwanted");
                }
            }
            _ => {
                // Listening / Passive / PreMaster / Master
                if !self.comm_technology_compatible(header) {
                    return;
                }
                if !is_from_self {
                    let sync = wire::unpack_sync(&self.ibuf[..length]);
                    self.record_update = true;
                    self.foreign.add(header, &sync);
                } else if self.state == PortState::Master && self.data.clock_followup_capable {
                    // our own Sync came back with its transmit timestamp
                    let precise = time.add(&self.opts.outbound_latency);
                    self.issue_follow_up(&precise);
                }
            }
        }
    }

    fn handle_follow_up(&mut self, header: &MsgHeader, length: usize, is_from_self: bool) {
        if length < FOLLOW_UP_PACKET_LENGTH {
            error!("short follow up message");
            self.to_state(PortState::Faulty);
            return;
        }

        match self.state {
            PortState::Slave => {
                if is_from_self {
                    debug!("handle_follow_up: ignore from self");
                    return;
                }
                if header.has_flag(PTP_SYNC_BURST) && !self.burst_enabled {
                    return;
                }

                let follow = wire::unpack_follow_up(&self.ibuf[..length]);
                if self.waiting_for_follow
                    && follow.associated_sequence_id == self.data.parent_last_sync_sequence_number
                    && header.source_communication_technology
                        == self.data.parent_communication_technology
                    && header.source_port_id == self.data.parent_port_id
                    && header.source_uuid == self.data.parent_uuid
                {
                    self.waiting_for_follow = false;
                    let precise =
                        to_internal_time(&follow.precise_origin_timestamp, &mut self.half_epoch);
                    let recv = self.sync_receive_time;
                    self.servo.update_offset(&precise, &recv);
                    self.update_clock();
                } else {
                    trace!("handle_follow_up: unwanted");
                }
            }
            _ => {
                trace!("handle_follow_up: disregard");
            }
        }
    }

    fn handle_delay_req(
        &mut self,
        header: &MsgHeader,
        length: usize,
        time: &TimeInternal,
        bad_time: bool,
        is_from_self: bool,
    ) {
        if length < DELAY_REQ_PACKET_LENGTH {
            error!("short delay request message");
            self.to_state(PortState::Faulty);
            return;
        }

        match self.state {
            PortState::Master => {
                if is_from_self {
                    debug!("handle_delay_req: ignore from self");
                    return;
                }
                if self.comm_technology_compatible(header) {
                    if bad_time {
                        // a software fallback stamp would publish a bogus delay
                        info!("avoiding inaccurate DelayResp because of bad time stamp");
                    } else {
                        self.issue_delay_resp(time, header);
                    }
                }
            }
            PortState::Slave => {
                if is_from_self {
                    // loopback of our own Delay-Req: this is its TX timestamp
                    debug!("handle_delay_req: self");
                    self.delay_req_send_time = time.add(&self.opts.outbound_latency);

                    if !self.delay_req_receive_time.is_zero() {
                        let send = self.delay_req_send_time;
                        let recv = self.delay_req_receive_time;
                        self.servo.update_delay(&send, &recv);
                        self.delay_req_send_time = TimeInternal::ZERO;
                        self.delay_req_receive_time = TimeInternal::ZERO;
                    }
                }
            }
            _ => {
                trace!("handle_delay_req: disregard");
            }
        }
    }

    fn handle_delay_resp(&mut self, header: &MsgHeader, length: usize, is_from_self: bool) {
        if length < DELAY_RESP_PACKET_LENGTH {
            error!("short delay response message");
            self.to_state(PortState::Faulty);
            return;
        }

        match self.state {
            PortState::Slave => {
                if is_from_self {
                    debug!("handle_delay_resp: ignore from self");
                    return;
                }

                let resp = wire::unpack_delay_resp(&self.ibuf[..length]);
                if self.sent_delay_req
                    && resp.requesting_source_sequence_id == self.sent_delay_req_sequence_id
                    && resp.requesting_source_communication_technology
                        == self.data.clock_communication_technology
                    && resp.requesting_source_port_id == self.data.clock_port_id
                    && resp.requesting_source_uuid == self.data.clock_uuid
                    && header.source_communication_technology
                        == self.data.parent_communication_technology
                    && header.source_port_id == self.data.parent_port_id
                    && header.source_uuid == self.data.parent_uuid
                {
                    self.sent_delay_req = false;
                    self.delay_req_receive_time =
                        to_internal_time(&resp.delay_receipt_timestamp, &mut self.half_epoch);

                    if !self.delay_req_send_time.is_zero() {
                        let send = self.delay_req_send_time;
                        let recv = self.delay_req_receive_time;
                        self.servo.update_delay(&send, &recv);
                        self.delay_req_send_time = TimeInternal::ZERO;
                        self.delay_req_receive_time = TimeInternal::ZERO;
                    }
                } else {
                    trace!("handle_delay_resp: unwanted");
                }
            }
            _ => {
                trace!("handle_delay_resp: disregard");
            }
        }
    }

    fn handle_management(&mut self, header: &MsgHeader, length: usize) {
        if self.state == PortState::Initializing {
            return;
        }
        if length < wire::MM_PAYLOAD_OFF {
            error!("short management message");
            self.to_state(PortState::Faulty);
            return;
        }

        let manage = wire::unpack_management(&self.ibuf[..length]);

        let targets_us = manage.target_communication_technology
            == self.data.clock_communication_technology
            && manage.target_uuid == self.data.clock_uuid;
        let broadcast = (manage.target_communication_technology == PTP_DEFAULT
            || manage.target_communication_technology == self.data.clock_communication_technology)
            && manage.target_uuid.iter().all(|&b| b == 0);
        if !targets_us && !broadcast {
            debug!("handle_management: unwanted");
            return;
        }

        match manage.management_message_key {
            PTP_MM_OBTAIN_IDENTITY
            | PTP_MM_GET_DEFAULT_DATA_SET
            | PTP_MM_GET_CURRENT_DATA_SET
            | PTP_MM_GET_PARENT_DATA_SET
            | PTP_MM_GET_PORT_DATA_SET
            | PTP_MM_GET_GLOBAL_TIME_DATA_SET
            | PTP_MM_GET_FOREIGN_DATA_SET => self.issue_management_response(header, &manage),
            _ => {
                self.record_update = true;
                if let Some(state) = self.apply_management(&manage) {
                    if state != self.state {
                        self.to_state(state);
                    }
                }
            }
        }
    }

    /// Apply a state/config mutation; returns a requested port state.
    fn apply_management(&mut self, manage: &MsgManagement) -> Option<PortState> {
        let payload = manage.payload.as_slice();
        match manage.management_message_key {
            PTP_MM_INITIALIZE_CLOCK => Some(PortState::Initializing),
            PTP_MM_GOTO_FAULTY_STATE => Some(PortState::Faulty),
            PTP_MM_DISABLE_PORT => Some(PortState::Disabled),
            PTP_MM_ENABLE_PORT => Some(PortState::Initializing),
            PTP_MM_SET_SUBDOMAIN => {
                if payload.len() >= PTP_SUBDOMAIN_NAME_LENGTH {
                    self.subdomain.copy_from_slice(&payload[..PTP_SUBDOMAIN_NAME_LENGTH]);
                    info!("subdomain set to {}", String::from_utf8_lossy(&self.subdomain));
                    // takes full effect (new multicast group) on next re-init
                }
                None
            }
            PTP_MM_SET_SYNC_INTERVAL => {
                if let Some(&v) = payload.first() {
                    self.sync_interval = v as i8;
                    info!("sync interval set to {}", self.sync_interval);
                }
                None
            }
            PTP_MM_UPDATE_DEFAULT_DATA_SET => {
                if payload.len() >= 8 {
                    self.data.clock_stratum = payload[0];
                    self.data.preferred = payload[1] != 0;
                    self.data.clock_identifier.copy_from_slice(&payload[2..6]);
                    self.data.clock_variance =
                        i16::from_be_bytes(payload[6..8].try_into().unwrap());
                    info!("default data set updated (stratum {})", self.data.clock_stratum);
                }
                None
            }
            PTP_MM_UPDATE_GLOBAL_TIME_PROPERTIES => {
                if payload.len() >= 4 {
                    self.data.current_utc_offset =
                        i16::from_be_bytes(payload[0..2].try_into().unwrap());
                    self.data.leap_59 = payload[2] & 0x01 != 0;
                    self.data.leap_61 = payload[2] & 0x02 != 0;
                }
                None
            }
            PTP_MM_SET_TIME => {
                if payload.len() >= 8 {
                    let ext = crate::time::TimeRepresentation {
                        seconds: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                        nanoseconds: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                    };
                    let t = to_internal_time(&ext, &mut self.half_epoch);
                    if let Some(time) = self.time.as_mut() {
                        if let Err(e) = time.set_time(&t) {
                            error!("{e:#}");
                        }
                    }
                }
                None
            }
            other => {
                debug!("unhandled management key {other}");
                None
            }
        }
    }

    // --- outgoing messages --------------------------------------------------

    fn outgoing_flags(&self) -> u16 {
        let mut flags = 0;
        if self.data.clock_followup_capable {
            flags |= PTP_ASSIST;
        }
        if self.data.is_boundary_clock {
            flags |= PTP_BOUNDARY_CLOCK;
        }
        if self.data.external_timing {
            flags |= PTP_EXT_SYNC;
        }
        if self.data.parent_stats {
            flags |= PTP_PARENT_STATS;
        }
        if self.data.leap_59 {
            flags |= PTP_LI_59;
        }
        if self.data.leap_61 {
            flags |= PTP_LI_61;
        }
        flags
    }

    /// Sync/Delay-Req body assembled from the local data sets.
    fn local_sync_payload(&self, origin: crate::time::TimeRepresentation) -> MsgSync {
        MsgSync {
            origin_timestamp: origin,
            epoch_number: self.data.epoch_number,
            current_utc_offset: self.data.current_utc_offset,
            grandmaster_communication_technology: self.data.grandmaster_communication_technology,
            grandmaster_clock_uuid: self.data.grandmaster_uuid,
            grandmaster_port_id: self.data.grandmaster_port_id,
            grandmaster_sequence_id: self.data.grandmaster_sequence_number,
            grandmaster_clock_stratum: self.data.grandmaster_stratum,
            grandmaster_clock_identifier: self.data.grandmaster_identifier,
            grandmaster_clock_variance: self.data.grandmaster_variance,
            grandmaster_preferred: self.data.grandmaster_preferred,
            grandmaster_is_boundary_clock: self.data.grandmaster_is_boundary_clock,
            sync_interval: self.sync_interval,
            local_clock_variance: self.data.clock_variance,
            local_steps_removed: self.data.steps_removed,
            local_clock_stratum: self.data.clock_stratum,
            local_clock_identifier: self.data.clock_identifier,
            parent_communication_technology: self.data.parent_communication_technology,
            parent_uuid: self.data.parent_uuid,
            parent_port_id: self.data.parent_port_id,
            estimated_master_variance: 0,
            estimated_master_drift: self.servo.observed_drift,
            utc_reasonable: false,
        }
    }

    fn issue_sync(&mut self) {
        self.last_sync_event_sequence_number =
            self.last_sync_event_sequence_number.wrapping_add(1);
        self.data.grandmaster_sequence_number = self.last_sync_event_sequence_number;

        let now = match self.time.as_mut().map(|t| t.get_time()) {
            Some(Ok(now)) => now,
            _ => {
                error!("failed to read the time source");
                self.to_state(PortState::Faulty);
                return;
            }
        };
        let origin = from_internal_time(&now, self.half_epoch);
        let sync = self.local_sync_payload(origin);
        let flags = self.outgoing_flags();
        wire::pack_message_header(
            &mut self.obuf,
            PTP_EVENT_MESSAGE_TYPE,
            self.last_sync_event_sequence_number,
            PTP_SYNC_MESSAGE,
            flags,
        );
        wire::pack_sync_body(&mut self.obuf, &sync);

        let sent = match self.net.as_mut() {
            Some(net) => net.send_event(&self.obuf[..SYNC_PACKET_LENGTH]),
            None => Err(anyhow::anyhow!("network not initialized")),
        };
        if let Err(e) = sent {
            error!("{e:#}");
            self.to_state(PortState::Faulty);
            return;
        }
        trace!("sent sync message");

        if self.delayed_timing {
            let stamp = self.time.as_mut().unwrap().await_send_time();
            if stamp.is_zero() {
                warn!("sync message without hardware time stamp, skipped followup");
            } else {
                let precise = stamp.add(&self.opts.outbound_latency);
                self.issue_follow_up(&precise);
            }
        }
    }

    fn issue_follow_up(&mut self, precise: &TimeInternal) {
        self.last_general_event_sequence_number =
            self.last_general_event_sequence_number.wrapping_add(1);

        let follow = MsgFollowUp {
            associated_sequence_id: self.last_sync_event_sequence_number,
            precise_origin_timestamp: from_internal_time(precise, self.half_epoch),
        };
        let flags = self.outgoing_flags();
        wire::pack_message_header(
            &mut self.obuf,
            PTP_GENERAL_MESSAGE_TYPE,
            self.last_general_event_sequence_number,
            PTP_FOLLOWUP_MESSAGE,
            flags,
        );
        wire::pack_follow_up_body(&mut self.obuf, &follow);

        let sent = match self.net.as_ref() {
            Some(net) => net.send_general(&self.obuf[..FOLLOW_UP_PACKET_LENGTH]),
            None => Err(anyhow::anyhow!("network not initialized")),
        };
        if let Err(e) = sent {
            error!("{e:#}");
            self.to_state(PortState::Faulty);
        } else {
            trace!("sent followup message");
        }
    }

    fn issue_delay_req(&mut self) {
        self.sent_delay_req = true;
        self.last_sync_event_sequence_number =
            self.last_sync_event_sequence_number.wrapping_add(1);
        self.sent_delay_req_sequence_id = self.last_sync_event_sequence_number;

        let now = match self.time.as_mut().map(|t| t.get_time()) {
            Some(Ok(now)) => now,
            _ => {
                error!("failed to read the time source");
                self.to_state(PortState::Faulty);
                return;
            }
        };
        let origin = from_internal_time(&now, self.half_epoch);
        let req = self.local_sync_payload(origin);
        let flags = self.outgoing_flags();
        wire::pack_message_header(
            &mut self.obuf,
            PTP_EVENT_MESSAGE_TYPE,
            self.last_sync_event_sequence_number,
            PTP_DELAY_REQ_MESSAGE,
            flags,
        );
        wire::pack_sync_body(&mut self.obuf, &req);

        let sent = match self.net.as_mut() {
            Some(net) => net.send_event(&self.obuf[..DELAY_REQ_PACKET_LENGTH]),
            None => Err(anyhow::anyhow!("network not initialized")),
        };
        if let Err(e) = sent {
            error!("{e:#}");
            self.to_state(PortState::Faulty);
            return;
        }
        trace!("sent delay request message");

        if self.delayed_timing {
            let stamp = self.time.as_mut().unwrap().await_send_time();
            if stamp.is_zero() {
                warn!("delay request without hardware time stamp, will skip response");
                self.sent_delay_req = false;
            } else {
                self.delay_req_send_time = stamp.add(&self.opts.outbound_latency);
            }
        }
    }

    fn issue_delay_resp(&mut self, receipt: &TimeInternal, req_header: &MsgHeader) {
        self.last_general_event_sequence_number =
            self.last_general_event_sequence_number.wrapping_add(1);

        let resp = MsgDelayResp {
            delay_receipt_timestamp: from_internal_time(receipt, self.half_epoch),
            requesting_source_communication_technology: req_header
                .source_communication_technology,
            requesting_source_uuid: req_header.source_uuid,
            requesting_source_port_id: req_header.source_port_id,
            requesting_source_sequence_id: req_header.sequence_id,
        };
        let flags = self.outgoing_flags();
        wire::pack_message_header(
            &mut self.obuf,
            PTP_GENERAL_MESSAGE_TYPE,
            self.last_general_event_sequence_number,
            PTP_DELAY_RESP_MESSAGE,
            flags,
        );
        wire::pack_delay_resp_body(&mut self.obuf, &resp);

        let sent = match self.net.as_ref() {
            Some(net) => net.send_general(&self.obuf[..DELAY_RESP_PACKET_LENGTH]),
            None => Err(anyhow::anyhow!("network not initialized")),
        };
        if let Err(e) = sent {
            error!("{e:#}");
            self.to_state(PortState::Faulty);
        } else {
            trace!("sent delay response message");
        }
    }

    fn issue_management_response(&mut self, req_header: &MsgHeader, manage: &MsgManagement) {
        let (key, payload) = match self.management_response_payload(manage.management_message_key) {
            Some(pair) => pair,
            None => return,
        };

        self.last_general_event_sequence_number =
            self.last_general_event_sequence_number.wrapping_add(1);

        let response = MsgManagement {
            target_communication_technology: req_header.source_communication_technology,
            target_uuid: req_header.source_uuid,
            target_port_id: req_header.source_port_id,
            starting_boundary_hops: manage.starting_boundary_hops,
            boundary_hops: manage.boundary_hops,
            management_message_key: key,
            payload,
        };
        let flags = self.outgoing_flags();
        wire::pack_message_header(
            &mut self.obuf,
            PTP_GENERAL_MESSAGE_TYPE,
            self.last_general_event_sequence_number,
            PTP_MANAGEMENT_MESSAGE,
            flags,
        );
        let length = wire::pack_management_body(&mut self.obuf, &response);

        let sent = match self.net.as_ref() {
            Some(net) => net.send_general(&self.obuf[..length]),
            None => Err(anyhow::anyhow!("network not initialized")),
        };
        if let Err(e) = sent {
            error!("{e:#}");
            self.to_state(PortState::Faulty);
        } else {
            trace!("sent management message");
        }
    }

    /// Reply payloads carry the data-set fields in declaration order.
    fn management_response_payload(&mut self, key: u8) -> Option<(u8, Vec<u8>)> {
        let data = &self.data;
        match key {
            PTP_MM_OBTAIN_IDENTITY => {
                let mut p = Vec::new();
                p.push(data.clock_communication_technology);
                p.extend_from_slice(&data.clock_uuid);
                p.extend_from_slice(&data.clock_port_id.to_be_bytes());
                let mut manufacturer = [0u8; 48];
                let id = MANUFACTURER_ID.as_bytes();
                manufacturer[..id.len()].copy_from_slice(id);
                p.extend_from_slice(&manufacturer);
                Some((PTP_MM_CLOCK_IDENTITY, p))
            }
            PTP_MM_GET_DEFAULT_DATA_SET => {
                let mut p = Vec::new();
                p.push(data.clock_stratum);
                p.extend_from_slice(&data.clock_identifier);
                p.extend_from_slice(&data.clock_variance.to_be_bytes());
                p.push(data.clock_followup_capable as u8);
                p.push(data.preferred as u8);
                p.push(data.is_boundary_clock as u8);
                p.push(self.sync_interval as u8);
                p.extend_from_slice(&self.subdomain);
                p.extend_from_slice(&1u16.to_be_bytes()); // number of ports
                p.push(self.foreign.len() as u8);
                Some((PTP_MM_DEFAULT_DATA_SET, p))
            }
            PTP_MM_GET_CURRENT_DATA_SET => {
                let mut p = Vec::new();
                p.extend_from_slice(&data.steps_removed.to_be_bytes());
                let ofm = from_internal_time(&self.servo.offset_from_master, false);
                p.extend_from_slice(&ofm.seconds.to_be_bytes());
                p.extend_from_slice(&ofm.nanoseconds.to_be_bytes());
                let owd = from_internal_time(&self.servo.one_way_delay, false);
                p.extend_from_slice(&owd.seconds.to_be_bytes());
                p.extend_from_slice(&owd.nanoseconds.to_be_bytes());
                Some((PTP_MM_CURRENT_DATA_SET, p))
            }
            PTP_MM_GET_PARENT_DATA_SET => {
                let mut p = Vec::new();
                p.push(data.parent_communication_technology);
                p.extend_from_slice(&data.parent_uuid);
                p.extend_from_slice(&data.parent_port_id.to_be_bytes());
                p.extend_from_slice(&data.parent_last_sync_sequence_number.to_be_bytes());
                p.push(data.parent_followup_capable as u8);
                p.extend_from_slice(&data.parent_variance.to_be_bytes());
                p.push(data.grandmaster_communication_technology);
                p.extend_from_slice(&data.grandmaster_uuid);
                p.extend_from_slice(&data.grandmaster_port_id.to_be_bytes());
                p.push(data.grandmaster_stratum);
                p.extend_from_slice(&data.grandmaster_identifier);
                p.extend_from_slice(&data.grandmaster_variance.to_be_bytes());
                p.push(data.grandmaster_preferred as u8);
                p.push(data.grandmaster_is_boundary_clock as u8);
                p.extend_from_slice(&data.grandmaster_sequence_number.to_be_bytes());
                Some((PTP_MM_PARENT_DATA_SET, p))
            }
            PTP_MM_GET_PORT_DATA_SET => {
                let mut p = Vec::new();
                p.push(port_state_code(self.state));
                p.extend_from_slice(&self.last_sync_event_sequence_number.to_be_bytes());
                p.extend_from_slice(&self.last_general_event_sequence_number.to_be_bytes());
                p.push(data.clock_communication_technology);
                p.extend_from_slice(&data.clock_uuid);
                p.extend_from_slice(&data.clock_port_id.to_be_bytes());
                p.push(self.burst_enabled as u8);
                Some((PTP_MM_PORT_DATA_SET, p))
            }
            PTP_MM_GET_GLOBAL_TIME_DATA_SET => {
                let now = self
                    .time
                    .as_mut()
                    .and_then(|t| t.get_time().ok())
                    .unwrap_or(TimeInternal::ZERO);
                let half_epoch = self.half_epoch;
                let data = &self.data;
                let mut p = Vec::new();
                let ext = from_internal_time(&now, half_epoch);
                p.extend_from_slice(&ext.seconds.to_be_bytes());
                p.extend_from_slice(&ext.nanoseconds.to_be_bytes());
                p.extend_from_slice(&data.current_utc_offset.to_be_bytes());
                p.push(data.leap_59 as u8);
                p.push(data.leap_61 as u8);
                p.extend_from_slice(&data.epoch_number.to_be_bytes());
                Some((PTP_MM_GLOBAL_TIME_DATA_SET, p))
            }
            PTP_MM_GET_FOREIGN_DATA_SET => {
                let mut p = Vec::new();
                p.extend_from_slice(&(self.foreign.len() as u16).to_be_bytes());
                for rec in self.foreign.records() {
                    p.push(rec.communication_technology);
                    p.extend_from_slice(&rec.uuid);
                    p.extend_from_slice(&rec.port_id.to_be_bytes());
                    p.extend_from_slice(&(rec.syncs.min(u16::MAX as u32) as u16).to_be_bytes());
                }
                Some((PTP_MM_FOREIGN_DATA_SET, p))
            }
            _ => None,
        }
    }

    // --- servo plumbing -----------------------------------------------------

    /// Run the servo on the latest offset estimate and apply its command to
    /// the disciplined clock.
    fn update_clock(&mut self) {
        let command = self.servo.update_clock();
        self.last_clock_command = command;

        if let Some(time) = self.time.as_mut() {
            let result = match command {
                ServoCommand::None => Ok(()),
                ServoCommand::Step(offset) => time.adj_time_offset(&offset),
                ServoCommand::Slew { adj_ppb, offset } => time.adj_time(adj_ppb, Some(&offset)),
            };
            if let Err(e) = result {
                error!("{e:#}");
            }
        }

        self.display_stats();

        trace!(
            "owd {} ofm {} drift {}",
            self.servo.one_way_delay,
            self.servo.offset_from_master,
            self.servo.observed_drift
        );
    }

    fn comm_technology_compatible(&self, header: &MsgHeader) -> bool {
        header.source_communication_technology == self.data.clock_communication_technology
            || header.source_communication_technology == PTP_DEFAULT
            || self.data.clock_communication_technology == PTP_DEFAULT
    }

    fn display_stats(&mut self) {
        let Some(writer) = self.stats.as_mut() else { return };

        let format = self.opts.stats.unwrap_or(StatsFormat::Plain);
        let timestamp =
            (format != StatsFormat::Plain).then(now_timestamp);

        let tracking = self.state == PortState::Slave;
        let adj = self.time.as_ref().map(|t| t.applied_adj).unwrap_or(0);
        let record = servo_record(&self.servo, self.state.tag(), timestamp.clone(), tracking, adj);
        writer.report(&record);

        // the system-clock follower in `both` mode reports as a second row
        if let Some((secondary, adj)) = self.time.as_ref().and_then(|t| t.secondary_servo()) {
            let record = servo_record(secondary, self.state.tag(), timestamp, true, adj);
            writer.report(&record);
        }
    }
}

fn servo_record(
    servo: &Servo,
    state: &'static str,
    timestamp: Option<String>,
    tracking: bool,
    adj: i64,
) -> StatsRecord {
    let mut record = StatsRecord {
        timestamp,
        clock: servo.name,
        state,
        ..StatsRecord::default()
    };
    if tracking {
        record.one_way_delay = Some(servo.one_way_delay.to_string());
        record.offset_from_master = Some(servo.offset_from_master.to_string());
        record.drift = Some(servo.observed_drift);
        record.variance = Some(servo.observed_variance);
        record.adj_ppb = Some(adj);
        record.slave_to_master_delay = Some(servo.slave_to_master_delay.to_string());
        record.master_to_slave_delay = Some(servo.master_to_slave_delay.to_string());
    }
    record
}

fn port_state_code(state: PortState) -> u8 {
    match state {
        PortState::Initializing => 0,
        PortState::Faulty => 1,
        PortState::Disabled => 2,
        PortState::Listening => 3,
        PortState::PreMaster => 4,
        PortState::Master => 5,
        PortState::Passive => 6,
        PortState::Uncalibrated => 7,
        PortState::Slave => 8,
    }
}

fn primary_servo_config(opts: &RunTimeOpts) -> ServoConfig {
    if opts.time == crate::config::TimeMode::Both {
        // the NIC discipline runs with stock gains; the user's tuning applies
        // to the system-clock follower
        ServoConfig::default()
    } else {
        servo_config_from(opts)
    }
}

fn secondary_servo_config(opts: &RunTimeOpts) -> ServoConfig {
    servo_config_from(opts)
}

fn servo_config_from(opts: &RunTimeOpts) -> ServoConfig {
    ServoConfig {
        ap: opts.ap,
        ai: opts.ai,
        s: opts.s,
        no_adjust: opts.no_adjust,
        no_reset_clock: opts.no_reset_clock,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TimeRepresentation;

    fn clock_with(opts: RunTimeOpts) -> PtpClock {
        let mut clock = PtpClock::new(opts);
        // identity normally filled from the bound interface
        clock.data.clock_communication_technology = PTP_ETHER;
        clock.data.clock_uuid = [9, 9, 9, 9, 9, 9];
        clock.data.clock_port_id = 1;
        clock.data.clock_stratum = clock.opts.clock_stratum;
        clock.data.clock_identifier = clock.opts.clock_identifier;
        clock.data.clock_variance = clock.opts.clock_variance;
        clock.data.clock_followup_capable = true;
        bmc::m1(&mut clock.data);
        clock
    }

    fn slave_clock() -> PtpClock {
        let mut clock = clock_with(RunTimeOpts::default());
        clock.to_state(PortState::Slave);
        // adopt a parent
        let header = master_header(1);
        let sync = master_sync(2);
        bmc::s1(&header, &sync, &mut clock.data);
        clock.data.parent_last_sync_sequence_number = 0;
        clock
    }

    fn master_header(seq: u16) -> MsgHeader {
        MsgHeader {
            version_ptp: VERSION_PTP,
            version_network: 1,
            subdomain: RunTimeOpts::default().subdomain_bytes(),
            message_type: PTP_EVENT_MESSAGE_TYPE,
            source_communication_technology: PTP_ETHER,
            source_uuid: [1, 2, 3, 4, 5, 6],
            source_port_id: 1,
            sequence_id: seq,
            control: PTP_SYNC_MESSAGE,
            flags: 0,
        }
    }

    fn master_sync(stratum: u8) -> MsgSync {
        MsgSync {
            origin_timestamp: TimeRepresentation { seconds: 1000, nanoseconds: 0 },
            grandmaster_communication_technology: PTP_ETHER,
            grandmaster_clock_uuid: [1, 2, 3, 4, 5, 6],
            grandmaster_port_id: 1,
            grandmaster_clock_stratum: stratum,
            grandmaster_clock_identifier: *b"DFLT",
            grandmaster_clock_variance: -4000,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            local_clock_variance: -4000,
            local_steps_removed: 0,
            local_clock_stratum: stratum,
            local_clock_identifier: *b"DFLT",
            parent_communication_technology: PTP_ETHER,
            parent_uuid: [1, 2, 3, 4, 5, 6],
            parent_port_id: 1,
            ..MsgSync::default()
        }
    }

    /// Pack a Sync from `header`+`sync` into the clock's input buffer the
    /// way the wire would deliver it.
    fn load_sync(clock: &mut PtpClock, header: &MsgHeader, sync: &MsgSync) {
        wire::pack_header(
            &mut clock.ibuf,
            &header.subdomain,
            header.source_communication_technology,
            &header.source_uuid,
            header.source_port_id,
        );
        wire::pack_message_header(
            &mut clock.ibuf,
            header.message_type,
            header.sequence_id,
            header.control,
            header.flags,
        );
        wire::pack_sync_body(&mut clock.ibuf, sync);
    }

    #[test]
    fn test_sequence_successor_wraps() {
        assert!(is_sequence_successor(1, 0));
        assert!(is_sequence_successor(0, 65_535));
        assert!(is_sequence_successor(100, 65_500));
        assert!(!is_sequence_successor(0, 0));
        assert!(!is_sequence_successor(65_500, 100));
    }

    #[test]
    fn test_sync_without_assist_drives_servo() {
        let mut clock = slave_clock();
        clock.r = 10; // keep the Delay-Req schedule out of the way

        let header = master_header(1);
        let sync = master_sync(2);
        load_sync(&mut clock, &header, &sync);
        // receive time 500µs after the advertised origin
        let rx = TimeInternal::new(1000, 500_000);
        clock.handle_sync(&header, SYNC_PACKET_LENGTH, &rx, false, false);

        assert!(!clock.waiting_for_follow);
        assert_eq!(clock.data.parent_last_sync_sequence_number, 1);
        // (500µs + 0)/2 through the offset filter
        assert_eq!(clock.servo.offset_from_master, TimeInternal::new(0, 250_000));
        assert!(matches!(clock.last_clock_command, ServoCommand::Slew { .. }));
    }

    #[test]
    fn test_sync_with_assist_waits_for_follow_up() {
        let mut clock = slave_clock();
        clock.r = 10;

        let mut header = master_header(1);
        header.flags = PTP_ASSIST;
        let sync = master_sync(2);
        load_sync(&mut clock, &header, &sync);
        let rx = TimeInternal::new(1000, 400_000);
        clock.handle_sync(&header, SYNC_PACKET_LENGTH, &rx, false, false);

        assert!(clock.waiting_for_follow);
        assert_eq!(clock.sync_receive_time, rx);
        // nothing fed to the servo yet
        assert_eq!(clock.servo.offset_from_master, TimeInternal::ZERO);

        // the matching Follow-Up closes the measurement; its sequence must
        // equal the sequence s1 just recorded
        let follow = MsgFollowUp {
            associated_sequence_id: 1,
            precise_origin_timestamp: TimeRepresentation { seconds: 1000, nanoseconds: 100_000 },
        };
        let mut fu_header = master_header(7);
        fu_header.message_type = PTP_GENERAL_MESSAGE_TYPE;
        fu_header.control = PTP_FOLLOWUP_MESSAGE;
        wire::pack_follow_up_body(&mut clock.ibuf, &follow);
        clock.handle_follow_up(&fu_header, FOLLOW_UP_PACKET_LENGTH, false);

        assert!(!clock.waiting_for_follow);
        // (300µs + 0)/2
        assert_eq!(clock.servo.offset_from_master, TimeInternal::new(0, 150_000));
    }

    #[test]
    fn test_stale_sync_sequence_not_accepted_as_parent() {
        let mut clock = slave_clock();
        clock.r = 10;
        clock.data.parent_last_sync_sequence_number = 100;

        let header = master_header(100); // not a successor
        let sync = master_sync(2);
        load_sync(&mut clock, &header, &sync);
        clock.handle_sync(&header, SYNC_PACKET_LENGTH, &TimeInternal::new(1000, 0), false, false);

        // rejected as parent sync, but still tracked as an election candidate
        assert_eq!(clock.data.parent_last_sync_sequence_number, 100);
        assert_eq!(clock.foreign.len(), 1);
    }

    #[test]
    fn test_step_jump_resets_servo() {
        let mut clock = slave_clock();
        clock.r = 10;

        let header = master_header(1);
        let sync = master_sync(2);
        load_sync(&mut clock, &header, &sync);
        // slave clock is 3 seconds ahead of the master
        let rx = TimeInternal::new(1003, 0);
        clock.handle_sync(&header, SYNC_PACKET_LENGTH, &rx, false, false);

        match clock.last_clock_command {
            ServoCommand::Step(offset) => assert_eq!(offset.seconds, 3),
            other => panic!("expected a step, got {other:?}"),
        }
        assert_eq!(clock.servo.observed_drift, 0);
    }

    #[test]
    fn test_missing_follow_up_times_out_to_listening() {
        let opts = RunTimeOpts { slave_only: true, ..RunTimeOpts::default() };
        let mut clock = clock_with(opts);
        clock.to_state(PortState::Slave);
        clock.r = 10;

        let header_assist = {
            let mut h = master_header(1);
            h.flags = PTP_ASSIST;
            h
        };
        let sync = master_sync(2);
        bmc::s1(&header_assist, &sync, &mut clock.data);
        clock.data.parent_last_sync_sequence_number = 0;
        load_sync(&mut clock, &header_assist, &sync);
        clock.handle_sync(&header_assist, SYNC_PACKET_LENGTH, &TimeInternal::new(1000, 0), false, false);
        assert!(clock.waiting_for_follow);

        // no Follow-Up ever arrives; the receipt timer fires
        clock.on_sync_receipt_timeout();
        assert_eq!(clock.state, PortState::Listening);
        assert!(!clock.waiting_for_follow);
    }

    #[test]
    fn test_bmc_preemption_from_master() {
        let mut clock = clock_with(RunTimeOpts::default()); // stratum 4
        clock.to_state(PortState::Master);

        // a stratum-1 grandmaster appears
        let mut header = master_header(1);
        header.source_uuid = [0xc, 0xc, 0xc, 0xc, 0xc, 0xc];
        let mut sync = master_sync(1);
        sync.grandmaster_clock_uuid = header.source_uuid;
        load_sync(&mut clock, &header, &sync);
        clock.handle_sync(&header, SYNC_PACKET_LENGTH, &TimeInternal::new(1000, 0), false, false);
        assert!(clock.record_update);

        clock.update_record();
        assert_eq!(clock.state, PortState::Slave);
        assert_eq!(clock.data.parent_uuid, header.source_uuid);
    }

    #[test]
    fn test_short_sync_faults_then_recovers() {
        let mut clock = slave_clock();
        let header = master_header(1);
        clock.handle_sync(&header, 20, &TimeInternal::ZERO, false, false);
        assert_eq!(clock.state, PortState::Faulty);

        // next loop iteration self-heals
        clock.do_state();
        assert_eq!(clock.state, PortState::Initializing);
    }

    #[test]
    fn test_delay_resp_requires_matching_triple() {
        let mut clock = slave_clock();
        clock.sent_delay_req = true;
        clock.sent_delay_req_sequence_id = 42;
        clock.delay_req_send_time = TimeInternal::new(1000, 0);

        let mut resp_header = master_header(9);
        resp_header.message_type = PTP_GENERAL_MESSAGE_TYPE;
        resp_header.control = PTP_DELAY_RESP_MESSAGE;

        // wrong sequence id: ignored
        let bad = MsgDelayResp {
            delay_receipt_timestamp: TimeRepresentation { seconds: 1000, nanoseconds: 200 },
            requesting_source_communication_technology: PTP_ETHER,
            requesting_source_uuid: clock.data.clock_uuid,
            requesting_source_port_id: 1,
            requesting_source_sequence_id: 41,
        };
        wire::pack_delay_resp_body(&mut clock.ibuf, &bad);
        clock.handle_delay_resp(&resp_header, DELAY_RESP_PACKET_LENGTH, false);
        assert!(clock.sent_delay_req);
        assert!(clock.delay_req_receive_time.is_zero());

        // matching triple from the parent: accepted, delay updated
        let good = MsgDelayResp { requesting_source_sequence_id: 42, ..bad };
        wire::pack_delay_resp_body(&mut clock.ibuf, &good);
        clock.handle_delay_resp(&resp_header, DELAY_RESP_PACKET_LENGTH, false);
        assert!(!clock.sent_delay_req);
        // both sides of the measurement were present, so state was consumed
        assert!(clock.delay_req_send_time.is_zero());
        assert!(clock.delay_req_receive_time.is_zero());
    }

    #[test]
    fn test_foreign_set_bounded_under_flood() {
        let mut clock = clock_with(RunTimeOpts::default());
        clock.to_state(PortState::Listening);
        for i in 0..20u8 {
            let mut header = master_header(1);
            header.source_uuid = [i, i, i, i, i, i];
            let sync = master_sync(4);
            load_sync(&mut clock, &header, &sync);
            clock.handle_sync(&header, SYNC_PACKET_LENGTH, &TimeInternal::ZERO, false, false);
            assert!(clock.foreign.len() <= clock.opts.max_foreign_records);
        }
    }

    #[test]
    fn test_management_goto_faulty_routed() {
        let mut clock = clock_with(RunTimeOpts::default());
        clock.to_state(PortState::Listening);

        let manage = MsgManagement {
            target_communication_technology: PTP_DEFAULT,
            target_uuid: [0; 6],
            target_port_id: 0,
            starting_boundary_hops: MM_STARTING_BOUNDARY_HOPS,
            boundary_hops: 0,
            management_message_key: PTP_MM_GOTO_FAULTY_STATE,
            payload: Vec::new(),
        };
        let mut header = master_header(3);
        header.message_type = PTP_GENERAL_MESSAGE_TYPE;
        header.control = PTP_MANAGEMENT_MESSAGE;
        wire::pack_header(
            &mut clock.ibuf,
            &header.subdomain,
            header.source_communication_technology,
            &header.source_uuid,
            header.source_port_id,
        );
        wire::pack_message_header(
            &mut clock.ibuf,
            header.message_type,
            header.sequence_id,
            header.control,
            0,
        );
        let len = wire::pack_management_body(&mut clock.ibuf, &manage);
        clock.handle_management(&header, len);
        assert_eq!(clock.state, PortState::Faulty);
    }

    #[test]
    fn test_management_set_sync_interval() {
        let mut clock = clock_with(RunTimeOpts::default());
        clock.to_state(PortState::Listening);
        let manage = MsgManagement {
            target_communication_technology: PTP_DEFAULT,
            target_uuid: [0; 6],
            target_port_id: 0,
            starting_boundary_hops: MM_STARTING_BOUNDARY_HOPS,
            boundary_hops: 0,
            management_message_key: PTP_MM_SET_SYNC_INTERVAL,
            payload: vec![3],
        };
        clock.apply_management(&manage);
        assert_eq!(clock.sync_interval, 3);
    }
}
