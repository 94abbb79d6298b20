//! Best-master-clock election inputs and decision.
//!
//! The foreign-master set is a fixed-capacity ring of observed candidates;
//! every Sync from another clock either bumps its record or overwrites the
//! oldest slot round-robin. `bmc` picks the best candidate by lexicographic
//! comparison over (stratum, identifier, variance, uuid) and recommends the
//! port state; `s1`/`m1` update the local data sets for the losing and
//! winning cases.

use std::cmp::Ordering;

use tracing::debug;

use crate::config::RunTimeOpts;
use crate::constants::*;
use crate::protocol::PortState;
use crate::wire::{MsgHeader, MsgSync};

/// Identity, parent and global-time data sets of the local clock
/// (IEEE 1588-2002 §8).
#[derive(Debug, Clone, Default)]
pub struct ClockData {
    // default data set
    pub clock_communication_technology: u8,
    pub clock_uuid: [u8; PTP_UUID_LENGTH],
    pub clock_port_id: u16,
    pub clock_stratum: u8,
    pub clock_identifier: [u8; PTP_CODE_STRING_LENGTH],
    pub clock_variance: i16,
    pub preferred: bool,
    pub clock_followup_capable: bool,
    pub external_timing: bool,
    pub is_boundary_clock: bool,

    // current data set
    pub steps_removed: u16,

    // parent data set
    pub parent_communication_technology: u8,
    pub parent_uuid: [u8; PTP_UUID_LENGTH],
    pub parent_port_id: u16,
    pub parent_last_sync_sequence_number: u16,
    pub parent_followup_capable: bool,
    pub parent_external_timing: bool,
    pub parent_variance: i16,
    pub parent_stats: bool,

    pub grandmaster_communication_technology: u8,
    pub grandmaster_uuid: [u8; PTP_UUID_LENGTH],
    pub grandmaster_port_id: u16,
    pub grandmaster_stratum: u8,
    pub grandmaster_identifier: [u8; PTP_CODE_STRING_LENGTH],
    pub grandmaster_variance: i16,
    pub grandmaster_preferred: bool,
    pub grandmaster_is_boundary_clock: bool,
    pub grandmaster_sequence_number: u16,

    // global time data set
    pub current_utc_offset: i16,
    pub leap_59: bool,
    pub leap_61: bool,
    pub epoch_number: u16,
}

#[derive(Debug, Clone)]
pub struct ForeignMasterRecord {
    pub communication_technology: u8,
    pub port_id: u16,
    pub uuid: [u8; PTP_UUID_LENGTH],
    pub header: MsgHeader,
    pub sync: MsgSync,
    pub syncs: u32,
}

/// Bounded ring of master candidates with a round-robin insertion index.
#[derive(Debug)]
pub struct ForeignMasterSet {
    records: Vec<ForeignMasterRecord>,
    capacity: usize,
    /// Next slot to overwrite once the ring is full.
    insert_index: usize,
    /// Index chosen by the last `bmc` run.
    best: usize,
}

impl ForeignMasterSet {
    pub fn new(capacity: usize) -> Self {
        ForeignMasterSet {
            records: Vec::with_capacity(capacity),
            capacity,
            insert_index: 0,
            best: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.insert_index = 0;
        self.best = 0;
    }

    pub fn records(&self) -> &[ForeignMasterRecord] {
        &self.records
    }

    /// Record a Sync from a candidate master: bump its record or claim the
    /// next round-robin slot. Returns the record index.
    pub fn add(&mut self, header: &MsgHeader, sync: &MsgSync) -> usize {
        // search starts at the current best so the common case (another Sync
        // from the elected master) terminates on the first probe
        let n = self.records.len();
        let mut j = if n == 0 { 0 } else { self.best % n };
        let mut found = None;
        for _ in 0..n {
            let rec = &self.records[j];
            if rec.communication_technology == header.source_communication_technology
                && rec.port_id == header.source_port_id
                && rec.uuid == header.source_uuid
            {
                found = Some(j);
                break;
            }
            j = (j + 1) % n;
        }

        let idx = match found {
            Some(j) => {
                self.records[j].syncs += 1;
                j
            }
            None => {
                let rec = ForeignMasterRecord {
                    communication_technology: header.source_communication_technology,
                    port_id: header.source_port_id,
                    uuid: header.source_uuid,
                    header: header.clone(),
                    sync: sync.clone(),
                    syncs: 1,
                };
                if self.records.len() < self.capacity {
                    self.records.push(rec);
                    self.insert_index = (self.insert_index + 1) % self.capacity;
                    self.records.len() - 1
                } else {
                    let j = self.insert_index;
                    debug!(
                        "foreign set full, overwriting record {} with {:02x?}",
                        j, header.source_uuid
                    );
                    self.records[j] = rec;
                    self.insert_index = (self.insert_index + 1) % self.capacity;
                    j
                }
            }
        };

        self.records[idx].header = header.clone();
        self.records[idx].sync = sync.clone();
        idx
    }

    fn pick_best(&mut self) -> Option<&ForeignMasterRecord> {
        if self.records.is_empty() {
            return None;
        }
        let mut best = 0;
        for i in 1..self.records.len() {
            if compare_candidates(&self.records[i].sync, &self.records[best].sync)
                == Ordering::Less
            {
                best = i;
            }
        }
        self.best = best;
        Some(&self.records[best])
    }
}

/// Lexicographic candidate order by advertised grandmaster:
/// stratum, identifier, variance, uuid. `Less` is better.
fn compare_candidates(a: &MsgSync, b: &MsgSync) -> Ordering {
    a.grandmaster_clock_stratum
        .cmp(&b.grandmaster_clock_stratum)
        .then_with(|| a.grandmaster_clock_identifier.cmp(&b.grandmaster_clock_identifier))
        .then_with(|| a.grandmaster_clock_variance.cmp(&b.grandmaster_clock_variance))
        .then_with(|| a.grandmaster_clock_uuid.cmp(&b.grandmaster_clock_uuid))
}

/// Compare the local default data set against a candidate's grandmaster.
fn compare_with_local(data: &ClockData, sync: &MsgSync) -> Ordering {
    data.clock_stratum
        .cmp(&sync.grandmaster_clock_stratum)
        .then_with(|| data.clock_identifier.cmp(&sync.grandmaster_clock_identifier))
        .then_with(|| data.clock_variance.cmp(&sync.grandmaster_clock_variance))
        .then_with(|| data.clock_uuid.cmp(&sync.grandmaster_clock_uuid))
}

/// Slave update: adopt the elected master as parent and its grandmaster and
/// global time properties as ours.
pub fn s1(header: &MsgHeader, sync: &MsgSync, data: &mut ClockData) {
    data.steps_removed = sync.local_steps_removed + 1;

    data.parent_communication_technology = header.source_communication_technology;
    data.parent_uuid = header.source_uuid;
    data.parent_port_id = header.source_port_id;
    data.parent_last_sync_sequence_number = header.sequence_id;
    data.parent_followup_capable = header.has_flag(PTP_ASSIST);
    data.parent_external_timing = header.has_flag(PTP_EXT_SYNC);
    data.parent_variance = sync.local_clock_variance;

    data.grandmaster_communication_technology = sync.grandmaster_communication_technology;
    data.grandmaster_uuid = sync.grandmaster_clock_uuid;
    data.grandmaster_port_id = sync.grandmaster_port_id;
    data.grandmaster_stratum = sync.grandmaster_clock_stratum;
    data.grandmaster_identifier = sync.grandmaster_clock_identifier;
    data.grandmaster_variance = sync.grandmaster_clock_variance;
    data.grandmaster_preferred = sync.grandmaster_preferred;
    data.grandmaster_is_boundary_clock = sync.grandmaster_is_boundary_clock;
    data.grandmaster_sequence_number = sync.grandmaster_sequence_id;

    data.current_utc_offset = sync.current_utc_offset;
    data.leap_59 = header.has_flag(PTP_LI_59);
    data.leap_61 = header.has_flag(PTP_LI_61);
    data.epoch_number = sync.epoch_number;
}

/// Master update: the local clock becomes its own parent and grandmaster.
pub fn m1(data: &mut ClockData) {
    data.steps_removed = 0;

    data.parent_communication_technology = data.clock_communication_technology;
    data.parent_uuid = data.clock_uuid;
    data.parent_port_id = data.clock_port_id;
    data.parent_last_sync_sequence_number = 0;
    data.parent_followup_capable = data.clock_followup_capable;
    data.parent_external_timing = data.external_timing;
    data.parent_variance = data.clock_variance;

    data.grandmaster_communication_technology = data.clock_communication_technology;
    data.grandmaster_uuid = data.clock_uuid;
    data.grandmaster_port_id = data.clock_port_id;
    data.grandmaster_stratum = data.clock_stratum;
    data.grandmaster_identifier = data.clock_identifier;
    data.grandmaster_variance = data.clock_variance;
    data.grandmaster_preferred = data.preferred;
    data.grandmaster_is_boundary_clock = data.is_boundary_clock;
}

/// Run the election over the foreign set and recommend a port state,
/// updating the data sets for the chosen role.
pub fn bmc(
    foreign: &mut ForeignMasterSet,
    data: &mut ClockData,
    opts: &RunTimeOpts,
    current_state: PortState,
) -> PortState {
    let Some(best) = foreign.pick_best() else {
        // nothing observed; a master stays master, everyone else stays put
        return current_state;
    };
    let header = best.header.clone();
    let sync = best.sync.clone();

    if opts.slave_only || data.clock_stratum == 255 {
        s1(&header, &sync, data);
        return PortState::Slave;
    }

    match compare_with_local(data, &sync) {
        Ordering::Less => {
            m1(data);
            PortState::Master
        }
        _ if data.clock_stratum == sync.grandmaster_clock_stratum => {
            // lost only on tiebreakers: do not sync to an equal-stratum peer
            PortState::Passive
        }
        _ => {
            s1(&header, &sync, data);
            PortState::Slave
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn header_from(uuid: [u8; 6], seq: u16) -> MsgHeader {
        MsgHeader {
            version_ptp: VERSION_PTP,
            source_communication_technology: PTP_ETHER,
            source_uuid: uuid,
            source_port_id: 1,
            sequence_id: seq,
            control: PTP_SYNC_MESSAGE,
            ..MsgHeader::default()
        }
    }

    fn sync_with_stratum(uuid: [u8; 6], stratum: u8) -> MsgSync {
        MsgSync {
            grandmaster_communication_technology: PTP_ETHER,
            grandmaster_clock_uuid: uuid,
            grandmaster_clock_stratum: stratum,
            grandmaster_clock_identifier: *b"DFLT",
            grandmaster_clock_variance: -4000,
            local_clock_stratum: stratum,
            local_steps_removed: 0,
            ..MsgSync::default()
        }
    }

    fn local_clock(stratum: u8) -> ClockData {
        ClockData {
            clock_communication_technology: PTP_ETHER,
            clock_uuid: [9; 6],
            clock_port_id: 1,
            clock_stratum: stratum,
            clock_identifier: *b"DFLT",
            clock_variance: -4000,
            ..ClockData::default()
        }
    }

    #[test]
    fn test_ring_bounded() {
        let mut set = ForeignMasterSet::new(3);
        for i in 0u8..10 {
            set.add(&header_from([i; 6], i as u16), &sync_with_stratum([i; 6], 4));
            assert!(set.len() <= 3);
        }
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_ring_round_robin_overwrite() {
        let mut set = ForeignMasterSet::new(2);
        set.add(&header_from([1; 6], 0), &sync_with_stratum([1; 6], 4));
        set.add(&header_from([2; 6], 0), &sync_with_stratum([2; 6], 4));
        // third candidate claims the oldest slot
        set.add(&header_from([3; 6], 0), &sync_with_stratum([3; 6], 4));
        let uuids: Vec<_> = set.records().iter().map(|r| r.uuid).collect();
        assert!(uuids.contains(&[3; 6]));
        assert!(!uuids.contains(&[1; 6]));
    }

    #[test]
    fn test_repeat_sync_bumps_count() {
        let mut set = ForeignMasterSet::new(3);
        let h = header_from([1; 6], 0);
        let s = sync_with_stratum([1; 6], 4);
        set.add(&h, &s);
        set.add(&header_from([1; 6], 1), &s);
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].syncs, 2);
        assert_eq!(set.records()[0].header.sequence_id, 1);
    }

    #[test]
    fn test_bmc_elects_lower_stratum() {
        let mut set = ForeignMasterSet::new(5);
        set.add(&header_from([1; 6], 0), &sync_with_stratum([1; 6], 4));
        set.add(&header_from([2; 6], 0), &sync_with_stratum([2; 6], 2));
        let mut data = local_clock(4);
        let opts = RunTimeOpts::default();
        let state = bmc(&mut set, &mut data, &opts, PortState::Listening);
        assert_eq!(state, PortState::Slave);
        assert_eq!(data.parent_uuid, [2; 6]);
        assert_eq!(data.grandmaster_stratum, 2);
        assert_eq!(data.steps_removed, 1);
    }

    #[test]
    fn test_bmc_stays_master_when_better() {
        let mut set = ForeignMasterSet::new(5);
        set.add(&header_from([1; 6], 0), &sync_with_stratum([1; 6], 10));
        let mut data = local_clock(2);
        let opts = RunTimeOpts::default();
        let state = bmc(&mut set, &mut data, &opts, PortState::Master);
        assert_eq!(state, PortState::Master);
        // m1: own parent
        assert_eq!(data.parent_uuid, data.clock_uuid);
        assert_eq!(data.steps_removed, 0);
    }

    #[test]
    fn test_bmc_equal_stratum_goes_passive() {
        let mut set = ForeignMasterSet::new(5);
        // same stratum, smaller uuid than ours ([9;6]) wins the tiebreak
        set.add(&header_from([1; 6], 0), &sync_with_stratum([1; 6], 4));
        let mut data = local_clock(4);
        let opts = RunTimeOpts::default();
        assert_eq!(bmc(&mut set, &mut data, &opts, PortState::Master), PortState::Passive);
    }

    #[test]
    fn test_bmc_slave_only() {
        let mut set = ForeignMasterSet::new(5);
        set.add(&header_from([1; 6], 0), &sync_with_stratum([1; 6], 200));
        let mut data = local_clock(4);
        let opts = RunTimeOpts { slave_only: true, ..RunTimeOpts::default() };
        assert_eq!(bmc(&mut set, &mut data, &opts, PortState::Listening), PortState::Slave);
    }

    #[test]
    fn test_bmc_empty_keeps_state() {
        let mut set = ForeignMasterSet::new(5);
        let mut data = local_clock(4);
        let opts = RunTimeOpts::default();
        assert_eq!(bmc(&mut set, &mut data, &opts, PortState::Master), PortState::Master);
        assert_eq!(bmc(&mut set, &mut data, &opts, PortState::Listening), PortState::Listening);
    }
}
