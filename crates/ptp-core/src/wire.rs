//! PTP v1 message pack/unpack.
//!
//! All multi-byte integers on the wire are big-endian, laid out per IEEE
//! 1588-2002 Annex D. Offsets are absolute from the start of the datagram;
//! the common header occupies bytes 0..40 and every body starts at 40.
//!
//! Header layout:
//!   Bytes   0 ..   1 = versionPTP (u16)
//!   Bytes   2 ..   3 = versionNetwork (u16)
//!   Bytes   4 ..  19 = subdomain name (16 bytes, NUL padded)
//!   Byte   20        = messageType (1 = event, 2 = general)
//!   Byte   21        = sourceCommunicationTechnology
//!   Bytes  22 ..  27 = sourceUuid (6 bytes)
//!   Bytes  28 ..  29 = sourcePortId (u16)
//!   Bytes  30 ..  31 = sequenceId (u16)
//!   Byte   32        = control (message kind)
//!   Bytes  34 ..  35 = flags (u16; bit 3 = ASSIST, bit 6 = BURST)
//!   Bytes  36 ..  39 = reserved
//!
//! Sync and Delay-Req share one 124-byte layout; Follow-Up is 52 bytes,
//! Delay-Resp 60, Management up to 136. The odd body offsets (e.g. stratum
//! at byte 67) come from Annex D packing 8/16-bit fields into 32-bit words.

use crate::constants::*;
use crate::time::TimeRepresentation;

// Header offsets.
const VERSION_PTP_OFF: usize = 0;
const VERSION_NETWORK_OFF: usize = 2;
const SUBDOMAIN_OFF: usize = 4;
const MSG_TYPE_OFF: usize = 20;
const SOURCE_COMM_TECH_OFF: usize = 21;
const SOURCE_UUID_OFF: usize = 22;
const SOURCE_PORT_ID_OFF: usize = 28;
const SEQUENCE_ID_OFF: usize = 30;
const CONTROL_OFF: usize = 32;
const FLAGS_OFF: usize = 34;

// Sync / Delay-Req body offsets.
const ORIGIN_TS_OFF: usize = 40;
const EPOCH_NUMBER_OFF: usize = 48;
const CURRENT_UTC_OFFSET_OFF: usize = 50;
const GM_COMM_TECH_OFF: usize = 53;
const GM_UUID_OFF: usize = 54;
const GM_PORT_ID_OFF: usize = 60;
const GM_SEQUENCE_ID_OFF: usize = 62;
const GM_STRATUM_OFF: usize = 67;
const GM_IDENTIFIER_OFF: usize = 68;
const GM_VARIANCE_OFF: usize = 74;
const GM_PREFERRED_OFF: usize = 77;
const GM_IS_BOUNDARY_OFF: usize = 79;
const SYNC_INTERVAL_OFF: usize = 83;
const LOCAL_VARIANCE_OFF: usize = 86;
const LOCAL_STEPS_REMOVED_OFF: usize = 88;
const LOCAL_STRATUM_OFF: usize = 91;
const LOCAL_IDENTIFIER_OFF: usize = 92;
const PARENT_COMM_TECH_OFF: usize = 97;
const PARENT_UUID_OFF: usize = 98;
const PARENT_PORT_ID_OFF: usize = 106;
const EST_MASTER_VARIANCE_OFF: usize = 110;
const EST_MASTER_DRIFT_OFF: usize = 112;
const UTC_REASONABLE_OFF: usize = 117;

// Follow-Up body offsets.
const FU_ASSOC_SEQUENCE_OFF: usize = 42;
const FU_PRECISE_TS_OFF: usize = 44;

// Delay-Resp body offsets.
const DR_RECEIPT_TS_OFF: usize = 40;
const DR_REQ_COMM_TECH_OFF: usize = 49;
const DR_REQ_UUID_OFF: usize = 50;
const DR_REQ_PORT_ID_OFF: usize = 56;
const DR_REQ_SEQUENCE_OFF: usize = 58;

// Management offsets; the payload starts at 60 and is `parameter_length`
// bytes of key-specific fields in declaration order.
const MM_TARGET_COMM_TECH_OFF: usize = 41;
const MM_TARGET_UUID_OFF: usize = 42;
const MM_TARGET_PORT_ID_OFF: usize = 48;
const MM_STARTING_HOPS_OFF: usize = 50;
const MM_HOPS_OFF: usize = 52;
const MM_KEY_OFF: usize = 55;
const MM_PARAMETER_LENGTH_OFF: usize = 58;
pub const MM_PAYLOAD_OFF: usize = 60;

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}

fn get_i16(buf: &[u8], off: usize) -> i16 {
    i16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_i16(buf: &mut [u8], off: usize, v: i16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

fn put_i32(buf: &mut [u8], off: usize, v: i32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

fn get_ts(buf: &[u8], off: usize) -> TimeRepresentation {
    TimeRepresentation {
        seconds: get_u32(buf, off),
        nanoseconds: get_u32(buf, off + 4),
    }
}

fn put_ts(buf: &mut [u8], off: usize, ts: &TimeRepresentation) {
    put_u32(buf, off, ts.seconds);
    put_u32(buf, off + 4, ts.nanoseconds);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub version_ptp: u16,
    pub version_network: u16,
    pub subdomain: [u8; PTP_SUBDOMAIN_NAME_LENGTH],
    pub message_type: u8,
    pub source_communication_technology: u8,
    pub source_uuid: [u8; PTP_UUID_LENGTH],
    pub source_port_id: u16,
    pub sequence_id: u16,
    pub control: u8,
    pub flags: u16,
}

impl MsgHeader {
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Sync and Delay-Req payload (identical layouts).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MsgSync {
    pub origin_timestamp: TimeRepresentation,
    pub epoch_number: u16,
    pub current_utc_offset: i16,
    pub grandmaster_communication_technology: u8,
    pub grandmaster_clock_uuid: [u8; PTP_UUID_LENGTH],
    pub grandmaster_port_id: u16,
    pub grandmaster_sequence_id: u16,
    pub grandmaster_clock_stratum: u8,
    pub grandmaster_clock_identifier: [u8; PTP_CODE_STRING_LENGTH],
    pub grandmaster_clock_variance: i16,
    pub grandmaster_preferred: bool,
    pub grandmaster_is_boundary_clock: bool,
    pub sync_interval: i8,
    pub local_clock_variance: i16,
    pub local_steps_removed: u16,
    pub local_clock_stratum: u8,
    pub local_clock_identifier: [u8; PTP_CODE_STRING_LENGTH],
    pub parent_communication_technology: u8,
    pub parent_uuid: [u8; PTP_UUID_LENGTH],
    pub parent_port_id: u16,
    pub estimated_master_variance: i16,
    pub estimated_master_drift: i32,
    pub utc_reasonable: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MsgFollowUp {
    pub associated_sequence_id: u16,
    pub precise_origin_timestamp: TimeRepresentation,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MsgDelayResp {
    pub delay_receipt_timestamp: TimeRepresentation,
    pub requesting_source_communication_technology: u8,
    pub requesting_source_uuid: [u8; PTP_UUID_LENGTH],
    pub requesting_source_port_id: u16,
    pub requesting_source_sequence_id: u16,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MsgManagement {
    pub target_communication_technology: u8,
    pub target_uuid: [u8; PTP_UUID_LENGTH],
    pub target_port_id: u16,
    pub starting_boundary_hops: i16,
    pub boundary_hops: i16,
    pub management_message_key: u8,
    pub payload: Vec<u8>,
}

/// Cheap pre-dispatch validation. Rejects datagrams too short to carry a
/// version field, oversized garbage, and foreign protocol versions; anything
/// else (including short-but-typed messages) is left to the dispatcher so a
/// truncated message of a known type still faults the port.
pub fn msg_peek(buf: &[u8]) -> bool {
    if buf.len() < 2 || buf.len() > PACKET_SIZE {
        return false;
    }
    get_u16(buf, VERSION_PTP_OFF) == VERSION_PTP
}

pub fn unpack_header(buf: &[u8]) -> MsgHeader {
    let mut subdomain = [0u8; PTP_SUBDOMAIN_NAME_LENGTH];
    subdomain.copy_from_slice(&buf[SUBDOMAIN_OFF..SUBDOMAIN_OFF + PTP_SUBDOMAIN_NAME_LENGTH]);
    let mut source_uuid = [0u8; PTP_UUID_LENGTH];
    source_uuid.copy_from_slice(&buf[SOURCE_UUID_OFF..SOURCE_UUID_OFF + PTP_UUID_LENGTH]);

    MsgHeader {
        version_ptp: get_u16(buf, VERSION_PTP_OFF),
        version_network: get_u16(buf, VERSION_NETWORK_OFF),
        subdomain,
        message_type: buf[MSG_TYPE_OFF],
        source_communication_technology: buf[SOURCE_COMM_TECH_OFF],
        source_uuid,
        source_port_id: get_u16(buf, SOURCE_PORT_ID_OFF),
        sequence_id: get_u16(buf, SEQUENCE_ID_OFF),
        control: buf[CONTROL_OFF],
        flags: get_u16(buf, FLAGS_OFF),
    }
}

pub fn unpack_sync(buf: &[u8]) -> MsgSync {
    let mut gm_uuid = [0u8; PTP_UUID_LENGTH];
    gm_uuid.copy_from_slice(&buf[GM_UUID_OFF..GM_UUID_OFF + PTP_UUID_LENGTH]);
    let mut gm_ident = [0u8; PTP_CODE_STRING_LENGTH];
    gm_ident.copy_from_slice(&buf[GM_IDENTIFIER_OFF..GM_IDENTIFIER_OFF + PTP_CODE_STRING_LENGTH]);
    let mut local_ident = [0u8; PTP_CODE_STRING_LENGTH];
    local_ident
        .copy_from_slice(&buf[LOCAL_IDENTIFIER_OFF..LOCAL_IDENTIFIER_OFF + PTP_CODE_STRING_LENGTH]);
    let mut parent_uuid = [0u8; PTP_UUID_LENGTH];
    parent_uuid.copy_from_slice(&buf[PARENT_UUID_OFF..PARENT_UUID_OFF + PTP_UUID_LENGTH]);

    MsgSync {
        origin_timestamp: get_ts(buf, ORIGIN_TS_OFF),
        epoch_number: get_u16(buf, EPOCH_NUMBER_OFF),
        current_utc_offset: get_i16(buf, CURRENT_UTC_OFFSET_OFF),
        grandmaster_communication_technology: buf[GM_COMM_TECH_OFF],
        grandmaster_clock_uuid: gm_uuid,
        grandmaster_port_id: get_u16(buf, GM_PORT_ID_OFF),
        grandmaster_sequence_id: get_u16(buf, GM_SEQUENCE_ID_OFF),
        grandmaster_clock_stratum: buf[GM_STRATUM_OFF],
        grandmaster_clock_identifier: gm_ident,
        grandmaster_clock_variance: get_i16(buf, GM_VARIANCE_OFF),
        grandmaster_preferred: buf[GM_PREFERRED_OFF] != 0,
        grandmaster_is_boundary_clock: buf[GM_IS_BOUNDARY_OFF] != 0,
        sync_interval: buf[SYNC_INTERVAL_OFF] as i8,
        local_clock_variance: get_i16(buf, LOCAL_VARIANCE_OFF),
        local_steps_removed: get_u16(buf, LOCAL_STEPS_REMOVED_OFF),
        local_clock_stratum: buf[LOCAL_STRATUM_OFF],
        local_clock_identifier: local_ident,
        parent_communication_technology: buf[PARENT_COMM_TECH_OFF],
        parent_uuid,
        parent_port_id: get_u16(buf, PARENT_PORT_ID_OFF),
        estimated_master_variance: get_i16(buf, EST_MASTER_VARIANCE_OFF),
        estimated_master_drift: get_i32(buf, EST_MASTER_DRIFT_OFF),
        utc_reasonable: buf[UTC_REASONABLE_OFF] != 0,
    }
}

/// Delay-Req carries the same body as Sync.
pub fn unpack_delay_req(buf: &[u8]) -> MsgSync {
    unpack_sync(buf)
}

pub fn unpack_follow_up(buf: &[u8]) -> MsgFollowUp {
    MsgFollowUp {
        associated_sequence_id: get_u16(buf, FU_ASSOC_SEQUENCE_OFF),
        precise_origin_timestamp: get_ts(buf, FU_PRECISE_TS_OFF),
    }
}

pub fn unpack_delay_resp(buf: &[u8]) -> MsgDelayResp {
    let mut req_uuid = [0u8; PTP_UUID_LENGTH];
    req_uuid.copy_from_slice(&buf[DR_REQ_UUID_OFF..DR_REQ_UUID_OFF + PTP_UUID_LENGTH]);

    MsgDelayResp {
        delay_receipt_timestamp: get_ts(buf, DR_RECEIPT_TS_OFF),
        requesting_source_communication_technology: buf[DR_REQ_COMM_TECH_OFF],
        requesting_source_uuid: req_uuid,
        requesting_source_port_id: get_u16(buf, DR_REQ_PORT_ID_OFF),
        requesting_source_sequence_id: get_u16(buf, DR_REQ_SEQUENCE_OFF),
    }
}

pub fn unpack_management(buf: &[u8]) -> MsgManagement {
    let mut target_uuid = [0u8; PTP_UUID_LENGTH];
    target_uuid.copy_from_slice(&buf[MM_TARGET_UUID_OFF..MM_TARGET_UUID_OFF + PTP_UUID_LENGTH]);

    let parameter_length = get_u16(buf, MM_PARAMETER_LENGTH_OFF) as usize;
    let end = (MM_PAYLOAD_OFF + parameter_length).min(buf.len());
    let payload = buf[MM_PAYLOAD_OFF.min(end)..end].to_vec();

    MsgManagement {
        target_communication_technology: buf[MM_TARGET_COMM_TECH_OFF],
        target_uuid,
        target_port_id: get_u16(buf, MM_TARGET_PORT_ID_OFF),
        starting_boundary_hops: get_i16(buf, MM_STARTING_HOPS_OFF),
        boundary_hops: get_i16(buf, MM_HOPS_OFF),
        management_message_key: buf[MM_KEY_OFF],
        payload,
    }
}

/// Pack the invariant header fields once at init; per-message packers only
/// touch messageType, sequence, control and flags.
pub fn pack_header(
    buf: &mut [u8],
    subdomain: &[u8; PTP_SUBDOMAIN_NAME_LENGTH],
    communication_technology: u8,
    uuid: &[u8; PTP_UUID_LENGTH],
    port_id: u16,
) {
    buf[..HEADER_LENGTH].fill(0);
    put_u16(buf, VERSION_PTP_OFF, VERSION_PTP);
    put_u16(buf, VERSION_NETWORK_OFF, VERSION_NETWORK);
    buf[SUBDOMAIN_OFF..SUBDOMAIN_OFF + PTP_SUBDOMAIN_NAME_LENGTH].copy_from_slice(subdomain);
    buf[SOURCE_COMM_TECH_OFF] = communication_technology;
    buf[SOURCE_UUID_OFF..SOURCE_UUID_OFF + PTP_UUID_LENGTH].copy_from_slice(uuid);
    put_u16(buf, SOURCE_PORT_ID_OFF, port_id);
}

/// Overwrite the per-message header fields on top of a packed header.
pub fn pack_message_header(buf: &mut [u8], message_type: u8, sequence_id: u16, control: u8, flags: u16) {
    buf[MSG_TYPE_OFF] = message_type;
    put_u16(buf, SEQUENCE_ID_OFF, sequence_id);
    buf[CONTROL_OFF] = control;
    put_u16(buf, FLAGS_OFF, flags);
}

pub fn pack_sync_body(buf: &mut [u8], sync: &MsgSync) {
    buf[HEADER_LENGTH..SYNC_PACKET_LENGTH].fill(0);
    put_ts(buf, ORIGIN_TS_OFF, &sync.origin_timestamp);
    put_u16(buf, EPOCH_NUMBER_OFF, sync.epoch_number);
    put_i16(buf, CURRENT_UTC_OFFSET_OFF, sync.current_utc_offset);
    buf[GM_COMM_TECH_OFF] = sync.grandmaster_communication_technology;
    buf[GM_UUID_OFF..GM_UUID_OFF + PTP_UUID_LENGTH].copy_from_slice(&sync.grandmaster_clock_uuid);
    put_u16(buf, GM_PORT_ID_OFF, sync.grandmaster_port_id);
    put_u16(buf, GM_SEQUENCE_ID_OFF, sync.grandmaster_sequence_id);
    buf[GM_STRATUM_OFF] = sync.grandmaster_clock_stratum;
    buf[GM_IDENTIFIER_OFF..GM_IDENTIFIER_OFF + PTP_CODE_STRING_LENGTH]
        .copy_from_slice(&sync.grandmaster_clock_identifier);
    put_i16(buf, GM_VARIANCE_OFF, sync.grandmaster_clock_variance);
    buf[GM_PREFERRED_OFF] = sync.grandmaster_preferred as u8;
    buf[GM_IS_BOUNDARY_OFF] = sync.grandmaster_is_boundary_clock as u8;
    buf[SYNC_INTERVAL_OFF] = sync.sync_interval as u8;
    put_i16(buf, LOCAL_VARIANCE_OFF, sync.local_clock_variance);
    put_u16(buf, LOCAL_STEPS_REMOVED_OFF, sync.local_steps_removed);
    buf[LOCAL_STRATUM_OFF] = sync.local_clock_stratum;
    buf[LOCAL_IDENTIFIER_OFF..LOCAL_IDENTIFIER_OFF + PTP_CODE_STRING_LENGTH]
        .copy_from_slice(&sync.local_clock_identifier);
    buf[PARENT_COMM_TECH_OFF] = sync.parent_communication_technology;
    buf[PARENT_UUID_OFF..PARENT_UUID_OFF + PTP_UUID_LENGTH].copy_from_slice(&sync.parent_uuid);
    put_u16(buf, PARENT_PORT_ID_OFF, sync.parent_port_id);
    put_i16(buf, EST_MASTER_VARIANCE_OFF, sync.estimated_master_variance);
    put_i32(buf, EST_MASTER_DRIFT_OFF, sync.estimated_master_drift);
    buf[UTC_REASONABLE_OFF] = sync.utc_reasonable as u8;
}

pub fn pack_follow_up_body(buf: &mut [u8], follow: &MsgFollowUp) {
    buf[HEADER_LENGTH..FOLLOW_UP_PACKET_LENGTH].fill(0);
    put_u16(buf, FU_ASSOC_SEQUENCE_OFF, follow.associated_sequence_id);
    put_ts(buf, FU_PRECISE_TS_OFF, &follow.precise_origin_timestamp);
}

pub fn pack_delay_resp_body(buf: &mut [u8], resp: &MsgDelayResp) {
    buf[HEADER_LENGTH..DELAY_RESP_PACKET_LENGTH].fill(0);
    put_ts(buf, DR_RECEIPT_TS_OFF, &resp.delay_receipt_timestamp);
    buf[DR_REQ_COMM_TECH_OFF] = resp.requesting_source_communication_technology;
    buf[DR_REQ_UUID_OFF..DR_REQ_UUID_OFF + PTP_UUID_LENGTH]
        .copy_from_slice(&resp.requesting_source_uuid);
    put_u16(buf, DR_REQ_PORT_ID_OFF, resp.requesting_source_port_id);
    put_u16(buf, DR_REQ_SEQUENCE_OFF, resp.requesting_source_sequence_id);
}

/// Pack a management body; returns the total packet length. The payload is
/// truncated to fit the fixed management packet size.
pub fn pack_management_body(buf: &mut [u8], manage: &MsgManagement) -> usize {
    buf[HEADER_LENGTH..MANAGEMENT_PACKET_LENGTH].fill(0);
    buf[MM_TARGET_COMM_TECH_OFF] = manage.target_communication_technology;
    buf[MM_TARGET_UUID_OFF..MM_TARGET_UUID_OFF + PTP_UUID_LENGTH]
        .copy_from_slice(&manage.target_uuid);
    put_u16(buf, MM_TARGET_PORT_ID_OFF, manage.target_port_id);
    put_i16(buf, MM_STARTING_HOPS_OFF, manage.starting_boundary_hops);
    put_i16(buf, MM_HOPS_OFF, manage.boundary_hops);
    buf[MM_KEY_OFF] = manage.management_message_key;

    let room = MANAGEMENT_PACKET_LENGTH - MM_PAYLOAD_OFF;
    let len = manage.payload.len().min(room);
    put_u16(buf, MM_PARAMETER_LENGTH_OFF, len as u16);
    buf[MM_PAYLOAD_OFF..MM_PAYLOAD_OFF + len].copy_from_slice(&manage.payload[..len]);

    MM_PAYLOAD_OFF + len
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_header_buf() -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        let mut subdomain = [0u8; PTP_SUBDOMAIN_NAME_LENGTH];
        subdomain[..5].copy_from_slice(b"_DFLT");
        pack_header(&mut buf, &subdomain, PTP_ETHER, &[1, 2, 3, 4, 5, 6], 1);
        buf
    }

    fn test_sync() -> MsgSync {
        MsgSync {
            origin_timestamp: TimeRepresentation { seconds: 1_200_569_796, nanoseconds: 698_871_196 },
            epoch_number: 0,
            current_utc_offset: 33,
            grandmaster_communication_technology: PTP_ETHER,
            grandmaster_clock_uuid: [0xaa, 0xbb, 0xcc, 1, 2, 3],
            grandmaster_port_id: 1,
            grandmaster_sequence_id: 777,
            grandmaster_clock_stratum: 2,
            grandmaster_clock_identifier: *b"GPS\0",
            grandmaster_clock_variance: -4000,
            grandmaster_preferred: true,
            grandmaster_is_boundary_clock: false,
            sync_interval: 1,
            local_clock_variance: -4000,
            local_steps_removed: 3,
            local_clock_stratum: 2,
            local_clock_identifier: *b"DFLT",
            parent_communication_technology: PTP_ETHER,
            parent_uuid: [9, 8, 7, 6, 5, 4],
            parent_port_id: 1,
            estimated_master_variance: -100,
            estimated_master_drift: -52_000,
            utc_reasonable: true,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = test_header_buf();
        pack_message_header(&mut buf, PTP_EVENT_MESSAGE_TYPE, 65_535, PTP_SYNC_MESSAGE, PTP_ASSIST);
        let h = unpack_header(&buf);
        assert_eq!(h.version_ptp, 1);
        assert_eq!(h.version_network, 1);
        assert_eq!(&h.subdomain[..5], b"_DFLT");
        assert_eq!(h.message_type, PTP_EVENT_MESSAGE_TYPE);
        assert_eq!(h.source_communication_technology, PTP_ETHER);
        assert_eq!(h.source_uuid, [1, 2, 3, 4, 5, 6]);
        assert_eq!(h.source_port_id, 1);
        assert_eq!(h.sequence_id, 65_535);
        assert_eq!(h.control, PTP_SYNC_MESSAGE);
        assert!(h.has_flag(PTP_ASSIST));
        assert!(!h.has_flag(PTP_SYNC_BURST));
    }

    #[test]
    fn test_sync_roundtrip() {
        let mut buf = test_header_buf();
        let sync = test_sync();
        pack_sync_body(&mut buf, &sync);
        assert_eq!(unpack_sync(&buf[..SYNC_PACKET_LENGTH]), sync);
    }

    #[test]
    fn test_sync_field_positions() {
        // spot-check the Annex D word packing against fixed byte positions
        let mut buf = test_header_buf();
        pack_sync_body(&mut buf, &test_sync());
        assert_eq!(get_u32(&buf, 40), 1_200_569_796);
        assert_eq!(buf[67], 2); // grandmaster stratum
        assert_eq!(&buf[68..72], b"GPS\0");
        assert_eq!(buf[77], 1); // preferred
        assert_eq!(buf[83] as i8, 1); // sync interval
        assert_eq!(get_u16(&buf, 88), 3); // steps removed
        assert_eq!(buf[117], 1); // utc reasonable
    }

    #[test]
    fn test_follow_up_roundtrip() {
        let mut buf = test_header_buf();
        let follow = MsgFollowUp {
            associated_sequence_id: 4242,
            precise_origin_timestamp: TimeRepresentation { seconds: 7, nanoseconds: 0x8000_0001 },
        };
        pack_follow_up_body(&mut buf, &follow);
        assert_eq!(unpack_follow_up(&buf[..FOLLOW_UP_PACKET_LENGTH]), follow);
    }

    #[test]
    fn test_delay_resp_roundtrip() {
        let mut buf = test_header_buf();
        let resp = MsgDelayResp {
            delay_receipt_timestamp: TimeRepresentation { seconds: 100, nanoseconds: 42 },
            requesting_source_communication_technology: PTP_ETHER,
            requesting_source_uuid: [1, 1, 2, 3, 5, 8],
            requesting_source_port_id: 1,
            requesting_source_sequence_id: 888,
        };
        pack_delay_resp_body(&mut buf, &resp);
        assert_eq!(unpack_delay_resp(&buf[..DELAY_RESP_PACKET_LENGTH]), resp);
    }

    #[test]
    fn test_management_roundtrip() {
        let mut buf = test_header_buf();
        let manage = MsgManagement {
            target_communication_technology: PTP_DEFAULT,
            target_uuid: [0; 6],
            target_port_id: 0,
            starting_boundary_hops: MM_STARTING_BOUNDARY_HOPS,
            boundary_hops: 0,
            management_message_key: PTP_MM_SET_SYNC_INTERVAL,
            payload: vec![2],
        };
        let len = pack_management_body(&mut buf, &manage);
        assert_eq!(len, MM_PAYLOAD_OFF + 1);
        assert_eq!(unpack_management(&buf[..len]), manage);
    }

    #[test]
    fn test_peek_rejects() {
        let mut buf = test_header_buf();
        pack_message_header(&mut buf, PTP_EVENT_MESSAGE_TYPE, 1, PTP_SYNC_MESSAGE, 0);
        assert!(msg_peek(&buf[..SYNC_PACKET_LENGTH]));
        // short-but-typed messages pass peek; the dispatcher faults on them
        assert!(msg_peek(&buf[..20]));
        assert!(!msg_peek(&buf[..1]));
        let mut bad = buf;
        put_u16(&mut bad, 0, 2); // v2 is a different protocol
        assert!(!msg_peek(&bad[..SYNC_PACKET_LENGTH]));
    }
}
