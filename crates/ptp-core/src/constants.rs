//! Protocol and implementation constants.
//!
//! Wire-format values are fixed by IEEE 1588-2002 Annex D; everything else is
//! either a v1 default data-set value or a local implementation limit.

use std::time::Duration;

pub const VERSION_PTP: u16 = 1;
pub const VERSION_NETWORK: u16 = 1;

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;

/// Subdomain → multicast group table (§ D.3). Unknown names hash into the
/// three alternates.
pub const DEFAULT_PTP_DOMAIN_ADDRESS: &str = "224.0.1.129";
pub const ALTERNATE_PTP_DOMAIN1_ADDRESS: &str = "224.0.1.130";
pub const ALTERNATE_PTP_DOMAIN2_ADDRESS: &str = "224.0.1.131";
pub const ALTERNATE_PTP_DOMAIN3_ADDRESS: &str = "224.0.1.132";

pub const DEFAULT_PTP_DOMAIN_NAME: &str = "_DFLT";
pub const ALTERNATE_PTP_DOMAIN1_NAME: &str = "_ALT1";
pub const ALTERNATE_PTP_DOMAIN2_NAME: &str = "_ALT2";
pub const ALTERNATE_PTP_DOMAIN3_NAME: &str = "_ALT3";

pub const PTP_SUBDOMAIN_NAME_LENGTH: usize = 16;
pub const PTP_UUID_LENGTH: usize = 6;
pub const PTP_CODE_STRING_LENGTH: usize = 4;

/// Largest datagram the port will accept; everything longer is garbage.
pub const PACKET_SIZE: usize = 300;

pub const HEADER_LENGTH: usize = 40;
pub const SYNC_PACKET_LENGTH: usize = 124;
pub const DELAY_REQ_PACKET_LENGTH: usize = 124;
pub const FOLLOW_UP_PACKET_LENGTH: usize = 52;
pub const DELAY_RESP_PACKET_LENGTH: usize = 60;
pub const MANAGEMENT_PACKET_LENGTH: usize = 136;

/// Header `control` field values (message kinds).
pub const PTP_SYNC_MESSAGE: u8 = 0;
pub const PTP_DELAY_REQ_MESSAGE: u8 = 1;
pub const PTP_FOLLOWUP_MESSAGE: u8 = 2;
pub const PTP_DELAY_RESP_MESSAGE: u8 = 3;
pub const PTP_MANAGEMENT_MESSAGE: u8 = 4;

/// Header `messageType` field: event vs general channel.
pub const PTP_EVENT_MESSAGE_TYPE: u8 = 1;
pub const PTP_GENERAL_MESSAGE_TYPE: u8 = 2;

/// Header flag bits (flags field read as big-endian u16).
pub const PTP_LI_61: u16 = 1 << 0;
pub const PTP_LI_59: u16 = 1 << 1;
pub const PTP_BOUNDARY_CLOCK: u16 = 1 << 2;
pub const PTP_ASSIST: u16 = 1 << 3;
pub const PTP_EXT_SYNC: u16 = 1 << 4;
pub const PTP_PARENT_STATS: u16 = 1 << 5;
pub const PTP_SYNC_BURST: u16 = 1 << 6;

/// Communication technology codes.
pub const PTP_CLOSED: u8 = 0;
pub const PTP_ETHER: u8 = 1;
pub const PTP_DEFAULT: u8 = 255;

/// Management message keys (the subset this port routes).
pub const PTP_MM_NULL: u8 = 0;
pub const PTP_MM_OBTAIN_IDENTITY: u8 = 1;
pub const PTP_MM_CLOCK_IDENTITY: u8 = 2;
pub const PTP_MM_INITIALIZE_CLOCK: u8 = 3;
pub const PTP_MM_SET_SUBDOMAIN: u8 = 4;
pub const PTP_MM_CLEAR_DESIGNATED_PREFERRED_MASTER: u8 = 5;
pub const PTP_MM_SET_DESIGNATED_PREFERRED_MASTER: u8 = 6;
pub const PTP_MM_GET_DEFAULT_DATA_SET: u8 = 7;
pub const PTP_MM_DEFAULT_DATA_SET: u8 = 8;
pub const PTP_MM_UPDATE_DEFAULT_DATA_SET: u8 = 9;
pub const PTP_MM_GET_CURRENT_DATA_SET: u8 = 10;
pub const PTP_MM_CURRENT_DATA_SET: u8 = 11;
pub const PTP_MM_GET_PARENT_DATA_SET: u8 = 12;
pub const PTP_MM_PARENT_DATA_SET: u8 = 13;
pub const PTP_MM_GET_PORT_DATA_SET: u8 = 14;
pub const PTP_MM_PORT_DATA_SET: u8 = 15;
pub const PTP_MM_GET_GLOBAL_TIME_DATA_SET: u8 = 16;
pub const PTP_MM_GLOBAL_TIME_DATA_SET: u8 = 17;
pub const PTP_MM_UPDATE_GLOBAL_TIME_PROPERTIES: u8 = 18;
pub const PTP_MM_GOTO_FAULTY_STATE: u8 = 19;
pub const PTP_MM_GET_FOREIGN_DATA_SET: u8 = 20;
pub const PTP_MM_FOREIGN_DATA_SET: u8 = 21;
pub const PTP_MM_SET_SYNC_INTERVAL: u8 = 22;
pub const PTP_MM_DISABLE_PORT: u8 = 23;
pub const PTP_MM_ENABLE_PORT: u8 = 24;
pub const PTP_MM_DISABLE_BURST: u8 = 25;
pub const PTP_MM_ENABLE_BURST: u8 = 26;
pub const PTP_MM_SET_TIME: u8 = 27;

pub const MM_STARTING_BOUNDARY_HOPS: i16 = 0x7fff;

/// A slave issues a Delay-Req at most every PTP_DELAY_REQ_INTERVAL Syncs.
pub const PTP_DELAY_REQ_INTERVAL: u16 = 30;

/// Servo saturation in ppb. The canonical 5 120 000 (bare adjtimex frequency
/// range) is too small on a loaded host: once the drift accumulator clamps
/// there, the controller can no longer pull the offset back and the clock has
/// to be stepped once a second of error has built up. The us/tick term raises
/// the usable range far beyond this, so the clamp is only a sanity bound.
pub const ADJ_FREQ_MAX: i32 = 512_000_000;

/// Default data-set values.
pub const DEFAULT_SYNC_INTERVAL: i8 = 1;
pub const DEFAULT_CLOCK_STRATUM: u8 = 4;
pub const DEFAULT_CLOCK_VARIANCE: i16 = -4000;
pub const DEFAULT_CLOCK_IDENTIFIER: &str = "DFLT";
pub const DEFAULT_UTC_OFFSET: i16 = 0;
pub const DEFAULT_MAX_FOREIGN_RECORDS: usize = 5;
pub const DEFAULT_AP: i32 = 10;
pub const DEFAULT_AI: i32 = 1000;
pub const DEFAULT_DELAY_S: i16 = 6;

pub const MANUFACTURER_ID: &str = "ptpd;2.rc1";

/// How long `send_event` waits for the NIC to produce a TX timestamp.
pub const TX_TIMESTAMP_DEADLINE: Duration = Duration::from_millis(500);

/// Sync interval in seconds from its log2 form. Negative exponents (down to
/// -2 per the port data set) give sub-second intervals.
pub fn sync_interval_duration(log2_interval: i8) -> Duration {
    Duration::from_secs_f64(2f64.powi(log2_interval as i32))
}

/// Sync receipt timeout: four sync intervals without a parent Sync means the
/// master is gone.
pub fn sync_receipt_timeout(log2_interval: i8) -> Duration {
    sync_interval_duration(log2_interval) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_arming_range() {
        // log2 interval -2..=+4 must all produce positive, finite durations
        for i in -2i8..=4 {
            let d = sync_interval_duration(i);
            assert!(d > Duration::ZERO, "interval {i}");
            assert_eq!(sync_receipt_timeout(i), d * 4);
        }
        assert_eq!(sync_interval_duration(0), Duration::from_secs(1));
        assert_eq!(sync_interval_duration(1), Duration::from_secs(2));
        assert_eq!(sync_interval_duration(-2), Duration::from_millis(250));
    }
}
