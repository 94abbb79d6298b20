//! Signed second/nanosecond time values and their on-wire representation.
//!
//! `TimeInternal` is the arithmetic form used everywhere inside the port:
//! both fields are signed and share the sign of the represented value (or are
//! zero), with |nanoseconds| < 1e9. `TimeRepresentation` is the v1 wire form:
//! unsigned seconds plus a nanoseconds field whose high bit carries the sign;
//! values beyond 2^31-1 seconds spill into the "half epoch" bit kept outside
//! the message.

use std::fmt;

pub const NSEC_PER_SEC: i32 = 1_000_000_000;

/// Half-epoch quantum: one full run of the unsigned seconds field.
const HALF_EPOCH: u32 = i32::MAX as u32;

/// Sign bit of the wire nanoseconds field.
const NSEC_SIGN_BIT: u32 = 0x8000_0000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeInternal {
    pub seconds: i32,
    pub nanoseconds: i32,
}

impl TimeInternal {
    pub const ZERO: TimeInternal = TimeInternal { seconds: 0, nanoseconds: 0 };

    pub fn new(seconds: i32, nanoseconds: i32) -> Self {
        let mut t = TimeInternal { seconds, nanoseconds };
        t.normalize();
        t
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.nanoseconds == 0
    }

    /// Restore canonical form: |nanoseconds| < 1e9 and both components
    /// sharing the sign of the value.
    pub fn normalize(&mut self) {
        self.seconds += self.nanoseconds / NSEC_PER_SEC;
        self.nanoseconds -= self.nanoseconds / NSEC_PER_SEC * NSEC_PER_SEC;

        if self.seconds > 0 && self.nanoseconds < 0 {
            self.seconds -= 1;
            self.nanoseconds += NSEC_PER_SEC;
        } else if self.seconds < 0 && self.nanoseconds > 0 {
            self.seconds += 1;
            self.nanoseconds -= NSEC_PER_SEC;
        }
    }

    pub fn add(&self, other: &TimeInternal) -> TimeInternal {
        TimeInternal::new(
            self.seconds + other.seconds,
            self.nanoseconds + other.nanoseconds,
        )
    }

    pub fn sub(&self, other: &TimeInternal) -> TimeInternal {
        TimeInternal::new(
            self.seconds - other.seconds,
            self.nanoseconds - other.nanoseconds,
        )
    }

    pub fn halve(&mut self) {
        self.seconds /= 2;
        self.nanoseconds /= 2;
    }

    pub fn is_negative(&self) -> bool {
        self.seconds < 0 || self.nanoseconds < 0
    }

    pub fn neg(&self) -> TimeInternal {
        TimeInternal { seconds: -self.seconds, nanoseconds: -self.nanoseconds }
    }

    pub fn from_timespec(sec: i64, nsec: i64) -> TimeInternal {
        TimeInternal { seconds: sec as i32, nanoseconds: nsec as i32 }
    }
}

impl fmt::Display for TimeInternal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}.{:09}",
            if self.is_negative() { "-" } else { "" },
            self.seconds.abs(),
            self.nanoseconds.abs()
        )
    }
}

/// On-wire timestamp (IEEE 1588-2002 §5.3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeRepresentation {
    pub seconds: u32,
    pub nanoseconds: u32,
}

/// Wire → internal. Returns the value and reports whether the sender's
/// seconds field had wrapped past the half epoch.
pub fn to_internal_time(external: &TimeRepresentation, half_epoch: &mut bool) -> TimeInternal {
    *half_epoch = external.seconds / HALF_EPOCH != 0;

    if external.nanoseconds & NSEC_SIGN_BIT != 0 {
        TimeInternal {
            seconds: -((external.seconds % HALF_EPOCH) as i32),
            nanoseconds: -((external.nanoseconds & !NSEC_SIGN_BIT) as i32),
        }
    } else {
        TimeInternal {
            seconds: (external.seconds % HALF_EPOCH) as i32,
            nanoseconds: external.nanoseconds as i32,
        }
    }
}

/// Internal → wire. A negative value is encoded as positive magnitude with
/// the nanoseconds sign bit set; `half_epoch` shifts the seconds field.
pub fn from_internal_time(internal: &TimeInternal, half_epoch: bool) -> TimeRepresentation {
    let seconds = internal.seconds.unsigned_abs() + if half_epoch { HALF_EPOCH } else { 0 };

    let nanoseconds = if internal.is_negative() {
        internal.nanoseconds.unsigned_abs() | NSEC_SIGN_BIT
    } else {
        internal.nanoseconds.unsigned_abs()
    };

    TimeRepresentation { seconds, nanoseconds }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub_canonical() {
        let a = TimeInternal::new(1, 900_000_000);
        let b = TimeInternal::new(0, 200_000_000);
        let sum = a.add(&b);
        assert_eq!(sum, TimeInternal { seconds: 2, nanoseconds: 100_000_000 });
        assert_eq!(sum.sub(&b), a);
    }

    #[test]
    fn test_sub_crosses_zero() {
        let a = TimeInternal::new(0, 100_000_000);
        let b = TimeInternal::new(1, 0);
        let d = a.sub(&b);
        assert_eq!(d, TimeInternal { seconds: 0, nanoseconds: -900_000_000 });
        assert!(d.is_negative());
        // components never disagree in sign after normalize
        let e = TimeInternal::new(-2, 500_000_000);
        assert_eq!(e, TimeInternal { seconds: -1, nanoseconds: -500_000_000 });
    }

    #[test]
    fn test_closure_roundtrip() {
        let cases = [
            (0, 0),
            (5, 1),
            (-3, -999_999_999),
            (100, 999_999_999),
            (-1, 0),
        ];
        for &(s, ns) in &cases {
            let a = TimeInternal { seconds: s, nanoseconds: ns };
            for &(s2, ns2) in &cases {
                let b = TimeInternal { seconds: s2, nanoseconds: ns2 };
                assert_eq!(a.add(&b).sub(&b), a, "a={a} b={b}");
            }
        }
    }

    #[test]
    fn test_half_epoch_roundtrip_positive() {
        let t = TimeInternal { seconds: 1_200_569_796, nanoseconds: 698_871_196 };
        let mut he = false;
        let rt = to_internal_time(&from_internal_time(&t, false), &mut he);
        assert_eq!(rt, t);
        assert!(!he);
    }

    #[test]
    fn test_half_epoch_roundtrip_negative() {
        let t = TimeInternal { seconds: -2, nanoseconds: -123 };
        let mut he = false;
        let rt = to_internal_time(&from_internal_time(&t, false), &mut he);
        assert_eq!(rt, t);
    }

    #[test]
    fn test_half_epoch_bit_travels() {
        let t = TimeInternal { seconds: 42, nanoseconds: 7 };
        let ext = from_internal_time(&t, true);
        assert_eq!(ext.seconds, 42 + i32::MAX as u32);
        let mut he = false;
        let rt = to_internal_time(&ext, &mut he);
        assert!(he);
        assert_eq!(rt, t);
    }

    #[test]
    fn test_display_sign() {
        let t = TimeInternal { seconds: 0, nanoseconds: -104_000 };
        assert_eq!(t.to_string(), "-0.000104000");
        let t = TimeInternal { seconds: 3, nanoseconds: 500 };
        assert_eq!(t.to_string(), "3.000000500");
    }
}
