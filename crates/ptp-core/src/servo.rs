//! Offset/delay estimation and the PI clock servo.
//!
//! Two first-order filters feed the controller: the one-way-delay filter
//! (variable stiffness, symmetric-delay assumption) and the offset-from-
//! master filter (fixed two-sample average). The servo itself never touches
//! a clock; it emits a `ServoCommand` the owner applies to whichever time
//! source it disciplines, which is also what lets the BOTH mode run a second
//! independent instance for the system clock.

use tracing::debug;

use crate::constants::ADJ_FREQ_MAX;
use crate::time::TimeInternal;

#[derive(Debug, Clone)]
pub struct ServoConfig {
    pub ap: i32,
    pub ai: i32,
    /// One-way-delay filter stiffness (log2 of the target averaging window).
    pub s: i16,
    pub no_adjust: bool,
    pub no_reset_clock: bool,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            ap: crate::constants::DEFAULT_AP,
            ai: crate::constants::DEFAULT_AI,
            s: crate::constants::DEFAULT_DELAY_S,
            no_adjust: false,
            no_reset_clock: false,
        }
    }
}

/// What the servo wants done to the disciplined clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoCommand {
    None,
    /// Subtract this offset from the clock (a jump; the servo has already
    /// re-initialized itself).
    Step(TimeInternal),
    /// Frequency adjustment in ppb; `offset` is the latest measurement for
    /// sources that cannot slew and must fall back to stepping.
    Slew { adj_ppb: i32, offset: TimeInternal },
}

#[derive(Debug, Default, Clone)]
struct OwdFilter {
    s_exp: i32,
    nsec_prev: i32,
    y: i32,
}

#[derive(Debug, Default, Clone)]
struct OfmFilter {
    nsec_prev: i32,
    y: i32,
}

#[derive(Debug, Clone)]
pub struct Servo {
    cfg: ServoConfig,
    /// Short tag for log/stats lines ("" for the primary, "sys " for the
    /// BOTH-mode secondary).
    pub name: &'static str,
    pub master_to_slave_delay: TimeInternal,
    pub slave_to_master_delay: TimeInternal,
    pub one_way_delay: TimeInternal,
    pub offset_from_master: TimeInternal,
    /// Integral accumulator, scaled ppb.
    pub observed_drift: i32,
    pub observed_variance: i32,
    owd_filt: OwdFilter,
    ofm_filt: OfmFilter,
}

impl Servo {
    pub fn new(cfg: ServoConfig, name: &'static str) -> Self {
        Servo {
            cfg,
            name,
            master_to_slave_delay: TimeInternal::ZERO,
            slave_to_master_delay: TimeInternal::ZERO,
            one_way_delay: TimeInternal::ZERO,
            offset_from_master: TimeInternal::ZERO,
            observed_drift: 0,
            observed_variance: 0,
            owd_filt: OwdFilter::default(),
            ofm_filt: OfmFilter::default(),
        }
    }

    /// Clear measurement state and the integral accumulator. Runs on SLAVE
    /// entry/exit and after every clock step.
    pub fn reset(&mut self) {
        debug!("{}servo reset", self.name);
        self.master_to_slave_delay = TimeInternal::ZERO;
        self.slave_to_master_delay = TimeInternal::ZERO;
        self.observed_variance = 0;
        self.observed_drift = 0;
        self.owd_filt.s_exp = 0;
        self.owd_filt.nsec_prev = 0;
    }

    /// Fold a Delay-Req round trip into the one-way-delay estimate.
    pub fn update_delay(&mut self, send_time: &TimeInternal, recv_time: &TimeInternal) {
        self.slave_to_master_delay = recv_time.sub(send_time);

        self.one_way_delay = self.master_to_slave_delay.add(&self.slave_to_master_delay);
        self.one_way_delay.halve();

        debug!(
            "{}update_delay stm {} owd {}",
            self.name, self.slave_to_master_delay, self.one_way_delay
        );

        // A whole-second or negative delay means the clock is far off; the
        // filter is meaningless until after a jump.
        if self.one_way_delay.seconds != 0 || self.one_way_delay.nanoseconds < 0 {
            self.owd_filt.s_exp = 0;
            self.owd_filt.nsec_prev = 0;
            return;
        }

        // cap stiffness so the fixed-point update cannot overflow
        let mut s = self.cfg.s;
        while (self.owd_filt.y.abs() >> (31 - s)) != 0 {
            s -= 1;
        }

        // crank down the cutoff by growing s_exp one step per sample
        if self.owd_filt.s_exp < 1 {
            self.owd_filt.s_exp = 1;
        } else if self.owd_filt.s_exp < 1 << s {
            self.owd_filt.s_exp += 1;
        } else if self.owd_filt.s_exp > 1 << s {
            self.owd_filt.s_exp = 1 << s;
        }

        let s_exp = self.owd_filt.s_exp as i64;
        self.owd_filt.y = ((s_exp - 1) * self.owd_filt.y as i64 / s_exp
            + (self.one_way_delay.nanoseconds as i64 / 2 + self.owd_filt.nsec_prev as i64 / 2)
                / s_exp) as i32;

        self.owd_filt.nsec_prev = self.one_way_delay.nanoseconds;
        self.one_way_delay.nanoseconds = self.owd_filt.y;

        debug!("{}delay filter {}, {}", self.name, self.owd_filt.y, self.owd_filt.s_exp);
    }

    /// Fold a (Sync origin, receive time) pair into the offset estimate.
    pub fn update_offset(&mut self, send_time: &TimeInternal, recv_time: &TimeInternal) {
        self.master_to_slave_delay = recv_time.sub(send_time);
        self.offset_from_master = self.master_to_slave_delay.sub(&self.one_way_delay);

        debug!(
            "{}update_offset mts {} ofm {}",
            self.name, self.master_to_slave_delay, self.offset_from_master
        );

        if self.offset_from_master.seconds != 0 {
            // cannot filter with whole seconds present
            self.ofm_filt.nsec_prev = 0;
            return;
        }

        self.ofm_filt.y = self.offset_from_master.nanoseconds / 2 + self.ofm_filt.nsec_prev / 2;
        self.ofm_filt.nsec_prev = self.offset_from_master.nanoseconds;
        self.offset_from_master.nanoseconds = self.ofm_filt.y;
    }

    /// Turn the current offset estimate into a clock command.
    pub fn update_clock(&mut self) -> ServoCommand {
        if self.offset_from_master.seconds != 0 {
            // whole seconds of error: jump, or saturate the slew
            if self.cfg.no_adjust {
                return ServoCommand::None;
            }
            if !self.cfg.no_reset_clock {
                let offset = self.offset_from_master;
                self.reset();
                return ServoCommand::Step(offset);
            }
            let adj = if self.offset_from_master.nanoseconds > 0 {
                ADJ_FREQ_MAX
            } else {
                -ADJ_FREQ_MAX
            };
            return ServoCommand::Slew { adj_ppb: -adj, offset: self.offset_from_master };
        }

        // no negative or zero attenuation
        if self.cfg.ap < 1 {
            self.cfg.ap = 1;
        }
        if self.cfg.ai < 1 {
            self.cfg.ai = 1;
        }

        self.observed_drift += self.offset_from_master.nanoseconds / self.cfg.ai;
        self.observed_drift = self.observed_drift.clamp(-ADJ_FREQ_MAX, ADJ_FREQ_MAX);

        let adj = self.offset_from_master.nanoseconds / self.cfg.ap + self.observed_drift;

        if self.cfg.no_adjust {
            ServoCommand::None
        } else {
            ServoCommand::Slew { adj_ppb: -adj, offset: self.offset_from_master }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn servo() -> Servo {
        Servo::new(ServoConfig::default(), "")
    }

    fn t(s: i32, ns: i32) -> TimeInternal {
        TimeInternal { seconds: s, nanoseconds: ns }
    }

    #[test]
    fn test_delay_symmetric_path() {
        let mut sv = servo();
        // master->slave leg measured first (Sync), 100µs each way
        sv.update_offset(&t(10, 0), &t(10, 100_000));
        sv.update_delay(&t(20, 0), &t(20, 100_000));
        assert_eq!(sv.slave_to_master_delay, t(0, 100_000));
        assert_eq!(sv.one_way_delay.seconds, 0);
        assert!(sv.one_way_delay.nanoseconds > 0);
    }

    #[test]
    fn test_delay_filter_reset_on_seconds() {
        let mut sv = servo();
        sv.update_offset(&t(0, 0), &t(3, 0));
        sv.update_delay(&t(10, 0), &t(13, 0));
        assert_eq!(sv.owd_filt.s_exp, 0);
        assert_eq!(sv.owd_filt.nsec_prev, 0);
    }

    #[test]
    fn test_delay_filter_reset_on_negative_sample() {
        let mut sv = servo();
        // asymmetry so gross the mean goes negative: reset, don't publish
        sv.update_offset(&t(10, 500), &t(10, 0));
        sv.update_delay(&t(20, 100), &t(20, 0));
        assert_eq!(sv.owd_filt.s_exp, 0);
    }

    #[test]
    fn test_asymmetric_path_splits_bias() {
        // 1ms true delay each way plus 200µs extra on the slave->master leg.
        // The symmetric assumption folds the mean into the delay and half the
        // bias into the offset; neither can see the asymmetry itself.
        let mut sv = servo();
        for i in 0i32..64 {
            sv.update_offset(&t(i, 0), &t(i, 1_000_000));
            sv.update_delay(&t(100 + i, 0), &t(100 + i, 1_200_000));
        }
        sv.update_offset(&t(200, 0), &t(200, 1_000_000));
        // one-way delay converges to the mean of the two legs
        assert!((sv.one_way_delay.nanoseconds - 1_100_000).abs() < 20_000);
        // and the offset absorbs half the bias instead of staying at zero
        assert!((sv.offset_from_master.nanoseconds + 100_000).abs() < 20_000);
    }

    #[test]
    fn test_offset_filter_reset_on_seconds() {
        let mut sv = servo();
        sv.update_offset(&t(0, 0), &t(3, 250));
        assert_eq!(sv.offset_from_master.seconds, 3);
        assert_eq!(sv.ofm_filt.nsec_prev, 0);
    }

    #[test]
    fn test_offset_filter_averages() {
        let mut sv = servo();
        sv.update_offset(&t(5, 0), &t(5, 1000));
        assert_eq!(sv.offset_from_master, t(0, 500)); // (1000 + 0)/2
        sv.update_offset(&t(6, 0), &t(6, 1000));
        assert_eq!(sv.offset_from_master, t(0, 1000)); // (1000 + 1000)/2
    }

    #[test]
    fn test_step_path_resets_servo() {
        let mut sv = servo();
        sv.observed_drift = 12_345;
        sv.update_offset(&t(0, 0), &t(3, 0));
        match sv.update_clock() {
            ServoCommand::Step(offset) => assert_eq!(offset.seconds, 3),
            other => panic!("expected step, got {other:?}"),
        }
        assert_eq!(sv.observed_drift, 0);
        assert_eq!(sv.owd_filt.s_exp, 0);
    }

    #[test]
    fn test_no_reset_clock_saturates() {
        let mut sv = Servo::new(
            ServoConfig { no_reset_clock: true, ..ServoConfig::default() },
            "",
        );
        sv.update_offset(&t(0, 0), &t(3, 100));
        match sv.update_clock() {
            ServoCommand::Slew { adj_ppb, .. } => assert_eq!(adj_ppb, -ADJ_FREQ_MAX),
            other => panic!("expected slew, got {other:?}"),
        }
    }

    #[test]
    fn test_drift_saturation() {
        let mut sv = Servo::new(ServoConfig { ai: 1, ..ServoConfig::default() }, "");
        for _ in 0..10 {
            sv.update_offset(&t(5, 0), &t(5, 999_999_999));
            let _ = sv.update_clock();
            assert!(sv.observed_drift.abs() <= ADJ_FREQ_MAX);
        }
        assert_eq!(sv.observed_drift, ADJ_FREQ_MAX);
    }

    #[test]
    fn test_attenuation_coerced_up() {
        let mut sv = Servo::new(ServoConfig { ap: 0, ai: 0, ..ServoConfig::default() }, "");
        sv.update_offset(&t(5, 0), &t(5, 100));
        // must not divide by zero
        match sv.update_clock() {
            ServoCommand::Slew { .. } => {}
            other => panic!("expected slew, got {other:?}"),
        }
        assert_eq!(sv.cfg.ap, 1);
        assert_eq!(sv.cfg.ai, 1);
    }

    #[test]
    fn test_no_adjust_still_tracks() {
        let mut sv = Servo::new(ServoConfig { no_adjust: true, ..ServoConfig::default() }, "");
        sv.update_offset(&t(5, 0), &t(5, 10_000));
        assert_eq!(sv.update_clock(), ServoCommand::None);
        assert_ne!(sv.observed_drift, 0); // estimator keeps running
    }
}
