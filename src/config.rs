//! Build-time tunables.
//!
//! Defaults follow IEEE 802.15.4-2020 Table 8-94 where the standard has an
//! opinion, and the reference timings of 2.4 GHz O-QPSK transceivers where it
//! does not.

use crate::time::{us_to_ticks, RtimerClock, RTIMER_SECOND};

/// Length of one wake-up epoch in rtimer ticks. Must be a power of two.
pub const WAKE_UP_COUNTER_INTERVAL: RtimerClock = 4096;

/// Wake-ups per second implied by [`WAKE_UP_COUNTER_INTERVAL`].
pub const WAKE_UP_COUNTER_RATE: u32 = RTIMER_SECOND / WAKE_UP_COUNTER_INTERVAL;

/// Frames shorter than this are padded so that wake-up frames remain
/// distinguishable from payload frames by length alone.
pub const MIN_FRAME_LENGTH: usize = 34;

/// Successive clear channel assessments per channel sample.
pub const MAX_CCAS: u8 = 2;

/// Gap between two CCAs of one channel sample, in rtimer ticks.
pub const INTER_CCA_PERIOD: RtimerClock = us_to_ticks(1068);

/// Radio-on time per CCA, including calibration.
pub const CCA_SLEEP_DURATION: RtimerClock = us_to_ticks(320);

/// Gap between a payload frame and its acknowledgment, and between bursted
/// frames.
pub const INTER_FRAME_PERIOD: RtimerClock = us_to_ticks(1068);

/// How long a busy channel may stay busy before the sample is written off as
/// noise.
pub const MAX_NOISE: RtimerClock = us_to_ticks(4256);

/// Re-check period while waiting for a silence gap in noise.
pub const SILENCE_CHECK_PERIOD: RtimerClock = us_to_ticks(500);

/// Acknowledgment window after the payload frame's SHR went out.
pub const ACKNOWLEDGMENT_WINDOW_MIN: RtimerClock = us_to_ticks(336);
pub const ACKNOWLEDGMENT_WINDOW_MAX: RtimerClock = us_to_ticks(1000);

/// How much earlier than the rendezvous time the receiver resumes.
pub const RENDEZVOUS_GUARD_TIME: RtimerClock = us_to_ticks(1500);

/// Lead time between arming the transmission and the first wake-up frame's
/// SHR, covering collision avoidance and transmit calibration.
pub const WAKE_UP_SEQUENCE_GUARD_TIME: RtimerClock = us_to_ticks(2000);

/// CCA thresholds in dBm, per purpose.
pub const CCA_THRESHOLD_TRANSMISSION_DETECTION: i8 = -80;
pub const CCA_THRESHOLD_SILENCE_DETECTION: i8 = -80;
pub const CCA_THRESHOLD_COLLISION_AVOIDANCE: i8 = -70;

/// Neighbor table capacities.
pub const NBR_MAX: usize = 16;
pub const NBR_MAX_TENTATIVES: usize = 5;

/// Lifetime of a permanent neighbor without prolongation, in seconds.
pub const NBR_LIFETIME_SECONDS: u32 = 60 * 5;

/// How long a tentative neighbor may wait for the handshake to complete,
/// in seconds.
pub const MAX_WAITING_PERIOD_SECONDS: u32 = 15;

/// HELLOACK retransmissions before a tentative neighbor is written off.
pub const MAX_HELLOACK_TRANSMISSIONS: u8 = 2;

/// CSMA-CA parameters (macMinBe, macMaxBe, macMaxCsmaBackoffs,
/// macMaxFrameRetries).
pub const MIN_BACKOFF_EXPONENT: u8 = 3;
pub const MAX_BACKOFF_EXPONENT: u8 = 5;
pub const MAX_CSMA_BACKOFF: u8 = 4;
pub const MAX_RETRANSMISSIONS: u8 = 3;

/// aUnitBackoffPeriod, in milliseconds of the slow clock.
pub const BACKOFF_PERIOD_MS: u32 = 1000 / WAKE_UP_COUNTER_RATE;

/// Outgoing frame queue capacity.
pub const FRAME_QUEUE_SIZE: usize = 8;

/// Candidate next-hop slots per queued frame (multi-path forwarding hook).
pub const FRAME_QUEUE_MAX_FORWARDERS: usize = 2;

/// Length of the one-time pseudonym over the frame length.
pub const OTP_LEN: usize = 2;

/// Admission control for inbound handshake frames.
pub const HELLO_BUCKET_CAPACITY: u16 = 20;
pub const HELLOACK_BUCKET_CAPACITY: u16 = 20;
pub const BUCKET_LEAKAGE_SECONDS: u32 = 15;

/// Security levels (802.15.4 aux-security encoding): bit 2 selects
/// encryption, bits 0-1 the MIC length.
pub const UNICAST_SEC_LVL: u8 = 6;
pub const BROADCAST_SEC_LVL: u8 = 6;

/// MIC length in bytes for a security level, `2 * 2^(lvl & 3)`.
pub const fn mic_len(sec_lvl: u8) -> usize {
    match sec_lvl & 3 {
        0 => 0,
        n => 2 << n,
    }
}

pub const UNICAST_MIC_LEN: usize = mic_len(UNICAST_SEC_LVL);
pub const BROADCAST_MIC_LEN: usize = mic_len(BROADCAST_SEC_LVL);

/// Channel-hopping arms. `1` disables hopping.
pub const CHANNELS_COUNT: usize = 4;

/// First IEEE 802.15.4 channel of the hopping set.
pub const FIRST_CHANNEL: u8 = 11;

/// Assumed crystal tolerance of unsynchronized peers, in ppm.
pub const CLOCK_TOLERANCE_PPM: u32 = 15;

/// Residual tolerance once a peer's drift has been learned, in ppm.
pub const COMPENSATION_TOLERANCE_PPM: u32 = 5;

/// Minimum spacing of drift re-estimations, in seconds.
pub const MIN_TIME_BETWEEN_DRIFT_UPDATES_SECONDS: u32 = 30;

/// Burst chaining limit: frames to the same receiver sent back to back with
/// the frame-pending bit.
pub const MAX_BURST_INDEX: u8 = 2;

/// Acknowledgment deltas (SFD time minus wake-up time) are right-shifted by
/// this before being squeezed into one byte; covers a full wake-up interval.
pub const DELTA_SHIFT: u32 = WAKE_UP_COUNTER_INTERVAL.trailing_zeros().saturating_sub(8);

/// Guard times around a predicted peer wake-up, in rtimer ticks.
pub const PHASE_LOCK_GUARD_TIME_NEGATIVE: RtimerClock =
    2 + 2 + ACKNOWLEDGMENT_WINDOW_MAX;
pub const PHASE_LOCK_GUARD_TIME_POSITIVE: RtimerClock = 2 + 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_up_interval_is_power_of_two() {
        assert_eq!(WAKE_UP_COUNTER_INTERVAL & (WAKE_UP_COUNTER_INTERVAL - 1), 0);
    }

    #[test]
    fn mic_lengths() {
        assert_eq!(mic_len(0), 0);
        assert_eq!(mic_len(1), 4);
        assert_eq!(mic_len(2), 8);
        assert_eq!(mic_len(3), 16);
        assert_eq!(mic_len(5), 4);
        assert_eq!(mic_len(6), 8);
        assert_eq!(mic_len(7), 16);
    }
}
