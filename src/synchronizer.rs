//! Decides the exact instant a wake-up sequence starts.
//!
//! Broadcasts cannot assume anything about receivers, so their wake-up
//! sequence spans a whole wake-up interval (times the channel count when
//! hopping) and every neighbor samples into it. Unicasts predict the
//! receiver's next wake-up from the phase lock, pad it with the clock-drift
//! uncertainty accumulated since the last synchronization, and send just
//! enough wake-up frames to bridge that window.
//!
//! Phase locks are refreshed from acknowledgments: the ack's delta field
//! says how long after its wake-up the receiver saw our payload frame's
//! SFD, which pins the receiver's wake-up instant on our clock. Two such
//! pins far enough apart yield the peer's long-term clock drift in ppm.

use crate::channel_selector::ChannelSelector;
use crate::config::{
    CHANNELS_COUNT, CLOCK_TOLERANCE_PPM, COMPENSATION_TOLERANCE_PPM,
    MIN_TIME_BETWEEN_DRIFT_UPDATES_SECONDS, PHASE_LOCK_GUARD_TIME_NEGATIVE,
    PHASE_LOCK_GUARD_TIME_POSITIVE, WAKE_UP_COUNTER_INTERVAL, WAKE_UP_SEQUENCE_GUARD_TIME,
};
use crate::nbr::{PermanentNbr, Phase};
use crate::time::{rtimer_delta, rtimer_lt, ticks_to_seconds, RtimerClock, RTIMER_SECOND};
use crate::wake_up_counter::{self, WakeUpCounter};
use crate::{Error, LinkAddr};

/// A planned wake-up sequence plus payload frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Schedule {
    pub wake_up_sequence_start: RtimerClock,
    pub payload_frame_start: RtimerClock,
    pub remaining_wake_up_frames: u16,
    /// The receiver's predicted wake-up counter at the rendezvous (used for
    /// channel forecasts and handshake bookkeeping).
    pub receivers_wake_up_counter: WakeUpCounter,
}

/// The channel a node with address `addr` listens on during epoch `wuc`.
pub fn forecast_channel_index(wuc: WakeUpCounter, addr: &LinkAddr) -> usize {
    if CHANNELS_COUNT == 1 {
        return 0;
    }
    let spread = addr.0.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
    (wuc.0.wrapping_add(spread) % CHANNELS_COUNT as u32) as usize
}

fn can_start(start: RtimerClock, now: RtimerClock) -> bool {
    rtimer_lt(
        now.wrapping_add(WAKE_UP_SEQUENCE_GUARD_TIME),
        start,
    )
}

/// Plans a broadcast: the payload frame goes out half an interval past a
/// wake-up tick, behind a wake-up sequence long enough that every neighbor
/// samples into it at least once.
pub fn schedule_broadcast(
    last_wake_up_time: RtimerClock,
    now: RtimerClock,
    wake_up_frame_tx_time: RtimerClock,
) -> Schedule {
    let span = WAKE_UP_COUNTER_INTERVAL * CHANNELS_COUNT as u32;
    let frames = span.div_ceil(wake_up_frame_tx_time) as u16;
    let sequence_time = frames as u32 * wake_up_frame_tx_time;

    let mut payload_frame_start =
        last_wake_up_time.wrapping_add(WAKE_UP_COUNTER_INTERVAL / 2);
    loop {
        payload_frame_start = payload_frame_start.wrapping_add(WAKE_UP_COUNTER_INTERVAL);
        let start = payload_frame_start.wrapping_sub(sequence_time);
        if can_start(start, now) {
            return Schedule {
                wake_up_sequence_start: start,
                payload_frame_start,
                remaining_wake_up_frames: frames,
                receivers_wake_up_counter: WakeUpCounter::default(),
            };
        }
    }
}

/// Plans a unicast around the receiver's predicted wake-up.
///
/// `sync`/`drift` come from the receiver's neighbor entry (drift `None`
/// while only handshake data is available), `proposed_channels` from its
/// channel bandit.
pub fn schedule_unicast(
    sync: &Phase,
    drift: Option<i32>,
    proposed_channels: u16,
    receiver: &LinkAddr,
    now: RtimerClock,
    wake_up_frame_tx_time: RtimerClock,
) -> Result<Schedule, Error> {
    let seconds_since_last_sync = ticks_to_seconds(rtimer_delta(sync.t, now));

    let tolerance_ppm = if drift.is_some() {
        COMPENSATION_TOLERANCE_PPM
    } else {
        CLOCK_TOLERANCE_PPM
    };
    let uncertainty = ((seconds_since_last_sync as u64 * tolerance_ppm as u64
        * RTIMER_SECOND as u64)
        / 1_000_000) as RtimerClock
        + 1;
    let negative_uncertainty = uncertainty + PHASE_LOCK_GUARD_TIME_NEGATIVE;
    let positive_uncertainty = uncertainty + PHASE_LOCK_GUARD_TIME_POSITIVE;

    let compensation = drift
        .map(|ppm| {
            ((ppm as i64 * seconds_since_last_sync as i64 * RTIMER_SECOND as i64) / 1_000_000)
                as i32
        })
        .unwrap_or(0);

    let predicted = sync
        .t
        .wrapping_add(compensation as RtimerClock)
        .wrapping_sub(negative_uncertainty);
    let mut start = wake_up_counter::shift_to_future(predicted, now);
    while !can_start(start, now) {
        start = start.wrapping_add(WAKE_UP_COUNTER_INTERVAL);
    }

    let mut receivers_wake_up_counter;
    loop {
        let elapsed = rtimer_delta(
            sync.t,
            start
                .wrapping_sub(compensation as RtimerClock)
                .wrapping_add(negative_uncertainty),
        );
        receivers_wake_up_counter = WakeUpCounter(
            sync.wake_up_counter_at_t
                .0
                .wrapping_add(wake_up_counter::round_increments(elapsed)),
        );
        let channel = forecast_channel_index(receivers_wake_up_counter, receiver);
        if proposed_channels & (1 << channel) != 0 {
            break;
        }
        start = start.wrapping_add(WAKE_UP_COUNTER_INTERVAL);
    }

    let frames = ((negative_uncertainty + positive_uncertainty)
        .div_ceil(wake_up_frame_tx_time)
        + 2) as u16;
    Ok(Schedule {
        wake_up_sequence_start: start,
        payload_frame_start: start.wrapping_add(frames as u32 * wake_up_frame_tx_time),
        remaining_wake_up_frames: frames,
        receivers_wake_up_counter,
    })
}

/// Folds a fresh phase pin into the neighbor entry and, when enough time
/// has passed since the historical pin, re-estimates the peer's drift.
///
/// `from_handshake` marks pins taken from handshake acknowledgments; they
/// reset the history instead of feeding the estimator.
pub fn on_unicast_transmitted(
    nbr: &mut PermanentNbr,
    new_sync: Phase,
    from_handshake: bool,
    channel: usize,
    successful: bool,
) {
    nbr.channels.take_feedback(successful, channel);
    if !successful {
        return;
    }

    if from_handshake {
        nbr.historical_sync = new_sync;
    } else {
        let seconds_since_historical =
            ticks_to_seconds(rtimer_delta(nbr.historical_sync.t, new_sync.t));
        if seconds_since_historical >= MIN_TIME_BETWEEN_DRIFT_UPDATES_SECONDS {
            let expected = WAKE_UP_COUNTER_INTERVAL as u64
                * new_sync
                    .wake_up_counter_at_t
                    .0
                    .wrapping_sub(nbr.historical_sync.wake_up_counter_at_t.0) as u64;
            let actual = rtimer_delta(nbr.historical_sync.t, new_sync.t) as u64;
            nbr.drift = Some(
                (((actual as i64 - expected as i64) * 1_000_000)
                    / (seconds_since_historical as i64 * RTIMER_SECOND as i64))
                    as i32,
            );
            nbr.historical_sync = nbr.sync;
        }
    }
    nbr.sync = new_sync;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbr::PermanentNbr;

    const TX_TIME: RtimerClock = 200;

    #[test]
    fn broadcast_covers_a_full_interval_per_channel() {
        let schedule = schedule_broadcast(0, 100, TX_TIME);
        let span = schedule.remaining_wake_up_frames as u32 * TX_TIME;
        assert!(span >= WAKE_UP_COUNTER_INTERVAL * CHANNELS_COUNT as u32);
        assert!(rtimer_lt(100, schedule.wake_up_sequence_start));
        // payload SHR lands half an interval past a wake-up tick
        assert_eq!(
            schedule.payload_frame_start & (WAKE_UP_COUNTER_INTERVAL - 1),
            WAKE_UP_COUNTER_INTERVAL / 2
        );
    }

    #[test]
    fn unicast_targets_the_phase() {
        let sync = Phase {
            t: 10_000,
            wake_up_counter_at_t: WakeUpCounter(40),
        };
        let now = 10_000 + 3 * WAKE_UP_COUNTER_INTERVAL + 17;
        let receiver = LinkAddr([0; 8]);
        let schedule =
            schedule_unicast(&sync, None, u16::MAX, &receiver, now, TX_TIME).unwrap();
        assert!(can_start(schedule.wake_up_sequence_start, now));
        // the sequence starts at the predicted phase minus the uncertainty,
        // modulo the wake-up interval
        let expected_offset = (10_000u32
            .wrapping_sub(PHASE_LOCK_GUARD_TIME_NEGATIVE + 1))
            & (WAKE_UP_COUNTER_INTERVAL - 1);
        assert_eq!(
            schedule.wake_up_sequence_start & (WAKE_UP_COUNTER_INTERVAL - 1),
            expected_offset
        );
        // a phase-locked sequence is much shorter than a broadcast one
        assert!(
            (schedule.remaining_wake_up_frames as u32) * TX_TIME
                < WAKE_UP_COUNTER_INTERVAL
        );
    }

    #[test]
    fn unicast_waits_for_a_proposed_channel() {
        let sync = Phase {
            t: 5_000,
            wake_up_counter_at_t: WakeUpCounter(0),
        };
        let receiver = LinkAddr([0; 8]);
        let only_channel_2 = 1 << 2;
        let schedule = schedule_unicast(
            &sync,
            None,
            only_channel_2,
            &receiver,
            6_000,
            TX_TIME,
        )
        .unwrap();
        assert_eq!(
            forecast_channel_index(schedule.receivers_wake_up_counter, &receiver),
            2
        );
    }

    #[test]
    fn drift_learning_from_two_pins() {
        let mut nbr = PermanentNbr::new(LinkAddr([1; 8]));
        // handshake pin establishes the history
        let first = Phase {
            t: 0,
            wake_up_counter_at_t: WakeUpCounter(0),
        };
        on_unicast_transmitted(&mut nbr, first, true, 0, true);

        // 60 s later the peer woke up 60s * 20 ppm = 39.3 ticks late
        let seconds = 60;
        let epochs = seconds * RTIMER_SECOND / WAKE_UP_COUNTER_INTERVAL;
        let expected_ticks = epochs * WAKE_UP_COUNTER_INTERVAL;
        let late = (seconds as u64 * 20 * RTIMER_SECOND as u64 / 1_000_000) as u32;
        let second = Phase {
            t: expected_ticks + late,
            wake_up_counter_at_t: WakeUpCounter(epochs),
        };
        on_unicast_transmitted(&mut nbr, second, false, 0, true);

        let drift = nbr.drift.unwrap();
        assert!((18..=22).contains(&drift), "drift = {drift}");
    }

    #[test]
    fn failed_transmissions_do_not_move_the_phase() {
        let mut nbr = PermanentNbr::new(LinkAddr([1; 8]));
        let pin = Phase {
            t: 1234,
            wake_up_counter_at_t: WakeUpCounter(5),
        };
        on_unicast_transmitted(&mut nbr, pin, true, 0, true);
        let before = nbr.sync.t;
        on_unicast_transmitted(
            &mut nbr,
            Phase {
                t: 9_999_999,
                wake_up_counter_at_t: WakeUpCounter(9),
            },
            false,
            0,
            false,
        );
        assert_eq!(nbr.sync.t, before);
    }
}
