//! Replay protection by strictly increasing frame counters.
//!
//! Each neighbor keeps the highest counter seen from the peer, separately
//! for unicast and broadcast. The node's own outgoing counter must never
//! wrap; on saturation the host's [`RebootPolicy`] is told to retire the
//! keys.
//!
//! With the `frame-counter-suppression` feature, unicast frames carry only
//! the low 8 counter bits on the air; [`restore_counter`] reconstructs the
//! suppressed bits as the nearest value above the last one seen.

use crate::packetbuf::Packetbuf;
use crate::RebootPolicy;

/// Per-neighbor incoming counter state, plus the outgoing unicast counter
/// towards this neighbor when suppression is active.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct AntiReplayInfo {
    pub last_unicast_counter: u32,
    pub last_broadcast_counter: u32,
    #[cfg(feature = "frame-counter-suppression")]
    pub my_unicast_counter: u32,
}

/// The node's outgoing counters.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct OutgoingCounters {
    #[cfg(feature = "frame-counter-suppression")]
    pub broadcast: u32,
    #[cfg(feature = "frame-counter-suppression")]
    pub unicast_base: u32,
    #[cfg(not(feature = "frame-counter-suppression"))]
    counter: u32,
}

impl OutgoingCounters {
    #[cfg(not(feature = "frame-counter-suppression"))]
    fn next(&mut self, reboot: &mut impl RebootPolicy) -> u32 {
        self.counter += 1;
        if self.counter == u32::MAX {
            reboot.frame_counter_exhausted();
        }
        self.counter
    }

    /// Initializes a fresh neighbor's replay state.
    pub fn init_info(&self) -> AntiReplayInfo {
        AntiReplayInfo {
            #[cfg(feature = "frame-counter-suppression")]
            my_unicast_counter: self.unicast_base,
            ..AntiReplayInfo::default()
        }
    }
}

/// Advances the applicable outgoing counter and stamps it into the
/// packetbuf attributes.
#[cfg(not(feature = "frame-counter-suppression"))]
pub fn set_counter(
    pb: &mut Packetbuf,
    counters: &mut OutgoingCounters,
    _receiver_info: Option<&mut AntiReplayInfo>,
    reboot: &mut impl RebootPolicy,
) {
    let counter = counters.next(reboot);
    pb.set_frame_counter(counter);
}

#[cfg(feature = "frame-counter-suppression")]
pub fn set_counter(
    pb: &mut Packetbuf,
    counters: &mut OutgoingCounters,
    receiver_info: Option<&mut AntiReplayInfo>,
    reboot: &mut impl RebootPolicy,
) {
    let counter = if pb.holds_broadcast() {
        counters.broadcast += 1;
        counters.broadcast
    } else {
        debug_assert!(receiver_info.is_some());
        let Some(info) = receiver_info else {
            return;
        };
        info.my_unicast_counter += 1;
        info.my_unicast_counter
    };
    if counter == u32::MAX {
        reboot.frame_counter_exhausted();
    }
    pb.set_frame_counter(counter);
}

/// The received counter from the packetbuf attributes.
pub fn get_counter(pb: &Packetbuf) -> u32 {
    pb.frame_counter()
}

/// Checks the received frame's counter against `info` and, if it advanced,
/// records it. Returns `true` on a replay.
pub fn was_replayed(pb: &Packetbuf, info: &mut AntiReplayInfo) -> bool {
    let received = pb.frame_counter();
    let last = if pb.holds_broadcast() {
        &mut info.last_broadcast_counter
    } else {
        &mut info.last_unicast_counter
    };
    if received <= *last {
        true
    } else {
        *last = received;
        false
    }
}

/// Little-endian wire encoding of the 32-bit counter.
pub fn write_counter(pb: &Packetbuf, dst: &mut [u8]) {
    dst[..4].copy_from_slice(&pb.frame_counter().to_le_bytes());
}

pub fn parse_counter(pb: &mut Packetbuf, src: &[u8]) {
    pb.set_frame_counter(u32::from_le_bytes(src[..4].try_into().unwrap()));
}

/// The 8 low bits of the outgoing counter, for suppressed transmission.
pub fn counter_lsbs(pb: &Packetbuf) -> u8 {
    pb.frame_counter() as u8
}

/// Reconstructs a 32-bit counter from its transmitted low byte: the
/// smallest value above the last seen counter whose low byte matches.
pub fn restore_counter(pb: &mut Packetbuf, info: &AntiReplayInfo, lsbs: u8) {
    let last = if pb.holds_broadcast() {
        info.last_broadcast_counter
    } else {
        info.last_unicast_counter
    };
    let mut restored = (last & !0xFF) | lsbs as u32;
    if lsbs < (last as u8) {
        restored = restored.wrapping_add(0x100);
    }
    pb.set_frame_counter(restored);
}
