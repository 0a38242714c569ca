//! Outgoing frame queue with per-receiver CSMA-CA bookkeeping.
//!
//! Each queued frame is a snapshot of the packet buffer. At most one
//! transmission is outstanding per receiver at any time; all frames to one
//! receiver share a CSMA-CA status that tracks the next allowed attempt,
//! the transmission count, and the collision count. Broadcast frames share
//! one status.
//!
//! Retry policy, following IEEE 802.15.4-2020 Table 8-94 defaults:
//! collisions back off with `BE = min(collisions + transmissions + macMinBe
//! - 1, macMaxBe)` random backoff periods, up to `macMaxCsmaBackoffs`
//! times. Missing acknowledgments are *also* randomly backed off (the
//! standard would retransmit immediately) because CCAs do not catch hidden
//! terminals, and the receiver may be serving a different channel.

use rand_core::RngCore;

use crate::config::{
    BACKOFF_PERIOD_MS, FRAME_QUEUE_MAX_FORWARDERS, FRAME_QUEUE_SIZE, MAX_BACKOFF_EXPONENT,
    MAX_CSMA_BACKOFF, MAX_RETRANSMISSIONS, MIN_BACKOFF_EXPONENT, NBR_MAX,
};
use crate::packetbuf::{Attr, FrameType, Packetbuf};
use crate::time::{clock_lt, ClockTime};
use crate::{LinkAddr, SentCallback, TxResult};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
struct CsmacaStatus {
    addr: LinkAddr,
    next_attempt: ClockTime,
    is_active: bool,
    transmissions: u8,
    collisions: u8,
}

pub struct FrameQueueEntry {
    queuebuf: Packetbuf,
    sent: SentCallback,
    ptr: usize,
    /// Candidate next hops when multi-path forwarding is layered on top;
    /// unused slots hold the null address.
    pub forwarders: [LinkAddr; FRAME_QUEUE_MAX_FORWARDERS],
}

impl FrameQueueEntry {
    pub fn queuebuf(&self) -> &Packetbuf {
        &self.queuebuf
    }

    fn receiver(&self) -> LinkAddr {
        self.queuebuf.receiver()
    }

    fn is_handshake_frame(&self) -> bool {
        self.queuebuf.frame_type() == FrameType::Command
            && crate::akes::is_hello_helloack_or_ack(self.queuebuf.dataptr().first().copied())
    }
}

pub struct FrameQueue {
    entries: heapless::Vec<FrameQueueEntry, FRAME_QUEUE_SIZE>,
    statuses: heapless::Vec<CsmacaStatus, { NBR_MAX + 1 }>,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        Self {
            entries: heapless::Vec::new(),
            statuses: heapless::Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn status_index(&mut self, addr: LinkAddr, now: ClockTime) -> Option<usize> {
        let index = match self.statuses.iter().position(|s| s.addr == addr) {
            Some(index) => index,
            None => {
                self.statuses
                    .push(CsmacaStatus {
                        addr,
                        next_attempt: now,
                        is_active: false,
                        transmissions: 0,
                        collisions: 0,
                    })
                    .ok()?;
                self.statuses.len() - 1
            }
        };
        let status = &mut self.statuses[index];
        if !status.is_active {
            status.is_active = true;
            status.next_attempt = now;
            status.transmissions = 0;
            status.collisions = 0;
        }
        Some(index)
    }

    fn release_status(&mut self, index: usize) {
        self.statuses[index].is_active = false;
        let addr = self.statuses[index].addr;
        // drop the slot once no queued frame refers to this receiver
        if !addr.is_null() && !self.entries.iter().any(|e| e.receiver() == addr) {
            self.statuses.swap_remove(index);
        }
    }

    /// Snapshots the packetbuf into a queue slot. On failure the
    /// sent-callback fires immediately with [`TxResult::QueueFull`].
    pub fn add(&mut self, pb: &Packetbuf, sent: SentCallback, ptr: usize) -> bool {
        let mut queuebuf = pb.clone();
        if queuebuf.attr(Attr::MaxMacTransmissions) == 0 {
            queuebuf.set_attr(Attr::MaxMacTransmissions, MAX_RETRANSMISSIONS as u16 + 1);
        }
        let entry = FrameQueueEntry {
            queuebuf,
            sent,
            ptr,
            forwarders: [LinkAddr::NULL; FRAME_QUEUE_MAX_FORWARDERS],
        };
        if self.entries.push(entry).is_err() {
            log::error!("frame-queue: buffer is full");
            sent(ptr, TxResult::QueueFull, 0);
            return false;
        }
        true
    }

    /// The first entry whose receiver is allowed to be served now. Loads
    /// its snapshot back into `pb`.
    pub fn pick(&mut self, now: ClockTime, pb: &mut Packetbuf) -> Option<usize> {
        for index in 0..self.entries.len() {
            let addr = self.entries[index].receiver();
            let Some(status) = self.status_index(addr, now) else {
                log::error!("frame-queue: could not get CSMA-CA status");
                continue;
            };
            if clock_lt(now, self.statuses[status].next_attempt) {
                continue;
            }
            *pb = self.entries[index].queuebuf.clone();
            return Some(index);
        }
        None
    }

    /// The next queued frame addressed to the same receiver as `prev`,
    /// for burst chaining. Handshake frames never ride in bursts.
    pub fn burst(&self, prev: usize) -> Option<usize> {
        if self.entries[prev].is_handshake_frame() {
            return None;
        }
        let receiver = self.entries[prev].receiver();
        (prev + 1..self.entries.len()).find(|&i| {
            self.entries[i].receiver() == receiver && !self.entries[i].is_handshake_frame()
        })
    }

    pub fn load(&self, index: usize, pb: &mut Packetbuf) {
        *pb = self.entries[index].queuebuf.clone();
    }

    /// Defers every attempt towards `addr` until `next_attempt`.
    pub fn postpone(&mut self, addr: LinkAddr, next_attempt: ClockTime, now: ClockTime) {
        if let Some(index) = self.status_index(addr, now) {
            self.statuses[index].next_attempt = next_attempt;
        }
    }

    fn schedule_next_attempt<R: RngCore>(status: &mut CsmacaStatus, now: ClockTime, rng: &mut R) {
        let backoff_exponent = (status.collisions + status.transmissions + MIN_BACKOFF_EXPONENT
            - 1)
        .min(MAX_BACKOFF_EXPONENT);
        let backoff_periods = rng.next_u32() & ((1u32 << backoff_exponent) - 1);
        status.next_attempt = now.wrapping_add(BACKOFF_PERIOD_MS * backoff_periods);
    }

    /// Feeds a transmission outcome back into the CSMA-CA state, either
    /// rescheduling the entry or completing it (callback + removal).
    pub fn on_transmitted<R: RngCore>(
        &mut self,
        mut result: TxResult,
        index: usize,
        now: ClockTime,
        rng: &mut R,
    ) {
        debug_assert!(result != TxResult::Deferred && result != TxResult::QueueFull);

        let addr = self.entries[index].receiver();
        let status_index = self.status_index(addr, now);
        let Some(status_index) = status_index else {
            result = TxResult::ErrFatal;
            let entry = self.entries.remove(index);
            (entry.sent)(entry.ptr, result, 0);
            return;
        };
        let status = &mut self.statuses[status_index];
        let max_transmissions = self.entries[index]
            .queuebuf
            .attr(Attr::MaxMacTransmissions) as u8;

        match result {
            TxResult::Err => {
                log::warn!("frame-queue: retrying in one backoff period");
                status.next_attempt = now.wrapping_add(BACKOFF_PERIOD_MS);
                return;
            }
            TxResult::Collision => {
                status.collisions += 1;
                if status.collisions <= MAX_CSMA_BACKOFF {
                    Self::schedule_next_attempt(status, now, rng);
                    return;
                }
            }
            TxResult::NoAck => {
                status.transmissions += 1;
                if status.transmissions < max_transmissions {
                    Self::schedule_next_attempt(status, now, rng);
                    return;
                }
            }
            TxResult::Ok => {
                status.transmissions += 1;
            }
            _ => {}
        }

        let transmissions = status.transmissions;
        self.release_status(status_index);
        let entry = self.entries.remove(index);
        (entry.sent)(entry.ptr, result, transmissions);
    }

    /// Transmissions already spent on the current frame towards `addr`.
    pub fn transmissions(&self, addr: LinkAddr) -> u8 {
        self.statuses
            .iter()
            .find(|s| s.addr == addr && s.is_active)
            .map(|s| s.transmissions)
            .unwrap_or(0)
    }

    /// Whether `addr` is between a failed attempt and its next retry.
    pub fn is_backing_off(&self, addr: LinkAddr, now: ClockTime) -> bool {
        self.statuses
            .iter()
            .any(|s| s.addr == addr && s.is_active && clock_lt(now, s.next_attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn encode(result: TxResult) -> usize {
        match result {
            TxResult::Ok => 1,
            TxResult::Collision => 2,
            TxResult::NoAck => 3,
            TxResult::QueueFull => 4,
            _ => 5,
        }
    }

    macro_rules! recorder {
        ($name:ident, $result:ident, $transmissions:ident) => {
            static $result: AtomicUsize = AtomicUsize::new(0);
            static $transmissions: AtomicUsize = AtomicUsize::new(99);
            fn $name(_ptr: usize, result: TxResult, transmissions: u8) {
                $result.store(encode(result), Ordering::SeqCst);
                $transmissions.store(transmissions as usize, Ordering::SeqCst);
            }
        };
    }

    recorder!(record, RESULT_UNUSED, TX_UNUSED);
    recorder!(record_collision, COLLISION_RESULT, COLLISION_TX);
    recorder!(record_noack, NOACK_RESULT, NOACK_TX);
    recorder!(record_full, FULL_RESULT, FULL_TX);

    struct ZeroRng;

    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(0);
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            dest.fill(0);
            Ok(())
        }
    }

    fn unicast_pb(to: u8) -> Packetbuf {
        let mut pb = Packetbuf::new();
        pb.set_receiver(LinkAddr([0, 0, 0, 0, 0, 0, 0, to]));
        pb.copy_from(&[0xAB]).unwrap();
        pb
    }

    #[test]
    fn pick_respects_backoff() {
        let mut queue = FrameQueue::new();
        let mut rng = ZeroRng;
        let mut pb = Packetbuf::new();
        assert!(queue.add(&unicast_pb(1), record, 0));

        let picked = queue.pick(1000, &mut pb).unwrap();
        queue.on_transmitted(TxResult::Err, picked, 1000, &mut rng);
        // one backoff period of delay
        assert!(queue.pick(1000, &mut pb).is_none());
        assert!(queue.pick(1000 + BACKOFF_PERIOD_MS, &mut pb).is_some());
    }

    #[test]
    fn collision_count_is_bounded() {
        let mut queue = FrameQueue::new();
        let mut rng = ZeroRng;
        let mut pb = Packetbuf::new();
        assert!(queue.add(&unicast_pb(1), record_collision, 7));

        // MAX_CSMA_BACKOFF retries are allowed, the next collision fails
        for _ in 0..MAX_CSMA_BACKOFF {
            let picked = queue.pick(5_000_000, &mut pb).unwrap();
            queue.on_transmitted(TxResult::Collision, picked, 5_000_000, &mut rng);
            assert_eq!(queue.len(), 1);
        }
        let picked = queue.pick(5_000_000, &mut pb).unwrap();
        queue.on_transmitted(TxResult::Collision, picked, 5_000_000, &mut rng);
        assert_eq!(queue.len(), 0);
        assert_eq!(COLLISION_RESULT.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retransmissions_are_bounded() {
        let mut queue = FrameQueue::new();
        let mut rng = ZeroRng;
        let mut pb = Packetbuf::new();
        assert!(queue.add(&unicast_pb(2), record_noack, 7));

        for _ in 0..MAX_RETRANSMISSIONS {
            let picked = queue.pick(5_000_000, &mut pb).unwrap();
            queue.on_transmitted(TxResult::NoAck, picked, 5_000_000, &mut rng);
            assert_eq!(queue.len(), 1);
        }
        let picked = queue.pick(5_000_000, &mut pb).unwrap();
        queue.on_transmitted(TxResult::NoAck, picked, 5_000_000, &mut rng);
        assert_eq!(queue.len(), 0);
        assert_eq!(NOACK_RESULT.load(Ordering::SeqCst), 3);
        // macMaxFrameRetries + 1 attempts in total
        assert_eq!(
            NOACK_TX.load(Ordering::SeqCst),
            MAX_RETRANSMISSIONS as usize + 1
        );
    }

    #[test]
    fn burst_skips_other_receivers_and_handshakes() {
        let mut queue = FrameQueue::new();
        let mut pb = Packetbuf::new();
        assert!(queue.add(&unicast_pb(1), record, 0));
        assert!(queue.add(&unicast_pb(2), record, 0));

        let mut handshake = unicast_pb(1);
        handshake.set_frame_type(FrameType::Command);
        handshake
            .copy_from(&[crate::akes::CMD_HELLOACK, 0, 0])
            .unwrap();
        assert!(queue.add(&handshake, record, 0));
        assert!(queue.add(&unicast_pb(1), record, 0));

        let first = queue.pick(0, &mut pb).unwrap();
        assert_eq!(first, 0);
        // skips the frame to receiver 2 and the handshake frame
        assert_eq!(queue.burst(first), Some(3));
    }

    #[test]
    fn queue_full_fires_callback() {
        let mut queue = FrameQueue::new();
        for _ in 0..FRAME_QUEUE_SIZE {
            assert!(queue.add(&unicast_pb(1), record_full, 0));
        }
        assert!(!queue.add(&unicast_pb(1), record_full, 0));
        assert_eq!(FULL_RESULT.load(Ordering::SeqCst), 4);
    }
}
