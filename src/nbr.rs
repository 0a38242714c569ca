//! The neighbor table.
//!
//! A fixed arena of permanent neighbors (handshake completed, pairwise and
//! group keys installed) plus a small arena of tentative neighbors (mid
//! handshake, holding either our challenge or the derived-but-unconfirmed
//! pairwise key). Cross-references are arena indices, never pointers.
//!
//! Interrupt-context readers (the frame filter) must check
//! [`NbrTable::can_query_asynchronously`] first; mutators hold the lock
//! for the duration of their edit.

use crate::anti_replay::AntiReplayInfo;
use crate::channel_selector::DefaultChannelSelector;
use crate::config::{NBR_MAX, NBR_MAX_TENTATIVES};
use crate::crypto::AES_128_KEY_LENGTH;
use crate::time::RtimerClock;
use crate::wake_up_counter::WakeUpCounter;
use crate::LinkAddr;

/// Handshake challenges are half a cipher block.
pub const CHALLENGE_LEN: usize = 8;

/// A neighbor's last-known wake-up instant.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Phase {
    /// Local rtimer time of the peer's wake-up.
    pub t: RtimerClock,
    /// The peer's wake-up counter at `t`.
    pub wake_up_counter_at_t: WakeUpCounter,
}

/// What a tentative neighbor holds before the handshake completes.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub enum TentativeSecret {
    /// The challenge we sent in our HELLO.
    Challenge([u8; CHALLENGE_LEN]),
    /// The pairwise key derived from both challenges, not yet confirmed.
    Key([u8; AES_128_KEY_LENGTH]),
}

pub struct PermanentNbr {
    pub addr: LinkAddr,
    pub anti_replay: AntiReplayInfo,
    pub pairwise_key: [u8; AES_128_KEY_LENGTH],
    /// The peer's broadcast (group) key, received during the handshake.
    pub group_key: [u8; AES_128_KEY_LENGTH],
    /// Uptime second at which this neighbor expires unless prolonged.
    pub prolongation_time: u32,
    /// Cleared when the peer broadcasts a fresh HELLO; the peer must then
    /// complete a new handshake to be prolonged again.
    pub sent_authentic_hello: bool,
    pub is_receiving_update: bool,
    /// First bytes of the challenge of the last HELLOACK we sent to this
    /// peer, to recognize retries.
    pub helloack_challenge: Option<[u8; 2]>,
    pub sync: Phase,
    /// Learned clock drift in ppm, positive = peer's clock runs fast.
    pub drift: Option<i32>,
    /// Older sync snapshot that drift is estimated against.
    pub historical_sync: Phase,
    pub channels: DefaultChannelSelector,
}

pub struct TentativeNbr {
    pub addr: LinkAddr,
    pub anti_replay: AntiReplayInfo,
    pub secret: TentativeSecret,
    /// Uptime second at which the handshake is written off.
    pub expiration_time: u32,
    pub helloack_transmissions: u8,
    pub was_helloack_sent: bool,
    /// Random bits carried in our HELLOACK; the peer's ACK must echo them.
    pub q: [u8; CHALLENGE_LEN],
    /// Strobe index the binding acknowledgment must carry.
    pub strobe_index: u8,
    /// SFD-out instant of the last HELLOACK towards this peer; the ACK's
    /// delta field is measured against it.
    pub helloack_sfd_timestamp: RtimerClock,
    pub phase: Phase,
    pub predicted_wake_up_counter: WakeUpCounter,
}

impl TentativeNbr {
    pub fn new(addr: LinkAddr, secret: TentativeSecret, expiration_time: u32) -> Self {
        Self {
            addr,
            anti_replay: AntiReplayInfo::default(),
            secret,
            expiration_time,
            helloack_transmissions: 0,
            was_helloack_sent: false,
            q: [0; CHALLENGE_LEN],
            strobe_index: 0,
            helloack_sfd_timestamp: 0,
            phase: Phase::default(),
            predicted_wake_up_counter: WakeUpCounter::default(),
        }
    }

    pub fn tentative_pairwise_key(&self) -> Option<&[u8; AES_128_KEY_LENGTH]> {
        match &self.secret {
            TentativeSecret::Key(key) => Some(key),
            TentativeSecret::Challenge(_) => None,
        }
    }

    pub fn challenge(&self) -> Option<&[u8; CHALLENGE_LEN]> {
        match &self.secret {
            TentativeSecret::Challenge(challenge) => Some(challenge),
            TentativeSecret::Key(_) => None,
        }
    }
}

/// The two slots an address can occupy at once (a known peer may be
/// re-keying).
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Entry {
    pub permanent: Option<usize>,
    pub tentative: Option<usize>,
}

pub struct NbrTable {
    permanent: [Option<PermanentNbr>; NBR_MAX],
    tentative: [Option<TentativeNbr>; NBR_MAX_TENTATIVES],
    locked: bool,
}

impl Default for NbrTable {
    fn default() -> Self {
        Self::new()
    }
}

impl NbrTable {
    pub fn new() -> Self {
        const NO_PERMANENT: Option<PermanentNbr> = None;
        const NO_TENTATIVE: Option<TentativeNbr> = None;
        Self {
            permanent: [NO_PERMANENT; NBR_MAX],
            tentative: [NO_TENTATIVE; NBR_MAX_TENTATIVES],
            locked: false,
        }
    }

    /// Whether interrupt-context code may read the table right now.
    pub fn can_query_asynchronously(&self) -> bool {
        !self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn entry(&self, addr: &LinkAddr) -> Entry {
        Entry {
            permanent: self.index_of_permanent(addr),
            tentative: self.index_of_tentative(addr),
        }
    }

    pub fn index_of_permanent(&self, addr: &LinkAddr) -> Option<usize> {
        self.permanent
            .iter()
            .position(|slot| matches!(slot, Some(nbr) if nbr.addr == *addr))
    }

    pub fn index_of_tentative(&self, addr: &LinkAddr) -> Option<usize> {
        self.tentative
            .iter()
            .position(|slot| matches!(slot, Some(nbr) if nbr.addr == *addr))
    }

    pub fn permanent(&self, index: usize) -> Option<&PermanentNbr> {
        self.permanent.get(index)?.as_ref()
    }

    pub fn permanent_mut(&mut self, index: usize) -> Option<&mut PermanentNbr> {
        self.permanent.get_mut(index)?.as_mut()
    }

    pub fn tentative(&self, index: usize) -> Option<&TentativeNbr> {
        self.tentative.get(index)?.as_ref()
    }

    pub fn tentative_mut(&mut self, index: usize) -> Option<&mut TentativeNbr> {
        self.tentative.get_mut(index)?.as_mut()
    }

    pub fn add_permanent(&mut self, nbr: PermanentNbr) -> Option<usize> {
        if self.index_of_permanent(&nbr.addr).is_some() {
            return None;
        }
        let index = self.permanent.iter().position(Option::is_none)?;
        self.permanent[index] = Some(nbr);
        Some(index)
    }

    pub fn add_tentative(&mut self, nbr: TentativeNbr) -> Option<usize> {
        if self.index_of_tentative(&nbr.addr).is_some() {
            return None;
        }
        let index = self.tentative.iter().position(Option::is_none)?;
        self.tentative[index] = Some(nbr);
        Some(index)
    }

    pub fn delete_permanent(&mut self, index: usize) {
        if let Some(Some(nbr)) = self.permanent.get_mut(index) {
            // key material does not linger in the freed slot
            nbr.pairwise_key.fill(0);
            nbr.group_key.fill(0);
            self.permanent[index] = None;
        }
    }

    pub fn delete_tentative(&mut self, index: usize) {
        if let Some(Some(nbr)) = self.tentative.get_mut(index) {
            nbr.secret = TentativeSecret::Challenge([0; CHALLENGE_LEN]);
            self.tentative[index] = None;
        }
    }

    pub fn count_permanent(&self) -> usize {
        self.permanent.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn count_tentative(&self) -> usize {
        self.tentative.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn permanents(&self) -> impl Iterator<Item = (usize, &PermanentNbr)> {
        self.permanent
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|nbr| (i, nbr)))
    }

    pub fn tentatives(&self) -> impl Iterator<Item = (usize, &TentativeNbr)> {
        self.tentative
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|nbr| (i, nbr)))
    }
}

impl PermanentNbr {
    pub fn new(addr: LinkAddr) -> Self {
        Self {
            addr,
            anti_replay: AntiReplayInfo::default(),
            pairwise_key: [0; AES_128_KEY_LENGTH],
            group_key: [0; AES_128_KEY_LENGTH],
            prolongation_time: 0,
            sent_authentic_hello: false,
            is_receiving_update: false,
            helloack_challenge: None,
            sync: Phase::default(),
            drift: None,
            historical_sync: Phase::default(),
            channels: DefaultChannelSelector::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> LinkAddr {
        LinkAddr([0, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn permanent_and_tentative_slots_are_independent() {
        let mut table = NbrTable::new();
        let p = table.add_permanent(PermanentNbr::new(addr(1))).unwrap();
        let t = table
            .add_tentative(TentativeNbr::new(
                addr(1),
                TentativeSecret::Challenge([7; CHALLENGE_LEN]),
                100,
            ))
            .unwrap();
        let entry = table.entry(&addr(1));
        assert_eq!(entry.permanent, Some(p));
        assert_eq!(entry.tentative, Some(t));

        table.delete_tentative(t);
        let entry = table.entry(&addr(1));
        assert_eq!(entry.permanent, Some(p));
        assert_eq!(entry.tentative, None);
    }

    #[test]
    fn no_duplicate_addresses_per_arena() {
        let mut table = NbrTable::new();
        assert!(table.add_permanent(PermanentNbr::new(addr(1))).is_some());
        assert!(table.add_permanent(PermanentNbr::new(addr(1))).is_none());
        assert_eq!(table.count_permanent(), 1);
    }

    #[test]
    fn arenas_are_bounded() {
        let mut table = NbrTable::new();
        for i in 0..NBR_MAX_TENTATIVES {
            assert!(table
                .add_tentative(TentativeNbr::new(
                    addr(i as u8),
                    TentativeSecret::Challenge([0; CHALLENGE_LEN]),
                    0,
                ))
                .is_some());
        }
        assert!(table
            .add_tentative(TentativeNbr::new(
                addr(200),
                TentativeSecret::Challenge([0; CHALLENGE_LEN]),
                0,
            ))
            .is_none());
        assert_eq!(table.count_tentative(), NBR_MAX_TENTATIVES);
    }

    #[test]
    fn tentative_secret_accessors() {
        let mut nbr = TentativeNbr::new(
            addr(1),
            TentativeSecret::Challenge([3; CHALLENGE_LEN]),
            0,
        );
        assert_eq!(nbr.challenge(), Some(&[3; CHALLENGE_LEN]));
        assert_eq!(nbr.tentative_pairwise_key(), None);
        nbr.secret = TentativeSecret::Key([9; AES_128_KEY_LENGTH]);
        assert_eq!(nbr.challenge(), None);
        assert_eq!(nbr.tentative_pairwise_key(), Some(&[9; AES_128_KEY_LENGTH]));
    }

    #[test]
    fn deletion_releases_the_slot() {
        let mut table = NbrTable::new();
        let p = table.add_permanent(PermanentNbr::new(addr(1))).unwrap();
        table.delete_permanent(p);
        assert_eq!(table.count_permanent(), 0);
        assert!(table.add_permanent(PermanentNbr::new(addr(2))).is_some());
    }
}
