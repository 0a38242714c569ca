//! Adaptive key establishment and neighbor management.
//!
//! Three command frames upgrade a stranger to a keyed, phase-locked
//! neighbor:
//!
//! ```norust
//! A                                   B
//! |--- HELLO(q_A) ------------------->|   broadcast, trickled
//! |<-- HELLOACK(q_B, phase, K_gB) ----|   under K_AB = AES(master, q_A||q_B)
//! |--- ACK(q_B, delta, K_gA) -------->|   under K_AB
//! ```
//!
//! The pairwise key is derived from both challenges; each side's group
//! (broadcast) key rides encrypted in its last handshake frame. B keeps A
//! *tentative* (challenge, wait timer, HELLOACK retransmission count) until
//! the ACK proves A derived the same key; the ACK must also echo `q_B` and
//! the strobe index of the HELLOACK it answers, which pins the phase lock.
//!
//! Liveness is maintained by authenticated UPDATE broadcasts; a permanent
//! neighbor that is neither updated nor re-keyed for its lifetime expires.

use rand_core::RngCore;

use crate::anti_replay::{self, OutgoingCounters};
use crate::ccm_inputs;
use crate::config::{
    self, MAX_HELLOACK_TRANSMISSIONS, MAX_WAITING_PERIOD_SECONDS, NBR_LIFETIME_SECONDS,
};
use crate::crypto::{Aes128, CcmStar, AES_128_KEY_LENGTH};
use crate::nbr::{
    Entry, NbrTable, PermanentNbr, Phase, TentativeNbr, TentativeSecret, CHALLENGE_LEN,
};
use crate::packetbuf::{Attr, FrameType, Packetbuf};
use crate::time::RtimerClock;
use crate::trickle::Trickle;
use crate::wake_up_counter::WakeUpCounter;
use crate::{Error, LinkAddr, RebootPolicy};

/// Command frame identifiers.
pub const CMD_HELLO: u8 = 0x0A;
pub const CMD_HELLOACK: u8 = 0x0B;
/// HELLOACK variant answering a HELLO of an already-permanent peer.
pub const CMD_HELLOACK_P: u8 = 0x0C;
pub const CMD_ACK: u8 = 0x0D;
pub const CMD_UPDATE: u8 = 0x0E;

pub fn is_hello_helloack_or_ack(dispatch: Option<u8>) -> bool {
    matches!(
        dispatch,
        Some(CMD_HELLO) | Some(CMD_HELLOACK) | Some(CMD_HELLOACK_P) | Some(CMD_ACK)
    )
}

/// Payload layouts (command byte included):
///
/// ```norust
/// HELLO     [cmd][q_A 8][phase 4][wake-up counter 4]
/// HELLOACK  [cmd][q_B 8][phase 4][wake-up counter 4][group key 16]
/// ACK       [cmd][q_B 8][strobe index 1][delta 1][group key 16]
/// UPDATE    [cmd]
/// ```
///
/// Phase and wake-up counter fields are patched just before the SHR goes
/// out; the trailing group key is the only encrypted span.
pub const HELLO_DATALEN: usize = 1 + CHALLENGE_LEN + 4 + 4;
pub const HELLOACK_DATALEN: usize = 1 + CHALLENGE_LEN + 4 + 4 + AES_128_KEY_LENGTH;
pub const ACK_DATALEN: usize = 1 + CHALLENGE_LEN + 1 + 1 + AES_128_KEY_LENGTH;
pub const UPDATE_DATALEN: usize = 1;

/// Offset of the phase/wake-up-counter span inside HELLO and HELLOACK
/// payloads.
pub const PIGGYBACK_OFFSET: usize = 1 + CHALLENGE_LEN;

/// Derives a pairwise key from two challenges: one AES block over
/// `q_a || q_b` under the network's master secret.
pub fn derive_pairwise_key<A: Aes128>(
    aes: &mut A,
    master_secret: &[u8; AES_128_KEY_LENGTH],
    q_a: &[u8; CHALLENGE_LEN],
    q_b: &[u8; CHALLENGE_LEN],
) -> Result<[u8; AES_128_KEY_LENGTH], Error> {
    let mut block = [0; AES_128_KEY_LENGTH];
    block[..CHALLENGE_LEN].copy_from_slice(q_a);
    block[CHALLENGE_LEN..].copy_from_slice(q_b);
    aes.set_key(master_secret).map_err(|_| Error::KeyNotFound)?;
    aes.encrypt(&mut block).map_err(|_| Error::Err)?;
    Ok(block)
}

/// AEAD-seals the packetbuf's frame under `key`: authenticates header plus
/// the unencrypted payload span, encrypts the rest, appends the MIC.
///
/// With secure phase lock the strobe index sits in the nonce, so this runs
/// again on every retransmission (over a scratch copy of the frame).
pub fn secure<A: Aes128>(
    pb: &mut Packetbuf,
    ccm: &mut CcmStar<A>,
    key: &[u8; AES_128_KEY_LENGTH],
    node_addr: &LinkAddr,
    strobe_index: u8,
    sec_lvl: u8,
) -> Result<(), Error> {
    let mic_len = config::mic_len(sec_lvl);
    let nonce = ccm_inputs::generate_nonce(pb, node_addr, strobe_index, true);
    let a_len = if sec_lvl & (1 << 2) != 0 {
        (pb.hdrlen() + pb.attr(Attr::UnencryptedBytes) as usize).min(pb.totlen())
    } else {
        pb.totlen()
    };
    pb.extend_data(mic_len)?;
    let totlen = pb.totlen();
    let frame = pb.hdrptr_mut();
    let (a, rest) = frame.split_at_mut(a_len);
    let (m, mic) = rest.split_at_mut(totlen - a_len - mic_len);
    ccm.set_key(key).map_err(|_| Error::KeyNotFound)?;
    ccm.aead(&nonce, m, a, mic, true).map_err(|_| Error::Err)?;
    Ok(())
}

/// Reverse of [`secure`]: decrypts in place, verifies and strips the MIC.
pub fn unsecure<A: Aes128>(
    pb: &mut Packetbuf,
    ccm: &mut CcmStar<A>,
    key: &[u8; AES_128_KEY_LENGTH],
    node_addr: &LinkAddr,
    strobe_index: u8,
    sec_lvl: u8,
) -> Result<(), Error> {
    let mic_len = config::mic_len(sec_lvl);
    if pb.datalen() < mic_len {
        return Err(Error::BadLength);
    }
    let nonce = ccm_inputs::generate_nonce(pb, node_addr, strobe_index, false);
    let a_len = if sec_lvl & (1 << 2) != 0 {
        (pb.hdrlen() + pb.attr(Attr::UnencryptedBytes) as usize).min(pb.totlen() - mic_len)
    } else {
        pb.totlen() - mic_len
    };
    let totlen = pb.totlen();
    let frame = pb.hdrptr_mut();
    let (a, rest) = frame.split_at_mut(a_len);
    let (m, received_mic) = rest.split_at_mut(totlen - a_len - mic_len);
    let mut expected = [0u8; 16];
    ccm.set_key(key).map_err(|_| Error::KeyNotFound)?;
    ccm.aead(&nonce, m, a, &mut expected[..mic_len], false)
        .map_err(|_| Error::Err)?;
    if expected[..mic_len] != received_mic[..mic_len] {
        return Err(Error::Inauthentic);
    }
    let datalen = pb.datalen();
    pb.set_datalen(datalen - mic_len)?;
    Ok(())
}

/// The AKES engine state.
pub struct Akes {
    pub master_secret: [u8; AES_128_KEY_LENGTH],
    /// Our broadcast key, shipped to peers inside HELLOACK/ACK.
    pub group_key: [u8; AES_128_KEY_LENGTH],
    /// Challenge of the currently trickled HELLO.
    pub hello_challenge: [u8; CHALLENGE_LEN],
    pub trickle: Trickle,
    /// Uptime second of the next expiration sweep.
    next_sweep: u32,
}

/// What the caller should transmit next, if anything.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    None,
    HelloAck,
    Ack,
}

impl Akes {
    pub fn new<R: RngCore>(master_secret: [u8; AES_128_KEY_LENGTH], rng: &mut R) -> Self {
        let mut group_key = [0; AES_128_KEY_LENGTH];
        rng.fill_bytes(&mut group_key);
        let mut hello_challenge = [0; CHALLENGE_LEN];
        rng.fill_bytes(&mut hello_challenge);
        Self {
            master_secret,
            group_key,
            hello_challenge,
            trickle: Trickle::new(),
            next_sweep: 0,
        }
    }

    /// Builds a HELLO into `pb` with a fresh challenge.
    pub fn prepare_hello<R: RngCore>(
        &mut self,
        pb: &mut Packetbuf,
        counters: &mut OutgoingCounters,
        reboot: &mut impl RebootPolicy,
        rng: &mut R,
    ) {
        rng.fill_bytes(&mut self.hello_challenge);
        pb.clear();
        pb.set_receiver(LinkAddr::NULL);
        pb.set_frame_type(FrameType::Command);
        let mut data = [0u8; HELLO_DATALEN];
        data[0] = CMD_HELLO;
        data[1..1 + CHALLENGE_LEN].copy_from_slice(&self.hello_challenge);
        let _ = pb.copy_from(&data);
        pb.set_attr(Attr::UnencryptedBytes, HELLO_DATALEN as u16);
        anti_replay::set_counter(pb, counters, None, reboot);
    }

    /// Handles a verified-or-unknown HELLO; answers with a HELLOACK when
    /// acceptable. `authentic` says whether the sender was already
    /// permanent and its group-key MIC verified.
    #[allow(clippy::too_many_arguments)]
    pub fn on_hello<A: Aes128, R: RngCore>(
        &mut self,
        pb: &Packetbuf,
        out: &mut Packetbuf,
        nbrs: &mut NbrTable,
        aes: &mut CcmStar<A>,
        counters: &mut OutgoingCounters,
        reboot: &mut impl RebootPolicy,
        rng: &mut R,
        authentic: bool,
        now_seconds: u32,
    ) -> Result<Reply, Error> {
        let sender = pb.sender();
        let data = pb.dataptr();
        if data.len() < HELLO_DATALEN {
            return Err(Error::BadLength);
        }
        let mut q_a = [0; CHALLENGE_LEN];
        q_a.copy_from_slice(&data[1..1 + CHALLENGE_LEN]);

        let entry = nbrs.entry(&sender);
        if entry.tentative.is_some() {
            log::info!("akes: handshake with this peer is already running");
            return Ok(Reply::None);
        }
        if authentic {
            if let Some(index) = entry.permanent {
                if let Some(permanent) = nbrs.permanent_mut(index) {
                    // force a full re-handshake before the next prolongation
                    permanent.sent_authentic_hello = false;
                }
            }
        }

        // become tentative towards the sender, holding the derived key
        let mut q_b = [0; CHALLENGE_LEN];
        rng.fill_bytes(&mut q_b);
        let pairwise = derive_pairwise_key(aes_of(aes), &self.master_secret, &q_a, &q_b)?;

        let mut tentative = TentativeNbr::new(
            sender,
            TentativeSecret::Key(pairwise),
            now_seconds + MAX_WAITING_PERIOD_SECONDS,
        );
        tentative.q = q_b;
        tentative.phase = phase_of(pb);
        nbrs.add_tentative(tentative).ok_or(Error::QueueFull)?;

        // the HELLOACK itself
        out.clear();
        out.set_receiver(sender);
        out.set_frame_type(FrameType::Command);
        let mut data = [0u8; HELLOACK_DATALEN];
        data[0] = if entry.permanent.is_some() {
            CMD_HELLOACK_P
        } else {
            CMD_HELLOACK
        };
        data[1..1 + CHALLENGE_LEN].copy_from_slice(&q_b);
        data[HELLOACK_DATALEN - AES_128_KEY_LENGTH..].copy_from_slice(&self.group_key);
        let _ = out.copy_from(&data);
        out.set_attr(
            Attr::UnencryptedBytes,
            (HELLOACK_DATALEN - AES_128_KEY_LENGTH) as u16,
        );
        anti_replay::set_counter(out, counters, None, reboot);

        if let Some(index) = nbrs.index_of_permanent(&sender) {
            if let Some(permanent) = nbrs.permanent_mut(index) {
                permanent.helloack_challenge = Some([q_b[0], q_b[1]]);
            }
        }
        Ok(Reply::HelloAck)
    }

    /// Handles a HELLOACK answering our trickled HELLO. On success the
    /// sender becomes permanent and `out` holds the closing ACK.
    #[allow(clippy::too_many_arguments)]
    pub fn on_helloack<A: Aes128>(
        &mut self,
        pb: &mut Packetbuf,
        out: &mut Packetbuf,
        nbrs: &mut NbrTable,
        ccm: &mut CcmStar<A>,
        counters: &mut OutgoingCounters,
        reboot: &mut impl RebootPolicy,
        node_addr: &LinkAddr,
        strobe_index: u8,
        reception_delta: u8,
        now_seconds: u32,
    ) -> Result<Reply, Error> {
        let sender = pb.sender();
        {
            let data = pb.dataptr();
            if data.len() < HELLOACK_DATALEN + config::UNICAST_MIC_LEN {
                return Err(Error::BadLength);
            }
        }
        let mut q_b = [0; CHALLENGE_LEN];
        q_b.copy_from_slice(&pb.dataptr()[1..1 + CHALLENGE_LEN]);

        let pairwise = derive_pairwise_key(
            aes_of(ccm),
            &self.master_secret,
            &self.hello_challenge,
            &q_b,
        )?;
        unsecure(
            pb,
            ccm,
            &pairwise,
            node_addr,
            strobe_index,
            config::UNICAST_SEC_LVL,
        )?;

        // replaces any earlier association with this peer
        if let Some(old) = nbrs.index_of_permanent(&sender) {
            nbrs.delete_permanent(old);
        }

        let data = pb.dataptr();
        let mut permanent = PermanentNbr::new(sender);
        permanent.pairwise_key = pairwise;
        permanent
            .group_key
            .copy_from_slice(&data[HELLOACK_DATALEN - AES_128_KEY_LENGTH..HELLOACK_DATALEN]);
        permanent.sync = phase_of(pb);
        permanent.historical_sync = permanent.sync;
        permanent.prolongation_time = now_seconds + NBR_LIFETIME_SECONDS;
        permanent.sent_authentic_hello = true;
        permanent.anti_replay.last_unicast_counter = anti_replay::get_counter(pb);
        nbrs.add_permanent(permanent).ok_or(Error::QueueFull)?;

        // the closing ACK, echoing q_B and the HELLOACK's strobe binding
        out.clear();
        out.set_receiver(sender);
        out.set_frame_type(FrameType::Command);
        let mut ack = [0u8; ACK_DATALEN];
        ack[0] = CMD_ACK;
        ack[1..1 + CHALLENGE_LEN].copy_from_slice(&q_b);
        ack[1 + CHALLENGE_LEN] = strobe_index;
        ack[1 + CHALLENGE_LEN + 1] = reception_delta;
        ack[ACK_DATALEN - AES_128_KEY_LENGTH..].copy_from_slice(&self.group_key);
        let _ = out.copy_from(&ack);
        out.set_attr(
            Attr::UnencryptedBytes,
            (ACK_DATALEN - AES_128_KEY_LENGTH) as u16,
        );
        anti_replay::set_counter(out, counters, None, reboot);
        Ok(Reply::Ack)
    }

    /// Handles the closing ACK of a handshake we answered. The MIC and the
    /// `q`/strobe echo were already checked in the reception interrupt;
    /// here the tentative neighbor is promoted.
    pub fn on_ack(
        &mut self,
        pb: &Packetbuf,
        nbrs: &mut NbrTable,
        now_seconds: u32,
    ) -> Result<(), Error> {
        let sender = pb.sender();
        let entry = nbrs.entry(&sender);
        let tentative_index = entry.tentative.ok_or(Error::KeyNotFound)?;

        let data = pb.dataptr();
        if data.len() < ACK_DATALEN {
            return Err(Error::BadLength);
        }
        let delta = data[1 + CHALLENGE_LEN + 1];

        let (pairwise, helloack_sfd, anti_replay_info) = {
            let tentative = nbrs.tentative(tentative_index).ok_or(Error::KeyNotFound)?;
            (
                *tentative
                    .tentative_pairwise_key()
                    .ok_or(Error::KeyNotFound)?,
                tentative.helloack_sfd_timestamp,
                tentative.anti_replay,
            )
        };

        if let Some(old) = entry.permanent {
            nbrs.delete_permanent(old);
        }

        let mut permanent = PermanentNbr::new(sender);
        permanent.pairwise_key = pairwise;
        permanent
            .group_key
            .copy_from_slice(&data[ACK_DATALEN - AES_128_KEY_LENGTH..ACK_DATALEN]);
        permanent.sync = Phase {
            t: helloack_sfd.wrapping_sub((delta as RtimerClock) << config::DELTA_SHIFT),
            wake_up_counter_at_t: WakeUpCounter::default(),
        };
        permanent.historical_sync = permanent.sync;
        permanent.anti_replay = anti_replay_info;
        permanent.prolongation_time = now_seconds + NBR_LIFETIME_SECONDS;
        permanent.sent_authentic_hello = true;
        nbrs.add_permanent(permanent).ok_or(Error::QueueFull)?;
        nbrs.delete_tentative(tentative_index);
        Ok(())
    }

    /// Builds an UPDATE broadcast into `pb`.
    pub fn prepare_update(
        &mut self,
        pb: &mut Packetbuf,
        counters: &mut OutgoingCounters,
        reboot: &mut impl RebootPolicy,
    ) {
        pb.clear();
        pb.set_receiver(LinkAddr::NULL);
        pb.set_frame_type(FrameType::Command);
        let _ = pb.copy_from(&[CMD_UPDATE]);
        pb.set_attr(Attr::UnencryptedBytes, UPDATE_DATALEN as u16);
        anti_replay::set_counter(pb, counters, None, reboot);
    }

    /// Handles a verified UPDATE: prolongs the sender.
    pub fn on_update(
        &mut self,
        pb: &Packetbuf,
        nbrs: &mut NbrTable,
        now_seconds: u32,
    ) -> Result<(), Error> {
        let index = nbrs
            .index_of_permanent(&pb.sender())
            .ok_or(Error::KeyNotFound)?;
        let permanent = nbrs.permanent_mut(index).ok_or(Error::KeyNotFound)?;
        if permanent.sent_authentic_hello {
            permanent.prolongation_time = now_seconds + NBR_LIFETIME_SECONDS;
        }
        Ok(())
    }

    /// Periodic sweep: expired tentatives and overdue permanents go away.
    /// Returns whether an UPDATE broadcast is due to keep us alive in our
    /// neighbors' tables.
    pub fn poll_expiry(&mut self, nbrs: &mut NbrTable, now_seconds: u32) -> bool {
        if now_seconds < self.next_sweep {
            return false;
        }
        self.next_sweep = now_seconds + 5;

        let expired_tentatives: heapless::Vec<usize, { config::NBR_MAX_TENTATIVES }> = nbrs
            .tentatives()
            .filter(|(_, nbr)| nbr.expiration_time <= now_seconds)
            .map(|(i, _)| i)
            .collect();
        for index in expired_tentatives {
            log::info!("akes: tentative neighbor expired");
            nbrs.delete_tentative(index);
        }

        let expired_permanents: heapless::Vec<usize, { config::NBR_MAX }> = nbrs
            .permanents()
            .filter(|(_, nbr)| nbr.prolongation_time <= now_seconds)
            .map(|(i, _)| i)
            .collect();
        for index in expired_permanents {
            log::info!("akes: permanent neighbor expired");
            nbrs.delete_permanent(index);
        }

        // announce liveness once half of the shortest remaining lifetime
        // is gone
        nbrs.permanents().any(|(_, nbr)| {
            nbr.prolongation_time.saturating_sub(now_seconds) < NBR_LIFETIME_SECONDS / 2
        })
    }

    /// Bumps the HELLOACK retransmission accounting after it was strobed
    /// and records the binding data the closing ACK must match. Returns
    /// `false` once the tentative neighbor should be dropped.
    pub fn on_helloack_sent(
        &mut self,
        nbrs: &mut NbrTable,
        receiver: &LinkAddr,
        strobe_index: u8,
        payload_sfd: RtimerClock,
    ) -> bool {
        let Some(index) = nbrs.index_of_tentative(receiver) else {
            return false;
        };
        let Some(tentative) = nbrs.tentative_mut(index) else {
            return false;
        };
        tentative.was_helloack_sent = true;
        tentative.strobe_index = strobe_index;
        tentative.helloack_sfd_timestamp = payload_sfd;
        tentative.helloack_transmissions += 1;
        if tentative.helloack_transmissions > MAX_HELLOACK_TRANSMISSIONS {
            nbrs.delete_tentative(index);
            return false;
        }
        true
    }
}

/// Reads the phase/wake-up-counter piggyback span of HELLO and HELLOACK
/// payloads. The `phase` field holds the ticks between the sender's last
/// wake-up and this frame's SFD; the caller rebases it onto the local SFD
/// timestamp via [`rebase_phase`].
fn phase_of(pb: &Packetbuf) -> Phase {
    let data = pb.dataptr();
    let phase = u32::from_be_bytes(
        data[PIGGYBACK_OFFSET..PIGGYBACK_OFFSET + 4]
            .try_into()
            .unwrap(),
    );
    let wuc = WakeUpCounter::parse(&data[PIGGYBACK_OFFSET + 4..PIGGYBACK_OFFSET + 8]);
    Phase {
        t: phase,
        wake_up_counter_at_t: wuc,
    }
}

/// Converts a received piggyback phase (ticks since the sender's wake-up
/// at SFD time) into the sender's wake-up instant on the local clock.
pub fn rebase_phase(piggybacked: Phase, sfd_timestamp: RtimerClock) -> Phase {
    Phase {
        t: sfd_timestamp.wrapping_sub(piggybacked.t),
        wake_up_counter_at_t: piggybacked.wake_up_counter_at_t,
    }
}

/// Patches the phase/wake-up-counter span of a serialized HELLO or
/// HELLOACK frame right before its SHR leaves the antenna.
pub fn patch_piggybacked_phase(
    frame: &mut [u8],
    hdrlen: usize,
    ticks_since_wake_up: RtimerClock,
    wake_up_counter: WakeUpCounter,
) {
    let at = hdrlen + PIGGYBACK_OFFSET;
    frame[at..at + 4].copy_from_slice(&ticks_since_wake_up.to_be_bytes());
    wake_up_counter.write(&mut frame[at + 4..at + 8]);
}

/// HELLOs are acceptable while there is room for another handshake.
pub fn is_acceptable_hello(nbrs: &NbrTable) -> bool {
    nbrs.count_tentative() < config::NBR_MAX_TENTATIVES
        && (nbrs.count_permanent() < config::NBR_MAX)
}

/// HELLOACKs must answer a HELLO of ours and must not collide with a
/// running handshake.
pub fn is_acceptable_helloack(nbrs: &NbrTable, entry: &Entry) -> bool {
    entry.tentative.is_none()
        && (entry.permanent.is_some() || nbrs.count_permanent() < config::NBR_MAX)
}

/// ACKs are acceptable from peers we answered with a HELLOACK.
pub fn is_acceptable_ack(nbrs: &NbrTable, entry: &Entry) -> bool {
    entry
        .tentative
        .and_then(|i| nbrs.tentative(i))
        .map(|t| t.was_helloack_sent)
        .unwrap_or(false)
}

fn aes_of<A: Aes128>(ccm: &mut CcmStar<A>) -> &mut A {
    ccm.aes_mut()
}
