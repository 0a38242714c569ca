//! Extended-frame framer with on-the-fly rejection.
//!
//! Frames use the extended frame type byte `0bss_uuu_111` (lower three bits
//! mark the extended frame space, upper two the subtype). Headers carry only
//! the fields their type needs:
//!
//! ```norust
//! type | PAN id | dst addr  | src addr | counter | OTP | strobe | seqno | pad len | padding
//!  1   | 2 (H*) | 8 (H-ACK) | 8        | 4 or 1  | 2-3 | 1 (u)  | 1 (d) | 1       | n
//! ```
//!
//! The filter sees only the first bytes out of the radio FIFO and rejects
//! frames addressed elsewhere before they are fully received. Unicast
//! payload frames are pre-authenticated by their one-time pseudonym, a short
//! AEAD tag over the announced frame length, and acknowledged by a frame
//! that is synthesized right in the FIFOP interrupt.
//!
//! Wake-up frames are their own tiny codec: a two-byte address pseudonym,
//! the rendezvous countdown, and a CRC-16 trailer.

use crc::{Crc, CRC_16_KERMIT};
use modular_bitfield::prelude::*;

use crate::akes;
use crate::anti_replay;
use crate::ccm_inputs;
use crate::config::{
    self, BROADCAST_SEC_LVL, MIN_FRAME_LENGTH, OTP_LEN, UNICAST_MIC_LEN, UNICAST_SEC_LVL,
};
use crate::crypto::{Aes128, CcmStar, AES_128_KEY_LENGTH, CCM_STAR_NONCE_LENGTH};
use crate::leaky_bucket::LeakyBucket;
use crate::nbr::NbrTable;
use crate::packetbuf::{Attr, FrameType, Packetbuf};
use crate::time::ClockTime;
use crate::{Error, LinkAddr, PanId, LINKADDR_SIZE};

pub const FCS: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);
pub const FCS_LEN: usize = 2;

/// The extended frame type octet.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedFrameType {
    /// `0b111` on every extended frame.
    pub indicator: B3,
    /// Extended frame type: short (0) or long (1) group.
    pub long_group: B3,
    pub subtype: B2,
}

pub const EXTENDED_INDICATOR: u8 = 0b111;

/// The eight frame kinds, `(long_group, subtype)` in the type octet.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    UnicastData,
    UnicastCommand,
    HelloAck,
    Ack,
    BroadcastData,
    BroadcastCommand,
    Hello,
    Acknowledgment,
}

impl FrameKind {
    pub fn to_byte(self) -> u8 {
        let (long_group, subtype) = match self {
            FrameKind::UnicastData => (0, 0),
            FrameKind::UnicastCommand => (0, 1),
            FrameKind::HelloAck => (0, 2),
            FrameKind::Ack => (0, 3),
            FrameKind::BroadcastData => (1, 0),
            FrameKind::BroadcastCommand => (1, 1),
            FrameKind::Hello => (1, 2),
            FrameKind::Acknowledgment => (1, 3),
        };
        ExtendedFrameType::new()
            .with_indicator(EXTENDED_INDICATOR)
            .with_long_group(long_group)
            .with_subtype(subtype)
            .into_bytes()[0]
    }

    pub fn from_byte(byte: u8) -> Option<FrameKind> {
        let parsed = ExtendedFrameType::from_bytes([byte]);
        if parsed.indicator() != EXTENDED_INDICATOR {
            return None;
        }
        Some(match (parsed.long_group(), parsed.subtype()) {
            (0, 0) => FrameKind::UnicastData,
            (0, 1) => FrameKind::UnicastCommand,
            (0, 2) => FrameKind::HelloAck,
            (0, 3) => FrameKind::Ack,
            (1, 0) => FrameKind::BroadcastData,
            (1, 1) => FrameKind::BroadcastCommand,
            (1, 2) => FrameKind::Hello,
            (1, 3) => FrameKind::Acknowledgment,
            _ => return None,
        })
    }

    pub const fn is_broadcast(self) -> bool {
        matches!(
            self,
            FrameKind::BroadcastData | FrameKind::BroadcastCommand | FrameKind::Hello
        )
    }

    const fn has_destination_pan_id(self) -> bool {
        matches!(self, FrameKind::Hello | FrameKind::HelloAck)
    }

    const fn has_destination_address(self) -> bool {
        matches!(self, FrameKind::HelloAck)
    }

    const fn has_otp(self) -> bool {
        matches!(
            self,
            FrameKind::UnicastData
                | FrameKind::UnicastCommand
                | FrameKind::BroadcastData
                | FrameKind::BroadcastCommand
                | FrameKind::Ack
        )
    }

    const fn has_strobe_index(self) -> bool {
        matches!(
            self,
            FrameKind::UnicastData | FrameKind::UnicastCommand | FrameKind::HelloAck | FrameKind::Ack
        )
    }

    const fn has_seqno(self) -> bool {
        matches!(self, FrameKind::UnicastData | FrameKind::UnicastCommand)
    }

    pub const fn sec_lvl(self) -> u8 {
        if self.is_broadcast() {
            BROADCAST_SEC_LVL
        } else {
            UNICAST_SEC_LVL
        }
    }
}

#[cfg(feature = "frame-counter-suppression")]
const fn frame_counter_len(kind: FrameKind) -> usize {
    if matches!(kind, FrameKind::HelloAck) {
        4
    } else {
        1
    }
}

#[cfg(not(feature = "frame-counter-suppression"))]
const fn frame_counter_len(_kind: FrameKind) -> usize {
    4
}

/// Offset of the strobe index field, which doubles as the length of
/// everything before it.
pub const fn strobe_index_offset(kind: FrameKind) -> usize {
    1 + if kind.has_destination_pan_id() { 2 } else { 0 }
        + if kind.has_destination_address() {
            LINKADDR_SIZE
        } else {
            0
        }
        + LINKADDR_SIZE
        + frame_counter_len(kind)
        + if kind.has_otp() { OTP_LEN } else { 0 }
}

pub const fn header_length_of(kind: FrameKind) -> usize {
    strobe_index_offset(kind)
        + kind.has_strobe_index() as usize
        + kind.has_seqno() as usize
        + 1 /* number of padding bytes */
}

const fn flen(hdr: usize, data: usize, mic: usize) -> usize {
    let len = hdr + data + mic;
    if len < MIN_FRAME_LENGTH {
        MIN_FRAME_LENGTH
    } else {
        len
    }
}

/// Total frame lengths of the fixed-size handshake frames. The filter
/// matches on these before reading any further.
pub const HELLO_LEN: usize = flen(
    header_length_of(FrameKind::Hello),
    akes::HELLO_DATALEN,
    config::BROADCAST_MIC_LEN,
);
pub const HELLOACK_LEN: usize = flen(
    header_length_of(FrameKind::HelloAck),
    akes::HELLOACK_DATALEN,
    UNICAST_MIC_LEN,
);
pub const ACK_LEN: usize = flen(
    header_length_of(FrameKind::Ack),
    akes::ACK_DATALEN,
    UNICAST_MIC_LEN,
);

/// Bytes the radio must buffer before the filter is worth running.
pub const MIN_BYTES_FOR_FILTERING: usize = 1 + LINKADDR_SIZE + 4 - 4;

/// Maximum length of a synthesized acknowledgment frame (type, delta, MIC,
/// FCS).
pub const MAX_ACKNOWLEDGMENT_LEN: usize = 1 + 1 + UNICAST_MIC_LEN + FCS_LEN;

/// Acknowledgment frame lengths on the air (without FCS), per triggering
/// frame kind.
pub const DEFAULT_ACKNOWLEDGMENT_LEN: usize = 1 + 1 + UNICAST_MIC_LEN;
pub const HELLOACK_ACKNOWLEDGMENT_LEN: usize = 1;

/// A synthesized acknowledgment, ready for `Radio::prepare`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct Acknowledgment {
    pub buf: [u8; MAX_ACKNOWLEDGMENT_LEN],
    pub len: usize,
}

impl Default for Acknowledgment {
    fn default() -> Self {
        Self {
            buf: [0; MAX_ACKNOWLEDGMENT_LEN],
            len: 0,
        }
    }
}

impl Acknowledgment {
    pub fn frame(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// What the filter decided about a frame prefix.
pub struct Filtered {
    pub kind: FrameKind,
    /// Prepared acknowledgment; `None` for broadcast frames.
    pub acknowledgment: Option<Acknowledgment>,
    /// The sender's strobe index, bound into the acknowledgment nonce.
    pub strobe_index: u8,
}

/// Everything the framer needs besides the packetbuf.
pub struct FramerContext<'a, A: Aes128> {
    pub ccm: &'a mut CcmStar<A>,
    pub nbrs: &'a mut NbrTable,
    pub node_addr: LinkAddr,
    pub pan_id: PanId,
    /// Our own broadcast (group) key.
    pub group_key: [u8; AES_128_KEY_LENGTH],
    pub hello_bucket: &'a mut LeakyBucket,
    pub helloack_bucket: &'a mut LeakyBucket,
    pub now_ms: ClockTime,
}

/// Determines the frame kind of the packetbuf's frame.
pub fn kind_of(pb: &Packetbuf) -> Result<FrameKind, Error> {
    Ok(match pb.frame_type() {
        FrameType::Data => {
            if pb.holds_broadcast() {
                FrameKind::BroadcastData
            } else {
                FrameKind::UnicastData
            }
        }
        FrameType::Command => match pb.dataptr().first().copied() {
            Some(akes::CMD_HELLO) => FrameKind::Hello,
            Some(akes::CMD_HELLOACK) | Some(akes::CMD_HELLOACK_P) => FrameKind::HelloAck,
            Some(akes::CMD_ACK) => FrameKind::Ack,
            Some(_) => {
                if pb.holds_broadcast() {
                    FrameKind::BroadcastCommand
                } else {
                    FrameKind::UnicastCommand
                }
            }
            None => return Err(Error::BadLength),
        },
    })
}

/// Header bytes `create` will prepend to a plain data frame.
pub fn length(pb: &Packetbuf) -> usize {
    header_length_of(if pb.holds_broadcast() {
        FrameKind::BroadcastData
    } else {
        FrameKind::UnicastData
    })
}

/// Builds the frame header in front of the payload. The MIC is appended
/// separately by the security layer; `create` leaves the frame one MIC
/// short of its on-air length.
pub fn create<A: Aes128>(pb: &mut Packetbuf, ctx: &mut FramerContext<'_, A>) -> Result<usize, Error> {
    let kind = kind_of(pb)?;
    let mic_len = config::mic_len(kind.sec_lvl());

    let basic_len = header_length_of(kind);
    let padding_bytes =
        MIN_FRAME_LENGTH.saturating_sub(basic_len + pb.datalen() + mic_len);

    pb.hdralloc(basic_len + padding_bytes)?;

    let totlen = (pb.totlen() + mic_len) as u8;
    let receiver = pb.receiver();
    let counter_bytes = {
        let mut bytes = [0; 4];
        anti_replay::write_counter(pb, &mut bytes);
        bytes
    };
    let lsbs = anti_replay::counter_lsbs(pb);
    let seqno = pb.attr(Attr::MacSeqno) as u8;
    let pending = pb.attr(Attr::Pending) != 0;

    let otp = if kind.has_otp() {
        Some(generate_otp(pb, kind, totlen, ctx)?)
    } else {
        None
    };

    let hdr = pb.hdrptr_mut();
    let mut at = 0;
    hdr[at] = kind.to_byte();
    at += 1;

    if kind.has_destination_pan_id() {
        hdr[at..at + 2].copy_from_slice(&ctx.pan_id.0.to_le_bytes());
        at += 2;
    }

    if kind.has_destination_address() {
        receiver.write(&mut hdr[at..]);
        at += LINKADDR_SIZE;
    }

    ctx.node_addr.write(&mut hdr[at..]);
    at += LINKADDR_SIZE;

    if frame_counter_len(kind) == 4 {
        hdr[at..at + 4].copy_from_slice(&counter_bytes);
        at += 4;
    } else {
        hdr[at] = lsbs;
        at += 1;
    }

    if let Some(otp) = otp {
        hdr[at..at + OTP_LEN].copy_from_slice(&otp);
        at += OTP_LEN;
    }

    if kind.has_strobe_index() {
        hdr[at] = 0;
        at += 1;
    }

    if kind.has_seqno() {
        hdr[at] = seqno;
        at += 1;
    }

    // bit 7 of the padding-length octet carries the frame-pending flag
    hdr[at] = padding_bytes as u8 | if pending { 0x80 } else { 0 };
    at += 1;
    debug_assert_eq!(at, basic_len);
    hdr[at..at + padding_bytes].fill(0);

    Ok(basic_len + padding_bytes)
}

fn generate_otp<A: Aes128>(
    pb: &Packetbuf,
    kind: FrameKind,
    totlen: u8,
    ctx: &mut FramerContext<'_, A>,
) -> Result<[u8; OTP_LEN], Error> {
    let nonce = ccm_inputs::generate_otp_nonce(pb, &ctx.node_addr, true);
    if !ctx.ccm.get_lock() {
        log::error!("framer: CCM* was locked");
        return Err(Error::CcmLocked);
    }
    let result = (|| {
        let (key, totlen) = if kind == FrameKind::Ack {
            let entry = ctx.nbrs.entry(&pb.receiver());
            let tentative = entry
                .tentative
                .and_then(|i| ctx.nbrs.tentative(i))
                .ok_or(Error::KeyNotFound)?;
            let key = *tentative
                .tentative_pairwise_key()
                .ok_or(Error::KeyNotFound)?;
            (key, ACK_LEN as u8)
        } else {
            (ctx.group_key, totlen)
        };
        ctx.ccm.set_key(&key).map_err(|_| Error::KeyNotFound)?;
        let mut otp = [0; OTP_LEN];
        ctx.ccm
            .aead(&nonce, &mut [], &[totlen], &mut otp, true)
            .map_err(|_| Error::Err)?;
        Ok(otp)
    })();
    ctx.ccm.release_lock();
    result
}

/// Carves the header off a fully received frame and recovers the sequence
/// number. The counter and addresses were already parsed by the filter.
pub fn parse(pb: &mut Packetbuf) -> Result<usize, Error> {
    let hdr = pb.hdrptr();
    let kind = FrameKind::from_byte(hdr[0]).ok_or(Error::BadLength)?;
    let basic_len = header_length_of(kind);
    if pb.totlen() < basic_len {
        return Err(Error::BadLength);
    }
    let seqno = hdr[basic_len - 2];
    let padding_octet = hdr[basic_len - 1];
    if kind.has_seqno() {
        pb.set_attr(Attr::MacSeqno, seqno as u16);
    }
    let padding_bytes = (padding_octet & 0x7F) as usize;
    pb.set_attr(Attr::Pending, (padding_octet >> 7) as u16);
    pb.hdr_reduce(basic_len + padding_bytes)?;
    Ok(basic_len + padding_bytes)
}

/// The strobe index as present in a created frame's header.
pub fn read_strobe_index(frame: &[u8]) -> Option<u8> {
    let kind = FrameKind::from_byte(*frame.first()?)?;
    if !kind.has_strobe_index() {
        return None;
    }
    frame.get(strobe_index_offset(kind)).copied()
}

/// On-the-fly filter over the first [`MIN_BYTES_FOR_FILTERING`] bytes.
///
/// `read` pulls further bytes out of the radio FIFO into the packetbuf.
/// On acceptance of a unicast payload frame, the acknowledgment is
/// synthesized here, in interrupt context, so it is ready the moment the
/// last payload byte arrives.
///
/// `last_delta` is the (shifted) gap between the local wake-up and this
/// frame's SFD, echoed inside the acknowledgment for the sender's phase
/// lock.
pub fn filter<A: Aes128>(
    pb: &mut Packetbuf,
    ctx: &mut FramerContext<'_, A>,
    read: &mut dyn FnMut(&mut Packetbuf, usize) -> Result<(), Error>,
    last_delta: u8,
) -> Result<Filtered, Error> {
    let totlen = pb.totlen();

    read(pb, 1)?;
    let kind = FrameKind::from_byte(pb.filled_bytes()[0]).ok_or(Error::BadLength)?;
    let mut at = 1;

    // frame length plausibility, before anything is read
    match kind {
        FrameKind::Hello => {
            if totlen != HELLO_LEN {
                return Err(Error::BadLength);
            }
            if ctx.hello_bucket.is_full(ctx.now_ms) {
                log::warn!("framer: HELLO bucket is full");
                return Err(Error::BucketFull);
            }
        }
        FrameKind::HelloAck => {
            if totlen != HELLOACK_LEN {
                return Err(Error::BadLength);
            }
            if ctx.helloack_bucket.is_full(ctx.now_ms) {
                log::warn!("framer: HELLOACK bucket is full");
                return Err(Error::BucketFull);
            }
        }
        FrameKind::Ack => {
            if totlen != ACK_LEN {
                return Err(Error::BadLength);
            }
        }
        FrameKind::Acknowledgment => return Err(Error::BadLength),
        _ => {
            if totlen < MIN_FRAME_LENGTH {
                return Err(Error::BadLength);
            }
        }
    }

    pb.set_receiver(if kind.is_broadcast() {
        LinkAddr::NULL
    } else {
        ctx.node_addr
    });
    pb.set_frame_type(match kind {
        FrameKind::BroadcastData | FrameKind::UnicastData => FrameType::Data,
        _ => FrameType::Command,
    });

    if kind.has_destination_pan_id() {
        read(pb, 2)?;
        let pan = u16::from_le_bytes(pb.filled_bytes()[at..at + 2].try_into().unwrap());
        if pan != ctx.pan_id.0 && pan != PanId::BROADCAST.0 {
            log::info!("framer: frame for another PAN {:04x}", pan);
            return Err(Error::WrongPan);
        }
        at += 2;
    }

    if kind.has_destination_address() {
        read(pb, LINKADDR_SIZE)?;
        let addr = LinkAddr::parse(&pb.filled_bytes()[at..]).ok_or(Error::BadLength)?;
        if addr != ctx.node_addr {
            return Err(Error::WrongAddress);
        }
        at += LINKADDR_SIZE;
    }

    read(pb, LINKADDR_SIZE)?;
    let sender = LinkAddr::parse(&pb.filled_bytes()[at..]).ok_or(Error::BadLength)?;
    if sender == ctx.node_addr {
        return Err(Error::WrongAddress);
    }
    pb.set_sender(sender);
    at += LINKADDR_SIZE;

    let entry = ctx.nbrs.entry(&sender);
    let nbr = match kind {
        FrameKind::Hello => {
            if !akes::is_acceptable_hello(ctx.nbrs) {
                return Err(Error::BucketFull);
            }
            ctx.hello_bucket.pour(ctx.now_ms);
            entry.permanent
        }
        FrameKind::HelloAck => {
            if !akes::is_acceptable_helloack(ctx.nbrs, &entry) {
                return Err(Error::Inauthentic);
            }
            ctx.helloack_bucket.pour(ctx.now_ms);
            None
        }
        FrameKind::Ack => {
            if !akes::is_acceptable_ack(ctx.nbrs, &entry) {
                return Err(Error::Inauthentic);
            }
            entry.tentative
        }
        _ => match entry.permanent {
            Some(index) => Some(index),
            None => {
                log::error!("framer: sender is not permanent");
                return Err(Error::KeyNotFound);
            }
        },
    };

    // frame counter
    if frame_counter_len(kind) == 4 {
        read(pb, 4)?;
        let counter_bytes: [u8; 4] = pb.filled_bytes()[at..at + 4].try_into().unwrap();
        anti_replay::parse_counter(pb, &counter_bytes);
        at += 4;
    } else {
        read(pb, 1)?;
        let lsbs = pb.filled_bytes()[at];
        if let Some(info) = permanent_or_tentative_info(ctx.nbrs, kind, nbr) {
            anti_replay::restore_counter(pb, &info, lsbs);
        }
        at += 1;
    }

    if kind.has_otp() {
        let nonce = ccm_inputs::generate_otp_nonce(pb, &ctx.node_addr, false);
        let key = match kind {
            FrameKind::Ack => {
                let tentative = nbr
                    .and_then(|i| ctx.nbrs.tentative(i))
                    .ok_or(Error::KeyNotFound)?;
                *tentative
                    .tentative_pairwise_key()
                    .ok_or(Error::KeyNotFound)?
            }
            _ => {
                let permanent = nbr
                    .and_then(|i| ctx.nbrs.permanent(i))
                    .ok_or(Error::KeyNotFound)?;
                permanent.group_key
            }
        };
        let mut expected = [0; OTP_LEN];
        ctx.ccm.set_key(&key).map_err(|_| Error::KeyNotFound)?;
        ctx.ccm
            .aead(&nonce, &mut [], &[totlen as u8], &mut expected, true)
            .map_err(|_| Error::Err)?;

        read(pb, OTP_LEN)?;
        if pb.filled_bytes()[at..at + OTP_LEN] != expected {
            log::error!("framer: invalid OTP");
            return Err(Error::Inauthentic);
        }
        at += OTP_LEN;

        if let Some(index) = nbr {
            if kind != FrameKind::Ack {
                let permanent = ctx.nbrs.permanent_mut(index).ok_or(Error::KeyNotFound)?;
                if anti_replay::was_replayed(pb, &mut permanent.anti_replay) {
                    log::error!("framer: replayed OTP");
                    return Err(Error::Replayed);
                }
            }
        }
    }

    // acknowledgment synthesis for unicast frames
    let mut strobe_index = 0;
    let acknowledgment = if !pb.holds_broadcast() {
        if kind.has_strobe_index() {
            read(pb, 1)?;
            strobe_index = pb.filled_bytes()[at];
        }

        let mut ack = Acknowledgment::default();
        ack.buf[0] = FrameKind::Acknowledgment.to_byte();
        ack.len = 1;
        if kind != FrameKind::HelloAck {
            ack.buf[1] = last_delta;
            ack.len = 2;

            let mut nonce = ccm_inputs::generate_nonce(pb, &ctx.node_addr, strobe_index, false);
            ccm_inputs::to_acknowledgment_nonce(&mut nonce);
            let (header, mic) = ack.buf.split_at_mut(2);
            ctx.ccm
                .aead(
                    &nonce,
                    &mut [],
                    header,
                    &mut mic[..UNICAST_MIC_LEN],
                    true,
                )
                .map_err(|_| Error::Err)?;
            ack.len += UNICAST_MIC_LEN;
        }
        let fcs = FCS.checksum(&ack.buf[..ack.len]).to_le_bytes();
        ack.buf[ack.len..ack.len + FCS_LEN].copy_from_slice(&fcs);
        ack.len += FCS_LEN;
        Some(ack)
    } else {
        None
    };

    Ok(Filtered {
        kind,
        acknowledgment,
        strobe_index,
    })
}

fn permanent_or_tentative_info(
    nbrs: &NbrTable,
    kind: FrameKind,
    nbr: Option<usize>,
) -> Option<crate::anti_replay::AntiReplayInfo> {
    let index = nbr?;
    if kind == FrameKind::Ack {
        Some(nbrs.tentative(index)?.anti_replay)
    } else {
        Some(nbrs.permanent(index)?.anti_replay)
    }
}

/// Checks a received acknowledgment against the nonce and key prepared at
/// strobe time. Returns the peer's delta field.
pub fn parse_acknowledgment<A: Aes128>(
    ack: &[u8],
    expected_len: usize,
    nonce: &[u8; CCM_STAR_NONCE_LENGTH],
    key: &[u8; AES_128_KEY_LENGTH],
    ccm: &mut CcmStar<A>,
) -> Result<u8, Error> {
    if ack.len() != expected_len || ack.is_empty() {
        return Err(Error::BadLength);
    }
    if FrameKind::from_byte(ack[0]) != Some(FrameKind::Acknowledgment) {
        return Err(Error::BadLength);
    }
    if ack.len() == HELLOACK_ACKNOWLEDGMENT_LEN {
        // acknowledgment of a HELLOACK carries no MIC yet
        return Ok(0);
    }
    if ack.len() < 2 + UNICAST_MIC_LEN {
        return Err(Error::BadLength);
    }

    let mut ack_nonce = *nonce;
    ccm_inputs::to_acknowledgment_nonce(&mut ack_nonce);
    ccm.set_key(key).map_err(|_| Error::KeyNotFound)?;
    let mut expected = [0; UNICAST_MIC_LEN];
    ccm.aead(&ack_nonce, &mut [], &ack[..2], &mut expected, true)
        .map_err(|_| Error::Err)?;
    if ack[2..2 + UNICAST_MIC_LEN] != expected {
        return Err(Error::Inauthentic);
    }
    Ok(ack[1])
}

// --- wake-up frames ------------------------------------------------------

/// Wake-up frame: address pseudonym, rendezvous countdown, FCS.
pub const WAKE_UP_FRAME_LEN: usize = 2 + 2 + FCS_LEN;

pub const BROADCAST_PSEUDONYM: [u8; 2] = [0xFF, 0xFF];

/// The two-byte pseudonym a receiver matches without loading the rest.
pub fn pseudonym_of(receiver: &LinkAddr) -> [u8; 2] {
    if receiver.is_null() {
        BROADCAST_PSEUDONYM
    } else {
        [receiver.0[LINKADDR_SIZE - 2], receiver.0[LINKADDR_SIZE - 1]]
    }
}

pub fn create_wake_up_frame(dst: &mut [u8], receiver: &LinkAddr) {
    dst[..2].copy_from_slice(&pseudonym_of(receiver));
    dst[2..4].fill(0);
    let fcs = FCS.checksum(&dst[..4]).to_le_bytes();
    dst[4..6].copy_from_slice(&fcs);
}

/// Rewrites the rendezvous countdown (and the FCS) of an already
/// serialized wake-up frame.
pub fn update_rendezvous_time(frame: &mut [u8], remaining_wake_up_frames: u16) {
    frame[2..4].copy_from_slice(&remaining_wake_up_frames.to_le_bytes());
    let fcs = FCS.checksum(&frame[..4]).to_le_bytes();
    frame[4..6].copy_from_slice(&fcs);
}

/// Validates a received wake-up frame and returns its rendezvous
/// countdown (the number of wake-up frames still to come).
pub fn parse_wake_up_frame(frame: &[u8], node_addr: &LinkAddr) -> Result<u16, Error> {
    if frame.len() != WAKE_UP_FRAME_LEN {
        return Err(Error::BadLength);
    }
    let fcs = u16::from_le_bytes(frame[4..6].try_into().unwrap());
    if fcs != FCS.checksum(&frame[..4]) {
        return Err(Error::Inauthentic);
    }
    let pseudonym: [u8; 2] = frame[..2].try_into().unwrap();
    if pseudonym != BROADCAST_PSEUDONYM && pseudonym != pseudonym_of(node_addr) {
        return Err(Error::WrongAddress);
    }
    Ok(u16::from_le_bytes(frame[2..4].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_type_octets() {
        assert_eq!(FrameKind::UnicastData.to_byte(), 0x07);
        assert_eq!(FrameKind::UnicastCommand.to_byte(), 0x47);
        assert_eq!(FrameKind::HelloAck.to_byte(), 0x87);
        assert_eq!(FrameKind::Ack.to_byte(), 0xC7);
        assert_eq!(FrameKind::BroadcastData.to_byte(), 0x0F);
        assert_eq!(FrameKind::BroadcastCommand.to_byte(), 0x4F);
        assert_eq!(FrameKind::Hello.to_byte(), 0x8F);
        assert_eq!(FrameKind::Acknowledgment.to_byte(), 0xCF);

        for byte in [0x07, 0x47, 0x87, 0xC7, 0x0F, 0x4F, 0x8F, 0xCF] {
            assert_eq!(FrameKind::from_byte(byte).unwrap().to_byte(), byte);
        }
        // not an extended frame
        assert_eq!(FrameKind::from_byte(0x01), None);
    }

    #[test]
    fn wake_up_frame_round_trip() {
        let node = LinkAddr([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut frame = [0u8; WAKE_UP_FRAME_LEN];
        create_wake_up_frame(&mut frame, &node);
        update_rendezvous_time(&mut frame, 1234);
        assert_eq!(parse_wake_up_frame(&frame, &node).unwrap(), 1234);

        // broadcast pseudonym matches anyone
        let mut frame = [0u8; WAKE_UP_FRAME_LEN];
        create_wake_up_frame(&mut frame, &LinkAddr::NULL);
        assert_eq!(parse_wake_up_frame(&frame, &node).unwrap(), 0);
    }

    #[test]
    fn wake_up_frame_rejects_corruption_and_strangers() {
        let node = LinkAddr([1, 2, 3, 4, 5, 6, 7, 8]);
        let other = LinkAddr([1, 2, 3, 4, 5, 6, 9, 9]);
        let mut frame = [0u8; WAKE_UP_FRAME_LEN];
        create_wake_up_frame(&mut frame, &node);

        assert_eq!(
            parse_wake_up_frame(&frame, &other),
            Err(Error::WrongAddress)
        );

        frame[2] ^= 0xFF;
        assert_eq!(parse_wake_up_frame(&frame, &node), Err(Error::Inauthentic));
    }

    #[test]
    fn header_lengths() {
        // type + pan + src + counter + padding-length
        assert_eq!(header_length_of(FrameKind::Hello), 1 + 2 + 8 + 4 + 1);
        // ... + dst + strobe index
        assert_eq!(
            header_length_of(FrameKind::HelloAck),
            1 + 2 + 8 + 8 + 4 + 1 + 1
        );
        // type + src + counter + otp + strobe + padding-length
        assert_eq!(
            header_length_of(FrameKind::Ack),
            1 + 8 + 4 + OTP_LEN + 1 + 1
        );
        assert_eq!(
            header_length_of(FrameKind::UnicastData),
            1 + 8 + 4 + OTP_LEN + 1 + 1 + 1
        );
    }
}
