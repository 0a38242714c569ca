//! CCM* nonce derivation.
//!
//! All nonces are 13 bytes: 8 bytes of link address, the 4-byte frame
//! counter, and a marker byte that separates the three uses of the same
//! counter value:
//!
//! ```norust
//! payload frame, unicast    addr | counter | strobe index
//! payload frame, broadcast  addr | counter | 0xFE
//! one-time pseudonym        addr | counter | 0xFF
//! acknowledgment            addr | counter | 0xFE
//! ```
//!
//! The address is the receiver's on the forward path and the local node's
//! on the reverse path, so both ends derive identical bytes. Binding the
//! strobe index into unicast nonces makes every retransmission of the same
//! frame cryptographically distinct, which in turn binds each acknowledgment
//! to one specific strobe.

use crate::anti_replay;
use crate::crypto::CCM_STAR_NONCE_LENGTH;
use crate::packetbuf::Packetbuf;
use crate::{LinkAddr, LINKADDR_SIZE};

pub const BROADCAST_MARKER: u8 = 0xFE;
pub const OTP_MARKER: u8 = 0xFF;
pub const ACKNOWLEDGMENT_MARKER: u8 = 0xFE;

/// Nonce of the packetbuf's frame. `forward` selects the sender (true) or
/// receiver (false) perspective; `strobe_index` is the current value of the
/// frame's strobe index field.
pub fn generate_nonce(
    pb: &Packetbuf,
    node_addr: &LinkAddr,
    strobe_index: u8,
    forward: bool,
) -> [u8; CCM_STAR_NONCE_LENGTH] {
    let mut nonce = [0; CCM_STAR_NONCE_LENGTH];
    let is_broadcast = pb.holds_broadcast();
    let addr = if is_broadcast {
        LinkAddr::NULL
    } else if forward {
        pb.receiver()
    } else {
        *node_addr
    };
    nonce[..LINKADDR_SIZE].copy_from_slice(&addr.0);
    anti_replay::write_counter(pb, &mut nonce[LINKADDR_SIZE..LINKADDR_SIZE + 4]);
    nonce[12] = if is_broadcast {
        BROADCAST_MARKER
    } else {
        strobe_index
    };
    nonce
}

/// Nonce for the one-time pseudonym of the same frame.
pub fn generate_otp_nonce(
    pb: &Packetbuf,
    node_addr: &LinkAddr,
    forward: bool,
) -> [u8; CCM_STAR_NONCE_LENGTH] {
    let mut nonce = generate_nonce(pb, node_addr, 0, forward);
    nonce[12] = OTP_MARKER;
    nonce
}

/// Derives the acknowledgment nonce from a payload frame's nonce.
pub fn to_acknowledgment_nonce(nonce: &mut [u8; CCM_STAR_NONCE_LENGTH]) {
    nonce[12] = ACKNOWLEDGMENT_MARKER;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pb_to(receiver: LinkAddr, counter: u32) -> Packetbuf {
        let mut pb = Packetbuf::new();
        pb.set_receiver(receiver);
        pb.set_frame_counter(counter);
        pb
    }

    #[test]
    fn both_ends_derive_the_same_unicast_nonce() {
        let receiver = LinkAddr([0, 0, 0, 0, 0, 0, 0, 1]);
        let sender_view = pb_to(receiver, 1);
        let mut receiver_view = pb_to(LinkAddr([9; 8]), 1);
        receiver_view.set_receiver(receiver); // as reconstructed by the filter
        let tx = generate_nonce(&sender_view, &LinkAddr([2; 8]), 3, true);
        let rx = generate_nonce(&receiver_view, &receiver, 3, false);
        assert_eq!(tx, rx);
        assert_eq!(tx[12], 3);
    }

    #[test]
    fn unicast_nonce_image() {
        // receiver 0x0001, counter 1, strobe index 1
        let receiver = LinkAddr([0, 0x01, 0, 0, 0, 0, 0, 0]);
        let pb = pb_to(receiver, 1);
        let nonce = generate_nonce(&pb, &LinkAddr::NULL, 0x01, true);
        assert_eq!(
            nonce,
            [0x00, 0x01, 0, 0, 0, 0, 0, 0, 0x01, 0, 0, 0, 0x01]
        );
    }

    #[test]
    fn markers_separate_uses() {
        let pb = pb_to(LinkAddr([1; 8]), 77);
        let payload = generate_nonce(&pb, &LinkAddr::NULL, 0, true);
        let otp = generate_otp_nonce(&pb, &LinkAddr::NULL, true);
        let mut ack = payload;
        to_acknowledgment_nonce(&mut ack);
        assert_eq!(payload[..12], otp[..12]);
        assert_eq!(otp[12], OTP_MARKER);
        assert_eq!(ack[12], ACKNOWLEDGMENT_MARKER);

        let broadcast = generate_nonce(&Packetbuf::new(), &LinkAddr::NULL, 0, true);
        assert_eq!(broadcast[12], BROADCAST_MARKER);
        assert_eq!(&broadcast[..8], &[0; 8]);
    }
}
