//! The block-cipher driver boundary and CCM* on top of it.
//!
//! Everything here observes the locking discipline: interrupt-context code
//! may only touch the engine after `get_lock` succeeded, and CCM* holds the
//! lock across whole operations.

pub mod aes;
pub mod ccm_star;

pub use self::aes::{Aes128, KeyedAes, SoftAes128, AES_128_BLOCK_SIZE, AES_128_KEY_LENGTH};
pub use self::ccm_star::{CcmStar, CCM_STAR_NONCE_LENGTH};

/// Faults of an AES/CCM* driver. Software drivers only ever report
/// `KeyNotSet`; hardware-backed implementations surface engine faults as
/// `Fault`, which callers treat like an inauthentic frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    Locked,
    KeyNotSet,
    MicTooLong,
    Fault,
}
