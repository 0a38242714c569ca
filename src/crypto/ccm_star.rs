//! AES-128-based CCM* (RFC 3610 with the 802.15.4 amendments).
//!
//! `L = 2` (two-byte message length field), 13-byte nonces, MIC lengths up
//! to one block. The same routine runs in both directions: on the forward
//! path it authenticates `a || m` and then encrypts `m` in place; on the
//! reverse path it decrypts first and then authenticates, yielding the MIC
//! the caller compares.

use super::aes::{Aes128, AES_128_BLOCK_SIZE, AES_128_KEY_LENGTH};
use super::CryptoError;

pub const CCM_STAR_NONCE_LENGTH: usize = 13;

/// Flags octet of the authentication IV.
fn auth_flags(a_len: usize, mic_len: usize) -> u8 {
    (if a_len > 0 { 1 << 6 } else { 0 })
        | ((mic_len.saturating_sub(2) as u8 >> 1) << 3)
        | 1
}

const ENCRYPTION_FLAGS: u8 = 1;

fn set_iv(
    iv: &mut [u8; AES_128_BLOCK_SIZE],
    flags: u8,
    nonce: &[u8; CCM_STAR_NONCE_LENGTH],
    counter: u16,
) {
    iv[0] = flags;
    iv[1..1 + CCM_STAR_NONCE_LENGTH].copy_from_slice(nonce);
    iv[14] = (counter >> 8) as u8;
    iv[15] = counter as u8;
}

/// CCM* driver over an AES-128 engine.
///
/// Holds the AES lock across whole operations; `can_use_asynchronously`
/// tells interrupt-context callers whether an operation is in flight.
pub struct CcmStar<A: Aes128> {
    aes: A,
}

impl<A: Aes128> CcmStar<A> {
    pub fn new(aes: A) -> Self {
        Self { aes }
    }

    pub fn set_key(&mut self, key: &[u8; AES_128_KEY_LENGTH]) -> Result<(), CryptoError> {
        self.aes.set_key(key)
    }

    /// Direct access to the underlying block cipher (key derivation runs
    /// plain AES-ECB through the same engine and lock).
    pub fn aes_mut(&mut self) -> &mut A {
        &mut self.aes
    }

    pub fn get_lock(&mut self) -> bool {
        self.aes.get_lock()
    }

    pub fn release_lock(&mut self) {
        self.aes.release_lock();
    }

    pub fn can_use_asynchronously(&mut self) -> bool {
        if !self.aes.get_lock() {
            return false;
        }
        self.aes.release_lock();
        true
    }

    /// XORs `m[pos..pos + 16]` with the keystream block `counter`.
    fn ctr_step(
        &mut self,
        nonce: &[u8; CCM_STAR_NONCE_LENGTH],
        pos: usize,
        m: &mut [u8],
        counter: u16,
    ) -> Result<(), CryptoError> {
        let mut a = [0; AES_128_BLOCK_SIZE];
        set_iv(&mut a, ENCRYPTION_FLAGS, nonce, counter);
        self.aes.encrypt(&mut a)?;
        for i in 0..AES_128_BLOCK_SIZE.min(m.len().saturating_sub(pos)) {
            m[pos + i] ^= a[i];
        }
        Ok(())
    }

    fn mic(
        &mut self,
        nonce: &[u8; CCM_STAR_NONCE_LENGTH],
        m: &[u8],
        a: &[u8],
        result: &mut [u8],
    ) -> Result<(), CryptoError> {
        let mut x = [0; AES_128_BLOCK_SIZE];
        set_iv(&mut x, auth_flags(a.len(), result.len()), nonce, m.len() as u16);
        self.aes.encrypt(&mut x)?;

        if !a.is_empty() {
            x[0] ^= (a.len() >> 8) as u8;
            x[1] ^= a.len() as u8;
            let first = a.len().min(AES_128_BLOCK_SIZE - 2);
            for (i, byte) in a[..first].iter().enumerate() {
                x[2 + i] ^= byte;
            }
            self.aes.encrypt(&mut x)?;

            let mut pos = first;
            while pos < a.len() {
                for i in 0..AES_128_BLOCK_SIZE.min(a.len() - pos) {
                    x[i] ^= a[pos + i];
                }
                self.aes.encrypt(&mut x)?;
                pos += AES_128_BLOCK_SIZE;
            }
        }

        let mut pos = 0;
        while pos < m.len() {
            for i in 0..AES_128_BLOCK_SIZE.min(m.len() - pos) {
                x[i] ^= m[pos + i];
            }
            self.aes.encrypt(&mut x)?;
            pos += AES_128_BLOCK_SIZE;
        }

        self.ctr_step(nonce, 0, &mut x, 0)?;
        result.copy_from_slice(&x[..result.len()]);
        Ok(())
    }

    fn ctr(&mut self, nonce: &[u8; CCM_STAR_NONCE_LENGTH], m: &mut [u8]) -> Result<(), CryptoError> {
        let mut counter = 1;
        let mut pos = 0;
        while pos < m.len() {
            self.ctr_step(nonce, pos, m, counter)?;
            counter += 1;
            pos += AES_128_BLOCK_SIZE;
        }
        Ok(())
    }

    /// The AEAD operation under the currently loaded key.
    ///
    /// Forward: authenticates `a || m`, encrypts `m` in place, writes the
    /// MIC into `mic` (its length selects the MIC size). Reverse: decrypts
    /// `m` in place first, then computes the expected MIC into `mic`; the
    /// caller compares it against the received one.
    pub fn aead(
        &mut self,
        nonce: &[u8; CCM_STAR_NONCE_LENGTH],
        m: &mut [u8],
        a: &[u8],
        mic: &mut [u8],
        forward: bool,
    ) -> Result<(), CryptoError> {
        if mic.len() > AES_128_BLOCK_SIZE {
            return Err(CryptoError::MicTooLong);
        }
        if !forward {
            self.ctr(nonce, m)?;
        }
        if !mic.is_empty() {
            self.mic(nonce, m, a, mic)?;
        }
        if forward {
            self.ctr(nonce, m)?;
        }
        Ok(())
    }
}
