//! AES-128 driver abstraction.
//!
//! Mirrors the four-operation contract of hardware AES engines: load a key,
//! encrypt one block in place, and a lock that interrupt-context users must
//! take before touching the engine. [`SoftAes128`] is the bundled software
//! implementation; [`KeyedAes`] adds a keystore so session keys are not
//! re-expanded on every operation, the way register-mapped engines keep up
//! to 16 keys in key-store areas.

use aes::cipher::{BlockEncrypt, KeyInit};
use generic_array::GenericArray;

use super::CryptoError;

pub const AES_128_KEY_LENGTH: usize = 16;
pub const AES_128_BLOCK_SIZE: usize = 16;

pub trait Aes128 {
    fn set_key(&mut self, key: &[u8; AES_128_KEY_LENGTH]) -> Result<(), CryptoError>;

    /// AES-ECB on one block, in place.
    fn encrypt(&mut self, block: &mut [u8; AES_128_BLOCK_SIZE]) -> Result<(), CryptoError>;

    /// Tries to take the engine lock. Interrupt-context users must back off
    /// when this fails.
    fn get_lock(&mut self) -> bool;

    fn release_lock(&mut self);
}

/// Software AES-128.
pub struct SoftAes128 {
    cipher: Option<aes::Aes128>,
    locked: bool,
}

impl SoftAes128 {
    pub const fn new() -> Self {
        Self {
            cipher: None,
            locked: false,
        }
    }
}

impl Default for SoftAes128 {
    fn default() -> Self {
        Self::new()
    }
}

impl Aes128 for SoftAes128 {
    fn set_key(&mut self, key: &[u8; AES_128_KEY_LENGTH]) -> Result<(), CryptoError> {
        self.cipher = Some(aes::Aes128::new(GenericArray::from_slice(key)));
        Ok(())
    }

    fn encrypt(&mut self, block: &mut [u8; AES_128_BLOCK_SIZE]) -> Result<(), CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::KeyNotSet)?;
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        Ok(())
    }

    fn get_lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    fn release_lock(&mut self) {
        self.locked = false;
    }
}

/// Number of key areas.
pub const KEYSTORE_SIZE: usize = 16;

/// AES driver with a keystore: `set_key` becomes a cache lookup over
/// already-expanded key schedules, evicting round robin.
pub struct KeyedAes {
    slots: [Option<([u8; AES_128_KEY_LENGTH], aes::Aes128)>; KEYSTORE_SIZE],
    active: Option<usize>,
    next_evict: usize,
    locked: bool,
}

impl KeyedAes {
    pub const fn new() -> Self {
        const EMPTY: Option<([u8; AES_128_KEY_LENGTH], aes::Aes128)> = None;
        Self {
            slots: [EMPTY; KEYSTORE_SIZE],
            active: None,
            next_evict: 0,
            locked: false,
        }
    }
}

impl Default for KeyedAes {
    fn default() -> Self {
        Self::new()
    }
}

impl Aes128 for KeyedAes {
    fn set_key(&mut self, key: &[u8; AES_128_KEY_LENGTH]) -> Result<(), CryptoError> {
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some((stored, _)) = slot {
                if stored == key {
                    self.active = Some(i);
                    return Ok(());
                }
            }
        }
        let area = self.next_evict;
        self.slots[area] = Some((*key, aes::Aes128::new(GenericArray::from_slice(key))));
        self.next_evict = (area + 1) % KEYSTORE_SIZE;
        self.active = Some(area);
        Ok(())
    }

    fn encrypt(&mut self, block: &mut [u8; AES_128_BLOCK_SIZE]) -> Result<(), CryptoError> {
        let area = self.active.ok_or(CryptoError::KeyNotSet)?;
        let (_, cipher) = self.slots[area].as_ref().ok_or(CryptoError::KeyNotSet)?;
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
        Ok(())
    }

    fn get_lock(&mut self) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        true
    }

    fn release_lock(&mut self) {
        self.locked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// FIPS-197 appendix C.1 test vector.
    #[test]
    fn fips_197_vector() {
        let key: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F,
        ];
        let mut block: [u8; 16] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let mut aes = SoftAes128::new();
        aes.set_key(&key).unwrap();
        aes.encrypt(&mut block).unwrap();
        assert_eq!(
            block,
            [
                0x69, 0xC4, 0xE0, 0xD8, 0x6A, 0x7B, 0x04, 0x30, 0xD8, 0xCD, 0xB7, 0x80, 0x70,
                0xB4, 0xC5, 0x5A
            ]
        );
    }

    #[test]
    fn encrypt_without_key_fails() {
        let mut aes = SoftAes128::new();
        let mut block = [0; 16];
        assert_eq!(aes.encrypt(&mut block), Err(CryptoError::KeyNotSet));
    }

    #[test]
    fn lock_is_exclusive() {
        let mut aes = SoftAes128::new();
        assert!(aes.get_lock());
        assert!(!aes.get_lock());
        aes.release_lock();
        assert!(aes.get_lock());
    }

    #[test]
    fn keystore_reuses_expanded_keys() {
        let mut aes = KeyedAes::new();
        let k1 = [1; 16];
        let k2 = [2; 16];
        aes.set_key(&k1).unwrap();
        aes.set_key(&k2).unwrap();
        aes.set_key(&k1).unwrap();
        assert_eq!(aes.active, Some(0));
        assert_eq!(aes.next_evict, 2);

        // same ciphertext as a plain driver
        let mut a = [7u8; 16];
        let mut b = [7u8; 16];
        aes.encrypt(&mut a).unwrap();
        let mut soft = SoftAes128::new();
        soft.set_key(&k1).unwrap();
        soft.encrypt(&mut b).unwrap();
        assert_eq!(a, b);
    }
}
