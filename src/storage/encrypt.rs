//! # Transparent File Encryption
//!
//! When a store is opened with an encryption key, every byte written to the
//! file is enciphered and every byte read is deciphered, transparently to the
//! layers above. The scheme is a per-position stream cipher:
//!
//! - the 256-bit cipher key is the SHA-256 hash of the password bytes;
//! - the keystream position is the absolute file offset, so any aligned or
//!   unaligned range can be processed independently (the per-block IV is the
//!   block index folded into the keystream counter);
//! - the transformation is length-preserving, so the block and chunk layout
//!   of an encrypted store is identical to a plain one.
//!
//! Opening with the wrong password yields garbage headers, which the
//! recovery path rejects as corruption before any page is interpreted.
//!
//! The password buffer is zeroed as soon as the key has been derived; only
//! the derived key stays in memory for the lifetime of the store.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use sha2::{Digest, Sha256};

/// A position-addressed cipher over the whole file.
pub struct FileCipher {
    key: [u8; 32],
    nonce: [u8; 12],
}

impl FileCipher {
    /// Derives the cipher from a password, zeroing the password buffer.
    pub fn from_password(password: &mut [u8]) -> Self {
        let key: [u8; 32] = Sha256::digest(&*password).into();
        for b in password.iter_mut() {
            // volatile so the wipe is not optimized away
            unsafe { std::ptr::write_volatile(b, 0) };
        }
        let mut nonce_input = key;
        nonce_input[0] ^= 0x5C;
        let nonce_hash: [u8; 32] = Sha256::digest(nonce_input).into();
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&nonce_hash[..12]);
        Self { key, nonce }
    }

    /// Applies the keystream for file offset `pos` to `data`, in place.
    /// Encryption and decryption are the same transformation.
    pub fn apply(&self, pos: u64, data: &mut [u8]) {
        let mut cipher = ChaCha20::new(&self.key.into(), &self.nonce.into());
        cipher.seek(pos);
        cipher.apply_keystream(data);
    }
}

impl std::fmt::Debug for FileCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.write_str("FileCipher")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_its_own_inverse() {
        let cipher = FileCipher::from_password(&mut b"007".to_vec());
        let mut data = b"store header bytes".to_vec();
        let original = data.clone();

        cipher.apply(4096, &mut data);
        assert_ne!(data, original);
        cipher.apply(4096, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn ranges_compose_independently() {
        let cipher = FileCipher::from_password(&mut b"key".to_vec());
        let mut whole = vec![7u8; 64];
        cipher.apply(1000, &mut whole);

        let mut front = vec![7u8; 40];
        let mut back = vec![7u8; 24];
        cipher.apply(1000, &mut front);
        cipher.apply(1040, &mut back);

        assert_eq!(&whole[..40], front.as_slice());
        assert_eq!(&whole[40..], back.as_slice());
    }

    #[test]
    fn different_passwords_differ() {
        let a = FileCipher::from_password(&mut b"007".to_vec());
        let b = FileCipher::from_password(&mut b"008".to_vec());
        let mut x = vec![0u8; 16];
        let mut y = vec![0u8; 16];
        a.apply(0, &mut x);
        b.apply(0, &mut y);
        assert_ne!(x, y);
    }

    #[test]
    fn password_buffer_is_zeroed() {
        let mut password = b"secret".to_vec();
        let _cipher = FileCipher::from_password(&mut password);
        assert!(password.iter().all(|&b| b == 0));
    }
}
