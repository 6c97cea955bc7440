//! MD5, HMAC-MD5, RC4 and random bytes, as used by RADIUS and EAPOL-Key.

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rc4::consts::*;
use rc4::{KeyInit, Rc4, StreamCipher};
use thiserror::Error;

type HmacMd5 = Hmac<Md5>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Random number generation failed: {0}")]
    Random(#[from] getrandom::Error),
    #[error("Unsupported RC4 key length {0}")]
    Rc4KeyLength(usize),
}

// The cipher is generic over its key size, so the runtime length picks the
// instantiation.
macro_rules! rc4_with_key_size {
    ($buf:expr, $key:expr, [$($len:literal => $size:ty),+ $(,)?]) => {
        match $key.len() {
            $($len => {
                let mut cipher = Rc4::<$size>::new_from_slice($key)
                    .map_err(|_| CryptoError::Rc4KeyLength($len))?;
                cipher.apply_keystream($buf);
                Ok(())
            })+
            len => Err(CryptoError::Rc4KeyLength(len)),
        }
    };
}

/// MD5 over the concatenation of `parts`.
pub fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// RC4 keystream applied in place. Encryption and decryption are the same
/// operation. Keys of 1 to 64 bytes are supported; the EAPOL-Key RC4 key is
/// the 16-byte IV followed by the MPPE key.
pub fn rc4(buf: &mut [u8], key: &[u8]) -> Result<(), CryptoError> {
    rc4_with_key_size!(buf, key, [1 => U1, 2 => U2, 3 => U3, 4 => U4, 5 => U5, 6 => U6, 7 => U7, 8 => U8, 9 => U9, 10 => U10, 11 => U11, 12 => U12, 13 => U13, 14 => U14, 15 => U15, 16 => U16, 17 => U17, 18 => U18, 19 => U19, 20 => U20, 21 => U21, 22 => U22, 23 => U23, 24 => U24, 25 => U25, 26 => U26, 27 => U27, 28 => U28, 29 => U29, 30 => U30, 31 => U31, 32 => U32, 33 => U33, 34 => U34, 35 => U35, 36 => U36, 37 => U37, 38 => U38, 39 => U39, 40 => U40, 41 => U41, 42 => U42, 43 => U43, 44 => U44, 45 => U45, 46 => U46, 47 => U47, 48 => U48, 49 => U49, 50 => U50, 51 => U51, 52 => U52, 53 => U53, 54 => U54, 55 => U55, 56 => U56, 57 => U57, 58 => U58, 59 => U59, 60 => U60, 61 => U61, 62 => U62, 63 => U63, 64 => U64])
}

/// Fills `buf` from the operating system CSPRNG.
pub fn random_bytes(buf: &mut [u8]) -> Result<(), getrandom::Error> {
    getrandom::getrandom(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_parts() {
        // RFC 1321 test suite
        assert_eq!(
            md5(&[b"message ", b"digest"]),
            [
                0xf9, 0x6b, 0x69, 0x7d, 0x7c, 0xb7, 0x93, 0x8d, 0x52, 0x5a, 0x2f, 0x31, 0xaa, 0xf1,
                0x61, 0xd0
            ]
        );
    }

    #[test]
    fn test_hmac_md5_rfc2104() {
        let key = [0x0b; 16];
        assert_eq!(
            hmac_md5(&key, b"Hi There"),
            [
                0x92, 0x94, 0x72, 0x7a, 0x36, 0x38, 0xbb, 0x1c, 0x13, 0xf4, 0x8e, 0xf8, 0x15, 0x8b,
                0xfc, 0x9d
            ]
        );
    }

    #[test]
    fn test_rc4_known_vector() {
        let mut buf = *b"Plaintext";
        rc4(&mut buf, b"Key").unwrap();
        assert_eq!(buf, [0xbb, 0xf3, 0x16, 0xe8, 0xd9, 0x40, 0xaf, 0x0a, 0xd3]);
        rc4(&mut buf, b"Key").unwrap();
        assert_eq!(&buf, b"Plaintext");
    }

    #[test]
    fn test_rc4_eapol_key_length() {
        // 16-byte IV followed by a 32-byte MPPE key.
        let key = [0x5a; 48];
        let mut buf = [0u8; 13];
        rc4(&mut buf, &key).unwrap();
        assert_ne!(buf, [0u8; 13]);
        rc4(&mut buf, &key).unwrap();
        assert_eq!(buf, [0u8; 13]);
    }

    #[test]
    fn test_rc4_rejects_unsupported_key_length() {
        let mut buf = *b"unchanged";
        assert!(matches!(rc4(&mut buf, &[]), Err(CryptoError::Rc4KeyLength(0))));
        assert!(matches!(rc4(&mut buf, &[1; 65]), Err(CryptoError::Rc4KeyLength(65))));
        assert_eq!(&buf, b"unchanged");
    }
}
