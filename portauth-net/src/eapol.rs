// EAPOL Packet Definitions
// Based on IEEE 802.1X-2001 §7

use crate::crypto;

pub const EAPOL_VERSION: u8 = 1;
/// Version used by RSN pre-authentication frames.
pub const EAPOL_VERSION_2: u8 = 2;
pub const EAPOL_HDR_LEN: usize = 4;

// EAPOL Packet Type
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum EapolType {
    Eap = 0,
    Start = 1,
    Logoff = 2,
    Key = 3,
    EncapsulatedAsfAlert = 4,
}

impl EapolType {
    pub fn from_u8(t: u8) -> Option<Self> {
        match t {
            0 => Some(EapolType::Eap),
            1 => Some(EapolType::Start),
            2 => Some(EapolType::Logoff),
            3 => Some(EapolType::Key),
            4 => Some(EapolType::EncapsulatedAsfAlert),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EapolError {
    TooShort(usize),
    /// The body length field claims more data than was received.
    Truncated { declared: usize, available: usize },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EapolPacket<'a> {
    pub version: u8,
    /// Raw type octet; unknown values are reported by the receiver.
    pub packet_type: u8,
    pub length: u16,
    pub payload: &'a [u8],
    /// Bytes received after the declared body (link-layer padding).
    pub padding: usize,
}

impl<'a> EapolPacket<'a> {
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, EapolError> {
        if data.len() < EAPOL_HDR_LEN {
            return Err(EapolError::TooShort(data.len()));
        }
        let version = data[0];
        let packet_type = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]);
        let end = EAPOL_HDR_LEN + length as usize;
        if end > data.len() {
            return Err(EapolError::Truncated {
                declared: length as usize,
                available: data.len() - EAPOL_HDR_LEN,
            });
        }

        Ok(EapolPacket {
            version,
            packet_type,
            length,
            payload: &data[EAPOL_HDR_LEN..end],
            padding: data.len() - end,
        })
    }

    pub fn eapol_type(&self) -> Option<EapolType> {
        EapolType::from_u8(self.packet_type)
    }
}

/// Builds an EAPOL frame around `body`.
pub fn build_eapol(version: u8, packet_type: EapolType, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(EAPOL_HDR_LEN + body.len());
    frame.push(version);
    frame.push(packet_type as u8);
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

pub const EAPOL_KEY_TYPE_RC4: u8 = 1;
pub const EAPOL_KEY_HDR_LEN: usize = 44;
pub const EAPOL_KEY_INDEX_UNICAST: u8 = 0x80;
pub const EAPOL_KEY_INDEX_MASK: u8 = 0x7f;
const SIGNATURE_OFFSET: usize = 28;

/// RC4 EAPOL-Key descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapolKey {
    pub key_type: u8,
    pub key_length: u16,
    pub replay_counter: [u8; 8],
    pub key_iv: [u8; 16],
    pub key_index: u8,
    pub key_signature: [u8; 16],
    /// Key material, already encrypted when sent.
    pub key: Vec<u8>,
}

impl EapolKey {
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < EAPOL_KEY_HDR_LEN {
            return None;
        }
        let mut replay_counter = [0u8; 8];
        replay_counter.copy_from_slice(&data[3..11]);
        let mut key_iv = [0u8; 16];
        key_iv.copy_from_slice(&data[11..27]);
        let mut key_signature = [0u8; 16];
        key_signature.copy_from_slice(&data[28..44]);
        Some(EapolKey {
            key_type: data[0],
            key_length: u16::from_be_bytes([data[1], data[2]]),
            replay_counter,
            key_iv,
            key_index: data[27],
            key_signature,
            key: data[EAPOL_KEY_HDR_LEN..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(EAPOL_KEY_HDR_LEN + self.key.len());
        bytes.push(self.key_type);
        bytes.extend_from_slice(&self.key_length.to_be_bytes());
        bytes.extend_from_slice(&self.replay_counter);
        bytes.extend_from_slice(&self.key_iv);
        bytes.push(self.key_index);
        bytes.extend_from_slice(&self.key_signature);
        bytes.extend_from_slice(&self.key);
        bytes
    }

    pub fn is_unicast(&self) -> bool {
        self.key_index & EAPOL_KEY_INDEX_UNICAST != 0
    }

    /// Complete EAPOL-Key frame signed with HMAC-MD5 under `sign_key`. The
    /// signature covers the EAPOL header and the descriptor with its
    /// signature field zeroed.
    pub fn to_signed_frame(&self, version: u8, sign_key: &[u8]) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.key_signature = [0; 16];
        let mut frame = build_eapol(version, EapolType::Key, &unsigned.to_bytes());
        let signature = crypto::hmac_md5(sign_key, &frame);
        let at = EAPOL_HDR_LEN + SIGNATURE_OFFSET;
        frame[at..at + 16].copy_from_slice(&signature);
        frame
    }

    /// Checks the signature of a complete EAPOL-Key frame.
    pub fn verify_frame(frame: &[u8], sign_key: &[u8]) -> bool {
        let at = EAPOL_HDR_LEN + SIGNATURE_OFFSET;
        if frame.len() < EAPOL_HDR_LEN + EAPOL_KEY_HDR_LEN {
            return false;
        }
        let mut copy = frame.to_vec();
        copy[at..at + 16].fill(0);
        crypto::hmac_md5(sign_key, &copy)[..] == frame[at..at + 16]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_padding() {
        let mut frame = build_eapol(EAPOL_VERSION, EapolType::Eap, &[2, 1, 0, 4]);
        frame.extend_from_slice(&[0; 42]);
        let packet = EapolPacket::from_bytes(&frame).unwrap();
        assert_eq!(packet.version, 1);
        assert_eq!(packet.eapol_type(), Some(EapolType::Eap));
        assert_eq!(packet.payload, &[2, 1, 0, 4]);
        assert_eq!(packet.padding, 42);
    }

    #[test]
    fn test_truncated_and_unknown_type() {
        assert_eq!(EapolPacket::from_bytes(&[1, 0]), Err(EapolError::TooShort(2)));
        assert_eq!(
            EapolPacket::from_bytes(&[1, 0, 0, 10, 2, 1]),
            Err(EapolError::Truncated { declared: 10, available: 2 })
        );
        let packet = EapolPacket::from_bytes(&[2, 9, 0, 0]).unwrap();
        assert_eq!(packet.eapol_type(), None);
        assert_eq!(packet.packet_type, 9);
    }

    #[test]
    fn test_key_frame_layout_and_signature() {
        let key = EapolKey {
            key_type: EAPOL_KEY_TYPE_RC4,
            key_length: 13,
            replay_counter: [1, 2, 3, 4, 5, 6, 7, 8],
            key_iv: [0xaa; 16],
            key_index: EAPOL_KEY_INDEX_UNICAST | 3,
            key_signature: [0xff; 16],
            key: vec![0x55; 13],
        };
        let frame = key.to_signed_frame(EAPOL_VERSION, b"sign");
        assert_eq!(frame.len(), EAPOL_HDR_LEN + EAPOL_KEY_HDR_LEN + 13);
        assert_eq!(&frame[..4], &[1, 3, 0, 57]);

        let packet = EapolPacket::from_bytes(&frame).unwrap();
        let parsed = EapolKey::from_bytes(packet.payload).unwrap();
        assert!(parsed.is_unicast());
        assert_eq!(parsed.key_index & EAPOL_KEY_INDEX_MASK, 3);
        assert_eq!(parsed.replay_counter, key.replay_counter);
        assert_ne!(parsed.key_signature, [0xff; 16]);

        assert!(EapolKey::verify_frame(&frame, b"sign"));
        assert!(!EapolKey::verify_frame(&frame, b"other"));
        let mut tampered = frame.clone();
        tampered[50] ^= 1;
        assert!(!EapolKey::verify_frame(&tampered, b"sign"));
    }
}
