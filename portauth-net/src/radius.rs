//! RADIUS message codec (RFC 2865, RFC 2869 Message-Authenticator and
//! RFC 2548 MS-MPPE keys).
//!
//! A [`RadiusMsg`] owns one byte buffer holding the 20-byte header followed
//! by the attributes. Attributes are recorded as offsets into that buffer, so
//! growing the buffer never invalidates them.

use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::crypto;

pub const RADIUS_HDR_LEN: usize = 20;
pub const RADIUS_AUTH_LEN: usize = 16;
pub const RADIUS_DEFAULT_MSG_SIZE: usize = 1024;
pub const RADIUS_MAX_MSG_LEN: usize = 65535;
pub const RADIUS_ATTR_HDR_LEN: usize = 2;
pub const RADIUS_MAX_ATTR_LEN: usize = 255 - RADIUS_ATTR_HDR_LEN;

pub const RADIUS_VENDOR_ID_MICROSOFT: u32 = 311;
pub const RADIUS_VENDOR_ATTR_MS_MPPE_SEND_KEY: u8 = 16;
pub const RADIUS_VENDOR_ATTR_MS_MPPE_RECV_KEY: u8 = 17;

pub const RADIUS_TERMINATION_ACTION_DEFAULT: u32 = 0;
pub const RADIUS_TERMINATION_ACTION_RADIUS_REQUEST: u32 = 1;
pub const RADIUS_NAS_PORT_TYPE_IEEE_802_11: u32 = 19;

// RADIUS Packet Codes
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum RadiusCode {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccountingRequest = 4,
    AccountingResponse = 5,
    AccessChallenge = 11,
    StatusServer = 12,
    StatusClient = 13,
}

impl RadiusCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(RadiusCode::AccessRequest),
            2 => Some(RadiusCode::AccessAccept),
            3 => Some(RadiusCode::AccessReject),
            4 => Some(RadiusCode::AccountingRequest),
            5 => Some(RadiusCode::AccountingResponse),
            11 => Some(RadiusCode::AccessChallenge),
            12 => Some(RadiusCode::StatusServer),
            13 => Some(RadiusCode::StatusClient),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RadiusCode::AccessRequest => "Access-Request",
            RadiusCode::AccessAccept => "Access-Accept",
            RadiusCode::AccessReject => "Access-Reject",
            RadiusCode::AccountingRequest => "Accounting-Request",
            RadiusCode::AccountingResponse => "Accounting-Response",
            RadiusCode::AccessChallenge => "Access-Challenge",
            RadiusCode::StatusServer => "Status-Server",
            RadiusCode::StatusClient => "Status-Client",
        }
    }
}

// RADIUS Attributes
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
pub enum RadiusAttributeType {
    UserName = 1,
    UserPassword = 2,
    NasIpAddress = 4,
    NasPort = 5,
    FramedMtu = 12,
    ReplyMessage = 18,
    State = 24,
    Class = 25,
    VendorSpecific = 26,
    SessionTimeout = 27,
    IdleTimeout = 28,
    TerminationAction = 29,
    CalledStationId = 30,
    CallingStationId = 31,
    NasIdentifier = 32,
    NasPortType = 61,
    EapMessage = 79,
    MessageAuthenticator = 80,
}

impl RadiusAttributeType {
    pub fn from_u8(t: u8) -> Option<Self> {
        use RadiusAttributeType::*;
        Some(match t {
            1 => UserName,
            2 => UserPassword,
            4 => NasIpAddress,
            5 => NasPort,
            12 => FramedMtu,
            18 => ReplyMessage,
            24 => State,
            25 => Class,
            26 => VendorSpecific,
            27 => SessionTimeout,
            28 => IdleTimeout,
            29 => TerminationAction,
            30 => CalledStationId,
            31 => CallingStationId,
            32 => NasIdentifier,
            61 => NasPortType,
            79 => EapMessage,
            80 => MessageAuthenticator,
            _ => return None,
        })
    }
}

#[derive(Error, Debug)]
pub enum RadiusError {
    #[error("Attribute value too long ({0} bytes, at most 253)")]
    AttributeTooLong(usize),
    #[error("Message too short ({0} bytes)")]
    TooShort(usize),
    #[error("Invalid message length {declared} ({received} bytes received)")]
    InvalidLength { declared: usize, received: usize },
    #[error("Malformed attribute at offset {0}")]
    MalformedAttribute(usize),
    #[error("No Message-Authenticator attribute")]
    MissingMessageAuthenticator,
    #[error("{0} Message-Authenticator attributes, expected one")]
    DuplicateMessageAuthenticator(usize),
    #[error("Invalid Message-Authenticator")]
    InvalidMessageAuthenticator,
    #[error("Invalid Response Authenticator")]
    InvalidResponseAuthenticator,
    #[error("Random number generation failed: {0}")]
    Random(#[from] getrandom::Error),
    #[error("RADIUS socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RadiusError>;

/// Location of one attribute inside the message buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AttrSlot {
    /// Offset of the attribute header.
    offset: usize,
    /// Total length including the 2-byte header.
    len: usize,
}

/// MS-MPPE keys decrypted from an Access-Accept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsKeys {
    pub send: Option<Vec<u8>>,
    pub recv: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadiusMsg {
    buf: Vec<u8>,
    attrs: Vec<AttrSlot>,
}

impl RadiusMsg {
    pub fn new(code: RadiusCode, identifier: u8) -> Self {
        Self::with_capacity(code, identifier, RADIUS_DEFAULT_MSG_SIZE)
    }

    pub fn with_capacity(code: RadiusCode, identifier: u8, buf_size: usize) -> Self {
        let mut buf = Vec::with_capacity(buf_size.max(RADIUS_HDR_LEN));
        buf.push(code as u8);
        buf.push(identifier);
        buf.extend_from_slice(&[0; 2 + RADIUS_AUTH_LEN]);
        Self {
            buf,
            attrs: Vec::new(),
        }
    }

    pub fn code(&self) -> u8 {
        self.buf[0]
    }

    pub fn radius_code(&self) -> Option<RadiusCode> {
        RadiusCode::from_u8(self.code())
    }

    pub fn identifier(&self) -> u8 {
        self.buf[1]
    }

    /// Value of the header length field. Only meaningful after `finish`
    /// or `parse`.
    pub fn length(&self) -> u16 {
        u16::from_be_bytes([self.buf[2], self.buf[3]])
    }

    pub fn authenticator(&self) -> [u8; RADIUS_AUTH_LEN] {
        let mut auth = [0u8; RADIUS_AUTH_LEN];
        auth.copy_from_slice(&self.buf[4..RADIUS_HDR_LEN]);
        auth
    }

    pub fn set_authenticator(&mut self, auth: &[u8; RADIUS_AUTH_LEN]) {
        self.buf[4..RADIUS_HDR_LEN].copy_from_slice(auth);
    }

    /// Fills the Request Authenticator with random bytes.
    pub fn make_authenticator(&mut self) -> Result<()> {
        let mut auth = [0u8; RADIUS_AUTH_LEN];
        crypto::random_bytes(&mut auth)?;
        self.set_authenticator(&auth);
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn attr_count(&self) -> usize {
        self.attrs.len()
    }

    /// `(type, value)` of every attribute, in order.
    pub fn attrs(&self) -> impl Iterator<Item = (u8, &[u8])> {
        self.attrs.iter().map(|slot| {
            (
                self.buf[slot.offset],
                &self.buf[slot.offset + RADIUS_ATTR_HDR_LEN..slot.offset + slot.len],
            )
        })
    }

    fn reserve(&mut self, additional: usize) {
        let mut capacity = self.buf.capacity().max(RADIUS_HDR_LEN);
        while capacity < self.buf.len() + additional {
            capacity *= 2;
        }
        self.buf.reserve_exact(capacity - self.buf.len());
    }

    pub fn add_attr(&mut self, attr_type: RadiusAttributeType, data: &[u8]) -> Result<()> {
        self.add_attr_raw(attr_type as u8, data)
    }

    pub fn add_attr_raw(&mut self, attr_type: u8, data: &[u8]) -> Result<()> {
        if data.len() > RADIUS_MAX_ATTR_LEN {
            return Err(RadiusError::AttributeTooLong(data.len()));
        }
        let len = RADIUS_ATTR_HDR_LEN + data.len();
        self.reserve(len);
        let offset = self.buf.len();
        self.buf.push(attr_type);
        self.buf.push(len as u8);
        self.buf.extend_from_slice(data);
        self.attrs.push(AttrSlot { offset, len });
        Ok(())
    }

    pub fn add_attr_int32(&mut self, attr_type: RadiusAttributeType, value: u32) -> Result<()> {
        self.add_attr(attr_type, &value.to_be_bytes())
    }

    /// Adds `eap` split into as many EAP-Message attributes as needed.
    pub fn add_eap(&mut self, eap: &[u8]) -> Result<()> {
        for chunk in eap.chunks(RADIUS_MAX_ATTR_LEN) {
            self.add_attr(RadiusAttributeType::EapMessage, chunk)?;
        }
        Ok(())
    }

    fn set_length(&mut self) {
        if self.buf.len() > RADIUS_MAX_MSG_LEN {
            warn!(
                "RADIUS message too long ({} bytes), length field truncated",
                self.buf.len()
            );
        }
        let len = self.buf.len() as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
    }

    fn message_authenticator_slot(&mut self) -> Result<AttrSlot> {
        let existing = self
            .attrs
            .iter()
            .find(|s| self.buf[s.offset] == RadiusAttributeType::MessageAuthenticator as u8)
            .copied();
        match existing {
            Some(slot) => {
                self.buf[slot.offset + RADIUS_ATTR_HDR_LEN..slot.offset + slot.len].fill(0);
                Ok(slot)
            }
            None => {
                self.add_attr(RadiusAttributeType::MessageAuthenticator, &[0; 16])?;
                Ok(self.attrs[self.attrs.len() - 1])
            }
        }
    }

    /// Sets the length field and, with a secret, appends a
    /// Message-Authenticator computed over the whole message.
    pub fn finish(&mut self, secret: Option<&[u8]>) -> Result<()> {
        let Some(secret) = secret else {
            self.set_length();
            return Ok(());
        };
        let slot = self.message_authenticator_slot()?;
        self.set_length();
        let mac = crypto::hmac_md5(secret, &self.buf);
        let value = slot.offset + RADIUS_ATTR_HDR_LEN;
        self.buf[value..value + 16].copy_from_slice(&mac);
        Ok(())
    }

    /// Server side of `finish`: Message-Authenticator computed with the
    /// request authenticator in the header, then the Response Authenticator.
    pub fn finish_response(&mut self, secret: &[u8], req_auth: &[u8; RADIUS_AUTH_LEN]) -> Result<()> {
        let slot = self.message_authenticator_slot()?;
        self.set_length();
        self.set_authenticator(req_auth);
        let mac = crypto::hmac_md5(secret, &self.buf);
        let value = slot.offset + RADIUS_ATTR_HDR_LEN;
        self.buf[value..value + 16].copy_from_slice(&mac);

        let resp_auth = crypto::md5(&[&self.buf, secret]);
        self.set_authenticator(&resp_auth);
        Ok(())
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RADIUS_HDR_LEN {
            return Err(RadiusError::TooShort(data.len()));
        }
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len < RADIUS_HDR_LEN || len > data.len() {
            return Err(RadiusError::InvalidLength {
                declared: len,
                received: data.len(),
            });
        }

        let mut msg = RadiusMsg {
            buf: data[..len].to_vec(),
            attrs: Vec::new(),
        };
        let mut pos = RADIUS_HDR_LEN;
        while pos < len {
            if len - pos < RADIUS_ATTR_HDR_LEN {
                return Err(RadiusError::MalformedAttribute(pos));
            }
            let attr_len = msg.buf[pos + 1] as usize;
            if attr_len < RADIUS_ATTR_HDR_LEN || pos + attr_len > len {
                return Err(RadiusError::MalformedAttribute(pos));
            }
            msg.attrs.push(AttrSlot {
                offset: pos,
                len: attr_len,
            });
            pos += attr_len;
        }
        Ok(msg)
    }

    /// First attribute of the given type.
    pub fn get_attr(&self, attr_type: RadiusAttributeType) -> Option<&[u8]> {
        self.attrs()
            .find(|(t, _)| *t == attr_type as u8)
            .map(|(_, v)| v)
    }

    pub fn get_attr_int32(&self, attr_type: RadiusAttributeType) -> Option<u32> {
        let value = self.get_attr(attr_type)?;
        let bytes: [u8; 4] = value.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    fn count_attr(&self, attr_type: RadiusAttributeType) -> usize {
        self.attrs().filter(|(t, _)| *t == attr_type as u8).count()
    }

    /// All EAP-Message attributes concatenated.
    pub fn get_eap(&self) -> Option<Vec<u8>> {
        let mut eap = Vec::new();
        let mut found = false;
        for (t, value) in self.attrs() {
            if t == RadiusAttributeType::EapMessage as u8 {
                eap.extend_from_slice(value);
                found = true;
            }
        }
        found.then_some(eap)
    }

    /// Copies the first attribute of `attr_type` from `src`. Returns whether
    /// one was found.
    pub fn copy_attr(&mut self, src: &RadiusMsg, attr_type: RadiusAttributeType) -> Result<bool> {
        match src.get_attr(attr_type) {
            Some(value) => {
                let value = value.to_vec();
                self.add_attr(attr_type, &value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Verifies a reply against the request it answers.
    pub fn verify(&self, secret: &[u8], request: &RadiusMsg) -> Result<()> {
        let req_auth = request.authenticator();
        let ma_count = self.count_attr(RadiusAttributeType::MessageAuthenticator);

        if ma_count == 0 {
            // RFC 3579 allows an Access-Reject without EAP to omit
            // Message-Authenticator.
            let bare_reject = self.radius_code() == Some(RadiusCode::AccessReject)
                && self.get_attr(RadiusAttributeType::EapMessage).is_none();
            if !bare_reject {
                return Err(RadiusError::MissingMessageAuthenticator);
            }
        } else if ma_count > 1 {
            return Err(RadiusError::DuplicateMessageAuthenticator(ma_count));
        } else {
            let slot = self
                .attrs
                .iter()
                .find(|s| self.buf[s.offset] == RadiusAttributeType::MessageAuthenticator as u8)
                .copied()
                .ok_or(RadiusError::MissingMessageAuthenticator)?;
            let value = slot.offset + RADIUS_ATTR_HDR_LEN;
            if slot.len != RADIUS_ATTR_HDR_LEN + 16 {
                return Err(RadiusError::InvalidMessageAuthenticator);
            }
            let mut copy = self.buf.clone();
            copy[4..RADIUS_HDR_LEN].copy_from_slice(&req_auth);
            copy[value..value + 16].fill(0);
            let expected = crypto::hmac_md5(secret, &copy);
            if expected[..] != self.buf[value..value + 16] {
                return Err(RadiusError::InvalidMessageAuthenticator);
            }
        }

        let expected = crypto::md5(&[
            &self.buf[..4],
            &req_auth,
            &self.buf[RADIUS_HDR_LEN..],
            secret,
        ]);
        if expected != self.authenticator() {
            return Err(RadiusError::InvalidResponseAuthenticator);
        }
        Ok(())
    }

    /// Decrypts MS-MPPE-Send-Key and MS-MPPE-Recv-Key. Returns `None` when
    /// neither key is present or one fails to decrypt.
    pub fn get_ms_keys(&self, request: &RadiusMsg, secret: &[u8]) -> Option<MsKeys> {
        let req_auth = request.authenticator();
        let mut keys = MsKeys::default();
        for (vendor_type, value) in self.vendor_attrs(RADIUS_VENDOR_ID_MICROSOFT) {
            let slot = match vendor_type {
                RADIUS_VENDOR_ATTR_MS_MPPE_SEND_KEY => &mut keys.send,
                RADIUS_VENDOR_ATTR_MS_MPPE_RECV_KEY => &mut keys.recv,
                _ => continue,
            };
            if slot.is_some() {
                continue;
            }
            match decrypt_ms_key(value, &req_auth, secret) {
                Some(key) => *slot = Some(key),
                None => {
                    warn!("Failed to decrypt MS-MPPE key (vendor type {})", vendor_type);
                    return None;
                }
            }
        }
        (keys.send.is_some() || keys.recv.is_some()).then_some(keys)
    }

    /// Sub-attributes `(vendor type, value)` of every Vendor-Specific
    /// attribute from `vendor_id`.
    fn vendor_attrs(&self, vendor_id: u32) -> Vec<(u8, &[u8])> {
        let mut found = Vec::new();
        for (t, value) in self.attrs() {
            if t != RadiusAttributeType::VendorSpecific as u8 || value.len() < 4 {
                continue;
            }
            if u32::from_be_bytes([value[0], value[1], value[2], value[3]]) != vendor_id {
                continue;
            }
            let mut pos = 4;
            while pos + RADIUS_ATTR_HDR_LEN <= value.len() {
                let sub_len = value[pos + 1] as usize;
                if sub_len < RADIUS_ATTR_HDR_LEN || pos + sub_len > value.len() {
                    break;
                }
                found.push((value[pos], &value[pos + RADIUS_ATTR_HDR_LEN..pos + sub_len]));
                pos += sub_len;
            }
        }
        found
    }

    /// Adds MS-MPPE-Send-Key and MS-MPPE-Recv-Key encrypted for a reply to
    /// a request with authenticator `req_auth`.
    pub fn add_ms_keys(
        &mut self,
        req_auth: &[u8; RADIUS_AUTH_LEN],
        secret: &[u8],
        send: &[u8],
        recv: &[u8],
    ) -> Result<()> {
        for (vendor_type, key) in [
            (RADIUS_VENDOR_ATTR_MS_MPPE_SEND_KEY, send),
            (RADIUS_VENDOR_ATTR_MS_MPPE_RECV_KEY, recv),
        ] {
            let mut salt = [0u8; 2];
            crypto::random_bytes(&mut salt)?;
            salt[0] |= 0x80;
            let encrypted = encrypt_ms_key(key, req_auth, secret, salt);

            let mut vsa = Vec::with_capacity(6 + encrypted.len());
            vsa.extend_from_slice(&RADIUS_VENDOR_ID_MICROSOFT.to_be_bytes());
            vsa.push(vendor_type);
            vsa.push((RADIUS_ATTR_HDR_LEN + encrypted.len()) as u8);
            vsa.extend_from_slice(&encrypted);
            self.add_attr(RadiusAttributeType::VendorSpecific, &vsa)?;
        }
        Ok(())
    }
}

/// RFC 2548 §2.4.2 keystream blocks: b1 = MD5(S + R + A), bi = MD5(S + c(i-1)).
fn ms_key_xor(data: &mut [u8], req_auth: &[u8], secret: &[u8], salt: &[u8], encrypt: bool) {
    let mut prev: Vec<u8> = [req_auth, salt].concat();
    for block in data.chunks_mut(16) {
        let b = crypto::md5(&[secret, &prev]);
        let cipher: Vec<u8> = if encrypt {
            block.iter_mut().zip(b.iter()).for_each(|(p, k)| *p ^= k);
            block.to_vec()
        } else {
            let c = block.to_vec();
            block.iter_mut().zip(b.iter()).for_each(|(p, k)| *p ^= k);
            c
        };
        prev = cipher;
    }
}

/// Decrypts salt + ciphertext into the key bytes.
pub fn decrypt_ms_key(value: &[u8], req_auth: &[u8], secret: &[u8]) -> Option<Vec<u8>> {
    if value.len() < 2 + 16 || (value.len() - 2) % 16 != 0 {
        return None;
    }
    let (salt, cipher) = value.split_at(2);
    let mut plain = cipher.to_vec();
    ms_key_xor(&mut plain, req_auth, secret, salt, false);

    let key_len = plain[0] as usize;
    if key_len > plain.len() - 1 {
        return None;
    }
    Some(plain[1..1 + key_len].to_vec())
}

/// Encrypts `key` as salt + ciphertext, padding the length-prefixed key to
/// a multiple of 16 bytes.
pub fn encrypt_ms_key(key: &[u8], req_auth: &[u8], secret: &[u8], salt: [u8; 2]) -> Vec<u8> {
    let mut plain = Vec::with_capacity(key.len() + 16);
    plain.push(key.len() as u8);
    plain.extend_from_slice(key);
    let padded = plain.len().div_ceil(16) * 16;
    plain.resize(padded, 0);
    ms_key_xor(&mut plain, req_auth, secret, &salt, true);

    let mut out = salt.to_vec();
    out.extend_from_slice(&plain);
    out
}

impl fmt::Display for RadiusMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.radius_code().map(|c| c.name()).unwrap_or("?Unknown?");
        writeln!(
            f,
            "RADIUS message: code={} ({}) identifier={} length={}",
            self.code(),
            name,
            self.identifier(),
            self.length()
        )?;
        for (t, value) in self.attrs() {
            let attr_name = RadiusAttributeType::from_u8(t)
                .map(|a| format!("{:?}", a))
                .unwrap_or_else(|| "?Unknown?".to_string());
            write!(f, "   Attribute {} ({}) length={}", t, attr_name, value.len() + 2)?;
            match RadiusAttributeType::from_u8(t) {
                Some(
                    RadiusAttributeType::UserName
                    | RadiusAttributeType::NasIdentifier
                    | RadiusAttributeType::CalledStationId
                    | RadiusAttributeType::CallingStationId
                    | RadiusAttributeType::ReplyMessage,
                ) => write!(f, "      Value: '{}'", String::from_utf8_lossy(value))?,
                Some(RadiusAttributeType::NasIpAddress) if value.len() == 4 => write!(
                    f,
                    "      Value: {}.{}.{}.{}",
                    value[0], value[1], value[2], value[3]
                )?,
                Some(_) if value.len() == 4 => write!(
                    f,
                    "      Value: {}",
                    u32::from_be_bytes([value[0], value[1], value[2], value[3]])
                )?,
                _ => {}
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"testing123";

    fn request() -> RadiusMsg {
        let mut req = RadiusMsg::new(RadiusCode::AccessRequest, 7);
        req.set_authenticator(&[0x11; 16]);
        req.add_attr(RadiusAttributeType::UserName, b"alice").unwrap();
        req.add_eap(&[2, 1, 0, 10, 1, b'a', b'l', b'i', b'c', b'e']).unwrap();
        req.finish(Some(SECRET)).unwrap();
        req
    }

    fn reply(code: RadiusCode, req: &RadiusMsg) -> RadiusMsg {
        let mut msg = RadiusMsg::new(code, req.identifier());
        msg.add_eap(&[1, 2, 0, 6, 4, 0]).unwrap();
        msg.add_attr(RadiusAttributeType::State, b"state-1").unwrap();
        msg.finish_response(SECRET, &req.authenticator()).unwrap();
        msg
    }

    #[test]
    fn test_parse_round_trip() {
        let mut msg = RadiusMsg::new(RadiusCode::AccessRequest, 42);
        msg.add_attr(RadiusAttributeType::UserName, b"bob").unwrap();
        msg.add_attr_int32(RadiusAttributeType::NasPort, 3).unwrap();
        msg.add_attr_raw(200, &[9, 9]).unwrap();
        msg.finish(None).unwrap();

        let parsed = RadiusMsg::parse(msg.as_bytes()).unwrap();
        assert_eq!(parsed.code(), 1);
        assert_eq!(parsed.identifier(), 42);
        assert_eq!(parsed.length() as usize, msg.as_bytes().len());
        assert_eq!(
            parsed.attrs().collect::<Vec<_>>(),
            msg.attrs().collect::<Vec<_>>()
        );
        assert_eq!(parsed.get_attr_int32(RadiusAttributeType::NasPort), Some(3));
        assert_eq!(parsed.get_attr(RadiusAttributeType::UserName), Some(&b"bob"[..]));
    }

    #[test]
    fn test_attr_too_long() {
        let mut msg = RadiusMsg::new(RadiusCode::AccessRequest, 1);
        assert!(msg.add_attr(RadiusAttributeType::State, &[0; 253]).is_ok());
        assert!(matches!(
            msg.add_attr(RadiusAttributeType::State, &[0; 254]),
            Err(RadiusError::AttributeTooLong(254))
        ));
        assert_eq!(msg.attr_count(), 1);
    }

    #[test]
    fn test_eap_chunking_and_growth() {
        let eap: Vec<u8> = (0..600u32).map(|i| i as u8).collect();
        let mut msg = RadiusMsg::with_capacity(RadiusCode::AccessRequest, 1, 32);
        msg.add_attr(RadiusAttributeType::UserName, b"first").unwrap();
        msg.add_eap(&eap).unwrap();
        msg.finish(None).unwrap();

        let sizes: Vec<usize> = msg
            .attrs()
            .filter(|(t, _)| *t == RadiusAttributeType::EapMessage as u8)
            .map(|(_, v)| v.len())
            .collect();
        assert_eq!(sizes, vec![253, 253, 94]);
        assert_eq!(msg.get_eap(), Some(eap));
        // Attributes recorded before the buffer grew still resolve.
        assert_eq!(msg.get_attr(RadiusAttributeType::UserName), Some(&b"first"[..]));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let msg = request();
        let bytes = msg.as_bytes().to_vec();

        assert!(matches!(RadiusMsg::parse(&bytes[..10]), Err(RadiusError::TooShort(10))));

        let mut long = bytes.clone();
        long[2..4].copy_from_slice(&((bytes.len() + 1) as u16).to_be_bytes());
        assert!(matches!(RadiusMsg::parse(&long), Err(RadiusError::InvalidLength { .. })));

        let mut zero_len = bytes.clone();
        zero_len[RADIUS_HDR_LEN + 1] = 0;
        assert!(matches!(
            RadiusMsg::parse(&zero_len),
            Err(RadiusError::MalformedAttribute(20))
        ));

        let mut overrun = bytes.clone();
        overrun[RADIUS_HDR_LEN + 1] = 250;
        assert!(matches!(
            RadiusMsg::parse(&overrun),
            Err(RadiusError::MalformedAttribute(20))
        ));

        // Trailing bytes beyond the length field are ignored.
        let mut padded = bytes.clone();
        padded.extend_from_slice(&[0; 5]);
        assert_eq!(RadiusMsg::parse(&padded).unwrap().as_bytes(), &bytes[..]);
    }

    #[test]
    fn test_verify_accepts_correct_reply() {
        let req = request();
        let msg = reply(RadiusCode::AccessChallenge, &req);
        let parsed = RadiusMsg::parse(msg.as_bytes()).unwrap();
        assert!(parsed.verify(SECRET, &req).is_ok());
        assert!(matches!(
            parsed.verify(b"wrong", &req),
            Err(RadiusError::InvalidMessageAuthenticator)
        ));
    }

    #[test]
    fn test_verify_rejects_mutations() {
        let req = request();
        let good = reply(RadiusCode::AccessAccept, &req).as_bytes().to_vec();

        // Flip one bit of the Message-Authenticator value (last attribute).
        let mut flipped = good.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        let parsed = RadiusMsg::parse(&flipped).unwrap();
        assert!(matches!(
            parsed.verify(SECRET, &req),
            Err(RadiusError::InvalidMessageAuthenticator)
        ));

        // Mutate the State value.
        let mut body = good.clone();
        let pos = body.windows(7).position(|w| w == b"state-1").unwrap();
        body[pos] = b'S';
        let parsed = RadiusMsg::parse(&body).unwrap();
        assert!(parsed.verify(SECRET, &req).is_err());

        // Correct Message-Authenticator, wrong Response Authenticator.
        let mut header = good.clone();
        header[4] ^= 0xff;
        let parsed = RadiusMsg::parse(&header).unwrap();
        assert!(matches!(
            parsed.verify(SECRET, &req),
            Err(RadiusError::InvalidResponseAuthenticator)
        ));
    }

    #[test]
    fn test_verify_message_authenticator_count() {
        let req = request();

        let mut none = RadiusMsg::new(RadiusCode::AccessAccept, req.identifier());
        none.finish(None).unwrap();
        let resp_auth = crypto::md5(&[&none.as_bytes()[..4], &req.authenticator(), SECRET]);
        none.set_authenticator(&resp_auth);
        assert!(matches!(
            none.verify(SECRET, &req),
            Err(RadiusError::MissingMessageAuthenticator)
        ));

        let mut dup = RadiusMsg::new(RadiusCode::AccessAccept, req.identifier());
        dup.add_attr(RadiusAttributeType::MessageAuthenticator, &[0; 16]).unwrap();
        dup.add_attr(RadiusAttributeType::MessageAuthenticator, &[0; 16]).unwrap();
        dup.finish(None).unwrap();
        let parsed = RadiusMsg::parse(dup.as_bytes()).unwrap();
        assert!(matches!(
            parsed.verify(SECRET, &req),
            Err(RadiusError::DuplicateMessageAuthenticator(2))
        ));
    }

    #[test]
    fn test_bare_access_reject() {
        let req = request();
        let mut reject = RadiusMsg::new(RadiusCode::AccessReject, req.identifier());
        reject.finish(None).unwrap();
        let resp_auth = crypto::md5(&[&reject.as_bytes()[..4], &req.authenticator(), SECRET]);
        reject.set_authenticator(&resp_auth);
        let parsed = RadiusMsg::parse(reject.as_bytes()).unwrap();
        assert!(parsed.verify(SECRET, &req).is_ok());

        // Without a valid Response Authenticator it is still dropped.
        let mut forged = RadiusMsg::new(RadiusCode::AccessReject, req.identifier());
        forged.finish(None).unwrap();
        assert!(matches!(
            forged.verify(SECRET, &req),
            Err(RadiusError::InvalidResponseAuthenticator)
        ));

        // A reject carrying EAP needs the Message-Authenticator.
        let mut eap_reject = RadiusMsg::new(RadiusCode::AccessReject, req.identifier());
        eap_reject.add_eap(&[4, 3, 0, 4]).unwrap();
        eap_reject.finish(None).unwrap();
        assert!(matches!(
            eap_reject.verify(SECRET, &req),
            Err(RadiusError::MissingMessageAuthenticator)
        ));
    }

    #[test]
    fn test_ms_keys_round_trip_and_determinism() {
        let req_auth = [0x42u8; 16];
        let send: Vec<u8> = (0..32).collect();
        let recv: Vec<u8> = (100..132).collect();

        let a = encrypt_ms_key(&recv, &req_auth, SECRET, [0x80, 0x01]);
        let b = encrypt_ms_key(&recv, &req_auth, SECRET, [0x80, 0x01]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2 + 48);
        assert_eq!(decrypt_ms_key(&a, &req_auth, SECRET), Some(recv.clone()));
        assert_ne!(decrypt_ms_key(&a, &req_auth, b"other"), Some(recv.clone()));

        let mut req = RadiusMsg::new(RadiusCode::AccessRequest, 1);
        req.set_authenticator(&req_auth);
        let mut accept = RadiusMsg::new(RadiusCode::AccessAccept, 1);
        accept.add_ms_keys(&req_auth, SECRET, &send, &recv).unwrap();
        accept.finish_response(SECRET, &req_auth).unwrap();

        let keys = accept.get_ms_keys(&req, SECRET).unwrap();
        assert_eq!(keys.send, Some(send));
        assert_eq!(keys.recv, Some(recv));
    }

    #[test]
    fn test_ms_key_length_byte_rejected() {
        let req_auth = [7u8; 16];
        let salt = [0x81, 0x02];
        // Plaintext whose length byte claims more than the 15 bytes present.
        let mut plain = vec![16u8];
        plain.extend_from_slice(&[0xab; 15]);
        ms_key_xor(&mut plain, &req_auth, SECRET, &salt, true);
        let mut value = salt.to_vec();
        value.extend_from_slice(&plain);
        assert_eq!(decrypt_ms_key(&value, &req_auth, SECRET), None);

        // Ciphertext that is not a multiple of 16 bytes.
        assert_eq!(decrypt_ms_key(&value[..10], &req_auth, SECRET), None);
    }

    #[test]
    fn test_copy_attr_first_match() {
        let req = request();
        let mut challenge = reply(RadiusCode::AccessChallenge, &req);
        challenge.add_attr(RadiusAttributeType::State, b"state-2").unwrap();

        let mut next = RadiusMsg::new(RadiusCode::AccessRequest, 8);
        assert!(next.copy_attr(&challenge, RadiusAttributeType::State).unwrap());
        assert!(!next.copy_attr(&challenge, RadiusAttributeType::Class).unwrap());
        assert_eq!(next.attr_count(), 1);
        assert_eq!(next.get_attr(RadiusAttributeType::State), Some(&b"state-1"[..]));
    }

    #[test]
    fn test_finish_reuses_message_authenticator() {
        let mut msg = request();
        let len = msg.as_bytes().len();
        msg.finish(Some(b"another")).unwrap();
        assert_eq!(msg.as_bytes().len(), len);
        assert_eq!(msg.count_attr(RadiusAttributeType::MessageAuthenticator), 1);
    }

    #[test]
    fn test_display_dump() {
        let dump = request().to_string();
        assert!(dump.starts_with("RADIUS message: code=1 (Access-Request) identifier=7"));
        assert!(dump.contains("Attribute 1 (UserName) length=7      Value: 'alice'"));
        assert!(dump.contains("Attribute 80 (MessageAuthenticator) length=18"));
    }
}
