// EAP Packet Definitions
// Based on RFC 2284

pub const EAP_HDR_LEN: usize = 4;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl EapCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(EapCode::Request),
            2 => Some(EapCode::Response),
            3 => Some(EapCode::Success),
            4 => Some(EapCode::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum EapType {
    Identity = 1,
    Notification = 2,
    Nak = 3, // Response only
    Md5Challenge = 4,
    Otp = 5,
    GenericTokenCard = 6,
    Tls = 13,
    Ttls = 21,
    Peap = 25,
    MsChapV2 = 26,
}

impl EapType {
    pub fn from_u8(t: u8) -> Option<Self> {
        match t {
            1 => Some(EapType::Identity),
            2 => Some(EapType::Notification),
            3 => Some(EapType::Nak),
            4 => Some(EapType::Md5Challenge),
            5 => Some(EapType::Otp),
            6 => Some(EapType::GenericTokenCard),
            13 => Some(EapType::Tls),
            21 => Some(EapType::Ttls),
            25 => Some(EapType::Peap),
            26 => Some(EapType::MsChapV2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPacket {
    pub code: EapCode,
    pub identifier: u8,
    pub data: Vec<u8>,
}

/// Why an EAP header could not be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapError {
    TooShort(usize),
    UnknownCode(u8),
    /// The length field disagrees with the received data.
    BadLength { declared: usize, available: usize },
}

impl EapPacket {
    /// Parses one EAP packet. Bytes after the declared length are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EapError> {
        if data.len() < EAP_HDR_LEN {
            return Err(EapError::TooShort(data.len()));
        }
        let code = EapCode::from_u8(data[0]).ok_or(EapError::UnknownCode(data[0]))?;
        let identifier = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < EAP_HDR_LEN || data.len() < length {
            return Err(EapError::BadLength {
                declared: length,
                available: data.len(),
            });
        }
        Ok(EapPacket {
            code,
            identifier,
            data: data[EAP_HDR_LEN..length].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let length = (EAP_HDR_LEN + self.data.len()) as u16;
        let mut bytes = Vec::with_capacity(length as usize);
        bytes.push(self.code as u8);
        bytes.push(self.identifier);
        bytes.extend_from_slice(&length.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// EAP-Request/Identity with optional displayable text.
    pub fn identity_request(identifier: u8, text: Option<&str>) -> Self {
        let mut data = vec![EapType::Identity as u8];
        if let Some(text) = text {
            data.extend_from_slice(text.as_bytes());
        }
        EapPacket {
            code: EapCode::Request,
            identifier,
            data,
        }
    }

    /// Canned EAP-Success or EAP-Failure.
    pub fn canned(identifier: u8, success: bool) -> Self {
        EapPacket {
            code: if success { EapCode::Success } else { EapCode::Failure },
            identifier,
            data: Vec::new(),
        }
    }

    /// The method type of a Request or Response.
    pub fn eap_type(&self) -> Option<u8> {
        match self.code {
            EapCode::Request | EapCode::Response => self.data.first().copied(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_response() {
        let bytes = [2, 5, 0, 10, 1, b'a', b'l', b'i', b'c', b'e', 0xff];
        let eap = EapPacket::from_bytes(&bytes).unwrap();
        assert_eq!(eap.code, EapCode::Response);
        assert_eq!(eap.identifier, 5);
        assert_eq!(eap.eap_type(), Some(EapType::Identity as u8));
        assert_eq!(&eap.data[1..], b"alice");
        assert_eq!(eap.to_bytes(), &bytes[..10]);
    }

    #[test]
    fn test_bad_headers() {
        assert_eq!(EapPacket::from_bytes(&[2, 1, 0]), Err(EapError::TooShort(3)));
        assert_eq!(EapPacket::from_bytes(&[9, 1, 0, 4]), Err(EapError::UnknownCode(9)));
        assert_eq!(
            EapPacket::from_bytes(&[2, 1, 0, 8, 1]),
            Err(EapError::BadLength { declared: 8, available: 5 })
        );
        assert_eq!(
            EapPacket::from_bytes(&[2, 1, 0, 2, 1]),
            Err(EapError::BadLength { declared: 2, available: 5 })
        );
    }

    #[test]
    fn test_canned_and_identity_request() {
        assert_eq!(EapPacket::canned(3, true).to_bytes(), vec![3, 3, 0, 4]);
        assert_eq!(EapPacket::canned(4, false).to_bytes(), vec![4, 4, 0, 4]);
        assert_eq!(
            EapPacket::identity_request(1, Some("hi")).to_bytes(),
            vec![1, 1, 0, 7, 1, b'h', b'i']
        );
        assert_eq!(EapPacket::canned(1, true).eap_type(), None);
    }
}
