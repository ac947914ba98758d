//! Raw LocoNet frames.
//!
//! A frame is an opcode byte (bit 7 set) followed by 7-bit data bytes and a
//! trailing checksum. The frame length is implied by the opcode, except for
//! the variable-length group where byte 1 carries the length.

use std::fmt;

use super::codec::CodecError;

/// One LocoNet frame, checksum byte included.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct LnMessage {
    bytes: Vec<u8>,
}

impl LnMessage {
    /// Build a frame from its elements (everything but the checksum) and
    /// append the checksum.
    pub fn from_elements(elements: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(elements.len() + 1);
        bytes.extend_from_slice(elements);
        bytes.push(checksum(elements));
        Self { bytes }
    }

    /// Wrap a frame received from the bus.
    ///
    /// The transport has already resolved framing, so only the opcode and
    /// the implied length are checked here.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let Some(&opcode) = bytes.first() else {
            return Err(CodecError::Truncated {
                expected: 2,
                actual: 0,
            });
        };
        if opcode & 0x80 == 0 {
            return Err(CodecError::InvalidOpcode(opcode));
        }
        let expected = frame_length(opcode, bytes.get(1).copied()).unwrap_or(2);
        if bytes.len() < expected {
            return Err(CodecError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Element `i`, or 0 when the frame is shorter.
    pub fn element(&self, i: usize) -> u8 {
        self.bytes.get(i).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// True if the trailing byte matches the checksum of the rest.
    pub fn checksum_ok(&self) -> bool {
        match self.bytes.split_last() {
            Some((&chk, body)) => checksum(body) == chk,
            None => false,
        }
    }

    /// Render as space separated hex, e.g. `BB 05 00 41`.
    pub fn to_hex(&self) -> String {
        self.bytes
            .chunks(1)
            .map(hex::encode_upper)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for LnMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LnMessage({})", self.to_hex())
    }
}

impl fmt::Display for LnMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for LnMessage {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// LocoNet checksum: ones complement of the XOR of all preceding bytes.
pub fn checksum(body: &[u8]) -> u8 {
    0xFF ^ body.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Frame length implied by `opcode`; `second` is byte 1 when available.
///
/// Returns `None` for a variable-length opcode whose count byte has not
/// arrived yet.
pub fn frame_length(opcode: u8, second: Option<u8>) -> Option<usize> {
    match opcode & 0x60 {
        0x00 => Some(2),
        0x20 => Some(4),
        0x40 => Some(6),
        _ => second.map(|n| n as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_request_slot() {
        // RQ_SL_DATA for slot 5, as captured from a DCS100.
        let msg = LnMessage::from_elements(&[0xBB, 0x05, 0x00]);
        assert_eq!(msg.as_bytes(), &[0xBB, 0x05, 0x00, 0x41]);
        assert!(msg.checksum_ok());
    }

    #[test]
    fn test_frame_length_groups() {
        assert_eq!(frame_length(0x83, None), Some(2));
        assert_eq!(frame_length(0xBF, None), Some(4));
        assert_eq!(frame_length(0xD0, None), Some(6));
        assert_eq!(frame_length(0xE7, Some(0x0E)), Some(14));
        assert_eq!(frame_length(0xE7, None), None);
    }

    #[test]
    fn test_from_bytes_rejects_data_byte() {
        assert!(matches!(
            LnMessage::from_bytes(&[0x05, 0x00]),
            Err(CodecError::InvalidOpcode(0x05))
        ));
    }

    #[test]
    fn test_from_bytes_rejects_short_frame() {
        assert!(matches!(
            LnMessage::from_bytes(&[0xE7, 0x0E, 0x05]),
            Err(CodecError::Truncated {
                expected: 14,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_hex_display() {
        let msg = LnMessage::from_elements(&[0x83]);
        assert_eq!(msg.to_string(), "83 7C");
    }
}
