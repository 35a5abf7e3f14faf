//! Frame header encoding.

use std::io::{self, Write};

/// Token that introduces a binary frame inside a text stream.
pub const MAGIC: [u8; 8] = *b"TAK35EM1";

/// Size in bytes of an encoded frame header, magic included.
pub const HEADER_LEN: usize = 16;

/// Length of the id and length fields that follow the magic.
pub(crate) const FIELDS_LEN: usize = HEADER_LEN - MAGIC.len();

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header did not start with [`MAGIC`].
    #[error("frame header does not start with the frame magic")]
    BadMagic,

    /// The payload does not fit the 32-bit length field.
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    /// The declared payload length exceeds the reader's configured limit.
    #[error("frame {id} declares {len} bytes, limit is {max}")]
    PayloadLimit {
        /// Correlation id of the offending frame.
        id: u32,
        /// Declared payload length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// The fixed-size part of a frame: correlation id and payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    /// Correlation id matching the frame to its structured record.
    pub id: u32,
    /// Payload length in bytes.
    pub len: u32,
}

impl FrameHeader {
    /// Create a header for a payload of `len` bytes.
    #[must_use]
    pub const fn new(id: u32, len: u32) -> Self {
        Self { id, len }
    }

    /// Create a header describing `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload is longer than
    /// `u32::MAX` bytes.
    pub fn for_payload(id: u32, payload: &[u8]) -> Result<Self, FrameError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| FrameError::PayloadTooLarge(payload.len()))?;
        Ok(Self { id, len })
    }

    /// Encode the header, magic included.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..MAGIC.len()].copy_from_slice(&MAGIC);
        out[8..12].copy_from_slice(&self.id.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    /// Decode a header, magic included.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BadMagic`] if the first eight bytes are not the
    /// frame magic.
    pub fn from_bytes(bytes: &[u8; HEADER_LEN]) -> Result<Self, FrameError> {
        if bytes[..MAGIC.len()] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        let mut fields = [0u8; FIELDS_LEN];
        fields.copy_from_slice(&bytes[MAGIC.len()..]);
        Ok(Self::from_fields(&fields))
    }

    /// Decode the id and length fields that follow an already matched magic.
    pub(crate) fn from_fields(fields: &[u8; FIELDS_LEN]) -> Self {
        let [a, b, c, d, e, f, g, h] = *fields;
        Self {
            id: u32::from_le_bytes([a, b, c, d]),
            len: u32::from_le_bytes([e, f, g, h]),
        }
    }
}

/// Write one complete frame (header and payload) to `w`.
///
/// # Errors
///
/// Returns an error if the payload does not fit in a frame or the writer
/// fails.
pub fn write_frame<W: Write + ?Sized>(w: &mut W, id: u32, payload: &[u8]) -> io::Result<()> {
    let header = FrameHeader::for_payload(id, payload)?;
    w.write_all(&header.to_bytes())?;
    w.write_all(payload)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_magic_then_little_endian_fields() {
        let bytes = FrameHeader::new(0x0102_0304, 5).to_bytes();
        assert_eq!(&bytes[..8], b"TAK35EM1");
        assert_eq!(&bytes[8..12], &[4, 3, 2, 1]);
        assert_eq!(&bytes[12..16], &[5, 0, 0, 0]);
    }

    #[test]
    fn from_bytes_rejects_wrong_magic() {
        let mut bytes = FrameHeader::new(1, 1).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            FrameHeader::from_bytes(&bytes),
            Err(FrameError::BadMagic)
        ));
    }

    #[test]
    fn from_bytes_reads_fields() {
        let header = FrameHeader::new(42, 1_000_000);
        assert_eq!(FrameHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn write_frame_appends_payload_after_header() {
        let mut out = Vec::new();
        write_frame(&mut out, 9, b"abc").unwrap();
        assert_eq!(out.len(), HEADER_LEN + 3);
        assert_eq!(&out[HEADER_LEN..], b"abc");
        assert_eq!(
            FrameHeader::from_bytes(&out[..HEADER_LEN].try_into().unwrap()).unwrap(),
            FrameHeader::new(9, 3)
        );
    }
}
