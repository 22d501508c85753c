use byteorder::{BigEndian, ByteOrder};

use crate::error::Result;

pub const HEADER_SIZE: usize = 64;

const SIGNATURE: [u8; 8] = *b"emberlog";
const VERSION: u32 = 1;

/// WAL file header.
///
/// Only the applied watermark changes after creation: groups at or below it
/// have been drained into the index and may be reclaimed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Header {
    pub version: u32,
    pub applied_upto: u64,
}

impl Header {
    pub fn new() -> Self {
        Self {
            version: VERSION,
            applied_upto: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(&SIGNATURE);
        BigEndian::write_u32(&mut buf[8..12], self.version);
        BigEndian::write_u64(&mut buf[12..20], self.applied_upto);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE || buf[..8] != SIGNATURE {
            return Err(crate::errcorrupt!("bad log header signature"));
        }
        let version = BigEndian::read_u32(&buf[8..12]);
        if version != VERSION {
            return Err(crate::errcorrupt!("unsupported log version {version}"));
        }
        Ok(Self {
            version,
            applied_upto: BigEndian::read_u64(&buf[12..20]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = Header::new();
        header.applied_upto = 42;
        let parsed = Header::decode(&header.encode()).expect("Failed to decode header");
        assert_eq!(parsed.applied_upto, 42);
        assert_eq!(parsed.version, VERSION);
    }

    #[test]
    fn test_header_rejects_garbage() {
        assert!(Header::decode(&[0u8; HEADER_SIZE]).is_err());
        assert!(Header::decode(&[0u8; 4]).is_err());
    }
}
