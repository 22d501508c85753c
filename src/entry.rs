use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::varz::unix_now;

/// Size of an encoded message id.
pub const ID_SIZE: usize = 20;

/// Serialized entry header size; the header precedes the raw message bytes
/// in the memtable and in WAL records.
pub const ENTRY_HEADER_SIZE: usize = 38;

/// Contract applied when the caller does not supply one.
pub const MASTER_CONTRACT: u32 = 0x4D53_5452;

/// A 20-byte message id.
///
/// Layout (little-endian): unix time (4) | seq (8) | contract (4) |
/// unique (3) | flags (1). The final byte carries the encryption flag so
/// readers know whether to run the payload transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id(pub [u8; ID_SIZE]);

impl Id {
    pub fn new(seq: u64, contract: u32, encrypted: bool) -> Self {
        let mut raw = [0u8; ID_SIZE];
        LittleEndian::write_u32(&mut raw[0..4], unix_now() as u32);
        LittleEndian::write_u64(&mut raw[4..12], seq);
        LittleEndian::write_u32(&mut raw[12..16], contract);
        let unique = rand::random::<u32>();
        raw[16..19].copy_from_slice(&unique.to_le_bytes()[..3]);
        raw[19] = encrypted as u8;
        Id(raw)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        if raw.len() != ID_SIZE {
            return Err(Error::IdEmpty);
        }
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(raw);
        Ok(Id(id))
    }

    pub fn time(&self) -> u32 {
        LittleEndian::read_u32(&self.0[0..4])
    }

    pub fn seq(&self) -> u64 {
        LittleEndian::read_u64(&self.0[4..12])
    }

    pub fn contract(&self) -> u32 {
        LittleEndian::read_u32(&self.0[12..16])
    }

    pub fn is_encrypted(&self) -> bool {
        self.0[19] & 1 == 1
    }

    /// Checks the id against a query's contract and time cutoff. A cutoff of
    /// zero disables the time check.
    pub fn eval_prefix(&self, contract: u32, cutoff: i64) -> bool {
        if self.contract() != contract {
            return false;
        }
        cutoff <= 0 || i64::from(self.time()) >= cutoff
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Fixed-size header stored ahead of the raw message bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryHeader {
    pub seq: u64,
    pub contract: u32,
    pub topic_hash: u64,
    pub topic_size: u16,
    pub value_size: u32,
    pub expires_at: u32,
    pub msg_offset: i64,
}

impl EntryHeader {
    /// Total size of the message region in the data file.
    pub fn m_size(&self) -> u32 {
        ID_SIZE as u32 + u32::from(self.topic_size) + self.value_size
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at != 0 && u64::from(self.expires_at) <= unix_now()
    }

    pub fn marshal(&self) -> [u8; ENTRY_HEADER_SIZE] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.seq);
        LittleEndian::write_u32(&mut buf[8..12], self.contract);
        LittleEndian::write_u64(&mut buf[12..20], self.topic_hash);
        LittleEndian::write_u16(&mut buf[20..22], self.topic_size);
        LittleEndian::write_u32(&mut buf[22..26], self.value_size);
        LittleEndian::write_u32(&mut buf[26..30], self.expires_at);
        LittleEndian::write_u64(&mut buf[30..38], self.msg_offset as u64);
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_HEADER_SIZE {
            return Err(crate::errcorrupt!("short entry header: {}", data.len()));
        }
        Ok(Self {
            seq: LittleEndian::read_u64(&data[0..8]),
            contract: LittleEndian::read_u32(&data[8..12]),
            topic_hash: LittleEndian::read_u64(&data[12..20]),
            topic_size: LittleEndian::read_u16(&data[20..22]),
            value_size: LittleEndian::read_u32(&data[22..26]),
            expires_at: LittleEndian::read_u32(&data[26..30]),
            msg_offset: LittleEndian::read_u64(&data[30..38]) as i64,
        })
    }
}

/// A message handed to `put_entry` or returned through iteration.
#[derive(Debug, Clone, Default)]
pub struct Entry {
    pub topic: Vec<u8>,
    pub payload: Vec<u8>,
    pub contract: u32,
    pub expires_at: u32,
    pub id: Option<Id>,
}

impl Entry {
    pub fn new(topic: impl Into<Vec<u8>>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_contract(mut self, contract: u32) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_expiry(mut self, expires_at: u32) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_id(mut self, id: Id) -> Self {
        self.id = Some(id);
        self
    }
}

type EncodeFn = dyn Fn(&[u8]) -> Vec<u8> + Send + Sync;
type DecodeFn = dyn Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync;

/// Pluggable payload transform applied at the storage boundary.
///
/// Compression and encryption live outside this crate; callers inject an
/// encode/decode pair at open and the engine applies it to payload bytes on
/// the way in and out.
#[derive(Clone)]
pub struct PayloadCodec {
    encode: Arc<EncodeFn>,
    decode: Arc<DecodeFn>,
}

impl PayloadCodec {
    pub fn new(
        encode: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
        decode: impl Fn(&[u8]) -> Result<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    /// The pass-through pair used when no transform is injected.
    pub fn identity() -> Self {
        Self::new(|b| b.to_vec(), |b| Ok(b.to_vec()))
    }

    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        (self.encode)(data)
    }

    pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        (self.decode)(data)
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_round_trip() {
        let id = Id::new(1234, MASTER_CONTRACT, true);
        assert_eq!(id.seq(), 1234);
        assert_eq!(id.contract(), MASTER_CONTRACT);
        assert!(id.is_encrypted());

        let parsed = Id::from_slice(id.as_bytes()).expect("Failed to parse id");
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_id_eval_prefix() {
        let id = Id::new(7, 99, false);
        assert!(id.eval_prefix(99, 0));
        assert!(!id.eval_prefix(100, 0));
        // A cutoff in the future rejects the id.
        assert!(!id.eval_prefix(99, i64::from(id.time()) + 100));
        assert!(id.eval_prefix(99, i64::from(id.time()) - 100));
    }

    #[test]
    fn test_entry_header_round_trip() {
        let header = EntryHeader {
            seq: 42,
            contract: MASTER_CONTRACT,
            topic_hash: 0xFEED_FACE,
            topic_size: 12,
            value_size: 512,
            expires_at: 0,
            msg_offset: 8192,
        };
        let raw = header.marshal();
        let parsed = EntryHeader::unmarshal(&raw).expect("Failed to unmarshal header");
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_entry_header_short_input() {
        assert!(EntryHeader::unmarshal(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_entry_expiry() {
        let mut header = EntryHeader::default();
        assert!(!header.is_expired(), "zero expiry never expires");
        header.expires_at = 1;
        assert!(header.is_expired());
        header.expires_at = unix_now() as u32 + 60;
        assert!(!header.is_expired());
    }

    #[test]
    fn test_codec_identity() {
        let codec = PayloadCodec::identity();
        let out = codec.encode(b"payload");
        assert_eq!(codec.decode(&out).expect("decode"), b"payload");
    }

    #[test]
    fn test_codec_custom_pair() {
        let codec = PayloadCodec::new(
            |b| b.iter().map(|x| x ^ 0x5A).collect(),
            |b| Ok(b.iter().map(|x| x ^ 0x5A).collect()),
        );
        let out = codec.encode(b"secret");
        assert_ne!(out, b"secret");
        assert_eq!(codec.decode(&out).expect("decode"), b"secret");
    }
}
