//! WAL record codec.
//!
//! Each record has the following on-disk format (all integers
//! big-endian):
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | type     | flags    | coll_len | part_len | id_count |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 2 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | data_len | crc32c   | lsn                 | reserved |
//! | 4 bytes  | 4 bytes  | 8 bytes             | 2 bytes  |
//! +----------+----------+---------------------+----------+
//! | collection id | partition tag | entity ids   | vector data |
//! | coll_len      | part_len      | 8 * id_count | data_len    |
//! +---------------+---------------+--------------+-------------+
//! ```
//!
//! The CRC covers the body (everything after the 32-byte header). The
//! `lsn` field holds the record's own end-offset LSN, so a record read
//! from the wrong position is detected even when its CRC is intact.
//!
//! Flush barriers are never encoded: they exist only on the drain side,
//! synthesized by the manager.

use crate::error::WalError;
use crate::lsn::{Lsn, SegmentId};
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes for WAL records: "QLOG"
pub const WAL_MAGIC: [u8; 4] = *b"QLOG";

/// Hard upper bound on a record body. Appends are limited by
/// `WalConfig::record_size_limit`; this cap only keeps decode from
/// trusting an absurd length field.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Type byte of an on-disk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Insert of float32 vectors.
    InsertFloat = 1,
    /// Insert of binary vectors.
    InsertBinary = 2,
    /// Delete by entity id.
    Delete = 3,
    /// Collection creation marker.
    CreateCollection = 4,
    /// Partition creation marker.
    CreatePartition = 5,
}

impl TryFrom<u8> for RecordType {
    type Error = WalError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordType::InsertFloat),
            2 => Ok(RecordType::InsertBinary),
            3 => Ok(RecordType::Delete),
            4 => Ok(RecordType::CreateCollection),
            5 => Ok(RecordType::CreatePartition),
            _ => Err(WalError::InvalidHeader {
                offset: 0,
                reason: format!("unknown record type: {}", value),
            }),
        }
    }
}

/// Borrowed vector payload on the append path.
#[derive(Debug, Clone, Copy)]
pub enum VectorSlice<'a> {
    Float32(&'a [f32]),
    Binary(&'a [u8]),
}

impl<'a> VectorSlice<'a> {
    /// Encoded payload size in bytes.
    pub fn data_len(&self) -> usize {
        match self {
            VectorSlice::Float32(v) => v.len() * 4,
            VectorSlice::Binary(b) => b.len(),
        }
    }

    /// Number of scalar elements (f32 values or bytes).
    pub fn element_count(&self) -> usize {
        match self {
            VectorSlice::Float32(v) => v.len(),
            VectorSlice::Binary(b) => b.len(),
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            VectorSlice::Float32(_) => RecordType::InsertFloat,
            VectorSlice::Binary(_) => RecordType::InsertBinary,
        }
    }

    /// Sub-slice covering entities `[start, end)`, where each entity
    /// spans `per_entity` elements.
    pub fn slice_entities(&self, start: usize, end: usize, per_entity: usize) -> VectorSlice<'a> {
        match self {
            VectorSlice::Float32(v) => {
                VectorSlice::Float32(&v[start * per_entity..end * per_entity])
            }
            VectorSlice::Binary(b) => VectorSlice::Binary(&b[start * per_entity..end * per_entity]),
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        match self {
            VectorSlice::Float32(v) => {
                for value in *v {
                    buf.put_f32(*value);
                }
            }
            VectorSlice::Binary(b) => buf.put_slice(b),
        }
    }
}

/// Owned vector payload on the drain side.
#[derive(Debug, Clone, PartialEq)]
pub enum VectorData {
    Float32(Vec<f32>),
    Binary(Vec<u8>),
}

impl VectorData {
    pub fn element_count(&self) -> usize {
        match self {
            VectorData::Float32(v) => v.len(),
            VectorData::Binary(b) => b.len(),
        }
    }
}

/// Borrowed record contents on the append path. The LSN is not part of
/// the payload: it is only known once the record's position is, so it
/// is supplied to [`encode`](RecordPayload::encode).
#[derive(Debug, Clone, Copy)]
pub struct RecordPayload<'a> {
    pub record_type: RecordType,
    pub collection_id: &'a str,
    pub partition_tag: &'a str,
    pub ids: &'a [i64],
    pub vectors: VectorSlice<'a>,
}

impl<'a> RecordPayload<'a> {
    pub fn insert(
        collection_id: &'a str,
        partition_tag: &'a str,
        ids: &'a [i64],
        vectors: VectorSlice<'a>,
    ) -> Self {
        Self {
            record_type: vectors.record_type(),
            collection_id,
            partition_tag,
            ids,
            vectors,
        }
    }

    pub fn delete(collection_id: &'a str, partition_tag: &'a str, ids: &'a [i64]) -> Self {
        Self {
            record_type: RecordType::Delete,
            collection_id,
            partition_tag,
            ids,
            vectors: VectorSlice::Binary(&[]),
        }
    }

    pub fn create_collection(collection_id: &'a str) -> Self {
        Self {
            record_type: RecordType::CreateCollection,
            collection_id,
            partition_tag: "",
            ids: &[],
            vectors: VectorSlice::Binary(&[]),
        }
    }

    pub fn create_partition(collection_id: &'a str, partition_tag: &'a str) -> Self {
        Self {
            record_type: RecordType::CreatePartition,
            collection_id,
            partition_tag,
            ids: &[],
            vectors: VectorSlice::Binary(&[]),
        }
    }

    /// Total size of this record on disk, header included.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE
            + self.collection_id.len()
            + self.partition_tag.len()
            + self.ids.len() * 8
            + self.vectors.data_len()
    }

    /// Encodes the record with its end-offset LSN into bytes.
    pub fn encode(&self, lsn: Lsn) -> Result<BytesMut, WalError> {
        let body_len = self.disk_size() - RECORD_HEADER_SIZE;
        if body_len > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: body_len,
                max: MAX_RECORD_SIZE,
            });
        }
        if self.collection_id.len() > u16::MAX as usize || self.partition_tag.len() > u16::MAX as usize
        {
            return Err(WalError::InvalidArgument(
                "collection id or partition tag longer than 65535 bytes".into(),
            ));
        }

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + body_len);

        // Header
        buf.put_slice(&WAL_MAGIC);
        buf.put_u8(self.record_type as u8);
        buf.put_u8(0); // flags
        buf.put_u16(self.collection_id.len() as u16);
        buf.put_u16(self.partition_tag.len() as u16);
        buf.put_u32(self.ids.len() as u32);
        buf.put_u32(self.vectors.data_len() as u32);
        let crc_pos = buf.len();
        buf.put_u32(0); // crc placeholder
        buf.put_u64(lsn.as_u64());
        buf.put_u16(0); // reserved

        // Body
        buf.put_slice(self.collection_id.as_bytes());
        buf.put_slice(self.partition_tag.as_bytes());
        for id in self.ids {
            buf.put_i64(*id);
        }
        self.vectors.put(&mut buf);

        let crc = crc32c::crc32c(&buf[RECORD_HEADER_SIZE..]);
        buf[crc_pos..crc_pos + 4].copy_from_slice(&crc.to_be_bytes());

        Ok(buf)
    }
}

/// Parses just the length fields out of a header and returns the
/// record's total on-disk size. `None` when the slice is too short or
/// starts with zero padding. Does not validate the header; callers use
/// this to size a copy window and let [`RawRecord::decode`] report
/// errors.
pub fn peek_disk_size(header: &[u8]) -> Option<usize> {
    if header.len() < RECORD_HEADER_SIZE {
        return None;
    }
    if header[0..4] == [0, 0, 0, 0] {
        return None;
    }
    let collection_len = u16::from_be_bytes([header[6], header[7]]) as usize;
    let partition_len = u16::from_be_bytes([header[8], header[9]]) as usize;
    let id_count = u32::from_be_bytes([header[10], header[11], header[12], header[13]]) as usize;
    let data_len = u32::from_be_bytes([header[14], header[15], header[16], header[17]]) as usize;
    Some(RECORD_HEADER_SIZE + collection_len + partition_len + id_count * 8 + data_len)
}

/// A decoded on-disk record. Intermediate form between the buffer and
/// the manager; the drain surface converts it to [`WalRecord`].
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub record_type: RecordType,
    pub lsn: Lsn,
    pub collection_id: String,
    pub partition_tag: String,
    pub ids: Vec<i64>,
    pub data: Bytes,
}

impl RawRecord {
    /// Decodes one record from the front of `buf`, which was read from
    /// byte `offset` of segment `segment_id`.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete record
    /// (short read or zero padding at the tail).
    pub fn decode(
        buf: &mut BytesMut,
        segment_id: SegmentId,
        offset: u64,
    ) -> Result<Option<Self>, WalError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic = &buf[0..4];
        if magic != WAL_MAGIC {
            // Could be EOF padding or corruption
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let record_type = RecordType::try_from(buf[4]).map_err(|_| WalError::InvalidHeader {
            offset,
            reason: format!("unknown record type: {}", buf[4]),
        })?;
        let flags = buf[5];
        if flags != 0 {
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("unexpected flags: {:#x}", flags),
            });
        }

        let collection_len = u16::from_be_bytes([buf[6], buf[7]]) as usize;
        let partition_len = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        let id_count = u32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]) as usize;
        let data_len = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]);
        let lsn = Lsn::from_u64(u64::from_be_bytes([
            buf[22], buf[23], buf[24], buf[25], buf[26], buf[27], buf[28], buf[29],
        ]));
        let reserved = u16::from_be_bytes([buf[30], buf[31]]);
        if reserved != 0 {
            return Err(WalError::InvalidHeader {
                offset,
                reason: format!("unexpected reserved bytes: {:#x}", reserved),
            });
        }

        let body_len = collection_len + partition_len + id_count * 8 + data_len;
        if body_len > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge {
                size: body_len,
                max: MAX_RECORD_SIZE,
            });
        }

        let total_len = RECORD_HEADER_SIZE + body_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        // A record's LSN is its end offset; a mismatch means the bytes
        // were relocated or the header lies about its position.
        let expected_lsn = Lsn::new(segment_id, offset + total_len as u64);
        if lsn != expected_lsn {
            return Err(WalError::Corruption {
                offset,
                reason: format!("record lsn {} does not match position {}", lsn, expected_lsn),
            });
        }

        buf.advance(RECORD_HEADER_SIZE);
        let mut body = buf.split_to(body_len);

        let crc_actual = crc32c::crc32c(&body);
        if crc_actual != crc_expected {
            return Err(WalError::ChecksumMismatch {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        let collection_id =
            String::from_utf8(body.split_to(collection_len).to_vec()).map_err(|_| {
                WalError::Corruption {
                    offset,
                    reason: "collection id is not valid UTF-8".into(),
                }
            })?;
        let partition_tag =
            String::from_utf8(body.split_to(partition_len).to_vec()).map_err(|_| {
                WalError::Corruption {
                    offset,
                    reason: "partition tag is not valid UTF-8".into(),
                }
            })?;
        let mut ids = Vec::with_capacity(id_count);
        for _ in 0..id_count {
            ids.push(body.get_i64());
        }
        let data = body.freeze();

        Ok(Some(Self {
            record_type,
            lsn,
            collection_id,
            partition_tag,
            ids,
            data,
        }))
    }

    /// Whether this is a DDL marker (consumed by recovery, never
    /// surfaced to the drain).
    pub fn is_marker(&self) -> bool {
        matches!(
            self.record_type,
            RecordType::CreateCollection | RecordType::CreatePartition
        )
    }

    /// Total size of this record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE
            + self.collection_id.len()
            + self.partition_tag.len()
            + self.ids.len() * 8
            + self.data.len()
    }

    /// Converts into the drain-side record. Markers yield `None`.
    pub fn into_record(self) -> Result<Option<WalRecord>, WalError> {
        match self.record_type {
            RecordType::InsertFloat => {
                if self.data.len() % 4 != 0 {
                    return Err(WalError::Corruption {
                        offset: self.lsn.offset(),
                        reason: format!(
                            "float vector payload of {} bytes is not a multiple of 4",
                            self.data.len()
                        ),
                    });
                }
                let mut vectors = Vec::with_capacity(self.data.len() / 4);
                for chunk in self.data.chunks_exact(4) {
                    vectors.push(f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                Ok(Some(WalRecord::Insert {
                    lsn: self.lsn,
                    collection_id: self.collection_id,
                    partition_tag: self.partition_tag,
                    ids: self.ids,
                    vectors: VectorData::Float32(vectors),
                }))
            }
            RecordType::InsertBinary => Ok(Some(WalRecord::Insert {
                lsn: self.lsn,
                collection_id: self.collection_id,
                partition_tag: self.partition_tag,
                ids: self.ids,
                vectors: VectorData::Binary(self.data.to_vec()),
            })),
            RecordType::Delete => Ok(Some(WalRecord::Delete {
                lsn: self.lsn,
                collection_id: self.collection_id,
                partition_tag: self.partition_tag,
                ids: self.ids,
            })),
            RecordType::CreateCollection | RecordType::CreatePartition => Ok(None),
        }
    }
}

/// A record handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Insert {
        lsn: Lsn,
        collection_id: String,
        partition_tag: String,
        ids: Vec<i64>,
        vectors: VectorData,
    },
    Delete {
        lsn: Lsn,
        collection_id: String,
        partition_tag: String,
        ids: Vec<i64>,
    },
    /// Flush barrier: every record of `collection_id` (all collections
    /// when empty) with an LSN at or below `lsn` has already been
    /// surfaced. Synthesized at drain time, never stored.
    Flush { lsn: Lsn, collection_id: String },
}

impl WalRecord {
    pub fn lsn(&self) -> Lsn {
        match self {
            WalRecord::Insert { lsn, .. }
            | WalRecord::Delete { lsn, .. }
            | WalRecord::Flush { lsn, .. } => *lsn,
        }
    }

    pub fn collection_id(&self) -> &str {
        match self {
            WalRecord::Insert { collection_id, .. }
            | WalRecord::Delete { collection_id, .. }
            | WalRecord::Flush { collection_id, .. } => collection_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_at(payload: &RecordPayload<'_>, segment_id: SegmentId, offset: u64) -> BytesMut {
        let lsn = Lsn::new(segment_id, offset + payload.disk_size() as u64);
        payload.encode(lsn).unwrap()
    }

    #[test]
    fn test_float_insert_roundtrip() {
        let ids = vec![10i64, 11, 12];
        let vectors: Vec<f32> = vec![0.5, -1.25, 3.0, 0.0, 9.75, -0.5];
        let payload =
            RecordPayload::insert("coll", "part", &ids, VectorSlice::Float32(&vectors));

        let mut buf = encode_at(&payload, 1, 0);
        let decoded = RawRecord::decode(&mut buf, 1, 0).unwrap().unwrap();

        assert_eq!(decoded.record_type, RecordType::InsertFloat);
        assert_eq!(decoded.collection_id, "coll");
        assert_eq!(decoded.partition_tag, "part");
        assert_eq!(decoded.ids, ids);

        let record = decoded.into_record().unwrap().unwrap();
        match record {
            WalRecord::Insert { vectors: VectorData::Float32(v), .. } => assert_eq!(v, vectors),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_binary_insert_roundtrip() {
        let ids = vec![7i64];
        let data = vec![0xAAu8, 0xBB, 0xCC, 0xDD];
        let payload = RecordPayload::insert("c1", "", &ids, VectorSlice::Binary(&data));

        let mut buf = encode_at(&payload, 2, 100);
        let decoded = RawRecord::decode(&mut buf, 2, 100).unwrap().unwrap();
        assert_eq!(decoded.record_type, RecordType::InsertBinary);
        assert_eq!(decoded.data.as_ref(), data.as_slice());
        assert_eq!(decoded.lsn, Lsn::new(2, 100 + decoded.disk_size() as u64));
    }

    #[test]
    fn test_delete_roundtrip() {
        let ids = vec![1i64, 2, 3, 4];
        let payload = RecordPayload::delete("c1", "p1", &ids);
        let mut buf = encode_at(&payload, 1, 64);
        let decoded = RawRecord::decode(&mut buf, 1, 64).unwrap().unwrap();

        let record = decoded.into_record().unwrap().unwrap();
        match record {
            WalRecord::Delete { ids: got, collection_id, .. } => {
                assert_eq!(got, ids);
                assert_eq!(collection_id, "c1");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_marker_roundtrip_filtered_from_drain() {
        let payload = RecordPayload::create_partition("c1", "spring");
        let mut buf = encode_at(&payload, 3, 0);
        let decoded = RawRecord::decode(&mut buf, 3, 0).unwrap().unwrap();
        assert!(decoded.is_marker());
        assert_eq!(decoded.partition_tag, "spring");
        assert!(decoded.into_record().unwrap().is_none());
    }

    #[test]
    fn test_corrupted_record_detection() {
        let ids = vec![1i64];
        let payload = RecordPayload::delete("c1", "", &ids);
        let mut buf = encode_at(&payload, 1, 0);
        let len = buf.len();
        buf[len - 1] ^= 0xFF;

        let result = RawRecord::decode(&mut buf, 1, 0);
        assert!(matches!(result, Err(WalError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_lsn_position_mismatch() {
        let ids = vec![1i64];
        let payload = RecordPayload::delete("c1", "", &ids);
        // Encoded as if it lived at offset 0, decoded from offset 512.
        let mut buf = encode_at(&payload, 1, 0);
        let result = RawRecord::decode(&mut buf, 1, 512);
        assert!(matches!(result, Err(WalError::Corruption { .. })));
    }

    #[test]
    fn test_incomplete_record() {
        let mut buf = BytesMut::from(&b"QLOG"[..]);
        assert!(RawRecord::decode(&mut buf, 1, 0).unwrap().is_none());
    }

    #[test]
    fn test_eof_padding() {
        let mut buf = BytesMut::from(&[0u8; 64][..]);
        assert!(RawRecord::decode(&mut buf, 1, 0).unwrap().is_none());
    }

    #[test]
    fn test_invalid_magic() {
        let mut buf = BytesMut::from(&[0x42u8; 64][..]);
        let result = RawRecord::decode(&mut buf, 1, 0);
        assert!(matches!(result, Err(WalError::InvalidHeader { .. })));
    }

    #[test]
    fn test_unknown_record_type() {
        let ids = vec![1i64];
        let payload = RecordPayload::delete("c1", "", &ids);
        let mut buf = encode_at(&payload, 1, 0);
        buf[4] = 99;
        let result = RawRecord::decode(&mut buf, 1, 0);
        assert!(matches!(result, Err(WalError::InvalidHeader { .. })));
    }

    #[test]
    fn test_record_type_conversion() {
        assert_eq!(RecordType::try_from(1u8).unwrap(), RecordType::InsertFloat);
        assert_eq!(RecordType::try_from(2u8).unwrap(), RecordType::InsertBinary);
        assert_eq!(RecordType::try_from(3u8).unwrap(), RecordType::Delete);
        assert_eq!(
            RecordType::try_from(4u8).unwrap(),
            RecordType::CreateCollection
        );
        assert_eq!(
            RecordType::try_from(5u8).unwrap(),
            RecordType::CreatePartition
        );
        assert!(RecordType::try_from(0u8).is_err());
        assert!(RecordType::try_from(6u8).is_err());
    }

    #[test]
    fn test_float_payload_not_multiple_of_four() {
        let raw = RawRecord {
            record_type: RecordType::InsertFloat,
            lsn: Lsn::new(1, 100),
            collection_id: "c1".into(),
            partition_tag: "".into(),
            ids: vec![1],
            data: Bytes::from_static(&[1, 2, 3]),
        };
        assert!(matches!(raw.into_record(), Err(WalError::Corruption { .. })));
    }

    #[test]
    fn test_disk_size_matches_encoding() {
        let ids = vec![5i64, 6];
        let vectors: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let payload = RecordPayload::insert("abc", "de", &ids, VectorSlice::Float32(&vectors));
        let buf = encode_at(&payload, 1, 0);
        assert_eq!(buf.len(), payload.disk_size());
        assert_eq!(
            payload.disk_size(),
            RECORD_HEADER_SIZE + 3 + 2 + 2 * 8 + 4 * 4
        );
    }

    #[test]
    fn test_slice_entities() {
        let vectors: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let slice = VectorSlice::Float32(&vectors);
        // 3 entities of dimension 4; take the middle one.
        match slice.slice_entities(1, 2, 4) {
            VectorSlice::Float32(v) => assert_eq!(v, &[4.0, 5.0, 6.0, 7.0]),
            _ => panic!("wrong variant"),
        }
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            collection in "[a-z]{1,12}",
            partition in "[a-z]{0,8}",
            ids in proptest::collection::vec(any::<i64>(), 1..50),
            dim in 1usize..16,
            seed in any::<u32>(),
        ) {
            let vectors: Vec<f32> = (0..ids.len() * dim)
                .map(|i| (i as f32) * 0.25 + seed as f32)
                .collect();
            let payload = RecordPayload::insert(
                &collection,
                &partition,
                &ids,
                VectorSlice::Float32(&vectors),
            );
            let offset = (seed as u64 % 1024) * 8;
            let lsn = Lsn::new(1, offset + payload.disk_size() as u64);
            let mut buf = payload.encode(lsn).unwrap();
            let decoded = RawRecord::decode(&mut buf, 1, offset).unwrap().unwrap();
            prop_assert_eq!(&decoded.collection_id, &collection);
            prop_assert_eq!(&decoded.partition_tag, &partition);
            prop_assert_eq!(&decoded.ids, &ids);
            prop_assert_eq!(decoded.lsn, lsn);
            let record = decoded.into_record().unwrap().unwrap();
            match record {
                WalRecord::Insert { vectors: VectorData::Float32(v), .. } => {
                    prop_assert_eq!(v, vectors);
                }
                other => prop_assert!(false, "unexpected record: {:?}", other),
            }
        }
    }
}
