//! Row, column, and value codecs for the sweep-queue cell table.
//!
//! Row key: 8-byte big-endian partition-or-anchor value followed by fixed
//! 9-byte metadata. Reference rows carry the fine partition there; dedicated
//! rows carry the owning transaction's start timestamp. Lexicographic byte
//! order therefore sorts by partition/anchor first, then metadata; within a
//! dedicated chain the row number is the trailing big-endian field, so
//! chain rows ascend with it.
//!
//! Column key: 5-byte big-endian timestamp offset within the fine partition,
//! then a 3-byte write index. Indices from `POINTER_WRITE_INDEX_BASE` upward
//! are reserved for dedicated-row pointer entries, which consequently sort
//! after every value entry of the same transaction.

use bytes::{Buf, BufMut};

use kestrel_common::error::SweepError;
use kestrel_common::types::{Cell, SweepStrategy, TableRef, Timestamp, WriteInfo};

pub const METADATA_BYTES: usize = 9;
pub const ROW_KEY_BYTES: usize = 8 + METADATA_BYTES;
pub const COLUMN_KEY_BYTES: usize = 8;

const FLAG_CONSERVATIVE: u8 = 0x80;
const FLAG_DEDICATED: u8 = 0x40;

const MAX_U24: u32 = (1 << 24) - 1;
const MAX_U40: u64 = (1 << 40) - 1;

/// First write index of the reserved pointer range: the pointer entry for
/// dedicated row `k` uses write index `POINTER_WRITE_INDEX_BASE + k`.
pub const POINTER_WRITE_INDEX_BASE: u32 = 0xF0_0000;

const VALUE_TAG_WRITE: u8 = 0x00;
const VALUE_TAG_TOMBSTONE: u8 = 0x01;
const VALUE_TAG_POINTER: u8 = 0x02;

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn corrupt_row(bytes: &[u8], reason: impl Into<String>) -> SweepError {
    SweepError::CorruptRow {
        row_hex: hex_encode(bytes),
        reason: reason.into(),
    }
}

/// Fixed-length metadata trailing every row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetedSweepMetadata {
    pub strategy: SweepStrategy,
    pub dedicated_row: bool,
    pub shard: u32,
    pub dedicated_row_number: u64,
}

impl TargetedSweepMetadata {
    /// Pack into `[flags][shard: u24 BE][dedicated_row_number: u40 BE]`.
    pub fn persist_to_bytes(&self) -> [u8; METADATA_BYTES] {
        debug_assert!(self.shard <= MAX_U24);
        debug_assert!(self.dedicated_row_number <= MAX_U40);
        let mut out = [0u8; METADATA_BYTES];
        let mut flags = 0u8;
        if self.strategy.is_conservative() {
            flags |= FLAG_CONSERVATIVE;
        }
        if self.dedicated_row {
            flags |= FLAG_DEDICATED;
        }
        out[0] = flags;
        out[1..4].copy_from_slice(&self.shard.to_be_bytes()[1..]);
        out[4..9].copy_from_slice(&self.dedicated_row_number.to_be_bytes()[3..]);
        out
    }

    pub fn hydrate_from_bytes(bytes: &[u8]) -> Result<Self, SweepError> {
        if bytes.len() != METADATA_BYTES {
            return Err(corrupt_row(
                bytes,
                format!("metadata must be {METADATA_BYTES} bytes, found {}", bytes.len()),
            ));
        }
        let flags = bytes[0];
        if flags & !(FLAG_CONSERVATIVE | FLAG_DEDICATED) != 0 {
            return Err(corrupt_row(bytes, format!("unknown metadata flags {flags:#04x}")));
        }
        let strategy = if flags & FLAG_CONSERVATIVE != 0 {
            SweepStrategy::Conservative
        } else {
            SweepStrategy::Thorough
        };
        let shard = u32::from_be_bytes([0, bytes[1], bytes[2], bytes[3]]);
        let dedicated_row_number =
            u64::from_be_bytes([0, 0, 0, bytes[4], bytes[5], bytes[6], bytes[7], bytes[8]]);
        Ok(Self {
            strategy,
            dedicated_row: flags & FLAG_DEDICATED != 0,
            shard,
            dedicated_row_number,
        })
    }
}

/// A decoded sweep-queue row key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepableCellsRow {
    /// Fine partition for reference rows; the transaction's start timestamp
    /// (the chain anchor) for dedicated rows.
    pub partition_or_anchor: i64,
    pub metadata: TargetedSweepMetadata,
}

impl SweepableCellsRow {
    pub fn reference(fine_partition: i64, strategy: SweepStrategy, shard: u32) -> Self {
        Self {
            partition_or_anchor: fine_partition,
            metadata: TargetedSweepMetadata {
                strategy,
                dedicated_row: false,
                shard,
                dedicated_row_number: 0,
            },
        }
    }

    pub fn dedicated(
        anchor_ts: Timestamp,
        strategy: SweepStrategy,
        shard: u32,
        dedicated_row_number: u64,
    ) -> Self {
        Self {
            partition_or_anchor: anchor_ts.0,
            metadata: TargetedSweepMetadata {
                strategy,
                dedicated_row: true,
                shard,
                dedicated_row_number,
            },
        }
    }

    pub fn persist_to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ROW_KEY_BYTES);
        out.put_u64(self.partition_or_anchor as u64);
        out.put_slice(&self.metadata.persist_to_bytes());
        out
    }

    pub fn hydrate_from_bytes(bytes: &[u8]) -> Result<Self, SweepError> {
        if bytes.len() != ROW_KEY_BYTES {
            return Err(corrupt_row(
                bytes,
                format!("row key must be {ROW_KEY_BYTES} bytes, found {}", bytes.len()),
            ));
        }
        let mut buf = bytes;
        let partition_or_anchor = buf.get_u64() as i64;
        let metadata = TargetedSweepMetadata::hydrate_from_bytes(buf)?;
        Ok(Self {
            partition_or_anchor,
            metadata,
        })
    }
}

/// A decoded sweep-queue column key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SweepableCellsColumn {
    /// Start timestamp minus the first timestamp of the fine partition. Zero
    /// in dedicated rows, whose anchor is the start timestamp itself.
    pub timestamp_offset: i64,
    pub write_index: u32,
}

impl SweepableCellsColumn {
    pub fn new(timestamp_offset: i64, write_index: u32) -> Self {
        debug_assert!((0..=MAX_U40 as i64).contains(&timestamp_offset));
        debug_assert!(write_index <= MAX_U24);
        Self {
            timestamp_offset,
            write_index,
        }
    }

    /// The pointer column for dedicated row `k` of a transaction at the
    /// given offset.
    pub fn pointer(timestamp_offset: i64, dedicated_row_number: u64) -> Self {
        Self::new(
            timestamp_offset,
            POINTER_WRITE_INDEX_BASE + dedicated_row_number as u32,
        )
    }

    pub fn is_pointer(&self) -> bool {
        self.write_index >= POINTER_WRITE_INDEX_BASE
    }

    pub fn persist_to_bytes(&self) -> [u8; COLUMN_KEY_BYTES] {
        let mut out = [0u8; COLUMN_KEY_BYTES];
        out[0..5].copy_from_slice(&(self.timestamp_offset as u64).to_be_bytes()[3..]);
        out[5..8].copy_from_slice(&self.write_index.to_be_bytes()[1..]);
        out
    }

    pub fn hydrate_from_bytes(bytes: &[u8]) -> Result<Self, SweepError> {
        if bytes.len() != COLUMN_KEY_BYTES {
            return Err(corrupt_row(
                bytes,
                format!(
                    "column key must be {COLUMN_KEY_BYTES} bytes, found {}",
                    bytes.len()
                ),
            ));
        }
        let timestamp_offset =
            u64::from_be_bytes([0, 0, 0, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]]) as i64;
        let write_index = u32::from_be_bytes([0, bytes[5], bytes[6], bytes[7]]);
        Ok(Self {
            timestamp_offset,
            write_index,
        })
    }
}

/// What an entry was: a write or a deletion. The start timestamp lives in
/// the column key, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteReference {
    pub table: TableRef,
    pub cell: Cell,
    pub is_tombstone: bool,
}

impl WriteReference {
    pub fn of(write: &WriteInfo) -> Self {
        Self {
            table: write.table.clone(),
            cell: write.cell.clone(),
            is_tombstone: write.is_tombstone,
        }
    }

    pub fn into_write_info(self, timestamp: Timestamp) -> WriteInfo {
        WriteInfo {
            table: self.table,
            cell: self.cell,
            timestamp,
            is_tombstone: self.is_tombstone,
        }
    }
}

/// Pointer from a reference row to one dedicated chain row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedicatedRowPointer {
    pub dedicated_row_number: u64,
    pub num_dedicated_rows: u64,
}

/// A decoded sweep-queue entry value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepableCellsValue {
    Entry(WriteReference),
    Pointer(DedicatedRowPointer),
}

impl SweepableCellsValue {
    pub fn entry(write: &WriteInfo) -> Self {
        SweepableCellsValue::Entry(WriteReference::of(write))
    }

    pub fn pointer(dedicated_row_number: u64, num_dedicated_rows: u64) -> Self {
        SweepableCellsValue::Pointer(DedicatedRowPointer {
            dedicated_row_number,
            num_dedicated_rows,
        })
    }

    pub fn persist_to_bytes(&self) -> Vec<u8> {
        match self {
            SweepableCellsValue::Entry(write_ref) => {
                let mut out = Vec::with_capacity(
                    1 + 4 * 3
                        + write_ref.table.as_bytes().len()
                        + write_ref.cell.row.len()
                        + write_ref.cell.col.len(),
                );
                out.put_u8(if write_ref.is_tombstone {
                    VALUE_TAG_TOMBSTONE
                } else {
                    VALUE_TAG_WRITE
                });
                put_bytes(&mut out, write_ref.table.as_bytes());
                put_bytes(&mut out, &write_ref.cell.row);
                put_bytes(&mut out, &write_ref.cell.col);
                out
            }
            SweepableCellsValue::Pointer(pointer) => {
                debug_assert!(pointer.dedicated_row_number <= MAX_U40);
                debug_assert!(pointer.num_dedicated_rows <= MAX_U40);
                let mut out = Vec::with_capacity(11);
                out.put_u8(VALUE_TAG_POINTER);
                out.put_slice(&pointer.dedicated_row_number.to_be_bytes()[3..]);
                out.put_slice(&pointer.num_dedicated_rows.to_be_bytes()[3..]);
                out
            }
        }
    }

    pub fn hydrate_from_bytes(bytes: &[u8]) -> Result<Self, SweepError> {
        let mut buf = bytes;
        if !buf.has_remaining() {
            return Err(corrupt_value("empty value"));
        }
        let tag = buf.get_u8();
        match tag {
            VALUE_TAG_WRITE | VALUE_TAG_TOMBSTONE => {
                let table = get_bytes(&mut buf)?;
                let table = String::from_utf8(table)
                    .map_err(|_| corrupt_value("table name is not valid UTF-8"))?;
                let row = get_bytes(&mut buf)?;
                let col = get_bytes(&mut buf)?;
                if buf.has_remaining() {
                    return Err(corrupt_value(format!(
                        "{} trailing bytes after entry",
                        buf.remaining()
                    )));
                }
                Ok(SweepableCellsValue::Entry(WriteReference {
                    table: TableRef::new(table),
                    cell: Cell::new(row, col),
                    is_tombstone: tag == VALUE_TAG_TOMBSTONE,
                }))
            }
            VALUE_TAG_POINTER => {
                if buf.remaining() != 10 {
                    return Err(corrupt_value(format!(
                        "pointer marker must be 10 bytes after the tag, found {}",
                        buf.remaining()
                    )));
                }
                let dedicated_row_number = get_u40(&mut buf);
                let num_dedicated_rows = get_u40(&mut buf);
                Ok(SweepableCellsValue::pointer(
                    dedicated_row_number,
                    num_dedicated_rows,
                ))
            }
            other => Err(corrupt_value(format!("unknown value tag {other:#04x}"))),
        }
    }
}

fn corrupt_value(reason: impl Into<String>) -> SweepError {
    SweepError::CorruptValue {
        reason: reason.into(),
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.put_u32(bytes.len() as u32);
    out.put_slice(bytes);
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, SweepError> {
    if buf.remaining() < 4 {
        return Err(corrupt_value("truncated length prefix"));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(corrupt_value(format!(
            "length prefix {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    Ok(bytes)
}

fn get_u40(buf: &mut &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    buf.copy_to_slice(&mut bytes[3..]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::types::WriteInfo;

    fn metadata(
        strategy: SweepStrategy,
        dedicated_row: bool,
        shard: u32,
        dedicated_row_number: u64,
    ) -> TargetedSweepMetadata {
        TargetedSweepMetadata {
            strategy,
            dedicated_row,
            shard,
            dedicated_row_number,
        }
    }

    #[test]
    fn test_metadata_round_trip() {
        for strategy in [SweepStrategy::Conservative, SweepStrategy::Thorough] {
            for dedicated in [false, true] {
                for shard in [0, 1, 255, (1 << 24) - 1] {
                    for row_number in [0, 1, (1 << 40) - 1] {
                        let m = metadata(strategy, dedicated, shard, row_number);
                        let bytes = m.persist_to_bytes();
                        assert_eq!(
                            TargetedSweepMetadata::hydrate_from_bytes(&bytes).unwrap(),
                            m
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_metadata_rejects_wrong_length_and_bad_flags() {
        assert!(TargetedSweepMetadata::hydrate_from_bytes(&[0u8; 8]).is_err());
        let mut bytes = metadata(SweepStrategy::Conservative, false, 0, 0).persist_to_bytes();
        bytes[0] |= 0x01;
        assert!(TargetedSweepMetadata::hydrate_from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_row_key_round_trip() {
        let row = SweepableCellsRow::reference(42, SweepStrategy::Conservative, 7);
        let bytes = row.persist_to_bytes();
        assert_eq!(bytes.len(), ROW_KEY_BYTES);
        assert_eq!(SweepableCellsRow::hydrate_from_bytes(&bytes).unwrap(), row);

        let ded =
            SweepableCellsRow::dedicated(Timestamp(500_200), SweepStrategy::Thorough, 3, 12);
        let bytes = ded.persist_to_bytes();
        assert_eq!(SweepableCellsRow::hydrate_from_bytes(&bytes).unwrap(), ded);
    }

    #[test]
    fn test_dedicated_chain_rows_ascend_with_row_number() {
        let keys: Vec<Vec<u8>> = (0..5)
            .map(|k| {
                SweepableCellsRow::dedicated(Timestamp(1001), SweepStrategy::Conservative, 0, k)
                    .persist_to_bytes()
            })
            .collect();
        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_row_keys_order_by_partition_first() {
        let p1 = SweepableCellsRow::reference(1, SweepStrategy::Thorough, 200).persist_to_bytes();
        let p2 =
            SweepableCellsRow::reference(2, SweepStrategy::Conservative, 0).persist_to_bytes();
        assert!(p1 < p2);
    }

    #[test]
    fn test_column_round_trip_and_order() {
        let a = SweepableCellsColumn::new(200, 0);
        let b = SweepableCellsColumn::new(200, 1);
        let c = SweepableCellsColumn::new(201, 0);
        let p = SweepableCellsColumn::pointer(200, 0);

        for col in [a, b, c, p] {
            let bytes = col.persist_to_bytes();
            assert_eq!(
                SweepableCellsColumn::hydrate_from_bytes(&bytes).unwrap(),
                col
            );
        }

        // Byte order matches logical order: offset first, then write index,
        // with pointers after every value entry at the same offset.
        assert!(a.persist_to_bytes() < b.persist_to_bytes());
        assert!(b.persist_to_bytes() < p.persist_to_bytes());
        assert!(p.persist_to_bytes() < c.persist_to_bytes());
        assert!(p.is_pointer());
        assert!(!c.is_pointer());
    }

    #[test]
    fn test_value_entry_round_trip() {
        let write = WriteInfo::write(
            TableRef::new("app.users"),
            Cell::new(*b"row", *b"col"),
            Timestamp(1000),
        );
        let value = SweepableCellsValue::entry(&write);
        let bytes = value.persist_to_bytes();
        let decoded = SweepableCellsValue::hydrate_from_bytes(&bytes).unwrap();
        assert_eq!(decoded, value);
        match decoded {
            SweepableCellsValue::Entry(write_ref) => {
                assert_eq!(write_ref.into_write_info(Timestamp(1000)), write);
            }
            _ => panic!("expected entry"),
        }
    }

    #[test]
    fn test_value_tombstone_round_trip() {
        let tombstone = WriteInfo::tombstone(
            TableRef::new("app.users"),
            Cell::new(*b"row", *b"col"),
            Timestamp(1000),
        );
        let bytes = SweepableCellsValue::entry(&tombstone).persist_to_bytes();
        match SweepableCellsValue::hydrate_from_bytes(&bytes).unwrap() {
            SweepableCellsValue::Entry(write_ref) => assert!(write_ref.is_tombstone),
            _ => panic!("expected entry"),
        }
    }

    #[test]
    fn test_value_pointer_round_trip() {
        let value = SweepableCellsValue::pointer(2, 3);
        let bytes = value.persist_to_bytes();
        assert_eq!(bytes.len(), 11);
        assert_eq!(SweepableCellsValue::hydrate_from_bytes(&bytes).unwrap(), value);
    }

    #[test]
    fn test_value_rejects_garbage() {
        assert!(SweepableCellsValue::hydrate_from_bytes(&[]).is_err());
        assert!(SweepableCellsValue::hydrate_from_bytes(&[0xFF]).is_err());
        assert!(SweepableCellsValue::hydrate_from_bytes(&[VALUE_TAG_WRITE, 0, 0]).is_err());
        assert!(SweepableCellsValue::hydrate_from_bytes(&[VALUE_TAG_POINTER, 1]).is_err());

        // Truncated payload behind a valid length prefix.
        let write = WriteInfo::write(
            TableRef::new("t"),
            Cell::new(*b"r", *b"c"),
            Timestamp(1),
        );
        let mut bytes = SweepableCellsValue::entry(&write).persist_to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(SweepableCellsValue::hydrate_from_bytes(&bytes).is_err());
    }
}
