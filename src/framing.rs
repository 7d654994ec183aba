//! On-device log group format.
//!
//! A log group is one batched device write. Its layout, in device order:
//! group header, one record descriptor per record, the inline payload
//! region, the out-of-band payload region, then zero padding up to the
//! device alignment. All offsets stored in the header and in inline
//! descriptors are relative to the start of the header; out-of-band
//! descriptors store offsets relative to `oob_data_offset`.
//!
//! The group CRC covers every byte after the header up to `total_size`.
//! Each header also echoes the previous group's CRC, chaining groups so a
//! sequential scan can tell a legitimate end-of-log from a torn write.

use std::fmt;

/// Magic word at the start of every log group header.
pub const LOG_GROUP_MAGIC: [u8; 8] = *b"OXLGRP1\0";

/// Current log group format version.
pub const LOG_GROUP_VERSION: u32 = 1;

/// CRC value used before any group has been flushed.
pub const INVALID_CRC32: u32 = 0;

/// Errors from parsing on-device structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The buffer is smaller than the structure being decoded.
    BufferTooSmall,
    /// The group header magic did not match.
    MagicMismatch,
    /// The group header carries an unknown format version.
    UnsupportedVersion(u32),
    /// Header fields contradict each other or the buffer bounds.
    Inconsistent(&'static str),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FramingError::BufferTooSmall => write!(f, "buffer too small"),
            FramingError::MagicMismatch => write!(f, "group magic mismatch"),
            FramingError::UnsupportedVersion(version) => {
                write!(f, "unsupported group version {version}")
            }
            FramingError::Inconsistent(what) => write!(f, "inconsistent group header: {what}"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Fixed-size framing record at the start of every log group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGroupHeader {
    /// Format version.
    pub version: u32,
    /// Log index of the first record in the group.
    pub start_idx: i64,
    /// Number of record descriptors that follow the header.
    pub nrecords: u32,
    /// Offset of the inline payload region, from the header start.
    pub inline_data_offset: u32,
    /// Offset of the out-of-band payload region, from the header start.
    pub oob_data_offset: u32,
    /// Header plus payload bytes, before padding.
    pub total_size: u32,
    /// `total_size` rounded up to the device alignment.
    pub group_size: u32,
    /// CRC of the previous group, chaining groups for recovery.
    pub prev_grp_crc: u32,
    /// CRC over bytes `[ENCODED_SIZE, total_size)` of this group.
    pub cur_grp_crc: u32,
}

impl LogGroupHeader {
    /// Encoded size of the header on device.
    pub const ENCODED_SIZE: usize = 64;

    /// Serialize the header into the first [`Self::ENCODED_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), FramingError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(FramingError::BufferTooSmall);
        }
        buf[..Self::ENCODED_SIZE].fill(0);
        buf[..8].copy_from_slice(&LOG_GROUP_MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.nrecords.to_le_bytes());
        buf[16..24].copy_from_slice(&self.start_idx.to_le_bytes());
        buf[24..28].copy_from_slice(&self.inline_data_offset.to_le_bytes());
        buf[28..32].copy_from_slice(&self.oob_data_offset.to_le_bytes());
        buf[32..36].copy_from_slice(&self.total_size.to_le_bytes());
        buf[36..40].copy_from_slice(&self.group_size.to_le_bytes());
        buf[40..44].copy_from_slice(&self.prev_grp_crc.to_le_bytes());
        buf[44..48].copy_from_slice(&self.cur_grp_crc.to_le_bytes());
        Ok(())
    }

    /// Parse a header from the first [`Self::ENCODED_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(FramingError::BufferTooSmall);
        }
        if buf[..8] != LOG_GROUP_MAGIC {
            return Err(FramingError::MagicMismatch);
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != LOG_GROUP_VERSION {
            return Err(FramingError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            nrecords: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            start_idx: i64::from_le_bytes(buf[16..24].try_into().unwrap()),
            inline_data_offset: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            oob_data_offset: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            total_size: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            group_size: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            prev_grp_crc: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            cur_grp_crc: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        })
    }

    /// One past the log index of the last record in the group.
    pub fn end_idx(&self) -> i64 {
        self.start_idx + self.nrecords as i64
    }
}

impl fmt::Display for LogGroupHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "group[start_idx={} nrecords={} total_size={} group_size={} crc={:#010x} prev_crc={:#010x}]",
            self.start_idx,
            self.nrecords,
            self.total_size,
            self.group_size,
            self.cur_grp_crc,
            self.prev_grp_crc
        )
    }
}

/// Per-record descriptor stored after the group header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializedLogRecord {
    /// Sequence number assigned by the owning store.
    pub store_seq_num: i64,
    /// Payload size in bytes.
    pub size: u32,
    /// Payload offset: from the header start when inlined, from
    /// `oob_data_offset` otherwise.
    pub offset: u32,
    /// Id of the store the record belongs to.
    pub store_id: u32,
    /// Whether the payload lives in the inline region.
    pub is_inlined: bool,
}

impl SerializedLogRecord {
    /// Encoded size of one descriptor on device.
    pub const ENCODED_SIZE: usize = 24;

    const FLAG_INLINED: u8 = 1 << 0;

    /// Serialize the descriptor into the first [`Self::ENCODED_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), FramingError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(FramingError::BufferTooSmall);
        }
        buf[..Self::ENCODED_SIZE].fill(0);
        buf[..8].copy_from_slice(&self.store_seq_num.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..20].copy_from_slice(&self.store_id.to_le_bytes());
        buf[20] = if self.is_inlined { Self::FLAG_INLINED } else { 0 };
        Ok(())
    }

    /// Parse a descriptor from the first [`Self::ENCODED_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(FramingError::BufferTooSmall);
        }
        Ok(Self {
            store_seq_num: i64::from_le_bytes(buf[..8].try_into().unwrap()),
            size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            offset: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            store_id: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            is_inlined: buf[20] & Self::FLAG_INLINED != 0,
        })
    }
}

/// Compute the group CRC over a sequence of byte slices.
pub fn group_crc<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// Zero-copy framed view over a fully read log group.
pub struct GroupView<'a> {
    buf: &'a [u8],
    header: LogGroupHeader,
}

impl<'a> GroupView<'a> {
    /// Parse and validate a group image. `buf` must cover at least
    /// `total_size` bytes of the group.
    pub fn parse(buf: &'a [u8]) -> Result<Self, FramingError> {
        let header = LogGroupHeader::decode(buf)?;
        let desc_end =
            LogGroupHeader::ENCODED_SIZE + header.nrecords as usize * SerializedLogRecord::ENCODED_SIZE;
        if (header.total_size as usize) < header.inline_data_offset as usize
            || (header.inline_data_offset as usize) < desc_end
        {
            return Err(FramingError::Inconsistent("payload offsets overlap descriptors"));
        }
        if buf.len() < header.total_size as usize {
            return Err(FramingError::BufferTooSmall);
        }
        Ok(Self { buf, header })
    }

    /// The parsed header.
    pub fn header(&self) -> &LogGroupHeader {
        &self.header
    }

    /// Descriptor of the `n`th record in the group.
    pub fn record(&self, n: u32) -> Result<SerializedLogRecord, FramingError> {
        if n >= self.header.nrecords {
            return Err(FramingError::Inconsistent("record index out of range"));
        }
        let at = LogGroupHeader::ENCODED_SIZE + n as usize * SerializedLogRecord::ENCODED_SIZE;
        SerializedLogRecord::decode(&self.buf[at..])
    }

    /// Payload bytes of the `n`th record.
    pub fn payload(&self, n: u32) -> Result<&'a [u8], FramingError> {
        let rec = self.record(n)?;
        let data_offset = payload_offset(&self.header, &rec) as usize;
        let end = data_offset + rec.size as usize;
        if end > self.header.total_size as usize {
            return Err(FramingError::Inconsistent("payload extends past group"));
        }
        Ok(&self.buf[data_offset..end])
    }

    /// Recompute the group CRC and compare against the header.
    pub fn verify_crc(&self) -> bool {
        let crc = group_crc([
            &self.buf[LogGroupHeader::ENCODED_SIZE..self.header.total_size as usize],
        ]);
        crc == self.header.cur_grp_crc
    }
}

/// Absolute offset of a record payload within its group.
pub fn payload_offset(header: &LogGroupHeader, rec: &SerializedLogRecord) -> u32 {
    rec.offset + if rec.is_inlined { 0 } else { header.oob_data_offset }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> LogGroupHeader {
        LogGroupHeader {
            version: LOG_GROUP_VERSION,
            start_idx: 42,
            nrecords: 3,
            inline_data_offset: 136,
            oob_data_offset: 512,
            total_size: 700,
            group_size: 1024,
            prev_grp_crc: 0xdead_beef,
            cur_grp_crc: 0x0bad_cafe,
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header();
        let mut buf = [0u8; LogGroupHeader::ENCODED_SIZE];
        header.encode(&mut buf).unwrap();
        let decoded = LogGroupHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.end_idx(), 45);
    }

    #[test]
    fn test_header_magic_mismatch() {
        let header = sample_header();
        let mut buf = [0u8; LogGroupHeader::ENCODED_SIZE];
        header.encode(&mut buf).unwrap();
        buf[0] ^= 0xff;
        assert_eq!(
            LogGroupHeader::decode(&buf).unwrap_err(),
            FramingError::MagicMismatch
        );
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let header = sample_header();
        let mut buf = [0u8; LogGroupHeader::ENCODED_SIZE];
        header.encode(&mut buf).unwrap();
        buf[8..12].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(
            LogGroupHeader::decode(&buf).unwrap_err(),
            FramingError::UnsupportedVersion(99)
        );
    }

    #[test]
    fn test_record_roundtrip() {
        let rec = SerializedLogRecord {
            store_seq_num: -1,
            size: 128,
            offset: 4096,
            store_id: 7,
            is_inlined: false,
        };
        let mut buf = [0u8; SerializedLogRecord::ENCODED_SIZE];
        rec.encode(&mut buf).unwrap();
        assert_eq!(SerializedLogRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn test_payload_offset() {
        let header = sample_header();
        let inlined = SerializedLogRecord {
            store_seq_num: 0,
            size: 10,
            offset: 140,
            store_id: 1,
            is_inlined: true,
        };
        let oob = SerializedLogRecord {
            is_inlined: false,
            offset: 16,
            ..inlined
        };
        assert_eq!(payload_offset(&header, &inlined), 140);
        assert_eq!(payload_offset(&header, &oob), 512 + 16);
    }

    #[test]
    fn test_group_crc_is_incremental() {
        let whole = group_crc([&b"abcdef"[..]]);
        let split = group_crc([&b"abc"[..], &b"def"[..]]);
        assert_eq!(whole, split);
    }
}
