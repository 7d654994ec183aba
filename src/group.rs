//! Assembly of appended records into a single device write.
//!
//! A `LogGroup` accumulates records into the on-device group layout:
//! header, descriptor array sized by the caller's estimate, inline payload
//! copies, then references to out-of-band payloads which are emitted as
//! separate I/O vector entries without copying. `finish` seals the group,
//! stamping sizes, offsets and the CRC chain into the header.

use std::fmt;
use std::io::IoSlice;
use std::sync::Arc;

use crate::buffer::{round_up, AlignedBuffer};
use crate::config::LogDevConfig;
use crate::framing::{
    group_crc, LogGroupHeader, SerializedLogRecord, LOG_GROUP_VERSION,
};
use crate::tracker::LogRecord;

pub(crate) struct LogGroup {
    align: usize,
    inline_threshold: u32,
    max_group_size: u32,
    max_iovecs: usize,

    /// Header, descriptor array and inline payload region.
    head: AlignedBuffer,
    desc_capacity: u32,
    nrecords: u32,
    inline_used: u32,
    oob_payloads: Vec<Arc<[u8]>>,
    oob_used: u32,
    actual_data_size: u32,

    header: Option<LogGroupHeader>,
    tail_pad: Option<AlignedBuffer>,
    pad_len: usize,

    pub(crate) flush_log_idx_from: i64,
    pub(crate) flush_log_idx_upto: i64,
    pub(crate) log_dev_offset: u64,
}

impl LogGroup {
    /// Preallocate a group sized for `estimate` records.
    pub(crate) fn new(estimate: u32, align: usize, config: &LogDevConfig) -> Option<Self> {
        debug_assert!(estimate > 0);
        let desc_capacity = estimate.max(1);
        let head_size = round_up(
            LogGroupHeader::ENCODED_SIZE
                + desc_capacity as usize * SerializedLogRecord::ENCODED_SIZE
                + align,
            align,
        );
        let head = AlignedBuffer::zeroed(align, head_size)?;

        Some(Self {
            align,
            inline_threshold: config.inline_data_threshold,
            max_group_size: config.max_group_size,
            max_iovecs: config.max_iovecs,
            head,
            desc_capacity,
            nrecords: 0,
            inline_used: 0,
            oob_payloads: Vec::new(),
            oob_used: 0,
            actual_data_size: 0,
            header: None,
            tail_pad: None,
            pad_len: 0,
            flush_log_idx_from: -1,
            flush_log_idx_upto: -1,
            log_dev_offset: 0,
        })
    }

    /// Offset of the inline payload region, fixed by the descriptor
    /// capacity chosen at construction.
    fn inline_data_offset(&self) -> u32 {
        (LogGroupHeader::ENCODED_SIZE
            + self.desc_capacity as usize * SerializedLogRecord::ENCODED_SIZE) as u32
    }

    /// Try to add a record. Returns `false` when the group is full: the
    /// descriptor array is exhausted, the padded size would exceed the
    /// group cap, or the I/O vector would exceed the device limit. The
    /// caller stops adding on `false`; a partial group is legal.
    pub(crate) fn add_record(&mut self, idx: i64, record: &LogRecord) -> bool {
        if self.nrecords == self.desc_capacity {
            return false;
        }

        let size = record.size();
        let inlined = size < self.inline_threshold;

        let inline_used = self.inline_used + if inlined { size } else { 0 };
        let oob_used = self.oob_used + if inlined { 0 } else { size };
        let inline_end = self.inline_data_offset() + inline_used;
        let total = if oob_used > 0 {
            round_up(inline_end as usize, self.align) as u32 + oob_used
        } else {
            inline_end
        };
        if round_up(total as usize, self.align) as u32 > self.max_group_size {
            return false;
        }

        let oob_count = self.oob_payloads.len() + usize::from(!inlined);
        if 1 + oob_count + 1 > self.max_iovecs {
            return false;
        }

        let offset = if inlined {
            self.inline_data_offset() + self.inline_used
        } else {
            self.oob_used
        };
        let desc = SerializedLogRecord {
            store_seq_num: record.store_seq_num,
            size,
            offset,
            store_id: record.store_id,
            is_inlined: inlined,
        };

        if inlined {
            let end = offset as usize + size as usize;
            if !self.head.grow(end) {
                return false;
            }
            self.head.as_mut_slice()[offset as usize..end].copy_from_slice(&record.payload);
            self.inline_used += size;
        } else {
            self.oob_payloads.push(record.payload.clone());
            self.oob_used += size;
        }

        let desc_at = LogGroupHeader::ENCODED_SIZE
            + self.nrecords as usize * SerializedLogRecord::ENCODED_SIZE;
        desc.encode(&mut self.head.as_mut_slice()[desc_at..])
            .expect("descriptor area sized at construction");

        if self.nrecords == 0 {
            self.flush_log_idx_from = idx;
        }
        self.flush_log_idx_upto = idx;
        self.nrecords += 1;
        self.actual_data_size += size;
        true
    }

    /// Seal the group: compute offsets and sizes, stamp the CRC chain.
    /// Returns `false` for an empty group, which must be abandoned.
    pub(crate) fn finish(&mut self, prev_grp_crc: u32) -> bool {
        if self.nrecords == 0 {
            return false;
        }

        let inline_end = (self.inline_data_offset() + self.inline_used) as usize;
        let oob_data_offset = round_up(inline_end, self.align);
        let total_size = if self.oob_used > 0 {
            oob_data_offset + self.oob_used as usize
        } else {
            inline_end
        };
        let group_size = round_up(total_size, self.align);

        // Zero padding between inline end and the out-of-band region, and
        // the trailing pad when everything is inline, both come from the
        // head buffer's zeroed spare capacity.
        let head_needed = if self.oob_used > 0 {
            oob_data_offset
        } else {
            group_size
        };
        if !self.head.grow(head_needed) {
            return false;
        }

        let pad_len = group_size - total_size;
        if self.oob_used > 0 && pad_len > 0 {
            self.tail_pad = AlignedBuffer::zeroed(self.align, self.align);
            if self.tail_pad.is_none() {
                return false;
            }
            self.pad_len = pad_len;
        }

        let mut header = LogGroupHeader {
            version: LOG_GROUP_VERSION,
            start_idx: self.flush_log_idx_from,
            nrecords: self.nrecords,
            inline_data_offset: self.inline_data_offset(),
            oob_data_offset: oob_data_offset as u32,
            total_size: total_size as u32,
            group_size: group_size as u32,
            prev_grp_crc,
            cur_grp_crc: 0,
        };

        let head_crc_end = if self.oob_used > 0 {
            oob_data_offset
        } else {
            total_size
        };
        let mut parts: Vec<&[u8]> =
            vec![&self.head.as_slice()[LogGroupHeader::ENCODED_SIZE..head_crc_end]];
        for payload in &self.oob_payloads {
            parts.push(payload);
        }
        header.cur_grp_crc = group_crc(parts);

        header
            .encode(self.head.as_mut_slice())
            .expect("head buffer holds at least one header");
        self.header = Some(header);
        true
    }

    /// Header of a sealed group.
    pub(crate) fn header(&self) -> &LogGroupHeader {
        self.header.as_ref().expect("group not finished")
    }

    /// Padded size of the sealed group.
    pub(crate) fn group_size(&self) -> u32 {
        self.header().group_size
    }

    /// Sum of the payload bytes accepted into the group.
    pub(crate) fn actual_data_size(&self) -> u32 {
        self.actual_data_size
    }

    pub(crate) fn nrecords(&self) -> u32 {
        self.nrecords
    }

    /// I/O vector covering the sealed group image, padding included.
    pub(crate) fn iovecs(&self) -> Vec<IoSlice<'_>> {
        let header = self.header();
        let mut iovs = Vec::with_capacity(2 + self.oob_payloads.len());
        if self.oob_used > 0 {
            iovs.push(IoSlice::new(
                &self.head.as_slice()[..header.oob_data_offset as usize],
            ));
            for payload in &self.oob_payloads {
                iovs.push(IoSlice::new(payload));
            }
            if let Some(pad) = &self.tail_pad {
                iovs.push(IoSlice::new(&pad.as_slice()[..self.pad_len]));
            }
        } else {
            iovs.push(IoSlice::new(
                &self.head.as_slice()[..header.group_size as usize],
            ));
        }
        iovs
    }
}

impl fmt::Display for LogGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.header {
            Some(header) => write!(
                f,
                "LogGroup[idx=[{}..{}] {} dev_offset={}]",
                self.flush_log_idx_from, self.flush_log_idx_upto, header, self.log_dev_offset
            ),
            None => write!(
                f,
                "LogGroup[open nrecords={} data_size={}]",
                self.nrecords, self.actual_data_size
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::GroupView;
    use crate::tracker::RecordState;

    const ALIGN: usize = 512;

    fn record(store_id: u32, seq: i64, payload: Vec<u8>) -> LogRecord {
        LogRecord {
            store_id,
            store_seq_num: seq,
            payload: Arc::from(payload.into_boxed_slice()),
            context: 0,
            state: RecordState::Active,
        }
    }

    fn flatten(group: &LogGroup) -> Vec<u8> {
        let mut image = Vec::new();
        for iov in group.iovecs() {
            image.extend_from_slice(&iov);
        }
        image
    }

    #[test]
    fn test_inline_only_group() {
        let config = LogDevConfig::default();
        let mut group = LogGroup::new(4, ALIGN, &config).unwrap();

        assert!(group.add_record(10, &record(1, 0, b"alpha".to_vec())));
        assert!(group.add_record(11, &record(2, 5, b"beta".to_vec())));
        assert!(group.finish(0x1111));

        let image = flatten(&group);
        assert_eq!(image.len() % ALIGN, 0);
        assert_eq!(image.len(), group.group_size() as usize);

        let view = GroupView::parse(&image).unwrap();
        assert!(view.verify_crc());
        assert_eq!(view.header().start_idx, 10);
        assert_eq!(view.header().nrecords, 2);
        assert_eq!(view.header().prev_grp_crc, 0x1111);
        assert_eq!(view.payload(0).unwrap(), b"alpha");
        assert_eq!(view.payload(1).unwrap(), b"beta");
        assert!(view.record(0).unwrap().is_inlined);
    }

    #[test]
    fn test_oob_payload_group() {
        let config = LogDevConfig::default();
        let mut group = LogGroup::new(4, ALIGN, &config).unwrap();

        let big = vec![0xCD; config.inline_data_threshold as usize * 3];
        assert!(group.add_record(0, &record(1, 0, b"tiny".to_vec())));
        assert!(group.add_record(1, &record(1, 1, big.clone())));
        assert!(group.finish(0));

        let image = flatten(&group);
        assert_eq!(image.len() % ALIGN, 0);

        let view = GroupView::parse(&image).unwrap();
        assert!(view.verify_crc());
        assert_eq!(view.header().oob_data_offset as usize % ALIGN, 0);

        let rec = view.record(1).unwrap();
        assert!(!rec.is_inlined);
        assert_eq!(view.payload(1).unwrap(), &big[..]);
        assert_eq!(view.payload(0).unwrap(), b"tiny");
    }

    #[test]
    fn test_descriptor_capacity_rejects() {
        let config = LogDevConfig::default();
        let mut group = LogGroup::new(2, ALIGN, &config).unwrap();

        assert!(group.add_record(0, &record(1, 0, b"a".to_vec())));
        assert!(group.add_record(1, &record(1, 1, b"b".to_vec())));
        assert!(!group.add_record(2, &record(1, 2, b"c".to_vec())));
        assert_eq!(group.nrecords(), 2);
    }

    #[test]
    fn test_max_group_size_rejects() {
        let config = LogDevConfig {
            max_group_size: 2048,
            ..LogDevConfig::default()
        };
        let mut group = LogGroup::new(8, ALIGN, &config).unwrap();

        assert!(group.add_record(0, &record(1, 0, vec![1u8; 1024])));
        assert!(!group.add_record(1, &record(1, 1, vec![2u8; 4096])));
    }

    #[test]
    fn test_max_iovecs_rejects() {
        let config = LogDevConfig {
            max_iovecs: 3,
            ..LogDevConfig::default()
        };
        let mut group = LogGroup::new(8, ALIGN, &config).unwrap();
        let big = vec![9u8; config.inline_data_threshold as usize * 2];

        // head + one out-of-band payload + pad fills the vector
        assert!(group.add_record(0, &record(1, 0, big.clone())));
        assert!(!group.add_record(1, &record(1, 1, big)));
    }

    #[test]
    fn test_empty_group_is_sentinel() {
        let config = LogDevConfig::default();
        let mut group = LogGroup::new(4, ALIGN, &config).unwrap();
        assert!(!group.finish(0));
    }

    #[test]
    fn test_crc_chains_between_groups() {
        let config = LogDevConfig::default();

        let mut first = LogGroup::new(2, ALIGN, &config).unwrap();
        assert!(first.add_record(0, &record(1, 0, b"one".to_vec())));
        assert!(first.finish(0));

        let mut second = LogGroup::new(2, ALIGN, &config).unwrap();
        assert!(second.add_record(1, &record(1, 1, b"two".to_vec())));
        assert!(second.finish(first.header().cur_grp_crc));

        assert_eq!(second.header().prev_grp_crc, first.header().cur_grp_crc);
    }
}
