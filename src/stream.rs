//! Sequential group reader used by recovery.
//!
//! The reader walks log groups from the recovery start offset, validating
//! each candidate header's magic, CRC and chain link against the previous
//! group. Any validation failure yields end-of-stream rather than an
//! error: a torn write at the tail looks exactly like that, and it is the
//! caller's post-scan probe that decides whether the end was legitimate.

use crate::buffer::round_up;
use crate::device::{block_on_io, LogDevice};
use crate::error::Result;
use crate::framing::{GroupView, LogGroupHeader};

pub(crate) struct LogStreamReader<'a, D: LogDevice> {
    device: &'a D,
    /// Offset of the next group candidate.
    cursor: u64,
    /// Offset probed by the post-tail scan, advanced one block at a time.
    scan_cursor: u64,
    /// Bytes fetched per probe read.
    probe_size: usize,
    last_crc: Option<u32>,
}

impl<'a, D: LogDevice> LogStreamReader<'a, D> {
    pub(crate) fn new(device: &'a D, start_offset: u64) -> Self {
        let align = device.align();
        let probe_size = round_up(4096.max(LogGroupHeader::ENCODED_SIZE), align);
        device.lseek(start_offset);
        Self {
            device,
            cursor: start_offset,
            scan_cursor: start_offset,
            probe_size,
            last_crc: None,
        }
    }

    /// Read and validate the group at the cursor. Returns the group's
    /// device offset and its bytes, or `None` at the apparent end of the
    /// log.
    pub(crate) fn next_group(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        let mut buf = vec![0u8; self.probe_size];
        block_on_io(self.device.read(self.cursor, &mut buf))?;

        let header = match LogGroupHeader::decode(&buf) {
            Ok(header) => header,
            Err(_) => return Ok(None),
        };
        if header.nrecords == 0
            || (header.total_size as usize) < LogGroupHeader::ENCODED_SIZE
            || header.group_size < header.total_size
        {
            return Ok(None);
        }
        if let Some(prev) = self.last_crc {
            if header.prev_grp_crc != prev {
                return Ok(None);
            }
        }

        let group_size = header.group_size as usize;
        if group_size > buf.len() {
            let mut full = vec![0u8; group_size];
            block_on_io(self.device.read(self.cursor, &mut full))?;
            buf = full;
        }

        let valid = match GroupView::parse(&buf[..header.total_size as usize]) {
            Ok(view) => view.verify_crc(),
            Err(_) => false,
        };
        if !valid {
            return Ok(None);
        }

        let offset = self.cursor;
        self.cursor += header.group_size as u64;
        self.scan_cursor = self.cursor;
        self.last_crc = Some(header.cur_grp_crc);
        self.device.lseek(self.cursor);
        buf.truncate(group_size);
        Ok(Some((offset, buf)))
    }

    /// Advance the probe cursor one aligned block and try to decode a
    /// group header there. Used after the apparent end of the log to
    /// detect valid data stranded past a corrupted block.
    pub(crate) fn group_in_next_page(&mut self) -> Result<Option<LogGroupHeader>> {
        self.scan_cursor += self.device.align() as u64;
        let mut buf = vec![0u8; round_up(LogGroupHeader::ENCODED_SIZE, self.device.align())];
        block_on_io(self.device.read(self.scan_cursor, &mut buf))?;
        Ok(LogGroupHeader::decode(&buf).ok())
    }

    /// Offset one past the last validated group.
    pub(crate) fn group_cursor(&self) -> u64 {
        self.cursor
    }

    /// CRC of the last validated group, if any.
    pub(crate) fn last_crc(&self) -> Option<u32> {
        self.last_crc
    }
}
