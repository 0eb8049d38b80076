//!
//! Generation of syntactically valid WAL, record by record.
//!
//! This exists for tests: crafting a WAL stream by hand is the only way to
//! exercise the record reassembly and block extraction code without a
//! running server. The generator produces exactly the format the decoder
//! consumes: long headers at segment starts, short headers with contrecord
//! flags on every page, 8-byte record alignment, and correct record CRCs.
//!

use crate::pg_constants;
use crate::xlog_utils::{
    record_crc, XLogFileName, XLogLongPageHeaderData, XLogPageHeaderData, XLogRecord,
    XLOG_RECORD_CRC_OFFS, XLOG_SIZE_OF_XLOG_RECORD,
};
use crate::{CheckPoint, RelFileNode, TimeLineID, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};

use bytes::{BufMut, Bytes, BytesMut};
use std::cmp::min;
use std::fs;
use std::path::Path;
use utils::lsn::Lsn;

pub struct WalGenerator {
    tli: TimeLineID,
    system_id: u64,
    start_lsn: Lsn,
    buf: BytesMut,
    lsn: Lsn,
    prev_lsn: Lsn,
}

impl WalGenerator {
    /// Start generating WAL at the beginning of segment 1 (segment 0 is
    /// never used by Postgres).
    pub fn new(tli: TimeLineID, system_id: u64) -> WalGenerator {
        let start_lsn = Lsn(WAL_SEGMENT_SIZE as u64);
        WalGenerator {
            tli,
            system_id,
            start_lsn,
            buf: BytesMut::new(),
            lsn: start_lsn,
            prev_lsn: Lsn(0),
        }
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Current insert position.
    pub fn position(&self) -> Lsn {
        self.lsn
    }

    /// Where the next appended record will start: the insert position,
    /// adjusted for the page header that would be written first.
    pub fn next_record_position(&self) -> Lsn {
        if self.lsn.block_offset() == 0 {
            if self.lsn.segment_offset(WAL_SEGMENT_SIZE) == 0 {
                self.lsn + crate::xlog_utils::XLOG_SIZE_OF_XLOG_LONG_PHD as u64
            } else {
                self.lsn + crate::xlog_utils::XLOG_SIZE_OF_XLOG_SHORT_PHD as u64
            }
        } else {
            self.lsn
        }
    }

    /// Append a record with the given resource manager, info bits, block
    /// references and main data. Returns the (start, end) LSNs of the
    /// record, end taken before alignment padding.
    pub fn append_record(
        &mut self,
        rmid: u8,
        info: u8,
        blocks: &[(RelFileNode, u8, u32)],
        main_data: &[u8],
    ) -> (Lsn, Lsn) {
        let mut body = BytesMut::new();
        for (i, (rnode, forknum, blkno)) in blocks.iter().enumerate() {
            body.put_u8(i as u8); // block_id
            body.put_u8(forknum & pg_constants::BKPBLOCK_FORK_MASK); // fork_flags
            body.put_u16_le(0); // data_len
            body.put_u32_le(rnode.spcnode);
            body.put_u32_le(rnode.dbnode);
            body.put_u32_le(rnode.relnode);
            body.put_u32_le(*blkno);
        }
        if !main_data.is_empty() {
            if main_data.len() <= u8::MAX as usize {
                body.put_u8(pg_constants::XLR_BLOCK_ID_DATA_SHORT);
                body.put_u8(main_data.len() as u8);
            } else {
                body.put_u8(pg_constants::XLR_BLOCK_ID_DATA_LONG);
                body.put_u32_le(main_data.len() as u32);
            }
            body.extend_from_slice(main_data);
        }

        let header = XLogRecord {
            xl_tot_len: (XLOG_SIZE_OF_XLOG_RECORD + body.len()) as u32,
            xl_xid: 0,
            xl_prev: self.prev_lsn.0,
            xl_info: info,
            xl_rmid: rmid,
            xl_crc: 0,
        };
        let mut record = BytesMut::with_capacity(header.xl_tot_len as usize);
        record.extend_from_slice(&header.encode());
        record.extend_from_slice(&body);
        let crc = record_crc(&record);
        record[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4].copy_from_slice(&crc.to_le_bytes());

        self.append_raw(&record)
    }

    /// Append a shutdown checkpoint record. As for a real shutdown
    /// checkpoint, the redo pointer is the record's own location.
    pub fn append_checkpoint(&mut self) -> (Lsn, Lsn) {
        let chk = CheckPoint {
            redo: self.next_record_position().0,
            this_timeline_id: self.tli,
            full_page_writes: 1,
            ..Default::default()
        };
        self.append_record(
            pg_constants::RM_XLOG_ID,
            pg_constants::XLOG_CHECKPOINT_SHUTDOWN,
            &[],
            &chk.encode(),
        )
    }

    /// Lay the record bytes down at the insert position, inserting page
    /// headers wherever the record crosses a page boundary.
    fn append_raw(&mut self, rec: &[u8]) -> (Lsn, Lsn) {
        if self.lsn.block_offset() == 0 {
            self.emit_page_header(0);
        }
        let start = self.lsn;

        let mut off = 0;
        while off < rec.len() {
            let space = self.lsn.remaining_in_block() as usize;
            let n = min(space, rec.len() - off);
            self.buf.extend_from_slice(&rec[off..off + n]);
            self.lsn += n as u64;
            off += n;
            if off < rec.len() {
                self.emit_page_header((rec.len() - off) as u32);
            }
        }
        let end = self.lsn;

        // align the next record on an 8-byte boundary
        let padding = self.lsn.calc_padding(8u32);
        self.buf.extend_from_slice(&[0u8; 8][..padding as usize]);
        self.lsn += padding;

        self.prev_lsn = start;
        (start, end)
    }

    /// Write the page header for the page the insert position is at.
    /// `rem_len` is the number of record bytes still to be continued onto
    /// this page.
    fn emit_page_header(&mut self, rem_len: u32) {
        let mut info = 0u16;
        if rem_len > 0 {
            info |= pg_constants::XLP_FIRST_IS_CONTRECORD;
        }
        let std = XLogPageHeaderData {
            xlp_magic: pg_constants::XLOG_PAGE_MAGIC,
            xlp_info: info,
            xlp_tli: self.tli,
            xlp_pageaddr: self.lsn.0,
            xlp_rem_len: rem_len,
        };
        if self.lsn.segment_offset(WAL_SEGMENT_SIZE) == 0 {
            let hdr = XLogLongPageHeaderData {
                std: XLogPageHeaderData {
                    xlp_info: info | pg_constants::XLP_LONG_HEADER,
                    ..std
                },
                xlp_sysid: self.system_id,
                xlp_seg_size: WAL_SEGMENT_SIZE as u32,
                xlp_xlog_blcksz: XLOG_BLCKSZ as u32,
            };
            let bytes = hdr.encode();
            self.buf.extend_from_slice(&bytes);
            self.lsn += bytes.len() as u64;
        } else {
            let bytes = std.encode();
            self.buf.extend_from_slice(&bytes);
            self.lsn += bytes.len() as u64;
        }
    }

    /// The linear WAL image produced so far, starting at `start_lsn`.
    pub fn wal_image(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// Chop the generated WAL into segment files, the last one zero-padded
    /// to the full segment size.
    pub fn segments(&self) -> Vec<(String, Bytes)> {
        let mut image = BytesMut::from(&self.buf[..]);
        let padded_len = image.len().next_multiple_of(WAL_SEGMENT_SIZE).max(WAL_SEGMENT_SIZE);
        image.resize(padded_len, 0);
        let image = image.freeze();

        let start_segno = self.start_lsn.segment_number(WAL_SEGMENT_SIZE);
        image
            .chunks(WAL_SEGMENT_SIZE)
            .enumerate()
            .map(|(i, seg)| {
                (
                    XLogFileName(self.tli, start_segno + i as u64, WAL_SEGMENT_SIZE),
                    Bytes::copy_from_slice(seg),
                )
            })
            .collect()
    }

    /// Write the segment files into a WAL directory.
    pub fn write_segments(&self, wal_dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(wal_dir)?;
        for (fname, content) in self.segments() {
            fs::write(wal_dir.join(fname), &content)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_are_full_size() {
        let mut gen = WalGenerator::new(1, 7);
        gen.append_checkpoint();
        let segs = gen.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].0, "000000010000000000000001");
        assert_eq!(segs[0].1.len(), WAL_SEGMENT_SIZE);
    }

    #[test]
    fn records_are_aligned() {
        let mut gen = WalGenerator::new(1, 7);
        let (_, _) = gen.append_record(pg_constants::RM_XLOG_ID, 0, &[], b"xyz");
        let (start2, _) = gen.append_record(pg_constants::RM_XLOG_ID, 0, &[], b"abc");
        assert_eq!(start2.0 % 8, 0);
    }
}
