//
// This file contains common utilities for dealing with PostgreSQL WAL files
// and LSNs.
//
// Many of these functions have been copied from PostgreSQL, and rewritten in
// Rust. That's why they don't follow the usual Rust naming conventions, they
// have been named the same as the corresponding PostgreSQL functions instead.
//

use crate::pg_constants;
use crate::{TimeLineID, XLogSegNo};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use utils::lsn::Lsn;

pub const XLOG_FNAME_LEN: usize = 24;

pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = 24;
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = 40;
pub const XLOG_SIZE_OF_XLOG_RECORD: usize = 24;
/// Offset of xl_crc within XLogRecord: everything before it participates in
/// the record CRC.
pub const XLOG_RECORD_CRC_OFFS: usize = 4 + 4 + 8 + 1 + 1 + 2;

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    0x100000000u64 / wal_segsz_bytes as u64
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(segno: XLogSegNo, offset: usize, wal_segsz_bytes: usize) -> Lsn {
    Lsn(segno * (wal_segsz_bytes as u64) + (offset as u64))
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, log_segno: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        log_segno / XLogSegmentsPerXLogId(wal_segsz_bytes),
        log_segno % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

/// Name of the history file describing the ancestry of a timeline, relative
/// to the WAL directory.
#[allow(non_snake_case)]
pub fn TimeLineHistoryFileName(tli: TimeLineID) -> String {
    format!("{:>08X}.history", tli)
}

/// If the LSN points to the beginning of a page, shift it to the first
/// possible record position on that page; otherwise align it on the 8-byte
/// boundary required for WAL records.
pub fn normalize_lsn(lsn: Lsn, seg_sz: usize) -> Lsn {
    if lsn.block_offset() == 0 {
        let hdr_size = if lsn.segment_offset(seg_sz) == 0 {
            XLOG_SIZE_OF_XLOG_LONG_PHD
        } else {
            XLOG_SIZE_OF_XLOG_SHORT_PHD
        };
        lsn + hdr_size as u64
    } else {
        Lsn(lsn.0 + lsn.calc_padding(8u32))
    }
}

/// Fixed-size header at the start of every WAL record.
#[derive(Debug, Clone, Copy, Default)]
pub struct XLogRecord {
    pub xl_tot_len: u32,
    pub xl_xid: u32,
    pub xl_prev: u64,
    pub xl_info: u8,
    pub xl_rmid: u8,
    /* 2 bytes of padding here */
    pub xl_crc: u32,
}

impl XLogRecord {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogRecord {
        let xl_tot_len = buf.get_u32_le();
        let xl_xid = buf.get_u32_le();
        let xl_prev = buf.get_u64_le();
        let xl_info = buf.get_u8();
        let xl_rmid = buf.get_u8();
        buf.advance(2);
        let xl_crc = buf.get_u32_le();
        XLogRecord {
            xl_tot_len,
            xl_xid,
            xl_prev,
            xl_info,
            xl_rmid,
            xl_crc,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_RECORD);
        buf.put_u32_le(self.xl_tot_len);
        buf.put_u32_le(self.xl_xid);
        buf.put_u64_le(self.xl_prev);
        buf.put_u8(self.xl_info);
        buf.put_u8(self.xl_rmid);
        buf.put_u16_le(0);
        buf.put_u32_le(self.xl_crc);
        buf.freeze()
    }

    // Is this record an XLOG_SWITCH record? Those need special processing:
    // the rest of the segment after one is unused.
    pub fn is_xlog_switch_record(&self) -> bool {
        self.xl_info == pg_constants::XLOG_SWITCH && self.xl_rmid == pg_constants::RM_XLOG_ID
    }
}

/// Compute the CRC of a complete record: the payload after the header first,
/// then the header prefix up to (but not including) the xl_crc field.
pub fn record_crc(recordbuf: &[u8]) -> u32 {
    let crc = crc32c::crc32c(&recordbuf[XLOG_SIZE_OF_XLOG_RECORD..]);
    crc32c::crc32c_append(crc, &recordbuf[0..XLOG_RECORD_CRC_OFFS])
}

/// Header at the start of every WAL page.
#[derive(Debug, Clone, Copy, Default)]
pub struct XLogPageHeaderData {
    pub xlp_magic: u16,
    pub xlp_info: u16,
    pub xlp_tli: TimeLineID,
    pub xlp_pageaddr: u64,
    pub xlp_rem_len: u32,
    /* 4 bytes of padding here */
}

impl XLogPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogPageHeaderData {
        let hdr = XLogPageHeaderData {
            xlp_magic: buf.get_u16_le(),
            xlp_info: buf.get_u16_le(),
            xlp_tli: buf.get_u32_le(),
            xlp_pageaddr: buf.get_u64_le(),
            xlp_rem_len: buf.get_u32_le(),
        };
        // padding to MAXALIGN
        buf.advance(4);
        hdr
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_SHORT_PHD);
        buf.put_u16_le(self.xlp_magic);
        buf.put_u16_le(self.xlp_info);
        buf.put_u32_le(self.xlp_tli);
        buf.put_u64_le(self.xlp_pageaddr);
        buf.put_u32_le(self.xlp_rem_len);
        buf.put_u32_le(0);
        buf.freeze()
    }
}

/// Extended header at the start of every WAL segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct XLogLongPageHeaderData {
    pub std: XLogPageHeaderData,
    pub xlp_sysid: u64,
    pub xlp_seg_size: u32,
    pub xlp_xlog_blcksz: u32,
}

impl XLogLongPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogLongPageHeaderData {
        XLogLongPageHeaderData {
            std: XLogPageHeaderData::from_bytes(buf),
            xlp_sysid: buf.get_u64_le(),
            xlp_seg_size: buf.get_u32_le(),
            xlp_xlog_blcksz: buf.get_u32_le(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_LONG_PHD);
        buf.extend_from_slice(&self.std.encode());
        buf.put_u64_le(self.xlp_sysid);
        buf.put_u32_le(self.xlp_seg_size);
        buf.put_u32_le(self.xlp_xlog_blcksz);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WAL_SEGMENT_SIZE;

    #[test]
    fn test_xlog_file_name() {
        assert_eq!(
            XLogFileName(1, 1, WAL_SEGMENT_SIZE),
            "000000010000000000000001"
        );
        assert_eq!(
            XLogFileName(2, 0x100 + 5, WAL_SEGMENT_SIZE),
            "000000020000000100000005"
        );
        assert!(IsXLogFileName("000000010000000000000001"));
        assert!(!IsXLogFileName("00000001000000000000000"));
        assert!(!IsXLogFileName("000000010000000000000001.partial"));
    }

    #[test]
    fn test_history_file_name() {
        assert_eq!(TimeLineHistoryFileName(2), "00000002.history");
        assert_eq!(TimeLineHistoryFileName(0xAB), "000000AB.history");
    }

    #[test]
    fn test_normalize_lsn() {
        // segment start: skip the long header
        assert_eq!(
            normalize_lsn(Lsn(0x1000000), WAL_SEGMENT_SIZE),
            Lsn(0x1000000 + XLOG_SIZE_OF_XLOG_LONG_PHD as u64)
        );
        // page start: skip the short header
        assert_eq!(
            normalize_lsn(Lsn(0x1002000), WAL_SEGMENT_SIZE),
            Lsn(0x1002000 + XLOG_SIZE_OF_XLOG_SHORT_PHD as u64)
        );
        // mid-page: align to 8 bytes
        assert_eq!(normalize_lsn(Lsn(0x1002029), WAL_SEGMENT_SIZE), Lsn(0x1002030));
        assert_eq!(normalize_lsn(Lsn(0x1002030), WAL_SEGMENT_SIZE), Lsn(0x1002030));
    }

    #[test]
    fn test_record_header_roundtrip() {
        let rec = XLogRecord {
            xl_tot_len: 100,
            xl_xid: 42,
            xl_prev: 0x1000028,
            xl_info: pg_constants::XLOG_CHECKPOINT_SHUTDOWN,
            xl_rmid: pg_constants::RM_XLOG_ID,
            xl_crc: 0xDEADBEEF,
        };
        let bytes = rec.encode();
        assert_eq!(bytes.len(), XLOG_SIZE_OF_XLOG_RECORD);
        let decoded = XLogRecord::from_bytes(&mut bytes.clone());
        assert_eq!(decoded.xl_tot_len, 100);
        assert_eq!(decoded.xl_prev, 0x1000028);
        assert_eq!(decoded.xl_crc, 0xDEADBEEF);
    }
}
