//!
//! Reassembling WAL records from a stream of WAL pages, and picking a
//! decoded record apart into the blocks it references.
//!
//! The overall layout of a WAL record is:
//!     Fixed-size header (XLogRecord struct)
//!     XLogRecordBlockHeader struct
//!         If BKPBLOCK_HAS_IMAGE, an XLogRecordBlockImageHeader follows
//!             If BKPIMAGE_HAS_HOLE and BKPIMAGE_IS_COMPRESSED, an
//!             XLogRecordBlockCompressHeader follows.
//!         If BKPBLOCK_SAME_REL is not set, a RelFileNode follows
//!         BlockNumber follows
//!     XLogRecordBlockHeader struct
//!     ...
//!     XLogRecordDataHeader[Short|Long] struct
//!     block data
//!     ...
//!     main data
//!
//! See xlogrecord.h for details.
//!

use crate::pg_constants;
use crate::xlog_utils::{
    record_crc, XLogLongPageHeaderData, XLogPageHeaderData, XLogRecord,
    XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_RECORD, XLOG_SIZE_OF_XLOG_SHORT_PHD,
};
use crate::{RelFileNode, WAL_SEGMENT_SIZE};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::cmp::min;
use thiserror::Error;
use utils::lsn::Lsn;

#[derive(Error, Debug, Clone)]
#[error("{msg} at {lsn}")]
pub struct WalDecodeError {
    pub msg: String,
    pub lsn: Lsn,
}

///
/// Assembles whole WAL records from chunks of a WAL byte stream.
///
/// Feed bytes with `feed_bytes`, pull records out with `poll_decode`. The
/// stream must begin exactly at a valid record position; page headers
/// embedded in the stream are parsed and validated as they pass by.
///
pub struct WalStreamDecoder {
    lsn: Lsn,

    startlsn: Lsn, // LSN where the record being assembled starts
    contlen: u32,
    padlen: u32,

    eof: bool,

    inputbuf: BytesMut,
    recordbuf: BytesMut,
}

impl WalStreamDecoder {
    pub fn new(lsn: Lsn) -> WalStreamDecoder {
        WalStreamDecoder {
            lsn,
            startlsn: Lsn(0),
            contlen: 0,
            padlen: 0,
            eof: false,
            inputbuf: BytesMut::new(),
            recordbuf: BytesMut::new(),
        }
    }

    /// The position up to which the stream has been consumed.
    pub fn position(&self) -> Lsn {
        self.lsn
    }

    /// True once the decoder has seen the zero filler that follows the last
    /// record of the stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn feed_bytes(&mut self, buf: &[u8]) {
        self.inputbuf.extend_from_slice(buf);
    }

    /// Attempt to decode another WAL record from the input fed so far.
    ///
    /// Returns one of the following:
    ///     Ok(Some((start_lsn, end_lsn, recordbuf))): the next record
    ///     Ok(None): not enough data, or end of WAL (check `is_eof`)
    ///     Err(WalDecodeError): the input was invalid
    ///
    pub fn poll_decode(&mut self) -> Result<Option<(Lsn, Lsn, Bytes)>, WalDecodeError> {
        if self.eof {
            return Ok(None);
        }
        loop {
            // parse and verify page boundaries as we go
            if self.lsn.segment_offset(WAL_SEGMENT_SIZE) == 0 {
                if self.inputbuf.remaining() < XLOG_SIZE_OF_XLOG_LONG_PHD {
                    return Ok(None);
                }

                let hdr = XLogLongPageHeaderData::from_bytes(&mut self.inputbuf);
                self.validate_page_header(&hdr.std)?;
                self.lsn += XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
                continue;
            } else if self.lsn.block_offset() == 0 {
                if self.inputbuf.remaining() < XLOG_SIZE_OF_XLOG_SHORT_PHD {
                    return Ok(None);
                }

                let hdr = XLogPageHeaderData::from_bytes(&mut self.inputbuf);
                self.validate_page_header(&hdr)?;
                self.lsn += XLOG_SIZE_OF_XLOG_SHORT_PHD as u64;
                continue;
            } else if self.padlen > 0 {
                if self.inputbuf.remaining() < self.padlen as usize {
                    return Ok(None);
                }

                // skip padding
                self.inputbuf.advance(self.padlen as usize);
                self.lsn += self.padlen as u64;
                self.padlen = 0;
            } else if self.contlen == 0 {
                // need to have at least the xl_tot_len field
                if self.inputbuf.remaining() < 4 {
                    return Ok(None);
                }

                self.startlsn = self.lsn;
                let xl_tot_len = self.inputbuf.get_u32_le();
                if xl_tot_len == 0 {
                    // Reached the zero filler past the last record.
                    self.eof = true;
                    return Ok(None);
                }
                if (xl_tot_len as usize) < XLOG_SIZE_OF_XLOG_RECORD {
                    return Err(WalDecodeError {
                        msg: format!("invalid xl_tot_len {}", xl_tot_len),
                        lsn: self.lsn,
                    });
                }
                self.lsn += 4;

                self.recordbuf.clear();
                self.recordbuf.reserve(xl_tot_len as usize);
                self.recordbuf.put_u32_le(xl_tot_len);

                self.contlen = xl_tot_len - 4;
                continue;
            } else {
                // we're continuing a record, possibly from the previous page.
                let pageleft = self.lsn.remaining_in_block() as u32;

                // read the rest of the record, or as much as fits on this page.
                let n = min(self.contlen, pageleft) as usize;
                if self.inputbuf.remaining() < n {
                    return Ok(None);
                }

                self.recordbuf.put(self.inputbuf.split_to(n));
                self.lsn += n as u64;
                self.contlen -= n as u32;

                if self.contlen == 0 {
                    let recordbuf = std::mem::take(&mut self.recordbuf).freeze();

                    let mut buf = recordbuf.clone();
                    let xlogrec = XLogRecord::from_bytes(&mut buf);

                    let crc = record_crc(&recordbuf);
                    if crc != xlogrec.xl_crc {
                        return Err(WalDecodeError {
                            msg: format!(
                                "WAL record CRC mismatch: expected {:08X}, was {:08X}",
                                crc, xlogrec.xl_crc
                            ),
                            lsn: self.startlsn,
                        });
                    }

                    // XLOG_SWITCH records are special: the rest of the
                    // segment after one is unused, skip to the next one.
                    if xlogrec.is_xlog_switch_record() {
                        self.padlen = self.lsn.calc_padding(WAL_SEGMENT_SIZE as u64) as u32;
                    } else {
                        // Pad to an 8-byte boundary
                        self.padlen = self.lsn.calc_padding(8u32) as u32;
                    }

                    return Ok(Some((self.startlsn, self.lsn, recordbuf)));
                }
                continue;
            }
        }
    }

    fn validate_page_header(&self, hdr: &XLogPageHeaderData) -> Result<(), WalDecodeError> {
        if hdr.xlp_magic != pg_constants::XLOG_PAGE_MAGIC {
            return Err(WalDecodeError {
                msg: format!("invalid WAL page magic {:04X}", hdr.xlp_magic),
                lsn: self.lsn,
            });
        }
        if hdr.xlp_pageaddr != self.lsn.0 {
            return Err(WalDecodeError {
                msg: format!(
                    "unexpected WAL page address {}",
                    Lsn(hdr.xlp_pageaddr)
                ),
                lsn: self.lsn,
            });
        }
        if self.contlen > 0 && (hdr.xlp_info & pg_constants::XLP_FIRST_IS_CONTRECORD) == 0 {
            return Err(WalDecodeError {
                msg: "there is no contrecord flag at continuation page".into(),
                lsn: self.lsn,
            });
        }
        Ok(())
    }
}

/// One block reference carried by a decoded WAL record.
#[derive(Debug)]
pub struct DecodedBkpBlock {
    /* Identify the block this refers to */
    pub rnode: RelFileNode,
    pub forknum: u8,
    pub blkno: u32,

    /* copy of the fork_flags field from the XLogRecordBlockHeader */
    pub flags: u8,

    /* Information on full-page image, if any */
    pub has_image: bool,
    pub will_init: bool,
    pub hole_offset: u16,
    pub hole_length: u16,
    pub bimg_len: u16,
    pub bimg_info: u8,

    /* rmgr-specific data attached to this block */
    pub has_data: bool,
    pub data_len: u16,
}

/// A WAL record picked apart into its header fields and block references.
pub struct DecodedWALRecord {
    pub xl_xid: u32,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub xl_prev: Lsn,
    pub record: Bytes, // the raw record, headers and all

    pub blocks: Vec<DecodedBkpBlock>,
    pub main_data_offset: usize,
}

///
/// Decode a WAL record to figure out which blocks it modifies.
///
/// The block references are parsed from the uniform per-record block header
/// stream; the rmgr-specific payloads are not interpreted.
///
pub fn decode_wal_record(record: Bytes, lsn: Lsn) -> anyhow::Result<DecodedWALRecord> {
    let mut rnode = RelFileNode {
        spcnode: 0,
        dbnode: 0,
        relnode: 0,
    };
    let mut got_rnode = false;

    let mut buf = record.clone();

    // 1. Parse the XLogRecord struct
    let xlogrec = XLogRecord::from_bytes(&mut buf);
    let remaining = xlogrec.xl_tot_len as usize - XLOG_SIZE_OF_XLOG_RECORD;
    anyhow::ensure!(
        buf.remaining() == remaining,
        "WAL record at {} has length {} but xl_tot_len says {}",
        lsn,
        record.len(),
        xlogrec.xl_tot_len
    );

    let mut max_block_id: Option<u8> = None;
    let mut main_data_len: u32 = 0;
    let mut datatotal: u32 = 0;
    let mut blocks: Vec<DecodedBkpBlock> = Vec::new();

    // 2. Decode the headers: XLogRecordBlockHeaders if any, then
    // XLogRecordDataHeader[Short|Long].
    while buf.remaining() > datatotal as usize {
        let block_id = buf.get_u8();

        match block_id {
            pg_constants::XLR_BLOCK_ID_DATA_SHORT => {
                main_data_len = buf.get_u8() as u32;
                datatotal += main_data_len;
            }

            pg_constants::XLR_BLOCK_ID_DATA_LONG => {
                main_data_len = buf.get_u32_le();
                datatotal += main_data_len;
            }

            pg_constants::XLR_BLOCK_ID_ORIGIN => {
                // RepOriginId is uint16
                buf.advance(2);
            }

            0..=pg_constants::XLR_MAX_BLOCK_ID => {
                /* XLogRecordBlockHeader */
                if Some(block_id) <= max_block_id {
                    anyhow::bail!("out-of-order block_id {} in WAL record at {}", block_id, lsn);
                }
                max_block_id = Some(block_id);

                let fork_flags = buf.get_u8();
                let data_len = buf.get_u16_le();
                let mut blk = DecodedBkpBlock {
                    rnode,
                    forknum: fork_flags & pg_constants::BKPBLOCK_FORK_MASK,
                    blkno: 0,
                    flags: fork_flags,
                    has_image: (fork_flags & pg_constants::BKPBLOCK_HAS_IMAGE) != 0,
                    will_init: (fork_flags & pg_constants::BKPBLOCK_WILL_INIT) != 0,
                    hole_offset: 0,
                    hole_length: 0,
                    bimg_len: 0,
                    bimg_info: 0,
                    has_data: (fork_flags & pg_constants::BKPBLOCK_HAS_DATA) != 0,
                    data_len,
                };
                anyhow::ensure!(
                    blk.has_data == (data_len > 0),
                    "BKPBLOCK_HAS_DATA set, but no data included in WAL record at {}",
                    lsn
                );
                datatotal += data_len as u32;

                if blk.has_image {
                    blk.bimg_len = buf.get_u16_le();
                    blk.hole_offset = buf.get_u16_le();
                    blk.bimg_info = buf.get_u8();

                    if blk.bimg_info & pg_constants::BKPIMAGE_IS_COMPRESSED != 0 {
                        if blk.bimg_info & pg_constants::BKPIMAGE_HAS_HOLE != 0 {
                            blk.hole_length = buf.get_u16_le();
                        }
                    } else {
                        blk.hole_length = crate::BLCKSZ as u16 - blk.bimg_len;
                    }
                    datatotal += blk.bimg_len as u32;
                }

                if fork_flags & pg_constants::BKPBLOCK_SAME_REL == 0 {
                    rnode.spcnode = buf.get_u32_le();
                    rnode.dbnode = buf.get_u32_le();
                    rnode.relnode = buf.get_u32_le();
                    blk.rnode = rnode;
                    got_rnode = true;
                } else if !got_rnode {
                    anyhow::bail!(
                        "BKPBLOCK_SAME_REL set but no previous rel in WAL record at {}",
                        lsn
                    );
                }

                blk.blkno = buf.get_u32_le();
                blocks.push(blk);
            }

            _ => {
                anyhow::bail!("invalid block_id {} in WAL record at {}", block_id, lsn);
            }
        }
    }

    // 3. The block data and main data follow the headers; we only need to
    // know where the main data starts.
    let main_data_offset = (xlogrec.xl_tot_len - main_data_len) as usize;

    Ok(DecodedWALRecord {
        xl_xid: xlogrec.xl_xid,
        xl_info: xlogrec.xl_info,
        xl_rmid: xlogrec.xl_rmid,
        xl_prev: Lsn(xlogrec.xl_prev),
        record,
        blocks,
        main_data_offset,
    })
}
