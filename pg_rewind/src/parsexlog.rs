//!
//! Functions for reading the target cluster's Write-Ahead-Log.
//!
//! The WAL is consumed from the segment files under `<datadir>/pg_xlog`,
//! record by record. The only thing we ever do with a record is look at
//! which blocks it references; nothing is replayed.
//!

use std::cmp::min;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};

use postgres_ffi::pg_constants;
use postgres_ffi::waldecoder::{decode_wal_record, DecodedWALRecord, WalStreamDecoder};
use postgres_ffi::xlog_utils::{normalize_lsn, XLogFileName, XLogRecord};
use postgres_ffi::{CheckPoint, TimeLineID, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};
use utils::lsn::Lsn;

use crate::filemap::FileMap;

/// Sequential reader over the on-disk WAL of one timeline.
struct WalStreamReader {
    wal_dir: Utf8PathBuf,
    tli: TimeLineID,
    pos: Lsn,
    file: Option<File>,
}

impl WalStreamReader {
    fn new(datadir: &Utf8Path, tli: TimeLineID, start: Lsn) -> WalStreamReader {
        WalStreamReader {
            wal_dir: datadir.join("pg_xlog"),
            tli,
            pos: start,
            file: None,
        }
    }

    /// Read the next chunk of WAL into `buf`. Returns Ok(None) when there
    /// are no further segments on disk.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let segno = self.pos.segment_number(WAL_SEGMENT_SIZE);
        let xlogoff = self.pos.segment_offset(WAL_SEGMENT_SIZE);

        if self.file.is_none() {
            let path = self.wal_dir.join(XLogFileName(self.tli, segno, WAL_SEGMENT_SIZE));
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(e).with_context(|| format!("could not open file \"{}\"", path))
                }
            };
            file.seek(SeekFrom::Start(xlogoff as u64))
                .with_context(|| format!("could not seek in file \"{}\"", path))?;
            self.file = Some(file);
        }

        let len = min(buf.len(), WAL_SEGMENT_SIZE - xlogoff);
        let n = self
            .file
            .as_mut()
            .unwrap()
            .read(&mut buf[..len])
            .context("could not read WAL")?;
        if n == 0 {
            // segment file shorter than a segment; treat as end of WAL
            return Ok(None);
        }

        self.pos += n as u64;
        if self.pos.segment_offset(WAL_SEGMENT_SIZE) == 0 {
            self.file = None;
        }
        Ok(Some(n))
    }
}

/// Read the single WAL record starting at `ptr`.
fn read_record_at(
    datadir: &Utf8Path,
    ptr: Lsn,
    tli: TimeLineID,
) -> Result<(Lsn, Lsn, Bytes)> {
    let mut reader = WalStreamReader::new(datadir, tli, ptr);
    let mut decoder = WalStreamDecoder::new(ptr);
    let mut buf = [0u8; XLOG_BLCKSZ];

    loop {
        if let Some(rec) = decoder.poll_decode()? {
            return Ok(rec);
        }
        if decoder.is_eof() {
            bail!("could not read WAL record at {}: end of WAL", ptr);
        }
        match reader.read_chunk(&mut buf)? {
            Some(n) => decoder.feed_bytes(&buf[..n]),
            None => bail!("could not read WAL record at {}: no WAL on disk", ptr),
        }
    }
}

///
/// Read the WAL starting at `startpoint` on timeline `tli`, up to
/// `endpoint`, and mark every data block referenced by it in the file map.
///
/// The scan stops at the first record that starts at or past `endpoint`,
/// or at the end of the WAL on disk, whichever comes first. Any malformed
/// record is fatal: an incomplete page map must never be acted on.
///
pub fn extract_page_map(
    datadir: &Utf8Path,
    startpoint: Lsn,
    tli: TimeLineID,
    endpoint: Lsn,
    map: &mut FileMap,
) -> Result<()> {
    let mut reader = WalStreamReader::new(datadir, tli, startpoint);
    let mut decoder = WalStreamDecoder::new(startpoint);
    let mut buf = [0u8; XLOG_BLCKSZ];
    let mut nrecords: u64 = 0;

    loop {
        match decoder.poll_decode()? {
            Some((start, _end, recordbuf)) => {
                if start >= endpoint {
                    break;
                }
                let decoded = decode_wal_record(recordbuf, start)?;
                extract_page_info(&decoded, start, map)?;
                nrecords += 1;
            }
            None if decoder.is_eof() => break,
            None => match reader.read_chunk(&mut buf)? {
                Some(n) => decoder.feed_bytes(&buf[..n]),
                None => break,
            },
        }
    }

    if nrecords == 0 {
        bail!("could not read WAL starting at {}", startpoint);
    }
    tracing::debug!("extracted page map from {} WAL records", nrecords);
    Ok(())
}

/// Report the blocks referenced by one record to the file map.
fn extract_page_info(decoded: &DecodedWALRecord, lsn: Lsn, map: &mut FileMap) -> Result<()> {
    match decoded.xl_rmid {
        // These rm's don't modify any relation files. They do modify other
        // files, like the clog or multixact files, but those are always
        // copied in toto.
        pg_constants::RM_XLOG_ID
        | pg_constants::RM_XACT_ID
        | pg_constants::RM_CLOG_ID
        | pg_constants::RM_MULTIXACT_ID
        | pg_constants::RM_STANDBY_ID => {}

        rmid if rmid <= pg_constants::RM_MAX_ID => {
            for blk in &decoded.blocks {
                map.process_block_change(blk.forknum, blk.rnode, blk.blkno)?;
            }
        }

        // It's important to error out, not ignore, records that we don't
        // recognize. They might change data pages, and if we ignore them
        // those pages won't be brought back in sync.
        rmid => bail!("unrecognized resource manager id {} in WAL record at {}", rmid, lsn),
    }
    Ok(())
}

///
/// Read one WAL record and return the position where it ends, without
/// doing anything with the record itself.
///
pub fn read_one_record(datadir: &Utf8Path, ptr: Lsn, tli: TimeLineID) -> Result<Lsn> {
    let (_start, end, _recordbuf) = read_record_at(datadir, ptr, tli)?;
    Ok(end)
}

///
/// Find the last checkpoint preceding `forkptr`, by walking the record
/// chain backwards through the xl_prev pointers.
///
/// Returns the location of the checkpoint record, the timeline it is on,
/// and its redo pointer.
///
pub fn find_last_checkpoint(
    datadir: &Utf8Path,
    forkptr: Lsn,
    tli: TimeLineID,
) -> Result<(Lsn, TimeLineID, Lsn)> {
    // The fork pointer is the end of the last common record, which is not
    // necessarily a valid start position: it can sit on a page header, or
    // short of the 8-byte alignment the next record was placed at.
    let forkptr = normalize_lsn(forkptr, WAL_SEGMENT_SIZE);

    let mut searchptr = forkptr;
    loop {
        let (start, _end, recordbuf) = read_record_at(datadir, searchptr, tli)
            .with_context(|| format!("could not find previous WAL record at {}", searchptr))?;
        let header = XLogRecord::from_bytes(&mut recordbuf.clone());

        // The checkpoint we want is the latest one before the WAL forked,
        // not the one the target was shut down with.
        let info = header.xl_info & pg_constants::XLR_RMGR_INFO_MASK;
        if start < forkptr
            && header.xl_rmid == pg_constants::RM_XLOG_ID
            && (info == pg_constants::XLOG_CHECKPOINT_SHUTDOWN
                || info == pg_constants::XLOG_CHECKPOINT_ONLINE)
        {
            let decoded = decode_wal_record(recordbuf, start)?;
            let checkpoint = CheckPoint::decode(&decoded.record[decoded.main_data_offset..])?;
            return Ok((start, checkpoint.this_timeline_id, Lsn(checkpoint.redo)));
        }

        if !Lsn(header.xl_prev).is_valid() {
            bail!("could not find previous WAL record at {}", start);
        }
        searchptr = Lsn(header.xl_prev);
    }
}
