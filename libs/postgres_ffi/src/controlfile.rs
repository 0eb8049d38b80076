//!
//! Reading and writing the PostgreSQL control file.
//!
//! The control file is one of the first things the server reads when it
//! starts up. It indicates whether the cluster was shut down cleanly, and
//! carries a copy of the latest checkpoint record along with its location
//! in the WAL. It lives in the data directory as `global/pg_control`: the
//! meaningful prefix is designed to fit in a single disk sector, and the
//! rest of the 8192-byte file is zero padding.
//!
//! The structs below spell out every padding byte explicitly so that they
//! can be read from and written to raw bytes with zerocopy, without a
//! bindgen step. Native (little) endian, 8-byte max alignment.
//!
use crate::pg_constants::{DBState, PG_CONTROL_FILE_SIZE};
use crate::{MultiXactId, MultiXactOffset, Oid, TimeLineID, TransactionId, XLogRecPtr};

use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use zerocopy::{AsBytes, FromBytes};

type PgTimeT = i64;

/// Body of a checkpoint WAL record, also embedded in the control file.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct CheckPoint {
    /// Start of the WAL that must be replayed to recover from this checkpoint.
    pub redo: XLogRecPtr,
    pub this_timeline_id: TimeLineID,
    pub prev_timeline_id: TimeLineID,
    /// `bool` in C; u8 here to keep the struct zerocopy-safe.
    pub full_page_writes: u8,
    pub __padding1: [u8; 7],
    /// Next free transaction id, with the wraparound epoch in the high bits.
    pub next_xid: u64,
    pub next_oid: Oid,
    pub next_multi: MultiXactId,
    pub next_multi_offset: MultiXactOffset,
    pub oldest_xid: TransactionId,
    pub oldest_xid_db: Oid,
    pub oldest_multi: MultiXactId,
    pub oldest_multi_db: Oid,
    pub __padding2: [u8; 4],
    pub time: PgTimeT,
    pub oldest_active_xid: TransactionId,
    pub __padding3: [u8; 4],
}

pub const SIZEOF_CHECKPOINT: usize = std::mem::size_of::<CheckPoint>();

impl CheckPoint {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    pub fn decode(buf: &[u8]) -> Result<CheckPoint> {
        match CheckPoint::read_from_prefix(buf) {
            Some(chk) => Ok(chk),
            None => bail!("checkpoint record is too short"),
        }
    }
}

/// Contents of `global/pg_control`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ControlFileData {
    /// Unique identifier of the cluster, chosen by initdb. Two control files
    /// describe the same cluster iff this matches.
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: DBState,
    pub __padding1: [u8; 4],
    pub time: PgTimeT,
    /// Location of the last checkpoint record.
    pub checkpoint: XLogRecPtr,
    pub prev_checkpoint: XLogRecPtr,
    /// Copy of the last checkpoint record itself.
    pub checkpoint_copy: CheckPoint,
    pub unlogged_lsn: XLogRecPtr,
    pub min_recovery_point: XLogRecPtr,
    pub min_recovery_point_tli: TimeLineID,
    pub __padding2: [u8; 4],
    pub backup_start_point: XLogRecPtr,
    pub backup_end_point: XLogRecPtr,
    pub backup_end_required: u8,
    pub __padding3: [u8; 3],
    pub wal_level: u32,
    pub wal_log_hints: u8,
    pub __padding4: [u8; 3],
    pub max_connections: u32,
    pub max_worker_processes: u32,
    pub max_prepared_xacts: u32,
    pub max_locks_per_xact: u32,
    pub track_commit_timestamp: u8,
    pub __padding5: [u8; 3],
    pub max_align: u32,
    pub __padding6: [u8; 4],
    pub float_format: f64,
    pub blcksz: u32,
    pub relseg_size: u32,
    pub xlog_blcksz: u32,
    pub xlog_seg_size: u32,
    pub name_data_len: u32,
    pub index_max_keys: u32,
    pub toast_max_chunk_size: u32,
    pub loblksize: u32,
    pub float4_by_val: u8,
    pub float8_by_val: u8,
    pub __padding7: [u8; 2],
    pub data_checksum_version: u32,
    /// CRC-32C over all of the above.
    pub crc: u32,
    pub __padding8: [u8; 4],
}

// sizeof(ControlFileData)
pub const SIZEOF_CONTROLDATA: usize = std::mem::size_of::<ControlFileData>();
// offsetof(ControlFileData, crc)
const OFFSETOF_CRC: usize = SIZEOF_CONTROLDATA - 8;

impl ControlFileData {
    /// Recompute the CRC field from the rest of the struct.
    pub fn compute_crc(&self) -> u32 {
        crc32c::crc32c(&self.as_bytes()[0..OFFSETOF_CRC])
    }

    /// Does the stored CRC match the contents? Not enforced on the decode
    /// path; callers that want strict verification use this.
    pub fn crc_ok(&self) -> bool {
        self.compute_crc() == self.crc
    }
}

///
/// Interpret a buffer holding the full contents of a control file.
///
/// The buffer must be exactly the size of the on-disk file; anything else
/// means we are not looking at a control file at all.
///
pub fn decode_pg_control(buf: &[u8]) -> Result<ControlFileData> {
    if buf.len() != PG_CONTROL_FILE_SIZE {
        bail!(
            "unexpected control file size {}, expected {}",
            buf.len(),
            PG_CONTROL_FILE_SIZE
        );
    }

    // read_from_prefix copies, so the buffer's alignment does not matter.
    let controlfile =
        ControlFileData::read_from_prefix(buf).expect("control file shorter than its fixed prefix");

    Ok(controlfile)
}

///
/// Convert a control file struct back into the raw bytes of a control file.
///
/// The CRC is recomputed to match the contents of the fields.
pub fn encode_pg_control(controlfile: &ControlFileData) -> Bytes {
    let mut data = *controlfile;
    data.crc = data.compute_crc();

    let mut buf = BytesMut::with_capacity(PG_CONTROL_FILE_SIZE);
    buf.extend_from_slice(data.as_bytes());
    // Fill the rest of the control file with zeros.
    buf.resize(PG_CONTROL_FILE_SIZE, 0);

    buf.into()
}
