//! Hand-written Rust equivalents of the PostgreSQL on-disk data structures
//! that a cluster resynchronization tool needs to understand: the control
//! file, WAL segment and record headers, relation data file naming, and the
//! constants that go with them.
//!
//! The structures here mirror the layout produced by a 64-bit little-endian
//! build of PostgreSQL 9.5 with the default configure options. They are not
//! portable across architectures, which is fine: the files they describe are
//! not portable either.

pub mod controlfile;
pub mod pg_constants;
pub mod relfile_utils;
pub mod waldecoder;
pub mod walgen;
pub mod xlog_utils;

pub use controlfile::{CheckPoint, ControlFileData};

pub type Oid = u32;
pub type TransactionId = u32;
pub type MultiXactId = u32;
pub type MultiXactOffset = u32;
pub type BlockNumber = u32;
pub type TimeLineID = u32;
pub type XLogRecPtr = u64;
pub type XLogSegNo = u64;

/// Identifies a relation on disk: tablespace, database and relation OIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelFileNode {
    pub spcnode: Oid,
    pub dbnode: Oid,
    pub relnode: Oid,
}

// From pg_config.h. These can be changed with configure options
// --with-blocksize=BLOCKSIZE and --with-segsize=SEGSIZE, but assume the
// defaults for now.
pub const BLCKSZ: u32 = 8192;
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / BLCKSZ;
pub const XLOG_BLCKSZ: usize = 8192;
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
