//! Assorted constants lifted from the PostgreSQL headers.
//!
//! Only the ones that matter for reading control files, WAL and relation
//! file names are reproduced here.

/// Version identifier of the control file layout we understand.
pub const PG_CONTROL_VERSION: u32 = 942;
/// Catalog version the two clusters must agree on.
pub const CATALOG_VERSION_NO: u32 = 201510051;
/// The control file is always written as one full disk sector's worth of
/// bytes, padded with zeros beyond the meaningful prefix.
pub const PG_CONTROL_FILE_SIZE: usize = 8192;
/// Value of `data_checksum_version` when page checksums are enabled.
pub const PG_DATA_CHECKSUM_VERSION: u32 = 1;

/// Per-major-version directory under pg_tblspc/<oid>/ that holds the actual
/// relation files of a tablespace.
pub const TABLESPACE_VERSION_DIRECTORY: &str = "PG_9.5_201510051";

pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;

/* Cluster state, from pg_control.h */
pub type DBState = u32;
pub const DB_STARTUP: DBState = 0;
pub const DB_SHUTDOWNED: DBState = 1;
pub const DB_SHUTDOWNED_IN_RECOVERY: DBState = 2;
pub const DB_SHUTDOWNING: DBState = 3;
pub const DB_IN_CRASH_RECOVERY: DBState = 4;
pub const DB_IN_ARCHIVE_RECOVERY: DBState = 5;
pub const DB_IN_PRODUCTION: DBState = 6;

/* Relation forks */
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

/* Resource managers, from rmgrlist.h */
pub const RM_XLOG_ID: u8 = 0;
pub const RM_XACT_ID: u8 = 1;
pub const RM_SMGR_ID: u8 = 2;
pub const RM_CLOG_ID: u8 = 3;
pub const RM_DBASE_ID: u8 = 4;
pub const RM_TBLSPC_ID: u8 = 5;
pub const RM_MULTIXACT_ID: u8 = 6;
pub const RM_RELMAP_ID: u8 = 7;
pub const RM_STANDBY_ID: u8 = 8;
pub const RM_HEAP2_ID: u8 = 9;
pub const RM_HEAP_ID: u8 = 10;
pub const RM_BTREE_ID: u8 = 11;
pub const RM_HASH_ID: u8 = 12;
pub const RM_GIN_ID: u8 = 13;
pub const RM_GIST_ID: u8 = 14;
pub const RM_SEQ_ID: u8 = 15;
pub const RM_SPGIST_ID: u8 = 16;
pub const RM_BRIN_ID: u8 = 17;
pub const RM_COMMIT_TS_ID: u8 = 18;
pub const RM_REPLORIGIN_ID: u8 = 19;
pub const RM_MAX_ID: u8 = RM_REPLORIGIN_ID;

/* Info bits in the xl_info field of a WAL record */
pub const XLR_INFO_MASK: u8 = 0x0F;
pub const XLR_RMGR_INFO_MASK: u8 = 0xF0;

/* rmgr-specific info codes we need to recognize */
pub const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;
pub const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
pub const XLOG_SWITCH: u8 = 0x40;

/* Block id kinds in the per-record block header stream, from xlogrecord.h */
pub const XLR_MAX_BLOCK_ID: u8 = 32;
pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;

/* Flag bits in XLogRecordBlockHeader.fork_flags */
pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40;
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

/* Flag bits in XLogRecordBlockImageHeader.bimg_info */
pub const BKPIMAGE_HAS_HOLE: u8 = 0x01;
pub const BKPIMAGE_IS_COMPRESSED: u8 = 0x02;

/* WAL page header */
pub const XLOG_PAGE_MAGIC: u16 = 0xD087;
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;
