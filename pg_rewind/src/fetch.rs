//!
//! Fetching files from the source cluster, and writing them into the
//! target data directory.
//!
//! The two source back-ends (a local data directory, or a live server
//! reached over a libpq connection) present the same three capabilities:
//! enumerate the cluster's files, slurp one file whole, and stream the
//! byte ranges that the file map asks for.
//!

use anyhow::{bail, Result};

use crate::filemap::{FileMap, FileType};
use crate::RewindConf;

pub mod libpq;
pub mod local;
mod target;

pub use target::TargetWriter;

/// One file of the source cluster, as reported by `Source::list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListEntry {
    /// Path relative to the data directory root.
    pub path: String,
    pub ftype: FileType,
    /// Size in bytes; 0 for directories and symlinks.
    pub size: u64,
    /// For symlinks, where the link points.
    pub link_target: Option<String>,
}

///
/// Access to the source cluster's files.
///
pub trait Source {
    /// Enumerate the data directory. Directories come before their
    /// contents; paths contain no `.` or `..` components.
    fn list(&mut self) -> Result<Vec<FileListEntry>>;

    /// Read an entire file into memory.
    fn fetch_file(&mut self, path: &str) -> Result<Vec<u8>>;

    /// Apply a finalized file map to the target directory, fetching all
    /// needed byte ranges from this source.
    fn execute_map(
        &mut self,
        conf: &RewindConf,
        map: &FileMap,
        target: &mut TargetWriter,
    ) -> Result<()>;

    /// Release anything held on the source side. Called once, at the end
    /// of a successful run; Drop is the fallback for error paths.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Open the source the configuration points at.
pub fn new_source(conf: &RewindConf) -> Result<Box<dyn Source>> {
    if let Some(datadir) = &conf.datadir_source {
        Ok(Box::new(local::LocalSource::new(datadir.clone())))
    } else if let Some(connstr) = &conf.connstr_source {
        Ok(Box::new(libpq::LibpqSource::connect(connstr)?))
    } else {
        bail!("no source specified");
    }
}
