//! Resynchronize a diverged cluster data directory with a promoted copy of
//! itself, by replacing only the files and blocks that changed after their
//! WAL histories forked.

use camino::Utf8PathBuf;

pub mod datapagemap;
pub mod fetch;
pub mod filemap;
pub mod parsexlog;
pub mod rewind;
pub mod timelines;

/// Everything the run needs to know, collected from the command line once
/// and read-only afterwards.
#[derive(Debug, Clone)]
pub struct RewindConf {
    /// The data directory that will be modified.
    pub datadir_target: Utf8PathBuf,
    /// Read the source cluster from a local data directory...
    pub datadir_source: Option<Utf8PathBuf>,
    /// ...or from a running server. Exactly one of the two is set.
    pub connstr_source: Option<String>,
    /// Go through all the motions but don't modify anything.
    pub dry_run: bool,
    /// Dump the computed file map before executing it.
    pub verbose: bool,
}
