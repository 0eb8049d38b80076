//!
//! The file map: for every file found in the source or target cluster, an
//! entry saying what will be done to it. Relation data files additionally
//! carry a page map marking the blocks that were changed locally.
//!
//! The map is built in two phases. While entries are accumulated, a
//! path-indexed lookup over the source entries answers the "does the source
//! have this file?" queries from target traversal and WAL parsing. Once
//! everything has been added, `finalize` sorts the entries into execution
//! order and the map becomes read-only.
//!

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use once_cell::sync::Lazy;
use regex::Regex;

use postgres_ffi::relfile_utils::datasegpath;
use postgres_ffi::{RelFileNode, BLCKSZ, RELSEG_SIZE};

use crate::datapagemap::DataPageMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// No file-level operation; modified blocks may still be fetched.
    None,
    /// Copy the whole file, overwriting what's there.
    CopyWhole,
    /// Copy the range from `oldsize` to `newsize`.
    CopyTail,
    /// Truncate the target file to `newsize` bytes.
    Truncate,
    /// Create a directory or symlink that only the source has.
    Create,
    /// Remove a file, directory or symlink that only the target has.
    Remove,
}

impl FileAction {
    fn as_str(&self) -> &'static str {
        match self {
            FileAction::None => "NONE",
            FileAction::CopyWhole => "COPY",
            FileAction::CopyTail => "COPY_TAIL",
            FileAction::Truncate => "TRUNCATE",
            FileAction::Create => "CREATE",
            FileAction::Remove => "REMOVE",
        }
    }
}

#[derive(Debug)]
pub struct FileEntry {
    /// POSIX-style path relative to the data directory root.
    pub path: String,
    pub ftype: FileType,
    pub action: FileAction,
    /// Current size on the target; 0 if the target doesn't have the file.
    pub oldsize: u64,
    /// Size on the source; 0 for directories, symlinks and removals.
    pub newsize: u64,
    /// Where a symlink on the source points, verbatim.
    pub link_target: Option<String>,
    pub pagemap: DataPageMap,
}

#[derive(Debug)]
pub struct FileMap {
    datadir_target: Utf8PathBuf,
    entries: Vec<FileEntry>,
    /// Index over the entries that came from the source listing.
    source_index: HashMap<String, usize>,
    finalized: bool,
}

/// Files that must never be copied or deleted, and scratch directories
/// whose contents are meaningless outside a running server.
fn is_ignored_path(path: &str) -> bool {
    if path == "postmaster.pid" || path == "postmaster.opts" {
        return true;
    }
    path.split('/').any(|component| component.starts_with("pgsql_tmp"))
}

fn is_pg_version_file(path: &str) -> bool {
    path == "PG_VERSION" || path.ends_with("/PG_VERSION")
}

/// Does it look like a relation data file?
fn is_rel_data_file(path: &str) -> bool {
    static DATASEGMENT_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"^(global|base/[0-9]+|pg_tblspc/[0-9]+/[^/]+/[0-9]+)/[0-9]+(_(fsm|vm|init))?(\.[0-9]+)?$",
        )
        .unwrap()
    });
    DATASEGMENT_RE.is_match(path)
}

impl FileMap {
    pub fn new(datadir_target: Utf8PathBuf) -> FileMap {
        FileMap {
            datadir_target,
            entries: Vec::new(),
            source_index: HashMap::new(),
            finalized: false,
        }
    }

    ///
    /// Decide what to do about one file present on the source, by comparing
    /// it with whatever the target has at the same path.
    ///
    pub fn process_source_file(
        &mut self,
        path: &str,
        ftype: FileType,
        newsize: u64,
        link_target: Option<&str>,
    ) -> Result<()> {
        assert!(!self.finalized);

        if is_ignored_path(path) {
            return Ok(());
        }

        // Does the corresponding local file exist?
        let localpath = self.datadir_target.join(path);
        let local_meta = match std::fs::symlink_metadata(&localpath) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("could not stat file \"{}\"", localpath))
            }
        };

        // PG_VERSION files should be identical on the two sides; never
        // overwrite one that is already there.
        if is_pg_version_file(path) {
            if let Some(meta) = &local_meta {
                self.push_source_entry(FileEntry {
                    path: path.to_string(),
                    ftype,
                    action: FileAction::None,
                    oldsize: meta.len(),
                    newsize,
                    link_target: None,
                    pagemap: DataPageMap::default(),
                });
                return Ok(());
            }
        }

        let (action, oldsize) = match ftype {
            FileType::Directory => match &local_meta {
                None => (FileAction::Create, 0),
                Some(meta) if meta.is_dir() => (FileAction::None, 0),
                Some(_) => bail!("\"{}\" is not a directory", localpath),
            },
            FileType::Symlink => match &local_meta {
                None => (FileAction::Create, 0),
                Some(meta) if meta.file_type().is_symlink() => (FileAction::None, 0),
                Some(_) => bail!("\"{}\" is not a symbolic link", localpath),
            },
            FileType::Regular => match &local_meta {
                Some(meta) if !meta.is_file() => {
                    bail!("\"{}\" is not a regular file", localpath)
                }
                None => (FileAction::CopyWhole, 0),
                Some(_) if !is_rel_data_file(path) => {
                    // A non-data file that we have no special processing
                    // for. Copy it in toto.
                    (FileAction::CopyWhole, 0)
                }
                Some(meta) => {
                    // A data file that exists on both sides. If it's longer
                    // on the source, copy the missing tail; if shorter,
                    // truncate; if the same size, any changed blocks will
                    // be fetched based on the parsed WAL.
                    let oldsize = meta.len();
                    if oldsize < newsize {
                        (FileAction::CopyTail, oldsize)
                    } else if oldsize > newsize {
                        (FileAction::Truncate, oldsize)
                    } else {
                        (FileAction::None, oldsize)
                    }
                }
            },
        };

        self.push_source_entry(FileEntry {
            path: path.to_string(),
            ftype,
            action,
            oldsize,
            newsize,
            link_target: link_target.map(str::to_string),
            pagemap: DataPageMap::default(),
        });
        Ok(())
    }

    ///
    /// Decide what to do about one file present on the target. All source
    /// files must have been processed first; anything the source doesn't
    /// have is scheduled for removal.
    ///
    pub fn process_target_file(
        &mut self,
        path: &str,
        ftype: FileType,
        oldsize: u64,
    ) -> Result<()> {
        assert!(!self.finalized);

        if is_ignored_path(path) || is_pg_version_file(path) {
            return Ok(());
        }

        if !self.source_index.contains_key(path) {
            self.entries.push(FileEntry {
                path: path.to_string(),
                ftype,
                action: FileAction::Remove,
                oldsize,
                newsize: 0,
                link_target: None,
                pagemap: DataPageMap::default(),
            });
        }
        Ok(())
    }

    ///
    /// Called for every block reference found in the target's WAL after the
    /// point of divergence. Marks the block in the page map of the file it
    /// belongs to.
    ///
    pub fn process_block_change(
        &mut self,
        forknum: u8,
        rnode: RelFileNode,
        blkno: u32,
    ) -> Result<()> {
        assert!(!self.finalized);

        let segno = blkno / RELSEG_SIZE;
        let blkno_inseg = blkno % RELSEG_SIZE;
        let path = datasegpath(rnode, forknum, segno);

        let entry = match self.source_index.get(&path) {
            Some(&idx) => &mut self.entries[idx],
            None => {
                // The relation doesn't exist on the source, and it has also
                // been removed on the target already. Safe to ignore.
                return Ok(());
            }
        };

        match entry.action {
            FileAction::None | FileAction::CopyTail | FileAction::Truncate => {
                // skip if the modified block will be truncated away anyway
                if (blkno_inseg as u64 + 1) * BLCKSZ as u64 <= entry.newsize {
                    entry.pagemap.add(blkno_inseg);
                }
            }
            FileAction::CopyWhole | FileAction::Remove => {
                // the whole file is re-fetched or dropped, the block
                // reference is redundant
            }
            FileAction::Create => {
                bail!(
                    "unexpected block modification for directory or symbolic link \"{}\"",
                    entry.path
                );
            }
        }
        Ok(())
    }

    ///
    /// Sort the entries into execution order. Directories are created
    /// parent-first before anything is copied into them, and removed
    /// child-first after everything else; whole-file copies come before
    /// incremental ones so that a later pass never touches a file that a
    /// truncation is about to shrink.
    ///
    pub fn finalize(&mut self) {
        // The processing order is a property of the executor, so it lives
        // here in the comparator rather than in the enum's discriminants.
        fn action_rank(action: FileAction) -> u8 {
            match action {
                FileAction::Create => 0,
                FileAction::CopyWhole => 1,
                FileAction::CopyTail => 2,
                FileAction::None => 3,
                FileAction::Truncate => 4,
                FileAction::Remove => 5,
            }
        }

        self.entries.sort_by(|a, b| {
            action_rank(a.action).cmp(&action_rank(b.action)).then_with(|| {
                if a.action == FileAction::Remove {
                    // children before their parent directories
                    b.path.cmp(&a.path)
                } else {
                    a.path.cmp(&b.path)
                }
            })
        });
        self.finalized = true;
    }

    /// The finalized entries, in execution order.
    pub fn entries(&self) -> &[FileEntry] {
        assert!(self.finalized);
        &self.entries
    }

    fn push_source_entry(&mut self, entry: FileEntry) {
        let prev = self.source_index.insert(entry.path.clone(), self.entries.len());
        assert!(prev.is_none(), "duplicate source entry for {}", entry.path);
        self.entries.push(entry);
    }
}

impl fmt::Display for FileMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            if entry.action != FileAction::None || !entry.pagemap.is_empty() {
                writeln!(f, "{} ({})", entry.path, entry.action.as_str())?;
                if !entry.pagemap.is_empty() {
                    write!(f, "{}", entry.pagemap)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::pg_constants::DEFAULTTABLESPACE_OID;
    use std::collections::HashSet;
    use std::fs;

    const BLCKSZ64: u64 = BLCKSZ as u64;

    fn rnode(relnode: u32) -> RelFileNode {
        RelFileNode {
            spcnode: DEFAULTTABLESPACE_OID,
            dbnode: 1,
            relnode,
        }
    }

    /// A scratch target datadir with one 3-block relation in it.
    fn scratch_target() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("base/1")).unwrap();
        fs::write(root.join("base/1/16384"), vec![1u8; 3 * BLCKSZ as usize]).unwrap();
        fs::write(root.join("PG_VERSION"), "9.5\n").unwrap();
        (dir, root)
    }

    #[test]
    fn rel_data_file_regex() {
        assert!(is_rel_data_file("global/1262"));
        assert!(is_rel_data_file("base/1/16384"));
        assert!(is_rel_data_file("base/1/16384.3"));
        assert!(is_rel_data_file("base/1/16384_fsm"));
        assert!(is_rel_data_file("base/1/16384_vm.2"));
        assert!(is_rel_data_file("pg_tblspc/16400/PG_9.5_201510051/16390/16385"));

        assert!(!is_rel_data_file("base/1"));
        assert!(!is_rel_data_file("base/1/PG_VERSION"));
        assert!(!is_rel_data_file("pg_xlog/000000010000000000000001"));
        assert!(!is_rel_data_file("global/pg_control"));
        assert!(!is_rel_data_file("base/1/16384_bogus"));
    }

    #[test]
    fn grow_on_source_means_copy_tail() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("base/1/16384", FileType::Regular, 9 * BLCKSZ64, None)
            .unwrap();

        for blkno in 0..4 {
            map.process_block_change(0, rnode(16384), blkno).unwrap();
        }
        map.finalize();

        let entry = map
            .entries()
            .iter()
            .find(|e| e.path == "base/1/16384")
            .unwrap();
        assert_eq!(entry.action, FileAction::CopyTail);
        assert_eq!(entry.oldsize, 3 * BLCKSZ64);
        assert_eq!(entry.newsize, 9 * BLCKSZ64);
        assert_eq!(entry.pagemap.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn shrink_on_source_means_truncate_and_drops_bits() {
        let (_dir, root) = scratch_target();
        fs::write(
            root.join("base/1/16385"),
            vec![1u8; 5 * BLCKSZ as usize],
        )
        .unwrap();

        let mut map = FileMap::new(root);
        map.process_source_file("base/1/16385", FileType::Regular, 3 * BLCKSZ64, None)
            .unwrap();
        // target wrote block 4, which the truncation will cut off
        map.process_block_change(0, rnode(16385), 4).unwrap();
        map.finalize();

        let entry = map
            .entries()
            .iter()
            .find(|e| e.path == "base/1/16385")
            .unwrap();
        assert_eq!(entry.action, FileAction::Truncate);
        assert_eq!(entry.newsize, 3 * BLCKSZ64);
        assert!(entry.pagemap.is_empty());
    }

    #[test]
    fn same_size_keeps_pagemap() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("base/1/16384", FileType::Regular, 3 * BLCKSZ64, None)
            .unwrap();
        map.process_block_change(0, rnode(16384), 1).unwrap();
        map.finalize();

        let entry = &map.entries()[0];
        assert_eq!(entry.action, FileAction::None);
        assert_eq!(entry.oldsize, entry.newsize);
        assert_eq!(entry.pagemap.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn target_only_files_are_removed_children_first() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("base", FileType::Directory, 0, None).unwrap();
        map.process_source_file("base/1", FileType::Directory, 0, None).unwrap();

        map.process_target_file("base", FileType::Directory, 0).unwrap();
        map.process_target_file("base/1", FileType::Directory, 0).unwrap();
        map.process_target_file("base/99999", FileType::Directory, 0).unwrap();
        map.process_target_file("base/99999/10001", FileType::Regular, 100).unwrap();
        map.process_target_file("base/1/16384", FileType::Regular, 3 * BLCKSZ64)
            .unwrap();
        map.finalize();

        let removes: Vec<&str> = map
            .entries()
            .iter()
            .filter(|e| e.action == FileAction::Remove)
            .map(|e| e.path.as_str())
            .collect();
        // descending path order: files inside a directory before the directory
        assert_eq!(removes, vec!["base/99999/10001", "base/99999", "base/1/16384"]);

        // removals come after everything else
        let first_remove = map
            .entries()
            .iter()
            .position(|e| e.action == FileAction::Remove)
            .unwrap();
        assert!(map.entries()[..first_remove]
            .iter()
            .all(|e| e.action != FileAction::Remove));
    }

    #[test]
    fn directories_are_created_before_their_contents() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("base/5/10002", FileType::Regular, BLCKSZ64, None)
            .unwrap();
        map.process_source_file("base/5", FileType::Directory, 0, None).unwrap();
        map.finalize();

        let paths: Vec<&str> = map.entries().iter().map(|e| e.path.as_str()).collect();
        let dir_pos = paths.iter().position(|p| *p == "base/5").unwrap();
        let file_pos = paths.iter().position(|p| *p == "base/5/10002").unwrap();
        assert!(dir_pos < file_pos);
        assert_eq!(map.entries()[dir_pos].action, FileAction::Create);
        assert_eq!(map.entries()[file_pos].action, FileAction::CopyWhole);
    }

    #[test]
    fn pg_version_is_never_overwritten() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("PG_VERSION", FileType::Regular, 4, None).unwrap();
        map.process_target_file("PG_VERSION", FileType::Regular, 4).unwrap();
        map.finalize();

        let entry = map
            .entries()
            .iter()
            .find(|e| e.path == "PG_VERSION")
            .unwrap();
        assert_eq!(entry.action, FileAction::None);
        assert_eq!(entry.oldsize, entry.newsize);
    }

    #[test]
    fn scratch_files_are_ignored() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("postmaster.pid", FileType::Regular, 88, None).unwrap();
        map.process_source_file("postmaster.opts", FileType::Regular, 10, None).unwrap();
        map.process_source_file("base/1/pgsql_tmp/pgsql_tmp123.1", FileType::Regular, 5, None)
            .unwrap();
        map.process_target_file("base/1/pgsql_tmp", FileType::Directory, 0).unwrap();
        map.finalize();
        assert!(map.entries().is_empty());
    }

    #[test]
    fn block_change_on_directory_is_fatal() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        // contrive a "directory" at a data file path
        map.process_source_file("base/7", FileType::Directory, 0, None).unwrap();
        map.process_source_file("base/7/16500", FileType::Directory, 0, None)
            .unwrap();
        let err = map
            .process_block_change(
                0,
                RelFileNode {
                    spcnode: DEFAULTTABLESPACE_OID,
                    dbnode: 7,
                    relnode: 16500,
                },
                0,
            )
            .unwrap_err();
        assert!(err.to_string().contains("unexpected block modification"));
    }

    #[test]
    fn block_change_for_unknown_relation_is_dropped() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_block_change(0, rnode(55555), 3).unwrap();
        map.finalize();
        assert!(map.entries().is_empty());
    }

    #[test]
    fn symlink_targets_are_preserved_verbatim() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("pg_tblspc/16400", FileType::Symlink, 0, Some("/srv/tb1"))
            .unwrap();
        map.finalize();

        let entry = &map.entries()[0];
        assert_eq!(entry.action, FileAction::Create);
        assert_eq!(entry.ftype, FileType::Symlink);
        assert_eq!(entry.link_target.as_deref(), Some("/srv/tb1"));
    }

    #[test]
    fn finalized_paths_are_unique() {
        let (_dir, root) = scratch_target();
        let mut map = FileMap::new(root);
        map.process_source_file("base", FileType::Directory, 0, None).unwrap();
        map.process_source_file("base/1", FileType::Directory, 0, None).unwrap();
        map.process_source_file("base/1/16384", FileType::Regular, 3 * BLCKSZ64, None)
            .unwrap();
        map.process_target_file("base", FileType::Directory, 0).unwrap();
        map.process_target_file("base/1", FileType::Directory, 0).unwrap();
        map.process_target_file("base/1/16384", FileType::Regular, 3 * BLCKSZ64)
            .unwrap();
        map.process_target_file("base/1/16999", FileType::Regular, 10).unwrap();
        map.finalize();

        let mut seen = HashSet::new();
        for entry in map.entries() {
            assert!(seen.insert(entry.path.clone()), "duplicate {}", entry.path);
        }
    }
}
