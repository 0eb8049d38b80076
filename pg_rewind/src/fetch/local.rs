//!
//! Fetching from a source cluster that is a plain local data directory.
//!

use std::cmp::min;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use postgres_ffi::BLCKSZ;

use crate::fetch::{FileListEntry, Source, TargetWriter};
use crate::filemap::{FileAction, FileMap, FileType};
use crate::RewindConf;

pub struct LocalSource {
    datadir: Utf8PathBuf,
}

impl LocalSource {
    pub fn new(datadir: Utf8PathBuf) -> LocalSource {
        LocalSource { datadir }
    }

    /// Copy the given byte range of a source file into the same path on
    /// the target, one block-sized chunk at a time.
    fn copy_file_range(
        &self,
        path: &str,
        begin: u64,
        end: u64,
        trunc: bool,
        target: &mut TargetWriter,
    ) -> Result<()> {
        let srcpath = self.datadir.join(path);
        let mut srcfile = File::open(&srcpath)
            .with_context(|| format!("could not open source file \"{}\"", srcpath))?;
        srcfile
            .seek(SeekFrom::Start(begin))
            .with_context(|| format!("could not seek in source file \"{}\"", srcpath))?;

        target.open_target_file(path, trunc)?;

        let mut buf = [0u8; BLCKSZ as usize];
        let mut pos = begin;
        while pos < end {
            let len = min((end - pos) as usize, buf.len());
            let readlen = srcfile
                .read(&mut buf[..len])
                .with_context(|| format!("could not read file \"{}\"", srcpath))?;
            if readlen == 0 {
                bail!("unexpected EOF while reading file \"{}\"", srcpath);
            }
            target.write_file_range(pos, &buf[..readlen])?;
            pos += readlen as u64;
        }
        Ok(())
    }
}

impl Source for LocalSource {
    fn list(&mut self) -> Result<Vec<FileListEntry>> {
        let mut entries = Vec::new();
        traverse_datadir(&self.datadir, &mut |path, ftype, size, link_target| {
            entries.push(FileListEntry {
                path: path.to_string(),
                ftype,
                size,
                link_target: link_target.map(str::to_string),
            });
            Ok(())
        })?;
        Ok(entries)
    }

    fn fetch_file(&mut self, path: &str) -> Result<Vec<u8>> {
        slurp_file(&self.datadir, path)
    }

    fn execute_map(
        &mut self,
        _conf: &RewindConf,
        map: &FileMap,
        target: &mut TargetWriter,
    ) -> Result<()> {
        for entry in map.entries() {
            // Fetch all the blocks the target wrote after the histories
            // forked, before any file-level action on the entry.
            for blkno in entry.pagemap.iter() {
                let offset = blkno as u64 * BLCKSZ as u64;
                self.copy_file_range(&entry.path, offset, offset + BLCKSZ as u64, false, target)?;
            }

            match entry.action {
                FileAction::None => {}
                FileAction::CopyWhole => {
                    self.copy_file_range(&entry.path, 0, entry.newsize, true, target)?;
                }
                FileAction::CopyTail => {
                    self.copy_file_range(&entry.path, entry.oldsize, entry.newsize, false, target)?;
                }
                FileAction::Truncate => {
                    target.truncate_target_file(&entry.path, entry.newsize)?;
                }
                FileAction::Create => match entry.ftype {
                    FileType::Directory => target.create_target_dir(&entry.path)?,
                    FileType::Symlink => {
                        let link_target = entry
                            .link_target
                            .as_deref()
                            .expect("symlink entry without a link target");
                        target.create_target_symlink(&entry.path, link_target)?;
                    }
                    FileType::Regular => unreachable!("create action on a regular file"),
                },
                FileAction::Remove => match entry.ftype {
                    FileType::Regular => target.remove_target_file(&entry.path)?,
                    FileType::Directory => target.remove_target_dir(&entry.path)?,
                    FileType::Symlink => target.remove_target_symlink(&entry.path)?,
                },
            }
        }
        target.close_target_file()
    }
}

/// Read a whole file of a data directory into memory.
pub fn slurp_file(datadir: &Utf8Path, path: &str) -> Result<Vec<u8>> {
    let fullpath = datadir.join(path);
    std::fs::read(&fullpath)
        .with_context(|| format!("could not open file \"{}\" for reading", fullpath))
}

///
/// Recursively enumerate a data directory, reporting each entry to the
/// callback as (relative path, type, size, symlink target).
///
/// Directories are reported before their contents. Symbolic links are
/// reported verbatim, and followed only where the cluster layout expects
/// them: the WAL directory itself, and tablespaces under pg_tblspc/.
///
pub fn traverse_datadir(
    datadir: &Utf8Path,
    callback: &mut dyn FnMut(&str, FileType, u64, Option<&str>) -> Result<()>,
) -> Result<()> {
    recurse_dir(datadir, None, callback)
}

fn recurse_dir(
    datadir: &Utf8Path,
    path: Option<&str>,
    callback: &mut dyn FnMut(&str, FileType, u64, Option<&str>) -> Result<()>,
) -> Result<()> {
    let fulldirpath = match path {
        Some(path) => datadir.join(path),
        None => datadir.to_owned(),
    };

    let dir = std::fs::read_dir(&fulldirpath)
        .with_context(|| format!("could not open directory \"{}\"", fulldirpath))?;

    let mut names: Vec<String> = Vec::new();
    for dirent in dir {
        let dirent = dirent
            .with_context(|| format!("could not read directory \"{}\"", fulldirpath))?;
        match dirent.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => bail!("non-UTF-8 file name in \"{}\": {:?}", fulldirpath, name),
        }
    }
    // a stable order makes the resulting file map deterministic
    names.sort();

    for name in names {
        let filepath = match path {
            Some(path) => format!("{}/{}", path, name),
            None => name.clone(),
        };
        let abspath = datadir.join(&filepath);

        let meta = match std::fs::symlink_metadata(&abspath) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // The source cluster can be live; a file that vanishes
                // between readdir and stat is dropped from the inventory.
                warn!("could not stat file \"{}\": file has been removed", abspath);
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("could not stat file \"{}\"", abspath))
            }
        };
        let ftype = meta.file_type();

        if ftype.is_symlink() {
            let link_dest = std::fs::read_link(&abspath)
                .with_context(|| format!("could not read symbolic link \"{}\"", abspath))?;
            let link_dest = match link_dest.to_str() {
                Some(s) => s.to_owned(),
                None => bail!("non-UTF-8 symbolic link target at \"{}\"", abspath),
            };
            callback(&filepath, FileType::Symlink, 0, Some(&link_dest))?;

            // Only the conventional cluster symlinks are followed.
            if filepath == "pg_xlog" || path == Some("pg_tblspc") {
                let resolved = std::fs::metadata(&abspath).with_context(|| {
                    format!("could not stat symbolic link target of \"{}\"", abspath)
                })?;
                if resolved.is_dir() {
                    recurse_dir(datadir, Some(&filepath), callback)?;
                }
            }
        } else if ftype.is_dir() {
            callback(&filepath, FileType::Directory, 0, None)?;
            recurse_dir(datadir, Some(&filepath), callback)?;
        } else if ftype.is_file() {
            callback(&filepath, FileType::Regular, meta.len(), None)?;
        } else {
            // sockets, fifos and the like have no business being copied
            warn!("skipping special file \"{}\"", abspath);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn collect(datadir: &Utf8Path) -> Vec<FileListEntry> {
        let mut entries = Vec::new();
        traverse_datadir(datadir, &mut |path, ftype, size, link_target| {
            entries.push(FileListEntry {
                path: path.to_string(),
                ftype,
                size,
                link_target: link_target.map(str::to_string),
            });
            Ok(())
        })
        .unwrap();
        entries
    }

    #[test]
    fn walk_reports_dirs_before_contents() {
        let (_dir, root) = scratch();
        fs::create_dir_all(root.join("base/1")).unwrap();
        fs::write(root.join("base/1/16384"), vec![0u8; 100]).unwrap();
        fs::write(root.join("PG_VERSION"), "9.5\n").unwrap();

        let entries = collect(&root);
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["PG_VERSION", "base", "base/1", "base/1/16384"]);
        assert_eq!(entries[1].ftype, FileType::Directory);
        assert_eq!(entries[3].ftype, FileType::Regular);
        assert_eq!(entries[3].size, 100);
    }

    #[test]
    fn tablespace_symlinks_are_reported_and_followed() {
        let (_dir, root) = scratch();
        let (_spc_dir, spc_root) = scratch();
        fs::create_dir_all(root.join("pg_tblspc")).unwrap();
        fs::create_dir_all(spc_root.join("PG_9.5_201510051/16390")).unwrap();
        fs::write(spc_root.join("PG_9.5_201510051/16390/16385"), b"x").unwrap();
        std::os::unix::fs::symlink(&spc_root, root.join("pg_tblspc/16400")).unwrap();

        let entries = collect(&root);
        let link = entries.iter().find(|e| e.path == "pg_tblspc/16400").unwrap();
        assert_eq!(link.ftype, FileType::Symlink);
        // the absolute target is preserved verbatim
        assert_eq!(link.link_target.as_deref(), Some(spc_root.as_str()));
        // and the walk descended through the link
        assert!(entries
            .iter()
            .any(|e| e.path == "pg_tblspc/16400/PG_9.5_201510051/16390/16385"));
    }

    #[test]
    fn other_symlinks_are_not_followed() {
        let (_dir, root) = scratch();
        let (_other_dir, other_root) = scratch();
        fs::write(other_root.join("secret"), b"x").unwrap();
        std::os::unix::fs::symlink(&other_root, root.join("stray_link")).unwrap();

        let entries = collect(&root);
        assert!(entries.iter().any(|e| e.path == "stray_link"));
        assert!(!entries.iter().any(|e| e.path.contains("secret")));
    }
}
