//!
//! All mutation of the target data directory goes through here.
//!
//! A single write descriptor is cached across successive writes to the
//! same file, so that copying a file chunk by chunk doesn't reopen it for
//! every chunk. Under `--dry-run` every mutation is skipped while the
//! callers still run their full decision logic.
//!

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::DirBuilderExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeSet;
use tracing::debug;

pub struct TargetWriter {
    datadir: Utf8PathBuf,
    dry_run: bool,
    open_file: Option<(String, File)>,
    /// Relative paths of files written or truncated, for the final fsync
    /// pass.
    touched: BTreeSet<String>,
    /// Directories whose entries changed (creations and removals).
    touched_dirs: BTreeSet<Utf8PathBuf>,
}

impl TargetWriter {
    pub fn new(datadir: Utf8PathBuf, dry_run: bool) -> TargetWriter {
        TargetWriter {
            datadir,
            dry_run,
            open_file: None,
            touched: BTreeSet::new(),
            touched_dirs: BTreeSet::new(),
        }
    }

    fn abs(&self, path: &str) -> Utf8PathBuf {
        self.datadir.join(path)
    }

    fn note_dir_change(&mut self, path: &str) {
        let abspath = self.abs(path);
        if let Some(parent) = abspath.parent() {
            self.touched_dirs.insert(parent.to_owned());
        }
    }

    /// Open a target file for writing, creating it if necessary and
    /// truncating it first if asked. Keeps the descriptor cached.
    pub fn open_target_file(&mut self, path: &str, trunc: bool) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        if let Some((open_path, _)) = &self.open_file {
            if open_path == path && !trunc {
                return Ok(()); // already open
            }
        }
        self.close_target_file()?;

        let abspath = self.abs(path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(trunc)
            .open(&abspath)
            .with_context(|| format!("could not open destination file \"{}\"", abspath))?;
        self.open_file = Some((path.to_string(), file));
        self.touched.insert(path.to_string());
        Ok(())
    }

    /// Write a chunk at the given offset of the currently open file.
    pub fn write_file_range(&mut self, begin: u64, buf: &[u8]) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        let (path, file) = self
            .open_file
            .as_mut()
            .expect("no target file open");
        file.seek(SeekFrom::Start(begin))
            .with_context(|| format!("could not seek in destination file \"{}\"", path))?;
        file.write_all(buf)
            .with_context(|| format!("could not write file \"{}\"", path))?;
        // keep the file open, in case more chunks of it follow
        Ok(())
    }

    pub fn close_target_file(&mut self) -> Result<()> {
        if let Some((path, file)) = self.open_file.take() {
            file.sync_data()
                .with_context(|| format!("error closing destination file \"{}\"", path))?;
        }
        Ok(())
    }

    /// Remove a regular file. A file that is already gone is fine: the
    /// source can outrun the file list it gave us.
    pub fn remove_target_file(&mut self, path: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        self.note_dir_change(path);
        let abspath = self.abs(path);
        match std::fs::remove_file(&abspath) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("file \"{}\" was already gone", abspath);
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("could not remove file \"{}\"", abspath)),
        }
    }

    pub fn remove_target_dir(&mut self, path: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        self.note_dir_change(path);
        let abspath = self.abs(path);
        std::fs::remove_dir(&abspath)
            .with_context(|| format!("could not remove directory \"{}\"", abspath))
    }

    pub fn remove_target_symlink(&mut self, path: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        self.note_dir_change(path);
        let abspath = self.abs(path);
        std::fs::remove_file(&abspath)
            .with_context(|| format!("could not remove symbolic link \"{}\"", abspath))
    }

    pub fn truncate_target_file(&mut self, path: &str, newsize: u64) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        self.close_target_file()?;

        let abspath = self.abs(path);
        let file = OpenOptions::new()
            .write(true)
            .open(&abspath)
            .with_context(|| format!("could not open file \"{}\" for truncation", abspath))?;
        file.set_len(newsize)
            .with_context(|| format!("could not truncate file \"{}\" to {} bytes", abspath, newsize))?;
        self.touched.insert(path.to_string());
        Ok(())
    }

    pub fn create_target_dir(&mut self, path: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        self.note_dir_change(path);
        let abspath = self.abs(path);
        std::fs::DirBuilder::new()
            .mode(0o700)
            .create(&abspath)
            .with_context(|| format!("could not create directory \"{}\"", abspath))
    }

    pub fn create_target_symlink(&mut self, path: &str, link_target: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        self.note_dir_change(path);
        let abspath = self.abs(path);
        std::os::unix::fs::symlink(link_target, &abspath)
            .with_context(|| format!("could not create symbolic link \"{}\"", abspath))
    }

    /// Write a small file in one go (used for the backup label).
    pub fn write_whole_file(&mut self, path: &str, content: &[u8]) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        let abspath = self.abs(path);
        std::fs::write(&abspath, content)
            .with_context(|| format!("could not write file \"{}\"", abspath))?;
        self.touched.insert(path.to_string());
        Ok(())
    }

    ///
    /// Flush everything we wrote to stable storage: each touched file,
    /// then every directory we touched something in, then the root.
    ///
    pub fn sync_target(&mut self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.close_target_file()?;

        let mut dirs: BTreeSet<Utf8PathBuf> = std::mem::take(&mut self.touched_dirs);
        dirs.insert(self.datadir.clone());

        for path in &self.touched {
            let abspath = self.abs(path);
            if let Some(parent) = abspath.parent() {
                dirs.insert(parent.to_owned());
            }
            match File::open(&abspath) {
                Ok(file) => file
                    .sync_all()
                    .with_context(|| format!("could not fsync file \"{}\"", abspath))?,
                // the map may have removed it again after writing it
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("could not open file \"{}\"", abspath))
                }
            }
        }

        for dir in dirs {
            fsync_dir(&dir)?;
        }
        Ok(())
    }
}

fn fsync_dir(path: &Utf8Path) -> Result<()> {
    // a noted directory can have been removed again by a later action
    let dir = match File::open(path) {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("could not open directory \"{}\"", path)),
    };
    dir.sync_all()
        .with_context(|| format!("could not fsync directory \"{}\"", path))
}

impl Drop for TargetWriter {
    fn drop(&mut self) {
        // best effort; the explicit close path reports errors properly
        let _ = self.close_target_file();
    }
}
