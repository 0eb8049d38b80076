//!
//! Fetching from a source cluster that is a running server, over a libpq
//! connection.
//!
//! The server side needs three helper functions (directory listing, stat,
//! and ranged binary read). They are installed into a schema of their own
//! at connect time and dropped again when we are done, so that nothing is
//! left behind on the source.
//!

use std::io::Write;

use anyhow::{ensure, Context, Result};
use fallible_iterator::FallibleIterator;
use postgres::{Client, NoTls};
use tracing::{debug, warn};

use postgres_ffi::BLCKSZ;

use crate::fetch::{FileListEntry, Source, TargetWriter};
use crate::filemap::{FileAction, FileMap, FileType};
use crate::RewindConf;

/// Byte ranges queued for fetching are split into chunks of this size.
const CHUNKSIZE: u64 = 1_000_000;

const HELPER_SCHEMA_SQL: &str = "\
    CREATE SCHEMA rewind_support;
    CREATE FUNCTION rewind_support.rewind_support_ls_dir(text, boolean)
        RETURNS SETOF text
        AS '$libdir/pg_rewind_support' LANGUAGE C STRICT;
    CREATE FUNCTION rewind_support.rewind_support_stat_file(
            text, boolean,
            OUT size int8, OUT access timestamptz, OUT modification timestamptz,
            OUT change timestamptz, OUT creation timestamptz, OUT isdir bool)
        RETURNS record
        AS '$libdir/pg_rewind_support' LANGUAGE C STRICT;
    CREATE FUNCTION rewind_support.rewind_support_read_binary_file(text, int8, int8, boolean)
        RETURNS bytea
        AS '$libdir/pg_rewind_support' LANGUAGE C;
";

const FILE_LIST_SQL: &str = "\
    WITH RECURSIVE files (path, filename, size, isdir) AS (
      SELECT '' AS path, filename, size, isdir
      FROM (SELECT rewind_support.rewind_support_ls_dir('.', false) AS filename) AS fn,
           rewind_support.rewind_support_stat_file(fn.filename, false) AS this
      UNION ALL
      SELECT parent.path || parent.filename || '/' AS path, fn, this.size, this.isdir
      FROM files AS parent,
           rewind_support.rewind_support_ls_dir(parent.path || parent.filename, false) AS fn,
           rewind_support.rewind_support_stat_file(parent.path || parent.filename || '/' || fn, false) AS this
      WHERE parent.isdir
    )
    SELECT path || filename AS path, size, isdir,
           pg_tablespace_location(pg_tablespace.oid) AS link_target
    FROM files
    LEFT OUTER JOIN pg_tablespace
        ON files.path = 'pg_tblspc/' AND pg_tablespace.oid::text = files.filename
";

const FETCH_CHUNKS_SQL: &str = "\
    SELECT path, begin,
           rewind_support.rewind_support_read_binary_file(path, begin, len, true) AS chunk
    FROM fetchchunks
";

pub struct LibpqSource {
    client: Client,
    helpers_installed: bool,
}

impl LibpqSource {
    /// Connect to the source server, check that it is fit to be copied
    /// from, and install the helper functions.
    pub fn connect(connstr: &str) -> Result<LibpqSource> {
        let mut client = Client::connect(connstr, NoTls)
            .context("could not connect to source server")?;
        debug!("connected to source server");

        let in_recovery: bool = client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .context("could not check source server state")?
            .get(0);
        ensure!(
            !in_recovery,
            "source server must not be in recovery, promote it first"
        );

        let full_page_writes: String = client
            .query_one("SHOW full_page_writes", &[])
            .context("could not check full_page_writes")?
            .get(0);
        ensure!(
            full_page_writes == "on",
            "full_page_writes must be enabled in the source server"
        );

        // Don't let this session wait for replication quorum a misconfigured
        // source might never reach.
        client
            .batch_execute("SET synchronous_commit = off")
            .context("could not set up connection")?;

        client
            .batch_execute(HELPER_SCHEMA_SQL)
            .context("could not install helper functions on the source server")?;

        Ok(LibpqSource {
            client,
            helpers_installed: true,
        })
    }

    fn drop_helpers(&mut self) -> Result<()> {
        if self.helpers_installed {
            self.client
                .batch_execute("DROP SCHEMA rewind_support CASCADE")
                .context("could not drop helper functions from the source server")?;
            self.helpers_installed = false;
        }
        Ok(())
    }

    /// Queue one byte range for fetching, split into chunks.
    fn send_range(
        writer: &mut impl Write,
        path: &str,
        mut begin: u64,
        end: u64,
    ) -> Result<()> {
        while begin < end {
            let len = std::cmp::min(end - begin, CHUNKSIZE);
            writeln!(writer, "{}\t{}\t{}", path, begin, len)
                .context("error sending COPY data")?;
            begin += len;
        }
        Ok(())
    }

    ///
    /// Run the ranged-read query and write the chunks it returns into the
    /// target. The results are consumed row by row; file contents never
    /// accumulate in memory.
    ///
    fn receive_file_chunks(&mut self, target: &mut TargetWriter) -> Result<()> {
        let mut rows = self
            .client
            .query_raw(FETCH_CHUNKS_SQL, std::iter::empty::<i32>())
            .context("could not send query to fetch remote files")?;

        while let Some(row) = rows.next().context("unexpected result while fetching remote files")? {
            let path: &str = row
                .try_get(0)
                .context("unexpected result set while fetching remote files")?;
            let chunkoff: i32 = row
                .try_get(1)
                .context("unexpected result set while fetching remote files")?;
            let chunk: Option<&[u8]> = row
                .try_get(2)
                .context("unexpected result set while fetching remote files")?;

            match chunk {
                Some(chunk) => {
                    debug!(
                        "received chunk for file \"{}\", off {}, len {}",
                        path,
                        chunkoff,
                        chunk.len()
                    );
                    target.open_target_file(path, false)?;
                    target.write_file_range(chunkoff as u64, chunk)?;
                }
                None => {
                    // The file vanished on the source after we listed it.
                    // There will be a WAL record about that; dropping our
                    // copy now keeps the target consistent with it.
                    warn!("file \"{}\" disappeared on the source, removing it", path);
                    target.close_target_file()?;
                    target.remove_target_file(path)?;
                }
            }
        }
        Ok(())
    }
}

impl Source for LibpqSource {
    fn list(&mut self) -> Result<Vec<FileListEntry>> {
        let rows = self
            .client
            .query(FILE_LIST_SQL, &[])
            .context("unexpected result while fetching file list")?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row
                .try_get(0)
                .context("unexpected result set while fetching file list")?;
            let size: i64 = row
                .try_get(1)
                .context("unexpected result set while fetching file list")?;
            let isdir: bool = row
                .try_get(2)
                .context("unexpected result set while fetching file list")?;
            let link_target: Option<String> = row
                .try_get(3)
                .context("unexpected result set while fetching file list")?;

            let ftype = if link_target.is_some() {
                FileType::Symlink
            } else if isdir {
                FileType::Directory
            } else {
                FileType::Regular
            };
            entries.push(FileListEntry {
                path,
                ftype,
                size: if ftype == FileType::Regular { size as u64 } else { 0 },
                link_target,
            });
        }
        Ok(entries)
    }

    fn fetch_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let row = self
            .client
            .query_one(
                "SELECT rewind_support.rewind_support_read_binary_file($1, 0, -1, false)",
                &[&path],
            )
            .with_context(|| format!("unexpected result while fetching remote file \"{}\"", path))?;
        let content: Vec<u8> = row
            .try_get(0)
            .with_context(|| format!("unexpected result set while fetching remote file \"{}\"", path))?;
        debug!("fetched file \"{}\", length {}", path, content.len());
        Ok(content)
    }

    fn execute_map(
        &mut self,
        _conf: &RewindConf,
        map: &FileMap,
        target: &mut TargetWriter,
    ) -> Result<()> {
        // First load the complete fetch plan into a temporary table; the
        // non-fetching actions run while it is built.
        self.client
            .batch_execute("CREATE TEMPORARY TABLE fetchchunks(path text, begin int4, len int4)")
            .context("error creating temporary table")?;

        let mut writer = self
            .client
            .copy_in("COPY fetchchunks FROM STDIN")
            .context("unexpected result while sending file list")?;

        for entry in map.entries() {
            for blkno in entry.pagemap.iter() {
                let offset = blkno as u64 * BLCKSZ as u64;
                Self::send_range(&mut writer, &entry.path, offset, offset + BLCKSZ as u64)?;
            }

            match entry.action {
                FileAction::None => {}
                FileAction::CopyWhole => {
                    // Truncate the old file out of the way, if any
                    target.open_target_file(&entry.path, true)?;
                    Self::send_range(&mut writer, &entry.path, 0, entry.newsize)?;
                }
                FileAction::CopyTail => {
                    Self::send_range(&mut writer, &entry.path, entry.oldsize, entry.newsize)?;
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

        writer.finish().context("error sending end-of-COPY")?;

        // Now drain the plan, writing chunks as they arrive.
        self.receive_file_chunks(target)?;
        target.close_target_file()
    }

    fn finish(&mut self) -> Result<()> {
        self.drop_helpers()
    }
}

impl Drop for LibpqSource {
    fn drop(&mut self) {
        if self.helpers_installed {
            if let Err(e) = self.drop_helpers() {
                warn!("{:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_chunked() {
        let mut buf: Vec<u8> = Vec::new();
        LibpqSource::send_range(&mut buf, "base/1/16384", 0, 2 * CHUNKSIZE + 100).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec![
                "base/1/16384\t0\t1000000",
                "base/1/16384\t1000000\t1000000",
                "base/1/16384\t2000000\t100",
            ]
        );
    }

    #[test]
    fn empty_range_sends_nothing() {
        let mut buf: Vec<u8> = Vec::new();
        LibpqSource::send_range(&mut buf, "x", 5, 5).unwrap();
        assert!(buf.is_empty());
    }
}
