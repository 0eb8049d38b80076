//!
//! The top-level flow: sanity-check the two clusters, find the point where
//! their WAL histories diverged, compute the file map, execute it, and
//! leave a backup label behind so that the target starts recovery from the
//! last common checkpoint.
//!

use anyhow::{bail, Context, Result};
use tracing::info;
use utils::lsn::Lsn;

use postgres_ffi::controlfile::{decode_pg_control, ControlFileData};
use postgres_ffi::pg_constants;
use postgres_ffi::xlog_utils::{TimeLineHistoryFileName, XLogFileName};
use postgres_ffi::{TimeLineID, WAL_SEGMENT_SIZE};

use crate::fetch::{self, Source, TargetWriter};
use crate::filemap::FileMap;
use crate::parsexlog;
use crate::timelines::{parse_timeline_history, TimeLineHistoryEntry};
use crate::RewindConf;

///
/// Run the whole rewind. On success the target data directory is ready to
/// be started as a standby of the source.
///
pub fn run(conf: &RewindConf) -> Result<()> {
    let mut source = fetch::new_source(conf)?;
    let result = rewind(conf, source.as_mut());
    if result.is_ok() {
        source.finish()?;
    }
    result
}

fn rewind(conf: &RewindConf, source: &mut dyn Source) -> Result<()> {
    // Read in all the information we need from both clusters.
    let control_target = digest_control_file(&fetch::local::slurp_file(
        &conf.datadir_target,
        "global/pg_control",
    )?)?;
    let control_source = digest_control_file(&source.fetch_file("global/pg_control")?)?;

    sanity_checks(&control_target, &control_source)?;

    let target_tli = control_target.checkpoint_copy.this_timeline_id;
    let source_tli = control_source.checkpoint_copy.this_timeline_id;

    // If both clusters are on the same timeline, there's nothing to do.
    if target_tli == source_tli {
        bail!("source and target cluster are both on the same timeline.");
    }

    let (divergerec, lastcommontli) =
        find_common_ancestor_timeline(source, target_tli, source_tli)?;
    println!(
        "The servers diverged at WAL position {} on timeline {}.",
        divergerec, lastcommontli
    );

    // Check for the possibility that the target is in fact a direct
    // ancestor of the source. In that case, there is no divergent history
    // in the target that needs rewinding.
    let rewind_needed = if Lsn(control_target.checkpoint) >= divergerec {
        true
    } else {
        // Read the checkpoint record on the target to see where it ends.
        let chkptendrec = parsexlog::read_one_record(
            &conf.datadir_target,
            Lsn(control_target.checkpoint),
            target_tli,
        )?;
        // If the histories diverged exactly at the end of the shutdown
        // checkpoint record on the target, there are no WAL records in
        // the target that don't belong in the source's history, and no
        // rewind is needed.
        chkptendrec != divergerec
    };

    if !rewind_needed {
        println!("No rewind required.");
        return Ok(());
    }

    let (chkptrec, chkpttli, chkptredo) =
        parsexlog::find_last_checkpoint(&conf.datadir_target, divergerec, lastcommontli)?;
    println!(
        "Rewinding from last common checkpoint at {} on timeline {}",
        chkptrec, chkpttli
    );

    // Build the file map: what the source has, what the target has, and
    // which blocks the target wrote after the histories forked.
    let mut filemap = FileMap::new(conf.datadir_target.clone());
    for entry in source.list()? {
        filemap.process_source_file(
            &entry.path,
            entry.ftype,
            entry.size,
            entry.link_target.as_deref(),
        )?;
    }
    fetch::local::traverse_datadir(&conf.datadir_target, &mut |path, ftype, size, _link| {
        filemap.process_target_file(path, ftype, size)
    })?;
    parsexlog::extract_page_map(
        &conf.datadir_target,
        chkptrec,
        chkpttli,
        divergerec,
        &mut filemap,
    )?;
    filemap.finalize();

    if conf.verbose {
        print!("{}", filemap);
    }

    // Ok, we're ready to start copying things over.
    let mut target = TargetWriter::new(conf.datadir_target.clone(), conf.dry_run);
    source.execute_map(conf, &filemap, &mut target)?;

    create_backup_label(&mut target, chkptredo, chkpttli, chkptrec)?;

    target.sync_target()?;

    println!("Done!");
    Ok(())
}

/// Verify and decode a buffer that should hold a control file.
fn digest_control_file(buf: &[u8]) -> Result<ControlFileData> {
    decode_pg_control(buf)
}

fn sanity_checks(
    control_target: &ControlFileData,
    control_source: &ControlFileData,
) -> Result<()> {
    if control_target.system_identifier != control_source.system_identifier {
        bail!("source and target clusters are from different systems");
    }

    if control_target.pg_control_version != pg_constants::PG_CONTROL_VERSION
        || control_source.pg_control_version != pg_constants::PG_CONTROL_VERSION
        || control_target.catalog_version_no != pg_constants::CATALOG_VERSION_NO
        || control_source.catalog_version_no != pg_constants::CATALOG_VERSION_NO
    {
        bail!("clusters are not compatible with this version of pg_rewind");
    }

    // The target must detect pages that were touched without a covering
    // full-page image: either page checksums or logged hint bits do that.
    if control_target.data_checksum_version != pg_constants::PG_DATA_CHECKSUM_VERSION
        && control_target.wal_log_hints == 0
    {
        bail!("target master needs to use either data checksums or \"wal_log_hints = on\"");
    }

    // The target better not be running. This doesn't guard against someone
    // starting it concurrently, and it's stricter than necessary, but a
    // half-applied file map on a crashed cluster is not worth the risk.
    if control_target.state != pg_constants::DB_SHUTDOWNED {
        bail!("target master must be shut down cleanly.");
    }

    Ok(())
}

///
/// Determine the last common timeline in the histories of the two
/// clusters, and the position where the histories diverged: the first
/// WAL position that is not the same in both.
///
fn find_common_ancestor_timeline(
    source: &mut dyn Source,
    target_tli: TimeLineID,
    source_tli: TimeLineID,
) -> Result<(Lsn, TimeLineID)> {
    // Timeline 1 does not have a history file.
    let history: Vec<TimeLineHistoryEntry> = if source_tli == 1 {
        vec![TimeLineHistoryEntry {
            tli: 1,
            begin: Lsn(0),
            end: Lsn(0),
        }]
    } else {
        let path = format!("pg_xlog/{}", TimeLineHistoryFileName(source_tli));
        let histfile = source.fetch_file(&path)?;
        let histfile = std::str::from_utf8(&histfile)
            .with_context(|| format!("history file \"{}\" is not valid text", path))?;
        parse_timeline_history(histfile, source_tli)?
    };

    // Trace the history backwards, until we hit the target's current
    // timeline. The switch point recorded there is where the source's
    // history stopped matching.
    for entry in history.iter().rev() {
        if entry.tli == target_tli {
            return Ok((entry.end, entry.tli));
        }
    }

    bail!("could not find common ancestor of the source and target cluster's timelines");
}

///
/// Create a backup_label file that forces recovery to begin at the last
/// common checkpoint.
///
fn create_backup_label(
    target: &mut TargetWriter,
    startpoint: Lsn,
    starttli: TimeLineID,
    checkpointloc: Lsn,
) -> Result<()> {
    let startsegno = startpoint.segment_number(WAL_SEGMENT_SIZE);
    let xlogfilename = XLogFileName(starttli, startsegno, WAL_SEGMENT_SIZE);
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");

    let content = format!(
        "START WAL LOCATION: {} (file {})\n\
         CHECKPOINT LOCATION: {}\n\
         BACKUP METHOD: rewound with pg_rewind\n\
         BACKUP FROM: master\n\
         START TIME: {}\n",
        startpoint, xlogfilename, checkpointloc, stamp
    );

    info!("writing backup label with checkpoint at {}", checkpointloc);
    target
        .write_whole_file("backup_label", content.as_bytes())
        .context("could not write backup label file")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(sysid: u64, tli: u32, state: u32) -> ControlFileData {
        let mut cf = ControlFileData {
            system_identifier: sysid,
            pg_control_version: pg_constants::PG_CONTROL_VERSION,
            catalog_version_no: pg_constants::CATALOG_VERSION_NO,
            state,
            data_checksum_version: pg_constants::PG_DATA_CHECKSUM_VERSION,
            ..Default::default()
        };
        cf.checkpoint_copy.this_timeline_id = tli;
        cf
    }

    #[test]
    fn sanity_rejects_mismatched_systems() {
        let target = control(1, 1, pg_constants::DB_SHUTDOWNED);
        let source = control(2, 2, pg_constants::DB_SHUTDOWNED);
        let err = sanity_checks(&target, &source).unwrap_err();
        assert!(err.to_string().contains("different systems"));
    }

    #[test]
    fn sanity_rejects_running_target() {
        let target = control(1, 1, pg_constants::DB_IN_PRODUCTION);
        let source = control(1, 2, pg_constants::DB_SHUTDOWNED);
        let err = sanity_checks(&target, &source).unwrap_err();
        assert!(err.to_string().contains("shut down cleanly"));
    }

    #[test]
    fn sanity_requires_checksums_or_hint_logging() {
        let mut target = control(1, 1, pg_constants::DB_SHUTDOWNED);
        let source = control(1, 2, pg_constants::DB_SHUTDOWNED);

        target.data_checksum_version = 0;
        assert!(sanity_checks(&target, &source).is_err());

        target.wal_log_hints = 1;
        assert!(sanity_checks(&target, &source).is_ok());
    }

    #[test]
    fn sanity_rejects_version_mismatch() {
        let mut target = control(1, 1, pg_constants::DB_SHUTDOWNED);
        let source = control(1, 2, pg_constants::DB_SHUTDOWNED);
        target.catalog_version_no += 1;
        let err = sanity_checks(&target, &source).unwrap_err();
        assert!(err.to_string().contains("not compatible"));
    }
}
