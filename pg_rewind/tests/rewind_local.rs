//!
//! End-to-end runs against a pair of hand-crafted cluster data
//! directories, using the local source back-end.
//!

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use pg_rewind::{rewind, RewindConf};
use postgres_ffi::controlfile::{encode_pg_control, ControlFileData};
use postgres_ffi::pg_constants;
use postgres_ffi::walgen::WalGenerator;
use postgres_ffi::{RelFileNode, BLCKSZ};
use utils::lsn::Lsn;

const SYSID: u64 = 0x1122_3344_5566_7788;
const BLCK: usize = BLCKSZ as usize;

fn rnode(relnode: u32) -> RelFileNode {
    RelFileNode {
        spcnode: pg_constants::DEFAULTTABLESPACE_OID,
        dbnode: 1,
        relnode,
    }
}

fn make_controlfile(tli: u32, checkpoint: Lsn, redo: Lsn) -> Vec<u8> {
    let mut cf = ControlFileData {
        system_identifier: SYSID,
        pg_control_version: pg_constants::PG_CONTROL_VERSION,
        catalog_version_no: pg_constants::CATALOG_VERSION_NO,
        state: pg_constants::DB_SHUTDOWNED,
        checkpoint: checkpoint.0,
        data_checksum_version: pg_constants::PG_DATA_CHECKSUM_VERSION,
        ..Default::default()
    };
    cf.checkpoint_copy.redo = redo.0;
    cf.checkpoint_copy.this_timeline_id = tli;
    cf.checkpoint_copy.full_page_writes = 1;
    encode_pg_control(&cf).to_vec()
}

fn write_datadir_skeleton(root: &Utf8Path) {
    for dir in ["global", "base", "base/1", "pg_xlog"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    fs::write(root.join("PG_VERSION"), "9.5\n").unwrap();
}

/// A relation file whose block `i` is filled with `tag ^ i`.
fn rel_content(tag: u8, nblocks: usize) -> Vec<u8> {
    let mut content = Vec::with_capacity(nblocks * BLCK);
    for i in 0..nblocks {
        content.extend(std::iter::repeat(tag ^ (i as u8)).take(BLCK));
    }
    content
}

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

struct DivergedPair {
    _target_dir: tempfile::TempDir,
    target: Utf8PathBuf,
    _source_dir: tempfile::TempDir,
    source: Utf8PathBuf,
    checkpoint: Lsn,
}

///
/// Two clusters that share history on timeline 1 up to a divergence point,
/// where the source was promoted to timeline 2. Before the divergence the
/// target wrote blocks 0..=2 of base/1/16384 (3 blocks on the target, 9 on
/// the source); after it the target wrote one more record of its own.
///
fn build_diverged_pair() -> DivergedPair {
    let (target_dir, target) = scratch();
    let (source_dir, source) = scratch();

    // Shared and target-only WAL, all on timeline 1.
    let mut gen = WalGenerator::new(1, SYSID);
    let (checkpoint, _) = gen.append_checkpoint();
    for blkno in 0..3 {
        gen.append_record(pg_constants::RM_HEAP_ID, 0, &[(rnode(16384), 0, blkno)], b"w");
    }
    let (_, divergence) = gen.append_record(pg_constants::RM_XACT_ID, 0x00, &[], b"commit");
    // diverged: this record exists only on the target
    gen.append_record(pg_constants::RM_HEAP_ID, 0, &[(rnode(16384), 0, 2)], b"w2");

    write_datadir_skeleton(&target);
    gen.write_segments(target.join("pg_xlog").as_std_path()).unwrap();
    fs::write(
        target.join("global/pg_control"),
        make_controlfile(1, checkpoint, checkpoint),
    )
    .unwrap();
    fs::write(target.join("base/1/16384"), rel_content(0xAA, 3)).unwrap();
    // only the target has this one
    fs::write(target.join("base/1/99999"), rel_content(0xEE, 1)).unwrap();

    write_datadir_skeleton(&source);
    fs::write(
        source.join("global/pg_control"),
        make_controlfile(2, divergence, divergence),
    )
    .unwrap();
    fs::write(
        source.join("pg_xlog/00000002.history"),
        format!("1\t{}\tno recovery target specified\n", divergence),
    )
    .unwrap();
    fs::write(source.join("base/1/16384"), rel_content(0xBB, 9)).unwrap();
    // only the source has this one
    fs::write(source.join("base/1/70000"), rel_content(0xCC, 2)).unwrap();

    DivergedPair {
        _target_dir: target_dir,
        target,
        _source_dir: source_dir,
        source,
        checkpoint,
    }
}

fn conf_for(pair: &DivergedPair, dry_run: bool) -> RewindConf {
    RewindConf {
        datadir_target: pair.target.clone(),
        datadir_source: Some(pair.source.clone()),
        connstr_source: None,
        dry_run,
        verbose: true,
    }
}

#[test]
fn basic_divergence_is_rewound() {
    let pair = build_diverged_pair();
    rewind::run(&conf_for(&pair, false)).unwrap();

    // The shared relation matches the source byte for byte: the tail was
    // copied whole and the locally-written blocks were fetched again.
    assert_eq!(
        fs::read(pair.target.join("base/1/16384")).unwrap(),
        fs::read(pair.source.join("base/1/16384")).unwrap(),
    );

    // Files only the source had were copied, files only the target had
    // were removed.
    assert_eq!(
        fs::read(pair.target.join("base/1/70000")).unwrap(),
        rel_content(0xCC, 2)
    );
    assert!(!pair.target.join("base/1/99999").exists());

    // The source's control file and history file took over.
    assert_eq!(
        fs::read(pair.target.join("global/pg_control")).unwrap(),
        fs::read(pair.source.join("global/pg_control")).unwrap(),
    );
    assert!(pair.target.join("pg_xlog/00000002.history").exists());

    // The target's diverged WAL is gone.
    assert!(!pair.target.join("pg_xlog/000000010000000000000001").exists());

    // PG_VERSION was left alone.
    assert_eq!(fs::read(pair.target.join("PG_VERSION")).unwrap(), b"9.5\n");
}

#[test]
fn backup_label_points_at_last_common_checkpoint() {
    let pair = build_diverged_pair();
    rewind::run(&conf_for(&pair, false)).unwrap();

    let label = fs::read_to_string(pair.target.join("backup_label")).unwrap();
    assert!(label.starts_with(&format!(
        "START WAL LOCATION: {} (file 000000010000000000000001)\n",
        pair.checkpoint
    )));
    assert!(label.contains(&format!("CHECKPOINT LOCATION: {}\n", pair.checkpoint)));
    assert!(label.contains("BACKUP METHOD: rewound with pg_rewind\n"));
    assert!(label.contains("BACKUP FROM: master\n"));
    assert!(label.contains("START TIME: "));
}

#[test]
fn dry_run_changes_nothing() {
    let pair = build_diverged_pair();
    rewind::run(&conf_for(&pair, true)).unwrap();

    assert_eq!(
        fs::read(pair.target.join("base/1/16384")).unwrap(),
        rel_content(0xAA, 3)
    );
    assert!(pair.target.join("base/1/99999").exists());
    assert!(!pair.target.join("base/1/70000").exists());
    assert!(!pair.target.join("backup_label").exists());
}

#[test]
fn ancestor_target_needs_no_rewind() {
    let (_target_dir, target) = scratch();
    let (_source_dir, source) = scratch();

    // The target's WAL is nothing but its shutdown checkpoint, and the
    // histories forked exactly where that record ends.
    let mut gen = WalGenerator::new(1, SYSID);
    let (checkpoint, chkpt_end) = gen.append_checkpoint();

    write_datadir_skeleton(&target);
    gen.write_segments(target.join("pg_xlog").as_std_path()).unwrap();
    fs::write(
        target.join("global/pg_control"),
        make_controlfile(1, checkpoint, checkpoint),
    )
    .unwrap();
    fs::write(target.join("base/1/16384"), rel_content(0xAA, 3)).unwrap();

    write_datadir_skeleton(&source);
    fs::write(
        source.join("global/pg_control"),
        make_controlfile(2, chkpt_end, chkpt_end),
    )
    .unwrap();
    fs::write(
        source.join("pg_xlog/00000002.history"),
        format!("1\t{}\tno recovery target specified\n", chkpt_end),
    )
    .unwrap();
    fs::write(source.join("base/1/16384"), rel_content(0xBB, 9)).unwrap();

    let conf = RewindConf {
        datadir_target: target.clone(),
        datadir_source: Some(source),
        connstr_source: None,
        dry_run: false,
        verbose: false,
    };
    rewind::run(&conf).unwrap();

    // nothing was mutated
    assert_eq!(
        fs::read(target.join("base/1/16384")).unwrap(),
        rel_content(0xAA, 3)
    );
    assert!(!target.join("backup_label").exists());
}

#[test]
fn same_timeline_is_rejected() {
    let (_target_dir, target) = scratch();
    let (_source_dir, source) = scratch();

    write_datadir_skeleton(&target);
    fs::write(
        target.join("global/pg_control"),
        make_controlfile(5, Lsn(0x1000028), Lsn(0x1000028)),
    )
    .unwrap();

    write_datadir_skeleton(&source);
    fs::write(
        source.join("global/pg_control"),
        make_controlfile(5, Lsn(0x1000028), Lsn(0x1000028)),
    )
    .unwrap();

    let conf = RewindConf {
        datadir_target: target,
        datadir_source: Some(source),
        connstr_source: None,
        dry_run: false,
        verbose: false,
    };
    let err = rewind::run(&conf).unwrap_err();
    assert_eq!(
        err.to_string(),
        "source and target cluster are both on the same timeline."
    );
}
