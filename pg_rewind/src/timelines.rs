//!
//! Parsing of timeline history files.
//!
//! A history file describes the ancestry of a timeline as a chain of
//! "<parent tli> <switchpoint> <reason>" lines, oldest first. Timeline 1
//! never has one.
//!

use anyhow::{bail, Result};
use postgres_ffi::TimeLineID;
use utils::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLineHistoryEntry {
    pub tli: TimeLineID,
    /// LSN where this timeline began on this branch.
    pub begin: Lsn,
    /// LSN where the next timeline on this branch began; 0 for the last
    /// entry, which is still current.
    pub end: Lsn,
}

///
/// Parse the contents of a history file for `target_tli`, returning the
/// ancestry oldest-first, terminated by the entry for `target_tli` itself.
///
pub fn parse_timeline_history(buf: &str, target_tli: TimeLineID) -> Result<Vec<TimeLineHistoryEntry>> {
    let mut entries: Vec<TimeLineHistoryEntry> = Vec::new();
    let mut last_tli: TimeLineID = 0;
    let mut last_end = Lsn(0);

    for line in buf.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (tli_str, lsn_str) = match (fields.next(), fields.next()) {
            (Some(t), Some(l)) => (t, l),
            _ => bail!("syntax error in history file: {}", line),
        };

        let tli: TimeLineID = match tli_str.parse() {
            Ok(tli) => tli,
            Err(_) => bail!("syntax error in history file: {}", line),
        };
        let switchpoint: Lsn = match lsn_str.parse() {
            Ok(lsn) => lsn,
            Err(_) => bail!("invalid LSN \"{}\" in history file", lsn_str),
        };

        if tli <= last_tli {
            bail!("timeline IDs must be in increasing sequence in history file");
        }

        entries.push(TimeLineHistoryEntry {
            tli,
            begin: last_end,
            end: switchpoint,
        });
        last_tli = tli;
        last_end = switchpoint;
    }

    if target_tli <= last_tli {
        bail!("timeline IDs must be less than child timeline's ID in history file");
    }

    // The target timeline is not listed in its own file; it is the branch
    // that is still current.
    entries.push(TimeLineHistoryEntry {
        tli: target_tli,
        begin: last_end,
        end: Lsn(0),
    });

    Ok(entries)
}
