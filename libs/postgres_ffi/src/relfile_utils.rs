//!
//! Common utilities for dealing with PostgreSQL relation files.
//!
use crate::pg_constants;
use crate::RelFileNode;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FilePathError {
    #[error("invalid relation fork name")]
    InvalidForkName,
    #[error("invalid relation data file name")]
    InvalidFileName,
}

impl From<core::num::ParseIntError> for FilePathError {
    fn from(_e: core::num::ParseIntError) -> Self {
        FilePathError::InvalidFileName
    }
}

/// Convert a Postgres relation file's fork suffix to the fork number.
pub fn forkname_to_number(forkname: Option<&str>) -> Result<u8, FilePathError> {
    match forkname {
        // "main" is not in filenames, it's implicit if the fork name is not present
        None => Ok(pg_constants::MAIN_FORKNUM),
        Some("fsm") => Ok(pg_constants::FSM_FORKNUM),
        Some("vm") => Ok(pg_constants::VISIBILITYMAP_FORKNUM),
        Some("init") => Ok(pg_constants::INIT_FORKNUM),
        Some(_) => Err(FilePathError::InvalidForkName),
    }
}

/// Convert a Postgres fork number to the right suffix of the relation data file.
pub fn forknumber_to_name(forknum: u8) -> Option<&'static str> {
    match forknum {
        pg_constants::MAIN_FORKNUM => None,
        pg_constants::FSM_FORKNUM => Some("fsm"),
        pg_constants::VISIBILITYMAP_FORKNUM => Some("vm"),
        pg_constants::INIT_FORKNUM => Some("init"),
        _ => panic!("unrecognized fork number"),
    }
}

///
/// Parse a filename of a relation file. Returns (relfilenode, forknum, segno) tuple.
///
/// Formats:
/// <oid>
/// <oid>_<fork name>
/// <oid>.<segment number>
/// <oid>_<fork name>.<segment number>
///
/// See functions relpath() and _mdfd_segpath() in PostgreSQL sources.
///
pub fn parse_relfilename(fname: &str) -> Result<(u32, u8, u32), FilePathError> {
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(?P<relnode>\d+)(_(?P<forkname>[a-z]+))?(\.(?P<segno>\d+))?$").unwrap()
    });

    let caps = RE.captures(fname).ok_or(FilePathError::InvalidFileName)?;

    let relnode_str = caps.name("relnode").unwrap().as_str();
    let relnode = relnode_str.parse::<u32>()?;

    let forkname = caps.name("forkname").map(|f| f.as_str());
    let forknum = forkname_to_number(forkname)?;

    let segno = match caps.name("segno") {
        None => 0,
        Some(segno) => segno.as_str().parse::<u32>()?,
    };

    Ok((relnode, forknum, segno))
}

/// Name of one segment file of a relation fork, without the directory part.
fn relfilename(relnode: u32, forknum: u8, segno: u32) -> String {
    let mut name = match forknumber_to_name(forknum) {
        None => format!("{}", relnode),
        Some(fork) => format!("{}_{}", relnode, fork),
    };
    if segno != 0 {
        name = format!("{}.{}", name, segno);
    }
    name
}

///
/// Path of one segment file of a relation fork, relative to the data
/// directory root. The inverse of parsing the path components with
/// `parse_relfilename`; the mapping is byte-exact.
///
pub fn datasegpath(rnode: RelFileNode, forknum: u8, segno: u32) -> String {
    let fname = relfilename(rnode.relnode, forknum, segno);
    if rnode.spcnode == pg_constants::GLOBALTABLESPACE_OID {
        format!("global/{}", fname)
    } else if rnode.spcnode == pg_constants::DEFAULTTABLESPACE_OID {
        format!("base/{}/{}", rnode.dbnode, fname)
    } else {
        format!(
            "pg_tblspc/{}/{}/{}/{}",
            rnode.spcnode,
            pg_constants::TABLESPACE_VERSION_DIRECTORY,
            rnode.dbnode,
            fname
        )
    }
}
