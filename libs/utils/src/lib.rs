//! Small shared utilities that are not specific to any one component.

pub mod logging;
pub mod lsn;
