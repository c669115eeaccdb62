//! Conflict detection: the global conflict counter and validation scans.
//!
//! Validation has a cheap path and an exact path. The cheap path compares
//! two loads of the [`counter::GlobalConflictCounter`]; the exact path in
//! [`detection`] re-probes the version of every tracked snapshot. The commit
//! protocol keeps the cheap path sound by signalling the counter whenever a
//! write replaces a value that some tracked reader still depends on.

pub(crate) mod counter;
pub(crate) mod detection;
