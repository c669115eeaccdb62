//! Transactional reference cells and their ownership records.
//!
//! [`tref::TRef`] is the public handle to a versioned shared value; the
//! [`orec`] module holds the packed atomic word that coordinates readers,
//! writers, and the read-biased optimization behind every reference.

pub(crate) mod orec;
pub mod tref;
