//! Memory lifecycle bookkeeping.

pub mod references;
