//! Subcommand implementations for the `mnemos` binary.

pub mod breaker;
pub mod doctor;
pub mod enqueue;
pub mod events;
pub mod queue;
pub mod refs;
pub mod work;
