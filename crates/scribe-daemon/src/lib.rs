//! scribe-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod dir_remote;

pub use dir_remote::DirRemote;
