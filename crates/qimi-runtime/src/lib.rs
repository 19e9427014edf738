//! Mount and exec orchestration for qimi.
//!
//! - [`mounter::MountManager`] turns an image path into a mounted
//!   directory and back, unwinding everything on a failed mount.
//! - [`exec::Executor`] runs a command chrooted into a mount point with
//!   the namespace mount set and a temporary resolv.conf.
//! - [`state::MountStore`] persists which images are mounted where.
//! - [`engine::Engine`] ties the three together for the CLI.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod exec;
pub mod mounter;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;
