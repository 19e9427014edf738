//! # qimi-core
//!
//! Host-side primitives for attaching a disk image and preparing it as a
//! chroot target.
//!
//! This crate provides:
//! - **Commands**: the [`command::CommandRunner`] seam every external tool
//!   call goes through.
//! - **NBD**: device-pool allocation, image attach/detach, partition
//!   discovery and root-partition selection.
//! - **Namespace**: the proc/sys/dev/tmp mount set under a guest root, issued
//!   through `mount(2)`/`umount2(2)` behind [`namespace::ops::MountOps`], with
//!   guarded teardown that refuses to unmount anything outside it.
//! - **DNS**: one-shot backup and exact restore of the guest's resolv.conf.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod command;
pub mod dns;
pub mod mount_table;
pub mod namespace;
pub mod nbd;
