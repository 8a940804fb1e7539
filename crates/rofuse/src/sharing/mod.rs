//! Sharing a FUSE session across tasks and processes.
//!
//! Two independent mechanisms expose the same kernel session: an
//! in-process clone of the device descriptor through the
//! `FUSE_DEV_IOC_CLONE` ioctl, and an out-of-band handoff of cloned
//! descriptors between processes over a local-domain socket with
//! rights transfer.

mod clone;
mod coordinator;
pub mod fdpass;

pub use clone::{clone_fuse_fd, clone_multiple};
pub use coordinator::{Coordinator, WorkerClient};
