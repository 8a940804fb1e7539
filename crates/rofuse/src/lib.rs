//! A read-only FUSE library for Rust.
//!
//! `rofuse` speaks the FUSE wire protocol with the kernel directly
//! through `/dev/fuse`: it reads binary request frames, dispatches
//! them to a [`Filesystem`] implementation, serializes the replies
//! and writes them back. No userspace helper library mediates the
//! I/O. Every mutating operation is answered with `EROFS` before the
//! filesystem is ever consulted.

#![forbid(clippy::todo, clippy::unimplemented)]

#[macro_use]
mod syscall;

mod buf;
mod bytes;
mod conn;
mod dirent;
mod error;
mod fs;
mod reply;
mod request;
mod server;
mod session;
mod types;

pub mod mount;
pub mod sharing;

pub use rustix::io::Errno;

pub use crate::{
    error::{errno_from_io, Error},
    fs::{Context, Filesystem},
    mount::MountOptions,
    server::Server,
    session::CapabilityFlags,
    types::{
        Attr, Config, DirEntry, DirEntryPlus, Entry, FileType, Forget, OpenFlags, Opened, StatFs,
        INVALID_INO, ROOT_INO,
    },
};
