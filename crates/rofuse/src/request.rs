//! Typed view over one raw request frame.

use crate::buf::PooledBuf;
use rofuse_kernel::{fuse_in_header, fuse_opcode};
use rustix::io::Errno;
use std::{ffi::OsStr, io, mem, os::unix::prelude::*};
use zerocopy::FromBytes;

/// One request dequeued from the kernel, backed by a pooled buffer.
///
/// Dropping the request returns its buffer to the pool.
pub(crate) struct Request {
    header: fuse_in_header,
    buf: PooledBuf,
}

impl Request {
    /// Wrap a filled buffer. The caller has already checked that at
    /// least a full `fuse_in_header` was read.
    pub(crate) fn new(buf: PooledBuf) -> io::Result<Self> {
        let (header, _) = fuse_in_header::read_from_prefix(&buf).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "dequeued request message is too short",
            )
        })?;
        Ok(Self { header, buf })
    }

    pub(crate) fn opcode(&self) -> Option<fuse_opcode> {
        fuse_opcode::from_raw(self.header.opcode)
    }

    pub(crate) fn raw_opcode(&self) -> u32 {
        self.header.opcode
    }

    pub(crate) fn unique(&self) -> u64 {
        self.header.unique
    }

    pub(crate) fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    pub(crate) fn uid(&self) -> u32 {
        self.header.uid
    }

    pub(crate) fn gid(&self) -> u32 {
        self.header.gid
    }

    pub(crate) fn pid(&self) -> u32 {
        self.header.pid
    }

    /// The raw bytes following the header.
    pub(crate) fn body(&self) -> &[u8] {
        &self.buf[mem::size_of::<fuse_in_header>()..]
    }

    /// Decode the fixed-layout argument at the front of the body.
    ///
    /// A body shorter than the expected record is a protocol-shape
    /// error and maps to `EINVAL`.
    pub(crate) fn fetch<T>(&self) -> Result<T, Errno>
    where
        T: FromBytes,
    {
        T::read_from_prefix(self.body())
            .map(|(arg, _)| arg)
            .map_err(|_| Errno::INVAL)
    }

    /// Extract the NUL-terminated name from the body.
    ///
    /// When no NUL byte is present the whole body is the name.
    pub(crate) fn filename(&self) -> &OsStr {
        let body = self.body();
        let name = match body.iter().position(|&b| b == b'\0') {
            Some(pos) => &body[..pos],
            None => body,
        };
        OsStr::from_bytes(name)
    }
}
