//! The connection with the FUSE kernel driver.

use crate::{
    buf::BufferPool,
    error::Error,
    request::Request,
};
use libc::c_void;
use rofuse_kernel::fuse_in_header;
use std::{
    io, mem,
    os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicI32, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::Mutex, task};

/// Owns the device descriptor for one FUSE session.
///
/// Reads are issued one at a time by the serve loop; writes may come
/// from any worker task and are totally serialized by a mutex so
/// that reply frames are never interleaved.
#[derive(Debug)]
pub(crate) struct Connection {
    /// The raw descriptor, or -1 once the connection was closed.
    fd: AtomicI32,
    write_lock: Mutex<()>,
    /// Negotiated protocol version, packed as `major << 32 | minor`.
    /// Zero until the INIT exchange completes.
    proto: AtomicU64,
}

impl Connection {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self {
            fd: AtomicI32::new(fd.into_raw_fd()),
            write_lock: Mutex::new(()),
            proto: AtomicU64::new(0),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        match self.fd.load(Ordering::Acquire) {
            -1 => None,
            fd => Some(fd),
        }
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.raw_fd().is_some()
    }

    pub(crate) fn set_protocol_version(&self, major: u32, minor: u32) {
        self.proto
            .store(u64::from(major) << 32 | u64::from(minor), Ordering::Release);
    }

    pub(crate) fn protocol_version(&self) -> Option<(u32, u32)> {
        match self.proto.load(Ordering::Acquire) {
            0 => None,
            packed => Some(((packed >> 32) as u32, packed as u32)),
        }
    }

    /// Dequeue the next request frame from the device.
    ///
    /// The read blocks until the kernel has a request, so it runs on
    /// the blocking thread pool. `Error::NotMounted` reports that the
    /// kernel tore the session down; `Error::Interrupted` asks the
    /// caller to retry.
    pub(crate) async fn read_request(
        self: &Arc<Self>,
        pool: &Arc<BufferPool>,
    ) -> Result<Request, Error> {
        let conn = Arc::clone(self);
        let pool = Arc::clone(pool);
        match task::spawn_blocking(move || conn.read_request_blocking(&pool)).await {
            Ok(res) => res,
            Err(err) => Err(Error::Io(io::Error::new(io::ErrorKind::Other, err))),
        }
    }

    fn read_request_blocking(&self, pool: &Arc<BufferPool>) -> Result<Request, Error> {
        let fd = self.raw_fd().ok_or(Error::NotMounted)?;
        let mut buf = pool.get();

        let dst = buf.as_full_mut();
        let res = unsafe { libc::read(fd, dst.as_mut_ptr() as *mut c_void, dst.len()) };
        if res == -1 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENODEV) => {
                    tracing::debug!("ENODEV");
                    Error::NotMounted
                }
                Some(libc::EINTR) | Some(libc::ENOENT) => Error::Interrupted,
                _ => Error::Io(err),
            });
        }

        let len = res as usize;
        if len < mem::size_of::<fuse_in_header>() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "dequeued request message is too short",
            )));
        }
        buf.set_len(len);

        Request::new(buf).map_err(Error::Io)
    }

    /// Write one complete reply frame to the device.
    ///
    /// Zero-length writes are not issued. The frame starts with an
    /// out-header whose `len` equals the total frame length, so a
    /// short write is a hard error.
    pub(crate) async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if frame.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let fd = self
            .raw_fd()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENODEV))?;

        let res = syscall! { write(fd, frame.as_ptr() as *const c_void, frame.len()) };
        if (res as usize) < frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "written reply frame is too short",
            ));
        }
        Ok(())
    }

    /// Close the device descriptor. Repeated calls are no-ops.
    pub(crate) fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
