//! In-process cloning of the FUSE device descriptor.

use rofuse_kernel::FUSE_DEV_IOC_CLONE;
use std::{
    fs, io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

const FUSE_DEVICE: &str = "/dev/fuse";

/// Open `/dev/fuse` afresh and bind the new descriptor to the same
/// session as `master`.
///
/// The clone is a parallel channel: requests read from it belong to
/// the same mount, so each worker task can read from its own
/// descriptor without contending on the master.
pub fn clone_fuse_fd(master: RawFd) -> io::Result<OwnedFd> {
    let device = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(FUSE_DEVICE)?;
    let fd = OwnedFd::from(device);

    let master = master as u32;
    syscall! { ioctl(fd.as_raw_fd(), FUSE_DEV_IOC_CLONE, &master as *const u32) };

    Ok(fd)
}

/// Clone `count` descriptors from `master`. Already-created clones
/// are closed again when a later clone fails.
pub fn clone_multiple(master: RawFd, count: usize) -> io::Result<Vec<OwnedFd>> {
    let mut fds = Vec::with_capacity(count);
    for _ in 0..count {
        fds.push(clone_fuse_fd(master)?);
    }
    Ok(fds)
}
