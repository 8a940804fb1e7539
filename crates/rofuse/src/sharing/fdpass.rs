//! Descriptor transfer over connected local-domain sockets.

use libc::{c_int, c_void, cmsghdr, iovec, msghdr};
use std::{
    io,
    mem::{self, MaybeUninit},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
};

#[repr(C)]
struct Cmsg {
    header: cmsghdr,
    fd: c_int,
}

/// Send one descriptor as `SCM_RIGHTS` ancillary data.
///
/// A single inline byte accompanies the rights transfer; the
/// receiver ignores it.
pub fn send_fd(conn: &UnixStream, fd: RawFd) -> io::Result<()> {
    let mut buf = [0u8; 1];
    let mut iov = iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: 1,
    };

    let mut cmsg = MaybeUninit::<Cmsg>::zeroed();
    unsafe {
        let cmsg = &mut *cmsg.as_mut_ptr();
        cmsg.header.cmsg_len = (mem::size_of::<cmsghdr>() + mem::size_of::<c_int>()) as _;
        cmsg.header.cmsg_level = libc::SOL_SOCKET;
        cmsg.header.cmsg_type = libc::SCM_RIGHTS;
        cmsg.fd = fd;
    }

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of::<Cmsg>();

    syscall! { sendmsg(conn.as_raw_fd(), &msg, 0) };
    Ok(())
}

/// Receive one descriptor sent by [`send_fd`].
pub fn recv_fd(conn: &UnixStream) -> io::Result<OwnedFd> {
    let mut buf = [0u8; 1];
    let mut iov = iovec {
        iov_base: buf.as_mut_ptr() as *mut c_void,
        iov_len: 1,
    };

    let mut cmsg = MaybeUninit::<Cmsg>::uninit();

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of::<Cmsg>();

    syscall! { recvmsg(conn.as_raw_fd(), &mut msg, 0) };

    if msg.msg_controllen < mem::size_of::<Cmsg>() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "too short control message length",
        ));
    }
    let cmsg = unsafe { cmsg.assume_init() };

    if cmsg.header.cmsg_level != libc::SOL_SOCKET || cmsg.header.cmsg_type != libc::SCM_RIGHTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "got control message with unknown type",
        ));
    }

    let fd = cmsg.fd;
    syscall! { fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
