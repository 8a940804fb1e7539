//! Mount setup: the step that produces an open descriptor to the
//! FUSE character device bound to a mount point.
//!
//! Two strategies are supported. The direct path calls `mount(2)`
//! itself and needs `CAP_SYS_ADMIN`; the default path delegates to
//! the setuid `fusermount3` helper and receives the descriptor over
//! a socketpair as ancillary data.

use crate::sharing::fdpass;
use libc::c_void;
use std::{
    ffi::CString,
    fs,
    io,
    os::{
        fd::{AsRawFd, OwnedFd},
        unix::{ffi::OsStrExt, net::UnixStream, process::CommandExt},
    },
    path::Path,
    process::Command,
};

pub(crate) const DEFAULT_MAX_READAHEAD: u32 = 128 * 1024;
pub(crate) const DEFAULT_MAX_WRITE: u32 = 128 * 1024;
pub(crate) const DEFAULT_MAX_BACKGROUND: u16 = 12;

const FUSE_DEVICE: &str = "/dev/fuse";
const FUSERMOUNT3_PROG: &str = "fusermount3";
const FUSERMOUNT_PROG: &str = "fusermount";
const FUSE_COMMFD_ENV: &str = "_FUSE_COMMFD";

/// Options controlling the mount and the INIT negotiation.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Enable verbose request logging.
    pub debug: bool,

    /// Maximum readahead size in bytes. Zero selects the 128 KiB
    /// default.
    pub max_readahead: u32,

    /// Maximum write size in bytes. Zero selects the 128 KiB
    /// default. The value also sizes the request read buffers.
    pub max_write: u32,

    /// Maximum number of background requests. Zero selects the
    /// default of 12.
    pub max_background: u16,

    /// Call `mount(2)` directly instead of going through
    /// `fusermount`. Requires root or `CAP_SYS_ADMIN`.
    pub direct_mount: bool,

    /// Allow other users to access the mount. Requires
    /// `user_allow_other` in `/etc/fuse.conf` for the helper path.
    pub allow_other: bool,

    /// Let the kernel perform its own permission checks.
    pub default_permissions: bool,

    /// Filesystem name shown in `/proc/mounts`.
    pub fsname: Option<String>,

    /// Filesystem subtype.
    pub subtype: Option<String>,
}

impl MountOptions {
    /// Fill unset numeric fields with the library defaults.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_readahead == 0 {
            self.max_readahead = DEFAULT_MAX_READAHEAD;
        }
        if self.max_write == 0 {
            self.max_write = DEFAULT_MAX_WRITE;
        }
        if self.max_background == 0 {
            self.max_background = DEFAULT_MAX_BACKGROUND;
        }
        self
    }
}

/// Mount a FUSE filesystem at `mountpoint` and return the device
/// descriptor.
pub(crate) fn mount(mountpoint: &Path, opts: &MountOptions) -> io::Result<OwnedFd> {
    let meta = fs::metadata(mountpoint)?;
    if !meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "mount point is not a directory",
        ));
    }

    if opts.direct_mount {
        mount_direct(mountpoint, opts)
    } else {
        mount_fusermount(mountpoint, opts)
    }
}

fn mount_direct(mountpoint: &Path, opts: &MountOptions) -> io::Result<OwnedFd> {
    let device = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(FUSE_DEVICE)?;
    let fd = OwnedFd::from(device);

    let mut data = format!(
        "fd={},rootmode=40755,user_id={},group_id={}",
        fd.as_raw_fd(),
        unsafe { libc::getuid() },
        unsafe { libc::getgid() },
    );
    if opts.allow_other {
        data.push_str(",allow_other");
    }
    if opts.default_permissions {
        data.push_str(",default_permissions");
    }

    let source = CString::new("fuse")?;
    let target = CString::new(mountpoint.as_os_str().as_bytes())?;
    let fstype = CString::new("fuse")?;
    let data = CString::new(data)?;

    syscall! {
        mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            libc::MS_NOSUID | libc::MS_NODEV,
            data.as_ptr() as *const c_void,
        )
    };

    Ok(fd)
}

fn fusermount_opts(opts: &MountOptions) -> String {
    let mut s = String::from("rw,nosuid,nodev");
    if opts.allow_other {
        s.push_str(",allow_other");
    }
    if opts.default_permissions {
        s.push_str(",default_permissions");
    }
    if let Some(fsname) = &opts.fsname {
        s.push_str(",fsname=");
        s.push_str(fsname);
    }
    if let Some(subtype) = &opts.subtype {
        s.push_str(",subtype=");
        s.push_str(subtype);
    }
    s
}

fn fusermount_command(prog: &str, mountpoint: &Path, opts: &MountOptions, comm: &UnixStream) -> Command {
    let mut cmd = Command::new(prog);
    cmd.arg("-o")
        .arg(fusermount_opts(opts))
        .arg("--")
        .arg(mountpoint)
        .env(FUSE_COMMFD_ENV, comm.as_raw_fd().to_string());

    // The communication socket has to survive the exec.
    let comm_fd = comm.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            if libc::fcntl(comm_fd, libc::F_SETFD, 0) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd
}

fn mount_fusermount(mountpoint: &Path, opts: &MountOptions) -> io::Result<OwnedFd> {
    let (input, output) = UnixStream::pair()?;

    let mut child = match fusermount_command(FUSERMOUNT3_PROG, mountpoint, opts, &output).spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fusermount_command(FUSERMOUNT_PROG, mountpoint, opts, &output).spawn()?
        }
        Err(err) => return Err(err),
    };
    drop(output);

    let status = child.wait()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("fusermount exited with {}", status),
        ));
    }

    fdpass::recv_fd(&input)
}

/// Detach the mount. Tries a lazy unmount first, then a plain one,
/// then falls back to `fusermount -u` for unprivileged processes.
pub(crate) fn unmount(mountpoint: &Path) -> io::Result<()> {
    let target = CString::new(mountpoint.as_os_str().as_bytes())?;

    let res = unsafe { libc::umount2(target.as_ptr(), libc::MNT_DETACH) };
    if res == 0 {
        return Ok(());
    }
    let res = unsafe { libc::umount2(target.as_ptr(), 0) };
    if res == 0 {
        return Ok(());
    }

    fusermount_unmount(mountpoint)
}

fn fusermount_unmount(mountpoint: &Path) -> io::Result<()> {
    for prog in [FUSERMOUNT3_PROG, FUSERMOUNT_PROG] {
        match Command::new(prog)
            .args(["-u", "-q", "-z", "--"])
            .arg(mountpoint)
            .status()
        {
            Ok(status) if status.success() => return Ok(()),
            Ok(status) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} -u exited with {}", prog, status),
                ))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "no fusermount helper found",
    ))
}
