//! Request dispatch and protocol negotiation.

use crate::{
    conn::Connection,
    dirent::{ReaddirOut, ReaddirplusOut},
    fs::{Context, Filesystem},
    mount::MountOptions,
    reply,
    request::Request,
    types::{Config, FileType, Forget},
};
use bitflags::bitflags;
use rofuse_kernel::{self as kernel, fuse_opcode};
use rustix::io::Errno;
use std::{cmp, io, sync::RwLock};
use tokio_util::sync::CancellationToken;
use zerocopy::FromBytes;

/// The default validity period reported for attributes fetched via
/// GETATTR.
const DEFAULT_ATTR_TIMEOUT_SECS: u64 = 1;

/// The timestamp granularity advertised to the kernel, in
/// nanoseconds.
const DEFAULT_TIME_GRAN: u32 = 1;

/// The default number of pages per request (32 * 4096 = 128 KiB).
const DEFAULT_MAX_PAGES: u16 = 32;

bitflags! {
    /// Capability flags advertised to the kernel driver during the
    /// INIT exchange.
    ///
    /// The reply carries the intersection of this set with whatever
    /// the kernel offered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CapabilityFlags: u32 {
        /// The kernel may issue read requests asynchronously.
        const ASYNC_READ = kernel::FUSE_ASYNC_READ;

        /// The kernel supports parallel directory operations.
        const PARALLEL_DIROPS = kernel::FUSE_PARALLEL_DIROPS;

        /// The kernel checks the validity of cached attributes on
        /// every read.
        const AUTO_INVAL_DATA = kernel::FUSE_AUTO_INVAL_DATA;

        /// The filesystem answers READDIRPLUS requests.
        const READDIRPLUS = kernel::FUSE_DO_READDIRPLUS;

        /// The kernel chooses adaptively between READDIR and
        /// READDIRPLUS.
        const READDIRPLUS_AUTO = kernel::FUSE_READDIRPLUS_AUTO;

        /// Symlink targets may be cached by the kernel.
        const CACHE_SYMLINKS = kernel::FUSE_CACHE_SYMLINKS;

        /// Lookups of `"."` and `".."` are supported, for NFS
        /// exporting.
        const EXPORT_SUPPORT = kernel::FUSE_EXPORT_SUPPORT;

        /// The `max_pages` field of the INIT reply is honored.
        const MAX_PAGES = kernel::FUSE_MAX_PAGES;
    }
}

impl Default for CapabilityFlags {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Default)]
struct State {
    initialized: bool,
    destroyed: bool,
    config: Option<Config>,
}

/// Per-session dispatch state: the mount parameters that feed the
/// INIT negotiation and the `initialized`/`destroyed` flags.
#[derive(Debug)]
pub(crate) struct Session {
    max_readahead: u32,
    max_write: u32,
    max_background: u16,
    flags: CapabilityFlags,
    state: RwLock<State>,
}

impl Session {
    pub(crate) fn new(opts: &MountOptions) -> Self {
        Self {
            max_readahead: opts.max_readahead,
            max_write: opts.max_write,
            max_background: opts.max_background,
            flags: CapabilityFlags::default(),
            state: RwLock::new(State::default()),
        }
    }

    pub(crate) fn initialized(&self) -> bool {
        self.state.read().expect("session lock poisoned").initialized
    }

    pub(crate) fn destroyed(&self) -> bool {
        self.state.read().expect("session lock poisoned").destroyed
    }

    pub(crate) fn config(&self) -> Option<Config> {
        self.state.read().expect("session lock poisoned").config
    }

    /// Handle one request end to end: decode, invoke the filesystem,
    /// reply. The returned error covers only reply-write failures;
    /// filesystem errors travel to the kernel inside the reply
    /// header.
    pub(crate) async fn process<F>(
        &self,
        fs: &F,
        conn: &Connection,
        req: &Request,
        cancel: &CancellationToken,
    ) -> io::Result<()>
    where
        F: Filesystem,
    {
        let opcode = match req.opcode() {
            Some(opcode) => opcode,
            None => {
                tracing::debug!(opcode = req.raw_opcode(), "unknown opcode");
                return reply::send_error(conn, req.unique(), Errno::NOSYS).await;
            }
        };

        // Mutating operations are rejected before the filesystem is
        // ever consulted.
        if is_write_opcode(opcode) {
            return reply::send_error(conn, req.unique(), Errno::ROFS).await;
        }

        let cx = Context::new(
            req.uid(),
            req.gid(),
            req.pid(),
            req.unique(),
            cancel.clone(),
        );

        self.dispatch(fs, conn, &cx, req, opcode).await
    }

    async fn dispatch<F>(
        &self,
        fs: &F,
        conn: &Connection,
        cx: &Context,
        req: &Request,
        opcode: fuse_opcode,
    ) -> io::Result<()>
    where
        F: Filesystem,
    {
        let unique = req.unique();
        let ino = req.nodeid();

        match opcode {
            fuse_opcode::FUSE_INIT => self.handle_init(fs, conn, cx, req).await,

            fuse_opcode::FUSE_DESTROY => {
                fs.destroy(cx).await;
                self.state.write().expect("session lock poisoned").destroyed = true;
                reply::send_reply(conn, unique, ()).await
            }

            fuse_opcode::FUSE_LOOKUP => match fs.lookup(cx, ino, req.filename()).await {
                Ok(entry) => reply::send_reply(conn, unique, entry.to_wire()).await,
                Err(errno) => reply::send_error(conn, unique, errno).await,
            },

            // FORGET and BATCH_FORGET are never replied to, not even
            // on a malformed body.
            fuse_opcode::FUSE_FORGET => {
                if let Ok(arg) = req.fetch::<kernel::fuse_forget_in>() {
                    fs.forget(cx, ino, arg.nlookup).await;
                }
                Ok(())
            }

            fuse_opcode::FUSE_BATCH_FORGET => {
                let forgets = decode_batch_forget(req.body());
                fs.batch_forget(cx, &forgets).await;
                Ok(())
            }

            fuse_opcode::FUSE_GETATTR => {
                let arg = match req.fetch::<kernel::fuse_getattr_in>() {
                    Ok(arg) => arg,
                    Err(errno) => return reply::send_error(conn, unique, errno).await,
                };
                let fh = (arg.getattr_flags & kernel::FUSE_GETATTR_FH != 0).then_some(arg.fh);
                match fs.getattr(cx, ino, fh).await {
                    Ok(attr) => {
                        let out = kernel::fuse_attr_out {
                            attr_valid: DEFAULT_ATTR_TIMEOUT_SECS,
                            attr_valid_nsec: 0,
                            dummy: 0,
                            attr: attr.to_wire(),
                        };
                        reply::send_reply(conn, unique, out).await
                    }
                    Err(errno) => reply::send_error(conn, unique, errno).await,
                }
            }

            fuse_opcode::FUSE_READLINK => match fs.readlink(cx, ino).await {
                Ok(target) => reply::send_reply(conn, unique, target).await,
                Err(errno) => reply::send_error(conn, unique, errno).await,
            },

            fuse_opcode::FUSE_OPEN | fuse_opcode::FUSE_OPENDIR => {
                let arg = match req.fetch::<kernel::fuse_open_in>() {
                    Ok(arg) => arg,
                    Err(errno) => return reply::send_error(conn, unique, errno).await,
                };
                let opened = if opcode == fuse_opcode::FUSE_OPEN {
                    fs.open(cx, ino, arg.flags).await
                } else {
                    fs.opendir(cx, ino, arg.flags).await
                };
                match opened {
                    Ok(opened) => {
                        let out = kernel::fuse_open_out {
                            fh: opened.fh,
                            open_flags: opened.flags.bits(),
                            padding: 0,
                        };
                        reply::send_reply(conn, unique, out).await
                    }
                    Err(errno) => reply::send_error(conn, unique, errno).await,
                }
            }

            fuse_opcode::FUSE_READ => {
                let arg = match req.fetch::<kernel::fuse_read_in>() {
                    Ok(arg) => arg,
                    Err(errno) => return reply::send_error(conn, unique, errno).await,
                };
                match fs.read(cx, ino, arg.fh, arg.offset, arg.size).await {
                    Ok(data) => reply::send_reply(conn, unique, data).await,
                    Err(errno) => reply::send_error(conn, unique, errno).await,
                }
            }

            fuse_opcode::FUSE_READDIR => {
                let arg = match req.fetch::<kernel::fuse_read_in>() {
                    Ok(arg) => arg,
                    Err(errno) => return reply::send_error(conn, unique, errno).await,
                };
                match fs.readdir(cx, ino, arg.fh, arg.offset, arg.size).await {
                    Ok(entries) => {
                        let mut out = ReaddirOut::new(arg.size as usize);
                        for entry in entries {
                            if out.entry(
                                &entry.name,
                                entry.ino,
                                entry.typ.as_dirent_type(),
                                entry.offset,
                            ) {
                                break;
                            }
                        }
                        reply::send_reply(conn, unique, out).await
                    }
                    Err(errno) => reply::send_error(conn, unique, errno).await,
                }
            }

            fuse_opcode::FUSE_READDIRPLUS => {
                let arg = match req.fetch::<kernel::fuse_read_in>() {
                    Ok(arg) => arg,
                    Err(errno) => return reply::send_error(conn, unique, errno).await,
                };
                match fs.readdirplus(cx, ino, arg.fh, arg.offset, arg.size).await {
                    Ok(entries) => {
                        let mut out = ReaddirplusOut::new(arg.size as usize);
                        for entry in entries {
                            let typ = FileType::from_mode(entry.entry.attr.mode)
                                .map(FileType::as_dirent_type)
                                .unwrap_or(libc::DT_UNKNOWN as u32);
                            if out.entry(&entry.name, entry.entry.to_wire(), typ, entry.offset) {
                                break;
                            }
                        }
                        reply::send_reply(conn, unique, out).await
                    }
                    // ENOSYS passes through so the kernel falls back
                    // to plain READDIR.
                    Err(errno) => reply::send_error(conn, unique, errno).await,
                }
            }

            fuse_opcode::FUSE_RELEASE | fuse_opcode::FUSE_RELEASEDIR => {
                let arg = match req.fetch::<kernel::fuse_release_in>() {
                    Ok(arg) => arg,
                    Err(errno) => return reply::send_error(conn, unique, errno).await,
                };
                let released = if opcode == fuse_opcode::FUSE_RELEASE {
                    fs.release(cx, ino, arg.fh).await
                } else {
                    fs.releasedir(cx, ino, arg.fh).await
                };
                match released {
                    Ok(()) => reply::send_reply(conn, unique, ()).await,
                    Err(errno) => reply::send_error(conn, unique, errno).await,
                }
            }

            fuse_opcode::FUSE_STATFS => match fs.statfs(cx, ino).await {
                Ok(st) => reply::send_reply(conn, unique, st.to_wire()).await,
                Err(errno) => reply::send_error(conn, unique, errno).await,
            },

            fuse_opcode::FUSE_ACCESS => {
                let arg = match req.fetch::<kernel::fuse_access_in>() {
                    Ok(arg) => arg,
                    Err(errno) => return reply::send_error(conn, unique, errno).await,
                };
                match fs.access(cx, ino, arg.mask).await {
                    Ok(()) => reply::send_reply(conn, unique, ()).await,
                    Err(errno) => reply::send_error(conn, unique, errno).await,
                }
            }

            // Nothing to flush on a read-only filesystem.
            fuse_opcode::FUSE_FLUSH => reply::send_reply(conn, unique, ()).await,

            // Acknowledged by being consumed. In-flight handlers run
            // to completion; there is no per-request abort table.
            fuse_opcode::FUSE_INTERRUPT => {
                if let Ok(arg) = req.fetch::<kernel::fuse_interrupt_in>() {
                    tracing::debug!(unique = arg.unique, "FUSE_INTERRUPT");
                }
                Ok(())
            }

            _ => reply::send_error(conn, unique, Errno::NOSYS).await,
        }
    }

    async fn handle_init<F>(
        &self,
        fs: &F,
        conn: &Connection,
        cx: &Context,
        req: &Request,
    ) -> io::Result<()>
    where
        F: Filesystem,
    {
        let unique = req.unique();
        let init_in = match req.fetch::<kernel::fuse_init_in>() {
            Ok(arg) => arg,
            Err(errno) => return reply::send_error(conn, unique, errno).await,
        };

        tracing::debug!("INIT request:");
        tracing::debug!("  proto = {}.{}", init_in.major, init_in.minor);
        tracing::debug!("  flags = 0x{:08x}", init_in.flags);
        tracing::debug!("  max_readahead = 0x{:08x}", init_in.max_readahead);

        if init_in.major != kernel::FUSE_KERNEL_VERSION {
            // Reply with the version we support so the kernel can
            // renegotiate; the session stays uninitialized.
            tracing::debug!("wait for a second INIT request with a supported version");
            let out = kernel::fuse_init_out {
                major: kernel::FUSE_KERNEL_VERSION,
                minor: kernel::FUSE_KERNEL_MINOR_VERSION,
                ..Default::default()
            };
            return reply::send_reply(conn, unique, out).await;
        }

        if init_in.minor < kernel::FUSE_MIN_SUPPORTED_MINOR {
            tracing::warn!(
                "protocol 7.{} is not supported (minimum is 7.{})",
                init_in.minor,
                kernel::FUSE_MIN_SUPPORTED_MINOR,
            );
            return reply::send_error(conn, unique, Errno::PROTO).await;
        }

        let minor = cmp::min(init_in.minor, kernel::FUSE_KERNEL_MINOR_VERSION);
        conn.set_protocol_version(kernel::FUSE_KERNEL_VERSION, minor);

        let config = Config {
            proto_major: kernel::FUSE_KERNEL_VERSION,
            proto_minor: minor,
            max_readahead: cmp::min(init_in.max_readahead, self.max_readahead),
            max_write: self.max_write,
            max_pages: DEFAULT_MAX_PAGES,
        };

        if let Err(errno) = fs.init(cx, &config).await {
            return reply::send_error(conn, unique, errno).await;
        }

        let flags = self.flags.bits() & init_in.flags;

        let out = kernel::fuse_init_out {
            major: kernel::FUSE_KERNEL_VERSION,
            minor,
            max_readahead: config.max_readahead,
            flags,
            max_background: self.max_background,
            congestion_threshold: self.max_background * 3 / 4,
            max_write: self.max_write,
            time_gran: DEFAULT_TIME_GRAN,
            max_pages: DEFAULT_MAX_PAGES,
            ..Default::default()
        };

        tracing::debug!("Reply to INIT:");
        tracing::debug!("  proto = {}.{}", out.major, out.minor);
        tracing::debug!("  flags = 0x{:08x}", out.flags);
        tracing::debug!("  max_readahead = 0x{:08x}", out.max_readahead);
        tracing::debug!("  max_write = 0x{:08x}", out.max_write);

        {
            let mut state = self.state.write().expect("session lock poisoned");
            state.initialized = true;
            state.config = Some(config);
        }

        reply::send_reply(conn, unique, out).await
    }
}

/// Whether the opcode belongs to the write set; every one of these
/// is answered with `EROFS`.
fn is_write_opcode(opcode: fuse_opcode) -> bool {
    matches!(
        opcode,
        fuse_opcode::FUSE_SETATTR
            | fuse_opcode::FUSE_SYMLINK
            | fuse_opcode::FUSE_MKNOD
            | fuse_opcode::FUSE_MKDIR
            | fuse_opcode::FUSE_UNLINK
            | fuse_opcode::FUSE_RMDIR
            | fuse_opcode::FUSE_RENAME
            | fuse_opcode::FUSE_RENAME2
            | fuse_opcode::FUSE_LINK
            | fuse_opcode::FUSE_WRITE
            | fuse_opcode::FUSE_SETXATTR
            | fuse_opcode::FUSE_REMOVEXATTR
            | fuse_opcode::FUSE_CREATE
            | fuse_opcode::FUSE_FALLOCATE
            | fuse_opcode::FUSE_COPY_FILE_RANGE
            | fuse_opcode::FUSE_TMPFILE
    )
}

/// Decode the forget list after a batch-forget header, stopping at
/// the truncation boundary when the body is shorter than
/// `count * 16` bytes.
fn decode_batch_forget(body: &[u8]) -> Vec<Forget> {
    let Ok((header, mut rest)) = kernel::fuse_batch_forget_in::read_from_prefix(body) else {
        return Vec::new();
    };

    let mut forgets = Vec::new();
    while forgets.len() < header.count as usize {
        match kernel::fuse_forget_one::read_from_prefix(rest) {
            Ok((one, tail)) => {
                forgets.push(Forget {
                    ino: one.nodeid,
                    nlookup: one.nlookup,
                });
                rest = tail;
            }
            Err(_) => break,
        }
    }
    forgets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conn::tests::{read_from_peer, socketpair_conn},
        request::tests::{frame, request_from_bytes},
        types::{Attr, DirEntry, Entry, Opened, StatFs},
    };
    use async_trait::async_trait;
    use std::{
        ffi::{OsStr, OsString},
        mem,
        os::fd::{AsRawFd, OwnedFd},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };
    use zerocopy::IntoBytes;

    fn test_session() -> Session {
        Session::new(&MountOptions::default().normalized())
    }

    fn header(opcode: u32, nodeid: u64, unique: u64, body_len: usize) -> kernel::fuse_in_header {
        kernel::fuse_in_header {
            len: (mem::size_of::<kernel::fuse_in_header>() + body_len) as u32,
            opcode,
            unique,
            nodeid,
            uid: 1000,
            gid: 1000,
            pid: 4242,
            padding: 0,
        }
    }

    fn assert_no_frame(peer: &OwnedFd) {
        let flags = unsafe { libc::fcntl(peer.as_raw_fd(), libc::F_GETFL, 0) };
        unsafe { libc::fcntl(peer.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
        let mut buf = [0u8; 1];
        let res = unsafe {
            libc::read(
                peer.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        assert_eq!(res, -1, "unexpected reply frame");
        assert_eq!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN),
        );
        unsafe { libc::fcntl(peer.as_raw_fd(), libc::F_SETFL, flags) };
    }

    #[derive(Default)]
    struct MockFs {
        touched: AtomicBool,
        init_config: Mutex<Option<Config>>,
        forgotten: Mutex<Vec<Forget>>,
        destroyed: AtomicBool,
    }

    #[async_trait]
    impl Filesystem for MockFs {
        async fn init(&self, _cx: &Context, config: &Config) -> Result<(), Errno> {
            self.touched.store(true, Ordering::SeqCst);
            *self.init_config.lock().unwrap() = Some(*config);
            Ok(())
        }

        async fn destroy(&self, _cx: &Context) {
            self.destroyed.store(true, Ordering::SeqCst);
        }

        async fn lookup(&self, _cx: &Context, parent: u64, name: &OsStr) -> Result<Entry, Errno> {
            self.touched.store(true, Ordering::SeqCst);
            if parent != 1 || name != "hello.txt" {
                return Err(Errno::NOENT);
            }
            Ok(Entry {
                ino: 2,
                generation: 0,
                attr: Attr {
                    ino: 2,
                    size: 13,
                    mode: FileType::Regular.mode(0o644),
                    nlink: 1,
                    ..Default::default()
                },
                attr_timeout: Duration::from_secs(60),
                entry_timeout: Duration::from_secs(60),
            })
        }

        async fn forget(&self, _cx: &Context, ino: u64, nlookup: u64) {
            self.forgotten.lock().unwrap().push(Forget { ino, nlookup });
        }

        async fn getattr(
            &self,
            _cx: &Context,
            ino: u64,
            _fh: Option<u64>,
        ) -> Result<Attr, Errno> {
            self.touched.store(true, Ordering::SeqCst);
            Ok(Attr {
                ino,
                mode: FileType::Directory.mode(0o755),
                nlink: 2,
                ..Default::default()
            })
        }

        async fn open(&self, _cx: &Context, _ino: u64, _flags: u32) -> Result<Opened, Errno> {
            Ok(Opened {
                fh: 11,
                flags: crate::types::OpenFlags::KEEP_CACHE,
            })
        }

        async fn read(
            &self,
            _cx: &Context,
            _ino: u64,
            _fh: u64,
            offset: u64,
            _size: u32,
        ) -> Result<Vec<u8>, Errno> {
            if offset >= 13 {
                return Ok(Vec::new());
            }
            Ok(b"hello, world!"[offset as usize..].to_owned())
        }

        async fn readdir(
            &self,
            _cx: &Context,
            _ino: u64,
            _fh: u64,
            offset: u64,
            _size: u32,
        ) -> Result<Vec<DirEntry>, Errno> {
            let all = vec![
                DirEntry {
                    ino: 2,
                    offset: 1,
                    typ: FileType::Regular,
                    name: OsString::from("a"),
                },
                DirEntry {
                    ino: 3,
                    offset: 2,
                    typ: FileType::Regular,
                    name: OsString::from("b"),
                },
                DirEntry {
                    ino: 4,
                    offset: 3,
                    typ: FileType::Regular,
                    name: OsString::from("c"),
                },
            ];
            Ok(all.into_iter().skip(offset as usize).collect())
        }

        async fn statfs(&self, _cx: &Context, _ino: u64) -> Result<StatFs, Errno> {
            Ok(StatFs {
                blocks: 100,
                ..Default::default()
            })
        }
    }

    async fn run(
        session: &Session,
        fs: &MockFs,
        conn: &Connection,
        header: kernel::fuse_in_header,
        body: &[u8],
    ) {
        let req = request_from_bytes(&frame(header, body));
        let cancel = CancellationToken::new();
        session.process(fs, conn, &req, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn lookup_replies_full_entry() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        run(&session, &fs, &conn, header(1, 1, 42, 10), b"hello.txt\0").await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16 + 128);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 144);
        assert_eq!(i32::from_le_bytes(frame[4..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(frame[8..16].try_into().unwrap()), 42);

        let (out, _) = kernel::fuse_entry_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(out.nodeid, 2);
        assert_eq!(out.attr_valid, 60);
        assert_eq!(out.entry_valid, 60);
        assert_eq!(out.attr.size, 13);
        assert_eq!(out.attr.mode, libc::S_IFREG | 0o644);
        assert_eq!(out.attr.nlink, 1);
    }

    #[tokio::test]
    async fn lookup_miss_replies_enoent() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        run(&session, &fs, &conn, header(1, 1, 43, 8), b"nothere\0").await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16);
        assert_eq!(
            i32::from_le_bytes(frame[4..8].try_into().unwrap()),
            -libc::ENOENT,
        );
    }

    #[tokio::test]
    async fn getattr_replies_attr_with_default_ttl() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_getattr_in::default();
        run(&session, &fs, &conn, header(3, 1, 5, 16), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16 + 104);

        let (out, _) = kernel::fuse_attr_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(out.attr_valid, 1);
        assert_eq!(out.attr_valid_nsec, 0);
        assert_eq!(out.attr.mode, libc::S_IFDIR | 0o755);
        assert_eq!(out.attr.nlink, 2);
    }

    #[tokio::test]
    async fn unknown_opcode_replies_enosys() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        run(&session, &fs, &conn, header(99, 1, 77, 0), b"").await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16);
        assert_eq!(
            i32::from_le_bytes(frame[4..8].try_into().unwrap()),
            -libc::ENOSYS,
        );
        assert_eq!(u64::from_le_bytes(frame[8..16].try_into().unwrap()), 77);
    }

    #[tokio::test]
    async fn write_opcode_replies_erofs_without_fs_call() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        run(&session, &fs, &conn, header(16, 2, 8, 0), b"").await;

        let frame = read_from_peer(&peer);
        assert_eq!(
            i32::from_le_bytes(frame[4..8].try_into().unwrap()),
            -libc::EROFS,
        );
        assert!(!fs.touched.load(Ordering::SeqCst), "filesystem was invoked");
    }

    #[tokio::test]
    async fn every_write_opcode_is_rejected() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        for opcode in [4u32, 6, 8, 9, 10, 11, 12, 13, 16, 21, 24, 35, 43, 45, 47, 51] {
            run(&session, &fs, &conn, header(opcode, 2, 8, 0), b"").await;
            let frame = read_from_peer(&peer);
            assert_eq!(
                i32::from_le_bytes(frame[4..8].try_into().unwrap()),
                -libc::EROFS,
                "opcode {}",
                opcode,
            );
        }
        assert!(!fs.touched.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn readdir_respects_size_budget() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_read_in {
            size: 64,
            ..Default::default()
        };
        run(&session, &fs, &conn, header(28, 1, 6, 40), arg.as_bytes()).await;

        // Three one-character entries pad to 32 bytes each; only the
        // first two fit the 64-byte budget.
        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16 + 64);
        let (first, _) = kernel::fuse_dirent::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(first.ino, 2);
        assert_eq!(first.off, 1);
        let (second, _) = kernel::fuse_dirent::read_from_prefix(&frame[48..]).unwrap();
        assert_eq!(second.ino, 3);
        assert_eq!(second.off, 2);
    }

    #[tokio::test]
    async fn init_negotiates_minor_flags_and_limits() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_init_in {
            major: 7,
            minor: 41,
            max_readahead: 64 * 1024,
            flags: !0,
            ..Default::default()
        };
        run(&session, &fs, &conn, header(26, 0, 2, 64), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16 + 64);
        let (out, _) = kernel::fuse_init_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(out.major, 7);
        assert_eq!(out.minor, 41);
        assert_eq!(out.flags, CapabilityFlags::default().bits());
        assert_eq!(out.max_readahead, 64 * 1024);
        assert_eq!(out.max_write, 128 * 1024);
        assert_eq!(out.max_background, 12);
        assert_eq!(out.congestion_threshold, 9);
        assert_eq!(out.time_gran, 1);
        assert_eq!(out.max_pages, 32);

        assert!(session.initialized());
        assert_eq!(conn.protocol_version(), Some((7, 41)));
        let config = fs.init_config.lock().unwrap().unwrap();
        assert_eq!(config.proto_minor, 41);
        assert_eq!(config.max_readahead, 64 * 1024);
        assert_eq!(session.config(), Some(config));
    }

    #[tokio::test]
    async fn init_with_newer_minor_clamps_to_ours() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_init_in {
            major: 7,
            minor: 99,
            flags: !0,
            ..Default::default()
        };
        run(&session, &fs, &conn, header(26, 0, 2, 64), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        let (out, _) = kernel::fuse_init_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(out.minor, kernel::FUSE_KERNEL_MINOR_VERSION);
    }

    #[tokio::test]
    async fn init_major_mismatch_renegotiates() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_init_in {
            major: 8,
            minor: 0,
            ..Default::default()
        };
        run(&session, &fs, &conn, header(26, 0, 2, 64), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        assert_eq!(i32::from_le_bytes(frame[4..8].try_into().unwrap()), 0);
        let (out, _) = kernel::fuse_init_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(out.major, 7);
        assert_eq!(out.minor, kernel::FUSE_KERNEL_MINOR_VERSION);
        assert!(!session.initialized());
        assert_eq!(conn.protocol_version(), None);
    }

    #[tokio::test]
    async fn init_minor_too_old_is_eproto() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_init_in {
            major: 7,
            minor: 8,
            ..Default::default()
        };
        run(&session, &fs, &conn, header(26, 0, 2, 64), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        assert_eq!(
            i32::from_le_bytes(frame[4..8].try_into().unwrap()),
            -libc::EPROTO,
        );
        assert!(!session.initialized());
    }

    #[tokio::test]
    async fn zero_length_read_is_a_valid_success() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_read_in {
            offset: 13,
            size: 4096,
            ..Default::default()
        };
        run(&session, &fs, &conn, header(15, 2, 3, 40), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16);
        assert_eq!(i32::from_le_bytes(frame[4..8].try_into().unwrap()), 0);
    }

    #[tokio::test]
    async fn forget_sends_no_reply() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_forget_in { nlookup: 3 };
        run(&session, &fs, &conn, header(2, 9, 4, 8), arg.as_bytes()).await;

        assert_no_frame(&peer);
        assert_eq!(
            &*fs.forgotten.lock().unwrap(),
            &[Forget { ino: 9, nlookup: 3 }],
        );
    }

    #[tokio::test]
    async fn batch_forget_stops_at_truncation() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        // Three entries announced, but the body is cut mid-way
        // through the second one.
        let mut body = kernel::fuse_batch_forget_in {
            count: 3,
            dummy: 0,
        }
        .as_bytes()
        .to_owned();
        body.extend_from_slice(
            kernel::fuse_forget_one {
                nodeid: 5,
                nlookup: 1,
            }
            .as_bytes(),
        );
        body.extend_from_slice(&[0u8; 7]);

        run(&session, &fs, &conn, header(42, 0, 4, body.len()), &body).await;

        assert_no_frame(&peer);
        assert_eq!(
            &*fs.forgotten.lock().unwrap(),
            &[Forget { ino: 5, nlookup: 1 }],
        );
    }

    #[tokio::test]
    async fn interrupt_sends_no_reply() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_interrupt_in { unique: 41 };
        run(&session, &fs, &conn, header(36, 0, 50, 8), arg.as_bytes()).await;

        assert_no_frame(&peer);
    }

    #[tokio::test]
    async fn readdirplus_default_propagates_enosys() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_read_in {
            size: 4096,
            ..Default::default()
        };
        run(&session, &fs, &conn, header(44, 1, 12, 40), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        assert_eq!(
            i32::from_le_bytes(frame[4..8].try_into().unwrap()),
            -libc::ENOSYS,
        );
    }

    #[tokio::test]
    async fn readdirplus_serializes_entries_with_cookies() {
        struct PlusFs(MockFs);

        #[async_trait]
        impl Filesystem for PlusFs {
            async fn lookup(
                &self,
                cx: &Context,
                parent: u64,
                name: &OsStr,
            ) -> Result<Entry, Errno> {
                self.0.lookup(cx, parent, name).await
            }

            async fn getattr(
                &self,
                cx: &Context,
                ino: u64,
                fh: Option<u64>,
            ) -> Result<Attr, Errno> {
                self.0.getattr(cx, ino, fh).await
            }

            async fn read(
                &self,
                cx: &Context,
                ino: u64,
                fh: u64,
                offset: u64,
                size: u32,
            ) -> Result<Vec<u8>, Errno> {
                self.0.read(cx, ino, fh, offset, size).await
            }

            async fn readdir(
                &self,
                cx: &Context,
                ino: u64,
                fh: u64,
                offset: u64,
                size: u32,
            ) -> Result<Vec<DirEntry>, Errno> {
                self.0.readdir(cx, ino, fh, offset, size).await
            }

            async fn readdirplus(
                &self,
                _cx: &Context,
                _ino: u64,
                _fh: u64,
                _offset: u64,
                _size: u32,
            ) -> Result<Vec<crate::types::DirEntryPlus>, Errno> {
                Ok(vec![crate::types::DirEntryPlus {
                    entry: Entry {
                        ino: 2,
                        generation: 9,
                        attr: Attr {
                            ino: 2,
                            mode: FileType::Regular.mode(0o644),
                            nlink: 1,
                            ..Default::default()
                        },
                        ..Default::default()
                    },
                    offset: 1,
                    name: OsString::from("a"),
                }])
            }
        }

        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = PlusFs(MockFs::default());

        let arg = kernel::fuse_read_in {
            size: 4096,
            ..Default::default()
        };
        let req = request_from_bytes(&frame(header(44, 1, 21, 40), arg.as_bytes()));
        let cancel = CancellationToken::new();
        session.process(&fs, &conn, &req, &cancel).await.unwrap();

        let frame = read_from_peer(&peer);
        // One one-character record: 152-byte prefix plus the padded
        // name.
        assert_eq!(frame.len(), 16 + 160);

        let (entry_out, _) = kernel::fuse_entry_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(entry_out.nodeid, 2);
        assert_eq!(entry_out.generation, 9);

        let (dirent, _) = kernel::fuse_dirent::read_from_prefix(&frame[16 + 128..]).unwrap();
        assert_eq!(dirent.ino, 2);
        assert_eq!(dirent.off, 1, "dirent carries the offset cookie");
        assert_eq!(dirent.typ, libc::DT_REG as u32);
        assert_eq!(dirent.namelen, 1);
    }

    #[tokio::test]
    async fn flush_replies_empty_success() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_flush_in::default();
        run(&session, &fs, &conn, header(25, 2, 13, 24), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16);
        assert_eq!(i32::from_le_bytes(frame[4..8].try_into().unwrap()), 0);
    }

    #[tokio::test]
    async fn destroy_marks_session() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        run(&session, &fs, &conn, header(38, 0, 14, 0), b"").await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16);
        assert!(session.destroyed());
        assert!(fs.destroyed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn open_reports_handle_and_flags() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        let arg = kernel::fuse_open_in {
            flags: libc::O_RDONLY as u32,
            open_flags: 0,
        };
        run(&session, &fs, &conn, header(14, 2, 15, 8), arg.as_bytes()).await;

        let frame = read_from_peer(&peer);
        let (out, _) = kernel::fuse_open_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(out.fh, 11);
        assert_eq!(out.open_flags, kernel::FOPEN_KEEP_CACHE);
    }

    #[tokio::test]
    async fn statfs_reports_statistics() {
        let (conn, peer) = socketpair_conn();
        let session = test_session();
        let fs = MockFs::default();

        run(&session, &fs, &conn, header(17, 1, 16, 0), b"").await;

        let frame = read_from_peer(&peer);
        assert_eq!(frame.len(), 16 + 64);
        let (out, _) = kernel::fuse_statfs_out::read_from_prefix(&frame[16..]).unwrap();
        assert_eq!(out.st.blocks, 100);
        assert_eq!(out.st.bsize, 4096);
        assert_eq!(out.st.namelen, 255);
    }
}
