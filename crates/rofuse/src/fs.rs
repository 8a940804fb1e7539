//! Filesystem abstraction.

use crate::types::{Attr, Config, DirEntry, DirEntryPlus, Entry, Forget, Opened, StatFs};
use async_trait::async_trait;
use rustix::io::Errno;
use std::ffi::{OsStr, OsString};
use tokio_util::sync::CancellationToken;

/// Contextual information about one FUSE request, carried into every
/// filesystem callback.
#[derive(Debug, Clone)]
pub struct Context {
    uid: u32,
    gid: u32,
    pid: u32,
    unique: u64,
    cancel: CancellationToken,
}

impl Context {
    pub(crate) fn new(uid: u32, gid: u32, pid: u32, unique: u64, cancel: CancellationToken) -> Self {
        Self {
            uid,
            gid,
            pid,
            unique,
            cancel,
        }
    }

    /// The user ID of the calling process.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The group ID of the calling process.
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// The process ID of the calling process.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The unique ID of the request.
    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// Whether the server has begun shutting down. Long-running
    /// callbacks should check this and return `Errno::INTR` promptly.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once the server begins shutting down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The token backing [`Context::cancelled`], for select-style
    /// composition.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// The read-only filesystem supplied by the host.
///
/// All methods operate on inode numbers, never on paths. Several
/// operations may be in flight at once; implementations must be safe
/// for concurrent calls and cannot assume any ordering between
/// opcodes or inodes.
#[allow(unused_variables)]
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Called once the INIT exchange has negotiated the connection
    /// parameters. Returning an error fails the INIT request; the
    /// kernel will retry or abort.
    async fn init(&self, cx: &Context, config: &Config) -> Result<(), Errno> {
        Ok(())
    }

    /// Called while handling DESTROY, when the kernel unmounts.
    async fn destroy(&self, cx: &Context) {}

    /// Look up a directory entry by name.
    ///
    /// Return `Errno::NOENT` when the name does not exist.
    async fn lookup(&self, cx: &Context, parent: u64, name: &OsStr) -> Result<Entry, Errno>;

    /// Forget `nlookup` references to an inode dropped from the
    /// kernel cache. Never generates a reply.
    async fn forget(&self, cx: &Context, ino: u64, nlookup: u64) {}

    /// Batched version of [`Filesystem::forget`].
    async fn batch_forget(&self, cx: &Context, forgets: &[Forget]) {
        for forget in forgets {
            self.forget(cx, forget.ino, forget.nlookup).await;
        }
    }

    /// Retrieve the attributes of an inode. `fh` is set when the
    /// kernel associates the request with an open file.
    async fn getattr(&self, cx: &Context, ino: u64, fh: Option<u64>) -> Result<Attr, Errno>;

    /// Read the target of a symbolic link.
    async fn readlink(&self, cx: &Context, ino: u64) -> Result<OsString, Errno> {
        Err(Errno::NOSYS)
    }

    /// Open a file. The returned handle is opaque to the library and
    /// is passed back on `read` and `release`.
    async fn open(&self, cx: &Context, ino: u64, flags: u32) -> Result<Opened, Errno> {
        Ok(Opened::default())
    }

    /// Read up to `size` bytes starting at `offset`. Returning fewer
    /// bytes than requested is allowed; an empty buffer means
    /// end-of-file.
    async fn read(
        &self,
        cx: &Context,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno>;

    /// Release a handle returned by [`Filesystem::open`].
    async fn release(&self, cx: &Context, ino: u64, fh: u64) -> Result<(), Errno> {
        Ok(())
    }

    /// Open a directory for enumeration.
    async fn opendir(&self, cx: &Context, ino: u64, flags: u32) -> Result<Opened, Errno> {
        Ok(Opened::default())
    }

    /// Enumerate directory entries starting at `offset`, which is
    /// either zero or the cookie of a previously returned entry.
    /// Entries that do not fit in `size` bytes once serialized are
    /// dropped and requested again later.
    async fn readdir(
        &self,
        cx: &Context,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<DirEntry>, Errno>;

    /// Enumerate directory entries together with their attributes.
    ///
    /// The default returns `Errno::NOSYS`, which the library passes
    /// through so the kernel falls back to plain `readdir`.
    async fn readdirplus(
        &self,
        cx: &Context,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<DirEntryPlus>, Errno> {
        Err(Errno::NOSYS)
    }

    /// Release a handle returned by [`Filesystem::opendir`].
    async fn releasedir(&self, cx: &Context, ino: u64, fh: u64) -> Result<(), Errno> {
        Ok(())
    }

    /// Report filesystem statistics.
    async fn statfs(&self, cx: &Context, ino: u64) -> Result<StatFs, Errno> {
        Ok(StatFs::default())
    }

    /// Check access permissions for the `mask` bits.
    ///
    /// Return `Errno::ACCESS` to deny, or `Errno::NOSYS` to let the
    /// kernel fall back to its own permission checks.
    async fn access(&self, cx: &Context, ino: u64, mask: u32) -> Result<(), Errno> {
        Ok(())
    }
}

macro_rules! impl_filesystem_for_ptr {
    ($ty:ty) => {
        #[async_trait]
        impl<F: ?Sized> Filesystem for $ty
        where
            F: Filesystem + Send + Sync,
        {
            async fn init(&self, cx: &Context, config: &Config) -> Result<(), Errno> {
                (**self).init(cx, config).await
            }

            async fn destroy(&self, cx: &Context) {
                (**self).destroy(cx).await
            }

            async fn lookup(
                &self,
                cx: &Context,
                parent: u64,
                name: &OsStr,
            ) -> Result<Entry, Errno> {
                (**self).lookup(cx, parent, name).await
            }

            async fn forget(&self, cx: &Context, ino: u64, nlookup: u64) {
                (**self).forget(cx, ino, nlookup).await
            }

            async fn batch_forget(&self, cx: &Context, forgets: &[Forget]) {
                (**self).batch_forget(cx, forgets).await
            }

            async fn getattr(
                &self,
                cx: &Context,
                ino: u64,
                fh: Option<u64>,
            ) -> Result<Attr, Errno> {
                (**self).getattr(cx, ino, fh).await
            }

            async fn readlink(&self, cx: &Context, ino: u64) -> Result<OsString, Errno> {
                (**self).readlink(cx, ino).await
            }

            async fn open(&self, cx: &Context, ino: u64, flags: u32) -> Result<Opened, Errno> {
                (**self).open(cx, ino, flags).await
            }

            async fn read(
                &self,
                cx: &Context,
                ino: u64,
                fh: u64,
                offset: u64,
                size: u32,
            ) -> Result<Vec<u8>, Errno> {
                (**self).read(cx, ino, fh, offset, size).await
            }

            async fn release(&self, cx: &Context, ino: u64, fh: u64) -> Result<(), Errno> {
                (**self).release(cx, ino, fh).await
            }

            async fn opendir(&self, cx: &Context, ino: u64, flags: u32) -> Result<Opened, Errno> {
                (**self).opendir(cx, ino, flags).await
            }

            async fn readdir(
                &self,
                cx: &Context,
                ino: u64,
                fh: u64,
                offset: u64,
                size: u32,
            ) -> Result<Vec<DirEntry>, Errno> {
                (**self).readdir(cx, ino, fh, offset, size).await
            }

            async fn readdirplus(
                &self,
                cx: &Context,
                ino: u64,
                fh: u64,
                offset: u64,
                size: u32,
            ) -> Result<Vec<DirEntryPlus>, Errno> {
                (**self).readdirplus(cx, ino, fh, offset, size).await
            }

            async fn releasedir(&self, cx: &Context, ino: u64, fh: u64) -> Result<(), Errno> {
                (**self).releasedir(cx, ino, fh).await
            }

            async fn statfs(&self, cx: &Context, ino: u64) -> Result<StatFs, Errno> {
                (**self).statfs(cx, ino).await
            }

            async fn access(&self, cx: &Context, ino: u64, mask: u32) -> Result<(), Errno> {
                (**self).access(cx, ino, mask).await
            }
        }
    };
}

impl_filesystem_for_ptr!(Box<F>);
impl_filesystem_for_ptr!(std::sync::Arc<F>);
