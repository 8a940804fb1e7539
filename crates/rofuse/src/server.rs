//! Server lifecycle and request fan-out.

use crate::{
    buf::{BufferPool, BUFFER_SLACK},
    conn::Connection,
    error::Error,
    fs::Filesystem,
    mount::{self, MountOptions},
    session::Session,
    types::Config,
};
use rofuse_kernel::fuse_in_header;
use std::{
    io, mem,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A mounted FUSE session bound to a filesystem implementation.
///
/// One reader loop pulls requests from the device in order; each
/// request is handled on its own task, so several filesystem calls
/// may be in flight at once. Responses are matched to requests by
/// their unique ID, and no response ordering is guaranteed.
pub struct Server<F> {
    fs: Arc<F>,
    conn: Arc<Connection>,
    session: Arc<Session>,
    pool: Arc<BufferPool>,
    mountpoint: Option<PathBuf>,
    cancel: CancellationToken,
    debug: bool,
}

impl<F> Server<F>
where
    F: Filesystem + 'static,
{
    /// Mount a filesystem at the given path.
    pub fn mount(mountpoint: impl AsRef<Path>, fs: F, opts: MountOptions) -> Result<Self, Error> {
        let mountpoint = mountpoint.as_ref();
        let opts = opts.normalized();
        let fd = mount::mount(mountpoint, &opts)?;

        let mut server = Self::from_fd(fd, fs, opts);
        server.mountpoint = Some(mountpoint.to_owned());
        Ok(server)
    }

    /// Wrap an already-open FUSE device descriptor, such as one
    /// received from a sharing coordinator. The wrapping server does
    /// not own the mount point and cannot unmount it.
    pub fn from_fd(fd: OwnedFd, fs: F, opts: MountOptions) -> Self {
        let opts = opts.normalized();
        let bufsize = opts.max_write as usize + mem::size_of::<fuse_in_header>() + BUFFER_SLACK;

        Self {
            fs: Arc::new(fs),
            conn: Arc::new(Connection::new(fd)),
            session: Arc::new(Session::new(&opts)),
            pool: Arc::new(BufferPool::new(bufsize)),
            mountpoint: None,
            cancel: CancellationToken::new(),
            debug: opts.debug,
        }
    }

    /// The path this server was mounted on, if it owns a mount.
    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref()
    }

    /// The raw device descriptor, for the sharing layer. The server
    /// retains ownership.
    pub fn fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }

    /// The negotiated connection parameters, available once INIT has
    /// completed.
    pub fn config(&self) -> Option<Config> {
        self.session.config()
    }

    /// Whether the INIT exchange has completed.
    pub fn is_initialized(&self) -> bool {
        self.session.initialized()
    }

    /// Whether the device descriptor is still open.
    pub fn is_mounted(&self) -> bool {
        self.conn.is_mounted()
    }

    /// The protocol version negotiated with the kernel.
    pub fn protocol_version(&self) -> Option<(u32, u32)> {
        self.conn.protocol_version()
    }

    /// The token cancelled when the server shuts down. Cloned into
    /// the context of every filesystem call.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run the request loop until the filesystem is unmounted.
    ///
    /// Exits cleanly when the kernel closes the device. Before
    /// returning, all in-flight request tasks are joined and the
    /// device descriptor is closed.
    pub async fn serve(&self) -> Result<(), Error> {
        let mut workers = JoinSet::new();

        let res = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            if self.session.destroyed() {
                tracing::debug!("got a DESTROY request and the session was shut down");
                break Ok(());
            }

            let req = match self.conn.read_request(&self.pool).await {
                Ok(req) => req,
                Err(Error::Interrupted) => continue,
                Err(Error::NotMounted) => {
                    tracing::debug!("connection was closed by the kernel");
                    break Ok(());
                }
                Err(err) => break Err(err),
            };

            if self.debug {
                tracing::debug!(
                    unique = req.unique(),
                    opcode = req.raw_opcode(),
                    nodeid = req.nodeid(),
                    "dequeued request"
                );
            }

            let fs = Arc::clone(&self.fs);
            let conn = Arc::clone(&self.conn);
            let session = Arc::clone(&self.session);
            let cancel = self.cancel.clone();
            workers.spawn(async move {
                if let Err(err) = session.process(&*fs, &conn, &req, &cancel).await {
                    tracing::error!("error while handling a request: {}", err);
                }
            });
        };

        while workers.join_next().await.is_some() {}
        self.conn.close();

        res
    }

    /// Begin shutdown: cancel in-flight contexts and detach the
    /// mount so the kernel drains the device. The serve loop then
    /// observes device-gone, joins its workers and closes the
    /// descriptor.
    pub fn unmount(&self) -> io::Result<()> {
        self.cancel.cancel();
        match &self.mountpoint {
            Some(mountpoint) => mount::unmount(mountpoint),
            None => Ok(()),
        }
    }
}
