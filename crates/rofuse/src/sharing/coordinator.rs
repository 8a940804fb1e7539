//! Cross-process handoff of cloned device descriptors.
//!
//! The coordinator owns the master descriptor and listens on a
//! local-domain socket. Each accepted worker registers with its pid,
//! gets a freshly cloned descriptor over the socket as ancillary
//! data, and runs its own server on it. The coordinator keeps a
//! pid→worker table for later teardown.

use crate::sharing::{clone::clone_fuse_fd, fdpass};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::{self, Read, Write},
    net::Shutdown,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

/// Upper bound on one handoff record, applied before allocating the
/// body buffer.
const MAX_RECORD_LEN: u32 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Register {
    pid: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

fn write_record<T>(mut writer: impl Write, record: &T) -> io::Result<()>
where
    T: Serialize,
{
    let body = serde_json::to_vec(record)?;
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record is too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)
}

fn read_record<T>(mut reader: impl Read) -> io::Result<T>
where
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len);
    if len > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "oversized handoff record",
        ));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// A worker process registered with the coordinator.
#[derive(Debug)]
pub struct Worker {
    pid: u32,
    conn: UnixStream,
    fd: OwnedFd,
}

impl Worker {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The coordinator-side copy of the worker's cloned descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn close(&self) {
        let _ = self.conn.shutdown(Shutdown::Both);
    }
}

/// Distributes cloned device descriptors to worker processes.
#[derive(Debug)]
pub struct Coordinator {
    sock_path: PathBuf,
    master_fd: RawFd,
    listener: UnixListener,
    workers: Mutex<HashMap<u32, Worker>>,
    closed: AtomicBool,
}

impl Coordinator {
    /// Listen on `sock_path` for worker registrations. `master_fd`
    /// is the device descriptor of the mounted session, typically
    /// `Server::fd()`. A stale socket file is removed first.
    pub fn bind(sock_path: impl Into<PathBuf>, master_fd: RawFd) -> io::Result<Self> {
        let sock_path = sock_path.into();
        let _ = fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path)?;

        Ok(Self {
            sock_path,
            master_fd,
            listener,
            workers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Block until a worker connects, then clone the master
    /// descriptor and hand it over. Returns the worker's pid.
    pub fn accept_worker(&self) -> io::Result<u32> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "the coordinator is closed",
            ));
        }

        let (mut conn, _addr) = self.listener.accept()?;
        let register: Register = read_record(&mut conn)?;

        let cloned = match clone_fuse_fd(self.master_fd) {
            Ok(fd) => fd,
            Err(err) => {
                let _ = write_record(
                    &mut conn,
                    &Response {
                        success: false,
                        error: Some(err.to_string()),
                    },
                );
                return Err(err);
            }
        };

        write_record(
            &mut conn,
            &Response {
                success: true,
                error: None,
            },
        )?;
        fdpass::send_fd(&conn, cloned.as_raw_fd())?;

        tracing::debug!(pid = register.pid, "worker registered");

        let pid = register.pid;
        self.workers
            .lock()
            .expect("worker table lock poisoned")
            .insert(
                pid,
                Worker {
                    pid,
                    conn,
                    fd: cloned,
                },
            );

        Ok(pid)
    }

    /// Drop a worker from the table and close its socket and the
    /// coordinator-side descriptor copy.
    pub fn remove_worker(&self, pid: u32) {
        let worker = self
            .workers
            .lock()
            .expect("worker table lock poisoned")
            .remove(&pid);
        if let Some(worker) = worker {
            worker.close();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .lock()
            .expect("worker table lock poisoned")
            .len()
    }

    /// The pids of all registered workers.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.workers
            .lock()
            .expect("worker table lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    /// Close all tracked workers' sockets and the listener, and
    /// remove the socket file. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for (_, worker) in self
            .workers
            .lock()
            .expect("worker table lock poisoned")
            .drain()
        {
            worker.close();
        }

        // Unblocks a pending accept.
        unsafe {
            libc::shutdown(self.listener.as_raw_fd(), libc::SHUT_RDWR);
        }
        let _ = fs::remove_file(&self.sock_path);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

/// The worker-process side of the handoff.
#[derive(Debug)]
pub struct WorkerClient {
    conn: UnixStream,
    fd: OwnedFd,
}

impl WorkerClient {
    /// Dial the coordinator socket, register with `pid` and receive
    /// a cloned device descriptor.
    pub fn connect(sock_path: impl AsRef<Path>, pid: u32) -> io::Result<Self> {
        let mut conn = UnixStream::connect(sock_path)?;

        write_record(&mut conn, &Register { pid })?;

        let response: Response = read_record(&mut conn)?;
        if !response.success {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                response
                    .error
                    .unwrap_or_else(|| "coordinator refused the registration".to_owned()),
            ));
        }

        let fd = fdpass::recv_fd(&conn)?;
        Ok(Self { conn, fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Take ownership of the received descriptor, closing the
    /// transport socket. The result is suitable for
    /// `Server::from_fd`.
    pub fn into_fd(self) -> OwnedFd {
        drop(self.conn);
        self.fd
    }
}
