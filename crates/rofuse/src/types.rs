//! The data model exposed to filesystem implementations.

use bitflags::bitflags;
use rofuse_kernel::{self as kernel, fuse_attr, fuse_entry_out, fuse_statfs_out};
use std::{ffi::OsString, time::Duration};

/// The inode number of the root directory.
pub const ROOT_INO: u64 = kernel::FUSE_ROOT_ID;

/// The reserved, never-valid inode number.
pub const INVALID_INO: u64 = 0;

/// The type of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

impl FileType {
    /// Recover the file type from the `S_IFMT` bits of a mode value.
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & libc::S_IFMT {
            libc::S_IFREG => Some(Self::Regular),
            libc::S_IFDIR => Some(Self::Directory),
            libc::S_IFLNK => Some(Self::Symlink),
            libc::S_IFIFO => Some(Self::Fifo),
            libc::S_IFSOCK => Some(Self::Socket),
            libc::S_IFCHR => Some(Self::CharDevice),
            libc::S_IFBLK => Some(Self::BlockDevice),
            _ => None,
        }
    }

    /// The `S_IFMT` bits for this type.
    pub const fn as_mode_bits(self) -> u32 {
        match self {
            Self::Regular => libc::S_IFREG,
            Self::Directory => libc::S_IFDIR,
            Self::Symlink => libc::S_IFLNK,
            Self::Fifo => libc::S_IFIFO,
            Self::Socket => libc::S_IFSOCK,
            Self::CharDevice => libc::S_IFCHR,
            Self::BlockDevice => libc::S_IFBLK,
        }
    }

    /// The `DT_*` constant used in directory entries.
    pub const fn as_dirent_type(self) -> u32 {
        match self {
            Self::Regular => libc::DT_REG as u32,
            Self::Directory => libc::DT_DIR as u32,
            Self::Symlink => libc::DT_LNK as u32,
            Self::Fifo => libc::DT_FIFO as u32,
            Self::Socket => libc::DT_SOCK as u32,
            Self::CharDevice => libc::DT_CHR as u32,
            Self::BlockDevice => libc::DT_BLK as u32,
        }
    }

    /// Combine this type with permission bits into a full mode value.
    ///
    /// `perm` may carry the setuid, setgid and sticky bits in
    /// addition to the regular permission triplet.
    pub const fn mode(self, perm: u32) -> u32 {
        self.as_mode_bits() | (perm & 0o7777)
    }
}

/// Attributes of a file or directory.
///
/// Timestamps are durations since the UNIX epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    /// File size in bytes.
    pub size: u64,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    pub atime: Duration,
    pub mtime: Duration,
    pub ctime: Duration,
    /// File type and permission bits (`S_IF* | perm`).
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device ID for special files.
    pub rdev: u32,
    /// Preferred block size for filesystem I/O.
    pub blksize: u32,
}

impl Attr {
    pub(crate) fn to_wire(&self) -> fuse_attr {
        fuse_attr {
            ino: self.ino,
            size: self.size,
            blocks: self.blocks,
            atime: self.atime.as_secs(),
            mtime: self.mtime.as_secs(),
            ctime: self.ctime.as_secs(),
            atimensec: self.atime.subsec_nanos(),
            mtimensec: self.mtime.subsec_nanos(),
            ctimensec: self.ctime.subsec_nanos(),
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: self.blksize,
            flags: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn from_wire(attr: &fuse_attr) -> Self {
        Self {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: Duration::new(attr.atime, attr.atimensec),
            mtime: Duration::new(attr.mtime, attr.mtimensec),
            ctime: Duration::new(attr.ctime, attr.ctimensec),
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev,
            blksize: attr.blksize,
        }
    }
}

/// The result of looking up a name in a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entry {
    pub ino: u64,
    /// Disambiguates reused inode numbers for NFS exporting. The
    /// pair (ino, generation) must be unique over the lifetime of
    /// the filesystem.
    pub generation: u64,
    pub attr: Attr,
    /// How long the kernel may trust `attr`. Zero disables caching.
    pub attr_timeout: Duration,
    /// How long the kernel may trust the name→inode binding.
    pub entry_timeout: Duration,
}

impl Entry {
    pub(crate) fn to_wire(&self) -> fuse_entry_out {
        fuse_entry_out {
            nodeid: self.ino,
            generation: self.generation,
            entry_valid: self.entry_timeout.as_secs(),
            attr_valid: self.attr_timeout.as_secs(),
            entry_valid_nsec: self.entry_timeout.subsec_nanos(),
            attr_valid_nsec: self.attr_timeout.subsec_nanos(),
            attr: self.attr.to_wire(),
        }
    }
}

/// A directory entry produced by `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    /// Offset cookie for the *next* entry; the kernel echoes it
    /// back as the resume position of a subsequent `readdir`.
    pub offset: u64,
    pub typ: FileType,
    pub name: OsString,
}

/// A directory entry with full attributes, produced by
/// `readdirplus`.
#[derive(Debug, Clone)]
pub struct DirEntryPlus {
    pub entry: Entry,
    /// Offset cookie for the next entry.
    pub offset: u64,
    pub name: OsString,
}

/// A single forget notice from `batch_forget`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forget {
    pub ino: u64,
    pub nlookup: u64,
}

bitflags! {
    /// Flags returned from `open`/`opendir`, reported to the kernel
    /// in the `FOPEN_*` field of the open reply.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Bypass the page cache for this file.
        const DIRECT_IO = kernel::FOPEN_DIRECT_IO;
        /// Don't invalidate the cached file data on open.
        const KEEP_CACHE = kernel::FOPEN_KEEP_CACHE;
        /// The file is not seekable.
        const NONSEEKABLE = kernel::FOPEN_NONSEEKABLE;
        /// Allow caching the directory contents.
        const CACHE_DIR = kernel::FOPEN_CACHE_DIR;
        /// The file is stream-like.
        const STREAM = kernel::FOPEN_STREAM;
        /// Don't flush the data on close.
        const NOFLUSH = kernel::FOPEN_NOFLUSH;
    }
}

/// The result of an `open` or `opendir` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Opened {
    /// A token of the filesystem's choosing, handed back on every
    /// subsequent operation against this open file.
    pub fh: u64,
    pub flags: OpenFlags,
}

/// Filesystem statistics reported by `statfs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    /// Optimal transfer block size.
    pub bsize: u32,
    /// Maximum length of file names.
    pub namelen: u32,
    /// Fragment size.
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        }
    }
}

impl StatFs {
    pub(crate) fn to_wire(&self) -> fuse_statfs_out {
        fuse_statfs_out {
            st: kernel::fuse_kstatfs {
                blocks: self.blocks,
                bfree: self.bfree,
                bavail: self.bavail,
                files: self.files,
                ffree: self.ffree,
                bsize: self.bsize,
                namelen: self.namelen,
                frsize: self.frsize,
                padding: 0,
                spare: [0; 2],
            },
        }
    }
}

/// The negotiated connection parameters, handed to
/// `Filesystem::init` after the INIT exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub proto_major: u32,
    pub proto_minor: u32,
    pub max_readahead: u32,
    pub max_write: u32,
    pub max_pages: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_mode_round_trip() {
        for typ in [
            FileType::Regular,
            FileType::Directory,
            FileType::Symlink,
            FileType::Fifo,
            FileType::Socket,
            FileType::CharDevice,
            FileType::BlockDevice,
        ] {
            for perm in [0o644, 0o755, 0o4755, 0o2755, 0o1777, 0o7777] {
                let mode = typ.mode(perm);
                assert_eq!(FileType::from_mode(mode), Some(typ));
                assert_eq!(mode & 0o7777, perm);
            }
        }
    }

    #[test]
    fn unknown_mode_bits() {
        assert_eq!(FileType::from_mode(0o644), None);
    }

    #[test]
    fn entry_wire_round_trip() {
        let entry = Entry {
            ino: 7,
            generation: 3,
            attr: Attr {
                ino: 7,
                size: 4096,
                blocks: 8,
                atime: Duration::new(1_700_000_000, 123),
                mtime: Duration::new(1_700_000_001, 456),
                ctime: Duration::new(1_700_000_002, 789),
                mode: FileType::Regular.mode(0o4644),
                nlink: 2,
                uid: 1000,
                gid: 1000,
                rdev: 0,
                blksize: 4096,
            },
            attr_timeout: Duration::new(60, 500_000_000),
            entry_timeout: Duration::new(30, 0),
        };

        let out = entry.to_wire();
        assert_eq!(out.nodeid, 7);
        assert_eq!(out.generation, 3);
        assert_eq!(out.attr_valid, 60);
        assert_eq!(out.attr_valid_nsec, 500_000_000);
        assert_eq!(out.entry_valid, 30);
        assert_eq!(out.entry_valid_nsec, 0);

        let attr = Attr::from_wire(&out.attr);
        assert_eq!(attr, entry.attr);
        assert_eq!(
            Duration::new(out.attr_valid, out.attr_valid_nsec),
            entry.attr_timeout,
        );
    }

    #[test]
    fn timeout_split_is_floor_division() {
        let ttl = Duration::from_millis(1500);
        let entry = Entry {
            attr_timeout: ttl,
            entry_timeout: ttl,
            ..Default::default()
        };
        let out = entry.to_wire();
        assert_eq!(out.attr_valid, 1);
        assert_eq!(out.attr_valid_nsec, 500_000_000);
    }
}
