//! Directory entry serialization.

use crate::bytes::{Bytes, Collector};
use rofuse_kernel::{fuse_dirent, fuse_direntplus, fuse_entry_out};
use std::{ffi::OsStr, mem, os::unix::prelude::*};
use zerocopy::IntoBytes;

#[inline]
const fn aligned(len: usize) -> usize {
    (len + mem::size_of::<u64>() - 1) & !(mem::size_of::<u64>() - 1)
}

fn push_dirent(buf: &mut Vec<u8>, dirent: fuse_dirent, name: &[u8], padded: usize) {
    buf.extend_from_slice(dirent.as_bytes());
    buf.extend_from_slice(name);
    buf.resize(buf.len() + padded - mem::size_of::<fuse_dirent>() - name.len(), 0);
}

/// Serialized `readdir` entries, bounded by the byte budget the
/// kernel requested.
pub(crate) struct ReaddirOut {
    buf: Vec<u8>,
    budget: usize,
}

impl Bytes for ReaddirOut {
    fn size(&self) -> usize {
        self.buf.len()
    }

    fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
        if !self.buf.is_empty() {
            collector.append(&self.buf[..]);
        }
    }
}

impl ReaddirOut {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            buf: Vec::new(),
            budget,
        }
    }

    /// Append one entry, zero-padded to the next 8-byte boundary.
    ///
    /// Returns `true` when the entry does not fit; the record is not
    /// split and the buffer is left unchanged.
    pub(crate) fn entry(&mut self, name: &OsStr, ino: u64, typ: u32, off: u64) -> bool {
        let name = name.as_bytes();
        let padded = aligned(mem::size_of::<fuse_dirent>() + name.len());
        if self.buf.len() + padded > self.budget {
            return true;
        }

        let dirent = fuse_dirent {
            ino,
            off,
            namelen: name.len().try_into().expect("name length is too long"),
            typ,
            name: [],
        };
        push_dirent(&mut self.buf, dirent, name, padded);
        false
    }
}

/// Serialized `readdirplus` entries: each record is a full entry-out
/// followed by the dirent-shaped suffix, under the same budget and
/// truncation rule as [`ReaddirOut`].
pub(crate) struct ReaddirplusOut {
    buf: Vec<u8>,
    budget: usize,
}

impl Bytes for ReaddirplusOut {
    fn size(&self) -> usize {
        self.buf.len()
    }

    fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
        if !self.buf.is_empty() {
            collector.append(&self.buf[..]);
        }
    }
}

impl ReaddirplusOut {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            buf: Vec::new(),
            budget,
        }
    }

    /// Append one entry. The dirent `off` field carries the resume
    /// cookie for the entry.
    pub(crate) fn entry(
        &mut self,
        name: &OsStr,
        entry_out: fuse_entry_out,
        typ: u32,
        off: u64,
    ) -> bool {
        let name = name.as_bytes();
        let padded = aligned(mem::size_of::<fuse_direntplus>() + name.len());
        if self.buf.len() + padded > self.budget {
            return true;
        }

        let dirent = fuse_dirent {
            ino: entry_out.nodeid,
            off,
            namelen: name.len().try_into().expect("name length is too long"),
            typ,
            name: [],
        };
        self.buf.extend_from_slice(entry_out.as_bytes());
        push_dirent(
            &mut self.buf,
            dirent,
            name,
            padded - mem::size_of::<fuse_entry_out>(),
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_cases() {
        assert_eq!(aligned(1), 8);
        assert_eq!(aligned(7), 8);
        assert_eq!(aligned(8), 8);
        assert_eq!(aligned(9), 16);
        assert_eq!(aligned(25), 32);
    }

    #[test]
    fn single_entry_layout() {
        let mut out = ReaddirOut::new(4096);
        assert!(!out.entry(OsStr::new("hello"), 1, libc::DT_REG as u32, 42));
        assert_eq!(out.size(), 32);
        assert_eq!(
            out.buf,
            vec![
                0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // ino
                0x2a, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // off
                0x05, 0x00, 0x00, 0x00, // namelen
                0x08, 0x00, 0x00, 0x00, // typ
                0x68, 0x65, 0x6c, 0x6c, 0x6f, // name
                0x00, 0x00, 0x00, // padding
            ],
        );
    }

    #[test]
    fn budget_is_never_exceeded() {
        // Each one-character entry pads out to 32 bytes.
        let mut out = ReaddirOut::new(64);
        assert!(!out.entry(OsStr::new("a"), 2, libc::DT_REG as u32, 1));
        assert!(!out.entry(OsStr::new("b"), 3, libc::DT_REG as u32, 2));
        assert!(out.entry(OsStr::new("c"), 4, libc::DT_REG as u32, 3));
        assert_eq!(out.size(), 64);
    }

    #[test]
    fn too_small_budget_emits_nothing() {
        let mut out = ReaddirOut::new(24);
        assert!(out.entry(OsStr::new("a"), 2, libc::DT_REG as u32, 1));
        assert_eq!(out.size(), 0);
    }

    #[test]
    fn records_are_8_byte_aligned() {
        let mut out = ReaddirOut::new(4096);
        for (i, name) in ["a", "ab", "abc", "abcdefg", "abcdefgh"].iter().enumerate() {
            assert!(!out.entry(OsStr::new(name), i as u64 + 2, libc::DT_REG as u32, i as u64));
            assert_eq!(out.size() % 8, 0);
        }
    }

    #[test]
    fn plus_entry_carries_offset_cookie() {
        let entry_out = fuse_entry_out {
            nodeid: 5,
            generation: 9,
            ..Default::default()
        };

        let mut out = ReaddirplusOut::new(4096);
        assert!(!out.entry(OsStr::new("x"), entry_out, libc::DT_REG as u32, 77));
        assert_eq!(out.size(), aligned(152 + 1));

        // The dirent suffix starts right after the entry-out record.
        let dirent = &out.buf[mem::size_of::<fuse_entry_out>()..];
        assert_eq!(u64::from_le_bytes(dirent[0..8].try_into().unwrap()), 5, "ino");
        assert_eq!(u64::from_le_bytes(dirent[8..16].try_into().unwrap()), 77, "off");
        assert_eq!(dirent[24], b'x');
    }

    #[test]
    fn plus_budget_truncates_whole_records() {
        let entry_out = fuse_entry_out::default();
        let mut out = ReaddirplusOut::new(200);
        assert!(!out.entry(OsStr::new("a"), entry_out, libc::DT_REG as u32, 1));
        assert!(out.entry(OsStr::new("b"), entry_out, libc::DT_REG as u32, 2));
        assert_eq!(out.size(), 160);
    }
}
