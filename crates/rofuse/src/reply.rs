//! Reply frame assembly.

use crate::{
    bytes::{Bytes, Collector},
    conn::Connection,
};
use rofuse_kernel::{
    fuse_attr_out, fuse_entry_out, fuse_init_out, fuse_open_out, fuse_out_header, fuse_statfs_out,
};
use rustix::io::Errno;
use std::{io, mem};
use zerocopy::IntoBytes;

macro_rules! impl_bytes_for_pod {
    ($($t:ty),*$(,)?) => {$(
        impl Bytes for $t {
            #[inline]
            fn size(&self) -> usize {
                mem::size_of::<$t>()
            }

            #[inline]
            fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
                collector.append(self.as_bytes());
            }
        }
    )*};
}

impl_bytes_for_pod! {
    fuse_attr_out,
    fuse_entry_out,
    fuse_init_out,
    fuse_open_out,
    fuse_statfs_out,
}

struct FrameCollector {
    frame: Vec<u8>,
}

impl<'a> Collector<'a> for FrameCollector {
    fn append(&mut self, bytes: &'a [u8]) {
        self.frame.extend_from_slice(bytes);
    }
}

/// Assemble one contiguous reply frame: an out-header stamped with
/// the total length, followed by the payload.
fn encode_frame<T>(unique: u64, error: i32, data: T) -> Vec<u8>
where
    T: Bytes,
{
    let len = (mem::size_of::<fuse_out_header>() + data.size()) as u32;
    let header = fuse_out_header { len, error, unique };

    let mut collector = FrameCollector {
        frame: Vec::with_capacity(len as usize),
    };
    collector.append(header.as_bytes());
    data.collect(&mut collector);
    debug_assert_eq!(collector.frame.len(), len as usize);

    collector.frame
}

/// Send a success reply carrying `data` as its payload.
pub(crate) async fn send_reply<T>(conn: &Connection, unique: u64, data: T) -> io::Result<()>
where
    T: Bytes,
{
    conn.write_frame(&encode_frame(unique, 0, data)).await
}

/// Send a header-only error reply. The wire value is the negated
/// POSIX errno.
pub(crate) async fn send_error(conn: &Connection, unique: u64, errno: Errno) -> io::Result<()> {
    conn.write_frame(&encode_frame(unique, -errno.raw_os_error(), ()))
        .await
}
