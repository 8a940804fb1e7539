//! A trait that represents a collection of reply bytes.

use std::{ffi::OsStr, os::unix::prelude::*};

/// A (possibly scattered) collection of bytes forming one reply
/// payload.
pub(crate) trait Bytes {
    /// Return the total size of bytes.
    fn size(&self) -> usize;

    /// Collect the scattered chunks in the `collector`.
    fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>);
}

/// Container for collecting the scattered bytes.
pub(crate) trait Collector<'a> {
    /// Append a chunk of bytes into itself.
    fn append(&mut self, bytes: &'a [u8]);
}

impl<R: ?Sized> Bytes for &R
where
    R: Bytes,
{
    #[inline]
    fn size(&self) -> usize {
        (**self).size()
    }

    #[inline]
    fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
        (**self).collect(collector)
    }
}

impl Bytes for () {
    #[inline]
    fn size(&self) -> usize {
        0
    }

    #[inline]
    fn collect<'a>(&'a self, _: &mut dyn Collector<'a>) {}
}

macro_rules! impl_bytes_for_tuple {
    ($($T:ident),+ $(,)?) => {
        #[allow(nonstandard_style)]
        impl<$($T),+> Bytes for ($($T,)+)
        where
            $( $T: Bytes, )+
        {
            #[inline]
            fn size(&self) -> usize {
                let ($($T,)+) = self;
                let mut size = 0;
                $( size += $T.size(); )+
                size
            }

            #[inline]
            fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
                let ($($T,)+) = self;
                $( $T.collect(collector); )+
            }
        }
    }
}

impl_bytes_for_tuple!(T1);
impl_bytes_for_tuple!(T1, T2);
impl_bytes_for_tuple!(T1, T2, T3);

mod impl_bytes_for_cont {
    use super::*;

    #[inline(always)]
    fn as_bytes(t: &(impl AsRef<[u8]> + ?Sized)) -> &[u8] {
        t.as_ref()
    }

    macro_rules! impl_bytes {
        ($($t:ty),*$(,)?) => {$(
            impl Bytes for $t {
                #[inline]
                fn size(&self) -> usize {
                    as_bytes(self).len()
                }

                #[inline]
                fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
                    let this = as_bytes(self);
                    if !this.is_empty() {
                        collector.append(this);
                    }
                }
            }
        )*};
    }

    impl_bytes! {
        [u8],
        str,
        String,
        Vec<u8>,
    }
}

impl Bytes for OsStr {
    #[inline]
    fn size(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
        Bytes::collect(self.as_bytes(), collector)
    }
}

impl Bytes for std::ffi::OsString {
    #[inline]
    fn size(&self) -> usize {
        self.as_os_str().size()
    }

    #[inline]
    fn collect<'a>(&'a self, collector: &mut dyn Collector<'a>) {
        self.as_os_str().collect(collector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunks(Vec<Vec<u8>>);

    impl<'a> Collector<'a> for Chunks {
        fn append(&mut self, bytes: &'a [u8]) {
            self.0.push(bytes.to_owned());
        }
    }

    #[test]
    fn tuples_concatenate() {
        let data = ("hello, ", "world");
        assert_eq!(data.size(), 12);

        let mut chunks = Chunks(Vec::new());
        data.collect(&mut chunks);
        assert_eq!(chunks.0.concat(), b"hello, world");
    }

    #[test]
    fn empty_chunks_are_skipped() {
        let data: (&str, &[u8], &str) = ("a", &[], "b");
        let mut chunks = Chunks(Vec::new());
        data.collect(&mut chunks);
        assert_eq!(chunks.0.len(), 2);
    }
}
