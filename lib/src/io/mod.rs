//! Byte streams and the typed cursors that every asset format is read and written through.

pub mod reader;
pub mod section;
pub mod stream;
pub mod writer;

use std::{
    fmt::{Display, Formatter},
    ops::{Add, AddAssign, Sub, SubAssign},
    path::Path,
};

pub use reader::StreamReader;
pub use section::SectionHeader;
pub use stream::{FileStream, MemoryStream, Stream};
pub use writer::{StreamWriter, WriterSettings};

/// A byte position or relocatable offset inside a stream.
///
/// Zero is the null sentinel. Addresses are only turned into positions through
/// [`StreamReader`] / [`StreamWriter`], which apply the current base offset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileAddr(pub i64);

impl FileAddr {
    pub const NULL: FileAddr = FileAddr(0);

    #[inline]
    pub const fn new(value: i64) -> Self { Self(value) }

    #[inline]
    pub const fn from_usize(value: usize) -> Self { Self(value as i64) }

    #[inline]
    pub const fn is_null(self) -> bool { self.0 == 0 }

    #[inline]
    pub const fn get(self) -> i64 { self.0 }

    /// Null becomes `None`.
    #[inline]
    pub fn non_null(self) -> Option<FileAddr> { if self.is_null() { None } else { Some(self) } }

    /// Negative addresses clamp to zero.
    #[inline]
    pub fn as_u64(self) -> u64 { self.0.max(0) as u64 }
}

impl Display for FileAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "{:#X}", self.0) }
}

impl Add for FileAddr {
    type Output = FileAddr;

    fn add(self, rhs: FileAddr) -> FileAddr { FileAddr(self.0.wrapping_add(rhs.0)) }
}

impl Sub for FileAddr {
    type Output = FileAddr;

    fn sub(self, rhs: FileAddr) -> FileAddr { FileAddr(self.0.wrapping_sub(rhs.0)) }
}

impl Add<i64> for FileAddr {
    type Output = FileAddr;

    fn add(self, rhs: i64) -> FileAddr { FileAddr(self.0.wrapping_add(rhs)) }
}

impl Sub<i64> for FileAddr {
    type Output = FileAddr;

    fn sub(self, rhs: i64) -> FileAddr { FileAddr(self.0.wrapping_sub(rhs)) }
}

impl AddAssign<i64> for FileAddr {
    fn add_assign(&mut self, rhs: i64) { self.0 = self.0.wrapping_add(rhs); }
}

impl SubAssign<i64> for FileAddr {
    fn sub_assign(&mut self, rhs: i64) { self.0 = self.0.wrapping_sub(rhs); }
}

impl From<u32> for FileAddr {
    fn from(value: u32) -> Self { Self(value as i64) }
}

impl From<i64> for FileAddr {
    fn from(value: i64) -> Self { Self(value) }
}

/// Width of on-disk pointer and size fields.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PointerMode {
    #[default]
    Mode32Bit,
    Mode64Bit,
}

impl PointerMode {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            PointerMode::Mode32Bit => 4,
            PointerMode::Mode64Bit => 8,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Endianness {
    #[default]
    Little,
    Big,
    /// Whatever the host uses.
    Native,
}

impl Endianness {
    #[cfg(target_endian = "little")]
    pub const HOST: Endianness = Endianness::Little;
    #[cfg(target_endian = "big")]
    pub const HOST: Endianness = Endianness::Big;

    /// Resolves [`Endianness::Native`] to a concrete byte order.
    #[inline]
    pub const fn resolve(self) -> Endianness {
        match self {
            Endianness::Native => Self::HOST,
            other => other,
        }
    }

    #[inline]
    pub const fn is_big(self) -> bool { matches!(self.resolve(), Endianness::Big) }

    #[inline]
    pub const fn is_native(self) -> bool {
        matches!(
            (self.resolve(), Self::HOST),
            (Endianness::Little, Endianness::Little) | (Endianness::Big, Endianness::Big)
        )
    }
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("signature or magic mismatch")]
    BadFormat,
    #[error("declared count exceeds available data")]
    BadCount,
    #[error("pointer outside of stream")]
    BadPointer,
    #[error("insufficient space")]
    InsufficientSpace,
    #[error("unknown stream error")]
    Unknown,
}

pub type StreamResult<T = ()> = Result<T, StreamError>;

/// A structure populated in place from a [`StreamReader`].
pub trait StreamReadable {
    fn read(&mut self, reader: &mut StreamReader) -> StreamResult;
}

/// Reads a whole file and parses it as `T`. Failures are logged and yield `None`.
pub fn load_file<T, P>(path: P) -> Option<T>
where
    T: StreamReadable + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let mut stream = match FileStream::open_read(path) {
        Ok(stream) => stream,
        Err(e) => {
            log::error!("Failed to open '{}': {e}", path.display());
            return None;
        }
    };
    read_from_stream(&mut stream, &path.display())
}

/// Parses `T` from the current position of `stream`.
pub(crate) fn read_from_stream<T, N>(stream: &mut dyn Stream, name: &N) -> Option<T>
where
    T: StreamReadable + Default,
    N: Display + ?Sized,
{
    let mut value = T::default();
    let mut reader = StreamReader::new(stream);
    match value.read(&mut reader) {
        Ok(()) => Some(value),
        Err(e) => {
            log::error!("Failed to read '{name}': {e}");
            None
        }
    }
}
