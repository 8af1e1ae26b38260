use std::{
    borrow::Cow,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use crate::io::FileAddr;

/// Raw byte source/sink.
///
/// Operations never panic on a closed or incapable stream; they transfer zero bytes instead.
pub trait Stream {
    fn seek(&mut self, position: FileAddr);
    fn position(&self) -> FileAddr;
    fn length(&self) -> FileAddr;

    fn is_open(&self) -> bool;
    fn can_read(&self) -> bool;
    fn can_write(&self) -> bool;

    fn read_buffer(&mut self, buffer: &mut [u8]) -> usize;
    fn write_buffer(&mut self, buffer: &[u8]) -> usize;

    fn close(&mut self);

    fn remaining(&self) -> FileAddr { FileAddr((self.length().0 - self.position().0).max(0)) }

    fn end_of_file(&self) -> bool { self.position() >= self.length() }
}

/// File-backed stream with a cached size.
#[derive(Debug, Default)]
pub struct FileStream {
    file: Option<File>,
    can_read: bool,
    can_write: bool,
    position: FileAddr,
    file_size: FileAddr,
}

impl FileStream {
    pub fn open_read<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open(path, OpenOptions::new().read(true), true, false)
    }

    pub fn open_write<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open(path, OpenOptions::new().write(true), false, true)
    }

    pub fn open_read_write<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open(path, OpenOptions::new().read(true).write(true), true, true)
    }

    /// Creates or truncates.
    pub fn create_write<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open(path, OpenOptions::new().write(true).create(true).truncate(true), false, true)
    }

    pub fn create_read_write<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::open(
            path,
            OpenOptions::new().read(true).write(true).create(true).truncate(true),
            true,
            true,
        )
    }

    fn open<P: AsRef<Path>>(
        path: P,
        options: &OpenOptions,
        can_read: bool,
        can_write: bool,
    ) -> io::Result<Self> {
        let file = options.open(path)?;
        let file_size = FileAddr(file.metadata()?.len() as i64);
        Ok(Self { file: Some(file), can_read, can_write, position: FileAddr::NULL, file_size })
    }
}

impl Stream for FileStream {
    fn seek(&mut self, position: FileAddr) {
        let Some(file) = &mut self.file else { return };
        if file.seek(SeekFrom::Start(position.as_u64())).is_ok() {
            self.position = FileAddr(position.as_u64() as i64);
        }
    }

    fn position(&self) -> FileAddr { self.position }

    fn length(&self) -> FileAddr { self.file_size }

    fn is_open(&self) -> bool { self.file.is_some() }

    fn can_read(&self) -> bool { self.is_open() && self.can_read }

    fn can_write(&self) -> bool { self.is_open() && self.can_write }

    fn read_buffer(&mut self, buffer: &mut [u8]) -> usize {
        if !self.can_read {
            return 0;
        }
        let Some(file) = &mut self.file else { return 0 };
        let mut total = 0;
        while total < buffer.len() {
            match file.read(&mut buffer[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("File read failed: {e}");
                    break;
                }
            }
        }
        self.position += total as i64;
        total
    }

    fn write_buffer(&mut self, buffer: &[u8]) -> usize {
        if !self.can_write {
            return 0;
        }
        let Some(file) = &mut self.file else { return 0 };
        if let Err(e) = file.write_all(buffer) {
            log::debug!("File write failed: {e}");
            return 0;
        }
        self.position += buffer.len() as i64;
        if self.position > self.file_size {
            self.file_size = self.position;
        }
        buffer.len()
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
        self.can_read = false;
        self.can_write = false;
        self.position = FileAddr::NULL;
        self.file_size = FileAddr::NULL;
    }
}

/// Read-only stream over a byte buffer, either borrowed or owned.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream<'a> {
    data: Option<Cow<'a, [u8]>>,
    position: FileAddr,
}

impl<'a> MemoryStream<'a> {
    /// Non-owning view over an existing buffer.
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self { data: Some(Cow::Borrowed(data)), position: FileAddr::NULL }
    }

    pub fn from_vec(data: Vec<u8>) -> MemoryStream<'static> {
        MemoryStream { data: Some(Cow::Owned(data)), position: FileAddr::NULL }
    }

    /// Copies the remaining bytes of `source` into an owned buffer.
    /// The source position is left where it was.
    pub fn from_stream(source: &mut dyn Stream) -> MemoryStream<'static> {
        let previous_position = source.position();
        let mut data = vec![0u8; source.remaining().as_u64() as usize];
        let read = source.read_buffer(&mut data);
        data.truncate(read);
        source.seek(previous_position);
        MemoryStream::from_vec(data)
    }

    pub fn data(&self) -> &[u8] { self.data.as_deref().unwrap_or_default() }
}

impl Stream for MemoryStream<'_> {
    fn seek(&mut self, position: FileAddr) { self.position = FileAddr(position.0.max(0)); }

    fn position(&self) -> FileAddr { self.position }

    fn length(&self) -> FileAddr { FileAddr::from_usize(self.data().len()) }

    fn is_open(&self) -> bool { self.data.is_some() }

    fn can_read(&self) -> bool { self.is_open() }

    fn can_write(&self) -> bool { false }

    fn read_buffer(&mut self, buffer: &mut [u8]) -> usize {
        let data = self.data();
        let start = (self.position.as_u64() as usize).min(data.len());
        let count = buffer.len().min(data.len() - start);
        buffer[..count].copy_from_slice(&data[start..start + count]);
        self.position += count as i64;
        count
    }

    fn write_buffer(&mut self, _buffer: &[u8]) -> usize { 0 }

    fn close(&mut self) {
        self.data = None;
        self.position = FileAddr::NULL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_reads_and_clamps() {
        let bytes = [1u8, 2, 3, 4, 5];
        let mut stream = MemoryStream::from_slice(&bytes);
        let mut buf = [0u8; 3];
        assert_eq!(stream.read_buffer(&mut buf), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(stream.remaining(), FileAddr(2));
        assert_eq!(stream.read_buffer(&mut buf), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert!(stream.end_of_file());
        assert_eq!(stream.read_buffer(&mut buf), 0);
        assert_eq!(stream.write_buffer(&buf), 0);
        assert!(!stream.can_write());
    }

    #[test]
    fn memory_stream_from_stream_keeps_source_position() {
        let bytes = [9u8, 8, 7, 6];
        let mut source = MemoryStream::from_slice(&bytes);
        source.seek(FileAddr(1));
        let mut copy = MemoryStream::from_stream(&mut source);
        assert_eq!(source.position(), FileAddr(1));
        assert_eq!(copy.data(), &[8, 7, 6]);
        let mut buf = [0u8; 1];
        assert_eq!(copy.read_buffer(&mut buf), 1);
        assert_eq!(buf[0], 8);
    }

    #[test]
    fn closed_streams_transfer_nothing() {
        let mut stream = MemoryStream::from_vec(vec![1, 2, 3]);
        stream.close();
        let mut buf = [0u8; 2];
        assert!(!stream.is_open());
        assert_eq!(stream.read_buffer(&mut buf), 0);

        let mut file = FileStream::default();
        assert!(!file.is_open());
        assert_eq!(file.read_buffer(&mut buf), 0);
        assert_eq!(file.write_buffer(&buf), 0);
    }

    #[test]
    fn file_stream_grows_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        let mut stream = FileStream::create_read_write(&path).unwrap();
        assert_eq!(stream.length(), FileAddr(0));
        assert_eq!(stream.write_buffer(&[1, 2, 3, 4]), 4);
        assert_eq!(stream.length(), FileAddr(4));
        stream.seek(FileAddr(2));
        assert_eq!(stream.write_buffer(&[5, 6, 7]), 3);
        assert_eq!(stream.length(), FileAddr(5));
        stream.seek(FileAddr(0));
        let mut buf = [0u8; 5];
        assert_eq!(stream.read_buffer(&mut buf), 5);
        assert_eq!(buf, [1, 2, 5, 6, 7]);
        stream.close();
        assert!(!stream.is_open());

        let reopened = FileStream::open_read(&path).unwrap();
        assert_eq!(reopened.length(), FileAddr(5));
        assert!(reopened.can_read());
        assert!(!reopened.can_write());
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileStream::open_read(dir.path().join("missing.bin")).is_err());
    }
}
