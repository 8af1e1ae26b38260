//! Comfy archives: a header, a metadata blob describing the directory tree, and file payloads
//! that are read on demand.
//!
//! The blob is kept as one byte arena. Stored pointers are absolute file offsets; on mount they
//! are checked against the arena and turned into indices into flat directory and entry tables.

use std::{
    io::Cursor,
    mem::size_of,
    ops::Range,
    path::Path,
    sync::{Mutex, PoisonError},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use binrw::{binrw, BinReaderExt};
use zerocopy::{
    byteorder::{LittleEndian, U32, U64},
    AsBytes, FromBytes, FromZeroes,
};

use crate::{
    format::{get_bit, put_bit, FourCC},
    io::{read_from_stream, FileAddr, FileStream, MemoryStream, Stream, StreamReadable},
};

pub const ARCHIVE_MAGIC: [u8; 4] = [0xCF, 0x5C, 0xAC, 0x90];
pub const ARCHIVE_VERSION: ComfyVersion = ComfyVersion { major: 1, minor: 0, reserved: 0 };
pub const DIRECTORY_SEPARATOR: char = '/';

const MAX_DIRECTORY_DEPTH: usize = 64;

pub const K_ENTRY_FILE: FourCC = FourCC(*b"file");
pub const K_ENTRY_DIRECTORY: FourCC = FourCC(*b"dir\0");
pub const K_ENTRY_ROOT: FourCC = FourCC(*b"root");
pub const K_ENTRY_NONE: FourCC = FourCC(*b"null");

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Root,
    None,
}

impl EntryType {
    pub fn from_four_cc(value: FourCC) -> Option<Self> {
        match value {
            K_ENTRY_FILE => Some(EntryType::File),
            K_ENTRY_DIRECTORY => Some(EntryType::Directory),
            K_ENTRY_ROOT => Some(EntryType::Root),
            K_ENTRY_NONE => Some(EntryType::None),
            _ => None,
        }
    }

    pub fn four_cc(self) -> FourCC {
        match self {
            EntryType::File => K_ENTRY_FILE,
            EntryType::Directory => K_ENTRY_DIRECTORY,
            EntryType::Root => K_ENTRY_ROOT,
            EntryType::None => K_ENTRY_NONE,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EntryFlags {
    pub verified: bool,
    pub encrypted: bool,
    pub compressed: bool,
}

impl EntryFlags {
    pub fn from_bits(value: u32) -> Self {
        Self { verified: get_bit(value, 0), encrypted: get_bit(value, 1), compressed: get_bit(value, 2) }
    }

    pub fn to_bits(&self) -> u32 {
        let mut value = 0;
        put_bit(&mut value, self.verified, 0);
        put_bit(&mut value, self.encrypted, 1);
        put_bit(&mut value, self.compressed, 2);
        value
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveFlags {
    /// 64-bit pointers and sizes in the metadata records.
    pub wide_addresses: bool,
    pub encrypted_strings: bool,
    pub verified: bool,
}

impl ArchiveFlags {
    pub fn from_bits(value: u64) -> Self {
        Self {
            wide_addresses: value & 1 != 0,
            encrypted_strings: value & (1 << 1) != 0,
            verified: value & (1 << 2) != 0,
        }
    }

    pub fn to_bits(&self) -> u64 {
        self.wide_addresses as u64
            | (self.encrypted_strings as u64) << 1
            | (self.verified as u64) << 2
    }
}

#[binrw]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ComfyVersion {
    pub major: u8,
    pub minor: u8,
    pub reserved: u16,
}

#[binrw]
#[brw(little, magic = b"\xCF\x5C\xAC\x90")]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComfyArchiveHeader {
    pub version: ComfyVersion,
    pub creator_id: [u8; 4],
    pub reserved_id: [u8; 4],
    /// Seconds since the Unix epoch.
    pub creation_date: i64,
    #[br(map = ArchiveFlags::from_bits)]
    #[bw(map = ArchiveFlags::to_bits)]
    pub flags: ArchiveFlags,
    pub iv: [u8; 16],
    pub data_size: u64,
    pub data_offset: u64,
}

impl ComfyArchiveHeader {
    pub const SIZE: usize = 64;
}

#[derive(Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct WideEntryRecord {
    entry_type: [u8; 4],
    flags: U32<LittleEndian>,
    name: U64<LittleEndian>,
    size: U64<LittleEndian>,
    offset: U64<LittleEndian>,
}

#[derive(Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct WideDirectoryRecord {
    entry_type: [u8; 4],
    flags: U32<LittleEndian>,
    name: U64<LittleEndian>,
    entry_count: U64<LittleEndian>,
    entries: U64<LittleEndian>,
    sub_directory_count: U64<LittleEndian>,
    sub_directories: U64<LittleEndian>,
}

#[derive(Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct NarrowEntryRecord {
    entry_type: [u8; 4],
    flags: U32<LittleEndian>,
    name: U32<LittleEndian>,
    size: U32<LittleEndian>,
    offset: U64<LittleEndian>,
}

#[derive(Clone, Debug, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct NarrowDirectoryRecord {
    entry_type: [u8; 4],
    flags: U32<LittleEndian>,
    name: U32<LittleEndian>,
    entry_count: U32<LittleEndian>,
    entries: U32<LittleEndian>,
    sub_directory_count: U32<LittleEndian>,
    sub_directories: U32<LittleEndian>,
}

/// Entry record with every field widened.
struct RawEntry {
    entry_type: [u8; 4],
    flags: u32,
    name: u64,
    size: u64,
    offset: u64,
}

struct RawDirectory {
    entry_type: [u8; 4],
    flags: u32,
    name: u64,
    entry_count: u64,
    entries: u64,
    sub_directory_count: u64,
    sub_directories: u64,
}

impl From<&WideEntryRecord> for RawEntry {
    fn from(r: &WideEntryRecord) -> Self {
        Self {
            entry_type: r.entry_type,
            flags: r.flags.get(),
            name: r.name.get(),
            size: r.size.get(),
            offset: r.offset.get(),
        }
    }
}

impl From<&NarrowEntryRecord> for RawEntry {
    fn from(r: &NarrowEntryRecord) -> Self {
        Self {
            entry_type: r.entry_type,
            flags: r.flags.get(),
            name: r.name.get() as u64,
            size: r.size.get() as u64,
            offset: r.offset.get(),
        }
    }
}

impl From<&WideDirectoryRecord> for RawDirectory {
    fn from(r: &WideDirectoryRecord) -> Self {
        Self {
            entry_type: r.entry_type,
            flags: r.flags.get(),
            name: r.name.get(),
            entry_count: r.entry_count.get(),
            entries: r.entries.get(),
            sub_directory_count: r.sub_directory_count.get(),
            sub_directories: r.sub_directories.get(),
        }
    }
}

impl From<&NarrowDirectoryRecord> for RawDirectory {
    fn from(r: &NarrowDirectoryRecord) -> Self {
        Self {
            entry_type: r.entry_type,
            flags: r.flags.get(),
            name: r.name.get() as u64,
            entry_count: r.entry_count.get() as u64,
            entries: r.entries.get() as u64,
            sub_directory_count: r.sub_directory_count.get() as u64,
            sub_directories: r.sub_directories.get() as u64,
        }
    }
}

/// Byte range of a null-terminated name inside the arena.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameSpan(Range<usize>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComfyEntry {
    pub entry_type: EntryType,
    pub flags: EntryFlags,
    name: NameSpan,
    pub size: u64,
    /// Absolute offset of the payload in the archive file.
    pub offset: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComfyDirectory {
    pub entry_type: EntryType,
    pub flags: EntryFlags,
    name: NameSpan,
    entries: Range<usize>,
    sub_directories: Range<usize>,
}

impl ComfyDirectory {
    fn empty() -> Self {
        Self {
            entry_type: EntryType::None,
            flags: EntryFlags::default(),
            name: NameSpan::default(),
            entries: 0..0,
            sub_directories: 0..0,
        }
    }

    pub fn entry_count(&self) -> usize { self.entries.len() }

    pub fn sub_directory_count(&self) -> usize { self.sub_directories.len() }
}

/// Something with a name stored in the archive arena.
pub trait ArchiveNamed {
    fn name_span(&self) -> &NameSpan;
}

impl ArchiveNamed for ComfyEntry {
    fn name_span(&self) -> &NameSpan { &self.name }
}

impl ArchiveNamed for ComfyDirectory {
    fn name_span(&self) -> &NameSpan { &self.name }
}

/// Resolves the stored records of a metadata blob into flat tables.
struct Linker<'a> {
    data: &'a [u8],
    data_offset: u64,
    wide: bool,
    entries: Vec<ComfyEntry>,
    directories: Vec<ComfyDirectory>,
}

impl Linker<'_> {
    fn entry_record_size(&self) -> usize {
        if self.wide {
            size_of::<WideEntryRecord>()
        } else {
            size_of::<NarrowEntryRecord>()
        }
    }

    fn directory_record_size(&self) -> usize {
        if self.wide {
            size_of::<WideDirectoryRecord>()
        } else {
            size_of::<NarrowDirectoryRecord>()
        }
    }

    /// Arena index of a stored file offset.
    fn index(&self, pointer: u64) -> Result<usize> {
        let index = pointer
            .checked_sub(self.data_offset)
            .ok_or_else(|| anyhow!("Pointer {pointer:#X} is before the data region"))?;
        ensure!(
            index < self.data.len() as u64,
            "Pointer {pointer:#X} is past the data region ({:#X} bytes)",
            self.data.len()
        );
        Ok(index as usize)
    }

    /// Arena index of a table of `count` records of `record_size` bytes.
    fn table(&self, pointer: u64, count: u64, record_size: usize) -> Result<usize> {
        let start = self.index(pointer)?;
        let end = count
            .checked_mul(record_size as u64)
            .and_then(|size| size.checked_add(start as u64))
            .ok_or_else(|| anyhow!("Table at {pointer:#X} overflows"))?;
        ensure!(
            end <= self.data.len() as u64,
            "Table of {count} records at {pointer:#X} exceeds the data region"
        );
        Ok(start)
    }

    fn name(&self, pointer: u64) -> Result<NameSpan> {
        if pointer == 0 {
            return Ok(NameSpan::default());
        }
        let start = self.index(pointer)?;
        let length = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow!("Name at {pointer:#X} is not terminated"))?;
        Ok(NameSpan(start..start + length))
    }

    fn read_entry(&self, index: usize) -> Result<RawEntry> {
        let data = &self.data[index..];
        let record = if self.wide {
            WideEntryRecord::ref_from_prefix(data).map(RawEntry::from)
        } else {
            NarrowEntryRecord::ref_from_prefix(data).map(RawEntry::from)
        };
        record.ok_or_else(|| anyhow!("Truncated entry record at arena index {index:#X}"))
    }

    fn read_directory(&self, index: usize) -> Result<RawDirectory> {
        let data = self.data.get(index..).unwrap_or_default();
        let record = if self.wide {
            WideDirectoryRecord::ref_from_prefix(data).map(RawDirectory::from)
        } else {
            NarrowDirectoryRecord::ref_from_prefix(data).map(RawDirectory::from)
        };
        record.ok_or_else(|| anyhow!("Truncated directory record at arena index {index:#X}"))
    }

    fn link_root(&mut self) -> Result<()> {
        let raw = self.read_directory(0).context("Reading root directory")?;
        self.directories.push(ComfyDirectory::empty());
        self.link_directory(0, raw, 0)
    }

    /// Fills `slot` from `raw`, then its children depth-first. Children of one directory get
    /// adjacent slots.
    fn link_directory(&mut self, slot: usize, raw: RawDirectory, depth: usize) -> Result<()> {
        ensure!(depth <= MAX_DIRECTORY_DEPTH, "Directory tree deeper than {MAX_DIRECTORY_DEPTH}");
        let name = self.name(raw.name)?;

        let entries_start = self.entries.len();
        if raw.entry_count > 0 && raw.entries != 0 {
            let entry_size = self.entry_record_size();
            let table = self.table(raw.entries, raw.entry_count, entry_size)?;
            // Directories may share tables, so the total is bounded separately.
            let capacity = self.data.len() / entry_size;
            ensure!(
                self.entries.len() + raw.entry_count as usize <= capacity,
                "More entries than the data region can hold"
            );
            for i in 0..raw.entry_count as usize {
                let entry = self.read_entry(table + i * entry_size)?;
                let entry_type = EntryType::from_four_cc(FourCC(entry.entry_type))
                    .ok_or_else(|| anyhow!("Unknown entry type {}", FourCC(entry.entry_type)))?;
                self.entries.push(ComfyEntry {
                    entry_type,
                    flags: EntryFlags::from_bits(entry.flags),
                    name: self.name(entry.name)?,
                    size: entry.size,
                    offset: entry.offset,
                });
            }
        }
        let entries = entries_start..self.entries.len();

        let mut children = Vec::new();
        if raw.sub_directory_count > 0 && raw.sub_directories != 0 {
            let directory_size = self.directory_record_size();
            let table = self.table(raw.sub_directories, raw.sub_directory_count, directory_size)?;
            let capacity = self.data.len() / directory_size;
            ensure!(
                self.directories.len() + raw.sub_directory_count as usize <= capacity,
                "More directories than the data region can hold"
            );
            for i in 0..raw.sub_directory_count as usize {
                children.push(self.read_directory(table + i * directory_size)?);
            }
        }
        let children_start = self.directories.len();
        for _ in 0..children.len() {
            self.directories.push(ComfyDirectory::empty());
        }

        let entry_type = EntryType::from_four_cc(FourCC(raw.entry_type))
            .ok_or_else(|| anyhow!("Unknown directory type {}", FourCC(raw.entry_type)))?;
        self.directories[slot] = ComfyDirectory {
            entry_type,
            flags: EntryFlags::from_bits(raw.flags),
            name,
            entries,
            sub_directories: children_start..children_start + children.len(),
        };
        log::debug!(
            "Linked directory {slot} with {} entries and {} subdirectories",
            self.directories[slot].entries.len(),
            children.len()
        );

        for (i, child) in children.into_iter().enumerate() {
            self.link_directory(children_start + i, child, depth + 1)?;
        }
        Ok(())
    }
}

struct MountedArchive {
    header: ComfyArchiveHeader,
    stream: Mutex<FileStream>,
    file_length: u64,
    data: Vec<u8>,
    entries: Vec<ComfyEntry>,
    directories: Vec<ComfyDirectory>,
}

impl MountedArchive {
    fn open(path: &Path) -> Result<Self> {
        let mut stream = FileStream::open_read(path)
            .with_context(|| format!("Failed to open file '{}'", path.display()))?;

        let mut header_bytes = [0u8; ComfyArchiveHeader::SIZE];
        ensure!(
            stream.read_buffer(&mut header_bytes) == header_bytes.len(),
            "File too short for an archive header"
        );
        let header: ComfyArchiveHeader =
            Cursor::new(&header_bytes).read_le().context("Invalid archive header")?;
        if header.version.major != ARCHIVE_VERSION.major {
            log::warn!("Archive version {}.{}", header.version.major, header.version.minor);
        }

        let file_length = stream.length().as_u64();
        let data_end = header
            .data_offset
            .checked_add(header.data_size)
            .ok_or_else(|| anyhow!("Data region overflows"))?;
        ensure!(
            data_end <= file_length,
            "Data region {:#X}..{data_end:#X} exceeds file size {file_length:#X}",
            header.data_offset
        );
        let mut data = vec![0u8; header.data_size as usize];
        stream.seek(FileAddr::new(header.data_offset as i64));
        if stream.read_buffer(&mut data) != data.len() {
            bail!("Short read of the data region");
        }

        let mut linker = Linker {
            data: &data,
            data_offset: header.data_offset,
            wide: header.flags.wide_addresses,
            entries: Vec::new(),
            directories: Vec::new(),
        };
        linker.link_root()?;
        let Linker { entries, directories, .. } = linker;

        Ok(Self { header, stream: Mutex::new(stream), file_length, data, entries, directories })
    }

    /// Size of the payload of `entry` if it lies entirely inside the file.
    fn payload_size(&self, entry: &ComfyEntry) -> Option<usize> {
        let end = entry.offset.checked_add(entry.size)?;
        if end > self.file_length {
            return None;
        }
        usize::try_from(entry.size).ok()
    }
}

/// A mounted archive. Lookups are shared reads; payload reads serialize on the backing stream.
#[derive(Default)]
pub struct ComfyArchive {
    mounted: Option<MountedArchive>,
}

impl ComfyArchive {
    pub fn new() -> Self { Self::default() }

    /// Mounts the archive at `path`. Mounting an already mounted archive does nothing.
    /// A failed mount leaves the archive unmounted.
    pub fn mount<P: AsRef<Path>>(&mut self, path: P) -> bool {
        if self.mounted.is_some() {
            return true;
        }
        let path = path.as_ref();
        match MountedArchive::open(path) {
            Ok(mounted) => {
                let encrypted = mounted.header.flags.encrypted_strings;
                self.mounted = Some(mounted);
                if encrypted {
                    self.decrypt_strings();
                }
                true
            }
            Err(e) => {
                log::error!("Failed to mount '{}': {e:#}", path.display());
                false
            }
        }
    }

    /// Drops the metadata and closes the backing file. Safe to call at any time.
    pub fn unmount(&mut self) {
        if let Some(mounted) = self.mounted.take() {
            mounted.stream.into_inner().unwrap_or_else(PoisonError::into_inner).close();
        }
    }

    pub fn is_mounted(&self) -> bool { self.mounted.is_some() }

    pub fn header(&self) -> Option<&ComfyArchiveHeader> { self.mounted.as_ref().map(|m| &m.header) }

    pub fn root(&self) -> Option<&ComfyDirectory> {
        self.mounted.as_ref().and_then(|m| m.directories.first())
    }

    pub fn name<N: ArchiveNamed>(&self, item: &N) -> &str {
        self.mounted
            .as_ref()
            .and_then(|m| m.data.get(item.name_span().0.clone()))
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .unwrap_or_default()
    }

    pub fn entries(&self, directory: &ComfyDirectory) -> &[ComfyEntry] {
        self.mounted
            .as_ref()
            .and_then(|m| m.entries.get(directory.entries.clone()))
            .unwrap_or_default()
    }

    pub fn sub_directories(&self, directory: &ComfyDirectory) -> &[ComfyDirectory] {
        self.mounted
            .as_ref()
            .and_then(|m| m.directories.get(directory.sub_directories.clone()))
            .unwrap_or_default()
    }

    /// Looks up `path` relative to the root. Components are matched exactly.
    pub fn find_file(&self, path: &str) -> Option<&ComfyEntry> {
        let root = self.root()?;
        if path.is_empty() {
            return None;
        }
        match path.rsplit_once(DIRECTORY_SEPARATOR) {
            None => self.find_file_in_directory(root, path),
            Some((directory, file_name)) => {
                let parent = self.find_nested_directory(root, directory)?;
                self.find_file_in_directory(parent, file_name)
            }
        }
    }

    pub fn find_file_in_directory(
        &self,
        directory: &ComfyDirectory,
        file_name: &str,
    ) -> Option<&ComfyEntry> {
        self.entries(directory).iter().find(|e| self.name(*e) == file_name)
    }

    pub fn find_directory(&self, path: &str) -> Option<&ComfyDirectory> {
        self.find_nested_directory(self.root()?, path)
    }

    fn find_nested_directory<'a>(
        &'a self,
        parent: &'a ComfyDirectory,
        path: &str,
    ) -> Option<&'a ComfyDirectory> {
        match path.split_once(DIRECTORY_SEPARATOR) {
            None => self.find_sub_directory(parent, path),
            Some((name, rest)) => {
                let directory = self.find_sub_directory(parent, name)?;
                self.find_nested_directory(directory, rest)
            }
        }
    }

    fn find_sub_directory(&self, parent: &ComfyDirectory, name: &str) -> Option<&ComfyDirectory> {
        self.sub_directories(parent).iter().find(|d| self.name(*d) == name)
    }

    /// Every file with its full path, depth-first.
    pub fn files(&self) -> Vec<(String, &ComfyEntry)> {
        let mut out = Vec::new();
        if let Some(root) = self.root() {
            self.collect_files(root, String::new(), &mut out);
        }
        out
    }

    fn collect_files<'a>(
        &'a self,
        directory: &'a ComfyDirectory,
        prefix: String,
        out: &mut Vec<(String, &'a ComfyEntry)>,
    ) {
        for entry in self.entries(directory) {
            out.push((format!("{prefix}{}", self.name(entry)), entry));
        }
        for sub_directory in self.sub_directories(directory) {
            let prefix = format!("{prefix}{}{DIRECTORY_SEPARATOR}", self.name(sub_directory));
            self.collect_files(sub_directory, prefix, out);
        }
    }

    /// Reads the payload of `entry` into the front of `buffer`.
    pub fn read_file_into_buffer(&self, entry: &ComfyEntry, buffer: &mut [u8]) -> bool {
        let Some((mounted, size)) = self.checked_payload(entry) else {
            return false;
        };
        if buffer.len() < size {
            log::error!("Buffer of {} bytes is too small for {size}", buffer.len());
            return false;
        }
        let mut stream = mounted.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if !stream.is_open() || !stream.can_read() {
            log::error!("Archive stream is not readable");
            return false;
        }
        stream.seek(FileAddr::new(entry.offset as i64));
        let read = stream.read_buffer(&mut buffer[..size]);
        if read != size {
            log::warn!("Short read of {}: {read} of {size} bytes", self.name(entry));
            return false;
        }
        true
    }

    pub fn read_file(&self, entry: &ComfyEntry) -> Option<Vec<u8>> {
        let (_, size) = self.checked_payload(entry)?;
        let mut buffer = Vec::new();
        if let Err(e) = buffer.try_reserve_exact(size) {
            log::error!("Cannot allocate {size:#X} bytes for {}: {e}", self.name(entry));
            return None;
        }
        buffer.resize(size, 0);
        self.read_file_into_buffer(entry, &mut buffer).then_some(buffer)
    }

    /// The mounted state and payload size of `entry`, or `None` after logging why it can't be read.
    fn checked_payload(&self, entry: &ComfyEntry) -> Option<(&MountedArchive, usize)> {
        let Some(mounted) = &self.mounted else {
            log::error!("Read from an archive that is not mounted");
            return None;
        };
        let Some(size) = mounted.payload_size(entry) else {
            log::error!(
                "{} ({:#X} bytes at {:#X}) lies outside of the archive",
                self.name(entry),
                entry.size,
                entry.offset
            );
            return None;
        };
        Some((mounted, size))
    }

    /// Reads `entry` and parses it as `T`. Failures are logged.
    pub fn load<T: StreamReadable + Default>(&self, entry: &ComfyEntry) -> Option<T> {
        let mut stream = MemoryStream::from_vec(self.read_file(entry)?);
        read_from_stream(&mut stream, self.name(entry))
    }

    fn decrypt_strings(&mut self) {
        // TODO: the name cipher is unknown; names stay as stored until it is identified.
        log::warn!("Archive names are encrypted and will be used as stored");
    }
}

impl Drop for ComfyArchive {
    fn drop(&mut self) { self.unmount(); }
}
