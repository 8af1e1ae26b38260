//! FArc containers: a big-endian entry table followed by file payloads that may be gzip
//! compressed, AES encrypted, or both.

use std::{
    path::Path,
    sync::{Mutex, PoisonError},
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use strum::{Display, FromRepr};

use crate::{
    format::get_bit,
    io::{
        read_from_stream, Endianness, FileAddr, FileStream, MemoryStream, Stream, StreamReadable,
        StreamReader,
    },
    util::{
        compression::decompress_gzip,
        crypto::{
            checked_padded_size, decrypt_aes128_cbc, decrypt_aes128_ecb, padded_size,
            AES_BLOCK_SIZE,
        },
    },
};

/// `project_diva.bin`
pub const CLASSIC_KEY: [u8; 16] = *b"project_diva.bin";
pub const MODERN_KEY: [u8; 16] = [
    0x13, 0x72, 0xD5, 0x7B, 0x6E, 0x9E, 0x31, 0xEB, 0xA2, 0x39, 0xB8, 0x3C, 0x15, 0x57, 0xC6, 0xBB,
];
pub const DUMMY_IV: [u8; 16] = [0xCC; 16];

/// Alignments at or above this can only be the start of an IV.
const ENCRYPTED_TABLE_ALIGNMENT_THRESHOLD: u32 = 0x1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum FArcSignature {
    #[strum(serialize = "FArc")]
    UnCompressed = 0x4641_7263,
    #[strum(serialize = "FArC")]
    Compressed = 0x4641_7243,
    #[strum(serialize = "FARC")]
    Extended = 0x4641_5243,
    #[strum(serialize = "FARc")]
    Reserved = 0x4641_5263,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FArcFlags(pub u32);

impl FArcFlags {
    pub const COMPRESSED: FArcFlags = FArcFlags(1 << 1);
    pub const ENCRYPTED: FArcFlags = FArcFlags(1 << 2);

    #[inline]
    pub fn reserved(self) -> bool { get_bit(self.0, 0) }

    #[inline]
    pub fn compressed(self) -> bool { get_bit(self.0, 1) }

    #[inline]
    pub fn encrypted(self) -> bool { get_bit(self.0, 2) }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
pub enum EncryptionFormat {
    #[default]
    None,
    /// AES-128 ECB over payloads only.
    Classic,
    /// AES-128 CBC over the entry table and payloads.
    Modern,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FArcHeader {
    pub signature: FArcSignature,
    pub flags: FArcFlags,
    pub alignment: u32,
    /// Entries carry a trailing reserved word.
    pub modern: bool,
    pub encryption: EncryptionFormat,
    pub iv: [u8; 16],
}

impl FArcHeader {
    fn new(signature: FArcSignature) -> Self {
        Self {
            signature,
            flags: FArcFlags::default(),
            alignment: 0,
            modern: false,
            encryption: EncryptionFormat::None,
            iv: DUMMY_IV,
        }
    }

    fn entry_size(&self) -> i64 {
        let mut size = 8;
        if self.signature != FArcSignature::UnCompressed {
            size += 4;
        }
        if self.modern {
            size += 4;
        }
        size
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FArcEntry {
    pub name: String,
    pub offset: u64,
    pub compressed_size: usize,
    pub original_size: usize,
}

pub struct FArc {
    header: FArcHeader,
    entries: Vec<FArcEntry>,
    stream: Mutex<FileStream>,
}

impl FArc {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FArc> {
        let path = path.as_ref();
        let mut stream = FileStream::open_read(path)
            .with_context(|| format!("Failed to open '{}'", path.display()))?;
        let (header, entries) = parse_header_and_entries(&mut stream)
            .with_context(|| format!("Failed to parse '{}'", path.display()))?;
        log::debug!(
            "Opened {} '{}' with {} entries ({:?}, {} encryption)",
            header.signature,
            path.display(),
            entries.len(),
            header.flags,
            header.encryption
        );
        Ok(FArc { header, entries, stream: Mutex::new(stream) })
    }

    pub fn header(&self) -> &FArcHeader { &self.header }

    pub fn entries(&self) -> &[FArcEntry] { &self.entries }

    /// Exact, case sensitive name match.
    pub fn find_file(&self, name: &str) -> Option<&FArcEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Reads, decrypts and inflates the content of `entry`.
    pub fn read_file(&self, entry: &FArcEntry) -> Result<Vec<u8>> {
        let header = &self.header;
        let data_offset = match header.encryption {
            EncryptionFormat::Modern => AES_BLOCK_SIZE,
            _ => 0,
        };

        let mut data = {
            let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
            ensure!(stream.is_open() && stream.can_read(), "FArc stream is not readable");
            let length = stream.length().as_u64();
            ensure!(entry.offset < length, "Entry '{}' starts past the end of file", entry.name);
            let available = usize::try_from(length - entry.offset).unwrap_or(usize::MAX);
            let wanted = if header.flags.compressed() {
                checked_padded_size(entry.compressed_size)
                    .and_then(|size| size.checked_add(AES_BLOCK_SIZE))
            } else if header.flags.encrypted() {
                checked_padded_size(entry.original_size)
                    .and_then(|size| size.checked_add(data_offset))
            } else {
                Some(entry.original_size)
            };
            // Never allocate past the end of file; short payloads are rejected below.
            let size = wanted.map_or(available, |size| size.min(available));
            let mut data = Vec::new();
            data.try_reserve_exact(size)
                .map_err(|e| anyhow!("Cannot allocate {size:#X} bytes for '{}': {e}", entry.name))?;
            data.resize(size, 0);
            stream.seek(FileAddr(entry.offset as i64));
            let read = stream.read_buffer(&mut data);
            data.truncate(read);
            data
        };

        if header.flags.encrypted() {
            // A payload cut short by the end of file loses its partial block.
            data.truncate(data.len() & !(AES_BLOCK_SIZE - 1));
            self.decrypt(&mut data)?;
        }

        if header.flags.compressed() {
            let compressed = data.get(data_offset..).unwrap_or_default();
            return decompress_gzip(compressed, entry.original_size)
                .with_context(|| format!("Failed to inflate '{}'", entry.name));
        }

        let end = data_offset.checked_add(entry.original_size).unwrap_or(usize::MAX);
        ensure!(
            data.len() >= end,
            "Short read of '{}': {} of {} bytes",
            entry.name,
            data.len().saturating_sub(data_offset),
            entry.original_size
        );
        data.truncate(end);
        data.drain(..data_offset);
        Ok(data)
    }

    /// Reads `entry` and parses it as `T`. Failures are logged.
    pub fn load<T: StreamReadable + Default>(&self, entry: &FArcEntry) -> Option<T> {
        let data = match self.read_file(entry) {
            Ok(data) => data,
            Err(e) => {
                log::error!("{e:?}");
                return None;
            }
        };
        let mut stream = MemoryStream::from_vec(data);
        read_from_stream(&mut stream, &entry.name)
    }

    fn decrypt(&self, data: &mut [u8]) -> Result<()> {
        match self.header.encryption {
            EncryptionFormat::Classic => decrypt_aes128_ecb(data, &CLASSIC_KEY),
            EncryptionFormat::Modern => decrypt_aes128_cbc(data, &MODERN_KEY, &self.header.iv),
            EncryptionFormat::None => bail!("Encrypted payload without an encryption format"),
        }
    }
}

impl Drop for FArc {
    fn drop(&mut self) {
        self.stream.get_mut().unwrap_or_else(PoisonError::into_inner).close();
    }
}

fn parse_header_and_entries(stream: &mut FileStream) -> Result<(FArcHeader, Vec<FArcEntry>)> {
    let mut reader = StreamReader::new(stream);
    reader.set_endianness(Endianness::Big);
    ensure!(reader.length().get() > 8, "File too small: {} bytes", reader.length().get());

    let raw_signature = reader.read_u32();
    let header_size = reader.read_u32();
    let signature = FArcSignature::from_repr(raw_signature)
        .ok_or_else(|| anyhow!("Unknown signature {raw_signature:#010X}"))?;
    let mut header = FArcHeader::new(signature);

    if signature == FArcSignature::UnCompressed && header_size <= 4 {
        return Ok((header, Vec::new()));
    }
    ensure!(
        reader.length() > reader.position() + header_size as i64,
        "Header size {header_size:#X} exceeds file length {}",
        reader.length()
    );
    let file_length = reader.length().as_u64();

    match signature {
        FArcSignature::UnCompressed | FArcSignature::Compressed => {
            header.alignment = reader.read_u32();
            if signature == FArcSignature::Compressed {
                header.flags = FArcFlags::COMPRESSED;
            }
            let table = reader.read_bytes(header_size.saturating_sub(4) as usize);
            let entries = parse_entries(&table, &header, None, file_length);
            Ok((header, entries))
        }
        FArcSignature::Extended => {
            header.flags = FArcFlags(reader.read_u32());
            reader.skip(4);
            // Either alignment and a zero word, or the first half of an IV.
            header.alignment = reader.read_u32();
            header.modern = reader.read_u32() != 0;

            let encrypted_table = header.flags.encrypted()
                && header.modern
                && header.alignment >= ENCRYPTED_TABLE_ALIGNMENT_THRESHOLD;
            header.encryption = match (header.flags.encrypted(), encrypted_table) {
                (false, _) => EncryptionFormat::None,
                (true, false) => EncryptionFormat::Classic,
                (true, true) => EncryptionFormat::Modern,
            };

            if encrypted_table {
                reader.skip(-8);
                header.iv = reader.read_array();
                let padded = padded_size(header_size as usize);
                let mut table = reader.read_bytes(padded);
                ensure!(table.len() == padded, "Truncated entry table");
                decrypt_aes128_cbc(&mut table, &MODERN_KEY, &header.iv)?;
                table.truncate(header_size as usize);

                let mut table_stream = MemoryStream::from_slice(&table);
                let mut table_reader = StreamReader::new(&mut table_stream);
                table_reader.set_endianness(Endianness::Big);
                header.alignment = table_reader.read_u32();
                table_reader.skip(4);
                let count = table_reader.read_u32();
                table_reader.skip(4);
                let start = (table_reader.position().get() as usize).min(table.len());
                let entries = parse_entries(&table[start..], &header, Some(count), file_length);
                Ok((header, entries))
            } else {
                reader.skip(-4);
                let table = reader.read_bytes(header_size.saturating_sub(12) as usize);
                let mut table_stream = MemoryStream::from_slice(&table);
                let mut table_reader = StreamReader::new(&mut table_stream);
                table_reader.set_endianness(Endianness::Big);
                let count = if header.modern {
                    table_reader.skip(4);
                    let count = table_reader.read_u32();
                    header.alignment = table_reader.read_u32();
                    Some(count)
                } else {
                    table_reader.skip(8);
                    None
                };
                let start = (table_reader.position().get() as usize).min(table.len());
                let entries = parse_entries(&table[start..], &header, count, file_length);
                Ok((header, entries))
            }
        }
        FArcSignature::Reserved => bail!("Unsupported signature {signature}"),
    }
}

/// Parses entries until `count` is reached, or until the table runs out when there is no count.
fn parse_entries(
    table: &[u8],
    header: &FArcHeader,
    count: Option<u32>,
    file_length: u64,
) -> Vec<FArcEntry> {
    let mut stream = MemoryStream::from_slice(table);
    let mut reader = StreamReader::new(&mut stream);
    reader.set_endianness(Endianness::Big);

    let mut entries = Vec::with_capacity(count.unwrap_or(0).min(0x10000) as usize);
    while count.map_or(!reader.end_of_file(), |count| entries.len() < count as usize) {
        let name = reader.read_str();
        if name.is_empty() {
            // Padding after the last entry.
            break;
        }
        if reader.remaining().get() < header.entry_size() {
            log::warn!("Entry '{name}' is truncated");
            break;
        }
        let offset = reader.read_u32() as u64;
        let compressed_size = reader.read_u32() as usize;
        let original_size = match header.signature {
            FArcSignature::UnCompressed => compressed_size,
            _ => reader.read_u32() as usize,
        };
        if header.modern {
            reader.skip(4);
        }
        if offset + compressed_size as u64 > file_length {
            log::warn!("Entry '{name}' extends past the end of file");
        }
        entries.push(FArcEntry { name, offset, compressed_size, original_size });
    }

    if let Some(count) = count {
        if entries.len() != count as usize {
            log::warn!("Expected {count} entries, found {}", entries.len());
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf};

    use flate2::{write::GzEncoder, Compression};

    use super::*;
    use crate::{
        format::objset::ObjSet,
        util::crypto::tests::{encrypt_aes128_cbc, encrypt_aes128_ecb},
    };

    struct TestFile {
        name: &'static str,
        stored: Vec<u8>,
        /// Words following the offset.
        sizes: Vec<u32>,
    }

    fn words(values: &[u32]) -> Vec<u8> { values.iter().flat_map(|v| v.to_be_bytes()).collect() }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn entry_table(files: &[TestFile], mut offset: u32) -> Vec<u8> {
        let mut out = Vec::new();
        for file in files {
            out.extend(file.name.as_bytes());
            out.push(0);
            out.extend(offset.to_be_bytes());
            out.extend(words(&file.sizes));
            offset += file.stored.len() as u32;
        }
        out
    }

    fn plain_farc(signature: &[u8; 4], preamble: &[u8], files: &[TestFile]) -> Vec<u8> {
        let header_size = (preamble.len() + entry_table(files, 0).len()) as u32;
        let mut out = signature.to_vec();
        out.extend(header_size.to_be_bytes());
        out.extend(preamble);
        out.extend(entry_table(files, 8 + header_size));
        for file in files {
            out.extend(&file.stored);
        }
        out
    }

    fn open(bytes: &[u8]) -> (tempfile::TempDir, Result<FArc>) {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("test.farc");
        std::fs::write(&path, bytes).unwrap();
        let farc = FArc::open(&path);
        (dir, farc)
    }

    fn read_all(farc: &FArc) -> Vec<(String, Vec<u8>)> {
        farc.entries()
            .iter()
            .map(|entry| (entry.name.clone(), farc.read_file(entry).unwrap()))
            .collect()
    }

    #[test]
    fn reads_uncompressed() {
        let files = [
            TestFile { name: "a.txt", stored: b"hello".to_vec(), sizes: vec![5] },
            TestFile { name: "b.bin", stored: vec![1, 2, 3, 4], sizes: vec![4] },
        ];
        let (_dir, farc) = open(&plain_farc(b"FArc", &words(&[16]), &files));
        let farc = farc.unwrap();
        assert_eq!(farc.header().signature, FArcSignature::UnCompressed);
        assert_eq!(farc.header().alignment, 16);
        assert_eq!(farc.header().encryption, EncryptionFormat::None);
        assert_eq!(farc.entries().len(), 2);
        assert_eq!(farc.entries()[0].offset, 8 + 4 + 2 * 14);
        assert_eq!(read_all(&farc), [
            ("a.txt".to_string(), b"hello".to_vec()),
            ("b.bin".to_string(), vec![1, 2, 3, 4]),
        ]);
        assert!(farc.find_file("b.bin").is_some());
        assert!(farc.find_file("B.BIN").is_none());
    }

    #[test]
    fn reads_compressed() {
        let payload = b"la la la la la la la la la la".repeat(4);
        let compressed = gzip(&payload);
        let files = [TestFile {
            name: "song.txt",
            sizes: vec![compressed.len() as u32, payload.len() as u32],
            stored: compressed,
        }];
        let (_dir, farc) = open(&plain_farc(b"FArC", &words(&[16]), &files));
        let farc = farc.unwrap();
        assert!(farc.header().flags.compressed());
        let entry = farc.find_file("song.txt").unwrap();
        assert_eq!(entry.original_size, payload.len());
        assert_eq!(farc.read_file(entry).unwrap(), payload);
    }

    #[test]
    fn reads_classic_encrypted() {
        let payload = b"twenty bytes of text".to_vec();
        let mut stored = payload.clone();
        stored.resize(padded_size(payload.len()), 0);
        encrypt_aes128_ecb(&mut stored, &CLASSIC_KEY);
        let files = [TestFile {
            name: "secret.bin",
            sizes: vec![stored.len() as u32, payload.len() as u32],
            stored,
        }];
        let preamble = words(&[FArcFlags::ENCRYPTED.0, 0, 16, 0, 0]);
        let (_dir, farc) = open(&plain_farc(b"FARC", &preamble, &files));
        let farc = farc.unwrap();
        assert_eq!(farc.header().encryption, EncryptionFormat::Classic);
        assert!(!farc.header().modern);
        assert_eq!(read_all(&farc), [("secret.bin".to_string(), payload)]);
    }

    #[test]
    fn reads_modern_unencrypted() {
        let payload = vec![0x5A; 100];
        let compressed = gzip(&payload);
        let files = [
            TestFile {
                name: "first.bin",
                sizes: vec![compressed.len() as u32, payload.len() as u32, 0],
                stored: compressed.clone(),
            },
            TestFile {
                name: "second.bin",
                sizes: vec![compressed.len() as u32, payload.len() as u32, 0],
                stored: compressed,
            },
        ];
        let preamble = words(&[FArcFlags::COMPRESSED.0, 0, 16, 1, 2, 32]);
        let (_dir, farc) = open(&plain_farc(b"FARC", &preamble, &files));
        let farc = farc.unwrap();
        assert!(farc.header().modern);
        assert_eq!(farc.header().alignment, 32);
        assert_eq!(farc.header().encryption, EncryptionFormat::None);
        let contents = read_all(&farc);
        assert_eq!(contents.len(), 2);
        assert!(contents.iter().all(|(_, data)| *data == payload));
    }

    #[test]
    fn reads_modern_encrypted() {
        let iv: [u8; 16] = [
            0x00, 0x00, 0x10, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 1, 2, 3, 4, 5, 6, 7, 8,
        ];
        let payload = b"encrypted and compressed ".repeat(6);
        let compressed = gzip(&payload);
        let mut stored = vec![0xEE; AES_BLOCK_SIZE];
        stored.extend(&compressed);
        stored.resize(padded_size(stored.len()), 0);
        encrypt_aes128_cbc(&mut stored, &MODERN_KEY, &iv);
        let files = [TestFile {
            name: "rom/data.bin",
            sizes: vec![compressed.len() as u32, payload.len() as u32, 0],
            stored,
        }];

        let table_size = 16 + entry_table(&files, 0).len();
        let data_start = 32 + padded_size(table_size) as u32;
        let mut table = words(&[16, 0, 1, 0]);
        table.extend(entry_table(&files, data_start));
        table.resize(padded_size(table_size), 0);
        encrypt_aes128_cbc(&mut table, &MODERN_KEY, &iv);

        let mut bytes = b"FARC".to_vec();
        bytes.extend(words(&[table_size as u32, 6, 0]));
        bytes.extend(iv);
        bytes.extend(table);
        bytes.extend(&files[0].stored);

        let (_dir, farc) = open(&bytes);
        let farc = farc.unwrap();
        assert_eq!(farc.header().encryption, EncryptionFormat::Modern);
        assert_eq!(farc.header().iv, iv);
        assert_eq!(farc.header().alignment, 16);
        assert_eq!(read_all(&farc), [("rom/data.bin".to_string(), payload)]);
    }

    #[test]
    fn empty_archive_is_valid() {
        let mut bytes = b"FArc".to_vec();
        bytes.extend(words(&[4, 16]));
        let (_dir, farc) = open(&bytes);
        let farc = farc.unwrap();
        assert!(farc.entries().is_empty());
        assert!(farc.find_file("anything").is_none());
    }

    #[test]
    fn rejects_invalid_files() {
        let (_dir, farc) = open(b"FArc");
        assert!(farc.is_err(), "too small");

        let mut bytes = b"ABCD".to_vec();
        bytes.extend(words(&[4, 16, 0]));
        let (_dir, farc) = open(&bytes);
        assert!(farc.is_err(), "unknown signature");

        let mut bytes = b"FArC".to_vec();
        bytes.extend(words(&[0x100, 16]));
        let (_dir, farc) = open(&bytes);
        assert!(farc.is_err(), "header past the end");

        let dir = tempfile::tempdir().unwrap();
        assert!(FArc::open(dir.path().join("missing.farc")).is_err());
    }

    #[test]
    fn short_payload_is_an_error() {
        let files = [TestFile { name: "a.bin", stored: vec![1, 2, 3], sizes: vec![3] }];
        let mut bytes = plain_farc(b"FArc", &words(&[16]), &files);
        // Claim more data than the file holds.
        let size = bytes.len() - 3 - 4;
        bytes[size..size + 4].copy_from_slice(&8u32.to_be_bytes());
        let (_dir, farc) = open(&bytes);
        let farc = farc.unwrap();
        assert!(farc.read_file(&farc.entries()[0]).is_err());
    }

    #[test]
    fn oversized_entries_are_errors() {
        // Sizes far beyond the payload, up to values that overflow block padding.
        for size in [0x10_0000u32, u32::MAX] {
            let files = [TestFile { name: "a.bin", stored: vec![1, 2, 3], sizes: vec![size] }];
            let (_dir, farc) = open(&plain_farc(b"FArc", &words(&[16]), &files));
            let farc = farc.unwrap();
            assert!(farc.read_file(&farc.entries()[0]).is_err());

            let payload = vec![0u8; 16];
            let files = [TestFile { name: "b.bin", stored: payload, sizes: vec![16, size] }];
            let preamble = words(&[FArcFlags::ENCRYPTED.0, 0, 16, 0, 0]);
            let (_dir, farc) = open(&plain_farc(b"FARC", &preamble, &files));
            let farc = farc.unwrap();
            assert!(farc.read_file(&farc.entries()[0]).is_err());
            assert!(farc.load::<ObjSet>(&farc.entries()[0]).is_none());
        }

        let entry = FArcEntry {
            name: "huge.bin".to_string(),
            offset: 8,
            compressed_size: usize::MAX,
            original_size: usize::MAX,
        };
        let files = [TestFile { name: "c.bin", stored: vec![0; 4], sizes: vec![4] }];
        let (_dir, farc) = open(&plain_farc(b"FArc", &words(&[16]), &files));
        assert!(farc.unwrap().read_file(&entry).is_err());
    }

    #[test]
    fn loads_readable_entries() {
        let mut obj_set = 0x0506_2500u32.to_le_bytes().to_vec();
        obj_set.resize(32, 0);
        let files = [
            TestFile { name: "obj.bin", sizes: vec![32], stored: obj_set },
            TestFile { name: "junk.bin", sizes: vec![4], stored: vec![0xFF; 4] },
        ];
        let (_dir, farc) = open(&plain_farc(b"FArc", &words(&[16]), &files));
        let farc = farc.unwrap();
        let set = farc.load::<ObjSet>(farc.find_file("obj.bin").unwrap());
        assert!(set.is_some_and(|set| set.objects.is_empty()));
        assert!(farc.load::<ObjSet>(farc.find_file("junk.bin").unwrap()).is_none());
    }
}
