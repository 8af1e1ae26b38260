use crate::{
    format::FourCC,
    io::{Endianness, FileAddr, PointerMode, StreamReader},
};

pub const K_SECTION_EOFC: FourCC = FourCC(*b"EOFC");
pub const K_SECTION_AEDB: FourCC = FourCC(*b"AEDB");
pub const K_SECTION_SPDB: FourCC = FourCC(*b"SPDB");
pub const K_SECTION_MOSI: FourCC = FourCC(*b"MOSI");
pub const K_SECTION_MTXI: FourCC = FourCC(*b"MTXI");
pub const K_SECTION_AETC: FourCC = FourCC(*b"AETC");
pub const K_SECTION_SPRC: FourCC = FourCC(*b"SPRC");
pub const K_SECTION_TXPC: FourCC = FourCC(*b"TXPC");
pub const K_SECTION_MTXD: FourCC = FourCC(*b"MTXD");
pub const K_SECTION_MOSD: FourCC = FourCC(*b"MOSD");
pub const K_SECTION_OMDL: FourCC = FourCC(*b"OMDL");
pub const K_SECTION_OIDX: FourCC = FourCC(*b"OIDX");
pub const K_SECTION_OVTX: FourCC = FourCC(*b"OVTX");
pub const K_SECTION_OSKN: FourCC = FourCC(*b"OSKN");
pub const K_SECTION_ENRS: FourCC = FourCC(*b"ENRS");
/// 32-bit relocation table.
pub const K_SECTION_POF0: FourCC = FourCC(*b"POF0");
/// 64-bit relocation table.
pub const K_SECTION_POF1: FourCC = FourCC(*b"POF1");

const SECTION_HEADER_SIZE: usize = 0x20;
const ENDIANNESS_FLAG_LITTLE: u32 = 0x1000_0000;
const ENDIANNESS_FLAG_BIG: u32 = 0x0800_0000;

/// Self-describing chunk header.
///
/// ```text
/// 0x00 u32 signature
/// 0x04 u32 section size    (data start to end of section, children included)
/// 0x08 u32 data offset     (header start to data start)
/// 0x0C u32 endianness      (0x08000000 set: big endian)
/// 0x10 u32 depth
/// 0x14 u32 data size       (data start to first child)
/// 0x18 u32 reserved
/// 0x1C u32 reserved
/// ```
///
/// Header fields are always little endian; the declared endianness applies to the body.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SectionHeader {
    pub signature: FourCC,
    pub header_address: FileAddr,
    pub section_size: u32,
    pub data_offset: u32,
    pub endianness: Endianness,
    pub depth: u32,
    pub data_size: u32,
    pub reserved: [u32; 2],
}

impl SectionHeader {
    pub const SIZE: i64 = SECTION_HEADER_SIZE as i64;

    /// Reads a header only if the next four bytes match `expected`.
    /// The cursor does not move when they don't.
    pub fn try_read(reader: &mut StreamReader, expected: FourCC) -> Option<SectionHeader> {
        let position = reader.position();
        let signature = FourCC(reader.read_at(position, |reader| reader.read_array::<4>()));
        (signature == expected).then(|| Self::read(reader))
    }

    /// Reads a header at the cursor and marks the reader as section framed.
    pub fn read(reader: &mut StreamReader) -> SectionHeader {
        let header_address = reader.position();
        let signature = FourCC(reader.read_array());
        let section_size = reader.read_u32_le();
        let data_offset = reader.read_u32_le();
        let endianness = if reader.read_u32_le() & ENDIANNESS_FLAG_BIG != 0 {
            Endianness::Big
        } else {
            Endianness::Little
        };
        let depth = reader.read_u32_le();
        let data_size = reader.read_u32_le();
        let reserved = [reader.read_u32_le(), reader.read_u32_le()];
        reader.set_has_sections(true);
        SectionHeader {
            signature,
            header_address,
            section_size,
            data_offset,
            endianness,
            depth,
            data_size,
            reserved,
        }
    }

    /// Inverse of [`SectionHeader::read`], used to build section framed test data.
    pub fn to_bytes(&self) -> [u8; SECTION_HEADER_SIZE] {
        let endianness = match self.endianness.resolve() {
            Endianness::Big => ENDIANNESS_FLAG_BIG,
            _ => ENDIANNESS_FLAG_LITTLE,
        };
        let words = [
            self.section_size,
            self.data_offset,
            endianness,
            self.depth,
            self.data_size,
            self.reserved[0],
            self.reserved[1],
        ];
        let mut out = [0u8; SECTION_HEADER_SIZE];
        out[..4].copy_from_slice(&self.signature.0);
        for (chunk, word) in out[4..].chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    #[inline]
    pub fn start_of_subsection_address(&self) -> FileAddr {
        self.header_address + self.data_offset as i64
    }

    #[inline]
    pub fn end_of_subsection_address(&self) -> FileAddr {
        self.start_of_subsection_address() + self.data_size as i64
    }

    #[inline]
    pub fn end_of_section_address(&self) -> FileAddr {
        self.start_of_subsection_address() + self.section_size as i64
    }

    /// Walks the section chain from the start of the stream until a `POF0` or `POF1` header
    /// decides the pointer mode. Without either the mode is 32-bit.
    ///
    /// Runs at most once per reader and leaves the cursor where it was.
    pub fn scan_pof_sections_set_pointer_mode(reader: &mut StreamReader) {
        if !reader.has_sections() || reader.pointer_mode_scanned() {
            return;
        }

        let mode = reader.read_at(FileAddr::NULL, |reader| {
            while reader.remaining().get() >= Self::SIZE {
                let header = Self::read(reader);
                if header.signature == K_SECTION_POF0 {
                    return PointerMode::Mode32Bit;
                }
                if header.signature == K_SECTION_POF1 {
                    return PointerMode::Mode64Bit;
                }
                let next = header.end_of_subsection_address();
                if next <= header.header_address {
                    log::debug!(
                        "Section {} at {} ends before it starts, stopping scan",
                        header.signature,
                        header.header_address
                    );
                    break;
                }
                reader.seek(next);
            }
            PointerMode::Mode32Bit
        });

        log::debug!("Detected pointer mode {mode:?}");
        reader.set_pointer_mode(mode);
        reader.set_pointer_mode_scanned(true);
    }
}
