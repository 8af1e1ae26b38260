use std::cmp::max;

use anyhow::{anyhow, bail, ensure, Result};
use image::{
    imageops, DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, Luma, LumaA, Pixel, Rgba,
    RgbImage, RgbaImage,
};
use strum::{Display, FromRepr};

use crate::{
    format::{
        objset::{ObjSet, TexId},
        IVec2,
    },
    io::{
        section::{K_SECTION_MTXD, K_SECTION_TXPC},
        PointerMode, SectionHeader, StreamError, StreamReadable, StreamReader,
        StreamResult, StreamWriter,
    },
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum TxpSig {
    MipMap = 0x0250_5854,
    TexSet = 0x0350_5854,
    Texture2D = 0x0450_5854,
    CubeMap = 0x0550_5854,
}

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromRepr, Display)]
#[repr(i32)]
pub enum TextureFormat {
    #[default]
    Unknown = -1,
    A8 = 0,
    RGB8 = 1,
    RGBA8 = 2,
    RGB5 = 3,
    RGB5_A1 = 4,
    RGBA4 = 5,
    DXT1 = 6,
    DXT1a = 7,
    DXT3 = 8,
    DXT5 = 9,
    RGTC1 = 10,
    RGTC2 = 11,
    L8 = 12,
    L8A8 = 13,
}

impl TextureFormat {
    /// Unrecognized values map to [`TextureFormat::Unknown`].
    pub fn from_raw(value: i32) -> Self { Self::from_repr(value).unwrap_or_default() }
}

pub const CUBE_FACE_COUNT: usize = 6;

const PACKED_INFO_MASK: u32 = 0x0101_0100;
const TEX_SET_ALIGNMENT: u32 = 16;

const BC1_BLOCK_SIZE: usize = 8;
const BC2_BLOCK_SIZE: usize = 16;
const BC3_BLOCK_SIZE: usize = 16;
const BC4_BLOCK_SIZE: usize = 8;
const BC5_BLOCK_SIZE: usize = 16;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TexMipMap {
    pub size: IVec2,
    pub format: TextureFormat,
    pub data: Vec<u8>,
}

impl TexMipMap {
    /// Decodes the pixel data into an image.
    pub fn decode(&self) -> Result<DynamicImage> {
        ensure!(
            self.size.x > 0 && self.size.y > 0,
            "Invalid mip size {}x{}",
            self.size.x,
            self.size.y
        );
        let (w, h) = (self.size.x as u32, self.size.y as u32);
        let data = self.data.as_slice();
        let conversion_failed = || {
            anyhow!("Conversion failed: {} {}x{} from size {}", self.format, w, h, data.len())
        };
        Ok(match self.format {
            TextureFormat::A8 => {
                let pixels = data.iter().flat_map(|&a| [u8::MAX, a]).collect();
                DynamicImage::ImageLumaA8(
                    GrayAlphaImage::from_raw(w, h, pixels).ok_or_else(conversion_failed)?,
                )
            }
            TextureFormat::L8 => DynamicImage::ImageLuma8(
                GrayImage::from_raw(w, h, data.to_vec()).ok_or_else(conversion_failed)?,
            ),
            TextureFormat::L8A8 => DynamicImage::ImageLumaA8(
                GrayAlphaImage::from_raw(w, h, data.to_vec()).ok_or_else(conversion_failed)?,
            ),
            TextureFormat::RGB8 => DynamicImage::ImageRgb8(
                RgbImage::from_raw(w, h, data.to_vec()).ok_or_else(conversion_failed)?,
            ),
            TextureFormat::RGBA8 => DynamicImage::ImageRgba8(
                RgbaImage::from_raw(w, h, data.to_vec()).ok_or_else(conversion_failed)?,
            ),
            TextureFormat::DXT1 | TextureFormat::DXT1a => DynamicImage::ImageRgba8(
                decompress_bcn::<Rgba<u8>, _, BC1_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                    bcdec_rs::bc1(src, dst, pitch)
                })?,
            ),
            TextureFormat::DXT3 => DynamicImage::ImageRgba8(
                decompress_bcn::<Rgba<u8>, _, BC2_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                    bcdec_rs::bc2(src, dst, pitch)
                })?,
            ),
            TextureFormat::DXT5 => DynamicImage::ImageRgba8(
                decompress_bcn::<Rgba<u8>, _, BC3_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                    bcdec_rs::bc3(src, dst, pitch)
                })?,
            ),
            TextureFormat::RGTC1 => DynamicImage::ImageLuma8(
                decompress_bcn::<Luma<u8>, _, BC4_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                    bcdec_rs::bc4(src, dst, pitch)
                })?,
            ),
            TextureFormat::RGTC2 => DynamicImage::ImageLumaA8(
                decompress_bcn::<LumaA<u8>, _, BC5_BLOCK_SIZE>(data, w, h, |src, dst, pitch| {
                    bcdec_rs::bc5(src, dst, pitch)
                })?,
            ),
            format => bail!("Unsupported conversion from {format}"),
        })
    }
}

/// Decodes 4x4 blocks into an image cropped to `w` x `h`.
fn decompress_bcn<P, F, const BLOCK_SIZE: usize>(
    data: &[u8],
    w: u32,
    h: u32,
    func: F,
) -> Result<ImageBuffer<P, Vec<P::Subpixel>>>
where
    P: Pixel + 'static,
    F: Fn(&[u8], &mut [P::Subpixel], usize),
{
    let padded_w = max(w.div_ceil(4) * 4, 4);
    let padded_h = max(h.div_ceil(4) * 4, 4);
    let block_count = ((padded_w / 4) * (padded_h / 4)) as usize;
    ensure!(
        data.len() >= block_count * BLOCK_SIZE,
        "Block data too short: {} < {}",
        data.len(),
        block_count * BLOCK_SIZE
    );
    let mut image = ImageBuffer::<P, Vec<P::Subpixel>>::new(padded_w, padded_h);
    let buffer = image.as_flat_samples_mut();
    let mut blocks = data.chunks_exact(BLOCK_SIZE);
    for i in (0..padded_h as usize).step_by(4) {
        for j in (0..padded_w as usize).step_by(4) {
            let Some(block) = blocks.next() else { bail!("Ran out of blocks") };
            let start = i * buffer.layout.height_stride + j * buffer.layout.width_stride;
            func(block, &mut buffer.samples[start..], buffer.layout.height_stride);
        }
    }
    if (padded_w, padded_h) == (w, h) {
        return Ok(image);
    }
    Ok(imageops::crop_imm(&image, 0, 0, w, h).to_image())
}

/// A texture: `mip_maps[array index or cube face][mip level]`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tex {
    pub id: Option<TexId>,
    pub name: Option<String>,
    pub mip_maps: Vec<Vec<TexMipMap>>,
}

impl Tex {
    pub const UNKNOWN_NAME: &'static str = "Unknown";

    pub fn mip_maps(&self, array_index: usize) -> &[TexMipMap] {
        self.mip_maps.get(array_index).map(Vec::as_slice).unwrap_or_default()
    }

    /// Derived from the face count, never stored.
    pub fn signature(&self) -> TxpSig {
        if self.mip_maps.len() == CUBE_FACE_COUNT {
            TxpSig::CubeMap
        } else {
            TxpSig::Texture2D
        }
    }

    /// Size of the first mip of the first face.
    pub fn size(&self) -> IVec2 { self.first_mip().map(|m| m.size).unwrap_or_default() }

    pub fn format(&self) -> TextureFormat { self.first_mip().map(|m| m.format).unwrap_or_default() }

    pub fn name(&self) -> &str { self.name.as_deref().unwrap_or(Self::UNKNOWN_NAME) }

    fn first_mip(&self) -> Option<&TexMipMap> { self.mip_maps.first().and_then(|m| m.first()) }

    /// Reads a texture record at the cursor.
    pub fn read(&mut self, reader: &mut StreamReader) -> StreamResult {
        reader.push_base_offset();
        let result = self.read_mip_maps(reader);
        reader.pop_base_offset();
        result
    }

    fn read_mip_maps(&mut self, reader: &mut StreamReader) -> StreamResult {
        let signature = TxpSig::from_repr(reader.read_u32());
        let mip_map_count = reader.read_u32() as usize;
        let _mip_levels = reader.read_u8();
        let array_size = reader.read_u8() as usize;
        let _depth = reader.read_u8();
        let _dimensions = reader.read_u8();

        let mip_levels = match signature {
            Some(TxpSig::Texture2D) => mip_map_count,
            Some(TxpSig::CubeMap) => {
                if array_size == 0 {
                    log::warn!("Cube map declares no faces");
                    return Err(StreamError::BadCount);
                }
                mip_map_count / array_size
            }
            _ => return Err(StreamError::BadFormat),
        };

        let mut mip_maps = Vec::with_capacity(array_size);
        for _ in 0..array_size {
            let mut level = Vec::with_capacity(mip_levels.min(u8::MAX as usize));
            for _ in 0..mip_levels {
                let offset = reader.read_ptr_32();
                if !reader.is_valid_pointer(offset, true) {
                    return Err(StreamError::BadPointer);
                }
                level.push(reader.read_at_offset_aware(offset, read_mip_map)?);
            }
            mip_maps.push(level);
        }
        self.mip_maps = mip_maps;
        Ok(())
    }
}

fn read_mip_map(reader: &mut StreamReader) -> StreamResult<TexMipMap> {
    if TxpSig::from_repr(reader.read_u32()) != Some(TxpSig::MipMap) {
        return Err(StreamError::BadFormat);
    }
    let size = reader.read_ivec2();
    let format = TextureFormat::from_raw(reader.read_u32() as i32);
    let _mip_index = reader.read_u8();
    let _array_index = reader.read_u8();
    let _padding = reader.read_u16();

    let data_size = reader.read_u32() as i64;
    if data_size > reader.remaining().get() {
        return Err(StreamError::BadCount);
    }
    let data = reader.read_bytes(data_size as usize);
    Ok(TexMipMap { size, format, data })
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TexSet {
    pub textures: Vec<Tex>,
}

impl TexSet {
    /// Serializes the set at the cursor. Stored counts are derived from the textures.
    ///
    /// Fails with [`StreamError::BadCount`] before writing anything when a texture's faces
    /// disagree on their mip count or a count does not fit its field.
    pub fn write<'s, 'f>(&'f self, writer: &mut StreamWriter<'s, 'f>) -> StreamResult {
        let texture_count =
            u32::try_from(self.textures.len()).map_err(|_| StreamError::BadCount)?;
        let layouts = self.textures.iter().map(tex_layout).collect::<StreamResult<Vec<_>>>()?;

        let set_base = writer.position();
        writer.write_u32(TxpSig::TexSet as u32);
        writer.write_u32(texture_count);
        writer.write_u32(texture_count | PACKED_INFO_MASK);

        for (texture, layout) in self.textures.iter().zip(layouts) {
            writer.write_func_ptr(move |writer| write_tex(texture, layout, writer), set_base);
        }

        writer.flush_pointer_pool();
        writer.write_alignment_padding(TEX_SET_ALIGNMENT);
        Ok(())
    }

    /// Assigns ids from the object set's texture id table, up to the shorter of the two.
    pub fn set_texture_ids(&mut self, obj_set: &ObjSet) {
        if obj_set.texture_ids.len() > self.textures.len() {
            log::warn!(
                "Object set lists {} texture ids for {} textures",
                obj_set.texture_ids.len(),
                self.textures.len()
            );
        }
        for (texture, &id) in self.textures.iter_mut().zip(&obj_set.texture_ids) {
            texture.id = Some(id);
        }
    }

    pub fn find(&self, id: TexId) -> Option<&Tex> {
        self.textures.iter().find(|t| t.id == Some(id))
    }

    fn read_textures(&mut self, reader: &mut StreamReader) -> StreamResult {
        if TxpSig::from_repr(reader.read_u32()) != Some(TxpSig::TexSet) {
            return Err(StreamError::BadFormat);
        }
        let texture_count = reader.read_u32() as usize;
        let _packed_info = reader.read_u32();

        let mut textures = Vec::with_capacity(texture_count.min(u16::MAX as usize));
        for _ in 0..texture_count {
            let offset = reader.read_ptr_32();
            if !reader.is_valid_pointer(offset, true) {
                return Err(StreamError::BadPointer);
            }
            let mut texture = Tex::default();
            reader.read_at_offset_aware(offset, |reader| texture.read(reader))?;
            textures.push(texture);
        }
        self.textures = textures;
        Ok(())
    }
}

/// Face and mip counts of a texture, checked against the widths of their on-disk fields.
fn tex_layout(texture: &Tex) -> StreamResult<(u8, u8)> {
    let array_size = u8::try_from(texture.mip_maps.len()).map_err(|_| StreamError::BadCount)?;
    let levels = texture.mip_maps.first().map_or(0, Vec::len);
    let mip_levels = u8::try_from(levels).map_err(|_| StreamError::BadCount)?;
    for face in &texture.mip_maps {
        if face.len() != levels {
            log::error!("Texture faces disagree on mip count ({} and {levels})", face.len());
            return Err(StreamError::BadCount);
        }
        if face.iter().any(|mip_map| u32::try_from(mip_map.data.len()).is_err()) {
            return Err(StreamError::BadCount);
        }
    }
    Ok((array_size, mip_levels))
}

fn write_tex<'s, 'f>(texture: &'f Tex, layout: (u8, u8), writer: &mut StreamWriter<'s, 'f>) {
    let tex_base = writer.position();
    let (array_size, mip_levels) = layout;

    writer.write_u32(texture.signature() as u32);
    writer.write_u32(array_size as u32 * mip_levels as u32);
    writer.write_u8(mip_levels);
    writer.write_u8(array_size);
    writer.write_u8(1);
    writer.write_u8(1);

    for array_index in 0..array_size {
        for mip_index in 0..mip_levels {
            writer.write_func_ptr(
                move |writer| {
                    let mip_map = &texture.mip_maps[array_index as usize][mip_index as usize];
                    writer.write_u32(TxpSig::MipMap as u32);
                    writer.write_ivec2(mip_map.size);
                    writer.write_u32(mip_map.format as i32 as u32);
                    writer.write_u8(mip_index);
                    writer.write_u8(array_index);
                    writer.write_u8(0);
                    writer.write_u8(0);
                    writer.write_u32(mip_map.data.len() as u32);
                    writer.write_buffer(&mip_map.data);
                },
                tex_base,
            );
        }
    }
}

impl StreamReadable for TexSet {
    /// Reads a flat set, or one embedded in an `MTXD`/`TXPC` section.
    fn read(&mut self, reader: &mut StreamReader) -> StreamResult {
        let header = SectionHeader::try_read(reader, K_SECTION_MTXD)
            .or_else(|| SectionHeader::try_read(reader, K_SECTION_TXPC));
        SectionHeader::scan_pof_sections_set_pointer_mode(reader);

        let scopes = push_set_scopes(reader, header.as_ref());
        let result = self.read_textures(reader);
        for _ in 0..scopes {
            reader.pop_base_offset();
        }
        result
    }
}

/// Opens the base scopes a set is read under and returns how many were pushed.
///
/// Sectioned 64-bit sets nest their pointers one scope deeper. Both scopes start at the
/// subsection, so only the depth differs.
fn push_set_scopes(reader: &mut StreamReader, header: Option<&SectionHeader>) -> usize {
    let mut scopes = 1;
    if let Some(header) = header {
        reader.set_endianness(header.endianness);
        reader.seek(header.start_of_subsection_address());
        if reader.pointer_mode() == PointerMode::Mode64Bit {
            reader.push_base_offset();
            scopes += 1;
        }
    }
    reader.push_base_offset();
    scopes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::FourCC,
        io::{section::K_SECTION_POF1, Endianness, FileAddr, FileStream, MemoryStream},
    };

    fn mip(w: i32, h: i32, format: TextureFormat, fill: u8, len: usize) -> TexMipMap {
        TexMipMap { size: IVec2 { x: w, y: h }, format, data: vec![fill; len] }
    }

    fn sample_set() -> TexSet {
        let texture_2d =
            Tex { mip_maps: vec![vec![mip(2, 2, TextureFormat::RGBA8, 0x7F, 16)]], ..Default::default() };
        let cube_map = Tex {
            mip_maps: (0..CUBE_FACE_COUNT as u8)
                .map(|face| {
                    vec![
                        mip(4, 4, TextureFormat::DXT1, face, 8),
                        mip(2, 2, TextureFormat::DXT1, face + 0x10, 8),
                    ]
                })
                .collect(),
            ..Default::default()
        };
        TexSet { textures: vec![texture_2d, cube_map] }
    }

    fn write_set(set: &TexSet) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tex.bin");
        {
            let mut stream = FileStream::create_read_write(&path).unwrap();
            let mut writer = StreamWriter::new(&mut stream);
            set.write(&mut writer).unwrap();
        }
        std::fs::read(&path).unwrap()
    }

    fn read_set(bytes: &[u8]) -> (TexSet, StreamResult) {
        let mut stream = MemoryStream::from_slice(bytes);
        let mut reader = StreamReader::new(&mut stream);
        let mut set = TexSet::default();
        let result = set.read(&mut reader);
        assert_eq!(reader.base_offset_depth(), 0);
        (set, result)
    }

    #[test]
    fn write_read_round_trip() {
        let set = sample_set();
        let bytes = write_set(&set);
        assert_eq!(bytes.len() % 16, 0);

        let (read, result) = read_set(&bytes);
        assert_eq!(result, Ok(()));
        assert_eq!(read, set);

        assert_eq!(read.textures[0].signature(), TxpSig::Texture2D);
        assert_eq!(read.textures[0].size(), IVec2 { x: 2, y: 2 });
        assert_eq!(read.textures[0].format(), TextureFormat::RGBA8);
        assert_eq!(read.textures[0].name(), Tex::UNKNOWN_NAME);
        assert_eq!(read.textures[1].signature(), TxpSig::CubeMap);
        assert_eq!(read.textures[1].mip_maps.len(), CUBE_FACE_COUNT);
        assert_eq!(read.textures[1].mip_maps(5)[1].data, vec![0x15; 8]);
        assert!(read.textures[1].mip_maps(6).is_empty());
    }

    #[test]
    fn writes_packed_header() {
        let bytes = write_set(&sample_set());
        let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(0), TxpSig::TexSet as u32);
        assert_eq!(word(1), 2);
        assert_eq!(word(2), 2 | PACKED_INFO_MASK);
        assert_eq!(FourCC::from_le_u32(word(0)).to_string(), "TXP\\x03");
    }

    #[test]
    fn rejects_bad_set_signature() {
        let mut bytes = write_set(&sample_set());
        bytes[3] = 0x04;
        let (set, result) = read_set(&bytes);
        assert_eq!(result, Err(StreamError::BadFormat));
        assert!(set.textures.is_empty());
    }

    /// Set with one 2D texture whose single mip declares `data_size`.
    fn single_mip_set(mip_signature: TxpSig, data_size: u32) -> Vec<u8> {
        let words: [u32; 13] = [
            TxpSig::TexSet as u32,
            1,
            1 | PACKED_INFO_MASK,
            16,
            TxpSig::Texture2D as u32,
            1,
            0x0101_0101,
            16,
            mip_signature as u32,
            1,
            1,
            TextureFormat::RGBA8 as u32,
            0,
        ];
        let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.extend(data_size.to_le_bytes());
        bytes.extend([0xAA; 4]);
        bytes
    }

    #[test]
    fn reads_minimal_set() {
        let (set, result) = read_set(&single_mip_set(TxpSig::MipMap, 4));
        assert_eq!(result, Ok(()));
        assert_eq!(set.textures[0].mip_maps[0][0].data, vec![0xAA; 4]);
    }

    #[test]
    fn rejects_oversized_mip() {
        let (set, result) = read_set(&single_mip_set(TxpSig::MipMap, 5));
        assert_eq!(result, Err(StreamError::BadCount));
        assert!(set.textures.is_empty());
    }

    #[test]
    fn rejects_bad_mip_signature() {
        let (_, result) = read_set(&single_mip_set(TxpSig::Texture2D, 4));
        assert_eq!(result, Err(StreamError::BadFormat));
    }

    #[test]
    fn rejects_out_of_range_texture() {
        let mut bytes = single_mip_set(TxpSig::MipMap, 4);
        bytes[12..16].copy_from_slice(&0x1000u32.to_le_bytes());
        assert_eq!(read_set(&bytes).1, Err(StreamError::BadPointer));
    }

    #[test]
    fn rejects_faceless_cube_map() {
        let mut bytes = single_mip_set(TxpSig::MipMap, 4);
        bytes[16..20].copy_from_slice(&(TxpSig::CubeMap as u32).to_le_bytes());
        bytes[25] = 0;
        assert_eq!(read_set(&bytes).1, Err(StreamError::BadCount));
    }

    fn embed(signature: FourCC, body: &[u8], pof: Option<FourCC>) -> Vec<u8> {
        let header = SectionHeader {
            signature,
            section_size: body.len() as u32,
            data_offset: SectionHeader::SIZE as u32,
            endianness: Endianness::Little,
            data_size: body.len() as u32,
            ..Default::default()
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(body);
        if let Some(pof) = pof {
            bytes.extend(SectionHeader { signature: pof, data_offset: 0x20, ..Default::default() }.to_bytes());
        }
        bytes
    }

    #[test]
    fn reads_sectioned_set() {
        let set = sample_set();
        let body = write_set(&set);

        let (read, result) = read_set(&embed(K_SECTION_TXPC, &body, None));
        assert_eq!(result, Ok(()));
        assert_eq!(read, set);

        let bytes = embed(K_SECTION_MTXD, &body, Some(K_SECTION_POF1));
        let mut stream = MemoryStream::from_slice(&bytes);
        let mut reader = StreamReader::new(&mut stream);
        let mut read = TexSet::default();
        assert_eq!(read.read(&mut reader), Ok(()));
        assert_eq!(reader.pointer_mode(), PointerMode::Mode64Bit);
        assert_eq!(reader.base_offset_depth(), 0);
        assert_eq!(read, set);
    }

    #[test]
    fn sectioned_scopes_follow_pointer_mode() {
        let body = write_set(&sample_set());
        let bytes = embed(K_SECTION_MTXD, &body, None);
        let header = SectionHeader { data_offset: SectionHeader::SIZE as u32, ..Default::default() };
        let subsection = header.start_of_subsection_address();
        let mut stream = MemoryStream::from_slice(&bytes);
        let mut reader = StreamReader::new(&mut stream);

        for (mode, sectioned, expected) in [
            (PointerMode::Mode64Bit, true, 2),
            (PointerMode::Mode32Bit, true, 1),
            (PointerMode::Mode64Bit, false, 1),
        ] {
            reader.seek(FileAddr(4));
            reader.set_pointer_mode(mode);
            let scopes = push_set_scopes(&mut reader, sectioned.then_some(&header));
            assert_eq!(scopes, expected, "{mode:?} sectioned={sectioned}");
            assert_eq!(reader.base_offset_depth(), expected);
            let start = if sectioned { subsection } else { FileAddr(4) };
            assert_eq!(reader.base_offset(), start);
            for _ in 0..scopes {
                assert_eq!(reader.pop_base_offset(), start);
            }
            assert_eq!(reader.base_offset_depth(), 0);
        }
    }

    #[test]
    fn sectioned_read_keeps_caller_base() {
        let set = sample_set();
        let bytes = embed(K_SECTION_MTXD, &write_set(&set), Some(K_SECTION_POF1));
        let mut stream = MemoryStream::from_slice(&bytes);
        let mut reader = StreamReader::new(&mut stream);
        reader.seek(FileAddr(4));
        reader.push_base_offset();
        reader.seek(FileAddr::NULL);

        let mut read = TexSet::default();
        assert_eq!(read.read(&mut reader), Ok(()));
        assert_eq!(reader.pointer_mode(), PointerMode::Mode64Bit);
        assert_eq!(reader.base_offset_depth(), 1);
        assert_eq!(reader.base_offset(), FileAddr(4));
        assert_eq!(read, set);
    }

    #[test]
    fn rejects_uneven_faces() {
        let m = || mip(2, 2, TextureFormat::RGBA8, 0, 16);
        let uneven = Tex { mip_maps: vec![vec![m(), m()], vec![m()]], ..Default::default() };
        let too_many_faces = Tex { mip_maps: vec![vec![m()]; 256], ..Default::default() };
        let too_many_mips = Tex { mip_maps: vec![vec![m(); 256]], ..Default::default() };

        let dir = tempfile::tempdir().unwrap();
        for texture in [uneven, too_many_faces, too_many_mips] {
            let path = dir.path().join("tex.bin");
            let set = TexSet { textures: vec![sample_set().textures[0].clone(), texture] };
            {
                let mut stream = FileStream::create_read_write(&path).unwrap();
                let mut writer = StreamWriter::new(&mut stream);
                assert_eq!(set.write(&mut writer), Err(StreamError::BadCount));
            }
            assert!(std::fs::read(&path).unwrap().is_empty());
        }
    }

    #[test]
    fn assigns_texture_ids() {
        let mut set = sample_set();
        let obj_set = ObjSet { texture_ids: vec![TexId(10), TexId(20), TexId(30)], ..Default::default() };
        set.set_texture_ids(&obj_set);
        assert_eq!(set.textures[0].id, Some(TexId(10)));
        assert_eq!(set.textures[1].id, Some(TexId(20)));
        assert!(set.find(TexId(20)).is_some_and(|t| t.signature() == TxpSig::CubeMap));
        assert!(set.find(TexId(30)).is_none());
    }

    #[test]
    fn decodes_mips() {
        let rgba = mip(2, 2, TextureFormat::RGBA8, 0x40, 16).decode().unwrap();
        assert_eq!((rgba.width(), rgba.height()), (2, 2));

        // Solid white BC1 block: both endpoints 0xFFFF, all indices 0.
        let mut block = TexMipMap {
            size: IVec2 { x: 4, y: 4 },
            format: TextureFormat::DXT1,
            data: vec![0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0],
        };
        let image = block.decode().unwrap().to_rgba8();
        assert_eq!(image.get_pixel(3, 3).0, [0xFF, 0xFF, 0xFF, 0xFF]);

        block.size = IVec2 { x: 2, y: 2 };
        let image = block.decode().unwrap();
        assert_eq!((image.width(), image.height()), (2, 2));

        assert!(mip(2, 2, TextureFormat::RGBA8, 0, 15).decode().is_err());
        assert!(mip(2, 2, TextureFormat::RGBA4, 0, 8).decode().is_err());
    }
}
