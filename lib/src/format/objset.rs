//! Object sets: meshes, materials and skeletons.
//!
//! The layout is the flat legacy one. Object, skeleton, name and id tables are absolute;
//! everything below an object is relative to the start of that object.

use bytemuck::Pod;
use strum::{Display, FromRepr};

use crate::{
    format::{get_bits, put_bits, Mat4, Sphere, Vec2, Vec3, Vec4},
    io::{FileAddr, PointerMode, StreamError, StreamReadable, StreamReader, StreamResult},
};

pub const OBJ_SET_SIGNATURE_LEGACY: u32 = 0x0506_2500;
pub const OBJ_SET_SIGNATURE_MODERN: u32 = 0x0506_2501;

pub const MAX_BONE_COUNT: usize = 192;
pub const VERTEX_ATTRIBUTE_SLOTS: usize = 20;
pub const MATERIAL_TEXTURE_SLOTS: usize = 8;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub u32);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TexId(pub u32);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoneId(pub u32);

/// Converts between a bit field and its struct member.
trait BitField: Copy {
    fn from_field(value: u32) -> Self;
    fn to_field(self) -> u32;
}

impl BitField for bool {
    fn from_field(value: u32) -> Self { value != 0 }

    fn to_field(self) -> u32 { self as u32 }
}

impl BitField for u8 {
    fn from_field(value: u32) -> Self { value as u8 }

    fn to_field(self) -> u32 { self as u32 }
}

impl BitField for u16 {
    fn from_field(value: u32) -> Self { value as u16 }

    fn to_field(self) -> u32 { self as u32 }
}

impl BitField for u32 {
    fn from_field(value: u32) -> Self { value }

    fn to_field(self) -> u32 { self }
}

/// Declares a 32-bit flags struct. Each member is listed with its bit offset and width,
/// least significant bit first.
macro_rules! flags32 {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$field_meta:meta])* $field:ident: $ty:ty = $offset:literal, $width:literal;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            $($(#[$field_meta])* pub $field: $ty,)*
        }

        impl $name {
            pub fn from_bits(value: u32) -> Self {
                Self { $($field: <$ty as BitField>::from_field(get_bits(value, $offset, $width)),)* }
            }

            pub fn to_bits(&self) -> u32 {
                let mut value = 0u32;
                $(put_bits(&mut value, BitField::to_field(self.$field), $offset, $width);)*
                value
            }
        }
    };
}

flags32! {
    pub struct SubMeshFlags {
        receives_shadows: bool = 0, 1;
        casts_shadows: bool = 1, 1;
        transparent: bool = 2, 1;
        reserved: u32 = 3, 29;
    }
}

flags32! {
    pub struct MeshFlags {
        unknown0: bool = 0, 1;
        face_camera_position: bool = 1, 1;
        unknown1: bool = 2, 1;
        face_camera_view: bool = 3, 1;
        reserved: u32 = 4, 28;
    }
}

flags32! {
    /// Which texture kinds a material binds.
    pub struct MaterialUsedTextureFlags {
        color: bool = 0, 1;
        color_a: bool = 1, 1;
        color_l1: bool = 2, 1;
        color_l1_a: bool = 3, 1;
        color_l2: bool = 4, 1;
        color_l2_a: bool = 5, 1;
        transparency: bool = 6, 1;
        specular: bool = 7, 1;
        normal: bool = 8, 1;
        normal_alt: bool = 9, 1;
        environment: bool = 10, 1;
        color_l3: bool = 11, 1;
        color_l3_a: bool = 12, 1;
        translucency: bool = 13, 1;
        unknown0: bool = 14, 1;
        override_ibl_cube_map: bool = 15, 1;
        reserved: u16 = 16, 16;
    }
}

flags32! {
    pub struct MaterialShaderFlags {
        vertex_translation_type: u8 = 0, 2;
        color_source_type: u8 = 2, 2;
        lambert: bool = 4, 1;
        phong: bool = 5, 1;
        per_pixel: bool = 6, 1;
        double_shading: bool = 7, 1;
        bump_map_type: u8 = 8, 2;
        fresnel: u8 = 10, 4;
        line_light: u8 = 14, 4;
        receives_shadows: bool = 18, 1;
        casts_shadows: bool = 19, 1;
        specular_quality: u8 = 20, 1;
        aniso_direction: u8 = 21, 3;
        reserved: u8 = 24, 8;
    }
}

flags32! {
    pub struct TextureSamplerFlags {
        repeat_u: bool = 0, 1;
        repeat_v: bool = 1, 1;
        mirror_u: bool = 2, 1;
        mirror_v: bool = 3, 1;
        ignore_alpha: bool = 4, 1;
        blend: u8 = 5, 5;
        alpha_blend: u8 = 10, 5;
        border: bool = 15, 1;
        clamp_to_edge: bool = 16, 1;
        filter: u8 = 17, 3;
        mip_map: u8 = 20, 2;
        mip_map_bias: u8 = 22, 8;
        anisotropic_filters: u8 = 30, 2;
    }
}

flags32! {
    pub struct TextureDataFlags {
        texture_type: u8 = 0, 4;
        uv_index: u8 = 4, 4;
        uv_translation_type: u8 = 8, 3;
        reserved: u32 = 11, 21;
    }
}

flags32! {
    pub struct MaterialBlendFlags {
        alpha_texture: bool = 0, 1;
        alpha_material: bool = 1, 1;
        punch_through: bool = 2, 1;
        double_sided: bool = 3, 1;
        normal_direction_light: bool = 4, 1;
        src_blend_factor: u8 = 5, 4;
        dst_blend_factor: u8 = 9, 4;
        blend_operation: u8 = 13, 3;
        z_bias: u8 = 16, 4;
        no_fog: bool = 20, 1;
        unknown0: u8 = 21, 7;
        force_opaque: bool = 28, 1;
        reserved: u8 = 29, 3;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum MaterialTextureType {
    None = 0,
    ColorMap = 1,
    NormalMap = 2,
    SpecularMap = 3,
    HeightMap = 4,
    ReflectionMap = 5,
    TranslucencyMap = 6,
    TransparencyMap = 7,
    EnvironmentMapSphere = 8,
    EnvironmentMapCube = 9,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum UvTranslationType {
    None = 0,
    Uv = 1,
    EnvironmentSphere = 2,
    EnvironmentCube = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum BumpMapType {
    None = 0,
    Dot = 1,
    Env = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum BlendFactor {
    Zero = 0,
    One = 1,
    SrcColor = 2,
    InverseSrcColor = 3,
    SrcAlpha = 4,
    InverseSrcAlpha = 5,
    DstAlpha = 6,
    InverseDstAlpha = 7,
    DstColor = 8,
    InverseDstColor = 9,
}

/// No UV set bound.
pub const UV_INDEX_NONE: u8 = 0xF;

impl TextureDataFlags {
    pub fn texture_type(&self) -> Option<MaterialTextureType> {
        MaterialTextureType::from_repr(self.texture_type as u32)
    }

    pub fn uv_translation_type(&self) -> Option<UvTranslationType> {
        UvTranslationType::from_repr(self.uv_translation_type as u32)
    }
}

impl MaterialShaderFlags {
    pub fn bump_map_type(&self) -> Option<BumpMapType> {
        BumpMapType::from_repr(self.bump_map_type as u32)
    }
}

impl MaterialBlendFlags {
    pub fn src_blend_factor(&self) -> Option<BlendFactor> {
        BlendFactor::from_repr(self.src_blend_factor as u32)
    }

    pub fn dst_blend_factor(&self) -> Option<BlendFactor> {
        BlendFactor::from_repr(self.dst_blend_factor as u32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum PrimitiveType {
    Points = 0,
    Lines = 1,
    LineStrip = 2,
    LineLoop = 3,
    Triangles = 4,
    TriangleStrip = 5,
    TriangleFan = 6,
    Quads = 7,
    QuadStrip = 8,
    Polygon = 9,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum IndexFormat {
    U8 = 0,
    U16 = 1,
    U32 = 2,
}

impl IndexFormat {
    pub const fn element_size(self) -> usize {
        match self {
            IndexFormat::U8 => 1,
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

/// Index buffer of exactly one element width. The format is whichever variant is held.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Indices {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl Default for Indices {
    fn default() -> Self { Indices::U8(Vec::new()) }
}

/// Vertex channel slots, as indices into the mesh's pointer table and attribute bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr, Display)]
#[repr(u32)]
pub enum VertexAttribute {
    Position = 0,
    Normal = 1,
    Tangent = 2,
    TextureCoordinate0 = 4,
    TextureCoordinate1 = 5,
    TextureCoordinate2 = 6,
    TextureCoordinate3 = 7,
    Color0 = 8,
    Color1 = 9,
    BoneWeight = 10,
    BoneIndex = 11,
}

impl VertexAttribute {
    #[inline]
    pub const fn flag(self) -> u32 { 1 << self as u32 }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubMesh {
    pub reserved_flags: u32,
    pub bounding_sphere: Sphere,
    /// Index into the owning object's materials.
    pub material_index: u32,
    pub uv_indices: [u8; 8],
    pub bone_indices: Vec<u16>,
    pub bones_per_vertex: u32,
    /// Raw [`PrimitiveType`] value.
    pub primitive: u32,
    pub indices: Indices,
    pub flags: SubMeshFlags,
    pub reserved_data: [u32; 6],
    pub index_offset: u32,
}

impl SubMesh {
    pub fn primitive_type(&self) -> Option<PrimitiveType> { PrimitiveType::from_repr(self.primitive) }

    pub fn index_format(&self) -> IndexFormat {
        match &self.indices {
            Indices::U8(_) => IndexFormat::U8,
            Indices::U16(_) => IndexFormat::U16,
            Indices::U32(_) => IndexFormat::U32,
        }
    }

    pub fn indices_u8(&self) -> Option<&[u8]> {
        match &self.indices {
            Indices::U8(v) => Some(v),
            _ => None,
        }
    }

    pub fn indices_u16(&self) -> Option<&[u16]> {
        match &self.indices {
            Indices::U16(v) => Some(v),
            _ => None,
        }
    }

    pub fn indices_u32(&self) -> Option<&[u32]> {
        match &self.indices {
            Indices::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn index_count(&self) -> usize {
        match &self.indices {
            Indices::U8(v) => v.len(),
            Indices::U16(v) => v.len(),
            Indices::U32(v) => v.len(),
        }
    }

    /// Index data in host byte order.
    pub fn raw_indices(&self) -> &[u8] {
        match &self.indices {
            Indices::U8(v) => v,
            Indices::U16(v) => bytemuck::cast_slice(v),
            Indices::U32(v) => bytemuck::cast_slice(v),
        }
    }

    pub fn raw_indices_byte_size(&self) -> usize {
        self.index_count() * self.index_format().element_size()
    }

    fn record_size(mode: PointerMode) -> usize { 84 + 2 * mode.size() }

    fn read(reader: &mut StreamReader) -> StreamResult<SubMesh> {
        let mut sub_mesh = SubMesh {
            reserved_flags: reader.read_u32(),
            bounding_sphere: reader.read_sphere(),
            material_index: reader.read_u32(),
            uv_indices: reader.read_array(),
            ..Default::default()
        };

        let bone_index_count = reader.read_u32() as usize;
        let bone_indices_offset = reader.read_ptr();
        if bone_index_count > 0 && !bone_indices_offset.is_null() {
            sub_mesh.bone_indices = read_native_at(reader, bone_indices_offset, bone_index_count)?;
        }

        sub_mesh.bones_per_vertex = reader.read_u32();
        sub_mesh.primitive = reader.read_u32();

        let index_format = reader.read_u32();
        let index_count = reader.read_u32() as usize;
        let indices_offset = reader.read_ptr();
        if index_count > 0 && !indices_offset.is_null() {
            match IndexFormat::from_repr(index_format) {
                Some(IndexFormat::U8) => {
                    sub_mesh.indices = Indices::U8(read_native_at(reader, indices_offset, index_count)?)
                }
                Some(IndexFormat::U16) => {
                    sub_mesh.indices =
                        Indices::U16(read_native_at(reader, indices_offset, index_count)?)
                }
                Some(IndexFormat::U32) => {
                    sub_mesh.indices =
                        Indices::U32(read_native_at(reader, indices_offset, index_count)?)
                }
                None => log::warn!("Skipping indices with unknown format {index_format}"),
            }
        }

        sub_mesh.flags = SubMeshFlags::from_bits(reader.read_u32());
        sub_mesh.reserved_data = std::array::from_fn(|_| reader.read_u32());
        sub_mesh.index_offset = reader.read_u32();
        Ok(sub_mesh)
    }
}

fn read_native_at<T: Pod>(
    reader: &mut StreamReader,
    offset: FileAddr,
    count: usize,
) -> StreamResult<Vec<T>> {
    reader.read_at_offset_aware(offset, |reader| reader.read_native_vec(count))
}

/// Reads `count` consecutive records at `offset`, failing when they cannot fit in the stream.
fn read_records<T>(
    reader: &mut StreamReader,
    offset: FileAddr,
    count: u32,
    record_size: usize,
    read: impl Fn(&mut StreamReader) -> StreamResult<T>,
) -> StreamResult<Vec<T>> {
    reader.read_at_offset_aware(offset, |reader| {
        let count = reader.ensure_records(count as usize, record_size)?;
        (0..count).map(|_| read(reader)).collect()
    })
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VertexData {
    pub stride: u32,
    pub vertex_count: u32,
    pub positions: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    pub tangents: Vec<Vec4>,
    pub texture_coordinates: [Vec<Vec2>; 4],
    pub colors: [Vec<Vec4>; 2],
    pub bone_weights: Vec<Vec4>,
    pub bone_indices: Vec<Vec4>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
    pub reserved_flags: u32,
    pub bounding_sphere: Sphere,
    pub sub_meshes: Vec<SubMesh>,
    /// [`VertexAttribute::flag`] bits of the channels present.
    pub attribute_flags: u32,
    pub vertex_data: VertexData,
    pub flags: MeshFlags,
    pub reserved_data: [u32; 7],
    pub name: String,
}

impl Default for Mesh {
    fn default() -> Self {
        Self {
            reserved_flags: 0,
            bounding_sphere: Sphere::default(),
            sub_meshes: Vec::new(),
            attribute_flags: 0,
            vertex_data: VertexData::default(),
            flags: MeshFlags::default(),
            reserved_data: [0; 7],
            name: String::new(),
        }
    }
}

impl Mesh {
    pub const NAME_SIZE: usize = 64;

    pub fn has_attribute(&self, attribute: VertexAttribute) -> bool {
        self.attribute_flags & attribute.flag() != 0
    }

    fn record_size(mode: PointerMode) -> usize { 132 + (VERTEX_ATTRIBUTE_SLOTS + 1) * mode.size() }

    fn read(reader: &mut StreamReader) -> StreamResult<Mesh> {
        let mut mesh =
            Mesh { reserved_flags: reader.read_u32(), bounding_sphere: reader.read_sphere(), ..Default::default() };

        let sub_mesh_count = reader.read_u32();
        let sub_meshes_offset = reader.read_ptr();
        if sub_mesh_count > 0 && !sub_meshes_offset.is_null() {
            let record_size = SubMesh::record_size(reader.pointer_mode());
            mesh.sub_meshes =
                read_records(reader, sub_meshes_offset, sub_mesh_count, record_size, SubMesh::read)?;
        }

        mesh.attribute_flags = reader.read_u32();
        mesh.vertex_data.stride = reader.read_u32();
        mesh.vertex_data.vertex_count = reader.read_u32();

        let offsets: [FileAddr; VERTEX_ATTRIBUTE_SLOTS] = std::array::from_fn(|_| reader.read_ptr());
        let mut channel = ChannelReader { reader, flags: mesh.attribute_flags, offsets: &offsets, count: mesh.vertex_data.vertex_count as usize };
        let data = &mut mesh.vertex_data;
        data.positions = channel.read(VertexAttribute::Position)?;
        data.normals = channel.read(VertexAttribute::Normal)?;
        data.tangents = channel.read(VertexAttribute::Tangent)?;
        data.texture_coordinates = [
            channel.read(VertexAttribute::TextureCoordinate0)?,
            channel.read(VertexAttribute::TextureCoordinate1)?,
            channel.read(VertexAttribute::TextureCoordinate2)?,
            channel.read(VertexAttribute::TextureCoordinate3)?,
        ];
        data.colors = [channel.read(VertexAttribute::Color0)?, channel.read(VertexAttribute::Color1)?];
        data.bone_weights = channel.read(VertexAttribute::BoneWeight)?;
        data.bone_indices = channel.read(VertexAttribute::BoneIndex)?;

        mesh.flags = MeshFlags::from_bits(reader.read_u32());
        mesh.reserved_data = std::array::from_fn(|_| reader.read_u32());
        mesh.name = reader.read_str_sized(Self::NAME_SIZE);
        Ok(mesh)
    }
}

struct ChannelReader<'r, 'a, 'o> {
    reader: &'r mut StreamReader<'a>,
    flags: u32,
    offsets: &'o [FileAddr; VERTEX_ATTRIBUTE_SLOTS],
    count: usize,
}

impl ChannelReader<'_, '_, '_> {
    /// Empty unless both the pointer and the attribute bit are set.
    fn read<T: Pod>(&mut self, attribute: VertexAttribute) -> StreamResult<Vec<T>> {
        let offset = self.offsets[attribute as usize];
        if offset.is_null() || self.flags & attribute.flag() == 0 {
            return Ok(Vec::new());
        }
        let count = self.count;
        self.reader.read_at_offset_aware(offset, |reader| reader.read_native_vec(count))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MaterialTextureData {
    pub sampler_flags: TextureSamplerFlags,
    pub texture_id: TexId,
    pub texture_flags: TextureDataFlags,
    pub ex_shader: String,
    pub weight: f32,
    pub texture_coordinate_matrix: Mat4,
    pub reserved_data: [f32; 8],
}

impl Default for MaterialTextureData {
    fn default() -> Self {
        Self {
            sampler_flags: TextureSamplerFlags::default(),
            texture_id: TexId::default(),
            texture_flags: TextureDataFlags::default(),
            ex_shader: String::new(),
            weight: 0.0,
            texture_coordinate_matrix: Mat4::IDENTITY,
            reserved_data: [0.0; 8],
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MaterialColor {
    pub diffuse: Vec3,
    pub transparency: f32,
    pub ambient: Vec4,
    pub specular: Vec3,
    pub reflectivity: f32,
    pub emission: Vec4,
    pub shininess: f32,
    pub intensity: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Material {
    pub used_textures_count: u32,
    pub used_textures_flags: MaterialUsedTextureFlags,
    pub shader_type: String,
    pub shader_flags: MaterialShaderFlags,
    pub textures: [MaterialTextureData; MATERIAL_TEXTURE_SLOTS],
    pub blend_flags: MaterialBlendFlags,
    pub color: MaterialColor,
    pub reserved_sphere: Sphere,
    pub name: String,
    pub bump_depth: f32,
    pub reserved_data: [f32; 15],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            used_textures_count: 0,
            used_textures_flags: MaterialUsedTextureFlags::default(),
            shader_type: String::new(),
            shader_flags: MaterialShaderFlags::default(),
            textures: Default::default(),
            blend_flags: MaterialBlendFlags::default(),
            color: MaterialColor::default(),
            reserved_sphere: Sphere::default(),
            name: String::new(),
            bump_depth: 0.0,
            reserved_data: [0.0; 15],
        }
    }
}

impl Material {
    pub const SHADER_TYPE_SIZE: usize = 8;
    pub const NAME_SIZE: usize = 64;

    /// Bound texture slots.
    pub fn used_textures(&self) -> &[MaterialTextureData] {
        let count = (self.used_textures_count as usize).min(MATERIAL_TEXTURE_SLOTS);
        &self.textures[..count]
    }

    const RECORD_SIZE: usize = 1200;

    fn read(reader: &mut StreamReader) -> StreamResult<Material> {
        let used_textures_count = reader.read_u32();
        let used_textures_flags = MaterialUsedTextureFlags::from_bits(reader.read_u32());
        let shader_type = reader.read_str_sized(Self::SHADER_TYPE_SIZE);
        let shader_flags = MaterialShaderFlags::from_bits(reader.read_u32());
        let mut textures: [MaterialTextureData; MATERIAL_TEXTURE_SLOTS] = Default::default();
        for texture in &mut textures {
            *texture = MaterialTextureData {
                sampler_flags: TextureSamplerFlags::from_bits(reader.read_u32()),
                texture_id: TexId(reader.read_u32()),
                texture_flags: TextureDataFlags::from_bits(reader.read_u32()),
                ex_shader: reader.read_str_sized(Self::SHADER_TYPE_SIZE),
                weight: reader.read_f32(),
                texture_coordinate_matrix: reader.read_mat4()?,
                reserved_data: std::array::from_fn(|_| reader.read_f32()),
            };
        }
        let blend_flags = MaterialBlendFlags::from_bits(reader.read_u32());
        let color = MaterialColor {
            diffuse: reader.read_vec3(),
            transparency: reader.read_f32(),
            ambient: reader.read_vec4(),
            specular: reader.read_vec3(),
            reflectivity: reader.read_f32(),
            emission: reader.read_vec4(),
            shininess: reader.read_f32(),
            intensity: reader.read_f32(),
        };
        Ok(Material {
            used_textures_count,
            used_textures_flags,
            shader_type,
            shader_flags,
            textures,
            blend_flags,
            color,
            reserved_sphere: reader.read_sphere(),
            name: reader.read_str_sized(Self::NAME_SIZE),
            bump_depth: reader.read_f32(),
            reserved_data: std::array::from_fn(|_| reader.read_f32()),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bone {
    pub id: BoneId,
    pub transform: Mat4,
    pub name: String,
    pub parent_id: BoneId,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Skeleton {
    pub bones: Vec<Bone>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Obj {
    pub name: String,
    pub id: ObjId,
    pub version: u32,
    pub reserved_flags: u32,
    pub bounding_sphere: Sphere,
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    pub skeleton: Option<Skeleton>,
}

impl Obj {
    /// Reads an object at the cursor. Record counts must fit in the stream.
    pub fn read(&mut self, reader: &mut StreamReader) -> StreamResult {
        reader.push_base_offset();
        let result = self.read_body(reader);
        reader.pop_base_offset();
        result
    }

    fn read_body(&mut self, reader: &mut StreamReader) -> StreamResult {
        self.version = reader.read_u32();
        self.reserved_flags = reader.read_u32();
        self.bounding_sphere = reader.read_sphere();

        let mesh_count = reader.read_u32();
        let meshes_offset = reader.read_ptr();
        if mesh_count > 0 && !meshes_offset.is_null() {
            let record_size = Mesh::record_size(reader.pointer_mode());
            self.meshes = read_records(reader, meshes_offset, mesh_count, record_size, Mesh::read)?;
        }

        let material_count = reader.read_u32();
        let materials_offset = reader.read_ptr();
        if material_count > 0 && !materials_offset.is_null() {
            self.materials = read_records(
                reader,
                materials_offset,
                material_count,
                Material::RECORD_SIZE,
                Material::read,
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ObjSet {
    pub objects: Vec<Obj>,
    pub texture_ids: Vec<TexId>,
}

impl ObjSet {
    pub fn find_obj(&self, id: ObjId) -> Option<&Obj> { self.objects.iter().find(|o| o.id == id) }

    fn read_skeleton(reader: &mut StreamReader) -> StreamResult<Option<Skeleton>> {
        let ids_offset = reader.read_ptr();
        let transforms_offset = reader.read_ptr();
        let names_offset = reader.read_ptr();
        let _expression_blocks_offset = reader.read_ptr();
        let bone_count = reader.read_u32() as usize;
        let parent_ids_offset = reader.read_ptr();

        if bone_count < 1 {
            return Ok(None);
        }
        if bone_count > MAX_BONE_COUNT {
            log::warn!("Skeleton declares {bone_count} bones, more than {MAX_BONE_COUNT}");
        }
        // Every bone owns at least a four byte id.
        if bone_count > reader.length().as_u64() as usize / 4 {
            return Err(StreamError::BadCount);
        }

        let mut bones = vec![Bone::default(); bone_count];
        reader.read_at_offset_aware(ids_offset, |reader| {
            bones.iter_mut().for_each(|bone| bone.id = BoneId(reader.read_u32()))
        });
        reader.read_at_offset_aware(transforms_offset, |reader| {
            bones.iter_mut().try_for_each(|bone| -> StreamResult {
                bone.transform = reader.read_mat4()?;
                Ok(())
            })
        })?;
        reader.read_at_offset_aware(names_offset, |reader| {
            bones.iter_mut().for_each(|bone| bone.name = reader.read_str_ptr_offset_aware())
        });
        // TODO: expression blocks are skipped until their layout is mapped out.
        reader.read_at_offset_aware(parent_ids_offset, |reader| {
            bones.iter_mut().for_each(|bone| bone.parent_id = BoneId(reader.read_u32()))
        });
        Ok(Some(Skeleton { bones }))
    }
}

impl StreamReadable for ObjSet {
    fn read(&mut self, reader: &mut StreamReader) -> StreamResult {
        let result = self.read_tables(reader);
        if result.is_err() {
            self.objects.clear();
            self.texture_ids.clear();
        }
        result
    }
}

impl ObjSet {
    fn read_tables(&mut self, reader: &mut StreamReader) -> StreamResult {
        if reader.read_u32_le() != OBJ_SET_SIGNATURE_LEGACY {
            return Err(StreamError::BadFormat);
        }

        let object_count = reader.read_u32() as usize;
        let _bone_count = reader.read_u32();

        let objects_offset = reader.read_ptr();
        if object_count > 0 {
            if !reader.is_valid_pointer(objects_offset, true) {
                return Err(StreamError::BadPointer);
            }
            let table_size = (object_count * reader.pointer_mode().size()) as i64;
            if (objects_offset + reader.base_offset() + table_size) > reader.length() {
                return Err(StreamError::BadCount);
            }
            self.objects = vec![Obj::default(); object_count];
            let objects = &mut self.objects;
            reader.read_at_offset_aware(objects_offset, |reader| {
                objects.iter_mut().try_for_each(|obj| {
                    let offset = reader.read_ptr();
                    reader.read_at_offset_aware(offset, |reader| obj.read(reader))
                })
            })?;
        }

        let skeletons_offset = reader.read_ptr();
        if object_count > 0 {
            if !reader.is_valid_pointer(skeletons_offset, true) {
                return Err(StreamError::BadPointer);
            }
            let objects = &mut self.objects;
            reader.read_at_offset_aware(skeletons_offset, |reader| {
                objects.iter_mut().try_for_each(|obj| -> StreamResult {
                    let offset = reader.read_ptr();
                    if !offset.is_null() {
                        obj.skeleton = reader.read_at_offset_aware(offset, Self::read_skeleton)?;
                    }
                    Ok(())
                })
            })?;
        }

        let names_offset = reader.read_ptr();
        if object_count > 0 {
            if !reader.is_valid_pointer(names_offset, true) {
                return Err(StreamError::BadPointer);
            }
            let objects = &mut self.objects;
            reader.read_at_offset_aware(names_offset, |reader| {
                objects.iter_mut().for_each(|obj| obj.name = reader.read_str_ptr_offset_aware())
            });
        }

        let ids_offset = reader.read_ptr();
        if object_count > 0 {
            if !reader.is_valid_pointer(ids_offset, true) {
                return Err(StreamError::BadPointer);
            }
            let objects = &mut self.objects;
            reader.read_at_offset_aware(ids_offset, |reader| {
                objects.iter_mut().for_each(|obj| obj.id = ObjId(reader.read_u32()))
            });
        }

        let texture_ids_offset = reader.read_ptr();
        let texture_count = reader.read_u32() as usize;
        if texture_count > 0 {
            if !reader.is_valid_pointer(texture_ids_offset, true) {
                return Err(StreamError::BadPointer);
            }
            if texture_ids_offset + reader.base_offset() + (texture_count as i64 * 4)
                > reader.length()
            {
                return Err(StreamError::BadCount);
            }
            self.texture_ids = reader.read_at_offset_aware(texture_ids_offset, |reader| {
                (0..texture_count).map(|_| TexId(reader.read_u32())).collect()
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{Endianness, MemoryStream};

    /// Little-endian byte builder with back-patching.
    #[derive(Default)]
    struct Builder(Vec<u8>);

    impl Builder {
        fn pos(&self) -> u32 { self.0.len() as u32 }

        fn u32(&mut self, value: u32) -> &mut Self {
            self.0.extend_from_slice(&value.to_le_bytes());
            self
        }

        fn f32(&mut self, value: f32) -> &mut Self {
            self.0.extend_from_slice(&value.to_le_bytes());
            self
        }

        fn bytes(&mut self, value: &[u8]) -> &mut Self {
            self.0.extend_from_slice(value);
            self
        }

        fn fixed_str(&mut self, value: &str, size: usize) -> &mut Self {
            let mut buf = vec![0u8; size];
            buf[..value.len()].copy_from_slice(value.as_bytes());
            self.bytes(&buf)
        }

        fn zeros(&mut self, count: usize) -> &mut Self {
            self.0.resize(self.0.len() + count, 0);
            self
        }

        fn slot(&mut self) -> usize {
            let at = self.0.len();
            self.u32(0);
            at
        }

        fn patch(&mut self, at: usize, value: u32) {
            self.0[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn sphere(&mut self, r: f32) -> &mut Self { self.f32(0.0).f32(1.0).f32(2.0).f32(r) }
    }

    fn write_material(b: &mut Builder) {
        let shader_flags = MaterialShaderFlags { phong: true, bump_map_type: 1, ..Default::default() };
        b.u32(1).u32(MaterialUsedTextureFlags { color: true, ..Default::default() }.to_bits());
        b.fixed_str("BLINN", 8).u32(shader_flags.to_bits());
        for slot in 0..MATERIAL_TEXTURE_SLOTS {
            let texture_flags = TextureDataFlags { texture_type: 1, uv_index: 0, ..Default::default() };
            b.u32(TextureSamplerFlags { repeat_u: true, ..Default::default() }.to_bits());
            b.u32(100 + slot as u32).u32(texture_flags.to_bits());
            b.fixed_str("", 8).f32(1.0);
            b.bytes(bytemuck::bytes_of(&Mat4::IDENTITY));
            b.zeros(8 * 4);
        }
        b.u32(MaterialBlendFlags { double_sided: true, src_blend_factor: 4, ..Default::default() }.to_bits());
        b.f32(1.0).f32(0.5).f32(0.25).f32(1.0); // diffuse, transparency
        b.zeros(16).zeros(12).f32(0.0).zeros(16).f32(50.0).f32(1.0);
        b.sphere(0.0).fixed_str("mat_body", 64).f32(0.5).zeros(15 * 4);
    }

    /// One object with one mesh (positions + uv0, three u16 indices), one material and a
    /// one-bone skeleton.
    fn build_obj_set() -> Vec<u8> {
        let mut b = Builder::default();
        b.u32(OBJ_SET_SIGNATURE_LEGACY).u32(1).u32(0);
        let objects_slot = b.slot();
        let skeletons_slot = b.slot();
        let names_slot = b.slot();
        let ids_slot = b.slot();
        let texture_ids_slot = b.slot();
        b.u32(2);

        let objects_table = b.pos();
        b.patch(objects_slot, objects_table);
        let obj_slot = b.slot();

        let obj = b.pos();
        b.patch(obj_slot, obj);
        b.u32(0x10000).u32(0).sphere(5.0).u32(1);
        let meshes_slot = b.slot();
        b.u32(1);
        let materials_slot = b.slot();

        let mesh = b.pos();
        b.patch(meshes_slot, mesh - obj);
        b.u32(0).sphere(4.0).u32(1);
        let sub_meshes_slot = b.slot();
        let flags = VertexAttribute::Position.flag() | VertexAttribute::TextureCoordinate0.flag();
        b.u32(flags).u32(20).u32(3);
        let attribute_slots: Vec<usize> = (0..VERTEX_ATTRIBUTE_SLOTS).map(|_| b.slot()).collect();
        b.u32(MeshFlags { face_camera_view: true, ..Default::default() }.to_bits());
        b.zeros(7 * 4).fixed_str("mesh_body", 64);

        let sub_mesh = b.pos();
        b.patch(sub_meshes_slot, sub_mesh - obj);
        b.u32(0).sphere(3.0).u32(0).bytes(&[0, 1, 2, 3, 4, 5, 6, 7]);
        b.u32(0).u32(0).u32(4).u32(PrimitiveType::Triangles as u32);
        b.u32(IndexFormat::U16 as u32).u32(3);
        let indices_slot = b.slot();
        b.u32(SubMeshFlags { casts_shadows: true, ..Default::default() }.to_bits());
        b.zeros(6 * 4).u32(0);

        let positions = b.pos();
        b.patch(attribute_slots[0], positions - obj);
        for i in 0..9 {
            b.f32(i as f32);
        }
        // Tangent pointer without its attribute bit must be ignored.
        b.patch(attribute_slots[2], positions - obj);
        let uvs = b.pos();
        b.patch(attribute_slots[4], uvs - obj);
        for i in 0..6 {
            b.f32(i as f32 * 0.5);
        }
        let indices = b.pos();
        b.patch(indices_slot, indices - obj);
        b.bytes(bytemuck::cast_slice(&[0u16, 2, 1])).zeros(2);

        let material = b.pos();
        b.patch(materials_slot, material - obj);
        write_material(&mut b);

        let skeletons = b.pos();
        b.patch(skeletons_slot, skeletons);
        let skeleton_slot = b.slot();
        let skeleton = b.pos();
        b.patch(skeleton_slot, skeleton);
        let bone_ids_slot = b.slot();
        let transforms_slot = b.slot();
        let bone_names_slot = b.slot();
        b.u32(0).u32(1);
        let parents_slot = b.slot();
        let bone_ids = b.pos();
        b.patch(bone_ids_slot, bone_ids);
        b.u32(7);
        let transforms = b.pos();
        b.patch(transforms_slot, transforms);
        b.bytes(bytemuck::bytes_of(&Mat4::IDENTITY));
        let bone_names = b.pos();
        b.patch(bone_names_slot, bone_names);
        let bone_name_slot = b.slot();
        let parents = b.pos();
        b.patch(parents_slot, parents);
        b.u32(0xFFFF_FFFF);

        let names = b.pos();
        b.patch(names_slot, names);
        let name_slot = b.slot();
        let ids = b.pos();
        b.patch(ids_slot, ids);
        b.u32(42);
        let texture_ids = b.pos();
        b.patch(texture_ids_slot, texture_ids);
        b.u32(0x100).u32(0x200);

        let name = b.pos();
        b.patch(name_slot, name);
        b.bytes(b"obj_body\0");
        let bone_name = b.pos();
        b.patch(bone_name_slot, bone_name);
        b.bytes(b"kl_mune_b_wj\0");
        b.0
    }

    fn read(bytes: &[u8]) -> (ObjSet, StreamResult) {
        let mut stream = MemoryStream::from_slice(bytes);
        let mut reader = StreamReader::new(&mut stream);
        let mut set = ObjSet::default();
        let result = set.read(&mut reader);
        (set, result)
    }

    #[test]
    fn reads_object_set() {
        let (set, result) = read(&build_obj_set());
        assert_eq!(result, Ok(()));
        assert_eq!(set.texture_ids, vec![TexId(0x100), TexId(0x200)]);
        assert_eq!(set.objects.len(), 1);

        let obj = &set.objects[0];
        assert_eq!(obj.name, "obj_body");
        assert_eq!(obj.id, ObjId(42));
        assert_eq!(obj.version, 0x10000);
        assert_eq!(obj.bounding_sphere.radius, 5.0);
        assert_eq!(set.find_obj(ObjId(42)).map(|o| o.name.as_str()), Some("obj_body"));

        let mesh = &obj.meshes[0];
        assert_eq!(mesh.name, "mesh_body");
        assert!(mesh.flags.face_camera_view);
        assert!(mesh.has_attribute(VertexAttribute::Position));
        assert!(!mesh.has_attribute(VertexAttribute::Tangent));
        assert_eq!(mesh.vertex_data.vertex_count, 3);
        assert_eq!(mesh.vertex_data.positions[2], Vec3 { x: 6.0, y: 7.0, z: 8.0 });
        assert!(mesh.vertex_data.tangents.is_empty());
        assert!(mesh.vertex_data.normals.is_empty());
        assert_eq!(mesh.vertex_data.texture_coordinates[0][1], Vec2 { x: 1.0, y: 1.5 });

        let sub_mesh = &mesh.sub_meshes[0];
        assert_eq!(sub_mesh.primitive_type(), Some(PrimitiveType::Triangles));
        assert_eq!(sub_mesh.indices_u16(), Some(&[0u16, 2, 1][..]));
        assert_eq!(sub_mesh.uv_indices[7], 7);
        assert_eq!(sub_mesh.bones_per_vertex, 4);
        assert!(sub_mesh.flags.casts_shadows);
        assert!(!sub_mesh.flags.receives_shadows);

        let material = &obj.materials[0];
        assert_eq!(material.name, "mat_body");
        assert_eq!(material.shader_type, "BLINN");
        assert!(material.shader_flags.phong);
        assert_eq!(material.shader_flags.bump_map_type(), Some(BumpMapType::Dot));
        assert!(material.used_textures_flags.color);
        assert_eq!(material.used_textures().len(), 1);
        assert_eq!(material.textures[3].texture_id, TexId(103));
        assert_eq!(material.textures[0].texture_flags.texture_type(), Some(MaterialTextureType::ColorMap));
        assert_eq!(material.textures[0].texture_coordinate_matrix, Mat4::IDENTITY);
        assert!(material.blend_flags.double_sided);
        assert_eq!(material.blend_flags.src_blend_factor(), Some(BlendFactor::SrcAlpha));
        assert_eq!(material.color.diffuse, Vec3 { x: 1.0, y: 0.5, z: 0.25 });
        assert_eq!(material.color.shininess, 50.0);
        assert_eq!(material.bump_depth, 0.5);

        let skeleton = obj.skeleton.as_ref().unwrap();
        assert_eq!(skeleton.bones.len(), 1);
        assert_eq!(skeleton.bones[0].id, BoneId(7));
        assert_eq!(skeleton.bones[0].name, "kl_mune_b_wj");
        assert_eq!(skeleton.bones[0].parent_id, BoneId(0xFFFF_FFFF));
        assert_eq!(skeleton.bones[0].transform, Mat4::IDENTITY);
    }

    #[test]
    fn material_record_is_1200_bytes() {
        let mut b = Builder::default();
        write_material(&mut b);
        assert_eq!(b.0.len(), 1200);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = build_obj_set();
        bytes[0] = 0x01;
        let (set, result) = read(&bytes);
        assert_eq!(result, Err(StreamError::BadFormat));
        assert!(set.objects.is_empty());
    }

    #[test]
    fn rejects_out_of_range_object_table() {
        let mut bytes = build_obj_set();
        let past_end = bytes.len() as u32 + 4;
        bytes[12..16].copy_from_slice(&past_end.to_le_bytes());
        assert_eq!(read(&bytes).1, Err(StreamError::BadPointer));

        let mut bytes = build_obj_set();
        bytes[12..16].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(read(&bytes).1, Err(StreamError::BadPointer));
    }

    #[test]
    fn rejects_counts_past_the_end() {
        // Header is 36 bytes and the object table holds one pointer, so the object starts at 40.
        for (at, count) in [(64, u32::MAX), (64, 0x10000), (72, 0x10000)] {
            let mut bytes = build_obj_set();
            bytes[at..at + 4].copy_from_slice(&u32::to_le_bytes(count));
            let (set, result) = read(&bytes);
            assert_eq!(result, Err(StreamError::BadCount), "count {count:#X} at {at}");
            assert!(set.objects.is_empty());
        }
    }

    #[test]
    fn materials_need_host_byte_order() {
        let mut b = Builder::default();
        write_material(&mut b);
        let mut stream = MemoryStream::from_slice(&b.0);
        let mut reader = StreamReader::new(&mut stream);
        assert_eq!(Material::read(&mut reader).map(|m| m.name), Ok("mat_body".to_string()));

        reader.seek(FileAddr::NULL);
        let foreign = if Endianness::HOST.is_big() { Endianness::Little } else { Endianness::Big };
        reader.set_endianness(foreign);
        assert_eq!(Material::read(&mut reader), Err(StreamError::BadFormat));
    }

    #[test]
    fn empty_set_is_valid() {
        let mut b = Builder::default();
        b.u32(OBJ_SET_SIGNATURE_LEGACY).zeros(4 * 7);
        let (set, result) = read(&b.0);
        assert_eq!(result, Ok(()));
        assert!(set.objects.is_empty());
        assert!(set.texture_ids.is_empty());
    }

    #[test]
    fn index_variants_agree() {
        let cases = [
            (Indices::U8(vec![0, 1, 2, 3]), IndexFormat::U8),
            (Indices::U16(vec![0, 1, 2, 3]), IndexFormat::U16),
            (Indices::U32(vec![0, 1, 2, 3]), IndexFormat::U32),
        ];
        for (indices, format) in cases {
            let sub_mesh = SubMesh { indices, ..Default::default() };
            assert_eq!(sub_mesh.index_format(), format);
            assert_eq!(sub_mesh.index_count(), 4);
            assert_eq!(sub_mesh.raw_indices_byte_size(), 4 * format.element_size());
            assert_eq!(sub_mesh.raw_indices().len(), sub_mesh.raw_indices_byte_size());
            let present = [
                sub_mesh.indices_u8().is_some(),
                sub_mesh.indices_u16().is_some(),
                sub_mesh.indices_u32().is_some(),
            ];
            assert_eq!(present.iter().filter(|&&p| p).count(), 1);
            assert!(present[format as usize]);
        }
        assert_eq!(SubMesh::default().index_format(), IndexFormat::U8);
        assert_eq!(SubMesh::default().index_count(), 0);
    }

    #[test]
    fn flags_round_trip_every_bit() {
        for value in [0u32, u32::MAX, 0xDEAD_BEEF, 0x1234_5678, 0x8000_0001] {
            assert_eq!(SubMeshFlags::from_bits(value).to_bits(), value);
            assert_eq!(MeshFlags::from_bits(value).to_bits(), value);
            assert_eq!(MaterialUsedTextureFlags::from_bits(value).to_bits(), value);
            assert_eq!(MaterialShaderFlags::from_bits(value).to_bits(), value);
            assert_eq!(TextureSamplerFlags::from_bits(value).to_bits(), value);
            assert_eq!(TextureDataFlags::from_bits(value).to_bits(), value);
            assert_eq!(MaterialBlendFlags::from_bits(value).to_bits(), value);
        }
    }

    #[test]
    fn flags_bit_positions() {
        assert!(SubMeshFlags::from_bits(1 << 2).transparent);
        assert!(MeshFlags::from_bits(1 << 1).face_camera_position);
        assert!(MaterialUsedTextureFlags::from_bits(1 << 15).override_ibl_cube_map);

        let shader = MaterialShaderFlags::from_bits(0b11 << 8 | 0xF << 10 | 1 << 20 | 0b101 << 21);
        assert_eq!(shader.bump_map_type, 3);
        assert_eq!(shader.fresnel, 0xF);
        assert_eq!(shader.specular_quality, 1);
        assert_eq!(shader.aniso_direction, 0b101);
        assert_eq!(shader.line_light, 0);

        let sampler = TextureSamplerFlags::from_bits(0x7F << 22 | 0b10 << 30 | 1 << 16);
        assert_eq!(sampler.mip_map_bias, 0x7F);
        assert_eq!(sampler.anisotropic_filters, 0b10);
        assert!(sampler.clamp_to_edge);
        assert!(!sampler.border);

        let data = TextureDataFlags::from_bits(0x2 | (UV_INDEX_NONE as u32) << 4 | 0b11 << 8);
        assert_eq!(data.texture_type(), Some(MaterialTextureType::NormalMap));
        assert_eq!(data.uv_index, UV_INDEX_NONE);
        assert_eq!(data.uv_translation_type(), Some(UvTranslationType::EnvironmentCube));

        let blend = MaterialBlendFlags { dst_blend_factor: 5, z_bias: 3, force_opaque: true, ..Default::default() };
        assert_eq!(blend.to_bits(), 5 << 9 | 3 << 16 | 1 << 28);
    }
}
