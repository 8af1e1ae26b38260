use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, DirBuilder},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use argh::FromArgs;
use comfylib::format::{
    objset::{
        Indices, Material, MaterialTextureData, MaterialTextureType, Mesh, Obj, ObjSet,
        PrimitiveType, TexId, UV_INDEX_NONE,
    },
    texset::TexSet,
    Vec3,
};
use gltf_json::{self as json, buffer::Stride, validation::USize64};
use json::validation::Checked::Valid;
use serde_json::json;

use super::read_file;

#[derive(FromArgs, PartialEq, Debug)]
/// process object sets
#[argh(subcommand, name = "obj")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Info(InfoArgs),
    Convert(ConvertArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// prints the contents of an object set
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input object set
    input: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// converts every object of an object set to glTF
#[argh(subcommand, name = "convert")]
pub struct ConvertArgs {
    #[argh(positional)]
    /// input object set
    input: PathBuf,
    #[argh(positional)]
    /// output directory
    out_dir: PathBuf,
    #[argh(option, short = 't')]
    /// texture set referenced by the materials
    textures: Option<PathBuf>,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
        SubCommand::Convert(c_args) => convert(c_args),
    }
}

fn info(args: InfoArgs) -> Result<()> {
    let obj_set: ObjSet = read_file(&args.input)?;
    log::info!(
        "{} objects, {} texture ids",
        obj_set.objects.len(),
        obj_set.texture_ids.len()
    );
    for obj in &obj_set.objects {
        log::info!(
            "Object {} (id {}): {} meshes, {} materials, {} bones",
            obj.name,
            obj.id.0,
            obj.meshes.len(),
            obj.materials.len(),
            obj.skeleton.as_ref().map(|s| s.bones.len()).unwrap_or_default()
        );
        for mesh in &obj.meshes {
            log::info!(
                "  Mesh {}: {} vertices, attributes {:#X}",
                mesh.name,
                mesh.vertex_data.vertex_count,
                mesh.attribute_flags
            );
            for sub_mesh in &mesh.sub_meshes {
                log::info!(
                    "    {} indices ({}), material {}",
                    sub_mesh.index_count(),
                    sub_mesh.primitive_type().map(|p| p.to_string()).unwrap_or_default(),
                    sub_mesh.material_index
                );
            }
        }
        for material in &obj.materials {
            log::info!("  Material {} ({})", material.name, material.shader_type);
        }
    }
    Ok(())
}

fn convert(args: ConvertArgs) -> Result<()> {
    let obj_set: ObjSet = read_file(&args.input)?;
    let tex_set = match &args.textures {
        Some(path) => {
            let mut tex_set: TexSet = read_file(path)?;
            tex_set.set_texture_ids(&obj_set);
            Some(tex_set)
        }
        None => None,
    };
    DirBuilder::new().recursive(true).create(&args.out_dir)?;
    for obj in &obj_set.objects {
        log::info!("Converting {}", obj.name);
        ObjExporter::new(tex_set.as_ref(), &args.out_dir).export(obj)?;
    }
    Ok(())
}

fn file_stem(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' }).collect()
}

/// Converts a strip with restart markers into a triangle list, dropping degenerate triangles.
fn strip_to_triangles(strip: &[u32], restart: u32) -> Vec<u32> {
    let mut out = Vec::with_capacity(strip.len().saturating_sub(2) * 3);
    for run in strip.split(|&i| i == restart) {
        for (n, tri) in run.windows(3).enumerate() {
            let [a, b, c] = if n % 2 == 0 { [tri[0], tri[1], tri[2]] } else { [tri[1], tri[0], tri[2]] };
            if a == b || b == c || a == c {
                continue;
            }
            out.extend([a, b, c]);
        }
    }
    out
}

fn bounds(positions: &[Vec3]) -> Option<(json::Value, json::Value)> {
    let first = positions.first()?;
    let (mut min, mut max) = ([first.x, first.y, first.z], [first.x, first.y, first.z]);
    for p in positions {
        for (i, v) in [p.x, p.y, p.z].into_iter().enumerate() {
            min[i] = min[i].min(v);
            max[i] = max[i].max(v);
        }
    }
    Some((json!(min), json!(max)))
}

fn wrapping_mode(repeat: bool, mirror: bool) -> json::texture::WrappingMode {
    match (repeat, mirror) {
        (_, true) => json::texture::WrappingMode::MirroredRepeat,
        (true, false) => json::texture::WrappingMode::Repeat,
        (false, false) => json::texture::WrappingMode::ClampToEdge,
    }
}

struct ObjExporter<'a> {
    tex_set: Option<&'a TexSet>,
    out_dir: &'a Path,
    buffer: Vec<u8>,
    buffer_views: Vec<json::buffer::View>,
    accessors: Vec<json::Accessor>,
    samplers: Vec<json::texture::Sampler>,
    textures: Vec<json::Texture>,
    images: Vec<json::Image>,
    texture_map: HashMap<(TexId, u32), u32>,
}

impl<'a> ObjExporter<'a> {
    fn new(tex_set: Option<&'a TexSet>, out_dir: &'a Path) -> Self {
        Self {
            tex_set,
            out_dir,
            buffer: Vec::new(),
            buffer_views: Vec::new(),
            accessors: Vec::new(),
            samplers: Vec::new(),
            textures: Vec::new(),
            images: Vec::new(),
            texture_map: HashMap::new(),
        }
    }

    fn export(mut self, obj: &Obj) -> Result<()> {
        let stem = file_stem(&obj.name);
        let mut materials = Vec::with_capacity(obj.materials.len());
        for material in &obj.materials {
            materials.push(self.material(material)?);
        }

        let mut meshes = Vec::with_capacity(obj.meshes.len());
        for mesh in &obj.meshes {
            meshes.push(self.mesh(mesh, materials.len()));
        }

        let nodes = (0..meshes.len())
            .map(|idx| json::Node {
                camera: None,
                children: None,
                extensions: None,
                extras: None,
                matrix: None,
                mesh: Some(json::Index::new(idx as u32)),
                name: obj.meshes[idx].name.clone().into(),
                rotation: None,
                scale: None,
                translation: None,
                skin: None,
                weights: None,
            })
            .collect::<Vec<_>>();
        let scene_nodes = (0..nodes.len()).map(|idx| json::Index::new(idx as u32)).collect();

        let bin_name = format!("{stem}.bin");
        fs::write(self.out_dir.join(&bin_name), &self.buffer)?;
        let root = json::Root {
            accessors: self.accessors,
            animations: vec![],
            asset: Default::default(),
            buffers: vec![json::Buffer {
                byte_length: self.buffer.len().into(),
                extensions: Default::default(),
                extras: Default::default(),
                name: None,
                uri: Some(bin_name),
            }],
            buffer_views: self.buffer_views,
            scene: Some(json::Index::new(0)),
            extensions: None,
            extras: Default::default(),
            extensions_used: vec![],
            extensions_required: vec![],
            cameras: vec![],
            images: self.images,
            materials,
            meshes,
            nodes,
            samplers: self.samplers,
            scenes: vec![json::Scene {
                extensions: Default::default(),
                extras: Default::default(),
                name: Some(obj.name.clone()),
                nodes: scene_nodes,
            }],
            skins: vec![],
            textures: self.textures,
        };
        let path = self.out_dir.join(format!("{stem}.gltf"));
        let writer = fs::File::create(&path)
            .with_context(|| format!("Failed to create '{}'", path.display()))?;
        json::serialize::to_writer_pretty(writer, &root)?;
        Ok(())
    }

    fn push_view(
        &mut self,
        data: &[u8],
        stride: Option<usize>,
        target: json::buffer::Target,
    ) -> json::Index<json::buffer::View> {
        while self.buffer.len() % 4 != 0 {
            self.buffer.push(0);
        }
        let offset = self.buffer.len();
        self.buffer.extend_from_slice(data);
        self.buffer_views.push(json::buffer::View {
            buffer: json::Index::new(0),
            byte_length: data.len().into(),
            byte_offset: Some(USize64(offset as u64)),
            byte_stride: stride.map(Stride),
            extensions: Default::default(),
            extras: Default::default(),
            name: None,
            target: Some(Valid(target)),
        });
        json::Index::new(self.buffer_views.len() as u32 - 1)
    }

    fn push_accessor(
        &mut self,
        view: json::Index<json::buffer::View>,
        count: usize,
        component_type: json::accessor::ComponentType,
        type_: json::accessor::Type,
        name: String,
    ) -> json::Index<json::Accessor> {
        self.accessors.push(json::Accessor {
            buffer_view: Some(view),
            byte_offset: None,
            count: USize64(count as u64),
            component_type: Valid(json::accessor::GenericComponentType(component_type)),
            extensions: None,
            extras: Default::default(),
            type_: Valid(type_),
            min: None,
            max: None,
            name: Some(name),
            normalized: false,
            sparse: None,
        });
        json::Index::new(self.accessors.len() as u32 - 1)
    }

    fn vertex_attribute<T: bytemuck::Pod>(
        &mut self,
        attributes: &mut BTreeMap<json::validation::Checked<json::mesh::Semantic>, json::Index<json::Accessor>>,
        semantic: json::mesh::Semantic,
        values: &[T],
        type_: json::accessor::Type,
        name: String,
    ) -> Option<json::Index<json::Accessor>> {
        if values.is_empty() {
            return None;
        }
        let view = self.push_view(
            bytemuck::cast_slice(values),
            Some(std::mem::size_of::<T>()),
            json::buffer::Target::ArrayBuffer,
        );
        let accessor =
            self.push_accessor(view, values.len(), json::accessor::ComponentType::F32, type_, name);
        attributes.insert(Valid(semantic), accessor);
        Some(accessor)
    }

    fn mesh(&mut self, mesh: &Mesh, material_count: usize) -> json::Mesh {
        use json::{accessor::Type, mesh::Semantic};

        let data = &mesh.vertex_data;
        let mut attributes = BTreeMap::new();
        if let Some(accessor) = self.vertex_attribute(
            &mut attributes,
            Semantic::Positions,
            &data.positions,
            Type::Vec3,
            format!("{} positions", mesh.name),
        ) {
            if let Some((min, max)) = bounds(&data.positions) {
                let accessor = &mut self.accessors[accessor.value()];
                accessor.min = Some(min);
                accessor.max = Some(max);
            }
        }
        self.vertex_attribute(
            &mut attributes,
            Semantic::Normals,
            &data.normals,
            Type::Vec3,
            format!("{} normals", mesh.name),
        );
        self.vertex_attribute(
            &mut attributes,
            Semantic::Tangents,
            &data.tangents,
            Type::Vec4,
            format!("{} tangents", mesh.name),
        );
        for (set, uvs) in data.texture_coordinates.iter().enumerate() {
            self.vertex_attribute(
                &mut attributes,
                Semantic::TexCoords(set as u32),
                uvs,
                Type::Vec2,
                format!("{} uv{set}", mesh.name),
            );
        }
        for (set, colors) in data.colors.iter().enumerate() {
            self.vertex_attribute(
                &mut attributes,
                Semantic::Colors(set as u32),
                colors,
                Type::Vec4,
                format!("{} color{set}", mesh.name),
            );
        }

        let mut primitives = Vec::with_capacity(mesh.sub_meshes.len());
        for (idx, sub_mesh) in mesh.sub_meshes.iter().enumerate() {
            let (indices, restart): (Vec<u32>, u32) = match &sub_mesh.indices {
                Indices::U8(v) => (v.iter().map(|&i| i as u32).collect(), u8::MAX as u32),
                Indices::U16(v) => (v.iter().map(|&i| i as u32).collect(), u16::MAX as u32),
                Indices::U32(v) => (v.clone(), u32::MAX),
            };
            let (indices, mode) = match sub_mesh.primitive_type() {
                Some(PrimitiveType::Triangles) => (indices, json::mesh::Mode::Triangles),
                Some(PrimitiveType::TriangleStrip) => {
                    (strip_to_triangles(&indices, restart), json::mesh::Mode::Triangles)
                }
                Some(PrimitiveType::TriangleFan) => (indices, json::mesh::Mode::TriangleFan),
                Some(PrimitiveType::Lines) => (indices, json::mesh::Mode::Lines),
                Some(PrimitiveType::LineStrip) => (indices, json::mesh::Mode::LineStrip),
                Some(PrimitiveType::LineLoop) => (indices, json::mesh::Mode::LineLoop),
                Some(PrimitiveType::Points) => (indices, json::mesh::Mode::Points),
                other => {
                    log::warn!("Skipping {} sub mesh {idx} with primitive {other:?}", mesh.name);
                    continue;
                }
            };
            if indices.is_empty() {
                continue;
            }
            let view = self.push_view(
                bytemuck::cast_slice(&indices),
                None,
                json::buffer::Target::ElementArrayBuffer,
            );
            let accessor = self.push_accessor(
                view,
                indices.len(),
                json::accessor::ComponentType::U32,
                Type::Scalar,
                format!("{} sub mesh {idx} indices", mesh.name),
            );
            let material_index = sub_mesh.material_index as usize;
            primitives.push(json::mesh::Primitive {
                attributes: attributes.clone(),
                extensions: None,
                extras: Default::default(),
                indices: Some(accessor),
                material: (material_index < material_count)
                    .then(|| json::Index::new(material_index as u32)),
                mode: Valid(mode),
                targets: None,
            });
        }

        json::Mesh {
            extensions: None,
            extras: Default::default(),
            name: Some(mesh.name.clone()),
            primitives,
            weights: None,
        }
    }

    fn material(&mut self, material: &Material) -> Result<json::Material> {
        let color = &material.color;
        let blend = &material.blend_flags;
        let alpha_mode = if blend.punch_through {
            json::material::AlphaMode::Mask
        } else if blend.alpha_texture || blend.alpha_material {
            json::material::AlphaMode::Blend
        } else {
            json::material::AlphaMode::Opaque
        };
        let mut json_material = json::Material {
            alpha_cutoff: blend.punch_through.then_some(json::material::AlphaCutoff(0.5)),
            alpha_mode: Valid(alpha_mode),
            double_sided: blend.double_sided,
            name: Some(material.name.clone()),
            pbr_metallic_roughness: json::material::PbrMetallicRoughness {
                base_color_factor: json::material::PbrBaseColorFactor([
                    color.diffuse.x,
                    color.diffuse.y,
                    color.diffuse.z,
                    color.transparency,
                ]),
                base_color_texture: None,
                metallic_factor: json::material::StrengthFactor(0.0),
                roughness_factor: json::material::StrengthFactor(1.0 - color.reflectivity.clamp(0.0, 1.0)),
                metallic_roughness_texture: None,
                extensions: None,
                extras: None,
            },
            normal_texture: None,
            occlusion_texture: None,
            emissive_texture: None,
            emissive_factor: json::material::EmissiveFactor([
                color.emission.x,
                color.emission.y,
                color.emission.z,
            ]),
            extensions: None,
            extras: None,
        };

        for texture in material.used_textures() {
            match texture.texture_flags.texture_type() {
                Some(MaterialTextureType::ColorMap)
                    if json_material.pbr_metallic_roughness.base_color_texture.is_none() =>
                {
                    json_material.pbr_metallic_roughness.base_color_texture =
                        self.texture(texture)?;
                }
                Some(MaterialTextureType::NormalMap) if json_material.normal_texture.is_none() => {
                    json_material.normal_texture =
                        self.texture(texture)?.map(|info| json::material::NormalTexture {
                            index: info.index,
                            scale: 1.0,
                            tex_coord: info.tex_coord,
                            extensions: None,
                            extras: None,
                        });
                }
                _ => {}
            }
        }
        Ok(json_material)
    }

    /// Writes the texture as PNG the first time it is referenced.
    fn texture(&mut self, texture: &MaterialTextureData) -> Result<Option<json::texture::Info>> {
        let Some(tex) = self.tex_set.and_then(|set| set.find(texture.texture_id)) else {
            log::debug!("Texture {:08X} not found", texture.texture_id.0);
            return Ok(None);
        };
        let uv_index = texture.texture_flags.uv_index;
        let tex_coord = if uv_index == UV_INDEX_NONE || uv_index > 3 { 0 } else { uv_index as u32 };

        let sampler_bits = texture.sampler_flags.to_bits();
        let key = (texture.texture_id, sampler_bits);
        let texture_idx = if let Some(&existing) = self.texture_map.get(&key) {
            existing
        } else {
            let image_name = format!("{:08X}.png", texture.texture_id.0);
            let image_idx = match self.images.iter().position(|i| i.uri.as_deref() == Some(image_name.as_str())) {
                Some(idx) => idx,
                None => {
                    let Some(mip) = tex.mip_maps(0).first() else {
                        return Ok(None);
                    };
                    let path = self.out_dir.join(&image_name);
                    log::info!("Writing {}", path.display());
                    mip.decode()
                        .with_context(|| format!("Failed to decode texture {}", tex.name()))?
                        .save(&path)
                        .with_context(|| format!("Failed to write '{}'", path.display()))?;
                    self.images.push(json::Image {
                        buffer_view: None,
                        mime_type: None,
                        name: Some(tex.name().to_string()),
                        uri: Some(image_name),
                        extensions: None,
                        extras: None,
                    });
                    self.images.len() - 1
                }
            };
            let flags = texture.sampler_flags;
            self.samplers.push(json::texture::Sampler {
                mag_filter: Some(Valid(json::texture::MagFilter::Linear)),
                min_filter: Some(Valid(json::texture::MinFilter::LinearMipmapLinear)),
                name: None,
                wrap_s: Valid(wrapping_mode(flags.repeat_u, flags.mirror_u)),
                wrap_t: Valid(wrapping_mode(flags.repeat_v, flags.mirror_v)),
                extensions: None,
                extras: None,
            });
            let texture_idx = self.textures.len() as u32;
            self.textures.push(json::Texture {
                name: Some(tex.name().to_string()),
                sampler: Some(json::Index::new(self.samplers.len() as u32 - 1)),
                source: json::Index::new(image_idx as u32),
                extensions: None,
                extras: None,
            });
            self.texture_map.insert(key, texture_idx);
            texture_idx
        };
        Ok(Some(json::texture::Info {
            index: json::Index::new(texture_idx),
            tex_coord,
            extensions: None,
            extras: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_become_lists() {
        assert_eq!(strip_to_triangles(&[0, 1, 2, 3], u16::MAX as u32), [0, 1, 2, 2, 1, 3]);
        // Restart splits runs, degenerate triangles are dropped.
        let strip = [0, 1, 2, 0xFFFF, 3, 3, 4, 5];
        assert_eq!(strip_to_triangles(&strip, 0xFFFF), [0, 1, 2, 4, 3, 5]);
        assert!(strip_to_triangles(&[0, 1], 0xFFFF).is_empty());
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(file_stem("PV001/STG:A"), "PV001_STG_A");
    }

    #[test]
    fn position_bounds() {
        let positions = [Vec3 { x: 1.0, y: -2.0, z: 0.5 }, Vec3 { x: -1.0, y: 3.0, z: 0.0 }];
        let (min, max) = bounds(&positions).unwrap();
        assert_eq!(min, json!([-1.0, -2.0, 0.0]));
        assert_eq!(max, json!([1.0, 3.0, 0.5]));
        assert!(bounds(&[]).is_none());
    }
}
