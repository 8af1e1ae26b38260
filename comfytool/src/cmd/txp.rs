use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use comfylib::format::{objset::ObjSet, texset::TexSet};

use super::read_file;

#[derive(FromArgs, PartialEq, Debug)]
/// process texture sets
#[argh(subcommand, name = "txp")]
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
/// prints the textures of a texture set
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input texture set
    input: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// converts a texture set to PNG files
#[argh(subcommand, name = "convert")]
pub struct ConvertArgs {
    #[argh(positional)]
    /// input texture set
    input: PathBuf,
    #[argh(positional)]
    /// output directory
    out_dir: PathBuf,
    #[argh(option, short = 'o')]
    /// object set providing texture ids for file names
    obj_set: Option<PathBuf>,
    #[argh(switch, short = 'm')]
    /// write every mip level instead of only the largest
    mips: bool,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
        SubCommand::Convert(c_args) => convert(c_args),
    }
}

fn info(args: InfoArgs) -> Result<()> {
    let tex_set: TexSet = read_file(&args.input)?;
    log::info!("{} textures", tex_set.textures.len());
    for (idx, tex) in tex_set.textures.iter().enumerate() {
        let size = tex.size();
        log::info!(
            "  {idx}: {} {} {}x{}, {} layers, {} mips",
            tex.signature(),
            tex.format(),
            size.x,
            size.y,
            tex.mip_maps.len(),
            tex.mip_maps(0).len()
        );
    }
    Ok(())
}

fn convert(args: ConvertArgs) -> Result<()> {
    let mut tex_set: TexSet = read_file(&args.input)?;
    if let Some(path) = &args.obj_set {
        let obj_set: ObjSet = read_file(path)?;
        tex_set.set_texture_ids(&obj_set);
    }
    std::fs::create_dir_all(&args.out_dir)?;

    for (idx, tex) in tex_set.textures.iter().enumerate() {
        let stem = match tex.id {
            Some(id) => format!("{:08X}", id.0),
            None => format!("{idx}"),
        };
        for (layer, mips) in tex.mip_maps.iter().enumerate() {
            let count = if args.mips { mips.len() } else { mips.len().min(1) };
            for (level, mip) in mips.iter().take(count).enumerate() {
                let mut name = stem.clone();
                if tex.mip_maps.len() > 1 {
                    name.push_str(&format!("_{layer}"));
                }
                if args.mips {
                    name.push_str(&format!("_mip{level}"));
                }
                let path = args.out_dir.join(format!("{name}.png"));
                log::info!("Writing {} ({} {}x{})", path.display(), mip.format, mip.size.x, mip.size.y);
                let image = mip.decode().with_context(|| format!("Failed to decode texture {idx}"))?;
                image
                    .save(&path)
                    .with_context(|| format!("Failed to write '{}'", path.display()))?;
            }
        }
    }
    Ok(())
}
