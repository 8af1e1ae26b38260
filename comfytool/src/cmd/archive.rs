use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use comfylib::format::archive::ComfyArchive;
use serde::Serialize;

use super::{output_path, write_file};

#[derive(FromArgs, PartialEq, Debug)]
/// process Comfy archives
#[argh(subcommand, name = "archive")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    List(ListArgs),
    Extract(ExtractArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// lists the files of an archive
#[argh(subcommand, name = "list")]
pub struct ListArgs {
    #[argh(positional)]
    /// input archive
    input: PathBuf,
    #[argh(switch)]
    /// print as JSON
    json: bool,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// extracts the files of an archive
#[argh(subcommand, name = "extract")]
pub struct ExtractArgs {
    #[argh(positional)]
    /// input archive
    input: PathBuf,
    #[argh(positional)]
    /// output directory
    output: PathBuf,
    #[argh(option, short = 'f')]
    /// only extract files below this directory
    filter: Option<String>,
}

#[derive(Serialize)]
struct ListedFile<'a> {
    path: &'a str,
    size: u64,
    offset: u64,
    compressed: bool,
    encrypted: bool,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::List(c_args) => list(c_args),
        SubCommand::Extract(c_args) => extract(c_args),
    }
}

fn mount(input: &Path) -> Result<ComfyArchive> {
    let mut archive = ComfyArchive::new();
    if !archive.mount(input) {
        bail!("Failed to mount '{}'", input.display());
    }
    Ok(archive)
}

fn list(args: ListArgs) -> Result<()> {
    let archive = mount(&args.input)?;
    let files = archive.files();
    if args.json {
        let listed = files
            .iter()
            .map(|(path, entry)| ListedFile {
                path,
                size: entry.size,
                offset: entry.offset,
                compressed: entry.flags.compressed,
                encrypted: entry.flags.encrypted,
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&listed)?);
        return Ok(());
    }

    if let Some(header) = archive.header() {
        log::info!(
            "Version {}.{}, {} bytes of metadata at {:#X}",
            header.version.major,
            header.version.minor,
            header.data_size,
            header.data_offset
        );
    }
    for (path, entry) in &files {
        println!("{path}\t{:#X}\t{:#X}", entry.size, entry.offset);
    }
    log::info!("{} files", files.len());
    Ok(())
}

fn extract(args: ExtractArgs) -> Result<()> {
    let archive = mount(&args.input)?;
    let prefix = args.filter.as_deref().map(|f| f.trim_matches('/')).unwrap_or_default();
    let mut count = 0usize;
    for (path, entry) in archive.files() {
        if !prefix.is_empty() && !path.starts_with(prefix) {
            continue;
        }
        let data = archive
            .read_file(entry)
            .with_context(|| format!("Failed to read '{path}'"))?;
        let out = output_path(&args.output, &path)?;
        log::info!("Extracting {} ({:#X} bytes)", path, data.len());
        write_file(&out, &data)?;
        count += 1;
    }
    log::info!("Extracted {count} files to {}", args.output.display());
    Ok(())
}
