use std::path::PathBuf;

use anyhow::{bail, Result};
use argh::FromArgs;
use comfylib::format::farc::FArc;

use super::{output_path, write_file};

#[derive(FromArgs, PartialEq, Debug)]
/// process FArc archives
#[argh(subcommand, name = "farc")]
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
/// lists the entries of a FArc
#[argh(subcommand, name = "list")]
pub struct ListArgs {
    #[argh(positional)]
    /// input FArc
    input: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// extracts the entries of a FArc
#[argh(subcommand, name = "extract")]
pub struct ExtractArgs {
    #[argh(positional)]
    /// input FArc
    input: PathBuf,
    #[argh(positional)]
    /// output directory
    output: PathBuf,
    #[argh(positional)]
    /// entries to extract (all if none given)
    names: Vec<String>,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::List(c_args) => list(c_args),
        SubCommand::Extract(c_args) => extract(c_args),
    }
}

fn list(args: ListArgs) -> Result<()> {
    let farc = FArc::open(&args.input)?;
    let header = farc.header();
    log::info!(
        "{} alignment {:#X}, {} encryption{}",
        header.signature,
        header.alignment,
        header.encryption,
        if header.flags.compressed() { ", compressed" } else { "" }
    );
    for entry in farc.entries() {
        println!(
            "{}\t{:#X}\t{:#X}\t{:#X}",
            entry.name, entry.offset, entry.compressed_size, entry.original_size
        );
    }
    Ok(())
}

fn extract(args: ExtractArgs) -> Result<()> {
    let farc = FArc::open(&args.input)?;
    let entries = if args.names.is_empty() {
        farc.entries().iter().collect::<Vec<_>>()
    } else {
        let mut entries = Vec::with_capacity(args.names.len());
        for name in &args.names {
            let Some(entry) = farc.find_file(name) else {
                bail!("No entry named '{name}' in '{}'", args.input.display());
            };
            entries.push(entry);
        }
        entries
    };
    for entry in entries {
        let data = farc.read_file(entry)?;
        log::info!("Extracting {} ({:#X} bytes)", entry.name, data.len());
        write_file(&output_path(&args.output, &entry.name)?, &data)?;
    }
    Ok(())
}
