use std::{
    fs::{DirBuilder, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use comfylib::{
    io::{MemoryStream, StreamReadable, StreamReader},
    util::file::map_file,
};

pub mod archive;
pub mod farc;
pub mod obj;
pub mod txp;

/// Parses a whole file as `T`.
pub fn read_file<T: StreamReadable + Default>(path: &Path) -> Result<T> {
    let data = map_file(path)?;
    let mut stream = MemoryStream::from_slice(&data);
    let mut reader = StreamReader::new(&mut stream);
    let mut value = T::default();
    value.read(&mut reader).with_context(|| format!("Failed to read '{}'", path.display()))?;
    Ok(value)
}

/// Writes `data` to `path`, creating parent directories as needed.
pub fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        DirBuilder::new().recursive(true).create(parent)?;
    }
    let mut file = BufWriter::new(
        File::create(path).with_context(|| format!("Failed to create file '{}'", path.display()))?,
    );
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}

/// Joins an archive-relative `name` onto `base`, refusing names that escape it.
pub fn output_path(base: &Path, name: &str) -> Result<PathBuf> {
    let mut path = base.to_path_buf();
    for component in name.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => bail!("Refusing to extract '{name}' outside of '{}'", base.display()),
            component => path.push(component),
        }
    }
    Ok(path)
}
