pub mod compression;
pub mod crypto;
pub mod file;
