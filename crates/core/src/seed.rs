//! Seed disk: a tar stream at offset zero of the machine disk that the
//! guest formats on first boot, carrying the SSH public key.

use crate::error::Result;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tar::{EntryType, Header};

/// First tar member. The guest formats the disk when it finds this name.
pub const FORMAT_MAGIC: &str = "boot2docker, please format-me";

pub const MIB: u64 = 1024 * 1024;

fn header(path: &str, entry_type: EntryType, mode: u32, size: u64) -> Result<Header> {
    let mut header = Header::new_gnu();
    header.set_path(path)?;
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_cksum();
    Ok(header)
}

/// Builds the seed tar in memory.
pub fn build_seed_tar(public_key: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let magic = FORMAT_MAGIC.as_bytes();
    let mut h = header(FORMAT_MAGIC, EntryType::Regular, 0o644, magic.len() as u64)?;
    builder.append(&h, magic)?;

    h = header(".ssh", EntryType::Directory, 0o700, 0)?;
    builder.append(&h, std::io::empty())?;

    for name in [".ssh/authorized_keys", ".ssh/authorized_keys2"] {
        h = header(name, EntryType::Regular, 0o644, public_key.len() as u64)?;
        builder.append(&h, public_key)?;
    }

    Ok(builder.into_inner()?)
}

/// Writes a fresh raw disk holding the seed tar, sized to `size_mb` MiB.
pub fn write_seed_disk(path: &Path, public_key: &[u8], size_mb: u64) -> Result<()> {
    let tar = build_seed_tar(public_key)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&tar)?;
    file.set_len((size_mb * MIB).max(tar.len() as u64))?;
    file.sync_all()?;
    tracing::debug!(path = %path.display(), size_mb, "wrote seed disk");
    Ok(())
}

/// Overwrites the start of an existing disk file with the seed tar,
/// leaving its length alone. Used for images whose container format
/// keeps raw data at offset zero.
pub fn write_seed_in_place(path: &Path, public_key: &[u8]) -> Result<()> {
    let tar = build_seed_tar(public_key)?;
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&tar)?;
    file.sync_all()?;
    Ok(())
}
