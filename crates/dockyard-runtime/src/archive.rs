//! Single-file tar envelope used to move files in and out of containers.

use crate::RuntimeError;
use std::io::{self, Read, Write};

/// Wrap `content` in a tar stream holding one regular file named `name`.
pub fn pack_single_file(name: &str, content: &mut dyn Read) -> Result<Vec<u8>, RuntimeError> {
    let mut data = Vec::new();
    content.read_to_end(&mut data)?;

    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, data.as_slice())?;
    Ok(builder.into_inner()?)
}

/// Copy the first regular file of a tar stream into `out`.
pub fn unpack_single_file(archive: &[u8], out: &mut dyn Write) -> Result<u64, RuntimeError> {
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            return Ok(io::copy(&mut entry, out)?);
        }
    }
    Err(RuntimeError::Transport(
        "archive contains no regular file".to_owned(),
    ))
}
