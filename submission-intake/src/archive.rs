//! Inspection, extraction and creation of zip archives.
//!
//! Everything here is blocking, callers on the runtime go through
//! `spawn_blocking`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result, ResultExt};

/// Why an entry name can't be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnsafeName {
    Absolute,
    Traversal,
    Empty,
}

impl UnsafeName {
    fn describe(self) -> &'static str {
        match self {
            UnsafeName::Absolute => "is an absolute path",
            UnsafeName::Traversal => "contains a parent directory segment",
            UnsafeName::Empty => "has an empty name",
        }
    }
}

/// Reduce an entry name to its plain relative form, eg. `./src//main.c` to `src/main.c`
fn normalize_entry(name: &str) -> Result<String, UnsafeName> {
    let name = name.replace('\\', "/");
    if name.starts_with('/') {
        return Err(UnsafeName::Absolute)
    }
    let bytes = name.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return Err(UnsafeName::Absolute)
    }

    let mut parts = vec![];
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(UnsafeName::Traversal),
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(UnsafeName::Empty)
    }
    Ok(parts.join("/"))
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).internal(|| format!("Could not open archive {}", path.to_string_lossy()))?;
    ZipArchive::new(file).map_err(|err| corrupt(path, err))
}

fn corrupt(path: &Path, err: ZipError) -> Error {
    match err {
        ZipError::Io(err) => Error::internal(format!("Could not read archive {}", path.to_string_lossy()), err),
        err => Error::CorruptArchive { reason: err.to_string() },
    }
}

/// Fail with `ArchiveTooLarge` if either the archive itself or the sum of the
/// sizes its entries declare exceeds `limit` bytes.
pub fn check_archive_size(path: &Path, limit: u64) -> Result<()> {
    let size = std::fs::metadata(path).internal(|| format!("Could not stat archive {}", path.to_string_lossy()))?.len();
    if size > limit {
        return Err(Error::ArchiveTooLarge { size, limit })
    }

    let mut archive = open_archive(path)?;
    let mut declared: u64 = 0;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(|err| corrupt(path, err))?;
        declared = declared.saturating_add(entry.size());
    }
    if declared > limit {
        return Err(Error::ArchiveTooLarge { size: declared, limit })
    }
    Ok(())
}

/// Fail with `ArchiveOverrideAttempt` if any entry could replace one of the
/// `reserved` names or land outside of the directory it is unpacked into.
pub fn check_archive_for_file_override(path: &Path, reserved: &[&str]) -> Result<()> {
    let mut archive = open_archive(path)?;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(|err| corrupt(path, err))?;
        let normalized = match normalize_entry(entry.name()) {
            Ok(normalized) => normalized,
            Err(UnsafeName::Empty) => continue,
            Err(reason) => return Err(Error::ArchiveOverrideAttempt { entry: entry.name().to_owned(), reason: reason.describe() }),
        };
        if reserved.iter().any(|name| *name == normalized) {
            warn!("Archive {} tried to override {normalized}", path.to_string_lossy());
            return Err(Error::ArchiveOverrideAttempt { entry: entry.name().to_owned(), reason: "matches a file reserved for testing" })
        }
    }
    Ok(())
}

/// Unpack `archive` under `destination`.
///
/// Every entry name is checked before anything is written. If one would
/// resolve outside of `destination` the whole extraction fails with
/// `UnsafeArchiveEntry`. Extraction stops once more than `limit` bytes have
/// actually been decompressed.
pub fn unzip_safely(archive_path: &Path, destination: &Path, limit: u64) -> Result<()> {
    let mut archive = open_archive(archive_path)?;

    let mut targets: Vec<Option<PathBuf>> = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).map_err(|err| corrupt(archive_path, err))?;
        match normalize_entry(entry.name()) {
            Ok(normalized) => targets.push(Some(destination.join(normalized))),
            Err(UnsafeName::Empty) => targets.push(None),
            Err(_) => return Err(Error::UnsafeArchiveEntry { entry: entry.name().to_owned() }),
        }
    }

    std::fs::create_dir_all(destination).internal(|| format!("Could not create {}", destination.to_string_lossy()))?;

    let mut remaining = limit;
    for (index, target) in targets.into_iter().enumerate() {
        let Some(target) = target else { continue };
        if !target.starts_with(destination) {
            return Err(Error::UnsafeArchiveEntry { entry: target.to_string_lossy().into_owned() })
        }

        let mut entry = archive.by_index(index).map_err(|err| corrupt(archive_path, err))?;
        if entry.is_dir() {
            std::fs::create_dir_all(&target).internal(|| format!("Could not create {}", target.to_string_lossy()))?;
            continue
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).internal(|| format!("Could not create {}", parent.to_string_lossy()))?;
        }
        let mut output = File::create(&target).internal(|| format!("Could not create {}", target.to_string_lossy()))?;
        let written = std::io::copy(&mut (&mut entry).take(remaining.saturating_add(1)), &mut output)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::InvalidData => Error::CorruptArchive { reason: err.to_string() },
                _ => Error::internal(format!("Could not extract {}", target.to_string_lossy()), err),
            })?;
        if written > remaining {
            return Err(Error::ArchiveTooLarge { size: limit.saturating_add(1), limit })
        }
        remaining -= written;
    }

    debug!("Unpacked {} into {}", archive_path.to_string_lossy(), destination.to_string_lossy());
    Ok(())
}

/// Write each `(name, source)` pair as an entry of a new archive
pub fn create_zip(output: File, entries: &[(String, PathBuf)]) -> Result<()> {
    let mut writer = ZipWriter::new(output);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, source) in entries {
        let mut input = File::open(source).internal(|| format!("Could not open {} for bundling as {name}", source.to_string_lossy()))?;
        writer.start_file(name.as_str(), options).internal(|| format!("Could not add {name} to bundle"))?;
        std::io::copy(&mut input, &mut writer).internal(|| format!("Could not write {name} to bundle"))?;
    }

    let mut output = writer.finish().internal(|| "Could not finalize bundle")?;
    output.flush().internal(|| "Could not flush bundle")?;
    output.sync_all().internal(|| "Could not sync bundle")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    pub(crate) fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, body) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, SimpleFileOptions::default()).unwrap();
                writer.write_all(body).unwrap();
            }
        }
        writer.finish().unwrap();
    }
}
