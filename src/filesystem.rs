// src/filesystem.rs

//! Package payload extraction
//!
//! A `.nest` archive is a plain tar archive holding a `manifest.toml`, an
//! optional `instructions.sh` and, for effective packages, a gzip-compressed
//! `data.tar.gz` payload. The payload lands in the directory the package
//! occupies under the installed root; the script is kept beside it at
//! [`hooks::INSTRUCTIONS_PATH`].

use crate::error::{Error, Result};
use crate::hash;
use crate::hooks;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path};
use tar::Archive;
use tracing::debug;

/// Name of the payload inside a package archive
pub const PAYLOAD_NAME: &str = "data.tar.gz";

/// Extracts package archives
pub trait Unpacker: Send + Sync {
    /// Verify `archive` against `expected_checksum` if one is given, then
    /// extract its payload into `destination`
    fn unpack(&self, archive: &Path, expected_checksum: Option<&str>, destination: &Path)
    -> Result<()>;
}

/// Unpacks `.nest` archives with `tar` and `flate2`
#[derive(Debug, Clone, Copy, Default)]
pub struct TarUnpacker;

impl Unpacker for TarUnpacker {
    fn unpack(
        &self,
        archive: &Path,
        expected_checksum: Option<&str>,
        destination: &Path,
    ) -> Result<()> {
        if let Some(expected) = expected_checksum {
            hash::verify_checksum(archive, expected)?;
        }

        fs::create_dir_all(destination).map_err(|e| Error::filesystem(destination, e))?;

        let file = File::open(archive).map_err(|e| Error::filesystem(archive, e))?;
        let mut outer = Archive::new(file);
        let entries = outer.entries().map_err(|e| Error::filesystem(archive, e))?;
        let mut unpacked = false;

        for entry in entries {
            let mut entry = entry.map_err(|e| Error::filesystem(archive, e))?;
            let path = entry
                .path()
                .map_err(|e| Error::filesystem(archive, e))?
                .into_owned();

            if is_root_entry(&path, hooks::INSTRUCTIONS_NAME) {
                let script = hooks::instructions_path(destination);
                if let Some(parent) = script.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::filesystem(parent, e))?;
                }
                entry
                    .unpack(&script)
                    .map_err(|e| Error::filesystem(&script, e))?;
                debug!("Kept instructions of {}", archive.display());
            } else if is_root_entry(&path, PAYLOAD_NAME) {
                let mut payload = Archive::new(GzDecoder::new(entry));
                payload.set_preserve_permissions(true);
                payload
                    .unpack(destination)
                    .map_err(|e| Error::filesystem(destination, e))?;
                unpacked = true;
            }
        }

        if !unpacked {
            return Err(Error::filesystem(
                archive,
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("archive has no {} payload", PAYLOAD_NAME),
                ),
            ));
        }

        debug!(
            "Unpacked {} into {}",
            archive.display(),
            destination.display()
        );
        Ok(())
    }
}

/// `file` at the archive root, with or without a leading `./`
fn is_root_entry(path: &Path, file: &str) -> bool {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == file
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::TempDir;

    fn append(builder: &mut tar::Builder<impl io::Write>, path: &str, data: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }

    /// Build a `.nest` archive whose payload holds `files`
    fn build_archive(path: &Path, files: &[(&str, &[u8])]) {
        build_archive_with(path, files, None);
    }

    fn build_archive_with(path: &Path, files: &[(&str, &[u8])], instructions: Option<&str>) {
        let mut payload = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in files {
            append(&mut payload, name, data);
        }
        let payload = payload.into_inner().unwrap().finish().unwrap();

        let mut outer = tar::Builder::new(File::create(path).unwrap());
        append(&mut outer, "manifest.toml", b"name = \"app\"\n");
        if let Some(script) = instructions {
            append(&mut outer, "instructions.sh", script.as_bytes());
        }
        append(&mut outer, PAYLOAD_NAME, &payload);
        outer.finish().unwrap();
    }

    #[test]
    fn test_unpack_payload() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("app-1.0.0.nest");
        build_archive(&archive, &[("bin/app", b"#!/bin/sh\n"), ("README", b"hello")]);
        let checksum = hash::sha256_file(&archive).unwrap();

        let dest = dir.path().join("installed/app");
        TarUnpacker.unpack(&archive, Some(&checksum), &dest).unwrap();

        assert_eq!(fs::read(dest.join("bin/app")).unwrap(), b"#!/bin/sh\n");
        assert_eq!(fs::read(dest.join("README")).unwrap(), b"hello");
        assert!(!dest.join("manifest.toml").exists());
    }

    #[test]
    fn test_instructions_are_kept_beside_the_payload() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("app-1.0.0.nest");
        let script = "after_install() { :; }\n";
        build_archive_with(&archive, &[("README", b"hello")], Some(script));

        let dest = dir.path().join("installed/app");
        TarUnpacker.unpack(&archive, None, &dest).unwrap();

        assert_eq!(fs::read(dest.join("README")).unwrap(), b"hello");
        assert_eq!(
            fs::read_to_string(hooks::instructions_path(&dest)).unwrap(),
            script
        );
        assert!(!dest.join("instructions.sh").exists());
    }

    #[test]
    fn test_checksum_mismatch_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("app-1.0.0.nest");
        build_archive(&archive, &[("README", b"hello")]);

        let dest = dir.path().join("installed/app");
        let result = TarUnpacker.unpack(&archive, Some(&"0".repeat(64)), &dest);

        assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
        assert!(!dest.exists());
    }

    #[test]
    fn test_archive_without_payload() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("meta-1.0.0.nest");
        let mut outer = tar::Builder::new(File::create(&archive).unwrap());
        append(&mut outer, "manifest.toml", b"name = \"meta\"\n");
        outer.finish().unwrap();
        drop(outer);

        let result = TarUnpacker.unpack(&archive, None, &dir.path().join("meta"));
        assert!(matches!(result, Err(Error::Filesystem { .. })));
    }

    #[test]
    fn test_root_entry_matching() {
        assert!(is_root_entry(Path::new("data.tar.gz"), PAYLOAD_NAME));
        assert!(is_root_entry(Path::new("./data.tar.gz"), PAYLOAD_NAME));
        assert!(!is_root_entry(Path::new("nested/data.tar.gz"), PAYLOAD_NAME));
        assert!(!is_root_entry(Path::new("manifest.toml"), PAYLOAD_NAME));
        assert!(is_root_entry(Path::new("./instructions.sh"), hooks::INSTRUCTIONS_NAME));
    }
}
