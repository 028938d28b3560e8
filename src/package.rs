//! `.kfpkg` reader: a zip archive containing `flash-list.json` at its
//! root plus one entry per referenced firmware blob.

use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

const SUPPORTED_VERSIONS: [&str; 2] = ["0.1.0", "0.1.1"];

#[derive(Debug, Deserialize)]
struct FlashListRoot {
    version: String,
    files: Vec<RawFlashFile>,
}

#[derive(Debug, Deserialize)]
struct RawFlashFile {
    address: u32,
    bin: String,
    #[serde(rename = "sha256Prefix")]
    sha256_prefix: bool,
    #[serde(rename = "reverse4Bytes", default)]
    reverse4_bytes: bool,
}

/// One file entry from `flash-list.json`, in listing order. Borrowing
/// its bytes requires the owning [`FlashPackage`]: see
/// [`FlashPackage::read`].
#[derive(Debug, Clone)]
pub struct FlashFile {
    pub address: u32,
    pub length: u64,
    pub sha256_prefix: bool,
    pub reverse_4_bytes: bool,
    bin_path: String,
}

impl FlashFile {
    pub fn bin_path(&self) -> &str {
        &self.bin_path
    }
}

/// An opened `.kfpkg` archive. Owns the zip reader; [`FlashFile`] entries
/// are plain metadata and only borrow bytes through this package, which
/// must outlive them.
pub struct FlashPackage<R: Read + Seek> {
    archive: zip::ZipArchive<R>,
    files: Vec<FlashFile>,
}

impl FlashPackage<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }
}

impl<R: Read + Seek> FlashPackage<R> {
    pub fn from_reader(reader: R) -> Result<Self> {
        let mut archive = zip::ZipArchive::new(reader)?;
        let root: FlashListRoot = {
            let manifest = archive.by_name("flash-list.json")?;
            serde_json::from_reader(manifest)?
        };
        if !SUPPORTED_VERSIONS.contains(&root.version.as_str()) {
            return Err(Error::UnsupportedPackage(root.version));
        }

        let mut files = Vec::with_capacity(root.files.len());
        for raw in root.files {
            let length = archive.by_name(&raw.bin)?.size();
            files.push(FlashFile {
                address: raw.address,
                length,
                sha256_prefix: raw.sha256_prefix,
                reverse_4_bytes: raw.reverse4_bytes,
                bin_path: raw.bin,
            });
        }

        Ok(FlashPackage { archive, files })
    }

    /// Files in the order `flash-list.json` lists them; writes must
    /// follow this order.
    pub fn files(&self) -> &[FlashFile] {
        &self.files
    }

    /// Materialize `file`'s bytes by opening its zip entry on demand.
    pub fn read(&mut self, file: &FlashFile) -> Result<Vec<u8>> {
        let mut entry = self.archive.by_name(&file.bin_path)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    fn build_kfpkg(version: &str, files: &[(u32, &str, &[u8], bool, bool)]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let entries: Vec<_> = files
                .iter()
                .map(|(address, bin, _data, sha, rev)| {
                    serde_json::json!({
                        "address": address,
                        "bin": bin,
                        "sha256Prefix": sha,
                        "reverse4Bytes": rev,
                    })
                })
                .collect();
            let manifest = serde_json::json!({ "version": version, "files": entries }).to_string();
            writer
                .start_file("flash-list.json", FileOptions::default())
                .unwrap();
            writer.write_all(manifest.as_bytes()).unwrap();

            for (_, bin, data, _, _) in files {
                writer.start_file(*bin, FileOptions::default()).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn parses_ordered_file_list() {
        let data = build_kfpkg(
            "0.1.1",
            &[
                (0, "a.bin", b"aaaa", true, false),
                (0x400000, "b.bin", b"bbbbbb", false, true),
            ],
        );
        let mut pkg = FlashPackage::from_reader(Cursor::new(data)).unwrap();
        assert_eq!(pkg.files().len(), 2);
        assert_eq!(pkg.files()[0].address, 0);
        assert_eq!(pkg.files()[1].address, 0x400000);
        assert!(pkg.files()[1].reverse_4_bytes);

        let first = pkg.files()[0].clone();
        assert_eq!(pkg.read(&first).unwrap(), b"aaaa");
    }

    #[test]
    fn rejects_unsupported_version() {
        let data = build_kfpkg("0.2.0", &[(0, "a.bin", b"x", false, false)]);
        let err = FlashPackage::from_reader(Cursor::new(data)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPackage(v) if v == "0.2.0"));
    }

    #[test]
    fn accepts_both_whitelisted_versions() {
        for version in ["0.1.0", "0.1.1"] {
            let data = build_kfpkg(version, &[(0, "a.bin", b"x", false, false)]);
            assert!(FlashPackage::from_reader(Cursor::new(data)).is_ok());
        }
    }
}
