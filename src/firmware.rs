//! Firmware type derivation: `.bin` is a single blob at address 0 with a
//! SHA-256 prefix; `.kfpkg` is a multi-file package (see
//! [`crate::package`]); anything else is a [`crate::Error::BadInput`].

use std::fs;
use std::path::Path;

use crate::package::FlashPackage;
use crate::{Error, Result};

/// One firmware blob bound for a specific flash address.
#[derive(Debug, Clone)]
pub struct FirmwareChunk {
    pub address: u32,
    pub data: Vec<u8>,
    pub sha256_prefix: bool,
    pub reverse_4_bytes: bool,
}

/// A fully resolved flashing plan: one or more [`FirmwareChunk`]s in the
/// order they must be written.
#[derive(Debug, Clone)]
pub struct Firmware {
    pub chunks: Vec<FirmwareChunk>,
}

impl Firmware {
    pub fn load(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("bin") => {
                let data = fs::read(path)?;
                Ok(Firmware {
                    chunks: vec![FirmwareChunk {
                        address: 0,
                        data,
                        sha256_prefix: true,
                        reverse_4_bytes: false,
                    }],
                })
            }
            Some("kfpkg") => {
                let mut package = FlashPackage::open(path)?;
                let files = package.files().to_vec();
                let mut chunks = Vec::with_capacity(files.len());
                for file in &files {
                    let data = package.read(file)?;
                    chunks.push(FirmwareChunk {
                        address: file.address,
                        data,
                        sha256_prefix: file.sha256_prefix,
                        reverse_4_bytes: file.reverse_4_bytes,
                    });
                }
                Ok(Firmware { chunks })
            }
            _ => Err(Error::BadInput(format!(
                "unrecognized firmware extension: {}",
                path.display()
            ))),
        }
    }
}
