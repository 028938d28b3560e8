#![allow(dead_code)]

mod board;
mod engine;
mod error;
pub mod event;
mod firmware;
pub mod jobstatus;
mod package;
mod protocol;
mod slip;
mod transport;

pub use board::BoardVariant;
pub use engine::{Engine, BOOTLOADER_LOAD_ADDRESS, DEFAULT_CHIP, FLASH_CHUNK_SIZE, MAX_CHUNK_RETRIES};
pub use error::{Error, Result};
pub use firmware::{Firmware, FirmwareChunk};
pub use package::{FlashFile, FlashPackage};
pub use protocol::IspStatus;
pub use transport::{SerialTransport, Transport};

pub mod timeout {
    pub use crate::error::timeout::ErrorExt;
}
