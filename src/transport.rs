// Copyright 2022 Stephen Checkoway
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-level serial transport: open a device at a baud rate, drive
//! DTR/RTS, and reopen at a new baud rate without disturbing line state
//! semantics.

use std::io::{self, Read, Write};
use std::time::Duration;

use crate::Result;

pub const READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// Everything the engine needs from a serial connection. Implemented by
/// [`SerialTransport`] for real hardware and by an in-memory double in
/// the integration tests.
pub trait Transport: Read + Write {
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and reopen the same device at `baud`. DTR/RTS
    /// state is not touched by this call; the caller is responsible for
    /// driving them afterward if needed.
    fn reopen_at_baud(&mut self, baud: u32) -> Result<()>;
}

pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    device: String,
}

impl SerialTransport {
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()?;
        Ok(SerialTransport {
            port,
            device: device.to_owned(),
        })
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port.write_request_to_send(level)?;
        Ok(())
    }

    fn reopen_at_baud(&mut self, baud: u32) -> Result<()> {
        self.port = serialport::new(&self.device, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()?;
        Ok(())
    }
}
