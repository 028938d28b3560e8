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

//! DTR/RTS line dances that put the target into ISP mode (and, mirrored,
//! reboot it back out) across the board variants this tool supports.

use std::thread::sleep;
use std::time::Duration;

use crate::transport::Transport;
use crate::Result;

/// Board variants tried, in order, during detection.
///
/// `Unknown` is never produced by [`BoardVariant::all`]; it exists purely
/// as the terminal state once every real variant has been exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardVariant {
    Kd233,
    Generic,
    Unknown,
}

impl BoardVariant {
    /// Real variants, in the order detection tries them.
    pub const fn all() -> [BoardVariant; 2] {
        [BoardVariant::Kd233, BoardVariant::Generic]
    }

    pub fn name(self) -> &'static str {
        match self {
            BoardVariant::Kd233 => "kd233",
            BoardVariant::Generic => "generic",
            BoardVariant::Unknown => "unknown",
        }
    }

    /// Drive DTR/RTS to enter ISP mode. Also used, mirrored, to reboot
    /// the target back into its normal firmware after flashing — the
    /// dance is the same sequence either way.
    pub fn dance(self, transport: &mut dyn Transport) -> Result<()> {
        match self {
            BoardVariant::Kd233 => {
                transport.set_dtr(true)?;
                transport.set_rts(true)?;
                sleep(Duration::from_millis(50));
                transport.set_dtr(false)?;
                sleep(Duration::from_millis(50));
            }
            BoardVariant::Generic => {
                transport.set_dtr(false)?;
                transport.set_rts(false)?;
                sleep(Duration::from_millis(10));
                transport.set_dtr(false)?;
                transport.set_rts(true)?;
                sleep(Duration::from_millis(10));
                transport.set_rts(false)?;
                transport.set_dtr(true)?;
                sleep(Duration::from_millis(10));
            }
            BoardVariant::Unknown => return Ok(()),
        }
        Ok(())
    }

    pub fn enter_isp_mode(self, transport: &mut dyn Transport) -> Result<()> {
        self.dance(transport)
    }

    pub fn reboot(self, transport: &mut dyn Transport) -> Result<()> {
        self.dance(transport)
    }
}
