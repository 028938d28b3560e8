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

//! The flashing engine: the top-level state machine that drives a K210
//! target from cold reset through reboot.

use std::io::{BufReader, Read, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::board::BoardVariant;
use crate::event::{Event, EventObserver, EventProvider};
use crate::firmware::{Firmware, FirmwareChunk};
use crate::jobstatus::{JobPhase, JobStatus, JobStatusObserver, JobStatusProvider, PostToUi};
use crate::protocol::{
    self, FLASHMODE_FLASH_INIT, FLASH_GREETING, ISP_FLASH_WRITE, ISP_GREETING, ISP_MEMORY_BOOT,
    ISP_MEMORY_WRITE, ISP_UARTHS_BAUDRATE_SET,
};
use crate::error::timeout::ErrorExt;
use crate::transport::Transport;
use crate::{Error, Result};

/// Address the flash bootloader is uploaded to and booted from.
pub const BOOTLOADER_LOAD_ADDRESS: u32 = 0x8000_0000;
/// Chunk size used while uploading the bootloader to SRAM.
pub const BOOTLOADER_CHUNK_SIZE: usize = 1024;
/// Chunk size used while streaming firmware into flash.
pub const FLASH_CHUNK_SIZE: usize = 4096;
/// Index of the in-package SPI flash, the only chip this tool targets.
pub const DEFAULT_CHIP: u32 = 1;
/// Caps retransmission of a single bad-response chunk. Unbounded retry
/// is a hang hazard against a target that never recovers; see DESIGN.md.
pub const MAX_CHUNK_RETRIES: u32 = 16;

fn reverse_4_byte_words(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    for word in out.chunks_mut(4) {
        word.reverse();
    }
    out
}

/// Wrap `data` in the `[flag][len][data][sha256]` envelope used when
/// `sha256_prefix` is set; otherwise return `data` unchanged.
fn build_envelope(data: &[u8], sha256_prefix: bool) -> Vec<u8> {
    if !sha256_prefix {
        return data.to_vec();
    }
    let mut envelope = Vec::with_capacity(1 + 4 + data.len() + 32);
    envelope.push(0u8);
    envelope.extend_from_slice(&(data.len() as u32).to_le_bytes());
    envelope.extend_from_slice(data);
    let digest = Sha256::digest(&envelope);
    envelope.extend_from_slice(&digest);
    envelope
}

struct Link {
    serial: BufReader<Box<dyn Transport>>,
    events: EventProvider,
}

impl Link {
    fn new(transport: Box<dyn Transport>, events: EventProvider) -> Self {
        Link {
            serial: BufReader::new(transport),
            events,
        }
    }

    fn transport(&mut self) -> &mut dyn Transport {
        &mut **self.serial.get_mut()
    }

    fn send_raw(&mut self, framed: &[u8]) -> Result<()> {
        self.events.send_event(Event::SerialWrite(framed.into()));
        self.transport().write_all(framed)?;
        Ok(())
    }

    fn send_command(&mut self, op: u16, address: u32, payload: Option<&[u8]>) -> Result<()> {
        let packet = protocol::build_packet(op, address, payload);
        self.events.send_event(Event::PacketSent {
            op,
            address,
            data: payload.unwrap_or(&[]).into(),
        });
        let framed = crate::slip::encode(&packet);
        self.events.send_event(Event::SlipWrite(packet.into()));
        self.send_raw(&framed)
    }

    fn read_response(&mut self) -> Result<protocol::Response> {
        let payload = crate::slip::decode(&mut self.serial).map_err(|err| match err {
            Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => Error::Timeout,
            other => other,
        })?;
        self.events.send_event(Event::SlipRead(payload.as_slice().into()));
        let response = protocol::parse_response(&payload)?;
        self.events.send_event(Event::Response {
            op: response.op,
            status: response.status,
        });
        Ok(response)
    }
}

fn check_cancelled(cancel: Option<&AtomicBool>) -> Result<()> {
    if cancel.map_or(false, |flag| flag.load(Ordering::SeqCst)) {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Drives a single K210 target through the full flashing sequence.
///
/// Single-threaded by design, mirroring the reference crate's `Rc`-based
/// `Flasher`: callers who want the UI thread to stay responsive run
/// `Engine::run` on a worker thread and relay `JobStatus`/`Event`
/// notifications back across a channel plugged into [`PostToUi`].
pub struct Engine {
    link: Link,
    jobs: JobStatusProvider,
    variant: std::cell::Cell<Option<BoardVariant>>,
}

impl Engine {
    pub fn new(transport: Box<dyn Transport>, post_to_ui: Option<PostToUi>) -> Self {
        Engine {
            link: Link::new(transport, EventProvider::new()),
            jobs: JobStatusProvider::new(post_to_ui),
            variant: std::cell::Cell::new(None),
        }
    }

    pub fn add_status_observer<O>(&mut self, observer: O)
    where
        O: Into<Rc<dyn JobStatusObserver>>,
    {
        self.jobs.add_observer(observer.into());
    }

    pub fn add_event_observer<O>(&mut self, observer: O)
    where
        O: Into<Rc<dyn EventObserver>>,
    {
        self.link.events.add_observer(observer.into());
    }

    pub fn status(&self, phase: JobPhase) -> JobStatus {
        self.jobs.status(phase)
    }

    pub fn current_job(&self) -> Option<JobPhase> {
        self.jobs.current()
    }

    /// Run the complete flashing sequence: detect the board, install the
    /// bootloader, switch to flash mode, optionally renegotiate the baud
    /// rate, stream `firmware`, and reboot.
    pub fn run(
        &mut self,
        bootloader: &[u8],
        target_baud: u32,
        firmware: &Firmware,
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        self.detect_board()?;
        check_cancelled(cancel)?;

        self.install_flash_bootloader(bootloader, cancel)?;
        check_cancelled(cancel)?;

        self.flash_greeting()?;
        check_cancelled(cancel)?;

        self.change_baud_rate(target_baud)?;
        check_cancelled(cancel)?;

        self.initialize_flash(DEFAULT_CHIP)?;
        check_cancelled(cancel)?;

        for chunk in &firmware.chunks {
            self.flash_firmware(chunk, cancel)?;
            check_cancelled(cancel)?;
        }

        self.reboot()?;
        Ok(())
    }

    fn detect_board(&mut self) -> Result<BoardVariant> {
        self.jobs.enter(JobPhase::DetectBoard);
        for variant in BoardVariant::all() {
            log::info!("trying board variant {}", variant.name());

            self.jobs.enter(JobPhase::BootToIspMode);
            variant.enter_isp_mode(self.link.transport())?;
            self.jobs.finish(JobPhase::BootToIspMode);

            self.jobs.enter(JobPhase::Greeting);
            let result = self.greeting(&ISP_GREETING, true);
            match result {
                Ok(()) => {
                    self.jobs.finish(JobPhase::Greeting);
                    self.jobs.finish(JobPhase::DetectBoard);
                    self.variant.set(Some(variant));
                    return Ok(variant);
                }
                Err(err) if err.is_timeout() => {
                    log::warn!(
                        "board variant {} timed out waiting for greeting, trying next",
                        variant.name()
                    );
                    continue;
                }
                Err(err) => {
                    self.jobs.error(JobPhase::Greeting);
                    self.jobs.error(JobPhase::DetectBoard);
                    return Err(err);
                }
            }
        }
        self.jobs.error(JobPhase::DetectBoard);
        Err(Error::UnsupportedBoard)
    }

    fn greeting(&mut self, frame: &[u8], strict_ok_only: bool) -> Result<()> {
        self.link.send_raw(frame)?;
        let response = self.link.read_response()?;
        if response.status.is_success(strict_ok_only) {
            Ok(())
        } else {
            Err(Error::BadResponse {
                op: response.op as u16,
                error: response.status.raw(),
            })
        }
    }

    fn send_chunk_with_retry(&mut self, op: u16, address: u32, chunk: &[u8]) -> Result<()> {
        for attempt in 0..=MAX_CHUNK_RETRIES {
            self.link.send_command(op, address, Some(chunk))?;
            match self.link.read_response() {
                Ok(response) if response.status.is_success(false) => return Ok(()),
                Ok(response) => {
                    log::warn!(
                        "chunk at {address:#010x} rejected (status={:#04x}), retransmitting (attempt {attempt})",
                        response.status.raw()
                    );
                }
                Err(err) if err.is_timeout() => {
                    log::warn!("timed out waiting for response to chunk at {address:#010x}, retransmitting");
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::BadResponse { op, error: 0xFF })
    }

    fn send_once_retry_once(&mut self, op: u16, address: u32, payload: Option<&[u8]>) -> Result<()> {
        for _ in 0..2 {
            self.link.send_command(op, address, payload)?;
            match self.link.read_response() {
                Ok(response) if response.status.is_success(false) => return Ok(()),
                Ok(response) => {
                    log::warn!(
                        "op {op:#06x} rejected (status={:#04x}), resending once",
                        response.status.raw()
                    );
                }
                Err(err) if err.is_timeout() => {
                    log::warn!("timed out waiting for response to op {op:#06x}, resending once");
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::BadResponse { op, error: 0xFF })
    }

    fn install_flash_bootloader(
        &mut self,
        bootloader: &[u8],
        cancel: Option<&AtomicBool>,
    ) -> Result<()> {
        self.jobs.enter(JobPhase::InstallFlashBootloader);
        let total = bootloader.len().max(1);
        let mut sent = 0usize;
        for chunk in bootloader.chunks(BOOTLOADER_CHUNK_SIZE) {
            check_cancelled(cancel)?;
            let address = BOOTLOADER_LOAD_ADDRESS + sent as u32;
            if let Err(err) = self.send_chunk_with_retry(ISP_MEMORY_WRITE, address, chunk) {
                self.jobs.error(JobPhase::InstallFlashBootloader);
                return Err(err);
            }
            sent += chunk.len();
            self.jobs
                .set_progress(JobPhase::InstallFlashBootloader, sent as f32 / total as f32);
        }

        // Hand off to the bootloader: no response is read, the target is
        // simply given time to come up.
        log::info!("booting flash bootloader at {BOOTLOADER_LOAD_ADDRESS:#010x}");
        self.link
            .send_command(ISP_MEMORY_BOOT, BOOTLOADER_LOAD_ADDRESS, None)?;
        sleep(Duration::from_secs(2));

        self.jobs.finish(JobPhase::InstallFlashBootloader);
        Ok(())
    }

    fn flash_greeting(&mut self) -> Result<()> {
        self.jobs.enter(JobPhase::FlashGreeting);
        match self.greeting(&FLASH_GREETING, true) {
            Ok(()) => {
                self.jobs.finish(JobPhase::FlashGreeting);
                Ok(())
            }
            Err(err) => {
                self.jobs.error(JobPhase::FlashGreeting);
                Err(err)
            }
        }
    }

    fn change_baud_rate(&mut self, target_baud: u32) -> Result<()> {
        self.jobs.enter(JobPhase::ChangeBaudRate);
        let payload = target_baud.to_le_bytes();
        // No response is read for this command; the port is closed and
        // reopened at the new baud regardless.
        if let Err(err) = self
            .link
            .send_command(ISP_UARTHS_BAUDRATE_SET, 0, Some(&payload))
        {
            self.jobs.error(JobPhase::ChangeBaudRate);
            return Err(err);
        }
        sleep(Duration::from_millis(50));
        if let Err(err) = self.link.transport().reopen_at_baud(target_baud) {
            self.jobs.error(JobPhase::ChangeBaudRate);
            return Err(err);
        }
        self.jobs.finish(JobPhase::ChangeBaudRate);
        Ok(())
    }

    fn initialize_flash(&mut self, chip: u32) -> Result<()> {
        self.jobs.enter(JobPhase::InitializeFlash);
        match self.send_once_retry_once(FLASHMODE_FLASH_INIT, chip, None) {
            Ok(()) => {
                self.jobs.finish(JobPhase::InitializeFlash);
                Ok(())
            }
            Err(err) => {
                self.jobs.error(JobPhase::InitializeFlash);
                Err(err)
            }
        }
    }

    fn flash_firmware(&mut self, chunk: &FirmwareChunk, cancel: Option<&AtomicBool>) -> Result<()> {
        self.jobs.enter(JobPhase::FlashFirmware);
        let data = if chunk.reverse_4_bytes {
            reverse_4_byte_words(&chunk.data)
        } else {
            chunk.data.clone()
        };
        let envelope = build_envelope(&data, chunk.sha256_prefix);
        let total = envelope.len().max(1);
        let mut offset = 0usize;
        for piece in envelope.chunks(FLASH_CHUNK_SIZE) {
            check_cancelled(cancel)?;
            let address = chunk.address + offset as u32;
            if let Err(err) = self.send_chunk_with_retry(ISP_FLASH_WRITE, address, piece) {
                self.jobs.error(JobPhase::FlashFirmware);
                return Err(err);
            }
            offset += FLASH_CHUNK_SIZE;
            self.jobs.set_progress(
                JobPhase::FlashFirmware,
                (offset.min(total)) as f32 / total as f32,
            );
        }
        self.jobs.finish(JobPhase::FlashFirmware);
        Ok(())
    }

    fn reboot(&mut self) -> Result<()> {
        self.jobs.enter(JobPhase::Reboot);
        // `run` always calls `detect_board` before `reboot`, so a variant
        // is always set by the time we get here.
        let variant = self.variant.get().unwrap_or(BoardVariant::Unknown);
        if let Err(err) = variant.reboot(self.link.transport()) {
            self.jobs.error(JobPhase::Reboot);
            return Err(err);
        }
        self.jobs.finish(JobPhase::Reboot);
        Ok(())
    }
}

// Exposed so the CLI binary (and tests) can read a raw byte without
// going through the SLIP/packet machinery.
pub fn read_one_byte(transport: &mut dyn Transport) -> Result<u8> {
    let mut byte = [0u8; 1];
    transport.read_exact(&mut byte)?;
    Ok(byte[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobstatus::RunningState;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;

    /// A loopback [`Transport`] double: every `write()` call is fed to a
    /// scripted responder, whose returned bytes become the next `read()`
    /// data. `sent` records each written buffer for the test to inspect.
    struct MockTransport {
        inbox: VecDeque<u8>,
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        responder: Box<dyn FnMut(&[u8]) -> Vec<u8>>,
    }

    impl MockTransport {
        fn new(
            sent: Rc<RefCell<Vec<Vec<u8>>>>,
            responder: impl FnMut(&[u8]) -> Vec<u8> + 'static,
        ) -> Self {
            MockTransport {
                inbox: VecDeque::new(),
                sent,
                responder: Box::new(responder),
            }
        }
    }

    impl io::Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbox.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock transport starved"));
            }
            let n = buf.len().min(self.inbox.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.inbox.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl io::Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.sent.borrow_mut().push(buf.to_vec());
            self.inbox.extend((self.responder)(buf));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn set_dtr(&mut self, _level: bool) -> Result<()> {
            Ok(())
        }

        fn set_rts(&mut self, _level: bool) -> Result<()> {
            Ok(())
        }

        fn reopen_at_baud(&mut self, _baud: u32) -> Result<()> {
            Ok(())
        }
    }

    fn ok_frame() -> Vec<u8> {
        crate::slip::encode(&[0xD4, 0xE0])
    }

    fn bad_checksum_frame() -> Vec<u8> {
        crate::slip::encode(&[0xD4, 0xE2])
    }

    fn engine_with(
        responder: impl FnMut(&[u8]) -> Vec<u8> + 'static,
    ) -> (Engine, Rc<RefCell<Vec<Vec<u8>>>>) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let transport = MockTransport::new(Rc::clone(&sent), responder);
        (Engine::new(Box::new(transport), None), sent)
    }

    #[test]
    fn reverses_each_aligned_word() {
        let data = [0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB, 0xCC, 0xDD];
        assert_eq!(
            reverse_4_byte_words(&data),
            [0x04, 0x03, 0x02, 0x01, 0xDD, 0xCC, 0xBB, 0xAA]
        );
    }

    #[test]
    fn envelope_layout_matches_sha256_prefix_contract() {
        let data = vec![0x5Au8; 8192];
        let envelope = build_envelope(&data, true);
        assert_eq!(envelope.len(), 1 + 4 + data.len() + 32);
        assert_eq!(envelope[0], 0);
        assert_eq!(&envelope[1..5], &(data.len() as u32).to_le_bytes());
        assert_eq!(&envelope[5..5 + data.len()], &data[..]);
        let digest = Sha256::digest(&envelope[..5 + data.len()]);
        assert_eq!(&envelope[5 + data.len()..], &digest[..]);
    }

    #[test]
    fn envelope_without_prefix_is_unchanged() {
        let data = vec![1u8, 2, 3];
        assert_eq!(build_envelope(&data, false), data);
    }

    #[test]
    fn flash_firmware_chunks_by_4096_with_fixed_address_stride() {
        let (mut engine, sent) = engine_with(|_| ok_frame());
        let chunk = FirmwareChunk {
            address: 0x0010_0000,
            data: vec![0x5Au8; 10000],
            sha256_prefix: false,
            reverse_4_bytes: false,
        };
        engine.flash_firmware(&chunk, None).unwrap();

        let packets: Vec<_> = sent
            .borrow()
            .iter()
            .map(|framed| crate::slip::decode(&mut io::Cursor::new(framed.clone())).unwrap())
            .collect();
        assert_eq!(packets.len(), 3);
        let lengths: Vec<usize> = packets.iter().map(|p| p.len() - 16).collect();
        assert_eq!(lengths, vec![4096, 4096, 1808]);
        for (i, packet) in packets.iter().enumerate() {
            let address = u32::from_le_bytes(packet[8..12].try_into().unwrap());
            assert_eq!(address, chunk.address + (i as u32) * 4096);
        }

        let status = engine.status(JobPhase::FlashFirmware);
        assert_eq!(status.running_state, RunningState::Finished);
        assert_eq!(status.progress, 1.0);
    }

    #[test]
    fn chunk_retries_are_capped_and_escalate_to_bad_response() {
        let (mut engine, sent) = engine_with(|_| bad_checksum_frame());
        let err = engine
            .send_chunk_with_retry(ISP_FLASH_WRITE, 0, &[0xAA; 16])
            .unwrap_err();
        assert!(matches!(err, Error::BadResponse { .. }));
        assert_eq!(sent.borrow().len() as u32, MAX_CHUNK_RETRIES + 1);
    }

    #[test]
    fn detects_kd233_then_falls_back_to_generic_on_timeout() {
        let calls = Rc::new(RefCell::new(0u32));
        let calls_clone = Rc::clone(&calls);
        let (mut engine, _sent) = engine_with(move |_| {
            let mut n = calls_clone.borrow_mut();
            *n += 1;
            // The first greeting (kd233) times out (no bytes back); the
            // second (generic) succeeds.
            if *n == 1 {
                Vec::new()
            } else {
                ok_frame()
            }
        });
        let variant = engine.detect_board().unwrap();
        assert_eq!(variant, BoardVariant::Generic);
        assert_eq!(engine.status(JobPhase::DetectBoard).running_state, RunningState::Finished);
    }
}
