//! Integration tests driving [`kflash::Engine`] end-to-end over an
//! in-memory loopback [`kflash::Transport`] double, standing in for the
//! missing EventCollector-style trace assertions a real port can't give
//! us.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

use kflash::jobstatus::{JobPhase, RunningState};
use kflash::{Engine, Error, Firmware, FirmwareChunk, Transport};

/// A loopback transport: every `write()` is handed to a scripted
/// responder, whose returned bytes become the next `read()` data.
struct MockTransport {
    inbox: VecDeque<u8>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    responder: Box<dyn FnMut(&[u8]) -> Vec<u8>>,
}

impl MockTransport {
    fn new(sent: Rc<RefCell<Vec<Vec<u8>>>>, responder: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> Self {
        MockTransport {
            inbox: VecDeque::new(),
            sent,
            responder: Box::new(responder),
        }
    }
}

impl Read for MockTransport {
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

impl Write for MockTransport {
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
    fn set_dtr(&mut self, _level: bool) -> kflash::Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> kflash::Result<()> {
        Ok(())
    }

    fn reopen_at_baud(&mut self, _baud: u32) -> kflash::Result<()> {
        Ok(())
    }
}

/// A raw (op, status) response, SLIP-framed by hand: neither byte used
/// here needs escaping.
fn frame(op: u8, status: u8) -> Vec<u8> {
    vec![0xC0, op, status, 0xC0]
}

fn ok_frame() -> Vec<u8> {
    frame(0xD4, 0xE0)
}

fn bad_checksum_frame() -> Vec<u8> {
    frame(0xD4, 0xE2)
}

fn engine_with(responder: impl FnMut(&[u8]) -> Vec<u8> + 'static) -> (Engine, Rc<RefCell<Vec<Vec<u8>>>>) {
    let sent = Rc::new(RefCell::new(Vec::new()));
    let transport = MockTransport::new(Rc::clone(&sent), responder);
    (Engine::new(Box::new(transport), None), sent)
}

#[test]
fn flashes_a_single_bin_image_end_to_end() {
    let (mut engine, sent) = engine_with(|_| ok_frame());
    let bootloader = vec![0x11u8; 2048];
    let firmware = Firmware {
        chunks: vec![FirmwareChunk {
            address: 0x8000_0000,
            data: vec![0x22u8; 100],
            sha256_prefix: true,
            reverse_4_bytes: false,
        }],
    };

    engine.run(&bootloader, 2_000_000, &firmware, None).unwrap();

    for phase in JobPhase::ALL {
        assert_eq!(engine.status(phase).running_state, RunningState::Finished);
        assert_eq!(engine.status(phase).progress, 1.0);
    }
    assert!(!sent.borrow().is_empty());
}

#[test]
fn falls_back_to_the_next_board_variant_on_greeting_timeout() {
    let calls = Rc::new(RefCell::new(0u32));
    let calls_clone = Rc::clone(&calls);
    let (mut engine, _sent) = engine_with(move |_| {
        let mut n = calls_clone.borrow_mut();
        *n += 1;
        if *n == 1 {
            Vec::new()
        } else {
            ok_frame()
        }
    });

    let bootloader = vec![0xAAu8; 64];
    let firmware = Firmware {
        chunks: vec![FirmwareChunk {
            address: 0,
            data: vec![0x01u8; 16],
            sha256_prefix: false,
            reverse_4_bytes: false,
        }],
    };
    engine.run(&bootloader, 115_200, &firmware, None).unwrap();
    assert_eq!(engine.status(JobPhase::DetectBoard).running_state, RunningState::Finished);
}

#[test]
fn a_chunk_rejected_on_every_retry_surfaces_bad_response_and_stops() {
    let (mut engine, sent) = engine_with(|outgoing: &[u8]| {
        // Greetings must succeed so the run reaches FlashFirmware; only
        // flash-data writes (carrying more than a bare 16-byte header)
        // get rejected.
        if outgoing.len() > 40 {
            bad_checksum_frame()
        } else {
            ok_frame()
        }
    });

    let bootloader = vec![0xAAu8; 16];
    let firmware = Firmware {
        chunks: vec![FirmwareChunk {
            address: 0x0010_0000,
            data: vec![0x5Au8; 10_000],
            sha256_prefix: false,
            reverse_4_bytes: false,
        }],
    };

    let err = engine
        .run(&bootloader, 115_200, &firmware, None)
        .unwrap_err();
    assert!(matches!(err, Error::BadResponse { .. }));
    assert_eq!(engine.status(JobPhase::FlashFirmware).running_state, RunningState::Error);
    assert!(sent.borrow().len() > 1);
}
