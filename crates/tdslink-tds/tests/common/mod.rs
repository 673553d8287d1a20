//! Test doubles shared by the unit tests (mounted as `test_support`) and the
//! integration suite (mounted as `common`).

#![allow(dead_code)]

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tdslink_core::{Cx, Error, Outcome};

/// Duplex stream that replays canned server bytes and records client writes.
#[derive(Debug)]
pub struct ScriptedStream {
    input: Cursor<Vec<u8>>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedStream {
    pub fn new(input: Vec<u8>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                input: Cursor::new(input),
                output: Arc::clone(&output),
            },
            output,
        )
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output
            .lock()
            .map_err(|_| io::Error::other("output poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One server-to-client (tabular result) packet carrying `payload`.
pub fn server_packet(payload: &[u8], end_of_message: bool) -> Vec<u8> {
    let length = u16::try_from(payload.len() + 8).expect("payload fits in one packet");
    let mut packet = vec![0x04, u8::from(end_of_message)];
    packet.extend_from_slice(&length.to_be_bytes());
    // spid, packet id, window
    packet.extend_from_slice(&[0, 0, 1, 0]);
    packet.extend_from_slice(payload);
    packet
}

/// Drive a future on a current-thread runtime.
pub fn block_on<T>(future: impl std::future::Future<Output = T>) -> T {
    let rt = asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Flip the context's cancel flag from another thread after `after`.
pub fn cancel_later(cx: &Cx, after: Duration) -> std::thread::JoinHandle<()> {
    let cx = cx.clone();
    std::thread::spawn(move || {
        std::thread::sleep(after);
        cx.set_cancel_requested(true);
    })
}
