#![allow(dead_code)]

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

/// A running follow-mode process with its stdout pumped through a reader
/// thread, so expectations can time out instead of hanging the test.
pub struct Tail {
    child: Child,
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
}

impl Tail {
    pub fn spawn(args: &[&str]) -> Tail {
        let mut child = Command::new(env!("CARGO_BIN_EXE_tailmux"))
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn tailmux");
        let mut stdout = child.stdout.take().expect("child stdout");
        let (tx, rx) = channel();
        std::thread::spawn(move || {
            let mut chunk = [0u8; 1024];
            loop {
                match stdout.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(chunk[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Tail {
            child,
            rx,
            buf: Vec::new(),
        }
    }

    /// Block until exactly `want.len()` further bytes of output arrive and
    /// assert they match.
    pub fn expect(&mut self, want: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.buf.len() < want.len() {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(chunk) => self.buf.extend_from_slice(&chunk),
                Err(_) => panic!(
                    "timed out waiting for {:?}; got {:?}",
                    want,
                    String::from_utf8_lossy(&self.buf)
                ),
            }
        }
        let got: Vec<u8> = self.buf.drain(..want.len()).collect();
        assert_eq!(String::from_utf8_lossy(&got), want);
    }

    /// Assert no further output shows up within `ms` milliseconds.
    pub fn expect_silence(&mut self, ms: u64) {
        assert!(
            self.buf.is_empty(),
            "unconsumed output: {:?}",
            String::from_utf8_lossy(&self.buf)
        );
        if let Ok(chunk) = self.rx.recv_timeout(Duration::from_millis(ms)) {
            panic!("unexpected output: {:?}", String::from_utf8_lossy(&chunk));
        }
    }
}

impl Drop for Tail {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Run to completion (no follow flags) and return stdout plus success.
pub fn run(args: &[&str]) -> (String, bool) {
    let out = Command::new(env!("CARGO_BIN_EXE_tailmux"))
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .expect("run tailmux");
    (
        String::from_utf8_lossy(&out.stdout).into_owned(),
        out.status.success(),
    )
}

pub fn run_with_stdin(args: &[&str], input: &[u8]) -> String {
    let mut child = Command::new(env!("CARGO_BIN_EXE_tailmux"))
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn tailmux");
    child
        .stdin
        .take()
        .expect("child stdin")
        .write_all(input)
        .expect("write stdin");
    let out = child.wait_with_output().expect("wait tailmux");
    String::from_utf8_lossy(&out.stdout).into_owned()
}

pub fn append(path: &Path, data: &[u8]) {
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .expect("open for append");
    f.write_all(data).expect("append");
}

pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}
