use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};

/// Reader wait-group: cleanup blocks until every open reader is gone.
#[derive(Debug)]
pub(crate) struct ReaderGate {
    count: Mutex<i32>,
    cv: Condvar,
}

impl ReaderGate {
    pub fn new() -> ReaderGate {
        ReaderGate {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> i32 {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        *count
    }

    pub fn release(&self) -> i32 {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        self.cv.notify_all();
        *count
    }

    pub fn readers(&self) -> i32 {
        *self.count.lock().unwrap()
    }

    /// Block until the reader count drops to zero.
    pub fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cv.wait(count).unwrap();
        }
    }
}

/// One independent view of the job's combined output. Readers share
/// nothing but the underlying file; each reads at its own pace. The
/// reader reports raw EOF; follow semantics are decided by the caller
/// based on whether the job is still able to produce output.
#[derive(Debug)]
pub struct LogReader {
    file: File,
    gate: Arc<ReaderGate>,
}

impl LogReader {
    pub(crate) fn open(path: &Path, gate: Arc<ReaderGate>) -> io::Result<LogReader> {
        let file = File::open(path)?;
        gate.acquire();
        Ok(LogReader { file, gate })
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Drop for LogReader {
    fn drop(&mut self) {
        let total = self.gate.release();
        tracing::debug!(total, "log reader closed");
    }
}
