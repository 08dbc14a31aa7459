//! Protocol tee: mirrors raw DAP traffic into a log file for diagnosing
//! client/adapter disagreements without a working transport.

use std::fs::{File, OpenOptions};
use std::io::{Read, Result, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct SpySink {
    file: Arc<Mutex<File>>,
}

impl SpySink {
    pub fn open(path: &Path) -> Result<SpySink> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(SpySink {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn append(&self, direction: &str, bytes: &[u8]) {
        if let Ok(mut file) = self.file.lock() {
            _ = write!(file, "{direction} ");
            _ = file.write_all(bytes);
            _ = writeln!(file);
        }
    }
}

pub struct SpyReader<R> {
    inner: R,
    sink: SpySink,
}

impl<R: Read> SpyReader<R> {
    pub fn new(inner: R, sink: SpySink) -> Self {
        Self { inner, sink }
    }
}

impl<R: Read> Read for SpyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.sink.append("<-", &buf[..n]);
        }
        Ok(n)
    }
}

pub struct SpyWriter<W> {
    inner: W,
    sink: SpySink,
}

impl<W: Write> SpyWriter<W> {
    pub fn new(inner: W, sink: SpySink) -> Self {
        Self { inner, sink }
    }
}

impl<W: Write> Write for SpyWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.sink.append("->", &buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
