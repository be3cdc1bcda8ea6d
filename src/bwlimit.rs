//! Bandwidth-limited `Write` decorator for the client's outbound side.
//!
//! Splits writes into bounded sub-blocks and sleeps between them to keep the
//! amortized rate at or below the configured limit; deliberately does not try to
//! "catch up" after a stall, since bursting to compensate is exactly what would
//! overflow a rate-limited link.

use std::io::{self, Write};
use std::time::{Duration, Instant};

const SUB_BLOCK: usize = 4096;

pub struct BandwidthLimitedWriter<W> {
    inner: W,
    bytes_per_sec: u64,
    last_send: Instant,
}

impl<W: Write> BandwidthLimitedWriter<W> {
    pub fn new(inner: W, bytes_per_sec: u64) -> BandwidthLimitedWriter<W> {
        BandwidthLimitedWriter {
            inner,
            bytes_per_sec,
            last_send: Instant::now(),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn sleep_for(&self, block_len: usize) -> Duration {
        if self.bytes_per_sec == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(block_len as f64 / self.bytes_per_sec as f64)
    }
}

impl<W: Write> Write for BandwidthLimitedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        for chunk in buf.chunks(SUB_BLOCK) {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_send);
            let target = self.sleep_for(chunk.len());
            // Never sleep more than `target` to compensate for a slow previous
            // block - a stall should not turn into a burst later.
            if elapsed < target {
                std::thread::sleep(target - elapsed);
            }
            let n = self.inner.write(chunk)?;
            written += n;
            self.last_send = Instant::now();
            if n < chunk.len() {
                break;
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_writer_passes_through_immediately() {
        let mut out = Vec::new();
        {
            let mut writer = BandwidthLimitedWriter::new(&mut out, 0);
            writer.write_all(b"hello world").unwrap();
        }
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn splits_large_writes_into_sub_blocks() {
        let data = vec![7u8; SUB_BLOCK * 3 + 10];
        let mut out = Vec::new();
        {
            // A generous limit keeps the test fast while still exercising chunking.
            let mut writer = BandwidthLimitedWriter::new(&mut out, u64::MAX);
            writer.write_all(&data).unwrap();
        }
        assert_eq!(out, data);
    }
}
