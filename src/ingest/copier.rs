//! StreamCopier: feeds a CircularBuffer from any `io::Read`.
//!
//! Used for TCP streams and replay files. The copier never drops bytes: when
//! the buffer is full it waits for room, and if none appears within the
//! grace period it latches `BufferFull` on the buffer so the ingestion loop
//! faults at its next wait.

use crate::ingest::circular::CircularBuffer;
use crate::types::FaultKind;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Copier configuration
#[derive(Debug, Clone, Copy)]
pub struct CopierConfig {
    /// Bytes requested per read
    pub chunk_size: usize,
    /// How long a full buffer may block the copier before it faults
    pub full_grace: Duration,
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            full_grace: Duration::from_millis(500),
        }
    }
}

/// Handle to a running copy thread
pub struct CopierHandle {
    running: Arc<AtomicBool>,
    thread: JoinHandle<u64>,
}

impl CopierHandle {
    /// Ask the copier to stop after its current read
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the thread to exit. Returns the number of bytes copied.
    pub fn join(self) -> u64 {
        self.thread.join().unwrap_or_else(|_| {
            tracing::error!("copier thread panicked");
            0
        })
    }
}

/// Copies an upstream reader into a buffer on its own thread.
pub struct StreamCopier<R> {
    reader: R,
    buffer: Arc<CircularBuffer>,
    config: CopierConfig,
    running: Arc<AtomicBool>,
}

impl<R: Read + Send + 'static> StreamCopier<R> {
    pub fn new(reader: R, buffer: Arc<CircularBuffer>, config: CopierConfig) -> Self {
        Self {
            reader,
            buffer,
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Start the copy thread, named `pktflow-copy-{label}`.
    pub fn spawn(self, label: &str) -> std::io::Result<CopierHandle> {
        let running = Arc::clone(&self.running);
        let thread = std::thread::Builder::new()
            .name(format!("pktflow-copy-{}", label))
            .spawn(move || self.run())?;
        Ok(CopierHandle { running, thread })
    }

    /// Copy until EOF, an error, a full-buffer fault or a stop request.
    pub fn run(mut self) -> u64 {
        tracing::info!(chunk = self.config.chunk_size, "copier started");
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
        let mut copied = 0u64;

        while self.running.load(Ordering::SeqCst) {
            let n = match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.buffer.fault(FaultKind::SourceClosed, "upstream reached end of stream");
                    break;
                }
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    self.buffer.fault(FaultKind::Io, format!("upstream read failed: {}", e));
                    break;
                }
            };

            if !self.push_all(&chunk[..n]) {
                break;
            }
            copied += n as u64;
        }

        tracing::info!(copied, "copier stopped");
        copied
    }

    /// Push `data` completely, waiting for room. False if the copier must stop.
    fn push_all(&self, mut data: &[u8]) -> bool {
        while !data.is_empty() {
            let written = self.buffer.push(data);
            data = &data[written..];
            if data.is_empty() {
                break;
            }
            if self.buffer.fault_kind().is_some() || !self.running.load(Ordering::SeqCst) {
                return false;
            }
            tracing::debug!(pending = data.len(), "buffer full, waiting for room");
            if !self.buffer.wait_for_space(1, self.config.full_grace) {
                self.buffer.fault(
                    FaultKind::BufferFull,
                    format!(
                        "no room for {} bytes within {:?}",
                        data.len(),
                        self.config.full_grace
                    ),
                );
                return false;
            }
        }
        true
    }
}
