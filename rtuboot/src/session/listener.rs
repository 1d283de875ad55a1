//! Transport with a dedicated listener thread.
//!
//! The listener thread owns the read half of the link. Before each request
//! the writer posts an expectation (the response frame length) to the
//! listener, writes the request, then waits on a single-slot channel for the
//! complete frame or the timeout. The two sides never share a buffer.
//!
//! ```text
//!  writer (execute)                 listener thread
//!  ----------------                 ---------------
//!  drain stale frame
//!  send Expectation  ------------>  reset buffer
//!  write request
//!  recv_timeout      <------------  frame complete (len reached)
//!  decode
//! ```

use super::{Transport, parse_response, request_frame};
use crate::config::{DEFAULT_TIMEOUT, validate_address};
use crate::error::{Error, Result};
use crate::protocol::Command;
use crate::protocol::frame::frame_len;
use log::{debug, trace, warn};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause when a read returns no data without waiting itself.
const IDLE_DELAY: Duration = Duration::from_millis(1);

/// What the listener should collect next.
#[derive(Debug, Clone, Copy)]
struct Expectation {
    len: usize,
}

type FrameResult = io::Result<Vec<u8>>;

/// Session whose responses are collected by a background thread.
pub struct ListenerSession<W: Write + Send> {
    writer: W,
    address: u8,
    timeout: Duration,
    expect_tx: Option<Sender<Expectation>>,
    frame_rx: Receiver<FrameResult>,
    handle: Option<JoinHandle<()>>,
}

impl<W: Write + Send> ListenerSession<W> {
    /// Start the listener on `reader` and bind `writer` to the slave at `address`.
    ///
    /// `reader` should time out its reads periodically so the thread notices
    /// when the session is dropped.
    pub fn spawn<R>(reader: R, writer: W, address: u8) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        validate_address(address)?;

        let (expect_tx, expect_rx) = mpsc::channel();
        let (frame_tx, frame_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("rtuboot-listener".into())
            .spawn(move || listen(reader, &expect_rx, &frame_tx))?;

        debug!("Listener started for slave {address}");

        Ok(Self {
            writer,
            address,
            timeout: DEFAULT_TIMEOUT,
            expect_tx: Some(expect_tx),
            frame_rx,
            handle: Some(handle),
        })
    }

    /// Set the default response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stop(&mut self) {
        // Dropping the sender is the shutdown signal
        self.expect_tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Listener thread panicked");
            }
        }
    }
}

fn listener_gone() -> Error {
    Error::Io(io::Error::new(
        ErrorKind::BrokenPipe,
        "listener thread stopped",
    ))
}

impl<W: Write + Send> Transport for ListenerSession<W> {
    fn address(&self) -> u8 {
        self.address
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn execute_with_timeout<C: Command>(
        &mut self,
        request: &C,
        timeout: Duration,
    ) -> Result<C::Response> {
        let expect_tx = self.expect_tx.as_ref().ok_or_else(listener_gone)?;

        // A frame completed after the previous request timed out
        while let Ok(stale) = self.frame_rx.try_recv() {
            debug!("Discarding late response ({:?})", stale.map(|f| f.len()));
        }

        expect_tx
            .send(Expectation {
                len: frame_len(C::RESPONSE_LEN),
            })
            .map_err(|_| listener_gone())?;

        let data = request_frame(self.address, request);
        trace!("-> {data:02X?}");
        self.writer.write_all(&data)?;
        self.writer.flush()?;

        match self.frame_rx.recv_timeout(timeout) {
            Ok(Ok(frame)) => parse_response(self.address, request, &frame),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout {
                opcode: C::OPCODE.code(),
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(listener_gone()),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.stop();
        Ok(())
    }
}

impl<W: Write + Send> Drop for ListenerSession<W> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Apply queued expectations. Returns `false` once the session is gone.
fn poll_expectations(
    expect_rx: &Receiver<Expectation>,
    pending: &mut Option<Expectation>,
    buf: &mut Vec<u8>,
) -> bool {
    loop {
        match expect_rx.try_recv() {
            Ok(expectation) => {
                buf.clear();
                *pending = Some(expectation);
            },
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

fn listen<R: Read>(
    mut reader: R,
    expect_rx: &Receiver<Expectation>,
    frame_tx: &SyncSender<FrameResult>,
) {
    let mut pending: Option<Expectation> = None;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        if !poll_expectations(expect_rx, &mut pending, &mut buf) {
            break;
        }

        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                thread::sleep(IDLE_DELAY);
                continue;
            },
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => continue,
            Err(e) => {
                warn!("Listener read failed: {e}");
                let _ = frame_tx.try_send(Err(e));
                break;
            },
        };

        // The expectation may have been posted while the read was blocked
        if !poll_expectations(expect_rx, &mut pending, &mut buf) {
            break;
        }

        let Some(expectation) = pending else {
            trace!("Dropping {n} unsolicited bytes");
            continue;
        };

        buf.extend_from_slice(&chunk[..n]);
        if buf.len() >= expectation.len {
            if buf.len() > expectation.len {
                trace!("Dropping {} trailing bytes", buf.len() - expectation.len);
                buf.truncate(expectation.len);
            }
            pending = None;
            match frame_tx.try_send(Ok(std::mem::take(&mut buf))) {
                Ok(()) | Err(TrySendError::Full(_)) => {},
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
    }

    debug!("Listener stopped");
}
