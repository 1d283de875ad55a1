//! Request/response transport over a half-duplex serial link.
//!
//! A [`Transport`] owns the link and the slave address for the whole
//! session and has at most one request in flight: `execute` takes
//! `&mut self` and only returns once the response arrived, failed to decode,
//! or timed out.
//!
//! Two implementations exist:
//!
//! - [`Session`]: blocking, reads the port on the calling thread.
//! - [`ListenerSession`]: a background thread owns the read half and hands
//!   complete frames back over a single-slot channel.

pub mod listener;

pub use listener::ListenerSession;

use crate::config::{BootConfig, DEFAULT_TIMEOUT, validate_address};
use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::Command;
use crate::protocol::frame::{self, frame_len};
use log::trace;
use std::io::{ErrorKind, Read};
use std::thread;
use std::time::{Duration, Instant};

/// Pause when a read returns no data without waiting itself.
const IDLE_DELAY: Duration = Duration::from_millis(1);

/// Something that can run one bootloader command at a time.
pub trait Transport {
    /// Slave address bound to this session.
    fn address(&self) -> u8;

    /// Default response timeout.
    fn timeout(&self) -> Duration;

    /// Send `request` and wait up to `timeout` for its response.
    fn execute_with_timeout<C: Command>(
        &mut self,
        request: &C,
        timeout: Duration,
    ) -> Result<C::Response>;

    /// Send `request` and wait for its response with the default timeout.
    fn execute<C: Command>(&mut self, request: &C) -> Result<C::Response> {
        let timeout = self.timeout();
        self.execute_with_timeout(request, timeout)
    }

    /// Release the underlying link.
    fn close(&mut self) -> Result<()>;
}

impl<T: Transport> Transport for &mut T {
    fn address(&self) -> u8 {
        (**self).address()
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn execute_with_timeout<C: Command>(
        &mut self,
        request: &C,
        timeout: Duration,
    ) -> Result<C::Response> {
        (**self).execute_with_timeout(request, timeout)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Encode the request frame for `request`.
pub(crate) fn request_frame<C: Command>(address: u8, request: &C) -> Vec<u8> {
    frame::encode(address, C::OPCODE.code(), &request.encode())
}

/// Decode a complete response frame for `request`.
pub(crate) fn parse_response<C: Command>(
    address: u8,
    request: &C,
    data: &[u8],
) -> Result<C::Response> {
    trace!("<- {data:02X?}");
    let payload = frame::decode(data, address, C::OPCODE.code())?;
    request.decode_response(payload)
}

/// Blocking session over a [`Port`].
pub struct Session<P: Port> {
    port: P,
    address: u8,
    timeout: Duration,
}

impl<P: Port> Session<P> {
    /// Bind `port` to the slave at `address`.
    pub fn new(port: P, address: u8) -> Result<Self> {
        validate_address(address)?;
        Ok(Self {
            port,
            address,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Build a session from a [`BootConfig`].
    pub fn from_config(port: P, config: &BootConfig) -> Result<Self> {
        Ok(Self::new(port, config.address)?.with_timeout(config.timeout))
    }

    /// Set the default response timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Accumulate exactly `len` bytes or give up at the deadline.
    fn read_frame(&mut self, len: usize, opcode: u8, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut frame = Vec::with_capacity(len);
        let mut buf = [0u8; 256];

        while frame.len() < len {
            if Instant::now() >= deadline {
                trace!("Timed out with {}/{len} bytes", frame.len());
                return Err(Error::Timeout {
                    opcode,
                    waited: timeout,
                });
            }

            let want = (len - frame.len()).min(buf.len());
            match self.port.read(&mut buf[..want]) {
                Ok(0) => thread::sleep(IDLE_DELAY),
                Ok(n) => frame.extend_from_slice(&buf[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(frame)
    }
}

impl<P: Port> Transport for Session<P> {
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
        let data = request_frame(self.address, request);

        // Leftovers from an earlier timed-out exchange would shift the frame
        self.port.clear_input()?;

        trace!("-> {data:02X?}");
        self.port.send(&data)?;

        let response = self.read_frame(frame_len(C::RESPONSE_LEN), C::OPCODE.code(), timeout)?;
        parse_response(self.address, request, &response)
    }

    fn close(&mut self) -> Result<()> {
        self.port.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAGIC;
    use crate::error::FrameError;
    use crate::protocol::{BootEnter, BootExit};
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// Port that answers every write with the next scripted reply.
    struct ScriptedPort {
        replies: VecDeque<Vec<u8>>,
        rx: VecDeque<u8>,
        written: Vec<Vec<u8>>,
        cleared: usize,
    }

    impl ScriptedPort {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: replies.into(),
                rx: VecDeque::new(),
                written: Vec::new(),
                cleared: 0,
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.rx.is_empty() {
                return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(self.rx.len());
            for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.push(buf.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.rx.extend(reply);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for ScriptedPort {
        fn clear_input(&mut self) -> Result<()> {
            self.cleared += 1;
            self.rx.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn session(replies: Vec<Vec<u8>>) -> Session<ScriptedPort> {
        Session::new(ScriptedPort::new(replies), 1)
            .unwrap()
            .with_timeout(Duration::from_millis(20))
    }

    #[test]
    fn test_rejects_invalid_address() {
        assert!(Session::new(ScriptedPort::new(vec![]), 0).is_err());
        assert!(Session::new(ScriptedPort::new(vec![]), 128).is_err());
    }

    #[test]
    fn test_execute_boot_enter() {
        let reply = frame::encode(1, 100, &MAGIC.to_le_bytes());
        let mut s = session(vec![reply]);

        assert_eq!(s.execute(&BootEnter::default()).unwrap(), MAGIC);
        assert_eq!(s.port().written.len(), 1);
        assert_eq!(s.port().written[0], frame::encode(1, 100, &MAGIC.to_le_bytes()));
        assert_eq!(s.port().cleared, 1);
    }

    #[test]
    fn test_execute_boot_exit_empty_response() {
        let mut s = session(vec![frame::encode(1, 102, &[])]);
        s.execute(&BootExit).unwrap();
    }

    #[test]
    fn test_timeout_when_silent() {
        let mut s = session(vec![]);
        let err = s.execute(&BootExit).unwrap_err();
        assert!(matches!(err, Error::Timeout { opcode: 102, .. }));
    }

    #[test]
    fn test_timeout_on_partial_frame() {
        let reply = frame::encode(1, 100, &MAGIC.to_le_bytes());
        let mut s = session(vec![reply[..5].to_vec()]);
        assert!(matches!(
            s.execute(&BootEnter::default()),
            Err(Error::Timeout { .. })
        ));
    }

    #[test]
    fn test_protocol_error_on_wrong_address() {
        let reply = frame::encode(9, 100, &MAGIC.to_le_bytes());
        let mut s = session(vec![reply]);
        assert!(matches!(
            s.execute(&BootEnter::default()),
            Err(Error::Protocol(FrameError::AddressMismatch {
                expected: 1,
                actual: 9
            }))
        ));
    }

    #[test]
    fn test_protocol_error_on_corrupt_crc() {
        let mut reply = frame::encode(1, 100, &MAGIC.to_le_bytes());
        reply[3] ^= 0x01;
        let mut s = session(vec![reply]);
        assert!(matches!(
            s.execute(&BootEnter::default()),
            Err(Error::Protocol(FrameError::ChecksumInvalid { .. }))
        ));
    }

    #[test]
    fn test_extra_bytes_are_not_consumed_into_frame() {
        let mut reply = frame::encode(1, 102, &[]);
        reply.extend_from_slice(&[0xAA, 0xBB]);
        let mut s = session(vec![reply]);
        s.execute(&BootExit).unwrap();
        assert_eq!(s.port().rx.len(), 2);
    }

    fn exit_via<T: Transport>(mut transport: T) -> Result<()> {
        transport.execute(&BootExit)
    }

    #[test]
    fn test_mut_ref_is_transport() {
        let mut s = session(vec![frame::encode(1, 102, &[])]);
        exit_via(&mut s).unwrap();
        assert_eq!(s.port().written.len(), 1);
    }
}
