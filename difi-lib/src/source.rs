//! Packet sources.
//!
//! A [PacketSource] delivers whole datagrams, one per call, into a caller-owned buffer that is
//! reused for every receive.
use std::io::{ErrorKind, Read};

use tracing::debug;

use crate::prelude::*;
use crate::vita::Header;

/// Outcome of a single receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A datagram of this many bytes is at the start of the buffer.
    Datagram(usize),
    /// Nothing arrived before the source's timeout.
    Idle,
    /// The source is exhausted.
    Closed,
}

pub trait PacketSource {
    /// Block until a datagram arrives, the source times out, or the source closes.
    ///
    /// # Errors
    /// Any transport or I/O error that prevents further receives.
    fn recv(&mut self, buf: &mut [u8]) -> Result<Received>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
        (**self).recv(buf)
    }
}

/// Reads VITA-49 packets back-to-back from a reader, such as a capture file.
///
/// Packets are delimited by the size field of their header word. Any partial packet at the
/// end of the stream is dropped.
pub struct ReaderSource<R>
where
    R: Read,
{
    reader: R,
    offset: usize,
}

impl<R> ReaderSource<R>
where
    R: Read,
{
    pub fn new(reader: R) -> Self {
        ReaderSource { reader, offset: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<R> PacketSource for ReaderSource<R>
where
    R: Read,
{
    fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
        if buf.len() < Header::LEN {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: Header::LEN,
            });
        }
        if let Err(err) = self.reader.read_exact(&mut buf[..Header::LEN]) {
            if err.kind() == ErrorKind::UnexpectedEof {
                return Ok(Received::Closed);
            }
            return Err(Error::Io(err));
        }
        // we know there are enough bytes because we just read them
        let len = Header::decode(&buf[..Header::LEN])
            .map(|h| h.packet_len())
            .unwrap_or_default();
        if len < Header::LEN {
            return Err(Error::Decode(format!(
                "zero length packet at offset {}",
                self.offset
            )));
        }
        if len > buf.len() {
            return Err(Error::NotEnoughData {
                actual: buf.len(),
                minimum: len,
            });
        }
        if let Err(err) = self.reader.read_exact(&mut buf[Header::LEN..len]) {
            if err.kind() == ErrorKind::UnexpectedEof {
                debug!(offset = self.offset, "dropping partial packet at end of stream");
                return Ok(Received::Closed);
            }
            return Err(Error::Io(err));
        }
        self.offset += len;
        Ok(Received::Datagram(len))
    }
}

/// Delivers datagrams from an iterator.
pub struct IterSource<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    datagrams: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    pub fn new<T>(datagrams: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        IterSource {
            datagrams: datagrams.into_iter(),
        }
    }
}

impl<I> PacketSource for IterSource<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
        let Some(dat) = self.datagrams.next() else {
            return Ok(Received::Closed);
        };
        // truncated like a datagram socket would
        let n = dat.len().min(buf.len());
        buf[..n].copy_from_slice(&dat[..n]);
        Ok(Received::Datagram(n))
    }
}

#[cfg(feature = "zmq")]
pub use self::zmq_source::ZmqSource;

#[cfg(feature = "zmq")]
mod zmq_source {
    use std::time::Duration;

    use tracing::{info, warn};

    use super::{PacketSource, Received};
    use crate::prelude::*;

    /// Receives datagrams from a ZeroMQ publisher.
    pub struct ZmqSource {
        // the context must outlive the socket
        _context: zmq::Context,
        socket: zmq::Socket,
    }

    impl ZmqSource {
        /// Connect a subscriber to `tcp://{address}:{port}`, subscribed to everything.
        ///
        /// `timeout` bounds each receive so callers get a chance to observe cancellation.
        ///
        /// # Errors
        /// [Error::Transport] if the socket cannot be configured or connected.
        pub fn connect(address: &str, port: u16, hwm: i32, timeout: Duration) -> Result<Self> {
            let context = zmq::Context::new();
            let socket = context.socket(zmq::SUB)?;
            socket.set_rcvhwm(hwm)?;
            socket.set_rcvtimeo(i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX))?;
            let endpoint = format!("tcp://{address}:{port}");
            info!("connecting to {endpoint}");
            socket.connect(&endpoint)?;
            socket.set_subscribe(b"")?;
            Ok(ZmqSource {
                _context: context,
                socket,
            })
        }
    }

    impl PacketSource for ZmqSource {
        fn recv(&mut self, buf: &mut [u8]) -> Result<Received> {
            match self.socket.recv_into(buf, 0) {
                Ok(n) => {
                    if n > buf.len() {
                        warn!(len = n, max = buf.len(), "datagram truncated");
                    }
                    Ok(Received::Datagram(n.min(buf.len())))
                }
                Err(zmq::Error::EAGAIN | zmq::Error::EINTR) => Ok(Received::Idle),
                Err(err) => Err(err.into()),
            }
        }
    }
}
