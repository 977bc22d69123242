//! The transport contract and the TCP framing binding.
//!
//! The protocol engine only needs four operations, and requires message
//! semantics: `send` writes one whole frame, `receive` delivers one whole
//! frame. Transports that already frame (USB bulk endpoints deliver one
//! request per read) satisfy this directly; byte streams are wrapped in
//! [`FramedStream`], which reassembles frames from the 4-byte length prefix.

use std::io::{Read, Write};
use std::net::TcpStream;

use byteorder::{ByteOrder, LittleEndian};

use crate::protocol::ProtocolError;

/// Default TCP port for the protocol.
pub const DEFAULT_PORT: u16 = 8192;

/// A bidirectional frame transport.
pub trait Transport {
    /// Establishes the connection. Transports that are connected at
    /// construction can leave this as the default no-op.
    fn connect(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Tears the connection down.
    fn disconnect(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Writes one whole frame, or fails.
    fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError>;

    /// Reads one whole frame into `buf`, returning its total length
    /// including the 4-byte prefix. Returns `Ok(0)` if the peer closed the
    /// connection cleanly between frames.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError>;
}

/// Frame transport over any byte stream, reading the 4-byte length then the
/// body.
#[derive(Debug)]
pub struct FramedStream<S> {
    stream: S,
}

impl<S: Read + Write> FramedStream<S> {
    /// Wraps a connected byte stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> Transport for FramedStream<S> {
    fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        let mut prefix = [0u8; 4];
        let mut have = 0;
        while have < prefix.len() {
            let n = self.stream.read(&mut prefix[have..])?;
            if n == 0 {
                if have == 0 {
                    return Ok(0);
                }
                return Err(ProtocolError::Comms("connection closed mid-frame".into()));
            }
            have += n;
        }

        let total = LittleEndian::read_u32(&prefix) as usize;
        if total < prefix.len() || total > buf.len() {
            return Err(ProtocolError::Comms(format!("invalid frame length {total}")));
        }

        buf[..prefix.len()].copy_from_slice(&prefix);
        self.stream.read_exact(&mut buf[prefix.len()..total])?;
        Ok(total)
    }
}

/// Client-side TCP transport. Connects lazily so a [`crate::client::Client`]
/// can be constructed before the server is reachable.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<FramedStream<TcpStream>>,
}

impl TcpTransport {
    /// Creates a transport that will connect to `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self) -> Result<(), ProtocolError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;
        log::info!("connected to {}:{}", self.host, self.port);
        self.stream = Some(FramedStream::new(stream));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if let Some(framed) = self.stream.take() {
            let _ = framed.into_inner().shutdown(std::net::Shutdown::Both);
            log::info!("disconnected from {}:{}", self.host, self.port);
        }
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        match &mut self.stream {
            Some(framed) => framed.send(frame),
            None => Err(ProtocolError::Comms("transport not connected".into())),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, ProtocolError> {
        match &mut self.stream {
            Some(framed) => framed.receive(buf),
            None => Err(ProtocolError::Comms("transport not connected".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    // A Read + Write over separate input and output buffers.
    struct Loopback {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn framed(input: Vec<u8>) -> FramedStream<Loopback> {
        FramedStream::new(Loopback {
            input: Cursor::new(input),
            output: Vec::new(),
        })
    }

    #[test]
    fn receive_reassembles_one_frame() {
        let mut frame = vec![9, 0, 0, 0, 1, 0, 0xaa, 0xbb, 0xcc];
        frame.extend_from_slice(&[0xff; 8]); // bytes of a following frame
        let mut transport = framed(frame);

        let mut buf = [0u8; 64];
        let n = transport.receive(&mut buf).unwrap();
        assert_eq!(n, 9);
        assert_eq!(&buf[..n], &[9, 0, 0, 0, 1, 0, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn receive_clean_eof_is_zero() {
        let mut transport = framed(vec![]);
        let mut buf = [0u8; 16];
        assert_eq!(transport.receive(&mut buf).unwrap(), 0);
    }

    #[test]
    fn receive_mid_frame_eof_is_error() {
        let mut transport = framed(vec![9, 0]);
        let mut buf = [0u8; 16];
        assert_matches!(transport.receive(&mut buf), Err(ProtocolError::Comms(_)));
    }

    #[test]
    fn receive_rejects_oversized_frame() {
        let mut transport = framed(vec![255, 255, 0, 0]);
        let mut buf = [0u8; 16];
        assert_matches!(transport.receive(&mut buf), Err(ProtocolError::Comms(_)));
    }

    #[test]
    fn send_writes_whole_frame() {
        let mut transport = framed(vec![]);
        transport.send(&[5, 0, 0, 0, 7]).unwrap();
        assert_eq!(transport.stream.output, vec![5, 0, 0, 0, 7]);
    }
}
