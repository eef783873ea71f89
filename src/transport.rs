//! Raw socket transport.
//!
//! Vendor A instruments wrap every message in an 8-byte header
//! `{opcode, header_version, sequence, spare, length: u32 BE}`; a logical
//! message is the concatenation of frame payloads up to the first frame whose
//! opcode carries the EOI bit. Vendor B instruments speak plain
//! newline-terminated ASCII over the same socket, so the connection also
//! exposes line and exact-length reads.

use crate::{DaqError, Result};
use log::{debug, trace, warn};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const HEADER_LEN: usize = 8;
pub const HEADER_VERSION: u8 = 1;
pub const OP_DATA: u8 = 0x80;
pub const OP_EOI: u8 = 0x01;

/// Largest payload a single frame may declare.
pub const MAX_FRAME_LEN: u32 = 1 << 28;

const DRAIN_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u8,
    pub version: u8,
    pub sequence: u8,
    pub spare: u8,
    pub length: u32,
}

impl FrameHeader {
    /// Header for a complete outgoing message of `length` bytes.
    pub fn outgoing(length: u32) -> Self {
        Self {
            opcode: OP_DATA | OP_EOI,
            version: HEADER_VERSION,
            sequence: 1,
            spare: 0,
            length,
        }
    }

    pub fn is_eoi(&self) -> bool {
        self.opcode & OP_EOI != 0
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_be_bytes();
        [
            self.opcode,
            self.version,
            self.sequence,
            self.spare,
            len[0],
            len[1],
            len[2],
            len[3],
        ]
    }

    /// Parse and validate a received header.
    pub fn parse(buf: [u8; HEADER_LEN]) -> Result<Self> {
        let header = Self {
            opcode: buf[0],
            version: buf[1],
            sequence: buf[2],
            spare: buf[3],
            length: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        if header.opcode & OP_DATA == 0 {
            return Err(DaqError::Framing(format!(
                "opcode {:#04x} has no data bit",
                header.opcode
            )));
        }
        if header.version != HEADER_VERSION {
            return Err(DaqError::Framing(format!(
                "unsupported header version {}",
                header.version
            )));
        }
        if header.length > MAX_FRAME_LEN {
            return Err(DaqError::Framing(format!(
                "frame length {} exceeds {}",
                header.length, MAX_FRAME_LEN
            )));
        }
        Ok(header)
    }
}

/// Fill `buf` completely, reissuing reads after short returns.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], operation: &'static str) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(DaqError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by instrument",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(DaqError::from_io(operation, e)),
        }
    }
    Ok(())
}

/// Frame `message` (newline-terminated) and write it in one piece.
pub fn write_frame<W: Write>(writer: &mut W, message: &str) -> Result<()> {
    let mut payload = message.as_bytes().to_vec();
    if !payload.ends_with(b"\n") {
        payload.push(b'\n');
    }
    let length = u32::try_from(payload.len())
        .map_err(|_| DaqError::Framing(format!("message of {} bytes", payload.len())))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&FrameHeader::outgoing(length).to_bytes());
    out.extend_from_slice(&payload);
    writer
        .write_all(&out)
        .and_then(|_| writer.flush())
        .map_err(|e| DaqError::from_io("send", e))
}

/// Read one logical message: frames are concatenated until EOI.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut reply = Vec::new();
    loop {
        let mut raw = [0u8; HEADER_LEN];
        read_full(reader, &mut raw, "receive")?;
        let header = FrameHeader::parse(raw)?;
        trace!("frame header {:?}", header);

        let start = reply.len();
        reply.resize(start + header.length as usize, 0);
        read_full(reader, &mut reply[start..], "receive")?;

        if header.is_eoi() {
            return Ok(reply);
        }
    }
}

/// One socket to one instrument.
pub struct Connection {
    host: String,
    port: u16,
    timeout: Duration,
    connect_timeout: Duration,
    clear_timeout: Duration,
    reader: Option<BufReader<TcpStream>>,
}

impl Connection {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
            connect_timeout: Duration::from_secs(5),
            clear_timeout: Duration::from_secs(2),
            reader: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Read timeout used while draining the output queue.
    pub fn with_clear_timeout(mut self, timeout: Duration) -> Self {
        self.clear_timeout = timeout;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    pub fn connect(&mut self) -> Result<()> {
        let addr = self.address();
        let connect_err = |source| DaqError::Connection {
            addr: addr.clone(),
            source,
        };

        let candidates = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(connect_err)?;

        let mut last = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(non_zero(self.timeout))?;
                    stream.set_write_timeout(non_zero(self.timeout))?;
                    stream.set_nodelay(true)?;
                    debug!("connected to {addr}");
                    self.reader = Some(BufReader::new(stream));
                    return Ok(());
                }
                Err(e) => {
                    warn!("failed to connect to {candidate}: {e}");
                    last = e;
                }
            }
        }
        Err(connect_err(last))
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        if let Some(reader) = self.reader.as_mut() {
            reader.get_ref().set_read_timeout(non_zero(timeout))?;
            reader.get_ref().set_write_timeout(non_zero(timeout))?;
        }
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut BufReader<TcpStream>> {
        self.reader.as_mut().ok_or_else(|| {
            DaqError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ))
        })
    }

    /// Send a framed message.
    pub fn send(&mut self, message: &str) -> Result<()> {
        debug!("send {:?}", message.trim_end());
        write_frame(self.stream()?.get_mut(), message)
    }

    /// Receive one framed logical message.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        let reply = read_message(self.stream()?)?;
        trace!("received {} bytes", reply.len());
        Ok(reply)
    }

    /// Send an unframed, newline-terminated line.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("write {:?}", line.trim_end());
        let stream = self.stream()?.get_mut();
        let mut out = line.as_bytes().to_vec();
        if !out.ends_with(b"\n") {
            out.push(b'\n');
        }
        stream
            .write_all(&out)
            .and_then(|_| stream.flush())
            .map_err(|e| DaqError::from_io("send", e))
    }

    /// Read up to and including the next newline.
    pub fn read_line(&mut self) -> Result<String> {
        let reader = self.stream()?;
        let mut buf = Vec::new();
        loop {
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => {
                    return Err(DaqError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by instrument",
                    )))
                }
                Ok(_) if buf.ends_with(b"\n") => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(DaqError::from_io("receive", e)),
            }
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        read_full(self.stream()?, &mut buf, "receive")?;
        Ok(buf)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        read_full(self.stream()?, &mut buf, "receive")?;
        Ok(buf[0])
    }

    /// Drain anything the instrument still has queued.
    ///
    /// Reads with the short clear timeout until a read times out, then
    /// restores the configured timeout. Returns the number of bytes dropped.
    pub fn clear(&mut self) -> Result<usize> {
        let clear_timeout = self.clear_timeout;
        let timeout = self.timeout;
        let reader = self.stream()?;

        let mut dropped = reader.buffer().len();
        reader.consume(dropped);

        reader.get_ref().set_read_timeout(non_zero(clear_timeout))?;
        let mut chunk = [0u8; DRAIN_CHUNK];
        let drained = loop {
            match reader.get_mut().read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => dropped += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break Ok(())
                }
                Err(e) => break Err(DaqError::Io(e)),
            }
        };
        reader.get_ref().set_read_timeout(non_zero(timeout))?;
        drained?;

        if dropped > 0 {
            debug!("cleared {dropped} queued bytes");
        }
        Ok(dropped)
    }

    pub fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.get_ref().shutdown(std::net::Shutdown::Both);
            debug!("closed connection to {}", self.address());
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn non_zero(timeout: Duration) -> Option<Duration> {
    Some(timeout).filter(|t| !t.is_zero())
}
