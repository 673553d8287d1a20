//! Packet-framed byte stream over the negotiated transport.
//!
//! [`TdsStream`] splits outgoing messages into packets of the current packet
//! size and exposes incoming messages packet by packet, which is what the
//! prelogin reader needs (`packet_data_left`).
//!
//! Every transport read and write observes cancellation while it is pending.
//! Async sockets race the poll against the context; blocking sockets wait in
//! [`BLOCKING_IO_SLICE`] steps and re-check between steps. Custom streams are
//! only checked between calls.

use std::fmt;
use std::io::{self, Read as StdRead, Write as StdWrite};
use std::net::TcpStream as StdTcpStream;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use asupersync::io::{AsyncRead, AsyncWrite, ReadBuf};
use asupersync::net::TcpStream;
use tdslink_core::cancel::race_cancel;
use tdslink_core::error::{
    ConnectionError, ConnectionErrorKind, Error, ProtocolError, ProtocolErrorKind,
};
use tdslink_core::{CancelReason, Cx, Outcome, cancel_requested};

use crate::protocol::{MAX_PACKET_SIZE, PacketHeader, PacketType, PacketWriter};

/// Longest a blocking socket call waits before cancellation is re-checked.
pub const BLOCKING_IO_SLICE: Duration = Duration::from_millis(50);

/// Any blocking duplex byte stream, for user-supplied transports.
pub trait DuplexStream: StdRead + StdWrite + Send + fmt::Debug {}

impl<T: StdRead + StdWrite + Send + fmt::Debug> DuplexStream for T {}

/// Underlying byte transport.
#[derive(Debug)]
pub enum ConnectionStream {
    /// Blocking TCP socket
    Sync(StdTcpStream),
    /// Async TCP socket driven by the asupersync reactor
    Async(TcpStream),
    /// Local pipe (Unix domain socket)
    #[cfg(unix)]
    Pipe(std::os::unix::net::UnixStream),
    /// Caller-provided stream
    Custom(Box<dyn DuplexStream>),
}

/// What kind of transport a stream runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    NamedPipe,
    Custom,
}

impl ConnectionStream {
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionStream::Sync(_) | ConnectionStream::Async(_) => TransportKind::Tcp,
            #[cfg(unix)]
            ConnectionStream::Pipe(_) => TransportKind::NamedPipe,
            ConnectionStream::Custom(_) => TransportKind::Custom,
        }
    }

    /// Bound blocking socket calls to one slice, or lift the bound again.
    fn set_blocking_slice(&self, slice: Option<Duration>) {
        match self {
            ConnectionStream::Sync(stream) => {
                stream.set_read_timeout(slice).ok();
                stream.set_write_timeout(slice).ok();
            }
            #[cfg(unix)]
            ConnectionStream::Pipe(stream) => {
                stream.set_read_timeout(slice).ok();
                stream.set_write_timeout(slice).ok();
            }
            ConnectionStream::Async(_) | ConnectionStream::Custom(_) => {}
        }
    }

    /// Fill `buf` completely.
    async fn read_exact(&mut self, cx: &Cx, buf: &mut [u8]) -> Result<(), StreamError> {
        match self {
            ConnectionStream::Async(stream) => {
                let mut filled = 0;
                while filled < buf.len() {
                    let mut read_buf = ReadBuf::new(&mut buf[filled..]);
                    race_cancel(cx, |task_cx| {
                        Pin::new(&mut *stream).poll_read(task_cx, &mut read_buf)
                    })
                    .await??;
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Err(closed_by_peer().into());
                    }
                    filled += n;
                }
                Ok(())
            }
            ConnectionStream::Sync(stream) => read_sliced(cx, stream, buf),
            #[cfg(unix)]
            ConnectionStream::Pipe(stream) => read_sliced(cx, stream, buf),
            ConnectionStream::Custom(stream) => read_sliced(cx, stream.as_mut(), buf),
        }
    }

    /// Write all of `data` and flush.
    async fn write_all(&mut self, cx: &Cx, data: &[u8]) -> Result<(), StreamError> {
        match self {
            ConnectionStream::Async(stream) => {
                // poll_write may accept fewer bytes than offered
                let mut written = 0;
                while written < data.len() {
                    let n = race_cancel(cx, |task_cx| {
                        Pin::new(&mut *stream).poll_write(task_cx, &data[written..])
                    })
                    .await??;
                    if n == 0 {
                        return Err(write_zero().into());
                    }
                    written += n;
                }
                race_cancel(cx, |task_cx| Pin::new(&mut *stream).poll_flush(task_cx)).await??;
                Ok(())
            }
            ConnectionStream::Sync(stream) => write_sliced(cx, stream, data),
            #[cfg(unix)]
            ConnectionStream::Pipe(stream) => write_sliced(cx, stream, data),
            ConnectionStream::Custom(stream) => write_sliced(cx, stream.as_mut(), data),
        }
    }
}

/// Why a transport call did not complete.
enum StreamError {
    Cancelled(CancelReason),
    Io(io::Error),
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(err)
    }
}

impl From<CancelReason> for StreamError {
    fn from(reason: CancelReason) -> Self {
        StreamError::Cancelled(reason)
    }
}

fn closed_by_peer() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer")
}

fn write_zero() -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, "connection closed while writing")
}

/// A slice ran out (or the call was interrupted) without progress.
fn is_slice_elapsed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn check_cancel(cx: &Cx) -> Result<(), StreamError> {
    match cancel_requested(cx) {
        Some(reason) => Err(StreamError::Cancelled(reason)),
        None => Ok(()),
    }
}

fn read_sliced<R: StdRead + ?Sized>(
    cx: &Cx,
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        check_cancel(cx)?;
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(closed_by_peer().into()),
            Ok(n) => filled += n,
            Err(e) if is_slice_elapsed(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn write_sliced<W: StdWrite + ?Sized>(
    cx: &Cx,
    writer: &mut W,
    data: &[u8],
) -> Result<(), StreamError> {
    let mut written = 0;
    while written < data.len() {
        check_cancel(cx)?;
        match writer.write(&data[written..]) {
            Ok(0) => return Err(write_zero().into()),
            Ok(n) => written += n,
            Err(e) if is_slice_elapsed(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    loop {
        check_cancel(cx)?;
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(e) if is_slice_elapsed(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn io_error(context: &str, err: io::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("{context}: {err}"),
        source: Some(Arc::new(err)),
    })
}

/// Map a failed transport call. A cancel observed after an I/O error wins,
/// since tearing the transport down is what usually produced the error.
fn stream_failure<T>(cx: &Cx, context: &str, err: StreamError) -> Outcome<T, Error> {
    match err {
        StreamError::Cancelled(reason) => Outcome::Cancelled(reason),
        StreamError::Io(e) => match cancel_requested(cx) {
            Some(reason) => Outcome::Cancelled(reason),
            None => Outcome::Err(io_error(context, e)),
        },
    }
}

/// Packet-level reader/writer.
pub struct TdsStream {
    stream: ConnectionStream,
    packet_size: usize,
    out_type: PacketType,
    out_buf: Vec<u8>,
    packet_id: u8,
    in_buf: Vec<u8>,
    in_pos: usize,
    in_header: Option<PacketHeader>,
}

impl fmt::Debug for TdsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TdsStream")
            .field("transport", &self.stream.kind())
            .field("packet_size", &self.packet_size)
            .field("pending_out", &self.out_buf.len())
            .field("packet_data_left", &self.packet_data_left())
            .finish()
    }
}

impl TdsStream {
    /// Wrap a transport. `packet_size` counts the 8-byte header.
    ///
    /// Blocking sockets get a [`BLOCKING_IO_SLICE`] timeout until
    /// [`into_inner`](Self::into_inner) hands them back.
    pub fn new(stream: ConnectionStream, packet_size: usize) -> Self {
        let packet_size = packet_size.clamp(PacketHeader::SIZE + 1, MAX_PACKET_SIZE);
        stream.set_blocking_slice(Some(BLOCKING_IO_SLICE));
        Self {
            stream,
            packet_size,
            out_type: PacketType::PreLogin,
            out_buf: Vec::with_capacity(packet_size - PacketHeader::SIZE),
            packet_id: 1,
            in_buf: Vec::new(),
            in_pos: 0,
            in_header: None,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.stream.kind()
    }

    /// Set the type of the next outgoing message.
    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.out_type = packet_type;
    }

    /// Bytes of the current incoming packet not consumed yet.
    pub fn packet_data_left(&self) -> usize {
        self.in_buf.len().saturating_sub(self.in_pos)
    }

    /// Header of the packet currently being read.
    pub fn current_header(&self) -> Option<&PacketHeader> {
        self.in_header.as_ref()
    }

    /// Give back the transport with its socket timeouts cleared.
    pub fn into_inner(self) -> ConnectionStream {
        self.stream.set_blocking_slice(None);
        self.stream
    }

    fn payload_capacity(&self) -> usize {
        self.packet_size - PacketHeader::SIZE
    }

    /// Buffer one byte, sending a full packet if the buffer fills.
    pub async fn write_byte(&mut self, cx: &Cx, byte: u8) -> Outcome<(), Error> {
        if let Some(reason) = cancel_requested(cx) {
            return Outcome::Cancelled(reason);
        }
        self.out_buf.push(byte);
        if self.out_buf.len() >= self.payload_capacity() {
            return self.send_packet(cx, false).await;
        }
        Outcome::Ok(())
    }

    /// Buffer `data`, sending full packets as they fill.
    pub async fn write_all(&mut self, cx: &Cx, mut data: &[u8]) -> Outcome<(), Error> {
        while !data.is_empty() {
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }
            let room = self.payload_capacity() - self.out_buf.len();
            let take = room.min(data.len());
            self.out_buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.out_buf.len() >= self.payload_capacity() {
                match self.send_packet(cx, false).await {
                    Outcome::Ok(()) => {}
                    other => return other,
                }
            }
        }
        Outcome::Ok(())
    }

    /// Send whatever is buffered as the last packet of the message.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(reason) = cancel_requested(cx) {
            return Outcome::Cancelled(reason);
        }
        self.send_packet(cx, true).await
    }

    async fn send_packet(&mut self, cx: &Cx, end_of_message: bool) -> Outcome<(), Error> {
        let packet = PacketWriter::build_packet(
            self.out_type,
            &self.out_buf,
            end_of_message,
            self.packet_id,
        );
        self.packet_id = self.packet_id.wrapping_add(1);
        self.out_buf.clear();
        tracing::trace!(
            packet_type = ?self.out_type,
            len = packet.len(),
            end_of_message,
            "sending packet"
        );
        match self.stream.write_all(cx, &packet).await {
            Ok(()) => Outcome::Ok(()),
            Err(e) => stream_failure(cx, "Failed to write packet", e),
        }
    }

    /// Look at the next incoming byte, reading a packet if none is buffered.
    pub async fn peek_byte(&mut self, cx: &Cx) -> Outcome<u8, Error> {
        if let Some(reason) = cancel_requested(cx) {
            return Outcome::Cancelled(reason);
        }
        if self.packet_data_left() == 0 {
            match self.read_packet(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(self.in_buf[self.in_pos])
    }

    /// Fill `buf` from the incoming message, crossing packets as needed.
    pub async fn read_exact(&mut self, cx: &Cx, buf: &mut [u8]) -> Outcome<(), Error> {
        let mut filled = 0;
        while filled < buf.len() {
            if let Some(reason) = cancel_requested(cx) {
                return Outcome::Cancelled(reason);
            }
            if self.packet_data_left() == 0 {
                match self.read_packet(cx).await {
                    Outcome::Ok(()) => {}
                    other => return other,
                }
            }
            let take = self.packet_data_left().min(buf.len() - filled);
            buf[filled..filled + take]
                .copy_from_slice(&self.in_buf[self.in_pos..self.in_pos + take]);
            self.in_pos += take;
            filled += take;
        }
        Outcome::Ok(())
    }

    async fn read_packet(&mut self, cx: &Cx) -> Outcome<(), Error> {
        loop {
            let mut header_buf = [0u8; PacketHeader::SIZE];
            if let Err(e) = self.stream.read_exact(cx, &mut header_buf).await {
                return stream_failure(cx, "Failed to read packet header", e);
            }
            let header = PacketHeader::from_bytes(&header_buf);
            if usize::from(header.length) < PacketHeader::SIZE {
                return Outcome::Err(Error::Protocol(ProtocolError {
                    kind: ProtocolErrorKind::Malformed,
                    message: format!("packet length {} shorter than its header", header.length),
                    raw_data: Some(header_buf.to_vec()),
                    source: None,
                }));
            }

            let mut payload = vec![0u8; header.payload_length()];
            if let Err(e) = self.stream.read_exact(cx, &mut payload).await {
                return stream_failure(cx, "Failed to read packet payload", e);
            }
            tracing::trace!(
                packet_type = ?header.packet_type,
                len = header.length,
                eom = header.is_end_of_message(),
                "received packet"
            );

            self.in_header = Some(header);
            self.in_buf = payload;
            self.in_pos = 0;
            if !self.in_buf.is_empty() || header.is_end_of_message() {
                break;
            }
        }
        if self.in_buf.is_empty() {
            return Outcome::Err(Error::Protocol(ProtocolError {
                kind: ProtocolErrorKind::Malformed,
                message: "server sent an empty message".to_string(),
                raw_data: None,
                source: None,
            }));
        }
        Outcome::Ok(())
    }
}
