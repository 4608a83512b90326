//! Pipe state, framing and handshake
//!
//! The underlying transport is split once into a read half and a write
//! half so that the two directions can be driven by concurrent tasks. Each
//! half owns a fixed 16 KiB scratch buffer allocated when the pipe is
//! created; the write buffer permanently carries the frame magic in its
//! first four bytes.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use ring::{constant_time, digest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tracing::debug;

use super::deadline::{Deadline, DeadlineWatch};
use super::{Cmd, PipeError, State, BUF_SIZE, FRAME_OVERHEAD, HEADER_LEN, MAGIC, MAX_PAYLOAD, TAG_LEN};
use crate::proxy::Address;

/// Source for pipe identifiers, used only in log lines.
static NEXT_PIPE_ID: AtomicU32 = AtomicU32::new(0);

/// State shared by the two halves of a pipe.
pub(crate) struct Shared {
    state: AtomicU64,
    term: AtomicU8,
    id: u32,
    timeout: Duration,
    pub(crate) deadline: Deadline,
}

impl Shared {
    fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU64::new(State::Idle as u64),
            term: AtomicU8::new(0),
            id: NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed).wrapping_add(1),
            timeout,
            deadline: Deadline::new(),
        })
    }

    pub(crate) fn term(&self) -> u8 {
        self.term.load(Ordering::SeqCst)
    }

    fn bump_term(&self) {
        // wraps modulo 256; the receiver discards by byte equality
        self.term.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u64, Ordering::SeqCst);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.state.load(Ordering::SeqCst) == State::Interrupted as u64
    }

    /// First interrupt per bind wins the InUse -> Interrupted transition.
    pub(crate) fn interrupt_local(&self) -> bool {
        self.state
            .compare_exchange(
                State::InUse as u64,
                State::Interrupted as u64,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Re-arm the transport deadline ahead of an I/O operation. A zero
    /// idle timeout disarms it.
    pub(crate) fn arm_deadline(&self) {
        let at = if self.timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.timeout)
        };
        self.deadline.set(at);
    }
}

impl fmt::Display for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {:04x}, T{}", self.id & 0xffff, self.term())
    }
}

/// Read half: framing decoder plus the scratch buffer it drains into.
pub(crate) struct PipeReader<S> {
    conn: ReadHalf<S>,
    buf: Box<[u8; BUF_SIZE]>,
    /// Payload bytes remaining in the data frame currently being consumed.
    n: usize,
    shared: Arc<Shared>,
    deadline: DeadlineWatch,
}

impl<S: AsyncRead> PipeReader<S> {
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    async fn read_scratch(&mut self, start: usize, end: usize) -> Result<(), PipeError> {
        let Self {
            conn,
            buf,
            deadline,
            ..
        } = self;
        deadline.guard(conn.read_exact(&mut buf[start..end])).await?;
        Ok(())
    }

    async fn check_magic(&mut self) -> Result<(), PipeError> {
        let Self {
            conn,
            buf,
            deadline,
            ..
        } = self;
        let mut filled = 0;
        while filled < MAGIC.len() {
            let n = deadline
                .guard(conn.read(&mut buf[filled..MAGIC.len()]))
                .await?;
            if n == 0 {
                if filled == 0 {
                    return Err(PipeError::Eof);
                }
                return Err(PipeError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        if self.buf[..MAGIC.len()] != MAGIC {
            let mut seen = [0u8; MAGIC.len()];
            seen.copy_from_slice(&self.buf[..MAGIC.len()]);
            return Err(PipeError::InvalidMagic(seen));
        }
        Ok(())
    }

    /// Discard `len` payload bytes of a frame stamped with a stale term.
    async fn drain(&mut self, mut len: usize) -> Result<(), PipeError> {
        while len > 0 {
            let take = len.min(BUF_SIZE);
            self.read_scratch(0, take).await?;
            len -= take;
        }
        Ok(())
    }

    /// Framed read. Returns payload bytes of the current stream, the
    /// header and payload of a handshake frame, or an error. Frames from
    /// previous terms are drained without surfacing.
    pub(crate) async fn read(&mut self, out: &mut [u8]) -> Result<usize, PipeError> {
        self.shared.arm_deadline();
        while self.n == 0 {
            self.check_magic().await?;
            self.read_scratch(0, HEADER_LEN).await?;
            let cmd = self.buf[0];
            let term = self.buf[1];
            let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));

            if cmd < Cmd::Err as u8 && term != self.shared.term() {
                self.drain(len).await?;
                debug!(
                    "[{}] dropping stale frame, term {}, cmd {}",
                    self.shared, term, cmd
                );
                continue;
            }

            match Cmd::from_u8(cmd) {
                Some(Cmd::Close) => return Err(PipeError::Interrupted),
                Some(Cmd::Conn) => {
                    if HEADER_LEN + len > BUF_SIZE || HEADER_LEN + len > out.len() {
                        return Err(PipeError::FrameTooLarge(len));
                    }
                    self.read_scratch(HEADER_LEN, HEADER_LEN + len).await?;
                    out[..HEADER_LEN + len].copy_from_slice(&self.buf[..HEADER_LEN + len]);
                    return Ok(HEADER_LEN + len);
                }
                Some(Cmd::Trans) => self.n = len,
                Some(Cmd::Ping) => continue,
                _ => return Err(PipeError::UnknownCmd(cmd)),
            }
        }

        let want = out.len().min(self.n);
        let Self {
            conn, deadline, ..
        } = self;
        let n = deadline.guard(conn.read(&mut out[..want])).await?;
        if n == 0 {
            return Err(PipeError::Eof);
        }
        self.n -= n;
        Ok(n)
    }
}

/// Write half: framing encoder around its own scratch buffer.
pub(crate) struct PipeWriter<S> {
    pub(crate) conn: WriteHalf<S>,
    buf: Box<[u8; BUF_SIZE]>,
    shared: Arc<Shared>,
    deadline: DeadlineWatch,
}

impl<S: AsyncWrite> PipeWriter<S> {
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// Chunk `data` into data frames of at most [`MAX_PAYLOAD`] bytes,
    /// each issued as a single underlying write.
    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<usize, PipeError> {
        self.shared.arm_deadline();
        let term = self.shared.term();
        for chunk in data.chunks(MAX_PAYLOAD) {
            let len = (chunk.len() as u16).to_be_bytes();
            self.buf[MAGIC.len()] = Cmd::Trans as u8;
            self.buf[MAGIC.len() + 1] = term;
            self.buf[MAGIC.len() + 2] = len[0];
            self.buf[MAGIC.len() + 3] = len[1];
            self.buf[FRAME_OVERHEAD..FRAME_OVERHEAD + chunk.len()].copy_from_slice(chunk);

            let Self {
                conn,
                buf,
                deadline,
                ..
            } = self;
            deadline
                .guard(conn.write_all(&buf[..FRAME_OVERHEAD + chunk.len()]))
                .await?;
        }
        Ok(data.len())
    }

    /// Prefix a command frame with the magic and issue it as one write.
    pub(crate) async fn write_cmd(&mut self, cmd: &[u8]) -> Result<(), PipeError> {
        let mut frame = BytesMut::with_capacity(MAGIC.len() + cmd.len());
        frame.put_slice(&MAGIC);
        frame.put_slice(cmd);
        let Self {
            conn, deadline, ..
        } = self;
        deadline.guard(conn.write_all(&frame)).await?;
        Ok(())
    }

    pub(crate) async fn try_interrupt_remote(&mut self) -> Result<(), PipeError> {
        let term = self.shared.term();
        self.write_cmd(&[Cmd::Close as u8, term, 0, 0]).await?;
        debug!("[{}] interrupt sent to remote", self.shared);
        Ok(())
    }
}

/// One reusable framed tunnel over a single reliable duplex transport.
///
/// A pipe is either idle (owned by the pool) or bound to exactly one
/// end-user stream. After a bind completes cleanly the pipe resets:
/// the term advances and the pipe can serve another stream.
pub struct Pipe<S> {
    pub(crate) reader: PipeReader<S>,
    pub(crate) writer: PipeWriter<S>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) last_active: Instant,
}

impl<S: AsyncRead + AsyncWrite> Pipe<S> {
    /// Wrap a transport in a pipe. A zero `timeout` disables the idle
    /// deadline, which is how the server side runs.
    pub fn new(conn: S, timeout: Duration) -> Self {
        let (rd, wr) = tokio::io::split(conn);
        let shared = Shared::new(timeout);
        let mut write_buf = Box::new([0u8; BUF_SIZE]);
        write_buf[..MAGIC.len()].copy_from_slice(&MAGIC);
        Self {
            reader: PipeReader {
                conn: rd,
                buf: Box::new([0u8; BUF_SIZE]),
                n: 0,
                shared: Arc::clone(&shared),
                deadline: shared.deadline.watch(),
            },
            writer: PipeWriter {
                conn: wr,
                buf: write_buf,
                shared: Arc::clone(&shared),
                deadline: shared.deadline.watch(),
            },
            shared,
            last_active: Instant::now(),
        }
    }

    /// Identifier for log correlation.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Framed read; see [`PipeReader::read`].
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize, PipeError> {
        self.reader.read(out).await
    }

    /// Framed write; the input is chunked into data frames.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, PipeError> {
        self.writer.write(data).await
    }

    /// Send the authenticated handshake naming the target address and
    /// mark the pipe in use. The frame length covers the address plus the
    /// 32-byte tag; the tag is SHA-256 over the framed header, the
    /// address bytes and the shared secret.
    pub async fn handshake(&mut self, addr: &Address, secret: &str) -> Result<(), PipeError> {
        self.shared.set_state(State::InUse);
        let addr_bytes = addr.encode();
        let tagged_len = (addr_bytes.len() + TAG_LEN) as u16;

        let mut cmd = BytesMut::with_capacity(HEADER_LEN + addr_bytes.len() + TAG_LEN);
        cmd.put_u8(Cmd::Conn as u8);
        cmd.put_u8(self.shared.term());
        cmd.put_u16(tagged_len);
        cmd.put_slice(&addr_bytes);

        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&cmd);
        ctx.update(secret.as_bytes());
        cmd.put_slice(ctx.finish().as_ref());

        self.writer.write_cmd(&cmd).await
    }

    /// Wait for a handshake frame, verify its tag against `secret` and
    /// return the target address it names.
    pub async fn wait_for_handshake(&mut self, secret: &str) -> Result<Address, PipeError> {
        self.shared.set_state(State::InUse);
        let mut buf = [0u8; 1024];
        let n = self.reader.read(&mut buf).await?;
        if n < HEADER_LEN || buf[0] != Cmd::Conn as u8 {
            return Err(PipeError::BadHandshake(buf[0]));
        }

        let len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if len < TAG_LEN || HEADER_LEN + len != n {
            return Err(PipeError::AuthFailed);
        }
        let addr_end = HEADER_LEN + len - TAG_LEN;

        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&buf[..addr_end]);
        ctx.update(secret.as_bytes());
        let tag = ctx.finish();
        if constant_time::verify_slices_are_equal(tag.as_ref(), &buf[addr_end..n]).is_err() {
            return Err(PipeError::AuthFailed);
        }

        Ok(Address::decode(&buf[HEADER_LEN..addr_end])?)
    }

    /// Probe the transport. Idle pipes whose remote silently went away
    /// fail here and get discarded before a handshake is attempted.
    pub async fn try_ping(&mut self) -> Result<(), PipeError> {
        let term = self.shared.term();
        self.writer.write_cmd(&[Cmd::Ping as u8, term, 0, 0]).await
    }

    /// Interrupt the stream of the current term on the remote side
    /// without tearing down the pipe.
    pub async fn try_interrupt_remote(&mut self) -> Result<(), PipeError> {
        self.writer.try_interrupt_remote().await
    }

    /// Post-bind transition: refresh the deadline, advance the term and
    /// return to idle. Frames still in flight from the finished stream
    /// carry the old term and will be drained by the receiver.
    pub(crate) fn reset(&mut self) {
        self.shared.arm_deadline();
        self.shared.bump_term();
        self.shared.set_state(State::Idle);
    }

    /// Close the pipe and shut down its transport. The connection is
    /// fully released when the pipe is dropped.
    pub async fn close(mut self) {
        self.shared.set_state(State::Closed);
        let _ = self.writer.conn.shutdown().await;
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}

impl<S> fmt::Display for Pipe<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.shared.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn pipe_pair() -> (Pipe<DuplexStream>, Pipe<DuplexStream>) {
        let (a, b) = duplex(1 << 20);
        (
            Pipe::new(a, Duration::ZERO),
            Pipe::new(b, Duration::ZERO),
        )
    }

    fn raw_frame(cmd: Cmd, term: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        frame.extend_from_slice(&MAGIC);
        frame.push(cmd as u8);
        frame.push(term);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    async fn read_all(pipe: &mut Pipe<DuplexStream>, want: usize) -> Vec<u8> {
        let mut out = vec![0u8; want];
        let mut got = 0;
        while got < want {
            let n = pipe.read(&mut out[got..]).await.unwrap();
            got += n;
        }
        out
    }

    #[tokio::test]
    async fn roundtrip_between_peers() {
        let (mut a, mut b) = pipe_pair();
        let data: Vec<u8> = (0..100_000).map(|i| (i * 31 % 251) as u8).collect();

        let expected = data.clone();
        let writer = async {
            a.write(&data).await.unwrap();
        };
        let reader = async { read_all(&mut b, expected.len()).await };
        let ((), got) = tokio::join!(writer, reader);
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn write_chunks_into_max_sized_frames() {
        let (a, mut b) = duplex(1 << 20);
        let mut pipe = Pipe::new(a, Duration::ZERO);
        let data = vec![0x5a; MAX_PAYLOAD * 2 + 100];

        let total = data.len() + 3 * FRAME_OVERHEAD;
        let writer = async {
            pipe.write(&data).await.unwrap();
        };
        let reader = async {
            let mut wire = vec![0u8; total];
            b.read_exact(&mut wire).await.unwrap();
            wire
        };
        let ((), wire) = tokio::join!(writer, reader);

        // walk the wire image frame by frame
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < wire.len() {
            assert_eq!(&wire[pos..pos + 4], &MAGIC);
            assert_eq!(wire[pos + 4], Cmd::Trans as u8);
            let len = usize::from(u16::from_be_bytes([wire[pos + 6], wire[pos + 7]]));
            frames.push(len);
            pos += FRAME_OVERHEAD + len;
        }
        assert_eq!(frames, vec![MAX_PAYLOAD, MAX_PAYLOAD, 100]);
    }

    #[tokio::test]
    async fn stale_term_frames_are_drained() {
        let (a, mut b) = duplex(1 << 16);
        let mut pipe = Pipe::new(a, Duration::ZERO);

        // a frame from a previous generation followed by a current one
        b.write_all(&raw_frame(Cmd::Trans, 0xff, b"old stream"))
            .await
            .unwrap();
        b.write_all(&raw_frame(Cmd::Trans, 0, b"new stream"))
            .await
            .unwrap();

        let mut out = [0u8; 64];
        let n = pipe.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"new stream");
    }

    #[tokio::test]
    async fn ping_frames_are_skipped() {
        let (a, mut b) = duplex(1 << 16);
        let mut pipe = Pipe::new(a, Duration::ZERO);

        b.write_all(&raw_frame(Cmd::Ping, 0, b"")).await.unwrap();
        b.write_all(&raw_frame(Cmd::Ping, 0, b"")).await.unwrap();
        b.write_all(&raw_frame(Cmd::Trans, 0, b"payload"))
            .await
            .unwrap();

        let mut out = [0u8; 64];
        let n = pipe.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"payload");
    }

    #[tokio::test]
    async fn close_frame_surfaces_as_interrupt() {
        let (a, mut b) = duplex(1 << 16);
        let mut pipe = Pipe::new(a, Duration::ZERO);

        b.write_all(&raw_frame(Cmd::Close, 0, b"")).await.unwrap();

        let mut out = [0u8; 16];
        let err = pipe.read(&mut out).await.unwrap_err();
        assert!(matches!(err, PipeError::Interrupted));
    }

    #[tokio::test]
    async fn bad_magic_is_fatal() {
        let (a, mut b) = duplex(1 << 16);
        let mut pipe = Pipe::new(a, Duration::ZERO);

        b.write_all(&[0xde, 0xad, 0xbe, 0xef, 2, 0, 0, 0])
            .await
            .unwrap();

        let mut out = [0u8; 16];
        let err = pipe.read(&mut out).await.unwrap_err();
        assert!(matches!(err, PipeError::InvalidMagic(_)));
    }

    #[tokio::test]
    async fn unknown_command_is_fatal() {
        let (a, mut b) = duplex(1 << 16);
        let mut pipe = Pipe::new(a, Duration::ZERO);

        let mut frame = Vec::from(MAGIC);
        frame.extend_from_slice(&[0x07, 0, 0, 0]);
        b.write_all(&frame).await.unwrap();

        let mut out = [0u8; 16];
        let err = pipe.read(&mut out).await.unwrap_err();
        assert!(matches!(err, PipeError::UnknownCmd(0x07)));
    }

    #[tokio::test]
    async fn peer_eof_surfaces_cleanly() {
        let (a, b) = duplex(1 << 16);
        let mut pipe = Pipe::new(a, Duration::ZERO);
        drop(b);

        let mut out = [0u8; 16];
        let err = pipe.read(&mut out).await.unwrap_err();
        assert!(matches!(err, PipeError::Eof));
    }

    #[tokio::test]
    async fn handshake_roundtrip() {
        let (mut client, mut server) = pipe_pair();
        let addr = Address::Domain("example.com".to_string(), 443);

        client.handshake(&addr, "shared secret").await.unwrap();
        let got = server.wait_for_handshake("shared secret").await.unwrap();
        assert_eq!(got.to_string(), "example.com:443");
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_secret() {
        let (mut client, mut server) = pipe_pair();
        let addr = Address::Ipv4([127, 0, 0, 1], 8080);

        client.handshake(&addr, "wrong").await.unwrap();
        let err = server.wait_for_handshake("right").await.unwrap_err();
        assert!(matches!(err, PipeError::AuthFailed));
    }

    #[tokio::test]
    async fn handshake_rejects_tampered_address() {
        let (a, mut b) = duplex(1 << 16);
        let mut server = Pipe::new(a, Duration::ZERO);

        // a correctly tagged handshake whose address is flipped afterwards
        let addr = Address::Ipv4([10, 0, 0, 1], 80).encode();
        let mut cmd = vec![
            Cmd::Conn as u8,
            0,
            ((addr.len() + TAG_LEN) >> 8) as u8,
            ((addr.len() + TAG_LEN) & 0xff) as u8,
        ];
        cmd.extend_from_slice(&addr);
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(&cmd);
        ctx.update(b"secret");
        let tag = ctx.finish();
        cmd[5] ^= 0x01;
        cmd.extend_from_slice(tag.as_ref());

        let mut frame = Vec::from(MAGIC);
        frame.extend_from_slice(&cmd);
        b.write_all(&frame).await.unwrap();

        let err = server.wait_for_handshake("secret").await.unwrap_err();
        assert!(matches!(err, PipeError::AuthFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fails_blocked_read() {
        let (a, _b) = duplex(1 << 16);
        let mut pipe = Pipe::new(a, Duration::from_millis(50));

        let mut out = [0u8; 16];
        let err = pipe.read(&mut out).await.unwrap_err();
        match err {
            PipeError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
