//! Bind engine
//!
//! Bridges a pipe and a plain TCP socket for the duration of one stream.
//! Two copy loops run concurrently: `read_loop` moves pipe payload to the
//! socket, `write_loop` moves socket bytes into the pipe. The interesting
//! part is the shutdown choreography: a stream ending on one side must
//! half-close the other without tearing down the pipe transport, so the
//! pipe can be reset and reused.
//!
//! The loops never guess where an error came from; each failure is
//! classified by the operation that produced it. Only failures of the
//! pipe transport itself make the bind fail.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use super::deadline::{Deadline, DeadlineWatch};
use super::pipe::{Pipe, PipeReader, PipeWriter};
use super::{PipeError, BUF_SIZE};

/// How long the sibling read loop may keep waiting for the remote's
/// interrupt after the local stream has ended. Normally the remote closes
/// well within this; the deadline only bounds the exit when it never does.
const INTERRUPT_GRACE: Duration = Duration::from_secs(1);

impl<S> Pipe<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    /// Bridge this pipe with a plain TCP socket until the stream ends on
    /// either side. On success the pipe has been reset and can serve the
    /// next stream; on error the pipe transport is unusable and the
    /// caller should close the pipe. The socket is released on every
    /// exit path.
    pub async fn bind(&mut self, sock: TcpStream) -> Result<(), PipeError> {
        let (sock_rd, sock_wr) = sock.into_split();
        let unblock = Deadline::new();
        let sock_watch = unblock.watch();

        let (read_res, write_res) = tokio::join!(
            read_loop(&mut self.reader, sock_wr, &unblock),
            write_loop(&mut self.writer, sock_rd, sock_watch),
        );
        read_res?;
        write_res?;

        self.reset();
        Ok(())
    }
}

/// Copy pipe payload to the local socket until the remote interrupts or
/// the pipe fails.
async fn read_loop<S: AsyncRead>(
    pipe: &mut PipeReader<S>,
    mut sock: OwnedWriteHalf,
    unblock: &Deadline,
) -> Result<(), PipeError> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(n) => {
                if let Err(e) = sock.write_all(&buf[..n]).await {
                    debug!("[{}] read loop: local write failed: {}", pipe.shared(), e);
                    unblock.set(Some(Instant::now()));
                    return Err(PipeError::Transport(e));
                }
            }
            Err(PipeError::Interrupted) => {
                // The remote finished this stream. Kick the sibling loop
                // off its socket read and pass the FIN on to the local
                // peer; the pipe itself stays healthy.
                debug!("[{}] read loop: interrupted by remote", pipe.shared());
                unblock.set(Some(Instant::now()));
                let _ = sock.shutdown().await;
                return Ok(());
            }
            Err(PipeError::Io(e))
                if e.kind() == io::ErrorKind::TimedOut && pipe.shared().is_interrupted() =>
            {
                // The grace deadline armed by the sibling loop after it
                // won the interrupt race. The stream is already over and
                // the remote never echoed its own close; the pipe stays
                // healthy, this is the expected exit.
                debug!("[{}] read loop: grace deadline reached", pipe.shared());
                unblock.set(Some(Instant::now()));
                let _ = sock.shutdown().await;
                return Ok(());
            }
            Err(e) => {
                debug!("[{}] read loop: pipe failed: {}", pipe.shared(), e);
                unblock.set(Some(Instant::now()));
                let _ = sock.shutdown().await;
                return Err(e);
            }
        }
    }
}

/// Copy local socket bytes into the pipe until the local stream ends or
/// the pipe fails.
async fn write_loop<S: AsyncWrite>(
    pipe: &mut PipeWriter<S>,
    mut sock: OwnedReadHalf,
    mut watch: DeadlineWatch,
) -> Result<(), PipeError> {
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = match watch.guard(sock.read(&mut buf)).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // Read-side failures on the local socket, including the
                // wakeup induced by the sibling loop, end the stream the
                // same way a clean EOF does.
                debug!("[{}] write loop: local read finished: {}", pipe.shared(), e);
                break;
            }
        };
        if let Err(e) = pipe.write(&buf[..n]).await {
            debug!("[{}] write loop: pipe failed: {}", pipe.shared(), e);
            pipe.shared().deadline.set(Some(Instant::now()));
            return Err(e);
        }
    }

    // The local stream is done. Whoever wins the interrupt race tells the
    // remote; the grace deadline guarantees the sibling read loop exits
    // even if the remote never answers with its own close.
    if pipe.shared().interrupt_local() {
        pipe.try_interrupt_remote().await?;
    }
    pipe.shared()
        .deadline
        .set(Some(Instant::now() + INTERRUPT_GRACE));
    drop(sock);
    Ok(())
}
