use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::protocol::Frame;

/// A virtual duplex stream for one multiplexed tunnel connection.
///
/// Reads pull `Data` frames delivered from the control-connection reader
/// loop; writes are turned back into `Data` frames and handed to the single
/// writer task that owns the control socket. This lets the per-connection
/// bridge use the same `tokio::io::copy_bidirectional` shape as a plain
/// TCP-to-TCP proxy even though the "remote" side is actually demultiplexed
/// frames on one shared connection.
pub struct MuxedConn {
    conn_id: u32,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Bytes,
    closed_locally: bool,
}

impl MuxedConn {
    pub fn new(
        conn_id: u32,
        inbound: mpsc::Receiver<Bytes>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            conn_id,
            inbound,
            outbound,
            pending: Bytes::new(),
            closed_locally: false,
        }
    }
}

impl AsyncRead for MuxedConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pending.is_empty() {
            match self.inbound.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => self.pending = bytes,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let take = self.pending.len().min(buf.remaining());
        let chunk = self.pending.split_to(take);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxedConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let conn_id = self.conn_id;
        let frame = Frame::Data(conn_id, Bytes::copy_from_slice(buf));
        match self.outbound.send(frame) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tunnel control connection writer is gone",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if !self.closed_locally {
            self.closed_locally = true;
            let conn_id = self.conn_id;
            let _ = self.outbound.send(Frame::Close(conn_id));
        }
        Poll::Ready(Ok(()))
    }
}
