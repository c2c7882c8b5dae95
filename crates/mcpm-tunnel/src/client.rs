use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::mux::MuxedConn;
use crate::protocol::Frame;

/// A running tunnel: the publicly reachable URL, and a handle to tear the
/// tunnel down.
pub struct TunnelHandle {
    pub url: String,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Ends the tunnel: aborts the control-connection task, which drops all
    /// per-connection bridge tasks with it.
    pub fn kill(self) {
        self.task.abort();
    }
}

pub struct TunnelClient;

impl TunnelClient {
    /// Opens a control connection to `share_host`, registers the local
    /// `http_port` as the bridge target, and returns the public URL the
    /// remote host assigned.
    ///
    /// Protocol: after connecting, the client sends one newline-terminated
    /// `HELLO <port>` line and reads back one newline-terminated URL line;
    /// the connection then switches to length-delimited framed mode
    /// carrying [`Frame`]s.
    pub async fn start(share_host: SocketAddr, http_port: u16) -> Result<TunnelHandle, TunnelError> {
        let mut stream = TcpStream::connect(share_host)
            .await
            .map_err(|source| TunnelError::Connect {
                addr: share_host.to_string(),
                source,
            })?;

        stream
            .write_all(format!("HELLO {http_port}\n").as_bytes())
            .await?;

        let mut reader = BufReader::new(&mut stream);
        let mut url_line = String::new();
        reader.read_line(&mut url_line).await?;
        let url = url_line.trim().to_string();
        if url.is_empty() {
            return Err(TunnelError::Protocol(
                "share host did not return a public URL".to_string(),
            ));
        }

        let task = tokio::spawn(run_control_loop(stream, http_port));

        Ok(TunnelHandle { url, task })
    }
}

async fn run_control_loop(stream: TcpStream, http_port: u16) {
    let (read_half, write_half) = stream.into_split();
    let mut framed_read = FramedRead::new(read_half, LengthDelimitedCodec::new());
    let framed_write = FramedWrite::new(write_half, LengthDelimitedCodec::new());

    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        let mut framed_write = framed_write;
        while let Some(frame) = writer_rx.recv().await {
            if framed_write.send(frame.encode()).await.is_err() {
                break;
            }
        }
    });

    let inbound_senders: Arc<Mutex<HashMap<u32, mpsc::Sender<Bytes>>>> =
        Arc::new(Mutex::new(HashMap::new()));

    while let Some(Ok(bytes)) = framed_read.next().await {
        let frame = match Frame::decode(bytes.freeze()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "dropping malformed tunnel frame");
                continue;
            }
        };

        match frame {
            Frame::Open(conn_id) => {
                let (tx, rx) = mpsc::channel::<Bytes>(64);
                inbound_senders.lock().expect("poisoned").insert(conn_id, tx);
                let writer_tx = writer_tx.clone();
                tokio::spawn(bridge_connection(conn_id, rx, writer_tx, http_port));
            }
            Frame::Data(conn_id, payload) => {
                let sender = inbound_senders.lock().expect("poisoned").get(&conn_id).cloned();
                if let Some(sender) = sender {
                    if sender.send(payload).await.is_err() {
                        debug!(conn_id, "local bridge for connection already gone");
                    }
                }
            }
            Frame::Close(conn_id) => {
                inbound_senders.lock().expect("poisoned").remove(&conn_id);
            }
        }
    }

    writer_task.abort();
}

async fn bridge_connection(
    conn_id: u32,
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::UnboundedSender<Frame>,
    http_port: u16,
) {
    let local_addr: SocketAddr = ([127, 0, 0, 1], http_port).into();
    let mut local = match TcpStream::connect(local_addr).await {
        Ok(stream) => stream,
        Err(source) => {
            warn!(conn_id, error = %source, "failed to bridge tunnel connection to local port");
            let _ = outbound.send(Frame::Close(conn_id));
            return;
        }
    };

    let mut muxed = MuxedConn::new(conn_id, inbound, outbound.clone());
    if let Err(err) = tokio::io::copy_bidirectional(&mut muxed, &mut local).await {
        debug!(conn_id, error = %err, "tunnel bridge connection ended");
    }
    let _ = outbound.send(Frame::Close(conn_id));
}
