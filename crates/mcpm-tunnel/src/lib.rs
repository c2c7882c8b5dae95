//! Outbound tunnel client: bridges a publicly reachable share-host
//! connection to a local MCP HTTP endpoint.

mod client;
mod error;
mod mux;
mod protocol;

pub use client::{TunnelClient, TunnelHandle};
pub use error::TunnelError;
pub use protocol::Frame;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

    /// A minimal fake share host: accepts one control connection, replies
    /// with a fixed URL, then echoes a single `Open`/`Data`/`Close`
    /// sequence back at the client to exercise the bridge.
    #[tokio::test]
    async fn start_reads_assigned_url_and_bridges_one_exchange() {
        let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control_addr = control_listener.local_addr().unwrap();

        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_port = http_listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = http_listener.accept().await {
                let mut buf = [0u8; 5];
                let _ = sock.read_exact(&mut buf).await;
                let _ = sock.write_all(b"world").await;
            }
        });

        let server = tokio::spawn(async move {
            let (mut sock, _) = control_listener.accept().await.unwrap();
            let mut reader = tokio::io::BufReader::new(&mut sock);
            let mut hello = String::new();
            tokio::io::AsyncBufReadExt::read_line(&mut reader, &mut hello)
                .await
                .unwrap();
            assert!(hello.starts_with("HELLO"));
            sock.write_all(b"https://example.tunnel/abcd\n").await.unwrap();

            let (read_half, write_half) = sock.into_split();
            let mut framed_read = FramedRead::new(read_half, LengthDelimitedCodec::new());
            let mut framed_write = FramedWrite::new(write_half, LengthDelimitedCodec::new());

            framed_write.send(Frame::Open(1).encode()).await.unwrap();
            framed_write
                .send(Frame::Data(1, Bytes::from_static(b"hello")).encode())
                .await
                .unwrap();

            // Read back the echoed response and close.
            while let Some(Ok(bytes)) = framed_read.next().await {
                if let Ok(Frame::Data(_, payload)) = Frame::decode(bytes.freeze()) {
                    assert_eq!(&payload[..], b"world");
                    break;
                }
            }
            framed_write.send(Frame::Close(1).encode()).await.unwrap();
        });

        let handle = TunnelClient::start(control_addr, http_port).await.unwrap();
        assert_eq!(handle.url, "https://example.tunnel/abcd");

        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("fake share host timed out")
            .unwrap();

        handle.kill();
    }

    #[tokio::test]
    async fn start_errors_when_connect_fails() {
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = TunnelClient::start(addr, 8080).await;
        assert!(result.is_err());
    }
}
