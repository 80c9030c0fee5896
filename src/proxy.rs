//! Bidirectional byte splicing between tunnel endpoints.
//!
//! Each tunnel runs one concurrent copy per direction. EOF on one direction
//! is a normal half-close, not an error; when both directions finish, both
//! endpoints are shut down so no orphan sockets outlive the tunnel. I/O
//! errors are logged and absorbed here so a broken tunnel never takes the
//! session down.

use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Copy bytes in both directions until both sides finish, then close both
/// endpoints.
pub async fn splice<A, B>(mut a: A, mut b: B, label: &str)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::io::copy_bidirectional(&mut a, &mut b).await {
        Ok((out_bytes, in_bytes)) => {
            debug!("{label}: tunnel closed ({out_bytes} bytes out, {in_bytes} bytes in)");
        }
        Err(e) if is_disconnect(&e) => {
            trace!("{label}: tunnel closed by peer: {e}");
        }
        Err(e) => {
            debug!("{label}: tunnel error: {e}");
        }
    }
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_splice_moves_bytes_both_ways() {
        let (client, client_far) = tokio::io::duplex(1024);
        let (server, server_far) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(client_far, server_far, "test"));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();
        let mut got = [0u8; 4];
        server_read.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        server_write.write_all(b"pong").await.unwrap();
        server_write.shutdown().await.unwrap();
        let mut back = Vec::new();
        client_read.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"pong");

        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_splice_closes_peer_on_drop() {
        let (client, client_far) = tokio::io::duplex(1024);
        let (server, server_far) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(client_far, server_far, "test"));

        // Dropping one endpoint must unblock and close the other.
        drop(client);
        let mut server = server;
        let mut sink = Vec::new();
        server.read_to_end(&mut sink).await.unwrap();
        assert!(sink.is_empty());

        task.await.unwrap();
    }
}
