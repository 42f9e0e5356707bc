//! Framed TCP transport shared by both channel kinds.
//!
//! Reads and writes `Frame`s on any async byte stream. Each connection has
//! exactly one writer task draining an unbounded FIFO, so frames reach the
//! peer in the order they were queued.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use zerocopy::AsBytes;

use sluice_core::wire::{Frame, FramePrefix, PREFIX_LEN};

use crate::delivery::Outbound;
use crate::error::ChannelError;

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// Read the next frame. `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let (kind, header_len, payload_len) = FramePrefix::parse(&prefix)?;

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).await?;

    let mut payload = BytesMut::zeroed(payload_len);
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame::from_parts(kind, &header, payload.freeze())?))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let (prefix, header, payload) = frame.to_parts()?;
    writer.write_all(prefix.as_bytes()).await?;
    writer.write_all(&header).await?;
    if !payload.is_empty() {
        writer.write_all(&payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Spawn the writer task of one connection.
///
/// Exits when every sender is gone, on shutdown, or on the first write
/// error. Frames still queued at that point are dropped, which releases
/// whatever chunk holds they carry.
pub fn spawn_writer<W>(
    mut writer: W,
    mut rx: OutboundRx,
    mut shutdown: broadcast::Receiver<()>,
    peer: String,
) -> tokio::task::JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!(%peer, "writer shutting down");
                    break;
                }

                next = rx.recv() => {
                    let Some(out) = next else {
                        tracing::debug!(%peer, "all senders dropped, writer exiting");
                        break;
                    };
                    // Dropping `out` afterwards releases what it held.
                    if let Err(e) = write_frame(&mut writer, &out.frame).await {
                        tracing::warn!(%peer, error = %e, kind = ?out.frame.kind(), "write failed");
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::wire::{encode_tokens, ConsumerMessage, FrameKind};
    use sluice_core::{BufferSet, DataToken, MetaData};

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);

        let mut buffers = BufferSet::new();
        buffers.push_copy(b"detector frame");
        let chunk = encode_tokens(&[DataToken::new(buffers, MetaData::default())]).unwrap();

        write_frame(
            &mut a,
            &Frame::Consumer(ConsumerMessage::Update {
                instance_id: "reader".into(),
                released: Vec::new(),
            }),
        )
        .await
        .unwrap();
        write_frame(&mut a, &chunk.to_frame()).await.unwrap();
        write_frame(&mut a, &Frame::EndOfStream).await.unwrap();
        drop(a);

        let first = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(first.kind(), FrameKind::Update);
        match read_frame(&mut b).await.unwrap().unwrap() {
            Frame::Payload { payload, .. } => assert_eq!(payload, chunk.payload),
            other => panic!("expected payload, got {:?}", other.kind()),
        }
        assert!(matches!(read_frame(&mut b).await.unwrap(), Some(Frame::EndOfStream)));
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn garbage_is_a_wire_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ChannelError::Wire(_)));
    }
}
