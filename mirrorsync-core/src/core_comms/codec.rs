//! Length-prefixed JSON framing.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON encoding one [`SyncMessage`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ConnectionError;
use crate::core_sync::SyncMessage;

const LENGTH_PREFIX: usize = 4;

/// Serialize `message` into a complete frame, prefix included
pub fn encode_frame(message: &SyncMessage, max_frame_bytes: usize) -> Result<Vec<u8>, ConnectionError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > max_frame_bytes || body.len() > u32::MAX as usize {
        return Err(ConnectionError::FrameTooLarge {
            size: body.len(),
            max: max_frame_bytes,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_frame(body: &[u8]) -> Result<SyncMessage, ConnectionError> {
    Ok(serde_json::from_slice(body)?)
}

/// Read one frame body. `Ok(None)` means the peer closed cleanly between
/// frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>, ConnectionError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_bytes {
        return Err(ConnectionError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_sync::message_types;

    const MAX: usize = 1024 * 1024;

    #[tokio::test]
    async fn test_frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let ping = SyncMessage::ping("s1");
        let unknown = SyncMessage::unsupported("s1", "telemetry");
        write_frame(&mut client, &encode_frame(&ping, MAX).unwrap()).await.unwrap();
        write_frame(&mut client, &encode_frame(&unknown, MAX).unwrap()).await.unwrap();
        drop(client);

        let first = read_frame(&mut server, MAX).await.unwrap().unwrap();
        assert_eq!(decode_frame(&first).unwrap().msg_type, message_types::PING);
        let second = read_frame(&mut server, MAX).await.unwrap().unwrap();
        assert_eq!(decode_frame(&second).unwrap().detail.as_deref(), Some("telemetry"));
        assert!(read_frame(&mut server, MAX).await.unwrap().is_none());
    }

    #[test]
    fn test_prefix_is_big_endian_length() {
        let frame = encode_frame(&SyncMessage::pong("s"), MAX).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&(10_000u32).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server, 100).await.unwrap_err();
        assert!(matches!(err, ConnectionError::FrameTooLarge { size: 10_000, max: 100 }));
    }

    #[test]
    fn test_oversized_message_not_encoded() {
        let mut msg = SyncMessage::ping("s");
        msg.content = Some("x".repeat(4096));
        assert!(matches!(
            encode_frame(&msg, 1024),
            Err(ConnectionError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_body_is_codec_error() {
        assert!(matches!(
            decode_frame(b"{not json"),
            Err(ConnectionError::Codec(_))
        ));
    }
}
