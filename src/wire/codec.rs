//! Envelope encoding and length-prefixed framing for TCP.

use crate::error::{NetworkError, Result};
use crate::wire::message::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode an envelope to bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(bincode::serialize(envelope)?)
}

/// Decode an envelope from bytes.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope> {
    Ok(bincode::deserialize(data)?)
}

/// Frame an envelope with a length prefix for TCP transmission.
pub fn frame_envelope(envelope: &Envelope) -> Result<Vec<u8>> {
    let data = encode_envelope(envelope)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::Serialization(format!(
            "frame of {} bytes exceeds limit",
            data.len()
        ))
        .into());
    }
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one framed envelope. Returns `None` when the peer closed the
/// stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::ReceiveFailed("message too large".to_string()).into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    decode_envelope(&data).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::lock::{AcquireLockRequest, LockRequest};
    use crate::types::{Binary, NodeAddress};
    use crate::wire::message::Payload;

    fn acquire_envelope() -> Envelope {
        let owner = NodeAddress::local(1);
        let lock = LockRequest::new("cluster", Binary::from_static(b"k"), owner, 7, "worker-7", false);
        let request = AcquireLockRequest::new(lock, Some(250), None, 1_000);
        Envelope::multicast(owner, Payload::AcquireLock(request), true)
    }

    #[test]
    fn test_frame_envelope() {
        let env = acquire_envelope();
        let framed = frame_envelope(&env).unwrap();

        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
        assert_eq!(decode_envelope(&framed[4..]).unwrap(), env);
    }

    #[tokio::test]
    async fn test_read_frames_until_eof() {
        let first = acquire_envelope();
        let second = acquire_envelope();
        let mut stream = frame_envelope(&first).unwrap();
        stream.extend(frame_envelope(&second).unwrap());

        let mut reader = stream.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let bytes = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::ReceiveFailed(_))));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = decode_envelope(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::Serialization(_))));
    }
}
