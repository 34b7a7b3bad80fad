// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Length-framed codec over the host transport: a 16-byte little-endian
//! header followed by `size - 16` bytes of JSON payload.
//!
//! The codec does no JSON parsing. Reads are performed from a single owner;
//! writes must be serialized by the caller (the bridge dedicates a writer
//! task to this).

use gcs_protocol::MessageHeader;
use gcs_protocol::MessageIdentifier;
use gcs_protocol::MESSAGE_HEADER_SIZE;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("transport read failed")]
    Io(#[source] std::io::Error),
    /// The peer closed the connection at a frame boundary.
    #[error("connection closed by peer")]
    Disconnected,
    #[error("eof in the middle of a frame ({got}/{expected} bytes)")]
    ShortRead { expected: usize, got: usize },
    #[error("frame size {size} exceeds the {max} byte ceiling")]
    OversizedFrame { size: u32, max: usize },
    #[error("frame size {size} is smaller than the message header")]
    UndersizedFrame { size: u32 },
}

/// Reads one frame. Fails with [`FramingError::Disconnected`] on a clean EOF
/// before any header byte, and [`FramingError::ShortRead`] on EOF mid-frame.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame: usize,
) -> Result<(MessageHeader, Vec<u8>), FramingError> {
    let mut header_bytes = [0; MESSAGE_HEADER_SIZE];
    match read_full(reader, &mut header_bytes).await {
        Ok(0) => return Err(FramingError::Disconnected),
        Ok(got) if got < MESSAGE_HEADER_SIZE => {
            return Err(FramingError::ShortRead {
                expected: MESSAGE_HEADER_SIZE,
                got,
            })
        }
        Ok(_) => {}
        Err(err) => return Err(FramingError::Io(err)),
    }
    let header = MessageHeader::read_from_bytes(&header_bytes).unwrap();

    let size = header.size() as usize;
    if size < MESSAGE_HEADER_SIZE {
        return Err(FramingError::UndersizedFrame {
            size: header.size(),
        });
    }
    if size > max_frame {
        return Err(FramingError::OversizedFrame {
            size: header.size(),
            max: max_frame,
        });
    }

    let mut payload = vec![0; size - MESSAGE_HEADER_SIZE];
    match read_full(reader, &mut payload).await {
        Ok(got) if got < payload.len() => Err(FramingError::ShortRead {
            expected: payload.len(),
            got,
        }),
        Ok(_) => Ok((header, payload)),
        Err(err) => Err(FramingError::Io(err)),
    }
}

/// Writes one frame as a single buffer, so a frame is never interleaved with
/// another writer's bytes as long as the stream has one owner.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: MessageIdentifier,
    sequence_id: u64,
    payload: &[u8],
) -> std::io::Result<()> {
    let header = MessageHeader::new(
        id,
        (MESSAGE_HEADER_SIZE + payload.len()) as u32,
        sequence_id,
    );
    let mut frame = Vec::with_capacity(MESSAGE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

async fn read_full<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcs_protocol::MessageType;

    const TEST_CEILING: usize = 0x1000;

    #[tokio::test]
    async fn roundtrip() {
        let (mut host, mut guest) = tokio::io::duplex(0x1000);
        write_frame(
            &mut host,
            MessageIdentifier::NEGOTIATE_PROTOCOL,
            7,
            br#"{"MinimumVersion":4,"MaximumVersion":4}"#,
        )
        .await
        .unwrap();

        let (header, payload) = read_frame(&mut guest, TEST_CEILING).await.unwrap();
        assert_eq!(header.id(), MessageIdentifier::NEGOTIATE_PROTOCOL);
        assert_eq!(header.id().message_type(), MessageType::REQUEST);
        assert_eq!(header.sequence_id(), 7);
        assert_eq!(header.size() as usize, MESSAGE_HEADER_SIZE + payload.len());
        assert_eq!(&payload[..], br#"{"MinimumVersion":4,"MaximumVersion":4}"#);
    }

    #[tokio::test]
    async fn clean_eof_is_disconnected() {
        let (host, mut guest) = tokio::io::duplex(0x1000);
        drop(host);
        let err = read_frame(&mut guest, TEST_CEILING).await.unwrap_err();
        assert!(matches!(err, FramingError::Disconnected));
    }

    #[tokio::test]
    async fn eof_mid_header_is_short_read() {
        let (mut host, mut guest) = tokio::io::duplex(0x1000);
        tokio::io::AsyncWriteExt::write_all(&mut host, &[1, 2, 3])
            .await
            .unwrap();
        drop(host);
        let err = read_frame(&mut guest, TEST_CEILING).await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::ShortRead {
                expected: MESSAGE_HEADER_SIZE,
                got: 3
            }
        ));
    }

    #[tokio::test]
    async fn eof_mid_payload_is_short_read() {
        let (mut host, mut guest) = tokio::io::duplex(0x1000);
        let header = MessageHeader::new(MessageIdentifier::CREATE, 16 + 10, 1);
        tokio::io::AsyncWriteExt::write_all(&mut host, header.as_bytes())
            .await
            .unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut host, &[0; 4])
            .await
            .unwrap();
        drop(host);
        let err = read_frame(&mut guest, TEST_CEILING).await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::ShortRead {
                expected: 10,
                got: 4
            }
        ));
    }

    #[tokio::test]
    async fn undersized_frame_rejected() {
        let (mut host, mut guest) = tokio::io::duplex(0x1000);
        let header = MessageHeader::new(MessageIdentifier::CREATE, 8, 1);
        tokio::io::AsyncWriteExt::write_all(&mut host, header.as_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut guest, TEST_CEILING).await.unwrap_err();
        assert!(matches!(err, FramingError::UndersizedFrame { size: 8 }));
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut host, mut guest) = tokio::io::duplex(0x1000);
        let header = MessageHeader::new(MessageIdentifier::CREATE, 0x2000, 1);
        tokio::io::AsyncWriteExt::write_all(&mut host, header.as_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut guest, TEST_CEILING).await.unwrap_err();
        assert!(matches!(
            err,
            FramingError::OversizedFrame {
                size: 0x2000,
                max: TEST_CEILING
            }
        ));
    }
}
