// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-delimited framing: a 2-byte big-endian length followed by that many payload bytes.
//!
//! A stream ending exactly on a frame boundary is reported as [ReadError::EndOfStream];
//! a short read of either the prefix or the body is an error and the stream is
//! considered unusable afterward.

/// Size of the length specifier preceding every frame
pub const LENGTH_PREFIX_SIZE: usize = std::mem::size_of::<u16>();

/// Largest payload representable by the length specifier
pub const MAX_FRAME_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Stream ended between frames")]
  EndOfStream,
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    error: ::std::io::Error,
  },
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
  /// Returned before anything is written, so the stream is left intact
  #[error("Frame of {length} bytes exceeds the 65535 byte length specifier")]
  FrameTooLong { length: usize },
  #[error("Connection closed for writing")]
  Closed,
}

pub async fn read_frame<T: tokio::io::AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  use tokio::io::AsyncReadExt;
  let prefix_error = |error| ReadError::UnexpectedEnd {
    expected: NextExpected::LengthSpecifier,
    error,
  };
  let high = match s.read_u8().await {
    Ok(byte) => byte,
    Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
      return Err(ReadError::EndOfStream)
    }
    Err(error) => return Err(prefix_error(error)),
  };
  let low = s.read_u8().await.map_err(prefix_error)?;
  let length = u16::from_be_bytes([high, low]) as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

pub async fn write_frame<T: tokio::io::AsyncWrite + Unpin>(
  mut s: T,
  buffer: &[u8],
) -> Result<(), WriteError> {
  use tokio::io::AsyncWriteExt;
  if buffer.len() > MAX_FRAME_LENGTH {
    return Err(WriteError::FrameTooLong {
      length: buffer.len(),
    });
  }
  s.write_u16(buffer.len() as u16).await?;
  s.write_all(buffer).await?;
  Ok(s.flush().await?)
}
