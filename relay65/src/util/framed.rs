// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames over any async byte stream: a `u32` big-endian
//! length specifier followed by that many content bytes, optionally
//! carrying a JSON payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(thiserror::Error, Debug)]
pub enum FrameReadError {
  #[error("Frame length {received} exceeds limit of {limit} bytes")]
  LengthExceeded { limit: usize, received: usize },
  #[error("Unexpected end of stream while reading frame: {0}")]
  UnexpectedEnd(#[from] std::io::Error),
  #[error("Failure deserializing frame payload: {0}")]
  Deserialization(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum FrameWriteError {
  #[error("Frame write failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Failure serializing frame payload: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub async fn read_frame<S: AsyncRead + Unpin>(
  stream: &mut S,
  limit: usize,
) -> Result<Vec<u8>, FrameReadError> {
  match read_frame_or_eof(stream, limit).await? {
    Some(buffer) => Ok(buffer),
    None => Err(FrameReadError::UnexpectedEnd(std::io::Error::new(
      std::io::ErrorKind::UnexpectedEof,
      "Stream ended before a frame",
    ))),
  }
}

/// Like [`read_frame`], but an end-of-stream landing exactly on a frame
/// boundary is `Ok(None)`. A stream that ends inside the length prefix or
/// inside the content is still an error: the sender was cut off mid-frame,
/// which callers must not mistake for an orderly close.
pub async fn read_frame_or_eof<S: AsyncRead + Unpin>(
  stream: &mut S,
  limit: usize,
) -> Result<Option<Vec<u8>>, FrameReadError> {
  let mut length_bytes = [0u8; 4];
  let mut filled = 0usize;
  while filled < length_bytes.len() {
    let count = stream.read(&mut length_bytes[filled..]).await?;
    if count == 0 {
      if filled == 0 {
        return Ok(None);
      }
      return Err(FrameReadError::UnexpectedEnd(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "Stream ended inside a frame length prefix",
      )));
    }
    filled += count;
  }

  let length = u32::from_be_bytes(length_bytes) as usize;
  if length > limit {
    return Err(FrameReadError::LengthExceeded {
      limit,
      received: length,
    });
  }
  let mut buffer = vec![0u8; length];
  stream.read_exact(buffer.as_mut_slice()).await?;
  Ok(Some(buffer))
}

pub async fn write_frame<S: AsyncWrite + Unpin>(
  stream: &mut S,
  buffer: &[u8],
) -> Result<(), FrameWriteError> {
  stream.write_u32(buffer.len() as u32).await?;
  stream.write_all(buffer).await?;
  stream.flush().await?;
  Ok(())
}

pub async fn read_framed_json<S, T>(stream: &mut S, limit: usize) -> Result<T, FrameReadError>
where
  S: AsyncRead + Unpin,
  T: serde::de::DeserializeOwned,
{
  let buffer = read_frame(stream, limit).await?;
  Ok(serde_json::from_slice::<T>(&buffer)?)
}

pub async fn write_framed_json<S, T>(stream: &mut S, value: &T) -> Result<(), FrameWriteError>
where
  S: AsyncWrite + Unpin,
  T: serde::Serialize,
{
  let buffer = serde_json::to_vec(value)?;
  write_frame(stream, &buffer).await
}
