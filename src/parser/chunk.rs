//! Reading chunked request bodies.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncReadExt};

use crate::parser::error::Error;
use crate::parser::request::BodyReader;

/// A chunk of data read from a request with `Transfer-Encoding: chunked`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Chunk {
    /// The chunk payload, `None` for the terminating chunk.
    pub data: Option<Vec<u8>>,
    /// Declared length of the chunk.
    pub length: usize,
    /// Whether this is the zero-length chunk that ends the body.
    pub is_final_chunk: bool,
    /// Anything after `;` on the length line.
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    ReadingLengthLine,
    ReadingChunkData,
    ReadingTrailingCrlf,
    Done,
}

/// Pulls chunks off the connection one at a time.
///
/// The reader is finite and not restartable: once the zero-length chunk has been
/// returned every further call fails with [`Error::ChunkStreamFinished`].
pub struct ChunkReader {
    reader: BodyReader,
    state: ChunkState,
}

impl ChunkReader {
    pub fn new(reader: BodyReader) -> Self {
        Self {
            reader,
            state: ChunkState::ReadingLengthLine,
        }
    }

    /// Whether the terminating chunk has been read.
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Read the next chunk.
    pub async fn read_chunk(&mut self) -> Result<Chunk, Error> {
        if self.state == ChunkState::Done {
            return Err(Error::ChunkStreamFinished);
        }

        let mut chunk = Chunk::default();

        // Length line: hex digits, optionally followed by ";metadata"
        self.state = ChunkState::ReadingLengthLine;
        let line = self.read_line().await?;
        let line = line.trim();
        let (length, metadata) = match line.split_once(';') {
            Some((length, metadata)) => (length.trim(), Some(metadata.trim().to_string())),
            None => (line, None),
        };
        chunk.length = usize::from_str_radix(length, 16)
            .map_err(|_| Error::InvalidChunkLength(line.to_string()))?;
        chunk.metadata = metadata;

        self.state = ChunkState::ReadingChunkData;
        if chunk.length > 0 {
            let mut data = Vec::new();
            let read = (&mut self.reader)
                .take(chunk.length as u64)
                .read_to_end(&mut data)
                .await?;
            if read != chunk.length {
                return Err(Error::ChunkLengthMismatch {
                    expected: chunk.length,
                    read,
                });
            }
            chunk.data = Some(data);
        } else {
            chunk.is_final_chunk = true;
        }

        self.state = ChunkState::ReadingTrailingCrlf;
        if chunk.is_final_chunk {
            // Skip any trailer fields up to the blank line
            loop {
                let line = self.read_line().await?;
                if line.trim().is_empty() {
                    break;
                }
            }
            self.state = ChunkState::Done;
        } else {
            self.read_line().await?;
            self.state = ChunkState::ReadingLengthLine;
        }

        Ok(chunk)
    }

    /// Hand back the underlying reader.
    pub fn into_inner(self) -> BodyReader {
        self.reader
    }

    async fn read_line(&mut self) -> Result<String, Error> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            )));
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}
