//! # Line Module
//!
//! Newline framing over any async byte stream, with a hard cap on how much
//! of an unfinished line is held in memory.

use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{self, Duration};

use crate::error::TransportError;

/// Default longest accepted line, terminator included.
pub const MAX_LINE_LEN: usize = 256;

enum Framed {
    Line,
    TooLong,
    End,
}

/// Buffered line reader. Bytes of an unfinished line survive a timeout;
/// a line longer than the cap is thrown away up to its newline.
pub struct LineReader<S> {
    reader: BufReader<S>,
    partial: Vec<u8>,
    discarding: bool,
    max_line_bytes: usize,
    read_timeout: Duration,
}

impl<S: AsyncRead + Unpin> LineReader<S> {
    pub fn new(stream: S, max_line_bytes: usize, read_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(stream),
            partial: Vec::new(),
            discarding: false,
            max_line_bytes: max_line_bytes.max(1),
            read_timeout,
        }
    }

    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    /// Bytes read from the stream but not yet framed.
    pub fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Length of the unfinished line kept from earlier reads.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }

    /// Reads the next line, terminator included.
    ///
    /// `Ok(None)` means the timeout expired first. An overlong line yields
    /// [`TransportError::LineTooLong`] once; the rest of it is skipped.
    pub async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
        let Self {
            reader,
            partial,
            discarding,
            max_line_bytes,
            read_timeout,
        } = self;
        let limit = *max_line_bytes;

        // Only synchronous state changes follow `fill_buf`, so a timeout
        // never loses bytes.
        let framing = async {
            loop {
                let available = reader.fill_buf().await?;
                if available.is_empty() {
                    return Ok::<_, std::io::Error>(Framed::End);
                }
                let newline = available.iter().position(|b| *b == b'\n');
                let used = newline.map_or(available.len(), |at| at + 1);

                if *discarding {
                    reader.consume(used);
                    if newline.is_some() {
                        *discarding = false;
                        debug!("Skipped the rest of an overlong line");
                    }
                    continue;
                }
                if partial.len() + used > limit {
                    reader.consume(used);
                    partial.clear();
                    *discarding = newline.is_none();
                    return Ok(Framed::TooLong);
                }
                partial.extend_from_slice(&available[..used]);
                reader.consume(used);
                if newline.is_some() {
                    return Ok(Framed::Line);
                }
            }
        };

        let framed = time::timeout(*read_timeout, framing).await;
        match framed {
            Err(_) => {
                debug!("Read timed out with {} bytes buffered", partial.len());
                Ok(None)
            }
            Ok(Err(e)) => Err(TransportError::read(e.to_string())),
            Ok(Ok(Framed::TooLong)) => {
                warn!("Line exceeded {limit} bytes, discarded");
                Err(TransportError::LineTooLong { limit })
            }
            Ok(Ok(Framed::End)) if partial.is_empty() => {
                *discarding = false;
                Err(TransportError::read("serial stream ended"))
            }
            Ok(Ok(Framed::Line | Framed::End)) => {
                let line = String::from_utf8_lossy(partial.as_slice()).into_owned();
                partial.clear();
                Ok(Some(line))
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> LineReader<S> {
    /// Writes the whole buffer to the underlying stream and flushes it.
    pub async fn write_all(&mut self, buffer: &[u8]) -> Result<(), TransportError> {
        let stream = self.reader.get_mut();
        stream
            .write_all(buffer)
            .await
            .map_err(|e| TransportError::write(e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| TransportError::write(e.to_string()))
    }
}
