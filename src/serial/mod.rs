//! # Serial Module
//!
//! Line-oriented access to the serial link.
//!
//! - [`port`]: port settings, discovery and the `tokio-serial` backed transport
//! - [`line`]: bounded newline framing over an async byte stream
//! - [`encoding`]: the fixed-layout binary forecast record

pub mod encoding;
pub mod line;
pub mod port;

use crate::error::TransportError;

/// A byte-stream link with line-oriented reads.
///
/// Reads are bounded by a timeout so the caller can check for shutdown
/// between polls. Implementations release the underlying device in
/// [`Transport::close`] and again on drop.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Whether unread bytes are waiting. Never blocks.
    fn has_pending_bytes(&mut self) -> Result<bool, TransportError>;

    /// Reads up to and including the next `\n`.
    ///
    /// Returns `Ok(None)` when the timeout expires first; bytes of an
    /// incomplete line are kept for the next call. A line over the length
    /// cap is dropped and reported as [`TransportError::LineTooLong`].
    async fn read_line(&mut self) -> Result<Option<String>, TransportError>;

    /// Writes the whole buffer and flushes it.
    async fn write_bytes(&mut self, buffer: &[u8]) -> Result<(), TransportError>;

    /// Releases the link. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::Transport;
    use crate::error::TransportError;

    /// Scripted link: replays queued reads and captures writes.
    #[derive(Default)]
    pub struct MemoryTransport {
        pub inbound: VecDeque<Result<String, TransportError>>,
        pub written: Vec<u8>,
        pub closed: bool,
        pub fail_writes: bool,
    }

    impl MemoryTransport {
        pub fn with_lines(lines: &[&str]) -> Self {
            Self {
                inbound: lines.iter().map(|line| Ok(format!("{line}\n"))).collect(),
                ..Self::default()
            }
        }
    }

    impl Transport for MemoryTransport {
        fn has_pending_bytes(&mut self) -> Result<bool, TransportError> {
            if self.closed {
                return Err(TransportError::Closed);
            }
            Ok(!self.inbound.is_empty())
        }

        async fn read_line(&mut self) -> Result<Option<String>, TransportError> {
            match self.inbound.pop_front() {
                Some(Ok(line)) => Ok(Some(line)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }

        async fn write_bytes(&mut self, buffer: &[u8]) -> Result<(), TransportError> {
            if self.fail_writes {
                return Err(TransportError::write("link severed"));
            }
            self.written.extend_from_slice(buffer);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.closed = true;
            Ok(())
        }
    }
}
