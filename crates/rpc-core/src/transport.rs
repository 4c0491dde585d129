//! Abstract transport (`spec.md` §6): "a full-duplex byte stream with
//! cancellable async read and write of arbitrary lengths, plus optional
//! flush. No framing assumption beyond what the Codec imposes." TCP/TLS/
//! QUIC adapters are out of scope (`spec.md` §1); any `AsyncRead +
//! AsyncWrite` qualifies, including `tokio::io::duplex` for in-process
//! tests.

use tokio::io::{AsyncRead, AsyncWrite};

/// Blanket bound satisfied by any owned, split-free duplex stream a
/// [`crate::processor::Processor`] can drive.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> DuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
