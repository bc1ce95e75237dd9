//! Line codec for agent stdout.
//!
//! Frames on `\n` with [`tokio_util::codec::AnyDelimiterCodec`] and a fixed
//! maximum line length so a misbehaving agent cannot make the reader
//! allocate without bound. Lines are decoded lossily: invalid UTF-8 becomes
//! U+FFFD and the line still reaches the parser, which reports it as a
//! decode failure without ending the stream.
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_conduit::process::codec::OutputLineCodec;
//!
//! let lines = FramedRead::new(child_stdout, OutputLineCodec::new());
//! ```

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};

use crate::{AppError, Result};

/// Maximum accepted line length: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded unit of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A complete line without its trailing newline.
    Line(String),
    /// A line exceeded [`MAX_LINE_BYTES`] and was discarded.
    Oversized,
}

/// Newline-delimited decoder with a [`MAX_LINE_BYTES`] cap.
///
/// Oversized lines are reported as [`OutputLine::Oversized`] rather than as
/// an error so the surrounding `FramedRead` keeps reading; the remainder of
/// the offending line is discarded up to the next newline.
#[derive(Debug)]
pub struct OutputLineCodec(AnyDelimiterCodec);

impl OutputLineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            Vec::new(),
            MAX_LINE_BYTES,
        ))
    }
}

impl Default for OutputLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OutputLineCodec {
    type Item = OutputLine;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        map_decoded(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        map_decoded(self.0.decode_eof(src))
    }
}

fn map_decoded(
    decoded: std::result::Result<Option<Bytes>, AnyDelimiterCodecError>,
) -> Result<Option<OutputLine>> {
    match decoded {
        Ok(chunk) => Ok(chunk.map(|chunk| OutputLine::Line(to_line(&chunk)))),
        Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(OutputLine::Oversized)),
        Err(AnyDelimiterCodecError::Io(io_err)) => Err(AppError::Io(io_err.to_string())),
    }
}

fn to_line(chunk: &[u8]) -> String {
    let chunk = chunk.strip_suffix(b"\r").unwrap_or(chunk);
    String::from_utf8_lossy(chunk).into_owned()
}
