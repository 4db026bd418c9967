//! Line codec for the readiness channel.
//!
//! Wraps [`LinesCodec`] with a maximum line length so a misbehaving backend
//! cannot make the supervisor buffer an unbounded record. A final record
//! without a trailing newline is still delivered when the connection
//! closes.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted record length: 64 KiB.
pub const MAX_SIGNAL_BYTES: usize = 65_536;

/// Newline-delimited record decoder for readiness signals.
#[derive(Debug)]
pub struct SignalCodec(LinesCodec);

impl SignalCodec {
    /// Create a codec with the [`MAX_SIGNAL_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_SIGNAL_BYTES))
    }
}

impl Default for SignalCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SignalCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => AppError::Readiness(format!(
            "signal too long: exceeded {MAX_SIGNAL_BYTES} bytes"
        )),
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
