//! Inbound frame decompression.
//!
//! Two schemes are supported. Transport ("zlib-stream") compression keeps
//! one inflate context alive for the whole connection; logical messages are
//! delimited by the 4-byte sync-flush trailer `00 00 FF FF`. Payload
//! ("identify") compression inflates each binary frame independently.

use crate::error::Error;
use flate2::{Decompress, FlushDecompress, Status};
use std::io::Read;
use tracing::trace;

/// Trailer a sync flush appends to every complete logical message.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Output buffer growth step while inflating.
const INFLATE_CHUNK: usize = 16 * 1024;

/// Persistent inflate context for transport-compressed connections.
///
/// Binary frames are appended to an internal buffer; nothing is parsed
/// until a frame arrives that ends with the sync-flush trailer, at which
/// point the accumulated compressed bytes form one complete JSON message.
#[derive(Debug)]
pub struct TransportInflater {
    decompress: Decompress,
    compressed: Vec<u8>,
}

impl TransportInflater {
    /// Create a fresh context. One context per connection; a reconnect
    /// must start over with a new one.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            compressed: Vec::new(),
        }
    }

    /// Feed one binary frame into the context.
    ///
    /// Returns `Ok(Some(bytes))` with a complete decompressed message when
    /// the trailer is present, `Ok(None)` when the message is still
    /// partial and more frames are needed.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.compressed.extend_from_slice(data);

        if !self.compressed.ends_with(&ZLIB_SUFFIX) {
            trace!(
                buffered = self.compressed.len(),
                "partial transport-compressed message buffered"
            );
            return Ok(None);
        }

        let mut output = Vec::with_capacity(INFLATE_CHUNK);
        let mut processed = 0usize;

        loop {
            if output.len() == output.capacity() {
                output.reserve(INFLATE_CHUNK);
            }

            let consumed_before = self.decompress.total_in();
            let status = match self.decompress.decompress_vec(
                &self.compressed[processed..],
                &mut output,
                FlushDecompress::Sync,
            ) {
                Ok(status) => status,
                Err(e) => {
                    // Drop the corrupt message and start the context
                    // over, so later frames do not re-fail on it
                    self.compressed.clear();
                    self.decompress.reset(true);
                    return Err(Error::Decompression(e.to_string()));
                }
            };
            processed += (self.decompress.total_in() - consumed_before) as usize;

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if processed >= self.compressed.len() && output.len() < output.capacity() {
                        break;
                    }
                }
            }
        }

        self.compressed.clear();
        Ok(Some(output))
    }

    /// Bytes currently buffered without a trailer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.compressed.len()
    }
}

impl Default for TransportInflater {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot inflate for payload ("identify") compression.
pub fn inflate_payload(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};
    use std::io::Write;

    /// Compress `input` with a persistent deflate context using sync
    /// flushes, mirroring what the remote endpoint does on the wire.
    struct StreamCompressor(Compress);

    impl StreamCompressor {
        fn new() -> Self {
            Self(Compress::new(Compression::default(), true))
        }

        fn message(&mut self, input: &[u8]) -> Vec<u8> {
            let mut out = Vec::with_capacity(input.len() + 64);
            let before = self.0.total_in();
            loop {
                if out.len() == out.capacity() {
                    out.reserve(64);
                }
                self.0
                    .compress_vec(
                        &input[(self.0.total_in() - before) as usize..],
                        &mut out,
                        FlushCompress::Sync,
                    )
                    .unwrap();
                if (self.0.total_in() - before) as usize == input.len()
                    && out.len() < out.capacity()
                {
                    break;
                }
            }
            out
        }
    }

    #[test]
    fn test_complete_message_inflates() {
        let mut compressor = StreamCompressor::new();
        let mut inflater = TransportInflater::new();

        let wire = compressor.message(br#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
        assert!(wire.ends_with(&ZLIB_SUFFIX));

        let out = inflater.push(&wire).unwrap().expect("complete message");
        assert_eq!(out, br#"{"op":10,"d":{"heartbeat_interval":41250}}"#);
    }

    #[test]
    fn test_partial_frame_buffers_silently() {
        let mut compressor = StreamCompressor::new();
        let mut inflater = TransportInflater::new();

        let wire = compressor.message(br#"{"op":11,"d":null}"#);
        let (head, tail) = wire.split_at(wire.len() / 2);

        assert!(inflater.push(head).unwrap().is_none());
        assert!(inflater.pending() > 0);

        let out = inflater.push(tail).unwrap().expect("complete message");
        assert_eq!(out, br#"{"op":11,"d":null}"#);
        assert_eq!(inflater.pending(), 0);
    }

    #[test]
    fn test_context_persists_across_messages() {
        let mut compressor = StreamCompressor::new();
        let mut inflater = TransportInflater::new();

        // The second message depends on the dictionary built by the first;
        // a fresh context could not inflate it alone.
        let first = compressor.message(br#"{"op":0,"t":"MESSAGE_CREATE","s":1,"d":{}}"#);
        let second = compressor.message(br#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{}}"#);

        assert_eq!(
            inflater.push(&first).unwrap().unwrap(),
            br#"{"op":0,"t":"MESSAGE_CREATE","s":1,"d":{}}"#
        );
        assert_eq!(
            inflater.push(&second).unwrap().unwrap(),
            br#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{}}"#
        );
    }

    #[test]
    fn test_garbage_input_is_an_error() {
        let mut inflater = TransportInflater::new();
        // Ends with the trailer so inflation is attempted, but the body is noise.
        let mut garbage = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x42];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(inflater.push(&garbage).is_err());
    }

    #[test]
    fn test_error_discards_buffered_input() {
        let mut inflater = TransportInflater::new();
        let mut garbage = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x42];
        garbage.extend_from_slice(&ZLIB_SUFFIX);
        assert!(inflater.push(&garbage).is_err());

        // The corrupt bytes must not stay buffered and poison every
        // later frame
        assert_eq!(inflater.pending(), 0);

        let mut compressor = StreamCompressor::new();
        let wire = compressor.message(br#"{"op":11,"d":null}"#);
        assert_eq!(
            inflater.push(&wire).unwrap().unwrap(),
            br#"{"op":11,"d":null}"#
        );
    }

    #[test]
    fn test_one_shot_payload_inflate() {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"op":11,"d":null}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let out = inflate_payload(&compressed).unwrap();
        assert_eq!(out, br#"{"op":11,"d":null}"#);
    }

    #[test]
    fn test_one_shot_payload_garbage() {
        assert!(inflate_payload(&[1, 2, 3, 4]).is_err());
    }
}
