//! Gzip at level 6 for `CompressedOutput` frames.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;

/// Compresses `data`, returning `None` if compression somehow fails (the
/// caller then falls back to an uncompressed Output frame rather than
/// dropping the bytes).
pub fn maybe_compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 16), Compression::new(6));
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_flate2_reader() {
        let input = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let gz = maybe_compress(&input).unwrap();
        assert!(gz.len() < input.len());

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(&gz[..]);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, input);
    }
}
