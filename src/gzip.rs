//! Gzip framing for pre-compressed asset payloads.
//!
//! Every payload uses the fixed header `{1F 8B 08 00 00 00 00 00 00 03}`,
//! a raw deflate stream, then the little-endian crc32 + length trailer,
//! so a generation is reproducible apart from the deflate body itself.

use std::io::{self, Write};

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

/// Mandatory 10-byte member header: deflate, no flags, no mtime, unix.
pub const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03];

/// Compress `raw` into a self-contained gzip member.
pub fn compress(raw: &[u8]) -> io::Result<Vec<u8>> {
    let mut crc = Crc::new();
    crc.update(raw);

    let mut out = Vec::with_capacity(GZIP_HEADER.len() + raw.len() / 2 + 8);
    out.extend_from_slice(&GZIP_HEADER);

    let mut encoder = DeflateEncoder::new(out, Compression::default());
    encoder.write_all(raw)?;
    let mut out = encoder.finish()?;

    out.extend_from_slice(&crc.sum().to_le_bytes());
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn round_trips_byte_for_byte() {
        let raw = b"{\"now\":[1700000000,0],\"score\":{}}\n".repeat(40);
        let zipped = compress(&raw).expect("compress");
        let mut decoder = GzDecoder::new(zipped.as_slice());
        let mut unzipped = Vec::new();
        decoder.read_to_end(&mut unzipped).expect("decode");
        assert_eq!(unzipped, raw);
    }

    #[test]
    fn emits_fixed_header_and_trailer() {
        let raw = b"hello turfwar";
        let zipped = compress(raw).expect("compress");
        assert_eq!(&zipped[..10], &GZIP_HEADER[..]);

        let tail = &zipped[zipped.len() - 8..];
        let mut crc = Crc::new();
        crc.update(raw);
        assert_eq!(&tail[..4], &crc.sum().to_le_bytes());
        assert_eq!(&tail[4..], &(raw.len() as u32).to_le_bytes());
    }

    #[test]
    fn empty_input_is_a_valid_member() {
        let zipped = compress(b"").expect("compress");
        let mut decoder = GzDecoder::new(zipped.as_slice());
        let mut unzipped = Vec::new();
        decoder.read_to_end(&mut unzipped).expect("decode");
        assert!(unzipped.is_empty());
        assert_eq!(&zipped[zipped.len() - 4..], &0u32.to_le_bytes());
    }
}
