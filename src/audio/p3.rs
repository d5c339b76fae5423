//! Bundled sound clips: a stream of length-prefixed Opus frames.
//!
//! ```text
//! [type: u8][reserved: u8][payload_size: u16 BE][payload]...
//! ```

use thiserror::Error;

const HEADER_SIZE: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum P3Error {
    /// Header cut short
    #[error("truncated header at offset {0}")]
    TruncatedHeader(usize),
    /// Payload runs past the end of the data
    #[error("payload of {size} bytes at offset {offset} exceeds data")]
    TruncatedPayload { offset: usize, size: usize },
}

/// Split a clip into its Opus frames.
pub fn parse(data: &[u8]) -> Result<Vec<Vec<u8>>, P3Error> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let header = data
            .get(offset..offset + HEADER_SIZE)
            .ok_or(P3Error::TruncatedHeader(offset))?;
        let size = u16::from_be_bytes([header[2], header[3]]) as usize;
        let start = offset + HEADER_SIZE;
        let payload = data
            .get(start..start + size)
            .ok_or(P3Error::TruncatedPayload { offset, size })?;
        frames.push(payload.to_vec());
        offset = start + size;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_parse_frames() {
        let mut data = record(b"abc");
        data.extend(record(b""));
        data.extend(record(&[7u8; 300]));
        let frames = parse(&data).unwrap();
        assert_eq!(frames, vec![b"abc".to_vec(), vec![], vec![7u8; 300]]);
    }

    #[test]
    fn test_empty_clip() {
        assert!(parse(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncation_rejected() {
        let mut data = record(b"abc");
        data.extend_from_slice(&[0, 0, 0]);
        assert_eq!(parse(&data), Err(P3Error::TruncatedHeader(7)));

        let mut data = record(b"abc");
        data.truncate(5);
        assert_eq!(
            parse(&data),
            Err(P3Error::TruncatedPayload { offset: 0, size: 3 })
        );
    }
}
