use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("Encoded stream is truncated")]
    Truncated,
    #[error("Decoded length {actual} does not match expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Pluggable payload codec used by the disk manager when compression is enabled
pub trait PageCompressor: Send + Sync {
    fn compress(&self, input: &[u8]) -> Vec<u8>;

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>, CompressionError>;
}

/// Run-length encoding as (run length, byte) pairs. Page payloads are mostly
/// zero-filled tails, which this handles well.
#[derive(Debug, Default, Clone, Copy)]
pub struct RleCompressor;

impl PageCompressor for RleCompressor {
    fn compress(&self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len() / 4);
        let mut iter = input.iter().peekable();

        while let Some(&byte) = iter.next() {
            let mut run: u8 = 1;
            while run < u8::MAX && iter.peek() == Some(&&byte) {
                iter.next();
                run += 1;
            }
            out.push(run);
            out.push(byte);
        }
        out
    }

    fn decompress(&self, input: &[u8], expected_len: usize) -> Result<Vec<u8>, CompressionError> {
        if input.len() % 2 != 0 {
            return Err(CompressionError::Truncated);
        }
        let mut out = Vec::with_capacity(expected_len);
        for pair in input.chunks_exact(2) {
            out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
        }
        if out.len() != expected_len {
            return Err(CompressionError::LengthMismatch { expected: expected_len, actual: out.len() });
        }
        Ok(out)
    }
}
