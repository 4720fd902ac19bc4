use std::io::Cursor;

use crate::error::PipelineError;

pub fn compress(data: &[u8], level: i32) -> Result<Vec<u8>, PipelineError> {
    zstd::stream::encode_all(Cursor::new(data), level)
        .map_err(|e| PipelineError::Compression(format!("zstd encode failed: {}", e)))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, PipelineError> {
    zstd::stream::decode_all(Cursor::new(data))
        .map_err(|e| PipelineError::Corrupt(format!("zstd decode failed: {}", e)))
}
