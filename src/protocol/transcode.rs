use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};

use super::http1::HttpRequest;

pub const FRAME_HEADER_LEN: usize = 5;
pub const FLAG_PLAIN: u8 = 0x00;
pub const FLAG_COMPRESSED: u8 = 0x01;

/// Converts parsed requests into the backend's binary framing.
pub trait Transcoder {
    /// `[u32 BE length][u8 flag][payload]`
    fn encode_frame(&self, request: &HttpRequest) -> Result<Vec<u8>>;
    /// Wrap `data` in a gzip container.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Length-prefixed framing with a `path:body` payload, optionally gzipped
/// above `compress_above` bytes.
#[derive(Debug, Clone)]
pub struct FrameTranscoder {
    level: Compression,
    compress_above: Option<usize>,
}

impl Default for FrameTranscoder {
    fn default() -> Self {
        Self {
            level: Compression::default(),
            compress_above: None,
        }
    }
}

impl FrameTranscoder {
    pub fn new(level: u32, compress_above: Option<usize>) -> Self {
        Self {
            level: Compression::new(level.min(9)),
            compress_above,
        }
    }

    /// Split a frame back into its flag and (decompressed) payload.
    pub fn decode_frame(&self, frame: &[u8]) -> Result<(u8, Vec<u8>)> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(Error::Transcode(format!("short frame: {} bytes", frame.len())));
        }
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let flag = frame[4];
        let payload = &frame[FRAME_HEADER_LEN..];
        if payload.len() != len {
            return Err(Error::Transcode(format!(
                "frame declares {len} bytes, carries {}",
                payload.len()
            )));
        }
        match flag {
            FLAG_PLAIN => Ok((flag, payload.to_vec())),
            FLAG_COMPRESSED => Ok((flag, self.decompress(payload)?)),
            other => Err(Error::Transcode(format!("unknown frame flag {other:#04x}"))),
        }
    }
}

impl Transcoder for FrameTranscoder {
    fn encode_frame(&self, request: &HttpRequest) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(request.path.len() + 1 + request.body.len());
        data.extend_from_slice(request.path.as_bytes());
        data.push(b':');
        data.extend_from_slice(&request.body);

        let (flag, payload) = match self.compress_above {
            Some(limit) if data.len() > limit => (FLAG_COMPRESSED, self.compress(&data)?),
            _ => (FLAG_PLAIN, data),
        };
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Transcode(format!("payload too large: {} bytes", payload.len())))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.push(flag);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut enc = GzEncoder::new(Vec::new(), self.level);
        enc.write_all(data)
            .map_err(|e| Error::Transcode(format!("gzip: {e}")))?;
        enc.finish()
            .map_err(|e| Error::Transcode(format!("gzip: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::Transcode(format!("gunzip: {e}")))?;
        Ok(out)
    }
}
