use std::io::Read;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use thiserror::Error;
use tracing::{debug, warn};

use super::frame::{self, FrameError, FrameHeader};

const BROTLI_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum CascadeError {
    #[error("zlib inflate failed: {0}")]
    Inflate(std::io::Error),
    #[error("brotli decompress failed: {0}")]
    Brotli(std::io::Error),
    #[error("decompressed batch exceeds {0} bytes")]
    TooLarge(usize),
}

/// Bodies recovered from one buffer, in wire order. `error` is set when the
/// scan stopped early on a malformed sub-frame; everything before it is kept.
#[derive(Debug, Default)]
pub struct Batch {
    pub bodies: Vec<Bytes>,
    pub error: Option<FrameError>,
}

/// Decodes the body of one inbound message frame into its application bodies.
pub fn unpack(header: &FrameHeader, body: &[u8], max_size: usize) -> Result<Batch, CascadeError> {
    match header.protocol_version {
        frame::version::DEFLATE => {
            let inflated = inflate(body, max_size)?;
            Ok(depacketize(&inflated))
        }
        frame::version::BROTLI => {
            let decoded = brotli_decode(body, max_size)?;
            Ok(depacketize(&decoded))
        }
        frame::version::PLAIN | frame::version::CONTROL => Ok(single(body)),
        other => {
            debug!("Unknown protocol version {other}, treating body as plain");
            Ok(single(body))
        }
    }
}

fn single(body: &[u8]) -> Batch {
    Batch {
        bodies: vec![Bytes::copy_from_slice(body)],
        error: None,
    }
}

/// Splits a buffer of concatenated frames into their bodies. Nested bodies
/// are emitted as-is; they are never compressed again.
pub fn depacketize(buf: &[u8]) -> Batch {
    let mut batch = Batch::default();
    let mut offset = 0;

    while offset < buf.len() {
        let rest = &buf[offset..];
        let parsed = FrameHeader::decode(rest)
            .and_then(|header| frame::slice_body(rest, &header).map(|body| (header, body)));
        match parsed {
            Ok((header, body)) => {
                batch.bodies.push(Bytes::copy_from_slice(body));
                offset += header.total_size as usize;
            }
            Err(e) => {
                warn!(
                    "Malformed sub-frame at offset {offset}, dropping {} trailing bytes: {e}",
                    rest.len()
                );
                batch.error = Some(e);
                break;
            }
        }
    }

    batch
}

pub fn inflate(data: &[u8], max_size: usize) -> Result<Vec<u8>, CascadeError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(max_size as u64 + 1)
        .read_to_end(&mut out)
        .map_err(CascadeError::Inflate)?;
    check_size(out, max_size)
}

pub fn brotli_decode(data: &[u8], max_size: usize) -> Result<Vec<u8>, CascadeError> {
    let mut out = Vec::new();
    brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE)
        .take(max_size as u64 + 1)
        .read_to_end(&mut out)
        .map_err(CascadeError::Brotli)?;
    check_size(out, max_size)
}

fn check_size(out: Vec<u8>, max_size: usize) -> Result<Vec<u8>, CascadeError> {
    if out.len() > max_size {
        return Err(CascadeError::TooLarge(max_size));
    }
    Ok(out)
}
