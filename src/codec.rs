//! Wire frame for a single sample.
//!
//! ```text
//! [0..8)          i64 timestamp, ns since the Unix epoch
//! [8..9)          u8  name length
//! [9..9+len)          name bytes
//! [9+len..17+len) f64 value
//! ```
//!
//! All integers are big-endian and frames are concatenated with no delimiter.

use std::io;

use crate::{Error, MetricKey, Result, Sample};

pub const HEADER_SIZE: usize = 9;
pub const VALUE_SIZE: usize = 8;
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + VALUE_SIZE;
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

pub fn frame_len(name_len: u8) -> usize {
    MIN_FRAME_SIZE + usize::from(name_len)
}

pub fn encode_frame(sample: &Sample) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(MIN_FRAME_SIZE + sample.name.len());
    encode_frame_into(&mut buf, sample)?;
    Ok(buf)
}
pub fn encode_frame_into(buf: &mut Vec<u8>, sample: &Sample) -> Result<()> {
    let name = sample.name.as_bytes();
    let name_len = u8::try_from(name.len()).map_err(|_| Error::NameTooLong(name.len()))?;
    buf.extend_from_slice(&sample.time.to_be_bytes());
    buf.push(name_len);
    buf.extend_from_slice(name);
    buf.extend_from_slice(&sample.value.to_be_bytes());
    Ok(())
}

/// Decodes the frame at the start of `buf`; bytes past the frame are ignored.
pub fn decode_frame(buf: &[u8]) -> Result<Sample> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(Error::MalformedFrame {
            len: buf.len(),
            needed: MIN_FRAME_SIZE,
        });
    }
    let needed = frame_len(buf[HEADER_SIZE - 1]);
    if buf.len() < needed {
        return Err(Error::MalformedFrame {
            len: buf.len(),
            needed,
        });
    }
    let mut time = [0; 8];
    time.copy_from_slice(&buf[..8]);
    let time = i64::from_be_bytes(time);
    let name_end = needed - VALUE_SIZE;
    let name = MetricKey::from(&buf[HEADER_SIZE..name_end]);
    let mut value = [0; VALUE_SIZE];
    value.copy_from_slice(&buf[name_end..needed]);
    let value = f64::from_be_bytes(value);
    Ok(Sample { time, name, value })
}

/// Reads one raw frame into `frame` and returns it.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte. A stream that ends anywhere inside a frame is an `UnexpectedEof`.
pub async fn read_frame<'a, R>(
    rdr: &mut R,
    frame: &'a mut Vec<u8>,
) -> io::Result<Option<&'a [u8]>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    frame.clear();
    frame.resize(HEADER_SIZE, 0);
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = rdr.read(&mut frame[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended {filled} bytes into a frame header"),
            ));
        }
        filled += n;
    }
    let name_len = frame[HEADER_SIZE - 1];
    frame.resize(frame_len(name_len), 0);
    rdr.read_exact(&mut frame[HEADER_SIZE..]).await?;
    Ok(Some(frame.as_slice()))
}
