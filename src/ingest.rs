//! Per-connection frame reader.

use std::io;

use tokio::io::{AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::{
    accumulator::Accumulator,
    codec::{decode_frame, read_frame, MAX_NAME_LEN, MIN_FRAME_SIZE},
    Result,
};

#[derive(Debug)]
pub enum CloseReason {
    /// Peer closed the stream on a frame boundary.
    Eof,
    /// Short read or transport error; any partial frame is lost.
    Error(io::Error),
}

#[derive(Debug)]
pub struct IngestReport {
    pub frames: u64,
    pub rejected: u64,
    pub close: CloseReason,
}

/// Decodes one complete frame and records it.
pub fn record_frame(accumulator: &Accumulator, frame: &[u8]) -> Result<()> {
    let sample = decode_frame(frame)?;
    accumulator.record(sample);
    Ok(())
}

/// Reads frames until the stream ends, recording each one.
///
/// A frame that fails to decode is logged and skipped; only the end of the
/// stream or a read error stops the loop.
pub async fn ingest<R>(rdr: R, accumulator: &Accumulator) -> IngestReport
where
    R: AsyncRead + Unpin,
{
    let mut rdr = BufReader::new(rdr);
    let mut buf = Vec::with_capacity(MIN_FRAME_SIZE + MAX_NAME_LEN);
    let mut frames = 0;
    let mut rejected = 0;
    let close = loop {
        let frame = match read_frame(&mut rdr, &mut buf).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break CloseReason::Eof,
            Err(e) => break CloseReason::Error(e),
        };
        match record_frame(accumulator, frame) {
            Ok(()) => frames += 1,
            Err(e) => {
                rejected += 1;
                warn!(error = %e, "dropping frame");
            }
        }
    };
    match &close {
        CloseReason::Eof => debug!(frames, rejected, "connection closed"),
        CloseReason::Error(e) => warn!(error = %e, frames, rejected, "connection aborted"),
    }
    IngestReport {
        frames,
        rejected,
        close,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        codec::{encode_frame, encode_frame_into},
        Error, Sample,
    };

    #[tokio::test]
    async fn test_single_frame() {
        let acc = Accumulator::new();
        let sample = Sample::new(1_700_000_000_000_000_000, "cpu_usage", 75.5);
        let stream = encode_frame(&sample).unwrap();
        let report = ingest(&stream[..], &acc).await;
        assert_eq!(report.frames, 1);
        assert!(matches!(report.close, CloseReason::Eof));
        assert_eq!(acc.pending_count(), 1);
        assert_eq!(acc.bucket_len("cpu_usage"), 1);
    }

    #[tokio::test]
    async fn test_three_bytes_only() {
        let acc = Accumulator::new();
        let err = record_frame(&acc, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame { len: 3, .. }));
        assert_eq!(acc.pending_count(), 0);

        let report = ingest(&[1u8, 2, 3][..], &acc).await;
        assert_eq!(report.frames, 0);
        assert!(matches!(
            report.close,
            CloseReason::Error(ref e) if e.kind() == io::ErrorKind::UnexpectedEof
        ));
        assert_eq!(acc.pending_count(), 0);
        assert_eq!(acc.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_non_utf8_names_keep_separate_buckets() {
        let acc = Accumulator::new();
        let mut stream = encode_frame(&Sample::new(1, vec![0xffu8], 1.0)).unwrap();
        encode_frame_into(&mut stream, &Sample::new(2, vec![0xfeu8], 2.0)).unwrap();
        let report = ingest(&stream[..], &acc).await;
        assert_eq!(report.frames, 2);
        assert_eq!(acc.bucket_count(), 2);
        assert_eq!(acc.bucket_len([0xffu8]), 1);
        assert_eq!(acc.bucket_len([0xfeu8]), 1);
    }

    #[tokio::test]
    async fn test_truncated_tail_keeps_earlier_frames() {
        let acc = Accumulator::new();
        let mut stream = vec![];
        for i in 0..10 {
            encode_frame_into(&mut stream, &Sample::new(i, "seq", i as f64)).unwrap();
        }
        stream.extend_from_slice(&[0; 12]);
        let report = ingest(&stream[..], &acc).await;
        assert_eq!(report.frames, 10);
        assert!(matches!(report.close, CloseReason::Error(_)));

        let snapshot = acc.drain_all();
        let times: Vec<_> = snapshot.get("seq").unwrap().iter().map(|s| s.time).collect();
        assert_eq!(times, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_two_connections() {
        let acc = Arc::new(Accumulator::new());
        let mut tasks = vec![];
        for conn in 0..2 {
            let (mut client, server) = tokio::io::duplex(64);
            let acc = acc.clone();
            tasks.push(tokio::spawn(async move { ingest(server, &acc).await }));
            tokio::spawn(async move {
                for i in 0..50 {
                    let sample = Sample::new(i, format!("conn{conn}.metric{i}"), i as f64);
                    client.write_all(&encode_frame(&sample).unwrap()).await.unwrap();
                }
            });
        }
        for task in tasks {
            let report = task.await.unwrap();
            assert_eq!(report.frames, 50);
            assert!(matches!(report.close, CloseReason::Eof));
        }
        assert_eq!(acc.pending_count(), 100);
        assert_eq!(acc.bucket_count(), 100);
        assert_eq!(acc.drain_all().len(), 100);
    }
}
