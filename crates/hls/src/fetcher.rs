// Segment fetcher: drains the discovered-segment stream into a byte sink,
// preserving emission order.

use crate::{HlsError, Segment};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outcome of one fetch loop. A non-zero `failed` count never fails the
/// capture; it is surfaced in the job log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Segments fully copied into the sink.
    pub completed: u64,
    /// Segments skipped after a non-200 response or a short body.
    pub failed: u64,
    /// Total bytes written to the sink.
    pub bytes: u64,
}

/// Downloads every segment from `rx` and appends its bytes to `sink`.
///
/// The sink is shut down exactly once on exit, which is what lets the next
/// pipeline stage observe end-of-input. A transport-level error stops the
/// loop early (the playlist URL has usually rotated and the poller will
/// pick that up on its next cycle); a non-200 status or a short body only
/// skips that one segment.
pub async fn copy_segments<W>(
    mut rx: mpsc::Receiver<Segment>,
    mut sink: W,
    client: reqwest::Client,
) -> Result<FetchReport, HlsError>
where
    W: AsyncWrite + Unpin,
{
    let mut report = FetchReport::default();

    while let Some(segment) = rx.recv().await {
        match fetch_one(&client, &segment, &mut sink).await {
            Ok(copied) => {
                report.completed += 1;
                report.bytes += copied;
            }
            Err(FetchFailure::Skipped(reason)) => {
                warn!(url = %segment.url, %reason, "skipping segment");
                report.failed += 1;
            }
            Err(FetchFailure::Transport(error)) => {
                warn!(url = %segment.url, %error, "segment transport failed, stopping fetch loop");
                report.failed += 1;
                break;
            }
            Err(FetchFailure::Sink(error)) => {
                // The remuxer is gone; nothing more can be written.
                let _ = sink.shutdown().await;
                return Err(HlsError::from(error));
            }
        }
    }

    sink.shutdown().await?;
    info!(
        completed = report.completed,
        failed = report.failed,
        bytes = report.bytes,
        "fetch loop finished"
    );
    Ok(report)
}

enum FetchFailure {
    /// This segment is lost, the capture continues.
    Skipped(String),
    /// The connection itself failed; the loop stops.
    Transport(reqwest::Error),
    /// The sink rejected a write; the capture is over.
    Sink(std::io::Error),
}

async fn fetch_one<W>(
    client: &reqwest::Client,
    segment: &Segment,
    sink: &mut W,
) -> Result<u64, FetchFailure>
where
    W: AsyncWrite + Unpin,
{
    let response = client
        .get(&segment.url)
        .send()
        .await
        .map_err(FetchFailure::Transport)?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(FetchFailure::Skipped(format!("HTTP {status}")));
    }

    let expected = response.content_length();
    let mut copied: u64 = 0;
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                debug!(url = %segment.url, %error, "segment body interrupted");
                return Err(FetchFailure::Skipped(format!("body read: {error}")));
            }
        };
        sink.write_all(&chunk).await.map_err(FetchFailure::Sink)?;
        copied += chunk.len() as u64;
    }

    if let Some(expected) = expected
        && copied < expected
    {
        return Err(FetchFailure::Skipped(format!(
            "short body: {copied} of {expected} bytes"
        )));
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn segment(url: String) -> Segment {
        Segment {
            url,
            elapsed: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn copies_segment_bodies_in_order() {
        let server = MockServer::start().await;
        for (name, body) in [("u1", "aaa"), ("u2", "bb"), ("u3", "cccc")] {
            Mock::given(method("GET"))
                .and(path(format!("/{name}.ts")))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }

        let (tx, rx) = mpsc::channel(10);
        for name in ["u1", "u2", "u3"] {
            tx.send(segment(format!("{}/{name}.ts", server.uri())))
                .await
                .unwrap();
        }
        drop(tx);

        let mut sink = Vec::new();
        let report = copy_segments(rx, &mut sink, reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(sink, b"aaabbcccc");
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(report.bytes, 9);
    }

    #[tokio::test]
    async fn non_200_segment_is_counted_and_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/u1.ts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/u2.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data"))
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(10);
        tx.send(segment(format!("{}/u1.ts", server.uri())))
            .await
            .unwrap();
        tx.send(segment(format!("{}/u2.ts", server.uri())))
            .await
            .unwrap();
        drop(tx);

        let mut sink = Vec::new();
        let report = copy_segments(rx, &mut sink, reqwest::Client::new())
            .await
            .unwrap();

        assert_eq!(sink, b"data");
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn closing_the_channel_shuts_the_sink_down() {
        let (tx, rx) = mpsc::channel::<Segment>(10);
        drop(tx);

        let (sink, mut reader) = tokio::io::duplex(64);
        let copy = tokio::spawn(copy_segments(rx, sink, reqwest::Client::new()));

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
            .await
            .unwrap();
        assert!(out.is_empty());

        let report = copy.await.unwrap().unwrap();
        assert_eq!(report, FetchReport::default());
    }
}
