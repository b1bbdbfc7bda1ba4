use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::http::StatusCode;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tracing::{error, info, warn};

type UpstreamStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Upstream body on its way to the caller.
///
/// Owns the upstream response, so dropping it (the caller went away) also
/// releases the upstream connection. Every outcome is logged once.
pub struct Relay {
    inner: UpstreamStream,
    path: String,
    status: StatusCode,
    expected: Option<u64>,
    bytes: u64,
    finished: bool,
}

impl Relay {
    /// `expected` is the origin's declared content length, if any. The server
    /// may stop polling once that many bytes went out.
    pub fn new<S>(
        inner: S,
        path: impl Into<String>,
        status: StatusCode,
        expected: Option<u64>,
    ) -> Self
    where
        S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            path: path.into(),
            status,
            expected,
            bytes: 0,
            finished: false,
        }
    }

    fn complete(&mut self) {
        self.finished = true;
        info!(
            path = %self.path,
            bytes = self.bytes,
            status = self.status.as_u16(),
            "Proxied request"
        );
    }
}

impl Stream for Relay {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes += chunk.len() as u64;
                let sent = self.bytes;
                if self.expected.is_some_and(|expected| sent >= expected) {
                    self.complete();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finished = true;
                error!(
                    path = %self.path,
                    bytes = self.bytes,
                    timeout = e.is_timeout(),
                    "Failed to copy response body: {}",
                    e
                );
                Poll::Ready(Some(Err(io::Error::other(e))))
            }
            Poll::Ready(None) => {
                self.complete();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                path = %self.path,
                bytes = self.bytes,
                "Caller went away, abandoning upstream transfer"
            );
        }
    }
}
