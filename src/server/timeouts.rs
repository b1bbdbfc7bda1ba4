//! Connection-level deadlines that hyper does not provide on its own.
//!
//! Header reads are bounded by hyper's `header_read_timeout`. This module adds
//! the write deadline for response bodies and the idle watchdog for
//! keep-alive connections.

use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    middleware::Next,
    response::Response,
    BoxError,
};
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::warn;

/// Gives each streamed response `limit` to finish writing its body, counted
/// from the moment the request is dispatched. Bodies of known size are already
/// in memory and keep their length.
pub async fn write_deadline(
    State(limit): State<Duration>,
    request: Request,
    next: Next,
) -> Response {
    let deadline = Instant::now() + limit;
    let response = next.run(request).await;
    if response.body().size_hint().exact().is_some() {
        return response;
    }

    let (parts, body) = response.into_parts();
    Response::from_parts(
        parts,
        Body::from_stream(Deadline::new(body.into_data_stream(), deadline)),
    )
}

/// Body stream that fails with `TimedOut` once its deadline has passed.
pub struct Deadline<S> {
    inner: S,
    sleep: Pin<Box<Sleep>>,
    expired: bool,
}

impl<S> Deadline<S> {
    pub fn new(inner: S, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: Box::pin(sleep_until(deadline)),
            expired: false,
        }
    }
}

impl<S, E> Stream for Deadline<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    type Item = Result<Bytes, BoxError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.expired {
            return Poll::Ready(None);
        }

        if self.sleep.as_mut().poll(cx).is_ready() {
            self.expired = true;
            warn!("Write timeout elapsed, aborting response body");
            let err = io::Error::new(io::ErrorKind::TimedOut, "write timeout elapsed");
            return Poll::Ready(Some(Err(err.into())));
        }

        self.inner
            .poll_next_unpin(cx)
            .map(|item| item.map(|chunk| chunk.map_err(Into::into)))
    }
}

/// Tracks when a connection last started a request.
pub struct ConnectionActivity {
    last_request: Mutex<Instant>,
}

impl ConnectionActivity {
    pub fn new() -> Self {
        Self {
            last_request: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_request.lock() = Instant::now();
    }

    /// Resolves once no request has started for `limit`.
    pub async fn idle_for(&self, limit: Duration) {
        loop {
            let deadline = *self.last_request.lock() + limit;
            sleep_until(deadline).await;
            if self.last_request.lock().elapsed() >= limit {
                return;
            }
        }
    }
}

impl Default for ConnectionActivity {
    fn default() -> Self {
        Self::new()
    }
}
