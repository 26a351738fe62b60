//! Streams in both directions.
//!
//! Server-to-client streams surface as a [`HubStream`], fed by the registry.
//! Client-to-server streams are [`ClientStream`]s attached to a call through
//! [`CallOptions::upload`](super::CallOptions::upload); each one is pumped by
//! its own task under its own stream id.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};
use tracing::{debug, trace};

use super::registry::ItemReceiver;
use super::session::Session;
use super::{cancelled, Inner};
use crate::error::HubError;
use crate::protocol::{CompletionResult, Frame, ProtocolError};

pub(crate) const UPLOAD_CANCELED: &str = "Stream canceled by client.";

/// Items streamed by the server for one `stream` call.
///
/// Yields items in arrival order and ends when the server completes the
/// stream. An error completion, a lost connection or cancellation yields one
/// `Err` and then ends. Dropping the stream early tells the server to stop.
pub struct HubStream<T> {
    id: u64,
    inner: Arc<Inner>,
    session: Arc<Session>,
    items: ItemReceiver,
    canceled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    closed: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    done: bool,
    _uploads: DropGuard,
    _marker: PhantomData<fn() -> T>,
}

impl<T> HubStream<T> {
    pub(crate) fn new(
        id: u64,
        inner: Arc<Inner>,
        session: Arc<Session>,
        items: ItemReceiver,
        cancel: Option<CancellationToken>,
        uploads: DropGuard,
    ) -> Self {
        let closed = session.finished_token().cancelled_owned();
        Self {
            id,
            inner,
            session,
            items,
            canceled: cancel.map(|token| Box::pin(token.cancelled_owned())),
            closed: Some(Box::pin(closed)),
            done: false,
            _uploads: uploads,
            _marker: PhantomData,
        }
    }

    /// The invocation id of this stream.
    pub fn invocation_id(&self) -> String {
        self.id.to_string()
    }

    /// Stops the stream locally and asks the server to stop producing. Safe to
    /// call more than once.
    fn abort(&mut self) {
        self.done = true;
        if self.inner.registry.remove(self.id) {
            debug!(invocation_id = self.id, "Sending CancelInvocation for stream");
            self.session.send_detached(Frame::CancelInvocation {
                invocation_id: self.id.to_string(),
            });
        }
    }
}

impl<T: DeserializeOwned> Stream for HubStream<T> {
    type Item = Result<T, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }

        if let Some(canceled) = this.canceled.as_mut() {
            if canceled.as_mut().poll(cx).is_ready() {
                this.canceled = None;
                this.abort();
                return Poll::Ready(Some(Err(HubError::OperationCanceled)));
            }
        }

        loop {
            match this.items.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(value))) => {
                    return Poll::Ready(Some(
                        serde_json::from_value(value).map_err(HubError::ResultBinding),
                    ))
                }
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }

            // The session may have closed before this stream was registered,
            // in which case nobody will ever settle it.
            let Some(closed) = this.closed.as_mut() else {
                return Poll::Pending;
            };
            if closed.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            this.closed = None;
            if this.inner.registry.remove(this.id) {
                this.done = true;
                return Poll::Ready(Some(Err(HubError::ConnectionClosed(None))));
            }
        }
    }
}

impl<T> Drop for HubStream<T> {
    fn drop(&mut self) {
        if !self.done {
            self.abort();
        }
    }
}

impl<T> std::fmt::Debug for HubStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubStream")
            .field("invocation_id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// A client-to-server stream argument.
pub struct ClientStream {
    items: BoxStream<'static, Result<Value, ProtocolError>>,
}

impl ClientStream {
    /// Uploads every item of `stream`, then completes.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream + Send + 'static,
        S::Item: Serialize,
    {
        Self {
            items: stream
                .map(|item| serde_json::to_value(item).map_err(ProtocolError::from))
                .boxed(),
        }
    }

    /// A stream fed through a bounded channel. Writes suspend while
    /// `capacity` items are waiting to be sent. The stream completes when
    /// every writer is dropped or completed.
    pub fn channel<T>(capacity: usize) -> (ClientStreamWriter<T>, ClientStream)
    where
        T: Serialize + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let items = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (ClientStreamWriter { tx }, ClientStream::new(items))
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream").finish_non_exhaustive()
    }
}

/// Write half of [`ClientStream::channel`].
#[derive(Debug)]
pub struct ClientStreamWriter<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for ClientStreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> ClientStreamWriter<T> {
    pub async fn write(&self, item: T) -> Result<(), HubError> {
        self.tx.send(item).await.map_err(|_| {
            HubError::InvalidOperation("The upload stream is no longer being consumed.".to_string())
        })
    }

    /// Ends the stream once every clone has completed or been dropped.
    pub fn complete(self) {}
}

/// Starts one pump task per upload.
///
/// Uploads stop when `token` fires (the call ended or the session closed) or
/// when the caller's `cancel` token fires; either way the server is told the
/// stream was canceled.
pub(crate) fn spawn_uploads(
    session: &Arc<Session>,
    uploads: Vec<(String, ClientStream)>,
    token: CancellationToken,
    cancel: Option<CancellationToken>,
) {
    for (stream_id, source) in uploads {
        tokio::spawn(run_upload(
            session.clone(),
            stream_id,
            source,
            token.clone(),
            cancel.clone(),
        ));
    }
}

enum Step {
    Sent,
    Exhausted,
}

async fn run_upload(
    session: Arc<Session>,
    stream_id: String,
    mut source: ClientStream,
    token: CancellationToken,
    cancel: Option<CancellationToken>,
) {
    debug!(stream_id = %stream_id, "Starting upload stream");
    let stopped = async {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = cancelled(cancel.as_ref()) => {}
        }
    };
    tokio::pin!(stopped);

    loop {
        let step = async {
            match source.items.next().await {
                Some(Ok(item)) => {
                    let frame = Frame::StreamItem {
                        invocation_id: stream_id.clone(),
                        item,
                    };
                    session.send(frame).await.map(|_| Step::Sent)
                }
                Some(Err(e)) => Err(HubError::Serialization(e)),
                None => Ok(Step::Exhausted),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = &mut stopped => None,
            outcome = step => Some(outcome),
        };

        match outcome {
            Some(Ok(Step::Sent)) => trace!(stream_id = %stream_id, "Sent upload item"),
            Some(Ok(Step::Exhausted)) => {
                debug!(stream_id = %stream_id, "Upload stream completed");
                let _ = session
                    .send(Frame::completion(stream_id, CompletionResult::Void))
                    .await;
                return;
            }
            Some(Err(HubError::Serialization(e))) => {
                session.fail(HubError::Serialization(e));
                return;
            }
            Some(Err(e)) => {
                debug!(stream_id = %stream_id, "Upload stream stopped: {}", e);
                return;
            }
            None => {
                debug!(stream_id = %stream_id, "Upload stream canceled");
                let frame = Frame::completion(
                    stream_id,
                    CompletionResult::Error(UPLOAD_CANCELED.to_string()),
                );
                let _ = session.send(frame).await;
                return;
            }
        }
    }
}
