//! Connection lifecycle and reconnect state machine.
//!
//! All transitions happen under `Inner::connection_lock`, so a start, a stop,
//! the handling of a lost session and a reconnect attempt never interleave.
//! The state itself sits behind a short synchronous lock so it can be read
//! from anywhere.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::ConnectionEvent;
use super::retry::RetryContext;
use super::session::{self, CloseReason, Session};
use super::{HubConnectionState, Inner};
use crate::error::HubError;
use crate::handshake;

const START_INVALID: &str =
    "The HubConnection cannot be started if it is not in the Disconnected state.";

pub(super) struct Lifecycle {
    pub(super) state: HubConnectionState,
    session: Option<Arc<Session>>,
    /// Canceled by `stop` to abort a pending start or reconnect.
    stop_token: CancellationToken,
}

impl Lifecycle {
    pub(super) fn new() -> Self {
        Self {
            state: HubConnectionState::Disconnected,
            session: None,
            stop_token: CancellationToken::new(),
        }
    }
}

impl Inner {
    pub(super) fn connection_id(&self) -> Option<String> {
        let lifecycle = self.lifecycle.lock();
        match (lifecycle.state, &lifecycle.session) {
            (HubConnectionState::Connected, Some(session)) => session.connection_id.clone(),
            _ => None,
        }
    }

    pub(super) fn active_session(&self, method: &str) -> Result<Arc<Session>, HubError> {
        let lifecycle = self.lifecycle.lock();
        match (lifecycle.state, &lifecycle.session) {
            (HubConnectionState::Connected, Some(session)) => Ok(session.clone()),
            _ => Err(HubError::not_active(method)),
        }
    }

    /// Transport connect, handshake, then the session tasks.
    async fn connect_once(self: &Arc<Self>) -> Result<Arc<Session>, HubError> {
        let mut connection = self
            .transport
            .connect(self.protocol.transfer_format())
            .await?;
        debug!(connection_id = ?connection.connection_id, "Transport connected");
        let buffer = handshake::perform(
            &mut connection,
            self.protocol.as_ref(),
            self.options.handshake_timeout,
        )
        .await?;
        Ok(session::spawn(self, connection, buffer))
    }

    pub(super) async fn start(self: &Arc<Self>) -> Result<(), HubError> {
        let _guard = self.connection_lock.lock().await;
        let stop_token = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != HubConnectionState::Disconnected {
                return Err(HubError::InvalidOperation(START_INVALID.to_string()));
            }
            lifecycle.state = HubConnectionState::Connecting;
            lifecycle.stop_token = CancellationToken::new();
            lifecycle.stop_token.clone()
        };
        info!("Starting HubConnection.");

        let attempt = tokio::select! {
            biased;
            _ = stop_token.cancelled() => Err(HubError::OperationCanceled),
            result = self.connect_once() => result,
        };

        let mut lifecycle = self.lifecycle.lock();
        match attempt {
            Ok(session) => {
                info!(connection_id = ?session.connection_id, "HubConnection started.");
                lifecycle.state = HubConnectionState::Connected;
                lifecycle.session = Some(session);
                Ok(())
            }
            Err(e) => {
                error!("Failed to start the connection: {}", e);
                lifecycle.state = HubConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    pub(super) async fn stop(self: &Arc<Self>) -> Result<(), HubError> {
        self.lifecycle.lock().stop_token.cancel();
        let guard = self.connection_lock.lock().await;

        let session = {
            let mut lifecycle = self.lifecycle.lock();
            let state = lifecycle.state;
            match state {
                HubConnectionState::Connected => match lifecycle.session.clone() {
                    Some(session) => session,
                    None => return Ok(()),
                },
                HubConnectionState::Reconnecting => {
                    lifecycle.state = HubConnectionState::Disconnected;
                    drop(lifecycle);
                    info!("Connection stopped during reconnect.");
                    self.events.emit(ConnectionEvent::Closed(None));
                    return Ok(());
                }
                HubConnectionState::Disconnected
                | HubConnectionState::Connecting
                | HubConnectionState::Disposed => return Ok(()),
            }
        };

        info!("Stopping HubConnection.");
        session.close(None, false);
        drop(guard);
        session.finished().await;
        Ok(())
    }

    pub(super) async fn dispose(self: &Arc<Self>) -> Result<(), HubError> {
        loop {
            self.stop().await?;
            let _guard = self.connection_lock.lock().await;
            let mut lifecycle = self.lifecycle.lock();
            // A Closed handler may have started the connection again.
            if matches!(
                lifecycle.state,
                HubConnectionState::Disconnected | HubConnectionState::Disposed
            ) {
                lifecycle.state = HubConnectionState::Disposed;
                return Ok(());
            }
        }
    }

    /// Called by the receive loop once its session has ended.
    ///
    /// Settles every pending call before any event is raised, then either
    /// closes for good or starts reconnecting.
    pub(super) async fn handle_close(self: &Arc<Self>, session: &Arc<Session>, reason: CloseReason) {
        let _guard = self.connection_lock.lock().await;
        let stop_token = {
            let mut lifecycle = self.lifecycle.lock();
            let current = lifecycle
                .session
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, session));
            if !current {
                debug!("Ignoring close of an inactive session");
                return;
            }
            lifecycle.session = None;
            lifecycle.stop_token.clone()
        };

        let CloseReason {
            error,
            allow_reconnect,
        } = reason;
        let cause = error.map(Arc::new);
        let settled = self.registry.close_all(cause.clone());
        if !settled.is_empty() {
            debug!(?settled, "Settled pending invocations after close");
        }

        let stop_requested = stop_token.is_cancelled();
        let first_delay = match (&cause, &self.retry_policy) {
            (Some(cause), Some(policy)) if allow_reconnect && !stop_requested => {
                policy.next_retry_delay(&RetryContext {
                    previous_retry_count: 0,
                    elapsed: Duration::ZERO,
                    retry_reason: cause.clone(),
                })
            }
            _ => None,
        };

        match (first_delay, cause) {
            (Some(delay), Some(cause)) => {
                self.lifecycle.lock().state = HubConnectionState::Reconnecting;
                warn!("Connection lost, reconnecting: {}", cause);
                self.events.emit(ConnectionEvent::Reconnecting(cause.clone()));
                tokio::spawn(self.clone().reconnect(cause, delay, stop_token));
            }
            (_, cause) => {
                let cause = if stop_requested { None } else { cause };
                match &cause {
                    Some(e) => error!("HubConnection closed with an error: {}", e),
                    None => info!("HubConnection stopped."),
                }
                self.mark_closed(cause);
            }
        }
    }

    /// Reconnect attempts, one at a time, until one succeeds, the policy gives
    /// up, the server rejects the handshake or `stop` is called.
    async fn reconnect(
        self: Arc<Self>,
        reason: Arc<HubError>,
        first_delay: Duration,
        stop_token: CancellationToken,
    ) {
        let started = Instant::now();
        let mut previous_retry_count = 0u32;
        let mut last_error = reason;
        let mut next_delay = Some(first_delay);

        while let Some(delay) = next_delay {
            info!(
                "Reconnect attempt number {} will start in {:?}.",
                previous_retry_count + 1,
                delay
            );
            // A stop during the wait finds the state still Reconnecting and
            // raises Closed itself.
            tokio::select! {
                _ = stop_token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let guard = self.connection_lock.lock().await;
            if self.lifecycle.lock().state != HubConnectionState::Reconnecting {
                return;
            }
            let attempt = tokio::select! {
                biased;
                _ = stop_token.cancelled() => None,
                result = self.connect_once() => Some(result),
            };

            match attempt {
                None => {
                    info!("Connection stopped during reconnect.");
                    self.mark_closed(None);
                    return;
                }
                Some(Ok(session)) => {
                    let connection_id = session.connection_id.clone();
                    {
                        let mut lifecycle = self.lifecycle.lock();
                        lifecycle.state = HubConnectionState::Connected;
                        lifecycle.session = Some(session);
                    }
                    info!(
                        connection_id = ?connection_id,
                        "HubConnection reconnected successfully after {} attempts and {:?} elapsed.",
                        previous_retry_count + 1,
                        started.elapsed()
                    );
                    self.events.emit(ConnectionEvent::Reconnected(connection_id));
                    return;
                }
                Some(Err(e)) if e.is_permanent() => {
                    error!("Reconnect failed permanently: {}", e);
                    self.mark_closed(Some(Arc::new(e)));
                    return;
                }
                Some(Err(e)) => {
                    warn!(
                        "Reconnect attempt number {} failed: {}",
                        previous_retry_count + 1,
                        e
                    );
                    last_error = Arc::new(e);
                }
            }
            drop(guard);

            previous_retry_count += 1;
            next_delay = self.retry_policy.as_ref().and_then(|policy| {
                policy.next_retry_delay(&RetryContext {
                    previous_retry_count,
                    elapsed: started.elapsed(),
                    retry_reason: last_error.clone(),
                })
            });
        }

        let _guard = self.connection_lock.lock().await;
        if self.lifecycle.lock().state == HubConnectionState::Reconnecting {
            warn!(
                "Reconnect retries have been exhausted after {} failed attempts and {:?} elapsed.",
                previous_retry_count,
                started.elapsed()
            );
            self.mark_closed(Some(last_error));
        }
    }

    fn mark_closed(&self, cause: Option<Arc<HubError>>) {
        self.lifecycle.lock().state = HubConnectionState::Disconnected;
        self.events.emit(ConnectionEvent::Closed(cause));
    }
}
