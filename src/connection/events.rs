//! Lifecycle event subscriptions.
//!
//! Events are queued and delivered on a single background task, one at a time
//! and in the order they were raised. Handlers of one event run in
//! registration order.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::HubError;

type Callback<A> = Arc<dyn Fn(A) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) enum ConnectionEvent {
    Closed(Option<Arc<HubError>>),
    Reconnecting(Arc<HubError>),
    Reconnected(Option<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Closed,
    Reconnecting,
    Reconnected,
}

/// Handle returned by the `on_closed`/`on_reconnecting`/`on_reconnected`
/// registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubscription {
    kind: EventKind,
    id: u64,
}

#[derive(Default)]
struct Registrations {
    closed: RwLock<Vec<(u64, Callback<Option<Arc<HubError>>>)>>,
    reconnecting: RwLock<Vec<(u64, Callback<Arc<HubError>>)>>,
    reconnected: RwLock<Vec<(u64, Callback<Option<String>>)>>,
}

impl Registrations {
    async fn deliver(&self, event: ConnectionEvent) {
        trace!(?event, "Delivering connection event");
        match event {
            ConnectionEvent::Closed(error) => {
                let callbacks: Vec<_> = self.closed.read().iter().map(|(_, f)| f.clone()).collect();
                for callback in callbacks {
                    callback(error.clone()).await;
                }
            }
            ConnectionEvent::Reconnecting(error) => {
                let callbacks: Vec<_> =
                    self.reconnecting.read().iter().map(|(_, f)| f.clone()).collect();
                for callback in callbacks {
                    callback(error.clone()).await;
                }
            }
            ConnectionEvent::Reconnected(connection_id) => {
                let callbacks: Vec<_> =
                    self.reconnected.read().iter().map(|(_, f)| f.clone()).collect();
                for callback in callbacks {
                    callback(connection_id.clone()).await;
                }
            }
        }
    }
}

pub(crate) struct EventDispatcher {
    next_id: AtomicU64,
    registrations: Arc<Registrations>,
    queue: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
}

impl EventDispatcher {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registrations: Arc::new(Registrations::default()),
            queue: Mutex::new(None),
        }
    }

    fn subscription(&self, kind: EventKind) -> EventSubscription {
        EventSubscription {
            kind,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub(crate) fn on_closed<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Option<Arc<HubError>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscription = self.subscription(EventKind::Closed);
        let callback: Callback<Option<Arc<HubError>>> =
            Arc::new(move |e| -> BoxFuture<'static, ()> { Box::pin(handler(e)) });
        self.registrations.closed.write().push((subscription.id, callback));
        subscription
    }

    pub(crate) fn on_reconnecting<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Arc<HubError>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscription = self.subscription(EventKind::Reconnecting);
        let callback: Callback<Arc<HubError>> =
            Arc::new(move |e| -> BoxFuture<'static, ()> { Box::pin(handler(e)) });
        self.registrations.reconnecting.write().push((subscription.id, callback));
        subscription
    }

    pub(crate) fn on_reconnected<F, Fut>(&self, handler: F) -> EventSubscription
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscription = self.subscription(EventKind::Reconnected);
        let callback: Callback<Option<String>> =
            Arc::new(move |id| -> BoxFuture<'static, ()> { Box::pin(handler(id)) });
        self.registrations.reconnected.write().push((subscription.id, callback));
        subscription
    }

    pub(crate) fn remove(&self, subscription: &EventSubscription) -> bool {
        fn remove_id<T>(list: &RwLock<Vec<(u64, T)>>, id: u64) -> bool {
            let mut list = list.write();
            let before = list.len();
            list.retain(|(entry, _)| *entry != id);
            list.len() != before
        }
        let registrations = &self.registrations;
        match subscription.kind {
            EventKind::Closed => remove_id(&registrations.closed, subscription.id),
            EventKind::Reconnecting => remove_id(&registrations.reconnecting, subscription.id),
            EventKind::Reconnected => remove_id(&registrations.reconnected, subscription.id),
        }
    }

    /// Queues an event. The delivery task starts with the first event.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        debug!(?event, "Connection event raised");
        let mut queue = self.queue.lock();
        let tx = queue.get_or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let registrations = self.registrations.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    registrations.deliver(event).await;
                }
            });
            tx
        });
        let _ = tx.send(event);
    }
}
