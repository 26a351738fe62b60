//! Handler dispatch table for server-to-client invocations.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{CompletionResult, Frame};

/// Returned by the handler to answer an invocation: `Ok(None)` when it
/// produces no result.
type HandlerResult = Result<Option<Value>, String>;
type HandlerFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub(crate) const NO_RESULT: &str = "Client didn't provide a result.";

/// Handle identifying one registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    name: String,
    id: u64,
}

impl Subscription {
    pub fn method(&self) -> &str {
        &self.name
    }
}

pub(crate) struct HandlerTable {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(u64, HandlerFn)>>>,
}

impl HandlerTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, method: &str, handler: HandlerFn) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(method.to_lowercase())
            .or_default()
            .push((id, handler));
        Subscription {
            name: method.to_string(),
            id,
        }
    }

    /// Registers a callback whose arguments are decoded into `A`, usually a
    /// tuple matching the server's argument list.
    pub(crate) fn on<A, F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let target = method.to_string();
        self.insert(
            method,
            Arc::new(move |arguments: Vec<Value>| -> BoxFuture<'static, HandlerResult> {
                let handler = handler.clone();
                let args = bind_arguments::<A>(&target, arguments);
                Box::pin(async move {
                    handler(args?).await;
                    Ok::<_, String>(None)
                })
            }),
        )
    }

    /// Registers a callback whose return value answers the invocation.
    pub(crate) fn on_invoke<A, R, F, Fut>(&self, method: &str, handler: F) -> Subscription
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let target = method.to_string();
        self.insert(
            method,
            Arc::new(move |arguments: Vec<Value>| -> BoxFuture<'static, HandlerResult> {
                let handler = handler.clone();
                let args = bind_arguments::<A>(&target, arguments);
                Box::pin(async move {
                    let result = handler(args?).await?;
                    serde_json::to_value(result)
                        .map(Some)
                        .map_err(|e| format!("Failed to serialize the client result: {e}"))
                })
            }),
        )
    }

    pub(crate) fn remove(&self, subscription: &Subscription) -> bool {
        let key = subscription.name.to_lowercase();
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&key);
        }
        removed
    }

    pub(crate) fn remove_all(&self, method: &str) {
        self.handlers.write().remove(&method.to_lowercase());
    }

    fn lookup(&self, method: &str) -> Vec<HandlerFn> {
        self.handlers
            .read()
            .get(&method.to_lowercase())
            .map(|list| list.iter().map(|(_, f)| f.clone()).collect())
            .unwrap_or_default()
    }

    /// Runs every handler registered for `target`, in registration order.
    ///
    /// Returns the reply to send when the invocation carries an id.
    pub(crate) async fn dispatch(
        &self,
        invocation_id: Option<String>,
        target: &str,
        arguments: Vec<Value>,
    ) -> Option<Frame> {
        let handlers = self.lookup(target);
        if handlers.is_empty() {
            warn!("Failed to find handler for '{}' method.", target);
            return invocation_id
                .map(|id| Frame::completion(id, CompletionResult::Error(NO_RESULT.to_string())));
        }

        let mut answer: Option<Result<Value, String>> = None;
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler(arguments.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(format!(
                        "A callback for the method '{target}' panicked: {}",
                        panic_message(&*panic)
                    ))
                });
            match outcome {
                Ok(Some(value)) => {
                    if answer.is_none() {
                        answer = Some(Ok(value));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("A callback for the method '{}' threw error '{}'.", target, e);
                    if answer.is_none() {
                        answer = Some(Err(e));
                    }
                }
            }
        }

        let id = invocation_id?;
        debug!(invocation_id = %id, "Sending client result for '{}'", target);
        let result = match answer {
            Some(Ok(value)) => CompletionResult::Value(value),
            Some(Err(e)) => CompletionResult::Error(e),
            None => CompletionResult::Error(NO_RESULT.to_string()),
        };
        Some(Frame::completion(id, result))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn bind_arguments<A: DeserializeOwned>(target: &str, arguments: Vec<Value>) -> Result<A, String> {
    let empty = arguments.is_empty();
    match serde_json::from_value(Value::Array(arguments)) {
        Ok(args) => Ok(args),
        // `()` and unit structs only bind from null.
        Err(_) if empty => serde_json::from_value(Value::Null)
            .map_err(|e| format!("Failed to bind arguments for '{target}': {e}")),
        Err(e) => Err(format!("Failed to bind arguments for '{target}': {e}")),
    }
}
