use crate::error::{ExchangeError, ExchangeResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{broadcast, Mutex};

type Coalesced = Result<Value, ExchangeError>;

/// Coalesces identical in-flight reads: the first caller executes the
/// request, everyone else arriving with the same key awaits that result.
///
/// `force_reset` drops all in-flight registrations so that a new bot cycle
/// never awaits a response that predates it.
pub struct RequestManager {
    inflight: Mutex<HashMap<String, broadcast::Sender<Coalesced>>>,
}

impl RequestManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `request` under `key`, sharing the result with concurrent
    /// callers of the same key.
    pub async fn run<F, Fut>(&self, key: &str, request: F) -> ExchangeResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ExchangeResult<Value>>,
    {
        let mut rx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(tx) = inflight.get(key) {
                tx.subscribe()
            } else {
                let (tx, _rx) = broadcast::channel(1);
                inflight.insert(key.to_string(), tx);
                drop(inflight);

                let result = request().await;

                let mut inflight = self.inflight.lock().await;
                if let Some(tx) = inflight.remove(key) {
                    let _ = tx.send(result.clone());
                }
                return result;
            }
        };

        match rx.recv().await {
            Ok(result) => result,
            // The executing request was dropped by force_reset; callers are
            // retried by their monitor cadence.
            Err(_) => Err(ExchangeError::Transient(format!(
                "coalesced request for '{key}' was reset"
            ))),
        }
    }

    /// Drops all in-flight registrations. Waiters receive a transient error.
    pub async fn force_reset(&self) {
        let mut inflight = self.inflight.lock().await;
        let dropped = inflight.len();
        inflight.clear();
        if dropped > 0 {
            tracing::debug!("Request manager reset, dropped {} in-flight keys", dropped);
        }
    }
}

impl Default for RequestManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_identical_reads_execute_once() {
        let manager = Arc::new(RequestManager::new());
        let executions = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .run("GET /api/v1/markets", || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"ok": true}))
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value["ok"], true);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_coalesce() {
        let manager = RequestManager::new();
        let a = manager.run("a", || async { Ok(json!(1)) }).await.unwrap();
        let b = manager.run("b", || async { Ok(json!(2)) }).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn waiters_share_the_error_kind() {
        let manager = Arc::new(RequestManager::new());

        let m1 = manager.clone();
        let slow = tokio::spawn(async move {
            m1.run("k", || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<Value, _>(ExchangeError::RateLimited("429".into()))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = manager.run("k", || async { Ok(json!("never runs")) }).await;

        assert!(slow.await.unwrap().unwrap_err().is_rate_limited());
        assert!(waiter.unwrap_err().is_rate_limited());
    }

    #[tokio::test]
    async fn sequential_calls_after_completion_execute_again() {
        let manager = RequestManager::new();
        let executions = AtomicU32::new(0);

        for _ in 0..2 {
            manager
                .run("k", || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                })
                .await
                .unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
