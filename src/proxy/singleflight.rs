use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use tokio::sync::oneshot;

pub type FetchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>;
pub type CanUseFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct Waiter<T> {
    tx: oneshot::Sender<T>,
    can_use: CanUseFn<T>,
}

type Registry<T> = Arc<Mutex<HashMap<String, VecDeque<Waiter<T>>>>>;

/// Coalesces concurrent fetches of one key. A key is in the registry exactly
/// while a fetch task for it runs.
pub struct Getter<T> {
    waiters: Registry<T>,
}

impl<T: Clone + Send + 'static> Default for Getter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Getter<T> {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Waits for the in-flight fetch of `key`, starting one with `fetch` if
    /// none runs. The first waiter always takes the result; later waiters
    /// take it while their `can_use` accepts it. The first waiter to refuse
    /// gets a new fetch, shared the same way with those queued behind it.
    pub async fn get(&self, key: &str, fetch: FetchFn<T>, can_use: CanUseFn<T>) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        {
            let mut map = lock(&self.waiters);
            match map.get_mut(key) {
                Some(queue) => queue.push_back(Waiter { tx, can_use }),
                None => {
                    let mut queue = VecDeque::new();
                    queue.push_back(Waiter { tx, can_use });
                    map.insert(key.to_string(), queue);
                    tokio::spawn(run_fetch(Arc::clone(&self.waiters), key.to_string(), fetch));
                }
            }
        }
        rx.await.map_err(|_| anyhow!("fetch for {key} ended without a result"))
    }

    /// Keys with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.waiters).len()
    }
}

fn lock<T>(registry: &Registry<T>) -> MutexGuard<'_, HashMap<String, VecDeque<Waiter<T>>>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops the key's waiters if the fetch task unwinds, so they see a closed
/// channel instead of waiting forever.
struct Cleanup<T> {
    registry: Registry<T>,
    key: String,
    armed: bool,
}

impl<T> Drop for Cleanup<T> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.registry).remove(&self.key);
        }
    }
}

async fn run_fetch<T: Clone + Send + 'static>(registry: Registry<T>, key: String, fetch: FetchFn<T>) {
    let mut cleanup = Cleanup {
        registry: Arc::clone(&registry),
        key: key.clone(),
        armed: true,
    };
    loop {
        let value = fetch().await;

        let mut map = lock(&registry);
        let Some(queue) = map.get_mut(&key) else {
            log::error!("getter: key {key} vanished while its fetch was running");
            cleanup.armed = false;
            return;
        };
        if let Some(first) = queue.pop_front() {
            let _ = first.tx.send(value.clone());
        }
        while let Some(next) = queue.front() {
            if !(next.can_use)(&value) {
                break;
            }
            if let Some(waiter) = queue.pop_front() {
                let _ = waiter.tx.send(value.clone());
            }
        }
        if queue.is_empty() {
            map.remove(&key);
            cleanup.armed = false;
            return;
        }
        log::debug!("getter: {} waiters on {key} can't use the result, fetching again", queue.len());
    }
}
