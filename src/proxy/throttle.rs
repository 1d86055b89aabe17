use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::remap::RemapRule;

/// Bounded concurrency for one rule. A limit of 0 never waits.
#[derive(Clone, Default)]
pub struct Throttler {
    slots: Option<Arc<Semaphore>>,
}

impl Throttler {
    pub fn new(limit: usize) -> Self {
        if limit == 0 {
            return Self::default();
        }
        Self {
            slots: Some(Arc::new(Semaphore::new(limit))),
        }
    }

    /// Runs `fut` while holding a slot.
    pub async fn throttle<F: Future>(&self, fut: F) -> F::Output {
        let Some(slots) = self.slots.as_ref() else {
            return fut.await;
        };
        // the semaphore is never closed
        let _permit = slots.acquire().await.ok();
        fut.await
    }

    /// Free slots, `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }
}

/// Throttlers keyed by rule name, built once per rule set.
#[derive(Clone, Default)]
pub struct RuleThrottlers {
    by_rule: HashMap<String, Throttler>,
}

impl RuleThrottlers {
    /// Rules that leave `concurrent_rule_requests` at 0 get `default_limit`.
    pub fn new(rules: &[Arc<RemapRule>], default_limit: usize) -> Self {
        let mut by_rule = HashMap::with_capacity(rules.len());
        for rule in rules {
            let limit = match rule.concurrent_rule_requests {
                0 => default_limit,
                n => n,
            };
            by_rule.insert(rule.name.clone(), Throttler::new(limit));
        }
        Self { by_rule }
    }

    pub fn get(&self, rule: &str) -> Throttler {
        match self.by_rule.get(rule) {
            Some(t) => t.clone(),
            None => {
                log::error!("no throttler for rule {rule}, running unthrottled");
                Throttler::default()
            }
        }
    }
}
