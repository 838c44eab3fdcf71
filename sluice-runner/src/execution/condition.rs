//! One-shot latch
//!
//! A [`Condition`] is satisfied at most once, with either a value or the
//! reason it never will be. Any number of waiters observe the same outcome,
//! including waiters that arrive after it was set.

use std::sync::Arc;

use tokio::sync::watch;

type Outcome<T> = Option<Result<Arc<T>, String>>;

pub struct Condition<T> {
    tx: watch::Sender<Outcome<T>>,
}

impl<T: Send + Sync> Condition<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Sets the outcome; returns false if it was already set
    pub fn satisfy(&self, outcome: Result<Arc<T>, String>) -> bool {
        let mut outcome = Some(outcome);
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = outcome.take();
            true
        })
    }

    #[cfg(test)]
    pub fn is_satisfied(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Waits for the outcome
    pub async fn wait(&self) -> Result<Arc<T>, String> {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or_else(|| Err("condition cleared".to_string())),
            Err(_) => Err("condition dropped".to_string()),
        }
    }

    /// Guard that fails the condition if dropped before `satisfy` was called
    pub fn guard(self: &Arc<Self>, reason: impl Into<String>) -> ConditionGuard<T> {
        ConditionGuard {
            condition: self.clone(),
            reason: reason.into(),
        }
    }
}

impl<T: Send + Sync> Default for Condition<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConditionGuard<T: Send + Sync> {
    condition: Arc<Condition<T>>,
    reason: String,
}

impl<T: Send + Sync> ConditionGuard<T> {
    pub fn satisfy(self, outcome: Result<Arc<T>, String>) -> bool {
        self.condition.satisfy(outcome)
    }
}

impl<T: Send + Sync> Drop for ConditionGuard<T> {
    fn drop(&mut self) {
        self.condition
            .satisfy(Err(std::mem::take(&mut self.reason)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_waiters_see_the_first_outcome() {
        let condition = Arc::new(Condition::<u32>::new());

        let early = {
            let condition = condition.clone();
            tokio::spawn(async move { condition.wait().await })
        };
        tokio::task::yield_now().await;

        assert!(condition.satisfy(Ok(Arc::new(7))));
        assert!(!condition.satisfy(Ok(Arc::new(8))));

        assert_eq!(*early.await.unwrap().unwrap(), 7);
        assert_eq!(*condition.wait().await.unwrap(), 7, "late waiter");
    }

    #[tokio::test]
    async fn test_dropped_guard_fails_waiters() {
        let condition = Arc::new(Condition::<u32>::new());
        let guard = condition.guard("bootstrap aborted");

        let waiter = {
            let condition = condition.clone();
            tokio::spawn(async move { condition.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!condition.is_satisfied());
        drop(guard);

        assert_eq!(waiter.await.unwrap().unwrap_err(), "bootstrap aborted");
    }

    #[tokio::test]
    async fn test_satisfied_guard_keeps_value() {
        let condition = Arc::new(Condition::<&'static str>::new());
        let guard = condition.guard("unused");
        assert!(guard.satisfy(Ok(Arc::new("ready"))));

        assert_eq!(*condition.wait().await.unwrap(), "ready");
    }
}
