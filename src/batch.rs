//! Run a batch of independent async operations without letting one failure
//! take down its siblings.

use futures::future::join_all;
use futures::FutureExt;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Per-item result of an isolated batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome<T> {
    Done(T),
    /// The item was deliberately not processed.
    Skipped { item: String },
    Failed { error: String },
}

impl<T> ItemOutcome<T> {
    pub fn into_done(self) -> Option<T> {
        match self {
            ItemOutcome::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, ItemOutcome::Done(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ItemOutcome::Failed { .. })
    }
}

/// Run `op` over every item concurrently.
///
/// The returned outcomes line up with `items` by position. `Ok(None)` from
/// `op` means the item was skipped; errors and panics become `Failed` and are
/// logged with the item's debug form.
pub async fn run_isolated<I, T, E, F, Fut>(items: Vec<I>, op: F) -> Vec<ItemOutcome<T>>
where
    I: Debug,
    E: Display,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let futures = items.into_iter().map(|item| {
        let label = format!("{:?}", item);
        let fut = op(item);
        async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(Some(value))) => ItemOutcome::Done(value),
                Ok(Ok(None)) => ItemOutcome::Skipped { item: label },
                Ok(Err(e)) => {
                    tracing::warn!(item = %label, error = %e, "batch item failed");
                    ItemOutcome::Failed {
                        error: format!("{}: {}", label, e),
                    }
                }
                Err(panic) => {
                    let message = panic_message(&panic);
                    tracing::error!(item = %label, panic = %message, "batch item panicked");
                    ItemOutcome::Failed {
                        error: format!("{}: panicked: {}", label, message),
                    }
                }
            }
        }
    });

    join_all(futures).await
}

/// Flatten chunk results into the successful values, dropping skips and failures.
pub fn flatten_done<T>(chunks: impl IntoIterator<Item = Vec<ItemOutcome<T>>>) -> Vec<T> {
    chunks
        .into_iter()
        .flatten()
        .filter_map(ItemOutcome::into_done)
        .collect()
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    #[tokio::test]
    async fn test_failures_do_not_cancel_siblings() {
        let items = vec![1u64, 2, 3, 4, 5];

        let outcomes = run_isolated(items, |n| async move {
            // Later items finish first.
            tokio::time::sleep(Duration::from_millis(10 * (6 - n))).await;
            match n {
                2 => Err(anyhow!("bad item")),
                4 => Ok(None),
                _ => Ok(Some(n * 10)),
            }
        })
        .await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes[0], ItemOutcome::Done(10));
        assert!(outcomes[1].is_failed());
        assert_eq!(outcomes[2], ItemOutcome::Done(30));
        assert!(matches!(outcomes[3], ItemOutcome::Skipped { .. }));
        assert_eq!(outcomes[4], ItemOutcome::Done(50));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let outcomes = run_isolated(vec![1u32, 2], |n| async move {
            if n == 1 {
                panic!("boom");
            }
            Ok::<_, anyhow::Error>(Some(n))
        })
        .await;

        match &outcomes[0] {
            ItemOutcome::Failed { error } => assert!(error.contains("boom")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(outcomes[1], ItemOutcome::Done(2));
    }

    #[test]
    fn test_flatten_done() {
        let chunks = vec![
            vec![ItemOutcome::Done(1), ItemOutcome::Failed { error: "x".into() }],
            vec![],
            vec![ItemOutcome::Skipped { item: "small.jpg".into() }, ItemOutcome::Done(2)],
        ];
        assert_eq!(flatten_done(chunks), vec![1, 2]);
    }
}
