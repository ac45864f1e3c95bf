//! Per-session registry of named long-lived async activities with
//! exclusive-naming replacement semantics (spec.md §4.2).
//!
//! Grounded in `examples/original_source/.../quest_manager.py`: a quest is
//! `(name, init -> T, run(T), close(T)?)`. Registering a name that already
//! exists closes, then cancels, the previous quest before the new one's
//! `init` runs. Scope exit tears down every quest the same way and bubbles
//! the first non-cancellation failure observed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::OrchestratorError;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A named activity: `init` produces a value consumed by `run`; `close`
/// (if present) runs to completion before `run` is cancelled during
/// replacement or teardown.
pub struct Quest {
    pub name: String,
    handle: JoinHandle<Result<(), OrchestratorError>>,
    close: Option<Box<dyn FnOnce() -> BoxFuture<()> + Send>>,
}

impl Quest {
    /// Build a quest from an already-spawned task and an optional close
    /// callback invoked before that task is cancelled.
    pub fn new(
        name: impl Into<String>,
        handle: JoinHandle<Result<(), OrchestratorError>>,
        close: Option<Box<dyn FnOnce() -> BoxFuture<()> + Send>>,
    ) -> Self {
        Self {
            name: name.into(),
            handle,
            close,
        }
    }

    async fn remove(self) -> Option<OrchestratorError> {
        if let Some(close) = self.close {
            close().await;
        }
        self.handle.abort();
        match self.handle.await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(join_err) if join_err.is_cancelled() => None,
            Err(join_err) => Some(OrchestratorError::Internal(join_err.into())),
        }
    }
}

struct Inner {
    quests: HashMap<String, Quest>,
    first_error: Option<OrchestratorError>,
}

/// The session-scoped quest registry. `shutdown()` plays the role of the
/// source's `wait()` + `__aexit__`: it is awaited once, at session teardown.
pub struct QuestManager {
    inner: Mutex<Inner>,
}

impl QuestManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                quests: HashMap::new(),
                first_error: None,
            }),
        })
    }

    /// Register `quest`, replacing and tearing down any existing quest of
    /// the same name first (close-then-cancel, spec.md §4.2).
    pub async fn add(&self, quest: Quest) {
        let name = quest.name.clone();
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.quests.remove(&name) {
            drop(inner);
            if let Some(err) = existing.remove().await {
                if !err.is_swallowed_during_teardown() {
                    warn!(quest = %name, error = %err, "quest replacement observed error");
                }
            }
            inner = self.inner.lock().await;
        }
        inner.quests.insert(name, quest);
    }

    /// Remove a quest by name (close-then-cancel). Idempotent.
    pub async fn remove(&self, name: &str) {
        let existing = {
            let mut inner = self.inner.lock().await;
            inner.quests.remove(name)
        };
        if let Some(quest) = existing {
            if let Some(err) = quest.remove().await {
                if !err.is_swallowed_during_teardown() {
                    let mut inner = self.inner.lock().await;
                    if inner.first_error.is_none() {
                        inner.first_error = Some(err);
                    }
                }
            }
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.lock().await.quests.contains_key(name)
    }

    /// Tear down every registered quest (close-then-cancel), swallowing the
    /// three well-known transient errors, logging others. Returns the first
    /// non-cancellation, non-swallowed error observed across the whole
    /// session, if any.
    pub async fn shutdown(&self) -> Option<OrchestratorError> {
        let quests: Vec<Quest> = {
            let mut inner = self.inner.lock().await;
            inner.quests.drain().map(|(_, q)| q).collect()
        };
        for quest in quests {
            let name = quest.name.clone();
            if let Some(err) = quest.remove().await {
                if err.is_swallowed_during_teardown() {
                    debug!(quest = %name, "swallowed transient error during teardown");
                } else {
                    warn!(quest = %name, error = %err, "quest error during teardown");
                    let mut inner = self.inner.lock().await;
                    if inner.first_error.is_none() {
                        inner.first_error = Some(err);
                    }
                }
            }
        }
        self.inner.lock().await.first_error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spawn_noop(name: &str) -> Quest {
        let handle = tokio::spawn(async { Ok(()) });
        Quest::new(name, handle, None)
    }

    #[tokio::test]
    async fn named_replacement_runs_close_before_new_init() {
        let manager = QuestManager::new();
        let close_runs = Arc::new(AtomicUsize::new(0));

        let close_runs_clone = close_runs.clone();
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(())
        });
        let close: Box<dyn FnOnce() -> BoxFuture<()> + Send> = Box::new(move || {
            Box::pin(async move {
                close_runs_clone.fetch_add(1, Ordering::SeqCst);
            })
        });
        manager.add(Quest::new("stt", handle, Some(close))).await;

        manager.add(spawn_noop("stt")).await;

        assert_eq!(close_runs.load(Ordering::SeqCst), 1);
        assert!(manager.contains("stt").await);
    }

    #[tokio::test]
    async fn shutdown_swallows_transient_errors() {
        let manager = QuestManager::new();
        let handle = tokio::spawn(async {
            Err(OrchestratorError::UpstreamAtCapacity { service: "stt".into() })
        });
        manager.add(Quest::new("stt", handle, None)).await;
        let err = manager.shutdown().await;
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn shutdown_surfaces_first_non_transient_error() {
        let manager = QuestManager::new();
        let handle = tokio::spawn(async {
            Err(OrchestratorError::Protocol("boom".into()))
        });
        manager.add(Quest::new("llm", handle, None)).await;
        let err = manager.shutdown().await;
        assert!(matches!(err, Some(OrchestratorError::Protocol(_))));
    }
}
