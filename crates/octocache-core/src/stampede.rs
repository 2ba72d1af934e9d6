//! Stampede coordinator.
//!
//! Deduplicates concurrent work for the same key. The first caller for a
//! key registers an in-flight state and spawns the work as a detached task;
//! later callers join it and wait for the same outcome.
//!
//! ## Cancellation
//!
//! Each state owns a composed [`CancellationToken`] handed to the work. It
//! fires only once the last interested caller has gone, either by its own
//! token firing or by dropping its future. A caller's own cancellation ends
//! that caller's wait and nothing else.
//!
//! ## Draining states
//!
//! A state whose caller count reached zero accepts no new callers. A caller
//! that finds one installs a fresh, independent state in the registry slot
//! and runs the work again. The old task still finishes, but only removes
//! the registry entry if that entry is still its own state.

use std::any::{Any, TypeId, type_name};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{CacheError, CacheResult};

type Completion<V> = watch::Sender<Option<CacheResult<V>>>;

/// One in-flight unit of work for a key.
struct StampedeState {
    type_id: TypeId,
    type_name: &'static str,
    callers: AtomicUsize,
    cancellation: CancellationToken,
    /// `Completion<V>` for the state's value type.
    completion: Arc<dyn Any + Send + Sync>,
}

impl StampedeState {
    fn new<V: Send + Sync + 'static>() -> Self {
        let (sender, _) = watch::channel::<Option<CacheResult<V>>>(None);
        Self {
            type_id: TypeId::of::<V>(),
            type_name: type_name::<V>(),
            callers: AtomicUsize::new(1),
            cancellation: CancellationToken::new(),
            completion: Arc::new(sender),
        }
    }

    /// Registers one more caller. Fails once the count has reached zero.
    fn try_add_caller(&self) -> bool {
        let mut current = self.callers.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.callers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops one caller, cancelling the work when it was the last.
    fn release(&self) {
        if self.callers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.cancellation.cancel();
        }
    }

    fn completion<V: Send + Sync + 'static>(&self) -> Option<Arc<Completion<V>>> {
        Arc::clone(&self.completion).downcast::<Completion<V>>().ok()
    }
}

/// Releases its caller slot on drop unless the caller got an outcome.
struct CallerGuard {
    state: Arc<StampedeState>,
    armed: bool,
}

impl CallerGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state.release();
        }
    }
}

/// Registry of in-flight work, keyed by cache key.
#[derive(Default)]
pub struct StampedeCoordinator {
    in_flight: Arc<DashMap<String, Arc<StampedeState>>>,
    started: AtomicU64,
    joined: AtomicU64,
}

impl StampedeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` for `key`, or joins the run already in flight.
    ///
    /// `work` receives the composed cancellation token and runs on a
    /// detached task, so it outlives the caller that started it. Every
    /// caller waiting when it finishes receives a clone of its outcome.
    ///
    /// # Errors
    ///
    /// - [`CacheError::TypeMismatch`] if the key is in flight for a
    ///   different value type.
    /// - [`CacheError::Cancelled`] if `cancellation` fires first, or if
    ///   every caller left before the work finished.
    /// - Whatever error the work itself produced.
    pub async fn run_or_join<V, F, Fut>(
        &self,
        key: &str,
        cancellation: Option<&CancellationToken>,
        work: F,
    ) -> CacheResult<V>
    where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        if cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(CacheError::cancelled(key));
        }

        let (state, created) = self.acquire::<V>(key)?;
        let mut guard = CallerGuard {
            state: Arc::clone(&state),
            armed: true,
        };
        let completion = state.completion::<V>().ok_or(CacheError::TypeMismatch {
            key: key.to_owned(),
            expected: type_name::<V>(),
            actual: state.type_name,
        })?;
        let receiver = completion.subscribe();

        if created {
            self.started.fetch_add(1, Ordering::Relaxed);
            self.spawn_work(key, Arc::clone(&state), completion, work);
        } else {
            self.joined.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "joined in-flight factory");
        }

        let outcome = match cancellation {
            None => wait_outcome(key, receiver).await,
            Some(token) => {
                tokio::select! {
                    biased;
                    outcome = wait_outcome(key, receiver) => outcome,
                    () = token.cancelled() => {
                        tracing::debug!(key = %key, "caller cancelled its wait");
                        return Err(CacheError::cancelled(key));
                    }
                }
            }
        };
        guard.disarm();
        outcome
    }

    /// Number of keys with work in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of runs started.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Number of callers that joined a run instead of starting one.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    fn acquire<V: Send + Sync + 'static>(
        &self,
        key: &str,
    ) -> CacheResult<(Arc<StampedeState>, bool)> {
        match self.in_flight.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.type_id != TypeId::of::<V>() {
                    return Err(CacheError::TypeMismatch {
                        key: key.to_owned(),
                        expected: type_name::<V>(),
                        actual: existing.type_name,
                    });
                }
                if existing.try_add_caller() {
                    return Ok((Arc::clone(existing), false));
                }
                tracing::debug!(key = %key, "in-flight factory is draining, starting a new one");
                let fresh = Arc::new(StampedeState::new::<V>());
                occupied.insert(Arc::clone(&fresh));
                Ok((fresh, true))
            }
            Entry::Vacant(vacant) => {
                let fresh = Arc::new(StampedeState::new::<V>());
                vacant.insert(Arc::clone(&fresh));
                Ok((fresh, true))
            }
        }
    }

    fn spawn_work<V, F, Fut>(
        &self,
        key: &str,
        state: Arc<StampedeState>,
        completion: Arc<Completion<V>>,
        work: F,
    ) where
        V: Clone + Send + Sync + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = CacheResult<V>> + Send + 'static,
    {
        let key = key.to_owned();
        let registry = Arc::clone(&self.in_flight);
        let token = state.cancellation.clone();

        tokio::spawn(async move {
            let guarded = AssertUnwindSafe({
                let token = token.clone();
                async move { work(token).await }
            })
            .catch_unwind();

            let outcome = tokio::select! {
                biased;
                result = guarded => match result {
                    Ok(result) => result,
                    Err(panic) => {
                        let message = panic_message(&*panic);
                        tracing::warn!(key = %key, panic = %message, "factory panicked");
                        Err(CacheError::FactoryPanicked { key: key.clone(), message })
                    }
                },
                () = token.cancelled() => {
                    tracing::debug!(key = %key, "all callers left, factory cancelled");
                    Err(CacheError::cancelled(&key))
                }
            };

            if let Err(e) = &outcome {
                tracing::debug!(key = %key, error = %e, "stampede finished with error");
            }
            // Leave the registry first so nobody joins a finished run
            registry.remove_if(&key, |_, current| Arc::ptr_eq(current, &state));
            completion.send_if_modified(|slot| {
                if slot.is_none() {
                    *slot = Some(outcome);
                    true
                } else {
                    false
                }
            });
        });
    }
}

impl std::fmt::Debug for StampedeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StampedeCoordinator")
            .field("in_flight", &self.in_flight.len())
            .field("started", &self.started())
            .field("joined", &self.joined())
            .finish()
    }
}

async fn wait_outcome<V: Clone>(
    key: &str,
    mut receiver: watch::Receiver<Option<CacheResult<V>>>,
) -> CacheResult<V> {
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => match &*outcome {
            Some(result) => result.clone(),
            None => Err(CacheError::cancelled(key)),
        },
        Err(_) => Err(CacheError::cancelled(key)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn slow_value(
        calls: Arc<AtomicUsize>,
        delay: Duration,
        value: &'static str,
    ) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, CacheResult<String>> + Send + 'static
    {
        move |_token| {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                Ok(value.to_string())
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_flight() {
        let coordinator = Arc::new(StampedeCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                coordinator
                    .run_or_join(
                        "k",
                        None,
                        slow_value(calls, Duration::from_millis(50), "v"),
                    )
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.started(), 1);
        assert_eq!(coordinator.joined(), 15);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_isolation() {
        let coordinator = Arc::new(StampedeCoordinator::new());
        let composed_fired = Arc::new(AtomicBool::new(false));

        let work = {
            let composed_fired = composed_fired.clone();
            move |token: CancellationToken| async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                composed_fired.store(token.is_cancelled(), Ordering::SeqCst);
                Ok::<_, CacheError>("shared".to_string())
            }
        };

        let a_token = CancellationToken::new();
        let a = {
            let coordinator = coordinator.clone();
            let a_token = a_token.clone();
            tokio::spawn(async move { coordinator.run_or_join("k", Some(&a_token), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let joiner = |coordinator: Arc<StampedeCoordinator>| {
            tokio::spawn(async move {
                coordinator
                    .run_or_join("k", None, |_token: CancellationToken| async {
                        Ok::<_, CacheError>("unused".to_string())
                    })
                    .await
            })
        };
        let b = joiner(coordinator.clone());
        let c = joiner(coordinator.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        a_token.cancel();
        assert!(a.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(b.await.unwrap().unwrap(), "shared");
        assert_eq!(c.await.unwrap().unwrap(), "shared");
        assert!(!composed_fired.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_caller_drains() {
        let coordinator = Arc::new(StampedeCoordinator::new());
        let (observed_tx, observed_rx) = tokio::sync::oneshot::channel();

        let work = move |token: CancellationToken| async move {
            let observer = token.clone();
            tokio::spawn(async move {
                observer.cancelled().await;
                let _ = observed_tx.send(());
            });
            token.cancelled().await;
            Ok::<_, CacheError>(0u64)
        };

        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let a = {
            let coordinator = coordinator.clone();
            let token = first.clone();
            tokio::spawn(async move { coordinator.run_or_join("k", Some(&token), work).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = {
            let coordinator = coordinator.clone();
            let token = second.clone();
            tokio::spawn(async move {
                coordinator
                    .run_or_join("k", Some(&token), |_token: CancellationToken| async {
                        Ok::<_, CacheError>(1u64)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        first.cancel();
        assert!(a.await.unwrap().unwrap_err().is_cancelled());
        second.cancel();
        assert!(b.await.unwrap().unwrap_err().is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), observed_rx)
            .await
            .expect("composed token never fired")
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_caller_future_releases() {
        let coordinator = Arc::new(StampedeCoordinator::new());
        let (observed_tx, observed_rx) = tokio::sync::oneshot::channel();

        let work = move |token: CancellationToken| async move {
            token.cancelled().await;
            let _ = observed_tx.send(());
            Ok::<_, CacheError>(())
        };
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.run_or_join("k", None, work),
        )
        .await;
        assert!(result.is_err());

        tokio::time::timeout(Duration::from_secs(1), observed_rx)
            .await
            .expect("composed token never fired")
            .unwrap();
    }

    #[tokio::test]
    async fn test_type_mismatch_is_rejected() {
        let coordinator = Arc::new(StampedeCoordinator::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let coordinator = coordinator.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                coordinator
                    .run_or_join("k", None, slow_value(calls, Duration::from_millis(50), "v"))
                    .await
            })
        };
        tokio::task::yield_now().await;
        while coordinator.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let err = coordinator
            .run_or_join("k", None, |_token: CancellationToken| async {
                Ok::<_, CacheError>(7u64)
            })
            .await
            .unwrap_err();
        assert!(err.is_type_mismatch());
        assert!(err.to_string().contains("u64"));
        assert!(err.to_string().contains("String"));

        assert_eq!(first.await.unwrap().unwrap(), "v");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fault_reaches_every_waiter_then_clears() {
        let coordinator = Arc::new(StampedeCoordinator::new());
        let barrier = Arc::new(Barrier::new(3));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                coordinator
                    .run_or_join("k", None, |_token: CancellationToken| async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err::<String, _>(CacheError::factory("k", anyhow::anyhow!("boom")))
                    })
                    .await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(
                err.factory_error().map(ToString::to_string),
                Some("boom".to_string())
            );
        }

        // Not poisoned: the next call runs fresh
        let value = coordinator
            .run_or_join("k", None, |_token: CancellationToken| async {
                Ok::<_, CacheError>("ok".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let coordinator = StampedeCoordinator::new();
        let err = coordinator
            .run_or_join("k", None, |_token: CancellationToken| async {
                if true {
                    panic!("factory exploded");
                }
                Ok::<_, CacheError>(())
            })
            .await
            .unwrap_err();

        match err {
            CacheError::FactoryPanicked { message, .. } => {
                assert_eq!(message, "factory exploded")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_already_cancelled_caller_does_not_start_work() {
        let coordinator = StampedeCoordinator::new();
        let token = CancellationToken::new();
        token.cancel();

        let err = coordinator
            .run_or_join("k", Some(&token), |_token: CancellationToken| async {
                Ok::<_, CacheError>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(coordinator.started(), 0);
    }

    #[test]
    fn test_caller_count_reaches_zero_once() {
        let state = StampedeState::new::<String>();
        assert!(state.try_add_caller());
        state.release();
        assert!(!state.cancellation.is_cancelled());
        state.release();
        assert!(state.cancellation.is_cancelled());
        assert!(!state.try_add_caller());
    }

    #[tokio::test]
    async fn test_draining_state_is_replaced() {
        let coordinator = StampedeCoordinator::new();
        let (first, created) = coordinator.acquire::<String>("k").unwrap();
        assert!(created);
        first.release();

        let (second, created) = coordinator.acquire::<String>("k").unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.cancellation.is_cancelled());

        // The drained state's cleanup must not evict its replacement
        coordinator
            .in_flight
            .remove_if("k", |_, current| Arc::ptr_eq(current, &first));
        assert_eq!(coordinator.in_flight(), 1);
    }
}
