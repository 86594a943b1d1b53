use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TraceError;

#[derive(Debug, Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Bounds how many traces run at once and how long each one may run.
///
/// Replays are expensive, so every trace entrypoint first obtains an
/// [`AdmissionSlot`]. With a capacity of zero no permit is needed. A zero
/// timeout disables the deadline.
#[derive(Debug)]
pub struct AdmissionController {
    max_concurrent: usize,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Duration,
    counters: Arc<Counters>,
}

impl AdmissionController {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            max_concurrent,
            semaphore: (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent))),
            timeout,
            counters: Arc::default(),
        }
    }

    /// Waits for a free slot. The deadline starts once the slot is granted.
    pub async fn admit(&self) -> Result<AdmissionSlot, TraceError> {
        let permit = match &self.semaphore {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| TraceError::internal("admission semaphore closed"))?,
            ),
            None => None,
        };
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(
            in_flight = self.in_flight(),
            capacity = ?self.capacity(),
            "admitted trace call"
        );

        Ok(AdmissionSlot {
            _permit: permit,
            deadline: (!self.timeout.is_zero()).then(|| Instant::now() + self.timeout),
            cancel: CancellationToken::new(),
            counters: self.counters.clone(),
        })
    }

    /// Runs `work` inside a slot, under the deadline.
    ///
    /// `work` receives the slot's cancellation token; it fires when the
    /// deadline expires, after which this returns
    /// [`TraceErrorCode::Timeout`](crate::error::TraceErrorCode::Timeout).
    /// The slot stays taken until `work` has wound down, so a replay that is
    /// slow to notice the token still counts against the capacity.
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T, TraceError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, TraceError>>,
    {
        let slot = self.admit().await?;
        let work = work(slot.cancellation());
        let Some(deadline) = slot.deadline() else {
            return work.await;
        };

        tokio::pin!(work);
        match tokio::time::timeout_at(deadline, &mut work).await {
            Ok(result) => result,
            Err(_) => {
                slot.cancel();
                warn!(timeout = ?self.timeout, "trace call exceeded its deadline");
                let started = Instant::now();
                let _ = work.await;
                debug!(drained = ?started.elapsed(), "timed out trace wound down");
                Err(TraceError::timeout(self.timeout))
            }
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|_| self.max_concurrent)
    }

    pub fn available_permits(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|it| it.available_permits())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn acquired_total(&self) -> u64 {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn released_total(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Slots currently held. Approximate while slots are being taken and
    /// released concurrently.
    pub fn in_flight(&self) -> u64 {
        let released = self.released_total();
        self.acquired_total().saturating_sub(released)
    }
}

/// The right to run one trace.
///
/// Dropping the slot releases it and fires its cancellation token, so any
/// replay still running on its behalf stops.
#[derive(Debug)]
pub struct AdmissionSlot {
    _permit: Option<OwnedSemaphorePermit>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl AdmissionSlot {
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::join_all;

    use super::*;
    use crate::error::TraceErrorCode;

    #[tokio::test]
    async fn k_plus_first_caller_waits_for_release() {
        let controller = AdmissionController::new(2, Duration::ZERO);
        let first = controller.admit().await.unwrap();
        let _second = controller.admit().await.unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(20), controller.admit())
                .await
                .is_err()
        );

        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(20), controller.admit()).await;
        assert!(third.is_ok());
        assert_eq!(controller.in_flight(), 2);
    }

    #[tokio::test]
    async fn zero_capacity_is_unlimited() {
        let controller = AdmissionController::new(0, Duration::ZERO);
        let slots = join_all((0..100).map(|_| controller.admit())).await;
        assert!(slots.iter().all(Result::is_ok));
        assert_eq!(controller.in_flight(), 100);
        assert_eq!(controller.capacity(), None);
        drop(slots);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn at_most_k_run_concurrently() {
        let controller = AdmissionController::new(3, Duration::ZERO);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let calls = (0..12).map(|_| {
            controller.run(|_| async {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        });
        for result in join_all(calls).await {
            result.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(controller.acquired_total(), 12);
        assert_eq!(controller.released_total(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_and_times_out() {
        let controller = AdmissionController::new(1, Duration::from_secs(5));
        let mut observed = None;

        let err = controller
            .run(|cancel| {
                observed = Some(cancel.clone());
                async move {
                    cancel.cancelled().await;
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.code, TraceErrorCode::Timeout);
        assert!(observed.unwrap().is_cancelled());
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(controller.available_permits(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_keeps_the_slot_until_work_stops() {
        let controller = Arc::new(AdmissionController::new(1, Duration::from_secs(5)));
        let stopped = Arc::new(AtomicUsize::new(0));

        let first = tokio::spawn({
            let controller = controller.clone();
            let stopped = stopped.clone();
            async move {
                controller
                    .run(|_| async move {
                        // Ignores its token and only stops on its own.
                        tokio::time::sleep(Duration::from_secs(20)).await;
                        stopped.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.available_permits(), Some(0));
        assert_eq!(controller.in_flight(), 1);

        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.code, TraceErrorCode::Timeout);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(controller.available_permits(), Some(1));
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_never_underflows_under_churn() {
        let controller = Arc::new(AdmissionController::new(0, Duration::ZERO));
        let churners = (0..3)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    for _ in 0..20_000 {
                        drop(controller.admit().await.unwrap());
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut observed = 0;
        for _ in 0..200_000 {
            observed = observed.max(controller.in_flight());
        }
        for churner in churners {
            churner.await.unwrap();
        }

        assert!(observed < 60_000, "in_flight reported {observed}");
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(controller.acquired_total(), 60_000);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_work_beats_the_deadline() {
        let controller = AdmissionController::new(1, Duration::from_secs(5));
        let value = controller
            .run(|_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(7)
            })
            .await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn errors_release_the_slot() {
        let controller = AdmissionController::new(1, Duration::from_secs(5));
        let err = controller
            .run(|_| async { Err::<(), _>(TraceError::tx_not_found("nope")) })
            .await
            .unwrap_err();
        assert_eq!(err.code, TraceErrorCode::TxNotFound);
        assert_eq!(controller.in_flight(), 0);
        assert_eq!(controller.capacity(), Some(1));
    }

    #[tokio::test]
    async fn dropping_a_slot_fires_its_token() {
        let controller = AdmissionController::new(1, Duration::ZERO);
        let slot = controller.admit().await.unwrap();
        let token = slot.cancellation();
        assert!(slot.deadline().is_none());
        assert!(!token.is_cancelled());
        drop(slot);
        assert!(token.is_cancelled());
    }
}
