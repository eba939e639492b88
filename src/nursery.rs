//! A bounded task pool with structured-concurrency semantics: every task
//! registered with a nursery finishes before `join` returns, and the first
//! task error is surfaced instead of getting lost in a detached task.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

pub struct Nursery {
    tasks: JoinSet<Result<()>>,
    slots: Arc<Semaphore>,
    /// Raised on the first task error; tasks still waiting for a slot bail
    /// out without running, tasks already running are left alone.
    failed: Arc<AtomicBool>,
    first_error: Option<anyhow::Error>,
}

impl Nursery {
    pub fn new(concurrency: usize) -> Self {
        Nursery {
            tasks: JoinSet::new(),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            failed: Arc::new(AtomicBool::new(false)),
            first_error: None,
        }
    }

    fn collect_finished(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: Result<Result<()>, tokio::task::JoinError>) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_error) => Err(anyhow::Error::new(join_error).context("nursery task panicked")),
        };
        if let Err(error) = outcome {
            self.failed.store(true, Ordering::Release);
            if self.first_error.is_none() {
                self.first_error = Some(error);
            }
        }
    }

    /// Register a task. It starts as soon as one of the pool's slots frees
    /// up. If an earlier task has already failed, the error is returned
    /// here instead and pending work is abandoned.
    pub fn start_soon<F>(&mut self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.collect_finished();
        if self.failed.load(Ordering::Acquire) {
            if let Some(error) = self.first_error.take() {
                return Err(error);
            }
            // The error was already handed out by a previous call; the
            // nursery stays poisoned.
            anyhow::bail!("nursery has already failed");
        }

        let slots = Arc::clone(&self.slots);
        let failed = Arc::clone(&self.failed);
        self.tasks.spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .expect("nursery semaphore is never closed");
            if failed.load(Ordering::Acquire) {
                // A sibling failed while this task was still queued.
                return Ok(());
            }
            task.await
        });
        Ok(())
    }

    /// Wait for every registered task and surface the first error.
    pub async fn join(mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
        match self.first_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[tokio::test]
    async fn runs_every_task_to_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut nursery = Nursery::new(4);
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            nursery
                .start_soon(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        nursery.join().await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut nursery = Nursery::new(3);
        for _ in 0..30 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            nursery
                .start_soon(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        nursery.join().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn join_surfaces_the_first_error() {
        let mut nursery = Nursery::new(2);
        nursery
            .start_soon(async { anyhow::bail!("boom") })
            .unwrap();
        let err = nursery.join().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn start_soon_rethrows_a_pending_error() {
        let mut nursery = Nursery::new(1);
        nursery
            .start_soon(async { anyhow::bail!("early failure") })
            .unwrap();
        // Give the failing task time to finish.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut rethrown = None;
        for _ in 0..2 {
            if let Err(e) = nursery.start_soon(async { Ok(()) }) {
                rethrown = Some(e);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(rethrown.unwrap().to_string(), "early failure");
        // The error has been handed out; join has nothing left to report.
        nursery.join().await.unwrap();
    }

    #[tokio::test]
    async fn results_written_before_join_are_visible_after() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut nursery = Nursery::new(8);
        for i in 0..50 {
            let sink = Arc::clone(&sink);
            nursery
                .start_soon(async move {
                    sink.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }
        nursery.join().await.unwrap();
        let mut got = sink.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..50).collect::<Vec<_>>());
    }
}
