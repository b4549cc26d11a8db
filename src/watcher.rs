//! The periodic driver: one background loop cycling through the named jobs
//! in order, sleeping a fixed delay before each invocation. Job errors are
//! logged with the job name and never abort the loop; download must precede
//! sync, sync feeds the build queue, and builds mark deployments dirty
//! before the deploy job runs.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

/// Delay before each job invocation.
pub const WATCH_JOB_DELAY: Duration = Duration::from_secs(1);

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub struct Job {
    name: &'static str,
    run: Box<dyn Fn(CancellationToken) -> JobFuture + Send + Sync>,
}

impl Job {
    pub fn new<F, Fut>(name: &'static str, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name,
            run: Box::new(move |cancel| Box::pin(f(cancel))),
        }
    }
}

pub struct Watcher {
    jobs: Vec<Job>,
    delay: Duration,
}

impl Watcher {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            delay: WATCH_JOB_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Run until the token fires. Jobs run strictly sequentially; a job must
    /// return before the next one starts.
    pub async fn watch(&self, cancel: CancellationToken) {
        loop {
            for job in &self.jobs {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.cancelled() => return,
                }
                if let Err(e) = (job.run)(cancel.clone()).await {
                    eprintln!("[watcher] job {} failed: {:#}", job.name, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn runs_jobs_in_order_and_survives_errors() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let first = Arc::clone(&order);
        let second = Arc::clone(&order);
        let stopper = cancel.clone();
        let rounds = Arc::new(AtomicUsize::new(0));
        let rounds_in_job = Arc::clone(&rounds);

        let watcher = Watcher::new(vec![
            Job::new("first", move |_| {
                let order = Arc::clone(&first);
                async move {
                    order.lock().unwrap().push("first");
                    anyhow::bail!("first always fails");
                }
            }),
            Job::new("second", move |_| {
                let order = Arc::clone(&second);
                let stopper = stopper.clone();
                let rounds = Arc::clone(&rounds_in_job);
                async move {
                    order.lock().unwrap().push("second");
                    if rounds.fetch_add(1, Ordering::SeqCst) >= 1 {
                        stopper.cancel();
                    }
                    Ok(())
                }
            }),
        ])
        .with_delay(Duration::from_millis(1));

        watcher.watch(cancel).await;

        let order = order.lock().unwrap();
        assert_eq!(&*order, &["first", "second", "first", "second"]);
    }

    #[tokio::test]
    async fn cancellation_stops_between_jobs() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_job = Arc::clone(&ran);
        let watcher = Watcher::new(vec![Job::new("noop", move |_| {
            let ran = Arc::clone(&ran_in_job);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })])
        .with_delay(Duration::from_millis(1));

        watcher.watch(cancel).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
