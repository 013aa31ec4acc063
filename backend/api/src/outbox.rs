/// Post-commit side effects
/// Work that must only start once a signature or invoice is durably stored.
/// Each task is retried with exponential backoff on transient failures; a
/// task that finally fails is logged and counted but never rolls back the
/// commit that scheduled it.

use shared::DomainResult;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

use crate::backoff::{execute_with_backoff, ExponentialBackoff};
use crate::config::RetryConfig;
use crate::metrics;

pub type TaskFuture = Pin<Box<dyn Future<Output = DomainResult<()>> + Send>>;

/// A named, re-runnable unit of post-commit work.
pub struct PostCommitTask {
    pub name: &'static str,
    run: Box<dyn Fn() -> TaskFuture + Send + Sync>,
}

impl PostCommitTask {
    pub fn new<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DomainResult<()>> + Send + 'static,
    {
        PostCommitTask {
            name,
            run: Box::new(move || Box::pin(run())),
        }
    }
}

/// Steps of one task that already went through, shared by all its attempts.
///
/// A task chaining several external calls records each of them here, so a
/// retry resumes after the last call that succeeded instead of repeating it.
#[derive(Clone, Default)]
pub struct CompletedSteps {
    done: Arc<Mutex<HashSet<&'static str>>>,
}

impl CompletedSteps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, step: &'static str) -> bool {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(step)
    }

    /// Run `effect` unless `step` succeeded on an earlier attempt.
    pub async fn once<F, Fut>(&self, step: &'static str, effect: F) -> DomainResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DomainResult<()>>,
    {
        if self.contains(step) {
            debug!(step, "step already done on a previous attempt");
            return Ok(());
        }
        effect().await?;
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(step);
        Ok(())
    }
}

/// Ordered list of tasks scheduled by one request.
#[derive(Default)]
pub struct PostCommitTasks {
    tasks: Vec<PostCommitTask>,
}

impl std::fmt::Debug for PostCommitTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|t| t.name))
            .finish()
    }
}

impl PostCommitTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: PostCommitTask) {
        self.tasks.push(task);
    }

    pub fn extend(&mut self, other: PostCommitTasks) {
        self.tasks.extend(other.tasks);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct PostCommitReport {
    pub succeeded: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone, Copy)]
pub struct PostCommitRunner {
    policy: RetryConfig,
}

impl PostCommitRunner {
    pub fn new(policy: RetryConfig) -> Self {
        PostCommitRunner { policy }
    }

    /// Run tasks in order. A failed task does not stop the ones after it.
    pub async fn run(&self, tasks: PostCommitTasks) -> PostCommitReport {
        let mut report = PostCommitReport::default();
        for task in tasks.tasks {
            let backoff = ExponentialBackoff::from_secs(
                self.policy.backoff_base_secs,
                self.policy.backoff_max_secs,
            );
            let outcome =
                execute_with_backoff(backoff, self.policy.max_attempts, || (task.run)()).await;
            metrics::record_post_commit(task.name, outcome.is_ok());

            match outcome {
                Ok(()) => {
                    info!(task = task.name, "post-commit task done");
                    report.succeeded.push(task.name);
                }
                Err(err) => {
                    error!(task = task.name, error = %err, "post-commit task failed");
                    report.failed.push((task.name, err.to_string()));
                }
            }
        }
        report
    }

    /// Detach the tasks from the request; the response is not held back.
    pub fn spawn(&self, tasks: PostCommitTasks) {
        if tasks.is_empty() {
            return;
        }
        let runner = *self;
        tokio::spawn(async move {
            runner.run(tasks).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::DomainError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(max_attempts: u32) -> PostCommitRunner {
        PostCommitRunner::new(RetryConfig {
            max_attempts,
            backoff_base_secs: 1,
            backoff_max_secs: 4,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_order_and_survives_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = PostCommitTasks::new();

        let log = order.clone();
        tasks.push(PostCommitTask::new("integration", move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("integration");
                Err(DomainError::InvalidState("no credentials".into()))
            }
        }));
        let log = order.clone();
        tasks.push(PostCommitTask::new("consumer_email", move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push("consumer_email");
                Ok(())
            }
        }));
        assert_eq!(tasks.names(), vec!["integration", "consumer_email"]);

        let report = runner(3).run(tasks).await;
        assert_eq!(*order.lock().unwrap(), vec!["integration", "consumer_email"]);
        assert_eq!(report.succeeded, vec!["consumer_email"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "integration");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut tasks = PostCommitTasks::new();
        tasks.push(PostCommitTask::new("producer_email", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DomainError::external("email", "HTTP 503"))
                } else {
                    Ok(())
                }
            }
        }));

        let report = runner(3).run(tasks).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.succeeded, vec!["producer_email"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_resume_after_the_last_completed_step() {
        let filings = Arc::new(AtomicU32::new(0));
        let notices = Arc::new(AtomicU32::new(0));
        let steps = CompletedSteps::new();
        let mut tasks = PostCommitTasks::new();

        let (filed, noticed) = (filings.clone(), notices.clone());
        tasks.push(PostCommitTask::new("operation_declaration", move || {
            let (filed, noticed, steps) = (filed.clone(), noticed.clone(), steps.clone());
            async move {
                steps
                    .once("grid_filing", || async {
                        filed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
                steps
                    .once("producer_notice", || async {
                        if noticed.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(DomainError::external("email", "HTTP 502"))
                        } else {
                            Ok(())
                        }
                    })
                    .await
            }
        }));

        let report = runner(3).run(tasks).await;
        assert_eq!(report.succeeded, vec!["operation_declaration"]);
        assert_eq!(filings.load(Ordering::SeqCst), 1);
        assert_eq!(notices.load(Ordering::SeqCst), 2);
    }
}
