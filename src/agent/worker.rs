//! Worker loop: claim, compute, optionally wait, submit.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::source::TaskSource;
use crate::config::AgentConfig;
use crate::error::Error;
use crate::model::{ClaimedTask, TaskId, TaskOutcome, WorkerCapabilities};

/// Compute a claimed task. Division by zero and non-finite results become
/// a failed outcome, never a default value.
pub fn compute(task: &ClaimedTask) -> TaskOutcome {
    TaskOutcome::from(task.operation.apply(task.arg1, task.arg2))
}

/// Exponential back-off between empty polls.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Add up to 25% random jitter so idle workers do not poll in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis < 4 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=millis / 4);
    Duration::from_millis(millis + jitter)
}

/// What one iteration of the loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// A task was computed and its outcome delivered (or rejected as stale).
    Processed(TaskId),
    /// Nothing was ready.
    Idle,
}

/// A single polling worker.
pub struct Worker {
    source: Arc<dyn TaskSource>,
    capabilities: WorkerCapabilities,
    poll_interval: Duration,
    max_poll_interval: Duration,
    simulate_latency: bool,
}

impl Worker {
    pub fn new(source: Arc<dyn TaskSource>, worker_id: impl Into<String>, config: &AgentConfig) -> Self {
        Self {
            source,
            capabilities: WorkerCapabilities::new(worker_id)
                .with_operators(config.operators.clone()),
            poll_interval: config.poll_interval,
            max_poll_interval: config.max_poll_interval,
            simulate_latency: config.simulate_latency,
        }
    }

    pub fn id(&self) -> &str {
        &self.capabilities.worker_id
    }

    /// Claim and process at most one task.
    ///
    /// Rejected submissions (not found, already completed, lease lapsed) are
    /// logged and count as processed; transport failures are returned.
    pub async fn run_once(&self) -> Result<Step, Error> {
        let Some(task) = self.source.claim(&self.capabilities).await? else {
            return Ok(Step::Idle);
        };

        debug!(
            worker = %self.id(),
            task_id = task.id,
            operation = %task.operation,
            arg1 = task.arg1,
            arg2 = task.arg2,
            "Computing task"
        );
        let outcome = compute(&task);

        if self.simulate_latency && task.operation_time > 0 {
            tokio::time::sleep(Duration::from_millis(task.operation_time)).await;
        }

        match self.source.submit(task.id, outcome).await {
            Ok(()) => {
                info!(worker = %self.id(), task_id = task.id, "Task done");
            }
            Err(Error::Task(rejection)) => {
                warn!(worker = %self.id(), task_id = task.id, error = %rejection, "Submission rejected");
            }
            Err(e) => return Err(e),
        }
        Ok(Step::Processed(task.id))
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id(), operators = ?self.capabilities.operators, "Worker started");
        let mut backoff = Backoff::new(self.poll_interval, self.max_poll_interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(Step::Processed(_)) => {
                    backoff.reset();
                    continue;
                }
                Ok(Step::Idle) => backoff.next_delay(),
                Err(e) => {
                    warn!(worker = %self.id(), error = %e, "Worker iteration failed");
                    backoff.next_delay()
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(with_jitter(delay)) => {}
            }
        }

        info!(worker = %self.id(), "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::agent::source::LocalTaskSource;
    use crate::config::{OperationTimes, SchedulerConfig};
    use crate::error::{AgentError, TaskError};
    use crate::model::{ExpressionStatus, Operator};
    use crate::scheduler::Scheduler;
    use crate::store::LibSqlBackend;

    fn test_config() -> AgentConfig {
        AgentConfig {
            poll_interval: Duration::from_millis(5),
            max_poll_interval: Duration::from_millis(20),
            simulate_latency: false,
            ..AgentConfig::default()
        }
    }

    async fn test_scheduler() -> Arc<Scheduler> {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Arc::new(Scheduler::new(
            store,
            SchedulerConfig {
                operation_times: OperationTimes::zero(),
                ..SchedulerConfig::default()
            },
        ))
    }

    /// Hands out one fixed task and answers every submission with `reply`.
    struct ScriptedSource {
        task: Mutex<Option<ClaimedTask>>,
        reply: fn(TaskId) -> Result<(), Error>,
        submitted: Mutex<Vec<TaskOutcome>>,
    }

    impl ScriptedSource {
        fn new(task: ClaimedTask, reply: fn(TaskId) -> Result<(), Error>) -> Self {
            Self {
                task: Mutex::new(Some(task)),
                reply,
                submitted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskSource for ScriptedSource {
        async fn claim(&self, _worker: &WorkerCapabilities) -> Result<Option<ClaimedTask>, Error> {
            Ok(self.task.lock().unwrap().take())
        }

        async fn submit(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<(), Error> {
            self.submitted.lock().unwrap().push(outcome);
            (self.reply)(task_id)
        }
    }

    fn division(arg2: f64) -> ClaimedTask {
        ClaimedTask {
            id: 1,
            expression_id: 1,
            order: 0,
            operation: Operator::Divide,
            arg1: 10.0,
            arg2,
            operation_time: 0,
        }
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        for _ in 0..100 {
            let delay = with_jitter(Duration::from_millis(1000));
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn compute_reports_division_by_zero() {
        assert_eq!(compute(&division(2.0)), TaskOutcome::Value(5.0));
        assert!(matches!(compute(&division(0.0)), TaskOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn run_once_submits_failure_outcome() {
        let source = Arc::new(ScriptedSource::new(division(0.0), |_| Ok(())));
        let worker = Worker::new(source.clone(), "w1", &test_config());

        assert_eq!(worker.run_once().await.unwrap(), Step::Processed(1));
        assert_eq!(worker.run_once().await.unwrap(), Step::Idle);

        let submitted = source.submitted.lock().unwrap();
        assert!(matches!(&submitted[..], [TaskOutcome::Failed(reason)] if reason.contains("division by zero")));
    }

    #[tokio::test]
    async fn rejected_submission_is_not_an_error() {
        let source = Arc::new(ScriptedSource::new(division(2.0), |id| {
            Err(TaskError::AlreadyCompleted { id }.into())
        }));
        let worker = Worker::new(source, "w1", &test_config());
        assert_eq!(worker.run_once().await.unwrap(), Step::Processed(1));
    }

    #[tokio::test]
    async fn transport_failure_is_returned() {
        let source = Arc::new(ScriptedSource::new(division(2.0), |_| {
            Err(AgentError::Transport("connection refused".into()).into())
        }));
        let worker = Worker::new(source, "w1", &test_config());
        assert!(matches!(worker.run_once().await, Err(Error::Agent(_))));
    }

    #[tokio::test]
    async fn workers_evaluate_expression_end_to_end() {
        let scheduler = test_scheduler().await;
        let id = scheduler
            .submit_expression("alice", "10 / 2 + 3 * 4")
            .await
            .unwrap();

        let source: Arc<dyn TaskSource> = Arc::new(LocalTaskSource::new(Arc::clone(&scheduler)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        for i in 0..3 {
            let worker = Worker::new(Arc::clone(&source), format!("w{i}"), &test_config());
            let rx = shutdown_rx.clone();
            handles.push(tokio::spawn(async move { worker.run(rx).await }));
        }

        let expression = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let expr = scheduler.get_expression(id).await.unwrap().unwrap();
                if expr.status.is_terminal() {
                    return expr;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("expression did not finish");

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(expression.status, ExpressionStatus::Completed);
        assert_eq!(expression.result, Some(17.0));
    }

    #[tokio::test]
    async fn restricted_worker_leaves_other_operators() {
        let scheduler = test_scheduler().await;
        scheduler.submit_expression("alice", "6/3").await.unwrap();

        let source: Arc<dyn TaskSource> = Arc::new(LocalTaskSource::new(Arc::clone(&scheduler)));
        let config = AgentConfig {
            operators: vec![Operator::Add, Operator::Subtract],
            ..test_config()
        };
        let worker = Worker::new(source, "adder", &config);
        assert_eq!(worker.run_once().await.unwrap(), Step::Idle);
    }

    #[tokio::test]
    async fn slow_task_outlives_short_lease() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let scheduler = Arc::new(Scheduler::new(
            store,
            SchedulerConfig {
                operation_times: OperationTimes {
                    addition: Duration::from_millis(400),
                    ..OperationTimes::zero()
                },
                lease_timeout: Duration::from_millis(150),
                sweep_interval: Duration::from_millis(100),
            },
        ));
        let id = scheduler.submit_expression("alice", "1+1").await.unwrap();
        let sweep = crate::scheduler::spawn_lease_sweep(Arc::clone(&scheduler));

        let source: Arc<dyn TaskSource> = Arc::new(LocalTaskSource::new(Arc::clone(&scheduler)));
        let config = AgentConfig {
            simulate_latency: true,
            ..test_config()
        };
        let worker = Worker::new(source, "solo", &config);
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        let expression = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let expression = scheduler.get_expression(id).await.unwrap().unwrap();
                if expression.status.is_terminal() {
                    return expression;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("expression never finished");

        shutdown.send(true).unwrap();
        handle.await.unwrap();
        sweep.abort();

        assert_eq!(expression.status, ExpressionStatus::Completed);
        assert_eq!(expression.result, Some(2.0));
        let tasks = scheduler.list_tasks(id).await.unwrap();
        assert_eq!(tasks[0].attempts, 1);
    }
}
