//! Scheduler — submission, claiming, result intake and aggregation.
//!
//! Holds no task state of its own. Every transition is delegated to the
//! `TaskStore` as a conditional update, so any number of `Scheduler`
//! instances may serve the same store.

pub mod aggregator;
pub mod lease;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{DatabaseError, Error, GraphError, Result, TaskError};
use crate::model::{
    ClaimedTask, Expression, ExpressionId, ExpressionStatus, SubmitReceipt, Task, TaskId,
    TaskOutcome, TaskStatus, WorkerCapabilities,
};
use crate::parser;
use crate::store::TaskStore;

pub use aggregator::{Aggregate, aggregate};
pub use lease::spawn_lease_sweep;

/// Hands out tasks and folds their results back into expressions.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Parse `text`, split it into tasks and persist both.
    ///
    /// Malformed input is rejected before anything is written.
    pub async fn submit_expression(&self, owner_id: &str, text: &str) -> Result<ExpressionId> {
        let postfix = parser::parse(text)?;
        debug!(postfix = %parser::format_postfix(&postfix), "Expression parsed");
        let tasks = parser::build_tasks(&postfix, &self.config.operation_times)?;
        let id = self.store.create_expression(owner_id, text, &tasks).await?;

        info!(
            expression_id = id,
            owner = owner_id,
            tasks = tasks.len(),
            "Expression submitted"
        );
        Ok(id)
    }

    /// Claim the next ready task for `worker`.
    ///
    /// `Ok(None)` means nothing is ready; callers back off and retry.
    pub async fn claim_next(&self, worker: &WorkerCapabilities) -> Result<Option<ClaimedTask>> {
        let now = Utc::now();
        self.store.release_expired_claims(now).await?;

        // The store extends this by the task's operation time.
        let lease = chrono::Duration::from_std(self.config.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let Some(task) = self
            .store
            .claim_next_task(worker, now, now + lease)
            .await?
        else {
            debug!(worker = %worker.worker_id, "No task available");
            return Ok(None);
        };

        if task.claimed_by.as_deref() != Some(worker.worker_id.as_str()) {
            error!(
                task_id = task.id,
                worker = %worker.worker_id,
                holder = ?task.claimed_by,
                error = %TaskError::ClaimConflict { id: task.id },
                "Store returned a task held by another worker"
            );
            return Ok(None);
        }

        let (arg1, arg2) = match self.resolve_operands(&task).await {
            Ok(args) => args,
            Err(Error::Graph(e)) => {
                error!(task_id = task.id, error = %e, "Cannot resolve task operands");
                self.record(task.id, TaskOutcome::Failed(e.to_string()))
                    .await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if self
            .store
            .mark_expression_in_progress(task.expression_id)
            .await?
        {
            info!(expression_id = task.expression_id, "Expression in progress");
        }

        info!(
            task_id = task.id,
            expression_id = task.expression_id,
            order = task.order,
            worker = %worker.worker_id,
            attempt = task.attempts,
            "Task claimed"
        );

        Ok(Some(ClaimedTask {
            id: task.id,
            expression_id: task.expression_id,
            order: task.order,
            operation: task.operator,
            arg1,
            arg2,
            operation_time: task.operation_time_ms,
        }))
    }

    /// Record a worker's outcome for a claimed task and re-aggregate its expression.
    pub async fn submit_result(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<SubmitReceipt> {
        if matches!(outcome, TaskOutcome::Value(v) if !v.is_finite()) {
            return Err(TaskError::InvalidOutcome { id: task_id }.into());
        }
        self.record(task_id, outcome).await
    }

    /// Expression by id, regardless of owner.
    pub async fn get_expression(&self, id: ExpressionId) -> Result<Option<Expression>> {
        Ok(self.store.get_expression(id).await?)
    }

    /// Expressions of `owner_id`, newest first.
    pub async fn list_expressions(&self, owner_id: &str) -> Result<Vec<Expression>> {
        Ok(self.store.list_expressions(owner_id).await?)
    }

    /// Tasks of an expression in evaluation order.
    pub async fn list_tasks(&self, expression_id: ExpressionId) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(expression_id).await?)
    }

    /// Return every expired claim to pending.
    pub async fn release_expired(&self) -> Result<usize> {
        Ok(self.store.release_expired_claims(Utc::now()).await?)
    }

    async fn record(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<SubmitReceipt> {
        if !self.store.complete_task(task_id, &outcome, Utc::now()).await? {
            let rejection = match self.store.get_task(task_id).await? {
                None => TaskError::NotFound { id: task_id },
                Some(task) if task.status == TaskStatus::Completed => {
                    TaskError::AlreadyCompleted { id: task_id }
                }
                Some(_) => TaskError::NotClaimed { id: task_id },
            };
            warn!(task_id, error = %rejection, "Result rejected");
            return Err(rejection.into());
        }

        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound { id: task_id })?;

        match &outcome {
            TaskOutcome::Value(v) => {
                info!(task_id, expression_id = task.expression_id, result = *v, "Task completed")
            }
            TaskOutcome::Failed(reason) => {
                warn!(task_id, expression_id = task.expression_id, reason = %reason, "Task failed")
            }
        }

        let expression_status = self.aggregate_expression(task.expression_id).await?;
        Ok(SubmitReceipt {
            task_id,
            expression_id: task.expression_id,
            expression_status,
        })
    }

    /// Substitute task references with the results they point at.
    async fn resolve_operands(&self, task: &Task) -> Result<(f64, f64)> {
        let mut results: HashMap<u32, f64> = HashMap::new();
        if task.dependencies().next().is_some() {
            for dep in self.store.list_tasks(task.expression_id).await? {
                if let (TaskStatus::Completed, Some(value)) = (dep.status, dep.result) {
                    results.insert(dep.order, value);
                }
            }
        }

        let arg1 = aggregator::resolve_operand(task.arg1, task.order, &results)?;
        let arg2 = aggregator::resolve_operand(task.arg2, task.order, &results)?;
        Ok((arg1, arg2))
    }

    /// Fold the expression's tasks and move it to a terminal state if possible.
    async fn aggregate_expression(&self, expression_id: ExpressionId) -> Result<ExpressionStatus> {
        let tasks = self.store.list_tasks(expression_id).await?;

        match aggregate(&tasks) {
            Ok(Aggregate::Incomplete) => {
                debug!(expression_id, "Expression still has open tasks");
            }
            Ok(Aggregate::Completed(value)) => {
                if self
                    .store
                    .finish_expression(expression_id, ExpressionStatus::Completed, Some(value), None)
                    .await?
                {
                    info!(expression_id, result = value, "Expression completed");
                }
            }
            Ok(Aggregate::Failed(reason)) => {
                if self
                    .store
                    .finish_expression(expression_id, ExpressionStatus::Failed, None, Some(&reason))
                    .await?
                {
                    warn!(expression_id, reason = %reason, "Expression failed");
                }
            }
            Err(e) => {
                error!(expression_id, error = %e, "Task graph is inconsistent");
                self.fail_expression(expression_id, &e).await?;
            }
        }

        let expression = self
            .store
            .get_expression(expression_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "expression".to_string(),
                id: expression_id.to_string(),
            })?;
        Ok(expression.status)
    }

    async fn fail_expression(&self, expression_id: ExpressionId, e: &GraphError) -> Result<()> {
        self.store
            .finish_expression(
                expression_id,
                ExpressionStatus::Failed,
                None,
                Some(&e.to_string()),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::OperationTimes;
    use crate::error::SyntaxError;
    use crate::model::Operator;
    use crate::store::LibSqlBackend;

    async fn test_scheduler(lease_timeout: Duration) -> Scheduler {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Scheduler::new(
            store,
            SchedulerConfig {
                operation_times: OperationTimes::zero(),
                lease_timeout,
                ..SchedulerConfig::default()
            },
        )
    }

    fn worker(id: &str) -> WorkerCapabilities {
        WorkerCapabilities::new(id)
    }

    /// Claim and compute until nothing is ready, like a single worker would.
    async fn drain(scheduler: &Scheduler) -> usize {
        let mut processed = 0;
        while let Some(task) = scheduler.claim_next(&worker("w1")).await.unwrap() {
            let outcome = TaskOutcome::from(task.operation.apply(task.arg1, task.arg2));
            scheduler.submit_result(task.id, outcome).await.unwrap();
            processed += 1;
        }
        processed
    }

    async fn evaluate(scheduler: &Scheduler, text: &str) -> Expression {
        let id = scheduler.submit_expression("alice", text).await.unwrap();
        drain(scheduler).await;
        scheduler.get_expression(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn precedence_examples() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;

        for (text, tasks, value) in [("2+3*4", 2, 14.0), ("(2+3)*4", 2, 20.0), ("10/2+3*4", 3, 17.0)] {
            let expr = evaluate(&scheduler, text).await;
            assert_eq!(expr.status, ExpressionStatus::Completed, "{text}");
            assert_eq!(expr.result, Some(value), "{text}");
            assert_eq!(expr.task_ids.len(), tasks, "{text}");
        }
    }

    #[tokio::test]
    async fn operands_are_resolved_before_hand_out() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        scheduler.submit_expression("alice", "2+3*4").await.unwrap();

        let first = scheduler.claim_next(&worker("w1")).await.unwrap().unwrap();
        assert_eq!((first.operation, first.arg1, first.arg2), (Operator::Multiply, 3.0, 4.0));

        // The addition waits for the multiplication.
        assert!(scheduler.claim_next(&worker("w2")).await.unwrap().is_none());

        scheduler.submit_result(first.id, TaskOutcome::Value(12.0)).await.unwrap();
        let second = scheduler.claim_next(&worker("w2")).await.unwrap().unwrap();
        assert_eq!((second.operation, second.arg1, second.arg2), (Operator::Add, 2.0, 12.0));
    }

    #[tokio::test]
    async fn division_by_zero_fails_the_expression() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        let expr = evaluate(&scheduler, "5/0").await;

        assert_eq!(expr.status, ExpressionStatus::Failed);
        assert_eq!(expr.result, None);
        assert!(expr.error.unwrap().contains("division by zero"));

        let tasks = scheduler.list_tasks(expr.id).await.unwrap();
        assert_eq!(tasks[0].result, None);
        assert!(tasks[0].error.is_some());
    }

    #[tokio::test]
    async fn failure_stops_remaining_tasks() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        let id = scheduler.submit_expression("alice", "1/0+2*3").await.unwrap();

        let division = scheduler.claim_next(&worker("w1")).await.unwrap().unwrap();
        let multiplication = scheduler.claim_next(&worker("w2")).await.unwrap().unwrap();
        assert_eq!(division.operation, Operator::Divide);

        let receipt = scheduler
            .submit_result(division.id, TaskOutcome::Failed("division by zero".into()))
            .await
            .unwrap();
        assert_eq!(receipt.expression_status, ExpressionStatus::Failed);

        // Late sibling result is accepted but cannot revive the expression.
        let receipt = scheduler
            .submit_result(multiplication.id, TaskOutcome::Value(6.0))
            .await
            .unwrap();
        assert_eq!(receipt.expression_status, ExpressionStatus::Failed);
        assert!(scheduler.claim_next(&worker("w1")).await.unwrap().is_none());

        let expr = scheduler.get_expression(id).await.unwrap().unwrap();
        assert_eq!(expr.status, ExpressionStatus::Failed);
    }

    #[tokio::test]
    async fn malformed_input_persists_nothing() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        for text in ["3+", "3+*4", "(3+4"] {
            let err = scheduler.submit_expression("alice", text).await.unwrap_err();
            assert!(matches!(err, Error::Syntax(_)), "{text}: {err}");
        }
        assert!(matches!(
            scheduler.submit_expression("alice", "2 $ 3").await.unwrap_err(),
            Error::Syntax(SyntaxError::InvalidCharacter { ch: '$', .. })
        ));
        assert!(matches!(
            scheduler.submit_expression("alice", "42").await.unwrap_err(),
            Error::Graph(GraphError::BareLiteral)
        ));

        assert!(scheduler.list_expressions("alice").await.unwrap().is_empty());
        assert!(scheduler.claim_next(&worker("w1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expression_moves_to_in_progress_on_first_claim() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        let id = scheduler.submit_expression("alice", "1+2*3").await.unwrap();
        assert_eq!(
            scheduler.get_expression(id).await.unwrap().unwrap().status,
            ExpressionStatus::Pending
        );

        let task = scheduler.claim_next(&worker("w1")).await.unwrap().unwrap();
        assert_eq!(
            scheduler.get_expression(id).await.unwrap().unwrap().status,
            ExpressionStatus::InProgress
        );

        let receipt = scheduler.submit_result(task.id, TaskOutcome::Value(6.0)).await.unwrap();
        assert_eq!(receipt.expression_status, ExpressionStatus::InProgress);
        assert_eq!(receipt.expression_id, id);
    }

    #[tokio::test]
    async fn double_submit_is_already_completed() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        let id = scheduler.submit_expression("alice", "3+5").await.unwrap();

        let task = scheduler.claim_next(&worker("w1")).await.unwrap().unwrap();
        scheduler.submit_result(task.id, TaskOutcome::Value(8.0)).await.unwrap();

        let err = scheduler
            .submit_result(task.id, TaskOutcome::Value(100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::AlreadyCompleted { .. })));

        let expr = scheduler.get_expression(id).await.unwrap().unwrap();
        assert_eq!(expr.status, ExpressionStatus::Completed);
        assert_eq!(expr.result, Some(8.0));
        assert_eq!(scheduler.list_tasks(id).await.unwrap()[0].result, Some(8.0));
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        let err = scheduler
            .submit_result(404, TaskOutcome::Value(1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::NotFound { id: 404 })));
    }

    #[tokio::test]
    async fn non_finite_value_is_rejected() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        scheduler.submit_expression("alice", "1+1").await.unwrap();
        let task = scheduler.claim_next(&worker("w1")).await.unwrap().unwrap();

        let err = scheduler
            .submit_result(task.id, TaskOutcome::Value(f64::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::InvalidOutcome { .. })));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let scheduler = test_scheduler(Duration::ZERO).await;
        let id = scheduler.submit_expression("alice", "4*5").await.unwrap();

        let abandoned = scheduler.claim_next(&worker("crashed")).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // The next claim lazily releases the expired lease.
        let retried = scheduler.claim_next(&worker("healthy")).await.unwrap().unwrap();
        assert_eq!(retried.id, abandoned.id);

        let tasks = scheduler.list_tasks(id).await.unwrap();
        assert_eq!(tasks[0].attempts, 2);
        assert_eq!(tasks[0].claimed_by.as_deref(), Some("healthy"));
    }

    #[tokio::test]
    async fn late_submission_after_release_is_not_claimed() {
        let scheduler = test_scheduler(Duration::ZERO).await;
        scheduler.submit_expression("alice", "4*5").await.unwrap();

        let task = scheduler.claim_next(&worker("slow")).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(scheduler.release_expired().await.unwrap(), 1);

        let err = scheduler
            .submit_result(task.id, TaskOutcome::Value(20.0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::NotClaimed { .. })));
    }

    #[tokio::test]
    async fn operator_restricted_worker_only_sees_its_operators() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        scheduler.submit_expression("alice", "8/2").await.unwrap();

        let adder = worker("adder").with_operators(vec![Operator::Add]);
        assert!(scheduler.claim_next(&adder).await.unwrap().is_none());

        let divider = worker("divider").with_operators(vec![Operator::Divide]);
        let task = scheduler.claim_next(&divider).await.unwrap().unwrap();
        assert_eq!((task.arg1, task.arg2), (8.0, 2.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_get_distinct_tasks() {
        let scheduler = Arc::new(test_scheduler(Duration::from_secs(30)).await);
        for i in 0..8 {
            scheduler
                .submit_expression("alice", &format!("{i}+1"))
                .await
                .unwrap();
        }

        let claims = futures::future::join_all((0..24).map(|i| {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .claim_next(&worker(&format!("w{i}")))
                    .await
                    .unwrap()
            })
        }))
        .await;

        let mut ids: Vec<TaskId> = claims
            .into_iter()
            .filter_map(|joined| joined.unwrap())
            .map(|task| task.id)
            .collect();
        assert_eq!(ids.len(), 8);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[tokio::test]
    async fn distributed_run_matches_direct_solve() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        for text in [
            "8-3-2",
            "16/4/2",
            "2*(3+(4-1))",
            "((1+2)*(3-4))/(5+6*7)",
            "100 - (20 + 30) * 2 / (1 + 4)",
        ] {
            let expr = evaluate(&scheduler, text).await;
            assert_eq!(expr.result, Some(parser::solve(text).unwrap()), "{text}");
        }
    }

    #[tokio::test]
    async fn listing_is_per_owner() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        let mine = scheduler.submit_expression("alice", "1+1").await.unwrap();
        let theirs = scheduler.submit_expression("bob", "2+2").await.unwrap();

        let listed = scheduler.list_expressions("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, mine);

        // Lookup by id is not owner-scoped.
        assert!(scheduler.get_expression(theirs).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn long_expression_is_accepted() {
        let scheduler = test_scheduler(Duration::from_secs(30)).await;
        let text = vec!["1"; 5001].join("+");
        let id = scheduler.submit_expression("alice", &text).await.unwrap();

        assert_eq!(scheduler.list_tasks(id).await.unwrap().len(), 5000);
        let first = scheduler.claim_next(&worker("w1")).await.unwrap().unwrap();
        assert_eq!((first.order, first.arg1, first.arg2), (0, 1.0, 1.0));
    }
}
