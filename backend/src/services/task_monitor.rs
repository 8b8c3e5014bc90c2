//! Polls a remote task until it reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::models::remote_task::{RemoteTask, TaskState};
use crate::services::metrics_service;
use crate::services::pulp_client::RepoServerClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Consecutive transport failures tolerated before giving up.
    pub failure_budget: u32,
    pub backoff_cap: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            failure_budget: 5,
            backoff_cap: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    Succeeded { created_resources: Vec<String> },
    /// The server reports the task failed or was cancelled.
    Failed { error: String },
    TimedOut,
    Cancelled,
    /// The monitor could not reach the task; its real state is unknown.
    MonitorFailed { error: String },
}

pub struct TaskMonitor {
    client: Arc<dyn RepoServerClient>,
    config: MonitorConfig,
}

impl TaskMonitor {
    pub fn new(client: Arc<dyn RepoServerClient>, config: MonitorConfig) -> Self {
        Self { client, config }
    }

    /// Delay after `failures` consecutive poll errors.
    pub fn failure_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        std::cmp::min(
            self.config.backoff_cap,
            self.config.poll_interval.saturating_mul(factor),
        )
    }

    /// Poll `task` until it is terminal, `timeout` elapses or `cancel` fires.
    ///
    /// `task.state` tracks the last state the server reported.
    pub async fn wait(
        &self,
        server: &str,
        task: &mut RemoteTask,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> MonitorOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut failures: u32 = 0;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return MonitorOutcome::Cancelled,
                _ = expiry(deadline) => return MonitorOutcome::TimedOut,
                polled = self.client.poll_task(server, &task.handle) => polled,
            };

            let delay = match polled {
                Ok(poll) => {
                    failures = 0;
                    task.state = poll.state;
                    task.last_polled_at = Some(Utc::now());

                    if poll.state.is_terminal() {
                        metrics_service::record_task_poll("terminal");
                        return if poll.state.is_success() {
                            MonitorOutcome::Succeeded {
                                created_resources: poll.created_resources,
                            }
                        } else {
                            MonitorOutcome::Failed {
                                error: poll
                                    .error
                                    .unwrap_or_else(|| terminal_message(poll.state)),
                            }
                        };
                    }
                    metrics_service::record_task_poll("ok");
                    self.config.poll_interval
                }
                Err(e) => {
                    metrics_service::record_task_poll("error");
                    if !e.is_transient() {
                        return MonitorOutcome::MonitorFailed {
                            error: e.to_string(),
                        };
                    }
                    failures += 1;
                    if failures > self.config.failure_budget {
                        return MonitorOutcome::MonitorFailed {
                            error: format!("{} consecutive poll failures, last: {}", failures, e),
                        };
                    }
                    let delay = self.failure_delay(failures);
                    tracing::debug!(
                        server,
                        task = %task.handle,
                        "Poll failed ({}/{}), retrying in {:?}: {}",
                        failures,
                        self.config.failure_budget,
                        delay,
                        e
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return MonitorOutcome::Cancelled,
                _ = expiry(deadline) => return MonitorOutcome::TimedOut,
                _ = sleep(delay) => {}
            }
        }
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn terminal_message(state: TaskState) -> String {
    match state {
        TaskState::Canceled => "task was canceled on the server".to_string(),
        other => format!("task ended in state {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::remote_task::{RemoteTaskHandle, StepStart, TaskPoll};
    use crate::models::repo::{FollowUpStep, RemoteRepo, RemoteRepoState};
    use crate::models::remote_task::Operation;
    use crate::services::pulp_client::RemoteError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns scripted poll results, then repeats the last one.
    struct ScriptedPolls {
        script: Mutex<VecDeque<Result<TaskPoll, RemoteError>>>,
        polls: Mutex<u32>,
    }

    impl ScriptedPolls {
        fn new(script: Vec<Result<TaskPoll, RemoteError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                polls: Mutex::new(0),
            })
        }

        fn polls(&self) -> u32 {
            *self.polls.lock().unwrap()
        }
    }

    #[async_trait]
    impl RepoServerClient for ScriptedPolls {
        async fn list_repos(&self, _server: &str) -> Result<Vec<RemoteRepo>, RemoteError> {
            Ok(Vec::new())
        }

        async fn describe_repo(
            &self,
            _server: &str,
            _repo: &RemoteRepo,
        ) -> Result<RemoteRepoState, RemoteError> {
            unimplemented!()
        }

        async fn trigger(
            &self,
            _server: &str,
            _repo: &RemoteRepo,
            _operation: &Operation,
        ) -> Result<StepStart, RemoteError> {
            unimplemented!()
        }

        async fn start_follow_up(
            &self,
            _server: &str,
            _repo: &RemoteRepo,
            _operation: &Operation,
            _step: FollowUpStep,
        ) -> Result<StepStart, RemoteError> {
            unimplemented!()
        }

        async fn poll_task(
            &self,
            _server: &str,
            _handle: &RemoteTaskHandle,
        ) -> Result<TaskPoll, RemoteError> {
            *self.polls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }

        async fn cancel_task(
            &self,
            _server: &str,
            _handle: &RemoteTaskHandle,
        ) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn register_mirror(
            &self,
            _server: &str,
            _source_server: &str,
            _repo: &RemoteRepo,
        ) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_secs(10),
            failure_budget: 2,
            backoff_cap: Duration::from_secs(30),
        }
    }

    fn task() -> RemoteTask {
        RemoteTask::new(RemoteTaskHandle("/pulp/api/v3/tasks/1/".to_string()))
    }

    fn timeout_error() -> RemoteError {
        RemoteError::Timeout("poll".to_string())
    }

    #[test]
    fn test_failure_delay() {
        let monitor = TaskMonitor::new(ScriptedPolls::new(vec![Ok(TaskPoll::waiting())]), config());
        assert_eq!(monitor.failure_delay(1), Duration::from_secs(10));
        assert_eq!(monitor.failure_delay(2), Duration::from_secs(20));
        assert_eq!(monitor.failure_delay(3), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_then_completed() {
        let client = ScriptedPolls::new(vec![
            Ok(TaskPoll::waiting()),
            Ok(TaskPoll::waiting()),
            Ok(TaskPoll::waiting()),
            Ok(TaskPoll {
                state: TaskState::Completed,
                error: None,
                created_resources: vec!["/pulp/api/v3/publications/1/".to_string()],
            }),
        ]);
        let monitor = TaskMonitor::new(client.clone(), config());
        let mut task = task();
        let outcome = monitor
            .wait("pulp1", &mut task, None, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            MonitorOutcome::Succeeded {
                created_resources: vec!["/pulp/api/v3/publications/1/".to_string()]
            }
        );
        assert_eq!(client.polls(), 4);
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.last_polled_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure() {
        let client = ScriptedPolls::new(vec![Ok(TaskPoll::failed("bad checksum"))]);
        let monitor = TaskMonitor::new(client, config());
        let outcome = monitor
            .wait("pulp1", &mut task(), None, &CancellationToken::new())
            .await;
        assert_eq!(
            outcome,
            MonitorOutcome::Failed {
                error: "bad checksum".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_cancel_is_failure() {
        let client = ScriptedPolls::new(vec![Ok(TaskPoll {
            state: TaskState::Canceled,
            error: None,
            created_resources: Vec::new(),
        })]);
        let monitor = TaskMonitor::new(client, config());
        let outcome = monitor
            .wait("pulp1", &mut task(), None, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, MonitorOutcome::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_errors_recover() {
        let client = ScriptedPolls::new(vec![
            Err(timeout_error()),
            Err(timeout_error()),
            Ok(TaskPoll::completed()),
        ]);
        let monitor = TaskMonitor::new(client.clone(), config());
        let outcome = monitor
            .wait("pulp1", &mut task(), None, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, MonitorOutcome::Succeeded { .. }));
        assert_eq!(client.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_budget_escalates() {
        let client = ScriptedPolls::new(vec![Err(timeout_error())]);
        let monitor = TaskMonitor::new(client.clone(), config());
        let outcome = monitor
            .wait("pulp1", &mut task(), None, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, MonitorOutcome::MonitorFailed { .. }));
        assert_eq!(client.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_poll_error_escalates_immediately() {
        let client = ScriptedPolls::new(vec![Err(RemoteError::NotFound("task".to_string()))]);
        let monitor = TaskMonitor::new(client.clone(), config());
        let outcome = monitor
            .wait("pulp1", &mut task(), None, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, MonitorOutcome::MonitorFailed { .. }));
        assert_eq!(client.polls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let client = ScriptedPolls::new(vec![Ok(TaskPoll::waiting())]);
        let monitor = TaskMonitor::new(client, config());
        let outcome = monitor
            .wait(
                "pulp1",
                &mut task(),
                Some(Duration::from_secs(35)),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcome, MonitorOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let client = ScriptedPolls::new(vec![Ok(TaskPoll::waiting())]);
        let monitor = TaskMonitor::new(client.clone(), config());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            canceller.cancel();
        });
        let outcome = monitor.wait("pulp1", &mut task(), None, &cancel).await;
        assert_eq!(outcome, MonitorOutcome::Cancelled);
        assert_eq!(client.polls(), 3);
    }
}
