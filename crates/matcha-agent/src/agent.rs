//! The provider loop: register once, then heartbeat and poll until told to
//! stop.
//!
//! Heartbeat and poll share one loop. The heartbeat is due when
//! `heartbeat_interval` has elapsed since the last one and is checked at the
//! top of every iteration, so a task that runs for minutes delays the next
//! heartbeat until it finishes. A due heartbeat runs alongside that
//! iteration's poll, bounded by `heartbeat_timeout`, so a slow or failing
//! orchestrator never holds a poll back. Only one task runs at a time.

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use matcha_core::Telemetry;

use crate::config::AgentContext;
use crate::error::AgentError;
use crate::orchestrator::Orchestrator;
use crate::supervisor::ExecutionSupervisor;
use crate::telemetry::TelemetrySource;

pub struct Agent {
    context: Arc<AgentContext>,
    orchestrator: Arc<dyn Orchestrator>,
    telemetry: Arc<dyn TelemetrySource>,
    supervisor: ExecutionSupervisor,
}

impl Agent {
    pub fn new(
        context: Arc<AgentContext>,
        orchestrator: Arc<dyn Orchestrator>,
        telemetry: Arc<dyn TelemetrySource>,
        supervisor: ExecutionSupervisor,
    ) -> Self {
        Self {
            context,
            orchestrator,
            telemetry,
            supervisor,
        }
    }

    /// Announce this node with a fresh snapshot and its accelerators.
    pub async fn register(&self) -> Result<(), AgentError> {
        let telemetry = self.sample().await;
        let accelerators = self.telemetry.accelerators();
        let identity = &self.context.identity;

        info!(
            provider_id = %identity.provider_id,
            user_id = %identity.user_id,
            gpus = accelerators.len(),
            "Registering with orchestrator"
        );
        self.orchestrator
            .register(identity, &telemetry, &accelerators)
            .await
            .map_err(AgentError::Registration)?;
        info!("Registered");
        Ok(())
    }

    /// One best-effort heartbeat, abandoned after `heartbeat_timeout`.
    pub async fn heartbeat(&self) {
        let timeout = self.context.config.heartbeat_timeout;
        let sent = tokio::time::timeout(timeout, async {
            let telemetry = self.sample().await;
            self.orchestrator
                .heartbeat(&self.context.identity.provider_id, &telemetry)
                .await
                .map(|()| telemetry.cpu_load)
        })
        .await;

        match sent {
            Ok(Ok(cpu)) => debug!(cpu, "Heartbeat sent"),
            Ok(Err(e)) => warn!(error = %e, "Heartbeat failed"),
            Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "Heartbeat timed out"),
        }
    }

    /// Ask for one task and run it to completion if there is one.
    ///
    /// Returns whether a task was executed.
    pub async fn poll_once(&self) -> bool {
        let task = match self
            .orchestrator
            .poll_for_task(&self.context.identity.provider_id)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Poll failed");
                return false;
            }
        };

        self.supervisor.run(task).await;
        true
    }

    /// Run the loop until `shutdown` resolves, then send one bounded
    /// offline notification.
    ///
    /// An in-flight task is abandoned where it stands when `shutdown` fires.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = self.run_forever() => {}
            _ = shutdown => info!("Shutdown requested"),
        }
        self.go_offline().await;
    }

    async fn run_forever(&self) {
        let config = &self.context.config;
        let mut last_heartbeat: Option<Instant> = None;

        info!(
            heartbeat_secs = config.heartbeat_interval.as_secs(),
            poll_secs = config.poll_interval.as_secs(),
            "Waiting for tasks"
        );
        loop {
            let due = last_heartbeat.map_or(true, |at| at.elapsed() >= config.heartbeat_interval);
            if due {
                last_heartbeat = Some(Instant::now());
            }

            let heartbeat = async {
                if due {
                    self.heartbeat().await;
                }
            };
            let cycle = async {
                self.poll_once().await;
                tokio::time::sleep(config.poll_interval).await;
            };
            tokio::join!(heartbeat, cycle);
        }
    }

    async fn go_offline(&self) {
        let timeout = self.context.config.offline_timeout;
        let provider_id = &self.context.identity.provider_id;
        let sent = tokio::time::timeout(timeout, self.orchestrator.go_offline(provider_id, timeout)).await;
        match sent {
            Ok(Ok(())) => info!("Marked offline"),
            Ok(Err(e)) => warn!(error = %e, "Offline notification failed"),
            Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "Offline notification timed out"),
        }
    }

    async fn sample(&self) -> Telemetry {
        let source = self.telemetry.clone();
        match tokio::task::spawn_blocking(move || source.sample()).await {
            Ok(telemetry) => telemetry,
            Err(e) => {
                warn!(error = %e, "Telemetry sampling panicked");
                Telemetry::unavailable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use matcha_core::{AcceleratorSpec, ProviderIdentity, Task, TaskStatus};

    use super::*;
    use crate::config::Config;
    use crate::packager::ResultPackager;
    use crate::test_support::{
        Call, FakeExit, FakeOrchestrator, FakeRuntime, FakeScript, FakeUploader, StaticTelemetry,
    };

    struct Harness {
        agent: Agent,
        orchestrator: Arc<FakeOrchestrator>,
        runtime: Arc<FakeRuntime>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn harness(orchestrator: FakeOrchestrator, script: FakeScript) -> Harness {
        harness_with_telemetry(orchestrator, script, StaticTelemetry::default())
    }

    fn harness_with_telemetry(
        orchestrator: FakeOrchestrator,
        script: FakeScript,
        telemetry: StaticTelemetry,
    ) -> Harness {
        let workspace_root = tempfile::tempdir().unwrap();
        let archive_dir = tempfile::tempdir().unwrap();
        let config = Config {
            workspace_root: workspace_root.path().to_path_buf(),
            archive_dir: archive_dir.path().to_path_buf(),
            ..Config::default()
        };
        let context = Arc::new(AgentContext::new(
            ProviderIdentity::new("matcha-test", "user-1"),
            config,
        ));

        let orchestrator = Arc::new(orchestrator);
        let runtime = Arc::new(FakeRuntime::new(script));
        let packager = ResultPackager::new(archive_dir.path(), Arc::new(FakeUploader::default()));
        let supervisor = ExecutionSupervisor::new(
            context.clone(),
            runtime.clone(),
            orchestrator.clone(),
            packager,
            false,
        );
        let agent = Agent::new(
            context,
            orchestrator.clone(),
            Arc::new(telemetry),
            supervisor,
        );
        Harness {
            agent,
            orchestrator,
            runtime,
            _dirs: (workspace_root, archive_dir),
        }
    }

    fn times_of(calls: &[(Instant, Call)], start: Instant, wanted: &Call) -> Vec<u64> {
        calls
            .iter()
            .filter(|(_, c)| c == wanted)
            .map(|(at, _)| at.duration_since(start).as_secs())
            .collect()
    }

    #[tokio::test]
    async fn test_register_failure_is_fatal() {
        let h = harness(
            FakeOrchestrator {
                fail_register: true,
                ..Default::default()
            },
            FakeScript::default(),
        );
        let err = h.agent.register().await.unwrap_err();
        assert!(matches!(err, AgentError::Registration(_)));
    }

    #[tokio::test]
    async fn test_register_success() {
        let h = harness(FakeOrchestrator::default(), FakeScript::default());
        h.agent.register().await.unwrap();
        assert_eq!(h.orchestrator.calls(), vec![Call::Register(Vec::new())]);
    }

    #[tokio::test]
    async fn test_register_advertises_accelerators() {
        let h = harness_with_telemetry(
            FakeOrchestrator::default(),
            FakeScript::default(),
            StaticTelemetry { gpu: true },
        );
        h.agent.register().await.unwrap();
        assert_eq!(
            h.orchestrator.calls(),
            vec![Call::Register(vec![AcceleratorSpec::new(0, "Fake GPU")])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_loop_polls_without_supervisor() {
        let h = harness(FakeOrchestrator::default(), FakeScript::default());
        let start = Instant::now();

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(5)))
            .await;

        let calls = h.orchestrator.timed_calls();
        assert_eq!(times_of(&calls, start, &Call::Poll), vec![0, 2, 4]);
        assert_eq!(times_of(&calls, start, &Call::Heartbeat), vec![0]);
        assert_eq!(calls.last().map(|(_, c)| c.clone()), Some(Call::Offline));
        assert!(h.runtime.launches().is_empty());
        assert!(h.orchestrator.statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_cadence() {
        let h = harness(FakeOrchestrator::default(), FakeScript::default());
        let start = Instant::now();

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(25)))
            .await;

        let calls = h.orchestrator.timed_calls();
        assert_eq!(times_of(&calls, start, &Call::Heartbeat), vec![0, 10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_does_not_block_polling() {
        let h = harness(
            FakeOrchestrator {
                fail_heartbeat: true,
                ..Default::default()
            },
            FakeScript::default(),
        );
        let start = Instant::now();

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(5)))
            .await;

        let calls = h.orchestrator.timed_calls();
        assert_eq!(times_of(&calls, start, &Call::Heartbeat), vec![0]);
        assert_eq!(times_of(&calls, start, &Call::Poll), vec![0, 2, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_heartbeat_does_not_delay_polling() {
        let h = harness(
            FakeOrchestrator {
                fail_heartbeat: true,
                heartbeat_latency: Some(Duration::from_secs(3600)),
                ..Default::default()
            },
            FakeScript::default(),
        );
        let start = Instant::now();

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(15)))
            .await;

        let calls = h.orchestrator.timed_calls();
        assert_eq!(times_of(&calls, start, &Call::Poll), vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(times_of(&calls, start, &Call::Heartbeat), vec![0, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_failure_keeps_looping() {
        let h = harness(
            FakeOrchestrator {
                fail_poll: true,
                ..Default::default()
            },
            FakeScript::default(),
        );
        let start = Instant::now();

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(5)))
            .await;

        let calls = h.orchestrator.timed_calls();
        assert_eq!(times_of(&calls, start, &Call::Poll), vec![0, 2, 4]);
        assert!(h.runtime.launches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_task_per_cycle() {
        let h = harness(
            FakeOrchestrator::with_tasks(vec![
                Task::new("t-1", "https://git.example/a.git"),
                Task::new("t-2", "https://git.example/b.git"),
            ]),
            FakeScript::default(),
        );

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(5)))
            .await;

        assert_eq!(h.runtime.launches().len(), 2);
        let statuses: Vec<_> = h
            .orchestrator
            .statuses()
            .into_iter()
            .map(|u| (u.task_id.to_string(), u.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("t-1".to_string(), TaskStatus::Running),
                ("t-1".to_string(), TaskStatus::Completed),
                ("t-2".to_string(), TaskStatus::Running),
                ("t-2".to_string(), TaskStatus::Completed),
            ]
        );
    }

    // Heartbeats share the poll loop: a task that runs to its 300 s bound
    // holds back the next heartbeat until it is cleaned up.
    #[tokio::test(start_paused = true)]
    async fn test_long_task_delays_heartbeat() {
        let h = harness(
            FakeOrchestrator::with_tasks(vec![Task::new("slow", "https://git.example/slow.git")]),
            FakeScript {
                exit: FakeExit::Hang,
                ..Default::default()
            },
        );
        let start = Instant::now();

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(303)))
            .await;

        let calls = h.orchestrator.timed_calls();
        assert_eq!(times_of(&calls, start, &Call::Heartbeat), vec![0, 302]);
        let terminal = h.orchestrator.terminal_statuses();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].status, TaskStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sends_offline_even_when_it_fails() {
        let h = harness(
            FakeOrchestrator {
                fail_offline: true,
                ..Default::default()
            },
            FakeScript::default(),
        );

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await;

        assert_eq!(
            h.orchestrator.calls().last().cloned(),
            Some(Call::Offline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_notification_is_bounded() {
        let h = harness(
            FakeOrchestrator {
                latency: Some(Duration::from_secs(10)),
                ..Default::default()
            },
            FakeScript::default(),
        );
        let start = Instant::now();

        // Interrupt lands while the first heartbeat is still in flight.
        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await;

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(
            h.orchestrator.calls().last().cloned(),
            Some(Call::Offline)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_abandons_running_task() {
        let h = harness(
            FakeOrchestrator::with_tasks(vec![Task::new("t-1", "https://git.example/a.git")]),
            FakeScript {
                exit: FakeExit::Hang,
                ..Default::default()
            },
        );

        h.agent
            .run_until(tokio::time::sleep(Duration::from_secs(30)))
            .await;

        // RUNNING was sent, no terminal status, and the container was left alone.
        assert_eq!(h.orchestrator.statuses().len(), 1);
        assert!(h.orchestrator.terminal_statuses().is_empty());
        assert_eq!(h.runtime.stops(), 0);
        assert_eq!(h.runtime.removes(), 0);
        assert_eq!(
            h.orchestrator.calls().last().cloned(),
            Some(Call::Offline)
        );
    }
}
