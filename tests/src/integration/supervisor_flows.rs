//! # Supervisor Flows
//!
//! Liveness that survives PID reuse, one death-watch for many processes,
//! and the restart throttle as seen from the bus.

#[cfg(test)]
mod tests {
    use shared_bus::{EventFilter, EventTopic, InMemoryEventBus, ServiceEvent};
    use shared_types::testing::{SimulatedPlatform, SERVICE_PID};
    use shared_types::{Platform, SharedPlatform};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use sv_02_secure_channel::adapters::MemoryPipes;
    use sv_02_secure_channel::ChannelEstablisher;
    use sv_03_process_supervisor::{
        FailureAttribution, MonitorOutcome, ProcessConfig, ProcessMonitor, ProcessState,
        ProcessSupervisor, RestartPolicy, SupervisorConfig,
    };
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(5);

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    fn supervisor(
        sim: &SimulatedPlatform,
        restart: RestartPolicy,
    ) -> (ProcessSupervisor, Arc<InMemoryEventBus>) {
        let pipes = MemoryPipes::new();
        let bus = Arc::new(InMemoryEventBus::new());
        let platform: SharedPlatform = Arc::new(sim.clone());
        let channels = ChannelEstablisher::new(platform.clone(), Arc::new(pipes), bus.clone());
        let supervisor = ProcessSupervisor::new(
            platform,
            channels,
            bus.clone(),
            SupervisorConfig {
                restart,
                attribution: FailureAttribution::BlameMostRecent,
            },
        );
        (supervisor, bus)
    }

    // =========================================================================
    // PID REUSE
    // =========================================================================

    #[tokio::test]
    async fn test_reused_pid_is_never_terminated() {
        let sim = SimulatedPlatform::new();
        let (supervisor, _bus) = supervisor(&sim, RestartPolicy::default());
        let pid = supervisor
            .start_child_process(ProcessConfig::new("tool").with_command("tool.exe"))
            .await
            .unwrap()
            .unwrap();

        // The child exits and an unrelated process gets its PID.
        sim.reuse_pid(pid);
        assert!(sim.process_exists(pid));
        assert!(!supervisor.is_running("tool"));

        supervisor.stop_child_process("tool", false);
        assert!(sim.terminated().is_empty());
        assert!(sim.process_exists(pid));
    }

    #[tokio::test]
    async fn test_reused_pid_counts_as_exit_for_auto_restart() {
        let sim = SimulatedPlatform::new();
        let policy = RestartPolicy {
            delay_step: Duration::from_millis(10),
            ..RestartPolicy::default()
        };
        let (supervisor, bus) = supervisor(&sim, policy);
        let mut events = bus.subscribe(EventFilter::topics(vec![EventTopic::Process]));
        let first = supervisor
            .start_child_process(
                ProcessConfig::new("tool")
                    .with_command("tool.exe")
                    .with_auto_restart(true),
            )
            .await
            .unwrap()
            .unwrap();

        sim.reuse_pid(first);

        let restarted = timeout(LIMIT, async {
            loop {
                if let Some(ServiceEvent::ProcessStarted { pid, .. }) = events.recv().await {
                    if pid != first {
                        return pid;
                    }
                }
            }
        })
        .await
        .expect("timeout");
        assert_eq!(supervisor.record("tool").unwrap().pid, Some(restarted));
        assert!(supervisor.is_running("tool"));
    }

    // =========================================================================
    // DEATH-WATCH
    // =========================================================================

    #[tokio::test]
    async fn test_one_watch_follows_a_changing_set() {
        let sim = SimulatedPlatform::new();
        let monitor = ProcessMonitor::new(Arc::new(sim.clone()), FailureAttribution::default());
        let pids: Vec<_> = (0..4).map(|_| sim.spawn_process()).collect();
        let mut watches: Vec<_> = pids.iter().map(|pid| monitor.monitor(*pid)).collect();
        assert_eq!(monitor.len(), 4);

        // Removing one entry resolves it without touching the others.
        assert!(monitor.unmonitor(pids[1]));
        let removed = watches.remove(1);
        assert_eq!(
            timeout(LIMIT, removed).await.expect("timeout").unwrap(),
            MonitorOutcome::Removed
        );

        // An entry added while the wait is running is watched too.
        let late = sim.spawn_process();
        let late_watch = monitor.monitor(late);
        sim.exit_process(late);
        assert_eq!(
            timeout(LIMIT, late_watch).await.expect("timeout").unwrap(),
            MonitorOutcome::Exited(late)
        );

        for (pid, watch) in [pids[0], pids[2], pids[3]].into_iter().zip(watches).rev() {
            sim.exit_process(pid);
            assert_eq!(
                timeout(LIMIT, watch).await.expect("timeout").unwrap(),
                MonitorOutcome::Exited(pid)
            );
        }

        assert!(monitor.is_empty());
        timeout(LIMIT, async {
            while sim.open_handle_count(SERVICE_PID) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("handles leaked");
    }

    // =========================================================================
    // RESTART THROTTLE
    // =========================================================================

    #[tokio::test]
    async fn test_restart_delay_grows_with_each_early_failure() {
        let sim = SimulatedPlatform::new();
        let step = Duration::from_millis(30);
        let policy = RestartPolicy {
            reset_after: Duration::from_secs(10),
            delay_step: step,
            max_failures: 5,
        };
        let (supervisor, bus) = supervisor(&sim, policy);
        let mut events = bus.subscribe(EventFilter::topics(vec![EventTopic::Process]));
        supervisor
            .start_child_process(
                ProcessConfig::new("crashy")
                    .with_command("crashy.exe")
                    .with_auto_restart(true),
            )
            .await
            .unwrap();

        let mut started_at = Vec::new();
        let failures = timeout(LIMIT, async {
            loop {
                match events.recv().await.expect("bus closed") {
                    ServiceEvent::ProcessStarted { pid, .. } => {
                        started_at.push(Instant::now());
                        sim.exit_process(pid);
                    }
                    ServiceEvent::ProcessAbandoned { failures, .. } => return failures,
                    _ => {}
                }
            }
        })
        .await
        .expect("timeout");

        assert_eq!(failures, 6);
        assert_eq!(started_at.len(), 6);
        for (n, pair) in started_at.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            assert!(gap >= step * (n as u32 + 1), "restart {n} came after {gap:?}");
        }
        assert_eq!(supervisor.state("crashy"), Some(ProcessState::Abandoned));
    }
}
