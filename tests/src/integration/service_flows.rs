//! # Service Flows
//!
//! The whole service built from a JSON configuration: children start when
//! a user is logged on, come back after a crash, and are asked to shut
//! down before they are stopped.

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::{json, Map, Value};
    use service_runtime::{ServiceConfig, ServiceRuntime};
    use shared_bus::{EventFilter, EventTopic, ServiceControl, ServiceEvent, Subscription};
    use shared_types::testing::SimulatedPlatform;
    use shared_types::SessionChange;
    use std::sync::Arc;
    use std::time::Duration;
    use sv_01_pipe_messaging::handler_fn;
    use sv_02_secure_channel::adapters::MemoryPipes;
    use sv_02_secure_channel::testing::{simulate_children, ChildBehavior, ChildConnection};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(5);

    const CONFIG: &str = r#"{
        "processes": {
            "gpii": {
                "command": "gpii-app.exe",
                "ipc": "gpii",
                "autoRestart": true
            }
        },
        "supervisor": {
            "restart": { "reset_after": 1, "delay_step": 0.01 }
        },
        "shutdown": { "drainTimeoutSecs": 1 }
    }"#;

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    struct Service {
        sim: SimulatedPlatform,
        runtime: ServiceRuntime,
        children: mpsc::UnboundedReceiver<ChildConnection>,
        /// Request types received by any child.
        requests: Arc<Mutex<Vec<String>>>,
    }

    fn service(sim: SimulatedPlatform) -> Service {
        let config = ServiceConfig::from_json(CONFIG).unwrap();
        config.validate().unwrap();

        let pipes = MemoryPipes::new();
        {
            let pipes = pipes.clone();
            sim.set_pipe_connector(move |name| pipes.connect(name).is_ok());
        }
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let handler = handler_fn(move |request: Map<String, Value>| {
            let seen = seen.clone();
            async move {
                let request_type = request
                    .get("requestType")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                seen.lock().push(request_type.clone());
                match request_type.as_str() {
                    "status" => Ok(json!({ "isRunning": true })),
                    _ => Ok(Value::Null),
                }
            }
        });
        let children = simulate_children(
            &sim,
            &pipes,
            ChildBehavior::default()
                .with_session_type("gpii")
                .with_handler(handler),
        );
        let runtime = ServiceRuntime::new(config, Arc::new(sim.clone()), Arc::new(pipes));
        Service {
            sim,
            runtime,
            children,
            requests,
        }
    }

    async fn next_matching(
        subscription: &mut Subscription,
        predicate: impl Fn(&ServiceEvent) -> bool,
    ) -> ServiceEvent {
        timeout(LIMIT, async {
            loop {
                let event = subscription.recv().await.expect("bus closed");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timeout")
    }

    fn connected(event: &ServiceEvent) -> bool {
        matches!(event, ServiceEvent::ChannelConnected { channel } if channel == "gpii")
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    #[tokio::test]
    async fn test_crashed_child_returns_and_is_shut_down_with_the_service() {
        let mut s = service(SimulatedPlatform::new());
        let mut events = s.runtime.bus().subscribe(EventFilter::all());
        s.runtime.start().await.unwrap();

        next_matching(&mut events, connected).await;
        let first = timeout(LIMIT, s.children.recv()).await.expect("timeout").unwrap();

        // Crash: the process ends and its end of the pipe goes with it.
        s.sim.exit_process(first.pid);
        first.session.close();

        let restarted = timeout(LIMIT, s.children.recv()).await.expect("timeout").unwrap();
        assert_ne!(restarted.pid, first.pid);
        next_matching(&mut events, connected).await;
        assert_eq!(s.runtime.supervisor().record("gpii").unwrap().pid, Some(restarted.pid));

        timeout(LIMIT, s.runtime.control(ServiceControl::Stop))
            .await
            .expect("timeout");

        next_matching(&mut events, |e| *e == ServiceEvent::Stopped).await;
        assert_eq!(
            s.requests.lock().iter().filter(|r| *r == "shutdown").count(),
            1
        );
        assert!(s.sim.terminated().contains(&restarted.pid));

        let launched = s.sim.launches().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(s.sim.launches().len(), launched);
    }

    #[tokio::test]
    async fn test_children_follow_logon_and_logoff() {
        let sim = SimulatedPlatform::new();
        sim.set_desktop_user(None);
        let mut s = service(sim);
        let mut events = s
            .runtime
            .bus()
            .subscribe(EventFilter::topics(vec![EventTopic::Process]));
        s.runtime.start().await.unwrap();

        for _ in 0..2 {
            s.sim.set_desktop_user(Some("user"));
            s.runtime.session_change(SessionChange::SessionLogon);
            let child = timeout(LIMIT, s.children.recv()).await.expect("timeout").unwrap();
            assert_eq!(s.sim.launches().last().unwrap().user.as_deref(), Some("user"));

            s.sim.set_desktop_user(None);
            s.runtime.session_change(SessionChange::SessionLogoff);
            next_matching(&mut events, |e| {
                matches!(e, ServiceEvent::ProcessStopped { pid, .. } if *pid == child.pid)
            })
            .await;
            assert!(s.sim.terminated().contains(&child.pid));
        }

        assert_eq!(s.sim.launches().len(), 2);
        s.runtime.shutdown().await;
    }
}
