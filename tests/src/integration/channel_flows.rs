//! # Channel Flows
//!
//! The service launches a child with a private pipe name in its
//! environment; the child connects, proves it is the launched process by
//! signalling the duplicated event, and both sides then talk over a framed
//! JSON session.

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use shared_bus::{EventFilter, EventTopic, InMemoryEventBus, ServiceEvent};
    use shared_types::testing::{LaunchRecord, SimulatedPlatform, SERVICE_PID};
    use shared_types::SharedPlatform;
    use std::sync::Arc;
    use std::time::Duration;
    use sv_01_pipe_messaging::{handler_fn, Session, SessionOptions};
    use sv_02_secure_channel::adapters::MemoryPipes;
    use sv_02_secure_channel::{
        answer_challenge, pipe_name_from_env_value, AuthError, ChannelError, ChannelEstablisher,
        StartOptions, NO_CHALLENGE, PIPE_ENV_VAR,
    };
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(5);

    // =========================================================================
    // TEST FIXTURES
    // =========================================================================

    struct Fixture {
        sim: SimulatedPlatform,
        pipes: MemoryPipes,
        bus: Arc<InMemoryEventBus>,
        establisher: ChannelEstablisher,
        launches: mpsc::UnboundedReceiver<LaunchRecord>,
    }

    /// Launches are reported but nobody plays the child; each test does.
    fn fixture(auth_timeout: Duration) -> Fixture {
        let sim = SimulatedPlatform::new();
        let pipes = MemoryPipes::new();
        {
            let pipes = pipes.clone();
            sim.set_pipe_connector(move |name| pipes.connect(name).is_ok());
        }
        let (tx, launches) = mpsc::unbounded_channel();
        sim.on_launch(move |record| {
            let _ = tx.send(record);
        });

        let bus = Arc::new(InMemoryEventBus::new());
        let platform: SharedPlatform = Arc::new(sim.clone());
        let establisher = ChannelEstablisher::with_auth_timeout(
            platform,
            Arc::new(pipes.clone()),
            bus.clone(),
            auth_timeout,
        );
        Fixture {
            sim,
            pipes,
            bus,
            establisher,
            launches,
        }
    }

    fn pipe_of(record: &LaunchRecord) -> String {
        record
            .env_var(PIPE_ENV_VAR)
            .and_then(pipe_name_from_env_value)
            .expect("pipe variable")
    }

    // =========================================================================
    // AUTHENTICATED CHANNEL
    // =========================================================================

    #[tokio::test]
    async fn test_launched_child_talks_both_ways() {
        let mut f = fixture(Duration::from_secs(5));
        f.establisher.register_handler(
            "gpii",
            handler_fn(|request: Map<String, Value>| async move {
                Ok(json!({ "handled": request.get("requestType").cloned() }))
            }),
        );

        let started = f
            .establisher
            .start_process(Some("gpii-app.exe"), Some("gpii"), StartOptions::default())
            .await
            .unwrap();
        let record = f.launches.recv().await.unwrap();
        assert_eq!(started.pid, Some(record.pid));
        assert_eq!(pipe_of(&record), started.pipe_name);
        assert_eq!(f.sim.granted_pipes(), vec![started.pipe_name.clone()]);

        // The child's side.
        let stream = f.pipes.connect(&started.pipe_name).unwrap();
        let (stream, rest) = answer_challenge(&f.sim.process_view(record.pid), stream)
            .await
            .unwrap();
        let (child, _child_events) = Session::spawn(
            stream,
            SessionOptions::default()
                .with_session_type("gpii")
                .with_initial_bytes(rest)
                .with_handler(handler_fn(|_request: Map<String, Value>| async move {
                    Ok(json!({ "isRunning": true }))
                })),
        );

        let established = timeout(LIMIT, started.connection)
            .await
            .expect("timeout")
            .expect("connected");
        assert!(established.session().is_some());

        let reply = timeout(LIMIT, child.send_request(json!({ "requestType": "closing" })))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(reply, json!({ "handled": "closing" }));

        let reply = timeout(
            LIMIT,
            f.establisher
                .send_request("gpii", json!({ "requestType": "status" })),
        )
        .await
        .expect("timeout")
        .unwrap();
        assert_eq!(reply, json!({ "isRunning": true }));

        // One client per launch.
        assert!(!f.pipes.is_listening(&started.pipe_name));
        assert_eq!(f.sim.open_handle_count(SERVICE_PID), 0);
    }

    #[tokio::test]
    async fn test_impostor_is_rejected_and_pipe_closed() {
        let mut f = fixture(Duration::from_millis(300));
        let mut events = f.bus.subscribe(EventFilter::topics(vec![EventTopic::Channel]));

        let started = f
            .establisher
            .start_process(Some("gpii-app.exe"), Some("gpii"), StartOptions::default())
            .await
            .unwrap();
        let record = f.launches.recv().await.unwrap();

        // Another process finds the pipe first.
        let impostor = f.sim.spawn_process();
        let stream = f.pipes.connect(&started.pipe_name).unwrap();
        let answered = answer_challenge(&f.sim.process_view(impostor), stream).await;
        assert!(matches!(answered, Err(AuthError::Platform(_))));

        let result = timeout(LIMIT, started.connection).await.expect("timeout");
        assert!(matches!(result, Err(ChannelError::Auth(_))));
        let event = timeout(LIMIT, events.recv()).await.expect("timeout").unwrap();
        assert!(matches!(event, ServiceEvent::ChannelError { channel, .. } if channel == "gpii"));

        // The real child arrives too late.
        assert!(f.pipes.connect(&pipe_of(&record)).is_err());
        assert!(!f.establisher.connection("gpii").unwrap().connected);
    }

    // =========================================================================
    // OPEN CHANNEL
    // =========================================================================

    #[tokio::test]
    async fn test_open_channel_acknowledges_every_client() {
        let f = fixture(Duration::from_secs(5));
        let started = f
            .establisher
            .start_process(None, Some("open"), StartOptions::default().without_auth())
            .await
            .unwrap();
        assert_eq!(started.pid, None);

        for _ in 0..2 {
            let mut client = f.pipes.connect(&started.pipe_name).unwrap();
            let mut greeting = vec![0u8; NO_CHALLENGE.len()];
            timeout(LIMIT, client.read_exact(&mut greeting))
                .await
                .expect("timeout")
                .unwrap();
            assert_eq!(greeting, NO_CHALLENGE.as_bytes());
        }
    }
}
