//! Simulated children for tests.
//!
//! [`simulate_children`] installs a launch hook on a
//! [`SimulatedPlatform`]: every launch that carries `GPII_SERVICE_PIPE`
//! gets a task playing the child, connecting over [`MemoryPipes`] and
//! answering the challenge as the launched process.

use crate::adapters::MemoryPipes;
use crate::client::answer_challenge;
use crate::domain::pipe_name::{pipe_name_from_env_value, PIPE_ENV_VAR};
use shared_types::testing::SimulatedPlatform;
use shared_types::Pid;
use sv_01_pipe_messaging::{Session, SessionEvents, SessionHandle, SessionOptions, SharedHandler};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// How simulated children behave once launched.
#[derive(Clone, Default)]
pub struct ChildBehavior {
    session_type: Option<String>,
    handler: Option<SharedHandler>,
    silent: bool,
    raw: bool,
    stay_away: bool,
}

impl ChildBehavior {
    /// Announce this session type.
    #[must_use]
    pub fn with_session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = Some(session_type.into());
        self
    }

    /// Answer requests from the service.
    #[must_use]
    pub fn with_handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Connect but never answer the challenge.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Authenticate but skip the messaging session.
    #[must_use]
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// Never connect to the pipe.
    #[must_use]
    pub fn stay_away(mut self) -> Self {
        self.stay_away = true;
        self
    }
}

/// The child's end of an established channel.
pub struct ChildConnection {
    pub pid: Pid,
    pub session: SessionHandle,
    pub events: SessionEvents,
}

/// Play every launched child according to `behavior`. Children that reach
/// a messaging session are reported on the returned receiver.
pub fn simulate_children(
    sim: &SimulatedPlatform,
    pipes: &MemoryPipes,
    behavior: ChildBehavior,
) -> mpsc::UnboundedReceiver<ChildConnection> {
    let (tx, rx) = mpsc::unbounded_channel();
    let machine = sim.clone();
    let pipes = pipes.clone();

    sim.on_launch(move |record| {
        if behavior.stay_away {
            return;
        }
        let Some(pipe_name) = record
            .env_var(PIPE_ENV_VAR)
            .and_then(pipe_name_from_env_value)
        else {
            return;
        };
        let Ok(mut stream) = pipes.connect(&pipe_name) else {
            return;
        };
        let view = machine.process_view(record.pid);
        let behavior = behavior.clone();
        let tx = tx.clone();
        let pid = record.pid;

        tokio::spawn(async move {
            if behavior.silent {
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
                return;
            }
            let Ok((mut stream, rest)) = answer_challenge(&view, stream).await else {
                return;
            };
            if behavior.raw {
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
                return;
            }
            let mut options = SessionOptions::default().with_initial_bytes(rest);
            if let Some(session_type) = behavior.session_type {
                options = options.with_session_type(session_type);
            }
            if let Some(handler) = behavior.handler {
                options = options.with_handler(handler);
            }
            let (session, events) = Session::spawn(stream, options);
            let _ = tx.send(ChildConnection {
                pid,
                session,
                events,
            });
        });
    });

    rx
}
