//! Channel records kept by the establisher.

use super::launch::ExecuteOptions;
use shared_types::Pid;
use sv_01_pipe_messaging::{SessionHandle, SharedHandler};

/// Options for [`crate::ChannelEstablisher::start_process`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Require the client to prove it is the launched process.
    pub authenticate: bool,
    /// Leave the pipe ACL alone (the client runs as administrator).
    pub admin: bool,
    /// Run a messaging session on the connection.
    pub messaging: bool,
    /// Supervisor key of the process behind the channel.
    pub process_key: Option<String>,
    pub execute: ExecuteOptions,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            authenticate: true,
            admin: false,
            messaging: true,
            process_key: None,
            execute: ExecuteOptions::default(),
        }
    }
}

impl StartOptions {
    #[must_use]
    pub fn without_auth(mut self) -> Self {
        self.authenticate = false;
        self
    }

    #[must_use]
    pub fn admin(mut self) -> Self {
        self.admin = true;
        self
    }

    #[must_use]
    pub fn without_messaging(mut self) -> Self {
        self.messaging = false;
        self
    }

    #[must_use]
    pub fn with_process_key(mut self, key: impl Into<String>) -> Self {
        self.process_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_execute(mut self, execute: ExecuteOptions) -> Self {
        self.execute = execute;
        self
    }
}

/// A named channel.
#[derive(Clone)]
pub struct IpcConnection {
    pub name: String,
    pub pipe_name: Option<String>,
    pub authenticate: bool,
    pub admin: bool,
    pub messaging: bool,
    pub process_key: Option<String>,
    /// PID of the process expected on the other end.
    pub pid: Option<Pid>,
    pub session: Option<SessionHandle>,
    /// Answers requests from the client. Survives reconnects.
    pub handler: Option<SharedHandler>,
}

impl std::fmt::Debug for IpcConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcConnection")
            .field("name", &self.name)
            .field("pipe_name", &self.pipe_name)
            .field("authenticate", &self.authenticate)
            .field("admin", &self.admin)
            .field("messaging", &self.messaging)
            .field("process_key", &self.process_key)
            .field("pid", &self.pid)
            .field("session", &self.session)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

impl IpcConnection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipe_name: None,
            authenticate: true,
            admin: false,
            messaging: true,
            process_key: None,
            pid: None,
            session: None,
            handler: None,
        }
    }

    /// Open session, if the client is connected.
    pub fn live_session(&self) -> Option<&SessionHandle> {
        self.session.as_ref().filter(|session| !session.is_closed())
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            name: self.name.clone(),
            pipe_name: self.pipe_name.clone(),
            authenticate: self.authenticate,
            admin: self.admin,
            process_key: self.process_key.clone(),
            pid: self.pid,
            connected: self.live_session().is_some(),
        }
    }
}

/// Read-only view of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub pipe_name: Option<String>,
    pub authenticate: bool,
    pub admin: bool,
    pub process_key: Option<String>,
    pub pid: Option<Pid>,
    pub connected: bool,
}
