//! Error types for channel establishment

use shared_types::PlatformError;
use sv_01_pipe_messaging::RequestError;
use thiserror::Error;

/// Why a client failed to prove it is the expected process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A Win32 call made during the exchange failed.
    #[error("Authentication call failed: {0}")]
    Platform(#[from] PlatformError),

    /// Reading or writing the pipe failed.
    #[error("Pipe error during authentication: {0}")]
    Io(String),

    /// The event was not signaled in time.
    #[error("Authentication timed out")]
    Timeout,

    /// The client closed the pipe before proving itself.
    #[error("Client closed the pipe during authentication")]
    PeerClosed,

    /// A client connected before a process was started for the channel.
    #[error("Pipe connection before the client was started")]
    ClientNotStarted,

    /// The server sent something other than a challenge (client side).
    #[error("Unexpected challenge line {0:?}")]
    MalformedChallenge(String),

    /// The waiting thread went away.
    #[error("Authentication wait aborted")]
    WaitAborted,
}

impl From<std::io::Error> for AuthError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Why a process could not be started in the user's session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// Nobody is logged on and the launch does not ask to run anyway.
    #[error("No desktop user is logged on")]
    NoDesktopUser,

    /// Token, environment or process creation failed.
    #[error("Process launch failed: {0}")]
    Platform(#[from] PlatformError),
}

/// Errors raised while establishing or using a channel.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// Neither a command nor a channel name was given.
    #[error("start_process needs a command or a channel name")]
    InvalidArguments,

    /// Another server already owns the pipe name.
    #[error("Pipe {name} is already in use")]
    PipeInUse { name: String },

    /// The pipe could not be created.
    #[error("Unable to create pipe {name}: {reason}")]
    Bind { name: String, reason: String },

    /// The client did not authenticate.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The child process could not be started.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// A platform call outside authentication failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// No messaging session is open on the channel.
    #[error("Channel {channel} is not connected")]
    NotConnected { channel: String },

    /// A request on the channel failed.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Accepting a connection failed.
    #[error("Pipe error: {0}")]
    Io(String),

    /// The channel was closed before a client connected.
    #[error("Channel closed before a client connected")]
    Aborted,
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
