//! Domain layer: pipe names, the challenge exchange and channel records.

pub mod challenge;
pub mod connection;
pub mod launch;
pub mod pipe_name;

pub use challenge::{challenge_line, parse_challenge, Challenge, NO_CHALLENGE, OK_LINE};
pub use connection::{ChannelInfo, IpcConnection, StartOptions};
pub use launch::{merge_environment, ExecuteOptions};
pub use pipe_name::{
    channel_pipe_name, generate_pipe_name, pipe_env_value, pipe_name_from_env_value, PIPE_ENV_VAR,
    PIPE_PREFIX,
};
