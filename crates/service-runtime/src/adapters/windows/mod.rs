//! Win32 adapters.

mod pipes;
mod platform;

pub use pipes::NamedPipes;
pub use platform::Win32Platform;
