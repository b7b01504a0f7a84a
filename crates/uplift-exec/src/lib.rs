//! uplift-exec: Command execution abstraction
//!
//! Provides the executor trait used by actors that shell out to system
//! tools, and a local implementation backed by `tokio::process`.

pub mod error;
pub mod local;
pub mod result;
pub mod traits;

pub use error::ExecError;
pub use local::LocalExecutor;
pub use result::{CommandRequest, CommandResult};
pub use traits::CommandExecutor;
