//! Shared helpers for the osdeploy crates: running host commands, logging
//! setup and error reporting. Keep this free of deployment logic.

mod command;
pub use command::*;
mod result_ext;
pub use result_ext::*;
mod tracing_util;
pub use tracing_util::*;
