//! Execution agent — spawns the agent CLI, streams its line-delimited
//! JSON protocol, translates it into callbacks, and enforces cooperative
//! cancellation.

pub mod client;
pub mod poller;
pub mod process;
pub mod protocol;

pub use client::ApiClient;
pub use poller::{CancelRegistry, RunnerPoller};
pub use process::{CliOutcome, ProgressSink, RunStatus, build_codex_command, run_agent_cli};
