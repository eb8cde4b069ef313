//! Core services — the orchestration logic between the HTTP surface and
//! the state store.

pub mod dispatch;
pub mod merge;
pub mod retry;
pub mod runners;
pub mod tasks;

pub use dispatch::{
    CallbackStatus, ClaimedTask, DispatchResponse, DispatchService, SubtaskExecutorUpdate,
    SubtaskView,
};
pub use retry::RetryService;
pub use runners::{HeartbeatRequest, RunnerService, RunnerView};
pub use tasks::{CreateTaskRequest, TaskService};
