//! Per-user sessions and a capacity-gated admission queue for exclusive
//! document-automation processes.
//!
//! Callers submit typed work through [`Scheduler::submit`]. Each request is
//! classified into a [`ResourceClass`] with its own concurrency ceiling, bound
//! to the caller's [`session::Session`] (an isolated working directory plus at
//! most one automation process per [`Application`]), and executed by an
//! [`Operation`] body registered by the application layer. Idle sessions are
//! reclaimed in the background.

pub mod builtin;
pub mod config;
pub mod error;
pub mod http_server;
pub mod operation;
pub mod process;
pub mod reaper;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod workspace;

pub use config::{CapacityConfig, Config, LauncherConfig};
pub use error::{QueueError, Result};
pub use operation::{Operation, OperationRegistry, SessionContext};
pub use process::{Application, CommandLauncher, ProcessHandle, ProcessLauncher, ProcessRegistry};
pub use scheduler::{ClassStatus, QueueStatus, RequestStatus, ResourceClass, Scheduler, SubmitRequest, Submission};
pub use session::{ReapReport, SessionInfo, SessionRegistry};
pub use state::AppState;
pub use workspace::{SessionDirs, WorkspaceManager};
