pub mod ask_store;
pub mod session_store;
pub mod task_store;

pub use ask_store::{AskStore, AskType, ExternalAsk};
pub use session_store::{Session, SessionStatus, SessionStore, WorkspaceType};
pub use task_store::{ScheduleHistoryEntry, Task, TaskRun, TaskRunStatus, TaskStore};
