pub mod models;
pub mod registry;

pub use models::{
    DownloadRequest, FormatType, Outcome, Quality, SubmitRequest, Task, TaskStatus, TaskView,
    ViewStatus,
};
pub use registry::TaskRegistry;
