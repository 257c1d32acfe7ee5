pub mod admission;
pub mod job;
pub mod store;

pub use admission::{AdmissionController, HostResolver, StaticResolver, SystemResolver};
pub use job::{
    BrowserKind, BrowserSave, CaptureVariant, Job, JobId, JobStatus, JobView, RequestedActions,
    ScreenshotFormat,
};
pub use store::{JobStore, QueueCounts};
