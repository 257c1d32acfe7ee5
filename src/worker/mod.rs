//! Capture execution: everything that happens after a job leaves the queue.
//!
//! # Components
//!
//! - [`CaptureBackend`]: capability interface for one kind of capture, with
//!   Docker implementations for browser saves and screenshots
//! - [`ActionRunner`]: runs a job's requested captures in order, tolerating
//!   individual failures
//! - [`packager`]: zips a job's working directory into its artifact
//! - [`RetentionSweep`]: evicts expired jobs and their artifacts
//! - [`Dispatcher`]: the single consumer that moves jobs from waiting to done
//!
//! # Execution Flow
//!
//! 1. A submission raises the store's work-available signal
//! 2. [`Dispatcher`] marks the earliest waiting job running
//! 3. [`ActionRunner`] invokes each backend against a fresh working directory
//! 4. If any capture succeeded, [`packager::package`] writes `<id>.zip`
//! 5. The job is marked done and the signal is raised again

pub mod backend;
pub mod dispatcher;
pub mod packager;
pub mod retention;
pub mod runner;

pub use backend::{Backends, CaptureBackend, CaptureOutcome};
pub use dispatcher::Dispatcher;
pub use retention::RetentionSweep;
pub use runner::{ActionRunner, RunReport};
