pub mod backend;
pub mod capture;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod scheduler;

pub use backend::{BackendClient, InferenceBackend};
pub use capture::{CaptureController, CaptureState, PrimaryMonitorSource};
pub use config::PipelineConfig;
pub use db::Store;
pub use pipeline::Pipeline;
pub use scheduler::SchedulerController;
