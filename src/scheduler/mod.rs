mod controller;
pub(crate) mod worker;

pub use controller::SchedulerController;
pub use worker::ScanWorker;
