//! Link managers, backends and logging.

pub mod bluetooth;
pub mod cloud;
pub mod logging;
pub(crate) mod task;
