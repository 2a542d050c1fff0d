pub mod coordinator;
pub mod dispatcher;
#[cfg(feature = "desktop")]
pub mod input;
pub mod text_input;

pub use coordinator::calibrate;
pub use dispatcher::{ActionExecutor, CalibratedAction, ExecutionReport};
