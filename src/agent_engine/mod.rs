pub mod action_cache;
pub mod control;
pub mod conversation;
pub mod engine;
pub mod event_bus;
pub mod loop_control;
pub mod manager;
pub mod recorder;
pub mod state;

pub use engine::{Collaborators, RunWorker};
pub use event_bus::{Event, EventKind, EventSubscription};
pub use manager::{RunEntry, RunManager};
pub use state::{CommandOutcome, CommandReceipt, ControlKind, RunState, RunStatus, Turn};
