pub mod action;
pub mod parser;

pub use action::{Action, ActionKind, ParamValue};
pub use parser::{parse_response, ParsedResponse};
