//! JSON request/response entry point for schedulers and admin tooling.

pub mod handler;
pub mod server;

pub use handler::{handle_request, parse_request, ExternalEmail, TriggerRequest};
pub use server::{handle_line, run_stdio_server};
