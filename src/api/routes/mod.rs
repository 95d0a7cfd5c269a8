//! API route modules.

pub mod tasks;
pub mod twilio;
