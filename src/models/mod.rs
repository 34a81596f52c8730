pub mod api;
pub mod job;
