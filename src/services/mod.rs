pub mod detector;
pub mod dispatcher;
pub mod pipeline;
pub mod reporter;
pub mod retry;
pub mod source;
pub mod submission;
pub mod uploader;
