pub mod config;
pub mod docx;
pub mod error;
pub mod markdown;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod workspace;
