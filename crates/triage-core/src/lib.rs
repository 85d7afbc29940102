pub mod cache;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod filter;
pub mod model;
pub mod provider;
pub mod review;
pub mod scheduler;
pub mod similarity;
mod sync;
pub mod tag;
pub mod triage;
pub mod types;

pub use error::{Result, TriageError};
