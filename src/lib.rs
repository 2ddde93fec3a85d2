pub mod config;
pub mod deliver;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod summarizer;
