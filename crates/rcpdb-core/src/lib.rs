pub mod chunker;
pub mod config;
pub mod error;
pub mod section;
pub mod tokenize;
pub mod traits;
pub mod types;
