pub mod schema;
pub mod store;

pub use store::{CollectionManifest, ScoredChunk, VectorStore};
