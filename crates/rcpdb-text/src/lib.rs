pub mod index;
pub mod store;

pub use index::{Bm25Index, Bm25Params};
