pub mod embedding;
pub mod metadata;
pub mod record;

pub use embedding::Embedding;
pub use metadata::Metadata;
pub use record::{IdGenerator, MetadataRow, SearchHit, StoredRecord};
