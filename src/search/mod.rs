//! The search index and the mapping of remote documents onto it.

pub mod mapper;
pub mod tantivy;

pub use mapper::{CommentMode, JsonDocumentMapper, MappingConfig};
pub use self::tantivy::{SearchHit, SpaceIndex};
