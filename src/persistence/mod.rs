//! Persistence layer: framed index files and flat dataset files.

pub mod dataset_file;
pub mod index_file;
pub mod serialization;
