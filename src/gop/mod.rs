//! GOP table: the time index over independently decodable chunks.

mod indexer;
mod table;

pub use indexer::GopIndexer;
pub use table::{GopSpan, GopTable};

#[cfg(test)]
pub(crate) use table::tests::uniform_table;
