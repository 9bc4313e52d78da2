mod cache;
mod fetch;
mod store;

pub use cache::{ByteSource, RangeCache};
pub use fetch::{HttpFetcher, RangeFetcher};
pub use store::{DiskStore, MemoryStore, RangeKey, RangeStore};
