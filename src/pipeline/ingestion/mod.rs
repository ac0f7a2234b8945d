// Pipeline ingestion: source acquisition and the local payload cache

pub mod cache;
pub mod fetcher;

pub use fetcher::{FetchRecord, PayloadBody, PayloadOrigin, RawPayload, SourceFetcher};
