//! Feed retrieval, parsing, normalization and ingestion.
//!
//! - [`parser`] - RSS 2.0 XML into a [`RawFeedDocument`] using quick-xml
//! - [`fetcher`] - bounded HTTP retrieval of a feed URL
//! - [`normalize`] - HTML entity decoding and publish date resolution
//! - [`ingest`] - fetch, normalize and persist one feed's items

mod fetcher;
mod ingest;
mod normalize;
mod parser;

pub use fetcher::{FeedFetcher, FetchError};
pub use ingest::{IngestSummary, Ingestor, RefreshError};
pub use normalize::{normalize, resolve_published, NormalizedFeedDocument, NormalizedItem};
pub use parser::{parse_feed, ParseError, RawFeedDocument, RawItem};
