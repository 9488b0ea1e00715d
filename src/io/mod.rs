mod http_source;

pub use http_source::{destination_of, HttpSource, PooledHttpSource, DEFAULT_USER_AGENT};
