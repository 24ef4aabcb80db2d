//! HTTP fetch utilities and the primary event store.

pub mod http;
pub mod primary;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, PolitenessPolicy,
};
pub use primary::{EventQuery, PrimaryStore, StoreError, StoredEvent, UpsertReport};

pub const CRATE_NAME: &str = "evsync-storage";
