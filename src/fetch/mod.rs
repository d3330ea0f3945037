//! Network fetch collaborator for the asset cache

pub mod client;
pub mod errors;
pub mod types;

pub use client::{Fetcher, HttpFetcher};
pub use errors::FetchError;
pub use types::*;
