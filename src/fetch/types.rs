//! Request and response types exchanged with the network

use std::collections::BTreeMap;

use bytes::Bytes;
use url::Url;

use super::errors::FetchError;
use crate::cache::response_store::StoredAsset;

/// An outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    /// HTTP method, upper-case
    pub method: String,
    /// Absolute URL
    pub url: String,
}

impl AssetRequest {
    /// A GET request for `url`
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
        }
    }

    /// Parse the request URL
    pub fn parsed_url(&self) -> Result<Url, FetchError> {
        Url::parse(&self.url).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", self.url, e)))
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

/// A response as returned to the requester
#[derive(Debug, Clone, PartialEq)]
pub struct AssetResponse {
    pub status: u16,
    /// Headers with lower-cased names
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl AssetResponse {
    /// Whether the response is cacheable (status 200)
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }

    /// Copy of this response to be stored under `key`.
    ///
    /// The body is reference-counted, so the copy shares the bytes and
    /// the original stays intact for the requester.
    pub fn to_stored(&self, key: &str) -> StoredAsset {
        StoredAsset {
            key: key.to_string(),
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

impl From<StoredAsset> for AssetResponse {
    fn from(entry: StoredAsset) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers,
            body: entry.body,
        }
    }
}
