//! IPC protocol definitions
//!
//! Newline-delimited JSON exchanged between gallery clients and the daemon
//! over a Unix domain socket. Every command is an object tagged by `type`;
//! every reply carries `success` plus command-specific fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::asset::AssetSource;
use crate::cache::metadata::{CacheEnvelope, CacheStats};

/// Protocol version for future compatibility
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands sent by clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Delete the asset cache
    ClearCache,
    /// Count stored assets
    GetCacheSize,
    /// Fetch an asset through the cache
    FetchAsset { url: String },
    /// Read the gallery metadata envelope
    ReadMetadata,
    /// Replace the gallery metadata envelope
    #[serde(rename_all = "camelCase")]
    WriteMetadata {
        images: Vec<Value>,
        total_size: u64,
        count: u64,
    },
    /// Drop the envelope and bump the cache version
    InvalidateMetadata,
    /// Metadata cache statistics
    MetadataStats,
    /// Issue an activation code and mail it
    IssueActivationCode { email: String, name: String },
    /// Verify an activation code
    VerifyActivationCode { email: String, code: String },
    /// Daemon status
    GetStatus,
}

/// Error details for failed commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code, e.g. `not-found`
    pub code: String,
    pub message: String,
}

/// A fetched asset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetPayload {
    pub status: u16,
    pub content_type: Option<String>,
    pub source: AssetSource,
    /// Base64-encoded body
    pub body: String,
}

/// Reply to a command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<CacheEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<CacheStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    /// Bare success
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Success with a message
    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    /// Failure with an error code
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
            ..Self::default()
        }
    }
}

/// Parse a JSON command from bytes
pub fn parse_command(data: &[u8]) -> Result<Command, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Serialize a response to JSON bytes
pub fn serialize_response(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_vec(response)?;
    json.push(b'\n'); // Add newline delimiter
    Ok(json)
}
