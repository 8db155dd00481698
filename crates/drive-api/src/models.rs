//! Wire types for the drive API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileInfo {
    /// Name within the listed directory.
    pub name: String,
    /// Size in bytes. Zero for directories.
    #[serde(default)]
    pub size: u64,
    /// Whether the entry is a folder.
    #[serde(default)]
    pub is_dir: bool,
    /// Last modification time, when the drive reports one.
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
    /// Absolute path of the entry.
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListResponse {
    #[serde(default)]
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Serialize)]
pub(crate) struct TokenRequest<'a> {
    pub client_id: &'a str,
    pub client_secret: &'a str,
    pub grant_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct FolderRequest<'a> {
    pub path: &'a str,
}
