use axum::http::StatusCode;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Uniform response wrapper shared by every JSON reply, success or failure
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: u16,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn success(message: impl Into<String>, data: Option<T>) -> Self {
        Self {
            status: StatusCode::OK.as_u16(),
            message: message.into(),
            timestamp: Utc::now().timestamp(),
            code: None,
            data,
        }
    }

    pub fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            message: message.into(),
            timestamp: Utc::now().timestamp(),
            code: Some(code.to_string()),
            data: None,
        }
    }
}

/// One row of a directory listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// Forward-slash path relative to the work directory, not percent-encoded
    pub href: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

impl FileEntry {
    pub fn parent_link(href: String) -> Self {
        Self {
            name: "..".to_string(),
            href,
            is_dir: true,
            size: None,
        }
    }
}

/// Everything a page renderer needs for one directory
#[derive(Debug, Serialize)]
pub struct PageData {
    pub path: String,
    pub items: Vec<FileEntry>,
}

/// `?path=` query used by download and delete
#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

/// Reported back for every file stored by an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}
