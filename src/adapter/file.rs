//! Upload inputs and the stored-file result.

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::pin::Pin;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncRead;

use crate::adapter::settings::FileSettings;
use crate::object_id::FileId;
use crate::storage::backend::GridFile;

/// Byte stream of one uploaded file.
pub type FileStream = Pin<Box<dyn AsyncRead + Send>>;

/// The parts of the HTTP request a naming function may inspect.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: http::Method,
    pub uri: http::Uri,
    pub headers: http::HeaderMap,
    /// Non-file multipart fields parsed so far.
    pub fields: HashMap<String, String>,
}

impl From<&http::request::Parts> for RequestContext {
    fn from(parts: &http::request::Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            fields: HashMap::new(),
        }
    }
}

/// Descriptive fields of an uploaded file part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub fieldname: String,
    pub originalname: String,
    pub encoding: String,
    pub mimetype: String,
}

impl FileInfo {
    pub fn new(fieldname: &str, originalname: &str, mimetype: &str) -> Self {
        Self {
            fieldname: fieldname.to_string(),
            originalname: originalname.to_string(),
            encoding: "7bit".to_string(),
            mimetype: mimetype.to_string(),
        }
    }
}

/// A file handed to the adapter by the upload pipeline.
pub struct IncomingFile {
    pub info: FileInfo,
    pub stream: FileStream,
}

impl IncomingFile {
    pub fn new(info: FileInfo, stream: FileStream) -> Self {
        Self { info, stream }
    }

    /// A file whose content is already in memory.
    pub fn from_bytes(info: FileInfo, data: impl Into<Bytes>) -> Self {
        Self::new(info, Box::pin(Cursor::new(data.into())))
    }
}

impl fmt::Debug for IncomingFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingFile")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Result reported for a stored file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: FileId,
    pub filename: String,
    pub metadata: Option<serde_json::Value>,
    pub bucket_name: String,
    pub chunk_size: u32,
    pub size: u64,
    pub md5: Option<String>,
    pub upload_date: DateTime<Utc>,
    pub content_type: Option<String>,
}

impl StoredFile {
    /// Build the result from the backend's record of a file written with
    /// `settings`.
    pub fn from_record(record: GridFile, settings: &FileSettings) -> Self {
        Self {
            id: record.id,
            filename: record.filename,
            metadata: record.metadata,
            bucket_name: settings.bucket_name.clone(),
            chunk_size: record.chunk_size,
            size: record.length,
            md5: record.md5,
            upload_date: record.upload_date,
            content_type: record.content_type,
        }
    }
}
