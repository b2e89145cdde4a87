//! Per-file naming and metadata settings.
//!
//! Callers name files through a [`FileNaming`] in one of three shapes: a
//! plain function, a future-returning function, or a generator factory
//! whose [`SettingsGenerator`] yields one value per file for the adapter's
//! lifetime.  Whatever the shape, each file ends up with one
//! `serde_json::Value` that [`parse_settings`] validates and
//! [`FileSettings::merge`] combines with the defaults.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::file::{FileInfo, RequestContext};
use crate::errors::StorageError;
use crate::object_id::FileId;

/// Default GridFS chunk size (255 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 261_120;

/// Default bucket name.
pub const DEFAULT_BUCKET_NAME: &str = "fs";

/// Future resolving to one file's settings value.
pub type SettingsFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

type SyncNamer = dyn Fn(&RequestContext, &FileInfo) -> anyhow::Result<Value> + Send + Sync;
type AsyncNamer = dyn Fn(&RequestContext, &FileInfo) -> SettingsFuture + Send + Sync;
type GeneratorFactory =
    dyn Fn(&RequestContext, &FileInfo) -> Box<dyn SettingsGenerator> + Send + Sync;

/// Generate a random 32-character hex filename.
pub fn random_filename() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// `{"filename": <32 hex chars>}`, usable as a naming function result.
pub fn generate_bytes() -> Value {
    serde_json::json!({ "filename": random_filename() })
}

/// One step of a [`SettingsGenerator`].
pub enum GeneratorStep {
    Yielded(SettingsFuture),
    Complete,
}

impl GeneratorStep {
    /// A step yielding an already-known value.
    pub fn ready(value: Value) -> Self {
        GeneratorStep::Yielded(Box::pin(std::future::ready(Ok(value))))
    }
}

/// Resumable producer of per-file settings.
///
/// Created from the first file's request and info, then resumed once per
/// file (the first file included) with that file's request and info.
pub trait SettingsGenerator: Send {
    fn resume(&mut self, request: &RequestContext, file: &FileInfo) -> GeneratorStep;
}

/// Generator over a plain iterator of values; request and file are ignored.
pub struct Sequence<I> {
    values: std::iter::Fuse<I>,
}

impl<I: Iterator<Item = Value>> Sequence<I> {
    pub fn new(values: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            values: values.into_iter().fuse(),
        }
    }
}

impl<I> SettingsGenerator for Sequence<I>
where
    I: Iterator<Item = Value> + Send,
{
    fn resume(&mut self, _request: &RequestContext, _file: &FileInfo) -> GeneratorStep {
        match self.values.next() {
            Some(value) => GeneratorStep::ready(value),
            None => GeneratorStep::Complete,
        }
    }
}

/// Generator driven by a closure and a file counter.  Returning `None`
/// completes the generator.
pub struct Counted<F> {
    count: u64,
    step: F,
}

impl<F> Counted<F>
where
    F: FnMut(u64, &RequestContext, &FileInfo) -> Option<Value> + Send,
{
    pub fn new(step: F) -> Self {
        Self { count: 0, step }
    }
}

impl<F> SettingsGenerator for Counted<F>
where
    F: FnMut(u64, &RequestContext, &FileInfo) -> Option<Value> + Send,
{
    fn resume(&mut self, request: &RequestContext, file: &FileInfo) -> GeneratorStep {
        let step = (self.step)(self.count, request, file);
        self.count += 1;
        match step {
            Some(value) => GeneratorStep::ready(value),
            None => GeneratorStep::Complete,
        }
    }
}

/// How the adapter names files.
#[derive(Clone)]
pub enum FileNaming {
    Sync(Arc<SyncNamer>),
    Async(Arc<AsyncNamer>),
    Generator(Arc<GeneratorFactory>),
}

impl FileNaming {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&RequestContext, &FileInfo) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        FileNaming::Sync(Arc::new(f))
    }

    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(&RequestContext, &FileInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        FileNaming::Async(Arc::new(move |request: &RequestContext, file: &FileInfo| {
            Box::pin(f(request, file)) as SettingsFuture
        }))
    }

    pub fn generator<F, G>(factory: F) -> Self
    where
        F: Fn(&RequestContext, &FileInfo) -> G + Send + Sync + 'static,
        G: SettingsGenerator + 'static,
    {
        FileNaming::Generator(Arc::new(move |request: &RequestContext, file: &FileInfo| {
            Box::new(factory(request, file)) as Box<dyn SettingsGenerator>
        }))
    }
}

impl fmt::Debug for FileNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileNaming::Sync(_) => f.write_str("FileNaming::Sync"),
            FileNaming::Async(_) => f.write_str("FileNaming::Async"),
            FileNaming::Generator(_) => f.write_str("FileNaming::Generator"),
        }
    }
}

/// Settings a naming function may supply; absent fields take defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub filename: Option<String>,
    pub id: Option<FileId>,
    pub metadata: Option<Value>,
    pub chunk_size: Option<u32>,
    pub bucket_name: Option<String>,
    pub content_type: Option<String>,
    pub aliases: Option<Vec<String>>,
}

/// Final settings for one stored file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSettings {
    pub filename: String,
    pub id: FileId,
    pub metadata: Option<Value>,
    pub chunk_size: u32,
    pub bucket_name: String,
    pub content_type: Option<String>,
    pub aliases: Option<Vec<String>>,
}

impl FileSettings {
    /// Merge generated values, defaults, the upload's mimetype and the
    /// caller's settings, later sources winning.
    pub fn merge(user: UserSettings, file: &FileInfo) -> Self {
        Self {
            filename: user.filename.unwrap_or_else(random_filename),
            id: user.id.unwrap_or_else(FileId::generate),
            metadata: user.metadata.filter(|m| !m.is_null()),
            chunk_size: user.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            bucket_name: user
                .bucket_name
                .unwrap_or_else(|| DEFAULT_BUCKET_NAME.to_string()),
            content_type: user.content_type.or_else(|| Some(file.mimetype.clone())),
            aliases: user.aliases,
        }
    }
}

/// Validate a naming value.
///
/// Null and the empty string mean "no settings"; other strings and numbers
/// become the filename; objects are read as [`UserSettings`].
pub fn parse_settings(value: Value) -> Result<UserSettings, StorageError> {
    match value {
        Value::Null => Ok(UserSettings::default()),
        Value::String(s) if s.is_empty() => Ok(UserSettings::default()),
        Value::String(s) => Ok(UserSettings {
            filename: Some(s),
            ..UserSettings::default()
        }),
        Value::Number(n) => Ok(UserSettings {
            filename: Some(number_to_filename(&n)),
            ..UserSettings::default()
        }),
        Value::Object(_) => serde_json::from_value(value)
            .map_err(|e| StorageError::Settings(Arc::new(anyhow::Error::new(e)))),
        Value::Bool(_) => Err(StorageError::InvalidSettings("boolean")),
        Value::Array(_) => Err(StorageError::InvalidSettings("array")),
    }
}

/// Integral floats render without a fractional part.
fn number_to_filename(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}
