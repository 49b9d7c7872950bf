use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use csv_async::{AsyncReaderBuilder, ErrorKind as CsvErrorKind, StringRecord, Trim};
use futures::{future, stream, Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio_util::io::{ReaderStream, StreamReader};

use mintbridge_core::config::BatchConfig;
use mintbridge_core::error::{StreamError, ValidationError};
use mintbridge_core::objects::{DistributionRecord, DISTRIBUTION_DATE_FORMAT};

/// Raw bytes of a fetched object
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Lazy, non-restartable sequence of parsed batch rows. Ends after the first `StreamError`.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<IngestedRecord, StreamError>> + Send>>;

/// Address of a batch file in the object store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl From<&BatchConfig> for ObjectLocation {
    fn from(config: &BatchConfig) -> Self {
        ObjectLocation::new(config.bucket.clone(), config.key.clone())
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.bucket.is_empty() {
            f.write_str(&self.key)
        } else {
            write!(f, "{}/{}", self.bucket, self.key)
        }
    }
}

/// Source of batch files
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Open a byte stream over the object at `location`
    ///
    /// # Returns
    /// `StreamError::Fetch` if the object cannot be opened. Failures after the stream is
    /// returned surface as I/O errors from the stream itself.
    async fn fetch(&self, location: &ObjectLocation) -> Result<ByteStream, StreamError>;
}

/// Serves objects from a directory tree laid out as `root/bucket/key`
pub struct FileObjectFetcher {
    root: PathBuf,
}

impl FileObjectFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ObjectFetcher for FileObjectFetcher {
    async fn fetch(&self, location: &ObjectLocation) -> Result<ByteStream, StreamError> {
        let path = self.root.join(&location.bucket).join(&location.key);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| StreamError::Fetch {
                location: location.to_string(),
                reason: format!("{}: {}", path.display(), err),
            })?;
        log::debug!("streaming {} from {}", location, path.display());
        Ok(Box::pin(ReaderStream::new(file)))
    }
}

struct StoredObject {
    data: Bytes,
    fail_after: Option<usize>,
}

/// Objects held in memory and served in small chunks
pub struct InMemoryObjectFetcher {
    objects: Mutex<HashMap<ObjectLocation, StoredObject>>,
    chunk_size: usize,
}

impl Default for InMemoryObjectFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectFetcher {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            chunk_size: 64,
        }
    }

    pub fn insert(&self, location: ObjectLocation, data: impl Into<Bytes>) {
        self.put(location, data.into(), None);
    }

    /// Store an object whose stream fails with a connection reset after `fail_after` bytes
    pub fn insert_truncated(&self, location: ObjectLocation, data: impl Into<Bytes>, fail_after: usize) {
        self.put(location, data.into(), Some(fail_after));
    }

    fn put(&self, location: ObjectLocation, data: Bytes, fail_after: Option<usize>) {
        self.objects
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(location, StoredObject { data, fail_after });
    }
}

#[async_trait]
impl ObjectFetcher for InMemoryObjectFetcher {
    async fn fetch(&self, location: &ObjectLocation) -> Result<ByteStream, StreamError> {
        let (data, fail_after) = {
            let objects = self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let object = objects.get(location).ok_or_else(|| StreamError::Fetch {
                location: location.to_string(),
                reason: "no such object".to_string(),
            })?;
            (object.data.clone(), object.fail_after)
        };

        let served = match fail_after {
            Some(limit) => data.slice(..limit.min(data.len())),
            None => data,
        };
        let mut chunks: Vec<io::Result<Bytes>> = served
            .chunks(self.chunk_size.max(1))
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if fail_after.is_some() {
            chunks.push(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// One row of the batch, parsed or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedRecord {
    /// Line on which the row starts in the batch file; the header is line 1
    pub line: u64,
    /// Serial read from the row, when it has one
    pub serial: Option<String>,
    pub record: Result<DistributionRecord, ValidationError>,
}

// Column positions, taken from the header row
struct Columns(HashMap<String, usize>);

impl Columns {
    fn from_header(header: &StringRecord) -> Self {
        Columns(
            header
                .iter()
                .enumerate()
                .map(|(idx, name)| (name.trim().to_ascii_lowercase(), idx))
                .collect(),
        )
    }

    fn get<'r>(&self, row: &'r StringRecord, name: &str) -> &'r str {
        self.0
            .get(name)
            .and_then(|idx| row.get(*idx))
            .unwrap_or("")
    }

    fn required<'r>(&self, row: &'r StringRecord, name: &str) -> Result<&'r str, ValidationError> {
        let value = self.get(row, name);
        if value.is_empty() {
            return Err(ValidationError::missing(name));
        }
        Ok(value)
    }

    fn parse(&self, row: &StringRecord) -> Result<DistributionRecord, ValidationError> {
        let serial = self.required(row, "serial")?;
        let phone = self.required(row, "phone")?;
        let date = self.required(row, "distribution_date")?;
        let distribution_date = NaiveDate::parse_from_str(date, DISTRIBUTION_DATE_FORMAT)
            .map_err(|_| {
                ValidationError::new("distribution_date", format!("`{}` is not YYYY-MM-DD", date))
            })?;

        Ok(DistributionRecord {
            id: self.get(row, "id").to_string(),
            name: self.get(row, "name").to_string(),
            region: self.get(row, "region").to_string(),
            district: self.get(row, "district").to_string(),
            village: self.get(row, "village").to_string(),
            phone: phone.to_string(),
            serial: serial.to_string(),
            country: self.get(row, "country").to_string(),
            distribution_date,
        })
    }

    fn ingest(&self, line: u64, row: &StringRecord) -> IngestedRecord {
        let serial = Some(self.get(row, "serial"))
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        IngestedRecord {
            line,
            serial,
            record: self.parse(row),
        }
    }
}

fn stream_error(err: &csv_async::Error) -> StreamError {
    match err.kind() {
        CsvErrorKind::Io(io_err) => {
            StreamError::Io(io::Error::new(io_err.kind(), io_err.to_string()))
        }
        _ => StreamError::Csv(err.to_string()),
    }
}

/// Turns a batch file into a [`RecordStream`]
#[derive(Clone)]
pub struct BatchIngestor {
    fetcher: Arc<dyn ObjectFetcher>,
}

impl BatchIngestor {
    pub fn new(fetcher: Arc<dyn ObjectFetcher>) -> Self {
        Self { fetcher }
    }

    /// Fetch the batch at `location` and read its header.
    ///
    /// Rows are parsed lazily as the returned stream is polled. A row that fails to decode is
    /// yielded as a malformed record; an I/O failure ends the stream with a `StreamError`.
    pub async fn open(&self, location: &ObjectLocation) -> Result<RecordStream, StreamError> {
        let bytes = self.fetcher.fetch(location).await?;
        let mut reader = AsyncReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .create_reader(StreamReader::new(bytes));

        let header = reader.headers().await.map_err(|err| stream_error(&err))?;
        let columns = Columns::from_header(header);
        log::info!("opened batch {} with {} columns", location, header.len());

        let records = reader
            .into_records()
            .enumerate()
            .map(move |(index, row)| {
                // Rows without a reader position fall back to one line per row
                let fallback = index as u64 + 2;
                match row {
                    Ok(row) => {
                        let line = row.position().map(|p| p.line()).unwrap_or(fallback);
                        Ok(columns.ingest(line, &row))
                    }
                    Err(err) if matches!(err.kind(), CsvErrorKind::Io(_)) => {
                        let line = err.position().map(|p| p.line()).unwrap_or(fallback);
                        log::error!("batch stream failed at line {}: {}", line, err);
                        Err(stream_error(&err))
                    }
                    Err(err) => Ok(IngestedRecord {
                        line: err.position().map(|p| p.line()).unwrap_or(fallback),
                        serial: None,
                        record: Err(ValidationError::new("row", err.to_string())),
                    }),
                }
            })
            .scan(false, |failed, item| {
                if *failed {
                    return future::ready(None);
                }
                *failed = item.is_err();
                future::ready(Some(item))
            });

        Ok(Box::pin(records))
    }
}
