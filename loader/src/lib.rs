use aws_lambda_events::event::s3::{S3Event, S3EventRecord};
use aws_sdk_dynamodb as dynamodb;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use aws_sdk_s3 as s3;
use csv::StringRecord;
use lambda_runtime::tracing;
use percent_encoding::percent_decode_str;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const KEY_PREFIX: &str = "electricity_by_period";
pub const DEFAULT_TABLE: &str = "ElectricityMeteredByPeriod";
pub const HASH_KEY: &str = "CustomerID";
pub const RANGE_KEY: &str = "SensorID-Period";
pub const AMOUNT_ATTRIBUTE: &str = "kWh-Amount";

const HEADER_TOKEN: &str = "customerid";
const DOWNLOAD_FILE: &str = "electricity_by_period.csv";
const BATCH_SIZE: usize = 25;
const MAX_BATCH_ATTEMPTS: u32 = 5;
const UNPROCESSED_BACKOFF: Duration = Duration::from_millis(25);

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("S3 event is missing the {0}")]
    MissingObjectReference(&'static str),
    #[error("S3 object key {0:?} is not valid percent-encoded UTF-8")]
    MalformedObjectKey(String),
    #[error("not a valid key prefix: {prefix:?} (key {key:?})")]
    PrefixMismatch { key: String, prefix: String },
    #[error("failed to download s3://{bucket}/{key}")]
    Retrieval {
        bucket: String,
        key: String,
        #[source]
        source: BoxError,
    },
    #[error("temporary download storage failed")]
    TempStorage(#[source] std::io::Error),
    #[error("malformed row at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },
    #[error("failed to write {count} items starting at {first} into {table}")]
    Write {
        table: String,
        first: String,
        count: usize,
        #[source]
        source: BoxError,
    },
}

/// Bucket and decoded key of the object that triggered the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> ObjectRef {
        ObjectRef {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn from_s3_event(event: &S3Event) -> Result<Vec<ObjectRef>, LoadError> {
        if event.records.is_empty() {
            return Err(LoadError::MissingObjectReference("records"));
        }

        event.records.iter().map(Self::from_record).collect()
    }

    fn from_record(record: &S3EventRecord) -> Result<ObjectRef, LoadError> {
        let bucket = record
            .s3
            .bucket
            .name
            .as_ref()
            .ok_or(LoadError::MissingObjectReference("bucket name"))?;
        let key = record
            .s3
            .object
            .key
            .as_ref()
            .ok_or(LoadError::MissingObjectReference("object key"))?;

        Ok(ObjectRef::new(bucket, decode_key(key)?))
    }

    /// The path segment before the first `/`, or the whole key without one.
    pub fn key_prefix(&self) -> &str {
        self.key
            .split_once('/')
            .map_or(self.key.as_str(), |(prefix, _)| prefix)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        let prefix = self.key_prefix();
        if prefix == KEY_PREFIX {
            return Ok(());
        }

        tracing::error!(
            "Not a valid key prefix for s3://{}/{}: {:?}",
            self.bucket,
            self.key,
            prefix
        );
        Err(LoadError::PrefixMismatch {
            key: self.key.clone(),
            prefix: prefix.into(),
        })
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Decodes an S3 notification key, where `+` stands for a space.
pub fn decode_key(raw: &str) -> Result<String, LoadError> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|key| key.into_owned())
        .map_err(|_| LoadError::MalformedObjectKey(raw.into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteredRecord {
    pub customer_id: i64,
    pub sensor_period: String,
    pub kwh: Decimal,
}

impl MeteredRecord {
    fn from_row(row: &StringRecord) -> Result<MeteredRecord, LoadError> {
        let line = row.position().map_or(0, |p| p.line());
        let malformed = |reason: String| LoadError::MalformedRow { line, reason };

        if row.len() < 3 {
            return Err(malformed(format!(
                "expected 3 columns, found {}",
                row.len()
            )));
        }

        let customer_id = row[0]
            .parse::<i64>()
            .map_err(|e| malformed(format!("customer id {:?}: {}", &row[0], e)))?;
        let kwh = parse_amount(&row[2]).map_err(|e| {
            malformed(format!(
                "kWh amount {:?} is not a decimal within 28 significant digits: {}",
                &row[2], e
            ))
        })?;

        Ok(MeteredRecord {
            customer_id,
            sensor_period: row[1].to_string(),
            kwh,
        })
    }

    pub fn item(&self) -> HashMap<String, AttributeValue> {
        HashMap::from([
            (
                HASH_KEY.into(),
                AttributeValue::N(self.customer_id.to_string()),
            ),
            (
                RANGE_KEY.into(),
                AttributeValue::S(self.sensor_period.clone()),
            ),
            (AMOUNT_ATTRIBUTE.into(), AttributeValue::N(self.kwh.to_string())),
        ])
    }

    fn to_wr(&self) -> Result<WriteRequest, BoxError> {
        let put = PutRequest::builder().set_item(Some(self.item())).build()?;
        Ok(WriteRequest::builder().put_request(put).build())
    }
}

impl fmt::Display for MeteredRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}: {}, {}: {:?}, {}: {}}}",
            HASH_KEY, self.customer_id, RANGE_KEY, self.sensor_period, AMOUNT_ATTRIBUTE, self.kwh
        )
    }
}

// Athena renders large or tiny doubles in scientific notation.
fn parse_amount(value: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(value).or_else(|_| Decimal::from_scientific(value))
}

/// Parses Athena CSV output into records, failing on the first bad row.
///
/// Rows whose first column is literally `customerid` are treated as headers
/// and skipped wherever they appear.
pub fn parse_records<R: Read>(reader: R) -> Result<Vec<MeteredRecord>, LoadError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let mut records = Vec::new();
    for result in rdr.records() {
        let row = result.map_err(|e| LoadError::MalformedRow {
            line: e.position().map_or(0, |p| p.line()),
            reason: e.to_string(),
        })?;

        if row.get(0) == Some(HEADER_TOKEN) {
            continue;
        }
        records.push(MeteredRecord::from_row(&row)?);
    }

    Ok(records)
}

pub trait ObjectSource {
    /// Downloads the object into `destination`, returning the bytes written.
    fn download(
        &self,
        object: &ObjectRef,
        destination: &Path,
    ) -> impl Future<Output = Result<u64, BoxError>> + Send;
}

impl ObjectSource for s3::Client {
    async fn download(&self, object: &ObjectRef, destination: &Path) -> Result<u64, BoxError> {
        let out = self
            .get_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| e.into_service_error())?;

        let mut body = out.body.into_async_read();
        let mut file = tokio::fs::File::create(destination).await?;
        let written = tokio::io::copy(&mut body, &mut file).await?;
        file.flush().await?;

        Ok(written)
    }
}

pub trait ItemSink {
    /// Puts the records into `table` and returns those the store left unprocessed.
    fn write_batch(
        &self,
        table: &str,
        records: &[MeteredRecord],
    ) -> impl Future<Output = Result<Vec<MeteredRecord>, BoxError>> + Send;
}

impl ItemSink for dynamodb::Client {
    async fn write_batch(
        &self,
        table: &str,
        records: &[MeteredRecord],
    ) -> Result<Vec<MeteredRecord>, BoxError> {
        let wrs = records
            .iter()
            .map(MeteredRecord::to_wr)
            .collect::<Result<Vec<_>, _>>()?;

        let out = self
            .batch_write_item()
            .request_items(table, wrs)
            .send()
            .await
            .map_err(|e| e.into_service_error())?;

        let unprocessed: Vec<MeteredRecord> = out
            .unprocessed_items()
            .and_then(|unprocessed| unprocessed.get(table))
            .map(|wrs| {
                records
                    .iter()
                    .filter(|record| record.to_wr().is_ok_and(|wr| wrs.contains(&wr)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(unprocessed)
    }
}

pub struct Loader<'a, S, W> {
    source: &'a S,
    sink: &'a W,
    table: &'a str,
}

impl<'a, S: ObjectSource, W: ItemSink> Loader<'a, S, W> {
    pub fn new(source: &'a S, sink: &'a W, table: &'a str) -> Loader<'a, S, W> {
        Loader {
            source,
            sink,
            table,
        }
    }

    /// Loads one Athena result file and returns the number of items written.
    pub async fn run(&self, object: &ObjectRef) -> Result<usize, LoadError> {
        object.validate()?;

        let records = self.fetch_records(object).await?;
        tracing::info!(
            "Writing {} records from {} into DynamoDB table {}",
            records.len(),
            object,
            self.table
        );

        self.write(&records).await?;
        Ok(records.len())
    }

    async fn fetch_records(&self, object: &ObjectRef) -> Result<Vec<MeteredRecord>, LoadError> {
        // Removed with its contents when `dir` drops, on every return path.
        let dir = tempfile::Builder::new()
            .prefix(KEY_PREFIX)
            .tempdir()
            .map_err(|e| {
                tracing::error!("Error creating temporary download directory: {}", e);
                LoadError::TempStorage(e)
            })?;
        let path = dir.path().join(DOWNLOAD_FILE);

        match self.source.download(object, &path).await {
            Ok(bytes) => tracing::info!("Downloaded {} bytes from {}", bytes, object),
            Err(source) => {
                tracing::error!("Error downloading {}: {}", object, source);
                return Err(LoadError::Retrieval {
                    bucket: object.bucket.clone(),
                    key: object.key.clone(),
                    source,
                });
            }
        }

        let file = std::fs::File::open(&path).map_err(LoadError::TempStorage)?;
        parse_records(file).inspect_err(|e| {
            tracing::error!("Error working in file {}: {}", path.display(), e);
        })
    }

    /// Writes in batches, resending unprocessed items the way a buffered
    /// batch writer does, up to `MAX_BATCH_ATTEMPTS` calls per batch.
    async fn write(&self, records: &[MeteredRecord]) -> Result<(), LoadError> {
        for batch in records.chunks(BATCH_SIZE) {
            let mut pending = batch.to_vec();

            for attempt in 1..=MAX_BATCH_ATTEMPTS {
                pending = match self.sink.write_batch(self.table, &pending).await {
                    Ok(unprocessed) => unprocessed,
                    Err(source) => return Err(self.write_failed(&pending, source)),
                };
                if pending.is_empty() {
                    break;
                }

                tracing::warn!(
                    "{} items left unprocessed by {} after attempt {}",
                    pending.len(),
                    self.table,
                    attempt
                );
                if attempt < MAX_BATCH_ATTEMPTS {
                    tokio::time::sleep(UNPROCESSED_BACKOFF * 2u32.pow(attempt - 1)).await;
                }
            }

            if !pending.is_empty() {
                let source = format!(
                    "{} items still unprocessed after {} attempts",
                    pending.len(),
                    MAX_BATCH_ATTEMPTS
                );
                return Err(self.write_failed(&pending, source.into()));
            }

            for record in batch {
                tracing::info!("Wrote metering data for item: {}", record);
            }
        }

        Ok(())
    }

    fn write_failed(&self, pending: &[MeteredRecord], source: BoxError) -> LoadError {
        let first = pending[0].to_string();
        tracing::error!(
            "Error writing metering data starting at item {}: {}",
            first,
            source
        );
        LoadError::Write {
            table: self.table.into(),
            first,
            count: pending.len(),
            source,
        }
    }
}
