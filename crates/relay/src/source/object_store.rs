//! S3 listing and reading of per-customer JSON batch files.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::SourceError;

/// File extensions stripped when deriving a group hint from an object key.
const BATCH_EXTENSIONS: [&str; 3] = [".json", ".jsonl", ".ndjson"];

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitListing {
    /// Object key.
    pub unit_id: String,
    /// Last-modified time; objects without one sort first.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Read-only view of the bucket holding batch files.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List units under `prefix`, sorted ascending by last-modified time.
    async fn list_units(&self, bucket: &str, prefix: &str)
        -> Result<Vec<UnitListing>, SourceError>;

    /// Read one unit. A missing object yields `Ok(None)` rather than an error.
    async fn read_unit(&self, bucket: &str, unit_id: &str) -> Result<Option<Bytes>, SourceError>;
}

/// [`ObjectStore`] backed by AWS S3.
pub struct S3ObjectStore {
    s3: aws_sdk_s3::Client,
}

impl S3ObjectStore {
    /// Wrap a configured S3 client.
    pub fn new(s3: aws_sdk_s3::Client) -> Self {
        Self { s3 }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_units(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<UnitListing>, SourceError> {
        let mut pages = self
            .s3
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut listings = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                SourceError::Unavailable(format!(
                    "failed to list s3://{bucket}/{prefix}: {}",
                    e.into_service_error()
                ))
            })?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                // Folder placeholders carry no records.
                if key.ends_with('/') {
                    continue;
                }
                listings.push(UnitListing {
                    unit_id: key.to_owned(),
                    last_modified: obj.last_modified().and_then(to_chrono),
                });
            }
        }

        sort_listings(&mut listings);
        debug!(bucket, prefix, count = listings.len(), "listed batch files");
        Ok(listings)
    }

    async fn read_unit(&self, bucket: &str, unit_id: &str) -> Result<Option<Bytes>, SourceError> {
        let resp = match self.s3.get_object().bucket(bucket).key(unit_id).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let err = e.into_service_error();
                if err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(SourceError::Unavailable(format!(
                    "failed to fetch s3://{bucket}/{unit_id}: {err}"
                )));
            }
        };

        let body = resp.body.collect().await.map_err(|e| {
            SourceError::Unavailable(format!("failed to read body of s3://{bucket}/{unit_id}: {e}"))
        })?;
        Ok(Some(body.into_bytes()))
    }
}

/// Oldest first; equal or missing timestamps fall back to key order.
pub fn sort_listings(listings: &mut [UnitListing]) {
    listings.sort_by(|a, b| {
        a.last_modified
            .cmp(&b.last_modified)
            .then_with(|| a.unit_id.cmp(&b.unit_id))
    });
}

/// Derive a group hint from an object key.
///
/// Strips `prefix`, takes the first path segment, and removes a batch file
/// extension: `batches/cust-42.json` and `batches/cust-42/part-1.json` both
/// give `cust-42`.
pub fn group_hint_from_key(key: &str, prefix: &str) -> Option<String> {
    let without_prefix = key.strip_prefix(prefix).unwrap_or(key);
    let first = without_prefix.trim_start_matches('/').split('/').next()?;
    let stem = BATCH_EXTENSIONS
        .iter()
        .find_map(|ext| first.strip_suffix(ext))
        .unwrap_or(first);
    (!stem.is_empty()).then(|| stem.to_owned())
}

fn to_chrono(ts: &aws_smithy_types::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}
