//! S3 blob store
//!
//! `s3://bucket[/prefix][?region=...&endpoint=...]`. Keys are stored under
//! the optional prefix.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use url::Url;

use super::{BlobError, BlobResult, BlobStore, ListEntry};

/// Lifetime of URLs returned by `signed_url`
const SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

/// Blob store backed by an S3 bucket
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    /// Key prefix, empty or ending in `/`
    prefix: String,
}

impl S3BlobStore {
    /// Open the bucket named by an `s3://` URL
    pub async fn open(url: &Url) -> BlobResult<Self> {
        let bucket = url
            .host_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| BlobError::InvalidUrl {
                url: url.to_string(),
                message: "missing bucket name".to_string(),
            })?
            .to_string();

        let mut region = None;
        let mut endpoint = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "region" => region = Some(value.into_owned()),
                "endpoint" => endpoint = Some(value.into_owned()),
                _ => {}
            }
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region));
        }
        let aws_config = loader.load().await;

        let mut config = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = endpoint {
            config = config.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(config.build()),
            bucket,
            prefix: normalize_prefix(url.path()),
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str()).unwrap_or(key)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn exists(&self, key: &str) -> BlobResult<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_not_found_error(&err) => Ok(false),
            Err(err) => Err(BlobError::backend(err)),
        }
    }

    async fn read_all(&self, key: &str) -> BlobResult<Vec<u8>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await;

        match result {
            Ok(output) => {
                let body = output.body.collect().await.map_err(|e| BlobError::Io {
                    key: key.to_string(),
                    message: e.to_string(),
                })?;
                Ok(body.into_bytes().to_vec())
            }
            Err(err) if is_not_found_error(&err) => Err(BlobError::NotFound(key.to_string())),
            Err(err) => Err(BlobError::backend(err)),
        }
    }

    async fn write_all(
        &self,
        key: &str,
        data: &[u8],
        content_type: Option<&str>,
    ) -> BlobResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(data.to_vec()));

        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }

        request.send().await.map_err(BlobError::backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        // S3 deletes are idempotent; report missing keys like the local store.
        if !self.exists(key).await? {
            return Err(BlobError::NotFound(key.to_string()));
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(BlobError::backend)?;
        Ok(())
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> BlobResult<Vec<ListEntry>> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.full_key(prefix));
            if let Some(delimiter) = delimiter {
                request = request.delimiter(delimiter);
            }
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let output = request.send().await.map_err(BlobError::backend)?;

            for common in output.common_prefixes() {
                if let Some(key) = common.prefix() {
                    entries.push(ListEntry {
                        key: self.strip_prefix(key).to_string(),
                        is_dir: true,
                        modified: None,
                    });
                }
            }
            for object in output.contents() {
                if let Some(key) = object.key() {
                    let modified = object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));
                    entries.push(ListEntry {
                        key: self.strip_prefix(key).to_string(),
                        is_dir: false,
                        modified,
                    });
                }
            }

            match (output.is_truncated(), output.next_continuation_token()) {
                (Some(true), Some(token)) => continuation = Some(token.to_string()),
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn copy(&self, dst: &str, src: &str) -> BlobResult<()> {
        // Stack keys are restricted to URL-safe characters, so the copy
        // source needs no escaping.
        let source = format!("{}/{}", self.bucket, self.full_key(src));
        let result = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(source)
            .key(self.full_key(dst))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_not_found_error(&err) => Err(BlobError::NotFound(src.to_string())),
            Err(err) => Err(BlobError::backend(err)),
        }
    }

    async fn signed_url(&self, key: &str) -> BlobResult<String> {
        let config = PresigningConfig::expires_in(SIGNED_URL_TTL).map_err(BlobError::backend)?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .presigned(config)
            .await
            .map_err(BlobError::backend)?;
        Ok(request.uri().to_string())
    }
}

/// Turn a URL path into a key prefix: no leading `/`, trailing `/` unless empty
fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Check if an S3 error is a "not found" error
fn is_not_found_error<E>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    err.raw_response()
        .is_some_and(|raw| raw.status().as_u16() == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("/team/state"), "team/state/");
        assert_eq!(normalize_prefix("/team/state/"), "team/state/");
    }

    #[tokio::test]
    async fn test_open_requires_bucket() {
        let url = Url::parse("s3:///prefix").unwrap();
        assert!(matches!(
            S3BlobStore::open(&url).await,
            Err(BlobError::InvalidUrl { .. })
        ));
    }
}
