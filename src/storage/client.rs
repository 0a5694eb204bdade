use async_trait::async_trait;
use aws_sdk_s3::{config::BehaviorVersion, error::SdkError, primitives::ByteStream, Client};
use futures::stream::{self, StreamExt, TryStreamExt};
use uuid::Uuid;

use super::{error::StorageError, Metadata, ObjectAttrs, ObjectStore, PutCondition};

/// Maximum concurrent `HeadObject` calls issued while listing.
const HEAD_CONCURRENCY: usize = 16;

/// Configuration for connecting to an S3-compatible storage service.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Optional custom endpoint URL (e.g., for local development with LocalStack/MinIO).
    pub endpoint: Option<String>,
    /// The S3 bucket name.
    pub bucket: String,
    /// The AWS region.
    pub region: String,
}

impl S3Config {
    /// Creates a new `S3Config` with explicit values.
    #[must_use]
    pub const fn new(endpoint: Option<String>, bucket: String, region: String) -> Self {
        Self {
            endpoint,
            bucket,
            region,
        }
    }
}

/// [`ObjectStore`] over an S3-compatible bucket.
///
/// Object bodies carry a random token so each write yields a distinct `ETag`;
/// all queue state lives in user metadata.
#[derive(Debug, Clone)]
pub struct S3Client {
    client: Client,
    config: S3Config,
}

impl S3Client {
    /// Creates a new `S3Client` with the given configuration.
    ///
    /// Custom endpoints switch the client to path-style addressing, which
    /// `LocalStack` and `MinIO` require.
    pub async fn new(config: S3Config) -> Result<Self, StorageError> {
        if config.bucket.is_empty() {
            return Err(StorageError::ConfigurationError(
                "bucket name must not be empty".to_string(),
            ));
        }

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(ref endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self { client, config })
    }

    /// Returns the bucket name.
    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn list_names(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|ref err| map_sdk_error(err, prefix, &self.config.bucket))?;

            names.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(ToString::to_string)),
            );

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn put(
        &self,
        name: &str,
        metadata: Metadata,
        condition: PutCondition,
    ) -> Result<ObjectAttrs, StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(name)
            .body(ByteStream::from(Uuid::new_v4().to_string().into_bytes()))
            .set_metadata(Some(metadata.clone()));

        match condition {
            PutCondition::None => {}
            PutCondition::IfNoneMatch => {
                request = request.if_none_match("*");
            }
            PutCondition::IfMatch(ref etag) => {
                request = request.if_match(etag);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|ref err| map_sdk_error(err, name, &self.config.bucket))?;

        Ok(ObjectAttrs {
            name: name.to_string(),
            etag: response.e_tag().map(ToString::to_string).unwrap_or_default(),
            metadata,
        })
    }

    async fn attrs(&self, name: &str) -> Result<ObjectAttrs, StorageError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.config.bucket)
            .key(name)
            .send()
            .await
            .map_err(|ref err| map_sdk_error(err, name, &self.config.bucket))?;

        Ok(ObjectAttrs {
            name: name.to_string(),
            etag: response.e_tag().map(ToString::to_string).unwrap_or_default(),
            metadata: response.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>, StorageError> {
        let names = self.list_names(prefix).await?;

        let mut objects: Vec<ObjectAttrs> = stream::iter(names)
            .map(|name| async move {
                match self.attrs(&name).await {
                    Ok(attrs) => Ok(Some(attrs)),
                    Err(StorageError::NotFound { .. }) => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .buffer_unordered(HEAD_CONCURRENCY)
            .try_filter_map(|attrs| async move { Ok(attrs) })
            .try_collect()
            .await?;

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(name)
            .send()
            .await
            .map_err(|ref err| map_sdk_error(err, name, &self.config.bucket))?;

        Ok(())
    }

    async fn delete_if_match(&self, name: &str, etag: &str) -> Result<(), StorageError> {
        let result = self
            .client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(name)
            .if_match(etag)
            .send()
            .await
            .map_err(|ref err| map_sdk_error(err, name, &self.config.bucket));

        match result {
            Ok(_) => Ok(()),
            // Some implementations answer a conditional delete of a missing
            // object with 412; tell the two apart.
            Err(StorageError::PreconditionFailed { .. }) => match self.attrs(name).await {
                Ok(_) => Err(StorageError::PreconditionFailed {
                    key: name.to_string(),
                }),
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

/// Maps an SDK failure on `key` to a `StorageError` by HTTP status.
fn map_sdk_error<E>(err: &SdkError<E>, key: &str, bucket: &str) -> StorageError {
    match err {
        SdkError::ServiceError(service_err) => match service_err.raw().status().as_u16() {
            404 => {
                return StorageError::NotFound {
                    key: key.to_string(),
                }
            }
            // Some S3 implementations answer a lost If-Match race with 409.
            409 | 412 => {
                return StorageError::PreconditionFailed {
                    key: key.to_string(),
                }
            }
            403 => {
                return StorageError::AccessDenied {
                    bucket: bucket.to_string(),
                }
            }
            _ => {}
        },
        SdkError::DispatchFailure(dispatch_err) => {
            if dispatch_err.is_io() || dispatch_err.is_timeout() {
                return StorageError::ConnectionError(err.to_string());
            }
        }
        SdkError::TimeoutError(_) => return StorageError::ConnectionError(err.to_string()),
        _ => {}
    }
    StorageError::S3Error(err.to_string())
}
