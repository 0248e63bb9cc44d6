use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CreateBucketConfiguration, PublicAccessBlockConfiguration,
};
use aws_sdk_s3::Client;
use base64::Engine;
use futures::StreamExt;
use std::env;
use tracing::{debug, info};

use crate::store::{BlobPut, BlobStore, ContainerHandle, PutResult};
use crate::{ByteStream, UploadError, UploadResult};

/// Connection settings for an S3-compatible object store
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint (MinIO, RustFS, ...); AWS itself when `None`
    pub endpoint_url: Option<String>,
}

impl S3Config {
    /// Read `S3_REGION`, `S3_ACCESS_KEY_ID`, `S3_SECRET_ACCESS_KEY` and the
    /// optional `S3_ENDPOINT_URL`
    pub fn from_env() -> UploadResult<Self> {
        fn get_env(key: &str) -> UploadResult<String> {
            env::var(key)
                .map_err(|_| UploadError::invalid(format!("{} environment variable required", key)))
        }

        Ok(Self {
            region: get_env("S3_REGION")?,
            access_key_id: get_env("S3_ACCESS_KEY_ID")?,
            secret_access_key: get_env("S3_SECRET_ACCESS_KEY")?,
            endpoint_url: env::var("S3_ENDPOINT_URL").ok(),
        })
    }
}

/// [`BlobStore`] over S3-compatible object storage; containers are buckets.
///
/// Clone it freely: clones share the underlying SDK client.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
}

impl S3BlobStore {
    pub async fn new(config: S3Config) -> Self {
        Self {
            client: Self::create_client(config).await,
        }
    }

    pub async fn from_env() -> UploadResult<Self> {
        Ok(Self::new(S3Config::from_env()?).await)
    }

    /// Wrap an already configured client
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn create_client(config: S3Config) -> Client {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "dog-upload",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        let path_style = config.endpoint_url.is_some();
        if let Some(endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let aws_config = loader.load().await;

        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(path_style)
                .build(),
        )
    }

    async fn collect_stream(
        stream: &mut ByteStream,
        size_hint: Option<u64>,
    ) -> UploadResult<Vec<u8>> {
        let mut data = Vec::with_capacity(size_hint.unwrap_or(0) as usize);
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }

    fn map_aws_error(err: impl std::error::Error + Send + Sync + 'static) -> UploadError {
        UploadError::backend(err)
    }
}

/// Location constraint for a new bucket; us-east-1 (and an unknown region)
/// must not send one
fn bucket_configuration(region: Option<&str>) -> Option<CreateBucketConfiguration> {
    match region {
        None | Some("us-east-1") => None,
        Some(region) => Some(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build(),
        ),
    }
}

/// Keeps ACLs blocked but lets a bucket policy grant public reads
fn policy_friendly_access_block() -> PublicAccessBlockConfiguration {
    PublicAccessBlockConfiguration::builder()
        .block_public_acls(true)
        .ignore_public_acls(true)
        .block_public_policy(false)
        .restrict_public_buckets(false)
        .build()
}

/// Bucket policy letting anyone read objects (not list them)
fn public_read_policy(bucket: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "PublicReadGetObject",
            "Effect": "Allow",
            "Principal": "*",
            "Action": ["s3:GetObject"],
            "Resource": [format!("arn:aws:s3:::{}/*", bucket)],
        }]
    })
    .to_string()
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn list_keys(
        &self,
        container: &ContainerHandle,
        prefix: Option<&str>,
    ) -> UploadResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(container.name())
                .set_prefix(prefix.map(str::to_string))
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(Self::map_aws_error)?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string())
                }
                _ => break,
            }
        }

        debug!(container = %container, count = keys.len(), "Listed bucket keys");
        Ok(keys)
    }

    async fn put_stream(
        &self,
        container: &ContainerHandle,
        key: &str,
        put: BlobPut,
        mut stream: ByteStream,
    ) -> UploadResult<PutResult> {
        let data = Self::collect_stream(&mut stream, put.size_hint).await?;
        let size_bytes = data.len() as u64;

        let mut request = self
            .client
            .put_object()
            .bucket(container.name())
            .key(key)
            .content_type(put.content_type)
            .content_length(size_bytes as i64);
        if let Some(md5) = put.content_md5 {
            request = request.content_md5(base64::engine::general_purpose::STANDARD.encode(md5));
        }

        let output = request
            .body(AwsByteStream::from(data))
            .send()
            .await
            .map_err(Self::map_aws_error)?;

        Ok(PutResult {
            etag: output.e_tag().map(|etag| etag.trim_matches('"').to_string()),
            size_bytes,
        })
    }

    async fn ensure_container(&self, name: &str) -> UploadResult<ContainerHandle> {
        match self.client.head_bucket().bucket(name).send().await {
            Ok(_) => return Ok(ContainerHandle::new(name)),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => {}
            Err(err) => return Err(Self::map_aws_error(err)),
        }

        let region = self.client.config().region().map(|region| region.as_ref());
        let created = self
            .client
            .create_bucket()
            .bucket(name)
            .set_create_bucket_configuration(bucket_configuration(region))
            .send()
            .await;
        match created {
            Ok(_) => info!(bucket = name, "Created bucket"),
            Err(err)
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_bucket_already_owned_by_you()) => {}
            Err(err) => return Err(Self::map_aws_error(err)),
        }

        Ok(ContainerHandle::new(name))
    }

    async fn set_public_read_access(&self, container: &ContainerHandle) -> UploadResult<()> {
        // New AWS buckets block public policies until this is relaxed.
        let relaxed = self
            .client
            .put_public_access_block()
            .bucket(container.name())
            .public_access_block_configuration(policy_friendly_access_block())
            .send()
            .await;
        match relaxed {
            Ok(_) => {}
            Err(err) if err.code() == Some("NotImplemented") => {
                debug!(bucket = %container, "Store has no public access block settings");
            }
            Err(err) => return Err(Self::map_aws_error(err)),
        }

        self.client
            .put_bucket_policy()
            .bucket(container.name())
            .policy(public_read_policy(container.name()))
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_read_policy() {
        let policy: serde_json::Value =
            serde_json::from_str(&public_read_policy("photos")).unwrap();
        let statement = &policy["Statement"][0];
        assert_eq!(statement["Action"][0], "s3:GetObject");
        assert_eq!(statement["Resource"][0], "arn:aws:s3:::photos/*");
        assert_eq!(statement["Principal"], "*");
    }

    #[test]
    fn test_location_constraint_outside_us_east_1() {
        assert!(bucket_configuration(None).is_none());
        assert!(bucket_configuration(Some("us-east-1")).is_none());

        let config = bucket_configuration(Some("eu-west-1")).unwrap();
        assert_eq!(
            config.location_constraint(),
            Some(&BucketLocationConstraint::EuWest1)
        );
    }

    #[test]
    fn test_access_block_allows_public_policy() {
        let block = policy_friendly_access_block();
        assert_eq!(block.block_public_policy(), Some(false));
        assert_eq!(block.restrict_public_buckets(), Some(false));
        assert_eq!(block.block_public_acls(), Some(true));
    }
}
