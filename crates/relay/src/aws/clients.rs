//! AWS SDK client bundle.

use aws_config::{BehaviorVersion, Region};

use crate::config::AwsConfig;

/// Bundle of AWS SDK clients used by the key provider and both sources.
///
/// All four clients share the same underlying [`aws_config::SdkConfig`] so
/// that credentials are resolved once and reused.
#[derive(Clone)]
pub struct AwsClients {
    /// KMS client used to open an enveloped session key.
    pub kms: aws_sdk_kms::Client,
    /// Secrets Manager client used to fetch the session key.
    pub secretsmanager: aws_sdk_secretsmanager::Client,
    /// S3 client used to list and read customer batch files.
    pub s3: aws_sdk_s3::Client,
    /// Athena client used to query the date-partitioned table.
    pub athena: aws_sdk_athena::Client,
}

impl AwsClients {
    /// Initialise all AWS SDK clients.
    ///
    /// Credentials come from the standard AWS credential chain. When
    /// `cfg.endpoint_url` is set every client targets it instead of the real
    /// AWS endpoints, and S3 switches to path-style addressing.
    pub async fn init(cfg: &AwsConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &cfg.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &cfg.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let s3 = aws_sdk_s3::Client::from_conf(
            aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(cfg.endpoint_url.is_some())
                .build(),
        );

        Self {
            kms: aws_sdk_kms::Client::new(&shared),
            secretsmanager: aws_sdk_secretsmanager::Client::new(&shared),
            s3,
            athena: aws_sdk_athena::Client::new(&shared),
        }
    }
}
