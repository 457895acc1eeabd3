//! Shared AWS SDK configuration for the KMS and SNS adapters.

use crate::config::AwsConfig;
use tracing::debug;

/// Build an SDK config from the default credential chain (env vars,
/// profile, instance role) for the configured region.
pub async fn load_sdk_config(config: &AwsConfig) -> aws_config::SdkConfig {
    let region = aws_config::Region::new(config.region.clone());
    let loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    match &config.endpoint_url {
        Some(endpoint) => {
            debug!(endpoint = %endpoint, "Using AWS endpoint override");
            loader.endpoint_url(endpoint).load().await
        }
        None => loader.load().await,
    }
}
