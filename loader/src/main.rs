use anyhow::Result;
use aws_config::{BehaviorVersion, SdkConfig, retry::RetryConfig};
use aws_lambda_events::event::s3::S3Event;
use aws_sdk_dynamodb as dynamodb;
use aws_sdk_s3 as s3;
use lambda_runtime::tracing;
use loader::{DEFAULT_TABLE, Loader, ObjectRef};

pub async fn get_aws_config() -> SdkConfig {
    let version = BehaviorVersion::v2025_01_17();
    let retry_config = RetryConfig::adaptive().with_max_attempts(3);

    aws_config::defaults(version)
        .retry_config(retry_config)
        .load()
        .await
}

fn get_dynamodb_table() -> String {
    std::env::var("DYNAMODB_TABLE").unwrap_or_else(|_| DEFAULT_TABLE.into())
}

async fn handle(
    s3_client: &s3::Client,
    ddb_client: &dynamodb::Client,
    table: &str,
    request: lambda_runtime::LambdaEvent<S3Event>,
) -> Result<()> {
    let objects = ObjectRef::from_s3_event(&request.payload)?;
    tracing::info!("Number of objects received: {}", objects.len());

    let loader = Loader::new(s3_client, ddb_client, table);
    for object in &objects {
        let written = loader.run(object).await?;
        tracing::info!("Number of items written from {}: {}", object, written);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), lambda_runtime::Error> {
    lambda_runtime::tracing::init_default_subscriber();

    let aws_config = get_aws_config().await;
    let s3_client = s3::Client::new(&aws_config);
    let ddb_client = dynamodb::Client::new(&aws_config);
    let table = get_dynamodb_table();

    let (s3_client, ddb_client, table) = (&s3_client, &ddb_client, table.as_str());
    let service_fn = lambda_runtime::service_fn(move |request| async move {
        handle(s3_client, ddb_client, table, request).await
    });
    lambda_runtime::run(service_fn).await
}
