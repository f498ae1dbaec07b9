use anyhow::Result;
use aws_config::{BehaviorVersion, SdkConfig, retry::RetryConfig};
use aws_sdk_athena as athena;
use dispatcher::{Config, DispatchRequest, DispatchResponse, Dispatcher, Partition};
use lambda_runtime::tracing;

pub async fn get_aws_config() -> SdkConfig {
    let version = BehaviorVersion::v2025_01_17();
    let retry_config = RetryConfig::adaptive().with_max_attempts(3);

    aws_config::defaults(version)
        .retry_config(retry_config)
        .load()
        .await
}

async fn handle(
    athena_client: &athena::Client,
    config: &Config,
    request: lambda_runtime::LambdaEvent<DispatchRequest>,
) -> Result<DispatchResponse> {
    let date_run = request.payload.run_date(config);
    tracing::info!("Running Athena queries for date: {}", date_run);

    // The schedule fires shortly after local midnight, so the local date is trusted as-is.
    let today = chrono::Local::now().date_naive();
    let partition = Partition::resolve(date_run, today)?;
    tracing::info!("Resolved partition: {}", partition);

    let executions = Dispatcher::new(athena_client, config)
        .run(&partition)
        .await?;
    tracing::info!("Number of queries started: {}", executions.len());

    Ok(DispatchResponse::new(&partition, executions))
}

#[tokio::main]
async fn main() -> Result<(), lambda_runtime::Error> {
    lambda_runtime::tracing::init_default_subscriber();

    let config = Config::from_lookup(|key| std::env::var(key).ok())?;
    tracing::info!(
        "Output location for Athena results: {}",
        config.results_location()
    );

    let aws_config = get_aws_config().await;
    let athena_client = athena::Client::new(&aws_config);

    let (athena_client, config) = (&athena_client, &config);
    let service_fn = lambda_runtime::service_fn(move |request| async move {
        handle(athena_client, config, request).await
    });
    lambda_runtime::run(service_fn).await
}
