use aws_sdk_athena as athena;
use aws_sdk_athena::types::{
    EncryptionConfiguration, EncryptionOption, QueryExecutionContext, ResultConfiguration,
};
use chrono::{Datelike, NaiveDate};
use lambda_runtime::tracing;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;

/// Run date meaning "yesterday, relative to the invocation time".
pub const AUTOMATIC_DATE: &str = "0000/00/00";
pub const DEFAULT_DATABASE: &str = "iotanalyticsdb";
pub const DEFAULT_CATALOG: &str = "AwsDataCatalog";
const DATE_FORMAT: &str = "%Y/%m/%d";
const RESULTS_PREFIX: &str = "electricity_by_period/";

// Column names follow the Glue tables, `sendorid` included.
const HOURLY_QUERY: &str = concat!(
    "SELECT cust.customerid, ",
    "(CAST(cust.sendorid AS varchar) || '#' || iot.year || '-' || iot.month || '-' || iot.day || 'T' || iot.hourcollected) sensorid_hour, ",
    "iot.kwh total_kwh ",
    "FROM iot_electricity_metering iot ",
    "INNER JOIN customer_meter_sensor cust ON (iot.sendorid = cust.sendorid) ",
    "WHERE iot.year = ? AND iot.month = ? AND iot.day = ? ",
    "ORDER BY 1, 2"
);

const DAILY_QUERY: &str = concat!(
    "SELECT cust.customerid, ",
    "(CAST(cust.sendorid AS varchar) || '#' || iot.year || '-' || iot.month || '-' || iot.day) sensorid_day, ",
    "ROUND(SUM(iot.kwh), 2) total_kwh ",
    "FROM iot_electricity_metering iot ",
    "INNER JOIN customer_meter_sensor cust ON (iot.sendorid = cust.sendorid) ",
    "WHERE iot.year = ? AND iot.month = ? AND iot.day = ? ",
    "GROUP BY cust.customerid, (CAST(cust.sendorid AS varchar) || '#' || iot.year || '-' || iot.month || '-' || iot.day) ",
    "ORDER BY 1, 2"
);

// No day filter: the whole month is aggregated.
const MONTHLY_QUERY: &str = concat!(
    "SELECT cust.customerid, ",
    "(CAST(cust.sendorid AS varchar) || '#' || iot.year || '-' || iot.month) sensorid_month, ",
    "ROUND(SUM(iot.kwh), 2) total_kwh ",
    "FROM iot_electricity_metering iot ",
    "INNER JOIN customer_meter_sensor cust ON (iot.sendorid = cust.sendorid) ",
    "WHERE iot.year = ? AND iot.month = ? ",
    "GROUP BY cust.customerid, (CAST(cust.sendorid AS varchar) || '#' || iot.year || '-' || iot.month) ",
    "ORDER BY 1, 2"
);

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("malformed run date {input:?}, expected YYYY/MM/DD: {reason}")]
    MalformedDateInput { input: String, reason: String },
    #[error("no previous day exists for {0}")]
    DateOutOfRange(NaiveDate),
    #[error("missing configuration value {0}")]
    MissingConfig(&'static str),
    #[error("failed to submit the Athena query for electricity metered by {kind}")]
    QuerySubmission {
        kind: QueryKind,
        #[source]
        source: BoxError,
    },
}

/// Deployment configuration, read once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub date_run: String,
    pub output_location: String,
    pub database: String,
    pub catalog: String,
}

impl Config {
    pub fn from_lookup<F>(lookup: F) -> Result<Config, DispatchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let output_location = lookup("ATHENA_OUTPUT_LOCATION")
            .filter(|location| !location.is_empty())
            .ok_or(DispatchError::MissingConfig("ATHENA_OUTPUT_LOCATION"))?;

        Ok(Config {
            date_run: lookup("DATE_RUN").unwrap_or_else(|| AUTOMATIC_DATE.into()),
            output_location,
            database: lookup("ATHENA_DATABASE").unwrap_or_else(|| DEFAULT_DATABASE.into()),
            catalog: lookup("ATHENA_CATALOG").unwrap_or_else(|| DEFAULT_CATALOG.into()),
        })
    }

    pub fn results_location(&self) -> String {
        if self.output_location.ends_with('/') {
            format!("{}{}", self.output_location, RESULTS_PREFIX)
        } else {
            format!("{}/{}", self.output_location, RESULTS_PREFIX)
        }
    }
}

/// The year/month/day partition the queries run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    date: NaiveDate,
}

impl Partition {
    pub fn new(date: NaiveDate) -> Partition {
        Partition { date }
    }

    /// Resolves the run date against `today`, the invocation's local date.
    pub fn resolve(date_run: &str, today: NaiveDate) -> Result<Partition, DispatchError> {
        if date_run == AUTOMATIC_DATE {
            return today
                .pred_opt()
                .map(Partition::new)
                .ok_or(DispatchError::DateOutOfRange(today));
        }

        let parsed = if has_date_shape(date_run) {
            NaiveDate::parse_from_str(date_run, DATE_FORMAT).map_err(|e| e.to_string())
        } else {
            Err("not of the form YYYY/MM/DD".into())
        };

        match parsed {
            Ok(date) => Ok(Partition::new(date)),
            Err(reason) => {
                tracing::error!("Error parsing manual run date {:?}: {}", date_run, reason);
                Err(DispatchError::MalformedDateInput {
                    input: date_run.into(),
                    reason,
                })
            }
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn year(&self) -> String {
        self.date.format("%Y").to_string()
    }

    pub fn month(&self) -> String {
        self.date.format("%m").to_string()
    }

    pub fn day(&self) -> String {
        self.date.format("%d").to_string()
    }

    pub fn is_month_end(&self) -> bool {
        self.date.day() == days_in_month(self.date.year(), self.date.month())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.year(), self.month(), self.day())
    }
}

// chrono alone accepts signs, padding spaces and years outside four digits.
fn has_date_shape(value: &str) -> bool {
    let parts: Vec<&str> = value.split('/').collect();
    let [year, month, day] = parts.as_slice() else {
        return false;
    };

    let digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
    year.len() == 4
        && (1..=2).contains(&month.len())
        && (1..=2).contains(&day.len())
        && [*year, *month, *day].into_iter().all(digits)
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Hourly,
    Daily,
    Monthly,
}

impl QueryKind {
    fn template(self) -> &'static str {
        match self {
            QueryKind::Hourly => HOURLY_QUERY,
            QueryKind::Daily => DAILY_QUERY,
            QueryKind::Monthly => MONTHLY_QUERY,
        }
    }

    fn parameters(self, partition: &Partition) -> Vec<String> {
        let mut values = vec![partition.year(), partition.month()];
        if self != QueryKind::Monthly {
            values.push(partition.day());
        }

        // Athena substitutes execution parameters verbatim, so strings carry their quotes.
        values.into_iter().map(|v| format!("'{v}'")).collect()
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryKind::Hourly => "hour",
            QueryKind::Daily => "day",
            QueryKind::Monthly => "month",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub kind: QueryKind,
    pub query: String,
    pub parameters: Vec<String>,
    pub database: String,
    pub catalog: String,
    pub output_location: String,
    pub encryption: EncryptionOption,
}

impl QueryRequest {
    pub fn new(kind: QueryKind, partition: &Partition, config: &Config) -> QueryRequest {
        QueryRequest {
            kind,
            query: kind.template().into(),
            parameters: kind.parameters(partition),
            database: config.database.clone(),
            catalog: config.catalog.clone(),
            output_location: config.results_location(),
            encryption: EncryptionOption::SseS3,
        }
    }
}

/// Hourly and daily always; monthly only on the last day of the month.
pub fn plan(partition: &Partition, config: &Config) -> Vec<QueryRequest> {
    let mut kinds = vec![QueryKind::Hourly, QueryKind::Daily];
    if partition.is_month_end() {
        kinds.push(QueryKind::Monthly);
    }

    kinds
        .into_iter()
        .map(|kind| QueryRequest::new(kind, partition, config))
        .collect()
}

pub trait QueryEngine {
    /// Starts a query and returns its execution id without waiting for it.
    fn start_query(
        &self,
        request: &QueryRequest,
    ) -> impl Future<Output = Result<String, BoxError>> + Send;
}

impl QueryEngine for athena::Client {
    async fn start_query(&self, request: &QueryRequest) -> Result<String, BoxError> {
        let context = QueryExecutionContext::builder()
            .database(&request.database)
            .catalog(&request.catalog)
            .build();

        let encryption = EncryptionConfiguration::builder()
            .encryption_option(request.encryption.clone())
            .build()?;

        let result = ResultConfiguration::builder()
            .output_location(&request.output_location)
            .encryption_configuration(encryption)
            .build();

        let out = self
            .start_query_execution()
            .query_string(&request.query)
            .set_execution_parameters(Some(request.parameters.clone()))
            .query_execution_context(context)
            .result_configuration(result)
            .send()
            .await
            .map_err(|e| e.into_service_error())?;

        out.query_execution_id()
            .map(str::to_owned)
            .ok_or_else(|| "Athena returned no query execution id".into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub kind: QueryKind,
    pub query_execution_id: String,
}

/// Optional manual override carried by the invocation payload.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    #[serde(default)]
    pub date_run: Option<String>,
}

impl DispatchRequest {
    /// The payload's run date when present, otherwise the configured one.
    pub fn run_date<'a>(&'a self, config: &'a Config) -> &'a str {
        self.date_run.as_deref().unwrap_or(config.date_run.as_str())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub year: String,
    pub month: String,
    pub day: String,
    pub executions: Vec<Execution>,
}

impl DispatchResponse {
    pub fn new(partition: &Partition, executions: Vec<Execution>) -> DispatchResponse {
        DispatchResponse {
            year: partition.year(),
            month: partition.month(),
            day: partition.day(),
            executions,
        }
    }
}

pub struct Dispatcher<'a, E> {
    engine: &'a E,
    config: &'a Config,
}

impl<'a, E: QueryEngine> Dispatcher<'a, E> {
    pub fn new(engine: &'a E, config: &'a Config) -> Dispatcher<'a, E> {
        Dispatcher { engine, config }
    }

    /// Submits the queries in order and stops at the first rejected one.
    /// Queries already started keep running.
    pub async fn run(&self, partition: &Partition) -> Result<Vec<Execution>, DispatchError> {
        let mut executions = Vec::new();

        for request in plan(partition, self.config) {
            let kind = request.kind;
            match self.engine.start_query(&request).await {
                Ok(query_execution_id) => {
                    tracing::info!(
                        "Total electricity metered by {} => query execution id: {}",
                        kind,
                        query_execution_id
                    );
                    executions.push(Execution {
                        kind,
                        query_execution_id,
                    });
                }
                Err(source) => {
                    tracing::error!(
                        "Total electricity metered by {} => error starting Athena query for {}: {}",
                        kind,
                        partition,
                        source
                    );
                    return Err(DispatchError::QuerySubmission { kind, source });
                }
            }
        }

        Ok(executions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeEngine {
        requests: Mutex<Vec<QueryRequest>>,
        fail_on: Option<QueryKind>,
    }

    impl FakeEngine {
        fn failing_on(kind: QueryKind) -> FakeEngine {
            FakeEngine {
                fail_on: Some(kind),
                ..Default::default()
            }
        }

        fn kinds(&self) -> Vec<QueryKind> {
            self.requests.lock().unwrap().iter().map(|r| r.kind).collect()
        }
    }

    impl QueryEngine for FakeEngine {
        async fn start_query(&self, request: &QueryRequest) -> Result<String, BoxError> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            if self.fail_on == Some(request.kind) {
                return Err("InvalidRequestException: query rejected".into());
            }
            Ok(format!("execution-{}", requests.len()))
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn config() -> Config {
        Config {
            date_run: AUTOMATIC_DATE.into(),
            output_location: "s3://athena-results/queries/".into(),
            database: DEFAULT_DATABASE.into(),
            catalog: DEFAULT_CATALOG.into(),
        }
    }

    fn parts(partition: &Partition) -> (String, String, String) {
        (partition.year(), partition.month(), partition.day())
    }

    #[test]
    fn automatic_date_resolves_to_yesterday() {
        let partition = Partition::resolve(AUTOMATIC_DATE, date(2024, 6, 15)).unwrap();
        assert_eq!(parts(&partition), ("2024".into(), "06".into(), "14".into()));

        let partition = Partition::resolve(AUTOMATIC_DATE, date(2024, 3, 1)).unwrap();
        assert_eq!(parts(&partition), ("2024".into(), "02".into(), "29".into()));

        let partition = Partition::resolve(AUTOMATIC_DATE, date(2024, 1, 1)).unwrap();
        assert_eq!(parts(&partition), ("2023".into(), "12".into(), "31".into()));
    }

    #[test]
    fn manual_date_is_used_as_is() {
        let partition = Partition::resolve("2024/01/05", date(2030, 1, 1)).unwrap();
        assert_eq!(parts(&partition), ("2024".into(), "01".into(), "05".into()));
        assert_eq!(partition.to_string(), "2024/01/05");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        for input in [
            "",
            "yesterday",
            "2024-01-05",
            "05/01/2024",
            "2024/13/01",
            "2023/02/29",
            "2024/01/05 ",
            "2024/01",
            "+2024/01/05",
            " 2024/01/05",
            "2024/ 1/05",
            "-0001/01/05",
            "+12024/01/31",
            "12024/01/31",
            "024/01/05",
            "2024/001/05",
            "2024/01/05/",
            "２０２４/01/05",
        ] {
            let err = Partition::resolve(input, date(2024, 6, 15)).unwrap_err();
            assert!(
                matches!(err, DispatchError::MalformedDateInput { input: ref got, .. } if got == input),
                "{input:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn month_end_follows_calendar() {
        assert!(Partition::new(date(2024, 2, 29)).is_month_end());
        assert!(!Partition::new(date(2024, 2, 28)).is_month_end());
        assert!(Partition::new(date(2023, 2, 28)).is_month_end());
        assert!(Partition::new(date(2024, 4, 30)).is_month_end());
        assert!(Partition::new(date(2024, 12, 31)).is_month_end());
        assert!(!Partition::new(date(2024, 1, 30)).is_month_end());

        assert_eq!(days_in_month(2000, 2), 29);
        assert_eq!(days_in_month(1900, 2), 28);
    }

    #[test]
    fn config_defaults_and_required_location() {
        let env = HashMap::from([("ATHENA_OUTPUT_LOCATION", "s3://results/athena")]);
        let config = Config::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.date_run, AUTOMATIC_DATE);
        assert_eq!(config.database, "iotanalyticsdb");
        assert_eq!(config.catalog, "AwsDataCatalog");
        assert_eq!(
            config.results_location(),
            "s3://results/athena/electricity_by_period/"
        );

        let err = Config::from_lookup(|_| None).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::MissingConfig("ATHENA_OUTPUT_LOCATION")
        ));
    }

    #[test]
    fn requests_carry_partition_as_parameters() {
        let config = config();
        let requests = plan(&Partition::new(date(2024, 1, 5)), &config);
        assert_eq!(requests.len(), 2);

        for request in &requests {
            assert_eq!(request.parameters, vec!["'2024'", "'01'", "'05'"]);
            assert_eq!(request.query.matches('?').count(), request.parameters.len());
            assert_eq!(request.database, "iotanalyticsdb");
            assert_eq!(request.catalog, "AwsDataCatalog");
            assert_eq!(
                request.output_location,
                "s3://athena-results/queries/electricity_by_period/"
            );
            assert_eq!(request.encryption, EncryptionOption::SseS3);
        }
        assert!(requests[0].query.contains("'T' || iot.hourcollected"));
        assert!(!requests[0].query.contains("GROUP BY"));
        assert!(requests[1].query.contains("ROUND(SUM(iot.kwh), 2)"));
    }

    #[test]
    fn monthly_request_has_no_day_filter() {
        let requests = plan(&Partition::new(date(2023, 2, 28)), &config());
        let monthly = requests.last().unwrap();

        assert_eq!(monthly.kind, QueryKind::Monthly);
        assert_eq!(monthly.parameters, vec!["'2023'", "'02'"]);
        assert_eq!(monthly.query.matches('?').count(), 2);
        assert!(!monthly.query.contains("iot.day ="));
    }

    #[tokio::test]
    async fn mid_month_submits_hourly_and_daily() {
        let engine = FakeEngine::default();
        let config = config();
        let executions = Dispatcher::new(&engine, &config)
            .run(&Partition::new(date(2024, 2, 28)))
            .await
            .unwrap();

        assert_eq!(engine.kinds(), vec![QueryKind::Hourly, QueryKind::Daily]);
        assert_eq!(
            executions,
            vec![
                Execution {
                    kind: QueryKind::Hourly,
                    query_execution_id: "execution-1".into()
                },
                Execution {
                    kind: QueryKind::Daily,
                    query_execution_id: "execution-2".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn month_end_also_submits_monthly() {
        let engine = FakeEngine::default();
        let config = config();
        let executions = Dispatcher::new(&engine, &config)
            .run(&Partition::new(date(2024, 2, 29)))
            .await
            .unwrap();

        assert_eq!(executions.len(), 3);
        assert_eq!(
            engine.kinds(),
            vec![QueryKind::Hourly, QueryKind::Daily, QueryKind::Monthly]
        );
    }

    #[tokio::test]
    async fn rejected_query_stops_remaining_submissions() {
        let engine = FakeEngine::failing_on(QueryKind::Daily);
        let config = config();
        let err = Dispatcher::new(&engine, &config)
            .run(&Partition::new(date(2024, 1, 31)))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::QuerySubmission {
                kind: QueryKind::Daily,
                ..
            }
        ));
        assert_eq!(engine.kinds(), vec![QueryKind::Hourly, QueryKind::Daily]);
    }

    #[test]
    fn scheduled_event_payload_has_no_override() {
        let scheduled = serde_json::json!({
            "version": "0",
            "id": "53dc4d37-cffa-4f76-80c9-8b7d4a4d2eaa",
            "detail-type": "Scheduled Event",
            "source": "aws.events",
            "time": "2024-01-01T03:30:00Z",
            "resources": ["arn:aws:events:sa-east-1:123456789012:rule/daily"],
            "detail": {}
        });
        let request: DispatchRequest = serde_json::from_value(scheduled).unwrap();
        assert_eq!(request.date_run, None);

        let manual = serde_json::json!({ "dateRun": "2024/01/31" });
        let request: DispatchRequest = serde_json::from_value(manual).unwrap();
        assert_eq!(request.date_run.as_deref(), Some("2024/01/31"));
    }

    #[test]
    fn payload_run_date_overrides_config() {
        let mut config = config();
        config.date_run = "2024/02/29".into();

        let manual = DispatchRequest {
            date_run: Some("2024/01/31".into()),
        };
        assert_eq!(manual.run_date(&config), "2024/01/31");

        let scheduled = DispatchRequest::default();
        assert_eq!(scheduled.run_date(&config), "2024/02/29");
    }

    #[test]
    fn single_digit_month_and_day_are_padded() {
        let partition = Partition::resolve("2024/1/5", date(2030, 1, 1)).unwrap();
        assert_eq!(parts(&partition), ("2024".into(), "01".into(), "05".into()));
    }

    #[test]
    fn response_serializes_partition_and_executions() {
        let response = DispatchResponse::new(
            &Partition::new(date(2024, 1, 5)),
            vec![Execution {
                kind: QueryKind::Hourly,
                query_execution_id: "abc".into(),
            }],
        );
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "year": "2024",
                "month": "01",
                "day": "05",
                "executions": [{ "kind": "hourly", "queryExecutionId": "abc" }]
            })
        );
    }
}
