//! Athena query of one date partition of the analytical table.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_athena::types::{QueryExecutionContext, QueryExecutionState, ResultConfiguration};
use chrono::NaiveDate;
use serde_json::Value;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use super::{Row, SourceError};
use crate::config::TableConfig;

/// A fully qualified table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Database (schema) name.
    pub database: String,
    /// Table name.
    pub table: String,
}

/// The single predicate the pipeline issues: partition column equals a date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPredicate {
    /// Partition column name.
    pub column: String,
    /// Target partition date.
    pub date: NaiveDate,
}

impl TableRef {
    /// Identifier of the unit produced by querying this table with `predicate`.
    pub fn unit_id(&self, predicate: &PartitionPredicate) -> String {
        format!(
            "{}.{}/{}={}",
            self.database,
            self.table,
            predicate.column,
            predicate.date.format("%Y-%m-%d")
        )
    }
}

/// Read-only query access to the analytical table.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TableEngine: Send + Sync {
    /// Return every row of `table` matching `predicate`.
    async fn query(
        &self,
        table: &TableRef,
        predicate: &PartitionPredicate,
    ) -> Result<Vec<Row>, SourceError>;
}

/// [`TableEngine`] backed by AWS Athena.
pub struct AthenaTableEngine {
    athena: aws_sdk_athena::Client,
    workgroup: String,
    output_location: Option<String>,
    poll_interval: Duration,
    query_timeout: Duration,
}

/// State of a started query as seen by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryState {
    Running,
    Succeeded,
    /// Failed or cancelled, with the reason Athena gave.
    Ended(String),
}

/// How waiting on a query ended when it did not fail outright.
#[derive(Debug, PartialEq, Eq)]
enum Wait {
    Done,
    TimedOut,
}

impl AthenaTableEngine {
    /// Wrap a configured Athena client.
    pub fn new(athena: aws_sdk_athena::Client, cfg: &TableConfig) -> Self {
        Self {
            athena,
            workgroup: cfg.workgroup.clone(),
            output_location: cfg.output_location.clone(),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            query_timeout: Duration::from_millis(cfg.query_timeout_ms),
        }
    }

    async fn poll_state(&self, execution_id: &str) -> Result<QueryState, SourceError> {
        let resp = self
            .athena
            .get_query_execution()
            .query_execution_id(execution_id)
            .send()
            .await
            .map_err(|e| {
                SourceError::Unavailable(format!(
                    "failed to poll athena query {execution_id}: {}",
                    e.into_service_error()
                ))
            })?;

        let status = resp.query_execution().and_then(|q| q.status());
        Ok(match status.and_then(|s| s.state()) {
            Some(QueryExecutionState::Succeeded) => QueryState::Succeeded,
            Some(state @ (QueryExecutionState::Failed | QueryExecutionState::Cancelled)) => {
                let reason = status
                    .and_then(|s| s.state_change_reason())
                    .unwrap_or("no reason given");
                QueryState::Ended(format!("{}: {reason}", state.as_str()))
            }
            _ => QueryState::Running,
        })
    }

    /// Ask Athena to stop a query we gave up on. Failure only costs Athena time.
    async fn stop_query(&self, execution_id: &str) {
        if let Err(e) = self
            .athena
            .stop_query_execution()
            .query_execution_id(execution_id)
            .send()
            .await
        {
            warn!(execution_id, error = %e.into_service_error(), "failed to stop athena query");
        }
    }

    async fn fetch_rows(&self, execution_id: &str) -> Result<Vec<Row>, SourceError> {
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .athena
                .get_query_results()
                .query_execution_id(execution_id)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| {
                    SourceError::Unavailable(format!(
                        "failed to fetch results of athena query {execution_id}: {}",
                        e.into_service_error()
                    ))
                })?;

            if let Some(result_set) = page.result_set() {
                for row in result_set.rows() {
                    let cells: Vec<Option<String>> = row
                        .data()
                        .iter()
                        .map(|d| d.var_char_value().map(str::to_owned))
                        .collect();
                    // The first row of a SELECT result is the header.
                    match &columns {
                        None => columns = Some(cells.into_iter().map(Option::unwrap_or_default).collect()),
                        Some(cols) => rows.push(row_from_cells(cols, cells)),
                    }
                }
            }

            match page.next_token() {
                Some(token) => next_token = Some(token.to_owned()),
                None => break,
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl TableEngine for AthenaTableEngine {
    async fn query(
        &self,
        table: &TableRef,
        predicate: &PartitionPredicate,
    ) -> Result<Vec<Row>, SourceError> {
        let sql = build_query(table, predicate);

        let mut request = self
            .athena
            .start_query_execution()
            .query_string(&sql)
            .query_execution_context(
                QueryExecutionContext::builder()
                    .database(&table.database)
                    .build(),
            )
            .work_group(&self.workgroup);
        if let Some(location) = &self.output_location {
            request = request.result_configuration(
                ResultConfiguration::builder()
                    .output_location(location)
                    .build(),
            );
        }

        let started = request.send().await.map_err(|e| {
            SourceError::Unavailable(format!(
                "failed to start athena query on {}.{}: {}",
                table.database,
                table.table,
                e.into_service_error()
            ))
        })?;
        let execution_id = started
            .query_execution_id()
            .ok_or_else(|| SourceError::Unavailable("athena returned no query execution id".into()))?
            .to_owned();

        info!(execution_id = %execution_id, table = %table.table, "athena query started");
        let id = execution_id.as_str();
        let waited = wait_until_done(
            move || self.poll_state(id),
            self.poll_interval,
            self.query_timeout,
        )
        .await?;
        if waited == Wait::TimedOut {
            self.stop_query(&execution_id).await;
            return Err(SourceError::Unavailable(format!(
                "athena query {execution_id} did not finish within {}s",
                self.query_timeout.as_secs()
            )));
        }
        let rows = self.fetch_rows(&execution_id).await?;
        info!(execution_id = %execution_id, rows = rows.len(), "athena query finished");
        Ok(rows)
    }
}

/// Poll until the query reaches a terminal state or `deadline` passes.
async fn wait_until_done<F, Fut>(
    mut poll: F,
    interval: Duration,
    deadline: Duration,
) -> Result<Wait, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<QueryState, SourceError>>,
{
    let polling = async {
        loop {
            match poll().await {
                Ok(QueryState::Succeeded) => return Ok(()),
                Ok(QueryState::Ended(reason)) => {
                    return Err(SourceError::Unavailable(format!("athena query ended {reason}")))
                }
                Ok(QueryState::Running) => {
                    debug!("athena query still running");
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    };
    match tokio::time::timeout(deadline, polling).await {
        Ok(Ok(())) => Ok(Wait::Done),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Wait::TimedOut),
    }
}

/// Build the partition query. Identifiers were validated at config load to
/// contain only `[A-Za-z0-9_]`, and the date is rendered by chrono.
pub fn build_query(table: &TableRef, predicate: &PartitionPredicate) -> String {
    format!(
        "SELECT * FROM \"{}\".\"{}\" WHERE \"{}\" = '{}'",
        table.database,
        table.table,
        predicate.column,
        predicate.date.format("%Y-%m-%d")
    )
}

/// Zip a result row with the header; absent cells become JSON null.
fn row_from_cells(columns: &[String], cells: Vec<Option<String>>) -> Row {
    columns
        .iter()
        .cloned()
        .zip(cells.into_iter().chain(std::iter::repeat(None)))
        .map(|(col, cell)| (col, cell.map_or(Value::Null, Value::String)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef {
            database: "analytics".into(),
            table: "customer_events".into(),
        }
    }

    fn predicate() -> PartitionPredicate {
        PartitionPredicate {
            column: "dt".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        }
    }

    #[test]
    fn query_filters_on_partition_date() {
        assert_eq!(
            build_query(&table(), &predicate()),
            r#"SELECT * FROM "analytics"."customer_events" WHERE "dt" = '2024-05-01'"#
        );
    }

    #[test]
    fn unit_id_names_table_and_partition() {
        assert_eq!(table().unit_id(&predicate()), "analytics.customer_events/dt=2024-05-01");
    }

    #[tokio::test(start_paused = true)]
    async fn running_query_is_polled_until_success() {
        let mut states = vec![QueryState::Running, QueryState::Running, QueryState::Succeeded].into_iter();
        let mut polls = 0;
        let waited = wait_until_done(
            || {
                polls += 1;
                let next = states.next().unwrap();
                async move { Ok(next) }
            },
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert_eq!(waited, Wait::Done);
        assert_eq!(polls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_query_times_out_at_deadline() {
        let started = tokio::time::Instant::now();
        let mut polls = 0;
        let waited = wait_until_done(
            || {
                polls += 1;
                async { Ok(QueryState::Running) }
            },
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(waited, Wait::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!((10..=11).contains(&polls), "{polls}");
    }

    #[tokio::test]
    async fn failed_query_is_unavailable() {
        let err = wait_until_done(
            || async { Ok(QueryState::Ended("FAILED: table not found".into())) },
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(ref m) if m.contains("table not found")));
    }

    #[test]
    fn cells_zip_with_header() {
        let cols = vec!["customer_id".to_string(), "ts".to_string(), "note".to_string()];
        let row = row_from_cells(&cols, vec![Some("A".into()), Some("1".into()), None]);
        assert_eq!(row["customer_id"], "A");
        assert_eq!(row["ts"], "1");
        assert!(row["note"].is_null());
    }

    #[test]
    fn short_rows_pad_with_null() {
        let cols = vec!["a".to_string(), "b".to_string()];
        let row = row_from_cells(&cols, vec![Some("x".into())]);
        assert_eq!(row.len(), 2);
        assert!(row["b"].is_null());
    }
}
