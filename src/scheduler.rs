// Scheduler module - the daily trigger and the driver loop
//
// The loop re-checks the wall clock on a short fixed interval. When the
// configured hour and minute arrive it walks the metric catalog in order:
// fetch -> extract -> normalize -> write, one metric at a time.
//
// # Failure handling
// - A metric that cannot be fetched, has no data, or cannot be placed in the
//   sheet is logged and skipped; the rest of the catalog still runs
// - Unusable spreadsheet credentials stop the loop and are returned to main
//
// The trigger remembers the date it last fired on, so a run that finishes
// inside the trigger minute does not start a second run for the same day.

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MetricCatalog;
use crate::metrics::{collect_metric, CollectError, MetricDefinition, MetricSource};
use crate::sheet::{date_label, SheetError, SheetWriter};

/// Time-of-day check: due exactly when hour and minute both match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleGate {
    hour: u32,
    minute: u32,
}

impl ScheduleGate {
    pub fn new(hour: u32, minute: u32) -> Self {
        ScheduleGate { hour, minute }
    }

    pub fn is_due<T: Timelike>(&self, now: &T) -> bool {
        now.hour() == self.hour && now.minute() == self.minute
    }
}

/// Fires at most once per calendar day, when the gate is due
#[derive(Debug, Clone)]
pub struct DailyTrigger {
    gate: ScheduleGate,
    last_fired: Option<NaiveDate>,
}

impl DailyTrigger {
    pub fn new(gate: ScheduleGate) -> Self {
        DailyTrigger {
            gate,
            last_fired: None,
        }
    }

    /// Returns true if a run should start now, and records that it did
    pub fn poll(&mut self, now: NaiveDateTime) -> bool {
        let today = now.date();
        if !self.gate.is_due(&now) || self.last_fired == Some(today) {
            return false;
        }
        self.last_fired = Some(today);
        true
    }
}

/// Why a single metric was not written
#[derive(Error, Debug)]
pub enum MetricFailure {
    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Sheet(#[from] SheetError),
}

/// Outcome of one pass over the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Date column targeted by this run (MM/DD/YYYY)
    pub date: String,
    pub written: usize,
    pub skipped: usize,
}

/// Driver loop for the daily export
///
/// All collaborators are injected, so the scheduler can run against an
/// in-memory source and worksheet.
pub struct MetricScheduler {
    catalog: Arc<MetricCatalog>,
    source: Arc<dyn MetricSource>,
    writer: SheetWriter,
    trigger: DailyTrigger,
    poll_interval: Duration,
}

impl MetricScheduler {
    /// Creates a new MetricScheduler instance
    ///
    /// # Arguments
    /// * `catalog` - ordered metric definitions
    /// * `source` - where raw metric responses come from
    /// * `writer` - spreadsheet writer
    /// * `gate` - configured execution time
    /// * `poll_interval` - how often the gate is re-checked
    pub fn new(
        catalog: MetricCatalog,
        source: Arc<dyn MetricSource>,
        writer: SheetWriter,
        gate: ScheduleGate,
        poll_interval: Duration,
    ) -> Self {
        MetricScheduler {
            catalog: Arc::new(catalog),
            source,
            writer,
            trigger: DailyTrigger::new(gate),
            poll_interval,
        }
    }

    /// Runs the schedule loop
    ///
    /// Never returns in normal operation. Returns `Err` only for a fatal
    /// spreadsheet error, after which the process is expected to stop.
    pub async fn start(mut self) -> Result<(), SheetError> {
        info!(
            "Waiting for daily trigger at {:02}:{:02} (checking every {}s, {} metric(s))",
            self.trigger.gate.hour,
            self.trigger.gate.minute,
            self.poll_interval.as_secs(),
            self.catalog.len()
        );

        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            // Local wall clock, like the configured execution time
            let now = Local::now().naive_local();
            if self.trigger.poll(now) {
                info!("Daily trigger fired at {}", now.format("%H:%M:%S"));
                self.run_once(now.date()).await?;
            }
        }
    }

    /// Processes every catalog entry once, writing into `date`'s column
    ///
    /// The date is fixed for the whole run so a run crossing midnight still
    /// writes every metric to the same column.
    ///
    /// # Returns
    /// * `Ok(RunSummary)` - every metric was attempted
    /// * `Err(SheetError)` - a fatal error stopped the run early
    pub async fn run_once(&self, date: NaiveDate) -> Result<RunSummary, SheetError> {
        let date = date_label(date);
        let mut summary = RunSummary {
            date: date.clone(),
            written: 0,
            skipped: 0,
        };

        // Strictly sequential, in catalog order
        for definition in self.catalog.iter() {
            match self.process_metric(definition, &date).await {
                Ok(()) => summary.written += 1,
                // Unusable credentials or a missing worksheet end the run
                Err(MetricFailure::Sheet(e)) if e.is_fatal() => {
                    error!("Aborting run at metric '{}': {}", definition.sheet_label, e);
                    return Err(e);
                }
                Err(MetricFailure::Collect(e)) => {
                    warn!("No value for metric '{}': {}", definition.sheet_label, e);
                    summary.skipped += 1;
                }
                Err(MetricFailure::Sheet(e)) => {
                    error!("Failed to update metric '{}': {}", definition.sheet_label, e);
                    summary.skipped += 1;
                }
            }
        }

        info!(
            "Metrics written to the sheet for {}: {} written, {} skipped",
            summary.date, summary.written, summary.skipped
        );

        Ok(summary)
    }

    /// Collects one metric and writes it into the sheet
    ///
    /// # Arguments
    /// * `definition` - catalog entry to process
    /// * `date` - column label for this run, MM/DD/YYYY
    ///
    /// # Returns
    /// * `Ok(())` - the value was written
    /// * `Err(MetricFailure::Collect)` - no value, the sheet was not touched
    /// * `Err(MetricFailure::Sheet)` - a value was computed but could not be written
    async fn process_metric(
        &self,
        definition: &MetricDefinition,
        date: &str,
    ) -> Result<(), MetricFailure> {
        // Fetch -> extract -> normalize
        let value = collect_metric(self.source.as_ref(), definition).await?;
        info!("{}: {}", definition.display_label, value);

        // Row by sheet label, column by date

        let cell = self
            .writer
            .write_metric(&definition.sheet_label, date, value)
            .await?;
        debug!("'{}' stored at {}", definition.sheet_label, cell);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeWindow;
    use crate::logging::testing::Captured;
    use crate::metrics::{ApiClient, EntityScope, FetchError};
    use crate::sheet::testing::MemoryWorksheet;
    use crate::sheet::CellRef;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned responses per selector and records every request
    #[derive(Default)]
    struct FakeSource {
        responses: HashMap<String, Value>,
        requests: Mutex<Vec<(String, EntityScope)>>,
    }

    impl FakeSource {
        fn with(mut self, selector: &str, response: Value) -> Self {
            self.responses.insert(selector.to_string(), response);
            self
        }
    }

    #[async_trait]
    impl MetricSource for FakeSource {
        async fn fetch(&self, selector: &str, entity: &EntityScope) -> Result<Value, FetchError> {
            self.requests
                .lock()
                .unwrap()
                .push((selector.to_string(), entity.clone()));

            self.responses.get(selector).cloned().ok_or(FetchError::Status {
                status: reqwest::StatusCode::BAD_GATEWAY,
                body: "upstream unavailable".to_string(),
            })
        }
    }

    fn definition(label: &str, selector: &str, entity: &str) -> MetricDefinition {
        MetricDefinition {
            sheet_label: label.to_string(),
            selector: selector.to_string(),
            entity: EntityScope::parse(entity),
            display_label: label.to_string(),
        }
    }

    fn catalog() -> MetricCatalog {
        MetricCatalog::from_definitions(vec![
            definition("Response time", "builtin:service.responsetime", "empty"),
            definition("Users", "uacm.users", "HOST-123"),
        ])
        .unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    fn at(date: NaiveDate, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        date.and_hms_opt(hour, minute, second).unwrap()
    }

    fn scheduler(source: Arc<dyn MetricSource>, sheet: Arc<MemoryWorksheet>) -> MetricScheduler {
        MetricScheduler::new(
            catalog(),
            source,
            SheetWriter::new(sheet),
            ScheduleGate::new(23, 0),
            Duration::from_secs(10),
        )
    }

    fn dated_sheet() -> Arc<MemoryWorksheet> {
        Arc::new(MemoryWorksheet::new(&[
            &["Metric", "03/06/2024", "03/07/2024"],
            &["Response time", "", ""],
            &["Users", "", ""],
        ]))
    }

    #[test]
    fn test_gate_matches_exact_minute() {
        let gate = ScheduleGate::new(23, 0);

        assert!(gate.is_due(&at(day(), 23, 0, 0)));
        assert!(gate.is_due(&at(day(), 23, 0, 59)));
        assert!(!gate.is_due(&at(day(), 22, 59, 59)));
        assert!(!gate.is_due(&at(day(), 23, 1, 0)));
        assert!(!gate.is_due(&at(day(), 22, 0, 0)));
        assert!(!gate.is_due(&at(day(), 0, 0, 0)));
    }

    #[test]
    fn test_trigger_fires_once_per_day() {
        let mut trigger = DailyTrigger::new(ScheduleGate::new(23, 0));

        assert!(!trigger.poll(at(day(), 22, 59, 55)));
        assert!(trigger.poll(at(day(), 23, 0, 5)));
        // A run finishing inside the same minute must not re-fire
        assert!(!trigger.poll(at(day(), 23, 0, 15)));
        assert!(!trigger.poll(at(day(), 23, 0, 55)));

        let next_day = day().succ_opt().unwrap();
        assert!(!trigger.poll(at(next_day, 22, 59, 59)));
        assert!(trigger.poll(at(next_day, 23, 0, 0)));
    }

    #[tokio::test]
    async fn test_run_writes_normalized_values() {
        let source = Arc::new(
            FakeSource::default()
                .with(
                    "builtin:service.responsetime",
                    json!({"result": [{"values": [[10, 20, null]]}]}),
                )
                .with("uacm.users", json!({"values": [[5, 5]]})),
        );
        let sheet = dated_sheet();

        let summary = scheduler(source.clone(), sheet.clone())
            .run_once(day())
            .await
            .unwrap();

        assert_eq!(summary.written, 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.date, "03/07/2024");

        let updates = sheet.updates.lock().unwrap().clone();
        assert_eq!(updates[0].0, CellRef::new(2, 3));
        assert!((updates[0].1 - 0.000015).abs() < 1e-12);
        assert_eq!(updates[1].0, CellRef::new(3, 3));
        assert!((updates[1].1 - 0.005).abs() < 1e-12);

        let requests = source.requests.lock().unwrap().clone();
        assert_eq!(requests[0], ("builtin:service.responsetime".to_string(), EntityScope::All));
        assert_eq!(
            requests[1],
            ("uacm.users".to_string(), EntityScope::Entity("HOST-123".to_string()))
        );
    }

    #[tokio::test]
    async fn test_missing_date_column_skips_every_metric() {
        let source = Arc::new(
            FakeSource::default()
                .with("builtin:service.responsetime", json!({"values": [1]}))
                .with("uacm.users", json!({"values": [2]})),
        );
        let sheet = Arc::new(MemoryWorksheet::new(&[
            &["Metric", "03/05/2024", "03/06/2024"],
            &["Response time", "", ""],
            &["Users", "", ""],
        ]));

        // Current-thread test runtime, so the thread-local subscriber sees every event
        let captured = Captured::default();
        let _guard = tracing::subscriber::set_default(captured.subscriber());

        let summary = scheduler(source.clone(), sheet.clone())
            .run_once(day())
            .await
            .unwrap();

        assert_eq!(summary.written, 0);
        assert_eq!(summary.skipped, 2);
        assert!(sheet.updates.lock().unwrap().is_empty());
        assert_eq!(source.requests.lock().unwrap().len(), 2);

        // One logged failure per attempted metric
        let log = captured.contents();
        let failures: Vec<&str> = log
            .lines()
            .filter(|line| line.contains(" - ERROR - Failed to update metric"))
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("'Response time'") && failures[0].contains("03/07/2024"));
        assert!(failures[1].contains("'Users'") && failures[1].contains("03/07/2024"));
        assert!(log.contains("0 written, 2 skipped"));
    }

    #[tokio::test]
    async fn test_failed_fetch_does_not_stop_run() {
        // Only the second selector has a response
        let source = Arc::new(FakeSource::default().with("uacm.users", json!({"values": [[5, 5]]})));
        let sheet = dated_sheet();

        let summary = scheduler(source, sheet.clone()).run_once(day()).await.unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(sheet.cell(CellRef::new(2, 3)).as_deref(), Some(""));
        assert_eq!(sheet.updates.lock().unwrap()[0].0, CellRef::new(3, 3));
    }

    #[tokio::test]
    async fn test_unreachable_api_skips_all_metrics() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = ApiClient::new(
            &format!("http://127.0.0.1:{}/api/v2/metrics/query", port),
            "token",
            TimeWindow::default(),
            Duration::from_secs(2),
        )
        .unwrap();
        let sheet = dated_sheet();

        let summary = scheduler(Arc::new(client), sheet.clone())
            .run_once(day())
            .await
            .unwrap();

        assert_eq!(summary.written, 0);
        assert_eq!(summary.skipped, 2);
        assert!(sheet.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_null_values_are_not_written() {
        let source = Arc::new(
            FakeSource::default()
                .with("builtin:service.responsetime", json!({"values": [null, null]}))
                .with("uacm.users", json!({"result": []})),
        );
        let sheet = dated_sheet();

        let summary = scheduler(source, sheet.clone()).run_once(day()).await.unwrap();

        assert_eq!(summary.skipped, 2);
        assert!(sheet.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_credentials_abort_run() {
        let source = Arc::new(
            FakeSource::default()
                .with("builtin:service.responsetime", json!({"values": [1]}))
                .with("uacm.users", json!({"values": [2]})),
        );
        let sheet = dated_sheet();
        *sheet.fail_with.lock().unwrap() = Some(|| SheetError::Auth("invalid_grant".to_string()));

        let err = scheduler(source.clone(), sheet)
            .run_once(day())
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        // The second metric is never attempted
        assert_eq!(source.requests.lock().unwrap().len(), 1);
    }
}
