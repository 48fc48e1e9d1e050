//! Slow query logging.
//!
//! [`QueryInterceptor`] wraps statement execution, measures it, and logs a
//! warning for anything slower than its threshold. The wrapped result is
//! returned untouched.

use crate::config::DEFAULT_SLOW_QUERY_MS;
use crate::db::params::QueryParam;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

/// What gets logged about a slow statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SlowQueryRecord {
    /// Query text with runs of whitespace collapsed to single spaces.
    pub query: String,
    pub args: String,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryInterceptor {
    threshold: Duration,
}

impl QueryInterceptor {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Run `statement`, logging it if it took longer than the threshold.
    pub async fn observe<T, E, F>(&self, query: &str, args: &[QueryParam], statement: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started_at = Instant::now();
        let result = statement.await;
        let duration = started_at.elapsed();

        let error = result.as_ref().err().map(ToString::to_string);
        if let Some(record) = self.inspect(query, args, duration, error) {
            warn!(
                query = %record.query,
                args = %record.args,
                duration_ms = record.duration.as_millis() as u64,
                error = record.error.as_deref(),
                "Slow SQL query"
            );
        }
        result
    }

    /// Build the slow-query record for a finished statement, if it was slow.
    pub fn inspect(
        &self,
        query: &str,
        args: &[QueryParam],
        duration: Duration,
        error: Option<String>,
    ) -> Option<SlowQueryRecord> {
        if duration <= self.threshold {
            return None;
        }
        Some(SlowQueryRecord {
            query: normalize_query(query),
            args: snapshot_args(args),
            duration,
            error,
        })
    }
}

impl Default for QueryInterceptor {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SLOW_QUERY_MS))
    }
}

pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn snapshot_args(args: &[QueryParam]) -> String {
    let rendered: Vec<String> = args.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    /// Log sink shared between the subscriber and the test.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_normalize_query() {
        let sql = "\n\t\tSELECT id, typeId\n\t\tFROM objectType\n\t\tWHERE\n\t\t\tdeletedAt IS NULL\n\t";
        assert_eq!(
            normalize_query(sql),
            "SELECT id, typeId FROM objectType WHERE deletedAt IS NULL"
        );
    }

    #[test]
    fn test_fast_statement_is_not_recorded() {
        let interceptor = QueryInterceptor::default();
        assert!(
            interceptor
                .inspect("SELECT 1", &[], Duration::from_millis(50), None)
                .is_none()
        );
    }

    #[test]
    fn test_slow_statement_is_recorded() {
        let interceptor = QueryInterceptor::default();
        let record = interceptor
            .inspect(
                "SELECT *\n  FROM t WHERE id = ?",
                &[QueryParam::Int(7), QueryParam::from("x")],
                Duration::from_millis(51),
                Some("boom".to_string()),
            )
            .unwrap();
        assert_eq!(record.query, "SELECT * FROM t WHERE id = ?");
        assert_eq!(record.args, "[7, \"x\"]");
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_observe_returns_result_unchanged() {
        let interceptor = QueryInterceptor::new(Duration::ZERO);
        let ok: Result<u32, String> = interceptor.observe("SELECT 1", &[], async { Ok(1) }).await;
        assert_eq!(ok, Ok(1));

        let err: Result<u32, String> = interceptor
            .observe("SELECT 1", &[], async { Err("failed".to_string()) })
            .await;
        assert_eq!(err, Err("failed".to_string()));
    }

    #[tokio::test]
    async fn test_observe_logs_slow_statement() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let fast = QueryInterceptor::new(Duration::from_secs(60));
        let _: Result<(), String> = fast.observe("SELECT 1", &[], async { Ok(()) }).await;
        assert!(logs.contents().is_empty());

        let interceptor = QueryInterceptor::new(Duration::from_millis(5));
        let result: Result<(), String> = interceptor
            .observe(
                "SELECT *\n  FROM t WHERE id = ?",
                &[QueryParam::Int(7)],
                async {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err("boom".to_string())
                },
            )
            .await;
        assert_eq!(result, Err("boom".to_string()));

        let output = logs.contents();
        assert!(output.contains("WARN"), "{output}");
        assert!(output.contains("Slow SQL query"), "{output}");
        assert!(output.contains("SELECT * FROM t WHERE id = ?"), "{output}");
        assert!(output.contains("[7]"), "{output}");
        assert!(output.contains("boom"), "{output}");
        assert!(output.contains("duration_ms="), "{output}");
    }
}
