use std::fs::File;
use std::io::{self, BufWriter, Stdout, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use sentry_core::{LogConfig, LogFormat};

/// One line per completed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessLogRecord {
    pub timestamp: String,
    pub uuid: String,
    pub client_addr: String,
    pub method: String,
    pub url: String,
    pub response_code: u16,
    pub response_time_ms: u64,
}

impl AccessLogRecord {
    fn text_line(&self) -> String {
        format!(
            "[{}] {} {} {} {} {} {}ms",
            self.timestamp,
            self.uuid,
            self.client_addr,
            self.method,
            self.url,
            self.response_code,
            self.response_time_ms
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARNING",
            Self::Error => "ERROR",
        }
    }
}

/// Mediation warnings and errors, tagged with the request UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyLogRecord {
    pub timestamp: String,
    pub uuid: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyLogRecord {
    fn text_line(&self) -> String {
        match &self.error {
            Some(error) => format!(
                "[{}] {} {} {}: {}",
                self.timestamp,
                self.uuid,
                self.level.as_str(),
                self.message,
                error
            ),
            None => format!(
                "[{}] {} {} {}",
                self.timestamp,
                self.uuid,
                self.level.as_str(),
                self.message
            ),
        }
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

enum SinkTarget {
    Stdout(Stdout),
    File(BufWriter<File>),
    Memory(Arc<Mutex<Vec<String>>>),
}

/// Line-oriented sink shared by both logs: a file, stdout, or (in tests)
/// an in-memory buffer. Lines are flushed as they are written; write
/// failures are counted rather than propagated, so logging can never fail
/// a request.
pub struct LineSink {
    target: Mutex<SinkTarget>,
    write_errors: AtomicU64,
}

impl LineSink {
    pub fn from_config(config: &LogConfig) -> io::Result<Arc<Self>> {
        let target = match &config.file {
            Some(path) => SinkTarget::File(BufWriter::new(File::create(path)?)),
            None => SinkTarget::Stdout(io::stdout()),
        };
        Ok(Arc::new(Self {
            target: Mutex::new(target),
            write_errors: AtomicU64::new(0),
        }))
    }

    pub fn memory() -> (Arc<Self>, MemorySink) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::new(Self {
            target: Mutex::new(SinkTarget::Memory(Arc::clone(&lines))),
            write_errors: AtomicU64::new(0),
        });
        (sink, MemorySink { lines })
    }

    pub fn write_error_count(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    fn write_line(&self, line: &str) {
        let mut target = match self.target.lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let result = match &mut *target {
            SinkTarget::Stdout(stdout) => {
                let mut handle = stdout.lock();
                writeln!(handle, "{line}").and_then(|()| handle.flush())
            }
            SinkTarget::File(writer) => {
                writeln!(writer, "{line}").and_then(|()| writer.flush())
            }
            SinkTarget::Memory(lines) => {
                match lines.lock() {
                    Ok(mut lines) => {
                        lines.push(line.to_string());
                        Ok(())
                    }
                    Err(_) => Err(io::Error::other("memory sink poisoned")),
                }
            }
        };
        if result.is_err() {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Captured lines for assertions in tests.
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().expect("memory sink poisoned").clone()
    }
}

#[derive(Clone)]
pub struct AccessLog {
    sink: Arc<LineSink>,
    format: LogFormat,
}

impl AccessLog {
    pub fn new(sink: Arc<LineSink>, format: LogFormat) -> Self {
        Self { sink, format }
    }

    pub fn from_config(config: &LogConfig) -> io::Result<Self> {
        Ok(Self::new(LineSink::from_config(config)?, config.format))
    }

    pub fn log(&self, record: &AccessLogRecord) {
        let line = match self.format {
            LogFormat::Text => record.text_line(),
            LogFormat::Json => match serde_json::to_string(record) {
                Ok(line) => line,
                Err(_) => record.text_line(),
            },
        };
        self.sink.write_line(&line);
    }
}

#[derive(Clone)]
pub struct ProxyLog {
    sink: Arc<LineSink>,
    format: LogFormat,
}

impl ProxyLog {
    pub fn new(sink: Arc<LineSink>, format: LogFormat) -> Self {
        Self { sink, format }
    }

    pub fn from_config(config: &LogConfig) -> io::Result<Self> {
        Ok(Self::new(LineSink::from_config(config)?, config.format))
    }

    pub fn warn(&self, uuid: &str, message: &str, error: Option<&str>) {
        self.log_at(LogLevel::Warn, uuid, message, error);
    }

    pub fn error(&self, uuid: &str, message: &str, error: Option<&str>) {
        self.log_at(LogLevel::Error, uuid, message, error);
    }

    pub fn info(&self, uuid: &str, message: &str) {
        self.log_at(LogLevel::Info, uuid, message, None);
    }

    fn log_at(&self, level: LogLevel, uuid: &str, message: &str, error: Option<&str>) {
        let record = ProxyLogRecord {
            timestamp: now_rfc3339(),
            uuid: uuid.to_string(),
            level,
            message: message.to_string(),
            error: error.map(ToString::to_string),
        };
        let line = match self.format {
            LogFormat::Text => record.text_line(),
            LogFormat::Json => match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(_) => record.text_line(),
            },
        };
        self.sink.write_line(&line);
    }
}

#[cfg(test)]
mod tests {
    use sentry_core::LogFormat;

    use super::{AccessLog, AccessLogRecord, LineSink, ProxyLog};

    fn sample_record() -> AccessLogRecord {
        AccessLogRecord {
            timestamp: "2024-05-01T12:00:00Z".to_string(),
            uuid: "3e2c2f6e-8b3d-4c3e-9a51-2f6a8a7e9b10".to_string(),
            client_addr: "10.1.2.3:41234".to_string(),
            method: "GET".to_string(),
            url: "https://api.example.com/hook".to_string(),
            response_code: 200,
            response_time_ms: 42,
        }
    }

    #[test]
    fn access_text_format_matches_expected_shape() {
        let (sink, captured) = LineSink::memory();
        let log = AccessLog::new(sink, LogFormat::Text);
        log.log(&sample_record());

        let lines = captured.snapshot();
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "[2024-05-01T12:00:00Z] 3e2c2f6e-8b3d-4c3e-9a51-2f6a8a7e9b10 10.1.2.3:41234 GET https://api.example.com/hook 200 42ms"
        );
    }

    #[test]
    fn access_json_format_emits_one_object_per_line() {
        let (sink, captured) = LineSink::memory();
        let log = AccessLog::new(sink, LogFormat::Json);
        log.log(&sample_record());

        let lines = captured.snapshot();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&lines[0]).expect("valid json");
        assert_eq!(value["method"], "GET");
        assert_eq!(value["response_code"], 200);
        assert_eq!(value["url"], "https://api.example.com/hook");
    }

    #[test]
    fn proxy_log_includes_level_and_optional_error() {
        let (sink, captured) = LineSink::memory();
        let log = ProxyLog::new(sink, LogFormat::Text);
        log.warn("abc", "Response body exceeded maximum allowed length", None);
        log.error("abc", "Unexpected error while proxying request", Some("boom"));

        let lines = captured.snapshot();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("WARNING"));
        assert!(lines[0].ends_with("Response body exceeded maximum allowed length"));
        assert!(lines[1].contains("ERROR"));
        assert!(lines[1].ends_with("Unexpected error while proxying request: boom"));
    }
}
