//! Request/response value types crossing the host boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// An HTTP-like request handed to a worker.
#[derive(Debug, Clone, Serialize)]
pub struct HostRequest {
    pub url: String,
    pub method: String,
    /// Header keys are lower-cased before crossing into JS.
    pub headers: HashMap<String, String>,
    /// UTF-8 body, if any. Binary bodies lose their distinction here; this
    /// is a documented limitation of the string marshalling path.
    pub body: Option<String>,
}

impl HostRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            body: Some(body.into()),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    /// Normalized copy: method upper-cased, header keys lower-cased.
    pub(crate) fn normalized(&self) -> Self {
        Self {
            url: self.url.clone(),
            method: self.method.to_uppercase(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            body: self.body.clone(),
        }
    }
}

/// The response a worker produced.
#[derive(Debug, Clone)]
pub struct HostResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Set when the JS response carried a non-null `webSocket` (101 upgrade).
    pub has_web_socket: bool,
}

impl HostResponse {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(level: &str) -> Self {
        match level {
            "info" => Self::Info,
            "debug" => Self::Debug,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Log,
        }
    }
}

/// One captured console entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub time: u64,
}

/// Everything one execution produced.
#[derive(Debug)]
pub struct WorkerResult {
    pub response: Option<HostResponse>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub duration: Duration,
}

impl WorkerResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.response.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_normalization() {
        let mut request = HostRequest::get("http://h/");
        request.method = "post".into();
        request.headers.insert("X-Thing".into(), "1".into());
        let normalized = request.normalized();
        assert_eq!(normalized.method, "POST");
        assert_eq!(normalized.headers.get("x-thing").map(String::as_str), Some("1"));
    }

    #[test]
    fn log_level_parse() {
        assert_eq!(LogLevel::parse("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("nope"), LogLevel::Log);
    }
}
