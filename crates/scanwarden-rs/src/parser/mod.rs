use std::{io, mem};

use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{trace, warn};

use crate::models::{NewFinding, Severity};

const UNKNOWN_TITLE: &str = "Unknown Finding";

/// One line of nuclei `-jsonl` output. Every field is optional and a field of the wrong
/// type reads as absent; the scanner's schema drifts between releases and a record missing
/// most of it still counts.
#[derive(Debug, Default, Deserialize)]
pub struct NucleiRecord {
    #[serde(default, deserialize_with = "lenient")]
    info: NucleiInfo,
    #[serde(rename = "template-id", default, deserialize_with = "lenient")]
    template_id: Option<String>,
    #[serde(rename = "template_id", default, deserialize_with = "lenient")]
    template_id_snake: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    host: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    path: Option<String>,
    #[serde(rename = "matched-at", default, deserialize_with = "lenient")]
    matched_at: Option<String>,
    #[serde(rename = "matched_at", default, deserialize_with = "lenient")]
    matched_at_snake: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    matched: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NucleiInfo {
    #[serde(default, deserialize_with = "lenient")]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    severity: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    description: Option<String>,
}

/// Any JSON value is accepted; one that does not fit `T` becomes `T::default()`.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

impl NucleiRecord {
    /// Interprets one output line. Returns `None` for anything that is not a JSON object,
    /// which covers container runtime chatter sharing the stream.
    pub fn from_line(line: &[u8]) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_slice(line).ok()?;
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    pub fn into_finding(self, job_target: &str, evidence_ref: String) -> NewFinding {
        let title = non_empty(self.info.name)
            .or_else(|| non_empty(self.info.id))
            .or_else(|| non_empty(self.template_id))
            .or_else(|| non_empty(self.template_id_snake))
            .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

        let severity = self
            .info
            .severity
            .as_deref()
            .map(Severity::normalize)
            .unwrap_or(Severity::Info);

        let description = non_empty(self.info.description)
            .or_else(|| non_empty(self.matched_at))
            .or_else(|| non_empty(self.matched_at_snake))
            .or_else(|| non_empty(self.matched))
            .unwrap_or_default();

        let resource = match non_empty(self.host) {
            Some(host) => format!("{host}{}", self.path.unwrap_or_default()),
            None => job_target.to_string(),
        };

        NewFinding {
            title,
            severity,
            description,
            resource,
            evidence_ref,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Splits a byte stream into newline-terminated lines without ever holding more than one
/// partial line. Lines longer than `max_line` are dropped whole.
pub struct LineReader<R> {
    inner: BufReader<R>,
    partial: Vec<u8>,
    max_line: usize,
    discarding: bool,
    dropped: u64,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self::with_reader(BufReader::new(inner), max_line)
    }

    pub fn with_reader(inner: BufReader<R>, max_line: usize) -> Self {
        Self {
            inner,
            partial: Vec::new(),
            max_line,
            discarding: false,
            dropped: 0,
        }
    }

    /// Number of overlong lines discarded so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next complete line without its terminator, or `None` at end of stream. A final
    /// unterminated line is still returned.
    pub async fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                if self.discarding {
                    self.discarding = false;
                    self.partial.clear();
                    self.note_dropped();
                }
                if self.partial.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(finish_line(mem::take(&mut self.partial))));
            }

            match available.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let fits = self.partial.len() + idx <= self.max_line;
                    if !self.discarding && fits {
                        self.partial.extend_from_slice(&available[..idx]);
                    }
                    self.inner.consume(idx + 1);

                    if self.discarding || !fits {
                        self.discarding = false;
                        self.partial.clear();
                        self.note_dropped();
                        continue;
                    }
                    return Ok(Some(finish_line(mem::take(&mut self.partial))));
                }
                None => {
                    let len = available.len();
                    if !self.discarding {
                        if self.partial.len() + len > self.max_line {
                            self.discarding = true;
                            self.partial = Vec::new();
                        } else {
                            self.partial.extend_from_slice(available);
                        }
                    }
                    self.inner.consume(len);
                }
            }
        }
    }

    fn note_dropped(&mut self) {
        self.dropped += 1;
        warn!(max_line = self.max_line, "discarded overlong output line");
    }
}

fn finish_line(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

/// A valid record together with the exact bytes it was parsed from.
#[derive(Debug)]
pub struct RawRecord {
    pub raw: Vec<u8>,
    pub record: NucleiRecord,
}

/// Record-level view over scanner output: blank and malformed lines are skipped.
pub struct RecordStream<R> {
    lines: LineReader<R>,
    skipped: u64,
}

impl<R: AsyncRead + Unpin> RecordStream<R> {
    pub fn new(inner: R, max_line: usize) -> Self {
        Self::from_lines(LineReader::new(inner, max_line))
    }

    pub fn from_lines(lines: LineReader<R>) -> Self {
        Self { lines, skipped: 0 }
    }

    pub async fn next_record(&mut self) -> io::Result<Option<RawRecord>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match NucleiRecord::from_line(&line) {
                Some(record) => return Ok(Some(RawRecord { raw: line, record })),
                None => {
                    self.skipped += 1;
                    trace!(line = %String::from_utf8_lossy(&line), "skipping non-record output");
                }
            }
        }
        Ok(None)
    }

    /// Lines that were neither records nor blank, including overlong ones.
    pub fn skipped(&self) -> u64 {
        self.skipped + self.lines.dropped()
    }
}
