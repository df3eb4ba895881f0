//! Durable ledger of sends that could not be delivered.
//!
//! Every failed send becomes one line of a plain text file:
//!
//! ```text
//! 2026-10-16T09:30:01.123Z ERROR orders {"connectionName":"orders","message":{..},"configuration":{..}}
//! ```
//!
//! Lines are appended in time order and removed (in any order) by rewriting
//! the file without them once their resend succeeded. Appends and compactions
//! share one lock, so an append issued while a compaction runs waits for the
//! replacement file and lands in it.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use courier_models::core::{FailureLogSettings, Properties};
use futures::{future, stream, stream::BoxStream, StreamExt};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines},
    sync::Mutex,
};
use uuid::Uuid;

use crate::FailureLogError;

pub type EntryStream = BoxStream<'static, Result<FailureEntry, FailureLogError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "DEBUG" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "WARN" => Ok(Severity::Warn),
            "ERROR" => Ok(Severity::Error),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// One failed send, with everything needed to try it again.
///
/// Two entries are the same entry when every field is equal; the log has no
/// other notion of identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub connection_name: String,
    pub message: Properties,
    pub configuration: Properties,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadRef<'a> {
    connection_name: &'a str,
    message: &'a Properties,
    configuration: &'a Properties,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    connection_name: String,
    #[serde(default)]
    message: Properties,
    #[serde(default)]
    configuration: Properties,
}

impl FailureEntry {
    /// Stamp a new entry with the current time, truncated to the millisecond
    /// precision the line format keeps.
    pub fn new(
        severity: Severity,
        connection_name: &str,
        message: Properties,
        configuration: Properties,
    ) -> Self {
        Self {
            timestamp: Utc::now().trunc_subsecs(3),
            severity,
            connection_name: connection_name.to_string(),
            message,
            configuration,
        }
    }

    pub fn to_line(&self) -> Result<String, FailureLogError> {
        let payload = serde_json::to_string(&PayloadRef {
            connection_name: &self.connection_name,
            message: &self.message,
            configuration: &self.configuration,
        })?;
        Ok(format!(
            "{} {} {} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.severity,
            self.connection_name,
            payload
        ))
    }

    pub fn parse_line(line: &str) -> Result<Self, String> {
        let mut parts = line.splitn(4, ' ');
        let (Some(timestamp), Some(severity), Some(connection_name), Some(payload)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err("expected '<timestamp> <severity> <connection> <json>'".to_string());
        };

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|err| format!("bad timestamp '{timestamp}': {err}"))?
            .with_timezone(&Utc);
        let severity = severity.parse::<Severity>()?;
        let payload: Payload =
            serde_json::from_str(payload).map_err(|err| format!("bad entry JSON: {err}"))?;
        if payload.connection_name != connection_name {
            return Err(format!(
                "connection '{}' in entry does not match line prefix '{}'",
                payload.connection_name, connection_name
            ));
        }

        Ok(Self {
            timestamp,
            severity,
            connection_name: payload.connection_name,
            message: payload.message,
            configuration: payload.configuration,
        })
    }
}

/// File-backed failure ledger with a live entry counter.
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    threshold: u64,
    live: AtomicU64,
    /// Serializes appends and compactions against the file.
    lock: Mutex<()>,
}

impl FailureLog {
    pub async fn open(settings: &FailureLogSettings, threshold: u64) -> Result<Self, FailureLogError> {
        Self::open_at(settings.path(), threshold).await
    }

    /// Open or create the log at `path` and count the entries already in it.
    pub async fn open_at(path: impl AsRef<Path>, threshold: u64) -> Result<Self, FailureLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let existing = count_lines(&path).await?;
        if existing > 0 {
            info!(
                "Failure log {} holds {} pending entr{}",
                path.display(),
                existing,
                if existing == 1 { "y" } else { "ies" }
            );
        }

        Ok(Self {
            path,
            threshold,
            live: AtomicU64::new(existing),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of entries currently in the file.
    pub fn len(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// True once more entries are pending than the configured threshold.
    pub fn is_at_threshold(&self) -> bool {
        self.len() > self.threshold
    }

    pub async fn append(&self, entry: &FailureEntry) -> Result<(), FailureLogError> {
        let mut line = entry.to_line()?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Build an entry stamped now and append it.
    pub async fn record(
        &self,
        severity: Severity,
        connection_name: &str,
        message: Properties,
        configuration: Properties,
    ) -> Result<FailureEntry, FailureLogError> {
        let entry = FailureEntry::new(severity, connection_name, message, configuration);
        self.append(&entry).await?;
        Ok(entry)
    }

    /// Lazily read every entry from the start of the file.
    ///
    /// Each call opens the file afresh. Unparseable lines come through as
    /// [`FailureLogError::Corrupt`] items and the stream continues past them.
    pub async fn stream_all(&self) -> Result<EntryStream, FailureLogError> {
        let file = File::open(&self.path).await?;
        let lines = BufReader::new(file).lines();
        Ok(stream::unfold((Some(lines), 0usize), next_entry).boxed())
    }

    /// Like [`stream_all`](Self::stream_all), keeping only entries for `connection_name`.
    pub async fn stream_for(&self, connection_name: &str) -> Result<EntryStream, FailureLogError> {
        let connection_name = connection_name.to_string();
        Ok(self
            .stream_all()
            .await?
            .filter(move |item| {
                future::ready(match item {
                    Ok(entry) => entry.connection_name == connection_name,
                    Err(_) => true,
                })
            })
            .boxed())
    }

    /// All readable entries, in file order. Corrupt lines are logged and skipped.
    pub async fn entries(&self) -> Result<Vec<FailureEntry>, FailureLogError> {
        collect_readable(&self.path, self.stream_all().await?).await
    }

    pub async fn entries_for(&self, connection_name: &str) -> Result<Vec<FailureEntry>, FailureLogError> {
        collect_readable(&self.path, self.stream_for(connection_name).await?).await
    }

    /// The connection's entries split into consecutive batches of at most `batch_size`.
    pub async fn batches_for(
        &self,
        connection_name: &str,
        batch_size: usize,
    ) -> Result<Vec<Vec<FailureEntry>>, FailureLogError> {
        let entries = self.entries_for(connection_name).await?;
        Ok(entries
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect())
    }

    pub async fn remove(&self, entry: &FailureEntry) -> Result<usize, FailureLogError> {
        self.remove_batch(std::slice::from_ref(entry)).await
    }

    /// Rewrite the log without any line equal to one of `entries`.
    ///
    /// Survivors keep their order. The new content is written to a sibling
    /// temporary file and renamed over the log only once complete, so a failure
    /// part way leaves the log untouched. Returns the number of lines
    /// dropped.
    pub async fn remove_batch(&self, entries: &[FailureEntry]) -> Result<usize, FailureLogError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;
        let temp_path = self.temp_path();
        match self.rewrite_without(entries, &temp_path).await {
            Ok((removed, kept)) => {
                self.live.store(kept, Ordering::SeqCst);
                Ok(removed)
            }
            Err(err) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "Unable to remove compaction file {}: {}",
                            temp_path.display(),
                            cleanup
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn rewrite_without(
        &self,
        entries: &[FailureEntry],
        temp_path: &Path,
    ) -> Result<(usize, u64), FailureLogError> {
        let source = File::open(&self.path).await?;
        let mut lines = BufReader::new(source).lines();
        let target = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .await?;
        let mut writer = BufWriter::new(target);

        let mut removed = 0usize;
        let mut kept = 0u64;
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match FailureEntry::parse_line(&line) {
                Ok(entry) if entries.contains(&entry) => {
                    removed += 1;
                    continue;
                }
                Ok(_) => {}
                Err(reason) => warn!(
                    "Keeping unreadable line {} of {}: {}",
                    line_no,
                    self.path.display(),
                    reason
                ),
            }
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            kept += 1;
        }

        if removed == 0 {
            drop(writer);
            fs::remove_file(temp_path).await?;
            return Ok((0, kept));
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);
        fs::rename(temp_path, &self.path).await?;
        Ok((removed, kept))
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "failures.log".to_string());
        self.path
            .with_file_name(format!(".{}.{}.compact", file_name, Uuid::new_v4().simple()))
    }
}

type LineState = (Option<Lines<BufReader<File>>>, usize);

async fn next_entry(
    (lines, mut line_no): LineState,
) -> Option<(Result<FailureEntry, FailureLogError>, LineState)> {
    let mut lines = lines?;
    loop {
        line_no += 1;
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let item = FailureEntry::parse_line(&line)
                    .map_err(|reason| FailureLogError::Corrupt { line: line_no, reason });
                return Some((item, (Some(lines), line_no)));
            }
            Ok(None) => return None,
            Err(err) => return Some((Err(err.into()), (None, line_no))),
        }
    }
}

async fn collect_readable(path: &Path, mut stream: EntryStream) -> Result<Vec<FailureEntry>, FailureLogError> {
    let mut entries = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(entry) => entries.push(entry),
            Err(FailureLogError::Corrupt { line, reason }) => {
                warn!("Skipping line {} of {}: {}", line, path.display(), reason)
            }
            Err(err) => return Err(err),
        }
    }
    Ok(entries)
}

async fn count_lines(path: &Path) -> Result<u64, FailureLogError> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut count = 0u64;
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    fn entry(connection: &str, id: u64) -> FailureEntry {
        FailureEntry::new(
            Severity::Error,
            connection,
            props(json!({ "id": id, "body": format!("payload-{id}") })),
            props(json!({ "queue": "orders" })),
        )
    }

    async fn open_log(dir: &tempfile::TempDir) -> FailureLog {
        FailureLog::open_at(dir.path().join("broker.log"), 3).await.unwrap()
    }

    async fn line_count(path: &Path) -> usize {
        fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count()
    }

    async fn file_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut dir_entries = fs::read_dir(dir).await.unwrap();
        while let Some(item) = dir_entries.next_entry().await.unwrap() {
            names.push(item.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[test]
    fn line_round_trip_keeps_every_field() {
        let stored = entry("orders", 7);
        let line = stored.to_line().unwrap();
        assert!(line.contains(" ERROR orders {"));
        assert_eq!(FailureEntry::parse_line(&line).unwrap(), stored);
    }

    #[test]
    fn line_round_trip_with_empty_mappings() {
        let stored = FailureEntry::new(
            Severity::Warn,
            "audit",
            Properties::new(),
            Properties::new(),
        );
        let parsed = FailureEntry::parse_line(&stored.to_line().unwrap()).unwrap();
        assert_eq!(parsed, stored);
        assert!(parsed.message.is_empty());
        assert!(parsed.configuration.is_empty());
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(FailureEntry::parse_line("").is_err());
        assert!(FailureEntry::parse_line("2026-10-16T09:30:01.123Z ERROR orders").is_err());
        assert!(FailureEntry::parse_line("yesterday ERROR orders {}").is_err());
        assert!(FailureEntry::parse_line(
            "2026-10-16T09:30:01.123Z FATAL orders {\"connectionName\":\"orders\"}"
        )
        .is_err());
        assert!(FailureEntry::parse_line(
            "2026-10-16T09:30:01.123Z ERROR orders {\"connectionName\":\"audit\"}"
        )
        .is_err());
    }

    #[test]
    fn parse_defaults_missing_mappings() {
        let parsed = FailureEntry::parse_line(
            "2026-10-16T09:30:01.123Z INFO orders {\"connectionName\":\"orders\"}",
        )
        .unwrap();
        assert_eq!(parsed.severity, Severity::Info);
        assert!(parsed.message.is_empty());
    }

    #[tokio::test]
    async fn append_counts_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        assert!(log.is_empty());

        for id in 0..3 {
            log.append(&entry("orders", id)).await.unwrap();
        }
        assert_eq!(log.len(), 3);
        assert_eq!(line_count(log.path()).await, 3);

        let reopened = FailureLog::open_at(log.path(), 3).await.unwrap();
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.entries().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn threshold_is_exceeded_only_above_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        for id in 0..3 {
            log.append(&entry("orders", id)).await.unwrap();
        }
        assert!(!log.is_at_threshold());

        log.append(&entry("orders", 3)).await.unwrap();
        assert!(log.is_at_threshold());
    }

    #[tokio::test]
    async fn stream_for_filters_by_connection() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        log.append(&entry("orders", 1)).await.unwrap();
        log.append(&entry("audit", 2)).await.unwrap();
        log.append(&entry("orders", 3)).await.unwrap();

        let orders: Vec<_> = log
            .stream_for("orders")
            .await
            .unwrap()
            .map(|item| item.unwrap().message["id"].as_u64().unwrap())
            .collect()
            .await;
        assert_eq!(orders, vec![1, 3]);

        let everything: Vec<_> = log.stream_all().await.unwrap().collect().await;
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn remove_batch_keeps_survivors_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let written: Vec<_> = (0..6).map(|id| entry("orders", id)).collect();
        for e in &written {
            log.append(e).await.unwrap();
        }

        let doomed = vec![written[1].clone(), written[4].clone()];
        assert_eq!(log.remove_batch(&doomed).await.unwrap(), 2);

        let expected: Vec<_> = written
            .iter()
            .filter(|e| !doomed.contains(e))
            .cloned()
            .collect();
        assert_eq!(log.entries().await.unwrap(), expected);
        assert_eq!(log.len(), 4);
        assert_eq!(line_count(log.path()).await, 4);
    }

    #[tokio::test]
    async fn remove_batch_of_nothing_and_of_everything() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let written: Vec<_> = (0..4).map(|id| entry("orders", id)).collect();
        for e in &written {
            log.append(e).await.unwrap();
        }

        assert_eq!(log.remove_batch(&[]).await.unwrap(), 0);
        assert_eq!(log.entries().await.unwrap(), written);

        assert_eq!(log.remove_batch(&written).await.unwrap(), 4);
        assert!(log.entries().await.unwrap().is_empty());
        assert!(log.is_empty());

        // Removing again is a no-op.
        assert_eq!(log.remove_batch(&written).await.unwrap(), 0);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn remove_ignores_entries_that_differ_in_any_field() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let stored = entry("orders", 1);
        log.append(&stored).await.unwrap();

        let mut other_severity = stored.clone();
        other_severity.severity = Severity::Warn;
        let mut other_config = stored.clone();
        other_config
            .configuration
            .insert("queue".into(), json!("audit"));

        assert_eq!(log.remove_batch(&[other_severity, other_config]).await.unwrap(), 0);
        assert_eq!(log.len(), 1);
        assert_eq!(log.remove(&stored).await.unwrap(), 1);
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn compaction_preserves_unreadable_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.log");
        let good = entry("orders", 1);
        let keep = entry("orders", 2);
        let content = format!(
            "{}\nnot a failure entry\n{}\n",
            good.to_line().unwrap(),
            keep.to_line().unwrap()
        );
        fs::write(&path, content).await.unwrap();

        let log = FailureLog::open_at(&path, 3).await.unwrap();
        assert_eq!(log.len(), 3);

        let items: Vec<_> = log.stream_all().await.unwrap().collect().await;
        assert!(matches!(items[1], Err(FailureLogError::Corrupt { line: 2, .. })));
        assert_eq!(log.entries().await.unwrap(), vec![good.clone(), keep.clone()]);

        assert_eq!(log.remove(&good).await.unwrap(), 1);
        let remaining = fs::read_to_string(&path).await.unwrap();
        assert!(remaining.contains("not a failure entry"));
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn compaction_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let first = entry("orders", 1);
        log.append(&first).await.unwrap();
        log.append(&entry("orders", 2)).await.unwrap();
        log.remove(&first).await.unwrap();

        assert_eq!(file_names(dir.path()).await, vec!["broker.log".to_string()]);
    }

    #[tokio::test]
    async fn failed_compaction_leaves_the_log_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        let first = entry("orders", 1);
        log.append(&first).await.unwrap();
        log.append(&entry("orders", 2)).await.unwrap();

        // A line that is not UTF-8 fails the rewrite after the temporary file exists.
        let mut raw = OpenOptions::new().append(true).open(log.path()).await.unwrap();
        raw.write_all(b"\xff\xfe broken\n").await.unwrap();
        raw.flush().await.unwrap();
        drop(raw);
        let before = fs::read(log.path()).await.unwrap();

        assert!(matches!(log.remove(&first).await, Err(FailureLogError::Io(_))));

        assert_eq!(fs::read(log.path()).await.unwrap(), before);
        assert_eq!(log.len(), 2);
        assert_eq!(file_names(dir.path()).await, vec!["broker.log".to_string()]);
    }

    #[tokio::test]
    async fn batches_for_partitions_a_connection_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(&dir).await;
        for id in 0..5 {
            log.append(&entry("orders", id)).await.unwrap();
        }
        log.append(&entry("audit", 99)).await.unwrap();

        let batches = log.batches_for("orders", 2).await.unwrap();
        let sizes: Vec<_> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(batches.iter().flatten().all(|e| e.connection_name == "orders"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_and_removals_do_not_lose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(open_log(&dir).await);

        let initial: Vec<_> = (0..20).map(|id| entry("orders", id)).collect();
        for e in &initial {
            log.append(e).await.unwrap();
        }

        let mut tasks = Vec::new();
        for id in 100..130 {
            let log = Arc::clone(&log);
            tasks.push(tokio::spawn(async move {
                log.append(&entry("audit", id)).await.unwrap();
            }));
        }
        for chunk in initial[..12].chunks(3) {
            let log = Arc::clone(&log);
            let chunk = chunk.to_vec();
            tasks.push(tokio::spawn(async move {
                assert_eq!(log.remove_batch(&chunk).await.unwrap(), 3);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(log.len(), 20 + 30 - 12);
        assert_eq!(line_count(log.path()).await, 38);
        let survivors = log.entries().await.unwrap();
        assert_eq!(survivors.len(), 38);
        for e in &initial[12..] {
            assert!(survivors.contains(e));
        }
    }
}
