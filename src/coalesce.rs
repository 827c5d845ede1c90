//! Turn raw pub/sub payloads into tasks.
//!
//! A payload is headerless CSV with three columns:
//!
//! ```text
//! change_id,repo,path
//! ```
//!
//! Consecutive rows that share both the change id and the repo are folded
//! into one [`Task`]. Rows with the wrong shape are logged and dropped; they
//! never take the rest of the payload down with them.

use crate::task::Task;
use tokio::sync::mpsc;

const COLUMNS: usize = 3;

/// Parse one payload into zero or more tasks, in payload order.
pub fn parse_payload(payload: &str) -> Vec<Task> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(payload.as_bytes());

    let mut tasks = Vec::new();
    let mut current: Option<(String, String, Vec<String>)> = None;

    for (line, result) in reader.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to read row {} of payload: {}", line + 1, e);
                continue;
            }
        };

        if record.len() != COLUMNS {
            tracing::warn!(
                "No idea how to process row {} ({} columns, expected {}): {:?}",
                line + 1,
                record.len(),
                COLUMNS,
                record
            );
            continue;
        }

        let (change_id, repo, path) = (&record[0], &record[1], &record[2]);

        match current.as_mut() {
            Some((cur_change, cur_repo, paths)) if cur_change == change_id && cur_repo == repo => {
                paths.push(path.to_string());
            }
            _ => {
                if let Some((change_id, repo, paths)) = current.take() {
                    tasks.push(Task::new(change_id, repo, paths));
                }
                current = Some((change_id.to_string(), repo.to_string(), vec![path.to_string()]));
            }
        }
    }

    if let Some((change_id, repo, paths)) = current {
        tasks.push(Task::new(change_id, repo, paths));
    }

    tasks
}

/// Build a payload from `repo#path` entries, all under one change id.
pub fn encode_payload<S: AsRef<str>>(change_id: &str, entries: &[S]) -> anyhow::Result<String> {
    let rows = entries
        .iter()
        .map(|entry| {
            let entry = entry.as_ref();
            entry
                .split_once('#')
                .filter(|(repo, path)| !repo.is_empty() && !path.is_empty())
                .map(|(repo, path)| [change_id, repo, path])
                .ok_or_else(|| anyhow::anyhow!("Expected repo#path, got '{}'", entry))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    encode_rows(&rows)
}

/// Build a payload from `[change_id, repo, path]` rows.
pub fn encode_rows<S: AsRef<str>>(rows: &[[S; COLUMNS]]) -> anyhow::Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());

    for row in rows {
        writer.write_record(row.iter().map(|field| AsRef::<str>::as_ref(field)))?;
    }

    let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!("Failed to encode payload: {}", e))?;
    Ok(String::from_utf8(bytes)?.trim_end().to_string())
}

/// Move payloads from the subscriber to the scheduler until either side goes away.
pub async fn run_coalescer(mut payloads: mpsc::Receiver<String>, tasks: mpsc::Sender<Task>) {
    tracing::info!("ready to process pubsub messages");

    while let Some(payload) = payloads.recv().await {
        for task in parse_payload(&payload) {
            tracing::info!("got task: {}", task);

            if tasks.send(task).await.is_err() {
                tracing::debug!("Task receiver dropped, stopping coalescer");
                return;
            }
        }
    }

    tracing::debug!("Payload channel closed, stopping coalescer");
}
