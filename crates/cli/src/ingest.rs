//! `insights ingest`: pushes records at a running server's intake endpoint,
//! waiting out `429` responses the way any well-behaved client should.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use listener::SubmitItemResponse;
use pipeline::{Timestamp, WorkItemId};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// JSON Lines file with one `{text, author?, timestamp?, metadata?}`
    /// object per line. Without it the built-in sample conversations are sent.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Base URL of the running `insights serve`.
    #[arg(long, env = "API_URL", default_value = "http://127.0.0.1:8000")]
    pub api_url: String,

    /// Attempts per record while the server answers 429.
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,
}

/// One submission, in the intake endpoint's body shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    /// Refused by the server as invalid.
    pub rejected: usize,
    /// Transport errors, unexpected statuses, or still rate limited after
    /// the last attempt.
    pub failed: usize,
}

enum Submitted {
    Accepted(WorkItemId),
    Invalid(String),
}

const SAMPLE_CONVERSATIONS: [(&str, &str); 10] = [
    (
        "Still waiting on my order... it's been 2 weeks. Very disappointed with the service.",
        "customer123",
    ),
    (
        "Great product! Fast shipping and excellent quality. Highly recommend!",
        "happy_customer",
    ),
    ("Having issues with my account. Can someone help?", "user456"),
    (
        "The delivery was delayed but customer service was very helpful. Thanks!",
        "satisfied_user",
    ),
    ("Product arrived damaged. Need a refund immediately.", "angry_customer"),
    ("Love the new features! Keep up the great work!", "fan_user"),
    ("Billing issue - charged twice for the same order.", "concerned_user"),
    ("Best customer service experience ever! Thank you!", "grateful_customer"),
    ("Website is down. Can't access my account.", "frustrated_user"),
    (
        "Amazing product quality and fast response time. 5 stars!",
        "reviewer_123",
    ),
];

/// Sample support conversations, stamped one day before `now`.
pub fn sample_records(now: Timestamp) -> Vec<IngestRecord> {
    let yesterday = now.saturating_sub(Duration::from_secs(24 * 60 * 60)).to_rfc3339();
    SAMPLE_CONVERSATIONS
        .iter()
        .map(|(text, author)| IngestRecord {
            text: text.to_string(),
            author: Some(author.to_string()),
            timestamp: Some(yesterday.clone()),
            metadata: None,
        })
        .collect()
}

/// Parses JSON Lines, skipping blank lines.
pub fn parse_jsonl(text: &str) -> Result<Vec<IngestRecord>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("line {} is not a valid record", i + 1))
        })
        .collect()
}

pub fn read_jsonl(path: &Path) -> Result<Vec<IngestRecord>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_jsonl(&text)
}

pub async fn run(args: IngestArgs) -> Result<IngestSummary> {
    let records = match &args.file {
        Some(path) => read_jsonl(path)?,
        None => {
            info!("no --file given; sending sample conversations");
            sample_records(Timestamp::now())
        }
    };
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;
    let summary = submit_all(&client, &args.api_url, &records, args.max_attempts).await;
    info!(
        accepted = summary.accepted,
        rejected = summary.rejected,
        failed = summary.failed,
        "ingestion finished"
    );
    Ok(summary)
}

#[instrument(skip_all, fields(records = records.len()))]
pub async fn submit_all(
    client: &Client,
    api_url: &str,
    records: &[IngestRecord],
    max_attempts: u32,
) -> IngestSummary {
    let url = format!("{}/api/v1/items", api_url.trim_end_matches('/'));
    let mut summary = IngestSummary::default();
    for (line, record) in records.iter().enumerate() {
        match submit_one(client, &url, record, max_attempts.max(1)).await {
            Ok(Submitted::Accepted(item_id)) => {
                debug!(%item_id, "record accepted");
                summary.accepted += 1;
            }
            Ok(Submitted::Invalid(details)) => {
                warn!(record = line + 1, %details, "record rejected");
                summary.rejected += 1;
            }
            Err(err) => {
                warn!(record = line + 1, error = ?err, "record not submitted");
                summary.failed += 1;
            }
        }
    }
    summary
}

async fn submit_one(
    client: &Client,
    url: &str,
    record: &IngestRecord,
    max_attempts: u32,
) -> Result<Submitted> {
    let mut attempt = 1;
    loop {
        let response = client.post(url).json(record).send().await?;
        match response.status() {
            StatusCode::ACCEPTED => {
                let body: SubmitItemResponse = response.json().await?;
                return Ok(Submitted::Accepted(body.item_id));
            }
            StatusCode::BAD_REQUEST => {
                return Ok(Submitted::Invalid(response.text().await.unwrap_or_default()));
            }
            StatusCode::TOO_MANY_REQUESTS if attempt < max_attempts => {
                let wait = llm::retry_after(response.headers()).unwrap_or(Duration::from_secs(1));
                debug!(attempt, retry_after_ms = wait.as_millis() as u64, "admission full; waiting");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            status => bail!("server answered {status}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use listener::{router, AppState};
    use pipeline::{AdmissionConfig, AdmissionLimiter, WorkState};
    use store::MemoryStore;

    use super::*;

    #[test]
    fn sample_set_is_stamped_yesterday() {
        let now = Timestamp::parse_rfc3339("2024-05-02T12:00:00Z").unwrap();
        let records = sample_records(now);
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r.author.is_some()));
        let stamp = records[0].timestamp.as_deref().unwrap();
        assert_eq!(
            Timestamp::parse_rfc3339(stamp),
            Timestamp::parse_rfc3339("2024-05-01T12:00:00Z")
        );
    }

    #[test]
    fn jsonl_skips_blank_lines_and_reports_bad_ones() {
        let records = parse_jsonl(
            "{\"text\": \"one\"}\n\n{\"text\": \"two\", \"author\": \"b\", \"metadata\": {\"k\": 1}}\n",
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].author.as_deref(), Some("b"));

        let err = parse_jsonl("{\"text\": \"one\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");
    }

    #[test]
    fn records_serialise_without_absent_fields() {
        let record = IngestRecord {
            text: "hi".into(),
            author: None,
            timestamp: None,
            metadata: None,
        };
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"{"text":"hi"}"#);
    }

    async fn spawn_server(capacity: usize) -> (String, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let admission = AdmissionLimiter::new(AdmissionConfig {
            capacity,
            window: Duration::from_millis(500),
        })
        .unwrap();
        let app = router(AppState::new(store.clone(), store.clone(), Arc::new(admission)));
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(tcp, app).await.unwrap() });
        (format!("http://{addr}"), store)
    }

    #[tokio::test]
    async fn waits_out_admission_rejections() {
        let (url, store) = spawn_server(4).await;
        let records = sample_records(Timestamp::now());

        let summary = submit_all(&Client::new(), &url, &records, 5).await;

        assert_eq!(
            summary,
            IngestSummary {
                accepted: 10,
                rejected: 0,
                failed: 0
            }
        );
        assert_eq!(store.count(WorkState::Pending).await, 10);
    }

    #[tokio::test]
    async fn invalid_and_unreachable_are_counted_separately() {
        let (url, _store) = spawn_server(100).await;
        let blank = IngestRecord {
            text: "  ".into(),
            author: None,
            timestamp: None,
            metadata: None,
        };
        let summary = submit_all(&Client::new(), &url, &[blank.clone()], 1).await;
        assert_eq!(summary.rejected, 1);

        let summary = submit_all(&Client::new(), "http://127.0.0.1:9", &[blank], 1).await;
        assert_eq!(summary.failed, 1);
    }
}
