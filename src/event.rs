use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::model::DlqRecord;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("dead-letter payload is empty")]
    EmptyPayload,
    #[error("dead-letter payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// The decoded dead-letter record. Producers wrap failed events in an
/// envelope that always carries the event id; the failure context fields are
/// surfaced in logs when present and ignored otherwise.
#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterEvent {
    pub id: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub failed_at: Option<String>,
}

pub fn decode_event(payload: &[u8]) -> Result<DeadLetterEvent, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Collaborator the drain loop hands every record to, in offset order,
/// before the record's partition is committed. An error here aborts the run;
/// the loop defines no skip-and-continue policy.
#[async_trait]
pub trait EventProcessor {
    async fn process(&self, record: &DlqRecord) -> Result<()>;
}

/// Default processor: decode the payload and log the event identity plus
/// whatever failure context the producing side attached.
pub struct EventLogger;

#[async_trait]
impl EventProcessor for EventLogger {
    async fn process(&self, record: &DlqRecord) -> Result<()> {
        let event = decode_event(&record.payload)
            .with_context(|| format!("decode dead-letter event at {}@{}", record.topic_partition(), record.offset))?;
        debug!(
            id = %event.id,
            partition = %record.topic_partition(),
            offset = record.offset,
            error = ?event.error,
            failed_at = ?event.failed_at,
            "dead-letter event"
        );
        Ok(())
    }
}
