use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::CanonicalEvent;

pub fn format_instant(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Hex SHA-256 over the content fields of an event.
///
/// Each field is encoded as a presence byte followed by a length-prefixed
/// value, so `None` and `Some("")` differ and no field can bleed into its
/// neighbour. Identity fields and timestamps of the write are not included.
pub fn content_hash(event: &CanonicalEvent) -> String {
    let mut hasher = Sha256::new();
    let title = Some(event.title.trim().to_string());
    let starts = event.starts_at.as_ref().map(format_instant);
    let ends = event.ends_at.as_ref().map(format_instant);
    let tags = (!event.tags.is_empty()).then(|| event.tags.to_delimited());

    for field in [
        &title,
        &starts,
        &ends,
        &trimmed(&event.venue),
        &trimmed(&event.city),
        &trimmed(&event.url),
        &trimmed(&event.image_url),
        &trimmed(&event.description),
        &trimmed(&event.price),
        &tags,
        &trimmed(&event.organizer),
    ] {
        write_field(&mut hasher, field.as_deref());
    }
    hex::encode(hasher.finalize())
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|v| v.trim().to_string())
}

fn write_field(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        None => hasher.update([0u8]),
        Some(text) => {
            hasher.update([1u8]);
            hasher.update((text.len() as u64).to_le_bytes());
            hasher.update(text.as_bytes());
        }
    }
}

/// A canonical event paired with the fingerprint of its current content.
///
/// The fields are private so the hash can never drift from the event.
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintedEvent {
    event: CanonicalEvent,
    content_hash: String,
}

impl FingerprintedEvent {
    pub fn new(event: CanonicalEvent) -> Self {
        let content_hash = content_hash(&event);
        Self { event, content_hash }
    }

    pub fn event(&self) -> &CanonicalEvent {
        &self.event
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn into_event(self) -> CanonicalEvent {
        self.event
    }
}
