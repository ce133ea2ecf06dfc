//! Cross-tab message: the record written to the broadcast channel.
//!
//! ARCHITECTURE
//! ============
//! A tab publishes by writing one JSON record under the form's sync key.
//! Every other tab sharing the store sees the change, decodes the record,
//! and routes on `type`. The same key is overwritten by every message for
//! that form; only change notifications carry history.
//!
//! DESIGN
//! ======
//! - Envelope fields (`formId`, `timestamp`, `tabId`) are common to every
//!   message; the body is a tagged union on `type`.
//! - Decoding is the trust boundary: anything that is not exactly one of
//!   the known variants, or whose ids are empty, is rejected here.
//! - Wire keys are camelCase to stay readable next to browser records.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::snapshot::FormData;

// =============================================================================
// TYPES
// =============================================================================

/// One record on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTabMessage {
    pub form_id: String,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub timestamp: i64,
    /// Identity of the publishing tab.
    pub tab_id: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// Type-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageBody {
    /// New form state. `field_path` marks a partial, single-field change.
    #[serde(rename_all = "camelCase")]
    Update {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field_path: Option<String>,
        data: FormData,
    },
    /// The form was submitted or discarded.
    Clear,
    /// A tab asks for the latest durable state.
    RestoreRequest,
    /// Two tabs hold divergent edits.
    Conflict { data: ConflictData },
}

/// Both sides of a conflict, carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    pub local_data: FormData,
    pub remote_data: FormData,
}

/// Discriminant of a message body, for logging and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Update,
    Clear,
    RestoreRequest,
    Conflict,
}

impl MessageKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Clear => "clear",
            Self::RestoreRequest => "restore-request",
            Self::Conflict => "conflict",
        }
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl CrossTabMessage {
    fn new(form_id: impl Into<String>, tab_id: impl Into<String>, body: MessageBody) -> Self {
        Self { form_id: form_id.into(), timestamp: now_ms(), tab_id: tab_id.into(), body }
    }

    /// Full-form (or, with `field_path`, single-field) update at `version`.
    pub fn update(
        form_id: impl Into<String>,
        tab_id: impl Into<String>,
        version: u64,
        data: FormData,
        field_path: Option<String>,
    ) -> Self {
        Self::new(form_id, tab_id, MessageBody::Update { version: Some(version), field_path, data })
    }

    pub fn clear(form_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self::new(form_id, tab_id, MessageBody::Clear)
    }

    pub fn restore_request(form_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self::new(form_id, tab_id, MessageBody::RestoreRequest)
    }

    pub fn conflict(
        form_id: impl Into<String>,
        tab_id: impl Into<String>,
        local_data: FormData,
        remote_data: FormData,
    ) -> Self {
        Self::new(form_id, tab_id, MessageBody::Conflict { data: ConflictData { local_data, remote_data } })
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Update { .. } => MessageKind::Update,
            MessageBody::Clear => MessageKind::Clear,
            MessageBody::RestoreRequest => MessageKind::RestoreRequest,
            MessageBody::Conflict { .. } => MessageKind::Conflict,
        }
    }
}

// =============================================================================
// CODEC
// =============================================================================

impl CrossTabMessage {
    /// Serialize for the broadcast channel.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::Malformed` if a field value cannot be encoded.
    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Malformed(e.to_string()))
    }

    /// Parse and validate the record found under broadcast key `key`.
    ///
    /// `expected_form_id` is the form named by the key; a record naming any
    /// other form is rejected.
    ///
    /// # Errors
    ///
    /// Returns a `MessageError` for any record that is not a well-formed
    /// message for `expected_form_id`.
    pub fn decode(key: &str, expected_form_id: &str, raw: &str) -> Result<Self, MessageError> {
        let message: Self = serde_json::from_str(raw).map_err(|e| MessageError::Malformed(e.to_string()))?;
        if message.form_id.is_empty() {
            return Err(MessageError::MissingField("formId"));
        }
        if message.tab_id.is_empty() {
            return Err(MessageError::MissingField("tabId"));
        }
        if message.form_id != expected_form_id {
            return Err(MessageError::FormMismatch { key: key.to_owned(), form_id: message.form_id });
        }
        if let MessageBody::Update { field_path: Some(path), .. } = &message.body {
            if path.is_empty() {
                return Err(MessageError::MissingField("fieldPath"));
            }
        }
        Ok(message)
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
