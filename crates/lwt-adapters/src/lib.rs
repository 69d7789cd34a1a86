//! Upstream payload normalization: per-field alias extraction, identity
//! resolution, webhook envelope parsing, and the backfill acceptance
//! predicate.
//!
//! HeyReach has shipped at least two incompatible payload schemas
//! (camelCase and snake_case key naming, `event` vs `event_type`), so every
//! canonical field is extracted through an ordered alias list evaluated
//! first-match-wins instead of a fixed serde struct.

use lwt_core::{LeadFields, EVENT_CONNECTION_ACCEPTED};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "lwt-adapters";

pub const PROVIDER: &str = "heyreach";

pub const EVENT_TYPE_KEYS: &[&str] = &["event_type", "event"];
pub const PROFILE_URL_KEYS: &[&str] = &["profileUrl", "profile_url", "linkedInProfileUrl"];
pub const LEAD_ID_KEYS: &[&str] = &["id", "leadId"];
pub const FIRST_NAME_KEYS: &[&str] = &["firstName", "first_name"];
pub const LAST_NAME_KEYS: &[&str] = &["lastName", "last_name"];
pub const COMPANY_KEYS: &[&str] = &["companyName", "company_name", "company"];
pub const TITLE_KEYS: &[&str] = &["position", "title"];
pub const EMAIL_KEYS: &[&str] = &["emailAddress", "email_address", "email"];

pub const LEADS_ARRAY_KEYS: &[&str] = &["leads", "data"];
pub const TOTAL_PAGES_KEYS: &[&str] = &["totalPages", "total_pages"];

const ACCEPTED_SYNONYMS: &[&str] = &["accepted", "connected", "connection_accepted"];
const CONNECTION_STATUS_KEYS: &[&str] = &["connectionStatus", "connection_status"];
const CONNECTED_FLAG_KEYS: &[&str] = &["isConnected", "is_connected"];

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing or empty event type")]
    MissingEventType,
    #[error("missing lead object")]
    MissingLead,
    #[error("lead carries neither a profile URL nor an upstream id")]
    Unidentifiable,
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn string_at(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => non_empty(s).map(str::to_string),
        // Upstream has sent numeric ids; stringify so they key consistently.
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First non-empty string among the ordered key aliases.
pub fn first_string(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| string_at(value, key))
}

/// One upstream sighting of a lead, reduced to the canonical field set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawLead {
    pub upstream_id: Option<String>,
    pub profile_url: Option<String>,
    pub fields: LeadFields,
}

pub fn normalize_lead(lead: &JsonValue) -> RawLead {
    let upstream_id = first_string(lead, LEAD_ID_KEYS);
    RawLead {
        profile_url: first_string(lead, PROFILE_URL_KEYS),
        fields: LeadFields {
            heyreach_lead_id: upstream_id.clone(),
            first_name: first_string(lead, FIRST_NAME_KEYS),
            last_name: first_string(lead, LAST_NAME_KEYS),
            company: first_string(lead, COMPANY_KEYS),
            title: first_string(lead, TITLE_KEYS),
            email: first_string(lead, EMAIL_KEYS),
        },
        upstream_id,
    }
}

/// Stable external identity for a lead: the profile URL when present,
/// otherwise a deterministic synthetic key derived from the upstream id so
/// repeated deliveries for the same lead collide on the same row.
pub fn resolve_identity(lead: &RawLead) -> Result<String, ValidationError> {
    if let Some(url) = &lead.profile_url {
        return Ok(url.clone());
    }
    match &lead.upstream_id {
        Some(id) => Ok(format!("{PROVIDER}_lead_{id}")),
        None => Err(ValidationError::Unidentifiable),
    }
}

/// Canonical lead+event shape both ingestion channels feed the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event_type: String,
    pub lead: RawLead,
    pub timestamp: Option<String>,
    /// Original payload, stored verbatim in the ledger.
    pub raw_payload: String,
}

/// Parse a webhook body into a [`Delivery`], tolerating both historical
/// envelope schemas.
pub fn parse_webhook(raw: &str) -> Result<Delivery, ValidationError> {
    let value: JsonValue = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(ValidationError::NotAnObject);
    }
    let event_type = first_string(&value, EVENT_TYPE_KEYS).ok_or(ValidationError::MissingEventType)?;
    let lead_value = value
        .get("lead")
        .filter(|v| v.is_object())
        .ok_or(ValidationError::MissingLead)?;
    let lead = normalize_lead(lead_value);
    if lead.profile_url.is_none() && lead.upstream_id.is_none() {
        return Err(ValidationError::Unidentifiable);
    }
    Ok(Delivery {
        event_type,
        lead,
        timestamp: first_string(&value, &["timestamp"]),
        raw_payload: raw.to_string(),
    })
}

/// Wrap a campaign-list lead record as a `connection_request_accepted`
/// delivery; the backfill channel only replays acceptances.
pub fn delivery_from_campaign_lead(lead: &JsonValue) -> Delivery {
    Delivery {
        event_type: EVENT_CONNECTION_ACCEPTED.to_string(),
        lead: normalize_lead(lead),
        timestamp: None,
        raw_payload: lead.to_string(),
    }
}

/// Tolerant "has this lead accepted the connection" predicate. HeyReach has
/// no stable contract for this signal, so the heuristics are OR-combined:
/// a status string matching a small synonym set, a dedicated connection
/// status field, or either spelling of a boolean connected flag.
pub fn is_connection_accepted(lead: &JsonValue) -> bool {
    let matches_synonyms = |keys: &[&str]| {
        first_string(lead, keys)
            .map(|status| ACCEPTED_SYNONYMS.contains(&status.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
    };
    matches_synonyms(&["status"])
        || matches_synonyms(CONNECTION_STATUS_KEYS)
        || CONNECTED_FLAG_KEYS
            .iter()
            .any(|key| lead.get(*key).and_then(JsonValue::as_bool).unwrap_or(false))
}

/// Lead array of one campaign-list page; upstream has used both `leads`
/// and `data` as the envelope key.
pub fn leads_from_page(page: &JsonValue) -> Vec<JsonValue> {
    LEADS_ARRAY_KEYS
        .iter()
        .find_map(|key| page.get(*key).and_then(JsonValue::as_array).cloned())
        .unwrap_or_default()
}

/// Total-page marker of a campaign-list page, when present and meaningful.
/// Zero counts as missing, matching upstream's habit of sending it as a
/// placeholder.
pub fn total_pages(page: &JsonValue) -> Option<u64> {
    TOTAL_PAGES_KEYS
        .iter()
        .find_map(|key| page.get(*key).and_then(JsonValue::as_u64))
        .filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_camel_case_lead_schema() {
        let lead = json!({
            "id": "L1",
            "firstName": "Ada",
            "lastName": "Lovelace",
            "companyName": "Initech",
            "position": "CTO",
            "emailAddress": "ada@initech.test",
            "linkedInProfileUrl": "https://linkedin.com/in/ada",
        });
        let raw = normalize_lead(&lead);
        assert_eq!(raw.upstream_id.as_deref(), Some("L1"));
        assert_eq!(raw.profile_url.as_deref(), Some("https://linkedin.com/in/ada"));
        assert_eq!(raw.fields.first_name.as_deref(), Some("Ada"));
        assert_eq!(raw.fields.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(raw.fields.company.as_deref(), Some("Initech"));
        assert_eq!(raw.fields.title.as_deref(), Some("CTO"));
        assert_eq!(raw.fields.email.as_deref(), Some("ada@initech.test"));
    }

    #[test]
    fn extracts_snake_case_lead_schema() {
        let lead = json!({
            "leadId": 7,
            "first_name": "Grace",
            "last_name": "Hopper",
            "company_name": "Navy",
            "email_address": "grace@navy.test",
            "profile_url": "https://linkedin.com/in/grace",
        });
        let raw = normalize_lead(&lead);
        assert_eq!(raw.upstream_id.as_deref(), Some("7"));
        assert_eq!(raw.profile_url.as_deref(), Some("https://linkedin.com/in/grace"));
        assert_eq!(raw.fields.first_name.as_deref(), Some("Grace"));
        assert_eq!(raw.fields.company.as_deref(), Some("Navy"));
    }

    #[test]
    fn alias_order_is_first_match_wins() {
        let lead = json!({
            "profileUrl": "https://linkedin.com/in/primary",
            "linkedInProfileUrl": "https://linkedin.com/in/secondary",
        });
        assert_eq!(
            first_string(&lead, PROFILE_URL_KEYS).as_deref(),
            Some("https://linkedin.com/in/primary")
        );
    }

    #[test]
    fn empty_strings_are_treated_as_absent() {
        let lead = json!({"firstName": "   ", "first_name": "Ada"});
        assert_eq!(first_string(&lead, FIRST_NAME_KEYS).as_deref(), Some("Ada"));
        assert_eq!(first_string(&json!({"firstName": ""}), FIRST_NAME_KEYS), None);
    }

    #[test]
    fn identity_prefers_profile_url() {
        let raw = normalize_lead(&json!({
            "id": "L1",
            "profileUrl": "https://linkedin.com/in/ada",
        }));
        assert_eq!(resolve_identity(&raw).unwrap(), "https://linkedin.com/in/ada");
    }

    #[test]
    fn identity_fallback_is_deterministic() {
        let first = resolve_identity(&normalize_lead(&json!({"id": "L1"}))).unwrap();
        let second = resolve_identity(&normalize_lead(&json!({"leadId": "L1"}))).unwrap();
        assert_eq!(first, "heyreach_lead_L1");
        assert_eq!(first, second);
    }

    #[test]
    fn identity_fails_without_url_or_id() {
        let raw = normalize_lead(&json!({"firstName": "Ada"}));
        assert!(matches!(
            resolve_identity(&raw),
            Err(ValidationError::Unidentifiable)
        ));
    }

    #[test]
    fn parses_canonical_webhook_envelope() {
        let body = r#"{
            "event_type": "connection_request_sent",
            "lead": {"id": "L1", "profileUrl": "https://linkedin.com/in/ada"},
            "timestamp": "2025-06-01T09:00:00Z"
        }"#;
        let delivery = parse_webhook(body).unwrap();
        assert_eq!(delivery.event_type, "connection_request_sent");
        assert_eq!(delivery.lead.upstream_id.as_deref(), Some("L1"));
        assert_eq!(delivery.timestamp.as_deref(), Some("2025-06-01T09:00:00Z"));
        assert_eq!(delivery.raw_payload, body);
    }

    #[test]
    fn parses_legacy_event_key_envelope() {
        let delivery = parse_webhook(
            r#"{"event": "connection_request_accepted", "lead": {"id": "L2"}}"#,
        )
        .unwrap();
        assert_eq!(delivery.event_type, "connection_request_accepted");
    }

    #[test]
    fn lead_with_url_but_no_id_is_accepted() {
        let delivery = parse_webhook(
            r#"{"event_type": "x", "lead": {"profileUrl": "https://linkedin.com/in/a"}}"#,
        )
        .unwrap();
        assert!(delivery.lead.upstream_id.is_none());
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert!(matches!(
            parse_webhook("not json"),
            Err(ValidationError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_webhook("[1, 2]"),
            Err(ValidationError::NotAnObject)
        ));
        assert!(matches!(
            parse_webhook(r#"{"lead": {"id": "L1"}}"#),
            Err(ValidationError::MissingEventType)
        ));
        assert!(matches!(
            parse_webhook(r#"{"event_type": "x"}"#),
            Err(ValidationError::MissingLead)
        ));
        assert!(matches!(
            parse_webhook(r#"{"event_type": "x", "lead": {"firstName": "Ada"}}"#),
            Err(ValidationError::Unidentifiable)
        ));
    }

    #[test]
    fn campaign_lead_wraps_as_accepted_delivery() {
        let lead = json!({"id": "L3", "status": "Accepted"});
        let delivery = delivery_from_campaign_lead(&lead);
        assert_eq!(delivery.event_type, EVENT_CONNECTION_ACCEPTED);
        assert_eq!(delivery.raw_payload, lead.to_string());
    }

    #[test]
    fn accepted_predicate_truth_table() {
        assert!(is_connection_accepted(&json!({"status": "Accepted"})));
        assert!(is_connection_accepted(&json!({"status": "CONNECTED"})));
        assert!(is_connection_accepted(&json!({"connectionStatus": "connection_accepted"})));
        assert!(is_connection_accepted(&json!({"connection_status": "accepted"})));
        assert!(is_connection_accepted(&json!({"isConnected": true})));
        assert!(is_connection_accepted(&json!({"is_connected": true})));
        assert!(!is_connection_accepted(&json!({"status": "pending"})));
        assert!(!is_connection_accepted(&json!({"isConnected": false})));
        assert!(!is_connection_accepted(&json!({"firstName": "Ada"})));
    }

    #[test]
    fn page_envelope_aliases() {
        assert_eq!(leads_from_page(&json!({"leads": [{"id": 1}]})).len(), 1);
        assert_eq!(leads_from_page(&json!({"data": [{"id": 1}, {"id": 2}]})).len(), 2);
        assert!(leads_from_page(&json!({"other": []})).is_empty());
        assert_eq!(total_pages(&json!({"totalPages": 3})), Some(3));
        assert_eq!(total_pages(&json!({"total_pages": 2})), Some(2));
        assert_eq!(total_pages(&json!({"totalPages": 0})), None);
        assert_eq!(total_pages(&json!({})), None);
    }
}
