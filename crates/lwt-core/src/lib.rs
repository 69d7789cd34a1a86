//! Core domain model and status state machine for the outreach ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lwt-core";

/// Upstream event type that moves a prospect to `connection_sent`.
pub const EVENT_CONNECTION_SENT: &str = "connection_request_sent";
/// Upstream event type that moves a prospect to `connected`.
pub const EVENT_CONNECTION_ACCEPTED: &str = "connection_request_accepted";

/// Funnel position of a prospect. `Expired` and `Blacklisted` are reserved
/// states; no event type modeled here drives a prospect into them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProspectStatus {
    Qualified,
    ConnectionSent,
    Connected,
    Expired,
    Blacklisted,
}

impl ProspectStatus {
    pub const ALL: [ProspectStatus; 5] = [
        ProspectStatus::Qualified,
        ProspectStatus::ConnectionSent,
        ProspectStatus::Connected,
        ProspectStatus::Expired,
        ProspectStatus::Blacklisted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProspectStatus::Qualified => "qualified",
            ProspectStatus::ConnectionSent => "connection_sent",
            ProspectStatus::Connected => "connected",
            ProspectStatus::Expired => "expired",
            ProspectStatus::Blacklisted => "blacklisted",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == input)
    }
}

impl std::fmt::Display for ProspectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted prospect: one row per external LinkedIn profile key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prospect {
    pub id: i64,
    pub linkedin_url: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub email: Option<String>,
    pub heyreach_lead_id: Option<String>,
    pub status: ProspectStatus,
    pub connection_sent_at: Option<DateTime<Utc>>,
    pub connection_accepted_at: Option<DateTime<Utc>>,
    pub blacklisted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable ledger entry for one lifecycle occurrence. The raw payload is
/// kept verbatim for audit and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub prospect_id: Option<i64>,
    pub event_type: String,
    pub heyreach_lead_id: Option<String>,
    pub raw_payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Partial field set carried by one upstream sighting of a lead. Any field
/// may be absent; absent never clears a stored value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadFields {
    pub heyreach_lead_id: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub email: Option<String>,
}

/// Which timestamp column a status transition stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    ConnectionSent,
    ConnectionAccepted,
}

/// Result of the pure status transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    To { status: ProspectStatus, stamp: Stamp },
    Unchanged,
}

/// Status transition table, keyed by incoming event type. Total and
/// deterministic: every (status, event type) pair yields exactly one result.
/// Once a prospect is `connected` no sent/accepted event moves it away, and
/// re-delivering the event that produced the current status is a no-op, so
/// applying the same event twice never double-stamps.
pub fn transition_for(current: ProspectStatus, event_type: &str) -> StatusTransition {
    match event_type {
        EVENT_CONNECTION_SENT
            if current != ProspectStatus::Connected
                && current != ProspectStatus::ConnectionSent =>
        {
            StatusTransition::To {
                status: ProspectStatus::ConnectionSent,
                stamp: Stamp::ConnectionSent,
            }
        }
        EVENT_CONNECTION_ACCEPTED if current != ProspectStatus::Connected => {
            StatusTransition::To {
                status: ProspectStatus::Connected,
                stamp: Stamp::ConnectionAccepted,
            }
        }
        _ => StatusTransition::Unchanged,
    }
}

fn merge_field(current: &mut Option<String>, incoming: Option<&str>) -> bool {
    match incoming {
        Some(value) if !value.trim().is_empty() && current.as_deref() != Some(value) => {
            *current = Some(value.to_string());
            true
        }
        _ => false,
    }
}

impl Prospect {
    /// Fold a sighting's non-empty fields into this prospect. A field is
    /// overwritten only when the incoming value is non-empty and differs;
    /// empty or absent incoming values never clear stored data. Returns
    /// whether anything changed, so callers can decide whether to persist.
    pub fn merge_fields(&mut self, incoming: &LeadFields) -> bool {
        let mut changed = false;
        changed |= merge_field(&mut self.heyreach_lead_id, incoming.heyreach_lead_id.as_deref());
        changed |= merge_field(&mut self.first_name, incoming.first_name.as_deref());
        changed |= merge_field(&mut self.last_name, incoming.last_name.as_deref());
        changed |= merge_field(&mut self.company, incoming.company.as_deref());
        changed |= merge_field(&mut self.title, incoming.title.as_deref());
        changed |= merge_field(&mut self.email, incoming.email.as_deref());
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn prospect() -> Prospect {
        Prospect {
            id: 1,
            linkedin_url: "https://linkedin.com/in/someone".to_string(),
            first_name: Some("Ada".to_string()),
            last_name: None,
            company: Some("Initech".to_string()),
            title: None,
            email: None,
            heyreach_lead_id: Some("42".to_string()),
            status: ProspectStatus::Qualified,
            connection_sent_at: None,
            connection_accepted_at: None,
            blacklisted: false,
            created_at: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).single().unwrap(),
            updated_at: Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for status in ProspectStatus::ALL {
            assert_eq!(ProspectStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProspectStatus::parse("nope"), None);
    }

    #[test]
    fn sent_event_moves_forward_and_stamps() {
        let got = transition_for(ProspectStatus::Qualified, EVENT_CONNECTION_SENT);
        assert_eq!(
            got,
            StatusTransition::To {
                status: ProspectStatus::ConnectionSent,
                stamp: Stamp::ConnectionSent,
            }
        );
    }

    #[test]
    fn accepted_event_connects_from_any_non_connected_status() {
        for status in [
            ProspectStatus::Qualified,
            ProspectStatus::ConnectionSent,
            ProspectStatus::Expired,
            ProspectStatus::Blacklisted,
        ] {
            assert_eq!(
                transition_for(status, EVENT_CONNECTION_ACCEPTED),
                StatusTransition::To {
                    status: ProspectStatus::Connected,
                    stamp: Stamp::ConnectionAccepted,
                }
            );
        }
    }

    #[test]
    fn connected_never_regresses() {
        assert_eq!(
            transition_for(ProspectStatus::Connected, EVENT_CONNECTION_SENT),
            StatusTransition::Unchanged
        );
        assert_eq!(
            transition_for(ProspectStatus::Connected, EVENT_CONNECTION_ACCEPTED),
            StatusTransition::Unchanged
        );
    }

    #[test]
    fn duplicate_sent_does_not_restamp() {
        assert_eq!(
            transition_for(ProspectStatus::ConnectionSent, EVENT_CONNECTION_SENT),
            StatusTransition::Unchanged
        );
    }

    #[test]
    fn unknown_event_types_leave_every_status_unchanged() {
        for status in ProspectStatus::ALL {
            for event_type in ["message_reply", "profile_viewed", "", "CONNECTION_REQUEST_SENT"] {
                assert_eq!(transition_for(status, event_type), StatusTransition::Unchanged);
            }
        }
    }

    #[test]
    fn merge_overwrites_differing_non_empty_fields() {
        let mut p = prospect();
        let changed = p.merge_fields(&LeadFields {
            company: Some("Globex".to_string()),
            last_name: Some("Lovelace".to_string()),
            ..LeadFields::default()
        });
        assert!(changed);
        assert_eq!(p.company.as_deref(), Some("Globex"));
        assert_eq!(p.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(p.first_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn merge_never_clears_stored_values() {
        let mut p = prospect();
        let changed = p.merge_fields(&LeadFields {
            first_name: None,
            company: Some("   ".to_string()),
            ..LeadFields::default()
        });
        assert!(!changed);
        assert_eq!(p.first_name.as_deref(), Some("Ada"));
        assert_eq!(p.company.as_deref(), Some("Initech"));
    }

    #[test]
    fn merge_is_idempotent() {
        let incoming = LeadFields {
            first_name: Some("Ada".to_string()),
            company: Some("Globex".to_string()),
            email: Some("ada@globex.test".to_string()),
            ..LeadFields::default()
        };
        let mut once = prospect();
        once.merge_fields(&incoming);
        let mut twice = prospect();
        twice.merge_fields(&incoming);
        assert!(!twice.merge_fields(&incoming));
        assert_eq!(once, twice);
    }
}
