//! Bus message envelope and typed payload views.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Event names carried on the bus.
pub mod events {
    /// A skill has put a page on the screen.
    pub const PAGE_SHOWN: &str = "page_shown";
    /// The user flipped or touched a displayed page.
    pub const PAGE_INTERACTION: &str = "page_interaction";
    /// The user pressed the explicit close control.
    pub const SCREEN_CLOSE_REQUESTED: &str = "screen_close_requested";
    /// A skill asked for programmatic teardown of the screen.
    pub const SCREEN_FORCE_CLOSE: &str = "screen_force_close";
    /// Emitted when the idle machinery decides the screen should close.
    pub const SCREEN_CLOSE_IDLE: &str = "screen_close_idle";
}

/// A single bus message: an event name plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Event name, one of [`events`].
    pub event: String,
    /// Free-form JSON payload.
    #[serde(default)]
    pub data: Value,
}

impl Message {
    /// Create a message with the given event name and payload.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build the outbound close event, attributed to the given identity.
    pub fn close_idle(skill_idle_event_id: Option<&str>) -> Self {
        Self::new(
            events::SCREEN_CLOSE_IDLE,
            serde_json::json!({ "skill_idle_event_id": skill_idle_event_id }),
        )
    }

    /// Look up a string field in the payload.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// The idle-override directive a `page_shown` event may carry.
///
/// Wire payloads are loosely typed; anything that is not `true` or a
/// positive integer resolves to [`OverrideDirective::Absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideDirective {
    /// Suppress idle close until further notice.
    Indefinite,
    /// Close after this many seconds instead of the default.
    TimeoutSeconds(u64),
    /// No directive; default idle handling applies.
    Absent,
}

impl OverrideDirective {
    /// Resolve the raw `override` payload field into a directive.
    pub fn from_value(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Absent,
            Some(Value::Bool(true)) => Self::Indefinite,
            Some(Value::Bool(false)) => Self::Absent,
            Some(Value::Number(n)) => match n.as_u64() {
                Some(secs) if secs > 0 => Self::TimeoutSeconds(secs),
                _ => {
                    warn!(value = %n, "non-positive override timeout, treating as absent");
                    Self::Absent
                }
            },
            Some(other) => {
                warn!(value = ?other, "ambiguous override directive, treating as absent");
                Self::Absent
            }
        }
    }
}

/// Parsed view of a `page_shown` event.
#[derive(Debug, Clone)]
pub struct PageShown {
    /// Identity of the skill showing the page.
    pub source_identity: String,
    /// Idle-override directive carried by the event.
    pub directive: OverrideDirective,
    /// Name of the page being shown, if any.
    pub page: Option<String>,
}

impl PageShown {
    /// Parse a bus message; `None` if the required fields are missing.
    pub fn parse(message: &Message) -> Option<Self> {
        let source_identity = message.str_field("source_identity")?.to_string();
        let directive = OverrideDirective::from_value(message.data.get("override"));
        let page = message.str_field("page").map(str::to_string);
        Some(Self {
            source_identity,
            directive,
            page,
        })
    }
}

/// Parsed view of a `page_interaction` event.
#[derive(Debug, Clone)]
pub struct PageInteraction {
    /// Identity of the skill whose page the user interacted with.
    pub source_identity: String,
}

impl PageInteraction {
    /// Parse a bus message; `None` if the source identity is missing.
    pub fn parse(message: &Message) -> Option<Self> {
        Some(Self {
            source_identity: message.str_field("source_identity")?.to_string(),
        })
    }
}

/// Parsed view of a `screen_force_close` event.
#[derive(Debug, Clone)]
pub struct ForceClose {
    /// Identity the close should be attributed to. Required by contract.
    pub skill_id: String,
}

impl ForceClose {
    /// Parse a bus message; `None` if `skill_id` is missing.
    pub fn parse(message: &Message) -> Option<Self> {
        Some(Self {
            skill_id: message.str_field("skill_id")?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn override_true_is_indefinite() {
        assert_eq!(
            OverrideDirective::from_value(Some(&json!(true))),
            OverrideDirective::Indefinite
        );
    }

    #[test]
    fn override_positive_int_is_timeout() {
        assert_eq!(
            OverrideDirective::from_value(Some(&json!(15))),
            OverrideDirective::TimeoutSeconds(15)
        );
    }

    #[test]
    fn ambiguous_overrides_resolve_to_absent() {
        for value in [json!(false), json!(0), json!(-5), json!("soon"), json!(null)] {
            assert_eq!(
                OverrideDirective::from_value(Some(&value)),
                OverrideDirective::Absent,
                "value {value} should be absent"
            );
        }
        assert_eq!(OverrideDirective::from_value(None), OverrideDirective::Absent);
    }

    #[test]
    fn page_shown_parses_full_payload() {
        let message = Message::new(
            events::PAGE_SHOWN,
            json!({ "source_identity": "weather-skill", "override": 20, "page": "forecast" }),
        );
        let page = PageShown::parse(&message).unwrap();
        assert_eq!(page.source_identity, "weather-skill");
        assert_eq!(page.directive, OverrideDirective::TimeoutSeconds(20));
        assert_eq!(page.page.as_deref(), Some("forecast"));
    }

    #[test]
    fn page_shown_without_source_is_malformed() {
        let message = Message::new(events::PAGE_SHOWN, json!({ "page": "forecast" }));
        assert!(PageShown::parse(&message).is_none());
    }

    #[test]
    fn force_close_requires_skill_id() {
        let message = Message::new(events::SCREEN_FORCE_CLOSE, json!({}));
        assert!(ForceClose::parse(&message).is_none());

        let message = Message::new(events::SCREEN_FORCE_CLOSE, json!({ "skill_id": "clock" }));
        assert_eq!(ForceClose::parse(&message).unwrap().skill_id, "clock");
    }

    #[test]
    fn close_idle_carries_null_when_unattributed() {
        let message = Message::close_idle(None);
        assert_eq!(message.event, events::SCREEN_CLOSE_IDLE);
        assert_eq!(message.data["skill_idle_event_id"], Value::Null);

        let message = Message::close_idle(Some("clock"));
        assert_eq!(message.data["skill_idle_event_id"], json!("clock"));
    }
}
