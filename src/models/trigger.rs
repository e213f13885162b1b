//! The per-object trigger map: which handlers fire on which lifecycle event.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Handler-name wildcard accepted by deletion requests.
pub const HANDLER_WILDCARD: &str = "all";

/// Reserved token selecting every trigger at once in deletion requests.
pub const ALL_TRIGGERS_TOKEN: &str = "all-triggers";

/// One of the four lifecycle events an object can bind handlers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    OnRead,
    OnWrite,
    OnDelete,
    OnTimer,
}

impl Trigger {
    pub const ALL: [Trigger; 4] = [
        Trigger::OnRead,
        Trigger::OnWrite,
        Trigger::OnDelete,
        Trigger::OnTimer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::OnRead => "on-read",
            Trigger::OnWrite => "on-write",
            Trigger::OnDelete => "on-delete",
            Trigger::OnTimer => "on-timer",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTrigger(pub String);

impl fmt::Display for UnknownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` is not a recognized trigger", self.0)
    }
}

impl std::error::Error for UnknownTrigger {}

impl FromStr for Trigger {
    type Err = UnknownTrigger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-read" => Ok(Trigger::OnRead),
            "on-write" => Ok(Trigger::OnWrite),
            "on-delete" => Ok(Trigger::OnDelete),
            "on-timer" => Ok(Trigger::OnTimer),
            other => Err(UnknownTrigger(other.to_string())),
        }
    }
}

/// Deletion target: a single trigger, or the reserved all-triggers wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTarget {
    All,
    One(Trigger),
}

impl FromStr for TriggerTarget {
    type Err = UnknownTrigger;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ALL_TRIGGERS_TOKEN {
            Ok(TriggerTarget::All)
        } else {
            s.parse().map(TriggerTarget::One)
        }
    }
}

impl fmt::Display for TriggerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerTarget::All => f.write_str(ALL_TRIGGERS_TOKEN),
            TriggerTarget::One(trigger) => trigger.fmt(f),
        }
    }
}

/// The fixed four-slot trigger map persisted per object.
///
/// Each slot is either `None` (no bindings) or an ordered list of unique
/// handler names. A map whose slots are all `None` is never persisted; the
/// registry drops the entry entirely so that "absent" keeps meaning "nothing
/// configured".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerMap {
    #[serde(rename = "on-read", default)]
    pub on_read: Option<Vec<String>>,

    #[serde(rename = "on-write", default)]
    pub on_write: Option<Vec<String>>,

    #[serde(rename = "on-delete", default)]
    pub on_delete: Option<Vec<String>>,

    #[serde(rename = "on-timer", default)]
    pub on_timer: Option<Vec<String>>,
}

impl TriggerMap {
    pub fn get(&self, trigger: Trigger) -> &Option<Vec<String>> {
        match trigger {
            Trigger::OnRead => &self.on_read,
            Trigger::OnWrite => &self.on_write,
            Trigger::OnDelete => &self.on_delete,
            Trigger::OnTimer => &self.on_timer,
        }
    }

    pub fn get_mut(&mut self, trigger: Trigger) -> &mut Option<Vec<String>> {
        match trigger {
            Trigger::OnRead => &mut self.on_read,
            Trigger::OnWrite => &mut self.on_write,
            Trigger::OnDelete => &mut self.on_delete,
            Trigger::OnTimer => &mut self.on_timer,
        }
    }

    /// Handlers bound to `trigger`, if any.
    pub fn handlers_for(&self, trigger: Trigger) -> Option<&[String]> {
        self.get(trigger).as_deref()
    }

    /// True when every slot is `None`, i.e. the map carries no bindings.
    pub fn is_all_null(&self) -> bool {
        Trigger::ALL.iter().all(|t| self.get(*t).is_none())
    }

    /// Collapse empty lists back to `None`.
    pub fn cleanup(&mut self) {
        for trigger in Trigger::ALL {
            let slot = self.get_mut(trigger);
            if slot.as_ref().is_some_and(|list| list.is_empty()) {
                *slot = None;
            }
        }
    }

    /// Header-surface form: a JSON object containing only non-null slots.
    pub fn to_public_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for trigger in Trigger::ALL {
            if let Some(handlers) = self.handlers_for(trigger) {
                map.insert(
                    trigger.as_str().to_string(),
                    serde_json::json!(handlers),
                );
            }
        }
        serde_json::Value::Object(map)
    }
}
