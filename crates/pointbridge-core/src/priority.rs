//! BACnet-style priority arrays and winner resolution.
//!
//! A commandable point carries 16 value slots (1 = highest precedence) plus a
//! default. Resolution walks an ordered list of precedence tiers and picks the
//! first one holding a non-null value:
//!
//! | Tier | Active priority |
//! |------|-----------------|
//! | slot 1 ..= slot 16 | `"1"` ..= `"16"` |
//! | default | `"default"` |
//! | fallback (priority block only) | `"fallback"` |
//! | nothing set | `"none"` |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Number of numbered priority slots.
pub const PRIORITY_LEVELS: u8 = 16;

/// A numbered priority slot, 1 through 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PriorityLevel(u8);

impl PriorityLevel {
    /// Create a level, returning `None` outside 1..=16.
    #[must_use]
    pub fn new(level: u8) -> Option<Self> {
        (1..=PRIORITY_LEVELS).contains(&level).then_some(Self(level))
    }

    /// Numeric level.
    #[must_use]
    pub fn get(self) -> u8 {
        self.0
    }

    /// All levels from highest to lowest precedence.
    pub fn all() -> impl Iterator<Item = Self> {
        (1..=PRIORITY_LEVELS).map(Self)
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The tier that produced a resolved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ActivePriority {
    /// A numbered slot
    Level(PriorityLevel),
    /// The relinquish default
    Default,
    /// The priority block's fallback beneath the default
    Fallback,
    /// No tier holds a value
    None,
}

impl fmt::Display for ActivePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Level(level) => write!(f, "{level}"),
            Self::Default => write!(f, "default"),
            Self::Fallback => write!(f, "fallback"),
            Self::None => write!(f, "none"),
        }
    }
}

impl FromStr for ActivePriority {
    type Err = InvalidPriorityText;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "fallback" => Ok(Self::Fallback),
            "none" | "" => Ok(Self::None),
            other => other
                .parse::<u8>()
                .ok()
                .and_then(PriorityLevel::new)
                .map(Self::Level)
                .ok_or_else(|| InvalidPriorityText(other.to_string())),
        }
    }
}

impl From<ActivePriority> for String {
    fn from(value: ActivePriority) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ActivePriority {
    type Error = InvalidPriorityText;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Text that does not name a priority tier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a priority: {0}")]
pub struct InvalidPriorityText(pub String);

/// Target of a write: a numbered slot or the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePriority {
    /// Numbered slot; a null value relinquishes it
    Level(PriorityLevel),
    /// The default; a null value leaves it unchanged
    Default,
}

impl WritePriority {
    /// Parse a priority as carried in a request: `"default"`, an integer, or an
    /// integer string.
    #[must_use]
    pub fn parse(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(s) if s == "default" => Some(Self::Default),
            Value::String(s) => s
                .trim()
                .parse::<u8>()
                .ok()
                .and_then(PriorityLevel::new)
                .map(Self::Level),
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .and_then(PriorityLevel::new)
                .map(Self::Level),
            _ => None,
        }
    }
}

impl fmt::Display for WritePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Level(level) => write!(f, "{level}"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// One precedence tier offered to [`resolve`].
#[derive(Debug, Clone, Copy)]
pub struct Tier<'a> {
    /// Label reported when this tier wins
    pub rank: ActivePriority,
    /// Tier value; `None` and JSON null both mean "not set"
    pub value: Option<&'a Value>,
}

/// Outcome of arbitration.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Winning value, null when unresolved
    pub value: Value,
    /// Winning tier
    pub active: ActivePriority,
}

impl Resolution {
    /// Nothing set in any tier.
    #[must_use]
    pub fn unresolved() -> Self {
        Self {
            value: Value::Null,
            active: ActivePriority::None,
        }
    }

    /// Whether any tier produced a value.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.active != ActivePriority::None
    }
}

/// Pick the first tier holding a non-null value.
///
/// Tiers are scanned in the order given, so callers list them from highest to
/// lowest precedence.
#[must_use]
pub fn resolve<'a>(tiers: impl IntoIterator<Item = Tier<'a>>) -> Resolution {
    tiers
        .into_iter()
        .find_map(|tier| {
            tier.value.filter(|v| !v.is_null()).map(|v| Resolution {
                value: v.clone(),
                active: tier.rank,
            })
        })
        .unwrap_or_else(Resolution::unresolved)
}

/// The 16 numbered slots, keyed by level. Unset slots are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PriorityArray(BTreeMap<u8, Value>);

impl PriorityArray {
    /// Create an array with every slot relinquished.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Value commanded at `level`, if any.
    #[must_use]
    pub fn get(&self, level: PriorityLevel) -> Option<&Value> {
        self.0.get(&level.get()).filter(|v| !v.is_null())
    }

    /// Command `level`; a null value relinquishes the slot.
    pub fn set(&mut self, level: PriorityLevel, value: Value) {
        if value.is_null() {
            self.0.remove(&level.get());
        } else {
            self.0.insert(level.get(), value);
        }
    }

    /// Relinquish every slot.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Slots as precedence tiers, highest first.
    pub fn tiers(&self) -> impl Iterator<Item = Tier<'_>> {
        PriorityLevel::all().map(|level| Tier {
            rank: ActivePriority::Level(level),
            value: self.get(level),
        })
    }

    /// Check whether no slot is commanded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        PriorityLevel::all().all(|level| self.get(level).is_none())
    }
}

/// Point metadata stored next to the priority array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointMetadata {
    /// Declared JSON type of the value (`number`, `string`, `boolean`, `object`)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
    /// Time of the last accepted write
    #[serde(default)]
    pub last_set: Option<DateTime<Utc>>,
}

/// Priority-arbitrated state of a networked point.
///
/// `value` and `active_priority` are derived fields: every mutation goes
/// through a method that re-runs arbitration before returning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityState {
    #[serde(default)]
    value: Value,
    active_priority: ActivePriority,
    #[serde(default)]
    default_value: Value,
    #[serde(default)]
    priority: PriorityArray,
    #[serde(default)]
    metadata: PointMetadata,
}

impl PriorityState {
    /// Fresh state with only a default value.
    #[must_use]
    pub fn new(default_value: Value, value_type: Option<String>) -> Self {
        let mut state = Self {
            value: Value::Null,
            active_priority: ActivePriority::None,
            default_value,
            priority: PriorityArray::new(),
            metadata: PointMetadata {
                value_type,
                last_set: None,
            },
        };
        state.rearbitrate();
        state
    }

    /// Resolved value, null when unresolved.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Tier that produced [`value`](Self::value).
    #[must_use]
    pub fn active_priority(&self) -> ActivePriority {
        self.active_priority
    }

    /// Relinquish default.
    #[must_use]
    pub fn default_value(&self) -> &Value {
        &self.default_value
    }

    /// Numbered slots.
    #[must_use]
    pub fn priority(&self) -> &PriorityArray {
        &self.priority
    }

    /// Stored metadata.
    #[must_use]
    pub fn metadata(&self) -> &PointMetadata {
        &self.metadata
    }

    /// Arbitrate slots and default without touching stored fields.
    #[must_use]
    pub fn resolution(&self) -> Resolution {
        resolve(self.tiers())
    }

    /// Whether the derived fields agree with the slots and default.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let resolution = self.resolution();
        resolution.value == self.value && resolution.active == self.active_priority
    }

    /// Apply a write and re-arbitrate.
    ///
    /// A null value relinquishes a numbered slot but leaves the default as is.
    pub fn apply(&mut self, priority: WritePriority, value: Value, now: DateTime<Utc>) {
        match priority {
            WritePriority::Default => {
                if !value.is_null() {
                    self.default_value = value;
                }
            }
            WritePriority::Level(level) => self.priority.set(level, value),
        }
        self.metadata.last_set = Some(now);
        self.rearbitrate();
    }

    /// Clear the default value (not reachable through a write) and re-arbitrate.
    pub fn clear_default(&mut self) {
        self.default_value = Value::Null;
        self.rearbitrate();
    }

    /// Recompute `value` and `active_priority`.
    pub fn rearbitrate(&mut self) {
        let Resolution { value, active } = self.resolution();
        self.value = value;
        self.active_priority = active;
    }

    fn tiers(&self) -> impl Iterator<Item = Tier<'_>> {
        self.priority.tiers().chain(std::iter::once(Tier {
            rank: ActivePriority::Default,
            value: Some(&self.default_value),
        }))
    }
}

/// Non-networked priority block: slots, default, and a fallback tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityBlock {
    slots: PriorityArray,
    default_value: Value,
    fallback: Option<Value>,
}

impl PriorityBlock {
    /// Block with an optional fallback beneath the default.
    #[must_use]
    pub fn new(fallback: Option<Value>) -> Self {
        Self {
            fallback,
            ..Self::default()
        }
    }

    /// Command a slot (null relinquishes) or replace the default.
    pub fn set(&mut self, priority: WritePriority, value: Value) {
        match priority {
            WritePriority::Level(level) => self.slots.set(level, value),
            WritePriority::Default => self.default_value = value,
        }
    }

    /// Replace the fallback tier.
    pub fn set_fallback(&mut self, value: Option<Value>) {
        self.fallback = value;
    }

    /// Relinquish every slot and the default, keeping the fallback.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.default_value = Value::Null;
    }

    /// Current winner.
    #[must_use]
    pub fn resolve(&self) -> Resolution {
        let default = Tier {
            rank: ActivePriority::Default,
            value: Some(&self.default_value),
        };
        let fallback = self.fallback.as_ref().map(|value| Tier {
            rank: ActivePriority::Fallback,
            value: Some(value),
        });
        resolve(
            self.slots
                .tiers()
                .chain(std::iter::once(default))
                .chain(fallback),
        )
    }
}

/// JSON type name of a value, as compared against [`PointMetadata::value_type`].
#[must_use]
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Null | Value::Array(_) | Value::Object(_) => "object",
    }
}
