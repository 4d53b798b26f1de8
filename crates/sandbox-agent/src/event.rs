use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── TokenUsage ───────────────────────────────────────────────────────────

/// The `usage` object carried by stream-json events.
///
/// Every counter defaults to zero so a partial object still folds cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

// ─── UsageEvent ───────────────────────────────────────────────────────────

/// Where the usage counters of one event were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLocation {
    /// `event.usage` — the terminal `result` event.
    TopLevel,
    /// `event.message.usage` — intermediate `assistant` events.
    Nested,
    /// Neither location held a non-empty usage object.
    Absent,
}

/// The usage-relevant projection of one stream-json event.
///
/// Lookup order is fixed: the top-level `usage` object first, then
/// `message.usage`. The first non-empty object wins and the other location
/// is ignored, so a single event is never counted twice. No other
/// locations are consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub usage: TokenUsage,
    pub location: UsageLocation,
    /// Authoritative cumulative cost, present on terminal events.
    pub cost_usd: Option<f64>,
    /// Authoritative turn count, present on terminal events.
    pub num_turns: Option<u32>,
}

impl UsageEvent {
    /// Parse one trimmed output line. Returns `None` for anything that is
    /// not a JSON object (plain log lines, blank lines, truncated JSON).
    pub fn parse_line(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        value.is_object().then(|| Self::from_value(&value))
    }

    pub fn from_value(event: &Value) -> Self {
        let top = usage_at(event.get("usage"));
        let nested = || usage_at(event.get("message").and_then(|m| m.get("usage")));

        let (usage, location) = match top {
            Some(u) => (u, UsageLocation::TopLevel),
            None => match nested() {
                Some(u) => (u, UsageLocation::Nested),
                None => (TokenUsage::default(), UsageLocation::Absent),
            },
        };

        let cost_usd = event
            .get("cost_usd")
            .and_then(Value::as_f64)
            .or_else(|| event.get("total_cost_usd").and_then(Value::as_f64));
        let num_turns = event
            .get("num_turns")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok());

        Self {
            usage,
            location,
            cost_usd,
            num_turns,
        }
    }
}

/// A usage object counts only if it is a non-empty object whose counters
/// deserialize; `{}`, `null` and malformed shapes fall through.
fn usage_at(value: Option<&Value>) -> Option<TokenUsage> {
    let obj = value?.as_object()?;
    if obj.is_empty() {
        return None;
    }
    TokenUsage::deserialize(value?).ok()
}
