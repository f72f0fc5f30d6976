//! Vendor JSON documents: the settings file and the adapter response.
//!
//! Settings are validated when they are parsed. A document that names an
//! unknown match kind or operator, or repeats a queue name, is rejected as a
//! whole; the cache then keeps serving its previous copy.

use crate::config::AdapterMode;
use crate::AdapterError;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashSet;

/// Account settings: the ordered queue list.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsDocument {
    /// Queues in evaluation order.
    #[serde(default)]
    pub queues: Vec<Queue>,
}

impl SettingsDocument {
    /// Parse and validate a settings document.
    pub fn from_json(json: &str) -> Result<Self, AdapterError> {
        let document: SettingsDocument = serde_json::from_str(json)
            .map_err(|e| AdapterError::InvalidSettings(format!("Failed to parse settings: {}", e)))?;
        document.validate()?;
        Ok(document)
    }

    fn validate(&self) -> Result<(), AdapterError> {
        let mut names = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(AdapterError::InvalidSettings(
                    "queue with empty name".to_string(),
                ));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(AdapterError::InvalidSettings(format!(
                    "duplicate queue name {}",
                    queue.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a queue by name.
    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.iter().find(|q| q.name == name)
    }
}

/// A queue definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    /// Unique system name.
    pub name: String,

    /// Human-readable name, used in logs.
    #[serde(default)]
    pub display_name: String,

    /// Shared signing key for passage tokens.
    #[serde(default)]
    pub secret: String,

    /// How long a passage token stays valid.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub passed_lifetime_minutes: u64,

    /// Domain for passage cookies; `None` means host-only.
    #[serde(default, deserialize_with = "non_empty_string")]
    pub cookie_domain: Option<String>,

    /// Queue server host.
    #[serde(default)]
    pub queue_server: String,

    /// Adapter server host.
    #[serde(default)]
    pub adapter_server: String,

    /// Whether the visitor's target URL is sent to the queue.
    #[serde(default = "enabled", deserialize_with = "dynamic_target_flag")]
    pub dynamic_target: bool,

    /// Per-queue override of the configured adapter mode.
    #[serde(default, alias = "adapter_mode", deserialize_with = "adapter_mode_override")]
    pub adapter_mode: Option<AdapterMode>,

    /// Rules deciding whether this queue applies to a request.
    #[serde(default)]
    pub activation: Activation,
}

impl Queue {
    /// Passed lifetime in seconds, the cookie max-age.
    pub fn passed_lifetime_seconds(&self) -> i64 {
        (self.passed_lifetime_minutes as i64).saturating_mul(60)
    }

    /// Name for log lines.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

/// Activation criteria for a queue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    /// Ordered activation rules.
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Ordered variant selectors.
    #[serde(default)]
    pub variant_rules: Vec<VariantRule>,
}

/// A labelled rule list; the first one that matches names the variant.
#[derive(Debug, Clone, Deserialize)]
pub struct VariantRule {
    /// Variant label appended to queue redirects.
    pub variant: String,

    /// Rules selecting this variant.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Which part of the request a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// URL host.
    Domain,
    /// URL path.
    Path,
    /// Query string.
    Query,
    /// A named cookie.
    Cookie,
    /// The whole URL.
    Url,
}

impl<'de> Deserialize<'de> for Component {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "Domain" => Self::Domain,
            "Path" => Self::Path,
            "Query" => Self::Query,
            "Cookie" => Self::Cookie,
            "URL" | "Url" => Self::Url,
            other => {
                tracing::warn!(component = other, "unknown rule component, matching against full URL");
                Self::Url
            }
        })
    }
}

/// How a rule compares its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MatchKind {
    /// Component equals value.
    Equal,
    /// Component contains value.
    Contain,
    /// Component is present and non-empty.
    Exist,
}

/// How a rule combines with the running result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum Operator {
    /// Both must hold.
    #[default]
    And,
    /// Either may hold.
    Or,
}

/// A single activation condition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Request component inspected.
    pub component: Component,

    /// Cookie name for `Component::Cookie`.
    #[serde(default)]
    pub name: Option<String>,

    /// Comparison kind.
    #[serde(rename = "match")]
    pub match_kind: MatchKind,

    /// Value compared against the component.
    #[serde(default, deserialize_with = "string_or_empty")]
    pub value: String,

    /// Compare without case folding.
    #[serde(default)]
    pub case_sensitive: bool,

    /// Invert the result.
    #[serde(default)]
    pub negate: bool,

    /// Combination with preceding rules; ignored on the first rule.
    #[serde(default, deserialize_with = "operator_or_and")]
    pub operator: Operator,
}

/// Adapter server decision for one visitor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    /// Visitor identifier assigned by the vendor.
    #[serde(default, deserialize_with = "lenient_string")]
    pub uid: Option<String>,

    /// Lifetime of the visitor store cookie.
    #[serde(default, deserialize_with = "lenient_u64")]
    pub cookie_seconds: u64,

    /// `SendToQueue` or a pass action.
    #[serde(default)]
    pub action: Option<String>,

    /// Queue page URL for `SendToQueue`.
    #[serde(default)]
    pub location: Option<String>,

    /// Queue the pass applies to.
    #[serde(default)]
    pub queue: Option<String>,

    /// URL-encoded passage token for a pass.
    #[serde(default)]
    pub validation: Option<String>,
}

/// Action value that diverts the visitor.
pub const SEND_TO_QUEUE: &str = "SendToQueue";

impl AdapterResponse {
    /// Whether the adapter wants the visitor in the queue.
    pub fn sends_to_queue(&self) -> bool {
        self.action.as_deref() == Some(SEND_TO_QUEUE)
    }
}

/// Parse an adapter response body.
pub fn parse_adapter_response(body: &str) -> Result<AdapterResponse, AdapterError> {
    serde_json::from_str(body)
        .map_err(|e| AdapterError::Protocol(format!("Failed to parse adapter response: {}", e)))
}

fn enabled() -> bool {
    true
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    use serde::de::Error;
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| D::Error::custom(format!("expected a non-negative number, got {}", n))),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| D::Error::custom(format!("expected a number, got {:?}", s))),
        other => Err(D::Error::custom(format!("expected a number, got {}", other))),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn string_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn operator_or_and<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Operator, D::Error> {
    Ok(Option::<Operator>::deserialize(deserializer)?.unwrap_or_default())
}

fn non_empty_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.trim().is_empty()))
}

fn dynamic_target_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::String(s) => s != "disabled",
        _ => true,
    })
}

fn adapter_mode_override<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<AdapterMode>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|mode| {
        let parsed = AdapterMode::parse(&mode);
        if parsed.is_none() && !mode.is_empty() {
            tracing::warn!(mode = %mode, "unknown queue adapter mode, using configured default");
        }
        parsed
    }))
}
