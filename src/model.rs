//! Record, message and key types shared by every pipeline stage.
//!
//! The orchestration core treats message payloads as opaque: it only ever
//! looks at identities, message counts, roles and key sets.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of conversational roles.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(label)
    }
}

/// One message of a conversation.
///
/// Fields other than `role`, `name` and `content` (tool-call descriptors,
/// thinking text, ...) are kept verbatim in `extra`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            name: None,
            content: Value::String(content.into()),
            extra: BTreeMap::new(),
        }
    }

    /// Keys this message carries when serialized.
    pub fn key_set(&self) -> Vec<String> {
        let mut keys = vec!["role".to_string(), "content".to_string()];
        if self.name.is_some() {
            keys.push("name".to_string());
        }
        keys.extend(self.extra.keys().cloned());
        keys.sort();
        keys
    }
}

/// Metadata key naming the treatment a record was routed to.
pub const TREATMENT_KEY: &str = "treatment";
/// Metadata key naming the engine a record was routed to.
pub const ENGINE_KEY: &str = "engine";

/// Whether `key` is one of the routing tags written during assignment.
pub fn is_route_key(key: &str) -> bool {
    key == TREATMENT_KEY || key == ENGINE_KEY
}

/// Stable identity of a record: the source it was sampled from plus its
/// original row index in that source partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    pub source: String,
    pub index: u64,
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source, self.index)
    }
}

/// One conversational item.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    pub source: String,
    pub index: u64,
    #[serde(alias = "conversations")]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Record {
    pub fn id(&self) -> RecordId {
        RecordId {
            source: self.source.clone(),
            index: self.index,
        }
    }

    pub fn roles(&self) -> Vec<Role> {
        self.messages.iter().map(|message| message.role).collect()
    }

    /// Tag the record with the combination it was routed to. Tags already
    /// present are left alone.
    pub fn tag_route(&mut self, combo: &Combo) {
        self.metadata
            .entry(TREATMENT_KEY)
            .or_insert_with(|| Value::String(combo.treatment.clone()));
        self.metadata
            .entry(ENGINE_KEY)
            .or_insert_with(|| Value::String(combo.engine.clone()));
    }
}

/// One (source, partition) pair; the unit the driver sequences stages for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchKey {
    pub source: String,
    pub partition: String,
}

impl BranchKey {
    pub fn new(source: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            partition: partition.into(),
        }
    }

    /// Composite file stem `{source}_{partition}`.
    pub fn stem(&self) -> String {
        format!("{}_{}", self.source, self.partition)
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.partition)
    }
}

/// A (treatment, engine) combination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Combo {
    pub treatment: String,
    pub engine: String,
}

impl Combo {
    pub fn new(treatment: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            treatment: treatment.into(),
            engine: engine.into(),
        }
    }
}

/// Every (treatment, engine) combination in the fixed iteration order:
/// treatments outer, engines inner.
pub fn combos(treatments: &[String], engines: &[String]) -> Vec<Combo> {
    treatments
        .iter()
        .flat_map(|treatment| {
            engines
                .iter()
                .map(move |engine| Combo::new(treatment.clone(), engine.clone()))
        })
        .collect()
}

/// The unit of work: one branch routed to one combination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub branch: BranchKey,
    pub combo: Combo,
}

impl GroupKey {
    pub fn new(branch: BranchKey, combo: Combo) -> Self {
        Self { branch, combo }
    }

    pub fn treatment(&self) -> &str {
        &self.combo.treatment
    }

    pub fn engine(&self) -> &str {
        &self.combo.engine
    }

    /// Composite file stem `{source}_{partition}_{treatment}_{engine}`.
    pub fn stem(&self) -> String {
        format!(
            "{}_{}_{}",
            self.branch.stem(),
            self.combo.treatment,
            safe_component(&self.combo.engine)
        )
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}/{}]",
            self.branch, self.combo.treatment, self.combo.engine
        )
    }
}

/// Filesystem-safe version of an identifier used in artifact names.
pub fn safe_component(name: &str) -> String {
    name.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_keeps_unknown_fields_verbatim() {
        let raw = json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{"name": "lookup", "arguments": "{}"}],
            "thinking": "hmm"
        });
        let message: Message = serde_json::from_value(raw.clone()).expect("parse message");
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(
            message.key_set(),
            vec!["content", "role", "thinking", "tool_calls"]
        );
        assert_eq!(serde_json::to_value(&message).expect("serialize"), raw);
    }

    #[test]
    fn record_accepts_conversations_alias() {
        let raw = json!({
            "source": "s",
            "index": 3,
            "conversations": [{"role": "user", "content": "hi"}]
        });
        let record: Record = serde_json::from_value(raw).expect("parse record");
        assert_eq!(record.id().to_string(), "s#3");
        assert_eq!(record.roles(), vec![Role::User]);
        assert!(record.metadata.is_empty());
    }

    #[test]
    fn route_tags_do_not_overwrite_existing_values() {
        let mut record = Record {
            source: "s".to_string(),
            index: 0,
            messages: Vec::new(),
            metadata: Default::default(),
        };
        record
            .metadata
            .insert(ENGINE_KEY.to_string(), json!("pinned"));
        record.tag_route(&Combo::new("a", "kit.x"));
        assert_eq!(record.metadata[TREATMENT_KEY], json!("a"));
        assert_eq!(record.metadata[ENGINE_KEY], json!("pinned"));
        assert!(is_route_key("engine"));
        assert!(!is_route_key("topic"));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let raw = json!({"role": "narrator", "content": "x"});
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }

    #[test]
    fn group_stem_sanitizes_engine() {
        let key = GroupKey::new(
            BranchKey::new("deepa2-folly-thinking", "train"),
            Combo::new("a", "org/model-x"),
        );
        assert_eq!(key.stem(), "deepa2-folly-thinking_train_a_org-model-x");
    }

    #[test]
    fn combos_iterate_treatments_outer() {
        let list = combos(
            &["a".to_string(), "b".to_string()],
            &["x".to_string(), "y".to_string()],
        );
        let labels: Vec<String> = list
            .iter()
            .map(|c| format!("{}{}", c.treatment, c.engine))
            .collect();
        assert_eq!(labels, vec!["ax", "ay", "bx", "by"]);
    }
}
