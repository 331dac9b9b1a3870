//! ActivityStreams documents
//!
//! The vocabulary itself is opaque to this crate. `ASObject` wraps a
//! compacted JSON-LD object and gives predicate-level access where every
//! predicate is treated as an ordered list of values: a single value and a
//! one-element array read the same way.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The public-addressing sentinel collection.
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// JSON-LD context attached to documents leaving the server.
pub const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Accepted spellings of [`PUBLIC_COLLECTION`].
pub const PUBLIC_ALIASES: [&str; 3] = [PUBLIC_COLLECTION, "as:Public", "Public"];

/// Addressing predicates considered when delivering.
pub const ADDRESSING: [&str; 5] = ["to", "bto", "cc", "bcc", "audience"];

/// Predicates that make up an object's audience.
pub const AUDIENCE: [&str; 7] = ["to", "bto", "cc", "bcc", "audience", "attributedTo", "actor"];

/// Activity types recognised when deciding whether a submitted object
/// needs to be wrapped in a `Create`.
pub const ACTIVITY_TYPES: [&str; 29] = [
    "Activity",
    "IntransitiveActivity",
    "Accept",
    "Add",
    "Announce",
    "Arrive",
    "Block",
    "Create",
    "Delete",
    "Dislike",
    "Flag",
    "Follow",
    "Ignore",
    "Invite",
    "Join",
    "Leave",
    "Like",
    "Listen",
    "Move",
    "Offer",
    "Reject",
    "Read",
    "Remove",
    "TentativeReject",
    "TentativeAccept",
    "Travel",
    "Undo",
    "Update",
    "View",
];

/// Actor types.
pub const ACTOR_TYPES: [&str; 5] = ["Application", "Group", "Organization", "Person", "Service"];

/// Collection types.
pub const COLLECTION_TYPES: [&str; 2] = ["Collection", "OrderedCollection"];

/// Return true for any spelling of the public collection.
pub fn is_public_address(value: &str) -> bool {
    PUBLIC_ALIASES.contains(&value)
}

/// A single ActivityStreams document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ASObject(Map<String, Value>);

impl ASObject {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap a JSON value. Non-object values are rejected.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.0
    }

    /// The document id. `None` both when absent and when explicitly null.
    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    /// True when the document carries `"id": null`, marking it transient.
    pub fn is_transient(&self) -> bool {
        matches!(self.0.get("id"), Some(Value::Null))
    }

    /// Add the ActivityStreams `@context` unless one is already present.
    pub fn with_context(mut self) -> Self {
        if !self.0.contains_key("@context") {
            self.0.insert(
                "@context".to_string(),
                Value::String(ACTIVITYSTREAMS_CONTEXT.to_string()),
            );
        }
        self
    }

    /// Drop server-private `_:` predicates at every nesting level.
    pub fn without_private(self) -> Self {
        Self(
            self.0
                .into_iter()
                .filter(|(key, _)| !key.starts_with("_:"))
                .map(|(key, value)| (key, strip_private(value)))
                .collect(),
        )
    }

    pub fn has_id_key(&self) -> bool {
        self.0.contains_key("id")
    }

    pub fn set_id(&mut self, id: &str) {
        self.0.insert("id".to_string(), Value::String(id.to_string()));
    }

    pub fn contains(&self, predicate: &str) -> bool {
        self.0.contains_key(predicate)
    }

    /// All values of a predicate, flattening a JSON array into its members.
    pub fn values(&self, predicate: &str) -> Vec<&Value> {
        match self.0.get(predicate) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(value) => vec![value],
        }
    }

    pub fn first(&self, predicate: &str) -> Option<&Value> {
        self.values(predicate).into_iter().next()
    }

    /// First value as a plain string.
    pub fn first_str(&self, predicate: &str) -> Option<&str> {
        self.first(predicate).and_then(Value::as_str)
    }

    /// Ids referenced by a predicate: bare strings or the `id` of nested objects.
    pub fn ids(&self, predicate: &str) -> Vec<String> {
        self.values(predicate)
            .into_iter()
            .filter_map(value_id)
            .map(str::to_string)
            .collect()
    }

    pub fn first_id(&self, predicate: &str) -> Option<String> {
        self.values(predicate)
            .into_iter()
            .find_map(value_id)
            .map(str::to_string)
    }

    pub fn types(&self) -> Vec<&str> {
        self.values("type")
            .into_iter()
            .filter_map(Value::as_str)
            .collect()
    }

    pub fn first_type(&self) -> Option<&str> {
        self.types().into_iter().next()
    }

    pub fn is_type(&self, kind: &str) -> bool {
        self.types().contains(&kind)
    }

    pub fn is_any_type(&self, kinds: &[&str]) -> bool {
        self.types().iter().any(|kind| kinds.contains(kind))
    }

    pub fn is_activity(&self) -> bool {
        self.is_any_type(&ACTIVITY_TYPES)
    }

    pub fn is_actor(&self) -> bool {
        self.is_any_type(&ACTOR_TYPES)
    }

    pub fn is_collection(&self) -> bool {
        self.is_any_type(&COLLECTION_TYPES)
    }

    /// Replace a predicate with a single value.
    pub fn set(&mut self, predicate: &str, value: Value) {
        self.0.insert(predicate.to_string(), value);
    }

    pub fn set_str(&mut self, predicate: &str, value: &str) {
        self.set(predicate, Value::String(value.to_string()));
    }

    /// Append a value, promoting a single value to an array.
    pub fn push(&mut self, predicate: &str, value: Value) {
        match self.0.remove(predicate) {
            None | Some(Value::Null) => {
                self.0.insert(predicate.to_string(), value);
            }
            Some(Value::Array(mut items)) => {
                items.push(value);
                self.0.insert(predicate.to_string(), Value::Array(items));
            }
            Some(existing) => {
                self.0
                    .insert(predicate.to_string(), Value::Array(vec![existing, value]));
            }
        }
    }

    pub fn remove(&mut self, predicate: &str) -> Option<Value> {
        self.0.remove(predicate)
    }

    pub fn get(&self, predicate: &str) -> Option<&Value> {
        self.0.get(predicate)
    }

    pub fn get_mut(&mut self, predicate: &str) -> Option<&mut Value> {
        self.0.get_mut(predicate)
    }

    pub fn predicates(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    /// Every id in the document's audience (`to`, `cc`, ..., `actor`).
    pub fn audience(&self) -> Vec<String> {
        AUDIENCE
            .iter()
            .flat_map(|predicate| self.ids(predicate))
            .collect()
    }

    /// True when any addressing predicate names the public collection.
    pub fn is_public(&self) -> bool {
        ADDRESSING
            .iter()
            .flat_map(|predicate| self.ids(predicate))
            .any(|id| is_public_address(&id))
    }
}

impl From<Map<String, Value>> for ASObject {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Id of a reference value: the string itself, or a nested object's `id`.
pub fn value_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map.get("id").and_then(Value::as_str),
        _ => None,
    }
}

fn strip_private(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !key.starts_with("_:"))
                .map(|(key, value)| (key, strip_private(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_private).collect()),
        other => other,
    }
}

/// Host part of a URI, lowercased.
pub fn host_of(uri: &str) -> Option<String> {
    url::Url::parse(uri)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
}

/// The URI without its fragment.
pub fn strip_fragment(uri: &str) -> &str {
    uri.split('#').next().unwrap_or(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> ASObject {
        ASObject::from_value(value).unwrap()
    }

    #[test]
    fn values_treat_single_and_array_alike() {
        let doc = object(json!({
            "to": "https://a.example/users/x",
            "cc": ["https://b.example/users/y", {"id": "https://c.example/users/z"}]
        }));

        assert_eq!(doc.ids("to"), vec!["https://a.example/users/x"]);
        assert_eq!(
            doc.ids("cc"),
            vec!["https://b.example/users/y", "https://c.example/users/z"]
        );
        assert!(doc.ids("bcc").is_empty());
    }

    #[test]
    fn push_promotes_single_value_to_array() {
        let mut doc = object(json!({"type": "Note"}));
        doc.push("type", json!("Article"));
        assert_eq!(doc.get("type"), Some(&json!(["Note", "Article"])));
    }

    #[test]
    fn transient_is_only_explicit_null() {
        assert!(object(json!({"id": null})).is_transient());
        assert!(!object(json!({"type": "Note"})).is_transient());
        assert!(!object(json!({"id": "https://a.example/1"})).is_transient());
    }

    #[test]
    fn public_detection_accepts_aliases() {
        assert!(object(json!({"cc": "as:Public"})).is_public());
        assert!(object(json!({"to": [PUBLIC_COLLECTION]})).is_public());
        assert!(!object(json!({"to": "https://a.example/users/x/followers"})).is_public());
    }

    #[test]
    fn activity_and_actor_detection() {
        assert!(object(json!({"type": "Like"})).is_activity());
        assert!(!object(json!({"type": "Note"})).is_activity());
        assert!(object(json!({"type": ["Person"]})).is_actor());
    }

    #[test]
    fn private_predicates_are_stripped_when_nested() {
        let doc = object(json!({
            "id": "https://local.example/users/alice",
            "_:blocked": "https://local.example/users/alice/blocked",
            "endpoints": { "_:secret": 1, "sharedInbox": "https://local.example/inbox" }
        }))
        .without_private();
        assert!(!doc.contains("_:blocked"));
        assert_eq!(
            doc.get("endpoints"),
            Some(&json!({ "sharedInbox": "https://local.example/inbox" }))
        );
    }

    #[test]
    fn host_of_lowercases() {
        assert_eq!(
            host_of("https://Remote.Example/users/a"),
            Some("remote.example".to_string())
        );
        assert_eq!(host_of("tag:example.com,2018:1"), None);
    }
}
