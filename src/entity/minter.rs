use crate::data::{ASObject, EntityId};

/// Allocates ids for documents submitted without one.
pub trait IdMinter: Send + Sync {
    fn mint(&self, object: &ASObject) -> String;
}

/// ULID ids under the server base URL, grouped by kind.
#[derive(Debug, Clone)]
pub struct UlidMinter {
    base_url: String,
}

impl UlidMinter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl IdMinter for UlidMinter {
    fn mint(&self, object: &ASObject) -> String {
        let kind = if object.is_activity() {
            "activities"
        } else if object.is_actor() {
            "actors"
        } else {
            "objects"
        };
        format!("{}/{}/{}", self.base_url, kind, EntityId::new().0)
    }
}
