use std::fmt;

use serde::{Deserialize, Serialize};

/// Composite cache key: entity type, optional scope (e.g. clinic id) and entity id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub id: String,
}

impl CacheKey {
    pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            scope: None,
            id: id.into(),
        }
    }

    pub fn scoped(
        entity: impl Into<String>,
        scope: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            scope: Some(scope.into()),
            id: id.into(),
        }
    }

    /// Same entity and scope, different id (temp-id promotion).
    pub fn with_id(&self, id: impl Into<String>) -> Self {
        Self {
            entity: self.entity.clone(),
            scope: self.scope.clone(),
            id: id.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}/{}/{}", self.entity, scope, self.id),
            None => write!(f, "{}/{}", self.entity, self.id),
        }
    }
}

/// Field-wise key matcher; `None` fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPattern {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

impl KeyPattern {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.into()),
            ..Self::default()
        }
    }

    pub fn in_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn exact(key: &CacheKey) -> Self {
        Self {
            entity: Some(key.entity.clone()),
            scope: key.scope.clone(),
            id: Some(key.id.clone()),
        }
    }

    /// Parse `entity`, `entity/id` or `entity/scope/id`; any segment may be `*`.
    pub fn parse(raw: &str) -> Option<Self> {
        fn segment(s: &str) -> Option<String> {
            match s.trim() {
                "" | "*" => None,
                other => Some(other.to_string()),
            }
        }

        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            [entity] => Some(Self {
                entity: segment(entity),
                scope: None,
                id: None,
            }),
            [entity, id] => Some(Self {
                entity: segment(entity),
                scope: None,
                id: segment(id),
            }),
            [entity, scope, id] => Some(Self {
                entity: segment(entity),
                scope: segment(scope),
                id: segment(id),
            }),
            _ => None,
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        if let Some(entity) = &self.entity {
            if entity != &key.entity {
                return false;
            }
        }
        if let Some(scope) = &self.scope {
            if key.scope.as_deref() != Some(scope.as_str()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if id != &key.id {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_scope_when_present() {
        assert_eq!(CacheKey::new("patient", "p-1").to_string(), "patient/p-1");
        assert_eq!(
            CacheKey::scoped("appointment", "clinic-7", "appt-42").to_string(),
            "appointment/clinic-7/appt-42"
        );
    }

    #[test]
    fn pattern_wildcards_match_field_wise() {
        let key = CacheKey::scoped("queue", "clinic-1", "q-3");

        assert!(KeyPattern::all().matches(&key));
        assert!(KeyPattern::entity("queue").matches(&key));
        assert!(KeyPattern::entity("queue").in_scope("clinic-1").matches(&key));
        assert!(!KeyPattern::entity("queue").in_scope("clinic-2").matches(&key));
        assert!(!KeyPattern::entity("patient").matches(&key));
        assert!(KeyPattern::exact(&key).matches(&key));
        assert!(!KeyPattern::exact(&key.with_id("q-4")).matches(&key));
    }

    #[test]
    fn pattern_parse_accepts_star_segments() {
        let pattern = KeyPattern::parse("appointment/clinic-1/*").expect("valid pattern");
        assert_eq!(pattern.entity.as_deref(), Some("appointment"));
        assert_eq!(pattern.scope.as_deref(), Some("clinic-1"));
        assert_eq!(pattern.id, None);

        let pattern = KeyPattern::parse("patient/p-9").expect("valid pattern");
        assert!(pattern.matches(&CacheKey::new("patient", "p-9")));
        assert!(!pattern.matches(&CacheKey::new("patient", "p-8")));

        assert!(KeyPattern::parse("a/b/c/d").is_none());
    }
}
