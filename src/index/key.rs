//! Keys and identifiers shared by all indexes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an indexed entity
pub type RecordId = i32;

/// Identity of one logical index instance: attribute name plus optional locale
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttributeKey {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    locale: Option<String>,
}

impl AttributeKey {
    /// Key of a non-localized attribute
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locale: None,
        }
    }

    /// Key of a localized attribute; the locale tag is canonicalized
    pub fn localized(name: impl Into<String>, locale: &str) -> Self {
        Self {
            name: name.into(),
            locale: Some(super::value::canonical_locale(locale)),
        }
    }

    pub fn with_locale(name: impl Into<String>, locale: Option<&str>) -> Self {
        match locale {
            Some(locale) => Self::localized(name, locale),
            None => Self::new(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn is_localized(&self) -> bool {
        self.locale.is_some()
    }

    /// Same attribute without the locale
    pub fn without_locale(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locale {
            Some(locale) => write!(f, "{}:{}", self.name, locale),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Predecessor fact of a chained record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predecessor {
    /// The record starts the chain
    Head,
    /// The record directly follows the given record
    Of(RecordId),
}

impl Predecessor {
    pub fn is_head(&self) -> bool {
        matches!(self, Predecessor::Head)
    }

    pub fn predecessor_id(&self) -> Option<RecordId> {
        match self {
            Predecessor::Head => None,
            Predecessor::Of(id) => Some(*id),
        }
    }
}

impl fmt::Display for Predecessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predecessor::Head => write!(f, "HEAD"),
            Predecessor::Of(id) => write!(f, "{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_key_display() {
        assert_eq!(AttributeKey::new("code").to_string(), "code");
        assert_eq!(AttributeKey::localized("name", "cs_cz").to_string(), "name:cs-CZ");
    }

    #[test]
    fn test_attribute_key_ordering() {
        let plain = AttributeKey::new("name");
        let localized = AttributeKey::localized("name", "en");
        assert!(plain < localized);
        assert_eq!(localized.without_locale(), plain);
    }

    #[test]
    fn test_predecessor() {
        assert!(Predecessor::Head.is_head());
        assert_eq!(Predecessor::Of(4).predecessor_id(), Some(4));
        assert_eq!(Predecessor::Head.predecessor_id(), None);
        assert_eq!(Predecessor::Of(4).to_string(), "4");
    }

    #[test]
    fn test_predecessor_serde() {
        let json = serde_json::to_string(&Predecessor::Of(3)).unwrap();
        assert_eq!(json, r#"{"of":3}"#);
        let head: Predecessor = serde_json::from_str(r#""head""#).unwrap();
        assert_eq!(head, Predecessor::Head);
    }
}
