use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The edited artifact: an ordered run of units plus document-level attributes.
///
/// `revision` starts at 0 and advances by exactly one per successful commit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub theme: Option<Value>,
    #[serde(default)]
    pub units: Vec<Unit>,
    #[serde(default)]
    pub revision: u64,
}

/// One slide or form field. `content` is opaque to the core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub index: usize,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Reference material attached to a session and appended to the system prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFile {
    pub filename: String,
    pub text: String,
}

/// An existing document whose look new content should follow. Only the
/// text form is carried; rendered screenshots of the template are not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleTemplate {
    pub filename: String,
    pub text: String,
}

impl Unit {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            index: 0,
            content: content.into(),
            layout: None,
            notes: None,
        }
    }
}

impl Document {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn unit(&self, index: usize) -> Option<&Unit> {
        self.units.get(index)
    }

    /// Rewrite every unit's `index` to its position.
    pub fn renumber(&mut self) {
        for (i, unit) in self.units.iter_mut().enumerate() {
            unit.index = i;
        }
    }

    /// True when indices are exactly `0..n-1` in order.
    pub fn is_contiguous(&self) -> bool {
        self.units.iter().enumerate().all(|(i, u)| u.index == i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(contents: &[&str]) -> Document {
        let mut doc = Document {
            units: contents.iter().map(|c| Unit::new(*c)).collect(),
            ..Default::default()
        };
        doc.renumber();
        doc
    }

    #[test]
    fn renumber_restores_contiguity() {
        let mut d = doc(&["a", "b", "c"]);
        d.units.remove(1);
        assert!(!d.is_contiguous());
        d.renumber();
        assert!(d.is_contiguous());
        assert_eq!(d.unit(1).unwrap().content, "c");
    }

    #[test]
    fn empty_document_is_contiguous() {
        let d = Document::default();
        assert!(d.is_empty());
        assert!(d.is_contiguous());
        assert_eq!(d.revision, 0);
    }

    #[test]
    fn optional_metadata_omitted_from_json() {
        let json = serde_json::to_value(Unit::new("x")).unwrap();
        assert!(json.get("layout").is_none());
        assert!(json.get("notes").is_none());
    }

    #[test]
    fn deserializes_with_missing_fields() {
        let d: Document = serde_json::from_str(r#"{"units":[{"index":0,"content":"hi"}]}"#).unwrap();
        assert_eq!(d.len(), 1);
        assert!(d.title.is_none());
        assert_eq!(d.revision, 0);
    }
}
