//! Edit capabilities: what each operation accepts, how it previews, and how
//! it is applied to a document during commit.
//!
//! Operations are open-ended strings. A form-filling deployment can register
//! its own capability next to the built-in slide operations.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use folio_core::document::{Document, Unit};
use folio_core::edits::{Operation, PendingEdit};
use folio_core::ids::EditId;

/// How an operation addresses the document.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetScope {
    /// Targets an existing committed unit by index.
    Unit,
    /// Inserts at a position. A missing position appends.
    Insert,
    /// Whole-document attribute. Any index is ignored.
    Document,
}

/// Where a unit in a commit scratch copy came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitOrigin {
    /// Index in the last committed document.
    Committed(usize),
    /// Added by this staged edit.
    Staged(EditId),
}

/// Working copy of a document while a commit is applied.
///
/// Units carry their origin so a unit-scoped edit can find the unit it was
/// staged against even after earlier edits shifted positions.
pub struct Scratch {
    pub title: Option<String>,
    pub theme: Option<Value>,
    units: Vec<(UnitOrigin, Unit)>,
}

impl Scratch {
    pub fn from_document(doc: &Document) -> Self {
        Self {
            title: doc.title.clone(),
            theme: doc.theme.clone(),
            units: doc
                .units
                .iter()
                .enumerate()
                .map(|(i, u)| (UnitOrigin::Committed(i), u.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Current position of a unit, or `None` if it has been removed.
    pub fn position_of(&self, origin: &UnitOrigin) -> Option<usize> {
        self.units.iter().position(|(o, _)| o == origin)
    }

    pub fn unit_mut(&mut self, position: usize) -> Option<&mut Unit> {
        self.units.get_mut(position).map(|(_, u)| u)
    }

    pub fn insert(&mut self, position: usize, origin: UnitOrigin, unit: Unit) -> Result<(), String> {
        if position > self.units.len() {
            return Err(format!(
                "position {position} is past the end of {} units",
                self.units.len()
            ));
        }
        self.units.insert(position, (origin, unit));
        Ok(())
    }

    /// Drop every unit, committed or staged.
    pub fn clear(&mut self) {
        self.units.clear();
    }

    pub fn remove(&mut self, position: usize) -> Result<(UnitOrigin, Unit), String> {
        if position >= self.units.len() {
            return Err(format!("no unit at position {position}"));
        }
        Ok(self.units.remove(position))
    }

    /// Finish the commit: renumber and stamp the new revision.
    pub fn into_document(self, revision: u64) -> Document {
        let mut doc = Document {
            title: self.title,
            theme: self.theme,
            units: self.units.into_iter().map(|(_, u)| u).collect(),
            revision,
        };
        doc.renumber();
        doc
    }
}

/// One edit operation the ledger knows how to stage and apply.
pub trait EditCapability: Send + Sync {
    fn operation(&self) -> &str;

    fn scope(&self) -> TargetScope;

    /// True when applying this edit removes every unit. Later edits in the
    /// same commit then see an empty document.
    fn resets_units(&self) -> bool {
        false
    }

    /// Check params at staging time. The message becomes `InvalidOperation`.
    fn validate(&self, params: &Value) -> Result<(), String>;

    /// Check params that refer to positions. `unit_count` is the committed
    /// unit count plus pending inserts. The message becomes `InvalidTarget`.
    fn check_bounds(&self, _params: &Value, _unit_count: usize) -> Result<(), String> {
        Ok(())
    }

    /// Human-readable one-liner for review.
    fn preview(&self, unit_index: Option<usize>, params: &Value) -> String;

    /// Apply to the scratch copy. `position` is the unit's current scratch
    /// position for `Unit` scope, the insert position for `Insert` scope, and
    /// `None` for `Document` scope. The message becomes `CommitConflict`.
    fn apply(
        &self,
        scratch: &mut Scratch,
        position: Option<usize>,
        edit: &PendingEdit,
    ) -> Result<(), String>;
}

/// Registered capabilities keyed by operation name.
pub struct CapabilitySet {
    caps: HashMap<String, Arc<dyn EditCapability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self {
            caps: HashMap::new(),
        }
    }

    /// The slide-deck operations: CREATE, ADD, UPDATE, DELETE, REORDER,
    /// SET_THEME and SET_TITLE.
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(CreateDocument));
        set.register(Arc::new(AddUnit));
        set.register(Arc::new(UpdateUnit));
        set.register(Arc::new(DeleteUnit));
        set.register(Arc::new(ReorderUnits));
        set.register(Arc::new(SetTheme));
        set.register(Arc::new(SetTitle));
        set
    }

    pub fn register(&mut self, cap: Arc<dyn EditCapability>) {
        self.caps.insert(cap.operation().to_string(), cap);
    }

    pub fn get(&self, operation: &Operation) -> Option<Arc<dyn EditCapability>> {
        self.caps.get(operation.as_str()).cloned()
    }
}

impl Default for CapabilitySet {
    fn default() -> Self {
        Self::builtin()
    }
}

fn opt_str(params: &Value, key: &str) -> Result<Option<String>, String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(format!("'{key}' must be a string, got {other}")),
    }
}

fn require_position(position: Option<usize>, op: &str) -> Result<usize, String> {
    position.ok_or_else(|| format!("{op} needs a target unit"))
}

/// Short single-line excerpt of unit content for previews.
fn excerpt(content: &str, max: usize) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    }
}

struct AddUnit;

impl EditCapability for AddUnit {
    fn operation(&self) -> &str {
        Operation::ADD
    }

    fn scope(&self) -> TargetScope {
        TargetScope::Insert
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        if opt_str(params, "content")?.is_none() {
            return Err("'content' is required".into());
        }
        opt_str(params, "layout")?;
        opt_str(params, "notes")?;
        Ok(())
    }

    fn preview(&self, unit_index: Option<usize>, params: &Value) -> String {
        let content = params["content"].as_str().unwrap_or_default();
        match unit_index {
            Some(i) => format!("Add unit at position {}: {}", i + 1, excerpt(content, 40)),
            None => format!("Add unit: {}", excerpt(content, 40)),
        }
    }

    fn apply(
        &self,
        scratch: &mut Scratch,
        position: Option<usize>,
        edit: &PendingEdit,
    ) -> Result<(), String> {
        let position = position.unwrap_or(scratch.len());
        let unit = Unit {
            index: position,
            content: opt_str(&edit.params, "content")?.unwrap_or_default(),
            layout: opt_str(&edit.params, "layout")?,
            notes: opt_str(&edit.params, "notes")?,
        };
        scratch.insert(position, UnitOrigin::Staged(edit.edit_id.clone()), unit)
    }
}

struct UpdateUnit;

impl EditCapability for UpdateUnit {
    fn operation(&self) -> &str {
        Operation::UPDATE
    }

    fn scope(&self) -> TargetScope {
        TargetScope::Unit
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        let content = opt_str(params, "content")?;
        let layout = opt_str(params, "layout")?;
        let notes = opt_str(params, "notes")?;
        if content.is_none() && layout.is_none() && notes.is_none() {
            return Err("nothing to update: give content, layout or notes".into());
        }
        Ok(())
    }

    fn preview(&self, unit_index: Option<usize>, _params: &Value) -> String {
        format!("Update unit {}", unit_index.map_or(0, |i| i + 1))
    }

    fn apply(
        &self,
        scratch: &mut Scratch,
        position: Option<usize>,
        edit: &PendingEdit,
    ) -> Result<(), String> {
        let position = require_position(position, Operation::UPDATE)?;
        let unit = scratch
            .unit_mut(position)
            .ok_or_else(|| format!("no unit at position {position}"))?;
        if let Some(content) = opt_str(&edit.params, "content")? {
            unit.content = content;
        }
        if let Some(layout) = opt_str(&edit.params, "layout")? {
            unit.layout = Some(layout);
        }
        if let Some(notes) = opt_str(&edit.params, "notes")? {
            unit.notes = Some(notes);
        }
        Ok(())
    }
}

struct DeleteUnit;

impl EditCapability for DeleteUnit {
    fn operation(&self) -> &str {
        Operation::DELETE
    }

    fn scope(&self) -> TargetScope {
        TargetScope::Unit
    }

    fn validate(&self, _params: &Value) -> Result<(), String> {
        Ok(())
    }

    fn preview(&self, unit_index: Option<usize>, _params: &Value) -> String {
        format!("Delete unit {}", unit_index.map_or(0, |i| i + 1))
    }

    fn apply(
        &self,
        scratch: &mut Scratch,
        position: Option<usize>,
        _edit: &PendingEdit,
    ) -> Result<(), String> {
        let position = require_position(position, Operation::DELETE)?;
        scratch.remove(position).map(|_| ())
    }
}

struct ReorderUnits;

impl ReorderUnits {
    fn to_index(params: &Value) -> Result<usize, String> {
        params
            .get("to_index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .ok_or_else(|| "'to_index' must be a non-negative integer".to_string())
    }
}

impl EditCapability for ReorderUnits {
    fn operation(&self) -> &str {
        Operation::REORDER
    }

    fn scope(&self) -> TargetScope {
        TargetScope::Unit
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        Self::to_index(params).map(|_| ())
    }

    fn check_bounds(&self, params: &Value, unit_count: usize) -> Result<(), String> {
        let to = Self::to_index(params)?;
        if to >= unit_count {
            return Err(format!("to_index {to} out of range ({unit_count} units)"));
        }
        Ok(())
    }

    fn preview(&self, unit_index: Option<usize>, params: &Value) -> String {
        let to = Self::to_index(params).unwrap_or_default();
        format!(
            "Move unit {} to position {}",
            unit_index.map_or(0, |i| i + 1),
            to + 1
        )
    }

    fn apply(
        &self,
        scratch: &mut Scratch,
        position: Option<usize>,
        edit: &PendingEdit,
    ) -> Result<(), String> {
        let from = require_position(position, Operation::REORDER)?;
        let to = Self::to_index(&edit.params)?;
        if to >= scratch.len() {
            return Err(format!(
                "target position {to} is past the end of {} units",
                scratch.len()
            ));
        }
        let (origin, unit) = scratch.remove(from)?;
        scratch.insert(to, origin, unit)
    }
}

struct SetTheme;

impl EditCapability for SetTheme {
    fn operation(&self) -> &str {
        Operation::SET_THEME
    }

    fn scope(&self) -> TargetScope {
        TargetScope::Document
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        match params.get("theme") {
            Some(Value::Object(_)) => Ok(()),
            _ => Err("'theme' must be an object".into()),
        }
    }

    fn preview(&self, _unit_index: Option<usize>, params: &Value) -> String {
        let keys: Vec<&str> = params["theme"]
            .as_object()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default();
        if keys.is_empty() {
            "Set theme".to_string()
        } else {
            format!("Set theme ({})", keys.join(", "))
        }
    }

    fn apply(
        &self,
        scratch: &mut Scratch,
        _position: Option<usize>,
        edit: &PendingEdit,
    ) -> Result<(), String> {
        scratch.theme = Some(edit.params["theme"].clone());
        Ok(())
    }
}

fn require_title(params: &Value) -> Result<(), String> {
    match opt_str(params, "title")? {
        Some(t) if !t.trim().is_empty() => Ok(()),
        _ => Err("'title' must be a non-empty string".into()),
    }
}

struct CreateDocument;

impl EditCapability for CreateDocument {
    fn operation(&self) -> &str {
        Operation::CREATE
    }

    fn scope(&self) -> TargetScope {
        TargetScope::Document
    }

    fn resets_units(&self) -> bool {
        true
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        require_title(params)
    }

    fn preview(&self, _unit_index: Option<usize>, params: &Value) -> String {
        format!(
            "Start new document \"{}\"",
            excerpt(params["title"].as_str().unwrap_or_default(), 60)
        )
    }

    fn apply(
        &self,
        scratch: &mut Scratch,
        _position: Option<usize>,
        edit: &PendingEdit,
    ) -> Result<(), String> {
        scratch.clear();
        scratch.theme = None;
        scratch.title = opt_str(&edit.params, "title")?;
        Ok(())
    }
}

struct SetTitle;

impl EditCapability for SetTitle {
    fn operation(&self) -> &str {
        Operation::SET_TITLE
    }

    fn scope(&self) -> TargetScope {
        TargetScope::Document
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        require_title(params)
    }

    fn preview(&self, _unit_index: Option<usize>, params: &Value) -> String {
        format!(
            "Set title to \"{}\"",
            excerpt(params["title"].as_str().unwrap_or_default(), 60)
        )
    }

    fn apply(
        &self,
        scratch: &mut Scratch,
        _position: Option<usize>,
        edit: &PendingEdit,
    ) -> Result<(), String> {
        scratch.title = opt_str(&edit.params, "title")?;
        Ok(())
    }
}
