//! Typed canvas records.
//!
//! On the wire and in the replicated document a record is a flat bag of
//! fields: `id`, `type`, the placement fields and the per-type props in
//! camelCase. Here it is a [`Record`] whose [`Shape`] is chosen by `type`.
//! Converting from fields is the validation step for anything that arrives
//! from a peer: unknown types and mistyped props are rejected, missing props
//! fall back to their defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

use crate::error::CrdtError;

pub type RecordId = SmolStr;

/// Flat field map of one record.
pub type Fields = serde_json::Map<String, Value>;

/// Editor-only state that never leaves this replica.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalState {
    /// The record is open in an inline editor.
    pub editing: bool,
}

/// One shape on the canvas.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub x: f64,
    pub y: f64,
    pub rotation: f64,
    pub shape: Shape,
    pub local: LocalState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Todo(TodoProps),
    Note(NoteProps),
    Geo(GeoProps),
    Draw(DrawProps),
    Text(TextProps),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

/// A task card, optionally linked to a backend task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TodoProps {
    pub w: f64,
    pub h: f64,
    pub title: String,
    pub completed: bool,
    /// ISO date string
    pub due_date: Option<String>,
    pub assignee_id: Option<i64>,
    pub assignee_name: Option<String>,
    pub priority: Priority,
    /// Backend task id once the card has been created server-side.
    pub backend_id: Option<i64>,
    pub list_id: Option<i64>,
}

impl Default for TodoProps {
    fn default() -> Self {
        Self {
            w: 280.0,
            h: 100.0,
            title: "New Task".to_owned(),
            completed: false,
            due_date: None,
            assignee_id: None,
            assignee_name: None,
            priority: Priority::Medium,
            backend_id: None,
            list_id: None,
        }
    }
}

impl TodoProps {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn is_linked(&self) -> bool {
        self.backend_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NoteProps {
    pub text: String,
    pub color: String,
}

impl Default for NoteProps {
    fn default() -> Self {
        Self {
            text: String::new(),
            color: "yellow".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeoKind {
    #[default]
    Rectangle,
    Ellipse,
    Triangle,
    Diamond,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GeoProps {
    pub geo: GeoKind,
    pub w: f64,
    pub h: f64,
    pub color: String,
    pub text: String,
}

impl Default for GeoProps {
    fn default() -> Self {
        Self {
            geo: GeoKind::Rectangle,
            w: 100.0,
            h: 100.0,
            color: "black".to_owned(),
            text: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// Freehand stroke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DrawProps {
    pub points: Vec<Point>,
    pub color: String,
    pub is_complete: bool,
}

impl Default for DrawProps {
    fn default() -> Self {
        Self {
            points: Vec::new(),
            color: "black".to_owned(),
            is_complete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextProps {
    pub text: String,
    pub color: String,
    pub w: f64,
}

impl Default for TextProps {
    fn default() -> Self {
        Self {
            text: String::new(),
            color: "black".to_owned(),
            w: 8.0,
        }
    }
}

const PLACEMENT: [&str; 3] = ["x", "y", "rotation"];

impl Record {
    pub fn new(id: impl Into<RecordId>, shape: Shape) -> Self {
        Self {
            id: id.into(),
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            shape,
            local: LocalState::default(),
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn todo(id: impl Into<RecordId>, props: TodoProps) -> Self {
        Self::new(id, Shape::Todo(props))
    }

    pub fn note(id: impl Into<RecordId>, text: impl Into<String>) -> Self {
        Self::new(
            id,
            Shape::Note(NoteProps {
                text: text.into(),
                ..Default::default()
            }),
        )
    }

    /// The `type` tag.
    pub fn type_name(&self) -> &'static str {
        match self.shape {
            Shape::Todo(_) => "todo",
            Shape::Note(_) => "note",
            Shape::Geo(_) => "geo",
            Shape::Draw(_) => "draw",
            Shape::Text(_) => "text",
        }
    }

    pub fn as_todo(&self) -> Option<&TodoProps> {
        match &self.shape {
            Shape::Todo(props) => Some(props),
            _ => None,
        }
    }

    pub fn as_todo_mut(&mut self) -> Option<&mut TodoProps> {
        match &mut self.shape {
            Shape::Todo(props) => Some(props),
            _ => None,
        }
    }

    /// Equality over replicated content only, ignoring [`LocalState`].
    pub fn content_eq(&self, other: &Record) -> bool {
        self.id == other.id
            && self.x == other.x
            && self.y == other.y
            && self.rotation == other.rotation
            && self.shape == other.shape
    }

    /// Flatten into the field map stored in the replicated document.
    pub fn to_fields(&self) -> Result<Fields, CrdtError> {
        let mut fields = match serde_json::to_value(&self.shape) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(self.invalid(format!("shape serialised to non-object {other}")));
            }
            Err(e) => return Err(self.invalid(e.to_string())),
        };
        fields.insert("id".to_owned(), Value::String(self.id.to_string()));
        fields.insert("x".to_owned(), Value::from(self.x));
        fields.insert("y".to_owned(), Value::from(self.y));
        fields.insert("rotation".to_owned(), Value::from(self.rotation));
        Ok(fields)
    }

    /// Validate a field map and build the typed record.
    pub fn from_fields(id: &str, fields: &Fields) -> Result<Self, CrdtError> {
        let invalid = |message: String| CrdtError::InvalidRecord {
            id: id.to_owned(),
            message,
        };

        let placement = |key: &str| -> Result<f64, CrdtError> {
            match fields.get(key) {
                None | Some(Value::Null) => Ok(0.0),
                Some(value) => value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("{key} is not a number"))),
            }
        };
        let x = placement("x")?;
        let y = placement("y")?;
        let rotation = placement("rotation")?;

        match fields.get("type") {
            Some(Value::String(_)) => {}
            Some(_) => return Err(invalid("type is not a string".to_owned())),
            None => return Err(invalid("missing type".to_owned())),
        }

        let props: Fields = fields
            .iter()
            .filter(|(key, _)| key.as_str() != "id" && !PLACEMENT.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let shape: Shape =
            serde_json::from_value(Value::Object(props)).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            id: RecordId::new(id),
            x,
            y,
            rotation,
            shape,
            local: LocalState::default(),
        })
    }

    fn invalid(&self, message: String) -> CrdtError {
        CrdtError::InvalidRecord {
            id: self.id.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_todo_defaults() {
        let props = TodoProps::default();
        assert_eq!(props.w, 280.0);
        assert_eq!(props.h, 100.0);
        assert_eq!(props.title, "New Task");
        assert_eq!(props.priority, Priority::Medium);
        assert!(!props.is_linked());
    }

    #[test]
    fn test_fields_are_flat_and_camel_case() {
        let mut props = TodoProps::titled("Ship it");
        props.backend_id = Some(12);
        let record = Record::todo("shape:1", props).at(10.0, 20.0);

        let fields = record.to_fields().unwrap();
        assert_eq!(fields["type"], json!("todo"));
        assert_eq!(fields["id"], json!("shape:1"));
        assert_eq!(fields["x"], json!(10.0));
        assert_eq!(fields["title"], json!("Ship it"));
        assert_eq!(fields["backendId"], json!(12));
        assert_eq!(fields["dueDate"], json!(null));
    }

    #[test]
    fn test_missing_props_are_coerced_to_defaults() {
        let record = Record::from_fields(
            "a",
            &fields(json!({"id": "a", "type": "todo", "title": "Only a title"})),
        )
        .unwrap();

        let todo = record.as_todo().unwrap();
        assert_eq!(todo.title, "Only a title");
        assert_eq!(todo.w, 280.0);
        assert_eq!(record.x, 0.0);
    }

    #[test]
    fn test_note_from_minimal_payload() {
        let record =
            Record::from_fields("a", &fields(json!({"type": "note", "text": "hi"}))).unwrap();
        assert_eq!(record.type_name(), "note");
        assert!(matches!(&record.shape, Shape::Note(n) if n.text == "hi"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Record::from_fields("a", &fields(json!({"type": "video"}))).unwrap_err();
        assert!(matches!(err, CrdtError::InvalidRecord { .. }));
    }

    #[test]
    fn test_missing_type_rejected() {
        assert!(Record::from_fields("a", &fields(json!({"x": 1.0}))).is_err());
    }

    #[test]
    fn test_mistyped_prop_rejected() {
        let payload = fields(json!({"type": "todo", "completed": "yes"}));
        assert!(Record::from_fields("a", &payload).is_err());

        let payload = fields(json!({"type": "todo", "priority": "urgent"}));
        assert!(Record::from_fields("a", &payload).is_err());

        let payload = fields(json!({"type": "note", "x": "left"}));
        assert!(Record::from_fields("a", &payload).is_err());
    }

    #[test]
    fn test_unknown_props_ignored() {
        let payload = fields(json!({"type": "geo", "geo": "ellipse", "opacity": 0.5}));
        let record = Record::from_fields("g", &payload).unwrap();
        assert!(matches!(&record.shape, Shape::Geo(g) if g.geo == GeoKind::Ellipse));
    }

    #[test]
    fn test_field_map_round_trip_preserves_content() {
        let mut record = Record::new(
            "d",
            Shape::Draw(DrawProps {
                points: vec![Point { x: 1.0, y: 2.0 }, Point { x: 3.5, y: 4.0 }],
                ..Default::default()
            }),
        )
        .at(5.0, 6.0);
        record.rotation = 0.25;

        let back = Record::from_fields("d", &record.to_fields().unwrap()).unwrap();
        assert!(back.content_eq(&record));
    }

    #[test]
    fn test_content_eq_ignores_local_state() {
        let a = Record::note("n", "x");
        let mut b = a.clone();
        b.local.editing = true;
        assert!(a.content_eq(&b));
        assert_ne!(a, b);
    }
}
