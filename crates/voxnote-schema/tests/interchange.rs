//! Integration tests for the voxnote-schema crate.
//!
//! These cover the interchange guarantees adapters rely on: values survive a
//! serialize/parse round trip, guidance text survives schema serialization,
//! and decoding reports the exact path of a mismatch.

use serde::Deserialize;
use voxnote_schema::{Field, Kind, ObjectSchema, Schema, SchemaError, SchemaSet, Value, ValueError};

fn cleanup_schema(guidance: &str) -> Schema {
    ObjectSchema::from_fields(
        "CleanedNote",
        [
            Field::required("title", Schema::String).with_guidance(guidance),
            Field::required("body", Schema::String),
            Field::optional("tags", Schema::array(Schema::String)),
            Field::optional("word_count", Schema::Integer),
        ],
    )
    .unwrap()
    .with_description("A cleaned-up voice note")
    .into()
}

// ═══════════════════════════════════════════════════════════════════════
//  Value round trip
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn nested_value_survives_round_trip() {
    let value = Value::object()
        .with("title", "Standup \"notes\"")
        .with("body", "line one\nline two\ttabbed \\ slash")
        .with(
            "tags",
            Value::Array(vec![Value::from("work"), Value::from("daily")]),
        )
        .with("word_count", 42i64)
        .with("ratio", 0.25f64)
        .with("draft", false)
        .with("parent", Value::Null)
        .with("meta", Value::object().with("zeta", 1i64).with("alpha", 2i64));

    let text = value.to_json();
    let parsed = Value::parse(&text).unwrap();
    assert_eq!(parsed, value);

    // Insertion order, not alphabetical.
    let Value::Object(fields) = parsed.get("meta").unwrap() else {
        panic!("expected object");
    };
    assert_eq!(fields[0].0, "zeta");
    assert_eq!(fields[1].0, "alpha");
}

#[test]
fn unicode_survives_round_trip() {
    let value = Value::object().with("body", "café ☕ ñ 日本語 \u{1F600}");
    assert_eq!(Value::parse(&value.to_json()).unwrap(), value);
}

#[test]
fn value_serde_matches_serde_json() {
    let value = Value::object().with("a", 1i64).with("b", "two");
    let via_serde = serde_json::to_string(&value).unwrap();
    assert_eq!(via_serde, value.to_json());

    let back: Value = serde_json::from_str(&via_serde).unwrap();
    assert_eq!(back, value);
}

// ═══════════════════════════════════════════════════════════════════════
//  Schema escaping
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn guidance_with_special_characters_survives_serialization() {
    let samples = [
        "Use \"double quotes\" around names",
        "Paths look like C:\\notes\\today",
        "First line\nSecond line\n\nFourth line",
        "Tabs\tand\rcarriage returns",
        "Braces { } and brackets [ ] and a trailing backslash \\",
        "",
    ];

    for guidance in samples {
        let schema = cleanup_schema(guidance);
        let text = serde_json::to_string(&schema.to_json_schema()).unwrap();

        // Multi-line guidance is one escaped token, never a raw newline.
        assert!(!text.contains('\n'), "raw newline in {text}");

        let document: serde_json::Value = serde_json::from_str(&text).unwrap();
        let parsed = Schema::from_json_schema(&document).unwrap();
        assert_eq!(parsed, schema, "guidance {guidance:?} did not survive");
    }
}

#[test]
fn schema_serde_uses_json_schema_form() {
    let schema = cleanup_schema("Title of the note");
    let json = serde_json::to_value(&schema).unwrap();
    assert_eq!(json, schema.to_json_schema());

    let back: Schema = serde_json::from_value(json).unwrap();
    assert_eq!(back, schema);
}

#[test]
fn nested_object_description_survives_serde() {
    let meta = ObjectSchema::from_fields("Meta", [Field::optional("speaker", Schema::String)])
        .unwrap()
        .with_description("inner doc");
    let schema: Schema = ObjectSchema::from_fields(
        "Note",
        [
            Field::required("meta", meta.clone().into()),
            Field::optional("entries", Schema::array(meta.into()))
                .with_guidance("One entry per speaker"),
        ],
    )
    .unwrap()
    .into();

    let text = serde_json::to_string(&schema).unwrap();
    let back: Schema = serde_json::from_str(&text).unwrap();
    assert_eq!(back, schema);
}

#[test]
fn unsupported_json_schema_is_rejected() {
    let document = serde_json::json!({
        "type": "object",
        "properties": {"when": {"type": "date"}},
    });
    let err = Schema::from_json_schema(&document).unwrap_err();
    assert_eq!(
        err,
        SchemaError::InvalidJsonSchema {
            path: "$.when".into(),
            reason: "unsupported type `date`".into(),
        }
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Decoding
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, PartialEq)]
struct CleanedNote {
    title: String,
    body: String,
    #[serde(default)]
    tags: Vec<String>,
    word_count: Option<i64>,
}

#[test]
fn decode_into_typed_value() {
    let schema = cleanup_schema("Title");
    let value = Value::parse(
        r#"{"title": "Groceries", "body": "Milk, eggs.", "tags": ["home"], "word_count": 2}"#,
    )
    .unwrap();

    let note: CleanedNote = value.decode(&schema).unwrap();
    assert_eq!(
        note,
        CleanedNote {
            title: "Groceries".into(),
            body: "Milk, eggs.".into(),
            tags: vec!["home".into()],
            word_count: Some(2),
        }
    );
}

#[test]
fn decode_reports_mismatch_path() {
    let schema = cleanup_schema("Title");
    let value = Value::parse(r#"{"title": "x", "body": "y", "tags": ["ok", false]}"#).unwrap();

    let err = value.decode::<CleanedNote>(&schema).unwrap_err();
    assert_eq!(
        err,
        ValueError::SchemaMismatch {
            path: "$.tags[1]".into(),
            expected: Kind::String,
            actual: Kind::Boolean,
        }
    );
}

#[test]
fn decode_reports_missing_required_field() {
    let schema = cleanup_schema("Title");
    let value = Value::parse(r#"{"title": "x"}"#).unwrap();

    let err = value.decode::<CleanedNote>(&schema).unwrap_err();
    assert_eq!(err, ValueError::MissingField { path: "$.body".into() });
}

#[test]
fn lenient_parse_accepts_fenced_model_output() {
    let schema = cleanup_schema("Title");
    let text = "```json\n{\"title\": \"t\", \"body\": \"b\"}\n```";
    let note: CleanedNote = Value::parse_lenient(text).unwrap().decode(&schema).unwrap();
    assert_eq!(note.title, "t");
    assert!(note.tags.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Recursive schemas
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn resolved_recursive_schema_serializes_without_refs() {
    let section: Schema = ObjectSchema::from_fields(
        "Section",
        [
            Field::required("heading", Schema::String),
            Field::optional("subsections", Schema::array(Schema::reference("Section"))),
        ],
    )
    .unwrap()
    .into();

    let mut set = SchemaSet::new();
    set.insert("Section", section).unwrap();

    let resolved = set.resolve(&Schema::reference("Section")).unwrap();
    let text = serde_json::to_string(&resolved.to_json_schema()).unwrap();
    assert!(!text.contains("$ref"));
    // Default depth of three levels of "Section".
    assert_eq!(text.matches("\"heading\":{").count(), 3);
}
