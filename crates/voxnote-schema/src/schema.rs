//! Declarative output schemas.
//!
//! A [`Schema`] describes the shape a model is asked to produce.  Backends
//! never see this type directly: [`Schema::to_json_schema`] renders the
//! interchange form every adapter derives its native function-calling format
//! from.
//!
//! Recursive shapes are expressed with [`Schema::Reference`] to a schema
//! registered in a [`SchemaSet`], which inlines references before anything is
//! sent to a backend.

use std::collections::BTreeMap;

use serde_json::{Value as Json, json};

use crate::error::{SchemaError, SchemaResult, ValueError, ValueResult};
use crate::value::{Kind, Value};

/// Prefix for references in the JSON Schema interchange form.
const DEFS_PREFIX: &str = "#/$defs/";

/// Legacy prefix accepted when reading JSON Schema documents.
const DEFINITIONS_PREFIX: &str = "#/definitions/";

/// Annotation holding a nested object's own description when its field's
/// guidance occupies `description`.  `null` when the object has none.
const OBJECT_DESCRIPTION_KEY: &str = "x-object-description";

/// Default number of times one named schema may be expanded along a path.
pub const DEFAULT_MAX_DEPTH: usize = 3;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// The expected shape of a structured value.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(into = "Json", try_from = "Json")]
pub enum Schema {
    String,
    Number,
    Integer,
    Boolean,
    /// A homogeneous array.
    Array(Box<Schema>),
    Object(ObjectSchema),
    /// A named schema registered in a [`SchemaSet`].
    Reference(String),
}

/// An object schema: ordered, uniquely named fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSchema {
    name: String,
    description: Option<String>,
    fields: Vec<Field>,
}

/// One field of an [`ObjectSchema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name as it appears in the generated object.
    pub name: String,
    /// Shape of the field's value.
    pub schema: Schema,
    /// Free-text guidance telling the model what to put in this field.
    pub guidance: Option<String>,
    /// Whether the field must be present.
    pub required: bool,
}

impl Field {
    /// A field that must be present.
    pub fn required(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            schema,
            guidance: None,
            required: true,
        }
    }

    /// A field that may be absent or `null`.
    pub fn optional(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            required: false,
            ..Self::required(name, schema)
        }
    }

    /// Attach guidance text.
    pub fn with_guidance(mut self, guidance: impl Into<String>) -> Self {
        self.guidance = Some(guidance.into());
        self
    }
}

impl ObjectSchema {
    /// Create an empty object schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            fields: Vec::new(),
        }
    }

    /// Build an object schema from a list of fields.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DuplicateField`] if two fields share a name.
    pub fn from_fields(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = Field>,
    ) -> SchemaResult<Self> {
        fields
            .into_iter()
            .try_fold(Self::new(name), |object, field| object.with_field(field))
    }

    /// Set the object's description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a field.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::DuplicateField`] if a field with the same name
    /// already exists.
    pub fn with_field(mut self, field: Field) -> SchemaResult<Self> {
        if self.fields.iter().any(|f| f.name == field.name) {
            return Err(SchemaError::DuplicateField {
                object: self.name,
                field: field.name,
            });
        }
        self.fields.push(field);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

impl From<ObjectSchema> for Schema {
    fn from(object: ObjectSchema) -> Self {
        Self::Object(object)
    }
}

impl Schema {
    /// Shorthand for an array of `items`.
    pub fn array(items: Schema) -> Self {
        Self::Array(Box::new(items))
    }

    /// Shorthand for a reference to a named schema.
    pub fn reference(name: impl Into<String>) -> Self {
        Self::Reference(name.into())
    }

    /// The kind of value this schema accepts.  References report
    /// [`Kind::Object`], the only shape a named schema can usefully take.
    pub fn kind(&self) -> Kind {
        match self {
            Self::String => Kind::String,
            Self::Number => Kind::Number,
            Self::Integer => Kind::Integer,
            Self::Boolean => Kind::Boolean,
            Self::Array(_) => Kind::Array,
            Self::Object(_) | Self::Reference(_) => Kind::Object,
        }
    }

    /// Returns `true` if the tree contains a [`Schema::Reference`].
    pub fn has_references(&self) -> bool {
        self.first_reference().is_some()
    }

    /// The name of the first [`Schema::Reference`] in document order.
    pub fn first_reference(&self) -> Option<&str> {
        match self {
            Self::Reference(name) => Some(name),
            Self::Array(items) => items.first_reference(),
            Self::Object(object) => object
                .fields
                .iter()
                .find_map(|f| f.schema.first_reference()),
            _ => None,
        }
    }

    // -- Validation ----------------------------------------------------------

    /// Check that `value` has the shape this schema describes.
    ///
    /// Extra object fields are allowed; optional fields may be absent or
    /// `null`.  Unresolved references accept any value, so validate through
    /// [`SchemaSet::validate`] when the schema has references.
    ///
    /// # Errors
    ///
    /// The first [`ValueError::SchemaMismatch`] or
    /// [`ValueError::MissingField`] found in document order.
    pub fn validate(&self, value: &Value) -> ValueResult<()> {
        validate_node(self, value, "$", None)
    }

    // -- JSON Schema interchange ---------------------------------------------

    /// Render the interchange form:
    /// `{type: "object", properties: {name: {type, description}}, required: [...]}`.
    pub fn to_json_schema(&self) -> Json {
        match self {
            Self::String => json!({"type": "string"}),
            Self::Number => json!({"type": "number"}),
            Self::Integer => json!({"type": "integer"}),
            Self::Boolean => json!({"type": "boolean"}),
            Self::Array(items) => json!({"type": "array", "items": items.to_json_schema()}),
            Self::Reference(name) => json!({"$ref": format!("{DEFS_PREFIX}{name}")}),
            Self::Object(object) => {
                let mut properties = serde_json::Map::new();
                for field in &object.fields {
                    let mut property = field.schema.to_json_schema();
                    if let (Some(guidance), Some(map)) =
                        (field.guidance.as_deref(), property.as_object_mut())
                    {
                        if let Self::Object(inner) = &field.schema {
                            map.insert(OBJECT_DESCRIPTION_KEY.into(), json!(inner.description()));
                        }
                        map.insert("description".into(), json!(guidance));
                    }
                    properties.insert(field.name.clone(), property);
                }
                let required: Vec<&str> = object
                    .fields
                    .iter()
                    .filter(|f| f.required)
                    .map(|f| f.name.as_str())
                    .collect();

                let mut schema = json!({
                    "type": "object",
                    "title": object.name,
                    "properties": properties,
                    "required": required,
                });
                if let Some(description) = &object.description {
                    schema["description"] = json!(description);
                }
                schema
            }
        }
    }

    /// Read the interchange form back.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidJsonSchema`] for documents outside the
    /// supported subset (unknown `type`, missing `items`, non-local `$ref`).
    pub fn from_json_schema(document: &Json) -> SchemaResult<Self> {
        schema_from_json(document, "$")
    }
}

impl From<Schema> for Json {
    fn from(schema: Schema) -> Self {
        schema.to_json_schema()
    }
}

impl TryFrom<Json> for Schema {
    type Error = SchemaError;

    fn try_from(document: Json) -> SchemaResult<Self> {
        Self::from_json_schema(&document)
    }
}

fn invalid(path: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidJsonSchema {
        path: path.to_owned(),
        reason: reason.into(),
    }
}

fn schema_from_json(document: &Json, path: &str) -> SchemaResult<Schema> {
    if let Some(reference) = document.get("$ref") {
        let reference = reference
            .as_str()
            .ok_or_else(|| invalid(path, "`$ref` must be a string"))?;
        let name = reference
            .strip_prefix(DEFS_PREFIX)
            .or_else(|| reference.strip_prefix(DEFINITIONS_PREFIX))
            .ok_or_else(|| invalid(path, format!("unsupported reference `{reference}`")))?;
        return Ok(Schema::reference(name));
    }

    let kind = document["type"]
        .as_str()
        .ok_or_else(|| invalid(path, "missing `type`"))?;

    match kind {
        "string" => Ok(Schema::String),
        "number" => Ok(Schema::Number),
        "integer" => Ok(Schema::Integer),
        "boolean" => Ok(Schema::Boolean),
        "array" => {
            let items = document
                .get("items")
                .ok_or_else(|| invalid(path, "array schema without `items`"))?;
            Ok(Schema::array(schema_from_json(items, &format!("{path}[]"))?))
        }
        "object" => {
            let name = document["title"].as_str().unwrap_or("object");
            let required: Vec<&str> = document["required"]
                .as_array()
                .map(|names| names.iter().filter_map(Json::as_str).collect())
                .unwrap_or_default();

            let mut object = ObjectSchema::new(name);
            object.description = document["description"].as_str().map(str::to_owned);
            if let Some(properties) = document["properties"].as_object() {
                for (field_name, property) in properties {
                    let field_path = format!("{path}.{field_name}");
                    let mut schema = schema_from_json(property, &field_path)?;
                    let description = property["description"].as_str().map(str::to_owned);
                    // On an object property `description` is the object's own
                    // unless the annotation moved it aside for guidance.
                    let guidance = match &mut schema {
                        Schema::Object(inner) => match property.get(OBJECT_DESCRIPTION_KEY) {
                            Some(own) => {
                                inner.description = own.as_str().map(str::to_owned);
                                description
                            }
                            None => None,
                        },
                        _ => description,
                    };
                    let field = Field {
                        name: field_name.clone(),
                        schema,
                        guidance,
                        required: required.contains(&field_name.as_str()),
                    };
                    object = object
                        .with_field(field)
                        .map_err(|e| invalid(&field_path, e.to_string()))?;
                }
            }
            Ok(Schema::Object(object))
        }
        other => Err(invalid(path, format!("unsupported type `{other}`"))),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn mismatch(path: &str, expected: Kind, value: &Value) -> ValueError {
    ValueError::SchemaMismatch {
        path: path.to_owned(),
        expected,
        actual: value.kind(),
    }
}

fn validate_node(
    schema: &Schema,
    value: &Value,
    path: &str,
    set: Option<&SchemaSet>,
) -> ValueResult<()> {
    match schema {
        Schema::String => match value {
            Value::String(_) => Ok(()),
            other => Err(mismatch(path, Kind::String, other)),
        },
        Schema::Number => match value {
            Value::Number(_) => Ok(()),
            other => Err(mismatch(path, Kind::Number, other)),
        },
        Schema::Integer => {
            if value.is_integer() {
                Ok(())
            } else {
                Err(mismatch(path, Kind::Integer, value))
            }
        }
        Schema::Boolean => match value {
            Value::Bool(_) => Ok(()),
            other => Err(mismatch(path, Kind::Boolean, other)),
        },
        Schema::Array(items) => {
            let Value::Array(elements) = value else {
                return Err(mismatch(path, Kind::Array, value));
            };
            elements.iter().enumerate().try_for_each(|(i, element)| {
                validate_node(items, element, &format!("{path}[{i}]"), set)
            })
        }
        Schema::Object(object) => {
            if !matches!(value, Value::Object(_)) {
                return Err(mismatch(path, Kind::Object, value));
            }
            for field in &object.fields {
                let field_path = format!("{path}.{}", field.name);
                match value.get(&field.name) {
                    None if field.required => {
                        return Err(ValueError::MissingField { path: field_path });
                    }
                    None => {}
                    Some(Value::Null) if !field.required => {}
                    Some(child) => validate_node(&field.schema, child, &field_path, set)?,
                }
            }
            Ok(())
        }
        Schema::Reference(name) => match set.and_then(|s| s.get(name)) {
            Some(target) => validate_node(target, value, path, set),
            None => {
                tracing::debug!(reference = %name, path, "skipping validation of unresolved reference");
                Ok(())
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Schema set
// ---------------------------------------------------------------------------

/// A registry of named top-level schemas that references point into.
#[derive(Debug, Clone)]
pub struct SchemaSet {
    schemas: BTreeMap<String, Schema>,
    max_depth: usize,
}

impl Default for SchemaSet {
    fn default() -> Self {
        Self {
            schemas: BTreeMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many times one named schema may be expanded along a single
    /// path when inlining self-references.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    /// Register several schemas at once.  Schemas may reference each other in
    /// any order; every reference is checked after all are registered.
    ///
    /// # Errors
    ///
    /// The first resolution error of any registered schema.
    pub fn from_schemas(
        schemas: impl IntoIterator<Item = (String, Schema)>,
    ) -> SchemaResult<Self> {
        let mut set = Self::default();
        set.schemas.extend(schemas);
        set.check_all()?;
        Ok(set)
    }

    /// Register one schema.  References must name schemas that are already
    /// registered (or the schema itself).
    ///
    /// # Errors
    ///
    /// [`SchemaError::UnknownReference`] or
    /// [`SchemaError::UnboundedRecursion`]; the set is left unchanged.
    pub fn insert(&mut self, name: impl Into<String>, schema: Schema) -> SchemaResult<()> {
        let name = name.into();
        let previous = self.schemas.insert(name.clone(), schema);
        if let Err(e) = self.resolve(&Schema::Reference(name.clone())) {
            match previous {
                Some(previous) => self.schemas.insert(name, previous),
                None => self.schemas.remove(&name),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Schema> {
        self.schemas.get(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    fn check_all(&self) -> SchemaResult<()> {
        self.schemas
            .keys()
            .try_for_each(|name| self.resolve(&Schema::Reference(name.clone())).map(|_| ()))
    }

    /// Inline every reference in `schema`, producing a finite, reference-free
    /// tree.
    ///
    /// Self-references are unrolled up to the configured depth.  At the
    /// cutoff an optional field that would recurse is omitted.
    ///
    /// # Errors
    ///
    /// [`SchemaError::UnknownReference`] for unregistered names,
    /// [`SchemaError::UnboundedRecursion`] when a *required* field recurses
    /// past the cutoff.
    pub fn resolve(&self, schema: &Schema) -> SchemaResult<Schema> {
        let mut expanding = Vec::new();
        self.resolve_node(schema, "$", &mut expanding)?
            .ok_or_else(|| SchemaError::UnboundedRecursion {
                path: "$".into(),
                max_depth: self.max_depth,
            })
    }

    /// Validate `value` against `schema`, following references lazily.
    pub fn validate(&self, schema: &Schema, value: &Value) -> ValueResult<()> {
        validate_node(schema, value, "$", Some(self))
    }

    /// Returns `Ok(None)` when the node was cut off by the depth limit.
    fn resolve_node(
        &self,
        schema: &Schema,
        path: &str,
        expanding: &mut Vec<String>,
    ) -> SchemaResult<Option<Schema>> {
        match schema {
            Schema::Reference(name) => {
                let target = self
                    .schemas
                    .get(name)
                    .ok_or_else(|| SchemaError::UnknownReference {
                        name: name.clone(),
                        path: path.to_owned(),
                    })?;
                let depth = expanding.iter().filter(|n| *n == name).count();
                if depth >= self.max_depth {
                    return Ok(None);
                }
                expanding.push(name.clone());
                let resolved = self.resolve_node(target, path, expanding);
                expanding.pop();
                resolved
            }
            Schema::Array(items) => Ok(self
                .resolve_node(items, &format!("{path}[]"), expanding)?
                .map(Schema::array)),
            Schema::Object(object) => {
                let mut resolved = ObjectSchema {
                    name: object.name.clone(),
                    description: object.description.clone(),
                    fields: Vec::with_capacity(object.fields.len()),
                };
                for field in &object.fields {
                    let field_path = format!("{path}.{}", field.name);
                    match self.resolve_node(&field.schema, &field_path, expanding)? {
                        Some(schema) => resolved.fields.push(Field {
                            schema,
                            ..field.clone()
                        }),
                        None if field.required => {
                            return Err(SchemaError::UnboundedRecursion {
                                path: field_path,
                                max_depth: self.max_depth,
                            });
                        }
                        None => {
                            tracing::trace!(path = %field_path, "omitting recursive optional field at depth cutoff");
                        }
                    }
                }
                Ok(Some(Schema::Object(resolved)))
            }
            primitive => Ok(Some(primitive.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
