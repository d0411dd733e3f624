//! Typed model of the nested field-selection request.
//!
//! A request literal is a JSON object shaped as
//! `{ service: { operation: { "$": {..args..}, field: {..}, .. } } }`.
//! Every field maps to an object: `{}` selects a scalar, anything with keys
//! other than `$` selects a relation whose remaining keys are its children.

use serde_json::{Map, Value};

use crate::error::{FetchError, FetchResult};

/// Reserved key carrying an argument block.
pub const ARGUMENTS_KEY: &str = "$";

/// Opaque argument block, passed through to the services untouched.
pub type Arguments = Map<String, Value>;

/// One field of a selection.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSelection {
    pub name: String,
    pub node: FieldNode,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldNode {
    Scalar,
    Relation {
        arguments: Arguments,
        children: Vec<FieldSelection>,
    },
}

impl FieldSelection {
    pub fn scalar(name: impl Into<String>) -> Self {
        FieldSelection {
            name: name.into(),
            node: FieldNode::Scalar,
        }
    }

    pub fn relation(
        name: impl Into<String>,
        arguments: Arguments,
        children: Vec<FieldSelection>,
    ) -> Self {
        FieldSelection {
            name: name.into(),
            node: FieldNode::Relation {
                arguments,
                children,
            },
        }
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.node, FieldNode::Relation { .. })
    }

    pub fn arguments(&self) -> Option<&Arguments> {
        match &self.node {
            FieldNode::Relation { arguments, .. } => Some(arguments),
            FieldNode::Scalar => None,
        }
    }

    pub fn children(&self) -> &[FieldSelection] {
        match &self.node {
            FieldNode::Relation { children, .. } => children,
            FieldNode::Scalar => &[],
        }
    }

    /// The `limit` argument, if present and a non-negative integer.
    pub fn limit(&self) -> Option<usize> {
        self.arguments()
            .and_then(|args| args.get("limit"))
            .and_then(Value::as_u64)
            .map(|limit| limit as usize)
    }
}

/// One `service → operation` entry of the root envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationRequest {
    pub service: String,
    pub operation: String,
    pub arguments: Arguments,
    pub selection: Vec<FieldSelection>,
}

/// A parsed root envelope. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryRequest {
    pub operations: Vec<OperationRequest>,
}

impl QueryRequest {
    /// Deepest relation nesting below any operation output.
    pub fn relation_depth(&self) -> usize {
        fn depth(selection: &[FieldSelection]) -> usize {
            selection
                .iter()
                .filter(|field| field.is_relation())
                .map(|field| 1 + depth(field.children()))
                .max()
                .unwrap_or(0)
        }

        self.operations
            .iter()
            .flat_map(|op| op.selection.iter())
            .map(|output| depth(output.children()))
            .max()
            .unwrap_or(0)
    }
}

/// Parses a request literal given as JSON text.
pub fn parse_str(literal: &str) -> FetchResult<QueryRequest> {
    let value: Value = serde_json::from_str(literal)
        .map_err(|e| FetchError::parse("", format!("invalid JSON: {}", e)))?;
    parse(&value)
}

/// Parses a request literal into a [`QueryRequest`].
pub fn parse(literal: &Value) -> FetchResult<QueryRequest> {
    let services = as_object(literal, "")?;
    if services.contains_key(ARGUMENTS_KEY) {
        return Err(FetchError::parse("", "the root envelope does not accept arguments"));
    }
    if services.is_empty() {
        return Err(FetchError::parse("", "the request names no service"));
    }

    let mut operations = Vec::new();
    for (service, operations_literal) in services {
        let entries = as_object(operations_literal, service)?;
        if entries.contains_key(ARGUMENTS_KEY) {
            return Err(FetchError::parse(
                service.as_str(),
                "a service entry does not accept arguments",
            ));
        }
        if entries.is_empty() {
            return Err(FetchError::parse(service.as_str(), "the service names no operation"));
        }

        for (operation, body) in entries {
            let path = format!("{}/{}", service, operation);
            let (arguments, selection) = parse_body(body, &path)?;
            if selection.is_empty() {
                return Err(FetchError::parse(path, "the operation selects no field"));
            }
            operations.push(OperationRequest {
                service: service.clone(),
                operation: operation.clone(),
                arguments,
                selection,
            });
        }
    }

    Ok(QueryRequest { operations })
}

/// Parses a bare selection object (no argument block allowed at this level).
pub fn parse_selection(literal: &Value) -> FetchResult<Vec<FieldSelection>> {
    let (arguments, selection) = parse_body(literal, "")?;
    if !arguments.is_empty() {
        return Err(FetchError::parse("", "a selection does not accept arguments"));
    }
    Ok(selection)
}

fn parse_body(body: &Value, path: &str) -> FetchResult<(Arguments, Vec<FieldSelection>)> {
    let object = as_object(body, path)?;
    let mut arguments = Arguments::new();
    let mut selection = Vec::with_capacity(object.len());

    for (key, value) in object {
        if key == ARGUMENTS_KEY {
            arguments = parse_arguments(value, path)?;
            continue;
        }
        if key.is_empty() {
            return Err(FetchError::parse(path, "field names must not be empty"));
        }
        selection.push(parse_field(key, value, &format!("{}.{}", path, key))?);
    }

    Ok((arguments, selection))
}

fn parse_field(name: &str, value: &Value, path: &str) -> FetchResult<FieldSelection> {
    let object = as_object(value, path)?;
    if object.is_empty() {
        return Ok(FieldSelection::scalar(name));
    }

    let (arguments, children) = parse_body(value, path)?;
    if children.is_empty() {
        return Err(FetchError::parse(path, "relation field has no sub-selection"));
    }
    Ok(FieldSelection::relation(name, arguments, children))
}

fn parse_arguments(value: &Value, path: &str) -> FetchResult<Arguments> {
    match value {
        Value::Object(arguments) => Ok(arguments.clone()),
        other => Err(FetchError::parse(
            path,
            format!("argument block must be an object, found {}", type_name(other)),
        )),
    }
}

fn as_object<'a>(value: &'a Value, path: &str) -> FetchResult<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        FetchError::parse(path, format!("expected an object, found {}", type_name(value)))
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Renders a selection back into its literal form.
pub fn to_literal(selection: &[FieldSelection]) -> Value {
    let mut object = Map::new();
    for field in selection {
        let value = match &field.node {
            FieldNode::Scalar => Value::Object(Map::new()),
            FieldNode::Relation {
                arguments,
                children,
            } => {
                let mut body = Map::new();
                if !arguments.is_empty() {
                    body.insert(ARGUMENTS_KEY.to_string(), Value::Object(arguments.clone()));
                }
                if let Value::Object(nested) = to_literal(children) {
                    body.extend(nested);
                }
                Value::Object(body)
            }
        };
        object.insert(field.name.clone(), value);
    }
    Value::Object(object)
}

/// Canonical form of an argument block; equal for blocks that differ only in key order.
pub fn argument_signature(arguments: &Arguments) -> String {
    let mut out = String::new();
    write_canonical(&Value::Object(arguments.clone()), &mut out);
    out
}

/// Canonical form of a selection, used to key the per-execution fetch memo.
pub fn selection_signature(selection: &[FieldSelection]) -> String {
    let mut names: Vec<String> = selection
        .iter()
        .map(|field| match &field.node {
            FieldNode::Scalar => field.name.clone(),
            FieldNode::Relation {
                arguments,
                children,
            } => format!(
                "{}{}{{{}}}",
                field.name,
                argument_signature(arguments),
                selection_signature(children)
            ),
        })
        .collect();
    names.sort();
    names.dedup();
    names.join(",")
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
