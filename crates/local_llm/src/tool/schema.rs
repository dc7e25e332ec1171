//! Declarative tool argument schemas and their JSON Schema rendering.

use derive_more::Deref;
use serde_json::{json, Map, Value};

/// The type of one tool argument.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgumentType {
    /// A string, optionally with a format hint such as `date-time`.
    String {
        /// What the argument means.
        description: String,
        /// A JSON Schema `format`.
        format: Option<String>,
    },
    /// An integer.
    Integer {
        /// What the argument means.
        description: String,
    },
    /// Any number.
    Number {
        /// What the argument means.
        description: String,
    },
    /// A boolean.
    Boolean {
        /// What the argument means.
        description: String,
    },
    /// One string out of a fixed set.
    Enum {
        /// What the argument means.
        description: String,
        /// The allowed values.
        values: Vec<String>,
    },
    /// A list of values of one type.
    Array {
        /// What the argument means.
        description: String,
        /// The type of every item.
        items: Box<ArgumentType>,
    },
    /// A nested object.
    Object {
        /// What the argument means.
        description: String,
        /// The object's properties.
        properties: ToolSchema,
    },
    /// An argument which may be omitted (or `null`).
    Optional(Box<ArgumentType>),
}

impl ArgumentType {
    /// A string argument.
    pub fn string(description: impl Into<String>) -> Self {
        ArgumentType::String {
            description: description.into(),
            format: None,
        }
    }

    /// An integer argument.
    pub fn integer(description: impl Into<String>) -> Self {
        ArgumentType::Integer {
            description: description.into(),
        }
    }

    /// A number argument.
    pub fn number(description: impl Into<String>) -> Self {
        ArgumentType::Number {
            description: description.into(),
        }
    }

    /// A boolean argument.
    pub fn boolean(description: impl Into<String>) -> Self {
        ArgumentType::Boolean {
            description: description.into(),
        }
    }

    /// A string restricted to `values`.
    pub fn enumeration<S: Into<String>>(
        description: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        ArgumentType::Enum {
            description: description.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// A list of `items`.
    pub fn array(description: impl Into<String>, items: ArgumentType) -> Self {
        ArgumentType::Array {
            description: description.into(),
            items: Box::new(items),
        }
    }

    /// A nested object.
    pub fn object(description: impl Into<String>, properties: ToolSchema) -> Self {
        ArgumentType::Object {
            description: description.into(),
            properties,
        }
    }

    /// Makes this argument optional.
    pub fn optional(self) -> Self {
        match self {
            ArgumentType::Optional(_) => self,
            other => ArgumentType::Optional(Box::new(other)),
        }
    }

    /// Whether the argument may be omitted.
    pub fn is_optional(&self) -> bool {
        matches!(self, ArgumentType::Optional(_))
    }

    /// The JSON Schema of this argument.
    pub fn to_json_schema(&self) -> Value {
        match self {
            ArgumentType::String {
                description,
                format,
            } => {
                let mut schema = json!({ "type": "string", "description": description });
                if let Some(format) = format {
                    schema["format"] = Value::String(format.clone());
                }
                schema
            }
            ArgumentType::Integer { description } => {
                json!({ "type": "integer", "description": description })
            }
            ArgumentType::Number { description } => {
                json!({ "type": "number", "description": description })
            }
            ArgumentType::Boolean { description } => {
                json!({ "type": "boolean", "description": description })
            }
            ArgumentType::Enum {
                description,
                values,
            } => json!({ "type": "string", "description": description, "enum": values }),
            ArgumentType::Array { description, items } => json!({
                "type": "array",
                "description": description,
                "items": items.to_json_schema(),
            }),
            ArgumentType::Object {
                description,
                properties,
            } => {
                let mut schema = properties.to_json_schema();
                schema["description"] = Value::String(description.clone());
                schema
            }
            ArgumentType::Optional(inner) => inner.to_json_schema(),
        }
    }

    fn validate(&self, path: &str, value: &Value) -> Result<(), String> {
        let mismatch = |expected: &str| Err(format!("`{path}` must be {expected}, got {value}"));

        match self {
            ArgumentType::Optional(inner) => {
                if value.is_null() {
                    Ok(())
                } else {
                    inner.validate(path, value)
                }
            }
            ArgumentType::String { .. } => match value {
                Value::String(_) => Ok(()),
                _ => mismatch("a string"),
            },
            ArgumentType::Integer { .. } => {
                if value.is_i64() || value.is_u64() {
                    Ok(())
                } else {
                    mismatch("an integer")
                }
            }
            ArgumentType::Number { .. } => {
                if value.is_number() {
                    Ok(())
                } else {
                    mismatch("a number")
                }
            }
            ArgumentType::Boolean { .. } => match value {
                Value::Bool(_) => Ok(()),
                _ => mismatch("a boolean"),
            },
            ArgumentType::Enum { values, .. } => match value {
                Value::String(s) if values.contains(s) => Ok(()),
                _ => mismatch(&format!("one of {values:?}")),
            },
            ArgumentType::Array { items, .. } => match value {
                Value::Array(elements) => elements
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, e)| items.validate(&format!("{path}[{i}]"), e)),
                _ => mismatch("an array"),
            },
            ArgumentType::Object { properties, .. } => properties.validate_at(path, value),
        }
    }
}

/// The arguments of a tool, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Deref)]
pub struct ToolSchema(Vec<(String, ArgumentType)>);

impl ToolSchema {
    /// A schema without arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an argument.
    pub fn property(mut self, name: impl Into<String>, argument: ArgumentType) -> Self {
        self.0.push((name.into(), argument));
        self
    }

    /// Looks up an argument by name.
    pub fn get(&self, name: &str) -> Option<&ArgumentType> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// The JSON Schema object describing the arguments.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .0
            .iter()
            .map(|(name, argument)| (name.clone(), argument.to_json_schema()))
            .collect();
        let required: Vec<&str> = self
            .0
            .iter()
            .filter(|(_, argument)| !argument.is_optional())
            .map(|(name, _)| name.as_str())
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Checks that `arguments` is an object matching this schema: every required argument is
    /// present, no unknown argument is, and every value has the declared type.
    pub fn validate(&self, arguments: &Value) -> Result<(), String> {
        self.validate_at("arguments", arguments)
    }

    fn validate_at(&self, path: &str, value: &Value) -> Result<(), String> {
        let Value::Object(map) = value else {
            return Err(format!("`{path}` must be an object, got {value}"));
        };

        for (name, argument) in &self.0 {
            let child = format!("{path}.{name}");
            match map.get(name) {
                Some(value) => argument.validate(&child, value)?,
                None if argument.is_optional() => {}
                None => return Err(format!("missing argument `{child}`")),
            }
        }

        if let Some(unknown) = map.keys().find(|key| self.get(key).is_none()) {
            return Err(format!("unexpected argument `{path}.{unknown}`"));
        }

        Ok(())
    }
}

/// A tool as presented to the model: its name, what it does and its arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDeclaration {
    /// The name the model calls the tool by.
    pub name: String,
    /// What the tool does.
    pub description: String,
    /// The tool's arguments.
    pub parameters: ToolSchema,
}

impl ToolDeclaration {
    /// Creates a declaration.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolSchema,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// The OpenAI-compatible function declaration most chat templates expect.
    pub fn to_function_json(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters.to_json_schema(),
            }
        })
    }
}
