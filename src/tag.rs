//! Semantic type tags declared by steps.

use std::any::type_name;
use std::borrow::Cow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde_json::Value;

type ShapeCheck = fn(&Value) -> std::result::Result<(), String>;

/// The declared type of a step's input or output.
///
/// Tags are compared by name when the pipeline checks that its initial value
/// fits the first step. A tag built with [`TypeTag::of`] can also check that a
/// JSON value deserializes as the Rust type it names, which is how results are
/// structurally validated.
#[derive(Clone)]
pub struct TypeTag {
    name: Cow<'static, str>,
    check: Option<ShapeCheck>,
}

const ANY: &str = "any";

fn deserializes_as<T: DeserializeOwned>(value: &Value) -> std::result::Result<(), String> {
    T::deserialize(value).map(|_| ()).map_err(|e| e.to_string())
}

impl TypeTag {
    /// The wildcard tag: accepts and matches everything.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            name: Cow::Borrowed(ANY),
            check: None,
        }
    }

    /// A tag known only by name, with no shape check.
    #[must_use]
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            name: name.into(),
            check: None,
        }
    }

    /// The tag of a Rust type. `serde_json::Value` maps to [`TypeTag::any`].
    #[must_use]
    pub fn of<T: DeserializeOwned + 'static>() -> Self {
        if type_name::<T>() == type_name::<Value>() {
            return Self::any();
        }
        Self {
            name: Cow::Borrowed(type_name::<T>()),
            check: Some(deserializes_as::<T>),
        }
    }

    /// The tag's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true for the wildcard tag.
    pub fn is_any(&self) -> bool {
        self.name == ANY
    }

    /// Whether a value tagged `produced` may be fed to a step expecting `self`.
    pub fn accepts(&self, produced: &TypeTag) -> bool {
        self.is_any() || produced.is_any() || self.name == produced.name
    }

    /// Check that `value` has the shape this tag describes.
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match self.check {
            Some(check) => check(value).map_err(|e| format!("expected {}: {e}", self.name)),
            None => Ok(()),
        }
    }
}

impl Default for TypeTag {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for TypeTag {}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TypeTag").field(&self.name).finish()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
