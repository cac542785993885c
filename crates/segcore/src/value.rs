use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Dynamic value type for node inputs/outputs
///
/// Objects use a `BTreeMap` so that serialization is stable, which the
/// cache key derivation relies on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Path(PathBuf),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integral numbers only; `3.5` is not an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Paths may also arrive as plain strings from literal parameters.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Value::Path(p) => Some(p),
            Value::String(s) => Some(Path::new(s)),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name used for type mismatch diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Path(_) => "path",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Every `Path` contained in this value, depth first.
    pub fn paths(&self) -> Vec<&Path> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a Path>) {
        match self {
            Value::Path(p) => out.push(p),
            Value::Array(items) => items.iter().for_each(|v| v.collect_paths(out)),
            Value::Object(map) => map.values().for_each(|v| v.collect_paths(out)),
            _ => {}
        }
    }

    /// Human readable form used in directory names and log lines.
    pub fn label(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Path(p) => p
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.display().to_string()),
            Value::Array(items) => items.iter().map(Value::label).collect::<Vec<_>>().join(","),
            Value::Object(_) => "object".to_string(),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Self {
        Value::Path(p)
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Value::Path(p.to_path_buf())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_directory_friendly() {
        assert_eq!(Value::from("P001").label(), "P001");
        assert_eq!(Value::from(30i64).label(), "30");
        assert_eq!(Value::from(0.2).label(), "0.2");
        assert_eq!(Value::from(PathBuf::from("/data/P001_T13D.nii.gz")).label(), "P001_T13D.nii.gz");
    }

    #[test]
    fn paths_are_collected_from_nested_values() {
        let value = Value::from(vec![
            Value::from(PathBuf::from("/a/one.nii.gz")),
            Value::from(vec![PathBuf::from("/a/two.nii.gz")]),
            Value::from(3.0),
        ]);

        let paths = value.paths();
        assert_eq!(paths, vec![Path::new("/a/one.nii.gz"), Path::new("/a/two.nii.gz")]);
    }

    #[test]
    fn integral_numbers_convert_to_i64() {
        assert_eq!(Value::from(16.0).as_i64(), Some(16));
        assert_eq!(Value::from(16.5).as_i64(), None);
        assert_eq!(Value::from("16").as_i64(), None);
    }
}
