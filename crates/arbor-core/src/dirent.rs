use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{BlobRef, KvsError, Result};

/// Tagged directory entry: exactly one tag, pointing at a value or a
/// sub-directory, inline or by ref, or at another path via symlink.
///
/// The serde representation is externally tagged, so a dirent travels as
/// `{"FILEREF": "<hex>"}`, `{"DIRVAL": {...}}`, `{"LINKVAL": "a/b"}`, etc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Dirent {
    #[serde(rename = "FILEREF")]
    FileRef(BlobRef),
    #[serde(rename = "FILEVAL")]
    FileVal(Value),
    #[serde(rename = "DIRREF")]
    DirRef(BlobRef),
    #[serde(rename = "DIRVAL")]
    DirVal(Value),
    #[serde(rename = "LINKVAL")]
    LinkVal(String),
}

impl Dirent {
    pub fn is_directory(&self) -> bool {
        matches!(self, Dirent::DirRef(_) | Dirent::DirVal(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Dirent::LinkVal(_))
    }

    /// Decode a dirent from its JSON form.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| KvsError::Protocol(format!("bad dirent: {e}")))
    }

    /// Encode to the JSON form stored inside directory objects.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| KvsError::Protocol(format!("bad dirent: {e}")))
    }
}

/// A fresh, empty directory object.
pub fn empty_directory() -> Value {
    Value::Object(Map::new())
}

/// View a cached object as a directory mapping, or fail with `ENOTDIR`.
pub fn as_directory(value: &Value) -> Result<&Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(KvsError::NotDirectory),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashAlgorithm;
    use serde_json::json;

    #[test]
    fn dirent_wire_shapes() {
        let r = HashAlgorithm::Blake3.digest(b"blob");

        let v = Dirent::FileRef(r).to_value().unwrap();
        assert_eq!(v, json!({ "FILEREF": r.to_string() }));

        let v = Dirent::FileVal(json!(42)).to_value().unwrap();
        assert_eq!(v, json!({ "FILEVAL": 42 }));

        let v = Dirent::LinkVal("a/b".into()).to_value().unwrap();
        assert_eq!(v, json!({ "LINKVAL": "a/b" }));

        let v = Dirent::DirVal(empty_directory()).to_value().unwrap();
        assert_eq!(v, json!({ "DIRVAL": {} }));
    }

    #[test]
    fn dirent_round_trip() {
        let r = HashAlgorithm::Blake3.digest(b"dir");
        for d in [
            Dirent::FileRef(r),
            Dirent::FileVal(json!([1, 2, 3])),
            Dirent::DirRef(r),
            Dirent::DirVal(json!({ "x": { "FILEVAL": 1 } })),
            Dirent::LinkVal("target".into()),
        ] {
            let back = Dirent::from_value(&d.to_value().unwrap()).unwrap();
            assert_eq!(back, d);
        }
    }

    #[test]
    fn rejects_untagged_values() {
        assert!(Dirent::from_value(&json!(42)).is_err());
        assert!(Dirent::from_value(&json!({ "NOPE": 1 })).is_err());
    }

    #[test]
    fn directory_view() {
        assert!(as_directory(&empty_directory()).is_ok());
        assert_eq!(as_directory(&json!(7)), Err(KvsError::NotDirectory));
    }
}
