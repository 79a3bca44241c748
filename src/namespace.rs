use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A database and collection pair identifying the target of an operation.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Construct a `Namespace` from the given database and collection names.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<Self> {
        let (db, coll) = s.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self {
            db: db.to_string(),
            coll: coll.to_string(),
        })
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// Cursor replies carry the namespace as a "db.coll" string; change event
// documents carry it as a { db, coll } subdocument. Accept either.
impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum NamespaceRepr {
            Dotted(String),
            Split { db: String, coll: String },
        }

        match NamespaceRepr::deserialize(deserializer)? {
            NamespaceRepr::Dotted(s) => Self::from_str(&s).ok_or_else(|| {
                serde::de::Error::custom("namespace must have the form \"db.coll\"")
            }),
            NamespaceRepr::Split { db, coll } => Ok(Self { db, coll }),
        }
    }
}
