//! Document model: a tagged recursive tree of scalars, sequences and mappings.
//!
//! Manifests and substitution files are both parsed into [`Node`]. Mappings
//! keep their keys sorted, matching what the templating tool emits.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, Serializer};

use crate::error::{Result, SubstError};

/// Ordered mapping type used for [`Node::Mapping`].
pub type Mapping = BTreeMap<String, Node>;

// ---------------------------------------------------------------------------
// Scalar
// ---------------------------------------------------------------------------

/// A leaf value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    /// Integers above `i64::MAX`, kept exact.
    UInt(u64),
    Float(f64),
    String(String),
}

impl Scalar {
    /// Text used when the scalar is interpolated into a longer string.
    pub fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::UInt(u) => u.to_string(),
            Self::Float(f) => f.to_string(),
            Self::String(s) => s.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One node of a structured document.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Scalar(Scalar),
    Sequence(Vec<Node>),
    Mapping(Mapping),
}

impl Default for Node {
    fn default() -> Self {
        Self::Mapping(Mapping::new())
    }
}

impl Node {
    /// Shorthand for a string scalar.
    pub fn string(value: impl Into<String>) -> Self {
        Self::Scalar(Scalar::String(value.into()))
    }

    /// Shorthand for the null scalar.
    pub fn null() -> Self {
        Self::Scalar(Scalar::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Scalar::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut Mapping> {
        match self {
            Self::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a dotted path. Numeric segments index into sequences.
    pub fn get_path(&self, path: &str) -> Option<&Node> {
        path.split('.').try_fold(self, |node, segment| node.child(segment))
    }

    /// Direct child by mapping key or sequence index.
    pub fn child(&self, segment: &str) -> Option<&Node> {
        match self {
            Self::Mapping(m) => m.get(segment),
            Self::Sequence(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            Self::Scalar(_) => None,
        }
    }

    /// Parse a single YAML (or JSON) document.
    pub fn from_yaml_slice(bytes: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(bytes).map_err(|e| SubstError::parse(e.to_string()))
    }

    /// Parse a multi-document YAML stream, skipping empty documents.
    pub fn documents_from_yaml(bytes: &[u8]) -> Result<Vec<Self>> {
        let mut nodes = Vec::new();
        for de in serde_yaml::Deserializer::from_slice(bytes) {
            let node = Node::deserialize(de).map_err(|e| SubstError::parse(e.to_string()))?;
            if !node.is_null() {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| SubstError::parse(e.to_string()))
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SubstError::parse(e.to_string()))
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| SubstError::parse(e.to_string()))
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Self::Scalar(Scalar::Int(value))
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Self::Scalar(Scalar::Bool(value))
    }
}

impl From<Mapping> for Node {
    fn from(value: Mapping) -> Self {
        Self::Mapping(value)
    }
}

// ---------------------------------------------------------------------------
// serde
// ---------------------------------------------------------------------------

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(Scalar::Null) => serializer.serialize_unit(),
            Self::Scalar(Scalar::Bool(b)) => serializer.serialize_bool(*b),
            Self::Scalar(Scalar::Int(i)) => serializer.serialize_i64(*i),
            Self::Scalar(Scalar::UInt(u)) => serializer.serialize_u64(*u),
            Self::Scalar(Scalar::Float(f)) => serializer.serialize_f64(*f),
            Self::Scalar(Scalar::String(s)) => serializer.serialize_str(s),
            Self::Sequence(items) => serializer.collect_seq(items),
            Self::Mapping(m) => serializer.collect_map(m),
        }
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar, sequence or mapping")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Node, E> {
        Ok(Node::null())
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Node, E> {
        Ok(Node::null())
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Node, D::Error> {
        Node::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::Int(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Node, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => Node::Scalar(Scalar::Int(i)),
            Err(_) => Node::Scalar(Scalar::UInt(v)),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Node, E> {
        Ok(Node::Scalar(Scalar::Float(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Node, E> {
        Ok(Node::string(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Node, E> {
        Ok(Node::string(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Node, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element::<Node>()? {
            items.push(item);
        }
        Ok(Node::Sequence(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Node, A::Error> {
        let mut out = Mapping::new();
        while let Some((key, value)) = map.next_entry::<MappingKey, Node>()? {
            out.insert(key.0, value);
        }
        Ok(Node::Mapping(out))
    }
}

/// Mapping key; YAML allows scalar keys of any type, we keep their text.
struct MappingKey(String);

impl<'de> Deserialize<'de> for MappingKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match Node::deserialize(deserializer)? {
            Node::Scalar(scalar) => Ok(MappingKey(scalar.render())),
            _ => Err(de::Error::custom("mapping keys must be scalars")),
        }
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A manifest together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// File the document was read from.
    pub origin: PathBuf,
    /// Position within a multi-document file.
    pub index: usize,
    pub node: Node,
}

impl Document {
    pub fn new(origin: impl Into<PathBuf>, index: usize, node: Node) -> Self {
        Self {
            origin: origin.into(),
            index,
            node,
        }
    }

    /// `namespace/name` from the manifest metadata, or the origin when absent.
    pub fn display_name(&self) -> String {
        let name = self.node.get_path("metadata.name").and_then(Node::as_str);
        let namespace = self
            .node
            .get_path("metadata.namespace")
            .and_then(Node::as_str)
            .unwrap_or("");
        match name {
            Some(name) => format!("{namespace}/{name}"),
            None => format!("{}#{}", self.origin.display(), self.index),
        }
    }
}
