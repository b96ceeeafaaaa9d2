//! Resource key generation.

/// A key that identifies a lock or limiter in the shared store.
///
/// The key is composed of a namespace and an ordered list of parts,
/// joined with `:` in the order they were given.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// The namespace this key belongs to
    pub namespace: String,
    /// Ordered key segments below the namespace
    pub parts: Vec<String>,
}

impl ResourceKey {
    /// Create a new key in `namespace`.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            parts: Vec::new(),
        }
    }

    /// Append a segment.
    pub fn with_part(mut self, part: impl Into<String>) -> Self {
        self.parts.push(part.into());
        self
    }

    /// The string used as the store key.
    ///
    /// An empty namespace is omitted so un-namespaced keys stay readable.
    pub fn to_store_key(&self) -> String {
        let mut segments: Vec<&str> = Vec::with_capacity(self.parts.len() + 1);
        if !self.namespace.is_empty() {
            segments.push(&self.namespace);
        }
        segments.extend(self.parts.iter().map(String::as_str));
        segments.join(":")
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_store_key()
    }
}
