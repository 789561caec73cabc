use serde::{Deserialize, Serialize};

/// extended attribute (name + value)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

impl Xattr {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// namespaces an unprivileged process cannot write
    pub fn is_privileged(&self) -> bool {
        self.name.starts_with("trusted.") || self.name.starts_with("security.")
    }
}
