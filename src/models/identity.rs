//! Logical identity of a stored object.

use std::fmt;

/// The (account, container, object) tuple every request resolves to.
///
/// The identity is purely logical; the storage backend owns the mapping to a
/// physical data file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    pub account: String,
    pub container: String,
    pub object: String,
}

impl ObjectIdentity {
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            object: object.into(),
        }
    }

    /// Request path for this object, e.g. `/v1/acct/photos/2025/img.jpg`.
    pub fn request_path(&self) -> String {
        format!("/v1/{}/{}/{}", self.account, self.container, self.object)
    }

    /// Request path of the owning container.
    pub fn container_path(&self) -> String {
        format!("/v1/{}/{}", self.account, self.container)
    }

    /// `container/object` form, used by link destinations and Destination
    /// headers, which are always resolved within the caller's account.
    pub fn relative(&self) -> String {
        format!("{}/{}", self.container, self.object)
    }

    /// Key under which a cached copy of this object is stored.
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}", self.account, self.container, self.object)
    }

    /// Parse a `container/object` form against an account.
    pub fn from_relative(account: &str, relative: &str) -> Option<Self> {
        let (container, object) = relative.split_once('/')?;
        if container.is_empty() || object.is_empty() {
            return None;
        }
        Some(Self::new(account, container, object))
    }

    /// Same container, different object name.
    pub fn with_object(&self, object: impl Into<String>) -> Self {
        Self {
            account: self.account.clone(),
            container: self.container.clone(),
            object: object.into(),
        }
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.container, self.object)
    }
}
