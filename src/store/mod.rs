//! Seam to the external managed-object store.
//!
//! The engine never looks inside policy objects. It asks the store to encode
//! an object given its class id and URI, to name a class, and to apply
//! documents received from peers. [`memory::MemoryStore`] is a small
//! in-process implementation used by the binary and the tests.

pub mod memory;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Read;
use thiserror::Error;

pub use memory::MemoryStore;

pub type ClassId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Uri::new(s)
    }
}

/// (class id, URI) pair naming one managed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub class_id: ClassId,
    pub uri: Uri,
}

impl Reference {
    pub fn new(class_id: ClassId, uri: impl Into<Uri>) -> Self {
        Self {
            class_id,
            uri: uri.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyUpdateOp {
    Replace,
    MergeChildren,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
}

/// Handle identifying who reads or writes the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreClient {
    name: String,
}

impl StoreClient {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One object touched by a store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    pub class_id: ClassId,
    pub uri: Uri,
    pub op: PolicyUpdateOp,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown class id {0}")]
    UnknownClass(ClassId),
    #[error("unknown subject '{0}'")]
    UnknownSubject(String),
    #[error("object not found: {0}")]
    NotFound(Uri),
    #[error("malformed object document: {0}")]
    Malformed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait ObjectStore: Send + Sync {
    fn class_info(&self, class_id: ClassId) -> Result<ClassInfo, StoreError>;

    fn class_by_name(&self, name: &str) -> Option<ClassInfo>;

    fn store_client(&self, name: &str) -> StoreClient;

    /// Append the encoded form of `uri` to `writer`. A full object includes
    /// its children (each appended as its own entry).
    fn serialize(
        &self,
        class_id: ClassId,
        uri: &Uri,
        client: &StoreClient,
        writer: &mut Vec<Value>,
        full_object: bool,
    ) -> Result<(), StoreError>;

    /// Load a policy document; returns the number of objects read.
    fn read_objects(&self, reader: &mut dyn Read, client: &StoreClient)
        -> Result<usize, StoreError>;

    /// Apply a document (array of encoded objects, or `{subject, uri}` refs
    /// for deletes) and report every object it changed.
    fn update_objects(
        &self,
        doc: &Value,
        client: &StoreClient,
        op: PolicyUpdateOp,
    ) -> Result<Vec<ObjectChange>, StoreError>;
}
