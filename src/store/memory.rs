// src/store/memory.rs

use super::{
    ClassId, ClassInfo, ObjectChange, ObjectStore, PolicyUpdateOp, StoreClient, StoreError, Uri,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;

/// Class ids handed out to subjects seen for the first time.
const FIRST_DYNAMIC_CLASS_ID: ClassId = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    class_id: ClassId,
    properties: Vec<Value>,
    children: Vec<Uri>,
    parent: Option<ParentLink>,
}

#[derive(Debug, Clone)]
struct ParentLink {
    subject: Option<String>,
    uri: Uri,
    relation: Option<String>,
}

#[derive(Default)]
struct Classes {
    by_id: HashMap<ClassId, String>,
    by_name: HashMap<String, ClassId>,
    next_dynamic: ClassId,
}

/// In-process object store keyed by URI. Subjects not registered up front get
/// a class id on first sight.
pub struct MemoryStore {
    classes: RwLock<Classes>,
    objects: RwLock<BTreeMap<Uri, StoredObject>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(Classes {
                next_dynamic: FIRST_DYNAMIC_CLASS_ID,
                ..Default::default()
            }),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register_class(&self, id: ClassId, name: &str) {
        let mut classes = self.classes.write();
        classes.by_id.insert(id, name.to_string());
        classes.by_name.insert(name.to_string(), id);
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, uri: &Uri) -> bool {
        self.objects.read().contains_key(uri)
    }

    fn class_id_for(&self, subject: &str) -> ClassId {
        if let Some(id) = self.classes.read().by_name.get(subject) {
            return *id;
        }
        let mut classes = self.classes.write();
        if let Some(id) = classes.by_name.get(subject) {
            return *id;
        }
        let id = classes.next_dynamic;
        classes.next_dynamic += 1;
        classes.by_id.insert(id, subject.to_string());
        classes.by_name.insert(subject.to_string(), id);
        id
    }

    fn encode(&self, uri: &Uri, obj: &StoredObject) -> Result<Value, StoreError> {
        let subject = self
            .classes
            .read()
            .by_id
            .get(&obj.class_id)
            .cloned()
            .ok_or(StoreError::UnknownClass(obj.class_id))?;
        let mut map = Map::new();
        map.insert("subject".into(), Value::String(subject));
        map.insert("uri".into(), Value::String(uri.to_string()));
        map.insert("properties".into(), Value::Array(obj.properties.clone()));
        map.insert(
            "children".into(),
            Value::Array(
                obj.children
                    .iter()
                    .map(|c| Value::String(c.to_string()))
                    .collect(),
            ),
        );
        if let Some(parent) = &obj.parent {
            if let Some(subject) = &parent.subject {
                map.insert("parent_subject".into(), Value::String(subject.clone()));
            }
            map.insert("parent_uri".into(), Value::String(parent.uri.to_string()));
            if let Some(relation) = &parent.relation {
                map.insert("parent_relation".into(), Value::String(relation.clone()));
            }
        }
        Ok(Value::Object(map))
    }

    fn encode_tree(
        &self,
        objects: &BTreeMap<Uri, StoredObject>,
        uri: &Uri,
        writer: &mut Vec<Value>,
    ) -> Result<(), StoreError> {
        let obj = objects
            .get(uri)
            .ok_or_else(|| StoreError::NotFound(uri.clone()))?;
        writer.push(self.encode(uri, obj)?);
        for child in &obj.children {
            // children may have been removed independently of the parent's list
            if objects.contains_key(child) {
                self.encode_tree(objects, child, writer)?;
            }
        }
        Ok(())
    }

    fn apply_object(
        &self,
        objects: &mut BTreeMap<Uri, StoredObject>,
        raw: &Value,
        op: PolicyUpdateOp,
        changes: &mut Vec<ObjectChange>,
    ) -> Result<(), StoreError> {
        let (subject, uri) = subject_and_uri(raw)?;
        let class_id = self.class_id_for(&subject);
        if op == PolicyUpdateOp::Delete {
            remove_tree(objects, &uri, changes);
            return Ok(());
        }
        let properties = match raw.get("properties") {
            Some(Value::Array(p)) => p.clone(),
            Some(_) => return Err(StoreError::Malformed(format!("{}: properties", uri))),
            None => Vec::new(),
        };
        let children = match raw.get("children") {
            Some(Value::Array(c)) => c
                .iter()
                .filter_map(Value::as_str)
                .map(Uri::new)
                .collect(),
            _ => Vec::new(),
        };
        let parent = raw
            .get("parent_uri")
            .and_then(Value::as_str)
            .map(|p| ParentLink {
                subject: raw
                    .get("parent_subject")
                    .and_then(Value::as_str)
                    .map(String::from),
                uri: Uri::new(p),
                relation: raw
                    .get("parent_relation")
                    .and_then(Value::as_str)
                    .map(String::from),
            });

        match (op, objects.get_mut(&uri)) {
            (PolicyUpdateOp::MergeChildren, Some(existing)) => {
                for prop in properties {
                    let name = prop.get("name").cloned();
                    existing
                        .properties
                        .retain(|p| name.is_none() || p.get("name") != name.as_ref());
                    existing.properties.push(prop);
                }
                for child in children {
                    if !existing.children.contains(&child) {
                        existing.children.push(child);
                    }
                }
                if parent.is_some() {
                    existing.parent = parent.clone();
                }
            }
            _ => {
                objects.insert(
                    uri.clone(),
                    StoredObject {
                        class_id,
                        properties,
                        children,
                        parent: parent.clone(),
                    },
                );
            }
        }
        if let Some(link) = parent {
            if let Some(p) = objects.get_mut(&link.uri) {
                if !p.children.contains(&uri) {
                    p.children.push(uri.clone());
                }
            }
        }
        changes.push(ObjectChange { class_id, uri, op });
        Ok(())
    }
}

fn subject_and_uri(raw: &Value) -> Result<(String, Uri), StoreError> {
    let subject = raw
        .get("subject")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Malformed("object without subject".into()))?;
    let uri = raw
        .get("uri")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Malformed(format!("{} without uri", subject)))?;
    Ok((subject.to_string(), Uri::new(uri)))
}

fn remove_tree(
    objects: &mut BTreeMap<Uri, StoredObject>,
    uri: &Uri,
    changes: &mut Vec<ObjectChange>,
) {
    let Some(obj) = objects.remove(uri) else {
        return;
    };
    if let Some(link) = &obj.parent {
        if let Some(p) = objects.get_mut(&link.uri) {
            p.children.retain(|c| c != uri);
        }
    }
    for child in &obj.children {
        remove_tree(objects, child, changes);
    }
    changes.push(ObjectChange {
        class_id: obj.class_id,
        uri: uri.clone(),
        op: PolicyUpdateOp::Delete,
    });
}

impl ObjectStore for MemoryStore {
    fn class_info(&self, class_id: ClassId) -> Result<ClassInfo, StoreError> {
        self.classes
            .read()
            .by_id
            .get(&class_id)
            .map(|name| ClassInfo {
                id: class_id,
                name: name.clone(),
            })
            .ok_or(StoreError::UnknownClass(class_id))
    }

    fn class_by_name(&self, name: &str) -> Option<ClassInfo> {
        self.classes.read().by_name.get(name).map(|id| ClassInfo {
            id: *id,
            name: name.to_string(),
        })
    }

    fn store_client(&self, name: &str) -> StoreClient {
        StoreClient::new(name)
    }

    fn serialize(
        &self,
        class_id: ClassId,
        uri: &Uri,
        _client: &StoreClient,
        writer: &mut Vec<Value>,
        full_object: bool,
    ) -> Result<(), StoreError> {
        let objects = self.objects.read();
        let obj = objects
            .get(uri)
            .ok_or_else(|| StoreError::NotFound(uri.clone()))?;
        if obj.class_id != class_id {
            return Err(StoreError::NotFound(uri.clone()));
        }
        if full_object {
            self.encode_tree(&objects, uri, writer)
        } else {
            writer.push(self.encode(uri, obj)?);
            Ok(())
        }
    }

    fn read_objects(
        &self,
        reader: &mut dyn Read,
        client: &StoreClient,
    ) -> Result<usize, StoreError> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;
        let doc: Value = serde_json::from_str(&content)?;
        Ok(self
            .update_objects(&doc, client, PolicyUpdateOp::Replace)?
            .len())
    }

    fn update_objects(
        &self,
        doc: &Value,
        _client: &StoreClient,
        op: PolicyUpdateOp,
    ) -> Result<Vec<ObjectChange>, StoreError> {
        let items = match doc {
            Value::Array(items) => items.as_slice(),
            Value::Object(_) => std::slice::from_ref(doc),
            _ => return Err(StoreError::Malformed("expected an array of objects".into())),
        };
        let mut objects = self.objects.write();
        let mut changes = Vec::new();
        for raw in items {
            self.apply_object(&mut objects, raw, op, &mut changes)?;
        }
        Ok(changes)
    }
}
