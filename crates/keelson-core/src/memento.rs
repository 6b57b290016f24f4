// ABOUTME: Defines the per-object memento snapshot for entities, locations, and policies.
// ABOUTME: Mementos reference other objects by id only, so object graphs serialize without cycles.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The three families of reconstructible object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MementoKind {
    Entity,
    Location,
    Policy,
}

impl MementoKind {
    pub const ALL: [MementoKind; 3] = [
        MementoKind::Entity,
        MementoKind::Location,
        MementoKind::Policy,
    ];

    /// Store sub-path holding one object per id of this kind.
    pub fn sub_path(&self) -> &'static str {
        match self {
            MementoKind::Entity => "entities",
            MementoKind::Location => "locations",
            MementoKind::Policy => "policies",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MementoKind::Entity => "entity",
            MementoKind::Location => "location",
            MementoKind::Policy => "policy",
        }
    }

    /// The kind a `parent_id` of this kind points at. Policies hang off the
    /// entity they are attached to.
    pub fn parent_kind(&self) -> MementoKind {
        match self {
            MementoKind::Entity | MementoKind::Policy => MementoKind::Entity,
            MementoKind::Location => MementoKind::Location,
        }
    }
}

impl fmt::Display for MementoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A typed pointer to another object, as it appears in a memento.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: MementoKind,
    pub id: String,
}

impl ObjectRef {
    pub fn new(kind: MementoKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// A value held in an object's config or attribute map. References to other
/// managed objects are kept as bare ids and resolved on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MementoValue {
    Plain(serde_json::Value),
    EntityRef(String),
    LocationRef(String),
    List(Vec<MementoValue>),
}

impl MementoValue {
    pub fn plain(value: impl Into<serde_json::Value>) -> Self {
        MementoValue::Plain(value.into())
    }

    /// Append every object reference in this value to `out`, depth first.
    pub fn collect_refs(&self, out: &mut Vec<ObjectRef>) {
        match self {
            MementoValue::Plain(_) => {}
            MementoValue::EntityRef(id) => out.push(ObjectRef::new(MementoKind::Entity, id.clone())),
            MementoValue::LocationRef(id) => {
                out.push(ObjectRef::new(MementoKind::Location, id.clone()))
            }
            MementoValue::List(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
        }
    }
}

/// Relations to other objects, by id.
///
/// `tag_ids` are opaque labels and are never resolved against the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub child_ids: Vec<String>,
    #[serde(default)]
    pub location_ids: Vec<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub policy_ids: Vec<String>,
}

/// The durable snapshot of one live object's state and relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memento {
    pub id: String,
    pub kind: MementoKind,
    #[serde(rename = "type")]
    pub object_type: String,
    pub display_name: String,
    #[serde(default)]
    pub config: BTreeMap<String, MementoValue>,
    #[serde(default)]
    pub attributes: BTreeMap<String, MementoValue>,
    #[serde(default)]
    pub relations: Relations,
}

impl Memento {
    /// Create a memento with no config, attributes, or relations. The display
    /// name defaults to the id.
    pub fn new(kind: MementoKind, id: impl Into<String>, object_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind,
            object_type: object_type.into(),
            config: BTreeMap::new(),
            attributes: BTreeMap::new(),
            relations: Relations::default(),
        }
    }

    pub fn entity(id: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self::new(MementoKind::Entity, id, object_type)
    }

    pub fn location(id: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self::new(MementoKind::Location, id, object_type)
    }

    pub fn policy(id: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self::new(MementoKind::Policy, id, object_type)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: MementoValue) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: MementoValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.relations.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_child(mut self, child_id: impl Into<String>) -> Self {
        self.relations.child_ids.push(child_id.into());
        self
    }

    pub fn with_location(mut self, location_id: impl Into<String>) -> Self {
        self.relations.location_ids.push(location_id.into());
        self
    }

    pub fn with_tag(mut self, tag_id: impl Into<String>) -> Self {
        self.relations.tag_ids.push(tag_id.into());
        self
    }

    pub fn with_policy(mut self, policy_id: impl Into<String>) -> Self {
        self.relations.policy_ids.push(policy_id.into());
        self
    }

    /// Every reference this memento holds: relations first, then references
    /// embedded in config and attribute values.
    pub fn references(&self) -> Vec<ObjectRef> {
        let mut refs = Vec::new();
        if let Some(parent) = &self.relations.parent_id {
            refs.push(ObjectRef::new(self.kind.parent_kind(), parent.clone()));
        }
        for child in &self.relations.child_ids {
            refs.push(ObjectRef::new(self.kind, child.clone()));
        }
        for location in &self.relations.location_ids {
            refs.push(ObjectRef::new(MementoKind::Location, location.clone()));
        }
        for policy in &self.relations.policy_ids {
            refs.push(ObjectRef::new(MementoKind::Policy, policy.clone()));
        }
        for value in self.config.values().chain(self.attributes.values()) {
            value.collect_refs(&mut refs);
        }
        refs
    }
}

/// The `{id, type}` pair read during the manifest pass. Everything else in
/// the stored memento text is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
}
