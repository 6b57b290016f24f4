// ABOUTME: Defines the TopologyMemento aggregate root and the Delta used for incremental writes.
// ABOUTME: Both are built through additive builders; apply_delta folds a delta into a full memento.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PLATFORM_VERSION;
use crate::memento::{Memento, MementoKind};

/// The full durable state of one management plane: every entity, location,
/// and policy memento, keyed by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyMemento {
    pub platform_version: String,
    pub entities: BTreeMap<String, Memento>,
    pub locations: BTreeMap<String, Memento>,
    pub policies: BTreeMap<String, Memento>,
}

impl Default for TopologyMemento {
    fn default() -> Self {
        Self {
            platform_version: PLATFORM_VERSION.to_string(),
            entities: BTreeMap::new(),
            locations: BTreeMap::new(),
            policies: BTreeMap::new(),
        }
    }
}

impl TopologyMemento {
    pub fn builder() -> TopologyMementoBuilder {
        TopologyMementoBuilder::default()
    }

    pub fn objects(&self, kind: MementoKind) -> &BTreeMap<String, Memento> {
        match kind {
            MementoKind::Entity => &self.entities,
            MementoKind::Location => &self.locations,
            MementoKind::Policy => &self.policies,
        }
    }

    fn objects_mut(&mut self, kind: MementoKind) -> &mut BTreeMap<String, Memento> {
        match kind {
            MementoKind::Entity => &mut self.entities,
            MementoKind::Location => &mut self.locations,
            MementoKind::Policy => &mut self.policies,
        }
    }

    pub fn get(&self, kind: MementoKind, id: &str) -> Option<&Memento> {
        self.objects(kind).get(id)
    }

    /// Entities without a parent, in id order.
    pub fn application_ids(&self) -> Vec<String> {
        self.entities
            .values()
            .filter(|m| m.relations.parent_id.is_none())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Locations without a parent, in id order.
    pub fn top_level_location_ids(&self) -> Vec<String> {
        self.locations
            .values()
            .filter(|m| m.relations.parent_id.is_none())
            .map(|m| m.id.clone())
            .collect()
    }

    /// Iterate all mementos: entities, then locations, then policies.
    pub fn iter(&self) -> impl Iterator<Item = &Memento> {
        self.entities
            .values()
            .chain(self.locations.values())
            .chain(self.policies.values())
    }

    pub fn len(&self) -> usize {
        self.entities.len() + self.locations.len() + self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return a new memento with `delta` folded in.
    pub fn apply_delta(&self, delta: &Delta) -> TopologyMemento {
        let mut next = self.clone();
        next.fold_delta(delta);
        next
    }

    /// Fold `delta` into this memento in place: upsert every changed memento,
    /// then drop every removed id.
    pub fn fold_delta(&mut self, delta: &Delta) {
        for kind in MementoKind::ALL {
            let objects = self.objects_mut(kind);
            for memento in delta.changed(kind) {
                objects.insert(memento.id.clone(), memento.clone());
            }
            for id in delta.removed(kind) {
                objects.remove(id);
            }
        }
    }
}

/// Additive builder for [`TopologyMemento`]. A later memento with the same
/// kind and id replaces an earlier one.
#[derive(Debug, Default)]
pub struct TopologyMementoBuilder {
    platform_version: Option<String>,
    memento: TopologyMemento,
}

impl TopologyMementoBuilder {
    pub fn platform_version(mut self, version: impl Into<String>) -> Self {
        self.platform_version = Some(version.into());
        self
    }

    pub fn memento(mut self, memento: Memento) -> Self {
        self.memento
            .objects_mut(memento.kind)
            .insert(memento.id.clone(), memento);
        self
    }

    pub fn mementos(self, mementos: impl IntoIterator<Item = Memento>) -> Self {
        mementos.into_iter().fold(self, |b, m| b.memento(m))
    }

    pub fn build(self) -> TopologyMemento {
        let mut memento = self.memento;
        if let Some(version) = self.platform_version {
            memento.platform_version = version;
        }
        memento
    }
}

/// An incremental change: mementos to upsert and ids to remove, per kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub changed_entities: Vec<Memento>,
    pub changed_locations: Vec<Memento>,
    pub changed_policies: Vec<Memento>,
    pub removed_entity_ids: Vec<String>,
    pub removed_location_ids: Vec<String>,
    pub removed_policy_ids: Vec<String>,
}

impl Delta {
    pub fn builder() -> DeltaBuilder {
        DeltaBuilder::default()
    }

    pub fn changed(&self, kind: MementoKind) -> &[Memento] {
        match kind {
            MementoKind::Entity => &self.changed_entities,
            MementoKind::Location => &self.changed_locations,
            MementoKind::Policy => &self.changed_policies,
        }
    }

    pub fn removed(&self, kind: MementoKind) -> &[String] {
        match kind {
            MementoKind::Entity => &self.removed_entity_ids,
            MementoKind::Location => &self.removed_location_ids,
            MementoKind::Policy => &self.removed_policy_ids,
        }
    }

    pub fn is_empty(&self) -> bool {
        MementoKind::ALL
            .iter()
            .all(|k| self.changed(*k).is_empty() && self.removed(*k).is_empty())
    }

    /// Number of objects this delta touches.
    pub fn len(&self) -> usize {
        MementoKind::ALL
            .iter()
            .map(|k| self.changed(*k).len() + self.removed(*k).len())
            .sum()
    }
}

/// Builder for [`Delta`]. For any one object the last call wins: marking an
/// object changed cancels an earlier removal and vice versa.
#[derive(Debug, Default)]
pub struct DeltaBuilder {
    changed: BTreeMap<(MementoKind, String), Memento>,
    removed: BTreeMap<(MementoKind, String), ()>,
}

impl DeltaBuilder {
    pub fn changed(mut self, memento: Memento) -> Self {
        let key = (memento.kind, memento.id.clone());
        self.removed.remove(&key);
        self.changed.insert(key, memento);
        self
    }

    pub fn removed(mut self, kind: MementoKind, id: impl Into<String>) -> Self {
        let key = (kind, id.into());
        self.changed.remove(&key);
        self.removed.insert(key, ());
        self
    }

    pub fn build(self) -> Delta {
        let mut delta = Delta::default();
        for ((kind, _), memento) in self.changed {
            match kind {
                MementoKind::Entity => delta.changed_entities.push(memento),
                MementoKind::Location => delta.changed_locations.push(memento),
                MementoKind::Policy => delta.changed_policies.push(memento),
            }
        }
        for (kind, id) in self.removed.into_keys() {
            match kind {
                MementoKind::Entity => delta.removed_entity_ids.push(id),
                MementoKind::Location => delta.removed_location_ids.push(id),
                MementoKind::Policy => delta.removed_policy_ids.push(id),
            }
        }
        delta
    }
}
