use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::debug;
use serde::{Deserialize, Serialize};

use super::{LotId, SensorDescriptor, SensorId};

/// Change notification for the sensor catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatalogEvent {
    /// A sensor was created or edited; same id replaces, new id appends
    SensorUpdated(SensorDescriptor),
    SensorRemoved(SensorId),
}

/// What applying a catalog change did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogChange {
    Added,
    Replaced,
    /// The update moved the sensor to another lot or sub-lot
    Regrouped,
    Removed,
    Unchanged,
}

/// Read-shared registry of every known sensor
///
/// Keyed by id, so re-delivering the same descriptor is a no-op and a group
/// reassignment keeps the id (and therefore the reading history) intact.
#[derive(Debug, Default, Clone)]
pub struct SensorCatalog {
    sensors: BTreeMap<SensorId, SensorDescriptor>,
}

impl SensorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a full listing
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = SensorDescriptor>) -> Self {
        let mut catalog = Self::new();
        for descriptor in descriptors {
            catalog.upsert(descriptor);
        }
        catalog
    }

    /// Insert or replace a descriptor
    pub fn upsert(&mut self, descriptor: SensorDescriptor) -> CatalogChange {
        let id = descriptor.id;
        match self.sensors.insert(id, descriptor) {
            None => CatalogChange::Added,
            Some(previous) => {
                let current = &self.sensors[&id];
                if previous == *current {
                    CatalogChange::Unchanged
                } else if previous.lot != current.lot || previous.sub_lot != current.sub_lot {
                    debug!("Sensor {:?} regrouped to lot {:?}/{:?}", id, current.lot, current.sub_lot);
                    CatalogChange::Regrouped
                } else {
                    CatalogChange::Replaced
                }
            }
        }
    }

    pub fn remove(&mut self, id: SensorId) -> CatalogChange {
        match self.sensors.remove(&id) {
            Some(_) => CatalogChange::Removed,
            None => CatalogChange::Unchanged,
        }
    }

    pub fn apply(&mut self, event: CatalogEvent) -> CatalogChange {
        match event {
            CatalogEvent::SensorUpdated(descriptor) => self.upsert(descriptor),
            CatalogEvent::SensorRemoved(id) => self.remove(id),
        }
    }

    /// Replace the whole listing, absorbing each entry idempotently
    ///
    /// Sensors missing from `descriptors` are dropped. Returns the ids that
    /// disappeared so their buffers can be released.
    pub fn refresh(&mut self, descriptors: impl IntoIterator<Item = SensorDescriptor>) -> Vec<SensorId> {
        let fresh = Self::from_descriptors(descriptors);
        let gone = self
            .sensors
            .keys()
            .filter(|id| !fresh.sensors.contains_key(id))
            .copied()
            .collect();
        *self = fresh;
        gone
    }

    pub fn get(&self, id: SensorId) -> Option<&SensorDescriptor> {
        self.sensors.get(&id)
    }

    pub fn contains(&self, id: SensorId) -> bool {
        self.sensors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorDescriptor> {
        self.sensors.values()
    }

    /// Active sensors in a lot, optionally narrowed to one sub-lot
    pub fn members(&self, lot: LotId, sub_lot: Option<LotId>) -> impl Iterator<Item = &SensorDescriptor> {
        self.sensors
            .values()
            .filter(move |sensor| sensor.active && sensor.in_scope(lot, sub_lot))
    }
}
