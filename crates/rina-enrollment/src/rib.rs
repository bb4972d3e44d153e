//! The slice of the resource information base that enrollment reads and
//! writes.
//!
//! Object creation is idempotent: merging a set already present leaves the
//! store unchanged, so replayed CREATE operations are harmless.

use std::collections::HashMap;

use crate::cdap::{
    obj, DataTransferConstants, DftEntry, NeighborDescriptor, QosCube, WhatevercastName,
};
use crate::neighbor::Neighbor;

/// Operational state of the local IPC process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperationalStatus {
    #[default]
    Initialized,
    AssignedToDif,
}

/// The enrollment-relevant RIB objects.
#[derive(Debug, Default)]
pub struct Rib {
    pub dif_name: String,
    pub address: u32,
    pub operational: OperationalStatus,
    pub constants: Option<DataTransferConstants>,
    pub qos_cubes: Vec<QosCube>,
    pub whatevercast_names: Vec<WhatevercastName>,
    pub dft_entries: Vec<DftEntry>,
    neighbors: HashMap<String, Neighbor>,
}

impl Rib {
    pub fn new(dif_name: &str) -> Self {
        Self {
            dif_name: dif_name.to_string(),
            ..Self::default()
        }
    }

    pub fn set_address(&mut self, address: u32) {
        tracing::info!(address, "address assigned");
        self.address = address;
    }

    /// Install the DIF constants unless already present.
    pub fn create_constants(&mut self, constants: DataTransferConstants) {
        if self.constants.is_none() {
            self.constants = Some(constants);
        }
    }

    /// Merge QoS cubes, deduplicating by id.
    pub fn merge_qos_cubes(&mut self, cubes: Vec<QosCube>) {
        for cube in cubes {
            if !self.qos_cubes.iter().any(|c| c.id == cube.id) {
                self.qos_cubes.push(cube);
            }
        }
    }

    /// Merge whatevercast names, deduplicating by name.
    pub fn merge_whatevercast_names(&mut self, names: Vec<WhatevercastName>) {
        for name in names {
            if !self.whatevercast_names.iter().any(|n| n.name == name.name) {
                self.whatevercast_names.push(name);
            }
        }
    }

    /// Merge directory-forwarding entries, deduplicating by application.
    pub fn merge_dft_entries(&mut self, entries: Vec<DftEntry>) {
        for entry in entries {
            if !self.dft_entries.iter().any(|e| e.app_name == entry.app_name) {
                self.dft_entries.push(entry);
            }
        }
    }

    /// Create or update neighbors from pushed descriptors.
    pub fn merge_neighbor_descriptors(&mut self, descriptors: Vec<NeighborDescriptor>) {
        for d in descriptors {
            let neighbor = self
                .neighbors
                .entry(d.name.clone())
                .or_insert_with(|| Neighbor::new(&d.name));
            neighbor.address = d.address;
            neighbor.supporting_difs = d.supporting_difs;
        }
    }

    pub fn upsert_neighbor(&mut self, neighbor: Neighbor) {
        self.neighbors.insert(neighbor.name.clone(), neighbor);
    }

    pub fn neighbor(&self, name: &str) -> Option<&Neighbor> {
        self.neighbors.get(name)
    }

    pub fn neighbor_mut(&mut self, name: &str) -> Option<&mut Neighbor> {
        self.neighbors.get_mut(name)
    }

    pub fn remove_neighbor(&mut self, name: &str) -> Option<Neighbor> {
        tracing::debug!(name, "removing neighbor");
        self.neighbors.remove(name)
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.values()
    }

    /// Descriptors for every known neighbor, for pushing to an enrollee.
    pub fn neighbor_descriptors(&self) -> Vec<NeighborDescriptor> {
        self.neighbors
            .values()
            .map(|n| NeighborDescriptor {
                name: n.name.clone(),
                address: n.address,
                supporting_difs: n.supporting_difs.clone(),
            })
            .collect()
    }

    /// The next object an enrollee still needs before it can commit:
    /// DIF constants, then QoS cubes, then neighbors.
    pub fn next_missing_object(&self) -> Option<(&'static str, &'static str)> {
        if self.constants.is_none() {
            Some((
                obj::DATA_TRANSFER_CONSTANTS_CLASS,
                obj::DATA_TRANSFER_CONSTANTS_NAME,
            ))
        } else if self.qos_cubes.is_empty() {
            Some((obj::QOS_CUBE_SET_CLASS, obj::QOS_CUBE_SET_NAME))
        } else if self.neighbors.is_empty() {
            Some((obj::NEIGHBOR_SET_CLASS, obj::NEIGHBOR_SET_NAME))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(id: u32) -> QosCube {
        QosCube {
            id,
            name: format!("qos-{id}"),
            ordered: true,
            partial_delivery: false,
            max_allowable_gap: 0,
        }
    }

    #[test]
    fn missing_objects_in_order() {
        let mut rib = Rib::new("testdif");
        assert_eq!(
            rib.next_missing_object(),
            Some((
                obj::DATA_TRANSFER_CONSTANTS_CLASS,
                obj::DATA_TRANSFER_CONSTANTS_NAME
            ))
        );

        rib.create_constants(DataTransferConstants::default());
        assert_eq!(
            rib.next_missing_object(),
            Some((obj::QOS_CUBE_SET_CLASS, obj::QOS_CUBE_SET_NAME))
        );

        rib.merge_qos_cubes(vec![cube(1)]);
        assert_eq!(
            rib.next_missing_object(),
            Some((obj::NEIGHBOR_SET_CLASS, obj::NEIGHBOR_SET_NAME))
        );

        rib.upsert_neighbor(Neighbor::new("peer"));
        assert_eq!(rib.next_missing_object(), None);
    }

    #[test]
    fn constants_create_is_idempotent() {
        let mut rib = Rib::new("testdif");
        let original = DataTransferConstants::default();
        rib.create_constants(original.clone());

        let other = DataTransferConstants {
            max_pdu_size: 1,
            ..DataTransferConstants::default()
        };
        rib.create_constants(other);
        assert_eq!(rib.constants, Some(original));
    }

    #[test]
    fn qos_merge_dedupes_by_id() {
        let mut rib = Rib::new("testdif");
        rib.merge_qos_cubes(vec![cube(1), cube(2)]);
        rib.merge_qos_cubes(vec![cube(2), cube(3)]);
        let ids: Vec<u32> = rib.qos_cubes.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn neighbor_descriptor_merge_updates_existing() {
        let mut rib = Rib::new("testdif");
        rib.upsert_neighbor(Neighbor::new("peer"));
        rib.merge_neighbor_descriptors(vec![NeighborDescriptor {
            name: "peer".into(),
            address: 9,
            supporting_difs: vec!["ethdif".into()],
        }]);
        let n = rib.neighbor("peer").unwrap();
        assert_eq!(n.address, 9);
        assert_eq!(n.supporting_difs, vec!["ethdif".to_string()]);
    }

    #[test]
    fn dft_merge_dedupes_by_app() {
        let mut rib = Rib::new("testdif");
        rib.merge_dft_entries(vec![DftEntry {
            app_name: "app-1".into(),
            address: 5,
        }]);
        rib.merge_dft_entries(vec![DftEntry {
            app_name: "app-1".into(),
            address: 6,
        }]);
        assert_eq!(rib.dft_entries.len(), 1);
        assert_eq!(rib.dft_entries[0].address, 5);
    }
}
