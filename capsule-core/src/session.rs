/*!
Session snapshot documents.

A [`BackupSession`] captures every live entity plus the viewer state. When
`includes_additional_map_data` is set, map grids and reflection data are
inlined and the document is portable; otherwise maps carry only their
`unique_id` and the payloads must be present in the store that holds the
session.
*/

use crate::entity::{BondOptions, Map, MapColour, Molecule, SelectedColumns};
use crate::key::{BackupKey, StoreKey};
use crate::scene::ViewState;
use crate::store::KeyValueStore;
use crate::{CapsuleError, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::debug;

/// Saved state of one molecule
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MoleculeSessionData {
    pub name: String,
    /// Engine id at snapshot time; never trusted as a live handle
    pub mol_no: i32,
    pub pdb_data: String,
    #[serde(default)]
    pub display_objects_keys: Vec<String>,
    #[serde(default)]
    pub coot_bonds_options: BondOptions,
    #[serde(default)]
    pub connected_to_maps: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ligand_dicts: BTreeMap<String, String>,
}

impl MoleculeSessionData {
    /// Record a molecule with freshly fetched coordinates.
    pub fn capture(molecule: &Molecule, pdb_data: String) -> Self {
        Self {
            name: molecule.name.clone(),
            mol_no: molecule.mol_no,
            pdb_data,
            display_objects_keys: molecule.active_styles(),
            coot_bonds_options: molecule.bond_options.clone(),
            connected_to_maps: molecule.connected_to_maps.clone(),
            ligand_dicts: molecule.ligand_dicts().clone(),
        }
    }
}

/// Saved state of one map
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MapSessionData {
    pub name: String,
    /// Engine id at snapshot time; only used to resolve `connectedToMaps`
    pub mol_no: i32,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default, with = "payload")]
    pub map_data: Option<Bytes>,
    #[serde(default, with = "payload")]
    pub reflection_data: Option<Bytes>,
    #[serde(default = "default_true")]
    pub coot_contour: bool,
    pub contour_level: f64,
    pub radius: f64,
    #[serde(default)]
    pub colour: MapColour,
    #[serde(default)]
    pub lit_lines: bool,
    #[serde(default)]
    pub is_difference: bool,
    #[serde(default)]
    pub selected_columns: Option<SelectedColumns>,
    #[serde(default)]
    pub has_reflection_data: bool,
    #[serde(default)]
    pub associated_reflection_file_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl MapSessionData {
    /// Record a map with optional inlined payloads.
    pub fn capture(map: &Map, map_data: Option<Bytes>, reflection_data: Option<Bytes>) -> Self {
        Self {
            name: map.name.clone(),
            mol_no: map.mol_no,
            unique_id: Some(map.unique_id.clone()),
            map_data,
            reflection_data,
            coot_contour: map.coot_contour,
            contour_level: map.contour_level,
            radius: map.radius,
            colour: map.colour,
            lit_lines: map.lit_lines,
            is_difference: map.is_difference,
            selected_columns: map.selected_columns.clone(),
            has_reflection_data: map.has_reflection_data,
            associated_reflection_file_name: map.associated_reflection_file_name.clone(),
        }
    }

    /// Reflection file recorded for a map that has reflection data.
    pub fn reflection_file(&self) -> Option<&str> {
        if self.has_reflection_data {
            self.associated_reflection_file_name.as_deref()
        } else {
            None
        }
    }
}

/// Point-in-time snapshot of a scene
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSession {
    pub includes_additional_map_data: bool,
    #[serde(default)]
    pub molecule_data: Vec<MoleculeSessionData>,
    #[serde(default)]
    pub map_data: Vec<MapSessionData>,
    /// Position of the active map in `map_data`
    #[serde(
        default,
        serialize_with = "index_to_json",
        deserialize_with = "index_from_json"
    )]
    pub active_map_index: Option<usize>,
    #[serde(flatten)]
    pub view: ViewState,
}

impl BackupSession {
    /// Parse a session document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| CapsuleError::invalid_session(format!("Malformed session JSON: {e}")))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Backup descriptor naming what this session references.
    pub fn backup_key(&self, date_time: i64) -> BackupKey {
        BackupKey::new(
            date_time,
            self.molecule_data.iter().map(|m| m.name.clone()).collect(),
            self.map_data
                .iter()
                .filter_map(|m| m.unique_id.clone())
                .collect(),
            self.map_data
                .iter()
                .filter_map(|m| m.reflection_file().map(str::to_string))
                .collect(),
        )
    }

    /// Check the document can be restored, before any scene state is touched.
    pub fn validate(&self) -> Result<()> {
        for (index, map) in self.map_data.iter().enumerate() {
            if self.includes_additional_map_data {
                if map.map_data.is_none() {
                    return Err(CapsuleError::invalid_session(format!(
                        "map {index} ('{}') has no inlined grid",
                        map.name
                    )));
                }
            } else if map.unique_id.is_none() {
                return Err(CapsuleError::invalid_session(format!(
                    "map {index} ('{}') has neither a grid nor a uniqueId",
                    map.name
                )));
            }
        }

        if let Some(index) = self.active_map_index {
            if index >= self.map_data.len() {
                return Err(CapsuleError::invalid_session(format!(
                    "activeMapIndex {index} out of range for {} maps",
                    self.map_data.len()
                )));
            }
        }
        Ok(())
    }

    /// Position of the map record that had `mol_no` at snapshot time.
    pub fn map_position(&self, mol_no: i32) -> Option<usize> {
        self.map_data.iter().position(|m| m.mol_no == mol_no)
    }

    /// Total inlined payload bytes.
    pub fn payload_bytes(&self) -> usize {
        self.map_data
            .iter()
            .map(|m| {
                m.map_data.as_ref().map_or(0, Bytes::len)
                    + m.reflection_data.as_ref().map_or(0, Bytes::len)
            })
            .sum()
    }
}

/// Read a deduplicated data file, failing with `NotFound` when absent.
pub async fn load_data_file<S>(store: &S, key: &StoreKey) -> Result<Bytes>
where
    S: KeyValueStore + ?Sized,
{
    let name = key.data_file_name().unwrap_or_default();
    match store.get_item(&key.to_key_string()?).await? {
        Some(value) => Ok(value.into_bytes()),
        None => Err(CapsuleError::not_found(key.kind_name(), name)),
    }
}

/// Resolve a reference-only session into a self-contained one.
///
/// Map grids and reflection data are read from `store`; a missing payload
/// fails with [`CapsuleError::NotFound`]. Already inlined sessions are
/// returned unchanged.
pub async fn inline_session<S>(mut session: BackupSession, store: &S) -> Result<BackupSession>
where
    S: KeyValueStore + ?Sized,
{
    if session.includes_additional_map_data {
        return Ok(session);
    }

    for map in &mut session.map_data {
        if map.map_data.is_none() {
            let unique_id = map.unique_id.clone().ok_or_else(|| {
                CapsuleError::invalid_session(format!("map '{}' has no uniqueId", map.name))
            })?;
            map.map_data = Some(load_data_file(store, &StoreKey::map_data(unique_id)).await?);
        }
        if map.reflection_data.is_none() {
            if let Some(file) = map.reflection_file().map(str::to_string) {
                map.reflection_data = Some(load_data_file(store, &StoreKey::mtz_data(file)).await?);
            }
        }
    }

    session.includes_additional_map_data = true;
    debug!(
        maps = session.map_data.len(),
        bytes = session.payload_bytes(),
        "session inlined"
    );
    Ok(session)
}

fn index_to_json<S: Serializer>(value: &Option<usize>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(index) => serializer.serialize_u64(*index as u64),
        None => serializer.serialize_i64(-1),
    }
}

fn index_from_json<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<usize>, D::Error> {
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw.and_then(|index| usize::try_from(index).ok()))
}

/// Binary payloads as JSON arrays of bytes.
///
/// Documents written by browsers may hold typed arrays as objects keyed by
/// index (`{"0": 12, "1": 7}`); those are accepted on input.
mod payload {
    use bytes::Bytes;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<u8>),
        Indexed(BTreeMap<String, u8>),
    }

    pub fn serialize<S: Serializer>(value: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(data) => serializer.serialize_bytes(data),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::List(data)) => Ok(Some(Bytes::from(data))),
            Some(Raw::Indexed(entries)) => {
                let mut indexed = entries
                    .into_iter()
                    .map(|(index, byte)| index.parse::<usize>().map(|i| (i, byte)))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(D::Error::custom)?;
                indexed.sort_unstable_by_key(|(index, _)| *index);
                Ok(Some(indexed.into_iter().map(|(_, byte)| byte).collect()))
            }
        }
    }
}
