/*!
Entity state objects.

A [`Molecule`] or [`Map`] mirrors one object living inside the compute engine.
The engine-assigned `mol_no` is only valid while the engine is alive; a map's
`unique_id` is stable across sessions and names its grid in the backup store.
*/

use crate::engine::{commands, run, CommandArg, EngineHandle};
use crate::{CapsuleError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// File extensions stripped from molecule names on load
const COORDINATE_EXTENSIONS: [&str; 4] = [".pdb", ".ent", ".cif", ".mmcif"];

/// Styles drawn from the bonds mesh; every other style uses the representation mesh
const BOND_STYLES: [&str; 3] = ["CBs", "CAs", "ligands"];

const DICT_BLOCK_PREFIX: &str = "data_comp_";

/// Bond rendering parameters
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BondOptions {
    pub is_dark_background: bool,
    pub smoothness: u32,
    pub width: f64,
    pub atom_radius_bond_ratio: f64,
}

impl Default for BondOptions {
    fn default() -> Self {
        Self {
            is_dark_background: false,
            smoothness: 1,
            width: 0.1,
            atom_radius_bond_ratio: 1.0,
        }
    }
}

/// A molecular model loaded into the engine
pub struct Molecule {
    pub mol_no: i32,
    pub name: String,
    atoms: Option<String>,
    atoms_dirty: bool,
    display_objects: BTreeMap<String, Vec<Bytes>>,
    pub bond_options: BondOptions,
    ligand_dicts: BTreeMap<String, String>,
    /// `[reflection map, 2Fo-Fc map, Fo-Fc map]` of a live refinement linkage
    pub connected_to_maps: Option<Vec<i32>>,
    engine: EngineHandle,
}

impl Molecule {
    /// Read coordinates into the engine and wrap the new molecule.
    ///
    /// Coordinate-file extensions are stripped from `name`.
    pub async fn load_from_str(engine: EngineHandle, coordinates: &str, name: &str) -> Result<Self> {
        let name = strip_coordinate_extension(name);
        let mol_no = engine
            .command(
                commands::READ_COORDINATES,
                vec![coordinates.into(), name.as_str().into()],
            )
            .await?
            .into_mol_no(commands::READ_COORDINATES)?;

        debug!(mol_no, name = %name, "molecule loaded");

        Ok(Self {
            mol_no,
            name,
            atoms: Some(coordinates.to_string()),
            atoms_dirty: false,
            display_objects: BTreeMap::new(),
            bond_options: BondOptions::default(),
            ligand_dicts: BTreeMap::new(),
            connected_to_maps: None,
            engine,
        })
    }

    /// Current coordinates, always read from the engine.
    pub async fn fetch_atoms(&self) -> Result<String> {
        self.engine
            .command(commands::GET_ATOMS, vec![self.mol_no.into(), "pdb".into()])
            .await?
            .into_text(commands::GET_ATOMS)
    }

    /// Refresh the cached coordinates and clear the dirty flag.
    pub async fn update_atoms(&mut self) -> Result<()> {
        self.atoms = Some(self.fetch_atoms().await?);
        self.atoms_dirty = false;
        Ok(())
    }

    pub fn set_atoms_dirty(&mut self, dirty: bool) {
        self.atoms_dirty = dirty;
    }

    pub fn atoms_dirty(&self) -> bool {
        self.atoms_dirty
    }

    /// Coordinates as of the last refresh.
    pub fn cached_atoms(&self) -> Option<&str> {
        self.atoms.as_deref()
    }

    /// Refresh atoms if they are dirty, then fetch the mesh for `style`.
    pub async fn fetch_if_dirty_and_draw(&mut self, style: &str) -> Result<()> {
        if self.atoms_dirty || self.atoms.is_none() {
            self.update_atoms().await?;
        }

        let command = if BOND_STYLES.contains(&style) {
            commands::GET_BONDS_MESH
        } else {
            commands::GET_REPRESENTATION_MESH
        };
        let mesh = self
            .engine
            .command(command, vec![self.mol_no.into(), style.into()])
            .await?
            .into_bytes(command)?;

        self.display_objects.insert(style.to_string(), vec![mesh]);
        Ok(())
    }

    pub fn clear_style(&mut self, style: &str) {
        self.display_objects.remove(style);
    }

    /// Styles with at least one buffer, in name order.
    pub fn active_styles(&self) -> Vec<String> {
        self.display_objects
            .iter()
            .filter(|(_, buffers)| !buffers.is_empty())
            .map(|(style, _)| style.clone())
            .collect()
    }

    /// Read a monomer dictionary into the engine and record its components.
    ///
    /// Multi-compound files are split on their `data_comp_<id>` blocks; each
    /// component is kept under its id.
    pub async fn add_dict(&mut self, cif: &str) -> Result<()> {
        run(
            self.engine.as_ref(),
            commands::READ_DICTIONARY,
            vec![cif.into(), self.mol_no.into()],
        )
        .await?;

        for (comp_id, block) in split_dictionary(cif) {
            self.ligand_dicts.insert(comp_id, block);
        }
        Ok(())
    }

    pub fn ligand_dicts(&self) -> &BTreeMap<String, String> {
        &self.ligand_dicts
    }

    /// Load a copy of the current coordinates as a new molecule.
    pub async fn copy(&self) -> Result<Molecule> {
        let atoms = self.fetch_atoms().await?;
        let mut copy = Molecule::load_from_str(
            self.engine.clone(),
            &atoms,
            &format!("{}-placeholder", self.name),
        )
        .await?;
        copy.bond_options = self.bond_options.clone();

        for dict in self.ligand_dicts.values() {
            copy.add_dict(dict).await?;
        }
        copy.fetch_if_dirty_and_draw("CBs").await?;
        Ok(copy)
    }

    /// Free the molecule engine-side.
    pub async fn delete(self) -> Result<()> {
        run(self.engine.as_ref(), commands::DELETE, vec![self.mol_no.into()]).await?;
        debug!(mol_no = self.mol_no, "molecule deleted");
        Ok(())
    }
}

impl fmt::Debug for Molecule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Molecule")
            .field("mol_no", &self.mol_no)
            .field("name", &self.name)
            .field("atoms_dirty", &self.atoms_dirty)
            .field("styles", &self.active_styles())
            .field("connected_to_maps", &self.connected_to_maps)
            .finish_non_exhaustive()
    }
}

/// Map colour as RGB fractions
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MapColour {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Default for MapColour {
    fn default() -> Self {
        Self { r: 0.3, g: 0.3, b: 0.8 }
    }
}

/// Structure-factor and phase columns picked from a reflection file
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedColumns {
    #[serde(rename = "F", default, skip_serializing_if = "Option::is_none")]
    pub f: Option<String>,
    #[serde(rename = "PHI", default, skip_serializing_if = "Option::is_none")]
    pub phi: Option<String>,
    #[serde(rename = "Fobs", default, skip_serializing_if = "Option::is_none")]
    pub f_obs: Option<String>,
    #[serde(rename = "SigFobs", default, skip_serializing_if = "Option::is_none")]
    pub sig_f_obs: Option<String>,
    #[serde(rename = "FreeR", default, skip_serializing_if = "Option::is_none")]
    pub free_r: Option<String>,
    #[serde(default)]
    pub is_difference: bool,
    #[serde(default)]
    pub use_weight: bool,
    #[serde(default)]
    pub calc_struct_fact: bool,
}

/// An electron-density map loaded into the engine
pub struct Map {
    pub mol_no: i32,
    pub name: String,
    pub unique_id: String,
    pub contour_level: f64,
    pub radius: f64,
    pub colour: MapColour,
    pub lit_lines: bool,
    pub coot_contour: bool,
    pub is_difference: bool,
    pub selected_columns: Option<SelectedColumns>,
    pub associated_reflection_file_name: Option<String>,
    pub has_reflection_data: bool,
    engine: EngineHandle,
}

impl Map {
    /// Read a map grid into the engine; the map gets a fresh `unique_id`.
    pub async fn load_from_map_data(
        engine: EngineHandle,
        data: Bytes,
        name: &str,
        is_difference: bool,
    ) -> Result<Self> {
        let mol_no = engine
            .command(
                commands::READ_MAP_DATA,
                vec![data.into(), name.into(), is_difference.into()],
            )
            .await?
            .into_mol_no(commands::READ_MAP_DATA)?;

        debug!(mol_no, name, "map loaded");

        Ok(Self {
            mol_no,
            name: name.to_string(),
            unique_id: Uuid::new_v4().to_string(),
            contour_level: 0.8,
            radius: 13.0,
            colour: MapColour::default(),
            lit_lines: false,
            coot_contour: true,
            is_difference,
            selected_columns: None,
            associated_reflection_file_name: None,
            has_reflection_data: false,
            engine,
        })
    }

    /// Binary grid as held by the engine.
    pub async fn get_map(&self) -> Result<Bytes> {
        self.engine
            .command(commands::GET_MAP, vec![self.mol_no.into()])
            .await?
            .into_bytes(commands::GET_MAP)
    }

    /// Reflection data associated with this map.
    pub async fn fetch_reflection_data(&self) -> Result<Bytes> {
        if !self.has_reflection_data {
            return Err(CapsuleError::engine(
                commands::GET_REFLECTION_DATA,
                format!("map {} has no reflection data", self.mol_no),
            ));
        }
        self.engine
            .command(commands::GET_REFLECTION_DATA, vec![self.mol_no.into()])
            .await?
            .into_bytes(commands::GET_REFLECTION_DATA)
    }

    /// Attach reflection data to the map engine-side.
    ///
    /// `columns` must name the observed amplitudes, their sigmas and the
    /// free-R flags.
    pub async fn associate_to_reflection_data(
        &mut self,
        file_name: &str,
        columns: SelectedColumns,
        data: Bytes,
    ) -> Result<()> {
        let (Some(f_obs), Some(sig_f_obs), Some(free_r)) = (
            columns.f_obs.clone(),
            columns.sig_f_obs.clone(),
            columns.free_r.clone(),
        ) else {
            return Err(CapsuleError::validation(format!(
                "map {} needs Fobs, SigFobs and FreeR columns to attach reflection data",
                self.mol_no
            )));
        };

        run(
            self.engine.as_ref(),
            commands::ASSOCIATE_REFLECTION_DATA,
            vec![
                self.mol_no.into(),
                file_name.into(),
                data.into(),
                f_obs.into(),
                sig_f_obs.into(),
                free_r.into(),
            ],
        )
        .await?;

        self.selected_columns = Some(columns);
        self.associated_reflection_file_name = Some(file_name.to_string());
        self.has_reflection_data = true;
        Ok(())
    }

    /// Free the map engine-side.
    pub async fn delete(self) -> Result<()> {
        run(self.engine.as_ref(), commands::DELETE, vec![self.mol_no.into()]).await?;
        debug!(mol_no = self.mol_no, "map deleted");
        Ok(())
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("mol_no", &self.mol_no)
            .field("name", &self.name)
            .field("unique_id", &self.unique_id)
            .field("contour_level", &self.contour_level)
            .field("has_reflection_data", &self.has_reflection_data)
            .finish_non_exhaustive()
    }
}

fn strip_coordinate_extension(name: &str) -> String {
    COORDINATE_EXTENSIONS
        .iter()
        .find_map(|ext| name.strip_suffix(ext))
        .unwrap_or(name)
        .to_string()
}

/// Split a CIF dictionary into `(component id, block)` pairs.
///
/// Lines are trimmed; anything before the first block belongs to it.
fn split_dictionary(cif: &str) -> Vec<(String, String)> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in cif.lines().map(str::trim) {
        if let Some(pos) = line.find(DICT_BLOCK_PREFIX) {
            if let Some(comp_id) = current.take() {
                blocks.push((comp_id, lines.join("\n")));
                lines.clear();
            }
            current = Some(line[pos + DICT_BLOCK_PREFIX.len()..].to_string());
        }
        lines.push(line);
    }

    if let Some(comp_id) = current {
        blocks.push((comp_id, lines.join("\n")));
    }
    blocks
}
