/*!
Live scene: the molecules and maps currently loaded, plus viewer state.
*/

use crate::entity::{Map, Molecule};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Scene shared between the application and the time capsule
pub type SharedScene = Arc<RwLock<Scene>>;

/// Camera, lighting, fog and clipping state of the viewer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViewState {
    pub origin: [f64; 3],
    pub background_color: [f64; 4],
    pub ambient_light: [f64; 4],
    pub diffuse_light: [f64; 4],
    pub specular_light: [f64; 4],
    pub light_position: [f64; 4],
    pub fog_start: f64,
    pub fog_end: f64,
    pub clip_start: f64,
    pub clip_end: f64,
    pub zoom: f64,
    pub quat4: [f64; 4],
    #[serde(default)]
    pub atom_label_depth_mode: bool,
    #[serde(default)]
    pub do_draw_clicked_atom_lines: bool,
}

impl Default for ViewState {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            background_color: [1.0, 1.0, 1.0, 1.0],
            ambient_light: [0.1, 0.1, 0.1, 1.0],
            diffuse_light: [1.0, 1.0, 1.0, 1.0],
            specular_light: [0.4, 0.4, 0.4, 1.0],
            light_position: [10.0, 10.0, 60.0, 1.0],
            fog_start: 0.0,
            fog_end: 1000.0,
            clip_start: 0.0,
            clip_end: 1000.0,
            zoom: 1.0,
            quat4: [0.0, 0.0, 0.0, -1.0],
            atom_label_depth_mode: true,
            do_draw_clicked_atom_lines: false,
        }
    }
}

/// Entities in display order plus the viewer state
#[derive(Debug, Default)]
pub struct Scene {
    pub molecules: Vec<Molecule>,
    pub maps: Vec<Map>,
    active_map: Option<i32>,
    pub view: ViewState,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the scene for sharing with a time capsule.
    pub fn shared(self) -> SharedScene {
        Arc::new(RwLock::new(self))
    }

    pub fn add_molecule(&mut self, molecule: Molecule) {
        self.molecules.push(molecule);
    }

    /// Add a map; the first map added becomes active.
    pub fn add_map(&mut self, map: Map) {
        if self.active_map.is_none() {
            self.active_map = Some(map.mol_no);
        }
        self.maps.push(map);
    }

    pub fn molecule(&self, mol_no: i32) -> Option<&Molecule> {
        self.molecules.iter().find(|m| m.mol_no == mol_no)
    }

    pub fn molecule_mut(&mut self, mol_no: i32) -> Option<&mut Molecule> {
        self.molecules.iter_mut().find(|m| m.mol_no == mol_no)
    }

    pub fn map(&self, mol_no: i32) -> Option<&Map> {
        self.maps.iter().find(|m| m.mol_no == mol_no)
    }

    pub fn map_mut(&mut self, mol_no: i32) -> Option<&mut Map> {
        self.maps.iter_mut().find(|m| m.mol_no == mol_no)
    }

    /// Detach a molecule from the scene; the caller deletes it.
    pub fn remove_molecule(&mut self, mol_no: i32) -> Option<Molecule> {
        let index = self.molecules.iter().position(|m| m.mol_no == mol_no)?;
        Some(self.molecules.remove(index))
    }

    /// Detach a map from the scene; the caller deletes it.
    pub fn remove_map(&mut self, mol_no: i32) -> Option<Map> {
        let index = self.maps.iter().position(|m| m.mol_no == mol_no)?;
        if self.active_map == Some(mol_no) {
            self.active_map = None;
        }
        Some(self.maps.remove(index))
    }

    /// Select the active map by `mol_no`; unknown ids clear the selection.
    pub fn set_active_map(&mut self, mol_no: Option<i32>) {
        self.active_map = mol_no.filter(|id| self.maps.iter().any(|m| m.mol_no == *id));
    }

    pub fn active_map(&self) -> Option<&Map> {
        self.active_map.and_then(|id| self.map(id))
    }

    /// Position of the active map in the map list.
    pub fn active_map_index(&self) -> Option<usize> {
        let id = self.active_map?;
        self.maps.iter().position(|m| m.mol_no == id)
    }

    /// Detach every entity, leaving the viewer state in place.
    pub fn take_entities(&mut self) -> (Vec<Molecule>, Vec<Map>) {
        self.active_map = None;
        (
            std::mem::take(&mut self.molecules),
            std::mem::take(&mut self.maps),
        )
    }
}
