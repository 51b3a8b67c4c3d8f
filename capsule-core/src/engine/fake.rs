//! In-memory compute engine for unit tests.

use super::{commands, CommandArg, CommandResponse, CommandResult, EngineClient, EngineHandle};
use crate::{CapsuleError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct FakeState {
    next_mol_no: i32,
    molecules: HashMap<i32, String>,
    maps: HashMap<i32, Bytes>,
    reflections: HashMap<i32, Bytes>,
    calls: Vec<(String, Vec<CommandArg>)>,
    failing: HashSet<String>,
}

/// Engine double that keeps coordinates, grids and reflection data in maps
#[derive(Default)]
pub(crate) struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn handle(self: &Arc<Self>) -> EngineHandle {
        self.clone()
    }

    /// Make every later call of `command` answer with an exception.
    pub(crate) fn fail(&self, command: &str) {
        self.lock().failing.insert(command.to_string());
    }

    /// Replace a molecule's coordinates engine-side, as an edit would.
    pub(crate) fn set_atoms(&self, mol_no: i32, atoms: &str) {
        self.lock().molecules.insert(mol_no, atoms.to_string());
    }

    pub(crate) fn calls_to(&self, command: &str) -> Vec<Vec<CommandArg>> {
        self.lock()
            .calls
            .iter()
            .filter(|(name, _)| name == command)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub(crate) fn live_molecules(&self) -> usize {
        self.lock().molecules.len()
    }

    pub(crate) fn live_maps(&self) -> usize {
        self.lock().maps.len()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn int_arg(name: &str, args: &[CommandArg], index: usize) -> Result<i32> {
    args.get(index)
        .and_then(CommandArg::as_int)
        .map(|value| value as i32)
        .ok_or_else(|| CapsuleError::engine(name, format!("argument {index} must be an int")))
}

fn text_arg<'a>(name: &str, args: &'a [CommandArg], index: usize) -> Result<&'a str> {
    args.get(index)
        .and_then(CommandArg::as_text)
        .ok_or_else(|| CapsuleError::engine(name, format!("argument {index} must be text")))
}

fn bytes_arg(name: &str, args: &[CommandArg], index: usize) -> Result<Bytes> {
    args.get(index)
        .and_then(CommandArg::as_bytes)
        .cloned()
        .ok_or_else(|| CapsuleError::engine(name, format!("argument {index} must be bytes")))
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn command(&self, name: &str, args: Vec<CommandArg>) -> Result<CommandResponse> {
        let mut state = self.lock();
        state.calls.push((name.to_string(), args.clone()));

        if state.failing.contains(name) {
            return Ok(CommandResponse::exception(format!("{name} failed")));
        }

        let result = match name {
            commands::READ_COORDINATES => {
                let atoms = text_arg(name, &args, 0)?.to_string();
                let mol_no = state.next_mol_no;
                state.next_mol_no += 1;
                state.molecules.insert(mol_no, atoms);
                CommandResult::Int(mol_no.into())
            }
            commands::READ_MAP_DATA => {
                let data = bytes_arg(name, &args, 0)?;
                if data.is_empty() {
                    return Ok(CommandResponse::exception("empty map data"));
                }
                let mol_no = state.next_mol_no;
                state.next_mol_no += 1;
                state.maps.insert(mol_no, data);
                CommandResult::Int(mol_no.into())
            }
            commands::GET_ATOMS => {
                let mol_no = int_arg(name, &args, 0)?;
                match state.molecules.get(&mol_no) {
                    Some(atoms) => CommandResult::Text(atoms.clone()),
                    None => return Ok(CommandResponse::exception(format!("no molecule {mol_no}"))),
                }
            }
            commands::GET_MAP => {
                let mol_no = int_arg(name, &args, 0)?;
                match state.maps.get(&mol_no) {
                    Some(data) => CommandResult::Bytes(data.clone()),
                    None => return Ok(CommandResponse::exception(format!("no map {mol_no}"))),
                }
            }
            commands::GET_REFLECTION_DATA => {
                let mol_no = int_arg(name, &args, 0)?;
                match state.reflections.get(&mol_no) {
                    Some(data) => CommandResult::Bytes(data.clone()),
                    None => {
                        return Ok(CommandResponse::exception(format!(
                            "map {mol_no} has no reflection data"
                        )))
                    }
                }
            }
            commands::ASSOCIATE_REFLECTION_DATA => {
                let mol_no = int_arg(name, &args, 0)?;
                let data = bytes_arg(name, &args, 2)?;
                state.reflections.insert(mol_no, data);
                CommandResult::Status
            }
            commands::DELETE => {
                let mol_no = int_arg(name, &args, 0)?;
                state.molecules.remove(&mol_no);
                state.maps.remove(&mol_no);
                state.reflections.remove(&mol_no);
                CommandResult::Status
            }
            commands::GET_BONDS_MESH | commands::GET_REPRESENTATION_MESH => {
                let mol_no = int_arg(name, &args, 0)?;
                let style = text_arg(name, &args, 1)?;
                if !state.molecules.contains_key(&mol_no) {
                    return Ok(CommandResponse::exception(format!("no molecule {mol_no}")));
                }
                CommandResult::Bytes(Bytes::from(format!("mesh:{mol_no}:{style}")))
            }
            commands::READ_DICTIONARY
            | commands::CONNECT_UPDATING_MAPS
            | commands::SFCALC_GENMAPS => CommandResult::Status,
            other => return Ok(CommandResponse::exception(format!("unknown command {other}"))),
        };

        Ok(CommandResponse::completed(result))
    }
}

/// Handles of the entities in [`sample_scene`]
pub(crate) struct SampleIds {
    pub(crate) molecule: i32,
    pub(crate) two_fo_fc: i32,
    pub(crate) fo_fc: i32,
}

pub(crate) const SAMPLE_ATOMS: &str = "ATOM      1  N   MET A   1      27.340  24.430   2.614";

pub(crate) fn sample_columns() -> crate::entity::SelectedColumns {
    crate::entity::SelectedColumns {
        f: Some("FWT".into()),
        phi: Some("PHWT".into()),
        f_obs: Some("FP".into()),
        sig_f_obs: Some("SIGFP".into()),
        free_r: Some("FREE".into()),
        ..Default::default()
    }
}

/// One molecule drawn as bonds, a 2Fo-Fc map with reflection data attached
/// and a difference map, with the difference map active.
pub(crate) async fn sample_scene(engine: &Arc<FakeEngine>) -> (crate::scene::Scene, SampleIds) {
    use crate::entity::{Map, Molecule};

    let mut molecule = Molecule::load_from_str(engine.handle(), SAMPLE_ATOMS, "lysozyme.pdb")
        .await
        .unwrap();
    molecule.fetch_if_dirty_and_draw("CBs").await.unwrap();

    let mut two_fo_fc = Map::load_from_map_data(engine.handle(), Bytes::from_static(b"grid-2fofc"), "2fofc", false)
        .await
        .unwrap();
    two_fo_fc
        .associate_to_reflection_data("data.mtz", sample_columns(), Bytes::from_static(b"mtz-data"))
        .await
        .unwrap();
    two_fo_fc.contour_level = 1.5;

    let mut fo_fc = Map::load_from_map_data(engine.handle(), Bytes::from_static(b"grid-fofc"), "fofc", true)
        .await
        .unwrap();
    fo_fc.contour_level = 3.0;
    fo_fc.lit_lines = true;

    let ids = SampleIds {
        molecule: molecule.mol_no,
        two_fo_fc: two_fo_fc.mol_no,
        fo_fc: fo_fc.mol_no,
    };

    let mut scene = crate::scene::Scene::new();
    scene.add_molecule(molecule);
    scene.add_map(two_fo_fc);
    scene.add_map(fo_fc);
    scene.set_active_map(Some(ids.fo_fc));
    scene.view.origin = [1.5, -2.25, 3.0];
    scene.view.zoom = 2.0;
    (scene, ids)
}
