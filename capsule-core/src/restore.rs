/*!
Session restore.

Rebuilds the scene from a [`BackupSession`] in ordered phases: tear down the
current entities, load molecules and maps into the engine concurrently,
reapply display state and reflection data, register the new entities and the
viewer state, re-link live-updating maps and finally hand each map its stored
contour settings.

Load failures abort the restore. Display, reflection and linkage failures
are logged per entity and the restore carries on.
*/

use crate::capsule::TimeCapsule;
use crate::config::ContourSync;
use crate::engine::{commands, run, CommandArg};
use crate::entity::{Map, Molecule};
use crate::events::SceneEvent;
use crate::key::{BackupEntry, StoreKey};
use crate::session::{load_data_file, BackupSession, MapSessionData, MoleculeSessionData};
use crate::store::KeyValueStore;
use crate::{CapsuleError, Result};
use bytes::Bytes;
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::observability::MetricsTimer;

/// Entity produced by the load phase
#[derive(Debug)]
pub enum LoadedEntity {
    Molecule(Molecule),
    Map(Map),
}

/// Outcome of a restore
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestoreSummary {
    /// New `mol_no` of each restored molecule, in session order
    pub molecules: Vec<i32>,
    /// New `mol_no` of each restored map, in session order
    pub maps: Vec<i32>,
    /// Molecules whose map linkage was re-established
    pub linked_molecules: Vec<i32>,
}

impl<S: KeyValueStore> TimeCapsule<S> {
    /// Replace the scene with the session in `json`.
    pub async fn load_session_json(&self, json: &str) -> Result<RestoreSummary> {
        let session = BackupSession::from_json(json)?;
        self.restore_session(session).await
    }

    /// Replace the scene with the session stored in a file.
    pub async fn load_session_file<P: AsRef<Path>>(&self, path: P) -> Result<RestoreSummary> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        self.load_session_json(&json).await
    }

    /// Replace the scene with a stored backup.
    pub async fn restore_backup(&self, entry: &BackupEntry) -> Result<RestoreSummary> {
        let session = self.backups.load_session(entry).await?;
        info!(label = %entry.label(), "restoring backup");
        self.restore_session(session).await
    }

    /// Restore the newest backup; `None` when the store holds none.
    pub async fn restore_last_backup(&self) -> Result<Option<RestoreSummary>> {
        match self.backups.retrieve_last_backup().await? {
            Some((entry, session)) => {
                info!(label = %entry.label(), "restoring newest backup");
                self.restore_session(session).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Replace the scene with `session`.
    ///
    /// Automatic backups wait until the restore completes.
    pub async fn restore_session(&self, session: BackupSession) -> Result<RestoreSummary> {
        let _guard = self.lock.lock().await;
        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start_restore();

        session.validate()?;
        let grids = self.resolve_grids(&session).await?;

        self.destroy_scene().await;

        let (mut molecules, mut maps) = self.load_entities(&session, grids).await?;
        debug!(
            molecules = molecules.len(),
            maps = maps.len(),
            "session entities loaded"
        );

        futures::join!(
            join_all(
                molecules
                    .iter_mut()
                    .zip(&session.molecule_data)
                    .map(|(molecule, record)| restore_display(molecule, record)),
            ),
            join_all(
                maps.iter_mut()
                    .zip(&session.map_data)
                    .map(|(map, record)| self.restore_reflections(map, record, &session)),
            ),
        );

        let molecule_ids: Vec<i32> = molecules.iter().map(|m| m.mol_no).collect();
        let map_ids: Vec<i32> = maps.iter().map(|m| m.mol_no).collect();

        {
            let mut scene = self.scene.write().await;
            for molecule in molecules {
                scene.add_molecule(molecule);
            }
            for map in maps {
                scene.add_map(map);
            }
            scene.set_active_map(session.active_map_index.and_then(|i| map_ids.get(i).copied()));
            scene.view = session.view.clone();
        }

        let linked_molecules = self.relink_maps(&session, &molecule_ids, &map_ids).await;

        self.broadcast_contours(&session, &map_ids).await;

        self.events.emit(SceneEvent::SessionRestored {
            molecules: molecule_ids.clone(),
            maps: map_ids.clone(),
        });

        #[cfg(feature = "metrics")]
        timer.finish();

        info!(
            molecules = molecule_ids.len(),
            maps = map_ids.len(),
            linked = linked_molecules.len(),
            "session restored"
        );
        Ok(RestoreSummary {
            molecules: molecule_ids,
            maps: map_ids,
            linked_molecules,
        })
    }

    /// Map grids for every record, read from the store for reference-only
    /// sessions. Runs before the scene is touched.
    async fn resolve_grids(&self, session: &BackupSession) -> Result<Vec<Bytes>> {
        let store = self.backups.store();
        try_join_all(session.map_data.iter().map(|record| async move {
            if let Some(data) = &record.map_data {
                return Ok(data.clone());
            }
            let unique_id = record.unique_id.clone().ok_or_else(|| {
                CapsuleError::invalid_session(format!("map '{}' has no uniqueId", record.name))
            })?;
            load_data_file(store, &StoreKey::map_data(unique_id)).await
        }))
        .await
    }

    async fn destroy_scene(&self) {
        let (molecules, maps) = self.scene.write().await.take_entities();
        self.events.forget_maps();

        let deletions = molecules
            .into_iter()
            .map(|molecule| molecule.delete().boxed())
            .chain(maps.into_iter().map(|map| map.delete().boxed()));
        for result in join_all(deletions).await {
            if let Err(e) = result {
                warn!(error = %e, "failed to free entity during restore");
            }
        }
    }

    async fn load_entities(
        &self,
        session: &BackupSession,
        grids: Vec<Bytes>,
    ) -> Result<(Vec<Molecule>, Vec<Map>)> {
        let molecule_loads = session.molecule_data.iter().map(|record| {
            let engine = self.engine.clone();
            async move {
                Molecule::load_from_str(engine, &record.pdb_data, &record.name)
                    .await
                    .map(LoadedEntity::Molecule)
            }
            .boxed()
        });

        let map_loads = session.map_data.iter().zip(grids).map(|(record, grid)| {
            let engine = self.engine.clone();
            async move {
                let mut map =
                    Map::load_from_map_data(engine, grid, &record.name, record.is_difference).await?;
                apply_map_record(&mut map, record);
                Ok::<_, CapsuleError>(LoadedEntity::Map(map))
            }
            .boxed()
        });

        let loads: Vec<BoxFuture<'_, Result<LoadedEntity>>> =
            molecule_loads.chain(map_loads).collect();

        let mut molecules = Vec::with_capacity(session.molecule_data.len());
        let mut maps = Vec::with_capacity(session.map_data.len());
        for entity in try_join_all(loads).await? {
            match entity {
                LoadedEntity::Molecule(molecule) => molecules.push(molecule),
                LoadedEntity::Map(map) => maps.push(map),
            }
        }
        Ok((molecules, maps))
    }

    async fn restore_reflections(&self, map: &mut Map, record: &MapSessionData, session: &BackupSession) {
        let (Some(file), Some(columns)) = (
            record.associated_reflection_file_name.as_deref(),
            record.selected_columns.clone(),
        ) else {
            return;
        };
        if !record.has_reflection_data && record.reflection_data.is_none() {
            return;
        }

        let data = match (&record.reflection_data, session.includes_additional_map_data) {
            (Some(data), true) => Ok(data.clone()),
            _ => load_data_file(self.backups.store(), &StoreKey::mtz_data(file)).await,
        };

        let result = match data {
            Ok(data) => map.associate_to_reflection_data(file, columns, data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(map = %record.name, file, error = %e, "failed to restore reflection data");
        }
    }

    /// Re-establish live map updates for every linked molecule.
    async fn relink_maps(
        &self,
        session: &BackupSession,
        molecule_ids: &[i32],
        map_ids: &[i32],
    ) -> Vec<i32> {
        let mut linked = Vec::new();

        for (record, &molecule) in session.molecule_data.iter().zip(molecule_ids) {
            let Some(old_ids) = &record.connected_to_maps else {
                continue;
            };

            let remapped: Option<Vec<i32>> = old_ids
                .iter()
                .map(|old| session.map_position(*old).and_then(|i| map_ids.get(i).copied()))
                .collect();
            let [reflection_map, two_fo_fc_map, fo_fc_map] = match remapped.as_deref() {
                Some(&[a, b, c]) => [a, b, c],
                _ => {
                    warn!(
                        molecule = %record.name,
                        maps = ?old_ids,
                        "connected maps do not resolve to restored maps"
                    );
                    continue;
                }
            };

            let connect = run(
                self.engine.as_ref(),
                commands::CONNECT_UPDATING_MAPS,
                int_args(&[molecule, reflection_map, two_fo_fc_map, fo_fc_map]),
            )
            .await;
            let linked_ok = match connect {
                Ok(_) => run(
                    self.engine.as_ref(),
                    commands::SFCALC_GENMAPS,
                    int_args(&[molecule, two_fo_fc_map, fo_fc_map, reflection_map]),
                )
                .await
                .map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = linked_ok {
                warn!(molecule = %record.name, error = %e, "failed to reconnect maps");
                continue;
            }

            let maps = [reflection_map, two_fo_fc_map, fo_fc_map];
            if let Some(live) = self.scene.write().await.molecule_mut(molecule) {
                live.connected_to_maps = Some(maps.to_vec());
            }

            let mut unique_maps = vec![two_fo_fc_map];
            if fo_fc_map != two_fo_fc_map {
                unique_maps.push(fo_fc_map);
            }
            self.events.emit(SceneEvent::ConnectMaps {
                molecule,
                maps,
                unique_maps,
            });
            linked.push(molecule);
        }

        linked
    }

    /// Send each restored map its stored contour once the UI can take it.
    async fn broadcast_contours(&self, session: &BackupSession, map_ids: &[i32]) {
        if map_ids.is_empty() {
            return;
        }

        if let ContourSync::AwaitReady { timeout } = self.config.contour_sync {
            if !self.events.wait_for_maps(map_ids, timeout).await {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "maps not marked ready in time, sending contours anyway"
                );
            }
        }

        for (record, &mol_no) in session.map_data.iter().zip(map_ids) {
            self.events.emit(SceneEvent::NewMapContour {
                mol_no,
                map_radius: record.radius,
                coot_contour: record.coot_contour,
                contour_level: record.contour_level,
                map_colour: record.colour,
                lit_lines: record.lit_lines,
            });
        }
    }
}

/// Bond options, ligand dictionaries and drawn styles of one molecule.
async fn restore_display(molecule: &mut Molecule, record: &MoleculeSessionData) {
    molecule.bond_options = record.coot_bonds_options.clone();

    for (comp_id, dict) in &record.ligand_dicts {
        if let Err(e) = molecule.add_dict(dict).await {
            warn!(molecule = %record.name, comp_id = %comp_id, error = %e, "failed to restore ligand dictionary");
        }
    }

    for style in &record.display_objects_keys {
        if let Err(e) = molecule.fetch_if_dirty_and_draw(style).await {
            warn!(molecule = %record.name, style = %style, error = %e, "failed to redraw style");
        }
    }
}

fn apply_map_record(map: &mut Map, record: &MapSessionData) {
    if let Some(unique_id) = &record.unique_id {
        map.unique_id = unique_id.clone();
    }
    map.contour_level = record.contour_level;
    map.radius = record.radius;
    map.colour = record.colour;
    map.lit_lines = record.lit_lines;
    map.coot_contour = record.coot_contour;
}

fn int_args(ids: &[i32]) -> Vec<CommandArg> {
    ids.iter().map(|&id| CommandArg::from(id)).collect()
}
