/*!
Tests for session restore: round trips, payload resolution, map re-linking
and contour hand-off.
*/

#[cfg(test)]
mod tests {
    use crate::config::{CapsuleConfig, ContourSync};
    use crate::engine::commands;
    use crate::engine::fake::{sample_scene, FakeEngine, SampleIds};
    use crate::events::SceneEvent;
    use crate::key::StoreKey;
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::{CapsuleError, CommandArg, TimeCapsule};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const DICTIONARY: &str = "data_comp_LIG\n_chem_comp.id LIG\n_chem_comp.name ligand\n";

    fn config(contour_sync: ContourSync) -> CapsuleConfig {
        CapsuleConfig {
            contour_sync,
            ..CapsuleConfig::default()
        }
    }

    async fn capsule_with(
        config: CapsuleConfig,
    ) -> (TimeCapsule<MemoryStore>, Arc<FakeEngine>, SampleIds) {
        let engine = FakeEngine::new();
        let (scene, ids) = sample_scene(&engine).await;
        let capsule = TimeCapsule::new(MemoryStore::new(), engine.handle(), scene.shared(), config);
        capsule.init().await;
        (capsule, engine, ids)
    }

    async fn immediate_capsule() -> (TimeCapsule<MemoryStore>, Arc<FakeEngine>, SampleIds) {
        capsule_with(config(ContourSync::Immediate)).await
    }

    fn drain(receiver: &mut broadcast::Receiver<SceneEvent>) -> Vec<SceneEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    fn int_args(ids: &[i32]) -> Vec<CommandArg> {
        ids.iter().map(|&id| CommandArg::from(id)).collect()
    }

    #[tokio::test]
    async fn test_export_restore_round_trip() {
        let (capsule, engine, ids) = immediate_capsule().await;
        let unique_ids: Vec<String> = {
            let scene = capsule.scene().read().await;
            scene.maps.iter().map(|m| m.unique_id.clone()).collect()
        };
        let json = capsule.export_session().await.unwrap();

        {
            let mut scene = capsule.scene().write().await;
            scene.map_mut(ids.two_fo_fc).unwrap().contour_level = 9.0;
            scene.view.origin = [0.0; 3];
        }

        let summary = capsule.load_session_json(&json).await.unwrap();
        assert_eq!(summary.molecules.len(), 1);
        assert_eq!(summary.maps.len(), 2);
        assert!(!summary.molecules.contains(&ids.molecule));

        let scene = capsule.scene().read().await;
        assert_eq!(scene.molecules[0].name, "lysozyme");
        assert_eq!(scene.molecules[0].active_styles(), vec!["CBs".to_string()]);

        let restored_ids: Vec<String> = scene.maps.iter().map(|m| m.unique_id.clone()).collect();
        assert_eq!(restored_ids, unique_ids);
        assert!((scene.maps[0].contour_level - 1.5).abs() < 1e-6);
        assert!((scene.maps[1].contour_level - 3.0).abs() < 1e-6);
        assert!(scene.maps[1].lit_lines);
        assert!(scene.maps[1].is_difference);

        assert!(scene.maps[0].has_reflection_data);
        assert_eq!(
            scene.maps[0].associated_reflection_file_name.as_deref(),
            Some("data.mtz")
        );

        for (restored, expected) in scene.view.origin.iter().zip([1.5, -2.25, 3.0]) {
            assert!((restored - expected).abs() < 1e-6);
        }
        assert_eq!(scene.active_map().map(|m| m.name.as_str()), Some("fofc"));

        assert_eq!(engine.live_molecules(), 1);
        assert_eq!(engine.live_maps(), 2);
    }

    #[tokio::test]
    async fn test_restore_last_backup_reads_payloads_from_store() {
        let (capsule, engine, _ids) = immediate_capsule().await;
        capsule.create_manual_backup().await.unwrap().unwrap();

        let summary = capsule.restore_last_backup().await.unwrap().unwrap();
        assert_eq!(summary.maps.len(), 2);

        let scene = capsule.scene().read().await;
        assert!(scene.maps[0].has_reflection_data);
        let associations = engine.calls_to(commands::ASSOCIATE_REFLECTION_DATA);
        let last = associations.last().unwrap();
        assert_eq!(last[0], CommandArg::from(summary.maps[0]));
        assert_eq!(last[2].as_bytes().map(|b| b.as_ref()), Some(&b"mtz-data"[..]));
    }

    #[tokio::test]
    async fn test_restore_last_backup_with_no_backups() {
        let (capsule, _engine, _ids) = immediate_capsule().await;
        assert!(capsule.restore_last_backup().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_map_payload_fails_before_scene_is_touched() {
        let (capsule, engine, ids) = immediate_capsule().await;
        capsule.create_manual_backup().await.unwrap().unwrap();

        let unique_id = capsule.scene().read().await.maps[0].unique_id.clone();
        capsule
            .backups()
            .store()
            .remove_item(&StoreKey::map_data(unique_id).to_key_string().unwrap())
            .await
            .unwrap();

        let err = capsule.restore_last_backup().await.unwrap_err();
        assert!(matches!(err, CapsuleError::NotFound { .. }));

        let scene = capsule.scene().read().await;
        assert!(scene.molecule(ids.molecule).is_some());
        assert_eq!(scene.maps.len(), 2);
        assert!(engine.calls_to(commands::DELETE).is_empty());
        assert!(!capsule.is_busy());
    }

    #[tokio::test]
    async fn test_malformed_session_leaves_scene_alone() {
        let (capsule, engine, ids) = immediate_capsule().await;

        let err = capsule.load_session_json("{\"mapData\": 4").await.unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidSession(_)));
        assert!(capsule.scene().read().await.molecule(ids.molecule).is_some());
        assert!(engine.calls_to(commands::DELETE).is_empty());
    }

    #[tokio::test]
    async fn test_engine_load_failure_aborts_restore() {
        let (capsule, engine, _ids) = immediate_capsule().await;
        let json = capsule.export_session().await.unwrap();
        engine.fail(commands::READ_MAP_DATA);

        let err = capsule.load_session_json(&json).await.unwrap_err();
        assert!(matches!(err, CapsuleError::Engine { .. }));
    }

    #[tokio::test]
    async fn test_failed_style_redraw_is_not_fatal() {
        let (capsule, engine, ids) = immediate_capsule().await;
        capsule
            .scene()
            .write()
            .await
            .molecule_mut(ids.molecule)
            .unwrap()
            .fetch_if_dirty_and_draw("MolecularSurface")
            .await
            .unwrap();
        let json = capsule.export_session().await.unwrap();
        engine.fail(commands::GET_REPRESENTATION_MESH);

        capsule.load_session_json(&json).await.unwrap();
        let scene = capsule.scene().read().await;
        assert_eq!(scene.molecules[0].active_styles(), vec!["CBs".to_string()]);
    }

    #[tokio::test]
    async fn test_ligand_dictionaries_reapplied() {
        let (capsule, engine, ids) = immediate_capsule().await;
        capsule
            .scene()
            .write()
            .await
            .molecule_mut(ids.molecule)
            .unwrap()
            .add_dict(DICTIONARY)
            .await
            .unwrap();
        let json = capsule.export_session().await.unwrap();

        let summary = capsule.load_session_json(&json).await.unwrap();
        let reads = engine.calls_to(commands::READ_DICTIONARY);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[1][1], CommandArg::from(summary.molecules[0]));

        let scene = capsule.scene().read().await;
        assert!(scene.molecules[0].ligand_dicts().contains_key("LIG"));
    }

    #[tokio::test]
    async fn test_connected_maps_are_relinked() {
        let (capsule, engine, ids) = immediate_capsule().await;
        capsule
            .scene()
            .write()
            .await
            .molecule_mut(ids.molecule)
            .unwrap()
            .connected_to_maps = Some(vec![ids.two_fo_fc, ids.two_fo_fc, ids.fo_fc]);
        let json = capsule.export_session().await.unwrap();

        let mut events = capsule.events().subscribe();
        let summary = capsule.load_session_json(&json).await.unwrap();
        let molecule = summary.molecules[0];
        let [two_fo_fc, fo_fc] = [summary.maps[0], summary.maps[1]];
        assert_eq!(summary.linked_molecules, vec![molecule]);

        assert_eq!(
            engine.calls_to(commands::CONNECT_UPDATING_MAPS),
            vec![int_args(&[molecule, two_fo_fc, two_fo_fc, fo_fc])]
        );
        assert_eq!(
            engine.calls_to(commands::SFCALC_GENMAPS),
            vec![int_args(&[molecule, two_fo_fc, fo_fc, two_fo_fc])]
        );

        let connect = drain(&mut events)
            .into_iter()
            .find(|event| matches!(event, SceneEvent::ConnectMaps { .. }))
            .unwrap();
        assert_eq!(
            connect,
            SceneEvent::ConnectMaps {
                molecule,
                maps: [two_fo_fc, two_fo_fc, fo_fc],
                unique_maps: vec![two_fo_fc, fo_fc],
            }
        );

        let scene = capsule.scene().read().await;
        assert_eq!(
            scene.molecule(molecule).unwrap().connected_to_maps,
            Some(vec![two_fo_fc, two_fo_fc, fo_fc])
        );
    }

    #[tokio::test]
    async fn test_unresolvable_connection_is_skipped() {
        let (capsule, engine, ids) = immediate_capsule().await;
        capsule
            .scene()
            .write()
            .await
            .molecule_mut(ids.molecule)
            .unwrap()
            .connected_to_maps = Some(vec![97, 98, 99]);
        let json = capsule.export_session().await.unwrap();

        let summary = capsule.load_session_json(&json).await.unwrap();
        assert!(summary.linked_molecules.is_empty());
        assert!(engine.calls_to(commands::CONNECT_UPDATING_MAPS).is_empty());
    }

    #[tokio::test]
    async fn test_contours_broadcast_in_map_order() {
        let (capsule, _engine, _ids) = immediate_capsule().await;
        let json = capsule.export_session().await.unwrap();

        let mut events = capsule.events().subscribe();
        let summary = capsule.load_session_json(&json).await.unwrap();
        let events = drain(&mut events);

        let contours: Vec<(i32, f64)> = events
            .iter()
            .filter_map(|event| match event {
                SceneEvent::NewMapContour {
                    mol_no,
                    contour_level,
                    ..
                } => Some((*mol_no, *contour_level)),
                _ => None,
            })
            .collect();
        assert_eq!(contours, vec![(summary.maps[0], 1.5), (summary.maps[1], 3.0)]);

        assert_eq!(
            events.last(),
            Some(&SceneEvent::SessionRestored {
                molecules: summary.molecules.clone(),
                maps: summary.maps.clone(),
            })
        );
    }

    #[tokio::test]
    async fn test_await_ready_falls_back_after_timeout() {
        let (capsule, _engine, _ids) = capsule_with(config(ContourSync::AwaitReady {
            timeout: Duration::from_millis(20),
        }))
        .await;
        let json = capsule.export_session().await.unwrap();

        let mut events = capsule.events().subscribe();
        capsule.load_session_json(&json).await.unwrap();
        let contours = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, SceneEvent::NewMapContour { .. }))
            .count();
        assert_eq!(contours, 2);
    }

    #[tokio::test]
    async fn test_await_ready_sends_once_maps_are_marked() {
        let (capsule, _engine, _ids) = capsule_with(config(ContourSync::AwaitReady {
            timeout: Duration::from_secs(30),
        }))
        .await;
        let json = capsule.export_session().await.unwrap();

        let old_maps: Vec<i32> = capsule.scene().read().await.maps.iter().map(|m| m.mol_no).collect();
        let scene = capsule.scene().clone();
        let hub = capsule.events().clone();
        let marker = tokio::spawn(async move {
            loop {
                let fresh: Vec<i32> = scene
                    .read()
                    .await
                    .maps
                    .iter()
                    .map(|m| m.mol_no)
                    .filter(|id| !old_maps.contains(id))
                    .collect();
                if fresh.len() == 2 {
                    for id in fresh {
                        hub.mark_map_ready(id);
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let started = tokio::time::Instant::now();
        let summary = capsule.load_session_json(&json).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        marker.await.unwrap();

        for id in summary.maps {
            assert!(capsule.events().is_map_ready(id));
        }
    }

    #[tokio::test]
    async fn test_restore_accepts_legacy_no_active_map() {
        let (capsule, _engine, _ids) = immediate_capsule().await;
        let mut document: serde_json::Value =
            serde_json::from_str(&capsule.export_session().await.unwrap()).unwrap();
        document["activeMapIndex"] = serde_json::json!(-1);

        capsule.load_session_json(&document.to_string()).await.unwrap();
        assert!(capsule.scene().read().await.active_map().is_none());
    }

    #[tokio::test]
    async fn test_load_session_file() {
        let (capsule, _engine, _ids) = immediate_capsule().await;
        let dir = tempfile::tempdir().unwrap();
        let path = capsule.export_session_to(dir.path().join("saved.json")).await.unwrap();

        let summary = capsule.load_session_file(&path).await.unwrap();
        assert_eq!(summary.molecules.len(), 1);
        assert_eq!(summary.maps.len(), 2);
    }
}
