/*!
Scene notifications emitted during a restore.

Listeners subscribe to a broadcast channel. Map readiness flows the other way:
the UI marks each map ready once it can accept contour updates, and a restore
waits on that signal before broadcasting the stored contour settings.
*/

use crate::entity::MapColour;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

/// Event broadcast to scene listeners
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SceneEvent {
    /// A molecule was linked to live-updating maps
    #[serde(rename_all = "camelCase")]
    ConnectMaps {
        molecule: i32,
        /// `[reflection map, 2Fo-Fc map, Fo-Fc map]`
        maps: [i32; 3],
        unique_maps: Vec<i32>,
    },
    /// First contour of a restored map
    #[serde(rename_all = "camelCase")]
    NewMapContour {
        mol_no: i32,
        map_radius: f64,
        coot_contour: bool,
        contour_level: f64,
        map_colour: MapColour,
        lit_lines: bool,
    },
    /// A restore finished registering its entities
    SessionRestored { molecules: Vec<i32>, maps: Vec<i32> },
}

/// Event hub shared by the time capsule and its listeners
#[derive(Debug)]
pub struct SceneEvents {
    sender: broadcast::Sender<SceneEvent>,
    ready: watch::Sender<HashSet<i32>>,
}

impl Default for SceneEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SceneEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (ready, _) = watch::channel(HashSet::new());
        Self { sender, ready }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SceneEvent> {
        self.sender.subscribe()
    }

    /// Broadcast an event; returns how many listeners received it.
    pub fn emit(&self, event: SceneEvent) -> usize {
        match self.sender.send(event) {
            Ok(listeners) => listeners,
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "no scene listeners");
                0
            }
        }
    }

    /// Signal that the map `mol_no` accepts contour updates.
    pub fn mark_map_ready(&self, mol_no: i32) {
        self.ready.send_modify(|ready| {
            ready.insert(mol_no);
        });
    }

    pub fn is_map_ready(&self, mol_no: i32) -> bool {
        self.ready.borrow().contains(&mol_no)
    }

    /// Drop all readiness marks.
    pub fn forget_maps(&self) {
        self.ready.send_modify(HashSet::clear);
    }

    /// Wait until every map in `mol_nos` is ready; false on timeout.
    pub async fn wait_for_maps(&self, mol_nos: &[i32], timeout: Duration) -> bool {
        let mut receiver = self.ready.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            receiver.wait_for(|ready| mol_nos.iter().all(|id| ready.contains(id))),
        )
        .await;
        matches!(waited, Ok(Ok(_)))
    }
}
