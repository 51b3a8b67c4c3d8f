/*!
# Capsule Core

Session persistence and recovery for molecular graphics scenes.

This crate snapshots a live scene (molecules, maps, reflection data and
viewer state) into a quota-aware key-value store, and rebuilds an identical
scene from any snapshot while coordinating with an asynchronous compute
engine that owns the authoritative molecular data.

- Automatic backups every few structural edits, manual backups on request
- Map grids and reflection files stored once and shared between backups
- Retention limit on automatic backups with oldest-first eviction
- Portable, self-contained session export and import
- Store failures degrade to "backup skipped" instead of surfacing as errors

## Architecture

The store and the engine are ports:
- [`KeyValueStore`] with in-memory and directory adapters
- [`EngineClient`] injected into every entity and into the capsule

[`BackupStore`] manages the store alone; [`TimeCapsule`] adds the scene and
the engine, and serialises backups and restores behind one async lock.

## Usage

```rust,no_run
use capsule_core::{CapsuleConfig, EngineHandle, MemoryStore, Scene, TimeCapsule};

# async fn example(engine: EngineHandle) -> capsule_core::Result<()> {
let scene = Scene::new().shared();
let capsule = TimeCapsule::new(MemoryStore::new(), engine, scene, CapsuleConfig::default());
capsule.init().await;

// After each structural edit
capsule.add_modification().await;

// Restore the newest backup
capsule.restore_last_backup().await?;
# Ok(())
# }
```
*/

pub mod capsule;
pub mod compression;
pub mod config;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod key;
pub mod observability;
pub mod restore;
pub mod scene;
pub mod session;
pub mod store;

pub use capsule::{BackupStore, DataFileSync, DataFiles, TimeCapsule, SESSION_FILE_NAME};
pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{CapsuleConfig, ContourSync, StoreBackend, StoreConfig};
pub use engine::{
    CommandArg, CommandResponse, CommandResult, CommandStatus, EngineClient, EngineHandle,
};
pub use entity::{BondOptions, Map, MapColour, Molecule, SelectedColumns};
pub use error::{CapsuleError, Result};
pub use events::{SceneEvent, SceneEvents};
pub use key::{BackupEntry, BackupKey, BackupKind, StoreKey, SCHEMA_VERSION};
pub use restore::{LoadedEntity, RestoreSummary};
pub use scene::{Scene, SharedScene, ViewState};
pub use session::{inline_session, load_data_file, BackupSession, MapSessionData, MoleculeSessionData};
pub use store::{create_store_from_config, DirectoryStore, KeyValueStore, MemoryStore, StoredValue};

#[cfg(test)]
mod error_tests;
#[cfg(test)]
mod key_tests;
#[cfg(test)]
mod restore_tests;
