/*!
Backup store manager and time capsule.

[`BackupStore`] owns the key-value store: it seeds the schema version, writes
and lists backups, evicts old automatic backups and removes data files that
no retained session references. [`TimeCapsule`] ties it to a live scene and
the compute engine: it counts modifications, builds session snapshots and
serialises mutating operations behind a single async lock.

Store failures never escape the backup paths. They are logged and the
operation degrades to "backup skipped"; the editor keeps running.
*/

use crate::config::CapsuleConfig;
use crate::engine::EngineHandle;
use crate::entity::Map;
use crate::events::SceneEvents;
use crate::key::{BackupEntry, BackupKey, BackupKind, StoreKey, SCHEMA_VERSION};
use crate::scene::SharedScene;
use crate::session::{load_data_file, BackupSession, MapSessionData, MoleculeSessionData};
use crate::store::{KeyValueStore, StoredValue};
use crate::{CapsuleError, Result};
use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::observability::CapsuleMetrics;

/// File name used when exporting into a directory
pub const SESSION_FILE_NAME: &str = "session.json";

/// Names of the data files currently held by a store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataFiles {
    pub mtz: BTreeSet<String>,
    pub maps: BTreeSet<String>,
}

/// Outcome of one [`TimeCapsule::update_data_files`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFileSync {
    /// Data files written by this pass
    pub written: usize,
    /// Every payload the scene references is now in the store
    pub complete: bool,
}

/// Backup manager over a key-value store
///
/// # Example
/// ```rust
/// use capsule_core::{BackupStore, MemoryStore};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let backups = BackupStore::new(MemoryStore::new(), 10);
/// backups.init().await;
/// assert!(backups.get_sorted_keys().await?.is_empty());
/// # Ok::<(), capsule_core::CapsuleError>(())
/// # })?;
/// # Ok::<(), capsule_core::CapsuleError>(())
/// ```
pub struct BackupStore<S> {
    store: S,
    max_backup_count: usize,
    disabled: AtomicBool,
}

impl<S: KeyValueStore> BackupStore<S> {
    pub fn new(store: S, max_backup_count: usize) -> Self {
        Self {
            store,
            max_backup_count: max_backup_count.max(1),
            disabled: AtomicBool::new(false),
        }
    }

    /// Create a manager with the retention limit and gate from `config`.
    pub fn from_config(store: S, config: &CapsuleConfig) -> Self {
        let backups = Self::new(store, config.max_backup_count);
        backups.set_disabled(config.disable_backups);
        backups
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn max_backup_count(&self) -> usize {
        self.max_backup_count
    }

    pub fn backups_enabled(&self) -> bool {
        !self.disabled.load(Ordering::SeqCst)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    /// Check the schema version, wiping the store when it does not match.
    ///
    /// A store that cannot be read or written turns backups off instead of
    /// failing.
    pub async fn init(&self) {
        if let Err(e) = self.check_version().await {
            error!(error = %e, "backup store unavailable, disabling backups");
            self.set_disabled(true);
        }
    }

    async fn check_version(&self) -> Result<()> {
        let found = self.stored_version().await?;
        if found.as_deref() == Some(SCHEMA_VERSION) {
            debug!(version = SCHEMA_VERSION, "backup store version matches");
            return Ok(());
        }

        info!(
            found = ?found,
            expected = SCHEMA_VERSION,
            "backup store version mismatch, clearing store"
        );
        self.drop_all_backups().await
    }

    /// Fail on a version mismatch without modifying the store.
    pub async fn verify_version(&self) -> Result<()> {
        let found = self.stored_version().await?;
        if found.as_deref() == Some(SCHEMA_VERSION) {
            return Ok(());
        }
        Err(CapsuleError::validation(format!(
            "backup store version {} does not match {SCHEMA_VERSION}",
            found.as_deref().unwrap_or("<missing>")
        )))
    }

    async fn stored_version(&self) -> Result<Option<String>> {
        let stored = self
            .store
            .get_item(&StoreKey::Version.to_key_string()?)
            .await?;
        Ok(stored
            .as_ref()
            .and_then(StoredValue::as_text)
            .map(str::to_string))
    }

    /// Write one entry, then evict old automatic backups.
    ///
    /// Returns the key string on success. Returns `None` without touching the
    /// store when backups are disabled, and `None` after logging when the
    /// store rejects the write.
    pub async fn create_backup(&self, key: &StoreKey, value: StoredValue) -> Option<String> {
        if !self.backups_enabled() {
            return None;
        }

        let key_string = match key.to_key_string() {
            Ok(key_string) => key_string,
            Err(e) => {
                error!(error = %e, "failed to encode backup key");
                return None;
            }
        };

        let size = value.len();
        if let Err(e) = self.store.set_item(&key_string, value).await {
            warn!(key = %key_string, error = %e, "backup skipped");
            #[cfg(feature = "metrics")]
            if let Some(metrics) = CapsuleMetrics::global() {
                metrics.record_backup_skipped();
            }
            return None;
        }

        debug!(key = %key_string, bytes = size, "backup entry written");
        #[cfg(feature = "metrics")]
        if key.as_backup().is_some() {
            if let Some(metrics) = CapsuleMetrics::global() {
                metrics.record_backup_written(size);
            }
        }

        if let Err(e) = self.cleanup_if_full().await {
            warn!(error = %e, "failed to evict old backups");
        }
        Some(key_string)
    }

    /// Label and write a session under a new session key.
    ///
    /// Once the session is stored, data files no remaining session references
    /// are removed, including those of backups evicted by this write.
    pub async fn write_session(
        &self,
        kind: BackupKind,
        key: BackupKey,
        session: &BackupSession,
    ) -> Option<String> {
        let session_json = match session.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "failed to encode session");
                return None;
            }
        };
        let key = StoreKey::backup(kind, key.labelled(kind));
        let written = self.create_backup(&key, session_json.into()).await?;

        if let Err(e) = self.cleanup_unused_data_files().await {
            warn!(error = %e, "failed to remove unreferenced data files");
        }
        Some(written)
    }

    pub async fn retrieve_backup(&self, key: &StoreKey) -> Result<Option<StoredValue>> {
        self.store.get_item(&self.raw_key(key).await?).await
    }

    /// Load and parse the session stored under `entry`.
    pub async fn load_session(&self, entry: &BackupEntry) -> Result<BackupSession> {
        let value = self
            .retrieve_backup(&entry.store_key())
            .await?
            .ok_or_else(|| CapsuleError::not_found(entry.store_key().kind_name(), entry.label()))?;
        let text = value
            .as_text()
            .ok_or_else(|| CapsuleError::invalid_session("session entry is not text"))?;
        BackupSession::from_json(text)
    }

    /// Remove an entry; removing a session also drops orphaned data files.
    pub async fn remove_backup(&self, key: &StoreKey) -> Result<()> {
        self.store.remove_item(&self.raw_key(key).await?).await?;
        if key.as_backup().is_some() {
            self.cleanup_unused_data_files().await?;
        }
        Ok(())
    }

    /// The string `key` is stored under, falling back to its canonical form.
    async fn raw_key(&self, key: &StoreKey) -> Result<String> {
        let canonical = key.to_key_string()?;
        Ok(self
            .parsed_keys()
            .await?
            .into_iter()
            .find(|(_, stored)| stored == key)
            .map_or(canonical, |(raw, _)| raw))
    }

    /// Every parseable key in the store, next to the raw string it was read
    /// from. Removal goes through the raw string.
    pub async fn parsed_keys(&self) -> Result<Vec<(String, StoreKey)>> {
        let raw_keys = self.store.keys().await?;
        Ok(raw_keys
            .into_iter()
            .filter_map(|raw| match StoreKey::parse(&raw) {
                Ok(key) => Some((raw, key)),
                Err(e) => {
                    warn!(key = %raw, error = %e, "ignoring unrecognised store key");
                    None
                }
            })
            .collect())
    }

    /// Remove the oldest automatic backups beyond the retention limit.
    ///
    /// Manual backups are never evicted. Returns the number removed.
    pub async fn cleanup_if_full(&self) -> Result<usize> {
        let mut automatic: Vec<(String, StoreKey)> = self
            .parsed_keys()
            .await?
            .into_iter()
            .filter(|(_, key)| matches!(key, StoreKey::Automatic(_)))
            .collect();

        if automatic.len() <= self.max_backup_count {
            return Ok(0);
        }

        automatic.sort_by_key(|(_, key)| std::cmp::Reverse(session_time(key)));
        let excess = automatic.split_off(self.max_backup_count);
        for (raw, _) in &excess {
            self.store.remove_item(raw).await?;
        }

        info!(
            removed = excess.len(),
            kept = self.max_backup_count,
            "evicted old automatic backups"
        );
        #[cfg(feature = "metrics")]
        if let Some(metrics) = CapsuleMetrics::global() {
            metrics.record_evictions(excess.len());
        }
        Ok(excess.len())
    }

    /// Remove map and reflection payloads no session references.
    ///
    /// Returns the number of data files removed.
    pub async fn cleanup_unused_data_files(&self) -> Result<usize> {
        let keys = self.parsed_keys().await?;

        let mut used = DataFiles::default();
        for (_, backup) in keys.iter().filter_map(|(_, key)| key.as_backup()) {
            used.mtz.extend(backup.mtz_names.iter().cloned());
            used.maps.extend(backup.map_names.iter().cloned());
        }

        let mut removed = 0;
        for (raw, key) in &keys {
            let orphaned = match key {
                StoreKey::MtzData { name } => !used.mtz.contains(name),
                StoreKey::MapData { name } => !used.maps.contains(name),
                _ => false,
            };
            if orphaned {
                self.store.remove_item(raw).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "removed unreferenced data files");
            #[cfg(feature = "metrics")]
            if let Some(metrics) = CapsuleMetrics::global() {
                metrics.record_data_files_removed(removed);
            }
        }
        Ok(removed)
    }

    /// Session backups, newest first.
    pub async fn get_sorted_keys(&self) -> Result<Vec<BackupEntry>> {
        let mut entries: Vec<BackupEntry> = self
            .parsed_keys()
            .await?
            .into_iter()
            .filter_map(|(_, key)| match key {
                StoreKey::Automatic(key) => Some(BackupEntry {
                    kind: BackupKind::Automatic,
                    key,
                }),
                StoreKey::Manual(key) => Some(BackupEntry {
                    kind: BackupKind::Manual,
                    key,
                }),
                _ => None,
            })
            .collect();

        entries.sort_by(|a, b| b.key.date_time.cmp(&a.key.date_time));
        Ok(entries)
    }

    /// The newest session backup, if any.
    pub async fn retrieve_last_backup(&self) -> Result<Option<(BackupEntry, BackupSession)>> {
        let Some(newest) = self.get_sorted_keys().await?.into_iter().next() else {
            return Ok(None);
        };
        let session = self.load_session(&newest).await?;
        Ok(Some((newest, session)))
    }

    /// Clear the store and re-seed the version marker.
    pub async fn drop_all_backups(&self) -> Result<()> {
        self.store.clear().await?;
        self.store
            .set_item(&StoreKey::Version.to_key_string()?, SCHEMA_VERSION.into())
            .await?;
        info!("dropped all backups");
        Ok(())
    }

    pub async fn data_file_names(&self) -> Result<DataFiles> {
        let mut files = DataFiles::default();
        for (_, key) in self.parsed_keys().await? {
            match key {
                StoreKey::MtzData { name } => {
                    files.mtz.insert(name);
                }
                StoreKey::MapData { name } => {
                    files.maps.insert(name);
                }
                _ => {}
            }
        }
        Ok(files)
    }
}

fn session_time(key: &StoreKey) -> i64 {
    key.as_backup().map_or(i64::MIN, |(_, backup)| backup.date_time)
}

/// Automatic and manual backups of a live scene
///
/// # Example
/// ```rust,no_run
/// use capsule_core::{CapsuleConfig, EngineHandle, MemoryStore, Scene, TimeCapsule};
///
/// # async fn example(engine: EngineHandle) -> capsule_core::Result<()> {
/// let capsule = TimeCapsule::new(
///     MemoryStore::new(),
///     engine,
///     Scene::new().shared(),
///     CapsuleConfig::default(),
/// );
/// capsule.init().await;
/// capsule.add_modification().await;
/// let json = capsule.export_session().await?;
/// # Ok(())
/// # }
/// ```
pub struct TimeCapsule<S> {
    pub(crate) backups: BackupStore<S>,
    pub(crate) engine: EngineHandle,
    pub(crate) scene: SharedScene,
    pub(crate) events: Arc<SceneEvents>,
    pub(crate) config: CapsuleConfig,
    modification_count: AtomicU32,
    last_date_time: AtomicI64,
    pub(crate) lock: Mutex<()>,
}

impl<S: KeyValueStore> TimeCapsule<S> {
    /// Create a capsule over `store`.
    ///
    /// Out-of-range tunables are logged and clamped to 1.
    pub fn new(store: S, engine: EngineHandle, scene: SharedScene, mut config: CapsuleConfig) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "invalid capsule configuration, clamping tunables");
            config.modification_threshold = config.modification_threshold.max(1);
            config.max_backup_count = config.max_backup_count.max(1);
        }
        Self {
            backups: BackupStore::from_config(store, &config),
            engine,
            scene,
            events: Arc::new(SceneEvents::default()),
            config,
            modification_count: AtomicU32::new(0),
            last_date_time: AtomicI64::new(i64::MIN),
            lock: Mutex::new(()),
        }
    }

    /// Use an existing event hub instead of a private one.
    pub fn with_events(mut self, events: Arc<SceneEvents>) -> Self {
        self.events = events;
        self
    }

    pub async fn init(&self) {
        self.backups.init().await;
    }

    pub fn backups(&self) -> &BackupStore<S> {
        &self.backups
    }

    pub fn scene(&self) -> &SharedScene {
        &self.scene
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn events(&self) -> &Arc<SceneEvents> {
        &self.events
    }

    pub fn config(&self) -> &CapsuleConfig {
        &self.config
    }

    pub fn modification_count(&self) -> u32 {
        self.modification_count.load(Ordering::SeqCst)
    }

    /// True while a backup or restore holds the capsule.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Count one structural edit; every `modification_threshold` edits take
    /// an automatic backup.
    ///
    /// Returns the key of the backup written, if any. Failures are logged
    /// and never returned.
    pub async fn add_modification(&self) -> Option<String> {
        let count = self.modification_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count < self.config.modification_threshold || !self.backups.backups_enabled() {
            return None;
        }
        self.modification_count.store(0, Ordering::SeqCst);

        let _guard = self.lock.lock().await;
        match self.write_backup(BackupKind::Automatic).await {
            Ok(key) => key,
            Err(e) => {
                error!(error = %e, "automatic backup failed");
                None
            }
        }
    }

    /// Take a manual backup of the current scene.
    ///
    /// Engine failures are returned; store failures yield `Ok(None)`.
    pub async fn create_manual_backup(&self) -> Result<Option<String>> {
        if !self.backups.backups_enabled() {
            return Ok(None);
        }
        let _guard = self.lock.lock().await;
        self.write_backup(BackupKind::Manual).await
    }

    /// Write a single entry through the backup gate.
    pub async fn create_backup(&self, key: &StoreKey, value: StoredValue) -> Option<String> {
        self.backups.create_backup(key, value).await
    }

    async fn write_backup(&self, kind: BackupKind) -> Result<Option<String>> {
        let sync = self.update_data_files().await?;
        if !sync.complete {
            warn!(kind = ?kind, "data files missing from the store, backup skipped");
            #[cfg(feature = "metrics")]
            if let Some(metrics) = CapsuleMetrics::global() {
                metrics.record_backup_skipped();
            }
            return Ok(None);
        }

        let session = self.fetch_session(false).await?;
        let key = session.backup_key(self.next_date_time());
        let written = self.backups.write_session(kind, key, &session).await;
        if let Some(key) = &written {
            info!(kind = ?kind, key = %key, "session backup written");
        }
        Ok(written)
    }

    /// Millisecond timestamp, strictly greater than any handed out before.
    fn next_date_time(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let previous = self
            .last_date_time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or(now);
        now.max(previous.saturating_add(1))
    }

    /// Store every map grid and reflection file not already stored.
    ///
    /// Payloads are deduplicated by map `unique_id` and reflection file name.
    /// The result is incomplete when any payload the scene needs could not be
    /// written; a session stored after that could not be restored.
    pub async fn update_data_files(&self) -> Result<DataFileSync> {
        if !self.backups.backups_enabled() {
            return Ok(DataFileSync::default());
        }

        let existing = match self.backups.data_file_names().await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "cannot list data files, skipping sync");
                return Ok(DataFileSync::default());
            }
        };

        let scene = self.scene.read().await;
        let mut scheduled = DataFiles::default();
        let mut pending = Vec::new();

        for map in &scene.maps {
            if let Some(file) = map
                .associated_reflection_file_name
                .as_ref()
                .filter(|_| map.has_reflection_data)
            {
                if !existing.mtz.contains(file) && scheduled.mtz.insert(file.clone()) {
                    pending.push(fetch_data_file(map, StoreKey::mtz_data(file.clone())));
                }
            }
            if !existing.maps.contains(&map.unique_id) && scheduled.maps.insert(map.unique_id.clone()) {
                pending.push(fetch_data_file(map, StoreKey::map_data(map.unique_id.clone())));
            }
        }

        let fetched = try_join_all(pending).await?;
        drop(scene);

        let mut sync = DataFileSync {
            written: 0,
            complete: true,
        };
        for (key, data) in fetched {
            if self.backups.create_backup(&key, data.into()).await.is_some() {
                sync.written += 1;
            } else {
                sync.complete = false;
            }
        }

        if sync.written > 0 {
            debug!(written = sync.written, complete = sync.complete, "data files synchronised");
        }
        Ok(sync)
    }

    /// Snapshot the scene.
    ///
    /// Coordinates are always read fresh from the engine. With
    /// `include_additional_map_data` the map grids and reflection data are
    /// inlined, taken from the store when a copy exists there and from the
    /// engine otherwise; without it maps are referenced by `unique_id`. The
    /// scene is read-locked for the whole build so records line up with the
    /// entity lists.
    pub async fn fetch_session(&self, include_additional_map_data: bool) -> Result<BackupSession> {
        let stored = if include_additional_map_data {
            self.backups.data_file_names().await.unwrap_or_else(|e| {
                warn!(error = %e, "cannot list data files, reading payloads from the engine");
                DataFiles::default()
            })
        } else {
            DataFiles::default()
        };

        let scene = self.scene.read().await;

        let atoms = try_join_all(scene.molecules.iter().map(|molecule| molecule.fetch_atoms()));
        let payloads = try_join_all(
            scene
                .maps
                .iter()
                .map(|map| self.map_payloads(map, include_additional_map_data, &stored)),
        );
        let (atoms, payloads) = futures::try_join!(atoms, payloads)?;

        let molecule_data = scene
            .molecules
            .iter()
            .zip(atoms)
            .map(|(molecule, pdb_data)| MoleculeSessionData::capture(molecule, pdb_data))
            .collect();
        let map_data = scene
            .maps
            .iter()
            .zip(payloads)
            .map(|(map, (grid, reflections))| MapSessionData::capture(map, grid, reflections))
            .collect();

        let session = BackupSession {
            includes_additional_map_data: include_additional_map_data,
            molecule_data,
            map_data,
            active_map_index: scene.active_map_index(),
            view: scene.view.clone(),
        };

        debug!(
            molecules = session.molecule_data.len(),
            maps = session.map_data.len(),
            inlined = include_additional_map_data,
            "session fetched"
        );
        Ok(session)
    }

    async fn map_payloads(
        &self,
        map: &Map,
        include: bool,
        stored: &DataFiles,
    ) -> Result<(Option<Bytes>, Option<Bytes>)> {
        if !include {
            return Ok((None, None));
        }

        let grid = if stored.maps.contains(&map.unique_id) {
            self.stored_or(StoreKey::map_data(map.unique_id.clone()), map.get_map())
                .await?
        } else {
            map.get_map().await?
        };

        let reflections = match map
            .associated_reflection_file_name
            .as_ref()
            .filter(|_| map.has_reflection_data)
        {
            Some(file) if stored.mtz.contains(file) => Some(
                self.stored_or(StoreKey::mtz_data(file.clone()), map.fetch_reflection_data())
                    .await?,
            ),
            Some(_) => Some(map.fetch_reflection_data().await?),
            None => None,
        };

        Ok((Some(grid), reflections))
    }

    /// Read a data file from the store, falling back to `engine_fetch`.
    async fn stored_or<F>(&self, key: StoreKey, engine_fetch: F) -> Result<Bytes>
    where
        F: std::future::Future<Output = Result<Bytes>>,
    {
        match load_data_file(self.backups.store(), &key).await {
            Ok(data) => Ok(data),
            Err(e) => {
                debug!(error = %e, "stored payload unavailable, asking the engine");
                engine_fetch.await
            }
        }
    }

    /// Self-contained session document of the current scene.
    pub async fn export_session(&self) -> Result<String> {
        self.fetch_session(true).await?.to_json()
    }

    /// Write [`TimeCapsule::export_session`] to `path`.
    ///
    /// When `path` is a directory the file is named `session.json`.
    pub async fn export_session_to<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf> {
        let mut target = path.as_ref().to_path_buf();
        if tokio::fs::metadata(&target)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
        {
            target.push(SESSION_FILE_NAME);
        }

        let json = self.export_session().await?;
        tokio::fs::write(&target, json.as_bytes()).await?;
        info!(path = %target.display(), bytes = json.len(), "session exported");
        Ok(target)
    }
}

async fn fetch_data_file(map: &Map, key: StoreKey) -> Result<(StoreKey, Bytes)> {
    let data = match &key {
        StoreKey::MtzData { .. } => map.fetch_reflection_data().await?,
        _ => map.get_map().await?,
    };
    Ok((key, data))
}
