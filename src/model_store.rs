//! Model Artifact Storage
//!
//! SQLite-backed, append-only storage for trained model blobs and their
//! metadata. A version, once saved, is never overwritten.
//!
//! # Schema Design
//!
//! ```sql
//! CREATE TABLE model_artifacts (
//!     version TEXT PRIMARY KEY,          -- "<model_name>_<YYYYmmdd_HHMMSS>"
//!     model_name TEXT NOT NULL,
//!     kind TEXT NOT NULL,                -- xgboost | neural | ensemble
//!     saved_at INTEGER NOT NULL,         -- unix seconds
//!     network TEXT NOT NULL,
//!     training_samples INTEGER NOT NULL,
//!     blob_sha256 TEXT NOT NULL,
//!     metadata_json TEXT NOT NULL,
//!     model_blob BLOB NOT NULL
//! ) WITHOUT ROWID;
//! ```

use crate::calibration::CalibrationModel;
use crate::error::EngineResult;
use crate::predictor::{self, Predictor, PredictorKind};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema version for migrations.
/// - v1: Initial schema
const SCHEMA_VERSION: u32 = 1;

const VERSION_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Metadata stored alongside a model blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub calibration: Option<CalibrationModel>,
    /// Feature names, in training order.
    #[serde(default)]
    pub features: Vec<String>,
    pub network: String,
    pub training_samples: usize,
    /// Assigned by the store on save.
    #[serde(default)]
    pub version: String,
    /// `YYYYmmdd_HHMMSS` (UTC), assigned by the store on save.
    #[serde(default)]
    pub saved_at: String,
}

impl ModelMetadata {
    pub fn new(network: impl Into<String>, training_samples: usize) -> Self {
        Self {
            metrics: BTreeMap::new(),
            calibration: None,
            features: Vec::new(),
            network: network.into(),
            training_samples,
            version: String::new(),
            saved_at: String::new(),
        }
    }
}

/// A loaded model.
#[derive(Debug, Clone)]
pub struct StoredModel {
    pub kind: PredictorKind,
    pub blob: Vec<u8>,
    pub metadata: ModelMetadata,
}

/// Index row for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub version: String,
    pub model_name: String,
    pub kind: PredictorKind,
    pub saved_at: DateTime<Utc>,
    pub network: String,
    pub training_samples: usize,
    pub blob_sha256: String,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn parse_kind(raw: &str) -> Result<PredictorKind, ModelStoreError> {
    raw.parse()
        .map_err(|_| ModelStoreError::Serialization(format!("unknown model kind {:?}", raw)))
}

fn version_exists(conn: &Connection, version: &str) -> Result<bool, ModelStoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM model_artifacts WHERE version = ?",
            [version],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Storage for model artifacts.
pub struct ModelStore {
    conn: Arc<Mutex<Connection>>,
}

impl ModelStore {
    /// Open (or create) a store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, ModelStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self, ModelStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), ModelStoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS model_artifacts (
                        version TEXT PRIMARY KEY,
                        model_name TEXT NOT NULL,
                        kind TEXT NOT NULL,
                        saved_at INTEGER NOT NULL,
                        network TEXT NOT NULL,
                        training_samples INTEGER NOT NULL,
                        blob_sha256 TEXT NOT NULL,
                        metadata_json TEXT NOT NULL,
                        model_blob BLOB NOT NULL
                    ) WITHOUT ROWID;

                    CREATE INDEX IF NOT EXISTS idx_models_name_saved
                        ON model_artifacts(model_name, saved_at DESC);
                "#,
                )?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("Created model store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Model store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Model store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }
        Ok(())
    }

    /// Save a model under a fresh version stamped with the current time.
    pub fn save(
        &self,
        model_name: &str,
        kind: PredictorKind,
        blob: &[u8],
        metadata: ModelMetadata,
    ) -> Result<String, ModelStoreError> {
        self.save_at(model_name, kind, blob, metadata, Utc::now())
    }

    /// Save with an explicit timestamp.
    pub fn save_at(
        &self,
        model_name: &str,
        kind: PredictorKind,
        blob: &[u8],
        mut metadata: ModelMetadata,
        now: DateTime<Utc>,
    ) -> Result<String, ModelStoreError> {
        let stamp = now.format(VERSION_TIME_FORMAT).to_string();
        let version = format!("{}_{}", model_name, stamp);

        metadata.version = version.clone();
        metadata.saved_at = stamp;
        let metadata_json = serde_json::to_string(&metadata)?;
        let digest = sha256_hex(blob);

        // Check and insert under one lock so concurrent saves of the same
        // version see AlreadyExists rather than a constraint error.
        let conn = self.conn.lock();
        if version_exists(&conn, &version)? {
            return Err(ModelStoreError::AlreadyExists(version));
        }
        conn.execute(
            r#"INSERT INTO model_artifacts (
                version, model_name, kind, saved_at, network, training_samples,
                blob_sha256, metadata_json, model_blob
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            params![
                version,
                model_name,
                kind.as_str(),
                now.timestamp(),
                metadata.network,
                metadata.training_samples as i64,
                digest,
                metadata_json,
                blob,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ModelStoreError::AlreadyExists(version.clone())
            }
            other => ModelStoreError::Sqlite(other),
        })?;
        drop(conn);

        info!(
            version = %version,
            kind = %kind,
            bytes = blob.len(),
            "Saved model artifact"
        );
        Ok(version)
    }

    pub fn exists(&self, version: &str) -> Result<bool, ModelStoreError> {
        let conn = self.conn.lock();
        version_exists(&conn, version)
    }

    /// Load a model by version, verifying the blob digest.
    pub fn load(&self, version: &str) -> Result<StoredModel, ModelStoreError> {
        let conn = self.conn.lock();
        let row: Option<(String, String, String, Vec<u8>)> = conn
            .query_row(
                "SELECT kind, blob_sha256, metadata_json, model_blob FROM model_artifacts WHERE version = ?",
                [version],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        drop(conn);

        let (kind, digest, metadata_json, blob) =
            row.ok_or_else(|| ModelStoreError::NotFound(version.to_string()))?;

        let actual = sha256_hex(&blob);
        if actual != digest {
            return Err(ModelStoreError::Serialization(format!(
                "blob digest mismatch for {}: stored {}, computed {}",
                version, digest, actual
            )));
        }

        Ok(StoredModel {
            kind: parse_kind(&kind)?,
            blob,
            metadata: serde_json::from_str(&metadata_json)?,
        })
    }

    /// Load and decode a model into a predictor.
    pub fn load_predictor(&self, version: &str) -> EngineResult<Arc<dyn Predictor>> {
        let stored = self.load(version)?;
        predictor::decode(stored.kind, &stored.blob)
    }

    /// List models, newest first, optionally filtered by name.
    pub fn list(&self, model_name: Option<&str>) -> Result<Vec<ModelSummary>, ModelStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT version, model_name, kind, saved_at, network, training_samples, blob_sha256
               FROM model_artifacts
               WHERE (?1 IS NULL OR model_name = ?1)
               ORDER BY saved_at DESC, version DESC"#,
        )?;

        let rows = stmt
            .query_map(params![model_name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(version, model_name, kind, saved_at, network, training_samples, blob_sha256)| {
                    let saved_at = Utc.timestamp_opt(saved_at, 0).single().ok_or_else(|| {
                        ModelStoreError::Serialization(format!(
                            "invalid saved_at {} for {}",
                            saved_at, version
                        ))
                    })?;
                    Ok(ModelSummary {
                        kind: parse_kind(&kind)?,
                        version,
                        model_name,
                        saved_at,
                        network,
                        training_samples: training_samples.max(0) as usize,
                        blob_sha256,
                    })
                },
            )
            .collect()
    }

    /// Newest version of `model_name`.
    pub fn latest(&self, model_name: &str) -> Result<Option<ModelSummary>, ModelStoreError> {
        Ok(self.list(Some(model_name))?.into_iter().next())
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum ModelStoreError {
    Sqlite(rusqlite::Error),
    Serialization(String),
    AlreadyExists(String),
    NotFound(String),
}

impl std::fmt::Display for ModelStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::AlreadyExists(v) => write!(f, "Model version already exists: {}", v),
            Self::NotFound(v) => write!(f, "Model version not found: {}", v),
        }
    }
}

impl std::error::Error for ModelStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ModelStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for ModelStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::QuantileMethod;
    use crate::error::EngineError;

    const TREE_BLOB: &[u8] = br#"{"feature_names": ["price_volatility"], "base_score": 2.0, "trees": []}"#;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()
    }

    fn metadata() -> ModelMetadata {
        let mut m = ModelMetadata::new("coston2", 1200);
        m.features = vec!["price_volatility".into()];
        m.metrics.insert("accuracy".into(), 0.998);
        m.calibration = Some(CalibrationModel {
            quantile_threshold: 0.04,
            alpha: 0.003,
            n_calibration: 300,
            method: QuantileMethod::Linear,
        });
        m
    }

    #[test]
    fn test_save_and_load() {
        let store = ModelStore::in_memory().unwrap();
        let version = store
            .save_at("flip_xgboost", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata(), ts(9))
            .unwrap();
        assert_eq!(version, "flip_xgboost_20250301_090000");
        assert!(store.exists(&version).unwrap());

        let loaded = store.load(&version).unwrap();
        assert_eq!(loaded.kind, PredictorKind::GradientBoostedTree);
        assert_eq!(loaded.blob, TREE_BLOB);
        assert_eq!(loaded.metadata.version, version);
        assert_eq!(loaded.metadata.saved_at, "20250301_090000");
        assert_eq!(loaded.metadata.training_samples, 1200);
        assert_eq!(loaded.metadata.calibration.unwrap().quantile_threshold, 0.04);
    }

    #[test]
    fn test_not_found() {
        let store = ModelStore::in_memory().unwrap();
        assert!(matches!(
            store.load("missing_20250101_000000"),
            Err(ModelStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.load_predictor("missing_20250101_000000"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_already_exists() {
        let store = ModelStore::in_memory().unwrap();
        store
            .save_at("m", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata(), ts(1))
            .unwrap();
        let dup = store.save_at("m", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata(), ts(1));
        assert!(matches!(dup, Err(ModelStoreError::AlreadyExists(_))));
    }

    #[test]
    fn test_concurrent_duplicate_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("models.db")).unwrap();

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        store.save_at(
                            "race",
                            PredictorKind::GradientBoostedTree,
                            TREE_BLOB,
                            metadata(),
                            ts(4),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ModelStoreError::AlreadyExists(v) if v == "race_20250301_040000")));
    }

    #[test]
    fn test_latest_and_list() {
        let store = ModelStore::in_memory().unwrap();
        for h in [3, 7, 5] {
            store
                .save_at("flip", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata(), ts(h))
                .unwrap();
        }
        store
            .save_at("other", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata(), ts(12))
            .unwrap();

        let latest = store.latest("flip").unwrap().unwrap();
        assert_eq!(latest.version, "flip_20250301_070000");
        assert_eq!(store.list(Some("flip")).unwrap().len(), 3);
        assert_eq!(store.list(None).unwrap().len(), 4);
        assert!(store.latest("nope").unwrap().is_none());
    }

    #[test]
    fn test_load_predictor_decodes_blob() {
        let store = ModelStore::in_memory().unwrap();
        let version = store
            .save_at("flip", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata(), ts(2))
            .unwrap();
        let predictor = store.load_predictor(&version).unwrap();
        assert_eq!(predictor.kind(), PredictorKind::GradientBoostedTree);
        let p = predictor.predict(&crate::features::FeatureVector::new()).unwrap();
        assert!((p - 1.0 / (1.0 + (-2.0f64).exp())).abs() < 1e-12);
    }

    #[test]
    fn test_digest_mismatch_detected() {
        let store = ModelStore::in_memory().unwrap();
        let version = store
            .save_at("flip", PredictorKind::GradientBoostedTree, TREE_BLOB, metadata(), ts(4))
            .unwrap();
        store
            .conn
            .lock()
            .execute(
                "UPDATE model_artifacts SET model_blob = ? WHERE version = ?",
                params![b"tampered".to_vec(), version],
            )
            .unwrap();
        assert!(matches!(
            store.load(&version),
            Err(ModelStoreError::Serialization(ref msg)) if msg.contains("digest mismatch")
        ));
    }
}
