//! On-disk result cache
//!
//! Every executed unit (a scalar node instance, or one element of a map
//! node) owns a directory holding a `_result.json` record. A record whose
//! key matches and whose output files still exist short-circuits the run.
//! Input files enter the key by content, so rewriting a scan in place
//! invalidates everything downstream of it.

use chrono::{DateTime, Utc};
use segcore::{NodeError, OperationOutput, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const RECORD_FILE: &str = "_result.json";

/// Hex SHA-256 over the canonical JSON of everything that identifies a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    operation: &'a str,
    fingerprint: &'a Value,
    node: &'a str,
    index: Option<usize>,
    iteration: &'a [(String, Value)],
    inputs: &'a BTreeMap<String, Value>,
    contents: &'a BTreeMap<PathBuf, String>,
}

impl CacheKey {
    pub fn compute(
        operation: &str,
        fingerprint: &Value,
        node: &str,
        index: Option<usize>,
        iteration: &[(String, Value)],
        inputs: &BTreeMap<String, Value>,
        contents: &BTreeMap<PathBuf, String>,
    ) -> Result<Self, NodeError> {
        let material = serde_json::to_vec(&KeyMaterial {
            operation,
            fingerprint,
            node,
            index,
            iteration,
            inputs,
            contents,
        })
        .map_err(|e| NodeError::Configuration(format!("unhashable inputs: {}", e)))?;

        let mut hasher = Sha256::new();
        hasher.update(&material);
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 of every regular file referenced by `inputs`
///
/// Paths that do not exist, or are directories, are left out and hash by
/// name only.
pub async fn file_digests(
    inputs: &BTreeMap<String, Value>,
) -> Result<BTreeMap<PathBuf, String>, NodeError> {
    let mut digests = BTreeMap::new();
    for path in inputs.values().flat_map(Value::paths) {
        if digests.contains_key(path) {
            continue;
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => continue,
        }
        let owned = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut file = std::fs::File::open(&owned)?;
            let mut hasher = Sha256::new();
            std::io::copy(&mut file, &mut hasher)?;
            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .map_err(|e| NodeError::Io(format!("hashing {}: {}", path.display(), e)))??;
        digests.insert(path.to_path_buf(), digest);
    }
    Ok(digests)
}

/// Persisted execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub key: CacheKey,
    pub operation: String,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum Lookup {
    Hit(BTreeMap<String, Value>),
    Miss,
    /// A record exists for different inputs
    Stale,
    /// Unreadable record or missing output files
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub outputs: BTreeMap<String, Value>,
    pub cached: bool,
}

/// Serializes work per cache key and persists records
///
/// At most one run per key is in flight; concurrent requests for the same
/// key wait on the key's slot and then find the finished record.
#[derive(Default)]
pub struct ResultCache {
    slots: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_path(dir: &Path) -> PathBuf {
        dir.join(RECORD_FILE)
    }

    pub async fn lookup(key: &CacheKey, dir: &Path) -> Lookup {
        let bytes = match tokio::fs::read(Self::record_path(dir)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Lookup::Miss,
            Err(e) => return Lookup::Corrupt(e.to_string()),
        };
        let record: CacheRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => return Lookup::Corrupt(format!("unreadable record: {}", e)),
        };
        if record.key != *key {
            return Lookup::Stale;
        }
        for value in record.outputs.values() {
            for path in value.paths() {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Lookup::Corrupt(format!("missing output {}", path.display()));
                }
            }
        }
        Lookup::Hit(record.outputs)
    }

    /// Return the recorded outputs for `key`, or run `run` in `dir` and
    /// record its outputs.
    pub async fn get_or_run<F, Fut>(
        &self,
        key: &CacheKey,
        dir: &Path,
        operation: &str,
        inputs: &BTreeMap<String, Value>,
        run: F,
    ) -> Result<CacheOutcome, NodeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OperationOutput, NodeError>>,
    {
        let slot = self.slot(key);
        let outcome = {
            let _guard = slot.lock().await;
            Self::run_locked(key, dir, operation, inputs, run).await
        };
        self.release(key, &slot);
        outcome
    }

    async fn run_locked<F, Fut>(
        key: &CacheKey,
        dir: &Path,
        operation: &str,
        inputs: &BTreeMap<String, Value>,
        run: F,
    ) -> Result<CacheOutcome, NodeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<OperationOutput, NodeError>>,
    {
        let discard = match Self::lookup(key, dir).await {
            Lookup::Hit(outputs) => {
                tracing::debug!("Cache hit for {} in {}", operation, dir.display());
                return Ok(CacheOutcome {
                    outputs,
                    cached: true,
                });
            }
            Lookup::Miss => false,
            Lookup::Stale => {
                tracing::debug!("Inputs changed for {}, rerunning", dir.display());
                true
            }
            Lookup::Corrupt(reason) => {
                tracing::warn!("Discarding cache entry in {}: {}", dir.display(), reason);
                true
            }
        };
        if discard {
            match tokio::fs::remove_dir_all(dir).await {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        tokio::fs::create_dir_all(dir).await?;

        let output = run().await?;

        let record = CacheRecord {
            key: key.clone(),
            operation: operation.to_string(),
            inputs: inputs.clone(),
            outputs: output.outputs,
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| NodeError::Io(format!("cannot encode record: {}", e)))?;
        tokio::fs::write(Self::record_path(dir), bytes).await?;

        Ok(CacheOutcome {
            outputs: record.outputs,
            cached: false,
        })
    }

    fn slot(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    /// Drop the slot once no other task holds or waits on it.
    fn release(&self, key: &CacheKey, slot: &Arc<tokio::sync::Mutex<()>>) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(slot) <= 2 {
            slots.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inputs(value: &str) -> BTreeMap<String, Value> {
        BTreeMap::from([("in_file".to_string(), Value::from(value))])
    }

    fn key_for(value: &str) -> CacheKey {
        CacheKey::compute(
            "fsl.bet",
            &Value::Null,
            "betT1",
            None,
            &[],
            &inputs(value),
            &BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn key_depends_on_inputs_and_iteration() {
        let a = key_for("/a.nii.gz");
        assert_eq!(a, key_for("/a.nii.gz"));
        assert_ne!(a, key_for("/b.nii.gz"));

        let iterated = CacheKey::compute(
            "fsl.bet",
            &Value::Null,
            "betT1",
            None,
            &[("pid".to_string(), Value::from("P001"))],
            &inputs("/a.nii.gz"),
            &BTreeMap::new(),
        )
        .unwrap();
        assert_ne!(a, iterated);
        assert_eq!(a.as_str().len(), 64);
    }

    #[tokio::test]
    async fn file_contents_enter_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let scan = dir.path().join("P001_T13D.nii.gz");
        let missing = dir.path().join("absent.nii.gz");
        let inputs = BTreeMap::from([
            ("in_file".to_string(), Value::Path(scan.clone())),
            ("ref_file".to_string(), Value::Path(missing.clone())),
            ("base_directory".to_string(), Value::Path(dir.path().to_path_buf())),
        ]);
        let key = |contents: &BTreeMap<PathBuf, String>| {
            CacheKey::compute("fsl.bet", &Value::Null, "betT1", None, &[], &inputs, contents)
                .unwrap()
        };

        std::fs::write(&scan, b"first acquisition").unwrap();
        let first = file_digests(&inputs).await.unwrap();
        assert_eq!(first.keys().collect::<Vec<_>>(), vec![&scan]);

        std::fs::write(&scan, b"second acquisition").unwrap();
        let second = file_digests(&inputs).await.unwrap();
        assert_ne!(key(&first), key(&second));

        std::fs::write(&scan, b"first acquisition").unwrap();
        assert_eq!(key(&first), key(&file_digests(&inputs).await.unwrap()));
    }

    #[tokio::test]
    async fn second_run_is_served_from_record() {
        let dir = tempfile::tempdir().unwrap();
        let unit = dir.path().join("betT1");
        let cache = ResultCache::new();
        let calls = AtomicUsize::new(0);
        let key = key_for("/a.nii.gz");

        for expect_cached in [false, true] {
            let outcome = cache
                .get_or_run(&key, &unit, "fsl.bet", &inputs("/a.nii.gz"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let out = unit.join("a_brain.nii.gz");
                    tokio::fs::write(&out, b"x").await?;
                    Ok::<_, NodeError>(OperationOutput::new().with_output("out_file", out))
                })
                .await
                .unwrap();
            assert_eq!(outcome.cached, expect_cached);
            assert_eq!(
                outcome.outputs.get("out_file"),
                Some(&Value::Path(unit.join("a_brain.nii.gz")))
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_output_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let unit = dir.path().join("betT1");
        let cache = ResultCache::new();
        let key = key_for("/a.nii.gz");
        let out = unit.join("a_brain.nii.gz");

        let run = || async {
            tokio::fs::write(&out, b"x").await?;
            Ok::<_, NodeError>(OperationOutput::new().with_output("out_file", out.clone()))
        };
        cache.get_or_run(&key, &unit, "fsl.bet", &inputs("/a.nii.gz"), run).await.unwrap();
        tokio::fs::remove_file(&out).await.unwrap();

        assert!(matches!(ResultCache::lookup(&key, &unit).await, Lookup::Corrupt(_)));
        let outcome = cache
            .get_or_run(&key, &unit, "fsl.bet", &inputs("/a.nii.gz"), run)
            .await
            .unwrap();
        assert!(!outcome.cached);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn garbage_record_is_treated_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(RECORD_FILE), b"{not json").await.unwrap();

        let lookup = ResultCache::lookup(&key_for("/a.nii.gz"), dir.path()).await;
        assert!(matches!(lookup, Lookup::Corrupt(_)));
    }

    #[tokio::test]
    async fn changed_inputs_make_record_stale() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new();
        cache
            .get_or_run(&key_for("/a.nii.gz"), dir.path(), "fsl.bet", &inputs("/a.nii.gz"), || async {
                Ok::<_, NodeError>(OperationOutput::new())
            })
            .await
            .unwrap();

        let lookup = ResultCache::lookup(&key_for("/b.nii.gz"), dir.path()).await;
        assert!(matches!(lookup, Lookup::Stale));
    }

    #[tokio::test]
    async fn failed_run_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new();
        let key = key_for("/a.nii.gz");

        let err = cache
            .get_or_run(&key, dir.path(), "fsl.bet", &inputs("/a.nii.gz"), || async {
                Err(NodeError::operation_failed("fsl.bet", Some(1), "boom"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::OperationFailed { .. }));
        assert!(matches!(ResultCache::lookup(&key, dir.path()).await, Lookup::Miss));
        assert!(cache.slots.lock().unwrap().is_empty());
    }
}
