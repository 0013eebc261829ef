// Persisted subscription snapshots: an append-only file with one JSON record
// per line, committed atomically by renaming a finished temporary file over
// the previous snapshot. There is no index; restore reads the whole file.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use petrel_common::SubscriptionParameters;

use crate::{Error, Result};

/// A snapshot under construction. One part per client worker so workers can
/// append concurrently without coordination; `commit` merges and publishes.
pub struct SubscriptionSnapshot {
    path: PathBuf,
    parts: Vec<Mutex<Vec<SubscriptionParameters>>>,
}

impl SubscriptionSnapshot {
    pub fn append(&self, worker: usize, params: SubscriptionParameters) -> Result<()> {
        let part = self.parts.get(worker).ok_or(Error::BadWorkerIndex {
            index: worker,
            parts: self.parts.len(),
        })?;
        part.lock().expect("snapshot part lock").push(params);
        Ok(())
    }

    /// Write every part to a temporary file and atomically swap it in.
    pub fn commit(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            for part in &self.parts {
                let records = part.lock().expect("snapshot part lock");
                for params in records.iter() {
                    serde_json::to_writer(&mut tmp, params)?;
                    tmp.write_all(b"\n")?;
                }
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// File-backed subscription storage.
///
/// ```no_run
/// use petrel_storage::FileSubscriptionStorage;
///
/// let storage = FileSubscriptionStorage::new("/var/lib/petrel/subscriptions");
/// let snapshot = storage.create_snapshot(4);
/// // workers append their live subscriptions ...
/// snapshot.commit().expect("commit");
/// let restored = storage.restore_subscriptions().expect("restore");
/// println!("restored {} subscriptions", restored.len());
/// ```
pub struct FileSubscriptionStorage {
    path: PathBuf,
}

impl FileSubscriptionStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileSubscriptionStorage {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn create_snapshot(&self, num_workers: usize) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            path: self.path.clone(),
            parts: (0..num_workers.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Read back the last committed snapshot. A missing file is an empty
    /// snapshot, not an error.
    pub fn restore_subscriptions(&self) -> Result<Vec<SubscriptionParameters>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut subscriptions = Vec::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            subscriptions.push(serde_json::from_str(line)?);
        }
        Ok(subscriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use petrel_common::TenantId;

    fn params(topic: &str, seqno: u64) -> SubscriptionParameters {
        SubscriptionParameters {
            tenant_id: TenantId(200),
            namespace_id: "guest".into(),
            topic_name: topic.into(),
            start_seqno: seqno,
        }
    }

    #[test]
    fn save_then_restore_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSubscriptionStorage::new(dir.path().join("subs"));

        let snapshot = storage.create_snapshot(2);
        snapshot.append(0, params("t1", 5)).expect("append");
        snapshot.append(1, params("t2", 9)).expect("append");
        snapshot.commit().expect("commit");

        let restored = storage.restore_subscriptions().expect("restore");
        assert_eq!(restored.len(), 2);
        assert!(restored.contains(&params("t1", 5)));
        assert!(restored.contains(&params("t2", 9)));
    }

    #[test]
    fn commit_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSubscriptionStorage::new(dir.path().join("subs"));

        let first = storage.create_snapshot(1);
        first.append(0, params("old", 1)).expect("append");
        first.commit().expect("commit");

        let second = storage.create_snapshot(1);
        second.append(0, params("new", 2)).expect("append");
        second.commit().expect("commit");

        let restored = storage.restore_subscriptions().expect("restore");
        assert_eq!(restored, vec![params("new", 2)]);
    }

    #[test]
    fn restore_from_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSubscriptionStorage::new(dir.path().join("never-written"));
        assert!(storage.restore_subscriptions().expect("restore").is_empty());
    }

    #[test]
    fn append_rejects_bad_worker_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = FileSubscriptionStorage::new(dir.path().join("subs"));
        let snapshot = storage.create_snapshot(2);
        assert!(snapshot.append(2, params("t", 0)).is_err());
    }
}
