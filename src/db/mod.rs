use anyhow::Result;
use rocksdb::{Direction, IteratorMode, Options, DB};
use serde_json::{Map, Value};
use std::cmp::Reverse;
use std::str;
use tokio::sync::Mutex;

use crate::model::device::DeviceRecord;

/// Authoritative device registry on top of rocksdb.
///
/// Writes are read-modify-write: the write lock serializes concurrent
/// check-ins for the same record so the "overwrite only if supplied" merge
/// rule always sees a consistent prior state, and the merged record lands in
/// a single `put`. Reads take no lock.
pub struct DBLayer {
    db: DB,
    write_lock: Mutex<()>,
}

impl DBLayer {
    pub fn new(path: &str) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn device_key(sn: &str) -> String {
        format!("device:{sn}")
    }

    pub async fn load_device(&self, sn: &str) -> Result<Option<DeviceRecord>> {
        self.db
            .get(Self::device_key(sn))?
            .map(|val| serde_json::from_slice(&val).map_err(Into::into))
            .transpose()
    }

    /// Creates or merges the record for `sn`.
    ///
    /// An absent `imei` leaves the stored value untouched; an empty `aux`
    /// set leaves the stored auxiliary data untouched; a non-empty one
    /// replaces it wholesale. `updated_at` is refreshed on every call.
    /// `status` is never written here.
    pub async fn upsert_device(
        &self,
        sn: &str,
        imei: Option<&str>,
        aux: &Map<String, Value>,
    ) -> Result<DeviceRecord> {
        let _guard = self.write_lock.lock().await;

        let key = Self::device_key(sn);
        let mut device = match self.db.get(&key)? {
            Some(val) => serde_json::from_slice(&val)?,
            None => DeviceRecord::new(sn),
        };

        if let Some(imei) = imei {
            device.imei = Some(imei.to_string());
        }
        if !aux.is_empty() {
            device.st_data = aux.clone();
        }
        device.updated_at = chrono::Utc::now().timestamp();

        self.db.put(key, serde_json::to_vec(&device)?)?;
        Ok(device)
    }

    /// Operator-only status override. Returns false when the record is missing.
    pub async fn set_status(&self, sn: &str, status: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let key = Self::device_key(sn);
        let Some(val) = self.db.get(&key)? else {
            return Ok(false);
        };
        let mut device: DeviceRecord = serde_json::from_slice(&val)?;
        device.status = status.to_string();
        device.updated_at = chrono::Utc::now().timestamp();
        self.db.put(key, serde_json::to_vec(&device)?)?;
        Ok(true)
    }

    /// Operator-only removal. Returns false when the record is missing.
    pub async fn delete_device(&self, sn: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let key = Self::device_key(sn);
        if self.db.get(&key)?.is_none() {
            return Ok(false);
        }
        self.db.delete(key)?;
        Ok(true)
    }

    /// All records, most recently updated first.
    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let prefix = "device:";
        let mut results = Vec::new();

        for item in self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, val) = item?;
            let k = str::from_utf8(&key)?;
            if !k.starts_with(prefix) {
                break;
            }
            let device: DeviceRecord = serde_json::from_slice(&val)?;
            results.push(device);
        }

        results.sort_by_key(|d| Reverse(d.updated_at));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::device::DEFAULT_STATUS;
    use serde_json::json;

    fn temp_db() -> (DBLayer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = DBLayer::new(dir.path().to_str().unwrap()).unwrap();
        (db, dir)
    }

    fn aux(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn upsert_creates_then_mutates() {
        let (db, _dir) = temp_db();

        let created = db
            .upsert_device("A1", Some("123"), &aux(&[("ST_X", json!("v"))]))
            .await
            .unwrap();
        assert_eq!(created.sn, "A1");
        assert_eq!(created.imei.as_deref(), Some("123"));
        assert_eq!(created.status, DEFAULT_STATUS);

        let updated = db
            .upsert_device("A1", Some("456"), &Map::new())
            .await
            .unwrap();
        assert_eq!(updated.imei.as_deref(), Some("456"));

        // still exactly one record
        assert_eq!(db.list_devices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idempotent_upsert_preserves_fields() {
        let (db, _dir) = temp_db();
        let first = db
            .upsert_device("A1", Some("123"), &aux(&[("ST_X", json!("v"))]))
            .await
            .unwrap();

        let second = db.upsert_device("A1", None, &Map::new()).await.unwrap();
        assert_eq!(second.imei, first.imei);
        assert_eq!(second.st_data, first.st_data);
        assert!(second.updated_at >= first.updated_at);
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let (db, _dir) = temp_db();
        db.upsert_device("A1", Some("123"), &aux(&[("ST_X", json!("v"))]))
            .await
            .unwrap();

        // imei only: auxiliary data survives
        let after_imei = db
            .upsert_device("A1", Some("999"), &Map::new())
            .await
            .unwrap();
        assert_eq!(after_imei.st_data.get("ST_X"), Some(&json!("v")));

        // aux only: imei survives, aux replaced wholesale
        let after_aux = db
            .upsert_device("A1", None, &aux(&[("ST_Y", json!(2))]))
            .await
            .unwrap();
        assert_eq!(after_aux.imei.as_deref(), Some("999"));
        assert_eq!(after_aux.st_data.get("ST_Y"), Some(&json!(2)));
        assert!(after_aux.st_data.get("ST_X").is_none());
    }

    #[tokio::test]
    async fn checkins_never_touch_status() {
        let (db, _dir) = temp_db();
        db.upsert_device("A1", None, &Map::new()).await.unwrap();
        assert!(db.set_status("A1", "ACTIVE").await.unwrap());

        for _ in 0..3 {
            db.upsert_device("A1", Some("123"), &aux(&[("ST_X", json!("v"))]))
                .await
                .unwrap();
        }
        let device = db.load_device("A1").await.unwrap().unwrap();
        assert_eq!(device.status, "ACTIVE");
    }

    #[tokio::test]
    async fn set_status_and_delete_report_missing_records() {
        let (db, _dir) = temp_db();
        assert!(!db.set_status("ghost", "X").await.unwrap());
        assert!(!db.delete_device("ghost").await.unwrap());

        db.upsert_device("A1", None, &Map::new()).await.unwrap();
        assert!(db.delete_device("A1").await.unwrap());
        assert!(db.load_device("A1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_devices_newest_first() {
        let (db, _dir) = temp_db();
        db.upsert_device("A1", None, &Map::new()).await.unwrap();
        db.upsert_device("B2", None, &Map::new()).await.unwrap();

        let devices = db.list_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices[0].updated_at >= devices[1].updated_at);
    }

    #[tokio::test]
    async fn concurrent_same_sn_upserts_do_not_lose_fields() {
        let (db, _dir) = temp_db();
        let db = std::sync::Arc::new(db);

        let imei_writer = {
            let db = db.clone();
            tokio::spawn(async move { db.upsert_device("A1", Some("123"), &Map::new()).await })
        };
        let aux_writer = {
            let db = db.clone();
            tokio::spawn(async move {
                db.upsert_device("A1", None, &aux(&[("ST_X", json!("v"))]))
                    .await
            })
        };
        imei_writer.await.unwrap().unwrap();
        aux_writer.await.unwrap().unwrap();

        let device = db.load_device("A1").await.unwrap().unwrap();
        assert_eq!(device.imei.as_deref(), Some("123"));
        assert_eq!(device.st_data.get("ST_X"), Some(&json!("v")));
    }
}
