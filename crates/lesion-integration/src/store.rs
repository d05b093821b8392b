//! 持久化实现
//!
//! - `InMemoryStore`：进程内存储，适合测试与演示
//! - `JsonFileStore`：以单个JSON文档保存时间点与测量，每次变更后先写临时文件再替换原文件

use async_trait::async_trait;
use lesion_core::{
    MeasurementData, MeasurementStore, Result, StorageFilter, Timepoint, TimepointFilter, TimepointPatch,
    TimepointStore, TrackerError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// 持久化文档：全部时间点与按分类分组的测量
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerDocument {
    #[serde(default)]
    pub timepoints: Vec<Timepoint>,
    #[serde(default)]
    pub measurements: MeasurementData,
}

impl TrackerDocument {
    fn patient_timepoint_ids(&self, patient_id: &str) -> BTreeSet<&str> {
        self.timepoints
            .iter()
            .filter(|tp| tp.patient_id == patient_id)
            .map(|tp| tp.timepoint_id.as_str())
            .collect()
    }

    fn retrieve_measurements(&self, patient_id: &str, timepoint_ids: &[String]) -> MeasurementData {
        let known = self.patient_timepoint_ids(patient_id);
        let wanted: BTreeSet<&str> = timepoint_ids
            .iter()
            .map(String::as_str)
            .filter(|id| known.contains(id))
            .collect();

        self.measurements
            .iter()
            .map(|(category_id, findings)| {
                let selected = findings
                    .iter()
                    .filter(|f| f.timepoint_id.as_deref().is_some_and(|id| wanted.contains(id)))
                    .cloned()
                    .collect();
                (category_id.clone(), selected)
            })
            .collect()
    }

    /// 用新数据替换筛选范围内时间点上的测量
    fn store_measurements(&mut self, data: &MeasurementData, filter: &StorageFilter) -> usize {
        let scope: BTreeSet<&str> = filter.timepoint_ids.iter().map(String::as_str).collect();
        let in_scope = |timepoint_id: Option<&str>| timepoint_id.is_some_and(|id| scope.contains(id));

        for findings in self.measurements.values_mut() {
            findings.retain(|f| !in_scope(f.timepoint_id.as_deref()));
        }

        let mut stored = 0;
        for (category_id, findings) in data {
            let target = self.measurements.entry(category_id.clone()).or_default();
            for finding in findings.iter().filter(|f| in_scope(f.timepoint_id.as_deref())) {
                target.push(finding.clone());
                stored += 1;
            }
        }
        stored
    }

    fn upsert_timepoints(&mut self, timepoints: &[Timepoint]) {
        for timepoint in timepoints {
            match self
                .timepoints
                .iter_mut()
                .find(|tp| tp.timepoint_id == timepoint.timepoint_id)
            {
                Some(existing) => *existing = timepoint.clone(),
                None => self.timepoints.push(timepoint.clone()),
            }
        }
    }

    fn timepoint_mut(&mut self, timepoint_id: &str) -> Result<&mut Timepoint> {
        self.timepoints
            .iter_mut()
            .find(|tp| tp.timepoint_id == timepoint_id)
            .ok_or_else(|| TrackerError::NotFound(format!("timepoint {}", timepoint_id)))
    }
}

/// 内存存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    document: RwLock<TrackerDocument>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_document(document: TrackerDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// 当前文档的副本
    pub async fn snapshot(&self) -> TrackerDocument {
        self.document.read().await.clone()
    }
}

#[async_trait]
impl TimepointStore for InMemoryStore {
    async fn retrieve_timepoints(&self, filter: &TimepointFilter) -> Result<Vec<Timepoint>> {
        let document = self.document.read().await;
        Ok(document
            .timepoints
            .iter()
            .filter(|tp| filter.matches(tp))
            .cloned()
            .collect())
    }

    async fn store_timepoints(&self, timepoints: &[Timepoint]) -> Result<()> {
        self.document.write().await.upsert_timepoints(timepoints);
        Ok(())
    }

    async fn update_timepoint(&self, timepoint_id: &str, patch: &TimepointPatch) -> Result<()> {
        let mut document = self.document.write().await;
        patch.apply_to(document.timepoint_mut(timepoint_id)?);
        Ok(())
    }

    async fn remove_timepoint(&self, timepoint_id: &str) -> Result<()> {
        let mut document = self.document.write().await;
        let before = document.timepoints.len();
        document.timepoints.retain(|tp| tp.timepoint_id != timepoint_id);
        if document.timepoints.len() == before {
            return Err(TrackerError::NotFound(format!("timepoint {}", timepoint_id)));
        }
        Ok(())
    }

    async fn disassociate_study(&self, timepoint_ids: &[String], study_instance_uid: &str) -> Result<()> {
        let mut document = self.document.write().await;
        for timepoint in document
            .timepoints
            .iter_mut()
            .filter(|tp| timepoint_ids.contains(&tp.timepoint_id))
        {
            timepoint.study_instance_uids.remove(study_instance_uid);
        }
        // 不再关联任何检查的时间点一并删除
        document.timepoints.retain(|tp| !tp.study_instance_uids.is_empty());
        Ok(())
    }
}

#[async_trait]
impl MeasurementStore for InMemoryStore {
    async fn retrieve_measurements(&self, patient_id: &str, timepoint_ids: &[String]) -> Result<MeasurementData> {
        Ok(self
            .document
            .read()
            .await
            .retrieve_measurements(patient_id, timepoint_ids))
    }

    async fn store_measurements(&self, data: &MeasurementData, filter: &StorageFilter) -> Result<serde_json::Value> {
        let stored = self.document.write().await.store_measurements(data, filter);
        Ok(serde_json::json!({ "stored": stored }))
    }
}

/// JSON文件存储
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: InMemoryStore,
    /// 串行化写回，多个写入不会共用同一个临时文件
    flush_lock: Mutex<()>,
}

impl JsonFileStore {
    /// 打开数据文件；文件不存在时从空文档开始
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let document = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Data file {} not found, starting empty", path.display());
                TrackerDocument::default()
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            "Loaded {} timepoints from {}",
            document.timepoints.len(),
            path.display()
        );
        Ok(Self {
            path,
            inner: InMemoryStore::from_document(document),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> TrackerDocument {
        self.inner.snapshot().await
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        PathBuf::from(temp)
    }

    /// 写入同目录下的临时文件后重命名覆盖，原文件不会处于半写状态
    async fn flush(&self) -> Result<()> {
        let _flushing = self.flush_lock.lock().await;
        let document = self.inner.snapshot().await;
        let json = serde_json::to_vec_pretty(&document)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        let persistence = |e: std::io::Error| TrackerError::Persistence(format!("failed to write {}: {}", self.path.display(), e));
        tokio::fs::write(&temp, json).await.map_err(persistence)?;
        tokio::fs::rename(&temp, &self.path).await.map_err(persistence)?;

        debug!("Data file {} written", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl TimepointStore for JsonFileStore {
    async fn retrieve_timepoints(&self, filter: &TimepointFilter) -> Result<Vec<Timepoint>> {
        self.inner.retrieve_timepoints(filter).await
    }

    async fn store_timepoints(&self, timepoints: &[Timepoint]) -> Result<()> {
        self.inner.store_timepoints(timepoints).await?;
        self.flush().await
    }

    async fn update_timepoint(&self, timepoint_id: &str, patch: &TimepointPatch) -> Result<()> {
        self.inner.update_timepoint(timepoint_id, patch).await?;
        self.flush().await
    }

    async fn remove_timepoint(&self, timepoint_id: &str) -> Result<()> {
        self.inner.remove_timepoint(timepoint_id).await?;
        self.flush().await
    }

    async fn disassociate_study(&self, timepoint_ids: &[String], study_instance_uid: &str) -> Result<()> {
        self.inner
            .disassociate_study(timepoint_ids, study_instance_uid)
            .await?;
        self.flush().await
    }
}

#[async_trait]
impl MeasurementStore for JsonFileStore {
    async fn retrieve_measurements(&self, patient_id: &str, timepoint_ids: &[String]) -> Result<MeasurementData> {
        self.inner.retrieve_measurements(patient_id, timepoint_ids).await
    }

    async fn store_measurements(&self, data: &MeasurementData, filter: &StorageFilter) -> Result<serde_json::Value> {
        let result = self.inner.store_measurements(data, filter).await?;
        self.flush().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lesion_core::{Finding, TimepointType};

    fn timepoint(id: &str, timepoint_type: TimepointType, patient_id: &str) -> Timepoint {
        Timepoint::new(id, timepoint_type, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), patient_id)
            .with_study(format!("study-{}", id))
    }

    fn finding(timepoint_id: &str) -> Finding {
        let mut finding = Finding::new("bidirectional");
        finding.id = format!("finding-{}", timepoint_id);
        finding.timepoint_id = Some(timepoint_id.to_string());
        finding
    }

    fn document() -> TrackerDocument {
        let mut measurements = MeasurementData::new();
        measurements.insert("targets".into(), vec![finding("bl"), finding("fu1"), finding("other")]);
        TrackerDocument {
            timepoints: vec![
                timepoint("bl", TimepointType::Baseline, "p1"),
                timepoint("fu1", TimepointType::Followup, "p1"),
                timepoint("other", TimepointType::Baseline, "p2"),
            ],
            measurements,
        }
    }

    #[tokio::test]
    async fn test_retrieve_scoped_to_patient() {
        let store = InMemoryStore::from_document(document());

        let timepoints = store
            .retrieve_timepoints(&TimepointFilter::for_patient("p1"))
            .await
            .unwrap();
        assert_eq!(timepoints.len(), 2);

        let ids = vec!["bl".to_string(), "other".to_string()];
        let data = store.retrieve_measurements("p1", &ids).await.unwrap();
        let found: Vec<&str> = data["targets"].iter().map(|f| f.id.as_str()).collect();
        assert_eq!(found, vec!["finding-bl"]);
    }

    #[tokio::test]
    async fn test_store_measurements_replaces_scope() {
        let store = InMemoryStore::from_document(document());

        let mut replacement = finding("fu1");
        replacement.id = "finding-fu1-new".into();
        let mut data = MeasurementData::new();
        data.insert("targets".into(), vec![replacement, finding("bl")]);
        let filter = StorageFilter {
            patient_id: Some("p1".into()),
            timepoint_ids: vec!["fu1".into()],
        };

        let result = store.store_measurements(&data, &filter).await.unwrap();
        assert_eq!(result["stored"], 1);

        let snapshot = store.snapshot().await;
        let ids: Vec<&str> = snapshot.measurements["targets"].iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["finding-bl", "finding-other", "finding-fu1-new"]);
    }

    #[tokio::test]
    async fn test_timepoint_mutations() {
        let store = InMemoryStore::from_document(document());

        let patch = TimepointPatch {
            is_locked: Some(true),
            ..Default::default()
        };
        store.update_timepoint("bl", &patch).await.unwrap();
        assert!(matches!(
            store.update_timepoint("missing", &patch).await,
            Err(TrackerError::NotFound(_))
        ));

        store
            .disassociate_study(&["fu1".to_string()], "study-fu1")
            .await
            .unwrap();
        let snapshot = store.snapshot().await;
        assert!(snapshot.timepoints.iter().all(|tp| tp.timepoint_id != "fu1"));
        assert!(snapshot.timepoints.iter().find(|tp| tp.timepoint_id == "bl").unwrap().is_locked);

        store.remove_timepoint("other").await.unwrap();
        assert_eq!(store.snapshot().await.timepoints.len(), 1);
    }

    #[tokio::test]
    async fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("tracker.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(store.snapshot().await.timepoints.is_empty());
        store
            .store_timepoints(&document().timepoints)
            .await
            .unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let timepoints = reopened
            .retrieve_timepoints(&TimepointFilter::for_patient("p2"))
            .await
            .unwrap();
        assert_eq!(timepoints.len(), 1);
        assert_eq!(timepoints[0].timepoint_id, "other");
    }

    #[tokio::test]
    async fn test_json_file_store_replaces_file_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        let temp = dir.path().join("tracker.json.tmp");
        let store = JsonFileStore::open(&path).await.unwrap();
        store.store_timepoints(&document().timepoints).await.unwrap();

        // 上次写回中断留下的残缺临时文件不影响数据文件
        tokio::fs::write(&temp, b"{\"timepoints\": [").await.unwrap();
        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.snapshot().await.timepoints.len(), 3);

        reopened.remove_timepoint("other").await.unwrap();
        assert!(!temp.exists());

        let bytes = tokio::fs::read(&path).await.unwrap();
        let written: TrackerDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(written.timepoints.len(), 2);
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(TrackerError::Serialization(_))
        ));
    }
}
