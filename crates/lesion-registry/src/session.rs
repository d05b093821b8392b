//! 追踪会话
//!
//! 将时间点注册表、测量注册表与持久化接口组合在一起。检索在不持有锁的情况下进行，
//! 结果在写锁内应用；切换患者会取消尚未完成的检索，过期结果直接丢弃。

use crate::measurement::MeasurementRegistry;
use crate::timepoint::TimepointRegistry;
use lesion_core::{
    Finding, FindingFilter, MeasurementStore, Result, StorageFilter, TimepointFilter, TimepointPatch, TimepointStore,
    TrackerError,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 会话内的注册表状态
pub struct TrackerState {
    pub timepoints: TimepointRegistry,
    pub measurements: MeasurementRegistry,
}

/// 单个患者的追踪会话
pub struct TrackingSession {
    state: RwLock<TrackerState>,
    timepoint_store: Option<Arc<dyn TimepointStore>>,
    measurement_store: Option<Arc<dyn MeasurementStore>>,
    cancel_token: RwLock<CancellationToken>,
}

/// 未配置的可选持久化操作记录错误后按空操作处理
fn tolerate_unconfigured(result: Result<()>, operation: &str) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_config() => {
            error!("{}: {}", operation, e);
            Ok(false)
        }
        Err(e) => {
            error!("{} failed: {}", operation, e);
            Err(e)
        }
    }
}

impl TrackingSession {
    /// 创建新的追踪会话
    pub fn new(timepoints: TimepointRegistry, measurements: MeasurementRegistry) -> Self {
        Self {
            state: RwLock::new(TrackerState {
                timepoints,
                measurements,
            }),
            timepoint_store: None,
            measurement_store: None,
            cancel_token: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn with_timepoint_store(mut self, store: Arc<dyn TimepointStore>) -> Self {
        self.timepoint_store = Some(store);
        self
    }

    pub fn with_measurement_store(mut self, store: Arc<dyn MeasurementStore>) -> Self {
        self.measurement_store = Some(store);
        self
    }

    /// 读取注册表状态
    pub async fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().await
    }

    /// 切换患者：取消进行中的检索并清空两个注册表
    ///
    /// 令牌在持有状态写锁期间替换，持有新令牌的检索只能在清空之后写入。
    pub async fn switch_patient(&self, current_timepoint_id: Option<String>) {
        let mut state = self.state.write().await;
        {
            let mut token = self.cancel_token.write().await;
            token.cancel();
            *token = CancellationToken::new();
        }

        state.timepoints.reset(current_timepoint_id.clone());
        state.measurements.reset();
        info!(current_timepoint = ?current_timepoint_id, "Tracking session switched patient");
    }

    async fn current_token(&self) -> CancellationToken {
        self.cancel_token.read().await.clone()
    }

    /// 在取消令牌的保护下等待外部调用
    async fn guarded<T, F>(token: &CancellationToken, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("{} cancelled by patient switch", operation);
                Err(TrackerError::Cancelled(operation.to_string()))
            }
            result = future => result,
        }
    }

    fn stale(token: &CancellationToken, operation: &str) -> Result<()> {
        if token.is_cancelled() {
            warn!("Discarding stale result of {}", operation);
            return Err(TrackerError::Cancelled(operation.to_string()));
        }
        Ok(())
    }

    /// 检索时间点并合并到注册表
    pub async fn retrieve_timepoints(&self, filter: &TimepointFilter) -> Result<usize> {
        let Some(store) = &self.timepoint_store else {
            error!("Timepoint retrieval function has not been configured");
            return Ok(0);
        };

        let token = self.current_token().await;
        let timepoints = Self::guarded(&token, "timepoint retrieval", store.retrieve_timepoints(filter))
            .await
            .map_err(|e| {
                error!("Timepoint retrieval failed: {}", e);
                e
            })?;
        let count = timepoints.len();

        let mut state = self.state.write().await;
        Self::stale(&token, "timepoint retrieval")?;
        state.timepoints.merge_timepoints(timepoints);

        info!(count, "Timepoints retrieved");
        Ok(count)
    }

    /// 保存全部时间点
    pub async fn store_timepoints(&self) -> Result<()> {
        let Some(store) = &self.timepoint_store else {
            error!("Timepoint store function has not been configured");
            return Ok(());
        };

        let timepoints = self.state.read().await.timepoints.timepoints().to_vec();
        let stored = tolerate_unconfigured(store.store_timepoints(&timepoints).await, "Timepoint store")?;
        if stored {
            info!(count = timepoints.len(), "Timepoints stored");
        }
        Ok(())
    }

    /// 更新时间点，持久化成功后合并到本地
    pub async fn update_timepoint(&self, timepoint_id: &str, patch: &TimepointPatch) -> Result<()> {
        let Some(store) = &self.timepoint_store else {
            error!("Timepoint update function has not been configured");
            return Ok(());
        };

        let token = self.current_token().await;
        let result = Self::guarded(&token, "timepoint update", store.update_timepoint(timepoint_id, patch)).await;
        if !tolerate_unconfigured(result, "Timepoint update")? {
            return Ok(());
        }

        let mut state = self.state.write().await;
        Self::stale(&token, "timepoint update")?;
        if !state.timepoints.apply_patch(timepoint_id, patch) {
            debug!(timepoint_id, "Updated timepoint is not loaded locally");
        }
        Ok(())
    }

    /// 删除时间点，持久化成功后从本地移除
    pub async fn remove_timepoint(&self, timepoint_id: &str) -> Result<()> {
        let Some(store) = &self.timepoint_store else {
            error!("Timepoint remove function has not been configured");
            return Ok(());
        };

        let token = self.current_token().await;
        let result = Self::guarded(&token, "timepoint removal", store.remove_timepoint(timepoint_id)).await;
        if !tolerate_unconfigured(result, "Timepoint remove")? {
            return Ok(());
        }

        let mut state = self.state.write().await;
        Self::stale(&token, "timepoint removal")?;
        state.timepoints.remove_local(timepoint_id);
        Ok(())
    }

    /// 解除检查关联，然后清空并重新检索当前患者的时间点
    pub async fn disassociate_study(&self, timepoint_ids: &[String], study_instance_uid: &str) -> Result<()> {
        let Some(store) = &self.timepoint_store else {
            error!("Study disassociate function has not been configured");
            return Ok(());
        };

        let token = self.current_token().await;
        let result = Self::guarded(
            &token,
            "study disassociation",
            store.disassociate_study(timepoint_ids, study_instance_uid),
        )
        .await;
        if !tolerate_unconfigured(result, "Study disassociate")? {
            return Ok(());
        }

        let filter = {
            let mut state = self.state.write().await;
            Self::stale(&token, "study disassociation")?;
            let filter = state
                .timepoints
                .current()
                .map(|tp| TimepointFilter::for_patient(tp.patient_id.clone()))
                .unwrap_or_default();
            state.timepoints.clear();
            filter
        };

        self.retrieve_timepoints(&filter).await?;
        Ok(())
    }

    /// 检索测量并逐条加入注册表，返回纳入目录的数量
    pub async fn retrieve_measurements(&self, patient_id: &str, timepoint_ids: &[String]) -> Result<usize> {
        let Some(store) = &self.measurement_store else {
            error!("Measurement retrieval function has not been configured");
            return Ok(0);
        };

        let token = self.current_token().await;
        let data = Self::guarded(
            &token,
            "measurement retrieval",
            store.retrieve_measurements(patient_id, timepoint_ids),
        )
        .await
        .map_err(|e| {
            error!("Measurement retrieval failed: {}", e);
            e
        })?;

        let mut state = self.state.write().await;
        Self::stale(&token, "measurement retrieval")?;
        let TrackerState {
            timepoints,
            measurements,
        } = &mut *state;

        let mut added = 0usize;
        for (category_id, findings) in data {
            for finding in findings {
                let finding_type = finding.finding_type.clone();
                match measurements.add_measurement(timepoints, &finding_type, finding) {
                    Ok(Some(_)) => added += 1,
                    Ok(None) => {}
                    Err(e) => warn!(category_id = %category_id, "Skipping retrieved measurement: {}", e),
                }
            }
        }
        measurements.sync_measurements_and_tool_data();

        info!(patient_id, added, "Measurements retrieved");
        Ok(added)
    }

    /// 保存测量；指定时间点时只保存该时间点的范围
    pub async fn store_measurements(&self, timepoint_id: Option<&str>) -> Result<Option<serde_json::Value>> {
        let Some(store) = &self.measurement_store else {
            error!("Measurement store function has not been configured");
            return Ok(None);
        };

        let (data, filter) = {
            let state = self.state.read().await;
            let timepoints = state
                .timepoints
                .all_where(|tp| timepoint_id.map_or(true, |id| tp.timepoint_id == id));
            let Some(first) = timepoints.first() else {
                return Err(TrackerError::NotFound("no timepoints to store measurements for".to_string()));
            };
            let filter = StorageFilter {
                patient_id: Some(first.patient_id.clone()),
                timepoint_ids: timepoints.iter().map(|tp| tp.timepoint_id.clone()).collect(),
            };
            (state.measurements.measurement_data_for_storage(), filter)
        };

        match store.store_measurements(&data, &filter).await {
            Ok(result) => {
                info!(timepoints = filter.timepoint_ids.len(), "Measurements stored");
                Ok(Some(result))
            }
            Err(e) if e.is_config() => {
                error!("Measurement store: {}", e);
                Ok(None)
            }
            Err(e) => {
                error!("Measurement store failed: {}", e);
                Err(e)
            }
        }
    }

    pub async fn set_current_timepoint(&self, timepoint_id: Option<String>) {
        self.state.write().await.timepoints.set_current_timepoint_id(timepoint_id);
    }

    /// 锁定当前时间点
    pub async fn lock_current_timepoint(&self) {
        self.state.write().await.timepoints.lock();
    }

    pub async fn add_measurement(&self, finding_type: &str, finding: Finding) -> Result<Option<Finding>> {
        let mut state = self.state.write().await;
        let TrackerState {
            timepoints,
            measurements,
        } = &mut *state;
        measurements.add_measurement(timepoints, finding_type, finding)
    }

    pub async fn update_measurement(&self, finding_type: &str, finding: Finding) -> Result<bool> {
        self.state.write().await.measurements.update_measurement(finding_type, finding)
    }

    pub async fn remove_measurement(&self, finding_type: &str, finding: &Finding) -> Result<()> {
        self.state
            .write()
            .await
            .measurements
            .on_measurement_removed(finding_type, finding)
    }

    pub async fn delete_measurements(
        &self,
        finding_type: &str,
        category_id: &str,
        filter: &FindingFilter,
    ) -> Result<usize> {
        self.state
            .write()
            .await
            .measurements
            .delete_measurements(finding_type, category_id, filter)
    }

    pub async fn sync_measurements_and_tool_data(&self) {
        self.state.read().await.measurements.sync_measurements_and_tool_data();
    }
}
