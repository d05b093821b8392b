//! 时间点注册表
//!
//! 维护患者的影像时间点列表，回答时间相关的查询：当前、前次、基线、
//! 最低点、比较时间点以及初始评估时间点集合。

use lesion_core::{ComparisonKey, RegistryObserver, Result, Timepoint, TimepointPatch, TimepointType, TrackerError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 时间点注册表
pub struct TimepointRegistry {
    timepoints: Vec<Timepoint>,
    current_timepoint_id: Option<String>,
    comparison_key: ComparisonKey,
    /// 用户在视口中手动选择的比较时间点
    user_comparison: Option<Timepoint>,
    observer: Option<Arc<dyn RegistryObserver>>,
}

impl TimepointRegistry {
    /// 创建新的时间点注册表
    pub fn new(current_timepoint_id: Option<String>, comparison_key: ComparisonKey) -> Self {
        Self {
            timepoints: Vec::new(),
            current_timepoint_id,
            comparison_key,
            user_comparison: None,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RegistryObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn set_observer(&mut self, observer: Option<Arc<dyn RegistryObserver>>) {
        self.observer = observer;
    }

    /// 清空时间点并切换当前时间点
    pub fn reset(&mut self, current_timepoint_id: Option<String>) {
        self.timepoints.clear();
        self.user_comparison = None;
        self.current_timepoint_id = current_timepoint_id;
    }

    pub fn set_current_timepoint_id(&mut self, timepoint_id: Option<String>) {
        self.current_timepoint_id = timepoint_id;
    }

    pub fn current_timepoint_id(&self) -> Option<&str> {
        self.current_timepoint_id.as_deref()
    }

    /// 设置覆盖默认规则的比较时间点
    pub fn set_user_comparison(&mut self, timepoint: Option<Timepoint>) {
        self.user_comparison = timepoint;
    }

    pub fn clear_user_comparison(&mut self) {
        self.user_comparison = None;
    }

    pub fn comparison_key(&self) -> ComparisonKey {
        self.comparison_key
    }

    pub fn set_comparison_key(&mut self, key: ComparisonKey) {
        self.comparison_key = key;
    }

    /// 按ID合并时间点：存在则替换，否则追加
    pub fn merge_timepoints(&mut self, timepoints: Vec<Timepoint>) {
        for timepoint in timepoints {
            match self
                .timepoints
                .iter()
                .position(|tp| tp.timepoint_id == timepoint.timepoint_id)
            {
                Some(index) => self.timepoints[index] = timepoint,
                None => self.timepoints.push(timepoint),
            }
        }

        debug!("Merged timepoints, {} now registered", self.timepoints.len());
        self.notify_updated();
    }

    /// 从本地列表移除时间点
    pub fn remove_local(&mut self, timepoint_id: &str) -> bool {
        let before = self.timepoints.len();
        self.timepoints.retain(|tp| tp.timepoint_id != timepoint_id);
        let removed = self.timepoints.len() != before;
        if removed {
            self.notify_updated();
        }
        removed
    }

    /// 将部分更新合并到本地时间点
    pub fn apply_patch(&mut self, timepoint_id: &str, patch: &TimepointPatch) -> bool {
        let updated = match self.timepoints.iter_mut().find(|tp| tp.timepoint_id == timepoint_id) {
            Some(timepoint) => {
                patch.apply_to(timepoint);
                true
            }
            None => false,
        };
        if updated {
            self.notify_updated();
        }
        updated
    }

    pub fn clear(&mut self) {
        self.timepoints.clear();
    }

    fn notify_updated(&self) {
        match &self.observer {
            Some(observer) => observer.on_timepoints_updated(&self.timepoints),
            None => warn!("Timepoints update callback is not defined"),
        }
    }

    pub fn timepoints(&self) -> &[Timepoint] {
        &self.timepoints
    }

    pub fn len(&self) -> usize {
        self.timepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timepoints.is_empty()
    }

    pub fn find(&self, timepoint_id: &str) -> Option<&Timepoint> {
        self.timepoints.iter().find(|tp| tp.timepoint_id == timepoint_id)
    }

    /// 全部时间点，按访视日期降序
    pub fn all(&self) -> Vec<&Timepoint> {
        self.all_where(|_| true)
    }

    /// 满足条件的时间点，按访视日期降序
    pub fn all_where<F>(&self, filter: F) -> Vec<&Timepoint>
    where
        F: Fn(&Timepoint) -> bool,
    {
        let mut result: Vec<&Timepoint> = self.timepoints.iter().filter(|tp| filter(tp)).collect();
        result.sort_by(|a, b| b.visit_date.cmp(&a.visit_date));
        result
    }

    fn ascending(&self) -> Vec<&Timepoint> {
        let mut result: Vec<&Timepoint> = self.timepoints.iter().collect();
        result.sort_by(|a, b| a.visit_date.cmp(&b.visit_date));
        result
    }

    /// 当前时间点
    pub fn current(&self) -> Option<&Timepoint> {
        let current_id = self.current_timepoint_id.as_deref()?;
        self.find(current_id)
    }

    /// 当前时间点之前最近的时间点
    pub fn prior(&self) -> Option<&Timepoint> {
        let current = self.current()?;
        self.all().into_iter().find(|tp| tp.visit_date < current.visit_date)
    }

    /// 不晚于当前时间点的最近基线
    pub fn baseline(&self) -> Option<&Timepoint> {
        let current = self.current()?;
        self.all()
            .into_iter()
            .find(|tp| tp.timepoint_type == TimepointType::Baseline && tp.visit_date <= current.visit_date)
    }

    /// 最低点时间点：不晚于当前、标记为 nadir 的最早时间点（不含当前），没有则为基线
    pub fn nadir(&self) -> Option<&Timepoint> {
        let current = self.current()?;
        let nadir = self.ascending().into_iter().find(|tp| {
            tp.timepoint_id != current.timepoint_id && tp.is_nadir() && tp.visit_date <= current.visit_date
        });

        nadir.or_else(|| self.baseline())
    }

    /// 当前时间点之后最近的基线
    pub fn next_baseline_after_current(&self) -> Option<&Timepoint> {
        let current = self.current()?;
        self.ascending()
            .into_iter()
            .find(|tp| tp.visit_date > current.visit_date && tp.timepoint_type == TimepointType::Baseline)
    }

    /// 比较时间点
    ///
    /// 1. 用户指定的比较时间点优先
    /// 2. 当前为基线前：取之后最近的基线
    /// 3. 当前为基线：取前次时间点
    /// 4. 否则按 `key` 选择；结果与当前相同则返回 `None`
    pub fn comparison(&self, key: ComparisonKey) -> Option<&Timepoint> {
        if let Some(user_comparison) = &self.user_comparison {
            return Some(user_comparison);
        }

        let current = self.current()?;

        if current.timepoint_type == TimepointType::Prebaseline {
            if let Some(next_baseline) = self.next_baseline_after_current() {
                return Some(next_baseline);
            }
        }

        if current.timepoint_type == TimepointType::Baseline {
            if let Some(prior) = self.prior() {
                return Some(prior);
            }
        }

        let comparison = self.by_key(key)?;
        if comparison.timepoint_id == current.timepoint_id {
            return None;
        }

        Some(comparison)
    }

    /// 使用默认键的比较时间点
    pub fn default_comparison(&self) -> Option<&Timepoint> {
        self.comparison(self.comparison_key)
    }

    fn by_key(&self, key: ComparisonKey) -> Option<&Timepoint> {
        match key {
            ComparisonKey::Baseline => self.baseline(),
            ComparisonKey::Nadir => self.nadir(),
            ComparisonKey::Prior => self.prior(),
        }
    }

    /// 当前时间点之后、下一次随访之前最新的初始时间点
    ///
    /// 之后没有随访时返回最后一个时间点；当前为随访时返回 `None`。
    pub fn latest_initial_timepoint_after_current(&self) -> Option<&Timepoint> {
        let current = self.current()?;
        if current.timepoint_type == TimepointType::Followup {
            return None;
        }

        let next: Vec<&Timepoint> = self
            .ascending()
            .into_iter()
            .filter(|tp| tp.visit_date > current.visit_date)
            .collect();

        match next.iter().position(|tp| tp.timepoint_type == TimepointType::Followup) {
            Some(0) => None,
            Some(index) => Some(next[index - 1]),
            None => next.last().copied(),
        }
    }

    /// 初始评估时间点（基线前与基线）的ID
    pub fn initial_timepoint_ids(&self) -> Vec<String> {
        let Some(current) = self.current() else {
            return Vec::new();
        };

        let pivot = if current.timepoint_type.is_initial() {
            self.latest_initial_timepoint_after_current().unwrap_or(current)
        } else {
            current
        };
        let pivot_date = pivot.visit_date;

        let ids_of = |timepoint_type: TimepointType| -> Vec<String> {
            self.timepoints
                .iter()
                .filter(|tp| tp.timepoint_type == timepoint_type && tp.visit_date <= pivot_date)
                .map(|tp| tp.timepoint_id.clone())
                .collect()
        };

        let mut ids = ids_of(TimepointType::Prebaseline);
        ids.extend(ids_of(TimepointType::Baseline));
        ids
    }

    /// 目标时间点及之前是否存在两个以上基线
    pub fn is_rebaseline(&self, timepoint_id: Option<&str>) -> bool {
        let target = match timepoint_id {
            Some(id) => self.find(id),
            None => self.current(),
        };
        let Some(target) = target else {
            return false;
        };

        self.timepoints
            .iter()
            .filter(|tp| tp.timepoint_type == TimepointType::Baseline && tp.visit_date <= target.visit_date)
            .count()
            > 1
    }

    /// 锁定当前时间点
    pub fn lock(&mut self) {
        let Some(current_id) = self.current_timepoint_id.clone() else {
            return;
        };

        if let Some(timepoint) = self.timepoints.iter_mut().find(|tp| tp.timepoint_id == current_id) {
            timepoint.is_locked = true;
            info!("Locked timepoint {}", current_id);
        }
    }

    /// 包含指定检查的时间点
    pub fn study(&self, study_instance_uid: &str) -> Vec<&Timepoint> {
        self.all_where(|tp| tp.study_instance_uids.contains(study_instance_uid))
    }

    /// 关键时间点：当前、前次、最低点、基线（去重）
    pub fn key(&self) -> Vec<&Timepoint> {
        let mut result: Vec<&Timepoint> = Vec::new();
        let candidates = [self.current(), self.prior(), self.nadir(), self.baseline()];
        for timepoint in candidates.into_iter().flatten() {
            if !result.iter().any(|tp| tp.timepoint_id == timepoint.timepoint_id) {
                result.push(timepoint);
            }
        }
        result
    }

    pub fn current_and_prior(&self) -> Vec<&Timepoint> {
        let mut result = Vec::new();
        if let Some(current) = self.current() {
            result.push(current);
            if let Some(prior) = self.prior() {
                if prior.timepoint_id != current.timepoint_id {
                    result.push(prior);
                }
            }
        }
        result
    }

    pub fn current_and_comparison(&self, key: ComparisonKey) -> Vec<&Timepoint> {
        let mut result: Vec<&Timepoint> = self.current().into_iter().collect();
        if let Some(comparison) = self.comparison(key) {
            if !result.iter().any(|tp| tp.timepoint_id == comparison.timepoint_id) {
                result.push(comparison);
            }
        }
        result
    }

    /// 同一患者、同一类型时间点中的访视序号（从1开始）
    pub fn calculate_visit_number(&self, timepoint: &Timepoint) -> Result<u32> {
        self.ascending()
            .into_iter()
            .filter(|tp| tp.patient_id == timepoint.patient_id && tp.timepoint_type == timepoint.timepoint_type)
            .position(|tp| tp.timepoint_id == timepoint.timepoint_id)
            .map(|index| index as u32 + 1)
            .ok_or_else(|| {
                TrackerError::NotFound(format!(
                    "timepoint {} is not in the list of relevant timepoints",
                    timepoint.timepoint_id
                ))
            })
    }

    /// 时间点名称，例如 "Baseline"、"Follow-up 2"
    pub fn name(&self, timepoint: &Timepoint) -> Result<String> {
        let type_name = timepoint.timepoint_type.display_name();
        if timepoint.timepoint_type == TimepointType::Baseline {
            return Ok(type_name.to_string());
        }

        let visit_number = match timepoint.visit_number {
            Some(number) => number,
            None => self.calculate_visit_number(timepoint)?,
        };
        Ok(format!("{} {}", type_name, visit_number))
    }

    /// 时间点标题，附带 "Current"、"Prior"、"Nadir" 标记
    pub fn title(&self, timepoint: &Timepoint) -> Result<String> {
        let name = self.name(timepoint)?;

        let mut index: Option<usize> = None;
        let mut counter: Option<usize> = None;
        for tp in self.all() {
            if self.current_timepoint_id.as_deref() == Some(tp.timepoint_id.as_str()) {
                counter = Some(0);
            }
            if let Some(position) = counter {
                index = Some(position);
                counter = Some(position + 1);
            }
            if tp.timepoint_id == timepoint.timepoint_id {
                break;
            }
        }

        let mut tags: Vec<&str> = match index {
            Some(0) => vec!["Current"],
            Some(1) => vec!["Prior"],
            _ => Vec::new(),
        };
        if self
            .nadir()
            .is_some_and(|nadir| nadir.timepoint_id == timepoint.timepoint_id)
        {
            tags.push("Nadir");
        }

        if tags.is_empty() {
            Ok(name)
        } else {
            Ok(format!("{} ({})", name, tags.join(", ")))
        }
    }
}

impl Default for TimepointRegistry {
    fn default() -> Self {
        Self::new(None, ComparisonKey::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{day, timepoint, RecordingObserver};

    /// PBL@day0, BL@day10, FU1@day40
    fn registry(current: &str) -> TimepointRegistry {
        let mut registry = TimepointRegistry::new(Some(current.to_string()), ComparisonKey::Baseline);
        registry.merge_timepoints(vec![
            timepoint("pbl", TimepointType::Prebaseline, 0),
            timepoint("bl", TimepointType::Baseline, 10),
            timepoint("fu1", TimepointType::Followup, 40),
        ]);
        registry
    }

    fn id(tp: Option<&Timepoint>) -> Option<&str> {
        tp.map(|tp| tp.timepoint_id.as_str())
    }

    #[test]
    fn test_all_sorted_descending() {
        let registry = registry("fu1");
        let ids: Vec<&str> = registry.all().iter().map(|tp| tp.timepoint_id.as_str()).collect();
        assert_eq!(ids, vec!["fu1", "bl", "pbl"]);
    }

    #[test]
    fn test_comparison_for_prebaseline_is_next_baseline() {
        let registry = registry("pbl");
        assert_eq!(id(registry.comparison(ComparisonKey::Baseline)), Some("bl"));
    }

    #[test]
    fn test_comparison_for_baseline_is_prior() {
        let registry = registry("bl");
        assert_eq!(id(registry.comparison(ComparisonKey::Baseline)), Some("pbl"));
    }

    #[test]
    fn test_comparison_for_followup_uses_key() {
        let registry = registry("fu1");
        assert_eq!(id(registry.comparison(ComparisonKey::Baseline)), Some("bl"));
        assert_eq!(id(registry.comparison(ComparisonKey::Prior)), Some("bl"));
    }

    #[test]
    fn test_comparison_never_returns_current() {
        let mut registry = TimepointRegistry::new(Some("bl".into()), ComparisonKey::Baseline);
        registry.merge_timepoints(vec![timepoint("bl", TimepointType::Baseline, 10)]);
        assert!(registry.comparison(ComparisonKey::Baseline).is_none());
    }

    #[test]
    fn test_user_comparison_overrides_rules() {
        let mut registry = registry("fu1");
        registry.set_user_comparison(Some(timepoint("pbl", TimepointType::Prebaseline, 0)));
        assert_eq!(id(registry.default_comparison()), Some("pbl"));
    }

    #[test]
    fn test_queries_without_current_return_none() {
        let registry = registry("missing");
        assert!(registry.current().is_none());
        assert!(registry.prior().is_none());
        assert!(registry.baseline().is_none());
        assert!(registry.nadir().is_none());
        assert!(registry.comparison(ComparisonKey::Nadir).is_none());
        assert!(registry.initial_timepoint_ids().is_empty());
    }

    #[test]
    fn test_nadir_prefers_earliest_tagged_then_baseline() {
        let mut registry = registry("fu1");
        assert_eq!(id(registry.nadir()), Some("bl"));

        registry.merge_timepoints(vec![
            timepoint("fu0", TimepointType::Followup, 20).with_key("nadir"),
            timepoint("fu0b", TimepointType::Followup, 30).with_key("nadir"),
        ]);
        assert_eq!(id(registry.nadir()), Some("fu0"));
        assert_eq!(id(registry.comparison(ComparisonKey::Nadir)), Some("fu0"));
    }

    #[test]
    fn test_nadir_excludes_current() {
        let mut registry = TimepointRegistry::new(Some("fu1".into()), ComparisonKey::Nadir);
        registry.merge_timepoints(vec![
            timepoint("bl", TimepointType::Baseline, 10),
            timepoint("fu1", TimepointType::Followup, 40).with_key("nadir"),
        ]);
        assert_eq!(id(registry.nadir()), Some("bl"));
    }

    #[test]
    fn test_nadir_includes_same_date_and_ignores_later() {
        let mut registry = TimepointRegistry::new(Some("fu1".into()), ComparisonKey::Nadir);
        registry.merge_timepoints(vec![
            timepoint("bl", TimepointType::Baseline, 10),
            timepoint("fu2", TimepointType::Followup, 60).with_key("nadir"),
            timepoint("fu1", TimepointType::Followup, 40),
        ]);
        assert_eq!(id(registry.nadir()), Some("bl"));

        registry.merge_timepoints(vec![timepoint("fu1b", TimepointType::Followup, 40).with_key("nadir")]);
        assert_eq!(id(registry.nadir()), Some("fu1b"));
    }

    #[test]
    fn test_initial_timepoint_ids_from_followup() {
        let registry = registry("fu1");
        assert_eq!(registry.initial_timepoint_ids(), vec!["pbl".to_string(), "bl".to_string()]);
    }

    #[test]
    fn test_initial_timepoint_ids_pivot_moves_to_latest_initial() {
        // 当前为基线前时，基准移动到下一次随访之前最新的初始时间点
        let registry = registry("pbl");
        assert_eq!(id(registry.latest_initial_timepoint_after_current()), Some("bl"));
        assert_eq!(registry.initial_timepoint_ids(), vec!["pbl".to_string(), "bl".to_string()]);
    }

    #[test]
    fn test_latest_initial_none_when_followup_is_next() {
        let mut registry = TimepointRegistry::new(Some("bl".into()), ComparisonKey::Baseline);
        registry.merge_timepoints(vec![
            timepoint("bl", TimepointType::Baseline, 10),
            timepoint("fu1", TimepointType::Followup, 40),
            timepoint("bl2", TimepointType::Baseline, 60),
        ]);
        assert!(registry.latest_initial_timepoint_after_current().is_none());
        assert_eq!(registry.initial_timepoint_ids(), vec!["bl".to_string()]);
    }

    #[test]
    fn test_latest_initial_without_followup_is_last() {
        let mut registry = TimepointRegistry::new(Some("pbl".into()), ComparisonKey::Baseline);
        registry.merge_timepoints(vec![
            timepoint("pbl", TimepointType::Prebaseline, 0),
            timepoint("bl", TimepointType::Baseline, 10),
            timepoint("bl2", TimepointType::Baseline, 15),
        ]);
        assert_eq!(id(registry.latest_initial_timepoint_after_current()), Some("bl2"));
    }

    #[test]
    fn test_is_rebaseline() {
        let mut registry = registry("fu1");
        assert!(!registry.is_rebaseline(None));

        registry.merge_timepoints(vec![timepoint("bl2", TimepointType::Baseline, 50)]);
        assert!(registry.is_rebaseline(Some("bl2")));
        assert!(!registry.is_rebaseline(Some("fu1")));
    }

    #[test]
    fn test_merge_same_id_keeps_latest_payload() {
        let mut registry = registry("fu1");
        registry.merge_timepoints(vec![timepoint("fu1", TimepointType::Followup, 45)]);

        let matching: Vec<&Timepoint> = registry.all_where(|tp| tp.timepoint_id == "fu1");
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].visit_date, day(45));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_merge_notifies_observer() {
        let observer = Arc::new(RecordingObserver::default());
        let mut registry = TimepointRegistry::default().with_observer(observer.clone());
        registry.merge_timepoints(vec![timepoint("bl", TimepointType::Baseline, 10)]);
        assert_eq!(observer.timepoint_updates(), 1);
    }

    #[test]
    fn test_names_and_titles() {
        let mut registry = registry("fu1");
        registry.merge_timepoints(vec![timepoint("fu2", TimepointType::Followup, 70)]);

        let fu1 = registry.find("fu1").cloned().unwrap();
        let bl = registry.find("bl").cloned().unwrap();
        let pbl = registry.find("pbl").cloned().unwrap();
        let fu2 = registry.find("fu2").cloned().unwrap();

        assert_eq!(registry.name(&fu1).unwrap(), "Follow-up 1");
        assert_eq!(registry.name(&fu2).unwrap(), "Follow-up 2");
        assert_eq!(registry.title(&fu1).unwrap(), "Follow-up 1 (Current)");
        assert_eq!(registry.title(&bl).unwrap(), "Baseline (Prior, Nadir)");
        assert_eq!(registry.title(&pbl).unwrap(), "Pre-Baseline 1");
        assert_eq!(registry.title(&fu2).unwrap(), "Follow-up 2");
    }

    #[test]
    fn test_name_of_unknown_timepoint_is_error() {
        let registry = registry("fu1");
        let stranger = timepoint("fu9", TimepointType::Followup, 90);
        assert!(matches!(registry.name(&stranger), Err(TrackerError::NotFound(_))));
    }

    #[test]
    fn test_lock_marks_current() {
        let mut registry = registry("bl");
        registry.lock();
        assert!(registry.current().unwrap().is_locked);
        assert!(!registry.find("fu1").unwrap().is_locked);
    }

    #[test]
    fn test_key_and_study_lookup() {
        let mut registry = registry("fu1");
        registry.merge_timepoints(vec![timepoint("fu1", TimepointType::Followup, 40).with_study("1.2.40")]);

        let key: Vec<&str> = registry.key().iter().map(|tp| tp.timepoint_id.as_str()).collect();
        assert_eq!(key, vec!["fu1", "bl"]);
        assert_eq!(id(registry.study("1.2.40").first().copied()), Some("fu1"));
        assert_eq!(registry.current_and_prior().len(), 2);
        assert_eq!(registry.current_and_comparison(ComparisonKey::Baseline).len(), 2);
    }

    #[test]
    fn test_patch_and_remove_local() {
        let mut registry = registry("fu1");
        let patch = TimepointPatch {
            timepoint_key: Some("nadir".into()),
            ..Default::default()
        };
        assert!(registry.apply_patch("bl", &patch));
        assert!(registry.find("bl").unwrap().is_nadir());

        assert!(registry.remove_local("pbl"));
        assert!(!registry.remove_local("pbl"));
        assert_eq!(registry.len(), 2);
    }
}
