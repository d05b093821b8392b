//! 患者病灶报告

use anyhow::Result;
use lesion_core::utils::lesion_label;
use lesion_registry::TrackerState;
use serde::Serialize;

/// 时间点摘要
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimepointSummary {
    pub timepoint_id: String,
    pub title: String,
    /// ISO 日期
    pub visit_date: String,
    pub is_locked: bool,
}

/// 病灶摘要
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LesionSummary {
    pub category_id: String,
    pub label: Option<String>,
    pub finding_type: String,
    pub timepoint_id: Option<String>,
    pub lesion_naming_number: u32,
    pub measurement_number: u32,
    pub location: Option<String>,
    pub is_new: bool,
}

/// 患者报告
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientReport {
    pub patient_id: String,
    pub current_timepoint_id: Option<String>,
    pub comparison_timepoint_id: Option<String>,
    pub initial_timepoint_ids: Vec<String>,
    pub timepoints: Vec<TimepointSummary>,
    pub lesions: Vec<LesionSummary>,
}

pub fn build_report(patient_id: &str, state: &TrackerState) -> Result<PatientReport> {
    let timepoints = &state.timepoints;
    let measurements = &state.measurements;

    let mut summaries = Vec::new();
    for timepoint in timepoints.all() {
        summaries.push(TimepointSummary {
            timepoint_id: timepoint.timepoint_id.clone(),
            title: timepoints.title(timepoint)?,
            visit_date: timepoint.visit_date.to_string(),
            is_locked: timepoint.is_locked,
        });
    }

    let mut lesions = Vec::new();
    for category in measurements
        .configuration()
        .categories
        .iter()
        .filter(|c| c.include_in_case_progress)
    {
        for fetched in measurements.fetch_all(&category.id)? {
            let Some(finding) = fetched.as_recorded() else {
                continue;
            };
            lesions.push(LesionSummary {
                category_id: category.id.clone(),
                label: lesion_label(category.name.as_deref(), finding.lesion_naming_number),
                finding_type: finding.finding_type.clone(),
                timepoint_id: finding.timepoint_id.clone(),
                lesion_naming_number: finding.lesion_naming_number,
                measurement_number: finding.measurement_number,
                location: finding.location.clone(),
                is_new: measurements.is_new_lesion_measurement(timepoints, finding),
            });
        }
    }
    lesions.sort_by(|a, b| {
        a.measurement_number
            .cmp(&b.measurement_number)
            .then_with(|| a.timepoint_id.cmp(&b.timepoint_id))
    });

    Ok(PatientReport {
        patient_id: patient_id.to_string(),
        current_timepoint_id: timepoints.current_timepoint_id().map(String::from),
        comparison_timepoint_id: timepoints
            .default_comparison()
            .map(|tp| tp.timepoint_id.clone()),
        initial_timepoint_ids: timepoints.initial_timepoint_ids(),
        timepoints: summaries,
        lesions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lesion_core::{ComparisonKey, Finding, MeasurementConfiguration, Timepoint, TimepointType};
    use lesion_registry::{MeasurementRegistry, TimepointRegistry};

    fn timepoint(id: &str, timepoint_type: TimepointType, day: u32) -> Timepoint {
        Timepoint::new(id, timepoint_type, NaiveDate::from_ymd_opt(2024, 5, day).unwrap(), "p1")
            .with_study(format!("study-{}", id))
    }

    fn finding(timepoint_id: &str) -> Finding {
        let mut finding = Finding::new("bidirectional");
        finding.study_instance_uid = Some(format!("study-{}", timepoint_id));
        finding
    }

    #[test]
    fn test_report_marks_new_lesions() {
        let mut timepoints = TimepointRegistry::new(Some("fu1".into()), ComparisonKey::Baseline);
        timepoints.merge_timepoints(vec![
            timepoint("bl", TimepointType::Baseline, 1),
            timepoint("fu1", TimepointType::Followup, 20),
        ]);
        let mut measurements = MeasurementRegistry::new(MeasurementConfiguration::default());
        for timepoint_id in ["bl", "fu1", "fu1"] {
            measurements
                .add_measurement(&timepoints, "bidirectional", finding(timepoint_id))
                .unwrap();
        }
        let state = TrackerState {
            timepoints,
            measurements,
        };

        let report = build_report("p1", &state).unwrap();
        assert_eq!(report.comparison_timepoint_id.as_deref(), Some("bl"));
        assert_eq!(report.timepoints[0].title, "Follow-up 1 (Current)");
        assert_eq!(report.lesions.len(), 3);

        let new_lesion = report.lesions.iter().find(|l| l.is_new).unwrap();
        assert_eq!(new_lesion.label.as_deref(), Some("Target 2"));
        assert_eq!(new_lesion.measurement_number, 2);
    }
}
