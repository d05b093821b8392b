//! 跨时间点的同一病灶匹配

use super::MeasurementRegistry;
use lesion_core::Finding;

/// 匹配策略，按声明顺序依次尝试
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    /// 按稳定的患者位置锚点匹配
    PatientLocation,
    /// 按病灶命名编号匹配，仅用于没有位置锚点的测量
    LesionNamingNumber,
}

impl MatchStrategy {
    pub const ORDERED: [MatchStrategy; 2] = [MatchStrategy::PatientLocation, MatchStrategy::LesionNamingNumber];

    /// 策略是否适用于该测量
    pub fn applies_to(&self, finding: &Finding) -> bool {
        match self {
            MatchStrategy::PatientLocation => finding.patient_location_id().is_some(),
            MatchStrategy::LesionNamingNumber => {
                finding.patient_location_id().is_none() && finding.lesion_naming_number > 0
            }
        }
    }

    pub fn matches(&self, candidate: &Finding, finding: &Finding) -> bool {
        match self {
            MatchStrategy::PatientLocation => {
                candidate.patient_location_id().is_some()
                    && candidate.patient_location_id() == finding.patient_location_id()
            }
            MatchStrategy::LesionNamingNumber => candidate.lesion_naming_number == finding.lesion_naming_number,
        }
    }
}

impl MeasurementRegistry {
    /// 查找同一病灶在其他时间点上的测量
    pub fn previous_measurement(&self, finding: &Finding) -> Option<&Finding> {
        let timepoint_id = finding.timepoint_id.as_deref()?;
        let category = self.tool_configuration(&finding.finding_type)?;

        let candidates: Vec<&Finding> = category
            .child_finding_types
            .iter()
            .flat_map(|finding_type| self.findings(finding_type).iter())
            .filter(|f| f.id != finding.id && f.timepoint_id.as_deref() != Some(timepoint_id))
            .collect();

        MatchStrategy::ORDERED
            .iter()
            .filter(|strategy| strategy.applies_to(finding))
            .find_map(|strategy| {
                candidates
                    .iter()
                    .copied()
                    .find(|candidate| strategy.matches(candidate, finding))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchored(anchor: Option<&str>, lesion_naming_number: u32) -> Finding {
        let mut finding = Finding::new("bidirectional");
        finding.additional_data.patient_location_id = anchor.map(String::from);
        finding.lesion_naming_number = lesion_naming_number;
        finding
    }

    #[test]
    fn test_anchor_takes_precedence_over_position() {
        let finding = anchored(Some("liver-1"), 1);
        assert!(MatchStrategy::PatientLocation.applies_to(&finding));
        assert!(!MatchStrategy::LesionNamingNumber.applies_to(&finding));

        let same_position_other_anchor = anchored(Some("lung-2"), 1);
        assert!(!MatchStrategy::PatientLocation.matches(&same_position_other_anchor, &finding));
    }

    #[test]
    fn test_positional_match_without_anchor() {
        let finding = anchored(None, 2);
        assert!(!MatchStrategy::PatientLocation.applies_to(&finding));
        assert!(MatchStrategy::LesionNamingNumber.applies_to(&finding));
        assert!(MatchStrategy::LesionNamingNumber.matches(&anchored(None, 2), &finding));
        assert!(!MatchStrategy::LesionNamingNumber.matches(&anchored(None, 3), &finding));
    }
}
