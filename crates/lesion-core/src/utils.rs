//! 通用工具函数

use uuid::Uuid;

/// 生成唯一的测量标识
pub fn generate_finding_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// 生成病灶显示标签，例如 "Target 2"
pub fn lesion_label(category_name: Option<&str>, lesion_naming_number: u32) -> Option<String> {
    if lesion_naming_number == 0 {
        return None;
    }

    Some(match category_name {
        Some(name) if !name.is_empty() => format!("{} {}", name, lesion_naming_number),
        _ => format!("Lesion {}", lesion_naming_number),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_finding_id() {
        let a = generate_finding_id();
        let b = generate_finding_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_lesion_label() {
        assert_eq!(lesion_label(Some("Target"), 2).as_deref(), Some("Target 2"));
        assert_eq!(lesion_label(None, 1).as_deref(), Some("Lesion 1"));
        assert_eq!(lesion_label(Some("Target"), 0), None);
    }
}
