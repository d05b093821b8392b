//! 病灶追踪演示程序
//!
//! 展示基线与随访时间点上的测量编号、跨时间点匹配、新病灶编号和删除后的编号回收

use chrono::NaiveDate;
use lesion_admin::init_logging;
use lesion_core::{
    ComparisonKey, Finding, FindingFilter, MeasurementConfiguration, Timepoint, TimepointFilter, TimepointType,
    TARGETS_CATEGORY_ID,
};
use lesion_integration::{InMemoryStore, InMemoryToolState, LoggingObserver, TrackerDocument};
use lesion_registry::{MeasurementRegistry, TimepointRegistry, TrackingSession};
use std::sync::Arc;

const PATIENT_ID: &str = "demo-patient";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("warn")?;

    println!("🚀 病灶追踪演示\n");

    // 1. 准备时间点
    let store = Arc::new(InMemoryStore::from_document(TrackerDocument {
        timepoints: sample_timepoints()?,
        ..Default::default()
    }));
    let bridge = Arc::new(InMemoryToolState::new());

    let timepoints = TimepointRegistry::new(Some("fu1".to_string()), ComparisonKey::Baseline);
    let measurements = MeasurementRegistry::new(MeasurementConfiguration::default())
        .with_tool_state_bridge(bridge.clone())
        .with_observer(Arc::new(LoggingObserver));
    let session = TrackingSession::new(timepoints, measurements)
        .with_timepoint_store(store.clone())
        .with_measurement_store(store.clone());

    let count = session
        .retrieve_timepoints(&TimepointFilter::for_patient(PATIENT_ID))
        .await?;
    println!("✅ 加载了 {} 个时间点", count);

    {
        let state = session.read().await;
        for timepoint in state.timepoints.all() {
            println!("   {} ({})", state.timepoints.title(timepoint)?, timepoint.visit_date);
        }
    }

    // 2. 基线测量
    println!("\n📋 基线测量");
    for (image, location) in [("bl-img-1", "Liver"), ("bl-img-2", "Lung"), ("bl-img-3", "Kidney")] {
        let mut finding = finding("bl", image);
        finding.location = Some(location.to_string());
        print_finding(session.add_measurement("bidirectional", finding).await?);
    }

    // 3. 随访测量：前三个与基线病灶匹配，第四个为新病灶
    println!("\n📋 随访测量");
    for image in ["fu-img-1", "fu-img-2", "fu-img-3", "fu-img-4"] {
        print_finding(session.add_measurement("bidirectional", finding("fu1", image)).await?);
    }
    print_finding(session.add_measurement("nonTarget", finding("fu1", "fu-img-5")).await?);

    // 4. 删除第二个病灶，后续编号前移
    println!("\n🗑️  删除病灶 2");
    let filter = FindingFilter {
        lesion_naming_number: Some(2),
        ..Default::default()
    };
    let removed = session
        .delete_measurements("bidirectional", TARGETS_CATEGORY_ID, &filter)
        .await?;
    println!("   删除了 {} 个测量", removed);

    {
        let state = session.read().await;
        for finding in state.measurements.findings("bidirectional") {
            println!(
                "   {} 病灶 {} / 测量编号 {}",
                finding.timepoint_id.as_deref().unwrap_or("-"),
                finding.lesion_naming_number,
                finding.measurement_number
            );
        }
    }

    // 5. 保存
    let result = session.store_measurements(None).await?;
    println!("\n💾 保存结果: {}", result.unwrap_or_default());
    println!("🖼️  工具状态条目: {}", bridge.entry_count());

    let document = store.snapshot().await;
    println!("\n📊 存储中的测量:");
    for (category_id, findings) in &document.measurements {
        println!("   {}: {}", category_id, findings.len());
    }

    println!("\n🎉 演示完成");
    Ok(())
}

fn sample_timepoints() -> anyhow::Result<Vec<Timepoint>> {
    let date = |year, month, day| {
        NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| anyhow::anyhow!("invalid date"))
    };

    Ok(vec![
        Timepoint::new("bl", TimepointType::Baseline, date(2024, 1, 10)?, PATIENT_ID).with_study("1.2.840.1"),
        Timepoint::new("fu1", TimepointType::Followup, date(2024, 3, 12)?, PATIENT_ID).with_study("1.2.840.2"),
    ])
}

fn finding(timepoint_id: &str, image_id: &str) -> Finding {
    let mut finding = Finding::new("bidirectional");
    finding.timepoint_id = Some(timepoint_id.to_string());
    finding.image_id = Some(image_id.to_string());
    finding
}

fn print_finding(finding: Option<Finding>) {
    match finding {
        Some(f) => println!(
            "   {} 病灶 {} / 测量编号 {} {}",
            f.timepoint_id.as_deref().unwrap_or("-"),
            f.lesion_naming_number,
            f.measurement_number,
            f.location.as_deref().unwrap_or("")
        ),
        None => println!("   测量未关联到时间点"),
    }
}
