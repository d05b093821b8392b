//! 病灶追踪命令行程序
//!
//! 从JSON数据文件加载患者的时间点与测量，按当前时间点计算编号并输出报告。

mod report;

use anyhow::{Context, Result};
use clap::Parser;
use lesion_admin::{init_logging, ConfigManager};
use lesion_core::{ComparisonKey, TimepointFilter};
use lesion_integration::{InMemoryToolState, JsonFileStore, LoggingObserver};
use lesion_registry::{MeasurementRegistry, TimepointRegistry, TrackingSession};
use std::sync::Arc;
use tracing::{info, warn};

/// 病灶追踪命令行参数
#[derive(Parser, Debug)]
#[command(name = "lesion-server")]
#[command(about = "纵向病灶测量追踪")]
struct Args {
    /// 患者ID
    #[arg(short, long)]
    patient: String,

    /// 当前时间点ID，默认为最近的时间点
    #[arg(short = 't', long)]
    current_timepoint: Option<String>,

    /// 比较时间点 (baseline, nadir, prior)
    #[arg(long)]
    comparison: Option<ComparisonKey>,

    /// JSON数据文件路径，覆盖配置文件
    #[arg(short, long)]
    data: Option<String>,

    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 将重新编号后的测量写回数据文件
    #[arg(long)]
    write_back: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ConfigManager::new(args.config.as_deref())?.get_config().await;
    init_logging(args.log_level.as_deref().unwrap_or(&config.logging.level))?;

    let data_path = args.data.clone().unwrap_or_else(|| config.data.path.clone());
    let comparison_key = args.comparison.unwrap_or(config.timepoints.comparison_key);
    info!("Starting lesion tracker for patient {}", args.patient);
    info!("  Data file: {}", data_path);
    info!("  Comparison: {}", comparison_key);

    let store = Arc::new(
        JsonFileStore::open(&data_path)
            .await
            .with_context(|| format!("Failed to open data file {}", data_path))?,
    );
    let observer = Arc::new(LoggingObserver);

    let timepoints = TimepointRegistry::new(args.current_timepoint.clone(), comparison_key).with_observer(observer.clone());
    let measurements = MeasurementRegistry::new(config.measurement_configuration())
        .with_tool_state_bridge(Arc::new(InMemoryToolState::new()))
        .with_observer(observer);
    let session = TrackingSession::new(timepoints, measurements)
        .with_timepoint_store(store.clone())
        .with_measurement_store(store);

    let count = session
        .retrieve_timepoints(&TimepointFilter::for_patient(args.patient.clone()))
        .await?;
    if count == 0 {
        warn!("No timepoints found for patient {}", args.patient);
    }

    if args.current_timepoint.is_none() {
        let latest = session
            .read()
            .await
            .timepoints
            .all()
            .first()
            .map(|tp| tp.timepoint_id.clone());
        session.set_current_timepoint(latest).await;
    }

    let timepoint_ids: Vec<String> = session
        .read()
        .await
        .timepoints
        .timepoints()
        .iter()
        .map(|tp| tp.timepoint_id.clone())
        .collect();
    session.retrieve_measurements(&args.patient, &timepoint_ids).await?;

    if args.write_back {
        session.store_measurements(None).await?;
    }

    let report = {
        let state = session.read().await;
        report::build_report(&args.patient, &state)?
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
