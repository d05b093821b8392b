//! 配置管理
//!
//! 从TOML文件加载配置，`LESION_` 前缀的环境变量可以覆盖单个字段，
//! 例如 `LESION_DATA__PATH`、`LESION_LOGGING__LEVEL`、`LESION_TIMEPOINTS__COMPARISON_KEY`。

use ::config::{Config, Environment, File};
use anyhow::{Context, Result};
use lesion_core::{CategoryConfig, ComparisonKey, MeasurementConfiguration};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// 追踪系统完整配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    /// 时间点配置
    #[serde(default)]
    pub timepoints: TimepointSettings,
    /// 数据文件配置
    #[serde(default)]
    pub data: DataConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 病灶分类
    #[serde(default = "default_categories")]
    pub categories: Vec<CategorySettings>,
}

/// 病灶分类配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorySettings {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub child_finding_types: Vec<String>,
    #[serde(default)]
    pub include_in_case_progress: bool,
}

impl From<&CategorySettings> for CategoryConfig {
    fn from(settings: &CategorySettings) -> Self {
        CategoryConfig {
            id: settings.id.clone(),
            name: settings.name.clone(),
            child_finding_types: settings.child_finding_types.clone(),
            include_in_case_progress: settings.include_in_case_progress,
        }
    }
}

impl From<CategoryConfig> for CategorySettings {
    fn from(category: CategoryConfig) -> Self {
        Self {
            id: category.id,
            name: category.name,
            child_finding_types: category.child_finding_types,
            include_in_case_progress: category.include_in_case_progress,
        }
    }
}

/// 时间点配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimepointSettings {
    /// 默认比较时间点
    #[serde(default)]
    pub comparison_key: ComparisonKey,
}

/// 数据文件配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataConfig {
    /// JSON数据文件路径
    pub path: String,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// 日志级别或过滤指令
    pub level: String,
}

fn default_categories() -> Vec<CategorySettings> {
    MeasurementConfiguration::default()
        .categories
        .into_iter()
        .map(CategorySettings::from)
        .collect()
}

impl TrackerConfig {
    /// 测量注册表使用的分类配置
    pub fn measurement_configuration(&self) -> MeasurementConfiguration {
        MeasurementConfiguration {
            categories: self.categories.iter().map(CategoryConfig::from).collect(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timepoints: TimepointSettings::default(),
            data: DataConfig::default(),
            logging: LoggingConfig::default(),
            categories: default_categories(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: "./data/tracker.json".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: Arc<RwLock<TrackerConfig>>,
    /// 配置文件路径，未指定时只使用默认值与环境变量
    config_path: Option<String>,
    validator: ConfigValidator,
}

impl ConfigManager {
    /// 加载并验证配置
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.map(String::from),
            validator,
        })
    }

    fn load_config(config_path: Option<&str>) -> Result<TrackerConfig> {
        let mut builder = Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("LESION")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: TrackerConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("Configuration loaded successfully from: {}", path),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    pub async fn get_config(&self) -> TrackerConfig {
        self.config.read().await.clone()
    }

    /// 验证并替换配置，指定了配置文件时写回文件
    pub async fn update_config(&self, new_config: TrackerConfig) -> Result<()> {
        self.validator.validate(&new_config)?;

        {
            let mut config = self.config.write().await;
            *config = new_config;
        }

        self.save_config().await?;
        info!("Configuration updated successfully");
        Ok(())
    }

    async fn save_config(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            debug!("No configuration file, skipping save");
            return Ok(());
        };

        let config = self.config.read().await;
        let config_str = toml::to_string_pretty(&*config).context("Failed to serialize configuration")?;
        tokio::fs::write(path, config_str)
            .await
            .context("Failed to write configuration file")?;

        info!("Configuration saved to: {}", path);
        Ok(())
    }

    /// 重新加载配置
    pub async fn reload_config(&self) -> Result<()> {
        let new_config = Self::load_config(self.config_path.as_deref())?;
        self.update_config(new_config).await
    }

    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&TrackerConfig) -> Result<()>,
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "categories",
                validator: |config| {
                    config
                        .measurement_configuration()
                        .validate()
                        .map_err(|e| anyhow::anyhow!("{}", e))
                },
            },
            ValidationRule {
                field_path: "data.path",
                validator: |config| {
                    if config.data.path.trim().is_empty() {
                        Err(anyhow::anyhow!("Data path cannot be empty"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "logging.level",
                validator: |config| {
                    // 允许 "info,lesion_registry=debug" 这样的过滤指令，只检查默认级别
                    let default_level = config.logging.level.split(',').next().unwrap_or_default();
                    if default_level.contains('=') || LOG_LEVELS.contains(&default_level.trim()) {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("Unknown log level: {}", config.logging.level))
                    }
                },
            },
        ];

        Self { validation_rules }
    }

    pub fn validate(&self, config: &TrackerConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("Invalid configuration field {}", rule.field_path)));
            }
        }

        debug!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
