//! 目录变更观察者

use lesion_core::{CategorySnapshot, RegistryObserver, Timepoint};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// 目录变更事件
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    TimepointsUpdated { count: usize },
    MeasurementsUpdated { count: usize },
}

fn measurement_count(snapshot: &CategorySnapshot) -> usize {
    snapshot.values().map(Vec::len).sum()
}

/// 将目录变更写入日志
#[derive(Debug, Default)]
pub struct LoggingObserver;

impl RegistryObserver for LoggingObserver {
    fn on_timepoints_updated(&self, timepoints: &[Timepoint]) {
        info!(count = timepoints.len(), "Timepoints updated");
    }

    fn on_measurements_updated(&self, snapshot: &CategorySnapshot) {
        info!(count = measurement_count(snapshot), "Measurements updated");
    }
}

/// 通过广播通道分发目录变更事件
#[derive(Debug)]
pub struct BroadcastObserver {
    sender: broadcast::Sender<RegistryEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: RegistryEvent) {
        // 没有订阅者时发送失败，直接忽略
        if self.sender.send(event).is_err() {
            debug!("No registry event subscribers");
        }
    }
}

impl RegistryObserver for BroadcastObserver {
    fn on_timepoints_updated(&self, timepoints: &[Timepoint]) {
        self.publish(RegistryEvent::TimepointsUpdated {
            count: timepoints.len(),
        });
    }

    fn on_measurements_updated(&self, snapshot: &CategorySnapshot) {
        self.publish(RegistryEvent::MeasurementsUpdated {
            count: measurement_count(snapshot),
        });
    }
}
