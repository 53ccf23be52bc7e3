use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use huddle_core::Message;

/// A frame crossing this node's wire boundary, in either direction.
#[derive(Debug, Clone)]
pub enum NetEvent {
    Sent(Message),
    Received(Message),
}

/// One observation capability. Recorders are independent of each other and
/// of the mesh; the transport consumes no return value from them.
pub trait Recorder: Send + Sync {
    fn record(&self, event: &NetEvent);
}

/// Recorder composition by containment: the transport holds one `Telemetry`
/// and fans every event out to whatever recorders were attached.
#[derive(Clone, Default)]
pub struct Telemetry {
    recorders: Vec<Arc<dyn Recorder>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorders.push(recorder);
        self
    }

    pub fn record(&self, event: &NetEvent) {
        for recorder in &self.recorders {
            recorder.record(event);
        }
    }
}

/// Collects per-message transmission latency from envelope timestamps.
/// Clock skew between peers shows up here unfiltered.
#[derive(Default)]
pub struct TransmissionTimes {
    samples: Mutex<Vec<u64>>,
}

impl TransmissionTimes {
    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn mean_ms(&self) -> Option<f64> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<u64>() as f64 / samples.len() as f64)
    }
}

impl Recorder for TransmissionTimes {
    fn record(&self, event: &NetEvent) {
        if let NetEvent::Received(message) = event {
            if let Some(latency) = message.latency_ms() {
                self.samples.lock().push(latency);
            }
        }
    }
}

/// Tracks distinct message ids seen in each direction; the gap between the
/// two counts approximates delivery loss.
#[derive(Default)]
pub struct DeliveryLedger {
    sent: Mutex<HashSet<Uuid>>,
    received: Mutex<HashSet<Uuid>>,
}

impl DeliveryLedger {
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn loss_rate(&self) -> f64 {
        let sent = self.sent_count();
        if sent == 0 {
            return 0.0;
        }
        let dropped = sent.saturating_sub(self.received_count());
        dropped as f64 / sent as f64
    }
}

impl Recorder for DeliveryLedger {
    fn record(&self, event: &NetEvent) {
        match event {
            NetEvent::Sent(message) => {
                self.sent.lock().insert(message.msg_id);
            }
            NetEvent::Received(message) => {
                self.received.lock().insert(message.msg_id);
            }
        }
    }
}

/// Counts deliveries that blew a latency bound.
pub struct DeadlineMonitor {
    bound_ms: u64,
    violations: Mutex<u64>,
}

impl DeadlineMonitor {
    pub const DEFAULT_BOUND_MS: u64 = 100;

    pub fn new(bound_ms: u64) -> Self {
        Self {
            bound_ms,
            violations: Mutex::new(0),
        }
    }

    pub fn violations(&self) -> u64 {
        *self.violations.lock()
    }
}

impl Default for DeadlineMonitor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BOUND_MS)
    }
}

impl Recorder for DeadlineMonitor {
    fn record(&self, event: &NetEvent) {
        if let NetEvent::Received(message) = event {
            if message.latency_ms().is_some_and(|latency| latency > self.bound_ms) {
                *self.violations.lock() += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{Message, PeerId};
    use serde_json::Map;

    fn delivered_with_latency(latency_ms: u64) -> Message {
        let mut message = Message::new(PeerId::generate(), "state", Map::new());
        message.sent_at_ms = Some(1_000);
        message.received_at_ms = Some(1_000 + latency_ms);
        message
    }

    #[test]
    fn test_transmission_times_mean() {
        let times = TransmissionTimes::default();
        times.record(&NetEvent::Received(delivered_with_latency(10)));
        times.record(&NetEvent::Received(delivered_with_latency(30)));
        assert_eq!(times.count(), 2);
        assert_eq!(times.mean_ms(), Some(20.0));
    }

    #[test]
    fn test_unstamped_messages_produce_no_sample() {
        let times = TransmissionTimes::default();
        let message = Message::new(PeerId::generate(), "state", Map::new());
        times.record(&NetEvent::Received(message));
        assert_eq!(times.count(), 0);
        assert_eq!(times.mean_ms(), None);
    }

    #[test]
    fn test_delivery_ledger_loss_rate() {
        let ledger = DeliveryLedger::default();
        let delivered = delivered_with_latency(5);
        let lost = delivered_with_latency(5);
        ledger.record(&NetEvent::Sent(delivered.clone()));
        ledger.record(&NetEvent::Sent(lost));
        ledger.record(&NetEvent::Received(delivered));
        assert_eq!(ledger.sent_count(), 2);
        assert_eq!(ledger.received_count(), 1);
        assert_eq!(ledger.loss_rate(), 0.5);
    }

    #[test]
    fn test_loss_rate_with_nothing_sent() {
        assert_eq!(DeliveryLedger::default().loss_rate(), 0.0);
    }

    #[test]
    fn test_deadline_monitor_counts_only_violations() {
        let monitor = DeadlineMonitor::new(50);
        monitor.record(&NetEvent::Received(delivered_with_latency(49)));
        monitor.record(&NetEvent::Received(delivered_with_latency(50)));
        monitor.record(&NetEvent::Received(delivered_with_latency(51)));
        monitor.record(&NetEvent::Received(delivered_with_latency(500)));
        assert_eq!(monitor.violations(), 2);
    }

    #[test]
    fn test_telemetry_fans_out_to_all_recorders() {
        let times = Arc::new(TransmissionTimes::default());
        let ledger = Arc::new(DeliveryLedger::default());
        let telemetry = Telemetry::new()
            .with(times.clone() as Arc<dyn Recorder>)
            .with(ledger.clone() as Arc<dyn Recorder>);

        telemetry.record(&NetEvent::Received(delivered_with_latency(7)));
        assert_eq!(times.count(), 1);
        assert_eq!(ledger.received_count(), 1);
    }
}
