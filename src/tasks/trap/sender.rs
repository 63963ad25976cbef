//! Aggregates decoded traps and forwards them to the event sink.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use super::event::TrapEvent;
use crate::context::Context;
use crate::event::EventSender;
use crate::tasks::send_event;

/// Merges traps with the same `hash_content` and emits them every period.
/// Without aggregation each trap is emitted as soon as it arrives.
#[derive(Debug)]
pub struct TrapSender {
    period: Duration,
    is_aggregate: bool,
    output: EventSender,
    events: Mutex<HashMap<String, TrapEvent>>,
}

impl TrapSender {
    pub fn new(period: Duration, is_aggregate: bool, output: EventSender) -> Self {
        Self {
            period,
            is_aggregate,
            output,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Record one trap, counting it against an earlier identical one.
    pub fn merge(&self, event: TrapEvent) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match events.get_mut(&event.hash_content) {
            Some(existing) => existing.count += event.count,
            None => {
                events.insert(event.hash_content.clone(), event);
            }
        }
    }

    fn drain(&self) -> Vec<TrapEvent> {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.drain().map(|(_, e)| e).collect()
    }

    /// Emit and clear everything recorded so far.
    pub async fn flush(&self) {
        let events = self.drain();
        if events.is_empty() {
            return;
        }
        tracing::debug!("flushing {} trap events", events.len());
        for event in events {
            send_event(&self.output, Box::new(event.into_custom_event())).await;
        }
    }

    /// Consume `input` until it closes or `ctx` is done, then flush once more.
    pub async fn run(&self, ctx: Context, mut input: mpsc::Receiver<TrapEvent>) {
        let period = if self.period.is_zero() { Duration::from_secs(1) } else { self.period };
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.done() => break,
                _ = interval.tick() => {
                    if self.is_aggregate {
                        self.flush().await;
                    }
                }
                event = input.recv() => {
                    match event {
                        Some(event) => {
                            self.merge(event);
                            if !self.is_aggregate {
                                self.flush().await;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        input.close();
        while let Ok(event) = input.try_recv() {
            self.merge(event);
        }
        self.flush().await;
        tracing::debug!("trap sender stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use std::collections::BTreeMap;

    fn trap(agent_port: u16) -> TrapEvent {
        let dimension = BTreeMap::from([
            ("display_name".to_string(), ".1.2.1234.0.55".to_string()),
            ("agent_port".to_string(), agent_port.to_string()),
        ]);
        TrapEvent::new(1, "", Vec::new(), BTreeMap::new(), dimension, 1_700_000_000)
    }

    #[tokio::test]
    async fn test_aggregate_identical_traps() {
        let (tx, mut rx) = mpsc::channel(16);
        let sender = TrapSender::new(Duration::from_secs(3600), true, tx);
        for port in 0..5 {
            sender.merge(trap(40000 + port));
        }
        sender.flush().await;

        let event = rx.try_recv().unwrap();
        let map = event.as_map_str();
        assert_eq!(map["data"][0]["event"]["count"], 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let (tx, mut rx) = mpsc::channel(16);
        let sender = TrapSender::new(Duration::from_secs(3600), true, tx);
        let (input_tx, input_rx) = mpsc::channel(16);
        let ctx = Context::background();

        for _ in 0..3 {
            input_tx.send(trap(161)).await.unwrap();
        }
        drop(input_tx);
        sender.run(ctx, input_rx).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.as_map_str()["data"][0]["event"]["count"], 3);
    }

    #[tokio::test]
    async fn test_no_aggregation_forwards_each() {
        let (tx, mut rx) = mpsc::channel(16);
        let sender = TrapSender::new(Duration::from_secs(3600), false, tx);
        let (input_tx, input_rx) = mpsc::channel(16);
        input_tx.send(trap(1)).await.unwrap();
        input_tx.send(trap(1)).await.unwrap();
        drop(input_tx);
        sender.run(Context::background(), input_rx).await;

        for _ in 0..2 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.as_map_str()["data"][0]["event"]["count"], 1);
        }
    }
}
