//! Background expiration poller.
//!
//! Wakes on a fixed interval and runs the claim/publish cycle. A tick that
//! fails is logged and swallowed so one bad poll never kills the loop; the
//! loop exits only on cancellation. Running several pollers against the same
//! store is safe because the claim itself is the arbiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::machine::SwitchService;

pub struct Poller {
    service: Arc<SwitchService>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Poller {
    pub fn new(
        service: Arc<SwitchService>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            service,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        tracing::debug!(
            interval_ms = self.interval.as_millis() as u64,
            "expiration poller running"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        tracing::debug!("expiration poller stopped");
    }

    async fn tick(&self) {
        match self.service.claim_and_publish(Utc::now()).await {
            Ok(Some(outcome)) => {
                tracing::info!(sent = outcome.is_sent(), "grace cycle completed by poller");
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "poller tick failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use vigil_protocol::BroadcastPayload;

    use super::*;
    use crate::config::VigilConfig;
    use crate::gateway::StubPublisher;
    use crate::store::MemoryStore;
    use crate::store::SwitchStore;

    fn service(
        store: Arc<MemoryStore>,
        publisher: Arc<StubPublisher>,
    ) -> Arc<SwitchService> {
        Arc::new(SwitchService::new(store, publisher, &VigilConfig::default()))
    }

    #[tokio::test]
    async fn fires_a_due_grace_cycle() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(StubPublisher::succeeding());
        let service = service(store.clone(), publisher.clone());
        service.bootstrap(now).unwrap();
        store
            .arm_grace(
                now - chrono::Duration::seconds(1),
                &BroadcastPayload {
                    text: "gone quiet".to_string(),
                    url: String::new(),
                },
                now,
            )
            .unwrap();

        let token = CancellationToken::new();
        let poller = Poller::new(service.clone(), Duration::from_millis(20), token.clone());
        let handle = tokio::spawn(poller.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !service.state(Utc::now()).unwrap().terminal {
            assert!(
                tokio::time::Instant::now() < deadline,
                "poller never claimed the due cycle"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.publish_count(), 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn survives_failing_ticks_until_cancelled() {
        // Never bootstrapped, so every tick errors out.
        let store = Arc::new(MemoryStore::new());
        let service = service(store, Arc::new(StubPublisher::succeeding()));

        let token = CancellationToken::new();
        let poller = Poller::new(service, Duration::from_millis(5), token.clone());
        let handle = tokio::spawn(poller.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
