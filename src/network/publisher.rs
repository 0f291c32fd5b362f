//! Live Update Publisher
//!
//! Turns ledger change events and round transitions into per-user balance
//! streams. Every data event is a balance snapshot; round transitions only
//! trigger a fresh snapshot for each subscriber.
//!
//! ```text
//!  BalanceLedger ──broadcast──┐
//!                             ├──► publisher task ──► user A: [sub 1] [sub 2]
//!  RoundEngine ───broadcast───┘         │          ──► user B: [sub 3]
//!                                   heartbeat
//! ```
//!
//! A subscriber only ever sees its own user's balance. Each subscriber
//! remembers the last version it was sent, so a snapshot older than one
//! already delivered is dropped; a repeat of the same version is sent on a
//! round transition. A full subscriber channel never blocks the publisher: the
//! subscriber is marked dirty and gets the latest balance on the next beat.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::amount::to_float;
use crate::ledger::balance::{Balance, UserId};
use crate::ledger::book::BalanceLedger;
use crate::ledger::entry::BalanceChange;
use crate::round::engine::RoundEvent;
use crate::round::state::{RoundId, RoundState};

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Idle time after which a heartbeat is sent.
    pub heartbeat_interval: Duration,
    /// Buffered events per subscriber.
    pub channel_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            channel_capacity: 32,
        }
    }
}

impl PublisherConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: std::env::var("HEARTBEAT_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.heartbeat_interval),
            ..defaults
        }
    }
}

/// Balance push payload: `{type:"balance", ton, stars, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// TON balance.
    pub ton: f64,
    /// Stars balance.
    pub stars: f64,
    /// Unix milliseconds at publication.
    pub timestamp: i64,
    /// Ledger version of this snapshot.
    pub version: u64,
}

impl BalanceSnapshot {
    /// Snapshot of `balance` stamped now.
    pub fn of(balance: &Balance) -> Self {
        Self {
            ton: to_float(balance.ton),
            stars: to_float(balance.stars),
            timestamp: Utc::now().timestamp_millis(),
            version: balance.version,
        }
    }
}

/// One item on a user's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The user's balance, after a change or a round transition.
    Balance(BalanceSnapshot),
    /// Keep-alive on an idle stream.
    Heartbeat,
}

impl StreamEvent {
    /// Server-sent-events frame. Heartbeats are comment frames.
    pub fn to_sse_frame(&self) -> String {
        match self {
            StreamEvent::Heartbeat => ": heartbeat\n\n".to_string(),
            event => match serde_json::to_string(event) {
                Ok(json) => format!("data: {}\n\n", json),
                Err(_) => ": heartbeat\n\n".to_string(),
            },
        }
    }
}

/// Receiving end of a user stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    /// Subscriber id, unique per publisher.
    pub id: u64,
    /// Subscribed user.
    pub user_id: UserId,
    /// Event stream.
    pub events: mpsc::Receiver<StreamEvent>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<StreamEvent>,
    last_version: Option<u64>,
    last_sent: Instant,
    dirty: bool,
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

impl Subscriber {
    fn push(&mut self, event: StreamEvent) -> Delivery {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.last_sent = Instant::now();
                Delivery::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Push a balance unless a newer version already went out. An equal
    /// version is skipped unless `repeat` is set.
    fn push_balance(&mut self, balance: &Balance, repeat: bool) -> Delivery {
        let seen = self
            .last_version
            .is_some_and(|v| balance.version < v || (balance.version == v && !repeat));
        if seen {
            self.dirty = false;
            return Delivery::Sent;
        }
        match self.push(StreamEvent::Balance(BalanceSnapshot::of(balance))) {
            Delivery::Sent => {
                self.last_version = Some(balance.version);
                self.dirty = false;
                Delivery::Sent
            }
            Delivery::Full => {
                self.dirty = true;
                Delivery::Full
            }
            Delivery::Closed => Delivery::Closed,
        }
    }
}

/// Per-user fan-out of balance snapshots.
pub struct LiveUpdatePublisher {
    config: PublisherConfig,
    ledger: Arc<BalanceLedger>,
    subscribers: Mutex<BTreeMap<UserId, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl LiveUpdatePublisher {
    /// Create a publisher reading balances from `ledger`.
    pub fn new(config: PublisherConfig, ledger: Arc<BalanceLedger>) -> Self {
        Self {
            config,
            ledger,
            subscribers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Open a stream for `user_id`. The current balance is queued first.
    pub async fn subscribe(&self, user_id: UserId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscriber = Subscriber {
            id,
            tx,
            last_version: None,
            last_sent: Instant::now(),
            dirty: false,
        };

        // Register under the map lock so no change can slip between the
        // initial read and the first fan-out
        let mut subscribers = self.subscribers.lock().await;
        let balance = self.ledger.read(&user_id).await;
        subscriber.push_balance(&balance, false);
        subscribers.entry(user_id.clone()).or_default().push(subscriber);

        debug!(user = %user_id, subscriber = id, "Stream subscribed");
        Subscription { id, user_id, events: rx }
    }

    /// Remove one subscriber.
    pub async fn unsubscribe(&self, user_id: &UserId, id: u64) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(list) = subscribers.get_mut(user_id) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                subscribers.remove(user_id);
            }
        }
    }

    /// Live subscribers for `user_id`.
    pub async fn subscriber_count(&self, user_id: &UserId) -> usize {
        let subscribers = self.subscribers.lock().await;
        subscribers.get(user_id).map(|l| l.iter().filter(|s| !s.tx.is_closed()).count()).unwrap_or(0)
    }

    /// Deliver one balance to its owner's subscribers.
    pub async fn publish_balance(&self, balance: &Balance) {
        let mut subscribers = self.subscribers.lock().await;
        let Some(list) = subscribers.get_mut(&balance.user_id) else {
            return;
        };
        list.retain_mut(|s| !matches!(s.push_balance(balance, false), Delivery::Closed));
        if list.is_empty() {
            subscribers.remove(&balance.user_id);
        }
    }

    /// Push every subscriber a fresh snapshot of its own balance after a
    /// round transition. A full channel resyncs on the next beat.
    pub async fn publish_round(&self, round_id: RoundId, state: RoundState) {
        let mut subscribers = self.subscribers.lock().await;
        debug!(round = %round_id, ?state, users = subscribers.len(), "Round transition snapshot");
        for (user_id, list) in subscribers.iter_mut() {
            let balance = self.ledger.read(user_id).await;
            list.retain_mut(|s| !matches!(s.push_balance(&balance, true), Delivery::Closed));
        }
        subscribers.retain(|_, list| !list.is_empty());
    }

    /// Resend latest balances to dirty subscribers and heartbeat idle ones.
    pub async fn heartbeat(&self) {
        let mut subscribers = self.subscribers.lock().await;
        let now = Instant::now();
        let idle_after = self.config.heartbeat_interval;

        for (user_id, list) in subscribers.iter_mut() {
            if list.iter().any(|s| s.dirty) {
                let balance = self.ledger.read(user_id).await;
                list.retain_mut(|s| !s.dirty || !matches!(s.push_balance(&balance, false), Delivery::Closed));
            }
            list.retain_mut(|s| {
                if now.saturating_duration_since(s.last_sent) < idle_after {
                    return !s.tx.is_closed();
                }
                !matches!(s.push(StreamEvent::Heartbeat), Delivery::Closed)
            });
        }
        subscribers.retain(|_, list| !list.is_empty());
    }

    fn mark_all_dirty(subscribers: &mut BTreeMap<UserId, Vec<Subscriber>>) {
        for subscriber in subscribers.values_mut().flatten() {
            subscriber.dirty = true;
        }
    }

    /// Fan-out loop. Runs until `shutdown` fires or the ledger is dropped.
    pub async fn run(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<BalanceChange>,
        mut rounds: broadcast::Receiver<RoundEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        // Beat at half the idle interval so no stream stays silent much longer than it
        let mut beat = interval((self.config.heartbeat_interval / 2).max(Duration::from_millis(1)));
        beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut rounds_open = true;

        info!(
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            "Live update publisher started"
        );

        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => self.publish_balance(&change.balance).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Publisher lagged behind ledger; resyncing on next beat");
                        Self::mark_all_dirty(&mut *self.subscribers.lock().await);
                    }
                    Err(RecvError::Closed) => break,
                },
                event = rounds.recv(), if rounds_open => match event {
                    Ok(RoundEvent::Committed(c)) => self.publish_round(c.round_id, RoundState::Betting).await,
                    Ok(RoundEvent::Running { round_id, .. }) => self.publish_round(round_id, RoundState::Running).await,
                    Ok(RoundEvent::Crashed { round_id, .. }) => self.publish_round(round_id, RoundState::Crashed).await,
                    Ok(RoundEvent::Settled { round_id, .. }) => self.publish_round(round_id, RoundState::Settled).await,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    // Engine gone; balances still flow
                    Err(RecvError::Closed) => rounds_open = false,
                },
                _ = beat.tick() => self.heartbeat().await,
                _ = shutdown.recv() => break,
            }
        }

        info!("Live update publisher stopped");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amount::AMOUNT_ONE;
    use crate::fair::clock::MultiplierClock;
    use crate::ledger::balance::Currency;
    use crate::ledger::entry::EntryReason;

    fn setup(config: PublisherConfig) -> (Arc<BalanceLedger>, Arc<LiveUpdatePublisher>) {
        let ledger = Arc::new(BalanceLedger::new());
        let publisher = Arc::new(LiveUpdatePublisher::new(config, ledger.clone()));
        (ledger, publisher)
    }

    fn balance_version(event: StreamEvent) -> u64 {
        match event {
            StreamEvent::Balance(snapshot) => snapshot.version,
            other => panic!("expected balance, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribe_sends_current_balance() {
        let (ledger, publisher) = setup(PublisherConfig::default());
        let alice = UserId::new("alice");
        ledger.deposit(&alice, AMOUNT_ONE, Currency::Ton, "d").await.unwrap();

        let mut sub = publisher.subscribe(alice).await;
        match sub.events.try_recv().unwrap() {
            StreamEvent::Balance(snapshot) => {
                assert_eq!(snapshot.ton, 1.0);
                assert_eq!(snapshot.version, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_only_own_balance_delivered() {
        let (ledger, publisher) = setup(PublisherConfig::default());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let mut sub = publisher.subscribe(alice.clone()).await;
        sub.events.try_recv().unwrap();

        let receipt = ledger.deposit(&bob, AMOUNT_ONE, Currency::Ton, "b").await.unwrap();
        publisher.publish_balance(&receipt.balance).await;
        assert!(sub.events.try_recv().is_err());

        let receipt = ledger.deposit(&alice, AMOUNT_ONE, Currency::Stars, "a").await.unwrap();
        publisher.publish_balance(&receipt.balance).await;
        assert_eq!(balance_version(sub.events.try_recv().unwrap()), 1);
    }

    #[tokio::test]
    async fn test_stale_versions_dropped() {
        let (ledger, publisher) = setup(PublisherConfig::default());
        let carol = UserId::new("carol");
        let first = ledger.deposit(&carol, 5, Currency::Ton, "1").await.unwrap();
        let second = ledger.deposit(&carol, 5, Currency::Ton, "2").await.unwrap();

        let mut sub = publisher.subscribe(carol).await;
        assert_eq!(balance_version(sub.events.try_recv().unwrap()), 2);

        publisher.publish_balance(&first.balance).await;
        publisher.publish_balance(&second.balance).await;
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_resyncs_on_heartbeat() {
        let config = PublisherConfig { channel_capacity: 1, ..Default::default() };
        let (ledger, publisher) = setup(config);
        let dave = UserId::new("dave");

        let mut sub = publisher.subscribe(dave.clone()).await;
        for i in 0..3 {
            let receipt = ledger.deposit(&dave, 1, Currency::Ton, format!("d{}", i)).await.unwrap();
            publisher.publish_balance(&receipt.balance).await;
        }

        // Initial snapshot occupies the only slot
        assert_eq!(balance_version(sub.events.try_recv().unwrap()), 0);
        assert!(sub.events.try_recv().is_err());

        publisher.heartbeat().await;
        assert_eq!(balance_version(sub.events.try_recv().unwrap()), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_gets_heartbeat() {
        let config = PublisherConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let (_ledger, publisher) = setup(config);
        let mut sub = publisher.subscribe(UserId::new("erin")).await;
        sub.events.try_recv().unwrap();

        publisher.heartbeat().await;
        assert!(sub.events.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        publisher.heartbeat().await;
        assert_eq!(sub.events.try_recv().unwrap(), StreamEvent::Heartbeat);
    }

    #[tokio::test]
    async fn test_dropped_subscription_removed() {
        let (ledger, publisher) = setup(PublisherConfig::default());
        let frank = UserId::new("frank");
        let sub = publisher.subscribe(frank.clone()).await;
        assert_eq!(publisher.subscriber_count(&frank).await, 1);

        drop(sub);
        let receipt = ledger.deposit(&frank, 1, Currency::Ton, "x").await.unwrap();
        publisher.publish_balance(&receipt.balance).await;
        assert_eq!(publisher.subscriber_count(&frank).await, 0);
    }

    #[tokio::test]
    async fn test_run_forwards_ledger_changes_in_order() {
        let (ledger, publisher) = setup(PublisherConfig::default());
        let (_round_tx, round_rx) = broadcast::channel::<RoundEvent>(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let gina = UserId::new("gina");

        let mut sub = publisher.subscribe(gina.clone()).await;
        assert_eq!(balance_version(sub.events.recv().await.unwrap()), 0);

        let task = tokio::spawn(publisher.clone().run(ledger.subscribe(), round_rx, shutdown_rx));

        ledger.deposit(&gina, AMOUNT_ONE, Currency::Ton, "d").await.unwrap();
        ledger.debit(&gina, AMOUNT_ONE / 10, Currency::Ton, EntryReason::Stake, None).await.unwrap();

        assert_eq!(balance_version(sub.events.recv().await.unwrap()), 1);
        match sub.events.recv().await.unwrap() {
            StreamEvent::Balance(snapshot) => {
                assert_eq!(snapshot.version, 2);
                assert_eq!(snapshot.ton, 0.9);
            }
            other => panic!("unexpected {:?}", other),
        }

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_round_transition_pushes_own_balance() {
        let (ledger, publisher) = setup(PublisherConfig::default());
        let hugo = UserId::new("hugo");
        let ines = UserId::new("ines");
        ledger.deposit(&hugo, AMOUNT_ONE, Currency::Ton, "h").await.unwrap();
        ledger.deposit(&ines, 3 * AMOUNT_ONE, Currency::Stars, "i").await.unwrap();

        let mut hugo_sub = publisher.subscribe(hugo).await;
        let mut ines_sub = publisher.subscribe(ines).await;
        hugo_sub.events.try_recv().unwrap();
        ines_sub.events.try_recv().unwrap();

        publisher.publish_round(RoundId::nil(), RoundState::Running).await;

        let frame = hugo_sub.events.try_recv().unwrap().to_sse_frame();
        assert!(frame.contains("\"type\":\"balance\""), "{}", frame);
        assert!(frame.contains("\"ton\":1.0"));
        match ines_sub.events.try_recv().unwrap() {
            StreamEvent::Balance(snapshot) => {
                assert_eq!(snapshot.stars, 3.0);
                assert_eq!(snapshot.ton, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_sends_only_balance_events_across_rounds() {
        let (ledger, publisher) = setup(PublisherConfig::default());
        let (round_tx, round_rx) = broadcast::channel::<RoundEvent>(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let jane = UserId::new("jane");
        ledger.deposit(&jane, AMOUNT_ONE, Currency::Ton, "j").await.unwrap();

        let mut sub = publisher.subscribe(jane).await;
        sub.events.recv().await.unwrap();
        let task = tokio::spawn(publisher.clone().run(ledger.subscribe(), round_rx, shutdown_rx));

        round_tx.send(RoundEvent::Running {
            round_id: RoundId::nil(),
            started_at: Utc::now(),
            clock: MultiplierClock::default(),
        }).unwrap();
        let frame = sub.events.recv().await.unwrap().to_sse_frame();
        assert!(frame.starts_with("data: {\"type\":\"balance\""), "{}", frame);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_sse_frames() {
        let event = StreamEvent::Balance(BalanceSnapshot { ton: 1.08, stars: 0.0, timestamp: 1, version: 4 });
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"type\":\"balance\""));
        assert!(frame.contains("\"ton\":1.08"));
        assert_eq!(StreamEvent::Heartbeat.to_sse_frame(), ": heartbeat\n\n");
    }
}
