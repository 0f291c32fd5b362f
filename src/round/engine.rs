//! Round Engine
//!
//! The single coordinating task that owns the live [`Round`].
//!
//! Request handlers never touch the round. They hold a [`RoundHandle`] and
//! enqueue intents, each stamped with the server receive time; the engine
//! applies them in order between timer-driven transitions:
//!
//! ```text
//!  commit/rotate ─► betting window ─► crash_point ─► running clock ─► crash
//!        ▲             (intents)                      (intents, ticks)   │
//!        │                                                               ▼
//!   intermission ◄──── reveal ◄──── mark_settled ◄──── credit payouts ◄──┘
//! ```
//!
//! No intent can move a deadline. Timers use absolute instants, so the time
//! spent handling intents never stretches a window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::core::amount::{Amount, Multiplier};
use crate::fair::clock::MultiplierClock;
use crate::fair::crash::CrashConfig;
use crate::fair::seed::{AuditRecord, SeedError, SeedManager};
use crate::ledger::balance::{Balance, Currency, UserId};
use crate::ledger::book::{BalanceLedger, LedgerError};
use crate::ledger::entry::EntryReason;
use crate::round::state::{Bet, Payout, Round, RoundCommitment, RoundError, RoundId, RoundSnapshot};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Length of the betting window.
    pub betting_window: Duration,
    /// Pause between a settled round and the next commit.
    pub intermission: Duration,
    /// Interval of `Tick` events while running.
    pub tick_interval: Duration,
    /// Crash point mapping.
    pub crash: CrashConfig,
    /// Elapsed time to multiplier mapping.
    pub clock: MultiplierClock,
    /// Attempts per payout credit before the engine halts.
    pub settlement_retries: u32,
    /// Delay between payout attempts.
    pub settlement_retry_delay: Duration,
    /// Capacity of the intent queue.
    pub intent_capacity: usize,
    /// Capacity of the round event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            betting_window: Duration::from_secs(5),
            intermission: Duration::from_secs(3),
            tick_interval: Duration::from_millis(100),
            crash: CrashConfig::default(),
            clock: MultiplierClock::default(),
            settlement_retries: 3,
            settlement_retry_delay: Duration::from_millis(200),
            intent_capacity: 1024,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            betting_window: env_millis("BETTING_WINDOW_MS").unwrap_or(defaults.betting_window),
            intermission: env_millis("INTERMISSION_MS").unwrap_or(defaults.intermission),
            tick_interval: env_millis("TICK_INTERVAL_MS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.tick_interval),
            crash: CrashConfig::from_env(),
            settlement_retries: std::env::var("SETTLEMENT_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.settlement_retries),
            ..defaults
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Round lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RoundEvent {
    /// Seed committed, betting open.
    Committed(RoundCommitment),
    /// A bet was accepted.
    BetPlaced {
        /// Round.
        round_id: RoundId,
        /// Bettor.
        user_id: UserId,
        /// Stake.
        stake: Amount,
        /// Currency.
        currency: Currency,
    },
    /// Betting closed, multiplier started.
    Running {
        /// Round.
        round_id: RoundId,
        /// Wall-clock start.
        started_at: DateTime<Utc>,
        /// Clock parameters.
        clock: MultiplierClock,
    },
    /// Periodic multiplier update.
    Tick {
        /// Round.
        round_id: RoundId,
        /// Server elapsed time.
        elapsed_ms: u64,
        /// Displayed multiplier.
        multiplier: Multiplier,
    },
    /// A bet was cashed out.
    CashedOut {
        /// Round.
        round_id: RoundId,
        /// Bettor.
        user_id: UserId,
        /// Locked multiplier.
        multiplier: Multiplier,
        /// Amount to be credited at settlement.
        payout: Amount,
    },
    /// Crash point reached.
    Crashed {
        /// Round.
        round_id: RoundId,
        /// Final multiplier.
        crash_point: Multiplier,
        /// Elapsed time of the crash.
        elapsed_ms: u64,
    },
    /// All payouts credited.
    Settled {
        /// Round.
        round_id: RoundId,
        /// Number of bets.
        participants: usize,
        /// Number of winning bets.
        winners: usize,
    },
    /// The round's server seed, now public.
    SeedRevealed(AuditRecord),
}

/// Accepted bet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetReceipt {
    /// Round the bet belongs to.
    pub round_id: RoundId,
    /// Stake taken.
    pub stake: Amount,
    /// Stake currency.
    pub currency: Currency,
    /// Balance right after the stake debit.
    pub balance: Balance,
}

/// Accepted cash-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashOutReceipt {
    /// Round.
    pub round_id: RoundId,
    /// Locked multiplier.
    pub multiplier: Multiplier,
    /// Amount credited at settlement.
    pub payout: Amount,
}

/// Engine failures. Any of these stops [`RoundEngine::run`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// Seed lifecycle failed (includes entropy failure).
    #[error("seed lifecycle failed: {0}")]
    Seed(#[from] SeedError),

    /// Round state machine rejected an engine transition.
    #[error("round transition failed: {0}")]
    Round(#[from] RoundError),

    /// A payout could not be credited after all retries.
    #[error("payout to {user_id} in round {round_id} failed: {source}")]
    Settlement {
        /// Round being settled.
        round_id: RoundId,
        /// Unpaid user.
        user_id: UserId,
        /// Last ledger error.
        source: LedgerError,
    },
}

enum Intent {
    PlaceBet {
        user_id: UserId,
        stake: Amount,
        currency: Currency,
        received_at: Instant,
        reply: oneshot::Sender<Result<BetReceipt, RoundError>>,
    },
    CashOut {
        user_id: UserId,
        received_at: Instant,
        reply: oneshot::Sender<Result<CashOutReceipt, RoundError>>,
    },
}

/// Clonable handle used by request handlers.
#[derive(Clone)]
pub struct RoundHandle {
    intents: mpsc::Sender<Intent>,
    snapshot: watch::Receiver<Option<RoundSnapshot>>,
    events: broadcast::Sender<RoundEvent>,
}

impl RoundHandle {
    /// Place a bet on the current round.
    pub async fn place_bet(
        &self,
        user_id: UserId,
        stake: Amount,
        currency: Currency,
    ) -> Result<BetReceipt, RoundError> {
        let (reply, response) = oneshot::channel();
        let intent = Intent::PlaceBet {
            user_id,
            stake,
            currency,
            received_at: Instant::now(),
            reply,
        };
        self.intents
            .send(intent)
            .await
            .map_err(|_| RoundError::EngineUnavailable)?;
        response.await.map_err(|_| RoundError::EngineUnavailable)?
    }

    /// Cash out the caller's bet at the current multiplier.
    pub async fn cash_out(&self, user_id: UserId) -> Result<CashOutReceipt, RoundError> {
        let (reply, response) = oneshot::channel();
        let intent = Intent::CashOut {
            user_id,
            received_at: Instant::now(),
            reply,
        };
        self.intents
            .send(intent)
            .await
            .map_err(|_| RoundError::EngineUnavailable)?;
        response.await.map_err(|_| RoundError::EngineUnavailable)?
    }

    /// Latest published round snapshot.
    pub fn snapshot(&self) -> Option<RoundSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Watch snapshot updates.
    pub fn watch(&self) -> watch::Receiver<Option<RoundSnapshot>> {
        self.snapshot.clone()
    }

    /// Subscribe to round events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }
}

/// Deadlines of the round being played.
struct Window {
    opened_at: Instant,
    betting_deadline: Instant,
    started_at: Option<Instant>,
}

/// The round coordinator.
pub struct RoundEngine {
    config: EngineConfig,
    seeds: Arc<SeedManager>,
    ledger: Arc<BalanceLedger>,
    intents: mpsc::Receiver<Intent>,
    snapshot: watch::Sender<Option<RoundSnapshot>>,
    events: broadcast::Sender<RoundEvent>,
}

impl RoundEngine {
    /// Create the engine and the handle request handlers use to reach it.
    pub fn new(
        config: EngineConfig,
        seeds: Arc<SeedManager>,
        ledger: Arc<BalanceLedger>,
    ) -> (Self, RoundHandle) {
        let (intent_tx, intent_rx) = mpsc::channel(config.intent_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let handle = RoundHandle {
            intents: intent_tx,
            snapshot: snapshot_rx,
            events: event_tx.clone(),
        };
        let engine = Self {
            config,
            seeds,
            ledger,
            intents: intent_rx,
            snapshot: snapshot_tx,
            events: event_tx,
        };
        (engine, handle)
    }

    /// Play rounds back to back until `shutdown` fires.
    ///
    /// Shutdown is honored between rounds; a round in progress always
    /// settles and reveals first. Returns an error only for failures that
    /// must halt play, such as an unavailable entropy source.
    #[instrument(skip_all, name = "round_engine")]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), EngineError> {
        info!(
            betting_window_ms = self.config.betting_window.as_millis() as u64,
            house_edge_bps = self.config.crash.house_edge_bps,
            "Round engine started"
        );

        let mut previous: Option<RoundId> = None;
        loop {
            let round_id = match self.play_round(previous).await {
                Ok(id) => id,
                Err(e) => {
                    error!("Round engine halted: {}", e);
                    return Err(e);
                }
            };
            previous = Some(round_id);

            if self.idle(self.config.intermission, &mut shutdown).await {
                break;
            }
        }

        info!("Round engine stopped");
        Ok(())
    }

    async fn play_round(&mut self, previous: Option<RoundId>) -> Result<RoundId, EngineError> {
        // Committing
        let next = RoundId::new_v4();
        let commitment = match previous {
            Some(retiring) => self.seeds.rotate(retiring, next).await?,
            None => self.seeds.commit(next).await?,
        };

        let opened_at = Instant::now();
        let betting_deadline = opened_at + self.config.betting_window;
        let closes_at = Utc::now()
            + chrono::Duration::milliseconds(self.config.betting_window.as_millis() as i64);
        let mut round = Round::new(commitment, self.config.clock, self.config.crash.max_multiplier, closes_at);
        let mut window = Window {
            opened_at,
            betting_deadline,
            started_at: None,
        };

        // Betting
        round.open_betting()?;
        info!(round = %round.id(), nonce = round.commitment().nonce, "Betting open");
        self.publish(&round, None);
        self.emit(RoundEvent::Committed(round.publication()));

        loop {
            tokio::select! {
                biased;
                Some(intent) = self.intents.recv() => self.handle_intent(&mut round, &window, intent).await,
                _ = sleep_until(betting_deadline) => break,
            }
        }
        self.drain_intents(&mut round, &window).await;

        // Running
        let crash_point = self.seeds.crash_point(round.id(), &self.config.crash).await?;
        let started_at = Instant::now();
        let started_wall = Utc::now();
        let crash_elapsed = round.start_running(crash_point, started_wall)?;
        let crash_deadline = started_at + Duration::from_millis(crash_elapsed);
        window.started_at = Some(started_at);

        debug!(round = %round.id(), bets = round.bet_count(), "Running");
        self.publish(&round, Some(0));
        self.emit(RoundEvent::Running {
            round_id: round.id(),
            started_at: started_wall,
            clock: self.config.clock,
        });

        let tick = self.config.tick_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(started_at + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                Some(intent) = self.intents.recv() => self.handle_intent(&mut round, &window, intent).await,
                _ = sleep_until(crash_deadline) => break,
                _ = ticker.tick() => {
                    let elapsed_ms = elapsed_ms(started_at, Instant::now());
                    let multiplier = round.multiplier_at(elapsed_ms);
                    self.publish(&round, Some(elapsed_ms));
                    self.emit(RoundEvent::Tick { round_id: round.id(), elapsed_ms, multiplier });
                }
            }
        }
        self.drain_intents(&mut round, &window).await;

        // Crashed
        let crash_point = round.crash()?;
        info!(round = %round.id(), crash_point, elapsed_ms = crash_elapsed, "Round crashed");
        self.publish(&round, Some(crash_elapsed));
        self.emit(RoundEvent::Crashed {
            round_id: round.id(),
            crash_point,
            elapsed_ms: crash_elapsed,
        });

        // Settling
        let payouts = round.begin_settlement()?;
        self.publish(&round, Some(crash_elapsed));
        for payout in &payouts {
            self.credit_payout(round.id(), payout).await?;
        }

        // Settled
        round.mark_settled()?;
        self.seeds.mark_settled(round.id()).await?;
        let record = self.seeds.reveal(round.id()).await?;
        info!(
            round = %round.id(),
            participants = round.bet_count(),
            winners = payouts.len(),
            "Round settled"
        );
        self.publish(&round, Some(crash_elapsed));
        self.emit(RoundEvent::Settled {
            round_id: round.id(),
            participants: round.bet_count(),
            winners: payouts.len(),
        });
        self.emit(RoundEvent::SeedRevealed(record));

        Ok(round.id())
    }

    /// Wait out `duration`, rejecting intents. Returns true on shutdown.
    async fn idle(&mut self, duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return true,
                Some(intent) = self.intents.recv() => reject_between_rounds(intent),
                _ = sleep_until(deadline) => return false,
            }
        }
    }

    /// Apply intents already queued when a deadline fired. Each is judged
    /// by its receive stamp, not by when it is handled.
    async fn drain_intents(&mut self, round: &mut Round, window: &Window) {
        while let Ok(intent) = self.intents.try_recv() {
            self.handle_intent(round, window, intent).await;
        }
    }

    async fn handle_intent(&mut self, round: &mut Round, window: &Window, intent: Intent) {
        match intent {
            Intent::PlaceBet { user_id, stake, currency, received_at, reply } => {
                let result = self.place_bet(round, window, user_id, stake, currency, received_at).await;
                let _ = reply.send(result);
            }
            Intent::CashOut { user_id, received_at, reply } => {
                let result = self.cash_out(round, window, user_id, received_at);
                let _ = reply.send(result);
            }
        }
    }

    async fn place_bet(
        &mut self,
        round: &mut Round,
        window: &Window,
        user_id: UserId,
        stake: Amount,
        currency: Currency,
        received_at: Instant,
    ) -> Result<BetReceipt, RoundError> {
        if received_at < window.opened_at || received_at >= window.betting_deadline {
            return Err(RoundError::BettingClosed);
        }
        round.check_bet(&user_id, stake)?;

        let receipt = self
            .ledger
            .debit(&user_id, stake, currency, EntryReason::Stake, Some(round.id()))
            .await?;
        round.accept_bet(Bet::new(user_id.clone(), stake, currency, Utc::now()))?;

        debug!(round = %round.id(), user = %user_id, stake, %currency, "Bet accepted");
        self.publish(round, None);
        self.emit(RoundEvent::BetPlaced {
            round_id: round.id(),
            user_id,
            stake,
            currency,
        });

        Ok(BetReceipt {
            round_id: round.id(),
            stake,
            currency,
            balance: receipt.balance,
        })
    }

    fn cash_out(
        &mut self,
        round: &mut Round,
        window: &Window,
        user_id: UserId,
        received_at: Instant,
    ) -> Result<CashOutReceipt, RoundError> {
        if received_at < window.opened_at {
            return Err(RoundError::TooLate);
        }
        let started_at = match window.started_at {
            Some(started) if received_at >= started => started,
            _ => return Err(RoundError::NotRunning),
        };

        let elapsed = elapsed_ms(started_at, received_at);
        let multiplier = round.cash_out(&user_id, elapsed)?;
        let payout = round
            .bet(&user_id)
            .and_then(Bet::payout)
            .ok_or_else(|| RoundError::PayoutOverflow(user_id.clone()))?;

        debug!(round = %round.id(), user = %user_id, multiplier, elapsed_ms = elapsed, "Cashed out");
        self.publish(round, Some(elapsed));
        self.emit(RoundEvent::CashedOut {
            round_id: round.id(),
            user_id,
            multiplier,
            payout,
        });

        Ok(CashOutReceipt {
            round_id: round.id(),
            multiplier,
            payout,
        })
    }

    async fn credit_payout(&self, round_id: RoundId, payout: &Payout) -> Result<(), EngineError> {
        let attempts = self.config.settlement_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .ledger
                .credit(
                    &payout.user_id,
                    payout.amount,
                    payout.currency,
                    EntryReason::Payout,
                    Some(round_id),
                    payout.idempotency_key.clone(),
                )
                .await;

            match result {
                Ok(receipt) => {
                    if receipt.replayed {
                        debug!(round = %round_id, user = %payout.user_id, "Payout already applied");
                    }
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(round = %round_id, user = %payout.user_id, attempt, "Payout failed, retrying: {}", e);
                    sleep(self.config.settlement_retry_delay).await;
                }
                Err(e) => {
                    return Err(EngineError::Settlement {
                        round_id,
                        user_id: payout.user_id.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    fn publish(&self, round: &Round, elapsed_ms: Option<u64>) {
        self.snapshot.send_replace(Some(round.snapshot(elapsed_ms)));
    }

    fn emit(&self, event: RoundEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

fn reject_between_rounds(intent: Intent) {
    match intent {
        Intent::PlaceBet { reply, .. } => {
            let _ = reply.send(Err(RoundError::BettingClosed));
        }
        Intent::CashOut { reply, .. } => {
            let _ = reply.send(Err(RoundError::TooLate));
        }
    }
}

fn elapsed_ms(since: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(since).as_millis() as u64
}

// =============================================================================
// TESTS
// =============================================================================
