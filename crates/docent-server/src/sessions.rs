//! Session lifecycle: creation, activity tracking, timeouts, teardown.
//!
//! Each active session owns a watchdog task armed against two independent
//! deadlines: the inactivity window (reset by every successful activity)
//! and the hard duration from creation. Watchdogs run on the runtime's
//! timer wheel, never on a request handler, so a slow request cannot delay
//! a timeout. A shared 1 Hz ticker feeds the operator channel and a sweep
//! task prunes ended sessions after a retention grace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use docent_core::{ChatTurn, ControlMessage};

use crate::config::ServerConfig;
use crate::datachannel::DatachannelRouter;
use crate::transport::{RoomGrant, RoomTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Manual,
    Timeout,
    Duration,
    OperatorTerminated,
}

/// Snapshot of one session record.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub kiosk_id: String,
    pub room_name: String,
    pub created_at_ms: i64,
    pub duration_s: u64,
    pub last_activity_ms: i64,
    pub state: SessionState,
    pub end_reason: Option<EndReason>,
    pub ended_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionTick {
    pub session_id: String,
    pub remaining_s: u64,
}

pub struct CreatedSession {
    pub session_id: String,
    pub grant: RoomGrant,
    pub duration_s: u64,
}

/// Per-session state. The turn gate serialises conversation turns; the
/// record and history have their own short-lived locks.
pub struct SessionSlot {
    record: Mutex<Session>,
    history: Mutex<Vec<ChatTurn>>,
    pub turn_gate: tokio::sync::Mutex<()>,
    activity: Notify,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl SessionSlot {
    pub fn snapshot(&self) -> Session {
        self.record.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        self.record.lock().unwrap().state == SessionState::Active
    }

    pub fn room_name(&self) -> String {
        self.record.lock().unwrap().room_name.clone()
    }

    pub fn history_snapshot(&self) -> Vec<ChatTurn> {
        self.history.lock().unwrap().clone()
    }

    pub fn append_history(&self, turn: ChatTurn) {
        self.history.lock().unwrap().push(turn);
    }

    fn watchdog_finished(&self) -> bool {
        self.watchdog
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }
}

pub struct SessionRegistry {
    config: Arc<ServerConfig>,
    transport: Arc<dyn RoomTransport>,
    router: Arc<DatachannelRouter>,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    ticks: broadcast::Sender<SessionTick>,
    tick_interval: Duration,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRegistry {
    pub fn new(
        config: Arc<ServerConfig>,
        transport: Arc<dyn RoomTransport>,
        router: Arc<DatachannelRouter>,
    ) -> Self {
        let (ticks, _) = broadcast::channel(256);
        Self {
            config,
            transport,
            router,
            sessions: RwLock::new(HashMap::new()),
            ticks,
            tick_interval: Duration::from_secs(1),
            background: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Mint a session: create the transport room, open its datachannel lane,
    /// seed the history with the persona turn and arm the watchdog.
    pub async fn create(self: &Arc<Self>, kiosk_id: &str) -> anyhow::Result<CreatedSession> {
        let grant = self.transport.create_room(kiosk_id).await?;
        self.router.open_room(&grant.room_name);

        let session_id = format!("sess_{}", Uuid::new_v4().simple());
        let now = now_ms();
        let record = Session {
            id: session_id.clone(),
            kiosk_id: kiosk_id.to_string(),
            room_name: grant.room_name.clone(),
            created_at_ms: now,
            duration_s: self.config.session_duration_s,
            last_activity_ms: now,
            state: SessionState::Active,
            end_reason: None,
            ended_at_ms: None,
        };

        let slot = Arc::new(SessionSlot {
            record: Mutex::new(record),
            history: Mutex::new(vec![ChatTurn::system(self.config.persona_prompt.clone())]),
            turn_gate: tokio::sync::Mutex::new(()),
            activity: Notify::new(),
            watchdog: Mutex::new(None),
        });

        self.sessions
            .write()
            .unwrap()
            .insert(session_id.clone(), Arc::clone(&slot));

        // Armed only after the slot is registered, so an already-expired
        // deadline can still find the session to end.
        let watchdog = tokio::spawn(Self::watchdog_loop(
            Arc::clone(self),
            session_id.clone(),
            Arc::clone(&slot),
        ));
        *slot.watchdog.lock().unwrap() = Some(watchdog);

        info!(%session_id, %kiosk_id, room = %grant.room_name, "session created");
        Ok(CreatedSession {
            session_id,
            grant,
            duration_s: self.config.session_duration_s,
        })
    }

    /// Reset the inactivity window. No-op unless the session is active.
    pub fn refresh(&self, session_id: &str) {
        let Some(slot) = self.slot(session_id) else {
            return;
        };
        {
            let mut record = slot.record.lock().unwrap();
            if record.state != SessionState::Active {
                return;
            }
            record.last_activity_ms = now_ms();
        }
        slot.activity.notify_one();
    }

    /// Transition active → ended. Idempotent; returns whether this call did
    /// the transition. Room teardown is best-effort and never blocks the
    /// state change.
    pub async fn end(&self, session_id: &str, reason: EndReason) -> bool {
        let Some(slot) = self.slot(session_id) else {
            return false;
        };

        let room_name = {
            let mut record = slot.record.lock().unwrap();
            if record.state == SessionState::Ended {
                return false;
            }
            record.state = SessionState::Ended;
            record.end_reason = Some(reason);
            record.ended_at_ms = Some(now_ms());
            record.room_name.clone()
        };

        // History dies with the session.
        slot.history.lock().unwrap().clear();

        // Wake the watchdog so it observes the ended state and exits.
        slot.activity.notify_one();

        info!(%session_id, ?reason, "session ended");

        self.router.send(
            &room_name,
            ControlMessage::EndOfStream {
                session_id: session_id.to_string(),
            },
        );
        self.router.release_room(&room_name);

        if let Err(err) = self.transport.delete_room(&room_name).await {
            warn!(%session_id, room = %room_name, "room deletion failed: {err:#}");
        }

        true
    }

    pub fn lookup(&self, session_id: &str) -> Option<Session> {
        self.slot(session_id).map(|slot| slot.snapshot())
    }

    pub(crate) fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Stream of per-session remaining-time ticks, emitted at 1 Hz for all
    /// active sessions.
    pub fn subscribe_ticks(&self) -> broadcast::Receiver<SessionTick> {
        self.ticks.subscribe()
    }

    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|slot| slot.is_active())
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Start the shared ticker and the ended-session sweep.
    pub fn start_background(self: &Arc<Self>) {
        let ticker = {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(registry.tick_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    registry.emit_ticks();
                }
            })
        };

        let sweep = {
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(registry.config.session_sweep_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    registry.sweep_ended();
                }
            })
        };

        self.background.lock().unwrap().extend([ticker, sweep]);
    }

    pub fn shutdown(&self) {
        for task in self.background.lock().unwrap().drain(..) {
            task.abort();
        }
        for slot in self.sessions.read().unwrap().values() {
            if let Some(watchdog) = slot.watchdog.lock().unwrap().take() {
                watchdog.abort();
            }
        }
    }

    /// Test hook for the resource-discipline invariant: an ended session
    /// must not keep a live watchdog.
    pub fn has_residual_timer(&self, session_id: &str) -> bool {
        self.slot(session_id)
            .map(|slot| !slot.watchdog_finished())
            .unwrap_or(false)
    }

    fn emit_ticks(&self) {
        let now = now_ms();
        let snapshot: Vec<(String, String, u64)> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .filter_map(|slot| {
                    let record = slot.record.lock().unwrap();
                    if record.state != SessionState::Active {
                        return None;
                    }
                    let elapsed_s = ((now - record.created_at_ms).max(0) / 1_000) as u64;
                    let remaining_s = record.duration_s.saturating_sub(elapsed_s);
                    Some((record.id.clone(), record.room_name.clone(), remaining_s))
                })
                .collect()
        };

        for (session_id, room_name, remaining_s) in snapshot {
            let _ = self.ticks.send(SessionTick {
                session_id: session_id.clone(),
                remaining_s,
            });
            self.router.send(
                &room_name,
                ControlMessage::TimeTick {
                    session_id,
                    remaining_s,
                },
            );
        }
    }

    fn sweep_ended(&self) {
        let retention_ms = self.config.session_retention.as_millis() as i64;
        let cutoff = now_ms() - retention_ms;
        let mut sessions = self.sessions.write().unwrap();
        sessions.retain(|session_id, slot| {
            let record = slot.record.lock().unwrap();
            let keep = match (record.state, record.ended_at_ms) {
                (SessionState::Ended, Some(ended_at)) => ended_at > cutoff,
                _ => true,
            };
            if !keep {
                debug!(%session_id, "sweeping ended session");
            }
            keep
        });
    }

    async fn watchdog_loop(registry: Arc<Self>, session_id: String, slot: Arc<SessionSlot>) {
        loop {
            let (idle_deadline, hard_deadline) = {
                let record = slot.record.lock().unwrap();
                if record.state != SessionState::Active {
                    return;
                }
                (
                    record.last_activity_ms
                        + registry.config.session_idle_timeout.as_millis() as i64,
                    record.created_at_ms + record.duration_s as i64 * 1_000,
                )
            };

            let now = now_ms();
            let deadline = idle_deadline.min(hard_deadline);
            if now >= deadline {
                let reason = if now >= hard_deadline {
                    EndReason::Duration
                } else {
                    EndReason::Timeout
                };
                registry.end(&session_id, reason).await;
                return;
            }

            let wait = Duration::from_millis((deadline - now) as u64);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = slot.activity.notified() => {}
            }
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
