//! Reliable, ordered control-message routing to kiosk rooms.
//!
//! Each room gets one lane: an unbounded FIFO drained by a single worker
//! task, so two messages queued in order are published in order. `schedule`
//! arms a timer on the server timeline; timers and the lane itself are torn
//! down when the room is released, which is how scheduled visuals from an
//! ended session disappear without a trace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use docent_core::ControlMessage;

use crate::transport::{RoomTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    RoomGone,
}

struct Lane {
    tx: mpsc::UnboundedSender<ControlMessage>,
    worker: JoinHandle<()>,
    scheduled: Vec<JoinHandle<()>>,
}

pub struct DatachannelRouter {
    transport: Arc<dyn RoomTransport>,
    lanes: Mutex<HashMap<String, Lane>>,
}

impl DatachannelRouter {
    pub fn new(transport: Arc<dyn RoomTransport>) -> Self {
        Self {
            transport,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Open the lane for a freshly created room.
    pub fn open_room(&self, room_name: &str) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();
        let transport = self.transport.clone();
        let room = room_name.to_string();

        let worker = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let payload = match message.to_json_bytes() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%room, "failed to encode control message: {err}");
                        continue;
                    }
                };
                match transport.publish(&room, &payload).await {
                    Ok(()) => {}
                    Err(TransportError::RoomGone) => {
                        debug!(%room, "room gone, dropping control message");
                    }
                    Err(TransportError::Other(err)) => {
                        warn!(%room, "datachannel publish failed: {err}");
                    }
                }
            }
        });

        self.lanes.lock().unwrap().insert(
            room_name.to_string(),
            Lane {
                tx,
                worker,
                scheduled: Vec::new(),
            },
        );
    }

    /// Queue a message for immediate broadcast.
    pub fn send(&self, room_name: &str, message: ControlMessage) -> SendOutcome {
        let lanes = self.lanes.lock().unwrap();
        match lanes.get(room_name) {
            Some(lane) if lane.tx.send(message).is_ok() => SendOutcome::Queued,
            _ => SendOutcome::RoomGone,
        }
    }

    /// Arm a timer that queues the message at `at_ms` on the server
    /// timeline. Past-due instants queue immediately. The timer is released
    /// with the room.
    pub fn schedule(self: &Arc<Self>, room_name: &str, message: ControlMessage, at_ms: i64) {
        let delay_ms = at_ms - now_ms();
        if delay_ms <= 0 {
            if self.send(room_name, message) == SendOutcome::RoomGone {
                debug!(%room_name, "room gone, dropping due control message");
            }
            return;
        }

        let router = Arc::clone(self);
        let room = room_name.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
            if router.send(&room, message) == SendOutcome::RoomGone {
                debug!(%room, "room gone, dropping scheduled control message");
            }
        });

        let mut lanes = self.lanes.lock().unwrap();
        match lanes.get_mut(room_name) {
            Some(lane) => {
                lane.scheduled.retain(|handle| !handle.is_finished());
                lane.scheduled.push(task);
            }
            None => {
                task.abort();
                debug!(%room_name, "room gone, refusing to schedule control message");
            }
        }
    }

    /// Tear down the lane. Armed timers are aborted immediately; messages
    /// already queued (a final `end_of_stream`, typically) still drain, as
    /// the worker exits once the closed queue is empty.
    pub fn release_room(&self, room_name: &str) {
        let lane = self.lanes.lock().unwrap().remove(room_name);
        if let Some(lane) = lane {
            for timer in lane.scheduled {
                timer.abort();
            }
            drop(lane.tx);
            drop(lane.worker);
        }
    }

    /// Armed timers still pending for a room. Zero after release.
    pub fn scheduled_count(&self, room_name: &str) -> usize {
        self.lanes
            .lock()
            .unwrap()
            .get(room_name)
            .map(|lane| {
                lane.scheduled
                    .iter()
                    .filter(|handle| !handle.is_finished())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn has_room(&self, room_name: &str) -> bool {
        self.lanes.lock().unwrap().contains_key(room_name)
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalRoomHub;

    async fn recv_message(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> ControlMessage {
        let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for control message")
            .expect("room channel closed");
        ControlMessage::from_json_bytes(&payload).unwrap()
    }

    fn show(id: &str, playout_ts: i64) -> ControlMessage {
        ControlMessage::ImgShow {
            id: id.into(),
            playout_ts,
            transition: Default::default(),
            duration_ms: 400,
            caption: None,
        }
    }

    #[tokio::test]
    async fn messages_arrive_in_queue_order() {
        let hub = Arc::new(LocalRoomHub::new("ws://local"));
        let router = Arc::new(DatachannelRouter::new(hub.clone()));
        let grant = hub.create_room("k1").await.unwrap();
        router.open_room(&grant.room_name);
        let mut rx = hub.subscribe(&grant.room_name).unwrap();

        for n in 0..5 {
            assert_eq!(
                router.send(&grant.room_name, show("img", n)),
                SendOutcome::Queued
            );
        }
        for n in 0..5 {
            assert_eq!(recv_message(&mut rx).await.playout_ts(), Some(n));
        }
    }

    #[tokio::test]
    async fn past_due_schedule_fires_immediately() {
        let hub = Arc::new(LocalRoomHub::new("ws://local"));
        let router = Arc::new(DatachannelRouter::new(hub.clone()));
        let grant = hub.create_room("k1").await.unwrap();
        router.open_room(&grant.room_name);
        let mut rx = hub.subscribe(&grant.room_name).unwrap();

        router.schedule(&grant.room_name, show("img", 7), now_ms() - 500);
        assert_eq!(recv_message(&mut rx).await.playout_ts(), Some(7));
    }

    #[tokio::test]
    async fn scheduled_message_fires_at_its_instant() {
        let hub = Arc::new(LocalRoomHub::new("ws://local"));
        let router = Arc::new(DatachannelRouter::new(hub.clone()));
        let grant = hub.create_room("k1").await.unwrap();
        router.open_room(&grant.room_name);
        let mut rx = hub.subscribe(&grant.room_name).unwrap();

        router.schedule(&grant.room_name, show("img", 9), now_ms() + 50);
        assert_eq!(router.scheduled_count(&grant.room_name), 1);
        assert_eq!(recv_message(&mut rx).await.playout_ts(), Some(9));
    }

    #[tokio::test]
    async fn release_aborts_armed_timers() {
        let hub = Arc::new(LocalRoomHub::new("ws://local"));
        let router = Arc::new(DatachannelRouter::new(hub.clone()));
        let grant = hub.create_room("k1").await.unwrap();
        router.open_room(&grant.room_name);
        let mut rx = hub.subscribe(&grant.room_name).unwrap();

        router.schedule(&grant.room_name, show("img", 1), now_ms() + 60);
        router.release_room(&grant.room_name);
        assert_eq!(router.scheduled_count(&grant.room_name), 0);
        assert!(!router.has_room(&grant.room_name));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_unknown_room_reports_room_gone() {
        let hub = Arc::new(LocalRoomHub::new("ws://local"));
        let router = Arc::new(DatachannelRouter::new(hub));
        assert_eq!(router.send("nope", ControlMessage::EndChat), SendOutcome::RoomGone);
    }
}
