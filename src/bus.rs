//! Message-bus adapter (C1).
//!
//! Owns the one connection to the MQTT broker. Subscribes with QoS "exactly
//! once" to the `measurement/#` tree, turns inbound publishes into
//! [`JobCommand`]s routed to the dispatcher, and exposes a [`BusHandle`] that
//! every producer (pipeline, MPPT tracker, data handlers, calibration flows)
//! clones to publish without ever touching the network directly.
//!
//! Two independent loops, matching §4.1: [`run_inbound`] drains the MQTT
//! event loop and dispatches requests; [`run_publish_pump`] drains the
//! outbound side and performs the actual `client.publish` calls.
//!
//! The outbound side is two lanes, per §7: `data/raw/*` samples never get
//! dropped, since a lost sample corrupts the curve it belongs to, so that
//! lane is unbounded. Everything else (status, log, progress, plotter
//! clears) shares one bounded control lane; when it's full the OLDEST entry
//! is evicted to make room for the new one, and the eviction is logged at
//! WARN rather than silently swallowed.

use crate::action::{Action, JobRequest};
use crate::config::BusConfig;
use crate::error::DaqError;
use crate::messages::JobCommand;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const TOPIC_REQUEST_ROOT: &str = "measurement";
const TOPIC_STATUS: &str = "measurement/status";
const TOPIC_LOG: &str = "measurement/log";
const TOPIC_PROGRESS: &str = "progress";

/// Topic prefix that marks a message as raw measurement data - these never
/// get dropped for queue pressure, only control/status chatter does.
const DATA_TOPIC_PREFIX: &str = "data/raw/";

/// Retained status values published on [`TOPIC_STATUS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No job running, ready to accept one.
    Ready,
    /// A job currently occupies the job slot.
    Busy,
    /// Connection lost - this is the last-will payload, never published by us directly.
    Offline,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Ready => "Ready",
            Status::Busy => "Busy",
            Status::Offline => "Offline",
        }
    }
}

/// One message queued for publication.
pub(crate) struct OutboundMessage {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) retain: bool,
}

/// Bounded control-topic queue that drops the OLDEST entry on overflow
/// instead of rejecting the newest one - a stale "busy" status is harmless,
/// a lost sample isn't, so control traffic favors recency over completeness.
struct ControlLane {
    queue: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    capacity: usize,
}

impl ControlLane {
    fn new(capacity: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(capacity)), notify: Notify::new(), capacity: capacity.max(1) }
    }

    fn push(&self, msg: OutboundMessage) {
        let mut queue = self.queue.lock().expect("control lane mutex poisoned");
        if queue.len() >= self.capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(topic = %dropped.topic, "control publish queue full, dropping oldest queued message");
            }
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
    }

    async fn pop(&self) -> OutboundMessage {
        loop {
            if let Some(msg) = self.queue.lock().expect("control lane mutex poisoned").pop_front() {
                return msg;
            }
            self.notify.notified().await;
        }
    }
}

/// Either the real two-lane transport used by [`start`], or a single plain
/// channel used by other modules' tests to inspect publish-path behavior
/// without standing up a broker connection or the eviction policy.
#[derive(Clone)]
enum Lane {
    Split { data_tx: mpsc::UnboundedSender<OutboundMessage>, control: Arc<ControlLane> },
    #[cfg(test)]
    Direct(mpsc::Sender<OutboundMessage>),
}

/// Cheaply cloneable handle producers use to publish without touching MQTT directly.
#[derive(Clone)]
pub struct BusHandle {
    lane: Lane,
}

impl BusHandle {
    /// Build a handle directly over a plain channel, bypassing an actual
    /// broker connection and the production drop policy. Used by other
    /// modules' tests to exercise publish-path logic without an MQTT broker;
    /// `try_send` fails closed on a full queue, same as before §7's
    /// two-lane/eviction redesign, since producer-side tests only care about
    /// the `Err(DataPublishDropped)` contract, not the eviction policy.
    #[cfg(test)]
    pub(crate) fn for_test(tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self { lane: Lane::Direct(tx) }
    }

    fn enqueue(&self, msg: OutboundMessage) -> Result<(), DaqError> {
        match &self.lane {
            Lane::Split { data_tx, control } => {
                if msg.topic.starts_with(DATA_TOPIC_PREFIX) {
                    data_tx.send(msg).map_err(|e| DaqError::DataPublishDropped(e.0.topic))
                } else {
                    control.push(msg);
                    Ok(())
                }
            }
            #[cfg(test)]
            Lane::Direct(tx) => tx.try_send(msg).map_err(|e| match e {
                mpsc::error::TrySendError::Full(m) => DaqError::DataPublishDropped(m.topic),
                mpsc::error::TrySendError::Closed(m) => DaqError::DataPublishDropped(m.topic),
            }),
        }
    }

    /// Publish a JSON payload to `topic`. `data/raw/*` topics are never
    /// dropped; every other topic can return [`DaqError::DataPublishDropped`]
    /// only when built over [`BusHandle::for_test`] - the production control
    /// lane evicts the oldest queued message instead of failing (§7).
    pub fn publish_json<T: Serialize>(&self, topic: impl Into<String>, payload: &T, retain: bool) -> Result<(), DaqError> {
        let topic = topic.into();
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| DaqError::Config(format!("failed to serialize payload for {topic}: {e}")))?;
        self.enqueue(OutboundMessage { topic, payload: bytes, retain })
    }

    /// Publish the retained `measurement/status` topic.
    pub fn publish_status(&self, status: Status) -> Result<(), DaqError> {
        self.enqueue(OutboundMessage { topic: TOPIC_STATUS.to_string(), payload: status.as_str().as_bytes().to_vec(), retain: true })
    }

    /// Publish one `{level, msg}` log record at or above INFO.
    pub fn publish_log(&self, level: &str, msg: &str) -> Result<(), DaqError> {
        #[derive(Serialize)]
        struct LogRecord<'a> {
            level: &'a str,
            msg: &'a str,
        }
        self.publish_json(TOPIC_LOG, &LogRecord { level, msg }, false)
    }

    /// Publish `{text, fraction}` progress.
    pub fn publish_progress(&self, text: &str, fraction: f64) -> Result<(), DaqError> {
        #[derive(Serialize)]
        struct Progress<'a> {
            text: &'a str,
            fraction: f64,
        }
        self.publish_json(TOPIC_PROGRESS, &Progress { text, fraction: fraction.clamp(0.0, 1.0) }, false)
    }

    /// Publish a one-shot clear signal for `plotter/<kind>/clear`.
    pub fn publish_clear(&self, kind: &str) -> Result<(), DaqError> {
        self.publish_json(format!("plotter/{kind}/clear"), &serde_json::json!({}), false)
    }
}

/// Connect to the broker and spawn the inbound-dispatch and publish-pump loops.
///
/// `dispatcher_tx` is where parsed [`JobCommand`]s are sent; the dispatcher
/// owns the job slot and decides accept/reject.
pub async fn start(config: &BusConfig, dispatcher_tx: mpsc::Sender<JobCommand>) -> Result<(BusHandle, JoinHandle<()>, JoinHandle<()>), DaqError> {
    let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    opts.set_last_will(LastWill::new(TOPIC_STATUS, Status::Offline.as_str(), QoS::AtLeastOnce, true));

    let (client, event_loop) = AsyncClient::new(opts, config.publish_queue_capacity);
    client
        .subscribe(format!("{TOPIC_REQUEST_ROOT}/#"), QoS::ExactlyOnce)
        .await
        .map_err(|e| DaqError::Bus(format!("subscribe failed: {e}")))?;

    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let control = Arc::new(ControlLane::new(config.publish_queue_capacity));
    let handle = BusHandle { lane: Lane::Split { data_tx, control: control.clone() } };

    // Ready is published once the inbound loop is live, not here, so a
    // subscriber never sees Ready before we can actually accept a job.
    let inbound_handle = tokio::spawn(run_inbound(event_loop, dispatcher_tx, handle.clone()));
    let publish_handle = tokio::spawn(run_publish_pump(client, data_rx, control));

    Ok((handle, inbound_handle, publish_handle))
}

async fn run_inbound(mut event_loop: rumqttc::EventLoop, dispatcher_tx: mpsc::Sender<JobCommand>, bus: BusHandle) {
    let mut announced_ready = false;
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !announced_ready {
                    let _ = bus.publish_status(Status::Ready);
                    announced_ready = true;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                let Some(action_name) = topic.strip_prefix("measurement/").filter(|s| !s.is_empty()) else {
                    continue;
                };
                // `measurement/status` and `measurement/log` are our own outbound topics;
                // a retained echo from the broker must never be mistaken for a request.
                if action_name == "status" || action_name == "log" {
                    continue;
                }
                if let Err(err) = dispatch_inbound(action_name, &publish.payload, &dispatcher_tx).await {
                    warn!(topic = %topic, error = %err, "dropping malformed inbound request");
                    let _ = bus.publish_log("warn", &format!("dropped malformed request on {topic}: {err}"));
                }
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "mqtt event loop error, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

async fn dispatch_inbound(action_name: &str, payload: &[u8], dispatcher_tx: &mpsc::Sender<JobCommand>) -> Result<(), DaqError> {
    // Debug-format wraps the bare topic suffix in quotes, turning "run" into the
    // JSON string literal `"run"` that Action's snake_case deserializer expects.
    let action: Action = serde_json::from_str(&format!("{action_name:?}"))
        .map_err(|_| DaqError::Config(format!("unrecognized action topic suffix {action_name:?}")))?;

    let (response_tx, response_rx) = oneshot::channel();
    let command = match action {
        Action::Stop => JobCommand::Stop { response: response_tx },
        Action::Estop => JobCommand::Estop { response: response_tx },
        _ => {
            let mut request: JobRequest = serde_json::from_slice(payload)
                .map_err(|e| DaqError::Config(format!("malformed job request body: {e}")))?;
            request.action = action;
            JobCommand::Run { request, response: response_tx }
        }
    };

    dispatcher_tx
        .send(command)
        .await
        .map_err(|_| DaqError::Bus("dispatcher command channel closed".into()))?;

    match response_rx.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "dispatcher rejected request");
            Ok(())
        }
        Err(_) => Err(DaqError::Bus("dispatcher dropped response channel".into())),
    }
}

/// The retained status topic is the one thing a late subscriber must be
/// able to pick up reliably, so it goes out at-least-once; everything else
/// is a point-in-time sample nobody needs redelivered, so at-most-once spares
/// the broker a useless retry when a subscriber is briefly gone.
fn qos_for_topic(topic: &str) -> QoS {
    if topic == TOPIC_STATUS {
        QoS::AtLeastOnce
    } else {
        QoS::AtMostOnce
    }
}

async fn run_publish_pump(client: AsyncClient, mut data_rx: mpsc::UnboundedReceiver<OutboundMessage>, control: Arc<ControlLane>) {
    let mut data_closed = false;
    loop {
        let msg = if data_closed {
            control.pop().await
        } else {
            tokio::select! {
                maybe = data_rx.recv() => match maybe {
                    Some(msg) => msg,
                    None => {
                        data_closed = true;
                        info!("data publish lane closed, draining control lane only");
                        continue;
                    }
                },
                msg = control.pop() => msg,
            }
        };
        let qos = qos_for_topic(&msg.topic);
        if let Err(err) = client.publish(&msg.topic, qos, msg.retain, msg.payload).await {
            error!(topic = %msg.topic, error = %err, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_json_fails_closed_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = BusHandle::for_test(tx);
        handle.publish_progress("first", 0.1).unwrap();
        let err = handle.publish_progress("second", 0.2).unwrap_err();
        assert!(matches!(err, DaqError::DataPublishDropped(_)));
    }

    #[tokio::test]
    async fn publish_status_sets_retain() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = BusHandle::for_test(tx);
        handle.publish_status(Status::Busy).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, TOPIC_STATUS);
        assert!(msg.retain);
        assert_eq!(msg.payload, b"Busy");
    }

    fn split_handle(control_capacity: usize) -> (BusHandle, mpsc::UnboundedReceiver<OutboundMessage>, Arc<ControlLane>) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let control = Arc::new(ControlLane::new(control_capacity));
        let handle = BusHandle { lane: Lane::Split { data_tx, control: control.clone() } };
        (handle, data_rx, control)
    }

    #[tokio::test]
    async fn control_lane_evicts_oldest_when_full() {
        let (handle, _data_rx, control) = split_handle(2);
        handle.publish_progress("first", 0.1).unwrap();
        handle.publish_progress("second", 0.2).unwrap();
        // Third push overflows a capacity-2 lane; "first" must be the one
        // evicted, not "second" (oldest out, not newest rejected).
        handle.publish_progress("third", 0.3).unwrap();

        let remaining: Vec<String> = {
            let mut queue = control.queue.lock().unwrap();
            queue.drain(..).map(|m| String::from_utf8(m.payload).unwrap()).collect()
        };
        assert_eq!(remaining.len(), 2);
        assert!(remaining[0].contains("second"));
        assert!(remaining[1].contains("third"));
    }

    #[tokio::test]
    async fn data_topic_is_never_dropped_by_control_lane_pressure() {
        let (handle, mut data_rx, _control) = split_handle(1);
        for i in 0..50 {
            handle.publish_json("data/raw/iv_measurement", &serde_json::json!({ "i": i }), false).unwrap();
        }
        for i in 0..50 {
            let msg = data_rx.recv().await.unwrap();
            assert_eq!(msg.topic, "data/raw/iv_measurement");
            let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
            assert_eq!(payload["i"], i);
        }
    }

    #[tokio::test]
    async fn dispatch_inbound_routes_stop_without_body() {
        let (dispatcher_tx, mut dispatcher_rx) = mpsc::channel(4);
        let handle_task = tokio::spawn(async move { dispatch_inbound("stop", b"", &dispatcher_tx).await });
        let cmd = dispatcher_rx.recv().await.unwrap();
        match cmd {
            JobCommand::Stop { response } => {
                let _ = response.send(Ok(()));
            }
            _ => panic!("expected Stop"),
        }
        assert!(handle_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dispatch_inbound_rejects_unknown_action() {
        let (dispatcher_tx, _rx) = mpsc::channel(4);
        let err = dispatch_inbound("not_a_real_action", b"{}", &dispatcher_tx).await.unwrap_err();
        assert!(matches!(err, DaqError::Config(_)));
    }
}
