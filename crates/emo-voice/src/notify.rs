//! **Notify sink**: best-effort publication of every spoken reply (MQTT).

use crate::config::NotifyConfig;
use crate::error::NotifyError;
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend that publishes a message on a topic. Failures are logged by the caller, never surfaced.
pub trait NotifySink: Send + Sync {
    fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError>;

    /// Tear the connection down. Called before a sink is replaced.
    fn close(&self) {}
}

/// MQTT sink. The network event loop runs on its own thread for the life of the sink.
pub struct MqttSink {
    client: Client,
    closed: Arc<AtomicBool>,
    event_loop: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MqttSink {
    /// Connect to the broker and wait for its CONNACK, up to `connect_timeout_ms`.
    pub fn connect(cfg: &NotifyConfig) -> Result<Self, NotifyError> {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.broker.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
        let (client, connection) = Client::new(options, 16);

        let closed = Arc::new(AtomicBool::new(false));
        let (ack_tx, ack_rx) = mpsc::channel();
        let loop_closed = Arc::clone(&closed);
        let handle = thread::Builder::new()
            .name("emo-mqtt".into())
            .spawn(move || run_event_loop(connection, loop_closed, ack_tx))
            .map_err(|e| NotifyError::Connect(e.to_string()))?;

        let sink = Self {
            client,
            closed,
            event_loop: Mutex::new(Some(handle)),
        };

        match ack_rx.recv_timeout(Duration::from_millis(cfg.connect_timeout_ms)) {
            Ok(Ok(())) => {
                info!(broker = %cfg.broker, port = cfg.port, "MQTT connected successfully");
                Ok(sink)
            }
            Ok(Err(e)) => {
                sink.close();
                Err(NotifyError::Connect(e))
            }
            Err(_) => {
                sink.close();
                Err(NotifyError::Connect(format!(
                    "no CONNACK from {}:{} within {}ms",
                    cfg.broker, cfg.port, cfg.connect_timeout_ms
                )))
            }
        }
    }
}

fn run_event_loop(
    mut connection: Connection,
    closed: Arc<AtomicBool>,
    ack_tx: mpsc::Sender<Result<(), String>>,
) {
    let mut ack_tx = Some(ack_tx);
    for notification in connection.iter() {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if let Some(tx) = ack_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(event) => debug!("MQTT event: {:?}", event),
            Err(e) => {
                if let Some(tx) = ack_tx.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }
                warn!("MQTT connection error: {}", e);
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
    debug!("MQTT event loop ended");
}

impl NotifySink for MqttSink {
    fn publish(&self, topic: &str, message: &str) -> Result<(), NotifyError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NotifyError::Publish("sink closed".into()));
        }
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, message.as_bytes().to_vec())
            .map_err(|e| NotifyError::Publish(e.to_string()))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.client.try_disconnect();
        let handle = match self.event_loop.lock() {
            Ok(mut h) => h.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // The loop exits on its next event; don't block the caller on the network.
        drop(handle);
        info!("MQTT sink closed");
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.close();
    }
}
