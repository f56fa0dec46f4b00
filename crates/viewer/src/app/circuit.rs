use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use viewer_core::TaggedMessage;

use super::control_port::ControlCommand;
use super::settings::CircuitSettings;

const TEXTURE_ID_SPACE: u64 = 512;
const OBJECT_ID_SPACE: u64 = 4096;

/// Inbound traffic as the session layer sees it, one variant per message template.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Message {
    ObjectUpdate { local_id: u32 },
    ChatFromSimulator { from: String, text: String },
    ImageData { texture_id: u32, codec_bytes: u32 },
    LogoutReply,
    KickUser { reason: String },
    ViewerControl(ControlCommand),
}

impl TaggedMessage for Message {
    fn tag(&self) -> &str {
        match self {
            Self::ObjectUpdate { .. } => "ObjectUpdate",
            Self::ChatFromSimulator { .. } => "ChatFromSimulator",
            Self::ImageData { .. } => "ImageData",
            Self::LogoutReply => "LogoutReply",
            Self::KickUser { .. } => "KickUser",
            Self::ViewerControl(_) => "ViewerControl",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitCommand {
    Logout,
    Close,
}

/// Outbound side of the circuit, shared by everything that talks to the region.
#[derive(Debug, Clone)]
pub(crate) struct CircuitLink {
    commands: Sender<CircuitCommand>,
}

impl CircuitLink {
    /// A link whose circuit is already gone.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (commands, _receiver) = mpsc::channel();
        Self { commands }
    }

    pub(crate) fn request_logout(&self) {
        if self.commands.send(CircuitCommand::Logout).is_err() {
            warn!("logout_request_dropped_circuit_closed");
        }
    }

    pub(crate) fn close(&self) {
        let _ = self.commands.send(CircuitCommand::Close);
    }
}

/// A stand-in region: a thread that streams message bursts into the viewer's inbound
/// queue and answers a logout request after a fixed latency.
#[derive(Debug)]
pub(crate) struct SimulatedCircuit {
    link: CircuitLink,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedCircuit {
    pub(crate) fn spawn(settings: CircuitSettings, inbound: Sender<Message>) -> io::Result<Self> {
        let (commands, receiver) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("circuit".to_string())
            .spawn(move || run_circuit(&settings, &inbound, &receiver))?;
        Ok(Self {
            link: CircuitLink { commands },
            thread: Some(thread),
        })
    }

    pub(crate) fn link(&self) -> CircuitLink {
        self.link.clone()
    }
}

impl Drop for SimulatedCircuit {
    fn drop(&mut self) {
        self.link.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("circuit_thread_panicked");
            }
        }
    }
}

fn run_circuit(
    settings: &CircuitSettings,
    inbound: &Sender<Message>,
    commands: &Receiver<CircuitCommand>,
) {
    let started_at = Instant::now();
    let burst_interval = Duration::from_millis(settings.burst_interval_ms.max(1));
    let logout_latency = Duration::from_millis(settings.logout_reply_latency_ms);
    let kick_at = settings
        .kick_after_secs
        .map(|secs| started_at + Duration::from_secs_f64(secs));
    let mut next_burst_at = started_at;
    let mut logout_reply_at: Option<Instant> = None;
    let mut sequence = 0u64;
    info!(
        burst_size = settings.burst_size,
        burst_interval_ms = settings.burst_interval_ms,
        "circuit_open"
    );

    loop {
        let wake_at = [Some(next_burst_at), logout_reply_at, kick_at]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(next_burst_at);
        match commands.recv_timeout(wake_at.saturating_duration_since(Instant::now())) {
            Ok(CircuitCommand::Logout) => {
                if logout_reply_at.is_none() {
                    debug!("circuit_logout_received");
                    logout_reply_at = Some(Instant::now() + logout_latency);
                }
            }
            Ok(CircuitCommand::Close) | Err(RecvTimeoutError::Disconnected) => {
                info!(messages_sent = sequence, "circuit_closed");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        if logout_reply_at.is_some_and(|at| now >= at) {
            let _ = inbound.send(Message::LogoutReply);
            info!(messages_sent = sequence, "circuit_logout_replied");
            return;
        }
        if kick_at.is_some_and(|at| now >= at) {
            let _ = inbound.send(Message::KickUser {
                reason: "simulated region shutdown".to_string(),
            });
            info!(messages_sent = sequence, "circuit_kicked_agent");
            return;
        }
        if now >= next_burst_at {
            for _ in 0..settings.burst_size {
                if inbound.send(region_message(sequence, settings)).is_err() {
                    return;
                }
                sequence += 1;
            }
            next_burst_at = now + burst_interval;
        }
    }
}

fn region_message(sequence: u64, settings: &CircuitSettings) -> Message {
    let hits = |every: u32| every > 0 && sequence % u64::from(every) == u64::from(every) - 1;
    if hits(settings.chat_every) {
        Message::ChatFromSimulator {
            from: "Region".to_string(),
            text: format!("ambient chatter #{sequence}"),
        }
    } else if hits(settings.image_every) {
        Message::ImageData {
            texture_id: (sequence % TEXTURE_ID_SPACE) as u32,
            codec_bytes: 2048 + (sequence % 7) as u32 * 1024,
        }
    } else {
        Message::ObjectUpdate {
            local_id: (sequence % OBJECT_ID_SPACE) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_settings() -> CircuitSettings {
        CircuitSettings {
            burst_interval_ms: 5,
            burst_size: 2,
            chat_every: 0,
            image_every: 0,
            logout_reply_latency_ms: 20,
            kick_after_secs: None,
        }
    }

    fn wait_for(receiver: &Receiver<Message>, wanted: &str) -> Option<Message> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match receiver.recv_timeout(Duration::from_millis(50)) {
                Ok(message) if message.tag() == wanted => return Some(message),
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }

    #[test]
    fn burst_mix_follows_the_configured_cadence() {
        let settings = CircuitSettings {
            chat_every: 5,
            image_every: 2,
            ..quiet_settings()
        };
        let tags = (0..10)
            .map(|sequence| region_message(sequence, &settings).tag().to_string())
            .collect::<Vec<_>>();

        assert_eq!(
            tags,
            [
                "ObjectUpdate",
                "ImageData",
                "ObjectUpdate",
                "ImageData",
                "ChatFromSimulator",
                "ImageData",
                "ObjectUpdate",
                "ImageData",
                "ObjectUpdate",
                "ChatFromSimulator",
            ]
        );
    }

    #[test]
    fn circuit_streams_updates_until_closed() {
        let (sender, receiver) = mpsc::channel();
        let circuit = SimulatedCircuit::spawn(quiet_settings(), sender).expect("spawn");

        assert!(wait_for(&receiver, "ObjectUpdate").is_some());
        drop(circuit);
        let _ = receiver.try_iter().count();
        assert_eq!(
            receiver.recv_timeout(Duration::from_millis(50)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn logout_request_is_answered_and_ends_the_circuit() {
        let (sender, receiver) = mpsc::channel();
        let circuit = SimulatedCircuit::spawn(quiet_settings(), sender).expect("spawn");

        circuit.link().request_logout();
        assert_eq!(wait_for(&receiver, "LogoutReply"), Some(Message::LogoutReply));
        assert!(wait_for(&receiver, "ObjectUpdate").is_none());
    }

    #[test]
    fn kick_is_delivered_after_the_configured_delay() {
        let (sender, receiver) = mpsc::channel();
        let settings = CircuitSettings {
            kick_after_secs: Some(0.02),
            ..quiet_settings()
        };
        let _circuit = SimulatedCircuit::spawn(settings, sender).expect("spawn");

        assert!(matches!(
            wait_for(&receiver, "KickUser"),
            Some(Message::KickUser { .. })
        ));
    }
}
