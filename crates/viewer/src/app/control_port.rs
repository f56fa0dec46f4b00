use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};

use tracing::{info, warn};

const CONTROL_ENV_VAR: &str = "VIEWER_CONTROL";
const CONTROL_PORT_ENV_VAR: &str = "VIEWER_CONTROL_PORT";
pub(crate) const CONTROL_DEFAULT_PORT: u16 = 47001;
const CONTROL_PREFIX: &str = "C ";
const MAX_PENDING_BYTES_PER_CLIENT: usize = 64 * 1024;
const MAX_LINE_BYTES: usize = 4 * 1024;
const MAX_READ_BYTES_PER_POLL: usize = 64 * 1024;

/// Commands accepted over the control port. Each is fed through the session's message
/// queue, so it takes effect in message order like anything else the region sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlCommand {
    Quit,
    AbortQuit,
    Disconnect,
    Status,
    Sync,
    DialogOpen,
    DialogClose,
    FloaterOpen,
    FloaterClose,
    Blur,
    Focus,
    Upload(u32),
}

impl ControlCommand {
    pub(crate) fn parse(line: &str) -> Result<Self, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Err("empty command".to_string());
        };
        let command = match verb {
            "quit" => Self::Quit,
            "abort_quit" => Self::AbortQuit,
            "disconnect" => Self::Disconnect,
            "status" => Self::Status,
            "sync" => Self::Sync,
            "dialog_open" => Self::DialogOpen,
            "dialog_close" => Self::DialogClose,
            "floater_open" => Self::FloaterOpen,
            "floater_close" => Self::FloaterClose,
            "blur" => Self::Blur,
            "focus" => Self::Focus,
            "upload" => {
                let count = match words.next() {
                    None => 1,
                    Some(raw) => raw
                        .parse::<u32>()
                        .map_err(|_| format!("upload count must be a number (got `{raw}`)"))?,
                };
                Self::Upload(count)
            }
            other => return Err(format!("unknown command `{other}`")),
        };
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument `{extra}` for `{verb}`"));
        }
        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ControlPortConfig {
    enabled: bool,
    port: u16,
}

impl ControlPortConfig {
    fn from_env() -> Self {
        let enabled = parse_enabled_flag(std::env::var(CONTROL_ENV_VAR).ok().as_deref());
        let raw_port = std::env::var(CONTROL_PORT_ENV_VAR).ok();
        Self {
            enabled,
            port: parse_port_or_default(raw_port.as_deref()),
        }
    }
}

/// Optional localhost line transport for driving a headless viewer from scripts.
#[derive(Debug)]
pub(crate) struct ControlPort {
    transport: Option<TcpControlTransport>,
}

#[derive(Debug)]
struct TcpControlTransport {
    listener: TcpListener,
    bound_port: u16,
    clients: Vec<ClientConn>,
}

#[derive(Debug)]
struct ClientConn {
    stream: TcpStream,
    read_buf: Vec<u8>,
    outbound: Vec<u8>,
}

impl ControlPort {
    pub(crate) fn from_env() -> Self {
        let config = ControlPortConfig::from_env();
        if !config.enabled {
            return Self::disabled();
        }
        match TcpControlTransport::bind_localhost(config.port) {
            Ok(transport) => {
                info!(line = %ready_line_text(transport.bound_port), "control_port_ready");
                Self {
                    transport: Some(transport),
                }
            }
            Err(err) => {
                warn!(error = %err, port = config.port, "control_port_bind_failed_disabled");
                Self::disabled()
            }
        }
    }

    pub(crate) fn disabled() -> Self {
        Self { transport: None }
    }

    pub(crate) fn bound_port(&self) -> Option<u16> {
        self.transport.as_ref().map(|transport| transport.bound_port)
    }

    pub(crate) fn poll_lines(&mut self, out: &mut Vec<String>) {
        if let Some(transport) = &mut self.transport {
            transport.poll_lines(out);
        }
    }

    pub(crate) fn send_lines(&mut self, lines: &[String]) {
        if let Some(transport) = &mut self.transport {
            transport.send_lines(lines);
        }
    }
}

impl TcpControlTransport {
    fn bind_localhost(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(localhost_bind_addr(port))?;
        listener.set_nonblocking(true)?;
        let bound_port = listener.local_addr()?.port();
        Ok(Self {
            listener,
            bound_port,
            clients: Vec::new(),
        })
    }

    fn poll_lines(&mut self, out: &mut Vec<String>) {
        self.accept_pending_clients();
        self.read_client_lines(out);
        self.flush_clients();
    }

    fn accept_pending_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!(error = %err, "control_client_nonblocking_failed");
                        continue;
                    }
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(error = %err, "control_client_nodelay_failed");
                    }
                    let mut client = ClientConn {
                        stream,
                        read_buf: Vec::new(),
                        outbound: Vec::new(),
                    };
                    client.enqueue_line(&ready_line_text(self.bound_port));
                    self.clients.push(client);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "control_accept_failed");
                    break;
                }
            }
        }
    }

    fn read_client_lines(&mut self, out: &mut Vec<String>) {
        self.clients.retain_mut(|client| {
            let mut chunk = [0u8; 1024];
            let mut read_this_poll = 0usize;
            // A chatty client resumes on the next frame.
            while read_this_poll < MAX_READ_BYTES_PER_POLL {
                match client.stream.read(&mut chunk) {
                    Ok(0) => return false,
                    Ok(bytes_read) => {
                        read_this_poll += bytes_read;
                        client.read_buf.extend_from_slice(&chunk[..bytes_read]);
                        drain_complete_lines(&mut client.read_buf, out);
                        if client.read_buf.len() > MAX_LINE_BYTES {
                            warn!(
                                buffered_bytes = client.read_buf.len(),
                                "control_client_line_too_long"
                            );
                            return false;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(err) => {
                        warn!(error = %err, "control_client_read_failed");
                        return false;
                    }
                }
            }
            true
        });
    }

    fn send_lines(&mut self, lines: &[String]) {
        for client in &mut self.clients {
            for line in lines {
                client.enqueue_line(line);
            }
        }
        self.flush_clients();
    }

    fn flush_clients(&mut self) {
        self.clients.retain_mut(|client| match client.flush() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "control_client_write_failed");
                false
            }
        });
    }
}

impl ClientConn {
    fn enqueue_line(&mut self, line: &str) {
        let payload = encode_control_payload(line);
        if self.outbound.len().saturating_add(payload.len()) > MAX_PENDING_BYTES_PER_CLIENT {
            warn!(
                pending_bytes = self.outbound.len(),
                "control_reply_dropped_client_backlog"
            );
            return;
        }
        self.outbound.extend_from_slice(&payload);
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "control_write_zero",
                    ))
                }
                Ok(written) => {
                    self.outbound.drain(..written);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

fn localhost_bind_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn parse_enabled_flag(raw: Option<&str>) -> bool {
    matches!(raw, Some("1"))
}

fn parse_port_or_default(raw: Option<&str>) -> u16 {
    match raw {
        None => CONTROL_DEFAULT_PORT,
        Some(value) => value.parse::<u16>().unwrap_or_else(|_| {
            warn!(
                value,
                fallback_port = CONTROL_DEFAULT_PORT,
                "control_port_invalid_using_default"
            );
            CONTROL_DEFAULT_PORT
        }),
    }
}

fn drain_complete_lines(buffer: &mut Vec<u8>, out: &mut Vec<String>) {
    while let Some(newline_index) = buffer.iter().position(|byte| *byte == b'\n') {
        let mut line_bytes = buffer.drain(..=newline_index).collect::<Vec<u8>>();
        line_bytes.pop();
        if line_bytes.last().copied() == Some(b'\r') {
            line_bytes.pop();
        }

        match String::from_utf8(line_bytes) {
            Ok(line) => {
                // Clients may echo the control prefix back; accept both forms.
                let line = line.strip_prefix(CONTROL_PREFIX).unwrap_or(&line).trim();
                if !line.is_empty() {
                    out.push(line.to_string());
                }
            }
            Err(err) => warn!(error = %err, "control_invalid_utf8_line_dropped"),
        }
    }
}

fn encode_control_payload(line: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CONTROL_PREFIX.len() + line.len() + 1);
    payload.extend_from_slice(CONTROL_PREFIX.as_bytes());
    payload.extend_from_slice(line.as_bytes());
    payload.push(b'\n');
    payload
}

pub(crate) fn ready_line_text(port: u16) -> String {
    format!("viewer.ready v1 port:{port}")
}
