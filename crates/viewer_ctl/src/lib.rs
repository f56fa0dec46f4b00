use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_PORT: u16 = 47001;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETRY_MS: u64 = 100;
pub const DEFAULT_QUIET_MS: u64 = 250;
pub const PORT_ENV_VAR: &str = "VIEWER_CONTROL_PORT";
const MAX_RETRY_BACKOFF_MS: u64 = 1_000;
const READ_POLL: Duration = Duration::from_millis(100);
const CONTROL_PREFIX: &str = "C ";
const READY_PREFIX: &str = "viewer.ready v1 port:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub port: u16,
    pub timeout_ms: u64,
    pub retry_ms: u64,
    pub quiet_ms: u64,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_ms: DEFAULT_RETRY_MS,
            quiet_ms: DEFAULT_QUIET_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Connect and return once the viewer has announced itself.
    WaitReady,
    /// Send a raw control line and print replies until the port goes quiet.
    Send(String),
    Status,
    /// Ask the viewer to quit and wait for it to acknowledge.
    Quit,
}

/// Strips the control prefix. Lines without it are not replies and are ignored.
pub fn control_payload(raw: &str) -> Option<&str> {
    raw.trim_end_matches(['\r', '\n'])
        .strip_prefix(CONTROL_PREFIX)
}

pub fn is_ready_payload(payload: &str) -> bool {
    payload
        .strip_prefix(READY_PREFIX)
        .is_some_and(|port| port.parse::<u16>().is_ok())
}

/// Doubles from `retry_base` on every failed attempt, capped at one second.
pub fn backoff_delay(retry_base: Duration, attempt: u32) -> Duration {
    let base_ms = (retry_base.as_millis() as u64).max(1);
    let backoff_ms = base_ms
        .saturating_mul(1u64 << attempt.min(16))
        .min(MAX_RETRY_BACKOFF_MS);
    Duration::from_millis(backoff_ms)
}

/// Parses `[options] <subcommand> [args...]`. `Ok(None)` means help was requested.
pub fn parse_cli(
    args: &[String],
    default_port: u16,
) -> Result<Option<(Request, ClientOptions)>, String> {
    let mut options = ClientOptions {
        port: default_port,
        ..ClientOptions::default()
    };
    let mut rest = args;
    while let Some((flag, tail)) = rest.split_first() {
        let target = match flag.as_str() {
            "-h" | "--help" => return Ok(None),
            "--port" => None,
            "--timeout-ms" => Some(&mut options.timeout_ms),
            "--retry-ms" => Some(&mut options.retry_ms),
            "--quiet-ms" => Some(&mut options.quiet_ms),
            _ => break,
        };
        let value = tail
            .first()
            .ok_or_else(|| format!("missing value for {flag}"))?;
        match target {
            Some(slot) => {
                *slot = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid {flag} value '{value}' (expected u64)"))?;
            }
            None => {
                options.port = value
                    .parse::<u16>()
                    .map_err(|_| format!("invalid --port value '{value}' (expected u16)"))?;
            }
        }
        rest = &tail[1..];
    }

    let (subcommand, command_args) = rest
        .split_first()
        .ok_or_else(|| "missing subcommand".to_string())?;
    let no_args = |request: Request| {
        if command_args.is_empty() {
            Ok(request)
        } else {
            Err(format!("{subcommand} takes no arguments"))
        }
    };
    let request = match subcommand.as_str() {
        "wait-ready" => no_args(Request::WaitReady)?,
        "status" => no_args(Request::Status)?,
        "quit" => no_args(Request::Quit)?,
        "send" if command_args.is_empty() => {
            return Err("send requires a command payload".to_string())
        }
        "send" => Request::Send(command_args.join(" ")),
        other => return Err(format!("unknown subcommand '{other}'")),
    };
    Ok(Some((request, options)))
}

pub fn resolve_default_port(raw: Option<&str>) -> u16 {
    raw.and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub fn run<W: Write>(request: &Request, opts: ClientOptions, out: &mut W) -> Result<(), String> {
    let timeout = Duration::from_millis(opts.timeout_ms);
    let retry_base = Duration::from_millis(opts.retry_ms);
    let mut connection = Connection::open_when_ready(opts.port, timeout, retry_base)?;

    match request {
        Request::WaitReady => Ok(()),
        Request::Send(command) => {
            connection.send_line(command)?;
            connection.print_until_quiet(timeout, Duration::from_millis(opts.quiet_ms), out)
        }
        Request::Status => {
            connection.send_line("status")?;
            connection.print_until(timeout, out, |payload| {
                payload.starts_with("ok: status") || payload.starts_with("error:")
            })
        }
        Request::Quit => {
            connection.send_line("quit")?;
            connection.print_until(timeout, out, |payload| {
                payload.starts_with("ok: quit") || payload.starts_with("error:")
            })
        }
    }
}

enum ReadOutcome {
    Line(String),
    NoData,
    Disconnected,
    DeadlineExceeded,
    IoError(io::Error),
}

struct Connection {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
    partial: String,
}

impl Connection {
    fn open_when_ready(port: u16, timeout: Duration, retry_base: Duration) -> Result<Self, String> {
        let deadline = Instant::now() + timeout;
        let mut attempt = 0u32;

        loop {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
                let mut connection = Self::from_stream(stream)?;
                if connection.wait_for_ready(deadline)? {
                    return Ok(connection);
                }
            }

            let sleep_for = backoff_delay(retry_base, attempt);
            if Instant::now() + sleep_for >= deadline {
                return Err(format!(
                    "timed out waiting for viewer control port on 127.0.0.1:{port}"
                ));
            }
            thread::sleep(sleep_for);
            attempt = attempt.saturating_add(1);
        }
    }

    fn from_stream(writer: TcpStream) -> Result<Self, String> {
        writer
            .set_read_timeout(Some(READ_POLL))
            .map_err(|error| format!("failed to set socket read timeout: {error}"))?;
        let reader = writer
            .try_clone()
            .map_err(|error| format!("failed to clone socket stream: {error}"))?;
        Ok(Self {
            writer,
            reader: BufReader::new(reader),
            partial: String::new(),
        })
    }

    /// `Ok(false)` when the viewer hung up before announcing itself; the caller retries.
    fn wait_for_ready(&mut self, deadline: Instant) -> Result<bool, String> {
        loop {
            match self.read_line(deadline) {
                ReadOutcome::Line(raw) => {
                    if control_payload(&raw).is_some_and(is_ready_payload) {
                        return Ok(true);
                    }
                }
                ReadOutcome::NoData => {}
                ReadOutcome::Disconnected => return Ok(false),
                ReadOutcome::DeadlineExceeded => {
                    return Err("timed out waiting for viewer ready line".to_string())
                }
                ReadOutcome::IoError(error) => {
                    return Err(format!("socket read error while waiting for ready: {error}"))
                }
            }
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), String> {
        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line.as_bytes());
        payload.push(b'\n');
        self.writer
            .write_all(&payload)
            .and_then(|()| self.writer.flush())
            .map_err(|error| format!("failed to send command: {error}"))
    }

    fn print_until<W, F>(&mut self, timeout: Duration, out: &mut W, done: F) -> Result<(), String>
    where
        W: Write,
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            match self.read_line(deadline) {
                ReadOutcome::Line(raw) => {
                    if let Some(payload) = control_payload(&raw) {
                        print_payload(out, payload);
                        if done(payload) {
                            return Ok(());
                        }
                    }
                }
                ReadOutcome::NoData => {}
                ReadOutcome::Disconnected => {
                    return Err("viewer closed the control port before replying".to_string())
                }
                ReadOutcome::DeadlineExceeded => {
                    return Err("timed out waiting for the viewer to reply".to_string())
                }
                ReadOutcome::IoError(error) => {
                    return Err(format!("socket read error while waiting for reply: {error}"))
                }
            }
        }
    }

    fn print_until_quiet<W: Write>(
        &mut self,
        timeout: Duration,
        quiet_window: Duration,
        out: &mut W,
    ) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        let mut last_line_at: Option<Instant> = None;

        loop {
            match self.read_line(deadline) {
                ReadOutcome::Line(raw) => {
                    if let Some(payload) = control_payload(&raw) {
                        print_payload(out, payload);
                    }
                    last_line_at = Some(Instant::now());
                }
                ReadOutcome::NoData => {
                    let now = Instant::now();
                    let quiet = match last_line_at {
                        Some(at) => now.saturating_duration_since(at) >= quiet_window,
                        None => now + quiet_window >= deadline,
                    };
                    if quiet {
                        return Ok(());
                    }
                }
                ReadOutcome::Disconnected | ReadOutcome::DeadlineExceeded => return Ok(()),
                ReadOutcome::IoError(error) => {
                    return Err(format!(
                        "socket read error while waiting for command output: {error}"
                    ))
                }
            }
        }
    }

    fn read_line(&mut self, deadline: Instant) -> ReadOutcome {
        if Instant::now() >= deadline {
            return ReadOutcome::DeadlineExceeded;
        }
        match self.reader.read_line(&mut self.partial) {
            Ok(0) => ReadOutcome::Disconnected,
            Ok(_) if self.partial.ends_with('\n') => {
                ReadOutcome::Line(std::mem::take(&mut self.partial))
            }
            Ok(_) => ReadOutcome::NoData,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                ReadOutcome::NoData
            }
            Err(error) => ReadOutcome::IoError(error),
        }
    }
}

fn print_payload<W: Write>(out: &mut W, payload: &str) {
    let _ = writeln!(out, "{payload}");
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    /// A one-client stand-in for the viewer: announces readiness, then answers each
    /// command with the scripted reply lines.
    fn fake_viewer(
        replies: Vec<(&'static str, Vec<&'static str>)>,
    ) -> (u16, thread::JoinHandle<()>) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            writeln!(stream, "C viewer.ready v1 port:{port}").expect("ready");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            for (expected, lines) in replies {
                let mut command = String::new();
                reader.read_line(&mut command).expect("command");
                assert_eq!(command.trim_end(), expected);
                for line in lines {
                    writeln!(stream, "{line}").expect("reply");
                }
            }
        });
        (port, handle)
    }

    fn options_for(port: u16) -> ClientOptions {
        ClientOptions {
            port,
            timeout_ms: 3_000,
            retry_ms: 10,
            quiet_ms: 100,
        }
    }

    #[test]
    fn control_payload_requires_the_prefix_and_strips_crlf() {
        assert_eq!(control_payload("C ok: sync\r\n"), Some("ok: sync"));
        assert_eq!(control_payload("ok: sync\n"), None);
        assert_eq!(control_payload("T frame 1\n"), None);
    }

    #[test]
    fn ready_payload_needs_a_port_number() {
        assert!(is_ready_payload("viewer.ready v1 port:47001"));
        assert!(!is_ready_payload("viewer.ready v1 port:"));
        assert!(!is_ready_payload("ok: sync"));
    }

    #[test]
    fn backoff_doubles_and_caps_at_one_second() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(base, 40), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(Duration::ZERO, 0), Duration::from_millis(1));
    }

    #[test]
    fn cli_parses_options_then_subcommand() {
        let (request, options) = parse_cli(
            &args(&["--port", "47010", "--timeout-ms", "900", "send", "upload", "3"]),
            DEFAULT_PORT,
        )
        .expect("parse")
        .expect("not help");

        assert_eq!(request, Request::Send("upload 3".to_string()));
        assert_eq!(options.port, 47010);
        assert_eq!(options.timeout_ms, 900);
        assert_eq!(options.retry_ms, DEFAULT_RETRY_MS);
    }

    #[test]
    fn cli_rejects_bad_input() {
        assert_eq!(parse_cli(&args(&["--help"]), DEFAULT_PORT), Ok(None));
        assert!(parse_cli(&args(&[]), DEFAULT_PORT).is_err());
        assert!(parse_cli(&args(&["--port", "huge", "status"]), DEFAULT_PORT).is_err());
        assert!(parse_cli(&args(&["--retry-ms"]), DEFAULT_PORT).is_err());
        assert!(parse_cli(&args(&["status", "now"]), DEFAULT_PORT).is_err());
        assert!(parse_cli(&args(&["send"]), DEFAULT_PORT).is_err());
        assert!(parse_cli(&args(&["teleport"]), DEFAULT_PORT).is_err());
    }

    #[test]
    fn default_port_comes_from_the_environment_value() {
        assert_eq!(resolve_default_port(None), DEFAULT_PORT);
        assert_eq!(resolve_default_port(Some("47005")), 47005);
        assert_eq!(resolve_default_port(Some("nope")), DEFAULT_PORT);
    }

    #[test]
    fn status_prints_control_replies_up_to_the_status_line() {
        let (port, server) = fake_viewer(vec![(
            "status",
            vec!["T frame 12", "C ok: status session:1 objects:4"],
        )]);
        let mut out = Vec::new();

        run(&Request::Status, options_for(port), &mut out).expect("status");
        server.join().expect("server");

        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "ok: status session:1 objects:4\n"
        );
    }

    #[test]
    fn quit_waits_for_the_acknowledgement() {
        let (port, server) = fake_viewer(vec![("quit", vec!["C ok: quit requested"])]);
        let mut out = Vec::new();

        run(&Request::Quit, options_for(port), &mut out).expect("quit");
        server.join().expect("server");

        assert_eq!(String::from_utf8(out).expect("utf8"), "ok: quit requested\n");
    }

    #[test]
    fn send_prints_replies_until_the_port_is_quiet() {
        let (port, server) = fake_viewer(vec![(
            "upload 2",
            vec!["C ok: uploads pending:2", "C ok: sync"],
        )]);
        let mut out = Vec::new();

        run(
            &Request::Send("upload 2".to_string()),
            options_for(port),
            &mut out,
        )
        .expect("send");
        server.join().expect("server");

        assert_eq!(
            String::from_utf8(out).expect("utf8"),
            "ok: uploads pending:2\nok: sync\n"
        );
    }

    #[test]
    fn wait_ready_times_out_when_nothing_listens() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let options = ClientOptions {
            timeout_ms: 200,
            ..options_for(port)
        };
        let err = run(&Request::WaitReady, options, &mut Vec::new()).expect_err("timeout");
        assert!(err.contains("timed out"), "{err}");
    }
}
