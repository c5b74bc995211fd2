//! DriveLink: ASCII serial link to the external servo driver.
//!
//! Two reply disciplines, chosen by [`DriveMode`]:
//!
//! - **Sync**: `send_command` writes one line and blocks (bounded by the
//!   port timeout) for one reply line.
//! - **Async**: a receive worker owns a cloned port handle, splits the
//!   byte stream on `\n` and hands every trimmed line to the callback.
//!   `send_command` returns [`Reply::Deferred`].
//!
//! In both modes each received line is classified by the grammar: alarm
//! lines raise the shared `ALARM` interlock, query replies update
//! [`DriveStatus`].

pub mod grammar;
pub mod port;

use blitz_common::machine::config::{DriveConfig, DriveMode};
use blitz_common::machine::error::MachineError;
use blitz_common::machine::interlock::{Interlock, InterlockState};
use blitz_common::machine::types::MotionCommand;
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use grammar::{DriveEvent, DriveGrammar, PlaceholderGrammar};
pub use port::{LinePort, MemoryLine, SerialLine};

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Sync mode: the reply line, trimmed.
    Line(String),
    /// Async mode: the reply will reach the line callback.
    Deferred,
}

/// Called with every line the receive worker reads.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Last known drive status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriveStatus {
    pub connected: bool,
    pub position_mm: Option<f64>,
    pub alarm: bool,
    pub moving: bool,
    pub last_line: Option<String>,
}

/// Bookkeeping of deferred `?MOV` replies. Replies to queries sent before
/// the latest move command describe the previous move and are dropped.
#[derive(Debug, Default)]
struct MovingReplies {
    outstanding: u32,
    stale: u32,
}

impl MovingReplies {
    fn accept(&mut self) -> bool {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.stale > 0 {
            self.stale -= 1;
            return false;
        }
        true
    }
}

/// State shared between the link and its receive worker.
struct LineContext {
    grammar: Arc<dyn DriveGrammar>,
    interlocks: Arc<InterlockState>,
    status: Mutex<DriveStatus>,
    moving_replies: Mutex<MovingReplies>,
    callback: Mutex<Option<LineCallback>>,
}

impl LineContext {
    fn begin_motion(&self) {
        let mut replies = self.moving_replies.lock();
        replies.stale = replies.outstanding;
        self.status.lock().moving = true;
    }

    fn ingest(&self, line: &str) {
        match self.grammar.classify(line) {
            DriveEvent::Alarm(text) => {
                if self.interlocks.raise(Interlock::ALARM) {
                    warn!("Drive alarm: {text}");
                }
                self.status.lock().alarm = true;
            }
            DriveEvent::Position(mm) => self.status.lock().position_mm = Some(mm),
            DriveEvent::AlarmState(active) => {
                self.status.lock().alarm = active;
                if active && self.interlocks.raise(Interlock::ALARM) {
                    warn!("Drive reports alarm state");
                }
            }
            DriveEvent::Moving(moving) => {
                if self.moving_replies.lock().accept() {
                    self.status.lock().moving = moving;
                }
            }
            DriveEvent::Other => {}
        }
        self.status.lock().last_line = Some(line.to_string());

        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            cb(line);
        }
    }
}

/// Receive worker with explicit stop/join.
struct ReceiveWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveWorker {
    fn spawn(port: Box<dyn LinePort>, ctx: Arc<LineContext>) -> Result<Self, MachineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("drive-rx".to_string())
            .spawn(move || receive_loop(port, &flag, &ctx))
            .map_err(|e| MachineError::Transport(format!("spawn drive receiver: {e}")))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Drive receive worker panicked");
            }
        }
    }
}

impl Drop for ReceiveWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(mut port: Box<dyn LinePort>, stop: &AtomicBool, ctx: &LineContext) {
    debug!("Drive receive worker started");
    let mut buf: Vec<u8> = Vec::with_capacity(256);
    let mut chunk = [0u8; 128];

    while !stop.load(Ordering::Acquire) {
        match port.read(&mut chunk) {
            Ok(0) => thread::sleep(Duration::from_millis(20)),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                for line in drain_lines(&mut buf) {
                    ctx.ingest(&line);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Drive link read failed: {e}");
                ctx.status.lock().connected = false;
                break;
            }
        }
    }
    debug!("Drive receive worker stopped");
}

/// Remove every complete line from `buf`, trimmed, skipping empty ones.
fn drain_lines(buf: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

/// Serial link to the servo driver.
pub struct DriveLink {
    port: Option<Box<dyn LinePort>>,
    mode: DriveMode,
    timeout: Duration,
    pending: Vec<u8>,
    ctx: Arc<LineContext>,
    worker: Option<ReceiveWorker>,
}

impl DriveLink {
    /// Open the configured port, start the receiver in async mode and push
    /// the configured speed/acceleration.
    pub fn connect(
        settings: &DriveConfig,
        interlocks: Arc<InterlockState>,
    ) -> Result<Self, MachineError> {
        let timeout = Duration::from_millis(settings.timeout_ms);
        let port = SerialLine::open(&settings.port, settings.baud, timeout)?;
        info!(
            "Drive link on {} @ {} baud ({:?})",
            settings.port, settings.baud, settings.mode
        );

        let mut link = Self::with_port(Box::new(port), settings.mode, timeout, interlocks);
        link.start()?;
        if let Some(speed) = settings.speed_mm_s {
            link.set_speed(speed);
        }
        if let Some(accel) = settings.accel_mm_s2 {
            link.set_acceleration(accel);
        }
        Ok(link)
    }

    /// Wrap an open port. Call [`start`](Self::start) for async mode.
    pub fn with_port(
        port: Box<dyn LinePort>,
        mode: DriveMode,
        timeout: Duration,
        interlocks: Arc<InterlockState>,
    ) -> Self {
        Self {
            port: Some(port),
            mode,
            timeout,
            pending: Vec::new(),
            ctx: Arc::new(LineContext {
                grammar: Arc::new(PlaceholderGrammar),
                interlocks,
                status: Mutex::new(DriveStatus {
                    connected: true,
                    ..DriveStatus::default()
                }),
                moving_replies: Mutex::new(MovingReplies::default()),
                callback: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// Replace the command grammar. Only before `start`.
    pub fn with_grammar(mut self, grammar: Arc<dyn DriveGrammar>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.grammar = grammar;
        } else {
            warn!("Drive grammar cannot change while the receiver runs");
        }
        self
    }

    /// Install the per-line callback used in async mode.
    pub fn set_line_callback(&self, callback: LineCallback) {
        *self.ctx.callback.lock() = Some(callback);
    }

    pub fn mode(&self) -> DriveMode {
        self.mode
    }

    /// Start the receive worker (async mode only; no-op otherwise).
    pub fn start(&mut self) -> Result<(), MachineError> {
        if self.mode != DriveMode::Async || self.worker.is_some() {
            return Ok(());
        }
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| MachineError::Transport("drive not connected".to_string()))?;
        let reader = port.try_clone_line()?;
        self.worker = Some(ReceiveWorker::spawn(reader, Arc::clone(&self.ctx))?);
        Ok(())
    }

    /// Stop and join the receive worker.
    pub fn stop_receiver(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.port.is_some() && self.ctx.status.lock().connected
    }

    pub fn status(&self) -> DriveStatus {
        self.ctx.status.lock().clone()
    }

    /// Send one command line. `\r\n` is appended unless already present.
    pub fn send_command(&mut self, text: &str) -> Result<Reply, MachineError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| MachineError::Transport("drive not connected".to_string()))?;

        let mut line = text.trim_end_matches(['\r', '\n']).to_string();
        line.push_str("\r\n");

        if let Err(e) = port.write_all(line.as_bytes()).and_then(|()| port.flush()) {
            self.mark_disconnected(&e.to_string());
            return Err(e.into());
        }
        debug!("drive <- {}", line.trim_end());

        match self.mode {
            DriveMode::Async => Ok(Reply::Deferred),
            DriveMode::Sync => {
                let reply = self.read_line()?;
                debug!("drive -> {reply}");
                self.ctx.ingest(&reply);
                Ok(Reply::Line(reply))
            }
        }
    }

    fn read_line(&mut self) -> Result<String, MachineError> {
        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; 128];
        loop {
            if let Some(line) = drain_lines(&mut self.pending).into_iter().next() {
                return Ok(line);
            }
            if Instant::now() >= deadline {
                return Err(MachineError::Protocol("no reply from drive".to_string()));
            }
            let Some(port) = self.port.as_mut() else {
                return Err(MachineError::Transport("drive not connected".to_string()));
            };
            match port.read(&mut chunk) {
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
                Err(e) => {
                    self.mark_disconnected(&e.to_string());
                    return Err(e.into());
                }
            }
        }
    }

    fn mark_disconnected(&self, reason: &str) {
        let mut status = self.ctx.status.lock();
        if status.connected {
            warn!("Drive link lost: {reason}");
        }
        status.connected = false;
    }

    /// Send and judge acceptance: any non-empty reply, or a deferred one.
    fn accepted(&mut self, command: &str) -> bool {
        match self.send_command(command) {
            Ok(Reply::Line(line)) => !line.is_empty(),
            Ok(Reply::Deferred) => true,
            Err(e) => {
                debug!("drive command {command:?} failed: {e}");
                false
            }
        }
    }

    fn query(&mut self, command: &str) -> Option<String> {
        match self.send_command(command) {
            Ok(Reply::Line(line)) => {
                Some(self.ctx.grammar.reply_value(&line).to_string())
            }
            Ok(Reply::Deferred) => None,
            Err(e) => {
                debug!("drive query {command:?} failed: {e}");
                None
            }
        }
    }

    // ── Typed commands ──────────────────────────────────────────────

    pub fn move_absolute(&mut self, position_mm: f64, speed_mm_s: f64) -> bool {
        let cmd = self.ctx.grammar.move_absolute(position_mm, speed_mm_s);
        let ok = self.accepted(&cmd);
        if ok {
            self.ctx.begin_motion();
        }
        ok
    }

    /// Execute a positioning request: acceleration first when the command
    /// carries one, then the absolute move.
    pub fn submit(&mut self, command: &MotionCommand) -> bool {
        if let Some(accel) = command.accel_mm_s2 {
            if !self.set_acceleration(accel) {
                return false;
            }
        }
        self.move_absolute(command.target_mm, command.speed_mm_s)
    }

    pub fn move_relative(&mut self, distance_mm: f64, speed_mm_s: f64) -> bool {
        let cmd = self.ctx.grammar.move_relative(distance_mm, speed_mm_s);
        let ok = self.accepted(&cmd);
        if ok {
            self.ctx.begin_motion();
        }
        ok
    }

    pub fn stop(&mut self) -> bool {
        let cmd = self.ctx.grammar.stop();
        let ok = self.accepted(&cmd);
        if ok {
            self.ctx.status.lock().moving = false;
        }
        ok
    }

    pub fn home(&mut self, speed_mm_s: f64) -> bool {
        let cmd = self.ctx.grammar.home(speed_mm_s);
        let ok = self.accepted(&cmd);
        if ok {
            self.ctx.begin_motion();
        }
        ok
    }

    /// Clears the drive alarm and the `ALARM` interlock on acceptance.
    pub fn clear_alarm(&mut self) -> bool {
        let cmd = self.ctx.grammar.clear_alarm();
        let ok = self.accepted(&cmd);
        if ok {
            self.ctx.status.lock().alarm = false;
            self.ctx.interlocks.clear(Interlock::ALARM);
        }
        ok
    }

    pub fn reset(&mut self) -> bool {
        let cmd = self.ctx.grammar.reset();
        let ok = self.accepted(&cmd);
        if ok {
            let mut status = self.ctx.status.lock();
            status.alarm = false;
            status.moving = false;
        }
        ok
    }

    pub fn set_speed(&mut self, speed_mm_s: f64) -> bool {
        let cmd = self.ctx.grammar.set_speed(speed_mm_s);
        self.accepted(&cmd)
    }

    pub fn set_acceleration(&mut self, accel_mm_s2: f64) -> bool {
        let cmd = self.ctx.grammar.set_acceleration(accel_mm_s2);
        self.accepted(&cmd)
    }

    /// `None` when the link is down, the reply is unparsable, or the
    /// reply is deferred to the receive worker.
    pub fn read_position(&mut self) -> Option<f64> {
        let cmd = self.ctx.grammar.query_position();
        let value: f64 = self.query(&cmd)?.parse().ok()?;
        self.ctx.status.lock().position_mm = Some(value);
        Some(value)
    }

    pub fn read_alarm(&mut self) -> Option<bool> {
        let cmd = self.ctx.grammar.query_alarm();
        let raw: i64 = self.query(&cmd)?.parse().ok()?;
        Some(raw != 0)
    }

    pub fn query_moving(&mut self) -> Option<bool> {
        let cmd = self.ctx.grammar.query_moving();
        if self.worker.is_some() {
            self.ctx.moving_replies.lock().outstanding += 1;
        }
        let raw: i64 = self.query(&cmd)?.parse().ok()?;
        let moving = raw != 0;
        self.ctx.status.lock().moving = moving;
        Some(moving)
    }

    /// Refresh position and motion state; true while a move is in progress.
    ///
    /// In async mode the queries are only sent and their replies reach
    /// [`DriveStatus`] through the receive worker, so the answer lags one
    /// poll behind. A sync query without a usable reply counts as moving.
    pub fn poll_motion(&mut self) -> bool {
        self.read_position();
        let moving = self.query_moving();
        match self.mode {
            DriveMode::Sync => moving.unwrap_or(true),
            DriveMode::Async => self.status().moving,
        }
    }

    /// Stop the receiver and release the port. Idempotent.
    pub fn close(&mut self) {
        self.stop_receiver();
        if let Some(port) = self.port.take() {
            info!("Drive link {} closed", port.name());
        }
        self.ctx.status.lock().connected = false;
    }
}

impl Drop for DriveLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sync_link(line: &MemoryLine) -> (DriveLink, Arc<InterlockState>) {
        let interlocks = Arc::new(InterlockState::new());
        let link = DriveLink::with_port(
            Box::new(line.clone()),
            DriveMode::Sync,
            Duration::from_millis(100),
            Arc::clone(&interlocks),
        );
        (link, interlocks)
    }

    fn echo_drive() -> MemoryLine {
        MemoryLine::with_responder(|cmd| match cmd {
            "?POS" => Some("POS=1234.56".to_string()),
            "?ALM" => Some("ALM=1".to_string()),
            "?MOV" => Some("0".to_string()),
            _ => Some("OK".to_string()),
        })
    }

    #[test]
    fn appends_crlf_once() {
        let line = echo_drive();
        let (mut link, _) = sync_link(&line);
        link.send_command("ST").unwrap();
        link.send_command("RESET\r\n").unwrap();
        link.send_command("CLRALM\n").unwrap();
        assert_eq!(line.written(), vec!["ST", "RESET", "CLRALM"]);
    }

    #[test]
    fn sync_reply_is_returned() {
        let line = echo_drive();
        let (mut link, _) = sync_link(&line);
        assert_eq!(link.send_command("ST").unwrap(), Reply::Line("OK".to_string()));
    }

    #[test]
    fn typed_queries_parse_values() {
        let line = echo_drive();
        let (mut link, interlocks) = sync_link(&line);

        assert_eq!(link.read_position(), Some(1234.56));
        assert_eq!(link.query_moving(), Some(false));
        assert_eq!(link.read_alarm(), Some(true));
        assert!(interlocks.alarm());

        assert!(link.clear_alarm());
        assert!(!interlocks.alarm());

        let status = link.status();
        assert_eq!(status.position_mm, Some(1234.56));
        assert!(!status.alarm);
        assert!(status.connected);
    }

    #[test]
    fn placeholder_commands_on_the_wire() {
        let line = echo_drive();
        let (mut link, _) = sync_link(&line);
        assert!(link.move_absolute(1000.5, 500.0));
        assert!(link.status().moving);
        assert!(link.stop());
        assert!(!link.status().moving);
        assert!(link.set_speed(800.0));
        assert_eq!(
            line.written(),
            vec!["PA 1000.500 500.0", "ST", "SPEED 800.0"]
        );
    }

    #[test]
    fn silent_drive_is_a_protocol_error() {
        let line = MemoryLine::new();
        let (mut link, _) = sync_link(&line);
        assert!(matches!(
            link.send_command("ST"),
            Err(MachineError::Protocol(_))
        ));
        assert!(!link.move_absolute(300.0, 100.0));
        assert!(link.is_connected(), "a missing reply does not drop the link");
    }

    #[test]
    fn broken_pipe_disconnects() {
        let line = echo_drive();
        let (mut link, _) = sync_link(&line);
        line.hang_up();
        assert!(matches!(
            link.send_command("ST"),
            Err(MachineError::Transport(_))
        ));
        assert!(!link.is_connected());
    }

    #[test]
    fn async_worker_delivers_lines_and_flags_alarm() {
        let line = MemoryLine::new();
        let interlocks = Arc::new(InterlockState::new());
        let mut link = DriveLink::with_port(
            Box::new(line.clone()),
            DriveMode::Async,
            Duration::from_millis(100),
            Arc::clone(&interlocks),
        );
        let (tx, rx) = mpsc::channel::<String>();
        let tx = Mutex::new(tx);
        link.set_line_callback(Arc::new(move |l: &str| {
            let _ = tx.lock().send(l.to_string());
        }));
        link.start().unwrap();
        assert!(link.is_receiving());

        assert_eq!(link.send_command("?POS").unwrap(), Reply::Deferred);

        line.push_bytes(b"POS=12");
        line.push_bytes(b"5.5\r\n\r\nALARM 7 overload\n");

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, "POS=125.5");
        assert_eq!(second, "ALARM 7 overload");
        assert!(interlocks.alarm());
        assert_eq!(link.status().position_mm, Some(125.5));

        link.close();
        assert!(!link.is_receiving());
        assert!(!link.is_connected());
    }

    fn async_link(line: &MemoryLine) -> DriveLink {
        let mut link = DriveLink::with_port(
            Box::new(line.clone()),
            DriveMode::Async,
            Duration::from_millis(100),
            Arc::new(InterlockState::new()),
        );
        link.start().unwrap();
        link
    }

    #[test]
    fn async_poll_sends_queries_and_follows_worker() {
        let line = MemoryLine::with_responder(|cmd| match cmd {
            "?POS" => Some("POS=1800.5".to_string()),
            "?MOV" => Some("MOV=0".to_string()),
            _ => None,
        });
        let mut link = async_link(&line);

        assert!(link.move_absolute(2000.0, 1000.0));
        assert!(link.status().moving);
        link.poll_motion();

        assert!(wait_until(|| !link.status().moving));
        assert!(!link.poll_motion());
        assert_eq!(link.status().position_mm, Some(1800.5));
        assert_eq!(
            line.written()[..3],
            ["PA 2000.000 1000.0", "?POS", "?MOV"].map(String::from)
        );
        link.close();
    }

    fn wait_until(done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[test]
    fn stale_moving_reply_does_not_end_new_move() {
        let line = MemoryLine::new();
        let mut link = async_link(&line);

        assert_eq!(link.query_moving(), None);
        assert!(link.move_absolute(700.0, 300.0));
        line.push_line("MOV=0");
        assert!(wait_until(|| link.status().last_line.is_some()));
        assert!(link.status().moving, "reply predates the move");

        link.query_moving();
        line.push_line("MOV=0");
        assert!(wait_until(|| !link.status().moving));
        link.close();
    }

    #[test]
    fn sync_poll_reads_position_and_motion() {
        let line = echo_drive();
        let (mut link, _) = sync_link(&line);
        assert!(!link.poll_motion());
        assert_eq!(link.status().position_mm, Some(1234.56));

        let silent = MemoryLine::new();
        let (mut link, _) = sync_link(&silent);
        assert!(link.poll_motion(), "no answer keeps the move open");
    }

    #[test]
    fn submit_sends_acceleration_before_move() {
        let line = echo_drive();
        let (mut link, _) = sync_link(&line);
        assert!(link.submit(&MotionCommand::new(900.0, 400.0)));
        let cmd = MotionCommand {
            accel_mm_s2: Some(2500.0),
            ..MotionCommand::new(1100.0, 400.0)
        };
        assert!(link.submit(&cmd));
        assert_eq!(
            line.written(),
            vec!["PA 900.000 400.0", "ACCEL 2500.0", "PA 1100.000 400.0"]
        );
    }

    #[test]
    fn drain_lines_keeps_partial_tail() {
        let mut buf = b"A=1\r\n\nB".to_vec();
        assert_eq!(drain_lines(&mut buf), vec!["A=1"]);
        assert_eq!(buf, b"B");
    }
}
