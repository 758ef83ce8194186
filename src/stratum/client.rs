//! Session and protocol engine for the three stratum dialects.
//!
//! All socket, timer, and protocol state lives in a single actor task on a
//! dedicated I/O thread running a current-thread tokio runtime, so every
//! handler is serialized and the id=1/2/3 chain cannot interleave. A lone
//! reader task owns the read half of the socket; there is never more than
//! one outstanding read.

use std::sync::Arc;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::stratum::difficulty::{diff_to_target, MIN_DIFFICULTY};
use crate::stratum::message::{looks_like_frame, Id, Message};
use crate::stratum::{ClientError, ClientEvent, Dialect, EndPoint, SecureLevel};
use crate::types::{nonce_hex, H256};
use crate::work::{Solution, WorkPackage};

/// Applied to connect, TLS handshake, and writes; readiness-based I/O has
/// no use for SO_RCVTIMEO/SO_SNDTIMEO, so the bound lives at the call
/// sites instead.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const HASHRATE_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Advertised in the ethereum-stratum subscribe and echoed to
    /// `client.get_version`.
    pub version: String,
    /// Disconnect when no work arrives for this long.
    pub work_timeout: Duration,
    /// Disconnect when a solution submit gets no response for this long.
    pub response_timeout: Duration,
    /// Forward `eth_submitHashrate` reports to the pool.
    pub report_hashrate: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            version: format!("progminer/{}", env!("CARGO_PKG_VERSION")),
            work_timeout: Duration::from_secs(180),
            response_timeout: Duration::from_secs(2),
            report_hashrate: false,
        }
    }
}

enum Command {
    Connect,
    Disconnect,
    Submit(Solution),
    SubmitHashrate(String),
    Shutdown,
}

/// Handle to the client actor. The supervisor drives exactly this surface:
/// connect, disconnect, submit, submit_hashrate.
pub struct StratumClient {
    cmd_tx: mpsc::Sender<Command>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl StratumClient {
    /// Spawn the I/O thread and its actor. The actor starts disconnected;
    /// nothing touches the network until [`connect`](Self::connect).
    pub fn spawn(
        endpoint: EndPoint,
        config: ClientConfig,
        events: crossbeam_channel::Sender<ClientEvent>,
    ) -> Result<StratumClient> {
        ensure_crypto_provider();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let io_thread = thread::Builder::new()
            .name("stratum-io".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("stratum I/O runtime should build");
                runtime.block_on(ClientActor::new(endpoint, config, events, cmd_rx).run());
            })
            .context("failed to spawn stratum I/O thread")?;
        Ok(StratumClient {
            cmd_tx,
            io_thread: Some(io_thread),
        })
    }

    pub fn connect(&self) {
        let _ = self.cmd_tx.blocking_send(Command::Connect);
    }

    pub fn disconnect(&self) {
        let _ = self.cmd_tx.blocking_send(Command::Disconnect);
    }

    pub fn submit(&self, solution: Solution) {
        let _ = self.cmd_tx.blocking_send(Command::Submit(solution));
    }

    /// Rate is the pre-formatted `0x…` hex string the wire wants.
    pub fn submit_hashrate(&self, rate: String) {
        let _ = self.cmd_tx.blocking_send(Command::SubmitHashrate(rate));
    }
}

impl Drop for StratumClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.blocking_send(Command::Shutdown);
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }
}

pub(crate) fn ensure_crypto_provider() {
    static INSTALLED: LazyLock<bool> = LazyLock::new(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .is_ok()
    });
    let _ = *INSTALLED;
}

enum Incoming {
    Frame(Message),
    Eof,
    Error(std::io::Error),
}

struct Conn {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    incoming_rx: mpsc::Receiver<Incoming>,
    reader_task: tokio::task::JoinHandle<()>,
}

enum Step {
    Command(Option<Command>),
    Incoming(Option<Incoming>),
    WorkTimeout,
    ResponseTimeout,
    HashrateDue,
}

struct ClientActor {
    endpoint: EndPoint,
    config: ClientConfig,
    events: crossbeam_channel::Sender<ClientEvent>,
    cmd_rx: mpsc::Receiver<Command>,

    conn: Option<Conn>,
    connected: bool,
    authorized: bool,
    /// Worker name carved off the ethproxy user at the first `.`.
    worker: String,
    current: WorkPackage,
    next_work_difficulty: f64,
    extra_nonce: [u8; 8],
    extra_nonce_hex_size: usize,
    response_pending: bool,
    stale: bool,
    rate: String,
    session_id: String,

    work_deadline: Option<Instant>,
    response_deadline: Option<Instant>,
    hashrate_deadline: Option<Instant>,
}

impl ClientActor {
    fn new(
        endpoint: EndPoint,
        config: ClientConfig,
        events: crossbeam_channel::Sender<ClientEvent>,
        cmd_rx: mpsc::Receiver<Command>,
    ) -> ClientActor {
        let session_bytes: [u8; 32] = rand::random();
        ClientActor {
            endpoint,
            config,
            events,
            cmd_rx,
            conn: None,
            connected: false,
            authorized: false,
            worker: String::new(),
            current: WorkPackage::default(),
            next_work_difficulty: 1.0,
            extra_nonce: [0u8; 8],
            extra_nonce_hex_size: 0,
            response_pending: false,
            stale: false,
            rate: String::new(),
            session_id: hex::encode(session_bytes),
            work_deadline: None,
            response_deadline: None,
            hashrate_deadline: None,
        }
    }

    async fn run(mut self) {
        loop {
            let work_deadline = self.work_deadline;
            let response_deadline = self.response_deadline;
            let hashrate_deadline = self.hashrate_deadline;
            let step = {
                let cmd_rx = &mut self.cmd_rx;
                let incoming = self.conn.as_mut().map(|conn| &mut conn.incoming_rx);
                tokio::select! {
                    cmd = cmd_rx.recv() => Step::Command(cmd),
                    frame = async {
                        match incoming {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => Step::Incoming(frame),
                    _ = sleep_opt(work_deadline) => Step::WorkTimeout,
                    _ = sleep_opt(response_deadline) => Step::ResponseTimeout,
                    _ = sleep_opt(hashrate_deadline) => Step::HashrateDue,
                }
            };

            match step {
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => {
                    self.teardown();
                    break;
                }
                Step::Command(Some(Command::Connect)) => self.do_connect().await,
                Step::Command(Some(Command::Disconnect)) => self.disconnect(),
                Step::Command(Some(Command::Submit(solution))) => {
                    self.submit_solution(solution).await;
                }
                Step::Command(Some(Command::SubmitHashrate(rate))) => {
                    if self.config.report_hashrate && self.connected {
                        self.rate = rate;
                        self.hashrate_deadline = Some(Instant::now() + HASHRATE_DEBOUNCE);
                    }
                }
                Step::Incoming(Some(Incoming::Frame(message))) => {
                    self.process_message(message).await;
                }
                Step::Incoming(Some(Incoming::Eof)) | Step::Incoming(None) => {
                    if self.connected {
                        warn!(pool = %self.endpoint, "Connection closed by pool");
                        self.disconnect();
                    }
                }
                Step::Incoming(Some(Incoming::Error(err))) => {
                    if self.connected {
                        warn!(pool = %self.endpoint, "Read response failed: {err}");
                        self.disconnect();
                    }
                }
                Step::WorkTimeout => {
                    warn!(
                        "No new work received in {} seconds.",
                        self.config.work_timeout.as_secs()
                    );
                    self.disconnect();
                }
                Step::ResponseTimeout => {
                    warn!(
                        "No response received in {:.1} seconds.",
                        self.config.response_timeout.as_secs_f64()
                    );
                    self.disconnect();
                }
                Step::HashrateDue => {
                    self.hashrate_deadline = None;
                    self.send_hashrate().await;
                }
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader_task.abort();
        }
        self.connected = false;
    }

    /// Drops the socket, cancels every timer, and notifies the supervisor.
    fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.reader_task.abort();
        }
        self.work_deadline = None;
        self.response_deadline = None;
        self.hashrate_deadline = None;
        self.response_pending = false;
        self.authorized = false;
        self.connected = false;
        let _ = self.events.send(ClientEvent::Disconnected);
    }

    async fn do_connect(&mut self) {
        if self.connected {
            return;
        }
        match self.open_connection().await {
            Ok(()) => {
                self.connected = true;
                self.authorized = false;
                self.response_pending = false;
                self.stale = false;
                let _ = self.events.send(ClientEvent::Connected);
                self.reset_work_timeout();
                self.send_subscribe().await;
            }
            Err(err) => {
                warn!(pool = %self.endpoint, "Could not connect to stratum server: {err}");
                self.disconnect();
            }
        }
    }

    async fn open_connection(&mut self) -> Result<(), ClientError> {
        let address = (self.endpoint.host.as_str(), self.endpoint.port);
        let tcp = timeout(SOCKET_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| ClientError::ConnectTimeout)??;
        tcp.set_nodelay(true)?;

        let (read_half, write_half): (
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        ) = if self.endpoint.secure == SecureLevel::None {
            let (r, w) = tcp.into_split();
            (Box::new(r), Box::new(w))
        } else {
            let tls_config = build_tls_config(self.endpoint.secure)?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = ServerName::try_from(self.endpoint.host.clone())
                .map_err(|err| ClientError::Tls(format!("invalid TLS server name: {err}")))?;
            let handshake = timeout(SOCKET_TIMEOUT, connector.connect(server_name, tcp))
                .await
                .map_err(|_| ClientError::ConnectTimeout)?;
            let tls = match handshake {
                Ok(tls) => tls,
                Err(err) => {
                    warn!("SSL/TLS handshake failed: {err}");
                    if format!("{err}").to_lowercase().contains("certificate") {
                        warn!("This can have multiple reasons:");
                        warn!("* Root certs are either not installed or not found");
                        warn!("* Pool uses a self-signed certificate");
                        warn!("Possible fixes:");
                        warn!("* Make sure the file '/etc/ssl/certs/ca-certificates.crt' exists and is accessible");
                        warn!("* Export the correct path via 'export SSL_CERT_FILE=/etc/ssl/certs/ca-certificates.crt'");
                        warn!("* Disable certificate verification with an ssl:// transport");
                    }
                    return Err(ClientError::Tls(err.to_string()));
                }
            };
            let (r, w) = tokio::io::split(tls);
            (Box::new(r), Box::new(w))
        };

        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let dialect = self.endpoint.dialect;
        let reader_task = tokio::spawn(read_loop(read_half, dialect, incoming_tx));
        self.conn = Some(Conn {
            writer: write_half,
            incoming_rx,
            reader_task,
        });
        Ok(())
    }

    async fn send_subscribe(&mut self) {
        let payload = match self.endpoint.dialect {
            Dialect::Stratum => {
                // Optimistic until the id=3 result lands.
                self.authorized = true;
                json!({"id": 1, "method": "mining.subscribe", "params": []})
            }
            Dialect::EthProxy => {
                let (login, worker) = match self.endpoint.user.split_once('.') {
                    Some((login, worker)) => (login.to_string(), worker.to_string()),
                    None => (self.endpoint.user.clone(), String::new()),
                };
                self.worker = worker;
                let params = match &self.endpoint.email {
                    Some(email) => json!([login, email]),
                    None => json!([login]),
                };
                json!({
                    "id": 1,
                    "worker": self.worker,
                    "method": "eth_submitLogin",
                    "params": params,
                })
            }
            Dialect::EthereumStratum => {
                self.authorized = true;
                json!({
                    "id": 1,
                    "method": "mining.subscribe",
                    "params": [self.config.version, "EthereumStratum/1.0.0"],
                })
            }
        };
        self.send_json(&payload).await;
    }

    async fn send_json(&mut self, payload: &Value) {
        let mut line = payload.to_string();
        line.push('\n');
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let write = async {
            conn.writer.write_all(line.as_bytes()).await?;
            conn.writer.flush().await
        };
        match timeout(SOCKET_TIMEOUT, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("Write to pool failed: {err}");
                self.disconnect();
            }
            Err(_) => {
                warn!("Write to pool timed out");
                self.disconnect();
            }
        }
    }

    async fn process_message(&mut self, message: Message) {
        match message {
            Message::Response { id, result, error } => {
                if let Some(err) = &error {
                    info!("{}", err.message);
                }
                let Id::Number(id) = id else {
                    return;
                };
                match id {
                    1 => self.on_subscribe_response(result).await,
                    2 => {}
                    3 => self.on_authorize_response(result),
                    4 => self.on_submit_response(result),
                    other => self.on_unsolicited_response(other, result),
                }
            }
            Message::Notification { method, params } => {
                self.on_notification(Id::Null, &method, &params).await;
            }
            Message::Request { id, method, params } => {
                self.on_notification(id, &method, &params).await;
            }
        }
    }

    async fn on_subscribe_response(&mut self, result: Option<Value>) {
        match self.endpoint.dialect {
            Dialect::EthereumStratum => {
                self.next_work_difficulty = 1.0;
                if let Some(extranonce) = result
                    .as_ref()
                    .and_then(Value::as_array)
                    .and_then(|items| items.get(1))
                    .and_then(Value::as_str)
                {
                    self.process_extranonce(extranonce);
                }
                self.send_json(&json!({
                    "id": 2,
                    "method": "mining.extranonce.subscribe",
                    "params": [],
                }))
                .await;
                self.send_authorize().await;
            }
            Dialect::Stratum => {
                info!("Subscribed to stratum server");
                self.send_authorize().await;
            }
            Dialect::EthProxy => {
                self.authorized = true;
                // Not strictly required but it speeds up initialization.
                self.send_json(&json!({"id": 5, "method": "eth_getWork", "params": []}))
                    .await;
            }
        }
    }

    async fn send_authorize(&mut self) {
        self.send_json(&json!({
            "id": 3,
            "method": "mining.authorize",
            "params": [self.endpoint.user, self.endpoint.pass],
        }))
        .await;
    }

    fn on_authorize_response(&mut self, result: Option<Value>) {
        self.authorized = result.as_ref().and_then(Value::as_bool).unwrap_or(false);
        if !self.authorized {
            warn!(user = %self.endpoint.user, "Worker not authorized");
            self.disconnect();
            return;
        }
        info!(user = %self.endpoint.user, "Authorized worker");
    }

    fn on_submit_response(&mut self, result: Option<Value>) {
        self.response_deadline = None;
        self.response_pending = false;
        let accepted = result.as_ref().and_then(Value::as_bool).unwrap_or(false);
        let event = if accepted {
            ClientEvent::SolutionAccepted { stale: self.stale }
        } else {
            ClientEvent::SolutionRejected { stale: self.stale }
        };
        let _ = self.events.send(event);
    }

    /// ethproxy delivers work as the `result` of `eth_getWork` (id=5 on the
    /// kickstart, arbitrary ids when pushed).
    fn on_unsolicited_response(&mut self, _id: u64, result: Option<Value>) {
        if self.endpoint.dialect != Dialect::EthProxy {
            return;
        }
        if let Some(params) = result.filter(|value| value.is_array()) {
            self.on_notify(&params);
        }
    }

    async fn on_notification(&mut self, id: Id, method: &str, params: &Value) {
        match method {
            "mining.notify" if self.endpoint.dialect != Dialect::EthProxy => {
                self.on_notify(params);
            }
            "mining.set_difficulty" if self.endpoint.dialect == Dialect::EthereumStratum => {
                if let Some(difficulty) = params
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(Value::as_f64)
                {
                    self.next_work_difficulty = difficulty.max(MIN_DIFFICULTY);
                    info!("Difficulty set to {}", self.next_work_difficulty);
                }
            }
            "mining.set_extranonce" if self.endpoint.dialect == Dialect::EthereumStratum => {
                if let Some(extranonce) = params
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(Value::as_str)
                {
                    self.process_extranonce(extranonce);
                }
            }
            "client.get_version" => {
                let version = self.config.version.clone();
                self.send_json(&json!({
                    "error": null,
                    "id": id,
                    "result": version,
                }))
                .await;
            }
            other => debug!(method = other, "Ignoring unknown notification"),
        }
    }

    fn process_extranonce(&mut self, extranonce: &str) {
        if extranonce.len() > 16 {
            warn!("Ignoring oversized extranonce '{extranonce}'");
            return;
        }
        info!("Extranonce set to {extranonce}");
        self.extra_nonce_hex_size = extranonce.len();
        let mut padded = extranonce.to_string();
        while padded.len() < 16 {
            padded.push('0');
        }
        match hex::decode(&padded) {
            Ok(bytes) => self.extra_nonce.copy_from_slice(&bytes),
            Err(err) => warn!("Ignoring malformed extranonce '{extranonce}': {err}"),
        }
    }

    fn on_notify(&mut self, params: &Value) {
        let Some(items) = params.as_array() else {
            return;
        };
        let text = |index: usize| items.get(index).and_then(Value::as_str).unwrap_or("");

        if self.response_pending {
            self.stale = true;
        }

        if self.endpoint.dialect == Dialect::EthereumStratum {
            let job = text(0);
            let seed = text(1);
            let header = text(2);
            let height = parse_height(items.get(3));
            if header.is_empty() || seed.is_empty() {
                return;
            }
            self.reset_work_timeout();

            let (Ok(header), Ok(seed)) = (header.parse::<H256>(), seed.parse::<H256>()) else {
                warn!("Malformed mining.notify hashes");
                return;
            };
            let Some(epoch) = progpow_spec::to_epoch(&seed.0) else {
                warn!(%seed, "Pool sent a seed hash outside the known epoch schedule");
                return;
            };

            let mut padded_job = job.to_string();
            while padded_job.len() < 64 {
                padded_job.push('0');
            }
            let work = WorkPackage {
                header,
                seed,
                epoch,
                boundary: diff_to_target(self.next_work_difficulty),
                height,
                job: padded_job,
                job_len: job.len(),
                start_nonce: u64::from_be_bytes(self.extra_nonce),
                extra_size_bits: (self.extra_nonce_hex_size * 4) as i32,
            };
            // Same change guard as the other dialects, widened so a
            // difficulty retarget still republishes.
            if work.header != self.current.header
                || work.epoch != self.current.epoch
                || work.boundary != self.current.boundary
            {
                self.current = work.clone();
                let _ = self.events.send(ClientEvent::WorkReceived(work));
            }
            return;
        }

        let base = if self.endpoint.dialect == Dialect::EthProxy {
            0
        } else {
            1
        };
        let job = text(0).to_string();
        let header = text(base);
        let seed = text(base + 1);
        let mut share_target = text(base + 2).to_string();
        let height = parse_height(items.get(base + 3));

        // coinmine.pl fix: zero-pad targets shortened below 66 chars.
        if !share_target.is_empty() && share_target.len() < 66 {
            let digits = share_target
                .strip_prefix("0x")
                .unwrap_or(&share_target)
                .to_string();
            if digits.len() <= 64 {
                share_target = format!("0x{}{}", "0".repeat(64 - digits.len()), digits);
            }
        }

        if header.is_empty() || seed.is_empty() || share_target.is_empty() {
            return;
        }
        let (Ok(header), Ok(seed), Ok(boundary)) = (
            header.parse::<H256>(),
            seed.parse::<H256>(),
            share_target.parse::<H256>(),
        ) else {
            warn!("Malformed mining.notify hashes");
            return;
        };
        if header == self.current.header {
            return;
        }
        self.reset_work_timeout();

        let Some(epoch) = progpow_spec::to_epoch(&seed.0) else {
            warn!(%seed, "Pool sent a seed hash outside the known epoch schedule");
            return;
        };
        let job_len = job.len();
        let work = WorkPackage {
            header,
            seed,
            epoch,
            boundary,
            height,
            job,
            job_len,
            start_nonce: 0,
            extra_size_bits: -1,
        };
        self.current = work.clone();
        let _ = self.events.send(ClientEvent::WorkReceived(work));
    }

    async fn submit_solution(&mut self, solution: Solution) {
        if !self.connected || !self.authorized {
            warn!("Not connected or not authorized; dropping solution submission");
            return;
        }
        self.response_deadline = None;

        let nonce = nonce_hex(solution.nonce);
        let payload = match self.endpoint.dialect {
            Dialect::Stratum => json!({
                "id": 4,
                "method": "mining.submit",
                "params": [
                    self.endpoint.user,
                    solution.work.job,
                    format!("0x{nonce}"),
                    format!("0x{}", solution.work.header.hex()),
                    format!("0x{}", solution.mix_hash.hex()),
                ],
            }),
            Dialect::EthProxy => json!({
                "id": 4,
                "worker": self.worker,
                "method": "eth_submitWork",
                "params": [
                    format!("0x{nonce}"),
                    format!("0x{}", solution.work.header.hex()),
                    format!("0x{}", solution.mix_hash.hex()),
                ],
            }),
            Dialect::EthereumStratum => {
                let job = &solution.work.job[..solution.work.job_len.min(solution.work.job.len())];
                // Strip the pool-assigned prefix off the nonce.
                let nonce_tail = &nonce[self.extra_nonce_hex_size.min(16)..];
                json!({
                    "id": 4,
                    "method": "mining.submit",
                    "params": [self.endpoint.user, job, nonce_tail],
                })
            }
        };
        self.stale = solution.stale;
        self.send_json(&payload).await;
        if self.connected {
            self.response_pending = true;
            self.response_deadline = Some(Instant::now() + self.config.response_timeout);
        }
    }

    async fn send_hashrate(&mut self) {
        if !self.connected || self.rate.is_empty() {
            return;
        }
        let payload = json!({
            "id": 6,
            "jsonrpc": "2.0",
            "method": "eth_submitHashrate",
            "params": [self.rate, format!("0x{}", self.session_id)],
        });
        self.send_json(&payload).await;
    }

    fn reset_work_timeout(&mut self) {
        self.work_deadline = Some(Instant::now() + self.config.work_timeout);
    }
}

fn parse_height(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => {
            let s = s.as_str();
            match s.strip_prefix("0x") {
                Some(hex_digits) => u64::from_str_radix(hex_digits, 16).unwrap_or(0),
                None => s.parse().unwrap_or(0),
            }
        }
        _ => 0,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The read pipeline: one task, one outstanding read, frames filtered
/// before they reach the actor.
async fn read_loop(
    read_half: Box<dyn AsyncRead + Send + Unpin>,
    dialect: Dialect,
    tx: mpsc::Sender<Incoming>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                let _ = tx.send(Incoming::Eof).await;
                break;
            }
            Ok(_) => {
                let frame = line.trim_end_matches(['\r', '\n']);
                if !looks_like_frame(frame) {
                    if dialect != Dialect::EthProxy {
                        warn!("Discarding incomplete response");
                    }
                    continue;
                }
                match serde_json::from_str::<Message>(frame) {
                    Ok(message) => {
                        if tx.send(Incoming::Frame(message)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Parse response failed: {err}"),
                }
            }
            Err(err) => {
                let _ = tx.send(Incoming::Error(err)).await;
                break;
            }
        }
    }
}

fn build_tls_config(secure: SecureLevel) -> Result<rustls::ClientConfig, ClientError> {
    if secure == SecureLevel::AllowSelfSigned {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .ok_or_else(|| ClientError::Tls("no rustls crypto provider installed".into()))?;
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification(provider)))
            .with_no_client_auth();
        return Ok(config);
    }

    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        warn!("Failed to load a CA certificate: {error}");
    }
    for cert in loaded.certs {
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        warn!("No CA certificates loaded. Either '/etc/ssl/certs/ca-certificates.crt' does not exist");
        warn!("or SSL_CERT_FILE points at an invalid or inaccessible file.");
        warn!("Certificate verification is likely to fail.");
    }

    let config = if secure == SecureLevel::Tls12 {
        rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(config)
}

/// Peer verification bypass for `ssl://` pools on self-signed certs.
#[derive(Debug)]
struct NoCertificateVerification(Arc<rustls::crypto::CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
