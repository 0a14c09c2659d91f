//! In-process stand-in for the Python worker, plugged in through [`WorkerSpawner`].
//!
//! Speaks the same line protocol over in-memory pipes: `IDLE` before every
//! command, busy states for top-level commands, `sock_uuid`-tagged replies
//! for socket commands, and `{"source", "err"}` reports on stderr.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::worker::{SpawnError, WorkerIo, WorkerProcess, WorkerSpawnConfig, WorkerSpawner};

const PIPE_SIZE: usize = 64 * 1024;
const LOCAL_ADDRESS: &str = "00:11:22:33:44:55";
pub(crate) const PEER_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
const DEBUG_LINE: &str = "DEBUG bluetooth: polling adapter hci0";

/// Behaviour of every fake worker a [`FakeSpawner`] starts.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeScript {
    devices: Vec<Value>,
    names: HashMap<String, String>,
    services: Vec<Value>,
    session_ids: VecDeque<String>,
    receives: HashMap<String, (String, Duration)>,
    failing: HashSet<String>,
    accept_limit: Option<usize>,
    silent: bool,
    debug_noise: bool,
}

impl FakeScript {
    pub fn with_device(mut self, address: &str, name: &str, class_code: u32) -> Self {
        self.devices
            .push(json!({"address": address, "name": name, "classCode": class_code}));
        self
    }

    pub fn with_name(mut self, address: &str, name: &str) -> Self {
        self.names.insert(address.to_string(), name.to_string());
        self
    }

    pub fn with_service(mut self, host: &str, name: &str, port: u16) -> Self {
        self.services.push(json!({
            "host": host,
            "name": name,
            "description": null,
            "provider": null,
            "protocol": "RFCOMM",
            "port": port,
            "service-classes": ["1101"],
            "profiles": [["1101", 258]],
            "service-id": null
        }));
        self
    }

    /// Ids handed out, in order, by `sock_new` and `sock_accept`.
    pub fn with_session_ids<'a>(mut self, ids: impl IntoIterator<Item = &'a str>) -> Self {
        self.session_ids.extend(ids.into_iter().map(str::to_string));
        self
    }

    /// Payload returned by `sock_receive` on `id`, after `delay`.
    pub fn with_receive(mut self, id: &str, data: &str, delay: Duration) -> Self {
        self.receives
            .insert(id.to_string(), (data.to_string(), delay));
        self
    }

    /// Make a top-level command fail with a `main` error report.
    pub fn failing_command(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Refuse `sock_accept` after this many connections per socket.
    pub fn with_accept_limit(mut self, limit: usize) -> Self {
        self.accept_limit = Some(limit);
        self
    }

    /// Print a non-JSON debug line on stdout and stderr before every message.
    pub fn with_debug_noise(mut self) -> Self {
        self.debug_noise = true;
        self
    }

    /// Never report any state.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }
}

#[derive(Default)]
struct Shared {
    commands: StdMutex<Vec<String>>,
    sent: StdMutex<HashMap<String, Vec<String>>>,
    current: StdMutex<Option<CancellationToken>>,
}

pub(crate) struct FakeSpawner {
    script: FakeScript,
    spawned: AtomicUsize,
    shared: Arc<Shared>,
}

impl FakeSpawner {
    pub fn new(script: FakeScript) -> Self {
        Self {
            script,
            spawned: AtomicUsize::new(0),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Every command line received, across all workers.
    pub fn commands(&self) -> Vec<String> {
        self.shared.commands.lock().unwrap().clone()
    }

    /// Payloads passed to `sock_send` for one session.
    pub fn sent_data(&self, id: &str) -> Vec<String> {
        self.shared
            .sent
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Simulate the worker process dying.
    pub fn kill_current(&self) {
        if let Some(token) = self.shared.current.lock().unwrap().as_ref() {
            token.cancel();
        }
    }
}

#[async_trait]
impl WorkerSpawner for FakeSpawner {
    async fn spawn(&self, _config: &WorkerSpawnConfig) -> Result<WorkerIo, SpawnError> {
        let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let (stdin_host, stdin_worker) = tokio::io::duplex(PIPE_SIZE);
        let (stdout_worker, stdout_host) = tokio::io::duplex(PIPE_SIZE);
        let (stderr_worker, stderr_host) = tokio::io::duplex(PIPE_SIZE);

        let kill = CancellationToken::new();
        *self.shared.current.lock().unwrap() = Some(kill.clone());
        let (exit_tx, exit_rx) = watch::channel(None);

        let worker = FakeWorker::new(self.script.clone(), Arc::clone(&self.shared), stdout_worker, stderr_worker);
        let token = kill.clone();
        tokio::spawn(async move {
            let code = worker.run(stdin_worker, token).await;
            let _ = exit_tx.send(Some(code));
        });

        Ok(WorkerIo {
            stdin: Box::new(stdin_host),
            stdout: Box::new(stdout_host),
            stderr: Box::new(stderr_host),
            process: Box::new(FakeProcess {
                id: 1000 + n as u32,
                kill,
                exit: exit_rx,
            }),
        })
    }
}

struct FakeProcess {
    id: u32,
    kill: CancellationToken,
    exit: watch::Receiver<Option<i32>>,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.id)
    }

    fn is_alive(&mut self) -> bool {
        self.exit.borrow().is_none() && self.exit.has_changed().is_ok()
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        match self.exit.wait_for(|code| code.is_some()).await {
            Ok(code) => Ok(*code),
            Err(_) => Ok(None),
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.kill.cancel();
        self.wait().await.map(|_| ())
    }
}

struct FakeSocket {
    port: Option<u16>,
    accepted: usize,
}

struct FakeWorker {
    script: FakeScript,
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<String>,
    err: mpsc::UnboundedSender<String>,
    pipes: Vec<JoinHandle<()>>,
    delayed: JoinSet<()>,
    sockets: HashMap<String, FakeSocket>,
}

fn pipe(mut stream: DuplexStream) -> (mpsc::UnboundedSender<String>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if stream.write_all(line.as_bytes()).await.is_err()
                || stream.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
        let _ = stream.shutdown().await;
    });
    (tx, task)
}

impl FakeWorker {
    fn new(script: FakeScript, shared: Arc<Shared>, stdout: DuplexStream, stderr: DuplexStream) -> Self {
        let (out, out_task) = pipe(stdout);
        let (err, err_task) = pipe(stderr);
        Self {
            script,
            shared,
            out,
            err,
            pipes: vec![out_task, err_task],
            delayed: JoinSet::new(),
            sockets: HashMap::new(),
        }
    }

    async fn run(mut self, stdin: DuplexStream, kill: CancellationToken) -> i32 {
        let code = self.serve(stdin, &kill).await;

        self.delayed.shutdown().await;
        let FakeWorker { out, err, pipes, .. } = self;
        drop(out);
        drop(err);
        for pipe in pipes {
            let _ = pipe.await;
        }
        code
    }

    async fn serve(&mut self, stdin: DuplexStream, kill: &CancellationToken) -> i32 {
        let mut lines = BufReader::new(stdin).lines();
        if !self.script.silent {
            let _ = self.out.send("fake worker starting".to_string());
        }
        loop {
            self.state("IDLE");
            let line = tokio::select! {
                _ = kill.cancelled() => return -9,
                line = lines.next_line() => line,
            };
            let Ok(Some(line)) = line else {
                return 0;
            };
            let line = line.trim().to_string();
            self.shared.commands.lock().unwrap().push(line.clone());

            let Ok(Value::Object(cmd)) = serde_json::from_str::<Value>(&line) else {
                self.error("main", "invalid command line");
                continue;
            };
            let name = cmd.get("cmd").and_then(Value::as_str).unwrap_or_default().to_string();

            if self.script.failing.contains(&name) {
                if let Some(state) = busy_state(&name) {
                    self.state(state);
                }
                let source = match arg(&cmd, "sock_uuid") {
                    Some(id) => format!("BluetoothSocketActor[{id}]"),
                    None => "main".to_string(),
                };
                self.error(&source, &format!("{name} failed"));
                continue;
            }

            match name.as_str() {
                "scan" => {
                    self.state("SCANNING");
                    self.emit(json!({"scan_res": self.script.devices}));
                }
                "lookup" => {
                    self.state("LOOKING_UP");
                    let address = arg(&cmd, "address").unwrap_or_default();
                    match self.script.names.get(address) {
                        Some(found) => self.emit(json!({"lookup_res": found})),
                        None => self.emit(json!({
                            "lookup_res": null,
                            "errName": "BluetoothError",
                            "errArgs": ["device not reachable"]
                        })),
                    }
                }
                "find_services" => {
                    self.state("FINDING_SERVICES");
                    let name_filter = arg(&cmd, "name");
                    let address_filter = arg(&cmd, "address");
                    let found: Vec<Value> = self
                        .script
                        .services
                        .iter()
                        .filter(|s| name_filter.is_none_or(|n| s["name"] == n))
                        .filter(|s| address_filter.is_none_or(|a| s["host"] == a))
                        .cloned()
                        .collect();
                    self.emit(json!({"find_services_res": found}));
                }
                "get_available_port" => {
                    self.state("GETTING_AVAILABLE_PORT");
                    self.emit(json!({"available_port": 1}));
                }
                "get_active_actors" => {
                    self.state("GETTING_ACTIVE_ACTORS");
                    let mut actors: Vec<String> = self
                        .sockets
                        .keys()
                        .map(|id| format!("BluetoothSocketActor[{id}]"))
                        .collect();
                    actors.sort();
                    self.emit(json!({"active_actors_res": actors}));
                }
                "sock_new" => {
                    self.state("CREATING_SOCKET");
                    match arg(&cmd, "protocol") {
                        Some("RFCOMM") | Some("L2CAP") => {
                            let id = self.mint_id();
                            self.sockets.insert(id.clone(), FakeSocket { port: None, accepted: 0 });
                            self.emit(json!({"new_socket_uuid": id}));
                        }
                        other => self.error("main", &format!("unsupported protocol {other:?}")),
                    }
                }
                "terminate" => {
                    self.state("TERMINATED");
                    return 0;
                }
                sock if sock.starts_with("sock_") => self.socket_command(sock, &cmd),
                other => self.error("main", &format!("unsupported operation: {other}")),
            }
        }
    }

    fn socket_command(&mut self, name: &str, cmd: &Map<String, Value>) {
        let Some(id) = arg(cmd, "sock_uuid").map(str::to_string) else {
            self.error("main", "missing sock_uuid");
            return;
        };
        let source = format!("BluetoothSocketActor[{id}]");
        let accept_limit = self.script.accept_limit;
        let Some(socket) = self.sockets.get_mut(&id) else {
            self.error(&source, &format!("unknown socket: '{id}'"));
            return;
        };

        match name {
            "sock_bind" => {
                socket.port = Some(arg(cmd, "port").and_then(|p| p.parse().ok()).unwrap_or(1));
                self.ack(&id, "bind_res");
            }
            "sock_listen" => self.ack(&id, "listen_res"),
            "sock_connect" => self.ack(&id, "connect_res"),
            "sock_shutdown" => self.ack(&id, "shutdown_res"),
            "sock_set_l2cap_mtu" => self.ack(&id, "set_l2cap_mtu_res"),
            "sock_advertise_service" => self.ack(&id, "advertise_service_res"),
            "sock_stop_advertising" => self.ack(&id, "stop_advertising_res"),
            "sock_accept" => {
                if accept_limit.is_some_and(|limit| socket.accepted >= limit) {
                    self.error(&source, "BluetoothError: accept refused");
                    return;
                }
                socket.accepted += 1;
                let child = self.mint_id();
                self.sockets.insert(child.clone(), FakeSocket { port: None, accepted: 0 });
                self.emit(json!({
                    "sock_uuid": id,
                    "accept_res": child,
                    "accept_res_address": [PEER_ADDRESS, 1]
                }));
            }
            "sock_send" => {
                let data = arg(cmd, "data").unwrap_or_default().to_string();
                self.shared
                    .sent
                    .lock()
                    .unwrap()
                    .entry(id.clone())
                    .or_default()
                    .push(data);
                self.ack(&id, "sent_res");
            }
            "sock_receive" => match self.script.receives.get(&id).cloned() {
                Some((data, delay)) => {
                    let out = self.out.clone();
                    let noise = self.script.debug_noise;
                    self.delayed.spawn(async move {
                        tokio::time::sleep(delay).await;
                        // Python's len(): characters, not bytes.
                        let size = data.chars().count();
                        let reply = json!({"sock_uuid": id, "receive_res": data, "size": size});
                        if noise {
                            let _ = out.send(DEBUG_LINE.to_string());
                        }
                        let _ = out.send(reply.to_string());
                    });
                }
                None => self.error(&source, "BluetoothError: (104, 'Connection reset by peer')"),
            },
            "sock_get_local_address" => {
                let port = socket.port.unwrap_or(1);
                self.emit(json!({
                    "sock_uuid": id,
                    "sock_local_address": LOCAL_ADDRESS,
                    "sock_local_port": port
                }));
            }
            "sock_get_remote_address" => self.emit(json!({
                "sock_uuid": id,
                "sock_remote_address": PEER_ADDRESS,
                "sock_remote_port": 1
            })),
            "sock_close" => {
                self.sockets.remove(&id);
                self.ack(&id, "close_res");
            }
            other => self.error(&source, &format!("unsupported socket operation: {other}")),
        }
    }

    fn mint_id(&mut self) -> String {
        self.script
            .session_ids
            .pop_front()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    fn emit(&self, value: Value) {
        if self.script.debug_noise {
            let _ = self.out.send(DEBUG_LINE.to_string());
        }
        let _ = self.out.send(value.to_string());
    }

    fn state(&self, state: &str) {
        if !self.script.silent {
            self.emit(json!({"state": state}));
        }
    }

    fn ack(&self, id: &str, key: &str) {
        self.emit(json!({"sock_uuid": id, key: "executed"}));
    }

    fn error(&self, source: &str, message: &str) {
        if self.script.debug_noise {
            let _ = self.err.send(DEBUG_LINE.to_string());
        }
        let _ = self.err.send(json!({"source": source, "err": message}).to_string());
    }
}

fn arg<'a>(cmd: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    cmd.get(key).and_then(Value::as_str)
}

fn busy_state(command: &str) -> Option<&'static str> {
    match command {
        "scan" => Some("SCANNING"),
        "lookup" => Some("LOOKING_UP"),
        "find_services" => Some("FINDING_SERVICES"),
        "sock_new" => Some("CREATING_SOCKET"),
        "get_available_port" => Some("GETTING_AVAILABLE_PORT"),
        "get_active_actors" => Some("GETTING_ACTIVE_ACTORS"),
        _ => None,
    }
}
