//! In-process broker for integration tests.
//!
//! Speaks enough of the protocol to exercise the client: INFO, CONNECT,
//! PING/PONG, SUB/UNSUB (with auto-unsubscribe), PUB/HPUB routing with
//! wildcards and queue groups, no-responders replies, forced disconnects
//! and ping suppression.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use carapace_core::options::ConnectOptions;
use carapace_core::subject;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const NO_RESPONDERS: &[u8] = b"NATS/1.0 503\r\n\r\n";

struct Sub {
    conn: u64,
    sid: u64,
    subject: String,
    queue: Option<String>,
    max: Option<u64>,
    delivered: u64,
}

struct Conn {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    kill: Option<oneshot::Sender<()>>,
    echo: bool,
    no_responders: bool,
}

struct State {
    info: Mutex<Value>,
    conns: Mutex<HashMap<u64, Conn>>,
    subs: Mutex<Vec<Sub>>,
    connects: Mutex<Vec<Value>>,
    next_conn: AtomicU64,
    accepted: AtomicUsize,
    sub_frames: AtomicUsize,
    published: AtomicUsize,
    answer_pings: AtomicBool,
    round_robin: AtomicUsize,
}

/// Broker listening on an ephemeral localhost port. Stops when dropped.
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::start_with_info(json!({})).await
    }

    /// Start with extra INFO fields merged over the defaults.
    pub async fn start_with_info(extra: Value) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut info = json!({
            "server_id": "mock",
            "server_name": "mock",
            "version": "2.10.0",
            "proto": 1,
            "host": "127.0.0.1",
            "port": addr.port(),
            "headers": true,
            "max_payload": 1_048_576,
        });
        if let (Some(base), Some(extra)) = (info.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }

        let state = Arc::new(State {
            info: Mutex::new(info),
            conns: Mutex::new(HashMap::new()),
            subs: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            next_conn: AtomicU64::new(1),
            accepted: AtomicUsize::new(0),
            sub_frames: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
            answer_pings: AtomicBool::new(true),
            round_robin: AtomicUsize::new(0),
        });
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Self { addr, state, accept }
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Client options pointing at this broker with test-friendly timings.
    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::default()
            .with_servers([self.url()])
            .with_reconnect_time_wait(Duration::from_millis(20))
            .with_reconnect_jitter(Duration::ZERO)
            .with_connect_timeout(Duration::from_secs(1))
    }

    pub fn connections(&self) -> usize {
        self.state.conns.lock().len()
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.state.subs.lock().len()
    }

    /// SUB frames received over the broker's lifetime, including replays.
    pub fn sub_frames(&self) -> usize {
        self.state.sub_frames.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> usize {
        self.state.published.load(Ordering::SeqCst)
    }

    /// CONNECT payloads in arrival order.
    pub fn connects(&self) -> Vec<Value> {
        self.state.connects.lock().clone()
    }

    /// Drop every client connection without a goodbye.
    pub fn kill_connections(&self) {
        let killed: Vec<Conn> = self.state.conns.lock().drain().map(|(_, c)| c).collect();
        for mut conn in killed {
            if let Some(kill) = conn.kill.take() {
                let _ = kill.send(());
            }
        }
        self.state.subs.lock().clear();
    }

    /// Stop answering PINGs so clients see the link as stale.
    pub fn set_answer_pings(&self, answer: bool) {
        self.state.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Write raw protocol bytes to every connected client.
    pub fn send_raw(&self, raw: &str) {
        for conn in self.state.conns.lock().values() {
            let _ = conn.tx.send(raw.as_bytes().to_vec());
        }
    }

    /// Send an updated INFO to every connected client.
    pub fn send_info(&self, extra: Value) {
        let info = {
            let mut info = self.state.info.lock();
            if let (Some(base), Some(extra)) = (info.as_object_mut(), extra.as_object()) {
                for (k, v) in extra {
                    base.insert(k.clone(), v.clone());
                }
            }
            info.to_string()
        };
        self.send_raw(&format!("INFO {info}\r\n"));
    }

    /// Stop listening and drop all connections.
    pub fn shutdown(self) {
        drop(self);
    }

    /// Poll `check` until it holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check(self)
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept.abort();
        self.kill_connections();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<State>) {
    while let Ok((stream, _)) = listener.accept().await {
        state.accepted.fetch_add(1, Ordering::SeqCst);
        let id = state.next_conn.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(stream, id, Arc::clone(&state)));
    }
}

async fn serve(stream: TcpStream, id: u64, state: Arc<State>) {
    let _ = stream.set_nodelay(true);
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (kill_tx, kill_rx) = oneshot::channel();

    let info = format!("INFO {}\r\n", state.info.lock());
    let _ = tx.send(info.into_bytes());
    state.conns.lock().insert(
        id,
        Conn {
            tx: tx.clone(),
            kill: Some(kill_tx),
            echo: true,
            no_responders: false,
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if write.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read);
    tokio::select! {
        _ = read_loop(&mut reader, id, &state, &tx) => {}
        _ = kill_rx => {}
    }
    writer.abort();
    let _ = writer.await;
    state.conns.lock().remove(&id);
    state.subs.lock().retain(|s| s.conn != id);
}

async fn read_payload(reader: &mut BufReader<OwnedReadHalf>, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len + 2];
    reader.read_exact(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

async fn read_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    id: u64,
    state: &State,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
) -> std::io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();

        match verb.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                let connect: Value = serde_json::from_str(rest).unwrap_or_default();
                if let Some(conn) = state.conns.lock().get_mut(&id) {
                    conn.echo = connect["echo"].as_bool().unwrap_or(true);
                    conn.no_responders = connect["headers"].as_bool().unwrap_or(false)
                        && connect["no_responders"].as_bool().unwrap_or(false);
                }
                state.connects.lock().push(connect);
            }
            "PING" => {
                if state.answer_pings.load(Ordering::SeqCst) {
                    let _ = tx.send(b"PONG\r\n".to_vec());
                }
            }
            "PONG" => {}
            "SUB" => {
                let (subject, queue, sid) = match args.as_slice() {
                    [subject, sid] => (*subject, None, *sid),
                    [subject, queue, sid] => (*subject, Some(*queue), *sid),
                    _ => continue,
                };
                let Ok(sid) = sid.parse::<u64>() else { continue };
                state.sub_frames.fetch_add(1, Ordering::SeqCst);
                let mut subs = state.subs.lock();
                if subs.iter().any(|s| s.conn == id && s.sid == sid) {
                    continue;
                }
                subs.push(Sub {
                    conn: id,
                    sid,
                    subject: subject.to_string(),
                    queue: queue.map(str::to_string),
                    max: None,
                    delivered: 0,
                });
            }
            "UNSUB" => {
                let Some(Ok(sid)) = args.first().map(|s| s.parse::<u64>()) else { continue };
                let max = args.get(1).and_then(|m| m.parse::<u64>().ok());
                let mut subs = state.subs.lock();
                match max {
                    Some(max) => {
                        if let Some(sub) = subs.iter_mut().find(|s| s.conn == id && s.sid == sid) {
                            sub.max = Some(sub.delivered + max);
                        }
                    }
                    None => subs.retain(|s| !(s.conn == id && s.sid == sid)),
                }
            }
            "PUB" => {
                let (subject, reply, size) = match args.as_slice() {
                    [subject, size] => (*subject, None, *size),
                    [subject, reply, size] => (*subject, Some(*reply), *size),
                    _ => continue,
                };
                let size: usize = size.parse().unwrap_or(0);
                let payload = read_payload(reader, size).await?;
                route(state, id, subject, reply, None, &payload);
            }
            "HPUB" => {
                let (subject, reply, hdr, total) = match args.as_slice() {
                    [subject, hdr, total] => (*subject, None, *hdr, *total),
                    [subject, reply, hdr, total] => (*subject, Some(*reply), *hdr, *total),
                    _ => continue,
                };
                let hdr: usize = hdr.parse().unwrap_or(0);
                let total: usize = total.parse().unwrap_or(0);
                let body = read_payload(reader, total).await?;
                let (headers, payload) = body.split_at(hdr.min(body.len()));
                route(state, id, subject, reply, Some(headers), payload);
            }
            _ => {
                let _ = tx.send(b"-ERR 'Unknown Protocol Operation'\r\n".to_vec());
            }
        }
    }
}

fn msg_frame(subject: &str, sid: u64, reply: Option<&str>, headers: Option<&[u8]>, payload: &[u8]) -> Vec<u8> {
    let reply = reply.map(|r| format!(" {r}")).unwrap_or_default();
    let mut out = Vec::with_capacity(payload.len() + 64);
    match headers {
        Some(h) => {
            out.extend_from_slice(
                format!("HMSG {subject} {sid}{reply} {} {}\r\n", h.len(), h.len() + payload.len())
                    .as_bytes(),
            );
            out.extend_from_slice(h);
        }
        None => {
            out.extend_from_slice(format!("MSG {subject} {sid}{reply} {}\r\n", payload.len()).as_bytes());
        }
    }
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

fn route(state: &State, from: u64, subject: &str, reply: Option<&str>, headers: Option<&[u8]>, payload: &[u8]) {
    state.published.fetch_add(1, Ordering::SeqCst);
    let no_echo: Vec<u64> = state
        .conns
        .lock()
        .iter()
        .filter(|(_, c)| !c.echo)
        .map(|(id, _)| *id)
        .collect();

    let targets: Vec<(u64, u64)> = {
        let mut subs = state.subs.lock();
        let mut chosen: Vec<usize> = Vec::new();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, sub) in subs.iter().enumerate() {
            if !subject::matches(&sub.subject, subject) {
                continue;
            }
            if sub.conn == from && no_echo.contains(&from) {
                continue;
            }
            match &sub.queue {
                Some(q) => groups.entry(q.clone()).or_default().push(idx),
                None => chosen.push(idx),
            }
        }
        for members in groups.values() {
            let pick = state.round_robin.fetch_add(1, Ordering::SeqCst) % members.len();
            chosen.push(members[pick]);
        }

        let mut targets = Vec::with_capacity(chosen.len());
        for idx in chosen {
            let sub = &mut subs[idx];
            sub.delivered += 1;
            targets.push((sub.conn, sub.sid));
        }
        subs.retain(|s| s.max.map_or(true, |max| s.delivered < max));
        targets
    };

    let conns = state.conns.lock();
    if targets.is_empty() {
        let Some(reply) = reply else { return };
        let Some(requester) = conns.get(&from) else { return };
        if !requester.no_responders {
            return;
        }
        let inbox_sid = state
            .subs
            .lock()
            .iter()
            .find(|s| s.conn == from && subject::matches(&s.subject, reply))
            .map(|s| s.sid);
        if let Some(sid) = inbox_sid {
            let _ = requester.tx.send(msg_frame(reply, sid, None, Some(NO_RESPONDERS), b""));
        }
        return;
    }
    for (conn, sid) in targets {
        if let Some(c) = conns.get(&conn) {
            let _ = c.tx.send(msg_frame(subject, sid, reply, headers, payload));
        }
    }
}
