#![allow(dead_code)]

//! In-process broker speaking enough of the protocol for integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use nats_client::{ConnectionInfo, Host, NatsClient};
use nats_wire::headers::NO_RESPONDERS_STATUS;
use nats_wire::subject::matches;
use nats_wire::{Connect, HeaderMap};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Required `user`/`pass`, if any.
    pub auth: Option<(String, String)>,
    pub max_payload: u64,
    /// Answer requests nobody listens to with a 503 status message.
    pub no_responders: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            auth: None,
            max_payload: 1024 * 1024,
            no_responders: true,
        }
    }
}

struct Sub {
    subject: String,
    queue: Option<String>,
    delivered: u64,
    max: Option<u64>,
}

struct Conn {
    out: UnboundedSender<Vec<u8>>,
    subs: HashMap<String, Sub>,
    kill: CancellationToken,
}

struct State {
    config: BrokerConfig,
    conns: Mutex<HashMap<u64, Conn>>,
    next_id: AtomicU64,
    accepted: AtomicUsize,
}

pub struct MockBroker {
    pub port: u16,
    state: Arc<State>,
    accept: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::with_config(BrokerConfig::default()).await
    }

    pub async fn with_config(config: BrokerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(State {
            config,
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepted: AtomicUsize::new(0),
        });
        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let id = accept_state.next_id.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, id, accept_state.clone()));
            }
        });
        Self {
            port,
            state,
            accept,
        }
    }

    pub fn host(&self) -> Host {
        Host::new("127.0.0.1", self.port)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(vec![self.host()])
    }

    pub async fn client(&self) -> NatsClient {
        let client = NatsClient::new(self.connection_info()).unwrap();
        client.connect().await.unwrap();
        client
    }

    /// Total connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.state.conns.lock().len()
    }

    /// Subscribers (across connections) whose subject equals `subject`.
    pub fn subscribers(&self, subject: &str) -> usize {
        self.state
            .conns
            .lock()
            .values()
            .flat_map(|conn| conn.subs.values())
            .filter(|sub| sub.subject == subject)
            .count()
    }

    pub async fn wait_for_subscribers(&self, subject: &str, count: usize) {
        let wait = async {
            while self.subscribers(subject) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("no {count} subscriber(s) on {subject}"));
    }

    pub async fn wait_for_no_subscribers(&self, subject: &str) {
        let wait = async {
            while self.subscribers(subject) > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("{subject} still has subscribers"));
    }

    pub async fn wait_for_connections(&self, count: usize) {
        let wait = async {
            while self.live_connections() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("no {count} live connection(s)"));
    }

    /// Drop every client connection; new ones are still accepted.
    pub fn kill_all(&self) {
        for conn in self.state.conns.lock().values() {
            conn.kill.cancel();
        }
    }

    /// Write raw protocol text to every connection.
    pub fn send_all(&self, raw: &str) {
        for conn in self.state.conns.lock().values() {
            let _ = conn.out.send(raw.as_bytes().to_vec());
        }
    }

    /// Stop accepting and drop every connection.
    pub fn stop(&self) {
        self.accept.abort();
        self.kill_all();
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl State {
    fn info_json(&self) -> String {
        format!(
            r#"{{"server_id":"MOCK","version":"2.10.0","proto":1,"headers":true,"auth_required":{},"max_payload":{}}}"#,
            self.config.auth.is_some(),
            self.config.max_payload
        )
    }

    fn authorized(&self, connect: &Connect) -> bool {
        match &self.config.auth {
            Some((user, pass)) => {
                connect.user.as_deref() == Some(user.as_str())
                    && connect.pass.as_deref() == Some(pass.as_str())
            }
            None => true,
        }
    }

    fn subscribe(&self, conn: u64, sid: &str, subject: &str, queue: Option<&str>) {
        if let Some(conn) = self.conns.lock().get_mut(&conn) {
            conn.subs.insert(
                sid.to_string(),
                Sub {
                    subject: subject.to_string(),
                    queue: queue.map(str::to_string),
                    delivered: 0,
                    max: None,
                },
            );
        }
    }

    fn unsubscribe(&self, conn: u64, sid: &str, max: Option<u64>) {
        let mut conns = self.conns.lock();
        let Some(conn) = conns.get_mut(&conn) else {
            return;
        };
        match max {
            Some(max) => {
                let done = match conn.subs.get_mut(sid) {
                    Some(sub) => {
                        sub.max = Some(max);
                        sub.delivered >= max
                    }
                    None => false,
                };
                if done {
                    conn.subs.remove(sid);
                }
            }
            None => {
                conn.subs.remove(sid);
            }
        }
    }

    /// Route to matching subscriptions, one member per queue group. Returns
    /// the number of deliveries.
    fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        headers: Option<&[u8]>,
        payload: &[u8],
    ) -> usize {
        let mut conns = self.conns.lock();
        let mut ids: Vec<u64> = conns.keys().copied().collect();
        ids.sort_unstable();

        let mut groups = HashSet::new();
        let mut targets = Vec::new();
        for id in ids {
            for (sid, sub) in &conns[&id].subs {
                if !matches(&sub.subject, subject) {
                    continue;
                }
                if let Some(queue) = &sub.queue {
                    if !groups.insert(queue.clone()) {
                        continue;
                    }
                }
                targets.push((id, sid.clone()));
            }
        }

        for (id, sid) in &targets {
            let Some(conn) = conns.get_mut(id) else {
                continue;
            };
            let _ = conn.out.send(frame(subject, sid, reply, headers, payload));
            let done = match conn.subs.get_mut(sid) {
                Some(sub) => {
                    sub.delivered += 1;
                    sub.max.is_some_and(|max| sub.delivered >= max)
                }
                None => false,
            };
            if done {
                conn.subs.remove(sid);
            }
        }
        targets.len()
    }
}

fn frame(
    subject: &str,
    sid: &str,
    reply: Option<&str>,
    headers: Option<&[u8]>,
    payload: &[u8],
) -> Vec<u8> {
    let reply = reply.map(|reply| format!(" {reply}")).unwrap_or_default();
    let mut out = match headers {
        Some(headers) => format!(
            "HMSG {subject} {sid}{reply} {} {}\r\n",
            headers.len(),
            headers.len() + payload.len()
        )
        .into_bytes(),
        None => format!("MSG {subject} {sid}{reply} {}\r\n", payload.len()).into_bytes(),
    };
    if let Some(headers) = headers {
        out.extend_from_slice(headers);
    }
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

fn no_responders_block() -> Vec<u8> {
    let mut block = BytesMut::new();
    HeaderMap::with_status(NO_RESPONDERS_STATUS, None)
        .encode(&mut block)
        .unwrap();
    block.to_vec()
}

async fn serve(stream: TcpStream, id: u64, state: Arc<State>) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let kill = CancellationToken::new();
    state.conns.lock().insert(
        id,
        Conn {
            out: tx.clone(),
            subs: HashMap::new(),
            kill: kill.clone(),
        },
    );
    let _ = tx.send(format!("INFO {}\r\n", state.info_json()).into_bytes());

    let writer_kill = kill.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        if write.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = writer_kill.cancelled() => break,
            }
        }
        let _ = write.shutdown().await;
    });

    let mut reader = BufReader::new(read);
    tokio::select! {
        _ = kill.cancelled() => {}
        _ = read_loop(&mut reader, id, &state, &tx) => {}
    }
    state.conns.lock().remove(&id);
    kill.cancel();
    let _ = writer.await;
}

async fn read_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    id: u64,
    state: &State,
    tx: &UnboundedSender<Vec<u8>>,
) -> std::io::Result<()> {
    let mut raw = String::new();
    let mut headers_enabled = false;
    loop {
        raw.clear();
        if reader.read_line(&mut raw).await? == 0 {
            return Ok(());
        }
        let line = raw.trim_end();
        let (op, rest) = line.split_once(' ').unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();
        match op.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                let connect: Connect = match serde_json::from_str(rest) {
                    Ok(connect) => connect,
                    Err(_) => {
                        let _ = tx.send(b"-ERR 'Invalid CONNECT'\r\n".to_vec());
                        return Ok(());
                    }
                };
                if !state.authorized(&connect) {
                    let _ = tx.send(b"-ERR 'Authorization Violation'\r\n".to_vec());
                    return Ok(());
                }
                headers_enabled = connect.headers;
            }
            "PING" => {
                let _ = tx.send(b"PONG\r\n".to_vec());
            }
            "PONG" => {}
            "SUB" => match args.as_slice() {
                [subject, sid] => state.subscribe(id, sid, subject, None),
                [subject, queue, sid] => state.subscribe(id, sid, subject, Some(*queue)),
                _ => return Ok(()),
            },
            "UNSUB" => match args.as_slice() {
                [sid] => state.unsubscribe(id, sid, None),
                [sid, max] => state.unsubscribe(id, sid, max.parse().ok()),
                _ => return Ok(()),
            },
            "PUB" => {
                let (subject, reply, len) = match args.as_slice() {
                    [subject, len] => (*subject, None, len),
                    [subject, reply, len] => (*subject, Some(*reply), len),
                    _ => return Ok(()),
                };
                let len: usize = len.parse().unwrap_or(0);
                let body = read_body(reader, len).await?;
                let delivered = state.publish(subject, reply, None, &body);
                no_responders(state, reply, delivered, headers_enabled);
            }
            "HPUB" => {
                let (subject, reply, header_len, total) = match args.as_slice() {
                    [subject, header_len, total] => (*subject, None, header_len, total),
                    [subject, reply, header_len, total] => {
                        (*subject, Some(*reply), header_len, total)
                    }
                    _ => return Ok(()),
                };
                let header_len: usize = header_len.parse().unwrap_or(0);
                let total: usize = total.parse().unwrap_or(0);
                let body = read_body(reader, total).await?;
                let (headers, payload) = body.split_at(header_len.min(body.len()));
                let delivered = state.publish(subject, reply, Some(headers), payload);
                no_responders(state, reply, delivered, headers_enabled);
            }
            _ => {
                let _ = tx.send(b"-ERR 'Unknown Protocol Operation'\r\n".to_vec());
                return Ok(());
            }
        }
    }
}

fn no_responders(state: &State, reply: Option<&str>, delivered: usize, headers_enabled: bool) {
    let Some(reply) = reply else {
        return;
    };
    if delivered == 0 && headers_enabled && state.config.no_responders {
        state.publish(reply, None, Some(&no_responders_block()), b"");
    }
}

async fn read_body(reader: &mut BufReader<OwnedReadHalf>, len: usize) -> std::io::Result<Vec<u8>> {
    let mut body = vec![0; len + 2];
    reader.read_exact(&mut body).await?;
    body.truncate(len);
    Ok(body)
}
