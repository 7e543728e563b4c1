//! Electrum protocol client
//!
//! Newline-delimited JSON-RPC over a plain TCP connection. A reader thread
//! routes responses back to the waiting caller by request id and forwards
//! `blockchain.scripthash.subscribe` notifications to the engine's channel.
//! Servers are tried in the configured order; after a reconnect every
//! script hash that was subscribed before is subscribed again.

use crate::chain::{ChainClient, ChainNotification, HistoryEntry, UnspentOutput};
use crate::error::{EngineError, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const CLIENT_NAME: &str = "assurance-engine";
const PROTOCOL_VERSION: &str = "1.4";
const SUBSCRIBE_METHOD: &str = "blockchain.scripthash.subscribe";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Vec<Value>,
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

type PendingRequests = Arc<Mutex<HashMap<u64, Sender<std::result::Result<Value, RpcError>>>>>;

struct Connection {
    server: String,
    writer: TcpStream,
    alive: Arc<AtomicBool>,
}

pub struct ElectrumClient {
    servers: Vec<String>,
    timeout: Duration,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
    pending: PendingRequests,
    subscriptions: Mutex<HashSet<String>>,
    notifications: Sender<ChainNotification>,
}

impl ElectrumClient {
    pub fn new(
        servers: Vec<String>,
        timeout: Duration,
        notifications: Sender<ChainNotification>,
    ) -> Result<ElectrumClient> {
        if servers.is_empty() {
            return Err(EngineError::Config(
                "At least one electrum server is required".to_string(),
            ));
        }
        Ok(ElectrumClient {
            servers,
            timeout,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            subscriptions: Mutex::new(HashSet::new()),
            notifications,
        })
    }

    /// Connect eagerly so startup fails fast when no server answers.
    pub fn connect(&self) -> Result<()> {
        if self.ensure_connected()? {
            self.restore_subscriptions();
        }
        Ok(())
    }

    fn request(&self, method: &str, params: Value) -> Result<Value> {
        if self.ensure_connected()? {
            self.restore_subscriptions();
        }
        self.send_request(method, params)?
            .map_err(|e| EngineError::Chain(format!("{method} failed ({}): {}", e.code, e.message)))
    }

    /// Returns true when a new connection was opened.
    fn ensure_connected(&self) -> Result<bool> {
        let mut connection = self
            .connection
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire connection lock: {e}")))?;

        if let Some(existing) = connection.as_ref() {
            if existing.alive.load(Ordering::SeqCst) {
                return Ok(false);
            }
            warn!("Lost connection to electrum server {}", existing.server);
        }

        let mut last_error = None;
        for server in &self.servers {
            match self.open(server) {
                Ok(opened) => {
                    info!("Connected to electrum server {server}");
                    *connection = Some(opened);
                    drop(connection);
                    self.send_request("server.version", json!([CLIENT_NAME, PROTOCOL_VERSION]))?
                        .map_err(|e| EngineError::Chain(format!("server.version failed: {}", e.message)))?;
                    return Ok(true);
                }
                Err(e) => {
                    warn!("Failed to connect to electrum server {server}: {e}");
                    last_error = Some(e);
                }
            }
        }

        *connection = None;
        Err(last_error
            .unwrap_or_else(|| EngineError::Chain("No electrum servers configured".to_string())))
    }

    fn open(&self, server: &str) -> Result<Connection> {
        let stream = TcpStream::connect(server)
            .map_err(|e| EngineError::Chain(format!("Failed to connect to {server}: {e}")))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| EngineError::Chain(format!("Failed to set write timeout: {e}")))?;
        let reader = stream
            .try_clone()
            .map_err(|e| EngineError::Chain(format!("Failed to clone stream: {e}")))?;

        let alive = Arc::new(AtomicBool::new(true));
        let reader_alive = Arc::clone(&alive);
        let pending = Arc::clone(&self.pending);
        let notifications = self.notifications.clone();
        let server_name = server.to_string();

        thread::spawn(move || {
            Self::read_loop(reader, &pending, &notifications);
            reader_alive.store(false, Ordering::SeqCst);
            // dropping the senders wakes every caller still waiting
            if let Ok(mut pending) = pending.lock() {
                pending.clear();
            }
            debug!("Reader for {server_name} stopped");
        });

        Ok(Connection {
            server: server.to_string(),
            writer: stream,
            alive,
        })
    }

    fn read_loop(
        stream: TcpStream,
        pending: &PendingRequests,
        notifications: &Sender<ChainNotification>,
    ) {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Electrum connection closed: {e}");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let message: RpcResponse = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Ignoring malformed electrum message: {e}");
                    continue;
                }
            };

            if let Some(id) = message.id {
                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                if let Some(waiter) = waiter {
                    let outcome = match message.error {
                        Some(error) => Err(error),
                        None => Ok(message.result.unwrap_or(Value::Null)),
                    };
                    let _ = waiter.send(outcome);
                }
            } else if message.method.as_deref() == Some(SUBSCRIBE_METHOD) {
                if let Some(notification) = parse_notification(&message.params) {
                    if notifications.send(notification).is_err() {
                        debug!("Notification receiver dropped");
                    }
                }
            }
        }
    }

    fn send_request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<std::result::Result<Value, RpcError>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        self.pending
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire request table: {e}")))?
            .insert(id, tx);

        let mut line = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))?;
        line.push(b'\n');

        {
            let mut connection = self.connection.lock().map_err(|e| {
                EngineError::Lock(format!("Failed to acquire connection lock: {e}"))
            })?;
            let Some(conn) = connection.as_mut() else {
                return Err(EngineError::Chain("Not connected".to_string()));
            };
            if let Err(e) = conn.writer.write_all(&line) {
                conn.alive.store(false, Ordering::SeqCst);
                return Err(EngineError::Chain(format!("Failed to send {method}: {e}")));
            }
        }

        debug!("Sent electrum request {id}: {method}");
        match rx.recv_timeout(self.timeout) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&id);
                }
                Err(EngineError::Chain(format!("No response to {method}: {e}")))
            }
        }
    }

    fn restore_subscriptions(&self) {
        let script_hashes: Vec<String> = match self.subscriptions.lock() {
            Ok(subscriptions) => subscriptions.iter().cloned().collect(),
            Err(e) => {
                warn!("Failed to read subscriptions: {e}");
                return;
            }
        };
        for script_hash in script_hashes {
            match self.send_request(SUBSCRIBE_METHOD, json!([script_hash])) {
                Ok(Ok(status)) => {
                    // anything may have happened while disconnected
                    let notification = ChainNotification {
                        script_hash: script_hash.clone(),
                        status: status.as_str().map(str::to_string),
                    };
                    let _ = self.notifications.send(notification);
                }
                Ok(Err(e)) => warn!("Resubscribe to {script_hash} rejected: {}", e.message),
                Err(e) => warn!("Resubscribe to {script_hash} failed: {e}"),
            }
        }
    }
}

fn parse_notification(params: &[Value]) -> Option<ChainNotification> {
    let script_hash = params.first()?.as_str()?.to_string();
    let status = params.get(1).and_then(Value::as_str).map(str::to_string);
    Some(ChainNotification {
        script_hash,
        status,
    })
}

fn is_missing_transaction(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("no such") || lowered.contains("not found")
}

impl ChainClient for ElectrumClient {
    fn get_transaction(&self, tx_hash: &str) -> Result<Option<Vec<u8>>> {
        if self.ensure_connected()? {
            self.restore_subscriptions();
        }
        match self.send_request("blockchain.transaction.get", json!([tx_hash]))? {
            Ok(Value::String(raw)) => Ok(Some(crate::utils::decode_hex(&raw)?)),
            Ok(other) => Err(EngineError::Chain(format!(
                "Unexpected transaction payload: {other}"
            ))),
            Err(e) if is_missing_transaction(&e.message) => Ok(None),
            Err(e) => Err(EngineError::Chain(format!(
                "blockchain.transaction.get failed: {}",
                e.message
            ))),
        }
    }

    fn get_unspent_outputs(&self, script_hash: &str) -> Result<Vec<UnspentOutput>> {
        let value = self.request("blockchain.scripthash.listunspent", json!([script_hash]))?;
        Ok(serde_json::from_value(value)?)
    }

    fn get_history(&self, script_hash: &str) -> Result<Vec<HistoryEntry>> {
        let value = self.request("blockchain.scripthash.get_history", json!([script_hash]))?;
        Ok(serde_json::from_value(value)?)
    }

    fn subscribe(&self, script_hash: &str) -> Result<Option<String>> {
        let status = self.request(SUBSCRIBE_METHOD, json!([script_hash]))?;
        self.subscriptions
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire subscriptions: {e}")))?
            .insert(script_hash.to_string());
        Ok(status.as_str().map(str::to_string))
    }

    fn unsubscribe(&self, script_hash: &str) -> Result<bool> {
        self.subscriptions
            .lock()
            .map_err(|e| EngineError::Lock(format!("Failed to acquire subscriptions: {e}")))?
            .remove(script_hash);
        let value = self.request("blockchain.scripthash.unsubscribe", json!([script_hash]))?;
        Ok(value.as_bool().unwrap_or(false))
    }

    fn broadcast(&self, raw_tx_hex: &str) -> Result<String> {
        if self.ensure_connected()? {
            self.restore_subscriptions();
        }
        match self.send_request("blockchain.transaction.broadcast", json!([raw_tx_hex]))? {
            Ok(Value::String(tx_hash)) => Ok(tx_hash),
            Ok(other) => Err(EngineError::BroadcastFailed(format!(
                "Unexpected broadcast result: {other}"
            ))),
            Err(e) => Err(EngineError::BroadcastFailed(e.message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_parse_notification() {
        let params = vec![json!("abcd"), json!("status")];
        let parsed = parse_notification(&params).unwrap();
        assert_eq!(parsed.script_hash, "abcd");
        assert_eq!(parsed.status.as_deref(), Some("status"));

        let empty_history = vec![json!("abcd"), Value::Null];
        assert_eq!(parse_notification(&empty_history).unwrap().status, None);
        assert!(parse_notification(&[]).is_none());
    }

    #[test]
    fn test_missing_transaction_messages() {
        assert!(is_missing_transaction(
            "No such mempool or blockchain transaction. Use gettransaction for wallet transactions."
        ));
        assert!(!is_missing_transaction("daemon error"));
    }

    #[test]
    fn test_requires_a_server() {
        let (tx, _rx) = mpsc::channel();
        assert!(ElectrumClient::new(vec![], Duration::from_secs(1), tx).is_err());
    }

    // A scripted server answering each request line in order.
    fn fake_server(replies: Vec<Value>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let reader = BufReader::new(stream);
            let mut replies = replies.into_iter();
            for line in reader.lines() {
                let request: Value = serde_json::from_str(&line.unwrap()).unwrap();
                let Some(mut reply) = replies.next() else { break };
                reply["id"] = request["id"].clone();
                writer
                    .write_all(format!("{reply}\n").as_bytes())
                    .unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_request_round_trip_against_fake_server() {
        let addr = fake_server(vec![
            json!({"result": ["fake", "1.4"]}),
            json!({"result": [{"tx_hash": "aa", "tx_pos": 0, "value": 1000, "height": 1}]}),
            json!({"error": {"code": 2, "message": "No such mempool or blockchain transaction"}}),
            json!({"error": {"code": 1, "message": "the transaction was rejected by network rules"}}),
        ]);
        let (tx, _rx) = mpsc::channel();
        let client = ElectrumClient::new(vec![addr], Duration::from_secs(5), tx).unwrap();

        let unspent = client.get_unspent_outputs("00").unwrap();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].value, 1000);

        assert_eq!(client.get_transaction("aa").unwrap(), None);

        match client.broadcast("00") {
            Err(EngineError::BroadcastFailed(message)) => {
                assert!(message.contains("rejected"))
            }
            other => panic!("unexpected broadcast result: {other:?}"),
        }
    }
}
