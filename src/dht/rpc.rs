//! KRPC message framing (BEP 5) and the UDP transport that carries it.
//!
//! DHT messages are bencoded dicts with a `t` (transaction id), `y`
//! (message type: `q` query, `r` response, `e` error) and type-specific
//! fields. This mirrors `original_source/ccbt/dht.py`'s `_send_query`/
//! `_wait_for_response`/`handle_response` but expressed over the crate's
//! own [`crate::bencode`] codec rather than a bespoke one, and with
//! pending transactions tracked via oneshot channels instead of asyncio
//! futures stored in a dict.

use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use rand::RngCore;
use tokio::{net::UdpSocket, sync::{oneshot, Mutex}};

use crate::{
    bencode::{self, Value},
    error::DhtError,
};

const MAX_PACKET_LEN: usize = 2048;

#[derive(Debug, Clone)]
pub(crate) enum KrpcMessage {
    Query {
        tid: Vec<u8>,
        method: String,
        args: BTreeMap<Vec<u8>, Value>,
    },
    Response {
        tid: Vec<u8>,
        values: BTreeMap<Vec<u8>, Value>,
    },
    Error {
        tid: Vec<u8>,
        code: i64,
        message: String,
    },
}

impl KrpcMessage {
    pub fn tid(&self) -> &[u8] {
        match self {
            KrpcMessage::Query { tid, .. }
            | KrpcMessage::Response { tid, .. }
            | KrpcMessage::Error { tid, .. } => tid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        match self {
            KrpcMessage::Query { tid, method, args } => {
                dict.insert(b"t".to_vec(), Value::Bytes(tid.clone()));
                dict.insert(b"y".to_vec(), Value::Bytes(b"q".to_vec()));
                dict.insert(b"q".to_vec(), Value::Bytes(method.as_bytes().to_vec()));
                dict.insert(b"a".to_vec(), Value::Dict(args.clone()));
            }
            KrpcMessage::Response { tid, values } => {
                dict.insert(b"t".to_vec(), Value::Bytes(tid.clone()));
                dict.insert(b"y".to_vec(), Value::Bytes(b"r".to_vec()));
                dict.insert(b"r".to_vec(), Value::Dict(values.clone()));
            }
            KrpcMessage::Error { tid, code, message } => {
                dict.insert(b"t".to_vec(), Value::Bytes(tid.clone()));
                dict.insert(b"y".to_vec(), Value::Bytes(b"e".to_vec()));
                dict.insert(
                    b"e".to_vec(),
                    Value::List(vec![
                        Value::Int(*code),
                        Value::Bytes(message.as_bytes().to_vec()),
                    ]),
                );
            }
        }
        bencode::encode(&Value::Dict(dict))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DhtError> {
        let value = bencode::decode(bytes)?;
        let dict = value.as_dict().ok_or(DhtError::Bencode(
            crate::error::BencodeError::WrongType,
        ))?;
        let tid = dict
            .get(&b"t"[..])
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| malformed("missing transaction id"))?
            .to_vec();
        let y = dict
            .get(&b"y"[..])
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| malformed("missing message type"))?;

        match y {
            b"q" => {
                let method = dict
                    .get(&b"q"[..])
                    .and_then(|v| v.as_bytes())
                    .ok_or_else(|| malformed("missing query method"))?;
                let args = dict
                    .get(&b"a"[..])
                    .and_then(|v| v.as_dict())
                    .cloned()
                    .unwrap_or_default();
                Ok(KrpcMessage::Query {
                    tid,
                    method: String::from_utf8_lossy(method).into_owned(),
                    args,
                })
            }
            b"r" => {
                let values = dict
                    .get(&b"r"[..])
                    .and_then(|v| v.as_dict())
                    .cloned()
                    .ok_or_else(|| malformed("missing response values"))?;
                Ok(KrpcMessage::Response { tid, values })
            }
            b"e" => {
                let list = dict
                    .get(&b"e"[..])
                    .and_then(|v| v.as_list())
                    .ok_or_else(|| malformed("missing error body"))?;
                let code = list.first().and_then(|v| v.as_int()).unwrap_or(0);
                let message = list
                    .get(1)
                    .and_then(|v| v.as_bytes())
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Ok(KrpcMessage::Error { tid, code, message })
            }
            _ => Err(malformed("unknown message type")),
        }
    }
}

fn malformed(reason: &str) -> DhtError {
    DhtError::MalformedMessage {
        addr: "0.0.0.0:0".parse().unwrap(),
        reason: reason.to_string(),
    }
}

type Pending = Arc<Mutex<HashMap<Vec<u8>, oneshot::Sender<(KrpcMessage, SocketAddr)>>>>;

/// The UDP transport shared by every outstanding DHT query: owns the
/// socket, matches incoming responses against pending transaction ids,
/// and hands unmatched (i.e. incoming query) datagrams to whoever polls
/// [`Rpc::recv_query`].
pub(crate) struct Rpc {
    socket: Arc<UdpSocket>,
    pending: Pending,
    incoming: Mutex<tokio::sync::mpsc::UnboundedReceiver<(KrpcMessage, SocketAddr)>>,
}

impl Rpc {
    pub async fn bind(addr: SocketAddr) -> Result<Self, DhtError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (incoming_tx, incoming_rx) = tokio::sync::mpsc::unbounded_channel();

        let recv_socket = Arc::clone(&socket);
        let recv_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_PACKET_LEN];
            loop {
                let (n, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let message = match KrpcMessage::decode(&buf[..n]) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                match &message {
                    KrpcMessage::Query { .. } => {
                        let _ = incoming_tx.send((message, from));
                    }
                    KrpcMessage::Response { .. } | KrpcMessage::Error { .. } => {
                        let mut pending = recv_pending.lock().await;
                        if let Some(reply) = pending.remove(message.tid()) {
                            let _ = reply.send((message, from));
                        }
                    }
                }
            }
        });

        Ok(Self {
            socket,
            pending,
            incoming: Mutex::new(incoming_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends a query to `addr` and waits up to `timeout` for a matching
    /// response or error reply.
    pub async fn query(
        &self,
        addr: SocketAddr,
        method: &str,
        args: BTreeMap<Vec<u8>, Value>,
        timeout: Duration,
    ) -> Result<BTreeMap<Vec<u8>, Value>, DhtError> {
        let tid = new_transaction_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(tid.clone(), tx);

        let message = KrpcMessage::Query {
            tid: tid.clone(),
            method: method.to_string(),
            args,
        };
        self.socket.send_to(&message.encode(), addr).await?;

        let result = tokio::time::timeout(timeout, rx).await;
        self.pending.lock().await.remove(&tid);

        match result {
            Err(_) => Err(DhtError::Timeout { addr }),
            Ok(Err(_)) => Err(DhtError::Timeout { addr }),
            Ok(Ok((KrpcMessage::Response { values, .. }, _))) => Ok(values),
            Ok(Ok((KrpcMessage::Error { message, .. }, _))) => Err(DhtError::Remote(message)),
            Ok(Ok((KrpcMessage::Query { .. }, _))) => {
                Err(malformed("received a query as a response"))
            }
        }
    }

    pub async fn reply(
        &self,
        addr: SocketAddr,
        tid: Vec<u8>,
        values: BTreeMap<Vec<u8>, Value>,
    ) -> Result<(), DhtError> {
        let message = KrpcMessage::Response { tid, values };
        self.socket.send_to(&message.encode(), addr).await?;
        Ok(())
    }

    /// Waits for the next incoming query from a remote node.
    pub async fn recv_query(&self) -> Option<(KrpcMessage, SocketAddr)> {
        self.incoming.lock().await.recv().await
    }
}

fn new_transaction_id() -> Vec<u8> {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_query_message() {
        let mut args = BTreeMap::new();
        args.insert(b"id".to_vec(), Value::Bytes(vec![1; 20]));
        let msg = KrpcMessage::Query {
            tid: b"aa".to_vec(),
            method: "ping".to_string(),
            args,
        };
        let decoded = KrpcMessage::decode(&msg.encode()).unwrap();
        match decoded {
            KrpcMessage::Query { tid, method, args } => {
                assert_eq!(tid, b"aa");
                assert_eq!(method, "ping");
                assert!(args.contains_key(&b"id".to_vec()));
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn round_trips_error_message() {
        let msg = KrpcMessage::Error {
            tid: b"bb".to_vec(),
            code: 201,
            message: "generic error".to_string(),
        };
        let decoded = KrpcMessage::decode(&msg.encode()).unwrap();
        assert!(matches!(decoded, KrpcMessage::Error { code: 201, .. }));
    }

    #[tokio::test]
    async fn query_times_out_with_no_responder() {
        let rpc = Rpc::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let unused_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = rpc
            .query(unused_addr, "ping", BTreeMap::new(), Duration::from_millis(50))
            .await;
        assert!(result.is_err());
    }
}
