// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend.
//!
//! All scheduler traffic arrives as one [`redis::Pipeline`] per flush. Set
//! reads, cursor scans and bulk deletes serve invalidation; pub/sub runs on a
//! dedicated connection per subscription.
//!
//! Pipelines are plain (non-transactional) and not retried here: the circuit
//! breaker owns failure handling, and replaying a pipeline would
//! double-apply INCR/DECR. Replies are read raw so a command the server
//! refuses fails only its own slot.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{cmd, pipe, Client, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::command::{Command, Reply};
use super::traits::{KvStore, StoreError, StoreInfo};
use crate::resilience::retry::{retry, RetryConfig};

/// Keys requested per SCAN round trip.
const SCAN_COUNT: usize = 500;
/// Keys per DEL command when bulk deleting.
const DEL_CHUNK: usize = 500;

pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect, retrying with the startup policy so a bad URL fails fast.
    pub async fn new(connection_string: &str) -> Result<Self, StoreError> {
        let client = Client::open(connection_string)?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await }
        })
        .await?;

        Ok(Self { client, connection })
    }

    /// Get a clone of the connection manager
    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

fn reply_from_value(value: Value) -> Result<Reply, StoreError> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Int(n) => Ok(Reply::Int(n)),
        Value::Okay => Ok(Reply::Ok),
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(Reply::Data)
            .map_err(|e| StoreError::Protocol(format!("non-UTF-8 value: {}", e))),
        Value::SimpleString(s) if s == "OK" => Ok(Reply::Ok),
        Value::SimpleString(s) => Ok(Reply::Data(s)),
        Value::Boolean(b) => Ok(Reply::Int(i64::from(b))),
        Value::ServerError(err) => Ok(Reply::Error(match err.details() {
            Some(detail) => format!("{} {}", err.code(), detail),
            None => err.code().to_string(),
        })),
        other => Err(StoreError::Protocol(format!("unsupported reply: {:?}", other))),
    }
}

/// Extract the fields we care about from `INFO` output.
pub(crate) fn parse_info(raw: &str) -> StoreInfo {
    let mut info = StoreInfo::default();
    for line in raw.lines() {
        let Some((field, value)) = line.trim().split_once(':') else {
            continue;
        };
        let parsed = value.trim().parse::<u64>().ok();
        match (field, parsed) {
            ("used_memory", Some(v)) => info.used_memory = v,
            ("maxmemory", Some(v)) => info.max_memory = v,
            ("connected_clients", Some(v)) => info.connected_clients = v,
            _ => {}
        }
    }
    info
}

#[async_trait]
impl KvStore for RedisStore {
    async fn pipeline(&self, commands: &[Command]) -> Result<Vec<Reply>, StoreError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection.clone();
        let mut pipeline = pipe();
        for command in commands {
            match command {
                Command::Get { key } => {
                    pipeline.cmd("GET").arg(key);
                }
                Command::Set { key, value } => {
                    pipeline.cmd("SET").arg(key).arg(value);
                }
                Command::SetEx { key, ttl_secs, value } => {
                    pipeline.cmd("SETEX").arg(key).arg(*ttl_secs).arg(value);
                }
                Command::Del { key } => {
                    pipeline.cmd("DEL").arg(key);
                }
                Command::Exists { key } => {
                    pipeline.cmd("EXISTS").arg(key);
                }
                Command::Expire { key, ttl_secs } => {
                    pipeline.cmd("EXPIRE").arg(key).arg(*ttl_secs);
                }
                Command::Incr { key } => {
                    pipeline.cmd("INCR").arg(key);
                }
                Command::Decr { key } => {
                    pipeline.cmd("DECR").arg(key);
                }
                Command::SAdd { key, member } => {
                    pipeline.cmd("SADD").arg(key).arg(member);
                }
                Command::SRem { key, member } => {
                    pipeline.cmd("SREM").arg(key).arg(member);
                }
            }
        }

        // query_async would turn any server error into a whole-pipeline failure
        let values = conn.req_packed_commands(&pipeline, 0, commands.len()).await?;
        if values.len() != commands.len() {
            return Err(StoreError::Protocol(format!(
                "pipeline returned {} replies for {} commands",
                values.len(),
                commands.len()
            )));
        }
        values.into_iter().map(reply_from_value).collect()
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations
        keys.sort_unstable();
        keys.dedup();
        debug!(pattern, matched = keys.len(), "SCAN complete");
        Ok(keys)
    }

    async fn del_many(&self, keys: &[String]) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let mut deleted = 0u64;
        for chunk in keys.chunks(DEL_CHUNK) {
            let n: u64 = cmd("DEL").arg(chunk).query_async(&mut conn).await?;
            deleted += n;
        }
        Ok(deleted)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let receivers: u64 = cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::channel(256);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel, error = %e, "Dropping undecodable pub/sub payload"),
                }
            }
            debug!(channel = %channel, "Redis subscription ended");
        });
        Ok(rx)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let pong: String = cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn info(&self) -> Result<StoreInfo, StoreError> {
        let mut conn = self.connection.clone();
        let raw: String = cmd("INFO").query_async(&mut conn).await?;
        Ok(parse_info(&raw))
    }
}
