//! In-process backing store and pub/sub broker.
//!
//! Several cache nodes sharing one [`MemoryStore`] behave like several
//! processes sharing one Redis server. Expiry follows `tokio::time`, so tests
//! running with a paused clock control it exactly.
//!
//! The store can also simulate outages: [`MemoryStore::set_available`] makes
//! every command fail with a connection error, and
//! [`MemoryStore::sever_subscriptions`] drops every open subscription as a
//! lost connection would.
//!
//! As with Redis, a published message reaches only the connections that are
//! subscribed to its channel at the moment it is published.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    BackingStore, BusMessage, ListEnd, PubSubTransport, SubscriptionConnection, resolve_range,
};
use crate::error::StoreError;
use crate::pubsub::BusError;

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Set(HashSet<Vec<u8>>),
    ZSet(BTreeMap<Vec<u8>, f64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(h) => h.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Set(s) => s.is_empty(),
            Value::ZSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Inner {
    data: Mutex<HashMap<String, Slot>>,
    available: AtomicBool,
    pubsub_available: AtomicBool,
    subscribers: Mutex<Vec<Arc<Inbox>>>,
    severed: Mutex<CancellationToken>,
    connects: AtomicU64,
}

/// Shared in-memory [`BackingStore`] that is also its own [`PubSubTransport`].
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                pubsub_available: AtomicBool::new(true),
                subscribers: Mutex::new(Vec::new()),
                severed: Mutex::new(CancellationToken::new()),
                connects: AtomicU64::new(0),
            }),
        }
    }

    /// Makes every store command succeed (`true`) or fail with a connection error.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Makes new subscription connections succeed (`true`) or fail.
    pub fn set_pubsub_available(&self, available: bool) {
        self.inner.pubsub_available.store(available, Ordering::SeqCst);
    }

    /// Drops every open subscription connection.
    pub fn sever_subscriptions(&self) {
        let mut token = self.inner.severed.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Number of subscription connections opened so far.
    pub fn subscription_connects(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .data
            .lock()
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::connection("memory store unavailable"))
        }
    }

    /// Runs `f` against the live slot for `key`, purging it first if expired.
    fn read<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&Value>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check_available()?;
        let mut data = self.inner.data.lock();
        purge_if_expired(&mut data, key);
        f(data.get(key).map(|slot| &slot.value))
    }

    /// Runs `f` against the collection at `key`, creating it with `empty` when missing.
    /// The key is dropped afterwards if the collection ended up empty.
    fn write<R>(
        &self,
        key: &str,
        empty: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check_available()?;
        let mut data = self.inner.data.lock();
        purge_if_expired(&mut data, key);
        let slot = data.entry(key.to_string()).or_insert_with(|| Slot {
            value: empty(),
            expires_at: None,
        });
        let result = f(&mut slot.value);
        if slot.value.is_empty() {
            data.remove(key);
        }
        result
    }
}

fn purge_if_expired(data: &mut HashMap<String, Slot>, key: &str) {
    let now = Instant::now();
    if data.get(key).is_some_and(|slot| slot.is_expired(now)) {
        data.remove(key);
    }
}

fn wrong_type(key: &str, expected: &'static str) -> StoreError {
    StoreError::wrong_type(key, expected)
}

fn sorted_members(zset: &BTreeMap<Vec<u8>, f64>, reverse: bool) -> Vec<(&Vec<u8>, f64)> {
    let mut members: Vec<_> = zset.iter().map(|(m, s)| (m, *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
    if reverse {
        members.reverse();
    }
    members
}

fn list_index(len: usize, index: i64) -> Option<usize> {
    let len = len as i64;
    let index = if index < 0 { len + index } else { index };
    (0..len).contains(&index).then_some(index as usize)
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::Str(bytes)) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key, "string")),
        })
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.data.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_vec()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &[u8],
        seconds: u64,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        if seconds == 0 {
            return Err(StoreError::command("invalid expire time in 'setex' command"));
        }
        self.inner.data.lock().insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_vec()),
                expires_at: Some(Instant::now() + Duration::from_secs(seconds)),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<u64, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut data = self.inner.data.lock();
        let mut removed = 0;
        for key in keys {
            if let Some(slot) = data.remove(*key) {
                if !slot.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.read(key, |value| Ok(value.is_some()))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut data = self.inner.data.lock();
        purge_if_expired(&mut data, key);
        if seconds == 0 {
            return Ok(data.remove(key).is_some());
        }
        match data.get_mut(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        self.check_available()?;
        let mut data = self.inner.data.lock();
        purge_if_expired(&mut data, key);
        Ok(match data.get(key) {
            None => -2,
            Some(Slot {
                expires_at: None, ..
            }) => -1,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => {
                let remaining = at.saturating_duration_since(Instant::now());
                // Redis reports the nearest whole second, so a key about to
                // expire can read 0.
                ((remaining.as_millis() + 500) / 1000) as i64
            }
        })
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.data.lock().clear();
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        let message = BusMessage {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        // No subscriber is not an error; the message is simply dropped.
        self.inner.subscribers.lock().retain(|inbox| {
            if inbox.tx.is_closed() {
                return false;
            }
            if inbox.channels.lock().contains(channel) {
                let _ = inbox.tx.send(message.clone());
            }
            true
        });
        Ok(())
    }

    async fn hset(&self, key: &str, field: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        self.write(
            key,
            || Value::Hash(HashMap::new()),
            |slot| match slot {
                Value::Hash(hash) => Ok(hash.insert(field.to_vec(), value.to_vec()).is_none()),
                _ => Err(wrong_type(key, "hash")),
            },
        )
    }

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key, "hash")),
        })
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash
                .iter()
                .map(|(f, v)| (f.clone(), v.clone()))
                .collect()),
            Some(_) => Err(wrong_type(key, "hash")),
        })
    }

    async fn hdel(&self, key: &str, fields: &[Vec<u8>]) -> Result<u64, StoreError> {
        self.write(
            key,
            || Value::Hash(HashMap::new()),
            |slot| match slot {
                Value::Hash(hash) => Ok(fields
                    .iter()
                    .filter(|field| hash.remove(*field).is_some())
                    .count() as u64),
                _ => Err(wrong_type(key, "hash")),
            },
        )
    }

    async fn hexists(&self, key: &str, field: &[u8]) -> Result<bool, StoreError> {
        self.read(key, |value| match value {
            None => Ok(false),
            Some(Value::Hash(hash)) => Ok(hash.contains_key(field)),
            Some(_) => Err(wrong_type(key, "hash")),
        })
    }

    async fn hlen(&self, key: &str) -> Result<u64, StoreError> {
        self.read(key, |value| match value {
            None => Ok(0),
            Some(Value::Hash(hash)) => Ok(hash.len() as u64),
            Some(_) => Err(wrong_type(key, "hash")),
        })
    }

    async fn sadd(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError> {
        self.write(
            key,
            || Value::Set(HashSet::new()),
            |slot| match slot {
                Value::Set(set) => Ok(members
                    .iter()
                    .filter(|m| set.insert((*m).clone()))
                    .count() as u64),
                _ => Err(wrong_type(key, "set")),
            },
        )
    }

    async fn srem(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError> {
        self.write(
            key,
            || Value::Set(HashSet::new()),
            |slot| match slot {
                Value::Set(set) => Ok(members.iter().filter(|m| set.remove(*m)).count() as u64),
                _ => Err(wrong_type(key, "set")),
            },
        )
    }

    async fn smembers(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key, "set")),
        })
    }

    async fn sismember(&self, key: &str, member: &[u8]) -> Result<bool, StoreError> {
        self.read(key, |value| match value {
            None => Ok(false),
            Some(Value::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key, "set")),
        })
    }

    async fn scard(&self, key: &str) -> Result<u64, StoreError> {
        self.read(key, |value| match value {
            None => Ok(0),
            Some(Value::Set(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key, "set")),
        })
    }

    async fn zadd(&self, key: &str, members: &[(f64, Vec<u8>)]) -> Result<u64, StoreError> {
        self.write(
            key,
            || Value::ZSet(BTreeMap::new()),
            |slot| match slot {
                Value::ZSet(zset) => Ok(members
                    .iter()
                    .filter(|(score, member)| zset.insert(member.clone(), *score).is_none())
                    .count() as u64),
                _ => Err(wrong_type(key, "zset")),
            },
        )
    }

    async fn zrange(
        &self,
        key: &str,
        start: i64,
        stop: i64,
        reverse: bool,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::ZSet(zset)) => {
                let members = sorted_members(zset, reverse);
                Ok(match resolve_range(members.len(), start, stop) {
                    Some(range) => members[range].iter().map(|(m, _)| (*m).clone()).collect(),
                    None => Vec::new(),
                })
            }
            Some(_) => Err(wrong_type(key, "zset")),
        })
    }

    async fn zrem(&self, key: &str, members: &[Vec<u8>]) -> Result<u64, StoreError> {
        self.write(
            key,
            || Value::ZSet(BTreeMap::new()),
            |slot| match slot {
                Value::ZSet(zset) => {
                    Ok(members.iter().filter(|m| zset.remove(*m).is_some()).count() as u64)
                }
                _ => Err(wrong_type(key, "zset")),
            },
        )
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> Result<Option<f64>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::ZSet(zset)) => Ok(zset.get(member).copied()),
            Some(_) => Err(wrong_type(key, "zset")),
        })
    }

    async fn zrank(
        &self,
        key: &str,
        member: &[u8],
        reverse: bool,
    ) -> Result<Option<u64>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::ZSet(zset)) => Ok(sorted_members(zset, reverse)
                .iter()
                .position(|(m, _)| m.as_slice() == member)
                .map(|rank| rank as u64)),
            Some(_) => Err(wrong_type(key, "zset")),
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        self.read(key, |value| match value {
            None => Ok(0),
            Some(Value::ZSet(zset)) => Ok(zset.len() as u64),
            Some(_) => Err(wrong_type(key, "zset")),
        })
    }

    async fn push(&self, key: &str, values: &[Vec<u8>], end: ListEnd) -> Result<u64, StoreError> {
        self.write(
            key,
            || Value::List(VecDeque::new()),
            |slot| match slot {
                Value::List(list) => {
                    for value in values {
                        match end {
                            ListEnd::Head => list.push_front(value.clone()),
                            ListEnd::Tail => list.push_back(value.clone()),
                        }
                    }
                    Ok(list.len() as u64)
                }
                _ => Err(wrong_type(key, "list")),
            },
        )
    }

    async fn pop(&self, key: &str, end: ListEnd) -> Result<Option<Vec<u8>>, StoreError> {
        self.write(
            key,
            || Value::List(VecDeque::new()),
            |slot| match slot {
                Value::List(list) => Ok(match end {
                    ListEnd::Head => list.pop_front(),
                    ListEnd::Tail => list.pop_back(),
                }),
                _ => Err(wrong_type(key, "list")),
            },
        )
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(match resolve_range(list.len(), start, stop) {
                Some(range) => list.range(range).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key, "list")),
        })
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.read(key, |value| match value {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key, "list")),
        })
    }

    async fn lset(&self, key: &str, index: i64, value: &[u8]) -> Result<(), StoreError> {
        self.check_available()?;
        let mut data = self.inner.data.lock();
        purge_if_expired(&mut data, key);
        match data.get_mut(key).map(|slot| &mut slot.value) {
            None => Err(StoreError::command("no such key")),
            Some(Value::List(list)) => match list_index(list.len(), index) {
                Some(i) => {
                    list[i] = value.to_vec();
                    Ok(())
                }
                None => Err(StoreError::command("index out of range")),
            },
            Some(_) => Err(wrong_type(key, "list")),
        }
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(key, |value| match value {
            None => Ok(None),
            Some(Value::List(list)) => {
                Ok(list_index(list.len(), index).and_then(|i| list.get(i).cloned()))
            }
            Some(_) => Err(wrong_type(key, "list")),
        })
    }
}

#[async_trait]
impl PubSubTransport for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn SubscriptionConnection>, BusError> {
        if !self.inner.pubsub_available.load(Ordering::SeqCst) {
            return Err(BusError::Connect("memory broker unavailable".to_string()));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Arc::new(Inbox {
            channels: Mutex::new(HashSet::new()),
            tx,
        });
        self.inner.subscribers.lock().push(Arc::clone(&inbox));
        Ok(Box::new(MemorySubscription {
            inbox,
            rx,
            severed: self.inner.severed.lock().clone(),
        }))
    }
}

/// Delivery side of one subscription connection, registered with the broker.
struct Inbox {
    channels: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

struct MemorySubscription {
    inbox: Arc<Inbox>,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    severed: CancellationToken,
}

#[async_trait]
impl SubscriptionConnection for MemorySubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), BusError> {
        if self.severed.is_cancelled() {
            return Err(BusError::subscribe(channel, "connection severed"));
        }
        self.inbox.channels.lock().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), BusError> {
        if self.severed.is_cancelled() {
            return Err(BusError::unsubscribe(channel, "connection severed"));
        }
        self.inbox.channels.lock().remove(channel);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<BusMessage> {
        tokio::select! {
            _ = self.severed.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }
}
