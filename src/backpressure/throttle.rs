//! Per-channel throttle, debounce and cached-invoke coalescing.
//!
//! Protects a downstream consumer from message floods. Every channel owns at
//! most one armed timer; throttle and debounce on the same channel share it,
//! so the most recent call decides what the timer delivers.
//!
//! Each armed timer carries a generation number. A timer that wakes after it
//! was superseded finds a different generation in its slot and does nothing,
//! which keeps cancellation idempotent even when `abort` races the wake-up.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::governor::{Reclaimable, SizeProbe};
use crate::types::{Result, ThrottleConfig};

/// Host capability that actually delivers messages.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a single message.
    async fn send(&self, channel: &str, data: Value) -> Result<()>;

    /// Deliver an accumulated batch in one call.
    async fn send_batch(&self, channel: &str, batch: Vec<Value>) -> Result<()>;

    /// Request/response call.
    async fn invoke(&self, channel: &str, data: &Value) -> Result<Value>;
}

#[derive(Debug)]
struct ArmedTimer {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct ChannelState {
    batch: Vec<Value>,
    batch_started: Option<Instant>,
    timer: Option<ArmedTimer>,
}

impl ChannelState {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.task.abort();
        }
    }

    /// Take the timer slot if it still belongs to `generation`.
    fn claim(&mut self, generation: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.generation == generation => {
                // Dropping the JoinHandle detaches; the caller *is* this task.
                self.timer = None;
                true
            }
            _ => false,
        }
    }

    fn take_batch(&mut self) -> Vec<Value> {
        self.batch_started = None;
        std::mem::take(&mut self.batch)
    }

    fn is_idle(&self) -> bool {
        self.batch.is_empty() && self.timer.is_none()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    channels: HashMap<String, ChannelState>,
    cache: HashMap<String, CacheEntry>,
    next_generation: u64,
}

impl State {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Forget a channel that holds nothing and has no timer armed.
    fn prune(&mut self, channel: &str) {
        if self.channels.get(channel).is_some_and(ChannelState::is_idle) {
            self.channels.remove(channel);
        }
    }
}

struct Inner {
    config: ThrottleConfig,
    state: Mutex<State>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Throttle layer over named channels.
///
/// Cheap to clone; clones share channels, cache and transport.
#[derive(Debug, Clone)]
pub struct ThrottleLayer {
    inner: Arc<Inner>,
}

impl ThrottleLayer {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                transport: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }

    /// Install the delivery transport.
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.inner.transport.write().await = Some(transport);
    }

    /// Remove the transport; subsequent deliveries become no-ops.
    pub async fn clear_transport(&self) {
        *self.inner.transport.write().await = None;
    }

    // =========================================================================
    // Coalescing policies
    // =========================================================================

    /// Queue `data` and (re)arm the channel's flush timer.
    ///
    /// All calls inside a quiet window of `delay` are delivered as one batch.
    /// With `max_batch_age` set, re-arming never pushes the flush past
    /// `first_call + max_batch_age`.
    pub async fn throttle(&self, channel: &str, data: Value, delay: impl Into<Option<Duration>>) {
        let delay = delay.into().unwrap_or(self.inner.config.default_delay);
        let now = Instant::now();
        let max_batch_age = self.inner.config.max_batch_age;

        let mut state = self.inner.state.lock().await;
        let generation = state.next_generation();
        let entry = state.channels.entry(channel.to_string()).or_default();

        entry.batch.push(data);
        let started = *entry.batch_started.get_or_insert(now);
        let mut deadline = now + delay;
        if let Some(max_age) = max_batch_age {
            deadline = deadline.min(started + max_age);
        }

        entry.disarm();
        let inner = Arc::clone(&self.inner);
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            match Inner::fire_flush(&inner, &channel_name, generation).await {
                Ok(delivered) => {
                    tracing::debug!(
                        "throttle_flushed: channel={}, items={}",
                        channel_name,
                        delivered
                    );
                }
                Err(e) => {
                    tracing::warn!("throttle_flush_failed: channel={}, error={}", channel_name, e);
                }
            }
        });
        entry.timer = Some(ArmedTimer { generation, task });
    }

    /// Replace any pending delivery on the channel with `data`.
    ///
    /// Only the latest call inside a quiet window of `delay` is delivered.
    pub async fn debounce(&self, channel: &str, data: Value, delay: impl Into<Option<Duration>>) {
        let delay = delay.into().unwrap_or(self.inner.config.default_delay);
        let mut state = self.inner.state.lock().await;
        let generation = state.next_generation();
        let entry = state.channels.entry(channel.to_string()).or_default();

        entry.disarm();
        let inner = Arc::clone(&self.inner);
        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = Inner::fire_debounce(&inner, &channel_name, generation, data).await {
                tracing::warn!("debounce_send_failed: channel={}, error={}", channel_name, e);
            }
        });
        entry.timer = Some(ArmedTimer { generation, task });
    }

    /// Return a live cached response or perform the real invoke.
    ///
    /// Failures propagate and are never cached, so the next call retries.
    pub async fn cached_invoke(
        &self,
        channel: &str,
        data: &Value,
        ttl: impl Into<Option<Duration>>,
    ) -> Result<Value> {
        let ttl = ttl.into().unwrap_or(self.inner.config.default_ttl);
        let key = cache_key(channel, data)?;

        {
            let state = self.inner.state.lock().await;
            if let Some(entry) = state.cache.get(&key) {
                if entry.stored_at.elapsed() < ttl {
                    tracing::trace!("cache_hit: channel={}", channel);
                    return Ok(entry.value.clone());
                }
            }
        }

        let transport = self.inner.transport.read().await.clone();
        let Some(transport) = transport else {
            tracing::debug!("invoke_skipped_no_transport: channel={}", channel);
            return Ok(Value::Null);
        };

        let value = transport.invoke(channel, data).await?;

        let mut state = self.inner.state.lock().await;
        state.cache.insert(
            key,
            CacheEntry {
                value: value.clone(),
                stored_at: Instant::now(),
            },
        );
        let swept = sweep_expired(&mut state.cache, self.inner.config.max_cache_age);
        if swept > 0 {
            tracing::debug!("cache_swept: removed={}", swept);
        }

        Ok(value)
    }

    /// Deliver the channel's pending batch now, cancelling its timer.
    ///
    /// Returns the number of items delivered. Transport failures propagate.
    pub async fn flush(&self, channel: &str) -> Result<usize> {
        let batch = {
            let mut state = self.inner.state.lock().await;
            let batch = match state.channels.get_mut(channel) {
                Some(entry) => {
                    entry.disarm();
                    entry.take_batch()
                }
                None => return Ok(0),
            };
            state.prune(channel);
            batch
        };
        self.inner.deliver_batch(channel, batch).await
    }

    // =========================================================================
    // Introspection and load shedding
    // =========================================================================

    /// Items waiting in one channel's batch.
    pub async fn pending_len(&self, channel: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.channels.get(channel).map_or(0, |c| c.batch.len())
    }

    /// Items waiting across all channels.
    pub async fn total_pending(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.channels.values().map(|c| c.batch.len()).sum()
    }

    pub async fn cache_len(&self) -> usize {
        self.inner.state.lock().await.cache.len()
    }

    /// Channels with an armed timer.
    pub async fn armed_timers(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.channels.values().filter(|c| c.timer.is_some()).count()
    }

    /// Drop every cached response. Returns the number removed.
    pub async fn clear_cache(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let removed = state.cache.len();
        state.cache.clear();
        removed
    }

    /// Drop cached responses older than `max_cache_age`.
    pub async fn sweep_cache(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        sweep_expired(&mut state.cache, self.inner.config.max_cache_age)
    }

    /// Cancel every timer, then drop pending batches, then drop the cache.
    ///
    /// Idempotent; the layer stays usable afterwards.
    pub async fn destroy(&self) {
        let mut state = self.inner.state.lock().await;
        for entry in state.channels.values_mut() {
            entry.disarm();
        }
        let dropped: usize = state.channels.values().map(|c| c.batch.len()).sum();
        state.channels.clear();
        state.cache.clear();
        tracing::debug!("throttle_destroyed: dropped_items={}", dropped);
    }
}

impl Inner {
    async fn fire_flush(inner: &Arc<Inner>, channel: &str, generation: u64) -> Result<usize> {
        let batch = {
            let mut state = inner.state.lock().await;
            let Some(entry) = state.channels.get_mut(channel) else {
                return Ok(0);
            };
            if !entry.claim(generation) {
                return Ok(0);
            }
            let batch = entry.take_batch();
            state.prune(channel);
            batch
        };
        inner.deliver_batch(channel, batch).await
    }

    async fn fire_debounce(
        inner: &Arc<Inner>,
        channel: &str,
        generation: u64,
        data: Value,
    ) -> Result<()> {
        {
            let mut state = inner.state.lock().await;
            let Some(entry) = state.channels.get_mut(channel) else {
                return Ok(());
            };
            if !entry.claim(generation) {
                return Ok(());
            }
            state.prune(channel);
        }
        let transport = inner.transport.read().await.clone();
        match transport {
            Some(transport) => transport.send(channel, data).await,
            None => {
                tracing::debug!("send_skipped_no_transport: channel={}", channel);
                Ok(())
            }
        }
    }

    async fn deliver_batch(&self, channel: &str, batch: Vec<Value>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        let transport = self.transport.read().await.clone();
        let Some(transport) = transport else {
            tracing::debug!(
                "batch_dropped_no_transport: channel={}, items={}",
                channel,
                batch.len()
            );
            return Ok(0);
        };
        let count = batch.len();
        transport.send_batch(channel, batch).await?;
        Ok(count)
    }
}

fn cache_key(channel: &str, data: &Value) -> Result<String> {
    Ok(format!("{}:{}", channel, serde_json::to_string(data)?))
}

fn sweep_expired(cache: &mut HashMap<String, CacheEntry>, max_age: Duration) -> usize {
    let before = cache.len();
    cache.retain(|_, entry| entry.stored_at.elapsed() <= max_age);
    before - cache.len()
}

#[async_trait]
impl SizeProbe for ThrottleLayer {
    async fn size(&self) -> Result<usize> {
        Ok(self.total_pending().await)
    }
}

#[async_trait]
impl Reclaimable for ThrottleLayer {
    async fn reclaim(&self) -> Result<usize> {
        Ok(self.clear_cache().await)
    }
}
