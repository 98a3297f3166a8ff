//! Per-key debouncing of rapid event bursts.
//!
//! Each group key collects entries while submissions keep arriving; the
//! quiet-period deadline is pushed out on every submit. When the deadline
//! passes untouched, everything pending for that key is delivered as one
//! call, in submission order. Keys debounce independently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::event::Entry;

/// Downstream consumer of debounced deliveries.
#[async_trait]
pub trait DebounceConsumer: Send + Sync {
    async fn deliver(&self, group_key: &str, entries: Vec<Entry>);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(1),
        }
    }
}

impl DebounceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.delay.is_zero() {
            return Err(Error::Config("debounce delay must be greater than 0".into()));
        }
        Ok(())
    }
}

struct KeyState {
    pending: Vec<Entry>,
    deadline: Instant,
    timer_running: bool,
}

pub struct Debouncer {
    delay: Duration,
    consumer: Arc<dyn DebounceConsumer>,
    keys: RwLock<HashMap<String, Arc<Mutex<KeyState>>>>,
}

impl Debouncer {
    pub fn new(config: &DebounceConfig, consumer: Arc<dyn DebounceConsumer>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            delay: config.delay,
            consumer,
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// Queue an entry and (re)start the quiet-period countdown for its key.
    ///
    /// Must be called from within a tokio runtime; the countdown runs as a
    /// task per active key and exits once it has delivered.
    pub fn submit(self: &Arc<Self>, entry: Entry) -> Result<()> {
        let key = entry.group_key.clone();
        let state = self.key_state(&key)?;

        let spawn_timer = {
            let mut st = state
                .lock()
                .map_err(|_| Error::Internal("debounce key lock poisoned".into()))?;
            st.pending.push(entry);
            st.deadline = Instant::now() + self.delay;
            let spawn = !st.timer_running;
            st.timer_running = true;
            spawn
        };

        if spawn_timer {
            let debouncer = Arc::clone(self);
            tokio::spawn(async move {
                debouncer.run_timer(key, state).await;
            });
        }
        Ok(())
    }

    async fn run_timer(&self, key: String, state: Arc<Mutex<KeyState>>) {
        loop {
            let deadline = match state.lock() {
                Ok(st) => st.deadline,
                Err(_) => return,
            };
            tokio::time::sleep_until(deadline).await;

            // A submit may have extended the deadline while we slept.
            let ready = match state.lock() {
                Ok(mut st) => {
                    if Instant::now() >= st.deadline {
                        st.timer_running = false;
                        Some(std::mem::take(&mut st.pending))
                    } else {
                        None
                    }
                }
                Err(_) => return,
            };

            match ready {
                Some(entries) => {
                    if !entries.is_empty() {
                        tracing::debug!(
                            target: "coalescer::debouncer",
                            group_key = %key,
                            count = entries.len(),
                            "quiet period elapsed, delivering"
                        );
                        self.consumer.deliver(&key, entries).await;
                    }
                    return;
                }
                None => continue,
            }
        }
    }

    fn key_state(&self, key: &str) -> Result<Arc<Mutex<KeyState>>> {
        {
            let keys = self
                .keys
                .read()
                .map_err(|_| Error::Internal("debounce map lock poisoned".into()))?;
            if let Some(state) = keys.get(key) {
                return Ok(Arc::clone(state));
            }
        }

        let mut keys = self
            .keys
            .write()
            .map_err(|_| Error::Internal("debounce map lock poisoned".into()))?;
        let state = keys.entry(key.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(KeyState {
                pending: Vec::new(),
                deadline: Instant::now(),
                timer_running: false,
            }))
        });
        Ok(Arc::clone(state))
    }

    /// Deliver everything still pending, bypassing the countdowns.
    ///
    /// Called on shutdown so buffered entries are handed downstream
    /// instead of dropped. Countdown tasks notice their pending lists are
    /// empty and exit without a second delivery.
    pub async fn flush_all(&self) -> Result<()> {
        let states: Vec<(String, Arc<Mutex<KeyState>>)> = {
            let keys = self
                .keys
                .read()
                .map_err(|_| Error::Internal("debounce map lock poisoned".into()))?;
            keys.iter()
                .map(|(k, v)| (k.clone(), Arc::clone(v)))
                .collect()
        };

        for (key, state) in states {
            let entries = {
                let mut st = state
                    .lock()
                    .map_err(|_| Error::Internal("debounce key lock poisoned".into()))?;
                std::mem::take(&mut st.pending)
            };
            if !entries.is_empty() {
                tracing::info!(
                    target: "coalescer::debouncer",
                    group_key = %key,
                    count = entries.len(),
                    "flushing pending entries on shutdown"
                );
                self.consumer.deliver(&key, entries).await;
            }
        }
        Ok(())
    }

    /// Number of keys with undelivered entries.
    pub fn pending_keys(&self) -> Result<usize> {
        let keys = self
            .keys
            .read()
            .map_err(|_| Error::Internal("debounce map lock poisoned".into()))?;
        let mut count = 0;
        for state in keys.values() {
            let st = state
                .lock()
                .map_err(|_| Error::Internal("debounce key lock poisoned".into()))?;
            if !st.pending.is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }
}
