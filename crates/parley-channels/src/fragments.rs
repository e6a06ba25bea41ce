use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_common::ConversationId;
use parley_config::FragmentConfig;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::traits::FlushFn;

/// Parts of one long paste that the transport delivered as several messages.
struct FragmentEntry {
    parts: Vec<String>,
    last_sequence: i64,
    last_at: Instant,
    total_chars: usize,
    author_id: String,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl FragmentEntry {
    fn accepts(
        &self,
        config: &FragmentConfig,
        author_id: &str,
        sequence: i64,
        chars: usize,
        now: Instant,
    ) -> bool {
        let sequence_gap = sequence - self.last_sequence;
        self.author_id == author_id
            && sequence_gap >= 1
            && sequence_gap <= config.max_sequence_gap
            && now.duration_since(self.last_at) <= config.max_gap()
            && self.parts.len() < config.max_parts
            && self.total_chars + chars <= config.max_total_chars
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn joined(&self) -> String {
        self.parts.concat()
    }
}

/// Reassembles a long paste that the transport split into several messages.
///
/// A message of at least `start_threshold_chars` opens a buffer; follow-ups
/// from the same author with adjacent sequence numbers that arrive within
/// `max_gap` are appended. The buffer flushes through `on_flush` when the gap
/// timer fires, or is returned from [`observe`](Self::observe) when a
/// non-matching message forces it out.
pub struct FragmentReassembler {
    config: FragmentConfig,
    entries: Arc<DashMap<ConversationId, FragmentEntry>>,
    on_flush: FlushFn,
    generation: AtomicU64,
}

impl FragmentReassembler {
    pub fn new(config: FragmentConfig, on_flush: FlushFn) -> Self {
        Self {
            config,
            entries: Arc::new(DashMap::new()),
            on_flush,
            generation: AtomicU64::new(0),
        }
    }

    /// Feed one inbound message.
    ///
    /// Returns the units ready right now, in arrival order: a buffer forced
    /// out by this message comes first, followed by this message itself if
    /// it passes straight through. An empty result means the text was buffered.
    pub fn observe(
        &self,
        id: &ConversationId,
        author_id: &str,
        sequence: i64,
        text: String,
    ) -> Vec<String> {
        if !self.config.enabled {
            return vec![text];
        }

        let now = Instant::now();
        let chars = text.chars().count();
        let mut ready = Vec::new();

        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied
                    .get()
                    .accepts(&self.config, author_id, sequence, chars, now)
                {
                    let generation = self.next_generation();
                    let entry = occupied.get_mut();
                    entry.cancel_timer();
                    entry.total_chars += chars;
                    entry.parts.push(text);
                    entry.last_sequence = sequence;
                    entry.last_at = now;
                    entry.generation = generation;
                    entry.timer = Some(self.spawn_timer(id.clone(), generation));
                    debug!(
                        conversation = %id,
                        parts = entry.parts.len(),
                        "appended fragment"
                    );
                    return ready;
                }

                // Forced flush, then look at the trigger as if nothing was open.
                let mut stale = if self.opens_entry(chars) {
                    let fresh = self.fresh_entry(id, author_id, sequence, text, chars, now);
                    occupied.insert(fresh)
                } else {
                    ready.push(text);
                    occupied.remove()
                };
                stale.cancel_timer();
                debug!(conversation = %id, parts = stale.parts.len(), "forced fragment flush");
                ready.insert(0, stale.joined());
            }
            Entry::Vacant(vacant) => {
                if self.opens_entry(chars) {
                    vacant.insert(self.fresh_entry(id, author_id, sequence, text, chars, now));
                } else {
                    ready.push(text);
                }
            }
        }

        ready
    }

    fn opens_entry(&self, chars: usize) -> bool {
        chars >= self.config.start_threshold_chars
    }

    fn fresh_entry(
        &self,
        id: &ConversationId,
        author_id: &str,
        sequence: i64,
        text: String,
        chars: usize,
        now: Instant,
    ) -> FragmentEntry {
        let generation = self.next_generation();
        debug!(conversation = %id, chars, "possible split paste, buffering");
        FragmentEntry {
            total_chars: chars,
            parts: vec![text],
            last_sequence: sequence,
            last_at: now,
            author_id: author_id.to_string(),
            generation,
            timer: Some(self.spawn_timer(id.clone(), generation)),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn spawn_timer(&self, id: ConversationId, generation: u64) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        let on_flush = Arc::clone(&self.on_flush);
        let gap = self.config.max_gap();
        tokio::spawn(async move {
            tokio::time::sleep(gap).await;
            let Some((_, entry)) = entries.remove_if(&id, |_, e| e.generation == generation)
            else {
                return;
            };
            debug!(conversation = %id, parts = entry.parts.len(), "fragment gap elapsed");
            on_flush(id, entry.joined()).await;
        })
    }

    /// Whether a buffer is open for the conversation.
    pub fn is_buffering(&self, id: &ConversationId) -> bool {
        self.entries.contains_key(id)
    }
}
