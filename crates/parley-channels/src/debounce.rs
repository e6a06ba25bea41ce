use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_common::ConversationId;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::traits::FlushFn;

/// Messages waiting for the quiet period of one conversation to end.
struct PendingBatch {
    parts: Vec<String>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    on_flush: FlushFn,
}

/// Coalesces quick successive messages of a conversation into one unit.
///
/// Each call appends to the conversation's buffer and re-arms a single flush
/// timer. When the timer fires the buffer is joined with newlines and handed
/// to the most recently supplied `on_flush`, exactly once.
pub struct Debouncer {
    window: Duration,
    batches: Arc<DashMap<ConversationId, PendingBatch>>,
    stopped: Arc<AtomicBool>,
    generation: AtomicU64,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            batches: Arc::new(DashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Buffer `text` using the default window. Returns `false` after [`stop`](Self::stop).
    pub async fn debounce(&self, id: &ConversationId, text: String, on_flush: FlushFn) -> bool {
        self.debounce_with_window(id, text, self.window, on_flush)
            .await
    }

    /// Buffer `text` using an explicit window. A zero window flushes the
    /// buffer (including anything already pending) immediately.
    pub async fn debounce_with_window(
        &self,
        id: &ConversationId,
        text: String,
        window: Duration,
        on_flush: FlushFn,
    ) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            debug!(conversation = %id, "debouncer stopped, dropping message");
            return false;
        }

        if window.is_zero() {
            let mut parts = match self.batches.remove(id) {
                Some((_, batch)) => {
                    if let Some(timer) = batch.timer {
                        timer.abort();
                    }
                    batch.parts
                }
                None => Vec::new(),
            };
            parts.push(text);
            on_flush(id.clone(), parts.join("\n")).await;
            return true;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Append and re-arm under the same shard lock so a concurrent flush
        // can never observe one without the other.
        match self.batches.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let batch = occupied.get_mut();
                batch.parts.push(text);
                batch.generation = generation;
                batch.on_flush = on_flush;
                if let Some(previous) = batch.timer.take() {
                    previous.abort();
                }
                batch.timer = Some(self.spawn_timer(id.clone(), generation, window));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PendingBatch {
                    parts: vec![text],
                    generation,
                    timer: Some(self.spawn_timer(id.clone(), generation, window)),
                    on_flush,
                });
            }
        }
        true
    }

    fn spawn_timer(&self, id: ConversationId, generation: u64, window: Duration) -> JoinHandle<()> {
        let batches = Arc::clone(&self.batches);
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // A newer message re-armed the timer if the generation moved on.
            let Some((_, batch)) = batches.remove_if(&id, |_, b| b.generation == generation)
            else {
                return;
            };
            if stopped.load(Ordering::SeqCst) {
                return;
            }
            debug!(conversation = %id, parts = batch.parts.len(), "debounce window elapsed");
            (batch.on_flush)(id, batch.parts.join("\n")).await;
        })
    }

    /// Number of messages waiting for the conversation's window to close.
    pub fn pending(&self, id: &ConversationId) -> usize {
        self.batches.get(id).map(|b| b.parts.len()).unwrap_or(0)
    }

    /// Cancel every timer and refuse further scheduling. Pending text is dropped.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let ids: Vec<ConversationId> = self.batches.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, batch)) = self.batches.remove(&id) {
                if let Some(timer) = batch.timer {
                    timer.abort();
                }
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn collector() -> (FlushFn, mpsc::UnboundedReceiver<(ConversationId, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let on_flush: FlushFn = Arc::new(move |id, text| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send((id, text));
            })
        });
        (on_flush, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn quick_messages_flush_once_newline_joined() {
        let debouncer = Debouncer::new(Duration::from_millis(500));
        let (on_flush, mut rx) = collector();
        let id = ConversationId::new("c1");

        for text in ["a", "b", "c"] {
            assert!(debouncer.debounce(&id, text.into(), on_flush.clone()).await);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(debouncer.pending(&id), 3);

        let (flushed_id, unit) = rx.recv().await.unwrap();
        assert_eq!(flushed_id, id);
        assert_eq!(unit, "a\nb\nc");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err(), "flush must happen exactly once");
        assert_eq!(debouncer.pending(&id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn message_after_window_is_its_own_unit() {
        let debouncer = Debouncer::new(Duration::from_millis(200));
        let (on_flush, mut rx) = collector();
        let id = ConversationId::new("c1");

        debouncer.debounce(&id, "first".into(), on_flush.clone()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        debouncer.debounce(&id, "second".into(), on_flush.clone()).await;

        assert_eq!(rx.recv().await.unwrap().1, "first");
        assert_eq!(rx.recv().await.unwrap().1, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn conversations_do_not_share_buffers() {
        let debouncer = Debouncer::new(Duration::from_millis(200));
        let (on_flush, mut rx) = collector();

        debouncer.debounce(&"a".into(), "one".into(), on_flush.clone()).await;
        debouncer.debounce(&"b".into(), "two".into(), on_flush.clone()).await;

        let mut got = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        got.sort();
        assert_eq!(
            got,
            vec![
                (ConversationId::new("a"), "one".to_string()),
                (ConversationId::new("b"), "two".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_flushes_pending_and_new_text_now() {
        let debouncer = Debouncer::new(Duration::from_millis(200));
        let (on_flush, mut rx) = collector();
        let id = ConversationId::new("c1");

        debouncer.debounce(&id, "queued".into(), on_flush.clone()).await;
        debouncer
            .debounce_with_window(&id, "now".into(), Duration::ZERO, on_flush.clone())
            .await;

        assert_eq!(rx.try_recv().unwrap().1, "queued\nnow");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_timers_and_blocks_scheduling() {
        let debouncer = Debouncer::new(Duration::from_millis(200));
        let (on_flush, mut rx) = collector();
        let id = ConversationId::new("c1");

        debouncer.debounce(&id, "lost".into(), on_flush.clone()).await;
        debouncer.stop();
        assert!(!debouncer.debounce(&id, "refused".into(), on_flush.clone()).await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert!(debouncer.is_stopped());
    }
}
