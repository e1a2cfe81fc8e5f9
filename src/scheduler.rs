// ===============================
// src/scheduler.rs
// ===============================
//
// Debounced, cancellable remote calls keyed by an arbitrary id.
//
// - schedule(): restart the quiescence timer for the key, abort whatever was
//   pending or in flight for it, and spawn a fresh call task.
// - every call carries a per-key sequence number; completions whose number
//   is not the key's live one are dropped in next(), so a late response from
//   an aborted call can never be delivered.
// - cancel() yields exactly one Cancelled; disable() is silent.
//
use ahash::AHashMap as HashMap;
use std::collections::VecDeque;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::metrics::{CALLS_CANCELLED, CALLS_ISSUED, CALLS_SCHEDULED, STALE_SUPPRESSED};

/// Typing cadence absorbed before a call is issued.
pub const QUIESCENCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    /// Waiting for the quiescence window to elapse.
    Pending,
    /// Remote call issued, response not yet received.
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<R> {
    Resolved(R),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery<K, P, R> {
    pub key: K,
    pub seq: u64,
    pub payload: P,
    pub outcome: CallOutcome<R>,
}

enum Completion<K, R> {
    Started { key: K, seq: u64 },
    Finished { key: K, seq: u64, outcome: CallOutcome<R> },
}

struct LiveCall<P> {
    seq: u64,
    phase: CallPhase,
    payload: P,
    token: CancellationToken,
}

pub struct DebouncedCallScheduler<K, P, R> {
    quiescence: Duration,
    seqs: HashMap<K, u64>,
    live: HashMap<K, LiveCall<P>>,
    ready: VecDeque<Delivery<K, P, R>>,
    tx: mpsc::UnboundedSender<Completion<K, R>>,
    rx: mpsc::UnboundedReceiver<Completion<K, R>>,
}

impl<K, P, R> DebouncedCallScheduler<K, P, R>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    P: Clone + Send + 'static,
    R: Send + 'static,
{
    pub fn new(quiescence: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            quiescence,
            seqs: HashMap::new(),
            live: HashMap::new(),
            ready: VecDeque::new(),
            tx,
            rx,
        }
    }

    /// Returns the sequence number assigned to this call.
    pub fn schedule<F, Fut, E>(&mut self, key: K, payload: P, call: F) -> u64
    where
        F: FnOnce(P) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: Display,
    {
        if let Some(prev) = self.live.remove(&key) {
            prev.token.cancel();
            trace!(?key, seq = prev.seq, "superseded");
        }

        let seq = {
            let s = self.seqs.entry(key.clone()).or_insert(0);
            *s += 1;
            *s
        };
        let token = CancellationToken::new();
        self.live.insert(
            key.clone(),
            LiveCall {
                seq,
                phase: CallPhase::Pending,
                payload: payload.clone(),
                token: token.clone(),
            },
        );
        CALLS_SCHEDULED.inc();

        let quiescence = self.quiescence;
        let tx = self.tx.clone();
        let started_tx = tx.clone();
        let started_key = key.clone();
        let work = async move {
            tokio::time::sleep(quiescence).await;
            let _ = started_tx.send(Completion::Started { key: started_key, seq });
            CALLS_ISSUED.inc();
            match call(payload).await {
                Ok(r) => CallOutcome::Resolved(r),
                Err(e) => CallOutcome::Failed(e.to_string()),
            }
        };

        tokio::spawn(async move {
            tokio::select! {
                // dropping `work` aborts the remote call
                _ = token.cancelled() => {}
                outcome = work => {
                    let _ = tx.send(Completion::Finished { key, seq, outcome });
                }
            }
        });
        seq
    }

    /// Abort the live call for `key` and deliver one `Cancelled` for it.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.live.remove(key) {
            Some(call) => {
                call.token.cancel();
                CALLS_CANCELLED.inc();
                self.ready.push_back(Delivery {
                    key: key.clone(),
                    seq: call.seq,
                    payload: call.payload,
                    outcome: CallOutcome::Cancelled,
                });
                true
            }
            None => false,
        }
    }

    /// `enabled = false`: drop pending/in-flight work without any callback.
    pub fn disable(&mut self, key: &K) {
        if let Some(call) = self.live.remove(key) {
            call.token.cancel();
            debug!(?key, seq = call.seq, "disabled");
        }
    }

    pub fn disable_all(&mut self) {
        for (_, call) in self.live.drain() {
            call.token.cancel();
        }
        self.ready.clear();
    }

    pub fn phase(&self, key: &K) -> Option<CallPhase> {
        self.live.get(key).map(|c| c.phase)
    }

    pub fn is_busy(&self, key: &K) -> bool {
        self.live.contains_key(key)
    }

    pub fn latest_seq(&self, key: &K) -> u64 {
        self.seqs.get(key).copied().unwrap_or(0)
    }

    pub fn live_payload(&self, key: &K) -> Option<&P> {
        self.live.get(key).map(|c| &c.payload)
    }

    fn is_current(&self, key: &K, seq: u64) -> bool {
        self.seqs.get(key).is_some_and(|s| *s == seq)
    }

    /// Wait for the next relevant delivery. Cancel-safe.
    pub async fn next(&mut self) -> Delivery<K, P, R> {
        loop {
            while let Some(d) = self.ready.pop_front() {
                if self.is_current(&d.key, d.seq) {
                    return d;
                }
                STALE_SUPPRESSED.inc();
            }

            let Some(msg) = self.rx.recv().await else {
                return std::future::pending().await;
            };
            match msg {
                Completion::Started { key, seq } => {
                    if let Some(call) = self.live.get_mut(&key) {
                        if call.seq == seq {
                            call.phase = CallPhase::InFlight;
                        }
                    }
                }
                Completion::Finished { key, seq, outcome } => {
                    let live = self.live.get(&key).is_some_and(|c| c.seq == seq);
                    if !live {
                        STALE_SUPPRESSED.inc();
                        let latest = self.latest_seq(&key);
                        debug!(?key, seq, latest, "stale completion suppressed");
                        continue;
                    }
                    if let Some(call) = self.live.remove(&key) {
                        return Delivery { key, seq, payload: call.payload, outcome };
                    }
                }
            }
        }
    }
}

impl<K, P, R> Drop for DebouncedCallScheduler<K, P, R> {
    fn drop(&mut self) {
        for call in self.live.values() {
            call.token.cancel();
        }
    }
}
