//! Request-level state: the sibling sequence group, the output event shapes
//! delivered through the sink, and the weak handle callers keep.
//!
//! Sinks run on the scheduler thread and must not block; the provided
//! [`ChannelSink`] enqueues with `try_send` and reports a full queue as
//! backpressure, which the scheduler absorbs into a per-request buffer until
//! the configured grace runs out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use spate_engine::SeqId;

use crate::sequence::{FinishReason, SamplingParams, Sequence};

pub type RequestId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn promoted(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            _ => Priority::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Running,
    Preempted,
    Finished,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Finished | RequestStatus::Cancelled)
    }
}

/// One completed alternative of a request.
#[derive(Debug, Clone, Serialize)]
pub struct Choice {
    pub index: usize,
    pub text: String,
    pub finish_reason: FinishReason,
    pub cumulative_logprob: f32,
    pub num_tokens: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum OutputEvent {
    /// Streaming increment for one sequence. The first delta of a sequence
    /// carries empty text to announce it.
    Delta {
        index: usize,
        text: String,
        finish_reason: Option<FinishReason>,
    },
    /// Terminal event: the chosen sequences' full texts plus accounting.
    Finish { choices: Vec<Choice>, usage: Usage },
    /// Admission failure; no other event follows.
    Rejected { message: String },
}

/// Consumer-side callback for one request. Returning `false` refuses the
/// event: the scheduler keeps it buffered and eventually cancels the request.
pub trait OutputSink: Send {
    fn deliver(&self, event: OutputEvent) -> bool;
}

/// Sink backed by a bounded channel; the transport drains the receiver on
/// its own thread.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<OutputEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn deliver(&self, event: OutputEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// What callers hold: an id and the shared cancel flag. Cancellation is
/// observed by the scheduler at its next step boundary.
#[derive(Clone)]
pub struct RequestHandle {
    pub id: RequestId,
    cancelled: Arc<AtomicBool>,
}

impl RequestHandle {
    pub fn new(id: RequestId, cancelled: Arc<AtomicBool>) -> Self {
        Self { id, cancelled }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

pub enum FlushOutcome {
    /// Buffer drained.
    Clear,
    /// Sink refused; events stay buffered.
    Backpressured,
    /// Sink refused for longer than the grace period.
    GraceExceeded,
}

pub struct Request {
    pub id: RequestId,
    pub priority: Priority,
    pub arrival: Instant,
    pub stream: bool,
    pub sampling: Arc<SamplingParams>,
    pub seq_ids: Vec<SeqId>,
    pub sink: Box<dyn OutputSink>,
    pub status: RequestStatus,
    pub cancel: Arc<AtomicBool>,
    pub num_prompt_tokens: usize,
    /// Prefill passes that skipped this request; drives priority escalation.
    pub skips: u32,
    /// Basis for aging promotion; reset whenever the request (re)enters a
    /// queue or is promoted.
    pub queued_since: Instant,
    /// Siblings have been forked off the prefilled seed sequence.
    pub forked: bool,
    pending: VecDeque<OutputEvent>,
    backpressure_since: Option<Instant>,
}

impl Request {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: RequestId,
        priority: Priority,
        arrival: Instant,
        stream: bool,
        sampling: Arc<SamplingParams>,
        sink: Box<dyn OutputSink>,
        cancel: Arc<AtomicBool>,
        num_prompt_tokens: usize,
    ) -> Self {
        Self {
            id,
            priority,
            arrival,
            stream,
            sampling,
            seq_ids: Vec::new(),
            sink,
            status: RequestStatus::Pending,
            cancel,
            num_prompt_tokens,
            skips: 0,
            queued_since: Instant::now(),
            forked: false,
            pending: VecDeque::new(),
            backpressure_since: None,
        }
    }

    pub fn n(&self) -> usize {
        self.sampling.n
    }

    pub fn best_of(&self) -> usize {
        self.sampling.best_of()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn push_event(&mut self, event: OutputEvent) {
        self.pending.push_back(event);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Deliver buffered events in order, exactly once each. Stops at the
    /// first refusal and reports when the refusal has outlived `grace`.
    pub fn flush(&mut self, grace: Duration) -> FlushOutcome {
        while let Some(event) = self.pending.front() {
            if self.sink.deliver(event.clone()) {
                self.pending.pop_front();
                self.backpressure_since = None;
            } else {
                let since = *self.backpressure_since.get_or_insert_with(Instant::now);
                if since.elapsed() > grace {
                    return FlushOutcome::GraceExceeded;
                }
                return FlushOutcome::Backpressured;
            }
        }
        FlushOutcome::Clear
    }

    pub fn drop_pending(&mut self) {
        self.pending.clear();
        self.backpressure_since = None;
    }

    /// Build the terminal event: every sibling becomes a choice, and for
    /// `best_of > n` only the top `n` by length-normalized cumulative
    /// logprob survive.
    pub fn final_event(&self, seqs: &HashMap<SeqId, Sequence>) -> OutputEvent {
        let mut choices: Vec<Choice> = Vec::new();
        let mut completion_tokens = 0;
        for sid in &self.seq_ids {
            let Some(seq) = seqs.get(sid) else { continue };
            completion_tokens += seq.completion_len();
            choices.push(Choice {
                index: seq.index,
                text: seq.output_text().to_string(),
                finish_reason: seq.finish().unwrap_or(FinishReason::Error),
                cumulative_logprob: seq.cumulative_logprob,
                num_tokens: seq.completion_len(),
            });
        }
        if choices.len() > self.n() {
            choices.sort_by(|a, b| {
                normalized_logprob(b)
                    .partial_cmp(&normalized_logprob(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            choices.truncate(self.n());
            choices.sort_by_key(|c| c.index);
        }
        let usage = Usage {
            prompt_tokens: self.num_prompt_tokens,
            completion_tokens,
            total_tokens: self.num_prompt_tokens + completion_tokens,
        };
        OutputEvent::Finish { choices, usage }
    }
}

fn normalized_logprob(choice: &Choice) -> f32 {
    if choice.num_tokens == 0 {
        f32::NEG_INFINITY
    } else {
        choice.cumulative_logprob / choice.num_tokens as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_and_promotes() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!(Priority::Low.promoted(), Priority::Normal);
        assert_eq!(Priority::High.promoted(), Priority::High);
    }

    #[test]
    fn channel_sink_reports_full_queue() {
        let (sink, mut rx) = ChannelSink::new(1);
        assert!(sink.deliver(OutputEvent::Rejected { message: "a".into() }));
        assert!(!sink.deliver(OutputEvent::Rejected { message: "b".into() }));
        assert!(rx.try_recv().is_ok());
        assert!(sink.deliver(OutputEvent::Rejected { message: "c".into() }));
    }

    #[test]
    fn handle_cancel_is_shared() {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = RequestHandle::new("req-1".into(), flag.clone());
        handle.cancel();
        assert!(flag.load(Ordering::Relaxed));
        assert!(handle.is_cancelled());
    }

    #[test]
    fn events_serialize_for_transports() {
        let delta = OutputEvent::Delta {
            index: 0,
            text: "hi".into(),
            finish_reason: Some(FinishReason::Stop),
        };
        let json = serde_json::to_value(&delta).expect("serialize");
        assert_eq!(json["event"], "delta");
        assert_eq!(json["finish_reason"], "stop");

        let finish = OutputEvent::Finish {
            choices: vec![Choice {
                index: 0,
                text: "hi".into(),
                finish_reason: FinishReason::Length,
                cumulative_logprob: -0.5,
                num_tokens: 2,
            }],
            usage: Usage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 },
        };
        let json = serde_json::to_value(&finish).expect("serialize");
        assert_eq!(json["usage"]["total_tokens"], 3);
        assert_eq!(json["choices"][0]["finish_reason"], "length");
    }
}
