//! Streaming chunk processing: worker pool, per-stream ordering,
//! backpressure and finalization.
//!
//! Upstream chunks are demultiplexed per open stream. A fixed worker pool
//! consumes one global FIFO queue; admission assigns each chunk a per-stream
//! sequence number and workers deliver through a per-stream reorder buffer,
//! so the formatter sees chunks in strict enqueue order and exactly one
//! worker writes a stream's accumulator at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::config::StreamingSettings;
use crate::error::GatewayError;
use crate::models::ApiFormat;

pub type StreamId = Uuid;

/// Immutable context attached to a stream at creation.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub client_format: ApiFormat,
    pub provider_format: ApiFormat,
}

/// Rolling accumulation over a stream, handed to the end-of-stream hook.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub chunk_count: u64,
    pub byte_count: u64,
    pub content: String,
    pub tool_calls: Vec<Value>,
}

/// Terminal envelope compiled at finalization.
#[derive(Debug, Clone, Serialize)]
pub struct FinalEnvelope {
    pub request_id: String,
    pub provider: String,
    pub content: String,
    pub tool_calls: Vec<Value>,
    pub chunk_count: u64,
    pub byte_count: u64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Per-chunk translation hook. `format_chunk` may swallow a chunk (ping
/// events and the like) by returning `None`; `end_of_stream` may emit one
/// final client-facing event.
pub trait ChunkFormatter: Send + Sync {
    fn format_chunk(
        &self,
        chunk: &Value,
        context: &StreamContext,
    ) -> Result<Option<Value>, GatewayError>;

    fn end_of_stream(&self, context: &StreamContext, stats: &StreamStats) -> Option<Value>;
}

/// Identity formatter for same-format streams.
pub struct PassthroughFormatter;

impl ChunkFormatter for PassthroughFormatter {
    fn format_chunk(
        &self,
        chunk: &Value,
        _context: &StreamContext,
    ) -> Result<Option<Value>, GatewayError> {
        Ok(Some(chunk.clone()))
    }

    fn end_of_stream(&self, _context: &StreamContext, _stats: &StreamStats) -> Option<Value> {
        None
    }
}

/// Translates streamed deltas between the provider's wire format and the
/// client's. Falls back to passthrough when the two match.
pub struct CrossFormatChunkFormatter;

impl ChunkFormatter for CrossFormatChunkFormatter {
    fn format_chunk(
        &self,
        chunk: &Value,
        context: &StreamContext,
    ) -> Result<Option<Value>, GatewayError> {
        if context.client_format == context.provider_format {
            return Ok(Some(chunk.clone()));
        }
        match (context.provider_format, context.client_format) {
            (ApiFormat::OpenAi, ApiFormat::Anthropic) => {
                if let Some(text) = openai_delta_text(chunk) {
                    return Ok(Some(json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": text},
                    })));
                }
                if let Some(reason) = chunk
                    .pointer("/choices/0/finish_reason")
                    .and_then(Value::as_str)
                {
                    let stop_reason = match reason {
                        "stop" => "end_turn",
                        "length" => "max_tokens",
                        other => other,
                    };
                    return Ok(Some(json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason},
                    })));
                }
                Ok(None)
            }
            (ApiFormat::Anthropic, ApiFormat::OpenAi) => {
                if let Some(text) = anthropic_delta_text(chunk) {
                    return Ok(Some(json!({
                        "object": "chat.completion.chunk",
                        "model": context.model,
                        "choices": [{
                            "index": 0,
                            "delta": {"content": text},
                            "finish_reason": Value::Null,
                        }],
                    })));
                }
                if chunk.get("type").and_then(Value::as_str) == Some("message_stop") {
                    return Ok(Some(json!({
                        "object": "chat.completion.chunk",
                        "model": context.model,
                        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                    })));
                }
                Ok(None)
            }
            (src, dst) => Err(GatewayError::Stream {
                message: format!("unsupported chunk translation: {src} -> {dst}"),
            }),
        }
    }

    fn end_of_stream(&self, context: &StreamContext, _stats: &StreamStats) -> Option<Value> {
        match context.client_format {
            // The [DONE] sentinel for OpenAI clients is the SSE layer's job.
            ApiFormat::Anthropic if context.provider_format != ApiFormat::Anthropic => {
                Some(json!({"type": "message_stop"}))
            }
            _ => None,
        }
    }
}

fn openai_delta_text(chunk: &Value) -> Option<&str> {
    chunk.pointer("/choices/0/delta/content").and_then(Value::as_str)
}

fn anthropic_delta_text(chunk: &Value) -> Option<&str> {
    chunk.pointer("/delta/text").and_then(Value::as_str)
}

struct Task {
    stream_id: StreamId,
    seq: u64,
    chunk: Value,
    is_final: bool,
    enqueued_at: Instant,
}

struct StreamState {
    next_seq: u64,
    pending: BTreeMap<u64, Task>,
    stats: StreamStats,
    outputs_tx: Option<mpsc::UnboundedSender<Value>>,
    result: Option<FinalEnvelope>,
    finalized_at: Option<Instant>,
}

struct StreamEntry {
    context: StreamContext,
    formatter: Arc<dyn ChunkFormatter>,
    /// Next admission sequence number; also the admitted-chunk count.
    admission: std::sync::Mutex<u64>,
    state: Mutex<StreamState>,
    created_at: Instant,
    finalized: AtomicBool,
    done: Notify,
}

struct Shared {
    streams: DashMap<StreamId, Arc<StreamEntry>>,
    active: AtomicUsize,
    backpressure_events: AtomicU64,
    settings: StreamingSettings,
}

impl Shared {
    async fn deliver(&self, task: Task) {
        let Some(entry) = self.streams.get(&task.stream_id).map(|e| e.clone()) else {
            return;
        };
        if entry.finalized.load(Ordering::Acquire) {
            return;
        }
        let mut state = entry.state.lock().await;
        if state.result.is_some() {
            return;
        }

        if task.enqueued_at.elapsed() > self.settings.chunk_wait_timeout {
            tracing::warn!(stream_id = %task.stream_id, "chunk exceeded wait timeout");
            self.finalize(&entry, &mut state, Some("chunk wait timeout".to_string()));
            return;
        }

        // Reorder buffer: only the contiguous prefix is delivered, so chunks
        // reach the formatter in admission order no matter which worker got
        // them off the queue first.
        state.pending.insert(task.seq, task);
        while let Some(ready) = {
            let next = state.next_seq;
            state.pending.remove(&next)
        } {
            state.next_seq += 1;
            let is_final = ready.is_final;
            // A null chunk is the pump's end-of-stream marker: nothing to
            // format or accumulate, only finalization.
            if ready.chunk.is_null() {
                self.finalize(&entry, &mut state, None);
                return;
            }
            match entry.formatter.format_chunk(&ready.chunk, &entry.context) {
                Ok(formatted) => {
                    state.stats.chunk_count += 1;
                    state.stats.byte_count += ready.chunk.to_string().len() as u64;
                    if let Some(text) = openai_delta_text(&ready.chunk)
                        .or_else(|| anthropic_delta_text(&ready.chunk))
                    {
                        state.stats.content.push_str(text);
                    }
                    if let Some(calls) = ready
                        .chunk
                        .pointer("/choices/0/delta/tool_calls")
                        .and_then(Value::as_array)
                    {
                        state.stats.tool_calls.extend(calls.iter().cloned());
                    }
                    if let (Some(event), Some(tx)) = (formatted, state.outputs_tx.as_ref()) {
                        let _ = tx.send(event);
                    }
                }
                Err(e) => {
                    tracing::warn!(stream_id = %entry.context.request_id, error = %e, "chunk formatting failed");
                    self.finalize(&entry, &mut state, Some(e.to_string()));
                    return;
                }
            }
            if is_final {
                self.finalize(&entry, &mut state, None);
                return;
            }
        }
    }

    fn finalize(&self, entry: &Arc<StreamEntry>, state: &mut StreamState, error: Option<String>) {
        if state.result.is_some() {
            return;
        }
        if error.is_none() {
            if let Some(event) = entry.formatter.end_of_stream(&entry.context, &state.stats) {
                if let Some(tx) = state.outputs_tx.as_ref() {
                    let _ = tx.send(event);
                }
            }
        }
        state.result = Some(FinalEnvelope {
            request_id: entry.context.request_id.clone(),
            provider: entry.context.provider.clone(),
            content: state.stats.content.clone(),
            tool_calls: state.stats.tool_calls.clone(),
            chunk_count: state.stats.chunk_count,
            byte_count: state.stats.byte_count,
            duration_ms: entry.created_at.elapsed().as_millis() as u64,
            error,
        });
        state.finalized_at = Some(Instant::now());
        // Dropping the sender closes the client-facing SSE stream.
        state.outputs_tx = None;
        entry.finalized.store(true, Ordering::Release);
        entry.done.notify_waiters();
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker-pool demultiplexer for streamed upstream chunks.
pub struct StreamingProcessor {
    shared: Arc<Shared>,
    queue_tx: mpsc::Sender<Task>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl StreamingProcessor {
    pub fn new(settings: StreamingSettings) -> Self {
        let workers = if settings.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            settings.workers
        }
        .clamp(2, 32);

        let queue_capacity = settings.max_active_streams.max(64);
        let (queue_tx, queue_rx) = mpsc::channel::<Task>(queue_capacity);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let shared = Arc::new(Shared {
            streams: DashMap::new(),
            active: AtomicUsize::new(0),
            backpressure_events: AtomicU64::new(0),
            settings,
        });

        let mut handles = Vec::with_capacity(workers + 1);
        for _ in 0..workers {
            let shared = shared.clone();
            let queue_rx = queue_rx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let task = { queue_rx.lock().await.recv().await };
                    match task {
                        Some(task) => shared.deliver(task).await,
                        None => break,
                    }
                }
            }));
        }
        handles.push(tokio::spawn(Self::janitor(shared.clone())));

        Self {
            shared,
            queue_tx,
            handles,
        }
    }

    /// Periodic sweep: expire overdue streams, evict finalized ones.
    async fn janitor(shared: Arc<Shared>) {
        let period = (shared.settings.stream_timeout / 4)
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let mut evict = Vec::new();
            for item in shared.streams.iter() {
                let entry = item.value().clone();
                let id = *item.key();
                if entry.finalized.load(Ordering::Acquire) {
                    let state = entry.state.lock().await;
                    if state
                        .finalized_at
                        .is_some_and(|at| at.elapsed() > shared.settings.stream_timeout)
                    {
                        evict.push(id);
                    }
                } else if entry.created_at.elapsed() > shared.settings.stream_timeout {
                    let mut state = entry.state.lock().await;
                    tracing::warn!(stream_id = %id, "stream exceeded wall-clock timeout");
                    shared.finalize(&entry, &mut state, Some("stream timed out".to_string()));
                }
            }
            for id in evict {
                shared.streams.remove(&id);
            }
        }
    }

    /// Open a stream. The returned receiver yields formatted client-facing
    /// events; it closes when the stream finalizes.
    pub fn create_stream(
        &self,
        context: StreamContext,
        formatter: Arc<dyn ChunkFormatter>,
    ) -> Result<(StreamId, mpsc::UnboundedReceiver<Value>), GatewayError> {
        let active = self.shared.active.load(Ordering::Acquire);
        if active >= self.shared.settings.max_active_streams {
            self.shared.backpressure_events.fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::Stream {
                message: "stream pool exhausted".to_string(),
            });
        }

        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let entry = Arc::new(StreamEntry {
            context,
            formatter,
            admission: std::sync::Mutex::new(0),
            state: Mutex::new(StreamState {
                next_seq: 0,
                pending: BTreeMap::new(),
                stats: StreamStats::default(),
                outputs_tx: Some(outputs_tx),
                result: None,
                finalized_at: None,
            }),
            created_at: Instant::now(),
            finalized: AtomicBool::new(false),
            done: Notify::new(),
        });
        self.shared.streams.insert(id, entry);
        self.shared.active.fetch_add(1, Ordering::AcqRel);
        Ok((id, outputs_rx))
    }

    /// Admit one chunk. Resolves to `false` (and counts a backpressure
    /// event) when a threshold is exceeded or the queue is full; the caller
    /// must slow down or drop.
    pub async fn process_chunk(&self, id: StreamId, chunk: Value, is_final: bool) -> bool {
        let Some(entry) = self.shared.streams.get(&id).map(|e| e.clone()) else {
            return false;
        };
        if entry.finalized.load(Ordering::Acquire) {
            return false;
        }
        if self.shared.active.load(Ordering::Acquire) > self.shared.settings.max_active_streams {
            self.shared.backpressure_events.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // Sequence allocation and enqueue are atomic together so the
        // per-stream sequence space has no holes for workers to wait on.
        let mut admission = entry.admission.lock().expect("admission lock poisoned");
        if *admission >= self.shared.settings.max_chunks_per_stream {
            self.shared.backpressure_events.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let task = Task {
            stream_id: id,
            seq: *admission,
            chunk,
            is_final,
            enqueued_at: Instant::now(),
        };
        match self.queue_tx.try_send(task) {
            Ok(()) => {
                *admission += 1;
                true
            }
            Err(_) => {
                self.shared.backpressure_events.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Await the terminal envelope. Stream errors (timeout, cancellation)
    /// arrive inside the envelope; this only fails when the wait itself
    /// times out or the stream id is unknown.
    pub async fn get_result(
        &self,
        id: StreamId,
        wait: Option<Duration>,
    ) -> Result<FinalEnvelope, GatewayError> {
        let Some(entry) = self.shared.streams.get(&id).map(|e| e.clone()) else {
            return Err(GatewayError::Stream {
                message: format!("unknown stream {id}"),
            });
        };
        let wait = wait.unwrap_or(self.shared.settings.stream_timeout);
        let awaited = tokio::time::timeout(wait, async {
            loop {
                // Register interest before the flag check so a finalize
                // landing in between is not missed.
                let mut notified = std::pin::pin!(entry.done.notified());
                notified.as_mut().enable();
                if entry.finalized.load(Ordering::Acquire) {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if awaited.is_err() {
            return Err(GatewayError::Stream {
                message: "timed out waiting for stream result".to_string(),
            });
        }
        let state = entry.state.lock().await;
        state.result.clone().ok_or_else(|| GatewayError::Stream {
            message: "stream finalized without result".to_string(),
        })
    }

    /// Cancel a live stream. Returns `false` for unknown or already
    /// finalized streams.
    pub async fn cancel(&self, id: StreamId) -> bool {
        let Some(entry) = self.shared.streams.get(&id).map(|e| e.clone()) else {
            return false;
        };
        let mut state = entry.state.lock().await;
        if state.result.is_some() {
            return false;
        }
        self.shared
            .finalize(&entry, &mut state, Some("cancelled".to_string()));
        true
    }

    pub fn active_streams(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    pub fn backpressure_events(&self) -> u64 {
        self.shared.backpressure_events.load(Ordering::Relaxed)
    }
}

impl Drop for StreamingProcessor {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn context(client: ApiFormat, provider: ApiFormat) -> StreamContext {
        StreamContext {
            request_id: "req-1".to_string(),
            provider: "prov".to_string(),
            model: "model-x".to_string(),
            client_format: client,
            provider_format: provider,
        }
    }

    fn settings() -> StreamingSettings {
        StreamingSettings {
            workers: 4,
            ..Default::default()
        }
    }

    fn text_chunk(text: &str) -> Value {
        json!({"choices": [{"delta": {"content": text}}]})
    }

    /// Formatter that records the order chunks were delivered in.
    struct RecordingFormatter {
        seen: Arc<StdMutex<Vec<String>>>,
    }

    impl ChunkFormatter for RecordingFormatter {
        fn format_chunk(
            &self,
            chunk: &Value,
            _context: &StreamContext,
        ) -> Result<Option<Value>, GatewayError> {
            if let Some(text) = openai_delta_text(chunk) {
                self.seen.lock().unwrap().push(text.to_string());
            }
            Ok(Some(chunk.clone()))
        }

        fn end_of_stream(&self, _context: &StreamContext, _stats: &StreamStats) -> Option<Value> {
            None
        }
    }

    #[tokio::test]
    async fn chunks_reach_formatter_in_enqueue_order() {
        let processor = StreamingProcessor::new(settings());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let (id, _rx) = processor
            .create_stream(
                context(ApiFormat::OpenAi, ApiFormat::OpenAi),
                Arc::new(RecordingFormatter { seen: seen.clone() }),
            )
            .unwrap();

        let total = 200;
        for i in 0..total {
            assert!(processor.process_chunk(id, text_chunk(&format!("{i};")), false).await);
        }
        assert!(processor.process_chunk(id, json!({"done": true}), true).await);

        let envelope = processor.get_result(id, Some(Duration::from_secs(5))).await.unwrap();
        assert!(envelope.error.is_none());
        assert_eq!(envelope.chunk_count, (total + 1) as u64);

        let expected: Vec<String> = (0..total).map(|i| format!("{i};")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        // Accumulated content matches ordered concatenation.
        assert_eq!(envelope.content, expected.concat());
    }

    #[tokio::test]
    async fn per_stream_chunk_cap_triggers_backpressure() {
        let mut s = settings();
        s.max_chunks_per_stream = 2;
        let processor = StreamingProcessor::new(s);
        let (id, _rx) = processor
            .create_stream(
                context(ApiFormat::OpenAi, ApiFormat::OpenAi),
                Arc::new(PassthroughFormatter),
            )
            .unwrap();

        assert!(processor.process_chunk(id, text_chunk("a"), false).await);
        assert!(processor.process_chunk(id, text_chunk("b"), false).await);
        assert!(!processor.process_chunk(id, text_chunk("c"), false).await);
        assert_eq!(processor.backpressure_events(), 1);
    }

    #[tokio::test]
    async fn global_stream_cap_rejects_new_streams() {
        let mut s = settings();
        s.max_active_streams = 1;
        let processor = StreamingProcessor::new(s);
        let ctx = context(ApiFormat::OpenAi, ApiFormat::OpenAi);
        let _first = processor
            .create_stream(ctx.clone(), Arc::new(PassthroughFormatter))
            .unwrap();
        let second = processor.create_stream(ctx, Arc::new(PassthroughFormatter));
        assert!(second.is_err());
        assert_eq!(processor.backpressure_events(), 1);
    }

    #[tokio::test]
    async fn idle_stream_times_out_with_error_envelope() {
        let mut s = settings();
        s.stream_timeout = Duration::from_millis(40);
        let processor = StreamingProcessor::new(s);
        let (id, _rx) = processor
            .create_stream(
                context(ApiFormat::OpenAi, ApiFormat::OpenAi),
                Arc::new(PassthroughFormatter),
            )
            .unwrap();

        let envelope = processor
            .get_result(id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(envelope.error.as_deref(), Some("stream timed out"));
        assert_eq!(processor.active_streams(), 0);
    }

    #[tokio::test]
    async fn cancel_finalizes_once() {
        let processor = StreamingProcessor::new(settings());
        let (id, _rx) = processor
            .create_stream(
                context(ApiFormat::OpenAi, ApiFormat::OpenAi),
                Arc::new(PassthroughFormatter),
            )
            .unwrap();
        assert!(processor.cancel(id).await);
        assert!(!processor.cancel(id).await);
        let envelope = processor.get_result(id, Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(envelope.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn openai_chunks_translate_to_anthropic_deltas() {
        let processor = StreamingProcessor::new(settings());
        let (id, mut rx) = processor
            .create_stream(
                context(ApiFormat::Anthropic, ApiFormat::OpenAi),
                Arc::new(CrossFormatChunkFormatter),
            )
            .unwrap();

        processor.process_chunk(id, text_chunk("hel"), false).await;
        processor.process_chunk(id, text_chunk("lo"), false).await;
        processor
            .process_chunk(
                id,
                json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
                true,
            )
            .await;

        processor.get_result(id, Some(Duration::from_secs(5))).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events[0]["type"], "content_block_delta");
        assert_eq!(events[0]["delta"]["text"], "hel");
        assert_eq!(events[1]["delta"]["text"], "lo");
        assert_eq!(events[2]["type"], "message_delta");
        assert_eq!(events[2]["delta"]["stop_reason"], "end_turn");
        // End-of-stream hook appends message_stop for Anthropic clients.
        assert_eq!(events.last().unwrap()["type"], "message_stop");
    }

    #[tokio::test]
    async fn anthropic_chunks_translate_to_openai_chunks() {
        let formatter = CrossFormatChunkFormatter;
        let ctx = context(ApiFormat::OpenAi, ApiFormat::Anthropic);
        let delta = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "hi"}});
        let out = formatter.format_chunk(&delta, &ctx).unwrap().unwrap();
        assert_eq!(out["object"], "chat.completion.chunk");
        assert_eq!(out["choices"][0]["delta"]["content"], "hi");

        let stop = json!({"type": "message_stop"});
        let out = formatter.format_chunk(&stop, &ctx).unwrap().unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "stop");

        // Ping events are swallowed.
        let ping = json!({"type": "ping"});
        assert!(formatter.format_chunk(&ping, &ctx).unwrap().is_none());
    }
}
