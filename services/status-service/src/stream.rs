//! Per-connection status stream for one optimization request.
//!
//! A [`StatusSession`] is an explicit state machine advanced one tick at a
//! time. [`event_stream`] drives it from a `tokio` interval inside the
//! returned stream, so the timer lives exactly as long as the connection:
//! when the transport drops the stream, ticking stops.

use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;

use crate::models::{JobStatus, StatusRecord, StatusUpdate, StatusView, StreamEvent};
use crate::optimizer::{PollOutcome, ResultSource, SourceError};
use crate::store::{StatusStore, UpsertOutcome};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamSettings {
    pub tick: Duration,
    /// Ticks before the stream gives up and closes.
    pub max_ticks: u32,
    /// Fallback poll cadence, in ticks.
    pub fallback_every: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            max_ticks: 600,
            fallback_every: 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Streaming,
    ClosedComplete,
    ClosedFailed,
    ClosedTimeout,
    ClosedClientAbort,
}

impl StreamState {
    pub fn is_closed(self) -> bool {
        !matches!(self, StreamState::Connecting | StreamState::Streaming)
    }

    fn closed_for(status: JobStatus) -> Self {
        match status {
            JobStatus::Failed => StreamState::ClosedFailed,
            _ => StreamState::ClosedComplete,
        }
    }
}

pub struct StatusSession {
    request_id: String,
    region: Option<String>,
    store: Arc<dyn StatusStore>,
    source: Arc<dyn ResultSource>,
    settings: StreamSettings,
    state: StreamState,
    last_status: Option<JobStatus>,
    last_updated_at: Option<DateTime<Utc>>,
    tick_count: u32,
}

impl StatusSession {
    pub fn new(
        request_id: String,
        region: Option<String>,
        store: Arc<dyn StatusStore>,
        source: Arc<dyn ResultSource>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            request_id,
            region,
            store,
            source,
            settings,
            state: StreamState::Connecting,
            last_status: None,
            last_updated_at: None,
            tick_count: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn tick_count(&self) -> u32 {
        self.tick_count
    }

    pub fn open(&mut self) -> StreamEvent {
        self.state = StreamState::Streaming;
        tracing::info!(request_id = self.request_id.as_str(), "status stream opened");
        StreamEvent::Connected {
            request_id: self.request_id.clone(),
        }
    }

    /// Advances the session by one tick and returns the events to emit, in order.
    pub async fn tick(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.state != StreamState::Streaming {
            return events;
        }
        self.tick_count += 1;

        match self.store.get(&self.request_id).await {
            Ok(record) => self.reconcile(record, &mut events).await,
            Err(err) => {
                // Transient store failures must not end the stream.
                tracing::warn!(
                    request_id = self.request_id.as_str(),
                    tick = self.tick_count,
                    error = %err,
                    "status store read failed"
                );
                events.push(StreamEvent::Error {
                    request_id: self.request_id.clone(),
                    message: err.to_string(),
                });
            }
        }

        if self.state == StreamState::Streaming && self.tick_count >= self.settings.max_ticks {
            self.state = StreamState::ClosedTimeout;
            tracing::info!(
                request_id = self.request_id.as_str(),
                ticks = self.tick_count,
                "status stream timed out"
            );
        }
        events
    }

    async fn reconcile(&mut self, record: Option<StatusRecord>, events: &mut Vec<StreamEvent>) {
        if let Some(record) = &record {
            if self.has_changed(record) {
                self.emit_record(record, events);
                if self.state.is_closed() {
                    return;
                }
            }
        }

        let awaiting = record
            .as_ref()
            .map_or(true, |record| !record.status.is_terminal());
        if awaiting && self.tick_count % self.settings.fallback_every == 0 {
            self.poll_fallback(events).await;
            if self.state.is_closed() {
                return;
            }
        }

        if record.is_none() && self.last_status != Some(JobStatus::Pending) {
            self.last_status = Some(JobStatus::Pending);
            events.push(StreamEvent::Status(StatusView::pending(&self.request_id)));
        }
    }

    fn has_changed(&self, record: &StatusRecord) -> bool {
        self.last_status != Some(record.status) || self.last_updated_at != Some(record.updated_at)
    }

    fn emit_record(&mut self, record: &StatusRecord, events: &mut Vec<StreamEvent>) {
        self.last_status = Some(record.status);
        self.last_updated_at = Some(record.updated_at);
        events.push(StreamEvent::Status(record.to_view()));

        if record.status.is_terminal() {
            self.state = StreamState::closed_for(record.status);
            tracing::info!(
                request_id = self.request_id.as_str(),
                status = record.status.as_str(),
                tick = self.tick_count,
                "status stream reached terminal status"
            );
        }
    }

    async fn poll_fallback(&mut self, events: &mut Vec<StreamEvent>) {
        let outcome = self
            .source
            .fetch_result(&self.request_id, self.region.as_deref())
            .await;

        let body = match outcome {
            Ok(PollOutcome::Completed(body)) => body,
            Ok(PollOutcome::Processing { message }) => {
                tracing::debug!(
                    request_id = self.request_id.as_str(),
                    tick = self.tick_count,
                    message = message.as_str(),
                    "optimization still processing"
                );
                return;
            }
            Err(SourceError::NotConfigured) => {
                tracing::debug!(
                    request_id = self.request_id.as_str(),
                    "fallback poll skipped, no api key"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    request_id = self.request_id.as_str(),
                    tick = self.tick_count,
                    error = %err,
                    "fallback poll failed"
                );
                return;
            }
        };

        tracing::info!(
            request_id = self.request_id.as_str(),
            tick = self.tick_count,
            "fallback poll detected completion"
        );
        match self
            .store
            .upsert(&self.request_id, StatusUpdate::completed(&body))
            .await
        {
            Ok(outcome) => {
                if let UpsertOutcome::KeptTerminal(_) = outcome {
                    tracing::info!(
                        request_id = self.request_id.as_str(),
                        "terminal status already stored, emitting stored record"
                    );
                }
                self.emit_record(&outcome.into_record(), events);
            }
            Err(err) => {
                // The result is in hand, so deliver it even if it could not be persisted.
                tracing::warn!(
                    request_id = self.request_id.as_str(),
                    error = %err,
                    "failed to persist fallback result"
                );
                self.last_status = Some(JobStatus::Completed);
                self.state = StreamState::ClosedComplete;
                events.push(StreamEvent::Status(StatusView {
                    request_id: self.request_id.clone(),
                    status: JobStatus::Completed,
                    result_data: Some(body),
                    error_message: None,
                    updated_at: Some(Utc::now()),
                }));
            }
        }
    }
}

impl Drop for StatusSession {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            self.state = StreamState::ClosedClientAbort;
            tracing::info!(
                request_id = self.request_id.as_str(),
                ticks = self.tick_count(),
                "status stream closed by client"
            );
        }
    }
}

/// Runs `session` on its own interval until it reaches a closed state.
pub fn event_stream(mut session: StatusSession) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        yield session.open();

        let mut ticker = tokio::time::interval(session.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        while !session.state().is_closed() {
            ticker.tick().await;
            for event in session.tick().await {
                yield event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatusRecord;
    use crate::store::{MemoryStatusStore, StoreError};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_stream::StreamExt;

    /// Replays scripted outcomes, then reports processing; counts calls.
    struct ScriptedSource {
        outcomes: Mutex<VecDeque<Result<PollOutcome, SourceError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(outcomes: Vec<Result<PollOutcome, SourceError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn always_processing() -> Arc<Self> {
            Self::new(Vec::new())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn processing() -> Result<PollOutcome, SourceError> {
        Ok(PollOutcome::Processing {
            message: "Job is still processing".to_string(),
        })
    }

    #[async_trait]
    impl ResultSource for ScriptedSource {
        async fn fetch_result(
            &self,
            _request_id: &str,
            _region: Option<&str>,
        ) -> Result<PollOutcome, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.outcomes.lock().expect("outcomes lock").pop_front();
            next.unwrap_or_else(processing)
        }
    }

    /// Memory store that counts reads and can be switched into failure.
    #[derive(Default)]
    struct ObservedStore {
        inner: MemoryStatusStore,
        reads: AtomicUsize,
        failing_reads: AtomicUsize,
    }

    impl ObservedStore {
        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusStore for ObservedStore {
        async fn upsert(
            &self,
            request_id: &str,
            update: StatusUpdate,
        ) -> Result<UpsertOutcome, StoreError> {
            self.inner.upsert(request_id, update).await
        }

        async fn get(&self, request_id: &str) -> Result<Option<StatusRecord>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.failing_reads.load(Ordering::SeqCst) > 0 {
                self.failing_reads.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("connection reset".to_string()));
            }
            self.inner.get(request_id).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn session(
        request_id: &str,
        store: Arc<dyn StatusStore>,
        source: Arc<dyn ResultSource>,
        max_ticks: u32,
    ) -> StatusSession {
        let mut session = StatusSession::new(
            request_id.to_string(),
            None,
            store,
            source,
            StreamSettings {
                tick: Duration::from_secs(1),
                max_ticks,
                fallback_every: 3,
            },
        );
        session.open();
        session
    }

    fn status_of(event: &StreamEvent) -> Option<(JobStatus, Option<Value>)> {
        match event {
            StreamEvent::Status(view) => Some((view.status, view.result_data.clone())),
            _ => None,
        }
    }

    #[tokio::test]
    async fn webhook_completion_is_emitted_within_one_tick() {
        let store = Arc::new(MemoryStatusStore::new());
        let mut session = session("r1", store.clone(), ScriptedSource::always_processing(), 600);

        let first = session.tick().await;
        assert_eq!(first, vec![StreamEvent::Status(StatusView::pending("r1"))]);

        let routes = json!({ "routes": [{ "vehicle": "v1", "steps": [] }] });
        store
            .upsert("r1", StatusUpdate::completed(&routes))
            .await
            .expect("webhook upsert");

        let second = session.tick().await;
        assert_eq!(second.len(), 1);
        assert_eq!(
            status_of(&second[0]),
            Some((JobStatus::Completed, Some(routes)))
        );
        assert_eq!(session.state(), StreamState::ClosedComplete);
        assert!(session.tick().await.is_empty());
    }

    #[tokio::test]
    async fn failed_record_closes_as_failed() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .upsert("r3", StatusUpdate::failed("infeasible"))
            .await
            .expect("upsert");
        let mut session = session("r3", store, ScriptedSource::always_processing(), 600);

        let events = session.tick().await;
        match events.as_slice() {
            [StreamEvent::Status(view)] => {
                assert_eq!(view.status, JobStatus::Failed);
                assert_eq!(view.error_message.as_deref(), Some("infeasible"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(session.state(), StreamState::ClosedFailed);
    }

    #[tokio::test]
    async fn fallback_poll_detects_completion_on_schedule() {
        let store = Arc::new(MemoryStatusStore::new());
        let result = json!({ "message": "", "result": { "routes": [{ "vehicle": "v2" }] } });
        let source = ScriptedSource::new(vec![
            processing(),
            processing(),
            processing(),
            Ok(PollOutcome::Completed(result.clone())),
        ]);
        let mut session = session("r2", store.clone(), source.clone(), 600);

        let mut emitted = Vec::new();
        for tick in 1..=12u32 {
            let events = session.tick().await;
            if tick == 1 {
                assert_eq!(events, vec![StreamEvent::Status(StatusView::pending("r2"))]);
            } else if tick < 12 {
                assert!(events.is_empty(), "tick {tick} emitted {events:?}");
            }
            emitted.extend(events);
        }

        assert_eq!(source.calls(), 4);
        assert_eq!(emitted.len(), 2);
        assert_eq!(
            status_of(&emitted[1]),
            Some((JobStatus::Completed, Some(result.clone())))
        );
        assert_eq!(session.state(), StreamState::ClosedComplete);

        let stored = store.get("r2").await.expect("get").expect("record");
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.to_view().result_data, Some(result));
    }

    #[tokio::test]
    async fn fallback_is_skipped_once_terminal_is_seen() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .upsert("r1", StatusUpdate::completed(&json!({ "routes": [] })))
            .await
            .expect("upsert");
        let source = ScriptedSource::always_processing();
        let mut session = StatusSession::new(
            "r1".to_string(),
            None,
            store,
            source.clone(),
            StreamSettings {
                tick: Duration::from_secs(1),
                max_ticks: 600,
                fallback_every: 1,
            },
        );
        session.open();

        session.tick().await;
        assert_eq!(session.state(), StreamState::ClosedComplete);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn fallback_errors_do_not_end_the_stream() {
        let store = Arc::new(MemoryStatusStore::new());
        let source = ScriptedSource::new(vec![
            Err(SourceError::Status(502)),
            Err(SourceError::Status(503)),
        ]);
        let mut session = session("r4", store, source.clone(), 600);

        for _ in 0..9 {
            session.tick().await;
        }
        assert_eq!(session.state(), StreamState::Streaming);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn times_out_without_spurious_terminal_status() {
        let store = Arc::new(MemoryStatusStore::new());
        let source = ScriptedSource::always_processing();
        let mut session = session("r5", store, source.clone(), 30);

        let mut emitted = Vec::new();
        while !session.state().is_closed() {
            emitted.extend(session.tick().await);
        }

        assert_eq!(session.state(), StreamState::ClosedTimeout);
        assert_eq!(session.tick_count(), 30);
        assert_eq!(source.calls(), 10);
        assert_eq!(emitted, vec![StreamEvent::Status(StatusView::pending("r5"))]);
    }

    #[tokio::test]
    async fn updated_at_change_without_status_change_emits_once() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .upsert(
                "r6",
                StatusUpdate {
                    status: JobStatus::Pending,
                    result_data: Some(r#"{"progress":10}"#.to_string()),
                    error_message: None,
                },
            )
            .await
            .expect("first write");
        let mut session = session("r6", store.clone(), ScriptedSource::always_processing(), 600);

        assert_eq!(session.tick().await.len(), 1);
        assert!(session.tick().await.is_empty());

        store
            .upsert(
                "r6",
                StatusUpdate {
                    status: JobStatus::Pending,
                    result_data: Some(r#"{"progress":60}"#.to_string()),
                    error_message: None,
                },
            )
            .await
            .expect("refined write");

        let events = session.tick().await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            status_of(&events[0]),
            Some((JobStatus::Pending, Some(json!({ "progress": 60 }))))
        );
        assert!(session.tick().await.is_empty());
        assert_eq!(session.state(), StreamState::Streaming);
    }

    #[tokio::test]
    async fn store_read_failure_is_reported_and_retried() {
        let store = Arc::new(ObservedStore::default());
        store.failing_reads.store(1, Ordering::SeqCst);
        let mut session = session("r7", store.clone(), ScriptedSource::always_processing(), 600);

        let first = session.tick().await;
        assert!(matches!(first.as_slice(), [StreamEvent::Error { .. }]));
        assert_eq!(session.state(), StreamState::Streaming);

        let second = session.tick().await;
        assert_eq!(second, vec![StreamEvent::Status(StatusView::pending("r7"))]);
    }

    #[tokio::test]
    async fn late_pending_poll_cannot_reopen_terminal_record() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .upsert("r8", StatusUpdate::failed("no feasible routes"))
            .await
            .expect("webhook");
        let outcome = store
            .upsert("r8", StatusUpdate::pending())
            .await
            .expect("late write");
        assert_eq!(outcome.record().status, JobStatus::Failed);

        let mut session = session("r8", store, ScriptedSource::always_processing(), 600);
        let events = session.tick().await;
        assert_eq!(events.len(), 1);
        assert_eq!(session.state(), StreamState::ClosedFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn event_stream_closes_after_terminal_emission() {
        let store = Arc::new(MemoryStatusStore::new());
        store
            .upsert("r1", StatusUpdate::completed(&json!({ "routes": [] })))
            .await
            .expect("upsert");
        let session = StatusSession::new(
            "r1".to_string(),
            None,
            store,
            ScriptedSource::always_processing(),
            StreamSettings::default(),
        );

        let events: Vec<StreamEvent> = event_stream(session).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Connected { .. }));
        assert_eq!(status_of(&events[1]).map(|(status, _)| status), Some(JobStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_stops_store_reads() {
        let store = Arc::new(ObservedStore::default());
        let session = StatusSession::new(
            "r9".to_string(),
            None,
            store.clone(),
            ScriptedSource::always_processing(),
            StreamSettings::default(),
        );

        let mut stream = Box::pin(event_stream(session));
        assert!(matches!(stream.next().await, Some(StreamEvent::Connected { .. })));
        assert!(matches!(stream.next().await, Some(StreamEvent::Status(_))));
        let reads_at_abort = store.reads();
        assert_eq!(reads_at_abort, 1);

        drop(stream);
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.reads(), reads_at_abort);
    }
}
