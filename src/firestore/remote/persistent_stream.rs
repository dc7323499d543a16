//! Long-lived listen and write streams.
//!
//! A stream moves through `Initial -> Starting -> Open`, and on failure into
//! `Error`, from where the next [`PersistentStream::start`] waits out the
//! backoff delay before reconnecting. Every state transition and every
//! listener callback runs on the [`AsyncQueue`]. Messages from a previous
//! connection are dropped by comparing the connection generation.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};

use crate::firestore::core::types::TargetId;
use crate::firestore::error::{
    failed_precondition, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::Mutation;
use crate::firestore::remote::connection::{
    ListenRequest, StreamChannel, WriteRequest, WriteResponse,
};
use crate::firestore::remote::datastore::RemoteDatastore;
use crate::firestore::remote::watch_change::WatchChange;
use crate::firestore::util::assert::hard_assert;
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::util::backoff::{BackoffSettings, ExponentialBackoff};
use crate::platform::runtime;

/// How long an open stream may sit without requests before it is closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives the events of one stream.
#[async_trait]
pub trait StreamListener<Resp>: Send + Sync
where
    Resp: Send + 'static,
{
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_message(&self, message: Resp) -> FirestoreResult<()>;

    /// `error` is `None` when the stream went idle.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

type StreamOpener<Req, Resp> =
    Arc<dyn Fn() -> BoxFuture<'static, FirestoreResult<StreamChannel<Req, Resp>>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Initial,
    Starting,
    Open,
    Error,
    Backoff,
}

struct StreamState<Req, Resp> {
    phase: StreamPhase,
    generation: u64,
    channel: Option<Arc<StreamChannel<Req, Resp>>>,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
    backoff: ExponentialBackoff,
}

pub struct PersistentStream<Req, Resp> {
    label: &'static str,
    idle_timer_id: TimerId,
    backoff_timer_id: TimerId,
    queue: AsyncQueue,
    opener: StreamOpener<Req, Resp>,
    listener: Weak<dyn StreamListener<Resp>>,
    me: Weak<Self>,
    state: StdMutex<StreamState<Req, Resp>>,
}

impl<Req, Resp> PersistentStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn new(
        label: &'static str,
        timers: (TimerId, TimerId),
        queue: AsyncQueue,
        backoff: BackoffSettings,
        opener: StreamOpener<Req, Resp>,
        listener: Weak<dyn StreamListener<Resp>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            label,
            idle_timer_id: timers.0,
            backoff_timer_id: timers.1,
            queue,
            opener,
            listener,
            me: me.clone(),
            state: StdMutex::new(StreamState {
                phase: StreamPhase::Initial,
                generation: 0,
                channel: None,
                idle_timer: None,
                backoff_timer: None,
                backoff: ExponentialBackoff::new(backoff),
            }),
        })
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.lock().unwrap().phase
    }

    /// True from `start` until the stream is stopped or fails, including
    /// while it waits for the backoff delay.
    pub fn is_started(&self) -> bool {
        matches!(
            self.phase(),
            StreamPhase::Starting | StreamPhase::Open | StreamPhase::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.phase() == StreamPhase::Open
    }

    /// Opens the stream, after the backoff delay if the last attempt failed.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            StreamPhase::Error => {
                self.perform_backoff(&mut state);
            }
            StreamPhase::Initial => {
                state.phase = StreamPhase::Starting;
                let generation = state.generation;
                drop(state);
                self.spawn_open(generation);
            }
            _ => {}
        }
    }

    /// Closes the stream without notifying the listener.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(
            state.phase,
            StreamPhase::Starting | StreamPhase::Open | StreamPhase::Backoff
        ) {
            self.close_locked(&mut state, None);
        }
    }

    /// After a permanent error the next start should not wait, since the
    /// failure was not caused by the connection.
    pub fn inhibit_backoff(&self) {
        let mut state = self.state.lock().unwrap();
        hard_assert(
            !matches!(
                state.phase,
                StreamPhase::Starting | StreamPhase::Open | StreamPhase::Backoff
            ),
            "Only an inactive stream can inhibit backoff",
        );
        state.phase = StreamPhase::Initial;
        state.backoff.reset();
    }

    /// Schedules an idle close unless a request arrives first.
    pub fn mark_idle(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase != StreamPhase::Open || state.idle_timer.is_some() {
            return;
        }
        let generation = state.generation;
        let me = self.me.clone();
        state.idle_timer = Some(self.queue.enqueue_after_delay(
            self.idle_timer_id,
            IDLE_TIMEOUT,
            move || async move {
                match me.upgrade() {
                    Some(stream) => stream.handle_idle_close(generation).await,
                    None => Ok(()),
                }
            },
        ));
    }

    pub fn send(&self, request: Req) -> FirestoreResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
        match &state.channel {
            Some(channel) if state.phase == StreamPhase::Open => channel.send(request),
            _ => Err(failed_precondition(format!(
                "{} stream is not open",
                self.label
            ))),
        }
    }

    fn perform_backoff(&self, state: &mut StreamState<Req, Resp>) {
        state.phase = StreamPhase::Backoff;
        let delay = state.backoff.next_delay();
        log::debug!("{} stream reconnecting in {delay:?}", self.label);
        let me = self.me.clone();
        state.backoff_timer = Some(self.queue.enqueue_after_delay(
            self.backoff_timer_id,
            delay,
            move || async move {
                if let Some(stream) = me.upgrade() {
                    stream.finish_backoff();
                }
                Ok(())
            },
        ));
    }

    fn finish_backoff(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase != StreamPhase::Backoff {
            return;
        }
        state.backoff_timer = None;
        state.phase = StreamPhase::Starting;
        let generation = state.generation;
        drop(state);
        self.spawn_open(generation);
    }

    fn spawn_open(&self, generation: u64) {
        let me = self.me.clone();
        self.queue.enqueue_and_forget(move || async move {
            match me.upgrade() {
                Some(stream) => stream.open(generation).await,
                None => Ok(()),
            }
        });
    }

    async fn open(&self, generation: u64) -> FirestoreResult<()> {
        if !self.is_current(generation, StreamPhase::Starting) {
            return Ok(());
        }
        let channel = match (self.opener)().await {
            Ok(channel) => Arc::new(channel),
            Err(err) => return self.handle_stream_close(generation, Some(err)).await,
        };
        {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation || state.phase != StreamPhase::Starting {
                channel.close();
                return Ok(());
            }
            state.phase = StreamPhase::Open;
            state.channel = Some(Arc::clone(&channel));
        }
        log::debug!("{} stream opened", self.label);
        self.spawn_reader(generation, channel);
        match self.listener.upgrade() {
            Some(listener) => listener.on_open().await,
            None => Ok(()),
        }
    }

    fn spawn_reader(&self, generation: u64, channel: Arc<StreamChannel<Req, Resp>>) {
        let me = self.me.clone();
        let queue = self.queue.clone();
        runtime::spawn_detached(async move {
            while let Some(message) = channel.next().await {
                let me = me.clone();
                queue.enqueue_and_forget(move || async move {
                    match me.upgrade() {
                        Some(stream) => stream.handle_message(generation, message).await,
                        None => Ok(()),
                    }
                });
            }
            queue.enqueue_and_forget(move || async move {
                match me.upgrade() {
                    Some(stream) => {
                        stream
                            .handle_stream_close(
                                generation,
                                Some(unavailable("Stream closed by the backend")),
                            )
                            .await
                    }
                    None => Ok(()),
                }
            });
        });
    }

    async fn handle_message(
        &self,
        generation: u64,
        message: FirestoreResult<Resp>,
    ) -> FirestoreResult<()> {
        if !self.is_current(generation, StreamPhase::Open) {
            return Ok(());
        }
        match message {
            Err(err) => self.handle_stream_close(generation, Some(err)).await,
            Ok(message) => {
                self.state.lock().unwrap().backoff.reset();
                match self.listener.upgrade() {
                    Some(listener) => listener.on_message(message).await,
                    None => Ok(()),
                }
            }
        }
    }

    async fn handle_idle_close(&self, generation: u64) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.idle_timer = None;
            if state.generation != generation || state.phase != StreamPhase::Open {
                return Ok(());
            }
            log::debug!("{} stream closed after being idle", self.label);
            self.close_locked(&mut state, None);
        }
        match self.listener.upgrade() {
            Some(listener) => listener.on_close(None).await,
            None => Ok(()),
        }
    }

    async fn handle_stream_close(
        &self,
        generation: u64,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                return Ok(());
            }
            self.close_locked(&mut state, error.as_ref());
        }
        match self.listener.upgrade() {
            Some(listener) => listener.on_close(error).await,
            None => Ok(()),
        }
    }

    fn close_locked(&self, state: &mut StreamState<Req, Resp>, error: Option<&FirestoreError>) {
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = state.backoff_timer.take() {
            timer.cancel();
        }
        state.generation += 1;
        if let Some(channel) = state.channel.take() {
            channel.close();
        }
        match error {
            Some(err) => {
                log::debug!("{} stream failed: {err}", self.label);
                if err.code == FirestoreErrorCode::ResourceExhausted {
                    log::debug!("Using maximum backoff delay to avoid overloading the backend");
                    state.backoff.reset_to_max();
                }
                state.phase = StreamPhase::Error;
            }
            None => {
                state.backoff.reset();
                state.phase = StreamPhase::Initial;
            }
        }
    }

    fn is_current(&self, generation: u64, phase: StreamPhase) -> bool {
        let state = self.state.lock().unwrap();
        state.generation == generation && state.phase == phase
    }
}

fn opener<Req, Resp, F>(open: F) -> StreamOpener<Req, Resp>
where
    F: Fn() -> BoxFuture<'static, FirestoreResult<StreamChannel<Req, Resp>>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(open)
}

/// The listen stream: adds and removes watch targets.
pub struct WatchStream {
    stream: Arc<PersistentStream<ListenRequest, WatchChange>>,
}

impl WatchStream {
    pub fn new(
        datastore: Arc<RemoteDatastore>,
        queue: AsyncQueue,
        backoff: BackoffSettings,
        listener: Weak<dyn StreamListener<WatchChange>>,
    ) -> Self {
        let open = opener(move || {
            let datastore = Arc::clone(&datastore);
            async move { datastore.open_listen_stream().await }.boxed()
        });
        Self {
            stream: PersistentStream::new(
                "Watch",
                (
                    TimerId::ListenStreamIdle,
                    TimerId::ListenStreamConnectionBackoff,
                ),
                queue,
                backoff,
                open,
                listener,
            ),
        }
    }

    pub fn watch(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.stream.send(ListenRequest::AddTarget(target_data))
    }

    pub fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.stream.send(ListenRequest::RemoveTarget(target_id))
    }
}

impl Deref for WatchStream {
    type Target = PersistentStream<ListenRequest, WatchChange>;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}

/// The write stream.
///
/// After opening, the client sends a handshake and the first response
/// carries the stream token. Later responses acknowledge the oldest
/// outstanding batch in order.
pub struct WriteStream {
    stream: Arc<PersistentStream<WriteRequest, WriteResponse>>,
    handshake_complete: AtomicBool,
    last_stream_token: StdMutex<Vec<u8>>,
}

impl WriteStream {
    pub fn new(
        datastore: Arc<RemoteDatastore>,
        queue: AsyncQueue,
        backoff: BackoffSettings,
        listener: Weak<dyn StreamListener<WriteResponse>>,
    ) -> Self {
        let open = opener(move || {
            let datastore = Arc::clone(&datastore);
            async move { datastore.open_write_stream().await }.boxed()
        });
        Self {
            stream: PersistentStream::new(
                "Write",
                (
                    TimerId::WriteStreamIdle,
                    TimerId::WriteStreamConnectionBackoff,
                ),
                queue,
                backoff,
                open,
                listener,
            ),
            handshake_complete: AtomicBool::new(false),
            last_stream_token: StdMutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        self.handshake_complete.store(false, Ordering::SeqCst);
        self.stream.start();
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::SeqCst)
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.last_stream_token.lock().unwrap().clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        *self.last_stream_token.lock().unwrap() = token;
    }

    pub(crate) fn complete_handshake(&self, token: Vec<u8>) {
        self.set_last_stream_token(token);
        self.handshake_complete.store(true, Ordering::SeqCst);
    }

    pub fn write_handshake(&self) -> FirestoreResult<()> {
        hard_assert(self.stream.is_open(), "Writing handshake requires an opened stream");
        hard_assert(!self.handshake_complete(), "Handshake already completed");
        self.stream.send(WriteRequest {
            stream_token: self.last_stream_token(),
            mutations: Vec::new(),
        })
    }

    pub fn write_mutations(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        hard_assert(self.stream.is_open(), "Writing mutations requires an opened stream");
        hard_assert(
            self.handshake_complete(),
            "Handshake must be complete before writing mutations",
        );
        self.stream.send(WriteRequest {
            stream_token: self.last_stream_token(),
            mutations,
        })
    }
}

impl Deref for WriteStream {
    type Target = PersistentStream<WriteRequest, WriteResponse>;

    fn deref(&self) -> &Self::Target {
        &self.stream
    }
}
