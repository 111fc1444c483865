use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    AudioHandle, ChatId, ChatNotifier, FetchFailure, FetchRequest, FetchedMedia, ManualClock,
    MediaFetcher, MediaKind, PlayableSource, Provider, ResolutionError, SinkEvent,
    SinkEventSender, SnapshotStore, SourceResolver, StreamOptions, StreamSession, StreamingSink,
    TranscodeProfile, Transcoder, UserId,
};
use core_queue::{QueueLimits, SessionQueue, SessionSnapshot};
use core_runtime::config::EngineConfigBuilder;
use core_runtime::EngineConfig;
use core_service::{Command, CommandKind, CoreDependencies, CoreService, Reply};
use mockall::{mock, Sequence};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const CHAT: ChatId = ChatId(-2002);
const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);
const ADMIN: UserId = UserId(100);

// ============================================================================
// Collaborators
// ============================================================================

mock! {
    pub Resolver {}

    #[async_trait]
    impl SourceResolver for Resolver {
        async fn resolve(&self, query: &str) -> Result<PlayableSource, ResolutionError>;
        async fn resolve_playlist(&self, query: &str, limit: usize) -> Result<Vec<PlayableSource>, ResolutionError>;
    }
}

struct NullStream;

#[async_trait]
impl StreamSession for NullStream {
    async fn set_volume(&self, _volume: u16) -> BridgeResult<()> {
        Ok(())
    }

    async fn seek(&self, _position: Duration) -> BridgeResult<()> {
        Ok(())
    }

    async fn pause(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn resume(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn close(&self) -> BridgeResult<()> {
        Ok(())
    }
}

struct Opened {
    chat_id: ChatId,
    options: StreamOptions,
    events: SinkEventSender,
}

struct FakeSink {
    opened: mpsc::UnboundedSender<Opened>,
    left: Mutex<Vec<ChatId>>,
}

#[async_trait]
impl StreamingSink for FakeSink {
    async fn open_stream(
        &self,
        chat_id: ChatId,
        _audio: &AudioHandle,
        options: StreamOptions,
        events: SinkEventSender,
    ) -> BridgeResult<Box<dyn StreamSession>> {
        let _ = self.opened.send(Opened {
            chat_id,
            options,
            events,
        });
        Ok(Box::new(NullStream))
    }

    async fn leave(&self, chat_id: ChatId) -> BridgeResult<()> {
        self.left.lock().push(chat_id);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(ChatId, String)>>,
}

impl RecordingNotifier {
    fn sent(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|(_, m)| m.contains(needle))
    }
}

#[async_trait]
impl ChatNotifier for RecordingNotifier {
    async fn notify(&self, chat_id: ChatId, message: &str) -> BridgeResult<()> {
        self.messages.lock().push((chat_id, message.to_string()));
        Ok(())
    }

    async fn listener_count(&self, _chat_id: ChatId) -> BridgeResult<usize> {
        Ok(1)
    }
}

#[derive(Default)]
struct MemoryStore {
    snapshots: Mutex<HashMap<ChatId, String>>,
    banned: Mutex<Vec<UserId>>,
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save_session_snapshot(&self, chat_id: ChatId, snapshot: &str) -> BridgeResult<()> {
        self.snapshots.lock().insert(chat_id, snapshot.to_string());
        Ok(())
    }

    async fn load_session_snapshot(&self, chat_id: ChatId) -> BridgeResult<Option<String>> {
        Ok(self.snapshots.lock().get(&chat_id).cloned())
    }

    async fn delete_session_snapshot(&self, chat_id: ChatId) -> BridgeResult<()> {
        self.snapshots.lock().remove(&chat_id);
        Ok(())
    }

    async fn list_session_snapshots(&self) -> BridgeResult<Vec<ChatId>> {
        Ok(self.snapshots.lock().keys().copied().collect())
    }

    async fn save_banned_users(&self, users: &[UserId]) -> BridgeResult<()> {
        *self.banned.lock() = users.to_vec();
        Ok(())
    }

    async fn load_banned_users(&self) -> BridgeResult<Vec<UserId>> {
        Ok(self.banned.lock().clone())
    }
}

struct FileFetcher;

#[async_trait]
impl MediaFetcher for FileFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchedMedia, FetchFailure> {
        std::fs::write(&request.destination, b"audio")
            .map_err(|e| FetchFailure::NetworkError(e.to_string()))?;
        Ok(FetchedMedia {
            path: request.destination,
            duration_seconds: None,
        })
    }
}

struct Passthrough;

#[async_trait]
impl Transcoder for Passthrough {
    async fn transcode(
        &self,
        input: &Path,
        _profile: &TranscodeProfile,
    ) -> Result<PathBuf, FetchFailure> {
        Ok(input.to_path_buf())
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    _dir: TempDir,
    service: CoreService,
    sink: Arc<FakeSink>,
    notifier: Arc<RecordingNotifier>,
    store: Arc<MemoryStore>,
    opened: mpsc::UnboundedReceiver<Opened>,
}

impl Harness {
    async fn start(resolver: MockResolver) -> Self {
        Self::start_with(resolver, |b| b, Arc::new(MemoryStore::default())).await
    }

    async fn start_with(
        resolver: MockResolver,
        configure: impl FnOnce(EngineConfigBuilder) -> EngineConfigBuilder,
        store: Arc<MemoryStore>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let builder = EngineConfig::builder()
            .temp_dir(dir.path())
            .max_downloads(2)
            .max_retries(2)
            .retry_backoff(Duration::from_millis(10), Duration::from_millis(50))
            .auto_leave_delay(Duration::from_secs(60))
            .rate_limit(100, Duration::from_secs(10));
        let config = configure(builder).build().unwrap();

        let (opened_tx, opened) = mpsc::unbounded_channel();
        let sink = Arc::new(FakeSink {
            opened: opened_tx,
            left: Mutex::new(Vec::new()),
        });
        let notifier = Arc::new(RecordingNotifier::default());

        let deps = CoreDependencies {
            resolver: Arc::new(resolver),
            fetcher: Arc::new(FileFetcher),
            transcoder: Arc::new(Passthrough),
            sink: sink.clone(),
            notifier: notifier.clone(),
            store: store.clone(),
            clock: Arc::new(ManualClock::default()),
        };
        let service = CoreService::start(config, deps).await.unwrap();

        Self {
            _dir: dir,
            service,
            sink,
            notifier,
            store,
            opened,
        }
    }

    async fn run(&self, user: UserId, kind: CommandKind) -> Reply {
        self.service.execute(Command::new(CHAT, user, kind)).await
    }

    async fn run_as_admin(&self, kind: CommandKind) -> Reply {
        self.service
            .execute(Command::new(CHAT, ADMIN, kind).as_admin())
            .await
    }

    async fn next_stream(&mut self) -> Opened {
        self.opened.recv().await.expect("sink channel closed")
    }
}

fn song(query: &str) -> PlayableSource {
    PlayableSource::new(Provider::Youtube, format!("yt:{}", query), query, 30)
}

fn resolving_everything() -> MockResolver {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .returning(|query: &str| Ok(song(query)));
    resolver
}

fn play(query: &str) -> CommandKind {
    CommandKind::Play {
        query: query.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_play_creates_session_and_notifies_chat() {
    let mut h = Harness::start(resolving_everything()).await;

    let reply = h.run(ALICE, play("Alpha")).await;
    assert!(reply.success);
    assert_eq!(reply.message, "Loading Alpha [0:30]");

    let stream = h.next_stream().await;
    assert_eq!(stream.chat_id, CHAT);
    assert_eq!(h.service.registry().list_active().await, vec![CHAT]);

    let reply = h.run(BOB, play("Bravo")).await;
    assert_eq!(reply.message, "Added to queue at position 2: Bravo [0:30]");

    assert!(h.notifier.sent("Loading Alpha"));
    assert!(h.notifier.sent("Now playing: Alpha"));
    assert!(h.notifier.sent("Added to queue at position 2"));
}

#[tokio::test(start_paused = true)]
async fn test_provider_outage_is_retried_once() {
    let mut resolver = MockResolver::new();
    let mut seq = Sequence::new();
    resolver
        .expect_resolve()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(ResolutionError::ProviderUnavailable("503".to_string())));
    resolver
        .expect_resolve()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|query: &str| Ok(song(query)));
    let h = Harness::start(resolver).await;

    let reply = h.run(ALICE, play("Alpha")).await;
    assert!(reply.success, "{}", reply.message);
}

#[tokio::test(start_paused = true)]
async fn test_not_found_is_not_retried_and_creates_no_session() {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .times(1)
        .returning(|query: &str| Err(ResolutionError::NotFound(query.to_string())));
    let h = Harness::start(resolver).await;

    let reply = h.run(ALICE, play("nothing")).await;
    assert!(!reply.success);
    assert_eq!(reply.message, "Nothing found for \"nothing\"");
    assert!(h.service.registry().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_empty_query_is_rejected_before_resolving() {
    let h = Harness::start(MockResolver::new()).await;

    let reply = h.run(ALICE, play("   ")).await;
    assert!(!reply.success);
    assert_eq!(reply.message, "Tell me what to play");
}

#[tokio::test(start_paused = true)]
async fn test_playlist_is_truncated_to_limit() {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve_playlist()
        .times(1)
        .returning(|_, _| Ok(vec![song("One"), song("Two"), song("Three")]));
    let h = Harness::start_with(
        resolver,
        |b| b.max_playlist_size(2),
        Arc::new(MemoryStore::default()),
    )
    .await;

    let reply = h
        .run(
            ALICE,
            CommandKind::Playlist {
                query: "https://example.com/list".to_string(),
            },
        )
        .await;
    assert!(reply.success, "{}", reply.message);
    assert_eq!(reply.message, "Added 2 tracks from the playlist");
}

#[tokio::test(start_paused = true)]
async fn test_ban_requires_admin_and_blocks_user() {
    let h = Harness::start(MockResolver::new()).await;

    let reply = h.run(ALICE, CommandKind::Ban { user: BOB }).await;
    assert!(!reply.success);
    assert_eq!(reply.message, "Only admins can use ban");

    let reply = h.run_as_admin(CommandKind::Ban { user: BOB }).await;
    assert_eq!(reply.message, "User 2 is now banned");
    assert_eq!(*h.store.banned.lock(), vec![BOB]);

    // The resolver has no expectations: a banned play must not reach it.
    let reply = h.run(BOB, play("Alpha")).await;
    assert!(!reply.success);
    assert_eq!(reply.message, "You are banned from using this bot");

    let reply = h.run_as_admin(CommandKind::Unban { user: BOB }).await;
    assert_eq!(reply.message, "User 2 is no longer banned");
    assert!(!h.service.bans().is_banned(BOB).await);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_applies_to_regular_users_only() {
    let h = Harness::start_with(
        MockResolver::new(),
        |b| b.rate_limit(2, Duration::from_secs(10)),
        Arc::new(MemoryStore::default()),
    )
    .await;

    assert!(h.run(ALICE, CommandKind::Queue).await.success);
    assert!(h.run(ALICE, CommandKind::Queue).await.success);
    let reply = h.run(ALICE, CommandKind::Queue).await;
    assert!(!reply.success);
    assert_eq!(reply.message, "Slow down, try again in 10s");

    for _ in 0..5 {
        assert!(h.run_as_admin(CommandKind::Queue).await.success);
    }
}

#[tokio::test(start_paused = true)]
async fn test_commands_without_session() {
    let h = Harness::start(MockResolver::new()).await;

    let reply = h.run(ALICE, CommandKind::Queue).await;
    assert_eq!(reply.message, "The queue is empty");
    let reply = h.run(ALICE, CommandKind::History).await;
    assert_eq!(reply.message, "Nothing has been played yet");

    let reply = h.run(ALICE, CommandKind::Volume { level: 50 }).await;
    assert!(!reply.success);
    assert_eq!(reply.message, "Nothing is playing in this chat");

    let reply = h.run(ALICE, CommandKind::Stop).await;
    assert_eq!(reply.message, "Only admins can use stop");

    assert!(h.service.registry().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_seek_parses_time_strings() {
    let mut h = Harness::start(resolving_everything()).await;
    h.run(ALICE, play("Alpha")).await;
    h.next_stream().await;

    let reply = h
        .run(
            ALICE,
            CommandKind::Seek {
                time: "0:15".to_string(),
            },
        )
        .await;
    assert_eq!(reply.message, "Seeked to 0:15");

    let reply = h
        .run(
            ALICE,
            CommandKind::Seek {
                time: "soon".to_string(),
            },
        )
        .await;
    assert!(!reply.success);
}

#[tokio::test(start_paused = true)]
async fn test_admin_stop_clears_queue() {
    let mut h = Harness::start(resolving_everything()).await;
    h.run(ALICE, play("Alpha")).await;
    h.run(ALICE, play("Bravo")).await;
    h.next_stream().await;

    let reply = h.run_as_admin(CommandKind::Stop).await;
    assert!(reply.success, "{}", reply.message);
    assert_eq!(reply.message, "Stopped playback and cleared 2 tracks");
}

#[tokio::test(start_paused = true)]
async fn test_destroy_is_idempotent() {
    let mut h = Harness::start(resolving_everything()).await;
    h.run(ALICE, play("Alpha")).await;
    h.next_stream().await;
    assert!(h.store.snapshots.lock().contains_key(&CHAT));

    assert!(h.service.destroy_session(CHAT).await.unwrap());
    assert!(!h.service.destroy_session(CHAT).await.unwrap());

    assert!(h.service.registry().is_empty().await);
    assert!(!h.store.snapshots.lock().contains_key(&CHAT));
    assert_eq!(*h.sink.left.lock(), vec![CHAT]);
    assert_eq!(h.service.stats().await.temp_files.files, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restore_resumes_stored_sessions_and_drops_garbage() {
    let store = Arc::new(MemoryStore::default());

    let mut queue = SessionQueue::new(CHAT, QueueLimits::default());
    queue
        .enqueue(ALICE, song("Alpha"), MediaKind::Audio, chrono::Utc::now())
        .unwrap();
    let snapshot = SessionSnapshot::capture(&queue, 120, 7_000, chrono::Utc::now());
    store
        .snapshots
        .lock()
        .insert(CHAT, snapshot.to_json().unwrap());
    store
        .snapshots
        .lock()
        .insert(ChatId(-9), "{ not json".to_string());

    let mut h = Harness::start_with(MockResolver::new(), |b| b, store).await;

    let stream = h.next_stream().await;
    assert_eq!(stream.chat_id, CHAT);
    assert_eq!(stream.options.start_at, Duration::from_secs(7));
    assert_eq!(stream.options.volume, 120);

    assert_eq!(h.service.registry().list_active().await, vec![CHAT]);
    assert!(!h.store.snapshots.lock().contains_key(&ChatId(-9)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_is_reaped_after_auto_leave_delay() {
    let mut h = Harness::start(resolving_everything()).await;
    h.run(ALICE, play("Alpha")).await;
    let stream = h.next_stream().await;
    stream
        .events
        .send(SinkEvent::completed(stream.options.stream_id))
        .unwrap();

    for _ in 0..120 {
        if h.service.registry().is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    assert!(h.service.registry().is_empty().await);
    assert!(!h.store.snapshots.lock().contains_key(&CHAT));
    assert_eq!(*h.sink.left.lock(), vec![CHAT]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_keeps_snapshots_for_next_start() {
    let mut h = Harness::start(resolving_everything()).await;
    h.run(ALICE, play("Alpha")).await;
    h.run(ALICE, play("Bravo")).await;
    h.next_stream().await;

    h.service.shutdown().await;

    assert!(h.service.registry().is_empty().await);
    let json = h.store.snapshots.lock().get(&CHAT).cloned().unwrap();
    let snapshot = SessionSnapshot::from_json(&json).unwrap();
    assert_eq!(snapshot.tracks.len(), 2);
}
