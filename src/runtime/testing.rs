//! Mock implementations for testing
//!
//! These mocks let the turn processor, offers and the fulfillment
//! coordinator run without network I/O. Persistence uses the in-memory
//! SQLite database; `FlakySessionStore` wraps it to exercise retries.

use super::traits::*;
use super::Services;
use crate::db::Database;
use crate::providers::{
    CallRequest, CallStatus, ImageRequest, InteractiveOption, MediaKind, MediaPayload,
    ProviderError, VideoPoll, VideoRequest,
};
use crate::state_machine::{Session, Verdict};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Mock Text Generator
// ============================================================================

/// Text generator that returns queued replies
#[allow(dead_code)]
pub struct MockTextGenerator {
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    available: AtomicBool,
    /// Record of every prompt sent
    pub prompts: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockTextGenerator {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            available: AtomicBool::new(true),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn queue_error(&self, error: ProviderError) {
        self.replies.lock().unwrap().push_back(Err(error));
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

impl Default for MockTextGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for MockTextGenerator {
    async fn generate(&self, prompt: &str, _max_len: u32) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("*I smile.* Tell me more.".to_string()))
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn name(&self) -> &str {
        "mock-text"
    }
}

// ============================================================================
// Mock Image Backend
// ============================================================================

/// Image backend with queued artifacts and verdicts. When the image queue is
/// empty a numbered URL is generated; when the verdict queue is empty the
/// verdict is `Safe`.
#[allow(dead_code)]
pub struct MockImageBackend {
    images: Mutex<VecDeque<Result<String, ProviderError>>>,
    verdicts: Mutex<VecDeque<Verdict>>,
    counter: AtomicUsize,
    pub requests: Mutex<Vec<ImageRequest>>,
}

#[allow(dead_code)]
impl MockImageBackend {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(VecDeque::new()),
            verdicts: Mutex::new(VecDeque::new()),
            counter: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_error(&self, error: ProviderError) {
        self.images.lock().unwrap().push_back(Err(error));
    }

    pub fn queue_verdict(&self, verdict: Verdict) {
        self.verdicts.lock().unwrap().push_back(verdict);
    }

    pub fn generated(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for MockImageBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageBackend for MockImageBackend {
    async fn generate_image(&self, request: &ImageRequest) -> Result<String, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let queued = self.images.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| {
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("https://img.test/{n}.png"))
        })
    }

    async fn classify(&self, _artifact_ref: &str) -> Result<Verdict, ProviderError> {
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Verdict::Safe))
    }
}

// ============================================================================
// Mock Video Backend
// ============================================================================

#[allow(dead_code)]
pub struct MockVideoBackend {
    submissions: Mutex<VecDeque<Result<Option<String>, ProviderError>>>,
    polls: Mutex<VecDeque<Result<VideoPoll, ProviderError>>>,
    pub requests: Mutex<Vec<VideoRequest>>,
    pub poll_count: AtomicUsize,
}

#[allow(dead_code)]
impl MockVideoBackend {
    pub fn new() -> Self {
        Self {
            submissions: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            poll_count: AtomicUsize::new(0),
        }
    }

    pub fn queue_submission(&self, result: Result<Option<String>, ProviderError>) {
        self.submissions.lock().unwrap().push_back(result);
    }

    pub fn queue_poll(&self, poll: VideoPoll) {
        self.polls.lock().unwrap().push_back(Ok(poll));
    }

    pub fn polls(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }
}

impl Default for MockVideoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VideoBackend for MockVideoBackend {
    async fn submit_video(&self, request: &VideoRequest) -> Result<Option<String>, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        self.submissions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Some("job-1".to_string())))
    }

    /// Keeps reporting `Processing` once the queue is drained
    async fn poll_video(&self, _job_id: &str) -> Result<VideoPoll, ProviderError> {
        self.poll_count.fetch_add(1, Ordering::SeqCst);
        self.polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(VideoPoll::processing()))
    }
}

// ============================================================================
// Mock Speech Backend
// ============================================================================

#[allow(dead_code)]
pub struct MockSpeechBackend {
    synth_failures: AtomicBool,
    calls: Mutex<VecDeque<Option<String>>>,
    statuses: Mutex<VecDeque<CallStatus>>,
    pub synthesized: Mutex<Vec<(String, String)>>,
    pub call_requests: Mutex<Vec<CallRequest>>,
    pub terminated: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl MockSpeechBackend {
    pub fn new() -> Self {
        Self {
            synth_failures: AtomicBool::new(false),
            calls: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            synthesized: Mutex::new(Vec::new()),
            call_requests: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_synthesis(&self) {
        self.synth_failures.store(true, Ordering::SeqCst);
    }

    pub fn queue_call(&self, call_id: Option<&str>) {
        self.calls
            .lock()
            .unwrap()
            .push_back(call_id.map(str::to_string));
    }

    pub fn queue_status(&self, status: CallStatus) {
        self.statuses.lock().unwrap().push_back(status);
    }

    pub fn terminated_calls(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }
}

impl Default for MockSpeechBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpeechBackend for MockSpeechBackend {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>, ProviderError> {
        if self.synth_failures.load(Ordering::SeqCst) {
            return Err(ProviderError::server_error("synthesis unavailable"));
        }
        self.synthesized
            .lock()
            .unwrap()
            .push((text.to_string(), voice_id.to_string()));
        Ok(b"mock-audio".to_vec())
    }

    async fn start_call(&self, request: &CallRequest) -> Result<Option<String>, ProviderError> {
        self.call_requests.lock().unwrap().push(request.clone());
        Ok(self
            .calls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Some("call-1".to_string())))
    }

    /// Keeps reporting `Active` once the queue is drained
    async fn call_status(&self, _call_id: &str) -> Result<CallStatus, ProviderError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CallStatus::Active))
    }

    async fn terminate_call(&self, call_id: &str) -> Result<bool, ProviderError> {
        self.terminated.lock().unwrap().push(call_id.to_string());
        Ok(true)
    }
}

// ============================================================================
// Recording Transport
// ============================================================================

/// One message handed to the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text {
        user_id: String,
        text: String,
    },
    Media {
        user_id: String,
        kind: MediaKind,
        payload: MediaPayload,
        caption: Option<String>,
    },
    Interactive {
        user_id: String,
        text: String,
        options: Vec<InteractiveOption>,
    },
}

#[allow(dead_code)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Outbound>>,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().clone()
    }

    pub fn media_count(&self, kind: MediaKind) -> usize {
        self.messages()
            .iter()
            .filter(|m| matches!(m, Outbound::Media { kind: k, .. } if *k == kind))
            .count()
    }

    pub fn texts(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                Outbound::Text { text, .. } | Outbound::Interactive { text, .. } => Some(text),
                Outbound::Media { .. } => None,
            })
            .collect()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, user_id: &str, text: &str) -> Result<(), ProviderError> {
        self.sent.lock().unwrap().push(Outbound::Text {
            user_id: user_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn send_media(
        &self,
        user_id: &str,
        kind: MediaKind,
        payload: MediaPayload,
        caption: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.sent.lock().unwrap().push(Outbound::Media {
            user_id: user_id.to_string(),
            kind,
            payload,
            caption: caption.map(str::to_string),
        });
        Ok(())
    }

    async fn send_interactive(
        &self,
        user_id: &str,
        text: &str,
        options: &[InteractiveOption],
    ) -> Result<(), ProviderError> {
        self.sent.lock().unwrap().push(Outbound::Interactive {
            user_id: user_id.to_string(),
            text: text.to_string(),
            options: options.to_vec(),
        });
        Ok(())
    }
}

// ============================================================================
// Flaky Session Store
// ============================================================================

/// Session store that fails the first `failures` writes
#[allow(dead_code)]
pub struct FlakySessionStore {
    inner: Database,
    failures: AtomicUsize,
    pub put_attempts: AtomicUsize,
}

#[allow(dead_code)]
impl FlakySessionStore {
    pub fn new(inner: Database, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            put_attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SessionStore for FlakySessionStore {
    async fn get_session(&self, user_id: &str) -> Result<Option<Session>, String> {
        SessionStore::get_session(&self.inner, user_id).await
    }

    async fn put_session(&self, session: &Session) -> Result<bool, String> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err("database is locked".to_string());
        }
        SessionStore::put_session(&self.inner, session).await
    }

    async fn prune_sessions(&self, older_than: DateTime<Utc>) -> Result<usize, String> {
        SessionStore::prune_sessions(&self.inner, older_than).await
    }

    async fn log_turn(
        &self,
        user_id: &str,
        persona_id: Option<&str>,
        role: &str,
        text: &str,
    ) -> Result<(), String> {
        SessionStore::log_turn(&self.inner, user_id, persona_id, role, text).await
    }
}

// ============================================================================
// Test Services Builder
// ============================================================================

/// Mocks wired into a `Services` bundle, with typed handles kept for assertions
pub struct TestServices {
    pub db: Database,
    pub text: Arc<MockTextGenerator>,
    pub image: Arc<MockImageBackend>,
    pub video: Arc<MockVideoBackend>,
    pub speech: Arc<MockSpeechBackend>,
    pub transport: Arc<RecordingTransport>,
}

impl TestServices {
    pub fn new() -> Self {
        Self {
            db: Database::open_in_memory().expect("in-memory database"),
            text: Arc::new(MockTextGenerator::new()),
            image: Arc::new(MockImageBackend::new()),
            video: Arc::new(MockVideoBackend::new()),
            speech: Arc::new(MockSpeechBackend::new()),
            transport: Arc::new(RecordingTransport::new()),
        }
    }

    /// Seed an account with `balance` gems
    pub fn with_account(self, user_id: &str, balance: u64) -> Self {
        self.db
            .ensure_account(user_id, balance)
            .expect("seed account");
        self
    }

    pub fn services(&self) -> Services {
        let db = Arc::new(self.db.clone());
        Services {
            sessions: db.clone(),
            accounts: db.clone(),
            payments: db,
            text: self.text.clone(),
            image: self.image.clone(),
            video: self.video.clone(),
            speech: self.speech.clone(),
            transport: self.transport.clone(),
        }
    }
}

impl Default for TestServices {
    fn default() -> Self {
        Self::new()
    }
}
