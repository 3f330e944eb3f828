//! Out-of-band fulfillment
//!
//! Video jobs are submitted here and resolved exactly once, either by the
//! poll task or by a completion webhook, whichever arrives first. Voice
//! calls are watched by a monitor task that enforces the balance ceiling and
//! settles billing when the call ends.

mod job;
mod monitor;

pub use job::{Claim, FulfillmentJob, JobRegistry, JobSignal};
pub use monitor::{affordable_minutes, evaluate_call, settled_minutes, CallAction, CallEnd, CallJob};

use crate::config::FulfillmentConfig;
use crate::ledger::Ledger;
use crate::providers::{
    CallRequest, CallStatus, JobPollStatus, MediaKind, MediaPayload, ProviderError, VideoRequest,
};
use crate::runtime::traits::{AccountStore, SpeechBackend, Transport, VideoBackend};
use crate::runtime::Services;
use crate::state_machine::OfferKind;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const VIDEO_CAPTION: &str = "Here's the video I made for you.";
const VIDEO_FAILED_NOTICE: &str =
    "I couldn't finish your video this time. Your gems have been refunded.";
const CALL_LOW_BALANCE_WARNING: &str =
    "Heads up: you have about one minute of call time left on your balance.";

/// What happened to a completion signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    RolledBack,
    /// The job was already terminal; nothing was done
    Duplicate,
    Unknown,
}

pub struct FulfillmentCoordinator {
    video: Arc<dyn VideoBackend>,
    speech: Arc<dyn SpeechBackend>,
    transport: Arc<dyn Transport>,
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<Ledger>,
    config: FulfillmentConfig,
    call_per_minute: u64,
    jobs: JobRegistry,
    calls: Mutex<HashMap<String, CallJob>>,
    shutdown: CancellationToken,
}

impl FulfillmentCoordinator {
    pub fn new(
        services: &Services,
        ledger: Arc<Ledger>,
        config: FulfillmentConfig,
        call_per_minute: u64,
    ) -> Self {
        Self {
            video: services.video.clone(),
            speech: services.speech.clone(),
            transport: services.transport.clone(),
            accounts: services.accounts.clone(),
            ledger,
            config,
            call_per_minute,
            jobs: JobRegistry::new(),
            calls: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether the user has a video job or a call in flight
    pub fn has_active_job(&self, user_id: &str) -> bool {
        self.jobs.active_for(user_id)
            || self
                .calls
                .lock()
                .unwrap()
                .values()
                .any(|call| call.user_id == user_id)
    }

    #[allow(dead_code)] // Used in tests
    pub fn job(&self, job_id: &str) -> Option<FulfillmentJob> {
        self.jobs.get(job_id)
    }

    // ========================================================================
    // Video
    // ========================================================================

    /// Submit a video job and start polling it. `Ok(None)` means the backend
    /// refused the job; the caller still owns the reservation then.
    pub async fn submit_video(
        self: &Arc<Self>,
        user_id: &str,
        cost: u64,
        request: &VideoRequest,
    ) -> Result<Option<String>, ProviderError> {
        let Some(job_id) = self.video.submit_video(request).await? else {
            tracing::warn!(user_id = %user_id, "Video backend refused the job");
            return Ok(None);
        };
        self.jobs.insert(FulfillmentJob::submitted(
            job_id.clone(),
            user_id,
            OfferKind::Video,
            cost,
        ));
        tracing::info!(user_id = %user_id, job_id = %job_id, "Video job submitted");

        let coordinator = Arc::clone(self);
        let poll_id = job_id.clone();
        tokio::spawn(async move {
            coordinator.poll_job(poll_id).await;
        });
        Ok(Some(job_id))
    }

    async fn poll_job(&self, job_id: String) {
        for attempt in 1..=self.config.poll_max_attempts {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if self.jobs.is_terminal(&job_id) {
                tracing::debug!(job_id = %job_id, "Job resolved elsewhere, polling stopped");
                return;
            }
            match self.video.poll_video(&job_id).await {
                Ok(poll) => match (poll.status, poll.artifact_ref) {
                    (JobPollStatus::Completed, Some(artifact_ref)) => {
                        self.resolve(&job_id, JobSignal::Completed { artifact_ref }).await;
                        return;
                    }
                    (JobPollStatus::Completed, None) => {
                        self.resolve(
                            &job_id,
                            JobSignal::Failed {
                                reason: "completed without an artifact".to_string(),
                            },
                        )
                        .await;
                        return;
                    }
                    (JobPollStatus::Failed, _) => {
                        self.resolve(
                            &job_id,
                            JobSignal::Failed {
                                reason: "backend reported failure".to_string(),
                            },
                        )
                        .await;
                        return;
                    }
                    (JobPollStatus::Processing, _) => {}
                },
                Err(e) => {
                    tracing::warn!(
                        job_id = %job_id,
                        attempt,
                        error = %e.message,
                        "Video poll failed"
                    );
                }
            }
        }
        tracing::warn!(
            job_id = %job_id,
            attempts = self.config.poll_max_attempts,
            "Video polling exhausted"
        );
        self.resolve(&job_id, JobSignal::TimedOut).await;
    }

    /// The single terminal action for a job: deliver and commit, or roll
    /// back and notify. Later signals for the same job are no-ops.
    pub async fn resolve(&self, job_id: &str, signal: JobSignal) -> Resolution {
        let job = match self.jobs.claim(job_id, signal.status()) {
            Claim::Claimed(job) => job,
            Claim::AlreadyTerminal(status) => {
                tracing::info!(
                    job_id = %job_id,
                    status = status.as_str(),
                    "Duplicate completion signal ignored"
                );
                return Resolution::Duplicate;
            }
            Claim::Unknown => {
                tracing::warn!(job_id = %job_id, "Completion signal for unknown job");
                return Resolution::Unknown;
            }
        };

        match signal {
            JobSignal::Completed { artifact_ref } => {
                let delivered = self
                    .transport
                    .send_media(
                        &job.user_id,
                        MediaKind::Video,
                        MediaPayload::Url(artifact_ref),
                        Some(VIDEO_CAPTION),
                    )
                    .await;
                match delivered {
                    Ok(()) => {
                        if let Err(e) = self.ledger.commit(&job.user_id).await {
                            tracing::error!(
                                job_id = %job_id,
                                error = %e,
                                "Failed to commit reservation"
                            );
                        }
                        tracing::info!(job_id = %job_id, user_id = %job.user_id, "Video delivered");
                        Resolution::Delivered
                    }
                    Err(e) => {
                        tracing::error!(
                            job_id = %job_id,
                            error = %e.message,
                            "Video delivery failed"
                        );
                        self.refund(&job).await;
                        Resolution::RolledBack
                    }
                }
            }
            JobSignal::Failed { reason } => {
                tracing::warn!(job_id = %job_id, reason = %reason, "Video job failed");
                self.refund(&job).await;
                Resolution::RolledBack
            }
            JobSignal::TimedOut => {
                self.refund(&job).await;
                Resolution::RolledBack
            }
        }
    }

    async fn refund(&self, job: &FulfillmentJob) {
        match self.ledger.rollback(&job.user_id, None).await {
            Ok(outcome) => {
                tracing::info!(job_id = %job.job_id, ?outcome, "Video reservation rolled back");
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.job_id,
                    error = %e,
                    "Failed to roll back reservation"
                );
            }
        }
        if let Err(e) = self.transport.send_text(&job.user_id, VIDEO_FAILED_NOTICE).await {
            tracing::warn!(
                user_id = %job.user_id,
                error = %e.message,
                "Failed to send failure notice"
            );
        }
    }

    /// Inbound webhook for a video job
    pub async fn handle_video_event(
        &self,
        job_id: &str,
        status: &str,
        artifact_ref: Option<String>,
    ) -> Option<Resolution> {
        let signal = match (status.trim().to_ascii_lowercase().as_str(), artifact_ref) {
            ("completed" | "succeeded", Some(artifact_ref)) => {
                JobSignal::Completed { artifact_ref }
            }
            ("completed" | "succeeded", None) => JobSignal::Failed {
                reason: "completed without an artifact".to_string(),
            },
            ("failed" | "error" | "canceled", _) => JobSignal::Failed {
                reason: format!("webhook status {status}"),
            },
            _ => {
                tracing::debug!(job_id = %job_id, status = %status, "Non-terminal video event");
                return None;
            }
        };
        Some(self.resolve(job_id, signal).await)
    }

    // ========================================================================
    // Voice calls
    // ========================================================================

    /// Place a call and start monitoring it. `Ok(None)` means it could not
    /// be placed; nothing has been charged.
    pub async fn start_call(
        self: &Arc<Self>,
        request: &CallRequest,
    ) -> Result<Option<String>, ProviderError> {
        let user_id = request.user_id.as_str();
        let balance = self.ledger.balance(user_id).await.unwrap_or(0);
        let ceiling_minutes = affordable_minutes(balance, self.call_per_minute);

        let Some(call_id) = self.speech.start_call(request).await? else {
            tracing::warn!(user_id = %user_id, "Call could not be placed");
            return Ok(None);
        };

        if let Err(e) = self
            .accounts
            .record_call_start(&call_id, user_id, &request.agent_id, &request.phone_number)
            .await
        {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to log call start");
        }
        self.calls.lock().unwrap().insert(
            call_id.clone(),
            CallJob {
                user_id: user_id.to_string(),
                started: Instant::now(),
                ceiling_minutes,
                warned: false,
            },
        );
        tracing::info!(user_id = %user_id, call_id = %call_id, ceiling_minutes, "Call started");

        let coordinator = Arc::clone(self);
        let monitor_id = call_id.clone();
        tokio::spawn(async move {
            coordinator.monitor_call(monitor_id).await;
        });
        Ok(Some(call_id))
    }

    async fn monitor_call(&self, call_id: String) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.call_monitor_interval) => {}
            }
            let Some(call) = self.calls.lock().unwrap().get(&call_id).cloned() else {
                return;
            };

            match self.speech.call_status(&call_id).await {
                Ok(CallStatus::Ended) => {
                    self.settle_call(&call_id, None, CallEnd::Natural, None).await;
                    return;
                }
                Ok(CallStatus::Active | CallStatus::Unknown) => {}
                Err(e) => {
                    tracing::warn!(
                        call_id = %call_id,
                        error = %e.message,
                        "Call status check failed"
                    );
                }
            }

            let ceiling = match self.ledger.balance(&call.user_id).await {
                Ok(balance) => affordable_minutes(balance, self.call_per_minute),
                Err(_) => call.ceiling_minutes,
            };
            let elapsed_minutes = call.started.elapsed().as_secs() / 60;
            match evaluate_call(
                elapsed_minutes,
                ceiling,
                call.warned,
                self.config.call_failsafe_minutes,
            ) {
                CallAction::Continue => {}
                CallAction::Warn => {
                    if let Some(call) = self.calls.lock().unwrap().get_mut(&call_id) {
                        call.warned = true;
                    }
                    if let Err(e) = self
                        .transport
                        .send_text(&call.user_id, CALL_LOW_BALANCE_WARNING)
                        .await
                    {
                        tracing::warn!(
                            call_id = %call_id,
                            error = %e.message,
                            "Failed to send call warning"
                        );
                    }
                }
                CallAction::Terminate => {
                    self.hang_up(&call_id, CallEnd::Ceiling, ceiling).await;
                    return;
                }
                CallAction::Failsafe => {
                    let cap = ceiling.min(self.config.call_failsafe_minutes);
                    self.hang_up(&call_id, CallEnd::Failsafe, cap).await;
                    return;
                }
            }
        }
    }

    /// Hang up and bill at most `cap_minutes`
    async fn hang_up(&self, call_id: &str, reason: CallEnd, cap_minutes: u64) {
        tracing::warn!(
            call_id = %call_id,
            reason = reason.as_str(),
            cap_minutes,
            "Terminating call"
        );
        match self.speech.terminate_call(call_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(call_id = %call_id, "Call termination was not acknowledged");
            }
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e.message, "Call termination failed");
            }
        }
        self.settle_call(call_id, None, reason, Some(cap_minutes)).await;
    }

    /// Bill a finished call once. Returns the gems charged, or `None` if the
    /// call was already settled or never tracked.
    pub async fn settle_call(
        &self,
        call_id: &str,
        duration_secs: Option<u64>,
        reason: CallEnd,
        cap_minutes: Option<u64>,
    ) -> Option<u64> {
        let Some(call) = self.calls.lock().unwrap().remove(call_id) else {
            tracing::info!(call_id = %call_id, "Call already settled");
            return None;
        };
        let duration = duration_secs.unwrap_or_else(|| call.started.elapsed().as_secs());
        let minutes = settled_minutes(duration, cap_minutes);
        let cost = minutes.saturating_mul(self.call_per_minute);
        let charged = match self.ledger.charge_up_to(&call.user_id, cost).await {
            Ok(charged) => charged,
            Err(e) => {
                tracing::error!(call_id = %call_id, error = %e, "Failed to bill call");
                0
            }
        };
        if let Err(e) = self
            .accounts
            .finish_call(call_id, duration, charged, reason.as_str())
            .await
        {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to log call end");
        }
        tracing::info!(
            call_id = %call_id,
            user_id = %call.user_id,
            duration_secs = duration,
            minutes,
            charged,
            reason = reason.as_str(),
            "Call settled"
        );

        let notice = format!(
            "Our call lasted {minutes} minute{}. {charged} gems were used.",
            if minutes == 1 { "" } else { "s" }
        );
        if let Err(e) = self.transport.send_text(&call.user_id, &notice).await {
            tracing::warn!(call_id = %call_id, error = %e.message, "Failed to send call summary");
        }
        Some(charged)
    }

    /// Inbound webhook for a call
    pub async fn handle_call_event(
        &self,
        call_id: &str,
        event_type: &str,
        duration_secs: Option<u64>,
    ) -> Option<u64> {
        // providers namespace their event names ("call.completed")
        let label = event_type.rsplit('.').next().unwrap_or(event_type);
        if CallStatus::from_label(label) != CallStatus::Ended {
            tracing::debug!(
                call_id = %call_id,
                event_type = %event_type,
                "Non-terminal call event"
            );
            return None;
        }
        self.settle_call(call_id, duration_secs, CallEnd::Natural, None).await
    }

    // ========================================================================
    // Housekeeping
    // ========================================================================

    pub fn prune_finished(&self, older_than: chrono::Duration) -> usize {
        self.jobs.prune_terminal(Utc::now() - older_than)
    }

    /// Stop every poll and monitor task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::job::JobStatus;
    use super::*;
    use crate::providers::VideoPoll;
    use crate::runtime::testing::{Outbound, TestServices};
    use std::time::Duration;

    fn fast_config() -> FulfillmentConfig {
        FulfillmentConfig {
            poll_interval: Duration::from_millis(1),
            poll_max_attempts: 5,
            call_monitor_interval: Duration::from_millis(1),
            call_failsafe_minutes: 60,
        }
    }

    fn build(
        t: &TestServices,
        config: FulfillmentConfig,
    ) -> (Arc<FulfillmentCoordinator>, Arc<Ledger>) {
        let services = t.services();
        let ledger = Arc::new(Ledger::new(services.accounts.clone()));
        let coordinator = Arc::new(FulfillmentCoordinator::new(
            &services,
            ledger.clone(),
            config,
            50,
        ));
        (coordinator, ledger)
    }

    fn request() -> VideoRequest {
        VideoRequest {
            image_ref: "https://img.test/still.png".to_string(),
            prompt: "she twirls".to_string(),
            lora_url: None,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn duplicate_completion_delivers_and_settles_once() {
        let t = TestServices::new().with_account("u1", 500);
        // keep the poller from resolving first
        let (coordinator, ledger) = build(
            &t,
            FulfillmentConfig {
                poll_interval: Duration::from_secs(3600),
                ..fast_config()
            },
        );

        ledger.reserve_and_deduct("u1", 80).await.unwrap();
        let job_id = coordinator
            .submit_video("u1", 80, &request())
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.has_active_job("u1"));

        let first = coordinator
            .handle_video_event(&job_id, "completed", Some("https://vid.test/1.mp4".into()))
            .await;
        let second = coordinator
            .handle_video_event(&job_id, "completed", Some("https://vid.test/1.mp4".into()))
            .await;
        let third = coordinator
            .resolve(&job_id, JobSignal::TimedOut)
            .await;

        assert_eq!(first, Some(Resolution::Delivered));
        assert_eq!(second, Some(Resolution::Duplicate));
        assert_eq!(third, Resolution::Duplicate);
        assert_eq!(t.transport.media_count(MediaKind::Video), 1);
        assert_eq!(ledger.balance("u1").await.unwrap(), 420);
        assert!(!ledger.has_reservation("u1").await.unwrap());
        assert!(!coordinator.has_active_job("u1"));
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn poll_exhaustion_restores_the_snapshot() {
        let t = TestServices::new().with_account("u1", 500);
        let (coordinator, ledger) = build(&t, fast_config());

        assert_eq!(
            ledger.reserve_and_deduct("u1", 80).await.unwrap(),
            crate::ledger::Deduction::Applied { new_balance: 420 }
        );
        let job_id = coordinator
            .submit_video("u1", 80, &request())
            .await
            .unwrap()
            .unwrap();

        wait_until(|| {
            coordinator
                .job(&job_id)
                .is_some_and(|job| job.status.is_terminal())
        })
        .await;

        assert_eq!(coordinator.job(&job_id).unwrap().status, JobStatus::TimedOut);
        assert_eq!(t.video.polls(), 5);
        assert_eq!(ledger.balance("u1").await.unwrap(), 500);
        assert!(t
            .transport
            .texts()
            .iter()
            .any(|text| text.contains("refunded")));
    }

    #[tokio::test]
    async fn poller_delivers_a_completed_job() {
        let t = TestServices::new().with_account("u1", 500);
        t.video.queue_poll(VideoPoll::processing());
        t.video.queue_poll(VideoPoll::completed("https://vid.test/2.mp4"));
        let (coordinator, ledger) = build(&t, fast_config());

        ledger.reserve_and_deduct("u1", 80).await.unwrap();
        let job_id = coordinator
            .submit_video("u1", 80, &request())
            .await
            .unwrap()
            .unwrap();
        wait_until(|| !coordinator.has_active_job("u1")).await;

        assert_eq!(coordinator.job(&job_id).unwrap().status, JobStatus::Completed);
        assert_eq!(ledger.balance("u1").await.unwrap(), 420);
        assert!(!ledger.has_reservation("u1").await.unwrap());
        // a late webhook changes nothing
        assert_eq!(
            coordinator
                .handle_video_event(&job_id, "failed", None)
                .await,
            Some(Resolution::Duplicate)
        );
        assert_eq!(ledger.balance("u1").await.unwrap(), 420);
    }

    #[tokio::test]
    async fn refused_submission_tracks_nothing() {
        let t = TestServices::new().with_account("u1", 500);
        t.video.queue_submission(Ok(None));
        let (coordinator, _ledger) = build(&t, fast_config());
        assert_eq!(
            coordinator.submit_video("u1", 80, &request()).await.unwrap(),
            None
        );
        assert!(!coordinator.has_active_job("u1"));
    }

    #[tokio::test]
    async fn unknown_job_is_ignored() {
        let t = TestServices::new();
        let (coordinator, _ledger) = build(&t, fast_config());
        assert_eq!(
            coordinator
                .handle_video_event("ghost", "completed", Some("x".into()))
                .await,
            Some(Resolution::Unknown)
        );
        assert_eq!(
            coordinator.handle_video_event("ghost", "processing", None).await,
            None
        );
    }

    fn call_request() -> CallRequest {
        CallRequest {
            agent_id: "agent-isabella".to_string(),
            phone_number: "+15551234567".to_string(),
            user_id: "u1".to_string(),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn call_is_billed_once_on_natural_end() {
        let t = TestServices::new().with_account("u1", 500);
        t.speech.queue_status(CallStatus::Active);
        t.speech.queue_status(CallStatus::Ended);
        let (coordinator, ledger) = build(&t, fast_config());

        let call_id = coordinator
            .start_call(&call_request())
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.has_active_job("u1"));
        wait_until(|| !coordinator.has_active_job("u1")).await;

        // under a minute still bills one minute
        assert_eq!(ledger.balance("u1").await.unwrap(), 450);
        let record = t.db.get_call(&call_id).unwrap().unwrap();
        assert_eq!(record.status, "completed");
        assert_eq!(record.cost, Some(50));

        // the provider's end-of-call webhook arrives late
        assert_eq!(
            coordinator
                .handle_call_event(&call_id, "ended", Some(30))
                .await,
            None
        );
        assert_eq!(ledger.balance("u1").await.unwrap(), 450);
    }

    #[tokio::test]
    async fn webhook_duration_is_billed_and_capped_at_balance() {
        let t = TestServices::new().with_account("u1", 120);
        let (coordinator, ledger) = build(
            &t,
            FulfillmentConfig {
                call_monitor_interval: Duration::from_secs(3600),
                ..fast_config()
            },
        );

        let call_id = coordinator
            .start_call(&call_request())
            .await
            .unwrap()
            .unwrap();
        // 3 minutes would be 150 gems; only 120 are there
        let charged = coordinator
            .handle_call_event(&call_id, "call.completed", Some(170))
            .await;
        assert_eq!(charged, Some(120));
        assert_eq!(ledger.balance("u1").await.unwrap(), 0);
        assert!(t
            .transport
            .messages()
            .iter()
            .any(|m| matches!(m, Outbound::Text { text, .. } if text.contains("3 minutes"))));
        coordinator.shutdown();
    }

    #[tokio::test]
    async fn ceiling_settlement_hangs_up_through_the_backend() {
        let t = TestServices::new().with_account("u1", 100);
        let (coordinator, ledger) = build(
            &t,
            FulfillmentConfig {
                call_monitor_interval: Duration::from_secs(3600),
                ..fast_config()
            },
        );
        let call_id = coordinator
            .start_call(&call_request())
            .await
            .unwrap()
            .unwrap();

        coordinator.hang_up(&call_id, CallEnd::Ceiling, 2).await;
        assert_eq!(t.speech.terminated_calls(), vec![call_id.clone()]);
        assert_eq!(
            t.db.get_call(&call_id).unwrap().unwrap().status,
            "terminated_balance"
        );
        assert_eq!(ledger.balance("u1").await.unwrap(), 50);
        coordinator.shutdown();
    }

    fn backdate(coordinator: &FulfillmentCoordinator, call_id: &str, secs: u64) {
        let mut calls = coordinator.calls.lock().unwrap();
        let call = calls.get_mut(call_id).unwrap();
        call.started = Instant::now().checked_sub(Duration::from_secs(secs)).unwrap();
    }

    #[tokio::test]
    async fn monitor_bills_exactly_the_ceiling() {
        // 120 gems at 50/min covers 2 minutes
        let t = TestServices::new().with_account("u1", 120);
        let (coordinator, ledger) = build(&t, fast_config());
        let call_id = coordinator
            .start_call(&call_request())
            .await
            .unwrap()
            .unwrap();
        // the monitor first looks 10 s past the ceiling
        backdate(&coordinator, &call_id, 130);
        wait_until(|| !coordinator.has_active_job("u1")).await;

        assert_eq!(t.speech.terminated_calls(), vec![call_id.clone()]);
        let record = t.db.get_call(&call_id).unwrap().unwrap();
        assert_eq!(record.status, "terminated_balance");
        assert_eq!(record.cost, Some(100));
        assert_eq!(ledger.balance("u1").await.unwrap(), 20);
    }

    #[tokio::test]
    async fn failsafe_bills_no_more_than_the_ceiling() {
        let t = TestServices::new().with_account("u1", 500);
        let (coordinator, ledger) = build(
            &t,
            FulfillmentConfig {
                call_monitor_interval: Duration::from_secs(3600),
                ..fast_config()
            },
        );
        let call_id = coordinator
            .start_call(&call_request())
            .await
            .unwrap()
            .unwrap();
        backdate(&coordinator, &call_id, 200);

        coordinator.hang_up(&call_id, CallEnd::Failsafe, 3).await;
        assert_eq!(
            t.db.get_call(&call_id).unwrap().unwrap().status,
            "terminated_failsafe"
        );
        assert_eq!(ledger.balance("u1").await.unwrap(), 350);
        coordinator.shutdown();
    }
}
