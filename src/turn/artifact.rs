//! Included artifacts: free images that arrive on the turn cadence

use super::{Attachment, TurnProcessor};
use crate::persona::{Persona, Scenario};
use crate::prompt::image_prompt;
use crate::providers::{ImageRequest, MediaKind, MediaPayload};
use crate::state_machine::{
    cadence_due, verdict_target, AppearanceSignal, AppearanceState, Session, Verdict,
};
use rand::seq::SliceRandom;

const INITIAL_POSES: &[&str] = &[
    "smiling warmly",
    "leaning against the counter",
    "sitting with legs crossed",
    "playing with her hair",
];
const TRANSITIONING_POSES: &[&str] = &[
    "slowly slipping a strap off her shoulder",
    "looking back over her shoulder",
    "biting her lip",
];
const REVEALED_POSES: &[&str] = &["lying back relaxed", "standing confidently", "stretching"];

fn pick_pose(appearance: AppearanceState) -> &'static str {
    let poses = match appearance {
        AppearanceState::Initial => INITIAL_POSES,
        AppearanceState::Transitioning => TRANSITIONING_POSES,
        AppearanceState::Revealed => REVEALED_POSES,
    };
    poses.choose(&mut rand::thread_rng()).copied().unwrap_or("smiling")
}

impl TurnProcessor {
    /// Generate the included artifact if one is due this turn.
    ///
    /// The very first artifact must be classified safe; it gets a few
    /// attempts and is skipped otherwise. Later verdicts may advance the
    /// appearance one step.
    pub(super) async fn included_artifact(
        &self,
        session: &mut Session,
        persona: &Persona,
        scenario: &Scenario,
        user_text: &str,
    ) -> Option<Attachment> {
        let config = &self.config;
        if !cadence_due(
            session.turns_since_artifact,
            session.artifacts_delivered,
            config.first_artifact_threshold,
            config.artifact_interval,
            config.included_artifact_limit,
        ) {
            return None;
        }
        session.turns_since_artifact = 0;

        let first = session.artifacts_delivered == 0;
        let attempts = if first {
            config.first_artifact_attempts.max(1)
        } else {
            1
        };

        for attempt in 1..=attempts {
            let pose = pick_pose(session.appearance);
            let (prompt, negative_prompt) =
                image_prompt(persona, scenario, session, pose, Some(user_text));
            let request = ImageRequest {
                model: persona.image_model.clone(),
                prompt,
                negative_prompt,
                seed: u64::from(rand::random::<u32>()),
            };

            let artifact_ref = match self.services.image.generate_image(&request).await {
                Ok(artifact_ref) => artifact_ref,
                Err(e) => {
                    tracing::warn!(
                        user_id = %session.user_id,
                        attempt,
                        error = %e.message,
                        "Included image failed"
                    );
                    continue;
                }
            };
            let verdict = match self.services.image.classify(&artifact_ref).await {
                Ok(verdict) => Some(verdict),
                Err(e) => {
                    tracing::warn!(
                        user_id = %session.user_id,
                        error = %e.message,
                        "Classifier failed"
                    );
                    None
                }
            };

            if first {
                if verdict != Some(Verdict::Safe) {
                    tracing::info!(
                        user_id = %session.user_id,
                        attempt,
                        ?verdict,
                        "First image not safe, retrying"
                    );
                    continue;
                }
            } else if let Some(verdict) = verdict {
                if let Some(target) = verdict_target(session.appearance, verdict) {
                    session.try_transition_appearance(
                        target,
                        AppearanceSignal::Classifier { verdict },
                    );
                }
            }

            session.record_artifact(&artifact_ref, verdict);
            tracing::info!(
                user_id = %session.user_id,
                delivered = session.artifacts_delivered,
                appearance = %session.appearance,
                "Included artifact"
            );
            return Some(Attachment {
                kind: MediaKind::Image,
                payload: MediaPayload::Url(artifact_ref),
                caption: None,
            });
        }

        tracing::warn!(user_id = %session.user_id, "No included artifact this turn");
        None
    }
}
