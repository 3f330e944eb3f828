//! Prompt construction for the text and image backends

use crate::persona::{Persona, Scenario};
use crate::state_machine::{AppearanceState, ArtifactContext, Role, Session, Turn};
use std::fmt::Write;

/// Stand-in for the user's name in prompts; never stored
pub const NAME_PLACEHOLDER: &str = "there";

const IMAGE_PROMPT_MAX_CHARS: usize = 800;

const NEGATIVE_PROMPT: &str = "(two people, couple, group, men, male, other people:2.0), \
    (extra limbs, extra fingers, mutated hands, bad anatomy, malformed:2.0), \
    3d, cartoon, anime, illustration, watermark, signature, text, blurry, \
    (worst quality:2), (low quality:2)";

const FIRST_IMAGE_NEGATIVE: &str = ", (nude, naked, topless, exposed body, nsfw, explicit:2.0)";

/// Everything the reply prompt is built from
pub struct ReplyContext<'a> {
    pub persona: &'a Persona,
    pub scenario: &'a Scenario,
    pub session: &'a Session,
    pub history_window: usize,
    pub reply_max_len: u32,
}

/// ChatML-style prompt for the reply step. The user's message is expected to
/// already be the last turn of the session history.
pub fn reply_prompt(ctx: &ReplyContext<'_>) -> String {
    let name = ctx
        .session
        .display_name
        .as_deref()
        .unwrap_or(NAME_PLACEHOLDER);
    let mut system = ctx.persona.system_prompt.replace("{user_name}", name);

    let _ = write!(
        system,
        "\n**Current Scenario Context:** You are in {}. You are wearing {}.",
        ctx.scenario.scenario_prompt.replace("{user_name}", name),
        ctx.session.attire
    );
    let _ = write!(
        system,
        "\n**IMPORTANT:** Use simple, clear English. Keep responses concise (max {} tokens).",
        ctx.reply_max_len
    );
    if let Some(artifact) = &ctx.session.last_artifact {
        system.push_str("\n**IMAGE CONTEXT:** ");
        system.push_str(&artifact_annotation(artifact));
    }

    let mut prompt = format!("<|im_start|>system\n{system}<|im_end|>");
    for turn in ctx.session.recent_turns(ctx.history_window) {
        push_turn(&mut prompt, turn);
    }
    let _ = write!(prompt, "<|im_start|>assistant\n{}:", ctx.persona.full_name);
    prompt
}

fn push_turn(prompt: &mut String, turn: &Turn) {
    let role = match turn.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    let _ = write!(prompt, "<|im_start|>{role}\n{}<|im_end|>", turn.text);
}

/// What the persona must acknowledge about the artifact the user just saw
pub fn artifact_annotation(artifact: &ArtifactContext) -> String {
    match artifact.appearance {
        AppearanceState::Revealed => "You have just revealed yourself completely in the last \
            image. Your dialogue must acknowledge that you are no longer wearing clothes."
            .to_string(),
        AppearanceState::Transitioning => format!(
            "An image of you partially removing your {} was just sent. Your dialogue must \
             acknowledge this ongoing action.",
            artifact.attire
        ),
        AppearanceState::Initial => format!(
            "An image of you wearing {} was just sent. Reference your appearance naturally.",
            artifact.attire
        ),
    }
}

/// Prompt for an in-character voice-note line
pub fn voice_note_prompt(persona: &Persona, session: &Session) -> String {
    let name = session.display_name.as_deref().unwrap_or(NAME_PLACEHOLDER);
    let mut prompt = format!(
        "<|im_start|>system\n{}\nWrite one short, intimate line you would say out loud to {name} \
         in a voice message. No actions, no stage directions.<|im_end|>",
        persona.system_prompt.replace("{user_name}", name)
    );
    for turn in session.recent_turns(3) {
        push_turn(&mut prompt, turn);
    }
    let _ = write!(prompt, "<|im_start|>assistant\n{}:", persona.full_name);
    prompt
}

/// Positive and negative prompt for an image of the persona in its current
/// appearance state
pub fn image_prompt(
    persona: &Persona,
    scenario: &Scenario,
    session: &Session,
    pose: &str,
    user_message: Option<&str>,
) -> (String, String) {
    let attire_phrase = match session.appearance {
        AppearanceState::Revealed => "completely undressed".to_string(),
        AppearanceState::Transitioning => format!("removing {}", session.attire),
        AppearanceState::Initial => format!("wearing {}", session.attire),
    };
    let mut prompt = format!(
        "{}, {}, {attire_phrase}, {pose}, looking directly at the viewer",
        persona.trigger_word, scenario.scenario_prompt
    );
    if let Some(message) = user_message {
        let _ = write!(prompt, ", user just said: '{message}'");
    }
    prompt.push_str(", solo, only the woman, no other people");
    let prompt: String = prompt.chars().take(IMAGE_PROMPT_MAX_CHARS).collect();

    let mut negative = NEGATIVE_PROMPT.to_string();
    if session.artifacts_delivered == 0 {
        negative.push_str(FIRST_IMAGE_NEGATIVE);
    }
    (prompt, negative)
}
