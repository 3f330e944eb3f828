//! Trigger vocabularies for premium requests, reveal keywords, display-name
//! extraction and phone-number validation.
//!
//! Everything here is a pure function of the inbound text.

use crate::persona::VideoAction;
use crate::state_machine::OfferKind;
use regex::Regex;
use std::sync::LazyLock;

static PHOTO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:photos?|pictures?|pics?|selfies?|nudes?|body)\b|\b(?:send|show)\b.*\b(?:photo|pic|picture)",
    )
    .expect("valid photo regex")
});

static VIDEO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:videos?|clip|dancing|dance)\b|\b(?:send|show)\b.*\bvideo")
        .expect("valid video regex")
});

const VOICE_NOTE_PHRASES: [&str; 13] = [
    "voice",
    "whisper",
    "speak",
    "say it",
    "talk to me",
    "tell me more",
    "in my ear",
    "your voice",
    "say my name",
    "moan for me",
    "breathe for me",
    "audio",
    "voice note",
];

const VOICE_CALL_PHRASES: [&str; 10] = [
    "call me",
    "phone call",
    "talk on phone",
    "call you",
    "let's talk",
    "can i call",
    "i want to hear you",
    "speak to you",
    "get on a call",
    "voice call",
];

const REVEAL_KEYWORDS: [&str; 10] = [
    "naked", "nude", "sex", "fuck", "cock", "pussy", "slut", "horny", "undress", "strip",
];

static NAME_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(
            r"(?i)(?:my name is|you can call me|just call me|call me|the name is|name's|i'm|i am|it's|this is)\s+([a-z]{2,20})\b",
        )
        .expect("valid intro name regex"),
        Regex::new(r"(?i)^([a-z]{3,20})[.,!\s]*hi[.,!\s]*$").expect("valid greeting name regex"),
        Regex::new(r"(?i)^([a-z]{3,20})[.,!\s]+here\b").expect("valid here name regex"),
    ]
});

/// Words that follow "I'm"/"it's" far more often than a name does
const NOT_NAMES: [&str; 24] = [
    "so", "not", "just", "very", "really", "good", "fine", "okay", "ok", "here", "back", "sorry",
    "sure", "glad", "happy", "tired", "horny", "ready", "going", "gonna", "trying", "the", "a",
    "an",
];

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9]\d{1,14}$").expect("valid E.164 regex"));

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    let lower = text.to_lowercase();
    phrases.iter().any(|p| lower.contains(p))
}

pub fn is_photo_request(text: &str) -> bool {
    PHOTO_RE.is_match(text)
}

pub fn is_voice_note_request(text: &str) -> bool {
    contains_any(text, &VOICE_NOTE_PHRASES)
}

pub fn is_voice_call_request(text: &str) -> bool {
    contains_any(text, &VOICE_CALL_PHRASES)
}

/// A video request either names a known action or uses generic video words.
/// Returns the matched action key, if any, alongside the verdict.
pub fn detect_video_request<'a>(
    text: &str,
    actions: &'a [VideoAction],
) -> Option<Option<&'a VideoAction>> {
    let lower = text.to_lowercase();
    if let Some(action) = actions
        .iter()
        .find(|a| a.keywords.iter().any(|k| lower.contains(&k.to_lowercase())))
    {
        return Some(Some(action));
    }
    VIDEO_RE.is_match(text).then_some(None)
}

/// Explicit request detection in fixed priority order:
/// image, voice note, voice call, video.
pub fn detect_offer(text: &str, actions: &[VideoAction]) -> Option<(OfferKind, Option<String>)> {
    if is_photo_request(text) {
        return Some((OfferKind::Image, None));
    }
    if is_voice_note_request(text) {
        return Some((OfferKind::VoiceNote, None));
    }
    if is_voice_call_request(text) {
        return Some((OfferKind::VoiceCall, None));
    }
    detect_video_request(text, actions)
        .map(|action| (OfferKind::Video, action.map(|a| a.key.clone())))
}

pub fn mentions_reveal(text: &str) -> bool {
    contains_any(text, &REVEAL_KEYWORDS)
}

/// Conservative display-name extraction. Returns the name capitalized.
pub fn extract_display_name(text: &str) -> Option<String> {
    let text = text.trim();
    NAME_PATTERNS.iter().find_map(|re| {
        let candidate = re.captures(text)?.get(1)?.as_str();
        let lower = candidate.to_lowercase();
        if NOT_NAMES.contains(&lower.as_str()) {
            return None;
        }
        let mut chars = lower.chars();
        let first = chars.next()?;
        Some(first.to_uppercase().chain(chars).collect())
    })
}

/// Normalize and validate an E.164 phone number
pub fn parse_phone_number(text: &str) -> Option<String> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '.'))
        .collect();
    PHONE_RE.is_match(&cleaned).then_some(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actions() -> Vec<VideoAction> {
        vec![VideoAction {
            key: "twirl".to_string(),
            keywords: vec!["twirl".to_string(), "spin around".to_string()],
            prompt: "she spins slowly".to_string(),
            lora_url: None,
        }]
    }

    #[test]
    fn priority_is_image_first() {
        // mentions both a picture and a voice note
        assert_eq!(
            detect_offer("send a pic and a voice note", &actions()),
            Some((OfferKind::Image, None))
        );
        assert_eq!(
            detect_offer("whisper something to me", &actions()),
            Some((OfferKind::VoiceNote, None))
        );
        assert_eq!(
            detect_offer("can I call you tonight?", &actions()),
            Some((OfferKind::VoiceCall, None))
        );
        assert_eq!(
            detect_offer("make a video for me", &actions()),
            Some((OfferKind::Video, None))
        );
    }

    #[test]
    fn video_actions_carry_their_key() {
        assert_eq!(
            detect_offer("Twirl for me!", &actions()),
            Some((OfferKind::Video, Some("twirl".to_string())))
        );
    }

    #[test]
    fn plain_chat_is_not_a_request() {
        assert_eq!(detect_offer("how was your day?", &actions()), None);
        assert_eq!(detect_offer("that topic is boring", &actions()), None);
    }

    #[test]
    fn reveal_keywords() {
        assert!(mentions_reveal("Would you undress for me"));
        assert!(!mentions_reveal("nice weather"));
    }

    #[test]
    fn name_extraction() {
        assert_eq!(extract_display_name("Hi, my name is jacob"), Some("Jacob".into()));
        assert_eq!(extract_display_name("just call me Max."), Some("Max".into()));
        assert_eq!(extract_display_name("Sam here, hello"), Some("Sam".into()));
        assert_eq!(extract_display_name("Oliver, hi!"), Some("Oliver".into()));
        assert_eq!(extract_display_name("I'm so tired today"), None);
        assert_eq!(extract_display_name("what a day"), None);
    }

    #[test]
    fn phone_numbers() {
        assert_eq!(
            parse_phone_number("+1 (555) 123-4567"),
            Some("+15551234567".to_string())
        );
        assert_eq!(parse_phone_number("5551234567"), None);
        assert_eq!(parse_phone_number("+0123"), None);
        assert_eq!(parse_phone_number("call me maybe"), None);
    }
}
