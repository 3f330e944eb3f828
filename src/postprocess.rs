//! Normalization of generated replies
//!
//! Replies from the text backend are cut at odd places and sometimes narrate
//! the persona in the third person. These passes fix both before a reply is
//! stored or sent.

use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Used when the backend returned nothing at all
pub const EMPTY_REPLY_FALLBACK: &str = "*I smile at you.* I'm happy you're here.";

static ACTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*]+)\*").expect("valid action regex"));
static PERSONA_SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:the bot|she|the woman|the girl)\b").expect("valid subject regex")
});
static HER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bher\b(?:(\s+)([a-z][a-z'-]*))?").expect("valid her regex")
});
static USER_SUBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:the user|the man|him)\b").expect("valid user regex"));
static USER_POSSESSIVE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bhis\b").expect("valid possessive regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static BRACKET_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("valid bracket regex"));

/// Nouns after which "her" is possessive ("her hair" -> "my hair")
const POSSESSED: &[&str] = &[
    "own", "way", "turn", "face", "eyes", "lips", "mouth", "body", "hand", "hands", "hair", "skin",
    "breasts", "legs", "arms", "voice", "smile", "look", "expression", "gaze", "touch", "kiss",
    "embrace", "breath", "laugh", "cheek", "cheeks", "hips", "waist", "back", "shoulder",
    "shoulders", "thigh", "thighs", "foot", "feet", "fingers", "neck", "chest", "stomach",
    "panties", "underwear", "bra", "dress", "shirt", "skirt", "jeans", "shorts", "clothes",
    "outfit", "lingerie", "robe", "towel", "blanket", "sheet", "pillow", "bed", "sofa", "couch",
    "chair", "seat", "apron", "gown", "sari", "lehenga", "sweater", "hoodie", "jacket", "coat",
    "scarf", "hat", "stockings", "shoes", "heels", "ring", "necklace", "earrings", "glasses",
    "bag", "purse", "phone", "book", "glass", "cup", "drink", "wine", "tea", "coffee", "head",
    "heart", "knees", "lap", "ear", "ears", "nose", "tongue", "room", "desk", "cards",
];

/// Close a dangling action wrapper or trim to the last full sentence.
pub fn ensure_complete_sentence(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return EMPTY_REPLY_FALLBACK.to_string();
    }
    if text.starts_with('*') && text.matches('*').count() == 1 && !text.ends_with('*') {
        return format!("{text}*");
    }
    if text.ends_with(['.', '!', '?']) {
        return text.to_string();
    }
    match text.rfind(['.', '!', '?']) {
        Some(idx) if idx > 0 => text.get(..=idx).unwrap_or(text).trim().to_string(),
        _ => text.to_string(),
    }
}

/// Rewrite every `*...*` action so the persona speaks in the first person
/// and addresses the user in the second person. my/mine/myself and
/// your/yours/yourself are never rewritten.
pub fn fix_action_pronouns(text: &str, user_name: Option<&str>) -> String {
    let name_re = user_name
        .filter(|n| !n.eq_ignore_ascii_case("you"))
        .and_then(|n| Regex::new(&format!(r"(?i)\b{}\b", regex::escape(n))).ok());

    ACTION_RE
        .replace_all(text, |caps: &Captures| {
            format!("*{}*", fix_action(&caps[1], name_re.as_ref()))
        })
        .into_owned()
}

fn fix_action(action: &str, name_re: Option<&Regex>) -> String {
    let action = PERSONA_SUBJECT_RE.replace_all(action, "I");
    let action = HER_RE.replace_all(&action, |caps: &Captures| match (caps.get(1), caps.get(2)) {
        (Some(ws), Some(word)) => {
            let pronoun = if POSSESSED.contains(&word.as_str().to_lowercase().as_str()) {
                "my"
            } else {
                "me"
            };
            format!("{pronoun}{}{}", ws.as_str(), word.as_str())
        }
        _ => "me".to_string(),
    });
    let action = USER_SUBJECT_RE.replace_all(&action, "you");
    let mut action = USER_POSSESSIVE_RE.replace_all(&action, "your").into_owned();
    if let Some(re) = name_re {
        action = re.replace_all(&action, "you").into_owned();
    }
    WHITESPACE_RE.replace_all(&action, " ").trim().to_string()
}

/// Strip action markup and bracket tags before speech synthesis
pub fn clean_voice_text(text: &str) -> String {
    let text = text.replace('*', "");
    let text = BRACKET_TAG_RE.replace_all(&text, "");
    WHITESPACE_RE.replace_all(&text, " ").trim().to_string()
}

/// Full reply pipeline: sentence completion, then pronoun repair
pub fn normalize_reply(raw: &str, user_name: Option<&str>) -> String {
    fix_action_pronouns(&ensure_complete_sentence(raw), user_name)
}
