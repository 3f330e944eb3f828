//! Persona catalog
//!
//! Personas, their scenarios and the video actions are content, loaded from
//! a JSON file at startup. A small built-in catalog keeps development and
//! tests self-contained.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read persona catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid persona catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("persona catalog is empty")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub title: String,
    /// Narration shown to the user before the first message
    pub intro_text: String,
    pub first_message: String,
    /// Setting description injected into the reply and image prompts
    pub scenario_prompt: String,
    /// Attire the persona starts the scenario in
    pub attire: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub full_name: String,
    /// Character description used as the base of the reply prompt
    pub system_prompt: String,
    /// Image model identifier (`owner/model:version`)
    pub image_model: String,
    /// Trigger word prefixed to image prompts
    #[serde(default)]
    pub trigger_word: String,
    pub voice_id: String,
    pub call_agent_id: String,
    pub scenarios: Vec<Scenario>,
}

impl Persona {
    pub fn scenario(&self, scenario_id: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.id == scenario_id)
    }
}

/// A requestable video motion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAction {
    pub key: String,
    pub keywords: Vec<String>,
    /// Motion description passed to the video backend
    pub prompt: String,
    #[serde(default)]
    pub lora_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub video_actions: Vec<VideoAction>,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let catalog: Catalog = serde_json::from_str(raw)?;
        if catalog.personas.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(catalog)
    }

    pub fn persona(&self, persona_id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == persona_id)
    }

    pub fn lookup(&self, persona_id: &str, scenario_id: &str) -> Option<(&Persona, &Scenario)> {
        let persona = self.persona(persona_id)?;
        Some((persona, persona.scenario(scenario_id)?))
    }

    pub fn video_action(&self, key: &str) -> Option<&VideoAction> {
        self.video_actions.iter().find(|a| a.key == key)
    }

    /// Development catalog with neutral content
    pub fn builtin() -> Self {
        Self {
            personas: vec![
                Persona {
                    id: "isabella".to_string(),
                    full_name: "Isabella".to_string(),
                    system_prompt: "You are Isabella, a warm Italian chef who loves to tease. \
                        You talk to {user_name} in short, playful sentences and describe your \
                        actions between asterisks in the first person."
                        .to_string(),
                    image_model: "persona-relay/isabella:latest".to_string(),
                    trigger_word: "isbl".to_string(),
                    voice_id: "voice-isabella".to_string(),
                    call_agent_id: "agent-isabella".to_string(),
                    scenarios: vec![Scenario {
                        id: "cooking_class".to_string(),
                        title: "A Private Cooking Class".to_string(),
                        intro_text: "You arrive at Isabella's villa for a private cooking class."
                            .to_string(),
                        first_message: "Welcome to my kitchen. What is the name of the man I'm \
                            cooking for tonight?"
                            .to_string(),
                        scenario_prompt: "a warm Italian-style kitchen with a large wooden table"
                            .to_string(),
                        attire: "a simple white dress under a stained apron".to_string(),
                    }],
                },
                Persona {
                    id: "luna".to_string(),
                    full_name: "Luna".to_string(),
                    system_prompt: "You are Luna, a mysterious tarot reader. You speak to \
                        {user_name} softly and describe your actions between asterisks in the \
                        first person."
                        .to_string(),
                    image_model: "persona-relay/luna:latest".to_string(),
                    trigger_word: "luna".to_string(),
                    voice_id: "voice-luna".to_string(),
                    call_agent_id: "agent-luna".to_string(),
                    scenarios: vec![Scenario {
                        id: "tarot_reading".to_string(),
                        title: "A Private Tarot Reading".to_string(),
                        intro_text: "You enter a dimly lit tent filled with the scent of incense."
                            .to_string(),
                        first_message: "The cards told me you were coming. What name shall the \
                            spirits know you by?"
                            .to_string(),
                        scenario_prompt: "a dimly lit tent with a small table and tarot cards"
                            .to_string(),
                        attire: "layers of dark flowing shawls and silver jewelry".to_string(),
                    }],
                },
            ],
            video_actions: vec![
                VideoAction {
                    key: "twirl".to_string(),
                    keywords: vec!["twirl".to_string(), "spin around".to_string()],
                    prompt: "she twirls slowly in place".to_string(),
                    lora_url: None,
                },
                VideoAction {
                    key: "blow_kiss".to_string(),
                    keywords: vec!["blow me a kiss".to_string(), "blow a kiss".to_string()],
                    prompt: "she blows a kiss toward the camera".to_string(),
                    lora_url: None,
                },
            ],
        }
    }
}
