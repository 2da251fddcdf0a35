//! **Transfer triggers** — phrase/intent matches that end AI-driven
//! conversation and hand the call to a human.

use tracing::info;

/// Configured trigger set, matched against caller utterances, assistant
/// replies, and language-model intent tags.
#[derive(Debug, Clone, Default)]
pub struct TransferTriggers {
    phrases: Vec<String>,
    intents: Vec<String>,
}

impl TransferTriggers {
    pub fn new(phrases: Vec<String>, intents: Vec<String>) -> Self {
        Self {
            phrases: phrases.into_iter().map(|p| p.to_lowercase()).collect(),
            intents: intents.into_iter().map(|i| i.to_lowercase()).collect(),
        }
    }

    /// Case-insensitive substring match; returns the phrase that fired.
    pub fn match_text(&self, text: &str) -> Option<&str> {
        let lowered = text.to_lowercase();
        let hit = self
            .phrases
            .iter()
            .find(|p| lowered.contains(p.as_str()))
            .map(|p| p.as_str());
        if let Some(phrase) = hit {
            info!(phrase, "transfer trigger phrase matched");
        }
        hit
    }

    /// Matches language-model intent tags against the configured set.
    pub fn match_intents(&self, tags: &[String]) -> Option<&str> {
        let hit = self
            .intents
            .iter()
            .find(|i| tags.iter().any(|t| t.eq_ignore_ascii_case(i)))
            .map(|i| i.as_str());
        if let Some(intent) = hit {
            info!(intent, "transfer trigger intent matched");
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triggers() -> TransferTriggers {
        TransferTriggers::new(
            vec!["speak to a person".to_string(), "Transfer Me".to_string()],
            vec!["transfer".to_string()],
        )
    }

    #[test]
    fn phrase_match_is_case_insensitive() {
        let t = triggers();
        assert!(t.match_text("Can I SPEAK TO A PERSON please?").is_some());
        assert!(t.match_text("please transfer me now").is_some());
        assert!(t.match_text("tell me about pricing").is_none());
    }

    #[test]
    fn intent_match_uses_tags() {
        let t = triggers();
        assert!(t.match_intents(&["Transfer".to_string()]).is_some());
        assert!(t.match_intents(&["smalltalk".to_string()]).is_none());
        assert!(t.match_intents(&[]).is_none());
    }
}
