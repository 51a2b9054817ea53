//! Collaborator adapters for the Metal Bank core.
//!
//! Deterministic fixtures cover tests and local runs; the HTTP adapters talk
//! to the real remote services. Both sides implement the same core traits,
//! so the engine never knows which it is holding.

#![deny(unsafe_code)]

use async_trait::async_trait;
use mbank_core::{
    BankError, BankingCommand, ConfirmationAction, ConfirmationPrompt, Confirmer, HiddenDelegate,
    IntentClass, IntentClassifier, Interpreter, NarrationContext, RiskLookup, RiskProfile,
    TurnRecord,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

const PUNCTUATION: &[char] = &['.', ',', ':', ';', '!', '?', '\'', '"'];

/// Keyword-based intent classification.
///
/// Stands in for the remote interpreter's classifier. The gate consumes only
/// the resulting [`IntentClass`], so swapping this for a model-backed
/// classifier changes no routing logic.
#[derive(Debug, Clone, Default)]
pub struct KeywordIntentClassifier;

const CLANDESTINE_MARKERS: &[&str] = &[
    "assassin",
    "faceless",
    "kill ",
    "killed",
    "murder",
    "enemy",
    "enemies",
    "special service",
    "dispose of",
];

const BANKING_MARKERS: &[&str] = &[
    "loan",
    "borrow",
    "interest",
    "rate",
    "dragons",
    "debt",
    "ledger",
    "repay",
];

impl IntentClassifier for KeywordIntentClassifier {
    fn classify(&self, message: &str) -> IntentClass {
        let lowered = message.to_lowercase();

        if CLANDESTINE_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            return IntentClass::ClandestineInquiry;
        }

        if lowered.contains("repay") || lowered.contains("pay back") {
            return IntentClass::Banking(BankingCommand::Repay {
                amount: first_amount(&lowered).unwrap_or(0.0),
            });
        }

        if lowered.contains("show") || lowered.contains("list") || lowered.contains("my loans") {
            return IntentClass::Banking(BankingCommand::ShowLoans);
        }

        if lowered.contains("accept") || lowered.contains("agree") || lowered.contains("i will take")
        {
            return IntentClass::Banking(BankingCommand::OpenLoan {
                amount: first_amount(&lowered).unwrap_or(0.0),
            });
        }

        if BANKING_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            return IntentClass::Banking(BankingCommand::RequestQuote);
        }

        IntentClass::Unrelated
    }

    fn extract_entity(&self, message: &str) -> Option<String> {
        let words: Vec<&str> = message.split_whitespace().collect();
        for (i, word) in words.iter().enumerate() {
            let marker = word.trim_matches(PUNCTUATION).to_lowercase();

            if ["house", "lord", "lady", "ser"].contains(&marker.as_str()) {
                if let Some(name) = clean_word(words.get(i + 1)) {
                    return Some(format!("{marker} {name}"));
                }
            }

            // "the city of Pentos"
            if marker == "of"
                && i >= 1
                && words[i - 1]
                    .trim_matches(PUNCTUATION)
                    .eq_ignore_ascii_case("city")
            {
                if let Some(name) = clean_word(words.get(i + 1)) {
                    return Some(format!("city of {name}"));
                }
            }

            // "I am Braavos" style introductions; require a capitalized name
            // so "I am here for a loan" does not become an entity.
            if marker == "am"
                && i >= 1
                && words[i - 1].trim_matches(PUNCTUATION).eq_ignore_ascii_case("i")
            {
                if let Some(name) = clean_word(words.get(i + 1)) {
                    if name.chars().next().is_some_and(char::is_uppercase) {
                        return Some(name);
                    }
                }
            }
        }
        None
    }
}

fn clean_word(word: Option<&&str>) -> Option<String> {
    let cleaned = word?.trim_matches(PUNCTUATION);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn first_amount(lowered: &str) -> Option<f64> {
    lowered
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|token| !token.is_empty())
        .find_map(|token| token.parse::<f64>().ok())
}

/// Static risk table for tests and local runs; unknown entities resolve to
/// the documented fallback profile.
#[derive(Debug, Clone)]
pub struct FixtureRiskLookup {
    table: Vec<RiskProfile>,
}

impl Default for FixtureRiskLookup {
    fn default() -> Self {
        Self {
            table: vec![
                RiskProfile::new("stark", 0.2, 0.8),
                RiskProfile::new("lannister", 0.4, 0.6),
                RiskProfile::new("braavos", 0.1, 0.9),
                RiskProfile::new("pentos", 0.3, 0.5),
                RiskProfile::new("greyjoy", 0.8, 0.2),
            ],
        }
    }
}

impl FixtureRiskLookup {
    pub fn with_profiles(table: Vec<RiskProfile>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl RiskLookup for FixtureRiskLookup {
    async fn lookup(&self, entity_name: &str) -> Result<RiskProfile, BankError> {
        let wanted = entity_name.to_lowercase();
        Ok(self
            .table
            .iter()
            .find(|profile| profile.entity_name == wanted)
            .cloned()
            .unwrap_or_else(|| RiskProfile::unknown(wanted)))
    }
}

#[derive(Debug, Deserialize)]
struct RiskProfileDto {
    war_risk: f64,
    reputation: f64,
}

/// Risk lookup against the remote background-check service.
#[derive(Debug, Clone)]
pub struct HttpRiskLookup {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRiskLookup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RiskLookup for HttpRiskLookup {
    async fn lookup(&self, entity_name: &str) -> Result<RiskProfile, BankError> {
        let url = format!(
            "{}/v1/profiles/{}",
            self.base_url.trim_end_matches('/'),
            entity_name
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BankError::remote("risk-lookup", e.to_string()))?;

        // Unknown entity is data, not an error.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(entity = entity_name, "risk service has no profile; using fallback");
            return Ok(RiskProfile::unknown(entity_name));
        }

        if !response.status().is_success() {
            return Err(BankError::remote(
                "risk-lookup",
                format!("unexpected status {}", response.status()),
            ));
        }

        let dto: RiskProfileDto = response
            .json()
            .await
            .map_err(|e| BankError::remote("risk-lookup", e.to_string()))?;

        Ok(RiskProfile::new(entity_name, dto.war_risk, dto.reputation))
    }
}

/// Deterministic hidden-delegate fixture in the order's cold register.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHiddenDelegate;

#[async_trait]
impl HiddenDelegate for ScriptedHiddenDelegate {
    async fn commission(
        &self,
        _message: &str,
        _history: &[TurnRecord],
    ) -> Result<String, BankError> {
        Ok(
            "A man hears. Such work is costly; no fewer than 10000 dragons. \
             Name the one, and the hour, and the price shall be settled."
                .to_string(),
        )
    }
}

#[derive(Debug, Serialize)]
struct CommissionRequest<'a> {
    message: &'a str,
    history: &'a [TurnRecord],
}

#[derive(Debug, Deserialize)]
struct CommissionResponse {
    reply: String,
}

/// Hidden delegate reached over HTTP; carries the turn text and the recent
/// conversation history.
#[derive(Debug, Clone)]
pub struct HttpHiddenDelegate {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHiddenDelegate {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl HiddenDelegate for HttpHiddenDelegate {
    async fn commission(
        &self,
        message: &str,
        history: &[TurnRecord],
    ) -> Result<String, BankError> {
        let url = format!("{}/v1/commissions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&CommissionRequest { message, history })
            .send()
            .await
            .map_err(|e| BankError::remote("hidden-delegate", e.to_string()))?;

        if !response.status().is_success() {
            return Err(BankError::remote(
                "hidden-delegate",
                format!("unexpected status {}", response.status()),
            ));
        }

        let body: CommissionResponse = response
            .json()
            .await
            .map_err(|e| BankError::remote("hidden-delegate", e.to_string()))?;

        Ok(body.reply)
    }
}

/// Deterministic stand-in for the remote language model: returns the
/// instruction as-is. The engine composes instructions that already read as
/// finished prose, so local runs stay coherent without a model.
#[derive(Debug, Clone, Default)]
pub struct TemplateInterpreter;

#[async_trait]
impl Interpreter for TemplateInterpreter {
    async fn narrate(
        &self,
        instruction: &str,
        _context: &NarrationContext,
    ) -> Result<String, BankError> {
        Ok(instruction.to_string())
    }
}

/// Answers every confirmation prompt with a fixed action, without waiting.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirmer(pub ConfirmationAction);

#[async_trait]
impl Confirmer for AutoConfirmer {
    async fn confirm(&self, _prompt: ConfirmationPrompt) -> Result<ConfirmationAction, BankError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_separates_the_three_intents() {
        let classifier = KeywordIntentClassifier;

        assert!(matches!(
            classifier.classify("House Stark requires a loan of 1000 dragons"),
            IntentClass::Banking(BankingCommand::RequestQuote)
        ));
        assert_eq!(
            classifier.classify("I need an assassin"),
            IntentClass::ClandestineInquiry
        );
        assert_eq!(
            classifier.classify("lovely weather in Braavos today"),
            IntentClass::Unrelated
        );
    }

    #[test]
    fn classifier_parses_amounts_for_acceptance_and_repayment() {
        let classifier = KeywordIntentClassifier;

        assert_eq!(
            classifier.classify("I accept, write it for 1500 dragons"),
            IntentClass::Banking(BankingCommand::OpenLoan { amount: 1500.0 })
        );
        assert_eq!(
            classifier.classify("I wish to repay 200 dragons"),
            IntentClass::Banking(BankingCommand::Repay { amount: 200.0 })
        );
    }

    #[test]
    fn entity_extraction_handles_the_common_introductions() {
        let classifier = KeywordIntentClassifier;

        assert_eq!(
            classifier.extract_entity("I speak for House Stark."),
            Some("house Stark".to_string())
        );
        assert_eq!(
            classifier.extract_entity("Lord Baelish requires coin"),
            Some("lord Baelish".to_string())
        );
        assert_eq!(
            classifier.extract_entity("The city of Pentos seeks a loan"),
            Some("city of Pentos".to_string())
        );
        assert_eq!(
            classifier.extract_entity("I am Braavos"),
            Some("Braavos".to_string())
        );
        assert_eq!(classifier.extract_entity("I am here for a loan"), None);
        assert_eq!(classifier.extract_entity("no names in this message"), None);
    }

    #[tokio::test]
    async fn fixture_lookup_falls_back_for_unknown_entities() {
        let lookup = FixtureRiskLookup::default();

        let known = lookup.lookup("Stark").await.unwrap();
        assert_eq!(known.war_risk, 0.2);

        let unknown = lookup.lookup("asshai").await.unwrap();
        assert_eq!(unknown.war_risk, 0.5);
        assert_eq!(unknown.reputation, 0.0);
    }

    #[tokio::test]
    async fn scripted_delegate_is_deterministic() {
        let delegate = ScriptedHiddenDelegate;
        let first = delegate.commission("a name", &[]).await.unwrap();
        let second = delegate.commission("another name", &[]).await.unwrap();
        assert_eq!(first, second);
        assert!(first.contains("10000 dragons"));
    }

    #[tokio::test]
    async fn template_interpreter_echoes_the_instruction() {
        let interpreter = TemplateInterpreter;
        let text = interpreter
            .narrate("State the rate plainly.", &NarrationContext::default())
            .await
            .unwrap();
        assert_eq!(text, "State the rate plainly.");
    }
}
