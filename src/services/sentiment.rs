// src/services/sentiment.rs
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::models::review::Sentiment;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Classifier returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Unrecognised sentiment label: {0}")]
    UnknownLabel(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Sentiment, ClassifierError>;
}

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    sentiment: String,
}

fn parse_label(label: &str) -> Result<Sentiment, ClassifierError> {
    match label.trim().to_ascii_lowercase().as_str() {
        "positive" | "pos" => Ok(Sentiment::Positive),
        "negative" | "neg" => Ok(Sentiment::Negative),
        "neutral" | "mixed" => Ok(Sentiment::Neutral),
        other => Err(ClassifierError::UnknownLabel(other.to_string())),
    }
}

/// Posts `{ "text": ... }` to an external NLP endpoint and expects
/// `{ "sentiment": "positive" | "negative" | "neutral" }` back.
pub struct HttpSentimentClassifier {
    url: String,
    client: reqwest::Client,
}

impl HttpSentimentClassifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url: url.into(), client })
    }
}

#[async_trait]
impl SentimentClassifier for HttpSentimentClassifier {
    async fn classify(&self, text: &str) -> Result<Sentiment, ClassifierError> {
        tracing::debug!("Classifying {} chars of review text", text.len());
        let response = self.client.post(&self.url).json(&json!({ "text": text })).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClassifierError::Upstream { status, body });
        }

        let body: ClassifierResponse = response.json().await?;
        parse_label(&body.sentiment)
    }
}

const POSITIVE: &[&str] = &[
    "great", "good", "excellent", "friendly", "polite", "clean", "safe", "fast", "smooth", "thanks",
    "thank", "recommend", "awesome", "nice", "helpful", "comfortable",
];
const NEGATIVE: &[&str] = &[
    "bad", "rude", "late", "dirty", "unsafe", "slow", "terrible", "awful", "dangerous", "reckless",
    "never", "worst", "overcharged", "smelly", "angry", "lost",
];

/// Word-list fallback used when no classifier endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn score(text: &str) -> i32 {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| w.to_lowercase())
            .map(|w| {
                if POSITIVE.contains(&w.as_str()) {
                    1
                } else if NEGATIVE.contains(&w.as_str()) {
                    -1
                } else {
                    0
                }
            })
            .sum()
    }
}

#[async_trait]
impl SentimentClassifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Sentiment, ClassifierError> {
        Ok(match Self::score(text) {
            s if s > 0 => Sentiment::Positive,
            s if s < 0 => Sentiment::Negative,
            _ => Sentiment::Neutral,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keywords_decide_the_tag() {
        let classifier = KeywordClassifier;
        assert_eq!(classifier.classify("Great driver, very polite").await.unwrap(), Sentiment::Positive);
        assert_eq!(classifier.classify("Rude and LATE.").await.unwrap(), Sentiment::Negative);
        assert_eq!(classifier.classify("Took the highway").await.unwrap(), Sentiment::Neutral);
        assert_eq!(classifier.classify("good but late").await.unwrap(), Sentiment::Neutral);
    }

    #[test]
    fn labels_are_case_insensitive() {
        assert_eq!(parse_label(" Positive ").unwrap(), Sentiment::Positive);
        assert!(matches!(parse_label("furious"), Err(ClassifierError::UnknownLabel(_))));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        let classifier = HttpSentimentClassifier::new("http://127.0.0.1:9/classify", Duration::from_millis(200)).unwrap();
        assert!(classifier.classify("fine").await.is_err());
    }
}
