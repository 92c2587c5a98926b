//! Motivational quotes shown alongside an intervention.

use rand::Rng;

const BUNDLED_QUOTES: &str = include_str!("../assets/motivational_quotes.json");

/// Returned when no quote is loaded at all.
pub const LAST_RESORT_QUOTE: &str = "Take a moment to reflect on your goals.";

const FALLBACK_QUOTES: &[&str] = &[
    "Focus on what matters most to you right now.",
    "Every moment of distraction is a moment away from your dreams.",
    "Your future self will thank you for this decision.",
    "Progress happens when you choose intention over impulse.",
    "What would you accomplish if you weren't scrolling?",
    "Your attention is your most valuable resource.",
    "Small choices lead to big changes.",
    "Be present in your own life.",
    "Your goals are waiting for your focus.",
    "Choose growth over entertainment.",
];

#[derive(Debug, Clone)]
pub struct QuoteBook {
    quotes: Vec<String>,
}

impl Default for QuoteBook {
    fn default() -> Self {
        Self::bundled()
    }
}

impl QuoteBook {
    /// The quotes shipped with the crate.
    pub fn bundled() -> Self {
        Self::parse(BUNDLED_QUOTES)
    }

    /// Parse a JSON array of strings. Unreadable input or an empty list
    /// yields the built-in quotes.
    pub fn parse(raw: &str) -> Self {
        let quotes = match serde_json::from_str::<Vec<String>>(raw) {
            Ok(list) => list
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect::<Vec<_>>(),
            Err(e) => {
                log::warn!("quotes: bundled quotes unreadable, using built-in list: {e}");
                Vec::new()
            }
        };
        if quotes.is_empty() {
            return Self::from_quotes(FALLBACK_QUOTES.iter().map(|q| q.to_string()).collect());
        }
        Self::from_quotes(quotes)
    }

    pub fn from_quotes(quotes: Vec<String>) -> Self {
        Self { quotes }
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn random_quote(&self) -> &str {
        if self.quotes.is_empty() {
            return LAST_RESORT_QUOTE;
        }
        let index = rand::rng().random_range(0..self.quotes.len());
        &self.quotes[index]
    }
}
