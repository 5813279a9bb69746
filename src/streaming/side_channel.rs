//! Side channels: weather and quote lookups
//!
//! These share the session connection but live outside the turn model. The
//! backend provides no audio for them, so results carry a text to speak via
//! local speech synthesis.

use regex::Regex;
use std::sync::LazyLock;

/// Weather query patterns, tried in order against the original text
static WEATHER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)(?:how's|how\s+is|hows)\s+the\s+weather\s+(?:in|for|at|of)\s+(.+)",
        r"(?i)(?:what's|what\s+is|whats)\s+the\s+weather\s+(?:in|for|at|of)\s+(.+)",
        r"(?i)weather\s+(?:like\s+)?(?:in|for|at|of)\s+(.+)",
        r"(?i)temperature\s+(?:in|for|at|of)\s+(.+)",
        r"(?i)\btemp\s+(?:in|for|at|of)\s+(.+)",
        r"(?i)forecast\s+(?:in|for|at|of)\s+(.+)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static TRAILING_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[?.,!]+$").unwrap());

const PREPOSITIONS: [&str; 4] = ["in", "for", "at", "of"];

fn clean_location(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let cleaned = TRAILING_PUNCTUATION.replace(trimmed, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Extract a location from a spoken weather query.
///
/// Returns the location with its original casing, trailing punctuation
/// stripped. Falls back to whatever follows the first preposition.
pub fn extract_location(text: &str) -> Option<String> {
    let text = text.trim();

    for pattern in WEATHER_PATTERNS.iter() {
        if let Some(found) = pattern
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| clean_location(m.as_str()))
        {
            return Some(found);
        }
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let is_preposition = |word: &str| PREPOSITIONS.contains(&word.to_lowercase().as_str());
    for (i, word) in words.iter().enumerate() {
        if is_preposition(*word) && i + 1 < words.len() {
            if let Some(found) = clean_location(&words[i + 1..].join(" ")) {
                return Some(found);
            }
        }
    }

    // A bare place name ("Paris") is accepted while listening for a location
    if !words.is_empty() && words.len() <= 3 && !words.iter().any(|w| is_preposition(*w)) {
        return clean_location(text);
    }
    None
}

/// Local display updates for side channels
#[derive(Debug, Clone, PartialEq)]
pub enum SideChannelUpdate {
    WeatherPending { message: String },
    WeatherReport {
        location: String,
        temperature: Option<f64>,
        description: String,
        report: String,
    },
    WeatherFailed { message: String },
    WeatherLocationNeeded { message: String },
    QuotePending { message: String },
    Quote { quote: String, author: String },
    QuoteFailed { message: String },
}

impl SideChannelUpdate {
    /// Text for the local speech-synthesis fallback, if this update has one
    pub fn speech_text(&self) -> Option<String> {
        match self {
            SideChannelUpdate::WeatherReport { report, .. } if !report.is_empty() => {
                Some(report.clone())
            }
            SideChannelUpdate::Quote { quote, author } if !quote.is_empty() => {
                if author.is_empty() {
                    Some(quote.clone())
                } else {
                    Some(format!("{} by {}", quote, author))
                }
            }
            _ => None,
        }
    }
}

/// Outcome of offering a committed utterance to weather listening mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeatherIntent {
    /// Mode inactive; the utterance belongs to the conversation
    NotListening,
    /// Location found; request it and leave weather mode
    Request(String),
    /// Still listening; the utterance had no usable location
    NeedLocation,
}

/// Tracks whether the next utterance is a weather location
#[derive(Debug, Clone, Default)]
pub struct WeatherListener {
    active: bool,
}

impl WeatherListener {
    pub fn activate(&mut self) {
        log::info!("SideChannel: listening for a weather location");
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn offer(&mut self, utterance: &str) -> WeatherIntent {
        if !self.active {
            return WeatherIntent::NotListening;
        }
        match extract_location(utterance) {
            Some(location) => {
                self.active = false;
                log::info!("SideChannel: weather location detected: {}", location);
                WeatherIntent::Request(location)
            }
            None => WeatherIntent::NeedLocation,
        }
    }
}
