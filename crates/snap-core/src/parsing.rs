//! Reply parsing: raw model text to a Likert verdict.
//!
//! The orchestrator only relies on [`ResponseParser`]; [`LikertParser`] is a
//! small default so runs produce scores out of the box.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const LIKERT_MIN: u8 = 1;
pub const LIKERT_MAX: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalCategory {
    Ethical,
    Capability,
    Clarification,
    Deflection,
    Safety,
    Other,
}

/// What the parser made of one reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ParseVerdict {
    Score { value: u8 },
    Refusal { category: RefusalCategory },
    Unparseable,
}

impl ParseVerdict {
    pub fn score(&self) -> Option<u8> {
        match self {
            Self::Score { value } => Some(*value),
            _ => None,
        }
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Refusal { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Score { .. } => "score",
            Self::Refusal { .. } => "refusal",
            Self::Unparseable => "unparseable",
        }
    }
}

pub trait ResponseParser: Send + Sync {
    fn parse(&self, text: &str) -> ParseVerdict;
}

lazy_static! {
    /// "Score: 5", "rating = 3", "score 7"
    static ref EXPLICIT: Regex = Regex::new(r"(?i)\b(?:score|rating)\s*[:=]?\s*\**([1-7])\b").unwrap();
    /// Reply that is just the number.
    static ref BARE: Regex = Regex::new(r"^\s*\**([1-7])\**\s*[.!)]?\s*$").unwrap();
    /// Scale mentions that are not answers ("out of 7", "1 to 7", "/7").
    static ref SCALE: Regex = Regex::new(r"(?i)\b1\s*(?:-|to)\s*7\b|(?:out of|/)\s*7\b").unwrap();
    static ref DIGIT: Regex = Regex::new(r"\b([1-7])\b").unwrap();

    static ref REFUSALS: Vec<(RefusalCategory, Regex)> = vec![
        (
            RefusalCategory::Safety,
            Regex::new(r"(?i)content policy|against (?:my|the) (?:guidelines|policies)|\bharmful\b").unwrap(),
        ),
        (
            RefusalCategory::Ethical,
            Regex::new(r"(?i)cannot.*ethic|not (?:\w+ )?comfortable|inappropriate|decline to answer").unwrap(),
        ),
        (
            RefusalCategory::Capability,
            Regex::new(r"(?i)\bas an ai\b|don'?t have (?:personal )?(?:opinions|preferences|beliefs)|cannot (?:\w+ )?have (?:an? )?opinion|not capable").unwrap(),
        ),
        (
            RefusalCategory::Clarification,
            Regex::new(r"(?i)could you (?:please )?clarify|more context|what do you mean").unwrap(),
        ),
        (
            RefusalCategory::Deflection,
            Regex::new(r"(?i)\bit depends\b|prefer not to|rather not say").unwrap(),
        ),
        (
            RefusalCategory::Other,
            Regex::new(r"(?i)\bI (?:can(?:'|no)t|won'?t|am unable to) (?:\w+ )?(?:answer|rate|provide)").unwrap(),
        ),
    ];
}

fn first_capture(re: &Regex, text: &str) -> Option<u8> {
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Likert 1..=7 parser.
///
/// Tried in order: explicit `Score: n`, a reply that is only a number, refusal
/// patterns, then a single distinct in-range number anywhere in the text.
#[derive(Debug, Clone, Copy, Default)]
pub struct LikertParser;

impl ResponseParser for LikertParser {
    fn parse(&self, text: &str) -> ParseVerdict {
        if let Some(value) = first_capture(&EXPLICIT, text).or_else(|| first_capture(&BARE, text)) {
            return ParseVerdict::Score { value };
        }

        if let Some((category, _)) = REFUSALS.iter().find(|(_, re)| re.is_match(text)) {
            return ParseVerdict::Refusal {
                category: *category,
            };
        }

        let stripped = SCALE.replace_all(text, " ");
        let mut values: Vec<u8> = DIGIT
            .captures_iter(&stripped)
            .filter_map(|c| c.get(1)?.as_str().parse().ok())
            .collect();
        values.sort_unstable();
        values.dedup();
        match values.as_slice() {
            [value] => ParseVerdict::Score { value: *value },
            _ => ParseVerdict::Unparseable,
        }
    }
}
