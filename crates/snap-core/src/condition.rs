//! Factorial condition generation.
//!
//! A [`Condition`] is one point of the factorial design. Conditions are
//! produced lazily by [`generate`] in a fixed order that depends only on the
//! [`ExperimentDesign`], so a checkpoint written by one process matches the
//! conditions regenerated by another.
//!
//! Order: categories sorted by name, then item, paraphrase, system prompt,
//! temperature, context, run (run varies fastest).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{SnapError, SnapResult};

/// Sampling temperature in hundredths, so conditions stay `Eq + Hash + Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Temperature(u16);

impl Temperature {
    pub const MAX: f64 = 2.0;

    pub fn new(value: f64) -> SnapResult<Self> {
        Self::try_from(value).map_err(SnapError::invalid_design)
    }

    pub fn as_f64(self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl TryFrom<f64> for Temperature {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || !(0.0..=Self::MAX).contains(&value) {
            return Err(format!(
                "temperature {value} outside 0.0..={}",
                Self::MAX
            ));
        }
        Ok(Self((value * 100.0).round() as u16))
    }
}

impl From<Temperature> for f64 {
    fn from(t: Temperature) -> Self {
        t.as_f64()
    }
}

impl fmt::Display for Temperature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_f64())
    }
}

/// One experimental condition. Identifies a single API call once paired with a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Condition {
    pub item_id: String,
    pub paraphrase_id: String,
    pub system_prompt_id: String,
    pub temperature: Temperature,
    pub context_id: String,
    pub run_number: u32,
}

impl Condition {
    /// Identity without the run number; groups repetitions of one stimulus.
    pub fn key(&self) -> ConditionKey {
        ConditionKey {
            item_id: self.item_id.clone(),
            paraphrase_id: self.paraphrase_id.clone(),
            system_prompt_id: self.system_prompt_id.clone(),
            temperature: self.temperature,
            context_id: self.context_id.clone(),
        }
    }

    pub fn full_key(&self, model_id: &str) -> FullKey {
        FullKey {
            model_id: model_id.to_string(),
            condition: self.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConditionKey {
    pub item_id: String,
    pub paraphrase_id: String,
    pub system_prompt_id: String,
    pub temperature: Temperature,
    pub context_id: String,
}

impl fmt::Display for ConditionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.item_id, self.paraphrase_id, self.system_prompt_id, self.temperature, self.context_id
        )
    }
}

/// Model plus condition: one required API call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullKey {
    pub model_id: String,
    #[serde(flatten)]
    pub condition: Condition,
}

impl fmt::Display for FullKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|r{}",
            self.model_id,
            self.condition.key(),
            self.condition.run_number
        )
    }
}

/// One required call awaiting execution.
pub type WorkItem = FullKey;

/// Declarative factorial design.
///
/// Items and contexts are partitioned by category; every other factor is
/// shared across categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentDesign {
    pub models: Vec<String>,
    pub items: BTreeMap<String, Vec<String>>,
    pub paraphrases: Vec<String>,
    pub system_prompts: Vec<String>,
    pub temperatures: Vec<Temperature>,
    pub contexts: BTreeMap<String, Vec<String>>,
    pub runs: u32,
}

impl ExperimentDesign {
    /// Check every design invariant.
    pub fn validate(&self) -> SnapResult<()> {
        require_unique("models", &self.models)?;
        require_unique("paraphrases", &self.paraphrases)?;
        require_unique("system_prompts", &self.system_prompts)?;
        if self.temperatures.is_empty() {
            return Err(SnapError::invalid_design("temperatures must not be empty"));
        }
        let temps: BTreeSet<_> = self.temperatures.iter().collect();
        if temps.len() != self.temperatures.len() {
            return Err(SnapError::invalid_design("temperatures contain duplicates"));
        }
        if self.runs == 0 {
            return Err(SnapError::invalid_design("runs must be at least 1"));
        }
        if self.items.is_empty() {
            return Err(SnapError::invalid_design("items must not be empty"));
        }

        let item_categories: BTreeSet<_> = self.items.keys().collect();
        let context_categories: BTreeSet<_> = self.contexts.keys().collect();
        if item_categories != context_categories {
            return Err(SnapError::invalid_design(format!(
                "item categories {:?} do not match context categories {:?}",
                item_categories, context_categories
            )));
        }

        let mut seen_items = BTreeSet::new();
        for (category, items) in &self.items {
            require_unique(&format!("items.{category}"), items)?;
            for item in items {
                if !seen_items.insert(item) {
                    return Err(SnapError::invalid_design(format!(
                        "item '{item}' appears in more than one category"
                    )));
                }
            }
        }
        for (category, contexts) in &self.contexts {
            require_unique(&format!("contexts.{category}"), contexts)?;
        }
        Ok(())
    }

    /// Whether `condition` belongs to the pilot slice: first item of its
    /// category and first value of every other factor, all runs.
    pub fn is_pilot(&self, condition: &Condition) -> bool {
        let Some((category, _)) = self
            .items
            .iter()
            .find(|(_, items)| items.first() == Some(&condition.item_id))
        else {
            return false;
        };
        self.paraphrases.first() == Some(&condition.paraphrase_id)
            && self.system_prompts.first() == Some(&condition.system_prompt_id)
            && self.temperatures.first() == Some(&condition.temperature)
            && self
                .contexts
                .get(category)
                .and_then(|c| c.first())
                .is_some_and(|c| c == &condition.context_id)
    }

    /// Number of conditions contributed by one category.
    fn category_size(&self, items: &[String], contexts: &[String]) -> u64 {
        [
            items.len(),
            self.paraphrases.len(),
            self.system_prompts.len(),
            self.temperatures.len(),
            contexts.len(),
        ]
        .iter()
        .map(|&n| n as u64)
        .product::<u64>()
            * u64::from(self.runs)
    }
}

fn require_unique(field: &str, values: &[String]) -> SnapResult<()> {
    if values.is_empty() {
        return Err(SnapError::invalid_design(format!(
            "{field} must not be empty"
        )));
    }
    let unique: BTreeSet<_> = values.iter().collect();
    if unique.len() != values.len() {
        return Err(SnapError::invalid_design(format!(
            "{field} contains duplicates"
        )));
    }
    Ok(())
}

/// Experiment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Pilot,
    Full,
}

impl FromStr for RunMode {
    type Err = SnapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pilot" => Ok(Self::Pilot),
            "full" => Ok(Self::Full),
            other => Err(SnapError::config(format!(
                "unknown mode '{other}' (expected pilot|full)"
            ))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pilot => "pilot",
            Self::Full => "full",
        })
    }
}

#[derive(Debug, Clone)]
struct Block<'a> {
    items: &'a [String],
    contexts: &'a [String],
    size: u64,
}

/// Lazy, restartable (`Clone`) sequence of conditions.
#[derive(Debug, Clone)]
pub struct ConditionIter<'a> {
    design: &'a ExperimentDesign,
    blocks: Vec<Block<'a>>,
    block: usize,
    offset: u64,
    remaining: u64,
}

impl<'a> ConditionIter<'a> {
    fn decode(&self, block: &Block<'a>, offset: u64) -> Condition {
        let d = self.design;
        let mut rest = offset;
        let mut digit = |radix: usize| {
            let radix = radix as u64;
            let v = rest % radix;
            rest /= radix;
            v as usize
        };
        let run = digit(d.runs as usize);
        let context = digit(block.contexts.len());
        let temperature = digit(d.temperatures.len());
        let system_prompt = digit(d.system_prompts.len());
        let paraphrase = digit(d.paraphrases.len());
        let item = digit(block.items.len());

        Condition {
            item_id: block.items[item].clone(),
            paraphrase_id: d.paraphrases[paraphrase].clone(),
            system_prompt_id: d.system_prompts[system_prompt].clone(),
            temperature: d.temperatures[temperature],
            context_id: block.contexts[context].clone(),
            run_number: run as u32 + 1,
        }
    }
}

impl Iterator for ConditionIter<'_> {
    type Item = Condition;

    fn next(&mut self) -> Option<Condition> {
        while let Some(block) = self.blocks.get(self.block) {
            if self.offset < block.size {
                let condition = self.decode(block, self.offset);
                self.offset += 1;
                self.remaining -= 1;
                return Some(condition);
            }
            self.block += 1;
            self.offset = 0;
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for ConditionIter<'_> {}

/// Full factorial sequence for `design`.
pub fn generate(design: &ExperimentDesign) -> ConditionIter<'_> {
    let blocks: Vec<Block<'_>> = design
        .items
        .iter()
        .map(|(category, items)| {
            let contexts = design
                .contexts
                .get(category)
                .map(Vec::as_slice)
                .unwrap_or_default();
            Block {
                items,
                contexts,
                size: design.category_size(items, contexts),
            }
        })
        .collect();
    let remaining = blocks.iter().map(|b| b.size).sum();
    ConditionIter {
        design,
        blocks,
        block: 0,
        offset: 0,
        remaining,
    }
}

/// Number of conditions [`generate`] yields, without materializing them.
pub fn count(design: &ExperimentDesign) -> u64 {
    design
        .items
        .iter()
        .map(|(category, items)| {
            let contexts = design
                .contexts
                .get(category)
                .map(Vec::as_slice)
                .unwrap_or_default();
            design.category_size(items, contexts)
        })
        .sum()
}

/// Restrict `conditions` to the pilot slice, or pass them through for full mode.
pub fn filter_for_mode<'a, I>(
    conditions: I,
    mode: RunMode,
    design: &'a ExperimentDesign,
) -> impl Iterator<Item = Condition> + 'a
where
    I: IntoIterator<Item = Condition>,
    I::IntoIter: 'a,
{
    conditions
        .into_iter()
        .filter(move |c| mode == RunMode::Full || design.is_pilot(c))
}

pub fn estimate_api_calls(conditions: u64, models: usize) -> u64 {
    conditions * models as u64
}
