use serde::{Deserialize, Serialize};

use crate::error::ZeroshotError;

/// Model ceiling ordering: haiku < sonnet < opus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Haiku,
    Sonnet,
    Opus,
}

impl Model {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "haiku" => Some(Model::Haiku),
            "sonnet" => Some(Model::Sonnet),
            "opus" => Some(Model::Opus),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Model::Haiku => "haiku",
            Model::Sonnet => "sonnet",
            Model::Opus => "opus",
        }
    }

    /// Clamp `self` to not exceed `ceiling`.
    pub fn capped_by(self, ceiling: Model) -> Model {
        self.min(ceiling)
    }
}

/// Parsed form of the `"N"|"A-B"|"N+"|"all"` iteration-range language used
/// by `ModelConfig::Rules` and `PromptConfig::Rules`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationRange {
    Exact(u32),
    Bounded(u32, u32),
    OrAbove(u32),
    All,
}

impl IterationRange {
    pub fn parse(raw: &str) -> Result<Self, ZeroshotError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("all") {
            return Ok(IterationRange::All);
        }
        if let Some(prefix) = raw.strip_suffix('+') {
            let n: u32 = prefix
                .parse()
                .map_err(|_| ZeroshotError::Config(format!("invalid iteration range: {raw}")))?;
            return Ok(IterationRange::OrAbove(n));
        }
        if let Some((lo, hi)) = raw.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .map_err(|_| ZeroshotError::Config(format!("invalid iteration range: {raw}")))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .map_err(|_| ZeroshotError::Config(format!("invalid iteration range: {raw}")))?;
            return Ok(IterationRange::Bounded(lo, hi));
        }
        let n: u32 = raw
            .parse()
            .map_err(|_| ZeroshotError::Config(format!("invalid iteration range: {raw}")))?;
        Ok(IterationRange::Exact(n))
    }

    pub fn contains(&self, iteration: u32) -> bool {
        match self {
            IterationRange::Exact(n) => iteration == *n,
            IterationRange::Bounded(lo, hi) => iteration >= *lo && iteration <= *hi,
            IterationRange::OrAbove(n) => iteration >= *n,
            IterationRange::All => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRule {
    pub iterations: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelConfig {
    Static {
        model: String,
    },
    Rules {
        rules: Vec<ModelRule>,
    },
}

impl ModelConfig {
    /// Resolve the model for the given iteration, then clamp to `ceiling`.
    /// The first matching rule wins; `Rules` configs with no matching rule
    /// fall back to the ceiling itself.
    pub fn resolve(&self, iteration: u32, ceiling: Model) -> Result<Model, ZeroshotError> {
        let raw = match self {
            ModelConfig::Static { model } => model.clone(),
            ModelConfig::Rules { rules } => {
                let mut matched = None;
                for rule in rules {
                    let range = IterationRange::parse(&rule.iterations)?;
                    if range.contains(iteration) {
                        matched = Some(rule.model.clone());
                        break;
                    }
                }
                matched.unwrap_or_else(|| ceiling.as_str().to_string())
            }
        };
        let model = Model::parse(&raw)
            .ok_or_else(|| ZeroshotError::Config(format!("unknown model: {raw}")))?;
        Ok(model.capped_by(ceiling))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRule {
    #[serde(rename = "match")]
    pub range: String,
    pub system: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptConfig {
    Literal(String),
    Rules { rules: Vec<PromptRule> },
}

impl PromptConfig {
    pub fn resolve(&self, iteration: u32) -> Result<String, ZeroshotError> {
        match self {
            PromptConfig::Literal(text) => Ok(text.clone()),
            PromptConfig::Rules { rules } => {
                for rule in rules {
                    let range = IterationRange::parse(&rule.range)?;
                    if range.contains(iteration) {
                        return Ok(rule.system.clone());
                    }
                }
                Err(ZeroshotError::Config(format!(
                    "no prompt rule matched iteration {iteration}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iteration_range_parses_all_forms() {
        assert_eq!(IterationRange::parse("3").unwrap(), IterationRange::Exact(3));
        assert_eq!(
            IterationRange::parse("2-5").unwrap(),
            IterationRange::Bounded(2, 5)
        );
        assert_eq!(IterationRange::parse("4+").unwrap(), IterationRange::OrAbove(4));
        assert_eq!(IterationRange::parse("all").unwrap(), IterationRange::All);
        assert_eq!(IterationRange::parse("ALL").unwrap(), IterationRange::All);
    }

    #[test]
    fn model_resolution_never_exceeds_ceiling() {
        let config = ModelConfig::Rules {
            rules: vec![ModelRule {
                iterations: "all".into(),
                model: "opus".into(),
            }],
        };
        let resolved = config.resolve(1, Model::Sonnet).unwrap();
        assert_eq!(resolved, Model::Sonnet);
    }

    #[test]
    fn model_rules_pick_first_matching_range() {
        let config = ModelConfig::Rules {
            rules: vec![
                ModelRule {
                    iterations: "1".into(),
                    model: "haiku".into(),
                },
                ModelRule {
                    iterations: "2+".into(),
                    model: "opus".into(),
                },
            ],
        };
        assert_eq!(config.resolve(1, Model::Opus).unwrap(), Model::Haiku);
        assert_eq!(config.resolve(3, Model::Opus).unwrap(), Model::Opus);
    }

    #[test]
    fn prompt_rules_resolve_by_range() {
        let config = PromptConfig::Rules {
            rules: vec![
                PromptRule {
                    range: "1".into(),
                    system: "first".into(),
                },
                PromptRule {
                    range: "2+".into(),
                    system: "later".into(),
                },
            ],
        };
        assert_eq!(config.resolve(1).unwrap(), "first");
        assert_eq!(config.resolve(5).unwrap(), "later");
    }
}
