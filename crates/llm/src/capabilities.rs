//! Which provider/model pairs accept strict `json_schema` response formats.

use packet::CapabilityResolver;
use serde::{Deserialize, Serialize};

/// Model-name prefixes known to support strict structured output, per provider.
const KNOWN: &[(&str, &[&str])] = &[
    ("openai", &["gpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4"]),
    ("azure", &["gpt-4o", "gpt-4.1"]),
    ("groq", &["openai/gpt-oss", "moonshotai/kimi-k2"]),
];

/// An explicit answer for one provider/model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityOverride {
    pub provider: String,
    pub model: String,
    pub structured_output: bool,
}

/// Table-driven [`CapabilityResolver`]. Overrides win over the built-in table;
/// unknown pairs fall back to free-form JSON.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    overrides: Vec<CapabilityOverride>,
}

impl CapabilityTable {
    pub fn new(overrides: Vec<CapabilityOverride>) -> Self {
        Self { overrides }
    }
}

impl CapabilityResolver for CapabilityTable {
    fn supports_structured_output(&self, provider: &str, model: &str) -> bool {
        if let Some(o) = self
            .overrides
            .iter()
            .find(|o| o.provider.eq_ignore_ascii_case(provider) && o.model == model)
        {
            return o.structured_output;
        }
        KNOWN
            .iter()
            .find(|(p, _)| p.eq_ignore_ascii_case(provider))
            .is_some_and(|(_, prefixes)| prefixes.iter().any(|prefix| model.starts_with(prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_use_structured_output() {
        let table = CapabilityTable::default();
        assert!(table.supports_structured_output("openai", "gpt-4o-mini"));
        assert!(table.supports_structured_output("OpenAI", "gpt-4.1"));
        assert!(!table.supports_structured_output("openai", "gpt-3.5-turbo"));
        assert!(!table.supports_structured_output("ollama", "llama3"));
    }

    #[test]
    fn overrides_win() {
        let table = CapabilityTable::new(vec![
            CapabilityOverride {
                provider: "ollama".into(),
                model: "qwen2.5".into(),
                structured_output: true,
            },
            CapabilityOverride {
                provider: "openai".into(),
                model: "gpt-4o".into(),
                structured_output: false,
            },
        ]);
        assert!(table.supports_structured_output("ollama", "qwen2.5"));
        assert!(!table.supports_structured_output("openai", "gpt-4o"));
        assert!(table.supports_structured_output("openai", "gpt-4o-mini"));
    }
}
