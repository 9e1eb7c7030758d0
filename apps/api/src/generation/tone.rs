//! Tone calibration — the four voices a sales message can be written in.
//!
//! The wire names (`professional`, `consultative`, `dynamic`, `friendly`) are the
//! only accepted spellings. Anything else is rejected at the API boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Professional,
    Consultative,
    Dynamic,
    Friendly,
}

impl Tone {
    pub const ALL: [Tone; 4] = [
        Tone::Professional,
        Tone::Consultative,
        Tone::Dynamic,
        Tone::Friendly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tone::Professional => "professional",
            Tone::Consultative => "consultative",
            Tone::Dynamic => "dynamic",
            Tone::Friendly => "friendly",
        }
    }

    /// Returns the writing instruction injected into the generation prompt.
    pub fn instruction(self) -> &'static str {
        match self {
            Tone::Professional => {
                "Write in a formal, business-focused tone that emphasizes professionalism and expertise."
            }
            Tone::Consultative => {
                "Write in an empathetic, solution-oriented tone that focuses on understanding \
                 and solving the prospect's challenges."
            }
            Tone::Dynamic => {
                "Write in a high-energy, results-focused tone that emphasizes action and outcomes."
            }
            Tone::Friendly => {
                "Write in a warm, approachable tone while maintaining professional credibility."
            }
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tone '{0}': expected one of professional, consultative, dynamic, friendly")]
pub struct UnknownTone(pub String);

impl FromStr for Tone {
    type Err = UnknownTone;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tone::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTone(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_every_wire_name() {
        for tone in Tone::ALL {
            assert_eq!(tone.as_str().parse::<Tone>().unwrap(), tone);
        }
    }

    #[test]
    fn test_rejects_unknown_and_differently_cased_names() {
        assert!("aggressive".parse::<Tone>().is_err());
        assert!("Friendly".parse::<Tone>().is_err());
        assert!("".parse::<Tone>().is_err());
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&Tone::Consultative).unwrap();
        assert_eq!(json, "\"consultative\"");
        let back: Tone = serde_json::from_str("\"dynamic\"").unwrap();
        assert_eq!(back, Tone::Dynamic);
    }

    #[test]
    fn test_each_tone_has_distinct_instruction() {
        let mut seen = std::collections::HashSet::new();
        for tone in Tone::ALL {
            assert!(tone.instruction().starts_with("Write in"));
            assert!(seen.insert(tone.instruction()), "{tone} instruction duplicated");
        }
    }
}
