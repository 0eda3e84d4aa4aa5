//! Age-bracketed catalogue of morals for the "random moral" action.

use std::sync::LazyLock;

use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;

static FIRST_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

/// Default inclusive upper bounds of the first three brackets.
pub const DEFAULT_BOUNDS: [u32; 3] = [5, 8, 12];

/// Age group a moral list is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgeBracket {
    Toddler,
    Early,
    Middle,
    Teen,
}

impl AgeBracket {
    fn index(self) -> usize {
        match self {
            Self::Toddler => 0,
            Self::Early => 1,
            Self::Middle => 2,
            Self::Teen => 3,
        }
    }
}

const TODDLER: &[&str] = &[
    "It is kind to share your toys with friends.",
    "Saying please and thank you makes everyone smile.",
    "It is okay to be scared; grown-ups are there to help.",
    "Tidying up after playing is part of the game.",
    "Gentle hands make good friends.",
    "Brushing your teeth keeps your smile bright.",
];

const EARLY: &[&str] = &[
    "Telling the truth is braver than hiding a mistake.",
    "Finishing what you started feels better than giving up.",
    "A real friend helps, even when nobody is watching.",
    "Patience brings sweeter rewards than hurry.",
    "Everyone is good at something different.",
    "Listening is as important as talking.",
    "Mistakes are how we learn to do better.",
];

const MIDDLE: &[&str] = &[
    "Hard work beats talent when talent does not work hard.",
    "Do not judge others by how they look.",
    "Boasting pushes friends away; kindness brings them closer.",
    "Responsibility means keeping your promises.",
    "Standing up for someone weaker takes true courage.",
    "Greed can make you lose what you already have.",
    "Think before you act, not after.",
];

const TEEN: &[&str] = &[
    "Your choices shape who you become.",
    "Respect is earned by how you treat others.",
    "Flattery is sweet, but honest advice is more valuable.",
    "Following the crowd is easy; following your conscience is wise.",
    "Pride often comes right before a fall.",
    "Real confidence does not need to put others down.",
];

/// Fixed moral lists keyed by age bracket.
#[derive(Debug, Clone)]
pub struct MoralCatalog {
    bounds: [u32; 3],
    lists: [&'static [&'static str]; 4],
}

impl MoralCatalog {
    /// `bounds` are the inclusive upper ages of the first three brackets.
    pub fn new(bounds: [u32; 3]) -> Self {
        Self {
            bounds,
            lists: [TODDLER, EARLY, MIDDLE, TEEN],
        }
    }

    /// Map a free-text age to a bracket using the first number in it.
    ///
    /// Text with no number falls into the early (6–8 by default) bracket.
    /// Numbers too large to parse saturate into the oldest bracket.
    pub fn bracket_for_age(&self, age: &str) -> AgeBracket {
        let Some(digits) = FIRST_NUMBER.find(age) else {
            return AgeBracket::Early;
        };
        let years = digits.as_str().parse::<u64>().unwrap_or(u64::MAX);
        let [toddler, early, middle] = self.bounds.map(u64::from);

        if years <= toddler {
            AgeBracket::Toddler
        } else if years <= early {
            AgeBracket::Early
        } else if years <= middle {
            AgeBracket::Middle
        } else {
            AgeBracket::Teen
        }
    }

    pub fn morals(&self, bracket: AgeBracket) -> &'static [&'static str] {
        self.lists[bracket.index()]
    }

    /// Pick a moral uniformly at random for the given age.
    pub fn pick(&self, age: &str) -> &'static str {
        self.pick_with(age, &mut rand::thread_rng())
    }

    pub fn pick_with<R: Rng + ?Sized>(&self, age: &str, rng: &mut R) -> &'static str {
        let list = self.morals(self.bracket_for_age(age));
        list.choose(rng).copied().unwrap_or(EARLY[0])
    }
}

impl Default for MoralCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_BOUNDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn brackets_follow_bounds() {
        let catalog = MoralCatalog::default();
        assert_eq!(catalog.bracket_for_age("3"), AgeBracket::Toddler);
        assert_eq!(catalog.bracket_for_age("5"), AgeBracket::Toddler);
        assert_eq!(catalog.bracket_for_age("6"), AgeBracket::Early);
        assert_eq!(catalog.bracket_for_age("8 years"), AgeBracket::Early);
        assert_eq!(catalog.bracket_for_age("9"), AgeBracket::Middle);
        assert_eq!(catalog.bracket_for_age("12"), AgeBracket::Middle);
        assert_eq!(catalog.bracket_for_age("13"), AgeBracket::Teen);
    }

    #[test]
    fn first_number_wins() {
        let catalog = MoralCatalog::default();
        assert_eq!(catalog.bracket_for_age("4 and 10"), AgeBracket::Toddler);
    }

    #[test]
    fn unparsable_age_defaults_to_early() {
        let catalog = MoralCatalog::default();
        assert_eq!(catalog.bracket_for_age("almost six"), AgeBracket::Early);
        assert_eq!(catalog.bracket_for_age(""), AgeBracket::Early);
    }

    #[test]
    fn oversized_age_saturates_to_teen() {
        let catalog = MoralCatalog::default();
        assert_eq!(catalog.bracket_for_age("99999999999"), AgeBracket::Teen);
        assert_eq!(
            catalog.bracket_for_age("123456789012345678901234567890 years"),
            AgeBracket::Teen
        );
    }

    #[test]
    fn custom_bounds() {
        let catalog = MoralCatalog::new([3, 6, 10]);
        assert_eq!(catalog.bracket_for_age("7"), AgeBracket::Middle);
        assert_eq!(catalog.bracket_for_age("11"), AgeBracket::Teen);
    }

    #[test]
    fn picks_come_from_bracket_list() {
        let catalog = MoralCatalog::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let moral = catalog.pick_with("7", &mut rng);
            assert!(catalog.morals(AgeBracket::Early).contains(&moral));
        }
    }
}
