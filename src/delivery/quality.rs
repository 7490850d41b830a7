//! Quality token normalization
//!
//! Clients spell quality in many ways (`720`, `720p`, `hd720`, `hd`).
//! Everything is folded into a canonical [`Quality`] so that all spellings of
//! the same target share one cache slot. Parsing is total: unknown input
//! degrades to [`Quality::Standard`].

use std::fmt;

/// Canonical token for the "no specific height" selection
pub const STANDARD_TOKEN: &str = "standard";

/// Named aliases that carry no digits
const ALIASES: &[(&str, u32)] = &[
    ("tiny", 144),
    ("small", 240),
    ("medium", 360),
    ("large", 480),
    ("hd", 720),
    ("fullhd", 1080),
    ("uhd", 2160),
];

/// Canonical quality selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    /// Target pixel height
    Height(u32),
    /// Best ready-made combined stream, no specific height
    Standard,
}

impl Quality {
    /// Normalize an arbitrary user string. Never fails.
    pub fn parse(input: &str) -> Self {
        let s = input.trim().to_ascii_lowercase();
        if s.is_empty() {
            return Quality::Standard;
        }

        if let Ok(height) = s.parse::<u32>() {
            return Self::from_height(height);
        }

        // First run of digits: "720p" -> 720, "hd720" -> 720, "1080p60" -> 1080
        let digits: String = s
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if !digits.is_empty() {
            return match digits.parse::<u32>() {
                Ok(height) => Self::from_height(height),
                Err(_) => Quality::Standard,
            };
        }

        ALIASES
            .iter()
            .find(|(alias, _)| *alias == s)
            .map(|(_, height)| Quality::Height(*height))
            .unwrap_or(Quality::Standard)
    }

    fn from_height(height: u32) -> Self {
        if height == 0 {
            Quality::Standard
        } else {
            Quality::Height(height)
        }
    }

    /// Target height, if any
    pub fn height(&self) -> Option<u32> {
        match self {
            Quality::Height(h) => Some(*h),
            Quality::Standard => None,
        }
    }

    /// Canonical cache token: the height as digits, or `standard`
    pub fn token(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Height(h) => write!(f, "{}", h),
            Quality::Standard => f.write_str(STANDARD_TOKEN),
        }
    }
}

impl From<&str> for Quality {
    fn from(s: &str) -> Self {
        Quality::parse(s)
    }
}

/// Normalize a raw quality string straight to its canonical token
pub fn canonical_quality(input: &str) -> String {
    Quality::parse(input).token()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spellings_of_720_collapse() {
        assert_eq!(canonical_quality("720"), "720");
        assert_eq!(canonical_quality("720p"), "720");
        assert_eq!(canonical_quality("hd720"), "720");
        assert_eq!(canonical_quality(" HD720 "), "720");
        assert_eq!(canonical_quality("hd"), "720");
        assert_ne!(canonical_quality("720"), canonical_quality("360"));
    }

    #[test]
    fn test_aliases() {
        assert_eq!(Quality::parse("tiny"), Quality::Height(144));
        assert_eq!(Quality::parse("medium"), Quality::Height(360));
        assert_eq!(Quality::parse("Large"), Quality::Height(480));
        assert_eq!(Quality::parse("fullhd"), Quality::Height(1080));
    }

    #[test]
    fn test_first_digit_run_wins() {
        assert_eq!(Quality::parse("1080p60"), Quality::Height(1080));
        assert_eq!(Quality::parse("hd1080"), Quality::Height(1080));
    }

    #[test]
    fn test_unknown_degrades_to_standard() {
        assert_eq!(Quality::parse(""), Quality::Standard);
        assert_eq!(Quality::parse("   "), Quality::Standard);
        assert_eq!(Quality::parse("potato"), Quality::Standard);
        assert_eq!(Quality::parse("0"), Quality::Standard);
        assert_eq!(Quality::parse("p0"), Quality::Standard);
        assert_eq!(Quality::parse("99999999999999999999"), Quality::Standard);
        assert_eq!(canonical_quality("standard"), STANDARD_TOKEN);
    }

    #[test]
    fn test_height_accessor() {
        assert_eq!(Quality::Height(360).height(), Some(360));
        assert_eq!(Quality::Standard.height(), None);
    }
}
