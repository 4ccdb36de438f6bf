use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Categorical opinion label attached to every submitted opinion and,
/// derived, to every asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Stock,
    Crypto,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Crypto => "crypto",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stock" => Some(Self::Stock),
            "crypto" | "cryptocurrency" => Some(Self::Crypto),
            _ => None,
        }
    }
}

/// Monthly rank award. Only the five highest-ranked predictors of a closed
/// month receive one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadgeTier {
    Top1,
    Top2,
    Top3,
    Top4,
    Top5,
}

impl BadgeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top1 => "top1",
            Self::Top2 => "top2",
            Self::Top3 => "top3",
            Self::Top4 => "top4",
            Self::Top5 => "top5",
        }
    }

    /// Tier for a 1-based leaderboard rank. Ranks past 5 get no badge.
    pub fn for_rank(rank: u32) -> Option<Self> {
        match rank {
            1 => Some(Self::Top1),
            2 => Some(Self::Top2),
            3 => Some(Self::Top3),
            4 => Some(Self::Top4),
            5 => Some(Self::Top5),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid month format: {0:?} (expected YYYY-MM)")]
pub struct MonthYearError(pub String);

/// A ranking period key in "YYYY-MM" form.
///
/// Stored as text in user_badges and leaderboard_entries; also the wire
/// format for the admin assign-badges endpoint and the top-predictors path
/// segment, so parsing is strict: four digits, dash, two digits, month 01-12.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonthYear {
    year: i32,
    month: u32,
}

impl MonthYear {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn parse(s: &str) -> Result<Self, MonthYearError> {
        let bytes = s.as_bytes();
        let shaped = bytes.len() == 7
            && bytes[4] == b'-'
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[5..].iter().all(u8::is_ascii_digit);
        if !shaped {
            return Err(MonthYearError(s.to_string()));
        }
        let year: i32 = s[..4].parse().map_err(|_| MonthYearError(s.to_string()))?;
        let month: u32 = s[5..].parse().map_err(|_| MonthYearError(s.to_string()))?;
        Self::new(year, month).ok_or_else(|| MonthYearError(s.to_string()))
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The month before `date`'s month — the partition a first-of-month
    /// badge run closes over.
    pub fn preceding(date: NaiveDate) -> Self {
        Self::of(date).previous()
    }

    pub fn previous(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn year(self) -> i32 {
        self.year
    }

    pub fn month(self) -> u32 {
        self.month
    }
}

impl std::fmt::Display for MonthYear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl std::str::FromStr for MonthYear {
    type Err = MonthYearError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentiment_round_trip() {
        for s in ["positive", "neutral", "negative"] {
            assert_eq!(Sentiment::from_str_loose(s).unwrap().as_str(), s);
        }
        assert!(Sentiment::from_str_loose("bullish").is_none());
    }

    #[test]
    fn test_badge_tier_for_rank() {
        assert_eq!(BadgeTier::for_rank(1), Some(BadgeTier::Top1));
        assert_eq!(BadgeTier::for_rank(5), Some(BadgeTier::Top5));
        assert_eq!(BadgeTier::for_rank(6), None);
        assert_eq!(BadgeTier::for_rank(0), None);
    }

    #[test]
    fn test_month_year_parse_valid() {
        let m = MonthYear::parse("2025-04").unwrap();
        assert_eq!(m.year(), 2025);
        assert_eq!(m.month(), 4);
        assert_eq!(m.to_string(), "2025-04");
    }

    #[test]
    fn test_month_year_parse_rejects_short_month() {
        // Unpadded months never parse.
        assert!(MonthYear::parse("2025-4").is_err());
    }

    #[test]
    fn test_month_year_parse_rejects_garbage() {
        for s in ["", "202504", "2025-13", "2025-00", "20x5-04", "2025-04-01"] {
            assert!(MonthYear::parse(s).is_err(), "{s} should not parse");
        }
    }

    #[test]
    fn test_previous_crosses_year_boundary() {
        let jan = MonthYear::parse("2025-01").unwrap();
        assert_eq!(jan.previous().to_string(), "2024-12");
        let may = MonthYear::parse("2025-05").unwrap();
        assert_eq!(may.previous().to_string(), "2025-04");
    }

    #[test]
    fn test_preceding_of_date() {
        let d = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        assert_eq!(MonthYear::preceding(d).to_string(), "2025-04");
    }

    #[test]
    fn test_asset_kind_accepts_long_form() {
        assert_eq!(
            AssetKind::from_str_loose("cryptocurrency"),
            Some(AssetKind::Crypto)
        );
        assert_eq!(AssetKind::from_str_loose("stock"), Some(AssetKind::Stock));
        assert!(AssetKind::from_str_loose("bond").is_none());
    }
}
