//! Shared domain enumerations aligned with persisted database enums.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "post_visibility", rename_all = "snake_case")]
pub enum PostVisibility {
    Public,
    Unlisted,
    Followers,
}

impl PostVisibility {
    pub fn as_str(self) -> &'static str {
        match self {
            PostVisibility::Public => "public",
            PostVisibility::Unlisted => "unlisted",
            PostVisibility::Followers => "followers",
        }
    }
}

impl TryFrom<&str> for PostVisibility {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "public" => Ok(PostVisibility::Public),
            "unlisted" => Ok(PostVisibility::Unlisted),
            "followers" => Ok(PostVisibility::Followers),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "account_tier", rename_all = "snake_case")]
pub enum AccountTier {
    Free,
    Plus,
    Premium,
}

impl AccountTier {
    /// Ordinal weight applied to this tier's engagement events.
    pub fn weight(self) -> f64 {
        match self {
            AccountTier::Free => 1.0,
            AccountTier::Plus => 2.0,
            AccountTier::Premium => 3.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccountTier::Free => "free",
            AccountTier::Plus => "plus",
            AccountTier::Premium => "premium",
        }
    }
}

/// Which read path serves a feed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// Scores computed per request over the candidate set (home/profile).
    Live,
    /// Pages read from the precomputed trending generation.
    Snapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_weights_are_ordinal() {
        assert_eq!(AccountTier::Free.weight(), 1.0);
        assert_eq!(AccountTier::Plus.weight(), 2.0);
        assert_eq!(AccountTier::Premium.weight(), 3.0);
    }

    #[test]
    fn visibility_round_trips_through_str() {
        for visibility in [
            PostVisibility::Public,
            PostVisibility::Unlisted,
            PostVisibility::Followers,
        ] {
            assert_eq!(PostVisibility::try_from(visibility.as_str()), Ok(visibility));
        }
        assert!(PostVisibility::try_from("direct").is_err());
    }
}
