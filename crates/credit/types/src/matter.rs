use crate::{CreditError, CreditResult, IdentityId, TargetId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Longest accepted rating category.
pub const MAX_CATEGORY_LEN: usize = 100;

const CIC_CATEGORY: &str = "CIC";

/// The axis along which a rating is scored.
///
/// Each axis carries its own rules for the category and the counterpart,
/// checked once in [`RatingKey::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Matter {
    /// Reputation given to another identity under a free-form category.
    Rep,
    /// Credibility given to another identity.
    Cic,
    /// A rating on a drop.
    DropRating,
}

impl Matter {
    pub const ALL: [Matter; 3] = [Matter::Rep, Matter::Cic, Matter::DropRating];

    pub fn as_str(&self) -> &'static str {
        match self {
            Matter::Rep => "REP",
            Matter::Cic => "CIC",
            Matter::DropRating => "DROP_RATING",
        }
    }

    /// Identity-targeted matters treat the target as a counterpart identity.
    pub fn targets_identity(&self) -> bool {
        matches!(self, Matter::Rep | Matter::Cic)
    }

    fn normalize_category(&self, category: &str) -> CreditResult<String> {
        match self {
            Matter::Cic => {
                let trimmed = category.trim();
                if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(CIC_CATEGORY) {
                    Ok(CIC_CATEGORY.to_string())
                } else {
                    Err(CreditError::Validation(format!(
                        "matter CIC does not take a category, got '{trimmed}'"
                    )))
                }
            }
            Matter::Rep | Matter::DropRating => {
                let trimmed = category.trim();
                if trimmed.is_empty() {
                    return Err(CreditError::Validation(format!(
                        "matter {self} requires a category"
                    )));
                }
                if trimmed.chars().count() > MAX_CATEGORY_LEN {
                    return Err(CreditError::Validation(format!(
                        "category can't be longer than {MAX_CATEGORY_LEN} characters"
                    )));
                }
                if let Some(bad) = trimmed.chars().find(|c| !is_category_char(*c)) {
                    return Err(CreditError::Validation(format!(
                        "category contains unsupported character {bad:?}"
                    )));
                }
                Ok(trimmed.to_string())
            }
        }
    }
}

fn is_category_char(c: char) -> bool {
    c.is_alphanumeric()
        || matches!(
            c,
            ' ' | ',' | '.' | '!' | '?' | '-' | '_' | ':' | ';' | '&' | '(' | ')' | '\''
        )
}

impl fmt::Display for Matter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Matter {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REP" => Ok(Matter::Rep),
            "CIC" => Ok(Matter::Cic),
            "DROP_RATING" => Ok(Matter::DropRating),
            other => Err(CreditError::Validation(format!("unknown matter '{other}'"))),
        }
    }
}

/// Why a rating changed. Recorded on every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeReason {
    UserEdit,
    LostCredit,
    IdentityMerge,
    AdminAdjustment,
}

impl ChangeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::UserEdit => "USER_EDIT",
            ChangeReason::LostCredit => "LOST_CREDIT",
            ChangeReason::IdentityMerge => "IDENTITY_MERGE",
            ChangeReason::AdminAdjustment => "ADMIN_ADJUSTMENT",
        }
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated identity of one rating row: (rater, target, matter, category).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRatingKey")]
pub struct RatingKey {
    rater: IdentityId,
    target: TargetId,
    matter: Matter,
    category: String,
}

#[derive(Deserialize)]
struct RawRatingKey {
    rater: IdentityId,
    target: TargetId,
    matter: Matter,
    category: String,
}

impl TryFrom<RawRatingKey> for RatingKey {
    type Error = CreditError;

    fn try_from(raw: RawRatingKey) -> Result<Self, Self::Error> {
        RatingKey::new(raw.rater, raw.target, raw.matter, raw.category)
    }
}

impl RatingKey {
    /// Build a key, enforcing the matter's category and counterpart rules.
    pub fn new(
        rater: IdentityId,
        target: TargetId,
        matter: Matter,
        category: impl AsRef<str>,
    ) -> CreditResult<Self> {
        if rater.as_str().trim().is_empty() {
            return Err(CreditError::Validation("rater id is empty".into()));
        }
        if target.as_str().trim().is_empty() {
            return Err(CreditError::Validation("target id is empty".into()));
        }
        let category = matter.normalize_category(category.as_ref())?;
        if matter.targets_identity() && rater.as_str() == target.as_str() {
            return Err(CreditError::Forbidden(format!(
                "identity {rater} can't rate itself on {matter}"
            )));
        }
        Ok(Self {
            rater,
            target,
            matter,
            category,
        })
    }

    pub fn rater(&self) -> &IdentityId {
        &self.rater
    }

    pub fn target(&self) -> &TargetId {
        &self.target
    }

    pub fn matter(&self) -> Matter {
        self.matter
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// The same target/matter/category, rated by someone else.
    pub fn with_rater(&self, rater: IdentityId) -> CreditResult<Self> {
        RatingKey::new(rater, self.target.clone(), self.matter, &self.category)
    }
}

impl fmt::Display for RatingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{} [{}/{}]",
            self.rater, self.target, self.matter, self.category
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(matter: Matter, category: &str) -> CreditResult<RatingKey> {
        RatingKey::new("alice".into(), "bob".into(), matter, category)
    }

    #[test]
    fn cic_category_is_fixed() {
        assert_eq!(key(Matter::Cic, "").unwrap().category(), "CIC");
        assert_eq!(key(Matter::Cic, "cic").unwrap().category(), "CIC");
        assert!(matches!(
            key(Matter::Cic, "Art"),
            Err(CreditError::Validation(_))
        ));
    }

    #[test]
    fn rep_requires_a_sane_category() {
        assert_eq!(key(Matter::Rep, "  Art (digital) ").unwrap().category(), "Art (digital)");
        assert!(matches!(key(Matter::Rep, " "), Err(CreditError::Validation(_))));
        assert!(matches!(
            key(Matter::Rep, &"x".repeat(MAX_CATEGORY_LEN + 1)),
            Err(CreditError::Validation(_))
        ));
        assert!(matches!(
            key(Matter::Rep, "tab\there"),
            Err(CreditError::Validation(_))
        ));
    }

    #[test]
    fn identity_matters_forbid_self_rating() {
        let err = RatingKey::new("alice".into(), "alice".into(), Matter::Rep, "Art").unwrap_err();
        assert!(matches!(err, CreditError::Forbidden(_)));
        // drops are not identities, so the same id string is fine
        assert!(RatingKey::new("alice".into(), "alice".into(), Matter::DropRating, "Quality").is_ok());
    }

    #[test]
    fn matter_parses_case_insensitively() {
        assert_eq!("rep".parse::<Matter>().unwrap(), Matter::Rep);
        assert_eq!("DROP_RATING".parse::<Matter>().unwrap(), Matter::DropRating);
        assert!("TDH".parse::<Matter>().is_err());
    }

    #[test]
    fn deserialization_validates() {
        let bad = serde_json::json!({
            "rater": "alice", "target": "alice", "matter": "CIC", "category": "CIC"
        });
        assert!(serde_json::from_value::<RatingKey>(bad).is_err());
        let good = serde_json::json!({
            "rater": "alice", "target": "bob", "matter": "REP", "category": "Art"
        });
        assert_eq!(
            serde_json::from_value::<RatingKey>(good).unwrap().matter(),
            Matter::Rep
        );
    }

    proptest! {
        #[test]
        fn accepted_rep_categories_are_trimmed_and_stable(category in "[ A-Za-z0-9,.!?_-]{0,120}") {
            match key(Matter::Rep, &category) {
                Ok(k) => {
                    prop_assert_eq!(k.category(), category.trim());
                    prop_assert!(k.category().chars().count() <= MAX_CATEGORY_LEN);
                    let again = key(Matter::Rep, k.category()).unwrap();
                    prop_assert_eq!(again.category(), k.category());
                }
                Err(err) => prop_assert!(matches!(err, CreditError::Validation(_))),
            }
        }
    }
}
