//! Post-hoc grounding check of generated replies.
//!
//! A reply is `Risky` when it makes a factual claim that cannot be traced
//! to the listings injected into its prompt or to what the user said:
//! a listing id outside the injected set, a price that matches no injected
//! listing and no user-stated amount, or a street address that is not part
//! of an injected listing's address.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use propmatch_core::{FieldValue, GroundingVerdict, ListingId, ScoredListing, UserMetadata};

use crate::money::{amounts_in, currency_amounts};

static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b\d{1,4}[A-Za-z]?\s+(?P<words>(?:[A-Z][a-zA-Z']+\s+){1,3})(?:Street|St|Road|Rd|Avenue|Ave|Lane|Ln|Close|Drive|Dr|Way|Place|Pl|Court|Ct|Crescent|Gardens|Terrace|Square|Grove|Hill|Mews|Row|Walk|Parade|Boulevard)\b",
    )
    .expect("Invalid address regex")
});

/// Words that make a numbered phrase a property description rather than a
/// street address, as in "4 Bedroom Victorian Terrace".
const PROPERTY_WORDS: &[&str] = &[
    "bed", "beds", "bedroom", "bedrooms", "bedroomed", "bath", "baths", "bathroom",
    "bathrooms", "reception", "receptions", "storey", "story", "floor", "double", "single",
    "minute", "minutes", "mile", "miles", "acre", "acres", "car", "year", "years",
];

fn address_claims(reply: &str) -> impl Iterator<Item = &str> {
    ADDRESS_RE.captures_iter(reply).filter_map(|caps| {
        let words = caps.name("words")?.as_str();
        let describes_property = words
            .split_whitespace()
            .any(|w| PROPERTY_WORDS.contains(&w.to_lowercase().as_str()));
        if describes_property {
            None
        } else {
            caps.get(0).map(|m| m.as_str())
        }
    })
}

/// Checks replies against the listings shown for the turn.
#[derive(Clone, Debug)]
pub struct GroundingValidator {
    listing_id_pattern: Regex,
    /// Catalogue ids, matched verbatim even if they do not fit the pattern.
    known_ids: BTreeSet<String>,
    price_key: String,
    address_key: String,
}

impl GroundingValidator {
    pub fn new(listing_id_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            listing_id_pattern: Regex::new(listing_id_pattern)?,
            known_ids: BTreeSet::new(),
            price_key: "price".to_string(),
            address_key: "address".to_string(),
        })
    }

    pub fn with_known_ids(mut self, ids: impl IntoIterator<Item = ListingId>) -> Self {
        self.known_ids
            .extend(ids.into_iter().map(|id| id.as_str().to_string()));
        self
    }

    /// Judge `reply` given the listings injected into its prompt and the
    /// amounts the user has stated.
    pub fn validate(
        &self,
        reply: &str,
        injected: &[ScoredListing],
        stated_amounts: &[u64],
    ) -> GroundingVerdict {
        let injected_ids: BTreeSet<String> = injected
            .iter()
            .map(|s| s.listing.id.as_str().to_uppercase())
            .collect();

        for id in self.listing_id_claims(reply) {
            if !injected_ids.contains(&id.to_uppercase()) {
                return risky(id);
            }
        }

        let prices: Vec<u64> = injected
            .iter()
            .filter_map(|s| s.listing.attribute_u64(&self.price_key))
            .collect();
        for amount in currency_amounts(reply) {
            if !prices.contains(&amount.value) && !stated_amounts.contains(&amount.value) {
                return risky(amount.text);
            }
        }

        let addresses: Vec<String> = injected
            .iter()
            .filter_map(|s| s.listing.attribute_str(&self.address_key))
            .map(str::to_lowercase)
            .collect();
        for claim in address_claims(reply) {
            let lower = claim.to_lowercase();
            if !addresses.iter().any(|a| a.contains(&lower)) {
                return risky(claim.to_string());
            }
        }

        GroundingVerdict::Safe
    }

    fn listing_id_claims(&self, reply: &str) -> Vec<String> {
        let mut claims: Vec<String> = self
            .listing_id_pattern
            .find_iter(reply)
            .map(|m| m.as_str().to_string())
            .collect();
        let upper = reply.to_uppercase();
        for id in &self.known_ids {
            let already_claimed = claims.iter().any(|c| c.eq_ignore_ascii_case(id));
            if !already_claimed && contains_token(&upper, &id.to_uppercase()) {
                claims.push(id.clone());
            }
        }
        claims
    }
}

/// True when `needle` occurs in `haystack` with no word character directly
/// before or after it, so `LST-100` is not found inside `LST-1001`.
fn contains_token(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

fn risky(claim: String) -> GroundingVerdict {
    debug!(claim = %claim, "Ungrounded claim in reply");
    GroundingVerdict::Risky {
        offending_claim: claim,
    }
}

/// Amounts the user has stated: those in the current message plus the
/// bounds of every range preference.
pub fn stated_amounts(message: &str, metadata: &UserMetadata) -> Vec<u64> {
    let mut amounts: Vec<u64> = amounts_in(message).into_iter().map(|a| a.value).collect();
    for value in metadata.fields.values() {
        if let FieldValue::Range { min, max } = value {
            amounts.extend(min.iter().chain(max.iter()).copied());
        }
    }
    amounts.sort_unstable();
    amounts.dedup();
    amounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use propmatch_core::{ConversationId, ListingReference};
    use std::collections::BTreeMap;

    const PATTERN: &str = r"\b[A-Z]{2,5}-\d{3,}\b";

    fn validator() -> GroundingValidator {
        GroundingValidator::new(PATTERN).unwrap()
    }

    fn listing(id: &str, price: u64, address: &str) -> ScoredListing {
        let mut attributes = BTreeMap::new();
        attributes.insert("price".to_string(), serde_json::json!(price));
        attributes.insert("address".to_string(), serde_json::json!(address));
        ScoredListing {
            listing: ListingReference {
                id: ListingId::new(id),
                vector: vec![],
                listed_at: Utc::now(),
                attributes,
            },
            score: 0.8,
        }
    }

    fn injected() -> Vec<ScoredListing> {
        vec![
            listing("LST-1001", 325_000, "14 Deansgate, Manchester"),
            listing("LST-1002", 360_000, "3 Blossom Street, Manchester"),
        ]
    }

    #[test]
    fn test_reply_citing_injected_listings_is_safe() {
        let reply = "LST-1001 on Deansgate is £325,000 and LST-1002 at 3 Blossom Street is £360k.";
        assert_eq!(validator().validate(reply, &injected(), &[]), GroundingVerdict::Safe);
    }

    #[test]
    fn test_neutral_reply_is_safe() {
        let reply = "Could you tell me your budget and how soon you need to move?";
        assert_eq!(validator().validate(reply, &[], &[]), GroundingVerdict::Safe);
    }

    #[test]
    fn test_unknown_listing_id_is_risky() {
        let reply = "You might also like LST-9999.";
        assert_eq!(
            validator().validate(reply, &injected(), &[]),
            GroundingVerdict::Risky {
                offending_claim: "LST-9999".into()
            }
        );
    }

    #[test]
    fn test_any_id_without_injection_is_risky() {
        let verdict = validator().validate("Take a look at LST-1001!", &[], &[]);
        assert!(!verdict.is_safe());
    }

    #[test]
    fn test_known_id_outside_pattern_is_checked() {
        let v = validator().with_known_ids([ListingId::new("flat7")]);
        assert!(!v.validate("What about FLAT7?", &injected(), &[]).is_safe());
    }

    #[test]
    fn test_known_id_is_matched_as_whole_token() {
        let v = validator().with_known_ids([ListingId::new("LST-100"), ListingId::new("LST-1001")]);
        let shown = vec![listing("LST-1001", 325_000, "14 Deansgate, Manchester")];
        assert_eq!(v.validate("LST-1001 is a great fit.", &shown, &[]), GroundingVerdict::Safe);

        let v = validator().with_known_ids([ListingId::new("flat7"), ListingId::new("flat70")]);
        let shown = vec![listing("flat70", 325_000, "14 Deansgate, Manchester")];
        assert!(v.validate("Flat70 has a balcony.", &shown, &[]).is_safe());
        assert_eq!(
            v.validate("Flat70 and flat7 both have balconies.", &shown, &[]),
            GroundingVerdict::Risky {
                offending_claim: "flat7".into()
            }
        );
    }

    #[test]
    fn test_contains_token_boundaries() {
        assert!(contains_token("SEE LST-100.", "LST-100"));
        assert!(contains_token("LST-100", "LST-100"));
        assert!(!contains_token("SEE LST-1001", "LST-100"));
        assert!(!contains_token("XLST-100", "LST-100"));
        assert!(!contains_token("ANYTHING", ""));
    }

    #[test]
    fn test_invented_price_is_risky() {
        let verdict = validator().validate("LST-1001 is now only £299,000.", &injected(), &[]);
        assert_eq!(
            verdict,
            GroundingVerdict::Risky {
                offending_claim: "£299,000".into()
            }
        );
    }

    #[test]
    fn test_user_stated_amount_is_allowed() {
        let reply = "Both are within your £400,000 budget.";
        assert!(validator().validate(reply, &injected(), &[400_000]).is_safe());
    }

    #[test]
    fn test_invented_address_is_risky() {
        let reply = "There is also a lovely flat at 22 Oxford Road.";
        assert_eq!(
            validator().validate(reply, &injected(), &[]),
            GroundingVerdict::Risky {
                offending_claim: "22 Oxford Road".into()
            }
        );
    }

    #[test]
    fn test_property_description_is_not_an_address() {
        let shown = vec![listing("LST-1001", 325_000, "14 Deansgate, Manchester")];
        let reply = "LST-1001 is a 4 Bedroom Victorian Terrace, 5 Minutes Walk from the station.";
        assert_eq!(validator().validate(reply, &shown, &[]), GroundingVerdict::Safe);
    }

    #[test]
    fn test_address_after_property_description_is_still_checked() {
        let reply = "A 2 Bedroom flat at 22 Oxford Road.";
        assert_eq!(
            validator().validate(reply, &injected(), &[]),
            GroundingVerdict::Risky {
                offending_claim: "22 Oxford Road".into()
            }
        );
    }

    #[test]
    fn test_stated_amounts_from_message_and_metadata() {
        let mut meta = UserMetadata::initial(ConversationId::new("c-1"));
        meta.fields.insert(
            "budget".into(),
            FieldValue::Range { min: Some(250_000), max: Some(300_000) },
        );
        meta.fields.insert("bedrooms".into(), FieldValue::Integer(2));
        let amounts = stated_amounts("could stretch to £320k for 2 beds", &meta);
        assert_eq!(amounts, vec![250_000, 300_000, 320_000]);
    }
}
