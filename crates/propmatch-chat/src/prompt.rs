//! Prompt assembly for reply generation.

use propmatch_core::schema::DisplayField;
use propmatch_core::{group_thousands, ConversationTurn, FieldSchema, ScoredListing, UserMetadata};

use crate::llm::{MessageRole, Prompt};

const PREFERENCES_HEADER: &str = "The user has already confirmed the following preferences in \
    earlier messages. Do NOT change or ignore these unless the user explicitly says otherwise.";
const PREFERENCES_FOOTER: &str = "Continue the conversation using this context and only update \
    fields if the user clearly expresses a change.";
const LISTINGS_HEADER: &str = "Below is the ONLY set of listings available. You MUST use only these \
    listings when generating your reply. Do not invent or speculate. If none are suitable, say so \
    clearly and suggest adjusting filters.";
const LISTINGS_FOOTER: &str = "The assistant must ONLY reference these listings. Do not invent \
    additional options.";
const NO_LISTINGS: &str = "There are currently no listings available that match the user's query. \
    You must not invent any new listings. Wait for further input.";

/// Builds the reply prompt: system prompt, history, confirmed preferences,
/// the listings block (or a no-listings notice), then the current message.
#[derive(Clone, Debug)]
pub struct PromptBuilder {
    schema: FieldSchema,
}

impl PromptBuilder {
    pub fn new(schema: FieldSchema) -> Self {
        Self { schema }
    }

    /// `listings` is `None` when injection was gated off; an empty slice is
    /// treated the same way.
    pub fn build(
        &self,
        history: &[ConversationTurn],
        metadata: &UserMetadata,
        listings: Option<&[ScoredListing]>,
        message: &str,
    ) -> Prompt {
        let mut prompt = Prompt::new().system(self.schema.system_prompt().trim());

        for turn in history {
            prompt.push(MessageRole::from(turn.role), turn.text.clone());
        }

        if let Some(block) = self.preferences_block(metadata) {
            prompt.push(MessageRole::User, block);
        }

        match listings {
            Some(listings) if !listings.is_empty() => {
                prompt.push(
                    MessageRole::User,
                    format!("{}\n\n{}", LISTINGS_HEADER, self.format_listings(listings)),
                );
            }
            _ => prompt.push(MessageRole::User, NO_LISTINGS),
        }

        prompt.push(MessageRole::User, message);
        prompt
    }

    fn preferences_block(&self, metadata: &UserMetadata) -> Option<String> {
        let lines: Vec<String> = self
            .schema
            .fields()
            .iter()
            .filter_map(|spec| {
                metadata
                    .get(&spec.name)
                    .map(|v| format!("- {}: {}", spec.display_label(), v.display()))
            })
            .collect();

        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "{}\n{}\n\n{}",
            PREFERENCES_HEADER,
            lines.join("\n"),
            PREFERENCES_FOOTER
        ))
    }

    /// Render listings using the schema's display fields.
    pub fn format_listings(&self, listings: &[ScoredListing]) -> String {
        let total = listings.len();
        let mut lines = vec![
            if total == 1 {
                "There is 1 matching listing available:".to_string()
            } else {
                format!("There are {} matching listings available:", total)
            },
            String::new(),
        ];

        for (idx, scored) in listings.iter().enumerate() {
            lines.push(format!("Property {} of {}:", idx + 1, total));
            for field in self.schema.display_fields() {
                lines.push(format!("- {}: {}", field.label, display_value(field, scored)));
            }
            lines.push(String::new());
        }

        lines.push(LISTINGS_FOOTER.to_string());
        lines.join("\n")
    }
}

fn display_value(field: &DisplayField, scored: &ScoredListing) -> String {
    let listing = &scored.listing;
    let raw = if field.key == "id" {
        Some(listing.id.to_string())
    } else if field.format.as_deref() == Some("number") {
        listing
            .attribute_u64(&field.key)
            .map(group_thousands)
            .or_else(|| listing.attributes.get(&field.key).map(json_text))
    } else {
        listing.attributes.get(&field.key).map(json_text)
    };

    match raw {
        Some(value) if !value.is_empty() => format!("{}{}{}", field.prefix, value, field.suffix),
        _ => "Unknown".to_string(),
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(json_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use propmatch_core::{ConversationId, FieldValue, ListingId, ListingReference};
    use std::collections::{BTreeMap, BTreeSet};

    fn builder() -> PromptBuilder {
        PromptBuilder::new(FieldSchema::real_estate().unwrap())
    }

    fn scored(id: &str, price: u64, address: &str) -> ScoredListing {
        let mut attributes = BTreeMap::new();
        attributes.insert("price".to_string(), serde_json::json!(price));
        attributes.insert("address".to_string(), serde_json::json!(address));
        attributes.insert("bedrooms".to_string(), serde_json::json!(2));
        ScoredListing {
            listing: ListingReference {
                id: ListingId::new(id),
                vector: vec![],
                listed_at: Utc::now(),
                attributes,
            },
            score: 0.9,
        }
    }

    fn metadata() -> UserMetadata {
        let mut meta = UserMetadata::initial(ConversationId::new("c-1"));
        meta.fields.insert("location".into(), FieldValue::Text("Manchester".into()));
        meta.fields.insert(
            "budget".into(),
            FieldValue::Range { min: None, max: Some(400_000) },
        );
        meta
    }

    #[test]
    fn test_prompt_order_with_listings() {
        let cid = ConversationId::new("c-1");
        let now = Utc::now();
        let history = vec![
            ConversationTurn::user(cid.clone(), "Hi", now),
            ConversationTurn::assistant(cid, "Hello! Where are you looking?", now, BTreeSet::new()),
        ];
        let listings = vec![scored("LST-1001", 325_000, "14 Deansgate, Manchester")];

        let prompt = builder().build(&history, &metadata(), Some(listings.as_slice()), "2 bed please");
        let msgs = prompt.messages();
        assert_eq!(msgs.len(), 6);
        assert_eq!(msgs[0].role, MessageRole::System);
        assert_eq!(msgs[1].content, "Hi");
        assert_eq!(msgs[2].role, MessageRole::Assistant);
        assert!(msgs[3].content.contains("- Preferred location: Manchester"));
        assert!(msgs[3].content.contains("- Budget: up to £400,000"));
        assert!(msgs[4].content.starts_with("Below is the ONLY set of listings"));
        assert!(msgs[4].content.contains("There is 1 matching listing available:"));
        assert!(msgs[4].content.contains("- Listing ID: LST-1001"));
        assert!(msgs[4].content.contains("- Price: £325,000"));
        assert_eq!(msgs[5].content, "2 bed please");
        assert_eq!(msgs[5].role, MessageRole::User);
    }

    #[test]
    fn test_prompt_without_listings() {
        let empty_meta = UserMetadata::initial(ConversationId::new("c-1"));
        let prompt = builder().build(&[], &empty_meta, None, "hello");
        let msgs = prompt.messages();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[1].content, NO_LISTINGS);

        let prompt = builder().build(&[], &empty_meta, Some(&[][..]), "hello");
        assert_eq!(prompt.messages()[1].content, NO_LISTINGS);
    }

    #[test]
    fn test_format_listings_missing_attribute() {
        let mut listing = scored("LST-2", 500_000, "1 High Street");
        listing.listing.attributes.remove("bedrooms");
        let text = builder().format_listings(&[listing.clone(), listing]);
        assert!(text.starts_with("There are 2 matching listings available:"));
        assert!(text.contains("Property 2 of 2:"));
        assert!(text.contains("- Bedrooms: Unknown"));
        assert!(text.ends_with(LISTINGS_FOOTER));
    }
}
