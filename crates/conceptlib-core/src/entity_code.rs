//! Human-readable entity codes (`C123`, `PH45`, `WS7`).
//!
//! Codes are derived from the numeric id once at creation and stored next to
//! the row for display. Identity and comparison always use the numeric id.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::models::{EntityId, EntityRef, EntityType};

static CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)(PH|WS|C)?\s*(\d+)$").expect("entity code pattern is valid"));

/// Display code for a freshly allocated id.
pub fn entity_code(entity_type: EntityType, id: EntityId) -> String {
    match entity_type.code_prefix() {
        Some(prefix) => format!("{}{}", prefix, id),
        None => id.to_string(),
    }
}

/// Parse a display code (or a bare number) for an entity of a known type.
///
/// A prefix that belongs to another type is rejected.
pub fn parse_entity_code(entity_type: EntityType, code: &str) -> Result<EntityRef> {
    let caps = CODE_PATTERN
        .captures(code.trim())
        .ok_or_else(|| Error::InvalidInput(format!("Malformed entity code: {}", code)))?;

    if let Some(prefix) = caps.get(1) {
        let expected = entity_type.code_prefix().unwrap_or("");
        if !prefix.as_str().eq_ignore_ascii_case(expected) {
            return Err(Error::InvalidInput(format!(
                "Code {} does not belong to a {}",
                code, entity_type
            )));
        }
    }

    let id: EntityId = caps[2]
        .parse()
        .map_err(|_| Error::InvalidInput(format!("Entity id out of range: {}", code)))?;

    Ok(EntityRef::new(entity_type, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_code_generation() {
        assert_eq!(entity_code(EntityType::Concept, 123), "C123");
        assert_eq!(entity_code(EntityType::Phenotype, 45), "PH45");
        assert_eq!(entity_code(EntityType::WorkingSet, 7), "WS7");
        assert_eq!(entity_code(EntityType::DataSource, 3), "3");
    }

    #[test]
    fn test_parse_prefixed_code() {
        let parsed = parse_entity_code(EntityType::Phenotype, "PH45").unwrap();
        assert_eq!(parsed, EntityRef::phenotype(45));

        let lower = parse_entity_code(EntityType::Phenotype, "ph45").unwrap();
        assert_eq!(lower.id, 45);
    }

    #[test]
    fn test_parse_bare_number() {
        let parsed = parse_entity_code(EntityType::Concept, " 99 ").unwrap();
        assert_eq!(parsed, EntityRef::concept(99));
    }

    #[test]
    fn test_parse_rejects_foreign_prefix() {
        assert!(parse_entity_code(EntityType::Concept, "PH45").is_err());
        assert!(parse_entity_code(EntityType::DataSource, "C1").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_entity_code(EntityType::Concept, "C").is_err());
        assert!(parse_entity_code(EntityType::Concept, "C12x").is_err());
        assert!(parse_entity_code(EntityType::Concept, "C99999999999999999999").is_err());
    }
}
