//! Message associations and fuzzy type matching.
//!
//! An association declares that a message type triggers a perspective or a
//! receptor. Message type strings follow the `"Simple.Type, Assembly,
//! Version=…, Culture=…, PublicKeyToken=…"` shape; matching is fuzzy in the
//! sense that Version/Culture/PublicKeyToken tokens are ignored, but both the
//! simple type name and the assembly name must be present and equal. A bare
//! type name never matches anything.

use serde::{Deserialize, Serialize};

/// What an association targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationType {
    Perspective,
    Receptor,
}

impl AssociationType {
    /// Smallint encoding used in the associations table.
    pub fn as_i16(self) -> i16 {
        match self {
            AssociationType::Perspective => 1,
            AssociationType::Receptor => 2,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(AssociationType::Perspective),
            2 => Some(AssociationType::Receptor),
            _ => None,
        }
    }
}

/// Declaration that `message_type` triggers `target_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAssociation {
    pub message_type: String,
    pub association_type: AssociationType,
    pub target_name: String,
    pub service_name: String,
}

impl MessageAssociation {
    pub fn perspective(
        message_type: impl Into<String>,
        target_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            association_type: AssociationType::Perspective,
            target_name: target_name.into(),
            service_name: service_name.into(),
        }
    }

    pub fn receptor(
        message_type: impl Into<String>,
        target_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            association_type: AssociationType::Receptor,
            target_name: target_name.into(),
            service_name: service_name.into(),
        }
    }
}

/// A parsed message type name: simple type plus optional assembly, with the
/// qualification tokens stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTypeName {
    pub type_name: String,
    pub assembly: Option<String>,
}

const STRIPPED_TOKENS: [&str; 3] = ["Version=", "Culture=", "PublicKeyToken="];

impl MessageTypeName {
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(',').map(str::trim);
        let type_name = parts.next().unwrap_or("").to_string();
        let assembly = parts
            .find(|part| {
                !part.is_empty()
                    && !STRIPPED_TOKENS.iter().any(|token| {
                        part.get(..token.len())
                            .map_or(false, |prefix| prefix.eq_ignore_ascii_case(token))
                    })
            })
            .map(str::to_string);
        Self {
            type_name,
            assembly,
        }
    }

    /// Canonical `"Type, Assembly"` form, or `None` when either part is
    /// missing. Names without a normalized form never match.
    pub fn normalized(&self) -> Option<String> {
        if self.type_name.is_empty() {
            return None;
        }
        self.assembly
            .as_deref()
            .filter(|a| !a.is_empty())
            .map(|assembly| format!("{}, {}", self.type_name, assembly))
    }
}

/// Fuzzy equality of two message type strings.
pub fn fuzzy_match(left: &str, right: &str) -> bool {
    match (
        MessageTypeName::parse(left).normalized(),
        MessageTypeName::parse(right).normalized(),
    ) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Immutable lookup table of associations, built once at startup and handed
/// to the dispatcher and store. There is deliberately no mutation API.
#[derive(Debug, Clone, Default)]
pub struct AssociationRegistry {
    entries: Vec<MessageAssociation>,
}

impl AssociationRegistry {
    pub fn builder() -> AssociationRegistryBuilder {
        AssociationRegistryBuilder {
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[MessageAssociation] {
        &self.entries
    }

    /// Perspectives registered for a message type, fuzzy-matched.
    pub fn perspectives_for(&self, message_type: &str) -> Vec<&MessageAssociation> {
        self.matching(message_type, AssociationType::Perspective)
    }

    /// Receptors registered for a message type, fuzzy-matched.
    pub fn receptors_for(&self, message_type: &str) -> Vec<&MessageAssociation> {
        self.matching(message_type, AssociationType::Receptor)
    }

    fn matching(
        &self,
        message_type: &str,
        association_type: AssociationType,
    ) -> Vec<&MessageAssociation> {
        self.entries
            .iter()
            .filter(|a| a.association_type == association_type)
            .filter(|a| fuzzy_match(&a.message_type, message_type))
            .collect()
    }
}

pub struct AssociationRegistryBuilder {
    entries: Vec<MessageAssociation>,
}

impl AssociationRegistryBuilder {
    pub fn association(mut self, association: MessageAssociation) -> Self {
        self.entries.push(association);
        self
    }

    pub fn perspective(
        self,
        message_type: impl Into<String>,
        target_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        self.association(MessageAssociation::perspective(
            message_type,
            target_name,
            service_name,
        ))
    }

    pub fn receptor(
        self,
        message_type: impl Into<String>,
        target_name: impl Into<String>,
        service_name: impl Into<String>,
    ) -> Self {
        self.association(MessageAssociation::receptor(
            message_type,
            target_name,
            service_name,
        ))
    }

    pub fn build(self) -> AssociationRegistry {
        AssociationRegistry {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_qualification_tokens() {
        let name =
            MessageTypeName::parse("T, A, Version=2.0.0.0, Culture=neutral, PublicKeyToken=abc");
        assert_eq!(name.type_name, "T");
        assert_eq!(name.assembly.as_deref(), Some("A"));
        assert_eq!(name.normalized().as_deref(), Some("T, A"));
    }

    #[test]
    fn versioned_and_bare_assembly_forms_match() {
        assert!(fuzzy_match(
            "T, A, Version=2.0.0.0, Culture=neutral, PublicKeyToken=abc",
            "T, A"
        ));
        assert!(fuzzy_match(
            "Orders.Created, Orders, Version=1.0.0.0",
            "Orders.Created, Orders, Version=3.1.0.0, Culture=neutral"
        ));
    }

    #[test]
    fn differing_assembly_never_matches() {
        assert!(!fuzzy_match("T, A", "T, B"));
        assert!(!fuzzy_match("T, A, Version=2.0.0.0", "T, B"));
    }

    #[test]
    fn bare_type_name_never_matches() {
        assert!(!fuzzy_match("T", "T"));
        assert!(!fuzzy_match("T", "T, A"));
        assert!(!fuzzy_match("T, A", "T"));
    }

    #[test]
    fn differing_type_name_never_matches() {
        assert!(!fuzzy_match("T, A", "U, A"));
    }

    #[test]
    fn registry_filters_by_association_type_and_match() {
        let registry = AssociationRegistry::builder()
            .perspective("ProductCreated, Inventory", "inventory-product", "inventory")
            .perspective("ProductCreated, Inventory", "inventory-stock", "inventory")
            .perspective("OrderPlaced, Orders", "order-summary", "orders")
            .receptor("ProductCreated, Inventory", "audit-receptor", "audit")
            .build();

        let hits = registry
            .perspectives_for("ProductCreated, Inventory, Version=9.0.0.0, Culture=neutral");
        assert_eq!(hits.len(), 2);

        let receptors = registry.receptors_for("ProductCreated, Inventory");
        assert_eq!(receptors.len(), 1);
        assert_eq!(receptors[0].target_name, "audit-receptor");

        assert!(registry.perspectives_for("ProductCreated, Catalog").is_empty());
        assert!(registry.perspectives_for("ProductCreated").is_empty());
    }
}
