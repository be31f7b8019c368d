//! Starter schema for scene graphs.

use super::{ChangeProposal, NewRelationType};
use crate::schema::{AttributeTypeDef, EntityTypeDef, RelationTypeDef, RoleRef, ValueKind};

/// Attributes every physical object carries.
pub const BASE_ATTRIBUTES: [&str; 7] = [
    "name",
    "color",
    "material",
    "shape",
    "size",
    "position_description",
    "scene_id",
];

/// Root entity type of the scene vocabulary.
pub const PHYSICAL_OBJECT: &str = "physical_object";

/// Root relation type of the scene vocabulary.
pub const SPATIAL_RELATION: &str = "spatial_relation";

const SPATIAL_SUBRELATIONS: [&str; 7] = [
    "on",
    "under",
    "next_to",
    "in_front_of",
    "behind",
    "inside",
    "contains",
];

/// The base scene schema, expressed as an ordinary proposal.
pub fn base_schema_proposal() -> ChangeProposal {
    let mut proposal = ChangeProposal::new();
    for attribute in BASE_ATTRIBUTES {
        proposal = proposal.with_attribute(AttributeTypeDef::new(attribute, ValueKind::String));
    }

    let mut object = EntityTypeDef::new(PHYSICAL_OBJECT)
        .with_plays(RoleRef::new(SPATIAL_RELATION, "subject"))
        .with_plays(RoleRef::new(SPATIAL_RELATION, "reference"));
    for attribute in BASE_ATTRIBUTES {
        object = object.with_owns(attribute);
    }
    proposal = proposal.with_entity(object);

    proposal = proposal.with_relation_players(NewRelationType::new(
        RelationTypeDef::new(SPATIAL_RELATION)
            .with_relates("subject")
            .with_relates("reference"),
    ));
    for relation in SPATIAL_SUBRELATIONS {
        proposal =
            proposal.with_relation(RelationTypeDef::new(relation).with_supertype(SPATIAL_RELATION));
    }
    proposal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_proposal_is_valid() {
        let proposal = base_schema_proposal();
        proposal.validate().unwrap();
        assert_eq!(proposal.new_attribute_types.len(), 7);
        assert_eq!(proposal.new_entity_types.len(), 1);
        assert_eq!(proposal.new_relation_types.len(), 8);
        assert!(proposal.new_entity_types[0].owns.contains("scene_id"));
    }
}
