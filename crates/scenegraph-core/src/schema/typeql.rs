//! TypeQL rendering and identifier hygiene.

use super::definition::TypeDef;
use super::state::SchemaState;
use super::statement::SchemaStatement;
use std::borrow::Cow;

/// Reserved words that cannot be used as type names, with their replacements.
pub const RESERVED_RENAMES: &[(&str, &str)] = &[
    ("in", "contained_in"),
    ("or", "logical_or"),
    ("and", "logical_and"),
    ("not", "logical_not"),
    ("match", "pattern_match"),
    ("define", "schema_define"),
    ("undefine", "schema_undefine"),
    ("redefine", "schema_redefine"),
    ("insert", "data_insert"),
    ("delete", "data_delete"),
];

/// Root type names that mean "no supertype".
pub const ROOT_TYPES: &[&str] = &["thing", "entity", "relation", "attribute"];

/// Replace a reserved keyword with its safe alias.
pub fn sanitize_name(name: &str) -> Cow<'_, str> {
    let lowered = name.to_ascii_lowercase();
    RESERVED_RENAMES
        .iter()
        .find(|(reserved, _)| *reserved == lowered)
        .map(|(_, replacement)| Cow::Borrowed(*replacement))
        .unwrap_or(Cow::Borrowed(name))
}

/// Whether a name is a legal type or role identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !RESERVED_RENAMES
            .iter()
            .any(|(reserved, _)| reserved.eq_ignore_ascii_case(name))
}

/// Whether a name refers to one of the built-in root types.
pub fn is_root_type(name: &str) -> bool {
    ROOT_TYPES.iter().any(|root| root.eq_ignore_ascii_case(name))
}

/// The body of a type declaration, without the trailing semicolon.
pub fn type_clause(def: &TypeDef) -> String {
    let mut head = format!("{} {}", def.kind().keyword(), def.name());
    if let Some(supertype) = def.supertype() {
        head.push_str(&format!(" sub {supertype}"));
    }
    let mut parts = vec![head];
    if let TypeDef::Attribute(attribute) = def {
        parts.push(format!("value {}", attribute.value_kind.typeql_name()));
    }
    parts.extend(def.relates().iter().map(|role| format!("relates {role}")));
    parts.extend(def.owns().iter().map(|attr| format!("owns {attr}")));
    parts.extend(def.plays().iter().map(|role| format!("plays {role}")));
    parts.join(",\n    ")
}

/// Render one schema statement.
pub fn render_statement(statement: &SchemaStatement) -> String {
    match statement {
        SchemaStatement::DefineType {
            definition,
            owned_by,
            played_by,
        } => {
            let mut out = format!("define\n  {};", type_clause(definition));
            for owner in owned_by {
                out.push_str(&format!("\n  {owner} owns {};", definition.name()));
            }
            for (player, role) in played_by {
                out.push_str(&format!(
                    "\n  {player} plays {}:{role};",
                    definition.name()
                ));
            }
            out
        }
        SchemaStatement::AddOwns { owner, attribute } => {
            format!("define\n  {owner} owns {attribute};")
        }
        SchemaStatement::AddPlays { player, role } => format!("define\n  {player} plays {role};"),
        SchemaStatement::AddRelates { relation, role } => {
            format!("define\n  {relation} relates {role};")
        }
        SchemaStatement::SetSupertype {
            name,
            supertype: Some(supertype),
            ..
        } => format!("redefine\n  {name} sub {supertype};"),
        SchemaStatement::SetSupertype {
            name,
            supertype: None,
            previous,
        } => match previous {
            Some(previous) => format!("undefine\n  sub {previous} from {name};"),
            None => format!("redefine\n  {name};"),
        },
        SchemaStatement::SetValueKind {
            attribute,
            value_kind,
            ..
        } => format!(
            "redefine\n  attribute {attribute} value {};",
            value_kind.typeql_name()
        ),
        SchemaStatement::RemoveOwns { owner, attribute } => {
            format!("undefine\n  owns {attribute} from {owner};")
        }
        SchemaStatement::RemovePlays { player, role } => {
            format!("undefine\n  plays {role} from {player};")
        }
        SchemaStatement::RemoveRelates { relation, role } => {
            format!("undefine\n  relates {role} from {relation};")
        }
        SchemaStatement::UndefineType { definition } => {
            format!("undefine\n  {};", definition.name())
        }
    }
}

/// Render a whole schema as a single define block.
pub fn render_schema(schema: &SchemaState) -> String {
    let mut out = String::from("define");
    for def in schema.ordered_definitions() {
        out.push_str("\n\n  ");
        out.push_str(&type_clause(def));
        out.push(';');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeTypeDef, EntityTypeDef, RoleRef, ValueKind};

    #[test]
    fn test_sanitize_reserved_words() {
        assert_eq!(sanitize_name("in"), "contained_in");
        assert_eq!(sanitize_name("Match"), "pattern_match");
        assert_eq!(sanitize_name("chair"), "chair");
    }

    #[test]
    fn test_identifier_rules() {
        assert!(is_valid_identifier("next_to"));
        assert!(is_valid_identifier("in-front-of"));
        assert!(!is_valid_identifier("3d_model"));
        assert!(!is_valid_identifier("has space"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("define"));
    }

    #[test]
    fn test_render_define_with_grants() {
        let stmt = SchemaStatement::DefineType {
            definition: AttributeTypeDef::new("size__double", ValueKind::Double).into(),
            owned_by: ["chair".to_string()].into(),
            played_by: Default::default(),
        };
        let text = stmt.to_typeql();
        assert!(text.contains("attribute size__double,\n    value double;"));
        assert!(text.contains("chair owns size__double;"));
    }

    #[test]
    fn test_render_entity_clause() {
        let def: TypeDef = EntityTypeDef::new("lamp")
            .with_supertype("physical_object")
            .with_owns("color")
            .with_plays(RoleRef::new("on", "subject"))
            .into();
        assert_eq!(
            type_clause(&def),
            "entity lamp,\n    sub physical_object,\n    owns color,\n    plays on:subject"
        );
    }

    #[test]
    fn test_render_removals() {
        let stmt = SchemaStatement::RemovePlays {
            player: "lamp".into(),
            role: RoleRef::new("on", "subject"),
        };
        assert_eq!(stmt.to_typeql(), "undefine\n  plays on:subject from lamp;");
    }
}
