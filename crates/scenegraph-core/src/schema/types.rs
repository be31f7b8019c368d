//! Primitive schema vocabulary: type kinds, value kinds and role references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three kinds of schema types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeKind {
    /// A typed value that can be owned by entities and relations.
    Attribute,
    /// An independent thing.
    Entity,
    /// A typed link between role players.
    Relation,
}

impl TypeKind {
    /// The root keyword for this kind in TypeQL.
    pub fn keyword(&self) -> &'static str {
        match self {
            TypeKind::Attribute => "attribute",
            TypeKind::Entity => "entity",
            TypeKind::Relation => "relation",
        }
    }

    /// Whether types of this kind can own attributes and play roles.
    pub fn is_thing(&self) -> bool {
        !matches!(self, TypeKind::Attribute)
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Value kind of an attribute type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// UTF-8 string.
    String,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Double,
    /// Boolean.
    Boolean,
    /// ISO-8601 date and time.
    Datetime,
    /// ISO-8601 calendar date.
    Date,
}

impl ValueKind {
    /// All value kinds in declaration order.
    pub const ALL: [ValueKind; 6] = [
        ValueKind::String,
        ValueKind::Long,
        ValueKind::Double,
        ValueKind::Boolean,
        ValueKind::Datetime,
        ValueKind::Date,
    ];

    /// Parse a loosely spelled value kind, accepting common aliases.
    pub fn parse_loose(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "str" | "string" | "text" => Some(ValueKind::String),
            "int" | "integer" | "long" => Some(ValueKind::Long),
            "float" | "double" | "decimal" => Some(ValueKind::Double),
            "bool" | "boolean" => Some(ValueKind::Boolean),
            "datetime" | "timestamp" => Some(ValueKind::Datetime),
            "date" => Some(ValueKind::Date),
            _ => None,
        }
    }

    /// The value keyword emitted in schema statements.
    pub fn typeql_name(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Long => "integer",
            ValueKind::Double => "double",
            ValueKind::Boolean => "boolean",
            ValueKind::Datetime => "datetime",
            ValueKind::Date => "date",
        }
    }

    /// Whether every value of this kind can be converted into `target`.
    ///
    /// Conversions into `String` always succeed. Numeric widening and
    /// narrowing are allowed; narrowing fails per value if the number is not
    /// integral. Parsing a string into another kind is allowed and fails per
    /// value when the text does not parse.
    pub fn can_convert_to(&self, target: ValueKind) -> bool {
        use ValueKind::*;
        if *self == target {
            return true;
        }
        match (self, target) {
            (_, String) => true,
            (Long, Double) | (Double, Long) => true,
            (Long, Boolean) | (Boolean, Long) => true,
            (Date, Datetime) | (Datetime, Date) => true,
            (String, _) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Long => "long",
            ValueKind::Double => "double",
            ValueKind::Boolean => "boolean",
            ValueKind::Datetime => "datetime",
            ValueKind::Date => "date",
        };
        f.write_str(name)
    }
}

/// A role scoped to the relation type that declares it, e.g. `on:subject`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleRef {
    /// Relation type declaring (or inheriting) the role.
    pub relation: String,
    /// Role name.
    pub role: String,
}

impl RoleRef {
    /// Create a new role reference.
    pub fn new(relation: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            role: role.into(),
        }
    }

    /// Parse `relation:role` notation.
    pub fn parse(scoped: &str) -> Option<Self> {
        let (relation, role) = scoped.split_once(':')?;
        let (relation, role) = (relation.trim(), role.trim());
        if relation.is_empty() || role.is_empty() || role.contains(':') {
            return None;
        }
        Some(Self::new(relation, role))
    }
}

impl fmt::Display for RoleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.relation, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kind_aliases() {
        assert_eq!(ValueKind::parse_loose("str"), Some(ValueKind::String));
        assert_eq!(ValueKind::parse_loose("INT"), Some(ValueKind::Long));
        assert_eq!(ValueKind::parse_loose("float"), Some(ValueKind::Double));
        assert_eq!(ValueKind::parse_loose("bool"), Some(ValueKind::Boolean));
        assert_eq!(ValueKind::parse_loose("datetime"), Some(ValueKind::Datetime));
        assert_eq!(ValueKind::parse_loose("blob"), None);
    }

    #[test]
    fn test_long_renders_as_integer() {
        assert_eq!(ValueKind::Long.typeql_name(), "integer");
        assert_eq!(ValueKind::Long.to_string(), "long");
    }

    #[test]
    fn test_conversion_table() {
        assert!(ValueKind::Long.can_convert_to(ValueKind::Double));
        assert!(ValueKind::Double.can_convert_to(ValueKind::String));
        assert!(ValueKind::String.can_convert_to(ValueKind::Long));
        assert!(!ValueKind::Boolean.can_convert_to(ValueKind::Date));
        assert!(!ValueKind::Datetime.can_convert_to(ValueKind::Double));
    }

    #[test]
    fn test_role_ref_parse() {
        let role = RoleRef::parse("on:subject").unwrap();
        assert_eq!(role, RoleRef::new("on", "subject"));
        assert_eq!(role.to_string(), "on:subject");
        assert!(RoleRef::parse("subject").is_none());
        assert!(RoleRef::parse("on:").is_none());
        assert!(RoleRef::parse("a:b:c").is_none());
    }
}
