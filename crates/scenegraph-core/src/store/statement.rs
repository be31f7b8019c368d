//! Data statements and the rows they return.

use super::StoreError;
use crate::schema::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Marks an instance written by a migration.
///
/// Re-running a migration step skips sources that already have a copy with
/// the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Hex fingerprint of the proposal that produced the copy.
    pub fingerprint: String,
    /// Instance the copy was made from.
    pub source_iid: String,
}

/// One role filled by an instance in a relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RolePlayer {
    /// Role name.
    pub role: String,
    /// Instance id of the player.
    pub player: String,
}

impl RolePlayer {
    /// Create a role player entry.
    pub fn new(role: impl Into<String>, player: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            player: player.into(),
        }
    }
}

/// A stored entity or relation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Store-assigned identifier.
    pub iid: String,
    /// Exact type of the instance.
    pub type_name: String,
    /// Attribute values by attribute type.
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<Value>>,
    /// Role players (relations only).
    #[serde(default)]
    pub role_players: Vec<RolePlayer>,
    /// Migration marker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Instance {
    /// Values held for an attribute.
    pub fn values(&self, attribute: &str) -> &[Value] {
        self.attributes
            .get(attribute)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether the instance holds at least one value for the attribute.
    pub fn has(&self, attribute: &str) -> bool {
        !self.values(attribute).is_empty()
    }

    /// Whether `iid` fills any role of this instance.
    pub fn is_played_by(&self, iid: &str) -> bool {
        self.role_players.iter().any(|rp| rp.player == iid)
    }
}

/// A data instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "statement", rename_all = "snake_case")]
pub enum DataStatement {
    /// Count instances of a type.
    CountInstances {
        type_name: String,
        include_subtypes: bool,
    },
    /// Read instances of a type.
    ReadInstances {
        type_name: String,
        include_subtypes: bool,
    },
    /// Read one instance by id.
    GetInstance { iid: String },
    /// Read every instance holding a value of the attribute.
    ReadOwners { attribute: String },
    /// Read instances (optionally of a type and its subtypes) holding a value.
    FindByAttribute {
        type_name: Option<String>,
        attribute: String,
        value: Value,
    },
    /// Read instances of a type written by the migration with this fingerprint.
    FindMigrated {
        fingerprint: String,
        type_name: String,
    },
    /// Insert an instance. Returns its id.
    InsertInstance {
        type_name: String,
        attributes: BTreeMap<String, Vec<Value>>,
        role_players: Vec<RolePlayer>,
        provenance: Option<Provenance>,
    },
    /// Replace the values an instance holds for an attribute.
    PutAttribute {
        iid: String,
        attribute: String,
        values: Vec<Value>,
    },
    /// Drop every value an instance holds for an attribute.
    RemoveAttribute { iid: String, attribute: String },
    /// Delete an instance, detaching it from relations it plays in.
    DeleteInstance { iid: String },
    /// Swap a role player in every relation it participates in.
    ReplaceRolePlayer { from: String, to: String },
    /// Delete every instance holding the value.
    DeleteByAttribute { attribute: String, value: Value },
}

impl DataStatement {
    /// Whether the statement only reads.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            DataStatement::CountInstances { .. }
                | DataStatement::ReadInstances { .. }
                | DataStatement::GetInstance { .. }
                | DataStatement::ReadOwners { .. }
                | DataStatement::FindByAttribute { .. }
                | DataStatement::FindMigrated { .. }
        )
    }
}

impl fmt::Display for DataStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let isa = |subtypes: &bool| if *subtypes { "isa" } else { "isa!" };
        match self {
            DataStatement::CountInstances {
                type_name,
                include_subtypes,
            } => write!(
                f,
                "match $x {} {type_name}; reduce $count = count;",
                isa(include_subtypes)
            ),
            DataStatement::ReadInstances {
                type_name,
                include_subtypes,
            } => write!(f, "match $x {} {type_name}; fetch $x;", isa(include_subtypes)),
            DataStatement::GetInstance { iid } => write!(f, "match $x iid {iid}; fetch $x;"),
            DataStatement::ReadOwners { attribute } => {
                write!(f, "match $x has {attribute} $v; fetch $x;")
            }
            DataStatement::FindByAttribute {
                type_name,
                attribute,
                value,
            } => match type_name {
                Some(t) => write!(f, "match $x isa {t}, has {attribute} {value:?}; fetch $x;"),
                None => write!(f, "match $x has {attribute} {value:?}; fetch $x;"),
            },
            DataStatement::FindMigrated {
                fingerprint,
                type_name,
            } => write!(f, "match $x isa! {type_name}, migrated-by {fingerprint}; fetch $x;"),
            DataStatement::InsertInstance { type_name, .. } => {
                write!(f, "insert $x isa {type_name};")
            }
            DataStatement::PutAttribute {
                iid, attribute, ..
            } => write!(f, "match $x iid {iid}; put $x has {attribute};"),
            DataStatement::RemoveAttribute { iid, attribute } => {
                write!(f, "match $x iid {iid}, has {attribute} $v; delete $v of $x;")
            }
            DataStatement::DeleteInstance { iid } => write!(f, "match $x iid {iid}; delete $x;"),
            DataStatement::ReplaceRolePlayer { from, to } => write!(
                f,
                "match $r links ($role: $old); $old iid {from}; $new iid {to}; \
                 delete links ($role: $old) of $r; insert $r links ($role: $new);"
            ),
            DataStatement::DeleteByAttribute { attribute, value } => {
                write!(f, "match $x has {attribute} {value:?}; delete $x;")
            }
        }
    }
}

/// Rows returned by a data statement.
#[derive(Debug, Clone, PartialEq)]
pub enum DataRows {
    /// A count.
    Count(u64),
    /// Matched instances.
    Instances(Vec<Instance>),
    /// Id of an inserted instance.
    Inserted(String),
    /// Number of instances affected by a write.
    Affected(u64),
}

impl DataRows {
    /// Interpret as a count.
    pub fn into_count(self) -> Result<u64, StoreError> {
        match self {
            DataRows::Count(n) | DataRows::Affected(n) => Ok(n),
            DataRows::Instances(rows) => Ok(rows.len() as u64),
            DataRows::Inserted(_) => Err(StoreError::UnexpectedRows {
                statement: "count".to_string(),
            }),
        }
    }

    /// Interpret as matched instances.
    pub fn into_instances(self) -> Result<Vec<Instance>, StoreError> {
        match self {
            DataRows::Instances(rows) => Ok(rows),
            _ => Err(StoreError::UnexpectedRows {
                statement: "read".to_string(),
            }),
        }
    }

    /// Interpret as the id of an inserted instance.
    pub fn into_inserted(self) -> Result<String, StoreError> {
        match self {
            DataRows::Inserted(iid) => Ok(iid),
            _ => Err(StoreError::UnexpectedRows {
                statement: "insert".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_interpretation() {
        assert_eq!(DataRows::Count(3).into_count().unwrap(), 3);
        assert_eq!(DataRows::Instances(vec![]).into_count().unwrap(), 0);
        assert!(DataRows::Count(1).into_instances().is_err());
        assert_eq!(
            DataRows::Inserted("0x01".into()).into_inserted().unwrap(),
            "0x01"
        );
    }

    #[test]
    fn test_statement_rendering() {
        let stmt = DataStatement::CountInstances {
            type_name: "gadget".into(),
            include_subtypes: false,
        };
        assert_eq!(stmt.to_string(), "match $x isa! gadget; reduce $count = count;");
        assert!(stmt.is_read());
        assert!(!DataStatement::DeleteInstance { iid: "0x1".into() }.is_read());
    }
}
