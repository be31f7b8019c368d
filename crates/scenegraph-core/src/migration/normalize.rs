//! Proposal normalization.
//!
//! Turns a [`ChangeProposal`] into the changes that must actually happen
//! against a given [`SchemaState`]. Requests the schema already satisfies are
//! dropped, so normalizing the proposal of a committed plan yields nothing.

use super::error::MigrationError;
use crate::proposal::{ChangeProposal, Retype, TypeModification};
use crate::schema::{RoleRef, SchemaState, TypeDef, TypeKind, ValueKind};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// How a requested change relates to the current schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    /// Nothing to do.
    AlreadySatisfied,
    /// Adds to the schema without touching existing data.
    Additive,
    /// Changes or removes existing definitions or data.
    Modifying,
}

/// One change that must be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// Define a new type. Inherited owns, plays and relates are already trimmed.
    DefineType { definition: TypeDef },
    /// Grant an existing type ownership of an attribute.
    AddOwns { owner: String, attribute: String },
    /// Grant an existing type a role.
    AddPlays { player: String, role: RoleRef },
    /// Declare a new role on an existing relation.
    AddRelates { relation: String, role: String },
    /// Move an existing type under a different supertype.
    SetSupertype {
        name: String,
        supertype: Option<String>,
        previous: Option<String>,
    },
    /// Change an attribute's value kind through a shadow attribute.
    ChangeValueKind {
        attribute: String,
        from: ValueKind,
        to: ValueKind,
        shadow: String,
        owners: Vec<String>,
    },
    /// Move a type, its instances and its subtypes to a new type.
    Reclassify {
        from: TypeDef,
        into: TypeDef,
        subtypes: Vec<String>,
        /// Direct players of the old relation's roles.
        players: Vec<(String, RoleRef)>,
    },
    /// Remove a type, detaching whatever references it.
    RemoveType {
        definition: TypeDef,
        detach_owners: Vec<String>,
        detach_players: Vec<(String, RoleRef)>,
    },
}

impl Change {
    /// Classification of the change.
    pub fn class(&self) -> ChangeClass {
        match self {
            Change::DefineType { .. }
            | Change::AddOwns { .. }
            | Change::AddPlays { .. }
            | Change::AddRelates { .. } => ChangeClass::Additive,
            Change::SetSupertype { .. }
            | Change::ChangeValueKind { .. }
            | Change::Reclassify { .. }
            | Change::RemoveType { .. } => ChangeClass::Modifying,
        }
    }

    /// Type the change is about.
    pub fn subject(&self) -> &str {
        match self {
            Change::DefineType { definition } | Change::RemoveType { definition, .. } => {
                definition.name()
            }
            Change::AddOwns { owner, .. } => owner,
            Change::AddPlays { player, .. } => player,
            Change::AddRelates { relation, .. } => relation,
            Change::SetSupertype { name, .. } => name,
            Change::ChangeValueKind { attribute, .. } => attribute,
            Change::Reclassify { from, .. } => from.name(),
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::DefineType { definition } => {
                write!(f, "define {} {}", definition.kind(), definition.name())
            }
            Change::AddOwns { owner, attribute } => write!(f, "{owner} owns {attribute}"),
            Change::AddPlays { player, role } => write!(f, "{player} plays {role}"),
            Change::AddRelates { relation, role } => write!(f, "{relation} relates {role}"),
            Change::SetSupertype {
                name, supertype, ..
            } => match supertype {
                Some(s) => write!(f, "{name} sub {s}"),
                None => write!(f, "{name} sub (root)"),
            },
            Change::ChangeValueKind {
                attribute,
                from,
                to,
                ..
            } => write!(f, "{attribute} value {from} -> {to}"),
            Change::Reclassify { from, into, .. } => {
                write!(f, "reclassify {} -> {}", from.name(), into.name())
            }
            Change::RemoveType { definition, .. } => write!(f, "remove {}", definition.name()),
        }
    }
}

/// A requested change dropped during normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedChange {
    /// Type the request was about.
    pub subject: String,
    /// Why it was dropped.
    pub reason: String,
}

impl fmt::Display for SkippedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.reason)
    }
}

/// The deduplicated changes a proposal requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedChangeSet {
    /// Changes that must happen.
    pub changes: Vec<Change>,
    /// Requests the schema already satisfies.
    pub skipped: Vec<SkippedChange>,
    /// Requests that were ignored for another reason.
    pub warnings: Vec<String>,
}

impl NormalizedChangeSet {
    /// Whether nothing must happen.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    fn skip(&mut self, subject: &str, reason: impl Into<String>) {
        self.skipped.push(SkippedChange {
            subject: subject.to_string(),
            reason: reason.into(),
        });
    }

    fn push(&mut self, emitted: &mut BTreeSet<String>, change: Change) {
        if emitted.insert(change.to_string()) {
            self.changes.push(change);
        }
    }
}

/// Validates and deduplicates proposals against a schema.
pub struct ProposalNormalizer;

impl ProposalNormalizer {
    /// Normalize `proposal` against `state`.
    ///
    /// Fails with no side effects on malformed proposals, kind collisions,
    /// supertype cycles and unresolvable references.
    pub fn normalize(
        state: &SchemaState,
        proposal: &ChangeProposal,
    ) -> Result<NormalizedChangeSet, MigrationError> {
        proposal.validate()?;
        let view = View::build(state, proposal)?;
        view.check_cycles()?;

        let mut out = NormalizedChangeSet::default();
        let mut emitted = BTreeSet::new();
        view.normalize_definitions(proposal, &mut out, &mut emitted)?;
        for modification in &proposal.modified_types {
            view.normalize_modification(modification, &mut out, &mut emitted)?;
        }
        view.normalize_removals(proposal, &mut out)?;

        debug!(
            changes = out.changes.len(),
            skipped = out.skipped.len(),
            warnings = out.warnings.len(),
            "normalized proposal"
        );
        Ok(out)
    }
}

/// Reclassification recorded while building the view.
struct Reclassification {
    into: String,
    into_exists: bool,
}

/// The schema as it will look once the proposal is applied.
struct View<'a> {
    state: &'a SchemaState,
    removed: &'a BTreeSet<String>,
    /// Requested definitions, including reclassification targets.
    proposed: BTreeMap<String, TypeDef>,
    /// Players per relation role requested for new relations.
    role_players: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// Reclassified type -> its replacement.
    reclassified: BTreeMap<String, Reclassification>,
}

impl<'a> View<'a> {
    fn build(state: &'a SchemaState, proposal: &'a ChangeProposal) -> Result<Self, MigrationError> {
        let removed = &proposal.removed_types;
        let mut view = Self {
            state,
            removed,
            proposed: BTreeMap::new(),
            role_players: BTreeMap::new(),
            reclassified: BTreeMap::new(),
        };

        let requested = proposal
            .new_attribute_types
            .iter()
            .cloned()
            .map(TypeDef::from)
            .chain(proposal.new_entity_types.iter().cloned().map(TypeDef::from))
            .chain(
                proposal
                    .new_relation_types
                    .iter()
                    .map(|r| TypeDef::from(r.definition.clone())),
            );
        for def in requested {
            view.check_registry(def.name(), def.kind())?;
            view.proposed.insert(def.name().to_string(), def);
        }
        for relation in &proposal.new_relation_types {
            if !relation.role_players.is_empty() {
                view.role_players.insert(
                    relation.definition.name.clone(),
                    relation.role_players.clone(),
                );
            }
        }

        for modification in &proposal.modified_types {
            view.fold_modification(modification)?;
        }
        Ok(view)
    }

    /// A name may only be used by one kind at a time.
    fn check_registry(&self, name: &str, requested: TypeKind) -> Result<(), MigrationError> {
        let existing = match self.proposed.get(name) {
            Some(def) => Some(def.kind()),
            None => self.live(name).map(TypeDef::kind),
        };
        match existing {
            Some(existing) if existing != requested => Err(MigrationError::NameConflict {
                name: name.to_string(),
                existing,
                requested,
            }),
            _ => Ok(()),
        }
    }

    /// Record the parts of a modification other requests may depend on.
    fn fold_modification(&mut self, modification: &TypeModification) -> Result<(), MigrationError> {
        let name = modification.name.as_str();
        if let Some(def) = self.proposed.get_mut(name) {
            // Modifying a type defined in the same proposal folds into its definition.
            match &modification.retype {
                Some(Retype::Reclassify { .. }) => {
                    return Err(MigrationError::validation(format!(
                        "type {name} is defined and reclassified in the same proposal"
                    )));
                }
                Some(Retype::ValueKind(kind)) => match def {
                    TypeDef::Attribute(a) => a.value_kind = *kind,
                    _ => return Err(not_an_attribute(name)),
                },
                None => {}
            }
            if let Some(owns) = def.owns_mut() {
                owns.extend(modification.add_owns.iter().cloned());
            }
            if let Some(plays) = def.plays_mut() {
                plays.extend(modification.add_plays.iter().cloned());
            }
            return Ok(());
        }

        let Some(Retype::Reclassify { into, supertype }) = &modification.retype else {
            return Ok(());
        };
        let Some(current) = self.live(name) else {
            // Handled (or rejected) when the modification is normalized.
            return Ok(());
        };
        if !current.kind().is_thing() {
            return Err(MigrationError::validation(format!(
                "attribute type {name} cannot be reclassified; change its value kind instead"
            )));
        }
        self.check_registry(into, current.kind())?;
        if self.proposed.contains_key(into) {
            return Err(MigrationError::conflict(format!(
                "{into} is both defined and used as the reclassification target of {name}"
            )));
        }

        let into_existing = self.live(into);
        let target_supertype = match into_existing {
            Some(existing) => {
                if let Some(requested) = supertype {
                    if existing.supertype() != Some(requested.as_str()) {
                        return Err(MigrationError::conflict(format!(
                            "cannot move existing type {into} under {requested} while reclassifying {name} into it"
                        )));
                    }
                }
                existing.supertype().map(str::to_string)
            }
            None => supertype
                .clone()
                .or_else(|| current.supertype().map(str::to_string)),
        };

        let mut definition = current.renamed(into.clone());
        definition.set_supertype(target_supertype);
        if let Some(owns) = definition.owns_mut() {
            *owns = self.state.effective_attributes_of(name)?;
        }
        if let Some(plays) = definition.plays_mut() {
            *plays = self.state.effective_roles_of(name)?;
        }
        if let TypeDef::Relation(r) = &mut definition {
            r.relates = self.state.effective_relates_of(name)?;
        }
        if let Some(owns) = definition.owns_mut() {
            owns.extend(modification.add_owns.iter().cloned());
        }
        if let Some(plays) = definition.plays_mut() {
            // A relation's own roles move with it.
            plays.retain(|r| r.relation != name);
            plays.extend(modification.add_plays.iter().cloned());
        }
        self.proposed.insert(into.clone(), definition);
        self.reclassified.insert(
            name.to_string(),
            Reclassification {
                into: into.clone(),
                into_exists: into_existing.is_some(),
            },
        );
        Ok(())
    }

    /// A type of the current schema that survives the proposal.
    fn live(&self, name: &str) -> Option<&'a TypeDef> {
        if self.removed.contains(name) || self.reclassified.contains_key(name) {
            None
        } else {
            self.state.get(name)
        }
    }

    /// Whether `requested` may stand in for `existing`'s supertype without a move.
    fn compatible_supertype(&self, existing: &TypeDef, requested: Option<&str>) -> bool {
        match (requested, existing.supertype()) {
            (None, _) => true,
            (Some(requested), Some(current)) => {
                requested == current || self.state.is_subtype_of(current, requested)
            }
            (Some(_), None) => false,
        }
    }

    /// Definition of `name` once the proposal is applied.
    fn definition(&self, name: &str) -> Option<Cow<'_, TypeDef>> {
        let mut def = match (self.proposed.get(name), self.live(name)) {
            (Some(requested), Some(existing)) if requested.kind() == existing.kind() => {
                let mut merged = existing.clone();
                merged.absorb(requested);
                if !self.compatible_supertype(existing, requested.supertype()) {
                    merged.set_supertype(requested.supertype().map(str::to_string));
                }
                Cow::Owned(merged)
            }
            (Some(requested), _) => Cow::Borrowed(requested),
            (None, Some(existing)) => Cow::Borrowed(existing),
            (None, None) => return None,
        };
        if let Some(moved) = def
            .supertype()
            .and_then(|s| self.reclassified.get(s))
            .map(|r| r.into.clone())
        {
            def.to_mut().set_supertype(Some(moved));
        }
        Some(def)
    }

    fn kind_of(&self, name: &str) -> Option<TypeKind> {
        self.definition(name).map(|def| def.kind())
    }

    /// `name` followed by its ancestors. Stops at a repeated name.
    fn lineage(&self, name: &str) -> Vec<Cow<'_, TypeDef>> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut next = Some(name.to_string());
        while let Some(current) = next.take() {
            if !seen.insert(current.clone()) {
                break;
            }
            if let Some(def) = self.definition(&current) {
                next = def.supertype().map(str::to_string);
                out.push(def);
            }
        }
        out
    }

    fn effective_owns(&self, name: &str) -> BTreeSet<String> {
        self.lineage(name)
            .iter()
            .flat_map(|def| def.owns().iter().cloned())
            .collect()
    }

    fn effective_plays(&self, name: &str) -> BTreeSet<RoleRef> {
        self.lineage(name)
            .iter()
            .flat_map(|def| def.plays().iter().cloned())
            .collect()
    }

    fn effective_relates(&self, name: &str) -> BTreeSet<String> {
        self.lineage(name)
            .iter()
            .flat_map(|def| def.relates().iter().cloned())
            .collect()
    }

    /// What a definition inherits from its supertype.
    fn inherited(&self, supertype: Option<&str>) -> Inherited {
        match supertype {
            Some(s) => Inherited {
                owns: self.effective_owns(s),
                plays: self.effective_plays(s),
                relates: self.effective_relates(s),
            },
            None => Inherited::default(),
        }
    }

    fn declares_role(&self, role: &RoleRef) -> bool {
        self.kind_of(&role.relation) == Some(TypeKind::Relation)
            && self.effective_relates(&role.relation).contains(&role.role)
    }

    fn is_subtype_of(&self, name: &str, ancestor: &str) -> bool {
        self.lineage(name).iter().any(|def| def.name() == ancestor)
    }

    /// Reject supertype cycles among the requested definitions.
    fn check_cycles(&self) -> Result<(), MigrationError> {
        for name in self.proposed.keys() {
            let mut path = vec![name.clone()];
            let mut next = self
                .definition(name)
                .and_then(|def| def.supertype().map(str::to_string));
            while let Some(current) = next.take() {
                if let Some(start) = path.iter().position(|n| *n == current) {
                    let mut cycle = path.split_off(start);
                    cycle.push(current);
                    return Err(MigrationError::SupertypeCycle { types: cycle });
                }
                next = self
                    .definition(&current)
                    .and_then(|def| def.supertype().map(str::to_string));
                path.push(current);
            }
        }
        Ok(())
    }

    /// Check that a requested definition only references things that will exist.
    fn check_references(&self, def: &TypeDef) -> Result<(), MigrationError> {
        let name = def.name();
        if let Some(supertype) = def.supertype() {
            match self.kind_of(supertype) {
                None => {
                    return Err(MigrationError::MissingSupertype {
                        name: name.to_string(),
                        supertype: supertype.to_string(),
                    })
                }
                Some(kind) if kind != def.kind() => {
                    return Err(MigrationError::conflict(format!(
                        "{} {name} cannot sub {kind} {supertype}",
                        def.kind()
                    )))
                }
                Some(_) => {}
            }
        }
        for attribute in def.owns() {
            self.check_attribute(name, attribute)?;
        }
        for role in def.plays() {
            self.check_role(name, role)?;
        }
        Ok(())
    }

    fn check_attribute(&self, owner: &str, attribute: &str) -> Result<(), MigrationError> {
        match self.kind_of(attribute) {
            Some(TypeKind::Attribute) => Ok(()),
            Some(kind) => Err(MigrationError::conflict(format!(
                "{owner} cannot own {attribute}, which is {kind} type"
            ))),
            None => Err(MigrationError::dependency(format!(
                "{owner} owns {attribute}, which is not defined"
            ))),
        }
    }

    fn check_role(&self, player: &str, role: &RoleRef) -> Result<(), MigrationError> {
        if self.declares_role(role) {
            Ok(())
        } else {
            Err(MigrationError::dependency(format!(
                "{player} plays {role}, which is not declared"
            )))
        }
    }

    fn check_player(&self, relation: &str, player: &str) -> Result<(), MigrationError> {
        match self.kind_of(player) {
            Some(kind) if kind.is_thing() => Ok(()),
            Some(kind) => Err(MigrationError::conflict(format!(
                "{kind} type {player} cannot play a role of {relation}"
            ))),
            None => Err(MigrationError::dependency(format!(
                "player {player} of {relation} is not defined"
            ))),
        }
    }

    fn normalize_definitions(
        &self,
        proposal: &ChangeProposal,
        out: &mut NormalizedChangeSet,
        emitted: &mut BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        let names: Vec<&str> = proposal.defined_names().collect();
        for name in names {
            let Some(requested) = self.proposed.get(name) else {
                continue;
            };
            self.check_references(requested)?;
            match self.live(name) {
                Some(existing) => self.extend_existing(existing, requested, out, emitted)?,
                None => {
                    let definition = self.trimmed(requested);
                    out.push(emitted, Change::DefineType { definition });
                }
            }
            self.normalize_role_players(name, out, emitted)?;
        }
        Ok(())
    }

    /// Drop what a requested definition would inherit anyway.
    fn trimmed(&self, requested: &TypeDef) -> TypeDef {
        let mut def = requested.clone();
        let inherited = self.inherited(requested.supertype());
        if let Some(owns) = def.owns_mut() {
            owns.retain(|a| !inherited.owns.contains(a));
        }
        if let Some(plays) = def.plays_mut() {
            plays.retain(|r| !inherited.plays.contains(r));
        }
        if let TypeDef::Relation(r) = &mut def {
            r.relates.retain(|role| !inherited.relates.contains(role));
        }
        def
    }

    /// Extend a type that already exists with the same kind.
    fn extend_existing(
        &self,
        existing: &TypeDef,
        requested: &TypeDef,
        out: &mut NormalizedChangeSet,
        emitted: &mut BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        let name = existing.name();
        let before = out.changes.len();

        if let (Some(current), Some(wanted)) = (existing.value_kind(), requested.value_kind()) {
            if current != wanted {
                out.warnings.push(format!(
                    "attribute {name} already has value kind {current}; ignoring requested {wanted} (use a retype to change it)"
                ));
                return Ok(());
            }
        }

        let supertype = if self.compatible_supertype(existing, requested.supertype()) {
            existing.supertype().map(str::to_string)
        } else {
            let supertype = requested.supertype().map(str::to_string);
            out.push(
                emitted,
                Change::SetSupertype {
                    name: name.to_string(),
                    supertype: supertype.clone(),
                    previous: existing.supertype().map(str::to_string),
                },
            );
            supertype
        };

        let inherited = self.inherited(supertype.as_deref());
        for attribute in requested.owns() {
            if !existing.owns().contains(attribute) && !inherited.owns.contains(attribute) {
                out.push(
                    emitted,
                    Change::AddOwns {
                        owner: name.to_string(),
                        attribute: attribute.clone(),
                    },
                );
            }
        }
        for role in requested.plays() {
            if !existing.plays().contains(role) && !inherited.plays.contains(role) {
                out.push(
                    emitted,
                    Change::AddPlays {
                        player: name.to_string(),
                        role: role.clone(),
                    },
                );
            }
        }
        for role in requested.relates() {
            if !existing.relates().contains(role) && !inherited.relates.contains(role) {
                out.push(
                    emitted,
                    Change::AddRelates {
                        relation: name.to_string(),
                        role: role.clone(),
                    },
                );
            }
        }

        if out.changes.len() == before {
            out.skip(name, "already defined");
        }
        Ok(())
    }

    /// Grant the requested players the roles of a new (or extended) relation.
    fn normalize_role_players(
        &self,
        relation: &str,
        out: &mut NormalizedChangeSet,
        emitted: &mut BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        let Some(players) = self.role_players.get(relation) else {
            return Ok(());
        };
        for (role, names) in players {
            let role = RoleRef::new(relation, role.clone());
            if !self.declares_role(&role) {
                return Err(MigrationError::dependency(format!(
                    "{relation} does not relate {}",
                    role.role
                )));
            }
            for player in names {
                self.check_player(relation, player)?;
                let already = match self.live(player) {
                    Some(_) => self
                        .state
                        .effective_roles_of(player)
                        .is_ok_and(|roles| roles.contains(&role)),
                    None => false,
                };
                // New players declare the role in their own definition.
                let declared_by_proposal = self
                    .proposed
                    .get(player)
                    .is_some_and(|def| def.plays().contains(&role));
                if already || (declared_by_proposal && self.live(player).is_none()) {
                    continue;
                }
                out.push(
                    emitted,
                    Change::AddPlays {
                        player: player.clone(),
                        role: role.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    fn normalize_modification(
        &self,
        modification: &TypeModification,
        out: &mut NormalizedChangeSet,
        emitted: &mut BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        let name = modification.name.as_str();
        if self.proposed.contains_key(name) && !self.reclassified_into(name) {
            // Folded into the requested definition.
            return Ok(());
        }

        let Some(existing) = self.state.get(name).filter(|_| !self.removed.contains(name)) else {
            if let Some(Retype::Reclassify { into, .. }) = &modification.retype {
                if self.state.contains(into) {
                    out.skip(name, format!("already reclassified into {into}"));
                    return Ok(());
                }
            }
            return Err(MigrationError::dependency(format!(
                "cannot modify {name}, which is not defined"
            )));
        };

        let reclassifying = matches!(modification.retype, Some(Retype::Reclassify { .. }));
        if !reclassifying
            && (!modification.add_owns.is_empty() || !modification.add_plays.is_empty())
        {
            if !existing.kind().is_thing() {
                return Err(MigrationError::validation(format!(
                    "attribute type {name} cannot own attributes or play roles"
                )));
            }
            let owns = self.state.effective_attributes_of(name)?;
            let plays = self.state.effective_roles_of(name)?;
            let mut changed = false;
            for attribute in &modification.add_owns {
                self.check_attribute(name, attribute)?;
                if !owns.contains(attribute) {
                    changed = true;
                    out.push(
                        emitted,
                        Change::AddOwns {
                            owner: name.to_string(),
                            attribute: attribute.clone(),
                        },
                    );
                }
            }
            for role in &modification.add_plays {
                self.check_role(name, role)?;
                if !plays.contains(role) {
                    changed = true;
                    out.push(
                        emitted,
                        Change::AddPlays {
                            player: name.to_string(),
                            role: role.clone(),
                        },
                    );
                }
            }
            if !changed && modification.retype.is_none() {
                out.skip(name, "already owns and plays everything requested");
            }
        }

        match &modification.retype {
            None => Ok(()),
            Some(Retype::ValueKind(kind)) => self.normalize_value_kind(existing, *kind, out, emitted),
            Some(Retype::Reclassify { into, .. }) => self.normalize_reclassify(existing, into, out, emitted),
        }
    }

    fn reclassified_into(&self, name: &str) -> bool {
        self.reclassified.values().any(|r| r.into == name)
    }

    fn normalize_value_kind(
        &self,
        existing: &TypeDef,
        to: ValueKind,
        out: &mut NormalizedChangeSet,
        emitted: &mut BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        let name = existing.name();
        let Some(from) = existing.value_kind() else {
            return Err(not_an_attribute(name));
        };
        let shadow = shadow_name(name, to);
        let shadow_def = self.state.get(&shadow);
        if let Some(def) = shadow_def {
            if def.value_kind() != Some(to) {
                return Err(MigrationError::conflict(format!(
                    "cannot stage {name} values in {shadow}, which already exists as {}",
                    def.kind()
                )));
            }
        }
        if self.proposed.contains_key(&shadow) {
            return Err(MigrationError::conflict(format!(
                "{shadow} is reserved for converting {name}"
            )));
        }
        // An existing shadow means an earlier conversion was interrupted.
        if from == to && shadow_def.is_none() {
            out.skip(name, format!("already has value kind {to}"));
            return Ok(());
        }
        if !from.can_convert_to(to) {
            return Err(MigrationError::IncompatibleValueKind {
                attribute: name.to_string(),
                from,
                to,
            });
        }
        let subtypes = self.state.subtypes_of(name, false)?;
        if existing.supertype().is_some() || !subtypes.is_empty() {
            return Err(MigrationError::dependency(format!(
                "attribute {name} is part of a type hierarchy; its value kind cannot change on its own"
            )));
        }
        out.push(
            emitted,
            Change::ChangeValueKind {
                attribute: name.to_string(),
                from,
                to,
                shadow,
                owners: self.state.owners_of(name),
            },
        );
        Ok(())
    }

    fn normalize_reclassify(
        &self,
        existing: &TypeDef,
        into: &str,
        out: &mut NormalizedChangeSet,
        emitted: &mut BTreeSet<String>,
    ) -> Result<(), MigrationError> {
        let name = existing.name();
        let Some(requested) = self.proposed.get(into) else {
            return Err(MigrationError::validation(format!(
                "type {name} cannot be reclassified"
            )));
        };
        let into_exists = self
            .reclassified
            .get(name)
            .is_some_and(|r| r.into_exists);

        if let Some(supertype) = requested.supertype() {
            if self.is_subtype_of(supertype, into) || self.state.is_subtype_of(supertype, name) {
                return Err(MigrationError::dependency(format!(
                    "{into} cannot sub {supertype}, which descends from the reclassified type {name}"
                )));
            }
        }
        self.check_references(requested)?;

        let mut definition = self.trimmed(requested);
        if into_exists {
            if let Some(current) = self.state.get(into) {
                if let Some(owns) = definition.owns_mut() {
                    owns.retain(|a| !current.owns().contains(a));
                }
                if let Some(plays) = definition.plays_mut() {
                    plays.retain(|r| !current.plays().contains(r));
                }
                if let TypeDef::Relation(r) = &mut definition {
                    r.relates.retain(|role| !current.relates().contains(role));
                }
            }
        }

        let players = if existing.kind() == TypeKind::Relation {
            self.state.players_of(name)
        } else {
            Vec::new()
        };
        for (player, _) in &players {
            if self.removed.contains(player) {
                return Err(MigrationError::dependency(format!(
                    "{player} plays a role of {name} but is being removed"
                )));
            }
        }

        out.push(
            emitted,
            Change::Reclassify {
                from: existing.clone(),
                into: definition,
                subtypes: self.state.subtypes_of(name, false)?,
                players,
            },
        );
        Ok(())
    }

    fn normalize_removals(
        &self,
        proposal: &ChangeProposal,
        out: &mut NormalizedChangeSet,
    ) -> Result<(), MigrationError> {
        for name in &proposal.removed_types {
            let Some(existing) = self.state.get(name) else {
                out.skip(name, "already absent");
                continue;
            };
            if self.reclassified.contains_key(name) {
                return Err(MigrationError::validation(format!(
                    "type {name} is both removed and reclassified"
                )));
            }
            if let Some(requested) = self.proposed.get(name.as_str()) {
                if self.trimmed(requested) == *existing {
                    out.skip(name, "already replaced");
                    out.changes.retain(|c| {
                        !matches!(c, Change::DefineType { definition } if definition.name() == name.as_str())
                    });
                    continue;
                }
            }

            for subtype in self.state.subtypes_of(name, false)? {
                let moved = self
                    .definition(&subtype)
                    .is_some_and(|def| def.supertype() != Some(name.as_str()));
                if !self.removed.contains(&subtype) && !moved {
                    return Err(MigrationError::dependency(format!(
                        "cannot remove {name}: subtype {subtype} is kept"
                    )));
                }
            }

            let detach_owners = if existing.kind() == TypeKind::Attribute {
                self.state
                    .owners_of(name)
                    .into_iter()
                    .filter(|owner| !self.removed.contains(owner))
                    .collect()
            } else {
                Vec::new()
            };
            let detach_players = if existing.kind() == TypeKind::Relation {
                self.state
                    .players_of(name)
                    .into_iter()
                    .filter(|(player, _)| !self.removed.contains(player))
                    .collect()
            } else {
                Vec::new()
            };

            out.changes.push(Change::RemoveType {
                definition: existing.clone(),
                detach_owners,
                detach_players,
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct Inherited {
    owns: BTreeSet<String>,
    plays: BTreeSet<RoleRef>,
    relates: BTreeSet<String>,
}

fn not_an_attribute(name: &str) -> MigrationError {
    MigrationError::validation(format!(
        "only attribute types have a value kind, {name} is not one"
    ))
}

/// Name of the attribute that stages converted values of `attribute`.
pub fn shadow_name(attribute: &str, kind: ValueKind) -> String {
    format!("{attribute}__{kind}")
}
