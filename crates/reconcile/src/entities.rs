//! Entity kinds, their field schemas, and typed payload builders.
//!
//! Every kind shares the same behaviour; they differ only in type name and in
//! which fields a payload may carry. Payloads are checked against the schema
//! before anything is sent to the remote service, so a typo in a field name
//! fails locally instead of producing a remote validation error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{EntityPayload, Timestamp, ValueKind};
use crate::EntityRef;

/// Prefix of tenant-defined custom fields (e.g. `c_DeploymentKanban`).
pub const CUSTOM_FIELD_PREFIX: &str = "c_";

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// The entity types this workspace reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Top-level tenant container.
    Workspace,
    /// Team container; belongs to a workspace.
    Project,
    /// Named build pipeline; belongs to a project and a workspace.
    BuildDefinition,
    /// One build result; belongs to a build definition.
    Build,
    /// User story, addressed by its `FormattedID` (e.g. `US1`).
    HierarchicalRequirement,
}

impl EntityKind {
    /// All kinds, in dependency order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Workspace,
        EntityKind::Project,
        EntityKind::BuildDefinition,
        EntityKind::Build,
        EntityKind::HierarchicalRequirement,
    ];

    /// The service's type name, used in URLs and request envelopes.
    pub fn type_name(self) -> &'static str {
        match self {
            EntityKind::Workspace => "workspace",
            EntityKind::Project => "project",
            EntityKind::BuildDefinition => "builddefinition",
            EntityKind::Build => "build",
            EntityKind::HierarchicalRequirement => "hierarchicalrequirement",
        }
    }

    /// Field schema for payloads of this kind.
    pub fn schema(self) -> &'static [FieldSchema] {
        match self {
            EntityKind::Workspace => WORKSPACE_FIELDS,
            EntityKind::Project => PROJECT_FIELDS,
            EntityKind::BuildDefinition => BUILD_DEFINITION_FIELDS,
            EntityKind::Build => BUILD_FIELDS,
            EntityKind::HierarchicalRequirement => STORY_FIELDS,
        }
    }

    fn field(self, name: &str) -> Option<&'static FieldSchema> {
        self.schema().iter().find(|f| f.name == name)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = UnknownEntityKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        match lowered.as_str() {
            "userstory" | "story" => return Ok(EntityKind::HierarchicalRequirement),
            _ => {}
        }
        EntityKind::ALL
            .into_iter()
            .find(|k| k.type_name() == lowered)
            .ok_or_else(|| UnknownEntityKind(s.to_string()))
    }
}

/// Returned when parsing an unrecognised entity type name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown entity type: {0}")]
pub struct UnknownEntityKind(pub String);

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

/// One writable field of an entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSchema {
    /// Field name as the service spells it.
    pub name: &'static str,
    /// Accepted scalar kind.
    pub value_kind: ValueKind,
    /// Whether a create payload must carry this field.
    pub required: bool,
}

const fn field(name: &'static str, value_kind: ValueKind, required: bool) -> FieldSchema {
    FieldSchema {
        name,
        value_kind,
        required,
    }
}

const WORKSPACE_FIELDS: &[FieldSchema] = &[
    field("Name", ValueKind::String, true),
    field("Description", ValueKind::String, false),
    field("Notes", ValueKind::String, false),
    field("State", ValueKind::String, false),
];

const PROJECT_FIELDS: &[FieldSchema] = &[
    field("Name", ValueKind::String, true),
    field("Description", ValueKind::String, false),
    field("Notes", ValueKind::String, false),
    field("State", ValueKind::String, false),
    field("Workspace", ValueKind::Reference, false),
    field("Parent", ValueKind::Reference, false),
    field("Owner", ValueKind::Reference, false),
];

const BUILD_DEFINITION_FIELDS: &[FieldSchema] = &[
    field("Name", ValueKind::String, true),
    field("Description", ValueKind::String, false),
    field("Project", ValueKind::Reference, true),
    field("Workspace", ValueKind::Reference, false),
    field("Uri", ValueKind::String, false),
];

const BUILD_FIELDS: &[FieldSchema] = &[
    field("BuildDefinition", ValueKind::Reference, true),
    field("Duration", ValueKind::Number, false),
    field("Message", ValueKind::String, false),
    field("Number", ValueKind::String, true),
    field("Status", ValueKind::String, true),
    field("Start", ValueKind::String, false),
    field("Uri", ValueKind::String, false),
];

const STORY_FIELDS: &[FieldSchema] = &[
    field("Name", ValueKind::String, true),
    field("Description", ValueKind::String, false),
    field("Notes", ValueKind::String, false),
    field("ScheduleState", ValueKind::String, false),
    field("PlanEstimate", ValueKind::Number, false),
    field("Blocked", ValueKind::Boolean, false),
    field("BlockedReason", ValueKind::String, false),
    field("Ready", ValueKind::Boolean, false),
    field("Project", ValueKind::Reference, false),
    field("Workspace", ValueKind::Reference, false),
    field("Owner", ValueKind::Reference, false),
    field("Iteration", ValueKind::Reference, false),
    field("Release", ValueKind::Reference, false),
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A payload that does not fit its entity kind's schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The payload names a field the kind does not have.
    #[error("'{field}' is not a writable field of {kind}")]
    UnknownField {
        /// Entity kind being validated.
        kind: EntityKind,
        /// Offending field name.
        field: String,
    },

    /// The value's scalar kind does not match the schema.
    #[error("'{field}' of {kind} expects a {expected} value")]
    WrongType {
        /// Entity kind being validated.
        kind: EntityKind,
        /// Offending field name.
        field: String,
        /// What the schema accepts.
        expected: ValueKind,
    },

    /// A create payload is missing a required field.
    #[error("{kind} requires field '{field}'")]
    MissingField {
        /// Entity kind being validated.
        kind: EntityKind,
        /// Required field name.
        field: &'static str,
    },

    /// An update payload carries no fields.
    #[error("Update patch for {kind} is empty")]
    Empty {
        /// Entity kind being validated.
        kind: EntityKind,
    },

    /// An update target whose entity type cannot be read from its ref.
    #[error("Cannot determine the entity type of '{reference}'")]
    UntypedReference {
        /// The ref as given.
        reference: String,
    },
}

impl EntityPayload {
    /// Checks field names and value kinds, plus required fields for creation.
    pub fn validate_for_create(&self, kind: EntityKind) -> Result<(), PayloadError> {
        self.validate_fields(kind)?;
        if let Some(missing) = kind
            .schema()
            .iter()
            .find(|f| f.required && self.get(f.name).is_none())
        {
            return Err(PayloadError::MissingField {
                kind,
                field: missing.name,
            });
        }
        Ok(())
    }

    /// Checks field names and value kinds of a partial update.
    pub fn validate_for_update(&self, kind: EntityKind) -> Result<(), PayloadError> {
        if self.is_empty() {
            return Err(PayloadError::Empty { kind });
        }
        self.validate_fields(kind)
    }

    fn validate_fields(&self, kind: EntityKind) -> Result<(), PayloadError> {
        for (name, value) in self.fields() {
            if name.starts_with(CUSTOM_FIELD_PREFIX) && name.len() > CUSTOM_FIELD_PREFIX.len() {
                continue;
            }
            let schema = kind.field(name).ok_or_else(|| PayloadError::UnknownField {
                kind,
                field: name.to_string(),
            })?;
            if !schema.value_kind.accepts(value) {
                return Err(PayloadError::WrongType {
                    kind,
                    field: name.to_string(),
                    expected: schema.value_kind,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed builders
// ---------------------------------------------------------------------------

/// Desired state of a build definition.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildDefinitionSpec {
    pub name: String,
    pub description: String,
    pub project: EntityRef,
    pub workspace: EntityRef,
}

impl BuildDefinitionSpec {
    /// Converts into a create payload.
    pub fn to_payload(&self) -> EntityPayload {
        EntityPayload::new()
            .with("Name", self.name.as_str())
            .with("Description", self.description.as_str())
            .with("Project", &self.project)
            .with("Workspace", &self.workspace)
    }
}

/// Build outcome as the service spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
    #[serde(rename = "INCOMPLETE")]
    Incomplete,
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "NO BUILDS")]
    NoBuilds,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Success => "SUCCESS",
            BuildStatus::Failure => "FAILURE",
            BuildStatus::Incomplete => "INCOMPLETE",
            BuildStatus::Unknown => "UNKNOWN",
            BuildStatus::NoBuilds => "NO BUILDS",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', " ").as_str() {
            "SUCCESS" => Ok(BuildStatus::Success),
            "FAILURE" => Ok(BuildStatus::Failure),
            "INCOMPLETE" => Ok(BuildStatus::Incomplete),
            "UNKNOWN" => Ok(BuildStatus::Unknown),
            "NO BUILDS" => Ok(BuildStatus::NoBuilds),
            other => Err(format!("unknown build status '{other}'")),
        }
    }
}

/// One build result to record under a build definition.
///
/// The parent definition is not a field here; it is attached by
/// [`crate::Reconciler::record_append`] through a [`crate::ParentLink`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSpec {
    /// Duration in seconds.
    pub duration: f64,
    pub message: String,
    /// Build number; a string because CI systems use labels like `1.2.3-rc1`.
    pub number: String,
    pub status: BuildStatus,
    /// Link back to the CI job. Omitted from the payload when empty.
    pub uri: Option<String>,
    pub start: Option<Timestamp>,
}

impl BuildSpec {
    /// Converts into a create payload without the parent link.
    pub fn to_payload(&self) -> EntityPayload {
        let mut payload = EntityPayload::new()
            .with("Duration", self.duration)
            .with("Message", self.message.as_str())
            .with("Number", self.number.as_str())
            .with("Status", self.status.as_str());
        if let Some(uri) = self.uri.as_deref().filter(|u| !u.is_empty()) {
            payload.insert("Uri", uri);
        }
        if let Some(start) = self.start {
            payload.insert("Start", start.to_string());
        }
        payload
    }
}
