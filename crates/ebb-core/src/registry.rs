//! Table metadata registry
//!
//! One place that knows, for every synchronized table, which field is the
//! primary key, which fields exist and with what kind, which fields are derived
//! locally and never transported, and how local field names map to wire names.
//! The registry is configuration supplied by the host; [`TableRegistry::builtin`]
//! is the default chat/document schema.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Value kind a field must hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// Any JSON value (objects, arrays, scalars)
    Json,
}

/// Schema entry for one field, keyed by its local name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Computed locally; stripped from outbound payloads and never overwritten by remote ones
    #[serde(default)]
    pub derived: bool,
}

impl FieldSpec {
    pub const fn required(kind: FieldKind) -> Self {
        Self {
            kind,
            required: true,
            derived: false,
        }
    }

    pub const fn optional(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            derived: false,
        }
    }

    pub const fn derived(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            derived: true,
        }
    }
}

/// Local name ↔ wire name pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRename {
    pub local: String,
    pub wire: String,
}

/// Which way a payload is crossing the wire boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local names to wire names
    Outbound,
    /// Wire names to local names
    Inbound,
}

/// Bidirectional field-name mapping built from a single rename list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    local_to_wire: HashMap<String, String>,
    wire_to_local: HashMap<String, String>,
}

impl FieldMap {
    fn build(table: &str, renames: &[FieldRename]) -> Result<Self> {
        let mut map = Self::default();
        for rename in renames {
            if map
                .local_to_wire
                .insert(rename.local.clone(), rename.wire.clone())
                .is_some()
            {
                return Err(Error::Config(format!(
                    "table `{table}` renames local field `{}` twice",
                    rename.local
                )));
            }
            if map
                .wire_to_local
                .insert(rename.wire.clone(), rename.local.clone())
                .is_some()
            {
                return Err(Error::Config(format!(
                    "table `{table}` maps wire field `{}` from two local fields",
                    rename.wire
                )));
            }
        }
        Ok(map)
    }

    /// Translate a field name; unmapped names pass through unchanged
    pub fn translate<'a>(&'a self, name: &'a str, direction: Direction) -> &'a str {
        let lookup = match direction {
            Direction::Outbound => &self.local_to_wire,
            Direction::Inbound => &self.wire_to_local,
        };
        lookup.get(name).map_or(name, String::as_str)
    }
}

/// Raw, host-supplied description of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub primary_key: String,
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub renames: Vec<FieldRename>,
}

/// Validated metadata for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    name: String,
    primary_key: String,
    fields: BTreeMap<String, FieldSpec>,
    field_map: FieldMap,
}

impl TableMeta {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local name of the primary-key field
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn field(&self, local_name: &str) -> Option<&FieldSpec> {
        self.fields.get(local_name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn derived_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|(_, spec)| spec.derived)
            .map(|(name, _)| name.as_str())
    }

    pub const fn field_map(&self) -> &FieldMap {
        &self.field_map
    }

    fn from_config(config: TableConfig) -> Result<Self> {
        let TableConfig {
            name,
            primary_key,
            fields,
            renames,
        } = config;

        if name.trim().is_empty() {
            return Err(Error::Config("table name must not be empty".to_string()));
        }
        let Some(pk_spec) = fields.get(&primary_key) else {
            return Err(Error::Config(format!(
                "table `{name}` has no field definition for primary key `{primary_key}`"
            )));
        };
        if pk_spec.derived {
            return Err(Error::Config(format!(
                "table `{name}` primary key `{primary_key}` cannot be derived"
            )));
        }
        if !matches!(pk_spec.kind, FieldKind::Text | FieldKind::Integer) {
            return Err(Error::Config(format!(
                "table `{name}` primary key `{primary_key}` must be text or integer"
            )));
        }
        if let Some(field) = fields.keys().find(|field| field.contains('.')) {
            return Err(Error::Config(format!(
                "table `{name}` field `{field}` must not contain `.`"
            )));
        }
        for rename in &renames {
            if !fields.contains_key(&rename.local) {
                return Err(Error::Config(format!(
                    "table `{name}` renames unknown field `{}`",
                    rename.local
                )));
            }
            let shadows_field = rename.wire != rename.local
                && fields.contains_key(&rename.wire)
                && !renames.iter().any(|other| other.local == rename.wire);
            if shadows_field {
                return Err(Error::Config(format!(
                    "table `{name}` wire name `{}` collides with field `{}`",
                    rename.wire, rename.wire
                )));
            }
        }

        let field_map = FieldMap::build(&name, &renames)?;
        Ok(Self {
            name,
            primary_key,
            fields,
            field_map,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    tables: Vec<TableConfig>,
}

/// Every synchronized table, validated once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRegistry {
    tables: BTreeMap<String, TableMeta>,
}

impl TableRegistry {
    /// Validate and index table configurations; any inconsistency fails here
    pub fn new(tables: impl IntoIterator<Item = TableConfig>) -> Result<Self> {
        let mut indexed = BTreeMap::new();
        for config in tables {
            let meta = TableMeta::from_config(config)?;
            if indexed.contains_key(meta.name()) {
                return Err(Error::Config(format!(
                    "table `{}` is registered twice",
                    meta.name()
                )));
            }
            indexed.insert(meta.name().to_string(), meta);
        }
        if indexed.is_empty() {
            return Err(Error::Config("no synchronized tables registered".to_string()));
        }
        Ok(Self { tables: indexed })
    }

    /// Parse `{"tables": [...]}`
    pub fn from_json(payload: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid table registry JSON: {error}")))?;
        Self::new(file.tables)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let payload = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&payload)
    }

    /// Default schema: threads, messages, projects, records, kv, files
    pub fn builtin() -> Self {
        Self::new(builtin_tables()).expect("built-in table registry is valid")
    }

    pub fn get(&self, table: &str) -> Result<&TableMeta> {
        self.tables
            .get(table)
            .ok_or_else(|| Error::Config(format!("unknown synchronized table `{table}`")))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Fail if any of `names` is not registered
    pub fn require_all<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for name in names {
            self.get(name)?;
        }
        Ok(())
    }
}

fn table(
    name: &str,
    primary_key: &str,
    fields: &[(&str, FieldSpec)],
    renames: &[(&str, &str)],
) -> TableConfig {
    TableConfig {
        name: name.to_string(),
        primary_key: primary_key.to_string(),
        fields: fields
            .iter()
            .map(|(field, spec)| ((*field).to_string(), spec.clone()))
            .collect(),
        renames: renames
            .iter()
            .map(|(local, wire)| FieldRename {
                local: (*local).to_string(),
                wire: (*wire).to_string(),
            })
            .collect(),
    }
}

fn builtin_tables() -> Vec<TableConfig> {
    use FieldKind::{Boolean, Integer, Json, Text};

    vec![
        table(
            "threads",
            "id",
            &[
                ("id", FieldSpec::required(Text)),
                ("title", FieldSpec::optional(Text)),
                ("project_id", FieldSpec::optional(Text)),
                ("pinned", FieldSpec::optional(Boolean)),
                ("created_at", FieldSpec::required(Integer)),
                ("updated_at", FieldSpec::required(Integer)),
                ("message_count", FieldSpec::derived(Integer)),
            ],
            &[("project_id", "projectId"), ("created_at", "createdAt"), ("updated_at", "updatedAt")],
        ),
        table(
            "messages",
            "id",
            &[
                ("id", FieldSpec::required(Text)),
                ("thread_id", FieldSpec::required(Text)),
                ("role", FieldSpec::required(Text)),
                ("content", FieldSpec::required(Json)),
                ("model", FieldSpec::optional(Text)),
                ("created_at", FieldSpec::required(Integer)),
            ],
            &[("thread_id", "threadId"), ("created_at", "createdAt")],
        ),
        table(
            "projects",
            "id",
            &[
                ("id", FieldSpec::required(Text)),
                ("name", FieldSpec::required(Text)),
                ("instructions", FieldSpec::optional(Text)),
                ("created_at", FieldSpec::required(Integer)),
                ("updated_at", FieldSpec::required(Integer)),
                ("thread_count", FieldSpec::derived(Integer)),
            ],
            &[("created_at", "createdAt"), ("updated_at", "updatedAt")],
        ),
        table(
            "records",
            "id",
            &[
                ("id", FieldSpec::required(Text)),
                ("record_type", FieldSpec::required(Text)),
                ("data", FieldSpec::required(Json)),
                ("updated_at", FieldSpec::required(Integer)),
            ],
            &[("record_type", "type"), ("updated_at", "updatedAt")],
        ),
        table(
            "kv",
            "key",
            &[
                ("key", FieldSpec::required(Text)),
                ("value", FieldSpec::required(Json)),
                ("updated_at", FieldSpec::optional(Integer)),
            ],
            &[("updated_at", "updatedAt")],
        ),
        table(
            "files",
            "id",
            &[
                ("id", FieldSpec::required(Text)),
                ("name", FieldSpec::required(Text)),
                ("mime_type", FieldSpec::optional(Text)),
                ("size_bytes", FieldSpec::optional(Integer)),
                ("storage_reference", FieldSpec::required(Text)),
                ("thread_id", FieldSpec::optional(Text)),
                ("reference_count", FieldSpec::derived(Integer)),
                ("created_at", FieldSpec::required(Integer)),
            ],
            &[
                ("mime_type", "mimeType"),
                ("size_bytes", "sizeBytes"),
                ("storage_reference", "storageReference"),
                ("thread_id", "threadId"),
                ("created_at", "createdAt"),
            ],
        ),
    ]
}
