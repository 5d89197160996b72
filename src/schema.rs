//! Field metadata lookup for filter and select translation.
//!
//! The query builders never talk to the schema endpoints themselves. They
//! resolve names through a [`MetadataStore`], which the caller constructs
//! once and passes in. [`FieldTree`] is the in-memory implementation used by
//! this crate; it can be filled from the API one field group at a time and
//! persisted as JSON.

use crate::connection::Connection;
use crate::types::{EmsError, FieldDescriptor, FieldType, Result};

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use tracing::{debug, warn};

/// Schema lookups needed to translate queries.
pub trait MetadataStore {
    /// Find a field by keyword. When several fields match, the one with the
    /// shortest name is returned.
    fn search_field(&self, keyword: &str) -> Result<FieldDescriptor>;

    /// Translate the display value of a discrete field into its integer key.
    fn get_value_id(&self, value: &str, field_id: &str) -> Result<i64>;

    /// Display value for a discrete key, if known.
    fn value_label(&self, _field_id: &str, _key: i64) -> Option<String> {
        None
    }
}

/// How keywords are matched against field names. Both are case-insensitive
/// and treat the keyword as plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Name contains the keyword
    #[default]
    Contain,
    /// Name starts with the keyword
    Match,
}

impl SearchType {
    fn matches(&self, name: &str, keyword: &str) -> bool {
        let name = name.to_lowercase();
        let keyword = keyword.to_lowercase();
        match self {
            SearchType::Contain => name.contains(&keyword),
            SearchType::Match => name.starts_with(&keyword),
        }
    }
}

/// A field group (folder) in the schema tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldGroup {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FieldEntry {
    #[serde(flatten)]
    field: FieldDescriptor,
    parent_id: Option<String>,
}

/// Field-group listing as returned by the API.
#[derive(Debug, Deserialize)]
struct FieldGroupResponse {
    #[serde(default)]
    fields: Vec<RawField>,
    #[serde(default)]
    groups: Vec<RawGroup>,
}

#[derive(Debug, Deserialize)]
struct RawField {
    id: String,
    name: String,
    #[serde(rename = "type")]
    field_type: String,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    id: String,
    name: String,
}

/// Database-group listing as returned by the API.
#[derive(Debug, Deserialize)]
struct DatabaseGroupResponse {
    #[serde(default)]
    databases: Vec<RawDatabase>,
    #[serde(default)]
    groups: Vec<RawGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDatabase {
    id: String,
    plural_name: String,
}

/// A database of an EMS system, e.g. `FDW Flights`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub id: String,
    pub name: String,
    pub group_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FieldInfoResponse {
    #[serde(default)]
    discrete_values: BTreeMap<String, String>,
}

/// Cached schema of one database: field groups, fields and the key/value
/// maps of discrete fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldTree {
    database_id: String,
    #[serde(default)]
    search_type: SearchType,
    #[serde(default)]
    groups: Vec<FieldGroup>,
    #[serde(default)]
    fields: Vec<FieldEntry>,
    #[serde(default)]
    discrete_values: BTreeMap<String, BTreeMap<i64, String>>,
}

impl FieldTree {
    /// Create an empty tree for a database.
    pub fn new(database_id: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            ..Default::default()
        }
    }

    /// Set the keyword matching mode.
    pub fn search_type(mut self, search_type: SearchType) -> Self {
        self.search_type = search_type;
        self
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().map(|e| &e.field)
    }

    pub fn groups(&self) -> &[FieldGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.groups.is_empty()
    }

    /// Add fields under a parent group, replacing entries with the same id.
    pub fn add_fields(&mut self, fields: impl IntoIterator<Item = FieldDescriptor>, parent_id: Option<&str>) {
        for field in fields {
            self.fields.retain(|e| e.field.id != field.id);
            self.fields.push(FieldEntry {
                field,
                parent_id: parent_id.map(str::to_string),
            });
        }
    }

    /// Add field groups, replacing entries with the same id.
    pub fn add_groups(&mut self, groups: impl IntoIterator<Item = FieldGroup>) {
        for group in groups {
            self.groups.retain(|g| g.id != group.id);
            self.groups.push(group);
        }
    }

    /// Store the key/value map of a discrete field.
    pub fn add_discrete_values(&mut self, field_id: impl Into<String>, values: BTreeMap<i64, String>) {
        self.discrete_values.insert(field_id.into(), values);
    }

    pub fn has_discrete_values(&self, field_id: &str) -> bool {
        self.discrete_values.contains_key(field_id)
    }

    /// All fields whose name matches the keyword.
    pub fn search_fields(&self, keyword: &str) -> Vec<&FieldDescriptor> {
        self.fields()
            .filter(|f| self.search_type.matches(&f.name, keyword))
            .collect()
    }

    /// Find a field by walking group names down the tree. The last element
    /// is the field keyword, the ones before it are group keywords.
    pub fn search_path(&self, path: &[&str]) -> Result<FieldDescriptor> {
        let (field_keyword, group_keywords) = path
            .split_last()
            .ok_or_else(|| EmsError::InvalidParam("Empty field path".into()))?;

        let mut parents: Option<Vec<&str>> = None;
        for keyword in group_keywords {
            let ids: Vec<&str> = self
                .groups
                .iter()
                .filter(|g| match &parents {
                    None => true,
                    Some(p) => g.parent_id.as_deref().map_or(false, |id| p.contains(&id)),
                })
                .filter(|g| self.search_type.matches(&g.name, keyword))
                .map(|g| g.id.as_str())
                .collect();
            if ids.is_empty() {
                return Err(EmsError::UnknownField(path.join(" / ")));
            }
            parents = Some(ids);
        }

        self.fields
            .iter()
            .filter(|e| match &parents {
                None => true,
                Some(p) => e.parent_id.as_deref().map_or(false, |id| p.contains(&id)),
            })
            .map(|e| &e.field)
            .filter(|f| self.search_type.matches(&f.name, field_keyword))
            .min_by_key(|f| f.name.chars().count())
            .cloned()
            .ok_or_else(|| EmsError::UnknownField(path.join(" / ")))
    }

    /// Save the tree as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Load a tree saved with [`FieldTree::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let tree = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(tree)
    }

    /// Fetch one level of the field tree: the fields and subgroups directly
    /// under `group_id` (or under the database root when `None`).
    ///
    /// Returns the subgroups found so callers can descend further.
    pub async fn fetch_field_group(
        &mut self,
        conn: &mut Connection,
        ems_id: u32,
        group_id: Option<&str>,
    ) -> Result<Vec<FieldGroup>> {
        let ems = ems_id.to_string();
        let query: Vec<(&str, String)> = group_id
            .map(|id| vec![("groupId", id.to_string())])
            .unwrap_or_default();
        let path = [
            "v2",
            "ems-systems",
            ems.as_str(),
            "databases",
            self.database_id.as_str(),
            "field-groups",
        ];
        let (_, body) = conn.request(Method::GET, &path, &query, None).await?;
        let listing: FieldGroupResponse = serde_json::from_value(body)?;

        let mut fields = Vec::with_capacity(listing.fields.len());
        for raw in listing.fields {
            match raw.field_type.parse::<FieldType>() {
                Ok(field_type) => fields.push(FieldDescriptor::new(raw.id, raw.name, field_type)),
                Err(e) => warn!("Skipping field '{}': {}", raw.name, e),
            }
        }
        debug!(
            "Field group {:?}: {} fields, {} groups",
            group_id,
            fields.len(),
            listing.groups.len()
        );
        self.add_fields(fields, group_id);

        let groups: Vec<FieldGroup> = listing
            .groups
            .into_iter()
            .map(|g| FieldGroup {
                id: g.id,
                name: g.name,
                parent_id: group_id.map(str::to_string),
            })
            .collect();
        self.add_groups(groups.clone());
        Ok(groups)
    }

    /// Fetch and store the key/value map of a discrete field.
    pub async fn fetch_discrete_values(
        &mut self,
        conn: &mut Connection,
        ems_id: u32,
        field_id: &str,
    ) -> Result<()> {
        let ems = ems_id.to_string();
        let path = [
            "v2",
            "ems-systems",
            ems.as_str(),
            "databases",
            self.database_id.as_str(),
            "fields",
            field_id,
        ];
        let (_, body) = conn.request(Method::GET, &path, &[], None).await?;
        let info: FieldInfoResponse = serde_json::from_value(body)?;

        let mut values = BTreeMap::new();
        for (key, label) in info.discrete_values {
            let key = key.parse::<i64>().map_err(|_| {
                EmsError::DataConversion(format!("Discrete key '{}' is not an integer", key))
            })?;
            values.insert(key, label);
        }
        debug!("Fetched {} discrete values for {}", values.len(), field_id);
        self.add_discrete_values(field_id, values);
        Ok(())
    }

    /// Fetch the root level and then one field group per keyword, each
    /// looked up among the subgroups of the previous one.
    pub async fn fetch_path(&mut self, conn: &mut Connection, ems_id: u32, path: &[&str]) -> Result<()> {
        let mut groups = self.fetch_field_group(conn, ems_id, None).await?;
        for keyword in path {
            let group = shortest_match(&groups, |g| g.name.as_str(), keyword, self.search_type)
                .cloned()
                .ok_or_else(|| EmsError::UnknownField(format!("field group {}", keyword)))?;
            groups = self.fetch_field_group(conn, ems_id, Some(&group.id)).await?;
        }
        Ok(())
    }

    /// Fetch the value maps of discrete fields that have none yet. Returns
    /// how many fields were fetched.
    pub async fn fetch_missing_discrete_values(&mut self, conn: &mut Connection, ems_id: u32) -> Result<usize> {
        let missing: Vec<String> = self
            .fields()
            .filter(|f| f.field_type == FieldType::Discrete && !self.has_discrete_values(&f.id))
            .map(|f| f.id.clone())
            .collect();
        for field_id in &missing {
            self.fetch_discrete_values(conn, ems_id, field_id).await?;
        }
        Ok(missing.len())
    }
}

fn shortest_match<'t, T>(
    items: &'t [T],
    name: impl Fn(&T) -> &str,
    keyword: &str,
    search_type: SearchType,
) -> Option<&'t T> {
    items
        .iter()
        .filter(|item| search_type.matches(name(*item), keyword))
        .min_by_key(|item| name(*item).chars().count())
}

/// List the databases and database groups directly under `group_id`, or
/// under the top level when `None`.
pub async fn list_databases(
    conn: &mut Connection,
    ems_id: u32,
    group_id: Option<&str>,
) -> Result<(Vec<DatabaseInfo>, Vec<FieldGroup>)> {
    let ems = ems_id.to_string();
    let query: Vec<(&str, String)> = group_id
        .map(|id| vec![("groupId", id.to_string())])
        .unwrap_or_default();
    let path = ["v2", "ems-systems", ems.as_str(), "database-groups"];
    let (_, body) = conn.request(Method::GET, &path, &query, None).await?;
    let listing: DatabaseGroupResponse = serde_json::from_value(body)?;

    let databases = listing
        .databases
        .into_iter()
        .map(|d| DatabaseInfo {
            id: d.id,
            name: d.plural_name,
            group_id: group_id.map(str::to_string),
        })
        .collect();
    let groups = listing
        .groups
        .into_iter()
        .map(|g| FieldGroup {
            id: g.id,
            name: g.name,
            parent_id: group_id.map(str::to_string),
        })
        .collect();
    Ok((databases, groups))
}

/// Resolve a database name such as `FDW Flights` to its id by walking the
/// database groups. A bracketed id is returned unchanged.
pub async fn find_database(
    conn: &mut Connection,
    ems_id: u32,
    name: &str,
    search_type: SearchType,
) -> Result<String> {
    if name.starts_with('[') {
        return Ok(name.to_string());
    }
    let mut databases = Vec::new();
    let mut pending: VecDeque<Option<String>> = VecDeque::from([None]);
    while let Some(group_id) = pending.pop_front() {
        let (found, groups) = list_databases(conn, ems_id, group_id.as_deref()).await?;
        databases.extend(found);
        pending.extend(groups.into_iter().map(|g| Some(g.id)));
    }
    debug!("EMS {} has {} databases", ems_id, databases.len());
    pick_database(&databases, name, search_type).map(|db| db.id.clone())
}

/// Pick the database whose name matches, preferring the shortest name.
pub fn pick_database<'d>(databases: &'d [DatabaseInfo], name: &str, search_type: SearchType) -> Result<&'d DatabaseInfo> {
    shortest_match(databases, |d| d.name.as_str(), name, search_type).ok_or_else(|| {
        let available: Vec<&str> = databases.iter().map(|d| d.name.as_str()).collect();
        EmsError::InvalidParam(format!(
            "No database matches '{}'. Available: {}",
            name,
            available.join(", ")
        ))
    })
}

impl MetadataStore for FieldTree {
    fn search_field(&self, keyword: &str) -> Result<FieldDescriptor> {
        self.search_fields(keyword)
            .into_iter()
            .min_by_key(|f| f.name.chars().count())
            .cloned()
            .ok_or_else(|| EmsError::UnknownField(keyword.to_string()))
    }

    fn get_value_id(&self, value: &str, field_id: &str) -> Result<i64> {
        let values = self
            .discrete_values
            .get(field_id)
            .ok_or_else(|| EmsError::DiscreteValuesNotLoaded(field_id.to_string()))?;
        values
            .iter()
            .find(|(_, label)| label.as_str() == value)
            .map(|(key, _)| *key)
            .ok_or_else(|| EmsError::UnmappedValue {
                value: value.to_string(),
                field_id: field_id.to_string(),
            })
    }

    fn value_label(&self, field_id: &str, key: i64) -> Option<String> {
        self.discrete_values.get(field_id)?.get(&key).cloned()
    }
}
