//! Flight query builder for the EMS database query endpoint.
//!
//! [`FltQuery`] accumulates a [`QuerySet`] through `select`, `group_by`,
//! `order_by` and `filter` calls, and sends it as one request.

use crate::connection::Connection;
use crate::filter::{build_filter, Predicate};
use crate::schema::MetadataStore;
use crate::types::{Aggregate, EmsError, FieldDescriptor, FieldType, QueryResult, Result, SortOrder};

use polars::prelude::*;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Row cap of the single-shot query endpoint.
pub const MAX_SIMPLE_ROWS: u32 = 25_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectItem {
    pub field_id: String,
    pub aggregate: Aggregate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupItem {
    pub field_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub field_id: String,
    pub order: SortOrder,
    pub aggregate: Aggregate,
}

/// How the filters of a query combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOperator {
    /// All filter conditions must be met
    #[default]
    And,
    /// Any filter condition must be met
    Or,
}

/// Top-level filter envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub operator: GroupOperator,
    pub args: Vec<Predicate>,
}

/// Request body of a database query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySet {
    #[serde(default)]
    pub select: Vec<SelectItem>,
    #[serde(default)]
    pub group_by: Vec<GroupItem>,
    #[serde(default)]
    pub order_by: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterGroup>,
    #[serde(default = "default_distinct")]
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_distinct() -> bool {
    true
}

fn default_format() -> String {
    "none".to_string()
}

impl Default for QuerySet {
    fn default() -> Self {
        Self {
            select: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            filter: None,
            distinct: default_distinct(),
            top: None,
            format: default_format(),
        }
    }
}

/// Raw response of the query endpoint.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    header: Vec<ColumnHeader>,
    #[serde(default)]
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct ColumnHeader {
    name: String,
}

/// Query builder for one flight database.
pub struct FltQuery<'a> {
    ems_id: u32,
    database_id: String,
    metadata: &'a dyn MetadataStore,
    columns: Vec<FieldDescriptor>,
    queryset: QuerySet,
}

impl<'a> FltQuery<'a> {
    /// Create an empty query against a database. Field names are resolved
    /// through `metadata`.
    pub fn new(ems_id: u32, database_id: impl Into<String>, metadata: &'a dyn MetadataStore) -> Self {
        Self {
            ems_id,
            database_id: database_id.into(),
            metadata,
            columns: Vec::new(),
            queryset: QuerySet::default(),
        }
    }

    /// Clear everything accumulated so far.
    pub fn reset(&mut self) {
        self.columns.clear();
        self.queryset = QuerySet::default();
    }

    fn resolve_all(&self, fields: &[&str]) -> Result<Vec<FieldDescriptor>> {
        fields.iter().map(|f| self.metadata.search_field(f)).collect()
    }

    /// Add fields to the output, equivalent to SQL `SELECT`.
    pub fn select(&mut self, fields: &[&str], aggregate: Aggregate) -> Result<()> {
        for field in self.resolve_all(fields)? {
            self.queryset.select.push(SelectItem {
                field_id: field.id.clone(),
                aggregate,
            });
            self.columns.push(field);
        }
        Ok(())
    }

    /// Remove fields from the output.
    pub fn deselect(&mut self, fields: &[&str]) -> Result<()> {
        for field in self.resolve_all(fields)? {
            self.queryset.select.retain(|s| s.field_id != field.id);
            self.columns.retain(|c| c.id != field.id);
        }
        Ok(())
    }

    /// Equivalent to SQL `GROUP BY`.
    pub fn group_by(&mut self, fields: &[&str]) -> Result<()> {
        for field in self.resolve_all(fields)? {
            self.queryset.group_by.push(GroupItem { field_id: field.id });
        }
        Ok(())
    }

    /// Equivalent to SQL `ORDER BY`.
    pub fn order_by(&mut self, field: &str, order: SortOrder) -> Result<()> {
        let field = self.metadata.search_field(field)?;
        self.queryset.order_by.push(OrderItem {
            field_id: field.id,
            order,
            aggregate: Aggregate::None,
        });
        Ok(())
    }

    /// Add a filter condition, combined with `and` unless the envelope was
    /// already created with another operator.
    pub fn filter(&mut self, expr: &str) -> Result<()> {
        self.filter_with(expr, GroupOperator::And)
    }

    /// Add a filter condition. `operator` only takes effect for the first
    /// filter of the query, which creates the envelope.
    pub fn filter_with(&mut self, expr: &str, operator: GroupOperator) -> Result<()> {
        let node = build_filter(expr, self.metadata)?;
        debug!("Filter {:?} -> {:?}", expr, node.operator);
        self.queryset
            .filter
            .get_or_insert_with(|| FilterGroup {
                operator,
                args: Vec::new(),
            })
            .args
            .push(node.into_predicate());
        Ok(())
    }

    /// Remove a filter previously added with the same expression.
    ///
    /// Returns whether a filter was removed. The envelope is dropped when
    /// its last filter goes.
    pub fn remove_filter(&mut self, expr: &str) -> Result<bool> {
        let Some(group) = self.queryset.filter.as_mut() else {
            return Ok(false);
        };
        let target = build_filter(expr, self.metadata)?.into_predicate();
        let Some(pos) = group.args.iter().position(|p| *p == target) else {
            return Ok(false);
        };
        group.args.remove(pos);
        if group.args.is_empty() {
            self.queryset.filter = None;
        }
        Ok(true)
    }

    /// Equivalent to SQL `DISTINCT`.
    pub fn distinct(&mut self, distinct: bool) {
        self.queryset.distinct = distinct;
    }

    /// Limit the number of returned rows, equivalent to SQL `TOP`/`LIMIT`.
    pub fn top(&mut self, n: u32) {
        self.queryset.top = Some(n);
    }

    pub fn queryset(&self) -> &QuerySet {
        &self.queryset
    }

    /// Fields selected so far, in output order.
    pub fn columns(&self) -> &[FieldDescriptor] {
        &self.columns
    }

    /// Serialize the queryset as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.queryset)?)
    }

    /// Replace the queryset with one loaded from JSON. Column types are not
    /// part of the JSON, so results of a loaded query come back as text.
    pub fn from_json_str(&mut self, json: &str) -> Result<()> {
        self.queryset = serde_json::from_str(json)?;
        self.columns.clear();
        Ok(())
    }

    /// Send the query and return the raw JSON response.
    pub async fn simple_run(&self, conn: &mut Connection) -> Result<Value> {
        let ems = self.ems_id.to_string();
        let path = [
            "v2",
            "ems-systems",
            ems.as_str(),
            "databases",
            self.database_id.as_str(),
            "query",
        ];
        let body = serde_json::to_value(&self.queryset)?;
        info!("Sending a simple query to EMS");
        let (_, content) = conn.request(Method::POST, &path, &[], Some(&body)).await?;
        Ok(content)
    }

    /// Send the query and convert the response to a DataFrame.
    pub async fn run(&self, conn: &mut Connection) -> Result<QueryResult> {
        match self.queryset.top {
            Some(n) if n <= MAX_SIMPLE_ROWS => {}
            _ => warn!(
                "Query results are capped at {} rows; set top() to silence this warning",
                MAX_SIMPLE_ROWS
            ),
        }
        let content = self.simple_run(conn).await?;
        self.to_result(content)
    }

    /// Convert a raw query response into typed columns.
    pub fn to_result(&self, content: Value) -> Result<QueryResult> {
        let response: QueryResponse = serde_json::from_value(content)?;

        let mut columns: Vec<Column> = Vec::with_capacity(response.header.len());
        for (idx, header) in response.header.iter().enumerate() {
            let values: Vec<Option<&Value>> = response
                .rows
                .iter()
                .map(|row| row.get(idx).filter(|v| !v.is_null()))
                .collect();
            let name: PlSmallStr = header.name.as_str().into();

            let column = match self.columns.get(idx) {
                Some(field) if field.field_type == FieldType::Number => {
                    let data: Vec<Option<f64>> = values.iter().map(|v| v.and_then(as_number)).collect();
                    Column::new(name, data)
                }
                Some(field) if field.field_type == FieldType::Boolean => {
                    let data: Vec<Option<bool>> = values.iter().map(|v| v.and_then(as_bool)).collect();
                    Column::new(name, data)
                }
                Some(field) if field.field_type == FieldType::DateTime => {
                    let millis = values.iter().map(|v| v.and_then(as_utc_millis));
                    Int64Chunked::from_iter_options(name, millis)
                        .into_datetime(TimeUnit::Milliseconds, Some("UTC".into()))
                        .into_series()
                        .into()
                }
                Some(field) if field.field_type == FieldType::Discrete => {
                    let data: Vec<Option<String>> = values
                        .iter()
                        .map(|v| v.map(|x| self.discrete_label(&field.id, x)))
                        .collect();
                    Column::new(name, data)
                }
                _ => {
                    let data: Vec<Option<String>> = values.iter().map(|v| v.map(as_text)).collect();
                    Column::new(name, data)
                }
            };
            columns.push(column);
        }

        let df = DataFrame::new(columns).map_err(|e| EmsError::DataConversion(e.to_string()))?;
        Ok(QueryResult::new(df))
    }

    fn discrete_label(&self, field_id: &str, value: &Value) -> String {
        let key = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse::<i64>().ok()));
        key.and_then(|k| self.metadata.value_label(field_id, k))
            .unwrap_or_else(|| as_text(value))
    }
}

fn as_number(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|x| x != 0.0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Milliseconds since the epoch. Timestamps without an offset are taken as UTC.
fn as_utc_millis(v: &Value) -> Option<i64> {
    let s = v.as_str()?.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{Arg, FilterOperator};
    use crate::schema::fixtures::*;
    use crate::schema::FieldTree;
    use serde_json::json;

    fn filter_args(query: &FltQuery) -> Vec<Predicate> {
        query.queryset().filter.as_ref().map(|f| f.args.clone()).unwrap_or_default()
    }

    #[test]
    fn test_default_queryset_json() {
        let tree = flight_tree();
        let query = FltQuery::new(3, tree.database_id(), &tree);
        let json: Value = serde_json::from_str(&query.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({
                "select": [],
                "groupBy": [],
                "orderBy": [],
                "distinct": true,
                "format": "none"
            })
        );
    }

    #[test]
    fn test_select_and_deselect() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        query.select(&["Flight Record", "Takeoff Valid"], Aggregate::None).unwrap();
        query.select(&["Flight Date Confidence"], Aggregate::Count).unwrap();

        assert_eq!(query.queryset().select.len(), 3);
        assert_eq!(query.queryset().select[2].aggregate, Aggregate::Count);
        assert_eq!(query.columns()[0].id, FLIGHT_RECORD_ID);

        query.deselect(&["Takeoff Valid"]).unwrap();
        assert_eq!(query.queryset().select.len(), 2);
        assert!(query.columns().iter().all(|c| c.id != TAKEOFF_VALID_ID));
    }

    #[test]
    fn test_select_unknown_field_adds_nothing() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        let err = query.select(&["Flight Record", "Landing Runway"], Aggregate::None).unwrap_err();
        assert!(matches!(err, EmsError::UnknownField(_)));
        assert!(query.queryset().select.is_empty());
    }

    #[test]
    fn test_group_and_order() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        query.group_by(&["Flight Date Confidence"]).unwrap();
        query.order_by("Flight Record", SortOrder::Desc).unwrap();

        let json = serde_json::to_value(query.queryset()).unwrap();
        assert_eq!(json["groupBy"], json!([{"fieldId": DATE_CONFIDENCE_ID}]));
        assert_eq!(
            json["orderBy"],
            json!([{"fieldId": FLIGHT_RECORD_ID, "order": "desc", "aggregate": "none"}])
        );
    }

    #[test]
    fn test_filter_creates_envelope() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        query.filter("'Flight Record' > 17000").unwrap();
        query.filter_with("'Takeoff Valid' == True", GroupOperator::Or).unwrap();

        let group = query.queryset().filter.as_ref().unwrap();
        // The first call decides how filters combine.
        assert_eq!(group.operator, GroupOperator::And);
        assert_eq!(group.args.len(), 2);

        let Predicate::Filter(node) = &group.args[1];
        assert_eq!(node.operator, FilterOperator::IsTrue);
        assert_eq!(node.args, vec![Arg::Field(TAKEOFF_VALID_ID.into())]);
    }

    #[test]
    fn test_failed_filter_leaves_queryset_untouched() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        assert!(query.filter("'Flight Number String' > '000000000'").is_err());
        assert!(query.queryset().filter.is_none());
    }

    #[test]
    fn test_remove_only_filter_drops_envelope() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        let before = query.queryset().clone();

        query.filter("'15000' < 'Flight Record' < '17000'").unwrap();
        assert!(query.remove_filter("'15000' < 'Flight Record' < '17000'").unwrap());

        assert_eq!(query.queryset(), &before);
        assert!(!query.to_json().unwrap().contains("filter"));
    }

    #[test]
    fn test_remove_filter_keeps_others() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        query.filter("'Flight Record' > 17000").unwrap();
        let before = filter_args(&query);

        query.filter("'Flight Date Confidence' in ['High', 'Low']").unwrap();
        assert_eq!(filter_args(&query).len(), 2);

        assert!(query.remove_filter("'Flight Date Confidence' in ['High', 'Low']").unwrap());
        assert_eq!(filter_args(&query), before);
    }

    #[test]
    fn test_remove_missing_filter() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        assert!(!query.remove_filter("'Flight Record' > 1").unwrap());

        query.filter("'Flight Record' > 17000").unwrap();
        assert!(!query.remove_filter("'Flight Record' > 1").unwrap());
        assert_eq!(filter_args(&query).len(), 1);
    }

    #[test]
    fn test_json_round_trip() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        query.select(&["Flight Record"], Aggregate::Avg).unwrap();
        query.filter("'Flight Date (Exact)' >= '2020-01-01'").unwrap();
        query.distinct(false);
        query.top(100);
        let json = query.to_json().unwrap();

        let mut other = FltQuery::new(3, tree.database_id(), &tree);
        other.from_json_str(&json).unwrap();
        assert_eq!(other.queryset(), query.queryset());
        assert_eq!(other.queryset().top, Some(100));
        assert!(other.from_json_str("{\"select\": 1}").is_err());
    }

    #[test]
    fn test_reset() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        query.select(&["Flight Record"], Aggregate::None).unwrap();
        query.filter("'Flight Record' > 17000").unwrap();
        query.reset();
        assert_eq!(query.queryset(), &QuerySet::default());
        assert!(query.columns().is_empty());
    }

    #[test]
    fn test_to_result_types_columns() {
        let tree = flight_tree();
        let mut query = FltQuery::new(3, tree.database_id(), &tree);
        query
            .select(
                &["Flight Record", "Takeoff Valid", "Flight Date Confidence", "Flight Date (Exact)"],
                Aggregate::None,
            )
            .unwrap();

        let content = json!({
            "header": [
                {"name": "Flight Record"},
                {"name": "Takeoff Valid"},
                {"name": "Flight Date Confidence"},
                {"name": "Flight Date (Exact)"}
            ],
            "rows": [
                [17001, true, 2, "2020-01-01T10:00:00Z"],
                ["17002", 0, 7, null]
            ]
        });
        let result = query.to_result(content).unwrap();
        assert_eq!(result.len(), 2);

        let df = result.dataframe();
        let record = df.column("Flight Record").unwrap().as_materialized_series();
        assert_eq!(record.f64().unwrap().get(1), Some(17002.0));

        let valid = df.column("Takeoff Valid").unwrap().as_materialized_series();
        assert_eq!(valid.bool().unwrap().get(1), Some(false));

        let confidence = df.column("Flight Date Confidence").unwrap().as_materialized_series();
        assert_eq!(confidence.str().unwrap().get(0), Some("High"));
        // Keys without a label are kept as text.
        assert_eq!(confidence.str().unwrap().get(1), Some("7"));

        let date = df.column("Flight Date (Exact)").unwrap().as_materialized_series();
        assert_eq!(
            date.dtype(),
            &DataType::Datetime(TimeUnit::Milliseconds, Some("UTC".into()))
        );
        let millis = date.cast(&DataType::Int64).unwrap();
        assert_eq!(millis.i64().unwrap().get(0), Some(1_577_872_800_000));
        assert_eq!(millis.i64().unwrap().get(1), None);
    }

    #[test]
    fn test_to_result_parses_date_formats() {
        let mut tree = FieldTree::new("db");
        tree.add_fields(
            [FieldDescriptor::new("[-hub-][field][date]", "Flight Date", FieldType::DateTime)],
            None,
        );
        let mut query = FltQuery::new(3, "db", &tree);
        query.select(&["Flight Date"], Aggregate::None).unwrap();

        let content = json!({
            "header": [{"name": "Flight Date"}],
            "rows": [
                ["2020-01-01T12:00:00+02:00"],
                ["2020-01-01 10:00:00"],
                ["2020-01-01"],
                ["sometime in 2020"],
                [17]
            ]
        });
        let result = query.to_result(content).unwrap();
        let date = result.dataframe().column("Flight Date").unwrap().as_materialized_series();
        let millis = date.cast(&DataType::Int64).unwrap();
        let millis = millis.i64().unwrap();

        assert_eq!(millis.get(0), Some(1_577_872_800_000));
        assert_eq!(millis.get(1), Some(1_577_872_800_000));
        assert_eq!(millis.get(2), Some(1_577_836_800_000));
        // Cells that are not dates become null.
        assert_eq!(millis.get(3), None);
        assert_eq!(millis.get(4), None);
    }

    #[test]
    fn test_to_result_empty_rows() {
        let tree = FieldTree::new("db");
        let query = FltQuery::new(3, "db", &tree);
        let result = query
            .to_result(json!({"header": [{"name": "a"}, {"name": "b"}], "rows": []}))
            .unwrap();
        assert!(result.is_empty());
        assert_eq!(result.columns(), vec!["a", "b"]);
    }
}
