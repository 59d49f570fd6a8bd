pub mod executor;
pub mod optimizer;

use crate::document::Document;
use crate::schema::Index;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Comparison operator of a where clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WhereOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "contains")]
    Contains,
}

/// A single predicate against a (dotted) document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Where {
    pub field: String,
    pub op: WhereOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl Aggregate {
    fn name(&self) -> &'static str {
        match self {
            Aggregate::Count => "count",
            Aggregate::Sum => "sum",
            Aggregate::Min => "min",
            Aggregate::Max => "max",
            Aggregate::Avg => "avg",
        }
    }
}

/// A projected output field, optionally aliased and/or reduced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub field: String,
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Aggregate>,
}

impl Select {
    pub fn field(field: &str) -> Self {
        Select {
            field: field.to_string(),
            alias: None,
            aggregate: None,
        }
    }

    /// The output name: the alias when given, otherwise `field_aggregate`
    /// for reduced fields, otherwise the field itself.
    pub fn alias(&self) -> String {
        match (&self.alias, &self.aggregate) {
            (Some(alias), _) => alias.clone(),
            (None, Some(aggregate)) => format!("{}_{}", self.field, aggregate.name()),
            (None, None) => self.field.clone(),
        }
    }
}

/// A sub-query joined onto each result document. `$field` placeholders in
/// `on` values are substituted from the left document before the sub-query
/// runs; matches are attached as an array under `as`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub collection: String,
    pub on: Vec<Where>,
    #[serde(rename = "as")]
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

/// A query against a single collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub select: Vec<Select>,
    #[serde(default)]
    pub join: Vec<Join>,
    #[serde(default)]
    pub r#where: Vec<Where>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub limit: usize,
}

/// The optimizer's selection of an index, seek range and direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Optimization {
    pub index: Index,
    pub matched_fields: Vec<String>,
    pub matched_values: Vec<Value>,
    pub seek_fields: Vec<String>,
    pub seek_values: Vec<Value>,
    pub reverse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStats {
    pub execution_time: Duration,
    pub optimization: Optimization,
}

/// One page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub documents: Vec<Document>,
    pub next_page: usize,
    pub count: usize,
    pub stats: PageStats,
}
