use crate::db::Tx;
use crate::document::{compare_values, Document};
use crate::error::{Error, Result};
use crate::index::keys;
use crate::kv::{prefix_next, IterOpts, KvTx};
use crate::query::optimizer;
use crate::query::{
    Aggregate, Direction, Join, Optimization, OrderBy, Page, PageStats, Query, Select, Where,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Instant;

/// Run the full query pipeline: scan, join, sort or aggregate, paginate,
/// project.
pub(crate) fn query(tx: &Tx, collection: &str, query: &Query) -> Result<Page> {
    let started = Instant::now();
    let (mut documents, optimization) = scan(tx, collection, &query.r#where)?;
    for join in &query.join {
        apply_join(tx, &mut documents, join)?;
    }

    let aggregated =
        !query.group_by.is_empty() || query.select.iter().any(|select| select.aggregate.is_some());
    let documents = if aggregated {
        aggregate(tx, documents, query)?
    } else {
        order_documents(&mut documents, &query.order_by);
        let documents = paginate(documents, query.page, query.limit);
        project(documents, &query.select)?
    };

    Ok(Page {
        count: documents.len(),
        next_page: query.page + 1,
        documents,
        stats: PageStats {
            execution_time: started.elapsed(),
            optimization,
        },
    })
}

/// Plan the scan, walk the chosen index and collect every passing document
/// with read-hooks applied. Secondary index entries indirect through the
/// primary index for the document body.
pub(crate) fn scan(
    tx: &Tx,
    collection: &str,
    wheres: &[Where],
) -> Result<(Vec<Document>, Optimization)> {
    let db = tx.db;
    let ctx = tx.ctx().clone();
    let schema = db.schema(collection)?;
    let internal = ctx.is_indexing();
    let wheres = if internal {
        wheres.to_vec()
    } else {
        db.hooks
            .apply_where_hooks(&ctx, tx, collection, wheres.to_vec())?
    };

    let optimization = optimizer::optimize(
        collection,
        &schema.ready_indexes(),
        &wheres,
        schema.require_query_index(),
    )?;
    let prefix = keys::scan_prefix(collection, &optimization.index, &optimization.matched_values);
    let seek = if optimization.seek_values.is_empty() {
        Vec::new()
    } else {
        let mut values = optimization.matched_values.clone();
        values.extend(optimization.seek_values.iter().cloned());
        let boundary = keys::seek_prefix(collection, &optimization.index, &values);
        if optimization.reverse {
            // start past the boundary value's own entries so <= stays covered
            prefix_next(&boundary).unwrap_or_default()
        } else {
            boundary
        }
    };

    let kv: &dyn KvTx = &*tx.kv;
    let mut documents = Vec::new();
    let mut it = kv.iter(IterOpts {
        prefix,
        seek,
        reverse: optimization.reverse,
    })?;
    while it.valid() {
        ctx.check()?;
        let document = if optimization.index.primary {
            Document::from_bytes(&it.value()?)?
        } else {
            let doc_id = keys::doc_id_from_key(it.key()).ok_or_else(|| {
                Error::Internal("index key is missing its document id".to_string())
            })?;
            tx.get(collection, &doc_id)?
        };
        if document.matches_where(&wheres)? {
            let document = if internal {
                document
            } else {
                db.hooks.apply_read_hooks(&ctx, tx, collection, document)?
            };
            documents.push(document);
        }
        it.next();
    }
    drop(it);
    Ok((documents, optimization))
}

/// Evaluate the join's `on` clauses with `$field` placeholders substituted
/// from each left document, run the sub-query and attach the matches as an
/// array under the join alias.
fn apply_join(tx: &Tx, documents: &mut Vec<Document>, join: &Join) -> Result<()> {
    for document in documents.iter_mut() {
        let resolved: Vec<Where> = join
            .on
            .iter()
            .map(|clause| {
                let value = match &clause.value {
                    Value::String(placeholder) if placeholder.starts_with('$') => {
                        document.get_value(&placeholder[1..])
                    }
                    other => other.clone(),
                };
                Where {
                    field: clause.field.clone(),
                    op: clause.op,
                    value,
                }
            })
            .collect();
        let (matches, _) = scan(tx, &join.collection, &resolved)?;
        let attached: Vec<Value> = matches.into_iter().map(Document::into_value).collect();
        document.set(&join.alias, Value::Array(attached))?;
    }
    Ok(())
}

/// Sort by the first order-by entry; ties keep their scan order.
pub(crate) fn order_documents(documents: &mut [Document], order_by: &[OrderBy]) {
    let Some(order) = order_by.first() else {
        return;
    };
    documents.sort_by(|a, b| {
        let ordering = compare_values(&a.get_value(&order.field), &b.get_value(&order.field));
        match order.direction {
            Direction::Asc => ordering,
            Direction::Desc => ordering.reverse(),
        }
    });
}

fn paginate(mut documents: Vec<Document>, page: usize, limit: usize) -> Vec<Document> {
    if limit > 0 && page > 0 {
        let start = (page * limit).min(documents.len());
        let end = (start + limit).min(documents.len());
        documents = documents[start..end].to_vec();
    }
    if limit > 0 && documents.len() > limit {
        documents.truncate(limit);
    }
    documents
}

fn project(documents: Vec<Document>, selects: &[Select]) -> Result<Vec<Document>> {
    if selects.is_empty() || selects.iter().any(|select| select.field == "*") {
        return Ok(documents);
    }
    documents
        .into_iter()
        .map(|document| document.project(selects))
        .collect()
}

/// Partition on the concatenated group-by values, reduce each group, then
/// re-apply ordering and pagination to the reduced set and project the group
/// keys plus the aliased aggregates.
fn aggregate(tx: &Tx, documents: Vec<Document>, query: &Query) -> Result<Vec<Document>> {
    let mut groups: BTreeMap<String, Vec<Document>> = BTreeMap::new();
    for document in documents {
        tx.ctx().check()?;
        let key = query
            .group_by
            .iter()
            .map(|field| document.get_string(field))
            .collect::<Vec<_>>()
            .join(".");
        groups.entry(key).or_default().push(document);
    }

    let mut reduced = Vec::with_capacity(groups.len());
    for group in groups.into_values() {
        reduced.push(reduce_group(group, &query.select)?);
    }
    order_documents(&mut reduced, &query.order_by);
    let reduced = paginate(reduced, query.page, query.limit);

    let mut selects: Vec<Select> = query.group_by.iter().map(|field| Select::field(field)).collect();
    selects.extend(query.select.iter().map(|select| Select::field(&select.alias())));
    reduced
        .into_iter()
        .map(|document| document.project(&selects))
        .collect()
}

fn reduce_group(group: Vec<Document>, selects: &[Select]) -> Result<Document> {
    let mut result = group.first().cloned().unwrap_or_default();
    for select in selects {
        let alias = select.alias();
        let Some(aggregate) = select.aggregate else {
            let value = result.get_value(&select.field);
            result.set(&alias, value)?;
            continue;
        };
        let value = match aggregate {
            Aggregate::Count => group.len() as f64,
            Aggregate::Sum => group.iter().map(|d| d.get_f64(&select.field)).sum(),
            Aggregate::Min => group
                .iter()
                .map(|d| d.get_f64(&select.field))
                .fold(f64::INFINITY, f64::min),
            Aggregate::Max => group
                .iter()
                .map(|d| d.get_f64(&select.field))
                .fold(f64::NEG_INFINITY, f64::max),
            Aggregate::Avg => {
                let sum: f64 = group.iter().map(|d| d.get_f64(&select.field)).sum();
                sum / group.len() as f64
            }
        };
        result.set(&alias, json!(value))?;
    }
    Ok(result)
}
