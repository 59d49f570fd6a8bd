use crate::error::{Error, Result};
use crate::query::{Optimization, Where, WhereOp};
use crate::schema::Index;
use serde_json::Value;

/// Pick the single best index for a where-clause list.
///
/// Equality clauses can match an index's leading fields; one range clause
/// can seek on the field after the matched prefix (`<`/`<=` flip the scan
/// direction). `!=`, `in` and `contains` are never indexable. Candidates are
/// scored by `(equality prefix length, has seek, secondary over primary)`,
/// so the primary index is the full-scan fallback.
pub fn optimize(
    collection: &str,
    indexes: &[Index],
    wheres: &[Where],
    require_index: bool,
) -> Result<Optimization> {
    let mut equalities: Vec<(&str, &Value)> = Vec::new();
    let mut ranges: Vec<(&str, WhereOp, &Value)> = Vec::new();
    for clause in wheres {
        match clause.op {
            WhereOp::Eq => equalities.push((&clause.field, &clause.value)),
            WhereOp::Gt | WhereOp::Gte | WhereOp::Lt | WhereOp::Lte => {
                ranges.push((&clause.field, clause.op, &clause.value))
            }
            WhereOp::Neq | WhereOp::In | WhereOp::Contains => {}
        }
    }

    let mut best: Option<(Optimization, (usize, usize, usize))> = None;
    for index in indexes {
        let candidate = plan_for(index, &equalities, &ranges);
        let score = (
            candidate.matched_fields.len(),
            candidate.seek_fields.len(),
            usize::from(!index.primary),
        );
        let better = match &best {
            Some((_, best_score)) => score > *best_score,
            None => true,
        };
        if better {
            best = Some((candidate, score));
        }
    }
    let optimization = best
        .map(|(candidate, _)| candidate)
        .ok_or_else(|| Error::Internal(format!("collection {collection} has no indexes")))?;

    if optimization.matched_fields.is_empty() && optimization.seek_fields.is_empty() {
        if require_index {
            return Err(Error::IndexRequired {
                collection: collection.to_string(),
            });
        }
        // nothing matched anywhere: full scan over the primary index
        let primary = indexes
            .iter()
            .find(|index| index.primary)
            .ok_or_else(|| Error::Internal(format!("collection {collection} has no primary index")))?;
        return Ok(Optimization {
            index: primary.clone(),
            ..Default::default()
        });
    }
    Ok(optimization)
}

fn plan_for(
    index: &Index,
    equalities: &[(&str, &Value)],
    ranges: &[(&str, WhereOp, &Value)],
) -> Optimization {
    let mut plan = Optimization {
        index: index.clone(),
        ..Default::default()
    };
    for field in &index.fields {
        match equalities.iter().find(|(name, _)| name == field) {
            Some((_, value)) => {
                plan.matched_fields.push(field.clone());
                plan.matched_values.push((*value).clone());
            }
            None => {
                if let Some((_, op, value)) = ranges.iter().find(|(name, _, _)| name == field) {
                    plan.seek_fields.push(field.clone());
                    plan.seek_values.push((*value).clone());
                    plan.reverse = matches!(op, WhereOp::Lt | WhereOp::Lte);
                }
                break;
            }
        }
    }
    plan
}
