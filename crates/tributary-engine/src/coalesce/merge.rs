use std::collections::{BTreeMap, BTreeSet};

use tributary_types::RowData;

use super::UnionCollision;
use crate::settings::MergeStrategy;

/// Row data produced by a merge plus any union collisions it resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub data: RowData,
    pub collisions: Vec<UnionCollision>,
}

/// Combine the row data of the arrived branches.
///
/// `present` must be in branch declaration order. Returns `None` for a
/// select merge whose selected branch is absent.
///
/// Union and nested merges drop the per-branch schema contracts since the
/// merged shape matches none of them; select keeps the selected branch's.
pub fn merge_rows(
    strategy: MergeStrategy,
    select_branch: Option<&str>,
    present: &[(&str, &RowData)],
) -> Option<MergedRow> {
    match strategy {
        MergeStrategy::Union => Some(union(present)),
        MergeStrategy::Nested => {
            let values = present
                .iter()
                .map(|(branch, row)| (branch.to_string(), row.to_value()))
                .collect();
            Some(MergedRow {
                data: RowData::new(values),
                collisions: Vec::new(),
            })
        }
        MergeStrategy::Select => {
            let wanted = select_branch?;
            present
                .iter()
                .find(|(branch, _)| *branch == wanted)
                .map(|(_, row)| MergedRow {
                    data: (*row).clone(),
                    collisions: Vec::new(),
                })
        }
    }
}

/// Last writer in declaration order wins; differing values are reported.
fn union(present: &[(&str, &RowData)]) -> MergedRow {
    let mut values = serde_json::Map::new();
    let mut writers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut conflicted: BTreeSet<String> = BTreeSet::new();

    for (branch, row) in present {
        for (field, value) in &row.values {
            if let Some(previous) = values.get(field) {
                if previous != value {
                    conflicted.insert(field.clone());
                }
            }
            values.insert(field.clone(), value.clone());
            writers
                .entry(field.clone())
                .or_default()
                .push(branch.to_string());
        }
    }

    let collisions = conflicted
        .into_iter()
        .filter_map(|field| {
            let branches = writers.remove(&field)?;
            let winner = branches.last()?.clone();
            Some(UnionCollision {
                field,
                branches,
                winner,
            })
        })
        .collect();

    MergedRow {
        data: RowData::new(values),
        collisions,
    }
}
