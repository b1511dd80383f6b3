//! Derived-row projection for due task components.
//!
//! Rows are never a source of truth. They are a pure function of entity state,
//! so a delta is computed by diffing the full projection of the previous
//! entity against the full projection of the next one. Re-projecting the same
//! pair yields the same delta, and applying it to a table that already
//! reflects `next` changes nothing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use orbit_world::{Entity, EntityId};

/// Table holding one row per live task component.
pub const DUE_TASK_COMPONENTS_TABLE: &str = "derived_due_task_components";

/// The same rows keyed by due time first, for range scans up to a cutoff.
pub const DUE_BY_TIME_TABLE: &str = "derived_due_task_components_by_due";

/// Fixed-width hex of `millis` whose byte order matches numeric order.
pub fn sortable_millis(millis: i64) -> String {
    // Flip the sign bit so negative values sort before positive ones.
    format!("{:016x}", (millis as u64) ^ (1 << 63))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DerivedRowKey {
    pub task_id: EntityId,
    pub component_id: String,
}

impl DerivedRowKey {
    /// Key in the derived table. Scoped by task so a task's rows are adjacent.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.task_id, self.component_id)
    }
}

/// Query-optimized view of one component's schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueComponentRow {
    pub task_id: EntityId,
    pub component_id: String,
    pub due_timestamp_millis: i64,
}

impl DueComponentRow {
    pub fn key(&self) -> DerivedRowKey {
        DerivedRowKey {
            task_id: self.task_id.clone(),
            component_id: self.component_id.clone(),
        }
    }

    /// `<sortable due>/<task>/<component>`, the key in `DUE_BY_TIME_TABLE`.
    pub fn due_index_key(&self) -> String {
        format!(
            "{}/{}",
            sortable_millis(self.due_timestamp_millis),
            self.key().storage_key()
        )
    }
}

/// Row changes implied by one entity transition.
///
/// `deletes` holds the previous version of every row that was removed or
/// changed, so index entries keyed by the old due time can be dropped too.
/// A changed row therefore shows up in both lists; deletes apply first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedDelta {
    pub upserts: Vec<DueComponentRow>,
    pub deletes: Vec<DueComponentRow>,
}

impl DerivedDelta {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Apply to an in-memory table.
    pub fn apply_to(&self, table: &mut BTreeMap<DerivedRowKey, DueComponentRow>) {
        for row in &self.deletes {
            table.remove(&row.key());
        }
        for row in &self.upserts {
            table.insert(row.key(), row.clone());
        }
    }
}

/// Every row `entity` should have. Deleted entities have none.
pub fn rows_for(entity: &Entity) -> BTreeMap<DerivedRowKey, DueComponentRow> {
    let Some(task) = entity.as_task() else {
        return BTreeMap::new();
    };
    if task.is_deleted {
        return BTreeMap::new();
    }

    task.component_states
        .iter()
        .map(|(component_id, state)| {
            let row = DueComponentRow {
                task_id: task.id.clone(),
                component_id: component_id.clone(),
                due_timestamp_millis: state.due_timestamp_millis,
            };
            (row.key(), row)
        })
        .collect()
}

/// Rows to write and remove so the table goes from reflecting `previous` to
/// reflecting `next`.
pub fn project(previous: Option<&Entity>, next: &Entity) -> DerivedDelta {
    let before = previous.map(rows_for).unwrap_or_default();
    let after = rows_for(next);

    let upserts = after
        .iter()
        .filter(|(key, row)| before.get(*key) != Some(*row))
        .map(|(_, row)| row.clone())
        .collect();
    let deletes = before
        .iter()
        .filter(|(key, row)| after.get(*key) != Some(*row))
        .map(|(_, row)| row.clone())
        .collect();

    DerivedDelta { upserts, deletes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orbit_world::{ClozeComponent, Task, TaskComponentState, TaskContent, TaskContentField};

    fn cloze_task(components: &[(&str, i64)]) -> Entity {
        Entity::Task(Task {
            id: EntityId::from("a"),
            created_at_millis: 0,
            content: TaskContent::Cloze {
                body: TaskContentField::text("The {capital} of {France}"),
                components: components
                    .iter()
                    .enumerate()
                    .map(|(i, (id, _))| {
                        (
                            id.to_string(),
                            ClozeComponent {
                                order: i as u32,
                                ranges: vec![],
                            },
                        )
                    })
                    .collect(),
            },
            provenance: None,
            component_states: components
                .iter()
                .map(|(id, due)| {
                    let mut state = TaskComponentState::new(0);
                    state.due_timestamp_millis = *due;
                    (id.to_string(), state)
                })
                .collect(),
            is_deleted: false,
            metadata: Default::default(),
        })
    }

    fn row(component: &str, due: i64) -> DueComponentRow {
        DueComponentRow {
            task_id: EntityId::from("a"),
            component_id: component.into(),
            due_timestamp_millis: due,
        }
    }

    #[test]
    fn insert_emits_one_row_per_component() {
        let next = cloze_task(&[("a", 50), ("b", 50)]);
        let delta = project(None, &next);
        assert_eq!(delta.upserts, vec![row("a", 50), row("b", 50)]);
        assert!(delta.deletes.is_empty());
    }

    #[test]
    fn removed_component_is_deleted_and_changed_one_upserted() {
        let previous = cloze_task(&[("a", 50), ("b", 50)]);
        let next = cloze_task(&[("a", 300)]);
        let delta = project(Some(&previous), &next);
        assert_eq!(delta.upserts, vec![row("a", 300)]);
        assert_eq!(delta.deletes, vec![row("a", 50), row("b", 50)]);
    }

    #[test]
    fn unchanged_components_produce_no_upserts() {
        let previous = cloze_task(&[("a", 50), ("b", 50)]);
        let next = cloze_task(&[("a", 50), ("b", 70)]);
        let delta = project(Some(&previous), &next);
        assert_eq!(delta.upserts, vec![row("b", 70)]);
        assert_eq!(delta.deletes, vec![row("b", 50)]);
    }

    #[test]
    fn deleted_entity_drops_every_row() {
        let previous = cloze_task(&[("a", 50), ("b", 50)]);
        let Entity::Task(mut task) = previous.clone();
        task.is_deleted = true;
        let delta = project(Some(&previous), &Entity::Task(task));
        assert!(delta.upserts.is_empty());
        assert_eq!(delta.deletes.len(), 2);
    }

    #[test]
    fn applying_a_delta_twice_is_a_no_op() {
        let previous = cloze_task(&[("a", 50), ("b", 50)]);
        let next = cloze_task(&[("a", 300), ("c", 10)]);

        let mut table = rows_for(&previous);
        let delta = project(Some(&previous), &next);
        assert_eq!(delta, project(Some(&previous), &next));

        delta.apply_to(&mut table);
        assert_eq!(table, rows_for(&next));
        delta.apply_to(&mut table);
        assert_eq!(table, rows_for(&next));
    }

    #[test]
    fn due_index_keys_sort_by_due_time() {
        let keys: Vec<String> = [row("b", -5), row("a", 0), row("a", 7), row("a", 300)]
            .iter()
            .map(DueComponentRow::due_index_key)
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(row("a", 7).due_index_key().ends_with("/a/a"));
    }
}
