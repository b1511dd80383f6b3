//! EntityReducer: folds ordered events into entity state.
//!
//! Every event type has one merge rule. Ingest creates the task, updates
//! replace the field they name, repetitions go through the scheduler, and
//! deletion is terminal: events folded after it are a deterministic no-op
//! and the deleted entity comes back unchanged.

use std::cmp::Ordering;

use tracing::debug;

use orbit_common::{OrbitError, Result};
use orbit_world::{Entity, EntityId, Event, EventPayload, Eventlike, Task, TaskComponentState};

use crate::scheduler::Scheduler;

/// Sort events into the order the reducer folds them in.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.log_order(b));
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntityReducer {
    scheduler: Scheduler,
}

impl EntityReducer {
    pub fn new(scheduler: Scheduler) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Fold `events` on top of `existing`.
    ///
    /// `events` must already be in log order and all target the same entity
    /// as `existing`. Anything else is an invalid sequence.
    pub fn reduce(&self, existing: Option<Entity>, events: &[Event]) -> Result<Entity> {
        let mut state = existing;
        let mut previous: Option<&Event> = None;

        for event in events {
            if let Some(entity) = &state {
                if entity.id() != &event.entity_id {
                    return Err(OrbitError::invalid_sequence(
                        entity.id(),
                        format!("event {} targets entity {}", event.id, event.entity_id),
                    ));
                }
            }
            if let Some(prev) = previous {
                if prev.entity_id != event.entity_id {
                    return Err(OrbitError::invalid_sequence(
                        &prev.entity_id,
                        format!("event {} targets entity {}", event.id, event.entity_id),
                    ));
                }
                if prev.log_order(event) != Ordering::Less {
                    return Err(OrbitError::invalid_sequence(
                        &event.entity_id,
                        format!("event {} is not after event {}", event.id, prev.id),
                    ));
                }
            }
            previous = Some(event);
            state = Some(self.apply(state, event)?);
        }

        state.ok_or_else(|| {
            OrbitError::invalid_sequence(&EntityId::new(""), "no events and no existing entity")
        })
    }

    fn apply(&self, state: Option<Entity>, event: &Event) -> Result<Entity> {
        match state {
            None => match &event.payload {
                EventPayload::TaskIngest {
                    content,
                    provenance,
                    metadata,
                } => {
                    let component_states = content
                        .component_ids()
                        .into_iter()
                        .map(|id| (id, TaskComponentState::new(event.timestamp_millis)))
                        .collect();
                    Ok(Entity::Task(Task {
                        id: event.entity_id.clone(),
                        created_at_millis: event.timestamp_millis,
                        content: content.clone(),
                        provenance: provenance.clone(),
                        component_states,
                        is_deleted: false,
                        metadata: metadata.clone(),
                    }))
                }
                other => Err(OrbitError::invalid_sequence(
                    &event.entity_id,
                    format!("{} before the entity was ingested", other.event_type()),
                )),
            },
            Some(entity) if entity.is_deleted() => {
                debug!(
                    entity_id = %event.entity_id,
                    event_id = %event.id,
                    event_type = event.event_type(),
                    "Ignoring event after deletion"
                );
                Ok(entity)
            }
            Some(Entity::Task(task)) => self.apply_to_task(task, event).map(Entity::Task),
        }
    }

    fn apply_to_task(&self, mut task: Task, event: &Event) -> Result<Task> {
        match &event.payload {
            EventPayload::TaskIngest { .. } => {
                return Err(OrbitError::invalid_sequence(
                    &task.id,
                    format!("event {} ingests an entity that already exists", event.id),
                ));
            }
            EventPayload::TaskUpdateDeleted => {
                task.is_deleted = true;
            }
            EventPayload::TaskUpdateProvenance { provenance } => {
                task.provenance = provenance.clone();
            }
            EventPayload::TaskUpdateContent { content } => {
                // Surviving components keep their schedule; new ones are due now.
                let mut component_states = std::mem::take(&mut task.component_states);
                task.component_states = content
                    .component_ids()
                    .into_iter()
                    .map(|id| {
                        let state = component_states
                            .remove(&id)
                            .unwrap_or_else(|| TaskComponentState::new(event.timestamp_millis));
                        (id, state)
                    })
                    .collect();
                task.content = content.clone();
            }
            EventPayload::TaskUpdateMetadata { metadata } => {
                task.metadata
                    .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            EventPayload::TaskRepetition {
                component_id,
                outcome,
                ..
            } => {
                let state = component_state(&mut task, component_id, event)?;
                let next = self.scheduler.next_state(
                    state.scheduling.as_ref(),
                    *outcome,
                    event.timestamp_millis,
                );
                state.due_timestamp_millis = next.due_timestamp_millis;
                state.scheduling = Some(next);
            }
            EventPayload::TaskReschedule {
                component_id,
                new_due_timestamp_millis,
            } => {
                let state = component_state(&mut task, component_id, event)?;
                state.due_timestamp_millis = *new_due_timestamp_millis;
                if let Some(scheduling) = state.scheduling.as_mut() {
                    scheduling.due_timestamp_millis = *new_due_timestamp_millis;
                }
            }
        }
        Ok(task)
    }
}

fn component_state<'a>(
    task: &'a mut Task,
    component_id: &str,
    event: &Event,
) -> Result<&'a mut TaskComponentState> {
    let task_id = task.id.clone();
    task.component_states.get_mut(component_id).ok_or_else(|| {
        OrbitError::invalid_sequence(
            &task_id,
            format!("event {} targets unknown component {component_id}", event.id),
        )
    })
}
