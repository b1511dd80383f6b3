use orbit_common::{Result, SchedulerConfig};
use orbit_world::{RepetitionOutcome, SchedulingState};

/// Computes the next review interval from a review outcome.
///
/// A pure function of its inputs: the review timestamp comes from the event,
/// never from the wall clock, so replaying history reproduces every schedule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Advance one component's schedule.
    ///
    /// First reviews and lapses get the initial interval. Successful reviews
    /// grow the prior interval by the growth factor, capped at the max
    /// interval but never below the prior interval.
    pub fn next_state(
        &self,
        current: Option<&SchedulingState>,
        outcome: RepetitionOutcome,
        review_timestamp_millis: i64,
    ) -> SchedulingState {
        let initial = self.config.initial_interval_millis;
        let interval_millis = match (current, outcome) {
            (None, _) | (Some(_), RepetitionOutcome::Forgotten) => initial,
            (Some(prior), RepetitionOutcome::Remembered) => {
                let grown = (prior.interval_millis as f64 * self.config.growth_factor).round() as i64;
                grown
                    .min(self.config.max_interval_millis)
                    .max(prior.interval_millis)
            }
        }
        .max(1);

        let repetition_count = current.map_or(0, |s| s.repetition_count).saturating_add(1);
        let lapse_count = current.map_or(0, |s| s.lapse_count)
            + u32::from(outcome == RepetitionOutcome::Forgotten);

        SchedulingState {
            interval_millis,
            due_timestamp_millis: review_timestamp_millis.saturating_add(interval_millis),
            last_repetition_timestamp_millis: review_timestamp_millis,
            repetition_count,
            lapse_count,
        }
    }
}
