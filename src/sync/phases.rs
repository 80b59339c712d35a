//! # Sync Phases
//!
//! The fixed phase pipeline every sync job moves through, plus the progress
//! accounting persisted in the job's `phases` JSON column. Estimates feed
//! progress reporting only; phase completion is driven by item outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::sync_job::SyncType;

/// The pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhaseName {
    Initialization,
    Authentication,
    DataFetch,
    Processing,
    Finalization,
}

impl SyncPhaseName {
    pub const ALL: [SyncPhaseName; 5] = [
        SyncPhaseName::Initialization,
        SyncPhaseName::Authentication,
        SyncPhaseName::DataFetch,
        SyncPhaseName::Processing,
        SyncPhaseName::Finalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhaseName::Initialization => "initialization",
            SyncPhaseName::Authentication => "authentication",
            SyncPhaseName::DataFetch => "data_fetch",
            SyncPhaseName::Processing => "processing",
            SyncPhaseName::Finalization => "finalization",
        }
    }
}

impl std::fmt::Display for SyncPhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which provider collections a sync type pulls.
pub fn collections_for(sync_type: SyncType) -> &'static [&'static str] {
    match sync_type {
        SyncType::Full => &["library", "favorites", "playlists"],
        SyncType::Incremental => &["library"],
        SyncType::Favorites => &["favorites"],
        SyncType::Playlists => &["playlists"],
    }
}

/// Per-phase progress and failure accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub name: SyncPhaseName,
    /// Item estimate used for progress weighting, never for correctness.
    pub estimated_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub skipped_items: u64,
    /// Opaque resume position inside the phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<JsonValue>,
    pub completed: bool,
}

impl PhaseState {
    fn new(name: SyncPhaseName, estimated_items: u64) -> Self {
        Self {
            name,
            estimated_items,
            processed_items: 0,
            failed_items: 0,
            skipped_items: 0,
            cursor: None,
            completed: false,
        }
    }

    /// All items accounted for, one way or another.
    pub fn settled_items(&self) -> u64 {
        self.processed_items + self.failed_items
    }

    /// Fraction of this phase done, clamped to [0, 1].
    pub fn step_progress(&self) -> f64 {
        if self.completed {
            return 1.0;
        }
        let estimate = self.estimated_items.max(1) as f64;
        (self.settled_items() as f64 / estimate).min(1.0)
    }
}

/// The full pipeline state persisted in `sync_jobs.phases`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPhases {
    pub phases: Vec<PhaseState>,
    /// External ids staged by `data_fetch` for the `processing` phase.
    #[serde(default)]
    pub staged: Vec<String>,
}

impl JobPhases {
    /// A fresh plan for a new job. Bookkeeping phases weigh one item each;
    /// fetch and processing estimates are refined once the provider reports
    /// collection sizes.
    pub fn plan() -> Self {
        Self {
            phases: vec![
                PhaseState::new(SyncPhaseName::Initialization, 1),
                PhaseState::new(SyncPhaseName::Authentication, 1),
                PhaseState::new(SyncPhaseName::DataFetch, 1),
                PhaseState::new(SyncPhaseName::Processing, 1),
                PhaseState::new(SyncPhaseName::Finalization, 1),
            ],
            staged: Vec::new(),
        }
    }

    pub fn from_json(value: &JsonValue) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn phase(&self, name: SyncPhaseName) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: SyncPhaseName) -> Option<&mut PhaseState> {
        self.phases.iter_mut().find(|p| p.name == name)
    }

    /// The first phase still to run.
    pub fn current(&self) -> Option<SyncPhaseName> {
        self.phases.iter().find(|p| !p.completed).map(|p| p.name)
    }

    /// Weighted combination of completed phases' estimated-item share plus
    /// the running phase's step progress.
    pub fn overall_progress(&self) -> f64 {
        let total_weight: f64 = self
            .phases
            .iter()
            .map(|p| p.estimated_items.max(1) as f64)
            .sum();
        if total_weight == 0.0 {
            return 0.0;
        }
        let done: f64 = self
            .phases
            .iter()
            .map(|p| p.estimated_items.max(1) as f64 * p.step_progress())
            .sum();
        (done / total_weight).clamp(0.0, 1.0)
    }

    pub fn total_processed(&self) -> u64 {
        self.phases.iter().map(|p| p.processed_items).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_orders_the_fixed_pipeline() {
        let plan = JobPhases::plan();
        let names: Vec<SyncPhaseName> = plan.phases.iter().map(|p| p.name).collect();
        assert_eq!(names, SyncPhaseName::ALL);
        assert_eq!(plan.current(), Some(SyncPhaseName::Initialization));
        assert_eq!(plan.overall_progress(), 0.0);
    }

    #[test]
    fn progress_weights_by_estimated_items() {
        let mut plan = JobPhases::plan();
        for name in [SyncPhaseName::Initialization, SyncPhaseName::Authentication] {
            let phase = plan.phase_mut(name).unwrap();
            phase.processed_items = 1;
            phase.completed = true;
        }
        let fetch = plan.phase_mut(SyncPhaseName::DataFetch).unwrap();
        fetch.estimated_items = 100;
        fetch.processed_items = 50;

        // 1 + 1 done, 50 of 100 in flight, processing + finalization pending.
        let expected = (1.0 + 1.0 + 50.0) / (1.0 + 1.0 + 100.0 + 1.0 + 1.0);
        let got = plan.overall_progress();
        assert!((got - expected).abs() < 1e-9, "got {got}");
        assert_eq!(plan.current(), Some(SyncPhaseName::DataFetch));
    }

    #[test]
    fn progress_is_monotone_and_capped() {
        let mut plan = JobPhases::plan();
        let mut last = plan.overall_progress();
        for name in SyncPhaseName::ALL {
            let phase = plan.phase_mut(name).unwrap();
            phase.processed_items = phase.estimated_items;
            phase.completed = true;
            let now = plan.overall_progress();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn failed_items_still_count_toward_settlement() {
        let mut state = PhaseState::new(SyncPhaseName::Processing, 4);
        state.failed_items = 4;
        state.skipped_items = 4;
        assert_eq!(state.settled_items(), 4);
        assert_eq!(state.step_progress(), 1.0);
    }

    #[test]
    fn phases_round_trip_through_json() {
        let mut plan = JobPhases::plan();
        plan.staged = vec!["track-1".to_string(), "track-2".to_string()];
        plan.phase_mut(SyncPhaseName::DataFetch).unwrap().cursor =
            Some(serde_json::json!({"collection": 1, "cursor": "abc"}));

        let restored = JobPhases::from_json(&plan.to_json()).unwrap();
        assert_eq!(restored.staged, plan.staged);
        assert_eq!(
            restored.phase(SyncPhaseName::DataFetch).unwrap().cursor,
            plan.phase(SyncPhaseName::DataFetch).unwrap().cursor
        );
    }
}
