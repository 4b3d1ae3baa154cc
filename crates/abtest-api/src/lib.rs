#![allow(clippy::missing_errors_doc)]

//! Per-call facade over the experiment store.
//!
//! Every operation opens its own SQLite connection, composes the pure core
//! functions with store reads and applies the degrade policies: display
//! reads (comparison, step rates, funnel) fall back to neutral or empty
//! values and log at `warn` instead of failing. Writes never degrade: a
//! read fault while recomputing results is returned to the caller.

use std::collections::BTreeMap;
use std::path::PathBuf;

use abtest_core::{
    aggregate_variant_stats, build_variant_funnel, compare_variants_with, decode_insights,
    insight_context, pick_variant, AbTestError, Assignment, ComparisonRules, Experiment,
    ExperimentStatus, InsightDecode, LayoutConfig, LayoutSettings, MetricEventInput,
    NewExperiment, NewVariant, Variant, VariantComparison, VariantFunnel, VariantRef,
    VariantStats, VariantStepRates,
};
use abtest_store_sqlite::{ResultsRecord, SchemaStatus, SqliteStore};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone)]
pub struct AbTestApi {
    db_path: PathBuf,
    rules: ComparisonRules,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub before: SchemaStatus,
    pub after: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusChangeRequest {
    pub status: ExperimentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutConfigRequest {
    pub variant_id: i64,
    #[serde(flatten)]
    pub settings: LayoutSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedMetric {
    pub metric_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveOutcome {
    pub success: bool,
}

impl AbTestApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self {
            db_path,
            rules: ComparisonRules::v1(),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &ComparisonRules {
        &self.rules
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let store = self.open_store()?;
        let before = store.schema_status()?;
        if !dry_run {
            store.migrate()?;
        }
        let after = store.schema_status()?;
        tracing::info!(
            dry_run,
            from_version = before.current_version,
            to_version = after.current_version,
            "migrate finished"
        );
        Ok(MigrateResult {
            dry_run,
            before,
            after,
        })
    }

    pub fn create_experiment(&self, input: &NewExperiment) -> Result<Experiment> {
        let experiment = self.open_store()?.create_experiment(input)?;
        tracing::info!(
            experiment_id = experiment.experiment_id,
            target_module = experiment.target_module.as_str(),
            "experiment created"
        );
        Ok(experiment)
    }

    pub fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.open_store()?.list_experiments()
    }

    pub fn get_experiment(&self, experiment_id: i64) -> Result<Experiment> {
        let store = self.open_store()?;
        require_experiment(&store, experiment_id)
    }

    /// Moves an experiment through its lifecycle.
    ///
    /// Activation additionally requires one control and at least one
    /// treatment variant.
    pub fn update_status(&self, experiment_id: i64, next: ExperimentStatus) -> Result<Experiment> {
        let store = self.open_store()?;
        let experiment = require_experiment(&store, experiment_id)?;
        experiment.status.ensure_transition(next)?;

        if next == ExperimentStatus::Active {
            let variants = store.list_variants(experiment_id)?;
            let has_control = variants.iter().any(|variant| variant.is_control);
            let has_treatment = variants.iter().any(|variant| !variant.is_control);
            if !has_control || !has_treatment {
                return Err(AbTestError::Validation(
                    "experiment MUST have a control and a treatment variant before activation"
                        .to_string(),
                )
                .into());
            }
        }

        store.set_experiment_status(experiment_id, next)?;
        tracing::info!(
            experiment_id,
            from = experiment.status.as_str(),
            to = next.as_str(),
            "experiment status changed"
        );
        require_experiment(&store, experiment_id)
    }

    pub fn create_variant(&self, experiment_id: i64, input: &NewVariant) -> Result<Variant> {
        let store = self.open_store()?;
        let experiment = require_experiment(&store, experiment_id)?;
        if experiment.status != ExperimentStatus::Draft {
            return Err(AbTestError::Validation(format!(
                "variants can only be added while the experiment is draft (status is {})",
                experiment.status.as_str()
            ))
            .into());
        }

        if input.is_control
            && store
                .list_variants(experiment_id)?
                .iter()
                .any(|variant| variant.is_control)
        {
            return Err(AbTestError::Validation(format!(
                "experiment {experiment_id} already has a control variant"
            ))
            .into());
        }

        let variant = store.create_variant(experiment_id, input)?;
        tracing::info!(
            experiment_id,
            variant_id = variant.variant_id,
            is_control = variant.is_control,
            "variant created"
        );
        Ok(variant)
    }

    /// Returns the subject's assignment, creating it on first exposure.
    ///
    /// `None` when the experiment is not active or the subject falls outside
    /// its traffic share.
    pub fn assign_subject(&self, experiment_id: i64, subject_id: i64) -> Result<Option<Assignment>> {
        let store = self.open_store()?;
        let experiment = require_experiment(&store, experiment_id)?;

        if let Some(existing) = store.get_assignment(experiment_id, subject_id)? {
            return Ok(Some(existing));
        }
        if experiment.status != ExperimentStatus::Active {
            return Ok(None);
        }

        let variant_ids: Vec<i64> = store
            .list_variants(experiment_id)?
            .iter()
            .map(|variant| variant.variant_id)
            .collect();
        let Some(variant_id) = pick_variant(
            experiment_id,
            subject_id,
            experiment.traffic_percentage,
            &variant_ids,
        ) else {
            return Ok(None);
        };

        let assignment = store.insert_assignment(experiment_id, variant_id, subject_id)?;
        tracing::debug!(experiment_id, subject_id, variant_id = assignment.variant_id, "subject assigned");
        Ok(Some(assignment))
    }

    pub fn mark_completed(&self, experiment_id: i64, subject_id: i64) -> Result<Option<Assignment>> {
        let store = self.open_store()?;
        require_experiment(&store, experiment_id)?;
        store.mark_completed(experiment_id, subject_id)
    }

    pub fn record_metric(&self, input: &MetricEventInput) -> Result<RecordedMetric> {
        let store = self.open_store()?;
        require_experiment(&store, input.experiment_id)?;
        require_variant_of(&store, input.experiment_id, input.variant_id)?;
        let event = store.append_metric(input)?;
        Ok(RecordedMetric {
            metric_id: event.metric_id,
        })
    }

    pub fn create_layout_config(
        &self,
        experiment_id: i64,
        request: &LayoutConfigRequest,
    ) -> Result<LayoutConfig> {
        let store = self.open_store()?;
        require_experiment(&store, experiment_id)?;
        require_variant_of(&store, experiment_id, request.variant_id)?;
        let config = store.upsert_layout_config(experiment_id, request.variant_id, &request.settings)?;
        tracing::info!(
            experiment_id,
            variant_id = request.variant_id,
            layout_type = config.settings.layout_type.as_str(),
            "layout config saved"
        );
        Ok(config)
    }

    /// Layout config of the variant the subject is assigned to.
    pub fn layout_config_for_subject(
        &self,
        experiment_id: i64,
        subject_id: i64,
    ) -> Result<Option<LayoutConfig>> {
        let store = self.open_store()?;
        match store.get_assignment(experiment_id, subject_id)? {
            Some(assignment) => store.get_layout_config(assignment.variant_id),
            None => Ok(None),
        }
    }

    /// Live comparison of control against treatment. Never fails: a missing
    /// experiment or unreadable store yields `None`.
    #[must_use]
    pub fn get_comparison(&self, experiment_id: i64) -> Option<VariantComparison> {
        let outcome = self
            .open_store()
            .and_then(|store| self.build_comparison(&store, experiment_id, StatsMode::Display));
        match outcome {
            Ok(comparison) => comparison,
            Err(err) => {
                tracing::warn!(experiment_id, error = %format!("{err:#}"), "comparison unavailable");
                None
            }
        }
    }

    /// Recomputes the comparison and upserts the cached results row.
    ///
    /// `success: false` when the experiment or its two variants are missing.
    /// Store read and write faults are errors so the last good row is kept.
    pub fn save_results(&self, experiment_id: i64) -> Result<SaveOutcome> {
        let store = self.open_store()?;
        let Some(comparison) = self.build_comparison(&store, experiment_id, StatsMode::Strict)?
        else {
            return Ok(SaveOutcome { success: false });
        };

        let record = ResultsRecord::from_comparison(&comparison, &self.rules);
        store.upsert_results(&record)?;
        tracing::info!(
            experiment_id,
            winner = record.winner.as_str(),
            confidence_level = record.confidence_level,
            "results saved"
        );
        Ok(SaveOutcome { success: true })
    }

    pub fn get_results(&self, experiment_id: i64) -> Result<Option<ResultsRecord>> {
        self.open_store()?.get_results(experiment_id)
    }

    /// Per-variant step completion rates keyed by variant id.
    #[must_use]
    pub fn step_completion_rates(&self, experiment_id: i64) -> BTreeMap<i64, VariantStepRates> {
        let outcome = self.open_store().and_then(|store| {
            let mut rates = BTreeMap::new();
            for variant in store.list_variants(experiment_id)? {
                let stats = StatsMode::Display.variant_stats(&store, &variant)?;
                rates.insert(
                    variant.variant_id,
                    VariantStepRates {
                        variant_name: variant.name,
                        is_control: variant.is_control,
                        step_rates: stats.step_completion_rates,
                    },
                );
            }
            Ok(rates)
        });

        outcome.unwrap_or_else(|err: anyhow::Error| {
            tracing::warn!(experiment_id, error = %format!("{err:#}"), "step rates unavailable");
            BTreeMap::new()
        })
    }

    #[must_use]
    pub fn conversion_funnel(&self, experiment_id: i64) -> Vec<VariantFunnel> {
        let outcome = self.open_store().and_then(|store| {
            let mut funnels = Vec::new();
            for variant in store.list_variants(experiment_id)? {
                let assignments = store.list_assignments_for_variant(variant.variant_id)?;
                let events = store.list_events_for_variant(variant.variant_id)?;
                funnels.push(build_variant_funnel(
                    &VariantRef::from(&variant),
                    &assignments,
                    &events,
                ));
            }
            Ok(funnels)
        });

        outcome.unwrap_or_else(|err: anyhow::Error| {
            tracing::warn!(experiment_id, error = %format!("{err:#}"), "funnel unavailable");
            Vec::new()
        })
    }

    pub fn insight_context(&self, experiment_id: i64) -> Result<Value> {
        let comparison = self.require_comparison(experiment_id)?;
        Ok(insight_context(&comparison))
    }

    pub fn decode_insights(&self, experiment_id: i64, completion: &str) -> Result<InsightDecode> {
        let comparison = self.require_comparison(experiment_id)?;
        let decoded = decode_insights(completion, &comparison);
        if let Some(reason) = &decoded.fallback_reason {
            tracing::warn!(experiment_id, reason = %reason, "insight completion rejected; using fallback");
        }
        Ok(decoded)
    }

    fn require_comparison(&self, experiment_id: i64) -> Result<VariantComparison> {
        self.get_comparison(experiment_id)
            .ok_or_else(|| anyhow!("comparison for experiment {experiment_id} not found"))
    }

    fn build_comparison(
        &self,
        store: &SqliteStore,
        experiment_id: i64,
        mode: StatsMode,
    ) -> Result<Option<VariantComparison>> {
        let Some(experiment) = store.get_experiment(experiment_id)? else {
            return Ok(None);
        };
        let variants = store.list_variants(experiment_id)?;
        let control = variants.iter().find(|variant| variant.is_control);
        let treatment = variants.iter().find(|variant| !variant.is_control);
        let (Some(control), Some(treatment)) = (control, treatment) else {
            return Ok(None);
        };

        let variant_a = mode.variant_stats(store, control)?;
        let variant_b = mode.variant_stats(store, treatment)?;
        let comparison = compare_variants_with(&variant_a, &variant_b, &self.rules);

        Ok(Some(VariantComparison {
            experiment_id,
            experiment_name: experiment.name,
            status: experiment.status,
            variant_a,
            variant_b,
            comparison,
        }))
    }
}

/// How per-variant read faults are handled while building a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatsMode {
    /// Display reads: a fault yields zeroed stats for that variant.
    Display,
    /// Cache writes: a fault is returned.
    Strict,
}

impl StatsMode {
    fn variant_stats(self, store: &SqliteStore, variant: &Variant) -> Result<VariantStats> {
        match (load_variant_stats(store, variant), self) {
            (Ok(stats), _) => Ok(stats),
            (Err(err), Self::Strict) => Err(err),
            (Err(err), Self::Display) => {
                tracing::warn!(
                    variant_id = variant.variant_id,
                    error = %format!("{err:#}"),
                    "variant stats unavailable; using empty stats"
                );
                Ok(VariantStats::empty(&VariantRef::from(variant)))
            }
        }
    }
}

fn load_variant_stats(store: &SqliteStore, variant: &Variant) -> Result<VariantStats> {
    let assignments = store.list_assignments_for_variant(variant.variant_id)?;
    let events = store.list_events_for_variant(variant.variant_id)?;
    Ok(aggregate_variant_stats(
        &VariantRef::from(variant),
        &assignments,
        &events,
    ))
}

fn require_experiment(store: &SqliteStore, experiment_id: i64) -> Result<Experiment> {
    store
        .get_experiment(experiment_id)?
        .ok_or_else(|| anyhow!("experiment {experiment_id} not found"))
}

fn require_variant_of(store: &SqliteStore, experiment_id: i64, variant_id: i64) -> Result<Variant> {
    let variant = store
        .get_variant(variant_id)?
        .ok_or_else(|| anyhow!("variant {variant_id} not found"))?;
    if variant.experiment_id != experiment_id {
        return Err(AbTestError::Validation(format!(
            "variant {variant_id} does not belong to experiment {experiment_id}"
        ))
        .into());
    }
    Ok(variant)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use abtest_core::{InsightSource, LayoutType, MetricType, Spacing, TargetModule, Winner};
    use std::path::Path;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn must_some<T>(value: Option<T>, context: &str) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected value: {context}"),
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("abtest-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn migrated_api() -> (AbTestApi, PathBuf) {
        let db_path = unique_temp_db_path();
        let api = AbTestApi::new(db_path.clone());
        let _ = must(api.migrate(false));
        (api, db_path)
    }

    fn draft_experiment(api: &AbTestApi, traffic_percentage: u8) -> (Experiment, Variant, Variant) {
        let experiment = must(api.create_experiment(&NewExperiment {
            name: "PDI wizard".to_string(),
            description: None,
            target_module: TargetModule::Pdi,
            traffic_percentage,
        }));
        let control = must(api.create_variant(
            experiment.experiment_id,
            &NewVariant {
                name: "Control".to_string(),
                description: None,
                is_control: true,
            },
        ));
        let treatment = must(api.create_variant(
            experiment.experiment_id,
            &NewVariant {
                name: "Wizard".to_string(),
                description: Some("step-by-step".to_string()),
                is_control: false,
            },
        ));
        (experiment, control, treatment)
    }

    fn seed_assignments(db_path: &Path, variant: &Variant, subjects: std::ops::Range<i64>, completed: i64) {
        let store = must(SqliteStore::open(db_path));
        for subject_id in subjects.clone() {
            let _ = must(store.insert_assignment(variant.experiment_id, variant.variant_id, subject_id));
            if subject_id - subjects.start < completed {
                let _ = must(store.mark_completed(variant.experiment_id, subject_id));
            }
        }
    }

    fn metric_input(variant: &Variant, subject_id: i64, metric_type: MetricType, value: Option<f64>) -> MetricEventInput {
        MetricEventInput {
            experiment_id: variant.experiment_id,
            variant_id: variant.variant_id,
            subject_id,
            metric_type,
            metric_value: value,
            metric_label: None,
            page_url: None,
            step_number: None,
            session_id: None,
        }
    }

    #[test]
    fn comparison_matches_documented_example() {
        let (api, db_path) = migrated_api();
        let (experiment, control, treatment) = draft_experiment(&api, 100);
        seed_assignments(&db_path, &control, 0..100, 20);
        seed_assignments(&db_path, &treatment, 100..200, 40);

        let comparison = must_some(api.get_comparison(experiment.experiment_id), "comparison");
        assert_eq!(comparison.variant_a.variant_id, control.variant_id);
        assert_eq!(comparison.variant_a.conversion_rate, 20);
        assert_eq!(comparison.variant_b.conversion_rate, 40);
        assert_eq!(comparison.comparison.conversion_lift, 100);
        assert_eq!(comparison.comparison.confidence_level, 53);
        assert_eq!(comparison.comparison.winner, Winner::InsufficientData);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn comparison_degrades_to_none() {
        let (api, db_path) = migrated_api();
        assert!(api.get_comparison(404).is_none());

        let experiment = must(api.create_experiment(&NewExperiment {
            name: "No variants".to_string(),
            description: None,
            target_module: TargetModule::Pir,
            traffic_percentage: 100,
        }));
        assert!(api.get_comparison(experiment.experiment_id).is_none());

        let unreachable = AbTestApi::new(
            std::env::temp_dir()
                .join(format!("abtest-missing-parent-{}/db.sqlite3", ulid::Ulid::new())),
        );
        assert!(unreachable.get_comparison(1).is_none());
        assert!(unreachable.step_completion_rates(1).is_empty());
        assert!(unreachable.conversion_funnel(1).is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn save_results_is_idempotent_and_reports_missing() {
        let (api, db_path) = migrated_api();
        let (experiment, control, treatment) = draft_experiment(&api, 100);
        seed_assignments(&db_path, &control, 0..50, 5);
        seed_assignments(&db_path, &treatment, 50..100, 5);

        assert_eq!(must(api.save_results(999)), SaveOutcome { success: false });
        assert!(must(api.get_results(experiment.experiment_id)).is_none());

        assert!(must(api.save_results(experiment.experiment_id)).success);
        let first = must_some(must(api.get_results(experiment.experiment_id)), "first save");
        assert!(must(api.save_results(experiment.experiment_id)).success);
        let second = must_some(must(api.get_results(experiment.experiment_id)), "second save");

        assert_eq!(first, second);
        assert_eq!(first.confidence_level, 20);
        assert_eq!(first.winner, Winner::InsufficientData);
        assert!(!first.is_statistically_significant);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn save_results_keeps_cached_row_when_reads_fail() {
        let (api, db_path) = migrated_api();
        let (experiment, control, treatment) = draft_experiment(&api, 100);
        seed_assignments(&db_path, &control, 0..50, 10);
        seed_assignments(&db_path, &treatment, 50..100, 40);

        assert!(must(api.save_results(experiment.experiment_id)).success);
        let saved = must_some(must(api.get_results(experiment.experiment_id)), "saved row");
        assert_eq!(saved.winner, Winner::B);
        assert_eq!(saved.confidence_level, 95);
        assert_eq!(saved.sample_size_a, 50);

        let conn = match rusqlite::Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open db: {err}"),
        };
        if let Err(err) = conn.execute_batch("ALTER TABLE assignments RENAME TO assignments_offline") {
            panic!("failed to hide assignments: {err}");
        }

        assert!(api.save_results(experiment.experiment_id).is_err());
        let degraded = must_some(api.get_comparison(experiment.experiment_id), "display comparison");
        assert_eq!(degraded.variant_a.sample_size, 0);

        if let Err(err) = conn.execute_batch("ALTER TABLE assignments_offline RENAME TO assignments") {
            panic!("failed to restore assignments: {err}");
        }
        let kept = must_some(must(api.get_results(experiment.experiment_id)), "kept row");
        assert_eq!(kept, saved);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn lifecycle_rules_are_enforced() {
        let (api, db_path) = migrated_api();
        let lonely = must(api.create_experiment(&NewExperiment {
            name: "Lonely".to_string(),
            description: None,
            target_module: TargetModule::Competencies,
            traffic_percentage: 100,
        }));
        let activation = api.update_status(lonely.experiment_id, ExperimentStatus::Active);
        assert!(activation.is_err());

        let (experiment, _, _) = draft_experiment(&api, 100);
        let second_control = api.create_variant(
            experiment.experiment_id,
            &NewVariant {
                name: "Control 2".to_string(),
                description: None,
                is_control: true,
            },
        );
        assert!(second_control.is_err());

        let skip = api.update_status(experiment.experiment_id, ExperimentStatus::Completed);
        let message = match skip {
            Ok(_) => panic!("draft -> completed must be rejected"),
            Err(err) => format!("{err:#}"),
        };
        assert!(message.contains("invalid status transition"), "{message}");

        let active = must(api.update_status(experiment.experiment_id, ExperimentStatus::Active));
        assert_eq!(active.status, ExperimentStatus::Active);

        let late_variant = api.create_variant(
            experiment.experiment_id,
            &NewVariant {
                name: "Late".to_string(),
                description: None,
                is_control: false,
            },
        );
        assert!(late_variant.is_err());

        let paused = must(api.update_status(experiment.experiment_id, ExperimentStatus::Paused));
        assert_eq!(paused.status, ExperimentStatus::Paused);
        let done = must(api.update_status(experiment.experiment_id, ExperimentStatus::Completed));
        assert_eq!(done.status, ExperimentStatus::Completed);
        assert!(api
            .update_status(experiment.experiment_id, ExperimentStatus::Active)
            .is_err());

        let missing = match api.get_experiment(12_345) {
            Ok(_) => panic!("missing experiment must error"),
            Err(err) => err.to_string(),
        };
        assert!(missing.contains("not found"));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn assignment_requires_active_experiment_and_is_stable() {
        let (api, db_path) = migrated_api();
        let (experiment, control, treatment) = draft_experiment(&api, 100);

        assert!(must(api.assign_subject(experiment.experiment_id, 1)).is_none());
        let _ = must(api.update_status(experiment.experiment_id, ExperimentStatus::Active));

        let first = must_some(must(api.assign_subject(experiment.experiment_id, 1)), "first");
        let again = must_some(must(api.assign_subject(experiment.experiment_id, 1)), "again");
        assert_eq!(first, again);
        assert!([control.variant_id, treatment.variant_id].contains(&first.variant_id));

        let completed = must_some(must(api.mark_completed(experiment.experiment_id, 1)), "completed");
        assert!(completed.completed);
        assert!(must(api.mark_completed(experiment.experiment_id, 2)).is_none());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn zero_traffic_excludes_every_subject() {
        let (api, db_path) = migrated_api();
        let (experiment, _, _) = draft_experiment(&api, 0);
        let _ = must(api.update_status(experiment.experiment_id, ExperimentStatus::Active));

        for subject_id in 0..20 {
            assert!(must(api.assign_subject(experiment.experiment_id, subject_id)).is_none());
        }

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn record_metric_validates_ownership_and_feeds_step_rates() {
        let (api, db_path) = migrated_api();
        let (experiment, control, treatment) = draft_experiment(&api, 100);
        let (other, _, _) = draft_experiment(&api, 100);
        seed_assignments(&db_path, &control, 0..4, 0);

        let mut foreign = metric_input(&control, 0, MetricType::PageView, None);
        foreign.experiment_id = other.experiment_id;
        let err = match api.record_metric(&foreign) {
            Ok(_) => panic!("foreign variant must be rejected"),
            Err(err) => err.to_string(),
        };
        assert!(err.contains("validation failed"), "{err}");

        for subject_id in [0, 0, 1] {
            let mut input = metric_input(&control, subject_id, MetricType::StepCompletion, None);
            input.step_number = Some(1);
            let recorded = must(api.record_metric(&input));
            assert!(recorded.metric_id > 0);
        }

        let rates = api.step_completion_rates(experiment.experiment_id);
        let control_rates = must_some(rates.get(&control.variant_id), "control rates");
        assert!(control_rates.is_control);
        assert_eq!(control_rates.step_rates.get(&1), Some(&50));
        let treatment_rates = must_some(rates.get(&treatment.variant_id), "treatment rates");
        assert_eq!(treatment_rates.step_rates.get(&1), Some(&0));

        let funnel = api.conversion_funnel(experiment.experiment_id);
        assert_eq!(funnel.len(), 2);
        assert_eq!(funnel[0].funnel[0].count, 4);
        assert_eq!(funnel[0].funnel[1].count, 2);
        assert_eq!(funnel[0].funnel[1].dropoff, 50);

        assert!(api.step_completion_rates(999).is_empty());
        assert!(api.conversion_funnel(999).is_empty());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn layout_config_follows_subject_assignment() {
        let (api, db_path) = migrated_api();
        let (experiment, _, treatment) = draft_experiment(&api, 100);
        seed_assignments(&db_path, &treatment, 10..11, 0);

        let request = LayoutConfigRequest {
            variant_id: treatment.variant_id,
            settings: LayoutSettings {
                layout_type: LayoutType::Wizard,
                color_scheme: None,
                font_family: None,
                spacing: Spacing::Compact,
                show_progress_bar: true,
                show_step_numbers: false,
                show_help_tooltips: true,
                animations_enabled: false,
                custom_css: None,
            },
        };
        let saved = must(api.create_layout_config(experiment.experiment_id, &request));

        let for_subject = must(api.layout_config_for_subject(experiment.experiment_id, 10));
        assert_eq!(for_subject, Some(saved));
        assert!(must(api.layout_config_for_subject(experiment.experiment_id, 11)).is_none());

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn insights_fall_back_on_malformed_completion() {
        let (api, db_path) = migrated_api();
        let (experiment, control, _) = draft_experiment(&api, 100);
        seed_assignments(&db_path, &control, 0..3, 1);
        let _ = must(api.record_metric(&metric_input(
            &control,
            0,
            MetricType::SatisfactionRating,
            Some(4.0),
        )));

        let context = must(api.insight_context(experiment.experiment_id));
        assert_eq!(context["variants"][0]["avg_satisfaction_rating"], serde_json::json!(4.0));

        let decoded = must(api.decode_insights(experiment.experiment_id, "Sure! Here are insights:"));
        assert_eq!(decoded.source, InsightSource::Fallback);
        assert_eq!(decoded.insights.len(), 1);

        assert!(api.insight_context(777).is_err());

        let _ = std::fs::remove_file(&db_path);
    }
}
