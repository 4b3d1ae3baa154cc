use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{OffsetDateTime, UtcOffset};

/// Number of tracked funnel steps per experiment.
pub const STEP_COUNT: u32 = 5;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AbTestError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid status transition: {0}")]
    Transition(String),
    #[error("insight decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl ExperimentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft | Self::Paused, Self::Active)
                | (Self::Active, Self::Paused)
                | (Self::Active | Self::Paused, Self::Completed)
        )
    }

    /// Checks a requested lifecycle move against the transition table.
    ///
    /// # Errors
    /// Returns [`AbTestError::Transition`] when `next` is not reachable from
    /// the current status.
    pub fn ensure_transition(self, next: Self) -> Result<(), AbTestError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(AbTestError::Transition(format!(
            "{} -> {} is not allowed",
            self.as_str(),
            next.as_str()
        )))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetModule {
    Pir,
    Competencies,
    Performance,
    Pdi,
}

impl TargetModule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pir => "pir",
            Self::Competencies => "competencies",
            Self::Performance => "performance",
            Self::Pdi => "pdi",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pir" => Some(Self::Pir),
            "competencies" => Some(Self::Competencies),
            "performance" => Some(Self::Performance),
            "pdi" => Some(Self::Pdi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    PageView,
    TimeOnPage,
    StepCompletion,
    FormSubmission,
    ErrorCount,
    SatisfactionRating,
    TaskCompletionTime,
}

impl MetricType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageView => "page_view",
            Self::TimeOnPage => "time_on_page",
            Self::StepCompletion => "step_completion",
            Self::FormSubmission => "form_submission",
            Self::ErrorCount => "error_count",
            Self::SatisfactionRating => "satisfaction_rating",
            Self::TaskCompletionTime => "task_completion_time",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "page_view" => Some(Self::PageView),
            "time_on_page" => Some(Self::TimeOnPage),
            "step_completion" => Some(Self::StepCompletion),
            "form_submission" => Some(Self::FormSubmission),
            "error_count" => Some(Self::ErrorCount),
            "satisfaction_rating" => Some(Self::SatisfactionRating),
            "task_completion_time" => Some(Self::TaskCompletionTime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Winner {
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "tie")]
    Tie,
    #[serde(rename = "insufficient_data")]
    InsufficientData,
}

impl Winner {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::Tie => "tie",
            Self::InsufficientData => "insufficient_data",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "tie" => Some(Self::Tie),
            "insufficient_data" => Some(Self::InsufficientData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LayoutType {
    Control,
    Cards,
    Grid,
    Wizard,
    Minimal,
}

impl LayoutType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Cards => "cards",
            Self::Grid => "grid",
            Self::Wizard => "wizard",
            Self::Minimal => "minimal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "control" => Some(Self::Control),
            "cards" => Some(Self::Cards),
            "grid" => Some(Self::Grid),
            "wizard" => Some(Self::Wizard),
            "minimal" => Some(Self::Minimal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Spacing {
    Compact,
    #[default]
    Normal,
    Relaxed,
}

impl Spacing {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Normal => "normal",
            Self::Relaxed => "relaxed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "compact" => Some(Self::Compact),
            "normal" => Some(Self::Normal),
            "relaxed" => Some(Self::Relaxed),
            _ => None,
        }
    }
}

/// Caller roles as issued by the host application's session layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Rh,
    Gestor,
    Colaborador,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ManageExperiments,
    ViewResults,
    RecordMetrics,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Rh => "rh",
            Self::Gestor => "gestor",
            Self::Colaborador => "colaborador",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "rh" => Some(Self::Rh),
            "gestor" => Some(Self::Gestor),
            "colaborador" => Some(Self::Colaborador),
            _ => None,
        }
    }

    #[must_use]
    pub fn allows(self, capability: Capability) -> bool {
        match capability {
            Capability::ManageExperiments => matches!(self, Self::Admin | Self::Rh),
            Capability::ViewResults => matches!(self, Self::Admin | Self::Rh | Self::Gestor),
            Capability::RecordMetrics => true,
        }
    }
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManageExperiments => "manage_experiments",
            Self::ViewResults => "view_results",
            Self::RecordMetrics => "record_metrics",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    pub experiment_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub target_module: TargetModule,
    pub traffic_percentage: u8,
    pub status: ExperimentStatus,
    #[serde(with = "rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewExperiment {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_module: TargetModule,
    #[serde(default = "full_traffic")]
    pub traffic_percentage: u8,
}

impl NewExperiment {
    /// Validates an experiment definition before insert.
    ///
    /// # Errors
    /// Returns [`AbTestError::Validation`] for an empty name or a traffic
    /// share above 100%.
    pub fn validate(&self) -> Result<(), AbTestError> {
        if self.name.trim().is_empty() {
            return Err(AbTestError::Validation(
                "experiment name cannot be empty".to_string(),
            ));
        }

        if self.traffic_percentage > 100 {
            return Err(AbTestError::Validation(
                "traffic_percentage MUST be in [0, 100]".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Variant {
    pub variant_id: i64,
    pub experiment_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub is_control: bool,
    #[serde(with = "rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewVariant {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_control: bool,
}

impl NewVariant {
    /// # Errors
    /// Returns [`AbTestError::Validation`] when the variant name is empty.
    pub fn validate(&self) -> Result<(), AbTestError> {
        if self.name.trim().is_empty() {
            return Err(AbTestError::Validation(
                "variant name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    pub assignment_id: i64,
    pub experiment_id: i64,
    pub variant_id: i64,
    pub subject_id: i64,
    pub completed: bool,
    #[serde(with = "rfc3339")]
    pub assigned_at: OffsetDateTime,
    #[serde(default, with = "rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricEvent {
    pub metric_id: i64,
    pub experiment_id: i64,
    pub variant_id: i64,
    pub subject_id: i64,
    pub metric_type: MetricType,
    pub metric_value: Option<f64>,
    pub metric_label: Option<String>,
    pub page_url: Option<String>,
    pub step_number: Option<u32>,
    pub session_id: Option<String>,
    #[serde(with = "rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricEventInput {
    pub experiment_id: i64,
    pub variant_id: i64,
    pub subject_id: i64,
    pub metric_type: MetricType,
    #[serde(default)]
    pub metric_value: Option<f64>,
    #[serde(default)]
    pub metric_label: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub step_number: Option<u32>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl MetricEventInput {
    /// Validates a metric observation before append.
    ///
    /// # Errors
    /// Returns [`AbTestError::Validation`] for non-finite values or step
    /// numbers below 1.
    pub fn validate(&self) -> Result<(), AbTestError> {
        if let Some(value) = self.metric_value {
            if !value.is_finite() {
                return Err(AbTestError::Validation(
                    "metric_value MUST be a finite number".to_string(),
                ));
            }
        }

        if self.step_number == Some(0) {
            return Err(AbTestError::Validation(
                "step_number MUST be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutSettings {
    pub layout_type: LayoutType,
    #[serde(default)]
    pub color_scheme: Option<String>,
    #[serde(default)]
    pub font_family: Option<String>,
    #[serde(default)]
    pub spacing: Spacing,
    #[serde(default = "enabled")]
    pub show_progress_bar: bool,
    #[serde(default = "enabled")]
    pub show_step_numbers: bool,
    #[serde(default)]
    pub show_help_tooltips: bool,
    #[serde(default = "enabled")]
    pub animations_enabled: bool,
    #[serde(default)]
    pub custom_css: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayoutConfig {
    pub config_id: i64,
    pub experiment_id: i64,
    pub variant_id: i64,
    #[serde(flatten)]
    pub settings: LayoutSettings,
}

fn full_traffic() -> u8 {
    100
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantRef {
    pub variant_id: i64,
    pub variant_name: String,
    pub is_control: bool,
}

impl From<&Variant> for VariantRef {
    fn from(variant: &Variant) -> Self {
        Self {
            variant_id: variant.variant_id,
            variant_name: variant.name.clone(),
            is_control: variant.is_control,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantStats {
    pub variant_id: i64,
    pub variant_name: String,
    pub is_control: bool,
    pub sample_size: u64,
    pub completions: u64,
    pub conversion_rate: u32,
    pub avg_time_on_page: i64,
    pub avg_completion_time: i64,
    pub avg_satisfaction_rating: f64,
    pub error_rate: u32,
    pub dropoff_rate: u32,
    pub step_completion_rates: BTreeMap<u32, u32>,
}

impl VariantStats {
    /// Neutral statistics used when a variant's data cannot be read.
    #[must_use]
    pub fn empty(variant: &VariantRef) -> Self {
        Self {
            variant_id: variant.variant_id,
            variant_name: variant.variant_name.clone(),
            is_control: variant.is_control,
            sample_size: 0,
            completions: 0,
            conversion_rate: 0,
            avg_time_on_page: 0,
            avg_completion_time: 0,
            avg_satisfaction_rating: 0.0,
            error_rate: 0,
            dropoff_rate: 0,
            step_completion_rates: (1..=STEP_COUNT).map(|step| (step, 0)).collect(),
        }
    }
}

/// Decision constants of the comparison heuristic.
///
/// This is a reproducible scoring rule, not a hypothesis test: no variance
/// or p-value is computed. Changing any value changes outcomes on identical
/// data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComparisonRules {
    pub min_total_samples: u64,
    pub confidence_gate: u32,
    pub confidence_cap: u32,
    pub difference_weight: f64,
    pub sample_weight: f64,
    pub improvement_factor: f64,
    pub reduction_factor: f64,
    pub error_reduction_factor: f64,
    pub conversion_points: u32,
    pub completion_time_points: u32,
    pub satisfaction_points: u32,
    pub error_rate_points: u32,
    pub win_margin: u32,
}

impl ComparisonRules {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            min_total_samples: 30,
            confidence_gate: 80,
            confidence_cap: 95,
            difference_weight: 1.5,
            sample_weight: 10.0,
            improvement_factor: 1.05,
            reduction_factor: 0.95,
            error_reduction_factor: 0.9,
            conversion_points: 3,
            completion_time_points: 2,
            satisfaction_points: 2,
            error_rate_points: 1,
            win_margin: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comparison {
    pub conversion_lift: i64,
    pub time_lift: i64,
    pub satisfaction_lift: i64,
    pub winner: Winner,
    pub confidence_level: u32,
    pub recommendation: String,
}

impl Comparison {
    #[must_use]
    pub fn is_significant(&self, rules: &ComparisonRules) -> bool {
        self.confidence_level >= rules.confidence_gate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantComparison {
    pub experiment_id: i64,
    pub experiment_name: String,
    pub status: ExperimentStatus,
    pub variant_a: VariantStats,
    pub variant_b: VariantStats,
    pub comparison: Comparison,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantStepRates {
    pub variant_name: String,
    pub is_control: bool,
    pub step_rates: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunnelStage {
    pub step: String,
    pub count: u64,
    pub rate: u32,
    pub dropoff: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariantFunnel {
    pub variant_id: i64,
    pub variant_name: String,
    pub is_control: bool,
    pub funnel: Vec<FunnelStage>,
}

const RECOMMEND_COLLECT_MORE: &str =
    "Insufficient data for a statistical conclusion. Keep collecting data.";
const RECOMMEND_KEEP_CONTROL: &str =
    "Variant A (control) performs better overall. Consider keeping the current layout.";
const RECOMMEND_ADOPT_TREATMENT: &str =
    "Variant B performs better. Consider adopting the new layout.";
const RECOMMEND_NO_DIFFERENCE: &str =
    "No significant difference between the variants. Weigh other factors before deciding.";

/// Reduces one variant's assignments and metric events into summary stats.
///
/// Rows belonging to other variants are ignored, so callers may pass the
/// whole experiment's data. Step rates only count subjects that hold an
/// assignment in this variant.
///
/// `dropoff_rate` is `100 - conversion_rate` rather than an independently
/// rounded share, so the pair always sums to 100 (n=8, c=1 gives 13/87, not
/// 13/88). `error_rate` is clamped to 100, so two variants above 100 compare
/// as equal when scoring.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate_variant_stats(
    variant: &VariantRef,
    assignments: &[Assignment],
    events: &[MetricEvent],
) -> VariantStats {
    let assigned: Vec<&Assignment> = assignments
        .iter()
        .filter(|assignment| assignment.variant_id == variant.variant_id)
        .collect();
    let events: Vec<&MetricEvent> = events
        .iter()
        .filter(|event| event.variant_id == variant.variant_id)
        .collect();

    let sample_size = count_u64(assigned.len());
    let completions = count_u64(assigned.iter().filter(|item| item.completed).count());
    let conversion_rate = percent_of(completions as f64, sample_size);
    let dropoff_rate = if sample_size == 0 {
        0
    } else {
        100 - conversion_rate
    };

    let total_errors: f64 = events
        .iter()
        .filter(|event| event.metric_type == MetricType::ErrorCount)
        .filter_map(|event| event.metric_value)
        .filter(|value| value.is_finite())
        .sum();

    let subjects: BTreeSet<i64> = assigned.iter().map(|item| item.subject_id).collect();
    let step_completion_rates = step_counts(&subjects, &events)
        .into_iter()
        .map(|(step, count)| (step, percent_of(count as f64, sample_size)))
        .collect();

    VariantStats {
        variant_id: variant.variant_id,
        variant_name: variant.variant_name.clone(),
        is_control: variant.is_control,
        sample_size,
        completions,
        conversion_rate,
        avg_time_on_page: mean_value(&events, MetricType::TimeOnPage).map_or(0, round_to_i64),
        avg_completion_time: mean_value(&events, MetricType::TaskCompletionTime)
            .map_or(0, round_to_i64),
        avg_satisfaction_rating: mean_value(&events, MetricType::SatisfactionRating)
            .map_or(0.0, |mean| round_half_up(mean * 10.0) / 10.0),
        error_rate: percent_of(total_errors, sample_size),
        dropoff_rate,
        step_completion_rates,
    }
}

/// Builds the ordered conversion funnel for one variant:
/// `assigned`, `step_1` .. `step_5`, `completed`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn build_variant_funnel(
    variant: &VariantRef,
    assignments: &[Assignment],
    events: &[MetricEvent],
) -> VariantFunnel {
    let assigned: Vec<&Assignment> = assignments
        .iter()
        .filter(|assignment| assignment.variant_id == variant.variant_id)
        .collect();
    let events: Vec<&MetricEvent> = events
        .iter()
        .filter(|event| event.variant_id == variant.variant_id)
        .collect();

    let sample_size = count_u64(assigned.len());
    let completions = count_u64(assigned.iter().filter(|item| item.completed).count());
    let subjects: BTreeSet<i64> = assigned.iter().map(|item| item.subject_id).collect();

    let mut stages = vec![("assigned".to_string(), sample_size)];
    stages.extend(
        step_counts(&subjects, &events)
            .into_iter()
            .map(|(step, count)| (format!("step_{step}"), count)),
    );
    stages.push(("completed".to_string(), completions));

    let mut previous: Option<u64> = None;
    let mut funnel = Vec::with_capacity(stages.len());
    for (step, count) in stages {
        let dropoff = match previous {
            Some(prev) if prev > 0 && count < prev => percent_of((prev - count) as f64, prev),
            _ => 0,
        };
        funnel.push(FunnelStage {
            step,
            count,
            rate: percent_of(count as f64, sample_size),
            dropoff,
        });
        previous = Some(count);
    }

    VariantFunnel {
        variant_id: variant.variant_id,
        variant_name: variant.variant_name.clone(),
        is_control: variant.is_control,
        funnel,
    }
}

/// Compares control (`a`) against treatment (`b`) with [`ComparisonRules::v1`].
#[must_use]
pub fn compare_variants(a: &VariantStats, b: &VariantStats) -> Comparison {
    compare_variants_with(a, b, &ComparisonRules::v1())
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compare_variants_with(
    a: &VariantStats,
    b: &VariantStats,
    rules: &ComparisonRules,
) -> Comparison {
    let total_samples = a.sample_size.saturating_add(b.sample_size);

    let conversion_lift = lift(
        f64::from(b.conversion_rate) - f64::from(a.conversion_rate),
        f64::from(a.conversion_rate),
    );
    let time_lift = lift(
        a.avg_completion_time as f64 - b.avg_completion_time as f64,
        a.avg_completion_time as f64,
    );
    let satisfaction_lift = lift(
        b.avg_satisfaction_rating - a.avg_satisfaction_rating,
        a.avg_satisfaction_rating,
    );

    let decide = |winner: Winner, confidence_level: u32, recommendation: String| Comparison {
        conversion_lift,
        time_lift,
        satisfaction_lift,
        winner,
        confidence_level,
        recommendation,
    };

    if total_samples < rules.min_total_samples {
        return decide(
            Winner::InsufficientData,
            0,
            RECOMMEND_COLLECT_MORE.to_string(),
        );
    }

    let conversion_diff = (f64::from(a.conversion_rate) - f64::from(b.conversion_rate)).abs();
    let confidence_level = to_percent(round_half_up(
        conversion_diff * rules.difference_weight
            + (total_samples as f64).log10() * rules.sample_weight,
    ))
    .min(rules.confidence_cap);

    if confidence_level < rules.confidence_gate {
        return decide(
            Winner::InsufficientData,
            confidence_level,
            format!(
                "Statistical confidence of {confidence_level}% is still low. Keep collecting data."
            ),
        );
    }

    let (score_a, score_b) = score_variants(a, b, rules);
    if score_a > score_b + rules.win_margin {
        decide(Winner::A, confidence_level, RECOMMEND_KEEP_CONTROL.to_string())
    } else if score_b > score_a + rules.win_margin {
        decide(
            Winner::B,
            confidence_level,
            RECOMMEND_ADOPT_TREATMENT.to_string(),
        )
    } else {
        decide(
            Winner::Tie,
            confidence_level,
            RECOMMEND_NO_DIFFERENCE.to_string(),
        )
    }
}

#[allow(clippy::cast_precision_loss)]
fn score_variants(a: &VariantStats, b: &VariantStats, rules: &ComparisonRules) -> (u32, u32) {
    let mut score_a = 0_u32;
    let mut score_b = 0_u32;

    let (a_rate, b_rate) = (f64::from(a.conversion_rate), f64::from(b.conversion_rate));
    if a_rate > b_rate * rules.improvement_factor {
        score_a += rules.conversion_points;
    } else if b_rate > a_rate * rules.improvement_factor {
        score_b += rules.conversion_points;
    }

    // Lower completion time wins.
    let (a_time, b_time) = (a.avg_completion_time as f64, b.avg_completion_time as f64);
    if a_time < b_time * rules.reduction_factor {
        score_a += rules.completion_time_points;
    } else if b_time < a_time * rules.reduction_factor {
        score_b += rules.completion_time_points;
    }

    let (a_sat, b_sat) = (a.avg_satisfaction_rating, b.avg_satisfaction_rating);
    if a_sat > b_sat * rules.improvement_factor {
        score_a += rules.satisfaction_points;
    } else if b_sat > a_sat * rules.improvement_factor {
        score_b += rules.satisfaction_points;
    }

    let (a_err, b_err) = (f64::from(a.error_rate), f64::from(b.error_rate));
    if a_err < b_err * rules.error_reduction_factor {
        score_a += rules.error_rate_points;
    } else if b_err < a_err * rules.error_reduction_factor {
        score_b += rules.error_rate_points;
    }

    (score_a, score_b)
}

/// Picks a variant for a subject on first exposure.
///
/// Returns `None` when the subject falls outside the experiment's traffic
/// share or there is nothing to pick from. The same inputs always yield the
/// same variant.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn pick_variant(
    experiment_id: i64,
    subject_id: i64,
    traffic_percentage: u8,
    variant_ids: &[i64],
) -> Option<i64> {
    if variant_ids.is_empty() || traffic_percentage == 0 {
        return None;
    }

    let traffic_bucket = deterministic_bucket(&format!("{experiment_id}:{subject_id}"));
    if traffic_percentage < 100 && traffic_bucket * 100.0 >= f64::from(traffic_percentage) {
        return None;
    }

    let variant_bucket = deterministic_bucket(&format!("{experiment_id}:{subject_id}:variant"));
    let index = ((variant_bucket * variant_ids.len() as f64) as usize).min(variant_ids.len() - 1);
    variant_ids.get(index).copied()
}

#[allow(clippy::cast_precision_loss)]
fn deterministic_bucket(input: &str) -> f64 {
    // Stable FNV-1a hash to avoid platform-randomized hashers.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }

    (hash as f64) / (u64::MAX as f64)
}

fn step_counts(subjects: &BTreeSet<i64>, events: &[&MetricEvent]) -> BTreeMap<u32, u64> {
    (1..=STEP_COUNT)
        .map(|step| {
            let reached: BTreeSet<i64> = events
                .iter()
                .filter(|event| {
                    event.metric_type == MetricType::StepCompletion
                        && event.step_number == Some(step)
                        && subjects.contains(&event.subject_id)
                })
                .map(|event| event.subject_id)
                .collect();
            (step, count_u64(reached.len()))
        })
        .collect()
}

/// Mean of the non-zero values recorded for `metric_type`.
#[allow(clippy::cast_precision_loss)]
fn mean_value(events: &[&MetricEvent], metric_type: MetricType) -> Option<f64> {
    let values: Vec<f64> = events
        .iter()
        .filter(|event| event.metric_type == metric_type)
        .filter_map(|event| event.metric_value)
        .filter(|value| value.is_normal())
        .collect();

    if values.is_empty() {
        return None;
    }

    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn lift(delta: f64, base: f64) -> i64 {
    if base > 0.0 {
        round_to_i64(delta / base * 100.0)
    } else {
        0
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent_of(numerator: f64, denominator: u64) -> u32 {
    if denominator == 0 {
        return 0;
    }
    to_percent(round_half_up(numerator / denominator as f64 * 100.0))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_percent(value: f64) -> u32 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 100.0) as u32
}

#[allow(clippy::cast_possible_truncation)]
fn round_to_i64(value: f64) -> i64 {
    round_half_up(value) as i64
}

/// Rounds halves toward positive infinity (`-2.5 -> -2`, `2.5 -> 3`).
#[must_use]
#[allow(clippy::float_cmp)]
pub fn round_half_up(value: f64) -> f64 {
    if (value - value.trunc()).abs() == 0.5 {
        value.ceil()
    } else {
        value.round()
    }
}

fn count_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Insight {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: InsightKind,
    pub title: String,
    pub description: String,
    pub impact_level: ImpactLevel,
    pub recommended_actions: Vec<RecommendedAction>,
    pub confidence_score: f64,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Trend,
    Correlation,
    Anomaly,
    Opportunity,
    Risk,
    Recommendation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RecommendedAction {
    pub action: String,
    pub priority: String,
    pub expected_outcome: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InsightSource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InsightDecode {
    pub source: InsightSource,
    pub insights: Vec<Insight>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InsightEnvelope {
    insights: Vec<Insight>,
}

impl Insight {
    /// # Errors
    /// Returns [`AbTestError::Decode`] when required text is blank or a
    /// score falls outside `[0, 100]`.
    pub fn validate(&self) -> Result<(), AbTestError> {
        if self.id.trim().is_empty() || self.title.trim().is_empty() {
            return Err(AbTestError::Decode(
                "insight id and title cannot be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("confidence_score", self.confidence_score),
            ("relevance_score", self.relevance_score),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(AbTestError::Decode(format!(
                    "{name} MUST be in [0, 100]"
                )));
            }
        }

        Ok(())
    }
}

/// Assembles the context object handed to an external model when asking
/// for experiment insights.
#[must_use]
pub fn insight_context(comparison: &VariantComparison) -> Value {
    let summary = |stats: &VariantStats| {
        json!({
            "variant_id": stats.variant_id,
            "variant_name": stats.variant_name,
            "is_control": stats.is_control,
            "sample_size": stats.sample_size,
            "conversion_rate": stats.conversion_rate,
            "avg_completion_time": stats.avg_completion_time,
            "avg_satisfaction_rating": stats.avg_satisfaction_rating,
            "error_rate": stats.error_rate,
            "dropoff_rate": stats.dropoff_rate,
            "step_completion_rates": stats.step_completion_rates,
        })
    };

    json!({
        "experiment": {
            "experiment_id": comparison.experiment_id,
            "name": comparison.experiment_name,
            "status": comparison.status.as_str(),
        },
        "variants": [summary(&comparison.variant_a), summary(&comparison.variant_b)],
        "comparison": {
            "conversion_lift": comparison.comparison.conversion_lift,
            "time_lift": comparison.comparison.time_lift,
            "satisfaction_lift": comparison.comparison.satisfaction_lift,
            "winner": comparison.comparison.winner.as_str(),
            "confidence_level": comparison.comparison.confidence_level,
        },
        "response_contract": {
            "insights": [{
                "id": "string",
                "type": "trend | correlation | anomaly | opportunity | risk | recommendation",
                "title": "string",
                "description": "string",
                "impact_level": "low | medium | high | critical",
                "recommended_actions": [{
                    "action": "string",
                    "priority": "string",
                    "expected_outcome": "string"
                }],
                "confidence_score": "number 0-100",
                "relevance_score": "number 0-100"
            }]
        }
    })
}

/// Strict decode of a structured model completion into insights.
///
/// Accepts the bare JSON object or one wrapped in a fenced code block.
///
/// # Errors
/// Returns [`AbTestError::Decode`] when the payload does not match the
/// insights contract or any insight fails validation.
pub fn parse_insights(completion: &str) -> Result<Vec<Insight>, AbTestError> {
    let body = strip_code_fence(completion.trim());
    let envelope: InsightEnvelope = serde_json::from_str(body)
        .map_err(|err| AbTestError::Decode(format!("completion is not an insights payload: {err}")))?;

    if envelope.insights.is_empty() {
        return Err(AbTestError::Decode(
            "insights MUST contain at least one entry".to_string(),
        ));
    }

    for insight in &envelope.insights {
        insight.validate()?;
    }

    Ok(envelope.insights)
}

/// Decodes a completion, falling back to a comparison-derived insight when
/// the completion cannot be trusted.
#[must_use]
pub fn decode_insights(completion: &str, comparison: &VariantComparison) -> InsightDecode {
    match parse_insights(completion) {
        Ok(insights) => InsightDecode {
            source: InsightSource::Model,
            insights,
            fallback_reason: None,
        },
        Err(err) => InsightDecode {
            source: InsightSource::Fallback,
            insights: vec![fallback_insight(comparison)],
            fallback_reason: Some(err.to_string()),
        },
    }
}

#[must_use]
pub fn fallback_insight(comparison: &VariantComparison) -> Insight {
    let outcome = &comparison.comparison;
    let (kind, impact_level, headline) = match outcome.winner {
        Winner::A => (InsightKind::Recommendation, ImpactLevel::Medium, "control leads"),
        Winner::B => (InsightKind::Opportunity, ImpactLevel::High, "treatment leads"),
        Winner::Tie => (InsightKind::Trend, ImpactLevel::Low, "no clear leader"),
        Winner::InsufficientData => (InsightKind::Risk, ImpactLevel::Low, "not enough data"),
    };

    Insight {
        id: format!(
            "experiment-{}-{}",
            comparison.experiment_id,
            outcome.winner.as_str()
        ),
        kind,
        title: format!("{}: {headline}", comparison.experiment_name),
        description: outcome.recommendation.clone(),
        impact_level,
        recommended_actions: vec![RecommendedAction {
            action: outcome.recommendation.clone(),
            priority: impact_level_priority(impact_level).to_string(),
            expected_outcome: format!(
                "conversion lift {}%, time lift {}%, satisfaction lift {}%",
                outcome.conversion_lift, outcome.time_lift, outcome.satisfaction_lift
            ),
        }],
        confidence_score: f64::from(outcome.confidence_level),
        relevance_score: 50.0,
    }
}

fn impact_level_priority(level: ImpactLevel) -> &'static str {
    match level {
        ImpactLevel::Low => "low",
        ImpactLevel::Medium => "medium",
        ImpactLevel::High | ImpactLevel::Critical => "high",
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("```") else {
        return raw;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AbTestError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AbTestError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AbTestError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AbTestError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AbTestError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AbTestError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AbTestError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Serde adapters that keep timestamps as RFC3339 strings on the wire.
#[allow(clippy::missing_errors_doc)]
pub mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            value: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(inner) => super::serialize(inner, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            raw.map(|value| super::super::parse_rfc3339_utc(&value))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn variant_ref(variant_id: i64, is_control: bool) -> VariantRef {
        VariantRef {
            variant_id,
            variant_name: if is_control { "Control" } else { "Wizard" }.to_string(),
            is_control,
        }
    }

    fn assignment(variant_id: i64, subject_id: i64, completed: bool) -> Assignment {
        Assignment {
            assignment_id: subject_id,
            experiment_id: 1,
            variant_id,
            subject_id,
            completed,
            assigned_at: OffsetDateTime::UNIX_EPOCH,
            completed_at: None,
        }
    }

    fn event(
        variant_id: i64,
        subject_id: i64,
        metric_type: MetricType,
        metric_value: Option<f64>,
        step_number: Option<u32>,
    ) -> MetricEvent {
        MetricEvent {
            metric_id: 0,
            experiment_id: 1,
            variant_id,
            subject_id,
            metric_type,
            metric_value,
            metric_label: None,
            page_url: None,
            step_number,
            session_id: None,
            recorded_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn stats_with(sample_size: u64, conversion_rate: u32) -> VariantStats {
        let mut stats = VariantStats::empty(&variant_ref(1, true));
        stats.sample_size = sample_size;
        stats.conversion_rate = conversion_rate;
        stats.dropoff_rate = 100 - conversion_rate;
        stats
    }

    fn fixture_comparison(winner: Winner) -> VariantComparison {
        VariantComparison {
            experiment_id: 7,
            experiment_name: "Onboarding wizard".to_string(),
            status: ExperimentStatus::Active,
            variant_a: stats_with(50, 10),
            variant_b: stats_with(50, 10),
            comparison: Comparison {
                conversion_lift: 0,
                time_lift: 0,
                satisfaction_lift: 0,
                winner,
                confidence_level: 20,
                recommendation: "keep collecting".to_string(),
            },
        }
    }

    #[test]
    fn zero_sample_stats_are_all_zero() {
        let stats = aggregate_variant_stats(&variant_ref(1, true), &[], &[]);
        assert_eq!(stats, VariantStats::empty(&variant_ref(1, true)));
        assert_eq!(stats.step_completion_rates.len(), 5);
        assert!(stats.step_completion_rates.values().all(|rate| *rate == 0));
    }

    #[test]
    fn aggregates_rates_and_means() {
        let assignments = vec![
            assignment(1, 10, true),
            assignment(1, 11, false),
            assignment(1, 12, true),
            assignment(1, 13, false),
            assignment(2, 14, true),
        ];
        let events = vec![
            event(1, 10, MetricType::TimeOnPage, Some(30.0), None),
            event(1, 11, MetricType::TimeOnPage, Some(45.0), None),
            event(1, 12, MetricType::TimeOnPage, Some(0.0), None),
            event(1, 10, MetricType::TaskCompletionTime, Some(120.0), None),
            event(1, 12, MetricType::TaskCompletionTime, Some(95.0), None),
            event(1, 10, MetricType::SatisfactionRating, Some(4.0), None),
            event(1, 12, MetricType::SatisfactionRating, Some(5.0), None),
            event(1, 13, MetricType::SatisfactionRating, Some(4.0), None),
            event(1, 11, MetricType::ErrorCount, Some(1.0), None),
            event(1, 13, MetricType::ErrorCount, None, None),
            event(2, 14, MetricType::TimeOnPage, Some(999.0), None),
        ];

        let stats = aggregate_variant_stats(&variant_ref(1, true), &assignments, &events);

        assert_eq!(stats.sample_size, 4);
        assert_eq!(stats.completions, 2);
        assert_eq!(stats.conversion_rate, 50);
        assert_eq!(stats.dropoff_rate, 50);
        // 37.5 rounds half-up to 38; the zero-valued event does not count.
        assert_eq!(stats.avg_time_on_page, 38);
        assert_eq!(stats.avg_completion_time, 108);
        assert_eq!(stats.avg_satisfaction_rating, 4.3);
        assert_eq!(stats.error_rate, 25);
    }

    #[test]
    fn step_rates_count_distinct_assigned_subjects() {
        let assignments = vec![
            assignment(1, 10, false),
            assignment(1, 11, false),
            assignment(1, 12, false),
            assignment(1, 13, false),
        ];
        let events = vec![
            event(1, 10, MetricType::StepCompletion, None, Some(1)),
            event(1, 10, MetricType::StepCompletion, None, Some(1)),
            event(1, 10, MetricType::StepCompletion, None, Some(1)),
            event(1, 11, MetricType::StepCompletion, None, Some(1)),
            event(1, 11, MetricType::StepCompletion, None, Some(2)),
            // Subject 99 has no assignment in this variant.
            event(1, 99, MetricType::StepCompletion, None, Some(2)),
            event(1, 12, MetricType::StepCompletion, None, None),
        ];

        let stats = aggregate_variant_stats(&variant_ref(1, true), &assignments, &events);

        assert_eq!(stats.step_completion_rates.get(&1), Some(&50));
        assert_eq!(stats.step_completion_rates.get(&2), Some(&25));
        assert_eq!(stats.step_completion_rates.get(&3), Some(&0));
        assert_eq!(stats.step_completion_rates.get(&5), Some(&0));
    }

    #[test]
    fn error_rate_is_clamped_to_one_hundred() {
        let assignments = vec![assignment(1, 10, false)];
        let events = vec![event(1, 10, MetricType::ErrorCount, Some(7.0), None)];
        let stats = aggregate_variant_stats(&variant_ref(1, true), &assignments, &events);
        assert_eq!(stats.error_rate, 100);
    }

    #[test]
    fn equal_rates_at_one_hundred_samples_stay_below_gate() {
        let comparison = compare_variants(&stats_with(50, 10), &stats_with(50, 10));
        assert_eq!(comparison.confidence_level, 20);
        assert_eq!(comparison.winner, Winner::InsufficientData);
        assert!(comparison.recommendation.contains("20%"));
    }

    #[test]
    fn twenty_point_gap_at_two_hundred_samples_reports_fifty_three() {
        let comparison = compare_variants(&stats_with(100, 20), &stats_with(100, 40));
        assert_eq!(comparison.confidence_level, 53);
        assert_eq!(comparison.winner, Winner::InsufficientData);
        assert_eq!(comparison.conversion_lift, 100);
    }

    #[test]
    fn fewer_than_thirty_samples_is_insufficient() {
        let comparison = compare_variants(&stats_with(10, 0), &stats_with(10, 100));
        assert_eq!(comparison.winner, Winner::InsufficientData);
        assert_eq!(comparison.confidence_level, 0);
    }

    #[test]
    fn zero_baseline_conversion_reports_zero_lift() {
        let comparison = compare_variants(&stats_with(100, 0), &stats_with(100, 60));
        assert_eq!(comparison.conversion_lift, 0);
        assert_eq!(comparison.time_lift, 0);
        assert_eq!(comparison.satisfaction_lift, 0);
    }

    #[test]
    fn treatment_wins_with_large_gap_and_better_secondary_metrics() {
        let mut a = stats_with(500, 20);
        a.avg_completion_time = 200;
        a.avg_satisfaction_rating = 3.0;
        a.error_rate = 30;
        let mut b = stats_with(500, 70);
        b.avg_completion_time = 120;
        b.avg_satisfaction_rating = 4.5;
        b.error_rate = 10;

        let comparison = compare_variants(&a, &b);
        assert_eq!(comparison.confidence_level, 95);
        assert_eq!(comparison.winner, Winner::B);
        assert_eq!(comparison.time_lift, 40);
        assert_eq!(comparison.satisfaction_lift, 50);
        assert!(comparison.is_significant(&ComparisonRules::v1()));
    }

    #[test]
    fn control_wins_when_it_dominates() {
        let mut a = stats_with(500, 70);
        a.avg_completion_time = 100;
        let mut b = stats_with(500, 20);
        b.avg_completion_time = 100;

        let comparison = compare_variants(&a, &b);
        assert_eq!(comparison.winner, Winner::A);
    }

    #[test]
    fn single_point_edge_is_a_tie() {
        // Conversion favors B (+3) but completion time favors A (+2).
        let mut a = stats_with(500, 20);
        a.avg_completion_time = 100;
        let mut b = stats_with(500, 70);
        b.avg_completion_time = 200;

        let comparison = compare_variants(&a, &b);
        assert!(comparison.confidence_level >= 80);
        assert_eq!(comparison.winner, Winner::Tie);
    }

    #[test]
    fn negative_half_lift_rounds_toward_positive_infinity() {
        assert_eq!(round_half_up(-12.5), -12.0);
        assert_eq!(round_half_up(12.5), 13.0);
        // (35 - 40) / 40 * 100 = -12.5
        let comparison = compare_variants(&stats_with(10, 40), &stats_with(10, 35));
        assert_eq!(comparison.conversion_lift, -12);
    }

    #[test]
    fn rounding_does_not_lift_values_just_below_half() {
        assert_eq!(round_half_up(0.499_999_999_999_999_94), 0.0);
        assert_eq!(round_half_up(-0.499_999_999_999_999_94), 0.0);
        assert_eq!(round_half_up(0.5), 1.0);
        assert_eq!(round_half_up(-0.5), 0.0);
        assert_eq!(round_half_up(2.4), 2.0);
    }

    #[test]
    fn conversion_margin_must_exceed_five_percent() {
        let rules = ComparisonRules::v1();
        assert_eq!(
            score_variants(&stats_with(50, 20), &stats_with(50, 21), &rules),
            (0, 0)
        );
        assert_eq!(
            score_variants(&stats_with(50, 20), &stats_with(50, 22), &rules),
            (0, 3)
        );
        assert_eq!(
            score_variants(&stats_with(50, 22), &stats_with(50, 20), &rules),
            (3, 0)
        );
    }

    #[test]
    fn completion_time_must_drop_more_than_five_percent() {
        let rules = ComparisonRules::v1();
        let mut a = stats_with(50, 20);
        let mut b = stats_with(50, 20);
        a.avg_completion_time = 100;
        b.avg_completion_time = 95;
        assert_eq!(score_variants(&a, &b, &rules), (0, 0));

        b.avg_completion_time = 94;
        assert_eq!(score_variants(&a, &b, &rules), (0, 2));
    }

    #[test]
    fn error_rate_must_drop_more_than_ten_percent() {
        let rules = ComparisonRules::v1();
        let mut a = stats_with(50, 20);
        let mut b = stats_with(50, 20);
        a.error_rate = 10;
        b.error_rate = 9;
        assert_eq!(score_variants(&a, &b, &rules), (0, 0));

        b.error_rate = 8;
        assert_eq!(score_variants(&a, &b, &rules), (0, 1));
    }

    #[test]
    fn satisfaction_margin_must_exceed_five_percent() {
        let rules = ComparisonRules::v1();
        let mut a = stats_with(50, 20);
        let mut b = stats_with(50, 20);
        a.avg_satisfaction_rating = 4.0;
        b.avg_satisfaction_rating = 4.2;
        assert_eq!(score_variants(&a, &b, &rules), (0, 0));

        b.avg_satisfaction_rating = 4.3;
        assert_eq!(score_variants(&a, &b, &rules), (0, 2));
    }

    #[test]
    fn confidence_of_exactly_eighty_passes_the_gate() {
        // 40 * 1.5 + log10(100) * 10 = 80
        let passed = compare_variants(&stats_with(50, 20), &stats_with(50, 60));
        assert_eq!(passed.confidence_level, 80);
        assert_eq!(passed.winner, Winner::B);

        // 39 * 1.5 + 20 = 78.5, rounds to 79
        let held = compare_variants(&stats_with(50, 20), &stats_with(50, 59));
        assert_eq!(held.confidence_level, 79);
        assert_eq!(held.winner, Winner::InsufficientData);
    }

    #[test]
    fn two_point_score_gap_declares_a_winner() {
        // Conversion gap of 40 clears the confidence gate.
        let mut a = stats_with(50, 60);
        let mut b = stats_with(50, 20);
        a.error_rate = 5;
        b.error_rate = 10;
        a.avg_satisfaction_rating = 3.0;
        b.avg_satisfaction_rating = 4.0;
        // A: 3 (conversion) + 1 (errors) = 4, B: 2 (satisfaction); gap of 2.
        let comparison = compare_variants(&a, &b);
        assert_eq!(comparison.winner, Winner::A);

        // Satisfaction alone gives a gap of exactly 2.
        let rules = ComparisonRules::v1();
        let mut c = stats_with(50, 20);
        let mut d = stats_with(50, 20);
        c.avg_satisfaction_rating = 4.0;
        d.avg_satisfaction_rating = 4.5;
        assert_eq!(score_variants(&c, &d, &rules), (0, 2));

        // A one point gap stays a tie.
        let mut e = stats_with(50, 60);
        let mut g = stats_with(50, 20);
        e.avg_satisfaction_rating = 3.0;
        g.avg_satisfaction_rating = 4.0;
        assert_eq!(score_variants(&e, &g, &rules), (3, 2));
        assert_eq!(compare_variants(&e, &g).winner, Winner::Tie);
    }

    #[test]
    fn funnel_reports_counts_rates_and_dropoff() {
        let assignments = vec![
            assignment(1, 10, true),
            assignment(1, 11, false),
            assignment(1, 12, false),
            assignment(1, 13, false),
        ];
        let events = vec![
            event(1, 10, MetricType::StepCompletion, None, Some(1)),
            event(1, 11, MetricType::StepCompletion, None, Some(1)),
            event(1, 12, MetricType::StepCompletion, None, Some(1)),
            event(1, 10, MetricType::StepCompletion, None, Some(2)),
        ];

        let funnel = build_variant_funnel(&variant_ref(1, true), &assignments, &events);
        let steps: Vec<&str> = funnel.funnel.iter().map(|stage| stage.step.as_str()).collect();
        assert_eq!(
            steps,
            vec!["assigned", "step_1", "step_2", "step_3", "step_4", "step_5", "completed"]
        );

        assert_eq!(funnel.funnel[0].count, 4);
        assert_eq!(funnel.funnel[0].dropoff, 0);
        assert_eq!(funnel.funnel[1].count, 3);
        assert_eq!(funnel.funnel[1].rate, 75);
        assert_eq!(funnel.funnel[1].dropoff, 25);
        assert_eq!(funnel.funnel[2].dropoff, 67);
        assert_eq!(funnel.funnel[3].dropoff, 100);
        // step_4 and step_5 have nothing left to lose.
        assert_eq!(funnel.funnel[4].dropoff, 0);
        // completed (1) rises from step_5 (0): no dropoff.
        assert_eq!(funnel.funnel[6].count, 1);
        assert_eq!(funnel.funnel[6].dropoff, 0);
    }

    #[test]
    fn lifecycle_transitions_follow_table() {
        use ExperimentStatus::{Active, Completed, Draft, Paused};

        assert!(Draft.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Completed));

        assert!(!Draft.can_transition_to(Completed));
        assert!(!Draft.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Active));
        assert!(matches!(
            Completed.ensure_transition(Draft),
            Err(AbTestError::Transition(_))
        ));
    }

    #[test]
    fn role_capabilities_are_fixed() {
        assert!(Role::Admin.allows(Capability::ManageExperiments));
        assert!(Role::Rh.allows(Capability::ManageExperiments));
        assert!(!Role::Gestor.allows(Capability::ManageExperiments));
        assert!(Role::Gestor.allows(Capability::ViewResults));
        assert!(!Role::Colaborador.allows(Capability::ViewResults));
        assert!(Role::Colaborador.allows(Capability::RecordMetrics));
    }

    #[test]
    fn variant_pick_is_deterministic_and_respects_traffic() {
        let variants = [11, 12];
        let first = pick_variant(3, 42, 100, &variants);
        let second = pick_variant(3, 42, 100, &variants);
        assert!(first.is_some());
        assert_eq!(first, second);

        assert_eq!(pick_variant(3, 42, 0, &variants), None);
        assert_eq!(pick_variant(3, 42, 100, &[]), None);

        let picked: BTreeSet<i64> = (0..200)
            .filter_map(|subject| pick_variant(3, subject, 100, &variants))
            .collect();
        assert_eq!(picked, BTreeSet::from([11, 12]));
    }

    #[test]
    fn new_experiment_validation_rejects_bad_input() {
        let mut input = NewExperiment {
            name: "  ".to_string(),
            description: None,
            target_module: TargetModule::Pir,
            traffic_percentage: 100,
        };
        assert!(input.validate().is_err());

        input.name = "Wizard layout".to_string();
        input.traffic_percentage = 101;
        assert!(input.validate().is_err());

        input.traffic_percentage = 50;
        assert!(input.validate().is_ok());
    }

    #[test]
    fn metric_input_rejects_step_zero_and_nan() {
        let mut input = MetricEventInput {
            experiment_id: 1,
            variant_id: 1,
            subject_id: 1,
            metric_type: MetricType::StepCompletion,
            metric_value: None,
            metric_label: None,
            page_url: None,
            step_number: Some(0),
            session_id: None,
        };
        assert!(input.validate().is_err());

        input.step_number = Some(2);
        input.metric_value = Some(f64::NAN);
        assert!(input.validate().is_err());

        input.metric_value = Some(1.0);
        assert!(input.validate().is_ok());
    }

    #[test]
    fn decode_accepts_fenced_structured_completion() {
        let completion = r#"```json
{"insights": [{
  "id": "wizard-speed",
  "type": "opportunity",
  "title": "Wizard is faster",
  "description": "Completion time dropped",
  "impact_level": "high",
  "recommended_actions": [
    {"action": "Roll out", "priority": "high", "expected_outcome": "Faster reviews"}
  ],
  "confidence_score": 82,
  "relevance_score": 90
}]}
```"#;

        let decoded = decode_insights(completion, &fixture_comparison(Winner::B));
        assert_eq!(decoded.source, InsightSource::Model);
        assert_eq!(decoded.fallback_reason, None);
        assert_eq!(decoded.insights.len(), 1);
        assert_eq!(decoded.insights[0].kind, InsightKind::Opportunity);
    }

    #[test]
    fn decode_falls_back_on_drifted_completion() {
        let drifted = r#"{"insights": [{"id": "x", "type": "tendencia"}]}"#;
        let decoded = decode_insights(drifted, &fixture_comparison(Winner::InsufficientData));

        assert_eq!(decoded.source, InsightSource::Fallback);
        assert!(decoded.fallback_reason.is_some());
        assert_eq!(decoded.insights.len(), 1);
        assert_eq!(decoded.insights[0].kind, InsightKind::Risk);
        assert_eq!(decoded.insights[0].id, "experiment-7-insufficient_data");
    }

    #[test]
    fn decode_rejects_out_of_range_scores() {
        let completion = r#"{"insights": [{
  "id": "a", "type": "trend", "title": "t", "description": "d",
  "impact_level": "low", "recommended_actions": [],
  "confidence_score": 140, "relevance_score": 10
}]}"#;
        assert!(matches!(
            parse_insights(completion),
            Err(AbTestError::Decode(_))
        ));
        assert!(matches!(parse_insights("not json"), Err(AbTestError::Decode(_))));
        assert!(matches!(
            parse_insights(r#"{"insights": []}"#),
            Err(AbTestError::Decode(_))
        ));
    }

    #[test]
    fn insight_context_carries_both_variants() {
        let context = insight_context(&fixture_comparison(Winner::Tie));
        assert_eq!(context["experiment"]["experiment_id"], json!(7));
        assert_eq!(context["variants"].as_array().map(Vec::len), Some(2));
        assert_eq!(context["comparison"]["winner"], json!("tie"));
    }

    #[test]
    fn timestamps_serialize_as_rfc3339() {
        let experiment = Experiment {
            experiment_id: 1,
            name: "Wizard".to_string(),
            description: None,
            target_module: TargetModule::Pdi,
            traffic_percentage: 100,
            status: ExperimentStatus::Draft,
            created_at: must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z")),
            updated_at: must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z")),
        };
        let value = must_ok(serde_json::to_value(&experiment));
        assert_eq!(value["created_at"], json!("2026-02-07T12:00:00Z"));

        let decoded: Experiment = must_ok(serde_json::from_value(value));
        assert_eq!(decoded, experiment);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn rates_stay_in_bounds_and_complement(
            outcomes in proptest::collection::vec(any::<bool>(), 0..60),
            errors in proptest::collection::vec(0.0_f64..5.0, 0..20),
            steps in proptest::collection::vec((0_i64..80, 1_u32..=5), 0..120),
        ) {
            let assignments: Vec<Assignment> = outcomes
                .iter()
                .enumerate()
                .map(|(idx, completed)| assignment(1, i64::try_from(idx).unwrap_or(i64::MAX), *completed))
                .collect();
            let mut events: Vec<MetricEvent> = errors
                .iter()
                .map(|value| event(1, 0, MetricType::ErrorCount, Some(*value), None))
                .collect();
            events.extend(
                steps
                    .iter()
                    .map(|(subject, step)| event(1, *subject, MetricType::StepCompletion, None, Some(*step))),
            );

            let stats = aggregate_variant_stats(&variant_ref(1, true), &assignments, &events);

            prop_assert!(stats.conversion_rate <= 100);
            prop_assert!(stats.error_rate <= 100);
            prop_assert!(stats.dropoff_rate <= 100);
            prop_assert!(stats.step_completion_rates.values().all(|rate| *rate <= 100));
            if stats.sample_size > 0 {
                prop_assert_eq!(stats.conversion_rate + stats.dropoff_rate, 100);
            } else {
                prop_assert_eq!(stats, VariantStats::empty(&variant_ref(1, true)));
            }
        }
    }
}
