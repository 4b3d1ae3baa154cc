#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use abtest_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, round_half_up, Assignment, ComparisonRules,
    Experiment, ExperimentStatus, LayoutConfig, LayoutSettings, LayoutType, MetricEvent,
    MetricEventInput, MetricType, NewExperiment, NewVariant, Spacing, TargetModule, Variant,
    VariantComparison, VariantStats, Winner,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS experiments (
  experiment_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  description TEXT,
  target_module TEXT NOT NULL CHECK (
    target_module IN ('pir', 'competencies', 'performance', 'pdi')
  ),
  traffic_percentage INTEGER NOT NULL DEFAULT 100 CHECK (traffic_percentage BETWEEN 0 AND 100),
  status TEXT NOT NULL DEFAULT 'draft' CHECK (
    status IN ('draft', 'active', 'paused', 'completed')
  ),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS variants (
  variant_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL REFERENCES experiments(experiment_id),
  name TEXT NOT NULL,
  description TEXT,
  is_control INTEGER NOT NULL DEFAULT 0 CHECK (is_control IN (0, 1)),
  created_at TEXT NOT NULL,
  UNIQUE (experiment_id, variant_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_variants_single_control
  ON variants(experiment_id) WHERE is_control = 1;

CREATE TABLE IF NOT EXISTS assignments (
  assignment_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL,
  variant_id INTEGER NOT NULL,
  subject_id INTEGER NOT NULL,
  completed INTEGER NOT NULL DEFAULT 0 CHECK (completed IN (0, 1)),
  assigned_at TEXT NOT NULL,
  completed_at TEXT,
  UNIQUE (experiment_id, subject_id),
  FOREIGN KEY (experiment_id, variant_id) REFERENCES variants(experiment_id, variant_id)
);

CREATE INDEX IF NOT EXISTS idx_assignments_variant
  ON assignments(variant_id, assignment_id);

CREATE TABLE IF NOT EXISTS metric_events (
  metric_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL,
  variant_id INTEGER NOT NULL,
  subject_id INTEGER NOT NULL,
  metric_type TEXT NOT NULL CHECK (
    metric_type IN (
      'page_view',
      'time_on_page',
      'step_completion',
      'form_submission',
      'error_count',
      'satisfaction_rating',
      'task_completion_time'
    )
  ),
  metric_value REAL,
  metric_label TEXT,
  page_url TEXT,
  step_number INTEGER CHECK (step_number >= 1 OR step_number IS NULL),
  session_id TEXT,
  recorded_at TEXT NOT NULL,
  FOREIGN KEY (experiment_id, variant_id) REFERENCES variants(experiment_id, variant_id)
);

CREATE TRIGGER IF NOT EXISTS trg_metric_events_no_update
BEFORE UPDATE ON metric_events
BEGIN
  SELECT RAISE(FAIL, 'metric_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_metric_events_no_delete
BEFORE DELETE ON metric_events
BEGIN
  SELECT RAISE(FAIL, 'metric_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_metric_events_variant_type
  ON metric_events(variant_id, metric_type, metric_id);

CREATE TABLE IF NOT EXISTS layout_configs (
  config_id INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id INTEGER NOT NULL,
  variant_id INTEGER NOT NULL UNIQUE,
  layout_type TEXT NOT NULL CHECK (
    layout_type IN ('control', 'cards', 'grid', 'wizard', 'minimal')
  ),
  color_scheme TEXT,
  font_family TEXT,
  spacing TEXT NOT NULL DEFAULT 'normal' CHECK (spacing IN ('compact', 'normal', 'relaxed')),
  show_progress_bar INTEGER NOT NULL CHECK (show_progress_bar IN (0, 1)),
  show_step_numbers INTEGER NOT NULL CHECK (show_step_numbers IN (0, 1)),
  show_help_tooltips INTEGER NOT NULL CHECK (show_help_tooltips IN (0, 1)),
  animations_enabled INTEGER NOT NULL CHECK (animations_enabled IN (0, 1)),
  custom_css TEXT,
  FOREIGN KEY (experiment_id, variant_id) REFERENCES variants(experiment_id, variant_id)
);

CREATE TABLE IF NOT EXISTS ab_test_results (
  experiment_id INTEGER PRIMARY KEY REFERENCES experiments(experiment_id),
  variant_a_id INTEGER NOT NULL,
  variant_b_id INTEGER NOT NULL,
  sample_size_a INTEGER NOT NULL,
  sample_size_b INTEGER NOT NULL,
  conversion_rate_a INTEGER NOT NULL CHECK (conversion_rate_a BETWEEN 0 AND 100),
  conversion_rate_b INTEGER NOT NULL CHECK (conversion_rate_b BETWEEN 0 AND 100),
  avg_completion_time_a INTEGER NOT NULL,
  avg_completion_time_b INTEGER NOT NULL,
  satisfaction_score_a INTEGER NOT NULL,
  satisfaction_score_b INTEGER NOT NULL,
  dropoff_rate_a INTEGER NOT NULL CHECK (dropoff_rate_a BETWEEN 0 AND 100),
  dropoff_rate_b INTEGER NOT NULL CHECK (dropoff_rate_b BETWEEN 0 AND 100),
  winner TEXT NOT NULL CHECK (winner IN ('A', 'B', 'tie', 'insufficient_data')),
  confidence_level INTEGER NOT NULL CHECK (confidence_level BETWEEN 0 AND 100),
  is_statistically_significant INTEGER NOT NULL CHECK (is_statistically_significant IN (0, 1)),
  stats_a_json TEXT NOT NULL,
  stats_b_json TEXT NOT NULL
);
";

const EXPERIMENT_COLUMNS: &str = "experiment_id, name, description, target_module,
    traffic_percentage, status, created_at, updated_at";
const VARIANT_COLUMNS: &str =
    "variant_id, experiment_id, name, description, is_control, created_at";
const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, experiment_id, variant_id, subject_id, completed, assigned_at, completed_at";
const METRIC_COLUMNS: &str = "metric_id, experiment_id, variant_id, subject_id, metric_type,
    metric_value, metric_label, page_url, step_number, session_id, recorded_at";
const LAYOUT_COLUMNS: &str = "config_id, experiment_id, variant_id, layout_type, color_scheme,
    font_family, spacing, show_progress_bar, show_step_numbers, show_help_tooltips,
    animations_enabled, custom_css";
const RESULTS_COLUMNS: &str = "experiment_id, variant_a_id, variant_b_id,
    sample_size_a, sample_size_b, conversion_rate_a, conversion_rate_b,
    avg_completion_time_a, avg_completion_time_b, satisfaction_score_a, satisfaction_score_b,
    dropoff_rate_a, dropoff_rate_b, winner, confidence_level, is_statistically_significant,
    stats_a_json, stats_b_json";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub up_to_date: bool,
}

/// Cached comparison outcome for one experiment.
///
/// Satisfaction scores are stored multiplied by ten as integers. The row
/// carries no timestamps so a repeated save over unchanged data writes
/// identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultsRecord {
    pub experiment_id: i64,
    pub variant_a_id: i64,
    pub variant_b_id: i64,
    pub sample_size_a: u64,
    pub sample_size_b: u64,
    pub conversion_rate_a: u32,
    pub conversion_rate_b: u32,
    pub avg_completion_time_a: i64,
    pub avg_completion_time_b: i64,
    pub satisfaction_score_a: i64,
    pub satisfaction_score_b: i64,
    pub dropoff_rate_a: u32,
    pub dropoff_rate_b: u32,
    pub winner: Winner,
    pub confidence_level: u32,
    pub is_statistically_significant: bool,
    pub stats_a: VariantStats,
    pub stats_b: VariantStats,
}

impl ResultsRecord {
    #[must_use]
    pub fn from_comparison(comparison: &VariantComparison, rules: &ComparisonRules) -> Self {
        let a = &comparison.variant_a;
        let b = &comparison.variant_b;
        Self {
            experiment_id: comparison.experiment_id,
            variant_a_id: a.variant_id,
            variant_b_id: b.variant_id,
            sample_size_a: a.sample_size,
            sample_size_b: b.sample_size,
            conversion_rate_a: a.conversion_rate,
            conversion_rate_b: b.conversion_rate,
            avg_completion_time_a: a.avg_completion_time,
            avg_completion_time_b: b.avg_completion_time,
            satisfaction_score_a: scaled_satisfaction(a.avg_satisfaction_rating),
            satisfaction_score_b: scaled_satisfaction(b.avg_satisfaction_rating),
            dropoff_rate_a: a.dropoff_rate,
            dropoff_rate_b: b.dropoff_rate,
            winner: comparison.comparison.winner,
            confidence_level: comparison.comparison.confidence_level,
            is_statistically_significant: comparison.comparison.is_significant(rules),
            stats_a: a.clone(),
            stats_b: b.clone(),
        }
    }
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply experiment schema")?;

        let now = format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to register schema migration")?;

        tracing::debug!(
            version = SCHEMA_VERSION,
            newly_applied = inserted > 0,
            "schema migration checked"
        );
        Ok(())
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = if table_exists(&self.conn, "schema_migrations")? {
            self.conn
                .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                    row.get::<_, Option<i64>>(0)
                })
                .context("failed to query schema_migrations")?
                .unwrap_or(0)
        } else {
            0
        };

        Ok(SchemaStatus {
            current_version,
            target_version: SCHEMA_VERSION,
            up_to_date: current_version >= SCHEMA_VERSION,
        })
    }

    pub fn create_experiment(&self, input: &NewExperiment) -> Result<Experiment> {
        input.validate()?;

        let now = now_utc();
        let stamp = format_rfc3339(now)?;
        self.conn
            .execute(
                "INSERT INTO experiments(
                    name, description, target_module, traffic_percentage, status,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    input.name.trim(),
                    input.description,
                    input.target_module.as_str(),
                    i64::from(input.traffic_percentage),
                    ExperimentStatus::Draft.as_str(),
                    stamp,
                ],
            )
            .context("failed to insert experiment")?;

        Ok(Experiment {
            experiment_id: self.conn.last_insert_rowid(),
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            target_module: input.target_module,
            traffic_percentage: input.traffic_percentage,
            status: ExperimentStatus::Draft,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_experiments(&self) -> Result<Vec<Experiment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments ORDER BY experiment_id ASC"
        ))?;
        let rows = stmt.query_map([], parse_experiment_row)?;
        collect_rows(rows)
    }

    pub fn get_experiment(&self, experiment_id: i64) -> Result<Option<Experiment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE experiment_id = ?1"
        ))?;
        stmt.query_row(params![experiment_id], parse_experiment_row)
            .optional()
            .with_context(|| format!("failed to load experiment {experiment_id}"))
    }

    /// Writes a new status without checking the transition table.
    pub fn set_experiment_status(
        &self,
        experiment_id: i64,
        status: ExperimentStatus,
    ) -> Result<bool> {
        let stamp = format_rfc3339(now_utc())?;
        let changed = self
            .conn
            .execute(
                "UPDATE experiments SET status = ?2, updated_at = ?3 WHERE experiment_id = ?1",
                params![experiment_id, status.as_str(), stamp],
            )
            .with_context(|| format!("failed to update status of experiment {experiment_id}"))?;
        Ok(changed > 0)
    }

    pub fn create_variant(&self, experiment_id: i64, input: &NewVariant) -> Result<Variant> {
        input.validate()?;

        let now = now_utc();
        self.conn
            .execute(
                "INSERT INTO variants(experiment_id, name, description, is_control, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    experiment_id,
                    input.name.trim(),
                    input.description,
                    bool_to_sql(input.is_control),
                    format_rfc3339(now)?,
                ],
            )
            .context("failed to insert variant")?;

        Ok(Variant {
            variant_id: self.conn.last_insert_rowid(),
            experiment_id,
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            is_control: input.is_control,
            created_at: now,
        })
    }

    /// Variants of an experiment in ascending id order.
    pub fn list_variants(&self, experiment_id: i64) -> Result<Vec<Variant>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VARIANT_COLUMNS} FROM variants
             WHERE experiment_id = ?1
             ORDER BY variant_id ASC"
        ))?;
        let rows = stmt.query_map(params![experiment_id], parse_variant_row)?;
        collect_rows(rows)
    }

    pub fn get_variant(&self, variant_id: i64) -> Result<Option<Variant>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {VARIANT_COLUMNS} FROM variants WHERE variant_id = ?1"
        ))?;
        stmt.query_row(params![variant_id], parse_variant_row)
            .optional()
            .with_context(|| format!("failed to load variant {variant_id}"))
    }

    pub fn get_assignment(&self, experiment_id: i64, subject_id: i64) -> Result<Option<Assignment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
             WHERE experiment_id = ?1 AND subject_id = ?2"
        ))?;
        stmt.query_row(params![experiment_id, subject_id], parse_assignment_row)
            .optional()
            .context("failed to load assignment")
    }

    /// Inserts the first assignment for a subject; an existing assignment
    /// wins and is returned unchanged.
    pub fn insert_assignment(
        &self,
        experiment_id: i64,
        variant_id: i64,
        subject_id: i64,
    ) -> Result<Assignment> {
        self.conn
            .execute(
                "INSERT INTO assignments(experiment_id, variant_id, subject_id, completed, assigned_at)
                 VALUES (?1, ?2, ?3, 0, ?4)
                 ON CONFLICT(experiment_id, subject_id) DO NOTHING",
                params![experiment_id, variant_id, subject_id, format_rfc3339(now_utc())?],
            )
            .context("failed to insert assignment")?;

        self.get_assignment(experiment_id, subject_id)?
            .ok_or_else(|| anyhow!("assignment for subject {subject_id} missing after insert"))
    }

    pub fn mark_completed(&self, experiment_id: i64, subject_id: i64) -> Result<Option<Assignment>> {
        self.conn
            .execute(
                "UPDATE assignments
                 SET completed = 1, completed_at = COALESCE(completed_at, ?3)
                 WHERE experiment_id = ?1 AND subject_id = ?2",
                params![experiment_id, subject_id, format_rfc3339(now_utc())?],
            )
            .context("failed to mark assignment completed")?;

        self.get_assignment(experiment_id, subject_id)
    }

    pub fn list_assignments_for_variant(&self, variant_id: i64) -> Result<Vec<Assignment>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments
             WHERE variant_id = ?1
             ORDER BY assignment_id ASC"
        ))?;
        let rows = stmt.query_map(params![variant_id], parse_assignment_row)?;
        collect_rows(rows)
    }

    pub fn append_metric(&self, input: &MetricEventInput) -> Result<MetricEvent> {
        input.validate()?;

        let recorded_at = now_utc();
        self.conn
            .execute(
                "INSERT INTO metric_events(
                    experiment_id, variant_id, subject_id, metric_type, metric_value,
                    metric_label, page_url, step_number, session_id, recorded_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    input.experiment_id,
                    input.variant_id,
                    input.subject_id,
                    input.metric_type.as_str(),
                    input.metric_value,
                    input.metric_label,
                    input.page_url,
                    input.step_number.map(i64::from),
                    input.session_id,
                    format_rfc3339(recorded_at)?,
                ],
            )
            .context("failed to append metric event")?;

        Ok(MetricEvent {
            metric_id: self.conn.last_insert_rowid(),
            experiment_id: input.experiment_id,
            variant_id: input.variant_id,
            subject_id: input.subject_id,
            metric_type: input.metric_type,
            metric_value: input.metric_value,
            metric_label: input.metric_label.clone(),
            page_url: input.page_url.clone(),
            step_number: input.step_number,
            session_id: input.session_id.clone(),
            recorded_at,
        })
    }

    pub fn list_events_for_variant(&self, variant_id: i64) -> Result<Vec<MetricEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {METRIC_COLUMNS} FROM metric_events
             WHERE variant_id = ?1
             ORDER BY metric_id ASC"
        ))?;
        let rows = stmt.query_map(params![variant_id], parse_metric_row)?;
        collect_rows(rows)
    }

    pub fn upsert_layout_config(
        &self,
        experiment_id: i64,
        variant_id: i64,
        settings: &LayoutSettings,
    ) -> Result<LayoutConfig> {
        self.conn
            .execute(
                "INSERT INTO layout_configs(
                    experiment_id, variant_id, layout_type, color_scheme, font_family, spacing,
                    show_progress_bar, show_step_numbers, show_help_tooltips, animations_enabled,
                    custom_css
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(variant_id) DO UPDATE SET
                    layout_type = excluded.layout_type,
                    color_scheme = excluded.color_scheme,
                    font_family = excluded.font_family,
                    spacing = excluded.spacing,
                    show_progress_bar = excluded.show_progress_bar,
                    show_step_numbers = excluded.show_step_numbers,
                    show_help_tooltips = excluded.show_help_tooltips,
                    animations_enabled = excluded.animations_enabled,
                    custom_css = excluded.custom_css",
                params![
                    experiment_id,
                    variant_id,
                    settings.layout_type.as_str(),
                    settings.color_scheme,
                    settings.font_family,
                    settings.spacing.as_str(),
                    bool_to_sql(settings.show_progress_bar),
                    bool_to_sql(settings.show_step_numbers),
                    bool_to_sql(settings.show_help_tooltips),
                    bool_to_sql(settings.animations_enabled),
                    settings.custom_css,
                ],
            )
            .context("failed to upsert layout config")?;

        self.get_layout_config(variant_id)?
            .ok_or_else(|| anyhow!("layout config for variant {variant_id} missing after upsert"))
    }

    pub fn get_layout_config(&self, variant_id: i64) -> Result<Option<LayoutConfig>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {LAYOUT_COLUMNS} FROM layout_configs WHERE variant_id = ?1"
        ))?;
        stmt.query_row(params![variant_id], parse_layout_row)
            .optional()
            .with_context(|| format!("failed to load layout config for variant {variant_id}"))
    }

    pub fn upsert_results(&self, record: &ResultsRecord) -> Result<()> {
        let stats_a_json =
            serde_json::to_string(&record.stats_a).context("failed to serialize stats_a")?;
        let stats_b_json =
            serde_json::to_string(&record.stats_b).context("failed to serialize stats_b")?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO ab_test_results({RESULTS_COLUMNS})
                     VALUES (
                        ?1, ?2, ?3,
                        ?4, ?5, ?6, ?7,
                        ?8, ?9, ?10, ?11,
                        ?12, ?13, ?14, ?15, ?16,
                        ?17, ?18
                     )
                     ON CONFLICT(experiment_id) DO UPDATE SET
                        variant_a_id = excluded.variant_a_id,
                        variant_b_id = excluded.variant_b_id,
                        sample_size_a = excluded.sample_size_a,
                        sample_size_b = excluded.sample_size_b,
                        conversion_rate_a = excluded.conversion_rate_a,
                        conversion_rate_b = excluded.conversion_rate_b,
                        avg_completion_time_a = excluded.avg_completion_time_a,
                        avg_completion_time_b = excluded.avg_completion_time_b,
                        satisfaction_score_a = excluded.satisfaction_score_a,
                        satisfaction_score_b = excluded.satisfaction_score_b,
                        dropoff_rate_a = excluded.dropoff_rate_a,
                        dropoff_rate_b = excluded.dropoff_rate_b,
                        winner = excluded.winner,
                        confidence_level = excluded.confidence_level,
                        is_statistically_significant = excluded.is_statistically_significant,
                        stats_a_json = excluded.stats_a_json,
                        stats_b_json = excluded.stats_b_json"
                ),
                params![
                    record.experiment_id,
                    record.variant_a_id,
                    record.variant_b_id,
                    count_to_sql(record.sample_size_a)?,
                    count_to_sql(record.sample_size_b)?,
                    i64::from(record.conversion_rate_a),
                    i64::from(record.conversion_rate_b),
                    record.avg_completion_time_a,
                    record.avg_completion_time_b,
                    record.satisfaction_score_a,
                    record.satisfaction_score_b,
                    i64::from(record.dropoff_rate_a),
                    i64::from(record.dropoff_rate_b),
                    record.winner.as_str(),
                    i64::from(record.confidence_level),
                    bool_to_sql(record.is_statistically_significant),
                    stats_a_json,
                    stats_b_json,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to upsert results for experiment {}",
                    record.experiment_id
                )
            })?;

        Ok(())
    }

    pub fn get_results(&self, experiment_id: i64) -> Result<Option<ResultsRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESULTS_COLUMNS} FROM ab_test_results WHERE experiment_id = ?1"
        ))?;
        stmt.query_row(params![experiment_id], parse_results_row)
            .optional()
            .with_context(|| format!("failed to load results for experiment {experiment_id}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn parse_experiment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experiment> {
    let target_raw: String = row.get(3)?;
    let status_raw: String = row.get(5)?;

    Ok(Experiment {
        experiment_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        target_module: TargetModule::parse(&target_raw).ok_or_else(|| {
            invalid_column(3, Type::Text, format!("invalid target_module: {target_raw}"))
        })?,
        traffic_percentage: column_u8(row, 4)?,
        status: ExperimentStatus::parse(&status_raw).ok_or_else(|| {
            invalid_column(5, Type::Text, format!("invalid status: {status_raw}"))
        })?,
        created_at: column_timestamp(row, 6)?,
        updated_at: column_timestamp(row, 7)?,
    })
}

fn parse_variant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Variant> {
    Ok(Variant {
        variant_id: row.get(0)?,
        experiment_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_control: column_bool(row, 4)?,
        created_at: column_timestamp(row, 5)?,
    })
}

fn parse_assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assignment> {
    let completed_raw: Option<String> = row.get(6)?;
    let completed_at = completed_raw
        .as_deref()
        .map(|raw| {
            parse_rfc3339_utc(raw).map_err(|err| invalid_column(6, Type::Text, err.to_string()))
        })
        .transpose()?;

    Ok(Assignment {
        assignment_id: row.get(0)?,
        experiment_id: row.get(1)?,
        variant_id: row.get(2)?,
        subject_id: row.get(3)?,
        completed: column_bool(row, 4)?,
        assigned_at: column_timestamp(row, 5)?,
        completed_at,
    })
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricEvent> {
    let metric_type_raw: String = row.get(4)?;
    let step_raw: Option<i64> = row.get(8)?;
    let step_number = step_raw
        .map(|value| {
            u32::try_from(value).map_err(|_| {
                invalid_column(8, Type::Integer, format!("invalid step_number: {value}"))
            })
        })
        .transpose()?;

    Ok(MetricEvent {
        metric_id: row.get(0)?,
        experiment_id: row.get(1)?,
        variant_id: row.get(2)?,
        subject_id: row.get(3)?,
        metric_type: MetricType::parse(&metric_type_raw).ok_or_else(|| {
            invalid_column(4, Type::Text, format!("invalid metric_type: {metric_type_raw}"))
        })?,
        metric_value: row.get(5)?,
        metric_label: row.get(6)?,
        page_url: row.get(7)?,
        step_number,
        session_id: row.get(9)?,
        recorded_at: column_timestamp(row, 10)?,
    })
}

fn parse_layout_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LayoutConfig> {
    let layout_raw: String = row.get(3)?;
    let spacing_raw: String = row.get(6)?;

    Ok(LayoutConfig {
        config_id: row.get(0)?,
        experiment_id: row.get(1)?,
        variant_id: row.get(2)?,
        settings: LayoutSettings {
            layout_type: LayoutType::parse(&layout_raw).ok_or_else(|| {
                invalid_column(3, Type::Text, format!("invalid layout_type: {layout_raw}"))
            })?,
            color_scheme: row.get(4)?,
            font_family: row.get(5)?,
            spacing: Spacing::parse(&spacing_raw).ok_or_else(|| {
                invalid_column(6, Type::Text, format!("invalid spacing: {spacing_raw}"))
            })?,
            show_progress_bar: column_bool(row, 7)?,
            show_step_numbers: column_bool(row, 8)?,
            show_help_tooltips: column_bool(row, 9)?,
            animations_enabled: column_bool(row, 10)?,
            custom_css: row.get(11)?,
        },
    })
}

fn parse_results_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResultsRecord> {
    let winner_raw: String = row.get(13)?;
    let stats_a_raw: String = row.get(16)?;
    let stats_b_raw: String = row.get(17)?;

    Ok(ResultsRecord {
        experiment_id: row.get(0)?,
        variant_a_id: row.get(1)?,
        variant_b_id: row.get(2)?,
        sample_size_a: column_u64(row, 3)?,
        sample_size_b: column_u64(row, 4)?,
        conversion_rate_a: column_u32(row, 5)?,
        conversion_rate_b: column_u32(row, 6)?,
        avg_completion_time_a: row.get(7)?,
        avg_completion_time_b: row.get(8)?,
        satisfaction_score_a: row.get(9)?,
        satisfaction_score_b: row.get(10)?,
        dropoff_rate_a: column_u32(row, 11)?,
        dropoff_rate_b: column_u32(row, 12)?,
        winner: Winner::parse(&winner_raw).ok_or_else(|| {
            invalid_column(13, Type::Text, format!("invalid winner: {winner_raw}"))
        })?,
        confidence_level: column_u32(row, 14)?,
        is_statistically_significant: column_bool(row, 15)?,
        stats_a: serde_json::from_str(&stats_a_raw)
            .map_err(|err| invalid_column(16, Type::Text, format!("invalid stats_a_json: {err}")))?,
        stats_b: serde_json::from_str(&stats_b_raw)
            .map_err(|err| invalid_column(17, Type::Text, format!("invalid stats_b_json: {err}")))?,
    })
}

fn column_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(idx)?;
    parse_rfc3339_utc(&raw).map_err(|err| invalid_column(idx, Type::Text, err.to_string()))
}

fn column_bool(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<bool> {
    let raw: i64 = row.get(idx)?;
    match raw {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(invalid_column(
            idx,
            Type::Integer,
            format!("invalid boolean flag: {other}"),
        )),
    }
}

fn column_u8(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u8> {
    let raw: i64 = row.get(idx)?;
    u8::try_from(raw).map_err(|_| invalid_column(idx, Type::Integer, format!("out of range: {raw}")))
}

fn column_u32(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u32> {
    let raw: i64 = row.get(idx)?;
    u32::try_from(raw)
        .map_err(|_| invalid_column(idx, Type::Integer, format!("out of range: {raw}")))
}

fn column_u64(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    u64::try_from(raw)
        .map_err(|_| invalid_column(idx, Type::Integer, format!("out of range: {raw}")))
}

fn invalid_column(idx: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn count_to_sql(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count does not fit in sqlite integer: {value}"))
}

#[allow(clippy::cast_possible_truncation)]
fn scaled_satisfaction(value: f64) -> i64 {
    round_half_up(value * 10.0) as i64
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
