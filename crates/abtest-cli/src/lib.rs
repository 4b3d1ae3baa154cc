//! Operator command surface for layout experiments.
//!
//! Every command prints one pretty JSON document on stdout. Diagnostics go
//! to stderr through `tracing`, so stdout stays machine-readable.

use std::path::PathBuf;

use abtest_api::{AbTestApi, LayoutConfigRequest};
use abtest_core::{
    ExperimentStatus, LayoutSettings, LayoutType, MetricEventInput, MetricType, NewExperiment,
    NewVariant, Spacing, TargetModule,
};
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "abt")]
#[command(about = "Layout A/B experiment CLI")]
pub struct Cli {
    #[arg(long, env = "ABTEST_DB", default_value = "./abtest.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Experiment {
        #[command(subcommand)]
        command: Box<ExperimentCommand>,
    },
    Variant {
        #[command(subcommand)]
        command: VariantCommand,
    },
    Assign {
        #[command(subcommand)]
        command: AssignCommand,
    },
    Metric {
        #[command(subcommand)]
        command: Box<MetricCommand>,
    },
    Layout {
        #[command(subcommand)]
        command: Box<LayoutCommand>,
    },
    Comparison {
        #[command(subcommand)]
        command: ExperimentScopedCommand,
    },
    Results {
        #[command(subcommand)]
        command: ResultsCommand,
    },
    Funnel {
        #[command(subcommand)]
        command: ExperimentScopedCommand,
    },
    Steps {
        #[command(subcommand)]
        command: ExperimentScopedCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate {
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ExperimentCommand {
    Create(ExperimentCreateArgs),
    List,
    Show(ExperimentIdArgs),
    Status(ExperimentStatusArgs),
}

#[derive(Debug, Args)]
pub struct ExperimentCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    target_module: TargetModuleArg,
    #[arg(long, default_value_t = 100)]
    traffic_percentage: u8,
}

#[derive(Debug, Args)]
pub struct ExperimentIdArgs {
    #[arg(long)]
    experiment_id: i64,
}

#[derive(Debug, Args)]
pub struct ExperimentStatusArgs {
    #[arg(long)]
    experiment_id: i64,
    #[arg(long)]
    to: StatusArg,
}

#[derive(Debug, Subcommand)]
pub enum VariantCommand {
    Create(VariantCreateArgs),
}

#[derive(Debug, Args)]
pub struct VariantCreateArgs {
    #[arg(long)]
    experiment_id: i64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    control: bool,
}

#[derive(Debug, Subcommand)]
pub enum AssignCommand {
    Subject(SubjectArgs),
    Complete(SubjectArgs),
}

#[derive(Debug, Args)]
pub struct SubjectArgs {
    #[arg(long)]
    experiment_id: i64,
    #[arg(long)]
    subject_id: i64,
}

#[derive(Debug, Subcommand)]
pub enum MetricCommand {
    Record(MetricRecordArgs),
}

#[derive(Debug, Args)]
pub struct MetricRecordArgs {
    #[arg(long)]
    experiment_id: i64,
    #[arg(long)]
    variant_id: i64,
    #[arg(long)]
    subject_id: i64,
    #[arg(long = "type")]
    metric_type: MetricTypeArg,
    #[arg(long)]
    value: Option<f64>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    page_url: Option<String>,
    #[arg(long)]
    step: Option<u32>,
    #[arg(long)]
    session_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum LayoutCommand {
    Create(LayoutCreateArgs),
    Show(SubjectArgs),
}

#[derive(Debug, Args)]
#[allow(clippy::struct_excessive_bools)]
pub struct LayoutCreateArgs {
    #[arg(long)]
    experiment_id: i64,
    #[arg(long)]
    variant_id: i64,
    #[arg(long = "type")]
    layout_type: LayoutTypeArg,
    #[arg(long)]
    color_scheme: Option<String>,
    #[arg(long)]
    font_family: Option<String>,
    #[arg(long, default_value = "normal")]
    spacing: SpacingArg,
    #[arg(long)]
    hide_progress_bar: bool,
    #[arg(long)]
    hide_step_numbers: bool,
    #[arg(long)]
    help_tooltips: bool,
    #[arg(long)]
    no_animations: bool,
    #[arg(long)]
    custom_css: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ExperimentScopedCommand {
    Show(ExperimentIdArgs),
}

#[derive(Debug, Subcommand)]
pub enum ResultsCommand {
    Save(ExperimentIdArgs),
    Show(ExperimentIdArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TargetModuleArg {
    Pir,
    Competencies,
    Performance,
    Pdi,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Draft,
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MetricTypeArg {
    PageView,
    TimeOnPage,
    StepCompletion,
    FormSubmission,
    ErrorCount,
    SatisfactionRating,
    TaskCompletionTime,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LayoutTypeArg {
    Control,
    Cards,
    Grid,
    Wizard,
    Minimal,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SpacingArg {
    Compact,
    Normal,
    Relaxed,
}

/// Executes the parsed top-level CLI command graph.
///
/// Data commands run against an already migrated database; `db migrate`
/// is the only command that changes the schema.
///
/// # Errors
/// Returns an error when the store cannot be opened or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let api = AbTestApi::new(cli.db);
    run_command(cli.command, &api)
}

/// Executes one command against the provided facade.
///
/// # Errors
/// Returns an error when validation, persistence, or retrieval fails.
pub fn run_command(command: Command, api: &AbTestApi) -> Result<()> {
    match command {
        Command::Db {
            command: DbCommand::Migrate { dry_run },
        } => print_json(&api.migrate(dry_run)?),
        Command::Experiment { command } => run_experiment(*command, api),
        Command::Variant {
            command: VariantCommand::Create(args),
        } => {
            let input = NewVariant {
                name: args.name,
                description: args.description,
                is_control: args.control,
            };
            print_json(&api.create_variant(args.experiment_id, &input)?)
        }
        Command::Assign { command } => match command {
            AssignCommand::Subject(args) => {
                print_json(&api.assign_subject(args.experiment_id, args.subject_id)?)
            }
            AssignCommand::Complete(args) => {
                let completed = api
                    .mark_completed(args.experiment_id, args.subject_id)?
                    .ok_or_else(|| {
                        anyhow!(
                            "assignment for subject {} in experiment {} not found",
                            args.subject_id,
                            args.experiment_id
                        )
                    })?;
                print_json(&completed)
            }
        },
        Command::Metric { command } => {
            let MetricCommand::Record(args) = *command;
            let input = MetricEventInput {
                experiment_id: args.experiment_id,
                variant_id: args.variant_id,
                subject_id: args.subject_id,
                metric_type: map_metric_type(args.metric_type),
                metric_value: args.value,
                metric_label: args.label,
                page_url: args.page_url,
                step_number: args.step,
                session_id: args.session_id,
            };
            print_json(&api.record_metric(&input)?)
        }
        Command::Layout { command } => run_layout(*command, api),
        Command::Comparison {
            command: ExperimentScopedCommand::Show(args),
        } => print_json(&api.get_comparison(args.experiment_id)),
        Command::Results { command } => match command {
            ResultsCommand::Save(args) => print_json(&api.save_results(args.experiment_id)?),
            ResultsCommand::Show(args) => print_json(&api.get_results(args.experiment_id)?),
        },
        Command::Funnel {
            command: ExperimentScopedCommand::Show(args),
        } => print_json(&api.conversion_funnel(args.experiment_id)),
        Command::Steps {
            command: ExperimentScopedCommand::Show(args),
        } => print_json(&api.step_completion_rates(args.experiment_id)),
    }
}

fn run_experiment(command: ExperimentCommand, api: &AbTestApi) -> Result<()> {
    match command {
        ExperimentCommand::Create(args) => {
            let input = NewExperiment {
                name: args.name,
                description: args.description,
                target_module: map_target_module(args.target_module),
                traffic_percentage: args.traffic_percentage,
            };
            print_json(&api.create_experiment(&input)?)
        }
        ExperimentCommand::List => print_json(&api.list_experiments()?),
        ExperimentCommand::Show(args) => print_json(&api.get_experiment(args.experiment_id)?),
        ExperimentCommand::Status(args) => {
            print_json(&api.update_status(args.experiment_id, map_status(args.to))?)
        }
    }
}

fn run_layout(command: LayoutCommand, api: &AbTestApi) -> Result<()> {
    match command {
        LayoutCommand::Create(args) => {
            let request = LayoutConfigRequest {
                variant_id: args.variant_id,
                settings: LayoutSettings {
                    layout_type: map_layout_type(args.layout_type),
                    color_scheme: args.color_scheme,
                    font_family: args.font_family,
                    spacing: map_spacing(args.spacing),
                    show_progress_bar: !args.hide_progress_bar,
                    show_step_numbers: !args.hide_step_numbers,
                    show_help_tooltips: args.help_tooltips,
                    animations_enabled: !args.no_animations,
                    custom_css: args.custom_css,
                },
            };
            print_json(&api.create_layout_config(args.experiment_id, &request)?)
        }
        LayoutCommand::Show(args) => {
            print_json(&api.layout_config_for_subject(args.experiment_id, args.subject_id)?)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn map_target_module(value: TargetModuleArg) -> TargetModule {
    match value {
        TargetModuleArg::Pir => TargetModule::Pir,
        TargetModuleArg::Competencies => TargetModule::Competencies,
        TargetModuleArg::Performance => TargetModule::Performance,
        TargetModuleArg::Pdi => TargetModule::Pdi,
    }
}

fn map_status(value: StatusArg) -> ExperimentStatus {
    match value {
        StatusArg::Draft => ExperimentStatus::Draft,
        StatusArg::Active => ExperimentStatus::Active,
        StatusArg::Paused => ExperimentStatus::Paused,
        StatusArg::Completed => ExperimentStatus::Completed,
    }
}

fn map_metric_type(value: MetricTypeArg) -> MetricType {
    match value {
        MetricTypeArg::PageView => MetricType::PageView,
        MetricTypeArg::TimeOnPage => MetricType::TimeOnPage,
        MetricTypeArg::StepCompletion => MetricType::StepCompletion,
        MetricTypeArg::FormSubmission => MetricType::FormSubmission,
        MetricTypeArg::ErrorCount => MetricType::ErrorCount,
        MetricTypeArg::SatisfactionRating => MetricType::SatisfactionRating,
        MetricTypeArg::TaskCompletionTime => MetricType::TaskCompletionTime,
    }
}

fn map_layout_type(value: LayoutTypeArg) -> LayoutType {
    match value {
        LayoutTypeArg::Control => LayoutType::Control,
        LayoutTypeArg::Cards => LayoutType::Cards,
        LayoutTypeArg::Grid => LayoutType::Grid,
        LayoutTypeArg::Wizard => LayoutType::Wizard,
        LayoutTypeArg::Minimal => LayoutType::Minimal,
    }
}

fn map_spacing(value: SpacingArg) -> Spacing {
    match value {
        SpacingArg::Compact => Spacing::Compact,
        SpacingArg::Normal => Spacing::Normal,
        SpacingArg::Relaxed => Spacing::Relaxed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_graph_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn metric_record_parses_kebab_case_type() {
        let parsed = Cli::try_parse_from([
            "abt",
            "--db",
            "/tmp/abt.sqlite3",
            "metric",
            "record",
            "--experiment-id",
            "1",
            "--variant-id",
            "2",
            "--subject-id",
            "3",
            "--type",
            "step-completion",
            "--step",
            "2",
        ]);
        let cli = match parsed {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse metric record: {err}"),
        };
        match cli.command {
            Command::Metric { command } => {
                let MetricCommand::Record(args) = *command;
                assert!(matches!(args.metric_type, MetricTypeArg::StepCompletion));
                assert_eq!(args.step, Some(2));
                assert_eq!(args.value, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn layout_flags_invert_into_settings_defaults() {
        let parsed = Cli::try_parse_from([
            "abt",
            "layout",
            "create",
            "--experiment-id",
            "1",
            "--variant-id",
            "2",
            "--type",
            "wizard",
        ]);
        let cli = match parsed {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse layout create: {err}"),
        };
        let Command::Layout { command } = cli.command else {
            panic!("expected layout command");
        };
        let LayoutCommand::Create(args) = *command else {
            panic!("expected layout create");
        };
        assert!(matches!(args.spacing, SpacingArg::Normal));
        assert!(!args.hide_progress_bar);
        assert!(!args.help_tooltips);
        assert_eq!(map_layout_type(args.layout_type), LayoutType::Wizard);
    }

    #[test]
    fn unknown_target_module_is_rejected() {
        let parsed = Cli::try_parse_from([
            "abt",
            "experiment",
            "create",
            "--name",
            "x",
            "--target-module",
            "payroll",
        ]);
        assert!(parsed.is_err());
    }
}
