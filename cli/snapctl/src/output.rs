//! Output formatting for CLI commands.

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};
use volsnap_engine::plan::{Plan, Task, TaskState};
use volsnap_engine::SnapshotRecord;
use volsnap_events::{EventEnvelope, PlanEvent};

const CLI_SCHEMA_VERSION: &str = "volsnap.cli.v1";

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print data in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                let table = Table::new(data).to_string();
                println!("{}", table);
            }
        }
        OutputFormat::Json => {
            let json = format_json(data, "[]");
            println!("{}", json);
        }
    }
}

/// Print a single item as JSON.
pub fn print_single<T: Serialize>(data: &T) {
    println!("{}", format_json(data, "{}"));
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "Warning:".yellow().bold(), message);
}

#[derive(Debug, Serialize, Tabled)]
struct TaskRow {
    #[tabled(rename = "Node")]
    node: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Task")]
    description: String,

    #[tabled(rename = "Detail")]
    detail: String,
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        let detail = match (&task.failure, &task.note) {
            (Some(failure), _) => failure.message.clone(),
            (None, Some(note)) => note.clone(),
            (None, None) => "-".to_string(),
        };
        Self {
            node: task.node.to_string(),
            state: task.state.to_string(),
            description: task.description.clone(),
            detail,
        }
    }
}

/// Print a plan phase by phase.
pub fn print_plan(plan: &Plan, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_single(plan);
        return;
    }

    println!(
        "{} {}  {} {}",
        "Plan:".bold(),
        plan.id,
        "State:".bold(),
        colored_state(&plan.state.to_string())
    );
    for warning in &plan.warnings {
        print_warning(warning);
    }
    for (index, phase) in plan.phases.iter().enumerate() {
        println!("\n{} {}", format!("Phase {}:", index + 1).bold(), phase.description);
        let rows: Vec<TaskRow> = phase.tasks.iter().map(TaskRow::from).collect();
        println!("{}", Table::new(rows));
    }

    let counts = plan.counts();
    println!(
        "\nTasks: {} total, {} succeeded, {} failed, {} pending",
        counts.total(),
        counts.succeeded,
        counts.failed,
        counts.pending
    );
}

fn colored_state(state: &str) -> colored::ColoredString {
    match state {
        "Successful" | "Success" => state.green(),
        "Failed" => state.red(),
        "Stopping" | "Stopped" => state.yellow(),
        _ => state.normal(),
    }
}

#[derive(Debug, Serialize, Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "State")]
    state: String,

    #[tabled(rename = "Created")]
    created_at: String,

    #[tabled(rename = "Completed")]
    timestamp: String,

    #[tabled(rename = "Nodes")]
    nodes: usize,
}

/// Print the persisted snapshot records.
pub fn print_snapshots(records: &[SnapshotRecord], format: OutputFormat) {
    if format == OutputFormat::Json {
        print_single(&records);
        return;
    }

    let rows: Vec<SnapshotRow> = records
        .iter()
        .map(|r| SnapshotRow {
            name: r.key.clone(),
            state: r.state.to_string(),
            created_at: r.created_at.to_rfc3339(),
            timestamp: r
                .timestamp
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
            nodes: r.nodes.len(),
        })
        .collect();
    print_output(&rows, format);
}

/// Print a progress event while a plan runs.
pub fn print_event(event: &EventEnvelope<PlanEvent>, format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string(event).unwrap_or_default());
        return;
    }

    match &event.payload {
        PlanEvent::PlanStarted(p) => print_info(&format!(
            "Running {} plan {} ({} phases, {} tasks)",
            p.operation, event.plan_id, p.phase_count, p.task_count
        )),
        PlanEvent::PlanWarning(p) => print_warning(&p.message),
        PlanEvent::PhaseStarted(p) => {
            println!("{} {}", format!("Phase {}:", p.phase).bold(), p.description)
        }
        PlanEvent::TaskStarted(_) => {}
        PlanEvent::TaskSucceeded(p) => {
            if let Some(note) = &p.note {
                println!("  {} {}", p.node, note.dimmed());
            }
        }
        PlanEvent::TaskFailed(p) => {
            println!("  {} {} {}", p.node, TaskState::Failed.to_string().red(), p.message)
        }
        PlanEvent::PlanFinished(p) => println!(
            "{} {} ({} succeeded, {} failed, {} pending)",
            "Finished:".bold(),
            p.outcome,
            p.succeeded,
            p.failed,
            p.pending
        ),
    }
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    let value = serde_json::to_value(data).unwrap_or_else(|_| serde_json::json!({}));
    let wrapped = wrap_with_schema(value);
    let sorted = sort_json_value(wrapped);
    serde_json::to_string_pretty(&sorted).unwrap_or_else(|_| fallback.to_string())
}

fn wrap_with_schema(value: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "schemaVersion": CLI_SCHEMA_VERSION,
        "data": value
    })
}

fn sort_json_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Array(values) => {
            serde_json::Value::Array(values.into_iter().map(sort_json_value).collect())
        }
        serde_json::Value::Object(entries) => {
            let mut pairs: Vec<_> = entries.into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            let mut mapped = serde_json::Map::new();
            for (key, value) in pairs {
                mapped.insert(key, sort_json_value(value));
            }
            serde_json::Value::Object(mapped)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_is_wrapped_and_sorted() {
        let json = format_json(&serde_json::json!({ "state": "applied", "key": "snapshot" }), "{}");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["schemaVersion"], CLI_SCHEMA_VERSION);
        let keys: Vec<&String> = value["data"].as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["key", "state"]);
    }

    #[test]
    fn test_task_row_prefers_failure_over_note() {
        use volsnap_engine::plan::{TaskFailure, TaskKind};
        use volsnap_engine::FailureKind;
        use volsnap_id::NodeId;

        let mut task = Task::new(
            NodeId::parse("n1").unwrap(),
            TaskKind::CheckNodeReachable,
            "Check node \"n1\" is reachable",
        );
        task.note = Some("note".into());
        task.failure = Some(TaskFailure::new(FailureKind::Unreachable, "Unreachable node(s): n1"));

        let row = TaskRow::from(&task);
        assert_eq!(row.detail, "Unreachable node(s): n1");
        assert_eq!(row.state, "Initial");
    }
}
