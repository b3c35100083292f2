use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, Table};
use genq_core::{QueueMessage, SafeTask};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Table,
    Json,
    Yaml,
}

/// Print `value` as JSON or YAML, or fall back to `table` for table output.
pub fn emit<T: Serialize>(format: Format, value: &T, table: impl FnOnce() -> Table) -> anyhow::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Yaml => print!("{}", serde_yaml::to_string(value)?),
        Format::Table => println!("{}", table()),
    }
    Ok(())
}

pub fn task_table(task: &SafeTask) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID", task.task_id.as_str()]);
    table.add_row(vec!["Status", &task.status.to_string()]);
    table.add_row(vec!["Prompt", &truncate(&task.prompt, 60)]);
    if let (Some(w), Some(h)) = (task.width, task.height) {
        table.add_row(vec!["Size".to_string(), format!("{}x{}", w, h)]);
    }
    table.add_row(vec!["Retry Count", &task.retry_count.to_string()]);
    if let Some(id) = &task.prediction_id {
        table.add_row(vec!["Prediction", id]);
    }
    if let Some(billing) = &task.billing {
        table.add_row(vec![
            "Billing".to_string(),
            format!("{:.2} ({:?})", billing.cost, billing.status),
        ]);
    }
    if let Some(urls) = &task.result_urls {
        table.add_row(vec!["Results".to_string(), urls.join("\n")]);
    }
    if let Some(error) = &task.error {
        table.add_row(vec!["Error", error]);
    }
    table.add_row(vec!["Created", &task.created_at.to_rfc3339()]);
    table.add_row(vec!["Updated", &task.updated_at.to_rfc3339()]);
    if let Some(done) = task.completed_at {
        table.add_row(vec!["Completed".to_string(), done.to_rfc3339()]);
    }
    table
}

/// One line per observed transition, used by `watch`.
pub fn transition_line(task: &SafeTask) -> String {
    let mut line = format!(
        "{}  {:<20} retries={}",
        task.updated_at.format("%H:%M:%S%.3f"),
        task.status.to_string(),
        task.retry_count
    );
    if let Some(error) = &task.error {
        line.push_str(&format!("  error={}", error));
    }
    if let Some(urls) = &task.result_urls {
        line.push_str(&format!("  results={}", urls.len()));
    }
    line
}

pub fn dead_letter_table(messages: &[QueueMessage]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Task ID", "Owner", "Retries", "Failed At", "Reason", "Prompt"]);
    for message in messages {
        table.add_row(vec![
            message.task_id.clone(),
            message.owner_identity.clone(),
            message.retry_count.to_string(),
            message.failed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            message.reason.clone().unwrap_or_default(),
            truncate(&message.params.prompt, 40),
        ]);
    }
    table
}

pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
