//! Operator-facing output.
//!
//! Structured logs go through `tracing`; these helpers write the progress
//! lines, diffs and ECS events an operator watches during a rollout.

use std::collections::BTreeMap;

use owo_colors::OwoColorize;
use tabled::{Table, Tabled};

/// Color a service's output is printed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeployColor {
    Blue,
    Magenta,
    White,
    Cyan,
}

impl DeployColor {
    /// Colors handed out to services in iteration order.
    pub const PALETTE: [DeployColor; 4] = [
        DeployColor::Blue,
        DeployColor::Magenta,
        DeployColor::White,
        DeployColor::Cyan,
    ];

    /// Color for the service at `index`, cycling through the whole palette.
    pub fn for_index(index: usize) -> Self {
        Self::PALETTE[index % Self::PALETTE.len()]
    }

    pub fn paint(&self, text: &str) -> String {
        match self {
            DeployColor::Blue => text.blue().to_string(),
            DeployColor::Magenta => text.magenta().to_string(),
            DeployColor::White => text.white().to_string(),
            DeployColor::Cyan => text.cyan().to_string(),
        }
    }
}

fn indent(text: &str, level: usize) -> String {
    format!("{}{}", "  ".repeat(level), text)
}

pub fn log(text: &str) {
    println!("{}", text.green());
}

pub fn log_bold(text: &str) {
    println!("{}", text.green().bold());
}

pub fn log_err(text: &str) {
    eprintln!("{}", text.red().bold());
}

pub fn log_intent(text: &str) {
    println!("{}", indent(text, 1).green());
}

pub fn log_intent_err(text: &str) {
    println!("{}", indent(text, 1).red());
}

pub fn log_with_color(text: &str, color: DeployColor) {
    println!("{}", color.paint(&indent(text, 2)));
}

/// One changed key in an environment or secrets diff.
#[derive(Debug, Clone, PartialEq, Eq, Tabled)]
pub struct DiffRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Old value")]
    pub old_value: String,
    #[tabled(rename = "Current value")]
    pub current_value: String,
}

/// Rows for keys whose value differs; a missing side shows as `-`.
pub fn diff_rows(old: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> Vec<DiffRow> {
    let mut keys: Vec<&String> = old.keys().chain(current.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter_map(|key| {
            let old_value = old.get(key).map_or("-", String::as_str);
            let current_value = current.get(key).map_or("-", String::as_str);
            (old_value != current_value).then(|| DiffRow {
                name: key.clone(),
                old_value: old_value.to_string(),
                current_value: current_value.to_string(),
            })
        })
        .collect()
}

pub fn render_diff_table(rows: Vec<DiffRow>) -> String {
    Table::new(rows).to_string()
}
