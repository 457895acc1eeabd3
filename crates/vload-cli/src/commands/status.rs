//! Status command implementation.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Health response from the server.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    components: BTreeMap<String, ComponentStatus>,
}

/// Component status from the server.
#[derive(Debug, Deserialize)]
struct ComponentStatus {
    status: String,
    message: Option<String>,
}

/// Show status and health of a running service.
pub async fn run(url: &str, metrics_url: Option<&str>) -> Result<()> {
    println!("Checking health at {}...\n", url);

    let health_url = format!("{}/health", url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    match client.get(&health_url).send().await {
        Ok(response) => {
            let status_code = response.status();
            match response.json::<HealthResponse>().await {
                Ok(health) => print_health_status(&health, status_code.as_u16()),
                Err(e) => {
                    println!("Failed to parse health response: {}", e);
                    println!("HTTP Status: {}", status_code);
                }
            }
        }
        Err(e) => {
            println!("Failed to connect to health endpoint: {}", e);
            println!("\nIs the vload service running?");
            println!("Start it with: vload serve --config <path-to-config>");
            return Ok(());
        }
    }

    let metrics_url = match metrics_url {
        Some(u) => format!("{}/metrics", u.trim_end_matches('/')),
        None => default_metrics_url(url),
    };

    println!("\n--- Metrics ---");
    println!("Fetching from {}...\n", metrics_url);

    match client.get(&metrics_url).send().await {
        Ok(response) => {
            let text = response.text().await.context("Failed to read metrics")?;
            print_metrics(&text);
        }
        Err(e) => {
            println!("Failed to fetch metrics: {}", e);
        }
    }

    Ok(())
}

/// Metrics live on the same host, on the default metrics port.
fn default_metrics_url(url: &str) -> String {
    url.replace(":8080", ":9090").trim_end_matches('/').to_string() + "/metrics"
}

fn label(status: &str) -> &'static str {
    match status {
        "healthy" => "[OK]",
        "degraded" => "[WARN]",
        "unhealthy" => "[FAIL]",
        _ => "[?]",
    }
}

fn print_health_status(health: &HealthResponse, status_code: u16) {
    println!(
        "{} Overall Status: {} (HTTP {})",
        label(&health.status),
        health.status.to_uppercase(),
        status_code
    );
    println!();

    if !health.components.is_empty() {
        println!("Components:");
        for (name, status) in &health.components {
            let tag = label(&status.status);
            if let Some(msg) = &status.message {
                println!("  {} {}: {} ({})", tag, name, status.status, msg);
            } else {
                println!("  {} {}: {}", tag, name, status.status);
            }
        }
    }
}

/// Pick plain `name value` samples out of a Prometheus exposition.
fn parse_samples(metrics_text: &str) -> HashMap<&str, u64> {
    metrics_text
        .lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let value = parts.next()?.parse::<u64>().ok()?;
            Some((name, value))
        })
        .collect()
}

fn print_metrics(metrics_text: &str) {
    let values = parse_samples(metrics_text);

    let rows = [
        ("vload_events_total", "Events Received:   "),
        ("vload_files_admitted_total", "Files Admitted:    "),
        ("vload_files_duplicate_total", "Duplicates:        "),
        ("vload_rotations_total", "Batches Rotated:   "),
        ("vload_batches_complete_total", "Batches Complete:  "),
        ("vload_batches_failed_total", "Batches Failed:    "),
        ("vload_append_conflicts_total", "Append Conflicts:  "),
        ("vload_errors_total", "Errors:            "),
    ];
    for (name, caption) in rows {
        if let Some(v) = values.get(name) {
            println!("{}{}", caption, format_number(*v));
        }
    }

    if values.is_empty() {
        println!("No metrics available yet.");
    }
}

fn format_number(n: u64) -> String {
    if n >= 1_000_000_000 {
        format!("{:.2}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.2}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.2}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}
