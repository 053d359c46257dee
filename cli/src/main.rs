use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use colored::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use common::Config;

#[derive(Parser)]
#[command(name = "finops")]
#[command(about = "Operator console for the finops enforcer", long_about = None)]
struct Cli {
    /// Enforcer socket (defaults to the path in the enforcer config)
    #[arg(short, long, global = true)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon status and the last tick
    Status,
    /// List recent violations
    Violations {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one violation with its policy
    Show { violation_id: String },
    /// Mark a pending violation as ignored
    Ignore { violation_id: String },
    /// Drop every compiled rule so the next tick recompiles from source
    ReloadRules,
    /// Show the activity log
    Activity {
        #[arg(short, long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Serialize)]
struct IpcRequest {
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    violation_id: Option<String>,
}

impl IpcRequest {
    fn new(method: &'static str) -> Self {
        Self { method, limit: None, violation_id: None }
    }
}

#[derive(Deserialize)]
struct IpcResponse {
    success: bool,
    data: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(default_socket);

    match cli.command {
        Commands::Status => print_status(send_request(&socket, IpcRequest::new("status")).await?),
        Commands::Violations { limit } => {
            let req = IpcRequest { limit: Some(limit), ..IpcRequest::new("violations") };
            print_violations(send_request(&socket, req).await?)
        }
        Commands::Show { violation_id } => {
            let req = IpcRequest { violation_id: Some(violation_id), ..IpcRequest::new("show") };
            print_show(send_request(&socket, req).await?)
        }
        Commands::Ignore { violation_id } => {
            let req = IpcRequest { violation_id: Some(violation_id.clone()), ..IpcRequest::new("ignore") };
            let response = send_request(&socket, req).await?;
            if response.success {
                println!("{} violation {} ignored", "✔".green().bold(), violation_id.bright_white());
            } else {
                print_error(&response);
            }
        }
        Commands::ReloadRules => {
            let response = send_request(&socket, IpcRequest::new("reload_rules")).await?;
            if response.success {
                let dropped = response.data["dropped"].as_u64().unwrap_or(0);
                println!("{} rule cache cleared ({} compiled rules dropped)", "✔".green().bold(), dropped);
            } else {
                print_error(&response);
            }
        }
        Commands::Activity { limit } => {
            let req = IpcRequest { limit: Some(limit), ..IpcRequest::new("activity") };
            print_activity(send_request(&socket, req).await?)
        }
    }
    Ok(())
}

fn default_socket() -> String {
    Config::load(&Config::default_path())
        .map(|c| c.ipc.socket_path)
        .unwrap_or_else(|_| Config::default().ipc.socket_path)
}

async fn send_request(socket_path: &str, request: IpcRequest) -> Result<IpcResponse> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("cannot reach enforcer at {} (is it running?)", socket_path))?;

    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;

    let mut buffer = Vec::new();
    stream.read_to_end(&mut buffer).await?;
    Ok(serde_json::from_slice(&buffer)?)
}

fn print_error(response: &IpcResponse) {
    let message = response.data["error"].as_str().unwrap_or("Unknown error");
    println!("{} {}", "✘ Error:".red().bold(), message);
}

fn print_status(response: IpcResponse) {
    if !response.success {
        return print_error(&response);
    }
    let data = &response.data;

    println!("\n{}", "Finops enforcer".bright_cyan().bold());
    println!("  {:18} {}", "Status:".dimmed(), data["status"].as_str().unwrap_or("?").green().bold());
    println!(
        "  {:18} {}",
        "Uptime:".dimmed(),
        format_uptime(data["uptime_seconds"].as_u64().unwrap_or(0))
    );
    println!("  {:18} {}", "Ticks:".dimmed(), data["ticks_completed"].as_u64().unwrap_or(0));
    println!("  {:18} {}", "Rules cached:".dimmed(), data["rules_cached"].as_u64().unwrap_or(0));

    let providers: Vec<&str> = data["providers"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    println!(
        "  {:18} {}",
        "Providers:".dimmed(),
        if providers.is_empty() { "none".to_string() } else { providers.join(", ") }
    );

    let v = &data["violations"];
    println!(
        "\n  {:18} {} pending, {} remediated, {} ignored",
        "Violations:".dimmed(),
        v["pending"].as_i64().unwrap_or(0).to_string().yellow().bold(),
        v["remediated"].as_i64().unwrap_or(0).to_string().green(),
        v["ignored"].as_i64().unwrap_or(0).to_string().dimmed()
    );

    let tick = &data["last_tick"];
    if tick.is_null() {
        println!("\n  {}\n", "No tick has completed yet.".dimmed());
        return;
    }
    println!("\n{}", "Last tick".bright_cyan().bold());
    println!("  {:18} {}", "Finished:".dimmed(), format_timestamp(tick["finished_at"].as_str()));
    for (label, key) in [
        ("Accounts:", "accounts_processed"),
        ("Skipped:", "accounts_skipped"),
        ("Evaluated:", "policies_evaluated"),
        ("Eval failures:", "evaluation_failures"),
        ("New violations:", "violations_created"),
        ("Remediated:", "remediations_succeeded"),
        ("Remediation fail:", "remediations_failed"),
        ("Webhooks sent:", "notifications_delivered"),
        ("Webhooks failed:", "notifications_failed"),
    ] {
        println!("  {:18} {}", label.dimmed(), tick[key].as_u64().unwrap_or(0));
    }
    println!();
}

fn status_colored(status: &str) -> ColoredString {
    match status {
        "pending" => status.yellow().bold(),
        "remediated" => status.green(),
        _ => status.dimmed(),
    }
}

fn print_violations(response: IpcResponse) {
    if !response.success {
        return print_error(&response);
    }
    let empty = vec![];
    let violations = response.data["violations"].as_array().unwrap_or(&empty);
    if violations.is_empty() {
        println!("\n{}\n", "No violations recorded.".dimmed());
        return;
    }

    println!(
        "\n{}",
        format!("{:36}  {:19}  {:8}  {:10}  {}", "ID", "Created", "Severity", "Status", "Message")
            .bright_cyan()
            .bold()
    );
    for v in violations {
        let severity = v["severity"].as_str().unwrap_or("?");
        let severity = match severity {
            "critical" | "high" => severity.red().bold(),
            "medium" => severity.yellow(),
            _ => severity.normal(),
        };
        println!(
            "{:36}  {:19}  {:8}  {:10}  {}",
            v["id"].as_str().unwrap_or("?").bright_white(),
            format_timestamp(v["created_at"].as_str()).dimmed(),
            severity,
            status_colored(v["status"].as_str().unwrap_or("?")),
            truncate(v["message"].as_str().unwrap_or(""), 60)
        );
    }
    println!();
}

fn print_show(response: IpcResponse) {
    if !response.success {
        return print_error(&response);
    }
    let v = &response.data["violation"];
    let p = &response.data["policy"];

    println!("\n{} {}", "Violation".bright_cyan().bold(), v["id"].as_str().unwrap_or("?").bright_white());
    println!("  {:14} {}", "Status:".dimmed(), status_colored(v["status"].as_str().unwrap_or("?")));
    println!("  {:14} {}", "Severity:".dimmed(), v["severity"].as_str().unwrap_or("?"));
    println!(
        "  {:14} {} ({})",
        "Resource:".dimmed(),
        v["resource_id"].as_str().unwrap_or("?"),
        v["provider"].as_str().unwrap_or("?")
    );
    println!("  {:14} {}", "Created:".dimmed(), format_timestamp(v["created_at"].as_str()));
    if let Some(at) = v["remediated_at"].as_str() {
        println!("  {:14} {}", "Remediated:".dimmed(), format_timestamp(Some(at)));
    }
    println!("  {:14} {}", "Message:".dimmed(), v["message"].as_str().unwrap_or(""));

    if !p.is_null() {
        println!("\n{} {}", "Policy".bright_cyan().bold(), p["name"].as_str().unwrap_or("?").bright_white());
        println!("  {:14} {}", "Id:".dimmed(), p["id"].as_str().unwrap_or("?"));
        println!("  {:14} {}", "Type:".dimmed(), p["type"].as_str().unwrap_or("?"));
        println!("  {:14} {}", "Config:".dimmed(), p["config"]);
    }
    println!();
}

fn print_activity(response: IpcResponse) {
    if !response.success {
        return print_error(&response);
    }
    let empty = vec![];
    let entries = response.data["activity"].as_array().unwrap_or(&empty);
    if entries.is_empty() {
        println!("\n{}\n", "No activity yet.".dimmed());
        return;
    }

    println!();
    for e in entries {
        let kind = e["type"].as_str().unwrap_or("?");
        let kind = match kind {
            "policy_violation" => kind.red(),
            "remediation" => kind.green(),
            _ => kind.normal(),
        };
        println!(
            "{}  {:18}  {}",
            format_timestamp(e["created_at"].as_str()).dimmed(),
            kind,
            e["message"].as_str().unwrap_or("")
        );
    }
    println!();
}

fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, seconds % 60)
    }
}

fn format_timestamp(ts: Option<&str>) -> String {
    ts.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_only_carry_what_the_method_needs() {
        let req = IpcRequest { violation_id: Some("v1".to_string()), ..IpcRequest::new("show") };
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"method":"show","violation_id":"v1"}"#);
        let req = IpcRequest::new("status");
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"method":"status"}"#);
    }

    #[test]
    fn uptime_and_truncation() {
        assert_eq!(format_uptime(59), "0m 59s");
        assert_eq!(format_uptime(3 * 3600 + 120), "3h 2m");
        assert_eq!(format_uptime(2 * 86400 + 3600), "2d 1h 0m");
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer message", 10), "a much ...");
        assert_eq!(format_timestamp(None), "-");
    }
}
