//! b9ctl - operator CLI for a running b9agent
//!
//! Talks to the agent's local control API: agent status and health, plus
//! inference lifecycle (start, stop, status, model pulls).

mod client;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client::ControlClient;
use colored::Colorize;
use serde_json::{json, Value};

/// Operator CLI for a running b9agent
#[derive(Parser)]
#[command(name = "b9ctl")]
#[command(author, version, about = "Control a running b9agent", long_about = None)]
struct Cli {
    /// Agent control API URL (can also be set via B9AGENT_CONTROL_URL)
    #[arg(long, env = "B9AGENT_CONTROL_URL", default_value = "http://localhost:9999")]
    agent_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show agent status
    Status,

    /// Check agent liveness
    Health,

    /// Inference subsystem commands
    #[command(subcommand)]
    Inference(InferenceCommands),
}

#[derive(Subcommand)]
enum InferenceCommands {
    /// Start the inference daemon
    Start,

    /// Stop the inference daemon
    Stop,

    /// Show inference status and loaded models
    Status,

    /// Pull a model onto the machine
    Pull {
        /// Model name (e.g. "llama3")
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = ControlClient::new(&cli.agent_url)?;

    match cli.command {
        Commands::Status => show_status(&client).await,
        Commands::Health => show_health(&client).await,
        Commands::Inference(cmd) => match cmd {
            InferenceCommands::Start => inference_start(&client).await,
            InferenceCommands::Stop => inference_stop(&client).await,
            InferenceCommands::Status => inference_status(&client).await,
            InferenceCommands::Pull { model } => inference_pull(&client, &model).await,
        },
    }
}

async fn show_status(client: &ControlClient) -> Result<()> {
    let status: Value = client.get("/status").await?;

    println!("Machine:   {}", status["machine_id"].as_str().unwrap_or("?"));
    println!("Pool:      {}", status["pool"].as_str().unwrap_or("?"));
    println!("Status:    {}", status["status"].as_str().unwrap_or("?"));
    println!("Uptime:    {}s", status["uptime_seconds"]);
    println!(
        "Jobs:      {} running / {} total",
        status["running_jobs"], status["total_jobs"]
    );
    println!(
        "Resources: cpu {:.1}% / mem {:.1}% / {} gpus",
        status["cpu_percent"].as_f64().unwrap_or(0.0),
        status["memory_percent"].as_f64().unwrap_or(0.0),
        status["gpu_count"]
    );
    println!(
        "Inference: {} (port {})",
        status["inference_status"].as_str().unwrap_or("?"),
        status["inference_port"]
    );

    Ok(())
}

async fn show_health(client: &ControlClient) -> Result<()> {
    let health: Value = client.get("/health").await?;

    if health["status"] == "ok" {
        print_success("Agent is healthy");
    } else {
        print_error(&format!("Unexpected health response: {health}"));
    }

    Ok(())
}

async fn inference_start(client: &ControlClient) -> Result<()> {
    let response: Value = client.post("/inference/start", &json!({})).await?;

    print_success(response["message"].as_str().unwrap_or("Inference started"));
    if let Some(endpoint) = response["endpoint"].as_str() {
        println!("Endpoint: {endpoint}");
    }

    Ok(())
}

async fn inference_stop(client: &ControlClient) -> Result<()> {
    let response: Value = client.post("/inference/stop", &json!({})).await?;
    print_success(response["message"].as_str().unwrap_or("Inference stopped"));
    Ok(())
}

async fn inference_status(client: &ControlClient) -> Result<()> {
    let status: Value = client.get("/inference/status").await?;

    let running = status["running"].as_bool().unwrap_or(false);
    if running {
        print_success(&format!(
            "Inference running at {}",
            status["endpoint"].as_str().unwrap_or("?")
        ));
    } else {
        println!("{} Inference stopped", "-".dimmed());
    }

    match status["models"].as_array() {
        Some(models) if !models.is_empty() => {
            println!("Models:");
            for model in models {
                println!("  {}", model.as_str().unwrap_or("?"));
            }
        }
        _ => println!("No models installed"),
    }

    Ok(())
}

async fn inference_pull(client: &ControlClient, model: &str) -> Result<()> {
    println!("Pulling {model}... (this can take a while)");

    let response: Value = client
        .post_slow("/inference/pull", &json!({"model": model}))
        .await?;

    print_success(response["message"].as_str().unwrap_or("Model pulled"));
    Ok(())
}

fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}
