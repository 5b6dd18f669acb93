mod cli;
mod client;
mod config;
mod endpoint;
mod error;
mod raw;
mod runner;
mod scenarios;
mod scope;
mod sync;
mod topic;
mod verify;

use clap::Parser;
use cli::{Cli, Commands};
use colored::Colorize;
use config::Settings;
use runner::{format_diagnostic, ScenarioRunner};
use tracing_subscriber::EnvFilter;

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_ids(true)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Run(args) => {
            // Configuration problems abort before any network I/O.
            let prepared = Settings::from_args(args)
                .and_then(|settings| endpoint::resolve(&settings).map(|endpoints| (settings, endpoints)));
            let (settings, endpoints) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    eprintln!("{} {}", "error:".bright_red().bold(), e);
                    std::process::exit(2);
                }
            };
            let runner = ScenarioRunner::new(settings, endpoints);

            println!();
            println!(
                "{}",
                "╔══════════════════════════════════════════════════════════════╗".bright_blue()
            );
            println!(
                "{}",
                "║           MQTT Broker Functional Conformance Suite           ║".bright_blue()
            );
            println!(
                "{}",
                "╚══════════════════════════════════════════════════════════════╝".bright_blue()
            );
            println!();
            for endpoint in runner.endpoints() {
                println!(
                    "Target: {} {}",
                    format!("[{}]", endpoint.transport).bright_yellow(),
                    endpoint.url.bright_cyan()
                );
            }
            println!();

            let outcomes = runner.run().await;

            let passed = outcomes.iter().filter(|o| o.passed).count();
            let failed: Vec<_> = outcomes.iter().filter(|o| !o.passed && !o.skipped).collect();
            let skipped = outcomes.iter().filter(|o| o.skipped).count();
            let total = outcomes.len();

            if !failed.is_empty() {
                println!("\n{}", "═".repeat(66).bright_red());
                println!("{}", "                        FAILURES".bright_red().bold());
                println!("{}\n", "═".repeat(66).bright_red());

                for outcome in &failed {
                    println!("  {} {}", "✗".bright_red(), format_diagnostic(outcome).bright_white());
                    println!("    {}", outcome.description.dimmed());
                    println!();
                }
            }

            println!("{}", "═".repeat(66).bright_blue());
            println!("{}", "                        SUMMARY".bright_white().bold());
            println!("{}\n", "═".repeat(66).bright_blue());

            println!("  {} {} passed", "✓".bright_green(), passed.to_string().bright_green());
            println!("  {} {} failed", "✗".bright_red(), failed.len().to_string().bright_red());
            println!(
                "  {} {} skipped",
                "○".bright_yellow(),
                skipped.to_string().bright_yellow()
            );
            println!("  {} {} total\n", "•".bright_white(), total.to_string().bright_white());

            if !failed.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::List { section } => {
            let registry = scenarios::get_scenario_registry();

            println!("\n{} functional scenarios:\n", "Available".bright_cyan());

            let mut current_section = String::new();
            for scenario in registry.iter() {
                if let Some(ref filter) = section {
                    if scenario.section != *filter {
                        continue;
                    }
                }

                if scenario.section != current_section {
                    current_section = scenario.section.clone();
                    println!("  {} {}:", "Section:".bright_blue(), current_section.bright_white());
                }

                let mut notes = Vec::new();
                if scenario.coverage == scenarios::Coverage::TcpOnly {
                    notes.push("tcp only".to_string());
                }
                if let Some(gate) = scenario.gate {
                    notes.push(format!("opt-in {}", gate.env_var()));
                }
                let notes = if notes.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", notes.join(", "))
                };

                println!(
                    "    {} - {}{}",
                    scenario.id.bright_green(),
                    scenario.description.dimmed(),
                    notes.bright_yellow()
                );
            }
            println!();
        }
    }
}
