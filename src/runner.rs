use crate::cli::TransportFilter;
use crate::config::Settings;
use crate::endpoint::{BrokerEndpoint, TransportKind};
use crate::error::{swallow, ConformanceError};
use crate::scenarios::{get_scenario_registry, Coverage, Scenario, ScenarioContext, CLEANUP_BUDGET};
use crate::scope::ScenarioScope;
use colored::Colorize;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of one scenario on one endpoint.
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub id: String,
    pub section: String,
    pub transport: TransportKind,
    pub description: String,
    pub passed: bool,
    pub skipped: bool,
    pub diagnostic: Option<String>,
    pub duration: Duration,
}

/// A scenario bound to the endpoint it will run against.
pub struct PlannedRun<'a> {
    pub scenario: &'a Scenario,
    pub endpoint: Arc<BrokerEndpoint>,
    /// Set when the scenario is opt-in and not enabled.
    pub skip: Option<String>,
}

pub struct ScenarioRunner {
    settings: Arc<Settings>,
    endpoints: Vec<Arc<BrokerEndpoint>>,
}

impl ScenarioRunner {
    pub fn new(settings: Settings, endpoints: Vec<BrokerEndpoint>) -> Self {
        Self {
            settings: Arc::new(settings),
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn endpoints(&self) -> &[Arc<BrokerEndpoint>] {
        &self.endpoints
    }

    fn selected_endpoints(&self) -> Vec<Arc<BrokerEndpoint>> {
        self.endpoints
            .iter()
            .filter(|e| match self.settings.transport {
                Some(TransportFilter::Tcp) => e.transport == TransportKind::Tcp,
                Some(TransportFilter::Ws) => e.transport == TransportKind::WebSocket,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Scenarios x endpoints after filters; tcp-only scenarios are bound
    /// to the first TCP endpoint.
    pub fn plan<'a>(&self, registry: &'a [Scenario]) -> Vec<PlannedRun<'a>> {
        let endpoints = self.selected_endpoints();
        let first_tcp = endpoints.iter().find(|e| e.transport == TransportKind::Tcp);

        let mut plan = Vec::new();
        for scenario in registry {
            if let Some(ref section) = self.settings.section {
                if scenario.section != *section {
                    continue;
                }
            }
            if let Some(ref id) = self.settings.scenario {
                if scenario.id != *id {
                    continue;
                }
            }

            let skip = scenario
                .gate
                .filter(|gate| !self.settings.enabled(*gate))
                .map(|gate| format!("opt-in: set {}=1 to enable", gate.env_var()));

            let targets: Vec<Arc<BrokerEndpoint>> = match scenario.coverage {
                Coverage::AllEndpoints => endpoints.clone(),
                Coverage::TcpOnly => first_tcp.cloned().into_iter().collect(),
            };
            if targets.is_empty() {
                debug!(id = %scenario.id, "no matching endpoint, not scheduled");
            }
            for endpoint in targets {
                plan.push(PlannedRun {
                    scenario,
                    endpoint,
                    skip: skip.clone(),
                });
            }
        }
        plan
    }

    pub async fn run(&self) -> Vec<ScenarioOutcome> {
        let registry = get_scenario_registry();
        let plan = self.plan(&registry);

        if plan.is_empty() {
            println!("{}", "No scenarios match the specified filters.".bright_yellow());
            return Vec::new();
        }

        info!(scenarios = plan.len(), jobs = self.settings.jobs, "run started");
        println!(
            "Running {} scenarios ({} at a time)...\n",
            plan.len().to_string().bright_cyan(),
            self.settings.jobs.to_string().bright_cyan()
        );

        let pb = if self.settings.verbose {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(plan.len() as u64);
            if let Ok(style) =
                ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} scenarios")
            {
                pb.set_style(style.progress_chars("=> "));
            }
            pb
        };

        let outcomes: Vec<ScenarioOutcome> = futures::stream::iter(plan)
            .map(|run| {
                let pb = pb.clone();
                async move {
                    let outcome = self.execute(run).await;
                    pb.inc(1);
                    outcome
                }
            })
            .buffered(self.settings.jobs)
            .collect()
            .await;
        pb.finish_and_clear();

        if self.settings.verbose {
            print_outcomes_grouped(&outcomes);
        }
        outcomes
    }

    async fn execute(&self, run: PlannedRun<'_>) -> ScenarioOutcome {
        let scenario = run.scenario;
        let mut outcome = ScenarioOutcome {
            id: scenario.id.clone(),
            section: scenario.section.clone(),
            transport: run.endpoint.transport,
            description: scenario.description.clone(),
            passed: false,
            skipped: false,
            diagnostic: None,
            duration: Duration::ZERO,
        };

        if let Some(reason) = run.skip {
            debug!(id = %scenario.id, %reason, "skipped");
            outcome.skipped = true;
            outcome.diagnostic = Some(reason);
            return outcome;
        }

        let ctx = ScenarioContext {
            scope: ScenarioScope::new(scenario.namespace, &run.endpoint.name),
            endpoint: Arc::clone(&run.endpoint),
            settings: Arc::clone(&self.settings),
        };
        let budget = scenario.budget.unwrap_or(self.settings.scenario_timeout);
        info!(id = %scenario.id, endpoint = %run.endpoint.name, scope = %ctx.scope.topic_prefix, "scenario started");

        let start = Instant::now();
        let cleanup_ctx = ctx.clone();
        // Spawned so a panicking scenario fails alone.
        let handle = tokio::spawn(tokio::time::timeout(budget, (scenario.runner)(ctx)));
        let result = handle.await;
        outcome.duration = start.elapsed();

        if let Some(cleanup) = scenario.cleanup {
            let cleaned = tokio::spawn(tokio::time::timeout(CLEANUP_BUDGET, cleanup(cleanup_ctx))).await;
            let cleaned = match cleaned {
                Ok(Ok(done)) => done,
                Ok(Err(_)) => Err(ConformanceError::Cleanup(format!("exceeded {CLEANUP_BUDGET:?}"))),
                Err(e) => Err(ConformanceError::Cleanup(e.to_string())),
            };
            swallow(cleaned, &scenario.id);
        }

        match result {
            Ok(Ok(Ok(()))) => outcome.passed = true,
            Ok(Ok(Err(e))) => outcome.diagnostic = Some(e.to_string()),
            Ok(Err(_)) => outcome.diagnostic = Some(format!("scenario exceeded its {budget:?} budget")),
            Err(e) => outcome.diagnostic = Some(format!("scenario task failed: {e}")),
        }

        if outcome.passed {
            info!(id = %scenario.id, transport = %outcome.transport, duration = ?outcome.duration, "passed");
        } else {
            warn!(
                id = %scenario.id,
                transport = %outcome.transport,
                diagnostic = outcome.diagnostic.as_deref().unwrap_or_default(),
                "failed"
            );
        }
        outcome
    }
}

/// `[transport] id: deviation`
pub fn format_diagnostic(outcome: &ScenarioOutcome) -> String {
    format!(
        "[{}] {}: {}",
        outcome.transport,
        outcome.id,
        outcome.diagnostic.as_deref().unwrap_or("no diagnostic")
    )
}

fn print_outcomes_grouped(outcomes: &[ScenarioOutcome]) {
    let mut current_section = String::new();

    for outcome in outcomes {
        if outcome.section != current_section {
            current_section = outcome.section.clone();
            println!(
                "\n{} {}\n{}",
                "▶".bright_blue(),
                current_section.to_uppercase().bright_white().bold(),
                "─".repeat(50).dimmed()
            );
        }
        print_outcome(outcome);
    }
}

fn print_outcome(outcome: &ScenarioOutcome) {
    let (icon, status) = if outcome.passed {
        ("✓".bright_green(), "PASS".bright_green())
    } else if outcome.skipped {
        ("○".bright_yellow(), "SKIP".bright_yellow())
    } else {
        ("✗".bright_red(), "FAIL".bright_red())
    };

    println!(
        "  {} [{}] {} {} ({:.2?})",
        icon,
        status,
        format!("[{}]", outcome.transport).bright_cyan(),
        outcome.id.bright_white(),
        outcome.duration
    );
    println!("      {}", outcome.description.dimmed());

    if let Some(ref diagnostic) = outcome.diagnostic {
        if outcome.skipped {
            println!("      {}", diagnostic.dimmed());
        } else {
            println!("      {} {}", "Error:".bright_red(), diagnostic.dimmed());
        }
    }
}
