mod limits;
mod malformed;
mod pubsub;
mod retain;
mod session;
mod shared;
mod system;
mod wildcard;
mod will;

use crate::client::{Delivery, BrokerClient, BrokerClientBuilder};
use crate::config::{OptIn, Settings};
use crate::endpoint::BrokerEndpoint;
use crate::error::{ConformanceError, Result};
use crate::scope::ScenarioScope;
use crate::sync::WaitOutcome;
use crate::verify;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub type ScenarioFn = fn(ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub const CONNECT_BUDGET: Duration = Duration::from_secs(5);
pub const SUBSCRIBE_BUDGET: Duration = Duration::from_secs(5);
pub const DISCONNECT_LINGER: Duration = Duration::from_millis(250);
pub const CLEANUP_BUDGET: Duration = Duration::from_secs(15);

/// How long a delivery at `qos` may take; grows with the handshake length.
pub fn delivery_budget(qos: u8) -> Duration {
    match qos {
        0 => Duration::from_secs(3),
        1 => Duration::from_secs(10),
        _ => Duration::from_secs(20),
    }
}

pub fn ack_budget(qos: u8) -> Duration {
    match qos {
        0 => Duration::from_secs(5),
        1 => Duration::from_secs(10),
        _ => Duration::from_secs(20),
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Coverage {
    /// Once per configured endpoint.
    AllEndpoints,
    /// Once, against the first TCP endpoint.
    TcpOnly,
}

pub struct Scenario {
    pub id: String,
    pub section: String,
    pub description: String,
    /// Topic namespace the scope is carved from.
    pub namespace: &'static str,
    pub coverage: Coverage,
    pub gate: Option<OptIn>,
    pub budget: Option<Duration>,
    pub runner: ScenarioFn,
    /// Runs after `runner` on every exit path, including an exceeded budget.
    pub cleanup: Option<ScenarioFn>,
}

impl Scenario {
    pub fn gated(mut self, gate: OptIn) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn tcp_only(mut self) -> Self {
        self.coverage = Coverage::TcpOnly;
        self
    }

    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn cleanup(mut self, cleanup: ScenarioFn) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

#[derive(Clone)]
pub struct ScenarioContext {
    pub endpoint: Arc<BrokerEndpoint>,
    pub settings: Arc<Settings>,
    pub scope: ScenarioScope,
}

impl ScenarioContext {
    /// Builder for a client whose id is scoped by `role`.
    pub fn client(&self, role: &str) -> BrokerClientBuilder {
        self.client_with_id(self.scope.client_id(role))
    }

    pub fn client_with_id(&self, client_id: String) -> BrokerClientBuilder {
        BrokerClient::builder(&self.endpoint, client_id)
            .credentials(self.settings.username.as_deref(), self.settings.password.as_deref())
    }

    /// Clean-session client, connected.
    pub async fn connect(&self, role: &str) -> Result<BrokerClient> {
        self.client(role).connect(CONNECT_BUDGET).await
    }
}

pub async fn must_subscribe(
    client: &BrokerClient,
    filter: &str,
    qos: u8,
    handler: impl Fn(&Delivery) + Send + Sync + 'static,
) -> Result<u8> {
    let grants = client
        .subscribe(filter, qos, handler)
        .await?
        .wait(SUBSCRIBE_BUDGET)
        .await?;
    verify::granted(filter, &grants)
}

pub async fn must_publish(
    client: &BrokerClient,
    topic: &str,
    qos: u8,
    retain: bool,
    payload: impl Into<Vec<u8>>,
) -> Result<()> {
    client
        .publish(topic, qos, retain, payload)
        .await?
        .wait(ack_budget(qos))
        .await
}

/// Turns a timed-out wait into an assertion failure naming what was missing.
pub fn require(outcome: WaitOutcome, target: u64, what: &str, budget: Duration) -> Result<u64> {
    let observed = outcome.observed();
    if outcome.completed() {
        return Ok(observed);
    }
    Err(ConformanceError::Assertion(format!(
        "timed out after {budget:?} waiting for {what} ({observed}/{target} observed)"
    )))
}

/// Best-effort removal of retained messages.
pub async fn clear_retained(ctx: &ScenarioContext, topics: &[String]) -> Result<()> {
    let cleaner = ctx
        .connect("clr")
        .await
        .map_err(|e| ConformanceError::Cleanup(e.to_string()))?;
    for topic in topics {
        must_publish(&cleaner, topic, 1, true, Vec::<u8>::new())
            .await
            .map_err(|e| ConformanceError::Cleanup(format!("{topic}: {e}")))?;
    }
    cleaner.disconnect(DISCONNECT_LINGER).await;
    Ok(())
}

pub fn get_scenario_registry() -> Vec<Scenario> {
    let mut scenarios = Vec::new();
    scenarios.extend(pubsub::get_scenarios());
    scenarios.extend(wildcard::get_scenarios());
    scenarios.extend(retain::get_scenarios());
    scenarios.extend(shared::get_scenarios());
    scenarios.extend(system::get_scenarios());
    scenarios.extend(session::get_scenarios());
    scenarios.extend(will::get_scenarios());
    scenarios.extend(limits::get_scenarios());
    scenarios.extend(malformed::get_scenarios());
    scenarios
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Context whose TCP endpoint is a local listener driven by the test.
    pub(crate) async fn local_context(namespace: &str) -> (ScenarioContext, tokio::net::TcpListener) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = BrokerEndpoint::parse("tcp", &format!("tcp://127.0.0.1:{port}")).unwrap();
        let ctx = ScenarioContext {
            scope: ScenarioScope::new(namespace, &endpoint.name),
            endpoint: Arc::new(endpoint),
            settings: Arc::new(Settings::from_args(crate::config::tests::run_args()).unwrap()),
        };
        (ctx, listener)
    }

    #[test]
    fn test_registry_ids_are_unique() {
        let registry = get_scenario_registry();
        let ids: HashSet<_> = registry.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids.len(), registry.len());
    }

    #[test]
    fn test_raw_socket_scenarios_are_tcp_only() {
        let registry = get_scenario_registry();
        for id in ["will_abnormal", "will_disconnect_race", "client_id_takeover"] {
            let scenario = registry.iter().find(|s| s.id == id).unwrap();
            assert_eq!(scenario.coverage, Coverage::TcpOnly, "{id}");
        }
    }

    #[test]
    fn test_destructive_scenarios_are_gated() {
        let registry = get_scenario_registry();
        let gated: Vec<_> = registry
            .iter()
            .filter(|s| s.gate.is_some())
            .map(|s| s.id.as_str())
            .collect();
        for id in [
            "shared_distribution",
            "payload_delivery_min",
            "max_packet_accept",
            "max_packet_overlimit",
            "malformed_remaining_length",
            "malformed_connect_body",
        ] {
            assert!(gated.contains(&id), "{id} should be opt-in");
        }
    }

    #[test]
    fn test_qos_budgets_grow() {
        assert!(delivery_budget(0) < delivery_budget(1));
        assert!(delivery_budget(1) < delivery_budget(2));
    }

    #[test]
    fn test_require_reports_counts() {
        let err = require(
            WaitOutcome::TimedOut { observed: 1 },
            2,
            "retained messages",
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "timed out after 5s waiting for retained messages (1/2 observed)"
        );
    }
}
