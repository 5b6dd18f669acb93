//! Shared subscriptions (`$share/<group>/<filter>`).

use super::{must_publish, must_subscribe, require, Scenario, ScenarioContext, ScenarioFn, DISCONNECT_LINGER};
use crate::client::Delivery;
use crate::config::OptIn;
use crate::error::Result;
use crate::sync::Expectation;
use crate::verify;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(1);

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "shared".to_string(),
        description: description.to_string(),
        namespace,
        coverage: super::Coverage::AllEndpoints,
        gate: None,
        budget: None,
        cleanup: None,
        runner,
    }
}

pub fn get_scenarios() -> Vec<Scenario> {
    vec![
        make_scenario(
            "shared_basic",
            "cp7/test/shared",
            "Share group delivers each message to exactly one member",
            scenario_shared_basic,
        ),
        make_scenario(
            "shared_distribution",
            "cp7/test/sharedstress",
            "Share group spreads a burst across every member without loss",
            scenario_shared_distribution,
        )
        .tcp_only()
        .gated(OptIn::Stress),
    ]
}

/// Two members of one share group, `published` QoS 1 messages; returns the
/// per-member delivery counts after the settle window.
async fn fan_out(ctx: &ScenarioContext, published: u64, budget: Duration) -> Result<Vec<u64>> {
    let topic = ctx.scope.topic();
    let filter = ctx.scope.share_filter("grp", &topic);

    let aggregate = Expectation::count(published);
    let mut members = Vec::new();
    let mut counters = Vec::new();
    for role in ["member1", "member2"] {
        let client = ctx.connect(role).await?;
        let counter = Expectation::count(published);
        let (total, own) = (aggregate.sink(), counter.sink());
        must_subscribe(&client, &filter, 1, move |_: &Delivery| {
            own.hit();
            total.hit();
        })
        .await?;
        members.push(client);
        counters.push(counter);
    }

    let publisher = ctx.connect("sharepub").await?;
    for i in 0..published {
        must_publish(&publisher, &topic, 1, false, format!("msg {i}")).await?;
    }

    require(
        aggregate.await_within(budget).await,
        published,
        &format!("{published} messages across the share group"),
        budget,
    )?;
    tokio::time::sleep(SETTLE).await;

    publisher.disconnect(DISCONNECT_LINGER).await;
    for member in members {
        member.disconnect(DISCONNECT_LINGER).await;
    }
    Ok(counters.iter().map(Expectation::observed).collect())
}

fn scenario_shared_basic(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let per_member = fan_out(&ctx, 4, Duration::from_secs(5)).await?;
        verify::shared_fanout(&per_member, 4, false)
    })
}

fn scenario_shared_distribution(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let per_member = fan_out(&ctx, 50, Duration::from_secs(20)).await?;
        tracing::info!(?per_member, "share group distribution");
        verify::shared_fanout(&per_member, 50, true)
    })
}
