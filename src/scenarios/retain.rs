use super::{
    clear_retained, must_publish, must_subscribe, require, Scenario, ScenarioContext, ScenarioFn,
    DISCONNECT_LINGER,
};
use crate::client::Delivery;
use crate::error::Result;
use crate::sync::Expectation;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const RETAIN_BUDGET: Duration = Duration::from_secs(5);

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "retain".to_string(),
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
            "retain",
            "cp7/test/retain",
            "Late subscriber receives the retained payload flagged as retained",
            scenario_retain,
        )
        .cleanup(clear_retain),
        make_scenario(
            "retain_wildcard",
            "cp7/test/retwc",
            "Multi-level wildcard subscriber receives every retained topic below it",
            scenario_retain_wildcard,
        )
        .cleanup(clear_retain_wildcard),
    ]
}

fn scenario_retain(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { retained_round_trip(&ctx, &ctx.scope.topic()).await })
}

fn clear_retain(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { clear_retained(&ctx, &[ctx.scope.topic()]).await })
}

async fn retained_round_trip(ctx: &ScenarioContext, topic: &str) -> Result<()> {
    let payload = "retained message";

    let publisher = ctx.connect("retpub").await?;
    must_publish(&publisher, topic, 1, true, payload).await?;
    publisher.disconnect(DISCONNECT_LINGER).await;

    let subscriber = ctx.connect("retsub").await?;
    let expectation = Expectation::count(1);
    must_subscribe(
        &subscriber,
        topic,
        1,
        expectation
            .sink()
            .gate(move |d: &Delivery| d.retain && d.payload.as_ref() == payload.as_bytes()),
    )
    .await?;

    require(
        expectation.await_within(RETAIN_BUDGET).await,
        1,
        &format!("retained payload on {topic}"),
        RETAIN_BUDGET,
    )?;

    subscriber.disconnect(DISCONNECT_LINGER).await;
    Ok(())
}

fn wildcard_topics(ctx: &ScenarioContext) -> Vec<String> {
    vec![ctx.scope.topic_at("1"), ctx.scope.topic_at("2")]
}

fn scenario_retain_wildcard(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { retained_below_wildcard(&ctx, &wildcard_topics(&ctx)).await })
}

fn clear_retain_wildcard(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { clear_retained(&ctx, &wildcard_topics(&ctx)).await })
}

async fn retained_below_wildcard(ctx: &ScenarioContext, topics: &[String]) -> Result<()> {
    let publisher = ctx.connect("retwcpub").await?;
    for (i, topic) in topics.iter().enumerate() {
        must_publish(&publisher, topic, 1, true, format!("retained {}", i + 1)).await?;
    }
    publisher.disconnect(DISCONNECT_LINGER).await;

    let subscriber = ctx.connect("retwcsub").await?;
    let expectation = Expectation::count(topics.len() as u64);
    let wanted = topics.to_vec();
    must_subscribe(
        &subscriber,
        &ctx.scope.filter_at("#"),
        1,
        expectation
            .sink()
            .gate(move |d: &Delivery| d.retain && wanted.contains(&d.topic)),
    )
    .await?;

    require(
        expectation.await_within(RETAIN_BUDGET).await,
        expectation.target(),
        "retained messages",
        RETAIN_BUDGET,
    )?;

    subscriber.disconnect(DISCONNECT_LINGER).await;
    Ok(())
}
