//! Connection lifecycle, QoS round trips and unsubscribe.

use super::{
    delivery_budget, must_publish, must_subscribe, Scenario, ScenarioContext, ScenarioFn, CONNECT_BUDGET,
    DISCONNECT_LINGER,
};
use crate::client::Delivery;
use crate::error::{ConformanceError, Result};
use crate::sync::{Expectation, Mailbox, QuietOutcome};
use crate::verify;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "pubsub".to_string(),
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
            "connect_disconnect",
            "cp7/test/basic",
            "Client connects within 5s and disconnects cleanly",
            scenario_connect_disconnect,
        ),
        make_scenario(
            "pubsub_qos0",
            "cp7/test/qos0",
            "QoS 0 message is delivered with identical payload",
            scenario_pubsub_qos0,
        ),
        make_scenario(
            "pubsub_qos1",
            "cp7/test/qos1",
            "QoS 1 message is acknowledged and delivered with identical payload",
            scenario_pubsub_qos1,
        ),
        make_scenario(
            "pubsub_qos2",
            "cp7/test/qos2",
            "QoS 2 message completes its handshake and is delivered with identical payload",
            scenario_pubsub_qos2,
        ),
        make_scenario(
            "unsubscribe",
            "cp7/test/unsub",
            "No delivery after UNSUBSCRIBE is acknowledged",
            scenario_unsubscribe,
        ),
    ]
}

fn scenario_connect_disconnect(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let client = ctx.client("basic").connect(CONNECT_BUDGET).await?;
        if !client.is_connected() {
            return Err(ConformanceError::Assertion(
                "client reported disconnected right after CONNACK".to_string(),
            ));
        }
        client.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}

/// Subscribe and publish on the scope topic at `qos`, then check the first
/// delivery against what was sent.
async fn round_trip(ctx: &ScenarioContext, qos: u8) -> Result<()> {
    let client = ctx.connect(&format!("qos{qos}")).await?;
    let topic = ctx.scope.topic();
    let payload = format!("hello qos{qos}");

    let mut mailbox = Mailbox::new();
    let tx = mailbox.sender();
    must_subscribe(&client, &topic, qos, move |d: &Delivery| {
        let _ = tx.send(d.clone());
    })
    .await?;

    must_publish(&client, &topic, qos, false, payload.clone()).await?;

    let budget = delivery_budget(qos);
    let outcome = check_first_delivery(
        mailbox.recv_within(budget).await,
        payload.as_bytes(),
        qos,
        &topic,
        budget,
    );
    client.disconnect(DISCONNECT_LINGER).await;
    outcome
}

fn check_first_delivery(
    delivery: Option<Delivery>,
    payload: &[u8],
    qos: u8,
    topic: &str,
    budget: Duration,
) -> Result<()> {
    let delivery = delivery.ok_or_else(|| {
        ConformanceError::Assertion(format!("no QoS {qos} message on {topic} within {budget:?}"))
    })?;
    verify::payload_identical(payload, &delivery.payload)?;
    verify::qos_equals(qos, delivery.qos)
}

fn scenario_pubsub_qos0(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { round_trip(&ctx, 0).await })
}

fn scenario_pubsub_qos1(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { round_trip(&ctx, 1).await })
}

fn scenario_pubsub_qos2(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { round_trip(&ctx, 2).await })
}

fn scenario_unsubscribe(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let client = ctx.connect("unsub").await?;
        let topic = ctx.scope.topic();

        let tripwire = Expectation::none();
        let sink = tripwire.sink();
        must_subscribe(&client, &topic, 1, move |_: &Delivery| {
            sink.hit();
        })
        .await?;

        client.unsubscribe(&topic).await?.wait(Duration::from_secs(5)).await?;
        must_publish(&client, &topic, 1, false, "should_not_arrive").await?;

        match tripwire.expect_none_within(Duration::from_secs(1)).await {
            QuietOutcome::Silent => {}
            QuietOutcome::Disturbed { observed } => {
                return Err(ConformanceError::Assertion(format!(
                    "received {observed} message(s) on {topic} after unsubscribe"
                )));
            }
        }

        client.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}
