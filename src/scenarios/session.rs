use super::{
    must_publish, must_subscribe, Scenario, ScenarioContext, ScenarioFn, CONNECT_BUDGET,
    DISCONNECT_LINGER,
};
use crate::client::Delivery;
use crate::error::{ConformanceError, Result};
use crate::sync::Mailbox;
use crate::verify;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "session".to_string(),
        description: description.to_string(),
        namespace,
        coverage: super::Coverage::TcpOnly,
        gate: None,
        budget: None,
        cleanup: None,
        runner,
    }
}

pub fn get_scenarios() -> Vec<Scenario> {
    vec![
        make_scenario(
            "client_id_takeover",
            "cp7/test/takeover",
            "Second connection with the same client id disconnects the first",
            scenario_client_id_takeover,
        ),
        make_scenario(
            "persistent_session_qos1",
            "cp7/test/persist1",
            "QoS 1 message published while offline is delivered on reconnect",
            scenario_persistent_session_qos1,
        )
        .cleanup(discard_session),
        make_scenario(
            "persistent_session_qos2",
            "cp7/test/persist2",
            "QoS 2 message published while offline is delivered on reconnect",
            scenario_persistent_session_qos2,
        )
        .cleanup(discard_session),
    ]
}

fn scenario_client_id_takeover(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let client_id = ctx.scope.client_id("conflict");
        let first = ctx.client_with_id(client_id.clone()).connect(CONNECT_BUDGET).await?;
        let second = ctx.client_with_id(client_id).connect(CONNECT_BUDGET).await?;

        tokio::time::sleep(Duration::from_millis(500)).await;
        if first.is_connected() {
            return Err(ConformanceError::Assertion(format!(
                "first connection of {} still open 500ms after takeover",
                first.client_id()
            )));
        }

        second.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}

async fn offline_delivery(ctx: &ScenarioContext, qos: u8, budget: Duration) -> Result<()> {
    let client_id = ctx.scope.client_id("persist");
    let topic = ctx.scope.topic();
    let payload = format!("offline qos{qos}");

    let subscriber = ctx
        .client_with_id(client_id.clone())
        .clean_session(false)
        .connect(CONNECT_BUDGET)
        .await?;
    must_subscribe(&subscriber, &topic, qos, |_: &Delivery| {}).await?;
    subscriber.disconnect(DISCONNECT_LINGER).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let publisher = ctx.connect("persistpub").await?;
    must_publish(&publisher, &topic, qos, false, payload.clone()).await?;
    publisher.disconnect(DISCONNECT_LINGER).await;

    // Replayed messages arrive before any new SUBSCRIBE, so they land on the
    // unmatched handler.
    let mut mailbox = Mailbox::new();
    let tx = mailbox.sender();
    let resumed = ctx
        .client_with_id(client_id)
        .clean_session(false)
        .on_unmatched(move |d: &Delivery| {
            let _ = tx.send(d.clone());
        })
        .connect(CONNECT_BUDGET)
        .await?;

    let outcome = match mailbox.recv_within(budget).await {
        Some(delivery) => verify::payload_identical(payload.as_bytes(), &delivery.payload)
            .and_then(|()| verify::qos_equals(qos, delivery.qos)),
        None => Err(ConformanceError::Assertion(format!(
            "no offline QoS {qos} message on {topic} within {budget:?} of reconnect"
        ))),
    };
    resumed.disconnect(DISCONNECT_LINGER).await;
    outcome
}

/// Drops the persisted session by reconnecting with a clean session.
fn discard_session(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let client = ctx
            .client_with_id(ctx.scope.client_id("persist"))
            .connect(CONNECT_BUDGET)
            .await
            .map_err(|e| ConformanceError::Cleanup(e.to_string()))?;
        client.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}

fn scenario_persistent_session_qos1(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { offline_delivery(&ctx, 1, Duration::from_secs(10)).await })
}

fn scenario_persistent_session_qos2(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move { offline_delivery(&ctx, 2, Duration::from_secs(15)).await })
}
