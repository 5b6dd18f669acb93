//! Last Will and Testament publication and discard.

use super::{must_subscribe, require, Scenario, ScenarioContext, ScenarioFn, CONNECT_BUDGET, DISCONNECT_LINGER};
use crate::client::{Delivery, BrokerClient};
use crate::error::{ConformanceError, Result};
use crate::raw::{self, RawConnection, RawPacket, ReadOutcome};
use crate::sync::{Expectation, QuietOutcome};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::debug;

const WILL_PAYLOAD: &[u8] = b"offline";
const WILL_QOS: u8 = 1;
const CONNACK_WAIT: Duration = Duration::from_secs(2);
const QUIET_WINDOW: Duration = Duration::from_secs(2);

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "will".to_string(),
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
            "will_abnormal",
            "will/status",
            "Will is published after the connection is reset",
            scenario_will_abnormal,
        ),
        make_scenario(
            "will_normal",
            "will/normal",
            "Will is discarded after a graceful DISCONNECT",
            scenario_will_normal,
        ),
        make_scenario(
            "will_disconnect_race",
            "will/race",
            "Will is discarded when DISCONNECT is followed by an immediate close",
            scenario_will_disconnect_race,
        ),
    ]
}

/// Subscribes an observer to the will topic; the expectation counts will
/// payloads only.
async fn observe_will(ctx: &ScenarioContext, will_topic: &str) -> Result<(BrokerClient, Expectation)> {
    let observer = ctx.connect("observer").await?;
    let expectation = Expectation::count(1);
    must_subscribe(
        &observer,
        will_topic,
        WILL_QOS,
        expectation
            .sink()
            .gate(|d: &Delivery| d.payload.as_ref() == WILL_PAYLOAD),
    )
    .await?;
    Ok((observer, expectation))
}

/// Raw CONNECT carrying a will, up to an accepted CONNACK.
async fn raw_session_with_will(ctx: &ScenarioContext, will_topic: &str) -> Result<RawConnection> {
    let started = Instant::now();
    let packet: RawPacket =
        raw::build_connect_with_will(&ctx.scope.client_id("raw"), will_topic, WILL_PAYLOAD)?;
    let mut conn = RawConnection::connect(&ctx.endpoint, CONNECT_BUDGET).await?;
    conn.send(&packet).await?;

    match conn.read_some(CONNACK_WAIT).await {
        ReadOutcome::Data(data) if raw::connack_accepted(&data) => {
            debug!(
                client_id = ?packet.client_id(),
                will_topic = ?packet.will_topic(),
                will_len = packet.will_payload().map_or(0, <[u8]>::len),
                flags = packet.flags(),
                "will registered"
            );
            Ok(conn)
        }
        ReadOutcome::Data(data) => Err(ConformanceError::setup(
            "raw connect with will",
            started,
            format!("CONNACK not accepted: {data:02x?}"),
        )),
        ReadOutcome::Closed => Err(ConformanceError::setup(
            "raw connect with will",
            started,
            "connection closed before CONNACK",
        )),
        ReadOutcome::Silent => Err(ConformanceError::timed_out("raw connect with will", CONNACK_WAIT)),
    }
}

fn quiet(outcome: QuietOutcome, will_topic: &str, trigger: &str) -> Result<()> {
    match outcome {
        QuietOutcome::Silent => Ok(()),
        QuietOutcome::Disturbed { observed } => Err(ConformanceError::Assertion(format!(
            "will on {will_topic} published {observed} time(s) after {trigger}"
        ))),
    }
}

fn scenario_will_abnormal(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let will_topic = ctx.scope.topic();
        let (observer, expectation) = observe_will(&ctx, &will_topic).await?;

        let conn = raw_session_with_will(&ctx, &will_topic).await?;
        conn.reset()?;

        let budget = Duration::from_secs(10);
        require(
            expectation.await_within(budget).await,
            1,
            &format!("will on {will_topic} after connection reset"),
            budget,
        )?;

        observer.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}

fn scenario_will_normal(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let will_topic = ctx.scope.topic();
        let (observer, expectation) = observe_will(&ctx, &will_topic).await?;

        let client = ctx
            .client("willer")
            .will(&will_topic, WILL_PAYLOAD, WILL_QOS)
            .connect(CONNECT_BUDGET)
            .await?;
        client.disconnect(DISCONNECT_LINGER).await;

        let outcome = quiet(
            expectation.expect_none_within(QUIET_WINDOW).await,
            &will_topic,
            "graceful DISCONNECT",
        );
        observer.disconnect(DISCONNECT_LINGER).await;
        outcome
    })
}

fn scenario_will_disconnect_race(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let will_topic = ctx.scope.topic();
        let (observer, expectation) = observe_will(&ctx, &will_topic).await?;

        let conn = raw_session_with_will(&ctx, &will_topic).await?;
        conn.write_then_close(&raw::build_disconnect()).await?;

        let outcome = quiet(
            expectation.expect_none_within(QUIET_WINDOW).await,
            &will_topic,
            "DISCONNECT followed by immediate close",
        );
        observer.disconnect(DISCONNECT_LINGER).await;
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::tests::local_context;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_will_is_published_with_acknowledgement() {
        assert_eq!(WILL_QOS, 1);
    }

    #[tokio::test]
    async fn test_disconnect_race_sends_disconnect_then_eof() {
        let (ctx, listener) = local_context("will/race").await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut connect = [0u8; 512];
            let n = socket.read(&mut connect).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            let mut rest = Vec::new();
            socket.read_to_end(&mut rest).await.unwrap();
            (connect[..n].to_vec(), rest)
        });

        let conn = raw_session_with_will(&ctx, "will/race/t").await.unwrap();
        conn.write_then_close(&raw::build_disconnect()).await.unwrap();

        let (connect, rest) = server.await.unwrap();
        assert_eq!(connect[0], raw::CONNECT);
        assert!(connect.ends_with(WILL_PAYLOAD));
        assert_eq!(rest, vec![0xE0, 0x00]);
    }

    #[tokio::test]
    async fn test_refused_will_session_is_a_setup_error() {
        let (ctx, listener) = local_context("will/status").await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
        });

        let err = raw_session_with_will(&ctx, "will/status/t").await.unwrap_err();
        assert!(err.to_string().contains("CONNACK not accepted"), "{err}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_before_connack_is_a_setup_error() {
        let (ctx, listener) = local_context("will/status").await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            socket.read(&mut buf).await.unwrap();
        });

        let err = raw_session_with_will(&ctx, "will/status/t").await.unwrap_err();
        assert!(err.to_string().contains("closed before CONNACK"), "{err}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_broker_times_out_the_will_session() {
        let (ctx, listener) = local_context("will/status").await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(socket);
        });

        let err = raw_session_with_will(&ctx, "will/status/t").await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        server.abort();
    }
}
