//! Wildcard matching, overlapping subscriptions and filter validation.

use super::{
    delivery_budget, must_publish, must_subscribe, require, Scenario, ScenarioContext, ScenarioFn,
    CONNECT_BUDGET, DISCONNECT_LINGER,
};
use crate::client::Delivery;
use crate::error::{ConformanceError, Result};
use crate::raw::{self, RawConnection, ReadOutcome};
use crate::sync::{Expectation, Mailbox};
use crate::topic;
use crate::verify::{self, Findings};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Extra time after the expected deliveries to catch duplicates.
const SETTLE: Duration = Duration::from_millis(500);

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "wildcard".to_string(),
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
            "wildcard_plus",
            "cp7/test/wcplus",
            "Single-level wildcard matches exactly one level",
            scenario_wildcard_plus,
        ),
        make_scenario(
            "wildcard_hash",
            "cp7/test/wchash",
            "Multi-level wildcard yields exactly the published topics below it",
            scenario_wildcard_hash,
        ),
        make_scenario(
            "wildcard_mix_exact",
            "mix",
            "Exact and wildcard filter on the same topic deliver one message",
            scenario_wildcard_mix_exact,
        ),
        make_scenario(
            "overlapping_qos",
            "overlap",
            "Overlapping subscriptions deliver one message at the maximum QoS",
            scenario_overlapping_qos,
        ),
        make_scenario(
            "invalid_filters",
            "cp7/test/invalid",
            "Malformed wildcard filters are rejected with SUBACK 0x80",
            scenario_invalid_filters,
        ),
    ]
}

fn scenario_wildcard_plus(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let client = ctx.connect("wcplus").await?;
        let filter = ctx.scope.filter_at("a/+/c");
        let target = ctx.scope.topic_at("a/b/c");

        let expectation = Expectation::count(1);
        let wanted = target.clone();
        must_subscribe(
            &client,
            &filter,
            0,
            expectation.sink().gate(move |d: &Delivery| d.topic == wanted),
        )
        .await?;

        must_publish(&client, &target, 0, false, "match").await?;

        let budget = delivery_budget(0);
        require(
            expectation.await_within(budget).await,
            1,
            &format!("{target} via {filter}"),
            budget,
        )?;

        client.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}

fn scenario_wildcard_hash(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let client = ctx.connect("wchash").await?;
        let filter = ctx.scope.filter_at("a/#");
        let deep = ctx.scope.topic_at("a/b/c");
        let shallow = ctx.scope.topic_at("a/d");

        let total = Expectation::count(2);
        let got_deep = Expectation::count(1);
        let got_shallow = Expectation::count(1);
        let (total_sink, deep_sink, shallow_sink) = (total.sink(), got_deep.sink(), got_shallow.sink());
        let (deep_topic, shallow_topic) = (deep.clone(), shallow.clone());
        must_subscribe(&client, &filter, 0, move |d: &Delivery| {
            total_sink.hit();
            if d.topic == deep_topic {
                deep_sink.hit();
            } else if d.topic == shallow_topic {
                shallow_sink.hit();
            }
        })
        .await?;

        must_publish(&client, &deep, 0, false, "match1").await?;
        must_publish(&client, &shallow, 0, false, "match2").await?;

        let budget = delivery_budget(0);
        let mut findings = Findings::new();
        for (topic, expectation) in [(&deep, &got_deep), (&shallow, &got_shallow)] {
            findings.check(
                topic,
                require(expectation.await_within(budget).await, 1, "delivery", budget).map(drop),
            );
        }
        tokio::time::sleep(SETTLE).await;
        findings.check(
            &filter,
            verify::exact_count("deliveries", 2, total.observed()),
        );

        client.disconnect(DISCONNECT_LINGER).await;
        findings.finish()
    })
}

fn scenario_wildcard_mix_exact(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let exact = ctx.scope.topic_at("a/b");
        let wildcard = ctx.scope.filter_at("+/b");

        let sub = ctx.connect("mixsub").await?;
        let received = Expectation::count(1);
        let sink = received.sink();
        must_subscribe(&sub, &exact, 0, {
            let sink = sink.clone();
            move |_: &Delivery| {
                sink.hit();
            }
        })
        .await?;
        must_subscribe(&sub, &wildcard, 0, move |_: &Delivery| {
            sink.hit();
        })
        .await?;

        let publisher = ctx.connect("mixpub").await?;
        must_publish(&publisher, &exact, 0, false, "hi").await?;

        let budget = delivery_budget(0);
        require(received.await_within(budget).await, 1, "message on overlapping filters", budget)?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        verify::exact_count(
            "deliveries for exact and wildcard filter on one topic",
            1,
            received.observed(),
        )?;

        publisher.disconnect(DISCONNECT_LINGER).await;
        sub.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}

fn scenario_overlapping_qos(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let topic = ctx.scope.topic_at("leaf");
        let wildcard = ctx.scope.filter_at("#");

        let sub = ctx.connect("ovsub").await?;
        let mut mailbox = Mailbox::new();
        let tx = mailbox.sender();
        must_subscribe(&sub, &topic, 0, {
            let tx = tx.clone();
            move |d: &Delivery| {
                let _ = tx.send(d.clone());
            }
        })
        .await?;
        must_subscribe(&sub, &wildcard, 2, move |d: &Delivery| {
            let _ = tx.send(d.clone());
        })
        .await?;

        let publisher = ctx.connect("ovpub").await?;
        must_publish(&publisher, &topic, 2, false, "hi").await?;

        let first = mailbox
            .recv_within(Duration::from_secs(5))
            .await
            .ok_or_else(|| ConformanceError::Assertion(format!("no delivery on {topic} within 5s")))?;
        let extra = mailbox.drain_within(Duration::from_secs(1)).await;
        verify::deduplicated(1 + extra.len() as u64, first.qos, &[0, 2])?;

        publisher.disconnect(DISCONNECT_LINGER).await;
        sub.disconnect(DISCONNECT_LINGER).await;
        Ok(())
    })
}

const INVALID_PATTERNS: [&str; 3] = ["a/#/c", "a/b#", "a/b+"];
const RAW_READ_DEADLINE: Duration = Duration::from_secs(2);

fn scenario_invalid_filters(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let mut findings = Findings::new();
        for (i, pattern) in INVALID_PATTERNS.into_iter().enumerate() {
            let filter = ctx.scope.filter_at(pattern);
            debug_assert!(topic::validate_filter(&filter).is_err());
            let client_id = ctx.scope.client_id(&format!("inv{i}"));
            findings.check(pattern, subscribe_invalid(&ctx, &client_id, &filter).await?);
        }
        findings.finish()
    })
}

/// Fresh raw session per filter: a broker may drop the connection instead of
/// answering 0x80. The outer error is a setup failure, the inner one a finding.
async fn subscribe_invalid(ctx: &ScenarioContext, client_id: &str, filter: &str) -> Result<Result<()>> {
    let mut conn = RawConnection::connect(&ctx.endpoint, CONNECT_BUDGET).await?;
    conn.send(&raw::build_connect(client_id, true)?).await?;
    match conn.read_some(RAW_READ_DEADLINE).await {
        ReadOutcome::Data(data) if raw::connack_accepted(&data) => {}
        other => {
            return Err(ConformanceError::Setup {
                operation: "raw connect".to_string(),
                elapsed: RAW_READ_DEADLINE,
                reason: format!("no accepting CONNACK: {other:?}"),
            })
        }
    }

    conn.send(&raw::build_subscribe(1, filter, 0)?).await?;
    let finding = match conn.read_some(RAW_READ_DEADLINE).await {
        ReadOutcome::Data(data) => match raw::parse_suback(&data) {
            Some(suback) => verify::filter_rejected(filter, suback.return_codes.first().copied()),
            None => Err(ConformanceError::Assertion(format!("expected SUBACK, got {data:02x?}"))),
        },
        ReadOutcome::Closed => {
            return Ok(Err(ConformanceError::Assertion(
                "broker closed the connection instead of answering 0x80".to_string(),
            )))
        }
        ReadOutcome::Silent => Err(ConformanceError::Assertion(format!(
            "no SUBACK within {RAW_READ_DEADLINE:?}"
        ))),
    };

    crate::error::swallow(
        conn.write_then_close(&raw::build_disconnect()).await,
        "raw disconnect",
    );
    Ok(finding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenarios::tests::local_context;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Clone, Copy)]
    enum Reply {
        Suback(u8),
        Close,
        Silence,
    }

    /// Accepts one connection per reply: CONNACK, then the scripted answer
    /// to SUBSCRIBE.
    fn serve(listener: TcpListener, replies: Vec<Reply>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 512];
                socket.read(&mut buf).await.unwrap();
                socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                socket.read(&mut buf).await.unwrap();
                match reply {
                    Reply::Suback(code) => {
                        socket.write_all(&[0x90, 0x03, 0x00, 0x01, code]).await.unwrap();
                        let _ = socket.read(&mut buf).await;
                    }
                    Reply::Close => drop(socket),
                    Reply::Silence => {
                        let _ = socket.read(&mut buf).await;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_rejected_filters_pass() {
        let (ctx, listener) = local_context("cp7/test/invalid").await;
        let server = serve(listener, vec![Reply::Suback(0x80); 3]);

        assert!(scenario_invalid_filters(ctx).await.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_every_failing_filter_is_reported() {
        let (ctx, listener) = local_context("cp7/test/invalid").await;
        let server = serve(listener, vec![Reply::Close, Reply::Suback(0x00), Reply::Silence]);

        let err = scenario_invalid_filters(ctx).await.unwrap_err().to_string();
        assert!(err.contains("a/#/c: broker closed the connection"), "{err}");
        assert!(err.contains("a/b#: invalid filter"), "{err}");
        assert!(err.contains("granted QoS 0"), "{err}");
        assert!(err.contains("a/b+: no SUBACK within 2s"), "{err}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connack_is_a_setup_error() {
        let (ctx, listener) = local_context("cp7/test/invalid").await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x05]).await.unwrap();
        });

        let err = subscribe_invalid(&ctx, "inv0", "a/b#").await.unwrap_err();
        assert!(matches!(err, ConformanceError::Setup { .. }), "{err}");
        server.await.unwrap();
    }
}
