//! `$SYS` namespace checks. Nothing here publishes to `$` topics.

use super::{must_subscribe, Scenario, ScenarioContext, ScenarioFn, DISCONNECT_LINGER};
use crate::client::Delivery;
use crate::error::Result;
use crate::sync::Mailbox;
use crate::verify::{self, Findings};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const STATISTICS: [&str; 7] = [
    "$SYS/broker/version",
    "$SYS/broker/uptime",
    "$SYS/broker/clients/connected",
    "$SYS/broker/clients/total",
    "$SYS/broker/messages/received",
    "$SYS/broker/messages/sent",
    "$SYS/broker/subscriptions/count",
];

const STATISTIC_WAIT: Duration = Duration::from_secs(5);

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "sys".to_string(),
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
            "sys_no_cross_match",
            "sys",
            "Bare '#' subscription never receives $-prefixed topics",
            scenario_sys_no_cross_match,
        ),
        make_scenario(
            "sys_statistics",
            "sys",
            "Broker publishes non-empty $SYS statistics",
            scenario_sys_statistics,
        ),
    ]
}

fn scenario_sys_no_cross_match(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let mut leaked = Mailbox::new();
        let unmatched = leaked.sender();
        let client = ctx
            .client("sysx")
            .on_unmatched(move |d: &Delivery| {
                if d.topic.starts_with('$') {
                    let _ = unmatched.send(d.topic.clone());
                }
            })
            .connect(super::CONNECT_BUDGET)
            .await?;

        let routed = leaked.sender();
        must_subscribe(&client, "#", 0, move |d: &Delivery| {
            if d.topic.starts_with('$') {
                let _ = routed.send(d.topic.clone());
            }
        })
        .await?;

        let topics = leaked.drain_within(Duration::from_secs(2)).await;
        client.disconnect(DISCONNECT_LINGER).await;

        let mut findings = Findings::new();
        for topic in &topics {
            findings.check("#", verify::not_system_topic(topic));
        }
        findings.finish()
    })
}

fn scenario_sys_statistics(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let client = ctx.connect("sysstat").await?;

        let mut mailboxes = Vec::with_capacity(STATISTICS.len());
        for topic in STATISTICS {
            let mailbox = Mailbox::new();
            let tx = mailbox.sender();
            must_subscribe(&client, topic, 0, move |d: &Delivery| {
                let _ = tx.send(d.payload.clone());
            })
            .await?;
            mailboxes.push((topic, mailbox));
        }

        let mut findings = Findings::new();
        for (topic, mut mailbox) in mailboxes {
            match mailbox.recv_within(STATISTIC_WAIT).await {
                Some(payload) => findings.check(topic, verify::non_empty_statistic(topic, &payload)),
                None => findings.fail(topic, format!("no message within {STATISTIC_WAIT:?}")),
            }
        }

        client.disconnect(DISCONNECT_LINGER).await;
        findings.finish()
    })
}
