//! Malformed frames must make the broker drop the connection.

use super::{Scenario, ScenarioContext, ScenarioFn, CONNECT_BUDGET};
use crate::config::OptIn;
use crate::error::{ConformanceError, Result};
use crate::raw::{PacketKind, RawConnection, RawPacket, CONNACK};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Remaining length encoded in five bytes; the limit is four.
const OVERLONG_REMAINING_LENGTH: &[u8] = &[0x10, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
/// CONNECT whose one-byte body cannot hold a protocol name.
const TRUNCATED_CONNECT: &[u8] = &[0x10, 0x01, 0x00];

const CLOSE_WAIT: Duration = Duration::from_secs(2);

fn make_scenario(id: &str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "malformed".to_string(),
        description: description.to_string(),
        namespace: "cp7/test/malformed",
        coverage: super::Coverage::TcpOnly,
        gate: Some(OptIn::Malformed),
        budget: None,
        cleanup: None,
        runner,
    }
}

pub fn get_scenarios() -> Vec<Scenario> {
    vec![
        make_scenario(
            "malformed_remaining_length",
            "Five-byte remaining length closes the connection",
            scenario_malformed_remaining_length,
        ),
        make_scenario(
            "malformed_connect_body",
            "Truncated CONNECT body closes the connection",
            scenario_malformed_connect_body,
        ),
    ]
}

/// A refusing CONNACK counts as rejection too.
pub(crate) fn is_refusal(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == CONNACK && data[3] != 0x00
}

async fn expect_rejected(ctx: &ScenarioContext, packet: RawPacket) -> Result<()> {
    let mut conn = RawConnection::connect(&ctx.endpoint, CONNECT_BUDGET).await?;
    conn.send(&packet).await?;

    let wait = conn.await_close(CLOSE_WAIT).await;
    if !wait.received.is_empty() && !is_refusal(&wait.received) {
        return Err(ConformanceError::Assertion(format!(
            "broker answered malformed frame {:02x?} with {:02x?}",
            packet.bytes(),
            wait.received
        )));
    }
    if wait.closed || is_refusal(&wait.received) {
        return Ok(());
    }
    Err(ConformanceError::Assertion(format!(
        "connection still open {CLOSE_WAIT:?} after malformed frame {:02x?}",
        packet.bytes()
    )))
}

fn scenario_malformed_remaining_length(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        expect_rejected(&ctx, RawPacket::verbatim(PacketKind::Connect, OVERLONG_REMAINING_LENGTH)).await
    })
}

fn scenario_malformed_connect_body(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        expect_rejected(&ctx, RawPacket::verbatim(PacketKind::Connect, TRUNCATED_CONNECT)).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusing_connack_counts_as_rejection() {
        assert!(is_refusal(&[0x20, 0x02, 0x00, 0x02]));
        assert!(!is_refusal(&[0x20, 0x02, 0x00, 0x00]));
        assert!(!is_refusal(&[0x90, 0x03, 0x00, 0x01]));
    }

    #[tokio::test]
    async fn test_silent_peer_is_a_failure() {
        let (ctx, listener) = crate::scenarios::tests::local_context("cp7/test/malformed").await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(socket);
        });

        let err = expect_rejected(&ctx, RawPacket::verbatim(PacketKind::Connect, TRUNCATED_CONNECT))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("still open"), "{err}");
        server.abort();
    }
}
