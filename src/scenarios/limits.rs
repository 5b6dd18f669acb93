//! Payload and packet size limits.

use super::{Scenario, ScenarioContext, ScenarioFn, CONNECT_BUDGET, DISCONNECT_LINGER, SUBSCRIBE_BUDGET};
use crate::client::Delivery;
use crate::config::OptIn;
use crate::error::{ConformanceError, Result};
use crate::sync::Mailbox;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

const DELIVERY_WAIT: Duration = Duration::from_secs(10);
const PUBACK_WAIT: Duration = Duration::from_secs(5);
/// Binary search stops once the bracket is this narrow.
const SEARCH_RESOLUTION: usize = 1024;
/// Headroom above the payload for the fixed header, topic and packet id.
const FRAME_OVERHEAD: usize = 4096;

fn make_scenario(id: &str, namespace: &'static str, description: &str, runner: ScenarioFn) -> Scenario {
    Scenario {
        id: id.to_string(),
        section: "limits".to_string(),
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
            "payload_delivery_min",
            "cp7/test/payload",
            "Payload of the configured minimum size is delivered intact",
            scenario_payload_delivery_min,
        )
        .gated(OptIn::Limits)
        .budget(Duration::from_secs(180)),
        make_scenario(
            "max_packet_accept",
            "cp7/test/maxpkt",
            "Broker acknowledges QoS 1 publishes up to its packet limit",
            scenario_max_packet_accept,
        )
        .tcp_only()
        .gated(OptIn::Limits)
        .budget(Duration::from_secs(180)),
        make_scenario(
            "max_packet_overlimit",
            "cp7/test/overlimit",
            "Broker refuses a publish larger than its packet limit",
            scenario_max_packet_overlimit,
        )
        .tcp_only()
        .gated(OptIn::Overlimit),
    ]
}

/// Sizes tried after the configured minimum fails, largest first.
pub(crate) fn fallback_sizes(min: usize) -> Vec<usize> {
    let mut sizes: Vec<usize> = [min / 2, min / 4, min / 8, 65536, 32768, 16384, 8192]
        .into_iter()
        .filter(|size| *size > 0 && *size < min)
        .collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    sizes.dedup();
    sizes
}

/// One publish/subscribe round trip of `size` bytes on a fresh connection.
async fn deliver_once(ctx: &ScenarioContext, size: usize) -> Result<bool> {
    let topic = ctx.scope.topic_at(&format!("size{size}"));
    let client = ctx
        .client(&format!("deliver{size}"))
        .max_packet_size(size + FRAME_OVERHEAD)
        .connect(CONNECT_BUDGET)
        .await?;

    let mut mailbox = Mailbox::new();
    let tx = mailbox.sender();
    client
        .subscribe(&topic, 1, move |d: &Delivery| {
            let _ = tx.send(d.payload.clone());
        })
        .await?
        .wait(SUBSCRIBE_BUDGET)
        .await?;

    let payload = vec![b'x'; size];
    let published = match client.publish(&topic, 1, false, payload.clone()).await {
        Ok(completion) => completion.wait(PUBACK_WAIT).await,
        Err(e) => Err(e),
    };
    if let Err(e) = published {
        debug!(size, error = %e, "publish not acknowledged");
        return Ok(false);
    }

    let delivered = matches!(
        mailbox.recv_within(DELIVERY_WAIT).await,
        Some(received) if received.as_ref() == payload.as_slice()
    );
    client.disconnect(DISCONNECT_LINGER).await;
    Ok(delivered)
}

/// Whether the broker acknowledges a QoS 1 publish of `size` bytes.
async fn publish_accepted(ctx: &ScenarioContext, size: usize, headroom: usize) -> Result<bool> {
    let client = ctx
        .client(&format!("pkt{size}"))
        .max_packet_size(headroom)
        .connect(CONNECT_BUDGET)
        .await?;
    let accepted = match client.publish(&ctx.scope.topic(), 1, false, vec![0u8; size]).await {
        Ok(completion) => completion.wait(PUBACK_WAIT).await.is_ok(),
        Err(_) => false,
    };
    client.disconnect(DISCONNECT_LINGER).await;
    debug!(size, accepted, "max packet attempt");
    Ok(accepted)
}

fn scenario_payload_delivery_min(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let min = ctx.settings.deliver_min;
        if deliver_once(&ctx, min).await? {
            return Ok(());
        }

        let mut largest = None;
        for size in fallback_sizes(min) {
            if deliver_once(&ctx, size).await? {
                largest = Some(size);
                break;
            }
        }
        Err(ConformanceError::Assertion(match largest {
            Some(size) => format!("payload of {min} bytes not delivered; largest delivered was {size} bytes"),
            None => format!("payload of {min} bytes not delivered and no smaller payload got through"),
        }))
    })
}

fn scenario_max_packet_accept(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let limit = ctx.settings.max_packet;
        let headroom = limit + FRAME_OVERHEAD;

        let largest = if publish_accepted(&ctx, limit, headroom).await? {
            limit
        } else {
            let (mut lo, mut hi) = (0usize, limit);
            while hi - lo > SEARCH_RESOLUTION {
                let mid = lo + (hi - lo) / 2;
                if publish_accepted(&ctx, mid, headroom).await? {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            lo
        };

        info!(largest, limit, "largest accepted QoS 1 publish");
        if largest == 0 {
            return Err(ConformanceError::Assertion(format!(
                "no QoS 1 publish below {limit} bytes was acknowledged"
            )));
        }
        Ok(())
    })
}

fn scenario_max_packet_overlimit(ctx: ScenarioContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
    Box::pin(async move {
        let size = ctx.settings.max_packet + 2048;
        if publish_accepted(&ctx, size, size + FRAME_OVERHEAD).await? {
            return Err(ConformanceError::Assertion(format!(
                "broker acknowledged a {size} byte publish above its {} byte limit",
                ctx.settings.max_packet
            )));
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fallback_sizes_descend_below_minimum() {
        assert_eq!(
            fallback_sizes(65536),
            vec![32768, 16384, 8192]
        );
        assert_eq!(
            fallback_sizes(1 << 20),
            vec![524288, 262144, 131072, 65536, 32768, 16384, 8192]
        );
    }

    #[test]
    fn test_fallback_sizes_tiny_minimum() {
        assert_eq!(fallback_sizes(8192), vec![4096, 2048, 1024]);
        assert!(fallback_sizes(0).is_empty());
    }
}
