use crate::client::Grant;
use crate::error::{ConformanceError, Result};
use crate::raw::SUBACK_FAILURE;

fn show(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) if bytes.len() <= 64 => format!("{text:?}"),
        _ => format!("{} bytes", bytes.len()),
    }
}

pub fn payload_identical(expected: &[u8], observed: &[u8]) -> Result<()> {
    if expected == observed {
        return Ok(());
    }
    if expected.len() != observed.len() {
        return Err(ConformanceError::mismatch(
            "payload length",
            expected.len(),
            observed.len(),
        ));
    }
    Err(ConformanceError::mismatch("payload", show(expected), show(observed)))
}

pub fn qos_equals(expected: u8, observed: u8) -> Result<()> {
    if expected == observed {
        Ok(())
    } else {
        Err(ConformanceError::mismatch("delivered QoS", expected, observed))
    }
}

pub fn exact_count(what: &str, expected: u64, observed: u64) -> Result<()> {
    if expected == observed {
        Ok(())
    } else {
        Err(ConformanceError::mismatch(what, expected, observed))
    }
}

/// One message matching several subscriptions of the same client must be
/// delivered once, at the highest QoS among those subscriptions.
pub fn deduplicated(delivered: u64, observed_qos: u8, subscription_qos: &[u8]) -> Result<()> {
    exact_count("deliveries for overlapping subscriptions", 1, delivered)?;
    let expected = subscription_qos.iter().copied().max().unwrap_or(0);
    if observed_qos != expected {
        return Err(ConformanceError::mismatch(
            "QoS for overlapping subscriptions (maximum of matches)",
            expected,
            observed_qos,
        ));
    }
    Ok(())
}

pub fn not_system_topic(topic: &str) -> Result<()> {
    if topic.starts_with('$') {
        Err(ConformanceError::Assertion(format!(
            "bare '#' subscription received system topic {topic}"
        )))
    } else {
        Ok(())
    }
}

pub fn non_empty_statistic(topic: &str, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        Err(ConformanceError::Assertion(format!("empty payload for {topic}")))
    } else {
        Ok(())
    }
}

/// Raw SUBACK code for an invalid filter must be the failure code.
pub fn filter_rejected(filter: &str, return_code: Option<u8>) -> Result<()> {
    match return_code {
        Some(SUBACK_FAILURE) => Ok(()),
        Some(code) => Err(ConformanceError::Assertion(format!(
            "invalid filter {filter} was granted QoS {code}, expected failure 0x80"
        ))),
        None => Err(ConformanceError::Assertion(format!(
            "no SUBACK return code for invalid filter {filter}"
        ))),
    }
}

pub fn granted(filter: &str, grants: &[Grant]) -> Result<u8> {
    match grants.first() {
        Some(Grant::Granted(qos)) => Ok(*qos),
        Some(Grant::Failure) => Err(ConformanceError::Assertion(format!(
            "subscription to {filter} was rejected"
        ))),
        None => Err(ConformanceError::Assertion(format!(
            "SUBACK for {filter} carried no return code"
        ))),
    }
}

/// Shared-subscription fan-out: nothing lost or duplicated across members,
/// and optionally no member starved.
pub fn shared_fanout(per_member: &[u64], published: u64, require_every_member: bool) -> Result<()> {
    let total: u64 = per_member.iter().sum();
    if total != published {
        return Err(ConformanceError::Assertion(format!(
            "share group delivered {total} of {published} messages (per member {per_member:?})"
        )));
    }
    if require_every_member && per_member.iter().any(|n| *n == 0) {
        return Err(ConformanceError::Assertion(format!(
            "share group starved a member: per member {per_member:?}"
        )));
    }
    Ok(())
}

/// Per-item failures of one scenario.
#[derive(Debug, Default)]
pub struct Findings {
    failures: Vec<String>,
}

impl Findings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, item: &str, result: Result<()>) {
        if let Err(e) = result {
            self.failures.push(format!("{item}: {e}"));
        }
    }

    pub fn fail(&mut self, item: &str, deviation: impl std::fmt::Display) {
        self.failures.push(format!("{item}: {deviation}"));
    }

    pub fn finish(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ConformanceError::Assertion(self.failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_payload_identical() {
        assert!(payload_identical(b"hello qos1", b"hello qos1").is_ok());
        let err = payload_identical(b"hello", b"hallo").unwrap_err();
        assert_eq!(err.to_string(), r#"payload: expected "hello", observed "hallo""#);
        let err = payload_identical(&[0u8; 100], &[0u8; 99]).unwrap_err();
        assert_eq!(err.to_string(), "payload length: expected 100, observed 99");
    }

    #[test]
    fn test_deduplicated_uses_maximum_qos() {
        assert!(deduplicated(1, 2, &[0, 2]).is_ok());
        assert!(deduplicated(1, 0, &[0, 2]).is_err());
        assert!(deduplicated(2, 2, &[0, 2]).is_err());
        assert!(deduplicated(0, 0, &[0, 0]).is_err());
    }

    #[test]
    fn test_filter_rejected() {
        assert!(filter_rejected("a/b#", Some(0x80)).is_ok());
        assert!(filter_rejected("a/b#", Some(0x00)).is_err());
        assert!(filter_rejected("a/b#", None).is_err());
    }

    #[test]
    fn test_granted() {
        assert_eq!(granted("t", &[Grant::Granted(1)]).unwrap(), 1);
        assert!(granted("t", &[Grant::Failure]).is_err());
        assert!(granted("t", &[]).is_err());
    }

    #[test]
    fn test_shared_fanout() {
        assert!(shared_fanout(&[2, 2], 4, false).is_ok());
        assert!(shared_fanout(&[4, 0], 4, false).is_ok());
        assert!(shared_fanout(&[4, 0], 4, true).is_err());
        assert!(shared_fanout(&[3, 2], 4, false).is_err());
        assert!(shared_fanout(&[1, 2], 4, false).is_err());
    }

    #[test]
    fn test_system_topic_checks() {
        assert!(not_system_topic("cp7/test").is_ok());
        assert!(not_system_topic("$SYS/broker/version").is_err());
        assert!(non_empty_statistic("$SYS/broker/uptime", b"12 seconds").is_ok());
        assert!(non_empty_statistic("$SYS/broker/uptime", b"").is_err());
    }

    #[test]
    fn test_clean_findings_pass() {
        let mut findings = Findings::new();
        findings.check("a/b#", filter_rejected("a/b#", Some(0x80)));
        assert!(findings.finish().is_ok());
    }

    #[test]
    fn test_findings_report_every_item() {
        let mut findings = Findings::new();
        findings.check("$SYS/broker/version", Ok(()));
        findings.check("$SYS/broker/uptime", non_empty_statistic("$SYS/broker/uptime", b""));
        findings.fail("$SYS/broker/clients/total", "timed out after 5s");
        let err = findings.finish().unwrap_err();
        assert_eq!(
            err.to_string(),
            "$SYS/broker/uptime: empty payload for $SYS/broker/uptime; \
             $SYS/broker/clients/total: timed out after 5s"
        );
    }
}
