use crate::cli::{RunArgs, TransportFilter};
use crate::error::{ConformanceError, Result};
use std::time::Duration;

pub const DEFAULT_JOBS: usize = 8;
pub const DEFAULT_SCENARIO_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DELIVER_MIN: usize = 64 * 1024;
pub const DEFAULT_MAX_PACKET: usize = 1024 * 1024;

/// Scenarios that are skipped unless explicitly enabled.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OptIn {
    Stress,
    Limits,
    Overlimit,
    Malformed,
}

impl OptIn {
    pub fn env_var(self) -> &'static str {
        match self {
            OptIn::Stress => "MQTT_STRESS",
            OptIn::Limits => "MQTT_TEST_LIMITS",
            OptIn::Overlimit => "MQTT_TEST_OVERLIMIT",
            OptIn::Malformed => "MQTT_TEST_MALFORMED",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub tcp_url: String,
    pub ws_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: Option<TransportFilter>,
    pub section: Option<String>,
    pub scenario: Option<String>,
    pub jobs: usize,
    pub scenario_timeout: Duration,
    pub deliver_min: usize,
    pub max_packet: usize,
    pub stress: bool,
    pub limits: bool,
    pub overlimit: bool,
    pub malformed: bool,
    pub verbose: bool,
}

impl Settings {
    pub fn from_args(args: RunArgs) -> Result<Self> {
        let jobs = parse_tuning("MQTT_JOBS", args.jobs.as_deref())?
            .map(|n| n.max(1) as usize)
            .unwrap_or(DEFAULT_JOBS);
        let scenario_timeout = parse_tuning("MQTT_SCENARIO_TIMEOUT", args.timeout.as_deref())?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SCENARIO_TIMEOUT);
        let deliver_min = parse_tuning("MQTT_DELIVER_MIN", args.deliver_min.as_deref())?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_DELIVER_MIN);
        let max_packet = parse_tuning("MQTT_MAX_PACKET", args.max_packet.as_deref())?
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_PACKET);

        Ok(Self {
            tcp_url: args.tcp_url.trim().to_string(),
            ws_url: args.ws_url.trim().to_string(),
            username: args.username,
            password: args.password,
            transport: args.transport,
            section: args.section,
            scenario: args.scenario,
            jobs,
            scenario_timeout,
            deliver_min,
            max_packet,
            stress: args.stress,
            limits: args.limits,
            overlimit: args.overlimit,
            malformed: args.malformed,
            verbose: args.verbose,
        })
    }

    pub fn enabled(&self, gate: OptIn) -> bool {
        match gate {
            OptIn::Stress => self.stress,
            OptIn::Limits => self.limits,
            OptIn::Overlimit => self.overlimit,
            OptIn::Malformed => self.malformed,
        }
    }
}

/// Parses an optional non-negative integer. Blank counts as unset.
pub fn parse_tuning(key: &str, raw: Option<&str>) -> Result<Option<u64>> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(Some(n as u64)),
        _ => Err(ConformanceError::Configuration(format!("invalid {key}={raw:?}"))),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use test_case::test_case;

    pub(crate) fn run_args() -> RunArgs {
        RunArgs {
            tcp_url: "tcp://127.0.0.1:1883".to_string(),
            ws_url: "ws://127.0.0.1:8083/mqtt".to_string(),
            username: None,
            password: None,
            transport: None,
            section: None,
            scenario: None,
            jobs: None,
            timeout: None,
            deliver_min: None,
            max_packet: None,
            stress: false,
            limits: false,
            overlimit: false,
            malformed: false,
            verbose: false,
        }
    }

    #[test_case(None => None ; "unset")]
    #[test_case(Some("") => None ; "blank")]
    #[test_case(Some(" 42 ") => Some(42) ; "trimmed")]
    #[test_case(Some("0") => Some(0) ; "zero")]
    fn test_parse_tuning_accepts(raw: Option<&str>) -> Option<u64> {
        parse_tuning("MQTT_X", raw).unwrap()
    }

    #[test_case("-1" ; "negative")]
    #[test_case("64k" ; "suffixed")]
    #[test_case("1.5" ; "fractional")]
    fn test_parse_tuning_rejects(raw: &str) {
        let err = parse_tuning("MQTT_DELIVER_MIN", Some(raw)).unwrap_err();
        assert!(matches!(err, ConformanceError::Configuration(ref m) if m.contains("MQTT_DELIVER_MIN")));
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_args(run_args()).unwrap();
        assert_eq!(settings.jobs, DEFAULT_JOBS);
        assert_eq!(settings.deliver_min, 64 * 1024);
        assert_eq!(settings.max_packet, 1024 * 1024);
        assert!(!settings.enabled(OptIn::Stress));
    }

    #[test]
    fn test_zero_jobs_means_one() {
        let mut args = run_args();
        args.jobs = Some("0".to_string());
        assert_eq!(Settings::from_args(args).unwrap().jobs, 1);
    }

    #[test]
    fn test_malformed_numeric_aborts() {
        let mut args = run_args();
        args.max_packet = Some("-5".to_string());
        assert!(Settings::from_args(args).is_err());
    }
}
