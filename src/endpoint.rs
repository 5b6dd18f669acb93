use crate::config::Settings;
use crate::error::{ConformanceError, Result};
use std::fmt;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::WebSocket => f.write_str("ws"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub name: String,
    pub url: String,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn parse(name: &str, url: &str) -> Result<Self> {
        let invalid = |why: &str| ConformanceError::Configuration(format!("invalid {name} URL {url:?}: {why}"));

        let (scheme, rest) = url.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let (transport, default_port) = match scheme {
            "tcp" | "mqtt" => (TransportKind::Tcp, 1883),
            "ws" => (TransportKind::WebSocket, 80),
            other => return Err(invalid(&format!("unsupported scheme {other:?}"))),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        if transport == TransportKind::Tcp && rest.len() > authority.len() + 1 {
            return Err(invalid("tcp endpoints take no path"));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
                (host, port)
            }
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            transport,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, as dialed by raw TCP scenarios.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolves the configured endpoints, TCP first. Never touches the network.
pub fn resolve(settings: &Settings) -> Result<Vec<BrokerEndpoint>> {
    let mut endpoints = Vec::with_capacity(2);
    if !settings.tcp_url.is_empty() {
        endpoints.push(BrokerEndpoint::parse("tcp", &settings.tcp_url)?);
    }
    if !settings.ws_url.is_empty() {
        endpoints.push(BrokerEndpoint::parse("ws", &settings.ws_url)?);
    }
    if endpoints.is_empty() {
        return Err(ConformanceError::Configuration(
            "no broker endpoint configured (MQTT_TCP_URL and MQTT_WS_URL are both empty)".to_string(),
        ));
    }
    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::run_args;
    use test_case::test_case;

    #[test]
    fn test_parse_tcp() {
        let ep = BrokerEndpoint::parse("tcp", "tcp://broker.local:1884").unwrap();
        assert_eq!(ep.transport, TransportKind::Tcp);
        assert_eq!(ep.socket_addr(), "broker.local:1884");
    }

    #[test]
    fn test_parse_ws_keeps_url() {
        let ep = BrokerEndpoint::parse("ws", "ws://broker.local:8083/mqtt").unwrap();
        assert_eq!(ep.transport, TransportKind::WebSocket);
        assert_eq!(ep.port, 8083);
        assert_eq!(ep.url, "ws://broker.local:8083/mqtt");
    }

    #[test_case("mqtt://h" => 1883 ; "mqtt default")]
    #[test_case("ws://h/mqtt" => 80 ; "ws default")]
    fn test_default_ports(url: &str) -> u16 {
        BrokerEndpoint::parse("x", url).unwrap().port
    }

    #[test_case("broker:1883" ; "no scheme")]
    #[test_case("http://broker:1883" ; "wrong scheme")]
    #[test_case("tcp://broker:abc" ; "bad port")]
    #[test_case("tcp://broker:70000" ; "port overflow")]
    #[test_case("tcp://:1883" ; "no host")]
    fn test_parse_rejects(url: &str) {
        assert!(matches!(
            BrokerEndpoint::parse("tcp", url),
            Err(ConformanceError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_orders_tcp_first() {
        let settings = Settings::from_args(run_args()).unwrap();
        let names: Vec<_> = resolve(&settings).unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["tcp", "ws"]);
    }

    #[test]
    fn test_resolve_requires_one_endpoint() {
        let mut args = run_args();
        args.tcp_url.clear();
        args.ws_url.clear();
        let settings = Settings::from_args(args).unwrap();
        assert!(resolve(&settings).is_err());
    }
}
