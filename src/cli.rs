use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "mqtt-functional")]
#[command(version = "0.1.0")]
#[command(about = "Functional conformance tests for a running MQTT broker", long_about = None)]
pub struct Cli {
    /// Tracing filter (e.g. "warn", "mqtt_functional=debug")
    #[arg(long, global = true, env = "RUST_LOG", default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run functional scenarios against a broker
    Run(RunArgs),

    /// List available scenarios
    List {
        /// Filter by section name
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[derive(clap::Args, Clone, Debug)]
pub struct RunArgs {
    /// TCP endpoint URL (empty disables it)
    #[arg(long, env = "MQTT_TCP_URL", default_value = "tcp://127.0.0.1:1883")]
    pub tcp_url: String,

    /// WebSocket endpoint URL (empty disables it)
    #[arg(long, env = "MQTT_WS_URL", default_value = "ws://127.0.0.1:8083/mqtt")]
    pub ws_url: String,

    /// Username for broker authentication
    #[arg(short, long, env = "MQTT_USERNAME")]
    pub username: Option<String>,

    /// Password for broker authentication
    #[arg(short = 'P', long, env = "MQTT_PASSWORD")]
    pub password: Option<String>,

    /// Only run against one transport
    #[arg(short, long, value_enum)]
    pub transport: Option<TransportFilter>,

    /// Filter scenarios by section name (e.g. "pubsub", "will")
    #[arg(short, long)]
    pub section: Option<String>,

    /// Filter by scenario id (e.g. "pubsub_qos1")
    #[arg(long)]
    pub scenario: Option<String>,

    /// Scenarios in flight at once
    #[arg(short = 'j', long, env = "MQTT_JOBS")]
    pub jobs: Option<String>,

    /// Per-scenario budget in seconds
    #[arg(long, env = "MQTT_SCENARIO_TIMEOUT")]
    pub timeout: Option<String>,

    /// Payload size in bytes the broker must deliver
    #[arg(long, env = "MQTT_DELIVER_MIN")]
    pub deliver_min: Option<String>,

    /// Broker maximum packet size in bytes
    #[arg(long, env = "MQTT_MAX_PACKET")]
    pub max_packet: Option<String>,

    /// Run the shared subscription distribution scenario
    #[arg(long, env = "MQTT_STRESS")]
    pub stress: bool,

    /// Run payload delivery and max packet size scenarios
    #[arg(long, env = "MQTT_TEST_LIMITS")]
    pub limits: bool,

    /// Run the over-limit publish scenario (may trigger broker IP blocking)
    #[arg(long, env = "MQTT_TEST_OVERLIMIT")]
    pub overlimit: bool,

    /// Run malformed frame scenarios (may trigger broker IP blocking)
    #[arg(long, env = "MQTT_TEST_MALFORMED")]
    pub malformed: bool,

    /// Enable verbose output
    #[arg(short = 'V', long)]
    pub verbose: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum TransportFilter {
    Tcp,
    Ws,
}
