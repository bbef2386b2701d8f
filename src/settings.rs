//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! `FL` prefix, e.g. `FL_CLIENT__ID=3`. Examples of configuration files can be found in the
//! `configs/` directory located in the repository root.

use std::{fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{message::ClientId, topology::Topology};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Longest duration, in seconds, accepted in the settings: one day.
const MAX_SECONDS: f64 = 86_400.0;

/// Convert validated seconds. Out of range values are clamped.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.min(MAX_SECONDS)).unwrap_or_default()
}

fn load<T, P>(path: P) -> Result<T, ConfigError>
where
    T: de::DeserializeOwned,
    P: AsRef<Path>,
{
    let mut config = Config::new();
    config.merge(config::File::from(path.as_ref()))?;
    config.merge(Environment::with_prefix("fl").separator("__"))?;
    config.try_into()
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_topology"))]
/// The settings of a client or edge server process.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub client: ClientSettings,
    pub server: ServerSettings,
    #[serde(default)]
    pub algorithm: AlgorithmSettings,
    /// Present if and only if this process is an edge server.
    #[serde(default)]
    pub edge: Option<EdgeSettings>,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_id(&self) -> ClientId {
        ClientId::new(self.client.id)
    }

    pub fn is_edge_server(&self) -> bool {
        self.edge.is_some()
    }
}

fn validate_topology(settings: &Settings) -> Result<(), ValidationError> {
    if let Some(edge) = &settings.edge {
        if !settings.algorithm.cross_silo {
            return Err(ValidationError::new("edge server without cross-silo aggregation"));
        }
        if edge.per_round == 0 || edge.local_rounds == 0 {
            return Err(ValidationError::new("edge server with nothing to aggregate"));
        }
    }
    Topology::from_settings(settings)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid topology"))
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_heartbeat_max_interval"))]
/// Identity of this process and heartbeat settings.
pub struct ClientSettings {
    /// The client id, unique within a run. Leaf clients use `1..=total_clients`, edge servers use
    /// `total_clients + 1..=total_clients + total_silos`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [client]
    /// id = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_CLIENT__ID=3
    /// ```
    #[validate(range(min = 1))]
    pub id: u32,

    /// The total number of leaf clients in the run.
    #[validate(range(min = 1))]
    pub total_clients: u32,

    /// Upper bound, in seconds, of the random pause between two heartbeats.
    #[serde(default = "default_heartbeat_max_interval")]
    pub heartbeat_max_interval: f64,
}

impl ClientSettings {
    pub fn heartbeat_max_interval(&self) -> Duration {
        seconds(self.heartbeat_max_interval)
    }
}

fn default_heartbeat_max_interval() -> f64 {
    60.0
}

fn validate_heartbeat_max_interval(client: &ClientSettings) -> Result<(), ValidationError> {
    if (0.0..=MAX_SECONDS).contains(&client.heartbeat_max_interval) {
        Ok(())
    } else {
        Err(ValidationError::new("heartbeat interval out of range"))
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Address of the central server.
pub struct ServerSettings {
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [server]
    /// address = "127.0.0.1"
    /// port = 8000
    /// ```
    pub address: String,
    /// Port of the central server. Edge servers listen on `port + id`.
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
/// Aggregation topology settings.
pub struct AlgorithmSettings {
    /// Whether leaf clients report to edge servers instead of the central server.
    #[serde(default)]
    pub cross_silo: bool,
    /// Number of edge servers.
    #[serde(default = "default_total_silos")]
    pub total_silos: u32,
}

fn default_total_silos() -> u32 {
    1
}

impl Default for AlgorithmSettings {
    fn default() -> Self {
        Self {
            cross_silo: false,
            total_silos: default_total_silos(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Settings of an edge server.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [edge]
/// per_round = 5
/// local_rounds = 2
/// ```
pub struct EdgeSettings {
    /// Number of leaf clients selected in each local round.
    #[serde(default = "default_one")]
    pub per_round: usize,
    /// Number of local rounds run for each round of the central server.
    #[serde(default = "default_one_u32")]
    pub local_rounds: u32,
}

fn default_one() -> usize {
    1
}

fn default_one_u32() -> u32 {
    1
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            per_round: default_one(),
            local_rounds: default_one_u32(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
/// Settings of the simulated learner used by the `client` binary.
pub struct SimulationSettings {
    /// Number of training samples held by the client.
    pub samples: u64,
    /// Duration of a training step, in milliseconds.
    pub training_time: u64,
    /// Number of weights of the model, used when no global model was received.
    pub model_length: usize,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            samples: 100,
            training_time: 1000,
            model_length: 10,
        }
    }
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_silos"))]
/// The settings of the `coordinator` binary.
pub struct CoordinatorSettings {
    pub server: ServerSettings,
    #[validate]
    pub rounds: RoundSettings,
    /// Present if and only if the clients of the coordinator are edge servers.
    #[serde(default)]
    pub silos: Option<SiloSettings>,
    #[serde(default)]
    pub log: LoggingSettings,
}

impl CoordinatorSettings {
    /// Loads and validates the settings via a configuration file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: CoordinatorSettings = load(path)?;
        settings.validate()?;
        Ok(settings)
    }
}

fn validate_silos(settings: &CoordinatorSettings) -> Result<(), ValidationError> {
    match settings.silos {
        Some(silos) if silos.total_clients == 0 || silos.total_silos == 0 => {
            Err(ValidationError::new("cross-silo topology without clients or silos"))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_heartbeat_timeout"))]
/// Round settings of the central server.
pub struct RoundSettings {
    /// Number of rounds to run.
    #[validate(range(min = 1))]
    pub count: u32,
    /// Number of clients selected in each round.
    #[validate(range(min = 1))]
    pub per_round: usize,
    /// Number of weights of the initial global model.
    #[validate(range(min = 1))]
    pub model_length: usize,
    /// Seconds without heartbeat after which a selected client is evicted.
    /// Never evict stalled clients if not set.
    #[serde(default)]
    pub heartbeat_timeout: Option<f64>,
}

impl RoundSettings {
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout.map(seconds)
    }
}

fn validate_heartbeat_timeout(rounds: &RoundSettings) -> Result<(), ValidationError> {
    match rounds.heartbeat_timeout {
        Some(secs) if !(secs > 0.0 && secs <= MAX_SECONDS) => {
            Err(ValidationError::new("heartbeat timeout out of range"))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
/// Cross-silo topology, as seen by the coordinator.
///
/// Only edge servers are registered for rounds. Leaf clients still send their heartbeats to the
/// coordinator, these are recorded but never mistaken for registrations.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [silos]
/// total_clients = 10
/// total_silos = 2
/// ```
pub struct SiloSettings {
    pub total_clients: u32,
    pub total_silos: u32,
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: EnvFilter::new("info"),
        }
    }
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    /// Settings of a client talking directly to a central server on localhost.
    pub fn settings(id: u32, port: u16) -> Settings {
        Settings {
            client: ClientSettings {
                id,
                total_clients: 10,
                heartbeat_max_interval: 60.0,
            },
            server: ServerSettings {
                address: "127.0.0.1".into(),
                port,
            },
            algorithm: AlgorithmSettings::default(),
            edge: None,
            simulation: SimulationSettings::default(),
            log: LoggingSettings::default(),
        }
    }

    #[test]
    fn test_settings_new() {
        assert_ok!(Settings::new("configs/client.toml"));
        assert_ok!(Settings::new("configs/edge.toml"));
        assert_err!(Settings::new(""));
        assert_ok!(CoordinatorSettings::new("configs/coordinator.toml"));
        assert_ok!(CoordinatorSettings::new("configs/coordinator-silos.toml"));
    }

    #[test]
    fn test_coordinator_settings() {
        let settings = CoordinatorSettings::new("configs/coordinator.toml").unwrap();
        assert!(settings.silos.is_none());
        assert_eq!(
            settings.rounds.heartbeat_timeout(),
            Some(Duration::from_secs(180))
        );

        let mut settings = CoordinatorSettings::new("configs/coordinator-silos.toml").unwrap();
        let silos = settings.silos.unwrap();
        assert_eq!((silos.total_clients, silos.total_silos), (4, 2));
        settings.silos = Some(SiloSettings {
            total_clients: 4,
            total_silos: 0,
        });
        assert_err!(settings.validate());
    }

    #[test]
    fn test_validate_topology() {
        assert_ok!(settings(3, 8000).validate());

        // id outside of the leaf clients
        let mut leaf = settings(11, 8000);
        leaf.algorithm.cross_silo = true;
        leaf.algorithm.total_silos = 2;
        assert_err!(leaf.validate());

        // edge server without cross-silo aggregation
        let mut edge = settings(11, 8000);
        edge.edge = Some(EdgeSettings::default());
        assert_err!(edge.validate());

        edge.algorithm.cross_silo = true;
        edge.algorithm.total_silos = 2;
        assert_ok!(edge.validate());

        edge.edge = Some(EdgeSettings {
            per_round: 0,
            local_rounds: 1,
        });
        assert_err!(edge.validate());
    }

    #[test]
    fn test_validate_client() {
        let mut settings = settings(3, 8000);
        settings.client.heartbeat_max_interval = -1.0;
        assert_err!(settings.validate());

        settings.client.heartbeat_max_interval = f64::INFINITY;
        assert_err!(settings.validate());
        assert_eq!(
            settings.client.heartbeat_max_interval(),
            Duration::from_secs(86_400)
        );

        settings.client.heartbeat_max_interval = f64::NAN;
        assert_err!(settings.validate());
        settings.client.heartbeat_max_interval();

        settings.client.heartbeat_max_interval = 0.5;
        assert_ok!(settings.validate());
        assert_eq!(
            settings.client.heartbeat_max_interval(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_validate_heartbeat_timeout() {
        let mut settings = CoordinatorSettings::new("configs/coordinator.toml").unwrap();
        for secs in [0.0, -1.0, 1e300, f64::INFINITY, f64::NAN].iter() {
            settings.rounds.heartbeat_timeout = Some(*secs);
            assert_err!(settings.validate());
        }
        assert_eq!(
            RoundSettings {
                heartbeat_timeout: Some(f64::INFINITY),
                ..settings.rounds
            }
            .heartbeat_timeout(),
            Some(Duration::from_secs(86_400))
        );

        settings.rounds.heartbeat_timeout = None;
        assert_ok!(settings.validate());
        settings.rounds.heartbeat_timeout = Some(2.5);
        assert_ok!(settings.validate());
        assert_eq!(
            settings.rounds.heartbeat_timeout(),
            Some(Duration::from_millis(2500))
        );
    }
}
