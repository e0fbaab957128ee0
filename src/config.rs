use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SwarmError};
use crate::utils::parse_duration;

/// One step of a scripted run: ramp to `target` users at `rate` users per tick,
/// then hold for `duration` before moving on.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct StageStep {
    pub duration: String,
    pub target: usize,
    /// Users started or stopped per tick (k6/locust: spawn rate)
    #[serde(alias = "spawnRate", alias = "spawn_rate")]
    pub rate: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, JsonSchema)]
pub struct SwarmConfig {
    /// Spawner tick (default "1s")
    pub tick: Option<String>,
    /// Worker heartbeat period (default "1s")
    #[serde(alias = "heartbeatInterval")]
    pub heartbeat_interval: Option<String>,
    /// Silence after which the master marks a worker missing (default 3x heartbeat_interval)
    #[serde(alias = "heartbeatTimeout")]
    pub heartbeat_timeout: Option<String>,
    /// Silence after which a missing worker is removed for good (default "60s")
    #[serde(alias = "evictionTimeout")]
    pub eviction_timeout: Option<String>,
    /// How long stop-all waits for users before discarding them (default "10s")
    #[serde(alias = "stopTimeout")]
    pub stop_timeout: Option<String>,
    /// How long an in-flight request may finish after a stop (default "5s")
    #[serde(alias = "requestGrace")]
    pub request_grace: Option<String>,
    /// Scripted ramp profile
    pub stages: Option<Vec<StageStep>>,
    /// Runtime worker threads; defaults to the number of CPU cores
    #[serde(alias = "workerThreads")]
    pub worker_threads: Option<usize>,
    /// Relative share of the global user count this worker takes (default 1)
    #[serde(alias = "capacityWeight")]
    pub capacity_weight: Option<u32>,
    /// Address a worker connects to
    #[serde(alias = "masterAddr")]
    pub master_addr: Option<String>,
    /// Address the master listens on
    #[serde(alias = "bindAddr")]
    pub bind_addr: Option<String>,
}

/// A stage with its duration parsed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
    pub rate: f64,
}

/// Fully resolved settings with defaults applied.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub tick: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub eviction_timeout: Duration,
    pub stop_timeout: Duration,
    pub request_grace: Duration,
    pub stages: Vec<Stage>,
    pub worker_threads: usize,
    pub capacity_weight: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(1);
        Self {
            tick: Duration::from_secs(1),
            heartbeat_interval,
            heartbeat_timeout: heartbeat_interval * 3,
            eviction_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
            request_grace: Duration::from_secs(5),
            stages: Vec::new(),
            worker_threads: num_cpus::get().max(1),
            capacity_weight: 1,
        }
    }
}

impl SwarmConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| SwarmError::Config(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn resolve(&self) -> Result<RuntimeSettings> {
        let defaults = RuntimeSettings::default();
        let opt = |value: &Option<String>, name: &str, default: Duration| -> Result<Duration> {
            value
                .as_deref()
                .map(|s| parse_duration(s, name))
                .transpose()
                .map(|d| d.unwrap_or(default))
        };

        let tick = opt(&self.tick, "tick", defaults.tick)?;
        if tick.is_zero() {
            return Err(SwarmError::Config("tick must be greater than zero".to_string()));
        }
        let heartbeat_interval = opt(
            &self.heartbeat_interval,
            "heartbeat_interval",
            defaults.heartbeat_interval,
        )?;
        if heartbeat_interval.is_zero() {
            return Err(SwarmError::Config(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        let heartbeat_timeout = opt(
            &self.heartbeat_timeout,
            "heartbeat_timeout",
            heartbeat_interval * 3,
        )?;
        let eviction_timeout = opt(
            &self.eviction_timeout,
            "eviction_timeout",
            defaults.eviction_timeout,
        )?;
        if eviction_timeout < heartbeat_timeout {
            return Err(SwarmError::Config(format!(
                "eviction_timeout ({:?}) must not be shorter than heartbeat_timeout ({:?})",
                eviction_timeout, heartbeat_timeout
            )));
        }

        let mut stages = Vec::new();
        for (i, step) in self.stages.iter().flatten().enumerate() {
            if !(step.rate.is_finite() && step.rate > 0.0) {
                return Err(SwarmError::InvalidRate(step.rate));
            }
            stages.push(Stage {
                duration: parse_duration(&step.duration, &format!("stages[{}].duration", i))?,
                target: step.target,
                rate: step.rate,
            });
        }

        let capacity_weight = self.capacity_weight.unwrap_or(defaults.capacity_weight);
        if capacity_weight == 0 {
            return Err(SwarmError::Config("capacity_weight must be at least 1".to_string()));
        }

        Ok(RuntimeSettings {
            tick,
            heartbeat_interval,
            heartbeat_timeout,
            eviction_timeout,
            stop_timeout: opt(&self.stop_timeout, "stop_timeout", defaults.stop_timeout)?,
            request_grace: opt(&self.request_grace, "request_grace", defaults.request_grace)?,
            stages,
            worker_threads: self.worker_threads.unwrap_or(defaults.worker_threads).max(1),
            capacity_weight,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::schema_for;

    #[test]
    fn test_config_schema() {
        let schema = schema_for!(SwarmConfig);
        let schema_json = serde_json::to_string(&schema).unwrap();
        assert!(schema_json.contains("heartbeat_interval"));
        assert!(schema_json.contains("stages"));
        assert!(schema_json.contains("capacity_weight"));
    }

    #[test]
    fn test_defaults() {
        let settings = SwarmConfig::default().resolve().unwrap();
        assert_eq!(settings.tick, Duration::from_secs(1));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(settings.eviction_timeout, Duration::from_secs(60));
        assert_eq!(settings.capacity_weight, 1);
        assert!(settings.worker_threads >= 1);
        assert!(settings.stages.is_empty());
    }

    #[test]
    fn test_heartbeat_timeout_follows_interval() {
        let yaml = r#"
heartbeat_interval: "2s"
"#;
        let settings = SwarmConfig::from_yaml_str(yaml).unwrap().resolve().unwrap();
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(6));
    }

    #[test]
    fn test_config_deserialize_with_stages() {
        let yaml = r#"
stages:
  - duration: "10s"
    target: 50
    rate: 5
  - duration: "1m"
    target: 100
    spawnRate: 10
  - duration: "10s"
    target: 0
    rate: 20
"#;
        let config = SwarmConfig::from_yaml_str(yaml).unwrap();
        let settings = config.resolve().unwrap();
        assert_eq!(settings.stages.len(), 3);
        assert_eq!(settings.stages[1].duration, Duration::from_secs(60));
        assert_eq!(settings.stages[1].rate, 10.0);
        assert_eq!(settings.stages[2].target, 0);
    }

    #[test]
    fn test_camel_case_aliases() {
        let json = r#"{"heartbeatInterval":"500ms","stopTimeout":"3s","capacityWeight":4}"#;
        let settings = SwarmConfig::from_json_str(json).unwrap().resolve().unwrap();
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(settings.stop_timeout, Duration::from_secs(3));
        assert_eq!(settings.capacity_weight, 4);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let config = SwarmConfig {
            stop_timeout: Some("whenever".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.resolve(), Err(SwarmError::Config(_))));
    }

    #[test]
    fn test_zero_heartbeat_interval_rejected() {
        let config = SwarmConfig::from_yaml_str("heartbeat_interval: \"0\"\n").unwrap();
        assert!(matches!(config.resolve(), Err(SwarmError::Config(_))));
        let config = SwarmConfig::from_yaml_str("heartbeat_interval: \"0ms\"\n").unwrap();
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_huge_duration_is_config_error() {
        let config = SwarmConfig {
            stop_timeout: Some("99999999999999999999h".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.resolve(), Err(SwarmError::Config(_))));
    }

    #[test]
    fn test_eviction_shorter_than_timeout_rejected() {
        let config = SwarmConfig {
            heartbeat_timeout: Some("10s".to_string()),
            eviction_timeout: Some("5s".to_string()),
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }

    #[test]
    fn test_stage_rate_must_be_positive() {
        let yaml = r#"
stages:
  - duration: "10s"
    target: 5
    rate: 0
"#;
        let config = SwarmConfig::from_yaml_str(yaml).unwrap();
        assert!(matches!(config.resolve(), Err(SwarmError::InvalidRate(_))));
    }
}
