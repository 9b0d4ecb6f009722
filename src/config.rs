//! Service configuration, read from an optional TOML file.

use crate::process::Application;
use crate::scheduler::ResourceClass;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Idle time after which a session without running work is reaped.
    pub session_timeout_secs: u64,
    pub reap_interval_secs: u64,
    /// Dispatcher tick. Submissions and completions also dispatch inline.
    pub tick_interval_ms: u64,
    /// Parent directory of every session tree.
    pub work_root: PathBuf,
    pub capacity: CapacityConfig,
    pub launcher: LauncherConfig,
}

/// Maximum concurrent requests per resource class.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct CapacityConfig {
    pub exclusive_automation: usize,
    pub background_task: usize,
    pub persistence: usize,
    pub external_api: usize,
}

/// Command lines used to start each automation application.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct LauncherConfig {
    pub excel: Vec<String>,
    pub powerpoint: Vec<String>,
}

impl Config {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session_timeout_secs == 0 {
            bail!("session_timeout_secs must be positive");
        }
        if self.reap_interval_secs == 0 {
            bail!("reap_interval_secs must be positive");
        }
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be positive");
        }
        for class in ResourceClass::ALL {
            if self.capacity.max_for(class) == 0 {
                bail!("capacity for {class} must be at least 1");
            }
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_timeout_secs: 30 * 60,
            reap_interval_secs: 5 * 60,
            tick_interval_ms: 500,
            work_root: std::env::temp_dir().join("automation-queue"),
            capacity: CapacityConfig::default(),
            launcher: LauncherConfig::default(),
        }
    }
}

impl CapacityConfig {
    pub fn max_for(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::ExclusiveAutomation => self.exclusive_automation,
            ResourceClass::BackgroundTask => self.background_task,
            ResourceClass::Persistence => self.persistence,
            ResourceClass::ExternalApi => self.external_api,
        }
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            exclusive_automation: 5,
            background_task: 10,
            persistence: 20,
            external_api: 10,
        }
    }
}

impl LauncherConfig {
    pub fn commands(&self) -> HashMap<Application, Vec<String>> {
        HashMap::from([
            (Application::Excel, self.excel.clone()),
            (Application::PowerPoint, self.powerpoint.clone()),
        ])
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        let headless = |module: &str| -> Vec<String> {
            ["soffice", "--headless", "--norestore", module]
                .into_iter()
                .map(String::from)
                .collect()
        };
        Self {
            excel: headless("--calc"),
            powerpoint: headless("--impress"),
        }
    }
}
