use derive_setters::Setters;
use serde::{Deserialize, Serialize};

/// Which broker entry point spawns processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnPath {
    /// The broker's stable public interface.
    #[default]
    Public,
    /// Best-effort path relying on unstable broker internals.
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Setters, PartialEq)]
#[setters(into)]
#[serde(default)]
pub struct BrokerConfig {
    /// Request code passed to the broker's permission prompt and matched
    /// against permission results
    pub request_code: i32,

    /// Maximum number of captured output bytes; `None` keeps everything
    pub max_output_bytes: Option<usize>,

    /// Entry point used to spawn processes
    pub spawn_path: SpawnPath,

    /// Whether the local broker authenticates through a graphical prompt
    pub gui: bool,

    /// Custom authentication prompt, where the escalation tool supports one
    pub prompt: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_code: 0,
            max_output_bytes: None,
            spawn_path: SpawnPath::Public,
            gui: false,
            prompt: None,
        }
    }
}
