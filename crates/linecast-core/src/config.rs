// crates/linecast-core/src/config.rs
//
// Session tunables: defaults, JSON config file, env overrides. The env
// variable names for the contract knobs are stable operational interface.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::plan::Fps;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Minimum lead time Preload must precede a boundary by. A submitted
    /// boundary closer than this is torn down; never papered over.
    pub min_prefeed_lead_time_ms: i64,
    /// Commit-vs-schedule tolerance, typically one frame.
    pub boundary_tolerance_ms: i64,
    /// Output-queue depth at which the mux flips to PCR-paced steady state.
    pub steady_state_entry_depth: usize,
    /// Switch command issuance margin before the boundary. Issuance precedes
    /// the deadline; execution stays at the declared instant.
    pub switch_epsilon_ms: i64,
    /// Bounded producer channel capacity; the slot gate. Suspend and resume
    /// share this single threshold.
    pub producer_gate_depth: usize,
    /// Max tolerated |video − audio| admission skew before the symmetric
    /// backpressure violation fires.
    pub backpressure_bound: u64,
    /// Channel output rate. Per-segment fps descriptors feed the producer-side
    /// resample policy; CT always advances at this rate.
    pub output_fps: Fps,
    pub audio_rate: u32,
    pub pad_width: u32,
    pub pad_height: u32,
    pub listen_addr: String,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            min_prefeed_lead_time_ms: 2_000,
            boundary_tolerance_ms: 34,
            steady_state_entry_depth: 3,
            switch_epsilon_ms: 5,
            producer_gate_depth: 8,
            backpressure_bound: 4,
            output_fps: Fps::new(30, 1),
            audio_rate: 48_000,
            pad_width: 640,
            pad_height: 360,
            listen_addr: "0.0.0.0:8290".into(),
        }
    }
}

impl Tunables {
    /// Sustained-depth band around the steady-state target: `[1, 2N]`.
    pub fn equilibrium_band(&self) -> (usize, usize) {
        (1, self.steady_state_entry_depth * 2)
    }

    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(std::io::Error::other)
    }

    /// Apply env overrides on top of whatever was loaded. Unparseable values
    /// are ignored; a typo'd env var must not change timing behaviour.
    pub fn apply_env(mut self) -> Self {
        fn read<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        if let Some(v) = read("MIN_PREFEED_LEAD_TIME_MS") {
            self.min_prefeed_lead_time_ms = v;
        }
        if let Some(v) = read("BOUNDARY_TOLERANCE_MS") {
            self.boundary_tolerance_ms = v;
        }
        if let Some(v) = read("STEADY_STATE_ENTRY_DEPTH") {
            self.steady_state_entry_depth = v;
        }
        if let Some(v) = read::<String>("LINECAST_LISTEN") {
            self.listen_addr = v;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_contract() {
        let t = Tunables::default();
        assert_eq!(t.steady_state_entry_depth, 3);
        assert_eq!(t.equilibrium_band(), (1, 6));
        assert_eq!(t.boundary_tolerance_ms, 34); // one frame at 30 fps, rounded up
    }

    #[test]
    fn partial_config_file_keeps_defaults_for_the_rest() {
        let t: Tunables = serde_json::from_str(r#"{"min_prefeed_lead_time_ms": 500}"#).unwrap();
        assert_eq!(t.min_prefeed_lead_time_ms, 500);
        assert_eq!(t.steady_state_entry_depth, 3);
    }

    #[test]
    fn load_reads_a_config_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linecast.json");
        std::fs::write(&path, r#"{"boundary_tolerance_ms": 17, "listen_addr": "127.0.0.1:9000"}"#)
            .unwrap();
        let t = Tunables::load(&path).unwrap();
        assert_eq!(t.boundary_tolerance_ms, 17);
        assert_eq!(t.listen_addr, "127.0.0.1:9000");
    }
}
