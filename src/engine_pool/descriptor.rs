// ABOUTME: Engine descriptors - identity, launch command and startup options per engine
//
// A descriptor is immutable once the pool starts. The option list sent during
// the configuration phase is derived from it per engine kind: the neural kinds
// speak the lc0 option vocabulary, the CPU search kind the Stockfish one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

/// lc0 counts its neural cache in positions rather than megabytes
const NN_CACHE_ENTRIES_PER_MB: u64 = 1024;

/// Compute resource class of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// GPU-bound neural network engine (lc0)
    GpuNeural,
    /// Classical CPU alpha-beta search (Stockfish)
    CpuSearch,
    /// Neural engine trained on human games (lc0 with Maia weights)
    HumanLike,
}

impl EngineKind {
    /// Whether the engine speaks the lc0 option vocabulary
    #[must_use]
    pub const fn is_neural(self) -> bool {
        matches!(self, Self::GpuNeural | Self::HumanLike)
    }

    /// Stable lowercase label used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GpuNeural => "gpu-neural",
            Self::CpuSearch => "cpu-search",
            Self::HumanLike => "human-like",
        }
    }

    const fn default_display_name(self) -> &'static str {
        match self {
            Self::GpuNeural => "Leela Chess Zero",
            Self::CpuSearch => "Stockfish",
            Self::HumanLike => "Maia Chess",
        }
    }

    const fn default_description(self) -> &'static str {
        match self {
            Self::GpuNeural => "Neural network engine, strongest positional understanding",
            Self::CpuSearch => "Traditional alpha-beta engine, best tactical calculation",
            Self::HumanLike => "Human-like play, predicts moves humans would make",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scale of the `score cp` field an engine reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreScale {
    /// Centipawns from the side to move's point of view
    #[default]
    Centipawns,
    /// Win probability in hundredths of a percent (0..=10000)
    WinPercentage,
}

/// Static description of one configured engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    /// Unique engine name used to address it in requests
    pub name: String,

    /// Compute class; selects the output grammar and option vocabulary
    pub kind: EngineKind,

    /// Executable path, or a bare name resolved through `PATH`
    pub executable: PathBuf,

    /// Extra command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the subprocess
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Network weights file (neural kinds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<PathBuf>,

    /// Backend selector (neural kinds), e.g. `cuda-fp16`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// GPU device ids (neural kinds)
    #[serde(default)]
    pub gpu_ids: Vec<u32>,

    /// Hash / cache size in megabytes
    #[serde(default = "default_hash_mb")]
    pub hash_mb: u32,

    /// Search threads
    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Maximum simultaneous searches (one engine process per slot)
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Disabled engines are never started
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Scale of reported `score cp` values
    #[serde(default)]
    pub score_scale: ScoreScale,

    /// Human-facing name for engine listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Human-facing description for engine listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Extra `setoption` pairs, applied after (and overriding) derived ones
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

fn default_hash_mb() -> u32 {
    256
}

fn default_threads() -> u32 {
    1
}

fn default_concurrency_limit() -> usize {
    1
}

fn default_enabled() -> bool {
    true
}

impl EngineDescriptor {
    /// Minimal descriptor with defaults for everything but identity and path
    pub fn new(name: impl Into<String>, kind: EngineKind, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind,
            executable: executable.into(),
            args: Vec::new(),
            env: HashMap::new(),
            weights: None,
            backend: None,
            gpu_ids: Vec::new(),
            hash_mb: default_hash_mb(),
            threads: default_threads(),
            concurrency_limit: default_concurrency_limit(),
            enabled: true,
            score_scale: ScoreScale::default(),
            display_name: None,
            description: None,
            options: BTreeMap::new(),
        }
    }

    /// Built-in lc0 descriptor of the reference deployment
    #[must_use]
    pub fn lc0_default() -> Self {
        Self {
            weights: Some(PathBuf::from("/app/networks/BT4.pb.gz")),
            backend: Some("cuda-fp16".to_string()),
            gpu_ids: vec![0],
            hash_mb: 2048,
            threads: 2,
            ..Self::new("lc0", EngineKind::GpuNeural, "/opt/lc0/lc0")
        }
    }

    /// Built-in Maia descriptor: the lc0 binary with human-trained weights
    #[must_use]
    pub fn maia_default() -> Self {
        Self {
            weights: Some(PathBuf::from("/app/networks/maia-1900.pb.gz")),
            backend: Some("cuda-fp16".to_string()),
            gpu_ids: vec![0],
            hash_mb: 1024,
            threads: 2,
            ..Self::new("maia", EngineKind::HumanLike, "/opt/lc0/lc0")
        }
    }

    /// Built-in Stockfish descriptor
    #[must_use]
    pub fn stockfish_default() -> Self {
        Self {
            hash_mb: 2048,
            threads: 4,
            ..Self::new("stockfish", EngineKind::CpuSearch, "/opt/stockfish/stockfish")
        }
    }

    /// Name shown in engine listings
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.kind.default_display_name())
    }

    /// Description shown in engine listings
    #[must_use]
    pub fn description(&self) -> &str {
        self.description
            .as_deref()
            .unwrap_or_else(|| self.kind.default_description())
    }

    /// Ordered `setoption` pairs sent during the configuration phase
    ///
    /// `multipv` is the candidate count the engine runs with between requests.
    #[must_use]
    pub fn startup_options(&self, multipv: u32) -> Vec<(String, String)> {
        let mut options: Vec<(String, String)> = Vec::new();
        let mut push = |name: &str, value: String| options.push((name.to_string(), value));

        if self.kind.is_neural() {
            if let Some(weights) = &self.weights {
                push("WeightsFile", weights.display().to_string());
            }
            if let Some(backend) = &self.backend {
                push("Backend", backend.clone());
            }
            if let Some(backend_options) = backend_options(&self.gpu_ids) {
                push("BackendOptions", backend_options);
            }
            push("Threads", self.threads.to_string());
            push(
                "NNCacheSize",
                (u64::from(self.hash_mb) * NN_CACHE_ENTRIES_PER_MB).to_string(),
            );
            push("MultiPV", multipv.to_string());
            push("UCI_ShowWDL", "true".to_string());
            if self.score_scale == ScoreScale::WinPercentage {
                push("ScoreType", "win_percentage".to_string());
            }
        } else {
            push("Hash", self.hash_mb.to_string());
            push("Threads", self.threads.to_string());
            push("MultiPV", multipv.to_string());
            push("UCI_AnalyseMode", "true".to_string());
            push("UCI_ShowWDL", "true".to_string());
        }

        for (name, value) in &self.options {
            if let Some(existing) = options.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
                existing.1.clone_from(value);
            } else {
                options.push((name.clone(), value.clone()));
            }
        }

        options
    }
}

/// lc0 backend options selecting the GPU(s); multiple devices use the
/// multiplexing syntax `(gpu=0),(gpu=1)`
fn backend_options(gpu_ids: &[u32]) -> Option<String> {
    match gpu_ids {
        [] => None,
        [single] => Some(format!("gpu={single}")),
        many => Some(
            many.iter()
                .map(|id| format!("(gpu={id})"))
                .collect::<Vec<_>>()
                .join(","),
        ),
    }
}
