// ABOUTME: Chooses the light or heavy engine from the shape of a request
// ABOUTME: Total and deterministic; never consults engine health

use crate::settings::RouterConfig;
use crate::types::{Engine, ExecutionRequest};
use crate::validator::extract_imports;
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteReason {
    MultiFile,
    Hint,
    Size(usize),
    HeavyModule(String),
    Default,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteReason::MultiFile => write!(f, "multi-file project"),
            RouteReason::Hint => write!(f, "engine hint"),
            RouteReason::Size(bytes) => write!(f, "{} bytes of source", bytes),
            RouteReason::HeavyModule(module) => write!(f, "imports {}", module),
            RouteReason::Default => write!(f, "default"),
        }
    }
}

pub struct EngineRouter {
    heavy_threshold_bytes: usize,
    heavy_modules: HashSet<String>,
}

impl EngineRouter {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            heavy_threshold_bytes: config.heavy_threshold_bytes,
            heavy_modules: config.heavy_modules.iter().cloned().collect(),
        }
    }

    pub fn route(&self, request: &ExecutionRequest) -> Engine {
        self.decide(request).0
    }

    /// Precedence: multi-file, then hint, then size, then heavy-only imports
    pub fn decide(&self, request: &ExecutionRequest) -> (Engine, RouteReason) {
        if request.is_multi_file() {
            return (Engine::Heavy, RouteReason::MultiFile);
        }
        if let Some(hint) = request.engine_hint {
            return (hint, RouteReason::Hint);
        }

        let size = request.total_size();
        if size > self.heavy_threshold_bytes {
            return (Engine::Heavy, RouteReason::Size(size));
        }

        for file in request.files() {
            if let Some(module) = extract_imports(&file.content)
                .into_iter()
                .find(|m| self.heavy_modules.contains(m))
            {
                return (Engine::Heavy, RouteReason::HeavyModule(module));
            }
        }

        (Engine::Light, RouteReason::Default)
    }
}
