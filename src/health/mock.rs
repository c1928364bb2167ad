use super::prober::{ProbeError, ProbeResponse, Prober};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Prober that replays scripted responses per URL.
///
/// When a URL's queue is drained the last scripted response repeats; a URL
/// with no script answers with the default (200 unless changed).
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, VecDeque<Result<ProbeResponse, ProbeError>>>>,
    last: Mutex<HashMap<String, Result<ProbeResponse, ProbeError>>>,
    calls: Mutex<HashMap<String, usize>>,
    default: Result<ProbeResponse, ProbeError>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::with_default(Ok(ProbeResponse::new(200, "")))
    }

    pub fn with_default(default: Result<ProbeResponse, ProbeError>) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            last: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            default,
        }
    }

    pub fn push(&self, url: impl Into<String>, response: Result<ProbeResponse, ProbeError>) {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    pub fn push_status(&self, url: &str, status: u16, times: usize) {
        for _ in 0..times {
            self.push(url, Ok(ProbeResponse::new(status, "")));
        }
    }

    pub fn push_refused(&self, url: &str, times: usize) {
        for _ in 0..times {
            self.push(
                url,
                Err(ProbeError::Connect {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                }),
            );
        }
    }

    /// Always answers `status` for `url`
    pub fn always(&self, url: &str, status: u16) {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.remove(url);
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), Ok(ProbeResponse::new(status, "")));
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for ScriptedProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_insert(0) += 1;

        let next = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(url)
            .and_then(|queue| queue.pop_front());

        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match next {
            Some(response) => {
                last.insert(url.to_string(), response.clone());
                response
            }
            None => last.get(url).cloned().unwrap_or_else(|| self.default.clone()),
        }
    }
}
