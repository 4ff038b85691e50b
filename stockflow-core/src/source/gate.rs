//! Availability gate — poll the data source until it answers.
//!
//! Any non-2xx status, transport error, or malformed body counts as
//! "not yet". Only running out of time is terminal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Result of a single poke.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    NotYet(String),
}

/// One reachability check against the data source.
pub trait HealthProbe: Send + Sync {
    /// Endpoint being probed, for logs.
    fn endpoint(&self) -> &str;

    fn probe(&self) -> ProbeOutcome;
}

/// Successful gate passage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub pokes: u32,
    pub waited: Duration,
}

/// Poke `probe` every `poke_interval` until it reports available.
///
/// The last poke lands no later than `timeout` after the first; if that one
/// fails too, the gate fails with `AvailabilityTimeout`.
pub fn wait_until_available(
    probe: &dyn HealthProbe,
    poke_interval: Duration,
    timeout: Duration,
) -> Result<Availability> {
    let started = Instant::now();
    let mut pokes = 0u32;

    loop {
        pokes += 1;
        match probe.probe() {
            ProbeOutcome::Available => {
                let waited = started.elapsed();
                info!(endpoint = probe.endpoint(), pokes, ?waited, "data source available");
                return Ok(Availability { pokes, waited });
            }
            ProbeOutcome::NotYet(reason) => {
                debug!(endpoint = probe.endpoint(), pokes, %reason, "data source not available yet");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(endpoint = probe.endpoint(), pokes, ?elapsed, "availability gate timed out");
            return Err(PipelineError::AvailabilityTimeout {
                pokes,
                waited: elapsed,
            });
        }
        std::thread::sleep(poke_interval.min(timeout - elapsed));
    }
}

/// Poke cadence and deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateSettings {
    pub poke_interval: Duration,
    pub timeout: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            poke_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(300),
        }
    }
}

/// A probe bound to its polling settings.
#[derive(Clone)]
pub struct AvailabilityGate {
    probe: Arc<dyn HealthProbe>,
    settings: GateSettings,
}

impl AvailabilityGate {
    pub fn new(probe: Arc<dyn HealthProbe>, settings: GateSettings) -> Self {
        Self { probe, settings }
    }

    pub fn wait(&self) -> Result<Availability> {
        wait_until_available(
            self.probe.as_ref(),
            self.settings.poke_interval,
            self.settings.timeout,
        )
    }
}

/// HTTP GET probe: available on 2xx with a well-formed JSON body.
pub struct HttpHealthProbe {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, request_timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| PipelineError::Fetch(format!("build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn endpoint(&self) -> &str {
        &self.url
    }

    fn probe(&self) -> ProbeOutcome {
        let resp = match self.client.get(&self.url).send() {
            Ok(resp) => resp,
            Err(e) => return ProbeOutcome::NotYet(format!("transport: {e}")),
        };

        let status = resp.status();
        if !status.is_success() {
            return ProbeOutcome::NotYet(format!("HTTP {status}"));
        }

        match resp.json::<serde_json::Value>() {
            Ok(body) if is_well_formed(&body) => ProbeOutcome::Available,
            Ok(_) => ProbeOutcome::NotYet("unexpected body".into()),
            Err(e) => ProbeOutcome::NotYet(format!("malformed body: {e}")),
        }
    }
}

/// A health body is well-formed when it is a JSON object and, if it carries
/// a chart-API error slot, that slot is empty.
pub fn is_well_formed(body: &serde_json::Value) -> bool {
    let Some(obj) = body.as_object() else {
        return false;
    };
    for envelope in ["chart", "finance"] {
        if let Some(inner) = obj.get(envelope) {
            if !inner.get("error").map_or(true, serde_json::Value::is_null) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports available from the `succeed_on`-th poke onward (never if 0).
    struct CountingProbe {
        pokes: AtomicU32,
        succeed_on: u32,
    }

    impl HealthProbe for CountingProbe {
        fn endpoint(&self) -> &str {
            "test://health"
        }

        fn probe(&self) -> ProbeOutcome {
            let n = self.pokes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.succeed_on != 0 && n >= self.succeed_on {
                ProbeOutcome::Available
            } else {
                ProbeOutcome::NotYet("HTTP 503".into())
            }
        }
    }

    #[test]
    fn passes_on_first_success() {
        let probe = CountingProbe {
            pokes: AtomicU32::new(0),
            succeed_on: 3,
        };
        let got =
            wait_until_available(&probe, Duration::from_millis(1), Duration::from_secs(5)).unwrap();
        assert_eq!(got.pokes, 3);
    }

    #[test]
    fn times_out_when_never_available() {
        let probe = CountingProbe {
            pokes: AtomicU32::new(0),
            succeed_on: 0,
        };
        let err = wait_until_available(&probe, Duration::from_millis(5), Duration::from_millis(30))
            .unwrap_err();

        match err {
            PipelineError::AvailabilityTimeout { pokes, waited } => {
                assert!(pokes >= 2);
                assert!(waited >= Duration::from_millis(30));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn chart_error_body_is_not_well_formed() {
        assert!(is_well_formed(&json!({"chart": {"result": [], "error": null}})));
        assert!(is_well_formed(&json!({"finance": {"result": null}})));
        assert!(!is_well_formed(
            &json!({"chart": {"result": null, "error": {"code": "Not Found"}}})
        ));
        assert!(!is_well_formed(&json!([1, 2, 3])));
    }
}
