//! Data handlers (C7).
//!
//! Stateless publishers that wrap raw samples with pixel/sweep identity
//! before handing them to the bus adapter. A handler is cheap to construct -
//! the pipeline and MPPT tracker build one per phase (`vt_measurement`,
//! `iv_measurement/1`, `mppt_measurement`, ...) and drop it once the phase
//! ends.

use crate::bus::BusHandle;
use crate::error::DaqError;
use crate::types::Sample;
use serde::Serialize;

/// One published batch of samples, wrapped with identity (§4.1's
/// `data/raw/<kind>` payload shape).
#[derive(Serialize)]
struct DataPayload<'a> {
    data: &'a [Sample],
    pixel: &'a str,
    sweep: Option<&'a str>,
    clear: bool,
    end: bool,
}

/// Publishes one measurement kind for one pixel, optionally under a sweep label.
pub struct DataHandler {
    bus: BusHandle,
    kind: String,
    pixel: String,
    sweep: Option<String>,
}

impl DataHandler {
    /// Build a handler for `kind` (e.g. `"vt_measurement"`, `"iv_measurement/1"`)
    /// tagged with `pixel`'s label and an optional `sweep` label.
    pub fn new(bus: BusHandle, kind: impl Into<String>, pixel: impl Into<String>, sweep: Option<String>) -> Self {
        Self { bus, kind: kind.into(), pixel: pixel.into(), sweep }
    }

    /// Publish `samples` under `data/raw/<kind>`. `end` marks the last batch
    /// of this phase so subscribers can close out a live plot.
    pub fn handle(&self, samples: &[Sample], end: bool) -> Result<(), DaqError> {
        let payload = DataPayload { data: samples, pixel: &self.pixel, sweep: self.sweep.as_deref(), clear: false, end };
        self.bus.publish_json(format!("data/raw/{}", self.kind), &payload, false)
    }

    /// Publish a one-shot clear signal for this handler's plot.
    pub fn clear(&self) -> Result<(), DaqError> {
        self.bus.publish_clear(&self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn handle_publishes_under_data_raw_kind() {
        let (tx, mut rx) = mpsc::channel(4);
        let bus = BusHandle::for_test(tx);
        let handler = DataHandler::new(bus, "vt_measurement", "A1", None);
        let samples = vec![Sample::new(0.5, 0.01, 0.0, 0)];
        handler.handle(&samples, false).unwrap();
        let _ = rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn clear_publishes_plotter_clear_topic() {
        let (tx, mut rx) = mpsc::channel(4);
        let bus = BusHandle::for_test(tx);
        let handler = DataHandler::new(bus, "iv_measurement/1", "A1", Some("forward".to_string()));
        handler.clear().unwrap();
        let _ = rx.recv().await.unwrap();
    }
}
