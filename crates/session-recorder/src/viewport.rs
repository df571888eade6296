//! Device-metrics emulation on a tab.
//!
//! Holds its own `ViewportEmulation` reference on the shared inspection attachment, so emulating a
//! viewport during a recording never detaches the recording's session and vice versa.

use std::sync::Arc;

use bugtrail_core_types::TabId;
use cdp_adapter::{Feature, InspectionManager};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::errors::SessionResult;

const TARGET: &str = "session-recorder";

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_scale")]
    pub device_scale_factor: f64,
    #[serde(default)]
    pub mobile: bool,
}

fn default_scale() -> f64 {
    1.0
}

impl Viewport {
    pub fn desktop(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }

    pub fn mobile(width: u32, height: u32, device_scale_factor: f64) -> Self {
        Self {
            width,
            height,
            device_scale_factor,
            mobile: true,
        }
    }
}

pub struct ViewportEmulation {
    inspection: Arc<InspectionManager>,
}

impl ViewportEmulation {
    pub fn new(inspection: Arc<InspectionManager>) -> Self {
        Self { inspection }
    }

    /// Applies `viewport` to `tab`. Re-applying replaces the previous override.
    pub async fn apply(&self, tab: &TabId, viewport: Viewport) -> SessionResult<()> {
        let fresh = !self.inspection.holds(tab, Feature::ViewportEmulation);
        self.inspection
            .acquire(tab, Feature::ViewportEmulation)
            .await?;
        let params = json!({
            "width": viewport.width,
            "height": viewport.height,
            "deviceScaleFactor": viewport.device_scale_factor,
            "mobile": viewport.mobile,
        });
        if let Err(err) = self
            .inspection
            .send(tab, "Emulation.setDeviceMetricsOverride", params)
            .await
        {
            if fresh {
                self.inspection
                    .release(tab, Feature::ViewportEmulation)
                    .await;
            }
            return Err(err.into());
        }
        info!(target: TARGET, %tab, width = viewport.width, height = viewport.height, "viewport emulated");
        Ok(())
    }

    /// Clears the override and releases the reference. Returns false when nothing was applied.
    pub async fn clear(&self, tab: &TabId) -> bool {
        if !self.inspection.holds(tab, Feature::ViewportEmulation) {
            return false;
        }
        if let Err(err) = self
            .inspection
            .send(tab, "Emulation.clearDeviceMetricsOverride", json!({}))
            .await
        {
            warn!(target: TARGET, %tab, %err, "clearing viewport override failed");
        }
        self.inspection
            .release(tab, Feature::ViewportEmulation)
            .await
    }

    pub fn is_active(&self, tab: &TabId) -> bool {
        self.inspection.holds(tab, Feature::ViewportEmulation)
    }
}
