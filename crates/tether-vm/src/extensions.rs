//! Framework service extensions (`ext.flutter.*`, `ext.ui.window.*`).
//!
//! An isolate that does not run the framework does not register these; such
//! calls yield `Ok(None)` instead of an error.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::Result;
use crate::invoke::CallOptions;
use crate::isolate::Isolate;
use crate::JsonMap;

const TOGGLE_TIMEOUT: Duration = Duration::from_millis(150);

impl Isolate {
    /// Invokes an extension method; method-not-found means the extension is
    /// absent and yields `Ok(None)`.
    pub async fn invoke_flutter_extension_rpc_raw(
        &self,
        method: &str,
        params: JsonMap,
        options: CallOptions,
    ) -> Result<Option<JsonMap>> {
        match self.invoke_rpc_raw(method, params, options.strict()).await {
            Err(err) if err.is_method_not_found() => {
                tracing::debug!(target: "tether.vm", method, "extension not registered");
                Ok(None)
            }
            other => other,
        }
    }

    async fn flutter_extension(&self, name: &str, options: CallOptions) -> Result<Option<JsonMap>> {
        self.invoke_flutter_extension_rpc_raw(&format!("ext.flutter.{name}"), JsonMap::new(), options)
            .await
    }

    /// Reads a boolean extension's state and flips it.
    async fn flutter_toggle(&self, name: &str) -> Result<Option<JsonMap>> {
        let method = format!("ext.flutter.{name}");
        let state = self
            .invoke_flutter_extension_rpc_raw(&method, JsonMap::new(), CallOptions::default())
            .await?;
        let flipped = state
            .as_ref()
            .and_then(|state| state.get("enabled"))
            .and_then(Value::as_str)
            .map(|enabled| if enabled == "true" { "false" } else { "true" });
        let Some(flipped) = flipped else {
            return Ok(state);
        };

        let mut params = JsonMap::new();
        params.insert("enabled".to_owned(), json!(flipped));
        self.invoke_flutter_extension_rpc_raw(
            &method,
            params,
            CallOptions::with_timeout(TOGGLE_TIMEOUT).non_fatal(),
        )
        .await
    }

    pub async fn flutter_exit(&self) -> Result<()> {
        self.flutter_extension("exit", CallOptions::short().non_fatal())
            .await?;
        Ok(())
    }

    pub async fn flutter_debug_dump_app(&self) -> Result<Option<JsonMap>> {
        self.flutter_extension("debugDumpApp", CallOptions::long())
            .await
    }

    pub async fn flutter_debug_dump_render_tree(&self) -> Result<Option<JsonMap>> {
        self.flutter_extension("debugDumpRenderTree", CallOptions::long())
            .await
    }

    pub async fn flutter_debug_dump_layer_tree(&self) -> Result<Option<JsonMap>> {
        self.flutter_extension("debugDumpLayerTree", CallOptions::long())
            .await
    }

    pub async fn flutter_debug_dump_semantics_tree_in_traversal_order(
        &self,
    ) -> Result<Option<JsonMap>> {
        self.flutter_extension("debugDumpSemanticsTreeInTraversalOrder", CallOptions::long())
            .await
    }

    pub async fn flutter_debug_dump_semantics_tree_in_inverse_hit_test_order(
        &self,
    ) -> Result<Option<JsonMap>> {
        self.flutter_extension(
            "debugDumpSemanticsTreeInInverseHitTestOrder",
            CallOptions::long(),
        )
        .await
    }

    pub async fn flutter_toggle_debug_paint_size_enabled(&self) -> Result<Option<JsonMap>> {
        self.flutter_toggle("debugPaint").await
    }

    pub async fn flutter_toggle_performance_overlay_override(&self) -> Result<Option<JsonMap>> {
        self.flutter_toggle("showPerformanceOverlay").await
    }

    pub async fn flutter_toggle_widget_inspector(&self) -> Result<Option<JsonMap>> {
        self.flutter_toggle("inspector.show").await
    }

    pub async fn flutter_debug_allow_banner(&self, show: bool) -> Result<()> {
        let mut params = JsonMap::new();
        params.insert("enabled".to_owned(), json!(if show { "true" } else { "false" }));
        self.invoke_flutter_extension_rpc_raw(
            "ext.flutter.debugAllowBanner",
            params,
            CallOptions::with_timeout(TOGGLE_TIMEOUT).non_fatal(),
        )
        .await?;
        Ok(())
    }

    /// Rebuilds the widget tree after a reload.
    pub async fn flutter_reassemble(&self) -> Result<Option<JsonMap>> {
        self.flutter_extension("reassemble", CallOptions::short())
            .await
    }

    pub async fn flutter_framework_present(&self) -> Result<bool> {
        Ok(self
            .flutter_extension("frameworkPresent", CallOptions::default())
            .await?
            .is_some())
    }

    pub async fn flutter_did_send_first_frame_event(&self) -> Result<bool> {
        let response = self
            .flutter_extension("didSendFirstFrameEvent", CallOptions::default())
            .await?;
        Ok(response
            .as_ref()
            .and_then(|response| response.get("enabled"))
            .and_then(Value::as_str)
            == Some("true"))
    }

    pub async fn ui_window_schedule_frame(&self) -> Result<Option<JsonMap>> {
        self.invoke_flutter_extension_rpc_raw(
            "ext.ui.window.scheduleFrame",
            JsonMap::new(),
            CallOptions::default(),
        )
        .await
    }

    pub async fn flutter_evict_asset(&self, asset_path: &str) -> Result<Option<JsonMap>> {
        let mut params = JsonMap::new();
        params.insert("value".to_owned(), json!(asset_path));
        self.invoke_flutter_extension_rpc_raw("ext.flutter.evict", params, CallOptions::default())
            .await
    }

    /// Reads, or with `platform` sets, the target platform override. Returns
    /// `"unknown"` when the framework does not answer.
    pub async fn flutter_platform_override(&self, platform: Option<&str>) -> Result<String> {
        let mut params = JsonMap::new();
        if let Some(platform) = platform {
            params.insert("value".to_owned(), json!(platform));
        }
        let response = self
            .invoke_flutter_extension_rpc_raw(
                "ext.flutter.platformOverride",
                params,
                CallOptions::short().non_fatal(),
            )
            .await?;
        Ok(response
            .as_ref()
            .and_then(|response| response.get("value"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned())
    }
}
