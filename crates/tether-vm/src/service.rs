use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tether_config::ServiceConfig;
use tether_rpc::{Channel, ChannelOpener, Peer, RpcErrorObject};
use tokio::sync::broadcast;
use url::Url;

use crate::error::{Result, VmServiceError};
use crate::event::{streams, ServiceEvent};
use crate::invoke::{Rpc, Timeouts};
use crate::view::FlutterView;
use crate::vm::{Vm, VmState};
use crate::JsonMap;

/// Performs a reload when the VM asks the client to (the inbound
/// `reloadSources` method).
#[async_trait]
pub trait ReloadSourcesHandler: Send + Sync {
    async fn reload_sources(&self, isolate_id: &str, force: bool, pause: bool) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct ConnectOptions {
    pub config: ServiceConfig,
    /// When set, `reloadSources` is served and announced to the VM.
    pub reload_sources: Option<Arc<dyn ReloadSourcesHandler>>,
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("config", &self.config)
            .field("reload_sources", &self.reload_sources.is_some())
            .finish()
    }
}

/// A live connection to a VM service.
#[derive(Debug, Clone)]
pub struct VmService {
    http_uri: Url,
    ws_uri: Url,
    peer: Peer,
    vm: Vm,
    config: ServiceConfig,
}

/// `http://host:port/path` becomes `ws://host:port/path/ws`.
pub fn websocket_uri(http_uri: &Url) -> Result<Url> {
    let scheme = match http_uri.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(VmServiceError::Handshake {
                uri: http_uri.to_string(),
                message: format!("unsupported scheme `{other}`"),
            })
        }
    };
    let mut ws_uri = http_uri.clone();
    ws_uri
        .set_scheme(scheme)
        .map_err(|()| VmServiceError::Handshake {
            uri: http_uri.to_string(),
            message: format!("cannot switch to `{scheme}`"),
        })?;
    let path = format!("{}/ws", http_uri.path().trim_end_matches('/'));
    ws_uri.set_path(&path);
    Ok(ws_uri)
}

async fn open_with_retry(
    opener: &dyn ChannelOpener,
    ws_uri: &Url,
    config: &ServiceConfig,
) -> Result<Channel> {
    let attempts = config.connect_attempts.max(1);
    let mut delay = config.connect_retry_delay();
    let mut attempt = 1;
    loop {
        match opener.open(ws_uri).await {
            Ok(channel) => return Ok(channel),
            Err(err) if attempt < attempts => {
                tracing::debug!(
                    target: "tether.vm",
                    uri = %ws_uri,
                    attempt,
                    error = %err,
                    "connection attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => {
                return Err(VmServiceError::Handshake {
                    uri: ws_uri.to_string(),
                    message: format!("{err} (after {attempts} attempts)"),
                })
            }
        }
    }
}

fn bool_param(params: &JsonMap, key: &str) -> std::result::Result<bool, RpcErrorObject> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(value)) => Ok(*value),
        Some(other) => Err(RpcErrorObject::invalid_params(format!(
            "Invalid '{key}': {other}"
        ))),
    }
}

async fn serve_reload_sources(
    handler: Arc<dyn ReloadSourcesHandler>,
    params: Value,
) -> std::result::Result<Value, RpcErrorObject> {
    let params = params.as_object().cloned().unwrap_or_default();
    let isolate_id = match params.get("isolateId") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        other => {
            return Err(RpcErrorObject::invalid_params(format!(
                "Invalid 'isolateId': {}",
                other.cloned().unwrap_or(Value::Null)
            )))
        }
    };
    let force = bool_param(&params, "force")?;
    let pause = bool_param(&params, "pause")?;

    match handler.reload_sources(&isolate_id, force, pause).await {
        Ok(()) => Ok(json!({"type": "Success"})),
        Err(VmServiceError::Application {
            code,
            message,
            data,
            ..
        }) => Err(RpcErrorObject {
            code,
            message,
            data,
        }),
        Err(err) => Err(RpcErrorObject::server_error(format!(
            "Error during Sources Reload: {err}"
        ))),
    }
}

fn handle_stream_notify(vm: &Weak<VmState>, params: &Value) {
    let Ok(vm) = Vm::from_weak(vm) else {
        return;
    };
    let Some(stream_id) = params.get("streamId").and_then(Value::as_str) else {
        tracing::warn!(target: "tether.vm", %params, "streamNotify without streamId");
        return;
    };
    let Some(event) = params.get("event").and_then(Value::as_object) else {
        tracing::warn!(target: "tether.vm", stream = stream_id, "streamNotify without event");
        return;
    };
    if let Err(err) = vm.handle_event(stream_id, event) {
        tracing::warn!(target: "tether.vm", stream = stream_id, error = %err, "failed to apply event");
    }
}

impl VmService {
    /// Connects to the VM service behind `http_uri`.
    ///
    /// The channel is opened on the derived WebSocket endpoint, retrying with
    /// back-off, and the connection is only handed out after a successful
    /// `getVersion` round trip.
    pub async fn connect(
        http_uri: &Url,
        opener: Arc<dyn ChannelOpener>,
        options: ConnectOptions,
    ) -> Result<Self> {
        let ConnectOptions {
            config,
            reload_sources,
        } = options;
        let ws_uri = websocket_uri(http_uri)?;
        tracing::debug!(target: "tether.vm", uri = %ws_uri, "connecting to VM service");

        let channel = open_with_retry(opener.as_ref(), &ws_uri, &config).await?;
        let peer = Peer::start(channel);
        let rpc = Rpc::new(peer.clone(), Timeouts::from_config(&config));
        let vm = Vm::new(rpc, config.event_channel_size);

        {
            let vm = vm.downgrade();
            peer.register_method("streamNotify", move |params: Value| {
                handle_stream_notify(&vm, &params);
                async { Ok::<_, RpcErrorObject>(Value::Null) }
            });
        }

        if let Some(handler) = reload_sources {
            peer.register_method("reloadSources", move |params: Value| {
                serve_reload_sources(handler.clone(), params)
            });
            let announced = peer
                .send_notification(
                    "_registerService",
                    json!({"service": "reloadSources", "alias": config.client_alias}),
                )
                .await;
            if let Err(err) = announced {
                tracing::warn!(target: "tether.vm", error = %err, "failed to register reloadSources");
            }
        }

        let handshake = peer
            .send_request_with_timeout("getVersion", json!({}), config.request_timeout())
            .await;
        if let Err(err) = handshake {
            peer.close();
            return Err(VmServiceError::Handshake {
                uri: ws_uri.to_string(),
                message: err.to_string(),
            });
        }
        tracing::debug!(target: "tether.vm", uri = %ws_uri, "VM service connected");

        Ok(Self {
            http_uri: http_uri.clone(),
            ws_uri,
            peer,
            vm,
            config,
        })
    }

    pub fn http_uri(&self) -> &Url {
        &self.http_uri
    }

    pub fn ws_uri(&self) -> &Url {
        &self.ws_uri
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Refreshes the VM with `getVM`.
    pub async fn get_vm(&self) -> Result<Vm> {
        self.vm.reload().await
    }

    pub async fn on_event(&self, stream_id: &str) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.vm.on_event(stream_id).await
    }

    pub async fn on_vm_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::VM).await
    }

    pub async fn on_isolate_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::ISOLATE).await
    }

    pub async fn on_debug_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::DEBUG).await
    }

    pub async fn on_gc_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::GC).await
    }

    pub async fn on_timeline_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::TIMELINE).await
    }

    pub async fn on_logging_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::LOGGING).await
    }

    pub async fn on_extension_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::EXTENSION).await
    }

    pub async fn on_stdout_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::STDOUT).await
    }

    pub async fn on_stderr_event(&self) -> Result<broadcast::Receiver<ServiceEvent>> {
        self.on_event(streams::STDERR).await
    }

    pub async fn refresh_views(&self) -> Result<()> {
        self.vm.refresh_views().await
    }

    pub fn views(&self) -> Vec<FlutterView> {
        self.vm.views()
    }

    /// Polls until at least one view exists.
    ///
    /// Gives up quietly after the configured number of attempts; the caller
    /// sees whatever views are known at that point. Failed refreshes count as
    /// attempts.
    pub async fn wait_for_views(&self) -> Result<Vec<FlutterView>> {
        if !self.vm.is_flutter_engine() {
            return Ok(self.views());
        }
        self.try_refresh_views().await;
        let mut attempt = 0;
        while self.vm.first_view().is_none() && attempt < self.config.view_wait_attempts {
            tracing::debug!(target: "tether.vm", attempt, "waiting for a view");
            tokio::time::sleep(self.config.view_wait_delay()).await;
            self.try_refresh_views().await;
            attempt += 1;
        }
        Ok(self.views())
    }

    async fn try_refresh_views(&self) {
        if let Err(err) = self.vm.refresh_views().await {
            tracing::debug!(target: "tether.vm", error = %err, "view refresh failed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }

    /// Resolves once the connection has closed for any reason.
    pub async fn closed(&self) {
        self.peer.closed().await;
    }

    pub fn close(&self) {
        self.peer.close();
    }
}
