//! The `IntAirAct` engine: one node's transport, discovery, registry, routes and actions.

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use intairact_core::{
    Action, ActionTable, Announcement, Capability, Device, DeviceId, DeviceRegistry, Generation,
    HandlerFault, MappingError, MappingResult, ObjectMapper, Request, Response, Route, Router,
    Serializer, SubscriptionToken,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::discovery::{Discovery, DiscoveryEvent, MulticastDiscovery, MulticastSettings};
use crate::error::Error;
use crate::manager::ObjectManager;
use crate::transport::{HttpClient, HttpServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct State {
    lifecycle: Lifecycle,
    port: u16,
    server: Option<HttpServer>,
    pump: Option<JoinHandle<()>>,
}

struct Inner {
    config: Config,
    own_id: DeviceId,
    registry: Arc<DeviceRegistry>,
    router: Arc<Router>,
    actions: Arc<ActionTable>,
    mapper: Arc<ObjectMapper>,
    discovery: Arc<dyn Discovery>,
    client: HttpClient,
    capabilities: RwLock<BTreeSet<Capability>>,
    announcement: watch::Sender<Announcement>,
    state: Mutex<State>,
}

/// A node. Cheap to clone; all clones share one engine, which stops when the last is dropped.
#[derive(Clone)]
pub struct IntAirAct {
    inner: Arc<Inner>,
}

impl IntAirAct {
    /// Engine using multicast discovery as configured.
    pub fn new(config: Config) -> Result<Self, Error> {
        let discovery = Arc::new(MulticastDiscovery::new(MulticastSettings::from_config(&config)));
        Self::with_discovery(config, discovery)
    }

    pub fn with_discovery(config: Config, discovery: Arc<dyn Discovery>) -> Result<Self, Error> {
        let own_id = config.device_id();
        let client =
            HttpClient::new(config.request_timeout()).map_err(|e| Error::Client(e.to_string()))?;
        let router = Arc::new(Router::new());
        let actions = Arc::new(ActionTable::new());
        let table = actions.clone();
        router.add_route(ActionTable::route(), move |req| table.handle(req));
        let (announcement, _) = watch::channel(Announcement::new(own_id.clone(), 0, []));

        Ok(Self {
            inner: Arc::new(Inner {
                registry: Arc::new(DeviceRegistry::new(own_id.clone())),
                own_id,
                config,
                router,
                actions,
                mapper: Arc::new(ObjectMapper::new()),
                discovery,
                client,
                capabilities: RwLock::new(BTreeSet::new()),
                announcement,
                state: Mutex::new(State {
                    lifecycle: Lifecycle::Stopped,
                    port: 0,
                    server: None,
                    pump: None,
                }),
            }),
        })
    }

    /// Bind the transport, start discovery and announce. Returns the bound port.
    /// Must be called inside a Tokio runtime. Already running: returns the current port.
    pub fn start(&self) -> Result<u16, Error> {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        if state.lifecycle == Lifecycle::Running {
            return Ok(state.port);
        }
        state.lifecycle = Lifecycle::Starting;

        let addr = SocketAddr::new(inner.config.host, inner.config.port);
        if tokio::runtime::Handle::try_current().is_err() {
            state.lifecycle = Lifecycle::Stopped;
            return Err(Error::Startup {
                addr,
                source: io::Error::new(io::ErrorKind::Other, "not inside a tokio runtime"),
            });
        }
        let server = match HttpServer::bind(addr, inner.router.clone(), inner.config.request_timeout()) {
            Ok(server) => server,
            Err(source) => {
                state.lifecycle = Lifecycle::Stopped;
                tracing::error!(%addr, error = %source, "transport bind failed");
                return Err(Error::Startup { addr, source });
            }
        };
        let port = server.local_addr().port();
        inner.announcement.send_modify(|a| {
            a.listen_port = port;
            a.capabilities = inner.capability_list();
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        inner.discovery.subscribe(events_tx);
        let generation = inner.registry.generation();
        let pump = tokio::spawn(pump_events(events_rx, inner.registry.clone(), generation));
        if let Err(e) = inner.discovery.announce(inner.announcement.subscribe()) {
            tracing::warn!(error = %e, "discovery unavailable, running without it");
        }

        state.server = Some(server);
        state.pump = Some(pump);
        state.port = port;
        state.lifecycle = Lifecycle::Running;
        tracing::info!(port, device = %inner.own_id, "intairact started");
        Ok(port)
    }

    /// Stop discovery and transport and forget all devices. Idempotent.
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.lock_state().lifecycle
    }

    /// Bound transport port; 0 when stopped.
    pub fn port(&self) -> u16 {
        self.inner.lock_state().port
    }

    pub fn own_id(&self) -> &DeviceId {
        &self.inner.own_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn supported_capabilities(&self) -> BTreeSet<Capability> {
        self.inner
            .capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Advertise a capability. Goes out with the next announcement.
    pub fn add_supported_capability(&self, capability: Capability) -> bool {
        let added = self
            .inner
            .capabilities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(capability);
        if added {
            self.inner.publish_capabilities();
        }
        added
    }

    pub fn remove_supported_capability(&self, capability: &Capability) -> bool {
        let removed = self
            .inner
            .capabilities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(capability);
        if removed {
            self.inner.publish_capabilities();
        }
        removed
    }

    /// Serve `route` and advertise it as a capability. False if already registered.
    pub fn route<F>(&self, route: Route, handler: F) -> bool
    where
        F: Fn(&Request) -> Result<Response, HandlerFault> + Send + Sync + 'static,
    {
        let capability = Capability::from(&route);
        if !self.inner.router.add_route(route, handler) {
            return false;
        }
        self.add_supported_capability(capability);
        true
    }

    /// Implement the action `name` and advertise it. False if the name is taken.
    pub fn add_action<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(&Action) -> Result<Option<Value>, HandlerFault> + Send + Sync + 'static,
    {
        if !self.inner.actions.register(name, handler) {
            return false;
        }
        self.add_supported_capability(Capability::for_action(name));
        true
    }

    pub fn remove_action(&self, name: &str) -> bool {
        if !self.inner.actions.remove(name) {
            return false;
        }
        self.remove_supported_capability(&Capability::for_action(name));
        true
    }

    /// Invoke `action` on `device`. The returned action carries the peer's result.
    pub async fn call_action(&self, action: Action, device: &Device) -> Result<Action, Error> {
        call_action(&self.inner.client, action, device).await
    }

    /// Like `call_action`, reporting through `handler`, which runs exactly once.
    /// On failure the handler gets the action as sent (no result) and the error.
    /// Must be called inside a Tokio runtime.
    pub fn call_action_with_handler<F>(&self, mut action: Action, device: &Device, handler: F) -> JoinHandle<()>
    where
        F: FnOnce(Action, Option<Error>) + Send + 'static,
    {
        let client = self.inner.client.clone();
        let device = device.clone();
        action.set_target(device.id().clone());
        tokio::spawn(async move {
            let sent = action.clone();
            match call_action(&client, action, &device).await {
                Ok(answered) => handler(answered, None),
                Err(e) => {
                    tracing::debug!(device = %device.id(), action = sent.name(), error = %e, "action call failed");
                    handler(sent, Some(e))
                }
            }
        })
    }

    pub fn devices(&self) -> Vec<Device> {
        self.inner.registry.devices()
    }

    pub fn devices_with_capability(&self, capability: &Capability) -> Vec<Device> {
        self.inner.registry.devices_with_capability(capability)
    }

    pub fn device(&self, id: &DeviceId) -> Option<Device> {
        self.inner.registry.device(id)
    }

    /// This node as seen through discovery, once its own announcement has come back.
    pub fn own_device(&self) -> Option<Device> {
        self.inner.registry.own_device()
    }

    pub fn add_handler_for_device_found<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Device, bool) + Send + Sync + 'static,
    {
        self.inner.registry.add_handler_for_device_found(handler)
    }

    pub fn add_handler_for_device_lost<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Device) + Send + Sync + 'static,
    {
        self.inner.registry.add_handler_for_device_lost(handler)
    }

    pub fn remove_observer(&self, token: SubscriptionToken) -> bool {
        self.inner.registry.remove_observer(token)
    }

    pub fn add_mapping<T: 'static>(&self, key: &str, attributes: &[&str]) -> Result<(), MappingError> {
        self.inner.mapper.add_mapping::<T>(key, attributes)
    }

    pub fn serializer_for_object<T: Serialize + 'static>(&self, object: &T) -> Result<Serializer, MappingError> {
        self.inner.mapper.serializer_for_object(object)
    }

    pub fn deserialize_object(&self, bytes: &[u8]) -> Result<MappingResult, MappingError> {
        self.inner.mapper.deserialize(bytes)
    }

    pub fn route_type<T: 'static>(&self, pattern: &str) -> Result<(), MappingError> {
        self.inner.mapper.route_type::<T>(pattern)
    }

    pub fn resource_path_for<T: Serialize + 'static>(&self, object: &T) -> Result<String, MappingError> {
        self.inner.mapper.resource_path_for(object)
    }

    pub fn object_mapper(&self) -> Arc<ObjectMapper> {
        self.inner.mapper.clone()
    }

    /// HTTP helper for mapped objects on `device`.
    pub fn object_manager_for_device(&self, device: &Device) -> ObjectManager {
        ObjectManager::new(device.clone(), self.inner.client.clone(), self.inner.mapper.clone())
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn capability_list(&self) -> Vec<Capability> {
        self.capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn publish_capabilities(&self) {
        let capabilities = self.capability_list();
        self.announcement.send_modify(|a| a.capabilities = capabilities);
    }

    fn shutdown(&self) {
        let mut state = self.lock_state();
        if state.lifecycle == Lifecycle::Stopped {
            return;
        }
        state.lifecycle = Lifecycle::Stopping;
        self.discovery.stop();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(server) = state.server.take() {
            server.close();
        }
        self.registry.clear();
        state.port = 0;
        state.lifecycle = Lifecycle::Stopped;
        tracing::info!(device = %self.own_id, "intairact stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Events still in flight when `stop` clears the registry carry the old generation
/// and are dropped.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    registry: Arc<DeviceRegistry>,
    generation: Generation,
) {
    while let Some(event) = events.recv().await {
        match event {
            DiscoveryEvent::Found { announcement, host } => {
                registry.on_device_found_in(generation, &announcement, host);
            }
            DiscoveryEvent::Lost(id) => {
                registry.on_device_lost_in(generation, &id);
            }
        }
    }
}

async fn call_action(client: &HttpClient, mut action: Action, device: &Device) -> Result<Action, Error> {
    action.set_target(device.id().clone());
    let request = action.to_request()?;
    let response = client.send(device.addr(), &request).await?;
    action.apply_response(&response)?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use intairact_core::{Method, StatusCode};
    use serde_json::json;

    use crate::discovery::ManualDiscovery;
    use crate::transport::TransportError;

    fn node(name: &str) -> (IntAirAct, Arc<ManualDiscovery>) {
        let discovery = Arc::new(ManualDiscovery::new());
        let engine = IntAirAct::with_discovery(Config::local(name), discovery.clone()).unwrap();
        (engine, discovery)
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Make `from` visible to `to` over loopback.
    fn introduce(to: &ManualDiscovery, from: &ManualDiscovery) {
        let announcement = from.announcement().unwrap();
        to.inject(DiscoveryEvent::Found {
            announcement,
            host: "127.0.0.1".parse().unwrap(),
        });
    }

    fn closed_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn start_assigns_port_and_stop_is_idempotent() {
        let (engine, discovery) = node("a");
        assert_eq!(engine.lifecycle(), Lifecycle::Stopped);
        let port = engine.start().unwrap();
        assert_ne!(port, 0);
        assert!(engine.is_running());
        assert_eq!(engine.start().unwrap(), port);
        assert_eq!(discovery.announcement().unwrap().listen_port, port);

        engine.stop();
        engine.stop();
        assert_eq!(engine.lifecycle(), Lifecycle::Stopped);
        assert_eq!(engine.port(), 0);
        assert!(!discovery.is_announcing());
    }

    #[tokio::test]
    async fn bind_failure_stays_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            port: taken.local_addr().unwrap().port(),
            ..Config::local("a")
        };
        let engine = IntAirAct::with_discovery(config, Arc::new(ManualDiscovery::new())).unwrap();
        assert!(matches!(engine.start(), Err(Error::Startup { .. })));
        assert_eq!(engine.lifecycle(), Lifecycle::Stopped);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let (engine, _) = node("a");
        assert!(matches!(engine.start(), Err(Error::Startup { .. })));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn ping_between_two_nodes() {
        let (a, a_disc) = node("a");
        let (b, b_disc) = node("b");
        assert!(b.add_action("ping", |_| Ok(Some(json!("pong")))));
        assert!(b.add_action("poke", |_| Ok(None)));
        assert!(b.add_action("sum", |action| {
            let x: i64 = action.parameter_as("x")?;
            let y: i64 = action.parameter_as("y")?;
            Ok(Some(json!(x + y)))
        }));
        a.start().unwrap();
        b.start().unwrap();

        introduce(&a_disc, &b_disc);
        let ping = Capability::for_action("ping");
        eventually(|| a.devices_with_capability(&ping).len() == 1).await;
        let peer = a.devices_with_capability(&ping).remove(0);
        assert_eq!(peer.id(), &DeviceId::new("b"));

        let answered = a.call_action(Action::new("ping"), &peer).await.unwrap();
        assert_eq!(answered.result(), Some(&json!("pong")));
        assert_eq!(answered.target(), Some(&DeviceId::new("b")));

        let answered = a.call_action(Action::new("poke"), &peer).await.unwrap();
        assert_eq!(answered.result(), None);

        let sum = Action::new("sum").with_parameter("x", 2).with_parameter("y", 40);
        let answered = a.call_action(sum, &peer).await.unwrap();
        assert_eq!(answered.result_as::<i64>().unwrap(), Some(42));

        let err = a.call_action(Action::new("sum"), &peer).await.unwrap_err();
        assert!(matches!(err, Error::Status { status: StatusCode::ERROR, .. }));

        let err = a.call_action(Action::new("missing"), &peer).await.unwrap_err();
        assert!(matches!(err, Error::Status { status: StatusCode::NOT_FOUND, .. }));
    }

    #[tokio::test]
    async fn unreachable_call_reports_once() {
        let (a, _) = node("a");
        let peer = Device::new(
            "gone".into(),
            SocketAddr::new("127.0.0.1".parse().unwrap(), closed_port()),
            [Capability::for_action("ping")],
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let counter = calls.clone();
        let task = a.call_action_with_handler(Action::new("ping"), &peer, move |action, err| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send((action, err));
        });
        task.await.unwrap();
        let (action, err) = rx.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Some(Error::Transport(_))));
        assert_eq!(action.result(), None);
        assert_eq!(action.target(), Some(&DeviceId::new("gone")));
    }

    #[tokio::test]
    async fn silent_peer_times_out_once() {
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            request_timeout_secs: 1,
            ..Config::local("a")
        };
        let a = IntAirAct::with_discovery(config, Arc::new(ManualDiscovery::new())).unwrap();
        let peer = Device::new(
            "silent".into(),
            silent.local_addr().unwrap(),
            [Capability::for_action("ping")],
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let counter = calls.clone();
        let task = a.call_action_with_handler(Action::new("ping"), &peer, move |action, err| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send((action, err));
        });
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        let (action, err) = rx.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            Some(Error::Transport(TransportError::Timeout { .. }))
        ));
        assert_eq!(action.result(), None);
        drop(silent);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_drops_events_still_in_flight() {
        let (a, a_disc) = node("a");
        let entered = Arc::new(AtomicBool::new(false));
        let e = entered.clone();
        a.add_handler_for_device_found(move |d, _| {
            if d.id() == &DeviceId::new("slow") {
                e.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(300));
            }
        });
        a.start().unwrap();

        let host = "10.0.0.2".parse().unwrap();
        for id in ["slow", "late"] {
            a_disc.inject(DiscoveryEvent::Found {
                announcement: Announcement::new(id.into(), 5000, Vec::<Capability>::new()),
                host,
            });
        }
        eventually(|| entered.load(Ordering::SeqCst)).await;
        a.stop();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(a.devices().is_empty());
        assert!(a.device(&DeviceId::new("late")).is_none());
    }

    #[tokio::test]
    async fn discovery_events_drive_registry() {
        let (a, a_disc) = node("a");
        let found = Arc::new(Mutex::new(Vec::new()));
        let lost = Arc::new(AtomicUsize::new(0));
        let f = found.clone();
        a.add_handler_for_device_found(move |d, own| {
            f.lock().unwrap().push((d.id().clone(), own));
        });
        let l = lost.clone();
        a.add_handler_for_device_lost(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });
        a.start().unwrap();

        let peer = Announcement::new("peer1".into(), 5000, [Capability::for_action("ping")]);
        let host = "10.0.0.2".parse().unwrap();
        a_disc.inject(DiscoveryEvent::Found {
            announcement: peer.clone(),
            host,
        });
        a_disc.inject(DiscoveryEvent::Found {
            announcement: peer,
            host,
        });
        introduce(&a_disc, &a_disc);
        eventually(|| a.own_device().is_some()).await;

        assert_eq!(a.devices().len(), 1);
        assert!(a.own_device().unwrap().is_own_device());
        assert_eq!(
            *found.lock().unwrap(),
            vec![(DeviceId::new("peer1"), false), (DeviceId::new("a"), true)]
        );

        a_disc.inject(DiscoveryEvent::Lost("peer1".into()));
        a_disc.inject(DiscoveryEvent::Lost("peer1".into()));
        eventually(|| a.devices().is_empty()).await;
        assert!(a.devices_with_capability(&Capability::for_action("ping")).is_empty());

        a.stop();
        assert!(a.own_device().is_none());
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capabilities_follow_registrations() {
        let (a, a_disc) = node("a");
        a.start().unwrap();
        assert!(a.route(Route::get("/contacts/:id").unwrap(), |req| {
            Ok(Response::ok().with_body(req.param("id").unwrap_or_default().to_string()))
        }));
        assert!(!a.route(Route::get("/contacts/:id").unwrap(), |_| Ok(Response::ok())));
        a.add_action("ping", |_| Ok(None));
        a.add_supported_capability(Capability::new("display"));

        let announced = a_disc.announcement().unwrap();
        let names: Vec<&str> = announced.capabilities.iter().map(|c| c.name()).collect();
        assert!(names.contains(&"GET /contacts/:id"));
        assert!(names.contains(&"PUT /action/ping"));
        assert!(names.contains(&"display"));

        assert!(a.remove_action("ping"));
        assert!(!a_disc
            .announcement()
            .unwrap()
            .capabilities
            .contains(&Capability::for_action("ping")));

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let addr = SocketAddr::new("127.0.0.1".parse().unwrap(), a.port());
        let resp = client
            .send(addr, &Request::new(Method::Get, "/contacts/42"))
            .await
            .unwrap();
        assert_eq!(resp.body(), b"42");
        let resp = client
            .send(addr, &Request::new(Method::Get, "/contacts"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn restart_after_stop() {
        let (a, _) = node("a");
        a.start().unwrap();
        a.stop();
        assert_ne!(a.start().unwrap(), 0);
        assert!(a.is_running());
    }
}
