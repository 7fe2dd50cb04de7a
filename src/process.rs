//! Proxy process lifecycle and the capability registry.
//!
//! Independent capability modules register named factory methods once at
//! load time; every process instance constructed afterwards exposes them.
//! Factories are looked up by name at call time, gate on transport
//! readiness, and record the proxies they create in the owning instance's
//! registry so shutdown can enumerate and stop them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{ConfigError, ProcessConfig};
use crate::handover::{HandoverCoordinator, HandoverState};
use crate::proxy::{
    ManagedProxy, ProxyOptions, QueueProxy, RegisteredProxy, SharedProxyRegistry,
};
use crate::status::StatusMonitor;
use crate::topic::TopicBuilder;
use crate::transport::{Transport, TransportError};

/// Capability name used for proxies created through the built-in factory.
pub const MESSAGING_CAPABILITY: &str = "messaging";

/// Error raised by process construction or capability invocation.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("capability method '{name}' is already registered")]
    DuplicateMethod { name: String },
    #[error("unknown capability method '{name}'")]
    UnknownMethod { name: String },
    #[error("process transport closed before becoming ready")]
    NeverReady,
    #[error("capability rejected the request: {reason}")]
    InvalidRequest { reason: String },
}

/// Factory attached by a capability module.
pub type ProxyFactory = Arc<
    dyn Fn(ProcessContext, FactoryRequest) -> BoxFuture<'static, Result<Arc<dyn ManagedProxy>, ProcessError>>
        + Send
        + Sync,
>;

/// Request handed to a capability factory at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryRequest {
    pub instance_name: String,
    /// Capability-specific parameters, validated by the factory itself.
    #[serde(default)]
    pub params: Value,
}

impl FactoryRequest {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }
}

/// Registration surface handed to a capability module.
///
/// Duplicate method names are rejected at registration, whether the clash
/// is within one module or across modules that know nothing of each other.
pub struct CapabilityMethods {
    existing: BTreeSet<String>,
    staged: BTreeMap<String, ProxyFactory>,
}

impl CapabilityMethods {
    pub fn define(
        &mut self,
        name: impl Into<String>,
        factory: ProxyFactory,
    ) -> Result<(), ProcessError> {
        let name = name.into();
        if self.existing.contains(&name) || self.staged.contains_key(&name) {
            return Err(ProcessError::DuplicateMethod { name });
        }
        self.staged.insert(name, factory);
        Ok(())
    }
}

/// Extension point for independent capability modules.
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attaches this module's factory methods.
    fn register(&self, methods: &mut CapabilityMethods) -> Result<(), ProcessError>;
}

fn capability_registry() -> &'static Mutex<BTreeMap<String, ProxyFactory>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, ProxyFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(BTreeMap::new()))
}

struct CoordinatorHandle {
    coordinator: HandoverCoordinator,
    task: JoinHandle<()>,
}

struct ProcessCore {
    config: ProcessConfig,
    topics: TopicBuilder,
    transport: Arc<dyn Transport>,
    methods: BTreeMap<String, ProxyFactory>,
    registry: SharedProxyRegistry,
    coordinator: Mutex<Option<CoordinatorHandle>>,
    status: StatusMonitor,
}

/// Long-lived process owning the broker connection and every proxy created
/// against it.
pub struct ProxyProcess {
    core: Arc<ProcessCore>,
}

impl ProxyProcess {
    /// Process-wide capability registration, called once per module at load
    /// time. Every instance constructed afterwards exposes the methods.
    pub fn use_capability(capability: &dyn Capability) -> Result<(), ProcessError> {
        let registry = capability_registry();
        let mut map = registry.lock().unwrap();
        let mut methods = CapabilityMethods {
            existing: map.keys().cloned().collect(),
            staged: BTreeMap::new(),
        };
        capability.register(&mut methods)?;
        let count = methods.staged.len();
        map.extend(methods.staged);
        info!(
            capability = capability.name(),
            methods = count,
            "capability registered"
        );
        Ok(())
    }

    /// Validates the configuration, snapshots the capability registry, and
    /// starts the status monitor.
    pub fn new(config: ProcessConfig, transport: Arc<dyn Transport>) -> Result<Self, ProcessError> {
        config.validate()?;
        let topics = config.topic_builder()?;
        let registry: SharedProxyRegistry = Arc::new(Mutex::new(Vec::new()));
        let status = StatusMonitor::spawn(
            Arc::clone(&transport),
            topics.clone(),
            Arc::clone(&registry),
            Duration::from_millis(config.status_interval_ms),
            config.redundancy.status_expiry_secs,
        );
        let methods = capability_registry().lock().unwrap().clone();
        info!(
            process = %config.process_name,
            methods = methods.len(),
            "proxy process created"
        );
        Ok(Self {
            core: Arc::new(ProcessCore {
                config,
                topics,
                transport,
                methods,
                registry,
                coordinator: Mutex::new(None),
                status,
            }),
        })
    }

    pub fn process_name(&self) -> &str {
        &self.core.config.process_name
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.core.topics
    }

    pub fn context(&self) -> ProcessContext {
        ProcessContext {
            core: Arc::clone(&self.core),
        }
    }

    /// Current coordinator state, `Uninitialized` before the first proxy.
    pub fn handover_state(&self) -> HandoverState {
        self.core
            .coordinator
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.coordinator.state())
            .unwrap_or(HandoverState::Uninitialized)
    }

    /// Watch channel onto the coordinator state, once one exists.
    pub fn watch_handover(&self) -> Option<watch::Receiver<HandoverState>> {
        self.core
            .coordinator
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.coordinator.watch_state())
    }

    /// Every proxy this instance created, in creation order.
    pub fn registered_proxies(&self) -> Vec<RegisteredProxy> {
        self.core.registry.lock().unwrap().clone()
    }

    /// Creates a queue-backed proxy through the built-in messaging factory.
    pub async fn create_queue_proxy(
        &self,
        options: ProxyOptions,
    ) -> Result<Arc<QueueProxy>, ProcessError> {
        self.context()
            .create_queue_proxy(MESSAGING_CAPABILITY, options)
            .await
    }

    /// Invokes a registered capability factory, validated at call time.
    pub async fn create_proxy(
        &self,
        method: &str,
        request: FactoryRequest,
    ) -> Result<Arc<dyn ManagedProxy>, ProcessError> {
        let factory = self
            .core
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownMethod {
                name: method.to_string(),
            })?;
        factory(self.context(), request).await
    }

    /// Steps every registered proxy down, stops it, and disconnects.
    pub async fn shutdown(&self) {
        info!(process = %self.core.config.process_name, "shutting down proxy process");
        if let Some(handle) = self.core.coordinator.lock().unwrap().take() {
            handle.task.abort();
        }
        self.core.status.stop();
        let proxies = self.core.registry.lock().unwrap().clone();
        let window = self.core.config.redundancy.handover_window;
        for registered in proxies {
            let _ = registered.proxy.step_down(window);
            registered.proxy.stop().await;
        }
        if let Err(err) = self.core.transport.disconnect().await {
            error!(error = %err, "transport disconnect failed");
        }
        info!(process = %self.core.config.process_name, "shutdown complete");
    }
}

/// Handle capability factories receive into the owning process.
#[derive(Clone)]
pub struct ProcessContext {
    core: Arc<ProcessCore>,
}

impl ProcessContext {
    pub fn process_name(&self) -> &str {
        &self.core.config.process_name
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.core.topics
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.core.config
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.core.transport)
    }

    /// Waits for the broker connection to be established.
    pub async fn ready(&self) -> Result<(), ProcessError> {
        let mut readiness = self.core.transport.readiness();
        while !*readiness.borrow() {
            readiness
                .changed()
                .await
                .map_err(|_| ProcessError::NeverReady)?;
        }
        Ok(())
    }

    /// Records a proxy in the owning instance's registry.
    ///
    /// The association is bookkeeping only; the proxy's lifetime is
    /// independent, and discovery stays scoped to this process instance.
    pub fn track(&self, capability: impl Into<String>, proxy: Arc<dyn ManagedProxy>) {
        self.core.registry.lock().unwrap().push(RegisteredProxy {
            capability: capability.into(),
            proxy,
        });
    }

    /// Builds, tracks, and (when the process already holds the active role)
    /// resumes a queue-backed proxy. Awaits readiness first.
    pub async fn create_queue_proxy(
        &self,
        capability: &str,
        mut options: ProxyOptions,
    ) -> Result<Arc<QueueProxy>, ProcessError> {
        self.ready().await?;
        self.ensure_coordinator();

        let config = &self.core.config;
        if options.publish_delay.is_none() {
            options.publish_delay = Some(Duration::from_millis(config.throttle.publish_delay_ms));
        }
        if options.subscribe_delay.is_none() {
            options.subscribe_delay =
                Some(Duration::from_millis(config.throttle.subscribe_delay_ms));
        }
        if options.persistence_dir.is_none() && config.persistence.enabled {
            options.persistence_dir = Some(config.persistence.directory.clone());
        }

        let status_topic = self.core.topics.instance_status_topic(&options.instance_name);
        let subscriptions = options.subscribe_to.clone();
        let proxy = QueueProxy::new(
            &config.process_name,
            status_topic,
            self.transport(),
            options,
        );
        if !subscriptions.is_empty() {
            proxy.subscribe(&subscriptions).await?;
        }
        self.track(capability, proxy.clone() as Arc<dyn ManagedProxy>);

        let already_active = self
            .core
            .coordinator
            .lock()
            .unwrap()
            .as_ref()
            .map(|handle| handle.coordinator.state() == HandoverState::Active)
            .unwrap_or(false);
        if already_active {
            proxy.resume(None);
        }
        Ok(proxy)
    }

    /// Starts the handover coordinator on first use.
    fn ensure_coordinator(&self) {
        let mut guard = self.core.coordinator.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let coordinator = HandoverCoordinator::new(
            self.core.config.process_name.clone(),
            self.core.topics.clone(),
            Arc::clone(&self.core.transport),
            Arc::clone(&self.core.registry),
            self.core.config.redundancy.clone(),
        );
        let runner = coordinator.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = runner.run().await {
                error!(error = %err, "handover coordinator terminated");
            }
        });
        *guard = Some(CoordinatorHandle { coordinator, task });
    }
}
