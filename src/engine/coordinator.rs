//! Backend coordinator - probing, fallback and device-loss recovery
//!
//! Tiers are probed most capable first (WebGPU, WebGL, Canvas 2D). A tier
//! counts as available only once its provider hands back a live backend
//! within the probe timeout. A tier that loses its device gets exactly one
//! re-initialization per session; after that it is demoted and the next
//! tier down takes over.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{EngineError, EngineResult};
use crate::layer::Layer;
use crate::render::{BackendCapability, BackendKind, RenderBackend};

/// Creates a backend of one tier
pub trait BackendProvider {
    fn kind(&self) -> BackendKind;

    /// Cheap check that the API exists at all (no context is created)
    fn is_supported(&self) -> bool {
        true
    }

    /// Obtain a real context/device and wrap it in a backend
    fn initialize(&self) -> LocalBoxFuture<'static, EngineResult<Box<dyn RenderBackend>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    /// Upper bound for a single backend initialization attempt
    pub probe_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Unprobed,
    Probing,
    Ready(BackendKind),
    DeviceLost(BackendKind),
    Reinitializing(BackendKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    Selected(BackendKind),
    DeviceLost(BackendKind),
    Recovered(BackendKind),
    Demoted { from: BackendKind, to: BackendKind },
}

/// Receives backend transitions (status bars, telemetry, tests)
pub trait BackendObserver {
    fn on_backend_event(&self, event: BackendEvent);
}

impl<F: Fn(BackendEvent)> BackendObserver for F {
    fn on_backend_event(&self, event: BackendEvent) {
        self(event)
    }
}

/// Flag raised from a device-lost callback, polled on the frame loop
#[derive(Debug, Clone, Default)]
pub struct DeviceLossSignal(Arc<AtomicBool>);

impl DeviceLossSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Highest tier the capability allows
pub fn select_kind(capability: &BackendCapability) -> Option<BackendKind> {
    BackendKind::ALL
        .into_iter()
        .find(|kind| capability.supports(*kind))
}

pub struct EngineCoordinator {
    config: CoordinatorConfig,
    providers: Vec<Box<dyn BackendProvider>>,
    state: CoordinatorState,
    capability: BackendCapability,
    backend: Option<Box<dyn RenderBackend>>,
    recovered: HashSet<BackendKind>,
    demoted: HashSet<BackendKind>,
    observers: Mutex<Vec<Arc<dyn BackendObserver>>>,
}

impl EngineCoordinator {
    pub fn new(config: CoordinatorConfig, mut providers: Vec<Box<dyn BackendProvider>>) -> Self {
        providers.sort_by_key(|provider| provider.kind());
        Self {
            config,
            providers,
            state: CoordinatorState::Unprobed,
            capability: BackendCapability::default(),
            backend: None,
            recovered: HashSet::new(),
            demoted: HashSet::new(),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn capability(&self) -> BackendCapability {
        self.capability
    }

    pub fn current_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|backend| backend.kind())
    }

    pub fn is_demoted(&self, kind: BackendKind) -> bool {
        self.demoted.contains(&kind)
    }

    pub fn backend(&self) -> Option<&dyn RenderBackend> {
        self.backend.as_deref()
    }

    pub fn backend_mut(&mut self) -> EngineResult<&mut dyn RenderBackend> {
        match self.backend.as_deref_mut() {
            Some(backend) => Ok(backend),
            None => Err(EngineError::BackendNotReady),
        }
    }

    pub fn is_device_lost(&self) -> bool {
        self.backend
            .as_ref()
            .is_some_and(|backend| backend.is_device_lost())
    }

    pub fn subscribe(&self, observer: Arc<dyn BackendObserver>) {
        self.observers.lock().push(observer);
    }

    fn notify(&self, event: BackendEvent) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer.on_backend_event(event);
        }
    }

    fn provider(&self, kind: BackendKind) -> Option<&dyn BackendProvider> {
        self.providers
            .iter()
            .find(|provider| provider.kind() == kind)
            .map(|provider| provider.as_ref())
    }

    /// One initialization attempt, bounded by the probe timeout
    async fn initialize_kind(&self, kind: BackendKind) -> EngineResult<Box<dyn RenderBackend>> {
        let Some(provider) = self.provider(kind) else {
            return Err(EngineError::BackendUnavailable {
                kind,
                reason: "no provider registered".into(),
            });
        };
        if !provider.is_supported() {
            return Err(EngineError::BackendUnavailable {
                kind,
                reason: "not supported in this environment".into(),
            });
        }

        let after_ms = self.config.probe_timeout_ms;
        let attempt = provider.initialize();
        match tokio::time::timeout(Duration::from_millis(after_ms), attempt).await {
            Ok(Ok(backend)) if backend.kind() == kind => Ok(backend),
            Ok(Ok(backend)) => Err(EngineError::BackendUnavailable {
                kind,
                reason: format!("provider returned a {} backend", backend.kind()),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::BackendTimeout { kind, after_ms }),
        }
    }

    /// Initialize `kind` and move every layer onto it.
    ///
    /// A layer the backend cannot take fails the whole tier: layers already
    /// moved are pulled back to host memory before the backend is dropped.
    async fn attach(
        &self,
        kind: BackendKind,
        layers: &mut [Layer],
    ) -> EngineResult<Box<dyn RenderBackend>> {
        let mut backend = self.initialize_kind(kind).await?;
        if let Err(e) = adopt_all(backend.as_mut(), layers) {
            release_all(backend.as_mut(), layers);
            return Err(e);
        }
        Ok(backend)
    }

    /// Probe tiers in order and install the first one that initializes.
    ///
    /// Tiers below the selected one are not initialized; their capability
    /// reflects `is_supported` only.
    pub async fn probe(&mut self, layers: &mut [Layer]) -> EngineResult<BackendKind> {
        self.state = CoordinatorState::Probing;
        let mut capability = BackendCapability::default();
        let mut selected: Option<Box<dyn RenderBackend>> = None;

        for kind in BackendKind::ALL {
            if selected.is_some() {
                let supported = !self.is_demoted(kind)
                    && self.provider(kind).is_some_and(|p| p.is_supported());
                capability.set(kind, supported);
                continue;
            }
            if self.is_demoted(kind) {
                continue;
            }
            match self.attach(kind, layers).await {
                Ok(backend) => {
                    tracing::info!("Backend {} initialized", kind);
                    capability.set(kind, true);
                    selected = Some(backend);
                }
                Err(e) => {
                    tracing::warn!("Backend {} rejected: {}", kind, e);
                    capability.set(kind, false);
                }
            }
        }

        self.capability = capability;
        let Some(backend) = selected else {
            tracing::error!("No rendering backend available");
            self.state = CoordinatorState::Unprobed;
            return Err(EngineError::NoBackendAvailable);
        };

        let kind = backend.kind();
        self.backend = Some(backend);
        self.state = CoordinatorState::Ready(kind);
        self.notify(BackendEvent::Selected(kind));
        Ok(kind)
    }

    /// Switch to `kind` explicitly, moving every layer across.
    pub async fn select_backend(
        &mut self,
        kind: BackendKind,
        layers: &mut [Layer],
    ) -> EngineResult<()> {
        if self.is_demoted(kind) {
            return Err(EngineError::BackendDemoted(kind));
        }
        if self.current_kind() == Some(kind) {
            return Ok(());
        }

        let mut backend = self.initialize_kind(kind).await?;
        if let Some(current) = self.backend.as_deref_mut() {
            release_all(current, layers);
        }
        if let Err(e) = adopt_all(backend.as_mut(), layers) {
            tracing::warn!("Backend {} could not adopt layers: {}", kind, e);
            release_all(backend.as_mut(), layers);
            drop(backend);
            if let Some(current) = self.backend.as_deref_mut() {
                if let Err(restore) = adopt_all(current, layers) {
                    tracing::error!("Layers stay on the host after a failed switch: {}", restore);
                }
            }
            return Err(e);
        }

        self.capability.set(kind, true);
        self.backend = Some(backend);
        self.state = CoordinatorState::Ready(kind);
        tracing::info!("Switched to backend {}", kind);
        self.notify(BackendEvent::Selected(kind));
        Ok(())
    }

    /// Recover from a lost device.
    ///
    /// Layers are pulled back to host memory first. The lost tier is
    /// re-initialized once per session; if that fails (or the tier already
    /// used its recovery) it is demoted and lower tiers are tried in order.
    pub async fn handle_device_lost(&mut self, layers: &mut [Layer]) -> EngineResult<BackendKind> {
        let Some(mut lost) = self.backend.take() else {
            return Err(EngineError::BackendNotReady);
        };
        let kind = lost.kind();
        tracing::warn!("Device lost on backend {}", kind);
        self.state = CoordinatorState::DeviceLost(kind);
        self.notify(BackendEvent::DeviceLost(kind));
        release_all(lost.as_mut(), layers);
        drop(lost);

        if self.recovered.insert(kind) {
            self.state = CoordinatorState::Reinitializing(kind);
            match self.attach(kind, layers).await {
                Ok(backend) => {
                    self.backend = Some(backend);
                    self.state = CoordinatorState::Ready(kind);
                    tracing::info!("Backend {} recovered", kind);
                    self.notify(BackendEvent::Recovered(kind));
                    return Ok(kind);
                }
                Err(e) => tracing::warn!("Re-initializing {} failed: {}", kind, e),
            }
        }

        self.demoted.insert(kind);
        self.capability.set(kind, false);

        let mut next = kind.fallback();
        while let Some(candidate) = next {
            next = candidate.fallback();
            if self.is_demoted(candidate) {
                continue;
            }
            self.state = CoordinatorState::Reinitializing(candidate);
            match self.attach(candidate, layers).await {
                Ok(backend) => {
                    self.backend = Some(backend);
                    self.capability.set(candidate, true);
                    self.state = CoordinatorState::Ready(candidate);
                    tracing::warn!("Backend {} demoted, continuing on {}", kind, candidate);
                    self.notify(BackendEvent::Demoted {
                        from: kind,
                        to: candidate,
                    });
                    return Ok(candidate);
                }
                Err(e) => {
                    tracing::warn!("Fallback {} failed: {}", candidate, e);
                    self.capability.set(candidate, false);
                }
            }
        }

        tracing::error!("No backend left after losing {}", kind);
        self.state = CoordinatorState::Unprobed;
        Err(EngineError::NoBackendAvailable)
    }
}

fn adopt_all(backend: &mut dyn RenderBackend, layers: &mut [Layer]) -> EngineResult<()> {
    for layer in layers.iter_mut() {
        backend.adopt_layer(layer)?;
    }
    Ok(())
}

fn release_all(backend: &mut dyn RenderBackend, layers: &mut [Layer]) {
    for layer in layers.iter_mut() {
        if let Err(e) = backend.release_layer(layer) {
            tracing::error!("Failed to release layer {}: {}", layer.id, e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{Behavior, MockProvider};
    use super::*;
    use crate::layer::LayerStack;
    use crate::render::CpuProvider;

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            probe_timeout_ms: 50,
        }
    }

    #[test]
    fn test_select_kind_prefers_highest_tier() {
        let capability = BackendCapability {
            canvas2d: true,
            webgl: true,
            webgpu: false,
        };
        assert_eq!(select_kind(&capability), Some(BackendKind::WebGl));
        assert_eq!(select_kind(&BackendCapability::default()), None);
    }

    #[tokio::test]
    async fn test_probe_falls_back_in_order() {
        let providers: Vec<Box<dyn BackendProvider>> = vec![
            Box::new(CpuProvider),
            Box::new(MockProvider::new(BackendKind::WebGl, Behavior::Succeed)),
            Box::new(MockProvider::new(BackendKind::WebGpu, Behavior::Fail)),
        ];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        let mut stack = LayerStack::with_layer(4, 4);

        let Ok(kind) = coordinator.probe(stack.layers_mut()).await else {
            panic!("probe should find a backend");
        };
        assert_eq!(kind, BackendKind::WebGl);
        assert_eq!(coordinator.state(), CoordinatorState::Ready(BackendKind::WebGl));
        let capability = coordinator.capability();
        assert!(!capability.webgpu);
        assert!(capability.webgl);
        assert!(capability.canvas2d);
        assert_eq!(select_kind(&capability), Some(kind));
    }

    #[tokio::test]
    async fn test_hanging_provider_times_out() {
        let providers: Vec<Box<dyn BackendProvider>> = vec![
            Box::new(MockProvider::new(BackendKind::WebGpu, Behavior::Hang)),
            Box::new(CpuProvider),
        ];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        let Ok(kind) = coordinator.probe(&mut []).await else {
            panic!("probe should fall through to the cpu tier");
        };
        assert_eq!(kind, BackendKind::Canvas2d);
        assert!(!coordinator.capability().webgpu);
        assert!(!coordinator.capability().webgl);
    }

    #[tokio::test]
    async fn test_unsupported_provider_is_not_initialized() {
        let mut gpu = MockProvider::new(BackendKind::WebGpu, Behavior::Succeed);
        gpu.supported = false;
        let attempts = gpu.attempts.clone();
        let providers: Vec<Box<dyn BackendProvider>> = vec![Box::new(gpu), Box::new(CpuProvider)];
        let mut coordinator = EngineCoordinator::new(config(), providers);

        assert!(matches!(coordinator.probe(&mut []).await, Ok(BackendKind::Canvas2d)));
        assert_eq!(attempts.get(), 0);
    }

    #[tokio::test]
    async fn test_no_backend_available() {
        let providers: Vec<Box<dyn BackendProvider>> =
            vec![Box::new(MockProvider::new(BackendKind::WebGpu, Behavior::Fail))];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        assert!(matches!(
            coordinator.probe(&mut []).await,
            Err(EngineError::NoBackendAvailable)
        ));
        assert!(coordinator.backend_mut().is_err());
    }

    #[tokio::test]
    async fn test_device_loss_recovers_once_then_demotes() {
        let gpu = MockProvider::new(BackendKind::WebGpu, Behavior::Succeed);
        let lost = gpu.lost.clone();
        let attempts = gpu.attempts.clone();
        let providers: Vec<Box<dyn BackendProvider>> = vec![Box::new(gpu), Box::new(CpuProvider)];
        let mut coordinator = EngineCoordinator::new(config(), providers);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        coordinator.subscribe(Arc::new(move |event: BackendEvent| sink.lock().push(event)));

        let mut stack = LayerStack::with_layer(4, 4);
        assert!(matches!(
            coordinator.probe(stack.layers_mut()).await,
            Ok(BackendKind::WebGpu)
        ));

        // First loss: same tier comes back
        lost.raise();
        assert!(coordinator.is_device_lost());
        let Ok(kind) = coordinator.handle_device_lost(stack.layers_mut()).await else {
            panic!("recovery should succeed");
        };
        assert_eq!(kind, BackendKind::WebGpu);
        assert!(!coordinator.is_device_lost());
        assert_eq!(attempts.get(), 2);

        // Second loss: no more retries for this tier
        lost.raise();
        let Ok(kind) = coordinator.handle_device_lost(stack.layers_mut()).await else {
            panic!("fallback should succeed");
        };
        assert_eq!(kind, BackendKind::Canvas2d);
        assert_eq!(attempts.get(), 2);
        assert!(coordinator.is_demoted(BackendKind::WebGpu));
        assert!(!coordinator.capability().webgpu);

        assert_eq!(
            *events.lock(),
            vec![
                BackendEvent::Selected(BackendKind::WebGpu),
                BackendEvent::DeviceLost(BackendKind::WebGpu),
                BackendEvent::Recovered(BackendKind::WebGpu),
                BackendEvent::DeviceLost(BackendKind::WebGpu),
                BackendEvent::Demoted {
                    from: BackendKind::WebGpu,
                    to: BackendKind::Canvas2d,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_reinit_demotes_immediately() {
        let gpu = MockProvider::new(BackendKind::WebGpu, Behavior::Succeed);
        let lost = gpu.lost.clone();
        let behavior = gpu.behavior.clone();
        let providers: Vec<Box<dyn BackendProvider>> = vec![
            Box::new(gpu),
            Box::new(MockProvider::new(BackendKind::WebGl, Behavior::Fail)),
            Box::new(CpuProvider),
        ];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        assert!(matches!(coordinator.probe(&mut []).await, Ok(BackendKind::WebGpu)));

        behavior.set(Behavior::Fail);
        lost.raise();
        assert!(matches!(
            coordinator.handle_device_lost(&mut []).await,
            Ok(BackendKind::Canvas2d)
        ));
        assert!(matches!(
            coordinator.select_backend(BackendKind::WebGpu, &mut []).await,
            Err(EngineError::BackendDemoted(BackendKind::WebGpu))
        ));
    }

    #[tokio::test]
    async fn test_select_backend_moves_layers() {
        let providers: Vec<Box<dyn BackendProvider>> = vec![
            Box::new(MockProvider::new(BackendKind::WebGl, Behavior::Succeed)),
            Box::new(CpuProvider),
        ];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        let mut stack = LayerStack::with_layer(4, 4);
        assert!(matches!(
            coordinator.probe(stack.layers_mut()).await,
            Ok(BackendKind::WebGl)
        ));

        let Ok(()) = coordinator
            .select_backend(BackendKind::Canvas2d, stack.layers_mut())
            .await
        else {
            panic!("switch should succeed");
        };
        assert_eq!(coordinator.current_kind(), Some(BackendKind::Canvas2d));
        assert!(stack.layers()[0].host_pixels().is_some());
    }

    #[tokio::test]
    async fn test_layer_rejection_falls_through_to_next_tier() {
        let providers: Vec<Box<dyn BackendProvider>> = vec![
            Box::new(MockProvider::new(BackendKind::WebGpu, Behavior::FailAdopt)),
            Box::new(CpuProvider),
        ];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        let mut stack = LayerStack::with_layer(4, 4);

        let Ok(kind) = coordinator.probe(stack.layers_mut()).await else {
            panic!("probe should fall through to the cpu tier");
        };
        assert_eq!(kind, BackendKind::Canvas2d);
        assert!(!coordinator.capability().webgpu);
        assert!(stack.layers()[0].host_pixels().is_some());
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_current_backend() {
        let providers: Vec<Box<dyn BackendProvider>> = vec![
            Box::new(MockProvider::new(BackendKind::WebGl, Behavior::FailAdopt)),
            Box::new(CpuProvider),
        ];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        let mut stack = LayerStack::with_layer(4, 4);
        assert!(matches!(
            coordinator.probe(stack.layers_mut()).await,
            Ok(BackendKind::Canvas2d)
        ));

        let result = coordinator
            .select_backend(BackendKind::WebGl, stack.layers_mut())
            .await;
        assert!(matches!(result, Err(EngineError::Gpu(_))));
        assert_eq!(coordinator.current_kind(), Some(BackendKind::Canvas2d));
        assert_eq!(coordinator.state(), CoordinatorState::Ready(BackendKind::Canvas2d));
        assert!(coordinator.backend_mut().is_ok());
        assert!(stack.layers()[0].host_pixels().is_some());
    }

    #[tokio::test]
    async fn test_recovery_that_rejects_layers_demotes() {
        let gpu = MockProvider::new(BackendKind::WebGpu, Behavior::Succeed);
        let lost = gpu.lost.clone();
        let behavior = gpu.behavior.clone();
        let providers: Vec<Box<dyn BackendProvider>> = vec![Box::new(gpu), Box::new(CpuProvider)];
        let mut coordinator = EngineCoordinator::new(config(), providers);
        let mut stack = LayerStack::with_layer(4, 4);
        assert!(matches!(
            coordinator.probe(stack.layers_mut()).await,
            Ok(BackendKind::WebGpu)
        ));

        behavior.set(Behavior::FailAdopt);
        lost.raise();
        let Ok(kind) = coordinator.handle_device_lost(stack.layers_mut()).await else {
            panic!("recovery should fall back");
        };
        assert_eq!(kind, BackendKind::Canvas2d);
        assert!(coordinator.is_demoted(BackendKind::WebGpu));
        assert!(stack.layers()[0].host_pixels().is_some());
    }
}
