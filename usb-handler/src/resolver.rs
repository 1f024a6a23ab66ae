//! Candidate resolution.
//!
//! A single worker task owns the resolution session and drains one ordered
//! queue. Attach and detach requests, accessory-switch results, service binds,
//! verification answers and timers all arrive as [`Message`]s, so session
//! state is never touched from two places at once.
//!
//! Collaborator calls run as spawned tasks that post their result back tagged
//! with the step token current when they started. Any message carrying an
//! older token belongs to abandoned work and is ignored.

use crate::component::ComponentName;
use crate::config::TimingConfig;
use crate::declaration::CapabilityDeclaration;
use crate::device::UsbDevice;
use crate::filter::{AoapIdentityFilter, DeviceFilter};
use crate::platform::{
    AoapSupportCheck, AoapSwitchOutcome, HandlerDeclaration, Platform, PlatformError,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Resolution cancelled: device detached")]
    Cancelled,
    #[error("Resolution already in progress for device {0:?}")]
    AlreadyInProgress(String),
    #[error("Accessory mode switch failed for device {0:?}")]
    AoapSwitchFailed(String),
    #[error("Resolver worker has stopped")]
    WorkerStopped,
}

/// What the worker is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    Probing,
    ProbingAoap,
    Dispatching,
}

/// The declaration entry that made a handler a candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchedFilter {
    Device(DeviceFilter),
    Aoap(AoapIdentityFilter),
}

/// A handler able to take the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub handler: ComponentName,
    pub filter: MatchedFilter,
    /// The handler expects the device in accessory mode
    pub requires_aoap: bool,
}

/// A declaration that can only be confirmed by probing in accessory mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AoapCandidate {
    pub handler: ComponentName,
    pub filter: AoapIdentityFilter,
}

/// Split declarations into direct matches and accessory probes, both in
/// discovery order.
pub fn enumerate_candidates(
    declarations: &[HandlerDeclaration],
    device: &UsbDevice,
) -> (Vec<Candidate>, VecDeque<AoapCandidate>) {
    let mut matches = Vec::new();
    let mut probes = VecDeque::new();

    for declaration in declarations {
        let Some(metadata) = declaration.metadata.as_deref() else {
            warn!("No capability metadata for {}", declaration.component);
            continue;
        };
        let capabilities = CapabilityDeclaration::parse(metadata);

        if let Some(filter) = capabilities.first_match(device) {
            matches.push(Candidate {
                handler: declaration.component.clone(),
                filter: MatchedFilter::Device(filter.clone()),
                requires_aoap: filter.is_aoap(),
            });
        }
        if let Some(accessory) = capabilities.accessory() {
            probes.push_back(AoapCandidate {
                handler: declaration.component.clone(),
                filter: accessory.clone(),
            });
        }
    }

    (matches, probes)
}

/// Resolver timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    pub bind_timeout: Duration,
    pub rpc_timeout: Duration,
    pub probe_settle: Duration,
    pub reschedule_delay: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for ResolverConfig {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            bind_timeout: timing.bind_timeout(),
            rpc_timeout: timing.rpc_timeout(),
            probe_settle: timing.probe_settle(),
            reschedule_delay: timing.reschedule_delay(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ResolveError>>;

enum Message {
    Attach {
        device: UsbDevice,
        reply: Reply<Vec<Candidate>>,
    },
    Detach {
        device: UsbDevice,
    },
    AoapComplete {
        token: u64,
        outcome: AoapSwitchOutcome,
    },
    ResetComplete {
        token: u64,
        device: Option<UsbDevice>,
    },
    ServiceConnected {
        token: u64,
        result: Result<Arc<dyn AoapSupportCheck>, PlatformError>,
    },
    SupportChecked {
        token: u64,
        supported: bool,
    },
    BindTimeout {
        token: u64,
    },
    ProbeSettle {
        token: u64,
    },
    DispatchAoap {
        device: UsbDevice,
        filter: AoapIdentityFilter,
        reply: Reply<UsbDevice>,
    },
    DispatchComplete {
        serial: String,
    },
    RetryWaiting,
    Shutdown,
}

/// Handle to the resolver worker. Cheap to clone; every clone feeds the same
/// queue.
#[derive(Clone)]
pub struct CandidateResolver {
    tx: mpsc::UnboundedSender<Message>,
    mode: watch::Receiver<Mode>,
}

impl CandidateResolver {
    /// Start the worker on the current tokio runtime. It runs until
    /// [`shutdown`](Self::shutdown) or until every handle is dropped.
    pub fn spawn(platform: Platform, config: ResolverConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(Mode::Idle);

        let worker = Worker {
            platform,
            config,
            tx: tx.downgrade(),
            mode: mode_tx,
            activity: None,
            token: 0,
            in_flight: Vec::new(),
            waiting: VecDeque::new(),
            retry: None,
        };
        tokio::spawn(worker.run(rx));

        Self { tx, mode: mode_rx }
    }

    /// Resolve the handlers able to take `device`, in discovery order.
    ///
    /// Waits, in arrival order, behind requests for other devices. Fails
    /// with `Cancelled` if the device detaches first.
    pub async fn resolve(&self, device: UsbDevice) -> Result<Vec<Candidate>, ResolveError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::Attach { device, reply })?;
        rx.await.unwrap_or(Err(ResolveError::Cancelled))
    }

    pub fn device_detached(&self, device: &UsbDevice) {
        // A stopped worker has nothing left to cancel
        let _ = self.send(Message::Detach {
            device: device.clone(),
        });
    }

    /// Switch `device` into accessory mode for dispatch using `filter`'s
    /// identity strings. Returns the re-enumerated device.
    ///
    /// Interrupts an ongoing resolution of the same device; its caller
    /// receives the candidates confirmed so far. The worker stays in
    /// `Dispatching` until [`complete_dispatch`](Self::complete_dispatch).
    pub async fn switch_for_dispatch(
        &self,
        device: UsbDevice,
        filter: AoapIdentityFilter,
    ) -> Result<UsbDevice, ResolveError> {
        let (reply, rx) = oneshot::channel();
        self.send(Message::DispatchAoap {
            device,
            filter,
            reply,
        })?;
        rx.await.unwrap_or(Err(ResolveError::Cancelled))
    }

    /// Release the worker after a dispatch-time switch
    pub fn complete_dispatch(&self, device: &UsbDevice) {
        let _ = self.send(Message::DispatchComplete {
            serial: device.serial_key().to_string(),
        });
    }

    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    /// Subscribe to mode changes
    pub fn watch_mode(&self) -> watch::Receiver<Mode> {
        self.mode.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.send(Message::Shutdown);
    }

    fn send(&self, message: Message) -> Result<(), ResolveError> {
        self.tx
            .send(message)
            .map_err(|_| ResolveError::WorkerStopped)
    }
}

enum Activity {
    Resolving(ResolutionSession),
    Dispatching(DispatchSession),
}

impl Activity {
    fn serial(&self) -> &str {
        match self {
            Activity::Resolving(session) => &session.serial,
            Activity::Dispatching(dispatch) => &dispatch.serial,
        }
    }
}

struct ResolutionSession {
    /// Serial of the device as attached; stable across mode switches
    serial: String,
    /// Latest descriptor; replaced on every re-enumeration
    device: UsbDevice,
    pending: VecDeque<AoapCandidate>,
    confirmed: Vec<Candidate>,
    stage: Stage,
    reply: Reply<Vec<Candidate>>,
}

enum Stage {
    Matching,
    Switching(AoapCandidate),
    Binding {
        candidate: AoapCandidate,
        service: ComponentName,
    },
    Querying {
        candidate: AoapCandidate,
        service: ComponentName,
    },
    Resetting,
    Settling,
}

impl Stage {
    /// Service holding (or about to hold) a binding
    fn bound_service(&self) -> Option<&ComponentName> {
        match self {
            Stage::Binding { service, .. } | Stage::Querying { service, .. } => Some(service),
            _ => None,
        }
    }
}

/// A request that arrived while the worker was busy with another device
enum Waiting {
    Resolve {
        device: UsbDevice,
        reply: Reply<Vec<Candidate>>,
    },
    Dispatch {
        device: UsbDevice,
        filter: AoapIdentityFilter,
        reply: Reply<UsbDevice>,
    },
}

impl Waiting {
    fn device(&self) -> &UsbDevice {
        match self {
            Waiting::Resolve { device, .. } | Waiting::Dispatch { device, .. } => device,
        }
    }

    fn is_abandoned(&self) -> bool {
        match self {
            Waiting::Resolve { reply, .. } => reply.is_closed(),
            Waiting::Dispatch { reply, .. } => reply.is_closed(),
        }
    }
}

struct DispatchSession {
    serial: String,
    /// Present until the switch result has been delivered
    reply: Option<Reply<UsbDevice>>,
}

struct Worker {
    platform: Platform,
    config: ResolverConfig,
    tx: mpsc::WeakUnboundedSender<Message>,
    mode: watch::Sender<Mode>,
    activity: Option<Activity>,
    token: u64,
    in_flight: Vec<JoinHandle<()>>,
    /// Requests served strictly in arrival order once the worker frees up
    waiting: VecDeque<Waiting>,
    retry: Option<JoinHandle<()>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        info!("Resolver worker started");

        while let Some(message) = rx.recv().await {
            if !self.handle(message) {
                break;
            }
        }

        drop(self.cancel_activity());
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        self.waiting.clear();
        info!("Resolver worker stopped");
    }

    fn handle(&mut self, message: Message) -> bool {
        match message {
            Message::Attach { device, reply } => self.on_attach(device, reply),
            Message::Detach { device } => self.on_detach(&device),
            Message::AoapComplete { token, outcome } => {
                if self.is_current(token) {
                    self.on_aoap_complete(outcome);
                }
            }
            Message::ResetComplete { token, device } => {
                if self.is_current(token) {
                    self.on_reset_complete(device);
                }
            }
            Message::ServiceConnected { token, result } => {
                if self.is_current(token) {
                    self.on_service_connected(result);
                }
            }
            Message::SupportChecked { token, supported } => {
                if self.is_current(token) {
                    self.on_support_checked(supported);
                }
            }
            Message::BindTimeout { token } => {
                if self.is_current(token) {
                    self.on_bind_timeout();
                }
            }
            Message::ProbeSettle { token } => {
                if self.is_current(token) {
                    self.on_probe_settle();
                }
            }
            Message::DispatchAoap {
                device,
                filter,
                reply,
            } => self.on_dispatch_aoap(device, filter, reply),
            Message::DispatchComplete { serial } => self.on_dispatch_complete(&serial),
            Message::RetryWaiting => self.on_retry_waiting(),
            Message::Shutdown => return false,
        }
        true
    }

    fn on_attach(&mut self, device: UsbDevice, reply: Reply<Vec<Candidate>>) {
        if reply.is_closed() {
            debug!("Dropping resolve request for {}: caller went away", device.identity());
            return;
        }

        let serial = device.serial_key().to_string();
        match self.occupancy(&serial) {
            Occupancy::Free if self.waiting.is_empty() => self.start_resolution(device, reply),
            Occupancy::Resolving => {
                debug!("Resolution already running for {}", device.identity());
                let _ = reply.send(Err(ResolveError::AlreadyInProgress(serial)));
            }
            _ => {
                debug!(
                    "Worker busy, queueing {} behind {} waiting request(s)",
                    device.identity(),
                    self.waiting.len()
                );
                self.enqueue(Waiting::Resolve { device, reply });
            }
        }
    }

    fn on_detach(&mut self, device: &UsbDevice) {
        let serial = device.serial_key();

        let queued = self.waiting.len();
        // Dropping a queued request drops its reply unanswered
        self.waiting.retain(|w| w.device().serial_key() != serial);
        if self.waiting.len() < queued {
            debug!("Dropped queued request(s) for detached {}", device.identity());
        }

        match self.occupancy(serial) {
            Occupancy::Resolving | Occupancy::Dispatching => {
                info!("{} detached, abandoning in-flight work", device.identity());
                // Dropping the session drops its reply unanswered
                drop(self.cancel_activity());
            }
            _ => trace!("Ignoring detach of inactive device {}", device.identity()),
        }
    }

    fn start_resolution(&mut self, device: UsbDevice, reply: Reply<Vec<Candidate>>) {
        info!("Resolving handlers for {}", device.identity());
        self.set_mode(Mode::Probing);

        let declarations = self.platform.packages.query_handlers();
        let (confirmed, mut pending) = enumerate_candidates(&declarations, &device);
        debug!(
            "{} direct match(es), {} accessory candidate(s) for {}",
            confirmed.len(),
            pending.len(),
            device.identity()
        );

        if device.is_in_aoap_mode() && !pending.is_empty() {
            debug!("{} already in accessory mode, skipping probes", device.identity());
            pending.clear();
        }

        let session = ResolutionSession {
            serial: device.serial_key().to_string(),
            device,
            pending,
            confirmed,
            stage: Stage::Matching,
            reply,
        };

        if session.pending.is_empty() {
            self.settle(session);
        } else {
            self.set_mode(Mode::ProbingAoap);
            self.probe_next(session);
        }
    }

    fn probe_next(&mut self, mut session: ResolutionSession) {
        let Some(candidate) = session.pending.pop_front() else {
            self.settle(session);
            return;
        };

        debug!(
            "Probing {} for accessory handler {}",
            session.serial, candidate.handler
        );
        let token = self.next_token();
        let negotiator = self.platform.negotiator.clone();
        let request = candidate.filter.switch_request(&session.device);
        self.spawn_step(async move {
            Message::AoapComplete {
                token,
                outcome: negotiator.start_aoap(request).await,
            }
        });

        session.stage = Stage::Switching(candidate);
        self.activity = Some(Activity::Resolving(session));
    }

    fn on_aoap_complete(&mut self, outcome: AoapSwitchOutcome) {
        match self.activity.take() {
            Some(Activity::Resolving(session)) => self.on_probe_switched(session, outcome),
            Some(Activity::Dispatching(dispatch)) => self.on_dispatch_switched(dispatch, outcome),
            None => {}
        }
    }

    fn on_probe_switched(&mut self, mut session: ResolutionSession, outcome: AoapSwitchOutcome) {
        let candidate = match std::mem::replace(&mut session.stage, Stage::Matching) {
            Stage::Switching(candidate) => candidate,
            other => return self.restore(session, other),
        };

        match outcome {
            AoapSwitchOutcome::Switched(device) => {
                debug!("{} re-enumerated in accessory mode", session.serial);
                session.device = device;
                match candidate.filter.service_component() {
                    Some(service) => self.bind_service(session, candidate, service),
                    None => {
                        warn!(
                            "Accessory handler {} declares no verification service",
                            candidate.handler
                        );
                        self.reset_device(session);
                    }
                }
            }
            AoapSwitchOutcome::Failed | AoapSwitchOutcome::NotAttempted => {
                debug!(
                    "Accessory switch for {} unavailable ({:?}), skipping {}",
                    session.serial, outcome, candidate.handler
                );
                self.probe_next(session);
            }
        }
    }

    fn bind_service(
        &mut self,
        mut session: ResolutionSession,
        candidate: AoapCandidate,
        service: ComponentName,
    ) {
        debug!("Binding verification service {}", service);
        let token = self.next_token();

        let services = self.platform.services.clone();
        let target = service.clone();
        self.spawn_step(async move {
            Message::ServiceConnected {
                token,
                result: services.bind(&target).await,
            }
        });

        let timeout = self.config.bind_timeout;
        self.spawn_step(async move {
            tokio::time::sleep(timeout).await;
            Message::BindTimeout { token }
        });

        session.stage = Stage::Binding { candidate, service };
        self.activity = Some(Activity::Resolving(session));
    }

    fn on_service_connected(&mut self, result: Result<Arc<dyn AoapSupportCheck>, PlatformError>) {
        let Some(mut session) = self.take_session() else {
            return;
        };
        let (candidate, service) = match std::mem::replace(&mut session.stage, Stage::Matching) {
            Stage::Binding { candidate, service } => (candidate, service),
            other => return self.restore(session, other),
        };

        // Stops the bind timer
        self.abort_in_flight();

        match result {
            Ok(check) => self.query_support(session, candidate, service, check),
            Err(e) => {
                warn!("Could not bind {}: {}", service, e);
                self.reset_device(session);
            }
        }
    }

    fn query_support(
        &mut self,
        mut session: ResolutionSession,
        candidate: AoapCandidate,
        service: ComponentName,
        check: Arc<dyn AoapSupportCheck>,
    ) {
        let token = self.next_token();
        let device = session.device.clone();
        let rpc_timeout = self.config.rpc_timeout;
        self.spawn_step(async move {
            let supported =
                match tokio::time::timeout(rpc_timeout, check.is_device_supported(&device)).await {
                    Ok(Ok(supported)) => supported,
                    Ok(Err(e)) => {
                        warn!("Verification call failed: {}", e);
                        false
                    }
                    Err(_) => {
                        warn!("Verification call timed out after {:?}", rpc_timeout);
                        false
                    }
                };
            Message::SupportChecked { token, supported }
        });

        session.stage = Stage::Querying { candidate, service };
        self.activity = Some(Activity::Resolving(session));
    }

    fn on_support_checked(&mut self, supported: bool) {
        let Some(mut session) = self.take_session() else {
            return;
        };
        let (candidate, service) = match std::mem::replace(&mut session.stage, Stage::Matching) {
            Stage::Querying { candidate, service } => (candidate, service),
            other => return self.restore(session, other),
        };

        if supported {
            info!("{} supports {} in accessory mode", candidate.handler, session.serial);
            session.confirmed.push(Candidate {
                handler: candidate.handler,
                filter: MatchedFilter::Aoap(candidate.filter),
                requires_aoap: true,
            });
        } else {
            debug!("{} rejected {}", candidate.handler, session.serial);
        }

        self.platform.services.unbind(&service);
        self.reset_device(session);
    }

    fn on_bind_timeout(&mut self) {
        let Some(mut session) = self.take_session() else {
            return;
        };
        let (candidate, service) = match std::mem::replace(&mut session.stage, Stage::Matching) {
            Stage::Binding { candidate, service } => (candidate, service),
            other => return self.restore(session, other),
        };

        warn!(
            "Timed out binding {} for {} after {:?}",
            service, candidate.handler, self.config.bind_timeout
        );
        self.abort_in_flight();
        self.platform.services.unbind(&service);
        self.reset_device(session);
    }

    fn reset_device(&mut self, mut session: ResolutionSession) {
        let token = self.next_token();
        let negotiator = self.platform.negotiator.clone();
        let device = session.device.clone();
        self.spawn_step(async move {
            Message::ResetComplete {
                token,
                device: negotiator.reset_device(&device).await,
            }
        });

        session.stage = Stage::Resetting;
        self.activity = Some(Activity::Resolving(session));
    }

    fn on_reset_complete(&mut self, device: Option<UsbDevice>) {
        let Some(mut session) = self.take_session() else {
            return;
        };
        if !matches!(session.stage, Stage::Resetting) {
            self.activity = Some(Activity::Resolving(session));
            return;
        }

        match device {
            Some(device) => {
                session.device = device;
                self.probe_next(session);
            }
            None => {
                warn!(
                    "{} did not come back after reset, abandoning resolution",
                    session.serial
                );
                self.set_mode(Mode::Idle);
            }
        }
    }

    fn settle(&mut self, mut session: ResolutionSession) {
        let token = self.next_token();
        let delay = self.config.probe_settle;
        self.spawn_step(async move {
            tokio::time::sleep(delay).await;
            Message::ProbeSettle { token }
        });

        session.stage = Stage::Settling;
        self.activity = Some(Activity::Resolving(session));
    }

    fn on_probe_settle(&mut self) {
        let Some(session) = self.take_session() else {
            return;
        };
        if !matches!(session.stage, Stage::Settling) {
            self.activity = Some(Activity::Resolving(session));
            return;
        }
        self.report(session);
    }

    fn report(&mut self, session: ResolutionSession) {
        info!(
            "Resolved {} candidate(s) for {}",
            session.confirmed.len(),
            session.serial
        );
        self.set_mode(Mode::Idle);
        if session.reply.send(Ok(session.confirmed)).is_err() {
            debug!("Resolution caller for {} went away", session.serial);
        }
    }

    fn on_dispatch_aoap(
        &mut self,
        device: UsbDevice,
        filter: AoapIdentityFilter,
        reply: Reply<UsbDevice>,
    ) {
        if reply.is_closed() {
            return;
        }

        let serial = device.serial_key().to_string();
        match self.occupancy(&serial) {
            Occupancy::Free if self.waiting.is_empty() => {
                self.start_dispatch(device, filter, reply)
            }
            Occupancy::Resolving => self.interrupt_for_dispatch(device, filter, reply),
            _ => {
                debug!("Worker busy, queueing dispatch of {}", serial);
                self.enqueue(Waiting::Dispatch {
                    device,
                    filter,
                    reply,
                });
            }
        }
    }

    /// Stop the resolution of `device`, report what it confirmed so far and
    /// switch for dispatch instead
    fn interrupt_for_dispatch(
        &mut self,
        device: UsbDevice,
        filter: AoapIdentityFilter,
        reply: Reply<UsbDevice>,
    ) {
        info!("Dispatch requested for {} during resolution", device.identity());
        if let Some(Activity::Resolving(session)) = self.cancel_activity() {
            self.report(session);
        }
        self.start_dispatch(device, filter, reply);
    }

    fn start_dispatch(
        &mut self,
        device: UsbDevice,
        filter: AoapIdentityFilter,
        reply: Reply<UsbDevice>,
    ) {
        info!("Switching {} to accessory mode for dispatch", device.identity());
        self.set_mode(Mode::Dispatching);

        let token = self.next_token();
        let negotiator = self.platform.negotiator.clone();
        let request = filter.switch_request(&device);
        self.spawn_step(async move {
            Message::AoapComplete {
                token,
                outcome: negotiator.start_aoap(request).await,
            }
        });

        self.activity = Some(Activity::Dispatching(DispatchSession {
            serial: device.serial_key().to_string(),
            reply: Some(reply),
        }));
    }

    fn on_dispatch_switched(&mut self, mut dispatch: DispatchSession, outcome: AoapSwitchOutcome) {
        let Some(reply) = dispatch.reply.take() else {
            self.activity = Some(Activity::Dispatching(dispatch));
            return;
        };

        match outcome {
            AoapSwitchOutcome::Switched(device) => {
                if reply.send(Ok(device)).is_ok() {
                    self.activity = Some(Activity::Dispatching(dispatch));
                } else {
                    debug!("Dispatch caller for {} went away", dispatch.serial);
                    self.set_mode(Mode::Idle);
                }
            }
            AoapSwitchOutcome::Failed | AoapSwitchOutcome::NotAttempted => {
                warn!("Accessory switch for dispatch of {} failed", dispatch.serial);
                self.set_mode(Mode::Idle);
                let _ = reply.send(Err(ResolveError::AoapSwitchFailed(dispatch.serial)));
            }
        }
    }

    fn on_dispatch_complete(&mut self, serial: &str) {
        if matches!(self.occupancy(serial), Occupancy::Dispatching) {
            debug!("Dispatch of {} complete", serial);
            self.activity = None;
            self.set_mode(Mode::Idle);
        } else {
            trace!("No dispatch in progress for {}", serial);
        }
    }

    fn occupancy(&self, serial: &str) -> Occupancy {
        match &self.activity {
            None => Occupancy::Free,
            Some(activity) if activity.serial() != serial => Occupancy::Other,
            Some(Activity::Resolving(_)) => Occupancy::Resolving,
            Some(Activity::Dispatching(_)) => Occupancy::Dispatching,
        }
    }

    fn take_session(&mut self) -> Option<ResolutionSession> {
        match self.activity.take() {
            Some(Activity::Resolving(session)) => Some(session),
            other => {
                self.activity = other;
                None
            }
        }
    }

    fn restore(&mut self, mut session: ResolutionSession, stage: Stage) {
        session.stage = stage;
        self.activity = Some(Activity::Resolving(session));
    }

    /// Abandon whatever is running and return to idle. The caller decides
    /// whether the returned activity is reported or dropped.
    fn cancel_activity(&mut self) -> Option<Activity> {
        self.abort_in_flight();
        self.next_token();

        let activity = self.activity.take();
        if let Some(Activity::Resolving(session)) = &activity {
            if let Some(service) = session.stage.bound_service() {
                self.platform.services.unbind(service);
            }
        }
        self.set_mode(Mode::Idle);
        activity
    }

    fn is_current(&self, token: u64) -> bool {
        if token != self.token {
            trace!("Ignoring stale message for step {} (current {})", token, self.token);
            return false;
        }
        true
    }

    fn next_token(&mut self) -> u64 {
        self.token = self.token.wrapping_add(1);
        self.token
    }

    fn set_mode(&mut self, mode: Mode) {
        if mode == Mode::Idle {
            // Nothing running is needed once the worker is idle
            self.abort_in_flight();
        }
        let previous = self.mode.send_replace(mode);
        if previous != mode {
            debug!("Resolver mode {:?} -> {:?}", previous, mode);
        }
    }

    fn spawn_step<F>(&mut self, step: F)
    where
        F: Future<Output = Message> + Send + 'static,
    {
        self.in_flight.retain(|handle| !handle.is_finished());

        let tx = self.tx.clone();
        self.in_flight.push(tokio::spawn(async move {
            let message = step.await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(message);
            }
        }));
    }

    fn abort_in_flight(&mut self) {
        for handle in self.in_flight.drain(..) {
            handle.abort();
        }
    }

    fn enqueue(&mut self, request: Waiting) {
        self.waiting.push_back(request);
        if self.retry.is_none() {
            self.arm_retry();
        }
    }

    fn arm_retry(&mut self) {
        let tx = self.tx.clone();
        let delay = self.config.reschedule_delay;
        self.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::RetryWaiting);
            }
        }));
    }

    /// Start queued requests from the head while the worker can take them.
    /// Later requests never overtake the head.
    fn on_retry_waiting(&mut self) {
        self.retry = None;

        while let Some(head) = self.waiting.front() {
            if head.is_abandoned() {
                debug!(
                    "Dropping queued request for {}: caller went away",
                    head.device().identity()
                );
                self.waiting.pop_front();
                continue;
            }
            let occupancy = self.occupancy(head.device().serial_key());
            let ready = match (head, occupancy) {
                (_, Occupancy::Free) => true,
                (Waiting::Dispatch { .. }, Occupancy::Resolving) => true,
                _ => false,
            };
            if !ready {
                break;
            }

            match self.waiting.pop_front() {
                Some(Waiting::Resolve { device, reply }) => self.start_resolution(device, reply),
                Some(Waiting::Dispatch {
                    device,
                    filter,
                    reply,
                }) => match occupancy {
                    Occupancy::Resolving => self.interrupt_for_dispatch(device, filter, reply),
                    _ => self.start_dispatch(device, filter, reply),
                },
                None => break,
            }
        }

        if !self.waiting.is_empty() {
            trace!("{} request(s) still waiting", self.waiting.len());
            self.arm_retry();
        }
    }
}

#[derive(Clone, Copy)]
enum Occupancy {
    Free,
    Resolving,
    Dispatching,
    Other,
}
