//! Purpose: In-process transport shared by every session that connects to the same hub name.
//! Exports: `connect`, `Endpoint`, `HubOptions`, `MemoryLink`.
//! Role: Default `Transport`; routes samples and queries by key-expression intersection.
//! Invariants: Handlers run on hub worker threads, never on the publishing/querying thread.
//! Invariants: A panicking handler is logged and does not take its worker down.
//! Invariants: Submissions made from a worker never block on that worker's own queue.
//! Invariants: Hubs live as long as at least one link; the registry only holds weak refs.
use crate::core::error::{Error, ErrorKind};
use crate::core::handler::{QueryHandler, SampleHandler};
use crate::core::keyexpr::KeyExpr;
use crate::core::query::QueryFanout;
use crate::core::sample::{CongestionControl, Sample};
use crate::core::transport::{EntityId, NetworkId, Owner, QueryRequest, Transport};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, JoinHandle};

pub const MEMORY_PROTOCOL: &str = "mem";

type Job = Box<dyn FnOnce() + Send + 'static>;

static HUBS: OnceLock<Mutex<HashMap<String, Weak<MemoryHub>>>> = OnceLock::new();

thread_local! {
    // `Some` only on worker threads; holds jobs that found the queue full.
    static OVERFLOW: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `<protocol>/<address>`, e.g. `mem/default` or `tcp/127.0.0.1:7447`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub protocol: String,
    pub address: String,
}

impl Endpoint {
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.split_once('/') {
            Some((protocol, address)) if !protocol.is_empty() && !address.is_empty() => Ok(Self {
                protocol: protocol.to_string(),
                address: address.to_string(),
            }),
            _ => Err(Error::new(ErrorKind::Connection)
                .with_message(format!("malformed endpoint '{value}'"))
                .with_hint("endpoints look like 'mem/<hub-name>'")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HubOptions {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 1024,
        }
    }
}

pub fn connect(endpoint: &str, options: HubOptions) -> Result<MemoryLink, Error> {
    let endpoint = Endpoint::parse(endpoint)?;
    if endpoint.protocol != MEMORY_PROTOCOL {
        return Err(Error::new(ErrorKind::Connection)
            .with_message(format!(
                "transport '{}' is not available in this build",
                endpoint.protocol
            ))
            .with_hint("use a 'mem/<hub-name>' endpoint"));
    }

    let registry = HUBS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut hubs = lock(registry);
    if let Some(hub) = hubs.get(&endpoint.address).and_then(Weak::upgrade) {
        tracing::debug!(hub = %endpoint.address, "joining memory hub");
        return Ok(MemoryLink::new(hub));
    }
    hubs.retain(|_, hub| hub.strong_count() > 0);
    let hub = Arc::new(MemoryHub::start(&endpoint.address, options)?);
    hubs.insert(endpoint.address.clone(), Arc::downgrade(&hub));
    tracing::debug!(hub = %endpoint.address, workers = options.workers, "started memory hub");
    Ok(MemoryLink::new(hub))
}

struct WorkerPool {
    sender: Mutex<Option<SyncSender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn start(name: &str, options: HubOptions) -> Result<Self, Error> {
        if options.workers == 0 || options.queue_depth == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("hub needs at least one worker and a non-zero queue depth"));
        }
        let (sender, receiver) = mpsc::sync_channel::<Job>(options.queue_depth);
        let receiver = Arc::new(Mutex::new(receiver));
        let pool = Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(Vec::with_capacity(options.workers)),
        };
        for index in 0..options.workers {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("keyplane-{name}-{index}"))
                .spawn(move || worker_loop(&receiver))
                .map_err(|err| {
                    Error::new(ErrorKind::Connection)
                        .with_message("failed to start transport worker")
                        .with_source(err)
                })?;
            lock(&pool.handles).push(handle);
        }
        Ok(pool)
    }

    /// `Ok(false)` means the job was dropped under `CongestionControl::Drop`.
    /// On a worker thread `Block` never waits: a full queue spills into the
    /// worker's overflow list, which it runs after the current job.
    fn submit(&self, job: Job, congestion: CongestionControl) -> Result<bool, Error> {
        let Some(sender) = lock(&self.sender).clone() else {
            return Err(shut_down());
        };
        let on_worker = OVERFLOW.with(|overflow| overflow.borrow().is_some());
        match congestion {
            CongestionControl::Block if on_worker => match sender.try_send(job) {
                Ok(()) => Ok(true),
                Err(TrySendError::Full(job)) => {
                    OVERFLOW.with(|overflow| {
                        if let Some(queue) = overflow.borrow_mut().as_mut() {
                            queue.push_back(job);
                        }
                    });
                    Ok(true)
                }
                Err(TrySendError::Disconnected(_)) => Err(shut_down()),
            },
            CongestionControl::Block => sender.send(job).map(|_| true).map_err(|_| shut_down()),
            CongestionControl::Drop => match sender.try_send(job) {
                Ok(()) => Ok(true),
                Err(TrySendError::Full(_)) => Ok(false),
                Err(TrySendError::Disconnected(_)) => Err(shut_down()),
            },
        }
    }

    fn shutdown(&self) {
        lock(&self.sender).take();
        let current = thread::current().id();
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("transport worker exited abnormally");
            }
        }
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    OVERFLOW.with(|overflow| *overflow.borrow_mut() = Some(VecDeque::new()));
    loop {
        let job = lock(receiver).recv();
        let Ok(job) = job else {
            break;
        };
        run_job(job);
        while let Some(job) =
            OVERFLOW.with(|overflow| overflow.borrow_mut().as_mut().and_then(VecDeque::pop_front))
        {
            run_job(job);
        }
    }
}

fn run_job(job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::error!("handler panicked; worker continues");
    }
}

fn shut_down() -> Error {
    Error::new(ErrorKind::Transport).with_message("transport workers are shut down")
}

struct SubscriberEntry {
    owner: Owner,
    key_expr: KeyExpr,
    handler: Arc<dyn SampleHandler>,
}

struct QueryableEntry {
    owner: Owner,
    key_expr: KeyExpr,
    handler: Arc<dyn QueryHandler>,
}

#[derive(Default)]
struct HubState {
    next_resource: NetworkId,
    resources: HashMap<NetworkId, KeyExpr>,
    next_entity: EntityId,
    subscribers: HashMap<EntityId, SubscriberEntry>,
    queryables: HashMap<EntityId, QueryableEntry>,
}

impl HubState {
    fn next_entity(&mut self) -> EntityId {
        self.next_entity += 1;
        self.next_entity
    }
}

struct MemoryHub {
    name: String,
    state: Mutex<HubState>,
    workers: WorkerPool,
}

impl MemoryHub {
    fn start(name: &str, options: HubOptions) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
            state: Mutex::new(HubState::default()),
            workers: WorkerPool::start(name, options)?,
        })
    }

    fn route_sample(&self, sample: Sample) -> Result<(), Error> {
        let targets: Vec<Arc<dyn SampleHandler>> = lock(&self.state)
            .subscribers
            .values()
            .filter(|entry| entry.owner.liveness.is_alive())
            .filter(|entry| entry.key_expr.intersects(&sample.key_expr))
            .map(|entry| entry.handler.clone())
            .collect();

        let congestion = sample.qos.congestion_control;
        let mut dropped = 0usize;
        for handler in targets {
            let sample = sample.clone();
            let queued = self
                .workers
                .submit(Box::new(move || handler.on_sample(sample)), congestion)?;
            if !queued {
                dropped += 1;
            }
        }
        if dropped > 0 {
            tracing::debug!(key_expr = %sample.key_expr, dropped, "sample dropped by congestion control");
        }
        Ok(())
    }
}

impl Drop for MemoryHub {
    fn drop(&mut self) {
        tracing::debug!(hub = %self.name, "stopping memory hub");
        self.workers.shutdown();
    }
}

/// One session's connection to a memory hub.
pub struct MemoryLink {
    hub: Mutex<Option<Arc<MemoryHub>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MemoryLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLink")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MemoryLink {
    fn new(hub: Arc<MemoryHub>) -> Self {
        Self {
            hub: Mutex::new(Some(hub)),
            closed: AtomicBool::new(false),
        }
    }

    fn hub(&self) -> Result<Arc<MemoryHub>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(link_closed());
        }
        lock(&self.hub).clone().ok_or_else(link_closed)
    }

    pub fn hub_name(&self) -> Option<String> {
        lock(&self.hub).as_ref().map(|hub| hub.name.clone())
    }
}

fn link_closed() -> Error {
    Error::new(ErrorKind::Transport).with_message("transport link is closed")
}

impl Transport for MemoryLink {
    fn declare_resource(&self, expr: &KeyExpr) -> Result<NetworkId, Error> {
        let hub = self.hub()?;
        let mut state = lock(&hub.state);
        state.next_resource += 1;
        let id = state.next_resource;
        state.resources.insert(id, expr.clone());
        Ok(id)
    }

    fn undeclare_resource(&self, id: NetworkId) -> Result<(), Error> {
        let hub = self.hub()?;
        let removed = lock(&hub.state).resources.remove(&id);
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::new(ErrorKind::UnknownId)
                .with_message("network resource is not declared")
                .with_id(id)),
        }
    }

    fn publish(&self, resource: NetworkId, mut sample: Sample) -> Result<(), Error> {
        let hub = self.hub()?;
        let declared = lock(&hub.state).resources.get(&resource).cloned();
        let Some(key_expr) = declared else {
            return Err(Error::new(ErrorKind::UnknownId)
                .with_message("network resource is not declared")
                .with_id(resource));
        };
        sample.key_expr = key_expr;
        hub.route_sample(sample)
    }

    fn publish_expr(&self, sample: Sample) -> Result<(), Error> {
        self.hub()?.route_sample(sample)
    }

    fn declare_subscriber(
        &self,
        owner: Owner,
        expr: &KeyExpr,
        handler: Arc<dyn SampleHandler>,
    ) -> Result<EntityId, Error> {
        let hub = self.hub()?;
        let mut state = lock(&hub.state);
        let id = state.next_entity();
        state.subscribers.insert(
            id,
            SubscriberEntry {
                owner,
                key_expr: expr.clone(),
                handler,
            },
        );
        Ok(id)
    }

    fn declare_queryable(
        &self,
        owner: Owner,
        expr: &KeyExpr,
        handler: Arc<dyn QueryHandler>,
    ) -> Result<EntityId, Error> {
        let hub = self.hub()?;
        let mut state = lock(&hub.state);
        let id = state.next_entity();
        state.queryables.insert(
            id,
            QueryableEntry {
                owner,
                key_expr: expr.clone(),
                handler,
            },
        );
        Ok(id)
    }

    fn undeclare_entity(&self, id: EntityId) -> Result<(), Error> {
        let hub = self.hub()?;
        let mut state = lock(&hub.state);
        let removed =
            state.subscribers.remove(&id).is_some() || state.queryables.remove(&id).is_some();
        if !removed {
            return Err(Error::new(ErrorKind::UnknownId)
                .with_message("entity is not declared")
                .with_id(id));
        }
        Ok(())
    }

    fn send_query(&self, request: QueryRequest) -> Result<(), Error> {
        let hub = self.hub()?;
        let fanout = QueryFanout::new(request);
        let targets: Vec<(Owner, Arc<dyn QueryHandler>)> = lock(&hub.state)
            .queryables
            .values()
            .filter(|entry| entry.owner.liveness.is_alive())
            .filter(|entry| entry.key_expr.intersects(fanout.key_expr()))
            .map(|entry| (entry.owner.clone(), entry.handler.clone()))
            .collect();

        tracing::debug!(key_expr = %fanout.key_expr(), queryables = targets.len(), "dispatching query");
        for (owner, handler) in targets {
            let query = fanout.query_for(owner);
            hub.workers.submit(
                Box::new(move || handler.on_query(query)),
                CongestionControl::Block,
            )?;
        }
        Ok(())
    }

    fn matching_subscribers(&self, expr: &KeyExpr) -> usize {
        let Ok(hub) = self.hub() else {
            return 0;
        };
        lock(&hub.state)
            .subscribers
            .values()
            .filter(|entry| entry.owner.liveness.is_alive() && entry.key_expr.intersects(expr))
            .count()
    }

    fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let hub = lock(&self.hub).take();
        drop(hub);
        Ok(())
    }
}
