//! The AIMD controller: recomputes raw admission rates on a periodic tick,
//! snapshots the baseline on empty-queue events, and keeps the normalized
//! routing weights published for the router and the gates.
//!
//! All mutable state lives behind one mutex owned by an explicit
//! [`Controller`] value; the tick and the empty-queue handler serialize
//! through it, and routers only take brief snapshots.

pub mod weights;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::broker::EmptyQueueEvent;
use crate::config::ServiceParams;
use crate::internal_events::{
    AdmissionRateComputed, AdmissionRatePublished, BaselineSnapshotted, StorePublishFailed,
    StoreWriteFailed,
};
use crate::shutdown::ShutdownSignal;
use crate::store::{rate_channel, ServiceFields, StateWriter};

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs_f64()
}

/// Observed replica counts for the additive term. The production source is an
/// external scraper; the default pins every service to one replica.
pub trait ReplicaSource: Send + Sync {
    fn replicas(&self, service: &str) -> u32;
}

pub struct FixedReplicas(pub u32);

impl ReplicaSource for FixedReplicas {
    fn replicas(&self, _service: &str) -> u32 {
        self.0
    }
}

/// Optional per-service CPU utilization for resource-aware normalization.
/// `None` (the default source) keeps normalization utilization-blind.
pub trait UtilizationSource: Send + Sync {
    fn utilization(&self) -> Option<HashMap<String, f64>>;
}

pub struct NoUtilization;

impl UtilizationSource for NoUtilization {
    fn utilization(&self) -> Option<HashMap<String, f64>> {
        None
    }
}

#[derive(Clone, Debug)]
pub struct ServiceState {
    pub name: String,
    pub alpha: u32,
    pub beta: f64,
    pub empty_q_weight: f64,
    pub raw_admission_rate: f64,
    pub curr_weight: f64,
    pub replicas: u32,
}

impl From<&ServiceParams> for ServiceState {
    fn from(params: &ServiceParams) -> Self {
        Self {
            name: params.name.clone(),
            alpha: params.alpha,
            beta: params.beta,
            empty_q_weight: params.initial_emptyq_weight,
            raw_admission_rate: params.initial_raw_rate,
            curr_weight: params.initial_curr_weight,
            replicas: 1,
        }
    }
}

impl ServiceState {
    fn fields(&self) -> ServiceFields {
        ServiceFields {
            raw_admission_rate: self.raw_admission_rate,
            curr_weight: self.curr_weight,
            emptyq_weight: self.empty_q_weight,
            beta: self.beta,
            alpha: self.alpha,
        }
    }

    #[cfg(test)]
    pub(crate) fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            alpha: 1,
            beta: 0.5,
            empty_q_weight: 0.0,
            raw_admission_rate: 0.0,
            curr_weight: 0.0,
            replicas: 1,
        }
    }
}

/// An immutable snapshot of the routing weights, versioned so routers can
/// cache derived structures until the weights actually change.
#[derive(Debug)]
pub struct WeightTable {
    pub version: u64,
    /// `(service name, curr_weight)` in name order.
    pub entries: Vec<(String, f64)>,
}

/// The store writes and publishes produced by one state transition. Applied
/// outside the state mutex, best effort.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub services: Vec<(String, ServiceFields)>,
    pub tk: Option<i64>,
    pub publishes: Vec<(String, String)>,
}

struct State {
    services: BTreeMap<String, ServiceState>,
    tk: i64,
    version: u64,
}

pub struct Controller {
    state: Mutex<State>,
    table: Mutex<Arc<WeightTable>>,
    min_rate: f64,
    max_rate: Option<f64>,
}

impl Controller {
    pub fn new(params: &[ServiceParams], min_rate: f64, max_rate: Option<f64>) -> Self {
        let services: BTreeMap<String, ServiceState> = params
            .iter()
            .map(|p| (p.name.clone(), ServiceState::from(p)))
            .collect();

        let table = Arc::new(WeightTable {
            version: 0,
            entries: services
                .values()
                .map(|s| (s.name.clone(), s.curr_weight))
                .collect(),
        });

        Self {
            state: Mutex::new(State {
                services,
                tk: 0,
                version: 0,
            }),
            table: Mutex::new(table),
            min_rate,
            max_rate,
        }
    }

    /// The write-through of the initial state, persisted once at startup.
    pub fn seed_batch(&self) -> WriteBatch {
        let state = self.state.lock().expect("controller state poisoned");
        WriteBatch {
            services: state
                .services
                .values()
                .map(|s| (s.name.clone(), s.fields()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn tk(&self) -> i64 {
        self.state.lock().expect("controller state poisoned").tk
    }

    /// Adopts a `tk` persisted by a previous controller run.
    pub fn restore_tk(&self, tk: i64) {
        self.state.lock().expect("controller state poisoned").tk = tk;
    }

    /// First-boot initialization: backdates `tk` by 100 ms so the first tick
    /// sees a non-zero elapsed time. Returns the value for persistence.
    pub fn init_tk(&self, now: f64) -> i64 {
        let tk = (now - 0.1).floor() as i64;
        self.restore_tk(tk);
        tk
    }

    /// The current routing-weight snapshot.
    pub fn weights(&self) -> Arc<WeightTable> {
        Arc::clone(&self.table.lock().expect("weight table poisoned"))
    }

    #[cfg(test)]
    pub(crate) fn raw_rates(&self) -> Vec<f64> {
        let state = self.state.lock().expect("controller state poisoned");
        state
            .services
            .values()
            .map(|s| s.raw_admission_rate)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn baselines(&self) -> Vec<f64> {
        let state = self.state.lock().expect("controller state poisoned");
        state.services.values().map(|s| s.empty_q_weight).collect()
    }

    /// The periodic tick: recomputes every raw admission rate from the AIMD
    /// closed form, renormalizes routing weights, and returns the writes and
    /// rate publishes to apply. `tk` is deliberately not advanced here.
    pub fn tick(
        &self,
        now: f64,
        replicas: &dyn ReplicaSource,
        utilization: Option<&HashMap<String, f64>>,
    ) -> WriteBatch {
        let mut state = self.state.lock().expect("controller state poisoned");
        let elapsed = (now - state.tk as f64).max(0.0);

        for service in state.services.values_mut() {
            service.replicas = replicas.replicas(&service.name).max(1);

            let raw = (service.beta * service.empty_q_weight
                + service.alpha as f64 * elapsed * service.replicas as f64)
                .round();
            let raw = raw.max(self.min_rate);
            service.raw_admission_rate = match self.max_rate {
                Some(max) => raw.min(max),
                None => raw,
            };
        }

        weights::normalize(&mut state.services, weights::TOTAL_WEIGHT, utilization);
        state.version += 1;
        self.refresh_table(&state);

        let mut batch = WriteBatch::default();
        for service in state.services.values() {
            emit!(AdmissionRateComputed {
                service: &service.name,
                raw: service.raw_admission_rate,
                weight: service.curr_weight,
                baseline: service.empty_q_weight,
            });
            batch
                .services
                .push((service.name.clone(), service.fields()));
            batch.publishes.push((
                rate_channel(&service.name),
                service.raw_admission_rate.to_string(),
            ));
        }
        batch
    }

    /// The empty-queue event: snapshots the current raw rate as the new AIMD
    /// baseline and advances `tk`. The next tick then applies the
    /// multiplicative decrease off the fresh baseline.
    pub fn on_queue_empty(&self, now: f64) -> WriteBatch {
        let mut state = self.state.lock().expect("controller state poisoned");

        for service in state.services.values_mut() {
            service.empty_q_weight = service.raw_admission_rate;
        }
        // tk is monotone even if observation timestamps arrive out of order.
        state.tk = state.tk.max(now.floor() as i64);

        emit!(BaselineSnapshotted { tk: state.tk });

        WriteBatch {
            services: state
                .services
                .values()
                .map(|s| (s.name.clone(), s.fields()))
                .collect(),
            tk: Some(state.tk),
            publishes: Vec::new(),
        }
    }

    fn refresh_table(&self, state: &State) {
        let table = Arc::new(WeightTable {
            version: state.version,
            entries: state
                .services
                .values()
                .map(|s| (s.name.clone(), s.curr_weight))
                .collect(),
        });
        *self.table.lock().expect("weight table poisoned") = table;
    }
}

/// Applies a write batch to the store, best effort: failures are logged and
/// the in-memory state carries the controller forward.
pub async fn apply_batch(store: &dyn StateWriter, batch: WriteBatch) {
    for (name, fields) in &batch.services {
        if let Err(error) = store.write_service(name, fields).await {
            emit!(StoreWriteFailed {
                operation: "write_service",
                error,
            });
        }
    }

    if let Some(tk) = batch.tk {
        if let Err(error) = store.set_tk(tk).await {
            emit!(StoreWriteFailed {
                operation: "set_tk",
                error,
            });
        }
    }

    for (channel, payload) in &batch.publishes {
        match store.publish(channel, payload).await {
            Ok(()) => {
                let service = channel.rsplit(':').next().unwrap_or(channel);
                let rate = payload.parse().unwrap_or(f64::NAN);
                emit!(AdmissionRatePublished { service, rate });
            }
            Err(error) => emit!(StorePublishFailed { channel, error }),
        }
    }
}

/// Drives the controller: the periodic tick and the empty-queue events both
/// funnel through here, so their state transitions never interleave.
pub async fn run(
    controller: Arc<Controller>,
    store: Arc<dyn StateWriter>,
    replicas: Arc<dyn ReplicaSource>,
    utilization: Arc<dyn UtilizationSource>,
    interval: Duration,
    mut events: mpsc::Receiver<EmptyQueueEvent>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = utilization.utilization();
                let batch = controller.tick(unix_now(), replicas.as_ref(), snapshot.as_ref());
                apply_batch(store.as_ref(), batch).await;
            }
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    let batch = controller.on_queue_empty(event.at);
                    apply_batch(store.as_ref(), batch).await;
                }
                None => {
                    debug!("Observer is gone; continuing on ticks alone.");
                    events_open = false;
                }
            },
            _ = &mut shutdown => {
                debug!("Controller stopping.");
                return;
            }
        }
    }
}
