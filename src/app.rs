//! Wires the long-lived tasks of each process together and owns the
//! signal-driven shutdown sequence.

use std::{
    future::Future,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::broker::{BrokerClient, QueueObserver};
use crate::config::{ControllerConfig, GateConfig};
use crate::controller::{self, Controller, FixedReplicas, NoUtilization};
use crate::gate::{Forwarder, Ingress, RateLimiter};
use crate::internal_events::{ControllerStarted, GateStarted};
use crate::router::{Router, RouterAlgorithm};
use crate::shutdown::ShutdownCoordinator;
use crate::signal::SignalTo;
use crate::store::{StateStore, StateWriter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn spawn_logged(
    name: &'static str,
    task: impl Future<Output = crate::Result<()>> + Send + 'static,
) {
    tokio::spawn(async move {
        if let Err(error) = task.await {
            error!(message = "Task failed.", task = name, %error);
        }
    });
}

/// Blocks until a shutdown signal arrives, then runs the coordinated
/// shutdown: tickers stop, servers drain, forwarders flush, all bounded by
/// the grace period. SIGQUIT skips the draining.
async fn wait_for_shutdown(coordinator: ShutdownCoordinator) {
    let signals = crate::signal::signals();
    futures::pin_mut!(signals);

    match signals.next().await {
        Some(SignalTo::Quit) => {
            info!("Shutting down immediately.");
        }
        _ => {
            info!("Shutting down.");
            coordinator
                .shutdown_all(tokio::time::Instant::now() + SHUTDOWN_GRACE)
                .await;
        }
    }
}

/// The control-plane process: queue observer, AIMD controller and router.
pub async fn run_controller(config: ControllerConfig) -> crate::Result<()> {
    let metrics_handle = crate::metrics::init()?;
    let mut coordinator = ShutdownCoordinator::default();

    spawn_logged(
        "metrics",
        crate::metrics::serve(
            config.metrics_addr,
            metrics_handle,
            coordinator.register("metrics"),
        ),
    );

    let store = Arc::new(StateStore::connect(&config.redis.connection_url()).await?);

    let controller = Arc::new(Controller::new(
        &config.services,
        config.min_rate,
        config.max_rate,
    ));
    controller::apply_batch(store.as_ref(), controller.seed_batch()).await;

    // tk survives controller restarts; only its absence backdates it.
    match store.get_tk().await? {
        Some(tk) => controller.restore_tk(tk),
        None => {
            let tk = controller.init_tk(controller::unix_now());
            store.set_tk(tk).await?;
        }
    }

    let broker = BrokerClient::new(config.broker.clone());
    let queue = broker.find_queue_with_prefix().await?;
    info!(message = "Watching workload queue.", queue = %queue);

    let (events_tx, events_rx) = mpsc::channel(16);
    let observer = QueueObserver::new(broker, queue, events_tx);
    tokio::spawn(observer.run(config.check_interval, coordinator.register("queue-observer")));

    tokio::spawn(controller::run(
        Arc::clone(&controller),
        Arc::clone(&store) as Arc<dyn StateWriter>,
        Arc::new(FixedReplicas(1)),
        Arc::new(NoUtilization),
        config.admission_rate_interval,
        events_rx,
        coordinator.register("aimd-controller"),
    ));

    let router = Arc::new(Router::new(
        Arc::clone(&controller),
        RouterAlgorithm::new(config.routing_algorithm),
        config.route_target_suffix.clone(),
        config.forward_timeout,
    ));
    spawn_logged(
        "ingress",
        router.serve(config.ingress_addr, coordinator.register("ingress")),
    );

    emit!(ControllerStarted {
        services: config.services.len(),
    });

    wait_for_shutdown(coordinator).await;
    Ok(())
}

/// The per-worker gate process: rate subscription, ingress and forwarder
/// pool around one shared limiter.
pub async fn run_gate(config: GateConfig) -> crate::Result<()> {
    let metrics_handle = crate::metrics::init()?;
    let mut coordinator = ShutdownCoordinator::default();

    spawn_logged(
        "metrics",
        crate::metrics::serve(
            config.metrics_addr,
            metrics_handle,
            coordinator.register("metrics"),
        ),
    );

    let limiter = Arc::new(RateLimiter::new(config.initial_rate, config.burst));

    let subscriber = redis::Client::open(config.redis.connection_url().as_str())?;
    tokio::spawn(crate::gate::run_rate_subscription(
        subscriber,
        config.service_name.clone(),
        Arc::clone(&limiter),
        coordinator.register("rate-subscription"),
    ));

    let depth = Arc::new(AtomicUsize::new(0));
    let (buffer_tx, buffer_rx) = mpsc::channel(config.queue_size);

    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&limiter),
        config.service_url.clone(),
        config.forward_timeout,
        Arc::clone(&depth),
    ));
    let drain_token = coordinator.register("forwarder-pool");
    let workers = config.num_workers;
    tokio::spawn(async move {
        forwarder.run(buffer_rx, workers).await;
        // Dropping the signal marks the drain as complete.
        drop(drain_token);
    });

    // The ingress owns the buffer sender: once its server drains on
    // shutdown, the sender drops and the forwarder pool runs dry.
    let ingress = Arc::new(Ingress::new(
        buffer_tx,
        Arc::clone(&depth),
        config.request_logging_enabled,
    ));
    spawn_logged(
        "ingress",
        ingress.serve(config.ingress_addr, coordinator.register("ingress")),
    );

    emit!(GateStarted {
        service: &config.service_name,
        workers: config.num_workers,
        capacity: config.queue_size,
    });

    wait_for_shutdown(coordinator).await;
    Ok(())
}
