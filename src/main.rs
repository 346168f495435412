use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use core_affinity::CoreId;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatehouse::backend::{AlwaysHealthy, HealthMonitor, LoadBalancer};
use gatehouse::config::GatewayConfig;
use gatehouse::core::socket::make_reuseport_listener;
use gatehouse::worker::{EventLoop, GatewayHandler, LoopConfig};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    for sig in [libc::SIGINT, libc::SIGTERM] {
        let prev = unsafe { libc::signal(sig, on_signal as *const () as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error()).context("installing signal handler");
        }
    }
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

fn spawn_worker(
    id: usize,
    core: Option<CoreId>,
    listen: SocketAddr,
    config: LoopConfig,
    lb: Arc<LoadBalancer>,
    shutdown: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    let listener = make_reuseport_listener(listen)
        .with_context(|| format!("binding worker {id} listener on {listen}"))?;

    let handle = thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || {
            if let Some(core) = core {
                if core_affinity::set_for_current(core) {
                    info!(worker = id, core = core.id, "pinned to core");
                } else {
                    warn!(worker = id, core = core.id, "could not pin to core");
                }
            }

            let handler = GatewayHandler::new(lb, id);
            let mut event_loop = match EventLoop::new(id, config, handler, shutdown) {
                Ok(l) => l,
                Err(e) => {
                    error!(worker = id, error = %e, "event loop setup failed");
                    return;
                }
            };
            if let Err(e) = event_loop.attach_listener(listener) {
                error!(worker = id, error = %e, "listener registration failed");
                return;
            }
            if let Err(e) = event_loop.run() {
                error!(worker = id, error = %e, "event loop failed");
            }
            let stats = event_loop.stats();
            info!(
                worker = id,
                served = event_loop.handler().served,
                elevated = stats.elevated_tasks,
                normal = stats.normal_tasks,
                "worker exited"
            );
        })
        .context("spawning worker thread")?;
    Ok(handle)
}

fn main() -> Result<()> {
    init_logging();

    let config = GatewayConfig::from_args_env(std::env::args().skip(1))
        .context("loading gateway configuration")?;
    let listen = config.listen_addr()?;

    let lb = Arc::new(LoadBalancer::new(config.policy, config.warmup_grace()));
    for descriptor in config.backend_descriptors()? {
        lb.add_backend(descriptor);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers()?;

    let monitor = HealthMonitor::new(Arc::clone(&lb), Arc::new(AlwaysHealthy))
        .spawn(config.health_interval(), Arc::clone(&shutdown))
        .context("spawning health monitor")?;

    let cores: Vec<CoreId> = core_affinity::get_core_ids().unwrap_or_default();
    let workers = match config.workers {
        0 => thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(cores.len().max(1)),
        n => n,
    };

    info!(
        %listen,
        workers,
        strategy = %config.poll_strategy,
        policy = %config.policy,
        backends = lb.backend_count(),
        "starting gatehouse"
    );

    let mut handles = Vec::with_capacity(workers);
    for id in 0..workers {
        let core = cores.get(id % cores.len().max(1)).copied();
        handles.push(spawn_worker(
            id,
            core,
            listen,
            config.loop_config(),
            Arc::clone(&lb),
            Arc::clone(&shutdown),
        )?);
    }

    while !SIGNALLED.load(Ordering::SeqCst) && !handles.iter().all(|h| h.is_finished()) {
        thread::sleep(Duration::from_millis(100));
    }
    info!("shutdown requested, waiting for workers");
    shutdown.store(true, Ordering::Release);

    for h in handles {
        if h.join().is_err() {
            error!("worker thread panicked");
        }
    }
    if monitor.join().is_err() {
        error!("health monitor panicked");
    }
    info!(live = lb.total_live_connections(), "gatehouse stopped");
    Ok(())
}
