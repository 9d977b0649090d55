use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use stockledger_core::WarehouseId;
use stockledger_events::{EventBus, Subscription, WarehouseScoped};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Generic feed worker loop.
///
/// - Subscribes to the ledger event feed
/// - Applies an idempotent handler for each message
/// - Supports graceful shutdown
/// - Optional warehouse pinning for site-local consumers
#[derive(Debug)]
pub struct FeedWorker;

impl FeedWorker {
    /// Spawn a worker thread that processes events from the feed subscription.
    ///
    /// - `warehouse_id`: when provided, events for other warehouses are ignored
    /// - `handler`: must be idempotent (at-least-once delivery safe)
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: B,
        warehouse_id: Option<WarehouseId>,
        mut handler: H,
    ) -> WorkerHandle
    where
        M: WarehouseScoped + Send + 'static,
        B: EventBus<M> + Send + Sync + 'static,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, warehouse_id, &mut handler))
            .expect("failed to spawn feed worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    warehouse_id: Option<WarehouseId>,
    handler: &mut H,
) where
    M: WarehouseScoped,
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => {
                if let Some(w) = warehouse_id {
                    if msg.warehouse_id() != w {
                        // Site-local consumer: ignore other warehouses.
                        continue;
                    }
                }

                if let Err(err) = handler(msg) {
                    warn!(worker = name, error = ?err, "feed worker handler failed");
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use stockledger_events::InMemoryEventBus;

    #[derive(Debug, Clone)]
    struct Ping {
        warehouse_id: WarehouseId,
        n: u32,
    }

    impl WarehouseScoped for Ping {
        fn warehouse_id(&self) -> WarehouseId {
            self.warehouse_id
        }
    }

    fn wait_for(seen: &Arc<Mutex<Vec<u32>>>, expected: usize) {
        for _ in 0..200 {
            if seen.lock().unwrap().len() >= expected {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!(
            "worker did not observe {} messages, saw {:?}",
            expected,
            seen.lock().unwrap()
        );
    }

    #[test]
    fn test_worker_drains_feed() {
        let bus = Arc::new(InMemoryEventBus::<Ping>::new());
        let warehouse = WarehouseId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let handle = FeedWorker::spawn("drain-test", Arc::clone(&bus), None, move |msg: Ping| {
            sink.lock().unwrap().push(msg.n);
            Ok::<(), Infallible>(())
        });

        for n in 1..=3 {
            bus.publish(Ping {
                warehouse_id: warehouse,
                n,
            })
            .unwrap();
        }

        wait_for(&seen, 3);
        handle.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_worker_pinned_to_warehouse_skips_others() {
        let bus = Arc::new(InMemoryEventBus::<Ping>::new());
        let mine = WarehouseId::new();
        let other = WarehouseId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let handle = FeedWorker::spawn(
            "pinned-test",
            Arc::clone(&bus),
            Some(mine),
            move |msg: Ping| {
                sink.lock().unwrap().push(msg.n);
                Ok::<(), Infallible>(())
            },
        );

        bus.publish(Ping {
            warehouse_id: other,
            n: 1,
        })
        .unwrap();
        bus.publish(Ping {
            warehouse_id: mine,
            n: 2,
        })
        .unwrap();
        bus.publish(Ping {
            warehouse_id: other,
            n: 3,
        })
        .unwrap();
        bus.publish(Ping {
            warehouse_id: mine,
            n: 4,
        })
        .unwrap();

        wait_for(&seen, 2);
        handle.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![2, 4]);
    }

    #[test]
    fn test_worker_keeps_running_after_handler_error() {
        let bus = Arc::new(InMemoryEventBus::<Ping>::new());
        let warehouse = WarehouseId::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let handle = FeedWorker::spawn("error-test", Arc::clone(&bus), None, move |msg: Ping| {
            if msg.n == 1 {
                return Err("boom");
            }
            sink.lock().unwrap().push(msg.n);
            Ok(())
        });

        bus.publish(Ping {
            warehouse_id: warehouse,
            n: 1,
        })
        .unwrap();
        bus.publish(Ping {
            warehouse_id: warehouse,
            n: 2,
        })
        .unwrap();

        wait_for(&seen, 1);
        handle.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }

    #[test]
    fn test_shutdown_joins_worker_thread() {
        let bus = Arc::new(InMemoryEventBus::<Ping>::new());
        let handle = FeedWorker::spawn("shutdown-test", bus, None, |_msg: Ping| {
            Ok::<(), Infallible>(())
        });

        // Returns only after the worker thread exits.
        handle.shutdown();
    }
}
