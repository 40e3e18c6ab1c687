use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use wrn_core::{fnv1a, Result};

/// A stateful unit owned by exactly one sub-reactor for its lifetime.
///
/// `step` is the only mutator after construction; `tick` advances timers;
/// `ready` harvests an action batch which the reactor hands to the
/// processor outside the handler's critical section.
pub trait Handler: Send + 'static {
    type Action: Send + 'static;

    fn tick(&mut self);
    fn has_ready(&self) -> bool;
    fn ready(&mut self) -> Vec<Self::Action>;
    fn step(&mut self, action: Self::Action) -> Result<()>;
}

/// Executes harvested action batches. Runs on the sub-reactor thread, so
/// implementations must hand long work to pools and return quickly.
pub trait ActionProcessor<H: Handler>: Send + Sync + 'static {
    fn process(&self, key: &str, actions: Vec<H::Action>);

    /// Called when an idle handler is collected.
    fn on_remove(&self, _key: &str) {}
}

#[derive(Debug, Clone)]
pub struct ReactorOptions {
    /// Shown in thread names and log lines, e.g. `user` or `channel`.
    pub name: String,
    pub sub_count: usize,
    pub tick_interval: Duration,
    /// Bounded inbox per sub-reactor; overflow drops with a warning.
    pub inbox_capacity: usize,
    /// Ticks of inactivity before a handler is collected. Zero disables.
    pub deadline_tick: u64,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            name: "reactor".into(),
            sub_count: 16,
            tick_interval: Duration::from_millis(150),
            inbox_capacity: 4096,
            deadline_tick: 0,
        }
    }
}

enum Cmd<H: Handler> {
    Step { key: String, action: H::Action },
    Remove { key: String },
    Stop,
}

/// Sharded pool of sub-reactors. Keys route by stable hash, so a given
/// key always lands on the same single-threaded loop.
pub struct Reactor<H: Handler> {
    name: String,
    subs: Vec<flume::Sender<Cmd<H>>>,
    handles: std::sync::Mutex<Vec<thread::JoinHandle<()>>>,
}

impl<H: Handler> Reactor<H> {
    pub fn new(
        opts: ReactorOptions,
        factory: Arc<dyn Fn(&str) -> H + Send + Sync>,
        processor: Arc<dyn ActionProcessor<H>>,
    ) -> Arc<Self> {
        let sub_count = opts.sub_count.max(1);
        let mut subs = Vec::with_capacity(sub_count);
        let mut handles = Vec::with_capacity(sub_count);
        for sub_id in 0..sub_count {
            let (tx, rx) = flume::bounded(opts.inbox_capacity.max(1));
            subs.push(tx);
            let factory = Arc::clone(&factory);
            let processor = Arc::clone(&processor);
            let opts = opts.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-sub-{}", opts.name, sub_id))
                .spawn(move || run_sub(sub_id, opts, rx, factory, processor))
                .unwrap_or_else(|e| panic!("failed to spawn sub-reactor thread: {e}"));
            handles.push(handle);
        }
        Arc::new(Self {
            name: opts.name,
            subs,
            handles: std::sync::Mutex::new(handles),
        })
    }

    fn sub_for(&self, key: &str) -> &flume::Sender<Cmd<H>> {
        let idx = (fnv1a(key.as_bytes()) % self.subs.len() as u64) as usize;
        &self.subs[idx]
    }

    /// Route an action to its handler, creating the handler on demand.
    /// Returns false (dropping the action) when the shard inbox is full.
    pub fn step(&self, key: &str, action: H::Action) -> bool {
        let sent = self
            .sub_for(key)
            .try_send(Cmd::Step {
                key: key.to_string(),
                action,
            })
            .is_ok();
        if !sent {
            tracing::warn!(
                target: "wren::reactor",
                reactor = %self.name,
                key,
                "sub-reactor inbox full, dropping action"
            );
        }
        sent
    }

    /// Blocking variant for callers that must not drop (delivery path).
    pub fn step_wait(&self, key: &str, action: H::Action) {
        let _ = self.sub_for(key).send(Cmd::Step {
            key: key.to_string(),
            action,
        });
    }

    pub fn remove(&self, key: &str) {
        let _ = self.sub_for(key).try_send(Cmd::Remove {
            key: key.to_string(),
        });
    }

    /// Stop all sub-reactors and join their threads.
    pub fn stop(&self) {
        for sub in &self.subs {
            let _ = sub.send(Cmd::Stop);
        }
        let mut handles = match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        tracing::info!(target: "wren::reactor", reactor = %self.name, "reactor stopped");
    }
}

struct HandlerState<H> {
    handler: H,
    idle_ticks: u64,
}

fn run_sub<H: Handler>(
    sub_id: usize,
    opts: ReactorOptions,
    rx: flume::Receiver<Cmd<H>>,
    factory: Arc<dyn Fn(&str) -> H + Send + Sync>,
    processor: Arc<dyn ActionProcessor<H>>,
) {
    let mut handlers: HashMap<String, HandlerState<H>> = HashMap::new();
    let mut next_tick = Instant::now() + opts.tick_interval;

    loop {
        let timeout = next_tick.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(cmd) => {
                let mut touched = HashSet::new();
                if !handle_cmd(cmd, &mut handlers, &factory, &processor, &mut touched) {
                    break;
                }
                // Drain whatever else arrived in the meantime.
                let mut drained = 0;
                while drained < 256 {
                    match rx.try_recv() {
                        Ok(cmd) => {
                            if !handle_cmd(cmd, &mut handlers, &factory, &processor, &mut touched)
                            {
                                return;
                            }
                            drained += 1;
                        },
                        Err(_) => break,
                    }
                }
                harvest(&mut handlers, &processor, Some(&touched));
            },
            Err(flume::RecvTimeoutError::Timeout) => {},
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        if Instant::now() >= next_tick {
            for state in handlers.values_mut() {
                state.handler.tick();
                state.idle_ticks += 1;
            }
            harvest(&mut handlers, &processor, None);
            if opts.deadline_tick > 0 {
                collect_idle(&mut handlers, &processor, opts.deadline_tick, &opts.name);
            }
            next_tick = Instant::now() + opts.tick_interval;
        }
    }

    tracing::debug!(
        target: "wren::reactor",
        reactor = %opts.name,
        sub_id,
        "sub-reactor stopped"
    );
}

fn handle_cmd<H: Handler>(
    cmd: Cmd<H>,
    handlers: &mut HashMap<String, HandlerState<H>>,
    factory: &Arc<dyn Fn(&str) -> H + Send + Sync>,
    processor: &Arc<dyn ActionProcessor<H>>,
    touched: &mut HashSet<String>,
) -> bool {
    match cmd {
        Cmd::Step { key, action } => {
            let state = handlers.entry(key.clone()).or_insert_with(|| HandlerState {
                handler: factory(&key),
                idle_ticks: 0,
            });
            state.idle_ticks = 0;
            if let Err(e) = state.handler.step(action) {
                tracing::warn!(
                    target: "wren::reactor",
                    key = %key,
                    error = %e,
                    "handler step failed, removing handler"
                );
                handlers.remove(&key);
                processor.on_remove(&key);
                touched.remove(&key);
                return true;
            }
            touched.insert(key);
            true
        },
        Cmd::Remove { key } => {
            if handlers.remove(&key).is_some() {
                processor.on_remove(&key);
            }
            touched.remove(&key);
            true
        },
        Cmd::Stop => false,
    }
}

fn harvest<H: Handler>(
    handlers: &mut HashMap<String, HandlerState<H>>,
    processor: &Arc<dyn ActionProcessor<H>>,
    only: Option<&HashSet<String>>,
) {
    let mut batches: Vec<(String, Vec<H::Action>)> = Vec::new();
    match only {
        Some(keys) => {
            for key in keys {
                if let Some(state) = handlers.get_mut(key) {
                    if state.handler.has_ready() {
                        state.idle_ticks = 0;
                        batches.push((key.clone(), state.handler.ready()));
                    }
                }
            }
        },
        None => {
            for (key, state) in handlers.iter_mut() {
                if state.handler.has_ready() {
                    state.idle_ticks = 0;
                    batches.push((key.clone(), state.handler.ready()));
                }
            }
        },
    }
    // Dispatch outside the iteration: the processor may re-enter
    // `Reactor::step` for this shard, so no handler borrow can be live.
    for (key, actions) in batches {
        if !actions.is_empty() {
            processor.process(&key, actions);
        }
    }
}

fn collect_idle<H: Handler>(
    handlers: &mut HashMap<String, HandlerState<H>>,
    processor: &Arc<dyn ActionProcessor<H>>,
    deadline_tick: u64,
    name: &str,
) {
    let expired: Vec<String> = handlers
        .iter()
        .filter(|(_, state)| state.idle_ticks >= deadline_tick && !state.handler.has_ready())
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        handlers.remove(&key);
        processor.on_remove(&key);
        tracing::debug!(
            target: "wren::reactor",
            reactor = name,
            key = %key,
            "collected idle handler"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Echoes every stepped number back out as a ready action.
    struct EchoHandler {
        pending: Vec<u64>,
        ticks: u64,
    }

    impl Handler for EchoHandler {
        type Action = u64;

        fn tick(&mut self) {
            self.ticks += 1;
        }

        fn has_ready(&self) -> bool {
            !self.pending.is_empty()
        }

        fn ready(&mut self) -> Vec<u64> {
            std::mem::take(&mut self.pending)
        }

        fn step(&mut self, action: u64) -> Result<()> {
            self.pending.push(action);
            Ok(())
        }
    }

    struct Collector {
        seen: Mutex<Vec<(String, u64)>>,
        removed: AtomicU64,
    }

    impl ActionProcessor<EchoHandler> for Collector {
        fn process(&self, key: &str, actions: Vec<u64>) {
            let mut seen = self.seen.lock().unwrap();
            for a in actions {
                seen.push((key.to_string(), a));
            }
        }

        fn on_remove(&self, _key: &str) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn new_reactor(
        deadline_tick: u64,
    ) -> (Arc<Reactor<EchoHandler>>, Arc<Collector>) {
        let collector = Arc::new(Collector {
            seen: Mutex::new(Vec::new()),
            removed: AtomicU64::new(0),
        });
        let reactor = Reactor::new(
            ReactorOptions {
                name: "echo".into(),
                sub_count: 2,
                tick_interval: Duration::from_millis(10),
                inbox_capacity: 64,
                deadline_tick,
            },
            Arc::new(|_key: &str| EchoHandler {
                pending: Vec::new(),
                ticks: 0,
            }),
            collector.clone() as Arc<dyn ActionProcessor<EchoHandler>>,
        );
        (reactor, collector)
    }

    #[test]
    fn test_step_routes_and_dispatches() {
        let (reactor, collector) = new_reactor(0);
        assert!(reactor.step("u1", 1));
        assert!(reactor.step("u2", 2));
        assert!(reactor.step("u1", 3));

        assert!(wait_until(1000, || collector.seen.lock().unwrap().len() == 3));
        let seen = collector.seen.lock().unwrap();
        let u1: Vec<u64> = seen
            .iter()
            .filter(|(k, _)| k == "u1")
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(u1, vec![1, 3]);
        drop(seen);
        reactor.stop();
    }

    #[test]
    fn test_idle_handler_collected_and_recreated() {
        let (reactor, collector) = new_reactor(3);
        assert!(reactor.step("u1", 1));
        assert!(wait_until(1000, || collector.removed.load(Ordering::SeqCst) >= 1));

        // Late traffic re-creates the handler transparently.
        assert!(reactor.step("u1", 9));
        assert!(wait_until(1000, || {
            collector
                .seen
                .lock()
                .unwrap()
                .iter()
                .any(|(_, v)| *v == 9)
        }));
        reactor.stop();
    }

    #[test]
    fn test_explicit_remove() {
        let (reactor, collector) = new_reactor(0);
        assert!(reactor.step("u1", 1));
        assert!(wait_until(1000, || !collector.seen.lock().unwrap().is_empty()));
        reactor.remove("u1");
        assert!(wait_until(1000, || collector.removed.load(Ordering::SeqCst) == 1));
        reactor.stop();
    }
}
