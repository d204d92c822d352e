//! Reproduces the reference bounded-buffer scenario: producers at ids 0 and
//! 2, consumers at ids 1, 3 and 4, all sharing one bounded list over the
//! distributed monitor's public API alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use distributed_monitor::{Config, InProcessBus, Monitor, Transport};

const GROUP_SIZE: usize = 5;
const PRODUCERS: [usize; 2] = [0, 2];
const CONSUMERS: [usize; 3] = [1, 3, 4];

#[derive(Parser, Debug)]
struct Args {
    /// Number of items each producer pushes.
    #[arg(long, env = "ITEMS_PER_PRODUCER", default_value_t = 20)]
    items_per_producer: usize,

    /// Capacity of the shared bounded buffer.
    #[arg(long, env = "BUFFER_CAPACITY", default_value_t = 5)]
    capacity: usize,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let bus: Arc<dyn Transport> = Arc::new(InProcessBus::connect("bounded-buffer-demo"));

    let monitors: Vec<Arc<Monitor<Vec<i32>>>> = (0..GROUP_SIZE)
        .map(|id| {
            let config = Config::new(GROUP_SIZE, id, "bounded-buffer-demo");
            Monitor::spawn(config, bus.clone(), Vec::new()).expect("valid monitor configuration")
        })
        .collect();

    let stop = Arc::new(AtomicBool::new(false));

    let producer_handles: Vec<_> = PRODUCERS
        .iter()
        .map(|&id| {
            let monitor = monitors[id].clone();
            let items = args.items_per_producer;
            let capacity = args.capacity;
            thread::spawn(move || {
                for i in 0..items {
                    let value = (id * 1_000 + i) as i32;
                    monitor.request_cs();
                    while monitor.get().len() >= capacity {
                        monitor.wait();
                    }
                    let mut buffer = monitor.get();
                    buffer.push(value);
                    monitor.set(buffer);
                    monitor.leave_cs();
                    monitor.pulse_all();
                    tracing::info!(peer = id, value, "produced");
                }
            })
        })
        .collect();

    let consumer_handles: Vec<_> = CONSUMERS
        .iter()
        .map(|&id| {
            let monitor = monitors[id].clone();
            let stop = stop.clone();
            thread::spawn(move || loop {
                monitor.request_cs();
                while monitor.get().is_empty() {
                    if stop.load(Ordering::Relaxed) {
                        monitor.leave_cs();
                        return;
                    }
                    monitor.wait();
                }
                let mut buffer = monitor.get();
                let value = buffer.pop();
                monitor.set(buffer);
                monitor.leave_cs();
                monitor.pulse_all();
                if let Some(value) = value {
                    tracing::info!(peer = id, value, "consumed");
                }
            })
        })
        .collect();

    for handle in producer_handles {
        handle.join().expect("producer thread panicked");
    }

    // Give consumers a last chance to drain the buffer before telling them
    // to stop once it's empty.
    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);
    for &id in &CONSUMERS {
        monitors[id].pulse_all();
    }

    for handle in consumer_handles {
        handle.join().expect("consumer thread panicked");
    }
}
