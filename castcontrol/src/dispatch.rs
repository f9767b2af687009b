//! Single-threaded event dispatch.
//!
//! All observer callbacks are funneled through one thread so every observer
//! sees events in the same relative order, regardless of which socket thread
//! produced them.

use crossbeam_channel::{Sender, bounded, unbounded};
use tracing::debug;

enum Job {
    Run(Box<dyn FnOnce() + Send>),
    Flush(Sender<()>),
}

pub struct Dispatcher {
    tx: Sender<Job>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<Job>();
        std::thread::Builder::new()
            .name("event-dispatch".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Run(f) => f(),
                        Job::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                debug!("Event dispatch thread exited");
            })
            .expect("spawn dispatch thread");
        Self { tx }
    }

    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Job::Run(Box::new(f)));
    }

    /// Blocks until every previously posted job has run.
    pub fn flush(&self) {
        let (ack, done) = bounded(1);
        if self.tx.send(Job::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
