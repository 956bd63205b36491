use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::debug;

use super::tuple::Stream;
use crate::utilities::{isolate, lock};

pub type StreamObserver = Arc<dyn Fn(&str, &Stream) + Send + Sync>;

/// Keyed registry of "new stream discovered" observers, shared by an
/// endpoint and all of its sessions.
#[derive(Clone, Default)]
pub struct StreamEvents {
    observers: Arc<Mutex<HashMap<String, StreamObserver>>>,
}

impl StreamEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_new_stream<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&str, &Stream) + Send + Sync + 'static,
    {
        lock(&self.observers).insert(key.into(), Arc::new(f));
    }

    pub fn remove(&self, key: &str) -> bool {
        lock(&self.observers).remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.observers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn report(&self, name: &str, stream: &Stream) {
        let observers: Vec<(String, StreamObserver)> = lock(&self.observers)
            .iter()
            .map(|(key, f)| (key.clone(), Arc::clone(f)))
            .collect();
        debug!("new stream '{name}', notifying {} observer(s)", observers.len());
        for (key, f) in observers {
            isolate(&format!("new-stream/{key}"), || f(name, stream));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::Schema;

    #[test]
    fn reports_to_every_observer() {
        let events = StreamEvents::new();
        let count = Arc::new(AtomicUsize::new(0));
        for key in ["a", "b"] {
            let count = count.clone();
            events.on_new_stream(key, move |name: &str, _: &Stream| {
                assert_eq!(name, "temp");
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        let stream = Stream::new("temp", 0, Schema::default());
        events.report("temp", &stream);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(events.remove("a"));
        events.report("temp", &stream);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn same_key_replaces_observer() {
        let events = StreamEvents::new();
        events.on_new_stream("k", |_: &str, _: &Stream| {});
        events.on_new_stream("k", |_: &str, _: &Stream| {});
        assert_eq!(events.len(), 1);
    }
}
