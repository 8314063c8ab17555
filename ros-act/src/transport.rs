//! Transport boundary.
//!
//! The engine never talks to a wire library directly; it publishes and
//! subscribes through [`Transport`]. Subscription handlers are invoked on an
//! arbitrary thread and must not block: they hand the payload off and
//! return.
//!
//! [`LocalBus`] is the in-process reference transport used by integration
//! tests and examples. It pins one wire type per topic and validates
//! published payloads against the registry's decode probes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::registry::{TypeInfo, TypeRegistry};
use crate::{Error, Result};

/// Raw payload handler. Called on an arbitrary thread; must not block.
pub type RawHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub trait Transport: Send + Sync + 'static {
    fn publish(&self, topic: &str, type_info: &TypeInfo, payload: &[u8]) -> Result<()>;

    fn subscribe(
        &self,
        topic: &str,
        type_info: &TypeInfo,
        handler: RawHandler,
    ) -> Result<Subscription>;
}

/// Removes its handler from the transport when dropped.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

struct TopicState {
    info: TypeInfo,
    handlers: Vec<(u64, RawHandler)>,
}

/// In-process fan-out transport over a shared topic table.
pub struct LocalBus {
    registry: Arc<TypeRegistry>,
    topics: Arc<Mutex<HashMap<String, TopicState>>>,
    next_sub_id: AtomicU64,
}

impl LocalBus {
    pub fn new(registry: Arc<TypeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            topics: Arc::new(Mutex::new(HashMap::new())),
            next_sub_id: AtomicU64::new(0),
        })
    }

    /// The first publisher or subscriber on a topic pins its type; later
    /// endpoints must match it.
    fn check_topic_type(state: &TopicState, topic: &str, info: &TypeInfo) -> Result<()> {
        if state.info != *info {
            return Err(Error::TypeMismatch {
                topic: topic.to_string(),
                expected: state.info.name.clone(),
                found: info.name.clone(),
            });
        }
        Ok(())
    }
}

impl Transport for LocalBus {
    fn publish(&self, topic: &str, type_info: &TypeInfo, payload: &[u8]) -> Result<()> {
        self.registry.probe(&type_info.name, payload)?;

        let handlers: Vec<RawHandler> = {
            let mut topics = self.topics.lock();
            let state = topics.entry(topic.to_string()).or_insert_with(|| {
                debug!("[BUS] topic pinned: {} ({})", topic, type_info);
                TopicState {
                    info: type_info.clone(),
                    handlers: Vec::new(),
                }
            });
            Self::check_topic_type(state, topic, type_info)?;
            state.handlers.iter().map(|(_, h)| h.clone()).collect()
        };

        trace!(
            "[BUS] publish topic={} bytes={} subscribers={}",
            topic,
            payload.len(),
            handlers.len()
        );
        // Deliver outside the topic lock: handlers may publish reentrantly.
        for handler in handlers {
            handler(payload);
        }
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        type_info: &TypeInfo,
        handler: RawHandler,
    ) -> Result<Subscription> {
        self.registry.lookup(&type_info.name)?;

        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.topics.lock();
            let state = topics.entry(topic.to_string()).or_insert_with(|| {
                debug!("[BUS] topic pinned: {} ({})", topic, type_info);
                TopicState {
                    info: type_info.clone(),
                    handlers: Vec::new(),
                }
            });
            Self::check_topic_type(state, topic, type_info)?;
            state.handlers.push((id, handler));
        }
        debug!("[BUS] subscriber {} on topic {}", id, topic);

        let topics = self.topics.clone();
        let topic = topic.to_string();
        Ok(Subscription::new(move || {
            if let Some(state) = topics.lock().get_mut(&topic) {
                state.handlers.retain(|(sub_id, _)| *sub_id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{CdrCodec, WireMessage};
    use parking_lot::Mutex as PlMutex;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Num {
        value: i32,
    }

    impl WireMessage for Num {
        fn type_name() -> String {
            "test_msgs/Num".to_string()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Text {
        value: String,
    }

    impl WireMessage for Text {
        fn type_name() -> String {
            "test_msgs/Text".to_string()
        }
    }

    fn setup() -> (Arc<TypeRegistry>, Arc<LocalBus>) {
        let registry = Arc::new(TypeRegistry::new());
        registry.register::<Num>();
        registry.register::<Text>();
        let bus = LocalBus::new(registry.clone());
        (registry, bus)
    }

    #[test]
    fn test_fan_out_and_unsubscribe() {
        let (registry, bus) = setup();
        let info = registry.type_info::<Num>().unwrap();

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let seen_a = seen.clone();
        let sub_a = bus
            .subscribe(
                "/nums",
                &info,
                Arc::new(move |bytes| {
                    seen_a.lock().push(("a", CdrCodec::<Num>::decode(bytes).unwrap().value));
                }),
            )
            .unwrap();
        let seen_b = seen.clone();
        let _sub_b = bus
            .subscribe(
                "/nums",
                &info,
                Arc::new(move |bytes| {
                    seen_b.lock().push(("b", CdrCodec::<Num>::decode(bytes).unwrap().value));
                }),
            )
            .unwrap();

        let payload = CdrCodec::<Num>::encode(&Num { value: 1 }).unwrap();
        bus.publish("/nums", &info, &payload).unwrap();
        assert_eq!(seen.lock().len(), 2);

        drop(sub_a);
        bus.publish("/nums", &info, &payload).unwrap();
        assert_eq!(seen.lock().len(), 3);
        assert_eq!(seen.lock().last(), Some(&("b", 1)));
    }

    #[test]
    fn test_topic_type_is_pinned() {
        let (registry, bus) = setup();
        let num_info = registry.type_info::<Num>().unwrap();
        let text_info = registry.type_info::<Text>().unwrap();

        let payload = CdrCodec::<Num>::encode(&Num { value: 1 }).unwrap();
        bus.publish("/mixed", &num_info, &payload).unwrap();

        let err = bus
            .subscribe("/mixed", &text_info, Arc::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_publish_validates_payload() {
        let (registry, bus) = setup();
        let info = registry.type_info::<Num>().unwrap();
        assert!(bus.publish("/nums", &info, &[0xDE, 0xAD]).is_err());
    }
}
