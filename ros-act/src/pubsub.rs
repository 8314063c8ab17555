//! Typed publish/subscribe endpoints over the raw [`Transport`].

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, error};

use crate::msg::{CdrCodec, WireMessage};
use crate::registry::{TypeInfo, TypeRegistry};
use crate::transport::{Subscription, Transport};
use crate::{Builder, Result};

pub struct PublisherBuilder<M> {
    pub topic: String,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<TypeRegistry>,
    pub _phantom: PhantomData<M>,
}

impl<M: WireMessage> Builder for PublisherBuilder<M> {
    type Output = Publisher<M>;

    fn build(self) -> Result<Self::Output> {
        let type_info = self.registry.type_info::<M>()?;
        debug!("[PUB] ready: topic={} type={}", self.topic, type_info);
        Ok(Publisher {
            topic: self.topic,
            type_info,
            transport: self.transport,
            seq: AtomicU32::new(0),
            _phantom: PhantomData,
        })
    }
}

pub struct Publisher<M: WireMessage> {
    topic: String,
    type_info: TypeInfo,
    transport: Arc<dyn Transport>,
    seq: AtomicU32,
    _phantom: PhantomData<M>,
}

impl<M: WireMessage> Publisher<M> {
    pub fn publish(&self, msg: &M) -> Result<()> {
        let payload = CdrCodec::<M>::encode(msg)?;
        self.transport.publish(&self.topic, &self.type_info, &payload)
    }

    /// Next value for the header sequence counter.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

pub struct SubscriberBuilder<M> {
    pub topic: String,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<TypeRegistry>,
    pub _phantom: PhantomData<M>,
}

impl<M: WireMessage> Builder for SubscriberBuilder<M> {
    type Output = Subscriber<M>;

    fn build(self) -> Result<Self::Output> {
        let type_info = self.registry.type_info::<M>()?;
        let (tx, rx) = flume::unbounded();
        let topic = self.topic.clone();
        // Decode on the delivery thread, hand off without blocking. A full
        // consumer never stalls the transport: the channel is unbounded and
        // the bounded hand-off happens downstream in an AsyncQueue.
        let handler_topic = topic.clone();
        let subscription = self.transport.subscribe(
            &self.topic,
            &type_info,
            Arc::new(move |bytes: &[u8]| match CdrCodec::<M>::decode(bytes) {
                Ok(msg) => {
                    let _ = tx.send(msg);
                }
                Err(e) => error!("[SUB] decode failed on {}: {}", handler_topic, e),
            }),
        )?;
        debug!("[SUB] ready: topic={} type={}", topic, type_info);
        Ok(Subscriber {
            topic,
            rx,
            _subscription: subscription,
        })
    }
}

pub struct Subscriber<M: WireMessage> {
    topic: String,
    pub rx: flume::Receiver<M>,
    _subscription: Subscription,
}

impl<M: WireMessage> Subscriber<M> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_ready(&self) -> bool {
        !self.rx.is_empty()
    }
}
