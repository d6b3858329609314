use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::try_join_all;
use homie5::HomieID;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::task::AbortOnDropHandle;

use crate::{HomieTransport, MessageReceiver, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    #[error("Unknown attribute [${0}]")]
    Unknown(String),
    #[error("Invalid value [{value}] for attribute [${name}]: {reason}")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

impl AttributeError {
    pub(crate) fn invalid(name: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_owned(),
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeField {
    /// Sub-topic name without the leading `$`.
    pub name: &'static str,
    pub mandatory: bool,
}

impl AttributeField {
    pub const fn mandatory(name: &'static str) -> Self {
        Self {
            name,
            mandatory: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            mandatory: false,
        }
    }
}

/// Typed attribute record of one entity (`$name`, `$nodes`, `$datatype`, ...).
pub trait AttributeFields: Default + Clone + Send + 'static {
    const FIELDS: &'static [AttributeField];

    /// Parses `payload` into the field `name`.
    /// Returns whether the stored value changed.
    fn apply(&mut self, name: &str, payload: &str) -> Result<bool, AttributeError>;
}

/// Stores `value` into `slot`, returns true if that changed the slot.
pub(crate) fn store<V: PartialEq>(slot: &mut V, value: V) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

pub(crate) fn parse_bool(name: &str, payload: &str) -> Result<bool, AttributeError> {
    match payload {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(AttributeError::invalid(name, payload, "expected true or false")),
    }
}

/// Splits a comma separated id list. Invalid ids are dropped, the rest is kept in order.
pub(crate) fn parse_id_list(name: &str, payload: &str) -> Vec<HomieID> {
    payload
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter_map(|id| match id.parse::<HomieID>() {
            Ok(id) => Some(id),
            Err(_) => {
                log::warn!("Dropping invalid id [{}] from attribute [${}]", id, name);
                None
            }
        })
        .collect()
}

/// Notification sent to the owner of an [`AttributeSet`] once its subscription settled.
#[derive(Debug, Clone)]
pub struct AttributeChange<A> {
    pub name: &'static str,
    pub attributes: A,
    pub complete: bool,
}

#[derive(Debug)]
struct AttributeState<A> {
    values: A,
    received: HashSet<&'static str>,
    settled: bool,
}

impl<A: AttributeFields> AttributeState<A> {
    fn is_complete(&self) -> bool {
        A::FIELDS
            .iter()
            .filter(|field| field.mandatory)
            .all(|field| self.received.contains(field.name))
    }
}

fn lock<A>(state: &Mutex<AttributeState<A>>) -> MutexGuard<'_, AttributeState<A>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read access to the current values of an [`AttributeSet`], shareable with spawned tasks.
#[derive(Debug)]
pub struct AttributeValues<A> {
    state: Arc<Mutex<AttributeState<A>>>,
}

impl<A> Clone for AttributeValues<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<A: AttributeFields> AttributeValues<A> {
    pub fn get(&self) -> A {
        lock(&self.state).values.clone()
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.state).is_complete()
    }
}

pub struct AttributeSet<A: AttributeFields> {
    state: Arc<Mutex<AttributeState<A>>>,
    topics: Vec<String>,
    pump: Option<AbortOnDropHandle<()>>,
}

impl<A: AttributeFields> Default for AttributeSet<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: AttributeFields> AttributeSet<A> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AttributeState {
                values: A::default(),
                received: HashSet::new(),
                settled: false,
            })),
            topics: Vec::new(),
            pump: None,
        }
    }

    /// Creates a set that already holds `values` and counts as complete.
    pub fn restored(values: A) -> Self {
        let set = Self::new();
        {
            let mut state = lock(&set.state);
            state.values = values;
            state.received = A::FIELDS.iter().map(|field| field.name).collect();
            state.settled = true;
        }
        set
    }

    pub fn values(&self) -> A {
        lock(&self.state).values.clone()
    }

    pub fn handle(&self) -> AttributeValues<A> {
        AttributeValues {
            state: self.state.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.state).is_complete()
    }

    pub fn is_subscribed(&self) -> bool {
        !self.topics.is_empty()
    }

    /// Subscribes `prefix/$field` for every declared field and waits until all mandatory fields
    /// received a value or `timeout` elapsed. Returns whether the set is complete.
    ///
    /// `listener` only receives changes once this future resolved.
    pub async fn subscribe_and_receive<T: HomieTransport>(
        &mut self,
        transport: &T,
        prefix: &str,
        listener: mpsc::UnboundedSender<AttributeChange<A>>,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        if self.is_subscribed() {
            self.unsubscribe(transport).await;
        }
        {
            let mut state = lock(&self.state);
            state.received.clear();
            state.settled = false;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let (done_sender, mut done) = watch::channel(false);
        let field_prefix = format!("{}/$", prefix);

        self.pump = Some(AbortOnDropHandle::new(tokio::spawn(pump(
            self.state.clone(),
            field_prefix.clone(),
            receiver,
            done_sender,
            listener,
        ))));
        // recorded before subscribing so a stop() racing this future finds every topic
        self.topics = A::FIELDS
            .iter()
            .map(|field| format!("{}{}", field_prefix, field.name))
            .collect();

        let mut subscriptions = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            subscriptions.push(transport.subscribe(topic, sender.clone()));
        }
        let subscribed = try_join_all(subscriptions).await;
        if let Err(err) = subscribed {
            // leaves the set unsubscribed, so the next attempt starts over
            self.unsubscribe(transport).await;
            return Err(err);
        }
        drop(sender);

        let wait_complete = async {
            loop {
                let complete = *done.borrow_and_update();
                if complete {
                    return true;
                }
                if done.changed().await.is_err() {
                    return false;
                }
            }
        };
        let complete = tokio::time::timeout(timeout, wait_complete)
            .await
            .unwrap_or(false);

        lock(&self.state).settled = true;
        if !complete {
            log::debug!("[{}] attribute discovery timed out after {:?}", prefix, timeout);
        }
        Ok(complete)
    }

    /// Cancels all attribute subscriptions. Calling this more than once is fine.
    pub async fn unsubscribe<T: HomieTransport>(&mut self, transport: &T) {
        self.pump = None;
        for topic in self.topics.drain(..) {
            if let Err(err) = transport.unsubscribe(&topic).await {
                log::warn!("{}", err);
            }
        }
        let mut state = lock(&self.state);
        state.received.clear();
        state.settled = false;
    }
}

async fn pump<A: AttributeFields>(
    state: Arc<Mutex<AttributeState<A>>>,
    field_prefix: String,
    mut receiver: MessageReceiver,
    done: watch::Sender<bool>,
    listener: mpsc::UnboundedSender<AttributeChange<A>>,
) {
    while let Some(message) = receiver.recv().await {
        let Some(field) = message
            .topic
            .strip_prefix(field_prefix.as_str())
            .and_then(|name| A::FIELDS.iter().find(|field| field.name == name))
        else {
            log::trace!("Ignoring message on [{}]", message.topic);
            continue;
        };

        let change = {
            let mut state = lock(&state);
            match state.values.apply(field.name, &message.payload) {
                Ok(_) => {
                    state.received.insert(field.name);
                    let complete = state.is_complete();
                    if complete {
                        done.send_replace(true);
                    }
                    state.settled.then(|| AttributeChange {
                        name: field.name,
                        attributes: state.values.clone(),
                        complete,
                    })
                }
                Err(err) => {
                    log::warn!("[{}] {}", message.topic, err);
                    None
                }
            }
        };

        if let Some(change) = change {
            if listener.send(change).is_err() {
                log::trace!("Attribute listener for [{}] is gone", message.topic);
            }
        }
    }
}
