use std::sync::{Arc, Mutex, PoisonError};

use homie5::HomieID;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;

use crate::{
    context::TreeContext, AttributeChange, AttributeSet, AttributeValues, ChannelDescriptor,
    ChildEntity, EntityState, HomieTransport, MessageReceiver, PropertyAttributes, PropertyPath,
    PropertySnapshot, PropertyValue, TreeError, TreeEvent,
};

type ChannelSlot = Arc<Mutex<Option<ChannelDescriptor>>>;

fn current_channel(slot: &ChannelSlot) -> Option<ChannelDescriptor> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

/// A single property of a node. Leaf of the tree.
pub struct HomieProperty<T: HomieTransport> {
    ctx: TreeContext<T>,
    path: PropertyPath,
    topic: String,
    attributes: AttributeSet<PropertyAttributes>,
    channel: ChannelSlot,
    watcher: Option<AbortOnDropHandle<()>>,
    value_pump: Option<AbortOnDropHandle<()>>,
    value_subscribed: bool,
    state: EntityState,
}

impl<T: HomieTransport> HomieProperty<T> {
    pub(crate) fn new(
        ctx: TreeContext<T>,
        node_id: HomieID,
        property_id: HomieID,
        node_topic: &str,
    ) -> Self {
        let topic = format!("{}/{}", node_topic, property_id);
        let path = PropertyPath::new(ctx.device_id.clone(), node_id, property_id);
        Self {
            ctx,
            path,
            topic,
            attributes: AttributeSet::new(),
            channel: Arc::new(Mutex::new(None)),
            watcher: None,
            value_pump: None,
            value_subscribed: false,
            state: EntityState::Unsubscribed,
        }
    }

    /// Builds a ready property from cached attributes. The channel is derived right away.
    pub(crate) fn restored(
        ctx: TreeContext<T>,
        node_id: HomieID,
        snapshot: &PropertySnapshot,
        node_topic: &str,
    ) -> Self {
        let mut property = Self::new(ctx, node_id, snapshot.id.clone(), node_topic);
        property.attributes = AttributeSet::restored(snapshot.attributes.clone());
        property.state = EntityState::Ready;
        update_channel(
            &property.ctx,
            &property.path,
            &property.topic,
            &property.channel,
            &snapshot.attributes,
        );
        property
    }

    pub fn id(&self) -> &HomieID {
        &self.path.property_id
    }

    pub fn path(&self) -> &PropertyPath {
        &self.path
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn attributes(&self) -> PropertyAttributes {
        self.attributes.values()
    }

    pub fn is_complete(&self) -> bool {
        self.attributes.is_complete()
    }

    /// The derived channel, `None` as long as the attributes are incomplete.
    pub fn channel(&self) -> Option<ChannelDescriptor> {
        current_channel(&self.channel)
    }

    pub fn snapshot(&self) -> PropertySnapshot {
        PropertySnapshot {
            id: self.path.property_id.clone(),
            attributes: self.attributes.values(),
        }
    }

    /// Discovers the property attributes and derives the channel once they are complete.
    /// Later attribute changes re-derive it.
    pub async fn subscribe(&mut self) -> Result<(), TreeError> {
        if self.state == EntityState::Stopped {
            return Err(TreeError::Stopped(self.topic.clone()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watcher = Some(AbortOnDropHandle::new(tokio::spawn(watch_attributes(
            self.ctx.clone(),
            self.path.clone(),
            self.topic.clone(),
            self.attributes.handle(),
            self.channel.clone(),
            receiver,
        ))));
        if !self.state.is_ready() {
            self.state = EntityState::Discovering;
        }

        let complete = self
            .attributes
            .subscribe_and_receive(
                &self.ctx.transport,
                &self.topic,
                sender,
                self.ctx.config.discovery_timeout,
            )
            .await?;

        self.state = if self.value_pump.is_some() {
            EntityState::ChannelStarted
        } else {
            EntityState::Ready
        };
        if complete {
            update_channel(
                &self.ctx,
                &self.path,
                &self.topic,
                &self.channel,
                &self.attributes.values(),
            );
        } else {
            log::warn!(
                "[{}] attributes incomplete after {:?}, no channel derived",
                self.topic,
                self.ctx.config.discovery_timeout
            );
        }
        Ok(())
    }

    /// Starts listening on the value topic. Calling it again is a no-op.
    pub async fn start_channel(&mut self) -> Result<(), TreeError> {
        match self.state {
            EntityState::Stopped => return Err(TreeError::Stopped(self.topic.clone())),
            EntityState::Unsubscribed | EntityState::Discovering => {
                return Err(TreeError::NotSubscribed(self.topic.clone()))
            }
            EntityState::ChannelStarted => return Ok(()),
            EntityState::Ready => {}
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.value_pump = Some(AbortOnDropHandle::new(tokio::spawn(pump_values(
            self.ctx.clone(),
            self.path.clone(),
            self.topic.clone(),
            self.channel.clone(),
            receiver,
        ))));
        self.value_subscribed = true;
        if let Err(err) = self.ctx.transport.subscribe(&self.topic, sender).await {
            self.value_pump = None;
            return Err(err.into());
        }
        self.state = EntityState::ChannelStarted;
        log::debug!("[{}] channel started", self.topic);
        Ok(())
    }

    /// Validates `value` against the channel and publishes it to the command topic.
    pub async fn write_command(&self, value: &PropertyValue) -> Result<(), TreeError> {
        if self.state == EntityState::Stopped {
            return Err(TreeError::Stopped(self.topic.clone()));
        }
        let channel = self
            .channel()
            .ok_or_else(|| TreeError::ChannelNotReady(self.topic.clone()))?;
        let Some(command_topic) = channel.command_topic else {
            return Err(TreeError::NotSettable(self.topic.clone()));
        };
        let payload = channel
            .representation
            .format(value)
            .map_err(|source| TreeError::InvalidValue {
                topic: self.topic.clone(),
                source,
            })?;
        log::debug!("[{}] sending command [{}]", command_topic, payload);
        self.ctx
            .transport
            .publish(&command_topic, &payload, false)
            .await?;
        Ok(())
    }

    /// Cancels the value and attribute subscriptions. Safe in any state, a stopped
    /// property cannot be subscribed again.
    pub async fn stop(&mut self) {
        if self.state == EntityState::Stopped {
            return;
        }
        self.state = EntityState::Stopped;
        self.watcher = None;
        self.value_pump = None;
        if self.value_subscribed {
            self.value_subscribed = false;
            if let Err(err) = self.ctx.transport.unsubscribe(&self.topic).await {
                log::warn!("{}", err);
            }
        }
        self.attributes.unsubscribe(&self.ctx.transport).await;
        if current_channel(&self.channel).is_some() {
            self.ctx.emit(TreeEvent::PropertyRemoved {
                path: self.path.clone(),
            });
        }
        log::debug!("[{}] stopped", self.topic);
    }
}

impl<T: HomieTransport> ChildEntity for HomieProperty<T> {
    fn is_subscribed(&self) -> bool {
        self.attributes.is_subscribed()
    }

    async fn subscribe_child(&mut self) -> Result<(), TreeError> {
        self.subscribe().await?;
        if self.ctx.channels_started() {
            self.start_channel().await?;
        }
        Ok(())
    }

    async fn stop_child(&mut self) {
        self.stop().await
    }
}

/// Derives the channel from `attributes` and announces it if it is new or differs.
fn update_channel<T>(
    ctx: &TreeContext<T>,
    path: &PropertyPath,
    topic: &str,
    slot: &ChannelSlot,
    attributes: &PropertyAttributes,
) {
    let descriptor = ChannelDescriptor::derive(path, topic, attributes);
    let event = {
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.replace(descriptor.clone()) {
            None => Some(TreeEvent::PropertyReady {
                path: path.clone(),
                channel: descriptor,
            }),
            Some(previous) if previous != descriptor => Some(TreeEvent::PropertyChanged {
                path: path.clone(),
                channel: descriptor,
            }),
            Some(_) => None,
        }
    };
    if let Some(event) = event {
        ctx.emit(event);
    }
}

async fn watch_attributes<T>(
    ctx: TreeContext<T>,
    path: PropertyPath,
    topic: String,
    values: AttributeValues<PropertyAttributes>,
    slot: ChannelSlot,
    mut changes: mpsc::UnboundedReceiver<AttributeChange<PropertyAttributes>>,
) {
    while let Some(change) = changes.recv().await {
        if change.complete {
            update_channel(&ctx, &path, &topic, &slot, &values.get());
        } else {
            log::debug!("[{}] ${} changed, attributes still incomplete", topic, change.name);
        }
    }
}

async fn pump_values<T>(
    ctx: TreeContext<T>,
    path: PropertyPath,
    topic: String,
    slot: ChannelSlot,
    mut receiver: MessageReceiver,
) {
    while let Some(message) = receiver.recv().await {
        if message.topic != topic {
            log::trace!("Ignoring message on [{}]", message.topic);
            continue;
        }
        let Some(channel) = current_channel(&slot) else {
            log::debug!("[{}] dropping value, attributes are incomplete", topic);
            continue;
        };
        if channel.is_trigger() {
            ctx.emit(TreeEvent::PropertyTriggered {
                path: path.clone(),
                event: message.payload,
            });
            continue;
        }
        match channel.representation.parse(&message.payload) {
            Ok(value) => ctx.emit(TreeEvent::PropertyValue {
                path: path.clone(),
                value,
            }),
            Err(err) => log::warn!("[{}] dropping value: {}", topic, err),
        }
    }
}
