use std::sync::Arc;

use futures::future::try_join_all;
use homie5::HomieID;
use tokio::sync::{mpsc, Mutex};
use tokio_util::task::AbortOnDropHandle;

use crate::{
    context::TreeContext, reconcile, subscribe_pending, AttributeChange, AttributeSet,
    AttributeValues, ChannelDescriptor, ChildEntity, ChildMap, EntityState, HomieProperty,
    HomieTransport, NodeAttributes, NodeSnapshot, PropertyPath, PropertyValue, TreeError,
    TreeEvent,
};

type PropertyMap<T> = Arc<Mutex<ChildMap<HomieProperty<T>>>>;

pub struct HomieNode<T: HomieTransport> {
    ctx: TreeContext<T>,
    id: HomieID,
    topic: String,
    attributes: AttributeSet<NodeAttributes>,
    properties: PropertyMap<T>,
    watcher: Option<AbortOnDropHandle<()>>,
    announced: bool,
    state: EntityState,
}

impl<T: HomieTransport> HomieNode<T> {
    pub(crate) fn new(ctx: TreeContext<T>, id: HomieID, device_topic: &str) -> Self {
        let topic = format!("{}/{}", device_topic, id);
        Self {
            ctx,
            id,
            topic,
            attributes: AttributeSet::new(),
            properties: Arc::new(Mutex::new(ChildMap::new())),
            watcher: None,
            announced: false,
            state: EntityState::Unsubscribed,
        }
    }

    /// Rebuilds a node and its properties from a snapshot, without touching the transport.
    /// Properties listed in `$properties` but missing from the snapshot are created
    /// unsubscribed and picked up by the next `subscribe()`.
    pub(crate) fn restored(
        ctx: TreeContext<T>,
        snapshot: &NodeSnapshot,
        device_topic: &str,
    ) -> Self {
        let mut node = Self::new(ctx, snapshot.id.clone(), device_topic);
        node.attributes = AttributeSet::restored(snapshot.attributes.clone());
        node.state = EntityState::Ready;
        node.announce();

        let mut properties = ChildMap::new();
        for property_id in &snapshot.attributes.properties {
            if properties.contains(property_id) {
                continue;
            }
            let property = match snapshot.property(property_id) {
                Some(property) => HomieProperty::restored(
                    node.ctx.clone(),
                    node.id.clone(),
                    property,
                    &node.topic,
                ),
                None => HomieProperty::new(
                    node.ctx.clone(),
                    node.id.clone(),
                    property_id.clone(),
                    &node.topic,
                ),
            };
            properties.insert(property_id.clone(), property);
        }
        node.properties = Arc::new(Mutex::new(properties));
        node
    }

    pub fn id(&self) -> &HomieID {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn attributes(&self) -> NodeAttributes {
        self.attributes.values()
    }

    pub fn is_complete(&self) -> bool {
        self.attributes.is_complete()
    }

    pub async fn property_ids(&self) -> Vec<HomieID> {
        self.properties.lock().await.ids().cloned().collect()
    }

    /// Channels of all ready properties in declared order.
    pub async fn channels(&self) -> Vec<(PropertyPath, ChannelDescriptor)> {
        self.properties
            .lock()
            .await
            .iter()
            .filter_map(|(_, property)| {
                property
                    .channel()
                    .map(|channel| (property.path().clone(), channel))
            })
            .collect()
    }

    pub async fn channel(&self, property_id: &HomieID) -> Option<ChannelDescriptor> {
        self.properties
            .lock()
            .await
            .get(property_id)
            .and_then(HomieProperty::channel)
    }

    pub async fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            id: self.id.clone(),
            attributes: self.attributes.values(),
            properties: self
                .properties
                .lock()
                .await
                .iter()
                .map(|(_, property)| property.snapshot())
                .collect(),
        }
    }

    fn announce(&mut self) {
        if self.announced {
            return;
        }
        self.announced = true;
        self.ctx.emit(TreeEvent::NodeAdded {
            device_id: self.ctx.device_id.clone(),
            node_id: self.id.clone(),
            attributes: self.attributes.values(),
        });
    }

    /// Discovers the node attributes, then synchronizes the properties with `$properties`.
    pub async fn subscribe(&mut self) -> Result<(), TreeError> {
        if self.state == EntityState::Stopped {
            return Err(TreeError::Stopped(self.topic.clone()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watcher = Some(AbortOnDropHandle::new(tokio::spawn(watch_attributes(
            self.ctx.clone(),
            self.id.clone(),
            self.topic.clone(),
            self.attributes.handle(),
            self.properties.clone(),
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
        if !complete {
            log::warn!("[{}] attributes incomplete, continuing with what arrived", self.topic);
        }
        self.state = EntityState::Ready;
        self.announce();

        let mut properties = self.properties.lock().await;
        subscribe_pending(&mut properties).await;
        sync_properties(
            &self.ctx,
            &self.id,
            &self.topic,
            &self.attributes.values().properties,
            &mut properties,
        )
        .await;
        Ok(())
    }

    /// Starts the value channel of every property.
    pub async fn start_channels(&self) -> Result<(), TreeError> {
        if !self.state.is_ready() {
            return Err(TreeError::NotSubscribed(self.topic.clone()));
        }
        let mut properties = self.properties.lock().await;
        let mut starts = Vec::with_capacity(properties.len());
        for (_, property) in properties.iter_mut() {
            if property.state().is_ready() {
                starts.push(property.start_channel());
            }
        }
        try_join_all(starts).await?;
        Ok(())
    }

    pub async fn write_command(
        &self,
        property_id: &HomieID,
        value: &PropertyValue,
    ) -> Result<(), TreeError> {
        let properties = self.properties.lock().await;
        let property = properties
            .get(property_id)
            .ok_or_else(|| {
                TreeError::UnknownProperty(format!("{}/{}", self.topic, property_id))
            })?;
        property.write_command(value).await
    }

    /// Stops all properties, then the node's own attribute subscriptions.
    pub async fn stop(&mut self) {
        if self.state == EntityState::Stopped {
            return;
        }
        self.state = EntityState::Stopped;
        self.watcher = None;
        {
            let mut properties = self.properties.lock().await;
            let ids: Vec<HomieID> = properties.ids().cloned().collect();
            for id in &ids {
                if let Some(property) = properties.get_mut(id) {
                    property.stop().await;
                }
            }
            properties.drain();
        }
        self.attributes.unsubscribe(&self.ctx.transport).await;
        if self.announced {
            self.ctx.emit(TreeEvent::NodeRemoved {
                device_id: self.ctx.device_id.clone(),
                node_id: self.id.clone(),
            });
        }
        log::debug!("[{}] stopped", self.topic);
    }
}

impl<T: HomieTransport> ChildEntity for HomieNode<T> {
    fn is_subscribed(&self) -> bool {
        self.attributes.is_subscribed()
    }

    async fn subscribe_child(&mut self) -> Result<(), TreeError> {
        self.subscribe().await
    }

    async fn stop_child(&mut self) {
        self.stop().await
    }
}

async fn sync_properties<T: HomieTransport>(
    ctx: &TreeContext<T>,
    node_id: &HomieID,
    topic: &str,
    desired: &[HomieID],
    properties: &mut ChildMap<HomieProperty<T>>,
) {
    let report = reconcile(
        desired,
        properties,
        |id| HomieProperty::new(ctx.clone(), node_id.clone(), id.clone(), topic),
        |id, _| log::debug!("[{}] property [{}] removed", topic, id),
    )
    .await;
    if !report.is_noop() {
        log::debug!("[{}] properties synchronized: {:?}", topic, report);
    }
}

async fn watch_attributes<T: HomieTransport>(
    ctx: TreeContext<T>,
    node_id: HomieID,
    topic: String,
    values: AttributeValues<NodeAttributes>,
    properties: PropertyMap<T>,
    mut changes: mpsc::UnboundedReceiver<AttributeChange<NodeAttributes>>,
) {
    while let Some(change) = changes.recv().await {
        if change.name == "properties" {
            let mut properties = properties.lock().await;
            sync_properties(&ctx, &node_id, &topic, &values.get().properties, &mut properties)
                .await;
        } else {
            ctx.emit(TreeEvent::NodeChanged {
                device_id: ctx.device_id.clone(),
                node_id: node_id.clone(),
                attributes: change.attributes,
            });
        }
    }
}
