use std::sync::Arc;

use futures::future::try_join_all;
use homie5::HomieID;
use tokio::sync::{mpsc, Mutex};
use tokio_util::task::AbortOnDropHandle;

use crate::{
    context::TreeContext, reconcile, subscribe_pending, AttributeChange, AttributeSet,
    AttributeValues, ChannelDescriptor, ChildMap, DeviceAttributes, DeviceSnapshot, DeviceState,
    EntityState, HomieNode, HomieTransport, NodeAttributes, PropertyPath, PropertyValue,
    TreeConfig, TreeError, TreeEvent, TreeEventSender,
};

type NodeMap<T> = Arc<Mutex<ChildMap<HomieNode<T>>>>;

/// Local mirror of one remote homie device.
///
/// ```ignore
/// let mut device = HomieDevice::new(HomieID::try_from("d1")?, transport, TreeConfig::default());
/// device.add_listener(events_sender);
/// device.subscribe().await?;
/// device.start_channels().await?;
/// ```
pub struct HomieDevice<T: HomieTransport> {
    ctx: TreeContext<T>,
    topic: String,
    attributes: AttributeSet<DeviceAttributes>,
    nodes: NodeMap<T>,
    watcher: Option<AbortOnDropHandle<()>>,
    state: EntityState,
}

impl<T: HomieTransport> HomieDevice<T> {
    pub fn new(device_id: HomieID, transport: T, config: TreeConfig) -> Self {
        let ctx = TreeContext::new(device_id, transport, config);
        let topic = ctx.device_topic();
        Self {
            ctx,
            topic,
            attributes: AttributeSet::new(),
            nodes: Arc::new(Mutex::new(ChildMap::new())),
            watcher: None,
            state: EntityState::Unsubscribed,
        }
    }

    pub fn device_id(&self) -> &HomieID {
        &self.ctx.device_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> EntityState {
        self.state
    }

    pub fn attributes(&self) -> DeviceAttributes {
        self.attributes.values()
    }

    /// The `$state` the remote device reported.
    pub fn device_state(&self) -> DeviceState {
        self.attributes.values().state
    }

    pub fn is_complete(&self) -> bool {
        self.attributes.is_complete()
    }

    /// Registers a receiver for [`TreeEvent`]s. Registering the same sender twice is ignored.
    pub fn add_listener(&self, listener: TreeEventSender) -> bool {
        self.ctx.events.add_listener(listener)
    }

    pub fn remove_listener(&self, listener: &TreeEventSender) {
        self.ctx.events.remove_listener(listener)
    }

    pub async fn node_ids(&self) -> Vec<HomieID> {
        self.nodes.lock().await.ids().cloned().collect()
    }

    pub async fn node_attributes(&self, node_id: &HomieID) -> Option<NodeAttributes> {
        self.nodes.lock().await.get(node_id).map(HomieNode::attributes)
    }

    pub async fn property_ids(&self, node_id: &HomieID) -> Option<Vec<HomieID>> {
        let nodes = self.nodes.lock().await;
        match nodes.get(node_id) {
            Some(node) => Some(node.property_ids().await),
            None => None,
        }
    }

    /// Channels of all ready properties, nodes and properties in declared order.
    pub async fn channels(&self) -> Vec<(PropertyPath, ChannelDescriptor)> {
        let nodes = self.nodes.lock().await;
        let mut channels = Vec::new();
        for (_, node) in nodes.iter() {
            channels.extend(node.channels().await);
        }
        channels
    }

    pub async fn channel(&self, path: &PropertyPath) -> Option<ChannelDescriptor> {
        if path.device_id != self.ctx.device_id {
            return None;
        }
        let nodes = self.nodes.lock().await;
        match nodes.get(&path.node_id) {
            Some(node) => node.channel(&path.property_id).await,
            None => None,
        }
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        let nodes = self.nodes.lock().await;
        let mut snapshot = DeviceSnapshot {
            attributes: self.attributes.values(),
            nodes: Vec::with_capacity(nodes.len()),
        };
        for (_, node) in nodes.iter() {
            snapshot.nodes.push(node.snapshot().await);
        }
        snapshot
    }

    /// Rebuilds nodes, properties and channels from a snapshot without any broker traffic.
    /// Only possible before the first `subscribe()`.
    pub async fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), TreeError> {
        match self.state {
            EntityState::Unsubscribed => {}
            EntityState::Stopped => return Err(TreeError::Stopped(self.topic.clone())),
            _ => return Err(TreeError::AlreadySubscribed(self.topic.clone())),
        }
        self.attributes = AttributeSet::restored(snapshot.attributes.clone());

        let mut nodes = self.nodes.lock().await;
        for node_id in &snapshot.attributes.nodes {
            if nodes.contains(node_id) {
                continue;
            }
            let node = match snapshot.node(node_id) {
                Some(node) => HomieNode::restored(self.ctx.clone(), node, &self.topic),
                None => HomieNode::new(self.ctx.clone(), node_id.clone(), &self.topic),
            };
            nodes.insert(node_id.clone(), node);
        }
        self.state = EntityState::Ready;
        log::debug!("[{}] restored {} nodes", self.topic, nodes.len());
        Ok(())
    }

    /// Discovers the device attributes and, cascading, every node and property listed.
    /// Resolves once the tree is built from whatever arrived within the discovery timeouts.
    pub async fn subscribe(&mut self) -> Result<(), TreeError> {
        if self.state == EntityState::Stopped {
            return Err(TreeError::Stopped(self.topic.clone()));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watcher = Some(AbortOnDropHandle::new(tokio::spawn(watch_attributes(
            self.ctx.clone(),
            self.topic.clone(),
            self.attributes.handle(),
            self.nodes.clone(),
            receiver,
        ))));
        if !self.state.is_ready() {
            self.state = EntityState::Discovering;
        }
        log::debug!("[{}] discovering device", self.topic);

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
        self.ctx.emit(TreeEvent::DeviceChanged {
            device_id: self.ctx.device_id.clone(),
            attributes: self.attributes.values(),
        });

        let mut nodes = self.nodes.lock().await;
        subscribe_pending(&mut nodes).await;
        sync_nodes(
            &self.ctx,
            &self.topic,
            &self.attributes.values().nodes,
            &mut nodes,
        )
        .await;
        Ok(())
    }

    /// Starts the value channels of all properties. Properties created later on start
    /// theirs on their own.
    pub async fn start_channels(&self) -> Result<(), TreeError> {
        if !self.state.is_ready() {
            return Err(match self.state {
                EntityState::Stopped => TreeError::Stopped(self.topic.clone()),
                _ => TreeError::NotSubscribed(self.topic.clone()),
            });
        }
        self.ctx.set_channels_started(true);
        let nodes = self.nodes.lock().await;
        let mut starts = Vec::with_capacity(nodes.len());
        for (_, node) in nodes.iter() {
            if node.state().is_ready() {
                starts.push(node.start_channels());
            }
        }
        try_join_all(starts).await?;
        Ok(())
    }

    /// Sends `value` to the command topic of a property.
    pub async fn write_command(
        &self,
        node_id: &HomieID,
        property_id: &HomieID,
        value: &PropertyValue,
    ) -> Result<(), TreeError> {
        let nodes = self.nodes.lock().await;
        let node = nodes
            .get(node_id)
            .ok_or_else(|| TreeError::UnknownNode(format!("{}/{}", self.topic, node_id)))?;
        node.write_command(property_id, value).await
    }

    /// Stops the whole tree, children first. Safe in any state, including after a dropped
    /// `subscribe()`. The device cannot be used afterwards.
    pub async fn stop(&mut self) {
        if self.state == EntityState::Stopped {
            return;
        }
        let announced = self.state.is_ready();
        self.state = EntityState::Stopped;
        self.ctx.set_channels_started(false);
        self.watcher = None;
        {
            let mut nodes = self.nodes.lock().await;
            let ids: Vec<HomieID> = nodes.ids().cloned().collect();
            for id in &ids {
                if let Some(node) = nodes.get_mut(id) {
                    node.stop().await;
                }
            }
            nodes.drain();
        }
        self.attributes.unsubscribe(&self.ctx.transport).await;
        if announced {
            self.ctx.emit(TreeEvent::DeviceRemoved {
                device_id: self.ctx.device_id.clone(),
            });
        }
        log::debug!("[{}] stopped", self.topic);
    }
}

async fn sync_nodes<T: HomieTransport>(
    ctx: &TreeContext<T>,
    topic: &str,
    desired: &[HomieID],
    nodes: &mut ChildMap<HomieNode<T>>,
) {
    let report = reconcile(
        desired,
        nodes,
        |id| HomieNode::new(ctx.clone(), id.clone(), topic),
        |id, _| log::debug!("[{}] node [{}] removed", topic, id),
    )
    .await;
    if !report.is_noop() {
        log::debug!("[{}] nodes synchronized: {:?}", topic, report);
    }
}

async fn watch_attributes<T: HomieTransport>(
    ctx: TreeContext<T>,
    topic: String,
    values: AttributeValues<DeviceAttributes>,
    nodes: NodeMap<T>,
    mut changes: mpsc::UnboundedReceiver<AttributeChange<DeviceAttributes>>,
) {
    while let Some(change) = changes.recv().await {
        if change.name == "nodes" {
            let mut nodes = nodes.lock().await;
            sync_nodes(&ctx, &topic, &values.get().nodes, &mut nodes).await;
        } else {
            ctx.emit(TreeEvent::DeviceChanged {
                device_id: ctx.device_id.clone(),
                attributes: change.attributes,
            });
        }
    }
}
