mod common;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use hc_homie_tree::*;
    use tokio::sync::mpsc;

    use crate::common::*;

    const DEVICE: &str = "homie/d1";
    const NODE: &str = "homie/d1/n1";
    const TEMP: &str = "homie/d1/n1/temp";

    fn temp_path() -> PropertyPath {
        PropertyPath::new(id("d1"), id("n1"), id("temp"))
    }

    fn publish_thermometer(broker: &MemoryBroker) {
        broker.publish_device(DEVICE, "n1");
        broker.publish_node(NODE, "temp");
        broker.publish_property(TEMP, "float", "-40:60", false, true);
        broker.publish_retained(&format!("{}/$unit", TEMP), "°C");
    }

    fn device_with_listener(
        broker: &MemoryBroker,
    ) -> (
        HomieDevice<MemoryBroker>,
        mpsc::UnboundedReceiver<TreeEvent>,
    ) {
        let device = HomieDevice::new(id("d1"), broker.clone(), test_config());
        let (sender, receiver) = mpsc::unbounded_channel();
        assert!(device.add_listener(sender));
        (device, receiver)
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_and_removal() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        let (mut device, mut events) = device_with_listener(&broker);

        device.subscribe().await.unwrap();
        assert_eq!(device.state(), EntityState::Ready);
        assert_eq!(device.device_state(), DeviceState::Ready);
        assert_eq!(device.node_ids().await, ids(&["n1"]));

        let events_seen = drain_events(&mut events).await;
        assert_eq!(events_seen.len(), 3, "{:#?}", events_seen);
        assert!(matches!(&events_seen[0], TreeEvent::DeviceChanged { attributes, .. } if attributes.nodes == ids(&["n1"])));
        assert!(matches!(&events_seen[1], TreeEvent::NodeAdded { node_id, .. } if node_id.as_str() == "n1"));
        let TreeEvent::PropertyReady { path, channel } = &events_seen[2] else {
            panic!("expected PropertyReady, got {:?}", events_seen[2]);
        };
        assert_eq!(path, &temp_path());
        assert_eq!(channel.uid, "n1/temp");
        assert_eq!(channel.unit, "°C");
        assert_eq!(channel.item_type, ItemType::Number);

        broker.publish_retained(&format!("{}/$nodes", DEVICE), "");
        let events_seen = drain_events(&mut events).await;
        assert_eq!(
            events_seen,
            vec![
                TreeEvent::PropertyRemoved { path: temp_path() },
                TreeEvent::NodeRemoved {
                    device_id: id("d1"),
                    node_id: id("n1"),
                },
            ]
        );
        assert!(device.node_ids().await.is_empty());
        assert!(device.channels().await.is_empty());
        assert!(broker.subscriptions().iter().all(|topic| !topic.starts_with(NODE)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_values_flow_after_start_channels() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        broker.publish_retained(TEMP, "21.5");
        let (mut device, mut events) = device_with_listener(&broker);

        assert!(matches!(
            device.start_channels().await,
            Err(TreeError::NotSubscribed(_))
        ));

        device.subscribe().await.unwrap();
        drain_events(&mut events).await;
        assert!(!broker.is_subscribed(TEMP));

        device.start_channels().await.unwrap();
        assert!(broker.is_subscribed(TEMP));
        assert_eq!(
            next_event(&mut events).await,
            Some(TreeEvent::PropertyValue {
                path: temp_path(),
                value: PropertyValue::Float(21.5),
            })
        );

        broker.publish_retained(TEMP, "not a number");
        broker.publish_retained(TEMP, "22");
        assert_eq!(
            next_event(&mut events).await,
            Some(TreeEvent::PropertyValue {
                path: temp_path(),
                value: PropertyValue::Float(22.0),
            })
        );

        // a second call does not subscribe twice
        device.start_channels().await.unwrap();
        broker.publish_retained(TEMP, "23");
        let events_seen = drain_events(&mut events).await;
        assert_eq!(events_seen.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tree_converges_to_last_nodes_list() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "a,b");
        for node in ["a", "b", "c", "d", "e"] {
            broker.publish_node(&format!("{}/{}", DEVICE, node), "");
        }
        let (mut device, _events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();
        assert_eq!(device.node_ids().await, ids(&["a", "b"]));

        for nodes in ["a,b,c", "c", "d,a,c", "", "e,b,b"] {
            broker.publish_retained(&format!("{}/$nodes", DEVICE), nodes);
        }
        settle().await;
        assert_eq!(device.node_ids().await, ids(&["e", "b"]));

        broker.publish_retained(&format!("{}/$nodes", DEVICE), "d");
        settle().await;
        broker.publish_retained(&format!("{}/$nodes", DEVICE), "a,d");
        settle().await;
        assert_eq!(device.node_ids().await, ids(&["a", "d"]));

        let mut expected = vec![
            "homie/d1/$homie".to_owned(),
            "homie/d1/$name".to_owned(),
            "homie/d1/$nodes".to_owned(),
            "homie/d1/$state".to_owned(),
        ];
        for node in ["a", "d"] {
            for field in ["$name", "$properties", "$type"] {
                expected.push(format!("{}/{}/{}", DEVICE, node, field));
            }
        }
        expected.sort();
        assert_eq!(broker.subscriptions(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_needs_mandatory_attributes() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "n1");
        broker.publish_node(NODE, "temp");
        broker.publish_retained(&format!("{}/$name", TEMP), "Temperature");
        broker.publish_retained(&format!("{}/$settable", TEMP), "false");
        broker.publish_retained(&format!("{}/$retained", TEMP), "true");
        let (mut device, mut events) = device_with_listener(&broker);

        device.subscribe().await.unwrap();
        let events_seen = drain_events(&mut events).await;
        assert!(events_seen
            .iter()
            .all(|event| !matches!(event, TreeEvent::PropertyReady { .. })));
        assert!(device.channels().await.is_empty());
        assert!(matches!(
            device
                .write_command(&id("n1"), &id("temp"), &PropertyValue::Float(1.0))
                .await,
            Err(TreeError::ChannelNotReady(_))
        ));

        // invalid payloads do not count as received
        broker.publish_retained(&format!("{}/$datatype", TEMP), "integer");
        broker.publish_retained(&format!("{}/$settable", TEMP), "maybe");
        let events_seen = drain_events(&mut events).await;
        assert_eq!(events_seen.len(), 1);
        assert!(matches!(
            &events_seen[0],
            TreeEvent::PropertyReady { path, .. } if path == &temp_path()
        ));
        assert_eq!(device.channels().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_format_change_rederives_channel() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "n1");
        broker.publish_node(NODE, "level");
        let level = format!("{}/level", NODE);
        broker.publish_property(&level, "integer", "0:100", true, true);
        let (mut device, mut events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();
        drain_events(&mut events).await;

        broker.publish_retained(&format!("{}/$format", level), "0:1000");
        let events_seen = drain_events(&mut events).await;
        assert_eq!(events_seen.len(), 1);
        let TreeEvent::PropertyChanged { channel, .. } = &events_seen[0] else {
            panic!("expected PropertyChanged, got {:?}", events_seen[0]);
        };
        assert_eq!(
            channel.representation,
            ValueRepresentation::Number {
                min: Some(0.0),
                max: Some(1000.0),
                step: Some(10.0),
                unit: String::new(),
                integer: true,
            }
        );

        // same value again, nothing to announce
        broker.publish_retained(&format!("{}/$format", level), "0:1000");
        assert!(drain_events(&mut events).await.is_empty());

        broker.publish_retained(&format!("{}/$name", NODE), "Renamed");
        let events_seen = drain_events(&mut events).await;
        assert!(matches!(
            &events_seen[..],
            [TreeEvent::NodeChanged { attributes, .. }] if attributes.name == "Renamed"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_cancelled_subscribe() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "n1");
        // n1 never answers, its discovery runs into the timeout
        let (mut device, _events) = device_with_listener(&broker);

        let cancelled = tokio::time::timeout(Duration::from_millis(100), device.subscribe()).await;
        assert!(cancelled.is_err());
        assert!(broker.is_subscribed(&format!("{}/$properties", NODE)));

        device.stop().await;
        assert_eq!(device.state(), EntityState::Stopped);
        assert!(broker.subscriptions().is_empty());

        // stopping twice is fine, reuse is not
        device.stop().await;
        assert!(matches!(
            device.subscribe().await,
            Err(TreeError::Stopped(_))
        ));
        assert!(broker.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cascades_depth_first() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        let (mut device, mut events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();
        device.start_channels().await.unwrap();
        drain_events(&mut events).await;

        device.stop().await;
        assert_eq!(
            drain_events(&mut events).await,
            vec![
                TreeEvent::PropertyRemoved { path: temp_path() },
                TreeEvent::NodeRemoved {
                    device_id: id("d1"),
                    node_id: id("n1"),
                },
                TreeEvent::DeviceRemoved {
                    device_id: id("d1"),
                },
            ]
        );
        assert!(broker.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_removes_device_without_nodes() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "");
        let (mut device, mut events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();
        drain_events(&mut events).await;

        device.stop().await;
        assert_eq!(
            drain_events(&mut events).await,
            vec![TreeEvent::DeviceRemoved {
                device_id: id("d1"),
            }]
        );

        // a device that never got past discovery was never announced
        let (mut fresh, mut events) = device_with_listener(&broker);
        fresh.stop().await;
        assert!(drain_events(&mut events).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_node_is_left_out() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        broker.publish_retained(&format!("{}/$nodes", DEVICE), "n1,n2");
        broker.publish_node(&format!("{}/n2", DEVICE), "");
        broker.fail_subscriptions(&format!("{}/n2/", DEVICE));
        let (mut device, _events) = device_with_listener(&broker);

        device.subscribe().await.unwrap();
        assert_eq!(device.node_ids().await, ids(&["n1"]));
        assert_eq!(device.channels().await.len(), 1);
        assert!(broker
            .subscriptions()
            .iter()
            .all(|topic| !topic.starts_with("homie/d1/n2/")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_device_is_best_effort() {
        let broker = MemoryBroker::new();
        broker.publish_retained(&format!("{}/$name", DEVICE), "Half device");
        let (mut device, _events) = device_with_listener(&broker);

        device.subscribe().await.unwrap();
        assert_eq!(device.state(), EntityState::Ready);
        assert!(!device.is_complete());
        assert!(device.node_ids().await.is_empty());

        // the tree follows once the missing attributes show up
        broker.publish_node(NODE, "");
        broker.publish_retained(&format!("{}/$homie", DEVICE), "4.0.0");
        broker.publish_retained(&format!("{}/$nodes", DEVICE), "n1");
        settle().await;
        assert!(device.is_complete());
        assert_eq!(device.node_ids().await, ids(&["n1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_registration_is_idempotent() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        let mut device = HomieDevice::new(id("d1"), broker.clone(), test_config());
        let (sender, mut events) = mpsc::unbounded_channel();
        assert!(device.add_listener(sender.clone()));
        assert!(!device.add_listener(sender));

        device.subscribe().await.unwrap();
        let events_seen = drain_events(&mut events).await;
        let device_changes = events_seen
            .iter()
            .filter(|event| matches!(event, TreeEvent::DeviceChanged { .. }))
            .count();
        assert_eq!(device_changes, 1);
        assert_eq!(events_seen.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_properties_added_later_start_their_channel() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        let (mut device, mut events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();
        device.start_channels().await.unwrap();
        drain_events(&mut events).await;

        let humidity = format!("{}/humidity", NODE);
        broker.publish_property(&humidity, "integer", "0:100", false, true);
        broker.publish_retained(&humidity, "45");
        broker.publish_retained(&format!("{}/$properties", NODE), "temp,humidity");

        let events_seen = drain_events(&mut events).await;
        let humidity_path = PropertyPath::new(id("d1"), id("n1"), id("humidity"));
        assert!(matches!(
            &events_seen[0],
            TreeEvent::PropertyReady { path, .. } if path == &humidity_path
        ));
        assert_eq!(
            events_seen[1],
            TreeEvent::PropertyValue {
                path: humidity_path,
                value: PropertyValue::Integer(45),
            }
        );
        assert!(broker.is_subscribed(&humidity));
        let channels: Vec<String> = device
            .channels()
            .await
            .into_iter()
            .map(|(_, channel)| channel.uid)
            .collect();
        assert_eq!(channels, vec!["n1/temp", "n1/humidity"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_events() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "n1");
        broker.publish_node(NODE, "button");
        let button = format!("{}/button", NODE);
        broker.publish_property(&button, "enum", "PRESSED,RELEASED", false, false);
        let (mut device, mut events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();
        device.start_channels().await.unwrap();
        drain_events(&mut events).await;

        broker.publish_event(&button, "PRESSED");
        assert_eq!(
            next_event(&mut events).await,
            Some(TreeEvent::PropertyTriggered {
                path: PropertyPath::new(id("d1"), id("n1"), id("button")),
                event: "PRESSED".to_owned(),
            })
        );
        let channel = device
            .channel(&PropertyPath::new(id("d1"), id("n1"), id("button")))
            .await
            .unwrap();
        assert_eq!(channel.kind, ChannelKind::Trigger(TriggerKind::RawButton));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_float_without_format() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "n1");
        broker.publish_node(NODE, "temp");
        broker.publish_property(TEMP, "float", "", false, true);
        let (mut device, _events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();

        let channel = device.channel(&temp_path()).await.unwrap();
        assert_eq!(
            channel.representation,
            ValueRepresentation::Number {
                min: None,
                max: None,
                step: None,
                unit: String::new(),
                integer: false,
            }
        );
        assert_eq!(channel.kind, ChannelKind::State { read_only: true });
        assert_eq!(channel.item_type, ItemType::Number);
        assert_eq!(channel.state_topic.as_deref(), Some(TEMP));
        assert_eq!(channel.command_topic, None);
        assert!(channel.is_read_only());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_command() {
        let broker = MemoryBroker::new();
        broker.publish_device(DEVICE, "n1");
        broker.publish_node(NODE, "power,temp");
        let power = format!("{}/power", NODE);
        broker.publish_property(&power, "boolean", "", true, true);
        broker.publish_property(TEMP, "float", "", false, true);
        let (mut device, _events) = device_with_listener(&broker);
        device.subscribe().await.unwrap();

        device
            .write_command(&id("n1"), &id("power"), &PropertyValue::Bool(true))
            .await
            .unwrap();
        assert_eq!(
            broker.published(),
            vec![(format!("{}/set", power), "true".to_owned(), false)]
        );

        assert!(matches!(
            device
                .write_command(&id("n1"), &id("power"), &PropertyValue::Integer(1))
                .await,
            Err(TreeError::InvalidValue { .. })
        ));
        assert!(matches!(
            device
                .write_command(&id("n1"), &id("temp"), &PropertyValue::Float(1.0))
                .await,
            Err(TreeError::NotSettable(_))
        ));
        assert!(matches!(
            device
                .write_command(&id("n2"), &id("power"), &PropertyValue::Bool(true))
                .await,
            Err(TreeError::UnknownNode(_))
        ));
        assert!(matches!(
            device
                .write_command(&id("n1"), &id("fan"), &PropertyValue::Bool(true))
                .await,
            Err(TreeError::UnknownProperty(_))
        ));
        assert_eq!(broker.published().len(), 1);
    }

    const SNAPSHOT: &str = r#"
attributes:
  homie: "4.0.0"
  name: Cached device
  state: ready
  nodes: [n1]
nodes:
  - id: n1
    attributes:
      name: Climate
      type: sensor
      properties: [temp]
    properties:
      - id: temp
        attributes:
          name: Temperature
          datatype: float
          unit: "°C"
"#;

    #[tokio::test(start_paused = true)]
    async fn test_restore_from_snapshot() {
        let broker = MemoryBroker::new();
        let snapshot: DeviceSnapshot = serde_yml::from_str(SNAPSHOT).unwrap();
        let (mut device, mut events) = device_with_listener(&broker);

        device.restore(&snapshot).await.unwrap();
        assert_eq!(device.state(), EntityState::Ready);
        assert!(broker.subscriptions().is_empty());
        let events_seen = drain_events(&mut events).await;
        assert!(matches!(&events_seen[0], TreeEvent::NodeAdded { node_id, .. } if node_id.as_str() == "n1"));
        assert!(matches!(&events_seen[1], TreeEvent::PropertyReady { path, .. } if path == &temp_path()));
        assert_eq!(device.snapshot().await, snapshot);

        device.start_channels().await.unwrap();
        assert_eq!(broker.subscriptions(), vec![TEMP.to_owned()]);
        broker.publish_retained(TEMP, "19.5");
        assert_eq!(
            next_event(&mut events).await,
            Some(TreeEvent::PropertyValue {
                path: temp_path(),
                value: PropertyValue::Float(19.5),
            })
        );

        assert!(matches!(
            device.restore(&snapshot).await,
            Err(TreeError::AlreadySubscribed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_node_is_retried_after_failed_subscribe() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        broker.fail_subscriptions(&format!("{}/", NODE));
        let snapshot: DeviceSnapshot = serde_yml::from_str(SNAPSHOT).unwrap();
        let (mut device, _events) = device_with_listener(&broker);
        device.restore(&snapshot).await.unwrap();

        device.subscribe().await.unwrap();
        assert_eq!(device.node_ids().await, ids(&["n1"]));
        assert!(!broker.is_subscribed(&format!("{}/$properties", NODE)));

        broker.allow_subscriptions(&format!("{}/", NODE));
        device.subscribe().await.unwrap();
        assert!(broker.is_subscribed(&format!("{}/$properties", NODE)));
        assert!(broker.is_subscribed(&format!("{}/$datatype", TEMP)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_refreshes_restored_tree() {
        let broker = MemoryBroker::new();
        publish_thermometer(&broker);
        let snapshot: DeviceSnapshot = serde_yml::from_str(SNAPSHOT).unwrap();
        let (mut device, mut events) = device_with_listener(&broker);
        device.restore(&snapshot).await.unwrap();
        drain_events(&mut events).await;

        device.subscribe().await.unwrap();
        assert!(broker.is_subscribed(&format!("{}/$datatype", TEMP)));
        let events_seen = drain_events(&mut events).await;
        // the broker reports a different name, format and unit for temp
        assert!(events_seen.iter().any(|event| matches!(
            event,
            TreeEvent::PropertyChanged { channel, .. } if channel.label == "Test property"
        )));
        assert!(events_seen
            .iter()
            .all(|event| !matches!(event, TreeEvent::NodeAdded { .. })));
    }
}
