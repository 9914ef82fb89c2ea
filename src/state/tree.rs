//! In-memory node → service → datatype → channel tree.
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::protocol::{wire_name, Scalar, FIELD_SERVICE_ID, SERVICE_MANAGER_ID};
use crate::state::changeset::ChangePath;
use crate::storage::RecordValue;

/// Declared number of producer and consumer channels of one datatype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCounts {
    pub publish: u32,
    pub accept: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub id: u8,
    pub discovered: bool,
    pub counts: BTreeMap<String, ChannelCounts>,
    pub values: BTreeMap<String, Vec<Scalar>>,
}

impl Service {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            discovered: false,
            counts: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn publish_count(&self, data_type: &str) -> u32 {
        self.counts.get(data_type).map(|c| c.publish).unwrap_or(0)
    }

    /// `None` when the description never mentioned the type.
    pub fn accept_count(&self, data_type: &str) -> Option<u32> {
        self.counts.get(data_type).map(|c| c.accept)
    }

    pub fn values(&self, data_type: &str) -> &[Scalar] {
        self.values.get(data_type).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn value(&self, data_type: &str, index: usize) -> Option<&Scalar> {
        self.values(data_type).get(index)
    }

    /// Store one channel value, padding skipped slots with nulls. Returns true when
    /// the stored value changed.
    pub fn set_value(&mut self, data_type: &str, index: usize, value: Scalar) -> bool {
        let slots = self.values.entry(data_type.to_string()).or_default();
        if index < slots.len() {
            if slots[index].same_value(&value) {
                return false;
            }
            slots[index] = value;
            return true;
        }
        slots.resize(index, Scalar::Null);
        slots.push(value);
        true
    }

    /// The single boolean consumer channel, when the service declares exactly one
    /// consumer channel in total and it is boolean.
    pub fn toggle_target(&self) -> Option<(&str, usize)> {
        let mut accepting = self.counts.iter().filter(|(_, c)| c.accept > 0);
        let (data_type, counts) = accepting.next()?;
        if counts.accept != 1 || accepting.next().is_some() {
            return None;
        }
        let info = crate::protocol::lookup_datatype(data_type)?;
        if info.kind != crate::protocol::BasicKind::Bool {
            return None;
        }
        Some((data_type.as_str(), counts.publish as usize))
    }

    pub fn to_json(&self) -> Value {
        let mut counts = Map::new();
        for (data_type, c) in &self.counts {
            counts.insert(
                wire_name(data_type).to_string(),
                json!({ "publish": c.publish, "accept": c.accept }),
            );
        }
        let mut values = Map::new();
        for (data_type, slots) in &self.values {
            values.insert(
                wire_name(data_type).to_string(),
                Value::Array(slots.iter().map(Scalar::to_json).collect()),
            );
        }
        json!({
            "discovered": self.discovered,
            "counts": counts,
            "values": values,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub addr: u8,
    pub discovered: bool,
    /// Name of the Base the node was last heard through.
    pub base: Option<String>,
    pub services: BTreeMap<u8, Service>,
}

impl Node {
    pub fn new(addr: u8) -> Self {
        Self {
            addr,
            discovered: false,
            base: None,
            services: BTreeMap::new(),
        }
    }

    pub fn service(&self, id: u8) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn service_mut(&mut self, id: u8) -> Option<&mut Service> {
        self.services.get_mut(&id)
    }

    /// Service ids announced by the node's service manager.
    pub fn listed_services(&self) -> Vec<u8> {
        self.service(SERVICE_MANAGER_ID)
            .map(|svc| {
                svc.values(FIELD_SERVICE_ID)
                    .iter()
                    .filter_map(|v| match v {
                        Scalar::Int(id) => u8::try_from(*id).ok(),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn to_json(&self) -> Value {
        let mut services = Map::new();
        for (id, svc) in &self.services {
            services.insert(id.to_string(), svc.to_json());
        }
        json!({
            "discovered": self.discovered,
            "base": self.base,
            "services": services,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateTree {
    nodes: BTreeMap<u8, Node>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, addr: u8) -> Option<&Node> {
        self.nodes.get(&addr)
    }

    pub fn node_mut(&mut self, addr: u8) -> Option<&mut Node> {
        self.nodes.get_mut(&addr)
    }

    pub fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.addr, node);
    }

    pub fn remove_node(&mut self, addr: u8) -> Option<Node> {
        self.nodes.remove(&addr)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn service(&self, addr: u8, id: u8) -> Option<&Service> {
        self.node(addr).and_then(|n| n.service(id))
    }

    /// Apply one persisted row, creating missing ancestors on the way.
    pub fn apply_record(&mut self, path: &ChangePath, value: &RecordValue) {
        let node = self
            .nodes
            .entry(path.node())
            .or_insert_with(|| Node::new(path.node()));
        if let (ChangePath::Node(_), RecordValue::Node { discovered, base }) = (path, value) {
            node.discovered = *discovered;
            node.base = base.clone();
            return;
        }
        let Some(service_id) = path.service() else {
            return;
        };
        let service = node
            .services
            .entry(service_id)
            .or_insert_with(|| Service::new(service_id));
        match (path, value) {
            (ChangePath::Service(..), RecordValue::Service { discovered }) => {
                service.discovered = *discovered;
            }
            (ChangePath::DataType(_, _, data_type), RecordValue::Counts(counts)) => {
                service.counts.insert(data_type.clone(), *counts);
            }
            (ChangePath::Channel(_, _, data_type, index), RecordValue::Channel(v)) => {
                service.set_value(data_type, *index as usize, v.clone());
            }
            _ => {}
        }
    }

    pub fn to_json(&self) -> Value {
        let mut nodes = Map::new();
        for (addr, node) in &self.nodes {
            nodes.insert(addr.to_string(), node.to_json());
        }
        Value::Object(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_value_pads_and_reports_changes() {
        let mut svc = Service::new(2);
        assert!(svc.set_value("switch", 2, Scalar::Bool(true)));
        assert_eq!(
            svc.values("switch"),
            &[Scalar::Null, Scalar::Null, Scalar::Bool(true)]
        );
        assert!(!svc.set_value("switch", 2, Scalar::Bool(true)));
        assert!(svc.set_value("switch", 0, Scalar::Bool(false)));

        assert!(svc.set_value("temperature", 0, Scalar::Int(21)));
        assert!(!svc.set_value("temperature", 0, Scalar::Float(21.0)));
        assert_eq!(svc.value("temperature", 0), Some(&Scalar::Int(21)));
    }

    #[test]
    fn toggle_needs_exactly_one_boolean_consumer() {
        let mut svc = Service::new(2);
        svc.counts.insert(
            "switch".into(),
            ChannelCounts {
                publish: 1,
                accept: 1,
            },
        );
        assert_eq!(svc.toggle_target(), Some(("switch", 1)));

        svc.counts.insert(
            "temperature".into(),
            ChannelCounts {
                publish: 0,
                accept: 1,
            },
        );
        assert_eq!(svc.toggle_target(), None);

        let mut dimmer = Service::new(3);
        dimmer.counts.insert(
            "power".into(),
            ChannelCounts {
                publish: 0,
                accept: 1,
            },
        );
        assert_eq!(dimmer.toggle_target(), None);
    }

    #[test]
    fn records_rebuild_missing_ancestors() {
        let mut tree = StateTree::new();
        tree.apply_record(
            &ChangePath::Channel(7, 1, "temperature".into(), 1),
            &RecordValue::Channel(Scalar::Float(19.5)),
        );
        let svc = tree.service(7, 1).unwrap();
        assert_eq!(svc.values("temperature"), &[Scalar::Null, Scalar::Float(19.5)]);
        assert!(!tree.node(7).unwrap().discovered);

        tree.apply_record(
            &ChangePath::Node(7),
            &RecordValue::Node {
                discovered: true,
                base: Some("attic".into()),
            },
        );
        let node = tree.node(7).unwrap();
        assert!(node.discovered);
        assert_eq!(node.base.as_deref(), Some("attic"));
        assert_eq!(node.services.len(), 1);
    }

    #[test]
    fn service_manager_lists_services() {
        let mut node = Node::new(3);
        let mut mgr = Service::new(0);
        mgr.set_value("serviceid", 0, Scalar::Int(2));
        mgr.set_value("serviceid", 1, Scalar::Int(5));
        node.services.insert(0, mgr);
        assert_eq!(node.listed_services(), vec![2, 5]);
    }

    #[test]
    fn json_uses_wire_spelling() {
        let mut tree = StateTree::new();
        tree.apply_record(
            &ChangePath::Channel(1, 4, "relativehumidity".into(), 0),
            &RecordValue::Channel(Scalar::Float(40.0)),
        );
        let out = tree.to_json();
        assert_eq!(
            out["1"]["services"]["4"]["values"]["relativeHumidity"],
            json!([40.0])
        );
        assert_eq!(out["1"]["base"], Value::Null);
    }
}
