use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

pub type PropertyMap = serde_json::Map<String, Value>;

// ─── Element kinds ────────────────────────────────────────────

/// Every element kind the interpreter understands. Unknown kinds fail
/// deserialization, which the loader surfaces as `MalformedDefinition`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementKind {
    StartEvent,
    EndEvent,
    IntermediateEvent,
    TimerIntermediateCatchEvent,
    BoundaryTimerEvent,
    Task,
    UserTask,
    ServiceTask,
    ScriptTask,
    SendTask,
    ReceiveTask,
    ManualTask,
    BusinessRuleTask,
    AgenticTask,
    SubProcess,
    CallActivity,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
}

impl ElementKind {
    pub fn is_gateway(self) -> bool {
        matches!(
            self,
            ElementKind::ExclusiveGateway
                | ElementKind::ParallelGateway
                | ElementKind::InclusiveGateway
        )
    }

    pub fn is_end(self) -> bool {
        matches!(self, ElementKind::EndEvent)
    }

    pub fn label(self) -> &'static str {
        match self {
            ElementKind::StartEvent => "startEvent",
            ElementKind::EndEvent => "endEvent",
            ElementKind::IntermediateEvent => "intermediateEvent",
            ElementKind::TimerIntermediateCatchEvent => "timerIntermediateCatchEvent",
            ElementKind::BoundaryTimerEvent => "boundaryTimerEvent",
            ElementKind::Task => "task",
            ElementKind::UserTask => "userTask",
            ElementKind::ServiceTask => "serviceTask",
            ElementKind::ScriptTask => "scriptTask",
            ElementKind::SendTask => "sendTask",
            ElementKind::ReceiveTask => "receiveTask",
            ElementKind::ManualTask => "manualTask",
            ElementKind::BusinessRuleTask => "businessRuleTask",
            ElementKind::AgenticTask => "agenticTask",
            ElementKind::SubProcess => "subProcess",
            ElementKind::CallActivity => "callActivity",
            ElementKind::ExclusiveGateway => "exclusiveGateway",
            ElementKind::ParallelGateway => "parallelGateway",
            ElementKind::InclusiveGateway => "inclusiveGateway",
        }
    }
}

// ─── Definition structs (immutable after load) ────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    pub kind: ElementKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: PropertyMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane_id: Option<String>,
    /// Sub-process child graph. Only meaningful for `subProcess` elements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_elements: Vec<Element>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_connections: Vec<Connection>,
    #[serde(default)]
    pub expanded: bool,
}

impl Element {
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// String property; numbers and booleans are rendered, null/absent is None.
    pub fn prop_str(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn prop_bool(&self, key: &str) -> bool {
        match self.properties.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
            _ => false,
        }
    }

    pub fn prop_f64(&self, key: &str) -> Option<f64> {
        match self.properties.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn prop_u32(&self, key: &str) -> Option<u32> {
        self.prop_f64(key).map(|f| f.max(0.0) as u32)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A sequence flow. Routing consults only `properties.condition`; the display
/// `name` is never interpreted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl Connection {
    /// The routing condition, if one is declared and non-empty.
    /// Empty means "default" (XOR) or "unconditional" (inclusive/parallel).
    pub fn condition(&self) -> Option<&str> {
        match self.properties.get("condition") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lane {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lanes: Vec<Lane>,
}

/// An immutable process definition. Element and connection order is
/// preserved from the source document because exclusive-gateway evaluation
/// depends on connection order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub pools: Vec<Pool>,
}

impl ProcessDefinition {
    /// Parse a YAML document into a definition. Structural invariants are
    /// checked separately by `validate()`; the engine façade runs both.
    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| EngineError::MalformedDefinition(e.to_string()))
    }

    /// Enforce the load-time invariants:
    /// - every connection endpoint resolves to an element (including
    ///   sub-process children),
    /// - exactly one start event per scope,
    /// - XOR gateways with multiple outgoing flows carry at most one default,
    /// - parallel joins have exactly one outgoing flow,
    /// - boundary timers attach to an element in their scope.
    pub fn validate(&self) -> EngineResult<()> {
        validate_scope(&self.elements, &self.connections, "process")
    }
}

fn validate_scope(elements: &[Element], connections: &[Connection], scope: &str) -> EngineResult<()> {
    let ids: HashSet<&str> = collect_ids(elements).into_iter().collect();
    let local_ids: HashSet<&str> = elements.iter().map(|e| e.id.as_str()).collect();

    for conn in connections {
        if !ids.contains(conn.from.as_str()) {
            return Err(EngineError::MalformedDefinition(format!(
                "{scope}: connection `{}` references unknown source `{}`",
                conn.id, conn.from
            )));
        }
        if !ids.contains(conn.to.as_str()) {
            return Err(EngineError::MalformedDefinition(format!(
                "{scope}: connection `{}` references unknown target `{}`",
                conn.id, conn.to
            )));
        }
    }

    let starts = elements
        .iter()
        .filter(|e| e.kind == ElementKind::StartEvent)
        .count();
    if starts != 1 {
        return Err(EngineError::MalformedDefinition(format!(
            "{scope}: expected exactly one start event, found {starts}"
        )));
    }

    for element in elements {
        let outgoing: Vec<&Connection> = connections.iter().filter(|c| c.from == element.id).collect();
        let incoming = connections.iter().filter(|c| c.to == element.id).count();

        match element.kind {
            ElementKind::ExclusiveGateway if outgoing.len() > 1 => {
                let defaults = outgoing.iter().filter(|c| c.condition().is_none()).count();
                if defaults > 1 {
                    return Err(EngineError::MalformedDefinition(format!(
                        "{scope}: exclusive gateway `{}` has {defaults} default flows, at most one allowed",
                        element.id
                    )));
                }
            }
            ElementKind::ParallelGateway if incoming >= 2 && outgoing.len() != 1 => {
                return Err(EngineError::MalformedDefinition(format!(
                    "{scope}: parallel join `{}` must have exactly one outgoing flow, found {}",
                    element.id,
                    outgoing.len()
                )));
            }
            ElementKind::BoundaryTimerEvent => {
                let attached = element.prop_str("attachedTo").unwrap_or_default();
                if !local_ids.contains(attached.as_str()) {
                    return Err(EngineError::MalformedDefinition(format!(
                        "{scope}: boundary timer `{}` attached to unknown element `{attached}`",
                        element.id
                    )));
                }
            }
            _ => {}
        }

        if element.kind == ElementKind::SubProcess && !element.child_elements.is_empty() {
            validate_scope(
                &element.child_elements,
                &element.child_connections,
                &format!("subProcess `{}`", element.id),
            )?;
        }
    }

    Ok(())
}

fn collect_ids(elements: &[Element]) -> Vec<&str> {
    let mut out = Vec::new();
    for e in elements {
        out.push(e.id.as_str());
        out.extend(collect_ids(&e.child_elements));
    }
    out
}

// ─── Flow scope (one interpretable graph level) ───────────────

/// One level of the process graph: either the top-level process or the
/// child graph of an expanded sub-process. The scheduler owns one scope per
/// recursion level.
#[derive(Clone)]
pub struct FlowScope {
    pub elements: Arc<Vec<Element>>,
    pub connections: Arc<Vec<Connection>>,
}

impl FlowScope {
    pub fn root(def: &ProcessDefinition) -> Self {
        Self {
            elements: Arc::new(def.elements.clone()),
            connections: Arc::new(def.connections.clone()),
        }
    }

    pub fn child_of(sub_process: &Element) -> Self {
        Self {
            elements: Arc::new(sub_process.child_elements.clone()),
            connections: Arc::new(sub_process.child_connections.clone()),
        }
    }

    pub fn element(&self, id: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Outgoing flows in definition order. Boundary events are not flow
    /// targets of their host, so no filtering is needed here.
    pub fn outgoing(&self, id: &str) -> Vec<&Connection> {
        self.connections.iter().filter(|c| c.from == id).collect()
    }

    pub fn incoming(&self, id: &str) -> Vec<&Connection> {
        self.connections.iter().filter(|c| c.to == id).collect()
    }

    pub fn start_event(&self) -> Option<&Element> {
        self.elements.iter().find(|e| e.kind == ElementKind::StartEvent)
    }

    /// Boundary timer events attached to the given activity.
    pub fn boundary_timers_for(&self, activity_id: &str) -> Vec<&Element> {
        self.elements
            .iter()
            .filter(|e| {
                e.kind == ElementKind::BoundaryTimerEvent
                    && e.prop_str("attachedTo").as_deref() == Some(activity_id)
            })
            .collect()
    }

    /// True if the element is a converging parallel/inclusive gateway.
    pub fn is_join(&self, element: &Element) -> bool {
        matches!(
            element.kind,
            ElementKind::ParallelGateway | ElementKind::InclusiveGateway
        ) && self.incoming(&element.id).len() >= 2
    }

    /// Forward reachability over sequence flows from a set of seed elements.
    /// Cycles are handled by the DFS discovery set.
    pub fn reachable_from<'a>(&'a self, seeds: impl IntoIterator<Item = &'a str>) -> HashSet<&'a str> {
        use petgraph::graphmap::DiGraphMap;
        use petgraph::visit::Dfs;

        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for e in self.elements.iter() {
            graph.add_node(e.id.as_str());
        }
        for c in self.connections.iter() {
            graph.add_edge(c.from.as_str(), c.to.as_str(), ());
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut seeds = seeds.into_iter();
        let Some(first) = seeds.next() else {
            return seen;
        };
        if !graph.contains_node(first) {
            graph.add_node(first);
        }
        let mut dfs = Dfs::new(&graph, first);
        while let Some(node) = dfs.next(&graph) {
            seen.insert(node);
        }
        for seed in seeds {
            if graph.contains_node(seed) {
                dfs.move_to(seed);
                while let Some(node) = dfs.next(&graph) {
                    seen.insert(node);
                }
            }
        }
        seen
    }
}
