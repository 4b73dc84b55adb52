use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::expr::evaluate_condition;
use crate::model::{Connection, ElementKind};

/// Outcome of evaluating a gateway: which flows to follow and which were
/// rejected. Not-taken flows feed the skipped-path marking pass so observers
/// can grey out dead branches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GatewayDecision {
    /// `(connection id, target element id)` in definition order.
    pub taken: Vec<(String, String)>,
    pub not_taken: Vec<(String, String)>,
}

impl GatewayDecision {
    pub fn taken_flow_ids(&self) -> Vec<String> {
        self.taken.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn not_taken_flow_ids(&self) -> Vec<String> {
        self.not_taken.iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Evaluate a gateway's outgoing flows against the context.
///
/// Only `properties.condition` is consulted; flow display names never alter
/// routing. An empty condition means "default" for XOR and "unconditional"
/// for inclusive/parallel.
pub fn evaluate(
    kind: ElementKind,
    gateway_id: &str,
    outgoing: &[&Connection],
    ctx: &Context,
) -> EngineResult<GatewayDecision> {
    match kind {
        ElementKind::ExclusiveGateway => evaluate_exclusive(gateway_id, outgoing, ctx),
        ElementKind::ParallelGateway => Ok(GatewayDecision {
            // conditions on parallel flows are ignored by definition
            taken: outgoing
                .iter()
                .map(|c| (c.id.clone(), c.to.clone()))
                .collect(),
            not_taken: Vec::new(),
        }),
        ElementKind::InclusiveGateway => evaluate_inclusive(gateway_id, outgoing, ctx),
        other => Err(EngineError::Executor(format!(
            "element `{gateway_id}` of kind {} is not a gateway",
            other.label()
        ))),
    }
}

/// XOR: first truthy condition in definition order wins; the default (empty
/// condition) is only taken when nothing matched.
fn evaluate_exclusive(
    gateway_id: &str,
    outgoing: &[&Connection],
    ctx: &Context,
) -> EngineResult<GatewayDecision> {
    let mut default: Option<&Connection> = None;
    let mut winner: Option<&Connection> = None;

    for conn in outgoing {
        match conn.condition() {
            None => {
                if default.is_none() {
                    default = Some(conn);
                }
            }
            Some(cond) => {
                let matched = evaluate_condition(cond, ctx).map_err(|err| {
                    tracing::warn!(gateway = gateway_id, condition = %err.condition, reason = %err.reason,
                        "condition evaluation failed, no path can be chosen");
                    EngineError::NoMatchingPath {
                        gateway: gateway_id.to_string(),
                    }
                })?;
                if matched {
                    winner = Some(conn);
                    break;
                }
            }
        }
    }

    let chosen = winner.or(default).ok_or_else(|| EngineError::NoMatchingPath {
        gateway: gateway_id.to_string(),
    })?;

    let mut decision = GatewayDecision::default();
    for conn in outgoing {
        if conn.id == chosen.id {
            decision.taken.push((conn.id.clone(), conn.to.clone()));
        } else {
            decision.not_taken.push((conn.id.clone(), conn.to.clone()));
        }
    }
    Ok(decision)
}

/// OR: every flow whose condition is empty or truthy; at least one must fire.
fn evaluate_inclusive(
    gateway_id: &str,
    outgoing: &[&Connection],
    ctx: &Context,
) -> EngineResult<GatewayDecision> {
    let mut decision = GatewayDecision::default();
    for conn in outgoing {
        let take = match conn.condition() {
            None => true,
            Some(cond) => evaluate_condition(cond, ctx).map_err(|err| {
                tracing::warn!(gateway = gateway_id, condition = %err.condition, reason = %err.reason,
                    "condition evaluation failed, no path can be chosen");
                EngineError::NoMatchingPath {
                    gateway: gateway_id.to_string(),
                }
            })?,
        };
        if take {
            decision.taken.push((conn.id.clone(), conn.to.clone()));
        } else {
            decision.not_taken.push((conn.id.clone(), conn.to.clone()));
        }
    }

    if decision.taken.is_empty() {
        return Err(EngineError::NoMatchingPath {
            gateway: gateway_id.to_string(),
        });
    }
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn(id: &str, to: &str, condition: Option<&str>, name: &str) -> Connection {
        let mut properties = serde_json::Map::new();
        if let Some(c) = condition {
            properties.insert("condition".to_string(), json!(c));
        }
        Connection {
            id: id.to_string(),
            from: "gw".to_string(),
            to: to.to_string(),
            name: name.to_string(),
            properties,
        }
    }

    fn ctx(value: serde_json::Value) -> Context {
        match value {
            serde_json::Value::Object(map) => Context::new(map),
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn exclusive_first_truthy_wins() {
        let a = conn("f1", "a", Some("${x} > 10"), "");
        let b = conn("f2", "b", Some("${x} > 5"), "");
        let c = conn("f3", "c", None, "");
        let decision = evaluate(
            ElementKind::ExclusiveGateway,
            "gw",
            &[&a, &b, &c],
            &ctx(json!({"x": 7})),
        )
        .unwrap();
        assert_eq!(decision.taken, vec![("f2".to_string(), "b".to_string())]);
        assert_eq!(decision.not_taken.len(), 2);
    }

    #[test]
    fn exclusive_default_only_when_nothing_matches() {
        let a = conn("f1", "a", Some("${x} > 10"), "");
        let b = conn("f2", "b", None, "");
        let hit = evaluate(
            ElementKind::ExclusiveGateway,
            "gw",
            &[&a, &b],
            &ctx(json!({"x": 99})),
        )
        .unwrap();
        assert_eq!(hit.taken, vec![("f1".to_string(), "a".to_string())]);

        let fallback = evaluate(
            ElementKind::ExclusiveGateway,
            "gw",
            &[&a, &b],
            &ctx(json!({"x": 1})),
        )
        .unwrap();
        assert_eq!(fallback.taken, vec![("f2".to_string(), "b".to_string())]);
    }

    #[test]
    fn exclusive_no_default_no_match_fails() {
        let a = conn("f1", "a", Some("${x} > 10"), "");
        let err = evaluate(
            ElementKind::ExclusiveGateway,
            "gw",
            &[&a],
            &ctx(json!({"x": 1})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingPath { .. }));
    }

    /// Renaming a flow must not change the decision when conditions are
    /// unchanged.
    #[test]
    fn flow_name_never_alters_control_flow() {
        let context = ctx(json!({"x": 3}));
        let a1 = conn("f1", "a", Some("${x} > 10"), "Approved");
        let b1 = conn("f2", "b", None, "Rejected");
        let before = evaluate(ElementKind::ExclusiveGateway, "gw", &[&a1, &b1], &context).unwrap();

        let a2 = conn("f1", "a", Some("${x} > 10"), "Totally Different");
        let b2 = conn("f2", "b", None, "Also Renamed");
        let after = evaluate(ElementKind::ExclusiveGateway, "gw", &[&a2, &b2], &context).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn parallel_takes_everything_ignoring_conditions() {
        let a = conn("f1", "a", Some("false"), "");
        let b = conn("f2", "b", None, "");
        let decision = evaluate(ElementKind::ParallelGateway, "gw", &[&a, &b], &Context::default())
            .unwrap();
        assert_eq!(decision.taken.len(), 2);
        assert!(decision.not_taken.is_empty());
    }

    #[test]
    fn inclusive_takes_empty_and_truthy() {
        let a = conn("f1", "a", Some("${x} > 1"), "");
        let b = conn("f2", "b", None, "");
        let c = conn("f3", "c", Some("${x} > 100"), "");
        let decision = evaluate(
            ElementKind::InclusiveGateway,
            "gw",
            &[&a, &b, &c],
            &ctx(json!({"x": 5})),
        )
        .unwrap();
        assert_eq!(decision.taken.len(), 2);
        assert_eq!(decision.not_taken, vec![("f3".to_string(), "c".to_string())]);
    }

    #[test]
    fn inclusive_must_take_at_least_one() {
        let a = conn("f1", "a", Some("${x} > 1"), "");
        let err = evaluate(
            ElementKind::InclusiveGateway,
            "gw",
            &[&a],
            &ctx(json!({"x": 0})),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingPath { .. }));
    }
}
