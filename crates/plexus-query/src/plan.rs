use std::collections::{BTreeSet, HashSet};
use std::fmt::{self, Write as _};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use plexus_records::{values_equal, FilterSpec, KindTag, QueryParams, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::list::TraceEntry;
use crate::sort::sort_records;
use crate::{QueryError, ReplaySource};

/// Host-language predicate used by [`WhereClause::Custom`].
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Record) -> bool + Send + Sync>);

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn test(&self, record: &Record) -> bool {
        (self.0)(record)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WhereClause {
    Eq {
        field: String,
        value: Value,
    },
    Ne {
        field: String,
        value: Value,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    Contains {
        field: String,
        needle: String,
    },
    /// Serializes as its label only, so it never replays remotely.
    Custom {
        label: String,
        #[serde(skip)]
        predicate: Option<Predicate>,
    },
}

impl WhereClause {
    pub fn label(&self) -> String {
        match self {
            WhereClause::Eq { field, .. } => format!("where_eq({field})"),
            WhereClause::Ne { field, .. } => format!("where_ne({field})"),
            WhereClause::In { field, .. } => format!("where_in({field})"),
            WhereClause::Contains { field, .. } => format!("where_contains({field})"),
            WhereClause::Custom { label, .. } => format!("where({label})"),
        }
    }

    /// `None` when the clause lost its predicate crossing a process boundary.
    pub fn test(&self, record: &Record) -> Option<bool> {
        let hit = match self {
            WhereClause::Eq { field, value } => record
                .field(field)
                .is_some_and(|actual| values_equal(&actual, value)),
            WhereClause::Ne { field, value } => !record
                .field(field)
                .is_some_and(|actual| values_equal(&actual, value)),
            WhereClause::In { field, values } => record
                .field(field)
                .is_some_and(|actual| values.iter().any(|v| values_equal(&actual, v))),
            WhereClause::Contains { field, needle } => match record.field(field) {
                Some(Value::String(s)) => s.contains(needle.as_str()),
                Some(Value::Array(items)) => items.iter().any(|v| v.as_str() == Some(needle.as_str())),
                _ => false,
            },
            WhereClause::Custom { predicate, .. } => return predicate.as_ref().map(|p| p.test(record)),
        };
        Some(hit)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UnaryOp {
    Filter {
        spec: FilterSpec,
    },
    Sort {
        by: Vec<String>,
        #[serde(default)]
        reverse: bool,
    },
    Limit {
        n: usize,
    },
    Where {
        clause: WhereClause,
    },
}

impl UnaryOp {
    pub fn label(&self) -> String {
        match self {
            UnaryOp::Filter { .. } => "filter".to_string(),
            UnaryOp::Sort { by, reverse } => {
                format!("sort({}{})", by.join(","), if *reverse { ", reverse" } else { "" })
            }
            UnaryOp::Limit { n } => format!("limit({n})"),
            UnaryOp::Where { clause } => clause.label(),
        }
    }

    pub fn is_raw_predicate(&self) -> bool {
        matches!(
            self,
            UnaryOp::Where {
                clause: WhereClause::Custom { .. }
            }
        )
    }

    pub fn apply(&self, items: Vec<Record>) -> Result<Vec<Record>, QueryError> {
        match self {
            UnaryOp::Filter { spec } => {
                let filter = spec.clone().compile()?;
                Ok(items.into_iter().filter(|r| filter.matches(r)).collect())
            }
            UnaryOp::Sort { by, reverse } => Ok(sort_records(items, by, *reverse)),
            UnaryOp::Limit { n } => Ok(items.into_iter().take(*n).collect()),
            UnaryOp::Where { clause } => {
                let mut out = Vec::with_capacity(items.len());
                for record in items {
                    match clause.test(&record) {
                        Some(true) => out.push(record),
                        Some(false) => {}
                        None => return Err(QueryError::Unreplayable(clause.label())),
                    }
                }
                Ok(out)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Merge,
    Intersect,
    Difference,
}

impl BinaryOp {
    pub fn label(&self) -> &'static str {
        match self {
            BinaryOp::Merge => "merge",
            BinaryOp::Intersect => "intersect",
            BinaryOp::Difference => "difference",
        }
    }

    /// Key-based set semantics. The output never holds two records with the
    /// same dedupe key; the first occurrence wins.
    pub fn apply(&self, left: Vec<Record>, right: Vec<Record>) -> Vec<Record> {
        let mut seen = HashSet::new();
        match self {
            BinaryOp::Merge => left
                .into_iter()
                .chain(right)
                .filter(|r| seen.insert(r.dedupe_key()))
                .collect(),
            BinaryOp::Intersect | BinaryOp::Difference => {
                let right_keys: HashSet<String> = right.iter().map(Record::dedupe_key).collect();
                let keep_common = *self == BinaryOp::Intersect;
                left.into_iter()
                    .filter(|r| {
                        let key = r.dedupe_key();
                        right_keys.contains(&key) == keep_common && seen.insert(key)
                    })
                    .collect()
            }
        }
    }
}

/// How a list was derived.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Plan {
    Get {
        bus: String,
        #[serde(default)]
        params: QueryParams,
    },
    Unary {
        op: UnaryOp,
        child: Box<Plan>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Plan>,
        right: Box<Plan>,
    },
}

pub(crate) struct Evaluated {
    pub items: Vec<Record>,
    pub trace: Vec<TraceEntry>,
}

impl Plan {
    pub fn get(bus: impl Into<String>, params: QueryParams) -> Self {
        Plan::Get {
            bus: bus.into(),
            params,
        }
    }

    pub fn unary(op: UnaryOp, child: Plan) -> Self {
        Plan::Unary {
            op,
            child: Box::new(child),
        }
    }

    pub fn binary(op: BinaryOp, left: Plan, right: Plan) -> Self {
        Plan::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn buses(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_buses(&mut out);
        out
    }

    fn collect_buses(&self, out: &mut BTreeSet<String>) {
        match self {
            Plan::Get { bus, .. } => {
                out.insert(bus.clone());
            }
            Plan::Unary { child, .. } => child.collect_buses(out),
            Plan::Binary { left, right, .. } => {
                left.collect_buses(out);
                right.collect_buses(out);
            }
        }
    }

    /// The one bus every leaf reads from.
    pub fn single_bus(&self) -> Result<String, QueryError> {
        let buses = self.buses();
        if buses.len() > 1 {
            return Err(QueryError::MixedBuses(buses.into_iter().collect()));
        }
        buses
            .into_iter()
            .next()
            .ok_or_else(|| QueryError::InvalidPlan("plan has no get leaf".into()))
    }

    /// For a plan made only of unary operations over a single `Get`, returns
    /// that leaf and the operations innermost first.
    pub fn linear_chain(&self) -> Option<(&str, &QueryParams, Vec<&UnaryOp>)> {
        let mut ops = Vec::new();
        let mut node = self;
        loop {
            match node {
                Plan::Get { bus, params } => {
                    ops.reverse();
                    return Some((bus.as_str(), params, ops));
                }
                Plan::Unary { op, child } => {
                    ops.push(op);
                    node = child;
                }
                Plan::Binary { .. } => return None,
            }
        }
    }

    pub fn has_raw_predicate(&self) -> bool {
        match self {
            Plan::Get { .. } => false,
            Plan::Unary { op, child } => op.is_raw_predicate() || child.has_raw_predicate(),
            Plan::Binary { left, right, .. } => left.has_raw_predicate() || right.has_raw_predicate(),
        }
    }

    /// Whether the plan survives serialization intact.
    pub fn is_remote_replayable(&self) -> bool {
        !self.has_raw_predicate()
    }

    pub fn kind_hint(&self) -> Option<KindTag> {
        match self {
            Plan::Get { bus, params } => params.kind.or_else(|| KindTag::for_bus(bus)),
            Plan::Unary { child, .. } => child.kind_hint(),
            Plan::Binary { left, right, .. } => {
                let l = left.kind_hint();
                (l == right.kind_hint()).then_some(l).flatten()
            }
        }
    }

    pub(crate) fn evaluate<'a, S>(
        &'a self,
        source: &'a S,
    ) -> BoxFuture<'a, Result<Evaluated, QueryError>>
    where
        S: ReplaySource + ?Sized,
    {
        Box::pin(async move {
            match self {
                Plan::Get { bus, params } => {
                    let items = source.fetch(bus, params).await?;
                    let trace = vec![TraceEntry::new(format!("get({bus})"), 0, items.len())];
                    Ok(Evaluated { items, trace })
                }
                Plan::Unary { op, child } => {
                    let Evaluated { items, mut trace } = child.evaluate(source).await?;
                    let input_len = items.len();
                    let items = op.apply(items)?;
                    trace.push(TraceEntry::new(op.label(), input_len, items.len()));
                    Ok(Evaluated { items, trace })
                }
                Plan::Binary { op, left, right } => {
                    let l = left.evaluate(source).await?;
                    let r = right.evaluate(source).await?;
                    let input_len = l.items.len() + r.items.len();
                    let mut trace = l.trace;
                    trace.extend(r.trace);
                    let items = op.apply(l.items, r.items);
                    trace.push(TraceEntry::new(op.label(), input_len, items.len()));
                    Ok(Evaluated { items, trace })
                }
            }
        })
    }

    /// Indented one-node-per-line rendering.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        self.describe_into(&mut out, 0);
        out
    }

    fn describe_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        match self {
            Plan::Get { bus, params } => {
                let params = serde_json::to_string(params).unwrap_or_default();
                let _ = writeln!(out, "{pad}get {bus} {params}");
            }
            Plan::Unary { op, child } => {
                let _ = writeln!(out, "{pad}{}", op.label());
                child.describe_into(out, depth + 1);
            }
            Plan::Binary { op, left, right } => {
                let _ = writeln!(out, "{pad}{}", op.label());
                left.describe_into(out, depth + 1);
                right.describe_into(out, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plans_serialize_as_tagged_trees() {
        let plan = Plan::binary(
            BinaryOp::Merge,
            Plan::unary(
                UnaryOp::Limit { n: 3 },
                Plan::get("messages", QueryParams::default().topic("chat")),
            ),
            Plan::get("messages", QueryParams::default()),
        );
        let value = serde_json::to_value(&plan).expect("serialize");
        assert_eq!(value["node"], "binary");
        assert_eq!(value["op"], "merge");
        assert_eq!(value["left"]["op"]["op"], "limit");
        assert_eq!(value["left"]["child"]["params"]["topic"], "chat");
        let back: Plan = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.single_bus().expect("one bus"), "messages");
    }

    #[test]
    fn custom_predicates_do_not_survive_serialization() {
        let plan = Plan::unary(
            UnaryOp::Where {
                clause: WhereClause::Custom {
                    label: "is_long".into(),
                    predicate: Some(Predicate::new(|_| true)),
                },
            },
            Plan::get("events", QueryParams::default()),
        );
        assert!(!plan.is_remote_replayable());
        let back: Plan = serde_json::from_value(serde_json::to_value(&plan).expect("serialize"))
            .expect("deserialize");
        let Plan::Unary { op, .. } = back else {
            panic!("unary expected");
        };
        let record = Record::from_raw(json!({"kind": "event", "event_id": "e"})).expect("parses");
        assert!(matches!(op.apply(vec![record]), Err(QueryError::Unreplayable(_))));
    }

    #[test]
    fn mixed_buses_are_reported() {
        let plan = Plan::binary(
            BinaryOp::Intersect,
            Plan::get("messages", QueryParams::default()),
            Plan::get("events", QueryParams::default()),
        );
        match plan.single_bus() {
            Err(QueryError::MixedBuses(buses)) => assert_eq!(buses, vec!["events", "messages"]),
            other => panic!("unexpected {other:?}"),
        }
        assert!(plan.linear_chain().is_none());
    }

    #[test]
    fn linear_chain_lists_ops_innermost_first() {
        let plan = Plan::unary(
            UnaryOp::Limit { n: 1 },
            Plan::unary(
                UnaryOp::Sort {
                    by: vec!["priority".into()],
                    reverse: true,
                },
                Plan::get("messages", QueryParams::default()),
            ),
        );
        let (bus, _, ops) = plan.linear_chain().expect("linear");
        assert_eq!(bus, "messages");
        assert_eq!(
            ops.iter().map(|op| op.label()).collect::<Vec<_>>(),
            vec!["sort(priority, reverse)", "limit(1)"]
        );
        assert!(plan.describe().starts_with("limit(1)\n  sort"));
    }
}
