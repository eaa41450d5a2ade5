use std::collections::HashSet;
use std::fmt::Write as _;
use std::ops::{Add, BitAnd, Sub};

use plexus_records::{Filter, FilterSpec, KindTag, QueryParams, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{BinaryOp, Evaluated, Plan, Predicate, UnaryOp, WhereClause};
use crate::{QueryError, ReplaySource};

/// One step of how a list was computed, kept for diagnostics.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceEntry {
    pub op: String,
    pub input_len: usize,
    pub output_len: usize,
}

impl TraceEntry {
    pub fn new(op: impl Into<String>, input_len: usize, output_len: usize) -> Self {
        Self {
            op: op.into(),
            input_len,
            output_len,
        }
    }
}

/// An ordered, immutable record sequence with the plan that produced it.
///
/// Two lists are equal when they hold the same record kind and the same
/// ordered sequence of dedupe keys; record contents are not compared.
#[derive(Clone, Debug, Default)]
pub struct BusList {
    items: Vec<Record>,
    plan: Option<Plan>,
    trace: Vec<TraceEntry>,
    kind: Option<KindTag>,
}

fn homogeneous_kind(items: &[Record]) -> Option<KindTag> {
    let first = items.first()?.tag();
    items.iter().all(|r| r.tag() == first).then_some(first)
}

impl BusList {
    /// A list without a plan. It can be queried but not replayed or watched.
    pub fn new(items: Vec<Record>) -> Self {
        let kind = homogeneous_kind(&items);
        Self {
            items,
            plan: None,
            trace: Vec::new(),
            kind,
        }
    }

    /// A list fetched from `bus`; its plan is a single `Get` leaf.
    pub fn from_get(bus: impl Into<String>, params: QueryParams, items: Vec<Record>) -> Self {
        let plan = Plan::get(bus, params);
        let kind = plan.kind_hint().or_else(|| homogeneous_kind(&items));
        let label = match &plan {
            Plan::Get { bus, .. } => format!("get({bus})"),
            _ => "get".to_string(),
        };
        Self {
            trace: vec![TraceEntry::new(label, 0, items.len())],
            items,
            plan: Some(plan),
            kind,
        }
    }

    /// Evaluates `plan` from scratch against `source`.
    pub async fn evaluate<S>(plan: &Plan, source: &S) -> Result<Self, QueryError>
    where
        S: ReplaySource + ?Sized,
    {
        let Evaluated { items, trace } = plan.evaluate(source).await?;
        let kind = plan.kind_hint().or_else(|| homogeneous_kind(&items));
        Ok(Self {
            items,
            plan: Some(plan.clone()),
            trace,
            kind,
        })
    }

    /// Re-fetches this list through its plan.
    pub async fn replay<S>(&self, source: &S) -> Result<Self, QueryError>
    where
        S: ReplaySource + ?Sized,
    {
        let plan = self
            .plan
            .as_ref()
            .ok_or_else(|| QueryError::Unreplayable("list has no plan".into()))?;
        source.replay(plan).await
    }

    /// Reassembles a list computed elsewhere, e.g. by a remote `bus.replay`.
    pub fn from_parts(items: Vec<Record>, plan: Plan, trace: Vec<TraceEntry>) -> Self {
        let kind = plan.kind_hint().or_else(|| homogeneous_kind(&items));
        Self {
            items,
            plan: Some(plan),
            trace,
            kind,
        }
    }

    pub fn with_kind(mut self, kind: KindTag) -> Self {
        self.kind = Some(kind);
        self
    }

    fn derive_unary(&self, op: UnaryOp, items: Vec<Record>) -> Self {
        let mut trace = self.trace.clone();
        trace.push(TraceEntry::new(op.label(), self.items.len(), items.len()));
        Self {
            items,
            plan: self.plan.clone().map(|child| Plan::unary(op, child)),
            trace,
            kind: self.kind,
        }
    }

    fn derive_binary(&self, other: &Self, op: BinaryOp) -> Self {
        let items = op.apply(self.items.clone(), other.items.clone());
        let mut trace = self.trace.clone();
        trace.extend(other.trace.iter().cloned());
        trace.push(TraceEntry::new(
            op.label(),
            self.items.len() + other.items.len(),
            items.len(),
        ));
        let plan = match (&self.plan, &other.plan) {
            (Some(l), Some(r)) => Some(Plan::binary(op, l.clone(), r.clone())),
            _ => None,
        };
        let kind = match (self.kind, other.kind) {
            (l, r) if l == r => l,
            (l, None) if other.items.is_empty() => l,
            (None, r) if self.items.is_empty() => r,
            _ => homogeneous_kind(&items),
        };
        Self {
            items,
            plan,
            trace,
            kind,
        }
    }

    /// Applies a serialized operation, as `bus.replay` and watchers do.
    pub fn apply(&self, op: UnaryOp) -> Result<Self, QueryError> {
        let items = op.apply(self.items.clone())?;
        Ok(self.derive_unary(op, items))
    }

    pub fn filter(&self, filter: &Filter) -> Self {
        let items = self
            .items
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        self.derive_unary(
            UnaryOp::Filter {
                spec: filter.spec().clone(),
            },
            items,
        )
    }

    pub fn filter_spec(&self, spec: FilterSpec) -> Result<Self, QueryError> {
        Ok(self.filter(&spec.compile()?))
    }

    fn where_clause(&self, clause: WhereClause) -> Self {
        let items = self
            .items
            .iter()
            .filter(|r| clause.test(r).unwrap_or(false))
            .cloned()
            .collect();
        self.derive_unary(UnaryOp::Where { clause }, items)
    }

    pub fn where_eq(&self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_clause(WhereClause::Eq {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn where_ne(&self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_clause(WhereClause::Ne {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn where_in(&self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.where_clause(WhereClause::In {
            field: field.into(),
            values,
        })
    }

    pub fn where_contains(&self, field: impl Into<String>, needle: impl Into<String>) -> Self {
        self.where_clause(WhereClause::Contains {
            field: field.into(),
            needle: needle.into(),
        })
    }

    /// Arbitrary predicate. Lists derived this way replay only in-process.
    pub fn where_fn<F>(&self, label: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.where_clause(WhereClause::Custom {
            label: label.into(),
            predicate: Some(Predicate::new(f)),
        })
    }

    pub fn sort(&self, by: &[&str], reverse: bool) -> Self {
        let by: Vec<String> = by.iter().map(|s| s.to_string()).collect();
        let items = crate::sort::sort_records(self.items.clone(), &by, reverse);
        self.derive_unary(UnaryOp::Sort { by, reverse }, items)
    }

    pub fn limit(&self, n: usize) -> Self {
        let items = self.items.iter().take(n).cloned().collect();
        self.derive_unary(UnaryOp::Limit { n }, items)
    }

    /// Key-deduplicated union: left then right, first occurrence wins.
    pub fn merge(&self, other: &Self) -> Self {
        self.derive_binary(other, BinaryOp::Merge)
    }

    /// Records whose keys appear in both lists, in left order.
    pub fn intersect(&self, other: &Self) -> Self {
        self.derive_binary(other, BinaryOp::Intersect)
    }

    /// Records whose keys appear only in the left list.
    pub fn difference(&self, other: &Self) -> Self {
        self.derive_binary(other, BinaryOp::Difference)
    }

    pub fn items(&self) -> &[Record] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Record> {
        self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn is_replayable(&self) -> bool {
        self.plan.is_some()
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn kind(&self) -> Option<KindTag> {
        self.kind
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.iter().map(Record::dedupe_key).collect()
    }

    pub fn key_set(&self) -> HashSet<String> {
        self.items.iter().map(Record::dedupe_key).collect()
    }

    pub fn dump(&self) -> Vec<Value> {
        self.items.iter().map(Record::dump).collect()
    }

    /// Human-readable plan and trace.
    pub fn explain(&self) -> String {
        let mut out = String::new();
        match &self.plan {
            Some(plan) => {
                out.push_str("plan:\n");
                for line in plan.describe().lines() {
                    let _ = writeln!(out, "  {line}");
                }
            }
            None => out.push_str("plan: <none, not replayable>\n"),
        }
        out.push_str("trace:\n");
        for entry in &self.trace {
            let _ = writeln!(out, "  {} {} -> {}", entry.op, entry.input_len, entry.output_len);
        }
        out
    }
}

impl PartialEq for BusList {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(other.items.iter())
                .all(|(a, b)| a.dedupe_key() == b.dedupe_key())
    }
}

impl<'a> IntoIterator for &'a BusList {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

impl Add for &BusList {
    type Output = BusList;

    fn add(self, rhs: Self) -> BusList {
        self.merge(rhs)
    }
}

impl BitAnd for &BusList {
    type Output = BusList;

    fn bitand(self, rhs: Self) -> BusList {
        self.intersect(rhs)
    }
}

impl Sub for &BusList {
    type Output = BusList;

    fn sub(self, rhs: Self) -> BusList {
        self.difference(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(id: &str, priority: i64) -> Record {
        Record::from_raw(json!({
            "kind": "message",
            "message_id": id,
            "priority": priority,
            "type": if priority > 2 { "urgent" } else { "chat" },
        }))
        .expect("parses")
    }

    fn list(ids: &[(&str, i64)]) -> BusList {
        BusList::from_get(
            "messages",
            QueryParams::default(),
            ids.iter().map(|(id, p)| msg(id, *p)).collect(),
        )
    }

    fn ids(list: &BusList) -> Vec<String> {
        list.iter().filter_map(|r| r.identity().map(str::to_string)).collect()
    }

    #[test]
    fn set_operations_use_dedupe_keys() {
        let a = list(&[("1", 0), ("2", 0), ("3", 0)]);
        let b = list(&[("3", 9), ("4", 0), ("1", 9)]);
        assert_eq!(ids(&(&a + &b)), vec!["1", "2", "3", "4"]);
        // first occurrence wins
        assert_eq!((&a + &b).items()[0].priority(), 0);
        assert_eq!(ids(&(&a & &b)), vec!["1", "3"]);
        assert_eq!(ids(&(&a - &b)), vec!["2"]);
    }

    #[test]
    fn every_operation_wraps_the_parent_plan() {
        let derived = list(&[("1", 1), ("2", 5), ("3", 3)])
            .where_eq("type", "urgent")
            .sort(&["priority"], true)
            .limit(1);
        assert_eq!(ids(&derived), vec!["2"]);
        let (bus, _, ops) = derived.plan().expect("plan").linear_chain().expect("linear");
        assert_eq!(bus, "messages");
        assert_eq!(ops.len(), 3);
        assert_eq!(derived.trace().len(), 4);
        assert_eq!(derived.trace()[1], TraceEntry::new("where_eq(type)", 3, 2));
        assert!(derived.explain().contains("limit(1) 2 -> 1"));
    }

    #[test]
    fn unplanned_operands_produce_unplanned_results() {
        let planned = list(&[("1", 0)]);
        let bare = BusList::new(vec![msg("2", 0)]);
        assert!(!(&planned + &bare).is_replayable());
        assert!(!bare.limit(1).is_replayable());
    }

    #[test]
    fn equality_ignores_contents_but_not_order_or_kind() {
        let a = list(&[("1", 0), ("2", 0)]);
        let b = list(&[("1", 7), ("2", 7)]);
        let swapped = list(&[("2", 0), ("1", 0)]);
        assert_eq!(a, b);
        assert_ne!(a, swapped);
        let events = BusList::from_get("events", QueryParams::default(), Vec::new());
        let empty_messages = a.limit(0);
        assert_ne!(events, empty_messages);
    }

    #[test]
    fn filter_spec_errors_surface() {
        let err = list(&[("1", 0)])
            .filter_spec(FilterSpec::new().regex("type", "("))
            .expect_err("strict regex fails");
        assert!(matches!(err, QueryError::Filter(_)));
    }

    #[test]
    fn where_variants_cover_membership_and_containment() {
        let l = list(&[("1", 1), ("2", 5), ("3", 3)]);
        assert_eq!(ids(&l.where_in("message_id", vec![json!("1"), json!("3")])), vec!["1", "3"]);
        assert_eq!(ids(&l.where_ne("type", "urgent")), vec!["1"]);
        assert_eq!(ids(&l.where_contains("type", "urg")), vec!["2", "3"]);
        assert_eq!(ids(&l.where_fn("odd", |r| r.priority() % 2 == 1)), vec!["1", "2", "3"]);
    }
}
