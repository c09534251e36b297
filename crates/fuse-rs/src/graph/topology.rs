use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::graph::op::{Op, OpId};
use crate::graph::tensor::TensorId;
use crate::graph::Graph;

/// Orders `ops` topologically, keeping the given order wherever dependencies allow.
///
/// Returns `None` if the ops contain a cycle.
pub fn stable_topological_order(ops: Vec<Op>) -> Option<Vec<Op>> {
    let mut producer: HashMap<TensorId, usize> = HashMap::new();
    for (index, op) in ops.iter().enumerate() {
        for output in &op.outputs {
            producer.insert(*output, index);
        }
    }

    let mut indegree = vec![0usize; ops.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); ops.len()];
    for (index, op) in ops.iter().enumerate() {
        for input in &op.inputs {
            if let Some(&source) = producer.get(input) {
                if source != index {
                    indegree[index] += 1;
                    dependents[source].push(index);
                }
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(index, _)| Reverse(index))
        .collect();
    let mut order = Vec::with_capacity(ops.len());
    while let Some(Reverse(index)) = ready.pop() {
        order.push(index);
        for &dependent in &dependents[index] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
    if order.len() != ops.len() {
        return None;
    }

    let mut slots: Vec<Option<Op>> = ops.into_iter().map(Some).collect();
    Some(
        order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect(),
    )
}

/// Returns true if no path leaves `members` and re-enters it.
///
/// Contracting a non-convex set into one node would create a cycle.
pub fn is_convex(graph: &Graph, members: &HashSet<OpId>) -> bool {
    let Some(last) = members.iter().filter_map(|op| graph.position(*op)).max() else {
        return true;
    };

    let mut visited: HashSet<OpId> = HashSet::new();
    let mut stack: Vec<OpId> = Vec::new();
    let push_consumers = |op: &Op, visited: &mut HashSet<OpId>, stack: &mut Vec<OpId>| {
        for output in &op.outputs {
            for (consumer, _) in graph.consumers(*output) {
                if members.contains(consumer) {
                    continue;
                }
                // Ops placed after the last member cannot feed back into the set.
                let before_last = graph
                    .position(*consumer)
                    .is_some_and(|position| position < last);
                if before_last && visited.insert(*consumer) {
                    stack.push(*consumer);
                }
            }
        }
    };

    for member in members {
        if let Some(op) = graph.op(*member) {
            push_consumers(op, &mut visited, &mut stack);
        }
    }
    while let Some(current) = stack.pop() {
        let Some(op) = graph.op(current) else {
            continue;
        };
        let reenters = op.outputs.iter().any(|output| {
            graph
                .consumers(*output)
                .iter()
                .any(|(consumer, _)| members.contains(consumer))
        });
        if reenters {
            return false;
        }
        push_consumers(op, &mut visited, &mut stack);
    }
    true
}
