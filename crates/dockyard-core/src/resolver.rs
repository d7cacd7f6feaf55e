//! Startup ordering of definitions.
//!
//! Definitions are placed in rounds: each round walks the unplaced
//! definitions in input order and places every one whose dependencies are
//! already placed. A round that places nothing ends the walk, so the number of
//! rounds is bounded by the number of definitions. Whatever is left over is
//! unplaceable; a visited/in-progress depth-first walk over it tells a cycle
//! apart from a reference to something that does not exist.

use crate::{CoreError, UnresolvedKind};
use dockyard_schema::Definition;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn reaches_cycle(node: usize, edges: &[Vec<usize>], marks: &mut [Mark]) -> bool {
    match marks[node] {
        Mark::InProgress => return true,
        Mark::Done => return false,
        Mark::Unvisited => {}
    }
    marks[node] = Mark::InProgress;
    for &next in &edges[node] {
        if reaches_cycle(next, edges, marks) {
            return true;
        }
    }
    marks[node] = Mark::Done;
    false
}

/// Order `defs` so that every definition follows everything it depends on.
///
/// Ties are broken by input order. Fails with
/// [`CoreError::UnresolvedRelationship`] naming every definition that cannot
/// be placed.
pub fn resolve_order(defs: &[Definition]) -> Result<Vec<&Definition>, CoreError> {
    let index: HashMap<&str, usize> = defs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name(), i))
        .collect();

    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(defs.len());
    let mut dangling = vec![false; defs.len()];
    for (i, def) in defs.iter().enumerate() {
        let mut targets = Vec::new();
        for dep in def.dependencies()? {
            match index.get(dep.as_str()) {
                Some(&j) => targets.push(j),
                None => {
                    debug!("{} references unknown definition '{dep}'", def.name());
                    dangling[i] = true;
                }
            }
        }
        edges.push(targets);
    }

    let mut placed = vec![false; defs.len()];
    let mut order: Vec<usize> = Vec::with_capacity(defs.len());
    loop {
        let before = order.len();
        for (i, targets) in edges.iter().enumerate() {
            if !placed[i] && !dangling[i] && targets.iter().all(|&j| placed[j]) {
                placed[i] = true;
                order.push(i);
            }
        }
        if order.len() == before || order.len() == defs.len() {
            break;
        }
    }

    if order.len() == defs.len() {
        return Ok(order.into_iter().map(|i| &defs[i]).collect());
    }

    let mut marks: Vec<Mark> = placed
        .iter()
        .map(|&p| if p { Mark::Done } else { Mark::Unvisited })
        .collect();
    let cyclic = (0..defs.len()).any(|i| !placed[i] && reaches_cycle(i, &edges, &mut marks));
    let names: Vec<String> = defs
        .iter()
        .zip(&placed)
        .filter(|(_, &p)| !p)
        .map(|(d, _)| d.name().to_owned())
        .collect();

    Err(CoreError::UnresolvedRelationship {
        kind: if cyclic {
            UnresolvedKind::Cyclic
        } else {
            UnresolvedKind::Missing
        },
        names,
    })
}
