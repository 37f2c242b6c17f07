//! Launch-tree construction.
//!
//! Targets are laid out breadth-first in enumeration order as an F-ary tree
//! under the root (this process): tree position `p` (root = 0, target `i` at
//! `i + 1`) has children `p*F + 1 ..= p*F + F`. A fan-out of 1 is the flat
//! case where the root parents every target.

use serde::{Deserialize, Serialize};

use super::types::{LaunchTarget, TargetId};

/// A target together with the subtree it is responsible for launching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtreePlan {
    pub target: LaunchTarget,
    pub children: Vec<SubtreePlan>,
}

impl SubtreePlan {
    /// Number of targets in this plan, including its own.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(SubtreePlan::len).sum::<usize>()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Every target below this one, in pre-order.
    pub fn descendants(&self) -> Vec<&LaunchTarget> {
        let mut out = Vec::new();
        for child in &self.children {
            out.push(&child.target);
            out.extend(child.descendants());
        }
        out
    }

    /// This target followed by all descendants, in pre-order.
    pub fn targets(&self) -> Vec<&LaunchTarget> {
        let mut out = vec![&self.target];
        out.extend(self.descendants());
        out
    }
}

/// Rooted launch tree over one job's targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchTopology {
    fanout: usize,
    targets: Vec<LaunchTarget>,
}

impl LaunchTopology {
    /// Place `targets` in a tree with the given fan-out.
    ///
    /// Ids are reassigned to enumeration order; parents and depths are filled in.
    /// A fan-out of 0 is treated as 1.
    pub fn build(mut targets: Vec<LaunchTarget>, fanout: usize) -> Self {
        let fanout = fanout.max(1);
        for i in 0..targets.len() {
            let parent = parent_of(i, fanout);
            let depth = match parent {
                Some(p) => targets[p].depth + 1,
                None => 1,
            };
            let target = &mut targets[i];
            target.id = i;
            target.parent = parent;
            target.depth = depth;
        }
        Self { fanout, targets }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn targets(&self) -> &[LaunchTarget] {
        &self.targets
    }

    /// Deepest level of the tree (0 when empty).
    pub fn depth(&self) -> usize {
        self.targets.iter().map(|t| t.depth).max().unwrap_or(0)
    }

    /// Targets launched directly by `parent` (`None` = the root).
    pub fn children_of(&self, parent: Option<TargetId>) -> Vec<TargetId> {
        children_positions(parent, self.fanout, self.targets.len())
    }

    /// Convert into the forest of plans the root launches.
    pub fn into_plans(self) -> Vec<SubtreePlan> {
        let fanout = self.fanout;
        let count = self.targets.len();
        let mut slots: Vec<Option<LaunchTarget>> = self.targets.into_iter().map(Some).collect();
        plans_under(None, fanout, count, &mut slots)
    }
}

/// Parent of target `index`, or `None` when the root launches it.
pub fn parent_of(index: TargetId, fanout: usize) -> Option<TargetId> {
    if fanout <= 1 {
        return None;
    }
    let position = index + 1;
    let parent_position = (position - 1) / fanout;
    parent_position.checked_sub(1)
}

fn children_positions(parent: Option<TargetId>, fanout: usize, count: usize) -> Vec<TargetId> {
    let fanout = fanout.max(1);
    match parent {
        None if fanout == 1 => (0..count).collect(),
        Some(_) if fanout == 1 => Vec::new(),
        _ => {
            let position = parent.map_or(0, |p| p + 1);
            let first = position * fanout + 1;
            (first..first + fanout)
                .take_while(|&pos| pos <= count)
                .map(|pos| pos - 1)
                .collect()
        }
    }
}

fn plans_under(
    parent: Option<TargetId>,
    fanout: usize,
    count: usize,
    slots: &mut [Option<LaunchTarget>],
) -> Vec<SubtreePlan> {
    children_positions(parent, fanout, count)
        .into_iter()
        .filter_map(|id| {
            let target = slots[id].take()?;
            let children = plans_under(Some(id), fanout, count, slots);
            Some(SubtreePlan { target, children })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<LaunchTarget> {
        (0..n)
            .map(|i| LaunchTarget::new(format!("node{i}"), vec!["prted".into()]))
            .collect()
    }

    #[test]
    fn fanout_one_is_flat() {
        let topo = LaunchTopology::build(targets(5), 1);
        assert!(topo.targets().iter().all(|t| t.parent.is_none() && t.depth == 1));
        assert_eq!(topo.children_of(None), [0, 1, 2, 3, 4]);
        let plans = topo.into_plans();
        assert_eq!(plans.len(), 5);
        assert!(plans.iter().all(SubtreePlan::is_leaf));
    }

    #[test]
    fn binary_tree_layout() {
        let topo = LaunchTopology::build(targets(7), 2);
        let parents: Vec<Option<TargetId>> = topo.targets().iter().map(|t| t.parent).collect();
        assert_eq!(
            parents,
            [None, None, Some(0), Some(0), Some(1), Some(1), Some(2)]
        );
        assert_eq!(topo.children_of(None), [0, 1]);
        assert_eq!(topo.children_of(Some(0)), [2, 3]);
        assert_eq!(topo.children_of(Some(2)), [6]);
        assert_eq!(topo.depth(), 3);

        let plans = topo.into_plans();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].len(), 4);
        assert_eq!(plans[1].len(), 3);
        let ids: Vec<TargetId> = plans[0].targets().iter().map(|t| t.id).collect();
        assert_eq!(ids, [0, 2, 6, 3]);
    }

    #[test]
    fn root_launches_at_most_fanout_targets() {
        let topo = LaunchTopology::build(targets(1000), 32);
        assert_eq!(topo.children_of(None).len(), 32);
        assert_eq!(topo.depth(), 2);
    }

    #[test]
    fn empty_job_has_no_plans() {
        let topo = LaunchTopology::build(Vec::new(), 4);
        assert!(topo.is_empty());
        assert_eq!(topo.depth(), 0);
        assert!(topo.into_plans().is_empty());
    }

    #[test]
    fn ids_follow_enumeration_order() {
        let mut input = targets(3);
        input[0].id = 42;
        let topo = LaunchTopology::build(input, 2);
        let ids: Vec<TargetId> = topo.targets().iter().map(|t| t.id).collect();
        assert_eq!(ids, [0, 1, 2]);
        assert_eq!(topo.targets()[0].node, "node0");
    }
}
