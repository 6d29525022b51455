use std::collections::{BTreeMap, BTreeSet};

use schema::{Citizen, CitizenId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("citizen {citizen_id} lists unknown relative {relative_id}")]
    UnknownRelative {
        citizen_id: CitizenId,
        relative_id: CitizenId,
    },
    #[error("citizen {0} lists itself as a relative")]
    SelfRelation(CitizenId),
    #[error("citizen {citizen_id} lists {relative_id} as a relative but not the other way round")]
    Asymmetric {
        citizen_id: CitizenId,
        relative_id: CitizenId,
    },
    #[error("citizen {0} is not part of the batch")]
    UnknownCitizen(CitizenId),
}

/// Adjacency sets of the relative relation inside one batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelativeGraph {
    adjacency: BTreeMap<CitizenId, BTreeSet<CitizenId>>,
}

/// Edges one citizen gains and loses. Every id in `added` must get the
/// citizen added to its own set, every id in `removed` must lose it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelativesDelta {
    pub citizen_id: CitizenId,
    pub added: BTreeSet<CitizenId>,
    pub removed: BTreeSet<CitizenId>,
}

impl RelativesDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Other citizens whose relative set changes.
    pub fn counterparts(&self) -> impl Iterator<Item = CitizenId> + '_ {
        self.added.iter().chain(self.removed.iter()).copied()
    }
}

impl RelativeGraph {
    pub fn from_citizens<'a>(citizens: impl IntoIterator<Item = &'a Citizen>) -> Self {
        let adjacency = citizens
            .into_iter()
            .map(|citizen| (citizen.citizen_id, citizen.relatives.clone()))
            .collect();
        Self { adjacency }
    }

    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    pub fn contains(&self, citizen_id: CitizenId) -> bool {
        self.adjacency.contains_key(&citizen_id)
    }

    pub fn relatives_of(&self, citizen_id: CitizenId) -> Option<&BTreeSet<CitizenId>> {
        self.adjacency.get(&citizen_id)
    }

    /// Sum of relative-set sizes, i.e. each undirected edge counted once per side.
    pub fn directed_edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum()
    }

    /// Checks that every listed relative exists and lists the citizen back.
    /// Nothing is repaired: the first violation in citizen id order is returned.
    pub fn validate_symmetric(&self) -> Result<(), GraphError> {
        for (citizen_id, relatives) in &self.adjacency {
            for relative_id in relatives {
                if relative_id == citizen_id {
                    return Err(GraphError::SelfRelation(*citizen_id));
                }
                let Some(back) = self.adjacency.get(relative_id) else {
                    return Err(GraphError::UnknownRelative {
                        citizen_id: *citizen_id,
                        relative_id: *relative_id,
                    });
                };
                if !back.contains(citizen_id) {
                    return Err(GraphError::Asymmetric {
                        citizen_id: *citizen_id,
                        relative_id: *relative_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Minimal set of counterpart updates needed when `citizen_id` replaces
    /// its relative set with `next`.
    pub fn plan_relatives_change(
        &self,
        citizen_id: CitizenId,
        next: &BTreeSet<CitizenId>,
    ) -> Result<RelativesDelta, GraphError> {
        let current = self
            .adjacency
            .get(&citizen_id)
            .ok_or(GraphError::UnknownCitizen(citizen_id))?;
        if next.contains(&citizen_id) {
            return Err(GraphError::SelfRelation(citizen_id));
        }
        for relative_id in next {
            if !self.adjacency.contains_key(relative_id) {
                return Err(GraphError::UnknownRelative {
                    citizen_id,
                    relative_id: *relative_id,
                });
            }
        }
        Ok(RelativesDelta {
            citizen_id,
            added: next.difference(current).copied().collect(),
            removed: current.difference(next).copied().collect(),
        })
    }
}

pub fn validate_symmetric(citizens: &[Citizen]) -> Result<(), GraphError> {
    RelativeGraph::from_citizens(citizens).validate_symmetric()
}

/// Applies both sides of `delta` to a batch arena and returns the ids of every
/// citizen whose record changed, the patched citizen first. The arena is left
/// untouched when an id is missing.
pub fn apply_relatives_change(
    arena: &mut BTreeMap<CitizenId, Citizen>,
    delta: &RelativesDelta,
) -> Result<Vec<CitizenId>, GraphError> {
    if !arena.contains_key(&delta.citizen_id) {
        return Err(GraphError::UnknownCitizen(delta.citizen_id));
    }
    if let Some(missing) = delta.counterparts().find(|id| !arena.contains_key(id)) {
        return Err(GraphError::UnknownRelative {
            citizen_id: delta.citizen_id,
            relative_id: missing,
        });
    }

    let mut touched = vec![delta.citizen_id];
    if let Some(citizen) = arena.get_mut(&delta.citizen_id) {
        citizen.relatives.extend(delta.added.iter().copied());
        citizen.relatives.retain(|id| !delta.removed.contains(id));
    }
    for relative_id in &delta.added {
        if let Some(relative) = arena.get_mut(relative_id) {
            relative.relatives.insert(delta.citizen_id);
            touched.push(*relative_id);
        }
    }
    for relative_id in &delta.removed {
        if let Some(relative) = arena.get_mut(relative_id) {
            relative.relatives.remove(&delta.citizen_id);
            touched.push(*relative_id);
        }
    }
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn citizen(id: CitizenId, relatives: &[CitizenId]) -> Citizen {
        Citizen::new(
            id,
            "Citizen",
            NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            "Moscow",
            relatives.iter().copied(),
        )
    }

    fn arena(citizens: Vec<Citizen>) -> BTreeMap<CitizenId, Citizen> {
        citizens.into_iter().map(|c| (c.citizen_id, c)).collect()
    }

    fn assert_symmetric(arena: &BTreeMap<CitizenId, Citizen>) {
        assert_eq!(
            RelativeGraph::from_citizens(arena.values()).validate_symmetric(),
            Ok(())
        );
    }

    #[test]
    fn accepts_symmetric_graph() {
        let citizens = vec![citizen(1, &[2]), citizen(2, &[1, 3]), citizen(3, &[2])];
        assert_eq!(validate_symmetric(&citizens), Ok(()));
        assert_eq!(
            RelativeGraph::from_citizens(&citizens).directed_edge_count(),
            4
        );
    }

    #[test]
    fn rejects_one_sided_relation() {
        let citizens = vec![citizen(1, &[2]), citizen(2, &[])];
        assert_eq!(
            validate_symmetric(&citizens),
            Err(GraphError::Asymmetric {
                citizen_id: 1,
                relative_id: 2
            })
        );
    }

    #[test]
    fn rejects_unknown_and_self_relatives() {
        assert_eq!(
            validate_symmetric(&[citizen(1, &[9])]),
            Err(GraphError::UnknownRelative {
                citizen_id: 1,
                relative_id: 9
            })
        );
        assert_eq!(
            validate_symmetric(&[citizen(1, &[1])]),
            Err(GraphError::SelfRelation(1))
        );
    }

    #[test]
    fn plan_computes_minimal_delta() {
        let citizens = vec![
            citizen(1, &[2, 3]),
            citizen(2, &[1]),
            citizen(3, &[1]),
            citizen(4, &[]),
        ];
        let graph = RelativeGraph::from_citizens(&citizens);
        let delta = graph
            .plan_relatives_change(1, &BTreeSet::from([3, 4]))
            .unwrap();
        assert_eq!(delta.added, BTreeSet::from([4]));
        assert_eq!(delta.removed, BTreeSet::from([2]));
        assert_eq!(delta.counterparts().collect::<Vec<_>>(), vec![4, 2]);

        let unchanged = graph
            .plan_relatives_change(1, &BTreeSet::from([2, 3]))
            .unwrap();
        assert!(unchanged.is_empty());
    }

    #[test]
    fn plan_rejects_self_unknown_and_missing_citizen() {
        let graph = RelativeGraph::from_citizens(&[citizen(1, &[]), citizen(2, &[])]);
        assert_eq!(
            graph.plan_relatives_change(1, &BTreeSet::from([1])),
            Err(GraphError::SelfRelation(1))
        );
        assert_eq!(
            graph.plan_relatives_change(1, &BTreeSet::from([5])),
            Err(GraphError::UnknownRelative {
                citizen_id: 1,
                relative_id: 5
            })
        );
        assert_eq!(
            graph.plan_relatives_change(7, &BTreeSet::new()),
            Err(GraphError::UnknownCitizen(7))
        );
    }

    #[test]
    fn apply_adds_and_removes_both_sides() {
        let mut arena = arena(vec![
            citizen(1, &[2]),
            citizen(2, &[1]),
            citizen(3, &[]),
        ]);
        let graph = RelativeGraph::from_citizens(arena.values());
        let delta = graph.plan_relatives_change(1, &BTreeSet::from([3])).unwrap();

        let touched = apply_relatives_change(&mut arena, &delta).unwrap();
        assert_eq!(touched, vec![1, 3, 2]);
        assert_eq!(arena[&1].relatives, BTreeSet::from([3]));
        assert_eq!(arena[&3].relatives, BTreeSet::from([1]));
        assert!(arena[&2].relatives.is_empty());
        assert_symmetric(&arena);
    }

    #[test]
    fn apply_leaves_arena_untouched_on_missing_counterpart() {
        let mut arena = arena(vec![citizen(1, &[]), citizen(2, &[])]);
        let before = arena.clone();
        let delta = RelativesDelta {
            citizen_id: 1,
            added: BTreeSet::from([2, 8]),
            removed: BTreeSet::new(),
        };
        assert_eq!(
            apply_relatives_change(&mut arena, &delta),
            Err(GraphError::UnknownRelative {
                citizen_id: 1,
                relative_id: 8
            })
        );
        assert_eq!(arena, before);
    }
}
