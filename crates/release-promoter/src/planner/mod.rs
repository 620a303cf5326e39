use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type PhaseId = &'static str;

#[derive(Debug, Clone)]
pub struct Phase {
    pub id: PhaseId,
    pub label: &'static str,
    pub after: Vec<PhaseId>,
}

#[derive(Debug, Default)]
pub struct Plan {
    phases: BTreeMap<PhaseId, Phase>,
    // Insertion order breaks ties between phases that are ready together.
    order: Vec<PhaseId>,
}

impl Plan {
    pub fn add(&mut self, phase: Phase) -> Result<()> {
        if self.phases.contains_key(phase.id) {
            return Err(Error::msg(format!("duplicate phase id '{}'", phase.id)));
        }
        self.order.push(phase.id);
        self.phases.insert(phase.id, phase);
        Ok(())
    }

    pub fn ordered(&self) -> Result<Vec<&Phase>> {
        let rank: BTreeMap<PhaseId, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();

        let mut incoming: BTreeMap<PhaseId, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<PhaseId, BTreeSet<PhaseId>> = BTreeMap::new();
        for (&id, phase) in &self.phases {
            incoming.entry(id).or_insert(0);
            for &dep in &phase.after {
                if !self.phases.contains_key(dep) {
                    return Err(Error::msg(format!(
                        "phase '{}' depends on unknown phase '{}'",
                        id, dep
                    )));
                }
                outgoing.entry(dep).or_default().insert(id);
                *incoming.entry(id).or_insert(0) += 1;
            }
        }

        let mut ready: Vec<PhaseId> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        ready.sort_by_key(|id| rank[id]);
        let mut q: VecDeque<PhaseId> = ready.into();
        let mut out: Vec<&Phase> = Vec::with_capacity(self.phases.len());

        while let Some(n) = q.pop_front() {
            out.push(&self.phases[n]);
            let mut next = Vec::new();
            for &m in outgoing.get(n).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        next.push(m);
                    }
                }
            }
            next.sort_by_key(|id| rank[id]);
            q.extend(next);
        }

        if out.len() != self.phases.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "phase graph contains a cycle; remaining phases: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph promote {\n  rankdir=LR;\n");
        for phase in self.ordered()? {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\"];\n",
                phase.id, phase.label, phase.id
            ));
            for dep in &phase.after {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep, phase.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(id: PhaseId, after: &[PhaseId]) -> Phase {
        Phase {
            id,
            label: id,
            after: after.to_vec(),
        }
    }

    #[test]
    fn orders_by_dependencies_then_insertion() {
        let mut plan = Plan::default();
        plan.add(phase("z.last", &["a.first"])).expect("add");
        plan.add(phase("a.first", &[])).expect("add");
        plan.add(phase("m.middle", &["a.first"])).expect("add");
        let ids: Vec<_> = plan.ordered().expect("order").iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a.first", "z.last", "m.middle"]);
    }

    #[test]
    fn rejects_duplicates_unknown_deps_and_cycles() {
        let mut plan = Plan::default();
        plan.add(phase("a", &[])).expect("add");
        assert!(plan.add(phase("a", &[])).is_err());

        let mut unknown = Plan::default();
        unknown.add(phase("a", &["missing"])).expect("add");
        let err = unknown.ordered().unwrap_err().to_string();
        assert!(err.contains("unknown phase 'missing'"), "{err}");

        let mut cyclic = Plan::default();
        cyclic.add(phase("a", &["b"])).expect("add");
        cyclic.add(phase("b", &["a"])).expect("add");
        let err = cyclic.ordered().unwrap_err().to_string();
        assert!(err.contains("cycle"), "{err}");
    }

    #[test]
    fn dot_output_lists_edges() {
        let mut plan = Plan::default();
        plan.add(phase("a", &[])).expect("add");
        plan.add(phase("b", &["a"])).expect("add");
        let dot = plan.to_dot().expect("dot");
        assert!(dot.contains("\"a\" -> \"b\";"));
    }
}
