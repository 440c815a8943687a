use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, Result};

pub type TaskId = String;

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: String,
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

/// Task graph for one pipeline run. Edges come from `after`, which may name a
/// task id or a token from some task's `provides`. A trailing `?` marks an
/// edge that is dropped when nothing satisfies it.
#[derive(Debug, Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::config(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::config(format!(
                        "provide token '{}' is produced by both '{}' and '{}'",
                        p, existing, id
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Option<&'a str> {
        if let Some((id, _)) = self.tasks.get_key_value(dep) {
            return Some(id.as_str());
        }
        provides.get(dep).copied()
    }

    fn resolve_edge<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        task: &'a Task,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (name, optional) = match dep.strip_suffix('?') {
            Some(d) => (d, true),
            None => (dep, false),
        };
        match self.resolve_dep(provides, name) {
            Some(id) => Ok(Some(id)),
            None if optional => Ok(None),
            None => Err(Error::config(format!(
                "task '{}' has unknown dependency '{}'",
                task.id, dep
            ))),
        }
    }

    /// Topological order; ties are broken by task id so the order is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let provides = self.provides_index()?;

        let mut incoming: BTreeMap<&str, usize> = BTreeMap::new();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for id in self.tasks.keys() {
            incoming.entry(id.as_str()).or_insert(0);
            outgoing.entry(id.as_str()).or_default();
        }
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let Some(dep_id) = self.resolve_edge(&provides, task, dep)? else {
                    continue;
                };
                if outgoing.entry(dep_id).or_default().insert(id.as_str()) {
                    *incoming.entry(id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut q: VecDeque<&str> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out: Vec<&Task> = Vec::with_capacity(self.tasks.len());

        while let Some(n) = q.pop_front() {
            if let Some(task) = self.tasks.get(n) {
                out.push(task);
            }
            let Some(children) = outgoing.get(n) else {
                continue;
            };
            for &m in children {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        q.push_back(m);
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::config(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }

        Ok(out)
    }

    pub fn to_dot(&self) -> Result<String> {
        let provides = self.provides_index()?;

        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for task in self.tasks.values() {
            for dep in &task.after {
                let Some(dep_id) = self.resolve_edge(&provides, task, dep)? else {
                    continue;
                };
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", dep_id, task.id));
            }
        }
        out.push_str("}\n");
        Ok(out)
    }
}
