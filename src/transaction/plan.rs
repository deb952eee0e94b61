// src/transaction/plan.rs

//! Transaction planning
//!
//! The plan is the difference between the installed graph and the target
//! graph, one step per changed name, ordered so that nothing is installed
//! before what it depends on and nothing is removed while a package that
//! needs it is still in place. Steps are sorted with Tarjan's algorithm over
//! the precedence graph; a strongly connected component of more than one step
//! can not be ordered and becomes a single atomic group.

use crate::depgraph::{DepGraph, InstalledRecord};
use crate::packages::{PackageDefinition, PackageId};
use std::collections::{BTreeMap, BTreeSet, HashMap, btree_set};
use std::fmt;

/// One filesystem change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Install(PackageDefinition),
    Remove(PackageId),
    /// Swap the installed version of a name for another one
    Replace {
        old: PackageId,
        new: PackageDefinition,
    },
    /// Steps that depend on each other and are applied together
    Group(Vec<Step>),
}

impl Step {
    /// Definition that ends up installed, if any
    fn installs(&self) -> Option<&PackageDefinition> {
        match self {
            Step::Install(def) | Step::Replace { new: def, .. } => Some(def),
            _ => None,
        }
    }

    /// Package that stops being installed, if any
    fn removes(&self) -> Option<&PackageId> {
        match self {
            Step::Remove(id) | Step::Replace { old: id, .. } => Some(id),
            _ => None,
        }
    }

    /// The non-group steps this step consists of
    pub fn atoms(&self) -> Vec<&Step> {
        match self {
            Step::Group(steps) => steps.iter().flat_map(|s| s.atoms()).collect(),
            step => vec![step],
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Install(def) => write!(f, "install {}", def.id),
            Step::Remove(id) => write!(f, "remove {}", id),
            Step::Replace { old, new } => write!(f, "replace {} with {}", old, new.id),
            Step::Group(steps) => {
                let inner: Vec<String> = steps.iter().map(|s| s.to_string()).collect();
                write!(f, "together: {}", inner.join(", "))
            }
        }
    }
}

/// Ordered steps taking the installed graph to a target graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionPlan {
    pub steps: Vec<Step>,
}

impl TransactionPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every non-group step in execution order
    pub fn atoms(&self) -> Vec<&Step> {
        self.steps.iter().flat_map(|s| s.atoms()).collect()
    }

    pub fn install_count(&self) -> usize {
        self.count(|s| matches!(s, Step::Install(_)))
    }

    pub fn remove_count(&self) -> usize {
        self.count(|s| matches!(s, Step::Remove(_)))
    }

    pub fn replace_count(&self) -> usize {
        self.count(|s| matches!(s, Step::Replace { .. }))
    }

    fn count(&self, predicate: impl Fn(&Step) -> bool) -> usize {
        self.atoms().into_iter().filter(|s| predicate(s)).count()
    }

    /// Definitions that get installed by this plan
    pub fn incoming(&self) -> Vec<&PackageDefinition> {
        self.atoms().into_iter().filter_map(|s| s.installs()).collect()
    }
}

impl fmt::Display for TransactionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            match step {
                Step::Group(steps) => {
                    writeln!(f, "  together:")?;
                    for inner in steps {
                        writeln!(f, "    {}", inner)?;
                    }
                }
                step => writeln!(f, "  {}", step)?,
            }
        }
        write!(
            f,
            "{} to install, {} to remove, {} to replace",
            self.install_count(),
            self.remove_count(),
            self.replace_count()
        )
    }
}

/// Compute the ordered steps taking `current` to `target`
pub fn plan(current: &DepGraph, target: &DepGraph) -> TransactionPlan {
    let mut by_name: BTreeMap<&str, Step> = BTreeMap::new();
    for record in target.iter() {
        let step = match current.get(record.name()) {
            None => Step::Install(record.definition.clone()),
            Some(old) if old.id() != record.id() => Step::Replace {
                old: old.id().clone(),
                new: record.definition.clone(),
            },
            Some(_) => continue,
        };
        by_name.insert(record.name(), step);
    }
    for record in current.iter() {
        if target.get(record.name()).is_none() {
            by_name.insert(record.name(), Step::Remove(record.id().clone()));
        }
    }

    let names: Vec<&str> = by_name.keys().copied().collect();
    let index: BTreeMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let steps: Vec<Step> = by_name.into_values().collect();

    // after[v] holds the steps v must follow
    let mut after: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); steps.len()];
    let installing = |name: &str| {
        index
            .get(name)
            .copied()
            .filter(|&i| steps[i].installs().is_some())
    };
    let removing = |name: &str| {
        index
            .get(name)
            .copied()
            .filter(|&i| steps[i].removes().is_some())
    };

    let clash_index = ClashIndex::new(current);
    let dependents = current.dependents();

    for (v, step) in steps.iter().enumerate() {
        if let Some(def) = step.installs() {
            // Dependencies are in place first
            if let Some(record) = target.get(def.name()) {
                for provider in &record.depends_on {
                    after[v].extend(installing(provider.name()));
                }
            }
            // Packages it clashes with are gone first
            for old in clash_index.suspects(def) {
                if old.name() != def.name() && old.definition.clashes_with(def) {
                    after[v].extend(removing(old.name()));
                }
            }
        }

        if let Step::Remove(id) = step {
            for dependent in dependents.get(id).into_iter().flatten() {
                after[v].extend(removing(dependent.name()));
                if let Some(now) = target.get(dependent.name()) {
                    for provider in &now.depends_on {
                        after[v].extend(installing(provider.name()));
                    }
                }
            }
        }

        after[v].remove(&v);
    }

    let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
    let ordered = Tarjan::new(&after)
        .run()
        .into_iter()
        .filter_map(|component| {
            let mut members: Vec<Step> = component
                .into_iter()
                .filter_map(|i| slots[i].take())
                .collect();
            match members.len() {
                0 => None,
                1 => members.pop(),
                _ => Some(Step::Group(members)),
            }
        })
        .collect();

    TransactionPlan { steps: ordered }
}

/// Installed packages that may clash with an incoming definition
struct ClashIndex<'g> {
    by_target: HashMap<&'g str, Vec<&'g InstalledRecord>>,
    /// Records declaring conflict edges of their own
    conflicting: Vec<&'g InstalledRecord>,
}

impl<'g> ClashIndex<'g> {
    fn new(current: &'g DepGraph) -> Self {
        let mut by_target: HashMap<&str, Vec<&InstalledRecord>> = HashMap::new();
        let mut conflicting = Vec::new();
        for record in current.iter() {
            by_target.entry(record.name()).or_default().push(record);
            for provide in &record.definition.provides {
                by_target
                    .entry(provide.capability.as_str())
                    .or_default()
                    .push(record);
            }
            if !record.definition.conflicts.is_empty() {
                conflicting.push(record);
            }
        }
        Self {
            by_target,
            conflicting,
        }
    }

    /// Records named by a conflict edge on either side, in name order
    fn suspects(&self, def: &PackageDefinition) -> Vec<&'g InstalledRecord> {
        let mut suspects: BTreeMap<&str, &'g InstalledRecord> = self
            .conflicting
            .iter()
            .map(|record| (record.name(), *record))
            .collect();
        for conflict in &def.conflicts {
            for &record in self.by_target.get(conflict.target.as_str()).into_iter().flatten() {
                suspects.insert(record.name(), record);
            }
        }
        suspects.into_values().collect()
    }
}

/// Tarjan's strongly connected components, emitted dependencies first
///
/// Runs with an explicit work stack, so long dependency chains do not
/// exhaust the thread's stack.
struct Tarjan<'g> {
    edges: &'g [BTreeSet<usize>],
    index: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next_index: usize,
    components: Vec<Vec<usize>>,
}

impl<'g> Tarjan<'g> {
    fn new(edges: &'g [BTreeSet<usize>]) -> Self {
        let n = edges.len();
        Self {
            edges,
            index: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next_index: 0,
            components: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<usize>> {
        for v in 0..self.edges.len() {
            if self.index[v].is_none() {
                self.connect(v);
            }
        }
        self.components
    }

    fn visit(&mut self, v: usize) {
        self.index[v] = Some(self.next_index);
        self.lowlink[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;
    }

    fn connect(&mut self, root: usize) {
        let edges = self.edges;
        // Nodes being explored, with the successors still to look at
        let mut work: Vec<(usize, btree_set::Iter<'g, usize>)> = vec![(root, edges[root].iter())];
        self.visit(root);

        while let Some((v, successors)) = work.last_mut() {
            let v = *v;
            match successors.next().copied() {
                Some(w) => match self.index[w] {
                    None => {
                        self.visit(w);
                        work.push((w, edges[w].iter()));
                    }
                    Some(w_index) if self.on_stack[w] => {
                        self.lowlink[v] = self.lowlink[v].min(w_index);
                    }
                    Some(_) => {}
                },
                None => {
                    work.pop();
                    if Some(self.lowlink[v]) == self.index[v] {
                        self.emit(v);
                    }
                    if let Some(&(parent, _)) = work.last() {
                        self.lowlink[parent] = self.lowlink[parent].min(self.lowlink[v]);
                    }
                }
            }
        }
    }

    /// Pop the component rooted at `v`
    fn emit(&mut self, v: usize) {
        let mut component = Vec::new();
        while let Some(w) = self.stack.pop() {
            self.on_stack[w] = false;
            component.push(w);
            if w == v {
                break;
            }
        }
        component.sort_unstable();
        self.components.push(component);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depgraph::{InstallReason, InstalledRecord};
    use crate::packages::PackageManifest;
    use proptest::prelude::*;

    fn def(name: &str, version: &str) -> PackageDefinition {
        PackageManifest::new(name, version)
            .into_definition("stable")
            .unwrap()
    }

    fn id(name: &str, version: &str) -> PackageId {
        PackageId::parse(name, version).unwrap()
    }

    /// Graph from `(name, version, [dependency names])`, every package explicit
    fn graph(packages: &[(&str, &str, &[&str])]) -> DepGraph {
        let versions: BTreeMap<&str, &str> = packages.iter().map(|(n, v, _)| (*n, *v)).collect();
        packages
            .iter()
            .map(|(name, version, deps)| {
                let mut record = InstalledRecord::new(def(name, version), InstallReason::Explicit);
                record.depends_on = deps.iter().map(|d| id(d, versions[d])).collect();
                record
            })
            .collect()
    }

    fn position(plan: &TransactionPlan, name: &str) -> usize {
        plan.steps
            .iter()
            .position(|s| {
                s.atoms().iter().any(|a| match a {
                    Step::Install(def) => def.name() == name,
                    Step::Remove(id) => id.name() == name,
                    Step::Replace { new, .. } => new.name() == name,
                    Step::Group(_) => false,
                })
            })
            .unwrap_or_else(|| panic!("{} not in plan:\n{}", name, plan))
    }

    #[test]
    fn test_install_after_dependencies() {
        let target = graph(&[
            ("app", "1.0.0", &["lib"]),
            ("lib", "2.3.0", &["base"]),
            ("base", "1.0.0", &[]),
        ]);
        let plan = plan(&DepGraph::new(), &target);

        assert_eq!(plan.install_count(), 3);
        assert!(position(&plan, "base") < position(&plan, "lib"));
        assert!(position(&plan, "lib") < position(&plan, "app"));
    }

    #[test]
    fn test_remove_dependents_first() {
        let current = graph(&[("app", "1.0.0", &["lib"]), ("lib", "2.3.0", &[])]);
        let plan = plan(&current, &DepGraph::new());

        assert_eq!(plan.remove_count(), 2);
        assert!(position(&plan, "app") < position(&plan, "lib"));
    }

    #[test]
    fn test_removal_waits_for_new_provider() {
        // app switches from openssl to libressl for the same capability
        let current = graph(&[("app", "1.0.0", &["openssl"]), ("openssl", "3.0.0", &[])]);
        let target = graph(&[("app", "1.0.0", &["libressl"]), ("libressl", "3.8.0", &[])]);
        let plan = plan(&current, &target);

        assert_eq!(plan.steps.len(), 2);
        assert!(position(&plan, "libressl") < position(&plan, "openssl"));
    }

    #[test]
    fn test_conflicting_package_removed_first() {
        let current = graph(&[("legacy", "1.0.0", &[])]);
        let mut target = DepGraph::new();
        target.insert(InstalledRecord::new(
            PackageManifest::new("modern", "1.0.0")
                .conflicts_with("legacy", "*")
                .into_definition("stable")
                .unwrap(),
            InstallReason::Explicit,
        ));
        let plan = plan(&current, &target);

        assert_eq!(
            plan.steps,
            vec![
                Step::Remove(id("legacy", "1.0.0")),
                Step::Install(target.get("modern").unwrap().definition.clone()),
            ]
        );
    }

    #[test]
    fn test_mutual_dependency_is_one_group() {
        let target = graph(&[("a", "1.0.0", &["b"]), ("b", "1.0.0", &["a"]), ("c", "1.0.0", &["a"])]);
        let plan = plan(&DepGraph::new(), &target);

        assert_eq!(plan.steps.len(), 2);
        match &plan.steps[0] {
            Step::Group(steps) => {
                assert_eq!(steps.len(), 2);
                assert_eq!(steps[0], Step::Install(def("a", "1.0.0")));
                assert_eq!(steps[1], Step::Install(def("b", "1.0.0")));
            }
            other => panic!("expected a group, got {}", other),
        }
        assert_eq!(plan.steps[1], Step::Install(def("c", "1.0.0")));
        assert_eq!(plan.install_count(), 3);
    }

    #[test]
    fn test_self_dependency_is_plain_step() {
        let target = graph(&[("solo", "1.0.0", &["solo"])]);
        let plan = plan(&DepGraph::new(), &target);
        assert_eq!(plan.steps, vec![Step::Install(def("solo", "1.0.0"))]);
    }

    #[test]
    fn test_replace_and_unchanged() {
        let current = graph(&[("app", "1.0.0", &["lib"]), ("lib", "1.0.0", &[])]);
        let target = graph(&[("app", "1.0.0", &["lib"]), ("lib", "1.5.0", &[])]);
        let plan = plan(&current, &target);

        assert_eq!(
            plan.steps,
            vec![Step::Replace {
                old: id("lib", "1.0.0"),
                new: def("lib", "1.5.0"),
            }]
        );
        assert_eq!(plan.replace_count(), 1);
        assert_eq!(plan.incoming().len(), 1);
    }

    #[test]
    fn test_identical_graphs_plan_nothing() {
        let current = graph(&[("app", "1.0.0", &["lib"]), ("lib", "1.0.0", &[])]);
        let mut target = current.clone();
        if let Some(mut lib) = target.remove("lib") {
            lib.reason = InstallReason::DependencyOf(BTreeSet::new());
            target.insert(lib);
        }
        assert!(plan(&current, &target).is_empty());
    }

    #[test]
    fn test_summary() {
        let target = graph(&[("a", "1.0.0", &["b"]), ("b", "1.0.0", &["a"])]);
        let text = plan(&DepGraph::new(), &target).to_string();
        assert!(text.contains("together:"));
        assert!(text.contains("    install a#1.0.0"));
        assert!(text.ends_with("2 to install, 0 to remove, 0 to replace"));
    }

    /// `p0` depends on `p1`, which depends on `p2`, and so on
    fn long_chain(length: usize) -> DepGraph {
        (0..length)
            .map(|i| {
                let mut record =
                    InstalledRecord::new(def(&format!("p{}", i), "1.0.0"), InstallReason::Explicit);
                if i + 1 < length {
                    record.depends_on.insert(id(&format!("p{}", i + 1), "1.0.0"));
                }
                record
            })
            .collect()
    }

    #[test]
    fn test_long_chain_plans_without_recursion() {
        let length = 100_000;
        let chain = long_chain(length);
        let last = format!("p{}", length - 1);

        let install = plan(&DepGraph::new(), &chain);
        assert_eq!(install.steps.len(), length);
        assert_eq!(install.steps[0], Step::Install(def(&last, "1.0.0")));
        assert_eq!(install.steps[length - 1], Step::Install(def("p0", "1.0.0")));

        let remove = plan(&chain, &DepGraph::new());
        assert_eq!(remove.steps.len(), length);
        assert_eq!(remove.steps[0], Step::Remove(id("p0", "1.0.0")));
        assert_eq!(remove.steps[length - 1], Step::Remove(id(&last, "1.0.0")));
    }

    #[test]
    fn test_long_cycle_is_one_group() {
        let length = 50_000;
        let mut cycle = long_chain(length);
        if let Some(mut last) = cycle.remove(&format!("p{}", length - 1)) {
            last.depends_on.insert(id("p0", "1.0.0"));
            cycle.insert(last);
        }

        let plan = plan(&DepGraph::new(), &cycle);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.install_count(), length);
    }

    /// Dependency lists where package `i` only depends on packages before it
    fn acyclic() -> impl Strategy<Value = Vec<Vec<usize>>> {
        (1usize..12).prop_flat_map(|n| {
            (0..n)
                .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
                .collect::<Vec<_>>()
        })
    }

    fn numbered(deps: &[Vec<usize>]) -> (Vec<String>, DepGraph) {
        let names: Vec<String> = (0..deps.len()).map(|i| format!("p{:02}", i)).collect();
        let graph = deps
            .iter()
            .enumerate()
            .map(|(i, ds)| {
                let mut record =
                    InstalledRecord::new(def(&names[i], "1.0.0"), InstallReason::Explicit);
                record.depends_on = ds
                    .iter()
                    .filter(|&&d| d < i)
                    .map(|&d| id(&names[d], "1.0.0"))
                    .collect();
                record
            })
            .collect();
        (names, graph)
    }

    proptest! {
        #[test]
        fn prop_acyclic_installs_are_ordered(deps in acyclic()) {
            let (names, target) = numbered(&deps);
            let plan = plan(&DepGraph::new(), &target);

            prop_assert_eq!(plan.steps.len(), names.len());
            prop_assert!(plan.steps.iter().all(|s| !matches!(s, Step::Group(_))));
            for (i, ds) in deps.iter().enumerate() {
                for &d in ds.iter().filter(|&&d| d < i) {
                    prop_assert!(position(&plan, &names[d]) < position(&plan, &names[i]));
                }
            }
        }

        #[test]
        fn prop_acyclic_removals_are_ordered(deps in acyclic()) {
            let (names, current) = numbered(&deps);
            let plan = plan(&current, &DepGraph::new());

            prop_assert_eq!(plan.remove_count(), names.len());
            for (i, ds) in deps.iter().enumerate() {
                for &d in ds.iter().filter(|&&d| d < i) {
                    prop_assert!(position(&plan, &names[i]) < position(&plan, &names[d]));
                }
            }
        }
    }
}
