// src/resolver/search.rs

//! Backtracking search over package assignments
//!
//! The search works on a single mutable state. Every change to it is pushed
//! onto a trail, and a decision frame only remembers how long the trail and
//! the edge queue were when it was taken; going back to a frame pops the
//! trail down to that mark. Edges with a single viable candidate are
//! implied rather than decided: their assignment inherits the decision
//! levels that forced it and opens no frame.
//!
//! Failures carry the decision levels that caused them, so the search jumps
//! straight back to the most recent responsible decision instead of retrying
//! unrelated ones. Level 0 is the request itself; a failure caused only by
//! level 0 ends the search.

use super::conflict::{EdgeDescription, EdgeSource, Unsatisfiable};
use crate::depgraph::DepGraph;
use crate::packages::{PackageDefinition, PackageId};
use crate::universe::Universe;
use crate::version::VersionConstraint;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

/// A dependency edge waiting to be satisfied
#[derive(Debug, Clone)]
pub(super) struct Edge {
    pub source: EdgeSource,
    pub target: String,
    pub constraint: VersionConstraint,
    pub optional: bool,
    pub scope: Scope,
}

/// Repository and category a requested package must come from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub repository: Option<String>,
    pub category: Option<String>,
}

impl Scope {
    pub fn is_any(&self) -> bool {
        self.repository.is_none() && self.category.is_none()
    }

    pub fn admits(&self, def: &PackageDefinition) -> bool {
        self.repository.as_ref().is_none_or(|r| r == &def.repository)
            && self.category.as_ref().is_none_or(|c| c == &def.category)
    }
}

impl Edge {
    fn describe(&self) -> EdgeDescription {
        EdgeDescription::requires(self.source.clone(), &self.target, &self.constraint)
    }

    fn source_name(&self) -> Option<&str> {
        match &self.source {
            EdgeSource::Package(id) => Some(id.name()),
            _ => None,
        }
    }

    /// Whether the provider of this edge is installed on the user's behalf
    fn marks_explicit(&self) -> bool {
        matches!(self.source, EdgeSource::Request | EdgeSource::Explicit)
    }
}

/// Names whose newer versions are preferred
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Upgrade {
    Nothing,
    All,
    Names(BTreeSet<String>),
}

impl Upgrade {
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Upgrade::Nothing => false,
            Upgrade::All => true,
            Upgrade::Names(names) => names.contains(name),
        }
    }
}

/// Everything one search runs against
pub(super) struct Problem<'a> {
    pub universe: &'a Universe,
    pub installed: &'a DepGraph,
    /// Request and explicit edges, processed first
    pub edges: Vec<Edge>,
    /// Optional edges keeping dependency-only packages, processed last
    pub retained: Vec<Edge>,
    /// Names that must not be in the result
    pub absent: BTreeSet<String>,
    pub upgrade: Upgrade,
}

/// A package in the solution
#[derive(Debug, Clone)]
pub(super) struct Resolved<'a> {
    pub definition: &'a PackageDefinition,
    pub depends_on: BTreeSet<PackageId>,
    pub explicit: bool,
}

type Levels = BTreeSet<usize>;

#[derive(Debug)]
struct Assignment<'a> {
    def: &'a PackageDefinition,
    /// Decision levels this assignment rests on
    levels: Levels,
    /// The edge this package was chosen for
    reason: EdgeDescription,
    depends_on: BTreeSet<PackageId>,
    explicit: bool,
    /// Own dependency edges not yet processed; non-zero means in progress
    pending: usize,
}

/// A state mutation, undone by popping it off the trail
#[derive(Debug)]
enum Change {
    Assigned(String),
    Decremented(String),
    MadeExplicit(String),
    Linked { dependent: String, provider: PackageId },
}

/// Where the state stood when a decision was taken
#[derive(Debug, Clone, Copy)]
struct Mark {
    trail: usize,
    queue: usize,
    head: usize,
    retained_head: usize,
}

#[derive(Debug, Default)]
struct State<'a> {
    assigned: BTreeMap<String, Assignment<'a>>,
    /// Assigned names by the capabilities they declare
    providers: HashMap<String, Vec<String>>,
    /// Assigned names with conflict edges
    conflicting: Vec<String>,
    /// Pending edges; everything before `head` has been processed
    queue: Vec<Edge>,
    head: usize,
    retained_head: usize,
    trail: Vec<Change>,
}

impl<'a> State<'a> {
    fn next_edge(&mut self, retained: &[Edge]) -> Option<Edge> {
        if let Some(edge) = self.queue.get(self.head) {
            self.head += 1;
            return Some(edge.clone());
        }
        let edge = retained.get(self.retained_head)?;
        self.retained_head += 1;
        Some(edge.clone())
    }

    fn mark(&self) -> Mark {
        Mark {
            trail: self.trail.len(),
            queue: self.queue.len(),
            head: self.head,
            retained_head: self.retained_head,
        }
    }

    /// Revert every change made since `mark` was taken
    fn undo_to(&mut self, mark: Mark) {
        while self.trail.len() > mark.trail {
            let Some(change) = self.trail.pop() else {
                break;
            };
            match change {
                Change::Assigned(name) => {
                    if let Some(assignment) = self.assigned.remove(&name) {
                        for provide in &assignment.def.provides {
                            if let Some(names) = self.providers.get_mut(&provide.capability) {
                                names.pop();
                            }
                        }
                        if !assignment.def.conflicts.is_empty() {
                            self.conflicting.pop();
                        }
                    }
                }
                Change::Decremented(name) => {
                    if let Some(assignment) = self.assigned.get_mut(&name) {
                        assignment.pending += 1;
                    }
                }
                Change::MadeExplicit(name) => {
                    if let Some(assignment) = self.assigned.get_mut(&name) {
                        assignment.explicit = false;
                    }
                }
                Change::Linked { dependent, provider } => {
                    if let Some(assignment) = self.assigned.get_mut(&dependent) {
                        assignment.depends_on.remove(&provider);
                    }
                }
            }
        }
        self.queue.truncate(mark.queue);
        self.head = mark.head;
        self.retained_head = mark.retained_head;
    }

    /// One dependency edge of `name` has been taken off the queue
    fn decrement(&mut self, name: &str) {
        if let Some(assignment) = self.assigned.get_mut(name)
            && assignment.pending > 0
        {
            assignment.pending -= 1;
            self.trail.push(Change::Decremented(name.to_string()));
        }
    }

    fn source_levels(&self, edge: &Edge) -> Levels {
        edge.source_name()
            .and_then(|name| self.assigned.get(name))
            .map_or_else(|| Levels::from([0]), |a| a.levels.clone())
    }

    /// An assigned package satisfying `edge`, preferring a direct name match
    fn find_provider(&self, edge: &Edge) -> Option<String> {
        let satisfies = |name: &str| {
            self.assigned.get(name).is_some_and(|a| {
                edge.scope.admits(a.def) && a.def.satisfies(&edge.target, &edge.constraint).is_some()
            })
        };

        if satisfies(edge.target.as_str()) {
            return Some(edge.target.clone());
        }
        self.providers
            .get(&edge.target)?
            .iter()
            .filter(|name| satisfies(name.as_str()))
            .min()
            .cloned()
    }

    /// Note that `provider` satisfies `edge`
    fn record(&mut self, edge: &Edge, provider: &str) {
        let Some(assignment) = self.assigned.get_mut(provider) else {
            return;
        };
        if edge.marks_explicit() && !assignment.explicit {
            assignment.explicit = true;
            self.trail.push(Change::MadeExplicit(provider.to_string()));
        }
        if assignment.pending > 0 {
            trace!(
                "{} closes a cycle through {}, which is still in progress",
                edge.describe(),
                assignment.def.id
            );
        }
        let provider_id = assignment.def.id.clone();

        if let Some(source) = edge.source_name()
            && source != provider
            && let Some(dependent) = self.assigned.get_mut(source)
            && dependent.depends_on.insert(provider_id.clone())
        {
            self.trail.push(Change::Linked {
                dependent: source.to_string(),
                provider: provider_id,
            });
        }
    }

    /// Add `def` resting on `levels` and queue its dependencies
    fn assign(&mut self, def: &'a PackageDefinition, levels: Levels, edge: &Edge) {
        let name = def.name().to_string();
        for dep in &def.dependencies {
            self.queue.push(Edge {
                source: EdgeSource::Package(def.id.clone()),
                target: dep.target.clone(),
                constraint: dep.constraint.clone(),
                optional: dep.optional,
                scope: Scope::default(),
            });
        }
        for provide in &def.provides {
            self.providers
                .entry(provide.capability.clone())
                .or_default()
                .push(name.clone());
        }
        if !def.conflicts.is_empty() {
            self.conflicting.push(name.clone());
        }

        trace!("Assigning {} at levels {:?}", def.id, levels);
        self.assigned.insert(
            name.clone(),
            Assignment {
                def,
                levels,
                reason: edge.describe(),
                depends_on: BTreeSet::new(),
                explicit: false,
                pending: def.dependencies.len(),
            },
        );
        self.trail.push(Change::Assigned(name.clone()));
        self.record(edge, &name);
    }
}

/// Decision levels and edges responsible for a failure
#[derive(Debug, Default)]
struct Cause {
    levels: Levels,
    edges: Vec<EdgeDescription>,
}

impl Cause {
    fn new(levels: Levels, edge: EdgeDescription) -> Self {
        Cause {
            levels,
            edges: vec![edge],
        }
    }

    fn add_edge(&mut self, edge: EdgeDescription) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    fn merge(&mut self, other: Cause) {
        self.levels.extend(other.levels);
        for edge in other.edges {
            self.add_edge(edge);
        }
    }
}

struct Frame<'a> {
    level: usize,
    edge: Edge,
    mark: Mark,
    /// `None` skips an optional edge
    options: Vec<Option<&'a PackageDefinition>>,
    next: usize,
    causes: Cause,
}

struct Search<'p, 'a> {
    problem: &'p Problem<'a>,
    /// Installed definitions by name and by declared capability
    installed: HashMap<&'a str, Vec<&'a PackageDefinition>>,
    frames: Vec<Frame<'a>>,
}

/// Find an assignment satisfying every edge of `problem`
pub(super) fn solve<'a>(problem: &Problem<'a>) -> Result<Vec<Resolved<'a>>, Unsatisfiable> {
    let mut search = Search {
        problem,
        installed: index_installed(problem.installed),
        frames: Vec::new(),
    };
    let mut state = State {
        queue: problem.edges.clone(),
        ..Default::default()
    };

    loop {
        let Some(edge) = state.next_edge(&problem.retained) else {
            trace!(
                "Search finished with {} packages, {} open decisions",
                state.assigned.len(),
                search.frames.len()
            );
            return Ok(state
                .assigned
                .into_values()
                .map(|a| Resolved {
                    definition: a.def,
                    depends_on: a.depends_on,
                    explicit: a.explicit,
                })
                .collect());
        };

        if let Err(cause) = search.process(&mut state, edge) {
            search.backjump(&mut state, cause)?;
        }
    }
}

impl<'a> Search<'_, 'a> {
    fn process(&mut self, state: &mut State<'a>, edge: Edge) -> Result<(), Cause> {
        if let Some(source) = edge.source_name() {
            state.decrement(source);
        }

        if let Some(provider) = state.find_provider(&edge) {
            state.record(&edge, &provider);
            return Ok(());
        }

        let mut causes = Cause::new(state.source_levels(&edge), edge.describe());
        let mut options = Vec::new();
        for def in self.candidates(&edge) {
            match self.blocker(state, def) {
                None => options.push(Some(def)),
                Some(blocked) => causes.merge(blocked),
            }
        }

        if edge.optional {
            if options.is_empty() {
                trace!("Skipping optional edge {}", edge.describe());
                return Ok(());
            }
            options.push(None);
        }

        if options.is_empty() {
            trace!("No viable candidate for {}", edge.describe());
            return Err(causes);
        }

        if let [Some(def)] = options[..] {
            // Implied by whatever ruled out the alternatives
            state.assign(def, causes.levels, &edge);
            return Ok(());
        }

        let level = self.frames.len() + 1;
        trace!(
            "Decision level {} for {} ({} options)",
            level,
            edge.describe(),
            options.len()
        );
        self.frames.push(Frame {
            level,
            edge,
            mark: state.mark(),
            options,
            next: 0,
            causes,
        });
        self.take(state, level - 1);
        Ok(())
    }

    /// Rewind to frame `index` and take its current option
    fn take(&self, state: &mut State<'a>, index: usize) {
        let frame = &self.frames[index];
        state.undo_to(frame.mark);

        match frame.options[frame.next] {
            Some(def) => state.assign(def, Levels::from([frame.level]), &frame.edge),
            None => trace!("Leaving optional edge {} unsatisfied", frame.edge.describe()),
        }
    }

    /// Undo decisions up to the most recent one responsible for `cause`
    fn backjump(&mut self, state: &mut State<'a>, mut cause: Cause) -> Result<(), Unsatisfiable> {
        loop {
            let Some(level) = cause.levels.iter().copied().filter(|&l| l > 0).max() else {
                return Err(Unsatisfiable { edges: cause.edges });
            };

            self.frames.truncate(level);
            cause.levels.remove(&level);

            let retry = match self.frames.last_mut() {
                Some(frame) => {
                    frame.causes.merge(cause);
                    frame.next += 1;
                    frame.next < frame.options.len()
                }
                None => return Err(Unsatisfiable { edges: cause.edges }),
            };

            if retry {
                trace!("Backjumping to decision level {}", level);
                self.take(state, level - 1);
                return Ok(());
            }

            match self.frames.pop() {
                Some(frame) => {
                    trace!("Decision level {} exhausted", frame.level);
                    cause = frame.causes;
                }
                None => return Err(Unsatisfiable { edges: Vec::new() }),
            }
        }
    }

    /// Candidates for an edge in preference order
    fn candidates(&self, edge: &Edge) -> Vec<&'a PackageDefinition> {
        let problem = self.problem;
        let mut list: Vec<&'a PackageDefinition> = Vec::new();

        for def in problem.universe.lookup(&edge.target, &edge.constraint) {
            // Installed packages keep the definition they were installed from
            let def = problem
                .installed
                .get_id(&def.id)
                .map_or(def, |record| &record.definition);
            if !list.iter().any(|d| d.id == def.id) {
                list.push(def);
            }
        }

        for &def in self.installed.get(edge.target.as_str()).into_iter().flatten() {
            if def.satisfies(&edge.target, &edge.constraint).is_some()
                && !list.iter().any(|d| d.id == def.id)
            {
                list.push(def);
            }
        }

        list.retain(|def| edge.scope.admits(def));
        list.sort_by_key(|def| self.rank(def));
        list
    }

    /// Lower ranks are tried first; ties keep universe order
    fn rank(&self, def: &PackageDefinition) -> u8 {
        match self.problem.installed.get(def.name()) {
            Some(record) if self.problem.upgrade.includes(def.name()) => {
                if def.version() > record.id().version() {
                    0
                } else if &def.id == record.id() {
                    1
                } else {
                    2
                }
            }
            Some(record) if &def.id == record.id() => 0,
            _ => 1,
        }
    }

    /// Why `def` cannot be added to `state`, if it cannot
    fn blocker(&self, state: &State<'a>, def: &PackageDefinition) -> Option<Cause> {
        if self.problem.absent.contains(def.name()) {
            return Some(Cause::new(Levels::from([0]), EdgeDescription::removes(def.name())));
        }

        if let Some(other) = state.assigned.get(def.name()) {
            return Some(Cause::new(other.levels.clone(), other.reason.clone()));
        }

        // Only packages named by a conflict edge, on either side, can clash
        let mut suspects: BTreeSet<&str> = state.conflicting.iter().map(String::as_str).collect();
        for conflict in &def.conflicts {
            if state.assigned.contains_key(&conflict.target) {
                suspects.insert(&conflict.target);
            }
            if let Some(names) = state.providers.get(&conflict.target) {
                suspects.extend(names.iter().map(String::as_str));
            }
        }

        for name in suspects {
            let Some(other) = state.assigned.get(name) else {
                continue;
            };
            let conflict = def
                .conflicts_with(other.def)
                .map(|c| EdgeDescription::conflicts(&def.id, &c.target, &c.constraint))
                .or_else(|| {
                    other
                        .def
                        .conflicts_with(def)
                        .map(|c| EdgeDescription::conflicts(&other.def.id, &c.target, &c.constraint))
                });
            if let Some(conflict) = conflict {
                let mut cause = Cause::new(other.levels.clone(), conflict);
                cause.add_edge(other.reason.clone());
                return Some(cause);
            }
        }

        None
    }
}

fn index_installed(installed: &DepGraph) -> HashMap<&str, Vec<&PackageDefinition>> {
    let mut index: HashMap<&str, Vec<&PackageDefinition>> = HashMap::new();
    for record in installed.iter() {
        let def = &record.definition;
        index.entry(def.name()).or_default().push(def);
        for provide in &def.provides {
            index.entry(provide.capability.as_str()).or_default().push(def);
        }
    }
    index
}
