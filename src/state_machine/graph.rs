//! Flow graph: named steps, unconditional and conditional edges
//!
//! The graph is validated once at construction. Anything that would make
//! routing fail at runtime (a decision with no target, a loop that never
//! yields to the user, a step that cannot finish) is rejected by
//! [`FlowGraphBuilder::build`].

use super::state::ConversationState;
use super::step::{Decision, StepId, StepKind};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;

/// Where an edge leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Step(StepId),
    End,
}

#[derive(Debug, Clone)]
enum Edge {
    Direct(Target),
    Conditional(BTreeMap<Decision, Target>),
}

impl Edge {
    fn targets(&self) -> Vec<Target> {
        match self {
            Edge::Direct(target) => vec![*target],
            Edge::Conditional(map) => map.values().copied().collect(),
        }
    }
}

/// Graph configuration errors; fatal at construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("No start step configured")]
    NoStart,
    #[error("Step {0} registered twice")]
    DuplicateStep(StepId),
    #[error("Step {0} has more than one outgoing edge set")]
    DuplicateEdge(StepId),
    #[error("Edge references unregistered step {0}")]
    UnknownStep(StepId),
    #[error("Step {0} has no outgoing edge")]
    MissingEdge(StepId),
    #[error("Interrupt step {0} must have a single unconditional successor")]
    InterruptNotUnconditional(StepId),
    #[error("Step {0} emits no decisions and cannot have a conditional edge")]
    ConditionalWithoutDecisions(StepId),
    #[error("Conditional edge from {step} has no target for decision {decision}")]
    MissingMapping { step: StepId, decision: Decision },
    #[error("Conditional edge from {step} maps decision {decision} which the step never emits")]
    UnexpectedMapping { step: StepId, decision: Decision },
    #[error("Cycle without an interrupt step through {0}")]
    UnguardedCycle(StepId),
    #[error("Step {0} is unreachable from the start")]
    Unreachable(StepId),
    #[error("End is unreachable from step {0}")]
    EndUnreachable(StepId),
}

/// Routing failures at runtime. These indicate a step wrote no decision
/// where one was required; the graph itself is known to be complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Unknown step {0}")]
    UnknownStep(StepId),
    #[error("Step {0} finished without a routing decision")]
    MissingDecision(StepId),
    #[error("No edge from {step} for decision {decision}")]
    Unmapped { step: StepId, decision: Decision },
}

#[derive(Debug, Default)]
pub struct FlowGraphBuilder {
    start: Option<StepId>,
    kinds: BTreeMap<StepId, StepKind>,
    edges: BTreeMap<StepId, Edge>,
    errors: Vec<GraphError>,
}

impl FlowGraphBuilder {
    pub fn start(mut self, step: StepId) -> Self {
        self.start = Some(step);
        self
    }

    pub fn step(mut self, id: StepId, kind: StepKind) -> Self {
        if self.kinds.insert(id, kind).is_some() {
            self.errors.push(GraphError::DuplicateStep(id));
        }
        self
    }

    pub fn edge(self, from: StepId, to: Target) -> Self {
        self.add_edge(from, Edge::Direct(to))
    }

    pub fn conditional(
        self,
        from: StepId,
        mapping: impl IntoIterator<Item = (Decision, Target)>,
    ) -> Self {
        self.add_edge(from, Edge::Conditional(mapping.into_iter().collect()))
    }

    fn add_edge(mut self, from: StepId, edge: Edge) -> Self {
        if self.edges.insert(from, edge).is_some() {
            self.errors.push(GraphError::DuplicateEdge(from));
        }
        self
    }

    pub fn build(self) -> Result<FlowGraph, GraphError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        let start = self.start.ok_or(GraphError::NoStart)?;
        if !self.kinds.contains_key(&start) {
            return Err(GraphError::UnknownStep(start));
        }

        let graph = FlowGraph {
            start,
            kinds: self.kinds,
            edges: self.edges,
        };
        graph.validate_edges()?;
        graph.validate_cycles()?;
        graph.validate_reachability()?;
        Ok(graph)
    }
}

/// A validated flow graph
#[derive(Debug, Clone)]
pub struct FlowGraph {
    start: StepId,
    kinds: BTreeMap<StepId, StepKind>,
    edges: BTreeMap<StepId, Edge>,
}

impl FlowGraph {
    pub fn builder() -> FlowGraphBuilder {
        FlowGraphBuilder::default()
    }

    pub fn start(&self) -> StepId {
        self.start
    }

    pub fn kind(&self, step: StepId) -> Option<StepKind> {
        self.kinds.get(&step).copied()
    }

    pub fn is_interrupt(&self, step: StepId) -> bool {
        self.kind(step) == Some(StepKind::Interrupt)
    }

    pub fn steps(&self) -> impl Iterator<Item = StepId> + '_ {
        self.kinds.keys().copied()
    }

    /// Evaluate the outgoing edge of `step` against current state
    pub fn next(&self, step: StepId, state: &ConversationState) -> Result<Target, RouteError> {
        match self.edges.get(&step) {
            None => Err(RouteError::UnknownStep(step)),
            Some(Edge::Direct(target)) => Ok(*target),
            Some(Edge::Conditional(map)) => {
                let decision = state.decision().ok_or(RouteError::MissingDecision(step))?;
                map.get(&decision)
                    .copied()
                    .ok_or(RouteError::Unmapped { step, decision })
            }
        }
    }

    fn successors(&self, step: StepId) -> Vec<Target> {
        self.edges.get(&step).map(Edge::targets).unwrap_or_default()
    }

    fn validate_edges(&self) -> Result<(), GraphError> {
        for (&from, edge) in &self.edges {
            if !self.kinds.contains_key(&from) {
                return Err(GraphError::UnknownStep(from));
            }
            for target in edge.targets() {
                if let Target::Step(to) = target {
                    if !self.kinds.contains_key(&to) {
                        return Err(GraphError::UnknownStep(to));
                    }
                }
            }
        }

        for (&step, &kind) in &self.kinds {
            let edge = self.edges.get(&step).ok_or(GraphError::MissingEdge(step))?;
            match edge {
                Edge::Direct(_) => {}
                Edge::Conditional(_) if kind == StepKind::Interrupt => {
                    return Err(GraphError::InterruptNotUnconditional(step));
                }
                Edge::Conditional(map) => {
                    let emitted = step.decisions();
                    if emitted.is_empty() {
                        return Err(GraphError::ConditionalWithoutDecisions(step));
                    }
                    if let Some(&decision) = emitted.iter().find(|d| !map.contains_key(d)) {
                        return Err(GraphError::MissingMapping { step, decision });
                    }
                    if let Some(&decision) = map.keys().find(|d| !emitted.contains(d)) {
                        return Err(GraphError::UnexpectedMapping { step, decision });
                    }
                }
            }
            if kind == StepKind::Interrupt && self.successors(step) == [Target::End] {
                return Err(GraphError::InterruptNotUnconditional(step));
            }
        }
        Ok(())
    }

    /// Every cycle must pass through an interrupt step, i.e. the subgraph of
    /// non-interrupt steps is acyclic.
    fn validate_cycles(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &FlowGraph,
            step: StepId,
            marks: &mut BTreeMap<StepId, Mark>,
        ) -> Result<(), GraphError> {
            match marks.get(&step) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(GraphError::UnguardedCycle(step)),
                None => {}
            }
            marks.insert(step, Mark::Visiting);
            for target in graph.successors(step) {
                if let Target::Step(next) = target {
                    if !graph.is_interrupt(next) {
                        visit(graph, next, marks)?;
                    }
                }
            }
            marks.insert(step, Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for step in self.steps().filter(|s| !self.is_interrupt(*s)) {
            visit(self, step, &mut marks)?;
        }
        Ok(())
    }

    fn validate_reachability(&self) -> Result<(), GraphError> {
        let mut reached = BTreeSet::from([self.start]);
        let mut queue = VecDeque::from([self.start]);
        while let Some(step) = queue.pop_front() {
            for target in self.successors(step) {
                if let Target::Step(next) = target {
                    if reached.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        if let Some(step) = self.steps().find(|s| !reached.contains(s)) {
            return Err(GraphError::Unreachable(step));
        }

        // Fixed point over "can reach End"
        let mut finishes: BTreeSet<StepId> = BTreeSet::new();
        loop {
            let before = finishes.len();
            for step in self.steps() {
                let done = self.successors(step).iter().any(|t| match t {
                    Target::End => true,
                    Target::Step(next) => finishes.contains(next),
                });
                if done {
                    finishes.insert(step);
                }
            }
            if finishes.len() == before {
                break;
            }
        }
        match self.steps().find(|s| !finishes.contains(s)) {
            Some(step) => Err(GraphError::EndUnreachable(step)),
            None => Ok(()),
        }
    }
}

/// The company-profile conversation
///
/// ```text
/// initial_overview -> [ask_user_interest] -> check_user_interest
///     more_details -> conduct_research -> [ask_email_interest]
///                     -> check_email_profile_interest
///                            email_request -> [collect_email] -> validate_email
///                                email_validated -> send_company_profile -> END
///                                collect_email   -> [collect_email]
///                                handoff         -> human_handoff -> END
///                            overview -> END
///     overview -> END
/// ```
///
/// Bracketed steps are interrupts.
pub fn company_profile_flow() -> Result<FlowGraph, GraphError> {
    use StepId::{
        AskEmailInterest, AskUserInterest, CheckEmailProfileInterest, CheckUserInterest,
        CollectEmail, ConductResearch, HumanHandoff, InitialOverview, SendCompanyProfile,
        ValidateEmail,
    };

    FlowGraph::builder()
        .start(InitialOverview)
        .step(InitialOverview, StepKind::Generative)
        .step(AskUserInterest, StepKind::Interrupt)
        .step(CheckUserInterest, StepKind::Classifier)
        .step(ConductResearch, StepKind::Generative)
        .step(AskEmailInterest, StepKind::Interrupt)
        .step(CheckEmailProfileInterest, StepKind::Classifier)
        .step(CollectEmail, StepKind::Interrupt)
        .step(ValidateEmail, StepKind::Classifier)
        .step(SendCompanyProfile, StepKind::TerminalAction)
        .step(HumanHandoff, StepKind::TerminalAction)
        .conditional(
            InitialOverview,
            [(Decision::Initial, Target::Step(AskUserInterest))],
        )
        .edge(AskUserInterest, Target::Step(CheckUserInterest))
        .conditional(
            CheckUserInterest,
            [
                (Decision::MoreDetails, Target::Step(ConductResearch)),
                (Decision::Overview, Target::End),
            ],
        )
        .edge(ConductResearch, Target::Step(AskEmailInterest))
        .edge(AskEmailInterest, Target::Step(CheckEmailProfileInterest))
        .conditional(
            CheckEmailProfileInterest,
            [
                (Decision::EmailRequest, Target::Step(CollectEmail)),
                (Decision::Overview, Target::End),
            ],
        )
        .edge(CollectEmail, Target::Step(ValidateEmail))
        .conditional(
            ValidateEmail,
            [
                (Decision::EmailValidated, Target::Step(SendCompanyProfile)),
                (Decision::CollectEmail, Target::Step(CollectEmail)),
                (Decision::Handoff, Target::Step(HumanHandoff)),
            ],
        )
        .edge(SendCompanyProfile, Target::End)
        .edge(HumanHandoff, Target::End)
        .build()
}
