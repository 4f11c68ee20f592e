//! Workflow definitions: typed parameters, task/action nodes, and the builder.
//!
//! A [`DefinitionBuilder`] assembles a DAG of nodes. Each node declares a tuple
//! of typed input sources ([`Param<T>`] or [`TaskHandle<T>`]); data edges are
//! implied by those inputs and explicit ordering edges are added with
//! [`DefinitionBuilder::after`]. Registration is purely structural: no body runs
//! at build time. The finished [`Definition`] is immutable and can back any
//! number of concurrent runs.
//!
//! Internally every node is stored in the same tagged shape: a kind, a list of
//! input slots, and one type-erased body that receives the resolved input
//! values as JSON and returns its output as JSON. The typed builder methods do
//! the (de)serialization at that boundary.
//!
//! ```ignore
//! let mut b = Definition::builder("release");
//! let bump = b.param::<String>(ParamDef::new("bump", ParamKind::String).choices(["minor", "patch"]))?;
//! let next = b.task("next-version", (&bump,), |_ctx, (bump,)| async move { Ok(format!("v0.{bump}")) })?;
//! let approve = b.action("approve", (), broker.clone().gate())?;
//! let tag = b.action("tag", (&next,), |ctx, (version,)| async move {
//!     ctx.disable_retries();
//!     vcs.create_tag(&version).await
//! })?;
//! b.after(&tag, &approve)?;
//! b.output("version", &next)?;
//! let definition = b.build();
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use relflow_types::workflow::NodeKind;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

use super::approval::ApprovalBroker;
use super::context::TaskContext;
use super::dag::{DependencyGraph, EdgeKind};
pub use super::dag::NodeId;
use super::param::{self, Param, ParamDef, ValidationError};
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Construction errors, reported synchronously by the builder.
///
/// A failed call leaves the builder exactly as it was.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("name '{0}' is already used by a parameter or node")]
    DuplicateName(String),

    #[error("output '{0}' is already declared")]
    DuplicateOutput(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("handle '{0}' belongs to a different definition builder")]
    ForeignHandle(String),

    #[error("cycle detected: {0}")]
    CycleDetected(String),
}

// ---------------------------------------------------------------------------
// Input sources
// ---------------------------------------------------------------------------

/// Where a node input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// A top-level parameter, by name.
    Param(String),
    /// The output of another Task.
    Node(NodeId),
}

/// An input source tagged with the builder that issued it.
#[derive(Debug, Clone)]
pub struct SourceRef {
    builder: Uuid,
    label: String,
    source: InputSource,
}

/// Something a node can take as a typed input.
pub trait Source {
    type Output: DeserializeOwned + Send + 'static;

    fn source_ref(&self) -> SourceRef;
}

impl<T: DeserializeOwned + Send + 'static> Source for Param<T> {
    type Output = T;

    fn source_ref(&self) -> SourceRef {
        SourceRef {
            builder: self.builder,
            label: self.name.clone(),
            source: InputSource::Param(self.name.clone()),
        }
    }
}

impl<T: DeserializeOwned + Send + 'static> Source for TaskHandle<T> {
    type Output = T;

    fn source_ref(&self) -> SourceRef {
        SourceRef {
            builder: self.builder,
            label: self.name.clone(),
            source: InputSource::Node(self.id),
        }
    }
}

impl<S: Source + ?Sized> Source for &S {
    type Output = S::Output;

    fn source_ref(&self) -> SourceRef {
        (**self).source_ref()
    }
}

/// A tuple of input sources, decoded into a tuple of values for the body.
pub trait Inputs {
    type Values: Send + 'static;

    fn sources(&self) -> Vec<SourceRef>;

    fn decode(values: Vec<Value>) -> anyhow::Result<Self::Values>;
}

impl Inputs for () {
    type Values = ();

    fn sources(&self) -> Vec<SourceRef> {
        Vec::new()
    }

    fn decode(_values: Vec<Value>) -> anyhow::Result<Self::Values> {
        Ok(())
    }
}

fn decode_next<T: DeserializeOwned>(
    values: &mut std::vec::IntoIter<Value>,
    position: usize,
) -> anyhow::Result<T> {
    let value = values
        .next()
        .with_context(|| format!("missing value for input #{position}"))?;
    serde_json::from_value(value).with_context(|| format!("decoding input #{position}"))
}

macro_rules! impl_inputs {
    ($($s:ident => $idx:tt),+) => {
        impl<$($s: Source),+> Inputs for ($($s,)+) {
            type Values = ($(<$s as Source>::Output,)+);

            fn sources(&self) -> Vec<SourceRef> {
                vec![$(self.$idx.source_ref()),+]
            }

            fn decode(values: Vec<Value>) -> anyhow::Result<Self::Values> {
                let mut values = values.into_iter();
                Ok(($(decode_next::<<$s as Source>::Output>(&mut values, $idx)?,)+))
            }
        }
    };
}

impl_inputs!(A => 0);
impl_inputs!(A => 0, B => 1);
impl_inputs!(A => 0, B => 1, C => 2);
impl_inputs!(A => 0, B => 1, C => 2, D => 3);

// ---------------------------------------------------------------------------
// Node handles
// ---------------------------------------------------------------------------

/// Handle to a registered Task producing `T`.
pub struct TaskHandle<T> {
    builder: Uuid,
    id: NodeId,
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            builder: self.builder,
            id: self.id,
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Handle to a registered Action. Usable only as an ordering dependency.
#[derive(Debug, Clone)]
pub struct ActionHandle {
    builder: Uuid,
    id: NodeId,
    name: String,
}

impl ActionHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Any node handle, for ordering edges and per-node settings.
pub trait NodeRef {
    fn builder_id(&self) -> Uuid;
    fn node_id(&self) -> NodeId;
    fn node_name(&self) -> &str;
}

impl<T> NodeRef for TaskHandle<T> {
    fn builder_id(&self) -> Uuid {
        self.builder
    }

    fn node_id(&self) -> NodeId {
        self.id
    }

    fn node_name(&self) -> &str {
        &self.name
    }
}

impl NodeRef for ActionHandle {
    fn builder_id(&self) -> Uuid {
        self.builder
    }

    fn node_id(&self) -> NodeId {
        self.id
    }

    fn node_name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// NodeSpec
// ---------------------------------------------------------------------------

/// Type-erased node body: resolved input values in, JSON output out.
pub(crate) type NodeBody =
    Arc<dyn Fn(TaskContext, Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Deadline applied to each attempt of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttemptTimeout {
    /// The engine's configured `attempt_timeout_secs`.
    #[default]
    EngineDefault,
    After(Duration),
    /// No deadline. Only run cancellation ends the attempt.
    Unbounded,
}

/// One registered node.
#[derive(Clone)]
pub struct NodeSpec {
    name: String,
    kind: NodeKind,
    inputs: Vec<InputSource>,
    pub(crate) body: NodeBody,
    retry: Option<RetryPolicy>,
    attempt_timeout: AttemptTimeout,
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn inputs(&self) -> &[InputSource] {
        &self.inputs
    }

    /// Per-node retry override, if any.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    pub fn attempt_timeout(&self) -> AttemptTimeout {
        self.attempt_timeout
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("inputs", &self.inputs)
            .field("retry", &self.retry)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

fn erase_task<V, F, Fut, T>(decode: fn(Vec<Value>) -> anyhow::Result<V>, body: F) -> NodeBody
where
    V: Send + 'static,
    F: Fn(TaskContext, V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    Arc::new(move |ctx: TaskContext, values: Vec<Value>| match decode(values) {
        Ok(values) => {
            let fut = body(ctx, values);
            async move {
                let output = fut.await?;
                serde_json::to_value(output).context("serializing task output")
            }
            .boxed()
        }
        Err(e) => futures_util::future::ready(Err(e)).boxed(),
    })
}

fn erase_action<V, F, Fut>(decode: fn(Vec<Value>) -> anyhow::Result<V>, body: F) -> NodeBody
where
    V: Send + 'static,
    F: Fn(TaskContext, V) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx: TaskContext, values: Vec<Value>| match decode(values) {
        Ok(values) => body(ctx, values).map(|r| r.map(|()| Value::Null)).boxed(),
        Err(e) => futures_util::future::ready(Err(e)).boxed(),
    })
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

struct DefinitionInner {
    name: String,
    params: Vec<ParamDef>,
    nodes: Vec<NodeSpec>,
    index: HashMap<String, NodeId>,
    graph: DependencyGraph,
    outputs: Vec<(String, NodeId)>,
}

/// An immutable workflow definition. Cheap to clone.
#[derive(Clone)]
pub struct Definition {
    inner: Arc<DefinitionInner>,
}

impl Definition {
    pub fn builder(name: impl Into<String>) -> DefinitionBuilder {
        DefinitionBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &[ParamDef] {
        &self.inner.params
    }

    /// All nodes, indexed by `NodeId`.
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.inner.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.inner.nodes.get(id)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.inner.index.get(name).copied()
    }

    /// Direct dependencies of a node (data and ordering edges).
    pub fn dependencies_of(&self, id: NodeId) -> Vec<NodeId> {
        self.inner.graph.dependencies(id)
    }

    /// Nodes that directly depend on `id`.
    pub fn dependents_of(&self, id: NodeId) -> Vec<NodeId> {
        self.inner.graph.dependents(id)
    }

    /// Every node that transitively depends on `id`.
    pub fn downstream_of(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.inner.graph.transitive_dependents(id)
    }

    /// Declared top-level outputs as `(output name, producing node)`.
    pub fn outputs(&self) -> &[(String, NodeId)] {
        &self.inner.outputs
    }

    /// Nodes grouped by dependency depth.
    pub fn execution_waves(&self) -> Vec<Vec<NodeId>> {
        // The builder keeps the graph acyclic, so this cannot fail.
        self.inner.graph.execution_waves().unwrap_or_default()
    }

    /// Check run-start input values against the parameter declarations.
    pub fn validate_inputs(
        &self,
        inputs: HashMap<String, Value>,
    ) -> Result<BTreeMap<String, Value>, ValidationError> {
        param::validate_inputs(&self.inner.params, inputs)
    }
}

impl fmt::Debug for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<&str> = self.inner.nodes.iter().map(|n| n.name.as_str()).collect();
        f.debug_struct("Definition")
            .field("name", &self.inner.name)
            .field("params", &self.inner.params.len())
            .field("nodes", &nodes)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DefinitionBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Definition`]. Every method validates eagerly and leaves the
/// builder unchanged on error.
pub struct DefinitionBuilder {
    id: Uuid,
    name: String,
    params: Vec<ParamDef>,
    nodes: Vec<NodeSpec>,
    names: HashSet<String>,
    index: HashMap<String, NodeId>,
    graph: DependencyGraph,
    outputs: Vec<(String, NodeId)>,
}

impl DefinitionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            params: Vec::new(),
            nodes: Vec::new(),
            names: HashSet::new(),
            index: HashMap::new(),
            graph: DependencyGraph::new(),
            outputs: Vec::new(),
        }
    }

    /// Register a top-level parameter.
    pub fn param<T>(&mut self, def: ParamDef) -> Result<Param<T>, DefinitionError> {
        self.check_new_name(def.name())?;
        let name = def.name().to_string();
        self.names.insert(name.clone());
        self.params.push(def);
        Ok(Param::new(self.id, name))
    }

    /// Register a Task: a node whose output dependents can consume.
    pub fn task<I, F, Fut, T>(
        &mut self,
        name: &str,
        inputs: I,
        body: F,
    ) -> Result<TaskHandle<T>, DefinitionError>
    where
        I: Inputs,
        F: Fn(TaskContext, I::Values) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let body = erase_task(I::decode, body);
        let id = self.add_node(name, NodeKind::Task, inputs.sources(), body)?;
        Ok(TaskHandle {
            builder: self.id,
            id,
            name: name.to_string(),
            _marker: PhantomData,
        })
    }

    /// Register an Action: a side-effecting node with no output.
    pub fn action<I, F, Fut>(
        &mut self,
        name: &str,
        inputs: I,
        body: F,
    ) -> Result<ActionHandle, DefinitionError>
    where
        I: Inputs,
        F: Fn(TaskContext, I::Values) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let body = erase_action(I::decode, body);
        let id = self.add_node(name, NodeKind::Action, inputs.sources(), body)?;
        Ok(ActionHandle {
            builder: self.id,
            id,
            name: name.to_string(),
        })
    }

    /// Make `node` run only after `dependency` has succeeded.
    pub fn after(
        &mut self,
        node: &impl NodeRef,
        dependency: &impl NodeRef,
    ) -> Result<(), DefinitionError> {
        let to = self.own(node)?;
        let from = self.own(dependency)?;
        self.graph.add_edge(from, to, EdgeKind::Ordering)
    }

    /// Override the retry policy of one node.
    pub fn retry_policy(
        &mut self,
        node: &impl NodeRef,
        policy: RetryPolicy,
    ) -> Result<(), DefinitionError> {
        let id = self.own(node)?;
        self.nodes[id].retry = Some(policy);
        Ok(())
    }

    /// Override the per-attempt timeout of one node.
    pub fn attempt_timeout(
        &mut self,
        node: &impl NodeRef,
        timeout: Duration,
    ) -> Result<(), DefinitionError> {
        let id = self.own(node)?;
        self.nodes[id].attempt_timeout = AttemptTimeout::After(timeout);
        Ok(())
    }

    /// Let attempts of one node run until they finish or the run is cancelled.
    pub fn no_attempt_timeout(&mut self, node: &impl NodeRef) -> Result<(), DefinitionError> {
        let id = self.own(node)?;
        self.nodes[id].attempt_timeout = AttemptTimeout::Unbounded;
        Ok(())
    }

    /// Register an approval gate: an Action that parks until `broker` records
    /// a decision for it. Gates wait without an attempt timeout.
    pub fn approval<R>(
        &mut self,
        name: &str,
        broker: &Arc<ApprovalBroker<R>>,
    ) -> Result<ActionHandle, DefinitionError>
    where
        R: WorkflowRepository + 'static,
    {
        let gate = self.action(name, (), Arc::clone(broker).gate())?;
        self.no_attempt_timeout(&gate)?;
        Ok(gate)
    }

    /// Expose a Task's output as a named top-level output of the run.
    ///
    /// Output names have their own namespace. When no output is declared, a
    /// run returns every Task's output keyed by node name.
    pub fn output<T>(&mut self, name: &str, task: &TaskHandle<T>) -> Result<(), DefinitionError> {
        if name.trim().is_empty() {
            return Err(DefinitionError::InvalidName(
                "output name must not be empty".to_string(),
            ));
        }
        if self.outputs.iter().any(|(existing, _)| existing == name) {
            return Err(DefinitionError::DuplicateOutput(name.to_string()));
        }
        let id = self.own(task)?;
        self.outputs.push((name.to_string(), id));
        Ok(())
    }

    pub fn build(self) -> Definition {
        Definition {
            inner: Arc::new(DefinitionInner {
                name: self.name,
                params: self.params,
                nodes: self.nodes,
                index: self.index,
                graph: self.graph,
                outputs: self.outputs,
            }),
        }
    }

    fn add_node(
        &mut self,
        name: &str,
        kind: NodeKind,
        sources: Vec<SourceRef>,
        body: NodeBody,
    ) -> Result<NodeId, DefinitionError> {
        self.check_new_name(name)?;

        let mut inputs = Vec::with_capacity(sources.len());
        for source in sources {
            if source.builder != self.id {
                return Err(DefinitionError::ForeignHandle(source.label));
            }
            match &source.source {
                InputSource::Param(param) if !self.params.iter().any(|p| p.name() == param) => {
                    return Err(DefinitionError::UnknownDependency(format!(
                        "node '{name}' reads undeclared parameter '{param}'"
                    )));
                }
                InputSource::Node(id) if *id >= self.nodes.len() => {
                    return Err(DefinitionError::UnknownDependency(format!(
                        "node '{name}' reads undeclared node '{}'",
                        source.label
                    )));
                }
                _ => {}
            }
            inputs.push(source.source);
        }

        // A fresh node has no dependents, so its data edges cannot close a cycle.
        let id = self.graph.add_node(name);
        for input in &inputs {
            if let InputSource::Node(dep) = input {
                self.graph.add_edge(*dep, id, EdgeKind::Data)?;
            }
        }

        self.names.insert(name.to_string());
        self.index.insert(name.to_string(), id);
        self.nodes.push(NodeSpec {
            name: name.to_string(),
            kind,
            inputs,
            body,
            retry: None,
            attempt_timeout: AttemptTimeout::EngineDefault,
        });
        Ok(id)
    }

    fn check_new_name(&self, name: &str) -> Result<(), DefinitionError> {
        if name.trim().is_empty() {
            return Err(DefinitionError::InvalidName("name must not be empty".to_string()));
        }
        if self.names.contains(name) {
            return Err(DefinitionError::DuplicateName(name.to_string()));
        }
        Ok(())
    }

    fn own(&self, node: &impl NodeRef) -> Result<NodeId, DefinitionError> {
        if node.builder_id() != self.id || node.node_id() >= self.nodes.len() {
            return Err(DefinitionError::ForeignHandle(node.node_name().to_string()));
        }
        Ok(node.node_id())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use crate::workflow::param::ParamKind;
    use serde_json::json;

    fn sample() -> (DefinitionBuilder, Param<i64>, TaskHandle<i64>, ActionHandle) {
        let mut b = Definition::builder("sample");
        let base = b.param::<i64>(ParamDef::new("base", ParamKind::Integer)).unwrap();
        let double = b
            .task("double", (&base,), |_ctx, (x,): (i64,)| async move { Ok(x * 2) })
            .unwrap();
        let notify = b
            .action("notify", (&double,), |_ctx, (_x,): (i64,)| async move { Ok(()) })
            .unwrap();
        (b, base, double, notify)
    }

    #[test]
    fn data_inputs_imply_edges() {
        let (b, _, double, notify) = sample();
        let def = b.build();
        assert_eq!(def.nodes().len(), 2);
        assert_eq!(def.dependencies_of(notify.id()), vec![double.id()]);
        assert_eq!(def.node(double.id()).unwrap().inputs(), &[InputSource::Param("base".into())]);
        assert_eq!(def.node(notify.id()).unwrap().kind(), NodeKind::Action);
        assert_eq!(def.node_id("notify"), Some(notify.id()));
    }

    #[test]
    fn duplicate_names_rejected_across_params_and_nodes() {
        let (mut b, base, _, _) = sample();
        let err = b
            .task("base", (&base,), |_ctx, (x,): (i64,)| async move { Ok(x) })
            .unwrap_err();
        assert_eq!(err, DefinitionError::DuplicateName("base".to_string()));

        let err = b.param::<String>(ParamDef::new("double", ParamKind::String)).unwrap_err();
        assert_eq!(err, DefinitionError::DuplicateName("double".to_string()));

        let err = b.action("", (), |_ctx, ()| async move { Ok(()) }).unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidName(_)));
    }

    #[test]
    fn ordering_cycle_rejected_and_builder_unchanged() {
        let (mut b, _, double, notify) = sample();
        let err = b.after(&double, &notify).unwrap_err();
        assert!(matches!(err, DefinitionError::CycleDetected(_)));

        let def = b.build();
        assert!(def.dependencies_of(double.id()).is_empty());
        assert_eq!(def.execution_waves(), vec![vec![double.id()], vec![notify.id()]]);
    }

    #[test]
    fn foreign_handles_rejected() {
        let (_, other_param, other_task, _) = sample();
        let mut b = Definition::builder("other");
        let err = b
            .task("copy", (&other_param,), |_ctx, (x,): (i64,)| async move { Ok(x) })
            .unwrap_err();
        assert_eq!(err, DefinitionError::ForeignHandle("base".to_string()));

        let local = b.action("local", (), |_ctx, ()| async move { Ok(()) }).unwrap();
        assert!(matches!(
            b.after(&local, &other_task),
            Err(DefinitionError::ForeignHandle(_))
        ));
        assert!(matches!(
            b.output("x", &other_task),
            Err(DefinitionError::ForeignHandle(_))
        ));
    }

    #[test]
    fn outputs_must_be_unique() {
        let (mut b, _, double, _) = sample();
        b.output("result", &double).unwrap();
        assert_eq!(
            b.output("result", &double),
            Err(DefinitionError::DuplicateOutput("result".to_string()))
        );
        // Output names do not collide with node names.
        b.output("double", &double).unwrap();
        assert_eq!(b.build().outputs().len(), 2);
    }

    #[test]
    fn per_node_overrides_are_stored() {
        let (mut b, _, double, notify) = sample();
        b.retry_policy(&double, RetryPolicy::no_retry()).unwrap();
        b.attempt_timeout(&double, Duration::from_secs(5)).unwrap();
        let def = b.build();
        let spec = def.node(double.id()).unwrap();
        assert_eq!(spec.retry_policy().map(|p| p.max_attempts), Some(1));
        assert_eq!(spec.attempt_timeout(), AttemptTimeout::After(Duration::from_secs(5)));

        let fresh = def.node(notify.id()).unwrap();
        assert_eq!(fresh.attempt_timeout(), AttemptTimeout::EngineDefault);
    }

    #[test]
    fn approval_gate_has_no_attempt_timeout() {
        let broker = Arc::new(ApprovalBroker::new(InMemoryWorkflowRepository::new()));
        let mut b = Definition::builder("gated");
        let gate = b.approval("sign-off", &broker).unwrap();
        let def = b.build();

        let spec = def.node(gate.id()).unwrap();
        assert_eq!(spec.kind(), NodeKind::Action);
        assert_eq!(spec.attempt_timeout(), AttemptTimeout::Unbounded);
    }

    #[tokio::test]
    async fn erased_body_decodes_inputs_and_encodes_output() {
        let mut b = Definition::builder("bodies");
        let a = b.param::<String>(ParamDef::new("a", ParamKind::String)).unwrap();
        let n = b.param::<i64>(ParamDef::new("n", ParamKind::Integer)).unwrap();
        let joined = b
            .task("join", (&a, &n), |_ctx, (a, n): (String, i64)| async move {
                Ok(format!("{a}-{n}"))
            })
            .unwrap();
        let def = b.build();
        let body = def.node(joined.id()).unwrap().body.clone();

        let out = body(TaskContext::standalone("join"), vec![json!("go"), json!(1)])
            .await
            .unwrap();
        assert_eq!(out, json!("go-1"));

        let err = body(TaskContext::standalone("join"), vec![json!(1), json!(1)])
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("decoding input #0"));
    }

    #[tokio::test]
    async fn action_body_yields_null() {
        let mut b = Definition::builder("actions");
        let act = b.action("noop", (), |_ctx, ()| async move { Ok(()) }).unwrap();
        let def = b.build();
        let body = def.node(act.id()).unwrap().body.clone();
        assert_eq!(body(TaskContext::standalone("noop"), vec![]).await.unwrap(), Value::Null);
    }
}
