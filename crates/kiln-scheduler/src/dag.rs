//! DAG resolution for pipeline jobs.

use kiln_core::ConfigError;
use kiln_core::pipeline::PipelineDefinition;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// A node in the pipeline DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    /// Declaration index of the job template.
    pub index: usize,
    pub name: String,
}

/// Directed acyclic graph of job dependencies. An edge `a -> b` means `b`
/// needs `a`.
#[derive(Debug)]
pub struct PipelineDag {
    graph: DiGraph<DagNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl PipelineDag {
    /// Get the root jobs (jobs with no dependencies).
    pub fn roots(&self) -> Vec<&DagNode> {
        let mut roots: Vec<&DagNode> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect();
        roots.sort_by_key(|node| node.index);
        roots
    }

    /// Get jobs that need the given job.
    pub fn successors(&self, job: &str) -> Vec<&DagNode> {
        self.neighbors(job, Direction::Outgoing)
    }

    /// Get jobs the given job needs.
    pub fn predecessors(&self, job: &str) -> Vec<&DagNode> {
        self.neighbors(job, Direction::Incoming)
    }

    fn neighbors(&self, job: &str, direction: Direction) -> Vec<&DagNode> {
        let mut nodes: Vec<&DagNode> = self
            .name_to_index
            .get(job)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default();
        nodes.sort_by_key(|node| node.index);
        nodes
    }

    /// Ready sets: stage 0 holds the jobs without needs, stage `n` the jobs
    /// whose needs all lie in earlier stages. Each stage lists its jobs in
    /// declaration order.
    pub fn stages(&self) -> Vec<Vec<&DagNode>> {
        // The graph is verified acyclic on build.
        let order = toposort(&self.graph, None).unwrap_or_default();

        let mut level: HashMap<NodeIndex, usize> = HashMap::with_capacity(order.len());
        for &idx in &order {
            let depth = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter_map(|pred| level.get(&pred))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(idx, depth);
        }

        let depth = level.values().copied().max().map_or(0, |max| max + 1);
        let mut stages: Vec<Vec<&DagNode>> = vec![Vec::new(); depth];
        for (idx, stage) in level {
            if let Some(node) = self.graph.node_weight(idx) {
                stages[stage].push(node);
            }
        }
        for stage in &mut stages {
            stage.sort_by_key(|node| node.index);
        }
        stages
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// Builder for constructing pipeline DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the job graph, rejecting anything that could not be scheduled.
    pub fn build(&self, pipeline: &PipelineDefinition) -> Result<PipelineDag, ConfigError> {
        if pipeline.jobs.is_empty() {
            return Err(ConfigError::EmptyPipeline(pipeline.name.clone()));
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        // Add all jobs as nodes
        for (index, job) in pipeline.jobs.iter().enumerate() {
            if name_to_index.contains_key(&job.name) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            let idx = graph.add_node(DagNode {
                index,
                name: job.name.clone(),
            });
            name_to_index.insert(job.name.clone(), idx);
        }

        // Add edges for dependencies
        for job in &pipeline.jobs {
            let job_idx = name_to_index[&job.name];
            let mut seen = HashSet::new();
            for dep in &job.needs {
                if dep == &job.name {
                    return Err(ConfigError::SelfDependency(job.name.clone()));
                }
                let dep_idx = name_to_index.get(dep).ok_or_else(|| {
                    ConfigError::UnknownDependency {
                        job: job.name.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                if seen.insert(dep) {
                    graph.add_edge(*dep_idx, job_idx, ());
                }
            }
        }

        // Verify no cycles
        if let Err(cycle) = toposort(&graph, None) {
            let job = graph
                .node_weight(cycle.node_id())
                .map(|node| node.name.clone())
                .unwrap_or_default();
            return Err(ConfigError::CycleDetected(job));
        }

        Ok(PipelineDag {
            graph,
            name_to_index,
        })
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}
