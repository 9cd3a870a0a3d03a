//! Graph rewrite rules and their composition.

use thiserror::Error;

use super::{LoomError, graph::Graph, graph::VarId};
use crate::config::Config;

pub use constant_folding::ConstantFolding;
pub use remove_reinterpret::RemoveRedundantReinterpret;
pub use replace_select::ReplaceSelect;
pub use unify_axes::UnifyAxes;

mod constant_folding;
mod remove_reinterpret;
mod replace_select;
mod unify_axes;

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Loom(#[from] LoomError),
    #[error("rule group `{group}` did not reach a fixed point within {max_iterations} iterations")]
    FixedPointNotReached {
        group: String,
        max_iterations: usize,
    },
    #[error("resource limit exceeded by {var}: {reason}")]
    ResourceLimitExceeded { var: VarId, reason: String },
}

/// A single graph rewrite pass.
pub trait OptimizeRule: Send + Sync {
    fn name(&self) -> &str;

    /// Rewrites the graph in place. Returns whether anything changed.
    fn optimize(&self, graph: &mut Graph) -> Result<bool, OptimizeError>;
}

/// An ordered list of rules, optionally repeated until none of them changes the graph.
pub struct OptimizeRuleGroup {
    name: String,
    rules: Vec<Box<dyn OptimizeRule>>,
    repeat: bool,
    max_iterations: usize,
}

impl OptimizeRuleGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: vec![],
            repeat: false,
            max_iterations: 1,
        }
    }

    pub fn add_rule(mut self, rule: impl OptimizeRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Repeats the rules until a fixed point, failing after `max_iterations` changing rounds.
    pub fn repeat(mut self, max_iterations: usize) -> Self {
        self.repeat = true;
        self.max_iterations = max_iterations.max(1);
        self
    }
}

impl OptimizeRule for OptimizeRuleGroup {
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(group = %self.name)))]
    fn optimize(&self, graph: &mut Graph) -> Result<bool, OptimizeError> {
        let mut changed_any = false;
        for iteration in 0..self.max_iterations {
            let mut changed = false;
            for rule in &self.rules {
                if rule.optimize(graph)? {
                    log::debug!("{}: rule `{}` changed the graph", self.name, rule.name());
                    changed = true;
                }
            }
            changed_any |= changed;
            if !changed || !self.repeat {
                log::debug!("{}: settled after {} iterations", self.name, iteration + 1);
                return Ok(changed_any);
            }
        }
        Err(OptimizeError::FixedPointNotReached {
            group: self.name.clone(),
            max_iterations: self.max_iterations,
        })
    }
}

/// The backend-independent pipeline run on every graph before kernel generation.
pub fn default_rules(config: &Config) -> OptimizeRuleGroup {
    OptimizeRuleGroup::new("simplify")
        .add_rule(UnifyAxes::from_config(config))
        .add_rule(RemoveRedundantReinterpret)
        .add_rule(ConstantFolding)
        .add_rule(ReplaceSelect)
        .repeat(config.max_iterations)
}
