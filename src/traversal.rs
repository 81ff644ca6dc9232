//! Traversal expressions
//!
//! Captures select topology nodes with a graph-traversal expression rather
//! than by name, so probes follow topology changes automatically. The
//! evaluator is pluggable; the built-in one covers the `G.V()` step with
//! chained `.Has('Key', 'Value')` metadata predicates.

use thiserror::Error;

use crate::graph::{Graph, Node};

/// Traversal evaluation errors
#[derive(Debug, Error)]
pub enum TraversalError {
    /// The expression does not parse
    #[error("traversal parse error: {0}")]
    Parse(String),
    /// The expression parsed but could not be executed against the graph
    #[error("traversal execution error: {0}")]
    Exec(String),
}

/// Evaluates a traversal expression against the graph, yielding the matched
/// node set
pub trait TraversalParser: Send + Sync {
    fn eval(&self, graph: &Graph, query: &str) -> Result<Vec<Node>, TraversalError>;
}

#[derive(Debug, PartialEq)]
enum Step {
    Has(String, String),
}

/// Built-in evaluator for `G.V()[.Has('Key', 'Value')]*`
pub struct GremlinParser;

impl GremlinParser {
    fn parse(query: &str) -> Result<Vec<Step>, TraversalError> {
        let compact: String = query.chars().filter(|c| !c.is_whitespace()).collect();
        let rest = compact
            .strip_prefix("G.V()")
            .or_else(|| compact.strip_prefix("g.V()"))
            .ok_or_else(|| TraversalError::Parse(format!("expected G.V() prefix: {query}")))?;

        let mut steps = Vec::new();
        let mut rest = rest;
        while !rest.is_empty() {
            let args = rest
                .strip_prefix(".Has(")
                .and_then(|r| r.split_once(')'))
                .ok_or_else(|| TraversalError::Parse(format!("unsupported step: {rest}")))?;
            let (inner, remainder) = args;
            let mut parts = inner.split(',').map(unquote);
            let key = parts
                .next()
                .flatten()
                .ok_or_else(|| TraversalError::Parse(format!("Has key missing: {inner}")))?;
            let value = parts
                .next()
                .flatten()
                .ok_or_else(|| TraversalError::Parse(format!("Has value missing: {inner}")))?;
            if parts.next().is_some() {
                return Err(TraversalError::Parse(format!(
                    "Has takes two arguments: {inner}"
                )));
            }
            steps.push(Step::Has(key, value));
            rest = remainder;
        }
        Ok(steps)
    }
}

fn unquote(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')))?;
    Some(inner.to_string())
}

impl TraversalParser for GremlinParser {
    fn eval(&self, graph: &Graph, query: &str) -> Result<Vec<Node>, TraversalError> {
        let steps = Self::parse(query)?;
        let nodes = graph
            .nodes()
            .into_iter()
            .filter(|node| {
                steps.iter().all(|step| match step {
                    Step::Has(key, value) => node.metadata.get(key) == Some(value),
                })
            })
            .collect();
        Ok(nodes)
    }
}
