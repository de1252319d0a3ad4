use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use jobline_core::error::{BatchError, Result};
use jobline_core::graph::{ExecutionElement, TransitionAction};

/// What follows an element once its exit status is known.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Execute another element of the same scope.
    Next(Arc<ExecutionElement>),
    End { exit_status: Option<String> },
    Fail { exit_status: Option<String> },
    Stop {
        exit_status: Option<String>,
        restart: Option<String>,
    },
}

/// Resolves "what runs next" inside one scope: a job's top level, a flow,
/// or a split branch.
///
/// Targets are only looked up among the scope's own elements, so anything
/// outside the scope is unreachable. Each element may be entered once per
/// traversal.
pub struct Navigator {
    scope: String,
    elements: Vec<Arc<ExecutionElement>>,
    visited: HashSet<String>,
}

impl Navigator {
    pub fn new(scope: impl Into<String>, elements: &[ExecutionElement]) -> Self {
        Self {
            scope: scope.into(),
            elements: elements.iter().cloned().map(Arc::new).collect(),
            visited: HashSet::new(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// The entry element, or the element to resume at on restart.
    ///
    /// A restart point nested inside a flow or split resolves to the
    /// enclosing element of this scope.
    pub fn first_element(&mut self, restart_on: Option<&str>) -> Result<Arc<ExecutionElement>> {
        let element = match restart_on {
            None => self.elements.first().cloned().ok_or_else(|| {
                BatchError::illegal_transition(format!("scope '{}' has no elements", self.scope))
            })?,
            Some(id) => self
                .find(id)
                .or_else(|| self.elements.iter().find(|e| e.contains(id)).cloned())
                .ok_or_else(|| {
                    BatchError::illegal_transition(format!(
                        "restart point '{}' not found in scope '{}'",
                        id, self.scope
                    ))
                })?,
        };
        debug!(scope = %self.scope, element = %element.id(), "First element resolved");
        self.visited.insert(element.id().to_string());
        Ok(element)
    }

    /// Evaluate `current`'s rules against `exit_status`, first match wins.
    ///
    /// The `next` attribute applies when no rule matches. `None` means the
    /// traversal ends here.
    pub fn next_transition(
        &mut self,
        current: &ExecutionElement,
        exit_status: &str,
    ) -> Result<Option<Transition>> {
        for rule in current.transitions() {
            if !glob_matches(&rule.on, exit_status)? {
                continue;
            }
            debug!(
                scope = %self.scope,
                element = %current.id(),
                exit_status,
                pattern = %rule.on,
                "Transition rule matched"
            );
            let transition = match &rule.action {
                TransitionAction::Next { to } => Transition::Next(self.resolve(current, to)?),
                TransitionAction::End { exit_status } => Transition::End {
                    exit_status: exit_status.clone(),
                },
                TransitionAction::Fail { exit_status } => Transition::Fail {
                    exit_status: exit_status.clone(),
                },
                TransitionAction::Stop {
                    exit_status,
                    restart,
                } => Transition::Stop {
                    exit_status: exit_status.clone(),
                    restart: restart.clone(),
                },
            };
            return Ok(Some(transition));
        }

        match current.next() {
            Some(to) => Ok(Some(Transition::Next(self.resolve(current, to)?))),
            None => Ok(None),
        }
    }

    fn find(&self, id: &str) -> Option<Arc<ExecutionElement>> {
        self.elements.iter().find(|e| e.id() == id).cloned()
    }

    fn resolve(&mut self, current: &ExecutionElement, to: &str) -> Result<Arc<ExecutionElement>> {
        let target = self.find(to).ok_or_else(|| {
            BatchError::illegal_transition(format!(
                "'{}' transitions to '{}', which is not in scope '{}'",
                current.id(),
                to,
                self.scope
            ))
        })?;
        if current.is_decision() && target.is_decision() {
            return Err(BatchError::illegal_transition(format!(
                "decision '{}' is followed by decision '{}'",
                current.id(),
                to
            )));
        }
        if !self.visited.insert(to.to_string()) {
            return Err(BatchError::illegal_transition(format!(
                "'{}' transitions back to already executed '{}' in scope '{}'",
                current.id(),
                to,
                self.scope
            )));
        }
        Ok(target)
    }
}

/// Match an exit status against a pattern where `*` matches any run of
/// characters and `?` exactly one. Everything else matches literally.
pub fn glob_matches(pattern: &str, exit_status: &str) -> Result<bool> {
    if !pattern.contains(['*', '?']) {
        return Ok(pattern == exit_status);
    }
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    let re = Regex::new(&expr)
        .map_err(|e| BatchError::illegal_transition(format!("bad pattern '{}': {}", pattern, e)))?;
    Ok(re.is_match(exit_status))
}
