//! Pluggable capabilities: expression evaluation and service factories.
//!
//! The interpreter itself has no expression language and no I/O. Guards,
//! assignments, and payload expressions are opaque strings handed to an
//! [`Evaluator`]; declared invocations are resolved to
//! [`ServiceFactory`](crate::invoke::ServiceFactory) instances by string
//! discriminator. The [`CapabilityRegistry`] is where an embedding
//! application wires both in.
//!
//! Guard evaluation is synchronous and must be side-effect free on the
//! interpreter's view of the world: an evaluator may cache internally, but
//! the data store is only mutated through assignments and scripts.
//!
//! # Examples
//!
//! ```rust
//! use harelite::capability::{BasicEvaluator, Evaluator};
//! use harelite::datamodel::{DataModelValue, DataStore};
//!
//! let eval = BasicEvaluator;
//! let mut data = DataStore::default();
//! data.set_path("order.total", DataModelValue::Number(42.0));
//!
//! assert!(eval.eval_guard("order.total == 42", &data, None).unwrap());
//! assert!(!eval.eval_guard("order.missing", &data, None).unwrap());
//! ```

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::datamodel::{DataModelValue, DataStore};
use crate::event::EventObject;
use crate::invoke::ServiceFactory;

/// Expression evaluation failure.
///
/// The interpreter converts these into `error.execution` events; they never
/// abort an instance on their own.
#[derive(Debug, Error, Diagnostic)]
pub enum EvalError {
    #[error("cannot parse expression '{expr}': {reason}")]
    #[diagnostic(code(harelite::capability::syntax))]
    Syntax { expr: String, reason: String },

    #[error("expression '{expr}' is not supported by this evaluator")]
    #[diagnostic(
        code(harelite::capability::unsupported),
        help("register a richer evaluator on the capability registry")
    )]
    Unsupported { expr: String },

    #[error("{0}")]
    #[diagnostic(code(harelite::capability::evaluation))]
    Message(String),
}

/// Synchronous expression evaluator over the data store.
///
/// `event` carries the event being processed, exposed to expressions under
/// the `_event` pseudo-variable; it is `None` during eventless work.
pub trait Evaluator: Send + Sync {
    /// Evaluate a guard to a boolean.
    fn eval_guard(
        &self,
        expr: &str,
        data: &DataStore,
        event: Option<&EventObject>,
    ) -> Result<bool, EvalError>;

    /// Evaluate an expression to a value.
    fn eval_value(
        &self,
        expr: &str,
        data: &DataStore,
        event: Option<&EventObject>,
    ) -> Result<DataModelValue, EvalError>;

    /// Run a script for its side effects on the data store.
    fn exec_script(
        &self,
        src: &str,
        data: &mut DataStore,
        event: Option<&EventObject>,
    ) -> Result<(), EvalError>;
}

/// Minimal built-in evaluator.
///
/// Supports literals (`true`, `false`, `null`, `undefined`, numbers, quoted
/// strings), dotted data-store lookups, `_event.name` / `_event.data.*`
/// access, prefix `!`, and a single `==` / `!=` comparison. Scripts are
/// semicolon-separated `location = expr` assignments. Anything richer needs a
/// custom [`Evaluator`] registration.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicEvaluator;

impl BasicEvaluator {
    fn literal(expr: &str) -> Option<DataModelValue> {
        match expr {
            "true" => return Some(DataModelValue::Boolean(true)),
            "false" => return Some(DataModelValue::Boolean(false)),
            "null" => return Some(DataModelValue::Null),
            "undefined" => return Some(DataModelValue::Undefined),
            _ => {}
        }
        // Only finite parses count as number literals; "NaN" and "inf" fall
        // through to the data-store lookup path and read as Undefined.
        if let Ok(n) = expr.parse::<f64>()
            && n.is_finite()
        {
            return Some(DataModelValue::Number(n));
        }
        let quoted = (expr.starts_with('\'') && expr.ends_with('\'') && expr.len() >= 2)
            || (expr.starts_with('"') && expr.ends_with('"') && expr.len() >= 2);
        if quoted {
            return Some(DataModelValue::String(expr[1..expr.len() - 1].to_string()));
        }
        None
    }

    fn event_lookup(path: &str, event: Option<&EventObject>) -> DataModelValue {
        let Some(event) = event else {
            return DataModelValue::Undefined;
        };
        let mut segments = path.split('.');
        match segments.next() {
            Some("name") => DataModelValue::String(event.name.clone()),
            Some("data") => {
                let mut current = &event.data;
                for segment in segments {
                    current = current.get(segment);
                }
                current.clone()
            }
            _ => DataModelValue::Undefined,
        }
    }

    fn term(
        expr: &str,
        data: &DataStore,
        event: Option<&EventObject>,
    ) -> Result<DataModelValue, EvalError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(EvalError::Syntax {
                expr: expr.to_string(),
                reason: "empty expression".to_string(),
            });
        }
        if let Some(negated) = expr.strip_prefix('!') {
            let inner = Self::term(negated, data, event)?;
            return Ok(DataModelValue::Boolean(!inner.is_truthy()));
        }
        if let Some(lit) = Self::literal(expr) {
            return Ok(lit);
        }
        if expr == "_event" {
            return Ok(DataModelValue::object([
                ("name", DataModelValue::String(
                    event.map(|e| e.name.clone()).unwrap_or_default(),
                )),
                ("data", event.map_or(DataModelValue::Undefined, |e| e.data.clone())),
            ]));
        }
        if let Some(path) = expr.strip_prefix("_event.") {
            return Ok(Self::event_lookup(path, event));
        }
        if expr
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        {
            return Ok(data.get_path(expr));
        }
        Err(EvalError::Unsupported {
            expr: expr.to_string(),
        })
    }
}

impl Evaluator for BasicEvaluator {
    fn eval_guard(
        &self,
        expr: &str,
        data: &DataStore,
        event: Option<&EventObject>,
    ) -> Result<bool, EvalError> {
        Ok(self.eval_value(expr, data, event)?.is_truthy())
    }

    fn eval_value(
        &self,
        expr: &str,
        data: &DataStore,
        event: Option<&EventObject>,
    ) -> Result<DataModelValue, EvalError> {
        let expr = expr.trim();
        if let Some((lhs, rhs)) = expr.split_once("==").filter(|_| !expr.contains("!=")) {
            let left = Self::term(lhs, data, event)?;
            let right = Self::term(rhs, data, event)?;
            return Ok(DataModelValue::Boolean(left == right));
        }
        if let Some((lhs, rhs)) = expr.split_once("!=") {
            let left = Self::term(lhs, data, event)?;
            let right = Self::term(rhs, data, event)?;
            return Ok(DataModelValue::Boolean(left != right));
        }
        Self::term(expr, data, event)
    }

    fn exec_script(
        &self,
        src: &str,
        data: &mut DataStore,
        event: Option<&EventObject>,
    ) -> Result<(), EvalError> {
        for statement in src.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            let Some((location, expr)) = statement.split_once('=') else {
                return Err(EvalError::Unsupported {
                    expr: statement.to_string(),
                });
            };
            let value = self.eval_value(expr, data, event)?;
            data.set_path(location.trim(), value);
        }
        Ok(())
    }
}

/// Registry mapping string discriminators to evaluators and service
/// factories.
///
/// Charts reference both by name only; the embedding application decides
/// what the names mean. [`CapabilityRegistry::default`] pre-registers the
/// [`BasicEvaluator`] under `"basic"` and makes it the active evaluator.
#[derive(Clone)]
pub struct CapabilityRegistry {
    evaluators: FxHashMap<String, Arc<dyn Evaluator>>,
    services: FxHashMap<String, Arc<dyn ServiceFactory>>,
    active_evaluator: String,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        let mut evaluators: FxHashMap<String, Arc<dyn Evaluator>> = FxHashMap::default();
        evaluators.insert("basic".to_string(), Arc::new(BasicEvaluator));
        Self {
            evaluators,
            services: FxHashMap::default(),
            active_evaluator: "basic".to_string(),
        }
    }
}

impl CapabilityRegistry {
    /// Register an evaluator under a discriminator.
    pub fn register_evaluator(&mut self, kind: impl Into<String>, evaluator: Arc<dyn Evaluator>) {
        self.evaluators.insert(kind.into(), evaluator);
    }

    /// Select which registered evaluator drives guard and expression
    /// evaluation.
    pub fn set_active_evaluator(&mut self, kind: impl Into<String>) {
        self.active_evaluator = kind.into();
    }

    /// The evaluator currently driving interpretation.
    ///
    /// Falls back to [`BasicEvaluator`] when the active discriminator has
    /// been removed.
    #[must_use]
    pub fn evaluator(&self) -> Arc<dyn Evaluator> {
        self.evaluators
            .get(&self.active_evaluator)
            .cloned()
            .unwrap_or_else(|| Arc::new(BasicEvaluator))
    }

    /// Register a service factory under a discriminator.
    pub fn register_service(&mut self, kind: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        self.services.insert(kind.into(), factory);
    }

    /// Look up the factory for an invoke kind.
    #[must_use]
    pub fn service(&self, kind: &str) -> Option<Arc<dyn ServiceFactory>> {
        self.services.get(kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparisons_and_literals() {
        let eval = BasicEvaluator;
        let mut data = DataStore::default();
        data.set_path("mode", DataModelValue::String("fast".to_string()));

        assert!(eval.eval_guard("mode == 'fast'", &data, None).unwrap());
        assert!(eval.eval_guard("mode != 'slow'", &data, None).unwrap());
        assert!(!eval.eval_guard("!mode", &data, None).unwrap());
        assert_eq!(
            eval.eval_value("3.5", &data, None).unwrap(),
            DataModelValue::Number(3.5)
        );
    }

    #[test]
    fn event_data_is_visible_under_the_event_pseudo_variable() {
        let eval = BasicEvaluator;
        let data = DataStore::default();
        let event = EventObject::new(
            "order.placed",
            DataModelValue::object([("total", DataModelValue::Number(7.0))]),
        );
        assert_eq!(
            eval.eval_value("_event.data.total", &data, Some(&event))
                .unwrap(),
            DataModelValue::Number(7.0)
        );
        assert!(eval
            .eval_guard("_event.name == 'order.placed'", &data, Some(&event))
            .unwrap());
    }

    #[test]
    fn scripts_apply_assignments_in_order() {
        let eval = BasicEvaluator;
        let mut data = DataStore::default();
        eval.exec_script("a = 1; b = a", &mut data, None).unwrap();
        assert_eq!(data.get_path("b"), DataModelValue::Number(1.0));
    }

    #[test]
    fn non_finite_spellings_are_not_number_literals() {
        let eval = BasicEvaluator;
        let data = DataStore::default();
        // "NaN" and "inf" parse as f64 but are not representable in the
        // logged value space, so they read as data-store lookups instead.
        assert!(eval.eval_value("NaN", &data, None).unwrap().is_undefined());
        assert!(eval.eval_value("inf", &data, None).unwrap().is_undefined());
        assert_eq!(
            eval.eval_value("-2.5", &data, None).unwrap(),
            DataModelValue::Number(-2.5)
        );
    }

    #[test]
    fn unsupported_expressions_error_rather_than_guess() {
        let eval = BasicEvaluator;
        let data = DataStore::default();
        let err = eval.eval_value("a + b", &data, None).unwrap_err();
        assert!(matches!(err, EvalError::Unsupported { .. }));
    }
}
