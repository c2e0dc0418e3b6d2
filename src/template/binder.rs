//! Variable binding and instance generation.
//!
//! [`generate`] expands a flattened template against variable bindings into
//! a lazy, restartable, order-stable sequence of
//! [`CommandInstance`](crate::instance::CommandInstance)s: one per
//! combination in the cross product of all candidate value lists, minus
//! combinations rejected by `ensure_all` filters.
//!
//! Binding contract: a scalar value is a single candidate; a sequence is a
//! list of candidates; a sequence that should itself be one candidate must
//! be wrapped in an outer sequence (sequence-of-one-sequence).

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::filter::{FilterError, FilterExpr};
use super::temp::{TempFiles, TempSpec};
use super::token::{Accessor, Token};
use super::{Template, TEMPFILE_VAR};
use crate::instance::{CommandInstance, VariableAssignment};

/// Variable bindings: name to scalar or sequence of candidates
pub type Bindings = HashMap<String, Value>;

/// Errors raised while generating instances from one template
#[derive(Error, Debug)]
pub enum GenerateError {
    /// The template references variables absent from the bindings
    #[error("template '{template}' references unbound variables: {}", missing.join(", "))]
    MissingVariable {
        /// The template being generated
        template: String,
        /// The missing variable names, sorted
        missing: Vec<String>,
    },

    /// The template still contains `templates[...]` references; it must be
    /// composed before generation
    #[error("template '{template}' was not composed before generation")]
    Unexpanded {
        /// The template being generated
        template: String,
    },

    /// A filter predicate failed to evaluate for a combination
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A field reference could not be resolved against its bound value
    #[error("template '{template}': cannot render '{{{field}}}': {message}")]
    Render {
        /// The template being generated
        template: String,
        /// The field reference text
        field: String,
        /// What went wrong
        message: String,
    },

    /// Allocating a temporary file failed
    #[error("template '{template}': temporary file allocation failed: {source}")]
    TempFile {
        /// The template being generated
        template: String,
        /// The underlying I/O error
        source: std::io::Error,
    },
}

/// Expand a template against bindings into a lazy instance sequence.
///
/// Fails up front with [`GenerateError::MissingVariable`] if any referenced
/// variable (other than `TempFile`) is unbound. The returned iterator
/// yields instances in cross-product order (last variable varies fastest);
/// re-invoking `generate` recomputes the sequence independently.
pub fn generate<'a>(
    template: &'a Template,
    bindings: &Bindings,
    filters: &'a [FilterExpr],
    temp_spec: &'a TempSpec,
) -> Result<InstanceIter<'a>, GenerateError> {
    if template.tokens.has_template_refs() {
        return Err(GenerateError::Unexpanded {
            template: template.name.clone(),
        });
    }
    let mut missing: Vec<String> = template
        .variables
        .iter()
        .filter(|v| v.as_str() != TEMPFILE_VAR && !bindings.contains_key(*v))
        .cloned()
        .collect();
    if !missing.is_empty() {
        missing.sort();
        return Err(GenerateError::MissingVariable {
            template: template.name.clone(),
            missing,
        });
    }

    let mut names = Vec::new();
    let mut candidates: Vec<Vec<Value>> = Vec::new();
    for var in &template.variables {
        if var == TEMPFILE_VAR {
            continue;
        }
        let value = &bindings[var];
        let list = match value {
            Value::Array(items) => items.clone(),
            scalar => vec![scalar.clone()],
        };
        names.push(var.clone());
        candidates.push(list);
    }

    let exhausted = candidates.iter().any(|c| c.is_empty());
    let indices = vec![0; candidates.len()];
    debug!(
        template = %template.name,
        combinations = candidates.iter().map(|c| c.len()).product::<usize>(),
        filters = filters.len(),
        "generating instances"
    );
    Ok(InstanceIter {
        template,
        filters,
        temp_spec,
        names,
        candidates,
        indices,
        exhausted,
        produced: 0,
    })
}

/// Lazy iterator over the surviving cross-product combinations
#[derive(Debug)]
pub struct InstanceIter<'a> {
    template: &'a Template,
    filters: &'a [FilterExpr],
    temp_spec: &'a TempSpec,
    names: Vec<String>,
    candidates: Vec<Vec<Value>>,
    indices: Vec<usize>,
    exhausted: bool,
    produced: usize,
}

impl InstanceIter<'_> {
    fn advance(&mut self) {
        let mut i = self.indices.len();
        loop {
            if i == 0 {
                self.exhausted = true;
                return;
            }
            i -= 1;
            self.indices[i] += 1;
            if self.indices[i] < self.candidates[i].len() {
                return;
            }
            self.indices[i] = 0;
        }
    }

    fn current(&self) -> BTreeMap<String, Value> {
        self.names
            .iter()
            .enumerate()
            .map(|(pos, name)| (name.clone(), self.candidates[pos][self.indices[pos]].clone()))
            .collect()
    }

    fn passes_filters(&self, bound: &BTreeMap<String, Value>) -> Result<bool, FilterError> {
        if self.filters.is_empty() {
            return Ok(true);
        }
        let scope: HashMap<String, Value> =
            bound.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for filter in self.filters {
            if !filter.eval(&scope)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn render(&self, bound: &BTreeMap<String, Value>) -> Result<CommandInstance, GenerateError> {
        let mut temp = TempFiles::new(self.temp_spec);
        let mut script = String::new();
        for token in self.template.tokens.tokens() {
            match token {
                Token::Literal(text) => script.push_str(text),
                Token::Field(field) => {
                    if field.base == TEMPFILE_VAR {
                        let attr = match field.accessors.as_slice() {
                            [Accessor::Attr(attr)] => attr,
                            _ => {
                                return Err(GenerateError::Render {
                                    template: self.template.name.clone(),
                                    field: field.to_string(),
                                    message: "TempFile requires a single attribute, e.g. {TempFile.log}"
                                        .to_string(),
                                })
                            }
                        };
                        let path = temp.path(attr).map_err(|source| GenerateError::TempFile {
                            template: self.template.name.clone(),
                            source,
                        })?;
                        script.push_str(&path.display().to_string());
                    } else {
                        let value = resolve(field, &bound[&field.base]).map_err(|message| {
                            GenerateError::Render {
                                template: self.template.name.clone(),
                                field: field.to_string(),
                                message,
                            }
                        })?;
                        script.push_str(&render_value(&value));
                    }
                }
            }
        }
        Ok(CommandInstance {
            name: format!("{}#{}", self.template.name, self.produced),
            script,
            assignment: VariableAssignment {
                values: bound.clone(),
                temp_files: temp.into_files(),
            },
            semaphores: self.template.semaphores.clone(),
            cwd: self.template.cwd.clone(),
        })
    }
}

impl Iterator for InstanceIter<'_> {
    type Item = Result<CommandInstance, GenerateError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.exhausted {
                return None;
            }
            let bound = self.current();
            self.advance();

            match self.passes_filters(&bound) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => return Some(Err(err.into())),
            }
            return Some(match self.render(&bound) {
                Ok(instance) => {
                    self.produced += 1;
                    Ok(instance)
                }
                Err(err) => Err(err),
            });
        }
    }
}

/// Apply a field's accessor chain to its bound value
fn resolve(field: &super::token::FieldRef, value: &Value) -> Result<Value, String> {
    let mut current = value.clone();
    for accessor in &field.accessors {
        current = match accessor {
            Accessor::Attr(attr) => current
                .get(attr)
                .cloned()
                .ok_or_else(|| format!("no attribute '{attr}' on value {current}"))?,
            Accessor::Index(key) => match &current {
                Value::Array(items) => {
                    let index: usize = key
                        .parse()
                        .map_err(|_| format!("non-numeric index '{key}' into a sequence"))?;
                    items
                        .get(index)
                        .cloned()
                        .ok_or_else(|| format!("index {index} out of bounds"))?
                }
                Value::Object(_) => current
                    .get(key)
                    .cloned()
                    .ok_or_else(|| format!("no key '{key}' on value {current}"))?,
                other => return Err(format!("cannot index into {other}")),
            },
        };
    }
    Ok(current)
}

/// Literal string rendering: strings unquoted, everything else compact JSON
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
