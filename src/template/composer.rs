//! Template composition: splicing `{templates[name]}` references.
//!
//! Composition flattens nested template references into a single token
//! stream, merging serial-ness and semaphores from every referenced
//! template, transitively. The reference graph must be acyclic; cycles are
//! detected up front and reported instead of looping.

use std::collections::BTreeMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use thiserror::Error;
use tracing::debug;

use super::token::{Token, TokenStream};
use super::Template;

/// Errors raised during template composition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    /// The reference graph contains a cycle
    #[error("template reference cycle involving '{template}'")]
    Cycle {
        /// A template on the detected cycle
        template: String,
    },

    /// A template references a name that does not exist
    #[error("template '{referrer}' references unknown template '{name}'")]
    UnknownTemplate {
        /// The referencing template
        referrer: String,
        /// The missing name
        name: String,
    },

    /// The requested root template does not exist
    #[error("no such template: '{template}'")]
    NotFound {
        /// The missing name
        template: String,
    },
}

/// Compose a single template against the full template map.
pub fn compose(
    name: &str,
    templates: &BTreeMap<String, Template>,
) -> Result<Template, ComposeError> {
    if !templates.contains_key(name) {
        return Err(ComposeError::NotFound {
            template: name.to_string(),
        });
    }
    let mut expanded = compose_set(&[name.to_string()], templates)?;
    Ok(expanded.remove(name).expect("root was composed"))
}

/// Compose every template in the map.
pub fn compose_all(
    templates: &BTreeMap<String, Template>,
) -> Result<BTreeMap<String, Template>, ComposeError> {
    let roots: Vec<String> = templates.keys().cloned().collect();
    compose_set(&roots, templates)
}

fn compose_set(
    roots: &[String],
    templates: &BTreeMap<String, Template>,
) -> Result<BTreeMap<String, Template>, ComposeError> {
    // Reference graph over everything reachable from the roots. Edges point
    // referrer -> referee, so reverse topological order expands leaves first.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    let mut pending: Vec<&str> = Vec::new();
    for root in roots {
        let root = root.as_str();
        if !graph.contains_node(root) {
            graph.add_node(root);
            pending.push(root);
        }
    }
    while let Some(name) = pending.pop() {
        let template = &templates[name];
        for token in template.tokens.tokens() {
            let Token::Field(field) = token else { continue };
            let Some(referee) = field.template_ref() else {
                continue;
            };
            let Some((referee, _)) = templates.get_key_value(referee) else {
                return Err(ComposeError::UnknownTemplate {
                    referrer: name.to_string(),
                    name: referee.to_string(),
                });
            };
            let referee = referee.as_str();
            if !graph.contains_node(referee) {
                graph.add_node(referee);
                pending.push(referee);
            }
            graph.add_edge(name, referee, ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| ComposeError::Cycle {
        template: cycle.node_id().to_string(),
    })?;

    let mut expanded: BTreeMap<String, Template> = BTreeMap::new();
    for name in order.into_iter().rev() {
        let base = templates[name].clone();
        let flattened = splice(base, &expanded);
        debug!(
            template = name,
            serial = flattened.is_serial,
            semaphores = flattened.semaphores.len(),
            "composed template"
        );
        expanded.insert(name.to_string(), flattened);
    }
    Ok(expanded)
}

/// Replace every template reference with the referee's already-expanded
/// stream, merging serial-ness and semaphores.
fn splice(mut template: Template, expanded: &BTreeMap<String, Template>) -> Template {
    if !template.tokens.has_template_refs() {
        template.variables = template.tokens.variables();
        return template;
    }
    let mut tokens: Vec<Token> = Vec::new();
    for token in template.tokens.tokens() {
        let referee = match token {
            Token::Field(field) => field.template_ref(),
            Token::Literal(_) => None,
        };
        match referee {
            Some(name) => {
                let child = &expanded[name];
                tokens.extend(child.tokens.tokens().iter().cloned());
                template.is_serial |= child.is_serial;
                for (sem_name, sem) in &child.semaphores {
                    template
                        .semaphores
                        .entry(sem_name.clone())
                        .or_insert_with(|| sem.clone());
                }
            }
            None => tokens.push(token.clone()),
        }
    }
    template.tokens = TokenStream::from_tokens(tokens);
    template.variables = template.tokens.variables();
    template
}
