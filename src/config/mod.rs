//! YAML runbook loading.
//!
//! A runbook defines, per namespace, the templates, variables, explicit
//! semaphores, and generation filters for one batch. Runbooks may import
//! other runbooks; imported definitions are merged first, so local
//! definitions win on conflict. Each template remembers the directory of
//! its defining runbook as the working directory for its instances.
//!
//! ```yaml
//! namespace: bench
//! import:
//!   - common.yaml
//! semaphores:
//!   gpu: 2
//! variables:
//!   threads: [1, 4, 8]
//! templates:
//!   build: make -j {threads}
//!   train:
//!     run: "{templates[build]} && ./train --threads {threads} > {TempFile.log}"
//!     serial: true
//!     semaphores: [gpu]
//! filters:
//!   train:
//!     ensure_all:
//!       - threads <= 8
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::semaphore::{SemaphoreError, SemaphoreRegistry};
use crate::template::{Bindings, FilterError, FilterExpr, Template, TokenError};

/// Errors raised while loading runbooks, fatal for the whole run
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The runbook file could not be read
    #[error("cannot read runbook '{path}': {source}")]
    Io {
        /// The offending path
        path: PathBuf,
        /// The underlying I/O error
        source: std::io::Error,
    },

    /// The runbook is not valid YAML or does not match the schema
    #[error("malformed runbook '{path}': {source}")]
    Yaml {
        /// The offending path
        path: PathBuf,
        /// The underlying parse error
        source: serde_yaml::Error,
    },

    /// A variable value could not be represented
    #[error("variable '{name}' has an unrepresentable value: {source}")]
    Value {
        /// The variable name
        name: String,
        /// The conversion error
        source: serde_json::Error,
    },

    /// A template's command text failed to parse
    #[error("template '{template}': {source}")]
    Template {
        /// The template name
        template: String,
        /// The underlying parse error
        source: TokenError,
    },

    /// A filter predicate failed to parse
    #[error("filter on template '{template}': {source}")]
    Filter {
        /// The template name
        template: String,
        /// The underlying parse error
        source: FilterError,
    },

    /// A semaphore declaration was invalid
    #[error(transparent)]
    Semaphore(#[from] SemaphoreError),

    /// A template attaches a semaphore that was never declared
    #[error("template '{template}' attaches undeclared semaphore '{name}'")]
    UnknownSemaphore {
        /// The template name
        template: String,
        /// The missing semaphore name
        name: String,
    },

    /// A `--set` override is not `name=value`
    #[error("invalid variable override '{spec}', expected name=value")]
    InvalidOverride {
        /// The override as given
        spec: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRunbook {
    namespace: Option<String>,
    #[serde(default)]
    import: Vec<PathBuf>,
    #[serde(default)]
    semaphores: BTreeMap<String, u32>,
    #[serde(default)]
    variables: BTreeMap<String, serde_yaml::Value>,
    #[serde(default)]
    templates: BTreeMap<String, RawTemplate>,
    #[serde(default)]
    filters: BTreeMap<String, RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTemplate {
    Text(String),
    Detailed {
        run: String,
        #[serde(default)]
        fragment: bool,
        #[serde(default)]
        serial: bool,
        #[serde(default)]
        semaphores: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    ensure_all: Vec<String>,
}

/// The merged view of one or more loaded runbooks
#[derive(Debug, Default)]
pub struct Runbook {
    /// Templates by name, pre-composition
    pub templates: BTreeMap<String, Template>,
    /// Variable bindings by name
    pub variables: Bindings,
    /// `ensure_all` predicates by template name
    pub filters: BTreeMap<String, Vec<FilterExpr>>,
    /// The registry holding every declared and serial semaphore
    pub registry: SemaphoreRegistry,
}

impl Runbook {
    /// Load one runbook file, following imports
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut runbook = Self::default();
        let mut seen = HashSet::new();
        runbook.merge_file(path.as_ref(), &mut seen)?;
        Ok(runbook)
    }

    /// Load several runbook files in order; later files win on conflict
    pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut runbook = Self::default();
        let mut seen = HashSet::new();
        for path in paths {
            runbook.merge_file(path.as_ref(), &mut seen)?;
        }
        Ok(runbook)
    }

    /// The predicates attached to a template, if any
    pub fn filters_for(&self, template: &str) -> &[FilterExpr] {
        self.filters.get(template).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Apply a `name=value` override; the value is parsed as a YAML scalar
    pub fn apply_override(&mut self, spec: &str) -> Result<(), ConfigError> {
        let (name, value) = spec.split_once('=').ok_or_else(|| ConfigError::InvalidOverride {
            spec: spec.to_string(),
        })?;
        if name.is_empty() {
            return Err(ConfigError::InvalidOverride {
                spec: spec.to_string(),
            });
        }
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(value).map_err(|_| ConfigError::InvalidOverride {
                spec: spec.to_string(),
            })?;
        let json = convert_value(name, yaml)?;
        debug!(name, value = %json, "variable override");
        self.variables.insert(name.to_string(), json);
        Ok(())
    }

    fn merge_file(&mut self, path: &Path, seen: &mut HashSet<PathBuf>) -> Result<(), ConfigError> {
        let canonical = path.canonicalize().map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !seen.insert(canonical.clone()) {
            debug!(path = %path.display(), "runbook already loaded, skipping");
            return Ok(());
        }

        let text = std::fs::read_to_string(&canonical).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawRunbook = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

        let dir = canonical
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let namespace = raw.namespace.clone().unwrap_or_else(|| {
            canonical
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string())
        });

        // Imports merge first so local definitions take precedence.
        for import in &raw.import {
            let import_path = if import.is_absolute() {
                import.clone()
            } else {
                dir.join(import)
            };
            self.merge_file(&import_path, seen)?;
        }

        for (name, capacity) in &raw.semaphores {
            self.registry.declare(name, *capacity)?;
        }

        for (name, value) in raw.variables {
            let json = convert_value(&name, value)?;
            self.variables.insert(name, json);
        }

        for (name, raw_template) in raw.templates {
            let template = build_template(&namespace, &name, raw_template, &dir, &self.registry)?;
            self.templates.insert(name, template);
        }

        for (name, raw_filter) in raw.filters {
            let mut parsed = Vec::with_capacity(raw_filter.ensure_all.len());
            for source in &raw_filter.ensure_all {
                parsed.push(FilterExpr::parse(source).map_err(|source| ConfigError::Filter {
                    template: name.clone(),
                    source,
                })?);
            }
            self.filters.insert(name, parsed);
        }

        info!(
            path = %path.display(),
            namespace = %namespace,
            templates = self.templates.len(),
            variables = self.variables.len(),
            "loaded runbook"
        );
        Ok(())
    }
}

fn build_template(
    namespace: &str,
    name: &str,
    raw: RawTemplate,
    dir: &Path,
    registry: &SemaphoreRegistry,
) -> Result<Template, ConfigError> {
    let (text, fragment, serial, attached) = match raw {
        RawTemplate::Text(text) => (text, false, false, Vec::new()),
        RawTemplate::Detailed {
            run,
            fragment,
            serial,
            semaphores,
        } => (run, fragment, serial, semaphores),
    };
    let mut template =
        Template::new(namespace, name, &text).map_err(|source| ConfigError::Template {
            template: name.to_string(),
            source,
        })?;
    template = template.with_cwd(dir);
    if fragment {
        template = template.fragment();
    }
    if serial {
        template = template.serial(registry);
    }
    for sem_name in attached {
        let sem = registry
            .get(&sem_name)
            .ok_or_else(|| ConfigError::UnknownSemaphore {
                template: name.to_string(),
                name: sem_name.clone(),
            })?;
        template = template.with_semaphore(sem);
    }
    Ok(template)
}

fn convert_value(name: &str, value: serde_yaml::Value) -> Result<serde_json::Value, ConfigError> {
    serde_json::to_value(value).map_err(|source| ConfigError::Value {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_templates_variables_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "bench.yaml",
            r#"
semaphores:
  gpu: 2
variables:
  threads: [1, 4]
  mode: fast
templates:
  build: make -j {threads}
  train:
    run: ./train --threads {threads}
    serial: true
    semaphores: [gpu]
filters:
  train:
    ensure_all:
      - threads <= 4
"#,
        );
        let runbook = Runbook::load(&path).unwrap();

        assert_eq!(runbook.variables["threads"], json!([1, 4]));
        assert_eq!(runbook.variables["mode"], json!("fast"));

        let build = &runbook.templates["build"];
        assert!(!build.is_serial);
        assert_eq!(build.namespace, "bench");
        assert_eq!(build.cwd.as_deref().unwrap(), dir.path().canonicalize().unwrap());

        let train = &runbook.templates["train"];
        assert!(train.is_serial);
        assert!(train.semaphores.contains_key("bench::train"));
        assert_eq!(train.semaphores["gpu"].capacity, 2);

        assert_eq!(runbook.filters_for("train").len(), 1);
        assert!(runbook.filters_for("build").is_empty());
    }

    #[test]
    fn imports_merge_with_local_precedence() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "common.yaml",
            r#"
variables:
  threads: 2
  shared: common
templates:
  build: make common
"#,
        );
        let path = write(
            dir.path(),
            "bench.yaml",
            r#"
import:
  - common.yaml
variables:
  threads: 8
templates:
  build: make local -j {threads}
"#,
        );
        let runbook = Runbook::load(&path).unwrap();
        assert_eq!(runbook.variables["threads"], json!(8));
        assert_eq!(runbook.variables["shared"], json!("common"));
        assert_eq!(runbook.templates["build"].text(), "make local -j {threads}");
    }

    #[test]
    fn imported_serial_templates_keep_their_namespace() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "common.yaml",
            r#"
templates:
  sync:
    run: rsync a b
    serial: true
"#,
        );
        let path = write(dir.path(), "bench.yaml", "import:\n  - common.yaml\n");
        let runbook = Runbook::load(&path).unwrap();
        assert!(runbook.templates["sync"].semaphores.contains_key("common::sync"));
    }

    #[test]
    fn undeclared_attached_semaphore_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "bench.yaml",
            r#"
templates:
  t:
    run: "true"
    semaphores: [ghost]
"#,
        );
        let err = Runbook::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSemaphore { .. }));
    }

    #[test]
    fn malformed_template_text_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "bench.yaml", "templates:\n  t: \"echo {0}\"\n");
        let err = Runbook::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Template { .. }));
    }

    #[test]
    fn bad_filter_syntax_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "bench.yaml",
            "templates:\n  t: \"true\"\nfilters:\n  t:\n    ensure_all:\n      - \"x ==\"\n",
        );
        let err = Runbook::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Filter { .. }));
    }

    #[test]
    fn overrides_parse_yaml_scalars() {
        let mut runbook = Runbook::default();
        runbook.apply_override("threads=[1, 2]").unwrap();
        runbook.apply_override("mode=fast").unwrap();
        assert_eq!(runbook.variables["threads"], json!([1, 2]));
        assert_eq!(runbook.variables["mode"], json!("fast"));
        assert!(runbook.apply_override("nonsense").is_err());
        assert!(runbook.apply_override("=1").is_err());
    }

    #[test]
    fn import_cycles_do_not_loop() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.yaml", "import: [b.yaml]\nvariables:\n  a: 1\n");
        write(dir.path(), "b.yaml", "import: [a.yaml]\nvariables:\n  b: 2\n");
        let runbook = Runbook::load(dir.path().join("a.yaml")).unwrap();
        assert_eq!(runbook.variables["a"], json!(1));
        assert_eq!(runbook.variables["b"], json!(2));
    }
}
