use std::error::Error as StdError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::trace;
use minijinja::{Environment, Error as JinjaError, ErrorKind, UndefinedBehavior};

use crate::error::SchemaShiftError;

/// Template variables, as given on the command line or in the config file.
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Defines how change scripts are turned into SQL text.
pub trait TemplateRenderer {
    fn render(&self, script_path: &Path, variables: &Variables) -> Result<String, SchemaShiftError>;
}

/// Jinja-style renderer. `{% include %}` and `{% import %}` resolve against
/// the root folder first, then the modules folder.
pub struct JinjaRenderer {
    search_path: Vec<PathBuf>,
}

impl JinjaRenderer {
    pub fn new(root_folder: &Path, modules_folder: Option<&Path>) -> Self {
        let mut search_path = vec![root_folder.to_path_buf()];
        search_path.extend(modules_folder.map(Path::to_path_buf));
        JinjaRenderer { search_path }
    }

    fn environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        let search_path = self.search_path.clone();
        env.set_loader(move |name| load_template(&search_path, name));
        env.add_function("env_var", env_var);
        env
    }

    fn template_name(&self, script_path: &Path) -> String {
        self.search_path
            .iter()
            .find_map(|dir| script_path.strip_prefix(dir).ok())
            .unwrap_or(script_path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

impl TemplateRenderer for JinjaRenderer {
    fn render(&self, script_path: &Path, variables: &Variables) -> Result<String, SchemaShiftError> {
        let name = self.template_name(script_path);
        let render_err = |message: String| SchemaShiftError::TemplateRender {
            script: name.clone(),
            message,
        };

        let source = fs::read_to_string(script_path).map_err(|e| render_err(e.to_string()))?;
        trace!("Rendering {} ({} bytes)", name, source.len());

        let env = self.environment();
        env.render_named_str(&name, &source, minijinja::Value::from_serialize(variables))
            .map_err(|e| render_err(describe(&e)))
    }
}

fn load_template(search_path: &[PathBuf], name: &str) -> Result<Option<String>, JinjaError> {
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Ok(None);
    }
    for dir in search_path {
        let path = dir.join(name);
        match fs::read_to_string(&path) {
            Ok(source) => return Ok(Some(source)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(JinjaError::new(
                    ErrorKind::InvalidOperation,
                    format!("could not read {}", path.display()),
                )
                .with_source(e))
            }
        }
    }
    Ok(None)
}

/// `{{ env_var('NAME') }}` or `{{ env_var('NAME', 'fallback') }}`
fn env_var(name: String, default: Option<String>) -> Result<String, JinjaError> {
    match std::env::var(&name) {
        Ok(value) => Ok(value),
        Err(_) => default.ok_or_else(|| {
            JinjaError::new(
                ErrorKind::InvalidOperation,
                format!("environment variable '{}' is not set", name),
            )
        }),
    }
}

fn describe(err: &JinjaError) -> String {
    let mut message = err.to_string();
    let mut source = StdError::source(err);
    while let Some(inner) = source {
        message.push_str(&format!(": {}", inner));
        source = StdError::source(inner);
    }
    message
}
