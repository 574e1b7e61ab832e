use crate::error::SchemaShiftError;

use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

static VERSIONED_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^V(?P<version>.+?)__(?P<description>.+?)\.sql$").expect("valid versioned pattern")
});
static REPEATABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^R__(?P<description>.+?)\.sql$").expect("valid repeatable pattern"));
static ALWAYS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^A__(?P<description>.+?)\.sql$").expect("valid always pattern"));

const TEMPLATE_SUFFIX: &str = ".jinja";

/// Script kind, stored as the single-letter SCRIPT_TYPE in the change history table.
#[derive(AsRefStr, EnumIter, EnumString, Debug, Display, PartialEq, Eq, Copy, Clone, Hash, PartialOrd, Ord)]
pub enum ScriptKind {
    #[strum(serialize = "V")]
    Versioned,
    #[strum(serialize = "R")]
    Repeatable,
    #[strum(serialize = "A")]
    Always,
}

impl ScriptKind {
    pub fn long_name(&self) -> &'static str {
        match self {
            ScriptKind::Versioned => "Versioned",
            ScriptKind::Repeatable => "Repeatable",
            ScriptKind::Always => "Always",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    /// Lowercased file name with any `.jinja` suffix removed. Unique in a catalog.
    pub key: String,
    /// File name with any `.jinja` suffix removed, original case.
    pub display_name: String,
    pub file_path: PathBuf,
    pub kind: ScriptKind,
    pub description: String,
    /// Present only for versioned scripts
    pub version: Option<String>,
}

impl Script {
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Classify a file by its name. Returns `None` for files that are not
    /// change scripts.
    pub fn from_path(path: &Path) -> Option<Script> {
        let file_name = path.file_name()?.to_str()?;
        let display_name = strip_template_suffix(file_name);

        let (kind, version, raw_description) = if let Some(caps) = VERSIONED_PATTERN.captures(display_name) {
            (
                ScriptKind::Versioned,
                Some(caps["version"].to_owned()),
                caps["description"].to_owned(),
            )
        } else if let Some(caps) = REPEATABLE_PATTERN.captures(display_name) {
            (ScriptKind::Repeatable, None, caps["description"].to_owned())
        } else if let Some(caps) = ALWAYS_PATTERN.captures(display_name) {
            (ScriptKind::Always, None, caps["description"].to_owned())
        } else {
            return None;
        };

        Some(Script {
            key: display_name.to_lowercase(),
            display_name: display_name.to_owned(),
            file_path: path.to_path_buf(),
            kind,
            description: format_description(&raw_description),
            version,
        })
    }
}

fn strip_template_suffix(file_name: &str) -> &str {
    let split = file_name.len().saturating_sub(TEMPLATE_SUFFIX.len());
    match file_name.get(split..) {
        Some(suffix) if suffix.eq_ignore_ascii_case(TEMPLATE_SUFFIX) => &file_name[..split],
        _ => file_name,
    }
}

/// `add_users_table` -> `Add users table`
fn format_description(raw: &str) -> String {
    let spaced = raw.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// All change scripts found under a root folder, keyed by [`Script::key`].
#[derive(Debug, Default)]
pub struct ScriptCatalog {
    scripts: BTreeMap<String, Script>,
}

impl ScriptCatalog {
    /// Walk `root` and classify every file. `modules_folder`, when it lies
    /// inside `root`, is not descended into.
    pub fn scan(
        root: &Path,
        modules_folder: Option<&Path>,
        version_pattern: Option<&Regex>,
    ) -> Result<Self, SchemaShiftError> {
        if !root.is_dir() {
            return Err(SchemaShiftError::Error(format!(
                "Root folder '{}' does not exist or is not a directory",
                root.display()
            )));
        }

        let modules_folder = modules_folder.and_then(|p| fs::canonicalize(p).ok());

        let mut catalog = ScriptCatalog::default();
        let mut versions: HashMap<String, PathBuf> = HashMap::new();
        let mut q = VecDeque::new();
        q.push_back(root.to_path_buf());

        while let Some(dir) = q.pop_front() {
            let mut entries = fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
            // read_dir order is platform dependent; keep error messages stable
            entries.sort_by_key(|e| e.file_name());

            for entry in entries {
                let path = entry.path();
                let file_type = entry.file_type()?;

                if file_type.is_symlink() && path.is_dir() {
                    debug!("Not following directory symlink {}", path.display());
                    continue;
                }

                if file_type.is_dir() {
                    if let Some(modules) = &modules_folder {
                        if fs::canonicalize(&path).ok().as_ref() == Some(modules) {
                            debug!("Skipping modules folder {}", path.display());
                            continue;
                        }
                    }
                    q.push_back(path);
                    continue;
                }

                let Some(script) = Script::from_path(&path) else {
                    trace!("Ignoring non-script file {}", path.display());
                    continue;
                };

                let file_path = script.file_path.clone();
                let display_name = script.display_name.clone();
                let version = script.version.clone();
                catalog.insert(script)?;

                if let Some(version) = version {
                    if let Some(pattern) = version_pattern {
                        if !pattern.is_match(&version) {
                            return Err(SchemaShiftError::InvalidVersion {
                                script: display_name,
                                version,
                                pattern: pattern.as_str().to_owned(),
                            });
                        }
                    }
                    if let Some(first) = versions.get(&version) {
                        return Err(SchemaShiftError::DuplicateVersion {
                            version,
                            first: first.clone(),
                            second: file_path,
                        });
                    }
                    versions.insert(version, file_path);
                }
            }
        }

        debug!("Found {} change scripts under {}", catalog.len(), root.display());
        Ok(catalog)
    }

    pub fn insert(&mut self, script: Script) -> Result<(), SchemaShiftError> {
        if let Some(existing) = self.scripts.get(&script.key) {
            return Err(SchemaShiftError::DuplicateScriptName {
                name: script.key.clone(),
                first: existing.file_path.clone(),
                second: script.file_path,
            });
        }
        self.scripts.insert(script.key.clone(), script);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Script> {
        self.scripts.get(&key.to_lowercase())
    }

    /// Look a script up by file name or path, as typed by a user.
    pub fn find(&self, name: &str) -> Option<&Script> {
        let file_name = Path::new(name).file_name()?.to_str()?;
        self.get(strip_template_suffix(file_name))
    }

    pub fn scripts(&self) -> impl Iterator<Item = &Script> {
        self.scripts.values()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Compile a version validation pattern. The pattern must match a whole
/// version string, so it is anchored at both ends.
pub fn version_regex(pattern: &str) -> Result<Regex, SchemaShiftError> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}
