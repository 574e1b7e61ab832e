use std::cmp::Ordering;
use std::fmt;

use log::{debug, warn};

use crate::error::SchemaShiftError;
use crate::history::LedgerState;
use crate::scripts::{Script, ScriptCatalog, ScriptKind};
use crate::sort::{compare_natural, natural_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Versioned script already recorded as applied
    AlreadyApplied,
    /// Versioned script never applied but not newer than the max applied version
    OlderThanMaxVersion,
    /// Repeatable script whose rendered checksum matches the last successful run
    ChecksumUnchanged,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::AlreadyApplied => "already applied",
            SkipReason::OlderThanMaxVersion => "older than the max applied version",
            SkipReason::ChecksumUnchanged => "checksum unchanged",
        };
        write!(f, "{}", s)
    }
}

/// Scripts to run, in execution order, and versioned scripts filtered out by
/// history. Repeatable scripts stay in `scripts` until their rendered
/// checksum can be compared.
#[derive(Debug, Default)]
pub struct ExecutionPlan<'a> {
    pub scripts: Vec<&'a Script>,
    pub skipped: Vec<(&'a Script, SkipReason)>,
}

impl ExecutionPlan<'_> {
    pub fn skip_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

pub struct MigrationPlanner<'s> {
    state: &'s LedgerState,
    raise_on_ignored: bool,
}

impl<'s> MigrationPlanner<'s> {
    pub fn new(state: &'s LedgerState, raise_on_ignored: bool) -> Self {
        MigrationPlanner {
            state,
            raise_on_ignored,
        }
    }

    /// Order the catalog: versioned by version, then repeatable, then always,
    /// each group in natural order. Versioned scripts covered by history are
    /// moved to `skipped`.
    pub fn plan<'a>(&self, catalog: &'a ScriptCatalog) -> Result<ExecutionPlan<'a>, SchemaShiftError> {
        let mut versioned = Vec::new();
        let mut repeatable = Vec::new();
        let mut always = Vec::new();
        for script in catalog.scripts() {
            match script.kind {
                ScriptKind::Versioned => versioned.push(script),
                ScriptKind::Repeatable => repeatable.push(script),
                ScriptKind::Always => always.push(script),
            }
        }

        versioned.sort_by_cached_key(|s| (natural_key(s.version().unwrap_or_default()), natural_key(&s.key)));
        repeatable.sort_by_cached_key(|s| natural_key(&s.key));
        always.sort_by_cached_key(|s| natural_key(&s.key));

        let mut plan = ExecutionPlan::default();
        for script in versioned {
            match self.versioned_skip(script)? {
                Some(reason) => {
                    debug!("Skipping {}: {}", script.display_name, reason);
                    plan.skipped.push((script, reason));
                }
                None => plan.scripts.push(script),
            }
        }
        plan.scripts.extend(repeatable);
        plan.scripts.extend(always);

        debug!(
            "Planned {} scripts, {} skipped by version history",
            plan.scripts.len(),
            plan.skip_count()
        );
        Ok(plan)
    }

    fn versioned_skip(&self, script: &Script) -> Result<Option<SkipReason>, SchemaShiftError> {
        if self.state.applied_versions.contains_key(&script.key) {
            return Ok(Some(SkipReason::AlreadyApplied));
        }

        let (Some(version), Some(max_version)) = (script.version(), self.state.max_version.as_deref()) else {
            return Ok(None);
        };
        if compare_natural(version, max_version) == Ordering::Greater {
            return Ok(None);
        }

        if self.raise_on_ignored {
            return Err(SchemaShiftError::IgnoredVersionedScript {
                script: script.display_name.clone(),
                version: version.to_owned(),
                max_version: max_version.to_owned(),
            });
        }
        warn!(
            "Versioned script {} (version {}) is older than max applied version {} and will not be applied",
            script.display_name, version, max_version
        );
        Ok(Some(SkipReason::OlderThanMaxVersion))
    }

    /// Decision for a planned script once its rendered checksum is known.
    pub fn decide(&self, script: &Script, checksum: &str) -> Option<SkipReason> {
        match script.kind {
            ScriptKind::Repeatable => self
                .state
                .repeatable_checksums
                .get(&script.key)
                .filter(|previous| previous.as_str() == checksum)
                .map(|_| SkipReason::ChecksumUnchanged),
            ScriptKind::Versioned | ScriptKind::Always => None,
        }
    }
}
