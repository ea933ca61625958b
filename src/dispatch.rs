//! One-time selection of the best loadable kernel variant.
//!
//! Dispatch walks an ordered variant table exactly once, most specialized
//! tier first. A variant whose required capability is absent is skipped
//! without a load attempt; a variant whose artifact fails to load is
//! logged and fallen through, never retried. The unconditional baseline
//! closes the table, so the walk either binds exactly one variant's symbol
//! table or fails fatally on the baseline itself.
//!
//! "Capability detected" and "artifact loadable" are independent: a host
//! may report a capability while the matching packaged artifact is absent
//! from the distribution. Dispatch only ever downgrades, never mixes
//! symbols from two variants.

use std::sync::OnceLock;

use serde::Serialize;

use crate::capability::{supported_instruction_sets, CapabilitySet};
use crate::error::{Error, Result};
use crate::variant::{load_artifact, load_builtin, Kernels, Variant, VariantKind};

/// Result of one variant attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOutcome {
    /// The variant's symbol table was bound.
    Loaded,
    /// Required capability absent; no load was attempted.
    CapabilityAbsent,
    /// Capability present but the artifact was missing or incompatible.
    LoadFailed { reason: String },
}

/// One row of the dispatch trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub variant: VariantKind,
    pub outcome: LoadOutcome,
}

/// Machine-readable trace of a dispatch run.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// Effective capability set the decision was made against.
    pub capabilities: CapabilitySet,
    /// Every variant considered, in table order, up to and including the
    /// one that bound.
    pub attempts: Vec<Attempt>,
    /// The variant whose symbol table is now bound.
    pub bound: VariantKind,
}

/// The production variant table: AVX2, then SVE, then the built-in
/// baseline.
pub fn default_table() -> Vec<Variant> {
    vec![
        Variant {
            kind: VariantKind::Avx2,
            required: Some("AVX2"),
            loader: Box::new(|| load_artifact(VariantKind::Avx2)),
        },
        Variant {
            kind: VariantKind::Sve,
            required: Some("SVE"),
            loader: Box::new(|| load_artifact(VariantKind::Sve)),
        },
        Variant {
            kind: VariantKind::Baseline,
            required: None,
            loader: Box::new(load_builtin),
        },
    ]
}

/// Select and load exactly one variant from `table` against `caps`.
///
/// The table is walked in order with no revisits. A failing specialized
/// variant falls through to the next row; a failing unconditional variant
/// is fatal.
///
/// # Errors
///
/// Returns [`Error::Dispatch`] when the baseline fails to load or the
/// table is exhausted without an unconditional entry.
pub fn dispatch(table: &[Variant], caps: &CapabilitySet) -> Result<(Kernels, DispatchReport)> {
    let mut attempts = Vec::with_capacity(table.len());

    for variant in table {
        if let Some(required) = variant.required {
            if !caps.contains(required) {
                tracing::debug!(
                    "skipping {} maxsim kernels: {required} not in capability set",
                    variant.kind
                );
                attempts.push(Attempt {
                    variant: variant.kind,
                    outcome: LoadOutcome::CapabilityAbsent,
                });
                continue;
            }
        }

        tracing::info!("loading {} maxsim kernels", variant.kind);
        match (variant.loader)() {
            Ok(kernels) => {
                tracing::info!("successfully loaded {} maxsim kernels", variant.kind);
                attempts.push(Attempt {
                    variant: variant.kind,
                    outcome: LoadOutcome::Loaded,
                });
                let report = DispatchReport {
                    capabilities: caps.clone(),
                    attempts,
                    bound: variant.kind,
                };
                return Ok((kernels, report));
            }
            Err(e) if variant.required.is_some() => {
                tracing::info!("could not load {} maxsim kernels: {e}", variant.kind);
                attempts.push(Attempt {
                    variant: variant.kind,
                    outcome: LoadOutcome::LoadFailed {
                        reason: e.to_string(),
                    },
                });
            }
            Err(e) => {
                // Unconditional variant: nothing left to fall back to.
                return Err(Error::Dispatch(format!(
                    "{} kernels failed to load and no fallback remains: {e}",
                    variant.kind
                )));
            }
        }
    }

    Err(Error::Dispatch(
        "variant table contains no unconditional baseline".to_string(),
    ))
}

static BOUND: OnceLock<std::result::Result<Kernels, String>> = OnceLock::new();

/// The process-wide bound kernel table.
///
/// The first call detects capabilities and dispatches over the production
/// table; the outcome, success or failure, is cached for the process
/// lifetime. Concurrent first callers race benignly: exactly one dispatch
/// runs.
pub fn kernels() -> Result<&'static Kernels> {
    let bound = BOUND.get_or_init(|| {
        let caps = supported_instruction_sets();
        tracing::debug!("effective capability set: {caps:?}");
        dispatch(&default_table(), &caps)
            .map(|(kernels, _)| kernels)
            .map_err(|e| e.to_string())
    });
    match bound {
        Ok(kernels) => Ok(kernels),
        Err(reason) => Err(Error::Dispatch(reason.clone())),
    }
}
