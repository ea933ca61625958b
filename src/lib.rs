//! Next-MaxSim: runtime CPU-capability dispatch for MaxSim scoring kernels
//!
//! The engine's scoring kernels are compiled several times with different
//! instruction-set baselines and shipped as separately packaged dynamic
//! libraries. At first use this crate detects the host CPU's capabilities,
//! honors the operator's disable list, and binds exactly one variant's
//! export table for the lifetime of the process, falling back tier by tier
//! down to the built-in baseline.
//!
//! ```no_run
//! let kernels = next_maxsim::kernels()?;
//! let score = kernels.dot(&[1.0, 2.0], &[0.5, 0.25]);
//! # Ok::<(), next_maxsim::Error>(())
//! ```

pub mod capability;
pub mod dispatch;
pub mod error;
pub mod variant;

pub use capability::{
    apply_disable_list, parse_disable_list, supported_instruction_sets, sve_supported,
    CapabilitySet, DISABLE_ENV,
};
pub use dispatch::{default_table, dispatch, kernels, Attempt, DispatchReport, LoadOutcome};
pub use error::{Error, Result};
pub use variant::{
    artifact_file_name, kernel_search_dirs, Kernels, Variant, VariantKind, ABI_VERSION,
    KERNEL_DIR_ENV,
};
