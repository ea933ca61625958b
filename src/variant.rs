//! Kernel variants and the bound symbol table.
//!
//! A variant is one packaged build of the `next-maxsim-kernels` export
//! list. The specialized tiers ship as `cdylib` artifacts discovered on a
//! small search path and opened with `libloading`; the baseline tier is the
//! plain build of the same crate linked directly into this one, so it is
//! always present. Loading resolves the fixed export list once into a
//! [`Kernels`] value; the artifact stays mapped for the rest of the process.

use std::env;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::c_char;
use std::path::PathBuf;

use libloading::{Library, Symbol};
use serde::Serialize;

use crate::error::{Error, Result};

/// Export-table version this loader was built against.
pub const ABI_VERSION: u32 = next_maxsim_kernels::ABI_VERSION;

/// Environment variable naming a directory searched for kernel artifacts
/// before the executable's own directory.
pub const KERNEL_DIR_ENV: &str = "NEXT_MAXSIM_KERNEL_DIR";

const ARTIFACT_STEM: &str = "next_maxsim_kernels";

type MaxF32Fn = unsafe extern "C" fn(*const f32, usize) -> f32;
type ArgmaxF32Fn = unsafe extern "C" fn(*const f32, usize) -> usize;
type DotF32Fn = unsafe extern "C" fn(*const f32, *const f32, usize) -> f32;
type AbiVersionFn = unsafe extern "C" fn() -> u32;
type VariantNameFn = unsafe extern "C" fn() -> *const c_char;

/// Instruction-set tier of a kernel build, most specialized first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Avx2,
    Sve,
    Baseline,
}

impl VariantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantKind::Avx2 => "avx2",
            VariantKind::Sve => "sve",
            VariantKind::Baseline => "baseline",
        }
    }

    fn artifact_tag(&self) -> &'static str {
        match self {
            VariantKind::Avx2 => "_avx2",
            VariantKind::Sve => "_sve",
            VariantKind::Baseline => "",
        }
    }
}

impl fmt::Display for VariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatch candidate: the capability it requires (baseline requires
/// none) and the loader producing its symbol table.
pub struct Variant {
    pub kind: VariantKind,
    pub required: Option<&'static str>,
    pub loader: Box<dyn Fn() -> Result<Kernels>>,
}

/// The bound symbol namespace of exactly one variant.
///
/// Holds the resolved export list as raw function pointers; the safe
/// methods are the surface downstream scoring code calls, identical across
/// variants.
#[derive(Clone, Copy)]
pub struct Kernels {
    variant: VariantKind,
    max_f32: MaxF32Fn,
    argmax_f32: ArgmaxF32Fn,
    dot_f32: DotF32Fn,
}

impl Kernels {
    /// Which variant these kernels came from.
    pub fn variant(&self) -> VariantKind {
        self.variant
    }

    /// Maximum of a slice, `f32::NEG_INFINITY` for an empty slice.
    pub fn max(&self, xs: &[f32]) -> f32 {
        unsafe { (self.max_f32)(xs.as_ptr(), xs.len()) }
    }

    /// Index of the maximum element, `0` for an empty slice.
    pub fn argmax(&self, xs: &[f32]) -> usize {
        unsafe { (self.argmax_f32)(xs.as_ptr(), xs.len()) }
    }

    /// Dot product of two equal-length slices.
    pub fn dot(&self, a: &[f32], b: &[f32]) -> f32 {
        assert_eq!(a.len(), b.len(), "dot operands must have equal length");
        unsafe { (self.dot_f32)(a.as_ptr(), b.as_ptr(), a.len()) }
    }

    pub(crate) fn builtin(variant: VariantKind) -> Self {
        Kernels {
            variant,
            max_f32: next_maxsim_kernels::maxsim_max_f32,
            argmax_f32: next_maxsim_kernels::maxsim_argmax_f32,
            dot_f32: next_maxsim_kernels::maxsim_dot_f32,
        }
    }
}

impl fmt::Debug for Kernels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernels")
            .field("variant", &self.variant)
            .finish_non_exhaustive()
    }
}

/// Platform file name of a variant's packaged artifact, e.g.
/// `libnext_maxsim_kernels_avx2.so` on Linux.
pub fn artifact_file_name(kind: VariantKind) -> String {
    format!(
        "{}{}{}{}",
        env::consts::DLL_PREFIX,
        ARTIFACT_STEM,
        kind.artifact_tag(),
        env::consts::DLL_SUFFIX
    )
}

/// Directories searched for kernel artifacts, in order.
pub fn kernel_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(dir) = env::var(KERNEL_DIR_ENV) {
        if !dir.is_empty() {
            dirs.push(PathBuf::from(dir));
        }
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(parent) = exe.parent() {
            dirs.push(parent.to_path_buf());
        }
    }
    dirs
}

fn find_artifact(dirs: &[PathBuf], file_name: &str) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(file_name))
        .find(|path| path.exists())
}

/// Load a specialized variant's packaged artifact and resolve its export
/// list.
///
/// # Errors
///
/// Returns an error when the artifact is absent from the search path,
/// cannot be opened, is missing an export, or was built against a
/// different ABI version.
pub fn load_artifact(kind: VariantKind) -> Result<Kernels> {
    let file_name = artifact_file_name(kind);
    let dirs = kernel_search_dirs();
    let path = find_artifact(&dirs, &file_name).ok_or_else(|| {
        Error::KernelLoad(format!(
            "{file_name} not found in kernel search path ({dirs:?})"
        ))
    })?;

    let library = unsafe { Library::new(&path) }
        .map_err(|e| Error::KernelLoad(format!("{}: {e}", path.display())))?;
    let kernels = unsafe { resolve_exports(&library, kind) }?;

    // The artifact stays mapped for the rest of the process; the resolved
    // pointers outlive the handle.
    std::mem::forget(library);
    Ok(kernels)
}

/// Loader for the built-in baseline kernels.
pub fn load_builtin() -> Result<Kernels> {
    Ok(Kernels::builtin(VariantKind::Baseline))
}

unsafe fn resolve_exports(library: &Library, kind: VariantKind) -> Result<Kernels> {
    let abi_version: Symbol<AbiVersionFn> = get_export(library, b"maxsim_abi_version\0")?;
    let found = abi_version();
    if found != ABI_VERSION {
        return Err(Error::AbiMismatch {
            expected: ABI_VERSION,
            found,
        });
    }

    let variant_name: Symbol<VariantNameFn> = get_export(library, b"maxsim_variant_name\0")?;
    let reported = CStr::from_ptr(variant_name()).to_string_lossy().into_owned();
    tracing::debug!("{kind} artifact reports kernel tier `{reported}`");

    let max_f32: Symbol<MaxF32Fn> = get_export(library, b"maxsim_max_f32\0")?;
    let argmax_f32: Symbol<ArgmaxF32Fn> = get_export(library, b"maxsim_argmax_f32\0")?;
    let dot_f32: Symbol<DotF32Fn> = get_export(library, b"maxsim_dot_f32\0")?;

    Ok(Kernels {
        variant: kind,
        max_f32: *max_f32,
        argmax_f32: *argmax_f32,
        dot_f32: *dot_f32,
    })
}

fn get_export<'lib, T>(library: &'lib Library, name: &[u8]) -> Result<Symbol<'lib, T>> {
    unsafe { library.get(name) }.map_err(|_| {
        let printable = &name[..name.len().saturating_sub(1)];
        Error::Symbol(String::from_utf8_lossy(printable).into_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_file_name_per_variant() {
        let avx2 = artifact_file_name(VariantKind::Avx2);
        assert!(avx2.starts_with(env::consts::DLL_PREFIX));
        assert!(avx2.ends_with(env::consts::DLL_SUFFIX));
        assert!(avx2.contains("next_maxsim_kernels_avx2"));

        assert!(artifact_file_name(VariantKind::Sve).contains("next_maxsim_kernels_sve"));

        let baseline = artifact_file_name(VariantKind::Baseline);
        assert!(baseline.contains("next_maxsim_kernels"));
        assert!(!baseline.contains("next_maxsim_kernels_"));
    }

    #[test]
    fn test_find_artifact_checks_dirs_in_order() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let name = "libfake.so";
        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];

        assert_eq!(find_artifact(&dirs, name), None);

        std::fs::write(second.path().join(name), b"").unwrap();
        assert_eq!(find_artifact(&dirs, name), Some(second.path().join(name)));

        std::fs::write(first.path().join(name), b"").unwrap();
        assert_eq!(find_artifact(&dirs, name), Some(first.path().join(name)));
    }

    #[test]
    fn test_builtin_kernels_compute_reference_values() {
        let kernels = load_builtin().unwrap();
        assert_eq!(kernels.variant(), VariantKind::Baseline);
        assert_eq!(kernels.max(&[1.0, 3.0, 2.0]), 3.0);
        assert_eq!(kernels.max(&[]), f32::NEG_INFINITY);
        assert_eq!(kernels.argmax(&[1.0, 3.0, 2.0]), 1);
        assert_eq!(kernels.argmax(&[]), 0);
        assert_eq!(kernels.dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }

    #[test]
    #[should_panic(expected = "equal length")]
    fn test_dot_rejects_mismatched_lengths() {
        let kernels = load_builtin().unwrap();
        kernels.dot(&[1.0, 2.0], &[1.0]);
    }
}
